use std::{cell::RefCell, sync::Arc};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    entry::{from_entry, read_entry, to_entry},
    ContainerError, Entry, MarshalError, Value,
};

#[derive(Debug, Default)]
pub(crate) struct VectorState {
    items: Vec<Entry>,
    vn: u64,
}

impl VectorState {
    /// Validates an index against the current size. `insert_at` accepts
    /// one past the end, everything else does not.
    fn index(&self, index: i64, allow_end: bool) -> Result<usize, ContainerError> {
        let size = self.items.len();
        let limit = if allow_end { size as i64 } else { size as i64 - 1 };
        if index < 0 || index > limit {
            return Err(ContainerError::OutOfBounds { index, size });
        }
        Ok(index as usize)
    }

    fn pop(&mut self) -> Result<Entry, ContainerError> {
        match self.items.pop() {
            Some(entry) => {
                self.vn += 1;
                Ok(entry)
            }
            None => Err(ContainerError::Empty),
        }
    }

    fn shift(&mut self) -> Result<Entry, ContainerError> {
        if self.items.is_empty() {
            return Err(ContainerError::Empty);
        }
        self.vn += 1;
        Ok(self.items.remove(0))
    }
}

/// Shared block behind every handle to one vector.
#[derive(Debug, Default)]
pub struct VectorInner {
    state: Mutex<VectorState>,
}

/// Growable index-addressed sequence shared between interpreters.
/// Out-of-range accesses fail without mutating anything.
#[derive(Debug, Clone, Default)]
pub struct Vector {
    inner: Arc<VectorInner>,
    view: RefCell<Option<(u64, Vec<Value>)>>,
}

impl Vector {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_inner(inner: Arc<VectorInner>) -> Self {
        Self {
            inner,
            view: RefCell::new(None),
        }
    }

    pub(crate) fn share(&self) -> Arc<VectorInner> {
        self.inner.clone()
    }

    pub fn same_block(&self, other: &Vector) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn push(&self, value: &Value) -> Result<(), MarshalError> {
        let entry = to_entry(value)?;
        let mut state = self.inner.state.lock();
        state.items.push(entry);
        state.vn += 1;
        Ok(())
    }

    pub fn pop(&self) -> Result<Value, ContainerError> {
        let entry = self.inner.state.lock().pop()?;
        Ok(from_entry(entry)?)
    }

    /// Removes and returns the first element.
    pub fn shift(&self) -> Result<Value, ContainerError> {
        let entry = self.inner.state.lock().shift()?;
        Ok(from_entry(entry)?)
    }

    /// Prepends an element.
    pub fn unshift(&self, value: &Value) -> Result<(), MarshalError> {
        let entry = to_entry(value)?;
        let mut state = self.inner.state.lock();
        state.items.insert(0, entry);
        state.vn += 1;
        Ok(())
    }

    /// Inserts at `index`, shifting the tail right. `index == size`
    /// appends.
    pub fn insert_at(&self, index: i64, value: &Value) -> Result<(), ContainerError> {
        let entry = to_entry(value)?;
        let mut state = self.inner.state.lock();
        let idx = state.index(index, true)?;
        state.items.insert(idx, entry);
        state.vn += 1;
        Ok(())
    }

    /// Overwrites the element at `index`.
    pub fn update_at(&self, index: i64, value: &Value) -> Result<(), ContainerError> {
        let entry = to_entry(value)?;
        let mut state = self.inner.state.lock();
        let idx = state.index(index, false)?;
        state.items[idx] = entry;
        state.vn += 1;
        Ok(())
    }

    /// Removes the element at `index`, shifting the tail left.
    pub fn delete_at(&self, index: i64) -> Result<(), ContainerError> {
        let mut state = self.inner.state.lock();
        let idx = state.index(index, false)?;
        state.items.remove(idx);
        state.vn += 1;
        Ok(())
    }

    /// Reads the element at `index` without removing it.
    pub fn fetch_at(&self, index: i64) -> Result<Value, ContainerError> {
        let entry = {
            let state = self.inner.state.lock();
            let idx = state.index(index, false)?;
            state.items[idx].clone()
        };
        Ok(from_entry(entry)?)
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Adjusts the vector to hold exactly `size` elements: truncates when
    /// shrinking, otherwise reserves capacity without adding elements.
    pub fn resize(&self, size: i64) -> Result<(), ContainerError> {
        if size < 0 {
            return Err(ContainerError::OutOfBounds { index: size, size: 0 });
        }
        let mut state = self.inner.state.lock();
        let target = size as usize;
        if target < state.items.len() {
            state.items.truncate(target);
            state.vn += 1;
        } else {
            let extra = target - state.items.len();
            state.items.reserve(extra);
        }
        Ok(())
    }

    /// Acquires the vector mutex for a compound critical section.
    pub fn lock(&self) -> VectorGuard<'_> {
        VectorGuard {
            state: self.inner.state.lock(),
        }
    }

    /// Unmarshaled copy of the current elements in index order, cached
    /// against the version counter.
    pub fn snapshot(&self) -> Result<Vec<Value>, MarshalError> {
        let (vn, entries) = {
            let state = self.inner.state.lock();
            if let Some((seen, values)) = self.view.borrow().as_ref() {
                if *seen == state.vn {
                    return Ok(values.clone());
                }
            }
            (state.vn, state.items.clone())
        };
        let mut values = Vec::with_capacity(entries.len());
        for entry in &entries {
            values.push(read_entry(entry)?);
        }
        *self.view.borrow_mut() = Some((vn, values.clone()));
        Ok(values)
    }
}

pub struct VectorGuard<'a> {
    state: MutexGuard<'a, VectorState>,
}

impl VectorGuard<'_> {
    pub fn push(&mut self, value: &Value) -> Result<(), MarshalError> {
        let entry = to_entry(value)?;
        self.state.items.push(entry);
        self.state.vn += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, ContainerError> {
        let entry = self.state.pop()?;
        Ok(from_entry(entry)?)
    }

    pub fn fetch_at(&self, index: i64) -> Result<Value, ContainerError> {
        let idx = self.state.index(index, false)?;
        Ok(from_entry(self.state.items[idx].clone())?)
    }

    pub fn update_at(&mut self, index: i64, value: &Value) -> Result<(), ContainerError> {
        let entry = to_entry(value)?;
        let idx = self.state.index(index, false)?;
        self.state.items[idx] = entry;
        self.state.vn += 1;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.state.items.len()
    }
}
