use std::{cell::RefCell, collections::VecDeque, sync::Arc};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    entry::{from_entry, read_entry, to_entry},
    ContainerError, Entry, MarshalError, Value,
};

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    items: VecDeque<Entry>,
    vn: u64,
}

impl QueueState {
    fn push(&mut self, value: &Value) -> Result<(), MarshalError> {
        let entry = to_entry(value)?;
        self.items.push_back(entry);
        self.vn += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Entry, ContainerError> {
        match self.items.pop_front() {
            Some(entry) => {
                self.vn += 1;
                Ok(entry)
            }
            None => Err(ContainerError::Empty),
        }
    }

    fn front(&self) -> Result<Entry, ContainerError> {
        self.items.front().cloned().ok_or(ContainerError::Empty)
    }
}

/// Shared block behind every handle to one queue. Freed when the last
/// `Arc` (handle or in-flight entry) drops.
#[derive(Debug, Default)]
pub struct QueueInner {
    state: Mutex<QueueState>,
}

/// FIFO queue shared between interpreters. Cloning the handle is cheap
/// and refcounts the same block; elements are marshaled on the way in
/// and unmarshaled on the way out.
#[derive(Debug, Clone, Default)]
pub struct Queue {
    inner: Arc<QueueInner>,
    view: RefCell<Option<(u64, Vec<Value>)>>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_inner(inner: Arc<QueueInner>) -> Self {
        Self {
            inner,
            view: RefCell::new(None),
        }
    }

    pub(crate) fn share(&self) -> Arc<QueueInner> {
        self.inner.clone()
    }

    pub fn same_block(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn push(&self, value: &Value) -> Result<(), MarshalError> {
        self.inner.state.lock().push(value)
    }

    /// Removes and returns the oldest element. Popping an empty queue is
    /// an error, never a sentinel value.
    pub fn pop(&self) -> Result<Value, ContainerError> {
        let entry = self.inner.state.lock().pop()?;
        Ok(from_entry(entry)?)
    }

    /// Returns the oldest element without removing it.
    pub fn front(&self) -> Result<Value, ContainerError> {
        let entry = self.inner.state.lock().front()?;
        Ok(from_entry(entry)?)
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    /// Acquires the queue mutex for a compound critical section. All
    /// operations run through the returned guard until it drops; the
    /// lock cannot be released twice or leaked across statements.
    pub fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            state: self.inner.state.lock(),
        }
    }

    /// Unmarshaled copy of the current elements, oldest first. The copy
    /// is cached against the queue's version counter, so repeated calls
    /// without intervening mutations do no serialization work.
    pub fn snapshot(&self) -> Result<Vec<Value>, MarshalError> {
        let (vn, entries) = {
            let state = self.inner.state.lock();
            if let Some((seen, values)) = self.view.borrow().as_ref() {
                if *seen == state.vn {
                    return Ok(values.clone());
                }
            }
            (state.vn, state.items.iter().cloned().collect::<Vec<_>>())
        };
        let mut values = Vec::with_capacity(entries.len());
        for entry in &entries {
            values.push(read_entry(entry)?);
        }
        *self.view.borrow_mut() = Some((vn, values.clone()));
        Ok(values)
    }
}

pub struct QueueGuard<'a> {
    state: MutexGuard<'a, QueueState>,
}

impl QueueGuard<'_> {
    pub fn push(&mut self, value: &Value) -> Result<(), MarshalError> {
        self.state.push(value)
    }

    pub fn pop(&mut self) -> Result<Value, ContainerError> {
        let entry = self.state.pop()?;
        Ok(from_entry(entry)?)
    }

    pub fn front(&self) -> Result<Value, ContainerError> {
        let entry = self.state.front()?;
        Ok(from_entry(entry)?)
    }

    pub fn size(&self) -> usize {
        self.state.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_insertion_order() {
        let q = Queue::new();
        for n in 0..5 {
            q.push(&Value::Int(n)).unwrap();
        }
        for n in 0..5 {
            assert_eq!(q.pop().unwrap(), Value::Int(n));
        }
    }

    #[test]
    fn empty_reads_are_errors() {
        let q = Queue::new();
        assert_eq!(q.pop(), Err(ContainerError::Empty));
        assert_eq!(q.front(), Err(ContainerError::Empty));
    }

    #[test]
    fn front_does_not_consume() {
        let q = Queue::new();
        q.push(&Value::str("a")).unwrap();
        assert_eq!(q.front().unwrap(), Value::str("a"));
        assert_eq!(q.size(), 1);
        assert_eq!(q.pop().unwrap(), Value::str("a"));
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn guard_makes_check_then_act_atomic() {
        let q = Queue::new();
        q.push(&Value::Int(1)).unwrap();
        let mut guard = q.lock();
        if guard.size() > 0 {
            assert_eq!(guard.pop().unwrap(), Value::Int(1));
        }
        guard.push(&Value::Int(2)).unwrap();
        drop(guard);
        assert_eq!(q.pop().unwrap(), Value::Int(2));
    }

    #[test]
    fn snapshot_caches_until_mutation() {
        let q = Queue::new();
        q.push(&Value::Int(1)).unwrap();
        q.push(&Value::Int(2)).unwrap();
        let first = q.snapshot().unwrap();
        assert_eq!(first, vec![Value::Int(1), Value::Int(2)]);
        // No mutation in between: second call serves the cached copy.
        assert_eq!(q.snapshot().unwrap(), first);
        q.pop().unwrap();
        assert_eq!(q.snapshot().unwrap(), vec![Value::Int(2)]);
    }

    #[test]
    fn handles_share_one_block() {
        let q = Queue::new();
        let q2 = q.clone();
        q.push(&Value::Int(9)).unwrap();
        assert_eq!(q2.pop().unwrap(), Value::Int(9));
        assert!(q.same_block(&q2));
        assert_eq!(q.refcount(), 2);
        drop(q2);
        assert_eq!(q.refcount(), 1);
    }

    #[test]
    fn block_is_freed_with_the_last_reference() {
        let q = Queue::new();
        let weak = Arc::downgrade(&q.share());
        let q2 = q.clone();
        drop(q);
        assert!(weak.upgrade().is_some());
        drop(q2);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn crosses_threads_through_entries() {
        let q = Queue::new();
        let shared = q.share();
        let producer = std::thread::spawn(move || {
            let q = Queue::from_inner(shared);
            for n in 0..100 {
                q.push(&Value::Int(n)).unwrap();
            }
        });
        producer.join().unwrap();
        assert_eq!(q.size(), 100);
        assert_eq!(q.pop().unwrap(), Value::Int(0));
    }
}
