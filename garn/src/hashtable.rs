use std::{
    cell::RefCell,
    hash::{BuildHasher, Hash, Hasher},
    mem,
    sync::Arc,
};

use ahash::RandomState;
use parking_lot::{Mutex, MutexGuard};

use crate::{
    entry::{from_entry, read_entry, to_entry},
    Entry, MarshalError, Value,
};

/// Table key. Integer and string keys hash into disjoint namespaces,
/// so `Int(1)` and `Str("1")` are always distinct slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapKey {
    Int(i64),
    Str(String),
}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            MapKey::Int(n) => {
                state.write_u8(0);
                state.write_i64(*n);
            }
            MapKey::Str(s) => {
                state.write_u8(1);
                state.write(s.as_bytes());
            }
        }
    }
}

impl From<i64> for MapKey {
    fn from(n: i64) -> Self {
        MapKey::Int(n)
    }
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        MapKey::Str(s.to_owned())
    }
}

#[derive(Debug, Clone)]
struct Slot {
    hash: u64,
    /// Probe sequence length: distance from the slot the hash maps to.
    psl: u32,
    key: MapKey,
    entry: Entry,
}

const INITIAL_CAPACITY: usize = 8;

/// Open-addressed Robin Hood table. Inserts displace richer residents,
/// lookups terminate once the probe distance exceeds the resident's,
/// and deletion backward-shifts the cluster instead of leaving
/// tombstones, so probe distances never degrade under churn.
#[derive(Debug)]
pub(crate) struct TableState {
    slots: Vec<Option<Slot>>,
    used: usize,
    vn: u64,
    hasher: RandomState,
}

impl Default for TableState {
    fn default() -> Self {
        Self {
            slots: (0..INITIAL_CAPACITY).map(|_| None).collect(),
            used: 0,
            vn: 0,
            hasher: RandomState::new(),
        }
    }
}

impl TableState {
    fn hash_of(&self, key: &MapKey) -> u64 {
        self.hasher.hash_one(key)
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn find(&self, hash: u64, key: &MapKey) -> Option<usize> {
        let mask = self.mask();
        let mut idx = hash as usize & mask;
        let mut dist = 0u32;
        loop {
            match &self.slots[idx] {
                None => return None,
                Some(slot) => {
                    if dist > slot.psl {
                        return None;
                    }
                    if slot.hash == hash && slot.key == *key {
                        return Some(idx);
                    }
                }
            }
            dist += 1;
            idx = (idx + 1) & mask;
        }
    }

    fn raw_insert(&mut self, mut slot: Slot) {
        let mask = self.mask();
        let mut idx = slot.hash as usize & mask;
        loop {
            match &mut self.slots[idx] {
                vacant @ None => {
                    *vacant = Some(slot);
                    return;
                }
                Some(resident) => {
                    if slot.psl > resident.psl {
                        mem::swap(resident, &mut slot);
                    }
                }
            }
            slot.psl += 1;
            idx = (idx + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let doubled = self.slots.len() * 2;
        let old = mem::replace(&mut self.slots, (0..doubled).map(|_| None).collect());
        for slot in old.into_iter().flatten() {
            self.raw_insert(Slot { psl: 0, ..slot });
        }
    }

    fn insert(&mut self, key: MapKey, entry: Entry) {
        let hash = self.hash_of(&key);
        if let Some(idx) = self.find(hash, &key) {
            // Update in place. The displaced entry drops here.
            if let Some(slot) = &mut self.slots[idx] {
                slot.entry = entry;
            }
            self.vn += 1;
            return;
        }
        // Grow at 3/4 occupancy.
        if self.used + 1 > self.slots.len() - (self.slots.len() >> 2) {
            self.grow();
        }
        self.raw_insert(Slot {
            hash,
            psl: 0,
            key,
            entry,
        });
        self.used += 1;
        self.vn += 1;
    }

    fn get(&self, key: &MapKey) -> Option<Entry> {
        let hash = self.hash_of(key);
        self.find(hash, key)
            .and_then(|idx| self.slots[idx].as_ref())
            .map(|slot| slot.entry.clone())
    }

    fn remove(&mut self, key: &MapKey) -> bool {
        let hash = self.hash_of(key);
        let Some(idx) = self.find(hash, key) else {
            return false;
        };
        let mask = self.mask();
        self.slots[idx] = None;
        // Shift the rest of the cluster back one slot.
        let mut hole = idx;
        let mut next = (idx + 1) & mask;
        loop {
            match &self.slots[next] {
                Some(slot) if slot.psl > 0 => {}
                _ => break,
            }
            let mut moved = self.slots[next].take();
            if let Some(slot) = &mut moved {
                slot.psl -= 1;
            }
            self.slots[hole] = moved;
            hole = next;
            next = (next + 1) & mask;
        }
        self.used -= 1;
        self.vn += 1;
        true
    }

    fn find_key(&self, key: &MapKey) -> bool {
        self.find(self.hash_of(key), key).is_some()
    }

    fn pairs(&self) -> Vec<(MapKey, Entry)> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| (slot.key.clone(), slot.entry.clone()))
            .collect()
    }
}

/// Shared block behind every handle to one table.
#[derive(Debug, Default)]
pub struct HashTableInner {
    state: Mutex<TableState>,
}

/// Key/value table shared between interpreters.
#[derive(Debug, Clone, Default)]
pub struct HashTable {
    inner: Arc<HashTableInner>,
    view: RefCell<Option<(u64, Vec<(MapKey, Value)>)>>,
}

impl HashTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_inner(inner: Arc<HashTableInner>) -> Self {
        Self {
            inner,
            view: RefCell::new(None),
        }
    }

    pub(crate) fn share(&self) -> Arc<HashTableInner> {
        self.inner.clone()
    }

    pub fn same_block(&self, other: &HashTable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Inserts or overwrites the value at `key`.
    pub fn insert<K: Into<MapKey>>(&self, key: K, value: &Value) -> Result<(), MarshalError> {
        let entry = to_entry(value)?;
        self.inner.state.lock().insert(key.into(), entry);
        Ok(())
    }

    /// Reads the value at `key`, or `None` when absent.
    pub fn get<K: Into<MapKey>>(&self, key: K) -> Result<Option<Value>, MarshalError> {
        let entry = self.inner.state.lock().get(&key.into());
        match entry {
            Some(entry) => Ok(Some(from_entry(entry)?)),
            None => Ok(None),
        }
    }

    pub fn has<K: Into<MapKey>>(&self, key: K) -> bool {
        self.inner.state.lock().find_key(&key.into())
    }

    /// Removes the value at `key`. Returns whether a value was present.
    pub fn remove<K: Into<MapKey>>(&self, key: K) -> bool {
        self.inner.state.lock().remove(&key.into())
    }

    pub fn count(&self) -> usize {
        self.inner.state.lock().used
    }

    /// Acquires the table mutex for a compound critical section.
    pub fn lock(&self) -> TableGuard<'_> {
        TableGuard {
            state: self.inner.state.lock(),
        }
    }

    /// Unmarshaled copy of the current pairs, cached against the version
    /// counter. Iteration order is unspecified but stable between
    /// mutations.
    pub fn snapshot(&self) -> Result<Vec<(MapKey, Value)>, MarshalError> {
        let (vn, pairs) = {
            let state = self.inner.state.lock();
            if let Some((seen, values)) = self.view.borrow().as_ref() {
                if *seen == state.vn {
                    return Ok(values.clone());
                }
            }
            (state.vn, state.pairs())
        };
        let mut values = Vec::with_capacity(pairs.len());
        for (key, entry) in &pairs {
            values.push((key.clone(), read_entry(entry)?));
        }
        *self.view.borrow_mut() = Some((vn, values.clone()));
        Ok(values)
    }
}

pub struct TableGuard<'a> {
    state: MutexGuard<'a, TableState>,
}

impl TableGuard<'_> {
    pub fn insert<K: Into<MapKey>>(&mut self, key: K, value: &Value) -> Result<(), MarshalError> {
        let entry = to_entry(value)?;
        self.state.insert(key.into(), entry);
        Ok(())
    }

    pub fn get<K: Into<MapKey>>(&self, key: K) -> Result<Option<Value>, MarshalError> {
        match self.state.get(&key.into()) {
            Some(entry) => Ok(Some(from_entry(entry)?)),
            None => Ok(None),
        }
    }

    pub fn has<K: Into<MapKey>>(&self, key: K) -> bool {
        self.state.find_key(&key.into())
    }

    pub fn remove<K: Into<MapKey>>(&mut self, key: K) -> bool {
        self.state.remove(&key.into())
    }

    pub fn count(&self) -> usize {
        self.state.used
    }
}
