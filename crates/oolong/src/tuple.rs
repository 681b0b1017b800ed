use ahash::AHashMap;

use crate::{
    error::{EvalError, EvalResult},
    types::TypeTag,
    value::Value,
};

/// The universal composite: an insertion-ordered container with both
/// integer-index and string-key access. Keys are optional per element and
/// unique within one tuple.
///
/// Elements are stored as shared value handles, so a tuple copy shares its
/// elements until a deep copy detaches them.
#[derive(Debug, Clone, Default)]
pub struct Tuple {
    entries: Vec<(Option<String>, Value)>,
    lookup: AHashMap<String, usize>,
}

impl Tuple {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, n: usize) {
        self.entries.reserve(n);
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains_idx(&self, idx: usize) -> bool {
        idx < self.entries.len()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.lookup.contains_key(key)
    }

    #[must_use]
    pub fn index_of_key(&self, key: &str) -> Option<usize> {
        self.lookup.get(key).copied()
    }

    #[must_use]
    pub fn key_of_idx(&self, idx: usize) -> Option<&str> {
        self.entries.get(idx).and_then(|(k, _)| k.as_deref())
    }

    /// Appends an unkeyed element.
    pub fn append(&mut self, value: Value) {
        self.entries.push((None, value));
    }

    /// Appends a keyed element. Returns `false` when the key already exists.
    pub fn append_key_value(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if self.lookup.contains_key(&key) {
            return false;
        }
        self.lookup.insert(key.clone(), self.entries.len());
        self.entries.push((Some(key), value));
        true
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.entries.get(idx).map(|(_, v)| v)
    }

    #[must_use]
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Value> {
        self.entries.get_mut(idx).map(|(_, v)| v)
    }

    #[must_use]
    pub fn get_by_key(&self, key: &str) -> Option<&Value> {
        self.index_of_key(key).and_then(|idx| self.get(idx))
    }

    #[must_use]
    pub fn get_by_key_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.index_of_key(key).and_then(|idx| self.get_mut(idx))
    }

    /// Removes the element at `idx`, preserving order of the rest. All later
    /// indices shift down; key mappings are renumbered accordingly.
    pub fn remove_by_idx(&mut self, idx: usize) -> Option<Value> {
        if !self.contains_idx(idx) {
            return None;
        }
        let (key, value) = self.entries.remove(idx);
        if let Some(key) = key {
            self.lookup.remove(&key);
        }
        for slot in self.lookup.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        Some(value)
    }

    pub fn remove_by_key(&mut self, key: &str) -> Option<Value> {
        let idx = self.index_of_key(key)?;
        self.remove_by_idx(idx)
    }

    /// Inserts an unkeyed element at `idx`, shifting later elements up.
    /// `idx == size()` appends; `idx > size()` is out of range.
    pub fn insert(&mut self, idx: usize, value: Value) -> EvalResult<()> {
        if idx > self.entries.len() {
            return Err(EvalError::out_of_range(format!(
                "insert index {idx} is beyond tuple size {}",
                self.entries.len()
            )));
        }
        if idx == self.entries.len() {
            self.append(value);
            return Ok(());
        }
        self.entries.insert(idx, (None, value));
        for slot in self.lookup.values_mut() {
            if *slot >= idx {
                *slot += 1;
            }
        }
        Ok(())
    }

    pub fn swap_by_idx(&mut self, idx1: usize, idx2: usize) -> EvalResult<()> {
        if !self.contains_idx(idx1) || !self.contains_idx(idx2) {
            return Err(EvalError::out_of_range("swap index is beyond tuple size"));
        }
        self.entries.swap(idx1, idx2);
        for (i, (key, _)) in self.entries.iter().enumerate() {
            if let Some(key) = key {
                self.lookup.insert(key.clone(), i);
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lookup.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Option<&str>, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_deref(), v))
    }

    // --- array <-> object duality ------------------------------------------
    //
    // A tuple doubles as array (positional) and object (keyed). An *empty
    // array* is marked with a single empty-Buffer sentinel element so it stays
    // distinguishable from an empty object; the sentinel is stripped on the
    // first real append. This convention is what the JSON/TOML adapters rely
    // on for round-tripping.

    /// Whether this tuple reads as an array (first element unkeyed).
    /// Empty tuples read as objects.
    #[must_use]
    pub fn is_array(&self) -> bool {
        match self.entries.first() {
            Some((key, _)) => key.is_none(),
            None => false,
        }
    }

    /// Whether this tuple is the empty-array sentinel form.
    #[must_use]
    pub fn is_empty_array(&self) -> bool {
        if !self.is_array() || self.entries.len() != 1 {
            return false;
        }
        let (_, val) = &self.entries[0];
        val.data_tag() == TypeTag::Buffer && val.buffer_len() == Some(0)
    }

    /// Creates the canonical empty-array form.
    #[must_use]
    pub fn empty_array() -> Self {
        let mut tuple = Self::new();
        let mut sentinel = Value::buffer(Vec::new());
        sentinel.make_shared();
        tuple.append(sentinel);
        tuple
    }

    /// Appends to an array, stripping the empty-array sentinel first.
    pub fn array_append(&mut self, mut value: Value) {
        if self.is_empty_array() {
            self.clear();
        }
        value.make_shared();
        self.append(value);
    }

    /// Inserts into an array at `idx`, stripping the sentinel when the array
    /// is empty and `idx` is zero.
    pub fn array_insert(&mut self, idx: usize, mut value: Value) -> EvalResult<()> {
        if self.is_empty_array() {
            if idx != 0 {
                return Err(EvalError::out_of_range("insert index into empty array must be 0"));
            }
            self.clear();
        }
        value.make_shared();
        self.insert(idx, value)
    }

    /// Removes from an array; an array emptied by the removal becomes the
    /// sentinel form again.
    pub fn array_remove(&mut self, idx: usize) -> EvalResult<Value> {
        if !self.is_array() || self.is_empty_array() {
            return Err(EvalError::out_of_range("tuple is not a non-empty array"));
        }
        let removed = self
            .remove_by_idx(idx)
            .ok_or_else(|| EvalError::out_of_range(format!("array index {idx} is out of range")))?;
        if self.is_empty() {
            let mut sentinel = Value::buffer(Vec::new());
            sentinel.make_shared();
            self.append(sentinel);
        }
        Ok(removed)
    }
}
