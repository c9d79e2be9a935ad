use super::value::Value;

const INIT_SIZE: usize = 8;
const LOAD_FACTOR_MAX: f32 = 0.9;

#[derive(Debug, Clone)]
enum Entry {
    Free,
    Used { key: Value, hash: u32, value: Value },
    Tombstone,
}

/// An open-addressing hash map keyed by `Value`, with linear probing,
/// power-of-two capacity and tombstone deletion. Key hashes are supplied by
/// the caller (see `Heap::value_hash`) and cached per entry, so probing
/// never has to reach back into the heap.
#[derive(Debug)]
pub struct Table {
    entries: Vec<Entry>,
    /// Non-free entries, tombstones included; kept below `LOAD_FACTOR_MAX`
    /// of the capacity so probe loops always terminate.
    used: usize,
}

/// Key equality inside the table. Interned strings make object identity
/// coincide with content equality, so no heap access is needed.
fn keys_equal(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Object(a), Value::Object(b)) => a == b,
        _ => false,
    }
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            used: 0,
        }
    }

    /// Live entries, tombstones excluded.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, Entry::Used { .. }))
            .count()
    }

    // Returns the index of the entry for `key`: its slot when present,
    // otherwise the first reusable slot on its probe path.
    fn find(entries: &[Entry], key: Value, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut idx = hash as usize & mask;
        let mut tombstone = None;
        loop {
            match &entries[idx] {
                Entry::Free => return tombstone.unwrap_or(idx),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                Entry::Used {
                    key: k, hash: h, ..
                } => {
                    if *h == hash && keys_equal(*k, key) {
                        return idx;
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_size = if self.entries.is_empty() {
            INIT_SIZE
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::Free; new_size]);
        self.used = 0;
        for entry in old {
            if let Entry::Used { key, hash, value } = entry {
                let idx = Self::find(&self.entries, key, hash);
                self.entries[idx] = Entry::Used { key, hash, value };
                self.used += 1;
            }
        }
    }

    /// Inserts or overwrites. Returns `true` when the key was not present.
    pub fn set(&mut self, key: Value, hash: u32, value: Value) -> bool {
        if (self.used + 1) as f32 > self.entries.len() as f32 * LOAD_FACTOR_MAX {
            self.grow();
        }
        let idx = Self::find(&self.entries, key, hash);
        match &self.entries[idx] {
            Entry::Free => {
                self.used += 1;
                self.entries[idx] = Entry::Used { key, hash, value };
                true
            }
            Entry::Tombstone => {
                self.entries[idx] = Entry::Used { key, hash, value };
                true
            }
            Entry::Used { .. } => {
                self.entries[idx] = Entry::Used { key, hash, value };
                false
            }
        }
    }

    pub fn get(&self, key: Value, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        match &self.entries[Self::find(&self.entries, key, hash)] {
            Entry::Used { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn delete(&mut self, key: Value, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Self::find(&self.entries, key, hash);
        match &self.entries[idx] {
            Entry::Used { .. } => {
                self.entries[idx] = Entry::Tombstone;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Used { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Probes for a key by hash with caller-supplied equality; used by the
    /// string interner to look up content that is not an object yet.
    pub fn find_key(&self, hash: u32, mut eq: impl FnMut(Value) -> bool) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match &self.entries[idx] {
                Entry::Free => return None,
                Entry::Tombstone => {}
                Entry::Used { key, hash: h, .. } => {
                    if *h == hash && eq(*key) {
                        return Some(*key);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Drops every entry whose key fails the predicate; the weak side of the
    /// string interner, run before each sweep.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(Value) -> bool) {
        for entry in &mut self.entries {
            if let Entry::Used { key, .. } = entry {
                if !keep(*key) {
                    *entry = Entry::Tombstone;
                }
            }
        }
    }
}
