use crate::object::{GcRef, ObjString};
use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<GcRef<ObjString>>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: None,
            value: Value::Nil,
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

/// Open-addressed hash table with linear probing. Used for the
/// interned-string table, the VM's globals, every class's method table and
/// every instance's field table.
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Walk the probe sequence for `key`, stopping at the first empty slot
    /// (or a matching key). Returns the index to read/overwrite.
    fn find_slot(entries: &[Entry], capacity: usize, key: GcRef<ObjString>) -> usize {
        let mut index = (key.as_ref().hash as usize) & (capacity - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None if !entry.is_tombstone() => {
                    return first_tombstone.unwrap_or(index);
                }
                None => {
                    // tombstone
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Some(k) if k.same_object(&key) => return index,
                Some(_) => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut new_count = 0;
        for entry in self.entries.iter() {
            if let Some(key) = entry.key {
                let index = Self::find_slot(&new_entries, new_capacity, key);
                new_entries[index] = *entry;
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    pub fn get(&self, key: GcRef<ObjString>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_slot(&self.entries, self.capacity(), key);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    /// Returns `true` if this inserted a brand new key (`OP_SET_GLOBAL`
    /// relies on this to detect assignment to an undefined global).
    pub fn set(&mut self, key: GcRef<ObjString>, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR {
            let new_capacity = if self.capacity() == 0 {
                8
            } else {
                self.capacity() * 2
            };
            self.grow(new_capacity);
        }

        let index = Self::find_slot(&self.entries, self.capacity(), key);
        let is_new_key = self.entries[index].key.is_none();
        if is_new_key && !self.entries[index].is_tombstone() {
            self.count += 1;
        }
        self.entries[index] = Entry {
            key: Some(key),
            value,
        };
        is_new_key
    }

    pub fn delete(&mut self, key: GcRef<ObjString>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_slot(&self.entries, self.capacity(), key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry {
            key: None,
            value: Value::Bool(true),
        };
        true
    }

    /// Find the canonical interned string with this exact content, without
    /// having an `ObjString` allocated for it yet.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<GcRef<ObjString>> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(key) => {
                    let s = key.as_ref();
                    if s.hash == hash && s.chars.as_ref() == chars {
                        return Some(key);
                    }
                }
                None => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (GcRef<ObjString>, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Delete every entry whose key is unmarked. The
    /// intern table is a weak map and must be pruned before sweep frees the
    /// strings it points at).
    pub fn remove_unmarked_keys(&mut self) {
        for entry in self.entries.iter_mut() {
            if let Some(key) = entry.key {
                if !key.header().is_marked {
                    *entry = Entry {
                        key: None,
                        value: Value::Bool(true),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Gc;

    #[test]
    fn load_factor_never_exceeds_three_quarters() {
        let mut gc = Gc::new();
        let mut table = Table::new();
        for i in 0..100 {
            let s = gc.intern(&format!("key{i}"));
            table.set(s, Value::Number(i as f64));
            assert!(table.len() as f64 <= 0.75 * table.capacity().max(1) as f64);
        }
    }

    #[test]
    fn capacity_is_always_zero_or_a_power_of_two() {
        let mut gc = Gc::new();
        let mut table = Table::new();
        for i in 0..50 {
            let s = gc.intern(&format!("key{i}"));
            table.set(s, Value::Nil);
            let cap = table.capacity();
            assert!(cap == 0 || cap.is_power_of_two());
        }
    }

    #[test]
    fn delete_then_set_reuses_tombstone_slot() {
        let mut gc = Gc::new();
        let mut table = Table::new();
        let a = gc.intern("a");
        let b = gc.intern("b");
        table.set(a, Value::Number(1.0));
        table.delete(a);
        assert!(table.set(b, Value::Number(2.0)));
        assert_eq!(table.get(b), Some(Value::Number(2.0)));
    }
}
