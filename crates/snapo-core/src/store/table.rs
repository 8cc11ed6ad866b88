use std::collections::HashMap;
use std::hash::Hash;

/// Map that remembers insertion order for snapshots
#[derive(Debug)]
pub(crate) struct OrderedTable<K, V> {
    entries: HashMap<K, V>,
    order: Vec<K>,
}

impl<K, V> OrderedTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Existing entry for `key`, or a new one built by `create`
    pub(crate) fn upsert_with(&mut self, key: K, create: impl FnOnce() -> V) -> &mut V {
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.entry(key).or_insert_with(create)
    }

    /// Keep entries matching `keep`; returns how many were removed
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, v| keep(k, v));
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
        before - self.entries.len()
    }

    /// Values in insertion order
    pub(crate) fn snapshot(&self) -> Vec<V> {
        self.order
            .iter()
            .filter_map(|k| self.entries.get(k))
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
