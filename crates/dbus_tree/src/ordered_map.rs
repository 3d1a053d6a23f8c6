use std::collections::{HashMap, HashSet};

/// A map that iterates in an explicitly maintained order.
///
/// Newly inserted keys are appended to the order, and the whole order can be replaced at once with
/// [`OrderedMap::set_order`].
#[derive(Debug, Clone)]
pub struct OrderedMap<K, V> {
    data: HashMap<K, V>,
    order: Vec<K>,
}

impl<K, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        OrderedMap { data: HashMap::new(), order: Vec::new() }
    }
}

impl<K: Clone + std::hash::Hash + Eq, V> OrderedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.data.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    /// Insert a value, returning the previous value for that key. The position of an existing key
    /// is kept.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let old = self.data.insert(key.clone(), value);
        if old.is_none() {
            self.order.push(key);
        }
        old
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.data.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    /// Replace the iteration order with `order`, skipping keys that aren't in the map and
    /// duplicates. Keys present in the map but not mentioned in `order` keep their relative order
    /// and are moved to the end.
    pub fn set_order<'a>(&mut self, order: impl IntoIterator<Item = &'a K>)
    where
        K: 'a,
    {
        let mut placed = HashSet::with_capacity(self.data.len());
        let mut new_order = Vec::with_capacity(self.data.len());
        for key in order {
            if self.data.contains_key(key) && placed.insert(key) {
                new_order.push(key.clone());
            }
        }
        new_order.extend(self.order.drain(..).filter(|key| !placed.contains(key)));
        self.order = new_order;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.order.iter().filter_map(|k| self.data.get(k))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order.iter().filter_map(|k| self.data.get(k).map(|v| (k, v)))
    }

    /// Remove all entries, returning the values in iteration order.
    pub fn drain(&mut self) -> Vec<V> {
        let mut data = std::mem::take(&mut self.data);
        self.order.drain(..).filter_map(|k| data.remove(&k)).collect()
    }
}
