// indexer.rs - Equality-keyed multimaps used to find join partners
use crate::error::{BavetError, Result};
use crate::index_properties::IndexProperties;
use crate::tuple::TupleId;
use rustc_hash::FxHashMap as HashMap;
use std::collections::hash_map::Entry;

/// Multimap from index properties to tuples, each with a node-specific payload.
#[derive(Debug)]
pub enum Indexer<V> {
    /// No joiner columns: every tuple matches.
    None(NoneIndexer<V>),
    Equals(EqualsIndexer<V>),
}

impl<V> Indexer<V> {
    /// Picks the indexer for a side with `column_count` equal-joiner columns.
    pub fn new(column_count: usize) -> Self {
        if column_count == 0 {
            Indexer::None(NoneIndexer::default())
        } else {
            Indexer::Equals(EqualsIndexer::default())
        }
    }

    /// Fails if `tuple` is already indexed.
    #[inline]
    pub fn put(&mut self, properties: IndexProperties, tuple: TupleId, value: V) -> Result<()> {
        match self {
            Indexer::None(indexer) => indexer.put(&properties, tuple, value),
            Indexer::Equals(indexer) => indexer.put(properties, tuple, value),
        }
    }

    /// Removes `tuple` and returns its payload; fails if it is not indexed under `properties`.
    #[inline]
    pub fn remove(&mut self, properties: &IndexProperties, tuple: TupleId) -> Result<V> {
        match self {
            Indexer::None(indexer) => indexer.remove(properties, tuple),
            Indexer::Equals(indexer) => indexer.remove(properties, tuple),
        }
    }

    #[inline]
    pub fn get_mut(&mut self, properties: &IndexProperties, tuple: TupleId) -> Option<&mut V> {
        match self {
            Indexer::None(indexer) => indexer.entries.get_mut(&tuple),
            Indexer::Equals(indexer) => indexer
                .map
                .get_mut(properties)
                .and_then(|bucket| bucket.get_mut(&tuple)),
        }
    }

    /// Calls `visitor` for every tuple matching `properties`.
    #[inline]
    pub fn visit(&self, properties: &IndexProperties, mut visitor: impl FnMut(TupleId, &V)) {
        match self {
            Indexer::None(indexer) => indexer
                .entries
                .iter()
                .for_each(|(&tuple, value)| visitor(tuple, value)),
            Indexer::Equals(indexer) => {
                if let Some(bucket) = indexer.map.get(properties) {
                    bucket.iter().for_each(|(&tuple, value)| visitor(tuple, value));
                }
            }
        }
    }

    /// Number of tuples matching `properties`.
    #[inline]
    pub fn count(&self, properties: &IndexProperties) -> usize {
        match self {
            Indexer::None(indexer) => indexer.entries.len(),
            Indexer::Equals(indexer) => indexer.map.get(properties).map_or(0, |bucket| bucket.len()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Indexer::None(indexer) => indexer.entries.len(),
            Indexer::Equals(indexer) => indexer.size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct NoneIndexer<V> {
    entries: HashMap<TupleId, V>,
}

impl<V> Default for NoneIndexer<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::default(),
        }
    }
}

impl<V> NoneIndexer<V> {
    fn put(&mut self, properties: &IndexProperties, tuple: TupleId, value: V) -> Result<()> {
        match self.entries.entry(tuple) {
            Entry::Occupied(_) => Err(BavetError::DuplicateIndexEntry {
                tuple,
                key: properties.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    fn remove(&mut self, properties: &IndexProperties, tuple: TupleId) -> Result<V> {
        self.entries
            .remove(&tuple)
            .ok_or_else(|| BavetError::MissingIndexEntry {
                tuple,
                key: properties.to_string(),
            })
    }
}

#[derive(Debug)]
pub struct EqualsIndexer<V> {
    map: HashMap<IndexProperties, HashMap<TupleId, V>>,
    size: usize,
}

impl<V> Default for EqualsIndexer<V> {
    fn default() -> Self {
        Self {
            map: HashMap::default(),
            size: 0,
        }
    }
}

impl<V> EqualsIndexer<V> {
    fn put(&mut self, properties: IndexProperties, tuple: TupleId, value: V) -> Result<()> {
        match self.map.entry(properties) {
            Entry::Occupied(mut bucket) => {
                if bucket.get().contains_key(&tuple) {
                    return Err(BavetError::DuplicateIndexEntry {
                        tuple,
                        key: bucket.key().to_string(),
                    });
                }
                bucket.get_mut().insert(tuple, value);
            }
            Entry::Vacant(bucket) => {
                let mut tuples = HashMap::default();
                tuples.insert(tuple, value);
                bucket.insert(tuples);
            }
        }
        self.size += 1;
        Ok(())
    }

    fn remove(&mut self, properties: &IndexProperties, tuple: TupleId) -> Result<V> {
        let missing = || BavetError::MissingIndexEntry {
            tuple,
            key: properties.to_string(),
        };
        let bucket = self.map.get_mut(properties).ok_or_else(missing)?;
        let value = bucket.remove(&tuple).ok_or_else(missing)?;
        if bucket.is_empty() {
            self.map.remove(properties);
        }
        self.size -= 1;
        Ok(value)
    }

    /// Number of distinct keys currently indexed.
    pub fn key_count(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_properties::IndexKey;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<TupleId> {
        let mut map: SlotMap<TupleId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    fn key(value: i64) -> IndexProperties {
        IndexProperties::Single(IndexKey::Int(value))
    }

    // --- EqualsIndexer Tests ---

    #[test]
    fn test_put_visit_remove() {
        let t = ids(3);
        let mut indexer: Indexer<&str> = Indexer::new(1);
        indexer.put(key(1), t[0], "a").unwrap();
        indexer.put(key(1), t[1], "b").unwrap();
        indexer.put(key(2), t[2], "c").unwrap();

        let mut seen = Vec::new();
        indexer.visit(&key(1), |tuple, value| seen.push((tuple, *value)));
        seen.sort_by_key(|(_, value)| *value);
        assert_eq!(seen, vec![(t[0], "a"), (t[1], "b")]);
        assert_eq!(indexer.count(&key(1)), 2);
        assert_eq!(indexer.count(&key(3)), 0);
        assert_eq!(indexer.len(), 3);

        *indexer.get_mut(&key(2), t[2]).unwrap() = "z";
        assert_eq!(indexer.remove(&key(2), t[2]).unwrap(), "z");
        assert_eq!(indexer.count(&key(2)), 0);
        if let Indexer::Equals(inner) = &indexer {
            assert_eq!(inner.key_count(), 1, "empty buckets are dropped");
        }
    }

    #[test]
    fn test_duplicate_and_missing() {
        let t = ids(1);
        let mut indexer: Indexer<()> = Indexer::new(2);
        indexer.put(key(1), t[0], ()).unwrap();
        assert!(matches!(
            indexer.put(key(1), t[0], ()),
            Err(BavetError::DuplicateIndexEntry { .. })
        ));
        assert!(matches!(
            indexer.remove(&key(2), t[0]),
            Err(BavetError::MissingIndexEntry { .. })
        ));
        indexer.remove(&key(1), t[0]).unwrap();
        assert!(indexer.is_empty());
    }

    // --- NoneIndexer Tests ---

    #[test]
    fn test_none_indexer_matches_everything() {
        let t = ids(2);
        let mut indexer: Indexer<u8> = Indexer::new(0);
        assert!(matches!(indexer, Indexer::None(_)));
        indexer.put(IndexProperties::None, t[0], 1).unwrap();
        indexer.put(IndexProperties::None, t[1], 2).unwrap();

        let mut total = 0;
        indexer.visit(&IndexProperties::None, |_, value| total += value);
        assert_eq!(total, 3);
        assert_eq!(indexer.count(&IndexProperties::None), 2);
        assert_eq!(indexer.remove(&IndexProperties::None, t[1]).unwrap(), 2);
        assert_eq!(indexer.len(), 1);
    }
}
