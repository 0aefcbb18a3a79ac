//! Secondary indices over cache entries: an inverse map from extracted value
//! to the keys holding it, plus a forward map used to unwind stale mappings
//! without re-extracting. A conditional index additionally filters entries
//! and marks itself partial whenever something was left out, which disables
//! it for query planning.

use crate::cache::filter::Filter;
use crate::cache::extractor::Extractor;
use crate::cache::Comparator;
use crate::value::Value;
use hashbrown::HashMap;
use indexmap::IndexSet;

pub struct CacheIndex {
    extractor: Extractor,
    filter: Option<Filter>,
    ordered: bool,
    comparator: Option<Comparator>,
    inverse: HashMap<Value, IndexSet<Value>>,
    forward: HashMap<Value, Value>,
    partial: bool,
}

impl CacheIndex {
    pub fn new(extractor: Extractor, ordered: bool, comparator: Option<Comparator>) -> CacheIndex {
        CacheIndex {
            extractor,
            filter: None,
            ordered,
            comparator,
            inverse: HashMap::new(),
            forward: HashMap::new(),
            partial: false,
        }
    }

    pub fn conditional(extractor: Extractor, filter: Filter, ordered: bool) -> CacheIndex {
        CacheIndex {
            extractor,
            filter: Some(filter),
            ordered,
            comparator: None,
            inverse: HashMap::new(),
            forward: HashMap::new(),
            partial: false,
        }
    }

    #[inline]
    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    #[inline]
    pub fn is_conditional(&self) -> bool {
        self.filter.is_some()
    }

    #[inline]
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    #[inline]
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Keys currently mapped to `value`.
    pub fn keys_equal(&self, value: &Value) -> Option<&IndexSet<Value>> {
        self.inverse.get(value)
    }

    /// Distinct indexed values in comparator (or natural) order. Only
    /// meaningful for an ordered index.
    pub fn ordered_values(&self) -> Vec<Value> {
        let mut values: Vec<Value> = self.inverse.keys().cloned().collect();
        match &self.comparator {
            Some(comparator) => values.sort_by(|a, b| comparator.compare(a, b)),
            None => values.sort_by(Value::cmp_order),
        }
        values
    }

    pub(crate) fn insert(&mut self, key: &Value, value: &Value) {
        if let Some(filter) = &self.filter {
            match filter.evaluate(key, value) {
                Ok(true) => (),
                Ok(false) => {
                    self.partial = true;
                    return;
                }
                Err(_) => {
                    self.partial = true;
                    return;
                }
            }
        }

        match self.extractor.extract(key, value) {
            Ok(extracted) => {
                self.inverse.entry(extracted.clone()).or_default().insert(key.clone());
                self.forward.insert(key.clone(), extracted);
            }
            Err(_) => {
                self.partial = true;
            }
        }
    }

    /// Re-points the mappings for an updated entry. A conditional index that
    /// now rejects the entry silently drops it.
    pub(crate) fn update(&mut self, key: &Value, value: &Value) {
        self.unmap(key);
        self.insert(key, value);
    }

    /// Drops the mappings for a deleted entry. The delete is applied even
    /// when extraction fails: the forward map short-circuits the common case,
    /// and a full inverse scan backstops entries whose mapping was lost.
    pub(crate) fn delete(&mut self, key: &Value, value: &Value) {
        if self.unmap(key) {
            return;
        }

        match self.extractor.extract(key, value) {
            Ok(extracted) => {
                if let Some(keys) = self.inverse.get_mut(&extracted) {
                    keys.shift_remove(key);
                    if keys.is_empty() {
                        self.inverse.remove(&extracted);
                    }
                }
            }
            Err(_) => {
                self.inverse.retain(|_, keys| {
                    keys.shift_remove(key);
                    !keys.is_empty()
                });
            }
        }
    }

    /// Drops every mapping and the partial mark, keeping the index definition.
    pub(crate) fn clear(&mut self) {
        self.inverse.clear();
        self.forward.clear();
        self.partial = false;
    }

    /// Removes via the forward map. Returns false when the key had no mapping.
    fn unmap(&mut self, key: &Value) -> bool {
        let extracted = match self.forward.remove(key) {
            Some(extracted) => extracted,
            None => return false,
        };

        if let Some(keys) = self.inverse.get_mut(&extracted) {
            keys.shift_remove(key);
            if keys.is_empty() {
                self.inverse.remove(&extracted);
            }
        }
        true
    }

    #[cfg(test)]
    fn inverse_keys(&self, value: &Value) -> Vec<Value> {
        self.keys_equal(value)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::external;
    use crate::error::Error;
    use std::sync::Arc;

    #[test]
    fn test_inverse_tracks_mutations() {
        let mut index = CacheIndex::new(Extractor::Identity, false, None);

        index.insert(&Value::from("a"), &Value::Int(1));
        index.insert(&Value::from("b"), &Value::Int(2));
        index.insert(&Value::from("d"), &Value::Int(2));

        assert_eq!(index.inverse_keys(&Value::Int(2)), vec![Value::from("b"), Value::from("d")]);

        index.update(&Value::from("b"), &Value::Int(3));
        assert_eq!(index.inverse_keys(&Value::Int(2)), vec![Value::from("d")]);
        assert_eq!(index.inverse_keys(&Value::Int(3)), vec![Value::from("b")]);

        index.delete(&Value::from("d"), &Value::Int(2));
        assert!(index.keys_equal(&Value::Int(2)).is_none());
        assert!(!index.is_partial());
    }

    #[test]
    fn test_conditional_rejection_marks_partial() {
        let filter = Filter::value_equals(Value::Int(2));
        let mut index = CacheIndex::conditional(Extractor::Identity, filter, false);

        index.insert(&Value::from("b"), &Value::Int(2));
        assert!(!index.is_partial());

        index.insert(&Value::from("a"), &Value::Int(1));
        assert!(index.is_partial());
        assert!(index.keys_equal(&Value::Int(1)).is_none());
        assert_eq!(index.inverse_keys(&Value::Int(2)), vec![Value::from("b")]);
    }

    #[test]
    fn test_conditional_update_silently_unindexes() {
        let filter = Filter::value_equals(Value::Int(2));
        let mut index = CacheIndex::conditional(Extractor::Identity, filter, false);

        index.insert(&Value::from("b"), &Value::Int(2));
        index.update(&Value::from("b"), &Value::Int(5));

        assert!(index.keys_equal(&Value::Int(2)).is_none());
        assert!(index.is_partial());
    }

    #[test]
    fn test_failing_extractor_marks_partial_and_delete_still_cleans() {
        external::register_extractor(
            "ints-only",
            Arc::new(|value| match value {
                Value::Int(_) => Ok(value.clone()),
                other => Err(Error::Serialization(format!("not an int: {}", other))),
            }),
        );
        let extractor = Extractor::external("ints-only").unwrap();
        let mut index = CacheIndex::new(extractor.clone(), false, None);

        index.insert(&Value::from("good"), &Value::Int(1));
        index.insert(&Value::from("bad"), &Value::from("oops"));
        assert!(index.is_partial());

        // Deleting the entry that never indexed is harmless even though
        // extraction throws again.
        index.delete(&Value::from("bad"), &Value::from("oops"));
        assert_eq!(index.inverse_keys(&Value::Int(1)), vec![Value::from("good")]);

        index.delete(&Value::from("good"), &Value::Int(1));
        assert!(index.keys_equal(&Value::Int(1)).is_none());
    }

    #[test]
    fn test_ordered_values() {
        let mut index = CacheIndex::new(Extractor::Identity, true, None);
        for (key, value) in [("a", 3), ("b", 1), ("c", 2), ("d", 1)] {
            index.insert(&Value::from(key), &Value::Int(value));
        }

        assert_eq!(
            index.ordered_values(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }

    #[test]
    fn test_ordered_values_with_comparator() {
        external::register_comparator(
            "reverse",
            Arc::new(|a, b| b.cmp_order(a)),
        );

        let mut index = CacheIndex::new(
            Extractor::Identity,
            true,
            Some(Comparator::external("reverse").unwrap()),
        );
        for (key, value) in [("a", 1), ("b", 3), ("c", 2)] {
            index.insert(&Value::from(key), &Value::Int(value));
        }

        assert_eq!(
            index.ordered_values(),
            vec![Value::Int(3), Value::Int(2), Value::Int(1)]
        );
    }
}
