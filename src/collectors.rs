// collectors.rs

use crate::error::{BavetError, Result};
use crate::fact::FactRef;
use crate::index_properties::IndexKey;
use crate::joiner::KeyExtractor;
use crate::tuple::Tuple;
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

pub type ValueMapper = Rc<dyn Fn(&Tuple) -> i64>;

/// Group accumulation, as an enum of operations with explicit inverses.
///
/// `accumulate` returns an [`Undo`] value that the group node stores with
/// the input tuple and applies when that tuple is retracted.
#[derive(Clone)]
pub enum Collector {
    Count,
    Sum(ValueMapper),
    Average(ValueMapper),
    Min(ValueMapper),
    Max(ValueMapper),
    CountDistinct(KeyExtractor),
}

/// Running state of one group's accumulation.
#[derive(Debug, Clone, PartialEq)]
pub enum AccumulatorState {
    Count(usize),
    Sum(i64),
    Average { sum: i64, count: usize },
    /// Multiset of mapped values, for min and max.
    Extremum(BTreeMap<i64, usize>),
    Distinct(HashMap<IndexKey, usize>),
}

/// Inverse of one accumulated contribution.
#[derive(Debug, Clone, PartialEq)]
pub enum Undo {
    Decrement,
    Subtract(i64),
    RemoveSample(i64),
    RemoveValue(i64),
    RemoveKey(IndexKey),
}

/// Convenience constructors for the built-in collectors.
pub struct Collectors;

impl Collectors {
    pub fn count() -> Collector {
        Collector::Count
    }

    pub fn sum(mapper: impl Fn(&Tuple) -> i64 + 'static) -> Collector {
        Collector::Sum(Rc::new(mapper))
    }

    pub fn average(mapper: impl Fn(&Tuple) -> i64 + 'static) -> Collector {
        Collector::Average(Rc::new(mapper))
    }

    pub fn min(mapper: impl Fn(&Tuple) -> i64 + 'static) -> Collector {
        Collector::Min(Rc::new(mapper))
    }

    pub fn max(mapper: impl Fn(&Tuple) -> i64 + 'static) -> Collector {
        Collector::Max(Rc::new(mapper))
    }

    pub fn count_distinct<K: Into<IndexKey>>(mapper: impl Fn(&Tuple) -> K + 'static) -> Collector {
        Collector::CountDistinct(Rc::new(move |tuple| mapper(tuple).into()))
    }
}

fn state_mismatch(collector: &Collector, state: &AccumulatorState) -> BavetError {
    BavetError::consistency_violation(format!(
        "collector ({}) cannot use accumulator state ({:?})",
        collector.name(),
        state
    ))
}

impl Collector {
    pub fn name(&self) -> &'static str {
        match self {
            Collector::Count => "count",
            Collector::Sum(_) => "sum",
            Collector::Average(_) => "average",
            Collector::Min(_) => "min",
            Collector::Max(_) => "max",
            Collector::CountDistinct(_) => "count_distinct",
        }
    }

    /// Fresh state for a new group.
    pub fn new_state(&self) -> AccumulatorState {
        match self {
            Collector::Count => AccumulatorState::Count(0),
            Collector::Sum(_) => AccumulatorState::Sum(0),
            Collector::Average(_) => AccumulatorState::Average { sum: 0, count: 0 },
            Collector::Min(_) | Collector::Max(_) => AccumulatorState::Extremum(BTreeMap::new()),
            Collector::CountDistinct(_) => AccumulatorState::Distinct(HashMap::default()),
        }
    }

    /// Adds `tuple` to `state` and returns how to take it out again.
    pub fn accumulate(&self, state: &mut AccumulatorState, tuple: &Tuple) -> Result<Undo> {
        match (self, &mut *state) {
            (Collector::Count, AccumulatorState::Count(count)) => {
                *count += 1;
                Ok(Undo::Decrement)
            }
            (Collector::Sum(mapper), AccumulatorState::Sum(sum)) => {
                let value = mapper(tuple);
                *sum = checked_sum(*sum, value, i64::checked_add)?;
                Ok(Undo::Subtract(value))
            }
            (Collector::Average(mapper), AccumulatorState::Average { sum, count }) => {
                let value = mapper(tuple);
                *sum = checked_sum(*sum, value, i64::checked_add)?;
                *count += 1;
                Ok(Undo::RemoveSample(value))
            }
            (Collector::Min(mapper) | Collector::Max(mapper), AccumulatorState::Extremum(values)) => {
                let value = mapper(tuple);
                *values.entry(value).or_insert(0) += 1;
                Ok(Undo::RemoveValue(value))
            }
            (Collector::CountDistinct(mapper), AccumulatorState::Distinct(keys)) => {
                let key = mapper(tuple);
                *keys.entry(key.clone()).or_insert(0) += 1;
                Ok(Undo::RemoveKey(key))
            }
            _ => Err(state_mismatch(self, state)),
        }
    }

    /// The group's current result as a fact.
    ///
    /// `count` and `count_distinct` yield `usize`, `sum` yields `i64`,
    /// `average` yields `Option<f64>`, `min` and `max` yield `Option<i64>`.
    pub fn result(&self, state: &AccumulatorState) -> Result<FactRef> {
        let fact: FactRef = match (self, state) {
            (Collector::Count, AccumulatorState::Count(count)) => Rc::new(*count),
            (Collector::Sum(_), AccumulatorState::Sum(sum)) => Rc::new(*sum),
            (Collector::Average(_), AccumulatorState::Average { sum, count }) => {
                let average = (*count > 0).then(|| *sum as f64 / *count as f64);
                Rc::new(average)
            }
            (Collector::Min(_), AccumulatorState::Extremum(values)) => {
                Rc::new(values.keys().next().copied())
            }
            (Collector::Max(_), AccumulatorState::Extremum(values)) => {
                Rc::new(values.keys().next_back().copied())
            }
            (Collector::CountDistinct(_), AccumulatorState::Distinct(keys)) => Rc::new(keys.len()),
            _ => return Err(state_mismatch(self, state)),
        };
        Ok(fact)
    }
}

impl Undo {
    /// Reverses one earlier contribution.
    pub fn apply(self, state: &mut AccumulatorState) -> Result<()> {
        match (self, state) {
            (Undo::Decrement, AccumulatorState::Count(count)) if *count > 0 => {
                *count -= 1;
                Ok(())
            }
            (Undo::Subtract(value), AccumulatorState::Sum(sum)) => {
                *sum = checked_sum(*sum, value, i64::checked_sub)?;
                Ok(())
            }
            (Undo::RemoveSample(value), AccumulatorState::Average { sum, count }) if *count > 0 => {
                *sum = checked_sum(*sum, value, i64::checked_sub)?;
                *count -= 1;
                Ok(())
            }
            (Undo::RemoveValue(value), AccumulatorState::Extremum(values)) => {
                remove_one(values, &value).ok_or_else(|| {
                    BavetError::consistency_violation(format!(
                        "value ({}) is not in the extremum accumulator",
                        value
                    ))
                })
            }
            (Undo::RemoveKey(key), AccumulatorState::Distinct(keys)) => {
                let missing = format!("key ({}) is not in the distinct accumulator", key);
                remove_one(keys, &key).ok_or_else(|| BavetError::consistency_violation(missing))
            }
            (undo, state) => Err(BavetError::consistency_violation(format!(
                "undo ({:?}) does not apply to accumulator state ({:?})",
                undo, state
            ))),
        }
    }
}

fn checked_sum(sum: i64, value: i64, op: fn(i64, i64) -> Option<i64>) -> Result<i64> {
    op(sum, value).ok_or_else(|| {
        BavetError::overflow(format!(
            "accumulating ({}) into a running sum of ({})",
            value, sum
        ))
    })
}

/// Decrements a counted entry, dropping it at zero.
fn remove_one<K, M>(counts: &mut M, key: &K) -> Option<()>
where
    M: CountedMap<K>,
{
    let count = counts.count_mut(key)?;
    *count -= 1;
    if *count == 0 {
        counts.remove_key(key);
    }
    Some(())
}

trait CountedMap<K> {
    fn count_mut(&mut self, key: &K) -> Option<&mut usize>;
    fn remove_key(&mut self, key: &K);
}

impl CountedMap<i64> for BTreeMap<i64, usize> {
    fn count_mut(&mut self, key: &i64) -> Option<&mut usize> {
        self.get_mut(key)
    }

    fn remove_key(&mut self, key: &i64) {
        self.remove(key);
    }
}

impl CountedMap<IndexKey> for HashMap<IndexKey, usize> {
    fn count_mut(&mut self, key: &IndexKey) -> Option<&mut usize> {
        self.get_mut(key)
    }

    fn remove_key(&mut self, key: &IndexKey) {
        self.remove(key);
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("kind", &self.name())
            .field("mapper", &"<function>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::downcast_fact;
    use crate::tuple::Facts;
    use smallvec::smallvec;

    fn tuple(value: i64) -> Tuple {
        let fact: FactRef = Rc::new(value);
        let facts: Facts = smallvec![fact];
        Tuple::new(0, facts)
    }

    fn value_of(t: &Tuple) -> i64 {
        t.fact::<i64>(0).copied().unwrap_or_default()
    }

    fn result<T: Clone + 'static>(collector: &Collector, state: &AccumulatorState) -> T {
        let fact = collector.result(state).unwrap();
        downcast_fact::<T>(&*fact).cloned().unwrap()
    }

    // --- Count / Sum Tests ---

    #[test]
    fn test_count_and_undo() {
        let collector = Collectors::count();
        let mut state = collector.new_state();
        let undo_a = collector.accumulate(&mut state, &tuple(1)).unwrap();
        collector.accumulate(&mut state, &tuple(2)).unwrap();
        assert_eq!(result::<usize>(&collector, &state), 2);

        undo_a.apply(&mut state).unwrap();
        assert_eq!(result::<usize>(&collector, &state), 1);
    }

    #[test]
    fn test_sum_and_average() {
        let sum = Collectors::sum(value_of);
        let average = Collectors::average(value_of);
        let mut sum_state = sum.new_state();
        let mut avg_state = average.new_state();
        assert_eq!(result::<Option<f64>>(&average, &avg_state), None);

        let mut undos = Vec::new();
        for v in [3, 5, 10] {
            sum.accumulate(&mut sum_state, &tuple(v)).unwrap();
            undos.push(average.accumulate(&mut avg_state, &tuple(v)).unwrap());
        }
        assert_eq!(result::<i64>(&sum, &sum_state), 18);
        assert_eq!(result::<Option<f64>>(&average, &avg_state), Some(6.0));

        undos.pop().unwrap().apply(&mut avg_state).unwrap();
        assert_eq!(result::<Option<f64>>(&average, &avg_state), Some(4.0));
    }

    #[test]
    fn test_sum_overflow_leaves_state_untouched() {
        let sum = Collectors::sum(value_of);
        let mut state = sum.new_state();
        sum.accumulate(&mut state, &tuple(i64::MAX)).unwrap();
        assert!(matches!(
            sum.accumulate(&mut state, &tuple(1)),
            Err(BavetError::Overflow { .. })
        ));
        assert_eq!(result::<i64>(&sum, &state), i64::MAX);
    }

    // --- Min / Max Tests ---

    #[test]
    fn test_extremum_with_duplicates() {
        let min = Collectors::min(value_of);
        let max = Collectors::max(value_of);
        let mut state = min.new_state();
        let undo_low_a = min.accumulate(&mut state, &tuple(1)).unwrap();
        let undo_low_b = min.accumulate(&mut state, &tuple(1)).unwrap();
        min.accumulate(&mut state, &tuple(7)).unwrap();

        assert_eq!(result::<Option<i64>>(&min, &state), Some(1));
        assert_eq!(result::<Option<i64>>(&max, &state), Some(7));

        undo_low_a.apply(&mut state).unwrap();
        assert_eq!(result::<Option<i64>>(&min, &state), Some(1), "one copy of 1 remains");
        undo_low_b.apply(&mut state).unwrap();
        assert_eq!(result::<Option<i64>>(&min, &state), Some(7));
    }

    #[test]
    fn test_count_distinct() {
        let collector = Collectors::count_distinct(|t: &Tuple| value_of(t) % 2 == 0);
        let mut state = collector.new_state();
        let undo_even = collector.accumulate(&mut state, &tuple(2)).unwrap();
        collector.accumulate(&mut state, &tuple(4)).unwrap();
        collector.accumulate(&mut state, &tuple(5)).unwrap();
        assert_eq!(result::<usize>(&collector, &state), 2);

        undo_even.apply(&mut state).unwrap();
        assert_eq!(result::<usize>(&collector, &state), 2, "4 still keeps 'even' alive");
    }

    // --- Consistency Tests ---

    #[test]
    fn test_mismatched_state_is_rejected() {
        let mut state = Collectors::count().new_state();
        assert!(Collectors::sum(value_of)
            .accumulate(&mut state, &tuple(1))
            .is_err());
        assert!(Undo::RemoveValue(3).apply(&mut state).is_err());
        assert!(Undo::Decrement.apply(&mut state).is_err(), "count never goes negative");
    }
}
