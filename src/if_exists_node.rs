// if_exists_node.rs - Existence and non-existence of right matches
use crate::arena::{AbstractNode, NodeId, TupleArena};
use crate::error::{BavetError, Result};
use crate::index_properties::IndexProperties;
use crate::indexer::Indexer;
use crate::joiner_utils::IndexMapping;
use crate::lifecycle::{NodeInput, Propagation, TupleLifecycle};
use crate::state::TupleState;
use crate::tuple::{StoreEntry, TupleId};
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

new_key_type! {
    pub struct CounterId;
}

/// Tracks how many right tuples match one left tuple, and whether the left
/// tuple is currently passed downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistsCounter {
    left: TupleId,
    state: TupleState,
    count_right: usize,
    retracted: bool,
}

impl ExistsCounter {
    pub fn left(&self) -> TupleId {
        self.left
    }

    pub fn state(&self) -> TupleState {
        self.state
    }

    pub fn count_right(&self) -> usize {
        self.count_right
    }
}

/// Passes left tuples through unchanged while at least one right tuple
/// matches (`should_exist`), or while none does.
pub struct IfExistsNode {
    id: NodeId,
    should_exist: bool,
    mapping_left: IndexMapping,
    mapping_right: IndexMapping,
    input_store_index_left_key: usize,
    input_store_index_left_counter: usize,
    input_store_index_right_key: usize,
    indexer_left: Indexer<CounterId>,
    indexer_right: Indexer<()>,
    counters: SlotMap<CounterId, ExistsCounter>,
    dirty_queue: VecDeque<CounterId>,
    next: Rc<TupleLifecycle>,
}

impl IfExistsNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        should_exist: bool,
        mapping_left: IndexMapping,
        mapping_right: IndexMapping,
        input_store_index_left_key: usize,
        input_store_index_left_counter: usize,
        input_store_index_right_key: usize,
        column_count: usize,
        next: Rc<TupleLifecycle>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            id,
            should_exist,
            mapping_left,
            mapping_right,
            input_store_index_left_key,
            input_store_index_left_counter,
            input_store_index_right_key,
            indexer_left: Indexer::new(column_count),
            indexer_right: Indexer::new(column_count),
            counters: SlotMap::with_key(),
            dirty_queue: VecDeque::with_capacity(queue_capacity),
            next,
        }
    }

    #[inline]
    fn passes(&self, count_right: usize) -> bool {
        if self.should_exist {
            count_right > 0
        } else {
            count_right == 0
        }
    }

    pub fn insert_left(&mut self, left: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let key = self.store_key(left, self.input_store_index_left_key, &self.mapping_left, tuples)?;
        let count_right = self.indexer_right.count(&key);
        let counter_id = self.counters.insert(ExistsCounter {
            left,
            state: TupleState::Dead,
            count_right,
            retracted: false,
        });
        self.indexer_left.put(key, left, counter_id)?;
        tuples.set_store(
            left,
            self.input_store_index_left_counter,
            StoreEntry::Counter(counter_id),
        )?;
        if self.passes(count_right) {
            self.insert_counter(counter_id)?;
        }
        Ok(())
    }

    pub fn retract_left(&mut self, left: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let Some(key) = self.take_key(left, self.input_store_index_left_key, tuples)? else {
            return Ok(());
        };
        let counter_id = match tuples.take_store(left, self.input_store_index_left_counter)? {
            Some(StoreEntry::Counter(counter_id)) => counter_id,
            other => return Err(self.corrupt_slot(left, other)),
        };
        self.indexer_left.remove(&key, left)?;

        let count_right = self.counter(counter_id)?.count_right;
        if self.passes(count_right) {
            self.retract_counter(counter_id)?;
        }
        let counter = self.counter_mut(counter_id)?;
        counter.retracted = true;
        if counter.state == TupleState::Dead {
            self.counters.remove(counter_id);
        }
        Ok(())
    }

    pub fn insert_right(&mut self, right: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let key =
            self.store_key(right, self.input_store_index_right_key, &self.mapping_right, tuples)?;
        let counter_ids = self.matching_counters(&key);
        self.indexer_right.put(key, right, ())?;
        for counter_id in counter_ids {
            let counter = self.counter_mut(counter_id)?;
            let first = counter.count_right == 0;
            counter.count_right += 1;
            if first {
                if self.should_exist {
                    self.insert_counter(counter_id)?;
                } else {
                    self.retract_counter(counter_id)?;
                }
            }
        }
        Ok(())
    }

    pub fn retract_right(&mut self, right: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let Some(key) = self.take_key(right, self.input_store_index_right_key, tuples)? else {
            return Ok(());
        };
        self.indexer_right.remove(&key, right)?;
        for counter_id in self.matching_counters(&key) {
            let counter = self.counter_mut(counter_id)?;
            counter.count_right -= 1;
            if counter.count_right == 0 {
                if self.should_exist {
                    self.retract_counter(counter_id)?;
                } else {
                    self.insert_counter(counter_id)?;
                }
            }
        }
        Ok(())
    }

    /// Number of counters still held, including retracted ones awaiting flush.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Counter of the left tuple, if that tuple is currently indexed.
    pub fn counter_of(&self, left: TupleId, tuples: &TupleArena) -> Option<&ExistsCounter> {
        match tuples.store(left, self.input_store_index_left_counter) {
            Ok(Some(StoreEntry::Counter(counter_id))) => self.counters.get(*counter_id),
            _ => None,
        }
    }

    fn matching_counters(&self, key: &IndexProperties) -> SmallVec<[CounterId; 8]> {
        let mut counter_ids = SmallVec::new();
        self.indexer_left
            .visit(key, |_, &counter_id| counter_ids.push(counter_id));
        counter_ids
    }

    fn insert_counter(&mut self, counter_id: CounterId) -> Result<()> {
        let node = self.id;
        let counter = self.counter_mut(counter_id)?;
        let (next, enqueue) = match counter.state {
            TupleState::Dying => (TupleState::Updating, false),
            TupleState::Dead => (TupleState::Creating, true),
            TupleState::Aborting => (TupleState::Creating, false),
            state => {
                return Err(BavetError::impossible_state(
                    node,
                    counter.left,
                    state,
                    "inserting an exists counter",
                ))
            }
        };
        counter.state = next;
        if enqueue {
            self.dirty_queue.push_back(counter_id);
        }
        Ok(())
    }

    fn retract_counter(&mut self, counter_id: CounterId) -> Result<()> {
        let node = self.id;
        let counter = self.counter_mut(counter_id)?;
        let (next, enqueue) = match counter.state {
            TupleState::Creating => (TupleState::Aborting, false),
            TupleState::Updating => (TupleState::Dying, false),
            TupleState::Ok => (TupleState::Dying, true),
            state => {
                return Err(BavetError::impossible_state(
                    node,
                    counter.left,
                    state,
                    "retracting an exists counter",
                ))
            }
        };
        counter.state = next;
        if enqueue {
            self.dirty_queue.push_back(counter_id);
        }
        Ok(())
    }

    fn counter(&self, counter_id: CounterId) -> Result<&ExistsCounter> {
        let node = self.id;
        self.counters
            .get(counter_id)
            .ok_or_else(|| missing_counter(node, counter_id))
    }

    fn counter_mut(&mut self, counter_id: CounterId) -> Result<&mut ExistsCounter> {
        let node = self.id;
        self.counters
            .get_mut(counter_id)
            .ok_or_else(|| missing_counter(node, counter_id))
    }

    fn store_key(
        &self,
        tuple: TupleId,
        store_index: usize,
        mapping: &IndexMapping,
        tuples: &mut TupleArena,
    ) -> Result<IndexProperties> {
        if tuples.store(tuple, store_index)?.is_some() {
            return Err(BavetError::double_insert(self.id, tuple));
        }
        let key = mapping(tuples.get(tuple)?);
        tuples.set_store(tuple, store_index, StoreEntry::Properties(key.clone()))?;
        Ok(key)
    }

    fn take_key(
        &self,
        tuple: TupleId,
        store_index: usize,
        tuples: &mut TupleArena,
    ) -> Result<Option<IndexProperties>> {
        match tuples.take_store(tuple, store_index)? {
            None => Ok(None),
            Some(StoreEntry::Properties(key)) => Ok(Some(key)),
            other => Err(self.corrupt_slot(tuple, other)),
        }
    }

    fn corrupt_slot(&self, tuple: TupleId, entry: Option<StoreEntry>) -> BavetError {
        BavetError::consistency_violation(format!(
            "exists node ({}) found {:?} in a slot of tuple ({:?})",
            self.id, entry, tuple
        ))
    }
}

fn missing_counter(node: NodeId, counter_id: CounterId) -> BavetError {
    BavetError::consistency_violation(format!(
        "exists node ({}) has no counter ({:?})",
        node, counter_id
    ))
}

impl AbstractNode for IfExistsNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn insert(&mut self, input: NodeInput, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        match input {
            NodeInput::Left => self.insert_left(tuple, tuples),
            NodeInput::Right => self.insert_right(tuple, tuples),
            NodeInput::Uni => Err(BavetError::node_mismatch(self.id, "a uni insert")),
        }
    }

    fn retract(&mut self, input: NodeInput, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        match input {
            NodeInput::Left => self.retract_left(tuple, tuples),
            NodeInput::Right => self.retract_right(tuple, tuples),
            NodeInput::Uni => Err(BavetError::node_mismatch(self.id, "a uni retract")),
        }
    }

    fn calculate_score(
        &mut self,
        _tuples: &mut TupleArena,
        propagations: &mut Vec<Propagation>,
    ) -> Result<()> {
        let node = self.id;
        while let Some(counter_id) = self.dirty_queue.pop_front() {
            let counter = self.counter_mut(counter_id)?;
            let step = counter.state.flush_step().ok_or_else(|| {
                BavetError::impossible_state(
                    node,
                    counter.left,
                    counter.state,
                    "flushing an exists counter",
                )
            })?;
            if step.retract {
                propagations.push(Propagation::Retract(counter.left));
            }
            if step.insert {
                propagations.push(Propagation::Insert(counter.left));
            }
            counter.state = step.next;
            if counter.state == TupleState::Dead && counter.retracted {
                self.counters.remove(counter_id);
            }
        }
        Ok(())
    }

    fn next_lifecycle(&self) -> Option<&Rc<TupleLifecycle>> {
        Some(&self.next)
    }

    fn dirty_count(&self) -> usize {
        self.dirty_queue.len()
    }
}

impl fmt::Debug for IfExistsNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IfExistsNode")
            .field("id", &self.id)
            .field("should_exist", &self.should_exist)
            .field("left", &self.indexer_left.len())
            .field("right", &self.indexer_right.len())
            .field("counters", &self.counters.len())
            .field("dirty", &self.dirty_queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactRef;
    use crate::joiner::Joiners;
    use crate::joiner_utils::JoinerUtils;
    use crate::tuple::Tuple;
    use smallvec::smallvec;

    fn exists_node(should_exist: bool) -> IfExistsNode {
        let key = |t: &Tuple| t.fact::<i64>(0).copied();
        let joiners = Joiners::new().equal(key, key);
        IfExistsNode::new(
            NodeId(0),
            should_exist,
            JoinerUtils::combine_left_mappings(&joiners),
            JoinerUtils::combine_right_mappings(&joiners),
            0,
            1,
            2,
            joiners.len(),
            TupleLifecycle::node(NodeId(1), NodeInput::Uni),
            16,
        )
    }

    fn tuple(tuples: &mut TupleArena, key: i64) -> TupleId {
        let fact: FactRef = Rc::new(key);
        let id = tuples.create(smallvec![fact], 3).unwrap();
        tuples.set_state(id, TupleState::Ok).unwrap();
        id
    }

    fn flush(node: &mut IfExistsNode, tuples: &mut TupleArena) -> Vec<Propagation> {
        let mut propagations = Vec::new();
        node.calculate_score(tuples, &mut propagations).unwrap();
        propagations
    }

    // --- If Exists Tests ---

    #[test]
    fn test_toggles_on_first_and_last_match() {
        let mut tuples = TupleArena::new();
        let mut node = exists_node(true);
        let a = tuple(&mut tuples, 1);
        let b = tuple(&mut tuples, 1);
        let c = tuple(&mut tuples, 1);

        node.insert_left(a, &mut tuples).unwrap();
        assert!(flush(&mut node, &mut tuples).is_empty());

        node.insert_right(b, &mut tuples).unwrap();
        assert_eq!(flush(&mut node, &mut tuples), vec![Propagation::Insert(a)]);

        node.insert_right(c, &mut tuples).unwrap();
        assert!(flush(&mut node, &mut tuples).is_empty());
        assert_eq!(node.counter_of(a, &tuples).unwrap().count_right(), 2);

        node.retract_right(b, &mut tuples).unwrap();
        assert!(flush(&mut node, &mut tuples).is_empty());
        node.retract_right(c, &mut tuples).unwrap();
        assert_eq!(flush(&mut node, &mut tuples), vec![Propagation::Retract(a)]);
        assert_eq!(node.counter_of(a, &tuples).unwrap().state(), TupleState::Dead);
    }

    #[test]
    fn test_flip_back_within_one_cycle_is_update() {
        let mut tuples = TupleArena::new();
        let mut node = exists_node(true);
        let a = tuple(&mut tuples, 1);
        let b = tuple(&mut tuples, 1);
        let c = tuple(&mut tuples, 1);
        node.insert_left(a, &mut tuples).unwrap();
        node.insert_right(b, &mut tuples).unwrap();
        flush(&mut node, &mut tuples);

        node.retract_right(b, &mut tuples).unwrap();
        node.insert_right(c, &mut tuples).unwrap();
        assert_eq!(
            flush(&mut node, &mut tuples),
            vec![Propagation::Retract(a), Propagation::Insert(a)]
        );
    }

    // --- If Not Exists Tests ---

    #[test]
    fn test_not_exists_is_the_inverse() {
        let mut tuples = TupleArena::new();
        let mut node = exists_node(false);
        let a = tuple(&mut tuples, 1);
        let b = tuple(&mut tuples, 1);
        let other = tuple(&mut tuples, 2);

        node.insert_left(a, &mut tuples).unwrap();
        node.insert_right(other, &mut tuples).unwrap();
        assert_eq!(flush(&mut node, &mut tuples), vec![Propagation::Insert(a)]);

        node.insert_right(b, &mut tuples).unwrap();
        assert_eq!(flush(&mut node, &mut tuples), vec![Propagation::Retract(a)]);

        node.retract_right(b, &mut tuples).unwrap();
        assert_eq!(flush(&mut node, &mut tuples), vec![Propagation::Insert(a)]);
    }

    // --- Left Retract Tests ---

    #[test]
    fn test_left_retract_before_flush_emits_nothing() {
        let mut tuples = TupleArena::new();
        let mut node = exists_node(true);
        let a = tuple(&mut tuples, 1);
        let b = tuple(&mut tuples, 1);
        node.insert_right(b, &mut tuples).unwrap();
        node.insert_left(a, &mut tuples).unwrap();
        node.retract_left(a, &mut tuples).unwrap();

        assert!(flush(&mut node, &mut tuples).is_empty());
        assert_eq!(node.counter_count(), 0);
    }

    #[test]
    fn test_left_retract_after_flush_retracts_and_drops_counter() {
        let mut tuples = TupleArena::new();
        let mut node = exists_node(false);
        let a = tuple(&mut tuples, 1);
        node.insert_left(a, &mut tuples).unwrap();
        flush(&mut node, &mut tuples);

        node.retract_left(a, &mut tuples).unwrap();
        assert_eq!(node.counter_count(), 1, "kept until its retract is flushed");
        assert_eq!(flush(&mut node, &mut tuples), vec![Propagation::Retract(a)]);
        assert_eq!(node.counter_count(), 0);
    }

    #[test]
    fn test_silent_left_retract_drops_counter_at_once() {
        let mut tuples = TupleArena::new();
        let mut node = exists_node(true);
        let a = tuple(&mut tuples, 1);
        node.insert_left(a, &mut tuples).unwrap();
        node.retract_left(a, &mut tuples).unwrap();
        assert_eq!(node.counter_count(), 0);
        assert_eq!(node.dirty_count(), 0);
    }

    // --- Slot Tests ---

    #[test]
    fn test_double_insert_and_unseen_retract() {
        let mut tuples = TupleArena::new();
        let mut node = exists_node(true);
        let a = tuple(&mut tuples, 1);
        node.insert_right(a, &mut tuples).unwrap();
        assert!(matches!(
            node.insert_right(a, &mut tuples),
            Err(BavetError::DoubleInsert { .. })
        ));
        node.retract_left(a, &mut tuples).unwrap();
        node.retract_right(a, &mut tuples).unwrap();
        node.retract_right(a, &mut tuples).unwrap();
        assert!(flush(&mut node, &mut tuples).is_empty());
    }
}
