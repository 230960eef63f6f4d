// join_node.rs - Binary equi-join
use crate::arena::{flush_tuple_queue, AbstractNode, NodeId, TupleArena};
use crate::error::{BavetError, Result};
use crate::index_properties::IndexProperties;
use crate::indexer::Indexer;
use crate::joiner_utils::IndexMapping;
use crate::lifecycle::{NodeInput, Propagation, TupleLifecycle};
use crate::state::TupleState;
use crate::tuple::{Facts, StoreEntry, TupleId};
use rustc_hash::FxHashMap as HashMap;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// Output tuples of one indexed tuple, keyed by the partner on the other side.
pub type OutTupleMap = HashMap<TupleId, TupleId>;

type Partners = SmallVec<[TupleId; 8]>;

/// Joins every left tuple with every right tuple of equal key.
///
/// Each side's indexer holds, per indexed tuple, the map from partner to the
/// output tuple created for that pair, so a retract on either side can find
/// and kill exactly the outputs it supported.
pub struct JoinNode {
    id: NodeId,
    mapping_left: IndexMapping,
    mapping_right: IndexMapping,
    input_store_index_left: usize,
    input_store_index_right: usize,
    output_store_size: usize,
    indexer_left: Indexer<OutTupleMap>,
    indexer_right: Indexer<OutTupleMap>,
    dirty_queue: VecDeque<TupleId>,
    next: Rc<TupleLifecycle>,
    live_outputs: usize,
}

impl JoinNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        mapping_left: IndexMapping,
        mapping_right: IndexMapping,
        input_store_index_left: usize,
        input_store_index_right: usize,
        output_store_size: usize,
        column_count: usize,
        next: Rc<TupleLifecycle>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            id,
            mapping_left,
            mapping_right,
            input_store_index_left,
            input_store_index_right,
            output_store_size,
            indexer_left: Indexer::new(column_count),
            indexer_right: Indexer::new(column_count),
            dirty_queue: VecDeque::with_capacity(queue_capacity),
            next,
            live_outputs: 0,
        }
    }

    pub fn insert_left(&mut self, left: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let key = self.store_key(left, self.input_store_index_left, &self.mapping_left, tuples)?;
        let mut partners = Partners::new();
        self.indexer_right.visit(&key, |right, _| partners.push(right));

        let node = self.id;
        let mut out_map = OutTupleMap::default();
        for right in partners {
            let out = self.create_out_tuple(left, right, tuples)?;
            out_map.insert(right, out);
            self.indexer_right
                .get_mut(&key, right)
                .ok_or_else(|| missing_out_tuple(node, right, left, &key))?
                .insert(left, out);
        }
        self.indexer_left.put(key, left, out_map)
    }

    pub fn insert_right(&mut self, right: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let key = self.store_key(right, self.input_store_index_right, &self.mapping_right, tuples)?;
        let mut partners = Partners::new();
        self.indexer_left.visit(&key, |left, _| partners.push(left));

        let node = self.id;
        let mut out_map = OutTupleMap::default();
        for left in partners {
            let out = self.create_out_tuple(left, right, tuples)?;
            out_map.insert(left, out);
            self.indexer_left
                .get_mut(&key, left)
                .ok_or_else(|| missing_out_tuple(node, left, right, &key))?
                .insert(right, out);
        }
        self.indexer_right.put(key, right, out_map)
    }

    pub fn retract_left(&mut self, left: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let Some(key) = self.take_key(left, self.input_store_index_left, tuples)? else {
            // Filtered out upstream.
            return Ok(());
        };
        let node = self.id;
        let out_map = self.indexer_left.remove(&key, left)?;
        for (right, out) in out_map {
            self.indexer_right
                .get_mut(&key, right)
                .and_then(|partner_map| partner_map.remove(&left))
                .ok_or_else(|| missing_out_tuple(node, right, left, &key))?;
            self.kill_tuple(out, tuples)?;
        }
        Ok(())
    }

    pub fn retract_right(&mut self, right: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let Some(key) = self.take_key(right, self.input_store_index_right, tuples)? else {
            return Ok(());
        };
        let node = self.id;
        let out_map = self.indexer_right.remove(&key, right)?;
        for (left, out) in out_map {
            self.indexer_left
                .get_mut(&key, left)
                .and_then(|partner_map| partner_map.remove(&right))
                .ok_or_else(|| missing_out_tuple(node, left, right, &key))?;
            self.kill_tuple(out, tuples)?;
        }
        Ok(())
    }

    /// Number of output tuples currently supported by a left/right pair.
    pub fn live_outputs(&self) -> usize {
        self.live_outputs
    }

    pub fn left_count(&self) -> usize {
        self.indexer_left.len()
    }

    pub fn right_count(&self) -> usize {
        self.indexer_right.len()
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
            Some(other) => Err(BavetError::consistency_violation(format!(
                "join node ({}) found {:?} in the key slot of tuple ({:?})",
                self.id, other, tuple
            ))),
        }
    }

    fn create_out_tuple(
        &mut self,
        left: TupleId,
        right: TupleId,
        tuples: &mut TupleArena,
    ) -> Result<TupleId> {
        let mut facts = Facts::new();
        facts.extend(tuples.get(left)?.facts().iter().cloned());
        facts.extend(tuples.get(right)?.facts().iter().cloned());
        let out = tuples.create(facts, self.output_store_size)?;
        self.dirty_queue.push_back(out);
        self.live_outputs += 1;
        Ok(out)
    }

    fn kill_tuple(&mut self, out: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let state = tuples.state(out)?;
        let transition = match state {
            TupleState::Aborting | TupleState::Dead => None,
            _ => state.invalidated(),
        };
        let (next, enqueue) = transition.ok_or_else(|| {
            BavetError::impossible_state(self.id, out, state, "killing a join output tuple")
        })?;
        tuples.set_state(out, next)?;
        if enqueue {
            self.dirty_queue.push_back(out);
        }
        self.live_outputs -= 1;
        Ok(())
    }
}

fn missing_out_tuple(
    node: NodeId,
    tuple: TupleId,
    partner: TupleId,
    key: &IndexProperties,
) -> BavetError {
    BavetError::MissingOutTuple {
        node,
        tuple,
        partner,
        key: key.to_string(),
    }
}

impl AbstractNode for JoinNode {
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
        tuples: &mut TupleArena,
        propagations: &mut Vec<Propagation>,
    ) -> Result<()> {
        flush_tuple_queue(self.id, &mut self.dirty_queue, tuples, propagations)
    }

    fn next_lifecycle(&self) -> Option<&Rc<TupleLifecycle>> {
        Some(&self.next)
    }

    fn dirty_count(&self) -> usize {
        self.dirty_queue.len()
    }
}

impl fmt::Debug for JoinNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinNode")
            .field("id", &self.id)
            .field("left", &self.indexer_left.len())
            .field("right", &self.indexer_right.len())
            .field("live_outputs", &self.live_outputs)
            .field("dirty", &self.dirty_queue.len())
            .field("next", &self.next)
            .finish()
    }
}
