//arena.rs
use crate::error::{BavetError, Result};
use crate::for_each_node::ForEachNode;
use crate::group_node::GroupNode;
use crate::if_exists_node::IfExistsNode;
use crate::join_node::JoinNode;
use crate::map_node::MapNode;
use crate::lifecycle::{NodeInput, Propagation, TupleLifecycle};
use crate::resource_limits::ResourceLimits;
use crate::score::Score;
use crate::scoring_node::ScoringNode;
use crate::state::TupleState;
use crate::tuple::{Facts, StoreEntry, Tuple, TupleId};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use tracing::trace;

/// Tuples plus their extension slots.
///
/// The slots live in a side table keyed by the tuple handle, sized once per
/// tuple from the store size its source stream froze at build time.
pub struct TupleArena {
    tuples: SlotMap<TupleId, Tuple>,
    stores: SecondaryMap<TupleId, Box<[Option<StoreEntry>]>>,
    graveyard: Vec<TupleId>,
    next_serial: u64,
    max_tuples: usize,
}

impl TupleArena {
    pub fn new() -> Self {
        Self::with_limits(&ResourceLimits::default())
    }

    pub fn with_limits(limits: &ResourceLimits) -> Self {
        Self {
            tuples: SlotMap::with_key(),
            stores: SecondaryMap::new(),
            graveyard: Vec::new(),
            next_serial: 0,
            max_tuples: limits.max_tuples,
        }
    }

    /// Creates a tuple in the `Creating` state with `store_size` empty slots.
    pub fn create(&mut self, facts: Facts, store_size: usize) -> Result<TupleId> {
        if self.tuples.len() >= self.max_tuples {
            return Err(BavetError::resource_limit(
                "max_tuples",
                format!("Current: {}, Limit: {}", self.tuples.len(), self.max_tuples),
            ));
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        let id = self.tuples.insert(Tuple::new(serial, facts));
        self.stores.insert(id, vec![None; store_size].into_boxed_slice());
        Ok(id)
    }

    #[inline]
    pub fn get(&self, id: TupleId) -> Result<&Tuple> {
        self.tuples
            .get(id)
            .ok_or(BavetError::InvalidTuple { tuple: id })
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: TupleId) -> Result<&mut Tuple> {
        self.tuples
            .get_mut(id)
            .ok_or(BavetError::InvalidTuple { tuple: id })
    }

    #[inline]
    pub fn state(&self, id: TupleId) -> Result<TupleState> {
        Ok(self.get(id)?.state)
    }

    #[inline]
    pub(crate) fn set_state(&mut self, id: TupleId, state: TupleState) -> Result<()> {
        self.get_mut(id)?.state = state;
        Ok(())
    }

    pub fn contains(&self, id: TupleId) -> bool {
        self.tuples.contains_key(id)
    }

    fn slots(&self, id: TupleId, index: usize) -> Result<&[Option<StoreEntry>]> {
        let slots = self
            .stores
            .get(id)
            .ok_or(BavetError::InvalidTuple { tuple: id })?;
        if index >= slots.len() {
            return Err(BavetError::StoreIndexOutOfBounds {
                tuple: id,
                index,
                size: slots.len(),
            });
        }
        Ok(&**slots)
    }

    fn slot_mut(&mut self, id: TupleId, index: usize) -> Result<&mut Option<StoreEntry>> {
        let slots = self
            .stores
            .get_mut(id)
            .ok_or(BavetError::InvalidTuple { tuple: id })?;
        let size = slots.len();
        slots
            .get_mut(index)
            .ok_or(BavetError::StoreIndexOutOfBounds {
                tuple: id,
                index,
                size,
            })
    }

    pub fn store(&self, id: TupleId, index: usize) -> Result<Option<&StoreEntry>> {
        Ok(self.slots(id, index)?[index].as_ref())
    }

    pub(crate) fn set_store(&mut self, id: TupleId, index: usize, entry: StoreEntry) -> Result<()> {
        *self.slot_mut(id, index)? = Some(entry);
        Ok(())
    }

    pub(crate) fn take_store(&mut self, id: TupleId, index: usize) -> Result<Option<StoreEntry>> {
        Ok(self.slot_mut(id, index)?.take())
    }

    /// Number of extension slots of a tuple.
    pub fn store_size(&self, id: TupleId) -> Result<usize> {
        self.stores
            .get(id)
            .map(|slots| slots.len())
            .ok_or(BavetError::InvalidTuple { tuple: id })
    }

    /// Marks a dead tuple for release at the end of the current flush pass.
    ///
    /// Downstream nodes flushed later in the same pass may still read its
    /// facts while processing its retract.
    pub(crate) fn bury(&mut self, id: TupleId) {
        self.graveyard.push(id);
    }

    pub(crate) fn release_dead(&mut self) -> usize {
        let released = self.graveyard.len();
        for id in self.graveyard.drain(..) {
            self.tuples.remove(id);
            self.stores.remove(id);
        }
        released
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TupleId, &Tuple)> {
        self.tuples.iter()
    }

    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats {
            total_created: self.next_serial,
            pending_release: self.graveyard.len(),
            ..ArenaStats::default()
        };
        for (_, tuple) in self.tuples.iter() {
            if tuple.state.is_active() {
                stats.active_tuples += 1;
            }
            if tuple.state.is_dirty() {
                stats.dirty_tuples += 1;
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    pub active_tuples: usize,
    pub dirty_tuples: usize,
    pub pending_release: usize,
    pub total_created: u64,
}

impl fmt::Debug for TupleArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleArena")
            .field("tuples", &self.tuples.len())
            .field("graveyard", &self.graveyard.len())
            .field("next_serial", &self.next_serial)
            .finish()
    }
}

impl Default for TupleArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Build-order identity of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Contract shared by every node: accept tuples, queue the consequences, and
/// push them downstream on flush.
pub trait AbstractNode {
    fn id(&self) -> NodeId;

    fn insert(&mut self, input: NodeInput, tuple: TupleId, tuples: &mut TupleArena) -> Result<()>;

    fn retract(&mut self, input: NodeInput, tuple: TupleId, tuples: &mut TupleArena) -> Result<()>;

    /// Drains the dirty queue once, appending the downstream calls in queue order.
    fn calculate_score(
        &mut self,
        tuples: &mut TupleArena,
        propagations: &mut Vec<Propagation>,
    ) -> Result<()>;

    fn next_lifecycle(&self) -> Option<&Rc<TupleLifecycle>>;

    fn dirty_count(&self) -> usize;
}

/// Flush shared by nodes that own the tuples in their dirty queue.
pub(crate) fn flush_tuple_queue(
    node: NodeId,
    queue: &mut VecDeque<TupleId>,
    tuples: &mut TupleArena,
    propagations: &mut Vec<Propagation>,
) -> Result<()> {
    while let Some(tuple) = queue.pop_front() {
        let state = tuples.state(tuple)?;
        let step = state.flush_step().ok_or_else(|| {
            BavetError::impossible_state(node, tuple, state, "flushing the dirty tuple queue")
        })?;
        if step.retract {
            propagations.push(Propagation::Retract(tuple));
        }
        if step.insert {
            propagations.push(Propagation::Insert(tuple));
        }
        tuples.set_state(tuple, step.next)?;
        if step.next == TupleState::Dead {
            tuples.bury(tuple);
        }
    }
    Ok(())
}

#[derive(Debug)]
pub enum NodeData<S: Score> {
    ForEach(ForEachNode),
    Join(JoinNode),
    IfExists(IfExistsNode),
    Group(GroupNode),
    Map(MapNode),
    Scoring(ScoringNode<S>),
}

impl<S: Score> NodeData<S> {
    #[inline]
    pub fn as_node(&self) -> &dyn AbstractNode {
        match self {
            NodeData::ForEach(node) => node,
            NodeData::Join(node) => node,
            NodeData::IfExists(node) => node,
            NodeData::Group(node) => node,
            NodeData::Map(node) => node,
            NodeData::Scoring(node) => node,
        }
    }

    #[inline]
    pub fn as_node_mut(&mut self) -> &mut dyn AbstractNode {
        match self {
            NodeData::ForEach(node) => node,
            NodeData::Join(node) => node,
            NodeData::IfExists(node) => node,
            NodeData::Group(node) => node,
            NodeData::Map(node) => node,
            NodeData::Scoring(node) => node,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeData::ForEach(_) => "ForEach",
            NodeData::Join(_) => "Join",
            NodeData::IfExists(_) => "IfExists",
            NodeData::Group(_) => "Group",
            NodeData::Map(_) => "Map",
            NodeData::Scoring(_) => "Scoring",
        }
    }
}

/// All nodes of one network, kept in flush order.
pub struct NodeArena<S: Score> {
    nodes: Vec<NodeData<S>>,
    positions: Vec<usize>,
}

impl<S: Score> NodeArena<S> {
    /// Takes the node list in flush order, as returned by the build helper.
    pub fn new(nodes: Vec<NodeData<S>>) -> Result<Self> {
        let mut positions = vec![usize::MAX; nodes.len()];
        for (position, node) in nodes.iter().enumerate() {
            let id = node.as_node().id();
            match positions.get_mut(id.0) {
                Some(slot) if *slot == usize::MAX => *slot = position,
                _ => {
                    return Err(BavetError::consistency_violation(format!(
                        "node id ({}) is duplicated or out of range for {} nodes",
                        id,
                        nodes.len()
                    )))
                }
            }
        }
        Ok(Self { nodes, positions })
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> Result<&NodeData<S>> {
        self.positions
            .get(id.0)
            .and_then(|&position| self.nodes.get(position))
            .ok_or_else(|| BavetError::consistency_violation(format!("unknown node ({})", id)))
    }

    #[inline]
    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut NodeData<S>> {
        match self.positions.get(id.0) {
            Some(&position) if position < self.nodes.len() => Ok(&mut self.nodes[position]),
            _ => Err(BavetError::consistency_violation(format!(
                "unknown node ({})",
                id
            ))),
        }
    }

    /// Nodes in flush order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeData<S>> {
        self.nodes.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.nodes.iter().map(|node| node.as_node().dirty_count()).sum()
    }

    /// Delivers one insert or retract along a lifecycle.
    pub fn propagate(
        &mut self,
        lifecycle: &TupleLifecycle,
        propagation: Propagation,
        tuples: &mut TupleArena,
    ) -> Result<()> {
        match lifecycle {
            TupleLifecycle::Node { node, input } => {
                let target = self.get_mut(*node)?.as_node_mut();
                match propagation {
                    Propagation::Insert(tuple) => target.insert(*input, tuple, tuples),
                    Propagation::Retract(tuple) => target.retract(*input, tuple, tuples),
                }
            }
            TupleLifecycle::Filter { predicate, next } => {
                if let Propagation::Insert(tuple) = propagation {
                    if !predicate(tuples.get(tuple)?) {
                        return Ok(());
                    }
                }
                self.propagate(next, propagation, tuples)
            }
            TupleLifecycle::Aggregated(lifecycles) => {
                for lifecycle in lifecycles.iter() {
                    self.propagate(lifecycle, propagation, tuples)?;
                }
                Ok(())
            }
        }
    }

    /// Flushes every node once in flush order, then releases the tuples that
    /// died during the pass. Returns the number of released tuples.
    pub fn calculate_score(&mut self, tuples: &mut TupleArena) -> Result<usize> {
        let mut propagations = Vec::new();
        for position in 0..self.nodes.len() {
            let kind = self.nodes[position].kind();
            let node = self.nodes[position].as_node_mut();
            let dirty = node.dirty_count();
            if dirty == 0 {
                continue;
            }
            let id = node.id();
            trace!(node = %id, kind, dirty, "Flushing node");
            let next = node.next_lifecycle().cloned();
            node.calculate_score(tuples, &mut propagations)?;
            match next {
                Some(next) => {
                    for propagation in propagations.drain(..) {
                        self.propagate(&next, propagation, tuples)?;
                    }
                }
                None if !propagations.is_empty() => {
                    return Err(BavetError::consistency_violation(format!(
                        "node ({}) produced {} propagations without a downstream lifecycle",
                        id,
                        propagations.len()
                    )));
                }
                None => {}
            }
        }
        Ok(tuples.release_dead())
    }
}

impl<S: Score> fmt::Debug for NodeArena<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeArena")
            .field("total_nodes", &self.nodes.len())
            .finish()
    }
}
