// group_node.rs - Group-by with optional key and accumulation
use crate::arena::{AbstractNode, NodeId, TupleArena};
use crate::collectors::{AccumulatorState, Collector, Undo};
use crate::error::{BavetError, Result};
use crate::fact::FactRef;
use crate::index_properties::IndexKey;
use crate::joiner::KeyExtractor;
use crate::lifecycle::{NodeInput, Propagation, TupleLifecycle};
use crate::state::TupleState;
use crate::tuple::{Facts, StoreEntry, TupleId};
use rustc_hash::FxHashMap as HashMap;
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

new_key_type! {
    pub struct GroupId;
}

/// Stored in an input tuple's slot: its group and how to undo its
/// contribution, one entry per collector.
#[derive(Debug, Clone)]
pub struct GroupPart {
    pub(crate) group: GroupId,
    pub(crate) undo: SmallVec<[Undo; 1]>,
}

/// One live aggregation bucket.
#[derive(Debug)]
pub struct Group {
    key: IndexKey,
    key_fact: FactRef,
    result_container: SmallVec<[AccumulatorState; 1]>,
    parent_count: usize,
    dirty: bool,
    dying: bool,
    tuple: Option<TupleId>,
}

impl Group {
    fn new(key: IndexKey, result_container: SmallVec<[AccumulatorState; 1]>) -> Self {
        Self {
            key_fact: Rc::new(key.clone()),
            key,
            result_container,
            parent_count: 0,
            dirty: false,
            dying: false,
            tuple: None,
        }
    }

    pub fn key(&self) -> &IndexKey {
        &self.key
    }

    pub fn parent_count(&self) -> usize {
        self.parent_count
    }
}

/// Groups input tuples by key and emits one tuple per group: the key
/// followed by one result per collector. Without a key extractor every input
/// lands in a single group and the output holds only the results.
///
/// Any change to a group re-emits its output as a retract of the old tuple
/// followed by an insert of a new one.
pub struct GroupNode {
    id: NodeId,
    group_key: Option<KeyExtractor>,
    collectors: Vec<Collector>,
    input_store_index: usize,
    output_store_size: usize,
    groups: SlotMap<GroupId, Group>,
    group_map: HashMap<IndexKey, GroupId>,
    dirty_queue: VecDeque<GroupId>,
    next: Rc<TupleLifecycle>,
}

impl GroupNode {
    pub fn new(
        id: NodeId,
        group_key: Option<KeyExtractor>,
        collectors: Vec<Collector>,
        input_store_index: usize,
        output_store_size: usize,
        next: Rc<TupleLifecycle>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            id,
            group_key,
            collectors,
            input_store_index,
            output_store_size,
            groups: SlotMap::with_key(),
            group_map: HashMap::default(),
            dirty_queue: VecDeque::with_capacity(queue_capacity),
            next,
        }
    }

    pub fn insert_tuple(&mut self, tuple_id: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let node = self.id;
        if tuples.store(tuple_id, self.input_store_index)?.is_some() {
            return Err(BavetError::double_insert(node, tuple_id));
        }
        let tuple = tuples.get(tuple_id)?;
        let key = match &self.group_key {
            Some(group_key) => group_key(tuple),
            None => IndexKey::Null,
        };

        let group_id = match self.group_map.get(&key) {
            Some(&group_id) => group_id,
            None => {
                let states = self.collectors.iter().map(Collector::new_state).collect();
                let group_id = self.groups.insert(Group::new(key.clone(), states));
                self.group_map.insert(key, group_id);
                group_id
            }
        };
        let group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| BavetError::missing_group(node, group_id))?;
        group.parent_count += 1;
        let mut undo = SmallVec::new();
        for (collector, state) in self.collectors.iter().zip(group.result_container.iter_mut()) {
            undo.push(collector.accumulate(state, tuple)?);
        }
        if !group.dirty {
            group.dirty = true;
            self.dirty_queue.push_back(group_id);
        }

        let part = GroupPart {
            group: group_id,
            undo,
        };
        tuples.set_store(tuple_id, self.input_store_index, StoreEntry::GroupPart(part))
    }

    pub fn retract_tuple(&mut self, tuple_id: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let node = self.id;
        let part = match tuples.take_store(tuple_id, self.input_store_index)? {
            // Filtered out upstream.
            None => return Ok(()),
            Some(StoreEntry::GroupPart(part)) => part,
            Some(other) => {
                return Err(BavetError::consistency_violation(format!(
                    "group node ({}) found {:?} in the group slot of tuple ({:?})",
                    node, other, tuple_id
                )))
            }
        };
        let group = self
            .groups
            .get_mut(part.group)
            .ok_or_else(|| BavetError::missing_group(node, part.group))?;
        group.parent_count -= 1;
        for (undo, state) in part.undo.into_iter().zip(group.result_container.iter_mut()) {
            undo.apply(state)?;
        }
        if group.parent_count == 0 {
            if self.group_map.remove(&group.key) != Some(part.group) {
                return Err(BavetError::missing_group(node, &group.key));
            }
            group.dying = true;
        }
        if !group.dirty {
            group.dirty = true;
            self.dirty_queue.push_back(part.group);
        }
        Ok(())
    }

    /// Live group for `key`, if any tuple currently supports it.
    pub fn group(&self, key: &IndexKey) -> Option<&Group> {
        self.group_map
            .get(key)
            .and_then(|&group_id| self.groups.get(group_id))
    }

    /// Number of groups in the group map, dying groups excluded.
    pub fn group_count(&self) -> usize {
        self.group_map.len()
    }

    fn out_facts(&self, group: &Group) -> Result<Facts> {
        let mut facts = Facts::new();
        if self.group_key.is_some() {
            facts.push(group.key_fact.clone());
        }
        for (collector, state) in self.collectors.iter().zip(&group.result_container) {
            facts.push(collector.result(state)?);
        }
        Ok(facts)
    }
}

impl AbstractNode for GroupNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn insert(&mut self, input: NodeInput, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        match input {
            NodeInput::Uni => self.insert_tuple(tuple, tuples),
            _ => Err(BavetError::node_mismatch(self.id, format!("a {:?} insert", input))),
        }
    }

    fn retract(&mut self, input: NodeInput, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        match input {
            NodeInput::Uni => self.retract_tuple(tuple, tuples),
            _ => Err(BavetError::node_mismatch(self.id, format!("a {:?} retract", input))),
        }
    }

    fn calculate_score(
        &mut self,
        tuples: &mut TupleArena,
        propagations: &mut Vec<Propagation>,
    ) -> Result<()> {
        let node = self.id;
        while let Some(group_id) = self.dirty_queue.pop_front() {
            let group = self
                .groups
                .get(group_id)
                .ok_or_else(|| BavetError::missing_group(node, group_id))?;
            let old_tuple = group.tuple;
            let fresh_facts = if group.dying {
                None
            } else {
                Some(self.out_facts(group)?)
            };

            if let Some(old) = old_tuple {
                let state = tuples.state(old)?;
                if state != TupleState::Ok {
                    return Err(BavetError::impossible_state(
                        node,
                        old,
                        state,
                        "retracting a group output tuple",
                    ));
                }
                tuples.set_state(old, TupleState::Dying)?;
                propagations.push(Propagation::Retract(old));
                tuples.set_state(old, TupleState::Dead)?;
                tuples.bury(old);
            }

            match fresh_facts {
                None => {
                    self.groups.remove(group_id);
                }
                Some(facts) => {
                    let out = tuples.create(facts, self.output_store_size)?;
                    propagations.push(Propagation::Insert(out));
                    tuples.set_state(out, TupleState::Ok)?;
                    if let Some(group) = self.groups.get_mut(group_id) {
                        group.tuple = Some(out);
                        group.dirty = false;
                    }
                }
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

impl fmt::Debug for GroupNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupNode")
            .field("id", &self.id)
            .field("keyed", &self.group_key.is_some())
            .field("collectors", &self.collectors)
            .field("groups", &self.group_map.len())
            .field("dirty", &self.dirty_queue.len())
            .field("next", &self.next)
            .finish()
    }
}
