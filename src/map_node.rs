// map_node.rs - Map and flatten-last
use crate::arena::{flush_tuple_queue, AbstractNode, NodeId, TupleArena};
use crate::error::{BavetError, Result};
use crate::fact::FactRef;
use crate::lifecycle::{NodeInput, Propagation, TupleLifecycle};
use crate::state::TupleState;
use crate::tuple::{Facts, StoreEntry, Tuple, TupleId};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// How a map node derives output facts from an input tuple.
#[derive(Clone)]
pub enum Mapper {
    /// Replaces the whole tuple with a single fact.
    Map(Rc<dyn Fn(&Tuple) -> FactRef>),
    /// Replaces the last fact with each item it expands to.
    FlattenLast(Rc<dyn Fn(&Tuple) -> Vec<FactRef>>),
}

impl Mapper {
    fn out_facts(&self, tuple: &Tuple) -> SmallVec<[Facts; 2]> {
        match self {
            Mapper::Map(map) => {
                let mut facts = Facts::new();
                facts.push(map(tuple));
                std::iter::once(facts).collect()
            }
            Mapper::FlattenLast(flatten) => {
                let prefix = &tuple.facts()[..tuple.arity().saturating_sub(1)];
                flatten(tuple)
                    .into_iter()
                    .map(|item| {
                        let mut facts: Facts = prefix.iter().cloned().collect();
                        facts.push(item);
                        facts
                    })
                    .collect()
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mapper::Map(_) => "Map",
            Mapper::FlattenLast(_) => "FlattenLast",
        }
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Derives new tuples from each input tuple. The outputs are owned by this
/// node and live exactly as long as the input that produced them.
pub struct MapNode {
    id: NodeId,
    mapper: Mapper,
    input_store_index: usize,
    output_store_size: usize,
    dirty_queue: VecDeque<TupleId>,
    next: Rc<TupleLifecycle>,
    live_outputs: usize,
}

impl MapNode {
    pub fn new(
        id: NodeId,
        mapper: Mapper,
        input_store_index: usize,
        output_store_size: usize,
        next: Rc<TupleLifecycle>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            id,
            mapper,
            input_store_index,
            output_store_size,
            dirty_queue: VecDeque::with_capacity(queue_capacity),
            next,
            live_outputs: 0,
        }
    }

    pub fn insert_tuple(&mut self, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        if tuples.store(tuple, self.input_store_index)?.is_some() {
            return Err(BavetError::double_insert(self.id, tuple));
        }
        let out_facts = self.mapper.out_facts(tuples.get(tuple)?);
        let mut outputs = SmallVec::new();
        for facts in out_facts {
            let out = tuples.create(facts, self.output_store_size)?;
            self.dirty_queue.push_back(out);
            self.live_outputs += 1;
            outputs.push(out);
        }
        tuples.set_store(tuple, self.input_store_index, StoreEntry::Mapped(outputs))
    }

    pub fn retract_tuple(&mut self, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let outputs = match tuples.take_store(tuple, self.input_store_index)? {
            // Filtered out upstream.
            None => return Ok(()),
            Some(StoreEntry::Mapped(outputs)) => outputs,
            Some(other) => {
                return Err(BavetError::consistency_violation(format!(
                    "map node ({}) found {:?} in the output slot of tuple ({:?})",
                    self.id, other, tuple
                )))
            }
        };
        for out in outputs {
            self.kill_tuple(out, tuples)?;
        }
        Ok(())
    }

    pub fn live_outputs(&self) -> usize {
        self.live_outputs
    }

    fn kill_tuple(&mut self, out: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let state = tuples.state(out)?;
        let transition = match state {
            TupleState::Aborting | TupleState::Dead => None,
            _ => state.invalidated(),
        };
        let (next, enqueue) = transition.ok_or_else(|| {
            BavetError::impossible_state(self.id, out, state, "killing a mapped tuple")
        })?;
        tuples.set_state(out, next)?;
        if enqueue {
            self.dirty_queue.push_back(out);
        }
        self.live_outputs -= 1;
        Ok(())
    }
}

impl AbstractNode for MapNode {
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
        flush_tuple_queue(self.id, &mut self.dirty_queue, tuples, propagations)
    }

    fn next_lifecycle(&self) -> Option<&Rc<TupleLifecycle>> {
        Some(&self.next)
    }

    fn dirty_count(&self) -> usize {
        self.dirty_queue.len()
    }
}

impl fmt::Debug for MapNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapNode")
            .field("id", &self.id)
            .field("mapper", &self.mapper)
            .field("live_outputs", &self.live_outputs)
            .field("dirty", &self.dirty_queue.len())
            .field("next", &self.next)
            .finish()
    }
}
