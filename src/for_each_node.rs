// for_each_node.rs - Fact source of a stream
use crate::arena::{flush_tuple_queue, AbstractNode, NodeId, TupleArena};
use crate::error::{BavetError, Result};
use crate::fact::FactRef;
use crate::lifecycle::{NodeInput, Propagation, TupleLifecycle};
use crate::tuple::{Facts, TupleId};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// Wraps each inserted fact of one type in a uni tuple it owns.
pub struct ForEachNode {
    id: NodeId,
    type_name: &'static str,
    output_store_size: usize,
    dirty_queue: VecDeque<TupleId>,
    next: Rc<TupleLifecycle>,
}

impl ForEachNode {
    pub fn new(
        id: NodeId,
        type_name: &'static str,
        output_store_size: usize,
        next: Rc<TupleLifecycle>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            id,
            type_name,
            output_store_size,
            dirty_queue: VecDeque::with_capacity(queue_capacity),
            next,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn insert_fact(&mut self, fact: FactRef, tuples: &mut TupleArena) -> Result<TupleId> {
        let mut facts = Facts::new();
        facts.push(fact);
        let tuple = tuples.create(facts, self.output_store_size)?;
        self.dirty_queue.push_back(tuple);
        Ok(tuple)
    }

    /// Replaces the fact; downstream sees a retract and an insert on flush.
    pub fn update_fact(
        &mut self,
        tuple: TupleId,
        fact: FactRef,
        tuples: &mut TupleArena,
    ) -> Result<()> {
        let state = tuples.state(tuple)?;
        let (next, enqueue) = state
            .updated()
            .ok_or_else(|| BavetError::impossible_state(self.id, tuple, state, "updating a fact"))?;
        if !tuples.get_mut(tuple)?.set_fact(0, fact) {
            return Err(BavetError::consistency_violation(format!(
                "for-each tuple ({:?}) of node ({}) has no fact",
                tuple, self.id
            )));
        }
        tuples.set_state(tuple, next)?;
        if enqueue {
            self.dirty_queue.push_back(tuple);
        }
        Ok(())
    }

    pub fn retract_fact(&mut self, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        let state = tuples.state(tuple)?;
        let (next, enqueue) = state.invalidated().ok_or_else(|| {
            BavetError::impossible_state(self.id, tuple, state, "retracting a fact")
        })?;
        tuples.set_state(tuple, next)?;
        if enqueue {
            self.dirty_queue.push_back(tuple);
        }
        Ok(())
    }
}

impl AbstractNode for ForEachNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn insert(&mut self, input: NodeInput, _tuple: TupleId, _tuples: &mut TupleArena) -> Result<()> {
        Err(BavetError::node_mismatch(
            self.id,
            format!("a {:?} insert into a for-each source", input),
        ))
    }

    fn retract(&mut self, input: NodeInput, _tuple: TupleId, _tuples: &mut TupleArena) -> Result<()> {
        Err(BavetError::node_mismatch(
            self.id,
            format!("a {:?} retract from a for-each source", input),
        ))
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

impl fmt::Debug for ForEachNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForEachNode")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("dirty", &self.dirty_queue.len())
            .field("next", &self.next)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TupleState;

    fn source() -> ForEachNode {
        ForEachNode::new(
            NodeId(0),
            "u32",
            1,
            TupleLifecycle::node(NodeId(1), NodeInput::Uni),
            8,
        )
    }

    fn flush(node: &mut ForEachNode, tuples: &mut TupleArena) -> Vec<Propagation> {
        let mut propagations = Vec::new();
        node.calculate_score(tuples, &mut propagations).unwrap();
        propagations
    }

    #[test]
    fn test_insert_update_retract() {
        let mut tuples = TupleArena::new();
        let mut node = source();
        let t = node.insert_fact(Rc::new(1u32), &mut tuples).unwrap();
        assert_eq!(tuples.store_size(t).unwrap(), 1);
        assert_eq!(flush(&mut node, &mut tuples), vec![Propagation::Insert(t)]);

        node.update_fact(t, Rc::new(2u32), &mut tuples).unwrap();
        node.update_fact(t, Rc::new(3u32), &mut tuples).unwrap();
        assert_eq!(node.dirty_count(), 1, "queued once");
        assert_eq!(
            flush(&mut node, &mut tuples),
            vec![Propagation::Retract(t), Propagation::Insert(t)]
        );
        assert_eq!(tuples.get(t).unwrap().fact::<u32>(0), Some(&3));

        node.retract_fact(t, &mut tuples).unwrap();
        assert_eq!(flush(&mut node, &mut tuples), vec![Propagation::Retract(t)]);
        assert_eq!(tuples.state(t).unwrap(), TupleState::Dead);
        assert!(matches!(
            node.update_fact(t, Rc::new(4u32), &mut tuples),
            Err(BavetError::ImpossibleState { .. })
        ));
    }

    #[test]
    fn test_insert_then_retract_is_silent() {
        let mut tuples = TupleArena::new();
        let mut node = source();
        let t = node.insert_fact(Rc::new(1u32), &mut tuples).unwrap();
        node.retract_fact(t, &mut tuples).unwrap();
        assert!(flush(&mut node, &mut tuples).is_empty());
        assert_eq!(tuples.release_dead(), 1);
    }

    #[test]
    fn test_rejects_upstream_input() {
        let mut tuples = TupleArena::new();
        let mut node = source();
        let t = node.insert_fact(Rc::new(1u32), &mut tuples).unwrap();
        assert!(node.insert(NodeInput::Uni, t, &mut tuples).is_err());
    }
}
