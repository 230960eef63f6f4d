// node_build_helper.rs - Bookkeeping while a network is built
use crate::arena::{NodeData, NodeId};
use crate::error::{BavetError, Result};
use crate::lifecycle::{NodeInput, TupleLifecycle};
use crate::score::Score;
use crate::stream_def::{ChildLink, StreamId};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::hash_map::Entry;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreCounter {
    /// Next index to hand out.
    Open(usize),
    /// Size returned by the extraction.
    Frozen(usize),
}

/// Collects nodes, lifecycles and extension slot sizes while the streams are
/// built children first.
pub struct NodeBuildHelper<S: Score> {
    active_streams: HashSet<StreamId>,
    store_counters: HashMap<StreamId, StoreCounter>,
    lifecycles: HashMap<(StreamId, NodeInput), Rc<TupleLifecycle>>,
    nodes: Vec<NodeData<S>>,
    next_node_id: usize,
}

impl<S: Score> NodeBuildHelper<S> {
    pub fn new(active_streams: HashSet<StreamId>) -> Self {
        Self {
            active_streams,
            store_counters: HashMap::default(),
            lifecycles: HashMap::default(),
            nodes: Vec::new(),
            next_node_id: 0,
        }
    }

    #[inline]
    pub fn is_stream_active(&self, stream: StreamId) -> bool {
        self.active_streams.contains(&stream)
    }

    /// Hands out the next extension slot of tuples created by `source`.
    pub fn reserve_tuple_store_index(&mut self, source: StreamId) -> Result<usize> {
        let counter = self
            .store_counters
            .entry(source)
            .or_insert(StoreCounter::Open(0));
        match *counter {
            StoreCounter::Open(index) => {
                *counter = StoreCounter::Open(index + 1);
                Ok(index)
            }
            StoreCounter::Frozen(_) => Err(BavetError::StoreFrozen {
                stream: source.to_string(),
            }),
        }
    }

    /// Freezes the slot count of `source` and returns it.
    pub fn extract_tuple_store_size(&mut self, source: StreamId) -> usize {
        let counter = self
            .store_counters
            .entry(source)
            .or_insert(StoreCounter::Open(0));
        let size = match *counter {
            StoreCounter::Open(size) | StoreCounter::Frozen(size) => size,
        };
        *counter = StoreCounter::Frozen(size);
        size
    }

    /// Registers how to deliver inserts and retracts into `input` of `stream`.
    pub fn put_insert_retract(
        &mut self,
        stream: StreamId,
        input: NodeInput,
        lifecycle: Rc<TupleLifecycle>,
    ) -> Result<()> {
        match self.lifecycles.entry((stream, input)) {
            Entry::Occupied(_) => Err(BavetError::consistency_violation(format!(
                "a lifecycle for ({}, {:?}) is already registered",
                stream, input
            ))),
            Entry::Vacant(entry) => {
                entry.insert(lifecycle);
                Ok(())
            }
        }
    }

    /// Lifecycle feeding every active consumer in `children`, in order.
    pub fn aggregated_lifecycle(&self, children: &[ChildLink]) -> Result<Rc<TupleLifecycle>> {
        let mut lifecycles = Vec::with_capacity(children.len());
        for link in children {
            if !self.is_stream_active(link.child) {
                continue;
            }
            let lifecycle = self
                .lifecycles
                .get(&(link.child, link.input))
                .ok_or_else(|| BavetError::MissingLifecycle {
                    stream: format!("{} {:?}", link.child, link.input),
                })?;
            lifecycles.push(lifecycle.clone());
        }
        match lifecycles.len() {
            0 => Err(BavetError::InactiveStreams {
                streams: children
                    .iter()
                    .map(|link| link.child.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
            1 => Ok(lifecycles.swap_remove(0)),
            _ => Ok(TupleLifecycle::aggregate(lifecycles)),
        }
    }

    /// Id for the next node; ids follow build order.
    pub fn next_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    pub fn add_node(&mut self, node: NodeData<S>) {
        self.nodes.push(node);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes in flush order: the reverse of build order.
    pub fn destroy_and_get_node_list(self) -> Vec<NodeData<S>> {
        let mut nodes = self.nodes;
        nodes.reverse();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::AbstractNode;
    use crate::constraint::ImpactType;
    use crate::score::SimpleScore;
    use crate::scoring_node::ScoringNode;

    fn helper(active: &[usize]) -> NodeBuildHelper<SimpleScore> {
        NodeBuildHelper::new(active.iter().map(|&i| StreamId(i)).collect())
    }

    fn link(child: usize) -> ChildLink {
        ChildLink {
            child: StreamId(child),
            input: NodeInput::Uni,
        }
    }

    // --- Store Index Tests ---

    #[test]
    fn test_reserve_then_freeze() {
        let mut helper = helper(&[]);
        let source = StreamId(0);
        assert_eq!(helper.reserve_tuple_store_index(source).unwrap(), 0);
        assert_eq!(helper.reserve_tuple_store_index(source).unwrap(), 1);
        assert_eq!(helper.reserve_tuple_store_index(StreamId(1)).unwrap(), 0);

        assert_eq!(helper.extract_tuple_store_size(source), 2);
        assert!(matches!(
            helper.reserve_tuple_store_index(source),
            Err(BavetError::StoreFrozen { .. })
        ));
        assert_eq!(helper.extract_tuple_store_size(StreamId(7)), 0, "never reserved");
    }

    // --- Lifecycle Tests ---

    #[test]
    fn test_aggregation_skips_inactive_and_keeps_order() {
        let mut helper = helper(&[1, 2, 4]);
        for (stream, node) in [(1, 10), (2, 20), (4, 40)] {
            helper
                .put_insert_retract(
                    StreamId(stream),
                    NodeInput::Uni,
                    TupleLifecycle::node(NodeId(node), NodeInput::Uni),
                )
                .unwrap();
        }

        let single = helper.aggregated_lifecycle(&[link(3), link(2)]).unwrap();
        assert_eq!(single.targets(), vec![(NodeId(20), NodeInput::Uni)]);
        assert!(matches!(*single, TupleLifecycle::Node { .. }));

        let fan_out = helper
            .aggregated_lifecycle(&[link(4), link(3), link(1)])
            .unwrap();
        assert_eq!(
            fan_out.targets(),
            vec![(NodeId(40), NodeInput::Uni), (NodeId(10), NodeInput::Uni)]
        );

        assert!(matches!(
            helper.aggregated_lifecycle(&[link(3)]),
            Err(BavetError::InactiveStreams { .. })
        ));
        assert!(helper
            .put_insert_retract(
                StreamId(1),
                NodeInput::Uni,
                TupleLifecycle::node(NodeId(0), NodeInput::Uni)
            )
            .is_err());
    }

    #[test]
    fn test_active_child_without_lifecycle() {
        let helper = helper(&[5]);
        assert!(matches!(
            helper.aggregated_lifecycle(&[link(5)]),
            Err(BavetError::MissingLifecycle { .. })
        ));
    }

    // --- Node List Tests ---

    #[test]
    fn test_node_list_is_reversed() {
        let mut helper = helper(&[]);
        for name in ["first", "second", "third"] {
            let id = helper.next_node_id();
            helper.add_node(NodeData::Scoring(ScoringNode::new(
                id,
                name,
                SimpleScore::ONE,
                ImpactType::Penalty,
                None,
                0,
            )));
        }
        assert_eq!(helper.node_count(), 3);
        let ids: Vec<_> = helper
            .destroy_and_get_node_list()
            .iter()
            .map(|node| node.as_node().id())
            .collect();
        assert_eq!(ids, vec![NodeId(2), NodeId(1), NodeId(0)]);
    }
}
