// lifecycle.rs - Downstream insert/retract wiring
use crate::arena::NodeId;
use crate::tuple::{Tuple, TupleId};
use std::fmt;
use std::rc::Rc;

pub type Predicate = Rc<dyn Fn(&Tuple) -> bool>;

/// Which input of a node a lifecycle feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeInput {
    Uni,
    Left,
    Right,
}

/// A single downstream call produced by a node flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Insert(TupleId),
    Retract(TupleId),
}

impl Propagation {
    #[inline]
    pub fn tuple(&self) -> TupleId {
        match self {
            Propagation::Insert(tuple) | Propagation::Retract(tuple) => *tuple,
        }
    }
}

/// Where a node sends its inserts and retracts, resolved at build time.
///
/// Nodes are referenced by id rather than by pointer; the node arena resolves
/// them while dispatching.
pub enum TupleLifecycle {
    Node { node: NodeId, input: NodeInput },
    /// Conditional pass-through. Inserts go on only if the predicate holds;
    /// retracts always go on, and nodes ignore retracts of tuples they never saw.
    Filter {
        predicate: Predicate,
        next: Rc<TupleLifecycle>,
    },
    /// Fan-out to several consumers, called in registration order.
    Aggregated(Box<[Rc<TupleLifecycle>]>),
}

impl TupleLifecycle {
    pub fn node(node: NodeId, input: NodeInput) -> Rc<Self> {
        Rc::new(TupleLifecycle::Node { node, input })
    }

    pub fn filter(predicate: Predicate, next: Rc<TupleLifecycle>) -> Rc<Self> {
        Rc::new(TupleLifecycle::Filter { predicate, next })
    }

    pub fn aggregate(lifecycles: Vec<Rc<TupleLifecycle>>) -> Rc<Self> {
        Rc::new(TupleLifecycle::Aggregated(lifecycles.into_boxed_slice()))
    }

    /// Node inputs reachable from this lifecycle, in call order.
    pub fn targets(&self) -> Vec<(NodeId, NodeInput)> {
        let mut targets = Vec::new();
        self.collect_targets(&mut targets);
        targets
    }

    fn collect_targets(&self, targets: &mut Vec<(NodeId, NodeInput)>) {
        match self {
            TupleLifecycle::Node { node, input } => targets.push((*node, *input)),
            TupleLifecycle::Filter { next, .. } => next.collect_targets(targets),
            TupleLifecycle::Aggregated(lifecycles) => {
                for lifecycle in lifecycles.iter() {
                    lifecycle.collect_targets(targets);
                }
            }
        }
    }
}

impl fmt::Debug for TupleLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TupleLifecycle::Node { node, input } => f
                .debug_struct("Node")
                .field("node", node)
                .field("input", input)
                .finish(),
            TupleLifecycle::Filter { next, .. } => f
                .debug_struct("Filter")
                .field("predicate", &"<function>")
                .field("next", next)
                .finish(),
            TupleLifecycle::Aggregated(lifecycles) => {
                f.debug_tuple("Aggregated").field(lifecycles).finish()
            }
        }
    }
}
