// lib.rs - Main library file
//!
//! Bavet: an incremental constraint network. Constraint streams are declared
//! on a [`ConstraintFactory`], built into a node graph, and evaluated by a
//! [`Session`] that only recomputes what changed since the last flush.

pub mod analysis;
pub mod arena;
pub mod collectors;
pub mod constraint;
pub mod error;
pub mod fact;
pub mod factory;
pub mod for_each_node;
pub mod group_node;
pub mod if_exists_node;
pub mod index_properties;
pub mod indexer;
pub mod join_node;
pub mod joiner;
pub mod joiner_utils;
pub mod lifecycle;
pub mod map_node;
pub mod node_build_helper;
pub mod resource_limits;
pub mod score;
pub mod scoring_node;
pub mod session;
pub mod state;
pub mod stream_def;
pub mod tuple;

// Re-export core types for easier access from outside the crate.
pub use analysis::{ConstraintAnalysis, ConstraintViolationReport, NetworkStatistics};
pub use arena::{AbstractNode, NodeArena, NodeId, TupleArena};
pub use collectors::{Collector, Collectors};
pub use constraint::{ConstraintMatchTotal, ImpactType};
pub use error::{BavetError, Result};
pub use fact::{downcast_fact, Fact, FactRef};
pub use factory::ConstraintFactory;
pub use index_properties::{IndexKey, IndexProperties};
pub use joiner::Joiners;
pub use map_node::Mapper;
pub use resource_limits::ResourceLimits;
pub use score::{HardSoftScore, Score, SimpleScore};
pub use session::{FactHandle, Session};
pub use state::TupleState;
pub use stream_def::StreamId;
pub use tuple::{Tuple, TupleId};

/// A "prelude" module for easily importing the most commonly used types.
pub mod prelude {
    pub use crate::{
        BavetError, Collectors, ConstraintFactory, FactHandle, HardSoftScore, IndexKey, Joiners,
        ResourceLimits, Result, Score, Session, SimpleScore, StreamId, Tuple,
    };
}
