//error.rs
//! Error types for the Bavet constraint network.
//!
//! Apart from resource limits and API misuse (unknown fact types, stale
//! handles), every variant is an invariant violation: a bug in graph
//! construction or tuple bookkeeping. They abort the current operation and
//! carry the tuple, node and key involved.

use crate::arena::NodeId;
use crate::state::TupleState;
use crate::tuple::TupleId;
use thiserror::Error;

/// Result type alias for Bavet operations
pub type Result<T> = std::result::Result<T, BavetError>;

/// Main error type for Bavet operations
#[derive(Debug, Error)]
pub enum BavetError {
    #[error("Impossible state: the input for the tuple ({tuple:?}) was already added in the tuple store of node ({node}).")]
    DoubleInsert { node: NodeId, tuple: TupleId },

    #[error("Impossible state: the tuple ({tuple:?}) has no output tuple for its partner ({partner:?}) with key ({key}) in node ({node}).")]
    MissingOutTuple {
        node: NodeId,
        tuple: TupleId,
        partner: TupleId,
        key: String,
    },

    #[error("Impossible state: the tuple ({tuple:?}) in node ({node}) is in state ({state}) while {action}.")]
    ImpossibleState {
        node: NodeId,
        tuple: TupleId,
        state: TupleState,
        action: &'static str,
    },

    #[error("Impossible state: the group with key ({key}) is not in the group map of node ({node}).")]
    MissingGroup { node: NodeId, key: String },

    #[error("Impossible state: the tuple ({tuple:?}) is not indexed under key ({key}).")]
    MissingIndexEntry { tuple: TupleId, key: String },

    #[error("Impossible state: the tuple ({tuple:?}) is already indexed under key ({key}).")]
    DuplicateIndexEntry { tuple: TupleId, key: String },

    #[error("Impossible state: the tuple source stream ({stream}) is reserving a store after it has been extracted.")]
    StoreFrozen { stream: String },

    #[error("Store index {index} is out of bounds for tuple ({tuple:?}) with store size {size}.")]
    StoreIndexOutOfBounds {
        tuple: TupleId,
        index: usize,
        size: usize,
    },

    #[error("The tuple ({tuple:?}) is not in the tuple arena.")]
    InvalidTuple { tuple: TupleId },

    #[error("Node ({node}) cannot accept {input}.")]
    NodeMismatch { node: NodeId, input: String },

    #[error("Impossible state: none of the streams ({streams}) are active.")]
    InactiveStreams { streams: String },

    #[error("No insert/retract lifecycle registered for stream ({stream}).")]
    MissingLifecycle { stream: String },

    #[error("No for-each stream declared for type {type_name}")]
    UnregisteredType { type_name: &'static str },

    #[error("Fact handle not found: {details}")]
    FactNotFound { details: String },

    #[error("Type mismatch: {details}")]
    TypeMismatch { details: String },

    #[error("Resource limit exceeded: {limit_type} - {details}")]
    ResourceLimit { limit_type: String, details: String },

    #[error("Constraint building error: {details}")]
    ConstraintBuilder { details: String },

    #[error("Arithmetic overflow: {details}")]
    Overflow { details: String },

    #[error("Session is poisoned by an earlier failed flush: {cause}")]
    SessionPoisoned { cause: String },

    #[error("Consistency check failed: {details}")]
    ConsistencyViolation { details: String },
}

impl BavetError {
    pub fn double_insert(node: NodeId, tuple: TupleId) -> Self {
        Self::DoubleInsert { node, tuple }
    }

    pub fn impossible_state(
        node: NodeId,
        tuple: TupleId,
        state: TupleState,
        action: &'static str,
    ) -> Self {
        Self::ImpossibleState {
            node,
            tuple,
            state,
            action,
        }
    }

    pub fn missing_group(node: NodeId, key: impl std::fmt::Debug) -> Self {
        Self::MissingGroup {
            node,
            key: format!("{:?}", key),
        }
    }

    pub fn node_mismatch(node: NodeId, input: impl Into<String>) -> Self {
        Self::NodeMismatch {
            node,
            input: input.into(),
        }
    }

    pub fn fact_not_found(details: impl Into<String>) -> Self {
        Self::FactNotFound {
            details: details.into(),
        }
    }

    pub fn type_mismatch(details: impl Into<String>) -> Self {
        Self::TypeMismatch {
            details: details.into(),
        }
    }

    pub fn resource_limit(limit_type: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ResourceLimit {
            limit_type: limit_type.into(),
            details: details.into(),
        }
    }

    pub fn constraint_builder_error(details: impl Into<String>) -> Self {
        Self::ConstraintBuilder {
            details: details.into(),
        }
    }

    pub fn overflow(details: impl Into<String>) -> Self {
        Self::Overflow {
            details: details.into(),
        }
    }

    pub fn consistency_violation(details: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            details: details.into(),
        }
    }

    /// True for errors that signal corrupted network bookkeeping rather than API misuse.
    pub fn is_invariant_violation(&self) -> bool {
        !matches!(
            self,
            Self::UnregisteredType { .. }
                | Self::FactNotFound { .. }
                | Self::TypeMismatch { .. }
                | Self::ResourceLimit { .. }
                | Self::ConstraintBuilder { .. }
                | Self::Overflow { .. }
                | Self::SessionPoisoned { .. }
        )
    }
}
