//stream_def.rs
use crate::collectors::Collector;
use crate::constraint::ImpactType;
use crate::joiner::{Joiners, KeyExtractor};
use crate::lifecycle::{NodeInput, Predicate};
use crate::map_node::Mapper;
use crate::score::Score;
use crate::scoring_node::MatchWeigher;
use smallvec::{smallvec, SmallVec};
use std::any::TypeId;
use std::fmt;

/// Handle of a stream declared on a constraint factory, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) usize);

impl StreamId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// A consumer of a stream and the input it feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildLink {
    pub child: StreamId,
    pub input: NodeInput,
}

pub enum StreamKind<S: Score> {
    ForEach {
        type_id: TypeId,
        type_name: &'static str,
    },
    Filter {
        parent: StreamId,
        predicate: Predicate,
    },
    Join {
        left: StreamId,
        right: StreamId,
        joiners: Joiners,
    },
    IfExists {
        left: StreamId,
        right: StreamId,
        joiners: Joiners,
        should_exist: bool,
    },
    Group {
        parent: StreamId,
        key: Option<KeyExtractor>,
        collectors: Vec<Collector>,
    },
    Map {
        parent: StreamId,
        mapper: Mapper,
    },
    Scoring {
        parent: StreamId,
        constraint_name: String,
        weight: S,
        impact_type: ImpactType,
        weigher: Option<MatchWeigher>,
    },
}

/// One declared stream.
pub struct StreamDefinition<S: Score> {
    pub id: StreamId,
    pub kind: StreamKind<S>,
}

impl<S: Score> StreamDefinition<S> {
    /// Upstream streams and the input of this stream each one feeds.
    pub fn parents(&self) -> SmallVec<[(StreamId, NodeInput); 2]> {
        match &self.kind {
            StreamKind::ForEach { .. } => SmallVec::new(),
            StreamKind::Filter { parent, .. }
            | StreamKind::Group { parent, .. }
            | StreamKind::Map { parent, .. }
            | StreamKind::Scoring { parent, .. } => smallvec![(*parent, NodeInput::Uni)],
            StreamKind::Join { left, right, .. } | StreamKind::IfExists { left, right, .. } => {
                smallvec![(*left, NodeInput::Left), (*right, NodeInput::Right)]
            }
        }
    }

    /// Whether tuples leaving this stream are created by its own node.
    pub fn is_tuple_source(&self) -> bool {
        matches!(
            self.kind,
            StreamKind::ForEach { .. }
                | StreamKind::Join { .. }
                | StreamKind::Group { .. }
                | StreamKind::Map { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StreamKind::ForEach { .. } => "ForEach",
            StreamKind::Filter { .. } => "Filter",
            StreamKind::Join { .. } => "Join",
            StreamKind::IfExists {
                should_exist: true, ..
            } => "IfExists",
            StreamKind::IfExists { .. } => "IfNotExists",
            StreamKind::Group { .. } => "Group",
            StreamKind::Map { ref mapper, .. } => mapper.name(),
            StreamKind::Scoring { .. } => "Scoring",
        }
    }
}

impl<S: Score> fmt::Debug for StreamDefinition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("StreamDefinition");
        debug.field("id", &self.id).field("kind", &self.kind_name());
        match &self.kind {
            StreamKind::ForEach { type_name, .. } => debug.field("type_name", type_name),
            StreamKind::Scoring {
                constraint_name, ..
            } => debug.field("constraint_name", constraint_name),
            _ => debug.field("parents", &self.parents()),
        };
        debug.finish()
    }
}
