//factory.rs
use crate::arena::{NodeArena, NodeData};
use crate::collectors::Collector;
use crate::constraint::ImpactType;
use crate::error::{BavetError, Result};
use crate::fact::{Fact, FactRef};
use crate::for_each_node::ForEachNode;
use crate::group_node::GroupNode;
use crate::if_exists_node::IfExistsNode;
use crate::index_properties::IndexKey;
use crate::join_node::JoinNode;
use crate::joiner::{Joiners, KeyExtractor};
use crate::joiner_utils::JoinerUtils;
use crate::lifecycle::{NodeInput, TupleLifecycle};
use crate::map_node::{MapNode, Mapper};
use crate::node_build_helper::NodeBuildHelper;
use crate::resource_limits::ResourceLimits;
use crate::score::Score;
use crate::scoring_node::{MatchWeigher, ScoringNode};
use crate::session::Session;
use crate::stream_def::{ChildLink, StreamDefinition, StreamId, StreamKind};
use crate::tuple::Tuple;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::any::{type_name, TypeId};
use std::rc::Rc;
use tracing::debug;

/// Declares streams and constraints, then builds sessions from them.
///
/// Streams are identified by the [`StreamId`] each method returns. A stream
/// only becomes part of a session if some constraint consumes it.
pub struct ConstraintFactory<S: Score> {
    streams: Vec<StreamDefinition<S>>,
    children: Vec<Vec<ChildLink>>,
    for_each_streams: HashMap<TypeId, StreamId>,
    constraint_names: HashSet<String>,
    limits: ResourceLimits,
}

impl<S: Score> ConstraintFactory<S> {
    pub fn new() -> Self {
        Self::with_limits(ResourceLimits::default())
    }

    pub fn with_limits(limits: ResourceLimits) -> Self {
        Self {
            streams: Vec::new(),
            children: Vec::new(),
            for_each_streams: HashMap::default(),
            constraint_names: HashSet::default(),
            limits,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn add_stream(&mut self, kind: StreamKind<S>) -> StreamId {
        let id = StreamId(self.streams.len());
        let definition = StreamDefinition { id, kind };
        for (parent, input) in definition.parents() {
            if let Some(children) = self.children.get_mut(parent.0) {
                children.push(ChildLink { child: id, input });
            }
        }
        self.streams.push(definition);
        self.children.push(Vec::new());
        id
    }

    /// Every inserted fact of type `T`. Declaring the same type twice
    /// returns the same stream.
    pub fn for_each<T: Fact>(&mut self) -> StreamId {
        let type_id = TypeId::of::<T>();
        if let Some(&stream) = self.for_each_streams.get(&type_id) {
            return stream;
        }
        let stream = self.add_stream(StreamKind::ForEach {
            type_id,
            type_name: type_name::<T>(),
        });
        self.for_each_streams.insert(type_id, stream);
        stream
    }

    pub fn filter(
        &mut self,
        parent: StreamId,
        predicate: impl Fn(&Tuple) -> bool + 'static,
    ) -> StreamId {
        self.add_stream(StreamKind::Filter {
            parent,
            predicate: Rc::new(predicate),
        })
    }

    /// Pairs of left and right tuples whose joiner keys are all equal.
    pub fn join(&mut self, left: StreamId, right: StreamId, joiners: Joiners) -> StreamId {
        self.add_stream(StreamKind::Join {
            left,
            right,
            joiners,
        })
    }

    /// Left tuples that have at least one matching right tuple.
    pub fn if_exists(&mut self, left: StreamId, right: StreamId, joiners: Joiners) -> StreamId {
        self.add_stream(StreamKind::IfExists {
            left,
            right,
            joiners,
            should_exist: true,
        })
    }

    /// Left tuples that have no matching right tuple.
    pub fn if_not_exists(
        &mut self,
        left: StreamId,
        right: StreamId,
        joiners: Joiners,
    ) -> StreamId {
        self.add_stream(StreamKind::IfExists {
            left,
            right,
            joiners,
            should_exist: false,
        })
    }

    /// One `[key, result]` tuple per distinct key. Return a 2- or 3-tuple
    /// from `key` to group on several values at once.
    pub fn group_by<K, F>(&mut self, parent: StreamId, key: F, collector: Collector) -> StreamId
    where
        K: Into<IndexKey>,
        F: Fn(&Tuple) -> K + 'static,
    {
        self.group_by_collect(parent, key, vec![collector])
    }

    /// One `[key, result...]` tuple per distinct key, one result per collector.
    pub fn group_by_collect<K, F>(
        &mut self,
        parent: StreamId,
        key: F,
        collectors: Vec<Collector>,
    ) -> StreamId
    where
        K: Into<IndexKey>,
        F: Fn(&Tuple) -> K + 'static,
    {
        self.add_stream(StreamKind::Group {
            parent,
            key: Some(key_extractor(key)),
            collectors,
        })
    }

    /// A single `[result]` tuple over the whole stream, present while the
    /// stream is non-empty.
    pub fn group(&mut self, parent: StreamId, collector: Collector) -> StreamId {
        self.group_collect(parent, vec![collector])
    }

    pub fn group_collect(&mut self, parent: StreamId, collectors: Vec<Collector>) -> StreamId {
        self.add_stream(StreamKind::Group {
            parent,
            key: None,
            collectors,
        })
    }

    /// One `[key]` tuple per distinct key.
    pub fn distinct_by<K, F>(&mut self, parent: StreamId, key: F) -> StreamId
    where
        K: Into<IndexKey>,
        F: Fn(&Tuple) -> K + 'static,
    {
        self.group_by_collect(parent, key, Vec::new())
    }

    /// Replaces every tuple with the single fact `mapper` returns.
    pub fn map<T, F>(&mut self, parent: StreamId, mapper: F) -> StreamId
    where
        T: Fact,
        F: Fn(&Tuple) -> T + 'static,
    {
        let mapper = Mapper::Map(Rc::new(move |tuple: &Tuple| -> FactRef {
            Rc::new(mapper(tuple))
        }));
        self.add_stream(StreamKind::Map { parent, mapper })
    }

    /// Replaces the last fact of every tuple with each item `mapper` returns,
    /// one output tuple per item.
    pub fn flatten_last<T, I, F>(&mut self, parent: StreamId, mapper: F) -> StreamId
    where
        T: Fact,
        I: IntoIterator<Item = T>,
        F: Fn(&Tuple) -> I + 'static,
    {
        let mapper = Mapper::FlattenLast(Rc::new(move |tuple: &Tuple| -> Vec<FactRef> {
            mapper(tuple)
                .into_iter()
                .map(|item| Rc::new(item) as FactRef)
                .collect()
        }));
        self.add_stream(StreamKind::Map { parent, mapper })
    }

    pub fn penalize(&mut self, parent: StreamId, name: &str, weight: S) -> Result<()> {
        self.add_constraint(parent, name, weight, ImpactType::Penalty, None)
    }

    /// Penalizes each match by `weight` times the weigher's result.
    pub fn penalize_weighted(
        &mut self,
        parent: StreamId,
        name: &str,
        weight: S,
        weigher: impl Fn(&Tuple) -> i64 + 'static,
    ) -> Result<()> {
        self.add_constraint(parent, name, weight, ImpactType::Penalty, Some(Rc::new(weigher)))
    }

    pub fn reward(&mut self, parent: StreamId, name: &str, weight: S) -> Result<()> {
        self.add_constraint(parent, name, weight, ImpactType::Reward, None)
    }

    pub fn reward_weighted(
        &mut self,
        parent: StreamId,
        name: &str,
        weight: S,
        weigher: impl Fn(&Tuple) -> i64 + 'static,
    ) -> Result<()> {
        self.add_constraint(parent, name, weight, ImpactType::Reward, Some(Rc::new(weigher)))
    }

    fn add_constraint(
        &mut self,
        parent: StreamId,
        name: &str,
        weight: S,
        impact_type: ImpactType,
        weigher: Option<MatchWeigher>,
    ) -> Result<()> {
        if parent.0 >= self.streams.len() {
            return Err(BavetError::constraint_builder_error(format!(
                "constraint ({}) consumes unknown stream ({})",
                name, parent
            )));
        }
        if !self.constraint_names.insert(name.to_string()) {
            return Err(BavetError::constraint_builder_error(format!(
                "constraint ({}) is declared twice",
                name
            )));
        }
        self.add_stream(StreamKind::Scoring {
            parent,
            constraint_name: name.to_string(),
            weight,
            impact_type,
            weigher,
        });
        Ok(())
    }

    pub fn constraint_count(&self) -> usize {
        self.constraint_names.len()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Streams some constraint depends on.
    fn active_streams(&self) -> HashSet<StreamId> {
        let mut active = HashSet::default();
        let mut pending: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|stream| matches!(stream.kind, StreamKind::Scoring { .. }))
            .map(|stream| stream.id)
            .collect();
        while let Some(stream) = pending.pop() {
            if active.insert(stream) {
                pending.extend(self.streams[stream.0].parents().iter().map(|&(parent, _)| parent));
            }
        }
        active
    }

    /// Every parent must be declared before its child.
    fn validate(&self) -> Result<()> {
        for stream in &self.streams {
            if let StreamKind::Group {
                key: None,
                collectors,
                ..
            } = &stream.kind
            {
                if collectors.is_empty() {
                    return Err(BavetError::constraint_builder_error(format!(
                        "{} groups without a key or a collector",
                        stream.id
                    )));
                }
            }
            for (parent, _) in stream.parents() {
                if parent >= stream.id {
                    return Err(BavetError::constraint_builder_error(format!(
                        "{} ({}) consumes unknown stream ({})",
                        stream.id,
                        stream.kind_name(),
                        parent
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stream whose node creates the tuples leaving `stream`.
    fn tuple_source(&self, stream: StreamId) -> StreamId {
        let mut current = stream;
        loop {
            let definition = &self.streams[current.0];
            if definition.is_tuple_source() {
                return current;
            }
            // Pass-through streams hand on the tuples of their first parent.
            match definition.parents().first() {
                Some(&(parent, _)) => current = parent,
                None => return current,
            }
        }
    }

    /// Builds the node network of every active stream into a new session.
    ///
    /// Streams are built children first, so by the time a tuple source
    /// extracts its slot count every consumer has reserved its slots.
    pub fn build_session(&self) -> Result<Session<S>> {
        self.limits.validate()?;
        self.validate()?;
        if self.constraint_names.is_empty() {
            return Err(BavetError::constraint_builder_error(
                "no constraints declared",
            ));
        }
        let active = self.active_streams();
        let mut helper: NodeBuildHelper<S> = NodeBuildHelper::new(active);
        let queue_capacity = self.limits.dirty_queue_capacity;
        let mut for_each_nodes = HashMap::default();
        let mut scoring_nodes = Vec::new();

        for stream in self.streams.iter().rev() {
            let id = stream.id;
            if !helper.is_stream_active(id) {
                if let StreamKind::ForEach { type_id, .. } = stream.kind {
                    for_each_nodes.insert(type_id, None);
                }
                continue;
            }
            let children = &self.children[id.0];
            match &stream.kind {
                StreamKind::Scoring {
                    parent,
                    constraint_name,
                    weight,
                    impact_type,
                    weigher,
                } => {
                    let store_index =
                        helper.reserve_tuple_store_index(self.tuple_source(*parent))?;
                    let node_id = helper.next_node_id();
                    helper.add_node(NodeData::Scoring(ScoringNode::new(
                        node_id,
                        constraint_name.clone(),
                        *weight,
                        *impact_type,
                        weigher.clone(),
                        store_index,
                    )));
                    helper.put_insert_retract(
                        id,
                        NodeInput::Uni,
                        TupleLifecycle::node(node_id, NodeInput::Uni),
                    )?;
                    scoring_nodes.push(node_id);
                }
                StreamKind::Filter { predicate, .. } => {
                    let next = helper.aggregated_lifecycle(children)?;
                    helper.put_insert_retract(
                        id,
                        NodeInput::Uni,
                        TupleLifecycle::filter(predicate.clone(), next),
                    )?;
                }
                StreamKind::Join {
                    left,
                    right,
                    joiners,
                } => {
                    let store_left = helper.reserve_tuple_store_index(self.tuple_source(*left))?;
                    let store_right =
                        helper.reserve_tuple_store_index(self.tuple_source(*right))?;
                    let output_store_size = helper.extract_tuple_store_size(id);
                    let next = helper.aggregated_lifecycle(children)?;
                    let node_id = helper.next_node_id();
                    helper.add_node(NodeData::Join(JoinNode::new(
                        node_id,
                        JoinerUtils::combine_left_mappings(joiners),
                        JoinerUtils::combine_right_mappings(joiners),
                        store_left,
                        store_right,
                        output_store_size,
                        joiners.len(),
                        next,
                        queue_capacity,
                    )));
                    helper.put_insert_retract(
                        id,
                        NodeInput::Left,
                        TupleLifecycle::node(node_id, NodeInput::Left),
                    )?;
                    helper.put_insert_retract(
                        id,
                        NodeInput::Right,
                        TupleLifecycle::node(node_id, NodeInput::Right),
                    )?;
                }
                StreamKind::IfExists {
                    left,
                    right,
                    joiners,
                    should_exist,
                } => {
                    let left_source = self.tuple_source(*left);
                    let store_left_key = helper.reserve_tuple_store_index(left_source)?;
                    let store_left_counter = helper.reserve_tuple_store_index(left_source)?;
                    let store_right_key =
                        helper.reserve_tuple_store_index(self.tuple_source(*right))?;
                    let next = helper.aggregated_lifecycle(children)?;
                    let node_id = helper.next_node_id();
                    helper.add_node(NodeData::IfExists(IfExistsNode::new(
                        node_id,
                        *should_exist,
                        JoinerUtils::combine_left_mappings(joiners),
                        JoinerUtils::combine_right_mappings(joiners),
                        store_left_key,
                        store_left_counter,
                        store_right_key,
                        joiners.len(),
                        next,
                        queue_capacity,
                    )));
                    helper.put_insert_retract(
                        id,
                        NodeInput::Left,
                        TupleLifecycle::node(node_id, NodeInput::Left),
                    )?;
                    helper.put_insert_retract(
                        id,
                        NodeInput::Right,
                        TupleLifecycle::node(node_id, NodeInput::Right),
                    )?;
                }
                StreamKind::Group {
                    parent,
                    key,
                    collectors,
                } => {
                    let store_index =
                        helper.reserve_tuple_store_index(self.tuple_source(*parent))?;
                    let output_store_size = helper.extract_tuple_store_size(id);
                    let next = helper.aggregated_lifecycle(children)?;
                    let node_id = helper.next_node_id();
                    helper.add_node(NodeData::Group(GroupNode::new(
                        node_id,
                        key.clone(),
                        collectors.clone(),
                        store_index,
                        output_store_size,
                        next,
                        queue_capacity,
                    )));
                    helper.put_insert_retract(
                        id,
                        NodeInput::Uni,
                        TupleLifecycle::node(node_id, NodeInput::Uni),
                    )?;
                }
                StreamKind::Map { parent, mapper } => {
                    let store_index =
                        helper.reserve_tuple_store_index(self.tuple_source(*parent))?;
                    let output_store_size = helper.extract_tuple_store_size(id);
                    let next = helper.aggregated_lifecycle(children)?;
                    let node_id = helper.next_node_id();
                    helper.add_node(NodeData::Map(MapNode::new(
                        node_id,
                        mapper.clone(),
                        store_index,
                        output_store_size,
                        next,
                        queue_capacity,
                    )));
                    helper.put_insert_retract(
                        id,
                        NodeInput::Uni,
                        TupleLifecycle::node(node_id, NodeInput::Uni),
                    )?;
                }
                StreamKind::ForEach { type_id, type_name } => {
                    let output_store_size = helper.extract_tuple_store_size(id);
                    let next = helper.aggregated_lifecycle(children)?;
                    let node_id = helper.next_node_id();
                    helper.add_node(NodeData::ForEach(ForEachNode::new(
                        node_id,
                        *type_name,
                        output_store_size,
                        next,
                        queue_capacity,
                    )));
                    for_each_nodes.insert(*type_id, Some(node_id));
                }
            }
        }

        let node_count = helper.node_count();
        let nodes = NodeArena::new(helper.destroy_and_get_node_list())?;
        debug!(
            event = "network_built",
            streams = self.streams.len(),
            nodes = node_count,
            constraints = scoring_nodes.len(),
        );
        Ok(Session::new(
            nodes,
            for_each_nodes,
            scoring_nodes,
            self.limits.clone(),
        ))
    }
}

impl<S: Score> Default for ConstraintFactory<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn key_extractor<K, F>(key: F) -> KeyExtractor
where
    K: Into<IndexKey>,
    F: Fn(&Tuple) -> K + 'static,
{
    Rc::new(move |tuple| key(tuple).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::Collectors;
    use crate::score::SimpleScore;

    #[derive(Debug)]
    struct Lesson {
        room: u32,
    }

    #[derive(Debug)]
    struct Room {
        id: u32,
    }

    fn room_of(t: &Tuple) -> Option<u32> {
        t.fact::<Lesson>(0).map(|lesson| lesson.room)
    }

    // --- Stream Declaration Tests ---

    #[test]
    fn test_for_each_is_shared_per_type() {
        let mut factory: ConstraintFactory<SimpleScore> = ConstraintFactory::new();
        let a = factory.for_each::<Lesson>();
        let b = factory.for_each::<Lesson>();
        let c = factory.for_each::<Room>();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(factory.stream_count(), 2);
    }

    #[test]
    fn test_self_join_registers_both_inputs() {
        let mut factory: ConstraintFactory<SimpleScore> = ConstraintFactory::new();
        let lessons = factory.for_each::<Lesson>();
        let pairs = factory.join(lessons, lessons, Joiners::new().equal(room_of, room_of));
        assert_eq!(
            factory.children[lessons.0],
            vec![
                ChildLink {
                    child: pairs,
                    input: NodeInput::Left
                },
                ChildLink {
                    child: pairs,
                    input: NodeInput::Right
                },
            ]
        );
    }

    #[test]
    fn test_active_streams_and_tuple_sources() {
        let mut factory: ConstraintFactory<SimpleScore> = ConstraintFactory::new();
        let lessons = factory.for_each::<Lesson>();
        let rooms = factory.for_each::<Room>();
        let unused = factory.filter(rooms, |_| true);
        let placed = factory.filter(lessons, |t| room_of(t).is_some());
        let orphans = factory.if_not_exists(
            placed,
            rooms,
            Joiners::new().equal(room_of, |t: &Tuple| t.fact::<Room>(0).map(|room| room.id)),
        );
        let per_room = factory.group_by(orphans, room_of, Collectors::count());
        factory.penalize(per_room, "orphans", SimpleScore::ONE).unwrap();

        let active = factory.active_streams();
        assert!(active.contains(&lessons) && active.contains(&rooms));
        assert!(!active.contains(&unused));
        assert_eq!(factory.tuple_source(orphans), lessons);
        assert_eq!(factory.tuple_source(per_room), per_room);
    }

    // --- Build Tests ---

    #[test]
    fn test_duplicate_constraint_name() {
        let mut factory: ConstraintFactory<SimpleScore> = ConstraintFactory::new();
        let lessons = factory.for_each::<Lesson>();
        factory.penalize(lessons, "c", SimpleScore::ONE).unwrap();
        assert!(matches!(
            factory.reward(lessons, "c", SimpleScore::ONE),
            Err(BavetError::ConstraintBuilder { .. })
        ));
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let mut factory: ConstraintFactory<SimpleScore> = ConstraintFactory::new();
        let lessons = factory.for_each::<Lesson>();
        let bogus = factory.filter(StreamId(42), |_| true);
        factory.penalize(bogus, "bogus", SimpleScore::ONE).unwrap();
        factory.penalize(lessons, "fine", SimpleScore::ONE).unwrap();
        assert!(factory.build_session().is_err());
    }

    #[test]
    fn test_build_without_constraints_fails() {
        let mut factory: ConstraintFactory<SimpleScore> = ConstraintFactory::new();
        factory.for_each::<Lesson>();
        assert!(factory.build_session().is_err());
    }

    #[test]
    fn test_build_orders_sources_first() {
        let mut factory: ConstraintFactory<SimpleScore> = ConstraintFactory::new();
        let lessons = factory.for_each::<Lesson>();
        let pairs = factory.join(lessons, lessons, Joiners::new().equal(room_of, room_of));
        factory.penalize(pairs, "shared room", SimpleScore::ONE).unwrap();
        factory.reward(lessons, "lesson", SimpleScore::ONE).unwrap();

        let session = factory.build_session().unwrap();
        let kinds: Vec<_> = session.nodes().iter().map(|node| node.kind()).collect();
        assert_eq!(kinds, vec!["ForEach", "Join", "Scoring", "Scoring"]);
    }

    #[test]
    fn test_empty_keyless_group_is_rejected() {
        let mut factory: ConstraintFactory<SimpleScore> = ConstraintFactory::new();
        let lessons = factory.for_each::<Lesson>();
        let nothing = factory.group_collect(lessons, Vec::new());
        factory.penalize(nothing, "nothing", SimpleScore::ONE).unwrap();
        assert!(matches!(
            factory.build_session(),
            Err(BavetError::ConstraintBuilder { .. })
        ));
    }

    #[test]
    fn test_mapped_streams_are_tuple_sources() {
        let mut factory: ConstraintFactory<SimpleScore> = ConstraintFactory::new();
        let lessons = factory.for_each::<Lesson>();
        let rooms = factory.map(lessons, room_of);
        let placed = factory.filter(rooms, |t| t.fact::<Option<u32>>(0).is_some());
        let per_room = factory.flatten_last(placed, |t| t.fact::<Option<u32>>(0).copied());
        factory.penalize(per_room, "placed", SimpleScore::ONE).unwrap();

        assert_eq!(factory.tuple_source(placed), rooms);
        assert_eq!(factory.tuple_source(per_room), per_room);
        let session = factory.build_session().unwrap();
        let kinds: Vec<_> = session.nodes().iter().map(|node| node.kind()).collect();
        assert_eq!(kinds, vec!["ForEach", "Map", "Map", "Scoring"]);
    }
}
