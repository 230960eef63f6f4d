//session.rs
use crate::analysis::{ConstraintAnalysis, NetworkStatistics};
use crate::arena::{NodeArena, NodeData, NodeId, TupleArena};
use crate::constraint::ConstraintMatchTotal;
use crate::error::{BavetError, Result};
use crate::fact::{downcast_fact, Fact, FactRef};
use crate::for_each_node::ForEachNode;
use crate::resource_limits::ResourceLimits;
use crate::score::Score;
use crate::scoring_node::ScoringNode;
use crate::tuple::TupleId;
use rustc_hash::FxHashMap as HashMap;
use slotmap::{new_key_type, SlotMap};
use std::any::{type_name, TypeId};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, warn};

new_key_type! {
    /// Identity of an inserted fact, valid until the fact is retracted.
    pub struct FactHandle;
}

#[derive(Debug)]
struct FactEntry {
    type_id: TypeId,
    type_name: &'static str,
    fact: FactRef,
    /// For-each node and tuple carrying the fact; `None` when no constraint
    /// consumes its type.
    source: Option<(NodeId, TupleId)>,
}

/// A built constraint network plus the facts inserted into it.
pub struct Session<S: Score> {
    nodes: NodeArena<S>,
    tuples: TupleArena,
    facts: SlotMap<FactHandle, FactEntry>,
    for_each_nodes: HashMap<TypeId, Option<NodeId>>,
    scoring_nodes: Vec<NodeId>,
    limits: ResourceLimits,
    /// Set when a flush fails part way; node state can no longer be trusted.
    poisoned: Option<String>,
}

impl<S: Score> Session<S> {
    pub(crate) fn new(
        nodes: NodeArena<S>,
        for_each_nodes: HashMap<TypeId, Option<NodeId>>,
        scoring_nodes: Vec<NodeId>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            nodes,
            tuples: TupleArena::with_limits(&limits),
            facts: SlotMap::with_key(),
            for_each_nodes,
            scoring_nodes,
            limits,
            poisoned: None,
        }
    }

    fn ensure_healthy(&self) -> Result<()> {
        match &self.poisoned {
            Some(cause) => Err(BavetError::SessionPoisoned {
                cause: cause.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Whether an earlier flush failed. A poisoned session rejects every
    /// further fact change and flush; rebuild it from the factory instead.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn insert<T: Fact>(&mut self, fact: T) -> Result<FactHandle> {
        self.ensure_healthy()?;
        self.limits.check_fact_limit(self.facts.len())?;
        let type_id = TypeId::of::<T>();
        let node = *self
            .for_each_nodes
            .get(&type_id)
            .ok_or(BavetError::UnregisteredType {
                type_name: type_name::<T>(),
            })?;
        let fact: FactRef = Rc::new(fact);
        let source = match node {
            Some(node) => {
                let tuple = for_each_node(&mut self.nodes, node)?
                    .insert_fact(fact.clone(), &mut self.tuples)?;
                Some((node, tuple))
            }
            None => None,
        };
        Ok(self.facts.insert(FactEntry {
            type_id,
            type_name: type_name::<T>(),
            fact,
            source,
        }))
    }

    pub fn insert_batch<T: Fact>(
        &mut self,
        facts: impl IntoIterator<Item = T>,
    ) -> Result<Vec<FactHandle>> {
        facts.into_iter().map(|fact| self.insert(fact)).collect()
    }

    /// Replaces the fact behind `handle`. Downstream sees a retract followed
    /// by an insert on the next flush.
    pub fn update<T: Fact>(&mut self, handle: FactHandle, fact: T) -> Result<()> {
        self.ensure_healthy()?;
        let entry = self
            .facts
            .get(handle)
            .ok_or_else(|| BavetError::fact_not_found(format!("{:?}", handle)))?;
        if entry.type_id != TypeId::of::<T>() {
            return Err(BavetError::type_mismatch(format!(
                "fact {:?} is a {}, not a {}",
                handle,
                entry.type_name,
                type_name::<T>()
            )));
        }
        let source = entry.source;
        let fact: FactRef = Rc::new(fact);
        if let Some((node, tuple)) = source {
            for_each_node(&mut self.nodes, node)?.update_fact(
                tuple,
                fact.clone(),
                &mut self.tuples,
            )?;
        }
        if let Some(entry) = self.facts.get_mut(handle) {
            entry.fact = fact;
        }
        Ok(())
    }

    pub fn retract(&mut self, handle: FactHandle) -> Result<()> {
        self.ensure_healthy()?;
        let entry = self
            .facts
            .get(handle)
            .ok_or_else(|| BavetError::fact_not_found(format!("{:?}", handle)))?;
        if let Some((node, tuple)) = entry.source {
            for_each_node(&mut self.nodes, node)?.retract_fact(tuple, &mut self.tuples)?;
        }
        self.facts.remove(handle);
        Ok(())
    }

    /// Current value of an inserted fact.
    pub fn fact<T: 'static>(&self, handle: FactHandle) -> Option<&T> {
        self.facts
            .get(handle)
            .and_then(|entry| downcast_fact::<T>(&*entry.fact))
    }

    pub fn contains(&self, handle: FactHandle) -> bool {
        self.facts.contains_key(handle)
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// Flushes every node once, releases the tuples that died, and sums the
    /// constraint scores.
    pub fn calculate_score(&mut self) -> Result<S> {
        self.ensure_healthy()?;
        let dirty = self.nodes.dirty_count();
        let released = match self.nodes.calculate_score(&mut self.tuples) {
            Ok(released) => released,
            Err(error) => {
                warn!(event = "session_poisoned", error = %error);
                self.poisoned = Some(error.to_string());
                return Err(error);
            }
        };
        let score = self.score();
        debug!(
            event = "score_calculated",
            score = %score,
            dirty,
            released,
            tuples = self.tuples.len(),
        );
        Ok(score)
    }

    /// Sum of the constraint scores as of the last flush.
    pub fn score(&self) -> S {
        self.scorers()
            .fold(S::zero(), |total, scorer| total + scorer.score())
    }

    fn scorers(&self) -> impl Iterator<Item = &ScoringNode<S>> {
        self.scoring_nodes
            .iter()
            .filter_map(move |&node| match self.nodes.get(node) {
                Ok(NodeData::Scoring(scorer)) => Some(scorer),
                _ => None,
            })
    }

    /// Per-constraint totals as of the last flush, in declaration order.
    pub fn constraint_match_totals(&self) -> Vec<ConstraintMatchTotal<S>> {
        let mut totals: Vec<_> = self.scorers().map(|scorer| scorer.match_total()).collect();
        totals.reverse();
        totals
    }

    /// Changes a constraint weight; the new score is visible immediately.
    pub fn set_constraint_weight(&mut self, name: &str, weight: S) -> Result<()> {
        for position in 0..self.scoring_nodes.len() {
            let node = self.scoring_nodes[position];
            if let NodeData::Scoring(scorer) = self.nodes.get_mut(node)? {
                if scorer.constraint_name() == name {
                    debug!(event = "constraint_weight_changed", constraint = name, weight = %weight);
                    scorer.set_constraint_weight(weight);
                    return Ok(());
                }
            }
        }
        Err(BavetError::constraint_builder_error(format!(
            "no constraint named ({})",
            name
        )))
    }

    /// Retracts every fact and flushes.
    pub fn clear(&mut self) -> Result<()> {
        let handles: Vec<_> = self.facts.keys().collect();
        for handle in handles {
            self.retract(handle)?;
        }
        self.calculate_score()?;
        Ok(())
    }

    pub fn statistics(&self) -> NetworkStatistics {
        NetworkStatistics {
            facts: self.facts.len(),
            ..ConstraintAnalysis::network_stats(&self.nodes, &self.tuples)
        }
    }

    pub fn nodes(&self) -> &NodeArena<S> {
        &self.nodes
    }

    pub fn tuples(&self) -> &TupleArena {
        &self.tuples
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}

fn for_each_node<S: Score>(nodes: &mut NodeArena<S>, node: NodeId) -> Result<&mut ForEachNode> {
    match nodes.get_mut(node)? {
        NodeData::ForEach(for_each) => Ok(for_each),
        other => Err(BavetError::node_mismatch(
            node,
            format!("facts (it is a {} node)", other.kind()),
        )),
    }
}

impl<S: Score> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("nodes", &self.nodes.len())
            .field("tuples", &self.tuples.len())
            .field("facts", &self.facts.len())
            .field("constraints", &self.scoring_nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::ConstraintFactory;
    use crate::score::SimpleScore;

    #[derive(Debug, Clone, PartialEq)]
    struct Shift {
        hours: i64,
    }

    #[derive(Debug)]
    struct Holiday;

    #[derive(Debug)]
    struct Unknown;

    fn session() -> Session<SimpleScore> {
        let mut factory = ConstraintFactory::new();
        let shifts = factory.for_each::<Shift>();
        factory.for_each::<Holiday>();
        factory
            .penalize_weighted(shifts, "hours", SimpleScore::ONE, |t| {
                t.fact::<Shift>(0).map_or(0, |shift| shift.hours)
            })
            .unwrap();
        factory.build_session().unwrap()
    }

    // --- Fact Lifecycle Tests ---

    #[test]
    fn test_insert_update_retract() {
        let mut session = session();
        let a = session.insert(Shift { hours: 8 }).unwrap();
        let b = session.insert(Shift { hours: 4 }).unwrap();
        assert_eq!(session.score(), SimpleScore::ZERO, "nothing flushed yet");
        assert_eq!(session.calculate_score().unwrap(), SimpleScore::of(-12));

        session.update(a, Shift { hours: 2 }).unwrap();
        assert_eq!(session.fact::<Shift>(a), Some(&Shift { hours: 2 }));
        assert_eq!(session.calculate_score().unwrap(), SimpleScore::of(-6));

        session.retract(b).unwrap();
        assert_eq!(session.calculate_score().unwrap(), SimpleScore::of(-2));
        assert!(!session.contains(b));
        assert_eq!(session.fact_count(), 1);
    }

    #[test]
    fn test_retract_before_flush() {
        let mut session = session();
        let a = session.insert(Shift { hours: 8 }).unwrap();
        session.retract(a).unwrap();
        assert_eq!(session.calculate_score().unwrap(), SimpleScore::ZERO);
        assert!(session.tuples().is_empty());
    }

    #[test]
    fn test_fact_errors() {
        let mut session = session();
        assert!(matches!(
            session.insert(Unknown),
            Err(BavetError::UnregisteredType { .. })
        ));

        let holiday = session.insert(Holiday).unwrap();
        assert!(session.fact::<Holiday>(holiday).is_some());
        assert_eq!(session.calculate_score().unwrap(), SimpleScore::ZERO);

        let shift = session.insert(Shift { hours: 1 }).unwrap();
        assert!(matches!(
            session.update(shift, Holiday),
            Err(BavetError::TypeMismatch { .. })
        ));
        session.retract(shift).unwrap();
        assert!(matches!(
            session.retract(shift),
            Err(BavetError::FactNotFound { .. })
        ));
        assert!(matches!(
            session.update(shift, Shift { hours: 3 }),
            Err(BavetError::FactNotFound { .. })
        ));
    }

    #[test]
    fn test_failed_flush_poisons_session() {
        let mut factory = ConstraintFactory::with_limits(ResourceLimits {
            max_tuples: 3,
            ..ResourceLimits::default()
        });
        let shifts = factory.for_each::<Shift>();
        let holidays = factory.for_each::<Holiday>();
        let pairs = factory.join(shifts, holidays, crate::joiner::Joiners::new());
        factory.penalize(pairs, "pairs", SimpleScore::ONE).unwrap();
        factory.reward(holidays, "holidays", SimpleScore::ONE).unwrap();
        let mut session = factory.build_session().unwrap();

        let shift = session.insert(Shift { hours: 1 }).unwrap();
        session.insert(Holiday).unwrap();
        session.insert(Holiday).unwrap();
        assert!(matches!(
            session.calculate_score(),
            Err(BavetError::ResourceLimit { .. })
        ));
        assert!(session.is_poisoned());

        assert!(matches!(
            session.calculate_score(),
            Err(BavetError::SessionPoisoned { .. })
        ));
        assert!(matches!(
            session.insert(Shift { hours: 2 }),
            Err(BavetError::SessionPoisoned { .. })
        ));
        assert!(matches!(
            session.retract(shift),
            Err(BavetError::SessionPoisoned { .. })
        ));
        assert!(session.contains(shift), "a rejected retract keeps the handle");
        assert_eq!(session.fact_count(), 3);
    }

    #[test]
    fn test_failed_retract_keeps_handle() {
        let mut session = session();
        let shift = session.insert(Shift { hours: 5 }).unwrap();
        let tuple = session.facts[shift].source.unwrap().1;
        let scorer = session.scoring_nodes[0];
        session.facts[shift].source = Some((scorer, tuple));

        assert!(matches!(
            session.retract(shift),
            Err(BavetError::NodeMismatch { .. })
        ));
        assert!(session.contains(shift));
        assert_eq!(session.fact::<Shift>(shift), Some(&Shift { hours: 5 }));
    }

    #[test]
    fn test_fact_limit() {
        let mut factory = ConstraintFactory::with_limits(ResourceLimits {
            max_facts: 2,
            ..ResourceLimits::default()
        });
        let shifts = factory.for_each::<Shift>();
        factory.penalize(shifts, "shift", SimpleScore::ONE).unwrap();
        let mut session = factory.build_session().unwrap();
        session
            .insert_batch(vec![Shift { hours: 1 }, Shift { hours: 2 }])
            .unwrap();
        assert!(matches!(
            session.insert(Shift { hours: 3 }),
            Err(BavetError::ResourceLimit { .. })
        ));
    }

    // --- Weight And Statistics Tests ---

    #[test]
    fn test_set_constraint_weight() {
        let mut session = session();
        session.insert(Shift { hours: 3 }).unwrap();
        session.calculate_score().unwrap();
        session
            .set_constraint_weight("hours", SimpleScore::of(10))
            .unwrap();
        assert_eq!(session.score(), SimpleScore::of(-30));
        assert!(session
            .set_constraint_weight("missing", SimpleScore::ONE)
            .is_err());

        let totals = session.constraint_match_totals();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].match_count, 1);
        assert_eq!(totals[0].match_weight_total, 3);
    }

    #[test]
    fn test_clear_and_statistics() {
        let mut session = session();
        session.insert(Shift { hours: 3 }).unwrap();
        session.insert(Holiday).unwrap();
        session.calculate_score().unwrap();

        let stats = session.statistics();
        assert_eq!(stats.facts, 2);
        assert_eq!(stats.total_tuples, 1, "inactive types make no tuples");
        assert_eq!(stats.node_type_counts.get("ForEach"), Some(&1));

        session.clear().unwrap();
        assert_eq!(session.fact_count(), 0);
        assert_eq!(session.score(), SimpleScore::ZERO);
        assert_eq!(session.statistics().total_tuples, 0);
    }
}
