// scoring_node.rs - Terminal score accumulator of one constraint
use crate::arena::{AbstractNode, NodeId, TupleArena};
use crate::constraint::{ConstraintMatchTotal, ImpactType};
use crate::error::{BavetError, Result};
use crate::lifecycle::{NodeInput, Propagation, TupleLifecycle};
use crate::score::Score;
use crate::tuple::{StoreEntry, Tuple, TupleId};
use std::fmt;
use std::rc::Rc;

pub type MatchWeigher = Rc<dyn Fn(&Tuple) -> i64>;

/// Keeps the running total of match weights; the score is derived from it
/// on demand, so changing the constraint weight never touches the matches.
pub struct ScoringNode<S: Score> {
    id: NodeId,
    constraint_name: String,
    constraint_weight: S,
    impact_type: ImpactType,
    weigher: Option<MatchWeigher>,
    input_store_index: usize,
    match_weight_total: i64,
    match_count: usize,
}

impl<S: Score> ScoringNode<S> {
    pub fn new(
        id: NodeId,
        constraint_name: impl Into<String>,
        constraint_weight: S,
        impact_type: ImpactType,
        weigher: Option<MatchWeigher>,
        input_store_index: usize,
    ) -> Self {
        Self {
            id,
            constraint_name: constraint_name.into(),
            constraint_weight,
            impact_type,
            weigher,
            input_store_index,
            match_weight_total: 0,
            match_count: 0,
        }
    }

    pub fn constraint_name(&self) -> &str {
        &self.constraint_name
    }

    pub fn constraint_weight(&self) -> S {
        self.constraint_weight
    }

    pub fn set_constraint_weight(&mut self, weight: S) {
        self.constraint_weight = weight;
    }

    pub fn match_count(&self) -> usize {
        self.match_count
    }

    pub fn insert_match(&mut self, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        if tuples.store(tuple, self.input_store_index)?.is_some() {
            return Err(BavetError::double_insert(self.id, tuple));
        }
        let weight = match &self.weigher {
            Some(weigher) => weigher(tuples.get(tuple)?),
            None => 1,
        };
        let total = self.match_weight_total.checked_add(weight).ok_or_else(|| {
            BavetError::overflow(format!(
                "constraint ({}) adding match weight ({}) to total ({})",
                self.constraint_name, weight, self.match_weight_total
            ))
        })?;
        tuples.set_store(tuple, self.input_store_index, StoreEntry::MatchWeight(weight))?;
        self.match_weight_total = total;
        self.match_count += 1;
        Ok(())
    }

    pub fn retract_match(&mut self, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        match tuples.take_store(tuple, self.input_store_index)? {
            None => Ok(()),
            Some(StoreEntry::MatchWeight(weight)) => {
                self.match_weight_total =
                    self.match_weight_total.checked_sub(weight).ok_or_else(|| {
                        BavetError::overflow(format!(
                            "constraint ({}) removing match weight ({}) from total ({})",
                            self.constraint_name, weight, self.match_weight_total
                        ))
                    })?;
                self.match_count -= 1;
                Ok(())
            }
            Some(other) => Err(BavetError::consistency_violation(format!(
                "scoring node ({}) found {:?} in the weight slot of tuple ({:?})",
                self.id, other, tuple
            ))),
        }
    }

    #[inline]
    pub fn score(&self) -> S {
        self.impact_type
            .apply(self.constraint_weight.multiply(self.match_weight_total))
    }

    pub fn match_total(&self) -> ConstraintMatchTotal<S> {
        ConstraintMatchTotal {
            constraint_name: self.constraint_name.clone(),
            impact_type: self.impact_type,
            constraint_weight: self.constraint_weight,
            match_count: self.match_count,
            match_weight_total: self.match_weight_total,
            score: self.score(),
        }
    }
}

impl<S: Score> AbstractNode for ScoringNode<S> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn insert(&mut self, input: NodeInput, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        match input {
            NodeInput::Uni => self.insert_match(tuple, tuples),
            _ => Err(BavetError::node_mismatch(self.id, format!("a {:?} insert", input))),
        }
    }

    fn retract(&mut self, input: NodeInput, tuple: TupleId, tuples: &mut TupleArena) -> Result<()> {
        match input {
            NodeInput::Uni => self.retract_match(tuple, tuples),
            _ => Err(BavetError::node_mismatch(self.id, format!("a {:?} retract", input))),
        }
    }

    fn calculate_score(
        &mut self,
        _tuples: &mut TupleArena,
        _propagations: &mut Vec<Propagation>,
    ) -> Result<()> {
        Ok(())
    }

    fn next_lifecycle(&self) -> Option<&Rc<TupleLifecycle>> {
        None
    }

    fn dirty_count(&self) -> usize {
        0
    }
}

impl<S: Score> fmt::Debug for ScoringNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoringNode")
            .field("id", &self.id)
            .field("constraint_name", &self.constraint_name)
            .field("constraint_weight", &self.constraint_weight)
            .field("impact_type", &self.impact_type)
            .field("match_count", &self.match_count)
            .field("match_weight_total", &self.match_weight_total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactRef;
    use crate::score::HardSoftScore;
    use smallvec::smallvec;

    fn tuple(tuples: &mut TupleArena, value: i64) -> TupleId {
        let fact: FactRef = Rc::new(value);
        tuples.create(smallvec![fact], 1).unwrap()
    }

    #[test]
    fn test_weighted_penalty() {
        let mut tuples = TupleArena::new();
        let weigher: MatchWeigher = Rc::new(|t: &Tuple| t.fact::<i64>(0).copied().unwrap_or(0));
        let mut node = ScoringNode::new(
            NodeId(0),
            "overtime",
            HardSoftScore::ONE_SOFT,
            ImpactType::Penalty,
            Some(weigher),
            0,
        );
        let a = tuple(&mut tuples, 3);
        let b = tuple(&mut tuples, 4);
        node.insert_match(a, &mut tuples).unwrap();
        node.insert_match(b, &mut tuples).unwrap();
        assert_eq!(node.score(), HardSoftScore::of_soft(-7));

        node.set_constraint_weight(HardSoftScore::of(1, 2));
        assert_eq!(node.score(), HardSoftScore::of(-7, -14));

        node.retract_match(a, &mut tuples).unwrap();
        node.retract_match(a, &mut tuples).unwrap();
        let total = node.match_total();
        assert_eq!(total.match_count, 1);
        assert_eq!(total.match_weight_total, 4);
        assert_eq!(total.score, HardSoftScore::of(-4, -8));
    }

    #[test]
    fn test_weight_total_overflow() {
        let mut tuples = TupleArena::new();
        let weigher: MatchWeigher = Rc::new(|t: &Tuple| t.fact::<i64>(0).copied().unwrap_or(0));
        let mut node = ScoringNode::new(
            NodeId(0),
            "huge",
            HardSoftScore::ONE_SOFT,
            ImpactType::Penalty,
            Some(weigher),
            0,
        );
        let a = tuple(&mut tuples, i64::MAX);
        let b = tuple(&mut tuples, 1);
        node.insert_match(a, &mut tuples).unwrap();
        assert!(matches!(
            node.insert_match(b, &mut tuples),
            Err(BavetError::Overflow { .. })
        ));
        assert!(tuples.store(b, 0).unwrap().is_none(), "rejected match keeps no slot");
        assert_eq!(node.match_count(), 1);
        assert_eq!(node.score(), HardSoftScore::of_soft(-i64::MAX));
    }

    #[test]
    fn test_reward_and_double_insert() {
        let mut tuples = TupleArena::new();
        let mut node = ScoringNode::new(
            NodeId(2),
            "preferred",
            HardSoftScore::ONE_SOFT,
            ImpactType::Reward,
            None,
            0,
        );
        let a = tuple(&mut tuples, 10);
        node.insert_match(a, &mut tuples).unwrap();
        assert_eq!(node.score(), HardSoftScore::ONE_SOFT);
        assert!(matches!(
            node.insert_match(a, &mut tuples),
            Err(BavetError::DoubleInsert { .. })
        ));
    }
}
