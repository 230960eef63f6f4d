// constraint.rs

use crate::score::Score;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Sign a constraint applies to its matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ImpactType {
    Penalty,
    Reward,
}

impl ImpactType {
    #[inline]
    pub fn apply<S: Score>(self, score: S) -> S {
        match self {
            ImpactType::Penalty => -score,
            ImpactType::Reward => score,
        }
    }
}

impl fmt::Display for ImpactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImpactType::Penalty => f.write_str("penalty"),
            ImpactType::Reward => f.write_str("reward"),
        }
    }
}

/// Summary of one constraint's current matches.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintMatchTotal<S: Score> {
    pub constraint_name: String,
    pub impact_type: ImpactType,
    pub constraint_weight: S,
    pub match_count: usize,
    /// Sum of the match weights of all current matches.
    pub match_weight_total: i64,
    pub score: S,
}

impl<S: Score> fmt::Display for ConstraintMatchTotal<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} x{}): {} matches, {}",
            self.constraint_name,
            self.impact_type,
            self.constraint_weight,
            self.match_count,
            self.score
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::HardSoftScore;

    #[test]
    fn test_impact_sign() {
        let weight = HardSoftScore::of_soft(3);
        assert_eq!(ImpactType::Penalty.apply(weight), HardSoftScore::of_soft(-3));
        assert_eq!(ImpactType::Reward.apply(weight), weight);
    }
}
