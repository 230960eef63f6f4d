//score.rs
use std::fmt::{self, Debug, Display};
use std::ops::{Add, Neg, Sub};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Core trait for the score types scorers accumulate into.
///
/// The built-in scores saturate at the `i64` bounds instead of wrapping.
pub trait Score:
    Copy
    + Debug
    + Display
    + PartialEq
    + PartialOrd
    + Add<Output = Self>
    + Sub<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    /// Returns the zero score (the additive identity)
    fn zero() -> Self;

    /// Multiplies every component by an integer match weight
    fn multiply(&self, factor: i64) -> Self;

    /// Whether no hard level is broken
    fn is_feasible(&self) -> bool {
        true
    }
}

/// Single-level score
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SimpleScore {
    pub score: i64,
}

impl SimpleScore {
    pub const ZERO: SimpleScore = SimpleScore { score: 0 };
    pub const ONE: SimpleScore = SimpleScore { score: 1 };

    pub fn of(score: i64) -> Self {
        Self { score }
    }
}

impl Add for SimpleScore {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        SimpleScore {
            score: self.score.saturating_add(other.score),
        }
    }
}

impl Sub for SimpleScore {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        SimpleScore {
            score: self.score.saturating_sub(other.score),
        }
    }
}

impl Neg for SimpleScore {
    type Output = Self;

    fn neg(self) -> Self {
        SimpleScore {
            score: self.score.saturating_neg(),
        }
    }
}

impl Score for SimpleScore {
    fn zero() -> Self {
        Self::ZERO
    }

    #[inline]
    fn multiply(&self, factor: i64) -> Self {
        SimpleScore {
            score: self.score.saturating_mul(factor),
        }
    }
}

impl Display for SimpleScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.score)
    }
}

/// Two-level score compared hard level first
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HardSoftScore {
    pub hard: i64,
    pub soft: i64,
}

impl HardSoftScore {
    pub const ZERO: HardSoftScore = HardSoftScore { hard: 0, soft: 0 };
    pub const ONE_HARD: HardSoftScore = HardSoftScore { hard: 1, soft: 0 };
    pub const ONE_SOFT: HardSoftScore = HardSoftScore { hard: 0, soft: 1 };

    pub fn of(hard: i64, soft: i64) -> Self {
        Self { hard, soft }
    }

    pub fn of_hard(hard: i64) -> Self {
        Self { hard, soft: 0 }
    }

    pub fn of_soft(soft: i64) -> Self {
        Self { hard: 0, soft }
    }
}

impl Add for HardSoftScore {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        HardSoftScore {
            hard: self.hard.saturating_add(other.hard),
            soft: self.soft.saturating_add(other.soft),
        }
    }
}

impl Sub for HardSoftScore {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        HardSoftScore {
            hard: self.hard.saturating_sub(other.hard),
            soft: self.soft.saturating_sub(other.soft),
        }
    }
}

impl Neg for HardSoftScore {
    type Output = Self;

    fn neg(self) -> Self {
        HardSoftScore {
            hard: self.hard.saturating_neg(),
            soft: self.soft.saturating_neg(),
        }
    }
}

impl Score for HardSoftScore {
    fn zero() -> Self {
        Self::ZERO
    }

    #[inline]
    fn multiply(&self, factor: i64) -> Self {
        HardSoftScore {
            hard: self.hard.saturating_mul(factor),
            soft: self.soft.saturating_mul(factor),
        }
    }

    fn is_feasible(&self) -> bool {
        self.hard >= 0
    }
}

impl Display for HardSoftScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}hard/{}soft", self.hard, self.soft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_arithmetic() {
        let score = SimpleScore::of(3).multiply(4) - SimpleScore::ONE;
        assert_eq!(score, SimpleScore::of(11));
        assert_eq!(-score, SimpleScore::of(-11));
        assert_eq!(score.to_string(), "11");
        assert!(score.is_feasible());
    }

    #[test]
    fn test_hard_level_dominates() {
        let broken = HardSoftScore::of(-1, 100);
        let clean = HardSoftScore::of(0, -100);
        assert!(broken < clean);
        assert!(!broken.is_feasible());
        assert!(clean.is_feasible());
        assert_eq!(HardSoftScore::ONE_HARD.multiply(-2), HardSoftScore::of_hard(-2));
        assert_eq!(broken.to_string(), "-1hard/100soft");
    }

    #[test]
    fn test_arithmetic_saturates() {
        assert_eq!(SimpleScore::of(i64::MAX).multiply(2), SimpleScore::of(i64::MAX));
        assert_eq!(SimpleScore::of(i64::MAX) + SimpleScore::ONE, SimpleScore::of(i64::MAX));
        assert_eq!(-SimpleScore::of(i64::MIN), SimpleScore::of(i64::MAX));
        assert_eq!(
            HardSoftScore::of(i64::MIN, 1) - HardSoftScore::ONE_HARD,
            HardSoftScore::of(i64::MIN, 1)
        );
        assert_eq!(
            HardSoftScore::ONE_SOFT.multiply(i64::MIN),
            HardSoftScore::of_soft(i64::MIN)
        );
    }
}
