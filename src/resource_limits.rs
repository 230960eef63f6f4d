//resource_limits.rs
//! Resource management and limits for a constraint network

use crate::error::{BavetError, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Bounds on a single session, checked as tuples and facts are created.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ResourceLimits {
    /// Maximum number of tuples alive in the arena at once
    pub max_tuples: usize,
    /// Maximum number of facts inserted in a session at once
    pub max_facts: usize,
    /// Initial capacity of every node's dirty queue
    pub dirty_queue_capacity: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_tuples: 10_000_000,
            max_facts: 1_000_000,
            dirty_queue_capacity: 1000,
        }
    }
}

impl ResourceLimits {
    /// Create conservative limits for small problems
    pub fn conservative() -> Self {
        Self {
            max_tuples: 100_000,
            max_facts: 10_000,
            dirty_queue_capacity: 64,
        }
    }

    /// Create generous limits for large problems
    pub fn aggressive() -> Self {
        Self {
            max_tuples: 100_000_000,
            max_facts: 10_000_000,
            dirty_queue_capacity: 4096,
        }
    }

    /// Check if the fact count would exceed limits
    pub fn check_fact_limit(&self, current_facts: usize) -> Result<()> {
        if current_facts >= self.max_facts {
            return Err(BavetError::resource_limit(
                "max_facts",
                format!("Current: {}, Limit: {}", current_facts, self.max_facts),
            ));
        }
        Ok(())
    }

    /// Check that the limits describe a usable session
    pub fn validate(&self) -> Result<()> {
        if self.max_tuples == 0 || self.max_facts == 0 {
            return Err(BavetError::constraint_builder_error(format!(
                "resource limits must allow at least one tuple and one fact: {:?}",
                self
            )));
        }
        Ok(())
    }
}
