//analysis.rs
use crate::arena::{NodeArena, NodeData, TupleArena};
use crate::constraint::ConstraintMatchTotal;
use crate::error::Result;
use crate::score::Score;
use crate::session::Session;
use rustc_hash::FxHashMap as HashMap;
use std::fmt;

/// Analysis tools for constraint sessions
pub struct ConstraintAnalysis;

impl ConstraintAnalysis {
    /// Flushes the session and lists the constraints that currently match.
    pub fn analyze_violations<S: Score>(
        session: &mut Session<S>,
    ) -> Result<ConstraintViolationReport<S>> {
        let total_score = session.calculate_score()?;
        let mut violations: Vec<_> = session
            .constraint_match_totals()
            .into_iter()
            .filter(|total| total.match_count > 0)
            .collect();
        violations.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(ConstraintViolationReport {
            feasible: total_score.is_feasible(),
            total_score,
            violations,
        })
    }

    /// Get network statistics
    pub fn network_stats<S: Score>(nodes: &NodeArena<S>, tuples: &TupleArena) -> NetworkStatistics {
        let arena = tuples.stats();
        let mut stats = NetworkStatistics {
            total_nodes: nodes.len(),
            total_tuples: tuples.len(),
            active_tuples: arena.active_tuples,
            dirty_tuples: arena.dirty_tuples,
            total_tuples_created: arena.total_created,
            dirty_node_entries: nodes.dirty_count(),
            ..NetworkStatistics::default()
        };

        for node in nodes.iter() {
            *stats.node_type_counts.entry(node.kind()).or_insert(0) += 1;
            match node {
                NodeData::Join(join) => stats.join_outputs += join.live_outputs(),
                NodeData::Group(group) => stats.groups += group.group_count(),
                NodeData::Map(map) => stats.mapped_outputs += map.live_outputs(),
                _ => {}
            }
        }
        stats
    }
}

#[derive(Debug)]
pub struct ConstraintViolationReport<S: Score> {
    pub total_score: S,
    /// Matching constraints, worst score first.
    pub violations: Vec<ConstraintMatchTotal<S>>,
    pub feasible: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStatistics {
    pub total_nodes: usize,
    pub node_type_counts: HashMap<&'static str, usize>,
    pub total_tuples: usize,
    pub active_tuples: usize,
    pub dirty_tuples: usize,
    pub total_tuples_created: u64,
    /// Entries waiting in node dirty queues.
    pub dirty_node_entries: usize,
    pub join_outputs: usize,
    /// Tuples derived by map and flatten nodes.
    pub mapped_outputs: usize,
    pub groups: usize,
    pub facts: usize,
}

impl fmt::Display for NetworkStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} nodes, {} facts, {} tuples ({} active, {} dirty), {} join outputs, {} groups",
            self.total_nodes,
            self.facts,
            self.total_tuples,
            self.active_tuples,
            self.dirty_tuples,
            self.join_outputs,
            self.groups
        )
    }
}
