//! Rebalance Planner
//!
//! Greedy balancing over in-memory node snapshots. Each outer iteration
//! pairs the smallest node without a role (destination) with the largest
//! node without a role (source) and moves at most one partition between
//! them. A move of size `s` is only planned when
//! `source.total_size >= destination.total_size + 2 * s`, so the destination
//! never ends up larger than the source.
//!
//! Every iteration finalizes its source, even when no partition fits, which
//! bounds the loop by the number of nodes.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

use crate::state::{imbalance, NodeState, OutgoingMove};

/// A single partition move
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedMove {
    pub partition: String,
    pub size: u64,
    pub from: String,
    pub to: String,
}

/// Moves decided for one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RebalancePlan {
    /// Moves in the order they were decided
    pub moves: Vec<PlannedMove>,
    /// Total bytes to move
    pub total_bytes: u64,
    /// Outer loop iterations
    pub iterations: usize,
    pub imbalance_before: u64,
    pub imbalance_after: u64,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Moves leaving a specific node
    pub fn moves_from(&self, host: &str) -> Vec<&PlannedMove> {
        self.moves.iter().filter(|m| m.from == host).collect()
    }

    /// Moves arriving at a specific node
    pub fn moves_to(&self, host: &str) -> Vec<&PlannedMove> {
        self.moves.iter().filter(|m| m.to == host).collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> String {
        format!(
            "{} moves, {} bytes to transfer, imbalance {} -> {} after {} iterations",
            self.moves.len(),
            self.total_bytes,
            self.imbalance_before,
            self.imbalance_after,
            self.iterations
        )
    }
}

/// Greedy rebalance planner
#[derive(Debug, Default)]
pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Self
    }

    /// Annotate `states` with outgoing moves and return the plan
    ///
    /// `states` is re-sorted by total size in the process.
    #[instrument(skip_all, fields(nodes = states.len()))]
    pub fn plan(&self, states: &mut [NodeState]) -> RebalancePlan {
        let mut plan = RebalancePlan {
            imbalance_before: imbalance(states),
            ..Default::default()
        };

        while let Some((min_idx, max_idx)) = Self::select_pair(states) {
            plan.iterations += 1;

            let (low, high) = states.split_at_mut(max_idx);
            let destination = &mut low[min_idx];
            let source = &mut high[0];

            let candidate = Self::select_partition(source, destination);
            let outgoing = source.outgoing_moves.get_or_insert_with(BTreeMap::new);

            match candidate {
                Some((partition, size)) => {
                    destination.total_size += size;
                    destination.incoming = true;
                    source.total_size -= size;
                    source.partitions.remove(&partition);
                    outgoing.insert(
                        partition.clone(),
                        OutgoingMove {
                            destination: destination.host.clone(),
                            size,
                        },
                    );

                    debug!(
                        partition = %partition,
                        size = size,
                        from = %source.host,
                        to = %destination.host,
                        "Planned move"
                    );

                    plan.total_bytes += size;
                    plan.moves.push(PlannedMove {
                        partition,
                        size,
                        from: source.host.clone(),
                        to: destination.host.clone(),
                    });
                }
                None => {
                    debug!(
                        host = %source.host,
                        target = %destination.host,
                        "No partition fits without overshoot"
                    );
                }
            }
        }

        plan.imbalance_after = imbalance(states);

        info!(summary = %plan.summary(), "Rebalance plan created");

        plan
    }

    /// Sort by size and pick (destination, source) indices, destination strictly first
    fn select_pair(states: &mut [NodeState]) -> Option<(usize, usize)> {
        states.sort_by(|a, b| {
            a.total_size
                .cmp(&b.total_size)
                .then_with(|| a.host.cmp(&b.host))
        });

        let min_idx = states.iter().position(|s| !s.has_role())?;
        let max_idx = states.iter().rposition(|s| !s.has_role())?;

        (min_idx < max_idx).then_some((min_idx, max_idx))
    }

    /// First partition, in id order, that can move without overshoot
    fn select_partition(source: &NodeState, destination: &NodeState) -> Option<(String, u64)> {
        source
            .partitions
            .iter()
            .find(|(_, &size)| {
                size > 0
                    && size
                        .checked_mul(2)
                        .and_then(|doubled| doubled.checked_add(destination.total_size))
                        .map_or(false, |needed| source.total_size >= needed)
            })
            .map(|(partition, &size)| (partition.clone(), size))
    }
}
