//! Orchestrator
//!
//! Fans planned moves out to one task per node and gathers the outcomes.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::cluster::ClusterClient;
use crate::error::Result;
use crate::executor::{MoveError, MoveExecutor, MoveRecord, NodeOutcome};
use crate::planner::{Planner, RebalancePlan};
use crate::state::{NodeState, StateCollector};

/// Everything that happened in one run
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceReport {
    pub run_id: Uuid,
    pub table: String,
    pub started_at: DateTime<Utc>,
    #[serde(with = "crate::executor::duration_millis")]
    pub duration: Duration,
    pub dry_run: bool,
    pub plan: RebalancePlan,
    pub nodes: Vec<NodeOutcome>,
}

impl RebalanceReport {
    fn new(table: &str, plan: RebalancePlan, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            table: table.to_string(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            dry_run,
            plan,
            nodes: Vec::new(),
        }
    }

    /// No node task failed
    pub fn is_success(&self) -> bool {
        self.nodes.iter().all(|n| n.is_success())
    }

    pub fn failed_nodes(&self) -> Vec<&NodeOutcome> {
        self.nodes.iter().filter(|n| !n.is_success()).collect()
    }

    /// Partitions detached at their source but not attached anywhere
    pub fn stranded(&self) -> Vec<&MoveRecord> {
        self.nodes.iter().flat_map(|n| n.stranded()).collect()
    }

    pub fn moves_completed(&self) -> usize {
        self.nodes.iter().map(|n| n.completed().count()).sum()
    }

    pub fn bytes_moved(&self) -> u64 {
        self.nodes.iter().map(|n| n.bytes_moved()).sum()
    }

    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{}/{} moves completed, {} bytes moved, {} failed nodes, {} stranded partitions in {:?}",
            self.moves_completed(),
            self.plan.moves.len(),
            self.bytes_moved(),
            self.failed_nodes().len(),
            self.stranded().len(),
            self.duration
        )
    }
}

/// Runs one [`MoveExecutor`] per node concurrently
pub struct Orchestrator {
    cluster: Arc<ClusterClient>,
}

impl Orchestrator {
    pub fn new(cluster: Arc<ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Execute every node's planned moves and wait for all of them
    #[instrument(skip(self, states), fields(nodes = states.len()))]
    pub async fn execute(&self, states: Vec<NodeState>) -> Vec<NodeOutcome> {
        let mut hosts = Vec::with_capacity(states.len());
        let mut handles = Vec::with_capacity(states.len());

        for state in states {
            let executor = MoveExecutor::new(self.cluster.clone());
            hosts.push(state.host.clone());
            handles.push(tokio::spawn(async move { executor.execute(&state).await }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (host, joined) in hosts.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(outcome) => {
                    info!(
                        host = %host,
                        completed = outcome.completed().count(),
                        success = outcome.is_success(),
                        "Node rebalance done"
                    );
                    outcomes.push(outcome);
                }
                Err(e) => {
                    error!(host = %host, error = %e, "Node task panicked");
                    outcomes.push(NodeOutcome {
                        host: host.clone(),
                        moves: Vec::new(),
                        error: Some(MoveError::TaskPanicked {
                            host,
                            reason: e.to_string(),
                        }),
                        duration: Duration::ZERO,
                    });
                }
            }
        }

        outcomes
    }

    /// One full pass: collect, plan and, unless `dry_run`, execute
    ///
    /// Collection failures abort before anything moves. Move failures end up
    /// in the report.
    #[instrument(skip(self), fields(table = %self.cluster.table()))]
    pub async fn rebalance(&self, dry_run: bool) -> Result<RebalanceReport> {
        let start = Instant::now();

        let mut states = StateCollector::new().collect(&self.cluster).await?;
        let plan = Planner::new().plan(&mut states);

        let mut report = RebalanceReport::new(self.cluster.table(), plan, dry_run);

        if dry_run {
            for planned in &report.plan.moves {
                info!(
                    partition = %planned.partition,
                    size = planned.size,
                    from = %planned.from,
                    to = %planned.to,
                    "Would move partition"
                );
            }
            info!("Dry run mode, skipping execution");
        } else {
            if report.plan.is_empty() {
                info!("Cluster already balanced, nothing to move");
            }
            report.nodes = self.execute(states).await;
        }

        report.duration = start.elapsed();

        for record in report.stranded() {
            warn!(
                partition = %record.partition,
                from = %record.from,
                to = %record.to,
                state = %record.state,
                error = record.error.as_deref().unwrap_or(""),
                "Partition stranded, manual recovery required"
            );
        }

        info!(summary = %report.summary(), "Rebalance done");

        Ok(report)
    }
}
