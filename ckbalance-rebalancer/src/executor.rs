//! Move Executor
//!
//! Runs one node's planned moves, strictly in partition id order:
//! 1. Detach the partition at the source
//! 2. Lock the destination's staging directory
//! 3. Copy the staged parts to the destination and drop the local copy
//! 4. Attach the partition at the destination
//! 5. Release the lock
//!
//! The first failure stops the node's remaining moves. Nothing is rolled
//! back: a move that fails after detaching leaves the partition stranded and
//! is reported as such.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::cluster::{ClusterClient, NodeHandle};
use crate::state::{NodeState, OutgoingMove};

/// Move errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MoveError {
    #[error("No connection for node {0}")]
    UnknownNode(String),

    #[error("Refusing to move partition with unsafe id {0:?}")]
    InvalidPartition(String),

    #[error("Detach of partition {partition} on {host} failed: {reason}")]
    Detach {
        partition: String,
        host: String,
        reason: String,
    },

    #[error("Transfer of partition {partition} from {from} to {to} failed: {reason}")]
    Transfer {
        partition: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("Attach of partition {partition} on {host} failed: {reason}")]
    Attach {
        partition: String,
        host: String,
        reason: String,
    },

    #[error("Move task for {host} panicked: {reason}")]
    TaskPanicked { host: String, reason: String },
}

pub type Result<T> = std::result::Result<T, MoveError>;

/// Protocol step that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MoveStep {
    /// Node lookup and partition id check, before anything changes
    Prepare,
    Detach,
    Transfer,
    Attach,
}

/// Progress of a single move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MoveState {
    Planned,
    Detached,
    Transferred,
    Attached,
    Failed(MoveStep),
}

impl std::fmt::Display for MoveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MoveState::Planned => write!(f, "planned"),
            MoveState::Detached => write!(f, "detached"),
            MoveState::Transferred => write!(f, "transferred"),
            MoveState::Attached => write!(f, "attached"),
            MoveState::Failed(MoveStep::Prepare) => write!(f, "failed before detach"),
            MoveState::Failed(MoveStep::Detach) => write!(f, "failed at detach"),
            MoveState::Failed(MoveStep::Transfer) => write!(f, "failed at transfer"),
            MoveState::Failed(MoveStep::Attach) => write!(f, "failed at attach"),
        }
    }
}

/// One partition move and how far it got
#[derive(Debug, Clone, Serialize)]
pub struct MoveRecord {
    pub partition: String,
    pub from: String,
    pub to: String,
    pub size: u64,
    pub state: MoveState,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MoveRecord {
    fn planned(from: &str, partition: &str, planned: &OutgoingMove) -> Self {
        Self {
            partition: partition.to_string(),
            from: from.to_string(),
            to: planned.destination.clone(),
            size: planned.size,
            state: MoveState::Planned,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Detached at the source but never attached at the destination
    pub fn is_stranded(&self) -> bool {
        matches!(
            self.state,
            MoveState::Failed(MoveStep::Transfer) | MoveState::Failed(MoveStep::Attach)
        )
    }

    pub fn is_complete(&self) -> bool {
        self.state == MoveState::Attached
    }

    fn fail(&mut self, step: MoveStep, error: &MoveError) {
        self.state = MoveState::Failed(step);
        self.error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }
}

/// Result of one node's task
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub host: String,
    pub moves: Vec<MoveRecord>,
    /// Error that stopped the node's remaining moves
    pub error: Option<MoveError>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn completed(&self) -> impl Iterator<Item = &MoveRecord> {
        self.moves.iter().filter(|m| m.is_complete())
    }

    pub fn stranded(&self) -> impl Iterator<Item = &MoveRecord> {
        self.moves.iter().filter(|m| m.is_stranded())
    }

    /// Moves never attempted because an earlier one failed
    pub fn skipped(&self) -> impl Iterator<Item = &MoveRecord> {
        self.moves.iter().filter(|m| m.state == MoveState::Planned)
    }

    pub fn bytes_moved(&self) -> u64 {
        self.completed().map(|m| m.size).sum()
    }
}

pub(crate) mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// Executes the moves planned for one source node
pub struct MoveExecutor {
    cluster: Arc<ClusterClient>,
}

impl MoveExecutor {
    /// Create a new executor
    pub fn new(cluster: Arc<ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Run every outgoing move of `node`, stopping at the first failure
    #[instrument(skip(self, node), fields(host = %node.host, moves = node.move_count()))]
    pub async fn execute(&self, node: &NodeState) -> NodeOutcome {
        let start = Instant::now();
        let mut records: Vec<MoveRecord> = node
            .moves()
            .map(|(partition, planned)| MoveRecord::planned(&node.host, partition, planned))
            .collect();
        let mut error = None;

        for record in records.iter_mut() {
            if let Err(e) = self.execute_move(record).await {
                warn!(
                    host = %node.host,
                    partition = %record.partition,
                    state = %record.state,
                    error = %e,
                    "Move failed, skipping remaining moves for node"
                );
                error = Some(e);
                break;
            }
        }

        NodeOutcome {
            host: node.host.clone(),
            moves: records,
            error,
            duration: start.elapsed(),
        }
    }

    /// Drive one record through detach, transfer and attach
    async fn execute_move(&self, record: &mut MoveRecord) -> Result<()> {
        let table = self.cluster.table();
        record.started_at = Some(Utc::now());

        let (source, destination) = match self.endpoints(record) {
            Ok(endpoints) => endpoints,
            Err(err) => {
                record.fail(MoveStep::Prepare, &err);
                return Err(err);
            }
        };

        info!(
            host = %record.from,
            partition = %record.partition,
            "Detaching partition"
        );
        if let Err(e) = source.catalog.detach_partition(table, &record.partition).await {
            let err = MoveError::Detach {
                partition: record.partition.clone(),
                host: record.from.clone(),
                reason: e.to_string(),
            };
            record.fail(MoveStep::Detach, &err);
            return Err(err);
        }
        record.state = MoveState::Detached;

        let lock = destination.incoming_lock();
        let _guard = lock.lock().await;

        for command in self.cluster.transfer_commands(&record.partition, &record.to) {
            info!(host = %record.from, command = %command, "Transferring partition");
            if let Err(e) = source.shell.run(&command).await {
                let err = MoveError::Transfer {
                    partition: record.partition.clone(),
                    from: record.from.clone(),
                    to: record.to.clone(),
                    reason: e.to_string(),
                };
                record.fail(MoveStep::Transfer, &err);
                return Err(err);
            }
        }
        record.state = MoveState::Transferred;

        info!(
            host = %record.to,
            partition = %record.partition,
            "Attaching partition"
        );
        if let Err(e) = destination
            .catalog
            .attach_partition(table, &record.partition)
            .await
        {
            let err = MoveError::Attach {
                partition: record.partition.clone(),
                host: record.to.clone(),
                reason: e.to_string(),
            };
            record.fail(MoveStep::Attach, &err);
            return Err(err);
        }
        record.state = MoveState::Attached;
        record.finished_at = Some(Utc::now());

        info!(
            partition = %record.partition,
            from = %record.from,
            to = %record.to,
            size = record.size,
            "Partition moved"
        );

        Ok(())
    }
}

impl MoveExecutor {
    /// Resolve both ends of a move and check its partition id
    fn endpoints(&self, record: &MoveRecord) -> Result<(&NodeHandle, &NodeHandle)> {
        let source = self
            .cluster
            .node(&record.from)
            .ok_or_else(|| MoveError::UnknownNode(record.from.clone()))?;
        let destination = self
            .cluster
            .node(&record.to)
            .ok_or_else(|| MoveError::UnknownNode(record.to.clone()))?;
        if !is_safe_partition_id(&record.partition) {
            return Err(MoveError::InvalidPartition(record.partition.clone()));
        }
        Ok((source, destination))
    }
}

/// Partition ids end up in shell globs; only allow what the catalog produces
pub fn is_safe_partition_id(partition: &str) -> bool {
    !partition.is_empty()
        && partition
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
