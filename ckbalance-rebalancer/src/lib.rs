//! ckbalance rebalancer library
//!
//! Evens out the compressed size of one table's partitions across a fixed
//! set of ClickHouse nodes:
//! - State collection (per-node partition sizes from the catalog)
//! - Planning (greedy single-partition moves, never overshooting)
//! - Execution (detach, transfer, attach; serialized per destination)
//! - Orchestration (one task per node, aggregated report)

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod shell;
pub mod state;

// Re-export main types
pub use catalog::{CatalogError, HttpCatalogClient};
pub use cluster::{CatalogClient, ClientError, ClusterClient, NodeHandle, RemoteShell, SshLogin};
pub use config::{ConfigError, RebalancerConfig};
pub use error::RebalanceError;
pub use executor::{MoveError, MoveExecutor, MoveRecord, MoveState, MoveStep, NodeOutcome};
pub use orchestrator::{Orchestrator, RebalanceReport};
pub use planner::{PlannedMove, Planner, RebalancePlan};
pub use shell::{ShellError, SshShell};
pub use state::{NodeState, OutgoingMove, StateCollector};
