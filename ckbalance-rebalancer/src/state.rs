//! Cluster state collection
//!
//! Reads every node's active partitions of the table and their compressed
//! sizes into one [`NodeState`] per host.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::cluster::ClusterClient;
use crate::error::{RebalanceError, Result};

/// A partition the planner decided to send elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMove {
    pub destination: String,
    pub size: u64,
}

/// Partitions and planning roles of one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeState {
    pub host: String,
    /// Partition id -> compressed bytes
    pub partitions: BTreeMap<String, u64>,
    pub total_size: u64,
    /// Set once the node has been decided as a source, possibly empty
    pub outgoing_moves: Option<BTreeMap<String, OutgoingMove>>,
    /// Set once the node has been chosen as a destination
    pub incoming: bool,
}

impl NodeState {
    pub fn new(host: impl Into<String>, partitions: BTreeMap<String, u64>) -> Self {
        let total_size = partitions.values().sum();
        Self {
            host: host.into(),
            partitions,
            total_size,
            outgoing_moves: None,
            incoming: false,
        }
    }

    /// Whether the node already has a source or destination role in this run
    pub fn has_role(&self) -> bool {
        self.outgoing_moves.is_some() || self.incoming
    }

    /// Planned moves in partition id order
    pub fn moves(&self) -> impl Iterator<Item = (&String, &OutgoingMove)> {
        self.outgoing_moves.iter().flat_map(|moves| moves.iter())
    }

    pub fn move_count(&self) -> usize {
        self.outgoing_moves.as_ref().map_or(0, |m| m.len())
    }
}

/// Difference between the largest and smallest node totals
pub fn imbalance(states: &[NodeState]) -> u64 {
    let max = states.iter().map(|s| s.total_size).max().unwrap_or(0);
    let min = states.iter().map(|s| s.total_size).min().unwrap_or(0);
    max - min
}

/// Collects one snapshot per node
pub struct StateCollector;

impl StateCollector {
    pub fn new() -> Self {
        Self
    }

    /// Query every node in host order
    ///
    /// Fails on the first node whose query fails; planning must never see a
    /// partial cluster.
    #[instrument(skip(self, cluster), fields(table = %cluster.table()))]
    pub async fn collect(&self, cluster: &ClusterClient) -> Result<Vec<NodeState>> {
        let start = Instant::now();
        let mut states = Vec::with_capacity(cluster.hosts().len());

        for host in cluster.hosts() {
            let node = cluster.node(host).ok_or_else(|| RebalanceError::Collection {
                host: host.clone(),
                reason: "no handle for host".to_string(),
            })?;

            let partitions = node
                .catalog
                .partition_sizes(cluster.table())
                .await
                .map_err(|e| RebalanceError::Collection {
                    host: host.clone(),
                    reason: e.to_string(),
                })?;

            let state = NodeState::new(host.clone(), partitions);
            debug!(
                host = %host,
                partitions = state.partitions.len(),
                total_size = state.total_size,
                "Collected node state"
            );
            states.push(state);
        }

        info!(
            nodes = states.len(),
            total_bytes = states.iter().map(|s| s.total_size).sum::<u64>(),
            imbalance = imbalance(&states),
            duration = ?start.elapsed(),
            "Cluster state collected"
        );

        Ok(states)
    }
}

impl Default for StateCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{CatalogClient, ClientError, RemoteShell};
    use std::sync::Arc;

    struct FixedCatalog(Option<BTreeMap<String, u64>>);

    #[async_trait::async_trait]
    impl CatalogClient for FixedCatalog {
        async fn partition_sizes(
            &self,
            _table: &str,
        ) -> std::result::Result<BTreeMap<String, u64>, ClientError> {
            self.0.clone().ok_or_else(|| "Code: 60. Table does not exist".into())
        }

        async fn detach_partition(
            &self,
            _table: &str,
            _partition: &str,
        ) -> std::result::Result<(), ClientError> {
            unreachable!("collector never detaches")
        }

        async fn attach_partition(
            &self,
            _table: &str,
            _partition: &str,
        ) -> std::result::Result<(), ClientError> {
            unreachable!("collector never attaches")
        }
    }

    struct NoShell;

    #[async_trait::async_trait]
    impl RemoteShell for NoShell {
        async fn run(&self, _command: &str) -> std::result::Result<(), ClientError> {
            Ok(())
        }
    }

    fn sizes(entries: &[(&str, u64)]) -> BTreeMap<String, u64> {
        entries.iter().map(|(p, s)| (p.to_string(), *s)).collect()
    }

    #[test]
    fn test_node_state_total() {
        let state = NodeState::new("ck1", sizes(&[("a", 10), ("b", 32)]));
        assert_eq!(state.total_size, 42);
        assert!(!state.has_role());
        assert_eq!(state.move_count(), 0);
        assert_eq!(state.moves().count(), 0);
    }

    #[test]
    fn test_imbalance() {
        let states = vec![
            NodeState::new("ck1", sizes(&[("a", 10)])),
            NodeState::new("ck2", sizes(&[("b", 70)])),
            NodeState::new("ck3", sizes(&[])),
        ];
        assert_eq!(imbalance(&states), 70);
        assert_eq!(imbalance(&[]), 0);
    }

    #[tokio::test]
    async fn test_collect_in_host_order() {
        let mut cluster = ClusterClient::new("logs", "/staging");
        cluster
            .add_node(
                "ck2",
                Arc::new(FixedCatalog(Some(sizes(&[("202401", 5)])))),
                Arc::new(NoShell),
            )
            .unwrap();
        cluster
            .add_node(
                "ck1",
                Arc::new(FixedCatalog(Some(sizes(&[("202401", 7), ("202402", 3)])))),
                Arc::new(NoShell),
            )
            .unwrap();

        let states = StateCollector::new().collect(&cluster).await.unwrap();

        assert_eq!(states.len(), 2);
        assert_eq!(states[0].host, "ck2");
        assert_eq!(states[0].total_size, 5);
        assert_eq!(states[1].host, "ck1");
        assert_eq!(states[1].total_size, 10);
    }

    #[tokio::test]
    async fn test_collect_fails_fast() {
        let mut cluster = ClusterClient::new("logs", "/staging");
        cluster
            .add_node(
                "ck1",
                Arc::new(FixedCatalog(Some(sizes(&[("a", 1)])))),
                Arc::new(NoShell),
            )
            .unwrap();
        cluster
            .add_node("ck2", Arc::new(FixedCatalog(None)), Arc::new(NoShell))
            .unwrap();

        let err = StateCollector::new().collect(&cluster).await.unwrap_err();
        match err {
            RebalanceError::Collection { host, reason } => {
                assert_eq!(host, "ck2");
                assert!(reason.contains("Table does not exist"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
