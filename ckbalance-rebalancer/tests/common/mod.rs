//! In-memory ClickHouse cluster for integration tests
//!
//! Catalog calls move partitions between a node's active set and its staging
//! area. Shell calls understand the rsync and rm commands the executor sends.

#![allow(dead_code)]

use async_trait::async_trait;
use ckbalance_rebalancer::{CatalogClient, ClientError, ClusterClient, NodeState, RemoteShell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TABLE: &str = "events";
pub const STAGING: &str = "/var/lib/clickhouse/data/default/events/detached";

#[derive(Default)]
struct SimState {
    active: HashMap<String, BTreeMap<String, u64>>,
    staged: HashMap<String, BTreeMap<String, u64>>,
    fail_collect: HashSet<String>,
    fail_attach: HashSet<(String, String)>,
    calls: Vec<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
    total_in_flight: usize,
    max_total_in_flight: usize,
}

/// Shared state of every simulated node
#[derive(Clone, Default)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
    transfer_delay: Duration,
}

impl SimCluster {
    pub fn new(nodes: &[(&str, &[(&str, u64)])]) -> Self {
        let mut state = SimState::default();
        for (host, partitions) in nodes {
            state.active.insert(
                host.to_string(),
                partitions.iter().map(|(p, s)| (p.to_string(), *s)).collect(),
            );
            state.staged.insert(host.to_string(), BTreeMap::new());
        }
        Self {
            state: Arc::new(Mutex::new(state)),
            transfer_delay: Duration::from_millis(20),
        }
    }

    pub fn fail_collect_on(&self, host: &str) {
        self.state.lock().unwrap().fail_collect.insert(host.to_string());
    }

    pub fn fail_attach_on(&self, host: &str, partition: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_attach
            .insert((host.to_string(), partition.to_string()));
    }

    /// Client with every simulated node registered in `hosts` order
    pub fn client(&self, hosts: &[&str]) -> Arc<ClusterClient> {
        let mut cluster = ClusterClient::new(TABLE, STAGING);
        for host in hosts {
            cluster
                .add_node(
                    *host,
                    Arc::new(SimCatalog {
                        host: host.to_string(),
                        sim: self.clone(),
                    }),
                    Arc::new(SimShell {
                        host: host.to_string(),
                        sim: self.clone(),
                    }),
                )
                .unwrap();
        }
        Arc::new(cluster)
    }

    pub fn active(&self, host: &str) -> BTreeMap<String, u64> {
        self.state.lock().unwrap().active[host].clone()
    }

    pub fn staged(&self, host: &str) -> BTreeMap<String, u64> {
        self.state.lock().unwrap().staged[host].clone()
    }

    pub fn total(&self, host: &str) -> u64 {
        self.active(host).values().sum()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn max_in_flight(&self, host: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_in_flight
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_total_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_total_in_flight
    }

    async fn transfer(&self, from: &str, partition: &str, to: &str) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("rsync {} {} {}", from, partition, to));
            if !state.staged[from].contains_key(partition) {
                return Err(format!("rsync: {}_*: No such file or directory", partition).into());
            }
            let count = state.in_flight.entry(to.to_string()).or_default();
            *count += 1;
            let count = *count;
            let max = state.max_in_flight.entry(to.to_string()).or_default();
            *max = (*max).max(count);
            state.total_in_flight += 1;
            state.max_total_in_flight = state.max_total_in_flight.max(state.total_in_flight);
        }

        tokio::time::sleep(self.transfer_delay).await;

        let mut state = self.state.lock().unwrap();
        let size = state.staged[from][partition];
        state
            .staged
            .get_mut(to)
            .ok_or("rsync: unknown host")?
            .insert(partition.to_string(), size);
        *state.in_flight.get_mut(to).unwrap() -= 1;
        state.total_in_flight -= 1;
        Ok(())
    }

    fn remove_staged(&self, host: &str, partition: &str) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("rm {} {}", host, partition));
        state.staged.get_mut(host).unwrap().remove(partition);
    }
}

/// Hand-built source state carrying explicit outgoing moves
pub fn planned(host: &str, moves: &[(&str, &str, u64)]) -> NodeState {
    let mut node = NodeState::new(host, BTreeMap::new());
    node.outgoing_moves = Some(
        moves
            .iter()
            .map(|(partition, destination, size)| {
                (
                    partition.to_string(),
                    ckbalance_rebalancer::OutgoingMove {
                        destination: destination.to_string(),
                        size: *size,
                    },
                )
            })
            .collect(),
    );
    node
}

struct SimCatalog {
    host: String,
    sim: SimCluster,
}

#[async_trait]
impl CatalogClient for SimCatalog {
    async fn partition_sizes(&self, table: &str) -> Result<BTreeMap<String, u64>, ClientError> {
        let mut state = self.sim.state.lock().unwrap();
        state.calls.push(format!("collect {} {}", self.host, table));
        if state.fail_collect.contains(&self.host) {
            return Err("Connection refused".into());
        }
        Ok(state.active[&self.host].clone())
    }

    async fn detach_partition(&self, _table: &str, partition: &str) -> Result<(), ClientError> {
        let mut state = self.sim.state.lock().unwrap();
        state.calls.push(format!("detach {} {}", self.host, partition));
        let size = state
            .active
            .get_mut(&self.host)
            .and_then(|active| active.remove(partition))
            .ok_or("Code: 248. Partition not found")?;
        state
            .staged
            .get_mut(&self.host)
            .unwrap()
            .insert(partition.to_string(), size);
        Ok(())
    }

    async fn attach_partition(&self, _table: &str, partition: &str) -> Result<(), ClientError> {
        let mut state = self.sim.state.lock().unwrap();
        state.calls.push(format!("attach {} {}", self.host, partition));
        if state
            .fail_attach
            .contains(&(self.host.clone(), partition.to_string()))
        {
            return Err("Code: 233. Detached part is broken".into());
        }
        let size = state
            .staged
            .get_mut(&self.host)
            .and_then(|staged| staged.remove(partition))
            .ok_or("Code: 233. No detached parts")?;
        *state
            .active
            .get_mut(&self.host)
            .unwrap()
            .entry(partition.to_string())
            .or_default() += size;
        Ok(())
    }
}

struct SimShell {
    host: String,
    sim: SimCluster,
}

#[async_trait]
impl RemoteShell for SimShell {
    async fn run(&self, command: &str) -> Result<(), ClientError> {
        let tokens: Vec<&str> = command.split_whitespace().collect();
        match tokens.as_slice() {
            ["true"] => Ok(()),
            ["rsync", "-avp", "-e", "'ssh", "-p", _, source, target] => {
                let partition = staged_partition(source)?;
                let (login, _) = target.split_once(':').ok_or("rsync: bad target")?;
                let (_, destination) = login.split_once('@').ok_or("rsync: missing user")?;
                self.sim.transfer(&self.host, &partition, destination).await
            }
            ["rm", "-rf", source] => {
                let partition = staged_partition(source)?;
                self.sim.remove_staged(&self.host, &partition);
                Ok(())
            }
            _ => Err(format!("unexpected command: {}", command).into()),
        }
    }
}

fn staged_partition(glob: &str) -> Result<String, ClientError> {
    glob.strip_prefix(STAGING)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|rest| rest.strip_suffix("_*"))
        .map(str::to_string)
        .ok_or_else(|| format!("path outside staging dir: {}", glob).into())
}
