//! Cluster access
//!
//! [`ClusterClient`] owns, for every configured host, the catalog handle, the
//! remote shell handle and the lock guarding that host's staging directory
//! while it receives a partition. It is built once per run and shared by the
//! collector and every move executor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::catalog::HttpCatalogClient;
use crate::config::{ConfigError, RebalancerConfig};
use crate::error::{RebalanceError, Result};
use crate::shell::SshShell;

/// Error type returned by the collaborator traits
pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

// =============================================================================
// TRAITS FOR DEPENDENCY INJECTION
// =============================================================================

/// Catalog access for one node
#[async_trait::async_trait]
pub trait CatalogClient: Send + Sync {
    /// Compressed bytes per active partition of `table`
    async fn partition_sizes(
        &self,
        table: &str,
    ) -> std::result::Result<BTreeMap<String, u64>, ClientError>;

    /// Take a partition offline, keeping its files in the staging directory
    async fn detach_partition(
        &self,
        table: &str,
        partition: &str,
    ) -> std::result::Result<(), ClientError>;

    /// Register staged files as an active partition
    async fn attach_partition(
        &self,
        table: &str,
        partition: &str,
    ) -> std::result::Result<(), ClientError>;

    /// Check that the catalog answers
    async fn ping(&self) -> std::result::Result<(), ClientError> {
        Ok(())
    }
}

/// Remote command execution on one node
#[async_trait::async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(&self, command: &str) -> std::result::Result<(), ClientError>;
}

/// Handles for a single host
pub struct NodeHandle {
    pub host: String,
    pub catalog: Arc<dyn CatalogClient>,
    pub shell: Arc<dyn RemoteShell>,
    incoming: Arc<Mutex<()>>,
}

impl NodeHandle {
    /// Lock held while a partition is transferred into and attached on this host
    pub fn incoming_lock(&self) -> Arc<Mutex<()>> {
        self.incoming.clone()
    }
}

/// SSH account used between nodes when staged parts are copied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshLogin {
    pub user: String,
    pub port: u16,
}

impl SshLogin {
    pub fn new(user: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            port,
        }
    }
}

impl Default for SshLogin {
    fn default() -> Self {
        Self::new("root", 22)
    }
}

/// Per-node handles for one table across the cluster
pub struct ClusterClient {
    table: String,
    staging_dir: String,
    login: SshLogin,
    hosts: Vec<String>,
    nodes: HashMap<String, NodeHandle>,
}

impl ClusterClient {
    /// Create an empty client; nodes are added with [`ClusterClient::add_node`]
    pub fn new(table: impl Into<String>, staging_dir: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            staging_dir: staging_dir.into(),
            login: SshLogin::default(),
            hosts: Vec::new(),
            nodes: HashMap::new(),
        }
    }

    /// Use `login` for node-to-node copies
    pub fn with_login(mut self, login: SshLogin) -> Self {
        self.login = login;
        self
    }

    /// Register the handles of one host
    pub fn add_node(
        &mut self,
        host: impl Into<String>,
        catalog: Arc<dyn CatalogClient>,
        shell: Arc<dyn RemoteShell>,
    ) -> Result<()> {
        let host = host.into();
        if self.nodes.contains_key(&host) {
            return Err(ConfigError::InvalidValue(
                "hosts".to_string(),
                format!("duplicate host {}", host),
            )
            .into());
        }

        self.hosts.push(host.clone());
        self.nodes.insert(
            host.clone(),
            NodeHandle {
                host,
                catalog,
                shell,
                incoming: Arc::new(Mutex::new(())),
            },
        );
        Ok(())
    }

    /// Build handles for every configured host and verify each one answers
    ///
    /// Any unreachable catalog or shell aborts with a connection error.
    #[instrument(skip(config), fields(table = %config.table))]
    pub async fn connect(config: &RebalancerConfig) -> Result<Self> {
        config.validate()?;

        let mut cluster = Self::new(config.table.clone(), config.staging_dir())
            .with_login(SshLogin::new(&config.os_user, config.ssh_port));

        for host in &config.hosts {
            let catalog = HttpCatalogClient::new(
                host,
                config.port,
                &config.database,
                &config.username,
                &config.password,
            );
            let shell = SshShell::new(
                host,
                &config.os_user,
                config.ssh_port,
                config.os_password.clone(),
            );

            cluster.add_node(host.clone(), Arc::new(catalog), Arc::new(shell))?;
        }

        cluster.probe().await?;

        info!(nodes = cluster.hosts.len(), "Connected to cluster");
        Ok(cluster)
    }

    /// Ping every catalog and run a no-op command on every host
    pub async fn probe(&self) -> Result<()> {
        for host in &self.hosts {
            let node = &self.nodes[host];

            node.catalog
                .ping()
                .await
                .map_err(|e| RebalanceError::Connection {
                    host: host.clone(),
                    reason: format!("catalog: {}", e),
                })?;

            node.shell
                .run("true")
                .await
                .map_err(|e| RebalanceError::Connection {
                    host: host.clone(),
                    reason: format!("shell: {}", e),
                })?;

            debug!(host = %host, "Node reachable");
        }
        Ok(())
    }

    /// Hosts in configuration order
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn node(&self, host: &str) -> Option<&NodeHandle> {
        self.nodes.get(host)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn staging_dir(&self) -> &str {
        &self.staging_dir
    }

    /// Commands run on the source host to move a partition's staged parts
    /// into the destination's staging directory
    pub fn transfer_commands(&self, partition: &str, destination: &str) -> [String; 2] {
        transfer_commands(&self.staging_dir, partition, destination, &self.login)
    }

    pub fn login(&self) -> &SshLogin {
        &self.login
    }
}

/// Copy the partition's part directories to `destination`, then drop the local copy.
///
/// Detached part directories are named `<partition id>_<min block>_<max block>_<level>`.
/// The copy reaches the destination with the same SSH account and port the
/// rebalancer itself uses.
pub fn transfer_commands(
    staging_dir: &str,
    partition: &str,
    destination: &str,
    login: &SshLogin,
) -> [String; 2] {
    let staging_dir = staging_dir.trim_end_matches('/');
    [
        format!(
            "rsync -avp -e 'ssh -p {port}' {dir}/{partition}_* {user}@{destination}:{dir}/",
            port = login.port,
            dir = staging_dir,
            partition = partition,
            user = login.user,
            destination = destination
        ),
        format!(
            "rm -rf {dir}/{partition}_*",
            dir = staging_dir,
            partition = partition
        ),
    ]
}
