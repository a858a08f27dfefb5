//! ClickHouse catalog client
//!
//! Implements [`CatalogClient`] over the ClickHouse HTTP interface.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::cluster::{CatalogClient, ClientError};

/// Catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Malformed row: {0:?}")]
    MalformedRow(String),
}

/// Catalog client talking to one node's HTTP port
pub struct HttpCatalogClient {
    host: String,
    url: String,
    database: String,
    username: String,
    password: String,
    http: reqwest::Client,
}

impl HttpCatalogClient {
    /// Create a new catalog client
    pub fn new(host: &str, port: u16, database: &str, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            url: format!("http://{}:{}/", host, port),
            database: database.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Run one statement and return the response body
    async fn execute(&self, sql: &str) -> Result<String, CatalogError> {
        debug!(host = %self.host, sql = sql, "Executing catalog statement");

        let response = self
            .http
            .post(&self.url)
            .query(&[("database", self.database.as_str())])
            .header("X-ClickHouse-User", &self.username)
            .header("X-ClickHouse-Key", &self.password)
            .body(sql.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(CatalogError::Server {
                status: status.as_u16(),
                message: body.trim().to_string(),
            });
        }

        Ok(body)
    }

    fn qualified(&self, table: &str) -> String {
        format!("`{}`.`{}`", self.database, table)
    }
}

/// Per-partition compressed size of the active parts of a table
pub fn partition_sizes_sql(database: &str, table: &str) -> String {
    format!(
        "SELECT partition_id, sum(data_compressed_bytes) AS compressed \
         FROM system.parts \
         WHERE database = {} AND table = {} AND active = 1 \
         GROUP BY partition_id ORDER BY partition_id \
         FORMAT TabSeparated",
        quote(database),
        quote(table)
    )
}

/// Parse `partition_id<TAB>bytes` rows
pub fn parse_partition_sizes(body: &str) -> Result<BTreeMap<String, u64>, CatalogError> {
    let mut sizes = BTreeMap::new();

    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let (partition, size) = line
            .split_once('\t')
            .ok_or_else(|| CatalogError::MalformedRow(line.to_string()))?;
        let size: u64 = size
            .trim()
            .parse()
            .map_err(|_| CatalogError::MalformedRow(line.to_string()))?;
        sizes.insert(partition.to_string(), size);
    }

    Ok(sizes)
}

/// Single-quoted string literal
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[async_trait::async_trait]
impl CatalogClient for HttpCatalogClient {
    #[instrument(skip(self), fields(host = %self.host))]
    async fn partition_sizes(&self, table: &str) -> Result<BTreeMap<String, u64>, ClientError> {
        let body = self
            .execute(&partition_sizes_sql(&self.database, table))
            .await?;
        let sizes = parse_partition_sizes(&body)?;

        debug!(partitions = sizes.len(), "Collected partition sizes");
        Ok(sizes)
    }

    async fn detach_partition(&self, table: &str, partition: &str) -> Result<(), ClientError> {
        let sql = format!(
            "ALTER TABLE {} DETACH PARTITION ID {}",
            self.qualified(table),
            quote(partition)
        );
        self.execute(&sql).await?;
        Ok(())
    }

    async fn attach_partition(&self, table: &str, partition: &str) -> Result<(), ClientError> {
        let sql = format!(
            "ALTER TABLE {} ATTACH PARTITION ID {}",
            self.qualified(table),
            quote(partition)
        );
        self.execute(&sql).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.execute("SELECT 1").await?;
        Ok(())
    }
}
