// src/config.rs

//! Manages agent configuration: loading, validation, and derived timing values.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// The top-level agent configuration, loaded from a TOML file.
///
/// Unknown keys are rejected rather than silently ignored: a typo in a
/// timing knob must fail loudly, not produce a cluster with surprise
/// failover behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The cluster name; all DCS keys live under `<namespace>/<scope>/`.
    pub scope: String,

    /// Seconds between HA ticks.
    #[serde(with = "humantime_serde", default = "default_loop_wait")]
    pub loop_wait: Duration,

    /// Leader and member lease duration. Must be at least `3 * loop_wait` so
    /// a healthy owner always refreshes well before expiry.
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub ttl: Duration,

    /// Maximum WAL lag (bytes) a replica may have and still be considered a
    /// promotion candidate. Absent means unbounded: any running replica may
    /// be promoted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_lag_on_failover: Option<u64>,

    pub dcs: DcsConfig,

    pub postgresql: PostgresConfig,

    #[serde(default)]
    pub restapi: RestApiConfig,
}

/// Where and how to reach the distributed consensus store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DcsConfig {
    #[serde(default = "default_dcs_scheme")]
    pub scheme: String,

    #[serde(default = "default_dcs_endpoints")]
    pub endpoints: Vec<Url>,

    /// Key prefix shared by all clusters on this DCS.
    #[serde(default = "default_dcs_namespace")]
    pub namespace: String,
}

impl Default for DcsConfig {
    fn default() -> Self {
        Self {
            scheme: default_dcs_scheme(),
            endpoints: default_dcs_endpoints(),
            namespace: default_dcs_namespace(),
        }
    }
}

/// A database user the controller creates and connects as.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// The replication user plus the network mask allowed to stream from us.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    #[serde(default = "default_replication_username")]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_replication_network")]
    pub network: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            username: default_replication_username(),
            password: None,
            network: default_replication_network(),
        }
    }
}

/// Everything the local database controller needs to drive one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresConfig {
    /// This member's unique name in the cluster.
    pub name: String,

    pub data_dir: PathBuf,

    /// Directory containing initdb, pg_ctl, pg_basebackup and psql. Absent
    /// means they are resolved from PATH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<PathBuf>,

    /// `host:port` the postmaster listens on.
    #[serde(default = "default_pg_listen")]
    pub listen: String,

    /// `host:port` advertised to peers in the member record; defaults to
    /// `listen`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_address: Option<String>,

    #[serde(default = "default_superuser")]
    pub superuser: UserConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Optional non-superuser connection account created at bootstrap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<UserConfig>,

    /// Extra server parameters passed at start time.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl PostgresConfig {
    /// The `host:port` peers should use to reach this database.
    pub fn advertised_address(&self) -> &str {
        self.connect_address.as_deref().unwrap_or(&self.listen)
    }
}

/// The REST control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestApiConfig {
    #[serde(default = "default_restapi_listen")]
    pub listen: String,

    /// `host:port` advertised in the member record; defaults to `listen`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_address: Option<String>,

    /// Optional `username:password` required on mutating endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl Default for RestApiConfig {
    fn default() -> Self {
        Self {
            listen: default_restapi_listen(),
            connect_address: None,
            auth: None,
        }
    }
}

impl RestApiConfig {
    pub fn advertised_url(&self) -> String {
        let addr = self.connect_address.as_deref().unwrap_or(&self.listen);
        format!("http://{addr}")
    }
}

fn default_loop_wait() -> Duration {
    Duration::from_secs(10)
}
fn default_ttl() -> Duration {
    Duration::from_secs(30)
}
fn default_dcs_scheme() -> String {
    "etcd".to_string()
}
fn default_dcs_endpoints() -> Vec<Url> {
    vec![Url::parse("http://127.0.0.1:2379").expect("static endpoint URL")]
}
fn default_dcs_namespace() -> String {
    "/service".to_string()
}
fn default_pg_listen() -> String {
    "127.0.0.1:5432".to_string()
}
fn default_superuser() -> UserConfig {
    UserConfig {
        username: "postgres".to_string(),
        password: None,
    }
}
fn default_replication_username() -> String {
    "replicator".to_string()
}
fn default_replication_network() -> String {
    "127.0.0.1/32".to_string()
}
fn default_restapi_listen() -> String {
    "127.0.0.1:8008".to_string()
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.scope.trim().is_empty() {
            return Err(anyhow!("scope cannot be empty"));
        }
        if self.postgresql.name.trim().is_empty() {
            return Err(anyhow!("postgresql.name cannot be empty"));
        }
        if self.loop_wait.is_zero() {
            return Err(anyhow!("loop_wait cannot be 0"));
        }
        if self.ttl < self.loop_wait * 3 {
            return Err(anyhow!(
                "ttl ({:?}) must be at least 3 * loop_wait ({:?})",
                self.ttl,
                self.loop_wait
            ));
        }
        if self.dcs.endpoints.is_empty() {
            return Err(anyhow!("dcs.endpoints cannot be empty"));
        }
        if self.postgresql.listen.split(':').count() != 2 {
            return Err(anyhow!(
                "postgresql.listen must be host:port, got '{}'",
                self.postgresql.listen
            ));
        }
        if self.restapi.listen.split(':').count() != 2 {
            return Err(anyhow!(
                "restapi.listen must be host:port, got '{}'",
                self.restapi.listen
            ));
        }
        if let Some(auth) = &self.restapi.auth
            && !auth.contains(':')
        {
            return Err(anyhow!("restapi.auth must be username:password"));
        }
        Ok(())
    }

    /// Timeout applied to every DCS and peer-API request. Bounded to half a
    /// tick so a slow DCS cannot stall the loop past its cadence.
    pub fn request_timeout(&self) -> Duration {
        (self.loop_wait / 2).max(Duration::from_secs(1))
    }

    /// The member-record TTL written on the way out of a graceful shutdown,
    /// long enough that peers observe a departure instead of a crash.
    pub fn shutdown_member_ttl(&self) -> Duration {
        (self.loop_wait * 5).max(Duration::from_secs(300))
    }
}
