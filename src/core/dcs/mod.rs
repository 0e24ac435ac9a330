// src/core/dcs/mod.rs

//! The capability contract the HA engine requires from a distributed
//! consensus store, and the factory that selects a concrete binding at
//! configuration time.
//!
//! The contract is deliberately small: an atomic snapshot read, CAS create
//! and update, TTL leases with explicit refresh, and delete-if-value. Any
//! backend providing those semantics can carry a cluster.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DcsConfig;
use crate::core::cluster::{ClusterView, FailoverRequest, Member};
use crate::core::{Result, StewardError};

pub mod etcd;

pub use self::etcd::EtcdClient;

/// Operations against the consensus store. All mutations are idempotent
/// under retry; CAS failures are reported as `false`, never as errors.
#[async_trait]
pub trait DcsClient: Send + Sync + std::fmt::Debug {
    /// Atomic read of initialize, leader, members and failover at one
    /// revision. Fails with `DcsUnavailable` on transport or quorum loss.
    async fn get_cluster(&self) -> Result<ClusterView>;

    /// Idempotent upsert of our own member record with a lease.
    async fn touch_member(&self, member: &Member, ttl: Duration) -> Result<()>;

    /// CAS-create `leader = name` iff the key is absent.
    async fn attempt_to_acquire_leader(&self, name: &str, ttl: Duration) -> Result<bool>;

    /// CAS-refresh the leader lease iff we still own it. `false` means
    /// ownership was lost and the caller must step down immediately.
    async fn update_leader(&self, name: &str, ttl: Duration) -> Result<bool>;

    /// Unconditional create, used only immediately after winning the
    /// initialize race (no prior leader can exist).
    async fn take_leader(&self, name: &str, ttl: Duration) -> Result<()>;

    /// CAS-create an arbitrary key iff absent. The bootstrap race runs on
    /// this.
    async fn race(&self, key: &str, value: &str) -> Result<bool>;

    /// CAS-delete the leader key iff we own it; idempotent.
    async fn delete_leader(&self, name: &str) -> Result<()>;

    async fn set_failover_value(&self, request: &FailoverRequest) -> Result<()>;

    async fn manual_failover_unset(&self) -> Result<()>;

    /// Publish the leader's current WAL position for lag-based eligibility.
    async fn write_leader_optime(&self, position: u64) -> Result<()>;

    /// Block until the leader key changes or `timeout` elapses. Returns
    /// `true` when a change was observed. Purely an optimization to shorten
    /// naps; failures degrade to a plain sleep.
    async fn watch(&self, timeout: Duration) -> Result<bool>;

    /// Remove every key of this cluster. Operator tooling only; the agent
    /// core never calls this.
    async fn delete_cluster(&self) -> Result<()>;
}

/// Selects and constructs the configured DCS binding.
pub fn from_config(
    config: &DcsConfig,
    scope: &str,
    request_timeout: Duration,
) -> Result<Arc<dyn DcsClient>> {
    match config.scheme.as_str() {
        "etcd" => Ok(Arc::new(EtcdClient::new(config, scope, request_timeout)?)),
        other => Err(StewardError::PreconditionFailed(format!(
            "We have not implemented this for DCS of type {other}"
        ))),
    }
}
