// src/core/dcs/etcd.rs

//! The etcd (v2 keys API) binding of the DCS contract.
//!
//! Cluster state lives under `/v2/keys/<namespace>/<scope>/`:
//! `initialize`, `leader`, `failover`, `members/<name>` and
//! `optime/leader`. CAS semantics map onto etcd's `prevExist` and
//! `prevValue` conditions; lease semantics onto per-key TTLs.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::DcsConfig;
use crate::core::cluster::{ClusterView, FailoverRequest, Leader, Member};
use crate::core::dcs::DcsClient;
use crate::core::{Result, StewardError};

// etcd v2 error codes we dispatch on.
const ETCD_KEY_NOT_FOUND: u64 = 100;
const ETCD_TEST_FAILED: u64 = 101;
const ETCD_NODE_EXIST: u64 = 105;

/// One node of the etcd v2 response tree.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EtcdNode {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(rename = "modifiedIndex", default)]
    pub modified_index: Option<u64>,
    #[serde(default)]
    pub nodes: Vec<EtcdNode>,
}

impl EtcdNode {
    fn basename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
struct EtcdResponse {
    #[serde(default)]
    node: Option<EtcdNode>,
    #[serde(rename = "errorCode", default)]
    error_code: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

/// DCS client speaking the etcd v2 HTTP API.
#[derive(Debug)]
pub struct EtcdClient {
    http: reqwest::Client,
    endpoints: Vec<Url>,
    /// `<namespace>/<scope>`, no leading or trailing slash.
    prefix: String,
    /// Watch cursor: the leader key's modifiedIndex from the last snapshot.
    leader_index: AtomicU64,
}

impl EtcdClient {
    pub fn new(config: &DcsConfig, scope: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let prefix = format!("{}/{}", config.namespace.trim_matches('/'), scope);
        Ok(Self {
            http,
            endpoints: config.endpoints.clone(),
            prefix,
            leader_index: AtomicU64::new(0),
        })
    }

    fn path_for(&self, key: &str) -> String {
        if key.is_empty() {
            format!("/v2/keys/{}", self.prefix)
        } else {
            format!("/v2/keys/{}/{}", self.prefix, key)
        }
    }

    /// Sends one request, trying each endpoint in order on transport
    /// failure. Any HTTP status is returned to the caller; only a full
    /// transport sweep or a 5xx maps to `DcsUnavailable`.
    async fn send(
        &self,
        method: Method,
        key: &str,
        form: &[(&str, String)],
        query: &[(&str, String)],
    ) -> Result<(StatusCode, EtcdResponse)> {
        let path = self.path_for(key);
        let mut last_error = String::new();

        for endpoint in &self.endpoints {
            let url = endpoint
                .join(&path)
                .map_err(|e| StewardError::Config(format!("invalid DCS endpoint: {e}")))?;
            let mut request = self.http.request(method.clone(), url);
            if !query.is_empty() {
                request = request.query(query);
            }
            if !form.is_empty() {
                request = request.form(form);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        return Err(StewardError::DcsUnavailable(format!(
                            "{method} {path}: {status}"
                        )));
                    }
                    let body: EtcdResponse = response.json().await.unwrap_or_default();
                    return Ok((status, body));
                }
                Err(e) => {
                    debug!("etcd endpoint {} failed: {}", endpoint, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(StewardError::DcsUnavailable(last_error))
    }

    /// Parses a raw etcd v2 recursive-read body into a snapshot. Exposed so
    /// tests can feed captured payloads without a live server.
    pub fn parse_cluster_response(body: &str) -> Result<ClusterView> {
        let response: EtcdResponse = serde_json::from_str(body)?;
        match response.node {
            Some(node) => Ok(parse_cluster(&node)),
            None => Ok(ClusterView::default()),
        }
    }
}

/// Builds a `ClusterView` from the scope directory node.
fn parse_cluster(root: &EtcdNode) -> ClusterView {
    let mut view = ClusterView::default();
    let mut leader_name: Option<(u64, String)> = None;

    for node in &root.nodes {
        match node.basename() {
            "initialize" => view.initialize = node.value.clone(),
            "leader" => {
                if let Some(value) = &node.value {
                    leader_name = Some((node.modified_index.unwrap_or(0), value.clone()));
                }
            }
            "failover" => {
                view.failover = node
                    .value
                    .as_deref()
                    .and_then(|v| serde_json::from_str::<FailoverRequest>(v).ok());
            }
            "members" => {
                for member_node in &node.nodes {
                    if let Some(value) = &member_node.value {
                        view.members
                            .push(Member::from_record(member_node.basename(), value));
                    }
                }
            }
            "optime" => {
                view.last_leader_operation = node
                    .nodes
                    .iter()
                    .find(|n| n.basename() == "leader")
                    .and_then(|n| n.value.as_deref())
                    .and_then(|v| v.parse().ok());
            }
            _ => {}
        }
    }

    if let Some((index, name)) = leader_name {
        let member = view.members.iter().find(|m| m.name == name).cloned();
        view.leader = Some(Leader {
            index,
            name,
            member,
        });
    }
    view
}

fn ttl_secs(ttl: Duration) -> String {
    ttl.as_secs().max(1).to_string()
}

#[async_trait]
impl DcsClient for EtcdClient {
    async fn get_cluster(&self) -> Result<ClusterView> {
        let (status, body) = self
            .send(
                Method::GET,
                "",
                &[],
                &[("recursive", "true".to_string())],
            )
            .await?;

        if status == StatusCode::NOT_FOUND {
            // The scope directory does not exist yet: an empty,
            // uninitialized cluster rather than a failure.
            if body.error_code == Some(ETCD_KEY_NOT_FOUND) || body.error_code.is_none() {
                return Ok(ClusterView::default());
            }
        }
        if !status.is_success() {
            return Err(StewardError::DcsUnavailable(format!(
                "cluster read failed: {status} {}",
                body.message.unwrap_or_default()
            )));
        }

        let view = match body.node {
            Some(node) => parse_cluster(&node),
            None => ClusterView::default(),
        };
        if let Some(leader) = &view.leader {
            self.leader_index.store(leader.index, Ordering::Relaxed);
        }
        Ok(view)
    }

    async fn touch_member(&self, member: &Member, ttl: Duration) -> Result<()> {
        let key = format!("members/{}", member.name);
        let form = [
            ("value", member.to_record()),
            ("ttl", ttl_secs(ttl)),
        ];
        let (status, body) = self.send(Method::PUT, &key, &form, &[]).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(StewardError::DcsUnavailable(format!(
                "member touch failed: {status} {}",
                body.message.unwrap_or_default()
            )))
        }
    }

    async fn attempt_to_acquire_leader(&self, name: &str, ttl: Duration) -> Result<bool> {
        let form = [
            ("value", name.to_string()),
            ("ttl", ttl_secs(ttl)),
            ("prevExist", "false".to_string()),
        ];
        let (status, body) = self.send(Method::PUT, "leader", &form, &[]).await?;
        if status.is_success() {
            return Ok(true);
        }
        if body.error_code == Some(ETCD_NODE_EXIST) {
            return Ok(false);
        }
        Err(StewardError::DcsUnavailable(format!(
            "leader acquisition failed: {status} {}",
            body.message.unwrap_or_default()
        )))
    }

    async fn update_leader(&self, name: &str, ttl: Duration) -> Result<bool> {
        let form = [
            ("value", name.to_string()),
            ("ttl", ttl_secs(ttl)),
            ("prevValue", name.to_string()),
        ];
        let (status, body) = self.send(Method::PUT, "leader", &form, &[]).await?;
        if status.is_success() {
            return Ok(true);
        }
        // Compare failure or an expired key both mean the lease is gone.
        match body.error_code {
            Some(ETCD_TEST_FAILED) | Some(ETCD_KEY_NOT_FOUND) => Ok(false),
            _ => Err(StewardError::DcsUnavailable(format!(
                "leader refresh failed: {status} {}",
                body.message.unwrap_or_default()
            ))),
        }
    }

    async fn take_leader(&self, name: &str, ttl: Duration) -> Result<()> {
        let form = [("value", name.to_string()), ("ttl", ttl_secs(ttl))];
        let (status, body) = self.send(Method::PUT, "leader", &form, &[]).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(StewardError::DcsUnavailable(format!(
                "take_leader failed: {status} {}",
                body.message.unwrap_or_default()
            )))
        }
    }

    async fn race(&self, key: &str, value: &str) -> Result<bool> {
        let form = [
            ("value", value.to_string()),
            ("prevExist", "false".to_string()),
        ];
        let (status, body) = self.send(Method::PUT, key, &form, &[]).await?;
        if status.is_success() {
            return Ok(true);
        }
        if body.error_code == Some(ETCD_NODE_EXIST) {
            return Ok(false);
        }
        Err(StewardError::DcsUnavailable(format!(
            "race on '{key}' failed: {status} {}",
            body.message.unwrap_or_default()
        )))
    }

    async fn delete_leader(&self, name: &str) -> Result<()> {
        let query = [("prevValue", name.to_string())];
        let (status, body) = self.send(Method::DELETE, "leader", &[], &query).await?;
        if status.is_success() {
            return Ok(());
        }
        // Already gone, or owned by someone else: both are fine for an
        // idempotent release.
        match body.error_code {
            Some(ETCD_KEY_NOT_FOUND) | Some(ETCD_TEST_FAILED) => Ok(()),
            _ => Err(StewardError::DcsUnavailable(format!(
                "leader release failed: {status} {}",
                body.message.unwrap_or_default()
            ))),
        }
    }

    async fn set_failover_value(&self, request: &FailoverRequest) -> Result<()> {
        let form = [("value", serde_json::to_string(request)?)];
        let (status, body) = self.send(Method::PUT, "failover", &form, &[]).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(StewardError::DcsUnavailable(format!(
                "failover write failed: {status} {}",
                body.message.unwrap_or_default()
            )))
        }
    }

    async fn manual_failover_unset(&self) -> Result<()> {
        let (status, body) = self.send(Method::DELETE, "failover", &[], &[]).await?;
        if status.is_success() || body.error_code == Some(ETCD_KEY_NOT_FOUND) {
            Ok(())
        } else {
            Err(StewardError::DcsUnavailable(format!(
                "failover unset failed: {status} {}",
                body.message.unwrap_or_default()
            )))
        }
    }

    async fn write_leader_optime(&self, position: u64) -> Result<()> {
        let form = [("value", position.to_string())];
        let (status, _) = self.send(Method::PUT, "optime/leader", &form, &[]).await?;
        if status.is_success() {
            Ok(())
        } else {
            // Best-effort: losing an optime write must never fail a tick.
            debug!("leader optime write returned {status}");
            Ok(())
        }
    }

    async fn watch(&self, timeout: Duration) -> Result<bool> {
        let wait_index = self.leader_index.load(Ordering::Relaxed) + 1;
        let path = self.path_for("leader");
        let Some(endpoint) = self.endpoints.first() else {
            return Ok(false);
        };
        let url = endpoint
            .join(&path)
            .map_err(|e| StewardError::Config(format!("invalid DCS endpoint: {e}")))?;

        let request = self
            .http
            .get(url)
            .query(&[
                ("wait", "true".to_string()),
                ("waitIndex", wait_index.to_string()),
            ])
            .timeout(timeout);

        // The watch is an optimization: any failure just means "no event".
        match request.send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    async fn delete_cluster(&self) -> Result<()> {
        let query = [
            ("recursive", "true".to_string()),
            ("dir", "true".to_string()),
        ];
        let (status, body) = self.send(Method::DELETE, "", &[], &query).await?;
        if status.is_success() || body.error_code == Some(ETCD_KEY_NOT_FOUND) {
            Ok(())
        } else {
            Err(StewardError::DcsUnavailable(format!(
                "cluster removal failed: {status} {}",
                body.message.unwrap_or_default()
            )))
        }
    }
}
