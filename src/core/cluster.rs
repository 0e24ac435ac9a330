// src/core/cluster.rs

//! The immutable cluster snapshot and its constituent records, as read from
//! the DCS at one revision. Every HA decision is made against exactly one
//! `ClusterView`; a stale view is never mixed with writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// A participant in the cluster, as stored under `members/<name>` in the DCS.
///
/// The record value is JSON carrying the database connection URL and the base
/// URL of the member's REST API. Older agents stored a bare connection string;
/// [`Member::from_record`] tolerates that form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub conn_url: String,
    pub api_url: String,
}

/// The serialized shape of a member record value (everything but the name,
/// which is the key).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberRecord {
    conn_url: String,
    #[serde(default)]
    api_url: String,
}

impl Member {
    pub fn new(name: &str, conn_url: &str, api_url: &str) -> Self {
        Self {
            name: name.to_string(),
            conn_url: conn_url.to_string(),
            api_url: api_url.to_string(),
        }
    }

    /// Parses a raw DCS record value into a `Member`. A value that is not
    /// JSON is treated as a bare connection URL with no API address.
    pub fn from_record(name: &str, value: &str) -> Self {
        match serde_json::from_str::<MemberRecord>(value) {
            Ok(rec) => Self {
                name: name.to_string(),
                conn_url: rec.conn_url,
                api_url: rec.api_url,
            },
            Err(_) => Self {
                name: name.to_string(),
                conn_url: value.to_string(),
                api_url: String::new(),
            },
        }
    }

    /// The record value to store in the DCS.
    pub fn to_record(&self) -> String {
        serde_json::json!({ "conn_url": self.conn_url, "api_url": self.api_url }).to_string()
    }

    /// Host and port extracted from the connection URL, for `dsn` output and
    /// recovery configuration.
    pub fn conn_host_port(&self) -> Option<(String, u16)> {
        let url = Url::parse(&self.conn_url).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port().unwrap_or(5432);
        Some((host, port))
    }
}

/// The holder of the `leader` lease at the snapshot's revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leader {
    /// The DCS modification index of the leader key, used as the watch cursor.
    pub index: u64,
    pub name: String,
    /// The leader's member record, when one exists at the same revision.
    pub member: Option<Member>,
}

/// An operator request stored under `failover`, consumed by the core when
/// acted upon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailoverRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl FailoverRequest {
    pub fn new(leader: Option<String>, candidate: Option<String>) -> Self {
        Self {
            leader,
            candidate,
            scheduled_at: None,
        }
    }

    /// Whether the request may be acted on yet.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }
}

/// An atomic read of `initialize`, `leader`, `members`, `failover` and the
/// leader's published WAL position, taken at one DCS revision.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    /// Present once the cluster has been bootstrapped; the value records the
    /// name of the member that won the initialization race.
    pub initialize: Option<String>,
    pub leader: Option<Leader>,
    pub members: Vec<Member>,
    pub failover: Option<FailoverRequest>,
    /// The WAL position last published by the leader, used for
    /// promotion-eligibility lag checks.
    pub last_leader_operation: Option<u64>,
}

impl ClusterView {
    pub fn is_initialized(&self) -> bool {
        self.initialize.is_some()
    }

    pub fn has_leader(&self) -> bool {
        self.leader.is_some()
    }

    pub fn leader_name(&self) -> Option<&str> {
        self.leader.as_ref().map(|l| l.name.as_str())
    }

    /// Whether `name` holds the lease in this snapshot.
    pub fn is_leader(&self, name: &str) -> bool {
        self.leader_name() == Some(name)
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.member(name).is_some()
    }

    /// The leader's member record, resolved either from the `Leader` itself
    /// or from the member list at the same revision.
    pub fn leader_member(&self) -> Option<&Member> {
        let leader = self.leader.as_ref()?;
        leader
            .member
            .as_ref()
            .or_else(|| self.member(&leader.name))
    }

    /// All members other than the current leader.
    pub fn replicas(&self) -> Vec<&Member> {
        self.members
            .iter()
            .filter(|m| Some(m.name.as_str()) != self.leader_name())
            .collect()
    }
}
