// tests/support/mod.rs

//! Shared test doubles: an in-memory DCS honoring the CAS contract, a
//! scriptable database controller, and cluster snapshot fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use steward::core::cluster::{ClusterView, FailoverRequest, Leader, Member};
use steward::core::dcs::DcsClient;
use steward::core::postgres::{DatabaseController, StopMode};
use steward::core::{Result, StewardError};

pub fn member(name: &str) -> Member {
    Member::new(
        name,
        &format!("postgres://{name}:5432/postgres"),
        &format!("http://{name}:8008"),
    )
}

pub fn cluster_not_initialized() -> ClusterView {
    ClusterView::default()
}

pub fn cluster_initialized_without_leader() -> ClusterView {
    ClusterView {
        initialize: Some("leader".to_string()),
        leader: None,
        members: vec![member("leader"), member("other")],
        failover: None,
        last_leader_operation: None,
    }
}

pub fn cluster_initialized_with_leader() -> ClusterView {
    let mut view = cluster_initialized_without_leader();
    view.leader = Some(Leader {
        index: 1,
        name: "leader".to_string(),
        member: Some(member("leader")),
    });
    view
}

pub fn cluster_initialized_with_only_leader() -> ClusterView {
    ClusterView {
        initialize: Some("leader".to_string()),
        leader: Some(Leader {
            index: 1,
            name: "leader".to_string(),
            member: Some(member("leader")),
        }),
        members: vec![member("leader")],
        failover: None,
        last_leader_operation: None,
    }
}

#[derive(Default, Debug)]
struct DcsState {
    revision: u64,
    initialize: Option<String>,
    leader: Option<String>,
    leader_index: u64,
    members: Vec<Member>,
    failover: Option<FailoverRequest>,
    optime: Option<u64>,
}

/// In-memory DCS with linearizable CAS semantics, plus switches to fake an
/// outage and to serve deliberately stale snapshots (the way a racing peer
/// would observe the world between its read and its write).
#[derive(Default, Debug)]
pub struct MockDcs {
    state: Mutex<DcsState>,
    pub available: AtomicBool,
    pub hide_initialize_in_snapshot: AtomicBool,
    pub hide_leader_in_snapshot: AtomicBool,
    pub fail_update_leader: AtomicBool,
    pub update_leader_calls: AtomicU64,
}

impl MockDcs {
    pub fn new() -> Arc<Self> {
        let dcs = Self::default();
        dcs.available.store(true, Ordering::SeqCst);
        Arc::new(dcs)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StewardError::DcsUnavailable("simulated outage".to_string()))
        }
    }

    pub fn set_initialize(&self, value: &str) {
        self.state.lock().initialize = Some(value.to_string());
    }

    pub fn set_leader(&self, name: &str) {
        let mut state = self.state.lock();
        state.revision += 1;
        state.leader_index = state.revision;
        state.leader = Some(name.to_string());
    }

    pub fn add_member(&self, member: Member) {
        self.state.lock().members.push(member);
    }

    pub fn set_failover(&self, request: FailoverRequest) {
        self.state.lock().failover = Some(request);
    }

    /// Simulates TTL expiry of the leader key.
    pub fn expire_leader(&self) {
        self.state.lock().leader = None;
    }

    pub fn leader(&self) -> Option<String> {
        self.state.lock().leader.clone()
    }

    pub fn initialize(&self) -> Option<String> {
        self.state.lock().initialize.clone()
    }

    pub fn failover(&self) -> Option<FailoverRequest> {
        self.state.lock().failover.clone()
    }

    pub fn optime(&self) -> Option<u64> {
        self.state.lock().optime
    }

    pub fn set_optime(&self, position: u64) {
        self.state.lock().optime = Some(position);
    }
}

#[async_trait]
impl DcsClient for MockDcs {
    async fn get_cluster(&self) -> Result<ClusterView> {
        self.check_available()?;
        let state = self.state.lock();
        let mut view = ClusterView {
            initialize: state.initialize.clone(),
            leader: None,
            members: state.members.clone(),
            failover: state.failover.clone(),
            last_leader_operation: state.optime,
        };
        if self.hide_initialize_in_snapshot.load(Ordering::SeqCst) {
            view.initialize = None;
        }
        if !self.hide_leader_in_snapshot.load(Ordering::SeqCst)
            && let Some(name) = &state.leader
        {
            view.leader = Some(Leader {
                index: state.leader_index,
                name: name.clone(),
                member: view.members.iter().find(|m| &m.name == name).cloned(),
            });
        }
        Ok(view)
    }

    async fn touch_member(&self, member: &Member, _ttl: Duration) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.members.retain(|m| m.name != member.name);
        state.members.push(member.clone());
        Ok(())
    }

    async fn attempt_to_acquire_leader(&self, name: &str, _ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.leader.is_some() {
            return Ok(false);
        }
        state.revision += 1;
        state.leader_index = state.revision;
        state.leader = Some(name.to_string());
        Ok(true)
    }

    async fn update_leader(&self, name: &str, _ttl: Duration) -> Result<bool> {
        self.check_available()?;
        self.update_leader_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_update_leader.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self.state.lock().leader.as_deref() == Some(name))
    }

    async fn take_leader(&self, name: &str, _ttl: Duration) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        state.revision += 1;
        state.leader_index = state.revision;
        state.leader = Some(name.to_string());
        Ok(())
    }

    async fn race(&self, key: &str, value: &str) -> Result<bool> {
        self.check_available()?;
        if key != "initialize" {
            return Err(StewardError::Internal(format!("unexpected race key {key}")));
        }
        let mut state = self.state.lock();
        if state.initialize.is_some() {
            return Ok(false);
        }
        state.initialize = Some(value.to_string());
        Ok(true)
    }

    async fn delete_leader(&self, name: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.leader.as_deref() == Some(name) {
            state.leader = None;
        }
        Ok(())
    }

    async fn set_failover_value(&self, request: &FailoverRequest) -> Result<()> {
        self.check_available()?;
        self.state.lock().failover = Some(request.clone());
        Ok(())
    }

    async fn manual_failover_unset(&self) -> Result<()> {
        self.check_available()?;
        self.state.lock().failover = None;
        Ok(())
    }

    async fn write_leader_optime(&self, position: u64) -> Result<()> {
        self.check_available()?;
        self.state.lock().optime = Some(position);
        Ok(())
    }

    async fn watch(&self, _timeout: Duration) -> Result<bool> {
        Ok(false)
    }

    async fn delete_cluster(&self) -> Result<()> {
        self.check_available()?;
        *self.state.lock() = DcsState::default();
        Ok(())
    }
}

#[derive(Default)]
struct DbState {
    running: bool,
    data_empty: bool,
    /// `None`: configured as a primary. `Some(upstream)`: standby
    /// configuration present, possibly with no upstream (fenced).
    standby: Option<Option<String>>,
    ops: Vec<String>,
}

/// A scriptable database controller. The `ops` log records every mutation
/// so tests can assert what a tick did (or, during an outage, did not do).
pub struct MockDb {
    name: String,
    state: Mutex<DbState>,
    pub sync_ok: AtomicBool,
    xlog: Mutex<Option<u64>>,
}

impl MockDb {
    /// A node with an empty data directory and no running postmaster.
    pub fn empty(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(DbState {
                running: false,
                data_empty: true,
                standby: None,
                ops: Vec::new(),
            }),
            sync_ok: AtomicBool::new(true),
            xlog: Mutex::new(None),
        })
    }

    pub fn running_primary(name: &str) -> Arc<Self> {
        let db = Self::empty(name);
        {
            let mut state = db.state.lock();
            state.running = true;
            state.data_empty = false;
            state.standby = None;
        }
        db
    }

    pub fn running_replica(name: &str, upstream: &str) -> Arc<Self> {
        let db = Self::empty(name);
        {
            let mut state = db.state.lock();
            state.running = true;
            state.data_empty = false;
            state.standby = Some(Some(upstream.to_string()));
        }
        db
    }

    pub fn stopped_with_data(name: &str) -> Arc<Self> {
        let db = Self::empty(name);
        db.state.lock().data_empty = false;
        db
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn following(&self) -> Option<String> {
        self.state.lock().standby.clone().flatten()
    }

    pub fn is_standby(&self) -> bool {
        self.state.lock().standby.is_some()
    }

    pub fn set_xlog(&self, position: u64) {
        *self.xlog.lock() = Some(position);
    }

    fn record(&self, op: &str) {
        self.state.lock().ops.push(op.to_string());
    }
}

#[async_trait]
impl DatabaseController for MockDb {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection_string(&self) -> String {
        format!("postgres://postgres@{}:5432/postgres", self.name)
    }

    async fn data_directory_empty(&self) -> Result<bool> {
        Ok(self.state.lock().data_empty)
    }

    async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.data_empty = false;
        state.standby = None;
        state.ops.push("initialize".to_string());
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.running = true;
        state.ops.push("start".to_string());
        Ok(())
    }

    async fn stop(&self, mode: StopMode) -> Result<()> {
        let mut state = self.state.lock();
        state.running = false;
        state.ops.push(format!("stop:{mode:?}"));
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.running = true;
        state.ops.push("restart".to_string());
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.state.lock().running)
    }

    async fn is_leader(&self) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.running && state.standby.is_none())
    }

    async fn promote(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.standby = None;
        state.ops.push("promote".to_string());
        Ok(())
    }

    async fn demote(&self, leader: Option<&Member>) -> Result<()> {
        let mut state = self.state.lock();
        state.running = true;
        state.standby = Some(leader.map(|m| m.name.clone()));
        state.ops.push(format!(
            "demote:{}",
            leader.map(|m| m.name.as_str()).unwrap_or("none")
        ));
        Ok(())
    }

    async fn follow_the_leader(&self, leader: &Member) -> Result<()> {
        let already = self.state.lock().standby == Some(Some(leader.name.clone()));
        if already {
            return Ok(());
        }
        self.demote(Some(leader)).await
    }

    async fn sync_from_leader(&self, leader: &Member) -> Result<bool> {
        self.record(&format!("sync_from_leader:{}", leader.name));
        if !self.sync_ok.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.state.lock().data_empty = false;
        Ok(true)
    }

    async fn write_recovery_conf(&self, leader: Option<&Member>) -> Result<()> {
        let mut state = self.state.lock();
        state.standby = Some(leader.map(|m| m.name.clone()));
        state.ops.push("write_recovery_conf".to_string());
        Ok(())
    }

    async fn remove_data_directory(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.data_empty = true;
        state.ops.push("remove_data_directory".to_string());
        Ok(())
    }

    async fn create_replication_user(&self) -> Result<()> {
        self.record("create_replication_user");
        Ok(())
    }

    async fn create_connection_users(&self) -> Result<()> {
        self.record("create_connection_users");
        Ok(())
    }

    async fn load_replication_slots(&self, _member_names: &[String]) -> Result<()> {
        self.record("load_replication_slots");
        Ok(())
    }

    async fn xlog_position(&self) -> Result<Option<u64>> {
        Ok(*self.xlog.lock())
    }
}
