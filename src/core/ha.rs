// src/core/ha.rs

//! The per-tick HA decision engine.
//!
//! One call to `run_cycle` reads one cluster snapshot, inspects the local
//! database once, decides exactly one action, executes it (inline, or via
//! the single-slot executor when it is long), and reports the outcome. The
//! DCS's linearizable CAS is the only tie-break: two peers racing for a
//! vacant lease are resolved by whichever write lands, never by any local
//! heuristic.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::core::cluster::{ClusterView, FailoverRequest};
use crate::core::dcs::DcsClient;
use crate::core::executor::AsyncExecutor;
use crate::core::postgres::{DatabaseController, StopMode};
use crate::core::{Result, StewardError};

/// What one tick decided and did. The supervisor logs the rendered form.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    DcsUnavailable,
    LongActionInProgress(String),
    InitializedNewCluster,
    ClaimedExistingCluster,
    WaitingForBootstrap,
    BootstrappingFromLeader(String),
    AwaitingLeaderToBootstrap,
    StartingDatabase(String),
    AcquiredLease,
    PromotedSelfAfterAcquire,
    PromotedSelfAsOwner,
    NoActionLeader,
    DemotedAfterLeaseLoss,
    DemotedSplitBrain(String),
    FollowingLeader(String),
    AwaitingLeaderRecord(String),
    LostLeaderRace,
    NotEligible,
    ManualFailoverScheduled(DateTime<Utc>),
    ManualFailoverDiscarded(String),
    ManualFailoverReleased(String),
    PromotedByManualFailover,
    OwnershipConflict,
    Paused,
    CycleError(String),
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DcsUnavailable => write!(f, "lost connection to the DCS, deferring all actions"),
            Self::LongActionInProgress(name) => {
                write!(f, "long-running action in progress: {name}")
            }
            Self::InitializedNewCluster => write!(f, "initialized a new cluster as the leader"),
            Self::ClaimedExistingCluster => {
                write!(f, "registered the existing data directory as the cluster origin")
            }
            Self::WaitingForBootstrap => {
                write!(f, "waiting for another member to bootstrap the cluster")
            }
            Self::BootstrappingFromLeader(name) => {
                write!(f, "bootstrapping a replica from leader {name}")
            }
            Self::AwaitingLeaderToBootstrap => {
                write!(f, "cluster has no leader yet, cannot bootstrap a replica")
            }
            Self::StartingDatabase(name) => write!(f, "starting {name}"),
            Self::AcquiredLease => write!(f, "acquired the session lease as the leader"),
            Self::PromotedSelfAfterAcquire => {
                write!(f, "promoted self to leader by acquiring the session lease")
            }
            Self::PromotedSelfAsOwner => {
                write!(f, "promoted self to leader because i already held the session lease")
            }
            Self::NoActionLeader => write!(f, "no action. i am the leader with the lease"),
            Self::DemotedAfterLeaseLoss => {
                write!(f, "demoted self because the session lease was lost")
            }
            Self::DemotedSplitBrain(name) => {
                write!(f, "demoted self because {name} holds the session lease")
            }
            Self::FollowingLeader(name) => {
                write!(f, "no action. i am a secondary and i am following leader {name}")
            }
            Self::AwaitingLeaderRecord(name) => {
                write!(f, "leader {name} has no member record yet, deferring")
            }
            Self::LostLeaderRace => {
                write!(f, "failed to acquire the session lease, will follow the new leader")
            }
            Self::NotEligible => write!(
                f,
                "not promoting self because my replication lag exceeds the configured maximum"
            ),
            Self::ManualFailoverScheduled(at) => {
                write!(f, "manual failover scheduled for {at}, waiting")
            }
            Self::ManualFailoverDiscarded(reason) => {
                write!(f, "discarded manual failover request: {reason}")
            }
            Self::ManualFailoverReleased(name) => {
                write!(f, "released the session lease for a manual failover to {name}")
            }
            Self::PromotedByManualFailover => {
                write!(f, "promoted self to leader to complete a manual failover")
            }
            Self::OwnershipConflict => write!(
                f,
                "data directory is not empty but another member initialized the cluster"
            ),
            Self::Paused => write!(
                f,
                "database failure requires operator intervention, taking no action"
            ),
            Self::CycleError(msg) => write!(f, "error during cycle, will retry: {msg}"),
        }
    }
}

/// The HA engine. Holds no cluster state of its own: every decision is a
/// pure function of one snapshot and one database observation.
pub struct Ha {
    dcs: Arc<dyn DcsClient>,
    db: Arc<dyn DatabaseController>,
    executor: Arc<AsyncExecutor>,
    ttl: Duration,
    maximum_lag_on_failover: Option<u64>,
    paused: AtomicBool,
}

impl Ha {
    pub fn new(
        dcs: Arc<dyn DcsClient>,
        db: Arc<dyn DatabaseController>,
        executor: Arc<AsyncExecutor>,
        ttl: Duration,
        maximum_lag_on_failover: Option<u64>,
    ) -> Self {
        Self {
            dcs,
            db,
            executor,
            ttl,
            maximum_lag_on_failover,
            paused: AtomicBool::new(false),
        }
    }

    /// Whether a fatal database condition has frozen this node.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Clears the paused state after operator intervention (reinitialize).
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// One tick. Never panics and never lets a database error poison the
    /// member heartbeat: failures are folded into the outcome.
    pub async fn run_cycle(&self) -> CycleOutcome {
        match self.try_run_cycle().await {
            Ok(outcome) => outcome,
            Err(StewardError::DcsUnavailable(e)) => {
                warn!("DCS unavailable during cycle: {e}");
                CycleOutcome::DcsUnavailable
            }
            Err(StewardError::Busy(name)) => CycleOutcome::LongActionInProgress(name),
            Err(StewardError::DbFatal(msg)) => {
                error!("fatal database error: {msg}");
                if let Err(e) = self.db.stop(StopMode::Immediate).await {
                    warn!("could not stop the database after a fatal error: {e}");
                }
                // The lease is deliberately left in place: releasing it
                // would invite a failover onto a cluster whose data needs a
                // human first.
                self.paused.store(true, Ordering::Relaxed);
                CycleOutcome::Paused
            }
            Err(e) => {
                warn!("cycle failed: {e}");
                CycleOutcome::CycleError(e.to_string())
            }
        }
    }

    async fn try_run_cycle(&self) -> Result<CycleOutcome> {
        // A failed read means a skipped tick: no writes, no database
        // mutation, and no inference about the lease until a successful
        // read says otherwise.
        let cluster = self.dcs.get_cluster().await?;
        let me = self.db.name().to_string();

        if self.is_paused() {
            if cluster.is_leader(&me) {
                self.dcs.update_leader(&me, self.ttl).await?;
            }
            return Ok(CycleOutcome::Paused);
        }

        // While a long action runs it owns the database; we only keep our
        // leases warm.
        if let Some(action) = self.executor.scheduled_action() {
            if cluster.is_leader(&me) {
                self.dcs.update_leader(&me, self.ttl).await?;
            }
            return Ok(CycleOutcome::LongActionInProgress(action));
        }

        if !cluster.is_initialized() {
            return self.bootstrap().await;
        }

        if self.db.data_directory_empty().await? {
            return self.bootstrap_as_replica(&cluster).await;
        }

        if !self.db.is_running().await? {
            return self.schedule_start();
        }

        if let Some(request) = cluster.failover.clone()
            && let Some(outcome) = self.process_manual_failover(&cluster, &request).await?
        {
            return Ok(outcome);
        }

        if cluster.has_leader() {
            self.process_healthy_cluster(&cluster, &me).await
        } else {
            self.process_leader_vacancy(&cluster, &me).await
        }
    }

    /// First contact with an uninitialized cluster: race the `initialize`
    /// marker. The marker, once set, is never touched again by the agent.
    async fn bootstrap(&self) -> Result<CycleOutcome> {
        let me = self.db.name().to_string();

        if !self.db.data_directory_empty().await? {
            return if self.dcs.race("initialize", &me).await? {
                Ok(CycleOutcome::ClaimedExistingCluster)
            } else {
                // Someone else owns the cluster origin while we hold data
                // from somewhere; refuse to guess and let the normal
                // follow/demote path reconcile us on later ticks.
                Ok(CycleOutcome::OwnershipConflict)
            };
        }

        if self.dcs.race("initialize", &me).await? {
            self.db.initialize().await?;
            self.dcs.take_leader(&me, self.ttl).await?;
            self.db.start().await?;
            self.db.create_replication_user().await?;
            self.db.create_connection_users().await?;
            Ok(CycleOutcome::InitializedNewCluster)
        } else {
            // Lost the race: the winner will appear as leader, and the
            // empty-data-directory path will clone from it.
            debug!("lost the initialization race");
            Ok(CycleOutcome::WaitingForBootstrap)
        }
    }

    /// Empty data directory in an initialized cluster: base-copy from the
    /// leader in the background.
    async fn bootstrap_as_replica(&self, cluster: &ClusterView) -> Result<CycleOutcome> {
        let Some(leader) = cluster.leader_member().cloned() else {
            return Ok(CycleOutcome::AwaitingLeaderToBootstrap);
        };

        let db = self.db.clone();
        let leader_name = leader.name.clone();
        self.executor.run_async("bootstrapping from leader", async move {
            match db.sync_from_leader(&leader).await {
                Ok(true) => {
                    if let Err(e) = db.write_recovery_conf(Some(&leader)).await {
                        warn!("could not write recovery configuration: {e}");
                        return;
                    }
                    if let Err(e) = db.start().await {
                        warn!("could not start the cloned replica: {e}");
                    }
                }
                Ok(false) => {
                    warn!("base backup from '{}' did not complete, will retry", leader.name)
                }
                Err(e) => warn!("base backup from '{}' failed: {e}", leader.name),
            }
        })?;
        Ok(CycleOutcome::BootstrappingFromLeader(leader_name))
    }

    /// The database is down: bring it back in the background and report.
    fn schedule_start(&self) -> Result<CycleOutcome> {
        let db = self.db.clone();
        let name = self.db.name().to_string();
        self.executor.run_async("starting the database", async move {
            if let Err(e) = db.start().await {
                warn!("background start failed: {e}");
            }
        })?;
        Ok(CycleOutcome::StartingDatabase(name))
    }

    /// A leader exists in the snapshot. Either it is us (refresh or finish
    /// promoting) or it is a peer (follow it, healing split brain first).
    async fn process_healthy_cluster(
        &self,
        cluster: &ClusterView,
        me: &str,
    ) -> Result<CycleOutcome> {
        if cluster.is_leader(me) {
            if !self.dcs.update_leader(me, self.ttl).await? {
                // The lease is gone. Leave the LEADER role before any other
                // database mutation; the upstream to follow is unknown
                // until the next snapshot, so fence as a bare standby.
                self.db.demote(None).await?;
                return Ok(CycleOutcome::DemotedAfterLeaseLoss);
            }
            if !self.db.is_leader().await? {
                self.db.promote().await?;
                let names: Vec<String> =
                    cluster.members.iter().map(|m| m.name.clone()).collect();
                if let Err(e) = self.db.load_replication_slots(&names).await {
                    debug!("could not load replication slots: {e}");
                }
                return Ok(CycleOutcome::PromotedSelfAsOwner);
            }
            self.publish_leader_optime().await;
            return Ok(CycleOutcome::NoActionLeader);
        }

        let leader_name = cluster.leader_name().unwrap_or_default().to_string();
        let Some(leader) = cluster.leader_member().cloned() else {
            return Ok(CycleOutcome::AwaitingLeaderRecord(leader_name));
        };

        if self.db.is_leader().await? {
            self.db.demote(Some(&leader)).await?;
            Ok(CycleOutcome::DemotedSplitBrain(leader_name))
        } else {
            self.db.follow_the_leader(&leader).await?;
            Ok(CycleOutcome::FollowingLeader(leader_name))
        }
    }

    /// No leader in the snapshot: attempt to take the lease if eligible.
    /// The CAS outcome is the only arbiter.
    async fn process_leader_vacancy(
        &self,
        cluster: &ClusterView,
        me: &str,
    ) -> Result<CycleOutcome> {
        if !self.is_promotion_candidate(cluster).await? {
            return Ok(CycleOutcome::NotEligible);
        }

        if self.dcs.attempt_to_acquire_leader(me, self.ttl).await? {
            if self.db.is_leader().await? {
                return Ok(CycleOutcome::AcquiredLease);
            }
            self.db.promote().await?;
            Ok(CycleOutcome::PromotedSelfAfterAcquire)
        } else {
            // A peer won. The snapshot is now stale; the next tick will
            // read who and follow them.
            Ok(CycleOutcome::LostLeaderRace)
        }
    }

    /// A node may take a vacant lease iff its database is running and, for
    /// replicas, its replication lag is within `maximum_lag_on_failover`.
    /// Unknown lag counts as eligible. A running primary (for instance one
    /// whose lease expired during a DCS outage) may always reclaim.
    async fn is_promotion_candidate(&self, cluster: &ClusterView) -> Result<bool> {
        if self.db.is_leader().await? {
            return Ok(true);
        }
        let Some(max_lag) = self.maximum_lag_on_failover else {
            return Ok(true);
        };
        let Some(leader_position) = cluster.last_leader_operation else {
            return Ok(true);
        };
        let Some(my_position) = self.db.xlog_position().await? else {
            return Ok(true);
        };
        Ok(leader_position.saturating_sub(my_position) <= max_lag)
    }

    /// Best-effort publication of the leader's WAL position for candidate
    /// lag checks; never fails the tick.
    async fn publish_leader_optime(&self) {
        match self.db.xlog_position().await {
            Ok(Some(position)) => {
                if let Err(e) = self.dcs.write_leader_optime(position).await {
                    debug!("could not publish leader optime: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => debug!("could not read the WAL position: {e}"),
        }
    }

    /// Handles an operator failover request found in the snapshot. Returns
    /// `None` when the request is not ours to act on this tick.
    async fn process_manual_failover(
        &self,
        cluster: &ClusterView,
        request: &FailoverRequest,
    ) -> Result<Option<CycleOutcome>> {
        if !request.is_due(Utc::now()) {
            let at = request.scheduled_at.expect("not due implies scheduled_at");
            return Ok(Some(CycleOutcome::ManualFailoverScheduled(at)));
        }

        let me = self.db.name();

        if cluster.is_leader(me) {
            if let Some(requested) = &request.leader
                && requested != me
            {
                self.dcs.manual_failover_unset().await?;
                return Ok(Some(CycleOutcome::ManualFailoverDiscarded(format!(
                    "request names '{requested}' as leader but the lease is held by {me}"
                ))));
            }

            let Some(candidate_name) = request.candidate.as_deref() else {
                self.dcs.manual_failover_unset().await?;
                return Ok(Some(CycleOutcome::ManualFailoverDiscarded(
                    "no candidate named".to_string(),
                )));
            };
            if candidate_name == me {
                self.dcs.manual_failover_unset().await?;
                return Ok(Some(CycleOutcome::ManualFailoverDiscarded(
                    "target and source are the same".to_string(),
                )));
            }
            let Some(candidate) = cluster.member(candidate_name).cloned() else {
                // A candidate without a live member record is dead or gone;
                // never fail over onto it.
                self.dcs.manual_failover_unset().await?;
                return Ok(Some(CycleOutcome::ManualFailoverDiscarded(format!(
                    "candidate {candidate_name} has no member record"
                ))));
            };

            // Graceful release: consume the request, drop the lease, then
            // rewire ourselves under the candidate. The candidate observes
            // the vacancy and acquires on its next tick.
            self.dcs.manual_failover_unset().await?;
            self.dcs.delete_leader(me).await?;
            self.db.demote(Some(&candidate)).await?;
            return Ok(Some(CycleOutcome::ManualFailoverReleased(candidate.name)));
        }

        if request.candidate.as_deref() == Some(me) {
            if cluster.has_leader() {
                // The named leader has not released yet; nothing for us to
                // do until the lease is vacated.
                return Ok(None);
            }
            if self.dcs.attempt_to_acquire_leader(me, self.ttl).await? {
                self.dcs.manual_failover_unset().await?;
                if !self.db.is_leader().await? {
                    self.db.promote().await?;
                }
                return Ok(Some(CycleOutcome::PromotedByManualFailover));
            }
            return Ok(None);
        }

        Ok(None)
    }
}
