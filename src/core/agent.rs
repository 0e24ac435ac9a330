// src/core/agent.rs

//! The supervisor: bootstrap, tick cadence, member heartbeat, the REST
//! control surface, and the graceful shutdown path. It owns every lifecycle
//! object explicitly; there are no process-wide globals.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::config::Config;
use crate::core::cluster::Member;
use crate::core::dcs::{self, DcsClient};
use crate::core::executor::AsyncExecutor;
use crate::core::ha::Ha;
use crate::core::postgres::{DatabaseController, Postgres, StopMode};
use crate::core::Result;
use crate::server;

/// One agent process: a database, a DCS session, and the HA engine that
/// reconciles them once per tick.
pub struct Agent {
    config: Arc<Config>,
    dcs: Arc<dyn DcsClient>,
    db: Arc<dyn DatabaseController>,
    executor: Arc<AsyncExecutor>,
    ha: Arc<Ha>,
    shutdown: broadcast::Sender<()>,
}

impl Agent {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let dcs = dcs::from_config(&config.dcs, &config.scope, config.request_timeout())?;
        let db: Arc<dyn DatabaseController> =
            Arc::new(Postgres::new(config.postgresql.clone()));
        let executor = Arc::new(AsyncExecutor::new());
        let ha = Arc::new(Ha::new(
            dcs.clone(),
            db.clone(),
            executor.clone(),
            config.ttl,
            config.maximum_lag_on_failover,
        ));
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            config,
            dcs,
            db,
            executor,
            ha,
            shutdown,
        })
    }

    /// Our own member record as peers should see it.
    fn member_record(&self) -> Member {
        Member::new(
            self.db.name(),
            &self.db.connection_string(),
            &self.config.restapi.advertised_url(),
        )
    }

    async fn touch_member(&self, ttl: Duration) -> Result<()> {
        self.dcs.touch_member(&self.member_record(), ttl).await
    }

    /// Blocks until the DCS accepts our member record, then settles local
    /// state that does not need the tick loop: an instance that is already
    /// running keeps its replication slots warm.
    async fn bootstrap(&self) -> Result<()> {
        while let Err(e) = self.touch_member(self.config.ttl).await {
            info!("waiting on the DCS: {e}");
            sleep(Duration::from_secs(5)).await;
        }

        if !self.db.data_directory_empty().await? && self.db.is_running().await? {
            let cluster = self.dcs.get_cluster().await.unwrap_or_default();
            let names: Vec<String> = cluster.members.iter().map(|m| m.name.clone()).collect();
            if let Err(e) = self.db.load_replication_slots(&names).await {
                warn!("could not load replication slots: {e}");
            }
        }
        Ok(())
    }

    /// Runs the agent until a termination signal arrives, then walks the
    /// graceful release path.
    pub async fn run(self) -> Result<()> {
        spawn_zombie_reaper();
        self.bootstrap().await?;

        let api_state = server::ApiState {
            config: self.config.clone(),
            dcs: self.dcs.clone(),
            db: self.db.clone(),
            executor: self.executor.clone(),
            ha: self.ha.clone(),
        };
        tokio::spawn(server::run(
            api_state,
            self.config.restapi.listen.clone(),
            self.shutdown.subscribe(),
        ));

        let mut sigterm = termination_signal()?;
        loop {
            tokio::select! {
                _ = sigterm.recv() => break,
                _ = tokio::signal::ctrl_c() => break,
                _ = self.tick() => {}
            }
        }

        self.graceful_shutdown().await;
        Ok(())
    }

    /// One tick: heartbeat, cycle, nap. The nap is shortened when the DCS
    /// watch reports a leader change.
    async fn tick(&self) {
        if let Err(e) = self.touch_member(self.config.ttl).await {
            warn!("could not refresh the member record: {e}");
        }

        let outcome = self.ha.run_cycle().await;
        info!("{outcome}");

        let started = Instant::now();
        if let Ok(true) = self.dcs.watch(self.config.loop_wait).await {
            return;
        }
        let elapsed = started.elapsed();
        if elapsed < self.config.loop_wait {
            sleep(self.config.loop_wait - elapsed).await;
        }
    }

    /// Extend the member TTL so peers see a departure instead of a crash,
    /// stop the database, and release the lease if we hold it.
    async fn graceful_shutdown(&self) {
        info!("shutting down");
        self.executor.cancel();

        if let Err(e) = self.touch_member(self.config.shutdown_member_ttl()).await {
            warn!("could not extend the member record on shutdown: {e}");
        }
        if let Err(e) = self.db.stop(StopMode::Fast).await {
            warn!("could not stop the database on shutdown: {e}");
        }
        if let Err(e) = self.dcs.delete_leader(self.db.name()).await {
            warn!("could not release the session lease on shutdown: {e}");
        }
        let _ = self.shutdown.send(());
    }
}

#[cfg(unix)]
fn termination_signal() -> Result<tokio::signal::unix::Signal> {
    use tokio::signal::unix::{SignalKind, signal};
    signal(SignalKind::terminate()).map_err(Into::into)
}

/// The agent is the init-like parent of the database subprocesses it
/// spawns; reap whatever exits so no zombies accumulate.
#[cfg(unix)]
fn spawn_zombie_reaper() {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut sigchld) = signal(SignalKind::child()) else {
        warn!("could not install the SIGCHLD handler");
        return;
    };
    tokio::spawn(async move {
        loop {
            sigchld.recv().await;
            unsafe {
                while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}
            }
        }
    });
}
