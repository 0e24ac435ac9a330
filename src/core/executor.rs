// src/core/executor.rs

//! A single-slot background runner for long database actions (base-backup
//! clone, restart, reinitialize) so HA ticks stay bounded. At most one
//! action is ever in flight; while it runs, the engine restricts itself to
//! heartbeats.

use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::{Result, StewardError};

struct RunningAction {
    name: String,
    handle: JoinHandle<()>,
}

/// The one background slot shared by the HA engine and the REST API.
#[derive(Default)]
pub struct AsyncExecutor {
    slot: Mutex<Option<RunningAction>>,
}

impl AsyncExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `action` iff the slot is idle; rejects with `Busy` otherwise.
    pub fn run_async<F>(&self, name: &str, action: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock();
        if let Some(running) = slot.as_ref()
            && !running.handle.is_finished()
        {
            return Err(StewardError::Busy(running.name.clone()));
        }
        info!("starting background action: {name}");
        *slot = Some(RunningAction {
            name: name.to_string(),
            handle: tokio::spawn(action),
        });
        Ok(())
    }

    /// Whether an action is currently in flight.
    pub fn busy(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// The name of the in-flight action, if any.
    pub fn scheduled_action(&self) -> Option<String> {
        let slot = self.slot.lock();
        slot.as_ref()
            .filter(|running| !running.handle.is_finished())
            .map(|running| running.name.clone())
    }

    /// Aborts the in-flight action, if any.
    pub fn cancel(&self) {
        if let Some(running) = self.slot.lock().take() {
            if !running.handle.is_finished() {
                info!("cancelling background action: {}", running.name);
            }
            running.handle.abort();
        }
    }
}
