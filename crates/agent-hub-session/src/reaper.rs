//! Idle session reaper.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use agent_hub_core::AgentCleanup;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info};

use crate::{
    cleanup::{EndReason, release_session},
    store::SessionStore,
};

/// Background loop evicting sessions idle for longer than a threshold.
pub struct IdleReaper {
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IdleReaper {
    /// Start the reaper on the current tokio runtime.
    ///
    /// The first scan happens one `interval` after start.
    #[must_use]
    pub fn spawn(
        store: Arc<SessionStore>,
        cleanup: Option<Arc<dyn AgentCleanup>>,
        interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::scan(&store, cleanup.as_ref(), idle_timeout).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Idle reaper stopped");
        });

        info!(?interval, ?idle_timeout, "Idle reaper started");

        Self {
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Evict idle sessions once and clean up their agents.
    ///
    /// Returns the number of evicted sessions.
    pub async fn scan(
        store: &SessionStore,
        cleanup: Option<&Arc<dyn AgentCleanup>>,
        idle_timeout: Duration,
    ) -> usize {
        let evicted = match store.evict_older_than(idle_timeout) {
            Ok(evicted) => evicted,
            Err(e) => {
                error!(error = %e, "Idle scan failed");
                return 0;
            }
        };

        let count = evicted.len();
        for session in evicted {
            release_session(cleanup, session, EndReason::Idle).await;
        }
        if count > 0 {
            info!(evicted = count, remaining = store.len(), "Evicted idle sessions");
        }
        count
    }

    /// Stop the loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Idle reaper task failed");
            }
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
