//! Execution bridge: a dedicated run-loop thread for agent invocations.
//!
//! Agent invokers are cooperative and single-threaded, while stream
//! handlers run on the multi-threaded server runtime. The bridge owns one
//! OS thread driving a current-thread runtime with a `LocalSet`; callers
//! hand work over an unbounded channel and await a oneshot reply.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    rc::Rc,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use agent_hub_core::{
    AgentInvoker, ErrorKind, PendingInvocation, SessionAccess, SessionKey,
    traits::{InvokeError, StoreError},
};
use futures::FutureExt;
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinSet, LocalSet},
};
use tracing::{debug, error, info, warn};

use crate::slots::{BusyPolicy, InFlight, InFlightSlot, Lanes};

/// Default time allowed for running invocations to finish on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const RUN_LOOP_THREAD_NAME: &str = "agent-run-loop";

/// Bridge error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("Session busy: {0}")]
    SessionBusy(SessionKey),
    #[error("Execution bridge is shutting down")]
    ShuttingDown,
    #[error("Session not found: {0}")]
    NotFound(SessionKey),
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Failed to start run-loop: {0}")]
    Startup(String),
}

impl BridgeError {
    /// Client-facing category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionBusy(_) => ErrorKind::Concurrency,
            Self::ShuttingDown | Self::Startup(_) => ErrorKind::Shutdown,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Invoke(_) | Self::Timeout(_) | Self::Store(_) => ErrorKind::Upstream,
        }
    }
}

impl From<StoreError> for BridgeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::NotFound(key),
            StoreError::Internal(msg) => Self::Store(msg),
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub busy_policy: BusyPolicy,
    /// How long shutdown waits for running invocations.
    pub drain_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            busy_policy: BusyPolicy::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

type Reply = oneshot::Sender<Result<String, BridgeError>>;

struct Job {
    invocation: PendingInvocation,
    reply: Reply,
    _slot: InFlightSlot,
}

impl Job {
    fn fail(self, err: BridgeError) {
        let _ = self.reply.send(Err(err));
    }
}

enum Command {
    Run(Job),
    Stop,
}

/// Handle to an invocation's eventual outcome.
#[must_use = "the invocation result is only observable through this handle"]
pub struct PendingResult {
    key: SessionKey,
    rx: oneshot::Receiver<Result<String, BridgeError>>,
}

impl PendingResult {
    /// Session the invocation belongs to.
    #[must_use]
    pub fn session_key(&self) -> &str {
        &self.key
    }

    /// Wait for the result, suspending only the calling task.
    ///
    /// Timing out abandons the invocation: it may still run to completion,
    /// but its result is discarded and never recorded in history.
    ///
    /// # Errors
    /// Returns the invocation failure, `Timeout`, or `ShuttingDown` if the
    /// run-loop dropped the job.
    pub async fn await_result(self, timeout: Duration) -> Result<String, BridgeError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ShuttingDown),
            Err(_) => Err(BridgeError::Timeout(timeout)),
        }
    }
}

/// Hand-off point between request threads and the invocation run-loop.
pub struct ExecutionBridge {
    tx: mpsc::UnboundedSender<Command>,
    in_flight: InFlight,
    accepting: Arc<AtomicBool>,
    busy_policy: BusyPolicy,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ExecutionBridge {
    /// Spawn the run-loop thread and wait until it is ready.
    ///
    /// # Errors
    /// Returns `Startup` if the thread or its runtime cannot be created.
    pub fn start(
        invoker: Arc<dyn AgentInvoker>,
        sessions: Arc<dyn SessionAccess>,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let accepting = Arc::new(AtomicBool::new(true));

        let settings = LoopSettings {
            invoker,
            sessions,
            accepting: Arc::clone(&accepting),
            drain_timeout: config.drain_timeout,
        };

        let handle = thread::Builder::new()
            .name(RUN_LOOP_THREAD_NAME.to_string())
            .spawn(move || run_loop(settings, rx, &ready_tx))
            .map_err(|e| BridgeError::Startup(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => {
                let _ = handle.join();
                return Err(BridgeError::Startup(msg));
            }
            Err(_) => {
                let _ = handle.join();
                return Err(BridgeError::Startup("run-loop exited during startup".to_string()));
            }
        }

        info!(policy = ?config.busy_policy, "Execution bridge started");

        Ok(Self {
            tx,
            in_flight: InFlight::default(),
            accepting,
            busy_policy: config.busy_policy,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue an invocation on the run-loop.
    ///
    /// # Errors
    /// Returns `SessionBusy` under [`BusyPolicy::Reject`] when the session
    /// already has an invocation in flight, and `ShuttingDown` once shutdown
    /// has begun or the run-loop has died.
    pub fn submit(&self, invocation: PendingInvocation) -> Result<PendingResult, BridgeError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BridgeError::ShuttingDown);
        }

        let key = invocation.lease.key.clone();
        let slot = self
            .in_flight
            .acquire(&key, self.busy_policy)
            .map_err(BridgeError::SessionBusy)?;

        let (reply, rx) = oneshot::channel();
        let job = Job {
            invocation,
            reply,
            _slot: slot,
        };

        if self.tx.send(Command::Run(job)).is_err() {
            error!(session_key = %key, "Run-loop is gone, rejecting invocation");
            self.accepting.store(false, Ordering::Release);
            return Err(BridgeError::ShuttingDown);
        }

        Ok(PendingResult { key, rx })
    }

    /// Number of submitted but unfinished invocations for a session.
    #[must_use]
    pub fn in_flight(&self, key: &str) -> usize {
        self.in_flight.count(key)
    }

    /// Whether new submissions are accepted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop the run-loop.
    ///
    /// New submissions fail immediately, queued invocations that have not
    /// started fail with `ShuttingDown`, and running ones get the drain
    /// timeout to finish before they are aborted. Idempotent.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            debug!("Execution bridge already stopped");
        }
        let _ = self.tx.send(Command::Stop);

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => info!("Execution bridge stopped"),
            Ok(Err(_)) => error!("Run-loop thread panicked"),
            Err(e) => error!(error = %e, "Failed to join run-loop thread"),
        }
    }
}

impl Drop for ExecutionBridge {
    fn drop(&mut self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Command::Stop);
        }
    }
}

/// Everything the run-loop thread needs, moved in at spawn time.
struct LoopSettings {
    invoker: Arc<dyn AgentInvoker>,
    sessions: Arc<dyn SessionAccess>,
    accepting: Arc<AtomicBool>,
    drain_timeout: Duration,
}

fn run_loop(
    settings: LoopSettings,
    rx: mpsc::UnboundedReceiver<Command>,
    ready: &std::sync::mpsc::Sender<Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to build run-loop runtime");
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let state = Rc::new(RunLoop {
        settings,
        lanes: Lanes::default(),
    });
    LocalSet::new().block_on(&runtime, state.serve(rx));
}

/// State owned by the run-loop thread.
struct RunLoop {
    settings: LoopSettings,
    lanes: Lanes,
}

impl RunLoop {
    async fn serve(self: Rc<Self>, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut tasks = JoinSet::new();

        while let Some(command) = rx.recv().await {
            match command {
                Command::Run(job) => {
                    tasks.spawn_local(Rc::clone(&self).execute(job));
                }
                Command::Stop => break,
            }
            while tasks.try_join_next().is_some() {}
        }

        // Anything still queued in the channel never started.
        rx.close();
        let mut rejected = 0usize;
        while let Ok(command) = rx.try_recv() {
            if let Command::Run(job) = command {
                job.fail(BridgeError::ShuttingDown);
                rejected += 1;
            }
        }

        info!(running = tasks.len(), rejected, "Run-loop draining");

        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                timeout = ?self.settings.drain_timeout,
                "Drain timeout elapsed, aborting invocations"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    async fn execute(self: Rc<Self>, job: Job) {
        let Job {
            invocation,
            reply,
            _slot: slot,
        } = job;
        let key = invocation.lease.key.clone();
        let lane = self.lanes.get(&key);

        let result = {
            let _turn = lane.lock().await;
            if reply.is_closed() {
                Ok(None)
            } else if self.settings.accepting.load(Ordering::Acquire) {
                self.invoke(&invocation, &reply).await
            } else {
                Err(BridgeError::ShuttingDown)
            }
        };
        self.lanes.release(&key, lane);

        let result = match result {
            Ok(Some(text)) => Ok(text),
            Ok(None) => {
                debug!(session_key = %key, epoch = invocation.lease.epoch, "Caller gone, result discarded");
                return;
            }
            Err(e) => {
                warn!(session_key = %key, epoch = invocation.lease.epoch, error = %e, "Invocation failed");
                Err(e)
            }
        };

        // Free the slot before replying so a caller that sees the result can submit again.
        drop(slot);
        let _ = reply.send(result);
    }

    /// Run one invocation and record its result.
    ///
    /// Returns `None` without recording if the caller stopped waiting.
    async fn invoke(
        &self,
        invocation: &PendingInvocation,
        reply: &Reply,
    ) -> Result<Option<String>, BridgeError> {
        let snapshot = self.settings.sessions.load(&invocation.lease)?;

        let outcome = AssertUnwindSafe(self.settings.invoker.invoke(
            &snapshot.agent,
            &invocation.message,
            &snapshot.history,
        ))
        .catch_unwind()
        .await;

        let text = match outcome {
            Ok(result) => result?,
            Err(panic) => {
                return Err(InvokeError::Panicked(panic_message(panic.as_ref())).into());
            }
        };

        // A timed-out caller already got its failure.
        if reply.is_closed() {
            return Ok(None);
        }
        self.settings.sessions.record(&invocation.lease, text.clone())?;
        Ok(Some(text))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
