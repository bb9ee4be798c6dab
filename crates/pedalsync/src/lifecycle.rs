//! Cooperative shutdown for the tasks of one session.
//!
//! A [`ShutdownCoordinator`] owns a single [`CancellationToken`] shared by every
//! task it runs. The first task to fail records its error and cancels the token,
//! which is how sibling tasks learn they should unwind. Teardown waits for the
//! tracked tasks up to a fixed timeout, then runs cleanup actions newest first.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;

type CleanupFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Cleanups {
    actions: Vec<(String, CleanupFn)>,
    /// Set once teardown has taken the list; later registrations run immediately.
    drained: bool,
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
    first_error: Arc<OnceLock<Arc<anyhow::Error>>>,
    cleanups: Mutex<Cleanups>,
    timeout: Duration,
    teardown_done: OnceCell<()>,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            first_error: Arc::new(OnceLock::new()),
            cleanups: Mutex::new(Cleanups::default()),
            timeout,
            teardown_done: OnceCell::new(),
        }
    }

    /// The token every tracked task observes.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The failure that triggered cancellation, if any task failed.
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.first_error.get().cloned()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Tasks spawned through [`run`](Self::run) that have not finished yet.
    pub fn tracked_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Spawn `task` with the shared token.
    ///
    /// A task returning [`TaskError::Failed`] records its error (only the first
    /// failure is kept) and cancels the token. [`TaskError::Cancelled`] is benign.
    pub fn run<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let token = self.token.clone();
        let first_error = Arc::clone(&self.first_error);
        let fut = task(self.token.clone());

        self.tracker.spawn(async move {
            debug!(task = name, "task started");
            match fut.await {
                Ok(()) => debug!(task = name, "task finished"),
                Err(TaskError::Cancelled) => debug!(task = name, "task cancelled"),
                Err(TaskError::Failed(err)) => {
                    let err = Arc::new(err.context(name));
                    if first_error.set(Arc::clone(&err)).is_ok() {
                        error!(task = name, error = %format!("{err:#}"), "task failed, cancelling session");
                    } else {
                        debug!(task = name, error = %format!("{err:#}"), "task failed after an earlier failure");
                    }
                    token.cancel();
                }
            }
        });
    }

    /// Register a teardown action. Actions run in reverse registration order.
    ///
    /// Registering after teardown has started runs the action immediately.
    pub fn add_cleanup<F>(&self, name: impl Into<String>, cleanup: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let mut cleanups = self.cleanups.lock().unwrap_or_else(PoisonError::into_inner);
        if cleanups.drained {
            drop(cleanups);
            debug!(cleanup = %name, "coordinator already torn down, running cleanup now");
            cleanup();
        } else {
            cleanups.actions.push((name, Box::new(cleanup)));
        }
    }

    /// Tear down on SIGINT or SIGTERM. The listener exits when the token is cancelled.
    pub fn start(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = coordinator.token.cancelled() => {}
                _ = termination_signal() => {
                    coordinator.shutdown().await;
                }
            }
        });
    }

    /// Block until the token is cancelled (a failure, a signal, or a caller), then tear down.
    pub async fn wait(&self) {
        self.token.cancelled().await;
        self.shutdown().await;
    }

    /// Cancel, wait up to the timeout for tracked tasks, then run cleanups newest first.
    ///
    /// Concurrent and repeated calls share one teardown and all return once it completes.
    pub async fn shutdown(&self) {
        self.teardown_done.get_or_init(|| self.teardown()).await;
    }

    async fn teardown(&self) {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        info!(tasks = self.tracker.len(), timeout_ms, "shutting down session tasks");

        self.token.cancel();
        self.tracker.close();

        match tokio::time::timeout(self.timeout, self.tracker.wait()).await {
            Ok(()) => debug!("all session tasks finished"),
            Err(_) => warn!(
                remaining = self.tracker.len(),
                timeout_ms,
                "timed out waiting for session tasks, forcing teardown"
            ),
        }

        let actions = {
            let mut cleanups = self.cleanups.lock().unwrap_or_else(PoisonError::into_inner);
            cleanups.drained = true;
            std::mem::take(&mut cleanups.actions)
        };

        for (name, action) in actions.into_iter().rev() {
            debug!(cleanup = %name, "running cleanup");
            action();
        }

        info!("session teardown complete");
    }
}

async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), stopping session"),
        _ = terminate => info!("Received SIGTERM, stopping session"),
    }
}
