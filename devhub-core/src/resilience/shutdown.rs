//! Graceful shutdown coordination.
//!
//! Steps (plain callbacks or [`GracefulShutdown`] components) run in reverse
//! registration order, each under its own panic guard, until a shared deadline
//! expires. Every failure is collected into one aggregate error.
//!
//! # Example
//!
//! ```no_run
//! use devhub_core::resilience::shutdown::{ShutdownCoordinator, ShutdownSignal};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let signal = ShutdownSignal::new();
//! let coordinator = ShutdownCoordinator::new(Duration::from_secs(30));
//!
//! coordinator.on_shutdown("flush-buffers", || async {
//!     Ok::<_, std::io::Error>(())
//! });
//!
//! signal.wait().await;
//! coordinator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::resilience::recovery::panic_message;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::signal;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Process shutdown signal (SIGINT, SIGTERM or a manual trigger).
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for SIGINT, SIGTERM or [`trigger`](Self::trigger).
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
            _ = terminate => info!("Received SIGTERM"),
            _ = self.token.cancelled() => info!("Shutdown triggered"),
        }

        self.token.cancel();
    }

    /// Check if shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Manually trigger shutdown
    pub fn trigger(&self) {
        info!("Manually triggering shutdown");
        self.token.cancel();
    }

    /// Token cancelled once shutdown is triggered, for handing to servers and loops.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Trait for components that support graceful shutdown
#[async_trait]
pub trait GracefulShutdown: Send + Sync {
    /// Perform graceful shutdown
    async fn shutdown(&self) -> Result<(), ShutdownError>;

    /// Get the name of this component
    fn name(&self) -> &str;
}

/// Shutdown errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    /// The deadline expired before every step ran
    #[error("shutdown timed out after {0:?}")]
    Timeout(Duration),

    /// A step returned an error
    #[error("component {component} shutdown failed: {reason}")]
    ComponentFailed { component: String, reason: String },

    /// A step panicked
    #[error("shutdown step {component} panicked: {message}")]
    Panicked { component: String, message: String },

    /// Already shutting down
    #[error("shutdown already in progress")]
    AlreadyShuttingDown,

    /// More than one step failed
    #[error("{} shutdown steps failed", .0.len())]
    Aggregate(Vec<ShutdownError>),
}

impl ShutdownError {
    /// Collapse a list of failures: none is success, one is returned as-is.
    fn from_errors(mut errors: Vec<ShutdownError>) -> Result<(), ShutdownError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ShutdownError::Aggregate(errors)),
        }
    }

    /// Every individual failure, flattening aggregates.
    pub fn failures(&self) -> Vec<&ShutdownError> {
        match self {
            ShutdownError::Aggregate(errors) => errors.iter().flat_map(|e| e.failures()).collect(),
            other => vec![other],
        }
    }
}

type StepFn = Box<dyn Fn() -> BoxFuture<'static, Result<(), ShutdownError>> + Send + Sync>;

struct ShutdownStep {
    name: String,
    run: StepFn,
}

/// Coordinator for graceful shutdown
pub struct ShutdownCoordinator {
    timeout: Duration,
    steps: Mutex<Vec<ShutdownStep>>,
    is_shutting_down: AtomicBool,
}

impl ShutdownCoordinator {
    /// Create a coordinator whose whole shutdown is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            steps: Mutex::new(Vec::new()),
            is_shutting_down: AtomicBool::new(false),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a shutdown callback. Callbacks run last-registered first.
    pub fn on_shutdown<F, Fut, E>(&self, name: impl Into<String>, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        let name = name.into();
        let component = name.clone();
        let run: StepFn = Box::new(move || {
            let fut = f();
            let component = component.clone();
            Box::pin(async move {
                fut.await.map_err(|e| ShutdownError::ComponentFailed {
                    component,
                    reason: e.to_string(),
                })
            })
        });
        self.push(ShutdownStep { name, run });
    }

    /// Register a component for graceful shutdown
    pub fn register_component(&self, component: Arc<dyn GracefulShutdown>) {
        let name = component.name().to_string();
        let run: StepFn = Box::new(move || {
            let component = component.clone();
            Box::pin(async move { component.shutdown().await })
        });
        self.push(ShutdownStep { name, run });
    }

    /// Names of registered steps in execution order.
    pub fn step_names(&self) -> Vec<String> {
        self.lock().iter().rev().map(|s| s.name.clone()).collect()
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Run every step under the configured timeout.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.shutdown_until(Instant::now() + self.timeout).await
    }

    /// Run every step, abandoning the rest once `deadline` passes.
    pub async fn shutdown_until(&self, deadline: Instant) -> Result<(), ShutdownError> {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ShutdownError::AlreadyShuttingDown);
        }

        let steps = std::mem::take(&mut *self.lock());
        let total = steps.len();
        let started = Instant::now();
        info!(steps = total, "Starting graceful shutdown");

        let mut errors = Vec::new();
        for (done, step) in steps.iter().rev().enumerate() {
            debug!(step = %step.name, "Running shutdown step");
            let guarded = AssertUnwindSafe(async { (step.run)().await }).catch_unwind();

            match timeout_at(deadline, guarded).await {
                Ok(Ok(Ok(()))) => info!(step = %step.name, "Shutdown step completed"),
                Ok(Ok(Err(e))) => {
                    warn!(step = %step.name, error = %e, "Shutdown step failed");
                    errors.push(e);
                }
                Ok(Err(payload)) => {
                    let message = panic_message(payload.as_ref());
                    error!(step = %step.name, panic = %message, "Shutdown step panicked");
                    errors.push(ShutdownError::Panicked {
                        component: step.name.clone(),
                        message,
                    });
                }
                Err(_) => {
                    warn!(
                        step = %step.name,
                        skipped = total - done - 1,
                        "Shutdown deadline expired"
                    );
                    errors.push(ShutdownError::Timeout(started.elapsed()));
                    break;
                }
            }
        }

        match &errors[..] {
            [] => info!("Graceful shutdown completed"),
            failures => warn!(failures = failures.len(), "Graceful shutdown completed with errors"),
        }
        ShutdownError::from_errors(errors)
    }

    fn push(&self, step: ShutdownStep) {
        debug!(step = %step.name, "Registered shutdown step");
        self.lock().push(step);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ShutdownStep>> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("timeout", &self.timeout)
            .field("steps", &self.step_names())
            .field("is_shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record(
        coordinator: &ShutdownCoordinator,
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) {
        let log = log.clone();
        coordinator.on_shutdown(name, move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
                Ok::<_, io::Error>(())
            }
        });
    }

    struct Component {
        name: String,
        fail: bool,
    }

    #[async_trait]
    impl GracefulShutdown for Component {
        async fn shutdown(&self) -> Result<(), ShutdownError> {
            if self.fail {
                Err(ShutdownError::ComponentFailed {
                    component: self.name.clone(),
                    reason: "still busy".to_string(),
                })
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_reverse_order() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let log = recorder();
        record(&coordinator, &log, "first");
        record(&coordinator, &log, "second");
        record(&coordinator, &log, "third");

        assert_eq!(coordinator.step_names(), vec!["third", "second", "first"]);
        coordinator.shutdown().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_panicking_step_does_not_stop_others() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let log = recorder();
        record(&coordinator, &log, "first");
        coordinator.on_shutdown("explodes", || async {
            if true {
                panic!("cleanup exploded");
            }
            Ok::<_, io::Error>(())
        });
        record(&coordinator, &log, "last");

        let err = coordinator.shutdown().await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["last", "first"]);
        assert_eq!(
            err,
            ShutdownError::Panicked {
                component: "explodes".to_string(),
                message: "cleanup exploded".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_failures_are_aggregated() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register_component(Arc::new(Component {
            name: "pools".to_string(),
            fail: true,
        }));
        coordinator.on_shutdown("flush", || async {
            Err::<(), _>(io::Error::new(io::ErrorKind::Other, "disk full"))
        });
        coordinator.register_component(Arc::new(Component {
            name: "hub".to_string(),
            fail: false,
        }));

        let err = coordinator.shutdown().await.unwrap_err();
        assert_eq!(err.to_string(), "2 shutdown steps failed");
        let failures = err.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(
            failures[0],
            &ShutdownError::ComponentFailed {
                component: "flush".to_string(),
                reason: "disk full".to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_remaining_steps() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let log = recorder();
        record(&coordinator, &log, "never");
        coordinator.on_shutdown("slow", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, io::Error>(())
        });

        let err = coordinator.shutdown().await.unwrap_err();
        assert!(matches!(err, ShutdownError::Timeout(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_shutdown_is_rejected() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.shutdown().await.unwrap();
        assert!(coordinator.is_shutting_down());
        assert_eq!(
            coordinator.shutdown().await.unwrap_err(),
            ShutdownError::AlreadyShuttingDown
        );
    }

    #[tokio::test]
    async fn test_signal_trigger() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        signal.trigger();
        waiter.await.unwrap();

        assert!(signal.is_triggered());
        assert!(signal.token().is_cancelled());
    }
}
