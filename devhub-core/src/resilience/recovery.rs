//! Panic recovery for background tasks.
//!
//! [`PanicRecovery`] turns a panic inside a guarded future or closure into a
//! [`RecoveredPanic`] error, counts it, flags panic storms and runs every
//! registered cleanup callback.

use crate::config::{require_positive, ConfigError};
use crate::observability::metrics::{PANICS, PANIC_STORMS};
use futures::FutureExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, warn};

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Panics within `storm_window` above which a storm is reported
    pub storm_threshold: u32,
    #[serde(rename = "storm_window_ms", with = "crate::config::duration_ms")]
    pub storm_window: Duration,
    /// Capture a backtrace for every recovered panic
    pub capture_backtrace: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            storm_threshold: 10,
            storm_window: Duration::from_secs(60),
            capture_backtrace: true,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("recovery.storm_threshold", self.storm_threshold.into())?;
        require_positive(
            "recovery.storm_window_ms",
            u64::try_from(self.storm_window.as_millis()).unwrap_or(u64::MAX),
        )
    }
}

/// A panic caught by [`PanicRecovery`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("task '{task}' panicked: {message}")]
pub struct RecoveredPanic {
    pub task: String,
    pub message: String,
    /// Backtrace taken where the panic was recovered
    pub backtrace: Option<String>,
    /// Whether this panic pushed the process into a panic storm
    pub storm: bool,
}

type CleanupFn = Arc<dyn Fn() + Send + Sync>;

/// Catches panics, counts them and runs cleanup callbacks.
pub struct PanicRecovery {
    config: RecoveryConfig,
    panic_count: AtomicU64,
    storm_count: AtomicU64,
    recent: Mutex<VecDeque<Instant>>,
    cleanups: Mutex<Vec<(String, CleanupFn)>>,
}

impl PanicRecovery {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            panic_count: AtomicU64::new(0),
            storm_count: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::new()),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback run after every recovered panic.
    pub fn on_cleanup<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.cleanups).push((name.into(), Arc::new(f)));
    }

    /// Await `fut`, converting a panic into [`RecoveredPanic`].
    pub async fn recover<F, T>(&self, task: &str, fut: F) -> Result<T, RecoveredPanic>
    where
        F: Future<Output = T>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(value) => Ok(value),
            Err(payload) => Err(self.handle_panic(task, payload)),
        }
    }

    /// Synchronous variant of [`recover`](Self::recover).
    pub fn recover_sync<F, T>(&self, task: &str, f: F) -> Result<T, RecoveredPanic>
    where
        F: FnOnce() -> T,
    {
        panic::catch_unwind(AssertUnwindSafe(f))
            .map_err(|payload| self.handle_panic(task, payload))
    }

    /// Spawn `fut` on the runtime with panic recovery.
    ///
    /// The handle resolves to `None` when the task panicked.
    pub fn spawn<F>(
        self: &Arc<Self>,
        task: impl Into<String>,
        fut: F,
    ) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let recovery = Arc::clone(self);
        let task = task.into();
        tokio::spawn(async move { recovery.recover(&task, fut).await.ok() })
    }

    /// Record a panic payload: count it, check for a storm and run cleanups.
    pub fn handle_panic(&self, task: &str, payload: Box<dyn Any + Send>) -> RecoveredPanic {
        let message = panic_message(payload.as_ref());
        let backtrace = self
            .config
            .capture_backtrace
            .then(|| Backtrace::force_capture().to_string());

        let total = self.panic_count.fetch_add(1, Ordering::Relaxed) + 1;
        counter!(PANICS, "task" => task.to_string()).increment(1);
        error!(task, panic = %message, total, "Recovered from panic");

        let storm = self.record_in_window();
        if storm {
            self.storm_count.fetch_add(1, Ordering::Relaxed);
            counter!(PANIC_STORMS).increment(1);
            error!(
                threshold = self.config.storm_threshold,
                window = ?self.config.storm_window,
                "Panic storm detected"
            );
        }

        self.run_cleanups();

        RecoveredPanic {
            task: task.to_string(),
            message,
            backtrace,
            storm,
        }
    }

    /// Run every cleanup callback, each under its own panic guard.
    ///
    /// Returns how many callbacks panicked.
    pub fn run_cleanups(&self) -> usize {
        let cleanups: Vec<(String, CleanupFn)> = lock(&self.cleanups).clone();
        let mut failed = 0;

        for (name, cleanup) in cleanups {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cleanup())) {
                failed += 1;
                warn!(
                    cleanup = %name,
                    panic = %panic_message(payload.as_ref()),
                    "Cleanup callback panicked"
                );
            }
        }
        failed
    }

    pub fn panic_count(&self) -> u64 {
        self.panic_count.load(Ordering::Relaxed)
    }

    /// Panics recorded inside the current storm window.
    pub fn recent_panics(&self) -> usize {
        let mut recent = lock(&self.recent);
        self.evict_expired(&mut recent, Instant::now());
        recent.len()
    }

    pub fn is_storming(&self) -> bool {
        self.recent_panics() > self.config.storm_threshold as usize
    }

    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            panic_count: self.panic_count(),
            storm_count: self.storm_count.load(Ordering::Relaxed),
            recent_panics: self.recent_panics(),
            storming: self.is_storming(),
            cleanup_callbacks: lock(&self.cleanups).len(),
        }
    }

    fn record_in_window(&self) -> bool {
        let now = Instant::now();
        let mut recent = lock(&self.recent);
        recent.push_back(now);
        self.evict_expired(&mut recent, now);
        recent.len() > self.config.storm_threshold as usize
    }

    fn evict_expired(&self, recent: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = recent.front() {
            if now.duration_since(*oldest) > self.config.storm_window {
                recent.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for PanicRecovery {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

impl fmt::Debug for PanicRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicRecovery")
            .field("config", &self.config)
            .field("panic_count", &self.panic_count())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub panic_count: u64,
    pub storm_count: u64,
    pub recent_panics: usize,
    pub storming: bool,
    pub cleanup_callbacks: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
