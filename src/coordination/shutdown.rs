//! Graceful Shutdown Handler
//!
//! Stops the agent in order: no new steps are dispatched, in-flight steps
//! finish and persist, the watcher and discovery loops stop, then the store
//! is closed. Each stage has its own deadline.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - reduce timeouts
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for in-flight game steps (default: 120s, one step timeout)
    pub step_drain_timeout_secs: u64,
    /// Time to wait for the watcher and discovery loops (default: 10s)
    pub background_stop_timeout_secs: u64,
    /// Time to wait for the store to close (default: 30s)
    pub store_close_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            step_drain_timeout_secs: 120,
            background_stop_timeout_secs: 10,
            store_close_timeout_secs: 30,
        }
    }
}

impl ShutdownConfig {
    /// Urgent shutdowns wait a tenth as long at every stage.
    fn for_signal(&self, signal: ShutdownSignal) -> Self {
        match signal {
            ShutdownSignal::Graceful => self.clone(),
            ShutdownSignal::Urgent => Self {
                step_drain_timeout_secs: (self.step_drain_timeout_secs / 10).max(1),
                background_stop_timeout_secs: (self.background_stop_timeout_secs / 10).max(1),
                store_close_timeout_secs: (self.store_close_timeout_secs / 10).max(1),
            },
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Waiting for in-flight steps to persist
    DrainingSteps,
    /// Stopping the event watcher and discovery
    StoppingBackground,
    ClosingStore,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::DrainingSteps => write!(f, "draining_steps"),
            ShutdownPhase::StoppingBackground => write!(f, "stopping_background"),
            ShutdownPhase::ClosingStore => write!(f, "closing_store"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

pub type ShutdownFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    signal: std::sync::Mutex<Option<ShutdownSignal>>,
    phase: watch::Sender<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(8);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            signal: std::sync::Mutex::new(None),
            phase,
            signal_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    /// Subscribe to shutdown signals; every long-running loop holds one.
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        if let Ok(mut slot) = self.signal.lock() {
            *slot = Some(signal);
        }
        let _ = self.signal_tx.send(signal);
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait_for_request(&self) -> ShutdownSignal {
        let mut rx = self.subscribe();
        if let Some(signal) = self.requested_signal() {
            return signal;
        }
        rx.recv().await.unwrap_or(ShutdownSignal::Urgent)
    }

    fn requested_signal(&self) -> Option<ShutdownSignal> {
        self.signal.lock().ok().and_then(|s| *s)
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Execute the shutdown sequence after the signal went out:
    /// 1. Wait for the scheduler to drain in-flight steps
    /// 2. Wait for the watcher and discovery to stop
    /// 3. Close the store
    pub async fn execute(
        &self,
        drain_steps: ShutdownFuture<bool>,
        stop_background: ShutdownFuture<()>,
        close_store: ShutdownFuture<()>,
    ) -> Result<(), ShutdownError> {
        let start = std::time::Instant::now();
        let signal = self.requested_signal().unwrap_or(ShutdownSignal::Graceful);
        let config = self.config.for_signal(signal);
        let mut timed_out = false;

        self.set_phase(ShutdownPhase::DrainingSteps);
        match tokio::time::timeout(
            Duration::from_secs(config.step_drain_timeout_secs),
            drain_steps,
        )
        .await
        {
            Ok(true) => debug!("In-flight steps drained"),
            Ok(false) => warn!("Scheduler stopped with an error"),
            Err(_) => {
                timed_out = true;
                warn!(
                    "Step drain timeout after {}s, proceeding anyway",
                    config.step_drain_timeout_secs
                );
            }
        }

        self.set_phase(ShutdownPhase::StoppingBackground);
        if tokio::time::timeout(
            Duration::from_secs(config.background_stop_timeout_secs),
            stop_background,
        )
        .await
        .is_err()
        {
            timed_out = true;
            warn!(
                "Background tasks did not stop within {}s",
                config.background_stop_timeout_secs
            );
        }

        self.set_phase(ShutdownPhase::ClosingStore);
        if tokio::time::timeout(
            Duration::from_secs(config.store_close_timeout_secs),
            close_store,
        )
        .await
        .is_err()
        {
            timed_out = true;
            error!("Store close timeout after {}s", config.store_close_timeout_secs);
        }

        self.set_phase(ShutdownPhase::Complete);
        info!("Shutdown completed in {:?}", start.elapsed());

        if timed_out {
            Err(ShutdownError::Timeout)
        } else {
            Ok(())
        }
    }
}

/// Shutdown errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown timed out")]
    Timeout,
}

/// Install OS signal handlers that request shutdown.
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let handlers = [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ];
        for (kind, name, request) in handlers {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut stream = match signal(kind) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to install {} handler: {}", name, e);
                        return;
                    }
                };
                stream.recv().await;
                info!("Received {}", name);
                shutdown.request_shutdown(request);
            });
        }
    }

    #[cfg(windows)]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_phase_display() {
        assert_eq!(ShutdownPhase::Running.to_string(), "running");
        assert_eq!(ShutdownPhase::DrainingSteps.to_string(), "draining_steps");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_shutdown_request_broadcasts_once() {
        let shutdown = GracefulShutdown::with_defaults();
        let mut rx = shutdown.subscribe();

        assert!(!shutdown.is_shutdown_requested());
        shutdown.request_shutdown(ShutdownSignal::Graceful);
        shutdown.request_shutdown(ShutdownSignal::Urgent);

        assert!(shutdown.is_shutdown_requested());
        assert_eq!(rx.recv().await.unwrap(), ShutdownSignal::Graceful);
        assert!(rx.try_recv().is_err());
        assert_eq!(shutdown.wait_for_request().await, ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn test_execute_runs_stages_in_order() {
        let shutdown = GracefulShutdown::with_defaults();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (a, b, c) = (order.clone(), order.clone(), order.clone());

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        shutdown
            .execute(
                Box::pin(async move {
                    a.lock().unwrap().push("drain");
                    true
                }),
                Box::pin(async move { b.lock().unwrap().push("background") }),
                Box::pin(async move { c.lock().unwrap().push("store") }),
            )
            .await
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["drain", "background", "store"]);
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_reports_stuck_drain() {
        let shutdown = GracefulShutdown::new(ShutdownConfig {
            step_drain_timeout_secs: 1,
            ..ShutdownConfig::default()
        });
        let result = shutdown
            .execute(
                Box::pin(std::future::pending()),
                Box::pin(async {}),
                Box::pin(async {}),
            )
            .await;
        assert!(matches!(result, Err(ShutdownError::Timeout)));
    }
}
