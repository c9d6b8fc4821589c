//! Engine supervisor
//!
//! Watches the engine on behalf of the pool: counts consecutive
//! page-creation failures, spots the closed-context crash signature,
//! and when either points at a dead browser process runs one
//! drain-terminate-relaunch cycle. The reset is single-flighted;
//! while it runs, new acquisitions queue behind it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::browser::{Engine, RelayError, SessionPool};
use crate::config::RelayConfig;
use crate::driver::EngineInstance;
use crate::flight::FlightSlot;

/// Consecutive creation failures that trigger a full reset
const MAX_CREATE_FAILURES: u32 = 3;

/// Failure-message fragments that mean the browser process died under us
const CLOSED_SIGNATURES: [&str; 6] = [
    "alreadyclosed",
    "connectionclosed",
    "connection closed",
    "browser closed",
    "context already closed",
    "target closed",
];

pub struct EngineSupervisor {
    engine: Arc<Engine>,
    config: Arc<RelayConfig>,
    create_failures: AtomicU32,
    reset_flight: FlightSlot<()>,
    // Late-bound: the pool holds the supervisor, so the supervisor only
    // ever looks back at it weakly
    pool: OnceCell<Weak<SessionPool>>,
}

impl EngineSupervisor {
    pub fn new(engine: Arc<Engine>, config: Arc<RelayConfig>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            create_failures: AtomicU32::new(0),
            reset_flight: FlightSlot::new(),
            pool: OnceCell::new(),
        })
    }

    /// Wires in the pool whose sessions a reset must drain. Called once
    /// during service construction.
    pub fn attach_pool(&self, pool: &Arc<SessionPool>) {
        let _ = self.pool.set(Arc::downgrade(pool));
    }

    /// Blocks until any in-flight reset settles. A failed reset surfaces
    /// its error to every waiter.
    pub async fn wait_for_reset(&self) -> Result<(), RelayError> {
        if let Some(task) = self.reset_flight.current() {
            task.await?;
        }
        Ok(())
    }

    /// Acquires a live engine handle for session work. Waits out any
    /// reset, verifies the process actually answers, and on a dead
    /// connection resets once and retries.
    pub async fn engine(self: &Arc<Self>) -> Result<Arc<dyn EngineInstance>, RelayError> {
        self.wait_for_reset().await?;
        let instance = self.engine.ensure_live().await?;
        if instance.is_connected().await {
            return Ok(instance);
        }
        warn!("[Supervisor] Engine disconnected, resetting before retry");
        self.reset().await?;
        self.engine.ensure_live().await
    }

    pub fn record_create_success(&self) {
        self.create_failures.store(0, Ordering::SeqCst);
    }

    /// Accounts one failed session creation. Three in a row, or a single
    /// failure carrying the closed-context signature, starts a reset in
    /// the background; the caller's error still propagates to them.
    pub fn record_create_failure(self: &Arc<Self>, error: &RelayError) {
        let count = self.create_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let message = error.to_string();
        if is_closed_signature(&message) {
            warn!(
                "[Supervisor] Closed-context signature in creation failure ({}), resetting engine",
                message
            );
            self.spawn_reset();
        } else if count >= MAX_CREATE_FAILURES {
            warn!(
                "[Supervisor] {} consecutive session creation failures, resetting engine",
                count
            );
            self.spawn_reset();
        }
    }

    pub fn create_failure_count(&self) -> u32 {
        self.create_failures.load(Ordering::SeqCst)
    }

    pub fn resetting(&self) -> bool {
        self.reset_flight.in_flight()
    }

    fn spawn_reset(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            // Waiters observe the outcome through the shared reset task
            let _ = supervisor.reset().await;
        });
    }

    /// Drains every session, terminates the process, waits the settle
    /// delay, and relaunches. Only one reset runs at a time; concurrent
    /// triggers share it. Success zeroes the failure counter. A reset
    /// never survives an explicit shutdown: it bails here if the engine
    /// is already latched, and the relaunch itself is refused if the
    /// shutdown lands during the settle window.
    pub async fn reset(self: &Arc<Self>) -> Result<(), RelayError> {
        let supervisor = Arc::clone(self);
        self.reset_flight
            .run(move || async move {
                if supervisor.engine.is_shut_down() {
                    info!("[Supervisor] Engine is shut down, skipping reset");
                    return Err(RelayError::Unavailable(
                        "browser engine has been shut down".to_string(),
                    ));
                }
                info!("[Supervisor] Engine reset started");
                if let Some(pool) = supervisor.pool.get().and_then(Weak::upgrade) {
                    pool.close_all().await;
                }
                supervisor.engine.terminate().await;
                tokio::time::sleep(supervisor.config.reset_settle()).await;
                supervisor.engine.launch().await?;
                supervisor.create_failures.store(0, Ordering::SeqCst);
                info!("[Supervisor] Engine reset complete");
                Ok(())
            })
            .await
    }
}

fn is_closed_signature(message: &str) -> bool {
    let lowered = message.to_lowercase();
    CLOSED_SIGNATURES.iter().any(|sig| lowered.contains(sig))
}
