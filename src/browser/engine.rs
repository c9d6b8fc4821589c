//! Ownership of the single browser process
//!
//! The engine holds at most one live process handle. Launching is
//! single-flighted so concurrent first-use coalesces onto one attempt.
//! An explicit shutdown latches: recovery paths can no longer relaunch
//! the process behind the caller's back, and only an explicit
//! `reinstate` (driven by a fresh initialize) lifts the latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::browser::RelayError;
use crate::config::RelayConfig;
use crate::driver::{EngineInstance, EngineLauncher};
use crate::flight::FlightSlot;

pub struct Engine {
    launcher: Arc<dyn EngineLauncher>,
    config: Arc<RelayConfig>,
    instance: parking_lot::RwLock<Option<Arc<dyn EngineInstance>>>,
    available: AtomicBool,
    shut_down: AtomicBool,
    launch_flight: FlightSlot<()>,
}

impl Engine {
    pub fn new(launcher: Arc<dyn EngineLauncher>, config: Arc<RelayConfig>) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            config,
            instance: parking_lot::RwLock::new(None),
            available: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
            launch_flight: FlightSlot::new(),
        })
    }

    /// Starts the browser process unless a healthy one is already running.
    /// Concurrent callers share a single launch attempt and its outcome.
    /// Refused once the engine has been shut down.
    pub async fn launch(self: &Arc<Self>) -> Result<(), RelayError> {
        let engine = Arc::clone(self);
        self.launch_flight
            .run(move || async move {
                if engine.is_shut_down() {
                    return Err(shut_down_error());
                }
                if let Some(instance) = engine.current() {
                    if instance.is_connected().await {
                        return Ok(());
                    }
                    warn!("Stale browser process detected before launch, terminating it");
                    let _ = instance.terminate().await;
                    *engine.instance.write() = None;
                }
                info!("Launching browser engine");
                match engine.launcher.launch(&engine.config).await {
                    Ok(instance) => {
                        // A shutdown that raced the launch must win: never
                        // store the handle once the latch is set
                        let stored = {
                            let mut slot = engine.instance.write();
                            if engine.is_shut_down() {
                                false
                            } else {
                                *slot = Some(Arc::clone(&instance));
                                true
                            }
                        };
                        if !stored {
                            warn!("Engine shut down mid-launch, discarding the fresh process");
                            let _ = instance.terminate().await;
                            return Err(shut_down_error());
                        }
                        engine.available.store(true, Ordering::SeqCst);
                        info!("Browser engine launched");
                        Ok(())
                    }
                    Err(e) => {
                        engine.available.store(false, Ordering::SeqCst);
                        error!("Browser engine launch failed: {}", e);
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Returns the live process handle, launching lazily on first use.
    pub async fn ensure_live(self: &Arc<Self>) -> Result<Arc<dyn EngineInstance>, RelayError> {
        if let Some(instance) = self.current() {
            return Ok(instance);
        }
        if !self.is_available() {
            return Err(RelayError::Unavailable(
                "browser engine is not available".to_string(),
            ));
        }
        self.launch().await?;
        self.current().ok_or_else(|| {
            RelayError::Unavailable("browser engine lost right after launch".to_string())
        })
    }

    /// Tears down the current process, if any. Errors are logged and
    /// swallowed; the handle is cleared regardless.
    pub async fn terminate(&self) {
        let taken = self.instance.write().take();
        if let Some(instance) = taken {
            if let Err(e) = instance.terminate().await {
                warn!("Browser engine termination failed: {}", e);
            }
        }
    }

    /// Latches the shutdown and flips availability without touching the
    /// process, so teardown can drain dependents first. Once latched, no
    /// recovery path can relaunch.
    pub fn begin_shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.available.store(false, Ordering::SeqCst);
    }

    /// Terminates the process and latches the shutdown. The latch flips
    /// first so a reset already in flight cannot bring the process back
    /// afterward.
    pub async fn shutdown(&self) {
        self.begin_shutdown();
        self.terminate().await;
        info!("Browser engine shut down");
    }

    /// Lifts the shutdown latch so a later `launch` may proceed. Only an
    /// explicit initialize calls this, never a recovery path.
    pub fn reinstate(&self) {
        self.shut_down.store(false, Ordering::SeqCst);
    }

    pub fn current(&self) -> Option<Arc<dyn EngineInstance>> {
        self.instance.read().clone()
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && !self.is_shut_down()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
    }
}

fn shut_down_error() -> RelayError {
    RelayError::Unavailable("browser engine has been shut down".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::driver::EnginePage;

    struct NullInstance;

    #[async_trait]
    impl EngineInstance for NullInstance {
        async fn is_connected(&self) -> bool {
            true
        }
        async fn create_context(&self) -> Result<String, RelayError> {
            Ok("ctx".to_string())
        }
        async fn dispose_context(&self, _context_id: &str) -> Result<(), RelayError> {
            Ok(())
        }
        async fn create_page(&self, _context_id: &str) -> Result<Arc<dyn EnginePage>, RelayError> {
            Err(RelayError::SessionCreation("no pages here".to_string()))
        }
        async fn terminate(&self) -> Result<(), RelayError> {
            Ok(())
        }
    }

    struct CountingLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl EngineLauncher for CountingLauncher {
        async fn launch(&self, _config: &RelayConfig) -> Result<Arc<dyn EngineInstance>, RelayError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullInstance))
        }
    }

    struct FailingLauncher;

    #[async_trait]
    impl EngineLauncher for FailingLauncher {
        async fn launch(&self, _config: &RelayConfig) -> Result<Arc<dyn EngineInstance>, RelayError> {
            Err(RelayError::LaunchFailed("no chrome".to_string()))
        }
    }

    fn counting_engine() -> (Arc<Engine>, Arc<CountingLauncher>) {
        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
        });
        let engine = Engine::new(
            Arc::clone(&launcher) as Arc<dyn EngineLauncher>,
            Arc::new(RelayConfig::default()),
        );
        (engine, launcher)
    }

    #[tokio::test]
    async fn launch_is_idempotent_for_a_healthy_process() {
        let (engine, launcher) = counting_engine();
        engine.launch().await.unwrap();
        engine.launch().await.unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ensure_live_launches_lazily() {
        let (engine, launcher) = counting_engine();
        assert!(engine.current().is_none());
        engine.ensure_live().await.unwrap();
        assert!(engine.current().is_some());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_launch_marks_unavailable() {
        let engine = Engine::new(Arc::new(FailingLauncher), Arc::new(RelayConfig::default()));
        let err = engine.launch().await.unwrap_err();
        assert!(matches!(err, RelayError::LaunchFailed(_)));
        assert!(!engine.is_available());
        let err = engine.ensure_live().await.unwrap_err();
        assert!(matches!(err, RelayError::Unavailable(_)));
    }

    #[tokio::test]
    async fn shutdown_clears_the_handle_and_flips_availability() {
        let (engine, _launcher) = counting_engine();
        engine.launch().await.unwrap();
        engine.shutdown().await;
        assert!(!engine.is_available());
        assert!(engine.current().is_none());
    }

    #[tokio::test]
    async fn launch_after_shutdown_is_refused_until_reinstated() {
        let (engine, launcher) = counting_engine();
        engine.launch().await.unwrap();
        engine.shutdown().await;

        let err = engine.launch().await.unwrap_err();
        assert!(matches!(err, RelayError::Unavailable(_)));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(!engine.is_available());

        engine.reinstate();
        engine.launch().await.unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert!(engine.is_available());
    }
}
