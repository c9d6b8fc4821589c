//! Caller-facing relay surface
//!
//! Wires the engine, supervisor, pool, and executor together behind the
//! handful of calls an HTTP layer needs. One relay instance means one
//! browser process serving every logical session.

use std::sync::Arc;

use serde_json::Value;

use crate::browser::{BrowserSession, Engine, RelayError, RequestExecutor, RequestSpec, SessionPool};
use crate::config::{Identity, RelayConfig};
use crate::driver::{ChromiumLauncher, EngineLauncher};
use crate::supervisor::EngineSupervisor;

pub struct BrowserRelay {
    config: Arc<RelayConfig>,
    engine: Arc<Engine>,
    supervisor: Arc<EngineSupervisor>,
    pool: Arc<SessionPool>,
}

impl BrowserRelay {
    /// Builds a relay driving real Chromium.
    pub fn new(config: RelayConfig) -> Self {
        Self::with_launcher(config, Arc::new(ChromiumLauncher))
    }

    /// Builds a relay over any launcher, which is how tests and embedders
    /// substitute their own engine.
    pub fn with_launcher(config: RelayConfig, launcher: Arc<dyn EngineLauncher>) -> Self {
        let config = Arc::new(config);
        let engine = Engine::new(launcher, Arc::clone(&config));
        let supervisor = EngineSupervisor::new(Arc::clone(&engine), Arc::clone(&config));
        let pool = SessionPool::new(Arc::clone(&supervisor), Arc::clone(&config));
        supervisor.attach_pool(&pool);
        Self {
            config,
            engine,
            supervisor,
            pool,
        }
    }

    /// Starts the browser eagerly, lifting an earlier `close`. Optional:
    /// the first session would start it anyway, but callers that want
    /// launch failures up front call this.
    pub async fn initialize(&self) -> Result<(), RelayError> {
        self.engine.reinstate();
        self.engine.launch().await
    }

    /// Returns the live session for `session_id`, creating it on first use.
    pub async fn session(
        &self,
        session_id: &str,
        identity: &Identity,
    ) -> Result<Arc<BrowserSession>, RelayError> {
        self.pool.get_or_create(session_id, identity).await
    }

    /// Executes one request inside the session's page and returns the
    /// parsed JSON response.
    pub async fn fetch(
        &self,
        session_id: &str,
        identity: &Identity,
        spec: &RequestSpec,
    ) -> Result<Value, RelayError> {
        let session = self.pool.get_or_create(session_id, identity).await?;
        RequestExecutor::execute(&session, spec, &self.config).await
    }

    /// Closes one session if it exists. Unknown IDs are a no-op.
    pub async fn close_session(&self, session_id: &str) {
        self.pool.close_session(session_id).await;
    }

    /// Drains every session and shuts the engine down. The relay reports
    /// unavailable from the moment this starts, and a recovery reset that
    /// was queued before the close can no longer relaunch the engine.
    pub async fn close(&self) {
        self.engine.begin_shutdown();
        self.pool.close_all().await;
        self.engine.shutdown().await;
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_available()
    }

    pub fn mark_unavailable(&self) {
        self.engine.mark_unavailable();
    }

    pub fn session_count(&self) -> usize {
        self.pool.session_count()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Supervisor handle, exposed for health introspection.
    pub fn supervisor(&self) -> &Arc<EngineSupervisor> {
        &self.supervisor
    }
}
