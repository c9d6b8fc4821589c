//! Per-session browsing state
//!
//! One record per logical session ID. Each record owns an isolated
//! browsing context, a persistent page already parked on the target
//! origin with the site's signing script loaded, an abortable idle
//! timer, and the mutex that serializes request execution on the page.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use serde_json::Value;
use tracing::{debug, warn};

use crate::browser::RelayError;
use crate::config::{Identity, RelayConfig};
use crate::driver::{EngineInstance, EnginePage, InterceptRules, SessionCookie};

/// Shortens opaque session identifiers for log lines
pub(crate) fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub struct BrowserSession {
    id: String,
    record_id: Uuid,
    context_id: String,
    engine: Arc<dyn EngineInstance>,
    page: Arc<dyn EnginePage>,
    last_used: parking_lot::Mutex<Instant>,
    idle_timer: parking_lot::Mutex<Option<JoinHandle<()>>>,
    exec_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserSession")
            .field("id", &self.id)
            .field("record_id", &self.record_id)
            .field("context_id", &self.context_id)
            .finish_non_exhaustive()
    }
}

impl BrowserSession {
    /// Builds a fully initialized session: isolated context, page on the
    /// target origin, identity cookies, interception rules, and a bounded
    /// wait for the signing script. A failure after the context exists
    /// disposes it before the error propagates.
    pub(crate) async fn create(
        id: &str,
        identity: &Identity,
        engine: Arc<dyn EngineInstance>,
        config: &RelayConfig,
    ) -> Result<Arc<Self>, RelayError> {
        let context_id = engine.create_context().await?;
        match Self::build_page(id, identity, &engine, &context_id, config).await {
            Ok(page) => {
                let session = Arc::new(Self {
                    id: id.to_string(),
                    record_id: Uuid::new_v4(),
                    context_id,
                    engine,
                    page,
                    last_used: parking_lot::Mutex::new(Instant::now()),
                    idle_timer: parking_lot::Mutex::new(None),
                    exec_lock: tokio::sync::Mutex::new(()),
                });
                debug!(
                    "Session {} ready (record {}, context {})",
                    short(id),
                    session.record_id,
                    session.context_id
                );
                Ok(session)
            }
            Err(e) => {
                if let Err(dispose_err) = engine.dispose_context(&context_id).await {
                    warn!(
                        "Failed to dispose context for session {}: {}",
                        short(id),
                        dispose_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn build_page(
        id: &str,
        identity: &Identity,
        engine: &Arc<dyn EngineInstance>,
        context_id: &str,
        config: &RelayConfig,
    ) -> Result<Arc<dyn EnginePage>, RelayError> {
        let page = tokio::time::timeout(config.page_create_timeout(), engine.create_page(context_id))
            .await
            .map_err(|_| {
                RelayError::SessionCreation(format!(
                    "page creation timed out for session {}",
                    short(id)
                ))
            })??;

        page.set_user_agent(&config.user_agent).await?;

        let cookies = config
            .cookies_for(id, identity)
            .into_iter()
            .map(|(name, value)| SessionCookie {
                name,
                value,
                domain: config.cookie_domain.clone(),
                path: "/".to_string(),
            })
            .collect();
        page.set_cookies(cookies).await?;

        page.install_interception(InterceptRules::from_config(config)).await?;

        // Navigation is best-effort; a slow or failed load still leaves a
        // usable page once the signing script arrives
        match tokio::time::timeout(config.navigation_timeout(), page.navigate(&config.target_origin))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "Navigation failed for session {}: {} (continuing)",
                short(id),
                e
            ),
            Err(_) => warn!("Navigation timed out for session {} (continuing)", short(id)),
        }

        Self::wait_ready(&page, config, id).await;
        Ok(page)
    }

    /// Polls the configured readiness predicate until it reports truthy or
    /// the readiness window elapses. Timing out degrades, never fails.
    async fn wait_ready(page: &Arc<dyn EnginePage>, config: &RelayConfig, id: &str) {
        let deadline = Instant::now() + config.readiness_timeout();
        loop {
            match page.evaluate(&config.readiness_script).await {
                Ok(value) if is_truthy(&value) => {
                    debug!("Signing script ready for session {}", short(id));
                    return;
                }
                Ok(_) => {}
                Err(e) => debug!("Readiness probe failed for session {}: {}", short(id), e),
            }
            if Instant::now() >= deadline {
                warn!(
                    "Signing script not confirmed for session {} within {:?}, continuing anyway",
                    short(id),
                    config.readiness_timeout()
                );
                return;
            }
            tokio::time::sleep(config.readiness_poll()).await;
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Internal identity of this record, distinct across recreations of
    /// the same session ID.
    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub(crate) fn page(&self) -> &Arc<dyn EnginePage> {
        &self.page
    }

    pub(crate) fn serialize_guard(&self) -> &tokio::sync::Mutex<()> {
        &self.exec_lock
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Replaces the idle timer, cancelling whichever one was armed before.
    pub(crate) fn set_idle_timer(&self, task: JoinHandle<()>) {
        let mut guard = self.idle_timer.lock();
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        *guard = Some(task);
    }

    fn cancel_idle_timer(&self) {
        if let Some(task) = self.idle_timer.lock().take() {
            task.abort();
        }
    }

    /// Tears the session down: timer, page, then context. Every step is
    /// best-effort so one failure never blocks the rest.
    pub(crate) async fn close(&self) {
        self.cancel_idle_timer();
        if let Err(e) = self.page.close().await {
            warn!("Failed to close page for session {}: {}", short(&self.id), e);
        }
        if let Err(e) = self.engine.dispose_context(&self.context_id).await {
            warn!(
                "Failed to dispose context for session {}: {}",
                short(&self.id),
                e
            );
        }
        debug!(
            "Session {} closed (record {}, idle for {:?})",
            short(&self.id),
            self.record_id,
            self.idle_for()
        );
    }
}

/// JavaScript truthiness over the values an evaluation can hand back
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
