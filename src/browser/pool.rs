//! Session registry
//!
//! Maps logical session IDs onto live session records. First use of an ID
//! creates its record exactly once even under concurrent callers; later
//! uses refresh the idle timer. Eviction (idle, explicit, or reset-driven)
//! funnels through one removal path.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::browser::session::short;
use crate::browser::{BrowserSession, RelayError};
use crate::config::{Identity, RelayConfig};
use crate::flight::FlightMap;
use crate::supervisor::EngineSupervisor;

pub struct SessionPool {
    sessions: DashMap<String, Arc<BrowserSession>>,
    creations: FlightMap<Arc<BrowserSession>>,
    supervisor: Arc<EngineSupervisor>,
    config: Arc<RelayConfig>,
}

impl SessionPool {
    pub fn new(supervisor: Arc<EngineSupervisor>, config: Arc<RelayConfig>) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            creations: FlightMap::new(),
            supervisor,
            config,
        })
    }

    /// Returns the live record for `session_id`, creating it if needed.
    /// Concurrent callers for the same absent ID share one creation task
    /// and receive the same record.
    pub async fn get_or_create(
        self: &Arc<Self>,
        session_id: &str,
        identity: &Identity,
    ) -> Result<Arc<BrowserSession>, RelayError> {
        self.supervisor.wait_for_reset().await?;

        if let Some(existing) = self.lookup(session_id) {
            existing.touch();
            self.schedule_idle_close(&existing);
            return Ok(existing);
        }

        let pool = Arc::clone(self);
        let id = session_id.to_string();
        let identity = identity.clone();
        self.creations
            .run(session_id, move || async move {
                // A creation that completed between the fast-path miss and
                // this task registering already stored the record
                if let Some(existing) = pool.lookup(&id) {
                    existing.touch();
                    pool.schedule_idle_close(&existing);
                    return Ok(existing);
                }
                let session = pool.create_session(&id, &identity).await?;
                pool.sessions.insert(id.clone(), Arc::clone(&session));
                pool.schedule_idle_close(&session);
                Ok(session)
            })
            .await
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<BrowserSession>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn create_session(
        &self,
        session_id: &str,
        identity: &Identity,
    ) -> Result<Arc<BrowserSession>, RelayError> {
        let engine = self.supervisor.engine().await?;
        info!("Creating session {}", short(session_id));
        match BrowserSession::create(session_id, identity, engine, &self.config).await {
            Ok(session) => {
                self.supervisor.record_create_success();
                Ok(session)
            }
            Err(e) => {
                warn!("Session creation failed for {}: {}", short(session_id), e);
                self.supervisor.record_create_failure(&e);
                Err(e)
            }
        }
    }

    /// Arms a fresh idle timer for the record, replacing any previous one.
    /// The timer holds only a weak pool reference so a dropped pool never
    /// keeps ghost tasks alive.
    fn schedule_idle_close(self: &Arc<Self>, session: &Arc<BrowserSession>) {
        let pool = Arc::downgrade(self);
        let id = session.id().to_string();
        let record_id = session.record_id();
        let idle = self.config.idle_timeout();
        let task = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let Some(pool) = pool.upgrade() else {
                return;
            };
            let Some(current) = pool.lookup(&id) else {
                return;
            };
            // The ID may have been closed and recreated while this timer
            // slept; only the record it was armed for is fair game
            if current.record_id() != record_id || current.idle_for() < idle {
                return;
            }
            debug!("Idle timeout reached for session {}", short(&id));
            pool.close_session(&id).await;
        });
        session.set_idle_timer(task);
    }

    /// Removes and tears down one session. Idempotent: concurrent or
    /// repeated calls for the same ID find the map entry already gone.
    pub async fn close_session(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        info!("Closing session {}", short(session_id));
        session.close().await;
    }

    /// Closes every live session. Per-session failures are already
    /// swallowed inside the close path.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            info!("Closing all {} sessions", ids.len());
        }
        for id in ids {
            self.close_session(&id).await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
