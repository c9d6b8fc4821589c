//! Engine driver seam
//!
//! The lifecycle and execution modules talk to the browser through these
//! object-safe traits. `chromium` implements them over the DevTools
//! protocol; tests substitute instrumented fakes. The seam covers exactly
//! the operations the relay needs and nothing more, so the core never
//! learns how the site's request signing works.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::browser::RelayError;
use crate::config::RelayConfig;

mod chromium;

pub use chromium::ChromiumLauncher;

/// Starts engine processes; one implementation per backend
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, config: &RelayConfig) -> Result<Arc<dyn EngineInstance>, RelayError>;
}

/// A live engine process
#[async_trait]
pub trait EngineInstance: Send + Sync {
    /// Bounded liveness probe; false once the process disconnected
    async fn is_connected(&self) -> bool;

    /// Open an isolated browsing context (its own cookie/storage jar)
    async fn create_context(&self) -> Result<String, RelayError>;

    /// Dispose a context returned by `create_context`
    async fn dispose_context(&self, context_id: &str) -> Result<(), RelayError>;

    /// Open a page inside the given context
    async fn create_page(&self, context_id: &str) -> Result<Arc<dyn EnginePage>, RelayError>;

    /// Terminate the process (best effort)
    async fn terminate(&self) -> Result<(), RelayError>;
}

impl fmt::Debug for dyn EngineInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EngineInstance")
    }
}

/// One automation page inside an isolated context
#[async_trait]
pub trait EnginePage: Send + Sync {
    async fn set_user_agent(&self, user_agent: &str) -> Result<(), RelayError>;

    async fn set_cookies(&self, cookies: Vec<SessionCookie>) -> Result<(), RelayError>;

    async fn install_interception(&self, rules: InterceptRules) -> Result<(), RelayError>;

    /// Navigate and wait for the load to settle. Callers bound this with
    /// their own timeout.
    async fn navigate(&self, url: &str) -> Result<(), RelayError>;

    /// Evaluate a JS expression in the page and return its value
    async fn evaluate(&self, expression: &str) -> Result<Value, RelayError>;

    async fn close(&self) -> Result<(), RelayError>;
}

/// A cookie scoped to the target domain
#[derive(Debug, Clone)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Request interception policy: abort the configured resource types
/// outright, abort scripts from outside the allow-list, let everything
/// else through.
#[derive(Debug, Clone)]
pub struct InterceptRules {
    blocked_resource_types: Vec<String>,
    script_allowlist: Vec<String>,
}

impl InterceptRules {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            blocked_resource_types: config.blocked_resource_types.clone(),
            script_allowlist: config.script_allowlist.clone(),
        }
    }

    pub fn blocked_resource_types(&self) -> &[String] {
        &self.blocked_resource_types
    }

    /// Decide whether a request may proceed. `resource_type` uses the
    /// protocol's lowercase names ("image", "script", "xhr", ...).
    pub fn allows(&self, resource_type: &str, url: &str) -> bool {
        if self
            .blocked_resource_types
            .iter()
            .any(|blocked| blocked == resource_type)
        {
            return false;
        }
        if resource_type == "script" {
            return self
                .script_allowlist
                .iter()
                .any(|domain| url.contains(domain.as_str()));
        }
        true
    }
}
