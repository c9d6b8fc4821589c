//! Relay configuration
//!
//! Everything site-specific lives here as plain data: the target origin,
//! the identity cookie templates, the interception lists, the readiness
//! predicate and the timeout table. The lifecycle and execution modules
//! consume these values without knowing which site they describe.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Identity parameters a caller supplies for one logical session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub web_id: String,
    pub user_id: String,
}

/// Where a templated identity cookie takes its value from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CookieSource {
    /// The logical session id the caller addressed
    SessionId,
    /// `Identity::web_id`
    WebId,
    /// `Identity::user_id`
    UserId,
    /// A fixed value
    Literal(String),
}

/// One identity cookie injected into a fresh session context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieTemplate {
    pub name: String,
    pub source: CookieSource,
}

impl CookieTemplate {
    pub fn new(name: impl Into<String>, source: CookieSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    /// Resolve the template against a session id and identity
    pub fn resolve(&self, session_id: &str, identity: &Identity) -> String {
        match &self.source {
            CookieSource::SessionId => session_id.to_string(),
            CookieSource::WebId => identity.web_id.clone(),
            CookieSource::UserId => identity.user_id.clone(),
            CookieSource::Literal(value) => value.clone(),
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Origin every session page is parked on
    pub target_origin: String,
    /// Domain the identity cookies are scoped to
    pub cookie_domain: String,
    /// Identity cookies injected before the first navigation
    pub identity_cookies: Vec<CookieTemplate>,
    /// User agent override applied to every session page
    pub user_agent: String,
    /// Hardening flags passed to the engine process
    pub launch_args: Vec<String>,
    /// Explicit browser binary path; autodetected when unset
    pub chrome_executable: Option<String>,
    /// Resource types aborted outright by the interception policy
    pub blocked_resource_types: Vec<String>,
    /// Script sources allowed through the interception policy
    pub script_allowlist: Vec<String>,
    /// JS expression polled until truthy before a session counts as ready
    pub readiness_script: String,
    /// Idle window after which an unused session is evicted (ms)
    pub idle_timeout_ms: u64,
    /// Upper bound on the readiness wait (ms)
    pub readiness_timeout_ms: u64,
    /// Poll interval for the readiness expression (ms)
    pub readiness_poll_ms: u64,
    /// Upper bound on the initial navigation (ms)
    pub navigation_timeout_ms: u64,
    /// Upper bound on opening the session page (ms)
    pub page_create_timeout_ms: u64,
    /// Upper bound on one in-page request evaluation (ms)
    pub request_timeout_ms: u64,
    /// Settle delay between engine teardown and relaunch during a reset (ms)
    pub reset_settle_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            target_origin: "https://jimeng.jianying.com".to_string(),
            cookie_domain: ".jianying.com".to_string(),
            identity_cookies: vec![
                CookieTemplate::new("_tea_web_id", CookieSource::WebId),
                CookieTemplate::new("is_staff_user", CookieSource::Literal("false".into())),
                CookieTemplate::new("store-region", CookieSource::Literal("cn-gd".into())),
                CookieTemplate::new("uid_tt", CookieSource::UserId),
                CookieTemplate::new("sid_tt", CookieSource::SessionId),
                CookieTemplate::new("sessionid", CookieSource::SessionId),
                CookieTemplate::new("sessionid_ss", CookieSource::SessionId),
            ],
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36"
                .to_string(),
            launch_args: vec![
                "--no-sandbox".to_string(),
                "--disable-setuid-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-gpu".to_string(),
                "--no-first-run".to_string(),
                "--no-zygote".to_string(),
            ],
            chrome_executable: None,
            blocked_resource_types: vec![
                "image".to_string(),
                "font".to_string(),
                "stylesheet".to_string(),
                "media".to_string(),
            ],
            script_allowlist: vec![
                "vlabstatic.com".to_string(),
                "bytescm.com".to_string(),
                "jianying.com".to_string(),
                "byteimg.com".to_string(),
            ],
            // Ready when the signing SDK's init hook or crawler global exists,
            // or when fetch is no longer the native implementation (the SDK
            // wraps it to attach signed tokens).
            readiness_script: "Boolean((window.bdms && window.bdms.init) \
                               || window.byted_acrawler \
                               || window.fetch.toString().indexOf('native code') === -1)"
                .to_string(),
            idle_timeout_ms: 600_000,     // 10 minutes
            readiness_timeout_ms: 30_000, // 30 seconds
            readiness_poll_ms: 500,
            navigation_timeout_ms: 30_000,
            page_create_timeout_ms: 10_000,
            request_timeout_ms: 60_000,
            reset_settle_ms: 1_000,
        }
    }
}

impl RelayConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn page_create_timeout(&self) -> Duration {
        Duration::from_millis(self.page_create_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    /// Materialize the identity cookies for one session
    pub fn cookies_for(&self, session_id: &str, identity: &Identity) -> Vec<(String, String)> {
        self.identity_cookies
            .iter()
            .map(|template| {
                (
                    template.name.clone(),
                    template.resolve(session_id, identity),
                )
            })
            .collect()
    }

    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("browser-relay").join("config.json"))
    }

    /// Load config from file, falling back to the site defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }
}
