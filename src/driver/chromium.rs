//! Chromium driver over the DevTools protocol
//!
//! Production implementation of the driver seam. One launched process
//! hosts every session; isolation comes from bespoke browser contexts
//! (Target.createBrowserContext), one page per context. The CDP event
//! stream is pumped on a background task; the stream ending means the
//! process is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType, SetCookieParams};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{EngineInstance, EngineLauncher, EnginePage, InterceptRules, SessionCookie};
use crate::browser::RelayError;
use crate::config::RelayConfig;

/// Bound on the version ping used as a connectivity probe
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period between graceful close and force kill
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Launches headless Chromium processes
#[derive(Debug, Default)]
pub struct ChromiumLauncher;

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self, config: &RelayConfig) -> Result<Arc<dyn EngineInstance>, RelayError> {
        let mut builder = BrowserConfig::builder().viewport(None);
        for arg in &config.launch_args {
            builder = builder.arg(arg.as_str());
        }
        if let Some(path) = &config.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let browser_config = builder.build().map_err(RelayError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RelayError::LaunchFailed(e.to_string()))?;

        // Pump CDP events in the background; when the stream ends Chrome
        // has disconnected or crashed
        let alive = Arc::new(AtomicBool::new(true));
        let alive_for_handler = Arc::clone(&alive);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            warn!("Chrome disconnected (event handler ended)");
            alive_for_handler.store(false, Ordering::Relaxed);
        });

        Ok(Arc::new(ChromiumEngine {
            browser: RwLock::new(Some(browser)),
            handler_task: parking_lot::Mutex::new(Some(handler_task)),
            alive,
        }))
    }
}

/// A live Chromium process and its CDP connection
struct ChromiumEngine {
    browser: RwLock<Option<Browser>>,
    handler_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
}

impl ChromiumEngine {
    fn gone() -> RelayError {
        RelayError::SessionCreation("browser closed".to_string())
    }
}

#[async_trait]
impl EngineInstance for ChromiumEngine {
    async fn is_connected(&self) -> bool {
        if !self.alive.load(Ordering::Relaxed) {
            return false;
        }
        let guard = self.browser.read().await;
        let Some(browser) = guard.as_ref() else {
            return false;
        };
        // A wedged process fails the bounded ping even while the event
        // stream is still open
        matches!(
            tokio::time::timeout(PING_TIMEOUT, browser.version()).await,
            Ok(Ok(_))
        )
    }

    async fn create_context(&self) -> Result<String, RelayError> {
        let guard = self.browser.read().await;
        let browser = guard.as_ref().ok_or_else(Self::gone)?;
        let resp = browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| RelayError::SessionCreation(format!("context creation failed: {e}")))?;
        let context_id = resp.result.browser_context_id.inner().clone();
        debug!("Created browser context {}", context_id);
        Ok(context_id)
    }

    async fn dispose_context(&self, context_id: &str) -> Result<(), RelayError> {
        let guard = self.browser.read().await;
        let browser = guard.as_ref().ok_or_else(Self::gone)?;
        browser
            .execute(DisposeBrowserContextParams::new(context_id.to_string()))
            .await
            .map_err(|e| RelayError::SessionCreation(format!("context dispose failed: {e}")))?;
        debug!("Disposed browser context {}", context_id);
        Ok(())
    }

    async fn create_page(&self, context_id: &str) -> Result<Arc<dyn EnginePage>, RelayError> {
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.to_string())
            .build()
            .map_err(RelayError::SessionCreation)?;
        let guard = self.browser.read().await;
        let browser = guard.as_ref().ok_or_else(Self::gone)?;
        let page = browser
            .new_page(params)
            .await
            .map_err(|e| RelayError::SessionCreation(format!("page creation failed: {e}")))?;
        Ok(Arc::new(ChromiumPage {
            page,
            intercept_task: parking_lot::Mutex::new(None),
        }))
    }

    async fn terminate(&self) -> Result<(), RelayError> {
        self.alive.store(false, Ordering::Relaxed);
        let taken = self.browser.write().await.take();
        if let Some(mut browser) = taken {
            // Graceful close first, then force kill after a grace period
            // so no orphaned Chrome processes linger
            if let Err(e) = browser.close().await {
                warn!("Browser close failed: {}", e);
            }
            tokio::time::sleep(KILL_GRACE).await;
            if let Some(Err(e)) = browser.kill().await {
                warn!("Browser kill failed: {}", e);
            }
        }
        if let Some(task) = self.handler_task.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

/// One automation page bound to an isolated context
struct ChromiumPage {
    page: Page,
    intercept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl EnginePage for ChromiumPage {
    async fn set_user_agent(&self, user_agent: &str) -> Result<(), RelayError> {
        self.page
            .execute(SetUserAgentOverrideParams::new(user_agent.to_string()))
            .await
            .map_err(|e| RelayError::SessionCreation(format!("user agent override failed: {e}")))?;
        Ok(())
    }

    async fn set_cookies(&self, cookies: Vec<SessionCookie>) -> Result<(), RelayError> {
        for cookie in cookies {
            let params = SetCookieParams::builder()
                .name(cookie.name)
                .value(cookie.value)
                .domain(cookie.domain)
                .path(cookie.path)
                .build()
                .map_err(RelayError::SessionCreation)?;
            self.page
                .execute(params)
                .await
                .map_err(|e| RelayError::SessionCreation(format!("cookie injection failed: {e}")))?;
        }
        Ok(())
    }

    async fn install_interception(&self, rules: InterceptRules) -> Result<(), RelayError> {
        let mut patterns: Vec<RequestPattern> = rules
            .blocked_resource_types()
            .iter()
            .filter_map(|name| resource_type_from_name(name))
            .map(|rt| RequestPattern::builder().resource_type(rt).build())
            .collect();
        // Scripts pause as well so the allow-list can arbitrate them
        patterns.push(
            RequestPattern::builder()
                .resource_type(ResourceType::Script)
                .build(),
        );

        // The listener must exist before Fetch.enable, or early pauses
        // are lost and their requests hang
        let mut paused = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(|e| RelayError::SessionCreation(format!("interception listener failed: {e}")))?;

        self.page
            .execute(EnableParams::builder().patterns(patterns).build())
            .await
            .map_err(|e| RelayError::SessionCreation(format!("interception enable failed: {e}")))?;

        let page = self.page.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let type_name = resource_type_name(&event.resource_type);
                if rules.allows(type_name, &event.request.url) {
                    let _ = page
                        .execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await;
                } else {
                    let _ = page
                        .execute(FailRequestParams::new(
                            event.request_id.clone(),
                            ErrorReason::Aborted,
                        ))
                        .await;
                }
            }
        });
        *self.intercept_task.lock() = Some(task);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), RelayError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| RelayError::SessionCreation(format!("navigation failed: {e}")))?;
        // Settling is best-effort; the caller bounds the whole call
        let _ = self.page.wait_for_navigation().await;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, RelayError> {
        let result = self
            .page
            .evaluate(expression)
            .await
            .map_err(|e| RelayError::RequestFailed(format!("evaluation failed: {e}")))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn close(&self) -> Result<(), RelayError> {
        if let Some(task) = self.intercept_task.lock().take() {
            task.abort();
        }
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| RelayError::SessionCreation(format!("page close failed: {e}")))?;
        Ok(())
    }
}

fn resource_type_from_name(name: &str) -> Option<ResourceType> {
    match name {
        "document" => Some(ResourceType::Document),
        "stylesheet" => Some(ResourceType::Stylesheet),
        "image" => Some(ResourceType::Image),
        "media" => Some(ResourceType::Media),
        "font" => Some(ResourceType::Font),
        "script" => Some(ResourceType::Script),
        "xhr" => Some(ResourceType::Xhr),
        "fetch" => Some(ResourceType::Fetch),
        "websocket" => Some(ResourceType::WebSocket),
        _ => None,
    }
}

fn resource_type_name(resource_type: &ResourceType) -> &'static str {
    match resource_type {
        ResourceType::Document => "document",
        ResourceType::Stylesheet => "stylesheet",
        ResourceType::Image => "image",
        ResourceType::Media => "media",
        ResourceType::Font => "font",
        ResourceType::Script => "script",
        ResourceType::Xhr => "xhr",
        ResourceType::Fetch => "fetch",
        ResourceType::WebSocket => "websocket",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_names_round_trip() {
        for name in ["document", "stylesheet", "image", "media", "font", "script", "xhr", "fetch", "websocket"] {
            let rt = resource_type_from_name(name).unwrap();
            assert_eq!(resource_type_name(&rt), name);
        }
        assert!(resource_type_from_name("hologram").is_none());
    }
}
