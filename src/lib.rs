//! Browser Relay
//!
//! A session-scoped browser automation proxy: one headless Chromium
//! process serves many logical sessions, each owning an isolated page
//! parked on the target origin where the site's anti-bot script signs
//! outgoing requests. Callers hand in plain request descriptions and get
//! back the JSON the site returned.

pub mod browser;
pub mod config;
pub mod driver;
pub mod flight;
pub mod service;
pub mod supervisor;

use std::path::PathBuf;

pub use browser::{BrowserSession, RelayError, RequestSpec};
pub use config::{Identity, RelayConfig};
pub use service::BrowserRelay;

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("browser-relay").join("logs"))
}

/// Initialize logging (console plus daily-rolling file)
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "browser-relay.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
