//! Browser automation module
//!
//! Owns the single browser process and the per-session state multiplexed
//! onto it: engine lifecycle, session records, the registry that creates
//! them exactly once, and in-page request execution.

pub(crate) mod session;

mod engine;
mod errors;
mod executor;
mod pool;

pub use engine::Engine;
pub use errors::RelayError;
pub use executor::{RequestExecutor, RequestSpec};
pub use pool::SessionPool;
pub use session::BrowserSession;
