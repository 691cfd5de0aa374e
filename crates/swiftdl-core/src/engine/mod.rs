//! Download Engine - the moving parts behind [`crate::DownloadEngine`]
//!
//! - Priority dispatcher with three FIFO bands
//! - Retry controller with capped exponential backoff
//! - Streaming transfer executor
//! - Completion registry with one-shot hand-offs
//! - Worker pool bounded by a global concurrency budget
//! - Token bucket rate limiting

mod dispatcher;
mod executor;
mod rate_limiter;
mod registry;
mod retry;
mod worker;

pub use dispatcher::*;
pub use executor::*;
pub use rate_limiter::*;
pub use registry::*;
pub use retry::*;
pub use worker::*;
