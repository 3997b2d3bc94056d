//! Concurrency core for chatrelay.
//!
//! Per-conversation ordering, deadline-bounded units of work, inbound event
//! dedup, and the stateless admission policies the gateway applies.

mod dedup;
mod error;
pub mod policy;
mod queue;
mod timeout;

pub use dedup::{DEFAULT_DEDUP_CAPACITY, MessageDedupCache};
pub use error::{CoreError, Result};
pub use policy::LogLevel;
pub use queue::ChatRunQueue;
pub use timeout::run_with_timeout;
pub use tokio_util::sync::CancellationToken;
