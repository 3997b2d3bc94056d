//! Assistant session client for chatrelay.
//!
//! Pure HTTP client; threads are identified by a resumable server-side id.

mod error;
mod responses;
mod traits;
mod types;

pub use error::{AssistantError, Result};
pub use responses::{DEFAULT_BASE_URL, ResponsesBackend, ResponsesConfig};
pub use traits::{AssistantBackend, AssistantThread};
pub use types::{AssistantTurn, ReasoningEffort, Usage};
