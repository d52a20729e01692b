//! Domain models for llm-proxy-service.

mod forward;
mod session;

pub use forward::{ForwardFailure, ForwardRequest, ForwardResponse};
pub use session::{Session, Usage};
