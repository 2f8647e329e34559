//! Chat-completions client for the relay agent.
//!
//! Speaks the OpenAI wire format, which OpenRouter and most hosted gateways accept.

mod client;
mod error;
mod openai;
mod types;

pub use client::{DEFAULT_BASE_URL, LlmClient};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
