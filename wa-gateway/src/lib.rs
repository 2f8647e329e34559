//! WhatsApp gateway plumbing for the relay.
//!
//! The gateway is an Evolution API instance: this crate converts its webhook
//! events into `IncomingMessage` values and drives its REST endpoints for
//! sending text, typing presence and read receipts.

mod error;
mod evolution;
mod normalize;
mod traits;
mod types;

pub use error::{GatewayError, Result};
pub use evolution::EvolutionClient;
pub use normalize::{EvolutionWebhook, MESSAGES_UPSERT};
pub use traits::MessagingGateway;
pub use types::{ChatId, IncomingMessage, MessageId, Origin, SentMessage};
