//! chat-relay - HTTP gateway in front of an Azure OpenAI chat deployment.
//!
//! Clients post a prompt; the gateway forwards it upstream with `stream: true`
//! and relays the reply as it arrives, in one of two framings:
//! - `/chat-sse`: the provider's Server-Sent Events, passed through byte for
//!   byte, with a `Conversation-ID` header when the gateway minted the id.
//! - `/chat-process`: newline-delimited JSON [`types::ChatFragment`] records,
//!   each carrying the reply accumulated so far.
//!
//! Every response body is a bounded [`channel::ResponseChannel`] written by
//! exactly one relay task and closed exactly once.

pub mod channel;
pub mod chunked;
pub mod config;
pub mod conversation;
pub mod error;
pub mod guard;
pub mod relay;
pub mod server;
pub mod types;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use server::{app_config, serve, AppState};
