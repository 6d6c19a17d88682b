//! chatrelay - Real-time chat completion relay
//!
//! Clients connect over WebSocket, submit a conversation and receive the
//! assistant's reply from an OpenAI-compatible provider, either as one
//! payload or as a stream of incremental fragments. The relay manages the
//! per-conversation request lifecycle: admission, retries, cancellation
//! and stream fan-out.

pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod testing;

pub use error::RelayError;
