//! Relay core
//!
//! The request pipeline between client connections and the completion
//! provider: prompt filtering, per-conversation admission, provider calls,
//! stream decoding and the retry state machine that ties them together.

pub mod events;
pub mod fault;
pub mod gateway;
pub mod orchestrator;
pub mod prompt;
pub mod stream;
pub mod tracker;

pub use events::{ClientFrame, DeliveryId, DeliveryRequest, EventKind, EventSink, OutboundEvent, ServerFrame};
pub use fault::RelayFault;
pub use gateway::{ChunkStream, CompletionGateway, GatewayError, OpenAiGateway};
pub use orchestrator::{RelayOrchestrator, RequestOutcome, RequestState};
pub use prompt::{Message, Prompt, Role, build_prompt};
pub use stream::{DispatchOutcome, SseRecord, StreamDispatcher, StreamState};
pub use tracker::{Admission, ConversationKey, SessionTracker};
