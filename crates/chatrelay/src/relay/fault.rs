//! Fault reporting for the relay pipeline
//!
//! None of these faults ever reach a client as an error. Each is recovered
//! locally (retry, skip, drop) and reported here so that swallowed failures
//! still show up in the logs:
//! - Provider unavailable: retried until the conversation hits its cap
//! - Malformed stream fragment: the record is skipped
//! - Capacity exceeded: the conversation is evicted, optionally with an apology
//! - Stale request: a late response for an evicted conversation is dropped

use tracing::{debug, warn};

use super::events::DeliveryId;
use super::gateway::GatewayError;
use super::tracker::ConversationKey;

/// A recoverable fault observed while serving one request
#[derive(Debug)]
pub enum RelayFault<'a> {
    /// The gateway failed to produce a response
    ProviderUnavailable { error: &'a GatewayError, attempt: u32 },
    /// A stream record could not be decoded
    MalformedStreamFragment { record: &'a str, reason: String },
    /// The conversation reached its admission cap
    CapacityExceeded { pending: u32 },
    /// A response arrived after the conversation was evicted
    StaleRequest,
}

impl RelayFault<'_> {
    /// Category name used as the `fault` field
    pub fn category(&self) -> &'static str {
        match self {
            RelayFault::ProviderUnavailable { .. } => "provider_unavailable",
            RelayFault::MalformedStreamFragment { .. } => "malformed_stream_fragment",
            RelayFault::CapacityExceeded { .. } => "capacity_exceeded",
            RelayFault::StaleRequest => "stale_request",
        }
    }
}

/// Report a fault for `conversation` / `delivery`
pub fn observe(fault: &RelayFault<'_>, conversation: &ConversationKey, delivery: &DeliveryId) {
    let category = fault.category();
    match fault {
        RelayFault::ProviderUnavailable { error, attempt } => {
            warn!(
                fault = category,
                conversation = %conversation,
                delivery = %delivery,
                attempt = attempt,
                error_type = error.category(),
                error_message = %error,
                "Completion provider failed, will retry if still admissible"
            );
        }
        RelayFault::MalformedStreamFragment { record, reason } => {
            debug!(
                fault = category,
                conversation = %conversation,
                delivery = %delivery,
                record = %record,
                reason = %reason,
                "Skipping unparseable stream record"
            );
        }
        RelayFault::CapacityExceeded { pending } => {
            warn!(
                fault = category,
                conversation = %conversation,
                delivery = %delivery,
                pending = pending,
                "Conversation reached its admission cap, evicted"
            );
        }
        RelayFault::StaleRequest => {
            debug!(
                fault = category,
                conversation = %conversation,
                delivery = %delivery,
                "Dropping response for evicted conversation"
            );
        }
    }
}
