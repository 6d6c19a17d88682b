//! Per-request orchestration
//!
//! Each inbound [`DeliveryRequest`] runs through an explicit state machine:
//!
//! ```text
//! Admitting -> Filtering -> Dispatching -> Completed
//!     ^                          |      \-> Dropped
//!     |                          v
//!     +------------------- Retrying ----> Dropped
//! ```
//!
//! Provider failures are retried after a fixed delay for as long as the
//! conversation stays admissible. Every attempt admits the conversation
//! once more, so a persistently failing provider drives the conversation
//! into its cap, which evicts it and ends the loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::events::{DeliveryRequest, EventKind, EventSink, OutboundEvent};
use super::fault::{self, RelayFault};
use super::gateway::{CompletionGateway, GatewayError};
use super::prompt::{Prompt, build_prompt};
use super::stream::{DispatchOutcome, StreamDispatcher};
use super::tracker::{Admission, ConversationKey, SessionTracker};
use crate::config::RelayConfig;

/// Where a request is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    Admitting,
    Filtering,
    Dispatching(Prompt),
    Retrying,
    Completed,
    Dropped,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Dropped)
    }
}

/// Final state of a handled request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub state: RequestState,
    pub attempts: u32,
}

/// Composes prompt filtering, admission tracking and provider calls
pub struct RelayOrchestrator {
    gateway: Arc<dyn CompletionGateway>,
    tracker: Arc<SessionTracker>,
    config: RelayConfig,
}

impl RelayOrchestrator {
    pub fn new(gateway: Arc<dyn CompletionGateway>, config: RelayConfig) -> Self {
        let tracker = Arc::new(SessionTracker::from_config(&config));
        Self::with_tracker(gateway, tracker, config)
    }

    pub fn with_tracker(
        gateway: Arc<dyn CompletionGateway>,
        tracker: Arc<SessionTracker>,
        config: RelayConfig,
    ) -> Self {
        Self {
            gateway,
            tracker,
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<SessionTracker> {
        &self.tracker
    }

    /// Cancel everything outstanding for `key`
    ///
    /// Suspended work for the conversation (provider call, chunk wait or
    /// retry delay) observes the eviction at its next suspension point.
    pub fn stop(&self, key: &ConversationKey) -> bool {
        let existed = self.tracker.evict(key);
        info!(conversation = %key, existed, "Stop requested");
        existed
    }

    /// Serve one request to completion, emitting its events to `sink`
    pub async fn handle(&self, request: DeliveryRequest, sink: Arc<dyn EventSink>) -> RequestOutcome {
        let key = &request.conversation_key;
        let mut attempts = 0u32;
        let mut cancel = CancellationToken::new();
        let mut state = RequestState::Admitting;

        debug!(
            conversation = %key,
            delivery = %request.delivery_id,
            streaming = request.streaming,
            history = request.history.len(),
            "Handling delivery"
        );

        loop {
            state = match state {
                RequestState::Admitting => {
                    cancel = self.tracker.admit(key);
                    attempts += 1;
                    debug!(
                        conversation = %key,
                        attempt = attempts,
                        pending = self.tracker.pending(key).unwrap_or_default(),
                        "Admitted"
                    );
                    RequestState::Filtering
                }
                RequestState::Filtering => RequestState::Dispatching(build_prompt(
                    &request.history,
                    &request.system_prompt,
                )),
                RequestState::Dispatching(prompt) => {
                    if request.streaming {
                        self.dispatch_streaming(&request, &prompt, &cancel, &sink, attempts)
                            .await
                    } else {
                        self.dispatch_once(&request, &prompt, &cancel, &sink, attempts)
                            .await
                    }
                }
                RequestState::Retrying => self.retry(&request, &cancel, &sink).await,
                terminal @ (RequestState::Completed | RequestState::Dropped) => {
                    info!(
                        conversation = %key,
                        delivery = %request.delivery_id,
                        attempts,
                        outcome = ?terminal,
                        "Delivery finished"
                    );
                    return RequestOutcome {
                        state: terminal,
                        attempts,
                    };
                }
            };
        }
    }

    async fn dispatch_streaming(
        &self,
        request: &DeliveryRequest,
        prompt: &Prompt,
        cancel: &CancellationToken,
        sink: &Arc<dyn EventSink>,
        attempt: u32,
    ) -> RequestState {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.stale(request),
            opened = self.gateway.complete_streaming(prompt) => opened,
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(error) => return self.provider_failed(request, &error, attempt),
        };

        let dispatcher = StreamDispatcher::new(
            Arc::clone(&self.tracker),
            Arc::clone(sink),
            request.conversation_key.clone(),
            request.delivery_id.clone(),
            cancel.clone(),
        );

        match dispatcher.run(stream).await {
            DispatchOutcome::Completed { .. } => RequestState::Completed,
            DispatchOutcome::Dropped => self.stale(request),
            DispatchOutcome::CapExceeded { pending } => self.cap_exceeded(request, sink, pending),
            DispatchOutcome::SetupFailed(error) => self.provider_failed(request, &error, attempt),
            DispatchOutcome::Interrupted { .. } => {
                sink.emit(OutboundEvent::new(
                    EventKind::End,
                    String::new(),
                    request.delivery_id.clone(),
                ));
                self.tracker.evict(&request.conversation_key);
                RequestState::Completed
            }
        }
    }

    async fn dispatch_once(
        &self,
        request: &DeliveryRequest,
        prompt: &Prompt,
        cancel: &CancellationToken,
        sink: &Arc<dyn EventSink>,
        attempt: u32,
    ) -> RequestState {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.stale(request),
            result = self.gateway.complete_once(prompt) => result,
        };

        match self.admission(&request.conversation_key, cancel) {
            Admission::Admitted { .. } => match result {
                Ok(text) => {
                    sink.emit(OutboundEvent::new(
                        EventKind::NonStream,
                        text,
                        request.delivery_id.clone(),
                    ));
                    self.tracker.evict(&request.conversation_key);
                    RequestState::Completed
                }
                Err(error) => self.provider_failed(request, &error, attempt),
            },
            Admission::CapExceeded { pending } => self.cap_exceeded(request, sink, pending),
            Admission::Absent => self.stale(request),
        }
    }

    async fn retry(
        &self,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
        sink: &Arc<dyn EventSink>,
    ) -> RequestState {
        match self.admission(&request.conversation_key, cancel) {
            Admission::Admitted { .. } => {
                let delay = self.config.retry_delay();
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return self.stale(request),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RequestState::Admitting
            }
            Admission::CapExceeded { pending } => self.cap_exceeded(request, sink, pending),
            Admission::Absent => self.stale(request),
        }
    }

    /// Admission for this request's generation of the conversation
    ///
    /// A fired token means the entry this request was admitted under is
    /// gone, even if a later request has since re-created the key.
    fn admission(&self, key: &ConversationKey, cancel: &CancellationToken) -> Admission {
        if cancel.is_cancelled() {
            Admission::Absent
        } else {
            self.tracker.check(key)
        }
    }

    fn provider_failed(&self, request: &DeliveryRequest, error: &GatewayError, attempt: u32) -> RequestState {
        fault::observe(
            &RelayFault::ProviderUnavailable { error, attempt },
            &request.conversation_key,
            &request.delivery_id,
        );
        RequestState::Retrying
    }

    fn cap_exceeded(&self, request: &DeliveryRequest, sink: &Arc<dyn EventSink>, pending: u32) -> RequestState {
        fault::observe(
            &RelayFault::CapacityExceeded { pending },
            &request.conversation_key,
            &request.delivery_id,
        );
        if self.config.apology_enabled {
            sink.emit(OutboundEvent::new(
                EventKind::NonStream,
                self.config.apology_message.clone(),
                request.delivery_id.clone(),
            ));
        }
        RequestState::Dropped
    }

    fn stale(&self, request: &DeliveryRequest) -> RequestState {
        fault::observe(
            &RelayFault::StaleRequest,
            &request.conversation_key,
            &request.delivery_id,
        );
        RequestState::Dropped
    }
}
