//! Test utilities for chatrelay - scripted provider and recording sink
//!
//! These doubles let orchestrator, dispatcher and server tests run without
//! a real completion provider or WebSocket client.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use crate::relay::events::{EventKind, EventSink, OutboundEvent};
use crate::relay::gateway::{ChunkStream, CompletionGateway, GatewayError};
use crate::relay::prompt::Prompt;

/// Sink that records every event it receives
#[derive(Debug)]
pub struct RecordingSink {
    events: Mutex<Vec<OutboundEvent>>,
    count: watch::Sender<usize>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            count: watch::channel(0).0,
        }
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.lock().clone()
    }

    /// `(kind, content)` pairs in emission order
    pub fn summary(&self) -> Vec<(EventKind, String)> {
        self.lock()
            .iter()
            .map(|e| (e.kind, e.content.clone()))
            .collect()
    }

    pub fn contents(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.content.clone()).collect()
    }

    pub fn count_of(&self, kind: EventKind) -> usize {
        self.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until at least `n` events have been recorded
    pub async fn wait_for(&self, n: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OutboundEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: OutboundEvent) {
        let len = {
            let mut events = self.lock();
            events.push(event);
            events.len()
        };
        self.count.send_replace(len);
    }
}

/// One scripted provider response
#[derive(Debug)]
pub enum Scripted {
    /// A complete reply; streamed calls receive it as a single delta plus `[DONE]`
    Reply(String),
    /// Raw chunks for a streamed call
    Chunks(Vec<String>),
    /// Chunks fed by the test through a channel
    Channel(mpsc::Receiver<Result<Bytes, GatewayError>>),
    /// Provider failure
    Fail(GatewayError),
    /// Never answers
    Hang,
}

/// Gateway that replays scripted responses in order
///
/// Once the script runs out every call fails, which makes an empty script
/// an always-failing provider.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Scripted>>,
    prompts: Mutex<Vec<Prompt>>,
    calls: AtomicU32,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that fails every call
    pub fn always_failing() -> Self {
        Self::default()
    }

    pub fn with(self, response: Scripted) -> Self {
        self.push(response);
        self
    }

    pub fn push(&self, response: Scripted) {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(response);
    }

    /// Queue a streamed reply fed through the returned sender
    pub fn push_channel(&self) -> mpsc::Sender<Result<Bytes, GatewayError>> {
        let (tx, rx) = mpsc::channel(16);
        self.push(Scripted::Channel(rx));
        tx
    }

    /// Number of provider calls made so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn next(&self, prompt: &Prompt) -> Option<Scripted> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(prompt.clone());
        self.script.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }
}

/// Encode `text` as one SSE delta record
pub fn sse_delta(text: &str) -> String {
    let doc = serde_json::json!({"choices": [{"delta": {"content": text}}]});
    format!("data: {doc}\n\n")
}

/// The SSE terminal record
pub fn sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}

fn exhausted() -> GatewayError {
    GatewayError::Network("scripted provider has no response".to_string())
}

#[async_trait]
impl CompletionGateway for ScriptedGateway {
    async fn complete_once(&self, prompt: &Prompt) -> Result<String, GatewayError> {
        match self.next(prompt) {
            Some(Scripted::Reply(text)) => Ok(text),
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::Hang) => futures::future::pending().await,
            Some(Scripted::Chunks(_)) | Some(Scripted::Channel(_)) => Err(GatewayError::Decode(
                "scripted stream used for a non-streamed call".to_string(),
            )),
            None => Err(exhausted()),
        }
    }

    async fn complete_streaming(&self, prompt: &Prompt) -> Result<ChunkStream, GatewayError> {
        let chunks = match self.next(prompt) {
            Some(Scripted::Reply(text)) => vec![sse_delta(&text), sse_done()],
            Some(Scripted::Chunks(chunks)) => chunks,
            Some(Scripted::Channel(rx)) => return Ok(Box::pin(ReceiverStream::new(rx))),
            Some(Scripted::Fail(error)) => return Err(error),
            Some(Scripted::Hang) => futures::future::pending().await,
            None => return Err(exhausted()),
        };
        let items: Vec<Result<Bytes, GatewayError>> =
            chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}
