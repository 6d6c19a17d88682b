//! Streaming response dispatch
//!
//! Decodes the provider's SSE byte stream and turns it into ordered
//! `start` / `middle` / `end` events for one delivery. Admissibility is
//! re-checked before every chunk and before every delta, so an evicted
//! conversation stops producing events at the next opportunity.
//!
//! Records are decoded per chunk: each chunk is split on newlines and each
//! non-blank line is treated as one record.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::events::{DeliveryId, EventKind, EventSink, OutboundEvent};
use super::fault::{self, RelayFault};
use super::gateway::{ChunkStream, GatewayError};
use super::tracker::{Admission, ConversationKey, SessionTracker};

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

/// One decoded stream record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseRecord {
    /// Terminal marker
    Done,
    /// A content fragment, possibly empty
    Delta(String),
    /// A well-formed document with no string content (finish reasons, usage)
    Empty,
    /// Not valid JSON
    Malformed(String),
}

impl SseRecord {
    /// Decode a single non-blank line
    pub fn parse(line: &str) -> Self {
        let payload = line
            .strip_prefix(DATA_PREFIX)
            .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
            .unwrap_or(line)
            .trim_end();

        if payload == DONE_MARKER {
            return SseRecord::Done;
        }

        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(value) => value
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
                .map(|c| SseRecord::Delta(c.to_string()))
                .unwrap_or(SseRecord::Empty),
            Err(e) => SseRecord::Malformed(e.to_string()),
        }
    }
}

/// Split a raw chunk into its non-blank record lines
///
/// SSE comment lines (leading `:`) are keep-alives and are skipped.
pub fn split_records(chunk: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(chunk)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(':'))
        .map(str::to_string)
        .collect()
}

/// Progress of one streaming response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    pub first_chunk_sent: bool,
    pub accumulated_text: String,
}

/// How a stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Terminal marker seen; `end` emitted and the conversation evicted
    Completed { text: String },
    /// Conversation no longer admissible or cancelled
    Dropped,
    /// The re-check hit the cap and evicted the conversation
    CapExceeded { pending: u32 },
    /// Transport failed before any delta was emitted
    SetupFailed(GatewayError),
    /// Transport failed or ended early after deltas were emitted
    Interrupted { text: String },
}

/// Drives one streaming response to its client
pub struct StreamDispatcher {
    tracker: Arc<SessionTracker>,
    sink: Arc<dyn EventSink>,
    key: ConversationKey,
    delivery: DeliveryId,
    cancel: CancellationToken,
    state: StreamState,
}

impl StreamDispatcher {
    pub fn new(
        tracker: Arc<SessionTracker>,
        sink: Arc<dyn EventSink>,
        key: ConversationKey,
        delivery: DeliveryId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tracker,
            sink,
            key,
            delivery,
            cancel,
            state: StreamState::default(),
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Consume `stream` until it finishes, fails, or the conversation goes away
    pub async fn run(mut self, mut stream: ChunkStream) -> DispatchOutcome {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(conversation = %self.key, delivery = %self.delivery, "Stream cancelled");
                    return DispatchOutcome::Dropped;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    if let Some(outcome) = self.process_chunk(&chunk) {
                        return outcome;
                    }
                }
                Some(Err(error)) => return self.transport_ended(Some(error)),
                None => return self.transport_ended(None),
            }
        }
    }

    /// Process one raw chunk; returns an outcome once the stream is finished
    pub fn process_chunk(&mut self, chunk: &[u8]) -> Option<DispatchOutcome> {
        if let Some(outcome) = self.admission_lost() {
            return Some(outcome);
        }

        for line in split_records(chunk) {
            match SseRecord::parse(&line) {
                SseRecord::Done => {
                    self.emit(EventKind::End, String::new());
                    self.tracker.evict(&self.key);
                    debug!(
                        conversation = %self.key,
                        delivery = %self.delivery,
                        chars = self.state.accumulated_text.len(),
                        "Stream completed"
                    );
                    return Some(DispatchOutcome::Completed {
                        text: std::mem::take(&mut self.state.accumulated_text),
                    });
                }
                SseRecord::Delta(text) => {
                    if let Some(outcome) = self.admission_lost() {
                        return Some(outcome);
                    }
                    let kind = if self.state.first_chunk_sent {
                        EventKind::Middle
                    } else {
                        EventKind::Start
                    };
                    self.state.first_chunk_sent = true;
                    self.state.accumulated_text.push_str(&text);
                    self.emit(kind, text);
                }
                SseRecord::Empty => {}
                SseRecord::Malformed(reason) => {
                    fault::observe(
                        &RelayFault::MalformedStreamFragment {
                            record: &line,
                            reason,
                        },
                        &self.key,
                        &self.delivery,
                    );
                }
            }
        }
        None
    }

    fn admission_lost(&self) -> Option<DispatchOutcome> {
        if self.cancel.is_cancelled() {
            return Some(DispatchOutcome::Dropped);
        }
        match self.tracker.check(&self.key) {
            Admission::Admitted { .. } => None,
            Admission::Absent => Some(DispatchOutcome::Dropped),
            Admission::CapExceeded { pending } => Some(DispatchOutcome::CapExceeded { pending }),
        }
    }

    fn transport_ended(&mut self, error: Option<GatewayError>) -> DispatchOutcome {
        if self.state.first_chunk_sent {
            debug!(
                conversation = %self.key,
                delivery = %self.delivery,
                error = ?error,
                "Stream ended without terminal marker"
            );
            DispatchOutcome::Interrupted {
                text: std::mem::take(&mut self.state.accumulated_text),
            }
        } else {
            // Nothing reached the client yet, so the orchestrator may retry.
            DispatchOutcome::SetupFailed(error.unwrap_or_else(|| {
                GatewayError::Network("stream ended before any content".to_string())
            }))
        }
    }

    fn emit(&self, kind: EventKind, content: String) {
        self.sink
            .emit(OutboundEvent::new(kind, content, self.delivery.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    fn delta(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n")
    }

    fn chunks(parts: &[&str]) -> ChunkStream {
        let items: Vec<Result<Bytes, GatewayError>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        Box::pin(futures::stream::iter(items))
    }

    fn setup(cap: u32) -> (Arc<SessionTracker>, Arc<RecordingSink>, ConversationKey, CancellationToken) {
        let tracker = Arc::new(SessionTracker::new(cap));
        let key = ConversationKey::from("conv");
        let cancel = tracker.admit(&key);
        (tracker, Arc::new(RecordingSink::new()), key, cancel)
    }

    fn dispatcher(
        tracker: &Arc<SessionTracker>,
        sink: &Arc<RecordingSink>,
        key: &ConversationKey,
        cancel: &CancellationToken,
    ) -> StreamDispatcher {
        StreamDispatcher::new(
            Arc::clone(tracker),
            sink.clone(),
            key.clone(),
            DeliveryId::from("d-1"),
            cancel.clone(),
        )
    }

    #[test]
    fn test_parse_records() {
        assert_eq!(SseRecord::parse("data: [DONE]"), SseRecord::Done);
        assert_eq!(SseRecord::parse("[DONE]"), SseRecord::Done);
        assert_eq!(
            SseRecord::parse(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseRecord::Delta("Hi".to_string())
        );
        assert_eq!(
            SseRecord::parse(r#"data:{"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseRecord::Delta("Hi".to_string())
        );
        assert_eq!(
            SseRecord::parse(r#"data: {"choices":[{"delta":{"role":"assistant","content":""}}]}"#),
            SseRecord::Delta(String::new())
        );
        assert_eq!(
            SseRecord::parse(r#"data: {"choices":[{"delta":{"content":null},"finish_reason":"stop"}]}"#),
            SseRecord::Empty
        );
        assert_eq!(
            SseRecord::parse(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            SseRecord::Empty
        );
        assert!(matches!(SseRecord::parse("data: {broken"), SseRecord::Malformed(_)));
    }

    #[test]
    fn test_split_records_skips_blank_and_comment_lines() {
        let lines = split_records(b": keep-alive\n\ndata: a\r\n\ndata: b\n");
        assert_eq!(lines, ["data: a", "data: b"]);
    }

    #[tokio::test]
    async fn test_three_record_example() {
        let (tracker, sink, key, cancel) = setup(10);
        let stream = chunks(&[&delta("He"), &delta("llo"), "data: [DONE]\n\n"]);

        let outcome = dispatcher(&tracker, &sink, &key, &cancel).run(stream).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Completed {
                text: "Hello".to_string()
            }
        );
        assert_eq!(
            sink.summary(),
            [
                (EventKind::Start, "He".to_string()),
                (EventKind::Middle, "llo".to_string()),
                (EventKind::End, String::new()),
            ]
        );
        assert!(!tracker.contains(&key));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_role_frame_opens_the_stream() {
        let (tracker, sink, key, cancel) = setup(10);
        let role = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n";
        let stream = chunks(&[role, &delta("Hi"), "data: [DONE]\n\n"]);

        let outcome = dispatcher(&tracker, &sink, &key, &cancel).run(stream).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Completed {
                text: "Hi".to_string()
            }
        );
        assert_eq!(
            sink.summary(),
            [
                (EventKind::Start, String::new()),
                (EventKind::Middle, "Hi".to_string()),
                (EventKind::End, String::new()),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_reply_still_gets_start_before_end() {
        let (tracker, sink, key, cancel) = setup(10);
        let role = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n";
        let stream = chunks(&[role, "data: [DONE]\n\n"]);

        dispatcher(&tracker, &sink, &key, &cancel).run(stream).await;

        assert_eq!(
            sink.summary(),
            [
                (EventKind::Start, String::new()),
                (EventKind::End, String::new()),
            ]
        );
    }

    #[tokio::test]
    async fn test_several_records_in_one_chunk() {
        let (tracker, sink, key, cancel) = setup(10);
        let combined = format!("{}{}data: [DONE]\n\n", delta("a"), delta("b"));

        let outcome = dispatcher(&tracker, &sink, &key, &cancel)
            .run(chunks(&[&combined]))
            .await;

        assert!(matches!(outcome, DispatchOutcome::Completed { ref text } if text == "ab"));
        assert_eq!(sink.len(), 3);
    }

    #[tokio::test]
    async fn test_chunks_after_done_are_ignored() {
        let (tracker, sink, key, cancel) = setup(10);
        let stream = chunks(&[&delta("x"), "data: [DONE]\n\n", &delta("late")]);

        dispatcher(&tracker, &sink, &key, &cancel).run(stream).await;

        assert_eq!(sink.len(), 2);
        assert!(sink.contents().iter().all(|c| c != "late"));
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let (tracker, sink, key, cancel) = setup(10);
        let stream = chunks(&["data: {nope\n\n", &delta("ok"), "data: [DONE]\n\n"]);

        let outcome = dispatcher(&tracker, &sink, &key, &cancel).run(stream).await;

        assert!(matches!(outcome, DispatchOutcome::Completed { ref text } if text == "ok"));
        assert_eq!(sink.summary()[0], (EventKind::Start, "ok".to_string()));
    }

    #[tokio::test]
    async fn test_stop_mid_stream_suppresses_later_chunks() {
        let (tracker, sink, key, cancel) = setup(10);
        let (tx, rx) = mpsc::channel::<Result<Bytes, GatewayError>>(4);
        let stream: ChunkStream = Box::pin(ReceiverStream::new(rx));

        let handle = tokio::spawn(dispatcher(&tracker, &sink, &key, &cancel).run(stream));

        tx.send(Ok(Bytes::from(delta("first")))).await.unwrap();
        sink.wait_for(1).await;

        tracker.evict(&key);
        let _ = tx.send(Ok(Bytes::from(delta("second")))).await;
        let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Dropped);
        assert_eq!(sink.summary(), [(EventKind::Start, "first".to_string())]);
    }

    #[tokio::test]
    async fn test_readmitted_key_does_not_revive_old_stream() {
        let (tracker, sink, key, cancel) = setup(10);
        let mut d = dispatcher(&tracker, &sink, &key, &cancel);

        tracker.evict(&key);
        tracker.admit(&key);

        assert_eq!(d.process_chunk(delta("x").as_bytes()), Some(DispatchOutcome::Dropped));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_cap_reached_during_stream() {
        let (tracker, sink, key, cancel) = setup(2);
        let mut d = dispatcher(&tracker, &sink, &key, &cancel);
        assert_eq!(d.process_chunk(delta("a").as_bytes()), None);

        // A concurrent request for the same conversation pushes it to the cap.
        tracker.admit(&key);

        assert_eq!(
            d.process_chunk(delta("b").as_bytes()),
            Some(DispatchOutcome::CapExceeded { pending: 2 })
        );
        assert_eq!(sink.len(), 1);
        assert!(!tracker.contains(&key));
    }

    #[tokio::test]
    async fn test_error_before_first_delta_is_setup_failure() {
        let (tracker, sink, key, cancel) = setup(10);
        let items: Vec<Result<Bytes, GatewayError>> =
            vec![Err(GatewayError::Network("reset".to_string()))];
        let stream: ChunkStream = Box::pin(futures::stream::iter(items));

        let outcome = dispatcher(&tracker, &sink, &key, &cancel).run(stream).await;

        assert!(matches!(outcome, DispatchOutcome::SetupFailed(GatewayError::Network(_))));
        assert!(sink.is_empty());
        assert!(tracker.contains(&key));
    }

    #[tokio::test]
    async fn test_error_after_delta_is_interruption() {
        let (tracker, sink, key, cancel) = setup(10);
        let items: Vec<Result<Bytes, GatewayError>> = vec![
            Ok(Bytes::from(delta("part"))),
            Err(GatewayError::Network("reset".to_string())),
        ];
        let stream: ChunkStream = Box::pin(futures::stream::iter(items));

        let outcome = dispatcher(&tracker, &sink, &key, &cancel).run(stream).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Interrupted {
                text: "part".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_eof_without_content_is_setup_failure() {
        let (tracker, sink, key, cancel) = setup(10);
        let outcome = dispatcher(&tracker, &sink, &key, &cancel)
            .run(chunks(&[]))
            .await;

        assert!(matches!(outcome, DispatchOutcome::SetupFailed(_)));
    }
}
