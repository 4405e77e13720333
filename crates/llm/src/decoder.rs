use std::collections::VecDeque;
use std::fmt::Display;

use futures::{Stream, StreamExt, stream};
use serde::Deserialize;

use super::provider::ProviderError;

const RECORD_PREVIEW_CHARS: usize = 200;
const SSE_DONE_SENTINEL: &str = "[DONE]";
/// Longest unterminated record kept in memory.
pub const MAX_PENDING_LINE_BYTES: usize = 1024 * 1024;

/// Typed partial-response event produced from a raw provider stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TokenDelta(String),
    ReasoningDelta(String),
    Done { reason: Option<String> },
    Error(String),
}

impl StreamEvent {
    pub fn done() -> Self {
        Self::Done { reason: None }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error(_))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireChunk {
    message: Option<ChunkDelta>,
    response: Option<String>,
    thinking: Option<String>,
    done: Option<bool>,
    done_reason: Option<String>,
    choices: Vec<ChunkChoice>,
    error: Option<ChunkError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChunkDelta {
    content: Option<String>,
    thinking: Option<String>,
    reasoning: Option<String>,
    reasoning_content: Option<String>,
}

impl ChunkDelta {
    fn reasoning_text(&mut self) -> Option<String> {
        self.thinking
            .take()
            .or_else(|| self.reasoning.take())
            .or_else(|| self.reasoning_content.take())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChunkError {
    Message(String),
    Detailed { message: String },
    Other(serde_json::Value),
}

impl ChunkError {
    fn into_message(self) -> String {
        match self {
            Self::Message(message) | Self::Detailed { message } => message,
            Self::Other(value) => value.to_string(),
        }
    }
}

/// Incremental decoder for newline-delimited JSON and `data:`-prefixed SSE records.
///
/// Bytes are buffered until a full line is available. Malformed records are logged
/// and dropped; decoding continues with the next line. A record longer than
/// [`MAX_PENDING_LINE_BYTES`] is discarded up to its newline. Once a terminal event has
/// been produced the decoder ignores further input.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    finished: bool,
    skipping_oversized: bool,
    dropped_records: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn dropped_records(&self) -> usize {
        self.dropped_records
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.buffer.extend_from_slice(chunk);
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            if std::mem::take(&mut self.skipping_oversized) {
                continue;
            }
            self.decode_line(&line[..newline], &mut events);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }

        if self.buffer.len() > MAX_PENDING_LINE_BYTES {
            if !self.skipping_oversized {
                self.dropped_records += 1;
                tracing::warn!(
                    limit = MAX_PENDING_LINE_BYTES,
                    "dropping stream record that exceeds the line limit"
                );
            }
            self.buffer.clear();
            self.skipping_oversized = true;
        }

        events
    }

    /// Flushes a trailing unterminated record and closes the sequence.
    ///
    /// Source exhaustion without an explicit terminal record is an implicit `Done`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() && !self.skipping_oversized {
            self.decode_line(&rest, &mut events);
        }

        if !self.finished {
            self.finished = true;
            events.push(StreamEvent::done());
        }

        events
    }

    /// Closes the sequence with an error coming from the byte source itself.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        self.finished = true;
        self.buffer.clear();
        vec![StreamEvent::Error(message.into())]
    }

    fn decode_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim(),
            Err(error) => {
                self.dropped_records += 1;
                tracing::warn!(error = %error, "dropping stream record that is not valid UTF-8");
                return;
            }
        };

        let payload = if let Some(data) = line.strip_prefix("data:") {
            data.trim()
        } else if line.starts_with(':') || is_sse_field_line(line) {
            return;
        } else {
            line
        };

        if payload.is_empty() {
            return;
        }

        if payload == SSE_DONE_SENTINEL {
            self.push_terminal(StreamEvent::done(), events);
            return;
        }

        match serde_json::from_str::<WireChunk>(payload) {
            Ok(chunk) => self.apply_chunk(chunk, events),
            Err(error) => {
                self.dropped_records += 1;
                tracing::warn!(
                    error = %error,
                    record = %preview(payload),
                    "dropping malformed stream record"
                );
            }
        }
    }

    fn apply_chunk(&mut self, mut chunk: WireChunk, events: &mut Vec<StreamEvent>) {
        if let Some(error) = chunk.error.take() {
            let error = ProviderError::Api {
                stage: "decode-stream-record",
                status: None,
                message: error.into_message(),
            };
            self.push_terminal(StreamEvent::Error(error.to_string()), events);
            return;
        }

        let mut finish_reason = None;

        if let Some(mut message) = chunk.message.take() {
            push_delta(message.reasoning_text(), StreamEvent::ReasoningDelta, events);
            push_delta(message.content.take(), StreamEvent::TokenDelta, events);
        }

        push_delta(chunk.thinking.take(), StreamEvent::ReasoningDelta, events);
        push_delta(chunk.response.take(), StreamEvent::TokenDelta, events);

        for mut choice in chunk.choices.drain(..) {
            if let Some(mut delta) = choice.delta.take() {
                push_delta(delta.reasoning_text(), StreamEvent::ReasoningDelta, events);
                push_delta(delta.content.take(), StreamEvent::TokenDelta, events);
            }
            if choice.finish_reason.is_some() {
                finish_reason = choice.finish_reason.take();
            }
        }

        if chunk.done == Some(true) {
            self.push_terminal(
                StreamEvent::Done {
                    reason: chunk.done_reason.take(),
                },
                events,
            );
        } else if finish_reason.is_some() {
            self.push_terminal(
                StreamEvent::Done {
                    reason: finish_reason,
                },
                events,
            );
        }
    }

    fn push_terminal(&mut self, event: StreamEvent, events: &mut Vec<StreamEvent>) {
        self.finished = true;
        events.push(event);
    }
}

fn push_delta(
    text: Option<String>,
    into_event: fn(String) -> StreamEvent,
    events: &mut Vec<StreamEvent>,
) {
    if let Some(text) = text
        && !text.is_empty()
    {
        events.push(into_event(text));
    }
}

fn is_sse_field_line(line: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
        || matches!(line, "event" | "id" | "retry" | "data")
}

fn preview(record: &str) -> &str {
    record
        .char_indices()
        .nth(RECORD_PREVIEW_CHARS)
        .map_or(record, |(index, _)| &record[..index])
}

struct DecodeState<S> {
    source: S,
    decoder: StreamDecoder,
    pending: VecDeque<StreamEvent>,
}

/// Turns a chunked byte source into a lazy, finite sequence of [`StreamEvent`]s.
///
/// The sequence always ends with exactly one terminal event (`Done` or `Error`).
pub fn decode_stream<S, B, E>(source: S) -> impl Stream<Item = StreamEvent> + Send
where
    S: Stream<Item = Result<B, E>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let state = DecodeState {
        source,
        decoder: StreamDecoder::new(),
        pending: VecDeque::new(),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }

            if state.decoder.is_finished() {
                return None;
            }

            let produced = match state.source.next().await {
                Some(Ok(chunk)) => state.decoder.feed(chunk.as_ref()),
                Some(Err(error)) => {
                    let error = ProviderError::TransportInterrupted {
                        stage: "read-stream-chunk",
                        message: error.to_string(),
                    };
                    state.decoder.fail(error.to_string())
                }
                None => state.decoder.finish(),
            };
            state.pending.extend(produced);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&str]) -> Vec<StreamEvent> {
        let mut decoder = StreamDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.feed(chunk.as_bytes()));
        }
        events.extend(decoder.finish());
        events
    }

    fn token(text: &str) -> StreamEvent {
        StreamEvent::TokenDelta(text.to_string())
    }

    #[test]
    fn ollama_records_split_across_chunks_are_reassembled() {
        let events = decode_all(&[
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel",
            "lo\"},\"done\":false}\n{\"message\":{\"content\":\" world\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\"}\n",
        ]);

        assert_eq!(
            events,
            vec![
                token("Hello"),
                token(" world"),
                StreamEvent::Done {
                    reason: Some("stop".to_string())
                },
            ]
        );
    }

    #[test]
    fn sse_records_skip_comments_and_stop_at_done_sentinel() {
        let events = decode_all(&[
            ": keep-alive\n\n",
            "event: message\ndata: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
        ]);

        assert_eq!(events, vec![token("Hi"), StreamEvent::done()]);
    }

    #[test]
    fn finish_reason_terminates_openai_stream() {
        let events = decode_all(&[
            "data: {\"choices\":[{\"delta\":{\"reasoning\":\"thinking\"}}]}\r\n\r\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"42\"},\"finish_reason\":\"stop\"}]}\r\n\r\n",
        ]);

        assert_eq!(
            events,
            vec![
                StreamEvent::ReasoningDelta("thinking".to_string()),
                token("42"),
                StreamEvent::Done {
                    reason: Some("stop".to_string())
                },
            ]
        );
    }

    #[test]
    fn malformed_record_is_dropped_without_aborting() {
        let mut decoder = StreamDecoder::new();
        let mut events = decoder.feed(b"{\"message\":{\"content\":\"a\"}}\n{not json\n42\n");
        events.extend(decoder.feed(b"{\"message\":{\"content\":\"b\"}}\n"));
        events.extend(decoder.finish());

        assert_eq!(events, vec![token("a"), token("b"), StreamEvent::done()]);
        assert_eq!(decoder.dropped_records(), 2);
    }

    #[test]
    fn exhaustion_without_terminal_record_is_implicit_done() {
        let events = decode_all(&["{\"response\":\"partial\"}"]);
        assert_eq!(events, vec![token("partial"), StreamEvent::done()]);
    }

    #[test]
    fn error_record_becomes_terminal_error() {
        let events = decode_all(&[
            "{\"message\":{\"content\":\"x\"}}\n",
            "{\"error\":{\"message\":\"rate limited\"}}\n",
            "{\"message\":{\"content\":\"y\"}}\n",
        ]);

        assert_eq!(
            events,
            vec![
                token("x"),
                StreamEvent::Error("API error: rate limited".to_string())
            ]
        );
    }

    #[test]
    fn multibyte_characters_split_between_chunks_survive() {
        let record = "{\"message\":{\"content\":\"héllo\"}}\n".as_bytes();
        let split = record
            .iter()
            .position(|byte| *byte == 0xC3)
            .map(|index| index + 1)
            .unwrap_or(record.len() / 2);

        let mut decoder = StreamDecoder::new();
        let mut events = decoder.feed(&record[..split]);
        events.extend(decoder.feed(&record[split..]));
        assert_eq!(events, vec![token("héllo")]);
    }

    #[test]
    fn oversized_record_is_dropped_up_to_its_newline() {
        let mut decoder = StreamDecoder::new();
        let filler = vec![b'x'; MAX_PENDING_LINE_BYTES + 1];

        assert!(decoder.feed(b"{\"response\":\"").is_empty());
        assert!(decoder.feed(&filler).is_empty());
        assert!(decoder.feed(&filler).is_empty());
        let mut events = decoder.feed(b"\"}\n{\"response\":\"ok\"}\n");
        events.extend(decoder.finish());

        assert_eq!(events, vec![token("ok"), StreamEvent::done()]);
        assert_eq!(decoder.dropped_records(), 1);
    }

    #[test]
    fn decoder_ignores_input_after_terminal_event() {
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(b"{\"done\":true}\n");
        assert_eq!(events, vec![StreamEvent::done()]);
        assert!(decoder.feed(b"{\"response\":\"more\"}\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[tokio::test]
    async fn decode_stream_surfaces_transport_failure_as_error() {
        let chunks: Vec<Result<&'static [u8], String>> = vec![
            Ok(&b"{\"message\":{\"content\":\"partial\"}}\n"[..]),
            Err("connection reset".to_string()),
            Ok(&b"{\"message\":{\"content\":\"never\"}}\n"[..]),
        ];

        let events = decode_stream(stream::iter(chunks)).collect::<Vec<_>>().await;
        assert_eq!(
            events,
            vec![
                token("partial"),
                StreamEvent::Error("Network error: connection reset".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn decode_stream_ends_with_single_done_on_exhaustion() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".to_vec()),
            Ok(b"\n".to_vec()),
        ];

        let events = decode_stream(stream::iter(chunks)).collect::<Vec<_>>().await;
        assert_eq!(events, vec![token("a"), StreamEvent::done()]);
    }
}
