use chrono::{DateTime, Utc};
use lama_llm::{ChatRequest, StreamEvent, WireMessage, WireRole, prepare_image};

use crate::message::{
    Attachment, ContentBlock, ImageRef, Message, MessageContent, MessageId, Role, SessionId,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer clearly and concisely, \
and use Markdown formatting when it improves readability.";

/// Identifies one submit of a session; events tagged with any other generation are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamGeneration(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadingState {
    #[default]
    Idle,
    Loading,
}

/// Per-request sampling options, read from settings at submit time.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub system_prompt: String,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: None,
            top_p: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Accepted submit: the caller opens the stream and tags its events with `generation`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub generation: StreamGeneration,
    pub request: ChatRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Stale generation or session not loading.
    Ignored,
    TokenAppended(String),
    ReasoningAppended(String),
    Finished { reason: Option<String> },
    Failed { message: String },
}

impl StreamOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed { .. })
    }
}

/// One conversation and its streaming state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub selected_model: String,
    pub available_models: Vec<String>,
    pub transcript: Vec<Message>,
    pub loading_state: LoadingState,
    pub last_error: Option<String>,
    pub stop_reason: Option<String>,
    active_generation: Option<StreamGeneration>,
    open_assistant: Option<MessageId>,
    next_generation: u64,
}

impl ChatSession {
    pub fn new(selected_model: impl Into<String>, available_models: Vec<String>) -> Self {
        Self::restored(SessionId::new_v4(), Utc::now(), selected_model, Vec::new())
            .with_available_models(available_models)
    }

    /// Rebuilds an idle session from persisted parts.
    pub fn restored(
        id: SessionId,
        created_at: DateTime<Utc>,
        selected_model: impl Into<String>,
        transcript: Vec<Message>,
    ) -> Self {
        Self {
            id,
            created_at,
            selected_model: selected_model.into(),
            available_models: Vec::new(),
            transcript,
            loading_state: LoadingState::Idle,
            last_error: None,
            stop_reason: None,
            active_generation: None,
            open_assistant: None,
            next_generation: 0,
        }
    }

    pub fn with_available_models(mut self, available_models: Vec<String>) -> Self {
        self.available_models = available_models;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.transcript.is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.loading_state == LoadingState::Loading
    }

    pub fn active_generation(&self) -> Option<StreamGeneration> {
        self.active_generation
    }

    /// First user line, for list rows.
    pub fn title(&self) -> Option<String> {
        self.transcript
            .iter()
            .find(|message| message.role == Role::User)
            .map(|message| message.text().lines().next().unwrap_or_default().to_string())
    }

    pub fn select_model(&mut self, model: impl Into<String>) {
        self.selected_model = model.into();
    }

    /// Appends the user turn and moves to `Loading`.
    ///
    /// Returns `None` (and changes nothing) when there is nothing to send or a stream is
    /// already in flight; callers that want cancel-and-replace call [`Self::cancel`] first.
    pub fn submit(
        &mut self,
        input_text: &str,
        images: Vec<ImageRef>,
        options: &SamplingOptions,
    ) -> Option<PendingRequest> {
        let text = input_text.trim();
        if (text.is_empty() && images.is_empty()) || self.is_loading() {
            return None;
        }

        let content = if images.is_empty() {
            MessageContent::Text(text.to_string())
        } else {
            let mut blocks = Vec::with_capacity(images.len() + 1);
            if !text.is_empty() {
                blocks.push(ContentBlock::Text(text.to_string()));
            }
            blocks.extend(images.into_iter().map(ContentBlock::Image));
            MessageContent::Blocks(blocks)
        };
        self.transcript.push(Message::new(Role::User, content));

        let request = self.build_request(options);

        let generation = StreamGeneration(self.next_generation);
        self.next_generation = self.next_generation.saturating_add(1);
        self.active_generation = Some(generation);
        self.open_assistant = None;
        self.loading_state = LoadingState::Loading;
        self.last_error = None;
        self.stop_reason = None;

        tracing::debug!(
            session_id = %self.id,
            model_id = %self.selected_model,
            generation = generation.0,
            message_count = request.messages.len(),
            "session submitted"
        );

        Some(PendingRequest {
            generation,
            request,
        })
    }

    fn build_request(&self, options: &SamplingOptions) -> ChatRequest {
        let last_index = self.transcript.len().saturating_sub(1);
        let messages = self
            .transcript
            .iter()
            .enumerate()
            .filter(|(_, message)| !message.content.is_empty())
            .map(|(index, message)| {
                if index == last_index {
                    message.to_wire_multimodal()
                } else {
                    message.to_wire_text()
                }
            })
            .collect::<Vec<_>>();

        let mut request = ChatRequest::new(
            self.selected_model.clone(),
            with_system_prompt(messages, &options.system_prompt),
        );
        request.temperature = options.temperature;
        request.max_tokens = options.max_tokens;
        request.top_p = options.top_p;
        request
    }

    /// Applies one stream event tagged with `generation`.
    pub fn apply_stream_event(
        &mut self,
        generation: StreamGeneration,
        event: StreamEvent,
    ) -> StreamOutcome {
        if !self.is_loading() || self.active_generation != Some(generation) {
            return StreamOutcome::Ignored;
        }

        match event {
            StreamEvent::TokenDelta(text) => {
                if text.is_empty() {
                    return StreamOutcome::Ignored;
                }
                self.open_assistant_message().content.push_str(&text);
                StreamOutcome::TokenAppended(text)
            }
            StreamEvent::ReasoningDelta(text) => {
                if text.is_empty() {
                    return StreamOutcome::Ignored;
                }
                self.open_assistant_message()
                    .reasoning
                    .get_or_insert_with(String::new)
                    .push_str(&text);
                StreamOutcome::ReasoningAppended(text)
            }
            StreamEvent::Done { reason } => {
                self.finish_stream();
                self.stop_reason = reason.clone();
                StreamOutcome::Finished { reason }
            }
            StreamEvent::Error(message) => {
                if let Some(open_id) = self.open_assistant
                    && self
                        .transcript
                        .last()
                        .is_some_and(|last| last.id == open_id && last.is_empty_placeholder())
                {
                    self.transcript.pop();
                }
                self.finish_stream();
                self.last_error = Some(message.clone());
                StreamOutcome::Failed { message }
            }
        }
    }

    /// Stops the in-flight stream, keeping any tokens already appended.
    ///
    /// Returns the cancelled generation, or `None` when the session was idle.
    pub fn cancel(&mut self) -> Option<StreamGeneration> {
        if !self.is_loading() {
            return None;
        }

        let generation = self.active_generation;
        self.finish_stream();
        tracing::debug!(session_id = %self.id, "session stream cancelled");
        generation
    }

    fn finish_stream(&mut self) {
        self.loading_state = LoadingState::Idle;
        self.active_generation = None;
        self.open_assistant = None;
    }

    /// Trailing open assistant message, created on first use.
    fn open_assistant_message(&mut self) -> &mut Message {
        let reuse = self.open_assistant.is_some()
            && self
                .transcript
                .last()
                .is_some_and(|last| Some(last.id) == self.open_assistant);

        if !reuse {
            let message = Message::assistant("");
            self.open_assistant = Some(message.id);
            self.transcript.push(message);
        }

        let last_index = self.transcript.len() - 1;
        &mut self.transcript[last_index]
    }
}

/// Turns raw attachments into image references; runs the image codec, so callers keep
/// it off the event loop. Attachments that cannot be prepared are logged and skipped.
pub fn prepare_attachments(attachments: Vec<Attachment>) -> Vec<ImageRef> {
    attachments
        .into_iter()
        .filter_map(|attachment| match attachment {
            Attachment::ImageUrl(url) => Some(ImageRef { url }),
            Attachment::ImageData(bytes) => match prepare_image(&bytes) {
                Ok(url) => Some(ImageRef { url }),
                Err(error) => {
                    tracing::warn!(
                        byte_count = bytes.len(),
                        error = %error,
                        "skipping attachment that could not be prepared"
                    );
                    None
                }
            },
        })
        .collect()
}

/// Puts a system turn at the head of `messages` unless one is already there.
pub fn with_system_prompt(mut messages: Vec<WireMessage>, system_prompt: &str) -> Vec<WireMessage> {
    let has_system = messages
        .first()
        .is_some_and(|message| message.role == WireRole::System);
    if !has_system {
        messages.insert(0, WireMessage::text(WireRole::System, system_prompt));
    }
    messages
}

#[cfg(test)]
mod tests {
    use lama_llm::WireContent;

    use super::*;

    fn loading_session() -> (ChatSession, StreamGeneration) {
        let mut session = ChatSession::new("m1", Vec::new());
        let pending = session
            .submit("Hello", Vec::new(), &SamplingOptions::default())
            .expect("accepted");
        (session, pending.generation)
    }

    fn texts(session: &ChatSession) -> Vec<(Role, String)> {
        session
            .transcript
            .iter()
            .map(|message| (message.role, message.text()))
            .collect()
    }

    #[test]
    fn hello_scenario_streams_then_completes() {
        let (mut session, generation) = loading_session();
        assert_eq!(texts(&session), vec![(Role::User, "Hello".to_string())]);
        assert!(session.is_loading());

        session.apply_stream_event(generation, StreamEvent::TokenDelta("Hi".to_string()));
        assert_eq!(
            texts(&session),
            vec![
                (Role::User, "Hello".to_string()),
                (Role::Assistant, "Hi".to_string())
            ]
        );

        let before = session.transcript.clone();
        let outcome = session.apply_stream_event(generation, StreamEvent::done());
        assert_eq!(outcome, StreamOutcome::Finished { reason: None });
        assert_eq!(session.loading_state, LoadingState::Idle);
        assert_eq!(session.transcript, before);
    }

    #[test]
    fn deltas_concatenate_into_one_assistant_message() {
        let (mut session, generation) = loading_session();
        for chunk in ["The", " quick", " fox"] {
            session.apply_stream_event(generation, StreamEvent::TokenDelta(chunk.to_string()));
        }

        let assistants = session
            .transcript
            .iter()
            .filter(|message| message.role == Role::Assistant)
            .collect::<Vec<_>>();
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].text(), "The quick fox");
    }

    #[test]
    fn error_without_tokens_leaves_only_user_message() {
        let (mut session, generation) = loading_session();
        let outcome =
            session.apply_stream_event(generation, StreamEvent::Error("rate limited".to_string()));

        assert!(outcome.is_terminal());
        assert_eq!(session.last_error.as_deref(), Some("rate limited"));
        assert_eq!(texts(&session), vec![(Role::User, "Hello".to_string())]);
        assert!(!session.is_loading());
    }

    #[test]
    fn error_after_tokens_keeps_partial_answer() {
        let (mut session, generation) = loading_session();
        session.apply_stream_event(generation, StreamEvent::TokenDelta("Par".to_string()));
        session.apply_stream_event(generation, StreamEvent::Error("Network error: reset".to_string()));

        assert_eq!(session.transcript.len(), 2);
        assert_eq!(session.transcript[1].text(), "Par");
    }

    #[test]
    fn error_keeps_bubble_that_received_reasoning() {
        let (mut session, generation) = loading_session();
        session.apply_stream_event(generation, StreamEvent::ReasoningDelta("hmm".to_string()));
        session.apply_stream_event(generation, StreamEvent::Error("boom".to_string()));

        // Reasoning counts as received output, so the bubble stays.
        assert_eq!(session.transcript.len(), 2);
        assert_eq!(session.transcript[1].reasoning.as_deref(), Some("hmm"));
    }

    #[test]
    fn cancel_is_idempotent_and_keeps_transcript() {
        let mut idle = ChatSession::new("m1", Vec::new());
        let snapshot = idle.clone();
        assert_eq!(idle.cancel(), None);
        assert_eq!(idle, snapshot);

        let (mut session, generation) = loading_session();
        session.apply_stream_event(generation, StreamEvent::TokenDelta("partial".to_string()));
        let transcript = session.transcript.clone();

        assert_eq!(session.cancel(), Some(generation));
        assert_eq!(session.loading_state, LoadingState::Idle);
        assert_eq!(session.transcript, transcript);
        assert_eq!(session.cancel(), None);

        // Late events from the cancelled stream are dropped.
        let outcome =
            session.apply_stream_event(generation, StreamEvent::TokenDelta("late".to_string()));
        assert_eq!(outcome, StreamOutcome::Ignored);
        assert_eq!(session.transcript, transcript);
    }

    #[test]
    fn empty_submit_is_rejected_without_side_effects() {
        let mut session = ChatSession::new("m1", Vec::new());
        let snapshot = session.clone();
        assert!(session.submit("   \n", Vec::new(), &SamplingOptions::default()).is_none());
        assert_eq!(session, snapshot);
    }

    #[test]
    fn submit_while_loading_is_rejected() {
        let (mut session, _) = loading_session();
        let transcript = session.transcript.clone();
        assert!(session.submit("again", Vec::new(), &SamplingOptions::default()).is_none());
        assert_eq!(session.transcript, transcript);
    }

    #[test]
    fn stale_generation_is_ignored_after_resubmit() {
        let (mut session, first) = loading_session();
        session.cancel();
        let second = session
            .submit("Again", Vec::new(), &SamplingOptions::default())
            .expect("accepted")
            .generation;
        assert_ne!(first, second);

        let outcome = session.apply_stream_event(first, StreamEvent::TokenDelta("old".to_string()));
        assert_eq!(outcome, StreamOutcome::Ignored);
        session.apply_stream_event(second, StreamEvent::TokenDelta("new".to_string()));
        assert_eq!(session.transcript.last().map(Message::text).as_deref(), Some("new"));
    }

    #[test]
    fn request_injects_system_prompt_and_flattens_history() {
        let mut session = ChatSession::new("m1", Vec::new());
        let mut earlier = Message::user("");
        earlier.content = MessageContent::Blocks(vec![
            ContentBlock::Text("old picture".to_string()),
            ContentBlock::Image(ImageRef {
                url: "https://example.com/old.png".to_string(),
            }),
        ]);
        session.transcript.push(earlier);
        session.transcript.push(Message::assistant("A cat."));

        let options = SamplingOptions {
            temperature: Some(0.7),
            max_tokens: Some(1024),
            ..SamplingOptions::default()
        };
        let pending = session
            .submit(
                "and this one?",
                vec![ImageRef {
                    url: "https://example.com/new.png".to_string(),
                }],
                &options,
            )
            .expect("accepted");
        let request = pending.request;

        assert_eq!(request.model, "m1");
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.max_tokens, Some(1024));
        assert_eq!(request.messages.len(), 4);
        assert_eq!(request.messages[0].role, WireRole::System);
        assert_eq!(
            request.messages[1].content,
            WireContent::Text("old picture".to_string())
        );
        assert_eq!(
            request.messages[3].content.image_urls(),
            vec!["https://example.com/new.png"]
        );
        assert_eq!(request.messages[3].content.flatten_text(), "and this one?");
        // The stored transcript never carries the system turn.
        assert!(session.transcript.iter().all(|message| message.role != Role::System));
    }

    #[test]
    fn undecodable_attachment_is_skipped() {
        let images = prepare_attachments(vec![
            Attachment::ImageData(b"not an image".to_vec()),
            Attachment::ImageUrl("https://example.com/a.png".to_string()),
        ]);
        assert_eq!(
            images,
            vec![ImageRef {
                url: "https://example.com/a.png".to_string()
            }]
        );

        let mut session = ChatSession::new("m1", Vec::new());
        let images = prepare_attachments(vec![Attachment::ImageData(b"not an image".to_vec())]);
        let pending = session
            .submit("hi", images, &SamplingOptions::default())
            .expect("text still sent");
        assert_eq!(
            pending.request.messages[1].content,
            WireContent::Text("hi".to_string())
        );

        let mut attachment_only = ChatSession::new("m1", Vec::new());
        let images = prepare_attachments(vec![Attachment::ImageData(Vec::new())]);
        assert!(
            attachment_only
                .submit("", images, &SamplingOptions::default())
                .is_none()
        );
        assert!(attachment_only.is_empty());
    }

    #[test]
    fn system_prompt_normalization_is_idempotent() {
        let once = with_system_prompt(
            vec![WireMessage::text(WireRole::User, "Hello")],
            DEFAULT_SYSTEM_PROMPT,
        );
        let twice = with_system_prompt(once.clone(), DEFAULT_SYSTEM_PROMPT);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);

        let custom = with_system_prompt(
            vec![
                WireMessage::text(WireRole::System, "Custom system prompt"),
                WireMessage::text(WireRole::User, "Hello"),
            ],
            DEFAULT_SYSTEM_PROMPT,
        );
        assert_eq!(custom[0].content, WireContent::Text("Custom system prompt".to_string()));
        assert_eq!(custom.len(), 2);
    }
}
