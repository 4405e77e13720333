use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::decoder::StreamEvent;
use super::model::{Model, ModelCatalog};
use super::wire::ChatRequest;

/// Capacity of the channel between a stream worker and its consumer.
///
/// The worker awaits free capacity, so a slow consumer applies backpressure instead
/// of letting undelivered tokens pile up.
pub const STREAM_EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProviderKind {
    /// Ollama `/api/chat`, newline-delimited JSON, no credential.
    #[default]
    Ollama,
    /// OpenAI-style `/chat/completions` with server-sent events (Groq and friends).
    OpenAiCompatible,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "openai" | "openai-compatible" | "groq" => Some(Self::OpenAiCompatible),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAiCompatible => "openai",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        matches!(self, Self::OpenAiCompatible)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        kind: ProviderKind,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
        }
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Coarse classification shown to callers that only care about the failure family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoCredential,
    Transport,
    InvalidResponse,
    Api,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("No API key configured"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: &'static str,
    },
    #[snafu(display("Network error: {source}"))]
    Transport {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("Network error: {message}"))]
    TransportInterrupted {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("Invalid response from API: {details}"))]
    InvalidResponse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("API error: {message}"))]
    Api {
        stage: &'static str,
        status: Option<u16>,
        message: String,
    },
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingApiKey { .. } => ErrorKind::NoCredential,
            Self::Transport { .. } | Self::TransportInterrupted { .. } => ErrorKind::Transport,
            Self::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            Self::Api { .. } => ErrorKind::Api,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::MissingApiKey { stage, .. }
            | Self::Transport { stage, .. }
            | Self::TransportInterrupted { stage, .. }
            | Self::InvalidResponse { stage, .. }
            | Self::Api { stage, .. } => stage,
        }
    }
}

/// Consumer half of one streaming request.
pub struct ProviderEventStream {
    events: mpsc::Receiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(events: mpsc::Receiver<StreamEvent>, cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Signals the worker to stop. Returns false when already cancelled or the worker is gone.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait ChatProvider: Send + Sync {
    fn id(&self) -> &str;
    fn default_model(&self) -> &str;
    fn fallback_models(&self) -> &[Model];
    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>>;
    fn stream_chat(&self, request: ChatRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Builds the worker-side sender, the consumer stream and the worker's cancel receiver.
///
/// Public so alternative providers (and test doubles) share the same cancellation
/// contract as the HTTP client.
pub fn make_event_stream() -> (
    mpsc::Sender<StreamEvent>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::channel(STREAM_EVENT_CHANNEL_CAPACITY);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}
