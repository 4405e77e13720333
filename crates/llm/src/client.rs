
use futures::StreamExt;
use serde::Deserialize;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::decoder::{StreamEvent, decode_stream};
use super::model::{
    CacheLookup, CatalogOrigin, Model, ModelCache, ModelCatalog, default_model_for,
    fallback_models_for,
};
use super::provider::{
    BoxFuture, ChatProvider, InvalidResponseSnafu, MissingApiKeySnafu, ProviderConfig,
    ProviderError, ProviderKind, ProviderResult, ProviderStreamHandle, ProviderWorker,
    TransportSnafu, make_event_stream,
};
use super::wire::{ChatRequest, OllamaChatBody};

/// HTTP chat client for Ollama and OpenAI-compatible endpoints.
pub struct ChatClient {
    http: reqwest::Client,
    config: ProviderConfig,
    fallback_models: Vec<Model>,
    model_cache: ModelCache,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaTag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModelEntry>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModelEntry {
    id: String,
}

impl ChatClient {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        let http = reqwest::Client::builder().build().context(TransportSnafu {
            stage: "build-http-client",
        })?;

        Ok(Self {
            http,
            fallback_models: fallback_models_for(config.kind),
            config,
            model_cache: ModelCache::default(),
        })
    }

    fn cache_key(&self) -> String {
        format!("{}@{}", self.config.kind.id(), self.config.endpoint)
    }

    fn ensure_credential(&self, stage: &'static str) -> ProviderResult<()> {
        ensure!(
            !self.config.kind.requires_api_key() || !self.config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage,
                provider_id: self.config.kind.id(),
            }
        );
        Ok(())
    }

    fn authorize(
        config: &ProviderConfig,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        if config.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&config.api_key)
        }
    }

    async fn fetch_models_from_provider(&self) -> ProviderResult<Vec<Model>> {
        self.ensure_credential("fetch-models")?;

        let path = match self.config.kind {
            ProviderKind::Ollama => "/api/tags",
            ProviderKind::OpenAiCompatible => "/models",
        };
        let url = format!("{}{}", self.config.endpoint, path);
        let response = Self::authorize(&self.config, self.http.get(url))
            .send()
            .await
            .context(TransportSnafu {
                stage: "send-model-request",
            })?;

        let status = response.status();
        let payload = response.text().await.context(TransportSnafu {
            stage: "read-model-response",
        })?;
        if !status.is_success() {
            return Err(api_error_from_body("model-http-status", status, &payload));
        }

        let mut ids = match self.config.kind {
            ProviderKind::Ollama => serde_json::from_str::<OllamaTags>(&payload)
                .map(|tags| tags.models.into_iter().map(|tag| tag.name).collect::<Vec<_>>()),
            ProviderKind::OpenAiCompatible => serde_json::from_str::<OpenAiModelList>(&payload)
                .map(|list| list.data.into_iter().map(|entry| entry.id).collect::<Vec<_>>()),
        }
        .map_err(|error| ProviderError::InvalidResponse {
            stage: "parse-model-response",
            details: error.to_string(),
        })?;

        ids.retain(|id| !id.trim().is_empty());
        ids.sort();
        ids.dedup();
        ensure!(
            !ids.is_empty(),
            InvalidResponseSnafu {
                stage: "parse-model-response",
                details: "no model identifiers found in provider response",
            }
        );

        Ok(ids.into_iter().map(Model::new).collect())
    }

    async fn open_stream(
        http: &reqwest::Client,
        config: &ProviderConfig,
        request: &ChatRequest,
    ) -> ProviderResult<reqwest::Response> {
        let builder = match config.kind {
            ProviderKind::Ollama => http
                .post(format!("{}/api/chat", config.endpoint))
                .json(&OllamaChatBody::from(request)),
            ProviderKind::OpenAiCompatible => Self::authorize(
                config,
                http.post(format!("{}/chat/completions", config.endpoint)),
            )
            .json(request),
        };

        let response = builder.send().await.context(TransportSnafu {
            stage: "send-chat-request",
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = error_body(response, "chat-http-status").await;
        Err(api_error_from_body("chat-http-status", status, &body))
    }

    /// Forwards one event unless the consumer cancels first. Returns false when the
    /// worker should stop.
    async fn forward(
        event_tx: &mpsc::Sender<StreamEvent>,
        cancel_rx: &mut oneshot::Receiver<()>,
        event: StreamEvent,
    ) -> bool {
        tokio::select! {
            _ = cancel_rx => false,
            sent = event_tx.send(event) => sent.is_ok(),
        }
    }

    fn emit_error_event(event_tx: &mpsc::Sender<StreamEvent>, error: &ProviderError) {
        // Best effort: a full or closed channel means nobody is waiting for the error.
        let _ = event_tx.try_send(StreamEvent::Error(error.to_string()));
    }

    async fn run_stream_worker(
        http: reqwest::Client,
        config: ProviderConfig,
        request: ChatRequest,
        event_tx: mpsc::Sender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let opened = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(model_id = %request.model, "stream cancelled before response");
                return;
            }
            opened = Self::open_stream(&http, &config, &request) => opened,
        };

        let response = match opened {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    provider_id = config.kind.id(),
                    model_id = %request.model,
                    stage = error.stage(),
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, &error);
                return;
            }
        };

        let mut events = Box::pin(decode_stream(Box::pin(response.bytes_stream())));
        let mut content_tokens = 0usize;

        loop {
            let next = tokio::select! {
                _ = &mut cancel_rx => {
                    // Dropping the body stream closes the connection.
                    tracing::debug!(
                        model_id = %request.model,
                        content_tokens,
                        "provider stream cancelled"
                    );
                    return;
                }
                next = events.next() => next,
            };

            let Some(event) = next else {
                return;
            };

            let event = match event {
                StreamEvent::TokenDelta(text) => {
                    content_tokens += 1;
                    StreamEvent::TokenDelta(text)
                }
                StreamEvent::Done { .. } if content_tokens == 0 => {
                    let error = ProviderError::InvalidResponse {
                        stage: "stream-complete",
                        details: "response contained no content".to_string(),
                    };
                    tracing::warn!(
                        model_id = %request.model,
                        error = %error,
                        "stream finished empty"
                    );
                    StreamEvent::Error(error.to_string())
                }
                StreamEvent::Error(message) => {
                    tracing::warn!(
                        model_id = %request.model,
                        content_tokens,
                        error = %message,
                        "provider stream failed"
                    );
                    StreamEvent::Error(message)
                }
                other => other,
            };

            let terminal = event.is_terminal();
            if !Self::forward(&event_tx, &mut cancel_rx, event).await || terminal {
                return;
            }
        }
    }
}

/// Body of a failed response; only used to enrich the error message.
async fn error_body(response: reqwest::Response, stage: &'static str) -> String {
    match response.text().await {
        Ok(body) => body,
        Err(error) => {
            tracing::debug!(stage, error = %error, "could not read error response body");
            String::new()
        }
    }
}

fn api_error_from_body(
    stage: &'static str,
    status: reqwest::StatusCode,
    body: &str,
) -> ProviderError {
    let parsed = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            let error = value.get("error").unwrap_or(&value);
            error
                .as_str()
                .or_else(|| error.get("message").and_then(|message| message.as_str()))
                .map(str::to_string)
        });

    let message = parsed
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        });

    ProviderError::Api {
        stage,
        status: Some(status.as_u16()),
        message,
    }
}

impl ChatProvider for ChatClient {
    fn id(&self) -> &str {
        self.config.kind.id()
    }

    fn default_model(&self) -> &str {
        default_model_for(self.config.kind)
    }

    fn fallback_models(&self) -> &[Model] {
        &self.fallback_models
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<ModelCatalog>> {
        Box::pin(async move {
            let cache_key = self.cache_key();
            let cached = match self.model_cache.lookup(&cache_key).await {
                CacheLookup::Fresh(models) => {
                    return Ok(ModelCatalog::new(models, CatalogOrigin::Cached));
                }
                CacheLookup::Stale(models) => Some(models),
                CacheLookup::Miss => None,
            };

            let error = match self.fetch_models_from_provider().await {
                Ok(models) => {
                    self.model_cache.store(&cache_key, &models).await;
                    return Ok(ModelCatalog::new(models, CatalogOrigin::Live));
                }
                Err(error) => error,
            };

            match cached {
                Some(models) => {
                    tracing::warn!(
                        provider_id = %self.id(),
                        cached_model_count = models.len(),
                        error = %error,
                        "model fetch failed; serving stale cached models"
                    );
                    Ok(ModelCatalog::degraded(models, CatalogOrigin::StaleCache, error.to_string()))
                }
                None => {
                    tracing::warn!(
                        provider_id = %self.id(),
                        fallback_model_count = self.fallback_models.len(),
                        error = %error,
                        "model fetch failed without cache; serving built-in models"
                    );
                    Ok(ModelCatalog::degraded(
                        self.fallback_models.clone(),
                        CatalogOrigin::BuiltIn,
                        error.to_string(),
                    ))
                }
            }
        })
    }

    fn stream_chat(&self, mut request: ChatRequest) -> ProviderResult<ProviderStreamHandle> {
        self.ensure_credential("stream-chat")?;
        request.stream = true;

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.http.clone(),
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
