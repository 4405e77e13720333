use std::sync::Arc;

mod attachment;
mod client;
mod decoder;
mod model;
mod provider;
mod wire;

pub use attachment::{AttachmentError, JPEG_QUALITY, MAX_IMAGE_DIMENSION, prepare_image};
pub use client::ChatClient;
pub use decoder::{MAX_PENDING_LINE_BYTES, StreamDecoder, StreamEvent, decode_stream};
pub use model::{
    CacheLookup, CatalogOrigin, DEFAULT_GROQ_MODEL, DEFAULT_OLLAMA_MODEL, MODEL_CACHE_TTL, Model,
    ModelCache, ModelCatalog, default_model_for, fallback_models_for,
};
pub use provider::{
    BoxFuture, ChatProvider, ErrorKind, ProviderConfig, ProviderError, ProviderEventStream,
    ProviderKind, ProviderResult, ProviderStreamHandle, ProviderWorker,
    STREAM_EVENT_CHANNEL_CAPACITY, make_event_stream,
};
pub use wire::{ChatRequest, ContentBlock, ImageUrl, WireContent, WireMessage, WireRole};

pub fn create_provider(config: ProviderConfig) -> ProviderResult<Arc<dyn ChatProvider>> {
    tracing::debug!(
        provider_id = config.kind.id(),
        endpoint = %config.endpoint,
        "creating chat provider"
    );
    Ok(Arc::new(ChatClient::new(config)?))
}
