mod app;
mod collection;
mod debounce;
mod message;
mod navigation;
mod persistence;
mod session;
mod settings;

pub use app::{
    APP_UPDATE_CHANNEL_CAPACITY, AppEvent, AppHandle, AppUpdate, ChatApp, SessionSummary,
};
pub use collection::{ChatCollection, CollectionEffects};
pub use debounce::{SAVE_DEBOUNCE_INTERVAL, SaveDebouncer};
pub use message::{
    Attachment, ContentBlock, ImageRef, Message, MessageContent, MessageId, Role, SessionId,
    WebSource,
};
pub use navigation::NavigationFrame;
pub use persistence::{from_stored, snapshot_to_stored, to_stored};
pub use session::{
    ChatSession, DEFAULT_SYSTEM_PROMPT, LoadingState, PendingRequest, SamplingOptions,
    StreamGeneration, StreamOutcome, prepare_attachments, with_system_prompt,
};
pub use settings::{
    AppSettings, DEFAULT_MAX_TOKENS, DEFAULT_OLLAMA_ENDPOINT, DEFAULT_OPENAI_ENDPOINT,
    DEFAULT_TEMPERATURE, MemorySettings, SettingsError, SettingsProvider, SettingsResult,
    SettingsStore,
};
