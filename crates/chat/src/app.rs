use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use lama_llm::{ChatProvider, ModelCatalog, StreamEvent};
use lama_storage::{ChatStore, StoredChat};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::collection::{ChatCollection, CollectionEffects};
use crate::debounce::SaveDebouncer;
use crate::message::{Attachment, ImageRef, SessionId};
use crate::persistence::{from_stored, snapshot_to_stored};
use crate::session::{PendingRequest, StreamGeneration, StreamOutcome, prepare_attachments};
use crate::settings::SettingsProvider;

pub const APP_UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Every input the app reacts to: UI intents, lifecycle signals and results of its own
/// background tasks.
#[derive(Debug)]
pub enum AppEvent {
    NewChat,
    SelectChat(SessionId),
    DeleteChat(SessionId),
    OpenSettings,
    Pop,
    Submit {
        text: String,
        attachments: Vec<Attachment>,
    },
    /// Attachments of a submit, prepared off the event loop.
    AttachmentsPrepared {
        session_id: SessionId,
        text: String,
        images: Vec<ImageRef>,
    },
    Stop,
    SelectModel(String),
    LoadModels,
    ModelsLoaded(ModelCatalog),
    ModelsLoadFailed(String),
    LoadSavedChats,
    SavedChatsLoaded(Vec<StoredChat>),
    Stream {
        session_id: SessionId,
        generation: StreamGeneration,
        event: StreamEvent,
    },
    StreamClosed {
        session_id: SessionId,
        generation: StreamGeneration,
    },
    /// The debounce interval elapsed without further changes.
    SaveDue,
    WillSuspend,
    WillTerminate,
    SaveNow,
    Shutdown,
}

/// Row of the chat list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: Option<String>,
    pub model: String,
    pub message_count: usize,
    pub is_loading: bool,
    pub is_open: bool,
}

/// Notifications for observers of the app.
#[derive(Debug, Clone, PartialEq)]
pub enum AppUpdate {
    TokenAppended { session_id: SessionId, text: String },
    ReasoningAppended { session_id: SessionId, text: String },
    StreamFinished { session_id: SessionId, reason: Option<String> },
    StreamFailed { session_id: SessionId, message: String },
    StreamCancelled { session_id: SessionId },
    ModelsLoaded { models: Vec<String>, warning: Option<String> },
    CollectionChanged(Vec<SessionSummary>),
    ChatsSaved { chat_count: usize },
}

/// Cloneable entry point for collaborators outside the event loop.
#[derive(Clone)]
pub struct AppHandle {
    events: mpsc::UnboundedSender<AppEvent>,
    updates: broadcast::Sender<AppUpdate>,
}

impl AppHandle {
    /// Returns false once the app has stopped.
    pub fn send(&self, event: AppEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn submit(&self, text: impl Into<String>) -> bool {
        self.send(AppEvent::Submit {
            text: text.into(),
            attachments: Vec::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppUpdate> {
        self.updates.subscribe()
    }
}

struct ActiveStream {
    generation: StreamGeneration,
    worker: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// Orders chat writes: snapshots are numbered when taken, and a write whose snapshot is
/// older than the last one written is dropped.
#[derive(Default)]
struct SaveGate {
    taken: AtomicU64,
    written: Mutex<u64>,
}

impl SaveGate {
    fn next_sequence(&self) -> u64 {
        self.taken.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Single writer of the chat collection.
///
/// Everything that mutates sessions arrives as an [`AppEvent`] on one queue; streaming
/// and disk I/O run in background tasks that report back through the same queue.
pub struct ChatApp {
    collection: ChatCollection,
    provider: Arc<dyn ChatProvider>,
    settings: Arc<dyn SettingsProvider>,
    store: Arc<dyn ChatStore>,
    save_gate: Arc<SaveGate>,
    debouncer: SaveDebouncer,
    /// Changes not yet covered by a started save.
    save_pending: bool,
    streams: HashMap<SessionId, ActiveStream>,
    in_flight_saves: Vec<JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<AppEvent>,
    events_rx: mpsc::UnboundedReceiver<AppEvent>,
    updates: broadcast::Sender<AppUpdate>,
}

impl ChatApp {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        settings: Arc<dyn SettingsProvider>,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(APP_UPDATE_CHANNEL_CAPACITY);
        Self {
            collection: ChatCollection::new(),
            provider,
            settings,
            store,
            save_gate: Arc::default(),
            debouncer: SaveDebouncer::default(),
            save_pending: false,
            streams: HashMap::new(),
            in_flight_saves: Vec::new(),
            events_tx,
            events_rx,
            updates,
        }
    }

    pub fn handle(&self) -> AppHandle {
        AppHandle {
            events: self.events_tx.clone(),
            updates: self.updates.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppUpdate> {
        self.updates.subscribe()
    }

    pub fn collection(&self) -> &ChatCollection {
        &self.collection
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let open = self.collection.navigated_id();
        self.collection
            .sessions()
            .iter()
            .map(|session| SessionSummary {
                id: session.id,
                title: session.title(),
                model: session.selected_model.clone(),
                message_count: session.transcript.len(),
                is_loading: session.is_loading(),
                is_open: Some(session.id) == open,
            })
            .collect()
    }

    /// Queues the initial model catalog fetch and the saved-chat restore.
    pub fn initialize(&self) {
        let _ = self.events_tx.send(AppEvent::LoadModels);
        let _ = self.events_tx.send(AppEvent::LoadSavedChats);
    }

    pub async fn run(mut self) {
        tracing::debug!("chat app event loop started");
        while self.process_next().await {}
        tracing::debug!("chat app event loop stopped");
    }

    /// Handles one queued event. Returns false after `Shutdown`.
    pub async fn process_next(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => self.handle_event(event).await,
            None => false,
        }
    }

    pub async fn handle_event(&mut self, event: AppEvent) -> bool {
        match event {
            AppEvent::NewChat => {
                let default_model = self.settings.default_model();
                let (_, effects) = self.collection.create_session(&default_model);
                self.apply_effects(effects);
                self.publish_collection();
            }
            AppEvent::SelectChat(session_id) => match self.collection.select_session(session_id) {
                Some(effects) => {
                    self.apply_effects(effects);
                    self.publish_collection();
                }
                None => tracing::warn!(session_id = %session_id, "select for unknown session"),
            },
            AppEvent::DeleteChat(session_id) => {
                let effects = self.collection.delete_session(session_id);
                self.apply_effects(effects);
                self.publish_collection();
            }
            AppEvent::OpenSettings => {
                let effects = self.collection.open_settings();
                self.apply_effects(effects);
                self.publish_collection();
            }
            AppEvent::Pop => {
                let effects = self.collection.pop();
                self.apply_effects(effects);
                self.publish_collection();
            }
            AppEvent::Submit { text, attachments } => self.submit(text, attachments),
            AppEvent::AttachmentsPrepared {
                session_id,
                text,
                images,
            } => self.submit_prepared(session_id, &text, images),
            AppEvent::Stop => {
                if let Some(session_id) = self.collection.navigated_id() {
                    self.cancel_stream(session_id);
                }
            }
            AppEvent::SelectModel(model) => {
                let Some(session_id) = self.collection.navigated_id() else {
                    return true;
                };
                self.collection
                    .update_session(session_id, |session| session.select_model(model.as_str()));
                tracing::debug!(session_id = %session_id, model_id = %model, "selected model");
                self.schedule_save();
                self.publish_collection();
            }
            AppEvent::LoadModels => self.spawn_model_fetch(),
            AppEvent::ModelsLoaded(catalog) => {
                let models = catalog.model_ids();
                tracing::info!(
                    provider_id = self.provider.id(),
                    origin = ?catalog.origin,
                    model_count = models.len(),
                    "model catalog loaded"
                );
                self.collection.apply_model_catalog(models.clone());
                self.publish(AppUpdate::ModelsLoaded {
                    models,
                    warning: catalog.warning,
                });
            }
            AppEvent::ModelsLoadFailed(message) => {
                tracing::warn!(
                    provider_id = self.provider.id(),
                    error = %message,
                    "failed to load models"
                );
                self.publish(AppUpdate::ModelsLoaded {
                    models: self.collection.available_models().to_vec(),
                    warning: Some(message),
                });
            }
            AppEvent::LoadSavedChats => self.spawn_saved_chats_load(),
            AppEvent::SavedChatsLoaded(chats) => {
                let restored = chats.into_iter().map(from_stored).collect();
                let default_model = self.settings.default_model();
                let bootstrapped = self.collection.merge_restored(restored, &default_model);
                if let Some((session_id, effects)) = bootstrapped {
                    tracing::debug!(
                        session_id = %session_id,
                        "started a session for an empty collection"
                    );
                    self.apply_effects(effects);
                }
                self.publish_collection();
            }
            AppEvent::Stream {
                session_id,
                generation,
                event,
            } => self.apply_stream_event(session_id, generation, event),
            AppEvent::StreamClosed {
                session_id,
                generation,
            } => self.stream_closed(session_id, generation),
            AppEvent::SaveDue => self.debounced_save(),
            AppEvent::WillSuspend => self.lifecycle_save("will-suspend"),
            AppEvent::WillTerminate => self.lifecycle_save("will-terminate"),
            AppEvent::SaveNow => self.save_now(),
            AppEvent::Shutdown => {
                self.shutdown().await;
                return false;
            }
        }
        true
    }

    fn submit(&mut self, text: String, attachments: Vec<Attachment>) {
        let session_id = match self.collection.navigated_id() {
            Some(session_id) => session_id,
            None => {
                let default_model = self.settings.default_model();
                let (session_id, effects) = self.collection.create_session(&default_model);
                self.apply_effects(effects);
                session_id
            }
        };

        if attachments.is_empty() {
            self.submit_prepared(session_id, &text, Vec::new());
            return;
        }

        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let prepared = tokio::task::spawn_blocking(move || prepare_attachments(attachments));
            let images = match prepared.await {
                Ok(images) => images,
                Err(error) => {
                    tracing::error!(error = %error, "attachment preparation task failed");
                    Vec::new()
                }
            };
            let _ = events.send(AppEvent::AttachmentsPrepared {
                session_id,
                text,
                images,
            });
        });
    }

    fn submit_prepared(&mut self, session_id: SessionId, text: &str, images: Vec<ImageRef>) {
        let replacing = self
            .collection
            .session(session_id)
            .is_some_and(|session| session.is_loading());
        if replacing && !(text.trim().is_empty() && images.is_empty()) {
            self.cancel_stream(session_id);
        }

        let options = self.settings.sampling_options();
        let pending = self
            .collection
            .update_session(session_id, |session| session.submit(text, images, &options))
            .flatten();

        let Some(pending) = pending else {
            tracing::debug!(session_id = %session_id, "submit rejected");
            return;
        };

        self.start_stream(session_id, pending);
        self.schedule_save();
        self.publish_collection();
    }

    fn start_stream(&mut self, session_id: SessionId, pending: PendingRequest) {
        let generation = pending.generation;
        let handle = match self.provider.stream_chat(pending.request) {
            Ok(handle) => handle,
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    error_kind = ?error.kind(),
                    stage = error.stage(),
                    error = %error,
                    "failed to open chat stream"
                );
                let event = StreamEvent::Error(error.to_string());
                self.apply_stream_event(session_id, generation, event);
                return;
            }
        };

        let worker = tokio::spawn(handle.worker);
        let events = self.events_tx.clone();
        let mut stream = handle.stream;
        let reader = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                let forwarded = events.send(AppEvent::Stream {
                    session_id,
                    generation,
                    event,
                });
                if forwarded.is_err() {
                    return;
                }
            }
            let _ = events.send(AppEvent::StreamClosed {
                session_id,
                generation,
            });
        });

        if let Some(previous) = self.streams.insert(
            session_id,
            ActiveStream {
                generation,
                worker,
                reader,
            },
        ) {
            previous.reader.abort();
        }
    }

    fn apply_stream_event(
        &mut self,
        session_id: SessionId,
        generation: StreamGeneration,
        event: StreamEvent,
    ) {
        let outcome = self
            .collection
            .update_session(session_id, |session| session.apply_stream_event(generation, event))
            .unwrap_or(StreamOutcome::Ignored);

        match outcome {
            StreamOutcome::Ignored => return,
            StreamOutcome::TokenAppended(text) => {
                self.publish(AppUpdate::TokenAppended { session_id, text });
            }
            StreamOutcome::ReasoningAppended(text) => {
                self.publish(AppUpdate::ReasoningAppended { session_id, text });
            }
            StreamOutcome::Finished { reason } => {
                tracing::debug!(session_id = %session_id, reason = ?reason, "stream finished");
                self.publish(AppUpdate::StreamFinished { session_id, reason });
            }
            StreamOutcome::Failed { message } => {
                tracing::warn!(session_id = %session_id, error = %message, "stream failed");
                self.publish(AppUpdate::StreamFailed { session_id, message });
            }
        }

        self.schedule_save();
    }

    fn stream_closed(&mut self, session_id: SessionId, generation: StreamGeneration) {
        let current = self
            .streams
            .get(&session_id)
            .is_some_and(|active| active.generation == generation);
        if current {
            self.streams.remove(&session_id);
        }

        // A channel that closes without a terminal event ends the stream cleanly.
        self.apply_stream_event(session_id, generation, StreamEvent::Done { reason: None });
        if current {
            self.publish_collection();
        }
    }

    fn cancel_stream(&mut self, session_id: SessionId) {
        let cancelled = self
            .collection
            .update_session(session_id, |session| session.cancel())
            .flatten();
        self.stop_stream_task(session_id);

        if cancelled.is_some() {
            self.publish(AppUpdate::StreamCancelled { session_id });
            self.schedule_save();
        }
    }

    /// Dropping the reader drops its event stream, which signals the worker to stop.
    fn stop_stream_task(&mut self, session_id: SessionId) {
        if let Some(active) = self.streams.remove(&session_id) {
            active.reader.abort();
            tracing::debug!(
                session_id = %session_id,
                generation = active.generation.0,
                "stopped stream task"
            );
        }
    }

    fn apply_effects(&mut self, effects: CollectionEffects) {
        for session_id in effects.cancelled_streams {
            self.stop_stream_task(session_id);
            self.publish(AppUpdate::StreamCancelled { session_id });
        }
        if effects.schedule_save {
            self.schedule_save();
        }
    }

    fn spawn_model_fetch(&self) {
        let provider = Arc::clone(&self.provider);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match provider.fetch_models().await {
                Ok(catalog) => AppEvent::ModelsLoaded(catalog),
                Err(error) => AppEvent::ModelsLoadFailed(error.to_string()),
            };
            let _ = events.send(event);
        });
    }

    fn spawn_saved_chats_load(&self) {
        let store = Arc::clone(&self.store);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let chats = match tokio::task::spawn_blocking(move || store.load()).await {
                Ok(chats) => chats,
                Err(error) => {
                    tracing::error!(error = %error, "saved chat load task failed");
                    Vec::new()
                }
            };
            let _ = events.send(AppEvent::SavedChatsLoaded(chats));
        });
    }

    /// Marks the state dirty and (re)arms the debounce timer. The snapshot is taken when
    /// the timer's [`AppEvent::SaveDue`] is handled.
    fn schedule_save(&mut self) {
        self.save_pending = true;
        let events = self.events_tx.clone();
        self.debouncer.schedule(async move {
            let _ = events.send(AppEvent::SaveDue);
        });
    }

    fn debounced_save(&mut self) {
        if !self.save_pending {
            return;
        }
        if !self.settings.auto_save_enabled() {
            tracing::debug!("auto-save disabled; skipping debounced save");
            self.save_pending = false;
            return;
        }
        self.spawn_save("debounced");
    }

    fn lifecycle_save(&mut self, reason: &'static str) {
        if !self.settings.auto_save_enabled() {
            tracing::debug!(reason, "auto-save disabled; skipping lifecycle save");
            return;
        }
        self.debouncer.cancel();
        self.spawn_save(reason);
    }

    /// Immediate save that ignores the auto-save preference.
    pub fn save_now(&mut self) {
        self.debouncer.cancel();
        self.spawn_save("save-now");
    }

    fn spawn_save(&mut self, reason: &'static str) {
        self.save_pending = false;
        let sequence = self.save_gate.next_sequence();
        let chats = snapshot_to_stored(&self.collection.snapshot());
        let handle = tokio::spawn(persist_chats(
            Arc::clone(&self.store),
            Arc::clone(&self.save_gate),
            self.updates.clone(),
            sequence,
            chats,
            reason,
        ));
        self.in_flight_saves.retain(|save| !save.is_finished());
        self.in_flight_saves.push(handle);
    }

    /// Waits for every save started so far.
    pub async fn wait_for_saves(&mut self) {
        for save in self.in_flight_saves.drain(..) {
            if let Err(error) = save.await {
                tracing::warn!(error = %error, "save task failed");
            }
        }
    }

    async fn shutdown(&mut self) {
        tracing::debug!(active_streams = self.streams.len(), "shutting down chat app");

        let session_ids = self.streams.keys().copied().collect::<Vec<_>>();
        for session_id in session_ids {
            self.collection
                .update_session(session_id, |session| session.cancel());
        }
        for (_, active) in self.streams.drain() {
            active.reader.abort();
            if let Err(error) = active.worker.await {
                tracing::warn!(error = %error, "stream worker failed");
            }
        }

        self.debouncer.cancel();
        if self.save_pending && self.settings.auto_save_enabled() {
            self.spawn_save("shutdown-flush");
        }
        self.wait_for_saves().await;
    }

    fn publish(&self, update: AppUpdate) {
        let _ = self.updates.send(update);
    }

    fn publish_collection(&self) {
        self.publish(AppUpdate::CollectionChanged(self.summaries()));
    }
}

async fn persist_chats(
    store: Arc<dyn ChatStore>,
    gate: Arc<SaveGate>,
    updates: broadcast::Sender<AppUpdate>,
    sequence: u64,
    chats: Vec<StoredChat>,
    reason: &'static str,
) {
    let chat_count = chats.len();
    let written = tokio::task::spawn_blocking(move || {
        let mut last_written = gate.written.lock().unwrap_or_else(PoisonError::into_inner);
        if sequence < *last_written {
            return false;
        }
        store.save(&chats);
        *last_written = sequence;
        true
    })
    .await;

    match written {
        Ok(true) => {
            tracing::debug!(reason, sequence, chat_count, "saved chats");
            let _ = updates.send(AppUpdate::ChatsSaved { chat_count });
        }
        Ok(false) => tracing::debug!(reason, sequence, "skipped save of an older snapshot"),
        Err(error) => tracing::error!(reason, error = %error, "chat save task failed"),
    }
}
