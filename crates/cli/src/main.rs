use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use clap::Parser;
use lama_chat::{
    AppEvent, AppHandle, AppSettings, AppUpdate, ChatApp, MemorySettings, SessionId,
    SessionSummary, SettingsProvider, SettingsStore,
};
use lama_llm::{ProviderError, create_provider};
use lama_storage::JsonFileStore;
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod command;

use command::{Command, HELP};

#[derive(Debug, Parser)]
#[command(name = "lama", version, about = "Chat with a local or hosted language model")]
struct Args {
    /// Provider endpoint, e.g. http://localhost:11434
    #[arg(long)]
    endpoint: Option<String>,
    /// Default model for new chats
    #[arg(long)]
    model: Option<String>,
    /// `ollama` or `openai`
    #[arg(long)]
    provider: Option<String>,
}

impl Args {
    fn has_overrides(&self) -> bool {
        self.endpoint.is_some() || self.model.is_some() || self.provider.is_some()
    }

    fn apply(&self, mut settings: AppSettings) -> AppSettings {
        if let Some(provider) = &self.provider {
            settings.provider = provider.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            settings.endpoint = endpoint.clone();
        }
        if let Some(model) = &self.model {
            settings.default_model = model.clone();
        }
        settings
    }
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to create chat provider on `{stage}`: {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: io::Error,
    },
}

/// What the printer task has seen last, for commands that address chats by index.
#[derive(Default)]
struct ViewState {
    summaries: Vec<SessionSummary>,
    models: Vec<String>,
}

type SharedView = Arc<Mutex<ViewState>>;

fn lock_view(view: &SharedView) -> std::sync::MutexGuard<'_, ViewState> {
    view.lock().unwrap_or_else(PoisonError::into_inner)
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let store = SettingsStore::load();
    let settings: Arc<dyn SettingsProvider> = if args.has_overrides() {
        let merged = args.apply(AppSettings::clone(&store.settings()));
        Arc::new(MemorySettings::new(merged))
    } else {
        Arc::new(store)
    };

    let current = settings.settings();
    let provider = create_provider(current.to_provider_config()).context(CreateProviderSnafu {
        stage: "create-provider",
    })?;
    tracing::info!(
        provider_id = provider.id(),
        endpoint = %current.resolved_endpoint(),
        model_id = %settings.default_model(),
        "starting chat"
    );

    let chats = Arc::new(JsonFileStore::open_default());
    let app = ChatApp::new(provider, settings, chats);
    let handle = app.handle();
    let view = SharedView::default();

    let printer = tokio::spawn(print_updates(handle.subscribe(), Arc::clone(&view)));
    app.initialize();
    let app_task = tokio::spawn(app.run());

    println!("{HELP}");
    let result = read_commands(&handle, &view).await;

    handle.send(AppEvent::WillTerminate);
    handle.send(AppEvent::Shutdown);
    if let Err(error) = app_task.await {
        tracing::error!(error = %error, "chat app task failed");
    }
    printer.abort();

    result
}

async fn read_commands(handle: &AppHandle, view: &SharedView) -> Result<(), CliError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-stdin-line",
    })? {
        let event = match Command::parse(&line) {
            Command::Quit => break,
            Command::Empty => continue,
            Command::Help => {
                println!("{HELP}");
                continue;
            }
            Command::Invalid(raw) => {
                eprintln!("unknown command: {raw} (try /help)");
                continue;
            }
            Command::List => {
                print_summaries(&lock_view(view).summaries);
                continue;
            }
            Command::Models => {
                let view = lock_view(view);
                if view.models.is_empty() {
                    println!("no models loaded yet");
                }
                for model in &view.models {
                    println!("  {model}");
                }
                continue;
            }
            Command::Open(index) => match chat_at(view, index) {
                Some(session_id) => AppEvent::SelectChat(session_id),
                None => {
                    eprintln!("no chat #{index}");
                    continue;
                }
            },
            Command::Delete(index) => match chat_at(view, index) {
                Some(session_id) => AppEvent::DeleteChat(session_id),
                None => {
                    eprintln!("no chat #{index}");
                    continue;
                }
            },
            Command::New => AppEvent::NewChat,
            Command::Model(model) => AppEvent::SelectModel(model),
            Command::Stop => AppEvent::Stop,
            Command::Save => AppEvent::SaveNow,
            Command::Submit(text) => {
                if !handle.submit(text) {
                    break;
                }
                continue;
            }
        };

        if !handle.send(event) {
            break;
        }
    }

    Ok(())
}

fn chat_at(view: &SharedView, index: usize) -> Option<SessionId> {
    lock_view(view)
        .summaries
        .get(index.checked_sub(1)?)
        .map(|summary| summary.id)
}

async fn print_updates(mut updates: broadcast::Receiver<AppUpdate>, view: SharedView) {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "display fell behind; some updates were dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match update {
            AppUpdate::TokenAppended { text, .. } => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
            AppUpdate::ReasoningAppended { .. } => {}
            AppUpdate::StreamFinished { .. } => println!(),
            AppUpdate::StreamFailed { message, .. } => eprintln!("\nerror: {message}"),
            AppUpdate::StreamCancelled { .. } => println!("\n[stopped]"),
            AppUpdate::ModelsLoaded { models, warning } => {
                if let Some(warning) = warning {
                    eprintln!("warning: {warning}");
                }
                lock_view(&view).models = models;
            }
            AppUpdate::CollectionChanged(summaries) => lock_view(&view).summaries = summaries,
            AppUpdate::ChatsSaved { chat_count } => {
                tracing::debug!(chat_count, "chats saved");
            }
        }
    }
}

fn print_summaries(summaries: &[SessionSummary]) {
    if summaries.is_empty() {
        println!("no chats");
        return;
    }
    for (index, summary) in summaries.iter().enumerate() {
        let marker = if summary.is_open { '*' } else { ' ' };
        let title = summary.title.as_deref().unwrap_or("(empty)");
        println!(
            "{marker}{:>3}. {title} [{}, {} messages]",
            index + 1,
            summary.model,
            summary.message_count
        );
    }
}
