use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use lama_llm::{ProviderConfig, ProviderKind, default_model_for};
use lama_storage::{StorageError, write_json_atomic};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::session::{DEFAULT_SYSTEM_PROMPT, SamplingOptions};

pub const DEFAULT_PROVIDER_ID: &str = "ollama";
pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";
pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const SETTINGS_DIRECTORY_NAME: &str = "lama";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "LAMA_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_provider_id")]
    pub provider: String,
    /// Empty means the provider's usual endpoint.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    /// Empty means the provider's default model.
    #[serde(default)]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default = "default_auto_save")]
    pub auto_save_chats: bool,
    #[serde(default)]
    pub system_prompt: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider: default_provider_id(),
            endpoint: String::new(),
            api_key: String::new(),
            default_model: String::new(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: None,
            auto_save_chats: true,
            system_prompt: String::new(),
        }
    }
}

impl AppSettings {
    pub fn provider_kind(&self) -> ProviderKind {
        ProviderKind::parse(&self.provider).unwrap_or_else(|| {
            tracing::warn!(provider = %self.provider, "unknown provider; using ollama");
            ProviderKind::Ollama
        })
    }

    pub fn resolved_endpoint(&self) -> String {
        if !self.endpoint.is_empty() {
            return self.endpoint.clone();
        }
        match self.provider_kind() {
            ProviderKind::Ollama => DEFAULT_OLLAMA_ENDPOINT.to_string(),
            ProviderKind::OpenAiCompatible => DEFAULT_OPENAI_ENDPOINT.to_string(),
        }
    }

    pub fn resolved_default_model(&self) -> String {
        if self.default_model.is_empty() {
            default_model_for(self.provider_kind()).to_string()
        } else {
            self.default_model.clone()
        }
    }

    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(
            self.provider_kind(),
            self.api_key.as_str(),
            self.resolved_endpoint(),
        )
    }

    pub fn sampling_options(&self) -> SamplingOptions {
        SamplingOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            top_p: self.top_p,
            system_prompt: if self.system_prompt.is_empty() {
                DEFAULT_SYSTEM_PROMPT.to_string()
            } else {
                self.system_prompt.clone()
            },
        }
    }

    /// Replaces out-of-range values with their defaults.
    pub fn normalized(mut self) -> Self {
        self.provider = if self.provider.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider.trim().to_ascii_lowercase()
        };
        self.endpoint = self.endpoint.trim().trim_end_matches('/').to_string();
        self.api_key = self.api_key.trim().to_string();
        self.default_model = self.default_model.trim().to_string();
        self.system_prompt = self.system_prompt.trim().to_string();

        if !self.temperature.is_finite() || self.temperature <= 0.0 || self.temperature > 2.0 {
            self.temperature = DEFAULT_TEMPERATURE;
        }
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }
        self.top_p = self
            .top_p
            .filter(|value| value.is_finite() && *value > 0.0 && *value <= 1.0);

        self
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to persist settings to {path:?} on `{stage}`: {source}"))]
    Persist {
        stage: &'static str,
        path: PathBuf,
        source: StorageError,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// User preferences consulted by the chat layer.
///
/// Implementors supply a snapshot and a replace operation; the typed accessors are
/// derived from those two.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> Arc<AppSettings>;
    fn update(&self, settings: AppSettings) -> SettingsResult<()>;

    fn default_model(&self) -> String {
        self.settings().resolved_default_model()
    }

    fn set_default_model(&self, model: &str) -> SettingsResult<()> {
        modify_settings(self, |settings| settings.default_model = model.to_string())
    }

    fn temperature(&self) -> f64 {
        self.settings().temperature
    }

    fn set_temperature(&self, temperature: f64) -> SettingsResult<()> {
        modify_settings(self, |settings| settings.temperature = temperature)
    }

    fn max_tokens(&self) -> u32 {
        self.settings().max_tokens
    }

    fn set_max_tokens(&self, max_tokens: u32) -> SettingsResult<()> {
        modify_settings(self, |settings| settings.max_tokens = max_tokens)
    }

    fn top_p(&self) -> Option<f64> {
        self.settings().top_p
    }

    fn auto_save_enabled(&self) -> bool {
        self.settings().auto_save_chats
    }

    fn set_auto_save_enabled(&self, enabled: bool) -> SettingsResult<()> {
        modify_settings(self, |settings| settings.auto_save_chats = enabled)
    }

    fn sampling_options(&self) -> SamplingOptions {
        self.settings().sampling_options()
    }

    /// Restores the preference defaults; provider connection fields are kept.
    fn reset_to_defaults(&self) -> SettingsResult<()> {
        let current = self.settings();
        self.update(AppSettings {
            provider: current.provider.clone(),
            endpoint: current.endpoint.clone(),
            api_key: current.api_key.clone(),
            ..AppSettings::default()
        })
    }
}

fn modify_settings<P>(provider: &P, change: impl FnOnce(&mut AppSettings)) -> SettingsResult<()>
where
    P: SettingsProvider + ?Sized,
{
    let mut settings = AppSettings::clone(&provider.settings());
    change(&mut settings);
    provider.update(settings)
}

/// File-backed settings: defaults, then the JSON file, then `LAMA_*` variables.
pub struct SettingsStore {
    settings: ArcSwap<AppSettings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".lama"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn load_from_disk(path: &Path) -> AppSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> SettingsResult<()> {
        write_json_atomic(&self.config_path, settings).context(PersistSnafu {
            stage: "write-settings-file",
            path: self.config_path.clone(),
        })?;
        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

impl SettingsProvider for SettingsStore {
    fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    fn update(&self, settings: AppSettings) -> SettingsResult<()> {
        let normalized = settings.normalized();
        self.persist(&normalized)?;
        self.settings.store(Arc::new(normalized));
        Ok(())
    }
}

/// Settings kept only in memory.
pub struct MemorySettings {
    settings: ArcSwap<AppSettings>,
}

impl MemorySettings {
    pub fn new(settings: AppSettings) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings.normalized()),
        }
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::new(AppSettings::default())
    }
}

impl SettingsProvider for MemorySettings {
    fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    fn update(&self, settings: AppSettings) -> SettingsResult<()> {
        self.settings.store(Arc::new(settings.normalized()));
        Ok(())
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_auto_save() -> bool {
    true
}
