use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use super::provider::ProviderKind;

pub const DEFAULT_OLLAMA_MODEL: &str = "gemma3:4b";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";
pub const MODEL_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// A model the user can pick for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub label: Option<String>,
    pub accepts_images: bool,
    pub emits_reasoning: bool,
}

impl Model {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            accepts_images: false,
            emits_reasoning: false,
        }
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_images(mut self) -> Self {
        self.accepts_images = true;
        self
    }

    pub fn with_reasoning(mut self) -> Self {
        self.emits_reasoning = true;
        self
    }

    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// Where a catalog came from, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogOrigin {
    Live,
    Cached,
    StaleCache,
    BuiltIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub origin: CatalogOrigin,
    /// Why a degraded origin was used.
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn new(models: Vec<Model>, origin: CatalogOrigin) -> Self {
        Self {
            models,
            origin,
            warning: None,
        }
    }

    pub fn degraded(models: Vec<Model>, origin: CatalogOrigin, warning: impl Into<String>) -> Self {
        Self {
            models,
            origin,
            warning: Some(warning.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.origin, CatalogOrigin::StaleCache | CatalogOrigin::BuiltIn)
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.iter().map(|model| model.id.clone()).collect()
    }
}

/// Result of a [`ModelCache`] lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Fresh(Vec<Model>),
    Stale(Vec<Model>),
    Miss,
}

/// Model lists keyed by provider endpoint, shared across client rebuilds.
pub struct ModelCache {
    ttl: Duration,
    lists: RwLock<HashMap<String, (Instant, Vec<Model>)>>,
}

impl ModelCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            lists: RwLock::default(),
        }
    }

    pub async fn lookup(&self, key: &str) -> CacheLookup {
        match self.lists.read().await.get(key) {
            Some((stored_at, models)) if stored_at.elapsed() < self.ttl => {
                CacheLookup::Fresh(models.clone())
            }
            Some((_, models)) => CacheLookup::Stale(models.clone()),
            None => CacheLookup::Miss,
        }
    }

    pub async fn store(&self, key: &str, models: &[Model]) {
        self.lists
            .write()
            .await
            .insert(key.to_string(), (Instant::now(), models.to_vec()));
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(MODEL_CACHE_TTL)
    }
}

pub fn default_model_for(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Ollama => DEFAULT_OLLAMA_MODEL,
        ProviderKind::OpenAiCompatible => DEFAULT_GROQ_MODEL,
    }
}

/// Built-in list used when neither the provider nor the cache can answer.
pub fn fallback_models_for(kind: ProviderKind) -> Vec<Model> {
    match kind {
        ProviderKind::Ollama => vec![
            Model::new(DEFAULT_OLLAMA_MODEL).labelled("Gemma 3 4B").with_images(),
            Model::new("llama3.2:3b").labelled("Llama 3.2 3B"),
            Model::new("qwen3:8b").labelled("Qwen 3 8B").with_reasoning(),
        ],
        ProviderKind::OpenAiCompatible => vec![
            Model::new(DEFAULT_GROQ_MODEL).labelled("Llama 3.3 70B"),
            Model::new("llama-3.1-8b-instant").labelled("Llama 3.1 8B Instant"),
            Model::new("meta-llama/llama-4-scout-17b-16e-instruct")
                .labelled("Llama 4 Scout")
                .with_images(),
            Model::new("qwen/qwen3-32b").labelled("Qwen 3 32B").with_reasoning(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cached_list_goes_stale_after_ttl() {
        let cache = ModelCache::new(Duration::from_secs(10));
        assert_eq!(cache.lookup("ollama").await, CacheLookup::Miss);

        cache.store("ollama", &[Model::new("m1")]).await;
        assert_eq!(
            cache.lookup("ollama").await,
            CacheLookup::Fresh(vec![Model::new("m1")])
        );

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            cache.lookup("ollama").await,
            CacheLookup::Stale(vec![Model::new("m1")])
        );
        assert_eq!(cache.lookup("openai").await, CacheLookup::Miss);
    }

    #[test]
    fn built_in_lists_contain_provider_default() {
        for kind in [ProviderKind::Ollama, ProviderKind::OpenAiCompatible] {
            let models = fallback_models_for(kind);
            let catalog = ModelCatalog::degraded(models, CatalogOrigin::BuiltIn, "offline");
            assert!(catalog.is_degraded());
            assert!(catalog.model_ids().iter().any(|id| id == default_model_for(kind)));
        }
    }

    #[test]
    fn display_name_prefers_label() {
        assert_eq!(Model::new("qwen3:8b").display_name(), "qwen3:8b");
        assert_eq!(Model::new("qwen3:8b").labelled("Qwen").display_name(), "Qwen");
    }
}
