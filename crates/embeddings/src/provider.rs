//! Concrete provider selection.

use std::sync::Arc;

use {
    moltis_config::{EmbeddingProviderKind, MoltisConfig},
    secrecy::Secret,
    tracing::debug,
};

use crate::{
    batch::{BatchFlavor, BatchOrchestrator, BatchRunner, BatchSettings},
    batch_gemini::GeminiBatchRunner,
    batch_openai::OpenAiBatchRunner,
    cache::CacheScope,
    embeddings::EmbeddingProvider,
    embeddings_gemini::GeminiEmbeddingProvider,
    embeddings_openai::OpenAiEmbeddingProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Local,
}

impl ProviderKind {
    pub fn id(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Local => "local",
        }
    }

    fn env_key(self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Local => None,
        }
    }
}

impl From<EmbeddingProviderKind> for ProviderKind {
    fn from(kind: EmbeddingProviderKind) -> Self {
        match kind {
            EmbeddingProviderKind::Openai => Self::OpenAi,
            EmbeddingProviderKind::Gemini => Self::Gemini,
            EmbeddingProviderKind::Local => Self::Local,
        }
    }
}

/// The embedding backend a service talks to, plus its batch runner when the
/// provider has a batch API. Local providers never batch.
#[derive(Clone)]
pub enum ProviderHandle {
    OpenAi {
        provider: Arc<dyn EmbeddingProvider>,
        batch: Option<Arc<dyn BatchRunner>>,
    },
    Gemini {
        provider: Arc<dyn EmbeddingProvider>,
        batch: Option<Arc<dyn BatchRunner>>,
    },
    Local {
        provider: Arc<dyn EmbeddingProvider>,
    },
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("kind", &self.kind())
            .field("model", &self.provider().model_name())
            .field("batch", &self.batch_runner().is_some())
            .finish()
    }
}

impl ProviderHandle {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::OpenAi { .. } => ProviderKind::OpenAi,
            Self::Gemini { .. } => ProviderKind::Gemini,
            Self::Local { .. } => ProviderKind::Local,
        }
    }

    pub fn id(&self) -> &'static str {
        self.kind().id()
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        match self {
            Self::OpenAi { provider, .. }
            | Self::Gemini { provider, .. }
            | Self::Local { provider } => provider,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }

    pub fn batch_runner(&self) -> Option<&Arc<dyn BatchRunner>> {
        match self {
            Self::OpenAi { batch, .. } | Self::Gemini { batch, .. } => batch.as_ref(),
            Self::Local { .. } => None,
        }
    }

    /// Cache key prefix for vectors produced by this provider.
    pub fn cache_scope(&self) -> CacheScope {
        let provider = self.provider();
        CacheScope {
            provider: self.id().to_string(),
            model: provider.model_name().to_string(),
            provider_key: provider.provider_key().to_string(),
        }
    }

    /// Orchestrator for the provider's batch API, if it has one.
    pub fn batch_orchestrator(&self, settings: BatchSettings) -> Option<BatchOrchestrator> {
        let runner = Arc::clone(self.batch_runner()?);
        let flavor = match self {
            Self::OpenAi { provider, .. } => BatchFlavor::OpenAi {
                model: provider.model_name().to_string(),
            },
            Self::Gemini { .. } => BatchFlavor::Gemini,
            Self::Local { .. } => return None,
        };
        Some(BatchOrchestrator::new(flavor, runner, settings))
    }
}

const LOCAL_NOT_RESOLVABLE: &str = "local embedding provider must be supplied by the caller";

/// Build the configured remote provider. API keys come from
/// `[providers.<name>].api_key`, falling back to the provider's env var.
pub fn resolve_provider(config: &MoltisConfig) -> anyhow::Result<ProviderHandle> {
    resolve_provider_with_env(config, |name| std::env::var(name).ok())
}

pub(crate) fn resolve_provider_with_env(
    config: &MoltisConfig,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ProviderHandle> {
    let kind = ProviderKind::from(config.memory.provider);
    let Some(env_key) = kind.env_key() else {
        anyhow::bail!(LOCAL_NOT_RESOLVABLE);
    };
    if !config.providers.is_enabled(kind.id()) {
        anyhow::bail!("embedding provider {} is disabled", kind.id());
    }
    let entry = config.providers.get(kind.id());
    let api_key = entry
        .and_then(|e| e.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| env(env_key))
        .ok_or_else(|| anyhow::anyhow!("no API key for {} embeddings (set {env_key})", kind.id()))?;
    let base_url = entry.and_then(|e| e.base_url.clone());
    let model = config
        .memory
        .model
        .clone()
        .or_else(|| entry.and_then(|e| e.model.clone()));

    let handle = match kind {
        ProviderKind::OpenAi => {
            let mut p = OpenAiEmbeddingProvider::new(Secret::new(api_key));
            if let Some(url) = base_url {
                p = p.with_base_url(url);
            }
            if let Some(model) = model {
                p = p.with_model(model);
            }
            let p = Arc::new(p);
            ProviderHandle::OpenAi {
                batch: Some(Arc::new(OpenAiBatchRunner::new(Arc::clone(&p)))),
                provider: p,
            }
        },
        ProviderKind::Gemini => {
            let mut p = GeminiEmbeddingProvider::new(Secret::new(api_key));
            if let Some(url) = base_url {
                p = p.with_base_url(url);
            }
            if let Some(model) = model {
                p = p.with_model(model);
            }
            let p = Arc::new(p);
            ProviderHandle::Gemini {
                batch: Some(Arc::new(GeminiBatchRunner::new(Arc::clone(&p)))),
                provider: p,
            }
        },
        ProviderKind::Local => anyhow::bail!(LOCAL_NOT_RESOLVABLE),
    };
    debug!(
        provider = handle.id(),
        model = handle.provider().model_name(),
        "resolved embedding provider"
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use {super::*, moltis_config::ProviderEntry};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn config(kind: EmbeddingProviderKind, entry: Option<ProviderEntry>) -> MoltisConfig {
        let mut cfg = MoltisConfig::default();
        cfg.memory.provider = kind;
        if let Some(entry) = entry {
            let name = ProviderKind::from(kind).id().to_string();
            cfg.providers.providers.insert(name, entry);
        }
        cfg
    }

    #[test]
    fn openai_from_config_entry() {
        let cfg = config(
            EmbeddingProviderKind::Openai,
            Some(ProviderEntry {
                api_key: Some("sk-cfg".into()),
                base_url: Some("http://proxy.local/".into()),
                model: Some("text-embedding-3-large".into()),
                ..Default::default()
            }),
        );
        let handle = resolve_provider_with_env(&cfg, no_env).unwrap();
        assert_eq!(handle.kind(), ProviderKind::OpenAi);
        assert!(!handle.is_local());
        assert!(handle.batch_runner().is_some());
        let scope = handle.cache_scope();
        assert_eq!(scope.provider, "openai");
        assert_eq!(scope.model, "text-embedding-3-large");
        assert_eq!(scope.provider_key.len(), 16);

        let Some(orch) = handle.batch_orchestrator(BatchSettings::default()) else {
            panic!("openai should batch");
        };
        assert_eq!(orch.provider_id(), "openai");
    }

    #[test]
    fn gemini_key_falls_back_to_env() {
        let cfg = config(EmbeddingProviderKind::Gemini, None);
        let handle = resolve_provider_with_env(&cfg, |name| {
            (name == "GEMINI_API_KEY").then(|| "g-env".to_string())
        })
        .unwrap();
        assert_eq!(handle.id(), "gemini");
        assert_eq!(handle.provider().model_name(), "gemini-embedding-001");
    }

    #[test]
    fn memory_model_overrides_provider_model() {
        let mut cfg = config(
            EmbeddingProviderKind::Openai,
            Some(ProviderEntry {
                api_key: Some("k".into()),
                model: Some("gpt-4o".into()),
                ..Default::default()
            }),
        );
        cfg.memory.model = Some("text-embedding-3-small".into());
        let handle = resolve_provider_with_env(&cfg, no_env).unwrap();
        assert_eq!(handle.provider().model_name(), "text-embedding-3-small");
    }

    #[test]
    fn missing_key_is_an_error() {
        let cfg = config(EmbeddingProviderKind::Openai, None);
        let err = resolve_provider_with_env(&cfg, no_env).unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn disabled_provider_is_rejected() {
        let cfg = config(
            EmbeddingProviderKind::Openai,
            Some(ProviderEntry {
                enabled: false,
                api_key: Some("k".into()),
                ..Default::default()
            }),
        );
        assert!(resolve_provider_with_env(&cfg, no_env).is_err());
    }

    #[test]
    fn local_must_be_supplied() {
        let cfg = config(EmbeddingProviderKind::Local, None);
        assert!(resolve_provider_with_env(&cfg, no_env).is_err());
    }
}
