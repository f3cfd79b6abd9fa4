use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, LlmConfig, ProviderEntry};
use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::llm::provider::LlmProvider;
use crate::llm::providers::openai_compatible::OpenAiCompatibleProvider;
use crate::llm::types::CallConfig;

/// Registry of usable LLM providers, keyed by their config.toml identifier.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    active: String,
    /// Kept for role-to-model lookups.
    llm_config: LlmConfig,
}

impl ProviderRegistry {
    pub fn new(active: String) -> Self {
        Self {
            providers: HashMap::new(),
            active,
            llm_config: LlmConfig::default(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn get_active(&self) -> DeskPilotResult<Arc<dyn LlmProvider>> {
        self.providers.get(&self.active).cloned().ok_or_else(|| {
            DeskPilotError::Config(format!(
                "Active provider '{}' not found in registry",
                self.active
            ))
        })
    }

    /// Provider and call configuration for a named role.
    ///
    /// Resolution order:
    /// 1. `[llm.roles.<role>]` in config.toml
    /// 2. the active provider with its default model and temperature
    pub fn call_config_for_role(
        &self,
        role: &str,
    ) -> DeskPilotResult<(Arc<dyn LlmProvider>, CallConfig)> {
        let role_entry = match role {
            "planning" => self.llm_config.roles.planning.as_ref(),
            other => {
                tracing::warn!(role = other, "unknown role, falling back to active provider");
                None
            }
        };

        if let Some(entry) = role_entry {
            let provider = self.providers.get(&entry.provider).cloned().ok_or_else(|| {
                DeskPilotError::Config(format!(
                    "Role '{}' references unknown or unusable provider '{}'",
                    role, entry.provider
                ))
            })?;
            let temperature = entry.temperature.unwrap_or_else(|| {
                self.llm_config
                    .providers
                    .get(&entry.provider)
                    .map(|p| p.temperature)
                    .unwrap_or(0.1)
            });
            tracing::debug!(
                role,
                provider = %entry.provider,
                model = %entry.model,
                temperature,
                "resolved role config"
            );
            return Ok((
                provider,
                CallConfig {
                    model: entry.model.clone(),
                    temperature,
                },
            ));
        }

        let provider = self.get_active()?;
        let (model, temperature) = self
            .llm_config
            .providers
            .get(&self.active)
            .map(|p| (p.model.clone(), p.temperature))
            .unwrap_or_else(|| (String::new(), 0.1));
        tracing::debug!(
            role,
            provider = %self.active,
            model = %model,
            "role not configured, using active provider"
        );
        Ok((provider, CallConfig { model, temperature }))
    }

    /// Builds a registry from config. Remote providers without a key are skipped.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self {
            providers: HashMap::new(),
            active: config.llm.active_provider.clone(),
            llm_config: config.llm.clone(),
        };
        let timeout = Duration::from_secs(config.llm.request_timeout_secs);
        for (id, entry) in &config.llm.providers {
            let api_key = resolve_api_key(id, entry);
            if api_key.is_empty() && !is_local_endpoint(&entry.api_base) {
                tracing::debug!(provider = %id, "no API key; provider not registered");
                continue;
            }
            let provider =
                OpenAiCompatibleProvider::new(id.clone(), entry.api_base.clone(), api_key, timeout);
            registry.register(Arc::new(provider));
        }
        tracing::info!(providers = registry.providers.len(), active = %registry.active, "LLM registry ready");
        registry
    }
}

/// `DESKPILOT_<ID>_API_KEY`, then the config entry, then `OPENAI_API_KEY`.
pub fn resolve_api_key(id: &str, entry: &ProviderEntry) -> String {
    let env_name = format!(
        "DESKPILOT_{}_API_KEY",
        id.to_uppercase().replace(['-', '.'], "_")
    );
    std::env::var(env_name)
        .ok()
        .filter(|k| !k.is_empty())
        .or_else(|| entry.api_key.clone().filter(|k| !k.is_empty()))
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_default()
}

fn is_local_endpoint(url: &str) -> bool {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    rest.starts_with("localhost") || rest.starts_with("127.0.0.1") || rest.starts_with("[::1]")
}
