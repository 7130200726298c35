use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tracing::debug;

use helm_core::errors::GatewayError;
use helm_core::models::SelectedModel;
use helm_core::provider::{LlmProvider, ProviderFactory};
use helm_settings::{ProviderSettings, RetrySettings};

use crate::openai::{OpenAiConfig, OpenAiProvider};
use crate::reliable::{ReliableConfig, ReliableProvider};

/// Builds OpenAI-compatible providers wrapped in retry and circuit breaking.
pub struct DefaultProviderFactory {
    provider: ProviderSettings,
    retry: ReliableConfig,
    api_key: Option<SecretString>,
}

impl DefaultProviderFactory {
    /// Reads the API key from the env var named in `provider.api_key_env`.
    pub fn new(provider: ProviderSettings, retry: &RetrySettings) -> Self {
        let api_key = std::env::var(&provider.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);
        Self {
            provider,
            retry: ReliableConfig::from(retry),
            api_key,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    fn config_for(&self, model: &SelectedModel) -> Result<OpenAiConfig, GatewayError> {
        if model.model.trim().is_empty() {
            return Err(GatewayError::Misconfigured("empty model name".into()));
        }
        if self.api_key.is_none() {
            return Err(GatewayError::Misconfigured(format!(
                "{} is not set",
                self.provider.api_key_env
            )));
        }
        Ok(OpenAiConfig {
            provider_name: model.provider.clone(),
            base_url: self.provider.base_url.clone(),
            model: model.model.clone(),
            api_key: self.api_key.clone(),
            request_timeout: Duration::from_millis(self.provider.request_timeout_ms),
            idle_timeout: Duration::from_millis(self.provider.idle_timeout_ms),
        })
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn build(&self, model: &SelectedModel) -> Result<Arc<dyn LlmProvider>, GatewayError> {
        let config = self.config_for(model)?;
        debug!(provider = %model.provider, model = %model.model, "building provider");
        let inner = OpenAiProvider::new(config)?;
        Ok(Arc::new(ReliableProvider::new(inner, self.retry.clone())))
    }
}
