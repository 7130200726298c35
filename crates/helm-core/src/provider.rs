use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::context::LlmContext;
use crate::errors::GatewayError;
use crate::models::SelectedModel;
use crate::provider_options::ProviderOptions;
use crate::stream::StreamEvent;
use crate::usage::Pricing;

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Options controlling generation for one call.
#[derive(Clone, Debug, Default)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub provider_options: Option<ProviderOptions>,
}

/// Trait implemented by each model provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    fn pricing(&self) -> Pricing {
        Pricing::default()
    }

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError>;
}

/// Builds providers for a model selection. Used when models are swapped at
/// runtime and when sub-agents pick their own model.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, model: &SelectedModel) -> Result<Arc<dyn LlmProvider>, GatewayError>;
}
