use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use helm_core::context::LlmContext;
use helm_core::errors::{GatewayError, ProviderError};
use helm_core::ids::ToolCallId;
use helm_core::messages::{FinishReason, ToolCall};
use helm_core::models::SelectedModel;
use helm_core::provider::{EventStream, LlmProvider, ProviderFactory, StreamOptions};
use helm_core::stream::StreamEvent;
use helm_core::usage::{Pricing, TokenUsage};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of StreamEvents.
    Stream(Vec<StreamEvent>),
    /// Return an error from the stream() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A plain text answer.
    pub fn stream_text(text: &str) -> Self {
        Self::stream_text_with_usage(text, TokenUsage::default())
    }

    pub fn stream_text_with_usage(text: &str, usage: TokenUsage) -> Self {
        Self::Stream(vec![
            StreamEvent::Start,
            StreamEvent::TextDelta {
                delta: text.to_string(),
            },
            StreamEvent::Done {
                finish_reason: FinishReason::EndTurn,
                usage,
            },
        ])
    }

    /// A turn that requests the given tool calls.
    pub fn tool_calls(calls: Vec<(&str, Value)>) -> Self {
        Self::tool_calls_with_usage(calls, TokenUsage::default())
    }

    pub fn tool_calls_with_usage(calls: Vec<(&str, Value)>, usage: TokenUsage) -> Self {
        let mut events = vec![StreamEvent::Start];
        for (name, input) in calls {
            let id = ToolCallId::new();
            events.push(StreamEvent::ToolCallStart {
                tool_call_id: id.clone(),
                name: name.to_string(),
            });
            events.push(StreamEvent::ToolCallDelta {
                tool_call_id: id.clone(),
                arguments_delta: input.to_string(),
            });
            events.push(StreamEvent::ToolCallEnd {
                tool_call: ToolCall {
                    id,
                    name: name.to_string(),
                    input,
                },
            });
        }
        events.push(StreamEvent::Done {
            finish_reason: FinishReason::ToolUse,
            usage,
        });
        Self::Stream(events)
    }

    /// A stream that ends with an error event.
    pub fn stream_error(error: GatewayError) -> Self {
        Self::Stream(vec![StreamEvent::Start, StreamEvent::Error { error }])
    }

    /// `stream()` fails with a provider error.
    pub fn provider_error(status: u16, message: &str) -> Self {
        Self::Error(GatewayError::Provider(ProviderError::new(status, message)))
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence. Once the
/// script runs out it repeats the fallback, or fails when there is none.
pub struct MockProvider {
    name: String,
    model: String,
    pricing: Pricing,
    responses: Mutex<VecDeque<MockResponse>>,
    fallback: Option<MockResponse>,
    call_count: AtomicUsize,
    contexts: Mutex<Vec<LlmContext>>,
    options: Mutex<Vec<StreamOptions>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            name: "mock".into(),
            model: "mock-model".into(),
            pricing: Pricing::default(),
            responses: Mutex::new(responses.into()),
            fallback: None,
            call_count: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, name: &str, model: &str) -> Self {
        self.name = name.to_string();
        self.model = model.to_string();
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_fallback(mut self, response: MockResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    /// Append to the script.
    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Every context passed to `stream()`, in call order.
    pub fn contexts(&self) -> Vec<LlmContext> {
        self.contexts.lock().clone()
    }

    pub fn options(&self) -> Vec<StreamOptions> {
        self.options.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn pricing(&self) -> Pricing {
        self.pricing
    }

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(context.clone());
        self.options.lock().push(options.clone());

        let next = self.responses.lock().pop_front();
        let response = match next.or_else(|| self.fallback.clone()) {
            Some(r) => r,
            None => {
                return Err(GatewayError::Misconfigured(format!(
                    "MockProvider: no response configured for call {idx}"
                )))
            }
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
async fn resolve_response(response: MockResponse) -> Result<EventStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

/// Factory handing out pre-built mocks keyed by model name.
#[derive(Default)]
pub struct MockProviderFactory {
    providers: Mutex<HashMap<String, Arc<MockProvider>>>,
    builds: AtomicUsize,
}

impl MockProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, model: &str, provider: Arc<MockProvider>) {
        self.providers.lock().insert(model.to_string(), provider);
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ProviderFactory for MockProviderFactory {
    fn build(&self, model: &SelectedModel) -> Result<Arc<dyn LlmProvider>, GatewayError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.providers
            .lock()
            .get(&model.model)
            .cloned()
            .map(|p| p as Arc<dyn LlmProvider>)
            .ok_or_else(|| GatewayError::Misconfigured(format!("no mock registered for {model}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    async fn collect(stream: EventStream) -> Vec<StreamEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn text_response() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("hello world")]);
        let stream = mock
            .stream(&LlmContext::default(), &StreamOptions::default())
            .await
            .unwrap();
        let events = collect(stream).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "hello world"));
        assert!(matches!(
            events[2],
            StreamEvent::Done { finish_reason: FinishReason::EndTurn, .. }
        ));
    }

    #[tokio::test]
    async fn tool_call_response_has_matching_ids() {
        let mock = MockProvider::new(vec![MockResponse::tool_calls(vec![
            ("glob", json!({"pattern": "*"})),
            ("ls", json!({})),
        ])]);
        let stream = mock
            .stream(&LlmContext::default(), &StreamOptions::default())
            .await
            .unwrap();
        let ends: Vec<ToolCall> = collect(stream)
            .await
            .into_iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallEnd { tool_call } => Some(tool_call),
                _ => None,
            })
            .collect();
        assert_eq!(ends.len(), 2);
        assert_ne!(ends[0].id, ends[1].id);
        assert_eq!(ends[0].name, "glob");
    }

    #[tokio::test]
    async fn exhausted_without_fallback_errors() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("only one")]);
        let ctx = LlmContext::default();
        let _ = mock.stream(&ctx, &StreamOptions::default()).await;
        let result = mock.stream(&ctx, &StreamOptions::default()).await;
        assert!(matches!(result, Err(GatewayError::Misconfigured(_))));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn fallback_repeats() {
        let mock = MockProvider::new(vec![MockResponse::provider_error(400, "bad")])
            .with_fallback(MockResponse::stream_text("ok"));
        let ctx = LlmContext::default();
        assert!(mock.stream(&ctx, &StreamOptions::default()).await.is_err());
        for _ in 0..3 {
            assert!(mock.stream(&ctx, &StreamOptions::default()).await.is_ok());
        }
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test]
    async fn captures_context_and_options() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("x")]);
        let ctx = LlmContext::new("be brief");
        let opts = StreamOptions {
            temperature: Some(0.3),
            ..Default::default()
        };
        let _ = mock.stream(&ctx, &opts).await.unwrap();
        assert_eq!(mock.contexts()[0].system_prompt, "be brief");
        assert_eq!(mock.options()[0].temperature, Some(0.3));
    }

    #[tokio::test]
    async fn delayed_error() {
        tokio::time::pause();
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(20),
            MockResponse::provider_error(429, "slow down"),
        )]);
        let result = mock
            .stream(&LlmContext::default(), &StreamOptions::default())
            .await;
        match result {
            Err(GatewayError::Provider(pe)) => assert_eq!(pe.status_code, 429),
            Err(other) => panic!("expected provider error, got: {other:?}"),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn factory_looks_up_by_model() {
        let factory = MockProviderFactory::new();
        factory.register("small", Arc::new(MockProvider::new(vec![]).with_model("mock", "small")));
        let p = factory.build(&SelectedModel::new("mock", "small")).unwrap();
        assert_eq!(p.model(), "small");
        assert!(factory.build(&SelectedModel::new("mock", "other")).is_err());
        assert_eq!(factory.build_count(), 2);
    }
}
