use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use pin_project_lite::pin_project;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use helm_core::context::LlmContext;
use helm_core::errors::GatewayError;
use helm_core::provider::{EventStream, LlmProvider, StreamOptions};
use helm_core::stream::StreamEvent;
use helm_core::usage::Pricing;

use crate::converter;
use crate::models;
use crate::sse::{self, SseParser};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Name reported by the provider (`openai`, `openrouter`, ...).
    pub provider_name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Streams chat completions from any endpoint speaking the OpenAI wire
/// format.
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
    pricing: Pricing,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Misconfigured(format!("http client: {e}")))?;
        let pricing = models::pricing_for(&config.model);
        Ok(Self {
            client,
            config,
            pricing,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

/// Pull `error.message` out of a JSON error body, or return the body as is.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.provider_name
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn pricing(&self) -> Pricing {
        self.pricing
    }

    #[instrument(skip(self, context, options), fields(provider = %self.config.provider_name, model = %self.config.model))]
    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, GatewayError> {
        let body = converter::build_request_body(context, options, &self.config.model);
        let mut req = self
            .client
            .post(self.endpoint())
            .header("accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.config.request_timeout)
            } else {
                GatewayError::Network(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            debug!(status, "provider returned error status");
            return Err(GatewayError::from_status(status, error_message(&body)));
        }

        Ok(Box::pin(SseStream::new(
            resp.bytes_stream(),
            self.config.idle_timeout,
        )))
    }
}

pin_project! {
    /// Wraps a byte stream and yields StreamEvents. If no bytes arrive within
    /// the idle window the stream ends with an error.
    struct SseStream<S> {
        #[pin]
        inner: S,
        #[pin]
        idle_deadline: tokio::time::Sleep,
        idle_duration: Duration,
        parser: SseParser,
        buffer: String,
        pending: VecDeque<StreamEvent>,
        done: bool,
    }
}

impl<S> SseStream<S> {
    fn new(inner: S, idle_duration: Duration) -> Self {
        let idle_duration = if idle_duration.is_zero() {
            DEFAULT_IDLE_TIMEOUT
        } else {
            idle_duration
        };
        Self {
            inner,
            idle_deadline: tokio::time::sleep(idle_duration),
            idle_duration,
            parser: SseParser::new(),
            buffer: String::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + *this.idle_duration;
                    this.idle_deadline.as_mut().reset(deadline);

                    this.buffer
                        .push_str(&String::from_utf8_lossy(&bytes).replace("\r\n", "\n"));
                    while let Some(pos) = this.buffer.find("\n\n") {
                        let block: String = this.buffer.drain(..pos + 2).collect();
                        for data in sse::parse_sse_lines(&block) {
                            this.pending.extend(this.parser.parse_data(&data));
                        }
                    }
                    if this.parser.is_finished() {
                        *this.done = true;
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.done = true;
                    return Poll::Ready(Some(StreamEvent::Error {
                        error: GatewayError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    let rest = std::mem::take(this.buffer);
                    for data in sse::parse_sse_lines(&rest) {
                        this.pending.extend(this.parser.parse_data(&data));
                    }
                    if !this.parser.is_finished() {
                        if this.parser.saw_finish_reason() {
                            this.pending.extend(this.parser.finish());
                        } else {
                            this.pending.push_back(StreamEvent::Error {
                                error: GatewayError::StreamInterrupted(
                                    "stream ended before completion".into(),
                                ),
                            });
                        }
                    }
                }
                Poll::Pending => {
                    if this.idle_deadline.as_mut().poll(cx).is_ready() {
                        *this.done = true;
                        return Poll::Ready(Some(StreamEvent::Error {
                            error: GatewayError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                this.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use helm_core::messages::FinishReason;

    type Chunk = Result<bytes::Bytes, std::io::Error>;

    fn config() -> OpenAiConfig {
        OpenAiConfig {
            provider_name: "openai".into(),
            base_url: "http://localhost:1/v1/".into(),
            model: "gpt-4o".into(),
            api_key: Some(SecretString::from("test-key".to_string())),
            request_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn provider_properties() {
        let provider = OpenAiProvider::new(config()).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.model(), "gpt-4o");
        assert_eq!(provider.endpoint(), "http://localhost:1/v1/chat/completions");
        assert!(provider.pricing().input_per_mtok > 0.0);
    }

    #[test]
    fn error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error":{"message":"prompt is too long","type":"invalid_request_error"}}"#),
            "prompt is too long"
        );
        assert_eq!(error_message("plain body"), "plain body");
    }

    #[tokio::test]
    async fn sse_stream_assembles_events_across_chunks() {
        let chunks: Vec<Chunk> = vec![
            Ok(bytes::Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"He")),
            Ok(bytes::Bytes::from("llo\"}}]}\r\n\r\ndata: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n")),
            Ok(bytes::Bytes::from("data: [DONE]\n\n")),
        ];
        let stream = SseStream::new(futures::stream::iter(chunks), Duration::from_secs(5));
        let events: Vec<StreamEvent> = Box::pin(stream).collect().await;
        assert!(matches!(events[0], StreamEvent::Start));
        assert!(matches!(&events[1], StreamEvent::TextDelta { delta } if delta == "Hello"));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done { finish_reason: FinishReason::EndTurn, .. })
        ));
    }

    #[tokio::test]
    async fn sse_stream_truncated_is_error() {
        let chunks: Vec<Chunk> = vec![Ok(bytes::Bytes::from(
            "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
        ))];
        let stream = SseStream::new(futures::stream::iter(chunks), Duration::from_secs(5));
        let events: Vec<StreamEvent> = Box::pin(stream).collect().await;
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { error: GatewayError::StreamInterrupted(_) })
        ));
    }

    #[tokio::test]
    async fn sse_stream_idle_timeout_fires_when_no_data() {
        tokio::time::pause();
        let stream = SseStream::new(futures::stream::pending::<Chunk>(), Duration::from_secs(5));
        let mut stream = Box::pin(stream);

        tokio::time::advance(Duration::from_secs(6)).await;

        let event = stream.next().await;
        assert!(
            matches!(&event, Some(StreamEvent::Error { error: GatewayError::StreamInterrupted(msg) }) if msg.contains("idle timeout")),
            "expected idle timeout error, got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn sse_stream_idle_timeout_resets_on_data() {
        tokio::time::pause();
        let (tx, rx) = tokio::sync::mpsc::channel::<Chunk>(16);
        let rx_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut stream = Box::pin(SseStream::new(rx_stream, Duration::from_secs(5)));

        tx.send(Ok(bytes::Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n")))
            .await
            .unwrap();
        assert!(matches!(stream.next().await, Some(StreamEvent::Start)));
        assert!(matches!(stream.next().await, Some(StreamEvent::TextDelta { .. })));

        tokio::time::advance(Duration::from_secs(4)).await;
        tx.send(Ok(bytes::Bytes::from("data: [DONE]\n\n"))).await.unwrap();
        assert!(matches!(stream.next().await, Some(StreamEvent::Done { .. })));
        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
