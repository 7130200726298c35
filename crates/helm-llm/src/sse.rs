//! Parser for OpenAI-compatible chat-completions SSE streams.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use helm_core::errors::{GatewayError, ProviderError};
use helm_core::ids::ToolCallId;
use helm_core::messages::{FinishReason, ToolCall};
use helm_core::stream::StreamEvent;
use helm_core::usage::TokenUsage;

/// State machine turning chunk payloads into [`StreamEvent`]s.
#[derive(Default)]
pub struct SseParser {
    started: bool,
    finished: bool,
    /// Tool calls keyed by the provider's `index`, so output order is stable.
    tool_slots: BTreeMap<u32, ToolSlot>,
    finish_reason: Option<String>,
    usage: TokenUsage,
}

#[derive(Default)]
struct ToolSlot {
    id: String,
    name: String,
    arguments_json: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True once any choice reported a finish reason.
    pub fn saw_finish_reason(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Parse one `data:` payload.
    pub fn parse_data(&mut self, data: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        if data.trim() == "[DONE]" {
            return self.finish();
        }

        let mut events = Vec::new();
        let chunk: Chunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                self.finished = true;
                events.push(StreamEvent::Error {
                    error: GatewayError::StreamInterrupted(format!("malformed chunk: {e}")),
                });
                return events;
            }
        };

        if let Some(err) = chunk.error {
            self.finished = true;
            events.push(StreamEvent::Error {
                error: GatewayError::Provider(ProviderError::new(err.status(), err.message)),
            });
            return events;
        }

        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start);
        }

        if let Some(usage) = chunk.usage {
            let cached = usage
                .prompt_tokens_details
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0);
            self.usage = TokenUsage {
                input_tokens: usage.prompt_tokens.saturating_sub(cached),
                output_tokens: usage.completion_tokens,
                cache_read_tokens: cached,
                cache_creation_tokens: 0,
            };
        }

        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning_content.or(delta.reasoning) {
                if !reasoning.is_empty() {
                    events.push(StreamEvent::ReasoningDelta { delta: reasoning });
                }
            }
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    events.push(StreamEvent::TextDelta { delta: content });
                }
            }
            for tc in delta.tool_calls {
                let slot = self.tool_slots.entry(tc.index).or_default();
                if let Some(id) = tc.id {
                    slot.id = id;
                }
                if let Some(f) = tc.function {
                    if let Some(name) = f.name {
                        slot.name = name;
                        events.push(StreamEvent::ToolCallStart {
                            tool_call_id: ToolCallId::from_raw(&slot.id),
                            name: slot.name.clone(),
                        });
                    }
                    if let Some(args) = f.arguments {
                        if !args.is_empty() {
                            slot.arguments_json.push_str(&args);
                            events.push(StreamEvent::ToolCallDelta {
                                tool_call_id: ToolCallId::from_raw(&slot.id),
                                arguments_delta: args,
                            });
                        }
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }

        events
    }

    /// Emit the closing tool-call and `Done` events. Idempotent.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        if !self.started {
            events.push(StreamEvent::Start);
        }
        let has_tools = !self.tool_slots.is_empty();
        for slot in std::mem::take(&mut self.tool_slots).into_values() {
            let input = if slot.arguments_json.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&slot.arguments_json)
                    .unwrap_or(Value::String(slot.arguments_json.clone()))
            };
            let id = if slot.id.is_empty() {
                ToolCallId::new()
            } else {
                ToolCallId::from_raw(slot.id)
            };
            events.push(StreamEvent::ToolCallEnd {
                tool_call: ToolCall {
                    id,
                    name: slot.name,
                    input,
                },
            });
        }

        let finish_reason = match self.finish_reason.as_deref() {
            _ if has_tools => FinishReason::ToolUse,
            Some("length") => FinishReason::MaxTokens,
            _ => FinishReason::EndTurn,
        };
        events.push(StreamEvent::Done {
            finish_reason,
            usage: self.usage,
        });
        events
    }
}

/// Split a buffer of complete SSE blocks into their `data:` payloads.
/// Multi-line data fields are joined with `\n`. Comments and other fields
/// are ignored.
pub fn parse_sse_lines(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        if line.is_empty() {
            if let Some(data) = current.take() {
                payloads.push(data);
            }
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            match &mut current {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(data);
                }
                None => current = Some(data.to_string()),
            }
        }
    }

    if let Some(data) = current {
        payloads.push(data);
    }
    payloads
}

// --- Deserialization types for chat-completion chunks ---

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<UsagePayload>,
    error: Option<ErrorPayload>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct Delta {
    content: Option<String>,
    reasoning_content: Option<String>,
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    prompt_tokens_details: Option<PromptDetails>,
}

#[derive(Deserialize)]
struct PromptDetails {
    cached_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
    code: Option<Value>,
}

impl ErrorPayload {
    /// In-stream errors carry the HTTP status as a numeric `code` on some
    /// routers and a string code on others.
    fn status(&self) -> u16 {
        self.code
            .as_ref()
            .and_then(|c| c.as_u64())
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(parser: &mut SseParser, payloads: &[&str]) -> Vec<StreamEvent> {
        payloads.iter().flat_map(|p| parser.parse_data(p)).collect()
    }

    #[test]
    fn parse_simple_text_stream() {
        let mut parser = SseParser::new();
        let events = run(
            &mut parser,
            &[
                r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
                r#"{"choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
                r#"{"choices":[],"usage":{"prompt_tokens":120,"completion_tokens":7,"prompt_tokens_details":{"cached_tokens":20}}}"#,
                "[DONE]",
            ],
        );
        assert!(matches!(events[0], StreamEvent::Start));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::TextDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
        match events.last().unwrap() {
            StreamEvent::Done { finish_reason, usage } => {
                assert_eq!(*finish_reason, FinishReason::EndTurn);
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.cache_read_tokens, 20);
                assert_eq!(usage.output_tokens, 7);
            }
            other => panic!("expected Done, got {other:?}"),
        }
        assert!(parser.is_finished());
    }

    #[test]
    fn parallel_tool_calls_assembled_by_index() {
        let mut parser = SseParser::new();
        let events = run(
            &mut parser,
            &[
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"glob","arguments":""}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"ls","arguments":"{}"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"pattern\":"}}]}}]}"#,
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"*.rs\"}"}}]},"finish_reason":"tool_calls"}]}"#,
                "[DONE]",
            ],
        );
        let calls: Vec<&ToolCall> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallEnd { tool_call } => Some(tool_call),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id.as_str(), "call_a");
        assert_eq!(calls[0].input["pattern"], "*.rs");
        assert_eq!(calls[1].id.as_str(), "call_b");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done { finish_reason: FinishReason::ToolUse, .. })
        ));
    }

    #[test]
    fn in_stream_error_carries_status() {
        let mut parser = SseParser::new();
        let events = parser.parse_data(
            r#"{"error":{"message":"This model's maximum context length is 8192 tokens","code":400}}"#,
        );
        match &events[0] {
            StreamEvent::Error { error: GatewayError::Provider(pe) } => {
                assert_eq!(pe.status_code, 400);
                assert!(pe.message.contains("maximum context length"));
            }
            other => panic!("expected provider error, got {other:?}"),
        }
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn reasoning_deltas() {
        let mut parser = SseParser::new();
        let events = parser.parse_data(r#"{"choices":[{"delta":{"reasoning_content":"hmm"}}]}"#);
        assert!(matches!(&events[1], StreamEvent::ReasoningDelta { delta } if delta == "hmm"));
    }

    #[test]
    fn finish_without_done_marker() {
        let mut parser = SseParser::new();
        let _ = parser.parse_data(r#"{"choices":[{"delta":{"content":"x"},"finish_reason":"length"}]}"#);
        let events = parser.finish();
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done { finish_reason: FinishReason::MaxTokens, .. })
        ));
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn malformed_chunk_is_stream_error() {
        let mut parser = SseParser::new();
        let events = parser.parse_data("{not json");
        assert!(matches!(
            &events[0],
            StreamEvent::Error { error: GatewayError::StreamInterrupted(_) }
        ));
    }

    #[test]
    fn sse_lines_split_blocks() {
        let raw = ": keep-alive\n\ndata: {\"a\":1}\n\ndata:[DONE]\n\n";
        assert_eq!(parse_sse_lines(raw), vec![r#"{"a":1}"#.to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn sse_lines_multi_data() {
        let raw = "data: one\ndata: two\n\n";
        assert_eq!(parse_sse_lines(raw), vec!["one\ntwo".to_string()]);
    }
}
