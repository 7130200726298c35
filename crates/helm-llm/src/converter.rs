use serde_json::{json, Value};

use helm_core::context::LlmContext;
use helm_core::messages::{ContentPart, Message, Role};
use helm_core::provider::StreamOptions;
use helm_core::provider_options::ProviderOptions;

/// Convert an LlmContext into a chat-completions request body.
pub fn build_request_body(context: &LlmContext, options: &StreamOptions, model: &str) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "stream_options": {"include_usage": true},
    });

    if let Some(max) = options.max_tokens {
        body["max_tokens"] = json!(max);
    }
    if let Some(temp) = options.temperature {
        body["temperature"] = json!(temp);
    }
    if let Some(p) = options.frequency_penalty {
        body["frequency_penalty"] = json!(p);
    }
    if let Some(p) = options.presence_penalty {
        body["presence_penalty"] = json!(p);
    }

    let mut messages = Vec::new();
    if !context.system_prompt.is_empty() {
        messages.push(json!({"role": "system", "content": context.system_prompt}));
    }
    messages.extend(context.messages.iter().flat_map(convert_message));
    body["messages"] = json!(messages);

    if !context.tools.is_empty() {
        let tools: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    match &options.provider_options {
        Some(ProviderOptions::OpenAi(o)) => {
            if let Some(effort) = o.reasoning_effort {
                body["reasoning_effort"] = json!(effort);
            }
            if let Some(parallel) = o.parallel_tool_calls {
                if !context.tools.is_empty() {
                    body["parallel_tool_calls"] = json!(parallel);
                }
            }
        }
        Some(ProviderOptions::OpenRouter(o)) => {
            if !o.provider_order.is_empty() {
                body["provider"] = json!({"order": o.provider_order});
            }
            if !o.transforms.is_empty() {
                body["transforms"] = json!(o.transforms);
            }
        }
        None => {}
    }

    body
}

/// One stored message can expand to several wire messages: every tool
/// result is its own `tool` message.
fn convert_message(msg: &Message) -> Vec<Value> {
    match msg.role {
        Role::System => vec![json!({"role": "system", "content": msg.text_content()})],
        Role::User => vec![json!({"role": "user", "content": msg.text_content()})],
        Role::Assistant => {
            let text = msg.text_content();
            let tool_calls: Vec<Value> = msg
                .tool_calls()
                .into_iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.input.to_string(),
                        }
                    })
                })
                .collect();
            let content = if text.is_empty() { Value::Null } else { json!(text) };
            let mut entry = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                entry["tool_calls"] = json!(tool_calls);
            }
            vec![entry]
        }
        Role::Tool => msg
            .parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult(tr) => Some(json!({
                    "role": "tool",
                    "tool_call_id": tr.tool_call_id,
                    "content": tr.content,
                })),
                _ => None,
            })
            .collect(),
    }
}
