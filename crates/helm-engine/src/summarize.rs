//! Context-overflow recovery: condense a session's history with the small
//! model so the run can resume from the summary.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use helm_core::context::LlmContext;
use helm_core::errors::GatewayError;
use helm_core::ids::SessionId;
use helm_core::messages::{ContentPart, Message, Role};
use helm_core::provider::{LlmProvider, StreamOptions};
use helm_core::stream::StreamEvent;
use helm_core::tool_params::Todo;
use helm_core::usage::TokenUsage;

const SUMMARY_SYSTEM_PROMPT: &str = "You are summarizing a coding-assistant conversation that \
became too long to continue. Write a dense summary another assistant can resume from. Keep the \
user's goal, decisions made, files and paths touched, tool findings that still matter, open \
problems and the next concrete step. Do not invent details.";

/// Tool output beyond this many characters is elided from the transcript.
const MAX_TOOL_RESULT_CHARS: usize = 2000;

/// The user message that restarts a run after its history was summarized.
pub fn resume_prompt(original_prompt: &str) -> String {
    format!(
        "The previous session was interrupted because it got too long, the initial user request was: `{original_prompt}`"
    )
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}... [{} chars omitted]", &text[..idx], text[idx..].chars().count()),
        None => text.to_string(),
    }
}

/// Render `history` and the session's todo list as a plain transcript.
pub fn build_summary_prompt(history: &[Message], todos: &[Todo]) -> String {
    let mut out = String::from("Summarize the following conversation.\n\n<transcript>\n");
    for message in history {
        let label = match (message.role, message.is_summary_message) {
            (_, true) => "summary",
            (Role::User, _) => "user",
            (Role::Assistant, _) => "assistant",
            (Role::Tool, _) => "tool",
            (Role::System, _) => "system",
        };
        for part in &message.parts {
            match part {
                ContentPart::Text { text } if !text.trim().is_empty() => {
                    out.push_str(&format!("[{label}] {text}\n"));
                }
                ContentPart::ToolCall(call) => {
                    out.push_str(&format!("[{label}] called {}({})\n", call.name, call.input));
                }
                ContentPart::ToolResult(result) => {
                    let status = if result.is_error { "error" } else { "ok" };
                    out.push_str(&format!(
                        "[{label}] {} -> {status}: {}\n",
                        result.name,
                        clip(&result.content, MAX_TOOL_RESULT_CHARS)
                    ));
                }
                _ => {}
            }
        }
    }
    out.push_str("</transcript>\n");

    if !todos.is_empty() {
        out.push_str("\n<todos>\n");
        for todo in todos {
            out.push_str(&format!("- [{}] {}\n", todo.status.as_str(), todo.content));
        }
        out.push_str("</todos>\n");
    }
    out
}

/// Ask `provider` for a summary of `prompt`. No tools are offered.
pub async fn summarize(
    provider: &dyn LlmProvider,
    session_id: &SessionId,
    prompt: String,
    options: &StreamOptions,
    cancel: &CancellationToken,
) -> Result<(String, TokenUsage), GatewayError> {
    let mut context = LlmContext::new(SUMMARY_SYSTEM_PROMPT);
    context
        .messages
        .push(Message::user_text(session_id.clone(), prompt));

    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        s = provider.stream(&context, options) => s?,
    };

    let mut summary = String::new();
    let mut usage = TokenUsage::default();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            e = stream.next() => e,
        };
        match event {
            Some(StreamEvent::TextDelta { delta }) => summary.push_str(&delta),
            Some(StreamEvent::Done { usage: u, .. }) => usage = u,
            Some(StreamEvent::Error { error }) => return Err(error),
            Some(_) => {}
            None => break,
        }
    }

    if summary.trim().is_empty() {
        return Err(GatewayError::StreamInterrupted("summary was empty".into()));
    }
    Ok((summary, usage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::ids::ToolCallId;
    use helm_core::messages::{ToolCall, ToolResult};
    use helm_core::tool_params::TodoStatus;
    use helm_llm::mock::{MockProvider, MockResponse};
    use serde_json::json;

    #[test]
    fn transcript_includes_calls_results_and_todos() {
        let sid = SessionId::new();
        let call = ToolCall {
            id: ToolCallId::new(),
            name: "ls".into(),
            input: json!({"path": "src"}),
        };
        let mut assistant = Message::assistant(sid.clone(), "mock", "m");
        assistant.append_text_delta("checking");
        assistant.push_tool_call(call.clone());
        let history = vec![
            Message::user_text(sid.clone(), "list the sources"),
            assistant,
            Message::tool_results(sid, vec![ToolResult::ok(&call, "main.rs")]),
        ];
        let todos = vec![Todo {
            content: "read main".into(),
            status: TodoStatus::InProgress,
        }];

        let prompt = build_summary_prompt(&history, &todos);
        assert!(prompt.contains("[user] list the sources"));
        assert!(prompt.contains(r#"called ls({"path":"src"})"#));
        assert!(prompt.contains("ls -> ok: main.rs"));
        assert!(prompt.contains("- [in_progress] read main"));
    }

    #[test]
    fn long_tool_output_is_clipped() {
        let long = "x".repeat(MAX_TOOL_RESULT_CHARS + 10);
        let clipped = clip(&long, MAX_TOOL_RESULT_CHARS);
        assert!(clipped.ends_with("[10 chars omitted]"));
        assert_eq!(clip("short", 10), "short");
    }

    #[test]
    fn resume_prompt_quotes_request() {
        assert_eq!(
            resume_prompt("fix it"),
            "The previous session was interrupted because it got too long, the initial user request was: `fix it`"
        );
    }

    #[tokio::test]
    async fn collects_streamed_summary() {
        let provider = MockProvider::new(vec![MockResponse::stream_text("short version")]);
        let (summary, _) = summarize(
            &provider,
            &SessionId::new(),
            "transcript".into(),
            &StreamOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary, "short version");
        assert!(provider.contexts()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn stream_error_fails_summary() {
        let provider = MockProvider::new(vec![MockResponse::stream_error(
            GatewayError::Network("reset".into()),
        )]);
        let err = summarize(
            &provider,
            &SessionId::new(),
            "t".into(),
            &StreamOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
    }
}
