//! OpenAI-compatible chat client with native tool calling.
//!
//! One client covers every model endpoint the system talks to — the base URL
//! and key come from configuration, so a self-hosted gateway works the same
//! as the hosted API.
//!
//! Conversations are modeled as [`ChatTurn`]s: an enum keyed by who produced
//! the turn, rather than a mirror of the wire's role-string messages. The
//! wire shape (nested `function` objects, stringified arguments, nullable
//! content) exists only at the serialization boundary.

pub mod agent;

pub use agent::{Agent, AgentConfig, AgentRun, ToolDef, TraceEvent};

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;

// ── Conversation model ────────────────────────────────────────────────────────

/// One turn of a conversation, keyed by who produced it.
#[derive(Debug, Clone)]
pub enum ChatTurn {
    System(String),
    User(String),
    /// Model output: text, tool invocations, or both.
    Assistant {
        text: String,
        calls: Vec<ToolInvocation>,
    },
    /// The result of one tool invocation, correlated by call id.
    ToolOutput {
        call_id: String,
        body: String,
    },
}

impl ChatTurn {
    /// Plain assistant text with no tool activity, for replayed history.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        ChatTurn::Assistant { text: text.into(), calls: Vec::new() }
    }
}

/// A tool invocation requested by the model, flattened from the wire's
/// nested `function` object. `arguments` is always a parsed value; the
/// wire's JSON-in-a-string form never leaves this crate.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Token accounting reported by the API for one request.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

/// What came back from one chat request.
#[derive(Debug, Clone)]
pub struct ChatReply {
    /// Assistant text (may be empty when the model only invoked tools).
    pub text: String,
    pub calls: Vec<ToolInvocation>,
    /// "stop", "tool_calls", "length", ...
    pub finish_reason: String,
    pub usage: Usage,
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl LlmClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn request_body(
        &self,
        model: &str,
        turns: &[ChatTurn],
        tools: Option<&Value>,
        options: &ChatOptions,
        stream: bool,
    ) -> Value {
        let mut payload = json!({
            "model": model,
            "messages": turns.iter().map(turn_to_wire).collect::<Vec<_>>(),
        });
        if let Some(tools) = tools {
            payload["tools"] = tools.clone();
        }
        if let Some(t) = options.temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(m) = options.max_tokens {
            payload["max_tokens"] = json!(m);
        }
        if stream {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({ "include_usage": true });
        }
        payload
    }

    /// Non-streaming chat with optional tool definitions.
    pub async fn chat(
        &self,
        model: &str,
        turns: &[ChatTurn],
        tools: Option<&Value>,
        options: &ChatOptions,
    ) -> Result<ChatReply> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(model, turns, tools, options, false))
            .send()
            .await
            .context("chat request failed")?;

        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            bail!("chat endpoint returned {status}: {body}");
        }
        parse_reply(&body)
    }

    /// Streaming chat. Text pieces go out through `tx` as they arrive; tool
    /// invocations assemble across frames and come back in the final reply.
    pub async fn chat_stream(
        &self,
        model: &str,
        turns: &[ChatTurn],
        tools: Option<&Value>,
        options: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatReply> {
        let mut response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(model, turns, tools, options, true))
            .send()
            .await
            .context("chat stream request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await?;
            bail!("chat endpoint returned {status}: {body}");
        }

        let mut frames = SseFrames::default();
        let mut reply = StreamingReply::default();
        while let Some(chunk) = response.chunk().await? {
            for payload in frames.push(&chunk) {
                let Ok(frame) = serde_json::from_str::<Value>(&payload) else {
                    continue;
                };
                if let Some(piece) = reply.absorb(&frame) {
                    let _ = tx.send(piece).await;
                }
            }
        }
        Ok(reply.finish())
    }
}

// ── Streaming assembly ────────────────────────────────────────────────────────

/// Splits raw SSE bytes into complete `data:` payloads. Frames routinely
/// straddle chunk boundaries, so the splitter keeps the unfinished tail.
#[derive(Default)]
struct SseFrames {
    pending: String,
}

impl SseFrames {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if !data.is_empty() && data != "[DONE]" {
                payloads.push(data.to_string());
            }
        }
        payloads
    }
}

/// A tool invocation under assembly: the id and name land in the first delta
/// for their slot, the argument string accretes over many.
#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed frames into a [`ChatReply`]. Slots are positional:
/// the wire indexes tool-call deltas, so partial calls live in a Vec grown
/// on demand rather than a keyed map.
#[derive(Default)]
struct StreamingReply {
    text: String,
    partial_calls: Vec<PartialCall>,
    finish_reason: Option<String>,
    usage: Usage,
}

impl StreamingReply {
    /// Fold one frame in. Returns the text piece to forward, when the frame
    /// carried one.
    fn absorb(&mut self, frame: &Value) -> Option<String> {
        if let Some(usage) = frame.get("usage").filter(|u| !u.is_null()) {
            if let Ok(parsed) = serde_json::from_value(usage.clone()) {
                self.usage = parsed;
            }
        }

        // The usage-only final frame has an empty choices array.
        let choice = frame.get("choices")?.get(0)?;
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }

        let delta = choice.get("delta")?;
        for part in delta["tool_calls"].as_array().into_iter().flatten() {
            let slot_index = part["index"].as_u64().unwrap_or(0) as usize;
            if self.partial_calls.len() <= slot_index {
                self.partial_calls
                    .resize_with(slot_index + 1, PartialCall::default);
            }
            let slot = &mut self.partial_calls[slot_index];
            if let Some(id) = part["id"].as_str() {
                slot.id = id.to_string();
            }
            if let Some(name) = part["function"]["name"].as_str() {
                slot.name = name.to_string();
            }
            if let Some(args) = part["function"]["arguments"].as_str() {
                slot.arguments.push_str(args);
            }
        }

        let piece = delta["content"].as_str().filter(|c| !c.is_empty())?;
        self.text.push_str(piece);
        Some(piece.to_string())
    }

    fn finish(self) -> ChatReply {
        let calls: Vec<ToolInvocation> = self
            .partial_calls
            .into_iter()
            .enumerate()
            .filter(|(_, partial)| !partial.name.is_empty())
            .map(|(slot, partial)| ToolInvocation {
                id: if partial.id.is_empty() {
                    format!("tool-{slot}")
                } else {
                    partial.id
                },
                name: partial.name,
                arguments: serde_json::from_str(&partial.arguments)
                    .unwrap_or(Value::Null),
            })
            .collect();

        let finish_reason = self.finish_reason.unwrap_or_else(|| {
            if calls.is_empty() { "stop" } else { "tool_calls" }.to_string()
        });

        ChatReply {
            text: self.text,
            calls,
            finish_reason,
            usage: self.usage,
        }
    }
}

// ── Wire conversion ───────────────────────────────────────────────────────────

fn turn_to_wire(turn: &ChatTurn) -> Value {
    match turn {
        ChatTurn::System(text) => json!({ "role": "system", "content": text }),
        ChatTurn::User(text) => json!({ "role": "user", "content": text }),
        ChatTurn::Assistant { text, calls } => {
            let content = if text.is_empty() && !calls.is_empty() {
                Value::Null
            } else {
                json!(text)
            };
            let mut message = json!({ "role": "assistant", "content": content });
            if !calls.is_empty() {
                message["tool_calls"] =
                    json!(calls.iter().map(invocation_to_wire).collect::<Vec<_>>());
            }
            message
        }
        ChatTurn::ToolOutput { call_id, body } => json!({
            "role": "tool",
            "tool_call_id": call_id,
            "content": body,
        }),
    }
}

fn invocation_to_wire(call: &ToolInvocation) -> Value {
    json!({
        "id": call.id,
        "type": "function",
        "function": {
            "name": call.name,
            // The wire wants arguments as an embedded JSON string.
            "arguments": call.arguments.to_string(),
        }
    })
}

fn invocation_from_wire(slot: usize, wire: &Value) -> Option<ToolInvocation> {
    let name = wire["function"]["name"].as_str()?.to_string();
    let arguments = match &wire["function"]["arguments"] {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
        other => other.clone(),
    };
    let id = match wire["id"].as_str() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("tool-{slot}"),
    };
    Some(ToolInvocation { id, name, arguments })
}

fn parse_reply(body: &Value) -> Result<ChatReply> {
    let choice = &body["choices"][0];
    let message = &choice["message"];

    let calls = message["tool_calls"]
        .as_array()
        .map(|wire_calls| {
            wire_calls
                .iter()
                .enumerate()
                .filter_map(|(slot, wire)| invocation_from_wire(slot, wire))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(ChatReply {
        text: message["content"].as_str().unwrap_or("").to_string(),
        calls,
        finish_reason: choice["finish_reason"].as_str().unwrap_or("stop").to_string(),
        usage: body
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok())
            .unwrap_or_default(),
    })
}

// ── Structured output ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    /// The reply contained neither a fenced block nor a bare JSON object.
    #[error("reply carries no JSON payload")]
    NoPayload,
    /// A payload was found but did not deserialize into the expected shape.
    /// Carries the serde error so callers can log what was wrong.
    #[error("json payload does not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),
}

/// Pull a structured payload out of a model reply.
///
/// A fenced ```json block is authoritative when present — a malformed fence
/// is a [`OutputError::Shape`] error, not a reason to scan further. Without
/// a fence, the first *balanced* `{...}` object in the reply is taken, so
/// prose around (or after) the payload does not corrupt it.
///
/// The dreaming pipeline keys its logging off the error: `NoPayload` means
/// the agent ignored its output instructions, `Shape` means it produced the
/// wrong fields.
pub fn structured_output<T: DeserializeOwned>(reply: &str) -> Result<T, OutputError> {
    let candidate = fenced_block(reply)
        .or_else(|| balanced_object(reply))
        .ok_or(OutputError::NoPayload)?;
    Ok(serde_json::from_str(candidate)?)
}

fn fenced_block(reply: &str) -> Option<&str> {
    let start = reply.find("```json")? + "```json".len();
    let rest = &reply[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// Find the first balanced top-level JSON object, honoring string literals
/// and escapes so braces inside values do not throw the depth count off.
fn balanced_object(reply: &str) -> Option<&str> {
    let open = reply.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in reply[open..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&reply[open..open + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_serialize_to_their_wire_roles() {
        assert_eq!(turn_to_wire(&ChatTurn::System("s".into()))["role"], "system");
        assert_eq!(turn_to_wire(&ChatTurn::User("u".into()))["role"], "user");

        let tool = turn_to_wire(&ChatTurn::ToolOutput {
            call_id: "tool-0".into(),
            body: "ok".into(),
        });
        assert_eq!(tool["role"], "tool");
        assert_eq!(tool["tool_call_id"], "tool-0");
    }

    #[test]
    fn assistant_with_calls_nulls_empty_content_and_stringifies_arguments() {
        let wire = turn_to_wire(&ChatTurn::Assistant {
            text: String::new(),
            calls: vec![ToolInvocation {
                id: "tool-0".into(),
                name: "search".into(),
                arguments: json!({"query": "x"}),
            }],
        });
        assert!(wire["content"].is_null());
        let args = &wire["tool_calls"][0]["function"]["arguments"];
        assert!(args.is_string());
        assert!(args.as_str().unwrap().contains("query"));
    }

    #[test]
    fn parse_reply_flattens_tool_calls_and_reads_usage() {
        let body = json!({
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "",
                        "function": {"name": "lookup", "arguments": "{\"key\": \"a\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let reply = parse_reply(&body).unwrap();
        assert_eq!(reply.finish_reason, "tool_calls");
        assert_eq!(reply.calls.len(), 1);
        assert_eq!(reply.calls[0].name, "lookup");
        assert_eq!(reply.calls[0].arguments["key"], "a");
        // Missing wire id falls back to a positional one.
        assert_eq!(reply.calls[0].id, "tool-0");
        assert_eq!(reply.usage.total_tokens, 15);
    }

    #[test]
    fn sse_frames_survive_chunk_boundaries() {
        let mut frames = SseFrames::default();
        // One frame split across three chunks, then a [DONE] marker.
        assert!(frames.push(b"data: {\"a\"").is_empty());
        assert!(frames.push(b": 1}").is_empty());
        let out = frames.push(b"\ndata: [DONE]\n");
        assert_eq!(out, vec![r#"{"a": 1}"#.to_string()]);
    }

    #[test]
    fn sse_frames_ignore_comments_and_blank_lines() {
        let mut frames = SseFrames::default();
        let out = frames.push(b": keepalive\n\ndata: {\"b\": 2}\n");
        assert_eq!(out, vec![r#"{"b": 2}"#.to_string()]);
    }

    #[test]
    fn streaming_reply_assembles_text_and_calls() {
        let mut reply = StreamingReply::default();

        let piece = reply.absorb(&json!({
            "choices": [{"delta": {"content": "hel"}}]
        }));
        assert_eq!(piece.as_deref(), Some("hel"));
        reply.absorb(&json!({ "choices": [{"delta": {"content": "lo"}}] }));

        // Tool-call deltas: name first, arguments accrete.
        reply.absorb(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call-a", "function": {"name": "search", "arguments": "{\"q\":"}}
            ]}}]
        }));
        reply.absorb(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": " \"x\"}"}}
            ]}}]
        }));
        // Usage-only final frame: no choices content.
        reply.absorb(&json!({
            "choices": [],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
        }));

        let done = reply.finish();
        assert_eq!(done.text, "hello");
        assert_eq!(done.calls.len(), 1);
        assert_eq!(done.calls[0].arguments["q"], "x");
        assert_eq!(done.finish_reason, "tool_calls");
        assert_eq!(done.usage.total_tokens, 7);
    }

    #[test]
    fn streaming_reply_drops_nameless_slots() {
        let mut reply = StreamingReply::default();
        // An argument delta for a slot that never received a name.
        reply.absorb(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 2, "function": {"arguments": "{}"}}
            ]}}]
        }));
        assert!(reply.finish().calls.is_empty());
    }

    // ── structured_output ──────────────────────────────────────────────────

    #[derive(Debug, serde::Deserialize)]
    struct Probe {
        action: String,
    }

    #[test]
    fn fenced_block_wins_over_surrounding_objects() {
        let raw = "Bare: {\"action\":\"wrong\"}\n```json\n{\"action\":\"right\"}\n```";
        let probe: Probe = structured_output(raw).unwrap();
        assert_eq!(probe.action, "right");
    }

    #[test]
    fn balanced_scan_stops_at_the_first_complete_object() {
        // Trailing prose with stray braces must not bleed into the payload.
        let raw = r#"Here: {"action":"a"} and also {"action":"b"}"#;
        let probe: Probe = structured_output(raw).unwrap();
        assert_eq!(probe.action, "a");
    }

    #[test]
    fn braces_inside_string_values_do_not_confuse_the_scan() {
        let raw = r#"{"action":"run {x} now"} trailing"#;
        let probe: Probe = structured_output(raw).unwrap();
        assert_eq!(probe.action, "run {x} now");
    }

    #[test]
    fn missing_payload_and_wrong_shape_are_distinct_errors() {
        assert!(matches!(
            structured_output::<Probe>("plain prose, no json"),
            Err(OutputError::NoPayload)
        ));
        assert!(matches!(
            structured_output::<Probe>(""),
            Err(OutputError::NoPayload)
        ));
        // Valid JSON, wrong fields.
        assert!(matches!(
            structured_output::<Probe>(r#"{"other": 1}"#),
            Err(OutputError::Shape(_))
        ));
        // A malformed fence is authoritative — no fallback scan.
        assert!(matches!(
            structured_output::<Probe>("```json\n{broken\n```"),
            Err(OutputError::Shape(_))
        ));
    }
}
