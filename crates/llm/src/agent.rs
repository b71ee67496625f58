//! A bounded agent loop over the chat client.
//!
//! The loop alternates model calls and tool executions until the model stops
//! requesting tools, the request limit is hit, or the token budget runs out.
//! Every exchange is recorded in the trace so callers can persist the full
//! run (the dreaming handler stores it as session messages).

use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{ChatOptions, ChatTurn, LlmClient, ToolInvocation};

type ToolHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync,
>;

/// One callable tool: JSON-schema description plus an async handler.
#[derive(Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    handler: ToolHandler,
}

impl ToolDef {
    pub fn new<F, Fut>(name: &str, description: &str, parameters: Value, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    fn wire_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub instructions: String,
    /// Hard cap on model calls per run.
    pub request_limit: u32,
    /// Hard cap on cumulative API tokens per run.
    pub token_limit: i64,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// One entry in the run trace, in execution order.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    User { content: String },
    Assistant { content: String, calls: Vec<ToolInvocation> },
    ToolResult { name: String, call_id: String, content: String },
}

#[derive(Debug)]
pub struct AgentRun {
    /// The model's final text output.
    pub output: String,
    pub trace: Vec<TraceEvent>,
    /// Actual API token usage summed over all requests.
    pub total_tokens: i64,
    pub requests: u32,
}

pub struct Agent {
    client: LlmClient,
    config: AgentConfig,
    tools: Vec<ToolDef>,
}

impl Agent {
    pub fn new(client: LlmClient, config: AgentConfig) -> Self {
        Self { client, config, tools: Vec::new() }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools = tools;
        self
    }

    pub async fn run(&self, prompt: &str) -> Result<AgentRun> {
        let mut turns = vec![
            ChatTurn::System(self.config.instructions.clone()),
            ChatTurn::User(prompt.to_string()),
        ];
        let mut trace = vec![TraceEvent::User { content: prompt.to_string() }];
        let mut total_tokens: i64 = 0;
        let mut requests: u32 = 0;
        let mut output = String::new();

        let tool_schemas = if self.tools.is_empty() {
            None
        } else {
            Some(json!(self.tools.iter().map(ToolDef::wire_schema).collect::<Vec<_>>()))
        };
        let options = ChatOptions {
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
        };

        loop {
            if requests >= self.config.request_limit {
                warn!(requests, "agent hit request limit");
                break;
            }
            if total_tokens >= self.config.token_limit {
                warn!(total_tokens, "agent hit token limit");
                break;
            }

            let reply = self
                .client
                .chat(&self.config.model, &turns, tool_schemas.as_ref(), &options)
                .await?;
            requests += 1;
            total_tokens += reply.usage.total_tokens;

            trace.push(TraceEvent::Assistant {
                content: reply.text.clone(),
                calls: reply.calls.clone(),
            });

            if reply.calls.is_empty() {
                output = reply.text;
                break;
            }

            turns.push(ChatTurn::Assistant {
                text: reply.text,
                calls: reply.calls.clone(),
            });
            for call in &reply.calls {
                let result = self.execute_tool(call).await;
                let body = match result {
                    Ok(value) => value.to_string(),
                    Err(e) => json!({ "error": e.to_string() }).to_string(),
                };
                debug!(tool = %call.name, "tool executed");
                trace.push(TraceEvent::ToolResult {
                    name: call.name.clone(),
                    call_id: call.id.clone(),
                    content: body.clone(),
                });
                turns.push(ChatTurn::ToolOutput { call_id: call.id.clone(), body });
            }
        }

        Ok(AgentRun { output, trace, total_tokens, requests })
    }

    async fn execute_tool(&self, call: &ToolInvocation) -> Result<Value> {
        let Some(tool) = self.tools.iter().find(|t| t.name == call.name) else {
            anyhow::bail!("unknown tool: {}", call.name);
        };
        (tool.handler)(call.arguments.clone()).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_wire_schema_shape() {
        let tool = ToolDef::new(
            "search",
            "Search the knowledge base",
            json!({"type": "object", "properties": {"query": {"type": "string"}}}),
            |_args| async { Ok(json!([])) },
        );
        let schema = tool.wire_schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "search");
        assert!(schema["function"]["parameters"].is_object());
    }

    #[tokio::test]
    async fn tool_handlers_execute() {
        let tool = ToolDef::new("echo", "Echo args", json!({"type": "object"}), |args| async move {
            Ok(json!({ "echoed": args }))
        });
        let result = (tool.handler)(json!({"x": 1})).await.unwrap();
        assert_eq!(result["echoed"]["x"], 1);
    }
}
