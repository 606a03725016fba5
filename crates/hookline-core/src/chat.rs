//! Role-tagged messages and the chat model contract consumed by chat nodes.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::CallContext;
use crate::errors::{ConstructionError, NodeError};
use crate::node::{Flow, Invoke, InvokeStream};
use crate::payload::{Frame, Payload};
use crate::stream::StreamReader;
use crate::tool::ToolInfo;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool messages: the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// Merge streamed message deltas into one message. All chunks must share a role; a tool call
/// id seen twice keeps the latest arguments.
pub fn concat_messages(chunks: Vec<Message>) -> Result<Message, NodeError> {
    let mut chunks = chunks.into_iter();
    let Some(mut merged) = chunks.next() else {
        return Err(NodeError::invalid_input("no message chunks to concatenate"));
    };
    for chunk in chunks {
        if chunk.role != merged.role {
            return Err(NodeError::invalid_input(format!(
                "cannot merge {:?} chunk into {:?} message",
                chunk.role, merged.role
            )));
        }
        merged.content.push_str(&chunk.content);
        for call in chunk.tool_calls {
            match merged.tool_calls.iter_mut().find(|c| c.id == call.id) {
                Some(existing) => *existing = call,
                None => merged.tool_calls.push(call),
            }
        }
        if merged.tool_call_id.is_none() {
            merged.tool_call_id = chunk.tool_call_id;
        }
    }
    Ok(merged)
}

/// Model backend contract. `stream` yields frames whose payload is a single assistant delta.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(&self, ctx: &CallContext, messages: &[Message]) -> Result<Message, NodeError>;

    /// Make `tools` available to later calls. Backends without function calling keep the
    /// default, which refuses.
    fn bind_tools(&mut self, tools: &[ToolInfo]) -> Result<(), ConstructionError> {
        let _ = tools;
        Err(ConstructionError::ToolsUnsupported {
            node: String::new(),
        })
    }

    /// Defaults to a one-frame stream around [`generate`](ChatModel::generate).
    async fn stream(
        &self,
        ctx: &CallContext,
        messages: &[Message],
    ) -> Result<StreamReader<Frame>, NodeError> {
        let reply = self.generate(ctx, messages).await?;
        Ok(StreamReader::once(Frame::new(Payload::messages(vec![reply]))))
    }
}

/// Node adapter over a [`ChatModel`].
///
/// Scalar use returns the conversation with the reply appended, so tool nodes and later
/// model calls see the whole history. Streaming use returns only the reply deltas.
pub(crate) struct ChatNode {
    pub(crate) model: Arc<dyn ChatModel>,
}

#[async_trait]
impl Invoke for ChatNode {
    async fn invoke(&self, ctx: &CallContext, input: Flow) -> Result<Payload, NodeError> {
        let mut messages = input.into_payload().await?.into_messages()?;
        let reply = self.model.generate(ctx, &messages).await?;
        messages.push(reply);
        Ok(Payload::messages(messages))
    }
}

#[async_trait]
impl InvokeStream for ChatNode {
    async fn stream(&self, ctx: &CallContext, input: Flow) -> Result<StreamReader<Frame>, NodeError> {
        let messages = input.into_payload().await?.into_messages()?;
        self.model.stream(ctx, &messages).await
    }
}
