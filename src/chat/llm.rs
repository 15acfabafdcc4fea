use futures::stream::BoxStream;

use super::message::{ConversationMessage, ToolCall};
use super::tools::ToolDefinition;
use crate::Result;

/// One item of a tool-capable completion stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    /// A text delta to forward to the user.
    Content(String),
    /// A complete batch of tool calls requested by the model.
    ToolCalls(Vec<ToolCall>),
}

/// A streaming chat-completion backend.
pub trait LlmStream: Send + Sync {
    /// Stream the text deltas of a plain completion.
    fn chat_completion(
        &self,
        messages: Vec<ConversationMessage>,
    ) -> BoxStream<'_, Result<String>>;

    /// Stream a completion that may request tools.
    fn chat_completion_with_tools(
        &self,
        messages: Vec<ConversationMessage>,
        tools: Vec<ToolDefinition>,
    ) -> BoxStream<'_, Result<LlmEvent>>;
}
