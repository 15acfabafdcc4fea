//! Conversation state, tool calling and the model interface.

pub mod builtin;
mod conversation;
pub mod instructions;
mod llm;
mod message;
pub mod preprocess;
mod tool_loop;
mod tools;

pub use conversation::{Conversation, ConversationState};
pub use instructions::{ConstantInstructions, Instructions};
pub use llm::{LlmEvent, LlmStream};
pub use message::{ConversationMessage, Role, ToolCall};
pub use preprocess::{INTERRUPTION_CHAR, USER_SILENCE_MARKER, preprocess_messages};
pub use tool_loop::ToolLoopOutcome;
pub use tools::{Tool, ToolDefinition, ToolRegistry};
