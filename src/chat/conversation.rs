use std::fmt;

use tokio::sync::mpsc;

use super::instructions::{ConstantInstructions, Instructions};
use super::llm::LlmStream;
use super::message::{ConversationMessage, Role};
use super::preprocess::{INTERRUPTION_CHAR, preprocess_messages};
use super::tool_loop::{ToolLoopOutcome, run_turn};
use super::tools::ToolRegistry;
use crate::Result;
use crate::config::ToolLoopConfig;

const GREETING_PROMPT: &str = "Hello!";

/// Who holds the floor, derived from the last message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    WaitingForUser,
    UserSpeaking,
    BotSpeaking,
}

/// The chat history of one voice conversation.
///
/// The first message is always the system prompt. Messages are only ever
/// appended, except that the last one grows while it is being streamed.
pub struct Conversation {
    history: Vec<ConversationMessage>,
    instructions: Option<Box<dyn Instructions>>,
    tools_enabled: bool,
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("history", &self.history)
            .field("has_instructions", &self.instructions.is_some())
            .field("tools_enabled", &self.tools_enabled)
            .finish()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    /// Start a conversation with the default system prompt.
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: vec![ConversationMessage::system(
                ConstantInstructions::default().make_system_prompt(),
            )],
            instructions: None,
            tools_enabled: false,
        }
    }

    #[must_use]
    pub fn conversation_state(&self) -> ConversationState {
        let Some(last) = self.history.last() else {
            return ConversationState::WaitingForUser;
        };
        match last.role {
            Role::Assistant => ConversationState::BotSpeaking,
            Role::User if !last.content.trim().is_empty() => ConversationState::UserSpeaking,
            Role::User | Role::System | Role::Tool => ConversationState::WaitingForUser,
        }
    }

    /// Append a streamed delta, starting a new message when the role changes.
    ///
    /// `expected_index` is the history length the producer saw when it started;
    /// a mismatch means someone else has since started a message, and the delta
    /// is dropped. Returns whether this call started a new message.
    pub fn add_delta(&mut self, delta: &str, role: Role, expected_index: Option<usize>) -> bool {
        if expected_index.is_some_and(|expected| expected != self.history.len()) {
            tracing::warn!(
                %role,
                expected = ?expected_index,
                actual = self.history.len(),
                "Dropping stale delta {delta:?}"
            );
            return false;
        }

        let last = match self.history.last_mut() {
            Some(last) if last.role == role => last,
            _ => {
                self.history.push(ConversationMessage::new(role, delta));
                return true;
            }
        };

        let was_empty = last.content.is_empty();
        let needs_space_left = last.content.chars().last().is_some_and(|c| !c.is_whitespace());
        let needs_space_right = delta.chars().next().is_some_and(|c| !c.is_whitespace());
        if needs_space_left && needs_space_right {
            last.content.push(' ');
        }
        last.content.push_str(delta);
        was_empty && !delta.is_empty()
    }

    /// Replace the system prompt. The prompt is computed exactly once per call.
    pub fn set_instructions(&mut self, instructions: impl Instructions + 'static) {
        let prompt = instructions.make_system_prompt();
        tracing::debug!(chars = prompt.len(), "System prompt updated");
        self.history[0] = ConversationMessage::system(prompt);
        self.instructions = Some(Box::new(instructions));
    }

    /// The instructions last passed to [`Self::set_instructions`], if any.
    #[must_use]
    pub fn instructions(&self) -> Option<&dyn Instructions> {
        self.instructions.as_deref()
    }

    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.history[0].content
    }

    /// The history as it should be sent to the model.
    #[must_use]
    pub fn preprocessed_messages(&self) -> Vec<ConversationMessage> {
        if self.history.len() > 2 {
            preprocess_messages(&self.history)
        } else {
            preprocess_messages(&[
                self.history[0].clone(),
                ConversationMessage::user(GREETING_PROMPT),
            ])
        }
    }

    /// Content of the most recent non-blank message from `role`.
    #[must_use]
    pub fn last_message(&self, role: Role) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == role && !m.content.trim().is_empty())
            .map(|m| m.content.as_str())
    }

    #[must_use]
    pub fn messages(&self) -> &[ConversationMessage] {
        &self.history
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Always false: the system prompt is never removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn enable_tools(&mut self) {
        self.tools_enabled = true;
    }

    #[must_use]
    pub const fn tools_enabled(&self) -> bool {
        self.tools_enabled
    }

    /// Mark the bot's current turn as cut off by the user.
    pub fn mark_interrupted(&mut self) {
        if let Some(last) = self.history.last_mut() {
            if last.role == Role::Assistant && !last.is_tool_exchange() {
                last.content.push(INTERRUPTION_CHAR);
            }
        }
    }

    /// Append model output verbatim; model deltas already carry their own spacing.
    pub(crate) fn extend_reply(&mut self, delta: &str) {
        match self.history.last_mut() {
            Some(last) if last.role == Role::Assistant && !last.is_tool_exchange() => {
                last.content.push_str(delta);
            }
            _ => self.history.push(ConversationMessage::assistant(delta)),
        }
    }

    pub(crate) fn push(&mut self, message: ConversationMessage) {
        self.history.push(message);
    }

    /// Generate the assistant's reply, streaming its text to `output`.
    ///
    /// With tools enabled the model may call tools from `registry` for up to
    /// `config.max_rounds` rounds. The reply and any tool exchange are recorded
    /// in the history. Dropping the receiving end of `output` interrupts the turn.
    ///
    /// # Errors
    /// Returns an error if the model backend fails.
    pub async fn respond(
        &mut self,
        llm: &dyn LlmStream,
        registry: &ToolRegistry,
        config: ToolLoopConfig,
        output: &mpsc::Sender<String>,
    ) -> Result<ToolLoopOutcome> {
        run_turn(self, llm, registry, config, output).await
    }
}
