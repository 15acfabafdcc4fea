//! Normalizes the conversation before it is sent to a model.

use super::message::{ConversationMessage, Role};

/// Appended to an assistant message cut off by the user.
pub const INTERRUPTION_CHAR: char = '—';

/// Provisional user message inserted while the user stays silent.
pub const USER_SILENCE_MARKER: &str = "...";

const DUMMY_USER_MESSAGE: &str = "Hello.";

/// Prepare a message sequence for a chat-completion request.
///
/// Drops messages left empty by an interruption, merges consecutive messages
/// of the same role, keeps a user turn between the system prompt and the
/// first assistant turn, and strips a silence marker the user talked over.
/// Tool requests and tool results are kept as-is and never merged.
#[must_use]
pub fn preprocess_messages(messages: &[ConversationMessage]) -> Vec<ConversationMessage> {
    let mut output: Vec<ConversationMessage> = Vec::with_capacity(messages.len() + 1);

    for message in messages {
        if !message.is_tool_exchange() && message.content.replace(INTERRUPTION_CHAR, "").is_empty()
        {
            continue;
        }

        match output.last_mut() {
            Some(last)
                if last.role == message.role
                    && !last.is_tool_exchange()
                    && !message.is_tool_exchange() =>
            {
                last.content.push(' ');
                last.content.push_str(&message.content);
            }
            _ => output.push(message.clone()),
        }
    }

    let role_at = |i: usize, output: &[ConversationMessage]| output.get(i).map(|m| m.role);
    if role_at(0, &output) == Some(Role::System)
        && matches!(role_at(1, &output), None | Some(Role::Assistant))
    {
        output.insert(1, ConversationMessage::user(DUMMY_USER_MESSAGE));
    }

    for message in &mut output {
        if message.role == Role::User
            && message.content != USER_SILENCE_MARKER
            && message.content.starts_with(USER_SILENCE_MARKER)
        {
            message.content.drain(..USER_SILENCE_MARKER.len());
        }
    }

    output
}
