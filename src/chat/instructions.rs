/// Produces the system prompt for a conversation.
///
/// `make_system_prompt` may be non-deterministic; callers evaluate it once and keep the result.
pub trait Instructions: Send + Sync {
    fn make_system_prompt(&self) -> String;
}

impl<F> Instructions for F
where
    F: Fn() -> String + Send + Sync,
{
    fn make_system_prompt(&self) -> String {
        self()
    }
}

const DEFAULT_PROMPT: &str = "\
You are a friendly voice assistant having a spoken conversation. \
Your answers are read aloud, so keep them short and conversational, \
and never use lists, markdown, emoji or text in brackets. \
If the user says \"...\", they have been silent for a while: \
check in briefly or continue where you left off. \
A reply of yours ending in \"—\" was interrupted by the user.";

/// A fixed prompt, defaulting to the built-in voice assistant prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantInstructions {
    text: String,
}

impl ConstantInstructions {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Default for ConstantInstructions {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT)
    }
}

impl Instructions for ConstantInstructions {
    fn make_system_prompt(&self) -> String {
        self.text.clone()
    }
}
