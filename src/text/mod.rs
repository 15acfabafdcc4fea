//! Text shaping between the language model and the synthesizer.

pub mod rechunk;
pub mod sanitizer;

pub use rechunk::{WordRechunker, rechunk_to_words};
pub use sanitizer::{TextSanitizer, is_emoji, strip_emoji};
