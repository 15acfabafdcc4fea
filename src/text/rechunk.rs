use std::collections::VecDeque;

use futures::stream::{self, Stream, StreamExt};

/// Rebuffers text deltas into whole words.
///
/// Whitespace is carried on the *next* word, so `"foo bar baz"` becomes
/// `"foo"`, `" bar"`, `" baz"`. Runs of whitespace collapse to one space.
#[derive(Debug, Default, Clone)]
pub struct WordRechunker {
    buffer: String,
    prefix: &'static str,
}

impl WordRechunker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one delta and return every word it completed.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);
        let mut words = Vec::new();
        while let Some(start) = self.buffer.find(char::is_whitespace) {
            let end = self.buffer[start..]
                .find(|c: char| !c.is_whitespace())
                .map_or(self.buffer.len(), |offset| start + offset);
            if start > 0 {
                words.push(format!("{}{}", self.prefix, &self.buffer[..start]));
            }
            self.buffer.drain(..end);
            self.prefix = " ";
        }
        words
    }

    /// Flush the trailing partial word, if any.
    #[must_use]
    pub fn finish(self) -> Option<String> {
        (!self.buffer.is_empty()).then(|| format!("{}{}", self.prefix, self.buffer))
    }
}

struct RechunkState<S> {
    inner: S,
    chunker: Option<WordRechunker>,
    ready: VecDeque<String>,
}

/// Adapt a stream of arbitrary text deltas into a stream of whole words.
pub fn rechunk_to_words<S>(deltas: S) -> impl Stream<Item = String>
where
    S: Stream<Item = String> + Unpin,
{
    let state = RechunkState {
        inner: deltas,
        chunker: Some(WordRechunker::new()),
        ready: VecDeque::new(),
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(word) = state.ready.pop_front() {
                return Some((word, state));
            }
            let chunker = state.chunker.as_mut()?;
            match state.inner.next().await {
                Some(delta) => state.ready.extend(chunker.push(&delta)),
                None => {
                    let tail = state.chunker.take().and_then(WordRechunker::finish);
                    state.ready.extend(tail);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_all(deltas: &[&str]) -> Vec<String> {
        let mut chunker = WordRechunker::new();
        let mut words: Vec<String> = deltas.iter().flat_map(|d| chunker.push(d)).collect();
        words.extend(chunker.finish());
        words
    }

    #[test]
    fn single_delta_is_split_into_words() {
        assert_eq!(chunk_all(&["foo bar baz"]), vec!["foo", " bar", " baz"]);
    }

    #[test]
    fn char_by_char_matches_single_delta() {
        let text = "foo bar baz";
        let chars: Vec<String> = text.chars().map(String::from).collect();
        let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(chunk_all(&refs), vec!["foo", " bar", " baz"]);
    }

    #[test]
    fn whitespace_runs_collapse() {
        assert_eq!(chunk_all(&["foo  \n", "\tbar"]), vec!["foo", " bar"]);
    }

    #[test]
    fn leading_whitespace_prefixes_first_word() {
        assert_eq!(chunk_all(&["  hello world"]), vec![" hello", " world"]);
    }

    #[test]
    fn trailing_whitespace_emits_no_tail() {
        assert_eq!(chunk_all(&["one two "]), vec!["one", " two"]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(chunk_all(&["", ""]).is_empty());
    }

    #[test]
    fn multibyte_words_are_kept_whole() {
        assert_eq!(chunk_all(&["déj", "à vu — ok"]), vec!["déjà", " vu", " —", " ok"]);
    }

    #[tokio::test]
    async fn stream_adapter_flushes_tail() {
        let deltas = stream::iter(vec!["Hel".to_string(), "lo the".to_string(), "re".to_string()]);
        let words: Vec<String> = rechunk_to_words(deltas).collect().await;
        assert_eq!(words, vec!["Hello", " there"]);
    }
}
