//! Streaming-safe cleanup of LLM output before it reaches the synthesizer.
//!
//! Emoji produce artifacts in synthesized speech and bracketed asides
//! (`(laughs)`, `[pause]`, `<smile>`) should not be read aloud. Deltas split at
//! arbitrary points, so bracket depth is carried across calls.

const EMOJI_RANGES: &[(u32, u32)] = &[
    (0x1F600, 0x1F64F), // emoticons
    (0x1F300, 0x1F5FF), // symbols & pictographs
    (0x1F680, 0x1F6FF), // transport & map
    (0x1F1E0, 0x1F1FF), // flags
    (0x1F900, 0x1F9FF), // supplemental symbols & pictographs
    (0x1FA70, 0x1FAFF), // symbols & pictographs extended-A
    (0x1F170, 0x1F251), // enclosed alphanumeric / ideographic supplement
    (0x2600, 0x26FF),   // misc symbols
    (0x2702, 0x27B0),   // dingbats
    (0x24C2, 0x24C2),
    (0x200D, 0x200D), // zero width joiner
    (0xFE0F, 0xFE0F), // variation selector-16
];

/// Whether `c` falls in one of the emoji blocks removed before synthesis.
#[must_use]
pub fn is_emoji(c: char) -> bool {
    let code = u32::from(c);
    EMOJI_RANGES
        .iter()
        .any(|&(start, end)| (start..=end).contains(&code))
}

/// Remove emoji code points from `text`.
#[must_use]
pub fn strip_emoji(text: &str) -> String {
    text.chars().filter(|c| !is_emoji(*c)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bracket {
    Paren,
    Square,
    Angle,
}

impl Bracket {
    const fn classify(c: char) -> Option<(Self, bool)> {
        match c {
            '(' => Some((Self::Paren, true)),
            ')' => Some((Self::Paren, false)),
            '[' => Some((Self::Square, true)),
            ']' => Some((Self::Square, false)),
            '<' => Some((Self::Angle, true)),
            '>' => Some((Self::Angle, false)),
            _ => None,
        }
    }
}

/// Per-turn token filter. Create one per LLM response and feed it every delta in order.
#[derive(Debug, Default, Clone)]
pub struct TextSanitizer {
    paren: usize,
    square: usize,
    angle: usize,
}

impl TextSanitizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    const fn depth_mut(&mut self, bracket: Bracket) -> &mut usize {
        match bracket {
            Bracket::Paren => &mut self.paren,
            Bracket::Square => &mut self.square,
            Bracket::Angle => &mut self.angle,
        }
    }

    /// True while an opened bracket has not been closed yet.
    #[must_use]
    pub const fn in_aside(&self) -> bool {
        self.paren > 0 || self.square > 0 || self.angle > 0
    }

    /// Filter one delta. Emoji are always dropped and text inside any bracket
    /// pair is dropped. A closing bracket whose own depth is zero is emitted as-is.
    pub fn clean_token(&mut self, token: &str) -> String {
        let mut out = String::with_capacity(token.len());
        for c in token.chars().filter(|c| !is_emoji(*c)) {
            match Bracket::classify(c) {
                Some((bracket, true)) => *self.depth_mut(bracket) += 1,
                Some((bracket, false)) => {
                    let depth = self.depth_mut(bracket);
                    if *depth > 0 {
                        *depth -= 1;
                    } else {
                        out.push(c);
                    }
                }
                None if !self.in_aside() => out.push(c),
                None => {}
            }
        }
        out
    }

    pub const fn reset(&mut self) {
        self.paren = 0;
        self.square = 0;
        self.angle = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_all(tokens: &[&str]) -> String {
        let mut sanitizer = TextSanitizer::new();
        tokens.iter().map(|t| sanitizer.clean_token(t)).collect()
    }

    #[test]
    fn removes_emoji() {
        assert_eq!(clean_all(&["Hello 😀 world 🚀!"]), "Hello  world !");
    }

    #[test]
    fn removes_bracketed_asides() {
        assert_eq!(
            clean_all(&["Sure (laughs) here [pause] it <smile>is."]),
            "Sure  here  it is."
        );
    }

    #[test]
    fn nested_brackets_are_removed() {
        assert_eq!(clean_all(&["a (b [c <d> e] f) g"]), "a  g");
    }

    #[test]
    fn unmatched_close_is_kept() {
        assert_eq!(clean_all(&["1) first", " 2> second"]), "1) first 2> second");
    }

    #[test]
    fn unmatched_close_inside_other_aside_is_kept() {
        assert_eq!(clean_all(&["a (b ] c) d"]), "a ] d");
    }

    #[test]
    fn aside_split_across_deltas() {
        assert_eq!(clean_all(&["Well (he", "h, sor", "ry) ok"]), "Well  ok");
    }

    #[test]
    fn emoji_inside_and_outside_brackets() {
        assert_eq!(clean_all(&["😀 (🎉 yay", ") 👍done"]), "  done");
    }

    #[test]
    fn split_invariance() {
        let text = "Hi (there [you] <x>) friend] 😀 ok (unfinished";
        let whole = clean_all(&[text]);
        let chars: Vec<String> = text.chars().map(String::from).collect();
        for split in 1..chars.len() {
            let (left, right) = chars.split_at(split);
            let pieces = [left.concat(), right.concat()];
            let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
            assert_eq!(clean_all(&refs), whole, "split at {split}");
        }
        let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(clean_all(&refs), whole);
    }

    #[test]
    fn depth_never_goes_negative() {
        let mut sanitizer = TextSanitizer::new();
        assert_eq!(sanitizer.clean_token("))) ]"), "))) ]");
        assert!(!sanitizer.in_aside());
        assert_eq!(sanitizer.clean_token("(x) y"), " y");
    }

    #[test]
    fn reset_clears_depth() {
        let mut sanitizer = TextSanitizer::new();
        sanitizer.clean_token("(never closed");
        assert!(sanitizer.in_aside());
        sanitizer.reset();
        assert_eq!(sanitizer.clean_token("visible"), "visible");
    }

    #[test]
    fn strip_emoji_keeps_accents_and_dashes() {
        assert_eq!(strip_emoji("Café — déjà vu ✨"), "Café — déjà vu ");
    }
}
