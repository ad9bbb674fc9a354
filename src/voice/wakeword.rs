//! Wake-word matching over transcribed text
//!
//! Transcripts are normalised (lowercased, everything but letters, digits
//! and spaces removed) and tested against a small set of pre-composed
//! phrases built from natural prefixes plus the configured assistant name.
//! On a match, the end of the wake phrase is mapped back to the original
//! text so any trailing command survives with its punctuation-free head
//! stripped.

/// Natural lead-ins composed with the assistant name
const WAKE_PREFIXES: &[&str] = &["hey", "okay", "ok", "hello", "hi"];

/// Outcome of testing a transcript for a wake phrase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeMatch {
    /// No wake phrase present
    None,
    /// Wake phrase with nothing after it
    WakeOnly,
    /// Wake phrase followed by a command
    WakeWithCommand(String),
}

pub struct WakeWordMatcher {
    phrases: Vec<String>,
}

impl WakeWordMatcher {
    pub fn new(ai_name: &str) -> Self {
        let name = normalize(ai_name);
        let phrases = WAKE_PREFIXES
            .iter()
            .map(|prefix| format!("{prefix} {name}"))
            .collect();
        Self { phrases }
    }

    /// Test a transcript for a wake phrase and extract the trailing command
    pub fn match_transcript(&self, text: &str) -> WakeMatch {
        let (normalized, positions) = normalize_with_positions(text);

        let mut best: Option<usize> = None;
        for phrase in &self.phrases {
            if let Some(start) = normalized.find(phrase.as_str()) {
                let end = start + phrase.len();
                // Earliest-ending match wins so the longest command survives
                if best.map_or(true, |b| end < b) {
                    best = Some(end);
                }
            }
        }

        let Some(end) = best else {
            return WakeMatch::None;
        };

        // Map the normalised end back to a byte offset in the original text
        // by counting only the characters that survived normalisation.
        let norm_chars_before_end = normalized[..end].chars().count();
        let original_end = if norm_chars_before_end == 0 {
            0
        } else {
            positions[norm_chars_before_end - 1]
        };

        let remainder = text[original_end..]
            .trim_start_matches(|c: char| c.is_whitespace() || c.is_ascii_punctuation());
        let remainder = remainder.trim_end();

        if remainder.is_empty() {
            WakeMatch::WakeOnly
        } else {
            WakeMatch::WakeWithCommand(remainder.to_string())
        }
    }
}

/// Lowercase and drop everything that is not a letter, digit or space
fn normalize(text: &str) -> String {
    normalize_with_positions(text).0
}

/// Normalise, additionally returning for each surviving character the byte
/// offset just past its source character in the original text
fn normalize_with_positions(text: &str) -> (String, Vec<usize>) {
    let mut normalized = String::with_capacity(text.len());
    let mut positions = Vec::with_capacity(text.len());
    for (idx, ch) in text.char_indices() {
        if ch.is_alphanumeric() || ch == ' ' {
            for lower in ch.to_lowercase() {
                normalized.push(lower);
                positions.push(idx + ch.len_utf8());
            }
        }
    }
    (normalized, positions)
}
