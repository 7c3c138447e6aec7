//! Text preparation for synthesis and cache keying.
//!
//! Pure functions, no I/O.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Average announcer pace used for duration estimates before audio exists.
pub const WORDS_PER_SECOND: f64 = 2.5;

/// Floor for any spoken estimate.
const MIN_SPOKEN: Duration = Duration::from_secs(1);

/// Trim and collapse internal whitespace. Case and punctuation are kept
/// since both change how the text is spoken.
pub fn normalize_text(text: &str) -> String {
    RE_WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Whether the text contains anything a voice could say.
pub fn is_speakable(text: &str) -> bool {
    text.chars().any(|c| c.is_alphanumeric())
}

/// Rough spoken length of `text` at [`WORDS_PER_SECOND`].
pub fn estimate_speech_duration(text: &str) -> Duration {
    let words = text.split_whitespace().count() as f64;
    Duration::from_secs_f64(words / WORDS_PER_SECOND).max(MIN_SPOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace() {
        assert_eq!(
            normalize_text("  Please \t remain\n\nseated  "),
            "Please remain seated"
        );
    }

    #[test]
    fn keeps_case_and_punctuation() {
        assert_eq!(normalize_text("Stop! Now."), "Stop! Now.");
    }

    #[test]
    fn speakable_needs_alphanumerics() {
        assert!(is_speakable("Lap 3"));
        assert!(!is_speakable(" ... !!"));
        assert!(!is_speakable(""));
    }

    #[test]
    fn estimate_scales_with_words() {
        let ten = "word ".repeat(10);
        assert_eq!(estimate_speech_duration(&ten), Duration::from_secs(4));
    }

    #[test]
    fn estimate_has_floor() {
        assert_eq!(estimate_speech_duration("Go"), MIN_SPOKEN);
        assert_eq!(estimate_speech_duration(""), MIN_SPOKEN);
    }
}
