//! Text chunking ahead of byte-level BPE.
//!
//! Merges are never learned or applied across chunk boundaries, so the
//! chunker decides which bytes may ever end up in the same token.

use fancy_regex::Regex;

use crate::error::ConfigError;

/// GPT-2 text split pattern.
pub const GPT2_SPLIT_PATTERN: &str =
    r"'(?:[sdmt]|ll|ve|re)| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

/// GPT-4 (cl100k) text split pattern.
///
/// Adds case-insensitive contractions, digit runs of at most three and
/// keeps line breaks attached to the preceding punctuation.
pub const GPT4_SPLIT_PATTERN: &str = r"'(?i:[sdmt]|ll|ve|re)|[^\r\n\p{L}\p{N}]?+\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]++[\r\n]*|\s*[\r\n]|\s+(?!\S)|\s+";

/// Splits text into an ordered list of chunks.
#[derive(Debug, Clone, Default)]
pub enum Chunker {
    /// The whole text is a single chunk.
    #[default]
    Whole,
    /// Chunks are the matches of a compiled split pattern.
    Pattern(Regex),
}

impl Chunker {
    /// Compiles `pattern` into a chunker.
    ///
    /// An empty pattern selects [`Chunker::Whole`], matching how the model
    /// file stores "no chunking".
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] if the pattern fails to compile.
    pub fn from_pattern(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.is_empty() {
            return Ok(Self::Whole);
        }
        Ok(Self::Pattern(Regex::new(pattern)?))
    }

    /// GPT-4 style chunker.
    pub fn gpt4() -> Result<Self, ConfigError> {
        Self::from_pattern(GPT4_SPLIT_PATTERN)
    }

    /// GPT-2 style chunker.
    pub fn gpt2() -> Result<Self, ConfigError> {
        Self::from_pattern(GPT2_SPLIT_PATTERN)
    }

    /// The pattern source, empty for [`Chunker::Whole`].
    pub fn pattern(&self) -> &str {
        match self {
            Self::Whole => "",
            Self::Pattern(re) => re.as_str(),
        }
    }

    /// Splits `text` into chunks whose concatenation is exactly `text`.
    ///
    /// Text between two matches (or before the first / after the last) that
    /// the pattern does not cover becomes a chunk of its own, so nothing is
    /// dropped. Empty matches are skipped.
    ///
    /// # Errors
    ///
    /// Returns the regex engine's message if matching fails (e.g. the
    /// backtracking limit is exceeded).
    pub fn split<'t>(&self, text: &'t str) -> Result<Vec<&'t str>, String> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let re = match self {
            Self::Whole => return Ok(vec![text]),
            Self::Pattern(re) => re,
        };

        let mut chunks = Vec::new();
        let mut cursor = 0;

        for mat in re.find_iter(text) {
            let m = mat.map_err(|e| e.to_string())?;
            if m.start() == m.end() {
                continue;
            }
            if m.start() > cursor {
                chunks.push(&text[cursor..m.start()]);
            }
            chunks.push(m.as_str());
            cursor = m.end();
        }

        if cursor < text.len() {
            chunks.push(&text[cursor..]);
        }

        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(chunker: &Chunker, text: &str) -> Vec<String> {
        chunker
            .split(text)
            .expect("text should split")
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_whole_is_single_chunk() {
        let chunker = Chunker::Whole;
        assert_eq!(split(&chunker, "ab cd"), vec!["ab cd"]);
        assert!(split(&chunker, "").is_empty());
        assert_eq!(chunker.pattern(), "");
    }

    #[test]
    fn test_empty_pattern_is_whole() {
        let chunker = Chunker::from_pattern("").expect("empty pattern is valid");
        assert!(matches!(chunker, Chunker::Whole));
    }

    #[test]
    fn test_gpt2_words_and_spaces() {
        let chunker = Chunker::gpt2().expect("gpt2 pattern compiles");
        assert_eq!(split(&chunker, "ab cd"), vec!["ab", " cd"]);
        assert_eq!(chunker.pattern(), GPT2_SPLIT_PATTERN);
    }

    #[test]
    fn test_gpt2_contractions_case_sensitive() {
        let chunker = Chunker::gpt2().expect("gpt2 pattern compiles");
        assert_eq!(split(&chunker, "DON'T"), vec!["DON", "'", "T"]);
        assert_eq!(split(&chunker, "don't"), vec!["don", "'t"]);
    }

    #[test]
    fn test_gpt4_contractions_case_insensitive() {
        let chunker = Chunker::gpt4().expect("gpt4 pattern compiles");
        assert_eq!(split(&chunker, "DON'T"), vec!["DON", "'T"]);
    }

    #[test]
    fn test_gpt4_digit_runs() {
        let chunker = Chunker::gpt4().expect("gpt4 pattern compiles");
        assert_eq!(
            split(&chunker, "Hello world123456"),
            vec!["Hello", " world", "123", "456"]
        );
    }

    #[test]
    fn test_chunks_reconstruct_text() {
        let chunker = Chunker::gpt4().expect("gpt4 pattern compiles");
        let text = "Hello,  world!\n\n  It's 2024 ... 你好 🙂\t end ";
        assert_eq!(split(&chunker, text).concat(), text);
    }

    #[test]
    fn test_unmatched_text_is_kept() {
        let chunker = Chunker::from_pattern(r"\S+").expect("pattern compiles");
        assert_eq!(split(&chunker, " ab  cd "), vec![" ", "ab", "  ", "cd", " "]);
    }

    #[test]
    fn test_invalid_pattern() {
        let result = Chunker::from_pattern("(");
        assert!(matches!(result, Err(ConfigError::InvalidPattern(_))));
    }
}
