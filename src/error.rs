//! Error types for BPE tokenizer, trainer and model file operations.

use std::{fmt, io, path::PathBuf, str::FromStr};

use indicatif::style::TemplateError;

use crate::types::Token;

/// What decoding does with byte sequences that are not valid UTF-8.
///
/// Only affects UTF-8 handling; an unknown id is an error in either mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Fail with [`DecodeError::InvalidUtf8`].
    Strict,
    /// Substitute U+FFFD for every invalid sequence.
    #[default]
    Replace,
}

impl FromStr for ErrorMode {
    type Err = String;

    /// Accepts `"strict"` or `"replace"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "replace" => Ok(Self::Replace),
            _ => Err(format!(
                "invalid error mode: {s:?} (expected \"strict\" or \"replace\")"
            )),
        }
    }
}

/// Invalid caller-supplied configuration, reported before any work begins.
#[derive(Debug)]
pub enum ConfigError {
    /// Target vocabulary size is smaller than the 256 leaf tokens.
    VocabSizeTooSmall(usize),
    /// `allowed_special` mode is neither a known literal nor a set.
    UnknownAllowedSpecial(String),
    /// Split pattern does not compile.
    InvalidPattern(fancy_regex::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VocabSizeTooSmall(n) => {
                write!(f, "vocab size must be at least 256, got {n}")
            }
            Self::UnknownAllowedSpecial(s) => write!(
                f,
                "allowed_special={s:?} not understood (expected \"all\", \"none\", \"none_raise\" or a set)"
            ),
            Self::InvalidPattern(e) => write!(f, "invalid split pattern: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<fancy_regex::Error> for ConfigError {
    fn from(e: fancy_regex::Error) -> Self {
        Self::InvalidPattern(e)
    }
}

/// Rejected special-token registration.
#[derive(Debug)]
pub enum SpecialTokenError {
    /// Id is a leaf or learned id.
    IllegalToken(Token),
    /// Two special tokens share the same id.
    DuplicateId(Token),
    /// Token text is empty or cannot be stored on one model file line.
    InvalidText(String),
}

impl fmt::Display for SpecialTokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalToken(tok) => {
                write!(f, "special token id {tok} is already a vocabulary id")
            }
            Self::DuplicateId(tok) => write!(f, "special token id assigned twice: {tok}"),
            Self::InvalidText(s) => write!(f, "invalid special token text: {s:?}"),
        }
    }
}

impl std::error::Error for SpecialTokenError {}

/// Errors that can occur during training.
#[derive(Debug)]
pub enum TrainError {
    /// Training options were rejected.
    Config(ConfigError),
    /// The corpus ran out of adjacent pairs before the requested merge count.
    Exhausted { requested: usize, learned: usize },
    /// Regex engine failed during text splitting.
    RegexMatch(String),
    /// Previously registered special tokens collide with the new merges.
    SpecialToken(SpecialTokenError),
    /// Progress bar template rejected by indicatif.
    ProgressBarSetup(TemplateError),
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::Exhausted { requested, learned } => write!(
                f,
                "no pairs left to merge after {learned} of {requested} merges"
            ),
            Self::RegexMatch(msg) => write!(f, "pattern matching failed: {msg}"),
            Self::SpecialToken(e) => write!(f, "{e}"),
            Self::ProgressBarSetup(e) => write!(f, "progress bar setup failed: {e}"),
        }
    }
}

impl std::error::Error for TrainError {}

impl From<ConfigError> for TrainError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<SpecialTokenError> for TrainError {
    fn from(e: SpecialTokenError) -> Self {
        Self::SpecialToken(e)
    }
}

/// Encoding failures.
#[derive(Debug)]
pub enum EncodeError {
    /// Chunking or special-token matching failed in the regex engine.
    RegexMatch(String),
    /// A registered special token appeared in text encoded with `none_raise`.
    ForbiddenSpecialToken(String),
    /// Progress bar template rejected by indicatif.
    ProgressBarSetup(TemplateError),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegexMatch(msg) => write!(f, "pattern matching failed: {msg}"),
            Self::ForbiddenSpecialToken(s) => {
                write!(f, "special token {s:?} found in text but not allowed")
            }
            Self::ProgressBarSetup(e) => write!(f, "progress bar setup failed: {e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Decoding failures.
#[derive(Debug)]
pub enum DecodeError {
    /// Id is neither in the vocabulary nor a special token.
    UnknownToken(Token),
    /// Strict mode only.
    InvalidUtf8(std::string::FromUtf8Error),
    /// Progress bar template rejected by indicatif.
    ProgressBarSetup(TemplateError),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownToken(t) => write!(f, "invalid token id: {t}"),
            Self::InvalidUtf8(e) => write!(f, "decoded bytes are not UTF-8: {e}"),
            Self::ProgressBarSetup(e) => write!(f, "progress bar setup failed: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur when saving or loading a model file.
#[derive(Debug)]
pub enum ModelIoError {
    /// Underlying file system failure.
    Io(io::Error),
    /// Model files must carry the `.model` extension.
    InvalidPath(PathBuf),
    /// First line did not match the expected version tag.
    VersionMismatch { found: String },
    /// A line could not be parsed (1-based line number).
    Malformed { line: usize, reason: String },
    /// Stored pattern failed to compile.
    Config(ConfigError),
    /// Stored special tokens are invalid.
    SpecialToken(SpecialTokenError),
    /// Model state cannot be written to the line-oriented format.
    Unrepresentable(String),
}

impl fmt::Display for ModelIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "model file i/o failed: {e}"),
            Self::InvalidPath(p) => {
                write!(f, "model file must end with .model: {}", p.display())
            }
            Self::VersionMismatch { found } => {
                write!(f, "unsupported model version: {found:?}")
            }
            Self::Malformed { line, reason } => {
                write!(f, "malformed model file at line {line}: {reason}")
            }
            Self::Config(e) => write!(f, "{e}"),
            Self::SpecialToken(e) => write!(f, "{e}"),
            Self::Unrepresentable(msg) => write!(f, "cannot save model: {msg}"),
        }
    }
}

impl std::error::Error for ModelIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ModelIoError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for ModelIoError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<SpecialTokenError> for ModelIoError {
    fn from(e: SpecialTokenError) -> Self {
        Self::SpecialToken(e)
    }
}
