//! This module provides the complete encoding pipeline:
//! 1. Special-token splitting of the input text.
//! 2. Pattern chunking of every literal span.
//! 3. UTF-8 byte conversion and BPE merges per chunk.
//!
//! Chunks are encoded in parallel via Rayon, and batch methods spread whole
//! texts across workers.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    str::FromStr,
};

use fancy_regex::Regex;
use indicatif::ParallelProgressIterator;
use rayon::prelude::*;

use crate::{
    chunker::Chunker,
    error::{
        ConfigError, DecodeError, EncodeError, ErrorMode, ModelIoError, SpecialTokenError,
        TrainError,
    },
    model_io,
    progress::progress_bar,
    trainer::Trainer,
    types::Token,
    vocab::Vocabulary,
};

/// Chunks per Rayon task when encoding one text.
const MIN_CHUNKS_PER_TASK: usize = 64;

/// Which registered special tokens `encode` may emit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AllowedSpecial {
    /// Every registered special token.
    All,
    /// None; special-token text is encoded as ordinary text.
    None,
    /// None, and encoding fails if any registered special token occurs.
    #[default]
    NoneRaise,
    /// Only the named tokens.
    Set(HashSet<String>),
}

impl FromStr for AllowedSpecial {
    type Err = ConfigError;

    /// Parses `"all"`, `"none"` or `"none_raise"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "none" => Ok(Self::None),
            "none_raise" => Ok(Self::NoneRaise),
            _ => Err(ConfigError::UnknownAllowedSpecial(s.to_string())),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for AllowedSpecial {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::Set(iter.into_iter().map(Into::into).collect())
    }
}

/// BPE Tokenizer that performs chunking, encoding and decoding.
///
/// This struct combines:
/// - A [`Chunker`] deciding where merges may never cross.
/// - A [`Vocabulary`] with learned merge rules and special tokens.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    chunker: Chunker,
    vocab: Vocabulary,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::basic()
    }
}

impl Tokenizer {
    /// Creates an untrained tokenizer that chunks with the GPT-4 pattern.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] if the regex engine rejects
    /// the pattern.
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self::from_parts(Chunker::gpt4()?, Vocabulary::new()))
    }

    /// Creates an untrained tokenizer that never chunks.
    pub fn basic() -> Self {
        Self::from_parts(Chunker::Whole, Vocabulary::new())
    }

    /// Creates an untrained tokenizer with a custom split pattern.
    ///
    /// An empty pattern disables chunking.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] if the pattern fails to compile.
    pub fn with_pattern(pattern: &str) -> Result<Self, ConfigError> {
        Ok(Self::from_parts(
            Chunker::from_pattern(pattern)?,
            Vocabulary::new(),
        ))
    }

    /// Assembles a tokenizer from a chunker and a vocabulary.
    pub fn from_parts(chunker: Chunker, vocab: Vocabulary) -> Self {
        Self { chunker, vocab }
    }

    /// Learns `vocab_size - 256` merges from `text`, replacing any earlier merges.
    ///
    /// Registered special tokens are kept and re-validated against the new
    /// learned ids.
    ///
    /// # Errors
    ///
    /// See [`Trainer::train`]; additionally returns
    /// [`TrainError::SpecialToken`] if a registered special token now
    /// collides with a learned id. The tokenizer is unchanged on error.
    pub fn train(&mut self, text: &str, vocab_size: usize, verbose: bool) -> Result<(), TrainError> {
        let trained = Trainer::new(vocab_size)
            .with_chunker(self.chunker.clone())
            .with_verbose(verbose)
            .train(text)?;

        let mut vocab = trained.vocab;
        vocab.register_special_tokens(self.vocab.special_tokens().clone())?;
        self.vocab = vocab;
        Ok(())
    }

    /// Replaces the special-token table.
    ///
    /// # Errors
    ///
    /// Returns [`SpecialTokenError`] if an id collides with a leaf or
    /// learned id, two tokens share an id, or a token's text is unusable.
    pub fn register_special_tokens(
        &mut self,
        special_tokens: HashMap<String, Token>,
    ) -> Result<(), SpecialTokenError> {
        self.vocab.register_special_tokens(special_tokens)
    }

    /// Encodes text ignoring special tokens: chunk → bytes → BPE.
    ///
    /// Chunk results are concatenated in chunk order; no merge ever spans
    /// two chunks.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::RegexMatch`] if the regex engine fails during
    /// text splitting (e.g. backtracking limit exceeded).
    pub fn encode_ordinary(&self, text: &str) -> Result<Vec<Token>, EncodeError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = self.chunker.split(text).map_err(EncodeError::RegexMatch)?;

        let encoded: Vec<Vec<Token>> = chunks
            .par_iter()
            .with_min_len(MIN_CHUNKS_PER_TASK)
            .map(|chunk| self.vocab.encode_chunk(chunk.as_bytes()))
            .collect();

        Ok(encoded.concat())
    }

    /// Encodes text, emitting eligible special tokens as their reserved ids.
    ///
    /// Eligible special tokens are matched as exact strings (longest match
    /// first); every span between them goes through [`Self::encode_ordinary`].
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::ForbiddenSpecialToken`] in
    /// [`AllowedSpecial::NoneRaise`] mode if any registered special token
    /// occurs in `text`, or [`EncodeError::RegexMatch`] if splitting fails.
    pub fn encode(&self, text: &str, allowed_special: &AllowedSpecial) -> Result<Vec<Token>, EncodeError> {
        let special = self.eligible_special(text, allowed_special)?;

        if special.is_empty() {
            return self.encode_ordinary(text);
        }

        let mut all_tokens: Vec<Token> = Vec::with_capacity(text.len() / 3);

        for (segment, special_id) in split_on_special_tokens(text, &special)? {
            match special_id {
                Some(id) => all_tokens.push(id),
                None => all_tokens.extend(self.encode_ordinary(segment)?),
            }
        }

        Ok(all_tokens)
    }

    /// Encodes many texts in parallel without special-token handling.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::RegexMatch`] if splitting fails, or
    /// [`EncodeError::ProgressBarSetup`] if the progress bar template fails
    /// to compile.
    pub fn encode_ordinary_batch(
        &self,
        texts: &[&str],
        show_progress: bool,
    ) -> Result<Vec<Vec<Token>>, EncodeError> {
        let pb = progress_bar(texts.len() as u64, "Encoding texts", show_progress)
            .map_err(EncodeError::ProgressBarSetup)?;

        texts
            .par_iter()
            .progress_with(pb)
            .map(|text| self.encode_ordinary(text))
            .collect()
    }

    /// Encodes many texts in parallel with special-token handling.
    ///
    /// Results are in input order. The first failing text aborts the batch.
    ///
    /// # Errors
    ///
    /// Same as [`Self::encode`], plus [`EncodeError::ProgressBarSetup`].
    pub fn encode_batch(
        &self,
        texts: &[&str],
        allowed_special: &AllowedSpecial,
        show_progress: bool,
    ) -> Result<Vec<Vec<Token>>, EncodeError> {
        let pb = progress_bar(texts.len() as u64, "Encoding texts (st)", show_progress)
            .map_err(EncodeError::ProgressBarSetup)?;

        texts
            .par_iter()
            .progress_with(pb)
            .map(|text| self.encode(text, allowed_special))
            .collect()
    }

    /// Decodes a token sequence, replacing invalid UTF-8 with U+FFFD.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownToken`] if an id is neither in the
    /// vocabulary nor a registered special token.
    pub fn decode(&self, tokens: &[Token]) -> Result<String, DecodeError> {
        self.decode_with(tokens, ErrorMode::Replace)
    }

    /// Decodes a token sequence with an explicit UTF-8 error mode.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownToken`] if a token ID is not found, or
    /// [`DecodeError::InvalidUtf8`] if the decoded bytes are not valid UTF-8
    /// (only in `Strict` mode).
    pub fn decode_with(&self, tokens: &[Token], errors: ErrorMode) -> Result<String, DecodeError> {
        let bytes = self.vocab.decode_bytes(tokens)?;

        match errors {
            ErrorMode::Strict => String::from_utf8(bytes).map_err(DecodeError::InvalidUtf8),
            ErrorMode::Replace => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }

    /// Decodes multiple token sequences in parallel.
    ///
    /// # Errors
    ///
    /// Same as [`Self::decode_with`], plus [`DecodeError::ProgressBarSetup`].
    pub fn decode_batch(
        &self,
        token_seqs: &[&[Token]],
        errors: ErrorMode,
        show_progress: bool,
    ) -> Result<Vec<String>, DecodeError> {
        let pb = progress_bar(token_seqs.len() as u64, "Decoding tokens", show_progress)
            .map_err(DecodeError::ProgressBarSetup)?;

        token_seqs
            .par_iter()
            .progress_with(pb)
            .map(|tokens| self.decode_with(tokens, errors))
            .collect()
    }

    /// Writes `<prefix>.model` and the human-readable `<prefix>.vocab`.
    ///
    /// # Errors
    ///
    /// See [`model_io::save`].
    pub fn save(&self, file_prefix: impl AsRef<Path>) -> Result<(), ModelIoError> {
        model_io::save(self, file_prefix.as_ref())
    }

    /// Loads a tokenizer from a `.model` file.
    ///
    /// # Errors
    ///
    /// See [`model_io::load`].
    pub fn load(model_file: impl AsRef<Path>) -> Result<Self, ModelIoError> {
        model_io::load(model_file.as_ref())
    }

    /// The split pattern, empty when chunking is disabled.
    pub fn pattern(&self) -> &str {
        self.chunker.pattern()
    }

    /// Chunker applied before byte-level merges.
    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    /// Learned merges and special tokens.
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Registered special tokens.
    pub fn special_tokens(&self) -> &HashMap<String, Token> {
        self.vocab.special_tokens()
    }

    /// Returns the vocabulary size, special tokens included.
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Resolves `allowed_special` into the special tokens eligible for `text`.
    fn eligible_special(
        &self,
        text: &str,
        allowed_special: &AllowedSpecial,
    ) -> Result<HashMap<String, Token>, EncodeError> {
        match allowed_special {
            AllowedSpecial::All => Ok(self.vocab.special_tokens().clone()),
            AllowedSpecial::None => Ok(HashMap::new()),
            AllowedSpecial::NoneRaise => {
                let mut present: Vec<&String> = self
                    .vocab
                    .special_tokens()
                    .keys()
                    .filter(|token| text.contains(token.as_str()))
                    .collect();
                // report deterministically
                present.sort();
                match present.first() {
                    Some(token) => Err(EncodeError::ForbiddenSpecialToken((*token).clone())),
                    None => Ok(HashMap::new()),
                }
            }
            AllowedSpecial::Set(names) => Ok(self.vocab.select_special(names)),
        }
    }
}

/// Segments text into alternating normal and special-token spans.
///
/// Special tokens are escaped so their text is matched literally, and
/// sorted longest first so the alternation prefers the longest token
/// starting at any position. Returns `(span, Some(id))` for special tokens
/// and `(span, None)` for the text between them; empty spans are skipped.
///
/// # Errors
///
/// Returns [`EncodeError::RegexMatch`] if the special-token pattern fails
/// to compile or a match error occurs during scanning.
fn split_on_special_tokens<'t>(
    text: &'t str,
    allowed_special: &HashMap<String, Token>,
) -> Result<Vec<(&'t str, Option<Token>)>, EncodeError> {
    let mut tokens: Vec<&String> = allowed_special.keys().collect();
    tokens.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let pattern = tokens
        .iter()
        .map(|s| fancy_regex::escape(s))
        .collect::<Vec<_>>()
        .join("|");

    let re = Regex::new(&pattern).map_err(|e| EncodeError::RegexMatch(e.to_string()))?;

    let mut segments = Vec::new();
    let mut segment_start = 0;

    for mat in re.find_iter(text) {
        let mat = mat.map_err(|e| EncodeError::RegexMatch(e.to_string()))?;

        // guard against empty normal segments when text starts with a
        // special token or contains two consecutive special tokens.
        if mat.start() > segment_start {
            segments.push((&text[segment_start..mat.start()], None));
        }
        let id = allowed_special.get(mat.as_str()).copied();
        segments.push((mat.as_str(), id));
        segment_start = mat.end();
    }

    if segment_start < text.len() {
        segments.push((&text[segment_start..], None));
    }

    Ok(segments)
}
