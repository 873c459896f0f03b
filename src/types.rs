//! Type aliases and shared types for BPE training and encoding.
//!
//! These type aliases provide semantic clarity throughout the codebase.

use std::collections::HashMap;

/// Represents a token identifier in the vocabulary.
///
/// Ids `0..256` are leaf tokens (one per byte value), learned merges start
/// at [`LEAF_COUNT`] and special tokens use caller-assigned ids above both.
pub type Token = usize;

/// Position of a token in the training arena.
pub(crate) type TextIdx = usize;

/// Frequency count for token pairs.
pub type TokenFreq = usize;

/// Merge order indicates when a merge rule was learned during training.
///
/// Lower values represent earlier merges (e.g., 0 = first merge, 1 = second merge).
pub type MergeOrder = usize;

/// A sequence of raw bytes.
pub type ByteSeq = Vec<u8>;

/// Number of leaf tokens, one per byte value.
pub const LEAF_COUNT: usize = 256;

/// A pair of adjacent tokens.
///
/// Used as a key for looking up merge rules during encoding and for
/// tracking pair frequencies during training. Ordering is lexicographic
/// on `(left, right)`, which the trainer uses to break frequency ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenPair(pub Token, pub Token);

impl From<(Token, Token)> for TokenPair {
    fn from((left, right): (Token, Token)) -> Self {
        Self(left, right)
    }
}

/// Adjacent pair frequencies, accumulated over one or more sequences.
pub type PairCounts = HashMap<TokenPair, TokenFreq>;

/// A learned merge rule: the pair it replaces and the id it mints.
pub type MergeRule = (TokenPair, Token);
