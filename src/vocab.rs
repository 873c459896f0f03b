//! Vocabulary model: learned merge rules, the derived byte table and the
//! special-token table.
//!
//! Chunk encoding applies merges using a priority queue ordered by the rank
//! each rule was learned at, in the spirit of:
//! "A Formal Perspective on Byte-Pair Encoding"
//! https://aclanthology.org/2023.findings-acl.38.pdf

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet},
};

use crate::{
    error::{DecodeError, SpecialTokenError},
    types::{ByteSeq, LEAF_COUNT, MergeOrder, MergeRule, Token, TokenPair},
};

/// A pair occurrence waiting to be merged while encoding a chunk.
///
/// Pops lowest rank first, then leftmost position.
#[derive(Debug, PartialEq, Eq)]
struct MergeCandidate {
    /// Rank of the rule; lower values are applied first.
    merge_order: MergeOrder,

    pair: TokenPair,

    /// Slot of the left token.
    position: usize,
}

impl PartialOrd for MergeCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed (other vs self) for min-heap behavior from Rust's max-heap.
        // Ties on rank go to the leftmost position.
        other
            .merge_order
            .cmp(&self.merge_order)
            .then_with(|| other.position.cmp(&self.position))
    }
}

/// The learned state of a tokenizer.
///
/// Merge rules are stored in learning order; rule `k` always mints id
/// `256 + k`. The id → bytes table is rebuilt from the rules and is never
/// authoritative on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    /// Merge rules in the order they were learned.
    merges: Vec<MergeRule>,

    /// pair -> (minted id, rank)
    ranks: HashMap<TokenPair, (Token, MergeOrder)>,

    /// Byte string of every leaf (`0..256`) and learned id.
    vocab: Vec<ByteSeq>,

    special_tokens: HashMap<String, Token>,

    inverse_special_tokens: HashMap<Token, ByteSeq>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    /// Creates a vocabulary holding only the 256 leaf tokens.
    pub fn new() -> Self {
        Self {
            merges: Vec::new(),
            ranks: HashMap::new(),
            vocab: (0..LEAF_COUNT).map(|b| vec![b as u8]).collect(),
            special_tokens: HashMap::new(),
            inverse_special_tokens: HashMap::new(),
        }
    }

    /// Builds a vocabulary from merge pairs listed in learning order.
    ///
    /// # Errors
    ///
    /// Returns a description of the first rule that references an undefined
    /// token or repeats an earlier pair.
    pub fn from_merges(pairs: impl IntoIterator<Item = TokenPair>) -> Result<Self, String> {
        let mut vocab = Self::new();
        for pair in pairs {
            vocab.push_merge(pair)?;
        }
        Ok(vocab)
    }

    /// Appends a merge rule and returns the id it mints.
    ///
    /// Both components must already be leaf or learned tokens, so every
    /// rule only builds on rules learned before it.
    pub(crate) fn push_merge(&mut self, pair: TokenPair) -> Result<Token, String> {
        let new_tok = self.vocab.len();

        if pair.0 >= new_tok || pair.1 >= new_tok {
            return Err(format!(
                "merge ({}, {}) references a token not defined before id {new_tok}",
                pair.0, pair.1
            ));
        }
        if self.ranks.contains_key(&pair) {
            return Err(format!("merge ({}, {}) is listed twice", pair.0, pair.1));
        }
        if self.inverse_special_tokens.contains_key(&new_tok) {
            return Err(format!("merged id {new_tok} collides with a special token"));
        }

        Ok(self.append_merge(pair))
    }

    /// Appends a merge rule known to be valid and returns the id it mints.
    pub(crate) fn append_merge(&mut self, pair: TokenPair) -> Token {
        let new_tok = self.vocab.len();

        let mut merged_bytes =
            Vec::with_capacity(self.vocab[pair.0].len() + self.vocab[pair.1].len());
        merged_bytes.extend_from_slice(&self.vocab[pair.0]);
        merged_bytes.extend_from_slice(&self.vocab[pair.1]);

        self.ranks.insert(pair, (new_tok, self.merges.len()));
        self.merges.push((pair, new_tok));
        self.vocab.push(merged_bytes);

        new_tok
    }

    /// Replaces the special-token table.
    ///
    /// # Errors
    ///
    /// Returns [`SpecialTokenError::IllegalToken`] if an id is a leaf or
    /// learned id, [`SpecialTokenError::DuplicateId`] if two tokens share an
    /// id and [`SpecialTokenError::InvalidText`] for empty text or text with
    /// a line break. The previous table is kept on error.
    pub fn register_special_tokens(
        &mut self,
        special_tokens: HashMap<String, Token>,
    ) -> Result<(), SpecialTokenError> {
        let mut inverse: HashMap<Token, ByteSeq> = HashMap::with_capacity(special_tokens.len());

        for (text, &tok) in &special_tokens {
            if text.is_empty() || text.contains(['\n', '\r']) {
                return Err(SpecialTokenError::InvalidText(text.clone()));
            }
            if tok < self.vocab.len() {
                return Err(SpecialTokenError::IllegalToken(tok));
            }
            if inverse.insert(tok, text.as_bytes().to_vec()).is_some() {
                return Err(SpecialTokenError::DuplicateId(tok));
            }
        }

        self.special_tokens = special_tokens;
        self.inverse_special_tokens = inverse;
        Ok(())
    }

    /// Encodes one chunk of bytes by applying learned BPE merge rules.
    ///
    /// At every step the present pair with the lowest rank is merged,
    /// leftmost occurrence first, until no present pair has a rule. This
    /// rebuilds tokens in exactly the order they were learned.
    ///
    /// # Time Complexity
    ///
    /// O(N log N) where N is the chunk length.
    pub fn encode_chunk(&self, chunk: &[u8]) -> Vec<Token> {
        let tokens: Vec<Token> = chunk.iter().map(|&b| b as Token).collect();
        if tokens.len() <= 1 {
            return tokens;
        }

        let mut heap = BinaryHeap::new();

        // results[pos] = None marks a slot consumed by a merge to its left
        let mut results: Vec<Option<Token>> = tokens.iter().map(|&t| Some(t)).collect();

        self.initialize_minheap(&tokens, &mut heap);

        // lowest rank first, so rules replay in learning order
        while let Some(candidate) = heap.pop() {
            let pos = candidate.position;

            // left slot was absorbed by an earlier merge
            let Some(left) = results.get(pos).copied().flatten() else {
                continue;
            };

            // closest live token to the right; if the left token is itself
            // a merge result, pos + 1 is already None
            let mut right_idx = pos + 1;
            while right_idx < results.len() && matches!(results.get(right_idx), Some(None)) {
                right_idx += 1;
            }
            let Some(right) = results.get(right_idx).copied().flatten() else {
                continue;
            };

            // stale candidate: a neighbour changed since it was pushed
            if candidate.pair != TokenPair(left, right) {
                continue;
            }

            let Some(&(merge_tok, _order)) = self.ranks.get(&candidate.pair) else {
                continue;
            };

            results[pos] = Some(merge_tok);
            results[right_idx] = None;

            // the merged token may pair with its new neighbours
            self.track_new_merge_candidate(&mut heap, &results, pos, merge_tok, true);
            self.track_new_merge_candidate(&mut heap, &results, pos, merge_tok, false);
        }

        results.into_iter().flatten().collect()
    }

    /// Adds merge candidates formed by the token just merged at `pos` and
    /// its nearest live neighbour on one side.
    fn track_new_merge_candidate(
        &self,
        heap: &mut BinaryHeap<MergeCandidate>,
        results: &[Option<Token>],
        pos: usize,
        merged_tok: Token,
        check_left: bool,
    ) {
        let n = results.len();
        let idx = if check_left {
            if pos == 0 {
                return;
            }
            // skip slots consumed to the left of pos
            let mut idx = pos - 1;
            while idx > 0 && matches!(results.get(idx), Some(None)) {
                idx -= 1;
            }
            idx
        } else {
            if pos + 1 >= n {
                return;
            }
            let mut idx = pos + 1;
            while idx < n && matches!(results.get(idx), Some(None)) {
                idx += 1;
            }
            idx
        };

        let Some(&Some(tok)) = results.get(idx) else {
            return;
        };

        let pair = if check_left {
            TokenPair(tok, merged_tok)
        } else {
            TokenPair(merged_tok, tok)
        };

        // only pairs with a rule become candidates
        if let Some(&(_merge_tok, merge_order)) = self.ranks.get(&pair) {
            // a candidate is keyed by its left slot
            let position = if check_left { idx } else { pos };
            heap.push(MergeCandidate {
                merge_order,
                pair,
                position,
            });
        }
    }

    /// Populates the priority queue with all initial mergeable pairs.
    fn initialize_minheap(&self, tokens: &[Token], heap: &mut BinaryHeap<MergeCandidate>) {
        for (i, window) in tokens.windows(2).enumerate() {
            let pair = TokenPair(window[0], window[1]);
            if let Some(&(_, merge_order)) = self.ranks.get(&pair) {
                heap.push(MergeCandidate {
                    merge_order,
                    pair,
                    position: i,
                });
            }
        }
    }

    /// Concatenates the byte strings of `tokens`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownToken`] for an id that is neither in
    /// the vocabulary nor a registered special token.
    pub fn decode_bytes(&self, tokens: &[Token]) -> Result<ByteSeq, DecodeError> {
        let mut result = Vec::with_capacity(tokens.len() * 2);
        for &token in tokens {
            match self.token_bytes(token) {
                Some(bytes) => result.extend_from_slice(bytes),
                None => return Err(DecodeError::UnknownToken(token)),
            }
        }
        Ok(result)
    }

    /// Byte string of a leaf, learned or special token.
    pub fn token_bytes(&self, token: Token) -> Option<&[u8]> {
        self.vocab
            .get(token)
            .or_else(|| self.inverse_special_tokens.get(&token))
            .map(Vec::as_slice)
    }

    /// Returns the rank of the rule merging `pair`, if any.
    pub fn merge_rank(&self, pair: TokenPair) -> Option<MergeOrder> {
        self.ranks.get(&pair).map(|&(_, order)| order)
    }

    /// Returns the two children of a learned token.
    pub fn children(&self, token: Token) -> Option<TokenPair> {
        token
            .checked_sub(LEAF_COUNT)
            .and_then(|rank| self.merges.get(rank))
            .map(|&(pair, _)| pair)
    }

    /// Whether a learned rule merges `(left, right)`.
    pub fn can_merge(&self, left: Token, right: Token) -> bool {
        self.ranks.contains_key(&TokenPair(left, right))
    }

    /// Merge rules in learning order.
    pub fn merges(&self) -> &[MergeRule] {
        &self.merges
    }

    /// Returns the total number of merge rules.
    pub fn num_merges(&self) -> usize {
        self.merges.len()
    }

    /// Leaf and learned byte strings, indexed by token id.
    pub fn vocab(&self) -> &[ByteSeq] {
        &self.vocab
    }

    /// Registered special tokens.
    pub fn special_tokens(&self) -> &HashMap<String, Token> {
        &self.special_tokens
    }

    /// Number of distinct ids: leaves, learned tokens and special tokens.
    pub fn len(&self) -> usize {
        self.vocab.len() + self.special_tokens.len()
    }

    /// Always false: the leaf tokens are always present.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Special tokens selected by name, for the encoder's splitting step.
    pub(crate) fn select_special(&self, names: &HashSet<String>) -> HashMap<String, Token> {
        self.special_tokens
            .iter()
            .filter(|(name, _)| names.contains(*name))
            .map(|(name, &tok)| (name.clone(), tok))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{count_pairs, merge};
    use crate::types::PairCounts;

    fn vocab_from(pairs: &[(Token, Token)]) -> Vocabulary {
        Vocabulary::from_merges(pairs.iter().copied().map(TokenPair::from))
            .expect("merges should be valid")
    }

    /// Rank-scan encoder built from the pair statistics and merge primitives.
    fn reference_encode(vocab: &Vocabulary, chunk: &[u8]) -> Vec<Token> {
        let mut ids: Vec<Token> = chunk.iter().map(|&b| b as Token).collect();
        while ids.len() >= 2 {
            let mut counts = PairCounts::new();
            count_pairs(&ids, &mut counts);
            let Some((pair, rank)) = counts
                .keys()
                .filter_map(|&p| vocab.merge_rank(p).map(|r| (p, r)))
                .min_by_key(|&(_, r)| r)
            else {
                break;
            };
            ids = merge(&ids, pair, LEAF_COUNT + rank);
        }
        ids
    }

    #[test]
    fn test_new_has_leaves_only() {
        let vocab = Vocabulary::new();
        assert_eq!(vocab.vocab().len(), 256);
        assert_eq!(vocab.num_merges(), 0);
        assert_eq!(vocab.vocab()[0x41], vec![0x41]);
    }

    #[test]
    fn test_basic_encoding() {
        let vocab = vocab_from(&[(97, 98), (256, 97)]);
        assert_eq!(vocab.encode_chunk(b"aba"), vec![257]);
    }

    #[test]
    fn test_single_byte_no_change() {
        let vocab = vocab_from(&[(97, 98)]);
        assert_eq!(vocab.encode_chunk(b"a"), vec![97]);
        assert_eq!(vocab.encode_chunk(b""), Vec::<Token>::new());
    }

    #[test]
    fn test_no_merge_rules_apply() {
        let vocab = vocab_from(&[(120, 121)]);
        assert_eq!(vocab.encode_chunk(b"abcd"), vec![97, 98, 99, 100]);
    }

    #[test]
    fn test_merge_skips_consumed_left() {
        let vocab = vocab_from(&[(97, 98), (99, 100), (256, 257)]);
        assert_eq!(vocab.encode_chunk(b"abcd"), vec![258]);
    }

    #[test]
    fn test_lowest_rank_wins() {
        // (b, c) is learned first, so "abc" never forms (a, b)
        let vocab = vocab_from(&[(98, 99), (97, 98)]);
        assert_eq!(vocab.encode_chunk(b"abc"), vec![97, 256]);
    }

    #[test]
    fn test_overlapping_pair_left_to_right() {
        let vocab = vocab_from(&[(97, 97)]);
        assert_eq!(vocab.encode_chunk(b"aaa"), vec![256, 97]);
        assert_eq!(vocab.encode_chunk(b"aaaa"), vec![256, 256]);
    }

    #[test]
    fn test_encode_matches_reference() {
        let vocab = vocab_from(&[
            (97, 97),
            (256, 97),
            (257, 98),
            (98, 97),
            (32, 97),
            (260, 98),
            (256, 256),
        ]);
        for text in ["aaabdaaabac", "aaaaaaa", " ab ab aaab", "baaaaab", "", "a"] {
            assert_eq!(
                vocab.encode_chunk(text.as_bytes()),
                reference_encode(&vocab, text.as_bytes()),
                "mismatch for {text:?}"
            );
        }
    }

    #[test]
    fn test_from_merges_rejects_undefined_component() {
        let result = Vocabulary::from_merges([TokenPair(97, 256)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_from_merges_rejects_repeated_pair() {
        let result = Vocabulary::from_merges([TokenPair(97, 98), TokenPair(97, 98)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_nested_merges() {
        let vocab = vocab_from(&[(97, 98), (256, 99)]);
        let decoded = vocab.decode_bytes(&[257, 256]).expect("decoding failed");
        assert_eq!(decoded, b"abcab".to_vec());
    }

    #[test]
    fn test_decode_invalid_token() {
        let vocab = vocab_from(&[(97, 98)]);
        let result = vocab.decode_bytes(&[97, 999]);
        assert!(matches!(result, Err(DecodeError::UnknownToken(999))));
    }

    #[test]
    fn test_decode_special_token_mixed_with_vocab() {
        let mut vocab = vocab_from(&[(97, 98)]);
        vocab
            .register_special_tokens(HashMap::from([("<|eot|>".to_string(), 1000)]))
            .expect("special tokens should register");
        let decoded = vocab.decode_bytes(&[256, 1000, 99]).expect("decoding failed");
        assert_eq!(decoded, b"ab<|eot|>c".to_vec());
        assert_eq!(vocab.len(), 258);
    }

    #[test]
    fn test_special_token_overlaps_base_vocab() {
        let mut vocab = Vocabulary::new();
        let result = vocab.register_special_tokens(HashMap::from([("<|bad|>".to_string(), 255)]));
        assert!(matches!(result, Err(SpecialTokenError::IllegalToken(255))));
    }

    #[test]
    fn test_special_token_overlaps_merged_vocab() {
        let mut vocab = vocab_from(&[(97, 98)]);
        let result = vocab.register_special_tokens(HashMap::from([("<|bad|>".to_string(), 256)]));
        assert!(matches!(result, Err(SpecialTokenError::IllegalToken(256))));
    }

    #[test]
    fn test_special_token_duplicate_id() {
        let mut vocab = Vocabulary::new();
        let result = vocab.register_special_tokens(HashMap::from([
            ("<a>".to_string(), 300),
            ("<b>".to_string(), 300),
        ]));
        assert!(matches!(result, Err(SpecialTokenError::DuplicateId(300))));
        assert!(vocab.special_tokens().is_empty());
    }

    #[test]
    fn test_special_token_invalid_text() {
        let mut vocab = Vocabulary::new();
        for bad in ["", "a\nb"] {
            let result = vocab.register_special_tokens(HashMap::from([(bad.to_string(), 300)]));
            assert!(matches!(result, Err(SpecialTokenError::InvalidText(_))));
        }
    }

    #[test]
    fn test_children() {
        let vocab = vocab_from(&[(97, 98), (256, 99)]);
        assert_eq!(vocab.children(257), Some(TokenPair(256, 99)));
        assert_eq!(vocab.children(97), None);
        assert_eq!(vocab.children(258), None);
    }

    #[test]
    fn test_vocab_table() {
        let vocab = vocab_from(&[(97, 98), (256, 99)]);
        assert_eq!(vocab.vocab().len(), 258);
        assert_eq!(vocab.vocab()[256], b"ab".to_vec());
        assert_eq!(vocab.vocab()[257], b"abc".to_vec());
        assert!(vocab.can_merge(97, 98));
        assert!(!vocab.can_merge(98, 97));
    }
}
