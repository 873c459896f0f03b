//! Core BPE training algorithm (Algorithm 2).
//!
//! Optimized implementation from "Byte Pair Encoding is Suboptimal for Language Model Pretraining"
//! https://aclanthology.org/2023.findings-acl.38.pdf
//!
//! Every chunk of the corpus is a separate run of linked nodes, so pairs are
//! never counted or merged across chunk boundaries. Counts are kept exact
//! after every merge, which makes the result identical to recounting all
//! chunks from scratch each iteration.
//!
//! Time complexity: O(N log V) vs O(NV) for naive implementation.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet},
    ops::ControlFlow,
};

use crate::{
    chunker::Chunker,
    error::{ConfigError, TrainError},
    model_io::render_token,
    progress::progress_bar,
    stats::count_pairs_par,
    tokenizer::Tokenizer,
    types::{LEAF_COUNT, TextIdx, Token, TokenFreq, TokenPair},
    vocab::Vocabulary,
};

/// Node in doubly-linked list representing a token in the training corpus.
///
/// Links never cross a chunk boundary.
#[derive(Debug)]
struct Node {
    token: Token,
    prev_idx: Option<TextIdx>,
    next_idx: Option<TextIdx>,
}

/// Item in the max heap for tracking most frequent token pairs.
///
/// The heap may contain stale entries after merges, so frequencies
/// must be validated against `pair_freqs` before use.
#[derive(Debug, PartialEq, Eq)]
struct HeapItem {
    freq: TokenFreq,
    pair: TokenPair,
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Highest freq pair at top.
/// Ties go to the numerically greatest pair, compared left token first.
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.freq
            .cmp(&other.freq)
            .then_with(|| self.pair.cmp(&other.pair))
    }
}

/// Merge bookkeeping over all chunks of a corpus.
///
/// This uses a *Vec-as-arena* pattern to represent one linked list per
/// chunk. Nodes are stored in a `Vec<Option<Node>>`, where:
/// - The `Vec` provides stable indices for nodes
/// - Deletions are O(1) by setting entries to `None`
/// - Traversal is done via index-based left/right links inside `Node`
///
/// A merged token always keeps the index of its left half, so ascending
/// index order is left-to-right order within a chunk.
#[derive(Debug, Default)]
struct MergeArena {
    /// Storage arena for nodes. `None` represents a deleted node.
    nodes: Vec<Option<Node>>,

    /// Arena index of the first node of every non-empty chunk.
    heads: Vec<TextIdx>,

    /// Max heap of (frequency, pair). Contains stale entries.
    heap: BinaryHeap<HeapItem>,

    /// pair -> arena index of the first token of every occurrence.
    pair_positions: HashMap<TokenPair, HashSet<TextIdx>>,

    /// Source of truth for pair frequencies; only positive counts are kept.
    pair_freqs: HashMap<TokenPair, TokenFreq>,
}

impl MergeArena {
    /// Builds the arena from per-chunk token sequences.
    fn new(chunks: &[Vec<Token>]) -> Self {
        let total = chunks.iter().map(Vec::len).sum();
        let mut nodes = Vec::with_capacity(total);
        let mut heads = Vec::with_capacity(chunks.len());

        for chunk in chunks.iter().filter(|c| !c.is_empty()) {
            let start = nodes.len();
            let end = start + chunk.len();
            heads.push(start);
            for (offset, &token) in chunk.iter().enumerate() {
                let idx = start + offset;
                nodes.push(Some(Node {
                    token,
                    prev_idx: (idx > start).then(|| idx - 1),
                    next_idx: (idx + 1 < end).then_some(idx + 1),
                }));
            }
        }

        let mut arena = MergeArena {
            nodes,
            heads,
            ..Default::default()
        };
        arena.build_initial_pairs(chunks);
        arena
    }

    /// Counts pairs across all chunks in parallel, then records positions.
    fn build_initial_pairs(&mut self, chunks: &[Vec<Token>]) {
        self.pair_freqs = count_pairs_par(chunks);

        for idx in 0..self.nodes.len() {
            if let Some(node) = &self.nodes[idx]
                && let Some(next_idx) = node.next_idx
                && let Some(next_node) = &self.nodes[next_idx]
            {
                let pair = TokenPair(node.token, next_node.token);
                self.pair_positions.entry(pair).or_default().insert(idx);
            }
        }

        for (&pair, &freq) in &self.pair_freqs {
            self.heap.push(HeapItem { freq, pair });
        }
    }

    /// Removes and returns the most frequent pair with its current count.
    ///
    /// Stale entries whose count dropped are pushed back with the current
    /// count; pairs that no longer occur are discarded.
    fn pop_max_pair(&mut self) -> Option<(TokenPair, TokenFreq)> {
        while let Some(entry) = self.heap.pop() {
            match self.pair_freqs.get(&entry.pair) {
                Some(&freq) if freq == entry.freq => return Some((entry.pair, freq)),
                Some(&freq) if freq < entry.freq => self.heap.push(HeapItem {
                    freq,
                    pair: entry.pair,
                }),
                // A fresher entry exists, or the pair is gone.
                _ => {}
            }
        }
        None
    }

    /// Replaces every occurrence of `merge_pair` with `new_tok`.
    ///
    /// Occurrences are visited in ascending position, so within a chunk
    /// merging is left to right and never overlaps.
    fn apply_merge(&mut self, merge_pair: TokenPair, new_tok: Token) {
        let mut positions: Vec<TextIdx> = self
            .pair_positions
            .get(&merge_pair)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        positions.sort_unstable();

        for &pos in &positions {
            // Skip occurrences consumed by an overlapping merge.
            let (idx1, idx2) = match self.get_merge_idxs(merge_pair, pos) {
                ControlFlow::Continue(idxs) => idxs,
                ControlFlow::Break(_) => continue,
            };

            let cur_prev_idx = self.nodes[idx1].as_ref().and_then(|n| n.prev_idx);
            let new_next_idx = self.nodes[idx2].as_ref().and_then(|n| n.next_idx);

            // Old neighbour pairs out, merge, new neighbour pairs in.
            self.remove_neighbours(merge_pair, idx1, idx2);
            self.merge_pair_in_list(new_next_idx, new_tok, idx1, idx2);
            self.add_neighbours(new_tok, idx1, cur_prev_idx, new_next_idx);
        }

        // Un-track merged pair.
        self.pair_freqs.remove(&merge_pair);
        self.pair_positions.remove(&merge_pair);
    }

    /// Current token sequence of every non-empty chunk.
    fn get_encodings(&self) -> Vec<Vec<Token>> {
        self.heads
            .iter()
            .map(|&head| {
                let mut seq = Vec::new();
                let mut current = Some(head);
                while let Some(idx) = current {
                    let Some(node) = &self.nodes[idx] else {
                        break;
                    };
                    seq.push(node.token);
                    current = node.next_idx;
                }
                seq
            })
            .collect()
    }

    /// Decrements a pair occurrence; the linked list itself is untouched.
    fn remove_pair_at(&mut self, idx: TextIdx, pair: TokenPair) {
        if let Some(freq) = self.pair_freqs.get_mut(&pair) {
            *freq = freq.saturating_sub(1);
            if *freq == 0 {
                self.pair_freqs.remove(&pair);
            }
        }

        if let Some(pos_set) = self.pair_positions.get_mut(&pair) {
            pos_set.remove(&idx);
            if pos_set.is_empty() {
                self.pair_positions.remove(&pair);
            }
        }
    }

    /// Records a new pair occurrence; the linked list itself is untouched.
    fn add_pair_at(&mut self, idx: TextIdx, pair: TokenPair) {
        self.pair_positions.entry(pair).or_default().insert(idx);
        let freq = self.pair_freqs.entry(pair).or_insert(0);
        *freq += 1;

        self.heap.push(HeapItem { freq: *freq, pair });
    }

    fn add_neighbours(
        &mut self,
        new_tok: Token,
        idx1: TextIdx,
        cur_prev_idx: Option<TextIdx>,
        new_next_idx: Option<TextIdx>,
    ) {
        if let Some(prev_idx) = cur_prev_idx
            && let Some(prev_node) = &self.nodes[prev_idx]
        {
            // New left pair starts at the previous node.
            let new_pair = TokenPair(prev_node.token, new_tok);
            self.add_pair_at(prev_idx, new_pair);
        }

        if let Some(next_idx) = new_next_idx
            && let Some(next_node) = &self.nodes[next_idx]
        {
            // New right pair starts at the merged node.
            let new_pair = TokenPair(new_tok, next_node.token);
            self.add_pair_at(idx1, new_pair);
        }
    }

    fn merge_pair_in_list(
        &mut self,
        next_idx: Option<TextIdx>,
        tok_id: Token,
        idx1: TextIdx,
        idx2: TextIdx,
    ) {
        // First node of the pair now holds the merged token.
        if let Some(node) = &mut self.nodes[idx1] {
            node.token = tok_id;
            node.next_idx = next_idx;
        }

        if let Some(new_right_idx) = next_idx
            && let Some(new_right_node) = &mut self.nodes[new_right_idx]
        {
            new_right_node.prev_idx = Some(idx1);
        }

        // Second node is deleted; stale positions pointing here are skipped.
        self.nodes[idx2] = None;
    }

    /// Drops the pairs the merged tokens formed with their old neighbours.
    fn remove_neighbours(&mut self, merge_pair: TokenPair, idx1: TextIdx, idx2: TextIdx) {
        if let Some(prev_idx) = self.nodes[idx1].as_ref().and_then(|n| n.prev_idx)
            && let Some(prev_node) = &self.nodes[prev_idx]
        {
            // Old left pair started at the previous node.
            let old_pair = TokenPair(prev_node.token, merge_pair.0);
            self.remove_pair_at(prev_idx, old_pair);
        }

        if let Some(next_idx) = self.nodes[idx2].as_ref().and_then(|n| n.next_idx)
            && let Some(next_node) = &self.nodes[next_idx]
        {
            // Old right pair started at the second node of the merge.
            let old_pair = TokenPair(merge_pair.1, next_node.token);
            self.remove_pair_at(idx2, old_pair);
        }
    }

    /// Verifies that `pair` still starts at `pos` and returns both node indices.
    fn get_merge_idxs(&self, pair: TokenPair, pos: TextIdx) -> ControlFlow<(), (TextIdx, TextIdx)> {
        let idx1 = pos;
        // Deleted by a previous merge, or last node of its chunk.
        let Some(idx2) = self.nodes[idx1].as_ref().and_then(|n| n.next_idx) else {
            return ControlFlow::Break(());
        };

        let is_target = match (&self.nodes[idx1], &self.nodes[idx2]) {
            (Some(node1), Some(node2)) => node1.token == pair.0 && node2.token == pair.1,
            _ => false,
        };

        if !is_target {
            return ControlFlow::Break(());
        }

        ControlFlow::Continue((idx1, idx2))
    }
}

/// Learns merge rules from a text corpus.
///
/// # Example
///
/// ```
/// use bytebpe::{Chunker, Trainer};
///
/// let tokenizer = Trainer::new(259)
///     .with_chunker(Chunker::Whole)
///     .train("aaabdaaabac")
///     .expect("corpus supports three merges");
/// assert_eq!(tokenizer.vocabulary().num_merges(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Trainer {
    /// Target vocabulary size; must be >= 256.
    pub vocab_size: usize,

    /// Splits the corpus into chunks that merges never cross.
    pub chunker: Chunker,

    /// Log every learned merge at `info` level.
    pub verbose: bool,

    /// Draw a progress bar over the merge loop.
    pub show_progress: bool,
}

impl Trainer {
    /// Creates a trainer for `vocab_size` tokens that treats the corpus as one chunk.
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            chunker: Chunker::Whole,
            verbose: false,
            show_progress: false,
        }
    }

    /// Sets the chunker used to split the corpus.
    pub fn with_chunker(self, chunker: Chunker) -> Self {
        Self { chunker, ..self }
    }

    /// Sets whether every merge is logged.
    pub fn with_verbose(self, verbose: bool) -> Self {
        Self { verbose, ..self }
    }

    /// Sets whether a progress bar is drawn.
    pub fn with_progress(self, show_progress: bool) -> Self {
        Self {
            show_progress,
            ..self
        }
    }

    /// Trains a tokenizer on `text`.
    ///
    /// Learns exactly `vocab_size - 256` merges. Rule `i` mints id `256 + i`.
    ///
    /// # Errors
    ///
    /// Returns [`TrainError::Config`] if `vocab_size < 256`,
    /// [`TrainError::Exhausted`] if the corpus runs out of pairs first and
    /// [`TrainError::RegexMatch`] if chunking fails.
    pub fn train(&self, text: &str) -> Result<Tokenizer, TrainError> {
        let chunks = self.chunk_ids(text)?;
        let (vocab, _) = self.learn(&chunks)?;
        Ok(Tokenizer::from_parts(self.chunker.clone(), vocab))
    }

    fn num_merges(&self) -> Result<usize, ConfigError> {
        self.vocab_size
            .checked_sub(LEAF_COUNT)
            .ok_or(ConfigError::VocabSizeTooSmall(self.vocab_size))
    }

    /// Splits `text` and converts every chunk into leaf ids.
    fn chunk_ids(&self, text: &str) -> Result<Vec<Vec<Token>>, TrainError> {
        self.num_merges()?;

        let chunks = self.chunker.split(text).map_err(TrainError::RegexMatch)?;
        Ok(chunks
            .into_iter()
            .map(|chunk| chunk.bytes().map(Token::from).collect())
            .collect())
    }

    /// Runs the merge loop and returns the vocabulary together with the
    /// final token sequence of every non-empty chunk.
    fn learn(&self, chunks: &[Vec<Token>]) -> Result<(Vocabulary, Vec<Vec<Token>>), TrainError> {
        let num_merges = self.num_merges()?;

        log::info!(
            "Starting BPE training: {} merges over {} chunks",
            num_merges,
            chunks.len()
        );

        let pb = progress_bar(num_merges as u64, "Learning merges", self.show_progress)
            .map_err(TrainError::ProgressBarSetup)?;

        let mut arena = MergeArena::new(chunks);
        let mut vocab = Vocabulary::new();

        for i in 0..num_merges {
            let Some((pair, freq)) = arena.pop_max_pair() else {
                pb.abandon();
                return Err(TrainError::Exhausted {
                    requested: num_merges,
                    learned: i,
                });
            };

            let new_tok = vocab.append_merge(pair);
            arena.apply_merge(pair, new_tok);

            if self.verbose {
                let rendered = vocab
                    .token_bytes(new_tok)
                    .map(render_token)
                    .unwrap_or_default();
                log::info!(
                    "merge {}/{}: ({}, {}) -> {} ([{}]) had {} occurrences",
                    i + 1,
                    num_merges,
                    pair.0,
                    pair.1,
                    new_tok,
                    rendered,
                    freq
                );
            }
            pb.inc(1);
        }

        pb.finish();
        log::info!("Finished training: {} merges completed", num_merges);

        Ok((vocab, arena.get_encodings()))
    }
}
