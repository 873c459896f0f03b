//! Pair statistics and the merge applier.
//!
//! These are the two primitives every BPE loop is built from: counting
//! adjacent pairs and replacing one pair with a freshly minted token.
//!
//! [`merge`] is the reference applier: the trainer's linked-list merges and
//! `Vocabulary::encode_chunk` are checked against it and must agree.

use rayon::prelude::*;

use crate::types::{PairCounts, Token, TokenPair};

/// Adds the adjacent pair counts of `ids` into `counts`.
///
/// Existing counts are incremented rather than overwritten, so the same
/// counter can be threaded through many sequences. A sequence shorter than
/// two tokens contributes nothing.
pub fn count_pairs(ids: &[Token], counts: &mut PairCounts) {
    for window in ids.windows(2) {
        *counts.entry(TokenPair(window[0], window[1])).or_insert(0) += 1;
    }
}

/// Counts adjacent pairs across independent sequences on Rayon workers.
///
/// Each worker folds into its own counter; counters are summed in a single
/// reduction, so no map is shared between threads.
pub fn count_pairs_par<S>(seqs: &[S]) -> PairCounts
where
    S: AsRef<[Token]> + Sync,
{
    seqs.par_iter()
        .fold(PairCounts::new, |mut counts, seq| {
            count_pairs(seq.as_ref(), &mut counts);
            counts
        })
        .reduce(PairCounts::new, merge_counts)
}

/// Sums two counters, draining the smaller into the larger.
fn merge_counts(a: PairCounts, b: PairCounts) -> PairCounts {
    let (mut into, from) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    for (pair, freq) in from {
        *into.entry(pair).or_insert(0) += freq;
    }
    into
}

/// Replaces every non-overlapping occurrence of `pair` in `ids` with `new_tok`.
///
/// Scanning is a single left-to-right pass: once a match is consumed the
/// scan resumes right after it, so `[a, a, b]` merged on `(a, b)` gives
/// `[a, new_tok]` and `[a, a, a]` merged on `(a, a)` gives `[new_tok, a]`.
pub fn merge(ids: &[Token], pair: TokenPair, new_tok: Token) -> Vec<Token> {
    if ids.len() < 2 {
        return ids.to_vec();
    }

    let mut merged = Vec::with_capacity(ids.len());
    let mut i = 0;
    while i < ids.len() {
        if i + 1 < ids.len() && ids[i] == pair.0 && ids[i + 1] == pair.1 {
            merged.push(new_tok);
            i += 2;
        } else {
            merged.push(ids[i]);
            i += 1;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_pairs_single_sequence() {
        let mut counts = PairCounts::new();
        count_pairs(&[1, 2, 3, 1, 2], &mut counts);

        assert_eq!(counts.len(), 3);
        assert_eq!(counts[&TokenPair(1, 2)], 2);
        assert_eq!(counts[&TokenPair(2, 3)], 1);
        assert_eq!(counts[&TokenPair(3, 1)], 1);
    }

    #[test]
    fn test_count_pairs_accumulates() {
        let mut counts = PairCounts::new();
        count_pairs(&[1, 2], &mut counts);
        count_pairs(&[1, 2, 1, 2], &mut counts);

        assert_eq!(counts[&TokenPair(1, 2)], 3);
        assert_eq!(counts[&TokenPair(2, 1)], 1);
    }

    #[test]
    fn test_count_pairs_overlapping() {
        let mut counts = PairCounts::new();
        count_pairs(&[7, 7, 7], &mut counts);
        assert_eq!(counts[&TokenPair(7, 7)], 2);
    }

    #[test]
    fn test_count_pairs_short_sequences() {
        let mut counts = PairCounts::new();
        count_pairs(&[], &mut counts);
        count_pairs(&[5], &mut counts);
        assert!(counts.is_empty());
    }

    #[test]
    fn test_count_pairs_par_matches_sequential() {
        let seqs: Vec<Vec<Token>> = vec![vec![1, 2, 3], vec![], vec![2, 3, 2, 3], vec![9]];

        let mut expected = PairCounts::new();
        for seq in &seqs {
            count_pairs(seq, &mut expected);
        }

        assert_eq!(count_pairs_par(&seqs), expected);
    }

    #[test]
    fn test_count_pairs_par_no_cross_sequence_pairs() {
        let seqs = [vec![1, 2], vec![3, 4]];
        let counts = count_pairs_par(&seqs);
        assert!(!counts.contains_key(&TokenPair(2, 3)));
    }

    #[test]
    fn test_merge_replaces_all_occurrences() {
        assert_eq!(merge(&[1, 2, 3, 1, 2], TokenPair(1, 2), 4), vec![4, 3, 4]);
    }

    #[test]
    fn test_merge_left_to_right_no_overlap() {
        let (a, b, n) = (97, 98, 256);
        assert_eq!(merge(&[a, a, b], TokenPair(a, b), n), vec![a, n]);
        assert_eq!(merge(&[a, a, a], TokenPair(a, a), n), vec![n, a]);
        assert_eq!(merge(&[a, a, a, a], TokenPair(a, a), n), vec![n, n]);
    }

    #[test]
    fn test_merge_short_sequences_unchanged() {
        assert_eq!(merge(&[], TokenPair(1, 2), 3), Vec::<Token>::new());
        assert_eq!(merge(&[1], TokenPair(1, 2), 3), vec![1]);
    }

    #[test]
    fn test_merge_absent_pair() {
        assert_eq!(merge(&[2, 1, 2], TokenPair(1, 1), 3), vec![2, 1, 2]);
    }
}
