//! Pipeline stage trait and the batch layout it operates on

use crate::config::ModelConfig;
use crate::logits::Logits;
use crate::topology::RankCoordinate;
use crate::Result;

/// Hidden states for `rows` tokens, row-major `[rows, hidden]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Activations {
    pub rows: usize,
    pub hidden: usize,
    pub data: Vec<f32>,
}

impl Activations {
    #[must_use]
    pub fn zeros(rows: usize, hidden: usize) -> Self {
        Self {
            rows,
            hidden,
            data: vec![0.0; rows * hidden],
        }
    }

    #[must_use]
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.hidden..(r + 1) * self.hidden]
    }
}

/// Layout of one forward call: `num_seqs` sequences, each contributing
/// `query_len` consecutive tokens starting at position `start_pos`.
///
/// Prompts are right-padded to `padded_len`; cache positions in
/// `[input_lengths[s], padded_len)` hold padding and are never attended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionBatch {
    pub num_seqs: usize,
    pub query_len: usize,
    pub start_pos: usize,
    pub padded_len: usize,
    pub input_lengths: Vec<usize>,
}

impl AttentionBatch {
    /// Prefill over the whole padded prompt.
    #[must_use]
    pub fn prefill(padded_len: usize, input_lengths: Vec<usize>) -> Self {
        Self {
            num_seqs: input_lengths.len(),
            query_len: padded_len,
            start_pos: 0,
            padded_len,
            input_lengths,
        }
    }

    /// One new token per sequence at `position`.
    #[must_use]
    pub fn step(&self, position: usize) -> Self {
        Self {
            num_seqs: self.num_seqs,
            query_len: 1,
            start_pos: position,
            padded_len: self.padded_len,
            input_lengths: self.input_lengths.clone(),
        }
    }

    /// Total token rows in this call.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.num_seqs * self.query_len
    }

    /// Whether cache position `key` of sequence `seq` is visible from
    /// absolute position `query`.
    #[must_use]
    pub fn is_visible(&self, seq: usize, query: usize, key: usize) -> bool {
        key <= query && (key < self.input_lengths[seq] || key >= self.padded_len)
    }

    /// Row whose hidden state predicts the next token of `seq`: the last
    /// real prompt token during prefill, the single new token afterwards.
    #[must_use]
    pub fn logit_row(&self, seq: usize) -> usize {
        if self.start_pos == 0 {
            seq * self.query_len + self.input_lengths[seq] - 1
        } else {
            seq * self.query_len + self.query_len - 1
        }
    }
}

/// One rank's slice of the model: a contiguous layer range and a tensor
/// shard of every matrix in it.
///
/// Implementations own their tensor-parallel communicator and perform the
/// all-reduces inside `forward_layers`; pipeline hand-off is the caller's
/// job.
pub trait Model: Send {
    /// Incremental key/value storage for this stage's layers.
    type KvCache: Send;
    /// Logits produced by the last stage.
    type Logits: Logits;

    fn config(&self) -> &ModelConfig;

    fn coordinate(&self) -> RankCoordinate;

    /// Allocate cache storage for `num_seqs` sequences of up to `max_len`
    /// positions.
    ///
    /// # Errors
    /// Returns an error if allocation fails.
    fn allocate_kv_cache(&self, num_seqs: usize, max_len: usize) -> Result<Self::KvCache>;

    /// Whether `cache` can serve `num_seqs` sequences of `max_len`.
    fn kv_cache_fits(&self, cache: &Self::KvCache, num_seqs: usize, max_len: usize) -> bool;

    /// Forget all cached positions without releasing storage.
    fn reset_kv_cache(&self, cache: &mut Self::KvCache);

    /// Token and position embeddings. Only called on the first stage.
    ///
    /// # Errors
    /// Returns an error if a token id is out of range.
    fn embed(&self, tokens: &[u32], batch: &AttentionBatch) -> Result<Activations>;

    /// Run this stage's decoder layers, appending to the cache.
    ///
    /// # Errors
    /// Returns device or communication errors.
    fn forward_layers(
        &self,
        hidden: Activations,
        batch: &AttentionBatch,
        cache: &mut Self::KvCache,
    ) -> Result<Activations>;

    /// Final norm and vocabulary projection over each sequence's logit row.
    /// Only called on the last stage.
    ///
    /// # Errors
    /// Returns device or communication errors.
    fn lm_head(&self, hidden: &Activations, batch: &AttentionBatch) -> Result<Self::Logits>;

    /// Permute cached sequences so that new sequence `i` continues old
    /// sequence `parents[i]`.
    ///
    /// # Errors
    /// Returns an error if `parents` is malformed.
    fn reorder_kv_cache(&self, cache: &mut Self::KvCache, parents: &[usize]) -> Result<()>;

    /// Called once at the end of every invocation. Backends release
    /// scratch memory here.
    fn end_invocation(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_masks_padding() {
        let batch = AttentionBatch::prefill(4, vec![4, 2]);
        assert!(batch.is_visible(1, 3, 1));
        assert!(!batch.is_visible(1, 3, 2));
        assert!(!batch.is_visible(1, 3, 3));
        assert!(!batch.is_visible(0, 1, 2));

        let step = batch.step(4);
        assert!(step.is_visible(1, 4, 4));
        assert!(step.is_visible(1, 4, 0));
        assert!(!step.is_visible(1, 4, 3));
    }

    #[test]
    fn test_logit_rows() {
        let batch = AttentionBatch::prefill(4, vec![4, 2]);
        assert_eq!(batch.rows(), 8);
        assert_eq!(batch.logit_row(0), 3);
        assert_eq!(batch.logit_row(1), 5);

        let step = batch.step(5);
        assert_eq!(step.rows(), 2);
        assert_eq!(step.logit_row(1), 1);
    }
}
