//! Opaque logits trait for backend-agnostic token selection.

use crate::Result;

/// Logits from the final pipeline stage, one row per live sequence.
///
/// The decode loop owns selection policy; backends only have to expose
/// the values on the host.
pub trait Logits: Send {
    /// Vocabulary size (number of logit values per sequence).
    fn vocab_size(&self) -> usize;

    /// Number of sequences in this batch.
    fn batch_size(&self) -> usize;

    /// Copy all rows to host memory as `[batch, vocab]`.
    ///
    /// # Errors
    /// Returns an error if the transfer fails.
    fn to_host(&self) -> Result<Vec<f32>>;
}
