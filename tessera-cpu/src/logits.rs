//! Host logits.

use tessera::{Logits, Result};

/// Logits already resident on the host, `[batch, vocab]`.
pub struct CpuLogits {
    data: Vec<f32>,
    vocab_size: usize,
    batch_size: usize,
}

impl CpuLogits {
    #[must_use]
    pub fn new(data: Vec<f32>, batch_size: usize, vocab_size: usize) -> Self {
        debug_assert_eq!(data.len(), batch_size * vocab_size);
        Self {
            data,
            vocab_size,
            batch_size,
        }
    }

    #[must_use]
    pub fn row(&self, batch_index: usize) -> &[f32] {
        let start = batch_index * self.vocab_size;
        &self.data[start..start + self.vocab_size]
    }
}

impl Logits for CpuLogits {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn to_host(&self) -> Result<Vec<f32>> {
        Ok(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows() {
        let logits = CpuLogits::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        assert_eq!(logits.batch_size(), 2);
        assert_eq!(logits.vocab_size(), 3);
        assert_eq!(logits.row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(logits.to_host().unwrap().len(), 6);
    }
}
