//! Key/value cache arena
//!
//! One preallocated block per stage laid out `[layer][seq][pos][width]`.
//! Positions are appended in lockstep for every sequence during an
//! invocation; `reset` forgets them without releasing storage.

use tessera::{Error, Result};

pub struct KvArena {
    layers: usize,
    num_seqs: usize,
    capacity: usize,
    width: usize,
    keys: Vec<f32>,
    values: Vec<f32>,
    len: usize,
}

impl KvArena {
    #[must_use]
    pub fn new(layers: usize, num_seqs: usize, capacity: usize, width: usize) -> Self {
        let total = layers * num_seqs * capacity * width;
        Self {
            layers,
            num_seqs,
            capacity,
            width,
            keys: vec![0.0; total],
            values: vec![0.0; total],
            len: 0,
        }
    }

    #[must_use]
    pub fn num_seqs(&self) -> usize {
        self.num_seqs
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Positions committed so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this arena can hold `num_seqs` sequences of `capacity`.
    /// A larger arena is reused with a different stride, so the sequence
    /// count must match exactly.
    #[must_use]
    pub fn fits(&self, num_seqs: usize, capacity: usize) -> bool {
        self.num_seqs == num_seqs && self.capacity >= capacity
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        (self.keys.len() + self.values.len()) * std::mem::size_of::<f32>()
    }

    fn offset(&self, layer: usize, seq: usize, pos: usize) -> usize {
        ((layer * self.num_seqs + seq) * self.capacity + pos) * self.width
    }

    /// Store one position's key and value.
    ///
    /// # Errors
    /// Returns `DeviceExecution` if the position is outside the arena.
    pub fn write(&mut self, layer: usize, seq: usize, pos: usize, key: &[f32], value: &[f32]) -> Result<()> {
        if layer >= self.layers || seq >= self.num_seqs || pos >= self.capacity {
            return Err(Error::DeviceExecution(format!(
                "KV write out of bounds: layer {layer}, seq {seq}, pos {pos} (capacity {})",
                self.capacity
            )));
        }
        let at = self.offset(layer, seq, pos);
        self.keys[at..at + self.width].copy_from_slice(key);
        self.values[at..at + self.width].copy_from_slice(value);
        Ok(())
    }

    /// Keys of `seq` in `layer` for positions `0..upto`, `[upto, width]`.
    #[must_use]
    pub fn keys(&self, layer: usize, seq: usize, upto: usize) -> &[f32] {
        let at = self.offset(layer, seq, 0);
        &self.keys[at..at + upto * self.width]
    }

    #[must_use]
    pub fn values(&self, layer: usize, seq: usize, upto: usize) -> &[f32] {
        let at = self.offset(layer, seq, 0);
        &self.values[at..at + upto * self.width]
    }

    /// Mark positions `..end` as filled.
    pub fn commit(&mut self, end: usize) {
        self.len = self.len.max(end.min(self.capacity));
    }

    /// Sequence `i` continues former sequence `parents[i]`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if `parents` has the wrong length or an
    /// out-of-range entry.
    pub fn reorder(&mut self, parents: &[usize]) -> Result<()> {
        if parents.len() != self.num_seqs || parents.iter().any(|&p| p >= self.num_seqs) {
            return Err(Error::InvalidConfig(format!(
                "bad beam parents {parents:?} for {} sequences",
                self.num_seqs
            )));
        }
        if parents.iter().enumerate().all(|(i, &p)| i == p) {
            return Ok(());
        }
        let span = self.len * self.width;
        for layer in 0..self.layers {
            for buf in [&mut self.keys, &mut self.values] {
                let base = layer * self.num_seqs * self.capacity * self.width;
                let snapshot: Vec<Vec<f32>> = (0..self.num_seqs)
                    .map(|s| {
                        let at = base + s * self.capacity * self.width;
                        buf[at..at + span].to_vec()
                    })
                    .collect();
                for (seq, &parent) in parents.iter().enumerate() {
                    let at = base + seq * self.capacity * self.width;
                    buf[at..at + span].copy_from_slice(&snapshot[parent]);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read() {
        let mut arena = KvArena::new(2, 2, 4, 3);
        arena.write(1, 1, 2, &[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap();
        arena.commit(3);
        assert_eq!(arena.len(), 3);
        assert_eq!(&arena.keys(1, 1, 3)[6..], &[1.0, 2.0, 3.0]);
        assert_eq!(&arena.values(1, 1, 3)[6..], &[4.0, 5.0, 6.0]);
        assert_eq!(arena.keys(0, 1, 3), &[0.0; 9]);
        assert_eq!(arena.size_in_bytes(), 2 * 2 * 2 * 4 * 3 * 4);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut arena = KvArena::new(1, 1, 2, 1);
        assert!(arena.write(0, 0, 2, &[0.0], &[0.0]).is_err());
        assert!(arena.write(0, 1, 0, &[0.0], &[0.0]).is_err());
    }

    #[test]
    fn test_reorder() {
        let mut arena = KvArena::new(1, 3, 2, 1);
        for seq in 0..3 {
            let v = seq as f32;
            arena.write(0, seq, 0, &[v], &[v * 10.0]).unwrap();
        }
        arena.commit(1);
        arena.reorder(&[2, 2, 0]).unwrap();
        assert_eq!(arena.keys(0, 0, 1), &[2.0]);
        assert_eq!(arena.keys(0, 1, 1), &[2.0]);
        assert_eq!(arena.values(0, 2, 1), &[0.0]);
        assert!(arena.reorder(&[0, 1]).is_err());
        assert!(arena.reorder(&[0, 1, 3]).is_err());
    }

    #[test]
    fn test_reset_keeps_storage() {
        let mut arena = KvArena::new(1, 2, 8, 4);
        arena.commit(5);
        arena.reset();
        assert!(arena.is_empty());
        assert!(arena.fits(2, 8));
        assert!(!arena.fits(2, 9));
        assert!(!arena.fits(1, 4));
    }
}
