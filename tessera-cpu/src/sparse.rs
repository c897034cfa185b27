//! 2:4 structured sparsity
//!
//! Each group of four consecutive input positions keeps its two
//! largest-magnitude values. The two kept positions are packed into one
//! metadata byte as `first | second << 2`, with `first < second`.

use tessera::{Error, Result};

/// Choose kept elements of a row-major `[n, k]` matrix.
///
/// Returns flat indices of the kept values in storage order and one
/// metadata byte per group.
///
/// # Errors
/// Returns `InvalidConfig` if `k` is not a multiple of four.
pub fn select_2_4(values: &[f32], n: usize, k: usize) -> Result<(Vec<usize>, Vec<u8>)> {
    if k % 4 != 0 {
        return Err(Error::InvalidConfig(format!(
            "2:4 sparsity needs K divisible by 4, got {k}"
        )));
    }
    let groups = n * k / 4;
    let mut kept = Vec::with_capacity(groups * 2);
    let mut meta = Vec::with_capacity(groups);
    for g in 0..groups {
        let base = g * 4;
        let group = &values[base..base + 4];
        let mut order = [0usize, 1, 2, 3];
        // Stable: ties keep the lower position.
        order.sort_by(|&a, &b| group[b].abs().total_cmp(&group[a].abs()));
        let (lo, hi) = if order[0] < order[1] {
            (order[0], order[1])
        } else {
            (order[1], order[0])
        };
        kept.push(base + lo);
        kept.push(base + hi);
        #[allow(clippy::cast_possible_truncation)]
        meta.push((lo | (hi << 2)) as u8);
    }
    Ok((kept, meta))
}

/// Positions within its group of the two values described by `meta`.
#[must_use]
pub fn positions(meta: u8) -> (usize, usize) {
    (usize::from(meta & 0b11), usize::from((meta >> 2) & 0b11))
}

/// Scatter compressed values back into a dense `[n, k]` matrix.
#[must_use]
pub fn expand_2_4(kept: &[f32], meta: &[u8], n: usize, k: usize) -> Vec<f32> {
    let mut dense = vec![0.0f32; n * k];
    for (g, &m) in meta.iter().enumerate() {
        let (lo, hi) = positions(m);
        dense[g * 4 + lo] = kept[g * 2];
        dense[g * 4 + hi] = kept[g * 2 + 1];
    }
    dense
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_two_largest() {
        let values = [0.1, -3.0, 2.0, 0.5, 1.0, 1.0, 1.0, 1.0];
        let (kept, meta) = select_2_4(&values, 1, 8).unwrap();
        assert_eq!(kept, vec![1, 2, 4, 5]);
        assert_eq!(positions(meta[0]), (1, 2));
        assert_eq!(positions(meta[1]), (0, 1));
    }

    #[test]
    fn test_expand_roundtrip_shape() {
        let values = [4.0, 0.0, 0.0, -5.0];
        let (kept, meta) = select_2_4(&values, 1, 4).unwrap();
        let compressed: Vec<f32> = kept.iter().map(|&i| values[i]).collect();
        assert_eq!(expand_2_4(&compressed, &meta, 1, 4), values.to_vec());
    }

    #[test]
    fn test_rejects_ragged_k() {
        assert!(select_2_4(&[1.0; 6], 1, 6).is_err());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_pruned_groups_keep_largest(
                values in proptest::collection::vec(-10.0f32..10.0, 16)
            ) {
                let (kept, meta) = select_2_4(&values, 2, 8).unwrap();
                let compressed: Vec<f32> = kept.iter().map(|&i| values[i]).collect();
                let dense = expand_2_4(&compressed, &meta, 2, 8);
                for (group, pruned) in values.chunks(4).zip(dense.chunks(4)) {
                    let zeros = pruned.iter().filter(|v| **v == 0.0).count();
                    prop_assert!(zeros >= 2);
                    let min_kept = pruned
                        .iter()
                        .zip(group)
                        .filter(|(p, _)| **p != 0.0)
                        .map(|(_, g)| g.abs())
                        .fold(f32::INFINITY, f32::min);
                    let max_dropped = pruned
                        .iter()
                        .zip(group)
                        .filter(|(p, _)| **p == 0.0)
                        .map(|(_, g)| g.abs())
                        .fold(0.0f32, f32::max);
                    prop_assert!(min_kept == f32::INFINITY || min_kept >= max_dropped);
                }
            }
        }
    }
}
