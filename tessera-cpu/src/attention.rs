//! Masked multi-head attention over the KV arena.

use rayon::prelude::*;
use tessera::{AttentionBatch, Result};

use crate::kv_cache::KvArena;
use crate::ops::dot;

/// Head layout of this rank's attention shard.
#[derive(Debug, Clone, Copy)]
pub struct HeadLayout {
    pub num_heads: usize,
    pub head_dim: usize,
}

impl HeadLayout {
    #[must_use]
    pub fn width(&self) -> usize {
        self.num_heads * self.head_dim
    }
}

/// Append the keys and values in `qkv` to `arena`, then attend every query
/// row to the visible positions of its sequence.
///
/// `qkv` is `[rows, 3, width]` (query, key, value per row); the result is
/// `[rows, width]`. A query with no visible key yields zeros.
pub fn masked_attention(
    qkv: &[f32],
    batch: &AttentionBatch,
    arena: &mut KvArena,
    layer: usize,
    heads: HeadLayout,
) -> Result<Vec<f32>> {
    let width = heads.width();
    let stride = 3 * width;
    for seq in 0..batch.num_seqs {
        for i in 0..batch.query_len {
            let row = &qkv[(seq * batch.query_len + i) * stride..][..stride];
            arena.write(
                layer,
                seq,
                batch.start_pos + i,
                &row[width..2 * width],
                &row[2 * width..],
            )?;
        }
    }

    let kv_len = batch.start_pos + batch.query_len;
    let scale = 1.0 / (heads.head_dim as f32).sqrt();
    let arena = &*arena;
    let mut output = vec![0.0f32; batch.rows() * width];
    output
        .par_chunks_mut(batch.query_len * width)
        .enumerate()
        .for_each(|(seq, out)| {
            let keys = arena.keys(layer, seq, kv_len);
            let values = arena.values(layer, seq, kv_len);
            let mut scores = vec![0.0f32; kv_len];
            for i in 0..batch.query_len {
                let query_pos = batch.start_pos + i;
                let q_row = &qkv[(seq * batch.query_len + i) * stride..][..width];
                let o_row = &mut out[i * width..(i + 1) * width];
                for h in 0..heads.num_heads {
                    let span = h * heads.head_dim..(h + 1) * heads.head_dim;
                    let q_vec = &q_row[span.clone()];

                    for (pos, score) in scores.iter_mut().enumerate() {
                        *score = if batch.is_visible(seq, query_pos, pos) {
                            dot(q_vec, &keys[pos * width..][span.clone()]) * scale
                        } else {
                            f32::NEG_INFINITY
                        };
                    }

                    let max_score = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    if max_score == f32::NEG_INFINITY {
                        continue;
                    }
                    let mut sum = 0.0f32;
                    for score in &mut scores {
                        *score = (*score - max_score).exp();
                        sum += *score;
                    }

                    let o_vec = &mut o_row[span.clone()];
                    for (pos, &score) in scores.iter().enumerate() {
                        if score > 0.0 {
                            let weight = score / sum;
                            let v_vec = &values[pos * width..][span.clone()];
                            for (o, v) in o_vec.iter_mut().zip(v_vec) {
                                *o += weight * v;
                            }
                        }
                    }
                }
            }
        });
    Ok(output)
}
