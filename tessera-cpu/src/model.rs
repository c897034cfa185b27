//! GPT decoder stage on the host backend
//!
//! Pre-norm GPT block: `x += attn(ln_1(x))`, `x += mlp(ln_2(x))` with a
//! GELU MLP and learned position embeddings. The fused QKV and FFN up
//! projections are column-sharded; the attention output and FFN down
//! projections are row-sharded and summed over the tensor group before
//! their (replicated) bias is added.

use std::sync::Arc;

use tessera::{
    Activations, AttentionBatch, Communicator, Error, Model, ModelConfig, RankCoordinate, Result,
};
use tracing::{debug, info};

use crate::attention::{masked_attention, HeadLayout};
use crate::context::ExecutionContext;
use crate::kv_cache::KvArena;
use crate::logits::CpuLogits;
use crate::matmul::MatmulEngine;
use crate::ops::{add_bias, add_inplace, gelu_inplace, layer_norm};
use crate::weights::{GptWeights, LayerWeights, LayoutState, Linear, Norm, WeightSource};

/// One rank's slice of a GPT model.
pub struct GptStage<C> {
    config: ModelConfig,
    coordinate: RankCoordinate,
    weights: GptWeights,
    engine: MatmulEngine,
    tensor_comm: C,
    heads: HeadLayout,
}

impl<C: Communicator> GptStage<C> {
    /// Wrap already transposed weights.
    ///
    /// # Errors
    /// `LayoutState` if the weights are still in checkpoint layout,
    /// `InvalidTopology` if `tensor_comm` does not match `coordinate`.
    pub fn new(
        config: ModelConfig,
        coordinate: RankCoordinate,
        weights: GptWeights,
        engine: MatmulEngine,
        tensor_comm: C,
    ) -> Result<Self> {
        if weights.state() == LayoutState::Loaded {
            return Err(Error::LayoutState(
                "stage needs weights in inference layout".into(),
            ));
        }
        if tensor_comm.world_size() != coordinate.tensor_parallel_size
            || tensor_comm.rank() != coordinate.tensor_parallel_rank
        {
            return Err(Error::InvalidTopology(format!(
                "tensor communicator is rank {} of {}, coordinate expects {} of {}",
                tensor_comm.rank(),
                tensor_comm.world_size(),
                coordinate.tensor_parallel_rank,
                coordinate.tensor_parallel_size
            )));
        }
        let heads = HeadLayout {
            num_heads: config.head_num / coordinate.tensor_parallel_size,
            head_dim: config.size_per_head,
        };
        Ok(Self {
            config,
            coordinate,
            weights,
            engine,
            tensor_comm,
            heads,
        })
    }

    /// Validate the grid against the model, load this rank's shard from
    /// `source`, transpose it, and 2:4-compress it if the model is sparse.
    ///
    /// # Errors
    /// Topology, weight-source or layout errors.
    pub fn load(
        config: ModelConfig,
        coordinate: RankCoordinate,
        engine: MatmulEngine,
        tensor_comm: C,
        source: &dyn WeightSource,
    ) -> Result<Self> {
        let mut weights =
            GptWeights::load_shard(&config, &coordinate, source)?.transpose_for_inference()?;
        if config.sparse {
            weights = weights.compress_for_sparsity(&engine)?;
        }
        info!(
            rank = coordinate.global_rank,
            device = engine.context().ordinal(),
            layers = weights.layers.len(),
            weight_bytes = weights.size_in_bytes(),
            precision = ?engine.profile(),
            sparse = config.sparse,
            "stage ready"
        );
        Self::new(config, coordinate, weights, engine, tensor_comm)
    }

    #[must_use]
    pub fn weights(&self) -> &GptWeights {
        &self.weights
    }

    #[must_use]
    pub fn engine(&self) -> &MatmulEngine {
        &self.engine
    }

    fn context(&self) -> &Arc<ExecutionContext> {
        self.engine.context()
    }

    /// Run `op` on this rank's stream. Closures must not capture the stage
    /// itself: the tensor communicator is not `Sync`.
    fn on_stream<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.context().install(op)
    }

    fn norm(&self, x: &[f32], norm: &Norm) -> Vec<f32> {
        let mut out = self.context().buffers().acquire(x.len());
        let eps = self.config.layernorm_eps;
        self.on_stream(|| layer_norm(x, &norm.gamma, &norm.beta, eps, &mut out));
        out
    }

    fn linear(&self, x: &[f32], rows: usize, weight: &Linear) -> Result<Vec<f32>> {
        self.engine.gemm(x, rows, weight.matrix()?)
    }

    /// Row-parallel projection: partial product, tensor-group sum, bias.
    fn linear_reduced(
        &self,
        x: &[f32],
        rows: usize,
        weight: &Linear,
        bias: &[f32],
    ) -> Result<Vec<f32>> {
        let mut out = self.linear(x, rows, weight)?;
        self.tensor_comm.all_reduce_sum_inplace(&mut out)?;
        self.on_stream(|| add_bias(&mut out, bias));
        Ok(out)
    }

    fn forward_layer(
        &self,
        hidden: &mut [f32],
        layer: &LayerWeights,
        index: usize,
        batch: &AttentionBatch,
        cache: &mut KvArena,
    ) -> Result<()> {
        let rows = batch.rows();
        let pool = self.context().buffers();
        let heads = self.heads;

        let normed = self.norm(hidden, &layer.ln_1);
        let mut qkv = self.linear(&normed, rows, &layer.qkv)?;
        pool.release(normed);
        let attn = self.on_stream(|| {
            add_bias(&mut qkv, &layer.qkv_bias);
            masked_attention(&qkv, batch, cache, index, heads)
        })?;
        pool.release(qkv);
        let out = self.linear_reduced(&attn, rows, &layer.attn_out, &layer.attn_out_bias)?;
        self.on_stream(|| add_inplace(hidden, &out));
        pool.release(out);

        let normed = self.norm(hidden, &layer.ln_2);
        let mut up = self.linear(&normed, rows, &layer.fc1)?;
        pool.release(normed);
        self.on_stream(|| {
            add_bias(&mut up, &layer.fc1_bias);
            gelu_inplace(&mut up);
        });
        let out = self.linear_reduced(&up, rows, &layer.fc2, &layer.fc2_bias)?;
        pool.release(up);
        self.on_stream(|| add_inplace(hidden, &out));
        pool.release(out);
        Ok(())
    }
}

impl<C: Communicator> Model for GptStage<C> {
    type KvCache = KvArena;
    type Logits = CpuLogits;

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn coordinate(&self) -> RankCoordinate {
        self.coordinate
    }

    fn allocate_kv_cache(&self, num_seqs: usize, max_len: usize) -> Result<KvArena> {
        let arena = KvArena::new(self.weights.layers.len(), num_seqs, max_len, self.heads.width());
        info!(
            rank = self.coordinate.global_rank,
            num_seqs,
            max_len,
            bytes = arena.size_in_bytes(),
            "allocated KV arena"
        );
        Ok(arena)
    }

    fn kv_cache_fits(&self, cache: &KvArena, num_seqs: usize, max_len: usize) -> bool {
        cache.fits(num_seqs, max_len)
    }

    fn reset_kv_cache(&self, cache: &mut KvArena) {
        cache.reset();
    }

    fn embed(&self, tokens: &[u32], batch: &AttentionBatch) -> Result<Activations> {
        let embeddings = self.weights.embeddings.as_ref().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "rank {} is not the first pipeline stage and holds no embeddings",
                self.coordinate.global_rank
            ))
        })?;
        if tokens.len() != batch.rows() {
            return Err(Error::ShapeMismatch {
                key: "tokens".into(),
                expected: format!("[{}]", batch.rows()),
                got: vec![tokens.len()],
            });
        }
        if batch.start_pos + batch.query_len > self.config.max_seq_len {
            return Err(Error::SequenceTooLong {
                total: batch.start_pos + batch.query_len,
                max_seq_len: self.config.max_seq_len,
            });
        }
        let hidden = self.config.hidden_size();
        let mut out = Activations::zeros(tokens.len(), hidden);
        for (row, (&token, dst)) in tokens.iter().zip(out.data.chunks_mut(hidden)).enumerate() {
            let token = token as usize;
            if token >= self.config.vocab_size {
                return Err(Error::InvalidConfig(format!(
                    "token id {token} out of range for vocab_size {}",
                    self.config.vocab_size
                )));
            }
            let pos = batch.start_pos + row % batch.query_len;
            let wte = &embeddings.wte[token * hidden..(token + 1) * hidden];
            let wpe = &embeddings.wpe[pos * hidden..(pos + 1) * hidden];
            for ((d, t), p) in dst.iter_mut().zip(wte).zip(wpe) {
                *d = t + p;
            }
        }
        Ok(out)
    }

    fn forward_layers(
        &self,
        mut hidden: Activations,
        batch: &AttentionBatch,
        cache: &mut KvArena,
    ) -> Result<Activations> {
        if hidden.rows != batch.rows() || hidden.hidden != self.config.hidden_size() {
            return Err(Error::ShapeMismatch {
                key: "hidden".into(),
                expected: format!("[{}, {}]", batch.rows(), self.config.hidden_size()),
                got: vec![hidden.rows, hidden.hidden],
            });
        }
        let end = batch.start_pos + batch.query_len;
        if end > cache.capacity() {
            return Err(Error::DeviceExecution(format!(
                "KV arena holds {} positions, step needs {end}",
                cache.capacity()
            )));
        }
        for (index, layer) in self.weights.layers.iter().enumerate() {
            self.forward_layer(&mut hidden.data, layer, index, batch, cache)?;
        }
        cache.commit(end);
        debug!(
            rank = self.coordinate.global_rank,
            start = batch.start_pos,
            rows = batch.rows(),
            "stage forward"
        );
        Ok(hidden)
    }

    fn lm_head(&self, hidden: &Activations, batch: &AttentionBatch) -> Result<CpuLogits> {
        let head = self.weights.head.as_ref().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "rank {} is not the last pipeline stage and holds no LM head",
                self.coordinate.global_rank
            ))
        })?;
        let seqs = batch.num_seqs;
        let rows: Vec<f32> = (0..seqs)
            .flat_map(|s| hidden.row(batch.logit_row(s)).iter().copied())
            .collect();
        let normed = self.norm(&rows, &head.norm);
        let local = self.linear(&normed, seqs, &head.lm_head)?;
        self.context().buffers().release(normed);

        let vocab = self.config.vocab_size;
        if !head.vocab_sharded {
            return Ok(CpuLogits::new(local, seqs, vocab));
        }
        let gathered = self.tensor_comm.all_gather(&local)?;
        self.context().buffers().release(local);
        // [rank][seq][slice] -> [seq][vocab]
        let tp = self.tensor_comm.world_size();
        let slice = vocab / tp;
        let mut data = vec![0.0f32; seqs * vocab];
        for r in 0..tp {
            for s in 0..seqs {
                let src = &gathered[(r * seqs + s) * slice..][..slice];
                data[s * vocab + r * slice..][..slice].copy_from_slice(src);
            }
        }
        Ok(CpuLogits::new(data, seqs, vocab))
    }

    fn reorder_kv_cache(&self, cache: &mut KvArena, parents: &[usize]) -> Result<()> {
        cache.reorder(parents)
    }

    fn end_invocation(&self) {
        self.context().buffers().clear();
    }
}

#[cfg(test)]
mod tests {
    use tessera::Logits;

    use super::*;
    use crate::collective::LocalComm;
    use crate::weights::RandomWeights;

    fn tiny_config() -> ModelConfig {
        ModelConfig::from_json(
            r#"{"head_num": 2, "size_per_head": 4, "vocab_size": 12,
                "decoder_layers": 2, "max_seq_len": 16, "start_id": 0, "end_id": 11}"#,
        )
        .unwrap()
    }

    fn stage(config: ModelConfig) -> GptStage<LocalComm> {
        let ctx = ExecutionContext::new(0, 2).unwrap();
        let engine = MatmulEngine::new(ctx, config.precision);
        GptStage::load(
            config,
            RankCoordinate::single(),
            engine,
            LocalComm::solo(),
            &RandomWeights::new(3),
        )
        .unwrap()
    }

    #[test]
    fn test_prefill_then_step_matches_full_prefill() {
        let stage = stage(tiny_config());
        let tokens = [1u32, 5, 7];

        // Whole sequence in one prefill.
        let full = AttentionBatch::prefill(3, vec![3]);
        let mut cache = stage.allocate_kv_cache(1, 8).unwrap();
        let h = stage.embed(&tokens, &full).unwrap();
        let h = stage.forward_layers(h, &full, &mut cache).unwrap();
        let expected = stage.lm_head(&h, &full).unwrap().to_host().unwrap();

        // Prefill two tokens, then one incremental step.
        let prefix = AttentionBatch::prefill(2, vec![2]);
        stage.reset_kv_cache(&mut cache);
        let h = stage.embed(&tokens[..2], &prefix).unwrap();
        stage.forward_layers(h, &prefix, &mut cache).unwrap();
        let step = prefix.step(2);
        let h = stage.embed(&tokens[2..], &step).unwrap();
        let h = stage.forward_layers(h, &step, &mut cache).unwrap();
        let got = stage.lm_head(&h, &step).unwrap().to_host().unwrap();

        assert_eq!(got.len(), 12);
        for (a, b) in got.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_padding_does_not_change_logits() {
        let stage = stage(tiny_config());
        let short = AttentionBatch::prefill(2, vec![2]);
        let mut cache = stage.allocate_kv_cache(1, 8).unwrap();
        let h = stage.embed(&[3, 4], &short).unwrap();
        let h = stage.forward_layers(h, &short, &mut cache).unwrap();
        let a = stage.lm_head(&h, &short).unwrap().to_host().unwrap();

        let padded = AttentionBatch::prefill(4, vec![2]);
        stage.reset_kv_cache(&mut cache);
        let h = stage.embed(&[3, 4, 11, 11], &padded).unwrap();
        let h = stage.forward_layers(h, &padded, &mut cache).unwrap();
        let b = stage.lm_head(&h, &padded).unwrap().to_host().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_embed_rejects_out_of_vocab() {
        let stage = stage(tiny_config());
        let batch = AttentionBatch::prefill(1, vec![1]);
        assert!(stage.embed(&[12], &batch).is_err());
    }

    #[test]
    fn test_cache_capacity_checked() {
        let stage = stage(tiny_config());
        let batch = AttentionBatch::prefill(4, vec![4]);
        let mut cache = stage.allocate_kv_cache(1, 2).unwrap();
        let h = stage.embed(&[1, 2, 3, 4], &batch).unwrap();
        assert!(matches!(
            stage.forward_layers(h, &batch, &mut cache),
            Err(Error::DeviceExecution(_))
        ));
    }

    #[test]
    fn test_sparse_stage_runs() {
        let mut config = tiny_config();
        config.sparse = true;
        let stage = stage(config);
        assert_eq!(stage.weights().state(), LayoutState::Compressed);
        let batch = AttentionBatch::prefill(2, vec![2]);
        let mut cache = stage.allocate_kv_cache(1, 4).unwrap();
        let h = stage.embed(&[1, 2], &batch).unwrap();
        let h = stage.forward_layers(h, &batch, &mut cache).unwrap();
        let logits = stage.lm_head(&h, &batch).unwrap().to_host().unwrap();
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_end_invocation_clears_pool() {
        let stage = stage(tiny_config());
        let batch = AttentionBatch::prefill(2, vec![2]);
        let mut cache = stage.allocate_kv_cache(1, 4).unwrap();
        let h = stage.embed(&[1, 2], &batch).unwrap();
        stage.forward_layers(h, &batch, &mut cache).unwrap();
        assert!(stage.context().buffers().free_bytes() > 0);
        stage.end_invocation();
        assert_eq!(stage.context().buffers().free_bytes(), 0);
    }
}
