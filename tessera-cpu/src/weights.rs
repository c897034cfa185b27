//! Weight store
//!
//! A rank loads only its own shard: the decoder layers of its pipeline
//! stage, each matrix split across the tensor-parallel group by
//! [`shard_strategy_for_weight`]. Matrices arrive in checkpoint layout
//! `[K, N]` and must pass through [`GptWeights::transpose_for_inference`]
//! exactly once before the stage can run.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::topology::ShardConfig;
use tessera::{
    shard_strategy_for_weight, DType, Error, ModelConfig, ParallelConfig, RankCoordinate, Result,
    ShardStrategy, Tensor,
};
use tracing::debug;

use crate::matmul::MatmulEngine;
use crate::quant::{round_to, QuantizedMatrix};

/// A full-precision host tensor as delivered by a [`WeightSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    /// # Errors
    /// Returns `ShapeMismatch` if `data` does not fill `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(Error::ShapeMismatch {
                key: "host tensor".into(),
                expected: format!("{shape:?}"),
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Slice this rank's part: `Column` splits the last dimension, `Row`
    /// the first.
    ///
    /// # Errors
    /// Returns `InvalidTopology` if the split dimension is not divisible by
    /// the group size.
    pub fn shard(self, strategy: ShardStrategy, shard: ShardConfig) -> Result<Self> {
        if shard.world_size == 1 || strategy == ShardStrategy::Replicate {
            return Ok(self);
        }
        let dim = match strategy {
            ShardStrategy::Column => self.shape.len() - 1,
            _ => 0,
        };
        let size = self.shape[dim];
        if size % shard.world_size != 0 {
            return Err(Error::InvalidTopology(format!(
                "dimension {dim} of {:?} ({size}) is not divisible by tensor_parallel_size {}",
                self.shape, shard.world_size
            )));
        }
        let (start, len) = shard.shard_range(size);
        let mut shape = self.shape.clone();
        shape[dim] = len;

        let data = if dim == 0 {
            let inner: usize = self.shape[1..].iter().product();
            self.data[start * inner..(start + len) * inner].to_vec()
        } else {
            self.data
                .chunks(size)
                .flat_map(|row| row[start..start + len].iter().copied())
                .collect()
        };
        Ok(Self { shape, data })
    }
}

impl Tensor for HostTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        DType::F32
    }
}

/// Provider of full (unsharded) checkpoint tensors by name.
pub trait WeightSource {
    /// Fetch `name`, which must have exactly `shape`.
    ///
    /// # Errors
    /// `MissingKey` if absent, `ShapeMismatch` if the stored shape differs.
    fn tensor(&self, name: &str, shape: &[usize]) -> Result<HostTensor>;
}

/// In-memory checkpoint.
#[derive(Debug, Default, Clone)]
pub struct HostWeights {
    tensors: HashMap<String, HostTensor>,
}

impl HostWeights {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: HostTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightSource for HostWeights {
    fn tensor(&self, name: &str, shape: &[usize]) -> Result<HostTensor> {
        let tensor = self
            .tensors
            .get(name)
            .ok_or_else(|| Error::MissingKey(name.to_string()))?;
        if tensor.shape() != shape {
            return Err(Error::ShapeMismatch {
                key: name.to_string(),
                expected: format!("{shape:?}"),
                got: tensor.shape().to_vec(),
            });
        }
        Ok(tensor.clone())
    }
}

/// Seeded random weights for benchmarking without a checkpoint.
///
/// Each tensor is generated whole from `seed` and its name before
/// sharding, so every topology sees the same model.
#[derive(Debug, Clone, Copy)]
pub struct RandomWeights {
    pub seed: u64,
    pub std: f32,
}

impl RandomWeights {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed, std: 0.02 }
    }

    fn rng_for(&self, name: &str) -> StdRng {
        // FNV-1a
        let hash = name.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        });
        StdRng::seed_from_u64(self.seed ^ hash)
    }
}

impl WeightSource for RandomWeights {
    fn tensor(&self, name: &str, shape: &[usize]) -> Result<HostTensor> {
        let mut rng = self.rng_for(name);
        let numel = shape.iter().product();
        let bound = self.std * 3.0f32.sqrt();
        let is_gain = ["layernorm.weight", "ln_1.weight", "ln_2.weight"]
            .iter()
            .any(|suffix| name.ends_with(suffix));
        let offset = if is_gain { 1.0 } else { 0.0 };
        let data = (0..numel)
            .map(|_| offset + rng.gen_range(-bound..=bound))
            .collect();
        HostTensor::new(shape.to_vec(), data)
    }
}

/// Layout of the stored matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutState {
    /// Checkpoint layout, not yet usable by the matmul engine.
    Loaded,
    Transposed,
    /// Transposed and 2:4 compressed.
    Compressed,
}

/// A projection matrix in either layout.
#[derive(Debug, Clone)]
pub enum Linear {
    /// `[K, ...]` as stored, encoded to `dtype` on transposition.
    Checkpoint { tensor: HostTensor, dtype: DType },
    Inference(QuantizedMatrix),
}

impl Linear {
    fn checkpoint(tensor: HostTensor, dtype: DType) -> Self {
        Self::Checkpoint { tensor, dtype }
    }

    /// The inference-layout matrix.
    ///
    /// # Errors
    /// Returns `LayoutState` before transposition.
    pub fn matrix(&self) -> Result<&QuantizedMatrix> {
        match self {
            Self::Inference(m) => Ok(m),
            Self::Checkpoint { .. } => Err(Error::LayoutState(
                "weights used before transpose_for_inference".into(),
            )),
        }
    }

    fn transpose(self) -> Result<Self> {
        match self {
            Self::Checkpoint { tensor, dtype } => {
                let k = tensor.shape()[0];
                let n = tensor.numel() / k.max(1);
                Ok(Self::Inference(QuantizedMatrix::from_checkpoint(
                    k,
                    n,
                    tensor.data(),
                    dtype,
                )?))
            }
            Self::Inference(_) => Err(Error::LayoutState("matrix already transposed".into())),
        }
    }

    fn compress(self, engine: &MatmulEngine) -> Result<Self> {
        Ok(Self::Inference(engine.compress_matrix(self.matrix()?)?))
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Checkpoint { tensor, .. } => tensor.size_in_bytes(),
            Self::Inference(m) => m.size_in_bytes(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Norm {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
}

impl Norm {
    fn load(source: &dyn WeightSource, prefix: &str, hidden: usize) -> Result<Self> {
        Ok(Self {
            gamma: source.tensor(&format!("{prefix}.weight"), &[hidden])?.into_data(),
            beta: source.tensor(&format!("{prefix}.bias"), &[hidden])?.into_data(),
        })
    }

    fn size_in_bytes(&self) -> usize {
        (self.gamma.len() + self.beta.len()) * std::mem::size_of::<f32>()
    }
}

/// One decoder layer's shard.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub ln_1: Norm,
    /// `[hidden, 3, width]`: query, key and value columns of this rank's heads.
    pub qkv: Linear,
    pub qkv_bias: Vec<f32>,
    pub attn_out: Linear,
    /// Added after the all-reduce, so replicated.
    pub attn_out_bias: Vec<f32>,
    pub ln_2: Norm,
    pub fc1: Linear,
    pub fc1_bias: Vec<f32>,
    pub fc2: Linear,
    pub fc2_bias: Vec<f32>,
}

impl LayerWeights {
    fn map_linears(self, f: impl Fn(Linear) -> Result<Linear>) -> Result<Self> {
        Ok(Self {
            qkv: f(self.qkv)?,
            attn_out: f(self.attn_out)?,
            fc1: f(self.fc1)?,
            fc2: f(self.fc2)?,
            ..self
        })
    }

    fn size_in_bytes(&self) -> usize {
        let biases = self.qkv_bias.len()
            + self.attn_out_bias.len()
            + self.fc1_bias.len()
            + self.fc2_bias.len();
        self.ln_1.size_in_bytes()
            + self.ln_2.size_in_bytes()
            + self.qkv.size_in_bytes()
            + self.attn_out.size_in_bytes()
            + self.fc1.size_in_bytes()
            + self.fc2.size_in_bytes()
            + biases * std::mem::size_of::<f32>()
    }
}

/// Token and position tables, replicated on the first stage.
#[derive(Debug, Clone)]
pub struct Embeddings {
    /// `[vocab, hidden]`
    pub wte: Vec<f32>,
    /// `[max_seq_len, hidden]`
    pub wpe: Vec<f32>,
}

/// Final norm and vocabulary projection on the last stage.
#[derive(Debug, Clone)]
pub struct Head {
    pub norm: Norm,
    pub lm_head: Linear,
    /// Whether `lm_head` holds a vocabulary slice that needs gathering.
    pub vocab_sharded: bool,
}

/// All weights held by one rank.
#[derive(Debug, Clone)]
pub struct GptWeights {
    pub first_layer: usize,
    pub layers: Vec<LayerWeights>,
    pub embeddings: Option<Embeddings>,
    pub head: Option<Head>,
    state: LayoutState,
}

fn sharded(
    source: &dyn WeightSource,
    name: &str,
    shape: &[usize],
    shard: ShardConfig,
) -> Result<HostTensor> {
    source
        .tensor(name, shape)?
        .shard(shard_strategy_for_weight(name), shard)
}

impl GptWeights {
    /// Load this rank's shard from `source`.
    ///
    /// # Errors
    /// Source errors, or `InvalidTopology` for heads or layers the grid
    /// cannot split.
    pub fn load_shard(
        config: &ModelConfig,
        coordinate: &RankCoordinate,
        source: &dyn WeightSource,
    ) -> Result<Self> {
        ParallelConfig::new(coordinate.tensor_parallel_size, coordinate.pipeline_parallel_size)
            .validate_model(config.head_num, config.decoder_layers)?;
        let hidden = config.hidden_size();
        let inter = config.inter_size();
        let shard = coordinate.tensor_shard();
        let weight_dtype = config.precision.input_type();
        let output_dtype = config.precision.output_type();
        let range = coordinate.layer_range(config.decoder_layers)?;

        let mut layers = Vec::with_capacity(range.len());
        for i in range.clone() {
            let p = format!("layers.{i}");
            let load = |name: &str, shape: &[usize]| {
                sharded(source, &format!("{p}.{name}"), shape, shard)
            };
            layers.push(LayerWeights {
                ln_1: Norm::load(source, &format!("{p}.ln_1"), hidden)?,
                qkv: Linear::checkpoint(
                    load("attention.query_key_value.weight", &[hidden, 3, hidden])?,
                    weight_dtype,
                ),
                qkv_bias: load("attention.query_key_value.bias", &[3, hidden])?.into_data(),
                attn_out: Linear::checkpoint(
                    load("attention.dense.weight", &[hidden, hidden])?,
                    weight_dtype,
                ),
                attn_out_bias: load("attention.dense.bias", &[hidden])?.into_data(),
                ln_2: Norm::load(source, &format!("{p}.ln_2"), hidden)?,
                fc1: Linear::checkpoint(
                    load("mlp.dense_h_to_4h.weight", &[hidden, inter])?,
                    weight_dtype,
                ),
                fc1_bias: load("mlp.dense_h_to_4h.bias", &[inter])?.into_data(),
                fc2: Linear::checkpoint(
                    load("mlp.dense_4h_to_h.weight", &[inter, hidden])?,
                    weight_dtype,
                ),
                fc2_bias: load("mlp.dense_4h_to_h.bias", &[hidden])?.into_data(),
            });
        }

        let embeddings = if coordinate.is_first_stage() {
            let round = |t: HostTensor| -> Vec<f32> {
                t.into_data().into_iter().map(|v| round_to(v, output_dtype)).collect()
            };
            Some(Embeddings {
                wte: round(source.tensor("wte", &[config.vocab_size, hidden])?),
                wpe: round(source.tensor("wpe", &[config.max_seq_len, hidden])?),
            })
        } else {
            None
        };

        let head = if coordinate.is_last_stage() {
            let vocab_sharded = config.vocab_size % shard.world_size == 0;
            let full = source.tensor("lm_head.weight", &[hidden, config.vocab_size])?;
            let lm_head = if vocab_sharded {
                full.shard(ShardStrategy::Column, shard)?
            } else {
                full
            };
            Some(Head {
                norm: Norm::load(source, "final_layernorm", hidden)?,
                lm_head: Linear::checkpoint(lm_head, output_dtype),
                vocab_sharded: vocab_sharded && shard.world_size > 1,
            })
        } else {
            None
        };

        debug!(
            rank = coordinate.global_rank,
            layers = ?range,
            first_stage = embeddings.is_some(),
            last_stage = head.is_some(),
            "loaded weight shard"
        );
        Ok(Self {
            first_layer: range.start,
            layers,
            embeddings,
            head,
            state: LayoutState::Loaded,
        })
    }

    #[must_use]
    pub fn state(&self) -> LayoutState {
        self.state
    }

    /// Reorder every matrix into the `[N, K]` layout the matmul engine reads,
    /// quantizing to the storage format. Must be called exactly once.
    ///
    /// # Errors
    /// Returns `LayoutState` if the weights were already transposed.
    pub fn transpose_for_inference(mut self) -> Result<Self> {
        if self.state != LayoutState::Loaded {
            return Err(Error::LayoutState(format!(
                "transpose_for_inference called on {:?} weights",
                self.state
            )));
        }
        self.layers = self
            .layers
            .into_iter()
            .map(|layer| layer.map_linears(Linear::transpose))
            .collect::<Result<_>>()?;
        self.head = self
            .head
            .map(|head| -> Result<Head> {
                Ok(Head {
                    lm_head: head.lm_head.transpose()?,
                    ..head
                })
            })
            .transpose()?;
        self.state = LayoutState::Transposed;
        Ok(self)
    }

    /// 2:4-compress every decoder matrix for the sparse kernel.
    ///
    /// # Errors
    /// `LayoutState` unless the weights are transposed and uncompressed;
    /// `InvalidConfig` if an input dimension is not a multiple of 4.
    pub fn compress_for_sparsity(mut self, engine: &MatmulEngine) -> Result<Self> {
        if self.state != LayoutState::Transposed {
            return Err(Error::LayoutState(format!(
                "compress_for_sparsity needs transposed weights, found {:?}",
                self.state
            )));
        }
        self.layers = self
            .layers
            .into_iter()
            .map(|layer| layer.map_linears(|linear| linear.compress(engine)))
            .collect::<Result<_>>()?;
        self.state = LayoutState::Compressed;
        Ok(self)
    }

    /// Bytes held by this shard.
    #[must_use]
    pub fn size_in_bytes(&self) -> usize {
        let layers: usize = self.layers.iter().map(LayerWeights::size_in_bytes).sum();
        let embeddings = self
            .embeddings
            .as_ref()
            .map_or(0, |e| (e.wte.len() + e.wpe.len()) * std::mem::size_of::<f32>());
        let head = self
            .head
            .as_ref()
            .map_or(0, |h| h.norm.size_in_bytes() + h.lm_head.size_in_bytes());
        layers + embeddings + head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;

    fn tiny_config() -> ModelConfig {
        ModelConfig::from_json(
            r#"{"head_num": 2, "size_per_head": 4, "vocab_size": 10,
                "decoder_layers": 2, "max_seq_len": 16, "start_id": 0, "end_id": 9}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_shard_column_and_row() {
        let t = HostTensor::new(vec![2, 4], (0..8).map(|v| v as f32).collect()).unwrap();
        let shard = ShardConfig { rank: 1, world_size: 2 };
        let col = t.clone().shard(ShardStrategy::Column, shard).unwrap();
        assert_eq!(col.shape(), &[2, 2]);
        assert_eq!(col.data(), &[2.0, 3.0, 6.0, 7.0]);
        let row = t.shard(ShardStrategy::Row, shard).unwrap();
        assert_eq!(row.shape(), &[1, 4]);
        assert_eq!(row.data(), &[4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_shard_qkv_keeps_heads_together() {
        // [hidden=1, 3, hidden=4] split over two ranks.
        let t = HostTensor::new(vec![1, 3, 4], (0..12).map(|v| v as f32).collect()).unwrap();
        let shard = ShardConfig { rank: 0, world_size: 2 };
        let local = t.shard(ShardStrategy::Column, shard).unwrap();
        assert_eq!(local.shape(), &[1, 3, 2]);
        assert_eq!(local.data(), &[0.0, 1.0, 4.0, 5.0, 8.0, 9.0]);
    }

    #[test]
    fn test_shard_indivisible() {
        let t = HostTensor::new(vec![3], vec![0.0; 3]).unwrap();
        let shard = ShardConfig { rank: 0, world_size: 2 };
        assert!(matches!(
            t.shard(ShardStrategy::Column, shard),
            Err(Error::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_random_weights_deterministic() {
        let a = RandomWeights::new(7).tensor("wte", &[4, 4]).unwrap();
        let b = RandomWeights::new(7).tensor("wte", &[4, 4]).unwrap();
        let c = RandomWeights::new(8).tensor("wte", &[4, 4]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let ln = RandomWeights::new(7).tensor("layers.0.ln_1.weight", &[8]).unwrap();
        assert!(ln.data().iter().all(|v| (v - 1.0).abs() < 0.1));
    }

    #[test]
    fn test_host_weights_errors() {
        let mut weights = HostWeights::new();
        weights.insert("a", HostTensor::new(vec![2], vec![1.0, 2.0]).unwrap());
        assert!(matches!(weights.tensor("b", &[2]), Err(Error::MissingKey(_))));
        assert!(matches!(weights.tensor("a", &[3]), Err(Error::ShapeMismatch { .. })));
        assert_eq!(weights.tensor("a", &[2]).unwrap().data(), &[1.0, 2.0]);
    }

    #[test]
    fn test_load_shard_stage_split() {
        let config = tiny_config();
        let source = RandomWeights::new(1);
        let first = RankCoordinate::new(0, 4, 2, 2).unwrap();
        let last = RankCoordinate::new(3, 4, 2, 2).unwrap();

        let w = GptWeights::load_shard(&config, &first, &source).unwrap();
        assert_eq!(w.first_layer, 0);
        assert_eq!(w.layers.len(), 1);
        assert!(w.embeddings.is_some());
        assert!(w.head.is_none());
        assert_eq!(w.layers[0].qkv_bias.len(), 3 * 4);

        let w = GptWeights::load_shard(&config, &last, &source).unwrap();
        assert_eq!(w.first_layer, 1);
        assert!(w.embeddings.is_none());
        let head = w.head.as_ref().unwrap();
        assert!(head.vocab_sharded);
    }

    #[test]
    fn test_load_shard_rejects_uneven_split() {
        let config = ModelConfig::from_json(
            r#"{"head_num": 2, "size_per_head": 4, "vocab_size": 10,
                "decoder_layers": 3, "max_seq_len": 16, "start_id": 0, "end_id": 9}"#,
        )
        .unwrap();
        let source = RandomWeights::new(1);
        let coordinate = RankCoordinate::new(0, 2, 1, 2).unwrap();
        let err = GptWeights::load_shard(&config, &coordinate, &source).unwrap_err();
        assert!(matches!(err, Error::InvalidTopology(_)));

        let coordinate = RankCoordinate::new(0, 4, 4, 1).unwrap();
        let err = GptWeights::load_shard(&tiny_config(), &coordinate, &source).unwrap_err();
        assert!(err.to_string().contains("head_num"));
    }

    #[test]
    fn test_transpose_exactly_once() {
        let config = tiny_config();
        let source = RandomWeights::new(1);
        let w = GptWeights::load_shard(&config, &RankCoordinate::single(), &source).unwrap();
        assert!(w.layers[0].qkv.matrix().is_err());
        assert_eq!(w.layers[0].qkv.size_in_bytes(), 8 * 3 * 8 * 4);
        let w = w.transpose_for_inference().unwrap();
        assert_eq!(w.state(), LayoutState::Transposed);
        let qkv = w.layers[0].qkv.matrix().unwrap();
        assert_eq!((qkv.rows(), qkv.cols()), (24, 8));
        assert!(matches!(w.transpose_for_inference(), Err(Error::LayoutState(_))));
    }

    #[test]
    fn test_compress_for_sparsity() {
        let config = tiny_config();
        let ctx = ExecutionContext::new(0, 1).unwrap();
        let engine = MatmulEngine::new(ctx, config.precision);
        let source = RandomWeights::new(1);
        let w = GptWeights::load_shard(&config, &RankCoordinate::single(), &source).unwrap();
        assert!(w.clone().compress_for_sparsity(&engine).is_err());

        let w = w.transpose_for_inference().unwrap();
        let dense = w.size_in_bytes();
        let w = w.compress_for_sparsity(&engine).unwrap();
        assert_eq!(w.state(), LayoutState::Compressed);
        assert!(w.layers[0].fc1.matrix().unwrap().is_sparse());
        assert!(w.size_in_bytes() < dense);
    }
}
