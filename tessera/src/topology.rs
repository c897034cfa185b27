//! Process topology for 2-D (tensor × pipeline) parallel decoding
//!
//! Ranks are laid out tensor-major: consecutive global ranks form one
//! tensor-parallel group, and the groups are stacked along the pipeline
//! dimension. These types are pure arithmetic; the communicators that
//! realize the groups live in the execution backend.

use std::ops::Range;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Tensor- and pipeline-parallel factors for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ParallelConfig {
    #[serde(default = "default_one")]
    pub tensor_parallel_size: usize,
    #[serde(default = "default_one")]
    pub pipeline_parallel_size: usize,
}

fn default_one() -> usize {
    1
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
        }
    }
}

impl ParallelConfig {
    #[must_use]
    pub fn new(tensor_parallel_size: usize, pipeline_parallel_size: usize) -> Self {
        Self {
            tensor_parallel_size,
            pipeline_parallel_size,
        }
    }

    /// Number of ranks in the grid.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.tensor_parallel_size * self.pipeline_parallel_size
    }

    /// Check the grid against a launched world size.
    ///
    /// # Errors
    /// Returns `InvalidTopology` if either factor is zero or the product
    /// differs from `world_size`.
    pub fn validate_world(&self, world_size: usize) -> Result<()> {
        if self.tensor_parallel_size == 0 || self.pipeline_parallel_size == 0 {
            return Err(Error::InvalidTopology(format!(
                "parallel sizes must be positive (tensor={}, pipeline={})",
                self.tensor_parallel_size, self.pipeline_parallel_size
            )));
        }
        if self.world_size() != world_size {
            return Err(Error::InvalidTopology(format!(
                "tensor_para_size * pipeline_para_size should equal to world_size ({} * {} != {world_size})",
                self.tensor_parallel_size, self.pipeline_parallel_size
            )));
        }
        Ok(())
    }

    /// Check that the model can be split over this grid.
    ///
    /// # Errors
    /// Returns `InvalidTopology` if `head_num` is not divisible by the
    /// tensor-parallel size or `decoder_layers` by the pipeline size.
    pub fn validate_model(&self, head_num: usize, decoder_layers: usize) -> Result<()> {
        self.validate_world(self.world_size())?;
        if head_num % self.tensor_parallel_size != 0 {
            return Err(Error::InvalidTopology(format!(
                "head_num ({head_num}) % tensor_para_size ({}) != 0",
                self.tensor_parallel_size
            )));
        }
        if decoder_layers % self.pipeline_parallel_size != 0 {
            return Err(Error::InvalidTopology(format!(
                "decoder_layers ({decoder_layers}) % pipeline_para_size ({}) != 0",
                self.pipeline_parallel_size
            )));
        }
        Ok(())
    }

    /// Coordinate of `global_rank` within this grid.
    ///
    /// # Errors
    /// See [`RankCoordinate::new`].
    pub fn coordinate(&self, global_rank: usize) -> Result<RankCoordinate> {
        RankCoordinate::new(
            global_rank,
            self.world_size(),
            self.tensor_parallel_size,
            self.pipeline_parallel_size,
        )
    }
}

/// A rank's position in the 2-D grid. Immutable once derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RankCoordinate {
    pub global_rank: usize,
    pub world_size: usize,
    pub tensor_parallel_size: usize,
    pub pipeline_parallel_size: usize,
    pub tensor_parallel_rank: usize,
    pub pipeline_parallel_rank: usize,
}

impl RankCoordinate {
    /// Derive the coordinate for `global_rank`.
    ///
    /// # Errors
    /// Returns `InvalidTopology` if the factors do not multiply to
    /// `world_size` or the rank is out of range.
    pub fn new(
        global_rank: usize,
        world_size: usize,
        tensor_parallel_size: usize,
        pipeline_parallel_size: usize,
    ) -> Result<Self> {
        ParallelConfig::new(tensor_parallel_size, pipeline_parallel_size)
            .validate_world(world_size)?;
        if global_rank >= world_size {
            return Err(Error::InvalidTopology(format!(
                "rank {global_rank} out of range for world_size {world_size}"
            )));
        }
        Ok(Self {
            global_rank,
            world_size,
            tensor_parallel_size,
            pipeline_parallel_size,
            tensor_parallel_rank: global_rank % tensor_parallel_size,
            pipeline_parallel_rank: global_rank / tensor_parallel_size,
        })
    }

    /// Coordinate for a single-rank deployment.
    #[must_use]
    pub fn single() -> Self {
        Self {
            global_rank: 0,
            world_size: 1,
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
            tensor_parallel_rank: 0,
            pipeline_parallel_rank: 0,
        }
    }

    /// Global rank at a given (tensor, pipeline) position.
    #[must_use]
    pub fn global_rank_of(&self, tensor_rank: usize, pipeline_rank: usize) -> usize {
        pipeline_rank * self.tensor_parallel_size + tensor_rank
    }

    /// Global ranks sharing this rank's pipeline stage, in tensor-rank order.
    #[must_use]
    pub fn tensor_group(&self) -> Vec<usize> {
        (0..self.tensor_parallel_size)
            .map(|t| self.global_rank_of(t, self.pipeline_parallel_rank))
            .collect()
    }

    /// Global ranks holding the same tensor shard across stages, in stage order.
    #[must_use]
    pub fn pipeline_group(&self) -> Vec<usize> {
        (0..self.pipeline_parallel_size)
            .map(|p| self.global_rank_of(self.tensor_parallel_rank, p))
            .collect()
    }

    /// Weight sharding within the tensor-parallel group.
    #[must_use]
    pub fn tensor_shard(&self) -> ShardConfig {
        ShardConfig {
            rank: self.tensor_parallel_rank,
            world_size: self.tensor_parallel_size,
        }
    }

    /// Decoder layers owned by this pipeline stage.
    ///
    /// # Errors
    /// Returns `InvalidTopology` if `decoder_layers` is not divisible by the
    /// pipeline size.
    pub fn layer_range(&self, decoder_layers: usize) -> Result<Range<usize>> {
        if decoder_layers % self.pipeline_parallel_size != 0 {
            return Err(Error::InvalidTopology(format!(
                "decoder_layers ({decoder_layers}) % pipeline_para_size ({}) != 0",
                self.pipeline_parallel_size
            )));
        }
        let shard = ShardConfig {
            rank: self.pipeline_parallel_rank,
            world_size: self.pipeline_parallel_size,
        };
        let (start, len) = shard.shard_range(decoder_layers);
        Ok(start..start + len)
    }

    #[must_use]
    pub fn is_first_stage(&self) -> bool {
        self.pipeline_parallel_rank == 0
    }

    #[must_use]
    pub fn is_last_stage(&self) -> bool {
        self.pipeline_parallel_rank + 1 == self.pipeline_parallel_size
    }
}

/// Describes this rank's position in a tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardConfig {
    /// This rank's index (`0..world_size`)
    pub rank: usize,
    /// Number of ranks the dimension is split across
    pub world_size: usize,
}

impl ShardConfig {
    /// Compute the shard range for a dimension of size `dim`.
    ///
    /// Returns `(start, shard_size)` where the shard covers
    /// `[start .. start + shard_size)`.
    ///
    /// # Panics
    /// Panics if `dim` is not evenly divisible by `world_size`.
    #[must_use]
    pub fn shard_range(&self, dim: usize) -> (usize, usize) {
        assert_eq!(
            dim % self.world_size,
            0,
            "Dimension {dim} is not evenly divisible by world_size {}",
            self.world_size
        );
        let shard_size = dim / self.world_size;
        let start = self.rank * shard_size;
        (start, shard_size)
    }
}

/// How a specific weight tensor should be sliced during loading.
///
/// Weights are stored input-major (`[in, out]`), so column-parallel splits
/// the last dimension and row-parallel splits the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
    /// Replicate the full tensor on every rank (norms, embeddings, biases
    /// added after a reduction).
    Replicate,
    /// Split along the output (last) dimension. Used for the fused QKV
    /// projection, the FFN up projection and the LM head.
    Column,
    /// Split along the input (first) dimension. Used for the attention
    /// output projection and the FFN down projection; the partial products
    /// need an all-reduce.
    Row,
}

/// Determine the shard strategy for a GPT weight tensor by its name.
#[must_use]
pub fn shard_strategy_for_weight(name: &str) -> ShardStrategy {
    if name.ends_with("_scale") {
        return ShardStrategy::Replicate;
    }

    if name.ends_with("attention.query_key_value.weight")
        || name.ends_with("attention.query_key_value.bias")
        || name.ends_with("mlp.dense_h_to_4h.weight")
        || name.ends_with("mlp.dense_h_to_4h.bias")
        || name == "lm_head.weight"
    {
        return ShardStrategy::Column;
    }

    if name.ends_with("attention.dense.weight") || name.ends_with("mlp.dense_4h_to_h.weight") {
        return ShardStrategy::Row;
    }

    ShardStrategy::Replicate
}
