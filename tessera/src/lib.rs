//! Tessera: distributed FP8 autoregressive decoding
//!
//! This crate provides the core types and traits shared by every part of the
//! decoding stack: the 2-D process topology, the named-tensor request
//! protocol, generation settings, and the traits a pipeline stage and a
//! communicator must implement. Execution backends and the decode loop live
//! in separate crates.

pub mod comm;
pub mod config;
pub mod dtype;
pub mod error;
pub mod fp8;
pub mod generation;
pub mod logits;
pub mod model;
pub mod protocol;
pub mod tensor;
pub mod topology;

pub use comm::{Communicator, Packet, PacketKind, RankGroups};
pub use config::{ModelConfig, PrecisionProfile};
pub use dtype::{DType, TensorDType};
pub use error::{Error, ErrorKind, Result};
pub use fp8::F8E4M3;
pub use generation::{DecodeMode, GenerationConfig, GenerationRequest, PromptBatch};
pub use logits::Logits;
pub use model::{Activations, AttentionBatch, Model};
pub use protocol::{
    MemorySpace, NamedTensor, NamedTensorMut, Schema, TensorData, TensorDataMut, TensorMap,
    TensorMapMut,
};
pub use tensor::Tensor;
pub use topology::{
    shard_strategy_for_weight, ParallelConfig, RankCoordinate, ShardConfig, ShardStrategy,
};
