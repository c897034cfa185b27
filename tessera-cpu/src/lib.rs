//! Host execution backend for Tessera.
//!
//! Emulates the device side of the decoding stack on the CPU: each rank
//! gets an [`ExecutionContext`] whose thread pool plays the role of an
//! ordered device stream, FP8 E4M3 GEMMs are computed with exact software
//! decoding and f32 accumulation, and collectives run over in-process
//! channels between rank threads.
//!
//! The backend is intended for testing the parallel decode path and for
//! running on machines without accelerators. It is not optimised for
//! throughput.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::many_single_char_names
)]

pub mod attention;
pub mod collective;
pub mod context;
pub mod kv_cache;
pub mod logits;
pub mod matmul;
pub mod model;
pub mod ops;
pub mod pool;
pub mod quant;
pub mod sparse;
pub mod weights;

pub use collective::{initialize_groups, LocalComm};
pub use context::ExecutionContext;
pub use kv_cache::KvArena;
pub use logits::CpuLogits;
pub use matmul::{AlgorithmMap, GemmAlgorithm, GemmShape, MatmulEngine};
pub use model::GptStage;
pub use pool::BufferPool;
pub use quant::{QuantizedMatrix, ScaleFactor, Storage};
pub use weights::{GptWeights, HostTensor, HostWeights, RandomWeights, WeightSource};
