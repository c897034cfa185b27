//! Tessera runtime: the autoregressive decode loop
//!
//! ```text
//! run_grid             ← one thread per rank of the tp × pp grid
//!   └── DecodeEngine   ← request map in, response map out (owns Model + KV cache)
//!         ├── M: Model         ← this rank's layers, tensor collectives inside
//!         ├── TokenSelector    ← beam search / sampling on the last stage
//!         └── DecodeState      ← output ids, lengths, scores, finished flags
//! ```
//!
//! Pipeline stages hand activations forward with point-to-point sends; the
//! last stage broadcasts each step's token decision back along its
//! pipeline group so every rank evolves identical state.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss
)]

mod config;
mod engine;
mod grid;
mod policy;
mod prompts;
mod state;

pub use config::{
    DeploymentConfig, GenerationSettings, RequestBuffers, RequestSettings, ResponseBuffers,
};
pub use engine::{DecodeEngine, DecodeOutput};
pub use grid::run_grid;
pub use policy::{top_beams, BeamCandidate, StepDecision, TokenSelector};
pub use prompts::{load_start_ids, StartIds};
pub use state::DecodeState;
