//! Model configuration

use std::path::Path;

use serde::Deserialize;

use crate::dtype::DType;
use crate::error::{Error, Result};

/// Numeric format of the decoder GEMMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionProfile {
    /// FP8 E4M3 operands, bf16 outputs, f32 accumulation.
    #[default]
    Fp8Bf16,
    F16,
    Bf16,
}

impl PrecisionProfile {
    /// Operand format of layer weights and activations.
    #[must_use]
    pub fn input_type(self) -> DType {
        match self {
            Self::Fp8Bf16 => DType::F8E4M3,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }

    #[must_use]
    pub fn output_type(self) -> DType {
        match self {
            Self::Fp8Bf16 | Self::Bf16 => DType::BF16,
            Self::F16 => DType::F16,
        }
    }

    #[must_use]
    pub fn compute_type(self) -> DType {
        DType::F32
    }

    /// Profile for a `(input, output, compute)` triple.
    ///
    /// # Errors
    /// Returns `Precision` for any combination outside the supported set.
    pub fn from_types(input: DType, output: DType, compute: DType) -> Result<Self> {
        match (input, output, compute) {
            (DType::F8E4M3, DType::BF16, DType::F32) => Ok(Self::Fp8Bf16),
            (DType::F16, DType::F16, DType::F32) => Ok(Self::F16),
            (DType::BF16, DType::BF16, DType::F32) => Ok(Self::Bf16),
            _ => Err(Error::Precision(format!(
                "unsupported GEMM precision: input={input}, output={output}, compute={compute}"
            ))),
        }
    }
}

/// GPT decoder shape and vocabulary sentinels.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    pub head_num: usize,
    pub size_per_head: usize,
    /// FFN width; defaults to four times the hidden size.
    #[serde(default)]
    pub inter_size: Option<usize>,
    pub vocab_size: usize,
    pub decoder_layers: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_token_id")]
    pub start_id: u32,
    #[serde(default = "default_token_id")]
    pub end_id: u32,
    #[serde(default = "default_layernorm_eps")]
    pub layernorm_eps: f32,
    #[serde(default)]
    pub precision: PrecisionProfile,
    /// Compress layer weights to 2:4 structured sparsity after loading.
    #[serde(default)]
    pub sparse: bool,
}

fn default_max_seq_len() -> usize {
    2048
}

fn default_token_id() -> u32 {
    50256
}

fn default_layernorm_eps() -> f32 {
    1e-5
}

impl ModelConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or the shape is invalid
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.head_num * self.size_per_head
    }

    #[must_use]
    pub fn inter_size(&self) -> usize {
        self.inter_size.unwrap_or(4 * self.hidden_size())
    }

    /// Reject degenerate shapes.
    ///
    /// # Errors
    /// Returns `InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("head_num", self.head_num),
            ("size_per_head", self.size_per_head),
            ("vocab_size", self.vocab_size),
            ("decoder_layers", self.decoder_layers),
            ("max_seq_len", self.max_seq_len),
            ("inter_size", self.inter_size()),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        for (name, id) in [("start_id", self.start_id), ("end_id", self.end_id)] {
            if id as usize >= self.vocab_size {
                return Err(Error::InvalidConfig(format!(
                    "{name} {id} outside vocabulary of {}",
                    self.vocab_size
                )));
            }
        }
        if self.sparse && self.hidden_size() % 4 != 0 {
            return Err(Error::InvalidConfig(
                "2:4 sparsity needs a hidden size divisible by 4".into(),
            ));
        }
        Ok(())
    }
}
