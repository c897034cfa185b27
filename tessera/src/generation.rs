//! Generation settings and parsed decode requests

use crate::error::{Error, Result};
use crate::protocol::{dims, keys, request_schema, TensorMap};

/// Token selection policy for one request batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeMode {
    /// Deterministic beam search over `beam_width` hypotheses.
    BeamSearch {
        /// Penalty per rank among siblings sharing a parent beam.
        diversity_rate: f32,
    },
    /// Seeded top-k / nucleus sampling. A zero `top_k` or `top_p` disables
    /// that filter; at least one must be active.
    Sampling { top_k: usize, top_p: f32, seed: u64 },
}

impl DecodeMode {
    /// Greedy decoding expressed as top-1 sampling.
    #[must_use]
    pub fn greedy() -> Self {
        Self::Sampling {
            top_k: 1,
            top_p: 0.0,
            seed: 0,
        }
    }

    /// Pick a mode from the zero-means-off convention used by flat config
    /// files: both `top_k` and `top_p` zero selects beam search.
    #[must_use]
    pub fn from_flat(top_k: usize, top_p: f32, diversity_rate: f32, seed: u64) -> Self {
        if top_k == 0 && top_p == 0.0 {
            Self::BeamSearch { diversity_rate }
        } else {
            Self::Sampling { top_k, top_p, seed }
        }
    }

    #[must_use]
    pub fn is_beam_search(&self) -> bool {
        matches!(self, Self::BeamSearch { .. })
    }
}

/// Settings shared by every sequence in a request batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationConfig {
    pub beam_width: usize,
    pub mode: DecodeMode,
    pub temperature: f32,
    pub repetition_penalty: f32,
    pub length_penalty: f32,
    pub start_id: u32,
    pub end_id: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            beam_width: 1,
            mode: DecodeMode::greedy(),
            temperature: 1.0,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            start_id: 50256,
            end_id: 50256,
        }
    }
}

impl GenerationConfig {
    /// Check parameter ranges and mode/beam-width compatibility.
    ///
    /// # Errors
    /// `InvalidConfig` for out-of-range values, `ConflictingDecodeMode`
    /// for a sampling mode with no active filter.
    pub fn validate(&self) -> Result<()> {
        if self.beam_width == 0 {
            return Err(Error::InvalidConfig("beam_width must be >= 1".into()));
        }
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if !(self.repetition_penalty > 0.0 && self.repetition_penalty.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "repetition_penalty must be positive, got {}",
                self.repetition_penalty
            )));
        }
        if !self.length_penalty.is_finite() {
            return Err(Error::InvalidConfig("len_penalty must be finite".into()));
        }
        match self.mode {
            DecodeMode::BeamSearch { diversity_rate } => {
                if self.beam_width < 2 {
                    return Err(Error::InvalidConfig(format!(
                        "beam search requires beam_width > 1, got {}",
                        self.beam_width
                    )));
                }
                if !diversity_rate.is_finite() {
                    return Err(Error::InvalidConfig(
                        "beam_search_diversity_rate must be finite".into(),
                    ));
                }
            }
            DecodeMode::Sampling { top_k, top_p, .. } => {
                if !(0.0..=1.0).contains(&top_p) {
                    return Err(Error::InvalidConfig(format!(
                        "runtime_top_p must be in [0, 1], got {top_p}"
                    )));
                }
                if top_k == 0 && top_p == 0.0 {
                    return Err(Error::ConflictingDecodeMode(
                        "sampling needs a nonzero runtime_top_k or runtime_top_p".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Right-padded prompt ids for a conditional request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptBatch {
    pub max_input_len: usize,
    /// `[batch, max_input_len]`, positions past each length hold `end_id`.
    pub ids: Vec<u32>,
    pub lengths: Vec<usize>,
}

impl PromptBatch {
    #[must_use]
    pub fn row(&self, batch: usize) -> &[u32] {
        &self.ids[batch * self.max_input_len..(batch + 1) * self.max_input_len]
    }
}

/// A validated request, with every field the decode loop needs resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub batch_size: usize,
    /// `None` for unconditional generation.
    pub prompts: Option<PromptBatch>,
    /// Per-entry total length cap, prompt included.
    pub output_seq_len: Vec<usize>,
    pub max_input_len: usize,
    pub request_output_len: usize,
    pub config: GenerationConfig,
}

impl GenerationRequest {
    /// Parse and validate a request map.
    ///
    /// Prompts are re-padded with `end_id` past each entry's length, so the
    /// contents of padded positions never matter.
    ///
    /// # Errors
    /// Any schema violation, an invalid generation config, or lengths that
    /// are inconsistent with the padded prompt.
    pub fn from_tensor_map(
        map: &TensorMap<'_>,
        beam_width: usize,
        start_id: u32,
        end_id: u32,
    ) -> Result<Self> {
        let bindings = request_schema().validate(map)?;
        let batch_size = bindings[dims::BATCH];

        let mode = if let Some(diversity_rate) =
            map.scalar::<f32>(keys::BEAM_SEARCH_DIVERSITY_RATE)?
        {
            DecodeMode::BeamSearch { diversity_rate }
        } else {
            let seed = map.scalar::<u64>(keys::RANDOM_SEED)?.unwrap_or_default();
            let top_k = map.scalar::<i32>(keys::RUNTIME_TOP_K)?;
            let top_p = map.scalar::<f32>(keys::RUNTIME_TOP_P)?;
            let top_k = match top_k {
                Some(k) => usize::try_from(k).map_err(|_| {
                    Error::InvalidConfig(format!("runtime_top_k must be >= 0, got {k}"))
                })?,
                None if top_p.is_none() => 1,
                None => 0,
            };
            DecodeMode::Sampling {
                top_k,
                top_p: top_p.unwrap_or(0.0),
                seed,
            }
        };

        let config = GenerationConfig {
            beam_width,
            mode,
            temperature: required_scalar(map, keys::TEMPERATURE)?,
            repetition_penalty: required_scalar(map, keys::REPETITION_PENALTY)?,
            length_penalty: required_scalar(map, keys::LEN_PENALTY)?,
            start_id,
            end_id,
        };
        config.validate()?;

        let prompts = if map.contains(keys::INPUT_IDS) {
            let max_input_len = bindings[dims::MAX_INPUT_LEN];
            let raw_ids = map.data::<i32>(keys::INPUT_IDS)?;
            let raw_lengths = map.data::<i32>(keys::INPUT_LENGTHS)?;
            let mut lengths = Vec::with_capacity(batch_size);
            for (b, &len) in raw_lengths.iter().enumerate() {
                let len = usize::try_from(len)
                    .ok()
                    .filter(|&l| l >= 1 && l <= max_input_len)
                    .ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "input_lengths[{b}] = {len} outside 1..={max_input_len}"
                        ))
                    })?;
                lengths.push(len);
            }
            let mut ids = Vec::with_capacity(raw_ids.len());
            for (b, row) in raw_ids.chunks(max_input_len.max(1)).enumerate() {
                for (pos, &id) in row.iter().enumerate() {
                    if pos >= lengths[b] {
                        ids.push(end_id);
                        continue;
                    }
                    let id = u32::try_from(id).map_err(|_| {
                        Error::InvalidConfig(format!("input_ids[{b}][{pos}] = {id} is negative"))
                    })?;
                    ids.push(id);
                }
            }
            Some(PromptBatch {
                max_input_len,
                ids,
                lengths,
            })
        } else {
            None
        };
        let max_input_len = prompts.as_ref().map_or(0, |p| p.max_input_len);

        let output_seq_len: Vec<usize> = map
            .data::<u32>(keys::OUTPUT_SEQ_LEN)?
            .iter()
            .map(|&l| l as usize)
            .collect();
        let total = output_seq_len.iter().copied().max().unwrap_or(0);
        if let Some((b, &l)) = output_seq_len
            .iter()
            .enumerate()
            .find(|&(_, &l)| l < max_input_len)
        {
            return Err(Error::InvalidConfig(format!(
                "output_seq_len[{b}] = {l} is shorter than max_input_len {max_input_len}"
            )));
        }
        if total <= max_input_len {
            return Err(Error::InvalidConfig(format!(
                "output_seq_len leaves no room to generate after {max_input_len} prompt tokens"
            )));
        }

        Ok(Self {
            batch_size,
            prompts,
            output_seq_len,
            max_input_len,
            request_output_len: total - max_input_len,
            config,
        })
    }

    #[must_use]
    pub fn beam_width(&self) -> usize {
        self.config.beam_width
    }

    /// `max_input_len + request_output_len`.
    #[must_use]
    pub fn total_output_len(&self) -> usize {
        self.max_input_len + self.request_output_len
    }

    #[must_use]
    pub fn is_unconditional(&self) -> bool {
        self.prompts.is_none()
    }
}

fn required_scalar(map: &TensorMap<'_>, key: &str) -> Result<f32> {
    map.scalar::<f32>(key)?
        .ok_or_else(|| Error::MissingKey(key.to_string()))
}
