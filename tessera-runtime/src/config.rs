//! Deployment configuration and owned request/response buffers

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tessera::protocol::keys;
use tessera::{
    DecodeMode, Error, ModelConfig, NamedTensor, NamedTensorMut, ParallelConfig, Result,
    TensorData, TensorDataMut, TensorMap, TensorMapMut,
};
use tracing::info;

use crate::prompts::{load_start_ids, StartIds};

/// Everything a benchmark run needs: model shape, grid, sampling and the
/// request to issue.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub parallelism: ParallelConfig,
    #[serde(default)]
    pub generation: GenerationSettings,
    pub request: RequestSettings,
}

/// Flat generation knobs. `top_k` and `top_p` both zero selects beam
/// search; otherwise sampling with the nonzero filters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub beam_width: usize,
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    pub repetition_penalty: f32,
    pub len_penalty: f32,
    pub beam_search_diversity_rate: f32,
    pub random_seed: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            beam_width: 1,
            top_k: 1,
            top_p: 0.0,
            temperature: 1.0,
            repetition_penalty: 1.0,
            len_penalty: 1.0,
            beam_search_diversity_rate: 0.0,
            random_seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RequestSettings {
    pub batch_size: usize,
    /// Length of synthetic prompts when no prompt file is given; zero
    /// requests unconditional generation.
    #[serde(default)]
    pub input_len: usize,
    pub output_len: usize,
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
}

impl DeploymentConfig {
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
    /// Returns an error if the JSON is malformed or any section is invalid
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.model.validate()?;
        config
            .parallelism
            .validate_model(config.model.head_num, config.model.decoder_layers)?;
        if config.request.batch_size == 0 || config.request.output_len == 0 {
            return Err(Error::InvalidConfig(
                "request batch_size and output_len must be positive".into(),
            ));
        }
        Ok(config)
    }

    /// Decode mode implied by the flat generation settings.
    #[must_use]
    pub fn decode_mode(&self) -> DecodeMode {
        let g = &self.generation;
        DecodeMode::from_flat(
            g.top_k,
            g.top_p,
            g.beam_search_diversity_rate,
            g.random_seed,
        )
    }

    /// The same request with a different generation length.
    #[must_use]
    pub fn with_output_len(&self, output_len: usize) -> Self {
        let mut config = self.clone();
        config.request.output_len = output_len;
        config
    }

    /// Build the request map contents: prompts from the prompt file (or
    /// synthetic ones), one `output_seq_len` per batch entry, and the mode
    /// keys for the configured decode mode.
    ///
    /// # Errors
    /// `InvalidConfig` for beam search with `beam_width <= 1` or a prompt
    /// file that cannot be parsed.
    pub fn build_request(&self) -> Result<RequestBuffers> {
        let batch_size = self.request.batch_size;
        let end_id = self.model.end_id;
        let prompts = match &self.request.prompt_file {
            Some(path) => load_start_ids(path, batch_size, end_id)?,
            None => synthetic_prompts(batch_size, self.request.input_len, self.model.vocab_size)?,
        };

        let total = u32::try_from(prompts.max_input_len + self.request.output_len)
            .map_err(|_| Error::InvalidConfig("total output length exceeds u32".into()))?;
        let g = &self.generation;
        let mut buffers = RequestBuffers {
            batch_size,
            prompts,
            output_seq_len: vec![total; batch_size],
            temperature: [g.temperature],
            len_penalty: [g.len_penalty],
            repetition_penalty: [g.repetition_penalty],
            beam_search_diversity_rate: None,
            random_seed: None,
            runtime_top_p: None,
            runtime_top_k: None,
        };
        match self.decode_mode() {
            DecodeMode::BeamSearch { diversity_rate } => {
                if g.beam_width <= 1 {
                    return Err(Error::InvalidConfig(format!(
                        "top_k and top_p are both zero, which selects beam search, \
                         but beam_width is {}",
                        g.beam_width
                    )));
                }
                buffers.beam_search_diversity_rate = Some([diversity_rate]);
            }
            DecodeMode::Sampling { top_k, top_p, seed } => {
                buffers.random_seed = Some([seed]);
                if top_p != 0.0 {
                    buffers.runtime_top_p = Some([top_p]);
                }
                if top_k != 0 {
                    let top_k = i32::try_from(top_k)
                        .map_err(|_| Error::InvalidConfig(format!("top_k {top_k} too large")))?;
                    buffers.runtime_top_k = Some([top_k]);
                }
            }
        }
        info!(
            batch_size,
            max_input_len = buffers.prompts.max_input_len,
            output_len = self.request.output_len,
            beam_width = g.beam_width,
            "request built"
        );
        Ok(buffers)
    }
}

/// Prompts of `input_len` tokens cycling through the vocabulary.
fn synthetic_prompts(batch_size: usize, input_len: usize, vocab_size: usize) -> Result<StartIds> {
    if input_len == 0 {
        return Ok(StartIds::default());
    }
    let ids = (0..batch_size * input_len)
        .map(|i| i32::try_from((i * 7 + 1) % vocab_size))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::InvalidConfig("vocab_size exceeds i32".into()))?;
    let len = i32::try_from(input_len)
        .map_err(|_| Error::InvalidConfig(format!("input_len {input_len} too large")))?;
    Ok(StartIds {
        ids,
        lengths: vec![len; batch_size],
        max_input_len: input_len,
    })
}

/// Owned storage behind a request [`TensorMap`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBuffers {
    pub batch_size: usize,
    pub prompts: StartIds,
    pub output_seq_len: Vec<u32>,
    pub temperature: [f32; 1],
    pub len_penalty: [f32; 1],
    pub repetition_penalty: [f32; 1],
    pub beam_search_diversity_rate: Option<[f32; 1]>,
    pub random_seed: Option<[u64; 1]>,
    pub runtime_top_p: Option<[f32; 1]>,
    pub runtime_top_k: Option<[i32; 1]>,
}

impl RequestBuffers {
    #[must_use]
    pub fn max_input_len(&self) -> usize {
        self.prompts.max_input_len
    }

    /// Borrowing view in the request protocol. Prompts are omitted when
    /// empty, which makes the request unconditional.
    #[must_use]
    pub fn tensor_map(&self) -> TensorMap<'_> {
        let scalar = || vec![1];
        let mut map = TensorMap::new()
            .with(NamedTensor::host(
                keys::OUTPUT_SEQ_LEN,
                vec![self.batch_size],
                TensorData::U32(&self.output_seq_len),
            ))
            .with(NamedTensor::host(
                keys::TEMPERATURE,
                scalar(),
                TensorData::F32(&self.temperature),
            ))
            .with(NamedTensor::host(
                keys::LEN_PENALTY,
                scalar(),
                TensorData::F32(&self.len_penalty),
            ))
            .with(NamedTensor::host(
                keys::REPETITION_PENALTY,
                scalar(),
                TensorData::F32(&self.repetition_penalty),
            ));
        if !self.prompts.is_empty() {
            map.insert(NamedTensor::host(
                keys::INPUT_IDS,
                vec![self.batch_size, self.prompts.max_input_len],
                TensorData::I32(&self.prompts.ids),
            ));
            map.insert(NamedTensor::host(
                keys::INPUT_LENGTHS,
                vec![self.batch_size],
                TensorData::I32(&self.prompts.lengths),
            ));
        }
        if let Some(rate) = &self.beam_search_diversity_rate {
            map.insert(NamedTensor::host(
                keys::BEAM_SEARCH_DIVERSITY_RATE,
                scalar(),
                TensorData::F32(rate),
            ));
        }
        if let Some(seed) = &self.random_seed {
            map.insert(NamedTensor::host(
                keys::RANDOM_SEED,
                scalar(),
                TensorData::U64(seed),
            ));
        }
        if let Some(top_p) = &self.runtime_top_p {
            map.insert(NamedTensor::host(
                keys::RUNTIME_TOP_P,
                scalar(),
                TensorData::F32(top_p),
            ));
        }
        if let Some(top_k) = &self.runtime_top_k {
            map.insert(NamedTensor::host(
                keys::RUNTIME_TOP_K,
                scalar(),
                TensorData::I32(top_k),
            ));
        }
        map
    }
}

/// Owned storage behind a response [`TensorMapMut`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseBuffers {
    batch_size: usize,
    beam_width: usize,
    total_len: usize,
    request_output_len: usize,
    output_ids: Vec<i32>,
    sequence_length: Vec<i32>,
    /// `None` declares the output without a buffer.
    cum_log_probs: Option<Vec<f32>>,
}

impl ResponseBuffers {
    #[must_use]
    pub fn new(
        batch_size: usize,
        beam_width: usize,
        total_len: usize,
        request_output_len: usize,
        with_log_probs: bool,
    ) -> Self {
        let num_seqs = batch_size * beam_width;
        Self {
            batch_size,
            beam_width,
            total_len,
            request_output_len,
            output_ids: vec![0; num_seqs * total_len],
            sequence_length: vec![0; num_seqs],
            cum_log_probs: with_log_probs.then(|| vec![0.0; request_output_len * num_seqs]),
        }
    }

    /// Buffers sized for `request`.
    #[must_use]
    pub fn for_request(request: &RequestBuffers, beam_width: usize, with_log_probs: bool) -> Self {
        let total = request.output_seq_len.iter().copied().max().unwrap_or(0) as usize;
        Self::new(
            request.batch_size,
            beam_width,
            total,
            total.saturating_sub(request.max_input_len()),
            with_log_probs,
        )
    }

    pub fn tensor_map_mut(&mut self) -> TensorMapMut<'_> {
        let cum = match &mut self.cum_log_probs {
            Some(buf) => TensorDataMut::F32(buf),
            None => TensorDataMut::Unallocated(tessera::DType::F32),
        };
        TensorMapMut::new()
            .with(NamedTensorMut::host(
                keys::OUTPUT_IDS,
                vec![self.batch_size, self.beam_width, self.total_len],
                TensorDataMut::I32(&mut self.output_ids),
            ))
            .with(NamedTensorMut::host(
                keys::SEQUENCE_LENGTH,
                vec![self.batch_size, self.beam_width],
                TensorDataMut::I32(&mut self.sequence_length),
            ))
            .with(NamedTensorMut::host(
                keys::OUTPUT_CUM_LOG_PROBS,
                vec![self.request_output_len, self.batch_size, self.beam_width],
                cum,
            ))
    }

    /// `[batch][beam][total_len]`
    #[must_use]
    pub fn output_ids(&self) -> &[i32] {
        &self.output_ids
    }

    /// Ids of one beam.
    #[must_use]
    pub fn beam(&self, batch: usize, beam: usize) -> &[i32] {
        let seq = batch * self.beam_width + beam;
        &self.output_ids[seq * self.total_len..(seq + 1) * self.total_len]
    }

    /// `[batch][beam]`
    #[must_use]
    pub fn sequence_length(&self) -> &[i32] {
        &self.sequence_length
    }

    /// `[step][batch][beam]`, if requested.
    #[must_use]
    pub fn cum_log_probs(&self) -> Option<&[f32]> {
        self.cum_log_probs.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera::{ErrorKind, GenerationRequest};

    const JSON: &str = r#"{
        "model": {"head_num": 2, "size_per_head": 4, "vocab_size": 32, "decoder_layers": 2,
                  "max_seq_len": 64, "start_id": 0, "end_id": 31},
        "parallelism": {"tensor_parallel_size": 2, "pipeline_parallel_size": 2},
        "generation": {"beam_width": 2, "top_k": 0, "top_p": 0.0,
                       "beam_search_diversity_rate": 0.5},
        "request": {"batch_size": 3, "input_len": 4, "output_len": 8}
    }"#;

    #[test]
    fn test_parse_and_build_beam_request() {
        let config = DeploymentConfig::from_json(JSON).unwrap();
        assert_eq!(config.parallelism.world_size(), 4);
        assert_eq!(config.generation.len_penalty, 1.0);

        let buffers = config.build_request().unwrap();
        assert_eq!(buffers.output_seq_len, vec![12; 3]);
        let map = buffers.tensor_map();
        assert!(map.contains(keys::BEAM_SEARCH_DIVERSITY_RATE));
        assert!(!map.contains(keys::RANDOM_SEED));

        let request = GenerationRequest::from_tensor_map(&map, 2, 0, 31).unwrap();
        assert_eq!(request.max_input_len, 4);
        assert_eq!(request.request_output_len, 8);
        assert_eq!(
            request.config.mode,
            DecodeMode::BeamSearch {
                diversity_rate: 0.5
            }
        );
    }

    #[test]
    fn test_beam_mode_needs_width() {
        let json = JSON.replace(r#""beam_width": 2"#, r#""beam_width": 1"#);
        let config = DeploymentConfig::from_json(&json).unwrap();
        let err = config.build_request().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_sampling_keys() {
        let json = JSON.replace(r#""top_k": 0, "top_p": 0.0"#, r#""top_k": 0, "top_p": 0.9"#);
        let config = DeploymentConfig::from_json(&json).unwrap();
        let map_owner = config.build_request().unwrap();
        let map = map_owner.tensor_map();
        assert!(map.contains(keys::RANDOM_SEED));
        assert!(map.contains(keys::RUNTIME_TOP_P));
        assert!(!map.contains(keys::RUNTIME_TOP_K));
        assert!(!map.contains(keys::BEAM_SEARCH_DIVERSITY_RATE));
    }

    #[test]
    fn test_unconditional_without_input_len() {
        let json = JSON.replace(r#""input_len": 4"#, r#""input_len": 0"#);
        let config = DeploymentConfig::from_json(&json).unwrap();
        let buffers = config.build_request().unwrap();
        let map = buffers.tensor_map();
        assert!(!map.contains(keys::INPUT_IDS));
        assert_eq!(buffers.output_seq_len, vec![8; 3]);
    }

    #[test]
    fn test_layers_must_divide_pipeline() {
        let json = JSON.replace(
            r#""pipeline_parallel_size": 2"#,
            r#""pipeline_parallel_size": 3"#,
        );
        assert!(DeploymentConfig::from_json(&json).is_err());
    }

    #[test]
    fn test_response_buffers_map() {
        let mut response = ResponseBuffers::new(2, 3, 5, 4, false);
        let mut map = response.tensor_map_mut();
        assert!(map.data_mut::<f32>(keys::OUTPUT_CUM_LOG_PROBS).unwrap().is_none());
        assert_eq!(
            map.data_mut::<i32>(keys::OUTPUT_IDS).unwrap().unwrap().len(),
            30
        );
        drop(map);
        assert!(response.cum_log_probs().is_none());
        assert_eq!(response.beam(1, 2).len(), 5);
    }
}
