//! Distributed decode engine
//!
//! [`DecodeEngine`] runs one rank's share of an invocation: prefill over
//! the padded prompts, then one step per generated position until every
//! sequence has stopped or the requested length is reached. All ranks of
//! the grid call [`DecodeEngine::forward`] with the same request and agree
//! on every step through two synchronization points:
//!
//! - activations flow stage to stage along the pipeline group;
//! - the last stage picks tokens and broadcasts the decision back along
//!   the pipeline group, so early termination is seen by every rank at
//!   the same step.
//!
//! Tensor-parallel all-reduces happen inside the model.

use tessera::protocol::{dims, response_schema};
use tessera::{
    Activations, AttentionBatch, Communicator, Error, GenerationRequest, Logits, Model, Packet,
    PacketKind, Result, TensorMap, TensorMapMut,
};
use tracing::{debug, info_span};

use crate::policy::{StepDecision, TokenSelector};
use crate::state::DecodeState;

/// Summary of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOutput {
    /// Decode steps executed, prefill's step included.
    pub steps: usize,
    /// Whether every sequence stopped before the length limit.
    pub stopped_early: bool,
}

/// One rank's decode loop over a model stage.
pub struct DecodeEngine<M: Model, C> {
    model: M,
    pipeline: C,
    world: C,
    beam_width: usize,
    kv_cache: Option<M::KvCache>,
}

impl<M: Model, C: Communicator> DecodeEngine<M, C> {
    /// # Errors
    /// `InvalidTopology` if `pipeline` does not match the model's
    /// coordinate, `InvalidConfig` for a zero beam width.
    pub fn new(model: M, pipeline: C, world: C, beam_width: usize) -> Result<Self> {
        let coordinate = model.coordinate();
        if pipeline.world_size() != coordinate.pipeline_parallel_size
            || pipeline.rank() != coordinate.pipeline_parallel_rank
        {
            return Err(Error::InvalidTopology(format!(
                "pipeline communicator is rank {} of {}, coordinate expects {} of {}",
                pipeline.rank(),
                pipeline.world_size(),
                coordinate.pipeline_parallel_rank,
                coordinate.pipeline_parallel_size
            )));
        }
        if beam_width == 0 {
            return Err(Error::InvalidConfig("beam_width must be >= 1".into()));
        }
        Ok(Self {
            model,
            pipeline,
            world,
            beam_width,
            kv_cache: None,
        })
    }

    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    #[must_use]
    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    /// Block until every rank of the grid arrives.
    ///
    /// # Errors
    /// Returns a communication error if a peer is gone.
    pub fn barrier(&self) -> Result<()> {
        self.world.barrier()
    }

    /// Run one invocation: read `inputs`, write `outputs`.
    ///
    /// Every configuration problem is reported before any model work
    /// starts.
    ///
    /// # Errors
    /// Configuration errors for invalid requests or responses, and device
    /// or communication errors from the stages.
    pub fn forward(
        &mut self,
        outputs: &mut TensorMapMut<'_>,
        inputs: &TensorMap<'_>,
    ) -> Result<DecodeOutput> {
        let config = self.model.config().clone();
        let request = GenerationRequest::from_tensor_map(
            inputs,
            self.beam_width,
            config.start_id,
            config.end_id,
        )?;
        let total = request.total_output_len();
        if total > config.max_seq_len {
            return Err(Error::SequenceTooLong {
                total,
                max_seq_len: config.max_seq_len,
            });
        }
        if let Some(prompts) = &request.prompts {
            let out_of_range = prompts.ids.iter().find(|&&id| id as usize >= config.vocab_size);
            if let Some(&bad) = out_of_range {
                return Err(Error::InvalidConfig(format!(
                    "input id {bad} out of range for vocab_size {}",
                    config.vocab_size
                )));
            }
        }
        if request.config.mode.is_beam_search() && config.vocab_size < self.beam_width {
            return Err(Error::InvalidConfig(format!(
                "vocab_size {} is smaller than beam_width {}",
                config.vocab_size, self.beam_width
            )));
        }
        let bindings = [
            (dims::BATCH, request.batch_size),
            (dims::BEAM, self.beam_width),
            (dims::TOTAL_OUTPUT_LEN, total),
            (dims::REQUEST_OUTPUT_LEN, request.request_output_len),
        ]
        .into_iter()
        .collect();
        response_schema().validate_with(&*outputs, bindings)?;

        let coordinate = self.model.coordinate();
        let span = info_span!(
            "forward",
            rank = coordinate.global_rank,
            batch = request.batch_size,
            beam = self.beam_width,
            input_len = request.max_input_len,
            output_len = request.request_output_len,
        );
        let _guard = span.enter();

        let num_seqs = request.batch_size * self.beam_width;
        // Unconditional runs prime position 0 with start_id.
        let capacity = total.max(1);
        let mut cache = match self.kv_cache.take() {
            Some(mut cache) if self.model.kv_cache_fits(&cache, num_seqs, capacity) => {
                self.model.reset_kv_cache(&mut cache);
                cache
            }
            _ => self.model.allocate_kv_cache(num_seqs, capacity)?,
        };
        let result = self.decode(&request, &mut cache);
        self.kv_cache = Some(cache);
        self.model.end_invocation();
        let (state, output) = result?;
        state.write_outputs(outputs)?;
        Ok(output)
    }

    fn decode(
        &self,
        request: &GenerationRequest,
        cache: &mut M::KvCache,
    ) -> Result<(DecodeState, DecodeOutput)> {
        let coordinate = self.model.coordinate();
        let beam_width = self.beam_width;
        let num_seqs = request.batch_size * beam_width;
        let vocab_size = self.model.config().vocab_size;
        let last_stage = coordinate.pipeline_parallel_size - 1;

        let (mut batch, mut tokens) = match &request.prompts {
            Some(prompts) => {
                let lengths = (0..num_seqs)
                    .map(|s| prompts.lengths[s / beam_width])
                    .collect();
                let tokens = (0..num_seqs)
                    .flat_map(|s| prompts.row(s / beam_width).iter().copied())
                    .collect();
                (AttentionBatch::prefill(prompts.max_input_len, lengths), tokens)
            }
            None => (
                AttentionBatch::prefill(1, vec![1; num_seqs]),
                vec![request.config.start_id; num_seqs],
            ),
        };
        let mut next_pos = batch.padded_len;

        let mut state = DecodeState::new(request);
        let mut selector = TokenSelector::new(request.config, num_seqs);
        let mut output = DecodeOutput {
            steps: 0,
            stopped_early: false,
        };

        for step in 0..request.request_output_len {
            let hidden = self.run_stage(&tokens, &batch, step, cache)?;

            let proposal = match hidden {
                Some(hidden) => {
                    let logits = self.model.lm_head(&hidden, &batch)?;
                    let host = logits.to_host()?;
                    let decision = selector.select(&host, logits.vocab_size(), &state)?;
                    Some(decision.to_packet(step))
                }
                None => None,
            };
            let packet = self.pipeline.broadcast(last_stage, proposal)?;
            let decision = StepDecision::from_packet(packet, step, num_seqs)?;
            if let Some(&bad) = decision.tokens.iter().find(|&&t| t as usize >= vocab_size) {
                return Err(Error::DeviceExecution(format!(
                    "selected token {bad} outside vocab_size {vocab_size}"
                )));
            }

            let done = state.apply(&decision)?;
            output.steps = step + 1;
            debug!(
                step,
                position = batch.start_pos,
                finished = done,
                "decode step"
            );
            if done {
                output.stopped_early = step + 1 < request.request_output_len;
                break;
            }
            if step + 1 == request.request_output_len {
                break;
            }

            self.model.reorder_kv_cache(cache, &decision.parents)?;
            tokens = decision.tokens;
            batch = batch.step(next_pos);
            next_pos += 1;
        }
        Ok((state, output))
    }

    /// This stage's share of one step. Returns the final hidden states on
    /// the last stage, `None` elsewhere.
    fn run_stage(
        &self,
        tokens: &[u32],
        batch: &AttentionBatch,
        step: usize,
        cache: &mut M::KvCache,
    ) -> Result<Option<Activations>> {
        let coordinate = self.model.coordinate();
        let stage = coordinate.pipeline_parallel_rank;
        let hidden_size = self.model.config().hidden_size();

        let hidden = if coordinate.is_first_stage() {
            self.model.embed(tokens, batch)?
        } else {
            let packet = self.pipeline.recv(stage - 1)?;
            if packet.kind != PacketKind::Activations || packet.step != step {
                return Err(Error::Comm(format!(
                    "stage {stage} expected activations for step {step}, got {:?} for step {}",
                    packet.kind, packet.step
                )));
            }
            if packet.values.len() != batch.rows() * hidden_size {
                return Err(Error::Comm(format!(
                    "stage {stage} received {} activations, expected {}",
                    packet.values.len(),
                    batch.rows() * hidden_size
                )));
            }
            Activations {
                rows: batch.rows(),
                hidden: hidden_size,
                data: packet.values,
            }
        };

        let hidden = self.model.forward_layers(hidden, batch, cache)?;
        if coordinate.is_last_stage() {
            Ok(Some(hidden))
        } else {
            self.pipeline
                .send(stage + 1, Packet::activations(step, hidden.data))?;
            Ok(None)
        }
    }
}
