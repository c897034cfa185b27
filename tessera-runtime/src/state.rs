//! Per-invocation decode state

use tessera::protocol::keys;
use tessera::{Error, GenerationRequest, Result, TensorMapMut};

use crate::policy::StepDecision;

/// Everything that evolves across the steps of one invocation.
///
/// Sequences are laid out `seq = batch * beam_width + beam`. Output rows
/// advance in lockstep: step `s` writes column `output_offset + s` of every
/// row, with finished rows receiving `end_id`.
#[derive(Debug, Clone)]
pub struct DecodeState {
    batch_size: usize,
    beam_width: usize,
    total_len: usize,
    request_output_len: usize,
    output_offset: usize,
    end_id: u32,
    /// `[seq][total_len]`
    output_ids: Vec<u32>,
    lengths: Vec<usize>,
    limits: Vec<usize>,
    cum_log_probs: Vec<f32>,
    finished: Vec<bool>,
    /// Real prompt tokens followed by generated ones.
    history: Vec<Vec<u32>>,
    generated: Vec<usize>,
    /// `[step][seq]`
    cum_per_step: Vec<Vec<f32>>,
}

impl DecodeState {
    /// Initial state: prompts replicated across beams, nothing generated.
    /// In beam mode only beam 0 starts live so the identical copies do not
    /// crowd the first step's candidates.
    #[must_use]
    pub fn new(request: &GenerationRequest) -> Self {
        let beam_width = request.beam_width();
        let num_seqs = request.batch_size * beam_width;
        let total_len = request.total_output_len();
        let end_id = request.config.end_id;
        let output_offset = request.max_input_len;

        let mut output_ids = vec![end_id; num_seqs * total_len];
        let mut history = vec![Vec::new(); num_seqs];
        let mut limits = Vec::with_capacity(num_seqs);
        let mut cum_log_probs = Vec::with_capacity(num_seqs);
        for seq in 0..num_seqs {
            let b = seq / beam_width;
            if let Some(prompts) = &request.prompts {
                let row = prompts.row(b);
                output_ids[seq * total_len..][..row.len()].copy_from_slice(row);
                history[seq] = row[..prompts.lengths[b]].to_vec();
            }
            limits.push(request.output_seq_len[b].min(total_len));
            let live = !request.config.mode.is_beam_search() || seq % beam_width == 0;
            cum_log_probs.push(if live { 0.0 } else { f32::NEG_INFINITY });
        }
        let finished = limits.iter().map(|&l| l <= output_offset).collect();

        Self {
            batch_size: request.batch_size,
            beam_width,
            total_len,
            request_output_len: request.request_output_len,
            output_offset,
            end_id,
            output_ids,
            lengths: vec![output_offset; num_seqs],
            limits,
            cum_log_probs,
            finished,
            history,
            generated: vec![0; num_seqs],
            cum_per_step: Vec::new(),
        }
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    #[must_use]
    pub fn num_seqs(&self) -> usize {
        self.lengths.len()
    }

    #[must_use]
    pub fn end_id(&self) -> u32 {
        self.end_id
    }

    /// Steps applied so far.
    #[must_use]
    pub fn step(&self) -> usize {
        self.cum_per_step.len()
    }

    #[must_use]
    pub fn is_finished(&self, seq: usize) -> bool {
        self.finished[seq]
    }

    #[must_use]
    pub fn all_finished(&self) -> bool {
        self.finished.iter().all(|&f| f)
    }

    #[must_use]
    pub fn cum_log_prob(&self, seq: usize) -> f32 {
        self.cum_log_probs[seq]
    }

    /// Generated tokens of `seq`, the terminating `end_id` included.
    #[must_use]
    pub fn generated_len(&self, seq: usize) -> usize {
        self.generated[seq]
    }

    #[must_use]
    pub fn history(&self, seq: usize) -> &[u32] {
        &self.history[seq]
    }

    #[must_use]
    pub fn sequence_length(&self, seq: usize) -> usize {
        self.lengths[seq]
    }

    #[must_use]
    pub fn output_row(&self, seq: usize) -> &[u32] {
        &self.output_ids[seq * self.total_len..(seq + 1) * self.total_len]
    }

    /// Apply one step's decision. Returns whether every sequence is now
    /// finished.
    ///
    /// # Errors
    /// `InvalidConfig` for a malformed decision or a step past the end.
    pub fn apply(&mut self, decision: &StepDecision) -> Result<bool> {
        let n = self.num_seqs();
        let step = self.step();
        if step >= self.request_output_len {
            return Err(Error::InvalidConfig(format!(
                "step {step} past request_output_len {}",
                self.request_output_len
            )));
        }
        if decision.tokens.len() != n
            || decision.parents.len() != n
            || decision.cum_log_probs.len() != n
        {
            return Err(Error::InvalidConfig(format!(
                "decision covers {} sequences, state has {n}",
                decision.tokens.len()
            )));
        }
        for (seq, &parent) in decision.parents.iter().enumerate() {
            if parent >= n || parent / self.beam_width != seq / self.beam_width {
                return Err(Error::InvalidConfig(format!(
                    "sequence {seq} cannot continue sequence {parent}"
                )));
            }
        }

        if decision.parents.iter().enumerate().any(|(i, &p)| i != p) {
            let old_ids = self.output_ids.clone();
            let old_lengths = self.lengths.clone();
            let old_finished = self.finished.clone();
            let old_history = self.history.clone();
            let old_generated = self.generated.clone();
            for (seq, &parent) in decision.parents.iter().enumerate() {
                let t = self.total_len;
                self.output_ids[seq * t..(seq + 1) * t]
                    .copy_from_slice(&old_ids[parent * t..(parent + 1) * t]);
                self.lengths[seq] = old_lengths[parent];
                self.finished[seq] = old_finished[parent];
                self.history[seq].clone_from(&old_history[parent]);
                self.generated[seq] = old_generated[parent];
            }
        }

        let column = self.output_offset + step;
        for seq in 0..n {
            let slot = seq * self.total_len + column;
            if self.finished[seq] {
                self.output_ids[slot] = self.end_id;
                continue;
            }
            let token = decision.tokens[seq];
            self.output_ids[slot] = token;
            self.lengths[seq] += 1;
            self.generated[seq] += 1;
            self.history[seq].push(token);
            if token == self.end_id || self.lengths[seq] >= self.limits[seq] {
                self.finished[seq] = true;
            }
        }
        // The selector carries finished rows' scores through unchanged.
        self.cum_log_probs.copy_from_slice(&decision.cum_log_probs);
        self.cum_per_step.push(self.cum_log_probs.clone());
        Ok(self.all_finished())
    }

    /// Fill the response map. Steps that were not executed because every
    /// sequence finished early repeat the last recorded scores.
    ///
    /// # Errors
    /// `MissingKey`/`TypeMismatch` if the response map lacks a field.
    pub fn write_outputs(&self, outputs: &mut TensorMapMut<'_>) -> Result<()> {
        if let Some(ids) = outputs.data_mut::<i32>(keys::OUTPUT_IDS)? {
            for (dst, &id) in ids.iter_mut().zip(&self.output_ids) {
                *dst = to_i32(id as usize)?;
            }
        }
        if let Some(lengths) = outputs.data_mut::<i32>(keys::SEQUENCE_LENGTH)? {
            for (dst, &len) in lengths.iter_mut().zip(&self.lengths) {
                *dst = to_i32(len)?;
            }
        }
        if let Some(cum) = outputs.data_mut::<f32>(keys::OUTPUT_CUM_LOG_PROBS)? {
            let n = self.num_seqs();
            let last = self.cum_per_step.last();
            for (step, row) in cum.chunks_mut(n).enumerate() {
                match self.cum_per_step.get(step).or(last) {
                    Some(values) => row.copy_from_slice(values),
                    None => row.fill(0.0),
                }
            }
        }
        Ok(())
    }
}

fn to_i32(value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::InvalidConfig(format!("{value} does not fit the int32 output")))
}
