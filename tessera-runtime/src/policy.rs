//! Next-token selection: beam search and seeded sampling

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::{DecodeMode, Error, GenerationConfig, Packet, PacketKind, Result};

use crate::state::DecodeState;

/// The outcome of one decode step for every sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDecision {
    pub tokens: Vec<u32>,
    /// Sequence each new sequence continues. Identity outside beam search.
    pub parents: Vec<usize>,
    pub cum_log_probs: Vec<f32>,
}

impl StepDecision {
    /// Encode for the pipeline broadcast: ids are `tokens ++ parents`.
    #[must_use]
    pub fn to_packet(&self, step: usize) -> Packet {
        #[allow(clippy::cast_possible_truncation)]
        let ids = self
            .tokens
            .iter()
            .copied()
            .chain(self.parents.iter().map(|&p| p as u32))
            .collect();
        Packet::decision(step, ids, self.cum_log_probs.clone())
    }

    /// Decode a broadcast decision for `num_seqs` sequences at `step`.
    ///
    /// # Errors
    /// `Comm` if the packet is of the wrong kind, step or size.
    pub fn from_packet(packet: Packet, step: usize, num_seqs: usize) -> Result<Self> {
        if packet.kind != PacketKind::Decision || packet.step != step {
            return Err(Error::Comm(format!(
                "expected decision for step {step}, got {:?} for step {}",
                packet.kind, packet.step
            )));
        }
        if packet.ids.len() != 2 * num_seqs || packet.values.len() != num_seqs {
            return Err(Error::Comm(format!(
                "decision packet has {} ids and {} scores for {num_seqs} sequences",
                packet.ids.len(),
                packet.values.len()
            )));
        }
        let (tokens, parents) = packet.ids.split_at(num_seqs);
        Ok(Self {
            tokens: tokens.to_vec(),
            parents: parents.iter().map(|&p| p as usize).collect(),
            cum_log_probs: packet.values,
        })
    }
}

/// One extension of a beam.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamCandidate {
    /// Beam index within the batch entry.
    pub parent: usize,
    pub token: u32,
    pub cum_log_prob: f32,
    /// Ranking key: length-normalized, diversity-penalized score.
    pub score: f32,
}

/// Keep the `width` best candidates across all parent beams. Ties go to
/// the lower parent, then the lower token.
#[must_use]
pub fn top_beams(mut candidates: Vec<BeamCandidate>, width: usize) -> Vec<BeamCandidate> {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.parent.cmp(&b.parent))
            .then(a.token.cmp(&b.token))
    });
    candidates.truncate(width);
    candidates
}

/// Token ids ordered by descending value, ties to the lower id.
fn ranked(values: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| match values[b].total_cmp(&values[a]) {
        Ordering::Equal => a.cmp(&b),
        other => other,
    });
    order
}

fn log_softmax(logits: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    let log_sum = max + sum.ln();
    for l in logits {
        *l -= log_sum;
    }
}

/// Applies the generation policy to each step's logits.
///
/// Every rank that builds a selector from the same config makes the same
/// choices: beam search is deterministic and each sequence's sampler is
/// seeded from `seed + seq`.
pub struct TokenSelector {
    config: GenerationConfig,
    rngs: Vec<StdRng>,
}

impl TokenSelector {
    #[must_use]
    pub fn new(config: GenerationConfig, num_seqs: usize) -> Self {
        let seed = match config.mode {
            DecodeMode::Sampling { seed, .. } => seed,
            DecodeMode::BeamSearch { .. } => 0,
        };
        let rngs = (0..num_seqs as u64)
            .map(|seq| StdRng::seed_from_u64(seed.wrapping_add(seq)))
            .collect();
        Self { config, rngs }
    }

    /// Repetition penalty, temperature and log-softmax over one row.
    fn log_probs(&self, row: &[f32], history: &[u32]) -> Vec<f32> {
        let mut logits = row.to_vec();
        #[allow(clippy::float_cmp)]
        if self.config.repetition_penalty != 1.0 {
            let mut seen = vec![false; logits.len()];
            for &tok in history {
                let idx = tok as usize;
                if idx < logits.len() && !seen[idx] {
                    seen[idx] = true;
                    if logits[idx] > 0.0 {
                        logits[idx] /= self.config.repetition_penalty;
                    } else {
                        logits[idx] *= self.config.repetition_penalty;
                    }
                }
            }
        }
        #[allow(clippy::float_cmp)]
        if self.config.temperature != 1.0 {
            for l in &mut logits {
                *l /= self.config.temperature;
            }
        }
        log_softmax(&mut logits);
        logits
    }

    /// Choose the next token of every sequence from `[num_seqs, vocab]`
    /// logits.
    ///
    /// # Errors
    /// `ShapeMismatch` if the logits do not cover every sequence,
    /// `InvalidConfig` if the vocabulary is smaller than the beam width.
    pub fn select(
        &mut self,
        logits: &[f32],
        vocab_size: usize,
        state: &DecodeState,
    ) -> Result<StepDecision> {
        let n = state.num_seqs();
        if logits.len() != n * vocab_size {
            return Err(Error::ShapeMismatch {
                key: "logits".into(),
                expected: format!("[{n}, {vocab_size}]"),
                got: vec![logits.len()],
            });
        }
        match self.config.mode {
            DecodeMode::BeamSearch { diversity_rate } => {
                self.beam_step(logits, vocab_size, state, diversity_rate)
            }
            DecodeMode::Sampling { top_k, top_p, .. } => {
                Ok(self.sample_step(logits, vocab_size, state, top_k, top_p))
            }
        }
    }

    fn length_norm(&self, len: usize) -> f32 {
        (len.max(1) as f32).powf(self.config.length_penalty)
    }

    fn beam_step(
        &self,
        logits: &[f32],
        vocab_size: usize,
        state: &DecodeState,
        diversity_rate: f32,
    ) -> Result<StepDecision> {
        let width = state.beam_width();
        if vocab_size < width {
            return Err(Error::InvalidConfig(format!(
                "vocab_size {vocab_size} is smaller than beam_width {width}"
            )));
        }
        let n = state.num_seqs();
        let mut decision = StepDecision {
            tokens: Vec::with_capacity(n),
            parents: Vec::with_capacity(n),
            cum_log_probs: Vec::with_capacity(n),
        };
        for b in 0..state.batch_size() {
            let mut candidates = Vec::with_capacity(width * width);
            for beam in 0..width {
                let seq = b * width + beam;
                let cum = state.cum_log_prob(seq);
                if state.is_finished(seq) {
                    candidates.push(BeamCandidate {
                        parent: beam,
                        token: state.end_id(),
                        cum_log_prob: cum,
                        score: cum / self.length_norm(state.generated_len(seq)),
                    });
                    continue;
                }
                let row = &logits[seq * vocab_size..(seq + 1) * vocab_size];
                let log_probs = self.log_probs(row, state.history(seq));
                let norm = self.length_norm(state.generated_len(seq) + 1);
                for (rank, &token) in ranked(&log_probs).iter().take(width).enumerate() {
                    let cum_log_prob = cum + log_probs[token];
                    #[allow(clippy::cast_possible_truncation)]
                    candidates.push(BeamCandidate {
                        parent: beam,
                        token: token as u32,
                        cum_log_prob,
                        score: cum_log_prob / norm - diversity_rate * rank as f32,
                    });
                }
            }
            for chosen in top_beams(candidates, width) {
                decision.tokens.push(chosen.token);
                decision.parents.push(b * width + chosen.parent);
                decision.cum_log_probs.push(chosen.cum_log_prob);
            }
        }
        Ok(decision)
    }

    fn sample_step(
        &mut self,
        logits: &[f32],
        vocab_size: usize,
        state: &DecodeState,
        top_k: usize,
        top_p: f32,
    ) -> StepDecision {
        let n = state.num_seqs();
        let mut decision = StepDecision {
            tokens: Vec::with_capacity(n),
            parents: (0..n).collect(),
            cum_log_probs: Vec::with_capacity(n),
        };
        for seq in 0..n {
            let cum = state.cum_log_prob(seq);
            if state.is_finished(seq) {
                decision.tokens.push(state.end_id());
                decision.cum_log_probs.push(cum);
                continue;
            }
            let row = &logits[seq * vocab_size..(seq + 1) * vocab_size];
            let log_probs = self.log_probs(row, state.history(seq));
            let order = ranked(&log_probs);

            let mut kept = if top_k > 0 { top_k.min(vocab_size) } else { vocab_size };
            let probs: Vec<f32> = order[..kept].iter().map(|&t| log_probs[t].exp()).collect();
            let mass: f32 = probs.iter().sum();
            if top_p > 0.0 {
                let mut cumulative = 0.0f32;
                for (i, p) in probs.iter().enumerate() {
                    cumulative += p / mass;
                    if cumulative >= top_p {
                        kept = i + 1;
                        break;
                    }
                }
            }
            let nucleus = &probs[..kept];
            let total: f32 = nucleus.iter().sum();

            let r = self.rngs[seq].gen::<f32>() * total;
            let mut acc = 0.0f32;
            let mut pick = kept - 1;
            for (i, p) in nucleus.iter().enumerate() {
                acc += p;
                if acc >= r {
                    pick = i;
                    break;
                }
            }
            let token = order[pick];
            #[allow(clippy::cast_possible_truncation)]
            decision.tokens.push(token as u32);
            decision.cum_log_probs.push(cum + log_probs[token]);
        }
        decision
    }
}
