//! Decode loop behavior against scripted single-rank models.

use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tessera::protocol::keys;
use tessera::{
    Activations, AttentionBatch, Error, Model, ModelConfig, NamedTensor, RankCoordinate, Result,
    TensorData, TensorMap,
};
use tessera_cpu::{CpuLogits, LocalComm};
use tessera_runtime::{DecodeEngine, ResponseBuffers};

/// Next-token logits as a function of the previous token only.
struct Scripted {
    config: ModelConfig,
    /// `[last][vocab]`
    table: Vec<Vec<f32>>,
    embed_calls: AtomicUsize,
}

impl Scripted {
    fn config(max_seq_len: usize) -> ModelConfig {
        ModelConfig::from_json(&format!(
            r#"{{"head_num": 1, "size_per_head": 1, "vocab_size": 4, "decoder_layers": 1,
                "max_seq_len": {max_seq_len}, "start_id": 0, "end_id": 3}}"#
        ))
        .unwrap()
    }

    /// Always prefers `last + 1`.
    fn chain() -> Self {
        let table = (0..4)
            .map(|last| {
                let mut row = vec![0.0; 4];
                row[(last + 1) % 4] = 5.0;
                row
            })
            .collect();
        Self {
            config: Self::config(8),
            table,
            embed_calls: AtomicUsize::new(0),
        }
    }

    fn with_table(table: Vec<Vec<f32>>) -> Self {
        Self {
            config: Self::config(8),
            table,
            embed_calls: AtomicUsize::new(0),
        }
    }
}

impl Model for Scripted {
    type KvCache = usize;
    type Logits = CpuLogits;

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn coordinate(&self) -> RankCoordinate {
        RankCoordinate::single()
    }

    fn allocate_kv_cache(&self, _num_seqs: usize, max_len: usize) -> Result<usize> {
        Ok(max_len)
    }

    fn kv_cache_fits(&self, cache: &usize, _num_seqs: usize, max_len: usize) -> bool {
        *cache >= max_len
    }

    fn reset_kv_cache(&self, _cache: &mut usize) {}

    fn embed(&self, tokens: &[u32], batch: &AttentionBatch) -> Result<Activations> {
        self.embed_calls.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let data = tokens.iter().map(|&t| t as f32).collect();
        Ok(Activations {
            rows: batch.rows(),
            hidden: 1,
            data,
        })
    }

    fn forward_layers(
        &self,
        hidden: Activations,
        _batch: &AttentionBatch,
        _cache: &mut usize,
    ) -> Result<Activations> {
        Ok(hidden)
    }

    fn lm_head(&self, hidden: &Activations, batch: &AttentionBatch) -> Result<CpuLogits> {
        let mut data = Vec::with_capacity(batch.num_seqs * 4);
        for seq in 0..batch.num_seqs {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let last = hidden.data[batch.logit_row(seq)] as usize;
            data.extend_from_slice(&self.table[last]);
        }
        Ok(CpuLogits::new(data, batch.num_seqs, 4))
    }

    fn reorder_kv_cache(&self, _cache: &mut usize, _parents: &[usize]) -> Result<()> {
        Ok(())
    }
}

fn engine(model: Scripted, beam_width: usize) -> DecodeEngine<Scripted, LocalComm> {
    DecodeEngine::new(model, LocalComm::solo(), LocalComm::solo(), beam_width).unwrap()
}

fn log_softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = max + row.iter().map(|l| (l - max).exp()).sum::<f32>().ln();
    row.iter().map(|l| l - log_sum).collect()
}

/// Greedy request over `[batch, max_input_len]` prompts.
fn greedy<'a>(ids: &'a [i32], lengths: &'a [i32], output_seq_len: &'a [u32]) -> TensorMap<'a> {
    let batch = output_seq_len.len();
    let mut map = common(output_seq_len)
        .with(NamedTensor::host(
            keys::RANDOM_SEED,
            vec![1],
            TensorData::U64(&[0]),
        ))
        .with(NamedTensor::host(
            keys::RUNTIME_TOP_K,
            vec![1],
            TensorData::I32(&[1]),
        ));
    if !ids.is_empty() {
        map.insert(NamedTensor::host(
            keys::INPUT_IDS,
            vec![batch, ids.len() / batch],
            TensorData::I32(ids),
        ));
        map.insert(NamedTensor::host(
            keys::INPUT_LENGTHS,
            vec![batch],
            TensorData::I32(lengths),
        ));
    }
    map
}

fn common(output_seq_len: &[u32]) -> TensorMap<'_> {
    TensorMap::new()
        .with(NamedTensor::host(
            keys::OUTPUT_SEQ_LEN,
            vec![output_seq_len.len()],
            TensorData::U32(output_seq_len),
        ))
        .with(NamedTensor::host(
            keys::TEMPERATURE,
            vec![1],
            TensorData::F32(&[1.0]),
        ))
        .with(NamedTensor::host(
            keys::LEN_PENALTY,
            vec![1],
            TensorData::F32(&[0.0]),
        ))
        .with(NamedTensor::host(
            keys::REPETITION_PENALTY,
            vec![1],
            TensorData::F32(&[1.0]),
        ))
}

#[test]
fn greedy_stops_at_end_id() {
    let mut engine = engine(Scripted::chain(), 1);
    let request = greedy(&[0, 1], &[2], &[6]);
    let mut response = ResponseBuffers::new(1, 1, 6, 4, true);

    let out = engine
        .forward(&mut response.tensor_map_mut(), &request)
        .unwrap();
    assert_eq!(out.steps, 2);
    assert!(out.stopped_early);
    assert_eq!(response.output_ids(), &[0, 1, 2, 3, 3, 3]);
    assert_eq!(response.sequence_length(), &[4]);

    let step = log_softmax(&[0.0, 0.0, 0.0, 5.0])[3];
    let cum = response.cum_log_probs().unwrap();
    assert!((cum[0] - step).abs() < 1e-5);
    for &c in &cum[1..] {
        assert!((c - 2.0 * step).abs() < 1e-5, "{cum:?}");
    }
}

#[test]
fn repeated_invocations_reuse_the_cache() {
    let mut engine = engine(Scripted::chain(), 1);
    let request = greedy(&[0, 1], &[2], &[6]);
    let mut first = ResponseBuffers::new(1, 1, 6, 4, true);
    let mut second = ResponseBuffers::new(1, 1, 6, 4, true);
    engine
        .forward(&mut first.tensor_map_mut(), &request)
        .unwrap();
    engine
        .forward(&mut second.tensor_map_mut(), &request)
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn per_entry_length_limits() {
    let mut engine = engine(Scripted::chain(), 1);
    let request = greedy(&[0, 1, 1, 0], &[2, 1], &[6, 3]);
    let mut response = ResponseBuffers::new(2, 1, 6, 4, false);

    let out = engine
        .forward(&mut response.tensor_map_mut(), &request)
        .unwrap();
    assert_eq!(out.steps, 2);
    assert_eq!(response.beam(0, 0), &[0, 1, 2, 3, 3, 3]);
    // Padding is rewritten to end_id; the entry stops at its own limit.
    assert_eq!(response.beam(1, 0), &[1, 3, 2, 3, 3, 3]);
    assert_eq!(response.sequence_length(), &[4, 3]);
    assert!(response.cum_log_probs().is_none());
}

#[test]
fn padding_contents_do_not_matter() {
    let mut engine = engine(Scripted::chain(), 1);
    let mut a = ResponseBuffers::new(2, 1, 6, 4, true);
    let mut b = ResponseBuffers::new(2, 1, 6, 4, true);
    engine
        .forward(&mut a.tensor_map_mut(), &greedy(&[0, 1, 1, 0], &[2, 1], &[6, 6]))
        .unwrap();
    engine
        .forward(&mut b.tensor_map_mut(), &greedy(&[0, 1, 1, 2], &[2, 1], &[6, 6]))
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn unconditional_generation_starts_from_start_id() {
    let mut engine = engine(Scripted::chain(), 1);
    let request = greedy(&[], &[], &[5]);
    let mut response = ResponseBuffers::new(1, 1, 5, 5, true);

    let out = engine
        .forward(&mut response.tensor_map_mut(), &request)
        .unwrap();
    assert_eq!(out.steps, 3);
    assert_eq!(response.output_ids(), &[1, 2, 3, 3, 3]);
    assert_eq!(response.sequence_length(), &[3]);
}

#[test]
fn beam_search_keeps_best_hypotheses() {
    let table = vec![
        vec![0.0, 3.0, 1.0, 0.0],
        vec![0.0, 0.0, 2.0, 0.5],
        vec![0.0, 0.0, 0.0, 4.0],
        vec![0.0, 0.0, 0.0, 1.0],
    ];
    let lp: Vec<Vec<f32>> = table.iter().map(|row| log_softmax(row)).collect();
    let mut engine = engine(Scripted::with_table(table), 2);
    let request = beam_request(&[0.0]);
    let mut response = ResponseBuffers::new(1, 2, 4, 3, true);

    let out = engine
        .forward(&mut response.tensor_map_mut(), &request)
        .unwrap();
    assert_eq!(out.steps, 3);
    assert!(!out.stopped_early);
    assert_eq!(response.beam(0, 0), &[0, 1, 2, 3]);
    assert_eq!(response.beam(0, 1), &[0, 1, 3, 3]);
    assert_eq!(response.sequence_length(), &[4, 3]);

    let cum = response.cum_log_probs().unwrap();
    let best = lp[0][1] + lp[1][2] + lp[2][3];
    let finished_early = lp[0][1] + lp[1][3];
    assert!((cum[4] - best).abs() < 1e-5, "{cum:?}");
    assert!((cum[5] - finished_early).abs() < 1e-5, "{cum:?}");
    // After the first step only beam 0's expansions survive.
    assert!((cum[0] - lp[0][1]).abs() < 1e-5);
    assert!((cum[1] - lp[0][2]).abs() < 1e-5);
}

#[test]
fn both_modes_conflict() {
    let mut engine = engine(Scripted::chain(), 2);
    let request = greedy(&[0, 1], &[2], &[6]).with(NamedTensor::host(
        keys::BEAM_SEARCH_DIVERSITY_RATE,
        vec![1],
        TensorData::F32(&[0.0]),
    ));
    let mut response = ResponseBuffers::new(1, 2, 6, 4, true);
    let err = engine
        .forward(&mut response.tensor_map_mut(), &request)
        .unwrap_err();
    assert!(matches!(err, Error::ConflictingDecodeMode(_)), "{err}");
}

#[test]
fn no_mode_is_missing_key() {
    let mut engine = engine(Scripted::chain(), 1);
    let request = common(&[6]);
    let mut response = ResponseBuffers::new(1, 1, 6, 6, true);
    let err = engine
        .forward(&mut response.tensor_map_mut(), &request)
        .unwrap_err();
    assert!(matches!(err, Error::MissingKey(_)), "{err}");
}

#[test]
fn response_shape_checked_before_decoding() {
    let mut engine = engine(Scripted::chain(), 1);
    let request = greedy(&[0, 1], &[2], &[6]);
    let mut response = ResponseBuffers::new(1, 1, 7, 5, true);
    let err = engine
        .forward(&mut response.tensor_map_mut(), &request)
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");
    assert!(response.output_ids().iter().all(|&id| id == 0));
}

#[test]
fn sequence_longer_than_model_rejected() {
    let mut engine = engine(Scripted::chain(), 1);
    let request = greedy(&[0, 1], &[2], &[9]);
    let mut response = ResponseBuffers::new(1, 1, 9, 7, true);
    let err = engine
        .forward(&mut response.tensor_map_mut(), &request)
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::SequenceTooLong {
                total: 9,
                max_seq_len: 8
            }
        ),
        "{err}"
    );
}

#[test]
fn prompt_outside_vocab_rejected() {
    let mut engine = engine(Scripted::chain(), 1);
    let request = greedy(&[0, 7], &[2], &[6]);
    let mut response = ResponseBuffers::new(1, 1, 6, 4, true);
    let err = engine
        .forward(&mut response.tensor_map_mut(), &request)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
}

fn beam_request(diversity_rate: &[f32]) -> TensorMap<'_> {
    common(&[4])
        .with(NamedTensor::host(
            keys::BEAM_SEARCH_DIVERSITY_RATE,
            vec![1],
            TensorData::F32(diversity_rate),
        ))
        .with(NamedTensor::host(
            keys::INPUT_IDS,
            vec![1, 1],
            TensorData::I32(&[0]),
        ))
        .with(NamedTensor::host(
            keys::INPUT_LENGTHS,
            vec![1],
            TensorData::I32(&[1]),
        ))
}

#[test]
fn beam_wider_than_vocab_rejected_before_prefill() {
    let mut engine = engine(Scripted::chain(), 5);
    let request = beam_request(&[0.0]);
    let mut response = ResponseBuffers::new(1, 5, 4, 3, true);
    let err = engine
        .forward(&mut response.tensor_map_mut(), &request)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
    assert!(err.to_string().contains("beam_width"));
    assert_eq!(engine.model().embed_calls.load(Ordering::Relaxed), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sequence_lengths_stay_within_output_bounds(
        table in proptest::collection::vec(proptest::collection::vec(-3.0f32..3.0, 4), 4),
        batch in 1usize..4,
        max_input in 1usize..4,
        output_len in 1usize..5,
        beam_width in 1usize..3,
        diversity in 0.0f32..1.0,
        seed in any::<u64>(),
    ) {
        let total = max_input + output_len;
        let mut rng = StdRng::seed_from_u64(seed);
        let ids: Vec<i32> = (0..batch * max_input).map(|_| rng.gen_range(0..4)).collect();
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let lengths: Vec<i32> = (0..batch)
            .map(|_| rng.gen_range(1..=max_input) as i32)
            .collect();
        // Entry 0 sets the batch-wide total; the others may stop sooner.
        #[allow(clippy::cast_possible_truncation)]
        let output_seq_len: Vec<u32> = (0..batch)
            .map(|b| {
                let len = if b == 0 { total } else { rng.gen_range(max_input + 1..=total) };
                len as u32
            })
            .collect();
        let rate = [diversity];
        let seeds = [seed];

        let mut request = common(&output_seq_len)
            .with(NamedTensor::host(
                keys::INPUT_IDS,
                vec![batch, max_input],
                TensorData::I32(&ids),
            ))
            .with(NamedTensor::host(
                keys::INPUT_LENGTHS,
                vec![batch],
                TensorData::I32(&lengths),
            ));
        if beam_width > 1 {
            request.insert(NamedTensor::host(
                keys::BEAM_SEARCH_DIVERSITY_RATE,
                vec![1],
                TensorData::F32(&rate),
            ));
        } else {
            request.insert(NamedTensor::host(keys::RANDOM_SEED, vec![1], TensorData::U64(&seeds)));
            request.insert(NamedTensor::host(keys::RUNTIME_TOP_K, vec![1], TensorData::I32(&[1])));
        }

        let mut engine = engine(Scripted::with_table(table), beam_width);
        let mut response = ResponseBuffers::new(batch, beam_width, total, output_len, false);
        engine.forward(&mut response.tensor_map_mut(), &request).unwrap();

        for b in 0..batch {
            for k in 0..beam_width {
                #[allow(clippy::cast_sign_loss)]
                let len = response.sequence_length()[b * beam_width + k] as usize;
                prop_assert!(len > max_input && len <= output_seq_len[b] as usize);
                prop_assert!(response.beam(b, k)[len..].iter().all(|&id| id == 3));
            }
        }
    }
}
