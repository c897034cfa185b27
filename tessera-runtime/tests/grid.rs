//! Full GPT stages on a tensor × pipeline grid.

use tessera::{ModelConfig, ParallelConfig};
use tessera_cpu::{initialize_groups, ExecutionContext, GptStage, MatmulEngine, RandomWeights};
use tessera_runtime::{
    run_grid, DecodeEngine, DecodeOutput, DeploymentConfig, RequestBuffers, ResponseBuffers,
    StartIds,
};

fn model() -> ModelConfig {
    ModelConfig::from_json(
        r#"{"head_num": 4, "size_per_head": 4, "vocab_size": 16, "decoder_layers": 2,
            "max_seq_len": 16, "start_id": 0, "end_id": 15}"#,
    )
    .unwrap()
}

fn greedy_request() -> RequestBuffers {
    RequestBuffers {
        batch_size: 2,
        prompts: StartIds {
            ids: vec![1, 2, 3, 4, 5, 15],
            lengths: vec![3, 2],
            max_input_len: 3,
        },
        output_seq_len: vec![9, 9],
        temperature: [1.0],
        len_penalty: [1.0],
        repetition_penalty: [1.0],
        beam_search_diversity_rate: None,
        random_seed: Some([0]),
        runtime_top_p: None,
        runtime_top_k: Some([1]),
    }
}

/// Decode `request` twice on every rank of the grid; returns each rank's
/// responses.
fn decode(
    config: &ModelConfig,
    parallel: ParallelConfig,
    request: &RequestBuffers,
    beam_width: usize,
) -> Vec<(ResponseBuffers, DecodeOutput)> {
    let groups = initialize_groups(parallel).unwrap();
    let runs = run_grid(groups, |g| {
        let ctx = ExecutionContext::new(g.coordinate.global_rank, 1)?;
        let matmul = MatmulEngine::new(ctx, config.precision);
        let stage = GptStage::load(
            config.clone(),
            g.coordinate,
            matmul,
            g.tensor,
            &RandomWeights::new(5),
        )?;
        let mut engine = DecodeEngine::new(stage, g.pipeline, g.world, beam_width)?;
        let mut first = ResponseBuffers::for_request(request, beam_width, true);
        let out = engine.forward(&mut first.tensor_map_mut(), &request.tensor_map())?;
        let mut second = ResponseBuffers::for_request(request, beam_width, true);
        engine.forward(&mut second.tensor_map_mut(), &request.tensor_map())?;
        assert_eq!(first, second, "cache reuse changed the result");
        engine.barrier()?;
        Ok((first, out))
    })
    .unwrap();
    assert_eq!(runs.len(), parallel.world_size());
    runs
}

fn assert_ranks_agree(runs: &[(ResponseBuffers, DecodeOutput)]) {
    for (rank, run) in runs.iter().enumerate().skip(1) {
        assert_eq!(run, &runs[0], "rank {rank} disagrees with rank 0");
    }
}

#[test]
fn pipeline_split_is_bitwise_identical() {
    let config = model();
    let request = greedy_request();
    let single = decode(&config, ParallelConfig::new(1, 1), &request, 1);
    let split = decode(&config, ParallelConfig::new(1, 2), &request, 1);
    assert_ranks_agree(&split);
    assert_eq!(split[0], single[0]);

    let (response, _) = &single[0];
    assert_eq!(&response.beam(0, 0)[..3], &[1, 2, 3]);
    assert_eq!(&response.beam(1, 0)[..3], &[4, 5, 15]);
    for &len in response.sequence_length() {
        assert!((4..=9).contains(&len), "{len}");
    }
}

#[test]
fn tensor_and_pipeline_ranks_agree() {
    let config = model();
    let runs = decode(&config, ParallelConfig::new(2, 2), &greedy_request(), 1);
    assert_ranks_agree(&runs);
}

#[test]
fn beam_search_on_grid() {
    let config: DeploymentConfig = DeploymentConfig::from_json(
        r#"{
            "model": {"head_num": 4, "size_per_head": 4, "vocab_size": 16,
                      "decoder_layers": 2, "max_seq_len": 16, "start_id": 0, "end_id": 15},
            "parallelism": {"tensor_parallel_size": 2, "pipeline_parallel_size": 2},
            "generation": {"beam_width": 3, "top_k": 0, "top_p": 0.0,
                           "beam_search_diversity_rate": 0.1},
            "request": {"batch_size": 2, "input_len": 2, "output_len": 5}
        }"#,
    )
    .unwrap();
    let request = config.build_request().unwrap();
    let runs = decode(&config.model, config.parallelism, &request, 3);
    assert_ranks_agree(&runs);

    let (response, out) = &runs[0];
    assert!(out.steps >= 1 && out.steps <= 5);
    let cum = response.cum_log_probs().unwrap();
    let last = &cum[cum.len() - 6..];
    for scores in last.chunks(3) {
        assert!(scores.iter().all(|s| s.is_finite() && *s <= 0.0), "{scores:?}");
    }
}
