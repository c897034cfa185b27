//! FP8 GPT decoding benchmark on an in-process tensor × pipeline grid
//!
//! Builds a randomly initialised model from a deployment config, spawns one
//! thread per rank, runs one warm-up invocation and then times `-n`
//! invocations between world barriers.
//!
//! Usage:
//!   cargo run --release -p tessera-examples --example generate --
//!     tessera-examples/configs/gpt_fp8.json -n 10
//!   # Sweep the generation length from 128 upwards:
//!   cargo run --release -p tessera-examples --example generate --
//!     tessera-examples/configs/gpt_fp8.json --sweep

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};

use tessera::Result;
use tessera_cpu::{initialize_groups, ExecutionContext, GptStage, MatmulEngine, RandomWeights};
use tessera_examples::{init_tracing, sweep_lengths};
use tessera_runtime::{run_grid, DecodeEngine, DeploymentConfig, ResponseBuffers};

/// Distributed FP8 decoding benchmark
#[derive(Parser)]
#[command(name = "generate")]
struct Cli {
    /// Deployment config (JSON)
    #[arg(default_value = "tessera-examples/configs/gpt_fp8.json")]
    config: PathBuf,

    /// Devices to spread ranks over; rank r runs on device r % count
    #[arg(long, env = "TESSERA_DEVICE_COUNT")]
    device_count: Option<usize>,

    /// Timed invocations per length
    #[arg(short = 'n', long, default_value_t = 10)]
    iterations: usize,

    /// Sweep request_output_len over 128, 256, ... instead of the
    /// configured length
    #[arg(long)]
    sweep: bool,

    /// GEMM algorithm map (JSON list of {m, n, k, algorithm})
    #[arg(long)]
    algo_map: Option<PathBuf>,

    /// Seed for the random weights
    #[arg(long, default_value_t = 0)]
    weights_seed: u64,
}

/// Average latency of one configuration, as measured on rank 0.
struct Timing {
    output_len: usize,
    millis: f64,
}

fn run(cli: &Cli) -> Result<()> {
    let config = DeploymentConfig::from_file(&cli.config)?;
    let world_size = config.parallelism.world_size();
    let device_count = cli.device_count.unwrap_or(world_size);
    info!(
        world_size,
        tensor_parallel = config.parallelism.tensor_parallel_size,
        pipeline_parallel = config.parallelism.pipeline_parallel_size,
        device_count,
        "starting grid"
    );

    let base = config.build_request()?;
    let lengths = if cli.sweep {
        sweep_lengths(base.max_input_len(), config.model.max_seq_len)
    } else {
        vec![config.request.output_len]
    };
    let beam_width = config.generation.beam_width;

    let groups = initialize_groups(config.parallelism)?;
    let timings = run_grid(groups, |g| {
        let rank = g.coordinate.global_rank;
        let ctx = ExecutionContext::for_rank(rank, device_count, world_size)?;
        let matmul = MatmulEngine::new(ctx, config.model.precision);
        if let Some(path) = &cli.algo_map {
            let entries = matmul.load_algorithm_map(path)?;
            info!(entries, "loaded gemm algorithm map");
        }
        let stage = GptStage::load(
            config.model.clone(),
            g.coordinate,
            matmul,
            g.tensor,
            &RandomWeights::new(cli.weights_seed),
        )?;
        let mut engine = DecodeEngine::new(stage, g.pipeline, g.world, beam_width)?;

        let mut timings = Vec::with_capacity(lengths.len());
        for &output_len in &lengths {
            let request = config.with_output_len(output_len).build_request()?;
            let inputs = request.tensor_map();
            let mut response = ResponseBuffers::for_request(&request, beam_width, false);

            engine.forward(&mut response.tensor_map_mut(), &inputs)?;
            engine.barrier()?;

            let start = Instant::now();
            for _ in 0..cli.iterations {
                engine.forward(&mut response.tensor_map_mut(), &inputs)?;
            }
            engine.barrier()?;
            let elapsed = start.elapsed();

            timings.push(Timing {
                output_len,
                millis: elapsed.as_secs_f64() * 1000.0 / cli.iterations.max(1) as f64,
            });
        }
        Ok(timings)
    })?;

    let Some(rank0) = timings.into_iter().next() else {
        return Ok(());
    };
    for timing in rank0 {
        println!(
            "request_batch_size {} beam_width {} head_num {} size_per_head {} \
             total_output_len {} decoder_layers {} vocab_size {} decoding time {:.2} ms",
            config.request.batch_size,
            beam_width,
            config.model.head_num,
            config.model.size_per_head,
            base.max_input_len() + timing.output_len,
            config.model.decoder_layers,
            config.model.vocab_size,
            timing.millis,
        );
    }
    Ok(())
}

fn main() {
    init_tracing("info");
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        error!("{e}");
        process::exit(e.exit_code());
    }
}
