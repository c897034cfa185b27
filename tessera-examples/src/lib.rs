//! Shared helpers for the example binaries.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a stdout subscriber filtered by `RUST_LOG`, falling back to
/// `default_level`. Safe to call more than once.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_names(true))
        .try_init();
}

/// `request_output_len` values for a sweep: 128, doubling while below
/// 4096, never past what fits after the prompt.
#[must_use]
pub fn sweep_lengths(max_input_len: usize, max_seq_len: usize) -> Vec<usize> {
    let room = max_seq_len.saturating_sub(max_input_len);
    let mut lengths = Vec::new();
    let mut len = 128;
    while len < 4096 {
        let clamped = len.min(room);
        if clamped == 0 || lengths.last() == Some(&clamped) {
            break;
        }
        lengths.push(clamped);
        len *= 2;
    }
    lengths
}
