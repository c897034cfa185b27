//! One thread per rank of the process grid

use std::thread;

use tessera::{Error, ErrorKind, RankGroups, Result};
use tracing::info_span;

/// Run `body` once per rank, each on its own named thread, and collect the
/// results in global-rank order.
///
/// When a rank fails its communicators are dropped, which unblocks peers
/// waiting on it with a communication error. The reported error is the
/// first one that is not such a knock-on failure, so the root cause wins.
///
/// # Errors
/// The root-cause error of any failed rank; a panicking rank is reported
/// as `DeviceExecution`.
pub fn run_grid<C, R, F>(groups: Vec<RankGroups<C>>, body: F) -> Result<Vec<R>>
where
    C: Send,
    R: Send,
    F: Fn(RankGroups<C>) -> Result<R> + Sync,
{
    let body = &body;
    let results: Vec<Result<R>> = thread::scope(|s| {
        let handles = groups
            .into_iter()
            .map(|groups| {
                let rank = groups.coordinate.global_rank;
                thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(s, move || {
                        let _span = info_span!("rank", rank).entered();
                        body(groups)
                    })
                    .map(|handle| (rank, handle))
                    .map_err(Error::from)
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|spawned| {
                let (rank, handle) = spawned?;
                handle
                    .join()
                    .map_err(|_| Error::DeviceExecution(format!("rank {rank} panicked")))?
            })
            .collect()
    });

    let mut first_error = None;
    let mut values = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                let root_cause = e.kind() != ErrorKind::Communication;
                match &first_error {
                    None => first_error = Some(e),
                    Some(prev) if root_cause && prev.kind() == ErrorKind::Communication => {
                        first_error = Some(e);
                    }
                    Some(_) => {}
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(values),
    }
}
