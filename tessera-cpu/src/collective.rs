//! In-process collectives
//!
//! Every rank runs on its own thread. A group of `n` ranks is wired with one
//! channel per ordered pair, so messages between two ranks arrive in the
//! order they were sent. Collectives are built from these channels; a rank
//! that receives a different kind of message than it expects reports the
//! group as out of step.

use std::sync::mpsc::{channel, Receiver, Sender};

use tessera::{Communicator, Error, Packet, ParallelConfig, RankGroups, Result};

enum Envelope {
    Reduce(Vec<f32>),
    Gather(Vec<f32>),
    Packet(Packet),
    Barrier,
}

impl Envelope {
    fn name(&self) -> &'static str {
        match self {
            Self::Reduce(_) => "all-reduce",
            Self::Gather(_) => "all-gather",
            Self::Packet(_) => "packet",
            Self::Barrier => "barrier",
        }
    }
}

/// One rank's endpoint in a channel-connected group.
pub struct LocalComm {
    rank: usize,
    world_size: usize,
    /// Indexed by destination rank; `None` for self.
    senders: Vec<Option<Sender<Envelope>>>,
    /// Indexed by source rank; `None` for self.
    receivers: Vec<Option<Receiver<Envelope>>>,
}

impl LocalComm {
    /// A group of one.
    #[must_use]
    pub fn solo() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            senders: vec![None],
            receivers: vec![None],
        }
    }

    /// Endpoints for a fully connected group of `n` ranks, in rank order.
    #[must_use]
    pub fn group(n: usize) -> Vec<Self> {
        let mut senders: Vec<Vec<Option<Sender<Envelope>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<Receiver<Envelope>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        for src in 0..n {
            for dst in 0..n {
                if src != dst {
                    let (tx, rx) = channel();
                    senders[src][dst] = Some(tx);
                    receivers[dst][src] = Some(rx);
                }
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| Self {
                rank,
                world_size: n,
                senders,
                receivers,
            })
            .collect()
    }

    fn post(&self, dst: usize, envelope: Envelope) -> Result<()> {
        let tx = self
            .senders
            .get(dst)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::Comm(format!("rank {} cannot send to {dst}", self.rank)))?;
        tx.send(envelope)
            .map_err(|_| Error::Comm(format!("rank {dst} disconnected")))
    }

    fn take(&self, src: usize) -> Result<Envelope> {
        let rx = self
            .receivers
            .get(src)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::Comm(format!("rank {} cannot receive from {src}", self.rank)))?;
        rx.recv()
            .map_err(|_| Error::Comm(format!("rank {src} disconnected")))
    }

    fn out_of_step(&self, src: usize, expected: &str, got: &Envelope) -> Error {
        Error::Comm(format!(
            "group out of step: rank {} expected {expected} from rank {src}, got {}",
            self.rank,
            got.name()
        ))
    }

    fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.world_size).filter(move |&r| r != self.rank)
    }

    /// Exchange `local` with every peer; returns all contributions in rank
    /// order.
    fn exchange(&self, local: &[f32], reduce: bool) -> Result<Vec<Vec<f32>>> {
        for dst in self.peers() {
            let payload = local.to_vec();
            let envelope = if reduce {
                Envelope::Reduce(payload)
            } else {
                Envelope::Gather(payload)
            };
            self.post(dst, envelope)?;
        }
        let mut parts = Vec::with_capacity(self.world_size);
        for src in 0..self.world_size {
            if src == self.rank {
                parts.push(local.to_vec());
                continue;
            }
            let part = match (self.take(src)?, reduce) {
                (Envelope::Reduce(v), true) | (Envelope::Gather(v), false) => v,
                (other, _) => {
                    let expected = if reduce { "all-reduce" } else { "all-gather" };
                    return Err(self.out_of_step(src, expected, &other));
                }
            };
            if reduce && part.len() != local.len() {
                return Err(Error::Comm(format!(
                    "all-reduce length mismatch: rank {src} sent {}, rank {} has {}",
                    part.len(),
                    self.rank,
                    local.len()
                )));
            }
            parts.push(part);
        }
        Ok(parts)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum_inplace(&self, data: &mut [f32]) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        let parts = self.exchange(data, true)?;
        data.copy_from_slice(&parts[0]);
        for part in &parts[1..] {
            for (acc, v) in data.iter_mut().zip(part) {
                *acc += v;
            }
        }
        Ok(())
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>> {
        if self.world_size == 1 {
            return Ok(local.to_vec());
        }
        Ok(self.exchange(local, false)?.concat())
    }

    fn send(&self, dst: usize, packet: Packet) -> Result<()> {
        self.post(dst, Envelope::Packet(packet))
    }

    fn recv(&self, src: usize) -> Result<Packet> {
        match self.take(src)? {
            Envelope::Packet(packet) => Ok(packet),
            other => Err(self.out_of_step(src, "packet", &other)),
        }
    }

    fn broadcast(&self, root: usize, packet: Option<Packet>) -> Result<Packet> {
        if self.rank == root {
            let packet = packet.ok_or_else(|| {
                Error::Comm(format!("broadcast root {root} has nothing to send"))
            })?;
            for dst in self.peers() {
                self.send(dst, packet.clone())?;
            }
            Ok(packet)
        } else {
            self.recv(root)
        }
    }

    fn barrier(&self) -> Result<()> {
        for dst in self.peers() {
            self.post(dst, Envelope::Barrier)?;
        }
        for src in self.peers() {
            match self.take(src)? {
                Envelope::Barrier => {}
                other => return Err(self.out_of_step(src, "barrier", &other)),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

/// Build the tensor, pipeline and world groups of every rank in a
/// `tp × pp` grid. Entry `r` belongs to global rank `r`.
///
/// # Errors
/// Returns `InvalidTopology` for a zero-sized grid.
pub fn initialize_groups(config: ParallelConfig) -> Result<Vec<RankGroups<LocalComm>>> {
    let world_size = config.world_size();
    config.validate_world(world_size)?;
    let tp = config.tensor_parallel_size;
    let pp = config.pipeline_parallel_size;

    let mut tensor: Vec<Option<LocalComm>> = (0..world_size).map(|_| None).collect();
    for p in 0..pp {
        for (t, comm) in LocalComm::group(tp).into_iter().enumerate() {
            tensor[p * tp + t] = Some(comm);
        }
    }
    let mut pipeline: Vec<Option<LocalComm>> = (0..world_size).map(|_| None).collect();
    for t in 0..tp {
        for (p, comm) in LocalComm::group(pp).into_iter().enumerate() {
            pipeline[p * tp + t] = Some(comm);
        }
    }

    LocalComm::group(world_size)
        .into_iter()
        .zip(tensor.into_iter().zip(pipeline))
        .enumerate()
        .map(|(rank, (world, pair))| {
            let coordinate = config.coordinate(rank)?;
            match pair {
                (Some(tensor), Some(pipeline)) => Ok(RankGroups {
                    coordinate,
                    tensor,
                    pipeline,
                    world,
                }),
                _ => Err(Error::InvalidTopology(format!(
                    "rank {rank} was not assigned to a group"
                ))),
            }
        })
        .collect()
}
