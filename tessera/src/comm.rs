//! Communicator trait and per-rank group handles
//!
//! A communicator spans one group of ranks (a tensor-parallel group, a
//! pipeline-parallel group, or the whole world). Ranks passed to its methods
//! are positions within that group, not global ranks.

use crate::error::Result;
use crate::topology::RankCoordinate;

/// What a point-to-point packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Hidden states handed from one pipeline stage to the next.
    Activations,
    /// Token decisions taken by the last pipeline stage for one step.
    Decision,
}

/// A point-to-point or broadcast message, tagged with the decode step it
/// belongs to so that out-of-step traffic is detectable.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub step: usize,
    pub kind: PacketKind,
    pub values: Vec<f32>,
    pub ids: Vec<u32>,
}

impl Packet {
    #[must_use]
    pub fn activations(step: usize, values: Vec<f32>) -> Self {
        Self {
            step,
            kind: PacketKind::Activations,
            values,
            ids: Vec::new(),
        }
    }

    #[must_use]
    pub fn decision(step: usize, ids: Vec<u32>, values: Vec<f32>) -> Self {
        Self {
            step,
            kind: PacketKind::Decision,
            values,
            ids,
        }
    }
}

/// Collective and point-to-point operations over one rank group.
///
/// Every method blocks until the operation completes on this rank. All
/// members of a group must issue the same collectives in the same order.
pub trait Communicator: Send {
    /// This rank's index within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Sum `data` across the group in place. Contributions are added in
    /// rank order, so every member ends with bit-identical values.
    ///
    /// # Errors
    /// Returns an error if a peer is gone or sends mismatched data.
    fn all_reduce_sum_inplace(&self, data: &mut [f32]) -> Result<()>;

    /// Concatenate every rank's `local` slice in rank order.
    ///
    /// # Errors
    /// Returns an error if a peer is gone.
    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>>;

    /// Send a packet to `dst`.
    ///
    /// # Errors
    /// Returns an error if the receiver is gone.
    fn send(&self, dst: usize, packet: Packet) -> Result<()>;

    /// Blocking receive of the next packet from `src`.
    ///
    /// # Errors
    /// Returns an error if the sender is gone.
    fn recv(&self, src: usize) -> Result<Packet>;

    /// Broadcast from `root`. The root passes `Some(packet)`; everyone
    /// returns the root's packet.
    ///
    /// # Errors
    /// Returns an error if the root passes `None` or a peer is gone.
    fn broadcast(&self, root: usize, packet: Option<Packet>) -> Result<Packet>;

    /// Block until every member reaches the barrier.
    ///
    /// # Errors
    /// Returns an error if a peer is gone.
    fn barrier(&self) -> Result<()>;
}

/// The three communicators a rank holds.
pub struct RankGroups<C> {
    pub coordinate: RankCoordinate,
    /// Ranks sharing this pipeline stage, indexed by tensor-parallel rank.
    pub tensor: C,
    /// Ranks holding the same tensor shard, indexed by pipeline stage.
    pub pipeline: C,
    pub world: C,
}

impl<C: Communicator> std::fmt::Debug for RankGroups<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankGroups")
            .field("coordinate", &self.coordinate)
            .field("tensor_size", &self.tensor.world_size())
            .field("pipeline_size", &self.pipeline.world_size())
            .finish_non_exhaustive()
    }
}
