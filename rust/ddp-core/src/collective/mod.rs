//! Process group and collective operations.
//!
//! A [`ProcessGroup`] is the handle a rank holds after rendezvous. It offers
//! the three collectives the training loop needs (all-reduce, barrier and
//! broadcast) on top of a swappable [`Transport`].
//!
//! Every collective is blocking and every rank must issue the same sequence
//! of collectives. Each call carries a sequence number and a kind tag, so a
//! rank that diverges fails loudly instead of exchanging the wrong data.
//!
//! # Example
//!
//! ```no_run
//! use ddp_core::collective::{Backend, ProcessGroup, ReduceOp};
//! use ddp_core::config::RendezvousConfig;
//! use ddp_core::topology::{PlacementMetadata, Topology};
//!
//! # fn main() -> ddp_core::Result<()> {
//! let topology = Topology::resolve(PlacementMetadata::from_env())?;
//! let mut group = ProcessGroup::join(&topology, Backend::Tcp, &RendezvousConfig::default())?;
//!
//! let summed = group.all_reduce(&[1.0f32, 2.0], ReduceOp::Sum)?;
//! group.barrier()?;
//! group.leave()?;
//! # let _ = summed;
//! # Ok(())
//! # }
//! ```

mod local;
mod tcp;
mod wire;

pub use local::{LocalCluster, LocalEndpoint};

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RendezvousConfig;
use crate::error::{Result, RuntimeError};
use crate::topology::Topology;

/// Element-wise reduction applied by [`ProcessGroup::all_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

/// Element types that can be all-reduced.
pub trait Reducible: Copy + Serialize + DeserializeOwned + Send + 'static {
    fn combine(self, other: Self, op: ReduceOp) -> Self;
}

impl Reducible for f32 {
    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => self + other,
            ReduceOp::Max => self.max(other),
            ReduceOp::Min => self.min(other),
        }
    }
}

impl Reducible for f64 {
    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => self + other,
            ReduceOp::Max => self.max(other),
            ReduceOp::Min => self.min(other),
        }
    }
}

impl Reducible for u64 {
    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => self.wrapping_add(other),
            ReduceOp::Max => self.max(other),
            ReduceOp::Min => self.min(other),
        }
    }
}

/// Tag carried by every collective message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectiveKind {
    AllReduce,
    Barrier,
    Broadcast,
}

impl fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CollectiveKind::AllReduce => "all_reduce",
            CollectiveKind::Barrier => "barrier",
            CollectiveKind::Broadcast => "broadcast",
        })
    }
}

/// Byte-level exchange underneath a [`ProcessGroup`].
///
/// Implementations move opaque payloads; typing, reduction and sequence
/// bookkeeping live in the group. A transport must report a departed,
/// aborted or mismatched peer as `CollectiveFailure`.
pub trait Transport: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Exchanges one payload per rank. The result is indexed by rank and
    /// includes this rank's own payload.
    fn all_gather(
        &mut self,
        seq: u64,
        kind: CollectiveKind,
        payload: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>>;

    /// Delivers `src`'s payload to every rank. Only `src` supplies a payload.
    fn broadcast(&mut self, seq: u64, payload: Option<Vec<u8>>, src: usize) -> Result<Vec<u8>>;

    /// Tells peers this rank is failing. Best effort, never blocks for long.
    fn abort(&mut self, reason: &str);

    /// Releases the transport after the last collective.
    fn leave(&mut self) -> Result<()>;
}

/// Which transport `join` builds.
pub enum Backend {
    /// TCP star through rank 0 at `master_addr:master_port`.
    Tcp,
    /// In-process channels, one endpoint per rank.
    InProcess(LocalEndpoint),
}

/// Membership handle for one rank of a running group.
pub struct ProcessGroup {
    topology: Topology,
    transport: Box<dyn Transport>,
    seq: u64,
    failed: Option<String>,
    left: bool,
}

impl ProcessGroup {
    /// Blocks until every rank of `topology.world_size()` has joined.
    ///
    /// # Errors
    ///
    /// `RendezvousTimeout` if the group is not complete within
    /// `join_timeout_ms`; `Rendezvous` on inconsistent membership.
    pub fn join(topology: &Topology, backend: Backend, config: &RendezvousConfig) -> Result<Self> {
        debug!(%topology, "joining process group");
        let transport: Box<dyn Transport> = match backend {
            Backend::Tcp => Box::new(tcp::TcpTransport::connect(topology, config)?),
            Backend::InProcess(endpoint) => Box::new(endpoint.join(topology, config)?),
        };

        info!(
            rank = topology.rank(),
            world_size = topology.world_size(),
            backend = transport.name(),
            "process group joined"
        );

        Ok(Self::from_transport(topology.clone(), transport))
    }

    /// Wraps an already-rendezvoused transport.
    pub fn from_transport(topology: Topology, transport: Box<dyn Transport>) -> Self {
        Self {
            topology,
            transport,
            seq: 0,
            failed: None,
            left: false,
        }
    }

    pub fn rank(&self) -> usize {
        self.topology.rank()
    }

    pub fn world_size(&self) -> usize {
        self.topology.world_size()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Reduces `values` element-wise across all ranks.
    ///
    /// Buffers are combined in ascending rank order on every rank, so the
    /// result is bit-identical everywhere.
    pub fn all_reduce<T: Reducible>(&mut self, values: &[T], op: ReduceOp) -> Result<Vec<T>> {
        let payload = encode(CollectiveKind::AllReduce, values)?;
        let gathered = self.gather(CollectiveKind::AllReduce, payload)?;

        let mut reduced: Option<Vec<T>> = None;
        for (rank, bytes) in gathered.iter().enumerate() {
            let buffer: Vec<T> = decode(CollectiveKind::AllReduce, bytes)?;
            if buffer.len() != values.len() {
                let message = format!(
                    "rank {rank} contributed {} elements, expected {}",
                    buffer.len(),
                    values.len()
                );
                self.failed = Some(message.clone());
                return Err(RuntimeError::collective(CollectiveKind::AllReduce.to_string(), message));
            }
            reduced = Some(match reduced {
                None => buffer,
                Some(mut acc) => {
                    for (a, b) in acc.iter_mut().zip(buffer) {
                        *a = a.combine(b, op);
                    }
                    acc
                }
            });
        }

        Ok(reduced.unwrap_or_default())
    }

    /// In-place variant of [`all_reduce`](Self::all_reduce).
    pub fn all_reduce_in_place<T: Reducible>(&mut self, values: &mut [T], op: ReduceOp) -> Result<()> {
        let reduced = self.all_reduce(values, op)?;
        values.copy_from_slice(&reduced);
        Ok(())
    }

    /// Returns once every rank has entered the barrier.
    pub fn barrier(&mut self) -> Result<()> {
        self.gather(CollectiveKind::Barrier, Vec::new()).map(|_| ())
    }

    /// Delivers `src`'s value to every rank.
    ///
    /// `src` must pass `Some`; other ranks' values are ignored.
    pub fn broadcast<T>(&mut self, value: Option<T>, src: usize) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let kind = CollectiveKind::Broadcast;
        self.ensure_usable(kind)?;
        if src >= self.world_size() {
            return Err(RuntimeError::collective(
                kind.to_string(),
                format!("source rank {src} is outside a world of size {}", self.world_size()),
            ));
        }

        let payload = if self.rank() == src {
            let value = value.ok_or_else(|| {
                RuntimeError::collective(kind.to_string(), "source rank supplied no value")
            })?;
            Some(encode(kind, &value)?)
        } else {
            None
        };

        self.seq += 1;
        let bytes = match self.transport.broadcast(self.seq, payload, src) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.failed = Some(e.to_string());
                return Err(e);
            }
        };
        decode(kind, &bytes)
    }

    /// Signals a local failure to every peer so their next collective fails.
    pub fn abort(&mut self, reason: &str) {
        warn!(rank = self.rank(), reason, "aborting process group");
        self.transport.abort(reason);
        self.failed = Some(format!("aborted locally: {reason}"));
    }

    /// Releases membership after the last collective.
    pub fn leave(mut self) -> Result<()> {
        self.left = true;
        info!(rank = self.rank(), collectives = self.seq, "leaving process group");
        self.transport.leave()
    }

    fn gather(&mut self, kind: CollectiveKind, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.ensure_usable(kind)?;
        self.seq += 1;

        match self.transport.all_gather(self.seq, kind, payload) {
            Ok(gathered) if gathered.len() == self.world_size() => Ok(gathered),
            Ok(gathered) => {
                let message = format!(
                    "received {} contributions for a world of size {}",
                    gathered.len(),
                    self.world_size()
                );
                self.failed = Some(message.clone());
                Err(RuntimeError::collective(kind.to_string(), message))
            }
            Err(e) => {
                self.failed = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn ensure_usable(&self, kind: CollectiveKind) -> Result<()> {
        match &self.failed {
            Some(cause) => Err(RuntimeError::collective(
                kind.to_string(),
                format!("process group is no longer usable: {cause}"),
            )),
            None => Ok(()),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if !self.left {
            debug!(rank = self.rank(), "process group dropped without leave, releasing");
            if let Err(e) = self.transport.leave() {
                debug!(error = %e, "release on drop failed");
            }
        }
    }
}

fn encode<T: Serialize + ?Sized>(kind: CollectiveKind, value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| RuntimeError::serialization(format!("failed to encode {kind} payload: {e}")))
}

fn decode<T: DeserializeOwned>(kind: CollectiveKind, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| RuntimeError::serialization(format!("failed to decode {kind} payload: {e}")))
}
