//! In-process transport over crossbeam channels.
//!
//! Used by the `simulate` launcher and by multi-rank tests, one thread per
//! rank. Every ordered pair of ranks gets its own channel, so messages from
//! one peer arrive in send order.

use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use super::wire::Frame;
use super::{CollectiveKind, Transport};
use crate::config::RendezvousConfig;
use crate::error::{Result, RuntimeError};
use crate::topology::Topology;

/// Factory for a fully connected set of in-process endpoints.
pub struct LocalCluster;

impl LocalCluster {
    /// Creates one endpoint per rank, indexed by rank.
    pub fn new(world_size: usize) -> Vec<LocalEndpoint> {
        let mut senders: Vec<Vec<Option<Sender<Frame>>>> = (0..world_size)
            .map(|_| (0..world_size).map(|_| None).collect())
            .collect();
        let mut receivers: Vec<Vec<Option<Receiver<Frame>>>> = (0..world_size)
            .map(|_| (0..world_size).map(|_| None).collect())
            .collect();

        for from in 0..world_size {
            for to in 0..world_size {
                if from != to {
                    let (tx, rx) = channel::unbounded();
                    senders[from][to] = Some(tx);
                    receivers[to][from] = Some(rx);
                }
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| LocalEndpoint {
                rank,
                cluster_size: world_size,
                senders,
                receivers,
            })
            .collect()
    }
}

/// One rank's unjoined connection to a [`LocalCluster`].
pub struct LocalEndpoint {
    rank: usize,
    cluster_size: usize,
    senders: Vec<Option<Sender<Frame>>>,
    receivers: Vec<Option<Receiver<Frame>>>,
}

impl LocalEndpoint {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub(crate) fn join(self, topology: &Topology, config: &RendezvousConfig) -> Result<LocalTransport> {
        let deadline = Instant::now() + config.join_timeout();

        if topology.rank() != self.rank {
            return Err(RuntimeError::rendezvous(format!(
                "endpoint for rank {} used by rank {}",
                self.rank,
                topology.rank()
            )));
        }

        // Announce first so peers can detect a mismatch even if we fail below.
        let hello = Frame::Hello {
            rank: self.rank,
            world_size: topology.world_size(),
            host_id: topology.host_id().to_string(),
        };
        for sender in self.senders.iter().flatten() {
            let _ = sender.send(hello.clone());
        }

        if topology.world_size() != self.cluster_size {
            return Err(RuntimeError::rendezvous(format!(
                "rank {} expects world size {} but the cluster has {} ranks",
                self.rank,
                topology.world_size(),
                self.cluster_size
            )));
        }

        let mut joined = 1;
        for peer in 0..self.cluster_size {
            let Some(rx) = &self.receivers[peer] else {
                continue;
            };
            match rx.recv_deadline(deadline) {
                Ok(Frame::Hello {
                    rank, world_size, ..
                }) => {
                    if rank != peer {
                        return Err(RuntimeError::rendezvous(format!(
                            "peer {peer} announced itself as rank {rank}"
                        )));
                    }
                    if world_size != self.cluster_size {
                        return Err(RuntimeError::rendezvous(format!(
                            "rank {peer} reports world size {world_size}, expected {}",
                            self.cluster_size
                        )));
                    }
                    joined += 1;
                }
                Ok(other) => {
                    return Err(RuntimeError::rendezvous(format!(
                        "unexpected {} frame from rank {peer} during rendezvous",
                        other.name()
                    )));
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Count late peers that did announce so the error is accurate.
                    let late = self.receivers[peer + 1..]
                        .iter()
                        .flatten()
                        .filter(|rx| matches!(rx.try_recv(), Ok(Frame::Hello { .. })))
                        .count();
                    return Err(RuntimeError::rendezvous_timeout(
                        self.cluster_size,
                        joined + late,
                        config.join_timeout_ms,
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RuntimeError::rendezvous(format!(
                        "rank {peer} went away before rendezvous completed"
                    )));
                }
            }
        }

        debug!(rank = self.rank, joined, "in-process rendezvous complete");
        Ok(LocalTransport {
            rank: self.rank,
            world_size: self.cluster_size,
            senders: self.senders,
            receivers: self.receivers,
            collective_timeout: config.collective_timeout(),
        })
    }
}

pub(crate) struct LocalTransport {
    rank: usize,
    world_size: usize,
    senders: Vec<Option<Sender<Frame>>>,
    receivers: Vec<Option<Receiver<Frame>>>,
    collective_timeout: Option<Duration>,
}

impl LocalTransport {
    fn send(&self, peer: usize, frame: Frame, op: CollectiveKind) -> Result<()> {
        match &self.senders[peer] {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| RuntimeError::collective(op.to_string(), format!("rank {peer} is gone"))),
            None => Ok(()),
        }
    }

    fn recv(&self, peer: usize, op: CollectiveKind) -> Result<Frame> {
        let Some(rx) = &self.receivers[peer] else {
            return Err(RuntimeError::collective(
                op.to_string(),
                format!("no link to rank {peer}"),
            ));
        };

        let frame = match self.collective_timeout {
            Some(limit) => rx.recv_timeout(limit).map_err(|e| match e {
                RecvTimeoutError::Timeout => RuntimeError::collective(
                    op.to_string(),
                    format!("timed out after {}ms waiting for rank {peer}", limit.as_millis()),
                ),
                RecvTimeoutError::Disconnected => disconnected(op, peer),
            })?,
            None => rx.recv().map_err(|_| disconnected(op, peer))?,
        };

        match frame {
            Frame::Abort { reason } => Err(RuntimeError::collective(
                op.to_string(),
                format!("rank {peer} aborted: {reason}"),
            )),
            Frame::Leave { .. } => Err(RuntimeError::collective(
                op.to_string(),
                format!("rank {peer} left the group"),
            )),
            frame => Ok(frame),
        }
    }

    fn broadcast_frame(&self, frame: &Frame, op: CollectiveKind) -> Result<()> {
        for peer in (0..self.world_size).filter(|p| *p != self.rank) {
            self.send(peer, frame.clone(), op)?;
        }
        Ok(())
    }
}

fn disconnected(op: CollectiveKind, peer: usize) -> RuntimeError {
    RuntimeError::collective(op.to_string(), format!("rank {peer} disconnected"))
}

impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn all_gather(
        &mut self,
        seq: u64,
        kind: CollectiveKind,
        payload: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>> {
        self.broadcast_frame(
            &Frame::Gather {
                seq,
                kind,
                payload: payload.clone(),
            },
            kind,
        )?;

        let mut gathered = Vec::with_capacity(self.world_size);
        for peer in 0..self.world_size {
            if peer == self.rank {
                gathered.push(payload.clone());
                continue;
            }
            match self.recv(peer, kind)? {
                Frame::Gather {
                    seq: s,
                    kind: k,
                    payload,
                } if s == seq && k == kind => gathered.push(payload),
                Frame::Gather { seq: s, kind: k, .. } => {
                    return Err(RuntimeError::collective(
                        kind.to_string(),
                        format!("rank {peer} is at {k} #{s}, this rank is at {kind} #{seq}"),
                    ));
                }
                other => {
                    return Err(RuntimeError::collective(
                        kind.to_string(),
                        format!("unexpected {} frame from rank {peer}", other.name()),
                    ));
                }
            }
        }
        Ok(gathered)
    }

    fn broadcast(&mut self, seq: u64, payload: Option<Vec<u8>>, src: usize) -> Result<Vec<u8>> {
        let kind = CollectiveKind::Broadcast;
        if src == self.rank {
            let payload = payload.ok_or_else(|| {
                RuntimeError::collective(kind.to_string(), "source rank supplied no payload")
            })?;
            self.broadcast_frame(
                &Frame::Broadcast {
                    seq,
                    src,
                    payload: payload.clone(),
                },
                kind,
            )?;
            return Ok(payload);
        }

        match self.recv(src, kind)? {
            Frame::Broadcast {
                seq: s,
                src: from,
                payload,
            } if s == seq && from == src => Ok(payload),
            Frame::Broadcast { seq: s, src: from, .. } => Err(RuntimeError::collective(
                kind.to_string(),
                format!("expected broadcast #{seq} from rank {src}, got #{s} from rank {from}"),
            )),
            Frame::Gather { seq: s, kind: k, .. } => Err(RuntimeError::collective(
                kind.to_string(),
                format!("rank {src} is at {k} #{s}, this rank is at {kind} #{seq}"),
            )),
            other => Err(RuntimeError::collective(
                kind.to_string(),
                format!("unexpected {} frame from rank {src}", other.name()),
            )),
        }
    }

    fn abort(&mut self, reason: &str) {
        for tx in self.senders.iter().flatten() {
            let _ = tx.send(Frame::Abort {
                reason: reason.to_string(),
            });
        }
    }

    fn leave(&mut self) -> Result<()> {
        for tx in self.senders.iter_mut().filter_map(Option::take) {
            let _ = tx.send(Frame::Leave { rank: self.rank });
        }
        Ok(())
    }
}
