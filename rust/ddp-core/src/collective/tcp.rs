//! TCP transport.
//!
//! Rank 0 listens on `master_addr:master_port` and every other rank connects
//! to it, forming a star. Rank 0 validates membership during rendezvous and
//! relays every collective afterwards. Frames sent by rank 0 that carry a
//! failure are already attributed to the rank that caused it.
//!
//! The transport owns a current-thread tokio runtime and exposes a blocking
//! API, so the protocol is driven by the caller's thread only.

use std::io;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::wire::{self, Frame};
use super::{CollectiveKind, Transport};
use crate::config::RendezvousConfig;
use crate::error::{Result, RuntimeError};
use crate::topology::Topology;

/// Upper bound on best-effort writes made while failing or leaving.
const PARTING_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct TcpTransport {
    runtime: Runtime,
    session: Session,
}

impl TcpTransport {
    /// Performs the blocking rendezvous.
    pub(crate) fn connect(topology: &Topology, config: &RendezvousConfig) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RuntimeError::rendezvous(format!("failed to start I/O runtime: {e}")))?;

        let addr = format!("{}:{}", config.master_addr, config.master_port);
        let links = if topology.world_size() == 1 {
            Links::Master {
                workers: Vec::new(),
            }
        } else if topology.rank() == 0 {
            runtime.block_on(accept_workers(&addr, topology, config))?
        } else {
            runtime.block_on(connect_to_master(&addr, topology, config))?
        };

        Ok(Self {
            runtime,
            session: Session {
                rank: topology.rank(),
                collective_timeout: config.collective_timeout(),
                links,
            },
        })
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn all_gather(
        &mut self,
        seq: u64,
        kind: CollectiveKind,
        payload: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>> {
        self.runtime
            .block_on(self.session.all_gather(seq, kind, payload))
    }

    fn broadcast(&mut self, seq: u64, payload: Option<Vec<u8>>, src: usize) -> Result<Vec<u8>> {
        self.runtime.block_on(self.session.broadcast(seq, payload, src))
    }

    fn abort(&mut self, reason: &str) {
        self.runtime.block_on(self.session.abort(reason));
    }

    fn leave(&mut self) -> Result<()> {
        self.runtime.block_on(self.session.leave());
        Ok(())
    }
}

enum Links {
    /// Rank 0. `workers[i]` is the stream to rank `i + 1`.
    Master { workers: Vec<TcpStream> },
    Worker { master: TcpStream },
    Closed,
}

struct Session {
    rank: usize,
    collective_timeout: Option<Duration>,
    links: Links,
}

/// Why a receive from a peer produced no usable frame.
enum LinkError {
    Aborted(String),
    Left,
    Closed,
    TimedOut(Duration),
    Io(io::Error),
}

impl LinkError {
    fn describe(&self, peer: usize) -> String {
        match self {
            LinkError::Aborted(reason) => format!("rank {peer} aborted: {reason}"),
            LinkError::Left => format!("rank {peer} left the group"),
            LinkError::Closed => format!("rank {peer} disconnected"),
            LinkError::TimedOut(limit) => {
                format!("timed out after {}ms waiting for rank {peer}", limit.as_millis())
            }
            LinkError::Io(e) => format!("link to rank {peer} failed: {e}"),
        }
    }
}

async fn recv_from(
    stream: &mut TcpStream,
    limit: Option<Duration>,
) -> std::result::Result<Frame, LinkError> {
    let result = match limit {
        Some(limit) => time::timeout(limit, wire::read_frame(stream))
            .await
            .map_err(|_| LinkError::TimedOut(limit))?,
        None => wire::read_frame(stream).await,
    };

    match result {
        Ok(Some(Frame::Abort { reason })) => Err(LinkError::Aborted(reason)),
        Ok(Some(Frame::Leave { .. })) => Err(LinkError::Left),
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err(LinkError::Closed),
        Err(e) => Err(LinkError::Io(e)),
    }
}

async fn parting_write(stream: &mut TcpStream, frame: &Frame) {
    match time::timeout(PARTING_WRITE_TIMEOUT, wire::write_frame(stream, frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(frame = frame.name(), error = %e, "parting write failed"),
        Err(_) => debug!(frame = frame.name(), "parting write timed out"),
    }
}

fn mismatch(kind: CollectiveKind, peer: usize, got: &Frame, seq: u64) -> String {
    match got {
        Frame::Gather { seq: s, kind: k, .. } | Frame::Gathered { seq: s, kind: k, .. } => {
            format!("rank {peer} is at {k} #{s}, expected {kind} #{seq}")
        }
        Frame::Broadcast { seq: s, src, .. } => {
            format!("rank {peer} sent broadcast #{s} from rank {src}, expected {kind} #{seq}")
        }
        other => format!("unexpected {} frame from rank {peer}", other.name()),
    }
}

impl Session {
    async fn all_gather(
        &mut self,
        seq: u64,
        kind: CollectiveKind,
        payload: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>> {
        let limit = self.collective_timeout;
        let outcome = match &mut self.links {
            Links::Master { workers } => master_all_gather(workers, limit, seq, kind, payload).await,
            Links::Worker { master } => worker_all_gather(master, limit, seq, kind, payload).await,
            Links::Closed => Err("transport already released".to_string()),
        };
        self.settle(kind, outcome).await
    }

    async fn broadcast(&mut self, seq: u64, payload: Option<Vec<u8>>, src: usize) -> Result<Vec<u8>> {
        let kind = CollectiveKind::Broadcast;
        let limit = self.collective_timeout;
        let rank = self.rank;
        let outcome = match &mut self.links {
            Links::Master { workers } => master_broadcast(workers, limit, seq, payload, src).await,
            Links::Worker { master } => {
                worker_broadcast(master, limit, rank, seq, payload, src).await
            }
            Links::Closed => Err("transport already released".to_string()),
        };
        self.settle(kind, outcome).await
    }

    /// Turns a failed collective into an error, relaying it to workers first
    /// when this is rank 0.
    async fn settle<T>(
        &mut self,
        kind: CollectiveKind,
        outcome: std::result::Result<T, String>,
    ) -> Result<T> {
        match outcome {
            Ok(value) => Ok(value),
            Err(message) => {
                if let Links::Master { workers } = &mut self.links {
                    let frame = Frame::Abort {
                        reason: message.clone(),
                    };
                    for stream in workers.iter_mut() {
                        parting_write(stream, &frame).await;
                    }
                }
                Err(RuntimeError::collective(kind.to_string(), message))
            }
        }
    }

    async fn abort(&mut self, reason: &str) {
        match &mut self.links {
            Links::Master { workers } => {
                let frame = Frame::Abort {
                    reason: format!("rank 0 aborted: {reason}"),
                };
                for stream in workers.iter_mut() {
                    parting_write(stream, &frame).await;
                }
            }
            Links::Worker { master } => {
                let frame = Frame::Abort {
                    reason: reason.to_string(),
                };
                parting_write(master, &frame).await;
            }
            Links::Closed => {}
        }
    }

    async fn leave(&mut self) {
        let frame = Frame::Leave { rank: self.rank };
        match std::mem::replace(&mut self.links, Links::Closed) {
            Links::Master { mut workers } => {
                for stream in workers.iter_mut() {
                    parting_write(stream, &frame).await;
                }
            }
            Links::Worker { mut master } => parting_write(&mut master, &frame).await,
            Links::Closed => {}
        }
    }
}

async fn master_all_gather(
    workers: &mut [TcpStream],
    limit: Option<Duration>,
    seq: u64,
    kind: CollectiveKind,
    payload: Vec<u8>,
) -> std::result::Result<Vec<Vec<u8>>, String> {
    let mut gathered = Vec::with_capacity(workers.len() + 1);
    gathered.push(payload);

    for (i, stream) in workers.iter_mut().enumerate() {
        let peer = i + 1;
        match recv_from(stream, limit).await.map_err(|e| e.describe(peer))? {
            Frame::Gather {
                seq: s,
                kind: k,
                payload,
            } if s == seq && k == kind => gathered.push(payload),
            other => return Err(mismatch(kind, peer, &other, seq)),
        }
    }

    let bytes = wire::encode(&Frame::Gathered {
        seq,
        kind,
        payloads: gathered.clone(),
    })
    .map_err(|e| format!("failed to encode {kind} result: {e}"))?;
    for (i, stream) in workers.iter_mut().enumerate() {
        wire::write_encoded(stream, &bytes)
            .await
            .map_err(|e| LinkError::Io(e).describe(i + 1))?;
    }

    Ok(gathered)
}

async fn worker_all_gather(
    master: &mut TcpStream,
    limit: Option<Duration>,
    seq: u64,
    kind: CollectiveKind,
    payload: Vec<u8>,
) -> std::result::Result<Vec<Vec<u8>>, String> {
    wire::write_frame(master, &Frame::Gather { seq, kind, payload })
        .await
        .map_err(|e| LinkError::Io(e).describe(0))?;

    match recv_from(master, limit).await {
        Ok(Frame::Gathered {
            seq: s,
            kind: k,
            payloads,
        }) if s == seq && k == kind => Ok(payloads),
        Ok(other) => Err(mismatch(kind, 0, &other, seq)),
        // Rank 0 attributes relayed failures itself.
        Err(LinkError::Aborted(reason)) => Err(reason),
        Err(e) => Err(e.describe(0)),
    }
}

async fn master_broadcast(
    workers: &mut [TcpStream],
    limit: Option<Duration>,
    seq: u64,
    payload: Option<Vec<u8>>,
    src: usize,
) -> std::result::Result<Vec<u8>, String> {
    let kind = CollectiveKind::Broadcast;
    let payload = if src == 0 {
        payload.ok_or_else(|| "source rank supplied no payload".to_string())?
    } else {
        let stream = workers
            .get_mut(src - 1)
            .ok_or_else(|| format!("no link to source rank {src}"))?;
        match recv_from(stream, limit).await.map_err(|e| e.describe(src))? {
            Frame::Broadcast {
                seq: s,
                src: from,
                payload,
            } if s == seq && from == src => payload,
            other => return Err(mismatch(kind, src, &other, seq)),
        }
    };

    let bytes = wire::encode(&Frame::Broadcast {
        seq,
        src,
        payload: payload.clone(),
    })
    .map_err(|e| format!("failed to encode broadcast: {e}"))?;
    for (i, stream) in workers.iter_mut().enumerate() {
        let peer = i + 1;
        if peer == src {
            continue;
        }
        wire::write_encoded(stream, &bytes)
            .await
            .map_err(|e| LinkError::Io(e).describe(peer))?;
    }

    Ok(payload)
}

async fn worker_broadcast(
    master: &mut TcpStream,
    limit: Option<Duration>,
    rank: usize,
    seq: u64,
    payload: Option<Vec<u8>>,
    src: usize,
) -> std::result::Result<Vec<u8>, String> {
    let kind = CollectiveKind::Broadcast;
    if src == rank {
        let payload = payload.ok_or_else(|| "source rank supplied no payload".to_string())?;
        let frame = Frame::Broadcast {
            seq,
            src,
            payload: payload.clone(),
        };
        wire::write_frame(master, &frame)
            .await
            .map_err(|e| LinkError::Io(e).describe(0))?;
        return Ok(payload);
    }

    match recv_from(master, limit).await {
        Ok(Frame::Broadcast {
            seq: s,
            src: from,
            payload,
        }) if s == seq && from == src => Ok(payload),
        Ok(other) => Err(mismatch(kind, 0, &other, seq)),
        Err(LinkError::Aborted(reason)) => Err(reason),
        Err(e) => Err(e.describe(0)),
    }
}

async fn reject_all(streams: &mut [Option<TcpStream>], reason: &str) {
    let frame = Frame::Reject {
        reason: reason.to_string(),
    };
    for stream in streams.iter_mut().flatten() {
        parting_write(stream, &frame).await;
    }
}

async fn accept_workers(
    addr: &str,
    topology: &Topology,
    config: &RendezvousConfig,
) -> Result<Links> {
    let deadline = Instant::now() + config.join_timeout();
    let world_size = topology.world_size();

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RuntimeError::rendezvous(format!("failed to listen on {addr}: {e}")))?;
    info!(%addr, world_size, "waiting for ranks to join");

    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut joined = 1;

    while joined < world_size {
        let timed_out = || RuntimeError::rendezvous_timeout(world_size, joined, config.join_timeout_ms);

        let (mut stream, peer_addr) = match time::timeout_at(deadline, listener.accept()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
            Err(_) => {
                let err = timed_out();
                reject_all(&mut slots, &err.to_string()).await;
                return Err(err);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let hello = match time::timeout_at(deadline, wire::read_frame(&mut stream)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) | Ok(Err(_)) => {
                warn!(%peer_addr, "connection closed before hello");
                continue;
            }
            Err(_) => {
                let err = timed_out();
                reject_all(&mut slots, &err.to_string()).await;
                return Err(err);
            }
        };

        let (rank, announced, host_id) = match hello {
            Frame::Hello {
                rank,
                world_size,
                host_id,
            } => (rank, world_size, host_id),
            other => {
                warn!(%peer_addr, frame = other.name(), "expected hello, dropping connection");
                continue;
            }
        };

        let problem = if announced != world_size {
            Some(format!(
                "rank {rank} on {host_id} reports world size {announced}, expected {world_size}"
            ))
        } else if rank == 0 || rank >= world_size {
            Some(format!("{host_id} announced invalid rank {rank}"))
        } else if slots[rank - 1].is_some() {
            Some(format!("rank {rank} joined twice (second from {host_id})"))
        } else {
            None
        };

        if let Some(reason) = problem {
            parting_write(
                &mut stream,
                &Frame::Reject {
                    reason: reason.clone(),
                },
            )
            .await;
            reject_all(&mut slots, &reason).await;
            return Err(RuntimeError::rendezvous(reason));
        }

        debug!(rank, %host_id, %peer_addr, "rank joined");
        slots[rank - 1] = Some(stream);
        joined += 1;
    }

    let mut workers: Vec<TcpStream> = slots.into_iter().flatten().collect();
    let welcome = Frame::Welcome { world_size };
    for (i, stream) in workers.iter_mut().enumerate() {
        wire::write_frame(stream, &welcome).await.map_err(|e| {
            RuntimeError::rendezvous(format!("failed to welcome rank {}: {e}", i + 1))
        })?;
    }

    Ok(Links::Master { workers })
}

async fn connect_to_master(
    addr: &str,
    topology: &Topology,
    config: &RendezvousConfig,
) -> Result<Links> {
    let deadline = Instant::now() + config.join_timeout();
    let timed_out =
        || RuntimeError::rendezvous_timeout(topology.world_size(), 1, config.join_timeout_ms);

    let mut attempts = 0u32;
    let mut stream = loop {
        attempts += 1;
        match time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => break stream,
            Ok(Err(e)) => {
                debug!(attempts, %addr, error = %e, "rank 0 not reachable yet");
                if Instant::now() + config.connect_retry() >= deadline {
                    return Err(timed_out());
                }
                time::sleep(config.connect_retry()).await;
            }
            Err(_) => return Err(timed_out()),
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let hello = Frame::Hello {
        rank: topology.rank(),
        world_size: topology.world_size(),
        host_id: topology.host_id().to_string(),
    };
    wire::write_frame(&mut stream, &hello)
        .await
        .map_err(|e| RuntimeError::rendezvous(format!("failed to send hello to {addr}: {e}")))?;

    match time::timeout_at(deadline, wire::read_frame(&mut stream)).await {
        Ok(Ok(Some(Frame::Welcome { world_size }))) if world_size == topology.world_size() => {
            debug!(attempts, "welcomed by rank 0");
            Ok(Links::Worker { master: stream })
        }
        Ok(Ok(Some(Frame::Welcome { world_size }))) => Err(RuntimeError::rendezvous(format!(
            "rank 0 reports world size {world_size}, expected {}",
            topology.world_size()
        ))),
        Ok(Ok(Some(Frame::Reject { reason }))) => Err(RuntimeError::rendezvous(format!(
            "rejected by rank 0: {reason}"
        ))),
        Ok(Ok(Some(other))) => Err(RuntimeError::rendezvous(format!(
            "unexpected {} frame during rendezvous",
            other.name()
        ))),
        Ok(Ok(None)) => Err(RuntimeError::rendezvous(
            "rank 0 closed the connection during rendezvous",
        )),
        Ok(Err(e)) => Err(RuntimeError::rendezvous(format!(
            "rendezvous read from {addr} failed: {e}"
        ))),
        Err(_) => Err(timed_out()),
    }
}
