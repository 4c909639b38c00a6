// rust/ddp-core/src/logging.rs

//! Per-rank log sinks.
//!
//! Each rank appends to its own file, `node_<rank>_<host>.log`, so ranks
//! never share a file. Lines carry a timestamp, the `rank`/`host` span and
//! the message. The subscriber is installed as the thread default, which
//! lets several in-process ranks keep separate sinks.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::span::EnteredSpan;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LoggingConfig;
use crate::error::{Result, RuntimeError};
use crate::storage::{StorageBackend, StorageWriter};
use crate::topology::Topology;

/// Log file of `topology`'s rank inside `log_dir`.
pub fn rank_log_path(log_dir: &Path, topology: &Topology) -> PathBuf {
    let host: String = topology
        .host_id()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    log_dir.join(format!("node_{}_{}.log", topology.rank(), host))
}

#[derive(Clone)]
struct RankSink {
    writer: Arc<Mutex<Box<dyn StorageWriter>>>,
}

impl Write for RankSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink poisoned"))?
            .flush()
    }
}

impl<'a> MakeWriter<'a> for RankSink {
    type Writer = RankSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Guard for an installed per-rank subscriber.
///
/// Dropping it leaves the rank span, restores the previous default
/// subscriber and syncs the log file.
pub struct RankLogger {
    path: PathBuf,
    span: Option<EnteredSpan>,
    guard: Option<DefaultGuard>,
    sink: Option<RankSink>,
}

impl RankLogger {
    /// Opens this rank's sink and makes it the current thread's subscriber.
    ///
    /// `RUST_LOG`, when set, takes precedence over `config.level`.
    pub fn install(
        config: &LoggingConfig,
        topology: &Topology,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let rust_log = std::env::var("RUST_LOG").ok();
        Self::install_with(config, topology, storage, rust_log.as_deref())
    }

    fn install_with(
        config: &LoggingConfig,
        topology: &Topology,
        storage: Arc<dyn StorageBackend>,
        rust_log: Option<&str>,
    ) -> Result<Self> {
        let filter = build_filter(&config.level, rust_log)?;

        storage.create_dir_all(&config.log_dir)?;
        let path = rank_log_path(&config.log_dir, topology);
        let sink = RankSink {
            writer: Arc::new(Mutex::new(storage.open_append(&path)?)),
        };

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(sink.clone());
        let stderr_layer = config
            .stderr
            .then(|| fmt::layer().with_target(false).with_writer(io::stderr));

        let subscriber = Registry::default()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);
        let guard = tracing::subscriber::set_default(subscriber);

        let span = tracing::info_span!(
            "rank",
            rank = topology.rank(),
            host = %topology.host_id()
        )
        .entered();

        Ok(Self {
            path,
            span: Some(span),
            guard: Some(guard),
            sink: Some(sink),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RankLogger {
    fn drop(&mut self) {
        drop(self.span.take());
        drop(self.guard.take());

        // The subscriber is gone, so this should be the last handle.
        let writer = self
            .sink
            .take()
            .and_then(|sink| Arc::try_unwrap(sink.writer).ok())
            .and_then(|writer| writer.into_inner().ok());
        if let Some(writer) = writer {
            if let Err(e) = writer.finish() {
                eprintln!("failed to sync log file {}: {e}", self.path.display());
            }
        }
    }
}

fn build_filter(level: &str, rust_log: Option<&str>) -> Result<EnvFilter> {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(level).map_err(|e| {
        RuntimeError::configuration_with_source(format!("invalid log level '{level}'"), e)
    })
}
