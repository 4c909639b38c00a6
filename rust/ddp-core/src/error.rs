// rust/ddp-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Rendezvous timed out after {timeout_ms}ms: {joined} of {expected} ranks joined")]
    RendezvousTimeout {
        expected: usize,
        joined: usize,
        timeout_ms: u64,
    },

    #[error("Rendezvous failed: {message}")]
    Rendezvous {
        message: String,
    },

    #[error("Collective '{operation}' failed: {message}")]
    CollectiveFailure {
        operation: String,
        message: String,
    },

    #[error("Local compute failed on rank {rank}: {message}")]
    LocalCompute {
        rank: usize,
        message: String,
    },

    #[error("Checkpoint I/O error: {message}")]
    CheckpointIo {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

// Convenience constructors
impl RuntimeError {

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub fn configuration_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn rendezvous_timeout(expected: usize, joined: usize, timeout_ms: u64) -> Self {
        Self::RendezvousTimeout {
            expected,
            joined,
            timeout_ms,
        }
    }

    pub fn rendezvous(message: impl Into<String>) -> Self {
        Self::Rendezvous {
            message: message.into(),
        }
    }

    pub fn collective(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CollectiveFailure {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn local_compute(rank: usize, message: impl Into<String>) -> Self {
        Self::LocalCompute {
            rank,
            message: message.into(),
        }
    }

    pub fn checkpoint_io(message: impl Into<String>) -> Self {
        Self::CheckpointIo {
            message: message.into(),
            source: None,
        }
    }

    pub fn checkpoint_io_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::CheckpointIo {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Process exit status for a run that terminated with this error.
    ///
    /// Every class is fatal; distinct codes let the job scheduler tell a bad
    /// placement apart from a lost peer or a failed checkpoint write.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } => 2,
            Self::RendezvousTimeout { .. } | Self::Rendezvous { .. } => 3,
            Self::CollectiveFailure { .. } => 4,
            Self::LocalCompute { .. } => 5,
            Self::CheckpointIo { .. } => 6,
            Self::Storage { .. } | Self::Serialization { .. } => 1,
        }
    }
}
