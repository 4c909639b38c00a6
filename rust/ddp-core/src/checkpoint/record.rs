// rust/ddp-core/src/checkpoint/record.rs

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Everything needed to resume training after `epoch`.
///
/// Model and optimizer state are opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: u64,
    pub model_state: Vec<u8>,
    pub optimizer_state: Vec<u8>,
    /// Mean training loss of the epoch
    pub loss: f64,
    /// "cuda" or "cpu"
    pub device_kind: String,
}

impl Checkpoint {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| RuntimeError::serialization(format!("failed to encode checkpoint: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| RuntimeError::checkpoint_io(format!("failed to decode checkpoint record: {e}")))
    }
}
