// rust/ddp-core/src/topology.rs

//! Process topology resolution.
//!
//! The scheduler places one process per rank and describes the placement
//! through environment variables. This module turns that description into an
//! immutable [`Topology`] value that is passed explicitly to every component,
//! and picks the compute device for the process.

use std::fmt;

use crate::error::{Result, RuntimeError};

/// Variable names consulted for each placement field, in precedence order.
const WORLD_SIZE_VARS: &[&str] = &["SLURM_NTASKS", "WORLD_SIZE"];
const RANK_VARS: &[&str] = &["SLURM_PROCID", "RANK"];
const LOCAL_RANK_VARS: &[&str] = &["SLURM_LOCALID", "LOCAL_RANK"];
// HOSTNAME is a shell variable that launchers rarely export, hence the
// DDP_HOST_ID override and the kernel hostname fallback in `from_env`.
const HOST_VARS: &[&str] = &["SLURMD_NODENAME", "DDP_HOST_ID", "HOSTNAME"];
const HOSTNAME_FILES: &[&str] = &["/proc/sys/kernel/hostname", "/etc/hostname"];

/// Raw placement metadata as supplied by the execution environment.
///
/// Fields are kept as strings until [`Topology::resolve`] so that a missing
/// field and a malformed one produce distinct error messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementMetadata {
    pub world_size: Option<String>,
    pub rank: Option<String>,
    pub local_rank: Option<String>,
    pub host_id: Option<String>,
}

impl PlacementMetadata {
    /// Reads placement metadata from the process environment.
    ///
    /// Without a host variable the host identifier falls back to the
    /// machine's hostname.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok()).or_host(system_hostname)
    }

    fn or_host(mut self, fallback: impl FnOnce() -> Option<String>) -> Self {
        if self.host_id.is_none() {
            self.host_id = fallback().filter(|h| !h.trim().is_empty());
        }
        self
    }

    /// Reads placement metadata through an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let first = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| lookup(*name).filter(|v| !v.trim().is_empty()))
        };

        Self {
            world_size: first(WORLD_SIZE_VARS),
            rank: first(RANK_VARS),
            local_rank: first(LOCAL_RANK_VARS),
            host_id: first(HOST_VARS),
        }
    }

    /// Metadata for an explicitly placed rank.
    pub fn explicit(world_size: usize, rank: usize, local_rank: usize, host_id: &str) -> Self {
        Self {
            world_size: Some(world_size.to_string()),
            rank: Some(rank.to_string()),
            local_rank: Some(local_rank.to_string()),
            host_id: Some(host_id.to_string()),
        }
    }
}

/// This process's position in the training run. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    rank: usize,
    world_size: usize,
    local_device_index: usize,
    host_id: String,
}

impl Topology {
    /// Resolves placement metadata into a topology.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a field is absent or not a non-negative
    /// integer, if the world size is zero, or if `rank >= world_size`.
    pub fn resolve(meta: PlacementMetadata) -> Result<Self> {
        let world_size = parse_field("world size", WORLD_SIZE_VARS, meta.world_size)?;
        let rank = parse_field("rank", RANK_VARS, meta.rank)?;
        let local_device_index = parse_field("local rank", LOCAL_RANK_VARS, meta.local_rank)?;
        let host_id = meta
            .host_id
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| missing("host identifier", HOST_VARS))?;

        if world_size == 0 {
            return Err(RuntimeError::configuration("world size must be at least 1"));
        }
        if rank >= world_size {
            return Err(RuntimeError::configuration(format!(
                "rank {rank} is out of range for world size {world_size}"
            )));
        }

        Ok(Self {
            rank,
            world_size,
            local_device_index,
            host_id,
        })
    }

    /// A single-process topology.
    pub fn single(host_id: &str) -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_device_index: 0,
            host_id: host_id.to_string(),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn local_device_index(&self) -> usize {
        self.local_device_index
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Whether this process holds the given rank.
    pub fn is_rank(&self, rank: usize) -> bool {
        self.rank == rank
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rank {}/{} on {} (local {})",
            self.rank, self.world_size, self.host_id, self.local_device_index
        )
    }
}

fn system_hostname() -> Option<String> {
    HOSTNAME_FILES
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|name| name.trim().to_string())
}

fn missing(field: &str, vars: &[&str]) -> RuntimeError {
    RuntimeError::configuration(format!(
        "placement metadata is missing the {field} (set one of {})",
        vars.join(", ")
    ))
}

fn parse_field(field: &str, vars: &[&str], value: Option<String>) -> Result<usize> {
    let raw = value.ok_or_else(|| missing(field, vars))?;
    raw.trim().parse::<usize>().map_err(|e| {
        RuntimeError::configuration_with_source(format!("invalid {field} '{raw}'"), e)
    })
}

/// The compute device this process trains on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Accelerator { index: usize },
    Cpu,
}

impl Device {
    /// Device kind recorded in checkpoints.
    pub fn kind(&self) -> &'static str {
        match self {
            Device::Accelerator { .. } => "cuda",
            Device::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Accelerator { index } => write!(f, "cuda:{index}"),
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

/// Selects the device for this process.
///
/// Uses accelerator `local_device_index` when accelerators are present and
/// the index is in range; otherwise falls back to the CPU. Falling back only
/// affects speed, never correctness, so it is logged rather than rejected.
pub fn select_device(topology: &Topology, accelerators: usize) -> Device {
    let index = topology.local_device_index();
    if accelerators == 0 {
        tracing::warn!(rank = topology.rank(), "no accelerator available, using cpu");
        return Device::Cpu;
    }
    if index >= accelerators {
        tracing::warn!(
            rank = topology.rank(),
            local_index = index,
            accelerators,
            "local device index exceeds visible accelerators, using cpu"
        );
        return Device::Cpu;
    }
    let device = Device::Accelerator { index };
    tracing::info!(rank = topology.rank(), %device, "bound compute device");
    device
}

/// Counts the accelerators visible to this process.
pub fn detect_accelerators() -> usize {
    accelerators_from(|key| std::env::var(key).ok())
}

fn accelerators_from(lookup: impl Fn(&str) -> Option<String>) -> usize {
    if let Some(n) = lookup("DDP_ACCELERATORS").and_then(|v| v.trim().parse().ok()) {
        return n;
    }
    match lookup("CUDA_VISIBLE_DEVICES") {
        Some(list) => list
            .split(',')
            .map(str::trim)
            .take_while(|id| !id.is_empty() && !id.starts_with('-'))
            .count(),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_resolve_from_slurm_variables() {
        let meta = PlacementMetadata::from_lookup(lookup_from(&[
            ("SLURM_NTASKS", "4"),
            ("SLURM_PROCID", "2"),
            ("SLURM_LOCALID", "0"),
            ("SLURMD_NODENAME", "node-b"),
        ]));
        let topology = Topology::resolve(meta).unwrap();

        assert_eq!(topology.world_size(), 4);
        assert_eq!(topology.rank(), 2);
        assert_eq!(topology.local_device_index(), 0);
        assert_eq!(topology.host_id(), "node-b");
        assert!(topology.is_rank(2));
        assert!(!topology.is_rank(0));
    }

    #[test]
    fn test_slurm_takes_precedence_over_launcher_variables() {
        let meta = PlacementMetadata::from_lookup(lookup_from(&[
            ("SLURM_NTASKS", "2"),
            ("WORLD_SIZE", "8"),
            ("RANK", "1"),
            ("LOCAL_RANK", "1"),
            ("HOSTNAME", "gpu-01"),
        ]));
        let topology = Topology::resolve(meta).unwrap();

        assert_eq!(topology.world_size(), 2);
        assert_eq!(topology.rank(), 1);
        assert_eq!(topology.host_id(), "gpu-01");
    }

    #[test]
    fn test_missing_field_is_configuration_error() {
        let meta = PlacementMetadata::from_lookup(lookup_from(&[
            ("SLURM_NTASKS", "2"),
            ("SLURM_PROCID", "0"),
            ("SLURMD_NODENAME", "node-a"),
        ]));
        let err = Topology::resolve(meta).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration { .. }));
        assert!(err.to_string().contains("local rank"));
    }

    #[test]
    fn test_rank_out_of_range() {
        let err = Topology::resolve(PlacementMetadata::explicit(2, 2, 0, "h")).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration { .. }));
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_zero_world_size() {
        let err = Topology::resolve(PlacementMetadata::explicit(0, 0, 0, "h")).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_malformed_integer() {
        let meta = PlacementMetadata {
            world_size: Some("four".to_string()),
            rank: Some("0".to_string()),
            local_rank: Some("0".to_string()),
            host_id: Some("h".to_string()),
        };
        let err = Topology::resolve(meta).unwrap_err();
        assert!(err.to_string().contains("invalid world size"));
    }

    #[test]
    fn test_host_falls_back_when_unexported() {
        let launcher = lookup_from(&[("WORLD_SIZE", "2"), ("RANK", "1"), ("LOCAL_RANK", "0")]);

        let err = Topology::resolve(PlacementMetadata::from_lookup(&launcher)).unwrap_err();
        assert!(err.to_string().contains("DDP_HOST_ID"), "unexpected error: {err}");

        let meta = PlacementMetadata::from_lookup(&launcher).or_host(|| Some("gpu-07\n".to_string()));
        assert_eq!(Topology::resolve(meta).unwrap().host_id(), "gpu-07");

        // An exported variable wins over the fallback.
        let meta = PlacementMetadata::from_lookup(lookup_from(&[("DDP_HOST_ID", "node-3")]))
            .or_host(|| Some("gpu-07".to_string()));
        assert_eq!(meta.host_id.as_deref(), Some("node-3"));
    }

    #[test]
    fn test_blank_values_count_as_missing() {
        let meta = PlacementMetadata::from_lookup(lookup_from(&[
            ("SLURM_NTASKS", "1"),
            ("SLURM_PROCID", "0"),
            ("SLURM_LOCALID", "0"),
            ("SLURMD_NODENAME", "   "),
        ]));
        assert!(meta.host_id.is_none());
        assert!(Topology::resolve(meta).is_err());
    }

    #[test]
    fn test_select_device() {
        let topology = Topology::resolve(PlacementMetadata::explicit(4, 3, 1, "h")).unwrap();

        assert_eq!(select_device(&topology, 2), Device::Accelerator { index: 1 });
        assert_eq!(select_device(&topology, 0), Device::Cpu);
        // Index beyond the visible devices falls back rather than failing
        assert_eq!(select_device(&topology, 1), Device::Cpu);

        assert_eq!(Device::Accelerator { index: 1 }.kind(), "cuda");
        assert_eq!(Device::Cpu.kind(), "cpu");
        assert_eq!(Device::Accelerator { index: 1 }.to_string(), "cuda:1");
    }

    #[test]
    fn test_accelerator_detection() {
        assert_eq!(accelerators_from(lookup_from(&[])), 0);
        assert_eq!(
            accelerators_from(lookup_from(&[("CUDA_VISIBLE_DEVICES", "0,1,2")])),
            3
        );
        assert_eq!(
            accelerators_from(lookup_from(&[("CUDA_VISIBLE_DEVICES", "")])),
            0
        );
        assert_eq!(
            accelerators_from(lookup_from(&[("CUDA_VISIBLE_DEVICES", "-1")])),
            0
        );
        assert_eq!(
            accelerators_from(lookup_from(&[
                ("CUDA_VISIBLE_DEVICES", "0,1"),
                ("DDP_ACCELERATORS", "8"),
            ])),
            8
        );
    }
}
