//! `VMSpec`/`NICSpec` input validation (spec.md §6). Grounded on the teacher's
//! `vmm_config::fs::FsBuilder`: a `*Config` struct carrying the caller's raw input, a typed
//! `*ConfigError`, and a `*Builder` that turns validated config into the runtime object
//! `pn_core::vm_registry` actually consumes. Unlike `FsBuilder`, validation here is pure (no
//! device construction) — `VMRegistry::vm_create` is what allocates blocks and cores against an
//! already-validated spec.

use std::fmt;

/// One requested NIC attachment. `mac = 0` requests an auto-generated, locally-administered MAC
/// (spec.md §6: "bit 1 of byte 0 set").
#[derive(Clone, Debug)]
pub struct NicConfig {
    pub dev: String,
    pub mac: u64,
    pub pool_size: u64,
    pub input_bandwidth: u64,
    pub output_bandwidth: u64,
    pub padding_head: u32,
    pub padding_tail: u32,
    pub input_queue_size: u32,
    pub output_queue_size: u32,
}

impl NicConfig {
    const DEFAULT_PADDING: u32 = 32;

    pub fn new(dev: impl Into<String>, pool_size: u64) -> Self {
        Self {
            dev: dev.into(),
            mac: 0,
            pool_size,
            input_bandwidth: 0,
            output_bandwidth: 0,
            padding_head: Self::DEFAULT_PADDING,
            padding_tail: Self::DEFAULT_PADDING,
            input_queue_size: 0,
            output_queue_size: 0,
        }
    }
}

/// A resolved NIC, after MAC assignment/validation. `pool_size` has already been validated
/// non-zero.
#[derive(Clone, Debug)]
pub struct NicSpec {
    pub dev: String,
    pub mac: u64,
    pub pool_blocks: u64,
    pub input_bandwidth: u64,
    pub output_bandwidth: u64,
    pub padding_head: u32,
    pub padding_tail: u32,
    pub input_queue_size: u32,
    pub output_queue_size: u32,
}

/// Raw VM creation input (spec.md §6's `VMSpec`).
#[derive(Clone, Debug)]
pub struct VmConfig {
    pub argv: Vec<String>,
    pub core_size: u32,
    pub memory_size: u64,
    pub storage_size: u64,
    pub nics: Vec<NicConfig>,
}

impl VmConfig {
    pub fn new(argv: Vec<String>, core_size: u32) -> Self {
        Self {
            argv,
            core_size,
            memory_size: 0,
            storage_size: 0,
            nics: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum VmConfigError {
    /// `core_size == 0` (Open Question (a): the rewrite rejects a VM with no cores).
    NoCores,
    /// A NIC's `pool_size` was zero — it can't be rounded up to a non-empty block count.
    EmptyNicPool { index: usize },
    /// `dev` was empty.
    MissingNicDevice { index: usize },
}

impl fmt::Display for VmConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoCores => write!(f, "core_size must be at least 1"),
            Self::EmptyNicPool { index } => write!(f, "nic[{index}].pool_size must be at least 1"),
            Self::MissingNicDevice { index } => write!(f, "nic[{index}].dev must not be empty"),
        }
    }
}

impl std::error::Error for VmConfigError {}

type Result<T> = std::result::Result<T, VmConfigError>;

/// Validates a [`VmConfig`] and rounds its sizes up to block granularity. Does not allocate
/// anything — [`crate::vm_registry::VmRegistry::vm_create`] does that against the result.
#[derive(Default)]
pub struct VmSpecBuilder;

/// A validated, block-rounded VM spec, ready for `vm_create`.
#[derive(Clone, Debug)]
pub struct VmSpec {
    pub argv: Vec<String>,
    pub core_size: u32,
    pub memory_blocks: u64,
    pub storage_blocks: u64,
    pub nics: Vec<NicSpec>,
}

impl VmSpecBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, config: VmConfig, block_size: u64) -> Result<VmSpec> {
        if config.core_size == 0 {
            return Err(VmConfigError::NoCores);
        }

        let mut nics = Vec::with_capacity(config.nics.len());
        for (index, nic) in config.nics.into_iter().enumerate() {
            if nic.dev.trim().is_empty() {
                return Err(VmConfigError::MissingNicDevice { index });
            }
            if nic.pool_size == 0 {
                return Err(VmConfigError::EmptyNicPool { index });
            }
            nics.push(NicSpec {
                dev: nic.dev,
                mac: nic.mac,
                pool_blocks: round_up_blocks(nic.pool_size, block_size),
                input_bandwidth: nic.input_bandwidth,
                output_bandwidth: nic.output_bandwidth,
                padding_head: nic.padding_head,
                padding_tail: nic.padding_tail,
                input_queue_size: nic.input_queue_size,
                output_queue_size: nic.output_queue_size,
            });
        }

        Ok(VmSpec {
            argv: config.argv,
            core_size: config.core_size,
            memory_blocks: round_up_blocks(config.memory_size, block_size),
            storage_blocks: round_up_blocks(config.storage_size, block_size),
            nics,
        })
    }
}

fn round_up_blocks(bytes: u64, block_size: u64) -> u64 {
    bytes.div_ceil(block_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: u64 = 0x20_0000;

    #[test]
    fn zero_core_size_is_rejected() {
        let cfg = VmConfig::new(vec![], 0);
        assert!(matches!(
            VmSpecBuilder::new().build(cfg, BLOCK),
            Err(VmConfigError::NoCores)
        ));
    }

    #[test]
    fn memory_and_storage_round_up_to_block_granularity() {
        let mut cfg = VmConfig::new(vec![], 2);
        cfg.memory_size = BLOCK + 1;
        cfg.storage_size = BLOCK * 4;

        let spec = VmSpecBuilder::new().build(cfg, BLOCK).unwrap();
        assert_eq!(spec.memory_blocks, 2);
        assert_eq!(spec.storage_blocks, 4);
    }

    #[test]
    fn zero_memory_size_rounds_to_zero_blocks() {
        let cfg = VmConfig::new(vec![], 1);
        let spec = VmSpecBuilder::new().build(cfg, BLOCK).unwrap();
        assert_eq!(spec.memory_blocks, 0);
    }

    #[test]
    fn nic_with_empty_pool_is_rejected() {
        let mut cfg = VmConfig::new(vec![], 1);
        cfg.nics.push(NicConfig::new("eth0", 0));

        assert!(matches!(
            VmSpecBuilder::new().build(cfg, BLOCK),
            Err(VmConfigError::EmptyNicPool { index: 0 })
        ));
    }

    #[test]
    fn nic_pool_size_rounds_up_to_blocks() {
        let mut cfg = VmConfig::new(vec![], 1);
        cfg.nics.push(NicConfig::new("eth0", BLOCK + 1));

        let spec = VmSpecBuilder::new().build(cfg, BLOCK).unwrap();
        assert_eq!(spec.nics[0].pool_blocks, 2);
    }
}
