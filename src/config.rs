use crate::{address, Tick};
use serde::{Deserialize, Serialize};

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;

/// How the whole system services memory accesses at a given instant.
///
/// The mode is a property of the system, not of a port; switching is only
/// legal while the system is quiescent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Synchronous accesses with accumulated latency.
    Atomic,
    /// Synchronous accesses going straight to memory, caches bypassed.
    AtomicNoncaching,
    /// Asynchronous request/response pairs through the event queue.
    Timing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Uniprocessor: no snooping, every fill is writable, fast writes allowed.
    Uni,
    /// Snooping MSI with shared-line signalling.
    Msi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Replacement {
    Lru,
    Fifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchParams {
    /// Number of consecutive lines fetched ahead of a trigger.
    pub degree: usize,
    /// Observe every access rather than only misses.
    pub on_access: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheParams {
    pub name: String,
    pub block_size: u32,
    pub assoc: usize,
    pub n_sets: usize,
    pub hit_latency: Tick,
    pub mshr_entries: usize,
    /// Coalesced targets allowed on one MSHR.
    pub mshr_max_targets: usize,
    pub writeback_entries: usize,
    pub protocol: Protocol,
    pub replacement: Replacement,
    pub prefetch: Option<PrefetchParams>,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            name: "l1".to_string(),
            block_size: 64,
            assoc: 2,
            n_sets: 128,
            hit_latency: 2,
            mshr_entries: 8,
            mshr_max_targets: 4,
            writeback_entries: 4,
            protocol: Protocol::Uni,
            replacement: Replacement::Lru,
            prefetch: None,
        }
    }
}

impl CacheParams {
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.n_sets * self.assoc
    }

    #[must_use]
    pub fn block_addr(&self, addr: address) -> address {
        crate::block_align(addr, self.block_size)
    }

    #[must_use]
    pub fn block_offset(&self, addr: address) -> usize {
        crate::block_offset(addr, self.block_size)
    }

    /// The tag stored for an address; identical to the block address.
    #[must_use]
    pub fn tag(&self, addr: address) -> address {
        self.block_addr(addr)
    }

    #[must_use]
    pub fn set_index(&self, addr: address) -> usize {
        debug_assert!(self.n_sets.is_power_of_two());
        ((addr >> self.block_size.trailing_zeros()) as usize) & (self.n_sets - 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuParams {
    /// Ticks per CPU clock cycle; responses align to this edge.
    pub clock: Tick,
    /// Stop after retiring this many instructions.
    pub max_insts: Option<u64>,
}

impl Default for CpuParams {
    fn default() -> Self {
        Self {
            clock: 1,
            max_insts: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemParams {
    pub base: address,
    pub size: u64,
    /// Fixed access latency in ticks.
    pub latency: Tick,
    /// Requests the device tracks at once before refusing new ones.
    pub max_inflight: usize,
}

impl Default for MemParams {
    fn default() -> Self {
        Self {
            base: 0,
            size: 64 * KB,
            latency: 100,
            max_inflight: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SystemConfig {
    pub mode: Mode,
    pub l1i: CacheParams,
    pub l1d: CacheParams,
    pub cpu: CpuParams,
    pub mem: MemParams,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Timing
    }
}

impl SystemConfig {
    #[must_use]
    pub fn timing() -> Self {
        Self {
            mode: Mode::Timing,
            l1i: CacheParams::named("l1i"),
            l1d: CacheParams::named("l1d"),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn atomic() -> Self {
        Self {
            mode: Mode::Atomic,
            ..Self::timing()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheParams, SystemConfig};

    #[test]
    fn test_set_index_math() {
        let params = CacheParams::default();
        assert_eq!(params.set_index(0x0), 0);
        assert_eq!(params.set_index(0x40), 1);
        assert_eq!(params.set_index(0x1000 + 64 * 128), params.set_index(0x1000));
        assert_eq!(params.block_addr(0x1008), 0x1000);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = SystemConfig::timing();
        let text = serde_json::to_string(&config).unwrap();
        let back: SystemConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
