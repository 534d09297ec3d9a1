use std::fmt;

use crate::nic::buffer_pool::{DEFAULT_COPYBREAK, LARGE_BUFFER_SIZE, SMALL_BUFFER_SIZE};
use crate::nic::descriptors::{DESCRIPTOR_LENGTH, RING_ALIGNMENT};
use crate::util::align_up;
use crate::DmaWindow;

// Events per drain for adapters that complete work through descriptors
pub const MAX_WORK_BUSMASTER: u16 = 32;
// Programmed I/O costs more per event, keep batches short
pub const MAX_WORK_PIO: u16 = 8;
// Hard stop for a single drain regardless of the work limit
pub const EMERGENCY_EVENT_CAP: u16 = 64;

pub const MIN_RING_DEPTH: u8 = 4;
pub const MAX_RING_DEPTH: u8 = 128;

/// Static capability flags of the adapter
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub has_busmaster_dma: bool,
    pub ring_depth: u8,
    pub buffer_alignment: u8,
}

impl Capabilities {
    pub fn dma_capability(&self) -> DmaCapability {
        if self.has_busmaster_dma {
            DmaCapability::BasicBusMaster
        } else {
            DmaCapability::None
        }
    }

    pub fn adapter_class(&self) -> AdapterClass {
        match self.dma_capability() {
            DmaCapability::BasicBusMaster => AdapterClass::BusMaster,
            DmaCapability::None => AdapterClass::ProgrammedIo,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let depth = self.ring_depth;
        if !depth.is_power_of_two() || !(MIN_RING_DEPTH..=MAX_RING_DEPTH).contains(&depth) {
            return Err(ConfigError::RingDepth(depth));
        }
        if !self.buffer_alignment.is_power_of_two() {
            return Err(ConfigError::Alignment(self.buffer_alignment));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaCapability {
    None,
    BasicBusMaster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterClass {
    BusMaster,
    ProgrammedIo,
}

impl AdapterClass {
    pub fn work_limit(self) -> u16 {
        match self {
            AdapterClass::BusMaster => MAX_WORK_BUSMASTER,
            AdapterClass::ProgrammedIo => MAX_WORK_PIO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size hints below this are served from the small tier
    pub copybreak: u16,
    pub small_buffers: u16,
    pub large_buffers: u16,
    /// Receive slots the pool refill leaves free for buffers posted by the caller
    pub rx_reserved_slots: u16,

    /// Can only lower the per class work limit
    pub work_limit_override: Option<u16>,
    pub emergency_event_cap: u16,
    /// Upper bound on wall time spent in one drain
    pub drain_time_budget_ms: u64,

    pub consecutive_threshold: u32,
    pub rate_threshold_percent: u32,
    pub rate_window_ms: u64,
    /// Events needed in the window before the rate is trusted
    pub rate_min_samples: u32,
    pub max_recovery_attempts: u32,
    pub min_attempt_interval_ms: u64,
    /// How long a recovery action may wait for the adapter to come back
    pub ready_timeout_ms: u64,
    pub standby_adapter: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            copybreak: DEFAULT_COPYBREAK,
            small_buffers: 32,
            large_buffers: 32,
            rx_reserved_slots: 4,
            work_limit_override: None,
            emergency_event_cap: EMERGENCY_EVENT_CAP,
            drain_time_budget_ms: 10,
            consecutive_threshold: 5,
            rate_threshold_percent: 10,
            rate_window_ms: 5000,
            rate_min_samples: 20,
            max_recovery_attempts: 3,
            min_attempt_interval_ms: 1000,
            ready_timeout_ms: 50,
            standby_adapter: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.copybreak == 0 || self.copybreak > SMALL_BUFFER_SIZE {
            return Err(ConfigError::Copybreak(self.copybreak));
        }
        if self.small_buffers == 0 {
            return Err(ConfigError::ZeroCount("small_buffers"));
        }
        if self.large_buffers == 0 {
            return Err(ConfigError::ZeroCount("large_buffers"));
        }
        if self.emergency_event_cap == 0 {
            return Err(ConfigError::ZeroCount("emergency_event_cap"));
        }
        if let Some(limit) = self.work_limit_override {
            if limit == 0 || limit > self.emergency_event_cap {
                return Err(ConfigError::WorkLimit(limit));
            }
        }
        if self.consecutive_threshold == 0 {
            return Err(ConfigError::ZeroCount("consecutive_threshold"));
        }
        if self.rate_threshold_percent == 0 || self.rate_threshold_percent > 100 {
            return Err(ConfigError::RateThreshold(self.rate_threshold_percent));
        }
        if self.max_recovery_attempts == 0 {
            return Err(ConfigError::ZeroCount("max_recovery_attempts"));
        }
        Ok(())
    }

    /// Checks the parts of the configuration that depend on the adapter
    pub fn validate_for(&self, capabilities: &Capabilities) -> Result<(), ConfigError> {
        if self.rx_reserved_slots == 0 || self.rx_reserved_slots >= capabilities.ring_depth as u16 {
            return Err(ConfigError::RxReserve(self.rx_reserved_slots));
        }
        Ok(())
    }

    /// Work limit for the adapter class, lowered by the override if one is set
    pub fn work_limit(&self, class: AdapterClass) -> u16 {
        match self.work_limit_override {
            Some(limit) => limit.min(class.work_limit()),
            None => class.work_limit(),
        }
    }
}

/// Where rings and the buffer region live inside the DMA window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub tx_ring_base: u32,
    pub rx_ring_base: u32,
    pub pool_region: DmaWindow,
}

impl MemoryLayout {
    pub fn compute(window: DmaWindow, ring_depth: u8) -> Result<Self, ConfigError> {
        let ring_bytes = ring_depth as u64 * DESCRIPTOR_LENGTH as u64;
        let tx_ring_base = align_up(window.base as u64, RING_ALIGNMENT as u64);
        let rx_ring_base = tx_ring_base + ring_bytes;
        let pool_base = rx_ring_base + ring_bytes;

        // At least one buffer of each tier has to fit behind the rings
        let required = pool_base + SMALL_BUFFER_SIZE as u64 + LARGE_BUFFER_SIZE as u64;
        if required > window.end() {
            return Err(ConfigError::Layout {
                required: required - window.base as u64,
                available: window.length,
            });
        }

        Ok(MemoryLayout {
            tx_ring_base: tx_ring_base as u32,
            rx_ring_base: rx_ring_base as u32,
            pool_region: DmaWindow {
                base: pool_base as u32,
                length: (window.end() - pool_base) as u32,
            },
        })
    }

    /// Memory the engine owns: both descriptor rings and the buffer pool
    pub fn engine_region(&self) -> DmaWindow {
        DmaWindow {
            base: self.tx_ring_base,
            length: (self.pool_region.end() - self.tx_ring_base as u64) as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    RingDepth(u8),
    Alignment(u8),
    Copybreak(u16),
    ZeroCount(&'static str),
    WorkLimit(u16),
    RateThreshold(u32),
    RxReserve(u16),
    Layout { required: u64, available: u32 },
    Descriptor(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::RingDepth(depth) => write!(
                f,
                "ring depth {} is not a power of two in {}..={}",
                depth, MIN_RING_DEPTH, MAX_RING_DEPTH
            ),
            ConfigError::Alignment(alignment) => {
                write!(f, "buffer alignment {} is not a power of two", alignment)
            }
            ConfigError::Copybreak(copybreak) => write!(
                f,
                "copybreak {} must be in 1..={}",
                copybreak, SMALL_BUFFER_SIZE
            ),
            ConfigError::ZeroCount(name) => write!(f, "{} must not be zero", name),
            ConfigError::WorkLimit(limit) => {
                write!(f, "work limit {} must be non zero and below the emergency cap", limit)
            }
            ConfigError::RateThreshold(percent) => {
                write!(f, "error rate threshold {}% must be in 1..=100", percent)
            }
            ConfigError::RxReserve(slots) => {
                write!(f, "{} reserved receive slots must be non zero and below the ring depth", slots)
            }
            ConfigError::Layout {
                required,
                available,
            } => write!(
                f,
                "DMA window too small, need {:#x} bytes but only {:#x} available",
                required, available
            ),
            ConfigError::Descriptor(e) => write!(f, "failed to lay out descriptors: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
