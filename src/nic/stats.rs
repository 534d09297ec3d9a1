use std::fmt;

use crate::nic::buffer_pool::PoolStats;
use crate::nic::config::{AdapterClass, DmaCapability};
use crate::nic::interrupts::InterruptStats;
use crate::nic::recovery::RecoverySnapshot;
use crate::nic::ring::RingStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub occupancy: u16,
    pub capacity: u16,
    pub stats: RingStats,
}

/// Point in time copy of every counter the engine keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicStats {
    pub dma_capability: DmaCapability,
    pub adapter_class: AdapterClass,
    pub work_limit: u16,
    pub tx_ring: RingSnapshot,
    pub rx_ring: RingSnapshot,
    pub pool: PoolStats,
    pub interrupts: InterruptStats,
    pub recovery: RecoverySnapshot,
    pub disabled: bool,
}

impl fmt::Display for RingSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} in use, {} posted, {} reaped, {} errors, {} full, peak {}",
            self.occupancy,
            self.capacity,
            self.stats.posted,
            self.stats.reaped,
            self.stats.errors,
            self.stats.full,
            self.stats.peak_occupancy
        )
    }
}

impl fmt::Display for NicStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interrupts = &self.interrupts;
        let events = &interrupts.events_by_type;
        let recovery = &self.recovery;

        writeln!(
            f,
            "Adapter: {:?} ({:?}), work limit {}{}",
            self.adapter_class,
            self.dma_capability,
            self.work_limit,
            if self.disabled { ", DISABLED" } else { "" }
        )?;
        writeln!(f, "TX ring: {}", self.tx_ring)?;
        writeln!(f, "RX ring: {}", self.rx_ring)?;
        writeln!(
            f,
            "Buffers: {} outstanding (peak {}), {}/{} small free, {}/{} large free, {} fallbacks, {} exhausted, {} invalid frees",
            self.pool.outstanding,
            self.pool.peak_outstanding,
            self.pool.small_free,
            self.pool.small_count,
            self.pool.large_free,
            self.pool.large_count,
            self.pool.fallbacks,
            self.pool.exhausted,
            self.pool.invalid_frees
        )?;
        writeln!(
            f,
            "Interrupts: {} total, {} polls, {} events (max {} per drain), {} spurious, {} single, {} batched",
            interrupts.total_interrupts,
            interrupts.polls,
            interrupts.events_processed,
            interrupts.max_events_per_interrupt,
            interrupts.spurious_interrupts,
            interrupts.single_event_interrupts,
            interrupts.batched_interrupts
        )?;
        writeln!(
            f,
            "Events: {} rx, {} tx, {} rx errors, {} tx errors, {} retries; {} work limit hits, {} emergency breaks",
            events.rx_complete,
            events.tx_complete,
            events.rx_error,
            events.tx_error,
            events.tx_retry,
            interrupts.work_limit_hits,
            interrupts.emergency_breaks
        )?;
        write!(
            f,
            "Recovery: {:?}, {} attempts pending, {} errors ({} consecutive, {}% rate), {} recovered, {} failed",
            recovery.status.state,
            recovery.status.attempt_count,
            recovery.errors.total(),
            recovery.status.consecutive_errors,
            recovery.status.error_rate_percent,
            recovery.counters.successes,
            recovery.counters.failures
        )
    }
}
