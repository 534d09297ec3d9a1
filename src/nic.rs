use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use log::{debug, error, info, warn};
use spin::Mutex;

use crate::nic::buffer_pool::{BufferPool, PoolStats, LARGE_BUFFER_SIZE, SMALL_BUFFER_SIZE};
use crate::nic::config::{
    Capabilities, ConfigError, DmaCapability, EngineConfig, MemoryLayout, MAX_RING_DEPTH,
};
use crate::nic::interrupts::InterruptStats;
use crate::nic::recovery::{ErrorLogEntry, RecoveryController, RecoveryThresholds};
use crate::nic::ring::{DescriptorRing, PostedBuffer};
use crate::nic::stats::{NicStats, RingSnapshot};
use crate::{Direction, Fragment, NicHardware, PacketSink};

pub mod buffer_pool;
pub mod config;
pub mod descriptors;
pub mod dma;
pub mod interrupts;
pub mod recovery;
pub mod ring;
pub mod stats;

/// Outcome of a failed transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    // Ring full, retry after the next drain
    Busy,
    // Adapter rejected the transfer, packet dropped
    Hardware,
    NoMemory,
    // Adapter disabled by the recovery controller
    Fatal,
    InvalidPacket,
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TransferError::Busy => "descriptor ring full",
            TransferError::Hardware => "adapter reported a transfer error",
            TransferError::NoMemory => "no staging buffer available",
            TransferError::Fatal => "adapter disabled",
            TransferError::InvalidPacket => "invalid packet",
        };
        write!(f, "{}", reason)
    }
}

impl std::error::Error for TransferError {}

/// Packet I/O engine of one adapter.
///
/// All entry points take `&self`: the rings, the pool and the counters sit behind short
/// spin locks, and a drain is serialized by a flag instead of a lock so that a nested
/// interrupt returns immediately. Locks are taken ring first, pool second. The sink and
/// the scratch buffer are only touched while draining.
pub struct NicContext<H: NicHardware> {
    pub hw: H,
    config: EngineConfig,
    layout: MemoryLayout,
    capabilities: Mutex<Capabilities>,
    work_limit: AtomicU16,

    tx_ring: Mutex<DescriptorRing>,
    rx_ring: Mutex<DescriptorRing>,
    pool: Mutex<BufferPool>,

    recovery: Mutex<RecoveryController>,
    interrupt_stats: Mutex<InterruptStats>,

    sink: Mutex<Box<dyn PacketSink + Send>>,
    // Receive payloads are copied here before being handed to the sink
    scratch: Mutex<Box<[u8]>>,

    draining: AtomicBool,
    disabled: AtomicBool,
}

impl<H: NicHardware> NicContext<H> {
    pub fn new(
        hw: H, config: EngineConfig, sink: Box<dyn PacketSink + Send>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let capabilities = hw.capabilities();
        capabilities.validate()?;
        config.validate_for(&capabilities)?;

        let layout = MemoryLayout::compute(hw.dma_window(), capabilities.ring_depth)?;
        let pool = BufferPool::new(
            layout.pool_region,
            capabilities.buffer_alignment,
            config.copybreak,
            config.small_buffers,
            config.large_buffers,
        )
        .map_err(|_| ConfigError::Layout {
            required: config.small_buffers as u64 * SMALL_BUFFER_SIZE as u64
                + config.large_buffers as u64 * LARGE_BUFFER_SIZE as u64,
            available: layout.pool_region.length,
        })?;

        let depth = capabilities.ring_depth as u16;
        let mut tx_ring = DescriptorRing::new(Direction::Transmit, layout.tx_ring_base, depth);
        let mut rx_ring = DescriptorRing::new(Direction::Receive, layout.rx_ring_base, depth);
        tx_ring
            .initialize(&hw)
            .map_err(|e| ConfigError::Descriptor(e.to_string()))?;
        rx_ring
            .initialize(&hw)
            .map_err(|e| ConfigError::Descriptor(e.to_string()))?;

        let work_limit = config.work_limit(capabilities.adapter_class());
        info!(
            "NIC engine: {:?}, {} descriptors per ring, work limit {}",
            capabilities.adapter_class(),
            depth,
            work_limit
        );

        let nic = NicContext {
            recovery: Mutex::new(RecoveryController::new(RecoveryThresholds::from(&config))),
            hw,
            layout,
            capabilities: Mutex::new(capabilities),
            work_limit: AtomicU16::new(work_limit),
            tx_ring: Mutex::new(tx_ring),
            rx_ring: Mutex::new(rx_ring),
            pool: Mutex::new(pool),
            interrupt_stats: Mutex::new(InterruptStats::default()),
            sink: Mutex::new(sink),
            scratch: Mutex::new(vec![0u8; LARGE_BUFFER_SIZE as usize].into_boxed_slice()),
            draining: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            config,
        };

        let posted = nic.refill_rx_ring();
        debug!("Posted {} receive buffers", posted);
        Ok(nic)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.lock()
    }

    pub fn dma_capability(&self) -> DmaCapability {
        self.capabilities.lock().dma_capability()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn ring_base(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Transmit => self.layout.tx_ring_base,
            Direction::Receive => self.layout.rx_ring_base,
        }
    }

    pub(crate) fn ring(&self, direction: Direction) -> &Mutex<DescriptorRing> {
        match direction {
            Direction::Transmit => &self.tx_ring,
            Direction::Receive => &self.rx_ring,
        }
    }

    /// Transmit one logical packet made of one or more fragments
    pub fn send(&self, fragments: &[Fragment]) -> Result<(), TransferError> {
        if self.is_disabled() {
            return Err(TransferError::Fatal);
        }
        self.submit(Direction::Transmit, fragments)
    }

    pub fn work_limit(&self) -> u16 {
        self.work_limit.load(Ordering::Relaxed)
    }

    /// Lower (or restore) the per drain work limit. Values above the adapter class limit are
    /// clamped, zero is ignored. Returns the limit now in effect.
    pub fn set_work_limit(&self, limit: u16) -> u16 {
        let class_limit = self.capabilities().adapter_class().work_limit();
        if limit == 0 {
            warn!("Ignoring zero work limit");
            return self.work_limit();
        }

        let effective = limit.min(class_limit).min(self.config.emergency_event_cap);
        self.work_limit.store(effective, Ordering::Relaxed);
        debug!("Work limit set to {}", effective);
        effective
    }

    pub fn configure_thresholds(
        &self, consecutive_threshold: u32, rate_threshold_percent: u32,
    ) -> Result<(), ConfigError> {
        if consecutive_threshold == 0 {
            return Err(ConfigError::ZeroCount("consecutive_threshold"));
        }
        if rate_threshold_percent == 0 || rate_threshold_percent > 100 {
            return Err(ConfigError::RateThreshold(rate_threshold_percent));
        }
        self.recovery
            .lock()
            .set_thresholds(consecutive_threshold, rate_threshold_percent);
        Ok(())
    }

    /// Most recent classified errors, oldest first
    pub fn recent_errors(&self) -> Vec<ErrorLogEntry> {
        self.recovery.lock().recent_errors()
    }

    pub fn get_stats(&self) -> NicStats {
        let capabilities = self.capabilities();
        let snapshot = |ring: &Mutex<DescriptorRing>| {
            let ring = ring.lock();
            RingSnapshot {
                occupancy: ring.occupancy(),
                capacity: ring.capacity(),
                stats: ring.stats(),
            }
        };
        let tx_ring = snapshot(&self.tx_ring);
        let rx_ring = snapshot(&self.rx_ring);
        let pool = self.pool.lock().stats();
        let interrupts = *self.interrupt_stats.lock();
        let recovery = self.recovery.lock().snapshot();

        NicStats {
            dma_capability: capabilities.dma_capability(),
            adapter_class: capabilities.adapter_class(),
            work_limit: self.work_limit(),
            tx_ring,
            rx_ring,
            pool,
            interrupts,
            recovery,
            disabled: self.is_disabled(),
        }
    }

    /// Stop the engine. Every buffer still posted goes back to its owner,
    /// the returned statistics show whether anything leaked.
    pub fn shutdown(self) -> PoolStats {
        self.disabled.store(true, Ordering::Release);
        if let Err(e) = self.rebuild_rings(None) {
            error!("Failed to quiesce rings on shutdown: {}", e);
        }

        let stats = self.pool.lock().stats();
        if stats.outstanding != 0 {
            error!("{} buffers still outstanding after shutdown", stats.outstanding);
        } else {
            info!(
                "Shutdown clean, {} allocations, peak {} outstanding",
                stats.allocated, stats.peak_outstanding
            );
        }
        stats
    }

    /// Give a reclaimed buffer back to whoever owns it
    pub(crate) fn release_buffer(&self, buffer: PostedBuffer, sink: Option<&mut dyn PacketSink>) {
        match buffer {
            PostedBuffer::Pooled(handle) => {
                if let Err(e) = self.pool.lock().free(handle) {
                    error!("Releasing buffer failed: {}", e);
                }
            }
            PostedBuffer::Borrowed(fragment) => match sink {
                Some(sink) => sink.released(fragment),
                None => self.sink.lock().released(fragment),
            },
        }
    }

    /// Reset both rings, returning every posted buffer, and re-program the adapter.
    /// Receive buffers are not reposted. Runs from the drain, so nothing is allocated.
    pub(crate) fn rebuild_rings(&self, mut sink: Option<&mut dyn PacketSink>) -> anyhow::Result<()> {
        for direction in [Direction::Transmit, Direction::Receive] {
            // Buffers are handed back after the ring lock is gone, the sink may post again
            let mut returned: [Option<PostedBuffer>; MAX_RING_DEPTH as usize] =
                std::array::from_fn(|_| None);
            let mut count = 0;
            let mut ring = self.ring(direction).lock();
            ring.reset(&self.hw, |buffer| match returned.get_mut(count) {
                Some(entry) => {
                    *entry = Some(buffer);
                    count += 1;
                }
                None => error!("{:?} ring holds more buffers than its depth", direction),
            })?;
            drop(ring);

            for buffer in returned.iter_mut().filter_map(Option::take) {
                let sink = sink.as_mut().map(|s| &mut **s as &mut dyn PacketSink);
                self.release_buffer(buffer, sink);
            }
        }
        Ok(())
    }
}
