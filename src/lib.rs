use anyhow::Result;

pub mod nic;
pub mod sim;

mod ffi;
mod util;

pub use nic::buffer_pool::{BufferHandle, BufferPool, PoolError, PoolStats, Tier};
pub use nic::config::{AdapterClass, Capabilities, ConfigError, DmaCapability, EngineConfig};
pub use nic::descriptors::{Descriptor, ErrorCode, StatusFlags};
pub use nic::interrupts::{EventType, InterruptStats};
pub use nic::recovery::{
    ErrorCategory, ErrorRecoveryState, RecoveryAction, RecoveryController, RecoveryState,
};
pub use nic::ring::{Completion, DescriptorRing, PostedBuffer, RingError};
pub use nic::stats::NicStats;
pub use nic::{NicContext, TransferError};

/// Direction of a transfer, also names the ring serving it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Transmit,
    Receive,
}

/// One piece of a logical packet, by physical address in host memory
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub address: u32,
    pub length: u16,
}

impl Fragment {
    pub fn new(address: u32, length: u16) -> Self {
        Fragment { address, length }
    }
}

/// Physical address window the adapter is allowed to bus-master.
/// Descriptor rings and buffer tiers are laid out inside it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaWindow {
    pub base: u32,
    pub length: u32,
}

impl DmaWindow {
    pub fn end(&self) -> u64 {
        self.base as u64 + self.length as u64
    }

    pub fn contains(&self, address: u32, length: u32) -> bool {
        address >= self.base && address as u64 + length as u64 <= self.end()
    }

    pub fn overlaps(&self, address: u32, length: u32) -> bool {
        length != 0 && (address as u64) < self.end() && address as u64 + length as u64 > self.base as u64
    }
}

/// Frame pulled out of the receive FIFO of a programmed-I/O adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoFrame {
    // Bytes written into the supplied buffer
    pub length: u16,
    // Raw error bits as reported by the adapter, 0 if the frame is good
    pub error_code: u8,
}

/// Everything the engine needs from the platform and the adapter itself.
///
/// Host memory is only ever reached by physical address through `dma_read`/`dma_write`,
/// so the engine stays independent of how the platform maps it.
pub trait NicHardware {
    // Static capability flags, read at bring-up and again on reinitialization
    fn capabilities(&self) -> Capabilities;
    fn dma_window(&self) -> DmaWindow;

    fn dma_read(&self, address: u32, buffer: &mut [u8]);
    fn dma_write(&self, address: u32, buffer: &[u8]);

    // Descriptor list pointer for the given ring
    fn program_ring(&self, ring: Direction, base_address: u32, capacity: u16);
    // Poll demand, descriptors were posted on the given ring
    fn kick(&self, ring: Direction);

    // Programmed I/O, only used when the adapter can not bus-master
    fn fifo_write(&self, frame: &[u8]) -> Result<()>;
    fn fifo_read(&self, buffer: &mut [u8]) -> Option<FifoFrame>;
    // Error bits of the last FIFO transmit, cleared by reading. 0 if the frame went out.
    fn fifo_tx_status(&self) -> u8 {
        0
    }

    fn acknowledge_interrupt(&self);

    // Recovery actions, from least to most invasive
    fn rearm(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn switch_to_standby(&self) -> Result<()>;
    fn is_ready(&self) -> bool;
    fn self_test(&self) -> Result<()>;

    // Free running millisecond timer, polled for timeouts and rate limiting
    fn now_ms(&self) -> u64;
}

/// Upper layer collaborator receiving packets and getting caller buffers back
pub trait PacketSink {
    /// Called once per good receive completion, must not block
    fn receive(&mut self, payload: &[u8]);

    /// Caller memory that was posted zero-copy is no longer referenced by any descriptor
    fn released(&mut self, _fragment: Fragment) {}
}

/// Sink dropping everything, for adapters that only transmit
pub struct DiscardSink;

impl PacketSink for DiscardSink {
    fn receive(&mut self, _payload: &[u8]) {}
}
