use log::{debug, error, trace, warn};

use crate::nic::buffer_pool::{PoolError, LARGE_BUFFER_SIZE};
use crate::nic::config::DmaCapability;
use crate::nic::descriptors::{Descriptor, ErrorCode};
use crate::nic::ring::{PostedBuffer, RingError};
use crate::nic::{NicContext, TransferError};
use crate::{Direction, DmaWindow, Fragment, NicHardware};

// Bounce chunk used while consolidating fragments, lives on the stack
const COPY_CHUNK: usize = 256;

// Bus-master adapters drive 24 address lines and their DMA counter wraps at 64KB
pub const DMA_ADDRESS_LIMIT: u64 = 0x0100_0000;
pub const DMA_PAGE_SIZE: u64 = 0x1_0000;

/// Why caller memory has to be copied before the adapter may touch it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceReason {
    NoBusMaster,
    Scattered,
    Unaligned,
    CrossesPage,
    AboveLimit,
    EngineMemory,
}

pub fn crosses_dma_page(address: u32, length: u32) -> bool {
    if length == 0 {
        return false;
    }
    let last = address as u64 + length as u64 - 1;
    address as u64 / DMA_PAGE_SIZE != last / DMA_PAGE_SIZE
}

/// Checks whether one fragment can be handed to a bus-master adapter as is.
/// `engine` is memory owned by the engine, caller buffers must never alias it.
pub fn check_fragment(fragment: Fragment, alignment: u32, engine: DmaWindow) -> Option<BounceReason> {
    let (address, length) = (fragment.address, fragment.length as u32);
    if engine.overlaps(address, length) {
        Some(BounceReason::EngineMemory)
    } else if address as u64 + length as u64 > DMA_ADDRESS_LIMIT {
        Some(BounceReason::AboveLimit)
    } else if crosses_dma_page(address, length) {
        Some(BounceReason::CrossesPage)
    } else if address % alignment.max(1) != 0 {
        Some(BounceReason::Unaligned)
    } else {
        None
    }
}

impl<H: NicHardware> NicContext<H> {
    /// Hand fragments to the adapter.
    ///
    /// Transmit: the fragments form one packet. It goes out zero-copy when the adapter
    /// can bus-master a single aligned fragment, otherwise it is consolidated into one
    /// pool buffer first. Receive: every fragment is posted as its own receive buffer.
    pub fn submit(&self, direction: Direction, fragments: &[Fragment]) -> Result<(), TransferError> {
        if self.is_disabled() {
            return Err(TransferError::Fatal);
        }
        match direction {
            Direction::Transmit => self.submit_transmit(fragments),
            Direction::Receive => self.submit_receive(fragments),
        }
    }

    fn bounce_reason(&self, fragments: &[Fragment]) -> Option<BounceReason> {
        let capabilities = self.capabilities();
        if capabilities.dma_capability() == DmaCapability::None {
            return Some(BounceReason::NoBusMaster);
        }
        match fragments {
            [fragment] => check_fragment(
                *fragment,
                capabilities.buffer_alignment as u32,
                self.layout.engine_region(),
            ),
            _ => Some(BounceReason::Scattered),
        }
    }

    fn submit_transmit(&self, fragments: &[Fragment]) -> Result<(), TransferError> {
        let total: u32 = fragments.iter().map(|f| f.length as u32).sum();
        if fragments.is_empty() || total == 0 || total > LARGE_BUFFER_SIZE as u32 {
            debug!("Rejecting packet of {} fragments, {} bytes", fragments.len(), total);
            return Err(TransferError::InvalidPacket);
        }
        let total = total as u16;

        // Cheap early out, the post below checks again under the lock
        if self.tx_ring.lock().is_full() {
            return Err(TransferError::Busy);
        }

        let buffer = match self.bounce_reason(fragments) {
            Some(reason) => {
                let handle = self.pool.lock().alloc(total).map_err(|e| match e {
                    PoolError::TooLarge(_) => TransferError::InvalidPacket,
                    _ => TransferError::NoMemory,
                })?;
                self.consolidate(fragments, handle.address());
                trace!(
                    "Consolidated {} fragments into {} bytes at {:#x} ({:?})",
                    fragments.len(),
                    total,
                    handle.address(),
                    reason
                );
                PostedBuffer::Pooled(handle)
            }
            None => PostedBuffer::Borrowed(fragments[0]),
        };

        let posted = self.tx_ring.lock().post(&self.hw, buffer, total, true);
        let slot = match posted {
            Ok(slot) => slot,
            Err(rejected) => {
                // Borrowed memory simply stays with the caller
                if let PostedBuffer::Pooled(handle) = rejected.buffer {
                    if let Err(e) = self.pool.lock().free(handle) {
                        error!("Dropping staging buffer of rejected packet failed: {}", e);
                    }
                }
                return Err(match rejected.error {
                    RingError::Full => TransferError::Busy,
                    RingError::Descriptor(_) => TransferError::Hardware,
                });
            }
        };

        self.start_transmit(slot)
    }

    /// Copy all fragments back to back into the staging buffer
    fn consolidate(&self, fragments: &[Fragment], staging: u32) {
        let mut chunk = [0u8; COPY_CHUNK];
        let mut offset = 0u32;
        for fragment in fragments {
            let length = fragment.length as u32;
            let mut done = 0u32;
            while done < length {
                let n = (length - done).min(COPY_CHUNK as u32) as usize;
                self.hw.dma_read(fragment.address + done, &mut chunk[..n]);
                self.hw.dma_write(staging + offset, &chunk[..n]);
                done += n as u32;
                offset += n as u32;
            }
        }
    }

    /// Tell the adapter about a freshly posted transmit descriptor. Without bus-master DMA
    /// the frame is pushed through the FIFO right away and the descriptor completed by us.
    pub(crate) fn start_transmit(&self, slot: u16) -> Result<(), TransferError> {
        if self.dma_capability() == DmaCapability::BasicBusMaster {
            self.hw.kick(Direction::Transmit);
            return Ok(());
        }

        let descriptor_address = self.tx_ring.lock().descriptor_address(slot);
        let descriptor = Descriptor::read_from(&self.hw, descriptor_address)
            .map_err(|_| TransferError::Hardware)?;
        let (address, length) = (descriptor.buffer_address, descriptor.buffer_length());

        let mut frame = [0u8; LARGE_BUFFER_SIZE as usize];
        let frame = &mut frame[..length as usize];
        self.hw.dma_read(address, frame);

        let (error, result) = match self.hw.fifo_write(frame) {
            Ok(()) => {
                let status = self.hw.fifo_tx_status();
                let error = ErrorCode::from_bits_truncate(status);
                if status != 0 && error.is_empty() {
                    (ErrorCode::ADAPTER_FAILURE, Ok(()))
                } else {
                    (error, Ok(()))
                }
            }
            Err(e) => {
                warn!("FIFO transmit of {} bytes failed: {}", length, e);
                (ErrorCode::ADAPTER_FAILURE, Err(TransferError::Hardware))
            }
        };

        // Reaped by the next drain like any bus-master completion
        if self
            .tx_ring
            .lock()
            .complete_in_software(&self.hw, slot, length, error)
            .is_err()
        {
            return Err(TransferError::Hardware);
        }
        result
    }

    /// Post caller buffers for reception. The adapter writes into them directly, so each
    /// one has to pass the same checks a zero-copy transmit does.
    fn submit_receive(&self, fragments: &[Fragment]) -> Result<(), TransferError> {
        if fragments.is_empty() {
            return Err(TransferError::InvalidPacket);
        }
        let capabilities = self.capabilities();
        let engine = self.layout.engine_region();
        for fragment in fragments {
            if fragment.length == 0 || fragment.length > LARGE_BUFFER_SIZE {
                return Err(TransferError::InvalidPacket);
            }
            let reason = check_fragment(*fragment, capabilities.buffer_alignment as u32, engine);
            let unusable = match capabilities.dma_capability() {
                DmaCapability::BasicBusMaster => reason.is_some(),
                DmaCapability::None => reason == Some(BounceReason::EngineMemory),
            };
            if unusable {
                debug!("Refusing receive buffer {:x?}: {:?}", fragment, reason);
                return Err(TransferError::InvalidPacket);
            }
        }

        {
            let mut ring = self.rx_ring.lock();
            if (ring.free_slots() as usize) < fragments.len() {
                return Err(TransferError::Busy);
            }
            for fragment in fragments {
                let posted = ring.post(&self.hw, PostedBuffer::Borrowed(*fragment), fragment.length, true);
                if let Err(rejected) = posted {
                    return Err(match rejected.error {
                        RingError::Full => TransferError::Busy,
                        RingError::Descriptor(_) => TransferError::Hardware,
                    });
                }
            }
        }

        match self.dma_capability() {
            DmaCapability::BasicBusMaster => self.hw.kick(Direction::Receive),
            DmaCapability::None => {
                self.pio_receive(fragments.len());
            }
        }
        Ok(())
    }

    /// Keep the receive ring stocked with large pool buffers, short of the slots reserved
    /// for caller buffers. Returns how many were posted.
    pub(crate) fn refill_rx_ring(&self) -> u16 {
        let reserved = self.config.rx_reserved_slots;
        let mut posted = 0;
        let mut failed = false;
        while !self.is_disabled() {
            let mut ring = self.rx_ring.lock();
            if ring.free_slots() <= reserved {
                break;
            }

            let handle = match self.pool.lock().alloc(LARGE_BUFFER_SIZE) {
                Ok(handle) => handle,
                Err(_) => {
                    failed = true;
                    break;
                }
            };
            let length = handle.size();
            if let Err(rejected) = ring.post(&self.hw, PostedBuffer::Pooled(handle), length, true) {
                drop(ring);
                if let PostedBuffer::Pooled(handle) = rejected.buffer {
                    if let Err(e) = self.pool.lock().free(handle) {
                        error!("Returning unposted receive buffer failed: {}", e);
                    }
                }
                failed = true;
                break;
            }
            posted += 1;
        }

        if failed {
            trace!("Receive refill stopped after {} buffers", posted);
            self.interrupt_stats.lock().rx_refill_failures += 1;
        }
        if posted > 0 && self.dma_capability() == DmaCapability::BasicBusMaster {
            self.hw.kick(Direction::Receive);
        }
        posted
    }

    /// Move up to `max_frames` frames from the receive FIFO into posted buffers and complete
    /// their descriptors. Returns the number of frames moved.
    pub(crate) fn pio_receive(&self, max_frames: usize) -> usize {
        let mut frame = [0u8; LARGE_BUFFER_SIZE as usize];
        let mut moved = 0;
        while moved < max_frames {
            let target = self.rx_ring.lock().next_incomplete(&self.hw);
            let (slot, address, capacity) = match target {
                Some(target) => target,
                None => break,
            };

            let buffer = &mut frame[..capacity.min(LARGE_BUFFER_SIZE) as usize];
            let received = match self.hw.fifo_read(buffer) {
                Some(received) => received,
                None => break,
            };

            let length = received.length.min(buffer.len() as u16);
            self.hw.dma_write(address, &buffer[..length as usize]);
            let error = ErrorCode::from_bits_truncate(received.error_code);
            let error = if received.error_code != 0 && error.is_empty() {
                ErrorCode::ADAPTER_FAILURE
            } else {
                error
            };

            if let Err(e) = self
                .rx_ring
                .lock()
                .complete_in_software(&self.hw, slot, length, error)
            {
                warn!("Completing receive slot {} failed: {}", slot, e);
                break;
            }
            moved += 1;
        }
        moved
    }
}
