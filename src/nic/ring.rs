use std::fmt;

use log::{debug, error, trace};
use packed_struct::PackingError;

use crate::nic::buffer_pool::BufferHandle;
use crate::nic::descriptors::*;
use crate::{Direction, Fragment, NicHardware};

/// Memory posted on a descriptor, together with who gets it back on completion
#[derive(Debug, PartialEq, Eq)]
pub enum PostedBuffer {
    // Issued by the buffer pool, returned to it
    Pooled(BufferHandle),
    // Caller memory posted zero-copy, released to the caller
    Borrowed(Fragment),
}

impl PostedBuffer {
    pub fn address(&self) -> u32 {
        match self {
            PostedBuffer::Pooled(handle) => handle.address(),
            PostedBuffer::Borrowed(fragment) => fragment.address,
        }
    }

    pub fn capacity(&self) -> u16 {
        match self {
            PostedBuffer::Pooled(handle) => handle.size(),
            PostedBuffer::Borrowed(fragment) => fragment.length,
        }
    }
}

#[derive(Debug)]
pub enum RingError {
    Full,
    Descriptor(PackingError),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::Full => write!(f, "descriptor ring is full"),
            RingError::Descriptor(e) => write!(f, "descriptor packing failed: {:?}", e),
        }
    }
}

impl std::error::Error for RingError {}

impl From<PackingError> for RingError {
    fn from(e: PackingError) -> Self {
        RingError::Descriptor(e)
    }
}

/// Failed post, hands the buffer back so its owner can take care of it
#[derive(Debug)]
pub struct PostError {
    pub error: RingError,
    pub buffer: PostedBuffer,
}

#[derive(Debug)]
struct Slot {
    buffer: PostedBuffer,
    length: u16,
    retried: bool,
}

/// Reclaimed descriptor, ownership of the buffer moves to the receiver of this value
#[derive(Debug)]
pub struct Completion {
    pub slot: u16,
    pub buffer: PostedBuffer,
    // Bytes received, or bytes that were posted for transmit
    pub length: u16,
    pub status: StatusFlags,
    pub error: ErrorCode,
    // Already posted a second time after a transient error
    pub retried: bool,
}

impl Completion {
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub posted: u64,
    pub reaped: u64,
    pub errors: u64,
    pub full: u64,
    pub peak_occupancy: u16,
}

/// Fixed size circular descriptor ring.
///
/// `cur` is the next slot software posts to, `dirty` the oldest slot not yet reclaimed.
/// Both are free running and wrap at `u16::MAX`, which works because the capacity is
/// a power of two.
#[derive(Debug)]
pub struct DescriptorRing {
    direction: Direction,
    base_address: u32,
    capacity: u16,
    cur: u16,
    dirty: u16,
    slots: Vec<Option<Slot>>,
    stats: RingStats,
}

impl DescriptorRing {
    pub fn new(direction: Direction, base_address: u32, capacity: u16) -> Self {
        debug_assert!(capacity.is_power_of_two());
        DescriptorRing {
            direction,
            base_address,
            capacity,
            cur: 0,
            dirty: 0,
            slots: (0..capacity).map(|_| None).collect(),
            stats: RingStats::default(),
        }
    }

    /// Write linked idle descriptors and point the adapter at them
    pub fn initialize(&mut self, hw: &dyn NicHardware) -> Result<(), RingError> {
        for slot in 0..self.capacity {
            let next = self.descriptor_address((slot + 1) % self.capacity);
            Descriptor::unused(next).write_to(hw, self.descriptor_address(slot))?;
        }
        hw.program_ring(self.direction, self.base_address, self.capacity);
        debug!(
            "{:?} ring: {} descriptors at {:#x}",
            self.direction, self.capacity, self.base_address
        );
        Ok(())
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }

    pub fn descriptor_address(&self, slot: u16) -> u32 {
        self.base_address + slot as u32 * DESCRIPTOR_LENGTH as u32
    }

    fn slot_of(&self, index: u16) -> u16 {
        index & (self.capacity - 1)
    }

    /// Descriptors currently owned by the adapter or waiting to be reaped
    pub fn occupancy(&self) -> u16 {
        self.cur.wrapping_sub(self.dirty)
    }

    pub fn free_slots(&self) -> u16 {
        self.capacity - self.occupancy()
    }

    pub fn is_full(&self) -> bool {
        self.occupancy() == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.cur == self.dirty
    }

    pub fn post(
        &mut self, hw: &dyn NicHardware, buffer: PostedBuffer, length: u16, want_interrupt: bool,
    ) -> Result<u16, PostError> {
        self.post_slot(hw, buffer, length, want_interrupt, false)
    }

    /// Post a buffer again after a transient error, it will not be retried a second time
    pub fn post_retry(
        &mut self, hw: &dyn NicHardware, buffer: PostedBuffer, length: u16,
    ) -> Result<u16, PostError> {
        self.post_slot(hw, buffer, length, true, true)
    }

    fn post_slot(
        &mut self, hw: &dyn NicHardware, buffer: PostedBuffer, length: u16, want_interrupt: bool,
        retried: bool,
    ) -> Result<u16, PostError> {
        if self.is_full() {
            self.stats.full += 1;
            return Err(PostError {
                error: RingError::Full,
                buffer,
            });
        }

        let slot = self.slot_of(self.cur);
        let next = self.descriptor_address(self.slot_of(self.cur.wrapping_add(1)));
        let descriptor = Descriptor::posted(next, buffer.address(), length, want_interrupt);
        if let Err(e) = descriptor.write_to(hw, self.descriptor_address(slot)) {
            return Err(PostError {
                error: e.into(),
                buffer,
            });
        }

        trace!(
            "{:?} ring: posted {} bytes at {:#x} in slot {}",
            self.direction,
            length,
            buffer.address(),
            slot
        );
        self.slots[slot as usize] = Some(Slot {
            buffer,
            length,
            retried,
        });
        self.cur = self.cur.wrapping_add(1);

        self.stats.posted += 1;
        self.stats.peak_occupancy = self.stats.peak_occupancy.max(self.occupancy());
        debug_assert!(self.occupancy() <= self.capacity);
        Ok(slot)
    }

    /// Iterate over completed descriptors in ring order, stopping at the first one still
    /// owned by the adapter
    pub fn reap_completed<'a>(&'a mut self, hw: &'a dyn NicHardware) -> Reaper<'a> {
        Reaper {
            ring: self,
            hw,
            finished: false,
        }
    }

    /// Oldest posted slot the adapter has not completed yet, used to fill buffers by
    /// programmed I/O
    pub fn next_incomplete(&self, hw: &dyn NicHardware) -> Option<(u16, u32, u16)> {
        let mut index = self.dirty;
        while index != self.cur {
            let slot = self.slot_of(index);
            let descriptor = Descriptor::read_from(hw, self.descriptor_address(slot)).ok()?;
            if !descriptor.is_complete() {
                let posted = self.slots[slot as usize].as_ref()?;
                return Some((slot, posted.buffer.address(), posted.buffer.capacity()));
            }
            index = index.wrapping_add(1);
        }
        None
    }

    /// Write-back done by software, for adapters that do not bus-master
    pub fn complete_in_software(
        &mut self, hw: &dyn NicHardware, slot: u16, length: u16, error: ErrorCode,
    ) -> Result<(), RingError> {
        let address = self.descriptor_address(slot);
        let mut descriptor = Descriptor::read_from(hw, address)?;
        descriptor.complete(length, error);
        descriptor.write_to(hw, address)?;
        Ok(())
    }

    /// Drop every posted buffer through `release` and start over with idle descriptors.
    /// The slot table is reused, nothing gets allocated.
    pub fn reset(
        &mut self, hw: &dyn NicHardware, mut release: impl FnMut(PostedBuffer),
    ) -> Result<(), RingError> {
        let mut released = 0;
        for slot in self.slots.iter_mut() {
            if let Some(posted) = slot.take() {
                release(posted.buffer);
                released += 1;
            }
        }
        debug!("{:?} ring reset, released {} buffers", self.direction, released);

        self.cur = 0;
        self.dirty = 0;
        self.initialize(hw)
    }

    #[cfg(test)]
    fn with_indices(direction: Direction, base_address: u32, capacity: u16, start: u16) -> Self {
        let mut ring = DescriptorRing::new(direction, base_address, capacity);
        ring.cur = start;
        ring.dirty = start;
        ring
    }
}

pub struct Reaper<'a> {
    ring: &'a mut DescriptorRing,
    hw: &'a dyn NicHardware,
    finished: bool,
}

impl Iterator for Reaper<'_> {
    type Item = Completion;

    fn next(&mut self) -> Option<Completion> {
        while !self.finished {
            let ring = &mut *self.ring;
            if ring.is_empty() {
                self.finished = true;
                break;
            }

            let slot = ring.slot_of(ring.dirty);
            let descriptor = match Descriptor::read_from(self.hw, ring.descriptor_address(slot)) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    error!("{:?} ring: unreadable descriptor {}: {:?}", ring.direction, slot, e);
                    self.finished = true;
                    break;
                }
            };
            if !descriptor.is_complete() {
                self.finished = true;
                break;
            }

            ring.dirty = ring.dirty.wrapping_add(1);
            let posted = match ring.slots[slot as usize].take() {
                Some(posted) => posted,
                None => {
                    error!("{:?} ring: completed slot {} has no buffer", ring.direction, slot);
                    continue;
                }
            };

            let error = descriptor.error_code();
            ring.stats.reaped += 1;
            if !error.is_empty() {
                ring.stats.errors += 1;
            }

            let length = match ring.direction {
                Direction::Receive => descriptor.completed_length(),
                Direction::Transmit => posted.length,
            };

            return Some(Completion {
                slot,
                buffer: posted.buffer,
                length,
                status: descriptor.status_flags(),
                error,
                retried: posted.retried,
            });
        }
        None
    }
}

impl std::iter::FusedIterator for Reaper<'_> {}
