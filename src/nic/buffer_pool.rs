use std::fmt;

use log::{debug, error, trace, warn};

use crate::util::align_up;
use crate::DmaWindow;

pub const SMALL_BUFFER_SIZE: u16 = 256;
pub const LARGE_BUFFER_SIZE: u16 = 1600;
// Packets shorter than this are copied into small buffers
pub const DEFAULT_COPYBREAK: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Small,
    Large,
}

impl Tier {
    pub fn buffer_size(self) -> u16 {
        match self {
            Tier::Small => SMALL_BUFFER_SIZE,
            Tier::Large => LARGE_BUFFER_SIZE,
        }
    }
}

/// Exclusive claim on one pool buffer.
///
/// Not `Clone`: a handle moves from the pool to a descriptor and back, it can never be
/// held twice. Handles rebuilt from raw parts (FFI) are still checked on free.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferHandle {
    tier: Tier,
    index: u16,
    address: u32,
}

impl BufferHandle {
    pub fn from_raw_parts(tier: Tier, index: u16, address: u32) -> Self {
        BufferHandle {
            tier,
            index,
            address,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn size(&self) -> u16 {
        self.tier.buffer_size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    Exhausted,
    InvalidHandle,
    TooLarge(u16),
    Busy,
    NoSpace,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted => write!(f, "no free buffer left"),
            PoolError::InvalidHandle => write!(f, "handle is not an outstanding buffer of this pool"),
            PoolError::TooLarge(size) => {
                write!(f, "{} bytes exceed the largest buffer ({})", size, LARGE_BUFFER_SIZE)
            }
            PoolError::Busy => write!(f, "buffers are still outstanding"),
            PoolError::NoSpace => write!(f, "buffer region too small for requested counts"),
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: u64,
    pub freed: u64,
    pub outstanding: u32,
    pub peak_outstanding: u32,
    pub small_free: u16,
    pub large_free: u16,
    pub small_count: u16,
    pub large_count: u16,
    // Small requests served from the large tier
    pub fallbacks: u64,
    pub exhausted: u64,
    pub invalid_frees: u64,
}

#[derive(Debug)]
struct TierPool {
    tier: Tier,
    base: u32,
    stride: u32,
    count: u16,
    // Indices of free buffers, used as a stack so hot buffers get reused first
    free_list: Vec<u16>,
    in_use: Vec<bool>,
}

impl TierPool {
    fn new(tier: Tier, base: u32, stride: u32, count: u16) -> Self {
        TierPool {
            tier,
            base,
            stride,
            count,
            free_list: (0..count).rev().collect(),
            in_use: vec![false; count as usize],
        }
    }

    fn end(&self) -> u64 {
        self.base as u64 + self.stride as u64 * self.count as u64
    }

    fn address_of(&self, index: u16) -> u32 {
        self.base + self.stride * index as u32
    }

    fn take(&mut self) -> Option<BufferHandle> {
        let index = self.free_list.pop()?;
        self.in_use[index as usize] = true;
        Some(BufferHandle {
            tier: self.tier,
            index,
            address: self.address_of(index),
        })
    }

    fn owns(&self, handle: &BufferHandle) -> bool {
        handle.tier == self.tier
            && handle.index < self.count
            && handle.address == self.address_of(handle.index)
    }

    fn free_count(&self) -> u16 {
        self.free_list.len() as u16
    }
}

/// Two tier pool of fixed size buffers carved out of DMA reachable memory
#[derive(Debug)]
pub struct BufferPool {
    region: DmaWindow,
    alignment: u32,
    copybreak: u16,
    small: TierPool,
    large: TierPool,
    stats: PoolStats,
}

impl BufferPool {
    pub fn new(
        region: DmaWindow, alignment: u8, copybreak: u16, small_count: u16, large_count: u16,
    ) -> Result<Self, PoolError> {
        let alignment = (alignment as u32).max(1);
        let (small, large) = Self::layout(region, alignment, small_count, large_count)
            .ok_or(PoolError::NoSpace)?;

        debug!(
            "Buffer pool: {} small at {:#x}, {} large at {:#x}",
            small_count, small.base, large_count, large.base
        );

        Ok(BufferPool {
            region,
            alignment,
            copybreak,
            small,
            large,
            stats: PoolStats::default(),
        })
    }

    fn layout(
        region: DmaWindow, alignment: u32, small_count: u16, large_count: u16,
    ) -> Option<(TierPool, TierPool)> {
        let small_stride = align_up(SMALL_BUFFER_SIZE as u64, alignment as u64);
        let large_stride = align_up(LARGE_BUFFER_SIZE as u64, alignment as u64);

        let small_base = align_up(region.base as u64, alignment as u64);
        let large_base = align_up(small_base + small_stride * small_count as u64, alignment as u64);
        let end = large_base + large_stride * large_count as u64;
        if end > region.end() {
            return None;
        }

        let small = TierPool::new(Tier::Small, small_base as u32, small_stride as u32, small_count);
        let large = TierPool::new(Tier::Large, large_base as u32, large_stride as u32, large_count);
        Some((small, large))
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut TierPool {
        match tier {
            Tier::Small => &mut self.small,
            Tier::Large => &mut self.large,
        }
    }

    pub fn alloc(&mut self, size_hint: u16) -> Result<BufferHandle, PoolError> {
        if size_hint > LARGE_BUFFER_SIZE {
            return Err(PoolError::TooLarge(size_hint));
        }

        let handle = if size_hint < self.copybreak {
            match self.small.take() {
                Some(handle) => Some(handle),
                None => {
                    let handle = self.large.take();
                    if handle.is_some() {
                        trace!("Small tier exhausted, falling back to large buffer");
                        self.stats.fallbacks += 1;
                    }
                    handle
                }
            }
        } else {
            self.large.take()
        };

        match handle {
            Some(handle) => {
                self.stats.allocated += 1;
                self.stats.peak_outstanding = self.stats.peak_outstanding.max(self.outstanding());
                Ok(handle)
            }
            None => {
                self.stats.exhausted += 1;
                debug!("Buffer pool exhausted for {} byte request", size_hint);
                Err(PoolError::Exhausted)
            }
        }
    }

    /// Return a buffer. A handle that is not currently outstanding leaves the pool untouched.
    pub fn free(&mut self, handle: BufferHandle) -> Result<(), PoolError> {
        let pool = self.tier_mut(handle.tier);
        if !pool.owns(&handle) {
            error!("Freeing foreign buffer {:?}", handle);
            self.stats.invalid_frees += 1;
            return Err(PoolError::InvalidHandle);
        }
        if !pool.in_use[handle.index as usize] {
            error!("Double free of buffer {:?}", handle);
            self.stats.invalid_frees += 1;
            return Err(PoolError::InvalidHandle);
        }

        pool.in_use[handle.index as usize] = false;
        pool.free_list.push(handle.index);
        self.stats.freed += 1;
        Ok(())
    }

    /// Change buffer counts, only while nothing is outstanding
    pub fn resize(&mut self, small_count: u16, large_count: u16) -> Result<(), PoolError> {
        if self.outstanding() != 0 {
            warn!("Refusing to resize pool, {} buffers outstanding", self.outstanding());
            return Err(PoolError::Busy);
        }

        let (small, large) = Self::layout(self.region, self.alignment, small_count, large_count)
            .ok_or(PoolError::NoSpace)?;
        self.small = small;
        self.large = large;
        debug!("Buffer pool resized to {} small, {} large", small_count, large_count);
        Ok(())
    }

    pub fn outstanding(&self) -> u32 {
        (self.small.count - self.small.free_count()) as u32
            + (self.large.count - self.large.free_count()) as u32
    }

    pub fn free_count(&self, tier: Tier) -> u16 {
        match tier {
            Tier::Small => self.small.free_count(),
            Tier::Large => self.large.free_count(),
        }
    }

    pub fn copybreak(&self) -> u16 {
        self.copybreak
    }

    /// Whether an address range lies within the buffers handed out by this pool
    pub fn contains(&self, address: u32, length: u32) -> bool {
        let end = address as u64 + length as u64;
        [&self.small, &self.large]
            .iter()
            .any(|pool| address >= pool.base && end <= pool.end())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.outstanding(),
            small_free: self.small.free_count(),
            large_free: self.large.free_count(),
            small_count: self.small.count,
            large_count: self.large.count,
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(small: u16, large: u16) -> BufferPool {
        let region = DmaWindow {
            base: 0x1_0000,
            length: 0x2_0000,
        };
        BufferPool::new(region, 4, DEFAULT_COPYBREAK, small, large).unwrap()
    }

    #[test]
    fn copybreak_boundary_selects_tier() {
        let mut pool = pool(4, 4);
        assert_eq!(pool.alloc(199).unwrap().tier(), Tier::Small);
        assert_eq!(pool.alloc(200).unwrap().tier(), Tier::Large);
        assert_eq!(pool.alloc(1600).unwrap().tier(), Tier::Large);
        assert_eq!(pool.alloc(1601), Err(PoolError::TooLarge(1601)));
    }

    #[test]
    fn small_exhaustion_falls_back_to_large() {
        let mut pool = pool(1, 1);
        let first = pool.alloc(64).unwrap();
        let second = pool.alloc(64).unwrap();
        assert_eq!(first.tier(), Tier::Small);
        assert_eq!(second.tier(), Tier::Large);
        assert_eq!(pool.alloc(64), Err(PoolError::Exhausted));

        let stats = pool.stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.outstanding, 2);
    }

    #[test]
    fn large_exhaustion_does_not_use_small() {
        let mut pool = pool(4, 1);
        let _held = pool.alloc(1500).unwrap();
        assert_eq!(pool.alloc(1500), Err(PoolError::Exhausted));
        assert_eq!(pool.free_count(Tier::Small), 4);
    }

    #[test]
    fn double_free_is_rejected_and_harmless() {
        let mut pool = pool(2, 2);
        let handle = pool.alloc(1000).unwrap();
        let (tier, index, address) = (handle.tier(), handle.index(), handle.address());
        pool.free(handle).unwrap();

        let before = pool.stats();
        let forged = BufferHandle::from_raw_parts(tier, index, address);
        assert_eq!(pool.free(forged), Err(PoolError::InvalidHandle));

        let after = pool.stats();
        assert_eq!(after.large_free, before.large_free);
        assert_eq!(after.freed, before.freed);
        assert_eq!(after.invalid_frees, 1);

        // Still only two distinct large buffers to hand out
        let a = pool.alloc(1000).unwrap();
        let b = pool.alloc(1000).unwrap();
        assert_ne!(a.address(), b.address());
        assert_eq!(pool.alloc(1000), Err(PoolError::Exhausted));
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let mut pool = pool(2, 2);
        let outside = BufferHandle::from_raw_parts(Tier::Small, 7, 0x9000_0000);
        assert_eq!(pool.free(outside), Err(PoolError::InvalidHandle));

        let handle = pool.alloc(10).unwrap();
        let misaligned = BufferHandle::from_raw_parts(Tier::Small, handle.index(), handle.address() + 1);
        assert_eq!(pool.free(misaligned), Err(PoolError::InvalidHandle));
        let wrong_tier = BufferHandle::from_raw_parts(Tier::Large, handle.index(), handle.address());
        assert_eq!(pool.free(wrong_tier), Err(PoolError::InvalidHandle));
        assert_eq!(pool.stats().outstanding, 1);
        pool.free(handle).unwrap();
    }

    #[test]
    fn buffers_respect_alignment_and_do_not_overlap() {
        let region = DmaWindow {
            base: 0x1_0003,
            length: 0x1_0000,
        };
        let mut pool = BufferPool::new(region, 64, DEFAULT_COPYBREAK, 3, 3).unwrap();
        let mut handles = Vec::new();
        while let Ok(handle) = pool.alloc(100) {
            handles.push(handle);
        }
        assert_eq!(handles.len(), 6);

        let mut ranges: Vec<(u32, u32)> = handles
            .iter()
            .map(|h| (h.address(), h.address() + h.size() as u32))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
        assert!(handles.iter().all(|h| h.address() % 64 == 0));
        assert!(handles.iter().all(|h| region.contains(h.address(), h.size() as u32)));
    }

    #[test]
    fn resize_requires_idle_pool() {
        let mut pool = pool(2, 2);
        let handle = pool.alloc(10).unwrap();
        assert_eq!(pool.resize(8, 8), Err(PoolError::Busy));
        pool.free(handle).unwrap();

        pool.resize(8, 8).unwrap();
        assert_eq!(pool.stats().small_count, 8);
        assert_eq!(pool.resize(1000, 1000), Err(PoolError::NoSpace));
        assert_eq!(pool.stats().large_count, 8);
    }

    #[test]
    fn peak_tracks_high_water_mark() {
        let mut pool = pool(4, 4);
        let a = pool.alloc(10).unwrap();
        let b = pool.alloc(10).unwrap();
        pool.free(a).unwrap();
        let c = pool.alloc(10).unwrap();
        pool.free(b).unwrap();
        pool.free(c).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.peak_outstanding, 2);
        assert_eq!(stats.allocated, stats.freed);
        assert_eq!(stats.outstanding, 0);
    }

    // Linear congruential generator, fixed seed keeps the run reproducible
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) as u32
        }
    }

    #[test]
    fn interleaved_alloc_and_free_leaves_nothing_outstanding() {
        for seed in [1u64, 7, 42, 0xDEAD_BEEF] {
            let mut rng = Lcg(seed);
            let mut pool = pool(8, 8);
            let mut held: Vec<BufferHandle> = Vec::new();

            for _ in 0..2000 {
                if held.is_empty() || rng.next() % 3 != 0 {
                    let size = (rng.next() % LARGE_BUFFER_SIZE as u32) as u16 + 1;
                    match pool.alloc(size) {
                        Ok(handle) => {
                            assert!(handle.size() >= size);
                            held.push(handle);
                        }
                        Err(e) => {
                            assert_eq!(e, PoolError::Exhausted);
                            assert_eq!(pool.outstanding() as usize, held.len());
                        }
                    }
                } else {
                    let victim = rng.next() as usize % held.len();
                    pool.free(held.swap_remove(victim)).unwrap();
                }

                assert_eq!(pool.outstanding() as usize, held.len());
            }

            let mut addresses: Vec<u32> = held.iter().map(|h| h.address()).collect();
            addresses.sort_unstable();
            addresses.dedup();
            assert_eq!(addresses.len(), held.len(), "seed {}", seed);

            for handle in held.drain(..) {
                pool.free(handle).unwrap();
            }
            let stats = pool.stats();
            assert_eq!(stats.outstanding, 0, "seed {}", seed);
            assert_eq!(stats.allocated, stats.freed, "seed {}", seed);
            assert_eq!(stats.invalid_frees, 0);
            assert_eq!((stats.small_free, stats.large_free), (8, 8));
        }
    }
}
