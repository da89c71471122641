//! Physical frame allocator.
//!
//! A bitmap over all of RAM, one bit per 4 KiB frame, with a set bit
//! meaning the frame is free. Allocation is a linear scan from a cursor
//! that advances past each handed-out frame; freeing rewinds the cursor
//! to the freed frame so address space is reused low-first.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Size of a physical frame (4 KiB)
pub const FRAME_SIZE: u32 = 4096;

/// Largest amount of RAM the bitmap can track (512 MiB).
const MAX_FRAMES: usize = 131_072;
const BITMAP_WORDS: usize = MAX_FRAMES / 64;

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(u32);

impl FrameNumber {
    pub const fn new(num: u32) -> Self {
        Self(num)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn as_addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * FRAME_SIZE)
    }
}

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u32);

impl PhysicalAddress {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn as_frame(&self) -> FrameNumber {
        FrameNumber::new(self.0 / FRAME_SIZE)
    }

    pub const fn is_frame_aligned(&self) -> bool {
        self.0 % FRAME_SIZE == 0
    }
}

/// Bitmap frame pool
pub struct FrameBitmap {
    /// One bit per frame, set = free
    bitmap: [u64; BITMAP_WORDS],
    /// Frames actually backed by RAM
    total_frames: usize,
    /// Count of set bits, maintained on every transition
    free_frames: usize,
    /// Next bit to examine on allocation
    cursor: usize,
}

impl FrameBitmap {
    /// Create an empty pool; every frame starts out used until
    /// [`add_region`](Self::add_region) donates RAM to it.
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            total_frames: 0,
            free_frames: 0,
            cursor: 0,
        }
    }

    /// Donate a physical RAM region to the pool. Partial frames at either
    /// end are discarded.
    pub fn add_region(&mut self, base: PhysicalAddress, len: u32) {
        let first = base.as_u32().div_ceil(FRAME_SIZE);
        let last = (base.as_u32().saturating_add(len)) / FRAME_SIZE;

        for frame in first..last {
            let idx = frame as usize;
            if idx >= MAX_FRAMES {
                break;
            }
            if !self.is_free(FrameNumber::new(frame)) {
                self.bitmap[idx / 64] |= 1 << (idx % 64);
                self.free_frames += 1;
            }
            if idx >= self.total_frames {
                self.total_frames = idx + 1;
            }
        }
    }

    /// Remove a region from the pool (kernel image, the bitmap itself,
    /// firmware-reserved ranges).
    pub fn mark_region_used(&mut self, base: PhysicalAddress, len: u32) {
        let first = base.as_u32() / FRAME_SIZE;
        let last = base.as_u32().saturating_add(len).div_ceil(FRAME_SIZE);

        for frame in first..last {
            let idx = frame as usize;
            if idx >= MAX_FRAMES {
                break;
            }
            if self.is_free(FrameNumber::new(frame)) {
                self.bitmap[idx / 64] &= !(1 << (idx % 64));
                self.free_frames -= 1;
            }
        }
    }

    pub fn is_free(&self, frame: FrameNumber) -> bool {
        let idx = frame.as_u32() as usize;
        idx < MAX_FRAMES && self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Hand out one frame, scanning forward from the cursor and wrapping
    /// once before giving up.
    pub fn alloc_frame(&mut self) -> KernelResult<PhysicalAddress> {
        if self.free_frames == 0 {
            return Err(KernelError::NoMemory);
        }

        let limit = self.total_frames;
        let mut examined = 0;
        let mut idx = self.cursor;

        while examined < limit {
            if idx >= limit {
                idx = 0;
            }
            if self.bitmap[idx / 64] & (1 << (idx % 64)) != 0 {
                self.bitmap[idx / 64] &= !(1 << (idx % 64));
                self.free_frames -= 1;
                self.cursor = idx + 1;
                return Ok(FrameNumber::new(idx as u32).as_addr());
            }
            idx += 1;
            examined += 1;
        }

        Err(KernelError::NoMemory)
    }

    /// Return a frame to the pool. Freeing an already-free frame is an
    /// invariant violation and is reported rather than absorbed.
    pub fn free_frame(&mut self, addr: PhysicalAddress) -> KernelResult<()> {
        let frame = addr.as_frame();
        let idx = frame.as_u32() as usize;

        if !addr.is_frame_aligned() || idx >= self.total_frames {
            return Err(KernelError::BadArgument);
        }
        if self.is_free(frame) {
            return Err(KernelError::BadArgument);
        }

        self.bitmap[idx / 64] |= 1 << (idx % 64);
        self.free_frames += 1;
        if idx < self.cursor {
            self.cursor = idx;
        }
        Ok(())
    }

    pub fn total_memory(&self) -> u64 {
        self.total_frames as u64 * FRAME_SIZE as u64
    }

    pub fn free_memory(&self) -> u64 {
        self.free_frames as u64 * FRAME_SIZE as u64
    }

    pub fn used_memory(&self) -> u64 {
        self.total_memory() - self.free_memory()
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Count set bits the slow way. Used by the consistency check; the
    /// result must always equal `free_frames`.
    pub fn count_free_bits(&self) -> usize {
        self.bitmap
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }
}

impl Default for FrameBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator instance
static FRAME_ALLOCATOR: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::new());

/// Allocate one physical frame.
pub fn alloc_frame() -> KernelResult<PhysicalAddress> {
    FRAME_ALLOCATOR.lock().alloc_frame()
}

/// Free one physical frame.
pub fn free_frame(addr: PhysicalAddress) {
    if let Err(e) = FRAME_ALLOCATOR.lock().free_frame(addr) {
        log::warn!("pmm: bad free of {:#010x}: {}", addr.as_u32(), e);
    }
}

pub fn total_memory() -> u64 {
    FRAME_ALLOCATOR.lock().total_memory()
}

pub fn free_memory() -> u64 {
    FRAME_ALLOCATOR.lock().free_memory()
}

pub fn used_memory() -> u64 {
    FRAME_ALLOCATOR.lock().used_memory()
}

/// Run `f` against the global pool. Initialization and the invariant
/// checks go through here.
pub fn with_pool<R>(f: impl FnOnce(&mut FrameBitmap) -> R) -> R {
    f(&mut FRAME_ALLOCATOR.lock())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn pool_with_ram(frames: u32) -> FrameBitmap {
        let mut pool = FrameBitmap::new();
        pool.add_region(PhysicalAddress::new(0), frames * FRAME_SIZE);
        pool
    }

    #[test]
    fn alloc_advances_free_rewinds() {
        let mut pool = pool_with_ram(16);
        let a = pool.alloc_frame().expect("fresh pool should allocate");
        let b = pool.alloc_frame().expect("second frame should allocate");
        assert_eq!(a, PhysicalAddress::new(0));
        assert_eq!(b, PhysicalAddress::new(FRAME_SIZE));

        pool.free_frame(a).expect("freeing a live frame succeeds");
        // Cursor rewound, so the freed frame is handed out again first.
        let c = pool.alloc_frame().expect("reallocation succeeds");
        assert_eq!(c, a);
    }

    #[test]
    fn free_count_matches_set_bits() {
        let mut pool = pool_with_ram(64);
        for _ in 0..10 {
            pool.alloc_frame().expect("pool has room");
        }
        assert_eq!(pool.free_frames(), pool.count_free_bits());
        assert_eq!(pool.free_frames(), 54);
    }

    #[test]
    fn alloc_then_free_restores_free_memory() {
        let mut pool = pool_with_ram(32);
        let before = pool.free_memory();
        let f = pool.alloc_frame().expect("pool has room");
        assert_eq!(pool.free_memory(), before - FRAME_SIZE as u64);
        pool.free_frame(f).expect("frame is live");
        assert_eq!(pool.free_memory(), before);
    }

    #[test]
    fn exhaustion_reports_no_memory() {
        let mut pool = pool_with_ram(2);
        pool.alloc_frame().expect("frame 0");
        pool.alloc_frame().expect("frame 1");
        assert_eq!(pool.alloc_frame(), Err(KernelError::NoMemory));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut pool = pool_with_ram(4);
        let f = pool.alloc_frame().expect("pool has room");
        pool.free_frame(f).expect("first free succeeds");
        assert_eq!(pool.free_frame(f), Err(KernelError::BadArgument));
    }

    #[test]
    fn reserved_regions_are_skipped() {
        let mut pool = pool_with_ram(8);
        pool.mark_region_used(PhysicalAddress::new(0), 2 * FRAME_SIZE);
        let f = pool.alloc_frame().expect("unreserved frames remain");
        assert_eq!(f, PhysicalAddress::new(2 * FRAME_SIZE));
    }
}
