//! Bitmap-based physical frame allocator.
//!
//! One bit per 4 KiB frame: bit = 1 means allocated/reserved, bit = 0 means
//! free. The bitmap is sized for the full 32-bit physical space (1 Mi frames
//! = 128 KiB) and lives out-of-line in the top of the boot-reserved region,
//! accessed through the physical window; the struct itself stays small
//! enough to move through ordinary kernel stacks. Frames beyond the end of
//! installed RAM stay permanently marked allocated. Word-level scanning
//! with `trailing_zeros()` (compiles to TZCNT/BSF) provides efficient
//! allocation while preserving strict lowest-address-first ordering.

use muon_core::addr::PhysAddr;
use muon_core::paging::PhysFrame;

use crate::layout::BOOT_RESERVED;
use crate::{FrameAllocator, FrameDeallocator, PmmError};

const FRAME_SIZE: u64 = 4096;
const BITS_PER_WORD: usize = 32;

/// Frames tracked by the bitmap: the entire 4 GiB physical space.
const MAX_FRAMES: usize = 1 << 20;
const BITMAP_WORDS: usize = MAX_FRAMES / BITS_PER_WORD;
const BITMAP_BYTES: u64 = (BITMAP_WORDS * 4) as u64;

/// Physical base of the bitmap: the top 128 KiB of the boot-reserved
/// region, below anything the allocator will ever hand out.
const BITMAP_PHYS_BASE: u64 = BOOT_RESERVED - BITMAP_BYTES;

/// A bitmap-based physical frame allocator.
///
/// All mutation goes through `&mut self`; the outer
/// `spin::Mutex<Option<MemoryManager>>` provides thread safety, so no
/// interior lock is needed.
///
/// The search hint always points at or below the lowest word containing a
/// free bit: allocation advances it and every free lowers it, so the scan
/// still returns the lowest free frame while skipping known-full words.
pub struct BitmapAllocator {
    /// One bit per frame, fixed capacity for the whole 32-bit space.
    /// Backed by the boot-reserved region through the physical window.
    bitmap: &'static mut [u32],
    /// Number of frames actually backed by RAM.
    total_frames: usize,
    /// Number of currently free frames.
    free_count: usize,
    /// Word index hint for next allocation search (amortized O(1)).
    search_hint: usize,
}

impl BitmapAllocator {
    /// Creates an allocator tracking `total_memory` bytes of physical RAM,
    /// with physical memory reachable at `phys_offset`.
    ///
    /// All frames start reserved; frames backed by RAM are then freed,
    /// except the first [`BOOT_RESERVED`] bytes (BIOS data, kernel image,
    /// boot structures, the bitmap itself), which are never handed out.
    ///
    /// # Safety
    ///
    /// The window at `phys_offset` must cover at least the boot-reserved
    /// region with writable memory, and the bitmap region
    /// (`BOOT_RESERVED - 128 KiB` up to `BOOT_RESERVED`) must not be in use
    /// by anything else. At most one allocator may be live per window.
    pub unsafe fn new(total_memory: u64, phys_offset: usize) -> Result<Self, PmmError> {
        let total_frames = core::cmp::min((total_memory / FRAME_SIZE) as usize, MAX_FRAMES);
        let reserved_frames = core::cmp::min((BOOT_RESERVED / FRAME_SIZE) as usize, total_frames);

        if total_frames <= reserved_frames {
            return Err(PmmError::OutOfMemory);
        }

        // SAFETY: The caller guarantees the window covers the boot-reserved
        // region and that the bitmap storage is exclusively ours; the
        // allocator never frees frames below BOOT_RESERVED, so no alias of
        // this slice can be handed out.
        let bitmap = unsafe {
            core::slice::from_raw_parts_mut(
                (phys_offset + BITMAP_PHYS_BASE as usize) as *mut u32,
                BITMAP_WORDS,
            )
        };
        bitmap.fill(u32::MAX);

        let mut allocator = Self {
            bitmap,
            total_frames,
            free_count: 0,
            search_hint: 0,
        };

        for frame_idx in reserved_frames..total_frames {
            allocator.bitmap[frame_idx / BITS_PER_WORD] &= !(1u32 << (frame_idx % BITS_PER_WORD));
            allocator.free_count += 1;
        }
        allocator.search_hint = reserved_frames / BITS_PER_WORD;

        Ok(allocator)
    }

    /// Allocates a single 4 KiB physical frame, always the lowest free one.
    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.free_count == 0 {
            return None;
        }

        // Scan from search_hint; every word below it is known full.
        let words = (self.total_frames + BITS_PER_WORD - 1) / BITS_PER_WORD;
        for word_idx in self.search_hint..words {
            let word = self.bitmap[word_idx];

            // If all bits set, this word has no free frames.
            if word == u32::MAX {
                continue;
            }

            // Find first zero bit: invert, then trailing_zeros gives position.
            let bit_idx = (!word).trailing_zeros() as usize;
            let frame_idx = word_idx * BITS_PER_WORD + bit_idx;

            if frame_idx >= self.total_frames {
                continue;
            }

            // Mark as allocated.
            self.bitmap[word_idx] |= 1u32 << bit_idx;
            self.free_count -= 1;
            self.search_hint = word_idx;

            let phys_addr = frame_idx as u64 * FRAME_SIZE;
            return Some(PhysFrame::containing_address(PhysAddr::new(phys_addr as u32)));
        }

        None
    }

    /// Allocates `count` physically contiguous 4 KiB frames. Returns the
    /// first frame, or `None` if no run of that length exists.
    pub fn allocate_frames(&mut self, count: usize) -> Option<PhysFrame> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.allocate_frame();
        }

        if self.free_count < count {
            return None;
        }

        // Linear scan tracking consecutive free frames.
        let mut run_start = 0usize;
        let mut run_len = 0usize;

        let mut frame_idx = 0usize;
        while frame_idx < self.total_frames {
            let word_idx = frame_idx / BITS_PER_WORD;
            let word = self.bitmap[word_idx];

            if word == u32::MAX {
                // Entire word allocated, skip it.
                run_len = 0;
                frame_idx = (word_idx + 1) * BITS_PER_WORD;
                run_start = frame_idx;
                continue;
            }

            if word == 0 {
                // Entire word free, extend run by up to 32 frames.
                let extend =
                    core::cmp::min(BITS_PER_WORD, self.total_frames - word_idx * BITS_PER_WORD);
                if run_len == 0 {
                    run_start = word_idx * BITS_PER_WORD;
                }
                run_len += extend;
                if run_len >= count {
                    break;
                }
                frame_idx = (word_idx + 1) * BITS_PER_WORD;
                continue;
            }

            // Partially occupied word: check bit by bit.
            let bit_start = frame_idx % BITS_PER_WORD;
            for bit in bit_start..BITS_PER_WORD {
                let fi = word_idx * BITS_PER_WORD + bit;
                if fi >= self.total_frames {
                    break;
                }
                if word & (1u32 << bit) != 0 {
                    // Allocated: reset run.
                    run_len = 0;
                    run_start = fi + 1;
                } else {
                    if run_len == 0 {
                        run_start = fi;
                    }
                    run_len += 1;
                    if run_len >= count {
                        break;
                    }
                }
            }

            if run_len >= count {
                break;
            }
            frame_idx = (word_idx + 1) * BITS_PER_WORD;
        }

        if run_len < count {
            return None;
        }

        // Mark all frames in the run as allocated.
        for i in 0..count {
            let fi = run_start + i;
            self.bitmap[fi / BITS_PER_WORD] |= 1u32 << (fi % BITS_PER_WORD);
        }
        self.free_count -= count;

        let phys = PhysAddr::new((run_start as u64 * FRAME_SIZE) as u32);
        Some(PhysFrame::containing_address(phys))
    }

    /// Returns a frame to the allocator.
    ///
    /// Misaligned addresses, addresses beyond installed RAM, and frames that
    /// are already free are silently ignored, so corrupted pointers cannot
    /// cascade into bitmap corruption.
    ///
    /// # Safety
    ///
    /// The frame must not be in use anywhere after this call.
    pub unsafe fn free_frame(&mut self, addr: PhysAddr) {
        if !addr.is_aligned(FRAME_SIZE as u32) {
            return;
        }
        let frame_idx = (addr.as_u32() as u64 / FRAME_SIZE) as usize;
        if frame_idx >= self.total_frames {
            return;
        }

        let word_idx = frame_idx / BITS_PER_WORD;
        let bit_idx = frame_idx % BITS_PER_WORD;
        if self.bitmap[word_idx] & (1u32 << bit_idx) == 0 {
            // Already free.
            return;
        }

        self.bitmap[word_idx] &= !(1u32 << bit_idx);
        self.free_count += 1;

        // Keep the hint at or below the lowest free word.
        if word_idx < self.search_hint {
            self.search_hint = word_idx;
        }
    }

    /// Returns `count` contiguous frames starting at `addr`, with the same
    /// tolerance as [`free_frame`](Self::free_frame) per frame.
    ///
    /// # Safety
    ///
    /// None of the frames may be in use anywhere after this call.
    pub unsafe fn free_frames(&mut self, addr: PhysAddr, count: usize) {
        for i in 0..count {
            let frame_addr = addr.as_u32() as u64 + i as u64 * FRAME_SIZE;
            if frame_addr > u32::MAX as u64 {
                break;
            }
            // SAFETY: Forwarded caller guarantee.
            unsafe { self.free_frame(PhysAddr::new(frame_addr as u32)) };
        }
    }

    /// Returns `true` if `addr` is the base of a tracked frame that is
    /// currently free. Misaligned and out-of-range addresses report `false`,
    /// with the same tolerance as [`free_frame`](Self::free_frame).
    pub fn is_free(&self, addr: PhysAddr) -> bool {
        if !addr.is_aligned(FRAME_SIZE as u32) {
            return false;
        }
        let frame_idx = (addr.as_u32() as u64 / FRAME_SIZE) as usize;
        if frame_idx >= self.total_frames {
            return false;
        }
        self.bitmap[frame_idx / BITS_PER_WORD] & (1u32 << (frame_idx % BITS_PER_WORD)) == 0
    }

    /// Returns the number of free frames.
    pub fn free_frames_count(&self) -> usize {
        self.free_count
    }

    /// Returns the total number of RAM-backed frames.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Returns the number of allocated or reserved RAM-backed frames.
    pub fn used_frames(&self) -> usize {
        self.total_frames - self.free_count
    }

    /// Returns the amount of tracked physical memory in bytes.
    pub fn total_memory(&self) -> u64 {
        self.total_frames as u64 * FRAME_SIZE
    }
}

// SAFETY: The bitmap guarantees each frame is handed out at most once until
// freed, and frames are 4 KiB aligned by construction.
unsafe impl FrameAllocator for BitmapAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        BitmapAllocator::allocate_frame(self)
    }
}

// SAFETY: Freed bits are only cleared for tracked frames; tolerant rejection
// of invalid addresses cannot corrupt the bitmap.
unsafe impl FrameDeallocator for BitmapAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        unsafe { self.free_frame(frame.start_address()) };
    }
}
