//! Fixed-size, fixed-alignment heap chunks.
//!
//! A chunk is a 512 KiB region aligned to its own size, subdivided into
//! 32-byte slots. The header (links, scan hints, bitmap) lives in the first
//! 128 slots, which are pre-marked used so the scanner never hands them out.
//! Alignment is what makes `Chunk::containing` work: any interior pointer
//! masks down to its chunk header.

use std::ptr::NonNull;

use crate::bitmap::{self, RUN_CLASSES};

pub const CHUNK_SIZE: usize = 512 * 1024;
pub const SLOT_SIZE: usize = 32;
pub const SLOT_SIZE_LOG: usize = 5;
pub const SLOTS_PER_CHUNK: usize = CHUNK_SIZE / SLOT_SIZE;
pub const SLOTS_PER_BLOCK: usize = 64;
pub const BITMAP_WORDS: usize = SLOTS_PER_CHUNK / 64;
pub const RESERVED_SLOTS: usize = 128;
const RESERVED_WORDS: usize = RESERVED_SLOTS / 64;
const TOP_WORD: u16 = (BITMAP_WORDS - 1) as u16;

#[repr(C)]
pub struct Chunk {
    pub prev: *mut Chunk,
    pub next: *mut Chunk,
    pub isolate_id: u64,
    // last successful word index per run class, scanned downward with one wrap
    small_hints: [u16; RUN_CLASSES],
    large_hint: u16,
    bitmap: [u64; BITMAP_WORDS],
}

const _: () = assert!(std::mem::size_of::<Chunk>() <= RESERVED_SLOTS * SLOT_SIZE);

impl Chunk {
    /// Turn a fresh aligned mapping into a chunk. The mapping is zeroed by
    /// the OS, so only the non-zero header fields need writing.
    ///
    /// # Safety
    /// `base` must be a `CHUNK_SIZE`-aligned mapping of `CHUNK_SIZE` bytes
    /// not yet used as a chunk.
    pub unsafe fn init(base: NonNull<u8>, isolate_id: u64) -> *mut Chunk {
        debug_assert_eq!(base.as_ptr() as usize % CHUNK_SIZE, 0);
        let chunk = base.as_ptr().cast::<Chunk>();
        // SAFETY: base points at a writable CHUNK_SIZE region
        unsafe {
            (*chunk).prev = std::ptr::null_mut();
            (*chunk).next = std::ptr::null_mut();
            (*chunk).isolate_id = isolate_id;
            for word in 0..RESERVED_WORDS {
                (*chunk).bitmap[word] = !0;
            }
            (*chunk).reset_hints();
        }
        chunk
    }

    /// Chunk header of whatever chunk `addr` points into.
    #[inline]
    pub fn containing(addr: usize) -> *mut Chunk {
        (addr & !(CHUNK_SIZE - 1)) as *mut Chunk
    }

    #[inline]
    pub fn base(&self) -> usize {
        self as *const Chunk as usize
    }

    #[inline]
    pub fn slot_address(&self, slot: usize) -> usize {
        debug_assert!(slot < SLOTS_PER_CHUNK);
        self.base() + (slot << SLOT_SIZE_LOG)
    }

    #[inline]
    pub fn slot_of(&self, addr: usize) -> usize {
        debug_assert_eq!(Chunk::containing(addr) as usize, self.base());
        (addr - self.base()) >> SLOT_SIZE_LOG
    }

    pub fn reset_hints(&mut self) {
        self.small_hints = [TOP_WORD; RUN_CLASSES];
        self.large_hint = TOP_WORD;
    }

    /// Find and mark `slots` (a power of two <= 64) contiguous free slots.
    /// Scans downward from the class hint, wrapping once past the header
    /// words. Returns the slot index.
    pub fn alloc_small(&mut self, slots: usize) -> Option<usize> {
        let class = bitmap::class_index(slots);
        let mut word = self.small_hints[class] as usize;
        for _ in 0..BITMAP_WORDS - RESERVED_WORDS {
            if let Some(pos) = bitmap::find_run(self.bitmap[word], slots) {
                self.bitmap[word] |= bitmap::run_mask(pos, slots);
                self.small_hints[class] = word as u16;
                return Some(word * 64 + pos as usize);
            }
            word = if word == RESERVED_WORDS {
                TOP_WORD as usize
            } else {
                word - 1
            };
        }
        None
    }

    /// Find and mark `blocks` contiguous fully-free 64-slot blocks for the
    /// large-object path. Returns the slot index of the first block.
    pub fn alloc_blocks(&mut self, blocks: usize) -> Option<usize> {
        debug_assert!(blocks >= 1);
        if blocks > BITMAP_WORDS - RESERVED_WORDS {
            return None;
        }
        let mut word = self.large_hint as usize;
        for _ in 0..BITMAP_WORDS - RESERVED_WORDS {
            if word + blocks <= BITMAP_WORDS
                && self.bitmap[word..word + blocks].iter().all(|&w| w == 0)
            {
                for w in &mut self.bitmap[word..word + blocks] {
                    *w = !0;
                }
                self.large_hint = word as u16;
                return Some(word * 64);
            }
            word = if word == RESERVED_WORDS {
                TOP_WORD as usize
            } else {
                word - 1
            };
        }
        None
    }

    /// Clear a previously marked slot range. The bits must all be set.
    pub fn free_range(&mut self, slot: usize, slots: usize) {
        debug_assert!(slot >= RESERVED_SLOTS);
        debug_assert!(slot + slots <= SLOTS_PER_CHUNK);
        let mut remaining = slots;
        let mut word = slot / 64;
        let mut pos = (slot % 64) as u32;
        while remaining > 0 {
            let in_word = remaining.min(64 - pos as usize);
            let mask = partial_mask(pos, in_word);
            assert_eq!(
                self.bitmap[word] & mask,
                mask,
                "freeing slots that were not allocated"
            );
            self.bitmap[word] &= !mask;
            remaining -= in_word;
            word += 1;
            pos = 0;
        }
    }

    #[inline]
    pub fn is_slot_used(&self, slot: usize) -> bool {
        self.bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Used slots outside the reserved header.
    pub fn in_use_application_slots(&self) -> usize {
        self.bitmap[RESERVED_WORDS..]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.in_use_application_slots() == 0
    }
}

#[inline]
fn partial_mask(pos: u32, len: usize) -> u64 {
    debug_assert!(pos as usize + len <= 64);
    if len == 64 { !0 } else { ((1u64 << len) - 1) << pos }
}
