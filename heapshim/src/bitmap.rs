//! Free-run lookup inside a single bitmap word.
//!
//! One bit per slot, set means used. Every reserve size is a power of two
//! between 1 and 64 slots, so a run never straddles a word boundary and the
//! whole search is a handful of shift-and-mask steps per word.

pub const RUN_CLASSES: usize = 7;

/// Size-class index for a power-of-two run length (1 -> 0, 64 -> 6).
#[inline]
pub fn class_index(slots: usize) -> usize {
    debug_assert!(slots.is_power_of_two() && slots <= 64);
    slots.trailing_zeros() as usize
}

/// Collapse free bits so that bit i survives iff a run of `1 << log` free
/// bits starts at i.
#[inline]
fn collapse(mut free: u64, log: u32) -> u64 {
    let mut shift = 1u32;
    for _ in 0..log {
        free &= free >> shift;
        shift <<= 1;
    }
    free
}

/// First position in `used` where `slots` consecutive free bits start, or
/// None if the word has no such run. `slots` must be a power of two <= 64.
#[inline]
pub fn find_run(used: u64, slots: usize) -> Option<u32> {
    let starts = collapse(!used, class_index(slots) as u32);
    if starts == 0 {
        return None;
    }
    Some(starts.trailing_zeros())
}

/// Mask covering `slots` bits starting at `pos` within one word.
#[inline]
pub fn run_mask(pos: u32, slots: usize) -> u64 {
    debug_assert!(pos as usize + slots <= 64);
    if slots == 64 { !0 } else { ((1u64 << slots) - 1) << pos }
}
