//! Value: a tagged word, either an inline small integer or a heap reference.
//!
//! Tagged<T>: same layout as Value but typed, for the Rust side of the record
//! API. Not GC safe on its own; keep it rooted through a handle scope or a
//! persistent slot across anything that can collect.

use std::fmt;
use std::marker::PhantomData;

use crate::records::HeapObject;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueTag {
    Smi = 0b0,
    HeapRef = 0b01,
    /// Only appears in the map word of a Map itself. The extra bit is the
    /// "is-a-map" marker checked before any map dereference.
    MapWord = 0b11,
}

pub const TAG_MASK: u64 = 0b11;

/// A generic tagged value.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(u64);

/// A typed reference into the heap, same layout as Value.
pub struct Tagged<T> {
    data: u64,
    _marker: PhantomData<*mut T>,
}

// manual impl: a Tagged prints as its address, T need not be Debug
impl<T> fmt::Debug for Tagged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tagged({:#x})", self.data)
    }
}

// SAFETY: plain words; aliasing discipline is handled by the heap owner
unsafe impl Send for Value {}
// SAFETY: see above
unsafe impl Sync for Value {}

// a Tagged is a pointer-like word, not an owned T
impl<T> Clone for Tagged<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Tagged<T> {}

impl<T> PartialEq for Tagged<T> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}
impl<T> Eq for Tagged<T> {}

impl Value {
    #[inline]
    pub fn zero() -> Self {
        Self::from_smi(0)
    }

    #[inline]
    pub fn from_smi(value: i64) -> Self {
        Self((value as u64) << 1)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_smi(self) -> bool {
        self.0 & 0b1 == 0
    }

    #[inline]
    pub fn smi_value(self) -> i64 {
        debug_assert!(self.is_smi());
        // arithmetic shift to bring the sign back down
        (self.0 as i64) >> 1
    }

    #[inline]
    pub fn is_heap_ref(self) -> bool {
        self.0 & TAG_MASK == ValueTag::HeapRef as u64
    }

    /// Untagged address of the referenced heap object.
    #[inline]
    pub fn address(self) -> usize {
        debug_assert!(self.is_heap_ref());
        (self.0 & !TAG_MASK) as usize
    }

    pub fn as_tagged<T>(self) -> Option<Tagged<T>> {
        if self.is_heap_ref() {
            // SAFETY: tag checked; the type is the caller's claim
            return Some(unsafe { Tagged::from_raw(self.0) });
        }
        None
    }

    /// # Safety
    /// The value must be a heap reference to a `T`.
    pub unsafe fn as_tagged_unchecked<T>(self) -> Tagged<T> {
        // SAFETY: by contract
        unsafe { Tagged::from_raw(self.0) }
    }
}

impl<T> Tagged<T> {
    #[inline]
    pub(crate) const unsafe fn from_raw(data: u64) -> Self {
        Self {
            data,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn new(ptr: *mut T) -> Self {
        let addr = ptr as u64;
        debug_assert_eq!(
            addr & TAG_MASK,
            0,
            "heap pointers are slot aligned, low bits must be free"
        );
        // SAFETY: tag just applied
        unsafe { Self::from_raw(addr | ValueTag::HeapRef as u64) }
    }

    #[inline]
    pub fn as_value(self) -> Value {
        Value(self.data)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut T {
        (self.data & !TAG_MASK) as *mut T
    }

    #[inline]
    pub fn address(self) -> usize {
        (self.data & !TAG_MASK) as usize
    }

    /// # Safety
    /// The referenced object must be live; the collector must not run for the
    /// lifetime of the returned reference.
    #[inline]
    pub unsafe fn as_ref<'a>(self) -> &'a T {
        debug_assert_ne!(self.data & TAG_MASK, 0, "not a heap reference");
        // SAFETY: by contract
        unsafe { &*self.as_ptr() }
    }

    /// # Safety
    /// Same as [`Tagged::as_ref`], plus the usual exclusive-access rules.
    #[inline]
    pub unsafe fn as_mut<'a>(self) -> &'a mut T {
        debug_assert_ne!(self.data & TAG_MASK, 0, "not a heap reference");
        // SAFETY: by contract
        unsafe { &mut *self.as_ptr() }
    }

    /// Cast to a different record type.
    /// # Safety
    /// T and U must share a layout prefix at the same offsets.
    #[inline]
    pub unsafe fn cast<U>(self) -> Tagged<U> {
        // SAFETY: by contract
        unsafe { Tagged::from_raw(self.data) }
    }

    #[inline]
    pub fn erase(self) -> Tagged<HeapObject> {
        // SAFETY: every record starts with a HeapObject
        unsafe { self.cast() }
    }
}

impl<T> From<Tagged<T>> for Value {
    fn from(value: Tagged<T>) -> Self {
        value.as_value()
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::from_smi(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Dummy {
        a: u64,
        b: u64,
    }

    fn slot_aligned_box() -> Box<[Dummy; 4]> {
        // Box allocations of 16-byte types are at least 8-aligned which is
        // enough for the 2 tag bits.
        Box::new([
            Dummy { a: 0, b: 0 },
            Dummy { a: 1, b: 1 },
            Dummy { a: 2, b: 2 },
            Dummy { a: 3, b: 3 },
        ])
    }

    #[test]
    fn smi_roundtrip_and_tag_detection() {
        for v in [0i64, 1, -1, 42, -1 << 40, (1 << 40) - 7] {
            let val = Value::from_smi(v);
            assert!(val.is_smi());
            assert!(!val.is_heap_ref());
            assert_eq!(val.smi_value(), v);
        }
    }

    #[test]
    fn heap_ref_roundtrip() {
        let mut mem = slot_aligned_box();
        let ptr: *mut Dummy = &mut mem[0];
        let tagged = Tagged::new(ptr);
        let value = tagged.as_value();

        assert!(value.is_heap_ref());
        assert!(!value.is_smi());
        assert_eq!(value.address(), ptr as usize);

        let back = value.as_tagged::<Dummy>().expect("heap ref");
        assert_eq!(back.as_ptr(), ptr);
    }

    #[test]
    fn smi_is_not_a_tagged_ref() {
        assert!(Value::from_smi(99).as_tagged::<Dummy>().is_none());
    }

    #[test]
    fn tagged_mutation_through_as_mut() {
        let mut mem = slot_aligned_box();
        let tagged = Tagged::new(&mut mem[1] as *mut Dummy);
        // SAFETY: backing storage outlives the access, no collector here
        unsafe {
            tagged.as_mut().a = 77;
        }
        assert_eq!(mem[1].a, 77);
    }

    #[test]
    fn tagged_refs_to_plain_types_are_debuggable() {
        struct Opaque(#[allow(dead_code)] u64);
        let mut mem = Opaque(0);
        let tagged = Tagged::new(&mut mem as *mut Opaque);
        // Opaque has no Debug impl; comparing in assert_eq must still format
        assert_eq!(tagged, tagged);
        let printed = format!("{tagged:?}");
        assert!(printed.starts_with("Tagged(0x"));
    }

    #[test]
    fn cast_preserves_address() {
        let mut mem = slot_aligned_box();
        let tagged = Tagged::new(&mut mem[2] as *mut Dummy);
        // SAFETY: cast back and forth only
        let erased: Tagged<u64> = unsafe { tagged.cast() };
        assert_eq!(erased.address(), tagged.address());
    }
}
