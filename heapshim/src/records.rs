//! Concrete heap record layouts.
//!
//! Every record is `#[repr(C)]` with the map word first; consumers link
//! against these exact offsets, so field order is part of the contract.
//! Fields holding tagged values are edges for the collector; fields holding
//! [`ForeignRef`]s are strong references into the other engine and are
//! released through [`release_foreign`] when the record dies.

use bitflags::bitflags;

use crate::bridge::{ForeignEngine, ForeignRef};
use crate::map::{Map, MapTag};
use crate::tagged::{Tagged, TAG_MASK, Value, ValueTag};
use crate::visitor::{Visitable, Visitor};

/// Base layout of every allocation: one tagged map word.
#[repr(C)]
pub struct HeapObject {
    map_word: u64,
}

impl HeapObject {
    /// True when this object is itself a Map (its map word carries the
    /// is-a-map tag and points back at the object).
    #[inline]
    pub fn is_map(&self) -> bool {
        self.map_word & TAG_MASK == ValueTag::MapWord as u64
    }

    #[inline]
    pub fn map(&self) -> Tagged<Map> {
        if self.is_map() {
            return Tagged::new(self as *const HeapObject as *mut Map);
        }
        debug_assert_eq!(self.map_word & TAG_MASK, ValueTag::HeapRef as u64);
        // SAFETY: tag checked; only Maps are ever stored in map words
        unsafe { Tagged::from_raw(self.map_word) }
    }

    #[inline]
    pub(crate) fn set_map(&mut self, map: Tagged<Map>) {
        self.map_word = map.address() as u64 | ValueTag::HeapRef as u64;
    }

    #[inline]
    pub(crate) fn set_self_map(&mut self) {
        self.map_word =
            self as *const HeapObject as u64 | ValueTag::MapWord as u64;
    }
}

/// Implemented by every allocatable record type; ties the Rust type to its
/// map tag so the typed allocation path can pick the right Map.
pub trait Record: Visitable {
    const TAG: MapTag;
}

macro_rules! impl_record {
    ($ty:ty, $tag:ident) => {
        impl Record for $ty {
            const TAG: MapTag = MapTag::$tag;
        }
    };
}

/// Wraps one value owned by the other engine, with an inline fast path for
/// plain numbers.
#[repr(C)]
pub struct ValueCell {
    pub base: HeapObject,
    pub foreign: ForeignRef,
    pub number: f64,
}

impl ValueCell {
    /// Take a strong reference on the foreign value and remember it. The
    /// reference is dropped when the cell is collected.
    pub fn assign_foreign(
        &mut self,
        engine: &dyn ForeignEngine,
        value: ForeignRef,
    ) {
        debug_assert!(self.foreign.is_null(), "cell already holds a value");
        engine.protect(value);
        self.foreign = value;
    }
}

impl Visitable for ValueCell {
    fn visit_edges(&self, _visitor: &mut dyn Visitor) {}
}
impl_record!(ValueCell, ValueCell);

/// The only in-heap container: a fixed-length inline array of tagged values.
/// Elements root their targets.
#[repr(C)]
pub struct FixedArray {
    pub base: HeapObject,
    length: u32,
    _pad: u32,
    // `length` Values follow inline
}

impl FixedArray {
    pub fn byte_size(length: usize) -> usize {
        std::mem::size_of::<FixedArray>()
            + length * std::mem::size_of::<Value>()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub(crate) fn set_len(&mut self, length: usize) {
        debug_assert_eq!(self.length, 0);
        self.length = length as u32;
    }

    #[inline]
    fn elements(&self) -> *mut Value {
        // SAFETY: the allocation extends `length` Values past the header
        unsafe { (self as *const FixedArray).add(1) as *mut Value }
    }

    pub fn get(&self, index: usize) -> Value {
        assert!(index < self.len());
        // SAFETY: bounds checked above
        unsafe { *self.elements().add(index) }
    }

    pub fn set(&mut self, index: usize, value: Value) {
        assert!(index < self.len());
        // SAFETY: bounds checked above
        unsafe {
            let elements = (self as *mut FixedArray).add(1) as *mut Value;
            *elements.add(index) = value;
        }
    }
}

impl Visitable for FixedArray {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        for index in 0..self.len() {
            visitor.visit_edge(self.get(index));
        }
    }
}
impl_record!(FixedArray, FixedArray);

/// An execution context paired with its foreign counterpart.
#[repr(C)]
pub struct Context {
    pub base: HeapObject,
    pub foreign_context: ForeignRef,
    pub global: Value,
}

impl Visitable for Context {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit_edge(self.global);
    }
}
impl_record!(Context, Context);

#[repr(C)]
pub struct GlobalContext {
    pub context: Context,
    pub security_token: Value,
}

impl Visitable for GlobalContext {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit_edge(self.context.global);
        visitor.visit_edge(self.security_token);
    }
}
impl_record!(GlobalContext, GlobalContext);

/// A compiled script before it is bound to a context.
#[repr(C)]
pub struct UnboundScript {
    pub base: HeapObject,
    pub foreign_script: ForeignRef,
    pub resource_name: Value,
    pub line_offset: i32,
    pub column_offset: i32,
}

impl Visitable for UnboundScript {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit_edge(self.resource_name);
    }
}
impl_record!(UnboundScript, UnboundScript);

#[repr(C)]
pub struct Script {
    pub base: HeapObject,
    pub unbound: Value,
    pub context: Value,
}

impl Visitable for Script {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit_edge(self.unbound);
        visitor.visit_edge(self.context);
    }
}
impl_record!(Script, Script);

/// Property accessor descriptor: getter/setter live in the foreign engine,
/// name and data are heap values.
#[repr(C)]
pub struct Accessor {
    pub base: HeapObject,
    pub name: Value,
    pub getter: ForeignRef,
    pub setter: ForeignRef,
    pub data: Value,
}

impl Visitable for Accessor {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit_edge(self.name);
        visitor.visit_edge(self.data);
    }
}
impl_record!(Accessor, Accessor);

/// One node of a template's property list.
#[repr(C)]
pub struct TemplateProp {
    pub base: HeapObject,
    pub next: Value,
    pub name: Value,
    pub value: Value,
    pub attributes: u32,
    _pad: u32,
}

impl Visitable for TemplateProp {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit_edge(self.next);
        visitor.visit_edge(self.name);
        visitor.visit_edge(self.value);
    }
}
impl_record!(TemplateProp, TemplateProp);

/// Diagnostic message record; the text itself lives in the foreign engine.
#[repr(C)]
pub struct Message {
    pub base: HeapObject,
    pub text: ForeignRef,
    pub resource_name: Value,
    pub line_number: i32,
    pub start_column: i32,
    pub end_column: i32,
    _pad: i32,
}

impl Visitable for Message {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit_edge(self.resource_name);
    }
}
impl_record!(Message, Message);

/// An unprotected reference to a foreign value; does not keep it alive.
#[repr(C)]
pub struct WeakValue {
    pub base: HeapObject,
    pub foreign: ForeignRef,
}

impl Visitable for WeakValue {
    fn visit_edges(&self, _visitor: &mut dyn Visitor) {}
}
impl_record!(WeakValue, WeakValue);

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct TrackedFlags: u32 {
        const GLOBAL = 1 << 0;
        const FINALIZED = 1 << 1;
        const HAS_ACCESS_PROXIES = 1 << 2;
    }
}

/// Bridge record pairing one heap object with one foreign-engine object.
/// `foreign` is a weak back reference; the wrapper and access proxies are
/// protected while the bridge lives.
#[repr(C)]
pub struct TrackedObject {
    pub base: HeapObject,
    pub foreign: ForeignRef,
    pub wrapper: ForeignRef,
    pub named_proxy: ForeignRef,
    pub indexed_proxy: ForeignRef,
    pub template: Value,
    pub hash: u32,
    pub flags: TrackedFlags,
}

impl TrackedObject {
    pub fn install_wrapper(
        &mut self,
        engine: &dyn ForeignEngine,
        wrapper: ForeignRef,
    ) {
        assert!(self.wrapper.is_null(), "wrapper already installed");
        engine.protect(wrapper);
        self.wrapper = wrapper;
    }

    pub fn install_access_proxies(
        &mut self,
        engine: &dyn ForeignEngine,
        named: ForeignRef,
        indexed: ForeignRef,
    ) {
        assert!(!self.flags.contains(TrackedFlags::HAS_ACCESS_PROXIES));
        engine.protect(named);
        engine.protect(indexed);
        self.named_proxy = named;
        self.indexed_proxy = indexed;
        self.flags.insert(TrackedFlags::HAS_ACCESS_PROXIES);
    }
}

impl Visitable for TrackedObject {
    fn visit_edges(&self, visitor: &mut dyn Visitor) {
        visitor.visit_edge(self.template);
    }
}
impl_record!(TrackedObject, TrackedObject);

/// Byte size of a live object with the given tag; FixedArray is the only
/// variable-length record.
pub(crate) fn object_byte_size(obj: Tagged<HeapObject>, tag: MapTag) -> usize {
    match tag {
        MapTag::FixedArray => {
            // SAFETY: caller guarantees obj is a live FixedArray
            let arr = unsafe { obj.cast::<FixedArray>().as_ref() };
            FixedArray::byte_size(arr.len())
        }
        _ => tag.instance_size(),
    }
}

/// Tag-dispatched edge visit.
pub(crate) fn visit_object(
    obj: Tagged<HeapObject>,
    tag: MapTag,
    visitor: &mut dyn Visitor,
) {
    // SAFETY: caller guarantees obj is live and tagged `tag`
    unsafe {
        match tag {
            MapTag::ValueCell => {
                obj.cast::<ValueCell>().as_ref().visit_edges(visitor)
            }
            MapTag::FixedArray => {
                obj.cast::<FixedArray>().as_ref().visit_edges(visitor)
            }
            MapTag::Context => {
                obj.cast::<Context>().as_ref().visit_edges(visitor)
            }
            MapTag::GlobalContext => {
                obj.cast::<GlobalContext>().as_ref().visit_edges(visitor)
            }
            MapTag::UnboundScript => {
                obj.cast::<UnboundScript>().as_ref().visit_edges(visitor)
            }
            MapTag::Script => {
                obj.cast::<Script>().as_ref().visit_edges(visitor)
            }
            MapTag::Accessor => {
                obj.cast::<Accessor>().as_ref().visit_edges(visitor)
            }
            MapTag::TemplateProp => {
                obj.cast::<TemplateProp>().as_ref().visit_edges(visitor)
            }
            MapTag::Message => {
                obj.cast::<Message>().as_ref().visit_edges(visitor)
            }
            MapTag::WeakValue => {
                obj.cast::<WeakValue>().as_ref().visit_edges(visitor)
            }
            MapTag::TrackedObject => {
                obj.cast::<TrackedObject>().as_ref().visit_edges(visitor)
            }
        }
    }
}

/// Drop a dying record's strong references into the foreign engine. Runs
/// before the record's memory is poisoned and its slots are freed.
pub(crate) fn release_foreign(
    obj: Tagged<HeapObject>,
    tag: MapTag,
    engine: &dyn ForeignEngine,
) {
    #[inline]
    fn drop_ref(engine: &dyn ForeignEngine, slot: &mut ForeignRef) {
        if !slot.is_null() {
            engine.unprotect(*slot);
            *slot = ForeignRef::NULL;
        }
    }

    // SAFETY: caller guarantees obj is live and tagged `tag`
    unsafe {
        match tag {
            MapTag::ValueCell => {
                drop_ref(engine, &mut obj.cast::<ValueCell>().as_mut().foreign)
            }
            MapTag::Context => drop_ref(
                engine,
                &mut obj.cast::<Context>().as_mut().foreign_context,
            ),
            MapTag::GlobalContext => drop_ref(
                engine,
                &mut obj.cast::<GlobalContext>().as_mut().context.foreign_context,
            ),
            MapTag::UnboundScript => drop_ref(
                engine,
                &mut obj.cast::<UnboundScript>().as_mut().foreign_script,
            ),
            MapTag::Accessor => {
                let acc = obj.cast::<Accessor>().as_mut();
                drop_ref(engine, &mut acc.getter);
                drop_ref(engine, &mut acc.setter);
            }
            MapTag::Message => {
                drop_ref(engine, &mut obj.cast::<Message>().as_mut().text)
            }
            MapTag::TrackedObject => {
                // the back reference in `foreign` is weak by design
                let tracked = obj.cast::<TrackedObject>().as_mut();
                drop_ref(engine, &mut tracked.wrapper);
                drop_ref(engine, &mut tracked.named_proxy);
                drop_ref(engine, &mut tracked.indexed_proxy);
            }
            MapTag::FixedArray
            | MapTag::Script
            | MapTag::TemplateProp
            | MapTag::WeakValue => {}
        }
    }
}
