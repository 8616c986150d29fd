//! Heap-resident type descriptors.
//!
//! Every heap object's first word references its Map; a Map's own map word
//! references itself and carries the distinguished is-a-map tag bit, which is
//! what the collector checks before treating anything as a Map. Maps are
//! created once per record type at isolate setup and never collected.

use std::mem::size_of;

use crate::heap::Heap;
use crate::records::{
    Accessor, Context, GlobalContext, HeapObject, Message, Script,
    TemplateProp, TrackedObject, UnboundScript, ValueCell, WeakValue,
};
use crate::tagged::Tagged;

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapTag {
    ValueCell = 0,
    FixedArray,
    Context,
    GlobalContext,
    UnboundScript,
    Script,
    Accessor,
    TemplateProp,
    Message,
    WeakValue,
    TrackedObject,
}

pub const MAP_TAG_COUNT: usize = 11;

impl MapTag {
    pub const ALL: [MapTag; MAP_TAG_COUNT] = [
        MapTag::ValueCell,
        MapTag::FixedArray,
        MapTag::Context,
        MapTag::GlobalContext,
        MapTag::UnboundScript,
        MapTag::Script,
        MapTag::Accessor,
        MapTag::TemplateProp,
        MapTag::Message,
        MapTag::WeakValue,
        MapTag::TrackedObject,
    ];

    /// Declared byte size of an instance; 0 means variable length and the
    /// allocation site must supply the size.
    pub fn instance_size(self) -> usize {
        match self {
            MapTag::ValueCell => size_of::<ValueCell>(),
            MapTag::FixedArray => 0,
            MapTag::Context => size_of::<Context>(),
            MapTag::GlobalContext => size_of::<GlobalContext>(),
            MapTag::UnboundScript => size_of::<UnboundScript>(),
            MapTag::Script => size_of::<Script>(),
            MapTag::Accessor => size_of::<Accessor>(),
            MapTag::TemplateProp => size_of::<TemplateProp>(),
            MapTag::Message => size_of::<Message>(),
            MapTag::WeakValue => size_of::<WeakValue>(),
            MapTag::TrackedObject => size_of::<TrackedObject>(),
        }
    }
}

#[repr(C)]
pub struct Map {
    pub base: HeapObject,
    tag: MapTag,
    instance_size: u32,
}

impl Map {
    /// Allocate the Map for one record type. Passing no map to the allocator
    /// makes the new object its own map.
    pub(crate) fn bootstrap(heap: &mut Heap, tag: MapTag) -> Tagged<Map> {
        let obj = heap.alloc(None, size_of::<Map>());
        // SAFETY: fresh allocation of Map size, map word already self-tagged
        let map: Tagged<Map> = unsafe { obj.cast() };
        // SAFETY: no other reference exists yet
        let m = unsafe { map.as_mut() };
        m.tag = tag;
        m.instance_size = tag.instance_size() as u32;
        map
    }

    #[inline]
    pub fn tag(&self) -> MapTag {
        self.tag
    }

    #[inline]
    pub fn instance_size(&self) -> usize {
        self.instance_size as usize
    }
}
