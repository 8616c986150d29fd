//! A slot-based heap emulation layer.
//!
//! Code written against one engine's object model (maps at offset 0, handle
//! scopes, a reconciling garbage collector) runs here while the values it
//! manipulates are actually owned by a different scripting engine. One heap
//! belongs to exactly one isolate, and one isolate to exactly one owning
//! thread; everything else goes through the marshalling queue.

mod bitmap;
mod bridge;
mod chunk;
mod gc;
mod handles;
mod heap;
mod isolate;
mod map;
mod marshal;
mod records;
mod system;
mod tagged;
mod visitor;

pub use bridge::{
    BridgeToken, ForeignEngine, ForeignRef, NullEngine, associate_with_foreign,
    foreign_object_finalized, get_private_instance, make_private_instance,
};
pub use chunk::{
    BITMAP_WORDS, CHUNK_SIZE, RESERVED_SLOTS, SLOT_SIZE, SLOTS_PER_BLOCK,
    SLOTS_PER_CHUNK, Chunk,
};
pub use gc::Phase;
pub use handles::{HandleScope, PersistentId, PersistentTable};
pub use heap::{CollectionPass, Finalizer, Heap, HeapStatistics};
pub use isolate::{Isolate, MapRegistry};
pub use map::{MAP_TAG_COUNT, Map, MapTag};
pub use marshal::{Task, TaskQueue, Waker};
pub use records::{
    Accessor, Context, FixedArray, GlobalContext, HeapObject, Message,
    Record, Script, TemplateProp, TrackedFlags, TrackedObject, UnboundScript,
    ValueCell, WeakValue,
};
pub use tagged::{Tagged, Value};
pub use visitor::{Visitable, Visitor};
