//! The isolate: one heap, one owning thread, one foreign engine.
//!
//! A process-global registry maps isolate ids to their task queues so that
//! foreign finalizers arriving after teardown can be recognized as stale
//! instead of dereferencing freed state.

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use log::debug;
use parking_lot::RwLock;

use crate::bridge::ForeignEngine;
use crate::gc::Phase;
use crate::handles::{PersistentId, PersistentTable};
use crate::heap::{Finalizer, Heap, HeapStatistics};
use crate::map::{MAP_TAG_COUNT, Map, MapTag};
use crate::marshal::TaskQueue;
use crate::records::{FixedArray, Record, TemplateProp};
use crate::tagged::{Tagged, Value};

static NEXT_ISOLATE_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static RwLock<AHashMap<u64, Arc<TaskQueue>>> {
    static REGISTRY: OnceLock<RwLock<AHashMap<u64, Arc<TaskQueue>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(AHashMap::new()))
}

/// Task queue of a live isolate, or None once it has been torn down.
pub(crate) fn queue_for(isolate_id: u64) -> Option<Arc<TaskQueue>> {
    registry().read().get(&isolate_id).cloned()
}

/// One Map per record type, bootstrapped before anything else is allocated.
pub struct MapRegistry {
    maps: [Tagged<Map>; MAP_TAG_COUNT],
}

impl MapRegistry {
    fn bootstrap(heap: &mut Heap) -> Self {
        Self {
            maps: MapTag::ALL.map(|tag| Map::bootstrap(heap, tag)),
        }
    }

    #[inline]
    pub fn of(&self, tag: MapTag) -> Tagged<Map> {
        self.maps[tag as usize]
    }
}

pub struct Isolate {
    id: u64,
    pub(crate) heap: Heap,
    maps: MapRegistry,
    pub(crate) scopes: Vec<Vec<Value>>,
    pub(crate) persistents: PersistentTable,
    pub(crate) phase: Phase,
    pub(crate) pending_gc: bool,
    pub(crate) queue: Arc<TaskQueue>,
}

impl Isolate {
    /// Create an isolate owned by the calling thread. Boxed so handle scopes
    /// can keep a stable pointer to it.
    pub fn new(engine: Arc<dyn ForeignEngine>) -> Box<Isolate> {
        let id = NEXT_ISOLATE_ID.fetch_add(1, Ordering::Relaxed);
        let mut heap = Heap::new(id, engine);
        let maps = MapRegistry::bootstrap(&mut heap);
        let queue = TaskQueue::new();
        registry().write().insert(id, Arc::clone(&queue));
        debug!("isolate {id} created");
        Box::new(Isolate {
            id,
            heap,
            maps,
            scopes: Vec::new(),
            persistents: PersistentTable::new(),
            phase: Phase::Idle,
            pending_gc: false,
            queue,
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    #[inline]
    pub fn maps(&self) -> &MapRegistry {
        &self.maps
    }

    pub fn engine(&self) -> Arc<dyn ForeignEngine> {
        self.heap.engine_arc()
    }

    pub fn queue_handle(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.queue)
    }

    pub fn statistics(&self) -> HeapStatistics {
        self.heap.statistics()
    }

    /// Allocate a fixed-layout record of type `T`, zeroed.
    pub fn alloc<T: Record>(&mut self) -> Tagged<T> {
        let map = self.maps.of(T::TAG);
        let obj = self.heap.alloc(Some(map), 0);
        // SAFETY: allocated with T's map and zeroed
        unsafe { obj.cast() }
    }

    /// Prepend one property descriptor to a template's property list and
    /// return the new head. `head` is the current list head or a Smi zero
    /// for an empty list.
    pub fn push_template_prop(
        &mut self,
        head: Value,
        name: Value,
        value: Value,
        attributes: u32,
    ) -> Tagged<TemplateProp> {
        let prop = self.alloc::<TemplateProp>();
        // SAFETY: just allocated, no aliases
        let p = unsafe { prop.as_mut() };
        p.next = head;
        p.name = name;
        p.value = value;
        p.attributes = attributes;
        prop
    }

    pub fn alloc_array(&mut self, length: usize) -> Tagged<FixedArray> {
        let map = self.maps.of(MapTag::FixedArray);
        let obj = self.heap.alloc(Some(map), FixedArray::byte_size(length));
        // SAFETY: allocated with the FixedArray map and sized for `length`
        let arr: Tagged<FixedArray> = unsafe { obj.cast() };
        // SAFETY: freshly allocated, no aliases
        unsafe { arr.as_mut() }.set_len(length);
        arr
    }

    // -- handle scopes ----------------------------------------------------

    pub(crate) fn push_scope(&mut self) -> usize {
        self.scopes.push(Vec::new());
        self.scopes.len()
    }

    pub(crate) fn add_local(&mut self, depth: usize, value: Value) -> Value {
        assert_eq!(
            depth,
            self.scopes.len(),
            "locals go into the innermost scope"
        );
        match self.scopes.last_mut() {
            Some(scope) => scope.push(value),
            None => unreachable!("depth check guarantees an open scope"),
        }
        value
    }

    pub(crate) fn pop_scope(&mut self, depth: usize) {
        assert_eq!(
            depth,
            self.scopes.len(),
            "handle scopes must drop in stack order"
        );
        self.scopes.pop();
    }

    // -- persistent handles -----------------------------------------------

    pub fn make_persistent(&mut self, value: Value) -> PersistentId {
        self.persistents.insert(value)
    }

    pub fn persistent_value(&self, id: PersistentId) -> Option<Value> {
        self.persistents.get(id)
    }

    pub fn release_persistent(&mut self, id: PersistentId) {
        self.persistents.remove(id);
    }

    /// Weaken a persistent: the target is collectable, and `finalizer` (if
    /// any) runs after the pass that frees it.
    pub fn make_weak(&mut self, id: PersistentId, finalizer: Option<Finalizer>) {
        self.persistents.make_weak(id, finalizer);
    }

    pub(crate) fn set_pending_gc(&mut self) {
        self.pending_gc = true;
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        // unregister first so in-flight foreign finalizers see "gone"
        registry().write().remove(&self.id);
        assert!(self.scopes.is_empty(), "isolate dropped with open scopes");
        self.heap.tear_down();
        debug!("isolate {} torn down", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NullEngine;
    use crate::handles::HandleScope;
    use crate::records::ValueCell;

    #[test]
    fn isolates_get_distinct_registered_ids() {
        let a = Isolate::new(Arc::new(NullEngine));
        let b = Isolate::new(Arc::new(NullEngine));
        assert_ne!(a.id(), b.id());
        assert!(queue_for(a.id()).is_some());
        assert!(queue_for(b.id()).is_some());
        let a_id = a.id();
        drop(a);
        assert!(queue_for(a_id).is_none());
        assert!(queue_for(b.id()).is_some());
    }

    #[test]
    fn typed_allocation_picks_the_right_map() {
        let mut iso = Isolate::new(Arc::new(NullEngine));
        let cell = iso.alloc::<ValueCell>();
        // SAFETY: just allocated
        let header = unsafe { cell.erase().as_ref() };
        assert_eq!(
            header.map().address(),
            iso.maps().of(MapTag::ValueCell).address()
        );
    }

    #[test]
    fn arrays_get_their_length_written() {
        let mut iso = Isolate::new(Arc::new(NullEngine));
        let arr = iso.alloc_array(12);
        // SAFETY: just allocated
        let arr_ref = unsafe { arr.as_ref() };
        assert_eq!(arr_ref.len(), 12);
        for index in 0..12 {
            assert_eq!(arr_ref.get(index), Value::from_smi(0));
        }
    }

    #[test]
    fn scopes_enforce_stack_order() {
        let mut iso = Isolate::new(Arc::new(NullEngine));
        {
            let mut outer = HandleScope::new(&mut iso);
            outer.local(Value::from_smi(1));
            {
                let mut inner = HandleScope::new(&mut iso);
                inner.local(Value::from_smi(2));
                assert_eq!(iso.scopes.len(), 2);
            }
            assert_eq!(iso.scopes.len(), 1);
        }
        assert!(iso.scopes.is_empty());
    }

}
