//! The slot allocator and the deallocation cascade.
//!
//! A heap is a linked list of aligned chunks owned by one isolate. Small
//! requests (up to 64 slots) are served by the bitmap transforms, larger ones
//! take whole 64-slot blocks. Allocation never fails: when no chunk has room
//! a new one is mapped, and an OS-level mapping failure is fatal.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use log::{debug, trace};

use crate::bridge::ForeignEngine;
use crate::chunk::{
    CHUNK_SIZE, Chunk, RESERVED_SLOTS, SLOT_SIZE, SLOTS_PER_BLOCK,
    SLOTS_PER_CHUNK,
};
use crate::handles::PersistentId;
use crate::map::Map;
use crate::records::{self, HeapObject};
use crate::system;
use crate::tagged::{Tagged, Value};
use crate::visitor::EdgeCollector;

/// Second-pass weak callback, delivered after the sweep so it may allocate.
pub type Finalizer = Box<dyn FnOnce(&mut crate::isolate::Isolate)>;

const POISON: u8 = 0xEE;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapStatistics {
    pub allocated_bytes: usize,
    pub chunk_count: usize,
    pub used_slots: usize,
}

/// Transient state of one collection pass. The deallocated set is the
/// double-free guard: a destructor cascading into an object already torn
/// down in this pass turns the second teardown into a no-op.
pub struct CollectionPass {
    pub(crate) reachable: AHashMap<usize, usize>,
    pub(crate) weak: AHashMap<usize, Vec<PersistentId>>,
    pub(crate) dead_weak: Vec<PersistentId>,
    pub(crate) allocated: Vec<usize>,
    pub(crate) deallocated: AHashSet<usize>,
}

impl CollectionPass {
    pub fn new() -> Self {
        Self {
            reachable: AHashMap::new(),
            weak: AHashMap::new(),
            dead_weak: Vec::new(),
            allocated: Vec::new(),
            deallocated: AHashSet::new(),
        }
    }

    /// Count one more independent root for `value`.
    pub(crate) fn bump(&mut self, value: Value) {
        if value.is_heap_ref() {
            *self.reachable.entry(value.address()).or_insert(0) += 1;
        }
    }

    fn note_near_death(&mut self, addr: usize) {
        if let Some(ids) = self.weak.remove(&addr) {
            self.dead_weak.extend(ids);
        }
    }
}

impl Default for CollectionPass {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Heap {
    isolate_id: u64,
    chunks: *mut Chunk,
    chunk_count: usize,
    allocated_bytes: usize,
    engine: Arc<dyn ForeignEngine>,
}

// SAFETY: the owning isolate serializes all access; raw chunk pointers are
// never handed across threads
unsafe impl Send for Heap {}

/// Slots actually marked for an allocation of `size` bytes: the next power
/// of two up to one block, whole blocks beyond that.
fn reserved_slots_for(size: usize) -> usize {
    debug_assert!(size > 0);
    let slots = size.div_ceil(SLOT_SIZE);
    if slots <= SLOTS_PER_BLOCK {
        slots.next_power_of_two()
    } else {
        size.div_ceil(SLOTS_PER_BLOCK * SLOT_SIZE) * SLOTS_PER_BLOCK
    }
}

impl Heap {
    pub(crate) fn new(isolate_id: u64, engine: Arc<dyn ForeignEngine>) -> Self {
        Self {
            isolate_id,
            chunks: ptr::null_mut(),
            chunk_count: 0,
            allocated_bytes: 0,
            engine,
        }
    }

    pub fn engine(&self) -> &dyn ForeignEngine {
        &*self.engine
    }

    pub(crate) fn engine_arc(&self) -> Arc<dyn ForeignEngine> {
        Arc::clone(&self.engine)
    }

    /// Allocate a zeroed object and write its map word. A zero `size_hint`
    /// means "use the map's declared instance size"; passing no map means
    /// the allocation is itself a Map and becomes its own map.
    pub fn alloc(
        &mut self,
        map: Option<Tagged<Map>>,
        size_hint: usize,
    ) -> Tagged<HeapObject> {
        let size = match (map, size_hint) {
            (_, n) if n > 0 => n,
            // SAFETY: maps live as long as the heap
            (Some(m), _) => unsafe { m.as_ref() }.instance_size(),
            (None, _) => std::mem::size_of::<Map>(),
        };
        assert!(size > 0, "variable-length type needs an explicit size");
        let slots = reserved_slots_for(size);
        assert!(
            slots <= SLOTS_PER_CHUNK - RESERVED_SLOTS,
            "allocation of {size} bytes exceeds chunk capacity"
        );

        let addr = match self.find_slots(slots) {
            Some(addr) => addr,
            None => {
                let chunk = self.grow();
                match Self::claim(chunk, slots) {
                    Some(slot) => chunk.slot_address(slot),
                    None => unreachable!("fresh chunk cannot be full"),
                }
            }
        };

        // SAFETY: the claimed slot range is inside a live mapping
        unsafe { ptr::write_bytes(addr as *mut u8, 0, slots * SLOT_SIZE) };
        let obj = Tagged::new(addr as *mut HeapObject);
        // SAFETY: fresh exclusive allocation
        let header = unsafe { obj.as_mut() };
        match map {
            Some(m) => header.set_map(m),
            None => header.set_self_map(),
        }
        self.allocated_bytes += slots * SLOT_SIZE;
        trace!("alloc {size}B ({slots} slots) at {addr:#x}");
        obj
    }

    fn claim(chunk: &mut Chunk, slots: usize) -> Option<usize> {
        if slots <= SLOTS_PER_BLOCK {
            chunk.alloc_small(slots)
        } else {
            chunk.alloc_blocks(slots / SLOTS_PER_BLOCK)
        }
    }

    fn find_slots(&mut self, slots: usize) -> Option<usize> {
        let mut cursor = self.chunks;
        while !cursor.is_null() {
            // SAFETY: chunk list nodes stay mapped while linked
            let chunk = unsafe { &mut *cursor };
            if let Some(slot) = Self::claim(chunk, slots) {
                return Some(chunk.slot_address(slot));
            }
            cursor = chunk.next;
        }
        None
    }

    fn grow(&mut self) -> &mut Chunk {
        let base = match system::map_aligned(CHUNK_SIZE) {
            Some(base) => base,
            None => panic!("out of memory mapping a heap chunk"),
        };
        // SAFETY: fresh aligned mapping
        let chunk = unsafe { Chunk::init(base, self.isolate_id) };
        // SAFETY: linking a node we exclusively own
        unsafe {
            (*chunk).next = self.chunks;
            if !self.chunks.is_null() {
                (*self.chunks).prev = chunk;
            }
        }
        self.chunks = chunk;
        self.chunk_count += 1;
        debug!(
            "isolate {} mapped chunk {} at {:#x}",
            self.isolate_id, self.chunk_count, chunk as usize
        );
        // SAFETY: just created above
        unsafe { &mut *chunk }
    }

    /// Tear down one object: drop its foreign references, poison and free its
    /// slots, then release everything it pointed at. Returns the total bytes
    /// freed including the cascade. A repeat call within the same pass is a
    /// no-op returning 0.
    pub fn deallocate(
        &mut self,
        pass: &mut CollectionPass,
        obj: Tagged<HeapObject>,
    ) -> usize {
        let addr = obj.address();
        if !pass.deallocated.insert(addr) {
            return 0;
        }
        pass.note_near_death(addr);

        // SAFETY: object is live until poisoned below
        let header = unsafe { obj.as_ref() };
        assert!(!header.is_map(), "maps are torn down with their chunk");
        // SAFETY: map words only ever hold Maps
        let tag = unsafe { header.map().as_ref() }.tag();
        let size = records::object_byte_size(obj, tag);

        let mut edges = EdgeCollector::default();
        records::visit_object(obj, tag, &mut edges);
        let engine = self.engine_arc();
        records::release_foreign(obj, tag, &*engine);

        let slots = reserved_slots_for(size);
        // SAFETY: the whole reserved range belongs to this object
        unsafe { ptr::write_bytes(addr as *mut u8, POISON, slots * SLOT_SIZE) };
        // SAFETY: chunk headers stay mapped while their chunk is linked
        let chunk = unsafe { &mut *Chunk::containing(addr) };
        let slot = chunk.slot_of(addr);
        chunk.free_range(slot, slots);
        self.allocated_bytes -= slots * SLOT_SIZE;

        let mut freed = slots * SLOT_SIZE;
        for edge in edges.edges {
            freed += self.release(pass, edge);
        }
        trace!("deallocated {tag:?} at {addr:#x}, {freed}B freed");
        freed
    }

    /// Drop one reference to `value` within the current pass; deallocates the
    /// target when its count reaches zero. Maps and inline values are ignored.
    pub(crate) fn release(
        &mut self,
        pass: &mut CollectionPass,
        value: Value,
    ) -> usize {
        if !value.is_heap_ref() {
            return 0;
        }
        let addr = value.address();
        if pass.deallocated.contains(&addr) {
            return 0;
        }
        // SAFETY: not deallocated in this pass, so the header is intact
        let obj = unsafe { value.as_tagged_unchecked::<HeapObject>() };
        if unsafe { obj.as_ref() }.is_map() {
            return 0;
        }
        match pass.reachable.get_mut(&addr) {
            Some(count) if *count > 1 => {
                *count -= 1;
                0
            }
            _ => {
                pass.reachable.remove(&addr);
                self.deallocate(pass, obj)
            }
        }
    }

    /// Visit every live object in allocation address order per chunk. The
    /// callback must not mutate the bitmap.
    pub(crate) fn for_each_object(
        &self,
        mut f: impl FnMut(Tagged<HeapObject>),
    ) {
        let mut cursor = self.chunks;
        while !cursor.is_null() {
            // SAFETY: linked chunks stay mapped
            let chunk = unsafe { &*cursor };
            let mut slot = RESERVED_SLOTS;
            while slot < SLOTS_PER_CHUNK {
                if !chunk.is_slot_used(slot) {
                    slot += 1;
                    continue;
                }
                let obj =
                    Tagged::new(chunk.slot_address(slot) as *mut HeapObject);
                let span = reserved_slots_for(self.object_size(obj));
                f(obj);
                slot += span;
            }
            cursor = chunk.next;
        }
    }

    pub(crate) fn object_size(&self, obj: Tagged<HeapObject>) -> usize {
        // SAFETY: caller only passes live objects
        let header = unsafe { obj.as_ref() };
        if header.is_map() {
            return std::mem::size_of::<Map>();
        }
        // SAFETY: map words only ever hold Maps
        let tag = unsafe { header.map().as_ref() }.tag();
        records::object_byte_size(obj, tag)
    }

    /// Unmap wholly-empty chunks and reset scan hints on the survivors.
    pub fn sweep_chunks(&mut self) {
        let mut cursor = self.chunks;
        while !cursor.is_null() {
            // SAFETY: node is linked, next read before any unmap
            let chunk = unsafe { &mut *cursor };
            let next = chunk.next;
            if chunk.is_empty() {
                // SAFETY: unlinking and unmapping a node we own
                unsafe {
                    if chunk.prev.is_null() {
                        self.chunks = chunk.next;
                    } else {
                        (*chunk.prev).next = chunk.next;
                    }
                    if !chunk.next.is_null() {
                        (*chunk.next).prev = chunk.prev;
                    }
                    system::unmap_aligned(
                        NonNull::new_unchecked(cursor.cast()),
                        CHUNK_SIZE,
                    );
                }
                self.chunk_count -= 1;
                debug!("isolate {} unmapped an empty chunk", self.isolate_id);
            } else {
                chunk.reset_hints();
            }
            cursor = next;
        }
    }

    /// Isolate destruction: run every live object's teardown, then return
    /// all chunks (maps included) to the OS.
    pub(crate) fn tear_down(&mut self) {
        let mut pass = CollectionPass::new();
        let mut doomed = Vec::new();
        self.for_each_object(|obj| {
            // SAFETY: live during the walk
            if !unsafe { obj.as_ref() }.is_map() {
                doomed.push(obj);
            }
        });
        for obj in doomed {
            self.deallocate(&mut pass, obj);
        }
        let mut cursor = self.chunks;
        while !cursor.is_null() {
            // SAFETY: read next before the node disappears
            let next = unsafe { (*cursor).next };
            // SAFETY: every linked chunk is a CHUNK_SIZE mapping
            unsafe {
                system::unmap_aligned(
                    NonNull::new_unchecked(cursor.cast()),
                    CHUNK_SIZE,
                )
            };
            cursor = next;
        }
        self.chunks = ptr::null_mut();
        self.chunk_count = 0;
        self.allocated_bytes = 0;
    }

    pub fn statistics(&self) -> HeapStatistics {
        let mut used_slots = 0;
        let mut cursor = self.chunks;
        while !cursor.is_null() {
            // SAFETY: linked chunks stay mapped
            let chunk = unsafe { &*cursor };
            used_slots += chunk.in_use_application_slots();
            cursor = chunk.next;
        }
        HeapStatistics {
            allocated_bytes: self.allocated_bytes,
            chunk_count: self.chunk_count,
            used_slots,
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if !self.chunks.is_null() {
            self.tear_down();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NullEngine;
    use crate::map::MapTag;
    use crate::records::{FixedArray, ValueCell};

    fn test_heap() -> (Heap, Tagged<Map>, Tagged<Map>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut heap = Heap::new(7, Arc::new(NullEngine));
        let cell_map = Map::bootstrap(&mut heap, MapTag::ValueCell);
        let array_map = Map::bootstrap(&mut heap, MapTag::FixedArray);
        (heap, cell_map, array_map)
    }

    fn alloc_array(
        heap: &mut Heap,
        map: Tagged<Map>,
        len: usize,
    ) -> Tagged<FixedArray> {
        let obj = heap.alloc(Some(map), FixedArray::byte_size(len));
        // SAFETY: freshly allocated with the FixedArray map
        let arr: Tagged<FixedArray> = unsafe { obj.cast() };
        unsafe { arr.as_mut() }.set_len(len);
        arr
    }

    #[test]
    fn maps_are_their_own_map() {
        let (_heap, cell_map, _) = test_heap();
        // SAFETY: maps live as long as the heap
        let header = unsafe { cell_map.erase().as_ref() };
        assert!(header.is_map());
        assert_eq!(header.map().address(), cell_map.address());
    }

    #[test]
    fn alloc_zeroes_and_writes_the_map_word() {
        let (mut heap, cell_map, _) = test_heap();
        let obj = heap.alloc(Some(cell_map), 0);
        // SAFETY: just allocated
        let header = unsafe { obj.as_ref() };
        assert!(!header.is_map());
        assert_eq!(header.map().address(), cell_map.address());
        let cell = unsafe { obj.cast::<ValueCell>().as_ref() };
        assert!(cell.foreign.is_null());
        assert_eq!(cell.number, 0.0);
    }

    #[test]
    fn thousand_cells_free_every_other_and_reuse() {
        let (mut heap, cell_map, _) = test_heap();
        let baseline = heap.statistics().used_slots;

        let cells: Vec<_> =
            (0..1000).map(|_| heap.alloc(Some(cell_map), 0)).collect();
        let stats = heap.statistics();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.used_slots, baseline + 1000);

        let mut pass = CollectionPass::new();
        let mut freed_addrs = AHashSet::new();
        for obj in cells.iter().step_by(2) {
            assert_eq!(heap.deallocate(&mut pass, *obj), SLOT_SIZE);
            freed_addrs.insert(obj.address());
        }
        let stats = heap.statistics();
        assert_eq!(stats.used_slots, baseline + 500);
        assert_eq!(stats.chunk_count, 1);

        let replacement = heap.alloc(Some(cell_map), 0);
        assert!(freed_addrs.contains(&replacement.address()));
        assert_eq!(heap.statistics().chunk_count, 1);
    }

    #[test]
    fn double_deallocation_is_a_noop() {
        let (mut heap, cell_map, _) = test_heap();
        let obj = heap.alloc(Some(cell_map), 0);
        let before = heap.statistics().used_slots;
        let mut pass = CollectionPass::new();
        assert_eq!(heap.deallocate(&mut pass, obj), SLOT_SIZE);
        assert_eq!(heap.deallocate(&mut pass, obj), 0);
        assert_eq!(heap.statistics().used_slots, before - 1);
    }

    #[test]
    fn deallocation_poisons_memory() {
        let (mut heap, cell_map, _) = test_heap();
        let obj = heap.alloc(Some(cell_map), 0);
        let addr = obj.address();
        let mut pass = CollectionPass::new();
        heap.deallocate(&mut pass, obj);
        // SAFETY: chunk still mapped, reading the poisoned slot
        let bytes = unsafe {
            std::slice::from_raw_parts(addr as *const u8, SLOT_SIZE)
        };
        assert!(bytes.iter().all(|&b| b == POISON));
    }

    #[test]
    fn large_allocation_takes_whole_blocks() {
        let (mut heap, _, array_map) = test_heap();
        let before = heap.statistics().used_slots;
        let arr = alloc_array(&mut heap, array_map, 300);
        let size = FixedArray::byte_size(300);
        let expected = size.div_ceil(SLOTS_PER_BLOCK * SLOT_SIZE)
            * SLOTS_PER_BLOCK;
        assert_eq!(heap.statistics().used_slots, before + expected);

        let mut pass = CollectionPass::new();
        assert_eq!(
            heap.deallocate(&mut pass, arr.erase()),
            expected * SLOT_SIZE
        );
        assert_eq!(heap.statistics().used_slots, before);
    }

    #[test]
    fn exhausted_heap_grows_a_second_chunk() {
        let (mut heap, cell_map, _) = test_heap();
        let capacity = SLOTS_PER_CHUNK - RESERVED_SLOTS;
        for _ in 0..capacity {
            heap.alloc(Some(cell_map), 0);
        }
        assert_eq!(heap.statistics().chunk_count, 2);
    }

    #[test]
    fn unreachable_container_cascade_frees_its_elements() {
        let (mut heap, cell_map, array_map) = test_heap();
        let before = heap.statistics().used_slots;

        let a = heap.alloc(Some(cell_map), 0);
        let b = heap.alloc(Some(cell_map), 0);
        let arr = alloc_array(&mut heap, array_map, 2);
        // SAFETY: just allocated, nothing can collect here
        unsafe {
            arr.as_mut().set(0, a.as_value());
            arr.as_mut().set(1, b.as_value());
        }

        let mut pass = CollectionPass::new();
        let freed = heap.deallocate(&mut pass, arr.erase());
        // array slot plus both cells
        assert_eq!(freed, 3 * SLOT_SIZE);
        assert_eq!(heap.statistics().used_slots, before);
    }

    #[test]
    fn release_spares_objects_with_other_roots() {
        let (mut heap, cell_map, array_map) = test_heap();
        let shared = heap.alloc(Some(cell_map), 0);
        let arr = alloc_array(&mut heap, array_map, 1);
        // SAFETY: just allocated
        unsafe { arr.as_mut().set(0, shared.as_value()) };

        let mut pass = CollectionPass::new();
        // the shared cell has a second independent root
        pass.bump(shared.as_value());
        pass.bump(shared.as_value());

        heap.deallocate(&mut pass, arr.erase());
        assert!(!pass.deallocated.contains(&shared.address()));
        assert_eq!(pass.reachable[&shared.address()], 1);
    }

    #[test]
    fn tear_down_unmaps_everything() {
        let (mut heap, cell_map, array_map) = test_heap();
        for _ in 0..100 {
            heap.alloc(Some(cell_map), 0);
        }
        alloc_array(&mut heap, array_map, 500);
        heap.tear_down();
        let stats = heap.statistics();
        assert_eq!(stats.chunk_count, 0);
        assert_eq!(stats.used_slots, 0);
        assert_eq!(stats.allocated_bytes, 0);
    }

    #[test]
    fn reserve_sizes_round_as_expected() {
        assert_eq!(reserved_slots_for(1), 1);
        assert_eq!(reserved_slots_for(32), 1);
        assert_eq!(reserved_slots_for(33), 2);
        assert_eq!(reserved_slots_for(100), 4);
        assert_eq!(reserved_slots_for(2048), 64);
        assert_eq!(reserved_slots_for(2049), 128);
        assert_eq!(reserved_slots_for(5000), 192);
    }
}
