//! The liveness tracker.
//!
//! Reachability is counted, not traced: every independent root (scope local,
//! strong persistent) and every in-heap edge contributes one count to its
//! target. The sweep tears down anything with no counts, and destructors
//! release their edges by decrement-to-zero, so death cascades through
//! containers without a second mark pass. Cycles threaded purely through
//! heap containers are not reclaimed; see the crate docs.

use log::{debug, trace};

use crate::heap::CollectionPass;
use crate::isolate::Isolate;
use crate::records::{self, HeapObject};
use crate::tagged::Tagged;
use crate::visitor::Visitor;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Marking,
    Sweeping,
}

struct MarkVisitor<'a> {
    pass: &'a mut CollectionPass,
}

impl Visitor for MarkVisitor<'_> {
    fn visit_edge(&mut self, value: crate::tagged::Value) {
        self.pass.bump(value);
    }
}

impl Isolate {
    /// Run a full collection pass on the owning thread. A request arriving
    /// while a pass is active (a destructor side effect) is recorded and
    /// honored once the current pass finishes.
    pub fn collect_garbage(&mut self) {
        if self.phase != Phase::Idle {
            trace!("isolate {}: nested collection request deferred", self.id());
            self.pending_gc = true;
            return;
        }
        loop {
            self.run_collection();
            if !self.pending_gc {
                break;
            }
            self.pending_gc = false;
        }
    }

    fn run_collection(&mut self) {
        self.phase = Phase::Marking;
        let mut pass = CollectionPass::new();

        // roots: scope locals and strong persistents, one count each
        for scope in &self.scopes {
            for &value in scope {
                pass.bump(value);
            }
        }
        for value in self.persistents.strong_roots() {
            pass.bump(value);
        }
        pass.weak = self.persistents.weak_by_address();

        // heap scan: maps are skipped, every other object is recorded and
        // its edges counted
        self.heap.for_each_object(|obj| {
            // SAFETY: the walk only yields live objects
            let header = unsafe { obj.as_ref() };
            if header.is_map() {
                return;
            }
            pass.allocated.push(obj.address());
            // SAFETY: map words only ever hold Maps
            let tag = unsafe { header.map().as_ref() }.tag();
            records::visit_object(obj, tag, &mut MarkVisitor { pass: &mut pass });
        });

        self.phase = Phase::Sweeping;
        let doomed: Vec<usize> = pass
            .allocated
            .iter()
            .copied()
            .filter(|addr| !pass.reachable.contains_key(addr))
            .collect();
        let mut freed = 0;
        for addr in doomed {
            if pass.deallocated.contains(&addr) {
                continue;
            }
            let obj = Tagged::new(addr as *mut HeapObject);
            freed += self.heap.deallocate(&mut pass, obj);
        }
        self.heap.sweep_chunks();
        self.phase = Phase::Idle;
        debug!(
            "isolate {}: collection freed {}B, {} finalizers pending",
            self.id(),
            freed,
            pass.dead_weak.len()
        );

        // second-pass callbacks run outside the critical section and may
        // allocate or start another collection
        let dead = std::mem::take(&mut pass.dead_weak);
        drop(pass);
        for id in dead {
            if let Some(finalizer) = self.persistents.clear_dead(id) {
                finalizer(self);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;

    use crate::bridge::NullEngine;
    use crate::handles::HandleScope;
    use crate::isolate::Isolate;
    use crate::records::ValueCell;
    use crate::tagged::Value;

    fn fresh() -> Box<Isolate> {
        let _ = env_logger::builder().is_test(true).try_init();
        Isolate::new(Arc::new(NullEngine))
    }

    #[test]
    fn unrooted_objects_die_in_one_pass() {
        let mut iso = fresh();
        let baseline = iso.statistics().used_slots;
        iso.alloc::<ValueCell>();
        iso.alloc::<ValueCell>();
        assert_eq!(iso.statistics().used_slots, baseline + 2);
        iso.collect_garbage();
        assert_eq!(iso.statistics().used_slots, baseline);
    }

    #[test]
    fn scope_locals_root_their_targets() {
        let mut iso = fresh();
        let baseline = iso.statistics().used_slots;
        {
            let cell = iso.alloc::<ValueCell>();
            let mut scope = HandleScope::new(&mut iso);
            scope.local(cell.as_value());
            iso.collect_garbage();
            assert_eq!(iso.statistics().used_slots, baseline + 1);
        }
        iso.collect_garbage();
        assert_eq!(iso.statistics().used_slots, baseline);
    }

    #[test]
    fn persistents_root_until_released() {
        let mut iso = fresh();
        let baseline = iso.statistics().used_slots;
        let cell = iso.alloc::<ValueCell>();
        let id = iso.make_persistent(cell.as_value());
        iso.collect_garbage();
        assert_eq!(iso.statistics().used_slots, baseline + 1);
        iso.release_persistent(id);
        iso.collect_garbage();
        assert_eq!(iso.statistics().used_slots, baseline);
    }

    #[test]
    fn container_chains_die_together() {
        let mut iso = fresh();
        let baseline = iso.statistics().used_slots;

        let leaf = iso.alloc::<ValueCell>();
        let inner = iso.alloc_array(1);
        let outer = iso.alloc_array(1);
        // SAFETY: nothing collects between allocation and the writes
        unsafe {
            inner.as_mut().set(0, leaf.as_value());
            outer.as_mut().set(0, inner.as_value());
        }
        let id = iso.make_persistent(outer.as_value());
        iso.collect_garbage();
        assert_eq!(iso.statistics().used_slots, baseline + 3);

        iso.release_persistent(id);
        iso.collect_garbage();
        assert_eq!(iso.statistics().used_slots, baseline);
    }

    #[test]
    fn shared_elements_survive_a_sibling_chain_dying() {
        let mut iso = fresh();
        let baseline = iso.statistics().used_slots;

        let shared = iso.alloc::<ValueCell>();
        let doomed = iso.alloc_array(1);
        let kept = iso.alloc_array(1);
        // SAFETY: as above
        unsafe {
            doomed.as_mut().set(0, shared.as_value());
            kept.as_mut().set(0, shared.as_value());
        }
        let id = iso.make_persistent(kept.as_value());
        iso.collect_garbage();
        // doomed array died, shared cell and kept array remain
        assert_eq!(iso.statistics().used_slots, baseline + 2);
        // SAFETY: kept is rooted by the persistent
        assert_eq!(unsafe { kept.as_ref() }.get(0), shared.as_value());
        iso.release_persistent(id);
    }

    #[test]
    fn empty_chunks_are_returned_to_the_os() {
        let mut iso = fresh();
        assert_eq!(iso.statistics().chunk_count, 1);
        // each array takes most of a chunk, forcing growth
        for _ in 0..4 {
            iso.alloc_array(60_000);
        }
        assert!(iso.statistics().chunk_count > 1);
        iso.collect_garbage();
        assert_eq!(iso.statistics().chunk_count, 1);
    }

    #[test]
    fn chunks_with_one_survivor_are_retained() {
        let mut iso = fresh();
        let _doomed = iso.alloc_array(60_000);
        let survivor = iso.alloc_array(60_000);
        let id = iso.make_persistent(survivor.as_value());
        assert_eq!(iso.statistics().chunk_count, 2);
        iso.collect_garbage();
        // the survivor keeps its chunk mapped
        assert_eq!(iso.statistics().chunk_count, 2);
        iso.release_persistent(id);
        iso.collect_garbage();
        assert_eq!(iso.statistics().chunk_count, 1);
    }

    #[test]
    fn weak_persistents_do_not_root_and_finalize_once() {
        let mut iso = fresh();
        let baseline = iso.statistics().used_slots;
        let fired = Rc::new(Cell::new(0u32));

        let cell = iso.alloc::<ValueCell>();
        let id = iso.make_persistent(cell.as_value());
        let count = Rc::clone(&fired);
        iso.make_weak(id, Some(Box::new(move |_iso| {
            count.set(count.get() + 1);
        })));

        iso.collect_garbage();
        assert_eq!(iso.statistics().used_slots, baseline);
        assert_eq!(fired.get(), 1);
        assert_eq!(iso.persistent_value(id), None);

        iso.collect_garbage();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn finalizers_may_allocate() {
        let mut iso = fresh();
        let cell = iso.alloc::<ValueCell>();
        let id = iso.make_persistent(cell.as_value());
        let born = Rc::new(Cell::new(None));
        let slot = Rc::clone(&born);
        iso.make_weak(id, Some(Box::new(move |iso| {
            slot.set(Some(iso.alloc::<ValueCell>().as_value()));
        })));
        let baseline = iso.statistics().used_slots;
        iso.collect_garbage();
        assert!(born.get().is_some());
        // the dead cell's slot was reclaimed, the finalizer's allocation took one
        assert_eq!(iso.statistics().used_slots, baseline);
    }

    #[test]
    fn template_property_lists_live_and_die_as_a_chain() {
        let mut iso = fresh();
        let baseline = iso.statistics().used_slots;

        let mut head = Value::from_smi(0);
        for i in 0..3 {
            let name = iso.alloc::<ValueCell>();
            head = iso
                .push_template_prop(head, name.as_value(), Value::from_smi(i), 0)
                .as_value();
        }
        let id = iso.make_persistent(head);
        let live = iso.statistics().used_slots;
        assert!(live > baseline);
        iso.collect_garbage();
        // the rooted head keeps the whole chain and its name cells
        assert_eq!(iso.statistics().used_slots, live);

        iso.release_persistent(id);
        iso.collect_garbage();
        assert_eq!(iso.statistics().used_slots, baseline);
    }

    #[test]
    fn unreachable_container_cycle_is_an_accepted_leak() {
        let mut iso = fresh();
        let baseline = iso.statistics().used_slots;
        let a = iso.alloc_array(1);
        let b = iso.alloc_array(1);
        // SAFETY: as above
        unsafe {
            a.as_mut().set(0, b.as_value());
            b.as_mut().set(0, a.as_value());
        }
        iso.collect_garbage();
        // counted reachability cannot break the cycle; both survive
        assert_eq!(iso.statistics().used_slots, baseline + 2);
    }
}
