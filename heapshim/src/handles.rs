//! Local handle scopes and the persistent handle table.
//!
//! Locals live in a stack of scopes tied to call frames; persistents live in
//! an explicit slotted table and survive until removed. A persistent can be
//! made weak, in which case it stops rooting its target and instead gets a
//! second-pass callback when the target dies.

use std::ptr::NonNull;

use ahash::AHashMap;

use crate::heap::Finalizer;
use crate::isolate::Isolate;
use crate::tagged::Value;

/// Slot handle carrying the slot's generation, so a handle that outlives
/// its slot (a stale foreign-finalizer token, say) stops resolving once the
/// slot has been reused instead of naming whatever lives there now.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PersistentId {
    index: u32,
    generation: u32,
}

enum SlotState {
    Strong,
    Weak(Option<Finalizer>),
}

struct Slot {
    value: Value,
    state: SlotState,
}

pub struct PersistentTable {
    slots: Vec<Option<Slot>>,
    // bumped every time a slot is cleared; stale ids stop matching
    generations: Vec<u32>,
    free: Vec<u32>,
}

impl PersistentTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
        }
    }

    fn live_index(&self, id: PersistentId) -> Option<usize> {
        let index = id.index as usize;
        (self.generations.get(index) == Some(&id.generation)).then_some(index)
    }

    pub fn insert(&mut self, value: Value) -> PersistentId {
        let slot = Slot {
            value,
            state: SlotState::Strong,
        };
        match self.free.pop() {
            Some(index) => {
                debug_assert!(self.slots[index as usize].is_none());
                self.slots[index as usize] = Some(slot);
                PersistentId {
                    index,
                    generation: self.generations[index as usize],
                }
            }
            None => {
                self.slots.push(Some(slot));
                self.generations.push(0);
                PersistentId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, id: PersistentId) -> Option<Value> {
        let index = self.live_index(id)?;
        self.slots[index].as_ref().map(|s| s.value)
    }

    pub fn remove(&mut self, id: PersistentId) -> Option<Value> {
        let index = self.live_index(id)?;
        let slot = self.slots[index].take()?;
        self.generations[index] += 1;
        self.free.push(id.index);
        Some(slot.value)
    }

    /// Stop rooting the target; `finalizer` runs after the sweep that frees
    /// it. A second call replaces the callback.
    pub fn make_weak(&mut self, id: PersistentId, finalizer: Option<Finalizer>) {
        let slot = self
            .live_index(id)
            .and_then(|index| self.slots[index].as_mut());
        match slot {
            Some(slot) => slot.state = SlotState::Weak(finalizer),
            None => panic!("weakening a cleared persistent slot"),
        }
    }

    pub fn is_weak(&self, id: PersistentId) -> bool {
        matches!(
            self.live_index(id)
                .and_then(|index| self.slots[index].as_ref()),
            Some(Slot {
                state: SlotState::Weak(_),
                ..
            })
        )
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn strong_roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots.iter().flatten().filter_map(|slot| {
            matches!(slot.state, SlotState::Strong).then_some(slot.value)
        })
    }

    /// Target address -> weak slot ids, consumed by one collection pass.
    pub(crate) fn weak_by_address(
        &self,
    ) -> AHashMap<usize, Vec<PersistentId>> {
        let mut map: AHashMap<usize, Vec<PersistentId>> = AHashMap::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot
                && matches!(slot.state, SlotState::Weak(_))
                && slot.value.is_heap_ref()
            {
                map.entry(slot.value.address()).or_default().push(
                    PersistentId {
                        index: index as u32,
                        generation: self.generations[index],
                    },
                );
            }
        }
        map
    }

    /// Clear a slot whose target died and hand back its callback.
    pub(crate) fn clear_dead(&mut self, id: PersistentId) -> Option<Finalizer> {
        let index = self.live_index(id)?;
        let slot = self.slots[index].take()?;
        self.generations[index] += 1;
        self.free.push(id.index);
        match slot.state {
            SlotState::Weak(finalizer) => finalizer,
            SlotState::Strong => None,
        }
    }
}

/// RAII wrapper over the isolate's scope stack. Scopes must drop in reverse
/// creation order; violating that is an assertion failure, not a leak.
pub struct HandleScope {
    isolate: NonNull<Isolate>,
    depth: usize,
}

impl HandleScope {
    pub fn new(isolate: &mut Isolate) -> HandleScope {
        let depth = isolate.push_scope();
        HandleScope {
            isolate: NonNull::from(isolate),
            depth,
        }
    }

    /// Root `value` in this scope (which must be the innermost one) for as
    /// long as the scope lives.
    pub fn local(&mut self, value: Value) -> Value {
        // SAFETY: the isolate outlives every scope opened on it and is only
        // touched from its owning thread
        unsafe { self.isolate.as_mut() }.add_local(self.depth, value)
    }
}

impl Drop for HandleScope {
    fn drop(&mut self) {
        // SAFETY: as in local()
        unsafe { self.isolate.as_mut() }.pop_scope(self.depth);
    }
}
