//! The tracked-object bridge between this heap and the foreign engine.
//!
//! A TrackedObject pairs one heap record with one foreign object. The
//! association stashes a hidden private property on the foreign side keyed
//! by a token (isolate id + persistent slot), so repeated lookups are
//! idempotent, and registers a finalizer with the foreign collector. The
//! finalizer callback arrives on an arbitrary thread and must not re-enter
//! the engine, so it only resolves the isolate through the global registry
//! and enqueues the actual teardown onto the owning thread.

use std::sync::atomic::{AtomicU32, Ordering};

use log::trace;

use crate::handles::PersistentId;
use crate::isolate::{self, Isolate};
use crate::map::MapTag;
use crate::records::{HeapObject, TrackedFlags, TrackedObject};
use crate::tagged::Tagged;

/// Opaque handle to a value owned by the foreign engine. Zero is null.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ForeignRef(pub u64);

impl ForeignRef {
    pub const NULL: ForeignRef = ForeignRef(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// What the hidden private property stores: enough to find the bridge again
/// from any thread without touching heap structures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BridgeToken {
    pub isolate_id: u64,
    pub slot: PersistentId,
}

/// The operations this layer needs from the engine that actually owns the
/// values. Implementations must be callable from any thread.
pub trait ForeignEngine: Send + Sync {
    /// Take a strong reference on a foreign value.
    fn protect(&self, value: ForeignRef);
    /// Drop a strong reference taken with `protect`.
    fn unprotect(&self, value: ForeignRef);
    /// Install the hidden bridge property. Returns false if one was already
    /// present (the existing one wins).
    fn set_private(&self, object: ForeignRef, token: BridgeToken) -> bool;
    fn get_private(&self, object: ForeignRef) -> Option<BridgeToken>;
    /// Prototype of `object`, or null at the end of the chain.
    fn prototype_of(&self, object: ForeignRef) -> ForeignRef;
    /// Arrange for [`foreign_object_finalized`] to be called with `token`
    /// when the foreign collector reclaims `object`.
    fn register_finalizer(&self, object: ForeignRef, token: BridgeToken);
}

/// Engine stub for contexts with no foreign side.
pub struct NullEngine;

impl ForeignEngine for NullEngine {
    fn protect(&self, _value: ForeignRef) {}
    fn unprotect(&self, _value: ForeignRef) {}
    fn set_private(&self, _object: ForeignRef, _token: BridgeToken) -> bool {
        true
    }
    fn get_private(&self, _object: ForeignRef) -> Option<BridgeToken> {
        None
    }
    fn prototype_of(&self, _object: ForeignRef) -> ForeignRef {
        ForeignRef::NULL
    }
    fn register_finalizer(&self, _object: ForeignRef, _token: BridgeToken) {}
}

static NEXT_HASH: AtomicU32 = AtomicU32::new(1);

/// Allocate a fresh, unassociated bridge record.
pub fn make_private_instance(iso: &mut Isolate) -> Tagged<TrackedObject> {
    let bridge = iso.alloc::<TrackedObject>();
    // SAFETY: just allocated, no aliases
    unsafe { bridge.as_mut() }.hash = NEXT_HASH.fetch_add(1, Ordering::Relaxed);
    bridge
}

/// Tie `bridge` to `foreign`. Installs the private back pointer, registers
/// the foreign finalizer, and roots the bridge in the persistent table until
/// the foreign side lets go. Idempotent: if `foreign` already carries a
/// bridge for this isolate, that one is returned and `bridge` is left alone.
pub fn associate_with_foreign(
    iso: &mut Isolate,
    bridge: Tagged<TrackedObject>,
    foreign: ForeignRef,
) -> Tagged<TrackedObject> {
    debug_assert!(!foreign.is_null());
    if let Some(existing) = get_private_instance(iso, foreign) {
        return existing;
    }
    let slot = iso.make_persistent(bridge.as_value());
    let token = BridgeToken {
        isolate_id: iso.id(),
        slot,
    };
    // SAFETY: rooted by the persistent just created
    unsafe { bridge.as_mut() }.foreign = foreign;
    let engine = iso.engine();
    engine.set_private(foreign, token);
    engine.register_finalizer(foreign, token);
    trace!(
        "isolate {}: bridged foreign object {:#x}",
        iso.id(),
        foreign.0
    );
    bridge
}

/// Bridge lookup by foreign object, walking the prototype chain so access
/// proxies layered over the real target still resolve. Tolerates objects
/// that were never bridged.
pub fn get_private_instance(
    iso: &Isolate,
    object: ForeignRef,
) -> Option<Tagged<TrackedObject>> {
    let engine = iso.engine();
    let mut cursor = object;
    while !cursor.is_null() {
        if let Some(token) = engine.get_private(cursor) {
            if token.isolate_id == iso.id()
                && let Some(value) = iso.persistent_value(token.slot)
            {
                return value.as_tagged::<TrackedObject>();
            }
        }
        cursor = engine.prototype_of(cursor);
    }
    None
}

/// Entry point for the foreign engine's finalizer callback. Runs on an
/// arbitrary thread; the only safe moves are the registry lookup and an
/// async enqueue. An isolate that is already gone is not an error.
pub fn foreign_object_finalized(token: BridgeToken) {
    let Some(queue) = isolate::queue_for(token.isolate_id) else {
        trace!(
            "finalizer for isolate {} arrived after teardown",
            token.isolate_id
        );
        return;
    };
    queue.run_async(Box::new(move |iso| finalize_bridge(iso, token)));
}

/// Owning-thread half of foreign finalization: unroot the bridge and let the
/// next collection reclaim it. Firing twice for one bridge is a bug in the
/// foreign engine and trips an assertion.
fn finalize_bridge(iso: &mut Isolate, token: BridgeToken) {
    let Some(value) = iso.persistent_value(token.slot) else {
        return;
    };
    let Some(obj) = value.as_tagged::<HeapObject>() else {
        return;
    };
    // SAFETY: still rooted by the persistent slot
    let header = unsafe { obj.as_ref() };
    // SAFETY: map words only ever hold Maps
    let is_bridge = !header.is_map()
        && unsafe { header.map().as_ref() }.tag() == MapTag::TrackedObject;
    if !is_bridge {
        // the token outlived its bridge; the slot now holds something else
        trace!(
            "isolate {}: stale bridge finalizer ignored",
            iso.id()
        );
        return;
    }
    // SAFETY: tag checked above
    let tracked = unsafe { obj.cast::<TrackedObject>().as_mut() };
    assert!(
        !tracked.flags.contains(TrackedFlags::FINALIZED),
        "bridge finalized twice"
    );
    tracked.flags.insert(TrackedFlags::FINALIZED);
    tracked.foreign = ForeignRef::NULL;
    iso.release_persistent(token.slot);
    iso.set_pending_gc();
    trace!("isolate {}: bridge unrooted by foreign finalizer", iso.id());
}
