//! Deferred freeing of local objects.
//!
//! A local object wraps a value that only its owning thread can touch,
//! so it must not disappear behind the owner's back.
//! When its reference count reaches zero on any thread,
//! it is pushed onto the dumpster of its owner instead of being freed.
//! The owner frees the objects in its dumpster,
//! and forgets the wrapped values, when it empties the dumpster.
//!
//! The dumpster is a singly-linked list headed by the first word
//! of the owner's thread record, linked through the dumpster link
//! value word of each object.
//! The link also carries [`NEEDS_REMOVAL`], which the owner clears
//! when it shares the wrapped value again before emptying the dumpster.

use {
    super::{LOCAL_KEY, LOCAL_LINK, LOCAL_OWNER, Object, World},
    crate::{Result, arena::BLOCK_HEADER_SIZE},
    std::sync::atomic::{AtomicU32, Ordering::SeqCst},
    tracing::debug,
};

/// Flag in the dumpster link: the owner's entry for the value must go.
pub const NEEDS_REMOVAL: u32 = 1;

/// Push a dead local object onto its owner's dumpster.
///
/// Returns false if the object has no owner any more,
/// in which case the caller must free it directly.
pub (super) fn push(world: &World, object: &Object) -> Result<bool>
{
    object.lock().run_exclusive(|| {
        let owner = object.value(LOCAL_OWNER);
        if owner == 0 {
            return false;
        }

        let head = head(world, owner);
        let mut next = head.load(SeqCst);
        loop {
            object.set_value(LOCAL_LINK, next | NEEDS_REMOVAL);
            match head.compare_exchange(next, object.address(), SeqCst, SeqCst) {
                Ok(_)     => break,
                Err(seen) => next = seen,
            }
        }

        debug!(addr = object.address(), owner, "Pushed object onto dumpster");
        true
    })
}

/// Free every object in the dumpster of `record`.
///
/// `forget` is called with the address, key, and removal flag
/// of each object before it is freed.
/// Returns the number of objects freed.
pub (super) fn drain<F>(world: &World, record: u32, mut forget: F) -> Result<usize>
    where F: FnMut(u32, u32, bool)
{
    let mut next = head(world, record).swap(0, SeqCst);
    let mut count = 0;
    while next != 0 {
        let object = world.object_at(next);
        let link = object.value(LOCAL_LINK);
        forget(next, object.value(LOCAL_KEY), link & NEEDS_REMOVAL != 0);
        world.arena().free(object.ptr())?;
        count += 1;
        next = link & !NEEDS_REMOVAL;
    }
    if count != 0 {
        debug!(record, count, "Emptied dumpster");
    }
    Ok(count)
}

/// Tell the dumpster to keep the owner's entry for a dead object,
/// because the owner shared the value again.
pub (super) fn keep_entry(object: &Object) -> Result<()>
{
    object.lock().run_exclusive(|| {
        let link = object.value(LOCAL_LINK);
        object.set_value(LOCAL_LINK, link & !NEEDS_REMOVAL);
    })
}

/// Detach a local object from its owner,
/// so that it is freed directly once it dies.
pub (super) fn orphan(object: &Object) -> Result<()>
{
    object.lock().run_exclusive(|| object.set_value(LOCAL_OWNER, 0))
}

fn head(world: &World, record: u32) -> &AtomicU32
{
    world.arena().region().word(record + BLOCK_HEADER_SIZE)
}
