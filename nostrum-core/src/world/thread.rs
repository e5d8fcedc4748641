use {
    super::{
        GcReport,
        Init,
        LOCAL_KEY,
        LOCAL_OWNER,
        NODE_SLOTS,
        Object,
        ObjectKind,
        THREAD_RC_DELTA,
        WORLD_RC_DELTA,
        World,
        dumpster,
    },
    crate::{
        Error,
        Result,
        arena::BLOCK_HEADER_SIZE,
        region::WORD_SIZE,
        sync::{Latch, Mutex, RwLock},
    },
    non_zero_ext::NonZeroExt,
    scope_exit::scope_exit,
    smallvec::SmallVec,
    std::{
        any::Any,
        cell::{Cell, RefCell},
        collections::{HashMap, HashSet},
        fmt,
        mem::{ManuallyDrop, take},
        num::NonZeroU64,
        rc::Rc,
        time::Duration,
    },
    tracing::{debug, error},
};

/// Number of bytes in a thread record.
const THREAD_RECORD_SIZE: u32 = 8;

/// Per-thread state for working with a world.
///
/// Every thread that works with a world creates its own context,
/// and everything it does to the world goes through that context.
/// The context owns a small record in the arena,
/// whose first word heads the thread's [dumpster],
/// and keeps track of the handles the thread holds,
/// the reference count decrements it has yet to commit,
/// and the local values it has shared.
///
/// Dropping the context detaches it from the world;
/// see [`detach`][`Self::detach`].
///
/// [dumpster]: `Self::empty_dumpster`
pub struct ThreadContext<'w>
{
    world: &'w World,

    /// Address of the thread record.
    record: u32,

    /// Number of handles held on each object.
    ///
    /// Each entry accounts for one [`THREAD_RC_DELTA`] on the object.
    handles: RefCell<HashMap<u32, NonZeroU64>>,

    /// Number of active mutation scopes.
    depth: Cell<u32>,

    /// Reference count decrements not yet applied.
    pending: RefCell<SmallVec<[(u32, u32); 16]>>,

    /// Objects whose reference count reached zero,
    /// but whose resources have not been freed yet.
    dying: RefCell<Vec<u32>>,

    /// Objects whose resources were freed,
    /// but which are still registered with the world.
    dead: RefCell<Vec<u32>>,

    locals: RefCell<Locals>,

    detached: Cell<bool>,
}

/// Local values shared by a thread.
#[derive(Default)]
struct Locals
{
    next_key: u32,

    /// Shared values by key.
    values: HashMap<u32, LocalEntry>,

    /// Keys by value address, to find existing wrappers.
    keys: HashMap<*const (), u32>,

    /// Dead wrappers that were replaced by newer wrappers
    /// and may not have reached the dumpster yet.
    replaced: HashSet<u32>,
}

struct LocalEntry
{
    value: Rc<dyn Any>,

    /// Address of the most recent wrapper object.
    wrapper: u32,
}

/// Reference to a shared object held by a thread.
///
/// While a thread holds at least one handle to an object,
/// the object is kept alive and is a root for the garbage collector.
/// Cloning a handle is cheap; it does not touch the object.
pub struct Handle<'c>
{
    ctx: &'c ThreadContext<'c>,
    addr: u32,
}

/// Slot accessors for a handle to a node.
pub struct Node<'h, 'c>
{
    handle: &'h Handle<'c>,
    slots: u32,
}

impl<'w> ThreadContext<'w>
{
    /// Attach the calling thread to a world.
    pub fn new(world: &'w World) -> Result<Self>
    {
        let record = world.arena().alloc(THREAD_RECORD_SIZE)?;
        record.fill(0)?;
        debug!(record = record.address(), "Attached thread");
        Ok(Self{
            world,
            record: record.address(),
            handles: RefCell::new(HashMap::new()),
            depth: Cell::new(0),
            pending: RefCell::new(SmallVec::new()),
            dying: RefCell::new(Vec::new()),
            dead: RefCell::new(Vec::new()),
            locals: RefCell::new(Locals::default()),
            detached: Cell::new(false),
        })
    }

    /// The world this context is attached to.
    pub fn world(&self) -> &'w World
    {
        self.world
    }

    /// Create an object.
    ///
    /// Local objects cannot be created this way;
    /// use [`share_local`][`Self::share_local`].
    pub fn create_object(&self, init: Init) -> Result<Handle<'_>>
    {
        if let Init::Local{..} = init {
            return Err(Error::InvalidArgument(
                "Local objects are created by sharing a local value",
            ));
        }
        self.create_object_unchecked(init)
    }

    /// Create a node with `slots` empty slots.
    pub fn create_node(&self, slots: u32) -> Result<Handle<'_>>
    {
        self.create_object(Init::Node{slots})
    }

    /// Create an unlocked lock.
    pub fn create_lock(&self) -> Result<Handle<'_>>
    {
        self.create_object(Init::Lock)
    }

    /// Create an unlocked reader-writer lock.
    pub fn create_rwlock(&self) -> Result<Handle<'_>>
    {
        self.create_object(Init::RwLock)
    }

    /// Create a latch that is released after `count` decrements.
    pub fn create_latch(&self, count: u32) -> Result<Handle<'_>>
    {
        self.create_object(Init::Latch{count})
    }

    /// Obtain a handle to the root object.
    pub fn root(&self) -> Result<Handle<'_>>
    {
        self.with_mutation(|| self.acquire_handle(self.world.root_address()))
    }

    /// Share a local value with other threads.
    ///
    /// The value is wrapped in a local object owned by this thread.
    /// Other threads can hold and pass around the object,
    /// but only this thread can access the value,
    /// using [`local_value`][`Self::local_value`].
    /// Sharing the same value again returns a handle to the same object
    /// for as long as that object is alive.
    ///
    /// This context keeps the value alive until the object dies
    /// and the dumpster is emptied.
    pub fn share_local<T>(&self, value: Rc<T>) -> Result<Handle<'_>>
        where T: Any
    {
        let value: Rc<dyn Any> = value;
        let key_ptr = Rc::as_ptr(&value) as *const ();

        self.with_mutation(|| {
            let existing = self.locals.borrow().keys.get(&key_ptr).copied();
            let Some(key) = existing
                else { return self.share_new_local(value, key_ptr) };

            let wrapper = self.locals.borrow().values.get(&key)
                .map(|entry| entry.wrapper)
                .ok_or_else(|| Error::Corrupt(format!("No local value for key {key}")))?;

            if self.handles.borrow().contains_key(&wrapper) {
                return self.acquire_handle(wrapper);
            }

            let object = self.world.object_at(wrapper);
            if object.try_retain(THREAD_RC_DELTA)? {
                return Ok(self.adopt_handle(wrapper));
            }

            // The wrapper died; it is on its way to the dumpster.
            dumpster::keep_entry(&object)?;
            let handle = self.create_object_unchecked(
                Init::Local{key, owner: self.record},
            )?;
            let mut locals = self.locals.borrow_mut();
            locals.replaced.insert(wrapper);
            if let Some(entry) = locals.values.get_mut(&key) {
                entry.wrapper = handle.addr;
            }
            debug!(key, old = wrapper, new = handle.addr, "Revived local object");
            Ok(handle)
        })
    }

    /// The value wrapped by a local object owned by this thread.
    pub fn local_value(&self, handle: &Handle) -> Result<Rc<dyn Any>>
    {
        let object = handle.object();
        if object.kind()? != ObjectKind::Local {
            return Err(Error::InvalidArgument("Object is not a local object"));
        }
        if object.value(LOCAL_OWNER) != self.record {
            return Err(Error::InvalidArgument("Local object belongs to another thread"));
        }
        let key = object.value(LOCAL_KEY);
        self.locals.borrow().values.get(&key)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| Error::Corrupt(format!("No local value for key {key}")))
    }

    /// Like [`local_value`][`Self::local_value`],
    /// but downcast to the type of the value.
    pub fn local<T>(&self, handle: &Handle) -> Result<Rc<T>>
        where T: Any
    {
        self.local_value(handle)?
            .downcast()
            .map_err(|_| Error::InvalidArgument("Local value has a different type"))
    }

    /// Record a new edge to `target`.
    ///
    /// This is for containers that store references
    /// in their own value words or blocks.
    pub fn add_reference(&self, target: &Handle) -> Result<()>
    {
        self.change_reference(target.addr, 1)
    }

    /// Record the removal of an edge to the object at `target`.
    ///
    /// The object may be freed when the outermost mutation scope ends.
    pub fn remove_reference(&self, target: u32) -> Result<()>
    {
        self.change_reference(target, -1)
    }

    /// Add `delta` edges to the object at `target`, or remove `-delta`.
    ///
    /// Adding is only sound while a path keeps `target` alive,
    /// such as a handle or an existing edge.
    pub fn change_reference(&self, target: u32, delta: i32) -> Result<()>
    {
        self.with_mutation(|| {
            let object = self.world.object(target)?;
            let amount = delta.unsigned_abs() * WORLD_RC_DELTA;
            if delta > 0 {
                object.retain(amount)?;
            } else if delta < 0 {
                self.record_decrement(target, amount);
            }
            Ok(())
        })
    }

    /// Run `body` in a mutation scope.
    ///
    /// Reference count decrements recorded in the scope
    /// are applied when the outermost scope ends,
    /// even if `body` fails.
    /// Objects that cannot be freed at that point,
    /// for instance because a lock timed out,
    /// are freed when a later outermost scope ends.
    /// The garbage collector cannot run while any thread
    /// is in a mutation scope.
    pub fn with_mutation<F, R>(&self, body: F) -> Result<R>
        where F: FnOnce() -> Result<R>
    {
        let depth = self.depth.get();
        if depth != 0 {
            self.depth.set(depth + 1);
            scope_exit! { self.depth.set(depth); }
            return body();
        }

        let stw = self.world.stw_lock();
        stw.acquire_read()?;
        scope_exit! {
            if let Err(err) = stw.release() {
                error!(%err, "Cannot leave mutation scope");
            }
        }

        let result = {
            self.depth.set(1);
            scope_exit! { self.depth.set(0); }
            body()
        };

        let committed = self.commit();
        match (result, committed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(commit_err)) => {
                error!(%commit_err, "Cannot commit failed mutation");
                Err(err)
            },
        }
    }

    /// Free the local objects in this thread's dumpster,
    /// and forget the values that are no longer shared.
    ///
    /// Returns the number of objects freed.
    pub fn empty_dumpster(&self) -> Result<usize>
    {
        // Dropping a value may call back into this context,
        // so values are only dropped once the locals are no longer borrowed.
        let mut forgotten = Vec::new();
        let result = {
            let mut locals = self.locals.borrow_mut();
            dumpster::drain(self.world, self.record, |addr, key, needs_removal| {
                locals.replaced.remove(&addr);
                let current = locals.values.get(&key).map(|entry| entry.wrapper);
                if needs_removal && current == Some(addr) {
                    if let Some(entry) = locals.values.remove(&key) {
                        let key_ptr = Rc::as_ptr(&entry.value) as *const ();
                        locals.keys.remove(&key_ptr);
                        forgotten.push(entry.value);
                    }
                }
            })
        };
        drop(forgotten);
        result
    }

    /// Collect garbage; see [`World::gc`].
    ///
    /// Objects left behind by failed commits of this thread
    /// are freed first.
    /// Fails if called from within a mutation scope.
    pub fn gc(&self) -> Result<GcReport>
    {
        if self.depth.get() != 0 {
            return Err(Error::InvalidArgument(
                "Cannot collect garbage within a mutation scope",
            ));
        }
        self.with_mutation(|| Ok(()))?;
        self.world.gc()
    }

    /// Detach from the world.
    ///
    /// Local objects that are still alive are orphaned:
    /// their values are forgotten, and once they die they are freed directly.
    /// Then the dumpster is emptied and the thread record is freed.
    pub fn detach(self) -> Result<()>
    {
        self.detach_inner()
    }

    fn detach_inner(&self) -> Result<()>
    {
        if self.detached.get() {
            return Ok(());
        }

        // Apply decrements left behind by a panic or a failed commit.
        self.with_mutation(|| Ok(()))?;

        let wrappers: Vec<u32> = {
            let locals = self.locals.borrow();
            let current = locals.values.values().map(|entry| entry.wrapper);
            current.chain(locals.replaced.iter().copied()).collect()
        };
        for wrapper in wrappers {
            dumpster::orphan(&self.world.object_at(wrapper))?;
        }

        self.empty_dumpster()?;
        let locals = take(&mut *self.locals.borrow_mut());
        drop(locals);

        let record = self.world.arena().from_address(self.record)?;
        self.world.arena().free(record)?;
        self.detached.set(true);
        debug!(record = self.record, "Detached thread");
        Ok(())
    }

    fn create_object_unchecked(&self, init: Init) -> Result<Handle<'_>>
    {
        self.with_mutation(|| {
            let addr = self.world.create_object_raw(&init, THREAD_RC_DELTA)?;
            Ok(self.adopt_handle(addr))
        })
    }

    fn share_new_local(&self, value: Rc<dyn Any>, key_ptr: *const ())
        -> Result<Handle<'_>>
    {
        let key = {
            let mut locals = self.locals.borrow_mut();
            let key = locals.next_key;
            locals.next_key = key.wrapping_add(1);
            key
        };

        let handle = self.create_object_unchecked(
            Init::Local{key, owner: self.record},
        )?;

        let mut locals = self.locals.borrow_mut();
        locals.values.insert(key, LocalEntry{value, wrapper: handle.addr});
        locals.keys.insert(key_ptr, key);
        Ok(handle)
    }

    /// Obtain a handle to an object that is kept alive some other way.
    fn acquire_handle(&self, addr: u32) -> Result<Handle<'_>>
    {
        use std::collections::hash_map::Entry::*;
        let mut handles = self.handles.borrow_mut();
        match handles.entry(addr) {
            Occupied(mut entry) => {
                let count = entry.get().checked_add(1)
                    .ok_or(Error::InvalidArgument("Too many handles for object"))?;
                entry.insert(count);
            },
            Vacant(entry) => {
                self.world.object_at(addr).retain(THREAD_RC_DELTA)?;
                entry.insert(NonZeroU64::ONE);
            },
        }
        Ok(Handle{ctx: self, addr})
    }

    /// Obtain the first handle to an object,
    /// whose count already includes this thread.
    fn adopt_handle(&self, addr: u32) -> Handle<'_>
    {
        let mut handles = self.handles.borrow_mut();
        let previous = handles.insert(addr, NonZeroU64::ONE);
        debug_assert!(previous.is_none(), "Adopted handle to held object");
        Handle{ctx: self, addr}
    }

    fn clone_handle(&self, addr: u32)
    {
        const ERR: &str = "Too many handles for object";
        let mut handles = self.handles.borrow_mut();
        match handles.get_mut(&addr) {
            Some(n) => *n = n.checked_add(1).expect(ERR),
            None    => unreachable!("Use-after-drop of handle"),
        }
    }

    fn release_handle(&self, addr: u32) -> Result<()>
    {
        use std::collections::hash_map::Entry::*;
        let last = {
            let mut handles = self.handles.borrow_mut();
            match handles.entry(addr) {
                Occupied(mut entry) =>
                    match entry.get().checked_pred() {
                        Some(n) => { entry.insert(n); false },
                        None    => { entry.remove_entry(); true },
                    },
                Vacant(..) =>
                    unreachable!("Use-after-drop of handle"),
            }
        };

        if last {
            // Recorded before entering the scope, so that it is not lost
            // if the scope cannot be entered; the next commit applies it.
            self.record_decrement(addr, THREAD_RC_DELTA);
            self.with_mutation(|| Ok(()))?;
        }
        Ok(())
    }

    fn record_decrement(&self, addr: u32, delta: u32)
    {
        self.pending.borrow_mut().push((addr, delta));
    }

    /// Apply all recorded decrements and free the objects that die.
    ///
    /// Reference counts are always brought up to date.
    /// Objects that cannot be freed or unregistered right now
    /// are kept, and the next commit tries again.
    fn commit(&self) -> Result<()>
    {
        let freed = self.free_dying();
        let released = self.release_dead();
        match (freed, released) {
            (Ok(()), result) => result?,
            (Err(err), Ok(())) => return Err(err),
            (Err(err), Err(release_err)) => {
                error!(%release_err, "Cannot release dead objects");
                return Err(err);
            },
        }

        if self.world.config().check_after_mutation {
            self.world.sanity_check()?;
        }

        Ok(())
    }

    /// Apply the pending decrements and free the resources
    /// of the objects that reach zero, until nothing is left to do.
    fn free_dying(&self) -> Result<()>
    {
        let mut result = Ok(());
        loop {
            // Decrements never wait, so all of them are applied.
            let next = self.pending.borrow_mut().pop();
            if let Some((addr, delta)) = next {
                match self.world.object_at(addr).release(delta) {
                    Ok(true)  => self.dying.borrow_mut().push(addr),
                    Ok(false) => (),
                    Err(err)  => {
                        error!(%err, addr, "Cannot apply decrement");
                        result = result.and(Err(err));
                    },
                }
                continue;
            }

            let next = self.dying.borrow_mut().pop();
            let Some(addr) = next
                else { return result };

            let object = self.world.object_at(addr);
            let mut released = Vec::new();
            if let Err(err) = object.kind().and_then(|kind| kind.free(&object, &mut released)) {
                self.dying.borrow_mut().push(addr);
                return result.and(Err(err));
            }
            let released = released.into_iter().map(|target| (target, WORLD_RC_DELTA));
            self.pending.borrow_mut().extend(released);
            self.dead.borrow_mut().push(addr);
        }
    }

    /// Unregister the objects whose resources were freed.
    fn release_dead(&self) -> Result<()>
    {
        let mut dead = self.dead.borrow_mut();
        if dead.is_empty() {
            return Ok(());
        }
        self.world.release(&mut dead)
    }
}

impl<'w> Drop for ThreadContext<'w>
{
    fn drop(&mut self)
    {
        if let Err(err) = self.detach_inner() {
            error!(%err, record = self.record, "Cannot detach thread");
        }
    }
}

impl<'w> fmt::Debug for ThreadContext<'w>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("ThreadContext")
            .field("record", &self.record)
            .field("handles", &self.handles.borrow().len())
            .field("depth", &self.depth.get())
            .finish()
    }
}

impl<'c> Handle<'c>
{
    /// The context that holds this handle.
    pub fn context(&self) -> &'c ThreadContext<'c>
    {
        self.ctx
    }

    /// The address of the object.
    pub fn address(&self) -> u32
    {
        self.addr
    }

    /// View the object.
    pub fn object(&self) -> Object<'c>
    {
        self.ctx.world.object_at(self.addr)
    }

    /// The ID of the object.
    pub fn id(&self) -> u32
    {
        self.object().id()
    }

    /// The kind of the object.
    pub fn kind(&self) -> Result<ObjectKind>
    {
        self.object().kind()
    }

    /// The reference count of the object.
    pub fn refcount(&self) -> u32
    {
        self.object().refcount()
    }

    /// Access the slots of a node.
    pub fn node(&self) -> Result<Node<'_, 'c>>
    {
        let object = self.expect_kind(ObjectKind::Node)?;
        Ok(Node{handle: self, slots: object.value(NODE_SLOTS)})
    }

    /// The mutex of a lock object.
    pub fn mutex(&self) -> Result<Mutex<'_>>
    {
        let object = self.expect_kind(ObjectKind::Lock)?;
        Ok(Mutex::new(object.value_word(0)).with_timeout(self.timeout()))
    }

    /// The reader-writer lock of a reader-writer lock object.
    pub fn rwlock(&self) -> Result<RwLock<'_>>
    {
        let object = self.expect_kind(ObjectKind::RwLock)?;
        Ok(RwLock::new(object.value_word(0)).with_timeout(self.timeout()))
    }

    /// The latch of a latch object.
    pub fn latch(&self) -> Result<Latch<'_>>
    {
        let object = self.expect_kind(ObjectKind::Latch)?;
        Ok(Latch::new(object.value_word(0)).with_timeout(self.timeout()))
    }

    /// Release the handle, reporting failure to commit
    /// the resulting reference count decrement.
    ///
    /// Dropping the handle does the same, but only logs failure.
    pub fn dispose(self) -> Result<()>
    {
        let this = ManuallyDrop::new(self);
        this.ctx.release_handle(this.addr)
    }

    fn expect_kind(&self, kind: ObjectKind) -> Result<Object<'c>>
    {
        let object = self.object();
        if object.kind()? != kind {
            return Err(Error::InvalidArgument("Object has a different kind"));
        }
        Ok(object)
    }

    fn timeout(&self) -> Duration
    {
        self.ctx.world.config().timeout
    }
}

impl<'c> Clone for Handle<'c>
{
    fn clone(&self) -> Self
    {
        self.ctx.clone_handle(self.addr);
        Self{ctx: self.ctx, addr: self.addr}
    }
}

impl<'c> Drop for Handle<'c>
{
    fn drop(&mut self)
    {
        if let Err(err) = self.ctx.release_handle(self.addr) {
            error!(%err, addr = self.addr, "Cannot release handle");
        }
    }
}

impl<'c> fmt::Debug for Handle<'c>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        fmt::Debug::fmt(&self.object(), f)
    }
}

impl<'h, 'c> Node<'h, 'c>
{
    /// The number of slots.
    pub fn len(&self) -> u32
    {
        let arena = self.handle.ctx.world.arena();
        match self.slots {
            0     => 0,
            slots => arena.ptr_at(slots).size() / WORD_SIZE,
        }
    }

    /// Whether the node has no slots.
    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    /// Obtain a handle to the object in slot `i`, if any.
    pub fn get(&self, i: u32) -> Result<Option<Handle<'c>>>
    {
        let ctx = self.handle.ctx;
        ctx.with_mutation(|| {
            let slot = self.slot(i)?;
            let object = self.handle.object();
            // The edge keeps the target alive while we hold the lock.
            object.lock().run_exclusive(|| {
                match object.ptr().arena().region().load32(slot) {
                    0      => Ok(None),
                    target => ctx.acquire_handle(target).map(Some),
                }
            })?
        })
    }

    /// Store a reference to `value` in slot `i`, or clear it.
    pub fn set(&self, i: u32, value: Option<&Handle>) -> Result<()>
    {
        let ctx = self.handle.ctx;
        ctx.with_mutation(|| {
            let slot = self.slot(i)?;

            let new = match value {
                None => 0,
                Some(value) => {
                    if !value.ctx.world.region().same_region(ctx.world.region()) {
                        return Err(Error::InvalidArgument(
                            "Handle belongs to another world",
                        ));
                    }
                    value.object().retain(WORLD_RC_DELTA)?;
                    value.addr
                },
            };

            let object = self.handle.object();
            let region = object.ptr().arena().region();
            let old = object.lock().run_exclusive(|| {
                let old = region.load32(slot);
                region.store32(slot, new);
                old
            });

            match old {
                Ok(0) => (),
                Ok(old) => ctx.record_decrement(old, WORLD_RC_DELTA),
                Err(err) => {
                    if new != 0 {
                        ctx.record_decrement(new, WORLD_RC_DELTA);
                    }
                    return Err(err);
                },
            }
            Ok(())
        })
    }

    /// The region address of slot `i`.
    fn slot(&self, i: u32) -> Result<u32>
    {
        let len = self.len();
        if i >= len {
            return Err(Error::OutOfBounds{
                offset: i.saturating_mul(WORD_SIZE),
                size: len * WORD_SIZE,
            });
        }
        Ok(self.slots + BLOCK_HEADER_SIZE + i * WORD_SIZE)
    }
}

impl<'h, 'c> fmt::Debug for Node<'h, 'c>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("Node")
            .field("handle", self.handle)
            .field("len", &self.len())
            .finish()
    }
}
