//! Reference-counted, garbage-collected object graph in an arena.
//!
//! # Components
//!
//! The [`World`] lives in the arena it manages.
//! Its header is the first block of the arena and holds the following words:
//!
//! | Offset | Field                                              |
//! |--------|----------------------------------------------------|
//! | 0      | [`WORLD_MAGIC`]                                    |
//! | 4      | Address of the root object                         |
//! | 8      | Number of live objects, including the root         |
//! | 12     | Header mutex                                       |
//! | 16     | Address of the object-ID table                     |
//! | 20     | Number of used slots in the object-ID table        |
//! | 24     | Capacity of the object-ID table                    |
//! | 28     | First recycled object ID, or zero                  |
//! | 32     | Stop-the-world reader-writer lock                  |
//!
//! Every object is an arena block described by [`Object`].
//! Threads interact with the world through a [`ThreadContext`],
//! which hands out [`Handle`]s to objects.
//!
//! # Reference counting
//!
//! The reference count of an object is the number of edges to it
//! (each counting [`WORLD_RC_DELTA`], at most [`MAX_EDGES`])
//! plus the number of threads holding handles to it
//! (each counting [`THREAD_RC_DELTA`]).
//! Increments are applied immediately, which is safe because
//! whoever adds a reference already has a path that keeps the object alive.
//! Decrements are recorded by the thread context and applied
//! when the outermost [mutation scope] ends;
//! objects whose count reaches zero are then freed,
//! which may release more references, and so on.
//! Objects that cannot be freed because a lock timed out
//! stay at zero until a later outermost scope of the same thread.
//!
//! Reference counting does not reclaim cycles;
//! [`World::gc`] takes care of those.
//!
//! # Lock order
//!
//! Stop-the-world lock, then header mutex, then object locks one at a time,
//! then arena lock.
//!
//! [mutation scope]: `ThreadContext::with_mutation`

pub use self::{gc::*, kind::*, object::*, thread::*};

use {
    self::ids::IdTable,
    crate::{
        Arena,
        Config,
        Error,
        Region,
        Result,
        arena::{ARENA_HEADER_SIZE, BLOCK_HEADER_SIZE},
        region::WORD_SIZE,
        sync::{Mutex, RwLock},
    },
    std::{fmt, sync::atomic::AtomicU32},
    tracing::debug,
};

mod dumpster;
mod gc;
mod ids;
mod kind;
mod object;
mod thread;

/// Magic number stored in the first word of the world header.
pub const WORLD_MAGIC: u32 = 0x1083041d;

/// Number of bytes in the world header.
pub const WORLD_HEADER_SIZE: u32 = 36;

const MAGIC: u32 = 0;
const ROOT: u32 = 4;
const OBJECT_COUNT: u32 = 8;
const LOCK: u32 = 12;
const OBJLIST_ADDR: u32 = 16;
const OBJLIST_SIZE: u32 = 20;
const OBJLIST_CAPACITY: u32 = 24;
const OBJLIST_FREE: u32 = 28;
const STW_LOCK: u32 = 32;

/// Registry of all shared objects in an arena.
///
/// A world is created once, and may then be attached to
/// by any number of threads holding a clone of its region.
pub struct World
{
    arena: Arena,

    /// Address of the world header block.
    header: u32,

    config: Config,
}

impl World
{
    /// Create an arena as configured, and initialize a world in it.
    ///
    /// The world starts out with a single object: the root node.
    pub fn create(config: Config) -> Result<Self>
    {
        config.validate()?;

        let arena = Arena::create(config.arena_size)?
            .with_timeout(config.timeout);

        let header = arena.alloc(WORLD_HEADER_SIZE)?.address();
        if header != ARENA_HEADER_SIZE {
            return Err(Error::Corrupt(String::from(
                "World header is not the first block",
            )));
        }

        let this = Self{arena, header, config};

        for field in (0 .. WORLD_HEADER_SIZE).step_by(WORD_SIZE as usize) {
            this.store_header(field, 0);
        }
        this.store_header(MAGIC, WORLD_MAGIC);
        IdTable::new(&this).init(this.config.id_table_capacity)?;

        let root_slots = this.config.root_slots;
        let root = this.create_object_raw(&Init::Node{slots: root_slots}, WORLD_RC_DELTA)?;
        this.store_header(ROOT, root);

        debug!(arena_size = this.config.arena_size, root, "Created world");
        Ok(this)
    }

    /// Attach to a world that was created in `region` earlier.
    ///
    /// Only the timeouts and debugging options of `config` are used;
    /// the sizes were fixed when the world was created.
    pub fn attach(region: Region, config: Config) -> Result<Self>
    {
        config.validate()?;

        let arena = Arena::attach(region)?.with_timeout(config.timeout);
        let this = Self{arena, header: ARENA_HEADER_SIZE, config};

        let magic = this.load_header(MAGIC);
        if magic != WORLD_MAGIC {
            return Err(Error::Corrupt(format!("Bad world magic {magic:#010x}")));
        }

        Ok(this)
    }

    /// The region in which the world lives.
    pub fn region(&self) -> &Region
    {
        self.arena.region()
    }

    /// The arena in which the world lives.
    pub fn arena(&self) -> &Arena
    {
        &self.arena
    }

    /// The configuration the world was created or attached with.
    pub fn config(&self) -> &Config
    {
        &self.config
    }

    /// The number of live objects, including the root.
    pub fn object_count(&self) -> u32
    {
        self.load_header(OBJECT_COUNT)
    }

    /// The number of bytes left in the arena.
    pub fn bytes_left(&self) -> u32
    {
        self.arena.bytes_left()
    }

    /// The address of the root object.
    pub fn root_address(&self) -> u32
    {
        self.load_header(ROOT)
    }

    /// View the object at `addr`, checking that it names an object.
    pub fn object(&self, addr: u32) -> Result<Object<'_>>
    {
        let ptr = self.arena.from_address(addr)?;
        if ptr.size() < OBJECT_HEADER_SIZE || ptr.size() % WORD_SIZE != 0 {
            return Err(Error::InvalidArgument("Address does not name an object"));
        }
        let object = self.object_at(addr);
        let kind = object.kind()
            .map_err(|_| Error::InvalidArgument("Address does not name an object"))?;
        if ptr.size() != kind.value_words() * WORD_SIZE + OBJECT_HEADER_SIZE {
            return Err(Error::InvalidArgument("Address does not name an object"));
        }
        Ok(object)
    }

    /// Check the structure of the world and its arena.
    ///
    /// Objects left at refcount zero by a failed commit
    /// are reported until a later commit frees them.
    pub fn sanity_check(&self) -> Result<()>
    {
        {
            let _guard = self.header_mutex().lock()?;

            let magic = self.load_header(MAGIC);
            if magic != WORLD_MAGIC {
                return Err(Error::Corrupt(format!("Bad world magic {magic:#010x}")));
            }

            let ids = IdTable::new(self);
            let live = ids.live();
            let count = self.object_count();
            if live.len() != count as usize {
                return Err(Error::Corrupt(format!(
                    "{} objects in the ID table, but the count is {count}",
                    live.len(),
                )));
            }

            let size = self.load_header(OBJLIST_SIZE);
            let recycled = ids.recycled()?;
            if recycled + count + 1 != size {
                return Err(Error::Corrupt(format!(
                    "{recycled} recycled and {count} live IDs \
                     do not add up to {size} used slots",
                )));
            }

            for (id, addr) in live {
                let object = self.object_at(addr);
                object.kind()?;
                if object.id() != id {
                    return Err(Error::Corrupt(format!(
                        "Object {addr} has ID {}, but is in slot {id}",
                        object.id(),
                    )));
                }
                if object.refcount() == 0 {
                    return Err(Error::Corrupt(format!("Object {addr} is dead")));
                }
                if object.is_marked() {
                    return Err(Error::Corrupt(format!("Object {addr} is still marked")));
                }
            }
        }

        self.arena.sanity_check()?;
        Ok(())
    }

    /// View the object at an address known to be valid.
    fn object_at(&self, addr: u32) -> Object<'_>
    {
        Object::at(&self.arena, addr, self.config.timeout)
    }

    /// Allocate, initialize, and register a new object.
    ///
    /// The reference count starts at `refcount`,
    /// so that the object is never visible in the ID table
    /// without the reference of its creator.
    fn create_object_raw(&self, init: &Init, refcount: u32) -> Result<u32>
    {
        let kind = init.kind();
        let size = kind.value_words() * WORD_SIZE + OBJECT_HEADER_SIZE;
        let addr = self.arena.alloc(size)?.address();
        let object = self.object_at(addr);
        object.init_header(kind, refcount);

        if let Err(err) = init.initialize(self, &object) {
            self.arena.free(object.ptr())?;
            return Err(err);
        }

        let registered = self.header_mutex().run_exclusive(|| {
            let id = IdTable::new(self).assign(addr)?;
            object.set_tag(id, kind);
            self.store_header(OBJECT_COUNT, self.object_count() + 1);
            Ok(id)
        });

        match registered.and_then(|id| id) {
            Ok(id) => {
                debug!(addr, id, ?kind, "Created object");
                Ok(addr)
            },
            Err(err) => {
                kind.free(&object, &mut Vec::new())?;
                self.arena.free(object.ptr())?;
                Err(err)
            },
        }
    }

    /// Unregister dead objects and free their blocks.
    ///
    /// Their kind-specific resources must have been freed already.
    /// Objects are removed from `dead` once released,
    /// so that a failed call can be retried with what is left.
    /// The header mutex must be held.
    fn release_locked(&self, dead: &mut Vec<u32>) -> Result<()>
    {
        let ids = IdTable::new(self);
        while let Some(&addr) = dead.last() {
            let object = self.object_at(addr);
            let kind = object.kind()?;
            let id = object.id();

            // The block must not be touched once freed or in the dumpster.
            let deferred = kind.requires_deferred_free() && dumpster::push(self, &object)?;
            if !deferred {
                self.arena.free(object.ptr())?;
            }
            dead.pop();

            ids.recycle(id)?;
            self.store_header(OBJECT_COUNT, self.object_count() - 1);
            debug!(addr, id, ?kind, "Freed object");
        }
        Ok(())
    }

    /// Unregister dead objects and free their blocks; see [`release_locked`].
    ///
    /// [`release_locked`]: `Self::release_locked`
    fn release(&self, dead: &mut Vec<u32>) -> Result<()>
    {
        self.header_mutex().run_exclusive(|| self.release_locked(dead))?
    }

    fn header_mutex(&self) -> Mutex<'_>
    {
        Mutex::new(self.header_word(LOCK)).with_timeout(self.config.timeout)
    }

    fn stw_lock(&self) -> RwLock<'_>
    {
        RwLock::new(self.header_word(STW_LOCK)).with_timeout(self.config.timeout)
    }

    fn live_objects(&self) -> Vec<(u32, u32)>
    {
        IdTable::new(self).live()
    }

    fn header_word(&self, field: u32) -> &AtomicU32
    {
        self.arena.region().word(self.header + BLOCK_HEADER_SIZE + field)
    }

    fn load_header(&self, field: u32) -> u32
    {
        self.arena.region().load32(self.header + BLOCK_HEADER_SIZE + field)
    }

    fn store_header(&self, field: u32, value: u32)
    {
        self.arena.region().store32(self.header + BLOCK_HEADER_SIZE + field, value);
    }
}

impl fmt::Debug for World
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("World")
            .field("arena", &self.arena)
            .field("root", &self.root_address())
            .field("object_count", &self.object_count())
            .finish()
    }
}

#[cfg(test)]
mod tests
{
    use {super::*, std::time::Duration};

    fn checked() -> Config
    {
        Config{check_after_mutation: true, ..Config::default()}
    }

    #[test]
    fn create_initializes_root()
    {
        let world = World::create(Config{root_slots: 4, ..checked()}).unwrap();
        assert_eq!(world.object_count(), 1);
        let root = world.object(world.root_address()).unwrap();
        assert_eq!(root.kind().unwrap(), ObjectKind::Node);
        assert_eq!(root.id(), 1);
        assert_eq!(root.refcount(), WORLD_RC_DELTA);
        world.sanity_check().unwrap();
    }

    #[test]
    fn create_rejects_bad_config()
    {
        let config = Config{arena_size: 0, ..Config::default()};
        assert!(matches!(World::create(config), Err(Error::InvalidArgument(..))));
        let config = Config{arena_size: 64, ..Config::default()};
        assert!(matches!(World::create(config), Err(Error::OutOfMemory{..})));
    }

    #[test]
    fn attach_sees_the_same_world()
    {
        let world = World::create(checked()).unwrap();
        let ctx = ThreadContext::new(&world).unwrap();
        let _node = ctx.create_node(2).unwrap();

        let other = World::attach(world.region().clone(), checked()).unwrap();
        assert_eq!(other.object_count(), 2);
        assert_eq!(other.root_address(), world.root_address());
        other.sanity_check().unwrap();
    }

    #[test]
    fn attach_checks_magic()
    {
        let arena = Arena::create(1024).unwrap();
        arena.alloc(WORLD_HEADER_SIZE).unwrap();
        let result = World::attach(arena.region().clone(), Config::default());
        assert!(matches!(result, Err(Error::Corrupt(..))));
    }

    #[test]
    fn object_rejects_non_objects()
    {
        let world = World::create(Config::default()).unwrap();
        let block = world.arena().alloc(40).unwrap();
        assert!(world.object(block.address()).is_err());
        assert!(world.object(12345).is_err());
        assert!(world.object(world.root_address()).is_ok());
    }

    #[test]
    fn sanity_check_detects_bad_count()
    {
        let world = World::create(Config::default()).unwrap();
        world.store_header(OBJECT_COUNT, 7);
        assert!(matches!(world.sanity_check(), Err(Error::Corrupt(..))));
    }

    #[test]
    fn header_lock_times_out()
    {
        let config = Config{timeout: Duration::from_millis(20), ..Config::default()};
        let world = World::create(config).unwrap();
        let _guard = world.header_mutex().lock().unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(matches!(world.sanity_check(), Err(Error::Timeout(..))));
            });
        });
    }
}
