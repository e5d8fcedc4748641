use {
    super::ObjectKind,
    crate::{
        Arena,
        Error,
        Ptr,
        Result,
        arena::BLOCK_HEADER_SIZE,
        region::WORD_SIZE,
        sync::Mutex,
    },
    std::{
        fmt,
        sync::atomic::{AtomicU32, Ordering::SeqCst},
        time::Duration,
    },
};

/// Number of low bits of the tag word that hold the kind.
pub const TYPE_BITS: u32 = 4;

/// Largest object ID that fits in the tag word.
pub const MAX_OBJECT_ID: u32 = (1 << (32 - TYPE_BITS)) - 1;

/// Number of bytes in the header at the end of every object.
pub const OBJECT_HEADER_SIZE: u32 = 12;

/// Reference count contributed by an edge from another object.
pub const WORLD_RC_DELTA: u32 = 1;

/// Reference count contributed by a thread holding handles.
pub const THREAD_RC_DELTA: u32 = 1 << THREAD_SHIFT;

/// Largest number of edges to a single object.
///
/// Edges are counted in the bits below [`THREAD_RC_DELTA`],
/// and must never carry into the thread count.
pub const MAX_EDGES: u32 = THREAD_RC_DELTA - 1;

/// Bit of the reference count word used by the collector to mark objects.
pub const GC_MARK_BIT: u32 = 1 << 31;

/// Bits of the reference count word that hold the count.
pub const RC_MASK: u32 = !GC_MARK_BIT;

const THREAD_SHIFT: u32 = 16;

const TAG: u32 = 0;
const LOCK: u32 = 4;
const REFCOUNT: u32 = 8;

/// View of a shared object in an arena.
///
/// An object is an arena block whose payload consists of
/// the value words of its kind followed by the object header:
/// the tag word (`id << TYPE_BITS | kind`), the object lock,
/// and the reference count.
/// Because the header is at the end, it can be found from the block size
/// without knowing the kind.
///
/// Like [`Ptr`], this is a plain view and does not keep the object alive.
#[derive(Clone, Copy)]
pub struct Object<'a>
{
    arena: &'a Arena,
    block: u32,
    timeout: Duration,
}

impl<'a> Object<'a>
{
    pub (super) fn at(arena: &'a Arena, block: u32, timeout: Duration) -> Self
    {
        Self{arena, block, timeout}
    }

    /// The address of the object, which is the address of its block.
    pub fn address(&self) -> u32
    {
        self.block
    }

    /// The arena block holding the object.
    pub fn ptr(&self) -> Ptr<'a>
    {
        self.arena.ptr_at(self.block)
    }

    /// The kind of the object.
    pub fn kind(&self) -> Result<ObjectKind>
    {
        ObjectKind::from_tag(self.tag() & ((1 << TYPE_BITS) - 1))
    }

    /// The ID of the object.
    pub fn id(&self) -> u32
    {
        self.tag() >> TYPE_BITS
    }

    pub (super) fn set_tag(&self, id: u32, kind: ObjectKind)
    {
        self.header_word(TAG).store(id << TYPE_BITS | kind as u32, SeqCst);
    }

    /// The per-object lock.
    ///
    /// It protects the value words of kinds that store references.
    pub fn lock(&self) -> Mutex<'a>
    {
        Mutex::new(self.header_word(LOCK)).with_timeout(self.timeout)
    }

    /// The reference count, without the mark bit.
    pub fn refcount(&self) -> u32
    {
        self.header_word(REFCOUNT).load(SeqCst) & RC_MASK
    }

    /// Whether the collector has marked the object.
    pub fn is_marked(&self) -> bool
    {
        self.header_word(REFCOUNT).load(SeqCst) & GC_MARK_BIT != 0
    }

    /// The `i`th value word.
    pub fn value_word(&self, i: u32) -> &'a AtomicU32
    {
        self.arena.region().word(self.payload() + i * WORD_SIZE)
    }

    /// Load the `i`th value word.
    pub fn value(&self, i: u32) -> u32
    {
        self.value_word(i).load(SeqCst)
    }

    /// Store the `i`th value word.
    pub fn set_value(&self, i: u32, value: u32)
    {
        self.value_word(i).store(value, SeqCst);
    }

    /// Write a fresh header, with the object not yet in the ID table.
    pub (super) fn init_header(&self, kind: ObjectKind, refcount: u32)
    {
        self.set_tag(0, kind);
        self.header_word(LOCK).store(0, SeqCst);
        self.header_word(REFCOUNT).store(refcount, SeqCst);
    }

    /// Add `delta` to the reference count.
    ///
    /// The caller must already hold a path that keeps the object alive.
    /// Fails if the object would get more than [`MAX_EDGES`] edges.
    pub (super) fn retain(&self, delta: u32) -> Result<()>
    {
        self.header_word(REFCOUNT)
            .fetch_update(SeqCst, SeqCst, |word| add_count(word, delta))
            .map(drop)
            .map_err(|_| Error::InvalidArgument("Too many references to object"))
    }

    /// Add `delta` to the reference count unless it is zero.
    ///
    /// Returns whether the count was changed.
    pub (super) fn try_retain(&self, delta: u32) -> Result<bool>
    {
        let result = self.header_word(REFCOUNT)
            .fetch_update(SeqCst, SeqCst, |word| match word & RC_MASK {
                0 => None,
                _ => add_count(word, delta),
            });
        match result {
            Ok(_) => Ok(true),
            Err(word) if word & RC_MASK == 0 => Ok(false),
            Err(..) => Err(Error::InvalidArgument("Too many references to object")),
        }
    }

    /// Subtract `delta` from the reference count.
    ///
    /// Returns whether the count reached zero.
    pub (super) fn release(&self, delta: u32) -> Result<bool>
    {
        self.header_word(REFCOUNT)
            .fetch_update(SeqCst, SeqCst, |word| {
                let count = word & RC_MASK;
                let edges = (count & MAX_EDGES).checked_sub(delta & MAX_EDGES)?;
                let threads = (count >> THREAD_SHIFT).checked_sub(delta >> THREAD_SHIFT)?;
                Some(word & GC_MARK_BIT | threads << THREAD_SHIFT | edges)
            })
            .map(|old| old & RC_MASK == delta)
            .map_err(|_| self.corrupt("Reference count underflow"))
    }

    /// Set the mark bit, returning whether it was clear before.
    pub (super) fn mark(&self) -> bool
    {
        self.header_word(REFCOUNT).fetch_or(GC_MARK_BIT, SeqCst) & GC_MARK_BIT == 0
    }

    pub (super) fn unmark(&self)
    {
        self.header_word(REFCOUNT).fetch_and(RC_MASK, SeqCst);
    }

    fn tag(&self) -> u32
    {
        self.header_word(TAG).load(SeqCst)
    }

    fn payload(&self) -> u32
    {
        self.block + BLOCK_HEADER_SIZE
    }

    fn header_word(&self, offset: u32) -> &'a AtomicU32
    {
        let size = self.arena.region().load32(self.block);
        let header = self.payload() + size - OBJECT_HEADER_SIZE;
        self.arena.region().word(header + offset)
    }

    fn corrupt(&self, what: &str) -> Error
    {
        Error::Corrupt(format!("{what} on object {}", self.block))
    }
}

/// Add `delta` to the reference count word,
/// unless the edge or thread count would overflow its bits.
fn add_count(word: u32, delta: u32) -> Option<u32>
{
    let count = word & RC_MASK;
    let edges = (count & MAX_EDGES) + (delta & MAX_EDGES);
    let threads = (count >> THREAD_SHIFT) + (delta >> THREAD_SHIFT);
    if edges > MAX_EDGES || threads > RC_MASK >> THREAD_SHIFT {
        return None;
    }
    Some(word & GC_MARK_BIT | threads << THREAD_SHIFT | edges)
}

impl<'a> fmt::Debug for Object<'a>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("Object")
            .field("address", &self.block)
            .field("id", &self.id())
            .field("kind", &self.kind().ok())
            .field("refcount", &self.refcount())
            .finish()
    }
}
