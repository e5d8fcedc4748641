//! Block allocator over a shared region.
//!
//! # Layout
//!
//! The region starts with an arena header of [`ARENA_HEADER_SIZE`] bytes,
//! holding the following words:
//!
//! | Offset | Field                                      |
//! |--------|--------------------------------------------|
//! | 0      | [`ARENA_MAGIC`]                            |
//! | 4      | Address of the first block on the free list |
//! | 8      | Number of bytes left for allocations        |
//! | 12     | High-water mark                             |
//! | 16     | Lock word, a [`Mutex`]                      |
//! | 20     | Address of the lowest block                 |
//! | 24     | Address of the highest block                |
//! | 28     | Reserved                                    |
//!
//! Blocks follow the header contiguously, up to the high-water mark.
//! Each block is a [`BLOCK_HEADER_SIZE`]-byte header followed by the payload.
//! The first header word is the size of the payload:
//! the requested size for allocated blocks
//! and the rounded size for free blocks.
//! The second header word is the address of the
//! preceding block shifted left by one, with the low bit set for free blocks.
//! Payloads are padded to a multiple of [`ALLOC_GRANULARITY`].
//!
//! Free blocks form a doubly-linked list through the first two words
//! of their payloads (next, then previous), in no particular order.
//! Adjacent free blocks are always merged, and a free block
//! at the end of the arena is returned to the space above the high-water mark.
//! Address zero is the null address; no block can live there.

pub use self::ptr::*;

use {
    crate::{
        Error,
        Region,
        Result,
        region::MAX_REGION_SIZE,
        sync::{DEFAULT_TIMEOUT, Mutex, MutexGuard},
    },
    std::{fmt, time::Duration},
    tracing::debug,
};

mod ptr;

/// Magic number stored in the first word of every arena.
pub const ARENA_MAGIC: u32 = 0xd1ce4011;

/// Number of bytes in the arena header.
pub const ARENA_HEADER_SIZE: u32 = 32;

/// Number of bytes in a block header.
pub const BLOCK_HEADER_SIZE: u32 = 8;

/// Payloads are padded to a multiple of this many bytes.
///
/// This is also the smallest payload,
/// so that every free block can hold its free-list links.
pub const ALLOC_GRANULARITY: u32 = 8;

const MAGIC: u32 = 0;
const FREELIST_HEAD: u32 = 4;
const BYTES_LEFT: u32 = 8;
const HIGH_WATER_MARK: u32 = 12;
const LOCK: u32 = 16;
const LOWEST_BLOCK: u32 = 20;
const HIGHEST_BLOCK: u32 = 24;

const FREE_BIT: u32 = 1;

/// Round a payload size up to the allocation granularity.
pub fn round_up(size: u32) -> Option<u32>
{
    let size = size.checked_add(ALLOC_GRANULARITY - 1)?;
    Some(size & !(ALLOC_GRANULARITY - 1))
}

/// Block allocator over a shared region.
///
/// Any number of arenas may be attached to the same region;
/// all of them see the same blocks.
/// Allocating and freeing take the lock in the arena header,
/// so they may be called concurrently from any thread.
#[derive(Clone)]
pub struct Arena
{
    region: Region,
    timeout: Duration,
}

impl Arena
{
    /// Create a region with room for `size` bytes of blocks
    /// and initialize an empty arena in it.
    ///
    /// `size` excludes the arena header and must be
    /// a non-zero multiple of [`ALLOC_GRANULARITY`].
    pub fn create(size: u32) -> Result<Self>
    {
        if size == 0 || size % ALLOC_GRANULARITY != 0 {
            return Err(Error::InvalidArgument(
                "Arena size must be a non-zero multiple of the granularity",
            ));
        }

        let len = size.checked_add(ARENA_HEADER_SIZE)
            .filter(|&len| len <= MAX_REGION_SIZE)
            .ok_or(Error::InvalidArgument("Arena is too large"))?;

        let region = Region::new(len)?;
        region.store32(MAGIC, ARENA_MAGIC);
        region.store32(FREELIST_HEAD, 0);
        region.store32(BYTES_LEFT, size);
        region.store32(HIGH_WATER_MARK, ARENA_HEADER_SIZE);
        region.store32(LOCK, 0);
        region.store32(LOWEST_BLOCK, 0);
        region.store32(HIGHEST_BLOCK, 0);

        debug!(size, "Created arena");
        Ok(Self{region, timeout: DEFAULT_TIMEOUT})
    }

    /// Attach to an arena that was created in `region` earlier.
    pub fn attach(region: Region) -> Result<Self>
    {
        let len = region.len();
        if len <= ARENA_HEADER_SIZE || len % ALLOC_GRANULARITY != 0 {
            return Err(Error::Corrupt(format!(
                "Region of {len} bytes cannot hold an arena"
            )));
        }

        let magic = region.load32(MAGIC);
        if magic != ARENA_MAGIC {
            return Err(Error::Corrupt(format!(
                "Bad arena magic {magic:#010x}"
            )));
        }

        Ok(Self{region, timeout: DEFAULT_TIMEOUT})
    }

    /// Change the bound on waiting for the arena lock.
    pub fn with_timeout(self, timeout: Duration) -> Self
    {
        Self{timeout, ..self}
    }

    /// The region in which the arena lives.
    pub fn region(&self) -> &Region
    {
        &self.region
    }

    /// The number of bytes available for blocks, including block headers.
    pub fn capacity(&self) -> u32
    {
        self.region.len() - ARENA_HEADER_SIZE
    }

    /// The number of bytes not taken by allocated blocks.
    ///
    /// Because of fragmentation,
    /// an allocation of this many bytes may still fail.
    pub fn bytes_left(&self) -> u32
    {
        self.region.load32(BYTES_LEFT)
    }

    /// Allocate a block with a payload of at least `size` bytes.
    ///
    /// The contents of the payload are unspecified.
    pub fn alloc(&self, size: u32) -> Result<Ptr<'_>>
    {
        if size == 0 {
            return Err(Error::InvalidArgument("Cannot allocate zero bytes"));
        }
        let extent = round_up(size)
            .ok_or(Error::InvalidArgument("Allocation size is too large"))?;

        let _guard = self.lock()?;

        let block = match self.take_free(extent) {
            Some(block) => block,
            None => self.bump(extent)
                .ok_or(Error::OutOfMemory{requested: size})?,
        };

        self.region.store32(block, size);
        let bytes_left = self.region.load32(BYTES_LEFT) - extent - BLOCK_HEADER_SIZE;
        self.region.store32(BYTES_LEFT, bytes_left);

        Ok(Ptr{arena: self, block})
    }

    /// Return a block to the arena.
    pub fn free(&self, ptr: Ptr) -> Result<()>
    {
        if !self.region.same_region(&ptr.arena.region) {
            return Err(Error::InvalidArgument("Pointer belongs to another arena"));
        }

        let _guard = self.lock()?;

        let block = ptr.block;
        if !self.is_block_address(block) {
            return Err(Error::InvalidArgument("Address does not name a block"));
        }
        if self.is_free(block) {
            return Err(Error::InvalidArgument("Block is already free"));
        }

        let size = self.region.load32(block);
        let extent = round_up(size)
            .ok_or_else(|| Error::Corrupt(format!("Block {block} has size {size}")))?;
        let bytes_left = self.region.load32(BYTES_LEFT) + extent + BLOCK_HEADER_SIZE;
        self.region.store32(BYTES_LEFT, bytes_left);

        self.region.store32(block, extent);
        self.set_prev(block, self.prev(block), true);
        self.push_free(block);
        debug!(block, size, "Freed block");

        let mut block = block;

        // Coalesce with the following blocks.
        while block != self.region.load32(HIGHEST_BLOCK) {
            let next = self.next(block);
            if !self.is_free(next) {
                break;
            }
            self.merge(block, next);
        }

        // Coalesce with the preceding blocks.
        loop {
            let prev = self.prev(block);
            if prev == 0 || !self.is_free(prev) {
                break;
            }
            self.merge(prev, block);
            block = prev;
        }

        // Give the end of the arena back to the bump allocator.
        if block == self.region.load32(HIGHEST_BLOCK) {
            self.unlink_free(block);
            let prev = self.prev(block);
            self.region.store32(HIGH_WATER_MARK, block);
            self.region.store32(HIGHEST_BLOCK, prev);
            if prev == 0 {
                self.region.store32(LOWEST_BLOCK, 0);
            }
            debug!(high_water_mark = block, "Retreated high-water mark");
        }

        Ok(())
    }

    /// The address of a block, checking that it belongs to this arena.
    pub fn address_of(&self, ptr: Ptr) -> Result<u32>
    {
        if !self.region.same_region(&ptr.arena.region) {
            return Err(Error::InvalidArgument("Pointer belongs to another arena"));
        }
        Ok(ptr.block)
    }

    /// Recover a pointer from the address of an allocated block.
    pub fn from_address(&self, addr: u32) -> Result<Ptr<'_>>
    {
        let _guard = self.lock()?;
        if !self.is_block_address(addr) || self.is_free(addr) {
            return Err(Error::InvalidArgument("Address does not name a block"));
        }
        Ok(Ptr{arena: self, block: addr})
    }

    /// Pointer to a block whose address is known to be valid.
    pub (crate) fn ptr_at(&self, block: u32) -> Ptr<'_>
    {
        Ptr{arena: self, block}
    }

    /// Check the structure of the arena.
    ///
    /// On success, returns the size word of every block in address order.
    /// This is the requested size for allocated blocks
    /// and the rounded size for free blocks.
    pub fn sanity_check(&self) -> Result<Vec<u32>>
    {
        let _guard = self.lock()?;

        let corrupt = |message: String| Err(Error::Corrupt(message));

        let high_water_mark = self.region.load32(HIGH_WATER_MARK);
        let lowest = self.region.load32(LOWEST_BLOCK);
        let highest = self.region.load32(HIGHEST_BLOCK);
        let bytes_left = self.region.load32(BYTES_LEFT);

        if high_water_mark < ARENA_HEADER_SIZE
            || high_water_mark > self.region.len()
            || high_water_mark % ALLOC_GRANULARITY != 0 {
            return corrupt(format!("Bad high-water mark {high_water_mark}"));
        }

        let expected_lowest =
            if high_water_mark == ARENA_HEADER_SIZE { 0 } else { ARENA_HEADER_SIZE };
        if lowest != expected_lowest {
            return corrupt(format!(
                "Lowest block is {lowest}, expected {expected_lowest}"
            ));
        }

        let mut sizes = Vec::new();
        let mut used = 0u32;
        let mut free_blocks = 0usize;
        let mut prev = 0;
        let mut prev_free = false;
        let mut block = ARENA_HEADER_SIZE;

        while block < high_water_mark {
            if block + BLOCK_HEADER_SIZE > high_water_mark {
                return corrupt(format!("Block {block} crosses the high-water mark"));
            }

            let size = self.region.load32(block);
            let free = self.is_free(block);

            if self.prev(block) != prev {
                return corrupt(format!(
                    "Block {block} links to {}, expected {prev}",
                    self.prev(block),
                ));
            }

            let extent = if free {
                if prev_free {
                    return corrupt(format!("Adjacent free blocks {prev} and {block}"));
                }
                if size < ALLOC_GRANULARITY || size % ALLOC_GRANULARITY != 0 {
                    return corrupt(format!("Free block {block} has size {size}"));
                }
                free_blocks += 1;
                size
            } else {
                let extent = round_up(size).filter(|_| size != 0);
                let Some(extent) = extent
                    else { return corrupt(format!("Block {block} has size {size}")) };
                used += extent + BLOCK_HEADER_SIZE;
                extent
            };

            sizes.push(size);
            prev = block;
            prev_free = free;
            block = match block.checked_add(BLOCK_HEADER_SIZE + extent) {
                Some(next) => next,
                None => return corrupt(format!("Block {block} overflows")),
            };
        }

        if block != high_water_mark {
            return corrupt(format!(
                "Blocks end at {block}, but the high-water mark is {high_water_mark}"
            ));
        }
        if highest != prev {
            return corrupt(format!("Highest block is {highest}, expected {prev}"));
        }
        if prev_free {
            return corrupt(format!("Highest block {prev} is free"));
        }

        let mut listed = 0usize;
        let mut back = 0;
        let mut current = self.region.load32(FREELIST_HEAD);
        while current != 0 {
            listed += 1;
            if listed > free_blocks {
                return corrupt(String::from("Free list has more entries than free blocks"));
            }
            if !self.is_block_address(current) || !self.is_free(current) {
                return corrupt(format!("Free list contains non-free block {current}"));
            }
            if self.free_prev(current) != back {
                return corrupt(format!("Free list entry {current} has bad back link"));
            }
            back = current;
            current = self.free_next(current);
        }
        if listed != free_blocks {
            return corrupt(format!(
                "Free list has {listed} entries, but there are {free_blocks} free blocks"
            ));
        }

        if bytes_left.checked_add(used) != Some(self.capacity()) {
            return corrupt(format!(
                "{bytes_left} bytes left and {used} bytes used \
                 do not add up to capacity {}",
                self.capacity(),
            ));
        }

        Ok(sizes)
    }

    /// Lock the arena; see the lock order of [`World`].
    ///
    /// [`World`]: `crate::World`
    pub (crate) fn lock(&self) -> Result<MutexGuard<'_>>
    {
        Mutex::new(self.region.word(LOCK))
            .with_timeout(self.timeout)
            .lock()
    }

    /// Find a free block for a payload of `extent` bytes
    /// and remove it from the free list, splitting it if it is too big.
    fn take_free(&self, extent: u32) -> Option<u32>
    {
        let mut block = self.region.load32(FREELIST_HEAD);
        while block != 0 {
            let available = self.region.load32(block);

            if available == extent {
                self.unlink_free(block);
                self.set_prev(block, self.prev(block), false);
                debug!(block, extent, "Allocated block from free list");
                return Some(block);
            }

            let spare = available.checked_sub(BLOCK_HEADER_SIZE + ALLOC_GRANULARITY);
            if spare.map_or(false, |spare| spare >= extent) {
                self.unlink_free(block);
                self.set_prev(block, self.prev(block), false);

                let tail = block + BLOCK_HEADER_SIZE + extent;
                let tail_extent = available - extent - BLOCK_HEADER_SIZE;
                self.region.store32(tail, tail_extent);
                self.set_prev(tail, block, true);
                self.push_free(tail);

                if self.region.load32(HIGHEST_BLOCK) == block {
                    self.region.store32(HIGHEST_BLOCK, tail);
                } else {
                    let after = self.next(tail);
                    self.set_prev(after, tail, self.is_free(after));
                }

                debug!(block, extent, tail, tail_extent, "Allocated block by splitting");
                return Some(block);
            }

            block = self.free_next(block);
        }
        None
    }

    /// Allocate a block above the high-water mark.
    fn bump(&self, extent: u32) -> Option<u32>
    {
        let block = self.region.load32(HIGH_WATER_MARK);
        let end = block.checked_add(BLOCK_HEADER_SIZE)?.checked_add(extent)?;
        if end > self.region.len() {
            return None;
        }

        let highest = self.region.load32(HIGHEST_BLOCK);
        self.set_prev(block, highest, false);
        self.region.store32(HIGHEST_BLOCK, block);
        if self.region.load32(LOWEST_BLOCK) == 0 {
            self.region.store32(LOWEST_BLOCK, block);
        }
        self.region.store32(HIGH_WATER_MARK, end);

        debug!(block, extent, "Allocated block by expansion");
        Some(block)
    }

    /// Merge the free block `upper` into the free block `lower` before it.
    fn merge(&self, lower: u32, upper: u32)
    {
        self.unlink_free(upper);
        let extent = self.region.load32(lower)
            + BLOCK_HEADER_SIZE
            + self.region.load32(upper);
        self.region.store32(lower, extent);

        if self.region.load32(HIGHEST_BLOCK) == upper {
            self.region.store32(HIGHEST_BLOCK, lower);
        } else {
            let after = self.next(lower);
            self.set_prev(after, lower, self.is_free(after));
        }
    }

    /// Whether `addr` could be the address of a block.
    ///
    /// This only checks that the address is in range, that it is aligned,
    /// and that its prev-pointer is consistent with its neighbours.
    fn is_block_address(&self, addr: u32) -> bool
    {
        if addr < ARENA_HEADER_SIZE
            || addr >= self.region.load32(HIGH_WATER_MARK)
            || addr % ALLOC_GRANULARITY != 0 {
            return false;
        }
        match self.prev(addr) {
            0    => addr == self.region.load32(LOWEST_BLOCK),
            prev => prev < addr
                && prev % ALLOC_GRANULARITY == 0
                && prev >= ARENA_HEADER_SIZE
                && self.next(prev) == addr,
        }
    }

    /// The extent of a block, whether it is free or not.
    fn extent(&self, block: u32) -> u32
    {
        let size = self.region.load32(block);
        if self.is_free(block) {
            size
        } else {
            // Sizes of allocated blocks were rounded once already.
            round_up(size).unwrap_or(size)
        }
    }

    fn next(&self, block: u32) -> u32
    {
        block + BLOCK_HEADER_SIZE + self.extent(block)
    }

    fn prev(&self, block: u32) -> u32
    {
        self.region.load32(block + 4) >> 1
    }

    fn is_free(&self, block: u32) -> bool
    {
        self.region.load32(block + 4) & FREE_BIT != 0
    }

    fn set_prev(&self, block: u32, prev: u32, free: bool)
    {
        self.region.store32(block + 4, prev << 1 | u32::from(free));
    }

    fn free_next(&self, block: u32) -> u32
    {
        self.region.load32(block + BLOCK_HEADER_SIZE)
    }

    fn free_prev(&self, block: u32) -> u32
    {
        self.region.load32(block + BLOCK_HEADER_SIZE + 4)
    }

    fn push_free(&self, block: u32)
    {
        let head = self.region.load32(FREELIST_HEAD);
        self.region.store32(block + BLOCK_HEADER_SIZE, head);
        self.region.store32(block + BLOCK_HEADER_SIZE + 4, 0);
        if head != 0 {
            self.region.store32(head + BLOCK_HEADER_SIZE + 4, block);
        }
        self.region.store32(FREELIST_HEAD, block);
    }

    fn unlink_free(&self, block: u32)
    {
        let next = self.free_next(block);
        let prev = self.free_prev(block);
        if prev == 0 {
            self.region.store32(FREELIST_HEAD, next);
        } else {
            self.region.store32(prev + BLOCK_HEADER_SIZE, next);
        }
        if next != 0 {
            self.region.store32(next + BLOCK_HEADER_SIZE + 4, prev);
        }
    }
}

impl fmt::Debug for Arena
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("Arena")
            .field("region", &self.region)
            .field("bytes_left", &self.bytes_left())
            .field("high_water_mark", &self.region.load32(HIGH_WATER_MARK))
            .finish()
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        proptest::{collection::vec, prelude::*},
        std::thread,
    };

    #[test]
    fn split_scenario()
    {
        let arena = Arena::create(160).unwrap();
        let a = arena.alloc(128).unwrap();
        let _b = arena.alloc(16).unwrap();
        assert_eq!(arena.sanity_check().unwrap(), [128, 16]);
        assert_eq!(arena.bytes_left(), 0);

        arena.free(a).unwrap();
        assert_eq!(arena.sanity_check().unwrap(), [128, 16]);
        let bytes_left = arena.bytes_left();

        let c = arena.alloc(48).unwrap();
        assert_eq!(arena.sanity_check().unwrap(), [48, 72, 16]);

        let d = arena.alloc(48).unwrap();
        assert_eq!(arena.sanity_check().unwrap(), [48, 48, 16, 16]);

        // Freeing both halves merges them with the remainder again.
        arena.free(c).unwrap();
        assert_eq!(arena.sanity_check().unwrap(), [48, 48, 16, 16]);
        arena.free(d).unwrap();
        assert_eq!(arena.sanity_check().unwrap(), [128, 16]);
        assert_eq!(arena.bytes_left(), bytes_left);
    }

    #[test]
    fn exact_fit_is_reused()
    {
        let arena = Arena::create(1024).unwrap();
        let a = arena.alloc(24).unwrap();
        let _b = arena.alloc(8).unwrap();
        let address = a.address();
        arena.free(a).unwrap();
        let c = arena.alloc(20).unwrap();
        assert_eq!(c.address(), address);
        assert_eq!(c.size(), 20);
        assert_eq!(arena.sanity_check().unwrap(), [20, 8]);
    }

    #[test]
    fn neighbours_coalesce()
    {
        let arena = Arena::create(1024).unwrap();
        let a = arena.alloc(8).unwrap();
        let b = arena.alloc(8).unwrap();
        let c = arena.alloc(8).unwrap();
        let _d = arena.alloc(8).unwrap();

        arena.free(a).unwrap();
        arena.free(c).unwrap();
        assert_eq!(arena.sanity_check().unwrap(), [8, 8, 8, 8]);

        // b merges with both neighbours.
        arena.free(b).unwrap();
        assert_eq!(arena.sanity_check().unwrap(), [40, 8]);
    }

    #[test]
    fn freeing_the_end_retreats()
    {
        let arena = Arena::create(1024).unwrap();
        let a = arena.alloc(100).unwrap();
        let b = arena.alloc(100).unwrap();
        arena.free(b).unwrap();
        assert_eq!(arena.sanity_check().unwrap(), [100]);
        arena.free(a).unwrap();
        assert_eq!(arena.sanity_check().unwrap(), Vec::<u32>::new());
        assert_eq!(arena.bytes_left(), arena.capacity());
    }

    #[test]
    fn out_of_memory()
    {
        let arena = Arena::create(64).unwrap();
        arena.alloc(56).unwrap();
        assert!(matches!(arena.alloc(1), Err(Error::OutOfMemory{requested: 1})));
        arena.sanity_check().unwrap();
    }

    #[test]
    fn invalid_sizes()
    {
        assert!(Arena::create(0).is_err());
        assert!(Arena::create(12).is_err());
        let arena = Arena::create(64).unwrap();
        assert!(matches!(arena.alloc(0), Err(Error::InvalidArgument(..))));
        assert!(matches!(arena.alloc(u32::MAX), Err(Error::InvalidArgument(..))));
    }

    #[test]
    fn double_free()
    {
        let arena = Arena::create(64).unwrap();
        let a = arena.alloc(8).unwrap();
        let _b = arena.alloc(8).unwrap();
        arena.free(a).unwrap();
        assert!(matches!(arena.free(a), Err(Error::InvalidArgument(..))));
    }

    #[test]
    fn foreign_pointer()
    {
        let one = Arena::create(64).unwrap();
        let two = Arena::create(64).unwrap();
        let a = one.alloc(8).unwrap();
        assert!(matches!(two.free(a), Err(Error::InvalidArgument(..))));
        assert!(two.address_of(a).is_err());
        assert_eq!(one.address_of(a).unwrap(), a.address());
    }

    #[test]
    fn bounds_and_alignment()
    {
        let arena = Arena::create(64).unwrap();
        let a = arena.alloc(6).unwrap();
        a.write16(4, 0xBEEF).unwrap();
        assert_eq!(a.read16(4).unwrap(), 0xBEEF);
        assert!(matches!(a.read32(4), Err(Error::OutOfBounds{offset: 4, size: 6})));
        assert!(matches!(a.read16(6), Err(Error::OutOfBounds{..})));
        assert!(matches!(a.read16(1), Err(Error::InvalidArgument(..))));
        assert!(matches!(a.write32(2, 0), Err(Error::InvalidArgument(..))));
        assert!(a.write8(5, 1).is_ok());
        assert!(a.write8(6, 1).is_err());
    }

    #[test]
    fn byte_helpers()
    {
        let arena = Arena::create(128).unwrap();
        let a = arena.alloc(7).unwrap();
        let b = arena.alloc(9).unwrap();
        a.write_bytes(0, b"nostrum").unwrap();
        b.fill(0xAA).unwrap();
        b.copy_from(&a).unwrap();
        let mut buf = [0; 9];
        b.read_bytes(0, &mut buf).unwrap();
        assert_eq!(&buf, b"nostrum\xAA\xAA");
        assert!(a.copy_from(&b).is_err());
        assert!(a.write_bytes(4, b"long").is_err());
    }

    #[test]
    fn from_address()
    {
        let arena = Arena::create(256).unwrap();
        let a = arena.alloc(16).unwrap();
        let b = arena.alloc(16).unwrap();
        let _c = arena.alloc(16).unwrap();
        assert_eq!(arena.from_address(b.address()).unwrap(), b);
        assert!(arena.from_address(0).is_err());
        assert!(arena.from_address(b.address() + 4).is_err());
        assert!(arena.from_address(b.address() + 8).is_err());
        assert!(arena.from_address(4096).is_err());
        arena.free(a).unwrap();
        assert!(arena.from_address(a.address()).is_err());
    }

    #[test]
    fn attach()
    {
        let arena = Arena::create(64).unwrap();
        let a = arena.alloc(8).unwrap();
        a.write32(0, 42).unwrap();

        let other = Arena::attach(arena.region().clone()).unwrap();
        let b = other.from_address(a.address()).unwrap();
        assert_eq!(b.read32(0).unwrap(), 42);

        let blank = Region::new(64).unwrap();
        assert!(matches!(Arena::attach(blank), Err(Error::Corrupt(..))));
        assert!(Arena::attach(Region::new(16).unwrap()).is_err());
    }

    #[test]
    fn sanity_check_detects_corruption()
    {
        let arena = Arena::create(64).unwrap();
        let a = arena.alloc(8).unwrap();
        arena.region().store32(a.address() + 4, 12 << 1);
        assert!(matches!(arena.sanity_check(), Err(Error::Corrupt(..))));
    }

    #[test]
    fn parallel_stress()
    {
        const THREADS: u32 = 4;
        const ROUNDS: u32 = 300;

        let arena = Arena::create(256 * 1024).unwrap()
            .with_timeout(Duration::from_secs(10));

        thread::scope(|s| {
            for t in 0 .. THREADS {
                let arena = &arena;
                s.spawn(move || {
                    let mut live = Vec::new();
                    for round in 0 .. ROUNDS {
                        let size = 4 + (round * 7 + t * 13) % 120 / 4 * 4;
                        let ptr = arena.alloc(size).unwrap();
                        ptr.write32(0, t << 16 | round).unwrap();
                        live.push((ptr, t << 16 | round));
                        if round % 3 == 0 {
                            let (ptr, tag) = live.swap_remove(live.len() / 2);
                            assert_eq!(ptr.read32(0).unwrap(), tag);
                            arena.free(ptr).unwrap();
                        }
                    }
                    for (ptr, tag) in live {
                        assert_eq!(ptr.read32(0).unwrap(), tag);
                        arena.free(ptr).unwrap();
                    }
                });
            }
        });

        assert_eq!(arena.sanity_check().unwrap(), Vec::<u32>::new());
        assert_eq!(arena.bytes_left(), arena.capacity());
    }

    #[derive(Clone, Debug)]
    enum Op
    {
        Alloc(u32),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op>
    {
        prop_oneof![
            (1u32 .. 200).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest!
    {
        #[test]
        fn alloc_free_round_trip(ops in vec(op(), 0 .. 64))
        {
            let arena = Arena::create(4096).unwrap();
            let mut live: Vec<(Ptr, u8)> = Vec::new();

            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Alloc(size) => match arena.alloc(size) {
                        Ok(ptr) => {
                            prop_assert_eq!(ptr.size(), size);
                            ptr.fill(i as u8).unwrap();
                            live.push((ptr, i as u8));
                        },
                        Err(Error::OutOfMemory{..}) => (),
                        Err(err) => panic!("{err}"),
                    },
                    Op::Free(index) if !live.is_empty() => {
                        let (ptr, fill) = live.swap_remove(index % live.len());
                        for offset in 0 .. ptr.size() {
                            prop_assert_eq!(ptr.read8(offset).unwrap(), fill);
                        }
                        arena.free(ptr).unwrap();
                    },
                    Op::Free(..) => (),
                }

                let sizes = arena.sanity_check().unwrap();
                prop_assert!(sizes.len() >= live.len());
            }

            for (ptr, _) in live {
                arena.free(ptr).unwrap();
            }
            prop_assert_eq!(arena.sanity_check().unwrap(), Vec::<u32>::new());
            prop_assert_eq!(arena.bytes_left(), arena.capacity());
        }
    }
}
