//! Raw memory shared between threads.

use {
    crate::{Error, Result},
    std::{
        fmt,
        sync::{Arc, atomic::{AtomicU32, Ordering::Relaxed}},
    },
};

/// Number of bytes in a word.
pub const WORD_SIZE: u32 = 4;

/// Largest supported region, in bytes.
///
/// Block headers store addresses shifted left by one bit,
/// so every address must fit in 31 bits.
pub const MAX_REGION_SIZE: u32 = 1 << 31;

/// Fixed-size memory addressable by byte offset.
///
/// A region is a sequence of 32-bit words.
/// Cloning a region creates another handle to the same memory;
/// this is how threads join an existing arena.
///
/// Every access is atomic.
/// Word accesses map directly onto an [`AtomicU32`].
/// Byte and half-word writes are read-modify-write operations
/// on the containing word, so that concurrent writes
/// to neighbouring bytes never clobber each other.
/// Plain loads and stores are relaxed;
/// ordering is established by the locks built on top of the region.
#[derive(Clone)]
pub struct Region
{
    words: Arc<[AtomicU32]>,
}

impl Region
{
    /// Allocate a zeroed region of `len` bytes.
    ///
    /// `len` must be a non-zero multiple of [`WORD_SIZE`]
    /// no greater than [`MAX_REGION_SIZE`].
    pub fn new(len: u32) -> Result<Self>
    {
        if len == 0 || len % WORD_SIZE != 0 {
            return Err(Error::InvalidArgument(
                "Region size must be a non-zero multiple of the word size",
            ));
        }
        if len > MAX_REGION_SIZE {
            return Err(Error::InvalidArgument("Region is too large"));
        }
        let words = (0 .. len / WORD_SIZE).map(|_| AtomicU32::new(0)).collect();
        Ok(Self{words})
    }

    /// The size of the region in bytes.
    pub fn len(&self) -> u32
    {
        // Cannot overflow; see Region::new.
        self.words.len() as u32 * WORD_SIZE
    }

    /// Whether two handles refer to the same memory.
    pub fn same_region(&self, other: &Region) -> bool
    {
        Arc::ptr_eq(&self.words, &other.words)
    }

    /// The word at byte address `addr`.
    ///
    /// # Panics
    ///
    /// If `addr` is not a multiple of [`WORD_SIZE`]
    /// or lies outside the region.
    /// Addresses handed out by the arena are always valid;
    /// user-supplied addresses are validated before they get here.
    pub fn word(&self, addr: u32) -> &AtomicU32
    {
        assert_eq!(addr % WORD_SIZE, 0, "Misaligned word address {addr}");
        &self.words[(addr / WORD_SIZE) as usize]
    }

    /// Load the word at `addr`.
    pub fn load32(&self, addr: u32) -> u32
    {
        self.word(addr).load(Relaxed)
    }

    /// Store the word at `addr`.
    pub fn store32(&self, addr: u32, value: u32)
    {
        self.word(addr).store(value, Relaxed);
    }

    /// Load the half-word at `addr`, which must be even.
    pub fn load16(&self, addr: u32) -> u16
    {
        debug_assert_eq!(addr % 2, 0);
        let (word, shift) = self.split(addr);
        (word.load(Relaxed) >> shift) as u16
    }

    /// Store the half-word at `addr`, which must be even.
    pub fn store16(&self, addr: u32, value: u16)
    {
        debug_assert_eq!(addr % 2, 0);
        self.store_masked(addr, 0xFFFF, value.into());
    }

    /// Load the byte at `addr`.
    pub fn load8(&self, addr: u32) -> u8
    {
        let (word, shift) = self.split(addr);
        (word.load(Relaxed) >> shift) as u8
    }

    /// Store the byte at `addr`.
    pub fn store8(&self, addr: u32, value: u8)
    {
        self.store_masked(addr, 0xFF, value.into());
    }

    /// Find the word that contains `addr`, and the bit offset within it.
    ///
    /// Bytes are numbered little-endian within a word,
    /// independent of the host byte order.
    fn split(&self, addr: u32) -> (&AtomicU32, u32)
    {
        let word = self.word(addr & !(WORD_SIZE - 1));
        let shift = (addr % WORD_SIZE) * 8;
        (word, shift)
    }

    fn store_masked(&self, addr: u32, mask: u32, value: u32)
    {
        let (word, shift) = self.split(addr);
        let mask = mask << shift;
        let value = value << shift;
        // The closure always returns Some, so this cannot fail.
        let _ = word.fetch_update(Relaxed, Relaxed, |old| {
            Some(old & !mask | value)
        });
    }
}

impl fmt::Debug for Region
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("Region")
            .field("ptr", &self.words.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}
