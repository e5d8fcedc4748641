use {
    super::{Arena, BLOCK_HEADER_SIZE},
    crate::{Error, Result, region::WORD_SIZE},
    std::{fmt, sync::atomic::AtomicU32},
};

/// Allocated block in an arena.
///
/// A pointer is the address of a block together with the arena it lives in.
/// Reads and writes take byte offsets into the payload of the block,
/// are bounds-checked against the size that was requested at allocation,
/// and must be naturally aligned.
///
/// Pointers are plain values; they do not keep the block allocated.
/// Using a pointer after its block was freed is not undefined behavior,
/// but reads and writes will hit whatever now occupies that memory.
#[derive(Clone, Copy)]
pub struct Ptr<'a>
{
    pub (super) arena: &'a Arena,
    pub (super) block: u32,
}

impl<'a> Ptr<'a>
{
    /// The arena that owns the block.
    pub fn arena(&self) -> &'a Arena
    {
        self.arena
    }

    /// The address of the block header.
    ///
    /// Use [`Arena::from_address`] to turn it back into a pointer.
    pub fn address(&self) -> u32
    {
        self.block
    }

    /// The address of the first payload byte.
    pub fn payload_address(&self) -> u32
    {
        self.block + BLOCK_HEADER_SIZE
    }

    /// The number of bytes requested when the block was allocated.
    pub fn size(&self) -> u32
    {
        self.arena.region.load32(self.block)
    }

    /// Read the byte at `offset`.
    pub fn read8(&self, offset: u32) -> Result<u8>
    {
        let addr = self.check(offset, 1)?;
        Ok(self.arena.region.load8(addr))
    }

    /// Read the half-word at `offset`.
    pub fn read16(&self, offset: u32) -> Result<u16>
    {
        let addr = self.check(offset, 2)?;
        Ok(self.arena.region.load16(addr))
    }

    /// Read the word at `offset`.
    pub fn read32(&self, offset: u32) -> Result<u32>
    {
        let addr = self.check(offset, WORD_SIZE)?;
        Ok(self.arena.region.load32(addr))
    }

    /// Write the byte at `offset`.
    pub fn write8(&self, offset: u32, value: u8) -> Result<()>
    {
        let addr = self.check(offset, 1)?;
        self.arena.region.store8(addr, value);
        Ok(())
    }

    /// Write the half-word at `offset`.
    pub fn write16(&self, offset: u32, value: u16) -> Result<()>
    {
        let addr = self.check(offset, 2)?;
        self.arena.region.store16(addr, value);
        Ok(())
    }

    /// Write the word at `offset`.
    pub fn write32(&self, offset: u32, value: u32) -> Result<()>
    {
        let addr = self.check(offset, WORD_SIZE)?;
        self.arena.region.store32(addr, value);
        Ok(())
    }

    /// The word at `offset`, for use with atomic operations
    /// or the [`sync`][`crate::sync`] primitives.
    pub fn word(&self, offset: u32) -> Result<&'a AtomicU32>
    {
        let addr = self.check(offset, WORD_SIZE)?;
        Ok(self.arena.region.word(addr))
    }

    /// Read `buf.len()` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: u32, buf: &mut [u8]) -> Result<()>
    {
        let addr = self.check_range(offset, buf.len())?;
        for (i, byte) in (addr ..).zip(buf) {
            *byte = self.arena.region.load8(i);
        }
        Ok(())
    }

    /// Write `bytes` starting at `offset`.
    pub fn write_bytes(&self, offset: u32, bytes: &[u8]) -> Result<()>
    {
        let addr = self.check_range(offset, bytes.len())?;
        for (i, &byte) in (addr ..).zip(bytes) {
            self.arena.region.store8(i, byte);
        }
        Ok(())
    }

    /// Set every byte of the payload to `value`.
    pub fn fill(&self, value: u8) -> Result<()>
    {
        let size = self.size();
        let word = u32::from_ne_bytes([value; 4]);
        let words = size / WORD_SIZE * WORD_SIZE;
        for offset in (0 .. words).step_by(WORD_SIZE as usize) {
            self.write32(offset, word)?;
        }
        for offset in words .. size {
            self.write8(offset, value)?;
        }
        Ok(())
    }

    /// Copy the whole payload of `src` to the start of this payload.
    ///
    /// Fails if `src` is larger than this block.
    pub fn copy_from(&self, src: &Ptr) -> Result<()>
    {
        let len = src.size();
        if len > self.size() {
            return Err(Error::OutOfBounds{offset: len, size: self.size()});
        }
        let words = len / WORD_SIZE * WORD_SIZE;
        for offset in (0 .. words).step_by(WORD_SIZE as usize) {
            self.write32(offset, src.read32(offset)?)?;
        }
        for offset in words .. len {
            self.write8(offset, src.read8(offset)?)?;
        }
        Ok(())
    }

    /// Check an access of `width` bytes at `offset`
    /// and return the region address it corresponds to.
    fn check(&self, offset: u32, width: u32) -> Result<u32>
    {
        if offset % width != 0 {
            return Err(Error::InvalidArgument("Misaligned access"));
        }
        self.check_bounds(offset, width)
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<u32>
    {
        let size = self.size();
        let len = u32::try_from(len)
            .map_err(|_| Error::OutOfBounds{offset, size})?;
        self.check_bounds(offset, len)
    }

    fn check_bounds(&self, offset: u32, width: u32) -> Result<u32>
    {
        let size = self.size();
        match offset.checked_add(width) {
            Some(end) if end <= size => Ok(self.payload_address() + offset),
            _ => Err(Error::OutOfBounds{offset, size}),
        }
    }
}

impl<'a> PartialEq for Ptr<'a>
{
    fn eq(&self, other: &Self) -> bool
    {
        self.block == other.block
            && self.arena.region.same_region(&other.arena.region)
    }
}

impl<'a> Eq for Ptr<'a>
{
}

impl<'a> fmt::Debug for Ptr<'a>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("Ptr")
            .field("address", &self.block)
            .field("size", &self.size())
            .finish()
    }
}
