use {
    super::{Object, World},
    crate::{
        Error,
        Result,
        region::WORD_SIZE,
        sync::{MUTEX_FREE, RWLOCK_FREE},
    },
    smallvec::SmallVec,
};

/// Index of the slot array address in the value words of a node.
///
/// The slot array is an arena block of one word per slot;
/// zero means the node has no slots.
pub (super) const NODE_SLOTS: u32 = 0;

/// Index of the key in the value words of a local object.
pub (super) const LOCAL_KEY: u32 = 0;

/// Index of the owner's thread record in the value words of a local object.
pub (super) const LOCAL_OWNER: u32 = 1;

/// Index of the dumpster link in the value words of a local object.
pub (super) const LOCAL_LINK: u32 = 2;

/// Outgoing references of a single object.
pub type References = SmallVec<[u32; 8]>;

/// The kind of a shared object.
///
/// The kind is stored in the low [`TYPE_BITS`] of the tag word,
/// and decides how many value words the object has,
/// how they are initialized, which of them are references,
/// and what happens when the object is freed.
///
/// [`TYPE_BITS`]: `super::TYPE_BITS`
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum ObjectKind
{
    /// Fixed number of reference slots.
    Node = 1,
    /// A [`Mutex`][`crate::sync::Mutex`] word.
    Lock = 2,
    /// A [`RwLock`][`crate::sync::RwLock`] word.
    RwLock = 3,
    /// A [`Latch`][`crate::sync::Latch`] word.
    Latch = 4,
    /// Thread-local value shared by reference.
    Local = 5,
}

/// Parameters for creating an object of each kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Init
{
    /// A node with the given number of slots, all empty.
    Node
    {
        /// Number of slots.
        slots: u32,
    },

    /// An unlocked lock.
    Lock,

    /// An unlocked reader-writer lock.
    RwLock,

    /// A latch that is released after `count` decrements.
    Latch{count: u32},

    /// A wrapper for a local value of a thread.
    Local
    {
        /// Key of the value in the owner's table of local values.
        key: u32,

        /// Address of the owner's thread record.
        owner: u32,
    },
}

impl ObjectKind
{
    /// Decode the kind bits of a tag word.
    pub fn from_tag(tag: u32) -> Result<Self>
    {
        match tag {
            1 => Ok(Self::Node),
            2 => Ok(Self::Lock),
            3 => Ok(Self::RwLock),
            4 => Ok(Self::Latch),
            5 => Ok(Self::Local),
            _ => Err(Error::Corrupt(format!("Unknown object kind {tag}"))),
        }
    }

    /// Number of value words that precede the object header.
    pub fn value_words(self) -> u32
    {
        match self {
            Self::Node   => 1,
            Self::Lock   => 1,
            Self::RwLock => 1,
            Self::Latch  => 1,
            Self::Local  => 3,
        }
    }

    /// Whether freeing the object must go through its owner's dumpster.
    pub fn requires_deferred_free(self) -> bool
    {
        matches!(self, Self::Local)
    }

    /// The objects referenced by `object`.
    ///
    /// The caller must hold the object lock.
    pub fn enumerate_references(self, object: &Object) -> Result<References>
    {
        let mut references = References::new();
        if let Self::Node = self {
            let slots = object.value(NODE_SLOTS);
            if slots != 0 {
                let slots = object.ptr().arena().from_address(slots)?;
                for offset in (0 .. slots.size()).step_by(WORD_SIZE as usize) {
                    match slots.read32(offset)? {
                        0 => (),
                        target => references.push(target),
                    }
                }
            }
        }
        Ok(references)
    }

    /// Release the resources owned by a dead object.
    ///
    /// The addresses of objects that lose an edge are pushed onto `released`.
    /// The object block itself is not freed.
    pub fn free(self, object: &Object, released: &mut Vec<u32>) -> Result<()>
    {
        if let Self::Node = self {
            let slots = object.value(NODE_SLOTS);
            if slots != 0 {
                let arena = object.ptr().arena();
                let slots = arena.from_address(slots)?;
                for offset in (0 .. slots.size()).step_by(WORD_SIZE as usize) {
                    match slots.read32(offset)? {
                        0 => (),
                        target => released.push(target),
                    }
                }
                arena.free(slots)?;
                object.set_value(NODE_SLOTS, 0);
            }
        }
        Ok(())
    }
}

impl Init
{
    /// The kind of object this creates.
    pub fn kind(&self) -> ObjectKind
    {
        match self {
            Self::Node{..}  => ObjectKind::Node,
            Self::Lock      => ObjectKind::Lock,
            Self::RwLock    => ObjectKind::RwLock,
            Self::Latch{..} => ObjectKind::Latch,
            Self::Local{..} => ObjectKind::Local,
        }
    }

    /// Write the initial value words of a freshly allocated object.
    pub (super) fn initialize(&self, world: &World, object: &Object) -> Result<()>
    {
        match *self {
            Self::Node{slots: 0} =>
                object.set_value(NODE_SLOTS, 0),
            Self::Node{slots} => {
                let size = slots.checked_mul(WORD_SIZE)
                    .ok_or(Error::InvalidArgument("Too many slots"))?;
                let ptr = world.arena().alloc(size)?;
                ptr.fill(0)?;
                object.set_value(NODE_SLOTS, ptr.address());
            },
            Self::Lock =>
                object.set_value(0, MUTEX_FREE),
            Self::RwLock =>
                object.set_value(0, RWLOCK_FREE),
            Self::Latch{count} =>
                object.set_value(0, count),
            Self::Local{key, owner} => {
                object.set_value(LOCAL_KEY, key);
                object.set_value(LOCAL_OWNER, owner);
                object.set_value(LOCAL_LINK, 0);
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn tags_round_trip()
    {
        for kind in [
            ObjectKind::Node,
            ObjectKind::Lock,
            ObjectKind::RwLock,
            ObjectKind::Latch,
            ObjectKind::Local,
        ] {
            assert_eq!(ObjectKind::from_tag(kind as u32).unwrap(), kind);
        }
        assert!(ObjectKind::from_tag(0).is_err());
        assert!(ObjectKind::from_tag(6).is_err());
    }

    #[test]
    fn only_locals_are_deferred()
    {
        assert!(ObjectKind::Local.requires_deferred_free());
        assert!(!ObjectKind::Node.requires_deferred_free());
        assert_eq!(Init::Local{key: 1, owner: 2}.kind(), ObjectKind::Local);
        assert_eq!(Init::Latch{count: 3}.kind(), ObjectKind::Latch);
    }
}
