use {
    super::{MAX_OBJECT_ID, OBJLIST_ADDR, OBJLIST_CAPACITY, OBJLIST_FREE, OBJLIST_SIZE, World},
    crate::{Error, Result, arena::BLOCK_HEADER_SIZE, region::WORD_SIZE},
    tracing::debug,
};

/// The object-ID table of a world.
///
/// The table is an arena block of words indexed by ID.
/// A live entry holds the address of the object,
/// which is always a multiple of eight.
/// A recycled entry holds the next recycled ID shifted left by one,
/// with the low bit set.
/// ID zero is never handed out, so zero terminates the recycled list.
///
/// All methods must be called with the world header mutex held.
pub (super) struct IdTable<'w>
{
    world: &'w World,
}

impl<'w> IdTable<'w>
{
    pub (super) fn new(world: &'w World) -> Self
    {
        Self{world}
    }

    /// Allocate the table with room for `capacity` IDs.
    pub (super) fn init(&self, capacity: u32) -> Result<()>
    {
        let size = capacity.checked_mul(WORD_SIZE)
            .ok_or(Error::InvalidArgument("ID table is too large"))?;
        let table = self.world.arena().alloc(size)?;
        table.fill(0)?;
        self.world.store_header(OBJLIST_ADDR, table.address());
        self.world.store_header(OBJLIST_SIZE, 1);
        self.world.store_header(OBJLIST_CAPACITY, capacity);
        self.world.store_header(OBJLIST_FREE, 0);
        Ok(())
    }

    /// Assign an ID to the object at `addr`.
    pub (super) fn assign(&self, addr: u32) -> Result<u32>
    {
        let head = self.world.load_header(OBJLIST_FREE);
        if head != 0 {
            let entry = self.entry(head);
            if entry & 1 == 0 {
                return Err(Error::Corrupt(format!(
                    "Recycled ID {head} has live entry {entry}"
                )));
            }
            self.world.store_header(OBJLIST_FREE, entry >> 1);
            self.set_entry(head, addr);
            return Ok(head);
        }

        let size = self.world.load_header(OBJLIST_SIZE);
        if size > MAX_OBJECT_ID {
            return Err(Error::InvalidArgument("Object ID space is exhausted"));
        }
        if size == self.world.load_header(OBJLIST_CAPACITY) {
            self.grow()?;
        }

        self.world.store_header(OBJLIST_SIZE, size + 1);
        self.set_entry(size, addr);
        Ok(size)
    }

    /// Return `id` to the table for reuse.
    pub (super) fn recycle(&self, id: u32) -> Result<()>
    {
        let size = self.world.load_header(OBJLIST_SIZE);
        if id == 0 || id >= size || self.entry(id) & 1 != 0 {
            return Err(Error::Corrupt(format!("Cannot recycle ID {id}")));
        }
        let head = self.world.load_header(OBJLIST_FREE);
        self.set_entry(id, head << 1 | 1);
        self.world.store_header(OBJLIST_FREE, id);
        Ok(())
    }

    /// The live objects, as pairs of ID and address.
    pub (super) fn live(&self) -> Vec<(u32, u32)>
    {
        let size = self.world.load_header(OBJLIST_SIZE);
        (1 .. size)
            .map(|id| (id, self.entry(id)))
            .filter(|&(_, entry)| entry != 0 && entry & 1 == 0)
            .collect()
    }

    /// The number of recycled IDs.
    ///
    /// Fails if the recycled list is cyclic or leaves the table.
    pub (super) fn recycled(&self) -> Result<u32>
    {
        let size = self.world.load_header(OBJLIST_SIZE);
        let mut count = 0;
        let mut id = self.world.load_header(OBJLIST_FREE);
        while id != 0 {
            count += 1;
            if id >= size || count >= size {
                return Err(Error::Corrupt(String::from("Recycled ID list is broken")));
            }
            let entry = self.entry(id);
            if entry & 1 == 0 {
                return Err(Error::Corrupt(format!("Recycled ID {id} is live")));
            }
            id = entry >> 1;
        }
        Ok(count)
    }

    /// Double the capacity of the table.
    fn grow(&self) -> Result<()>
    {
        let arena = self.world.arena();
        let capacity = self.world.load_header(OBJLIST_CAPACITY);
        let new_capacity = capacity.saturating_mul(2).min(MAX_OBJECT_ID + 1);

        let old = arena.from_address(self.world.load_header(OBJLIST_ADDR))?;
        let new = arena.alloc(new_capacity * WORD_SIZE)?;
        new.fill(0)?;
        new.copy_from(&old)?;
        arena.free(old)?;

        self.world.store_header(OBJLIST_ADDR, new.address());
        self.world.store_header(OBJLIST_CAPACITY, new_capacity);
        debug!(capacity = new_capacity, "Grew object-ID table");
        Ok(())
    }

    fn slot(&self, id: u32) -> u32
    {
        self.world.load_header(OBJLIST_ADDR) + BLOCK_HEADER_SIZE + id * WORD_SIZE
    }

    fn entry(&self, id: u32) -> u32
    {
        self.world.arena().region().load32(self.slot(id))
    }

    fn set_entry(&self, id: u32, entry: u32)
    {
        self.world.arena().region().store32(self.slot(id), entry);
    }
}

#[cfg(test)]
mod tests
{
    use {super::*, crate::Config};

    fn with_ids<F>(capacity: u32, f: F)
        where F: FnOnce(&World, IdTable)
    {
        let config = Config{id_table_capacity: capacity, ..Config::default()};
        let world = World::create(config).unwrap();
        let _guard = world.header_mutex().lock().unwrap();
        f(&world, IdTable::new(&world));
    }

    #[test]
    fn ids_are_recycled_last_in_first_out()
    {
        with_ids(16, |_, ids| {
            // The root object already has ID 1.
            assert_eq!(ids.assign(800).unwrap(), 2);
            assert_eq!(ids.assign(808).unwrap(), 3);
            assert_eq!(ids.assign(816).unwrap(), 4);
            ids.recycle(2).unwrap();
            ids.recycle(4).unwrap();
            assert_eq!(ids.recycled().unwrap(), 2);
            assert_eq!(ids.assign(824).unwrap(), 4);
            assert_eq!(ids.assign(832).unwrap(), 2);
            assert_eq!(ids.assign(840).unwrap(), 5);
            assert_eq!(ids.recycled().unwrap(), 0);
        });
    }

    #[test]
    fn table_grows()
    {
        with_ids(2, |world, ids| {
            for i in 0 .. 40 {
                assert_eq!(ids.assign(1000 + i * 8).unwrap(), i + 2);
            }
            assert_eq!(world.load_header(OBJLIST_CAPACITY), 64);
            let live = ids.live();
            assert_eq!(live.len(), 41);
            assert_eq!(live[1], (2, 1000));
            assert_eq!(live[40], (41, 1312));
        });
    }

    #[test]
    fn bad_recycles_are_rejected()
    {
        with_ids(16, |_, ids| {
            assert!(ids.recycle(0).is_err());
            assert!(ids.recycle(7).is_err());
            let id = ids.assign(800).unwrap();
            ids.recycle(id).unwrap();
            assert!(ids.recycle(id).is_err());
        });
    }
}
