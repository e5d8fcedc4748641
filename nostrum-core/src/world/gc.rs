use {
    super::{THREAD_RC_DELTA, WORLD_RC_DELTA, World},
    crate::{Error, Result},
    std::collections::VecDeque,
    tracing::debug,
};

/// Statistics about a garbage collection cycle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GcReport
{
    /// Number of objects found reachable.
    pub objects_marked: u32,

    /// Number of unreachable objects freed.
    pub objects_freed: u32,
}

impl World
{
    /// Free all objects that are not reachable
    /// from the root object or from a handle.
    ///
    /// Objects with a reference count of zero are being freed
    /// by a thread whose commit has not finished yet.
    /// They are kept, along with everything they reference.
    ///
    /// This stops the world: no thread can mutate the graph meanwhile.
    /// Must not be called from within a mutation scope;
    /// use [`ThreadContext::gc`] to have that checked.
    ///
    /// [`ThreadContext::gc`]: `super::ThreadContext::gc`
    pub fn gc(&self) -> Result<GcReport>
    {
        let _world_stopped = self.stw_lock().write()?;
        let _header = self.header_mutex().lock()?;

        let mut marked = Vec::new();
        let result = self.mark_and_sweep(&mut marked);

        // Marked objects are never freed, and must be unmarked
        // even if the cycle failed.
        for addr in marked {
            self.object_at(addr).unmark();
        }

        result
    }

    fn mark_and_sweep(&self, marked: &mut Vec<u32>) -> Result<GcReport>
    {
        let live = self.live_objects();
        let mut queue = VecDeque::new();

        let mut visit = |addr: u32, queue: &mut VecDeque<u32>| {
            if self.object_at(addr).mark() {
                marked.push(addr);
                queue.push_back(addr);
            }
        };

        // Mark.
        visit(self.root_address(), &mut queue);
        for &(_, addr) in &live {
            let refcount = self.object_at(addr).refcount();
            if refcount >= THREAD_RC_DELTA || refcount == 0 {
                visit(addr, &mut queue);
            }
        }
        while let Some(addr) = queue.pop_front() {
            let object = self.object_at(addr);
            let kind = object.kind()?;
            let references = object.lock()
                .run_exclusive(|| kind.enumerate_references(&object))??;
            for target in references {
                visit(target, &mut queue);
            }
        }
        let objects_marked = marked.len() as u32;
        debug!(marked = objects_marked, "Marked reachable objects");

        // Sweep.
        let mut dead: Vec<u32> = live.iter()
            .map(|&(_, addr)| addr)
            .filter(|&addr| !self.object_at(addr).is_marked())
            .collect();
        let objects_freed = dead.len() as u32;

        let mut released = Vec::new();
        for &addr in &dead {
            let object = self.object_at(addr);
            object.kind()?.free(&object, &mut released)?;
            for target in released.drain(..) {
                let target = self.object_at(target);
                // References between dead objects don't matter.
                if target.is_marked() && target.release(WORLD_RC_DELTA)? {
                    return Err(Error::Corrupt(format!(
                        "Reachable object {} lost its last reference",
                        target.address(),
                    )));
                }
            }
        }
        self.release_locked(&mut dead)?;

        debug!(freed = objects_freed, "Swept unreachable objects");
        Ok(GcReport{objects_marked, objects_freed})
    }
}

#[cfg(test)]
mod tests
{
    use {super::*, crate::{Config, ThreadContext}};

    fn world() -> World
    {
        World::create(Config{check_after_mutation: true, ..Config::default()}).unwrap()
    }

    #[test]
    fn empty_world()
    {
        let world = world();
        let report = world.gc().unwrap();
        assert_eq!(report, GcReport{objects_marked: 1, objects_freed: 0});
        world.sanity_check().unwrap();
    }

    #[test]
    fn cycles_are_collected()
    {
        let world = world();
        let ctx = ThreadContext::new(&world).unwrap();
        let bytes_left = world.bytes_left();

        {
            let a = ctx.create_node(1).unwrap();
            let b = ctx.create_node(1).unwrap();
            let c = ctx.create_node(1).unwrap();
            a.node().unwrap().set(0, Some(&b)).unwrap();
            b.node().unwrap().set(0, Some(&c)).unwrap();
            c.node().unwrap().set(0, Some(&a)).unwrap();
        }
        assert_eq!(world.object_count(), 4);

        let report = ctx.gc().unwrap();
        assert_eq!(report, GcReport{objects_marked: 1, objects_freed: 3});
        assert_eq!(world.object_count(), 1);
        assert_eq!(world.bytes_left(), bytes_left);
        world.sanity_check().unwrap();
    }

    #[test]
    fn reachable_objects_survive()
    {
        let world = world();
        let ctx = ThreadContext::new(&world).unwrap();

        let root = ctx.root().unwrap();
        let held = ctx.create_node(2).unwrap();
        {
            let rooted = ctx.create_node(1).unwrap();
            let child = ctx.create_node(1).unwrap();
            root.node().unwrap().set(0, Some(&rooted)).unwrap();
            rooted.node().unwrap().set(0, Some(&child)).unwrap();
            // Cycle through the root.
            child.node().unwrap().set(0, Some(&root)).unwrap();

            let held_child = ctx.create_node(0).unwrap();
            held.node().unwrap().set(1, Some(&held_child)).unwrap();

            let garbage = ctx.create_node(1).unwrap();
            garbage.node().unwrap().set(0, Some(&garbage)).unwrap();
            // Garbage pointing at survivors must not kill them.
            let garbage2 = ctx.create_node(2).unwrap();
            garbage2.node().unwrap().set(0, Some(&held)).unwrap();
            garbage2.node().unwrap().set(1, Some(&garbage)).unwrap();
            garbage.node().unwrap().set(0, Some(&garbage2)).unwrap();
        }
        assert_eq!(world.object_count(), 7);

        let report = ctx.gc().unwrap();
        assert_eq!(report, GcReport{objects_marked: 5, objects_freed: 2});
        assert_eq!(world.object_count(), 5);
        world.sanity_check().unwrap();

        let rooted = root.node().unwrap().get(0).unwrap().unwrap();
        let child = rooted.node().unwrap().get(0).unwrap().unwrap();
        assert_eq!(child.address(), root.address());
        assert!(held.node().unwrap().get(1).unwrap().is_some());

        // A second collection finds nothing new.
        drop((rooted, child));
        assert_eq!(ctx.gc().unwrap().objects_freed, 0);
    }

    #[test]
    fn gc_inside_mutation_is_rejected()
    {
        let world = world();
        let ctx = ThreadContext::new(&world).unwrap();
        let result = ctx.with_mutation(|| ctx.gc());
        assert!(matches!(result, Err(Error::InvalidArgument(..))));
    }
}
