//! Tunable parameters for worlds.

use {crate::{Error, Result}, std::time::Duration};

/// Configuration for a [`World`][`crate::world::World`].
///
/// ```
/// use nostrum_core::Config;
///
/// let config = Config{
///     arena_size: 1024 * 1024,
///     ..Config::default()
/// };
/// config.validate().unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct Config
{
    /// Number of bytes available for blocks, excluding the arena header.
    ///
    /// Must be a non-zero multiple of
    /// [`ALLOC_GRANULARITY`][`crate::arena::ALLOC_GRANULARITY`].
    ///
    /// Default: 64 KiB
    pub arena_size: u32,

    /// Bound on every blocking wait (locks, latches, stop-the-world).
    ///
    /// Default: [`DEFAULT_TIMEOUT`][`crate::sync::DEFAULT_TIMEOUT`]
    pub timeout: Duration,

    /// Number of reference slots in the root object.
    ///
    /// Default: 16
    pub root_slots: u32,

    /// Initial number of slots in the object-ID table.
    ///
    /// The table doubles whenever it runs out of slots.
    ///
    /// Default: 16
    pub id_table_capacity: u32,

    /// Run [`World::sanity_check`] after every committed mutation.
    ///
    /// This is slow; it is meant for tests and debugging.
    /// The check may report objects that another thread
    /// is still in the middle of freeing, so only enable it
    /// while a single thread works with the world.
    ///
    /// Default: false
    ///
    /// [`World::sanity_check`]: `crate::world::World::sanity_check`
    pub check_after_mutation: bool,
}

impl Default for Config
{
    fn default() -> Self
    {
        Self{
            arena_size: 64 * 1024,
            timeout: crate::sync::DEFAULT_TIMEOUT,
            root_slots: 16,
            id_table_capacity: 16,
            check_after_mutation: false,
        }
    }
}

impl Config
{
    /// Check that the configuration can be used to create a world.
    pub fn validate(&self) -> Result<()>
    {
        if self.arena_size == 0 {
            return Err(Error::InvalidArgument("arena_size must be positive"));
        }
        if self.arena_size % crate::arena::ALLOC_GRANULARITY != 0 {
            return Err(Error::InvalidArgument(
                "arena_size must be a multiple of the allocation granularity",
            ));
        }
        if self.id_table_capacity < 2 {
            return Err(Error::InvalidArgument("id_table_capacity must be at least 2"));
        }
        Ok(())
    }
}
