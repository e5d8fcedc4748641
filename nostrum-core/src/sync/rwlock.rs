use {
    super::{DEFAULT_TIMEOUT, Deadline, wait, wake},
    crate::{Error, Result},
    scope_exit::scope_exit,
    std::{
        fmt,
        sync::atomic::{AtomicU32, Ordering::SeqCst},
        time::Duration,
    },
    tracing::{error, trace},
};

/// The reader-writer lock is not held.
pub const RWLOCK_FREE: u32 = 0;

/// The reader-writer lock is held by a writer.
///
/// Any other value is the number of readers holding the lock.
pub const RWLOCK_WRITE_LOCKED: u32 = u32::MAX;

/// Reader-writer lock on a shared word.
///
/// The word must be initialized to [`RWLOCK_FREE`].
/// There is no writer preference;
/// a steady stream of readers can starve writers until they time out.
#[derive(Clone, Copy)]
pub struct RwLock<'a>
{
    word: &'a AtomicU32,
    timeout: Duration,
}

impl<'a> RwLock<'a>
{
    /// View a word as a reader-writer lock, with the default timeout.
    pub fn new(word: &'a AtomicU32) -> Self
    {
        Self{word, timeout: DEFAULT_TIMEOUT}
    }

    /// Change the bound on waiting for the lock.
    pub fn with_timeout(self, timeout: Duration) -> Self
    {
        Self{timeout, ..self}
    }

    /// Acquire the lock for reading.
    ///
    /// The lock must be released with [`release`][`Self::release`].
    pub fn acquire_read(&self) -> Result<()>
    {
        let deadline = Deadline::after(self.timeout);
        let mut current = self.word.load(SeqCst);
        loop {
            if current == RWLOCK_WRITE_LOCKED {
                trace!("Reader waiting for writer");
                wait(self.word, current, &deadline)?;
                current = self.word.load(SeqCst);
                continue;
            }

            if current == RWLOCK_WRITE_LOCKED - 1 {
                return Err(Error::InvalidArgument("Too many readers"));
            }

            match self.word.compare_exchange(current, current + 1, SeqCst, SeqCst) {
                Ok(_)     => return Ok(()),
                Err(seen) => current = seen,
            }
        }
    }

    /// Acquire the lock for writing.
    ///
    /// The lock must be released with [`release`][`Self::release`].
    pub fn acquire_write(&self) -> Result<()>
    {
        let deadline = Deadline::after(self.timeout);
        loop {
            let result = self.word.compare_exchange(
                RWLOCK_FREE,
                RWLOCK_WRITE_LOCKED,
                SeqCst,
                SeqCst,
            );
            match result {
                Ok(_) => return Ok(()),
                Err(seen) => {
                    trace!(seen, "Writer waiting for lock");
                    wait(self.word, seen, &deadline)?;
                },
            }
        }
    }

    /// Release the lock, whether held for reading or for writing.
    pub fn release(&self) -> Result<()>
    {
        let old = self.word
            .fetch_update(SeqCst, SeqCst, |current| match current {
                RWLOCK_FREE         => None,
                RWLOCK_WRITE_LOCKED => Some(RWLOCK_FREE),
                readers             => Some(readers - 1),
            })
            .map_err(|_| Error::InvalidArgument("RwLock is not locked"))?;

        match old {
            // Any mix of readers and a writer may be waiting.
            RWLOCK_WRITE_LOCKED => wake(self.word, u32::MAX),
            // Only writers wait while readers hold the lock.
            1                   => wake(self.word, 1),
            _                   => Ok(()),
        }
    }

    /// Acquire the lock for reading and return a guard that releases it.
    pub fn read(&self) -> Result<ReadGuard<'a>>
    {
        self.acquire_read()?;
        Ok(ReadGuard{rwlock: *self})
    }

    /// Acquire the lock for writing and return a guard that releases it.
    pub fn write(&self) -> Result<WriteGuard<'a>>
    {
        self.acquire_write()?;
        Ok(WriteGuard{rwlock: *self})
    }

    /// Call `f` while holding the lock for writing.
    ///
    /// The lock is released when `f` returns or panics.
    pub fn run_exclusive<F, R>(&self, f: F) -> Result<R>
        where F: FnOnce() -> R
    {
        self.acquire_write()?;
        scope_exit! { self.release_or_log(); }
        Ok(f())
    }

    /// Call `f` while holding the lock for reading.
    ///
    /// The lock is released when `f` returns or panics.
    pub fn run_shared<F, R>(&self, f: F) -> Result<R>
        where F: FnOnce() -> R
    {
        self.acquire_read()?;
        scope_exit! { self.release_or_log(); }
        Ok(f())
    }

    /// The raw value of the word.
    pub fn state(&self) -> u32
    {
        self.word.load(SeqCst)
    }

    fn release_or_log(&self)
    {
        if let Err(err) = self.release() {
            error!(%err, "Cannot release reader-writer lock");
        }
    }
}

impl<'a> fmt::Debug for RwLock<'a>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("RwLock")
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Releases a [`RwLock`] held for reading when dropped.
#[must_use = "The lock is released immediately if the guard is not kept"]
pub struct ReadGuard<'a>
{
    rwlock: RwLock<'a>,
}

impl<'a> Drop for ReadGuard<'a>
{
    fn drop(&mut self)
    {
        self.rwlock.release_or_log();
    }
}

/// Releases a [`RwLock`] held for writing when dropped.
#[must_use = "The lock is released immediately if the guard is not kept"]
pub struct WriteGuard<'a>
{
    rwlock: RwLock<'a>,
}

impl<'a> Drop for WriteGuard<'a>
{
    fn drop(&mut self)
    {
        self.rwlock.release_or_log();
    }
}
