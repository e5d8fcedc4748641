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

/// The mutex is not held.
pub const MUTEX_FREE: u32 = 0;

/// The mutex is held and nobody is waiting for it.
pub const MUTEX_LOCKED_NO_WAITERS: u32 = 1;

/// The mutex is held and threads may be waiting for it.
pub const MUTEX_LOCKED_MAYBE_WAITERS: u32 = 2;

/// Mutual exclusion lock on a shared word.
///
/// The word must be initialized to [`MUTEX_FREE`].
/// Unlocking only makes a system call if somebody may be waiting.
#[derive(Clone, Copy)]
pub struct Mutex<'a>
{
    word: &'a AtomicU32,
    timeout: Duration,
}

impl<'a> Mutex<'a>
{
    /// View a word as a mutex, with the default timeout.
    pub fn new(word: &'a AtomicU32) -> Self
    {
        Self{word, timeout: DEFAULT_TIMEOUT}
    }

    /// Change the bound on waiting for the mutex.
    pub fn with_timeout(self, timeout: Duration) -> Self
    {
        Self{timeout, ..self}
    }

    /// Acquire the mutex without blocking.
    pub fn try_acquire(&self) -> bool
    {
        self.word
            .compare_exchange(MUTEX_FREE, MUTEX_LOCKED_NO_WAITERS, SeqCst, SeqCst)
            .is_ok()
    }

    /// Acquire the mutex.
    ///
    /// The mutex must be released with [`release`][`Self::release`].
    /// Prefer [`lock`][`Self::lock`] or
    /// [`run_exclusive`][`Self::run_exclusive`],
    /// which release the mutex automatically.
    pub fn acquire(&self) -> Result<()>
    {
        if self.try_acquire() {
            return Ok(());
        }

        let deadline = Deadline::after(self.timeout);
        loop {
            // Announce that we are waiting.
            // If the mutex was free in the meantime, it is now ours.
            let old = self.word.swap(MUTEX_LOCKED_MAYBE_WAITERS, SeqCst);
            if old == MUTEX_FREE {
                return Ok(());
            }
            trace!(word = ?(self.word as *const AtomicU32), "Waiting for contended mutex");
            wait(self.word, MUTEX_LOCKED_MAYBE_WAITERS, &deadline)?;
        }
    }

    /// Release the mutex.
    ///
    /// Fails if the mutex was not held.
    pub fn release(&self) -> Result<()>
    {
        match self.word.swap(MUTEX_FREE, SeqCst) {
            MUTEX_FREE =>
                Err(Error::InvalidArgument("Mutex is not locked")),
            MUTEX_LOCKED_MAYBE_WAITERS =>
                wake(self.word, 1),
            _ =>
                Ok(()),
        }
    }

    /// Acquire the mutex and return a guard that releases it.
    pub fn lock(&self) -> Result<MutexGuard<'a>>
    {
        self.acquire()?;
        Ok(MutexGuard{mutex: *self})
    }

    /// Call `f` while holding the mutex.
    ///
    /// The mutex is released when `f` returns or panics.
    pub fn run_exclusive<F, R>(&self, f: F) -> Result<R>
        where F: FnOnce() -> R
    {
        self.acquire()?;
        scope_exit! {
            if let Err(err) = self.release() {
                error!(%err, "Cannot release mutex");
            }
        }
        Ok(f())
    }

    /// Whether the mutex is currently held by anybody.
    pub fn is_locked(&self) -> bool
    {
        self.word.load(SeqCst) != MUTEX_FREE
    }
}

impl<'a> fmt::Debug for Mutex<'a>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("Mutex")
            .field("word", &self.word.load(SeqCst))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Releases a [`Mutex`] when dropped.
#[must_use = "The mutex is released immediately if the guard is not kept"]
pub struct MutexGuard<'a>
{
    mutex: Mutex<'a>,
}

impl<'a> Drop for MutexGuard<'a>
{
    fn drop(&mut self)
    {
        if let Err(err) = self.mutex.release() {
            error!(%err, "Cannot release mutex");
        }
    }
}

#[cfg(test)]
mod tests
{
    use {super::*, std::{cell::Cell, thread}};

    #[test]
    fn lock_and_release()
    {
        let word = AtomicU32::new(MUTEX_FREE);
        let mutex = Mutex::new(&word);
        {
            let _guard = mutex.lock().unwrap();
            assert!(mutex.is_locked());
            assert!(!mutex.try_acquire());
        }
        assert!(!mutex.is_locked());
    }

    #[test]
    fn release_unlocked_fails()
    {
        let word = AtomicU32::new(MUTEX_FREE);
        let mutex = Mutex::new(&word);
        assert!(matches!(mutex.release(), Err(Error::InvalidArgument(..))));
    }

    #[test]
    fn acquire_times_out()
    {
        let word = AtomicU32::new(MUTEX_FREE);
        let mutex = Mutex::new(&word).with_timeout(Duration::from_millis(20));
        let _guard = mutex.lock().unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                assert!(matches!(mutex.acquire(), Err(Error::Timeout(..))));
            });
        });
    }

    #[test]
    fn run_exclusive_releases_on_panic()
    {
        let word = AtomicU32::new(MUTEX_FREE);
        let mutex = Mutex::new(&word);
        let result = std::panic::catch_unwind(|| {
            mutex.run_exclusive(|| panic!("boom")).unwrap();
        });
        assert!(result.is_err());
        assert!(!mutex.is_locked());
    }

    #[test]
    fn counter_stress()
    {
        const THREADS: u64 = 4;
        const ITERATIONS: u64 = 2000;

        let word = AtomicU32::new(MUTEX_FREE);
        let counter = AtomicU32::new(0);
        let mutex = Mutex::new(&word).with_timeout(Duration::from_secs(10));

        thread::scope(|s| {
            for _ in 0 .. THREADS {
                s.spawn(|| {
                    let local = Cell::new(0u64);
                    for i in 1 ..= ITERATIONS {
                        mutex.run_exclusive(|| {
                            // Deliberately non-atomic read-modify-write.
                            let value = counter.load(SeqCst);
                            counter.store(value + i as u32, SeqCst);
                            local.set(local.get() + 1);
                        }).unwrap();
                    }
                    assert_eq!(local.get(), ITERATIONS);
                });
            }
        });

        let expected = (ITERATIONS + 1) * ITERATIONS / 2 * THREADS;
        assert_eq!(counter.load(SeqCst) as u64, expected);
    }
}
