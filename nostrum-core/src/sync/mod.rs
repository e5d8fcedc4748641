//! Synchronization primitives on shared words.
//!
//! Each primitive is a view onto a single [`AtomicU32`],
//! typically a word inside a [`Region`][`crate::Region`]:
//! the arena lock in the arena header, the world locks in the world header,
//! the per-object lock in every object header,
//! and the value word of lock, reader-writer lock, and latch objects.
//! The views hold no state of their own besides a timeout,
//! so any number of threads can construct views onto the same word.
//!
//! All primitives are built from compare-and-swap and futex(2).
//! Every blocking operation is bounded by a timeout,
//! after which [`Error::Timeout`] is returned.
//! Lock words use sequentially consistent operations,
//! so acquiring and releasing a lock acts as a full fence.

pub use self::{latch::*, mutex::*, rwlock::*};

use {
    crate::{Error, Result},
    os_ext::{FutexWait, futex_wait, futex_wake},
    std::{sync::atomic::AtomicU32, time::{Duration, Instant}},
    tracing::warn,
};

mod latch;
mod mutex;
mod rwlock;

/// Timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Point in time after which waiting fails.
struct Deadline
{
    timeout: Duration,
    at: Option<Instant>,
}

impl Deadline
{
    fn after(timeout: Duration) -> Self
    {
        // A timeout too large to represent means "forever".
        let at = Instant::now().checked_add(timeout);
        Self{timeout, at}
    }

    fn remaining(&self) -> Result<Option<Duration>>
    {
        match self.at {
            None => Ok(None),
            Some(at) => match at.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => Ok(Some(remaining)),
                _ => Err(self.expired()),
            },
        }
    }

    fn expired(&self) -> Error
    {
        warn!(timeout = ?self.timeout, "Blocking wait timed out");
        Error::Timeout(self.timeout)
    }
}

/// Block while `word` holds `expected`, or until the deadline.
///
/// Returning `Ok` does not imply the word changed;
/// callers re-check the word and wait again if needed.
fn wait(word: &AtomicU32, expected: u32, deadline: &Deadline) -> Result<()>
{
    let remaining = deadline.remaining()?;
    match futex_wait(word, expected, remaining)? {
        FutexWait::Woken | FutexWait::Mismatch => Ok(()),
        FutexWait::TimedOut                    => Err(deadline.expired()),
    }
}

/// Wake at most `count` threads waiting on `word`.
fn wake(word: &AtomicU32, count: u32) -> Result<()>
{
    futex_wake(word, count)?;
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn deadline_expires()
    {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(matches!(deadline.remaining(), Err(Error::Timeout(..))));
    }

    #[test]
    fn huge_deadline_never_expires()
    {
        let deadline = Deadline::after(Duration::MAX);
        assert_eq!(deadline.remaining().unwrap(), None);
    }
}
