use {
    super::{DEFAULT_TIMEOUT, Deadline, wait, wake},
    crate::{Error, Result},
    std::{
        fmt,
        sync::atomic::{AtomicU32, Ordering::SeqCst},
        time::Duration,
    },
};

/// Countdown latch on a shared word.
///
/// The word holds the number of outstanding [`decrement`] calls.
/// [`wait`] blocks until it reaches zero.
///
/// [`decrement`]: `Self::decrement`
/// [`wait`]: `Self::wait`
#[derive(Clone, Copy)]
pub struct Latch<'a>
{
    word: &'a AtomicU32,
    timeout: Duration,
}

impl<'a> Latch<'a>
{
    /// View a word as a latch, with the default timeout.
    pub fn new(word: &'a AtomicU32) -> Self
    {
        Self{word, timeout: DEFAULT_TIMEOUT}
    }

    /// Change the bound on waiting for the latch.
    pub fn with_timeout(self, timeout: Duration) -> Self
    {
        Self{timeout, ..self}
    }

    /// The number of outstanding decrements.
    pub fn count(&self) -> u32
    {
        self.word.load(SeqCst)
    }

    /// Count down by one, waking all waiters if zero is reached.
    pub fn decrement(&self) -> Result<()>
    {
        let old = self.word
            .fetch_update(SeqCst, SeqCst, |count| count.checked_sub(1))
            .map_err(|_| Error::InvalidArgument(
                "Latch cannot be decremented below zero",
            ))?;

        if old == 1 {
            wake(self.word, u32::MAX)?;
        }

        Ok(())
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) -> Result<()>
    {
        let deadline = Deadline::after(self.timeout);
        loop {
            let count = self.word.load(SeqCst);
            if count == 0 {
                return Ok(());
            }
            // If the count changed since the load,
            // this returns immediately and we look again.
            wait(self.word, count, &deadline)?;
        }
    }
}

impl<'a> fmt::Debug for Latch<'a>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.debug_struct("Latch")
            .field("count", &self.count())
            .field("timeout", &self.timeout)
            .finish()
    }
}
