use {
    crate::retry_on_eintr,
    std::{io, ptr, sync::atomic::AtomicU32, time::Duration},
};

/// Outcome of [`futex_wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FutexWait
{
    /// Woken by [`futex_wake`], by a signal, or spuriously.
    Woken,

    /// The word did not hold the expected value when the call was made.
    Mismatch,

    /// The timeout elapsed before anybody woke us.
    TimedOut,
}

/// Call futex(2) with `FUTEX_WAIT`.
///
/// Blocks while `*word == expected`, for at most `timeout` if given.
/// The futex is not private, so the word may live in memory
/// that is mapped by more than one process.
///
/// Unlike the other wrappers in this crate, `EINTR` is not retried:
/// it is reported as [`FutexWait::Woken`], because callers must
/// re-check the word after waking up anyway.
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>)
    -> io::Result<FutexWait>
{
    let timespec = timeout.map(|timeout| libc::timespec{
        tv_sec: timeout.as_secs().try_into().unwrap_or(libc::time_t::MAX),
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    });
    let timespec_ptr = match &timespec {
        Some(timespec) => timespec as *const libc::timespec,
        None           => ptr::null(),
    };

    // SAFETY: word is a live, aligned u32 and timespec outlives the call.
    let result = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            timespec_ptr,
        )
    };

    if result == -1 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN)    => Ok(FutexWait::Mismatch),
            Some(libc::ETIMEDOUT) => Ok(FutexWait::TimedOut),
            Some(libc::EINTR)     => Ok(FutexWait::Woken),
            _                     => Err(err),
        };
    }

    Ok(FutexWait::Woken)
}

/// Call futex(2) with `FUTEX_WAKE`.
///
/// Wakes at most `count` threads blocked in [`futex_wait`] on `word`.
/// Returns the number of threads that were woken.
pub fn futex_wake(word: &AtomicU32, count: u32) -> io::Result<usize>
{
    let count = libc::c_int::try_from(count).unwrap_or(libc::c_int::MAX);

    retry_on_eintr(|| {
        // SAFETY: word is a live, aligned u32.
        let result = unsafe {
            libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, count)
        };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(result as usize)
    })
}

#[cfg(test)]
mod tests
{
    use {super::*, std::{sync::atomic::Ordering::SeqCst, thread}};

    #[test]
    fn futex_wait_mismatch()
    {
        let word = AtomicU32::new(1);
        let result = futex_wait(&word, 0, None).unwrap();
        assert_eq!(result, FutexWait::Mismatch);
    }

    #[test]
    fn futex_wait_timeout()
    {
        let word = AtomicU32::new(0);
        let timeout = Some(Duration::from_millis(10));
        let result = futex_wait(&word, 0, timeout).unwrap();
        assert_eq!(result, FutexWait::TimedOut);
    }

    #[test]
    fn futex_wake_without_waiters()
    {
        let word = AtomicU32::new(0);
        assert_eq!(futex_wake(&word, u32::MAX).unwrap(), 0);
    }

    #[test]
    fn futex_wake_releases_waiter()
    {
        let word = AtomicU32::new(0);
        thread::scope(|s| {
            s.spawn(|| {
                while word.load(SeqCst) == 0 {
                    let timeout = Some(Duration::from_secs(5));
                    let result = futex_wait(&word, 0, timeout).unwrap();
                    assert_ne!(result, FutexWait::TimedOut);
                }
            });
            thread::sleep(Duration::from_millis(10));
            word.store(1, SeqCst);
            futex_wake(&word, 1).unwrap();
        });
    }
}
