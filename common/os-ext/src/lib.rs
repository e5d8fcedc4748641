//! Extra items for talking to the operating system.
//!
//! This crate provides a safe, low-level interface to the operating system.
//! The functions in this crate are named after their underlying system calls,
//! and their behavior is identical except for the differences listed below.
//! The exact semantics of each function can be found in their man pages.
//! This is a trade-off against cross-platform compatibility:
//! only Linux is supported.
//!
//! # Differences with underlying system calls
//!
//! Errors are reported using [`Result`] rather than
//! through `errno` and an arbitrary return value.
//! Conditions that callers are expected to handle,
//! such as a futex wait timing out, are reported as values instead.
//!
//! If the system call fails with `EINTR` (interrupted),
//! the wrapper function automatically retries it,
//! unless its documentation says otherwise.
//!
//! [`Result`]: `std::io::Result`

#![warn(missing_docs)]

pub use self::futex::*;

use std::io::{self, ErrorKind::Interrupted};

mod futex;

/// Call `f` until it no longer fails with `EINTR`.
fn retry_on_eintr<F, T>(mut f: F) -> io::Result<T>
    where F: FnMut() -> io::Result<T>
{
    loop {
        match f() {
            Err(err) if err.kind() == Interrupted => continue,
            result                                => return result,
        }
    }
}
