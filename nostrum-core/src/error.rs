use {std::{io, time::Duration}, thiserror::Error};

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of an operation on a region, arena, or world.
///
/// None of these are retried internally.
/// [`Timeout`][`Self::Timeout`] and [`OutOfMemory`][`Self::OutOfMemory`]
/// may be worth retrying by the caller; the others indicate bugs
/// ([`InvalidArgument`][`Self::InvalidArgument`],
/// [`OutOfBounds`][`Self::OutOfBounds`])
/// or corruption of the shared structures ([`Corrupt`][`Self::Corrupt`]).
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum Error
{
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Out of memory while allocating {requested} bytes")]
    OutOfMemory{requested: u32},

    #[error("Offset {offset} is out of bounds for a block of {size} bytes")]
    OutOfBounds{offset: u32, size: u32},

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Structural invariant violated: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Os(#[from] io::Error),
}
