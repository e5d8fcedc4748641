//! Extra methods for non-zero integers.

#![warn(missing_docs)]

use std::num::NonZeroU64;

/// Extra methods for non-zero integers.
pub trait NonZeroExt: Sized
{
    /// The number 1.
    const ONE: Self;

    /// Subtract one, or return [`None`] if that would yield zero.
    fn checked_pred(self) -> Option<Self>;
}

impl NonZeroExt for NonZeroU64
{
    const ONE: Self = unsafe { Self::new_unchecked(1) };

    fn checked_pred(self) -> Option<Self>
    {
        Self::new(self.get() - 1)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn checked_pred_stops_at_one()
    {
        assert_eq!(NonZeroU64::ONE.checked_pred(), None);
        let two = NonZeroU64::new(2).unwrap();
        assert_eq!(two.checked_pred(), Some(NonZeroU64::ONE));
    }
}
