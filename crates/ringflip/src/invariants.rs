//! Debug assertion macros for the alternating ring protocol.
//!
//! Active only in debug builds (`debug_assert!`), zero overhead in release.
//! Used by the ring and the record store.

/// Assert that a successful reservation stays inside its half.
///
/// Holds because the cursor is compensated back on overflow before the
/// reservation is handed out.
macro_rules! debug_assert_reservation_in_half {
    ($end:expr, $half_len:expr) => {
        debug_assert!(
            $end <= $half_len,
            "reservation end {} exceeds half length {}",
            $end,
            $half_len
        )
    };
}

/// Assert that the release counter never overtakes the acquire counter.
///
/// Failed reservations release immediately, so at any instant
/// `released <= acquired` on each half.
macro_rules! debug_assert_release_balanced {
    ($released:expr, $acquired:expr) => {
        debug_assert!(
            $released <= $acquired,
            "released writers {} overtook acquired writers {}",
            $released,
            $acquired
        )
    };
}

/// Assert that a linear read never runs past the written prefix.
macro_rules! debug_assert_read_in_written {
    ($pos:expr, $written:expr) => {
        debug_assert!(
            $pos <= $written,
            "linear read position {} past written prefix {}",
            $pos,
            $written
        )
    };
}

pub(crate) use debug_assert_read_in_written;
pub(crate) use debug_assert_release_balanced;
pub(crate) use debug_assert_reservation_in_half;
