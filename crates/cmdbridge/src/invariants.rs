//! Debug assertion macros for ring buffer and queue invariants.
//!
//! They are only active in debug builds (`#[cfg(debug_assertions)]`), so there is
//! zero overhead in release builds.
//!
//! Used by `RingBuffer<T, D>` and `DataQueue<D>`.

// =============================================================================
// Bounded Count
// =============================================================================

/// Assert that the writer never runs more than one ring ahead of the reader.
///
/// **Invariant**: `0 ≤ (write - read) ≤ capacity`
///
/// Used in: `RingBuffer::advance()` on the writer side
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity as u64,
            "bounded count violated: {} slots in use exceeds capacity {}",
            $count,
            $capacity
        )
    };
}

/// Assert that the reader does not advance past the published write position.
///
/// **Invariant**: `read ≤ write` (after advance)
///
/// Used in: `RingBuffer::advance()` on the reader side
macro_rules! debug_assert_read_not_past_write {
    ($new_read:expr, $write:expr) => {
        debug_assert!(
            $new_read <= $write,
            "advancing read position {} beyond write position {}",
            $new_read,
            $write
        )
    };
}

// =============================================================================
// Monotonic Progress
// =============================================================================

/// Assert that a logical position only increases.
///
/// **Invariant**: `new_value ≥ old_value`
///
/// Used in: `RingBuffer::advance()`
macro_rules! debug_assert_monotonic {
    ($name:expr, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} position decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

// =============================================================================
// Contiguous Blob
// =============================================================================

/// Assert that a blob lies inside a single lap of the data ring.
///
/// **Invariant**: `offset + words ≤ capacity`
///
/// Used in: `RingBuffer::contiguous_mut()`, `RingBuffer::contiguous()`
macro_rules! debug_assert_contiguous {
    ($offset:expr, $words:expr, $capacity:expr) => {
        debug_assert!(
            $offset + $words <= $capacity,
            "blob of {} words at offset {} straddles the end of a {}-word ring",
            $words,
            $offset,
            $capacity
        )
    };
}

// =============================================================================
// Single Outstanding Lap
// =============================================================================

/// Assert that the writer only starts a lap after the reader cleared the last one.
///
/// **Invariant**: `crossing ⇒ !reset_required`
///
/// Used in: `DataQueue::mark_lap()`
macro_rules! debug_assert_lap_acknowledged {
    ($reset_required:expr, $wrap_pos:expr) => {
        debug_assert!(
            !$reset_required,
            "starting a new lap while the reader has not left wrap position {}",
            $wrap_pos
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_contiguous;
pub(crate) use debug_assert_lap_acknowledged;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_read_not_past_write;
