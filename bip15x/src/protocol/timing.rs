//! Time-keeping related utilities for the transport protocol

use super::constants::EVENT_GRACE;

/// A type for time, in seconds relative to some [Timebase](bip15x_util::time::Timebase)
pub type Timing = f64;

/// Magic time stamp to indicate some object is ancient; "Before Common Era"
///
/// Used for events that never happened, so that "time since" comparisons
/// treat them as long overdue without resorting to infinities.
pub const BCE: Timing = -3600.0 * 24.0 * 356.0 * 10_000.0;

/// An event `ev` has happened relative to a point in time `now`
/// if `ev` does not lie in the future relative to `now`.
///
/// Think of this as `ev <= now` for with [EVENT_GRACE] applied.
///
/// # Examples
///
/// ```
/// use bip15x::protocol::{timing::has_happened, constants::EVENT_GRACE};
/// assert!(has_happened(EVENT_GRACE * -1.0, 0.0));
/// assert!(has_happened(0.0, 0.0));
/// assert!(has_happened(EVENT_GRACE * 0.999, 0.0));
/// assert!(!has_happened(EVENT_GRACE * 1.001, 0.0));
/// ```
pub fn has_happened(ev: Timing, now: Timing) -> bool {
    (ev - now) < EVENT_GRACE
}
