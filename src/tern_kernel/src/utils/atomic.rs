//! Interrupt-safe read-modify-write primitives.
//!
//! Every operation in this module is a single atomic read-modify-write on a
//! shared scalar: no concurrent interrupt handler or thread can observe it
//! partially applied. On targets with hardware exclusive access the
//! compare-exchange loops below compile down to `LDREX`/`STREX` (or LR/SC)
//! sequences; on targets without it, `core::sync::atomic` falls back to a
//! brief interrupt-mask section that preserves the caller's original mask
//! state.
//!
//! These are used wherever kernel state is mutated from interrupt context
//! without taking a lock: the semaphore token count, event-flag and
//! thread-flag bit vectors, the deferred-queue occupancy counter, and the
//! tick counter.
use core::sync::atomic::{AtomicU32, Ordering};

/// OR `bits` into `cell`. Returns the pre-image.
#[inline]
pub fn set_bits(cell: &AtomicU32, bits: u32) -> u32 {
    cell.fetch_or(bits, Ordering::AcqRel)
}

/// AND `!bits` into `cell`. Returns the pre-image.
#[inline]
pub fn clear_bits(cell: &AtomicU32, bits: u32) -> u32 {
    cell.fetch_and(!bits, Ordering::AcqRel)
}

/// If all of `bits` are set in `cell`, clear them and return the pre-image.
/// Returns `None` (and leaves `cell` unchanged) otherwise.
#[inline]
pub fn try_clear_all(cell: &AtomicU32, bits: u32) -> Option<u32> {
    cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        if v & bits == bits {
            Some(v & !bits)
        } else {
            None
        }
    })
    .ok()
}

/// If any of `bits` are set in `cell`, clear the matching ones and return
/// the pre-image. Returns `None` (and leaves `cell` unchanged) otherwise.
#[inline]
pub fn try_clear_any(cell: &AtomicU32, bits: u32) -> Option<u32> {
    cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        if v & bits != 0 {
            Some(v & !bits)
        } else {
            None
        }
    })
    .ok()
}

/// Increment `cell` unless that would exceed `limit`. Returns the
/// pre-image, or `None` if the increment was refused.
#[inline]
pub fn increment_up_to(cell: &AtomicU32, limit: u32) -> Option<u32> {
    cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        if v < limit {
            Some(v + 1)
        } else {
            None
        }
    })
    .ok()
}

/// Decrement `cell` unless it is zero. Returns the pre-image, or `None` if
/// it was zero.
#[inline]
pub fn decrement_nonzero(cell: &AtomicU32) -> Option<u32> {
    cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        .ok()
}

/// Wrapping increment. Returns the pre-image.
#[inline]
pub fn increment_wrapping(cell: &AtomicU32) -> u32 {
    cell.fetch_add(1, Ordering::AcqRel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_return_pre_image() {
        let c = AtomicU32::new(0b0101);
        assert_eq!(set_bits(&c, 0b0010), 0b0101);
        assert_eq!(c.load(Ordering::Relaxed), 0b0111);
        assert_eq!(clear_bits(&c, 0b0011), 0b0111);
        assert_eq!(c.load(Ordering::Relaxed), 0b0100);
    }

    #[test]
    fn try_clear_all_requires_every_bit() {
        let c = AtomicU32::new(0b0101);
        assert_eq!(try_clear_all(&c, 0b0111), None);
        assert_eq!(c.load(Ordering::Relaxed), 0b0101);
        assert_eq!(try_clear_all(&c, 0b0101), Some(0b0101));
        assert_eq!(c.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn try_clear_any_clears_only_matches() {
        let c = AtomicU32::new(0b0101);
        assert_eq!(try_clear_any(&c, 0b0011), Some(0b0101));
        assert_eq!(c.load(Ordering::Relaxed), 0b0100);
        assert_eq!(try_clear_any(&c, 0b0011), None);
    }

    #[test]
    fn bounded_increment_refuses_at_limit() {
        let c = AtomicU32::new(2);
        assert_eq!(increment_up_to(&c, 3), Some(2));
        assert_eq!(increment_up_to(&c, 3), None);
        assert_eq!(c.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn decrement_stops_at_zero() {
        let c = AtomicU32::new(1);
        assert_eq!(decrement_nonzero(&c), Some(1));
        assert_eq!(decrement_nonzero(&c), None);
        assert_eq!(c.load(Ordering::Relaxed), 0);
    }
}
