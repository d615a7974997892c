//! Millisecond countdowns driven by a periodic timer interrupt.
//!
//! The driver arms a [`Countdown`] before every bounded wait and polls
//! [`Countdown::is_expired`] while spinning. The platform's 1ms timer
//! interrupt calls [`Timeouts::tick`] (through [`IsrData::on_tick`]), which
//! decrements every running countdown by one until it reaches zero.
//!
//! [`IsrData::on_tick`]: crate::IsrData::on_tick
use portable_atomic::{AtomicU32, Ordering::*};

/// A single countdown, in milliseconds.
///
/// Written by the task when armed, decremented by the timer interrupt. The
/// decrement is a compare-and-swap that stops at zero, so a tick racing with
/// [`arm`](Self::arm) either lands before the new value is stored (and is
/// overwritten) or after it (and counts against it), but never wraps around.
#[derive(Debug)]
pub struct Countdown(AtomicU32);

/// The countdowns used by the driver.
///
/// They are independent so that a wait nested inside another bounded loop
/// (e.g. the card-ready wait performed by every command, inside the
/// negotiation loop) does not restart the outer one.
#[derive(Debug)]
pub struct Timeouts {
    /// Card-ready waits before commands and data blocks.
    pub command: Countdown,
    /// Data start token waits, and the DMA transfer watchdog.
    pub data: Countdown,
    /// The overall negotiation window during initialization.
    pub window: Countdown,
}

// === impl Countdown ===

impl Countdown {
    /// Returns a new, already expired countdown.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Starts counting down from `ms` milliseconds.
    #[inline]
    pub fn arm(&self, ms: u32) {
        self.0.store(ms, Release);
    }

    /// Returns `true` once the countdown has reached zero.
    #[inline]
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.0.load(Acquire) == 0
    }

    /// Returns the number of milliseconds left.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.0.load(Acquire)
    }

    /// Expires the countdown immediately.
    #[inline]
    pub fn cancel(&self) {
        self.0.store(0, Release);
    }

    /// Decrements the countdown by one millisecond, stopping at zero.
    ///
    /// Returns `true` if the countdown was running.
    #[inline]
    pub fn tick(&self) -> bool {
        self.0
            .fetch_update(AcqRel, Acquire, |ms| ms.checked_sub(1))
            .is_ok()
    }
}

impl Default for Countdown {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Timeouts ===

impl Timeouts {
    /// Returns a new set of countdowns, all expired.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            command: Countdown::new(),
            data: Countdown::new(),
            window: Countdown::new(),
        }
    }

    /// Advances every countdown by one millisecond.
    ///
    /// Called from the 1ms timer interrupt.
    #[inline]
    pub fn tick(&self) {
        self.command.tick();
        self.data.tick();
        self.window.tick();
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{prop_assert_eq, proptest};

    #[test]
    fn new_countdown_is_expired() {
        let countdown = Countdown::new();
        assert!(countdown.is_expired());
        assert!(!countdown.tick());
        assert!(countdown.is_expired());
    }

    #[test]
    fn expires_after_armed_ticks() {
        let countdown = Countdown::new();
        countdown.arm(3);
        assert!(!countdown.is_expired());
        assert!(countdown.tick());
        assert!(countdown.tick());
        assert!(!countdown.is_expired());
        assert!(countdown.tick());
        assert!(countdown.is_expired());
    }

    #[test]
    fn cancel_expires() {
        let countdown = Countdown::new();
        countdown.arm(500);
        countdown.cancel();
        assert!(countdown.is_expired());
        assert!(!countdown.tick());
        assert_eq!(countdown.remaining(), 0);
    }

    #[test]
    fn counters_are_independent() {
        let timeouts = Timeouts::new();
        timeouts.window.arm(1000);
        timeouts.command.arm(2);
        timeouts.tick();
        timeouts.tick();
        assert!(timeouts.command.is_expired());
        assert_eq!(timeouts.window.remaining(), 998);

        // re-arming the inner countdown leaves the outer one alone
        timeouts.command.arm(500);
        assert_eq!(timeouts.window.remaining(), 998);
    }

    proptest! {
        #[test]
        fn never_underflows(armed in 0u32..512, ticks in 0u32..1024) {
            let countdown = Countdown::new();
            countdown.arm(armed);
            for _ in 0..ticks {
                countdown.tick();
            }
            prop_assert_eq!(countdown.remaining(), armed.saturating_sub(ticks));
            prop_assert_eq!(countdown.is_expired(), ticks >= armed);
        }
    }
}
