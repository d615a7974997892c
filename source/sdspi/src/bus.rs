//! The SPI bus underneath the card.
//!
//! Platforms implement [`SpiBus`] for their SPI peripheral and the GPIO used
//! as the card's chip-select. Everything above byte exchange (framing,
//! readiness waits, tokens) lives in the driver.

use crate::proto::FILLER;

/// Bus clock selection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Speed {
    /// Identification mode. Cards must be negotiated with a clock of at most
    /// 400kHz.
    Low,
    /// Data transfer mode, as fast as the board allows (up to 25MHz).
    High,
}

/// Byte-level access to the SPI bus the card is attached to.
///
/// # Bounding busy-waits
///
/// [`exchange`](Self::exchange) and [`flush`](Self::flush) are expected to
/// spin on peripheral status flags. Implementations must bound those loops
/// (see [`spin_until`]) so that a wedged or disconnected peripheral cannot
/// hang the caller. When the bound is exhausted, `exchange` should return
/// `0xFF`, which is what an idle (pulled-up) data-out line reads as: the
/// driver then sees "no response" and fails through its ordinary timeouts.
pub trait SpiBus {
    /// Clocks `byte` out while clocking one byte in, and returns the byte
    /// received.
    fn exchange(&mut self, byte: u8) -> u8;

    /// Asserts the card's chip-select (drives it low).
    fn select(&mut self);

    /// Deasserts the card's chip-select (drives it high).
    ///
    /// The driver takes care of clocking the trailing dummy byte the card
    /// needs to release its data-out line.
    fn deselect(&mut self);

    /// Changes the bus clock.
    fn set_speed(&mut self, speed: Speed);

    /// Waits for any ongoing transmission to finish and discards stale bytes
    /// from the receive buffer, clearing overrun conditions left behind by an
    /// interrupted or DMA-driven transfer.
    fn flush(&mut self);

    /// Returns `false` if the socket's card-detect switch reports an empty
    /// socket.
    ///
    /// Sockets without a card-detect line should leave the default, which
    /// always reports a card.
    fn card_present(&mut self) -> bool {
        true
    }

    /// Returns `true` if the card's write-protect tab is engaged.
    ///
    /// Sockets without a write-protect switch should leave the default.
    fn write_protected(&mut self) -> bool {
        false
    }

    /// Clocks out `FILLER` and stores the received bytes in `buf`.
    fn receive(&mut self, buf: &mut [u8]) {
        for byte in buf {
            *byte = self.exchange(FILLER);
        }
    }

    /// Clocks out every byte in `buf`, discarding the received bytes.
    fn transmit(&mut self, buf: &[u8]) {
        for &byte in buf {
            self.exchange(byte);
        }
    }
}

impl<B: SpiBus + ?Sized> SpiBus for &mut B {
    #[inline]
    fn exchange(&mut self, byte: u8) -> u8 {
        B::exchange(self, byte)
    }

    #[inline]
    fn select(&mut self) {
        B::select(self)
    }

    #[inline]
    fn deselect(&mut self) {
        B::deselect(self)
    }

    #[inline]
    fn set_speed(&mut self, speed: Speed) {
        B::set_speed(self, speed)
    }

    #[inline]
    fn flush(&mut self) {
        B::flush(self)
    }

    #[inline]
    fn card_present(&mut self) -> bool {
        B::card_present(self)
    }

    #[inline]
    fn write_protected(&mut self) -> bool {
        B::write_protected(self)
    }
}

/// Spins until `cond` returns `true`, giving up after `limit` attempts.
///
/// Returns `true` if the condition was observed. Intended for the
/// peripheral-flag waits inside [`SpiBus`] implementations, e.g.
///
/// ```rust,ignore
/// fn exchange(&mut self, byte: u8) -> u8 {
///     if !spin_until(SPIN_LIMIT, || self.spi.stat.read().tbe().bit_is_set()) {
///         return 0xFF;
///     }
///     self.spi.data.write(|w| w.data().variant(byte.into()));
///     if !spin_until(SPIN_LIMIT, || self.spi.stat.read().rbne().bit_is_set()) {
///         return 0xFF;
///     }
///     self.spi.data.read().data().bits() as u8
/// }
/// ```
#[inline]
pub fn spin_until(limit: usize, mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..limit {
        if cond() {
            return true;
        }
        core::hint::spin_loop();
    }
    false
}
