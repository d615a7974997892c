//! DMA block I/O.
//!
//! A DMA transfer moves the 512 data bytes of a block; everything around
//! them (commands, start tokens, CRC bytes, the data response and the
//! stop token or `STOP_TRANSMISSION`) is handled by the driver in task
//! context. Starting a transfer performs the handshake up to the first data
//! byte and returns immediately. The caller then polls
//! [`SdCard::poll_status`] until it stops returning
//! [`TransferResult::NotReady`]. For multiple-block transfers, each poll that
//! observes a finished block completes that block, performs the handshake for
//! the next one and re-arms the DMA engine.
//!
//! ```text
//!            start_*_dma                on_dma_complete(true)
//!   Idle ─────────────────▶ Busy ─────────────────────────────▶ Success
//!    ▲                       │  │                                  │
//!    │                       │  └── on_dma_complete(false) ──┐     │
//!    │                       │      or watchdog expired      ▼     │
//!    │                       │                             Error   │
//!    │                       └─── next block ◀── poll_status ──────┤
//!    └──────────────────────── poll_status (last block) ◀──────────┘
//! ```
#![warn(missing_docs)]
use core::{fmt, ptr::NonNull};

use portable_atomic::{AtomicU8, Ordering::*};

use crate::{
    bus::SpiBus,
    card::SdCard,
    device::TransferResult,
    proto::{Command, TOKEN_START_BLOCK, TOKEN_START_MULTI_WRITE, TOKEN_STOP_TRAN},
    timeout::Timeouts,
    SECTOR_SIZE,
};

/// The state of the current DMA transfer, as seen by the interrupt handlers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DmaStatus {
    /// No transfer is in flight.
    Idle = 0,
    /// The DMA engine is moving a block.
    Busy = 1,
    /// The DMA engine finished the block.
    Success = 2,
    /// The DMA engine reported an error, or the transfer watchdog expired.
    Error = 3,
}

/// State shared between the driver and the interrupt handlers.
///
/// Interrupt handlers cannot reach into the driver, so everything they need
/// to touch lives here, typically in a `static`. All of it is lock-free: the
/// handlers only ever perform single atomic operations.
#[derive(Debug)]
pub struct IsrData {
    timeouts: Timeouts,
    dma: AtomicU8,
}

/// A DMA transfer that was not started.
///
/// Hands the buffer back to the caller along with the reason.
pub struct Rejected {
    /// Why the transfer was not started.
    pub result: TransferResult,
    /// The buffer passed to the start operation.
    pub buffer: &'static mut [u8],
}

/// A DMA engine able to stream a buffer through the SPI data register.
///
/// Receiving must clock out `0xFF` for every byte received (typically by
/// pairing the receive channel with a transmit channel reading a single
/// `0xFF` byte without incrementing its source address).
///
/// When the transfer finishes, the platform's interrupt handler clears the
/// pending flag, disables the DMA channels and the SPI peripheral's DMA
/// requests, and then calls [`IsrData::on_dma_complete`].
pub trait SpiDma {
    /// Starts receiving `len` bytes into `buf`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of `len` bytes until the transfer
    /// completes or [`abort`](Self::abort) returns.
    unsafe fn start_receive(&mut self, buf: NonNull<u8>, len: usize);

    /// Starts transmitting `len` bytes from `buf`.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads of `len` bytes until the transfer
    /// completes or [`abort`](Self::abort) returns.
    unsafe fn start_transmit(&mut self, buf: NonNull<u8>, len: usize);

    /// Stops the transfer in progress, if any.
    ///
    /// After this returns, the engine no longer accesses the buffer.
    fn abort(&mut self);

    /// Checks for completion without an interrupt.
    ///
    /// Engines that do not raise a completion interrupt return
    /// `Some(succeeded)` once the transfer has finished. The default, for
    /// engines that do, always returns `None`.
    fn poll_complete(&mut self) -> Option<bool> {
        None
    }
}

/// A [`SpiDma`] for boards without a usable DMA channel.
///
/// Every transfer fails immediately, so DMA operations return
/// [`TransferResult::Error`] while the polling operations keep working.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoDma;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// The transfer in flight.
pub(crate) struct Transfer {
    direction: Direction,
    buffer: &'static mut [u8],
    blocks: usize,
    done: usize,
}

// === impl IsrData ===

impl IsrData {
    /// Returns a new `IsrData` with every countdown expired and no transfer in
    /// flight.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeouts: Timeouts::new(),
            dma: AtomicU8::new(DmaStatus::Idle as u8),
        }
    }

    /// Handles the 1ms timer tick.
    #[inline]
    pub fn on_tick(&self) {
        self.timeouts.tick();
    }

    /// Handles the DMA "transfer finished" interrupt.
    ///
    /// Publishes the outcome of the block in flight. If no block is in flight
    /// (e.g. the transfer was already abandoned by the watchdog), the
    /// notification is ignored.
    #[inline]
    pub fn on_dma_complete(&self, succeeded: bool) {
        let to = if succeeded {
            DmaStatus::Success
        } else {
            DmaStatus::Error
        };
        let _ = self
            .dma
            .compare_exchange(DmaStatus::Busy as u8, to as u8, AcqRel, Acquire);
    }

    /// Returns the current DMA status.
    #[must_use]
    pub fn dma_status(&self) -> DmaStatus {
        match self.dma.load(Acquire) {
            0 => DmaStatus::Idle,
            1 => DmaStatus::Busy,
            2 => DmaStatus::Success,
            _ => DmaStatus::Error,
        }
    }

    /// Returns the timeout countdowns.
    #[must_use]
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub(crate) fn set_dma_status(&self, status: DmaStatus) {
        self.dma.store(status as u8, Release);
    }

    /// Moves a stuck transfer to `Error`. Returns `false` if a completion
    /// was published first.
    fn abandon(&self) -> bool {
        self.dma
            .compare_exchange(
                DmaStatus::Busy as u8,
                DmaStatus::Error as u8,
                AcqRel,
                Acquire,
            )
            .is_ok()
    }
}

impl Default for IsrData {
    fn default() -> Self {
        Self::new()
    }
}

// === impl Rejected ===

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("result", &self.result)
            .field("buffer_len", &self.buffer.len())
            .finish()
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DMA transfer not started: {}", self.result)
    }
}

// === impl NoDma ===

impl SpiDma for NoDma {
    unsafe fn start_receive(&mut self, _: NonNull<u8>, _: usize) {}

    unsafe fn start_transmit(&mut self, _: NonNull<u8>, _: usize) {}

    fn abort(&mut self) {}

    fn poll_complete(&mut self) -> Option<bool> {
        Some(false)
    }
}

impl<D: SpiDma + ?Sized> SpiDma for &mut D {
    unsafe fn start_receive(&mut self, buf: NonNull<u8>, len: usize) {
        D::start_receive(self, buf, len)
    }

    unsafe fn start_transmit(&mut self, buf: NonNull<u8>, len: usize) {
        D::start_transmit(self, buf, len)
    }

    fn abort(&mut self) {
        D::abort(self)
    }

    fn poll_complete(&mut self) -> Option<bool> {
        D::poll_complete(self)
    }
}

// === impl Transfer ===

impl Transfer {
    pub(crate) fn into_buffer(self) -> &'static mut [u8] {
        self.buffer
    }

    fn is_multi(&self) -> bool {
        self.blocks > 1
    }

    fn current_block(&mut self) -> NonNull<u8> {
        let start = self.done * SECTOR_SIZE;
        NonNull::from(&mut self.buffer[start..start + SECTOR_SIZE]).cast::<u8>()
    }
}

////////////////////////////////////////////////////////////////////////////////
// DMA block I/O
////////////////////////////////////////////////////////////////////////////////

impl<S: SpiBus, D: SpiDma> SdCard<'_, S, D> {
    /// Starts reading `count` blocks beginning at `sector` into `buffer`.
    ///
    /// On success, the driver holds on to `buffer` until the transfer is
    /// finished; poll [`poll_status`](Self::poll_status) and then take it
    /// back with [`reclaim`](Self::reclaim). If the transfer is not started,
    /// the buffer is returned in the error.
    #[tracing::instrument(
        level = tracing::Level::DEBUG,
        skip(self, buffer),
        fields(len = buffer.len()),
    )]
    pub fn start_read_dma(
        &mut self,
        buffer: &'static mut [u8],
        sector: u32,
        count: u32,
    ) -> Result<(), Rejected> {
        let addr = match self.check_dma_start(buffer.len(), sector, count, false) {
            Ok(addr) => addr,
            Err(result) => return Err(Rejected { result, buffer }),
        };

        let cmd = if count == 1 {
            Command::ReadSingleBlock
        } else {
            Command::ReadMultipleBlock
        };
        let r1 = self.send_command(cmd, addr);
        if r1 != 0 {
            tracing::warn!(?cmd, r1, sector, "read command rejected");
            self.deselect();
            return Err(Rejected {
                result: TransferResult::Error,
                buffer,
            });
        }

        let transfer = Transfer {
            direction: Direction::Read,
            buffer,
            blocks: count as usize,
            done: 0,
        };
        self.begin_block(transfer)
    }

    /// Starts writing `count` blocks from `buffer`, beginning at `sector`.
    ///
    /// See [`start_read_dma`](Self::start_read_dma) for how the buffer is
    /// handed back.
    #[tracing::instrument(
        level = tracing::Level::DEBUG,
        skip(self, buffer),
        fields(len = buffer.len()),
    )]
    pub fn start_write_dma(
        &mut self,
        buffer: &'static mut [u8],
        sector: u32,
        count: u32,
    ) -> Result<(), Rejected> {
        let addr = match self.check_dma_start(buffer.len(), sector, count, true) {
            Ok(addr) => addr,
            Err(result) => return Err(Rejected { result, buffer }),
        };

        let cmd = if count == 1 {
            Command::WriteBlock
        } else {
            if self.card_type.is_sd() {
                self.send_command(Command::SetWrBlkEraseCount, count);
            }
            Command::WriteMultipleBlock
        };
        let r1 = self.send_command(cmd, addr);
        if r1 != 0 {
            tracing::warn!(?cmd, r1, sector, "write command rejected");
            self.deselect();
            return Err(Rejected {
                result: TransferResult::Error,
                buffer,
            });
        }

        let transfer = Transfer {
            direction: Direction::Write,
            buffer,
            blocks: count as usize,
            done: 0,
        };
        self.begin_block(transfer)
    }

    /// Advances the transfer in flight.
    ///
    /// Returns [`TransferResult::NotReady`] while the transfer is running,
    /// and its final result once it has finished. Returns
    /// [`TransferResult::Ok`] if there is no transfer.
    pub fn poll_status(&mut self) -> TransferResult {
        if self.transfer.is_none() {
            return TransferResult::Ok;
        }

        if self.isr.dma_status() == DmaStatus::Busy {
            if let Some(succeeded) = self.dma.poll_complete() {
                self.isr.on_dma_complete(succeeded);
            } else if self.isr.timeouts().data.is_expired() {
                self.dma.abort();
                if self.isr.abandon() {
                    tracing::warn!("DMA transfer timed out");
                }
            }
        }

        match self.isr.dma_status() {
            DmaStatus::Busy => TransferResult::NotReady,
            DmaStatus::Success => self.complete_block(),
            DmaStatus::Error | DmaStatus::Idle => {
                tracing::warn!("DMA transfer failed");
                self.finish(false)
            }
        }
    }

    /// Polls the transfer in flight until it has finished, and returns its
    /// result.
    ///
    /// Engines without a completion interrupt are serviced through
    /// [`SpiDma::poll_complete`]. A stuck engine is abandoned once the
    /// transfer watchdog expires, which relies on the 1ms tick running.
    pub fn wait_dma(&mut self) -> TransferResult {
        loop {
            match self.poll_status() {
                TransferResult::NotReady => core::hint::spin_loop(),
                res => return res,
            }
        }
    }

    /// Returns the buffer of the last finished DMA transfer.
    ///
    /// Returns `None` while a transfer is still in flight, or if the buffer
    /// was already taken. Until the buffer is taken, starting another DMA
    /// transfer fails with [`TransferResult::NotReady`].
    #[must_use]
    pub fn reclaim(&mut self) -> Option<&'static mut [u8]> {
        self.finished.take()
    }

    /// Returns `true` if a DMA transfer is in flight.
    #[must_use]
    pub fn dma_in_flight(&self) -> bool {
        self.transfer.is_some()
    }

    /// Checks the preconditions of a DMA transfer and returns the command
    /// argument addressing `sector`.
    fn check_dma_start(
        &self,
        len: usize,
        sector: u32,
        count: u32,
        write: bool,
    ) -> Result<u32, TransferResult> {
        let addr = self.check_transfer(len, sector, count, write)?;
        if self.finished.is_some() {
            tracing::debug!("buffer of the last DMA transfer not reclaimed");
            return Err(TransferResult::NotReady);
        }
        Ok(addr)
    }

    /// Performs the handshake for the transfer's current block and hands its
    /// data to the DMA engine.
    fn begin_block(&mut self, mut transfer: Transfer) -> Result<(), Rejected> {
        let ready = match transfer.direction {
            Direction::Read => self.wait_data_token(),
            Direction::Write => {
                let token = if transfer.is_multi() {
                    TOKEN_START_MULTI_WRITE
                } else {
                    TOKEN_START_BLOCK
                };
                let ready = self.wait_ready();
                if ready {
                    self.bus.exchange(token);
                }
                ready
            }
        };

        if !ready {
            tracing::warn!(
                direction = ?transfer.direction,
                block = transfer.done,
                "card not ready for block"
            );
            self.stop(&transfer);
            self.deselect();
            self.isr.timeouts().data.cancel();
            self.isr.set_dma_status(DmaStatus::Idle);
            return Err(Rejected {
                result: TransferResult::Error,
                buffer: transfer.buffer,
            });
        }

        let block = transfer.current_block();
        self.isr
            .timeouts()
            .data
            .arm(self.settings.dma_timeout_ms);
        self.isr.set_dma_status(DmaStatus::Busy);
        tracing::trace!(direction = ?transfer.direction, block = transfer.done, "DMA started");
        // Safety: the buffer is `'static` and owned by `self.transfer` until
        // the engine has finished with it or has been aborted.
        unsafe {
            match transfer.direction {
                Direction::Read => self.dma.start_receive(block, SECTOR_SIZE),
                Direction::Write => self.dma.start_transmit(block, SECTOR_SIZE),
            }
        }
        self.transfer = Some(transfer);
        Ok(())
    }

    /// Finishes the block the DMA engine just moved, and starts the next one.
    fn complete_block(&mut self) -> TransferResult {
        let Some(mut transfer) = self.transfer.take() else {
            return TransferResult::Ok;
        };
        self.bus.flush();

        let accepted = match transfer.direction {
            Direction::Read => {
                let mut crc = [0; 2];
                self.bus.receive(&mut crc);
                true
            }
            Direction::Write => self.finish_written_block(),
        };
        transfer.done += 1;
        self.transfer = Some(transfer);

        if !accepted {
            tracing::warn!("block rejected by card");
            return self.finish(false);
        }

        let more = self
            .transfer
            .as_ref()
            .map_or(false, |t| t.done < t.blocks);
        if !more {
            return self.finish(true);
        }

        let Some(transfer) = self.transfer.take() else {
            return TransferResult::Ok;
        };
        match self.begin_block(transfer) {
            Ok(()) => TransferResult::NotReady,
            Err(Rejected { result, buffer }) => {
                self.finished = Some(buffer);
                result
            }
        }
    }

    /// Ends the transfer, returning its buffer to [`reclaim`](Self::reclaim).
    fn finish(&mut self, succeeded: bool) -> TransferResult {
        let Some(transfer) = self.transfer.take() else {
            return TransferResult::Ok;
        };
        let stopped = self.stop(&transfer);
        self.deselect();
        self.isr.timeouts().data.cancel();
        self.isr.set_dma_status(DmaStatus::Idle);
        self.finished = Some(transfer.buffer);

        if succeeded && stopped {
            tracing::debug!(blocks = transfer.blocks, "DMA transfer done");
            TransferResult::Ok
        } else {
            TransferResult::Error
        }
    }

    /// Ends a multiple-block transfer on the card's side.
    fn stop(&mut self, transfer: &Transfer) -> bool {
        if !transfer.is_multi() {
            return true;
        }
        match transfer.direction {
            Direction::Read => {
                self.send_command(Command::StopTransmission, 0);
                true
            }
            Direction::Write => self.transmit_block(None, TOKEN_STOP_TRAN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proto::DriveStatus,
        settings::SdSpiSettings,
        sim::{leak_buf, leak_isr, pattern, ready_card, Kind, SimBus, SimCard, SimDma},
    };

    fn interrupt_card(kind: Kind) -> (SimCard, SdCard<'static, SimBus, SimDma>) {
        crate::trace_init();
        let sim = SimCard::new(kind, leak_isr()).with_dma_interrupt();
        let mut card = sim.driver();
        assert!(!card.initialize().get(DriveStatus::NOT_INITIALIZED));
        (sim, card)
    }

    #[test]
    fn no_transfer_is_ok() {
        let (_sim, mut card) = ready_card(Kind::Sdhc);
        assert_eq!(card.poll_status(), TransferResult::Ok);
        assert!(card.reclaim().is_none());
    }

    #[test]
    fn read_matches_polling() {
        for kind in [Kind::Sdhc, Kind::SdscV2, Kind::Sd1, Kind::Mmc] {
            let (sim, mut card) = ready_card(kind);
            for i in 0..4 {
                sim.set_sector(20 + i, &pattern(i as u8 * 11));
            }

            let mut polled = [0; 4 * SECTOR_SIZE];
            assert_eq!(card.read(&mut polled, 20, 4), TransferResult::Ok);

            let buf = leak_buf(4 * SECTOR_SIZE);
            card.start_read_dma(buf, 20, 4).unwrap();
            assert_eq!(card.wait_dma(), TransferResult::Ok, "{kind:?}");
            assert!(!card.dma_in_flight());
            assert!(!sim.is_selected());
            assert_eq!(card.reclaim().unwrap(), &polled[..], "{kind:?}");

            let buf = leak_buf(SECTOR_SIZE);
            card.start_read_dma(buf, 22, 1).unwrap();
            assert_eq!(card.wait_dma(), TransferResult::Ok, "{kind:?}");
            assert_eq!(card.reclaim().unwrap(), &pattern(22)[..], "{kind:?}");
        }
    }

    #[test]
    fn write_then_polling_read() {
        let (sim, mut card) = ready_card(Kind::Sdhc);
        let buf = leak_buf(3 * SECTOR_SIZE);
        for (i, block) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            block.copy_from_slice(&pattern(i as u8 + 1));
        }

        sim.clear_commands();
        card.start_write_dma(buf, 7, 3).unwrap();
        assert_eq!(card.wait_dma(), TransferResult::Ok);
        assert_eq!(sim.commands(), [(55, 0), (23, 3), (25, 7)]);
        assert!(!sim.is_selected());

        let mut polled = [0; 3 * SECTOR_SIZE];
        assert_eq!(card.read(&mut polled, 7, 3), TransferResult::Ok);
        for (i, block) in polled.chunks_exact(SECTOR_SIZE).enumerate() {
            assert_eq!(block, &pattern(i as u8 + 1)[..]);
        }
        assert_eq!(card.reclaim().unwrap().len(), 3 * SECTOR_SIZE);
    }

    #[test]
    fn mixed_round_trip() {
        let (sim, mut card) = ready_card(Kind::Sd1);
        sim.set_sector(3, &pattern(200));

        // back up with DMA, overwrite by polling, restore with DMA
        card.start_read_dma(leak_buf(SECTOR_SIZE), 3, 1).unwrap();
        assert_eq!(card.wait_dma(), TransferResult::Ok);
        let backup = card.reclaim().unwrap();

        assert_eq!(card.write(&pattern(0), 3, 1), TransferResult::Ok);
        assert_eq!(sim.sector(3), pattern(0));

        card.start_write_dma(backup, 3, 1).unwrap();
        assert_eq!(card.wait_dma(), TransferResult::Ok);
        assert_eq!(sim.sector(3), pattern(200));
    }

    #[test]
    fn completes_from_interrupt() {
        let (sim, mut card) = interrupt_card(Kind::Sdhc);
        for i in 0..3 {
            sim.set_sector(i, &pattern(i as u8));
        }

        card.start_read_dma(leak_buf(3 * SECTOR_SIZE), 0, 3).unwrap();
        for block in 0..3 {
            assert_eq!(card.poll_status(), TransferResult::NotReady);
            assert_eq!(card.isr.dma_status(), DmaStatus::Busy);
            assert!(card.reclaim().is_none());
            assert!(sim.fire_dma_interrupt());
            assert_eq!(card.isr.dma_status(), DmaStatus::Success);

            let expected = if block < 2 {
                TransferResult::NotReady
            } else {
                TransferResult::Ok
            };
            assert_eq!(card.poll_status(), expected);
        }
        assert_eq!(card.isr.dma_status(), DmaStatus::Idle);
        assert!(card.isr.timeouts().data.is_expired());
        assert!(!sim.is_selected());

        let buf = card.reclaim().unwrap();
        for (i, block) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            assert_eq!(block, &pattern(i as u8)[..]);
        }

        // nothing left to do
        assert!(!sim.fire_dma_interrupt());
        assert_eq!(card.poll_status(), TransferResult::Ok);
    }

    #[test]
    fn not_reentrant() {
        let (sim, mut card) = interrupt_card(Kind::Sdhc);
        card.start_write_dma(leak_buf(SECTOR_SIZE), 0, 1).unwrap();

        let second = leak_buf(SECTOR_SIZE);
        second[0] = 0xAB;
        let Rejected { result, buffer } = card.start_read_dma(second, 1, 1).unwrap_err();
        assert_eq!(result, TransferResult::NotReady);
        assert_eq!(buffer[0], 0xAB);

        let rejected = card.start_write_dma(buffer, 1, 1).unwrap_err();
        assert_eq!(rejected.result, TransferResult::NotReady);

        // the polling path and ioctls wait for the transfer too
        let mut buf = [0; SECTOR_SIZE];
        assert_eq!(card.read(&mut buf, 0, 1), TransferResult::NotReady);
        assert_eq!(card.ioctl(crate::Ioctl::GetSectorSize), Err(TransferResult::NotReady));

        assert!(sim.fire_dma_interrupt());
        assert_eq!(card.poll_status(), TransferResult::Ok);
        assert!(card.reclaim().is_some());
        card.start_read_dma(rejected.buffer, 0, 1).unwrap();
        assert!(sim.fire_dma_interrupt());
        assert_eq!(card.wait_dma(), TransferResult::Ok);
    }

    #[test]
    fn unreclaimed_buffer() {
        let (sim, mut card) = ready_card(Kind::Sdhc);
        sim.set_sector(0, &pattern(5));
        card.start_read_dma(leak_buf(SECTOR_SIZE), 0, 1).unwrap();
        assert_eq!(card.wait_dma(), TransferResult::Ok);

        // the finished buffer is not overwritten by the next transfer
        let second = leak_buf(SECTOR_SIZE);
        second[0] = 0xCD;
        sim.clear_commands();
        let Rejected { result, buffer } = card.start_read_dma(second, 1, 1).unwrap_err();
        assert_eq!(result, TransferResult::NotReady);
        assert_eq!(buffer[0], 0xCD);
        assert!(sim.commands().is_empty());

        // polling transfers are not affected
        let mut polled = [0; SECTOR_SIZE];
        assert_eq!(card.read(&mut polled, 0, 1), TransferResult::Ok);

        assert_eq!(card.reclaim().unwrap(), &pattern(5)[..]);
        card.start_read_dma(buffer, 0, 1).unwrap();
        assert_eq!(card.wait_dma(), TransferResult::Ok);
        assert_eq!(card.reclaim().unwrap(), &pattern(5)[..]);
    }

    #[test]
    fn missing_data_token() {
        for count in [1, 2] {
            let (sim, mut card) = ready_card(Kind::Sdhc);
            sim.set_withhold_token(true);
            sim.clear_commands();

            let buf = leak_buf(2 * SECTOR_SIZE);
            buf[0] = 0xAB;
            let Rejected { result, buffer } = card.start_read_dma(buf, 0, count).unwrap_err();
            assert_eq!(result, TransferResult::Error, "{count} blocks");
            assert_eq!(buffer[0], 0xAB);
            assert!(!card.dma_in_flight());
            assert!(!sim.dma_pending());
            assert!(!sim.is_selected());
            assert_eq!(card.isr.dma_status(), DmaStatus::Idle);
            if count > 1 {
                // the multiple-block read is stopped
                assert_eq!(sim.commands(), [(18, 0), (12, 0)]);
            }

            sim.set_withhold_token(false);
            card.start_read_dma(buffer, 0, count).unwrap();
            assert_eq!(card.wait_dma(), TransferResult::Ok, "{count} blocks");
        }
    }

    #[test]
    fn busy_card() {
        let (sim, mut card) = ready_card(Kind::Sdhc);
        sim.set_stuck_busy(true);

        let rejected = card.start_write_dma(leak_buf(SECTOR_SIZE), 0, 1).unwrap_err();
        assert_eq!(rejected.result, TransferResult::Error);
        assert!(!card.dma_in_flight());
        assert!(!sim.dma_pending());
        assert!(!sim.is_selected());

        sim.set_stuck_busy(false);
        card.start_write_dma(rejected.buffer, 0, 1).unwrap();
        assert_eq!(card.wait_dma(), TransferResult::Ok);
    }

    #[test]
    fn rejected_before_start() {
        let (sim, mut card) = ready_card(Kind::Sdhc);
        let rejected = card.start_read_dma(leak_buf(SECTOR_SIZE), 0, 2).unwrap_err();
        assert_eq!(rejected.result, TransferResult::InvalidParameter);
        let rejected = card.start_read_dma(rejected.buffer, 0, 0).unwrap_err();
        assert_eq!(rejected.result, TransferResult::InvalidParameter);

        sim.set_write_protected(true);
        card.initialize();
        let rejected = card.start_write_dma(rejected.buffer, 0, 1).unwrap_err();
        assert_eq!(rejected.result, TransferResult::WriteProtected);
        assert!(!card.dma_in_flight());
        assert!(!sim.dma_pending());
    }

    #[test]
    fn dma_error() {
        let (sim, mut card) = interrupt_card(Kind::Sdhc);
        card.start_read_dma(leak_buf(2 * SECTOR_SIZE), 0, 2).unwrap();
        assert!(sim.fail_dma_interrupt());
        assert_eq!(card.poll_status(), TransferResult::Error);
        assert_eq!(card.isr.dma_status(), DmaStatus::Idle);
        assert!(!sim.is_selected());
        assert!(card.reclaim().is_some());

        // the multiple-block read was stopped, so the card is usable again
        let mut buf = [0; SECTOR_SIZE];
        assert_eq!(card.read(&mut buf, 0, 1), TransferResult::Ok);
    }

    #[test]
    fn watchdog() {
        let (sim, mut card) = interrupt_card(Kind::Sdhc);
        card.start_write_dma(leak_buf(SECTOR_SIZE), 0, 1).unwrap();
        assert_eq!(card.poll_status(), TransferResult::NotReady);

        for _ in 0..SdSpiSettings::DEFAULT_DMA_TIMEOUT_MS - 1 {
            card.isr.on_tick();
        }
        assert_eq!(card.poll_status(), TransferResult::NotReady);
        card.isr.on_tick();
        assert_eq!(card.poll_status(), TransferResult::Error);
        // the engine was stopped
        assert!(!sim.dma_pending());
        assert!(card.reclaim().is_some());
    }

    #[test]
    fn rejected_dma_write() {
        let (sim, mut card) = ready_card(Kind::Sdhc);
        sim.set_sector(4, &pattern(9));
        sim.set_reject_writes(true);

        card.start_write_dma(leak_buf(2 * SECTOR_SIZE), 4, 2).unwrap();
        assert_eq!(card.wait_dma(), TransferResult::Error);
        assert_eq!(sim.sector(4), pattern(9));
        assert!(!sim.is_selected());
    }

    #[test]
    fn initialize_aborts_transfer() {
        let (sim, mut card) = interrupt_card(Kind::Sdhc);
        card.start_read_dma(leak_buf(SECTOR_SIZE), 0, 1).unwrap();
        assert!(!card.initialize().get(DriveStatus::NOT_INITIALIZED));
        assert!(!sim.dma_pending());
        assert!(!card.dma_in_flight());
        assert!(card.reclaim().is_some());
    }

    #[test]
    fn without_dma_engine() {
        crate::trace_init();
        let sim = SimCard::sdhc(leak_isr());
        let mut card = SdCard::new(sim.bus(), NoDma, sim.isr(), SdSpiSettings::default());
        assert!(!card.initialize().get(DriveStatus::NOT_INITIALIZED));

        card.start_read_dma(leak_buf(SECTOR_SIZE), 0, 1).unwrap();
        assert_eq!(card.wait_dma(), TransferResult::Error);

        let mut buf = [0; SECTOR_SIZE];
        assert_eq!(card.read(&mut buf, 0, 1), TransferResult::Ok);
    }
}
