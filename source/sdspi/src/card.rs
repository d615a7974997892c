//! The card driver: negotiation, command framing and the block primitives
//! shared by the polling and DMA paths.
use crate::{
    bus::{Speed, SpiBus},
    csd,
    device::{BlockDevice, Ioctl, TransferResult},
    dma::{DmaStatus, IsrData, SpiDma, Transfer},
    proto::{
        CardType, Command, DriveStatus, Ocr, DATA_ACCEPTED, DATA_RESPONSE_MASK, FILLER, HCS,
        IF_COND_ARG, R1, TOKEN_START_BLOCK, TOKEN_STOP_TRAN,
    },
    settings::SdSpiSettings,
    SECTOR_SIZE,
};

/// An SD or MMC card on a SPI bus.
pub struct SdCard<'isr, S, D> {
    pub(crate) bus: S,
    pub(crate) dma: D,
    pub(crate) isr: &'isr IsrData,
    pub(crate) settings: SdSpiSettings,
    pub(crate) status: DriveStatus,
    pub(crate) card_type: CardType,
    pub(crate) transfer: Option<Transfer>,
    pub(crate) finished: Option<&'static mut [u8]>,
}

impl<'isr, S: SpiBus, D: SpiDma> SdCard<'isr, S, D> {
    /// Returns a new driver for the card on `bus`.
    ///
    /// The card is not touched until [`initialize`](Self::initialize) is
    /// called.
    #[must_use]
    pub fn new(bus: S, dma: D, isr: &'isr IsrData, settings: SdSpiSettings) -> Self {
        Self {
            bus,
            dma,
            isr,
            settings,
            status: DriveStatus::uninitialized(),
            card_type: CardType::NONE,
            transfer: None,
            finished: None,
        }
    }

    /// Returns the driver's current status.
    ///
    /// This does not touch the bus.
    #[must_use]
    pub fn status(&self) -> DriveStatus {
        self.status
    }

    /// Returns the kind of card found by the last
    /// [`initialize`](Self::initialize).
    #[must_use]
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    #[must_use]
    pub fn settings(&self) -> &SdSpiSettings {
        &self.settings
    }

    /// Returns the bus and DMA engine, consuming the driver.
    pub fn free(self) -> (S, D) {
        (self.bus, self.dma)
    }

    /// Brings the card into the data transfer state.
    ///
    /// The card is reset into SPI mode and negotiated at the low bus speed.
    /// On success, the bus is switched to high speed and `NOT_INITIALIZED` is
    /// cleared from the returned status. A DMA transfer still in flight is
    /// aborted.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    pub fn initialize(&mut self) -> DriveStatus {
        if let Some(transfer) = self.transfer.take() {
            tracing::warn!("aborting DMA transfer in flight");
            self.dma.abort();
            self.isr.timeouts().data.cancel();
            self.isr.set_dma_status(DmaStatus::Idle);
            self.finished = Some(transfer.into_buffer());
        }

        self.status = DriveStatus::uninitialized()
            .with(DriveStatus::NO_MEDIUM, !self.bus.card_present())
            .with(DriveStatus::WRITE_PROTECTED, self.bus.write_protected());
        self.card_type = CardType::NONE;
        if self.status.get(DriveStatus::NO_MEDIUM) {
            tracing::debug!("no card in socket");
            return self.status;
        }

        self.bus.set_speed(Speed::Low);
        self.bus.deselect();
        for _ in 0..self.settings.init_clock_bytes {
            self.bus.exchange(FILLER);
        }

        self.card_type = self.negotiate();
        self.deselect();

        if self.card_type.is_none() {
            tracing::warn!("card initialization failed");
        } else {
            self.status = self.status.with(DriveStatus::NOT_INITIALIZED, false);
            self.bus.set_speed(Speed::High);
            tracing::info!(card_type = ?self.card_type, "card initialized");
        }
        self.status
    }

    /// Performs a control operation.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    pub fn ioctl(&mut self, ctl: Ioctl) -> Result<u32, TransferResult> {
        if self.status.get(DriveStatus::NOT_INITIALIZED) || self.transfer.is_some() {
            return Err(TransferResult::NotReady);
        }

        let res = match ctl {
            Ioctl::Sync => {
                if self.select() {
                    Ok(0)
                } else {
                    Err(TransferResult::Error)
                }
            }
            Ioctl::GetSectorCount => self
                .read_csd()
                .and_then(|reg| csd::sector_count(&reg))
                .ok_or(TransferResult::Error),
            Ioctl::GetSectorSize => Ok(SECTOR_SIZE as u32),
            Ioctl::GetEraseBlockSize => {
                let card_type = self.card_type;
                if card_type.get(CardType::SD2) {
                    Ok(128)
                } else {
                    self.read_csd()
                        .and_then(|reg| csd::erase_block_size(card_type, &reg))
                        .ok_or(TransferResult::Error)
                }
            }
        };
        self.deselect();
        res
    }

    ////////////////////////////////////////////////////////////////////////////
    // Negotiation
    ////////////////////////////////////////////////////////////////////////////

    fn negotiate(&mut self) -> CardType {
        let r1 = self.send_command(Command::GoIdleState, 0);
        if r1 != R1::new().with(R1::IDLE, true).bits() {
            tracing::debug!(r1, "no response to GO_IDLE_STATE");
            return CardType::NONE;
        }

        self.isr
            .timeouts()
            .window
            .arm(self.settings.init_timeout_ms);

        if self.send_command(Command::SendIfCond, IF_COND_ARG) == 1 {
            // SD version 2: check that the card accepts our voltage range.
            let mut r7 = [0; 4];
            self.bus.receive(&mut r7);
            tracing::trace!(?r7, "SEND_IF_COND");
            if r7[2] != 0x01 || r7[3] != 0xAA {
                tracing::warn!(?r7, "card rejected voltage range");
                return CardType::NONE;
            }

            if !self.wait_powered_up(Command::SdSendOpCond, HCS) {
                return CardType::NONE;
            }
            if self.send_command(Command::ReadOcr, 0) != 0 {
                return CardType::NONE;
            }
            let mut ocr = [0; 4];
            self.bus.receive(&mut ocr);
            let ocr = Ocr::from_be_bytes(ocr);
            tracing::trace!(?ocr, "READ_OCR");
            CardType::new()
                .with(CardType::SD2, true)
                .with(CardType::BLOCK, ocr.get(Ocr::CCS))
        } else {
            // SD version 1 or MMC version 3.
            let (card_type, cmd) = if self.send_command(Command::SdSendOpCond, 0) <= 1 {
                (CardType::new().with(CardType::SD1, true), Command::SdSendOpCond)
            } else {
                (CardType::new().with(CardType::MMC, true), Command::SendOpCond)
            };

            if !self.wait_powered_up(cmd, 0) {
                return CardType::NONE;
            }
            if self.send_command(Command::SetBlockLen, SECTOR_SIZE as u32) != 0 {
                return CardType::NONE;
            }
            card_type
        }
    }

    /// Repeats `cmd` until the card leaves the idle state or the negotiation
    /// window closes.
    fn wait_powered_up(&mut self, cmd: Command, arg: u32) -> bool {
        loop {
            if self.send_command(cmd, arg) == 0 {
                return true;
            }
            if self.isr.timeouts().window.is_expired() {
                tracing::warn!(?cmd, "card did not leave the idle state");
                return false;
            }
        }
    }

    fn read_csd(&mut self) -> Option<[u8; 16]> {
        let mut csd = [0; 16];
        if self.send_command(Command::SendCsd, 0) == 0 && self.receive_block(&mut csd) {
            Some(csd)
        } else {
            None
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Protocol primitives
    ////////////////////////////////////////////////////////////////////////////

    /// Checks the preconditions of a block transfer and returns the command
    /// argument addressing `sector`.
    pub(crate) fn check_transfer(
        &self,
        len: usize,
        sector: u32,
        count: u32,
        write: bool,
    ) -> Result<u32, TransferResult> {
        let needed = (count as usize).checked_mul(SECTOR_SIZE);
        if count == 0 || needed.map_or(true, |needed| len < needed) {
            return Err(TransferResult::InvalidParameter);
        }
        if self.status.get(DriveStatus::NOT_INITIALIZED) || self.transfer.is_some() {
            return Err(TransferResult::NotReady);
        }
        if write && self.status.get(DriveStatus::WRITE_PROTECTED) {
            return Err(TransferResult::WriteProtected);
        }
        if self.card_type.is_block_addressed() {
            Ok(sector)
        } else {
            sector
                .checked_mul(SECTOR_SIZE as u32)
                .ok_or(TransferResult::InvalidParameter)
        }
    }

    /// Sends a command and returns its `R1` response.
    ///
    /// Application commands are preceded by `APP_CMD`; if that fails, its
    /// response is returned instead. Returns `0xFF` if the card did not
    /// respond, or stayed busy.
    pub(crate) fn send_command(&mut self, cmd: Command, arg: u32) -> u8 {
        if cmd.is_app() {
            let r1 = self.send_command_raw(Command::AppCmd, 0);
            if r1 > 1 {
                return r1;
            }
        }
        self.send_command_raw(cmd, arg)
    }

    fn send_command_raw(&mut self, cmd: Command, arg: u32) -> u8 {
        // `STOP_TRANSMISSION` interrupts a read in progress, and must not wait
        // for the card.
        if cmd != Command::StopTransmission {
            self.deselect();
            if !self.select() {
                tracing::debug!(?cmd, arg, "card busy");
                return FILLER;
            }
        }

        self.bus.transmit(&cmd.frame(arg));
        if cmd == Command::StopTransmission {
            // stuff byte
            self.bus.exchange(FILLER);
        }

        let mut r1 = FILLER;
        for _ in 0..self.settings.response_attempts {
            r1 = self.bus.exchange(FILLER);
            if r1 & 0x80 == 0 {
                break;
            }
        }
        tracing::trace!(?cmd, arg, r1, "command");
        r1
    }

    /// Asserts chip-select and waits for the card to be ready.
    pub(crate) fn select(&mut self) -> bool {
        self.bus.select();
        self.bus.flush();
        if self.wait_ready() {
            return true;
        }
        self.deselect();
        false
    }

    /// Deasserts chip-select, then clocks one byte so the card releases its
    /// data-out line.
    pub(crate) fn deselect(&mut self) {
        self.bus.deselect();
        self.bus.exchange(FILLER);
    }

    /// Waits for the card to stop signalling busy.
    pub(crate) fn wait_ready(&mut self) -> bool {
        let isr = self.isr;
        let timeout = &isr.timeouts().command;
        timeout.arm(self.settings.ready_timeout_ms);
        loop {
            if self.bus.exchange(FILLER) == FILLER {
                return true;
            }
            if timeout.is_expired() {
                return false;
            }
        }
    }

    /// Waits for the start token of a data block sent by the card.
    pub(crate) fn wait_data_token(&mut self) -> bool {
        let isr = self.isr;
        let timeout = &isr.timeouts().data;
        timeout.arm(self.settings.token_timeout_ms);
        let token = loop {
            let token = self.bus.exchange(FILLER);
            if token != FILLER || timeout.is_expired() {
                break token;
            }
        };
        if token != TOKEN_START_BLOCK {
            tracing::debug!(token, "no data token");
            return false;
        }
        true
    }

    /// Receives a data block into `buf`.
    pub(crate) fn receive_block(&mut self, buf: &mut [u8]) -> bool {
        if !self.wait_data_token() {
            return false;
        }
        self.bus.receive(buf);
        let mut crc = [0; 2];
        self.bus.receive(&mut crc);
        true
    }

    /// Sends `token`, followed by `block` if there is one.
    ///
    /// With the stop token, only the token is sent.
    pub(crate) fn transmit_block(&mut self, block: Option<&[u8]>, token: u8) -> bool {
        if !self.wait_ready() {
            return false;
        }
        self.bus.exchange(token);
        if token == TOKEN_STOP_TRAN {
            return true;
        }
        if let Some(block) = block {
            self.bus.transmit(block);
        }
        self.finish_written_block()
    }

    /// Sends the dummy CRC of a block whose data was just sent, and checks the
    /// card's data response.
    pub(crate) fn finish_written_block(&mut self) -> bool {
        self.bus.transmit(&[FILLER, FILLER]);
        let response = self.bus.exchange(FILLER);
        if response & DATA_RESPONSE_MASK != DATA_ACCEPTED {
            tracing::debug!(response, "data rejected");
            return false;
        }
        true
    }
}

impl<S: SpiBus, D: SpiDma> BlockDevice for SdCard<'_, S, D> {
    fn initialize(&mut self) -> DriveStatus {
        SdCard::initialize(self)
    }

    fn status(&self) -> DriveStatus {
        SdCard::status(self)
    }

    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> TransferResult {
        SdCard::read(self, buf, sector, count)
    }

    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> TransferResult {
        SdCard::write(self, buf, sector, count)
    }

    fn ioctl(&mut self, ctl: Ioctl) -> Result<u32, TransferResult> {
        SdCard::ioctl(self, ctl)
    }
}
