//! A simulated SD card, for testing code that uses the driver without
//! hardware.
//!
//! The simulation is byte-accurate at the SPI level: [`SimBus`] feeds every
//! byte the driver sends through a model of the card's SPI-mode state machine
//! and returns what a real card would put on its data-out line. [`SimDma`]
//! moves data through the same model.
//!
//! The 1ms timer is simulated too: every few exchanged bytes, the model calls
//! [`IsrData::on_tick`], so the driver's timeouts expire in a bounded number
//! of bus operations.
//!
//! # DMA completion
//!
//! By default, [`SimDma`] behaves like an engine without a completion
//! interrupt: the transfer happens when the driver polls it. With
//! [`SimCard::with_dma_interrupt`], nothing happens until the test calls
//! [`SimCard::fire_dma_interrupt`], which performs the transfer and then
//! publishes the result the way a platform's interrupt handler would.
use alloc::{
    collections::{BTreeMap, VecDeque},
    rc::Rc,
    vec::Vec,
};
use core::{cell::RefCell, ptr::NonNull};

use crate::{
    bus::{Speed, SpiBus},
    card::SdCard,
    csd,
    dma::{IsrData, SpiDma},
    proto::{FILLER, TOKEN_START_BLOCK, TOKEN_START_MULTI_WRITE, TOKEN_STOP_TRAN},
    settings::SdSpiSettings,
    SECTOR_SIZE,
};

/// The kind of card to simulate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Kind {
    /// SD version 2, block addressed (SDHC).
    Sdhc,
    /// SD version 2, byte addressed (SDSC).
    SdscV2,
    /// SD version 1.
    Sd1,
    /// MMC version 3.
    Mmc,
}

/// A handle to a simulated card, for inspecting and manipulating it.
#[derive(Clone)]
pub struct SimCard {
    model: Rc<RefCell<Model>>,
}

/// The simulated card's SPI bus.
pub struct SimBus {
    model: Rc<RefCell<Model>>,
}

/// The simulated card's DMA engine.
pub struct SimDma {
    model: Rc<RefCell<Model>>,
}

/// `R1` bits
const IDLE: u8 = 0x01;
const ILLEGAL_COMMAND: u8 = 0x04;
const ADDRESS_ERROR: u8 = 0x20;
const PARAMETER_ERROR: u8 = 0x40;

/// Data responses.
const DATA_ACCEPTED: u8 = 0xE5;
const DATA_CRC_ERROR: u8 = 0x0B;

struct Model {
    kind: Kind,
    isr: &'static IsrData,
    csd: [u8; 16],
    capacity: u32,
    sectors: BTreeMap<u32, [u8; SECTOR_SIZE]>,

    present: bool,
    write_protected: bool,
    selected: bool,
    speed: Speed,

    miso: VecDeque<u8>,
    frame: Vec<u8>,
    state: State,
    spi_mode: bool,
    idle: bool,
    app_cmd: bool,
    op_cond_polls: u32,
    ready_after: Option<u32>,
    reject_writes: bool,
    busy_bytes: usize,
    response_delay: usize,
    withhold_token: bool,
    unresponsive: bool,
    stuck_busy: bool,

    exchanges: u64,
    exchanges_per_tick: u32,
    clocks_before_first_command: Option<u64>,
    commands: Vec<(u8, u32)>,

    dma: Option<DmaRequest>,
    dma_interrupt: bool,
}

enum State {
    Command,
    MultiRead { next: u32 },
    WriteToken { sector: u32, multi: bool },
    WriteData { sector: u32, multi: bool, data: Vec<u8> },
}

#[derive(Copy, Clone)]
enum DmaRequest {
    Receive { buf: NonNull<u8>, len: usize },
    Transmit { buf: NonNull<u8>, len: usize },
}

/// Builds a version 2.0 CSD with the given `C_SIZE`.
#[must_use]
pub fn csd_v2(c_size: u32) -> [u8; 16] {
    let mut csd = [0; 16];
    csd[0] = 0x40;
    csd[5] = 0x59;
    csd[7] = (c_size >> 16) as u8 & 0x3F;
    csd[8] = (c_size >> 8) as u8;
    csd[9] = c_size as u8;
    csd
}

/// Builds a version 1.0 CSD with the given capacity fields.
#[must_use]
pub fn csd_v1(read_bl_len: u8, c_size: u16, c_size_mult: u8) -> [u8; 16] {
    let mut csd = [0; 16];
    csd[5] = 0x50 | (read_bl_len & 0x0F);
    csd[6] = (c_size >> 10) as u8 & 0x03;
    csd[7] = (c_size >> 2) as u8;
    csd[8] = (c_size as u8 & 0x03) << 6;
    csd[9] = (c_size_mult >> 1) & 0x03;
    csd[10] = (c_size_mult & 0x01) << 7;
    csd
}

// === impl Kind ===

impl Kind {
    fn is_v2(self) -> bool {
        matches!(self, Self::Sdhc | Self::SdscV2)
    }

    fn csd(self) -> [u8; 16] {
        match self {
            // 8MiB
            Self::Sdhc => csd_v2(15),
            // 16MiB
            Self::SdscV2 => csd_v1(9, 1023, 3),
            Self::Sd1 => {
                let mut csd = csd_v1(9, 1023, 3);
                // SECTOR_SIZE = 127, WRITE_BL_LEN = 9
                csd[10] |= 0x3F;
                csd[11] |= 0x80;
                csd[12] |= 0x02;
                csd[13] |= 0x40;
                csd
            }
            Self::Mmc => {
                let mut csd = csd_v1(9, 1023, 3);
                csd[0] = 0x80;
                // ERASE_GRP_SIZE = 31, ERASE_GRP_MULT = 31
                csd[10] |= 0x7C;
                csd[11] |= 0xE3;
                csd
            }
        }
    }
}

// === impl SimCard ===

impl SimCard {
    /// The number of bytes exchanged per simulated millisecond, unless
    /// changed with [`with_exchanges_per_tick`](Self::with_exchanges_per_tick).
    pub const DEFAULT_EXCHANGES_PER_TICK: u32 = 8;

    /// Returns a new simulated card of the given kind, driving the timeouts in
    /// `isr`.
    #[must_use]
    pub fn new(kind: Kind, isr: &'static IsrData) -> Self {
        let csd = kind.csd();
        let model = Model {
            kind,
            isr,
            csd,
            capacity: csd::sector_count(&csd).unwrap_or(0),
            sectors: BTreeMap::new(),
            present: true,
            write_protected: false,
            selected: false,
            speed: Speed::Low,
            miso: VecDeque::new(),
            frame: Vec::with_capacity(6),
            state: State::Command,
            spi_mode: false,
            idle: true,
            app_cmd: false,
            op_cond_polls: 0,
            ready_after: Some(3),
            reject_writes: false,
            busy_bytes: 4,
            response_delay: 1,
            withhold_token: false,
            unresponsive: false,
            stuck_busy: false,
            exchanges: 0,
            exchanges_per_tick: Self::DEFAULT_EXCHANGES_PER_TICK,
            clocks_before_first_command: None,
            commands: Vec::new(),
            dma: None,
            dma_interrupt: false,
        };
        Self {
            model: Rc::new(RefCell::new(model)),
        }
    }

    /// Returns a new SDHC card.
    #[must_use]
    pub fn sdhc(isr: &'static IsrData) -> Self {
        Self::new(Kind::Sdhc, isr)
    }

    /// Sets how many `SD_SEND_OP_COND`/`SEND_OP_COND` polls the card answers
    /// with "idle" before it is ready. `None` means it never gets ready.
    #[must_use]
    pub fn with_ready_after(self, polls: Option<u32>) -> Self {
        self.model.borrow_mut().ready_after = polls;
        self
    }

    /// Sets how many busy bytes the card sends after each written block.
    #[must_use]
    pub fn with_busy_bytes(self, busy_bytes: usize) -> Self {
        self.model.borrow_mut().busy_bytes = busy_bytes;
        self
    }

    /// Sets how many `0xFF` bytes the card sends before each command
    /// response.
    #[must_use]
    pub fn with_response_delay(self, bytes: usize) -> Self {
        self.model.borrow_mut().response_delay = bytes;
        self
    }

    #[must_use]
    pub fn with_exchanges_per_tick(self, exchanges: u32) -> Self {
        self.model.borrow_mut().exchanges_per_tick = exchanges.max(1);
        self
    }

    /// Completes DMA transfers only when
    /// [`fire_dma_interrupt`](Self::fire_dma_interrupt) is called.
    #[must_use]
    pub fn with_dma_interrupt(self) -> Self {
        self.model.borrow_mut().dma_interrupt = true;
        self
    }

    /// Returns a driver for this card, with default settings.
    #[must_use]
    pub fn driver(&self) -> SdCard<'static, SimBus, SimDma> {
        SdCard::new(self.bus(), self.dma(), self.isr(), SdSpiSettings::default())
    }

    /// Returns the interrupt state this card ticks.
    #[must_use]
    pub fn isr(&self) -> &'static IsrData {
        self.model.borrow().isr
    }

    #[must_use]
    pub fn bus(&self) -> SimBus {
        SimBus {
            model: self.model.clone(),
        }
    }

    #[must_use]
    pub fn dma(&self) -> SimDma {
        SimDma {
            model: self.model.clone(),
        }
    }

    /// Inserts or removes the card.
    ///
    /// Removing the card also loses its negotiated state.
    pub fn set_present(&self, present: bool) {
        let mut model = self.model.borrow_mut();
        model.present = present;
        if !present {
            model.power_off();
        }
    }

    pub fn set_write_protected(&self, write_protected: bool) {
        self.model.borrow_mut().write_protected = write_protected;
    }

    /// Makes the card accept read commands but never send the data start
    /// token.
    pub fn set_withhold_token(&self, withhold: bool) {
        self.model.borrow_mut().withhold_token = withhold;
    }

    /// Makes the card ignore everything on the bus, leaving its data-out line
    /// high.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.model.borrow_mut().unresponsive = unresponsive;
    }

    /// Makes the card hold its data-out line low while selected, as if it
    /// never finished programming.
    pub fn set_stuck_busy(&self, busy: bool) {
        self.model.borrow_mut().stuck_busy = busy;
    }

    /// Makes the card answer every written block with a CRC error.
    pub fn set_reject_writes(&self, reject: bool) {
        self.model.borrow_mut().reject_writes = reject;
    }

    #[must_use]
    pub fn sector(&self, sector: u32) -> [u8; SECTOR_SIZE] {
        self.model.borrow().sector(sector)
    }

    pub fn set_sector(&self, sector: u32, data: &[u8; SECTOR_SIZE]) {
        self.model.borrow_mut().sectors.insert(sector, *data);
    }

    /// Returns the card's capacity, in sectors.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.model.borrow().capacity
    }

    #[must_use]
    pub fn speed(&self) -> Speed {
        self.model.borrow().speed
    }

    /// Returns `true` while chip-select is asserted.
    #[must_use]
    pub fn is_selected(&self) -> bool {
        self.model.borrow().selected
    }

    /// Returns the number of bytes clocked before the first command frame
    /// started.
    #[must_use]
    pub fn clocks_before_first_command(&self) -> Option<u64> {
        self.model.borrow().clocks_before_first_command
    }

    /// Returns the number of bytes exchanged so far, including those moved by
    /// DMA.
    #[must_use]
    pub fn exchanges(&self) -> u64 {
        self.model.borrow().exchanges
    }

    /// Returns the index and argument of every command frame received.
    #[must_use]
    pub fn commands(&self) -> Vec<(u8, u32)> {
        self.model.borrow().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.model.borrow_mut().commands.clear();
    }

    /// Returns `true` if a DMA transfer has been started and not yet
    /// performed.
    #[must_use]
    pub fn dma_pending(&self) -> bool {
        self.model.borrow().dma.is_some()
    }

    /// Performs the pending DMA transfer and signals its completion.
    ///
    /// Returns `false` if there was no pending transfer.
    pub fn fire_dma_interrupt(&self) -> bool {
        let mut model = self.model.borrow_mut();
        let Some(request) = model.dma.take() else {
            return false;
        };
        model.run_dma(request);
        model.isr.on_dma_complete(true);
        true
    }

    /// Signals a failed DMA transfer without moving any data.
    pub fn fail_dma_interrupt(&self) -> bool {
        let mut model = self.model.borrow_mut();
        if model.dma.take().is_none() {
            return false;
        }
        model.isr.on_dma_complete(false);
        true
    }
}

// === impl SimBus ===

impl SpiBus for SimBus {
    fn exchange(&mut self, byte: u8) -> u8 {
        self.model.borrow_mut().exchange(byte)
    }

    fn select(&mut self) {
        self.model.borrow_mut().selected = true;
    }

    fn deselect(&mut self) {
        let mut model = self.model.borrow_mut();
        model.selected = false;
        model.frame.clear();
    }

    fn set_speed(&mut self, speed: Speed) {
        self.model.borrow_mut().speed = speed;
    }

    fn flush(&mut self) {}

    fn card_present(&mut self) -> bool {
        self.model.borrow().present
    }

    fn write_protected(&mut self) -> bool {
        self.model.borrow().write_protected
    }
}

// === impl SimDma ===

impl SpiDma for SimDma {
    unsafe fn start_receive(&mut self, buf: NonNull<u8>, len: usize) {
        self.model.borrow_mut().dma = Some(DmaRequest::Receive { buf, len });
    }

    unsafe fn start_transmit(&mut self, buf: NonNull<u8>, len: usize) {
        self.model.borrow_mut().dma = Some(DmaRequest::Transmit { buf, len });
    }

    fn abort(&mut self) {
        self.model.borrow_mut().dma = None;
    }

    fn poll_complete(&mut self) -> Option<bool> {
        let mut model = self.model.borrow_mut();
        if model.dma_interrupt {
            return None;
        }
        let request = model.dma.take()?;
        model.run_dma(request);
        Some(true)
    }
}

// === impl Model ===

impl Model {
    fn sector(&self, sector: u32) -> [u8; SECTOR_SIZE] {
        self.sectors
            .get(&sector)
            .copied()
            .unwrap_or([0; SECTOR_SIZE])
    }

    fn power_off(&mut self) {
        self.spi_mode = false;
        self.idle = true;
        self.app_cmd = false;
        self.state = State::Command;
        self.miso.clear();
        self.frame.clear();
    }

    fn run_dma(&mut self, request: DmaRequest) {
        match request {
            DmaRequest::Receive { buf, len } => {
                for i in 0..len {
                    let byte = self.exchange(FILLER);
                    // Safety: the driver keeps the buffer alive until the
                    // transfer completes or is aborted.
                    unsafe { buf.as_ptr().add(i).write(byte) };
                }
            }
            DmaRequest::Transmit { buf, len } => {
                for i in 0..len {
                    // Safety: as above.
                    let byte = unsafe { buf.as_ptr().add(i).read() };
                    self.exchange(byte);
                }
            }
        }
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        self.exchanges += 1;
        if self.exchanges % u64::from(self.exchanges_per_tick) == 0 {
            self.isr.on_tick();
        }

        if !self.present || !self.selected || self.unresponsive {
            return FILLER;
        }
        if self.stuck_busy {
            return 0x00;
        }

        if let State::MultiRead { next } = self.state {
            if self.miso.is_empty() && !self.withhold_token {
                self.queue_block(next);
                self.state = State::MultiRead { next: next + 1 };
            }
        }
        let miso = self.miso.pop_front().unwrap_or(FILLER);
        self.receive(mosi);
        miso
    }

    fn receive(&mut self, mosi: u8) {
        match self.state {
            State::Command | State::MultiRead { .. } => {
                if self.frame.is_empty() && mosi & 0xC0 != 0x40 {
                    return;
                }
                if self.clocks_before_first_command.is_none() {
                    self.clocks_before_first_command = Some(self.exchanges - 1);
                }
                self.frame.push(mosi);
                if self.frame.len() == 6 {
                    let frame = core::mem::take(&mut self.frame);
                    let index = frame[0] & 0x3F;
                    let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
                    self.command(index, arg);
                }
            }
            State::WriteToken { sector, multi } => match mosi {
                TOKEN_START_BLOCK if !multi => self.start_write_data(sector, multi),
                TOKEN_START_MULTI_WRITE if multi => self.start_write_data(sector, multi),
                TOKEN_STOP_TRAN if multi => {
                    self.state = State::Command;
                    self.miso.push_back(FILLER);
                    self.queue_busy();
                }
                _ => {}
            },
            State::WriteData {
                sector,
                multi,
                ref mut data,
            } => {
                data.push(mosi);
                // data followed by the two CRC bytes
                if data.len() == SECTOR_SIZE + 2 {
                    let mut block = [0; SECTOR_SIZE];
                    block.copy_from_slice(&data[..SECTOR_SIZE]);
                    self.commit_write(sector, multi, block);
                }
            }
        }
    }

    fn start_write_data(&mut self, sector: u32, multi: bool) {
        self.state = State::WriteData {
            sector,
            multi,
            data: Vec::with_capacity(SECTOR_SIZE + 2),
        };
    }

    fn commit_write(&mut self, sector: u32, multi: bool, block: [u8; SECTOR_SIZE]) {
        if self.reject_writes || sector >= self.capacity {
            self.miso.push_back(DATA_CRC_ERROR);
        } else {
            self.sectors.insert(sector, block);
            self.miso.push_back(DATA_ACCEPTED);
        }
        self.queue_busy();
        self.state = if multi {
            State::WriteToken {
                sector: sector + 1,
                multi,
            }
        } else {
            State::Command
        };
    }

    fn queue_busy(&mut self) {
        for _ in 0..self.busy_bytes {
            self.miso.push_back(0x00);
        }
    }

    fn queue_block(&mut self, sector: u32) {
        let block = self.sector(sector);
        self.miso.push_back(FILLER);
        self.miso.push_back(TOKEN_START_BLOCK);
        self.miso.extend(block);
        self.miso.extend([0x7A, 0x3C]);
    }

    fn sector_for(&self, arg: u32) -> Option<u32> {
        let sector = if self.kind == Kind::Sdhc {
            arg
        } else {
            if arg % SECTOR_SIZE as u32 != 0 {
                return None;
            }
            arg / SECTOR_SIZE as u32
        };
        (sector < self.capacity).then_some(sector)
    }

    fn command(&mut self, index: u8, arg: u32) {
        self.commands.push((index, arg));
        if index != 0 && !self.spi_mode {
            // still in SD mode, the card ignores SPI framing
            return;
        }

        let app = core::mem::replace(&mut self.app_cmd, false);
        let idle = if self.idle { IDLE } else { 0 };
        let mut trailer: Vec<u8> = Vec::new();
        let r1 = match (app, index) {
            (_, 0) => {
                self.spi_mode = true;
                self.idle = true;
                self.op_cond_polls = 0;
                self.state = State::Command;
                IDLE
            }
            (_, 12) => {
                self.state = State::Command;
                self.miso.clear();
                // stuff byte
                self.miso.push_back(FILLER);
                self.miso.push_back(idle);
                return;
            }
            (false, 8) if self.kind.is_v2() => {
                trailer.extend([0x00, 0x00, (arg >> 8) as u8 & 0x0F, arg as u8]);
                idle
            }
            (_, 55) if self.kind != Kind::Mmc => {
                self.app_cmd = true;
                idle
            }
            (true, 41) => self.op_cond(),
            (false, 1) if self.kind == Kind::Mmc => self.op_cond(),
            (false, 58) => {
                let mut ocr: u32 = 0x00FF_8000;
                if !self.idle {
                    ocr |= 1 << 31;
                    if self.kind == Kind::Sdhc {
                        ocr |= 1 << 30;
                    }
                }
                trailer.extend(ocr.to_be_bytes());
                idle
            }
            _ if self.idle => idle | ILLEGAL_COMMAND,
            (false, 16) if arg == SECTOR_SIZE as u32 => 0,
            (false, 16) => PARAMETER_ERROR,
            (false, 9) => {
                trailer.extend([FILLER, TOKEN_START_BLOCK]);
                trailer.extend(self.csd);
                trailer.extend([0x00, 0x01]);
                0
            }
            (false, 17) => match self.sector_for(arg) {
                Some(_) if self.withhold_token => 0,
                Some(sector) => {
                    let block = self.sector(sector);
                    trailer.extend([FILLER, TOKEN_START_BLOCK]);
                    trailer.extend(block);
                    trailer.extend([0x7A, 0x3C]);
                    0
                }
                None => ADDRESS_ERROR,
            },
            (false, 18) => match self.sector_for(arg) {
                Some(next) => {
                    self.state = State::MultiRead { next };
                    0
                }
                None => ADDRESS_ERROR,
            },
            (true, 23) => 0,
            (false, 24) | (false, 25) => match self.sector_for(arg) {
                Some(sector) => {
                    self.state = State::WriteToken {
                        sector,
                        multi: index == 25,
                    };
                    0
                }
                None => ADDRESS_ERROR,
            },
            _ => ILLEGAL_COMMAND,
        };

        self.miso.clear();
        for _ in 0..self.response_delay {
            self.miso.push_back(FILLER);
        }
        self.miso.push_back(r1);
        self.miso.extend(trailer);
    }

    fn op_cond(&mut self) -> u8 {
        self.op_cond_polls += 1;
        match self.ready_after {
            Some(polls) if self.op_cond_polls > polls => {
                self.idle = false;
                0
            }
            _ if self.idle => IDLE,
            _ => 0,
        }
    }
}

/// Returns a new `IsrData` that lives for the rest of the test.
#[cfg(test)]
pub(crate) fn leak_isr() -> &'static IsrData {
    alloc::boxed::Box::leak(alloc::boxed::Box::new(IsrData::new()))
}

/// Returns a zeroed DMA buffer that lives for the rest of the test.
#[cfg(test)]
pub(crate) fn leak_buf(len: usize) -> &'static mut [u8] {
    alloc::boxed::Box::leak(alloc::vec![0u8; len].into_boxed_slice())
}

/// Returns an initialized driver for a new card of the given kind.
#[cfg(test)]
pub(crate) fn ready_card(kind: Kind) -> (SimCard, SdCard<'static, SimBus, SimDma>) {
    crate::trace_init();
    let sim = SimCard::new(kind, leak_isr());
    let mut card = sim.driver();
    let status = card.initialize();
    assert!(
        !status.get(crate::DriveStatus::NOT_INITIALIZED),
        "{kind:?} card did not initialize"
    );
    (sim, card)
}

/// Returns a sector filled with `seed`, `seed + 1`, ...
#[cfg(test)]
pub(crate) fn pattern(seed: u8) -> [u8; SECTOR_SIZE] {
    let mut block = [0; SECTOR_SIZE];
    for (i, byte) in block.iter_mut().enumerate() {
        *byte = seed.wrapping_add(i as u8);
    }
    block
}
