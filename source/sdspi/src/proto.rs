//! SD SPI-mode protocol constants: commands, tokens and the bit layouts of the
//! registers and responses the driver looks at.

use mycelium_bitfield::bitfield;

/// Filler byte clocked out while receiving, and read back from an idle card.
pub const FILLER: u8 = 0xFF;

/// Start token for a single-block write, and for every block sent by the card
/// on reads.
pub const TOKEN_START_BLOCK: u8 = 0xFE;

/// Start token for each block of a multiple-block write.
pub const TOKEN_START_MULTI_WRITE: u8 = 0xFC;

/// Stop token ending a multiple-block write.
pub const TOKEN_STOP_TRAN: u8 = 0xFD;

/// Mask applied to the data response byte following a written block.
pub const DATA_RESPONSE_MASK: u8 = 0x1F;

/// Data response value (after masking) meaning "data accepted".
pub const DATA_ACCEPTED: u8 = 0x05;

/// Argument for `SEND_IF_COND`: 2.7-3.6V supply, check pattern `0xAA`.
pub const IF_COND_ARG: u32 = 0x0000_01AA;

/// `ACMD41` argument bit announcing that the host supports high capacity
/// cards.
pub const HCS: u32 = 1 << 30;

/// Commands used by the driver.
///
/// Application-specific commands (`ACMDxx`) must be preceded by
/// [`Command::AppCmd`]; [`Command::is_app`] tells them apart.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// `GO_IDLE_STATE` (`CMD0`): software reset, enters SPI mode.
    GoIdleState,
    /// `SEND_OP_COND` (`CMD1`): start initialization (MMC).
    SendOpCond,
    /// `SEND_IF_COND` (`CMD8`): check voltage range (SD v2 only).
    SendIfCond,
    /// `SEND_CSD` (`CMD9`): read the card-specific data register.
    SendCsd,
    /// `STOP_TRANSMISSION` (`CMD12`): end a multiple-block read.
    StopTransmission,
    /// `SET_BLOCKLEN` (`CMD16`).
    SetBlockLen,
    /// `READ_SINGLE_BLOCK` (`CMD17`).
    ReadSingleBlock,
    /// `READ_MULTIPLE_BLOCK` (`CMD18`).
    ReadMultipleBlock,
    /// `SET_WR_BLK_ERASE_COUNT` (`ACMD23`): pre-erase hint (SD only).
    SetWrBlkEraseCount,
    /// `WRITE_BLOCK` (`CMD24`).
    WriteBlock,
    /// `WRITE_MULTIPLE_BLOCK` (`CMD25`).
    WriteMultipleBlock,
    /// `SD_SEND_OP_COND` (`ACMD41`): start initialization (SD).
    SdSendOpCond,
    /// `APP_CMD` (`CMD55`): the next command is application-specific.
    AppCmd,
    /// `READ_OCR` (`CMD58`).
    ReadOcr,
}

impl Command {
    /// The command index sent in the first byte of the frame.
    #[must_use]
    pub const fn index(self) -> u8 {
        match self {
            Self::GoIdleState => 0,
            Self::SendOpCond => 1,
            Self::SendIfCond => 8,
            Self::SendCsd => 9,
            Self::StopTransmission => 12,
            Self::SetBlockLen => 16,
            Self::ReadSingleBlock => 17,
            Self::ReadMultipleBlock => 18,
            Self::SetWrBlkEraseCount => 23,
            Self::WriteBlock => 24,
            Self::WriteMultipleBlock => 25,
            Self::SdSendOpCond => 41,
            Self::AppCmd => 55,
            Self::ReadOcr => 58,
        }
    }

    /// Returns `true` if this is an application-specific command.
    #[must_use]
    pub const fn is_app(self) -> bool {
        matches!(self, Self::SetWrBlkEraseCount | Self::SdSendOpCond)
    }

    /// The CRC byte that ends the frame.
    ///
    /// CRC checking is off in SPI mode, except for the two commands that may
    /// be sent before the card knows it is in SPI mode. Everything else gets
    /// a structurally valid filler (end bit set).
    #[must_use]
    pub const fn crc(self) -> u8 {
        match self {
            Self::GoIdleState => 0x95,
            Self::SendIfCond => 0x87,
            _ => 0x01,
        }
    }

    /// Builds the 6-byte command frame.
    #[must_use]
    pub const fn frame(self, arg: u32) -> [u8; 6] {
        let [a3, a2, a1, a0] = arg.to_be_bytes();
        [0x40 | self.index(), a3, a2, a1, a0, self.crc()]
    }
}

bitfield! {
    /// Drive status flags, as reported by [`SdCard::status`].
    ///
    /// [`SdCard::status`]: crate::SdCard::status
    #[derive(PartialEq, Eq)]
    pub struct DriveStatus<u8> {
        /// The card has not been (successfully) initialized.
        pub const NOT_INITIALIZED: bool;
        /// There is no card in the socket.
        pub const NO_MEDIUM: bool;
        /// The card is write protected.
        pub const WRITE_PROTECTED: bool;
    }
}

bitfield! {
    /// The kind of card found during negotiation.
    ///
    /// An empty value means that no usable card was found.
    #[derive(PartialEq, Eq)]
    pub struct CardType<u8> {
        /// MMC, version 3.
        pub const MMC: bool;
        /// SD, version 1.x.
        pub const SD1: bool;
        /// SD, version 2.0 or later.
        pub const SD2: bool;
        /// The card is addressed in 512-byte blocks rather than bytes
        /// (SDHC/SDXC).
        pub const BLOCK: bool;
    }
}

bitfield! {
    /// An `R1` response.
    ///
    /// A valid response always has the top bit clear; the card sends `0xFF`
    /// while it has nothing to say.
    #[derive(PartialEq, Eq)]
    pub struct R1<u8> {
        /// The card is in the idle state, running its initialization.
        pub const IDLE: bool;
        pub const ERASE_RESET: bool;
        /// The command is not supported by this card.
        pub const ILLEGAL_COMMAND: bool;
        pub const COM_CRC_ERROR: bool;
        pub const ERASE_SEQUENCE_ERROR: bool;
        pub const ADDRESS_ERROR: bool;
        pub const PARAMETER_ERROR: bool;
        const START: bool;
    }
}

bitfield! {
    /// The operation conditions register, as returned by `READ_OCR`.
    #[derive(PartialEq, Eq)]
    pub struct Ocr<u32> {
        const _RESERVED_0 = 15;
        /// Supported supply voltages, 2.7V to 3.6V in 100mV steps.
        pub const VOLTAGE_WINDOW = 9;
        const _RESERVED_1 = 6;
        /// Card capacity status: set for block-addressed cards.
        pub const CCS: bool;
        /// Cleared while the card is still powering up.
        pub const POWERED_UP: bool;
    }
}

impl CardType {
    /// No card was found.
    pub const NONE: Self = Self::new();

    /// Returns `true` for SD cards of either version.
    #[must_use]
    pub fn is_sd(self) -> bool {
        self.get(Self::SD1) || self.get(Self::SD2)
    }

    /// Returns `true` if sectors are sent as-is rather than as byte offsets.
    #[must_use]
    pub fn is_block_addressed(self) -> bool {
        self.get(Self::BLOCK)
    }

    /// Returns `true` if no card was found.
    #[must_use]
    pub fn is_none(self) -> bool {
        self.bits() == 0
    }
}

impl DriveStatus {
    /// Status of a driver that has not attempted initialization yet.
    #[must_use]
    pub fn uninitialized() -> Self {
        Self::new().with(Self::NOT_INITIALIZED, true)
    }
}

impl Ocr {
    /// Assembles the OCR from the four bytes following the `R1`, most
    /// significant first.
    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self::from_bits(u32::from_be_bytes(bytes))
    }
}
