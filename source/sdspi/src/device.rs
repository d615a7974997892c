//! The block-device interface consumed by storage-class layers.
use core::fmt;

use crate::proto::DriveStatus;

/// Result of a block I/O operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferResult {
    /// The operation completed.
    Ok,
    /// The card reported an error, stopped responding or rejected data.
    Error,
    /// The card is write protected.
    WriteProtected,
    /// The card is not initialized, or a DMA transfer is still in flight.
    NotReady,
    /// The request itself was invalid: zero blocks, a buffer too short for
    /// the block count, an address past the end of the addressable range or
    /// an unknown control code.
    InvalidParameter,
}

/// Control operations, numbered like the FatFs `disk_ioctl` codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Ioctl {
    /// Waits until the card has finished any internal write.
    Sync = 0,
    /// Returns the number of 512-byte sectors on the card.
    GetSectorCount = 1,
    /// Returns the sector size, in bytes.
    GetSectorSize = 2,
    /// Returns the erase block size, in sectors.
    GetEraseBlockSize = 3,
}

/// A block storage device.
///
/// Implemented by [`SdCard`](crate::SdCard); storage-class layers (such as
/// the [`msc`](crate::msc) adapter) are written against this trait.
pub trait BlockDevice {
    /// (Re)initializes the device, returning its new status.
    fn initialize(&mut self) -> DriveStatus;

    /// Returns the device's current status without touching the hardware.
    fn status(&self) -> DriveStatus;

    /// Reads `count` sectors starting at `sector` into `buf`.
    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> TransferResult;

    /// Writes `count` sectors starting at `sector` from `buf`.
    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> TransferResult;

    /// Performs a control operation. `Sync` returns `0`.
    fn ioctl(&mut self, ctl: Ioctl) -> Result<u32, TransferResult>;
}

// === impl TransferResult ===

impl TransferResult {
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for TransferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Ok => "ok",
            Self::Error => "card error",
            Self::WriteProtected => "card is write protected",
            Self::NotReady => "card not ready",
            Self::InvalidParameter => "invalid parameter",
        };
        f.write_str(msg)
    }
}

// === impl Ioctl ===

impl TryFrom<u8> for Ioctl {
    type Error = TransferResult;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Sync),
            1 => Ok(Self::GetSectorCount),
            2 => Ok(Self::GetSectorSize),
            3 => Ok(Self::GetEraseBlockSize),
            _ => Err(TransferResult::InvalidParameter),
        }
    }
}

impl<B: BlockDevice + ?Sized> BlockDevice for &mut B {
    fn initialize(&mut self) -> DriveStatus {
        B::initialize(self)
    }

    fn status(&self) -> DriveStatus {
        B::status(self)
    }

    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> TransferResult {
        B::read(self, buf, sector, count)
    }

    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> TransferResult {
        B::write(self, buf, sector, count)
    }

    fn ioctl(&mut self, ctl: Ioctl) -> Result<u32, TransferResult> {
        B::ioctl(self, ctl)
    }
}
