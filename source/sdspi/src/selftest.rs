//! A destructive-but-restoring read/write check of a single sector.
//!
//! Useful as a boot-time diagnostic: the sector's content is backed up,
//! overwritten with a test pattern, read back, compared and then restored.
use core::fmt;

use crate::{
    device::{BlockDevice, TransferResult},
    proto::DriveStatus,
    SECTOR_SIZE,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SelfTest {
    sector: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SelfTestError {
    NoMedium,
    NotInitialized,
    Backup(TransferResult),
    WritePattern(TransferResult),
    ReadBack(TransferResult),
    Mismatch { offset: usize, expected: u8, found: u8 },
    /// The test itself passed (or failed as reported elsewhere), but the
    /// original content could not be written back.
    Restore(TransferResult),
}

impl SelfTest {
    #[must_use]
    pub const fn new(sector: u32) -> Self {
        Self { sector }
    }

    /// Runs the test against an initialized device.
    ///
    /// The backup is written back whenever it was read successfully, even if
    /// the test failed. The first failure is reported.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(dev))]
    pub fn run<D: BlockDevice + ?Sized>(&self, dev: &mut D) -> Result<(), SelfTestError> {
        let status = dev.status();
        if status.get(DriveStatus::NO_MEDIUM) {
            return Err(SelfTestError::NoMedium);
        }
        if status.get(DriveStatus::NOT_INITIALIZED) {
            return Err(SelfTestError::NotInitialized);
        }

        let mut backup = [0u8; SECTOR_SIZE];
        check(dev.read(&mut backup, self.sector, 1)).map_err(SelfTestError::Backup)?;

        let res = self.exercise(dev);
        let restored = check(dev.write(&backup, self.sector, 1)).map_err(SelfTestError::Restore);

        match res.and(restored) {
            Ok(()) => {
                tracing::info!(sector = self.sector, "self-test passed");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(sector = self.sector, ?error, "self-test failed");
                Err(error)
            }
        }
    }

    fn exercise<D: BlockDevice + ?Sized>(&self, dev: &mut D) -> Result<(), SelfTestError> {
        let mut pattern = [0u8; SECTOR_SIZE];
        for (i, byte) in pattern.iter_mut().enumerate() {
            *byte = i as u8;
        }
        check(dev.write(&pattern, self.sector, 1)).map_err(SelfTestError::WritePattern)?;

        let mut readback = [0u8; SECTOR_SIZE];
        check(dev.read(&mut readback, self.sector, 1)).map_err(SelfTestError::ReadBack)?;

        match pattern
            .iter()
            .zip(readback.iter())
            .position(|(expected, found)| expected != found)
        {
            None => Ok(()),
            Some(offset) => Err(SelfTestError::Mismatch {
                offset,
                expected: pattern[offset],
                found: readback[offset],
            }),
        }
    }
}

fn check(res: TransferResult) -> Result<(), TransferResult> {
    match res {
        TransferResult::Ok => Ok(()),
        err => Err(err),
    }
}

impl fmt::Display for SelfTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMedium => f.write_str("no card in socket"),
            Self::NotInitialized => f.write_str("card not initialized"),
            Self::Backup(res) => write!(f, "reading the backup failed: {res}"),
            Self::WritePattern(res) => write!(f, "writing the test pattern failed: {res}"),
            Self::ReadBack(res) => write!(f, "reading the test pattern back failed: {res}"),
            Self::Mismatch {
                offset,
                expected,
                found,
            } => write!(
                f,
                "test pattern mismatch at offset {offset}: expected {expected:#04x}, found {found:#04x}"
            ),
            Self::Restore(res) => write!(f, "restoring the backup failed: {res}"),
        }
    }
}
