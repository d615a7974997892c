//! The storage callbacks of a USB mass-storage class, on top of a
//! [`BlockDevice`].
//!
//! A mass-storage class asks its medium whether it is ready before most SCSI
//! commands. [`Medium`] turns that into the re-probe policy expected from
//! removable media: any transfer failure marks the medium absent, and the next
//! readiness check tries to initialize the card again. Pulling a card out and
//! putting another one in therefore works without resetting the device.
use core::fmt;

use crate::{
    device::{BlockDevice, Ioctl, TransferResult},
    proto::DriveStatus,
};

/// A single-LUN mass-storage medium backed by a block device.
#[derive(Debug)]
pub struct Medium<D> {
    dev: D,
    ready: bool,
    block_count: u32,
    block_size: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MediumError {
    /// No initialized medium: the host should report "medium not present".
    NotPresent,
    /// The medium is write protected.
    WriteProtected,
    /// The transfer failed.
    Transfer(TransferResult),
}

impl<D: BlockDevice> Medium<D> {
    pub fn new(dev: D) -> Self {
        Self {
            dev,
            ready: false,
            block_count: 0,
            block_size: 0,
        }
    }

    /// Initializes the device and caches its geometry.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    pub fn init(&mut self) -> Result<(), MediumError> {
        self.ready = false;
        let status = self.dev.initialize();
        if status.get(DriveStatus::NOT_INITIALIZED) {
            return Err(MediumError::NotPresent);
        }

        let block_count = self
            .dev
            .ioctl(Ioctl::GetSectorCount)
            .map_err(MediumError::Transfer)?;
        let block_size = self
            .dev
            .ioctl(Ioctl::GetSectorSize)
            .map_err(MediumError::Transfer)?;
        tracing::debug!(block_count, block_size, "medium ready");

        self.block_count = block_count;
        self.block_size = block_size;
        self.ready = true;
        Ok(())
    }

    /// Returns `true` if the medium can be accessed, re-probing the device if
    /// it is not.
    pub fn is_ready(&mut self) -> bool {
        if self.ready && !self.dev.status().get(DriveStatus::NOT_INITIALIZED) {
            return true;
        }
        self.init().is_ok()
    }

    #[must_use]
    pub fn is_write_protected(&self) -> bool {
        self.dev.status().get(DriveStatus::WRITE_PROTECTED)
    }

    pub fn read(&mut self, lba: u32, buf: &mut [u8], blocks: u32) -> Result<(), MediumError> {
        if !self.ready {
            return Err(MediumError::NotPresent);
        }
        let res = self.dev.read(buf, lba, blocks);
        self.complete(res)
    }

    pub fn write(&mut self, lba: u32, buf: &[u8], blocks: u32) -> Result<(), MediumError> {
        if !self.ready {
            return Err(MediumError::NotPresent);
        }
        let res = self.dev.write(buf, lba, blocks);
        self.complete(res)
    }

    /// Returns the block size, in bytes, or 0 if the medium is not ready.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        if self.ready {
            self.block_size
        } else {
            0
        }
    }

    /// Returns the number of blocks, or 0 if the medium is not ready.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        if self.ready {
            self.block_count
        } else {
            0
        }
    }

    /// Returns the highest logical unit number. There is only one.
    #[must_use]
    pub fn max_lun(&self) -> u8 {
        0
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    pub fn into_inner(self) -> D {
        self.dev
    }

    fn complete(&mut self, res: TransferResult) -> Result<(), MediumError> {
        match res {
            TransferResult::Ok => Ok(()),
            TransferResult::WriteProtected => Err(MediumError::WriteProtected),
            TransferResult::NotReady | TransferResult::Error => {
                tracing::debug!(%res, "transfer failed, medium will be re-probed");
                self.ready = false;
                Err(MediumError::Transfer(res))
            }
            TransferResult::InvalidParameter => Err(MediumError::Transfer(res)),
        }
    }
}

impl fmt::Display for MediumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPresent => f.write_str("medium not present"),
            Self::WriteProtected => f.write_str("medium is write protected"),
            Self::Transfer(res) => write!(f, "transfer failed: {res}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sim::{leak_isr, pattern, Kind, SimCard},
        SECTOR_SIZE,
    };

    #[test]
    fn geometry() {
        crate::trace_init();
        let sim = SimCard::new(Kind::Sd1, leak_isr());
        let mut medium = Medium::new(sim.driver());
        assert_eq!(medium.block_count(), 0);
        assert_eq!(medium.max_lun(), 0);

        medium.init().unwrap();
        assert!(medium.is_ready());
        assert_eq!(medium.block_size(), 512);
        assert_eq!(medium.block_count(), sim.capacity());
        assert!(!medium.is_write_protected());
    }

    #[test]
    fn read_write() {
        crate::trace_init();
        let sim = SimCard::sdhc(leak_isr());
        let mut medium = Medium::new(sim.driver());
        assert!(medium.is_ready());

        let mut data = [0; 2 * SECTOR_SIZE];
        data[..SECTOR_SIZE].copy_from_slice(&pattern(1));
        data[SECTOR_SIZE..].copy_from_slice(&pattern(2));
        medium.write(10, &data, 2).unwrap();
        assert_eq!(sim.sector(11), pattern(2));

        let mut buf = [0; 2 * SECTOR_SIZE];
        medium.read(10, &mut buf, 2).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn reprobes_after_removal() {
        crate::trace_init();
        let sim = SimCard::sdhc(leak_isr());
        let mut medium = Medium::new(sim.driver());
        assert!(medium.is_ready());

        sim.set_present(false);
        let mut buf = [0; SECTOR_SIZE];
        assert_eq!(
            medium.read(0, &mut buf, 1),
            Err(MediumError::Transfer(TransferResult::Error))
        );
        assert_eq!(medium.read(0, &mut buf, 1), Err(MediumError::NotPresent));
        assert!(!medium.is_ready());
        assert!(medium.device().status().get(DriveStatus::NO_MEDIUM));
        assert_eq!(medium.block_count(), 0);

        // a card is inserted again
        sim.set_present(true);
        assert!(medium.is_ready());
        assert_eq!(medium.block_count(), sim.capacity());
        medium.read(0, &mut buf, 1).unwrap();
    }

    #[test]
    fn not_present() {
        crate::trace_init();
        let sim = SimCard::sdhc(leak_isr()).with_ready_after(None);
        let mut medium = Medium::new(sim.driver());
        assert_eq!(medium.init(), Err(MediumError::NotPresent));
        assert!(!medium.is_ready());
        let buf = [0; SECTOR_SIZE];
        assert_eq!(medium.write(0, &buf, 1), Err(MediumError::NotPresent));
    }

    #[test]
    fn write_protected() {
        crate::trace_init();
        let sim = SimCard::sdhc(leak_isr());
        sim.set_write_protected(true);
        let mut medium = Medium::new(sim.driver());
        assert!(medium.is_ready());
        assert!(medium.is_write_protected());

        let buf = [0; SECTOR_SIZE];
        assert_eq!(medium.write(0, &buf, 1), Err(MediumError::WriteProtected));
        // write protection does not take the medium offline
        assert!(medium.is_ready());
    }
}
