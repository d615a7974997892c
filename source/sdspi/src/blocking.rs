//! Polling block I/O.
//!
//! Every byte of the transfer is moved by the CPU, so these operations return
//! only once the transfer has finished.
use crate::{
    bus::SpiBus,
    card::SdCard,
    device::TransferResult,
    dma::SpiDma,
    proto::{Command, TOKEN_START_BLOCK, TOKEN_START_MULTI_WRITE, TOKEN_STOP_TRAN},
    SECTOR_SIZE,
};

impl<S: SpiBus, D: SpiDma> SdCard<'_, S, D> {
    /// Reads `count` blocks beginning at `sector` into `buf`.
    ///
    /// `buf` must hold at least `count * 512` bytes.
    #[tracing::instrument(
        level = tracing::Level::DEBUG,
        skip(self, buf),
        fields(len = buf.len()),
    )]
    pub fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> TransferResult {
        let addr = match self.check_transfer(buf.len(), sector, count, false) {
            Ok(addr) => addr,
            Err(res) => return res,
        };
        let mut blocks = buf[..count as usize * SECTOR_SIZE].chunks_exact_mut(SECTOR_SIZE);

        let ok = if count == 1 {
            self.send_command(Command::ReadSingleBlock, addr) == 0
                && blocks.all(|block| self.receive_block(block))
        } else if self.send_command(Command::ReadMultipleBlock, addr) == 0 {
            let ok = blocks.all(|block| self.receive_block(block));
            self.send_command(Command::StopTransmission, 0);
            ok
        } else {
            false
        };
        self.deselect();

        if ok {
            TransferResult::Ok
        } else {
            tracing::warn!(sector, count, "read failed");
            TransferResult::Error
        }
    }

    /// Writes `count` blocks from `buf`, beginning at `sector`.
    ///
    /// `buf` must hold at least `count * 512` bytes.
    #[tracing::instrument(
        level = tracing::Level::DEBUG,
        skip(self, buf),
        fields(len = buf.len()),
    )]
    pub fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> TransferResult {
        let addr = match self.check_transfer(buf.len(), sector, count, true) {
            Ok(addr) => addr,
            Err(res) => return res,
        };
        let mut blocks = buf[..count as usize * SECTOR_SIZE].chunks_exact(SECTOR_SIZE);

        let ok = if count == 1 {
            self.send_command(Command::WriteBlock, addr) == 0
                && blocks.all(|block| self.transmit_block(Some(block), TOKEN_START_BLOCK))
        } else {
            if self.card_type.is_sd() {
                self.send_command(Command::SetWrBlkEraseCount, count);
            }
            if self.send_command(Command::WriteMultipleBlock, addr) == 0 {
                let ok = blocks
                    .all(|block| self.transmit_block(Some(block), TOKEN_START_MULTI_WRITE));
                // the stop token is sent even if a block was rejected
                let stopped = self.transmit_block(None, TOKEN_STOP_TRAN);
                ok && stopped
            } else {
                false
            }
        };
        self.deselect();

        if ok {
            TransferResult::Ok
        } else {
            tracing::warn!(sector, count, "write failed");
            TransferResult::Error
        }
    }
}
