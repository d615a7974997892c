//! # SD/MMC cards over SPI
//!
//! This crate drives SD (v1 and v2, byte- and block-addressed) and MMC memory
//! cards through the restricted SPI-mode command set. It is split into the
//! same layers as the rest of the platform drivers:
//!
//! * The **platform** provides the peripheral access: a [`SpiBus`] that can
//!   exchange single bytes, toggle chip-select and switch the bus clock, and a
//!   [`SpiDma`] engine that can stream a buffer through the SPI data register
//!   without the CPU.
//! * The **interrupt handlers** share a small amount of lock-free state with
//!   the driver through an [`IsrData`]: the 1ms timer tick decrements the
//!   timeout countdowns, and the DMA completion interrupt publishes the
//!   outcome of a transfer.
//! * The **driver**, [`SdCard`], owns the bus and implements the protocol:
//!   negotiation, polling block I/O, DMA block I/O and the CSD queries.
//!
//! Storage-class layers (such as a USB mass-storage class) consume the driver
//! through the [`BlockDevice`] trait. The [`msc`] module implements the
//! "memory callbacks" such a class expects on top of any [`BlockDevice`].
//!
//! ## Wiring it up
//!
//! ```rust,ignore
//! static SD_ISR: sdspi::IsrData = sdspi::IsrData::new();
//!
//! // in the 1ms timer interrupt:
//! SD_ISR.on_tick();
//!
//! // in the DMA "transfer finished" interrupt, after the platform code has
//! // cleared the flag and disabled the channels:
//! SD_ISR.on_dma_complete(!transfer_error);
//!
//! // in the task:
//! let mut card = sdspi::SdCard::new(bus, dma, &SD_ISR, Default::default());
//! if !card.initialize().get(sdspi::DriveStatus::NOT_INITIALIZED) {
//!     card.read(&mut buf, 0, 1);
//! }
//! ```
#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

pub mod blocking;
pub mod bus;
pub mod card;
pub mod csd;
pub mod device;
pub mod dma;
pub mod msc;
pub mod proto;
pub mod selftest;
pub mod settings;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod timeout;

pub use self::{
    bus::{Speed, SpiBus},
    card::SdCard,
    device::{BlockDevice, Ioctl, TransferResult},
    dma::{DmaStatus, IsrData, Rejected, SpiDma},
    proto::{CardType, DriveStatus},
    settings::SdSpiSettings,
};

/// The size of a single block on the card, in bytes.
///
/// SPI-mode transfers always use 512-byte blocks: block-addressed cards have
/// a fixed block length, and byte-addressed cards are switched to it with
/// `SET_BLOCKLEN` during negotiation.
pub const SECTOR_SIZE: usize = 512;

#[cfg(test)]
pub(crate) fn trace_init() {
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        prelude::*,
    };

    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    let filter = if env.is_empty() {
        builder.parse("sdspi=debug").unwrap()
    } else {
        builder.parse_lossy(env)
    };

    let _res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .without_time()
        .finish()
        .try_init();
}
