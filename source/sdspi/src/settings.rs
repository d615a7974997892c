//! Driver timing configuration, loadable from a TOML table.
use serde::{Deserialize, Serialize};

/// Timeouts and retry budgets used by the driver.
///
/// The defaults are the values recommended by the SD physical layer
/// specification for SPI mode and work with every card we have seen. Boards
/// with slow or marginal wiring may want longer timeouts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SdSpiSettings {
    /// Number of `0xFF` bytes clocked out with chip-select high before the
    /// first command. The card needs at least 74 clocks to power up.
    pub init_clock_bytes: u8,
    /// How long the card may take to leave the idle state during
    /// negotiation, in milliseconds.
    pub init_timeout_ms: u32,
    /// How long the card may stay busy before a command or a written block,
    /// in milliseconds.
    pub ready_timeout_ms: u32,
    /// How long to wait for the start token of a block being read, in
    /// milliseconds.
    pub token_timeout_ms: u32,
    /// How long a single DMA block transfer may take before it is aborted,
    /// in milliseconds.
    pub dma_timeout_ms: u32,
    /// Number of bytes clocked while waiting for a command response.
    pub response_attempts: u8,
}

impl SdSpiSettings {
    pub const DEFAULT_INIT_CLOCK_BYTES: u8 = 10;
    pub const DEFAULT_INIT_TIMEOUT_MS: u32 = 1000;
    pub const DEFAULT_READY_TIMEOUT_MS: u32 = 500;
    pub const DEFAULT_TOKEN_TIMEOUT_MS: u32 = 200;
    pub const DEFAULT_DMA_TIMEOUT_MS: u32 = 500;
    pub const DEFAULT_RESPONSE_ATTEMPTS: u8 = 10;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            init_clock_bytes: Self::DEFAULT_INIT_CLOCK_BYTES,
            init_timeout_ms: Self::DEFAULT_INIT_TIMEOUT_MS,
            ready_timeout_ms: Self::DEFAULT_READY_TIMEOUT_MS,
            token_timeout_ms: Self::DEFAULT_TOKEN_TIMEOUT_MS,
            dma_timeout_ms: Self::DEFAULT_DMA_TIMEOUT_MS,
            response_attempts: Self::DEFAULT_RESPONSE_ATTEMPTS,
        }
    }

    pub fn with_init_clock_bytes(self, init_clock_bytes: u8) -> Self {
        Self {
            init_clock_bytes,
            ..self
        }
    }

    pub fn with_init_timeout_ms(self, init_timeout_ms: u32) -> Self {
        Self {
            init_timeout_ms,
            ..self
        }
    }

    pub fn with_ready_timeout_ms(self, ready_timeout_ms: u32) -> Self {
        Self {
            ready_timeout_ms,
            ..self
        }
    }

    pub fn with_token_timeout_ms(self, token_timeout_ms: u32) -> Self {
        Self {
            token_timeout_ms,
            ..self
        }
    }

    pub fn with_dma_timeout_ms(self, dma_timeout_ms: u32) -> Self {
        Self {
            dma_timeout_ms,
            ..self
        }
    }

    pub fn with_response_attempts(self, response_attempts: u8) -> Self {
        Self {
            response_attempts,
            ..self
        }
    }
}

impl Default for SdSpiSettings {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_is_default() {
        let settings: SdSpiSettings = toml::from_str("").unwrap();
        assert_eq!(settings, SdSpiSettings::default());
    }

    #[test]
    fn partial_table() {
        let settings: SdSpiSettings = toml::from_str(
            r#"
            init_timeout_ms = 2000
            response_attempts = 16
            "#,
        )
        .unwrap();
        assert_eq!(
            settings,
            SdSpiSettings::default()
                .with_init_timeout_ms(2000)
                .with_response_attempts(16)
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let res = toml::from_str::<SdSpiSettings>("init_timeout = 2000");
        assert!(res.is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let settings = SdSpiSettings::default().with_dma_timeout_ms(50);
        let text = toml::to_string(&settings).unwrap();
        assert_eq!(toml::from_str::<SdSpiSettings>(&text).unwrap(), settings);
    }
}
