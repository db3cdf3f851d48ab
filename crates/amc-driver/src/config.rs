//! Driver configuration

use crate::error::{AmcError, Result};
use amc_chip::bar::PAGE_SIZE;
use amc_chip::pcie::MAX_MINORS_PER_BOARD;
use std::time::Duration;

/// Environment variable overriding [`DriverConfig::dma_block_shift`]
pub const ENV_DMA_BLOCK_SHIFT: &str = "AMC_DMA_BLOCK_SHIFT";

/// Environment variable overriding [`DriverConfig::iova_base`]
pub const ENV_IOVA_BASE: &str = "AMC_IOVA_BASE";

const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();
const MAX_BLOCK_SHIFT: u32 = 30;

/// Settings applied when a card is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// log2 of the host DMA buffer size
    pub dma_block_shift: u32,
    /// IOVA the host buffer is mapped at
    pub iova_base: u64,
    /// Deadline for the DMA controller to leave reset
    pub reset_timeout: Duration,
    /// Device nodes available to one card
    pub max_minors_per_board: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            dma_block_shift: 20,
            iova_base: 0x1000_0000,
            reset_timeout: Duration::from_millis(1),
            max_minors_per_board: MAX_MINORS_PER_BOARD,
        }
    }
}

impl DriverConfig {
    /// Defaults with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if an override does not parse or the result
    /// fails [`DriverConfig::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_DMA_BLOCK_SHIFT) {
            config.dma_block_shift = value.trim().parse().map_err(|_| {
                AmcError::invalid_config(format!("{ENV_DMA_BLOCK_SHIFT}={value} is not a number"))
            })?;
        }
        if let Some(value) = lookup(ENV_IOVA_BASE) {
            config.iova_base = parse_u64(value.trim()).ok_or_else(|| {
                AmcError::invalid_config(format!("{ENV_IOVA_BASE}={value} is not an address"))
            })?;
        }
        config.validate()?;
        tracing::debug!("Driver config: {config:?}");
        Ok(config)
    }

    /// Check the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if !(PAGE_SHIFT..=MAX_BLOCK_SHIFT).contains(&self.dma_block_shift) {
            return Err(AmcError::invalid_config(format!(
                "dma_block_shift {} outside {PAGE_SHIFT}..={MAX_BLOCK_SHIFT}",
                self.dma_block_shift
            )));
        }
        if self.iova_base % PAGE_SIZE as u64 != 0 {
            return Err(AmcError::invalid_config(format!(
                "iova_base {:#x} is not page aligned",
                self.iova_base
            )));
        }
        if self.max_minors_per_board == 0 {
            return Err(AmcError::invalid_config("max_minors_per_board is zero"));
        }
        Ok(())
    }

    /// Host DMA buffer size in bytes
    pub const fn dma_block_size(&self) -> usize {
        1 << self.dma_block_shift
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
