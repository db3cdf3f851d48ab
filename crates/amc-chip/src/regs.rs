//! Xilinx AXI CDMA register map, as defined in Xilinx PG034.
//!
//! Only simple (non scatter-gather) mode is used.
//!
//! ```text
//! 0x00  CDMACR            control
//! 0x04  CDMASR            status
//! 0x08  CURDESC_PNTR      scatter gather only
//! 0x0C  CURDESC_PNTR_MSB  scatter gather only
//! 0x10  TAILDESC_PNTR     scatter gather only
//! 0x14  TAILDESC_PNTR_MSB scatter gather only
//! 0x18  SA                source address, lower 32 bits
//! 0x1C  SA_MSB            source address, upper 32 bits
//! 0x20  DA                destination address, lower 32 bits
//! 0x24  DA_MSB            destination address, upper 32 bits
//! 0x28  BTT               bytes to transfer, writing triggers the DMA
//! ```

/// CDMA control register.
pub const CDMACR: usize = 0x00;
/// CDMA status register.
pub const CDMASR: usize = 0x04;
/// Source address, lower 32 bits.
pub const SA: usize = 0x18;
/// Source address, upper 32 bits.
pub const SA_MSB: usize = 0x1C;
/// Destination address, lower 32 bits.
pub const DA: usize = 0x20;
/// Destination address, upper 32 bits.
pub const DA_MSB: usize = 0x24;
/// Bytes to transfer. Writing this register starts the transfer.
pub const BTT: usize = 0x28;

/// Size of the register block.
pub const REGISTER_SPAN: usize = 0x2C;

/// The byte count register is 23 bits wide.
pub const BTT_BITS: u32 = 23;

/// Largest value the byte count register accepts.
pub const BTT_MAX: usize = (1 << BTT_BITS) - 1;

/// Control register bit definitions.
pub mod control {
    /// Enable interrupt on error.
    pub const ERR_IRQ_EN: u32 = 1 << 14;
    /// Enable completion interrupt.
    pub const IRQ_EN: u32 = 1 << 12;
    /// Force soft reset of controller. Self-clearing.
    pub const RESET: u32 = 1 << 2;
}

/// Status register bit definitions.
pub mod status {
    /// DMA error event seen.
    pub const ERR_IRQ: u32 = 1 << 14;
    /// DMA completion event seen.
    pub const IOC_IRQ: u32 = 1 << 12;
    /// Address decode error seen.
    pub const DEC_ERR: u32 = 1 << 6;
    /// Slave response error seen.
    pub const SLV_ERR: u32 = 1 << 5;
    /// DMA internal error seen.
    pub const INT_ERR: u32 = 1 << 4;
    /// Last command completed.
    pub const IDLE: u32 = 1 << 1;

    /// Any of the transfer error bits.
    pub const ERROR_MASK: u32 = DEC_ERR | SLV_ERR | INT_ERR;
    /// Latched interrupt bits, cleared by writing them back.
    pub const IRQ_MASK: u32 = ERR_IRQ | IOC_IRQ;
}
