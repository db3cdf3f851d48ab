//! Silicon model for the AMC525 FPGA MTCA card.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what the firmware presents over PCIe: identifiers, the BAR2
//! control-area layout, the Xilinx AXI CDMA register map, and the binary
//! format of the self-describing device table ("PROM").
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`pcie`] | Vendor/device/subsystem IDs |
//! | [`bar`] | BAR2 layout (CDMA, interrupt controller, PROM window) |
//! | [`regs`] | AXI CDMA (PG034) register offsets and bit definitions |
//! | [`prom`] | Device table magic, version, offsets, tags, limits |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bar;
pub mod pcie;
pub mod prom;
pub mod regs;
