//! Serial firmware update for ARM Cortex-M4F microcontrollers
//!
//! The host half loads an Intel hex image, checks that it can be placed above
//! the resident bootloader, and streams it page by page to the device. The
//! device half decides at reset whether to accept an update, writes received
//! pages to flash, and launches the application.
//!
//! ## Cargo features
//!
//! - `cli`: command-line helpers, configuration file and logging used by the
//!   `m4fboot` binary (enabled by default)
//! - `serialport`: opening real serial ports on the host
//! - `cortex-m`: the `device::cortex_m` launcher for building the bootloader
//!   itself

pub mod connection;
pub mod device;
pub mod error;
pub mod flasher;
pub mod image;
pub mod layout;
pub mod protocol;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod logging;

#[cfg(test)]
mod mock;

pub use self::{
    error::Error,
    flasher::UpdateClient,
    image::{hex::HexImageLoader, verify::verify, MemoryImage},
    layout::MemoryLayout,
};
