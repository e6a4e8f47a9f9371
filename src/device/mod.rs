//! Device side of the bootloader
//!
//! The device decides once at reset whether an update was requested, runs the
//! [UpdateServer] if so, and finally hands over to the application through
//! the [launcher]. All hardware access goes through the capability traits in
//! this module so the same logic can run against real peripherals or
//! simulated ones.

use log::{error, info};

use crate::layout::{MemoryLayout, WORDS_PER_BLOCK};

pub use self::{
    launcher::{launch, validate, Jumper},
    server::{ServerError, ServerState, UpdateServer},
};

#[cfg(feature = "cortex-m")]
pub mod cortex_m;
pub mod launcher;
pub mod server;

/// Samples the update request input
pub trait BootRequest {
    fn is_requested(&mut self) -> bool;
}

impl<F: FnMut() -> bool> BootRequest for F {
    fn is_requested(&mut self) -> bool {
        self()
    }
}

/// Flash memory controller
///
/// Operations are started by the `begin_*` methods and completed by
/// [FlashController::wait_until_ready], the only operation allowed to block on
/// the hardware.
pub trait FlashController {
    type Error: core::fmt::Debug;

    /// Start erasing the page containing `addr`
    fn begin_erase(&mut self, addr: u32) -> Result<(), Self::Error>;

    /// Start programming one block of words at `addr`
    fn begin_program(&mut self, addr: u32, words: &[u32; WORDS_PER_BLOCK]) -> Result<(), Self::Error>;

    /// Block until the last started operation has completed
    fn wait_until_ready(&mut self) -> Result<(), Self::Error>;

    /// Read back a word of flash
    fn read_word(&mut self, addr: u32) -> u32;
}

impl<T: FlashController + ?Sized> FlashController for &mut T {
    type Error = T::Error;

    fn begin_erase(&mut self, addr: u32) -> Result<(), Self::Error> {
        T::begin_erase(self, addr)
    }

    fn begin_program(&mut self, addr: u32, words: &[u32; WORDS_PER_BLOCK]) -> Result<(), Self::Error> {
        T::begin_program(self, addr, words)
    }

    fn wait_until_ready(&mut self) -> Result<(), Self::Error> {
        T::wait_until_ready(self)
    }

    fn read_word(&mut self, addr: u32) -> u32 {
        T::read_word(self, addr)
    }
}

/// State shown to the user, typically on status LEDs
///
/// Showing one status clears any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    BootloadRequested,
    Connected,
    Error,
}

pub trait StatusIndicator {
    fn show(&mut self, status: Status);
}

impl<T: StatusIndicator + ?Sized> StatusIndicator for &mut T {
    fn show(&mut self, status: Status) {
        T::show(self, status)
    }
}

/// What the device does after reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Run the update server before launching
    Update,
    /// Launch the application straight away
    Normal,
}

/// Sample the request input exactly once
pub fn decide<R: BootRequest>(request: &mut R) -> BootMode {
    if request.is_requested() {
        BootMode::Update
    } else {
        BootMode::Normal
    }
}

/// Bootloader entry point
///
/// Never returns: the device either ends up in the application or halted with
/// the error status shown.
pub fn run<R, L, F, S, J>(
    mut request: R,
    mut link: L,
    mut flash: F,
    mut indicator: S,
    mut jumper: J,
    layout: MemoryLayout,
) -> !
where
    R: BootRequest,
    L: embedded_io::Read + embedded_io::Write,
    F: FlashController,
    S: StatusIndicator,
    J: Jumper,
{
    if decide(&mut request) == BootMode::Update {
        info!("Bootload requested");
        indicator.show(Status::BootloadRequested);

        let result = UpdateServer::new(&mut link, &mut flash, &mut indicator, layout).serve();
        if let Err(err) = result {
            error!("Update failed: {}", err);
            jumper.halt();
        }
    }

    launch(&mut flash, &mut indicator, &mut jumper, &layout)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn request_is_sampled_once() {
        let mut samples = 0;
        let mut request = || {
            samples += 1;
            true
        };

        assert_eq!(decide(&mut request), BootMode::Update);
        assert_eq!(samples, 1);
    }

    #[test]
    fn no_request_boots_normally() {
        assert_eq!(decide(&mut || false), BootMode::Normal);
    }
}
