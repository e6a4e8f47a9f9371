//! Library and application errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::{image::hex::RecordType, protocol::Phase};

/// All possible errors returned by m4fboot
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Malformed image file")]
    #[diagnostic(transparent)]
    Format(#[from] FormatError),

    #[error("Image cannot be placed in application flash")]
    #[diagnostic(transparent)]
    Placement(#[from] PlacementError),

    #[error("Error while talking to the serial port")]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error("Error while updating the device")]
    #[diagnostic(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Invalid memory layout")]
    #[diagnostic(transparent)]
    Layout(#[from] LayoutError),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(m4fboot::file_open))]
    FileOpenError(String, #[source] io::Error),

    #[error("Invalid serial port name '{0}'")]
    #[diagnostic(
        code(m4fboot::invalid_port_name),
        help("Use a Windows-style name such as `COM1` or a tty name such as `ttyUSB0`")
    )]
    InvalidPortName(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.into())
    }
}

#[cfg(feature = "serialport")]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Transport(err.into())
    }
}

/// Errors found while parsing a hex file
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum FormatError {
    #[error("Unexpected character {found:?} on line {line}, expected ':'")]
    #[diagnostic(code(m4fboot::hex::unexpected_character))]
    UnexpectedCharacter { line: usize, found: char },

    #[error("Record {record} on line {line} contains an invalid hex digit")]
    #[diagnostic(code(m4fboot::hex::invalid_digit))]
    InvalidDigit { record: usize, line: usize },

    #[error("File ended inside record {record}")]
    #[diagnostic(code(m4fboot::hex::truncated_record))]
    TruncatedRecord { record: usize },

    #[error("File ended after {records} records without an end-of-file record")]
    #[diagnostic(
        code(m4fboot::hex::missing_eof),
        help("The file may have been truncated, try regenerating it")
    )]
    MissingEndOfFile { records: usize },

    #[error("Checksum error in record {record} on line {line}: expected {expected:#04x}, found {found:#04x}")]
    #[diagnostic(code(m4fboot::hex::checksum))]
    Checksum {
        record: usize,
        line: usize,
        expected: u8,
        found: u8,
    },

    #[error("Record {record} has unsupported type {record_type}")]
    #[diagnostic(
        code(m4fboot::hex::unsupported_record),
        help("Segmented addressing is not supported, link the image with linear (type 4) addressing")
    )]
    UnsupportedRecord {
        record: usize,
        record_type: RecordType,
    },

    #[error("Record {record} has unknown type {record_type:#04x}")]
    #[diagnostic(code(m4fboot::hex::unknown_record))]
    UnknownRecord { record: usize, record_type: u8 },

    #[error("Record {record} of type {record_type} has an invalid length of {length} bytes")]
    #[diagnostic(code(m4fboot::hex::record_length))]
    InvalidLength {
        record: usize,
        record_type: RecordType,
        length: u8,
    },

    #[error("Record {record} writes to {address:#010x}, outside of flash")]
    #[diagnostic(code(m4fboot::hex::address_out_of_range))]
    AddressOutOfRange { record: usize, address: u32 },
}

/// Errors found while checking an image against the memory layout
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum PlacementError {
    #[error("Source file overlaps bootloader from {start:#010x} to {end:#010x}, first at {address:#010x}")]
    #[diagnostic(
        code(m4fboot::placement::overlaps_bootloader),
        help("Link the application so that its flash and vector table sections start above the bootloader")
    )]
    OverlapsBootloader { start: u32, end: u32, address: u32 },

    #[error("Default SP not valid at address {location:#010x}, address was {value:#010x}")]
    #[diagnostic(
        code(m4fboot::placement::stack_pointer),
        help("The initial stack pointer must point into RAM")
    )]
    InvalidStackPointer { location: u32, value: u32 },

    #[error("Reset pointer not valid at address {location:#010x}, address was {value:#010x}")]
    #[diagnostic(
        code(m4fboot::placement::reset_vector),
        help("The reset vector must point into application flash")
    )]
    InvalidResetVector { location: u32, value: u32 },
}

/// Inconsistent memory map, usually from a configuration file
#[derive(Debug, Diagnostic, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LayoutError {
    #[error("Flash size {size:#x} is outside the supported range of 1 byte to {max:#x}")]
    #[diagnostic(code(m4fboot::layout::flash_size))]
    FlashSize { size: u32, max: u32 },

    #[error("Flash from {base:#010x} with size {size:#x} extends past the end of the address space")]
    #[diagnostic(code(m4fboot::layout::flash_overflow))]
    FlashOverflow { base: u32, size: u32 },

    #[error("{field} {value:#010x} is not a multiple of the {page_size} byte page size")]
    #[diagnostic(code(m4fboot::layout::alignment))]
    Unaligned {
        field: &'static str,
        value: u32,
        page_size: u32,
    },

    #[error("Bootloader reservation {bootloader_size:#x} leaves no room in {flash_size:#x} bytes of flash")]
    #[diagnostic(
        code(m4fboot::layout::bootloader_size),
        help("`bootloader_size` must be smaller than `flash_size`")
    )]
    BootloaderTooLarge { bootloader_size: u32, flash_size: u32 },
}

/// Errors opening or using the serial port
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[cfg(feature = "serialport")]
    #[error("Could not open port {port}")]
    #[diagnostic(
        code(m4fboot::serial_open),
        help("Make sure the device is connected and that no other program is using the port")
    )]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[cfg(feature = "serialport")]
    #[error("Error setting port configuration")]
    #[diagnostic(code(m4fboot::serial_config))]
    Configure(#[source] serialport::Error),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(m4fboot::serial_io))]
    Io(#[from] io::Error),
}

#[cfg(feature = "serialport")]
impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        TransportError::Configure(err)
    }
}

/// Errors in the update session itself
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("Target device not found after {attempts} attempts")]
    #[diagnostic(
        code(m4fboot::device_not_found),
        help("Power-cycle the board with the bootload request button held down, then try again")
    )]
    DeviceNotFound { attempts: u32 },

    #[error("Timeout while waiting for the device during {0}")]
    #[diagnostic(code(m4fboot::timeout))]
    Timeout(Phase),

    #[error("Checksum error in header: TX {sent:#010x}, RX {received:#010x}")]
    #[diagnostic(
        code(m4fboot::header_checksum),
        help("The transmission was corrupted, power-cycle the device and try again")
    )]
    HeaderChecksum { sent: u32, received: u32 },

    #[error("Checksum error at address {address:#010x}: TX {sent:#010x}, RX {received:#010x}")]
    #[diagnostic(
        code(m4fboot::page_checksum),
        help("The transmission was corrupted, power-cycle the device and try again")
    )]
    PageChecksum {
        address: u32,
        sent: u32,
        received: u32,
    },

    #[error("Error writing page at address {address:#010x}, received {received:#04x} instead of the done signal")]
    #[diagnostic(code(m4fboot::page_not_written))]
    PageNotWritten { address: u32, received: u8 },

    #[error("Page {page} requested, but the image has {pages} page(s)")]
    #[diagnostic(code(m4fboot::no_such_page))]
    NoSuchPage { page: u32, pages: u32 },
}

/// Mark an IO error as having occurred during a protocol phase
pub(crate) trait ResultExt<T> {
    fn during(self, phase: Phase) -> Result<T, Error>;
}

impl<T> ResultExt<T> for Result<T, io::Error> {
    fn during(self, phase: Phase) -> Result<T, Error> {
        self.map_err(|err| match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof => {
                Error::Protocol(ProtocolError::Timeout(phase))
            }
            _ => Error::Transport(TransportError::Io(err)),
        })
    }
}
