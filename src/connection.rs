//! Serial link to the target device
//!
//! The [Connection] struct abstracts over the serial port and provides the
//! framing the update protocol is built from: raw byte writes that are drained
//! before reading, and byte or word reads bounded by the port's timeout.

use std::io::{Read, Write};
#[cfg(feature = "serialport")]
use std::time::Duration;

use log::trace;
#[cfg(feature = "serialport")]
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

#[cfg(feature = "serialport")]
use crate::{error::TransportError, protocol::BAUD_RATE};
use crate::{
    error::{Error, ResultExt},
    protocol::Phase,
};

/// Byte transport the update client runs on
///
/// Reads must return within a bounded time, failing with
/// [std::io::ErrorKind::TimedOut] (or returning zero bytes) when nothing
/// arrived. [Write::flush] must block until all written bytes have been
/// transmitted.
pub trait SerialChannel: Read + Write {}

impl<T: Read + Write + ?Sized> SerialChannel for T {}

/// Open a serial port configured for the update protocol: 115200 baud, 8 data
/// bits, no parity, 1 stop bit, no flow control
#[cfg(feature = "serialport")]
pub fn open_port(name: &str, timeout: Duration) -> Result<Box<dyn SerialPort>, TransportError> {
    let mut port = serialport::new(name, BAUD_RATE)
        .open()
        .map_err(|source| TransportError::Open {
            port: name.to_owned(),
            source,
        })?;

    port.set_data_bits(DataBits::Eight)?;
    port.set_parity(Parity::None)?;
    port.set_stop_bits(StopBits::One)?;
    port.set_flow_control(FlowControl::None)?;
    port.set_timeout(timeout)?;

    Ok(port)
}

/// An open link with a target device
pub struct Connection<P> {
    serial: P,
}

impl<P: SerialChannel> Connection<P> {
    pub fn new(serial: P) -> Self {
        Connection { serial }
    }

    /// Write raw bytes without waiting for them to be transmitted
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        trace!("TX {:02x?}", data);
        self.serial.write_all(data)?;
        Ok(())
    }

    /// Write a little-endian word
    pub fn write_word(&mut self, word: u32) -> Result<(), Error> {
        self.write(&word.to_le_bytes())
    }

    /// Block until all written bytes have left the port
    pub fn drain(&mut self) -> Result<(), Error> {
        self.serial.flush()?;
        Ok(())
    }

    /// Read a single byte, returning `None` if nothing arrived within the
    /// timeout
    pub fn try_read_byte(&mut self) -> Result<Option<u8>, Error> {
        let mut buf = [0u8; 1];
        match self.serial.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => {
                trace!("RX {:02x}", buf[0]);
                Ok(Some(buf[0]))
            }
            Err(err) if is_timeout(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Read a single byte, failing with a timeout attributed to `phase`
    pub fn read_byte(&mut self, phase: Phase) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.serial.read_exact(&mut buf).during(phase)?;
        trace!("RX {:02x}", buf[0]);

        Ok(buf[0])
    }

    /// Read a little-endian word, failing with a timeout attributed to `phase`
    pub fn read_word(&mut self, phase: Phase) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.serial.read_exact(&mut buf).during(phase)?;
        trace!("RX {:02x?}", buf);

        Ok(u32::from_le_bytes(buf))
    }

    /// Turn a connection back into its serial port
    pub fn into_serial(self) -> P {
        self.serial
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}
