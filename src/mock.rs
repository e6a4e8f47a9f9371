//! Simulated hardware for exercising both ends of the protocol

use std::{
    collections::VecDeque,
    convert::Infallible,
    io::{self, Read, Write},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::Duration,
};

use crate::{
    device::{FlashController, Jumper, Status, StatusIndicator},
    image::VectorTable,
    layout::{MemoryLayout, ERASED_BYTE, PAGE_SIZE, WORDS_PER_BLOCK, WORD_SIZE},
};

/// Flash array with operation counters
///
/// Programming can only clear bits, like real NOR flash.
pub struct MockFlash {
    layout: MemoryLayout,
    memory: Vec<u8>,
    busy: bool,
    pub erases: usize,
    pub programs: usize,
}

impl Default for MockFlash {
    fn default() -> Self {
        let layout = MemoryLayout::default();

        MockFlash {
            layout,
            memory: vec![ERASED_BYTE; layout.flash_size as usize],
            busy: false,
            erases: 0,
            programs: 0,
        }
    }
}

impl MockFlash {
    /// Store a word directly, bypassing the controller
    pub fn poke(&mut self, addr: u32, word: u32) {
        let index = self.index(addr);
        self.memory[index..index + WORD_SIZE].copy_from_slice(&word.to_le_bytes());
    }

    fn index(&self, addr: u32) -> usize {
        assert!(self.layout.in_flash(addr), "access outside flash at {addr:#x}");
        (addr - self.layout.flash_base) as usize
    }

    fn start(&mut self) {
        assert!(!self.busy, "operation started while controller busy");
        self.busy = true;
    }
}

impl FlashController for MockFlash {
    type Error = Infallible;

    fn begin_erase(&mut self, addr: u32) -> Result<(), Self::Error> {
        self.start();
        let start = self.index(addr & !(PAGE_SIZE - 1));
        self.memory[start..start + PAGE_SIZE as usize].fill(ERASED_BYTE);
        self.erases += 1;
        Ok(())
    }

    fn begin_program(&mut self, addr: u32, words: &[u32; WORDS_PER_BLOCK]) -> Result<(), Self::Error> {
        self.start();
        let start = self.index(addr);
        for (index, byte) in words.iter().flat_map(|word| word.to_le_bytes()).enumerate() {
            self.memory[start + index] &= byte;
        }
        self.programs += 1;
        Ok(())
    }

    fn wait_until_ready(&mut self) -> Result<(), Self::Error> {
        self.busy = false;
        Ok(())
    }

    fn read_word(&mut self, addr: u32) -> u32 {
        if !self.layout.in_flash(addr) {
            return u32::MAX;
        }
        let index = self.index(addr);
        let mut bytes = [0u8; WORD_SIZE];
        bytes.copy_from_slice(&self.memory[index..index + WORD_SIZE]);
        u32::from_le_bytes(bytes)
    }
}

#[derive(Debug, Default)]
pub struct MockIndicator {
    pub current: Option<Status>,
    pub history: Vec<Status>,
}

impl StatusIndicator for MockIndicator {
    fn show(&mut self, status: Status) {
        self.current = Some(status);
        self.history.push(status);
    }
}

/// Records what the launcher asked for and unwinds instead of jumping
#[derive(Debug, Default)]
pub struct MockJumper {
    pub restored: bool,
    pub halted: bool,
}

impl Jumper for MockJumper {
    fn restore_hardware(&mut self) {
        self.restored = true;
    }

    unsafe fn boot(&mut self, vector_table: u32, table: VectorTable) -> ! {
        panic!(
            "boot {:#010x} sp {:#010x} pc {:#010x}",
            vector_table, table.stack_pointer, table.reset_vector
        )
    }

    fn halt(&mut self) -> ! {
        self.halted = true;
        panic!("halted")
    }
}

/// Reads from a fixed script and records everything written
pub struct Duplex {
    rx: VecDeque<u8>,
    pub tx: Vec<u8>,
}

impl Duplex {
    pub fn new(rx: &[u8]) -> Self {
        Duplex {
            rx: rx.iter().copied().collect(),
            tx: Vec::new(),
        }
    }
}

impl Read for Duplex {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.read(buf)
    }
}

impl Write for Duplex {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Host end of a simulated serial cable
///
/// Reads give up after `timeout`. A single byte of the host's output can be
/// corrupted to simulate line noise.
pub struct HostEnd {
    rx: Receiver<u8>,
    tx: Sender<u8>,
    timeout: Duration,
    written: usize,
    corrupt_at: Option<usize>,
}

impl HostEnd {
    /// Flip the lowest bit of the `offset`th byte sent to the device
    pub fn corrupt_at(mut self, offset: usize) -> Self {
        self.corrupt_at = Some(offset);
        self
    }
}

impl Read for HostEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        buf[0] = match self.rx.recv_timeout(self.timeout) {
            Ok(byte) => byte,
            Err(RecvTimeoutError::Timeout) => return Err(io::ErrorKind::TimedOut.into()),
            Err(RecvTimeoutError::Disconnected) => return Ok(0),
        };

        let mut count = 1;
        while count < buf.len() {
            match self.rx.try_recv() {
                Ok(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                Err(_) => break,
            }
        }

        Ok(count)
    }
}

impl Write for HostEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            let byte = if self.corrupt_at == Some(self.written) {
                byte ^ 0x01
            } else {
                byte
            };
            self.written += 1;

            self.tx
                .send(byte)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Device end of a simulated serial cable; reads block until the host end is
/// dropped
pub struct DeviceEnd {
    rx: Receiver<u8>,
    tx: Sender<u8>,
}

impl Read for DeviceEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        match self.rx.recv() {
            Ok(byte) => {
                buf[0] = byte;
                Ok(1)
            }
            Err(_) => Ok(0),
        }
    }
}

impl Write for DeviceEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            // The host may already have given up
            let _ = self.tx.send(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Create both ends of a simulated serial cable
pub fn cable(timeout: Duration) -> (HostEnd, DeviceEnd) {
    let (host_tx, device_rx) = mpsc::channel();
    let (device_tx, host_rx) = mpsc::channel();

    (
        HostEnd {
            rx: host_rx,
            tx: host_tx,
            timeout,
            written: 0,
            corrupt_at: None,
        },
        DeviceEnd {
            rx: device_rx,
            tx: device_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use std::thread;

    use embedded_io_adapters::std::FromStd;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        connection::Connection,
        device::{self, ServerError, UpdateServer},
        error::{Error, ProtocolError},
        flasher::{DefaultProgressCallback, UpdateClient},
        image::{
            hex::{
                tests::{record, EOF},
                HexImageLoader,
            },
            verify::verify,
            MemoryImage,
        },
        protocol::{DEFAULT_TIMEOUT, KEYPHRASE},
    };

    type DeviceOutcome = (Result<(), ServerError<io::Error, Infallible>>, MockFlash, MockIndicator);

    /// Vector table at 0x1000 plus code spilling into a second page
    fn two_page_image() -> MemoryImage {
        let mut source = record(0x04, 0x0000, &[0x00, 0x00]);
        source += &record(0x00, 0x1000, &[0xF8, 0x7F, 0x00, 0x20, 0x01, 0x12, 0x00, 0x00]);
        source += &record(0x00, 0x1200, &[0x70, 0x47, 0x00, 0xBF]);
        source += &record(0x00, 0x1400, &[0xDE, 0xAD, 0xBE, 0xEF]);
        source += EOF;

        let image = HexImageLoader::new(MemoryLayout::default())
            .load_str(&source)
            .unwrap();
        verify(&image).unwrap();
        image
    }

    fn spawn_device(link: DeviceEnd) -> thread::JoinHandle<DeviceOutcome> {
        thread::spawn(move || {
            let mut flash = MockFlash::default();
            let mut indicator = MockIndicator::default();
            let result = UpdateServer::new(
                FromStd::new(link),
                &mut flash,
                &mut indicator,
                MemoryLayout::default(),
            )
            .serve();

            (result, flash, indicator)
        })
    }

    #[test]
    fn image_is_written_to_device() {
        let image = two_page_image();
        let (host, device) = cable(DEFAULT_TIMEOUT);
        let device = spawn_device(device);

        let mut progress = DefaultProgressCallback;
        let mut client = UpdateClient::new(Connection::new(host), &image, &mut progress);
        client.run().unwrap();
        drop(client);

        let (result, mut flash, indicator) = device.join().unwrap();
        result.unwrap();

        assert_eq!(flash.erases, 2);
        assert_eq!(flash.programs, 16);
        assert_eq!(indicator.history, vec![Status::Connected]);

        for addr in (0x1000..0x1800).step_by(WORD_SIZE) {
            assert_eq!(flash.read_word(addr), image.word(addr), "word at {addr:#x}");
        }
        assert_eq!(flash.read_word(0x1400), 0xEFBE_ADDE);

        let table = device::validate(&mut flash, &MemoryLayout::default()).unwrap();
        assert_eq!(table, image.vector_table());
    }

    #[test]
    fn corrupted_page_aborts_both_ends() {
        let image = two_page_image();
        let (host, device) = cable(DEFAULT_TIMEOUT);
        // First data byte of the first page: keyphrase, header, page address
        let host = host.corrupt_at(KEYPHRASE.len() + 8 + 4);
        let device = spawn_device(device);

        let mut progress = DefaultProgressCallback;
        let mut client = UpdateClient::new(Connection::new(host), &image, &mut progress);
        let result = client.run();
        drop(client);

        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::PageChecksum { address: 0x1000, .. }))
        ));

        let (result, flash, indicator) = device.join().unwrap();
        assert!(matches!(
            result,
            Err(ServerError::PageChecksum { address: 0x1000, .. })
        ));
        assert_eq!(flash.erases, 0);
        assert_eq!(flash.programs, 0);
        assert_eq!(indicator.current, Some(Status::Error));
    }

    #[test]
    fn corrupted_header_aborts_before_any_page() {
        let image = two_page_image();
        let (host, device) = cable(DEFAULT_TIMEOUT);
        let host = host.corrupt_at(KEYPHRASE.len());
        let device = spawn_device(device);

        let mut progress = DefaultProgressCallback;
        let mut client = UpdateClient::new(Connection::new(host), &image, &mut progress);
        let result = client.run();
        drop(client);

        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::HeaderChecksum { .. }))
        ));

        let (result, flash, _) = device.join().unwrap();
        assert!(matches!(result, Err(ServerError::HeaderChecksum { .. })));
        assert_eq!(flash.erases, 0);
    }

    #[test]
    #[should_panic(expected = "boot 0x00001000 sp 0x20007ff8 pc 0x00001201")]
    fn normal_boot_skips_the_server() {
        let mut flash = MockFlash::default();
        flash.poke(0x1000, 0x2000_7FF8);
        flash.poke(0x1004, 0x0000_1201);

        device::run(
            || false,
            FromStd::new(Duplex::new(&[])),
            flash,
            MockIndicator::default(),
            MockJumper::default(),
            MemoryLayout::default(),
        )
    }

    #[test]
    #[should_panic(expected = "halted")]
    fn failed_update_halts() {
        let mut flash = MockFlash::default();
        flash.poke(0x1000, 0x2000_4000);
        flash.poke(0x1004, 0x0000_1201);

        device::run(
            || true,
            FromStd::new(Duplex::new(b"M4F_Unl")),
            flash,
            MockIndicator::default(),
            MockJumper::default(),
            MemoryLayout::default(),
        )
    }
}
