//! Receive pages from the host and write them to flash

use embedded_io::{ErrorType, Read, ReadExactError, Write};
use log::{debug, info, warn};
use thiserror::Error;

use super::{FlashController, Status, StatusIndicator};
use crate::{
    layout::{MemoryLayout, BLOCKS_PER_PAGE, BLOCK_SIZE, WORDS_PER_BLOCK, WORDS_PER_PAGE},
    protocol::{header_checksum, Checksum, Phase, ACK, KEYPHRASE, PAGE_DONE},
};

/// Errors that stop the update server
#[derive(Debug, Error)]
pub enum ServerError<LE, FE> {
    #[error("Serial link error: {0:?}")]
    Link(LE),

    #[error("Serial link closed")]
    LinkClosed,

    #[error("Flash controller error: {0:?}")]
    Flash(FE),

    #[error("Checksum error in header: expected {expected:#010x}, received {received:#010x}")]
    HeaderChecksum { expected: u32, received: u32 },

    #[error("Checksum error at address {address:#010x}: expected {expected:#010x}, received {received:#010x}")]
    PageChecksum {
        address: u32,
        expected: u32,
        received: u32,
    },

    #[error("Page at {0:#010x} is not an aligned page of application flash")]
    InvalidPageAddress(u32),

    #[error("Block {0} is past the end of the page")]
    InvalidBlock(usize),
}

/// State of the device side of an update session
///
/// `page` counts the pages received so far out of the `pages` announced in
/// the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    /// The first `matched` bytes of the keyphrase have been received
    Handshaking { matched: usize },
    HeaderExchange,
    PageHeader { page: u32, pages: u32 },
    PageData { page: u32, pages: u32, address: u32 },
    ChecksumExchange { page: u32, pages: u32, address: u32, checksum: Checksum },
    Erase { page: u32, pages: u32, address: u32 },
    Program { page: u32, pages: u32, address: u32, block: usize },
    PageAck { page: u32, pages: u32 },
    Done,
}

impl ServerState {
    pub fn phase(&self) -> Phase {
        match self {
            ServerState::Idle => Phase::Idle,
            ServerState::Handshaking { .. } => Phase::Handshaking,
            ServerState::HeaderExchange => Phase::HeaderExchange,
            ServerState::PageHeader { .. } => Phase::PageHeader,
            ServerState::PageData { .. } => Phase::PageData,
            ServerState::ChecksumExchange { .. } => Phase::ChecksumExchange,
            ServerState::Erase { .. } => Phase::Erase,
            ServerState::Program { .. } => Phase::Program,
            ServerState::PageAck { .. } => Phase::PageAck,
            ServerState::Done => Phase::Done,
        }
    }
}

type StepResult<L, F> =
    Result<ServerState, ServerError<<L as ErrorType>::Error, <F as FlashController>::Error>>;

/// Device side of the update protocol
///
/// Owns the buffer a page is collected in before it is written to flash.
pub struct UpdateServer<L, F, S> {
    link: L,
    flash: F,
    indicator: S,
    layout: MemoryLayout,
    buffer: [u32; WORDS_PER_PAGE],
}

impl<L, F, S> UpdateServer<L, F, S>
where
    L: Read + Write,
    F: FlashController,
    S: StatusIndicator,
{
    pub fn new(link: L, flash: F, indicator: S, layout: MemoryLayout) -> Self {
        UpdateServer {
            link,
            flash,
            indicator,
            layout,
            buffer: [0; WORDS_PER_PAGE],
        }
    }

    /// Run a complete session, showing the error status if it fails
    pub fn serve(&mut self) -> Result<(), ServerError<L::Error, F::Error>> {
        let mut state = ServerState::Idle;

        while state != ServerState::Done {
            state = match self.step(state) {
                Ok(next) => next,
                Err(err) => {
                    warn!("Session aborted during {}", state.phase());
                    self.indicator.show(Status::Error);
                    return Err(err);
                }
            };
        }

        info!("Update complete");
        Ok(())
    }

    /// Perform a single transition of the session
    pub fn step(&mut self, state: ServerState) -> StepResult<L, F> {
        let next = match state {
            ServerState::Idle => ServerState::Handshaking { matched: 0 },
            ServerState::Handshaking { matched } => self.handshake(matched)?,
            ServerState::HeaderExchange => {
                let pages = self.read_word()?;
                let expected = header_checksum(pages);
                self.write(&expected.to_le_bytes())?;

                let received = self.read_word()?;
                if received != expected {
                    return Err(ServerError::HeaderChecksum { expected, received });
                }
                info!("Receiving {} page(s)", pages);

                next_page(0, pages)
            }
            ServerState::PageHeader { page, pages } => ServerState::PageData {
                page,
                pages,
                address: self.read_word()?,
            },
            ServerState::PageData {
                page,
                pages,
                address,
            } => {
                let mut checksum = Checksum::new(address);
                for index in 0..WORDS_PER_PAGE {
                    let word = self.read_word()?;
                    self.buffer[index] = word;
                    checksum.add(word);
                }

                ServerState::ChecksumExchange {
                    page,
                    pages,
                    address,
                    checksum,
                }
            }
            ServerState::ChecksumExchange {
                page,
                pages,
                address,
                checksum,
            } => {
                let expected = checksum.complement();
                self.write(&expected.to_le_bytes())?;

                let received = self.read_word()?;
                if received != expected {
                    return Err(ServerError::PageChecksum {
                        address,
                        expected,
                        received,
                    });
                }

                ServerState::Erase {
                    page,
                    pages,
                    address,
                }
            }
            ServerState::Erase {
                page,
                pages,
                address,
            } => {
                if !self.layout.is_app_page(address) {
                    return Err(ServerError::InvalidPageAddress(address));
                }

                self.flash.begin_erase(address).map_err(ServerError::Flash)?;
                self.flash.wait_until_ready().map_err(ServerError::Flash)?;

                ServerState::Program {
                    page,
                    pages,
                    address,
                    block: 0,
                }
            }
            ServerState::Program {
                page,
                pages,
                address,
                block,
            } => {
                if block >= BLOCKS_PER_PAGE {
                    return Err(ServerError::InvalidBlock(block));
                }
                if !self.layout.is_app_page(address) {
                    return Err(ServerError::InvalidPageAddress(address));
                }

                let start = block * WORDS_PER_BLOCK;
                let mut words = [0u32; WORDS_PER_BLOCK];
                words.copy_from_slice(&self.buffer[start..start + WORDS_PER_BLOCK]);

                let block_address = address + block as u32 * BLOCK_SIZE;
                self.flash
                    .begin_program(block_address, &words)
                    .map_err(ServerError::Flash)?;
                self.flash.wait_until_ready().map_err(ServerError::Flash)?;

                if block + 1 < BLOCKS_PER_PAGE {
                    ServerState::Program {
                        page,
                        pages,
                        address,
                        block: block + 1,
                    }
                } else {
                    ServerState::PageAck { page, pages }
                }
            }
            ServerState::PageAck { page, pages } => {
                self.write(&[PAGE_DONE])?;
                next_page(page.saturating_add(1), pages)
            }
            ServerState::Done => ServerState::Done,
        };

        Ok(next)
    }

    fn handshake(&mut self, matched: usize) -> StepResult<L, F> {
        let byte = self.read_byte()?;

        // A mismatching byte restarts the match without being compared
        // against the first keyphrase byte
        if byte != KEYPHRASE[matched] {
            return Ok(ServerState::Handshaking { matched: 0 });
        }

        let matched = matched + 1;
        if matched < KEYPHRASE.len() {
            return Ok(ServerState::Handshaking { matched });
        }

        self.write(&[ACK])?;
        self.indicator.show(Status::Connected);
        debug!("Keyphrase received");

        Ok(ServerState::HeaderExchange)
    }

    fn read_byte(&mut self) -> Result<u8, ServerError<L::Error, F::Error>> {
        let mut buf = [0u8; 1];
        self.link.read_exact(&mut buf).map_err(link_error)?;

        Ok(buf[0])
    }

    fn read_word(&mut self) -> Result<u32, ServerError<L::Error, F::Error>> {
        let mut buf = [0u8; 4];
        self.link.read_exact(&mut buf).map_err(link_error)?;

        Ok(u32::from_le_bytes(buf))
    }

    /// Write and wait until the bytes have left the transmitter
    fn write(&mut self, data: &[u8]) -> Result<(), ServerError<L::Error, F::Error>> {
        self.link.write_all(data).map_err(ServerError::Link)?;
        self.link.flush().map_err(ServerError::Link)
    }

    /// Turn the server back into its peripherals
    pub fn release(self) -> (L, F, S) {
        (self.link, self.flash, self.indicator)
    }
}

fn next_page(page: u32, pages: u32) -> ServerState {
    if page < pages {
        ServerState::PageHeader { page, pages }
    } else {
        ServerState::Done
    }
}

fn link_error<LE, FE>(err: ReadExactError<LE>) -> ServerError<LE, FE> {
    match err {
        ReadExactError::UnexpectedEof => ServerError::LinkClosed,
        ReadExactError::Other(err) => ServerError::Link(err),
    }
}
