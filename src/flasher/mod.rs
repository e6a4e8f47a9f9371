//! Write an application image to a target device
//!
//! The [UpdateClient] drives the host side of the update protocol over a
//! [Connection]. Every transition of the session is a call to
//! [UpdateClient::step], taking the current [ClientState] and returning the
//! next one; any error ends the session.

use log::{debug, info};

use crate::{
    connection::{Connection, SerialChannel},
    error::{Error, ProtocolError},
    image::{MemoryImage, Page},
    protocol::{
        header_checksum,
        Checksum,
        Phase,
        ACK,
        KEYPHRASE,
        MAX_HANDSHAKE_ATTEMPTS,
        PAGE_DONE,
    },
};

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// An empty implementation of [ProgressCallbacks] that does nothing
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DefaultProgressCallback;

impl ProgressCallbacks for DefaultProgressCallback {
    fn init(&mut self, _addr: u32, _total: usize) {}
    fn update(&mut self, _current: usize) {}
    fn finish(&mut self) {}
}

/// State of the host side of an update session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    /// `attempt` keyphrase transmissions have been made so far
    Handshaking { attempt: u32 },
    HeaderExchange,
    SendPageHeader { page: u32 },
    SendPageData { page: u32, checksum: Checksum },
    ChecksumExchange { page: u32, checksum: Checksum },
    PageAck { page: u32 },
    Done,
}

impl ClientState {
    pub fn phase(&self) -> Phase {
        match self {
            ClientState::Idle => Phase::Idle,
            ClientState::Handshaking { .. } => Phase::Handshaking,
            ClientState::HeaderExchange => Phase::HeaderExchange,
            ClientState::SendPageHeader { .. } => Phase::PageHeader,
            ClientState::SendPageData { .. } => Phase::PageData,
            ClientState::ChecksumExchange { .. } => Phase::ChecksumExchange,
            ClientState::PageAck { .. } => Phase::PageAck,
            ClientState::Done => Phase::Done,
        }
    }
}

/// Host side of the update protocol
pub struct UpdateClient<'a, P> {
    connection: Connection<P>,
    pages: Vec<Page>,
    max_attempts: u32,
    progress: &'a mut dyn ProgressCallbacks,
}

impl<'a, P: SerialChannel> UpdateClient<'a, P> {
    /// Prepare to transmit every page of `image`
    pub fn new(
        connection: Connection<P>,
        image: &MemoryImage,
        progress: &'a mut dyn ProgressCallbacks,
    ) -> Self {
        UpdateClient {
            connection,
            pages: image.pages().collect(),
            max_attempts: MAX_HANDSHAKE_ATTEMPTS,
            progress,
        }
    }

    /// Override the number of keyphrase transmissions made before giving up
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Run a complete session
    pub fn run(&mut self) -> Result<(), Error> {
        let mut state = ClientState::Idle;

        while state != ClientState::Done {
            state = self.step(state)?;
        }

        Ok(())
    }

    /// Perform a single transition of the session
    pub fn step(&mut self, state: ClientState) -> Result<ClientState, Error> {
        debug!("Client state: {:?}", state);

        let next = match state {
            ClientState::Idle => ClientState::Handshaking { attempt: 0 },
            ClientState::Handshaking { attempt } => self.handshake(attempt)?,
            ClientState::HeaderExchange => self.exchange_header()?,
            ClientState::SendPageHeader { page } => {
                let address = self.page(page)?.address;
                self.connection.write_word(address)?;

                ClientState::SendPageData {
                    page,
                    checksum: Checksum::new(address),
                }
            }
            ClientState::SendPageData { page, mut checksum } => {
                let words = &self.page(page)?.words;
                let mut data = Vec::with_capacity(words.len() * 4);
                for word in words {
                    checksum.add(*word);
                    data.extend_from_slice(&word.to_le_bytes());
                }
                self.connection.write(&data)?;

                ClientState::ChecksumExchange { page, checksum }
            }
            ClientState::ChecksumExchange { page, checksum } => {
                let address = self.page(page)?.address;
                let sent = checksum.complement();
                self.connection.write_word(sent)?;
                self.connection.drain()?;

                let received = self.connection.read_word(Phase::ChecksumExchange)?;
                if received != sent {
                    return Err(ProtocolError::PageChecksum {
                        address,
                        sent,
                        received,
                    }
                    .into());
                }

                ClientState::PageAck { page }
            }
            ClientState::PageAck { page } => {
                let address = self.page(page)?.address;
                let received = self.connection.read_byte(Phase::PageAck)?;
                if received != PAGE_DONE {
                    return Err(ProtocolError::PageNotWritten {
                        address,
                        received,
                    }
                    .into());
                }
                self.progress.update(page as usize + 1);

                self.next_page(page + 1)
            }
            ClientState::Done => ClientState::Done,
        };

        Ok(next)
    }

    fn handshake(&mut self, attempt: u32) -> Result<ClientState, Error> {
        if attempt >= self.max_attempts {
            return Err(ProtocolError::DeviceNotFound { attempts: attempt }.into());
        }

        self.connection.write(KEYPHRASE)?;
        self.connection.drain()?;

        match self.connection.try_read_byte()? {
            Some(ACK) => {
                info!("Found target device after {} attempt(s)", attempt + 1);
                Ok(ClientState::HeaderExchange)
            }
            reply => {
                debug!("No acknowledgement, received {:02x?}", reply);
                Ok(ClientState::Handshaking {
                    attempt: attempt + 1,
                })
            }
        }
    }

    fn exchange_header(&mut self) -> Result<ClientState, Error> {
        let pages = self.page_count();
        let sent = header_checksum(pages);

        self.connection.write_word(pages)?;
        self.connection.write_word(sent)?;
        self.connection.drain()?;

        let received = self.connection.read_word(Phase::HeaderExchange)?;
        if received != sent {
            return Err(ProtocolError::HeaderChecksum { sent, received }.into());
        }

        if let Some(first) = self.pages.first() {
            self.progress.init(first.address, self.pages.len());
        }

        Ok(self.next_page(0))
    }

    fn page(&self, page: u32) -> Result<&Page, Error> {
        self.pages.get(page as usize).ok_or_else(|| {
            ProtocolError::NoSuchPage {
                page,
                pages: self.page_count(),
            }
            .into()
        })
    }

    fn next_page(&mut self, page: u32) -> ClientState {
        if page < self.page_count() {
            ClientState::SendPageHeader { page }
        } else {
            if !self.pages.is_empty() {
                self.progress.finish();
            }
            ClientState::Done
        }
    }

    /// Turn the client back into its connection
    pub fn into_connection(self) -> Connection<P> {
        self.connection
    }
}
