//! Wire protocol shared by the update client and the update server
//!
//! A session is strictly sequential:
//!
//! 1. The host repeats [KEYPHRASE] until the device answers with [ACK].
//! 2. The host sends the page count followed by its ones' complement; the
//!    device echoes the complement it computed itself.
//! 3. For every page the host sends the start address, [WORDS_PER_PAGE] data
//!    words, and the ones' complement of the wrapping sum of address and data.
//!    The device echoes its own complement, erases and programs the page, and
//!    answers with [PAGE_DONE].
//!
//! All multi-byte values are 32-bit little-endian words.
//!
//! [WORDS_PER_PAGE]: crate::layout::WORDS_PER_PAGE

use core::time::Duration;

use strum::Display;

/// Phrase the device scans the line for before entering programming mode
pub const KEYPHRASE: &[u8; 10] = b"M4F_Unlock";
/// Acknowledgement sent by the device once the keyphrase matched
pub const ACK: u8 = b'k';
/// Sent by the device after a page has been erased and programmed
pub const PAGE_DONE: u8 = b'd';

pub const BAUD_RATE: u32 = 115_200;
/// Bounded wait applied by the host to every read
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
/// Number of keyphrase transmissions before the device is declared missing
pub const MAX_HANDSHAKE_ATTEMPTS: u32 = 30;

/// Stage of an update session, used for reporting on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Idle,
    Handshaking,
    HeaderExchange,
    PageHeader,
    PageData,
    ChecksumExchange,
    Erase,
    Program,
    PageAck,
    Done,
    ErrorHalt,
}

/// Modular 32-bit sum of transmitted words
///
/// The value put on the wire is the ones' complement of the sum, see
/// [Checksum::complement].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum(u32);

impl Checksum {
    pub fn new(seed: u32) -> Self {
        Checksum(seed)
    }

    pub fn add(&mut self, word: u32) {
        self.0 = self.0.wrapping_add(word);
    }

    pub fn sum(&self) -> u32 {
        self.0
    }

    pub fn complement(&self) -> u32 {
        !self.0
    }
}

impl Extend<u32> for Checksum {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        for word in iter {
            self.add(word);
        }
    }
}

/// Checksum transmitted after the page count in the session header
pub fn header_checksum(page_count: u32) -> u32 {
    !page_count
}
