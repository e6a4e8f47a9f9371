//! Flat memory image of the target's flash
//!
//! A [MemoryImage] is produced by the [hex](self::hex) loader, checked by the
//! [verifier](self::verify), and then split into [Page]s for transmission.

use std::{fmt, iter};

use crate::{
    error::PlacementError,
    layout::{MemoryLayout, ERASED_BYTE, PAGE_SIZE, PC_OFFSET, SP_OFFSET, WORDS_PER_PAGE, WORD_SIZE},
};

pub mod hex;
pub mod verify;

/// Byte-addressable copy of the whole flash array
///
/// Bytes which were never written hold [ERASED_BYTE], matching the state of
/// erased flash.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryImage {
    layout: MemoryLayout,
    data: Vec<u8>,
}

impl MemoryImage {
    /// Create a fully erased image spanning the layout's flash
    pub fn new(layout: MemoryLayout) -> Self {
        MemoryImage {
            layout,
            data: vec![ERASED_BYTE; layout.flash_size as usize],
        }
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Byte at an absolute address, if it lies within flash
    pub fn get(&self, addr: u32) -> Option<u8> {
        self.index(addr).map(|index| self.data[index])
    }

    pub(crate) fn set(&mut self, addr: u32, value: u8) -> bool {
        match self.index(addr) {
            Some(index) => {
                self.data[index] = value;
                true
            }
            None => false,
        }
    }

    fn index(&self, addr: u32) -> Option<usize> {
        self.layout
            .in_flash(addr)
            .then(|| (addr - self.layout.flash_base) as usize)
    }

    /// Little-endian word at an absolute address; bytes outside flash read
    /// as erased
    pub fn word(&self, addr: u32) -> u32 {
        let mut bytes = [ERASED_BYTE; WORD_SIZE];
        for (offset, byte) in bytes.iter_mut().enumerate() {
            if let Some(value) = addr.checked_add(offset as u32).and_then(|a| self.get(a)) {
                *byte = value;
            }
        }

        u32::from_le_bytes(bytes)
    }

    /// Bytes of the range `[start, end)`, clamped to flash
    pub fn range(&self, start: u32, end: u32) -> &[u8] {
        let start = start.saturating_sub(self.layout.flash_base) as usize;
        let end = end.saturating_sub(self.layout.flash_base) as usize;
        let end = end.min(self.data.len());

        &self.data[start.min(end)..end]
    }

    /// Address of the highest byte that is not erased
    pub fn last_programmed(&self) -> Option<u32> {
        self.data
            .iter()
            .rposition(|&byte| byte != ERASED_BYTE)
            .and_then(|index| self.layout.flash_base.checked_add(index as u32))
    }

    /// Number of pages from the application base up to and including the last
    /// programmed byte
    pub fn page_count(&self) -> u32 {
        match self.last_programmed() {
            Some(last) if last >= self.layout.app_base() => {
                (last - self.layout.app_base()) / PAGE_SIZE + 1
            }
            _ => 0,
        }
    }

    /// Number of bytes from the application base up to and including the last
    /// programmed byte
    pub fn app_len(&self) -> u32 {
        match self.last_programmed() {
            Some(last) if last >= self.layout.app_base() => last - self.layout.app_base() + 1,
            _ => 0,
        }
    }

    /// Pages to transmit, in ascending address order
    pub fn pages(&self) -> impl Iterator<Item = Page> + '_ {
        let base = self.layout.app_base();

        (0..self.page_count()).map(move |index| self.page(base + index * PAGE_SIZE))
    }

    /// The page starting at `address`
    pub fn page(&self, address: u32) -> Page {
        let mut words = [0u32; WORDS_PER_PAGE];
        for (index, word) in words.iter_mut().enumerate() {
            *word = self.word(address.wrapping_add((index * WORD_SIZE) as u32));
        }

        Page { address, words }
    }

    /// Relocated vector table of the application contained in this image
    pub fn vector_table(&self) -> VectorTable {
        let base = self.layout.vector_table();

        VectorTable {
            stack_pointer: self.word(base.wrapping_add(SP_OFFSET)),
            reset_vector: self.word(base.wrapping_add(PC_OFFSET)),
        }
    }
}

impl fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryImage")
            .field("layout", &self.layout)
            .field("last_programmed", &self.last_programmed())
            .finish()
    }
}

/// One page of data together with its start address
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    pub address: u32,
    pub words: [u32; WORDS_PER_PAGE],
}

impl Page {
    /// Iterate over all words as they are put on the wire: the address first,
    /// then the data
    pub fn wire_words(&self) -> impl Iterator<Item = u32> + '_ {
        iter::once(self.address).chain(self.words.iter().copied())
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:#010x})", self.address)
    }
}

/// Region a reset vector must fall into to be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetRegion {
    /// Anywhere in flash
    Flash,
    /// Flash above the bootloader reservation
    Application,
}

/// Initial stack pointer and reset vector of the relocated vector table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorTable {
    pub stack_pointer: u32,
    pub reset_vector: u32,
}

impl VectorTable {
    /// Check that the stack pointer points into RAM and the reset vector into
    /// `region`
    pub fn validate(&self, layout: &MemoryLayout, region: ResetRegion) -> Result<(), PlacementError> {
        if !layout.in_ram(self.stack_pointer) {
            return Err(PlacementError::InvalidStackPointer {
                location: layout.vector_table().wrapping_add(SP_OFFSET),
                value: self.stack_pointer,
            });
        }

        let reset_ok = match region {
            ResetRegion::Flash => layout.in_flash(self.reset_vector),
            ResetRegion::Application => layout.in_app_flash(self.reset_vector),
        };
        if !reset_ok {
            return Err(PlacementError::InvalidResetVector {
                location: layout.vector_table().wrapping_add(PC_OFFSET),
                value: self.reset_vector,
            });
        }

        Ok(())
    }
}
