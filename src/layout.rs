//! Memory map of the target device
//!
//! Both the host updater and the device bootloader reason about the same
//! address space: a flash array whose lowest [MemoryLayout::bootloader_size]
//! bytes hold the resident bootloader, followed by the application with its
//! relocated vector table, plus a block of SRAM the application's initial
//! stack pointer must point into.

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;

/// Size of a flash page, the unit that is transferred, erased and programmed
pub const PAGE_SIZE: u32 = 1024;
/// Number of 32-bit words in a page
pub const WORDS_PER_PAGE: usize = PAGE_SIZE as usize / WORD_SIZE;
/// Number of words written by a single block-program operation
pub const WORDS_PER_BLOCK: usize = 32;
/// Number of block-program operations needed to fill one page
pub const BLOCKS_PER_PAGE: usize = WORDS_PER_PAGE / WORDS_PER_BLOCK;
/// Size of a block in bytes
pub const BLOCK_SIZE: u32 = (WORDS_PER_BLOCK * WORD_SIZE) as u32;
/// Size of a word on the wire and in flash
pub const WORD_SIZE: usize = 4;

/// Largest flash array a layout may describe
pub const MAX_FLASH_SIZE: u32 = 0x0100_0000;

/// Value of a byte of erased flash
pub const ERASED_BYTE: u8 = 0xFF;

/// Offset of the initial stack pointer within the vector table
pub const SP_OFFSET: u32 = 0;
/// Offset of the reset vector within the vector table
pub const PC_OFFSET: u32 = 4;

/// Address ranges of the target's flash, RAM, and bootloader reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MemoryLayout {
    /// First address of flash
    #[serde(
        serialize_with = "serialize_u32_to_hex",
        deserialize_with = "deserialize_hex_to_u32"
    )]
    pub flash_base: u32,
    /// Total size of flash in bytes
    #[serde(
        serialize_with = "serialize_u32_to_hex",
        deserialize_with = "deserialize_hex_to_u32"
    )]
    pub flash_size: u32,
    /// First address of SRAM
    #[serde(
        serialize_with = "serialize_u32_to_hex",
        deserialize_with = "deserialize_hex_to_u32"
    )]
    pub ram_base: u32,
    /// Total size of SRAM in bytes
    #[serde(
        serialize_with = "serialize_u32_to_hex",
        deserialize_with = "deserialize_hex_to_u32"
    )]
    pub ram_size: u32,
    /// Bytes at the base of flash reserved for the bootloader, a multiple of
    /// [PAGE_SIZE]
    #[serde(
        serialize_with = "serialize_u32_to_hex",
        deserialize_with = "deserialize_hex_to_u32"
    )]
    pub bootloader_size: u32,
}

impl MemoryLayout {
    /// TM4C123GH6PM: 256 KiB flash, 32 KiB SRAM, 4 KiB bootloader
    pub const TM4C123GH6PM: MemoryLayout = MemoryLayout {
        flash_base: 0x0000_0000,
        flash_size: 0x0004_0000,
        ram_base: 0x2000_0000,
        ram_size: 0x0000_8000,
        bootloader_size: 0x0000_1000,
    };

    /// Check that the flash description is consistent
    ///
    /// Layouts that fail this check saturate at the top of the address space
    /// instead of wrapping, but no image can be placed in them sensibly.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.flash_size == 0 || self.flash_size > MAX_FLASH_SIZE {
            return Err(LayoutError::FlashSize {
                size: self.flash_size,
                max: MAX_FLASH_SIZE,
            });
        }
        if self.flash_base.checked_add(self.flash_size).is_none() {
            return Err(LayoutError::FlashOverflow {
                base: self.flash_base,
                size: self.flash_size,
            });
        }

        for (field, value) in [
            ("flash_base", self.flash_base),
            ("bootloader_size", self.bootloader_size),
        ] {
            if value % PAGE_SIZE != 0 {
                return Err(LayoutError::Unaligned {
                    field,
                    value,
                    page_size: PAGE_SIZE,
                });
            }
        }

        if self.bootloader_size >= self.flash_size {
            return Err(LayoutError::BootloaderTooLarge {
                bootloader_size: self.bootloader_size,
                flash_size: self.flash_size,
            });
        }

        Ok(())
    }

    /// One past the last flash address
    pub fn flash_end(&self) -> u32 {
        self.flash_base.saturating_add(self.flash_size)
    }

    /// First address available to the application
    pub fn app_base(&self) -> u32 {
        self.flash_base.saturating_add(self.bootloader_size)
    }

    /// Address of the application's relocated vector table
    pub fn vector_table(&self) -> u32 {
        self.app_base()
    }

    pub fn in_flash(&self, addr: u32) -> bool {
        addr >= self.flash_base && addr < self.flash_end()
    }

    pub fn in_app_flash(&self, addr: u32) -> bool {
        addr >= self.app_base() && addr < self.flash_end()
    }

    pub fn in_ram(&self, addr: u32) -> bool {
        addr >= self.ram_base && (addr - self.ram_base) < self.ram_size
    }

    /// Check that a page starting at `addr` is word aligned and lies entirely
    /// within application flash
    pub fn is_app_page(&self, addr: u32) -> bool {
        addr % WORD_SIZE as u32 == 0
            && self.in_app_flash(addr)
            && addr
                .checked_add(PAGE_SIZE)
                .is_some_and(|end| end <= self.flash_end())
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::TM4C123GH6PM
    }
}

fn deserialize_hex_to_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex = String::deserialize(deserializer)?.to_lowercase();
    let hex = hex.trim_start_matches("0x").replace('_', "");

    u32::from_str_radix(&hex, 16).map_err(serde::de::Error::custom)
}

fn serialize_u32_to_hex<S>(value: &u32, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{value:#010x}"))
}
