//! Intel HEX loader
//!
//! Records have the form `:LLAAAATT[DD...]CC` where `LL` is the payload
//! length, `AAAA` the lower 16 bits of the load address, `TT` the record type,
//! and `CC` the two's complement of the sum of all preceding bytes of the
//! record. Only data, end-of-file, and extended linear address records are
//! understood; extended segment addressing is rejected.

use std::{fmt, fs, path::Path};

use heapless::Vec;
use log::{debug, info, warn};

use super::MemoryImage;
use crate::{
    error::{Error, FormatError},
    layout::MemoryLayout,
};

const START_CODE: u8 = b':';

/// Kind of a hex record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
    ExtendedLinearAddress,
    Unknown(u8),
}

impl From<u8> for RecordType {
    fn from(raw: u8) -> Self {
        match raw {
            0 => RecordType::Data,
            1 => RecordType::EndOfFile,
            2 => RecordType::ExtendedSegmentAddress,
            4 => RecordType::ExtendedLinearAddress,
            other => RecordType::Unknown(other),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Data => write!(f, "data (0)"),
            RecordType::EndOfFile => write!(f, "end-of-file (1)"),
            RecordType::ExtendedSegmentAddress => write!(f, "extended segment address (2)"),
            RecordType::ExtendedLinearAddress => write!(f, "extended linear address (4)"),
            RecordType::Unknown(raw) => write!(f, "unknown ({raw})"),
        }
    }
}

/// What to do with a record of a type the loader does not know
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownRecordPolicy {
    /// Stop parsing as if an end-of-file record had been read
    #[default]
    TreatAsEnd,
    /// Fail with [FormatError::UnknownRecord]
    Reject,
}

/// A single parsed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub byte_count: u8,
    pub offset: u16,
    pub record_type: RecordType,
    pub payload: Vec<u8, 255>,
    pub checksum: u8,
}

impl HexRecord {
    /// Checksum the record should carry given its contents
    pub fn expected_checksum(&self) -> u8 {
        let [offset_high, offset_low] = self.offset.to_be_bytes();
        let raw_type = match self.record_type {
            RecordType::Data => 0,
            RecordType::EndOfFile => 1,
            RecordType::ExtendedSegmentAddress => 2,
            RecordType::ExtendedLinearAddress => 4,
            RecordType::Unknown(raw) => raw,
        };

        let sum = [self.byte_count, offset_high, offset_low, raw_type]
            .iter()
            .chain(self.payload.iter())
            .fold(0u8, |sum, byte| sum.wrapping_add(*byte));

        0u8.wrapping_sub(sum)
    }
}

/// Splits hex text into records, tracking position for diagnostics
struct RecordReader<'a> {
    source: &'a [u8],
    pos: usize,
    line: usize,
    record: usize,
}

impl<'a> RecordReader<'a> {
    fn new(source: &'a [u8]) -> Self {
        RecordReader {
            source,
            pos: 0,
            line: 1,
            record: 0,
        }
    }

    /// Read the next record, or `None` once the input is exhausted
    fn next_record(&mut self) -> Result<Option<HexRecord>, FormatError> {
        loop {
            match self.source.get(self.pos) {
                None => return Ok(None),
                Some(b'\n') => self.line += 1,
                Some(b'\r') => {}
                Some(&START_CODE) => break,
                Some(&other) => {
                    return Err(FormatError::UnexpectedCharacter {
                        line: self.line,
                        found: other as char,
                    })
                }
            }
            self.pos += 1;
        }
        self.pos += 1;
        self.record += 1;

        let byte_count = self.read_byte()?;
        let offset = u16::from_be_bytes([self.read_byte()?, self.read_byte()?]);
        let record_type = RecordType::from(self.read_byte()?);

        let mut payload = Vec::new();
        for _ in 0..byte_count {
            // Capacity equals the largest possible byte count
            let _ = payload.push(self.read_byte()?);
        }
        let checksum = self.read_byte()?;

        Ok(Some(HexRecord {
            byte_count,
            offset,
            record_type,
            payload,
            checksum,
        }))
    }

    fn read_byte(&mut self) -> Result<u8, FormatError> {
        let digits = self
            .source
            .get(self.pos..self.pos + 2)
            .ok_or(FormatError::TruncatedRecord {
                record: self.record,
            })?;
        self.pos += 2;

        match (hex_value(digits[0]), hex_value(digits[1])) {
            (Some(high), Some(low)) => Ok(high << 4 | low),
            _ => Err(FormatError::InvalidDigit {
                record: self.record,
                line: self.line,
            }),
        }
    }
}

fn hex_value(digit: u8) -> Option<u8> {
    (digit as char).to_digit(16).map(|value| value as u8)
}

/// Builds a [MemoryImage] from Intel HEX text
#[derive(Debug, Clone, Copy)]
pub struct HexImageLoader {
    layout: MemoryLayout,
    unknown_records: UnknownRecordPolicy,
}

impl HexImageLoader {
    pub fn new(layout: MemoryLayout) -> Self {
        HexImageLoader {
            layout,
            unknown_records: UnknownRecordPolicy::default(),
        }
    }

    /// Choose how records of unknown type are handled
    pub fn unknown_records(mut self, policy: UnknownRecordPolicy) -> Self {
        self.unknown_records = policy;
        self
    }

    /// Read and parse a hex file from disk
    pub fn load_file(&self, path: &Path) -> Result<MemoryImage, Error> {
        let source =
            fs::read(path).map_err(|err| Error::FileOpenError(path.display().to_string(), err))?;

        Ok(self.load(&source)?)
    }

    pub fn load_str(&self, source: &str) -> Result<MemoryImage, FormatError> {
        self.load(source.as_bytes())
    }

    pub fn load(&self, source: &[u8]) -> Result<MemoryImage, FormatError> {
        let mut image = MemoryImage::new(self.layout);
        self.load_into(source, &mut image)?;

        Ok(image)
    }

    /// Apply the records in `source` to an existing image, returning the
    /// number of records processed
    ///
    /// Each record is validated completely before any of its bytes are
    /// written, so on error the image holds exactly the records preceding the
    /// offending one.
    pub fn load_into(&self, source: &[u8], image: &mut MemoryImage) -> Result<usize, FormatError> {
        let mut reader = RecordReader::new(source);
        let mut addr_high: u32 = 0;

        loop {
            let record = reader
                .next_record()?
                .ok_or(FormatError::MissingEndOfFile {
                    records: reader.record,
                })?;
            let (number, line) = (reader.record, reader.line);

            let expected = record.expected_checksum();
            if record.checksum != expected {
                return Err(FormatError::Checksum {
                    record: number,
                    line,
                    expected,
                    found: record.checksum,
                });
            }

            match record.record_type {
                RecordType::Data => {
                    let base = addr_high << 16 | u32::from(record.offset);
                    let len = record.payload.len() as u32;
                    let layout = image.layout();
                    let fits = match base.checked_add(len.saturating_sub(1)) {
                        Some(_) if len == 0 => true,
                        Some(last) => layout.in_flash(base) && layout.in_flash(last),
                        None => false,
                    };

                    if !fits {
                        return Err(FormatError::AddressOutOfRange {
                            record: number,
                            address: base,
                        });
                    }

                    for (addr, byte) in (base..).zip(record.payload.iter()) {
                        image.set(addr, *byte);
                    }
                }
                RecordType::EndOfFile => break,
                RecordType::ExtendedSegmentAddress => {
                    return Err(FormatError::UnsupportedRecord {
                        record: number,
                        record_type: record.record_type,
                    })
                }
                RecordType::ExtendedLinearAddress => {
                    let [high, low] = record.payload.as_slice() else {
                        return Err(FormatError::InvalidLength {
                            record: number,
                            record_type: record.record_type,
                            length: record.byte_count,
                        });
                    };
                    addr_high = u32::from(u16::from_be_bytes([*high, *low]));
                    debug!("Upper address set to {:#06x}", addr_high);
                }
                RecordType::Unknown(raw) => match self.unknown_records {
                    UnknownRecordPolicy::TreatAsEnd => {
                        warn!(
                            "Record {} has unknown type {:#04x}, treating it as end of file",
                            number, raw
                        );
                        break;
                    }
                    UnknownRecordPolicy::Reject => {
                        return Err(FormatError::UnknownRecord {
                            record: number,
                            record_type: raw,
                        })
                    }
                },
            }
        }

        info!("Processed {} records", reader.record);

        Ok(reader.record)
    }
}
