//! Hynix-style read-retry tables: the OTP exchange that reads them, the self-checking image they
//! are stored in, and the copy cached in a reserved flash page.

use std::collections::HashMap;

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;
use log::{debug, info, warn};

use crate::command::VendorSequence;
use crate::error::{NfcError, Result};

/// Feature registers one table row programs, in order
pub const REGISTERS: [u8; 8] = [0xCC, 0xBF, 0xAA, 0xAB, 0xCD, 0xAD, 0xAE, 0xAF];

/// Size of the OTP image: 16 header bytes, then 8 copies of an 8x8 table and its inverse
pub const OTP_IMAGE_SIZE: usize = 16 + COPIES * 2 * 64;
const COPIES: usize = 8;
const HEADER_VOTES: usize = 8;

const CACHE_MAGIC: [u8; 4] = *b"RRTB";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTable {
    rows: Vec<[u8; REGISTERS.len()]>,
    current: usize,
}

impl RetryTable {
    pub fn new(rows: Vec<[u8; REGISTERS.len()]>) -> Result<Self> {
        if rows.is_empty() {
            return Err(NfcError::UnsupportedConfig("empty read-retry table".into()));
        }
        Ok(Self { rows, current: 0 })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&[u8; REGISTERS.len()]> {
        self.rows.get(index)
    }

    /// Row left applied by the last successful retry
    pub fn current(&self) -> usize {
        self.current
    }

    /// The row retry cycle `cycle` (1-based) applies, counted on from the current row
    pub fn row_for_cycle(&self, cycle: u32) -> usize {
        (self.current + cycle as usize) % self.rows.len()
    }

    pub(crate) fn set_current(&mut self, row: usize) {
        self.current = row % self.rows.len();
    }

    /// Program every retry register with one row's values, then reset the chip
    pub fn setter(&self, row: usize) -> VendorSequence {
        let values = self.rows[row % self.rows.len()];
        let mut seq = VendorSequence::new().cmd(0x36);
        for (reg, value) in REGISTERS.iter().zip(values) {
            seq = seq.addr(&[*reg]).write(&[value]);
        }
        seq.cmd(0x16).reset()
    }

    /// Parse an OTP image: vote on the row and register counts, then take the first copy whose
    /// inverse checks out.
    pub fn from_otp(image: &[u8]) -> Result<Self> {
        if image.len() < 2 * HEADER_VOTES {
            return Err(NfcError::UnsupportedConfig("short read-retry OTP image".into()));
        }
        let rows = majority(&image[..HEADER_VOTES]) as usize;
        let regs = majority(&image[HEADER_VOTES..2 * HEADER_VOTES]) as usize;
        debug!("retry OTP header: {rows} rows of {regs} registers");

        if regs != REGISTERS.len() || rows == 0 {
            return Err(NfcError::UnsupportedConfig(format!(
                "read-retry table of {rows} rows x {regs} registers"
            )));
        }

        let table_len = rows * regs;
        let copies = &image[2 * HEADER_VOTES..];
        if copies.len() < COPIES * 2 * table_len {
            return Err(NfcError::UnsupportedConfig("truncated read-retry OTP image".into()));
        }

        for (index, copy) in copies.chunks_exact(2 * table_len).take(COPIES).enumerate() {
            let (table, inverse) = copy.split_at(table_len);
            if table.iter().zip(inverse).all(|(a, b)| a ^ b == 0xFF) {
                info!("read-retry table: {rows} rows, from OTP copy {index}");
                let rows = table
                    .chunks_exact(regs)
                    .map(|row| {
                        let mut values = [0u8; REGISTERS.len()];
                        values.copy_from_slice(row);
                        values
                    })
                    .collect();
                return Self::new(rows);
            }
            warn!("read-retry OTP copy {index} failed its inverse check");
        }

        Err(NfcError::UnsupportedConfig("no valid read-retry table copy in OTP".into()))
    }

    /// The image this table would be stored as in OTP
    pub fn otp_image(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(OTP_IMAGE_SIZE);
        image.extend([self.rows.len() as u8; HEADER_VOTES]);
        image.extend([REGISTERS.len() as u8; HEADER_VOTES]);
        let table: Vec<u8> = self.rows.iter().flatten().copied().collect();
        for _ in 0..COPIES {
            image.extend(&table);
            image.extend(table.iter().map(|b| !b));
        }
        if image.len() < OTP_IMAGE_SIZE {
            image.resize(OTP_IMAGE_SIZE, 0xFF);
        }
        image
    }
}

fn majority(votes: &[u8]) -> u8 {
    let mut counts: HashMap<u8, usize> = HashMap::new();
    for &vote in votes {
        *counts.entry(vote).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|&(value, count)| (count, std::cmp::Reverse(value)))
        .map_or(0, |(value, _)| value)
}

/// The vendor exchange that reads the OTP image
pub fn otp_read_sequence() -> VendorSequence {
    VendorSequence::new()
        .reset()
        .cmd(0x36)
        .addr(&[0xFF])
        .write(&[0x40])
        .addr(&[0xCC])
        .write(&[0x4D])
        .cmd(0x16)
        .cmd(0x17)
        .cmd(0x04)
        .cmd(0x19)
        .cmd(0x00)
        .addr(&[0x00, 0x00, 0x00, 0x02, 0x00])
        .cmd(0x30)
        .read(OTP_IMAGE_SIZE)
        .reset()
        .cmd(0x38)
}

#[derive(Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
struct CacheHeader {
    magic: [u8; 4],
    crc: u32,
    len: u16,
}

const CACHE_HEADER_SIZE: usize = 10;

fn checksum(image: &[u8]) -> u32 {
    Crc::<u32>::new(&CRC_32_JAMCRC).checksum(image)
}

/// Lay out an OTP image for the reserved cache page (padded with 0xFF to `page_size`)
pub fn encode_cached(image: &[u8], page_size: usize) -> Result<Vec<u8>> {
    if CACHE_HEADER_SIZE + image.len() > page_size {
        return Err(NfcError::UnsupportedConfig(format!(
            "{}-byte retry table does not fit a {page_size}-byte page",
            image.len()
        )));
    }

    let header = CacheHeader {
        magic: CACHE_MAGIC,
        crc: checksum(image),
        len: image.len() as u16,
    };
    let mut page = header.to_bytes()?;
    page.extend_from_slice(image);
    page.resize(page_size, 0xFF);
    Ok(page)
}

/// Recover the OTP image from a cache page, if it holds a valid one
pub fn decode_cached(page: &[u8]) -> Option<&[u8]> {
    let ((rest, _), header) = CacheHeader::from_bytes((page, 0)).ok()?;
    if header.magic != CACHE_MAGIC {
        return None;
    }
    let image = rest.get(..header.len as usize)?;
    if checksum(image) != header.crc {
        warn!("cached read-retry table fails its checksum");
        return None;
    }
    Some(image)
}
