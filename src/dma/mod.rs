//! DMA micro-instruction streams for the controller's sequencer hub.
//!
//! A stream is a flat run of 8-byte big-endian records, each tagged by its top nibble. The hub
//! consumes them in order: register pokes, semaphore waits, and two-stage transfers through a
//! holding buffer sized to the channel's minimum transfer unit.

use bytes::{BufMut, BytesMut};
use deku::prelude::*;

use crate::command::{CommandWord, Ndcb0};
use crate::error::{NfcError, Result};
use crate::regs::NDCB0;

pub mod channel;
pub mod compile;

pub use channel::{ChannelSynchronizer, Mtu};
pub use compile::{DescriptorCompiler, ScratchLayout, TransferPlan};

/// Hard cap on one compiled stream
pub const DESCRIPTOR_BUFFER_SIZE: usize = 32 * 1024;
pub const RECORD_SIZE: usize = 8;

/// Semaphore ids as seen by `Sema` records and the hub
pub mod sem {
    pub const NONE: u8 = 0;
    /// Posted by the controller when it wants the next command word
    pub const CMD: u8 = 1;
    /// Posted by the controller while a data phase is pending
    pub const DATA: u8 = 2;
    pub const READ_DATA: u8 = 3;
    pub const WRITE_DATA: u8 = 4;
    /// Posted by the last record of every stream
    pub const COMPLETE: u8 = 5;
}

/// One micro-instruction
#[derive(Debug, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(type = "u8", bits = "4", endian = "big")]
pub enum Record {
    /// Write `value` to controller register `reg`
    #[deku(id = "1")]
    Cfgw {
        #[deku(bits = "28")]
        reg: u32,
        value: u32,
    },

    /// Block until semaphore `check` is posted (unless 0), then post `update` (unless 0)
    #[deku(id = "2")]
    Sema {
        #[deku(pad_bits_before = "4")]
        check: u8,
        #[deku(pad_bytes_after = "5")]
        update: u8,
    },

    /// Fill the holding buffer from DRAM
    #[deku(id = "3")]
    Rcmd {
        #[deku(pad_bits_before = "4")]
        sem: u8,
        size: u16,
        ddr: u32,
    },

    /// Push the holding buffer into a device register
    #[deku(id = "4")]
    Rdat {
        #[deku(bits = "1", pad_bits_after = "11")]
        last: bool,
        size: u16,
        dev: u32,
    },

    /// Arm a drain of the holding buffer into DRAM, completed by the next `Wdat`
    #[deku(id = "5")]
    Wcmd {
        #[deku(pad_bits_before = "4")]
        sem: u8,
        size: u16,
        ddr: u32,
    },

    /// Pull from a device register into the holding buffer
    #[deku(id = "6")]
    Wdat {
        #[deku(bits = "1", pad_bits_after = "11")]
        last: bool,
        size: u16,
        dev: u32,
    },
}

impl Record {
    pub fn cfgw(reg: u32, value: u32) -> Self {
        Record::Cfgw { reg, value }
    }

    pub fn sema(check: u8, update: u8) -> Self {
        Record::Sema { check, update }
    }
}

/// Scratch space one stream is compiled into
#[derive(Debug)]
pub struct DescriptorBuffer {
    buf: BytesMut,
}

impl Default for DescriptorBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(DESCRIPTOR_BUFFER_SIZE),
        }
    }

    pub fn push(&mut self, record: Record) -> Result<()> {
        let bytes = record.to_bytes()?;
        if self.buf.len() + bytes.len() > DESCRIPTOR_BUFFER_SIZE {
            return Err(NfcError::DescriptorOverflow(self.buf.len() + bytes.len()));
        }
        self.buf.put_slice(&bytes);
        Ok(())
    }

    /// Stage a whole command word through the command buffer port
    pub fn push_command(&mut self, word: &CommandWord) -> Result<()> {
        for value in word.port_words()? {
            self.push(Record::cfgw(NDCB0, value))?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Parse a stream back into records
pub fn decode_stream(mut bytes: &[u8]) -> Result<Vec<Record>> {
    let mut records = Vec::with_capacity(bytes.len() / RECORD_SIZE);
    while !bytes.is_empty() {
        let ((rest, _), record) = Record::from_bytes((bytes, 0))?;
        records.push(record);
        bytes = rest;
    }
    Ok(records)
}

/// Reassemble the command words a stream stages through the command buffer port
pub fn staged_commands(records: &[Record]) -> Result<Vec<(Ndcb0, u32, u32, Option<u32>)>> {
    let mut port = records.iter().filter_map(|r| match *r {
        Record::Cfgw { reg, value } if reg == NDCB0 => Some(value),
        _ => None,
    });

    let mut commands = Vec::new();
    while let Some(first) = port.next() {
        let ndcb0 = Ndcb0::decode(first)?;
        let addr1 = port.next().unwrap_or(0);
        let addr2 = port.next().unwrap_or(0);
        let len = if ndcb0.len_ovrd { port.next() } else { None };
        commands.push((ndcb0, addr1, addr2, len));
    }
    Ok(commands)
}
