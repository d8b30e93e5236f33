//! Bus-level model of one NAND chip: command/address/data cycles in, page array and vendor
//! registers behind them.

use std::collections::{HashMap, HashSet};

use log::trace;

use crate::error::Result;
use crate::geometry::{FlashType, Geometry};
use crate::retry::table::REGISTERS;
use crate::retry::{RetryKind, RetryTable};

const READ_BUSY: u32 = 3;
const PROGRAM_BUSY: u32 = 5;
const ERASE_BUSY: u32 = 8;
const RESET_BUSY: u32 = 2;

/// Pseudo-SLC mode registers and their power-on values
const MODE_REGISTERS: std::ops::RangeInclusive<u8> = 0xB0..=0xB7;
const MODE_DEFAULT: u8 = 0x20;

const STATUS_READY: u8 = 0xC0;
const STATUS_FAIL: u8 = 0x01;

/// What one data-out burst produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOut {
    /// Bytes as the array returns them, injected flips included
    pub raw: Vec<u8>,
    /// The same span as it was programmed; `None` when erased or not array data
    pub programmed: Option<Vec<u8>>,
    /// Flipped bits within the span
    pub flips: u32,
    /// Came out of the page array, as opposed to ID/status/register data
    pub from_array: bool,
    pub bad_block: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    Idle,
    Read,
    Program,
    Erase,
    ReadId,
    RegWrite,
    RegRead,
    SetFeature,
    GetFeature,
}

#[derive(Debug)]
enum Output {
    None,
    Array {
        raw: Vec<u8>,
        programmed: Option<Box<[u8]>>,
        flips: Vec<usize>,
        bad: bool,
        cursor: usize,
    },
    Bytes {
        data: Vec<u8>,
        cursor: usize,
    },
    Status,
}

#[derive(Debug)]
pub struct SimFlash {
    flash: FlashType,
    geo: Geometry,

    pages: HashMap<u32, Box<[u8]>>,
    flips: HashMap<u32, Vec<usize>>,
    heal: HashMap<u32, u8>,
    bad_blocks: HashSet<u32>,
    program_failures: HashSet<u32>,
    erase_failures: HashSet<u32>,
    stalled: bool,

    regs: HashMap<u8, u8>,
    features: HashMap<u8, [u8; 4]>,
    retry_table: Option<RetryTable>,
    otp_mode: bool,
    slc_log: Vec<bool>,
    commands: Vec<u8>,

    mode: Mode,
    recent: [u8; 4],
    row: u32,
    col: usize,
    reg: Option<u8>,
    reg_session: Vec<u8>,
    program_buf: Vec<u8>,
    write_cursor: usize,
    program_planes: Vec<(u32, Vec<u8>)>,
    erase_rows: Vec<u32>,
    failed: bool,
    output: Output,
    busy: u32,
}

impl SimFlash {
    pub fn new(flash: FlashType) -> Result<Self> {
        let geo = Geometry::new(&flash)?;

        let mut regs: HashMap<u8, u8> = MODE_REGISTERS.map(|r| (r, MODE_DEFAULT + (r - 0xB0))).collect();
        let retry_table = match RetryKind::for_flash(&flash) {
            RetryKind::Table => {
                let rows = (0..8u8)
                    .map(|r| {
                        let mut row = [0u8; REGISTERS.len()];
                        for (i, value) in row.iter_mut().enumerate() {
                            *value = r.wrapping_mul(0x10).wrapping_add(i as u8);
                        }
                        row
                    })
                    .collect();
                let table = RetryTable::new(rows)?;
                if let Some(defaults) = table.row(0) {
                    regs.extend(REGISTERS.iter().copied().zip(defaults.iter().copied()));
                }
                Some(table)
            }
            _ => None,
        };

        Ok(Self {
            flash,
            geo,
            pages: HashMap::new(),
            flips: HashMap::new(),
            heal: HashMap::new(),
            bad_blocks: HashSet::new(),
            program_failures: HashSet::new(),
            erase_failures: HashSet::new(),
            stalled: false,
            regs,
            features: HashMap::new(),
            retry_table,
            otp_mode: false,
            slc_log: Vec::new(),
            commands: Vec::new(),
            mode: Mode::Idle,
            recent: [0; 4],
            row: 0,
            col: 0,
            reg: None,
            reg_session: Vec::new(),
            program_buf: Vec::new(),
            write_cursor: 0,
            program_planes: Vec::new(),
            erase_rows: Vec::new(),
            failed: false,
            output: Output::None,
            busy: 0,
        })
    }

    pub fn flash(&self) -> &FlashType {
        &self.flash
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Every command byte the chip has seen, in order
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    /// Pseudo-SLC mode switches, `true` for entering the mode
    pub fn slc_transitions(&self) -> &[bool] {
        &self.slc_log
    }

    /// The retry table burned into this chip's OTP area, if it has one
    pub fn retry_table(&self) -> Option<&RetryTable> {
        self.retry_table.as_ref()
    }

    /// Raw contents (data then spare) of a programmed page
    pub fn page(&self, page: u32) -> Option<&[u8]> {
        self.pages.get(&page).map(|p| &p[..])
    }

    pub fn register(&self, reg: u8) -> Option<u8> {
        self.regs.get(&reg).copied()
    }

    /// Flip these bits (counted from the start of data, spare following) whenever `page` is read
    pub fn inject_flips(&mut self, page: u32, bits: &[usize]) {
        self.flips.entry(page).or_default().extend_from_slice(bits);
    }

    /// Reads of `page` come back clean once the chip is at read-retry `level`
    pub fn heal_at(&mut self, page: u32, level: u8) {
        self.heal.insert(page, level);
    }

    /// Mark a block bad the way the factory does: zeroed marker bytes in its first page
    pub fn mark_factory_bad(&mut self, block: u32) {
        let mut raw = vec![0xFF; self.geo.raw_page_len()].into_boxed_slice();
        raw[self.geo.page_size] = 0;
        raw[self.geo.page_size + 1] = 0;
        self.pages.insert(block * self.geo.pages_per_block, raw);
        self.bad_blocks.insert(block);
    }

    pub fn fail_program(&mut self, page: u32) {
        self.program_failures.insert(page);
    }

    pub fn fail_erase(&mut self, block: u32) {
        self.erase_failures.insert(block);
    }

    /// Hold the ready line low forever
    pub fn stall(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    pub fn is_ready(&self) -> bool {
        self.busy == 0
    }

    pub fn tick(&mut self) {
        if !self.stalled {
            self.busy = self.busy.saturating_sub(1);
        }
    }

    /// Current read-retry level: the matching table row, or the retry feature's index
    pub fn retry_level(&self) -> Option<u8> {
        match (&self.retry_table, RetryKind::for_flash(&self.flash)) {
            (Some(table), _) => (0..table.len()).find_map(|row| {
                let values = table.row(row)?;
                REGISTERS
                    .iter()
                    .zip(values)
                    .all(|(reg, value)| self.regs.get(reg) == Some(value))
                    .then_some(row as u8)
            }),
            (None, RetryKind::Index { .. }) => Some(self.features.get(&0x89).map_or(0, |f| f[0])),
            _ => Some(0),
        }
    }

    pub fn command(&mut self, opcode: u8) {
        trace!("flash cmd {opcode:#04x}");
        self.commands.push(opcode);
        self.recent = [self.recent[1], self.recent[2], self.recent[3], opcode];

        match opcode {
            0x00 => self.mode = Mode::Read,
            0x30 => self.load(),
            0x80 | 0x81 => {
                if opcode == 0x80 {
                    self.program_planes.clear();
                    self.failed = false;
                }
                self.mode = Mode::Program;
                self.program_buf = vec![0xFF; self.geo.raw_page_len()];
                self.write_cursor = 0;
            }
            0x11 => self.stash_plane(),
            0x10 => {
                self.stash_plane();
                self.commit_program();
            }
            0x60 => {
                if self.mode != Mode::Erase {
                    self.erase_rows.clear();
                    self.failed = false;
                }
                self.mode = Mode::Erase;
            }
            0xD0 => self.commit_erase(),
            0x70 => self.output = Output::Status,
            0x90 => {
                self.mode = Mode::ReadId;
                let mut data = self.flash.id_bytes().to_vec();
                data.resize(8, 0);
                self.output = Output::Bytes { data, cursor: 0 };
            }
            0x36 => {
                self.mode = Mode::RegWrite;
                self.reg_session.clear();
            }
            0x37 => self.mode = Mode::RegRead,
            0x16 => self.end_register_write(),
            0x19 if self.recent == [0x16, 0x17, 0x04, 0x19] => {
                if self.regs.get(&0xFF) == Some(&0x40) && self.regs.get(&0xCC) == Some(&0x4D) {
                    self.otp_mode = true;
                }
            }
            0x38 => self.otp_mode = false,
            0xEF => self.mode = Mode::SetFeature,
            0xEE => self.mode = Mode::GetFeature,
            0xFF => self.reset(),
            _ => (),
        }
    }

    pub fn address(&mut self, bytes: &[u8]) {
        let le = |bytes: &[u8]| bytes.iter().rev().fold(0u32, |acc, &b| acc << 8 | b as u32);
        let col_cycles = (self.geo.col_cycles as usize).min(bytes.len());

        match self.mode {
            Mode::Read | Mode::Program => {
                self.col = le(&bytes[..col_cycles]) as usize;
                self.row = le(&bytes[col_cycles..]);
                // Small-page chips start the array read straight after the address
                if self.mode == Mode::Read && !self.geo.is_large_page() {
                    self.load();
                }
            }
            Mode::Erase => self.erase_rows.push(le(bytes)),
            Mode::RegWrite | Mode::SetFeature => self.reg = bytes.first().copied(),
            Mode::RegRead => {
                let value = bytes.first().and_then(|r| self.regs.get(r)).copied().unwrap_or(0);
                self.output = Output::Bytes { data: vec![value], cursor: 0 };
            }
            Mode::GetFeature => {
                let value = bytes.first().and_then(|f| self.features.get(f)).copied().unwrap_or_default();
                self.output = Output::Bytes { data: value.to_vec(), cursor: 0 };
            }
            Mode::ReadId | Mode::Idle => (),
        }
    }

    pub fn write_data(&mut self, bytes: &[u8]) {
        match self.mode {
            Mode::Program => {
                let start = (self.col + self.write_cursor).min(self.program_buf.len());
                let end = (start + bytes.len()).min(self.program_buf.len());
                self.program_buf[start..end].copy_from_slice(&bytes[..end - start]);
                self.write_cursor += bytes.len();
            }
            Mode::RegWrite => {
                if let (Some(reg), Some(&value)) = (self.reg, bytes.first()) {
                    self.regs.insert(reg, value);
                    self.reg_session.push(reg);
                }
            }
            Mode::SetFeature => {
                if let Some(feature) = self.reg {
                    let mut value = [0u8; 4];
                    let len = bytes.len().min(4);
                    value[..len].copy_from_slice(&bytes[..len]);
                    self.features.insert(feature, value);
                }
            }
            _ => trace!("flash ignores {} data bytes in {:?}", bytes.len(), self.mode),
        }
    }

    pub fn read_data(&mut self, len: usize) -> ChunkOut {
        let status = STATUS_READY | if self.failed { STATUS_FAIL } else { 0 };
        let span = |cursor: &mut usize, data: &[u8]| {
            let start = (*cursor).min(data.len());
            let end = (start + len).min(data.len());
            let mut out = data[start..end].to_vec();
            out.resize(len, 0xFF);
            let range = *cursor..*cursor + len;
            *cursor += len;
            (out, range)
        };

        match &mut self.output {
            Output::Array {
                raw,
                programmed,
                flips,
                bad,
                cursor,
            } => {
                let programmed = programmed.as_deref();
                let (out, range) = span(cursor, raw);
                let flips = flips.iter().filter(|&&bit| range.contains(&(bit / 8))).count() as u32;
                ChunkOut {
                    raw: out,
                    programmed: programmed.map(|p| span(&mut range.start.clone(), p).0),
                    flips,
                    from_array: true,
                    bad_block: *bad,
                }
            }
            Output::Bytes { data, cursor } => ChunkOut {
                raw: span(cursor, data).0,
                programmed: None,
                flips: 0,
                from_array: false,
                bad_block: false,
            },
            Output::Status => ChunkOut {
                raw: vec![status; len],
                programmed: None,
                flips: 0,
                from_array: false,
                bad_block: false,
            },
            Output::None => ChunkOut {
                raw: vec![0xFF; len],
                programmed: None,
                flips: 0,
                from_array: false,
                bad_block: false,
            },
        }
    }

    fn load(&mut self) {
        self.busy = READ_BUSY;

        if self.otp_mode {
            let data = self.retry_table.as_ref().map(|t| t.otp_image()).unwrap_or_default();
            self.output = Output::Bytes { data, cursor: 0 };
            return;
        }

        let page = self.row;
        let programmed = self.pages.get(&page).cloned();
        let mut raw = programmed
            .as_deref()
            .map_or_else(|| vec![0xFF; self.geo.raw_page_len()], <[u8]>::to_vec);

        let healed = self.heal.get(&page).is_some_and(|&level| self.retry_level() == Some(level));
        let flips = match self.flips.get(&page) {
            Some(bits) if !healed => bits.clone(),
            _ => Vec::new(),
        };
        for &bit in &flips {
            if let Some(byte) = raw.get_mut(bit / 8) {
                *byte ^= 1 << (bit % 8);
            }
        }

        self.output = Output::Array {
            raw,
            programmed,
            flips,
            bad: self.bad_blocks.contains(&(page / self.geo.pages_per_block)),
            cursor: self.col,
        };
    }

    fn stash_plane(&mut self) {
        let buf = std::mem::take(&mut self.program_buf);
        self.program_planes.push((self.row, buf));
    }

    fn commit_program(&mut self) {
        self.busy = PROGRAM_BUSY;
        for (row, buf) in std::mem::take(&mut self.program_planes) {
            if self.program_failures.contains(&row) || row >= self.geo.page_count() {
                self.failed = true;
                continue;
            }
            let page = self
                .pages
                .entry(row)
                .or_insert_with(|| vec![0xFF; buf.len()].into_boxed_slice());
            // Programming can only clear bits
            for (cell, value) in page.iter_mut().zip(buf) {
                *cell &= value;
            }
        }
        self.mode = Mode::Idle;
    }

    fn commit_erase(&mut self) {
        self.busy = ERASE_BUSY;
        let ppb = self.geo.pages_per_block;
        for row in std::mem::take(&mut self.erase_rows) {
            let block = row / ppb;
            if self.erase_failures.contains(&block) || row >= self.geo.page_count() {
                self.failed = true;
                continue;
            }
            for page in block * ppb..(block + 1) * ppb {
                self.pages.remove(&page);
                self.flips.remove(&page);
            }
        }
        self.mode = Mode::Idle;
    }

    fn end_register_write(&mut self) {
        if self.mode == Mode::RegWrite && self.reg_session.iter().any(|r| MODE_REGISTERS.contains(r)) {
            let entered = self.regs.get(&0xB0) != Some(&MODE_DEFAULT);
            trace!("pseudo-SLC mode {}", if entered { "on" } else { "off" });
            self.slc_log.push(entered);
        }
        self.mode = Mode::Idle;
    }

    fn reset(&mut self) {
        self.mode = Mode::Idle;
        self.output = Output::None;
        self.program_planes.clear();
        self.erase_rows.clear();
        self.busy = RESET_BUSY;
    }
}
