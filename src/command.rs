//! Command words for the controller's command buffer, and the sequencer that turns a logical
//! operation into them.

use deku::prelude::*;

use crate::error::{NfcError, Result};
use crate::geometry::Geometry;

/// Most command words one logical operation ever takes (an 8 KiB page: dispatch + 4 chunks)
pub const MAX_WORDS: usize = 5;

pub const CMD_READ0: u8 = 0x00;
pub const CMD_RNDOUT: u8 = 0x05;
pub const CMD_PAGEPROG: u8 = 0x10;
pub const CMD_PAGEPROG_PLANE: u8 = 0x11;
pub const CMD_READSTART: u8 = 0x30;
pub const CMD_ERASE1: u8 = 0x60;
pub const CMD_STATUS: u8 = 0x70;
pub const CMD_SEQIN: u8 = 0x80;
pub const CMD_SEQIN_PLANE: u8 = 0x81;
pub const CMD_READID: u8 = 0x90;
pub const CMD_ERASE2: u8 = 0xD0;
pub const CMD_RESET: u8 = 0xFF;

/// Logical operations the sequencer knows how to build
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    Read,
    RandomReadout,
    Program,
    ReadId,
    ReadStatus,
    Erase,
    Reset,
}

impl TryFrom<u8> for Opcode {
    type Error = NfcError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            CMD_READ0 => Opcode::Read,
            CMD_RNDOUT => Opcode::RandomReadout,
            CMD_SEQIN => Opcode::Program,
            CMD_READID => Opcode::ReadId,
            CMD_STATUS => Opcode::ReadStatus,
            CMD_ERASE1 => Opcode::Erase,
            CMD_RESET => Opcode::Reset,
            other => return Err(NfcError::InvalidOperation(other)),
        })
    }
}

impl Opcode {
    /// The first opcode byte of this operation on the flash bus
    pub fn code(self) -> u8 {
        match self {
            Opcode::Read => CMD_READ0,
            Opcode::RandomReadout => CMD_RNDOUT,
            Opcode::Program => CMD_SEQIN,
            Opcode::ReadId => CMD_READID,
            Opcode::ReadStatus => CMD_STATUS,
            Opcode::Erase => CMD_ERASE1,
            Opcode::Reset => CMD_RESET,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, Opcode::Read | Opcode::RandomReadout)
    }

    /// Does this operation move ECC-protected page data?
    pub fn uses_ecc(self) -> bool {
        matches!(self, Opcode::Read | Opcode::RandomReadout | Opcode::Program)
    }
}

/// How the controller sequences a command (NDCB0 "extended command type")
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtType {
    Monolithic = 0,
    LastNaked = 1,
    Final = 3,
    DispatchWrite = 4,
    NakedRw = 5,
    Dispatch = 6,
}

/// What the controller does on the flash bus (NDCB0 "command type")
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdType {
    Read = 0,
    Program = 1,
    Erase = 2,
    ReadId = 3,
    Status = 4,
    Reset = 5,
    NakedCmd = 6,
    NakedAddr = 7,
}

impl ExtType {
    fn from_bits(bits: u8) -> Option<Self> {
        use ExtType::*;
        [Monolithic, LastNaked, Final, DispatchWrite, NakedRw, Dispatch]
            .into_iter()
            .find(|x| *x as u8 == bits)
    }
}

impl CmdType {
    fn from_bits(bits: u8) -> Self {
        use CmdType::*;
        [Read, Program, Erase, ReadId, Status, Reset, NakedCmd, NakedAddr][bits as usize & 0x7]
    }
}

/// The first command buffer word, bit for bit
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct Ndcb0 {
    #[deku(bits = "3")]
    ext_type: u8,
    #[deku(bits = "1")]
    pub len_ovrd: bool,
    #[deku(bits = "1")]
    pub rdy_byp: bool,
    #[deku(bits = "1")]
    pub st_row_en: bool,
    #[deku(bits = "1")]
    pub auto_rs: bool,
    #[deku(bits = "1")]
    csel: bool,
    #[deku(bits = "3")]
    cmd_type: u8,
    #[deku(bits = "1")]
    pub nc: bool,
    #[deku(bits = "1")]
    pub dbc: bool,
    #[deku(bits = "3")]
    addr_cyc: u8,
    pub cmd2: u8,
    pub cmd1: u8,
}

impl Ndcb0 {
    pub fn new(ext: ExtType, cmd: CmdType, cs: u8) -> Self {
        Self {
            ext_type: ext as u8,
            cmd_type: cmd as u8,
            csel: cs != 0,
            ..Default::default()
        }
    }

    pub fn decode(word: u32) -> Result<Self> {
        let (_, ndcb0) = Self::from_bytes((&word.to_be_bytes(), 0))?;
        Ok(ndcb0)
    }

    pub fn encode(&self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .to_bytes()?
            .try_into()
            .map_err(|_| anyhow::anyhow!("NDCB0 did not encode to 4 bytes"))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Reserved encodings decode as `None`
    pub fn ext_type(&self) -> Option<ExtType> {
        ExtType::from_bits(self.ext_type)
    }

    pub fn cmd_type(&self) -> CmdType {
        CmdType::from_bits(self.cmd_type)
    }

    pub fn chip_select(&self) -> u8 {
        self.csel as u8
    }

    pub fn addr_cycles(&self) -> u8 {
        self.addr_cyc
    }

    pub fn with_addr_cycles(mut self, cycles: u8) -> Self {
        self.addr_cyc = cycles & 0x7;
        self
    }

    pub fn with_cmds(mut self, cmd1: u8, cmd2: Option<u8>) -> Self {
        self.cmd1 = cmd1;
        self.cmd2 = cmd2.unwrap_or(0);
        self.dbc = cmd2.is_some();
        self
    }
}

/// One complete command buffer entry: NDCB0 plus its address words and optional length override
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommandWord {
    pub ndcb0: Ndcb0,
    pub addr1: u32,
    pub addr2: u32,
    pub len_override: Option<u16>,
    /// Bytes moved through the data FIFO once this word is issued
    pub data_len: usize,
}

impl CommandWord {
    fn new(ndcb0: Ndcb0) -> Self {
        Self {
            ndcb0,
            addr1: 0,
            addr2: 0,
            len_override: None,
            data_len: 0,
        }
    }

    fn with_len(mut self, len: usize, len_override: bool) -> Self {
        self.data_len = len;
        if len_override {
            self.ndcb0.len_ovrd = true;
            self.len_override = Some(len as u16);
        }
        self
    }

    /// The values written to the command buffer port, in order
    pub fn port_words(&self) -> Result<Vec<u32>> {
        let mut words = vec![self.ndcb0.encode()?, self.addr1, self.addr2];
        words.extend(self.len_override.map(u32::from));
        Ok(words)
    }

    /// The address bytes this word puts on the bus, first cycle first
    pub fn address_bytes(&self) -> Vec<u8> {
        let mut bytes = self.addr1.to_le_bytes().to_vec();
        bytes.push(self.addr2 as u8);
        bytes.truncate(self.ndcb0.addr_cycles() as usize);
        bytes
    }
}

/// The command words for one logical operation, plus how to run them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSequence {
    /// `None` for vendor exchanges
    pub op: Option<Opcode>,
    pub words: Vec<CommandWord>,
    /// Issue count at which completion additionally requires the ready line
    pub wait_ready: Option<usize>,
    pub dma_eligible: bool,
}

impl CommandSequence {
    pub fn total(&self) -> usize {
        self.words.len()
    }

    pub fn data_len(&self) -> usize {
        self.words.iter().map(|w| w.data_len).sum()
    }
}

/// One step of a vendor-specific command exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorStep {
    Command(u8),
    Address(Vec<u8>),
    Write(Vec<u8>),
    Read(usize),
    Reset,
}

/// An ordered vendor command exchange (feature registers, OTP access, and so on)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VendorSequence(pub Vec<VendorStep>);

impl VendorSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cmd(mut self, opcode: u8) -> Self {
        self.0.push(VendorStep::Command(opcode));
        self
    }

    pub fn addr(mut self, bytes: &[u8]) -> Self {
        self.0.push(VendorStep::Address(bytes.to_vec()));
        self
    }

    pub fn write(mut self, bytes: &[u8]) -> Self {
        self.0.push(VendorStep::Write(bytes.to_vec()));
        self
    }

    pub fn read(mut self, len: usize) -> Self {
        self.0.push(VendorStep::Read(len));
        self
    }

    pub fn reset(mut self) -> Self {
        self.0.push(VendorStep::Reset);
        self
    }

    pub fn steps(&self) -> &[VendorStep] {
        &self.0
    }
}

/// Builds command words for one chip select of one chip
#[derive(Debug, Copy, Clone)]
pub struct CommandSequencer<'a> {
    geo: &'a Geometry,
    cs: u8,
}

impl<'a> CommandSequencer<'a> {
    pub fn new(geo: &'a Geometry, cs: u8) -> Self {
        Self { geo, cs }
    }

    /// Address cycles for an operation
    pub fn addr_cycles(&self, op: Opcode) -> u8 {
        match op {
            Opcode::ReadId | Opcode::ReadStatus | Opcode::Reset => 0,
            Opcode::Erase => self.geo.row_cycles,
            _ => self.geo.row_cycles + self.geo.col_cycles,
        }
    }

    /// Pack a column/page pair into the address words
    pub fn pack_address(&self, column: u32, page: u32) -> (u32, u32) {
        if self.geo.is_large_page() {
            ((page & 0xffff) << 16 | (column & 0xffff), (page >> 16) & 0xff)
        } else {
            ((page & 0xff_ffff) << 8 | (column & 0xff), 0)
        }
    }

    pub fn build(&self, op: Opcode, column: u32, page: u32) -> Result<CommandSequence> {
        let geo = self.geo;
        let cs = self.cs;
        let (addr1, addr2) = self.pack_address(column, page);
        let cycles = self.addr_cycles(op);
        let chunks = geo.chunks();
        let chunked = geo.page_size > geo.chunk_size();

        let addressed = |ndcb0: Ndcb0| CommandWord {
            addr1,
            addr2,
            ..CommandWord::new(ndcb0.with_addr_cycles(cycles))
        };

        let (words, wait_ready) = match op {
            Opcode::Read | Opcode::RandomReadout if !geo.is_large_page() => {
                let ndcb0 = Ndcb0::new(ExtType::Monolithic, CmdType::Read, cs).with_cmds(CMD_READ0, None);
                (vec![addressed(ndcb0).with_len(geo.raw_page_len(), false)], None)
            }
            Opcode::Read | Opcode::RandomReadout if !chunked => {
                let ndcb0 = Ndcb0::new(ExtType::Monolithic, CmdType::Read, cs)
                    .with_cmds(CMD_READ0, Some(CMD_READSTART));
                (vec![addressed(ndcb0).with_len(geo.raw_page_len(), false)], None)
            }
            Opcode::Read | Opcode::RandomReadout => {
                let mut dispatch = Ndcb0::new(ExtType::Dispatch, CmdType::Read, cs)
                    .with_cmds(CMD_READ0, Some(CMD_READSTART));
                dispatch.nc = true;

                let mut words = vec![addressed(dispatch)];
                for chunk in 0..chunks {
                    let last = chunk + 1 == chunks;
                    let ext = if last { ExtType::LastNaked } else { ExtType::NakedRw };
                    let mut ndcb0 = Ndcb0::new(ext, CmdType::Read, cs);
                    ndcb0.nc = !last;
                    words.push(CommandWord::new(ndcb0).with_len(geo.transfer_len(chunk), true));
                }
                // The page has to reach the cache register before any chunk can be fetched
                (words, Some(1))
            }
            Opcode::Program if !chunked => {
                let ndcb0 = Ndcb0::new(ExtType::Monolithic, CmdType::Program, cs)
                    .with_cmds(CMD_SEQIN, Some(CMD_PAGEPROG));
                let mut word = addressed(ndcb0);
                word.ndcb0.auto_rs = true;
                (vec![word.with_len(geo.raw_page_len(), false)], Some(1))
            }
            Opcode::Program => {
                let mut first = Ndcb0::new(ExtType::DispatchWrite, CmdType::Program, cs).with_cmds(CMD_SEQIN, None);
                first.nc = true;

                let mut words = vec![addressed(first).with_len(geo.transfer_len(0), true)];
                for chunk in 1..chunks {
                    let mut ndcb0 = Ndcb0::new(ExtType::NakedRw, CmdType::Program, cs);
                    ndcb0.nc = true;
                    words.push(CommandWord::new(ndcb0).with_len(geo.transfer_len(chunk), true));
                }

                let mut last = Ndcb0::new(ExtType::Final, CmdType::Program, cs)
                    .with_cmds(CMD_SEQIN, Some(CMD_PAGEPROG));
                last.st_row_en = true;
                words.push(CommandWord::new(last));

                let total = words.len();
                (words, Some(total))
            }
            Opcode::Erase => {
                let mut ndcb0 = Ndcb0::new(ExtType::Monolithic, CmdType::Erase, cs)
                    .with_cmds(CMD_ERASE1, Some(CMD_ERASE2));
                ndcb0.auto_rs = true;
                let word = CommandWord {
                    addr1: geo.block_start(page),
                    ..CommandWord::new(ndcb0.with_addr_cycles(cycles))
                };
                (vec![word], Some(1))
            }
            Opcode::ReadId => {
                let ndcb0 = Ndcb0::new(ExtType::Monolithic, CmdType::ReadId, cs)
                    .with_cmds(CMD_READID, None)
                    .with_addr_cycles(1);
                (vec![CommandWord::new(ndcb0).with_len(8, false)], None)
            }
            Opcode::ReadStatus => {
                let ndcb0 = Ndcb0::new(ExtType::Monolithic, CmdType::Status, cs).with_cmds(CMD_STATUS, None);
                (vec![CommandWord::new(ndcb0).with_len(8, false)], None)
            }
            Opcode::Reset => {
                let ndcb0 = Ndcb0::new(ExtType::Monolithic, CmdType::Reset, cs).with_cmds(CMD_RESET, None);
                (vec![CommandWord::new(ndcb0)], Some(1))
            }
        };

        debug_assert!(words.len() <= MAX_WORDS);

        Ok(CommandSequence {
            op: Some(op),
            words,
            wait_ready,
            dma_eligible: geo.is_large_page() && matches!(op, Opcode::Read | Opcode::RandomReadout | Opcode::Program | Opcode::Erase),
        })
    }

    /// A lone command cycle
    pub fn naked_cmd(&self, opcode: u8) -> CommandWord {
        CommandWord::new(Ndcb0::new(ExtType::NakedRw, CmdType::NakedCmd, self.cs).with_cmds(opcode, None))
    }

    /// A lone address phase carrying raw bytes (at most five)
    pub fn naked_addr(&self, bytes: &[u8]) -> CommandWord {
        let mut padded = [0u8; 5];
        let len = bytes.len().min(5);
        padded[..len].copy_from_slice(&bytes[..len]);

        CommandWord {
            addr1: u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]),
            addr2: padded[4] as u32,
            ..CommandWord::new(Ndcb0::new(ExtType::NakedRw, CmdType::NakedAddr, self.cs).with_addr_cycles(len as u8))
        }
    }

    /// A lone address phase for a page: column cycles then row cycles, or rows only for erase
    pub fn naked_page_addr(&self, op: Opcode, page: u32) -> CommandWord {
        let cycles = self.addr_cycles(op);
        let (addr1, addr2) = match op {
            Opcode::Erase => (page, 0),
            _ => self.pack_address(0, page),
        };
        CommandWord {
            addr1,
            addr2,
            ..CommandWord::new(Ndcb0::new(ExtType::NakedRw, CmdType::NakedAddr, self.cs).with_addr_cycles(cycles))
        }
    }

    /// A lone data phase of `len` bytes
    pub fn naked_data(&self, write: bool, len: usize) -> CommandWord {
        let cmd = if write { CmdType::Program } else { CmdType::Read };
        CommandWord::new(Ndcb0::new(ExtType::NakedRw, cmd, self.cs)).with_len(len, true)
    }

    /// One vendor step as a single-word sequence
    pub fn vendor_step(&self, step: &VendorStep) -> Result<CommandSequence> {
        let word = match step {
            VendorStep::Command(opcode) => self.naked_cmd(*opcode),
            VendorStep::Address(bytes) if bytes.len() <= 5 => self.naked_addr(bytes),
            VendorStep::Address(bytes) => {
                return Err(NfcError::UnsupportedConfig(format!("{}-cycle address", bytes.len())))
            }
            VendorStep::Write(bytes) => self.naked_data(true, bytes.len()),
            VendorStep::Read(len) => self.naked_data(false, *len),
            VendorStep::Reset => return self.build(Opcode::Reset, 0, 0),
        };

        Ok(CommandSequence {
            op: None,
            words: vec![word],
            wait_ready: None,
            dma_eligible: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{FlashType, FLASH_TYPES};

    fn geometry(page_size: usize) -> Geometry {
        let base = FLASH_TYPES.iter().find(|f| f.chip_id == 0xdead).unwrap();
        let ecc_strength = if page_size == 512 { 1 } else { base.ecc_strength };
        Geometry::new(&FlashType { page_size, ecc_strength, ..*base }).unwrap()
    }

    #[test]
    fn test_ndcb0_fields() {
        let mut ndcb0 = Ndcb0::new(ExtType::Dispatch, CmdType::Read, 1)
            .with_cmds(CMD_READ0, Some(CMD_READSTART))
            .with_addr_cycles(5);
        ndcb0.nc = true;

        let word = ndcb0.encode().unwrap();
        assert_eq!(word >> 29, 6);
        assert_eq!((word >> 24) & 1, 1);
        assert_eq!((word >> 21) & 7, 0);
        assert_eq!((word >> 20) & 1, 1);
        assert_eq!((word >> 19) & 1, 1);
        assert_eq!((word >> 16) & 7, 5);
        assert_eq!((word >> 8) & 0xff, 0x30);
        assert_eq!(word & 0xff, 0x00);

        let back = Ndcb0::decode(word).unwrap();
        assert_eq!(back, ndcb0);
        assert_eq!(back.ext_type(), Some(ExtType::Dispatch));
        assert_eq!(back.chip_select(), 1);
    }

    #[test]
    fn test_reserved_ext_type() {
        assert_eq!(Ndcb0::decode(2 << 29).unwrap().ext_type(), None);
        assert_eq!(Ndcb0::decode(7 << 21).unwrap().cmd_type(), CmdType::NakedAddr);
    }

    #[test]
    fn test_opcode_parse() {
        assert_eq!(Opcode::try_from(0x60).unwrap(), Opcode::Erase);
        assert!(matches!(Opcode::try_from(0x2a), Err(NfcError::InvalidOperation(0x2a))));
    }

    #[test]
    fn test_address_packing() {
        let large = geometry(8192);
        let seq = CommandSequencer::new(&large, 0);
        assert_eq!(seq.pack_address(0x12, 0x03_4567), (0x4567_0012, 0x03));

        let small = geometry(512);
        let seq = CommandSequencer::new(&small, 0);
        assert_eq!(seq.pack_address(0x1ff, 0x03_4567), (0x0345_67ff, 0));
    }

    #[test]
    fn test_chunked_read() {
        let geo = geometry(8192);
        let seq = CommandSequencer::new(&geo, 0).build(Opcode::Read, 0, 77).unwrap();

        assert_eq!(seq.total(), 5);
        assert_eq!(seq.wait_ready, Some(1));
        assert!(seq.dma_eligible);
        assert_eq!(seq.words[0].ndcb0.ext_type(), Some(ExtType::Dispatch));
        assert_eq!(seq.words[0].address_bytes(), vec![0, 0, 77, 0, 0]);

        let lens: Vec<_> = seq.words[1..].iter().map(|w| w.len_override).collect();
        assert_eq!(lens, [Some(2048), Some(2048), Some(2048), Some(2048 + 32)]);
        assert!(seq.words[4].ndcb0.len_ovrd && !seq.words[4].ndcb0.nc);
        assert_eq!(seq.words[4].ndcb0.ext_type(), Some(ExtType::LastNaked));
        assert_eq!(seq.data_len(), 8192 + 32);
    }

    #[test]
    fn test_chunked_program_waits_for_ready_last() {
        for page_size in [4096, 8192] {
            let geo = geometry(page_size);
            let seq = CommandSequencer::new(&geo, 0).build(Opcode::Program, 0, 3).unwrap();
            let chunks = page_size / 2048;

            assert_eq!(seq.total(), chunks + 1);
            assert_eq!(seq.wait_ready, Some(chunks + 1));

            let last = seq.words.last().unwrap();
            assert_eq!(last.ndcb0.ext_type(), Some(ExtType::Final));
            assert_eq!((last.ndcb0.cmd2, last.data_len), (CMD_PAGEPROG, 0));
            assert_eq!(seq.words[chunks - 1].data_len, 2048 + geo.oob_size);
        }
    }

    #[test]
    fn test_monolithic_ops() {
        let geo = geometry(2048);
        let sequencer = CommandSequencer::new(&geo, 0);

        let program = sequencer.build(Opcode::Program, 0, 9).unwrap();
        assert_eq!((program.total(), program.wait_ready), (1, Some(1)));
        assert_eq!(program.words[0].data_len, 2048 + geo.oob_size);

        let erase = sequencer.build(Opcode::Erase, 0, 300).unwrap();
        assert_eq!(erase.words[0].addr1, 256);
        assert_eq!(erase.words[0].ndcb0.addr_cycles(), geo.row_cycles);
        assert_eq!(erase.wait_ready, Some(1));

        let status = sequencer.build(Opcode::ReadStatus, 0, 0).unwrap();
        assert_eq!(status.words[0].ndcb0.addr_cycles(), 0);
        assert!(!status.dma_eligible);
    }

    #[test]
    fn test_small_page_not_dma_eligible() {
        let geo = geometry(512);
        let seq = CommandSequencer::new(&geo, 0).build(Opcode::Read, 0, 1).unwrap();
        assert!(!seq.dma_eligible);
        assert_eq!(seq.words[0].data_len, 512 + 8);
        assert_eq!(seq.words[0].ndcb0.addr_cycles(), 4);
    }

    #[test]
    fn test_vendor_steps() {
        let geo = geometry(8192);
        let sequencer = CommandSequencer::new(&geo, 1);

        let addr = sequencer.vendor_step(&VendorStep::Address(vec![0, 0, 0, 2, 0])).unwrap();
        assert_eq!(addr.words[0].address_bytes(), vec![0, 0, 0, 2, 0]);

        let write = sequencer.vendor_step(&VendorStep::Write(vec![0x4d])).unwrap();
        assert_eq!(write.words[0].port_words().unwrap().len(), 4);
        assert_eq!(write.words[0].ndcb0.chip_select(), 1);

        assert!(sequencer.vendor_step(&VendorStep::Address(vec![0; 6])).is_err());
    }
}
