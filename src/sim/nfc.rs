//! Register-level model of the NAND controller: the command buffer port, the data FIFO and the
//! status register, driving up to two [`SimFlash`] chips.

use std::collections::{HashMap, VecDeque};

use log::{trace, warn};

use crate::command::{CmdType, ExtType, Ndcb0};
use crate::hw::RegisterBus;
use crate::regs::{ndcr, ndeccctrl, ndsr, NDCB0, NDCR, NDDB, NDECCCTRL, NDSR};
use crate::sim::flash::SimFlash;

/// What happens once the current phase finishes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum After {
    Complete { ready: bool, paged: bool },
    Fill { len: usize, paged: bool },
}

#[derive(Debug)]
enum Stage {
    /// Waiting for the chip before the word can run at all
    Deferred(Word),
    Busy(After),
    Reading { paged: bool },
    Writing { remaining: usize, buf: Vec<u8>, commit: Option<u8> },
}

#[derive(Debug, Copy, Clone)]
struct Word {
    ndcb0: Ndcb0,
    addr1: u32,
    addr2: u32,
    len: Option<usize>,
}

impl Word {
    fn address_bytes(&self) -> Vec<u8> {
        let mut bytes = self.addr1.to_le_bytes().to_vec();
        bytes.push(self.addr2 as u8);
        bytes.truncate(self.ndcb0.addr_cycles() as usize);
        bytes
    }
}

#[derive(Debug)]
struct Active {
    cs: u8,
    stage: Stage,
}

#[derive(Debug, Default)]
pub struct SimNfc {
    chips: [Option<SimFlash>; 2],
    ndcr: u32,
    status: u32,
    err_cnt: u32,
    regs: HashMap<u32, u32>,
    words: Vec<u32>,
    fifo: VecDeque<u8>,
    active: Option<Active>,
}

impl SimNfc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, cs: u8, flash: SimFlash) {
        self.chips[cs as usize & 1] = Some(flash);
    }

    pub fn chip(&self, cs: u8) -> Option<&SimFlash> {
        self.chips[cs as usize & 1].as_ref()
    }

    pub fn chip_mut(&mut self, cs: u8) -> Option<&mut SimFlash> {
        self.chips[cs as usize & 1].as_mut()
    }

    /// Last value written to a configuration register
    pub fn register(&self, offset: u32) -> Option<u32> {
        match offset {
            NDCR => Some(self.ndcr),
            _ => self.regs.get(&offset).copied(),
        }
    }

    fn running(&self) -> bool {
        self.ndcr & ndcr::ND_RUN != 0
    }

    fn chip_ready(&self, cs: u8) -> bool {
        self.chip(cs).map_or(true, SimFlash::is_ready)
    }

    fn ecc_strength(&self) -> Option<u32> {
        if self.ndcr & ndcr::ECC_EN == 0 {
            return None;
        }
        let ctrl = self.regs.get(&NDECCCTRL).copied().unwrap_or(0);
        Some(if ctrl & ndeccctrl::BCH_EN != 0 {
            (ctrl >> 16) & 0xff
        } else {
            1
        })
    }

    fn restart(&mut self) {
        self.words.clear();
        self.fifo.clear();
        self.active = None;
    }

    fn accept_word(&mut self, value: u32) {
        if !self.running() {
            warn!("command word {value:#010x} written while the controller is stopped");
            return;
        }
        self.words.push(value);

        let needed = if self.words[0] & (1 << 28) != 0 { 4 } else { 3 };
        if self.words.len() < needed {
            return;
        }

        let words = std::mem::take(&mut self.words);
        let ndcb0 = match Ndcb0::decode(words[0]) {
            Ok(ndcb0) => ndcb0,
            Err(err) => {
                warn!("undecodable command word {:#010x}: {err}", words[0]);
                return;
            }
        };
        let word = Word {
            ndcb0,
            addr1: words[1],
            addr2: words[2],
            len: words.get(3).map(|&l| l as usize),
        };

        self.status &= !ndsr::WRCMDREQ;
        let cs = ndcb0.chip_select();
        if self.active.is_some() {
            warn!("command word issued while another is in flight");
        }
        if self.chip_ready(cs) {
            self.run(cs, word);
        } else {
            self.active = Some(Active {
                cs,
                stage: Stage::Deferred(word),
            });
        }
    }

    fn run(&mut self, cs: u8, word: Word) {
        let ndcb0 = word.ndcb0;
        let raw_len = self.chip(cs).map_or(0, |c| c.geometry().raw_page_len());
        trace!("NFC runs {:?}/{:?} on cs{cs}", ndcb0.cmd_type(), ndcb0.ext_type());

        let stage = match (ndcb0.cmd_type(), ndcb0.ext_type()) {
            (CmdType::Read, Some(ExtType::Monolithic | ExtType::Dispatch)) => {
                self.bus_cycles(cs, &word, true);
                let after = if ndcb0.ext_type() == Some(ExtType::Dispatch) {
                    After::Complete { ready: true, paged: false }
                } else {
                    After::Fill { len: raw_len, paged: true }
                };
                Stage::Busy(after)
            }
            (CmdType::Read, _) => {
                let paged = ndcb0.ext_type() == Some(ExtType::LastNaked);
                return self.fill(cs, word.len.unwrap_or(raw_len), paged);
            }
            (CmdType::Program, Some(ExtType::Monolithic)) => {
                self.bus_cycles(cs, &word, false);
                self.status |= ndsr::WRDREQ;
                Stage::Writing {
                    remaining: raw_len,
                    buf: Vec::new(),
                    commit: Some(ndcb0.cmd2),
                }
            }
            (CmdType::Program, Some(ExtType::Final)) => {
                let cmd = if ndcb0.dbc { ndcb0.cmd2 } else { ndcb0.cmd1 };
                self.flash_command(cs, cmd);
                self.status |= ndsr::cmd_done(cs);
                Stage::Busy(After::Complete { ready: true, paged: true })
            }
            (CmdType::Program, ext) => {
                if ext == Some(ExtType::DispatchWrite) {
                    self.bus_cycles(cs, &word, false);
                }
                self.status |= ndsr::WRDREQ;
                Stage::Writing {
                    remaining: word.len.unwrap_or(raw_len),
                    buf: Vec::new(),
                    commit: None,
                }
            }
            (CmdType::Erase | CmdType::Reset, _) => {
                self.bus_cycles(cs, &word, true);
                Stage::Busy(After::Complete { ready: true, paged: false })
            }
            (CmdType::ReadId, _) => {
                self.bus_cycles(cs, &word, false);
                return self.fill(cs, word.len.unwrap_or(8), false);
            }
            (CmdType::Status, _) => {
                self.flash_command(cs, ndcb0.cmd1);
                return self.fill(cs, word.len.unwrap_or(8), false);
            }
            (CmdType::NakedCmd, _) => {
                self.flash_command(cs, ndcb0.cmd1);
                return self.complete(cs, false, false);
            }
            (CmdType::NakedAddr, _) => {
                let bytes = word.address_bytes();
                if let Some(chip) = self.chip_mut(cs) {
                    chip.address(&bytes);
                }
                return self.complete(cs, false, false);
            }
        };

        self.active = Some(Active { cs, stage });
    }

    /// Command, address and (optionally) second command cycles of a non-naked word
    fn bus_cycles(&mut self, cs: u8, word: &Word, second: bool) {
        let ndcb0 = word.ndcb0;
        let bytes = word.address_bytes();
        self.flash_command(cs, ndcb0.cmd1);
        if !bytes.is_empty() {
            if let Some(chip) = self.chip_mut(cs) {
                chip.address(&bytes);
            }
        }
        if second && ndcb0.dbc {
            self.flash_command(cs, ndcb0.cmd2);
        }
    }

    fn flash_command(&mut self, cs: u8, cmd: u8) {
        if let Some(chip) = self.chip_mut(cs) {
            chip.command(cmd);
        }
    }

    fn fill(&mut self, cs: u8, len: usize, paged: bool) {
        let strength = self.ecc_strength();
        let Some(chip) = self.chip_mut(cs) else {
            self.fifo.extend(std::iter::repeat(0).take(len));
            self.status |= ndsr::RDDREQ;
            self.active = Some(Active { cs, stage: Stage::Reading { paged } });
            return;
        };
        let out = chip.read_data(len);

        let data = match strength {
            Some(_) if !out.from_array || out.flips == 0 => out.raw,
            Some(strength) => match out.programmed {
                Some(programmed) if out.flips <= strength => {
                    self.status |= ndsr::SBERR;
                    self.err_cnt = if strength > 1 { out.flips } else { 0 };
                    programmed
                }
                _ => {
                    self.status |= ndsr::DBERR;
                    out.raw
                }
            },
            None => out.raw,
        };
        if out.bad_block {
            self.status |= ndsr::bad_block(cs);
        }

        self.fifo.extend(data);
        self.status |= ndsr::RDDREQ;
        self.active = Some(Active {
            cs,
            stage: Stage::Reading { paged },
        });
    }

    fn complete(&mut self, cs: u8, ready: bool, paged: bool) {
        self.active = None;
        self.status |= ndsr::cmd_done(cs) | ndsr::WRCMDREQ;
        if ready {
            self.status |= ndsr::ready(cs);
        }
        if paged {
            self.status |= ndsr::page_done(cs);
        }
    }

    /// Advance the chips one step and move whatever was waiting on them
    fn tick(&mut self) {
        for chip in self.chips.iter_mut().flatten() {
            chip.tick();
        }

        let Some(active) = self.active.take() else { return };
        let cs = active.cs;
        if !self.chip_ready(cs) {
            self.active = Some(active);
            return;
        }

        match active.stage {
            Stage::Deferred(word) => self.run(cs, word),
            Stage::Busy(After::Complete { ready, paged }) => self.complete(cs, ready, paged),
            Stage::Busy(After::Fill { len, paged }) => {
                self.status |= ndsr::ready(cs);
                self.fill(cs, len, paged);
            }
            stage => self.active = Some(Active { cs, stage }),
        }
    }

    fn read_fifo(&mut self) -> u32 {
        let mut word = [0u8; 4];
        for byte in word.iter_mut() {
            *byte = self.fifo.pop_front().unwrap_or(0);
        }

        if self.fifo.is_empty() {
            self.status &= !ndsr::RDDREQ;
            if let Some(Active {
                cs,
                stage: Stage::Reading { paged },
            }) = self.active
            {
                self.complete(cs, false, paged);
            }
        }
        u32::from_le_bytes(word)
    }

    fn write_fifo(&mut self, value: u32) {
        let Some(Active {
            cs,
            stage: Stage::Writing { remaining, buf, commit },
        }) = &mut self.active
        else {
            warn!("data written with no write phase pending");
            return;
        };

        let take = (*remaining).min(4);
        buf.extend_from_slice(&value.to_le_bytes()[..take]);
        *remaining -= take;
        if *remaining > 0 {
            return;
        }

        let (cs, buf, commit) = (*cs, std::mem::take(buf), *commit);
        self.status &= !ndsr::WRDREQ;
        if let Some(chip) = self.chip_mut(cs) {
            chip.write_data(&buf);
        }
        match commit {
            Some(cmd) => {
                self.flash_command(cs, cmd);
                self.status |= ndsr::cmd_done(cs);
                self.active = Some(Active {
                    cs,
                    stage: Stage::Busy(After::Complete { ready: true, paged: true }),
                });
            }
            None => self.complete(cs, false, false),
        }
    }
}

impl RegisterBus for SimNfc {
    fn read32(&mut self, offset: u32) -> u32 {
        match offset {
            NDSR => {
                self.tick();
                self.status | ndsr::with_err_cnt(self.err_cnt)
            }
            NDDB => self.read_fifo(),
            NDCR => self.ndcr,
            _ => self.regs.get(&offset).copied().unwrap_or(0),
        }
    }

    fn write32(&mut self, offset: u32, value: u32) {
        match offset {
            NDCR => {
                let was_running = self.running();
                self.ndcr = value;
                if !self.running() {
                    self.restart();
                } else if !was_running {
                    self.restart();
                    self.status |= ndsr::WRCMDREQ;
                }
            }
            NDSR => {
                self.status &= !(value & ndsr::MASK);
                if value & ndsr::SBERR != 0 {
                    self.err_cnt = 0;
                }
            }
            NDCB0 => self.accept_word(value),
            NDDB => self.write_fifo(value),
            _ => {
                self.regs.insert(offset, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandSequencer, Opcode};
    use crate::geometry::{Geometry, FLASH_TYPES};

    fn nfc(id: u16, ext: u16) -> (SimNfc, Geometry) {
        let flash = FLASH_TYPES.iter().find(|f| f.chip_id == id && f.ext_id == ext).unwrap();
        let mut nfc = SimNfc::new();
        nfc.connect(0, SimFlash::new(*flash).unwrap());
        (nfc, Geometry::new(flash).unwrap())
    }

    fn start(nfc: &mut SimNfc, geo: &Geometry, ecc: bool) {
        nfc.write32(NDCR, 0);
        nfc.write32(NDECCCTRL, geo.ecc_ctrl());
        nfc.write32(NDSR, ndsr::MASK);
        let ecc = if ecc { ndcr::ECC_EN } else { 0 };
        nfc.write32(NDCR, geo.ndcr(false) | ndcr::ND_RUN | ecc);
    }

    fn issue(nfc: &mut SimNfc, words: Vec<u32>) {
        for word in words {
            nfc.write32(NDCB0, word);
        }
    }

    fn settle(nfc: &mut SimNfc) -> u32 {
        for _ in 0..32 {
            nfc.read32(NDSR);
        }
        nfc.read32(NDSR)
    }

    #[test]
    fn test_run_raises_command_request() {
        let (mut nfc, geo) = nfc(0xdaec, 0xffff);
        assert_eq!(nfc.read32(NDSR) & ndsr::WRCMDREQ, 0);
        start(&mut nfc, &geo, false);
        assert_ne!(nfc.read32(NDSR) & ndsr::WRCMDREQ, 0);
    }

    #[test]
    fn test_monolithic_program_then_read() {
        let (mut nfc, geo) = nfc(0xdaec, 0xffff);
        let sequencer = CommandSequencer::new(&geo, 0);

        start(&mut nfc, &geo, true);
        let program = sequencer.build(Opcode::Program, 0, 5).unwrap();
        issue(&mut nfc, program.words[0].port_words().unwrap());
        assert_ne!(nfc.read32(NDSR) & ndsr::WRDREQ, 0);
        for i in 0..geo.raw_page_len() / 4 {
            nfc.write32(NDDB, i as u32);
        }
        let status = settle(&mut nfc);
        assert_ne!(status & ndsr::FLASH_RDY, 0);
        assert_ne!(status & ndsr::CS0_PAGED, 0);

        start(&mut nfc, &geo, true);
        let read = sequencer.build(Opcode::Read, 0, 5).unwrap();
        issue(&mut nfc, read.words[0].port_words().unwrap());
        let status = settle(&mut nfc);
        assert_ne!(status & ndsr::RDDREQ, 0);
        assert_eq!(status & (ndsr::DBERR | ndsr::SBERR), 0);
        assert_eq!(nfc.read32(NDDB), 0);
        assert_eq!(nfc.read32(NDDB), 1);
    }

    #[test]
    fn test_ecc_verdicts() {
        let (mut nfc, geo) = nfc(0xdead, 0xda94);
        let sequencer = CommandSequencer::new(&geo, 0);
        nfc.chip_mut(0).unwrap().inject_flips(9, &[5]);
        let read = sequencer.build(Opcode::Read, 0, 9).unwrap();

        // Erased page with flips: uncorrectable. Dispatch, then the first chunk.
        start(&mut nfc, &geo, true);
        for word in &read.words[..2] {
            issue(&mut nfc, word.port_words().unwrap());
            settle(&mut nfc);
        }
        assert_ne!(nfc.read32(NDSR) & ndsr::DBERR, 0);

        // Without ECC nothing is reported
        start(&mut nfc, &geo, false);
        for word in &read.words[..2] {
            issue(&mut nfc, word.port_words().unwrap());
            settle(&mut nfc);
        }
        assert_eq!(nfc.read32(NDSR) & ndsr::DBERR, 0);
    }

    #[test]
    fn test_words_ignored_when_stopped() {
        let (mut nfc, geo) = nfc(0xdaec, 0xffff);
        let id = CommandSequencer::new(&geo, 0).build(Opcode::ReadId, 0, 0).unwrap();
        issue(&mut nfc, id.words[0].port_words().unwrap());
        assert_eq!(nfc.read32(NDSR), 0);
        assert!(nfc.chip(0).unwrap().commands().is_empty());
    }
}
