//! Status-register driven command execution, used when DMA is off or not applicable.

use log::trace;

use crate::command::{CommandSequence, CommandWord};
use crate::error::Result;
use crate::hw::RegisterBus;
use crate::regs::{ndsr, NDCB0, NDDB, NDSR};
use crate::util::{wait_for, Deadline};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PioState {
    Idle,
    Prepared,
    CommandHandle,
    PioReading,
    PioWriting,
    CommandDone,
    Ready,
}

/// Data moved by the data phases of one sequence, in order
#[derive(Debug)]
pub enum PioData<'a> {
    None,
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// What the status register reported while a sequence ran
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PioOutcome {
    pub uncorrectable: bool,
    pub corrected_bits: u32,
    pub bad_block_events: u32,
}

const EVENTS: u32 = ndsr::MASK;

pub struct PioStateMachine<'a, B: RegisterBus + ?Sized> {
    bus: &'a mut B,
    seq: &'a CommandSequence,
    cs: u8,
    bch: bool,
    state: PioState,
    issued: usize,
    cursor: usize,
}

impl<'a, B: RegisterBus + ?Sized> PioStateMachine<'a, B> {
    /// `bch` selects how corrected bits are counted: BCH reports a count, Hamming only a flag
    pub fn new(bus: &'a mut B, seq: &'a CommandSequence, cs: u8, bch: bool) -> Self {
        Self {
            bus,
            seq,
            cs,
            bch,
            state: PioState::Idle,
            issued: 0,
            cursor: 0,
        }
    }

    /// Issue the sequence and service the controller until it completes. The controller must
    /// already be running.
    pub fn run(mut self, mut data: PioData<'_>, deadline: &Deadline) -> Result<PioOutcome> {
        let mut outcome = PioOutcome::default();
        let total = self.seq.total();
        let wait_ready = self.seq.wait_ready;
        self.state = PioState::Prepared;

        loop {
            let bus = &mut *self.bus;
            let raw = wait_for(deadline, "NAND controller status", || {
                Some(bus.read32(NDSR)).filter(|s| s & EVENTS != 0)
            })?;
            let status = raw & EVENTS;

            // A command request that arrives while we still hold for the ready line stays pending
            let held = wait_ready == Some(self.issued)
                && self.state != PioState::Ready
                && status & ndsr::ready(self.cs) == 0;
            let ack = if held { status & !ndsr::WRCMDREQ } else { status };

            // Acknowledge first, so events raised by what we issue below are not lost
            self.bus.write32(NDSR, ack);
            trace!("NDSR {raw:#07x} in {:?} after {} of {total}", self.state, self.issued);

            if status & ndsr::DBERR != 0 {
                outcome.uncorrectable = true;
            }
            if status & ndsr::SBERR != 0 {
                outcome.corrected_bits += if self.bch { ndsr::err_cnt(raw).max(1) } else { 1 };
            }
            if status & ndsr::bad_block(self.cs) != 0 {
                outcome.bad_block_events += 1;
            }

            if status & ndsr::RDDREQ != 0 {
                self.state = PioState::PioReading;
                self.read_fifo(&mut data);
            } else if status & ndsr::WRDREQ != 0 {
                self.state = PioState::PioWriting;
                self.write_fifo(&data);
            }

            if status & ndsr::ready(self.cs) != 0 {
                self.state = PioState::Ready;
                if wait_ready == Some(self.issued) && self.issued == total {
                    break;
                }
            }

            // The ready line is what guarantees the data is retained; command-done alone is not
            if held {
                continue;
            }

            if status & ndsr::cmd_done(self.cs) != 0 {
                self.state = PioState::CommandDone;
                if self.issued == total && wait_ready != Some(self.issued) {
                    break;
                }
            }

            if status & ndsr::WRCMDREQ != 0 {
                match self.seq.words.get(self.issued) {
                    Some(word) => {
                        self.issue(word)?;
                        self.issued += 1;
                        self.state = PioState::CommandHandle;
                    }
                    None => break,
                }
            }
        }

        self.state = PioState::Idle;
        Ok(outcome)
    }

    fn issue(&mut self, word: &CommandWord) -> Result<()> {
        for value in word.port_words()? {
            self.bus.write32(NDCB0, value);
        }
        Ok(())
    }

    fn current_len(&self) -> usize {
        self.issued
            .checked_sub(1)
            .and_then(|i| self.seq.words.get(i))
            .map_or(0, |w| w.data_len)
    }

    fn read_fifo(&mut self, data: &mut PioData<'_>) {
        let len = self.current_len();
        let start = self.cursor;
        self.cursor += len;

        for offset in (0..len).step_by(4) {
            let word = self.bus.read32(NDDB).to_le_bytes();
            if let PioData::Read(buf) = data {
                let end = (start + offset + 4).min(start + len).min(buf.len());
                let begin = (start + offset).min(end);
                buf[begin..end].copy_from_slice(&word[..end - begin]);
            }
        }
    }

    fn write_fifo(&mut self, data: &PioData<'_>) {
        let len = self.current_len();
        let start = self.cursor;
        self.cursor += len;

        for offset in (0..len).step_by(4) {
            let mut word = [0xffu8; 4];
            if let PioData::Write(buf) = data {
                let end = (start + offset + 4).min(start + len).min(buf.len());
                let begin = (start + offset).min(end);
                word[..end - begin].copy_from_slice(&buf[begin..end]);
            }
            self.bus.write32(NDDB, u32::from_le_bytes(word));
        }
    }
}
