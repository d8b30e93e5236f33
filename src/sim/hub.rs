//! Model of the DMA sequencer hub: interprets descriptor streams against [`SimNfc`] and
//! [`SimMemory`].
//!
//! The hub runs lazily. Every status query advances the current stream as far as it can go
//! before some semaphore blocks it.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{bail, ensure};
use log::{trace, warn};

use crate::dma::{decode_stream, sem, Record};
use crate::hw::{Channel, ChannelConfig, RegisterBus};
use crate::regs::{ndsr, NDSR};
use crate::sim::memory::SimMemory;
use crate::sim::nfc::SimNfc;

#[derive(Debug, Default)]
pub struct SimHub {
    channels: HashMap<Channel, ChannelConfig>,
    depths: HashMap<u8, u8>,
    posted: HashSet<u8>,
    stream: VecDeque<Record>,
    holding: Vec<u8>,
    drain: Option<(u32, u8)>,
    stalled: bool,
    submitted: usize,
    last: Vec<Record>,
}

impl SimHub {
    pub fn configure_channel(&mut self, channel: Channel, config: ChannelConfig) -> anyhow::Result<()> {
        ensure!(matches!(config.mtu, 8 | 32 | 128), "bad transfer unit {}", config.mtu);
        self.channels.insert(channel, config);
        Ok(())
    }

    pub fn configure_semaphore(&mut self, id: u8, depth: u8) -> anyhow::Result<()> {
        ensure!(depth == 1, "only binary semaphores are modelled");
        self.depths.insert(id, depth);
        Ok(())
    }

    pub fn push(&mut self, memory: &SimMemory, channel: Channel, addr: u32, len: usize) -> anyhow::Result<()> {
        ensure!(channel == Channel::DeviceControl, "streams only run on the device-control channel");
        ensure!(self.channels.contains_key(&channel), "{channel:?} channel is not configured");
        if !self.stream.is_empty() {
            bail!("device-control channel already holds a stream");
        }

        let mut bytes = vec![0; len];
        memory.read(addr, &mut bytes)?;
        let records = decode_stream(&bytes)?;
        trace!("hub accepts {} records", records.len());

        self.submitted += 1;
        self.last = records.clone();
        self.stream = records.into();
        self.drain = None;
        Ok(())
    }

    /// Freeze the hub: nothing runs and the device-control channel stays busy
    pub fn stall(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// The records of the most recently submitted stream
    pub fn last_stream(&self) -> &[Record] {
        &self.last
    }

    pub fn busy(&mut self, channel: Channel, nfc: &mut SimNfc, memory: &mut SimMemory) -> bool {
        self.step(nfc, memory);
        channel == Channel::DeviceControl && (self.stalled || !self.stream.is_empty())
    }

    pub fn full(&mut self, id: u8, nfc: &mut SimNfc, memory: &mut SimMemory) -> bool {
        self.step(nfc, memory);
        self.posted.contains(&id)
    }

    pub fn pop(&mut self, id: u8) {
        self.posted.remove(&id);
    }

    fn post(&mut self, id: u8) {
        if id != sem::NONE {
            self.posted.insert(id);
        }
    }

    fn step(&mut self, nfc: &mut SimNfc, memory: &mut SimMemory) {
        if self.stalled {
            return;
        }
        while let Some(&record) = self.stream.front() {
            match self.exec(record, nfc, memory) {
                Ok(true) => {
                    self.stream.pop_front();
                }
                Ok(false) => break,
                Err(err) => {
                    warn!("hub aborts stream at {record:?}: {err}");
                    self.stream.clear();
                    break;
                }
            }
        }
    }

    /// Run one record; `false` if it is blocked
    fn exec(&mut self, record: Record, nfc: &mut SimNfc, memory: &mut SimMemory) -> anyhow::Result<bool> {
        match record {
            Record::Cfgw { reg, value } => nfc.write32(reg, value),
            Record::Sema { check, update } => {
                let ready = match check {
                    sem::NONE => true,
                    sem::CMD => {
                        let pending = nfc.read32(NDSR) & ndsr::WRCMDREQ != 0;
                        if pending {
                            nfc.write32(NDSR, ndsr::WRCMDREQ);
                        }
                        pending
                    }
                    sem::DATA => nfc.read32(NDSR) & (ndsr::RDDREQ | ndsr::WRDREQ) != 0,
                    id => self.posted.remove(&id),
                };
                if !ready {
                    return Ok(false);
                }
                self.post(update);
            }
            Record::Rcmd { sem, size, ddr } => {
                self.holding = vec![0; size as usize];
                memory.read(ddr, &mut self.holding)?;
                self.post(sem);
            }
            Record::Rdat { size, dev, .. } => {
                for word in self.holding[..(size as usize).min(self.holding.len())].chunks(4) {
                    let mut bytes = [0xFFu8; 4];
                    bytes[..word.len()].copy_from_slice(word);
                    nfc.write32(dev, u32::from_le_bytes(bytes));
                }
            }
            Record::Wcmd { sem, ddr, .. } => self.drain = Some((ddr, sem)),
            Record::Wdat { size, dev, .. } => {
                let size = size as usize;
                let mut bytes = Vec::with_capacity(size + 3);
                while bytes.len() < size {
                    bytes.extend(nfc.read32(dev).to_le_bytes());
                }
                bytes.truncate(size);

                let Some((ddr, sem)) = self.drain.take() else {
                    bail!("write data with no write command armed");
                };
                memory.write(ddr, &bytes)?;
                self.post(sem);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DescriptorBuffer;
    use crate::regs::NDECCCTRL;

    fn configured() -> SimHub {
        let mut hub = SimHub::default();
        let config = ChannelConfig { mtu: 32, fifo_depth: 8, semaphore: sem::COMPLETE };
        hub.configure_channel(Channel::DeviceControl, config).unwrap();
        hub
    }

    fn load(memory: &mut SimMemory, records: &[Record]) -> (u32, usize) {
        let mut buf = DescriptorBuffer::new();
        for &record in records {
            buf.push(record).unwrap();
        }
        let region = memory.alloc(buf.len()).unwrap();
        memory.write(region.addr, buf.as_bytes()).unwrap();
        (region.addr, buf.len())
    }

    #[test]
    fn test_stream_runs_to_completion() {
        let mut hub = configured();
        let mut nfc = SimNfc::new();
        let mut memory = SimMemory::default();

        let slot = memory.alloc(8).unwrap();
        let (addr, len) = load(
            &mut memory,
            &[
                Record::cfgw(NDECCCTRL, 0x1234),
                Record::Wcmd { sem: sem::COMPLETE, size: 4, ddr: slot.addr },
                Record::Wdat { last: true, size: 4, dev: NDECCCTRL },
            ],
        );
        hub.push(&memory, Channel::DeviceControl, addr, len).unwrap();

        assert!(!hub.busy(Channel::DeviceControl, &mut nfc, &mut memory));
        assert!(hub.full(sem::COMPLETE, &mut nfc, &mut memory));
        let mut out = [0u8; 4];
        memory.read(slot.addr, &mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 0x1234);
        assert_eq!(hub.submitted(), 1);
    }

    #[test]
    fn test_command_semaphore_blocks_until_requested() {
        let mut hub = configured();
        let mut nfc = SimNfc::new();
        let mut memory = SimMemory::default();

        let (addr, len) = load(&mut memory, &[Record::sema(sem::CMD, sem::COMPLETE)]);
        hub.push(&memory, Channel::DeviceControl, addr, len).unwrap();
        assert!(hub.busy(Channel::DeviceControl, &mut nfc, &mut memory));
        assert!(hub.push(&memory, Channel::DeviceControl, addr, len).is_err());

        // Starting the controller raises the command request the stream waits on
        nfc.write32(crate::regs::NDCR, crate::regs::ndcr::ND_RUN);
        assert!(!hub.busy(Channel::DeviceControl, &mut nfc, &mut memory));
        assert!(hub.full(sem::COMPLETE, &mut nfc, &mut memory));
        assert_eq!(nfc.read32(NDSR) & ndsr::WRCMDREQ, 0);
    }

    #[test]
    fn test_unconfigured_channel_rejected() {
        let mut hub = SimHub::default();
        let memory = SimMemory::default();
        assert!(hub.push(&memory, Channel::DeviceControl, 0, 0).is_err());
    }
}
