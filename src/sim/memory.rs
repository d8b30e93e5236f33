//! Bus-visible memory for the simulator: a bump allocator over one growable byte array.

use anyhow::{bail, ensure};
use log::debug;

use crate::hw::{DmaDirection, DmaRegion};

/// Bus address of the first allocated byte
pub const BUS_BASE: u32 = 0x4000_0000;
const ALIGN: usize = 64;

#[derive(Debug, Default)]
pub struct SimMemory {
    bytes: Vec<u8>,
    streaming: Vec<DmaRegion>,
    failing_maps: u32,
    coherent_exhausted: bool,
}

impl SimMemory {
    pub fn alloc(&mut self, len: usize) -> anyhow::Result<DmaRegion> {
        let offset = self.bytes.len();
        self.bytes.resize(offset + len.next_multiple_of(ALIGN).max(ALIGN), 0);
        Ok(DmaRegion {
            addr: BUS_BASE + offset as u32,
            len,
        })
    }

    /// Bytes handed out so far, streaming mappings included
    pub fn allocated(&self) -> usize {
        self.bytes.len()
    }

    pub fn alloc_coherent(&mut self, len: usize) -> anyhow::Result<DmaRegion> {
        if self.coherent_exhausted {
            bail!("coherent pool exhausted ({len} bytes requested)");
        }
        self.alloc(len)
    }

    pub fn map(&mut self, len: usize, dir: DmaDirection) -> Option<DmaRegion> {
        if self.failing_maps > 0 {
            self.failing_maps -= 1;
            debug!("refusing {dir:?} mapping of {len} bytes");
            return None;
        }
        let region = self.alloc(len).ok()?;
        self.streaming.push(region);
        Some(region)
    }

    /// Mappings are released in reverse order; the space of the most recent one is reclaimed.
    pub fn unmap(&mut self, region: DmaRegion) {
        let Some(index) = self.streaming.iter().rposition(|r| *r == region) else {
            return;
        };
        self.streaming.remove(index);
        if index == self.streaming.len() {
            self.bytes.truncate((region.addr - BUS_BASE) as usize);
        }
    }

    pub fn fail_next_maps(&mut self, count: u32) {
        self.failing_maps = count;
    }

    pub fn exhaust_coherent(&mut self, exhausted: bool) {
        self.coherent_exhausted = exhausted;
    }

    /// Streaming mappings still live
    pub fn mapped(&self) -> usize {
        self.streaming.len()
    }

    fn span(&self, addr: u32, len: usize) -> anyhow::Result<std::ops::Range<usize>> {
        ensure!(addr >= BUS_BASE, "bus address {addr:#010x} below memory");
        let start = (addr - BUS_BASE) as usize;
        ensure!(
            start + len <= self.bytes.len(),
            "bus access {addr:#010x}+{len} beyond {} allocated bytes",
            self.bytes.len()
        );
        Ok(start..start + len)
    }

    pub fn read(&self, addr: u32, out: &mut [u8]) -> anyhow::Result<()> {
        let span = self.span(addr, out.len())?;
        out.copy_from_slice(&self.bytes[span]);
        Ok(())
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> anyhow::Result<()> {
        let span = self.span(addr, data.len())?;
        self.bytes[span].copy_from_slice(data);
        Ok(())
    }
}

#[test]
fn test_streaming_space_reclaimed() {
    let mut memory = SimMemory::default();
    let coherent = memory.alloc_coherent(100).unwrap();
    assert_eq!(coherent.addr, BUS_BASE);

    let mapped = memory.map(4096, DmaDirection::FromDevice).unwrap();
    assert_eq!(mapped.addr, BUS_BASE + 128);
    memory.write(mapped.addr + 4000, &[1, 2, 3]).unwrap();
    memory.unmap(mapped);
    assert_eq!(memory.mapped(), 0);
    assert!(memory.read(mapped.addr, &mut [0; 4]).is_err());

    memory.fail_next_maps(1);
    assert!(memory.map(16, DmaDirection::ToDevice).is_none());
    assert!(memory.map(16, DmaDirection::ToDevice).is_some());

    memory.exhaust_coherent(true);
    assert!(memory.alloc_coherent(16).is_err());
}
