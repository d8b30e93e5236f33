//! A software model of the controller, its DMA hub and the flash chips behind it.
//!
//! [`SimHardware`] implements every hardware seam, so the whole driver (DMA streams included) can
//! run without silicon. Faults can be injected at each layer: bit flips and failing program/erase
//! on the chips, stalls in the hub, and failing mappings in bus memory.

use crate::dma::Record;
use crate::error::Result;
use crate::geometry::FlashType;
use crate::hw::{Channel, ChannelConfig, DmaDirection, DmaHub, DmaMemory, DmaRegion, RegisterBus};

pub mod flash;
pub mod hub;
pub mod memory;
pub mod nfc;

pub use flash::SimFlash;
pub use hub::SimHub;
pub use memory::SimMemory;
pub use nfc::SimNfc;

#[derive(Debug, Default)]
pub struct SimHardware {
    nfc: SimNfc,
    hub: SimHub,
    memory: SimMemory,
}

impl SimHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller with one chip of type `flash` on chip select 0
    pub fn with_chip(flash: FlashType) -> Result<Self> {
        let mut hw = Self::new();
        hw.connect(0, flash)?;
        Ok(hw)
    }

    pub fn connect(&mut self, cs: u8, flash: FlashType) -> Result<()> {
        self.nfc.connect(cs, SimFlash::new(flash)?);
        Ok(())
    }

    pub fn chip(&self, cs: u8) -> Option<&SimFlash> {
        self.nfc.chip(cs)
    }

    pub fn chip_mut(&mut self, cs: u8) -> Option<&mut SimFlash> {
        self.nfc.chip_mut(cs)
    }

    pub fn nfc(&self) -> &SimNfc {
        &self.nfc
    }

    pub fn memory_mut(&mut self) -> &mut SimMemory {
        &mut self.memory
    }

    pub fn stall_hub(&mut self, stalled: bool) {
        self.hub.stall(stalled);
    }

    /// Descriptor streams submitted so far
    pub fn streams_submitted(&self) -> usize {
        self.hub.submitted()
    }

    pub fn last_stream(&self) -> &[Record] {
        self.hub.last_stream()
    }
}

impl RegisterBus for SimHardware {
    fn read32(&mut self, offset: u32) -> u32 {
        self.nfc.read32(offset)
    }

    fn write32(&mut self, offset: u32, value: u32) {
        self.nfc.write32(offset, value)
    }
}

impl DmaHub for SimHardware {
    fn configure_channel(&mut self, channel: Channel, config: ChannelConfig) -> anyhow::Result<()> {
        self.hub.configure_channel(channel, config)
    }

    fn configure_semaphore(&mut self, id: u8, depth: u8) -> anyhow::Result<()> {
        self.hub.configure_semaphore(id, depth)
    }

    fn push_command(&mut self, channel: Channel, addr: u32, len: usize) -> anyhow::Result<()> {
        self.hub.push(&self.memory, channel, addr, len)
    }

    fn channel_busy(&mut self, channel: Channel) -> bool {
        self.hub.busy(channel, &mut self.nfc, &mut self.memory)
    }

    fn semaphore_full(&mut self, id: u8) -> bool {
        self.hub.full(id, &mut self.nfc, &mut self.memory)
    }

    fn semaphore_pop(&mut self, id: u8) {
        self.hub.pop(id)
    }

    fn semaphore_clear(&mut self, id: u8) {
        self.hub.pop(id)
    }
}

impl DmaMemory for SimHardware {
    fn alloc_coherent(&mut self, len: usize) -> anyhow::Result<DmaRegion> {
        self.memory.alloc_coherent(len)
    }

    fn map_streaming(&mut self, len: usize, dir: DmaDirection) -> Option<DmaRegion> {
        self.memory.map(len, dir)
    }

    fn unmap_streaming(&mut self, region: DmaRegion) {
        self.memory.unmap(region)
    }

    fn write_bus(&mut self, addr: u32, data: &[u8]) -> anyhow::Result<()> {
        self.memory.write(addr, data)
    }

    fn read_bus(&mut self, addr: u32, out: &mut [u8]) -> anyhow::Result<()> {
        self.memory.read(addr, out)
    }
}
