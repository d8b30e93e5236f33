//! The seams between the driver and the silicon: controller registers, the DMA sequencer hub, and
//! bus-visible memory.
//!
//! Everything above this module is written against these traits, so the same code runs against
//! real hardware and against [`crate::sim::SimHardware`].

/// 32-bit access to the NAND controller's register window.
///
/// Reads take `&mut self` because reading status and FIFO registers has side effects.
pub trait RegisterBus {
    fn read32(&mut self, offset: u32) -> u32;
    fn write32(&mut self, offset: u32, value: u32);
}

/// The four DMA channels used by the controller
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    ReadData,
    WriteData,
    Descriptor,
    DeviceControl,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::ReadData,
        Channel::WriteData,
        Channel::Descriptor,
        Channel::DeviceControl,
    ];
}

/// Static configuration of one DMA channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Minimum transfer unit, in bytes
    pub mtu: usize,
    /// Command FIFO depth
    pub fifo_depth: u32,
    /// Completion semaphore, or 0 for none
    pub semaphore: u8,
}

/// The DMA sequencer hub that executes descriptor streams
pub trait DmaHub {
    fn configure_channel(&mut self, channel: Channel, config: ChannelConfig) -> anyhow::Result<()>;
    fn configure_semaphore(&mut self, id: u8, depth: u8) -> anyhow::Result<()>;

    /// Queue a descriptor stream (bus address + length) on a channel
    fn push_command(&mut self, channel: Channel, addr: u32, len: usize) -> anyhow::Result<()>;

    fn channel_busy(&mut self, channel: Channel) -> bool;
    fn semaphore_full(&mut self, id: u8) -> bool;
    fn semaphore_pop(&mut self, id: u8);
    fn semaphore_clear(&mut self, id: u8);
}

/// A span of memory the DMA hub can address
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaRegion {
    pub addr: u32,
    pub len: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
}

/// Bus memory management
pub trait DmaMemory {
    /// Allocate a long-lived, cache-coherent region
    fn alloc_coherent(&mut self, len: usize) -> anyhow::Result<DmaRegion>;

    /// Map a transient buffer for one transfer. `None` means the mapping failed and the caller
    /// should fall back to a coherent bounce buffer.
    fn map_streaming(&mut self, len: usize, dir: DmaDirection) -> Option<DmaRegion>;
    fn unmap_streaming(&mut self, region: DmaRegion);

    fn write_bus(&mut self, addr: u32, data: &[u8]) -> anyhow::Result<()>;
    fn read_bus(&mut self, addr: u32, out: &mut [u8]) -> anyhow::Result<()>;
}

/// Everything the controller needs from the platform
pub trait Hardware: RegisterBus + DmaHub + DmaMemory {}

impl<T: RegisterBus + DmaHub + DmaMemory> Hardware for T {}
