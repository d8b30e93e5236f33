//! DMA channel setup and synchronous stream submission.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, error};

use crate::dma::sem;
use crate::error::Result;
use crate::hw::{Channel, ChannelConfig, DmaHub, DmaRegion, Hardware};
use crate::regs::dump_registers;
use crate::util::{wait_until, Deadline};

/// Minimum transfer unit of the data channels
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Mtu {
    B8,
    #[default]
    B32,
    B128,
}

impl Mtu {
    pub fn bytes(self) -> usize {
        match self {
            Mtu::B8 => 8,
            Mtu::B32 => 32,
            Mtu::B128 => 128,
        }
    }
}

impl FromStr for Mtu {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "8" => Mtu::B8,
            "32" => Mtu::B32,
            "128" => Mtu::B128,
            _ => anyhow::bail!("transfer unit must be 8, 32 or 128 bytes"),
        })
    }
}

impl fmt::Display for Mtu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bytes())
    }
}

/// Owns the channel layout and the submit/complete handshake with the hub
#[derive(Debug, Copy, Clone)]
pub struct ChannelSynchronizer {
    mtu: Mtu,
    timeout: Duration,
}

impl ChannelSynchronizer {
    pub fn new(mtu: Mtu, timeout: Duration) -> Self {
        Self { mtu, timeout }
    }

    pub fn mtu(&self) -> Mtu {
        self.mtu
    }

    pub fn channel_config(&self, channel: Channel) -> ChannelConfig {
        let (fifo_depth, semaphore) = match channel {
            Channel::ReadData => (32, sem::READ_DATA),
            Channel::WriteData => (32, sem::WRITE_DATA),
            Channel::Descriptor => (16, sem::NONE),
            Channel::DeviceControl => (8, sem::COMPLETE),
        };
        ChannelConfig {
            mtu: self.mtu.bytes(),
            fifo_depth,
            semaphore,
        }
    }

    pub fn init<H: DmaHub + ?Sized>(&self, hub: &mut H) -> Result<()> {
        for channel in Channel::ALL {
            hub.configure_channel(channel, self.channel_config(channel))?;
        }
        for id in [sem::READ_DATA, sem::WRITE_DATA, sem::COMPLETE] {
            hub.configure_semaphore(id, 1)?;
        }
        Ok(())
    }

    /// Run one stream on the device-control channel and block until it signals completion.
    ///
    /// On timeout the controller registers are dumped and the error is returned as is; nothing is
    /// retried here.
    pub fn submit<H: Hardware + ?Sized>(&self, hw: &mut H, stream: DmaRegion) -> Result<()> {
        let deadline = Deadline::after(self.timeout);

        let result = wait_until(&deadline, "device-control channel to drain", || {
            !hw.channel_busy(Channel::DeviceControl)
        })
        .and_then(|_| {
            debug!("submitting {} descriptor bytes at {:#010x}", stream.len, stream.addr);
            hw.push_command(Channel::DeviceControl, stream.addr, stream.len)?;

            wait_until(&deadline, "descriptor stream completion", || {
                !hw.channel_busy(Channel::DeviceControl) && hw.semaphore_full(sem::COMPLETE)
            })
        });

        if let Err(err) = result {
            error!("DMA stream at {:#010x} did not complete: {err}", stream.addr);
            dump_registers(hw);
            return Err(err);
        }

        hw.semaphore_pop(sem::COMPLETE);
        hw.semaphore_clear(sem::COMPLETE);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{DmaDirection, DmaMemory, RegisterBus};
    use std::collections::HashMap;

    /// A hub that finishes every stream after a fixed number of polls (or never)
    #[derive(Default)]
    struct CountdownHub {
        configured: HashMap<Channel, ChannelConfig>,
        depths: HashMap<u8, u8>,
        polls_left: Option<u32>,
        complete: bool,
        pops: u32,
        finish_after: Option<u32>,
        register_reads: u32,
    }

    impl DmaHub for CountdownHub {
        fn configure_channel(&mut self, channel: Channel, config: ChannelConfig) -> anyhow::Result<()> {
            self.configured.insert(channel, config);
            Ok(())
        }
        fn configure_semaphore(&mut self, id: u8, depth: u8) -> anyhow::Result<()> {
            self.depths.insert(id, depth);
            Ok(())
        }
        fn push_command(&mut self, _: Channel, _: u32, _: usize) -> anyhow::Result<()> {
            self.polls_left = self.finish_after;
            Ok(())
        }
        fn channel_busy(&mut self, _: Channel) -> bool {
            match &mut self.polls_left {
                Some(0) => {
                    self.complete = true;
                    false
                }
                Some(n) => {
                    *n -= 1;
                    true
                }
                None => false,
            }
        }
        fn semaphore_full(&mut self, _: u8) -> bool {
            self.complete
        }
        fn semaphore_pop(&mut self, _: u8) {
            self.pops += 1;
        }
        fn semaphore_clear(&mut self, _: u8) {
            self.complete = false;
        }
    }

    impl RegisterBus for CountdownHub {
        fn read32(&mut self, _: u32) -> u32 {
            self.register_reads += 1;
            0
        }
        fn write32(&mut self, _: u32, _: u32) {}
    }

    impl DmaMemory for CountdownHub {
        fn alloc_coherent(&mut self, len: usize) -> anyhow::Result<DmaRegion> {
            Ok(DmaRegion { addr: 0, len })
        }
        fn map_streaming(&mut self, _: usize, _: DmaDirection) -> Option<DmaRegion> {
            None
        }
        fn unmap_streaming(&mut self, _: DmaRegion) {}
        fn write_bus(&mut self, _: u32, _: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        fn read_bus(&mut self, _: u32, _: &mut [u8]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    const STREAM: DmaRegion = DmaRegion { addr: 0x1000, len: 64 };

    #[test]
    fn test_init_configures_every_channel() {
        let sync = ChannelSynchronizer::new(Mtu::B128, Duration::from_millis(10));
        let mut hub = CountdownHub::default();
        sync.init(&mut hub).unwrap();

        assert_eq!(hub.configured.len(), 4);
        assert!(hub.configured.values().all(|c| c.mtu == 128));
        assert_eq!(hub.configured[&Channel::DeviceControl].semaphore, sem::COMPLETE);
        assert!(hub.depths.values().all(|&d| d == 1));
    }

    #[test]
    fn test_submit_waits_for_completion() {
        let sync = ChannelSynchronizer::new(Mtu::B32, Duration::from_secs(1));
        let mut hub = CountdownHub {
            finish_after: Some(20),
            ..Default::default()
        };
        sync.submit(&mut hub, STREAM).unwrap();
        assert_eq!(hub.pops, 1);
        assert!(!hub.complete);
        assert_eq!(hub.register_reads, 0);
    }

    #[test]
    fn test_submit_timeout_dumps_registers() {
        let sync = ChannelSynchronizer::new(Mtu::B32, Duration::from_millis(5));
        let mut hub = CountdownHub {
            finish_after: Some(u32::MAX),
            ..Default::default()
        };
        assert!(sync.submit(&mut hub, STREAM).unwrap_err().is_timeout());
        assert_eq!(hub.pops, 0);
        assert!(hub.register_reads > 0);
    }

    #[test]
    fn test_mtu_parse() {
        assert_eq!("128".parse::<Mtu>().unwrap(), Mtu::B128);
        assert!("64".parse::<Mtu>().is_err());
        assert_eq!(Mtu::default().to_string(), "32");
    }
}
