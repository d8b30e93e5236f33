//! Driver for the NAND flash controller found on Marvell-style SoCs: command sequencing, PIO and
//! descriptor-driven DMA transfers, ECC reporting, read-retry and pseudo-SLC operation, plus a
//! software model of the hardware to run it all against.

pub mod blank;
pub mod command;
pub mod controller;
pub mod dma;
pub mod error;
pub mod geometry;
pub mod hw;
pub mod nand;
pub mod partition;
pub mod pio;
pub mod regs;
pub mod retry;
pub mod sim;
pub mod slc;
pub mod util;

pub use controller::{ControllerConfig, NandController, ReadOutcome, Target};
pub use error::{NfcError, Result};
pub use geometry::{FlashType, Geometry};
pub use partition::PartitionView;
