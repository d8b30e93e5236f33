//! Pseudo-SLC operation of MLC chips: which physical page a logical page lives on, and the mode
//! registers that switch the chip into single-bit programming around an operation.

use std::thread;
use std::time::Duration;

use log::debug;

use crate::command::{Opcode, VendorSequence};
use crate::error::{NfcError, Result};
use crate::retry::VendorExec;

/// Logical-to-physical page pairing within one block (for 256-page blocks).
///
/// Only LSB pages carry pseudo-SLC data. The first four logical pages map straight through; after
/// that each logical pair lands on two neighbouring LSB pages and the following pair skips the two
/// MSB pages in between (4, 5 → 6, 7; 6, 7 → 10, 11). Pairs are thus never physically adjacent to
/// each other, while the two pages inside one pair are.
pub static PAIRING: [u16; 128] = pairing_table();

const fn pairing_table() -> [u16; 128] {
    let mut table = [0u16; 128];
    let mut i = 0;
    while i < 128 {
        table[i] = if i < 4 {
            i as u16
        } else {
            (6 + 4 * ((i - 4) / 2) + i % 2) as u16
        };
        i += 1;
    }
    table
}

/// Physical page within a block to logical page, for pages that hold pseudo-SLC data
pub fn unpair(physical: u32) -> Option<u32> {
    PAIRING.iter().position(|&p| p as u32 == physical).map(|l| l as u32)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlcPolicy {
    /// Paired pages, full reliability
    Eslc,
    /// The first half of every block
    Slc,
}

impl SlcPolicy {
    pub fn check(self, pages_per_block: u32) -> Result<()> {
        match self {
            SlcPolicy::Eslc if pages_per_block as usize != 2 * PAIRING.len() => Err(NfcError::UnsupportedConfig(
                format!("paired pseudo-SLC needs {} pages per block", 2 * PAIRING.len()),
            )),
            _ => Ok(()),
        }
    }

    /// Logical pages per block
    pub fn pages_per_block(self, physical: u32) -> u32 {
        physical / 2
    }

    /// Physical page for logical page `page` of a pseudo-SLC region, or `None` past the 32-bit
    /// page space
    pub fn translate(self, page: u32, pages_per_block: u32) -> Option<u32> {
        let logical = self.pages_per_block(pages_per_block);
        let (block, offset) = (page / logical, page % logical);
        let offset = match self {
            SlcPolicy::Eslc => PAIRING[offset as usize] as u32,
            SlcPolicy::Slc => offset,
        };
        block.checked_mul(pages_per_block)?.checked_add(offset)
    }

    /// Does `op` have to run with the chip switched into pseudo-SLC mode?
    pub fn brackets(self, op: Opcode) -> bool {
        match self {
            SlcPolicy::Eslc => matches!(op, Opcode::Program | Opcode::Erase),
            SlcPolicy::Slc => matches!(op, Opcode::Program | Opcode::Erase | Opcode::Read | Opcode::RandomReadout),
        }
    }
}

/// Mode registers and what pseudo-SLC mode adds to each of them
const MODE_REGISTERS: [(u8, u8); 8] = [
    (0xB0, 0x0A),
    (0xB1, 0x0A),
    (0xB2, 0x0A),
    (0xB3, 0x0A),
    (0xB4, 0x0F),
    (0xB5, 0x0F),
    (0xB6, 0x0F),
    (0xB7, 0x0F),
];

/// The chip's own mode register values, read once at attach
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlcModeRegisters {
    baseline: [u8; 8],
}

impl SlcModeRegisters {
    pub fn read<P: VendorExec + ?Sized>(port: &mut P) -> Result<Self> {
        let mut baseline = [0u8; 8];
        for (value, (reg, _)) in baseline.iter_mut().zip(MODE_REGISTERS) {
            let seq = VendorSequence::new().cmd(0x37).addr(&[reg]).read(1);
            *value = port.exec(&seq)?.first().copied().unwrap_or(0);
        }
        debug!("pseudo-SLC baseline {baseline:02x?}");
        Ok(Self { baseline })
    }

    pub fn baseline(&self) -> [u8; 8] {
        self.baseline
    }

    fn write(values: impl Iterator<Item = (u8, u8)>) -> VendorSequence {
        values
            .fold(VendorSequence::new().cmd(0x36), |seq, (reg, value)| seq.addr(&[reg]).write(&[value]))
            .cmd(0x16)
    }

    pub fn enable_sequence(&self) -> VendorSequence {
        Self::write(
            MODE_REGISTERS
                .iter()
                .zip(self.baseline)
                .map(|(&(reg, offset), base)| (reg, base.wrapping_add(offset))),
        )
    }

    pub fn disable_sequence(&self) -> VendorSequence {
        Self::write(MODE_REGISTERS.iter().zip(self.baseline).map(|(&(reg, _), base)| (reg, base)))
    }
}

/// Run `op` with the chip in pseudo-SLC mode. The mode is always switched back, even when `op`
/// or the switch itself fails; the first error wins.
pub fn with_reliability_mode<P, T>(
    port: &mut P,
    regs: &SlcModeRegisters,
    settle: Duration,
    op: impl FnOnce(&mut P) -> Result<T>,
) -> Result<T>
where
    P: VendorExec + ?Sized,
{
    let enabled = port.exec(&regs.enable_sequence());
    thread::sleep(settle);

    let result = match enabled {
        Ok(_) => op(port),
        Err(err) => Err(err),
    };

    thread::sleep(settle);
    let disabled = port.exec(&regs.disable_sequence());

    let value = result?;
    disabled?;
    Ok(value)
}
