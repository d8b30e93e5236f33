//! Bounded recovery from uncorrectable reads by stepping the chip through vendor read-retry
//! settings.

use log::{debug, info, warn};

use crate::command::VendorSequence;
use crate::error::{NfcError, Result};
use crate::geometry::FlashType;

pub mod table;

pub use table::RetryTable;

/// Runs vendor command exchanges against one chip, returning whatever the read steps produced
pub trait VendorExec {
    fn exec(&mut self, seq: &VendorSequence) -> Result<Vec<u8>>;
}

/// A vendor port bound to one failed read
pub trait RetryPort: VendorExec {
    /// Reissue the original read; `true` if it now passes ECC
    fn reread(&mut self) -> Result<bool>;
}

/// Feature address of Micron's read-retry option
const MICRON_RETRY_FEATURE: u8 = 0x89;
const MICRON_RETRY_CYCLES: u32 = 7;

/// Which retry scheme a chip supports, before any table has been loaded
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryKind {
    None,
    Table,
    Index { cycles: u32 },
}

impl RetryKind {
    pub fn for_flash(flash: &FlashType) -> Self {
        match (flash.chip_id, flash.ext_id) {
            (0xdead | 0xd5ad, 0xda94) => RetryKind::Table,
            (0x442c, 0x4b44) => RetryKind::Index {
                cycles: MICRON_RETRY_CYCLES,
            },
            _ => RetryKind::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    None,
    TableBased(RetryTable),
    IndexBased { cycles: u32 },
}

impl RetryStrategy {
    pub fn cycles(&self) -> u32 {
        match self {
            RetryStrategy::None => 0,
            RetryStrategy::TableBased(table) => table.len() as u32,
            RetryStrategy::IndexBased { cycles } => *cycles,
        }
    }

    fn apply<P: VendorExec + ?Sized>(&self, cycle: u32, port: &mut P) -> Result<()> {
        match self {
            RetryStrategy::None => Ok(()),
            RetryStrategy::TableBased(table) => {
                let row = table.row_for_cycle(cycle);
                debug!("retry cycle {cycle}: table row {row}");
                port.exec(&table.setter(row)).map(drop)
            }
            RetryStrategy::IndexBased { .. } => {
                port.exec(&micron_set(cycle as u8))?;
                let readback = port.exec(&micron_get())?;
                debug!("retry cycle {cycle}: feature {MICRON_RETRY_FEATURE:#04x} reads {readback:02x?}");
                Ok(())
            }
        }
    }

    /// Return the chip to its default read levels
    pub fn disable<P: VendorExec + ?Sized>(&mut self, port: &mut P) -> Result<()> {
        match self {
            RetryStrategy::None => Ok(()),
            RetryStrategy::TableBased(table) => {
                table.set_current(0);
                port.exec(&table.setter(0)).map(drop)
            }
            RetryStrategy::IndexBased { .. } => port.exec(&micron_set(0)).map(drop),
        }
    }

    /// Step through every retry cycle once until the read passes.
    ///
    /// Returns the number of cycles it took. Exhausting them all restores the defaults and fails
    /// with [`NfcError::Uncorrectable`].
    pub fn recover<P: RetryPort + ?Sized>(&mut self, page: u32, port: &mut P) -> Result<u32> {
        let cycles = self.cycles();

        for cycle in 1..=cycles {
            warn!("page {page}: read retry {cycle} of {cycles}");
            let attempt = self.apply(cycle, port).and_then(|_| port.reread());

            match attempt {
                Ok(true) => {
                    info!("page {page} recovered after {cycle} read retries");
                    match self {
                        RetryStrategy::TableBased(table) => {
                            let row = table.row_for_cycle(cycle);
                            table.set_current(row);
                        }
                        _ => self.disable(port)?,
                    }
                    return Ok(cycle);
                }
                Ok(false) => continue,
                Err(err) => {
                    // Leave the chip at its defaults even when the hardware stops answering
                    if let Err(disable) = self.disable(port) {
                        warn!("could not disable read retry: {disable}");
                    }
                    return Err(err);
                }
            }
        }

        if cycles > 0 {
            self.disable(port)?;
        }
        Err(NfcError::Uncorrectable { page, retries: cycles })
    }
}

fn micron_set(index: u8) -> VendorSequence {
    VendorSequence::new()
        .cmd(0xEF)
        .addr(&[MICRON_RETRY_FEATURE])
        .write(&[index, 0, 0, 0])
}

fn micron_get() -> VendorSequence {
    VendorSequence::new().cmd(0xEE).addr(&[MICRON_RETRY_FEATURE]).read(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::VendorStep;
    use crate::geometry::FLASH_TYPES;

    /// Records what was written to the first register of every exchange, and fails rereads until
    /// told otherwise
    #[derive(Default)]
    struct MockPort {
        exchanges: Vec<Vec<VendorStep>>,
        rereads: u32,
        pass_on: Option<u32>,
        fail_exec: bool,
    }

    impl MockPort {
        /// The value each exchange wrote first, if any
        fn written(&self) -> Vec<u8> {
            self.exchanges
                .iter()
                .filter_map(|steps| {
                    steps.iter().find_map(|s| match s {
                        VendorStep::Write(bytes) => bytes.first().copied(),
                        _ => None,
                    })
                })
                .collect()
        }
    }

    impl VendorExec for MockPort {
        fn exec(&mut self, seq: &VendorSequence) -> Result<Vec<u8>> {
            self.exchanges.push(seq.steps().to_vec());
            if self.fail_exec {
                return Err(NfcError::Timeout("mock"));
            }
            Ok(vec![0; 4])
        }
    }

    impl RetryPort for MockPort {
        fn reread(&mut self) -> Result<bool> {
            self.rereads += 1;
            Ok(self.pass_on == Some(self.rereads))
        }
    }

    fn three_rows() -> RetryStrategy {
        RetryStrategy::TableBased(RetryTable::new(vec![[0xA0; 8], [0xA1; 8], [0xA2; 8]]).unwrap())
    }

    #[test]
    fn test_table_exhaustion() {
        let mut strategy = three_rows();
        let mut port = MockPort::default();

        let err = strategy.recover(42, &mut port).unwrap_err();
        assert!(matches!(err, NfcError::Uncorrectable { page: 42, retries: 3 }));
        assert_eq!(port.rereads, 3);
        // cycles 1, 2, 3 land on rows 1, 2, 0; then the disable writes row 0
        assert_eq!(port.written(), [0xA1, 0xA2, 0xA0, 0xA0]);
    }

    #[test]
    fn test_table_remembers_working_row() {
        let mut strategy = three_rows();
        let mut port = MockPort {
            pass_on: Some(2),
            ..Default::default()
        };
        assert_eq!(strategy.recover(1, &mut port).unwrap(), 2);
        assert_eq!(port.written(), [0xA1, 0xA2]);

        let RetryStrategy::TableBased(table) = &strategy else { unreachable!() };
        assert_eq!(table.current(), 2);

        // The next episode starts from the row that worked
        let mut port = MockPort {
            pass_on: Some(1),
            ..Default::default()
        };
        assert_eq!(strategy.recover(1, &mut port).unwrap(), 1);
        assert_eq!(port.written(), [0xA0]);
    }

    #[test]
    fn test_index_disables_after_success() {
        let mut strategy = RetryStrategy::IndexBased { cycles: 7 };
        let mut port = MockPort {
            pass_on: Some(3),
            ..Default::default()
        };
        assert_eq!(strategy.recover(9, &mut port).unwrap(), 3);
        // set/get per cycle, then the final disable
        assert_eq!(port.exchanges.len(), 3 * 2 + 1);
        assert_eq!(port.written(), [1, 2, 3, 0]);
        assert!(port.exchanges[1].contains(&VendorStep::Read(4)));
    }

    #[test]
    fn test_none_fails_immediately() {
        let mut port = MockPort::default();
        let err = RetryStrategy::None.recover(5, &mut port).unwrap_err();
        assert!(matches!(err, NfcError::Uncorrectable { page: 5, retries: 0 }));
        assert_eq!(port.rereads, 0);
        assert!(port.exchanges.is_empty());
    }

    #[test]
    fn test_hardware_error_still_disables() {
        let mut strategy = RetryStrategy::IndexBased { cycles: 7 };
        let mut port = MockPort {
            fail_exec: true,
            ..Default::default()
        };
        assert!(strategy.recover(0, &mut port).unwrap_err().is_timeout());
        assert_eq!(port.written(), [1, 0]);
    }

    #[test]
    fn test_kind_for_flash() {
        let kind = |id, ext| RetryKind::for_flash(FLASH_TYPES.iter().find(|f| f.chip_id == id && f.ext_id == ext).unwrap());
        assert_eq!(kind(0xdead, 0xda94), RetryKind::Table);
        assert_eq!(kind(0xd5ad, 0xda94), RetryKind::Table);
        assert_eq!(kind(0x442c, 0x4b44), RetryKind::Index { cycles: 7 });
        assert_eq!(kind(0xdaec, 0xffff), RetryKind::None);
    }
}
