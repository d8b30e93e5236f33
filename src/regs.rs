//! Register map of the NAND flash controller (pxa3xx family, as integrated on Berlin SoCs).

use log::error;

use crate::hw::RegisterBus;

pub const NDCR: u32 = 0x00;
pub const NDTR0CS0: u32 = 0x04;
pub const NDTR1CS0: u32 = 0x0C;
pub const NDSR: u32 = 0x14;
pub const NDECCCTRL: u32 = 0x28;
/// Data FIFO port
pub const NDDB: u32 = 0x40;
/// Command buffer port; written 3 times per command, 4 with a length override
pub const NDCB0: u32 = 0x48;

/// Control register
pub mod ndcr {
    pub const SPARE_EN: u32 = 1 << 31;
    pub const ECC_EN: u32 = 1 << 30;
    pub const DMA_EN: u32 = 1 << 29;
    pub const ND_RUN: u32 = 1 << 28;
    pub const DWIDTH_C: u32 = 1 << 27;
    pub const DWIDTH_M: u32 = 1 << 26;
    pub const PAGE_SZ: u32 = 1 << 24;
    pub const RA_START: u32 = 1 << 15;
    pub const ND_ARB_EN: u32 = 1 << 12;

    pub const fn rd_id_cnt(bytes: u32) -> u32 {
        (bytes & 0x7) << 16
    }

    pub const fn pg_per_blk(code: u32) -> u32 {
        (code & 0x3) << 13
    }
}

/// Status register. Every event bit is write-1-to-clear.
pub mod ndsr {
    pub const RDY: u32 = 1 << 12;
    pub const FLASH_RDY: u32 = 1 << 11;
    pub const CS0_PAGED: u32 = 1 << 10;
    pub const CS1_PAGED: u32 = 1 << 9;
    pub const CS0_CMDD: u32 = 1 << 8;
    pub const CS1_CMDD: u32 = 1 << 7;
    pub const CS0_BBD: u32 = 1 << 6;
    pub const CS1_BBD: u32 = 1 << 5;
    pub const DBERR: u32 = 1 << 4;
    pub const SBERR: u32 = 1 << 3;
    pub const WRDREQ: u32 = 1 << 2;
    pub const RDDREQ: u32 = 1 << 1;
    pub const WRCMDREQ: u32 = 1 << 0;
    pub const MASK: u32 = 0xfff;

    const ERR_CNT_SHIFT: u32 = 16;
    const ERR_CNT_MASK: u32 = 0x1f;

    /// Bits a descriptor stream clears after snapshotting each chunk's status
    pub const CHUNK_CLEAR: u32 = DBERR | SBERR | CS0_BBD | CS1_BBD | CS0_PAGED | CS1_PAGED;

    pub const fn err_cnt(status: u32) -> u32 {
        (status >> ERR_CNT_SHIFT) & ERR_CNT_MASK
    }

    pub const fn with_err_cnt(count: u32) -> u32 {
        let count = if count > ERR_CNT_MASK { ERR_CNT_MASK } else { count };
        count << ERR_CNT_SHIFT
    }

    pub const fn ready(cs: u8) -> u32 {
        if cs == 0 {
            FLASH_RDY
        } else {
            RDY
        }
    }

    pub const fn cmd_done(cs: u8) -> u32 {
        if cs == 0 {
            CS0_CMDD
        } else {
            CS1_CMDD
        }
    }

    pub const fn page_done(cs: u8) -> u32 {
        if cs == 0 {
            CS0_PAGED
        } else {
            CS1_PAGED
        }
    }

    pub const fn bad_block(cs: u8) -> u32 {
        if cs == 0 {
            CS0_BBD
        } else {
            CS1_BBD
        }
    }
}

/// ECC control register
pub mod ndeccctrl {
    pub const BCH_EN: u32 = 1 << 0;

    pub const fn thresh(bits: u32) -> u32 {
        (bits & 0x3f) << 7
    }

    pub const fn strength(bits: u32) -> u32 {
        (bits & 0xff) << 16
    }
}

/// Read every controller register and log the lot. Called when the hardware stops answering.
///
/// The registers are read whether or not a logger is listening, so a dump always happens.
pub fn dump_registers<B: RegisterBus + ?Sized>(bus: &mut B) -> [(&'static str, u32); 5] {
    let dump = [
        ("NDCR", NDCR),
        ("NDTR0CS0", NDTR0CS0),
        ("NDTR1CS0", NDTR1CS0),
        ("NDSR", NDSR),
        ("NDECCCTRL", NDECCCTRL),
    ]
    .map(|(name, offset)| (name, bus.read32(offset)));

    error!("NFC register dump:");
    for (name, value) in dump {
        error!("  {name:<10} = {value:08X}");
    }
    dump
}

#[test]
fn test_status_helpers() {
    assert_eq!(ndsr::ready(0), ndsr::FLASH_RDY);
    assert_eq!(ndsr::ready(1), ndsr::RDY);
    assert_eq!(ndsr::err_cnt(ndsr::with_err_cnt(7) | ndsr::SBERR), 7);
    assert_eq!(ndsr::err_cnt(ndsr::with_err_cnt(200)), 31);
    assert_eq!(ndsr::CHUNK_CLEAR & ndsr::WRCMDREQ, 0);
}

#[test]
fn test_dump_reads_every_register() {
    struct Bus(Vec<u32>);

    impl RegisterBus for Bus {
        fn read32(&mut self, offset: u32) -> u32 {
            self.0.push(offset);
            offset ^ 0xA5A5_0000
        }

        fn write32(&mut self, _offset: u32, _value: u32) {}
    }

    // No logger is installed here, so nothing may hide behind the log macros
    let mut bus = Bus(Vec::new());
    let dump = dump_registers(&mut bus);
    assert_eq!(bus.0, [NDCR, NDTR0CS0, NDTR1CS0, NDSR, NDECCCTRL]);
    assert_eq!(dump[3], ("NDSR", NDSR ^ 0xA5A5_0000));
}
