//! Chip identification and the per-chip layout derived from it.

use crate::error::{NfcError, Result};
use crate::nand::NandLayout;
use crate::regs::{ndcr, ndeccctrl};

/// Data bytes moved per naked command on large-page chips
pub const CHUNK_SIZE: usize = 2048;
const SMALL_PAGE_SIZE: usize = 512;

pub const HAMMING_STRENGTH: u32 = 1;
/// BCH strengths come in multiples of this
pub const BCH_STRENGTH: u32 = 16;
const BCH_THRESHOLD: u32 = 8;

/// Bytes of ID the controller fetches from large-page chips
pub const NAND_ID_SIZE: usize = 6;

/// One entry of the flash type table
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlashType {
    pub name: &'static str,
    pub chip_id: u16,
    pub ext_id: u16,
    pub pages_per_block: u32,
    pub page_size: usize,
    pub flash_width: u8,
    pub dfc_width: u8,
    pub ecc_strength: u32,
    pub num_blocks: u32,
    pub dual_plane: bool,
}

macro_rules! flash {
    ($name:expr, $id:expr, $ext:expr, $ppb:expr, $page:expr, $fw:expr, $dw:expr, $ecc:expr, $blocks:expr, $dp:expr) => {
        FlashType {
            name: $name,
            chip_id: $id,
            ext_id: $ext,
            pages_per_block: $ppb,
            page_size: $page,
            flash_width: $fw,
            dfc_width: $dw,
            ecc_strength: $ecc,
            num_blocks: $blocks,
            dual_plane: $dp,
        }
    };
}

/// Used only to talk to a chip before it has been identified
pub const DEFAULT_FLASH: FlashType = flash!("DEFAULT FLASH", 0, 0, 64, 2048, 8, 8, 0, 1024, false);

/// Built-in flash types, matched in order
#[rustfmt::skip]
pub const FLASH_TYPES: &[FlashType] = &[
    flash!("64MiB 16-bit",  0x46ec, 0xffff,  32,  512, 16, 16,  1, 4096, false),
    flash!("256MiB 8-bit",  0xdaec, 0xffff,  64, 2048,  8,  8,  1, 2048, false),
    flash!("4GiB 8-bit",    0xd7ec, 0xb655, 128, 4096,  8,  8, 16, 8192, false),
    flash!("4GiB 8-bit",    0xd7ec, 0x29d5, 128, 4096,  8,  8, 16, 8192, false),
    flash!("128MiB 8-bit",  0xa12c, 0xffff,  64, 2048,  8,  8,  1, 1024, false),
    flash!("128MiB 16-bit", 0xb12c, 0xffff,  64, 2048, 16, 16,  1, 1024, false),
    flash!("512MiB 8-bit",  0xdc2c, 0xffff,  64, 2048,  8,  8,  1, 4096, false),
    flash!("512MiB 16-bit", 0xcc2c, 0xffff,  64, 2048, 16, 16,  1, 4096, false),
    flash!("256MiB 16-bit", 0xba20, 0xffff,  64, 2048, 16, 16,  1, 2048, false),
    flash!("2GiB 8-bit",    0xd5ec, 0xb614, 128, 4096,  8,  8, 16, 4096, true),
    flash!("2GiB 8-bit",    0xd5ec, 0x7284, 128, 8192,  8,  8, 48, 2048, false),
    flash!("2GiB 8-bit",    0xd598, 0x3284, 128, 8192,  8,  8, 80, 2048, true),
    flash!("2GiB 8-bit",    0x482c, 0x4a04, 256, 4096,  8,  8, 48, 2048, true),
    flash!("2GiB 8-bit",    0xd5ad, 0xda94, 256, 8192,  8,  8, 80, 1024, true),
    flash!("4GiB 8-bit",    0xd7ec, 0x7a94, 128, 8192,  8,  8, 48, 4096, true),
    flash!("4GiB 8-bit",    0xd7ec, 0x7e94, 128, 8192,  8,  8, 80, 4096, true),
    flash!("8GiB 8-bit",    0xdeec, 0x7ad5, 128, 8192,  8,  8, 48, 4096, true),
    flash!("4GiB 8-bit",    0xd7ad, 0x9a94, 256, 8192,  8,  8, 48, 2048, true),
    flash!("4GiB 8-bit",    0x682c, 0x4a04, 256, 4096,  8,  8, 48, 4096, true),
    flash!("4GiB 8-bit",    0x682c, 0x4604, 256, 4096,  8,  8, 48, 4096, true),
    flash!("8GiB 8-bit",    0x882c, 0x4b04, 256, 8192,  8,  8, 48, 4096, true),
    flash!("8GiB 8-bit",    0xdead, 0xda94, 256, 8192,  8,  8, 80, 4096, true),
    flash!("8GiB 8-bit",    0x442c, 0x4b44, 256, 8192,  8,  8, 48, 4096, true),
];

const MAKER_HYNIX: u8 = 0xad;

impl FlashType {
    /// Does a chip reporting `id0`/`id1` (first and second ID halfwords) match this entry?
    pub fn matches(&self, id0: u16, id1: u16) -> bool {
        self.chip_id == id0 && (self.ext_id & id1) == id1
    }

    pub fn maker(&self) -> u8 {
        self.chip_id as u8
    }

    /// Hynix parts expose the registers used for pseudo-SLC mode
    pub fn has_slc_registers(&self) -> bool {
        self.maker() == MAKER_HYNIX
    }

    /// The ID bytes this chip reports, as the controller sees them
    pub fn id_bytes(&self) -> [u8; NAND_ID_SIZE] {
        let [a, b] = self.chip_id.to_le_bytes();
        let [c, d] = self.ext_id.to_le_bytes();
        [a, b, c, d, 0, 0]
    }
}

/// Find the flash type for a chip's ID bytes, searching `extra` (platform-provided types) first.
pub fn lookup<'a>(extra: &'a [FlashType], id: &[u8]) -> Result<&'a FlashType> {
    let byte = |i: usize| id.get(i).copied().unwrap_or(0);
    let half = |i: usize| u16::from_le_bytes([byte(i), byte(i + 1)]);
    let (id0, id1) = (half(0), half(2));

    extra
        .iter()
        .chain(FLASH_TYPES.iter())
        .find(|f| f.matches(id0, id1))
        .ok_or(NfcError::UnknownChip(id0, id1))
}

/// Immutable per-chip layout, fixed once the chip is identified
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub page_size: usize,
    pub oob_size: usize,
    pub pages_per_block: u32,
    pub blocks: u32,
    pub row_cycles: u8,
    pub col_cycles: u8,
    pub ecc_strength: u32,
    pub read_id_bytes: u8,
    pub flash_width: u8,
    pub dfc_width: u8,
    pub dual_plane: bool,
}

impl Geometry {
    pub fn new(flash: &FlashType) -> Result<Self> {
        let unsupported = |what: String| Err(NfcError::UnsupportedConfig(format!("{}: {what}", flash.name)));

        let large = match flash.page_size {
            SMALL_PAGE_SIZE => false,
            2048 | 4096 | 8192 => true,
            other => return unsupported(format!("page size {other}")),
        };

        if !matches!(flash.pages_per_block, 32 | 64 | 128 | 256) {
            return unsupported(format!("{} pages per block", flash.pages_per_block));
        }

        let ecc = flash.ecc_strength;
        if ecc > HAMMING_STRENGTH && (ecc % BCH_STRENGTH != 0 || !large) {
            return unsupported(format!("ECC strength {ecc}"));
        }

        let oob_size = match (large, ecc) {
            (false, 0) => 16,
            (false, _) => 8,
            (true, 0) => 64,
            (true, HAMMING_STRENGTH) => 40,
            (true, _) => 32,
        };

        let row_cycles = if u64::from(flash.num_blocks) * u64::from(flash.pages_per_block) > 65536 { 3 } else { 2 };

        Ok(Self {
            page_size: flash.page_size,
            oob_size,
            pages_per_block: flash.pages_per_block,
            blocks: flash.num_blocks,
            row_cycles,
            col_cycles: if large { 2 } else { 1 },
            ecc_strength: ecc,
            read_id_bytes: if large { NAND_ID_SIZE as u8 } else { 2 },
            flash_width: flash.flash_width,
            dfc_width: flash.dfc_width,
            dual_plane: flash.dual_plane,
        })
    }

    /// Geometry used to reset and identify a chip that hasn't been matched yet
    pub fn unidentified() -> Self {
        Self {
            page_size: DEFAULT_FLASH.page_size,
            oob_size: 64,
            pages_per_block: DEFAULT_FLASH.pages_per_block,
            blocks: DEFAULT_FLASH.num_blocks,
            row_cycles: 2,
            col_cycles: 2,
            ecc_strength: 0,
            read_id_bytes: NAND_ID_SIZE as u8,
            flash_width: 8,
            dfc_width: 8,
            dual_plane: false,
        }
    }

    pub fn is_large_page(&self) -> bool {
        self.page_size >= CHUNK_SIZE
    }

    /// Data bytes per chunk
    pub fn chunk_size(&self) -> usize {
        self.page_size.min(CHUNK_SIZE)
    }

    /// Number of naked data phases one page takes
    pub fn chunks(&self) -> usize {
        self.page_size / self.chunk_size()
    }

    /// Bytes moved by data phase `chunk`; the last one also carries the spare area
    pub fn transfer_len(&self, chunk: usize) -> usize {
        if chunk + 1 == self.chunks() {
            self.chunk_size() + self.oob_size
        } else {
            self.chunk_size()
        }
    }

    /// Page data plus spare, as stored on the chip
    pub fn raw_page_len(&self) -> usize {
        self.page_size + self.oob_size
    }

    pub fn page_count(&self) -> u32 {
        self.blocks * self.pages_per_block
    }

    pub fn block_start(&self, page: u32) -> u32 {
        page & !(self.pages_per_block - 1)
    }

    pub fn is_bch(&self) -> bool {
        self.ecc_strength > HAMMING_STRENGTH
    }

    /// Value of NDCR for this chip, without the run/ECC/DMA enables
    pub fn ndcr(&self, arbitration: bool) -> u32 {
        let mut value = ndcr::rd_id_cnt(self.read_id_bytes as u32);

        if arbitration {
            value |= ndcr::ND_ARB_EN;
        }
        if self.col_cycles == 2 {
            value |= ndcr::RA_START;
        }
        if self.flash_width == 16 {
            value |= ndcr::DWIDTH_M;
        }
        if self.dfc_width == 16 {
            value |= ndcr::DWIDTH_C;
        }
        value |= ndcr::pg_per_blk(match self.pages_per_block {
            32 => 0,
            128 => 1,
            256 => 3,
            _ => 2,
        });
        if self.is_large_page() {
            value |= ndcr::PAGE_SZ;
        }
        // The spare area only fits alongside weak ECC
        if self.ecc_strength <= BCH_STRENGTH {
            value |= ndcr::SPARE_EN;
        }

        value
    }

    pub fn ecc_ctrl(&self) -> u32 {
        let mut value = ndeccctrl::strength(self.ecc_strength);
        if self.is_bch() {
            value |= ndeccctrl::BCH_EN | ndeccctrl::thresh(BCH_THRESHOLD);
        }
        value
    }

    pub fn layout(&self) -> NandLayout {
        NandLayout {
            blocks: self.blocks,
            pages_per_block: self.pages_per_block,
            bytes_per_page: self.page_size,
        }
    }
}

/// Map a page address of a dual-plane view (blocks of twice the size) onto the physical page of
/// its first plane. The second plane's page always sits `pages_per_block` further on.
pub fn dual_plane_page(page: u32, pages_per_block: u32) -> u32 {
    let mask = pages_per_block - 1;
    ((page & !mask) << 1) + (page & mask)
}

#[cfg(test)]
fn flash_named(id: u16, ext: u16) -> &'static FlashType {
    FLASH_TYPES.iter().find(|f| f.chip_id == id && f.ext_id == ext).unwrap()
}

#[test]
fn test_lookup() {
    let hynix = lookup(&[], &[0xad, 0xde, 0x94, 0xda, 0x74, 0xc4]).unwrap();
    assert_eq!(hynix.chip_id, 0xdead);
    assert!(hynix.has_slc_registers());

    // 0xffff ext ids accept anything
    assert_eq!(lookup(&[], &[0xec, 0xda, 0x10, 0x95]).unwrap().page_size, 2048);

    assert!(matches!(lookup(&[], &[0x01, 0x02, 0x03, 0x04]), Err(NfcError::UnknownChip(0x0201, 0x0403))));
}

#[test]
fn test_lookup_prefers_platform_types() {
    let custom = [FlashType { name: "custom", num_blocks: 16, ..*flash_named(0xdaec, 0xffff) }];
    assert_eq!(lookup(&custom, &[0xec, 0xda, 0, 0]).unwrap().name, "custom");
}

#[test]
fn test_geometry() {
    let geo = Geometry::new(flash_named(0xdead, 0xda94)).unwrap();
    assert_eq!(geo.oob_size, 32);
    assert_eq!(geo.chunks(), 4);
    assert_eq!(geo.transfer_len(0), 2048);
    assert_eq!(geo.transfer_len(3), 2048 + 32);
    assert_eq!(geo.col_cycles, 2);
    assert_eq!(geo.row_cycles, 3);
    assert!(geo.ndcr(false) & ndcr::SPARE_EN == 0);
    assert!(geo.ecc_ctrl() & ndeccctrl::BCH_EN != 0);

    let small = Geometry::new(flash_named(0x46ec, 0xffff)).unwrap();
    assert_eq!((small.chunks(), small.chunk_size(), small.oob_size), (1, 512, 8));
    // 32 x 4096 pages do not fit in two row bytes
    assert_eq!((small.col_cycles, small.row_cycles), (1, 3));
    assert_eq!(small.ndcr(true) & (ndcr::PAGE_SZ | ndcr::ND_ARB_EN), ndcr::ND_ARB_EN);

    let hamming = Geometry::new(flash_named(0xdaec, 0xffff)).unwrap();
    assert_eq!((hamming.chunks(), hamming.oob_size), (1, 40));
    assert_eq!(hamming.ecc_ctrl() & ndeccctrl::BCH_EN, 0);

    // Exactly 65536 pages still address with two row bytes
    let two_rows = Geometry::new(flash_named(0xa12c, 0xffff)).unwrap();
    assert_eq!(two_rows.page_count(), 65536);
    assert_eq!((two_rows.col_cycles, two_rows.row_cycles), (2, 2));
}

#[test]
fn test_unsupported_geometry() {
    let odd_page = FlashType { page_size: 6144, ..*flash_named(0xdead, 0xda94) };
    assert!(matches!(Geometry::new(&odd_page), Err(NfcError::UnsupportedConfig(_))));

    assert_eq!(Geometry::new(&DEFAULT_FLASH).unwrap(), Geometry::unidentified());

    let odd_ecc = FlashType { ecc_strength: 4, ..*flash_named(0xdaec, 0xffff) };
    assert!(Geometry::new(&odd_ecc).is_err());

    let small_bch = FlashType { ecc_strength: 16, ..*flash_named(0x46ec, 0xffff) };
    assert!(Geometry::new(&small_bch).is_err());
}

#[test]
fn test_dual_plane_page() {
    assert_eq!(dual_plane_page(0, 64), 0);
    assert_eq!(dual_plane_page(5, 64), 5);
    assert_eq!(dual_plane_page(64, 64), 128);
    assert_eq!(dual_plane_page(64 * 3 + 7, 64), 64 * 6 + 7);
}
