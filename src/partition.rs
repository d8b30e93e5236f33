//! Block-level windows onto an attached chip, for the code (UBI, images, filesystems) that sits
//! above the controller.

use anyhow::ensure;
use log::debug;

use crate::controller::{NandController, Target};
use crate::error::{NfcError, Result};
use crate::geometry::{dual_plane_page, Geometry};
use crate::hw::Hardware;
use crate::nand::{Nand, NandBlock, NandLayout, PageUtil};

/// A run of blocks on one chip select, addressed from zero.
///
/// In dual-plane mode each view block is a pair of physical blocks and each view page carries both
/// planes' data. With a pseudo-SLC policy only the logical half of every block is visible.
pub struct PartitionView<'a, H: Hardware> {
    ctrl: &'a NandController<H>,
    target: Target,
    geo: Geometry,
    first_block: u32,
    blocks: u32,
}

impl<'a, H: Hardware> PartitionView<'a, H> {
    /// `first_block` is a physical block number; `blocks` counts view blocks
    pub fn new(ctrl: &'a NandController<H>, target: Target, first_block: u32, blocks: u32) -> Result<Self> {
        let geo = ctrl.geometry(target.cs)?;
        if target.planes == 2 && first_block % 2 != 0 {
            return Err(NfcError::UnsupportedConfig(format!(
                "dual-plane partition starts on odd block {first_block}"
            )));
        }
        if let Some(policy) = target.slc {
            policy.check(geo.pages_per_block)?;
        }

        let end = blocks
            .checked_mul(target.planes as u32)
            .and_then(|span| span.checked_add(first_block));
        match end {
            Some(end) if end <= geo.blocks => {}
            _ => return Err(NfcError::OutOfRange(first_block.saturating_mul(geo.pages_per_block))),
        }

        Ok(Self {
            ctrl,
            target,
            geo,
            first_block,
            blocks,
        })
    }

    fn pages_per_block(&self) -> u32 {
        match self.target.slc {
            Some(policy) => policy.pages_per_block(self.geo.pages_per_block),
            None => self.geo.pages_per_block,
        }
    }

    /// Controller page address of the first page of view block `block`
    fn base_page(&self, block: u32) -> u32 {
        let ppb = self.pages_per_block();
        let page = block * ppb;
        let page = match self.target.planes {
            2 => dual_plane_page(page, ppb),
            _ => page,
        };
        self.first_block * ppb + page
    }
}

impl<H: Hardware> Nand for PartitionView<'_, H> {
    type Block<'b> = PartitionBlock<'b, H> where Self: 'b;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<PartitionBlock<'_, H>>> {
        ensure!(index < self.blocks, "block {index} beyond partition of {}", self.blocks);

        let base = self.base_page(index);
        if self.ctrl.is_bad(self.target, base)? {
            debug!("skipping bad block {index} (page {base})");
            return Ok(None);
        }

        Ok(Some(PartitionBlock {
            ctrl: self.ctrl,
            target: self.target,
            base,
            pages: self.pages_per_block(),
            page_size: self.geo.page_size * self.target.planes as usize,
        }))
    }

    fn get_layout(&self) -> NandLayout {
        NandLayout {
            blocks: self.blocks,
            pages_per_block: self.pages_per_block(),
            bytes_per_page: self.geo.page_size * self.target.planes as usize,
        }
    }
}

pub struct PartitionBlock<'a, H: Hardware> {
    ctrl: &'a NandController<H>,
    target: Target,
    base: u32,
    pages: u32,
    page_size: usize,
}

impl<H: Hardware> PartitionBlock<'_, H> {
    fn span(&self, start_page: u32, len: usize) -> anyhow::Result<()> {
        ensure!(len % self.page_size == 0, "{len} bytes is not a whole number of pages");
        let count = (len / self.page_size) as u32;
        ensure!(
            start_page + count <= self.pages,
            "pages {start_page}..{} beyond block of {}",
            start_page + count,
            self.pages
        );
        Ok(())
    }
}

impl<H: Hardware> NandBlock for PartitionBlock<'_, H> {
    fn page_count(&self) -> u32 {
        self.pages
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        self.span(start_page, content.len())?;
        for (page, chunk) in (self.base + start_page..).zip(content.chunks_mut(self.page_size)) {
            let outcome = self.ctrl.read_page(self.target, page, chunk, &mut [])?;
            if outcome.exceeds_threshold() {
                debug!("page {page} needed {} corrections", outcome.corrected_bits);
            }
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        self.span(start_page, content.len())?;
        for (page, chunk) in (self.base + start_page..).zip(content.chunks(self.page_size)) {
            // Programming all-ones changes nothing
            if chunk.is_erased() {
                continue;
            }
            self.ctrl.write_page(self.target, page, chunk, &[])?;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        Ok(self.ctrl.erase_block(self.target, self.base)?)
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        Ok(self.ctrl.mark_bad(self.target, self.base)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::geometry::FLASH_TYPES;
    use crate::sim::SimHardware;
    use crate::slc::SlcPolicy;

    fn attached(id: u16, ext: u16) -> NandController<SimHardware> {
        let flash = FLASH_TYPES.iter().find(|f| f.chip_id == id && f.ext_id == ext).unwrap();
        let ctrl = NandController::new(SimHardware::with_chip(*flash).unwrap(), ControllerConfig::default());
        ctrl.attach(0).unwrap();
        ctrl
    }

    #[test]
    fn test_blocks_and_bad_blocks() {
        let ctrl = attached(0xd7ec, 0xb655);
        ctrl.hardware(|hw| hw.chip_mut(0).unwrap().mark_factory_bad(3));

        let mut view = PartitionView::new(&ctrl, Target::new(0), 2, 4).unwrap();
        let layout = view.get_layout();
        assert_eq!((layout.blocks, layout.pages_per_block, layout.bytes_per_page), (4, 128, 4096));
        assert!(view.block(1).unwrap().is_none());
        assert!(view.block(4).is_err());

        let data: Vec<u8> = (0..2 * 4096).map(|i| (i % 251) as u8).collect();
        let mut block = view.block(0).unwrap().unwrap();
        block.erase().unwrap();
        block.program(5, &data).unwrap();

        let mut out = vec![0; data.len()];
        block.read(5, &mut out).unwrap();
        assert_eq!(out, data);
        assert!(block.read(127, &mut out).is_err());
        ctrl.hardware(|hw| assert_eq!(&hw.chip(0).unwrap().page(2 * 128 + 6).unwrap()[..4096], &data[4096..]));

        view.block(2).unwrap().unwrap().mark_bad().unwrap();
        assert!(view.block(2).unwrap().is_none());
    }

    #[test]
    fn test_dual_plane_addressing() {
        let ctrl = attached(0xdead, 0xda94);
        let target = Target::new(0).planes(2);
        assert!(PartitionView::new(&ctrl, target, 3, 1).is_err());

        let mut view = PartitionView::new(&ctrl, target, 2, 4).unwrap();
        assert_eq!(view.get_layout().bytes_per_page, 2 * 8192);

        let data: Vec<u8> = (0..2 * 8192).map(|i| (i % 253) as u8).collect();
        view.block(1).unwrap().unwrap().program(3, &data).unwrap();

        // View block 1 is physical blocks 4 and 5
        ctrl.hardware(|hw| {
            let chip = hw.chip(0).unwrap();
            assert_eq!(&chip.page(4 * 256 + 3).unwrap()[..8192], &data[..8192]);
            assert_eq!(&chip.page(5 * 256 + 3).unwrap()[..8192], &data[8192..]);
        });
    }

    #[test]
    fn test_pseudo_slc_view() {
        let ctrl = attached(0xdead, 0xda94);
        let mut view = PartitionView::new(&ctrl, Target::new(0).slc(SlcPolicy::Slc), 8, 2).unwrap();
        assert_eq!(view.get_layout().pages_per_block, 128);

        let data = vec![0x5a; 8192];
        let mut block = view.block(1).unwrap().unwrap();
        assert_eq!(block.page_count(), 128);
        block.program(10, &data).unwrap();
        ctrl.hardware(|hw| assert_eq!(&hw.chip(0).unwrap().page(9 * 256 + 10).unwrap()[..8192], &data[..]));
    }

    #[test]
    fn test_partition_past_chip_end() {
        let ctrl = attached(0xd7ec, 0xb655);
        assert!(matches!(
            PartitionView::new(&ctrl, Target::new(0), 8190, 4),
            Err(NfcError::OutOfRange(_))
        ));

        let ctrl = attached(0xdead, 0xda94);
        assert!(matches!(
            PartitionView::new(&ctrl, Target::new(0).planes(2), 2, u32::MAX),
            Err(NfcError::OutOfRange(_))
        ));
        assert!(matches!(
            PartitionView::new(&ctrl, Target::new(0), u32::MAX, 1),
            Err(NfcError::OutOfRange(_))
        ));
    }
}
