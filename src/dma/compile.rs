//! Compiles page operations into descriptor streams.
//!
//! Every stream drives the flash with naked phases only: each command cycle, address phase and
//! data chunk is staged through the command buffer port after a wait on the controller's
//! command-request semaphore. A status read is always appended, with BCH switched off around it.

use crate::command::{
    CommandSequencer, Opcode, CMD_ERASE1, CMD_ERASE2, CMD_PAGEPROG, CMD_PAGEPROG_PLANE, CMD_READ0,
    CMD_READSTART, CMD_SEQIN, CMD_SEQIN_PLANE,
};
use crate::dma::{sem, DescriptorBuffer, Mtu, Record};
use crate::error::{NfcError, Result};
use crate::geometry::Geometry;
use crate::regs::{ndeccctrl, ndsr, NDCR, NDDB, NDECCCTRL, NDSR};

/// Where a stream leaves its status words, within a chip select's coherent scratch region
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScratchLayout {
    pub status: u32,
    pub snapshots: u32,
    pub mask: u32,
}

impl ScratchLayout {
    const SNAPSHOT_OFFSET: u32 = 128;
    const MASK_OFFSET: u32 = 256;
    pub const SIZE: usize = 512;

    pub fn at(base: u32) -> Self {
        Self {
            status: base,
            snapshots: base + Self::SNAPSHOT_OFFSET,
            mask: base + Self::MASK_OFFSET,
        }
    }

    /// Slot holding NDSR as it stood after data chunk `index` (counted across planes)
    pub fn snapshot(&self, index: usize) -> u32 {
        self.snapshots + 4 * index as u32
    }
}

/// What one stream should do
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub op: Opcode,
    /// First plane's page; plane `n` sits `n * pages_per_block` further on
    pub page: u32,
    pub planes: u8,
    /// Bus address of the page buffer: per plane, data then spare
    pub data: u32,
}

pub struct DescriptorCompiler<'a> {
    geo: &'a Geometry,
    sequencer: CommandSequencer<'a>,
    mtu: usize,
    scratch: ScratchLayout,
}

impl<'a> DescriptorCompiler<'a> {
    pub fn new(geo: &'a Geometry, cs: u8, mtu: Mtu, scratch: ScratchLayout) -> Self {
        Self {
            geo,
            sequencer: CommandSequencer::new(geo, cs),
            mtu: mtu.bytes(),
            scratch,
        }
    }

    /// Stop the controller, program ECC, clear status and start it again with `ndcr`
    pub fn start(&self, buf: &mut DescriptorBuffer, ndcr: u32) -> Result<()> {
        buf.push(Record::cfgw(NDCR, 0))?;
        buf.push(Record::cfgw(NDECCCTRL, self.geo.ecc_ctrl()))?;
        buf.push(Record::cfgw(NDSR, ndsr::MASK))?;
        buf.push(Record::cfgw(NDCR, ndcr))
    }

    pub fn compile(&self, buf: &mut DescriptorBuffer, plan: &TransferPlan) -> Result<()> {
        if !matches!(plan.planes, 1 | 2) {
            return Err(NfcError::UnsupportedConfig(format!("{} planes", plan.planes)));
        }
        let planes = plan.planes as usize;
        let chunks = self.geo.chunks();

        for plane in 0..planes {
            let page = plan.page + plane as u32 * self.geo.pages_per_block;
            let last_plane = plane + 1 == planes;
            let data = plan.data + (plane * self.geo.raw_page_len()) as u32;

            match plan.op {
                Opcode::Read | Opcode::RandomReadout => {
                    self.cmd(buf, CMD_READ0)?;
                    self.addr(buf, plan.op, page)?;
                    self.cmd(buf, CMD_READSTART)?;
                    for chunk in 0..chunks {
                        self.read_chunk(buf, data, plane * chunks + chunk, chunk)?;
                    }
                }
                Opcode::Program => {
                    self.cmd(buf, if plane == 0 { CMD_SEQIN } else { CMD_SEQIN_PLANE })?;
                    self.addr(buf, plan.op, page)?;
                    for chunk in 0..chunks {
                        self.write_chunk(buf, data, chunk)?;
                    }
                    self.cmd(buf, if last_plane { CMD_PAGEPROG } else { CMD_PAGEPROG_PLANE })?;
                }
                Opcode::Erase => {
                    self.cmd(buf, CMD_ERASE1)?;
                    self.addr(buf, plan.op, self.geo.block_start(page))?;
                    if last_plane {
                        self.cmd(buf, CMD_ERASE2)?;
                    }
                }
                other => return Err(NfcError::InvalidOperation(other.code())),
            }
        }

        self.status_trailer(buf)
    }

    fn cmd(&self, buf: &mut DescriptorBuffer, opcode: u8) -> Result<()> {
        buf.push(Record::sema(sem::CMD, sem::NONE))?;
        buf.push_command(&self.sequencer.naked_cmd(opcode))
    }

    fn addr(&self, buf: &mut DescriptorBuffer, op: Opcode, page: u32) -> Result<()> {
        buf.push(Record::sema(sem::CMD, sem::NONE))?;
        buf.push_command(&self.sequencer.naked_page_addr(op, page))
    }

    /// Split `len` bytes into transfer-unit pieces: (offset, size, is last)
    fn pieces(&self, len: usize) -> impl Iterator<Item = (usize, u16, bool)> + '_ {
        (0..len)
            .step_by(self.mtu)
            .map(move |off| (off, (len - off).min(self.mtu) as u16, off + self.mtu >= len))
    }

    fn read_chunk(&self, buf: &mut DescriptorBuffer, data: u32, index: usize, chunk: usize) -> Result<()> {
        let len = self.geo.transfer_len(chunk);
        let base = data + (chunk * self.geo.chunk_size()) as u32;

        buf.push(Record::sema(sem::CMD, sem::NONE))?;
        buf.push_command(&self.sequencer.naked_data(false, len))?;
        buf.push(Record::sema(sem::DATA, sem::NONE))?;
        for (off, size, last) in self.pieces(len) {
            buf.push(Record::Wcmd { sem: sem::NONE, size, ddr: base + off as u32 })?;
            buf.push(Record::Wdat { last, size, dev: NDDB })?;
        }

        // Keep this chunk's ECC verdict, then clear it for the next one
        buf.push(Record::Wcmd { sem: sem::NONE, size: 4, ddr: self.scratch.snapshot(index) })?;
        buf.push(Record::Wdat { last: true, size: 4, dev: NDSR })?;
        buf.push(Record::Rcmd { sem: sem::NONE, size: 4, ddr: self.scratch.mask })?;
        buf.push(Record::Rdat { last: true, size: 4, dev: NDSR })
    }

    fn write_chunk(&self, buf: &mut DescriptorBuffer, data: u32, chunk: usize) -> Result<()> {
        let len = self.geo.transfer_len(chunk);
        let base = data + (chunk * self.geo.chunk_size()) as u32;

        buf.push(Record::sema(sem::CMD, sem::NONE))?;
        buf.push_command(&self.sequencer.naked_data(true, len))?;
        buf.push(Record::sema(sem::DATA, sem::NONE))?;
        for (off, size, last) in self.pieces(len) {
            buf.push(Record::Rcmd { sem: sem::NONE, size, ddr: base + off as u32 })?;
            buf.push(Record::Rdat { last, size, dev: NDDB })?;
        }
        Ok(())
    }

    fn status_trailer(&self, buf: &mut DescriptorBuffer) -> Result<()> {
        let ecc = self.geo.ecc_ctrl();
        let status = self.sequencer.build(Opcode::ReadStatus, 0, 0)?;

        buf.push(Record::sema(sem::CMD, sem::NONE))?;
        buf.push(Record::cfgw(NDECCCTRL, ecc & !ndeccctrl::BCH_EN))?;
        for word in &status.words {
            buf.push_command(word)?;
        }
        buf.push(Record::sema(sem::DATA, sem::NONE))?;
        buf.push(Record::Wcmd { sem: sem::COMPLETE, size: 8, ddr: self.scratch.status })?;
        buf.push(Record::Wdat { last: true, size: 8, dev: NDDB })?;
        buf.push(Record::cfgw(NDECCCTRL, ecc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CmdType, ExtType, CMD_STATUS};
    use crate::dma::{decode_stream, staged_commands};
    use crate::geometry::{FlashType, FLASH_TYPES};

    fn geometry(page_size: usize) -> Geometry {
        let base = FLASH_TYPES.iter().find(|f| f.chip_id == 0xdead).unwrap();
        Geometry::new(&FlashType { page_size, ..*base }).unwrap()
    }

    fn compile(geo: &Geometry, mtu: Mtu, plan: TransferPlan) -> Result<Vec<Record>> {
        let compiler = DescriptorCompiler::new(geo, 0, mtu, ScratchLayout::at(0x100));
        let mut buf = DescriptorBuffer::new();
        compiler.compile(&mut buf, &plan)?;
        decode_stream(buf.as_bytes())
    }

    fn plan(op: Opcode, page: u32, planes: u8) -> TransferPlan {
        TransferPlan { op, page, planes, data: 0x10_0000 }
    }

    #[test]
    fn test_program_chunks_and_one_status_read() {
        for page_size in [2048, 4096, 8192] {
            let geo = geometry(page_size);
            let records = compile(&geo, Mtu::B32, plan(Opcode::Program, 5, 1)).unwrap();
            let staged = staged_commands(&records).unwrap();

            let data_phases = staged
                .iter()
                .filter(|(w, ..)| w.cmd_type() == CmdType::Program && w.ext_type() == Some(ExtType::NakedRw))
                .count();
            let status_reads = staged.iter().filter(|(w, ..)| w.cmd_type() == CmdType::Status).count();

            assert_eq!(data_phases, page_size / 2048);
            assert_eq!(status_reads, 1);
            assert_eq!(staged.last().unwrap().0.cmd1, CMD_STATUS);
        }
    }

    #[test]
    fn test_program_transfers_whole_page() {
        let geo = geometry(4096);
        let records = compile(&geo, Mtu::B128, plan(Opcode::Program, 5, 1)).unwrap();

        let moved: usize = records
            .iter()
            .filter_map(|r| match r {
                Record::Rdat { size, dev: NDDB, .. } => Some(*size as usize),
                _ => None,
            })
            .sum();
        assert_eq!(moved, geo.raw_page_len());

        // Pieces never exceed the transfer unit, and every chunk ends on a "last" piece
        let lasts = records
            .iter()
            .filter(|r| matches!(r, Record::Rdat { last: true, dev: NDDB, .. }))
            .count();
        assert_eq!(lasts, 2);
        assert!(records.iter().all(|r| match r {
            Record::Rdat { size, .. } | Record::Rcmd { size, .. } => *size <= 128,
            _ => true,
        }));
    }

    #[test]
    fn test_dual_plane_addresses() {
        let geo = geometry(8192);
        for op in [Opcode::Read, Opcode::Program, Opcode::Erase] {
            let records = compile(&geo, Mtu::B128, plan(op, 3 * 256 + 9, 2)).unwrap();
            let rows: Vec<u32> = staged_commands(&records)
                .unwrap()
                .into_iter()
                .filter(|(w, ..)| w.cmd_type() == CmdType::NakedAddr)
                .map(|(w, addr1, addr2, _)| match op {
                    Opcode::Erase => addr1,
                    _ => {
                        assert_eq!(w.addr_cycles(), 5);
                        (addr1 >> 16) | (addr2 << 16)
                    }
                })
                .collect();

            let first = if op == Opcode::Erase { 3 * 256 } else { 3 * 256 + 9 };
            assert_eq!(rows, [first, first + geo.pages_per_block], "{op:?}");
        }
    }

    #[test]
    fn test_dual_plane_shares_status_read() {
        let geo = geometry(8192);
        let records = compile(&geo, Mtu::B32, plan(Opcode::Program, 0, 2)).unwrap();
        let staged = staged_commands(&records).unwrap();

        let opcodes: Vec<u8> = staged
            .iter()
            .filter(|(w, ..)| w.cmd_type() == CmdType::NakedCmd)
            .map(|(w, ..)| w.cmd1)
            .collect();
        assert_eq!(opcodes, [CMD_SEQIN, CMD_PAGEPROG_PLANE, CMD_SEQIN_PLANE, CMD_PAGEPROG]);
        assert_eq!(staged.iter().filter(|(w, ..)| w.cmd_type() == CmdType::Status).count(), 1);
    }

    #[test]
    fn test_status_read_runs_without_bch() {
        let geo = geometry(8192);
        let records = compile(&geo, Mtu::B32, plan(Opcode::Erase, 0, 1)).unwrap();

        let ecc_writes: Vec<(usize, u32)> = records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| match *r {
                Record::Cfgw { reg: NDECCCTRL, value } => Some((i, value)),
                _ => None,
            })
            .collect();
        assert_eq!(ecc_writes.len(), 2);
        assert_eq!(ecc_writes[0].1, geo.ecc_ctrl() & !ndeccctrl::BCH_EN);
        assert_eq!(ecc_writes[1].1, geo.ecc_ctrl());
        assert_eq!(ecc_writes[1].0, records.len() - 1);

        // The status word is the only thing drained into the status slot, and it signals completion
        let drains: Vec<_> = records
            .iter()
            .filter(|r| matches!(r, Record::Wcmd { sem: sem::COMPLETE, .. }))
            .collect();
        assert_eq!(drains, [&Record::Wcmd { sem: sem::COMPLETE, size: 8, ddr: 0x100 }]);
    }

    #[test]
    fn test_read_snapshots_each_chunk() {
        let geo = geometry(8192);
        let records = compile(&geo, Mtu::B128, plan(Opcode::Read, 0, 2)).unwrap();
        let slots: Vec<u32> = records
            .windows(2)
            .filter_map(|w| match (w[0], w[1]) {
                (Record::Wcmd { ddr, .. }, Record::Wdat { dev: NDSR, .. }) => Some(ddr),
                _ => None,
            })
            .collect();
        let layout = ScratchLayout::at(0x100);
        assert_eq!(slots, (0..8).map(|i| layout.snapshot(i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_oversized_stream() {
        let geo = geometry(8192);
        assert!(matches!(
            compile(&geo, Mtu::B8, plan(Opcode::Program, 0, 2)),
            Err(NfcError::DescriptorOverflow(_))
        ));
        assert!(compile(&geo, Mtu::B32, plan(Opcode::Program, 0, 2)).is_ok());
    }

    #[test]
    fn test_rejects_non_page_ops() {
        let geo = geometry(2048);
        assert!(matches!(
            compile(&geo, Mtu::B32, plan(Opcode::ReadId, 0, 1)),
            Err(NfcError::InvalidOperation(0x90))
        ));
        assert!(compile(&geo, Mtu::B32, plan(Opcode::Read, 0, 3)).is_err());
    }
}
