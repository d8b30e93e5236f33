//! The controller driver: identifies chips, runs page operations over DMA or PIO, and recovers
//! from uncorrectable reads.
//!
//! All operations go through one lock, so at most one logical operation is in flight across every
//! chip select. The descriptor buffer and scratch words of each chip select are reused by every
//! operation on it, which is only sound under that lock.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::blank::BlankPageClassifier;
use crate::command::{CommandSequence, CommandSequencer, Opcode, VendorSequence, VendorStep};
use crate::dma::{
    ChannelSynchronizer, DescriptorBuffer, DescriptorCompiler, Mtu, ScratchLayout, TransferPlan, DESCRIPTOR_BUFFER_SIZE,
};
use crate::error::{NfcError, Result};
use crate::geometry::{lookup, FlashType, Geometry};
use crate::hw::{DmaDirection, DmaRegion, Hardware};
use crate::nand::PageUtil;
use crate::pio::{PioData, PioOutcome, PioStateMachine};
use crate::regs::{dump_registers, ndcr, ndsr, NDCR, NDECCCTRL, NDSR, NDTR0CS0, NDTR1CS0};
use crate::retry::table::{decode_cached, encode_cached, otp_read_sequence};
use crate::retry::{RetryKind, RetryPort, RetryStrategy, RetryTable, VendorExec};
use crate::slc::{with_reliability_mode, SlcModeRegisters, SlcPolicy};
use crate::util::Deadline;

pub const CHIP_SELECTS: u8 = 2;

const HISTORY_LEN: usize = 32;
/// Largest transfer the bounce buffer has to hold: two planes of the biggest raw page
const BOUNCE_SIZE: usize = 2 * (8192 + 64);
/// Program/erase failure bit of the status byte
const STATUS_FAIL: u8 = 0x01;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub use_dma: bool,
    pub mtu: Mtu,
    /// Timing registers, written whenever the chip select changes
    pub ndtr0: u32,
    pub ndtr1: u32,
    /// Bus arbitration enable. Write-only: never read back.
    pub arbitration: bool,
    /// Budget for every hardware poll
    pub timeout: Duration,
    /// Pause on each side of a pseudo-SLC mode switch
    pub settle: Duration,
    /// Page reserved for the cached read-retry table, if any
    pub retry_table_page: Option<u32>,
    /// Platform flash types, matched before the built-in table
    pub flash_types: Vec<FlashType>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            use_dma: true,
            mtu: Mtu::default(),
            ndtr0: 0x84840A12,
            ndtr1: 0x00208662,
            arbitration: false,
            timeout: Duration::from_millis(200),
            settle: Duration::from_micros(10),
            retry_table_page: None,
            flash_types: Vec::new(),
        }
    }
}

/// Which chip select, how many planes, and whether pages are pseudo-SLC addressed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Target {
    pub cs: u8,
    pub planes: u8,
    pub slc: Option<SlcPolicy>,
}

impl Target {
    pub fn new(cs: u8) -> Self {
        Self { cs, planes: 1, slc: None }
    }

    pub fn planes(self, planes: u8) -> Self {
        Self { planes, ..self }
    }

    pub fn slc(self, policy: SlcPolicy) -> Self {
        Self {
            slc: Some(policy),
            ..self
        }
    }
}

/// How a successful read went
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub corrected_bits: u32,
    pub bad_block_events: u32,
    pub retries: u32,
    /// The page was erased; the buffers were filled with 0xFF
    pub blank: bool,
    ecc_strength: u32,
}

impl ReadOutcome {
    /// Did correction get close enough to the ECC limit that the page should be rewritten?
    pub fn exceeds_threshold(&self) -> bool {
        self.ecc_strength > 0 && 2 * self.corrected_bits >= self.ecc_strength
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Path {
    Dma,
    Pio,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub op: Opcode,
    pub cs: u8,
    pub page: u32,
    pub planes: u8,
    pub path: Path,
    pub duration: Duration,
    pub ok: bool,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cs{} {:?} page {} x{} via {:?} in {:?}{}",
            self.cs,
            self.op,
            self.page,
            self.planes,
            self.path,
            self.duration,
            if self.ok { "" } else { " FAILED" }
        )
    }
}

/// Per chip select DMA resources
#[derive(Debug, Copy, Clone)]
struct Arena {
    descriptors: DmaRegion,
    scratch: ScratchLayout,
}

#[derive(Debug)]
struct Chip {
    flash: FlashType,
    geo: Geometry,
    ndcr: u32,
    retry: RetryStrategy,
    slc: Option<SlcModeRegisters>,
    arena: Option<Arena>,
}

struct Inner<H> {
    hw: H,
    config: ControllerConfig,
    sync: ChannelSynchronizer,
    dma_ready: bool,
    chips: [Option<Chip>; CHIP_SELECTS as usize],
    /// DMA resources of chip selects whose last attach failed, kept for the next attempt
    parked: [Option<Arena>; CHIP_SELECTS as usize],
    selected: Option<u8>,
    bounce: Option<DmaRegion>,
    history: VecDeque<HistoryEntry>,
}

pub struct NandController<H: Hardware> {
    inner: Mutex<Inner<H>>,
}

impl<H: Hardware> NandController<H> {
    pub fn new(hw: H, config: ControllerConfig) -> Self {
        let sync = ChannelSynchronizer::new(config.mtu, config.timeout);
        Self {
            inner: Mutex::new(Inner {
                hw,
                config,
                sync,
                dma_ready: false,
                chips: Default::default(),
                parked: Default::default(),
                selected: None,
                bounce: None,
                history: VecDeque::with_capacity(HISTORY_LEN),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<H>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset and identify the chip on `cs`, then load whatever it needs for recovery
    pub fn attach(&self, cs: u8) -> Result<FlashType> {
        self.lock().attach(cs)
    }

    pub fn geometry(&self, cs: u8) -> Result<Geometry> {
        Ok(self.lock().chip(cs)?.geo)
    }

    pub fn chip(&self, cs: u8) -> Result<FlashType> {
        Ok(self.lock().chip(cs)?.flash)
    }

    pub fn retry_strategy(&self, cs: u8) -> Result<RetryStrategy> {
        Ok(self.lock().chip(cs)?.retry.clone())
    }

    /// Read one page (per plane) into `data`, and its spare area into `oob` unless that is empty
    pub fn read_page(&self, target: Target, page: u32, data: &mut [u8], oob: &mut [u8]) -> Result<ReadOutcome> {
        self.lock().read(target, page, data, oob)
    }

    /// Program one page (per plane). An empty `oob` programs an all-ones spare area.
    pub fn write_page(&self, target: Target, page: u32, data: &[u8], oob: &[u8]) -> Result<()> {
        self.lock().write(target, page, data, oob)
    }

    /// Erase the block holding `page`
    pub fn erase_block(&self, target: Target, page: u32) -> Result<()> {
        self.lock().erase(target, page)
    }

    pub fn mark_bad(&self, target: Target, page: u32) -> Result<()> {
        self.lock().mark_bad(target, page)
    }

    pub fn is_bad(&self, target: Target, page: u32) -> Result<bool> {
        self.lock().is_bad(target, page)
    }

    /// Run a single raw operation by its first opcode byte and return what it read back
    pub fn command(&self, cs: u8, opcode: u8, column: u32, page: u32) -> Result<Vec<u8>> {
        self.lock().command(cs, opcode, column, page)
    }

    /// Recent operations, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.iter().copied().collect()
    }

    pub fn hardware<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.lock().hw)
    }

    pub fn into_hardware(self) -> H {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner).hw
    }
}

impl<H: Hardware> Inner<H> {
    fn chip(&self, cs: u8) -> Result<&Chip> {
        self.chips
            .get(cs as usize)
            .and_then(Option::as_ref)
            .ok_or(NfcError::NotAttached(cs))
    }

    /// Geometry and NDCR to talk to `cs` with, before or after identification
    fn layout(&self, cs: u8) -> (Geometry, u32) {
        match self.chip(cs) {
            Ok(chip) => (chip.geo, chip.ndcr),
            Err(_) => {
                let geo = Geometry::unidentified();
                (geo, geo.ndcr(self.config.arbitration))
            }
        }
    }

    fn select(&mut self, cs: u8) {
        if self.selected != Some(cs) {
            debug!("selecting chip select {cs}");
            self.hw.write32(NDTR0CS0, self.config.ndtr0);
            self.hw.write32(NDTR1CS0, self.config.ndtr1);
            self.selected = Some(cs);
        }
    }

    fn attach(&mut self, cs: u8) -> Result<FlashType> {
        if cs >= CHIP_SELECTS {
            return Err(NfcError::NotAttached(cs));
        }
        let slot = cs as usize;
        let arena = self.chips[slot].take().and_then(|chip| chip.arena).or(self.parked[slot].take());

        let flash = match self.identify(cs) {
            Ok(flash) => flash,
            Err(err) => {
                self.parked[slot] = arena;
                return Err(err);
            }
        };
        let geo = Geometry::new(&flash)?;

        let arena = match (self.config.use_dma, arena) {
            (false, arena) => {
                self.parked[slot] = arena;
                None
            }
            (true, Some(arena)) => Some(arena),
            (true, None) => Some(self.arena()?),
        };
        self.chips[slot] = Some(Chip {
            flash,
            geo,
            ndcr: geo.ndcr(self.config.arbitration),
            retry: RetryStrategy::None,
            slc: None,
            arena,
        });

        match self.recovery_setup(cs, &flash) {
            Ok((retry, slc)) => {
                if let Some(chip) = self.chips[slot].as_mut() {
                    chip.retry = retry;
                    chip.slc = slc;
                }
                Ok(flash)
            }
            Err(err) => {
                self.parked[slot] = self.chips[slot].take().and_then(|chip| chip.arena);
                Err(err)
            }
        }
    }

    /// Reset the chip on `cs` and match its id against the known flash types
    fn identify(&mut self, cs: u8) -> Result<FlashType> {
        let initial = Geometry::unidentified();
        let ndcr = initial.ndcr(self.config.arbitration);
        let sequencer = CommandSequencer::new(&initial, cs);

        self.run_pio(cs, &initial, ndcr, &sequencer.build(Opcode::Reset, 0, 0)?, PioData::None, false)?;
        let mut id = [0u8; 8];
        self.run_pio(
            cs,
            &initial,
            ndcr,
            &sequencer.build(Opcode::ReadId, 0, 0)?,
            PioData::Read(&mut id),
            false,
        )?;

        let flash = *lookup(&self.config.flash_types, &id[..initial.read_id_bytes as usize])?;
        let geo = Geometry::new(&flash)?;
        info!(
            "chip select {cs}: {} ({:#06x}/{:#06x}), {} blocks of {} x {}+{} bytes, ECC strength {}",
            flash.name,
            flash.chip_id,
            flash.ext_id,
            geo.blocks,
            geo.pages_per_block,
            geo.page_size,
            geo.oob_size,
            geo.ecc_strength,
        );
        Ok(flash)
    }

    fn arena(&mut self) -> Result<Arena> {
        if !self.dma_ready {
            self.sync.init(&mut self.hw)?;
            self.dma_ready = true;
        }
        let descriptors = self.hw.alloc_coherent(DESCRIPTOR_BUFFER_SIZE)?;
        let scratch = ScratchLayout::at(self.hw.alloc_coherent(ScratchLayout::SIZE)?.addr);
        self.hw.write_bus(scratch.mask, &ndsr::CHUNK_CLEAR.to_le_bytes())?;
        Ok(Arena { descriptors, scratch })
    }

    fn recovery_setup(&mut self, cs: u8, flash: &FlashType) -> Result<(RetryStrategy, Option<SlcModeRegisters>)> {
        let retry = match RetryKind::for_flash(flash) {
            RetryKind::None => RetryStrategy::None,
            RetryKind::Index { cycles } => RetryStrategy::IndexBased { cycles },
            RetryKind::Table => match self.load_retry_table(cs) {
                Ok(table) => RetryStrategy::TableBased(table),
                Err(err) if err.is_timeout() => return Err(err),
                Err(err) => {
                    warn!("chip select {cs}: no read-retry table, continuing without: {err}");
                    RetryStrategy::None
                }
            },
        };

        let slc = if flash.has_slc_registers() {
            Some(SlcModeRegisters::read(&mut ChipPort { inner: self, cs })?)
        } else {
            None
        };
        Ok((retry, slc))
    }

    /// Fetch the retry table from the cache page, or from OTP (caching it if the page is free).
    /// Either way the chip is left at row 0.
    fn load_retry_table(&mut self, cs: u8) -> Result<RetryTable> {
        let geo = self.chip(cs)?.geo;
        let cache = self.config.retry_table_page;
        let mut cache_free = false;

        if let Some(page) = cache {
            let mut raw = vec![0u8; geo.raw_page_len()];
            let verdict = self.transfer(cs, Opcode::Read, page, 1, PioData::Read(&mut raw))?;
            if !verdict.uncorrectable {
                if let Some(image) = decode_cached(&raw[..geo.page_size]) {
                    match RetryTable::from_otp(image) {
                        Ok(table) => {
                            info!("chip select {cs}: {}-row read-retry table from page {page}", table.len());
                            self.vendor_exec(cs, &table.setter(0))?;
                            return Ok(table);
                        }
                        Err(err) => warn!("page {page} holds an unusable read-retry table: {err}"),
                    }
                }
                cache_free = raw.is_erased();
            } else {
                cache_free = BlankPageClassifier::new(geo.ecc_strength).classify(&mut raw, geo.page_size, geo.oob_size);
            }
        }

        let image = self.vendor_exec(cs, &otp_read_sequence())?;
        let table = RetryTable::from_otp(&image)?;
        info!("chip select {cs}: {}-row read-retry table from OTP", table.len());
        self.vendor_exec(cs, &table.setter(0))?;

        if let (Some(page), true) = (cache, cache_free) {
            let mut raw = encode_cached(&image, geo.page_size)?;
            raw.resize(geo.raw_page_len(), 0xFF);
            match self.transfer(cs, Opcode::Program, page, 1, PioData::Write(&raw)) {
                Ok(_) => info!("read-retry table cached at page {page}"),
                Err(err) => warn!("could not cache the read-retry table at page {page}: {err}"),
            }
        }
        Ok(table)
    }

    /// Stop the controller, set up ECC, clear status and start it again, then let the PIO state
    /// machine run `seq`
    fn run_pio(
        &mut self,
        cs: u8,
        geo: &Geometry,
        ndcr: u32,
        seq: &CommandSequence,
        data: PioData<'_>,
        ecc: bool,
    ) -> Result<PioOutcome> {
        self.select(cs);
        let ecc = ecc && geo.ecc_strength > 0;

        self.hw.write32(NDCR, 0);
        self.hw.write32(NDECCCTRL, if ecc { geo.ecc_ctrl() } else { 0 });
        self.hw.write32(NDSR, ndsr::MASK);
        self.hw.write32(NDCR, ndcr | ndcr::ND_RUN | if ecc { ndcr::ECC_EN } else { 0 });

        let deadline = Deadline::after(self.config.timeout);
        let result = PioStateMachine::new(&mut self.hw, seq, cs, geo.is_bch()).run(data, &deadline);
        if let Err(err) = &result {
            if err.is_timeout() {
                error!("chip select {cs}: PIO {:?} failed: {err}", seq.op);
                dump_registers(&mut self.hw);
            }
        }
        result
    }

    /// Run a vendor exchange step by step, ECC off
    fn vendor_exec(&mut self, cs: u8, seq: &VendorSequence) -> Result<Vec<u8>> {
        let (geo, ndcr) = self.layout(cs);
        let sequencer = CommandSequencer::new(&geo, cs);
        let mut out = Vec::new();

        for step in seq.steps() {
            let words = sequencer.vendor_step(step)?;
            match step {
                VendorStep::Write(bytes) => {
                    self.run_pio(cs, &geo, ndcr, &words, PioData::Write(bytes), false)?;
                }
                VendorStep::Read(len) => {
                    let mut buf = vec![0u8; *len];
                    self.run_pio(cs, &geo, ndcr, &words, PioData::Read(&mut buf), false)?;
                    out.extend(buf);
                }
                _ => {
                    self.run_pio(cs, &geo, ndcr, &words, PioData::None, false)?;
                }
            }
        }
        Ok(out)
    }

    /// One page operation on `planes` planes, over DMA when possible
    fn transfer(&mut self, cs: u8, op: Opcode, page: u32, planes: u8, data: PioData<'_>) -> Result<PioOutcome> {
        let chip = self.chip(cs)?;
        let geo = chip.geo;
        let dma = self.config.use_dma
            && chip.arena.is_some()
            && CommandSequencer::new(&geo, cs).build(op, 0, page)?.dma_eligible;

        let started = Instant::now();
        let (path, result) = if dma {
            (Path::Dma, self.run_dma(cs, op, page, planes, data))
        } else {
            (Path::Pio, self.pio_planes(cs, op, page, planes, data))
        };
        self.record(
            HistoryEntry {
                op,
                cs,
                page,
                planes,
                path,
                duration: started.elapsed(),
                ok: result.is_ok(),
            },
            result.as_ref().err(),
        );
        result
    }

    fn record(&mut self, entry: HistoryEntry, err: Option<&NfcError>) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(entry);

        if err.is_some_and(NfcError::is_timeout) {
            error!("last {} operations:", self.history.len());
            for entry in &self.history {
                error!("  {entry}");
            }
        }
    }

    /// PIO moves one plane at a time; each program or erase gets its own status check
    fn pio_planes(&mut self, cs: u8, op: Opcode, page: u32, planes: u8, mut data: PioData<'_>) -> Result<PioOutcome> {
        let chip = self.chip(cs)?;
        let (geo, ndcr) = (chip.geo, chip.ndcr);
        let raw_len = geo.raw_page_len();
        if planes > 1 {
            debug!("splitting {planes}-plane {op:?} into single-plane PIO operations");
        }

        let mut outcome = PioOutcome::default();
        for plane in 0..planes as usize {
            let plane_page = page + plane as u32 * geo.pages_per_block;
            let span = plane * raw_len..(plane + 1) * raw_len;
            let part = match &mut data {
                PioData::None => PioData::None,
                PioData::Read(buf) => PioData::Read(&mut buf[span]),
                PioData::Write(buf) => PioData::Write(&buf[span]),
            };

            let seq = CommandSequencer::new(&geo, cs).build(op, 0, plane_page)?;
            let step = self.run_pio(cs, &geo, ndcr, &seq, part, op.uses_ecc())?;
            outcome.uncorrectable |= step.uncorrectable;
            outcome.corrected_bits += step.corrected_bits;
            outcome.bad_block_events += step.bad_block_events;

            if matches!(op, Opcode::Program | Opcode::Erase) {
                let status = self.read_status(cs, &geo, ndcr)?;
                if status & STATUS_FAIL != 0 {
                    return Err(failure(op, &geo, plane_page));
                }
            }
        }
        Ok(outcome)
    }

    fn read_status(&mut self, cs: u8, geo: &Geometry, ndcr: u32) -> Result<u8> {
        let seq = CommandSequencer::new(geo, cs).build(Opcode::ReadStatus, 0, 0)?;
        let mut status = [0u8; 8];
        self.run_pio(cs, geo, ndcr, &seq, PioData::Read(&mut status), false)?;
        Ok(status[0])
    }

    fn run_dma(&mut self, cs: u8, op: Opcode, page: u32, planes: u8, mut data: PioData<'_>) -> Result<PioOutcome> {
        let len = match &data {
            PioData::None => 0,
            PioData::Read(buf) => buf.len(),
            PioData::Write(buf) => buf.len(),
        };
        let dir = match data {
            PioData::Write(_) => DmaDirection::ToDevice,
            _ => DmaDirection::FromDevice,
        };

        let (region, mapped) = if len == 0 {
            (None, false)
        } else {
            match self.hw.map_streaming(len, dir) {
                Some(region) => (Some(region), true),
                None => {
                    warn!("could not map {len} bytes for DMA, using the bounce buffer");
                    (Some(self.bounce(len)?), false)
                }
            }
        };

        let result = self.dma_transfer(cs, op, page, planes, region, &mut data);
        if let (Some(region), true) = (region, mapped) {
            self.hw.unmap_streaming(region);
        }
        result
    }

    fn bounce(&mut self, len: usize) -> Result<DmaRegion> {
        if len > BOUNCE_SIZE {
            return Err(NfcError::DmaMapping);
        }
        let region = match self.bounce {
            Some(region) => region,
            None => {
                let region = self.hw.alloc_coherent(BOUNCE_SIZE).map_err(|err| {
                    error!("no bounce buffer: {err}");
                    NfcError::DmaMapping
                })?;
                self.bounce = Some(region);
                region
            }
        };
        Ok(DmaRegion { addr: region.addr, len })
    }

    fn dma_transfer(
        &mut self,
        cs: u8,
        op: Opcode,
        page: u32,
        planes: u8,
        region: Option<DmaRegion>,
        data: &mut PioData<'_>,
    ) -> Result<PioOutcome> {
        let chip = self.chip(cs)?;
        let (geo, ndcr) = (chip.geo, chip.ndcr);
        let arena = chip.arena.ok_or(NfcError::DmaMapping)?;
        self.select(cs);

        let addr = region.map_or(0, |r| r.addr);
        if let PioData::Write(bytes) = data {
            self.hw.write_bus(addr, bytes)?;
        }

        let mut control = ndcr | ndcr::ND_RUN | ndcr::DMA_EN;
        if op.uses_ecc() && geo.ecc_strength > 0 {
            control |= ndcr::ECC_EN;
        }

        let compiler = DescriptorCompiler::new(&geo, cs, self.sync.mtu(), arena.scratch);
        let mut buf = DescriptorBuffer::new();
        compiler.start(&mut buf, control)?;
        compiler.compile(&mut buf, &TransferPlan { op, page, planes, data: addr })?;

        let snapshots = if op.is_read() { planes as usize * geo.chunks() } else { 0 };
        self.hw.write_bus(arena.scratch.snapshots, &vec![0; 4 * snapshots])?;
        self.hw.write_bus(arena.descriptors.addr, buf.as_bytes())?;
        debug!("chip select {cs}: {op:?} page {page} x{planes}, {} descriptor bytes", buf.len());

        self.sync.submit(
            &mut self.hw,
            DmaRegion {
                addr: arena.descriptors.addr,
                len: buf.len(),
            },
        )?;

        let mut outcome = PioOutcome::default();
        let mut words = vec![0u8; 4 * snapshots];
        self.hw.read_bus(arena.scratch.snapshots, &mut words)?;
        for word in words.chunks_exact(4) {
            let status = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            if status & ndsr::DBERR != 0 {
                outcome.uncorrectable = true;
            } else if status & ndsr::SBERR != 0 {
                outcome.corrected_bits += if geo.is_bch() { ndsr::err_cnt(status).max(1) } else { 1 };
            }
            if status & ndsr::bad_block(cs) != 0 {
                outcome.bad_block_events += 1;
            }
        }

        let mut status = [0u8; 8];
        self.hw.read_bus(arena.scratch.status, &mut status)?;
        if matches!(op, Opcode::Program | Opcode::Erase) && status[0] & STATUS_FAIL != 0 {
            return Err(failure(op, &geo, page));
        }

        if let PioData::Read(out) = data {
            self.hw.read_bus(addr, out)?;
        }
        Ok(outcome)
    }

    /// Check a target against the attached chip and find its first physical page
    fn resolve(&self, target: Target, page: u32) -> Result<(Geometry, u32, Option<SlcModeRegisters>)> {
        let chip = self.chip(target.cs)?;
        let geo = chip.geo;

        match target.planes {
            1 => {}
            2 if geo.dual_plane => {}
            n => {
                return Err(NfcError::UnsupportedConfig(format!("{n} planes on {}", chip.flash.name)));
            }
        }

        let physical = match target.slc {
            None => page,
            Some(policy) => {
                policy.check(geo.pages_per_block)?;
                if chip.slc.is_none() {
                    return Err(NfcError::UnsupportedConfig(format!("{} has no pseudo-SLC mode", chip.flash.name)));
                }
                policy
                    .translate(page, geo.pages_per_block)
                    .ok_or(NfcError::OutOfRange(page))?
            }
        };

        let last = (target.planes as u32 - 1)
            .checked_mul(geo.pages_per_block)
            .and_then(|offset| physical.checked_add(offset));
        match last {
            Some(last) if last < geo.page_count() => Ok((geo, physical, chip.slc)),
            _ => Err(NfcError::OutOfRange(page)),
        }
    }

    /// Run `op` inside a pseudo-SLC mode switch when the target's policy asks for one
    fn bracketed<T>(
        &mut self,
        target: Target,
        regs: Option<SlcModeRegisters>,
        op: Opcode,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        match (target.slc, regs) {
            (Some(policy), Some(regs)) if policy.brackets(op) => {
                let settle = self.config.settle;
                let mut port = ChipPort { inner: self, cs: target.cs };
                with_reliability_mode(&mut port, &regs, settle, |port| f(&mut *port.inner))
            }
            _ => f(self),
        }
    }

    fn read_raw(&mut self, target: Target, regs: Option<SlcModeRegisters>, page: u32, raw: &mut [u8]) -> Result<PioOutcome> {
        self.bracketed(target, regs, Opcode::Read, |inner| {
            inner.transfer(target.cs, Opcode::Read, page, target.planes, PioData::Read(raw))
        })
    }

    fn read(&mut self, target: Target, page: u32, data: &mut [u8], oob: &mut [u8]) -> Result<ReadOutcome> {
        let (geo, physical, regs) = self.resolve(target, page)?;
        let planes = target.planes as usize;
        check_buffers(&geo, planes, data.len(), oob.len())?;

        let mut raw = vec![0u8; planes * geo.raw_page_len()];
        let mut verdict = self.read_raw(target, regs, physical, &mut raw)?;
        let mut outcome = ReadOutcome {
            ecc_strength: geo.ecc_strength,
            ..Default::default()
        };

        if verdict.uncorrectable {
            if BlankPageClassifier::new(geo.ecc_strength).classify(&mut raw, geo.page_size, geo.oob_size) {
                outcome.blank = true;
                verdict.corrected_bits = 0;
            } else {
                let (retries, retried) = self.recover(target, regs, physical, &mut raw)?;
                outcome.retries = retries;
                verdict = retried;
            }
        }
        outcome.corrected_bits = verdict.corrected_bits;
        outcome.bad_block_events = verdict.bad_block_events;

        for (plane, raw) in raw.chunks(geo.raw_page_len()).enumerate() {
            let (page_data, spare) = raw.split_at(geo.page_size);
            data[plane * geo.page_size..(plane + 1) * geo.page_size].copy_from_slice(page_data);
            if !oob.is_empty() {
                oob[plane * geo.oob_size..(plane + 1) * geo.oob_size].copy_from_slice(spare);
            }
        }
        Ok(outcome)
    }

    /// Hand the chip's retry strategy a port bound to this read
    fn recover(
        &mut self,
        target: Target,
        regs: Option<SlcModeRegisters>,
        page: u32,
        raw: &mut [u8],
    ) -> Result<(u32, PioOutcome)> {
        let cs = target.cs as usize;
        let mut strategy = match self.chips[cs].as_mut() {
            Some(chip) => mem::replace(&mut chip.retry, RetryStrategy::None),
            None => return Err(NfcError::NotAttached(target.cs)),
        };

        let mut port = RetryRead {
            inner: self,
            target,
            regs,
            page,
            raw,
            last: PioOutcome::default(),
        };
        let result = strategy.recover(page, &mut port);
        let last = port.last;

        if let Some(chip) = self.chips[cs].as_mut() {
            chip.retry = strategy;
        }
        result.map(|retries| (retries, last))
    }

    fn write(&mut self, target: Target, page: u32, data: &[u8], oob: &[u8]) -> Result<()> {
        let (geo, physical, regs) = self.resolve(target, page)?;
        let planes = target.planes as usize;
        check_buffers(&geo, planes, data.len(), oob.len())?;

        let mut raw = Vec::with_capacity(planes * geo.raw_page_len());
        for plane in 0..planes {
            raw.extend_from_slice(&data[plane * geo.page_size..(plane + 1) * geo.page_size]);
            match oob {
                [] => raw.resize(raw.len() + geo.oob_size, 0xFF),
                oob => raw.extend_from_slice(&oob[plane * geo.oob_size..(plane + 1) * geo.oob_size]),
            }
        }

        self.bracketed(target, regs, Opcode::Program, |inner| {
            inner
                .transfer(target.cs, Opcode::Program, physical, target.planes, PioData::Write(&raw))
                .map(drop)
        })
    }

    fn erase(&mut self, target: Target, page: u32) -> Result<()> {
        let (geo, physical, regs) = self.resolve(target, page)?;
        let start = geo.block_start(physical);

        self.bracketed(target, regs, Opcode::Erase, |inner| {
            inner
                .transfer(target.cs, Opcode::Erase, start, target.planes, PioData::None)
                .map(drop)
        })
    }

    /// Zero the marker bytes in the spare area of the block's first page (of every plane)
    fn mark_bad(&mut self, target: Target, page: u32) -> Result<()> {
        let (geo, physical, _) = self.resolve(target, page)?;
        let start = geo.block_start(physical);
        warn!("chip select {}: marking block {} bad", target.cs, start / geo.pages_per_block);

        let mut raw = vec![0xFFu8; target.planes as usize * geo.raw_page_len()];
        for plane in raw.chunks_mut(geo.raw_page_len()) {
            plane[geo.page_size..geo.page_size + 2].fill(0);
        }
        self.transfer(target.cs, Opcode::Program, start, target.planes, PioData::Write(&raw))
            .map(drop)
    }

    fn is_bad(&mut self, target: Target, page: u32) -> Result<bool> {
        let (geo, physical, _) = self.resolve(target, page)?;
        let start = geo.block_start(physical);

        let mut raw = vec![0u8; target.planes as usize * geo.raw_page_len()];
        let verdict = match self.transfer(target.cs, Opcode::Read, start, target.planes, PioData::Read(&mut raw)) {
            Ok(verdict) => verdict,
            Err(err) if err.is_timeout() => return Err(err),
            Err(err) => {
                warn!("block at page {start} is unreadable, treating it as bad: {err}");
                return Ok(true);
            }
        };

        if verdict.bad_block_events > 0 {
            return Ok(true);
        }
        if verdict.uncorrectable
            && BlankPageClassifier::new(geo.ecc_strength).classify(&mut raw, geo.page_size, geo.oob_size)
        {
            return Ok(false);
        }
        Ok(raw
            .chunks(geo.raw_page_len())
            .any(|plane| plane[geo.page_size..geo.page_size + 2] != [0xFF, 0xFF]))
    }

    fn command(&mut self, cs: u8, opcode: u8, column: u32, page: u32) -> Result<Vec<u8>> {
        let op = Opcode::try_from(opcode)?;
        if matches!(op, Opcode::Program | Opcode::Erase) {
            return Err(NfcError::InvalidOperation(opcode));
        }
        if cs >= CHIP_SELECTS {
            return Err(NfcError::NotAttached(cs));
        }

        let (geo, ndcr) = self.layout(cs);
        let seq = CommandSequencer::new(&geo, cs).build(op, column, page)?;
        let mut out = vec![0u8; seq.data_len()];

        let started = Instant::now();
        let result = self.run_pio(cs, &geo, ndcr, &seq, PioData::Read(&mut out), op.uses_ecc());
        self.record(
            HistoryEntry {
                op,
                cs,
                page,
                planes: 1,
                path: Path::Pio,
                duration: started.elapsed(),
                ok: result.is_ok(),
            },
            result.as_ref().err(),
        );
        result?;
        Ok(out)
    }
}

fn failure(op: Opcode, geo: &Geometry, page: u32) -> NfcError {
    match op {
        Opcode::Erase => NfcError::EraseFailed(geo.block_start(page)),
        _ => NfcError::ProgramFailed(page),
    }
}

fn check_buffers(geo: &Geometry, planes: usize, data: usize, oob: usize) -> Result<()> {
    if data != planes * geo.page_size || (oob != 0 && oob != planes * geo.oob_size) {
        return Err(NfcError::UnsupportedConfig(format!(
            "{data}+{oob} byte buffers for {planes} plane(s) of {}+{}",
            geo.page_size, geo.oob_size
        )));
    }
    Ok(())
}

/// Vendor exchanges with one chip select
struct ChipPort<'a, H: Hardware> {
    inner: &'a mut Inner<H>,
    cs: u8,
}

impl<H: Hardware> VendorExec for ChipPort<'_, H> {
    fn exec(&mut self, seq: &VendorSequence) -> Result<Vec<u8>> {
        self.inner.vendor_exec(self.cs, seq)
    }
}

/// One failed read, replayable by the retry strategy
struct RetryRead<'a, H: Hardware> {
    inner: &'a mut Inner<H>,
    target: Target,
    regs: Option<SlcModeRegisters>,
    page: u32,
    raw: &'a mut [u8],
    last: PioOutcome,
}

impl<H: Hardware> VendorExec for RetryRead<'_, H> {
    fn exec(&mut self, seq: &VendorSequence) -> Result<Vec<u8>> {
        self.inner.vendor_exec(self.target.cs, seq)
    }
}

impl<H: Hardware> RetryPort for RetryRead<'_, H> {
    fn reread(&mut self) -> Result<bool> {
        self.last = self.inner.read_raw(self.target, self.regs, self.page, self.raw)?;
        Ok(!self.last.uncorrectable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::FLASH_TYPES;
    use crate::sim::SimHardware;

    fn flash(id: u16, ext: u16) -> FlashType {
        *FLASH_TYPES.iter().find(|f| f.chip_id == id && f.ext_id == ext).unwrap()
    }

    fn attached(id: u16, ext: u16, config: ControllerConfig) -> NandController<SimHardware> {
        let ctrl = NandController::new(SimHardware::with_chip(flash(id, ext)).unwrap(), config);
        ctrl.attach(0).unwrap();
        ctrl
    }

    fn pio() -> ControllerConfig {
        ControllerConfig {
            use_dma: false,
            ..Default::default()
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn write_read(ctrl: &NandController<SimHardware>, target: Target, page: u32) -> (Vec<u8>, Vec<u8>, ReadOutcome) {
        let geo = ctrl.geometry(target.cs).unwrap();
        let planes = target.planes as usize;
        let data = pattern(planes * geo.page_size, page as u8);
        ctrl.write_page(target, page, &data, &[]).unwrap();

        let mut out = vec![0; data.len()];
        let mut oob = vec![0; planes * geo.oob_size];
        let outcome = ctrl.read_page(target, page, &mut out, &mut oob).unwrap();
        (data, out, outcome)
    }

    #[test]
    fn test_attach_identifies_chip() {
        let ctrl = attached(0xdaec, 0xffff, Default::default());
        let geo = ctrl.geometry(0).unwrap();
        assert_eq!(geo.page_size, 2048);
        assert_eq!(geo.pages_per_block, 64);
        assert_eq!(ctrl.chip(0).unwrap().chip_id, 0xdaec);
        assert!(matches!(ctrl.geometry(1), Err(NfcError::NotAttached(1))));

        // Timings were programmed on the first chip select switch
        ctrl.hardware(|hw| assert_eq!(hw.nfc().register(NDTR0CS0), Some(0x84840A12)));
    }

    #[test]
    fn test_attach_empty_chip_select() {
        let ctrl = NandController::new(SimHardware::new(), Default::default());
        assert!(matches!(ctrl.attach(0), Err(NfcError::UnknownChip(0, 0))));
        assert!(matches!(ctrl.attach(2), Err(NfcError::NotAttached(2))));
    }

    #[test]
    fn test_round_trip_dma() {
        let ctrl = attached(0xd7ec, 0xb655, Default::default());
        let (data, out, outcome) = write_read(&ctrl, Target::new(0), 130);
        assert_eq!(out, data);
        assert_eq!(outcome, ReadOutcome { ecc_strength: 16, ..Default::default() });
        ctrl.hardware(|hw| assert_eq!(hw.streams_submitted(), 2));
        assert!(ctrl.history().iter().all(|e| e.path == Path::Dma && e.ok));
    }

    #[test]
    fn test_round_trip_pio() {
        for (id, ext) in [(0xd7ec, 0xb655), (0xdaec, 0xffff), (0x46ec, 0xffff)] {
            let ctrl = attached(id, ext, pio());
            let (data, out, outcome) = write_read(&ctrl, Target::new(0), 33);
            assert_eq!(out, data, "chip {id:#06x}");
            assert_eq!(outcome.corrected_bits, 0);
            ctrl.hardware(|hw| assert_eq!(hw.streams_submitted(), 0));
        }
    }

    #[test]
    fn test_corrected_bits_reported() {
        for config in [Default::default(), pio()] {
            let ctrl = attached(0xd7ec, 0xb655, config);
            let geo = ctrl.geometry(0).unwrap();
            let data = pattern(geo.page_size, 1);
            ctrl.write_page(Target::new(0), 7, &data, &[]).unwrap();
            ctrl.hardware(|hw| hw.chip_mut(0).unwrap().inject_flips(7, &[3, 17, 900]));

            let mut out = vec![0; geo.page_size];
            let outcome = ctrl.read_page(Target::new(0), 7, &mut out, &mut []).unwrap();
            assert_eq!(out, data);
            assert_eq!(outcome.corrected_bits, 3);
            assert!(!outcome.exceeds_threshold());
        }
    }

    #[test]
    fn test_erased_page_noise() {
        let ctrl = attached(0xd7ec, 0xb655, Default::default());
        let geo = ctrl.geometry(0).unwrap();
        let bits: Vec<usize> = (0..16).map(|i| i * 8).collect();
        ctrl.hardware(|hw| {
            let chip = hw.chip_mut(0).unwrap();
            chip.inject_flips(10, &bits[..15]);
            chip.inject_flips(11, &bits);
        });

        let mut data = vec![0; geo.page_size];
        let mut oob = vec![0; geo.oob_size];
        let outcome = ctrl.read_page(Target::new(0), 10, &mut data, &mut oob).unwrap();
        assert!(outcome.blank);
        assert!(data.is_erased() && oob.is_erased());

        // As many flipped bits as the ECC strength is corruption, not noise
        let err = ctrl.read_page(Target::new(0), 11, &mut data, &mut oob).unwrap_err();
        assert!(matches!(err, NfcError::Uncorrectable { page: 11, retries: 0 }));
    }

    fn garble(ctrl: &NandController<SimHardware>, page: u32) -> Vec<u8> {
        let geo = ctrl.geometry(0).unwrap();
        let data = pattern(geo.page_size, 9);
        ctrl.write_page(Target::new(0), page, &data, &[]).unwrap();
        let bits: Vec<usize> = (0..100).map(|i| i * 8 + 1).collect();
        ctrl.hardware(|hw| hw.chip_mut(0).unwrap().inject_flips(page, &bits));
        data
    }

    #[test]
    fn test_table_retry_recovers_and_remembers() {
        let ctrl = attached(0xdead, 0xda94, Default::default());
        assert!(matches!(ctrl.retry_strategy(0).unwrap(), RetryStrategy::TableBased(ref t) if t.len() == 8));
        ctrl.hardware(|hw| assert_eq!(hw.chip(0).unwrap().retry_level(), Some(0)));

        let data = garble(&ctrl, 300);
        ctrl.hardware(|hw| hw.chip_mut(0).unwrap().heal_at(300, 2));

        let mut out = vec![0; data.len()];
        let outcome = ctrl.read_page(Target::new(0), 300, &mut out, &mut []).unwrap();
        assert_eq!(outcome.retries, 2);
        assert_eq!(out, data);
        ctrl.hardware(|hw| assert_eq!(hw.chip(0).unwrap().retry_level(), Some(2)));

        // The working row stays applied, so the next read passes first time
        let outcome = ctrl.read_page(Target::new(0), 300, &mut out, &mut []).unwrap();
        assert_eq!(outcome.retries, 0);
    }

    #[test]
    fn test_table_retry_exhausts() {
        let ctrl = attached(0xdead, 0xda94, pio());
        let data = garble(&ctrl, 12);
        let mut out = vec![0; data.len()];

        let err = ctrl.read_page(Target::new(0), 12, &mut out, &mut []).unwrap_err();
        assert!(matches!(err, NfcError::Uncorrectable { page: 12, retries: 8 }));
        ctrl.hardware(|hw| assert_eq!(hw.chip(0).unwrap().retry_level(), Some(0)));
    }

    #[test]
    fn test_index_retry() {
        let ctrl = attached(0x442c, 0x4b44, Default::default());
        let data = garble(&ctrl, 5);
        ctrl.hardware(|hw| hw.chip_mut(0).unwrap().heal_at(5, 3));

        let mut out = vec![0; data.len()];
        let outcome = ctrl.read_page(Target::new(0), 5, &mut out, &mut []).unwrap();
        assert_eq!(outcome.retries, 3);
        assert_eq!(out, data);
        // Index-based retry always returns the chip to its defaults
        ctrl.hardware(|hw| assert_eq!(hw.chip(0).unwrap().retry_level(), Some(0)));
    }

    #[test]
    fn test_retry_table_cached() {
        let config = ControllerConfig {
            retry_table_page: Some(2),
            ..Default::default()
        };
        let otp_entries = |hw: &SimHardware| hw.chip(0).unwrap().commands().iter().filter(|&&c| c == 0x19).count();

        let ctrl = attached(0xdead, 0xda94, config.clone());
        let table = ctrl.retry_strategy(0).unwrap();
        let hw = ctrl.into_hardware();
        assert_eq!(otp_entries(&hw), 1);
        assert!(hw.chip(0).unwrap().page(2).is_some());

        let ctrl = NandController::new(hw, config);
        ctrl.attach(0).unwrap();
        assert_eq!(ctrl.retry_strategy(0).unwrap(), table);
        ctrl.hardware(|hw| assert_eq!(otp_entries(&*hw), 1));
    }

    #[test]
    fn test_program_and_erase_failures() {
        for config in [Default::default(), pio()] {
            let ctrl = attached(0xd7ec, 0xb655, config);
            let geo = ctrl.geometry(0).unwrap();
            ctrl.hardware(|hw| {
                let chip = hw.chip_mut(0).unwrap();
                chip.fail_program(260);
                chip.fail_erase(3);
            });

            let data = vec![0x5A; geo.page_size];
            let err = ctrl.write_page(Target::new(0), 260, &data, &[]).unwrap_err();
            assert!(matches!(err, NfcError::ProgramFailed(260)));
            let err = ctrl.erase_block(Target::new(0), 3 * 128 + 5).unwrap_err();
            assert!(matches!(err, NfcError::EraseFailed(384)));

            ctrl.write_page(Target::new(0), 261, &data, &[]).unwrap();
            ctrl.erase_block(Target::new(0), 4 * 128).unwrap();
        }
    }

    #[test]
    fn test_bad_blocks() {
        let ctrl = attached(0xdaec, 0xffff, Default::default());
        ctrl.hardware(|hw| hw.chip_mut(0).unwrap().mark_factory_bad(3));

        assert!(ctrl.is_bad(Target::new(0), 3 * 64).unwrap());
        assert!(!ctrl.is_bad(Target::new(0), 4 * 64 + 9).unwrap());

        ctrl.mark_bad(Target::new(0), 4 * 64 + 9).unwrap();
        assert!(ctrl.is_bad(Target::new(0), 4 * 64).unwrap());
    }

    #[test]
    fn test_bounce_buffer_fallback() {
        let ctrl = attached(0xd7ec, 0xb655, Default::default());
        ctrl.hardware(|hw| hw.memory_mut().fail_next_maps(2));
        let (data, out, _) = write_read(&ctrl, Target::new(0), 0);
        assert_eq!(out, data);

        ctrl.hardware(|hw| assert_eq!(hw.memory_mut().mapped(), 0));
    }

    #[test]
    fn test_no_bounce_buffer() {
        let ctrl = attached(0xd7ec, 0xb655, Default::default());
        ctrl.hardware(|hw| {
            hw.memory_mut().fail_next_maps(1);
            hw.memory_mut().exhaust_coherent(true);
        });
        let data = vec![0; 4096];
        let err = ctrl.write_page(Target::new(0), 0, &data, &[]).unwrap_err();
        assert!(matches!(err, NfcError::DmaMapping));
    }

    #[test]
    fn test_timeout_recorded() {
        for config in [Default::default(), pio()] {
            let config = ControllerConfig {
                timeout: Duration::from_millis(20),
                ..config
            };
            let ctrl = attached(0xdaec, 0xffff, config);
            ctrl.hardware(|hw| hw.chip_mut(0).unwrap().stall(true));

            let err = ctrl.erase_block(Target::new(0), 64).unwrap_err();
            assert!(err.is_timeout());
            let last = *ctrl.history().last().unwrap();
            assert_eq!((last.op, last.page, last.ok), (Opcode::Erase, 64, false));
        }
    }

    #[test]
    fn test_failed_reattach_keeps_arena() {
        let config = ControllerConfig {
            timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let ctrl = attached(0xdaec, 0xffff, config);
        let allocated = ctrl.hardware(|hw| hw.memory_mut().allocated());

        ctrl.hardware(|hw| hw.chip_mut(0).unwrap().stall(true));
        assert!(ctrl.attach(0).unwrap_err().is_timeout());
        assert!(matches!(ctrl.geometry(0), Err(NfcError::NotAttached(0))));

        ctrl.hardware(|hw| hw.chip_mut(0).unwrap().stall(false));
        ctrl.attach(0).unwrap();
        assert_eq!(ctrl.hardware(|hw| hw.memory_mut().allocated()), allocated);

        let (data, out, _) = write_read(&ctrl, Target::new(0), 3);
        assert_eq!(out, data);
    }

    #[test]
    fn test_dual_plane() {
        for config in [Default::default(), pio()] {
            let ctrl = attached(0xdead, 0xda94, config);
            let target = Target::new(0).planes(2);
            let (data, out, _) = write_read(&ctrl, target, 4);
            assert_eq!(out, data);

            ctrl.hardware(|hw| {
                let chip = hw.chip(0).unwrap();
                assert_eq!(&chip.page(4).unwrap()[..16], &data[..16]);
                assert_eq!(&chip.page(256 + 4).unwrap()[..16], &data[8192..8192 + 16]);
            });
        }

        let ctrl = attached(0xd7ec, 0xb655, Default::default());
        let err = ctrl.erase_block(Target::new(0).planes(2), 0).unwrap_err();
        assert!(matches!(err, NfcError::UnsupportedConfig(_)));
    }

    #[test]
    fn test_slc_mode_bracketing() {
        let ctrl = attached(0xdead, 0xda94, Default::default());
        let target = Target::new(0).slc(SlcPolicy::Eslc);

        let (data, out, _) = write_read(&ctrl, target, 5);
        assert_eq!(out, data);
        ctrl.hardware(|hw| {
            let chip = hw.chip(0).unwrap();
            assert!(chip.page(7).is_some());
            assert!(chip.page(5).is_none());
            // Only the program is bracketed for paired pseudo-SLC
            assert_eq!(chip.slc_transitions(), [true, false]);
        });

        ctrl.hardware(|hw| hw.chip_mut(0).unwrap().fail_program(10));
        let err = ctrl.write_page(target, 6, &data, &[]).unwrap_err();
        assert!(matches!(err, NfcError::ProgramFailed(10)));
        ctrl.hardware(|hw| assert_eq!(hw.chip(0).unwrap().slc_transitions(), [true, false, true, false]));

        let plain = attached(0xd7ec, 0xb655, Default::default());
        let err = plain.erase_block(Target::new(0).slc(SlcPolicy::Slc), 0).unwrap_err();
        assert!(matches!(err, NfcError::UnsupportedConfig(_)));
    }

    #[test]
    fn test_raw_commands() {
        let ctrl = attached(0xdaec, 0xffff, Default::default());
        let id = ctrl.command(0, 0x90, 0, 0).unwrap();
        assert_eq!(&id[..4], &[0xec, 0xda, 0xff, 0xff]);

        let status = ctrl.command(0, 0x70, 0, 0).unwrap();
        assert_eq!(status[0] & STATUS_FAIL, 0);

        assert!(matches!(ctrl.command(0, 0x80, 0, 0), Err(NfcError::InvalidOperation(0x80))));
        assert!(matches!(ctrl.command(0, 0x42, 0, 0), Err(NfcError::InvalidOperation(0x42))));
    }

    #[test]
    fn test_range_checks() {
        let ctrl = attached(0xdaec, 0xffff, Default::default());
        let geo = ctrl.geometry(0).unwrap();
        let mut data = vec![0; geo.page_size];

        let err = ctrl.read_page(Target::new(0), geo.page_count(), &mut data, &mut []).unwrap_err();
        assert!(matches!(err, NfcError::OutOfRange(_)));
        let err = ctrl.read_page(Target::new(1), 0, &mut data, &mut []).unwrap_err();
        assert!(matches!(err, NfcError::NotAttached(1)));
        let err = ctrl.read_page(Target::new(0), 0, &mut data[..100], &mut []).unwrap_err();
        assert!(matches!(err, NfcError::UnsupportedConfig(_)));
    }

    #[test]
    fn test_page_address_overflow() {
        let ctrl = attached(0xdead, 0xda94, Default::default());
        let geo = ctrl.geometry(0).unwrap();

        let targets = [
            Target::new(0).planes(2),
            Target::new(0).slc(SlcPolicy::Slc),
            Target::new(0).slc(SlcPolicy::Eslc),
        ];
        for target in targets {
            let mut data = vec![0; target.planes as usize * geo.page_size];
            let err = ctrl.read_page(target, u32::MAX, &mut data, &mut []).unwrap_err();
            assert!(matches!(err, NfcError::OutOfRange(u32::MAX)), "{target:?}: {err}");
            let err = ctrl.write_page(target, u32::MAX, &data, &[]).unwrap_err();
            assert!(matches!(err, NfcError::OutOfRange(u32::MAX)), "{target:?}: {err}");
            let err = ctrl.erase_block(target, u32::MAX).unwrap_err();
            assert!(matches!(err, NfcError::OutOfRange(u32::MAX)), "{target:?}: {err}");
        }

        // Nothing reached the chip
        ctrl.hardware(|hw| assert_eq!(hw.streams_submitted(), 0));
    }
}
