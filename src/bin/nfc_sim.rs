//! Drives the controller driver against the simulated hardware.
//!
//! Every invocation starts from a freshly erased chip, so the subcommands that read back data
//! write it themselves first.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn, LevelFilter};
use rand::rngs::SmallRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use simplelog::{ConfigBuilder, SimpleLogger};
use time::macros::format_description;

use soc_nand::command::Opcode;
use soc_nand::dma::{
    decode_stream, staged_commands, DescriptorBuffer, DescriptorCompiler, Mtu, ScratchLayout, TransferPlan,
};
use soc_nand::geometry::FLASH_TYPES;
use soc_nand::nand::Nand;
use soc_nand::sim::SimHardware;
use soc_nand::slc::SlcPolicy;
use soc_nand::{ControllerConfig, FlashType, NandController, NfcError, PartitionView, Target};

/// Chip ids as "CHIPID:EXTID", in hex
#[derive(Debug, Copy, Clone)]
struct ChipId(u16, u16);

impl FromStr for ChipId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id, ext) = s.split_once(':').ok_or_else(|| anyhow!("expected CHIPID:EXTID"))?;
        Ok(ChipId(u16::from_str_radix(id, 16)?, u16::from_str_radix(ext, 16)?))
    }
}

fn parse_hex(s: &str) -> Result<u32> {
    Ok(u32::from_str_radix(s.trim_start_matches("0x"), 16)?)
}

#[derive(Args, Debug)]
struct ControllerOptions {
    /// Move page data by PIO instead of DMA descriptor streams
    #[clap(long)]
    pio: bool,

    /// Minimum transfer unit of the DMA channels, in bytes
    #[clap(long, default_value_t = Mtu::B32)]
    mtu: Mtu,

    /// NDTR0 timing register value (hex)
    #[clap(long, value_parser = parse_hex)]
    ndtr0: Option<u32>,

    /// NDTR1 timing register value (hex)
    #[clap(long, value_parser = parse_hex)]
    ndtr1: Option<u32>,

    /// Budget for each hardware poll
    #[clap(long, default_value_t = 200)]
    timeout_ms: u64,

    /// Page reserved for caching the read-retry table
    #[clap(long)]
    retry_table_page: Option<u32>,
}

impl ControllerOptions {
    fn config(&self) -> ControllerConfig {
        let defaults = ControllerConfig::default();
        ControllerConfig {
            use_dma: !self.pio,
            mtu: self.mtu,
            ndtr0: self.ndtr0.unwrap_or(defaults.ndtr0),
            ndtr1: self.ndtr1.unwrap_or(defaults.ndtr1),
            timeout: Duration::from_millis(self.timeout_ms),
            retry_table_page: self.retry_table_page,
            ..defaults
        }
    }
}

#[derive(Args, Debug, Clone, Copy)]
struct TargetOptions {
    /// Address both planes at once
    #[clap(long)]
    dual_plane: bool,

    /// Pseudo-SLC addressing
    #[clap(long, value_enum)]
    slc: Option<SlcMode>,
}

impl TargetOptions {
    fn target(&self) -> Target {
        let target = Target::new(0).planes(if self.dual_plane { 2 } else { 1 });
        match self.slc {
            Some(SlcMode::Eslc) => target.slc(SlcPolicy::Eslc),
            Some(SlcMode::Slc) => target.slc(SlcPolicy::Slc),
            None => target,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SlcMode {
    Eslc,
    Slc,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum StreamOp {
    Read,
    Program,
    Erase,
}

impl From<StreamOp> for Opcode {
    fn from(op: StreamOp) -> Self {
        match op {
            StreamOp::Read => Opcode::Read,
            StreamOp::Program => Opcode::Program,
            StreamOp::Erase => Opcode::Erase,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Identify the chip and print its geometry
    Identify,

    /// Check every block for bad-block markers
    Scan,

    /// Write a pattern to a page, optionally disturb it, and read it back
    WritePage {
        page: u32,

        /// Byte to fill the page with (hex)
        #[clap(long, value_parser = parse_hex, default_value = "5a")]
        pattern: u32,

        /// Bits to flip in the stored page before reading it back
        #[clap(long, default_value_t = 0)]
        flips: usize,

        #[clap(flatten)]
        target: TargetOptions,
    },

    /// Read a page and print the start of it
    ReadPage {
        page: u32,

        /// How many bytes to print
        #[clap(long, default_value_t = 64)]
        length: usize,

        #[clap(flatten)]
        target: TargetOptions,
    },

    /// Erase the block holding a page
    Erase {
        page: u32,

        #[clap(flatten)]
        target: TargetOptions,
    },

    /// Random write/read/verify over a few blocks, with bit flips injected along the way
    Stress {
        /// Pages to write and verify
        #[clap(long, default_value_t = 1024)]
        pages: u32,

        /// Blocks to spread the pages over
        #[clap(long, default_value_t = 16)]
        blocks: u32,

        #[clap(long, default_value_t = 7)]
        seed: u64,

        /// Most bits flipped in a page that should still correct (default: half the ECC strength)
        #[clap(long)]
        max_flips: Option<usize>,

        /// One in this many pages is corrupted past the ECC strength and only reads back at a
        /// retry level
        #[clap(long, default_value_t = 16)]
        garble_every: u32,
    },

    /// Compile the descriptor stream for an operation and print its records
    DumpDescriptors {
        #[clap(value_enum)]
        op: StreamOp,

        page: u32,

        #[clap(long, default_value_t = 1)]
        planes: u8,
    },
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Chip to simulate
    #[clap(long, default_value = "d7ec:b655")]
    chip: ChipId,

    /// Blocks to mark bad the way the factory does
    #[clap(long = "bad-block")]
    bad_blocks: Vec<u32>,

    #[clap(flatten)]
    controller: ControllerOptions,

    /// More log output (repeatable)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    cmd: Command,
}

fn find_chip(id: ChipId) -> Result<FlashType> {
    FLASH_TYPES
        .iter()
        .find(|f| f.matches(id.0, id.1))
        .copied()
        .ok_or_else(|| anyhow!("no flash type {:04x}:{:04x}", id.0, id.1))
}

fn dump(bytes: &[u8]) {
    for (i, line) in bytes.chunks(16).enumerate() {
        println!("{:06x}  {:02x?}", i * 16, line);
    }
}

impl Command {
    fn execute(self, ctrl: &NandController<SimHardware>, config: &ControllerConfig) -> Result<()> {
        let geo = ctrl.geometry(0)?;

        match self {
            Command::Identify => {
                let flash = ctrl.chip(0)?;
                println!("{} ({:04x}:{:04x})", flash.name, flash.chip_id, flash.ext_id);
                println!(
                    "{} blocks x {} pages x {}+{} bytes, {} address cycles",
                    geo.blocks,
                    geo.pages_per_block,
                    geo.page_size,
                    geo.oob_size,
                    geo.row_cycles + geo.col_cycles
                );
                println!(
                    "ECC strength {}, dual plane {}, read retry {:?}",
                    geo.ecc_strength,
                    geo.dual_plane,
                    ctrl.retry_strategy(0)?
                );
            }

            Command::Scan => {
                let mut view = PartitionView::new(ctrl, Target::new(0), 0, geo.blocks)?;
                let rpt = howudoin::new()
                    .label("Scanning blocks")
                    .set_len(u64::from(geo.blocks));

                let mut bad = Vec::new();
                for block in 0..geo.blocks {
                    if view.block(block)?.is_none() {
                        bad.push(block);
                    }
                    rpt.inc();
                }
                rpt.close();

                println!("{} bad blocks: {bad:?}", bad.len());
            }

            Command::WritePage {
                page,
                pattern,
                flips,
                target,
            } => {
                let target = target.target();
                let len = target.planes as usize * geo.page_size;
                let data = vec![pattern as u8; len];
                ctrl.write_page(target, page, &data, &[])?;

                if flips > 0 {
                    let bits = sample(&mut SmallRng::seed_from_u64(page.into()), len * 8, flips).into_vec();
                    ctrl.hardware(|hw| hw.chip_mut(0).map(|chip| chip.inject_flips(page, &bits)));
                }

                let mut out = vec![0; len];
                let outcome = ctrl.read_page(target, page, &mut out, &mut [])?;
                println!("{outcome:?}");
                if out != data {
                    bail!("page {page} read back differently");
                }
            }

            Command::ReadPage { page, length, target } => {
                let target = target.target();
                let mut data = vec![0; target.planes as usize * geo.page_size];
                let mut oob = vec![0; target.planes as usize * geo.oob_size];
                let outcome = ctrl.read_page(target, page, &mut data, &mut oob)?;
                println!("{outcome:?}");
                dump(&data[..length.min(data.len())]);
                println!("spare:");
                dump(&oob);
            }

            Command::Erase { page, target } => {
                ctrl.erase_block(target.target(), page)?;
                println!("erased block at page {}", geo.block_start(page));
            }

            Command::Stress {
                pages,
                blocks,
                seed,
                max_flips,
                garble_every,
            } => stress(ctrl, pages, blocks.clamp(1, geo.blocks), seed, max_flips, garble_every)?,

            Command::DumpDescriptors { op, page, planes } => {
                let compiler = DescriptorCompiler::new(&geo, 0, config.mtu, ScratchLayout::at(0));
                let mut buf = DescriptorBuffer::new();
                compiler.start(&mut buf, geo.ndcr(config.arbitration))?;
                compiler.compile(
                    &mut buf,
                    &TransferPlan {
                        op: op.into(),
                        page,
                        planes,
                        data: 0x1000_0000,
                    },
                )?;

                let records = decode_stream(buf.as_bytes())?;
                for (i, record) in records.iter().enumerate() {
                    println!("{i:4}  {record:x?}");
                }
                for (ndcb0, addr1, addr2, len) in staged_commands(&records)? {
                    println!("cmd {ndcb0:?} addr {addr1:#010x} {addr2:#010x} len {len:?}");
                }
                println!("{} records, {} bytes", records.len(), buf.len());
            }
        }

        Ok(())
    }
}

fn stress(
    ctrl: &NandController<SimHardware>,
    pages: u32,
    blocks: u32,
    seed: u64,
    max_flips: Option<usize>,
    garble_every: u32,
) -> Result<()> {
    let geo = ctrl.geometry(0)?;
    let cycles = ctrl.retry_strategy(0)?.cycles();
    let max_flips = max_flips.unwrap_or(geo.ecc_strength as usize / 2);
    let mut rng = SmallRng::seed_from_u64(seed);

    let rpt = howudoin::new().label("Stress").set_len(u64::from(pages));
    let mut retries: BTreeMap<u32, u32> = BTreeMap::new();
    let (mut corrected, mut scrub, mut lost) = (0u64, 0u32, 0u32);
    let mut block = 0;

    for n in 0..pages {
        let offset = n % geo.pages_per_block;
        if offset == 0 {
            block = rng.gen_range(0..blocks);
            ctrl.erase_block(Target::new(0), block * geo.pages_per_block)?;
        }
        let page = block * geo.pages_per_block + offset;

        let mut data = vec![0; geo.page_size];
        rng.fill(&mut data[..]);
        ctrl.write_page(Target::new(0), page, &data, &[])?;

        let garble = cycles > 0 && garble_every > 0 && rng.gen_ratio(1, garble_every);
        let flips = match garble {
            true => geo.ecc_strength as usize + 4,
            false => rng.gen_range(0..=max_flips),
        };
        let bits = sample(&mut rng, geo.page_size * 8, flips).into_vec();
        let level = rng.gen_range(1..=cycles.max(1)) as u8;
        ctrl.hardware(|hw| {
            if let Some(chip) = hw.chip_mut(0) {
                chip.inject_flips(page, &bits);
                if garble {
                    chip.heal_at(page, level);
                }
            }
        });

        let mut out = vec![0; geo.page_size];
        match ctrl.read_page(Target::new(0), page, &mut out, &mut []) {
            Ok(outcome) => {
                if out != data {
                    bail!("page {page} read back differently ({outcome:?})");
                }
                corrected += u64::from(outcome.corrected_bits);
                scrub += u32::from(outcome.exceeds_threshold());
                *retries.entry(outcome.retries).or_default() += 1;
            }
            Err(err @ NfcError::Uncorrectable { .. }) => {
                warn!("{err}");
                lost += 1;
            }
            Err(err) => return Err(err.into()),
        }
        rpt.inc();
    }
    rpt.close();

    println!("{pages} pages over {blocks} blocks, seed {seed}");
    println!("corrected bits: {corrected}, pages past the scrub threshold: {scrub}, uncorrectable: {lost}");
    for (count, reads) in retries {
        println!("  {count} retries: {reads} reads");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();
    SimpleLogger::init(level, log_cfg)?;

    let mut hw = SimHardware::with_chip(find_chip(args.chip)?)?;
    if let Some(chip) = hw.chip_mut(0) {
        for &block in &args.bad_blocks {
            chip.mark_factory_bad(block);
        }
    }

    let config = args.controller.config();
    let ctrl = NandController::new(hw, config.clone());
    let flash = ctrl.attach(0)?;
    info!("attached {}", flash.name);

    howudoin::init(howudoin::consumers::TermLine::default());
    let result = args.cmd.execute(&ctrl, &config);
    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down

    if let Err(err) = &result {
        for entry in ctrl.history() {
            warn!("{entry}");
        }
        warn!("failed: {err}");
    }
    result
}
