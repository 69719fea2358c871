use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use memsim::config::{Mode, SystemConfig};
use memsim::isa::{assemble, StaticInst};
use memsim::System;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "cycle-level cache hierarchy simulator")]
struct Options {
    /// JSON system configuration; defaults to a timing system with split
    /// 16KiB L1 caches
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured simulation mode
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Raw program image, loaded at the base of physical memory; without
    /// one a built-in array-sum demo runs
    #[arg(short, long, value_name = "FILE")]
    image: Option<PathBuf>,

    /// Stop after retiring this many instructions
    #[arg(long)]
    max_insts: Option<u64>,
}

/// Array-sum demo: 32 values at +0x400, result stored to +0x800.
fn demo_image() -> Vec<u8> {
    let n = 32u64;
    let mut image = assemble(&[
        StaticInst::addi(1, 0, 0x400),
        StaticInst::addi(2, 0, n as i32),
        StaticInst::load(3, 1, 0),
        StaticInst::add(10, 10, 3),
        StaticInst::addi(1, 1, 8),
        StaticInst::addi(2, 2, -1),
        StaticInst::bnez(2, -32),
        StaticInst::store(10, 0, 0x800),
        StaticInst::halt(),
    ]);
    image.resize(0x400, 0);
    for value in 1..=n {
        image.extend_from_slice(&(value * value).to_le_bytes());
    }
    image
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let options = Options::parse();

    let mut config = match &options.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .wrap_err_with(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&text)
                .wrap_err_with(|| format!("parsing config {}", path.display()))?
        }
        None => SystemConfig::timing(),
    };
    if let Some(mode) = options.mode {
        config.mode = mode;
    }
    if let Some(max) = options.max_insts {
        config.cpu.max_insts = Some(max);
    }

    let image = match &options.image {
        Some(path) => {
            fs::read(path).wrap_err_with(|| format!("reading image {}", path.display()))?
        }
        None => demo_image(),
    };

    let system = System::new(config);
    let base = system.config.mem.base;
    system.load_image(base, &image);

    let ticks = system.run();
    println!("exiting @ tick {ticks}");

    let result = system.read_mem(base + 0x800, 8);
    println!(
        "result word @ {:#x} = {}",
        base + 0x800,
        u64::from_le_bytes(result.try_into().expect("8-byte result word"))
    );
    print!("{}", system.dump_stats());
    Ok(())
}
