use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use common::cli::GlobalOpts;
use log::info;
use n64::Device;
use vr4300::{Config, ExitReason};

/// Runs a raw big-endian VR4300 code image
#[derive(Debug, Parser)]
#[clap(name = "r4300-mu", version)]
struct Cli {
    /// Image to load at the entry address
    image: PathBuf,

    #[command(flatten)]
    global: GlobalOpts,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let opts = &cli.global;

    let image = std::fs::read(&cli.image)
        .with_context(|| format!("reading {}", cli.image.display()))?;

    let mut device = Device::new(&Config::from(opts));
    device
        .load_image(opts.entry, &image)
        .with_context(|| format!("loading {} at {:#010x}", cli.image.display(), opts.entry))?;
    device.set_pc(opts.entry);

    info!("running {} for {} cycles", cli.image.display(), opts.cycles);
    let exit = device.run(opts.cycles as u64);

    let cpu = device.cpu();
    println!("engine:   {}", opts.engine);
    println!("stopped:  {}", exit == ExitReason::Stopped);
    println!("cycles:   {}", cpu.total_cycles());
    println!("pc:       {:#010x}", cpu.pc);
    if let Some(pages) = device.compiled_pages() {
        println!("compiled: {} pages", pages);
    }
    for (n, value) in cpu.gpr.iter().enumerate().filter(|(_, v)| **v != 0) {
        println!("r{:<2}      {:#018x}", n, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::cli::EngineKind;

    #[test]
    fn image_path_and_global_options() {
        let cli = Cli::parse_from(["r4300-mu", "boot.bin", "--engine", "interpreter", "--cycles", "500"]);
        assert_eq!(cli.image, PathBuf::from("boot.bin"));
        assert_eq!(cli.global.cycles, 500);
        assert_eq!(Config::from(&cli.global).engine, EngineKind::Interpreter);
    }
}
