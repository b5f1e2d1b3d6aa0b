//! Binary entry point for the `zbd-img` image tool.
//!
//! Three subcommands drive the library:
//!
//! - `create` — compute the layout and write a fresh image file;
//! - `info`   — open an image read-only and print its geometry, mapping
//!   census, and storage consumption;
//! - `probe`  — check whether a file carries the image magic (exit code 0
//!   when it does, 1 otherwise).
//!
//! Size-valued options accept binary suffixes (`64M`, `4KiB`, `1G`, ...).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use zbd::opts::{parse_size, CreateOpts, OpenOpts};
use zbd::{layout, Image, Init};

// ── Command line ──────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "zbd-img", version, about = "Create and inspect zbd block-device images")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create a new image file.
    Create {
        /// Virtual disk size (multiple of the cluster size).
        #[arg(short, long, value_parser = size_arg)]
        size: u64,
        /// Cluster (block) size; power of two, at least 4096.
        #[arg(short, long, value_parser = size_arg, default_value = "4096")]
        cluster_size: u64,
        /// Zone size; power of two, at least one cluster.
        #[arg(short, long, value_parser = size_arg, default_value = "4M")]
        zone_size: u64,
        /// Zone initialization: zero, trim, or none.
        #[arg(long, default_value = "zero")]
        init: Init,
        /// Image file to create.
        file: PathBuf,
    },
    /// Print the header, mapping census, and allocation of an image.
    Info {
        /// Image file to inspect.
        file: PathBuf,
    },
    /// Check whether a file is a zbd image.
    Probe {
        /// File to probe.
        file: PathBuf,
    },
}

fn size_arg(s: &str) -> Result<u64, String> {
    parse_size(s).ok_or_else(|| format!("'{}' is not a size (try 64M, 4KiB, 1G)", s))
}

// ── Subcommands ───────────────────────────────────────────────────────────────

fn cmd_create(
    size: u64,
    cluster_size: u64,
    zone_size: u64,
    init: Init,
    file: &PathBuf,
) -> anyhow::Result<()> {
    let opts = CreateOpts {
        size,
        cluster_size,
        zone_size,
        init,
    };
    let header = zbd::create_file(file, &opts)
        .with_context(|| format!("creating {}", file.display()))?;
    println!(
        "created {}: capacity {} bytes, cluster {} bytes, {} zones of {} bytes",
        file.display(),
        header.capacity,
        1u64 << header.block_shift,
        header.nr_zones,
        header.zone_size
    );
    Ok(())
}

fn cmd_info(file: &PathBuf) -> anyhow::Result<()> {
    let image = Image::open_file(file, &OpenOpts::read_only())
        .with_context(|| format!("opening {}", file.display()))?;
    let h = image.header();
    let g = image.geometry();
    println!("image:        {}", file.display());
    println!("capacity:     {} bytes ({} sectors)", g.capacity, g.capacity / 512);
    println!("cluster size: {} bytes (shift {})", g.block_size, g.block_shift);
    println!("zone size:    {} bytes ({} zones)", g.zone_size, g.nr_zones);
    println!("l1 pages:     {}", g.nr_l1);
    println!("init policy:  {:?}", h.init);
    let census = image.mapping_census();
    println!(
        "mapped:       {} compressed, {} raw, {} other",
        census.z, census.n, census.other
    );
    let allocated = image.allocated_size()?;
    println!("allocated:    {} bytes", allocated);
    Ok(())
}

fn cmd_probe(file: &PathBuf) -> anyhow::Result<bool> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    if data.len() < 8 {
        bail!("{}: too short to probe", file.display());
    }
    let score = layout::probe(&data);
    if score > 0 {
        println!("{}: zbd image (score {})", file.display(), score);
        Ok(true)
    } else {
        println!("{}: not a zbd image", file.display());
        Ok(false)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let result = match &cli.cmd {
        Cmd::Create {
            size,
            cluster_size,
            zone_size,
            init,
            file,
        } => cmd_create(*size, *cluster_size, *zone_size, *init, file).map(|()| true),
        Cmd::Info { file } => cmd_info(file).map(|()| true),
        Cmd::Probe { file } => cmd_probe(file),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("zbd-img: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
