#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use snapshim_block::FileByteDevice;
use snapshim_cow::{CowLogReader, CowOpKind, MergeCommitter};
use snapshim_daemon::SnapshotWorker;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "snapshim",
    about = "snapshim — userspace dm-snapshot translation daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve one snapshot device over its dm-user control device.
    Serve {
        /// dm-user misc name; the control device is /dev/dm-user/<name>.
        misc_name: String,
        /// Path to the internal COW log device (opened read-write).
        cow_device: PathBuf,
        /// Path to the backing device (opened read-only).
        backing_device: PathBuf,
        /// Override the control device path.
        #[arg(long)]
        control: Option<PathBuf>,
    },
    /// Summarise an internal COW log.
    Inspect {
        /// Path to the internal COW log device.
        cow_device: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    num_merge_ops: u64,
    replace_ops: u64,
    copy_ops: u64,
    zero_ops: u64,
    labels: u64,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            misc_name,
            cow_device,
            backing_device,
            control,
        } => serve(&misc_name, &cow_device, &backing_device, control.as_deref()),
        Command::Inspect { cow_device, json } => inspect(&cow_device, json),
    }
}

fn serve(
    misc_name: &str,
    cow_device: &Path,
    backing_device: &Path,
    control: Option<&Path>,
) -> Result<()> {
    let control_path =
        control.map_or_else(|| PathBuf::from(format!("/dev/dm-user/{misc_name}")), Path::to_path_buf);

    let cow = FileByteDevice::open(cow_device)
        .with_context(|| format!("open COW log {}", cow_device.display()))?;
    let backing = FileByteDevice::open_read_only(backing_device)
        .with_context(|| format!("open backing device {}", backing_device.display()))?;
    let control = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&control_path)
        .with_context(|| format!("open control device {}", control_path.display()))?;

    let reader = CowLogReader::parse(cow.clone())
        .with_context(|| format!("parse COW log {}", cow_device.display()))?;
    let committer = MergeCommitter::new(cow, reader.header());

    let mut worker = SnapshotWorker::start(reader, committer, backing, control)
        .context("build snapshot metadata")?;
    info!(
        target: "snapshim::cli",
        misc_name,
        num_sectors = worker.num_sectors(),
        "serving"
    );

    worker.serve().context("request loop failed")?;
    info!(target: "snapshim::cli", misc_name, "control device closed");
    Ok(())
}

fn inspect(cow_device: &Path, json: bool) -> Result<()> {
    let cow = FileByteDevice::open_read_only(cow_device)
        .with_context(|| format!("open COW log {}", cow_device.display()))?;
    let reader = CowLogReader::parse(cow)
        .with_context(|| format!("parse COW log {}", cow_device.display()))?;

    let mut output = InspectOutput {
        block_size: reader.header().block_size,
        num_merge_ops: reader.header().num_merge_ops,
        replace_ops: 0,
        copy_ops: 0,
        zero_ops: 0,
        labels: 0,
    };
    for op in reader.iter_forward() {
        match op.kind {
            CowOpKind::Replace => output.replace_ops += 1,
            CowOpKind::Copy => output.copy_ops += 1,
            CowOpKind::Zero => output.zero_ops += 1,
            CowOpKind::Label => output.labels += 1,
            CowOpKind::Footer | CowOpKind::Unknown(_) => {}
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("block_size:    {}", output.block_size);
        println!("merged ops:    {}", output.num_merge_ops);
        println!("replace ops:   {}", output.replace_ops);
        println!("copy ops:      {}", output.copy_ops);
        println!("zero ops:      {}", output.zero_ops);
        println!("labels:        {}", output.labels);
    }
    Ok(())
}
