use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use fsmorph_converter::Btrfs2Ext4Converter;
use fsmorph_core::{
    BlockConverter, ConvertOptions, ConvertProgress, ProgressCallback,
};

#[derive(Parser)]
#[command(name = "fsmorph")]
#[command(version)]
#[command(about = "Convert a btrfs volume to ext4 in place", long_about = None)]
struct Cli {
    /// Block device or image file holding the btrfs volume
    device: PathBuf,

    /// Plan the conversion and report what it would do, without writing
    #[arg(long)]
    dry_run: bool,

    /// Print detailed progress
    #[arg(short, long)]
    verbose: bool,

    /// Ext4 block size in bytes (1024, 2048 or 4096)
    #[arg(long, default_value_t = 4096)]
    block_size: u32,

    /// Bytes of device space per ext4 inode
    #[arg(long, default_value_t = 16384)]
    inode_ratio: u32,

    /// Reverse a previous conversion using the on-disk migration footer
    #[arg(long)]
    rollback: bool,

    /// Directory for disk-backed spill files (must not be RAM-backed)
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Megabytes of table memory before spilling to the workdir
    #[arg(long)]
    memory_limit: Option<u64>,

    /// Convert even if the device appears to be mounted
    #[arg(long)]
    force: bool,

    /// Emit the dry-run report as JSON
    #[arg(long)]
    json: bool,
}

struct ConsoleProgress {
    verbose: bool,
}

impl ProgressCallback for ConsoleProgress {
    fn on_progress(&self, progress: &ConvertProgress) {
        if self.verbose {
            println!(
                "[{:5.1}%] {:?}: {}",
                progress.percentage, progress.phase, progress.step_description
            );
        } else {
            println!("[{:5.1}%] {}", progress.percentage, progress.step_description);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
    builder.init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let converter = Btrfs2Ext4Converter::new();

    if cli.rollback {
        converter.rollback(cli.device.clone()).await?;
        println!("Rollback complete: {} is btrfs again.", cli.device.display());
        return Ok(());
    }

    let options = ConvertOptions {
        block_size: cli.block_size,
        inode_ratio: cli.inode_ratio,
        workdir: cli.workdir.clone(),
        memory_limit_mb: cli.memory_limit,
        force: cli.force,
        ..ConvertOptions::default()
    };

    if cli.dry_run {
        let report = converter.dry_run(cli.device.clone(), options).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        println!("Dry run of {}:", report.device.display());
        println!("  volume label:        {:?}", report.volume_label);
        println!(
            "  geometry:            {} blocks of {} bytes in {} group(s)",
            report.total_blocks, report.block_size, report.block_groups
        );
        println!("  inodes planned:      {}", report.total_inodes);
        println!(
            "  inventory:           {} file(s), {} director(ies)",
            report.file_count, report.directory_count
        );
        println!("  conflict blocks:     {}", report.conflict_blocks);
        println!(
            "  relocation:          {} entr(ies), {} byte(s)",
            report.relocation_entries, report.relocation_bytes
        );
        println!("  CoW duplication:     {} block(s)", report.dedup_blocks_needed);
        println!(
            "  compressed extents:  {} (+{} bytes raw)",
            report.compressed_extents, report.compression_expansion_bytes
        );
        for warning in &report.warnings {
            println!("  warning: {}", warning);
        }
        println!("No bytes were written.");
        return Ok(());
    }

    let progress = Arc::new(ConsoleProgress {
        verbose: cli.verbose,
    });
    let summary = converter
        .convert(cli.device.clone(), options, progress)
        .await?;
    println!(
        "Converted {} in {:.1}s: {} inode(s), {} director(ies), {} byte(s) relocated, {} journal block(s).",
        cli.device.display(),
        summary.elapsed_secs,
        summary.inodes_written,
        summary.directories_written,
        summary.relocated_bytes,
        summary.journal_blocks
    );
    println!("A rollback checkpoint remains on the device; --rollback restores btrfs.");
    Ok(())
}
