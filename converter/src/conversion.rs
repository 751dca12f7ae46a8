// Conversion orchestrator: drives the three passes and implements the
// public converter trait.
//
// Error handling follows the phase contract: failures before the
// migration checkpoint leave the device untouched; a relocation
// failure rolls the moved blocks back before surfacing; a pass-3
// failure leaves the checkpoint in place and tells the user to run
// --rollback.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{error, info};

use fsmorph_core::{
    BlockConverter, BlockDevice, ConvertError, ConvertOptions, ConvertPhase, ConvertProgress,
    ConvertSummary, DryRunReport, FileBlockDevice, ProgressCallback,
};

use crate::btrfs::reader::{BtrfsReader, ReadOutcome};
use crate::btrfs::structures::FIRST_FREE_OBJECTID;
use crate::ext4::alloc::BlockAllocator;
use crate::ext4::constants::{EXT4_FIRST_INO, EXT4_ROOT_INO};
use crate::ext4::layout::{self, Ext4Layout};
use crate::ext4::writer::Ext4Writer;
use crate::inode_map::{self, InodeMap};
use crate::model::FsInfo;
use crate::relocate::{self, migration, RelocationPlan};

pub struct Btrfs2Ext4Converter;

impl Btrfs2Ext4Converter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Btrfs2Ext4Converter {
    fn default() -> Self {
        Self::new()
    }
}

fn report(progress: &dyn ProgressCallback, phase: ConvertPhase, step: &str, pct: f32) {
    progress.on_progress(&ConvertProgress::new(phase, step, pct));
}

/// Refuse to convert a mounted device.
#[cfg(target_os = "linux")]
fn check_not_mounted(path: &Path) -> Result<(), ConvertError> {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mounts = std::fs::read_to_string("/proc/mounts").unwrap_or_default();
    for line in mounts.lines() {
        if let Some(source) = line.split_whitespace().next() {
            if Path::new(source) == canonical {
                return Err(ConvertError::invariant(format!(
                    "{} is mounted; unmount it first or pass --force",
                    canonical.display()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn check_not_mounted(_path: &Path) -> Result<(), ConvertError> {
    Ok(())
}

/// Pass 1 and the planning half of pass 2, shared by dry runs and real
/// conversions.
struct Planned {
    outcome: ReadOutcome,
    layout: Ext4Layout,
    alloc: BlockAllocator,
    plan: RelocationPlan,
    /// First block and length of the protected checkpoint region.
    checkpoint: (u64, u64),
}

fn read_and_plan(
    device: &dyn BlockDevice,
    options: &ConvertOptions,
) -> Result<Planned, ConvertError> {
    let outcome = BtrfsReader::new(device).read()?;
    let layout = layout::plan_layout(
        device.size(),
        options.block_size,
        options.inode_ratio,
        &outcome.info,
    )?;
    let mut alloc = BlockAllocator::new(&layout, &outcome.info.used_blocks);

    // Keep the rollback checkpoint region (entry array, footer,
    // superblock backup) out of reach of relocation destinations and
    // pass-3 allocations. The region is sized for an upper bound on
    // the entry count - the real array only ever starts higher.
    let extent_count: usize = outcome.info.entries.iter().map(|e| e.extents.len()).sum();
    let entry_bound = (extent_count * 2 + 64).min(migration::MAX_ENTRIES);
    let checkpoint =
        migration::protected_blocks(device.size(), entry_bound, options.block_size);
    alloc.mark_used(checkpoint.0, checkpoint.1);

    let plan = relocate::build_plan(&outcome.info, &outcome.chunks, &layout, &mut alloc)?;
    Ok(Planned {
        outcome,
        layout,
        alloc,
        plan,
        checkpoint,
    })
}

/// Assign ext4 inode numbers: the btrfs root directory becomes inode
/// 2, everything else gets contiguous numbers from 11 in
/// `(parent_ino, ino)` order so siblings land in adjacent inode table
/// slots.
fn build_inode_map(
    fs: &FsInfo,
    workdir: PathBuf,
    memory_limit: u64,
) -> Result<InodeMap, ConvertError> {
    let mut order: Vec<(u64, u64)> = fs
        .entries
        .iter()
        .filter(|e| e.ino != FIRST_FREE_OBJECTID)
        .map(|e| (e.parent_ino, e.ino))
        .collect();
    order.sort_unstable();

    let mut map = InodeMap::new(workdir, memory_limit);
    map.add(FIRST_FREE_OBJECTID, EXT4_ROOT_INO)?;
    let mut next = EXT4_FIRST_INO;
    for (_, ino) in order {
        map.add(ino, next)?;
        next += 1;
    }
    map.build_hash();
    Ok(map)
}

pub fn run_conversion(
    device_path: &Path,
    options: &ConvertOptions,
    progress: &dyn ProgressCallback,
) -> Result<ConvertSummary, ConvertError> {
    options.validate()?;
    if !options.force {
        check_not_mounted(device_path)?;
    }
    let workdir = options
        .workdir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    inode_map::check_workdir(&workdir)?;
    let memory_limit = inode_map::effective_memory_limit(options.memory_limit_mb);

    let started = Instant::now();
    let device = FileBlockDevice::open(device_path, false)?;

    report(progress, ConvertPhase::Read, "reading btrfs structures", 0.0);
    let Planned {
        mut outcome,
        layout,
        alloc,
        mut plan,
        checkpoint,
    } = read_and_plan(&device, options)?;

    report(progress, ConvertPhase::Plan, "saving rollback checkpoint", 25.0);
    migration::save(&device, &outcome.superblock.raw, &plan)?;

    report(
        progress,
        ConvertPhase::Relocate,
        "moving conflicting data blocks",
        35.0,
    );
    relocate::execute(&device, &mut plan, &mut outcome.info, &outcome.chunks)?;

    report(progress, ConvertPhase::Write, "writing ext4 structures", 55.0);
    let map = build_inode_map(&outcome.info, workdir, memory_limit)?;
    let stats_result = (|| {
        let mut writer =
            Ext4Writer::new(&device, &layout, &mut outcome.info, &map, alloc, checkpoint)?;
        let stats = writer.run()?;
        report(progress, ConvertPhase::Verify, "verifying written metadata", 95.0);
        writer.verify()?;
        Ok(stats)
    })();

    let stats = match stats_result {
        Ok(stats) => stats,
        Err(e) => {
            error!(
                "ext4 write failed: {}. The device is NOT consistent; run \
                 `fsmorph --rollback {}` to restore the btrfs volume. Do not \
                 run a filesystem checker first - it would destroy the \
                 evidence rollback needs.",
                e,
                device_path.display()
            );
            return Err(e);
        }
    };

    report(progress, ConvertPhase::Verify, "done", 100.0);
    Ok(ConvertSummary {
        inodes_written: stats.inodes_written,
        directories_written: stats.directories_written,
        relocated_bytes: plan.total_bytes(),
        journal_blocks: stats.journal_blocks,
        elapsed_secs: started.elapsed().as_secs_f64(),
    })
}

pub fn run_dry_run(
    device_path: &Path,
    options: &ConvertOptions,
) -> Result<DryRunReport, ConvertError> {
    options.validate()?;
    let device = FileBlockDevice::open(device_path, true)?;
    let planned = read_and_plan(&device, options)?;

    // Read-only integrity sweep over every block the conversion would
    // move: prove they are readable before anyone commits to writing.
    let mut buf = vec![0u8; 1 << 20];
    for entry in &planned.plan.entries {
        let mut off = 0u64;
        while off < entry.length {
            let n = buf.len().min((entry.length - off) as usize);
            device.read_at(entry.src_offset + off, &mut buf[..n])?;
            off += n as u64;
        }
    }
    info!(
        "dry run: {} conflict block(s), {} relocation entr{} covering {} byte(s)",
        planned.plan.conflict_blocks,
        planned.plan.entries.len(),
        if planned.plan.entries.len() == 1 { "y" } else { "ies" },
        planned.plan.total_bytes()
    );

    let fs = &planned.outcome.info;
    Ok(DryRunReport {
        device: device_path.to_path_buf(),
        device_size: device.size(),
        volume_label: fs.label.clone(),
        block_size: options.block_size,
        total_blocks: planned.layout.total_blocks,
        block_groups: planned.layout.num_groups,
        total_inodes: planned.layout.total_inodes,
        file_count: fs.file_count(),
        directory_count: fs.directory_count(),
        conflict_blocks: planned.plan.conflict_blocks,
        relocation_entries: planned.plan.entries.len(),
        relocation_bytes: planned.plan.total_bytes(),
        dedup_blocks_needed: fs.dedup_blocks_needed,
        compressed_extents: fs.compression.extent_count(),
        compression_expansion_bytes: fs.compression.expansion_bytes(),
        warnings: dry_run_warnings(fs, &planned.layout),
    })
}

fn dry_run_warnings(fs: &FsInfo, layout: &Ext4Layout) -> Vec<String> {
    let mut warnings = Vec::new();
    if fs.compression.extent_count() > 0 {
        warnings.push(format!(
            "{} compressed extent(s) will be stored uncompressed (+{} bytes)",
            fs.compression.extent_count(),
            fs.compression.expansion_bytes()
        ));
    }
    if fs.dedup_blocks_needed > 0 {
        warnings.push(format!(
            "{} CoW-shared block(s) will be duplicated",
            fs.dedup_blocks_needed
        ));
    }
    if !fs.used_blocks_from_extent_tree {
        warnings.push("extent tree unreadable; space usage derived from file extents".into());
    }
    let slack = layout.total_blocks
        - layout.reserved_blocks.len() as u64
        - layout.data_blocks_required;
    if slack < layout.total_blocks / 10 {
        warnings.push(format!("only {} spare block(s) after conversion", slack));
    }
    warnings
}

pub fn run_rollback(device_path: &Path) -> Result<(), ConvertError> {
    let device = FileBlockDevice::open(device_path, false)?;
    migration::rollback(&device)
}

#[async_trait::async_trait]
impl BlockConverter for Btrfs2Ext4Converter {
    fn name(&self) -> &'static str {
        "btrfs-to-ext4"
    }

    async fn dry_run(
        &self,
        device: PathBuf,
        options: ConvertOptions,
    ) -> Result<DryRunReport, ConvertError> {
        tokio::task::spawn_blocking(move || run_dry_run(&device, &options))
            .await
            .map_err(|e| ConvertError::invariant(format!("dry run task failed: {}", e)))?
    }

    async fn convert(
        &self,
        device: PathBuf,
        options: ConvertOptions,
        progress: Arc<dyn ProgressCallback>,
    ) -> Result<ConvertSummary, ConvertError> {
        tokio::task::spawn_blocking(move || run_conversion(&device, &options, progress.as_ref()))
            .await
            .map_err(|e| ConvertError::invariant(format!("conversion task failed: {}", e)))?
    }

    async fn rollback(&self, device: PathBuf) -> Result<(), ConvertError> {
        tokio::task::spawn_blocking(move || run_rollback(&device))
            .await
            .map_err(|e| ConvertError::invariant(format!("rollback task failed: {}", e)))?
    }
}
