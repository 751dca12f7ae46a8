use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::ConvertError;
use crate::progress::ProgressCallback;

/// Tunable parameters for a conversion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertOptions {
    /// Ext4 block size; one of 1024, 2048, 4096.
    pub block_size: u32,
    /// Bytes of device space per ext4 inode.
    pub inode_ratio: u32,
    /// Directory for disk-backed spill files. Must not be RAM-backed.
    pub workdir: Option<PathBuf>,
    /// Megabytes of table memory before spilling to the workdir.
    /// `None` selects 60% of total RAM.
    pub memory_limit_mb: Option<u64>,
    /// Convert even if the device appears to be mounted.
    pub force: bool,
    /// Free-form passthrough options.
    pub additional_options: HashMap<String, String>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            inode_ratio: 16384,
            workdir: None,
            memory_limit_mb: None,
            force: false,
            additional_options: HashMap::new(),
        }
    }
}

impl ConvertOptions {
    pub fn validate(&self) -> Result<(), ConvertError> {
        match self.block_size {
            1024 | 2048 | 4096 => {}
            other => {
                return Err(ConvertError::unsupported(format!(
                    "block size {} (supported: 1024, 2048, 4096)",
                    other
                )))
            }
        }
        if self.inode_ratio < 1024 {
            return Err(ConvertError::unsupported(format!(
                "inode ratio {} is below 1024 bytes per inode",
                self.inode_ratio
            )));
        }
        Ok(())
    }
}

/// Result of a dry run: everything the conversion would do, without
/// touching the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunReport {
    pub device: PathBuf,
    pub device_size: u64,
    pub volume_label: String,
    pub block_size: u32,
    pub total_blocks: u64,
    pub block_groups: u32,
    pub total_inodes: u32,
    pub file_count: u64,
    pub directory_count: u64,
    /// Blocks of user data that collide with planned ext4 metadata.
    pub conflict_blocks: u64,
    pub relocation_entries: usize,
    pub relocation_bytes: u64,
    /// Extra blocks needed because ext4 cannot share CoW extents.
    pub dedup_blocks_needed: u64,
    pub compressed_extents: u64,
    /// Bytes the compressed extents will occupy once stored raw.
    pub compression_expansion_bytes: u64,
    pub warnings: Vec<String>,
}

/// Summary of a completed conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertSummary {
    pub inodes_written: u32,
    pub directories_written: u32,
    pub relocated_bytes: u64,
    pub journal_blocks: u64,
    pub elapsed_secs: f64,
}

/// Public surface of an in-place filesystem converter.
///
/// The engine behind each implementation runs synchronously on one
/// thread; the async surface exists so front-ends can drive conversions
/// from an async context without blocking their runtime threads for the
/// whole run.
#[async_trait::async_trait]
pub trait BlockConverter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run passes 1 and 2 planning read-only and report what a real
    /// conversion would do.
    async fn dry_run(
        &self,
        device: PathBuf,
        options: ConvertOptions,
    ) -> Result<DryRunReport, ConvertError>;

    /// Convert the device in place.
    async fn convert(
        &self,
        device: PathBuf,
        options: ConvertOptions,
        progress: std::sync::Arc<dyn ProgressCallback>,
    ) -> Result<ConvertSummary, ConvertError>;

    /// Reverse a previous conversion using the on-disk migration footer.
    async fn rollback(&self, device: PathBuf) -> Result<(), ConvertError>;
}
