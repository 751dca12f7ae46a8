// Progress reporting for conversion passes.

/// The pass currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertPhase {
    /// Pass 1: parsing btrfs structures.
    Read,
    /// Pass 2a: computing the ext4 layout and detecting conflicts.
    Plan,
    /// Pass 2b: journaled relocation of conflicting data blocks.
    Relocate,
    /// Pass 3: writing the ext4 filesystem.
    Write,
    /// Post-write verification sweep.
    Verify,
}

#[derive(Debug, Clone)]
pub struct ConvertProgress {
    pub phase: ConvertPhase,
    pub step_description: String,
    /// Percentage complete across the whole conversion (0-100).
    pub percentage: f32,
    /// Bytes relocated or written so far.
    pub bytes_done: u64,
    /// Estimated total bytes to move or write.
    pub bytes_total: u64,
}

impl ConvertProgress {
    pub fn new(phase: ConvertPhase, step: impl Into<String>, percentage: f32) -> Self {
        Self {
            phase,
            step_description: step.into(),
            percentage,
            bytes_done: 0,
            bytes_total: 0,
        }
    }
}

/// Callback invoked by the orchestrator as the conversion advances.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, progress: &ConvertProgress);
}

/// Progress sink that discards everything.
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _progress: &ConvertProgress) {}
}
