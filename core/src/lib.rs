pub mod convert;
pub mod device;
pub mod error;
pub mod progress;

pub use convert::{BlockConverter, ConvertOptions, ConvertSummary, DryRunReport};
pub use device::{BatchWriter, BlockDevice, FileBlockDevice, BATCH_QUEUE_DEPTH};
pub use error::ConvertError;
pub use progress::{ConvertPhase, ConvertProgress, NoOpProgress, ProgressCallback};
