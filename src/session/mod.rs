// Session directory, metadata and timestamp files

pub mod metadata;
pub mod storage;

pub use metadata::*;
pub use storage::*;

/// Recording metadata, written before the first frame
pub const METADATA_FILE: &str = "metadata.json";
/// Lossless depth video
pub const DEPTH_VIDEO_FILE: &str = "depth.avi";
/// Lossless infrared video
pub const IR_VIDEO_FILE: &str = "ir.avi";
/// Host wall-clock timestamps (seconds), one per frame
pub const HOST_TIMESTAMPS_FILE: &str = "depth_ts.txt";
/// Device timestamps (microseconds), one per frame
pub const DEVICE_TIMESTAMPS_FILE: &str = "device_ts.txt";
/// Output directory of the secondary camera in paired mode
pub const SECONDARY_DIR: &str = "secondary";

/// Error type for session storage
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Base directory does not exist: {0}")]
    BaseDirMissing(std::path::PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
