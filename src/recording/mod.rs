// Recording modules: the capture loop and the workers it feeds

pub mod capture;
pub mod preview;
pub mod writer;

pub use capture::{CaptureError, CaptureLoop, CaptureReport, CaptureSettings, StopReason, TapFrame};
pub use preview::{
    render_infrared, stdin_abort_signal, subsample, PngSnapshotSink, PreviewConfig, PreviewControl, PreviewError,
    PreviewReport, PreviewSink, PreviewWorker,
};
pub use writer::{FrameWriter, WriterConfig, WriterError, WriterFault, WriterReport, WriterState};

use serde::{Deserialize, Serialize};

/// Item carried on every handoff queue.
///
/// `EndOfStream` is sent exactly once per queue, after the last frame.
#[derive(Debug)]
pub enum Handoff<T> {
    Frame(T),
    EndOfStream,
}

/// Capture loop state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    /// Workers spawned, device not streaming yet
    Starting,
    /// Reading frames
    Recording,
    /// Device stopped, workers draining
    Stopping,
    /// Workers joined, timestamps written
    Stopped,
    /// Device failed to start, or the writer failed
    Failed,
}

/// Queue capacities between the capture loop and its workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Frame pairs buffered ahead of the writer
    #[serde(default = "default_writer_capacity")]
    pub writer: usize,

    /// Preview frames buffered ahead of the preview worker
    #[serde(default = "default_preview_capacity")]
    pub preview: usize,

    /// Frames buffered ahead of an external realtime consumer
    #[serde(default = "default_tap_capacity")]
    pub tap: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            writer: default_writer_capacity(),
            preview: default_preview_capacity(),
            tap: default_tap_capacity(),
        }
    }
}

fn default_writer_capacity() -> usize {
    64
}

fn default_preview_capacity() -> usize {
    4
}

fn default_tap_capacity() -> usize {
    16
}
