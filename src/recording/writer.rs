// Frame writer worker
//
// Consumes frame pairs from the writer queue and feeds the depth and infrared
// encoder pipelines in lock-step. Runs on its own thread so that disk-bound
// stalls throttle this worker, never the capture loop.

use std::path::PathBuf;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use super::Handoff;
use crate::devices::{FramePair, Resolution};
use crate::encoding::{EncoderError, EncoderPipeline, EncoderSettings, EncoderStats, PixelFormat};
use crate::session::{DEPTH_VIDEO_FILE, IR_VIDEO_FILE};

/// Error type for the writer worker
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("Failed to spawn writer thread: {0}")]
    Spawn(std::io::Error),

    #[error("Writer thread panicked")]
    Panicked,
}

pub type Result<T> = std::result::Result<T, WriterError>;

/// Writer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// No frame seen yet, no encoder running
    Idle,
    /// Encoders open, appending frames
    Running,
    /// End of stream received, finalizing encoders
    Draining,
    /// Encoders finalized
    Closed,
}

/// Where and how the two streams are encoded
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub output_dir: PathBuf,
    /// Declared frame size. When `None`, taken from the first frame.
    pub frame_size: Option<Resolution>,
    pub pixel_format: PixelFormat,
    pub depth: EncoderSettings,
    pub infrared: EncoderSettings,
}

impl WriterConfig {
    /// Same encoder settings for both streams
    pub fn new(output_dir: impl Into<PathBuf>, settings: EncoderSettings) -> Self {
        Self {
            output_dir: output_dir.into(),
            frame_size: None,
            pixel_format: PixelFormat::Gray16le,
            depth: settings.clone(),
            infrared: settings,
        }
    }

    pub fn with_frame_size(mut self, size: Resolution) -> Self {
        self.frame_size = Some(size);
        self
    }
}

/// Summary of a finished writer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriterReport {
    /// Frame pairs appended to both encoders
    pub frames_written: u64,
    /// `None` when the stream ended before the first frame
    pub depth: Option<EncoderStats>,
    pub infrared: Option<EncoderStats>,
}

/// Published on the fault channel when the writer fails. The full error
/// is returned from [`FrameWriter::join`].
#[derive(Debug, Clone)]
pub struct WriterFault(pub String);

/// Writer state machine, driven one queue item at a time
pub(crate) struct WriterWorker {
    config: WriterConfig,
    state: WriterState,
    depth: Option<EncoderPipeline>,
    infrared: Option<EncoderPipeline>,
    frames_written: u64,
}

impl WriterWorker {
    pub(crate) fn new(config: WriterConfig) -> Self {
        Self {
            config,
            state: WriterState::Idle,
            depth: None,
            infrared: None,
            frames_written: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> WriterState {
        self.state
    }

    /// Append one pair, opening the encoders on the first one
    pub(crate) fn write(&mut self, pair: &FramePair) -> Result<()> {
        if self.state == WriterState::Idle {
            self.open(pair.resolution())?;
        }

        let (Some(depth), Some(infrared)) = (self.depth.as_mut(), self.infrared.as_mut()) else {
            return Ok(());
        };
        depth.append(&pair.depth)?;
        infrared.append(&pair.infrared)?;
        self.frames_written += 1;
        Ok(())
    }

    fn open(&mut self, first_frame: Resolution) -> Result<()> {
        let size = self.config.frame_size.unwrap_or(first_frame);
        let format = self.config.pixel_format;

        let depth = EncoderPipeline::open(
            self.config.output_dir.join(DEPTH_VIDEO_FILE),
            format,
            size,
            &self.config.depth,
        )?;
        // A failed infrared spawn drops (and finalizes) the depth pipeline
        let infrared = EncoderPipeline::open(
            self.config.output_dir.join(IR_VIDEO_FILE),
            format,
            size,
            &self.config.infrared,
        )?;

        self.depth = Some(depth);
        self.infrared = Some(infrared);
        self.state = WriterState::Running;
        Ok(())
    }

    /// Finalize depth then infrared. Both are attempted; the first error wins.
    pub(crate) fn finish(&mut self) -> Result<WriterReport> {
        self.state = WriterState::Draining;

        let depth = self.depth.take().map(EncoderPipeline::finalize).transpose();
        let infrared = self.infrared.take().map(EncoderPipeline::finalize).transpose();
        self.state = WriterState::Closed;

        Ok(WriterReport {
            frames_written: self.frames_written,
            depth: depth?,
            infrared: infrared?,
        })
    }
}

/// Handle to a running writer thread
pub struct FrameWriter {
    handle: JoinHandle<Result<WriterReport>>,
}

impl FrameWriter {
    /// Start the worker on its own thread
    pub fn spawn(
        receiver: Receiver<Handoff<FramePair>>,
        config: WriterConfig,
        fault: Sender<WriterFault>,
    ) -> Result<Self> {
        let handle = std::thread::Builder::new()
            .name("depth-acquire-writer".into())
            .spawn(move || {
                let result = run(receiver, WriterWorker::new(config));
                if let Err(ref e) = result {
                    let message = std::iter::successors(Some(e as &dyn std::error::Error), |e| e.source())
                        .map(|e| e.to_string())
                        .collect::<Vec<_>>()
                        .join(": ");
                    log::error!("[Writer] {}", message);
                    let _ = fault.try_send(WriterFault(message));
                }
                result
            })
            .map_err(WriterError::Spawn)?;

        Ok(Self { handle })
    }

    /// Wait for the worker to terminate
    pub fn join(self) -> Result<WriterReport> {
        self.handle.join().map_err(|_| WriterError::Panicked)?
    }
}

fn run(receiver: Receiver<Handoff<FramePair>>, mut worker: WriterWorker) -> Result<WriterReport> {
    log::debug!("[Writer] Started");
    loop {
        match receiver.recv() {
            Ok(Handoff::Frame(pair)) => worker.write(&pair)?,
            Ok(Handoff::EndOfStream) => break,
            Err(_) => {
                log::warn!("[Writer] Queue closed without end of stream");
                break;
            }
        }
    }

    let report = worker.finish()?;
    log::info!("[Writer] Closed after {} frames", report.frames_written);
    Ok(report)
}
