// Live preview of the infrared stream
//
// The preview trades frame accuracy for latency: after every render the
// backlog is discarded, so the next frame shown is always the newest one.
// Nothing here affects recorded data.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crossbeam_channel::{never, select, Receiver};
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use super::Handoff;

/// Lower clip bound of the infrared contrast stretch
pub const IR_CLIP_MIN: u16 = 160;
/// Upper clip bound of the infrared contrast stretch
pub const IR_CLIP_MAX: u16 = 5500;

/// Error type for preview rendering
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn preview thread: {0}")]
    Spawn(std::io::Error),

    #[error("Preview thread panicked")]
    Panicked,
}

pub type Result<T> = std::result::Result<T, PreviewError>;

/// Preview options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Send every Nth captured frame to the preview
    #[serde(default = "default_every")]
    pub every: u64,

    /// Spatial subsampling step applied before sending
    #[serde(default = "default_subsample")]
    pub subsample: usize,

    /// Directory for the preview image. Defaults to the session directory.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            every: default_every(),
            subsample: default_subsample(),
            output_dir: None,
        }
    }
}

fn default_every() -> u64 {
    2
}

fn default_subsample() -> usize {
    2
}

/// Contrast-stretch an infrared frame to 8 bits: clip to
/// [`IR_CLIP_MIN`, `IR_CLIP_MAX`], then `(ln(x) - 5) * 70`, truncated.
pub fn render_infrared(frame: ArrayView2<u16>) -> Array2<u8> {
    frame.mapv(|x| {
        let x = f64::from(x.clamp(IR_CLIP_MIN, IR_CLIP_MAX));
        ((x.ln() - 5.0) * 70.0) as u8
    })
}

/// Keep every `step`-th row and column
pub fn subsample(frame: &Array2<u16>, step: usize) -> Array2<u16> {
    let step = step.max(1) as isize;
    frame.slice(s![..;step, ..;step]).to_owned()
}

/// What the preview should do after showing a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewControl {
    Continue,
    /// The user asked to close the preview. Recording continues.
    Abort,
}

/// Somewhere to show rendered preview frames
pub trait PreviewSink: Send {
    fn show(&mut self, image: &Array2<u8>) -> Result<PreviewControl>;

    /// Called once when the preview worker terminates
    fn close(&mut self) {}
}

/// Overwrites `preview.png` with every rendered frame, atomically, so any
/// image viewer that reloads on change can follow the recording.
pub struct PngSnapshotSink {
    path: PathBuf,
    temp_path: PathBuf,
}

impl PngSnapshotSink {
    pub const FILE_NAME: &'static str = "preview.png";

    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(Self::FILE_NAME),
            temp_path: dir.join(".preview.png.tmp"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreviewSink for PngSnapshotSink {
    fn show(&mut self, image: &Array2<u8>) -> Result<PreviewControl> {
        let (rows, cols) = image.dim();
        let pixels: Vec<u8> = image.iter().copied().collect();
        let buffer = image::GrayImage::from_raw(cols as u32, rows as u32, pixels).ok_or_else(|| {
            PreviewError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "preview buffer does not match its dimensions",
            ))
        })?;
        buffer.save_with_format(&self.temp_path, image::ImageFormat::Png)?;
        std::fs::rename(&self.temp_path, &self.path)?;
        Ok(PreviewControl::Continue)
    }

    fn close(&mut self) {
        let _ = std::fs::remove_file(&self.temp_path);
    }
}

/// Summary of a finished preview worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewReport {
    pub rendered: u64,
    /// Backlog frames skipped to stay current
    pub discarded: u64,
    /// Closed by the user rather than by end of stream
    pub aborted: bool,
}

/// Handle to a running preview thread
pub struct PreviewWorker {
    handle: JoinHandle<PreviewReport>,
}

impl PreviewWorker {
    /// Start the worker. A message on `abort` closes the preview early.
    pub fn spawn(
        frames: Receiver<Handoff<Array2<u16>>>,
        sink: Box<dyn PreviewSink>,
        abort: Receiver<()>,
    ) -> Result<Self> {
        let handle = std::thread::Builder::new()
            .name("depth-acquire-preview".into())
            .spawn(move || run(frames, sink, abort))
            .map_err(PreviewError::Spawn)?;
        Ok(Self { handle })
    }

    pub fn join(self) -> Result<PreviewReport> {
        self.handle.join().map_err(|_| PreviewError::Panicked)
    }
}

enum Event {
    Item(std::result::Result<Handoff<Array2<u16>>, crossbeam_channel::RecvError>),
    Abort,
    AbortClosed,
}

fn run(frames: Receiver<Handoff<Array2<u16>>>, mut sink: Box<dyn PreviewSink>, abort: Receiver<()>) -> PreviewReport {
    let mut report = PreviewReport::default();
    let mut abort = abort;

    'preview: loop {
        let event = select! {
            recv(frames) -> msg => Event::Item(msg),
            recv(abort) -> msg => if msg.is_ok() { Event::Abort } else { Event::AbortClosed },
        };

        let item = match event {
            Event::Item(item) => item,
            Event::Abort => {
                report.aborted = true;
                break;
            }
            Event::AbortClosed => {
                // Nobody can abort any more
                abort = never();
                continue;
            }
        };

        let frame = match item {
            Ok(Handoff::Frame(frame)) => frame,
            Ok(Handoff::EndOfStream) | Err(_) => break,
        };

        match sink.show(&render_infrared(frame.view())) {
            Ok(PreviewControl::Continue) => report.rendered += 1,
            Ok(PreviewControl::Abort) => {
                report.rendered += 1;
                report.aborted = true;
                break;
            }
            Err(e) => {
                log::warn!("[Preview] Rendering failed, closing preview: {}", e);
                break;
            }
        }

        // Drop whatever piled up while rendering
        loop {
            match frames.try_recv() {
                Ok(Handoff::Frame(_)) => report.discarded += 1,
                Ok(Handoff::EndOfStream) => break 'preview,
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => break 'preview,
            }
        }
    }

    sink.close();
    if report.aborted {
        log::info!("[Preview] Closed by user; recording continues");
    }
    log::debug!(
        "[Preview] Rendered {} frames, discarded {}",
        report.rendered,
        report.discarded
    );
    report
}

/// Abort signal fed by standard input: a line containing `q` fires it.
///
/// The reader thread is detached and lives until the process exits.
pub fn stdin_abort_signal() -> Receiver<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let spawned = std::thread::Builder::new()
        .name("depth-acquire-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().eq_ignore_ascii_case("q") {
                    let _ = tx.send(());
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        log::warn!("Preview abort key unavailable: {}", e);
    }
    rx
}
