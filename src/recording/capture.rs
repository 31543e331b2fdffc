// Capture loop
//
// Owns the frame source and runs the fixed-duration acquisition loop. Frames
// are handed to the workers by value over bounded queues:
// - writer queue: every frame, blocking send (slow encoding throttles capture)
// - preview queue: every Nth frame, subsampled, non-blocking (never throttles)
// - realtime tap: every Nth frame, non-blocking
//
// Shutdown is always marker-driven: the source is stopped, each queue gets
// exactly one end-of-stream marker (writer first), the workers are joined and
// only then are the timestamp files written.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use ndarray::Array2;

use super::preview::{subsample, PreviewConfig, PreviewReport, PreviewSink, PreviewWorker};
use super::writer::{FrameWriter, WriterConfig, WriterError, WriterFault, WriterReport};
use super::{CaptureState, Handoff, QueueConfig};
use crate::devices::{Capture, FramePair, FrameSource, SourceError};
use crate::session::{SessionError, TimestampSeries};

/// Error type for the capture loop
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Loop timing and fan-out settings
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    /// Recording stops once this much wall-clock time has elapsed
    pub duration: Duration,
    /// Print elapsed/target seconds to stdout while recording
    pub display_time: bool,
    /// Progress is printed every this many frames
    pub progress_every: u64,
    /// Send every Nth frame to the preview
    pub preview_every: u64,
    /// Spatial subsampling of preview frames
    pub preview_subsample: usize,
    /// Send every Nth frame to the realtime tap
    pub tap_every: u64,
}

impl CaptureSettings {
    pub fn new(duration: Duration) -> Self {
        let preview = PreviewConfig::default();
        Self {
            duration,
            display_time: false,
            progress_every: 15,
            preview_every: preview.every,
            preview_subsample: preview.subsample,
            tap_every: 3,
        }
    }

    pub fn with_preview_config(mut self, preview: &PreviewConfig) -> Self {
        self.preview_every = preview.every;
        self.preview_subsample = preview.subsample;
        self
    }
}

/// Full-resolution infrared frame for an external realtime consumer
#[derive(Debug, Clone)]
pub struct TapFrame {
    pub camera: String,
    pub infrared: Array2<u16>,
    pub device_timestamp_usec: u64,
}

/// Why recording ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    StreamInterrupted(String),
    DeviceError(String),
    WriterFault(String),
}

/// Outcome of a completed capture loop
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub state: CaptureState,
    pub stop_reason: StopReason,
    /// Frame pairs captured and enqueued to the writer
    pub frames: u64,
    pub dropped: u64,
    /// Frames offered to the preview queue and accepted
    pub preview_enqueued: u64,
    /// Frames offered to the preview queue while it was full
    pub preview_skipped: u64,
    pub tap_enqueued: u64,
    pub timestamps: TimestampSeries,
    pub frame_rate: Option<f64>,
    pub elapsed: Duration,
    pub writer: WriterReport,
    pub preview: Option<PreviewReport>,
}

struct PreviewSetup {
    sink: Box<dyn PreviewSink>,
    abort: Receiver<()>,
}

/// The acquisition orchestrator for one camera
pub struct CaptureLoop<S: FrameSource> {
    source: S,
    output_dir: PathBuf,
    settings: CaptureSettings,
    writer: WriterConfig,
    queues: QueueConfig,
    preview: Option<PreviewSetup>,
    tap: Option<Sender<Handoff<TapFrame>>>,
    state: CaptureState,
}

impl<S: FrameSource> CaptureLoop<S> {
    pub fn new(source: S, output_dir: impl Into<PathBuf>, settings: CaptureSettings, writer: WriterConfig) -> Self {
        Self {
            source,
            output_dir: output_dir.into(),
            settings,
            writer,
            queues: QueueConfig::default(),
            preview: None,
            tap: None,
            state: CaptureState::Starting,
        }
    }

    pub fn with_queues(mut self, queues: QueueConfig) -> Self {
        self.queues = queues;
        self
    }

    /// Render decimated infrared frames into `sink`; a message on `abort`
    /// closes the preview without stopping the recording
    pub fn with_preview(mut self, sink: Box<dyn PreviewSink>, abort: Receiver<()>) -> Self {
        self.preview = Some(PreviewSetup { sink, abort });
        self
    }

    /// Feed every Nth infrared frame to an external consumer
    pub fn with_tap(mut self, tap: Sender<Handoff<TapFrame>>) -> Self {
        self.tap = Some(tap);
        self
    }

    fn transition(&mut self, next: CaptureState) {
        log::debug!("[Capture {}] {:?} -> {:?}", self.source.name(), self.state, next);
        self.state = next;
    }

    /// Record until the duration elapses or the device fails, then shut down
    /// the workers and write the timestamp files
    pub fn run(mut self) -> Result<CaptureReport> {
        let camera = self.source.name().to_string();

        // Workers first, so the first frame never waits on a thread spawn
        let (writer_tx, writer_rx) = bounded(self.queues.writer.max(1));
        let (fault_tx, fault_rx) = bounded::<WriterFault>(1);
        let writer = FrameWriter::spawn(writer_rx, self.writer.clone(), fault_tx)?;

        let mut preview_tx = None;
        let mut preview_worker = None;
        if let Some(setup) = self.preview.take() {
            let (tx, rx) = bounded(self.queues.preview.max(1));
            match PreviewWorker::spawn(rx, setup.sink, setup.abort) {
                Ok(worker) => {
                    preview_tx = Some(tx);
                    preview_worker = Some(worker);
                }
                Err(e) => log::warn!("[Capture {}] Preview unavailable: {}", camera, e),
            }
        }
        let mut fanout = Fanout::new(&camera, &self.settings, writer_tx, preview_tx, self.tap.take());

        if let Err(e) = self.source.start() {
            log::error!("[Capture {}] Failed to start device: {}", camera, e);
            self.transition(CaptureState::Failed);
            self.source.stop();
            fanout.end_of_stream();
            if let Err(writer_err) = writer.join() {
                log::warn!("[Capture {}] Writer: {}", camera, writer_err);
            }
            if let Some(worker) = preview_worker {
                let _ = worker.join();
            }
            return Err(CaptureError::Source(e));
        }

        self.transition(CaptureState::Recording);
        log::info!(
            "[Capture {}] Recording for {:.1} s",
            camera,
            self.settings.duration.as_secs_f64()
        );

        let mut timestamps = TimestampSeries::new();
        let mut frames = 0u64;
        let mut dropped = 0u64;
        let mut stop_reason = StopReason::DurationElapsed;

        let started = Instant::now();
        while started.elapsed() < self.settings.duration {
            if let Ok(WriterFault(message)) = fault_rx.try_recv() {
                stop_reason = StopReason::WriterFault(message);
                break;
            }

            let pair = match self.source.next_frame() {
                Ok(Capture::Frame(pair)) => pair,
                Ok(Capture::Dropped) => {
                    dropped += 1;
                    log::debug!("[Capture {}] Dropped frame", camera);
                    continue;
                }
                Err(SourceError::StreamInterrupted(message)) => {
                    log::warn!("[Capture {}] Recording stopped early: {}", camera, message);
                    stop_reason = StopReason::StreamInterrupted(message);
                    break;
                }
                Err(e) => {
                    log::error!("[Capture {}] Recording stopped early: {}", camera, e);
                    stop_reason = StopReason::DeviceError(e.to_string());
                    break;
                }
            };

            let (host, device) = (pair.host_timestamp, pair.device_timestamp_usec);
            if !fanout.dispatch(pair, frames) {
                stop_reason = StopReason::WriterFault("writer queue closed".into());
                break;
            }
            timestamps.push(host, device);
            frames += 1;

            if self.settings.display_time && frames % self.settings.progress_every.max(1) == 0 {
                print!(
                    "\rRecorded {} out of {} seconds",
                    started.elapsed().as_secs(),
                    self.settings.duration.as_secs_f64()
                );
                let _ = std::io::stdout().flush();
            }
        }
        let elapsed = started.elapsed();

        // Stopping: device first, then one marker per queue, writer first
        self.transition(CaptureState::Stopping);
        self.source.stop();
        fanout.end_of_stream();

        let writer_result = writer.join();
        let preview = match preview_worker {
            Some(worker) => match worker.join() {
                Ok(report) => Some(report),
                Err(e) => {
                    log::warn!("[Capture {}] {}", camera, e);
                    None
                }
            },
            None => None,
        };

        let writer_report = match writer_result {
            Ok(report) => report,
            Err(e) => {
                self.transition(CaptureState::Failed);
                log::error!(
                    "[Capture {}] Session failed after {} frames; timestamps not written",
                    camera,
                    frames
                );
                return Err(CaptureError::Writer(e));
            }
        };

        if writer_report.frames_written != frames {
            log::error!(
                "[Capture {}] Writer encoded {} frames but {} were captured",
                camera,
                writer_report.frames_written,
                frames
            );
        }

        timestamps.write(&self.output_dir)?;
        let frame_rate = timestamps.frame_rate();
        self.transition(CaptureState::Stopped);

        if self.settings.display_time {
            println!();
        }
        match frame_rate {
            Some(rate) => println!(" - {}: {} frames, frame rate = {:.3}", camera, frames, rate),
            None => println!(" - {}: {} frames", camera, frames),
        }
        if dropped > 0 {
            log::info!("[Capture {}] {} dropped frames", camera, dropped);
        }

        Ok(CaptureReport {
            state: self.state,
            stop_reason,
            frames,
            dropped,
            preview_enqueued: fanout.preview_enqueued,
            preview_skipped: fanout.preview_skipped,
            tap_enqueued: fanout.tap_enqueued,
            timestamps,
            frame_rate,
            elapsed,
            writer: writer_report,
            preview,
        })
    }
}

/// The queues one captured pair is handed to
struct Fanout {
    camera: String,
    writer: Sender<Handoff<FramePair>>,
    preview: Option<Sender<Handoff<Array2<u16>>>>,
    tap: Option<Sender<Handoff<TapFrame>>>,
    preview_every: u64,
    preview_subsample: usize,
    tap_every: u64,
    preview_enqueued: u64,
    preview_skipped: u64,
    tap_enqueued: u64,
}

impl Fanout {
    fn new(
        camera: &str,
        settings: &CaptureSettings,
        writer: Sender<Handoff<FramePair>>,
        preview: Option<Sender<Handoff<Array2<u16>>>>,
        tap: Option<Sender<Handoff<TapFrame>>>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            writer,
            preview,
            tap,
            preview_every: settings.preview_every.max(1),
            preview_subsample: settings.preview_subsample,
            tap_every: settings.tap_every.max(1),
            preview_enqueued: 0,
            preview_skipped: 0,
            tap_enqueued: 0,
        }
    }

    /// Hand frame `index` to the writer, then to the preview and the tap.
    ///
    /// Returns false when the writer queue is closed; nothing else sees the
    /// frame in that case.
    fn dispatch(&mut self, pair: FramePair, index: u64) -> bool {
        let preview_frame = (self.preview.is_some() && index % self.preview_every == 0)
            .then(|| subsample(&pair.infrared, self.preview_subsample));
        let tap_frame = (self.tap.is_some() && index % self.tap_every == 0).then(|| TapFrame {
            camera: self.camera.clone(),
            infrared: pair.infrared.clone(),
            device_timestamp_usec: pair.device_timestamp_usec,
        });

        // Blocks while the writer is behind
        if self.writer.send(Handoff::Frame(pair)).is_err() {
            return false;
        }

        if let (Some(frame), Some(tx)) = (preview_frame, &self.preview) {
            match tx.try_send(Handoff::Frame(frame)) {
                Ok(()) => self.preview_enqueued += 1,
                Err(TrySendError::Full(_)) => self.preview_skipped += 1,
                Err(TrySendError::Disconnected(_)) => {
                    log::info!("[Capture {}] Preview closed, recording continues", self.camera);
                    self.preview = None;
                }
            }
        }

        if let (Some(frame), Some(tx)) = (tap_frame, &self.tap) {
            match tx.try_send(Handoff::Frame(frame)) {
                Ok(()) => self.tap_enqueued += 1,
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => self.tap = None,
            }
        }
        true
    }

    /// One end-of-stream marker per queue: writer, preview, then tap
    fn end_of_stream(&mut self) {
        let _ = self.writer.send(Handoff::EndOfStream);
        if let Some(tx) = self.preview.take() {
            let _ = tx.send(Handoff::EndOfStream);
        }
        if let Some(tx) = self.tap.take() {
            if tx.send_timeout(Handoff::EndOfStream, Duration::from_secs(1)).is_err() {
                log::warn!("[Capture {}] Realtime consumer did not take end of stream", self.camera);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::EncoderError;

    fn pair(device_timestamp_usec: u64) -> FramePair {
        FramePair {
            depth: Array2::zeros((4, 6)),
            infrared: Array2::from_elem((4, 6), 1000),
            device_timestamp_usec,
            host_timestamp: 1.0,
        }
    }

    fn every_frame() -> CaptureSettings {
        CaptureSettings {
            preview_every: 1,
            tap_every: 1,
            ..CaptureSettings::new(Duration::from_secs(1))
        }
    }

    #[test]
    fn writer_gets_the_pair_before_preview_and_tap() {
        let (writer_tx, writer_rx) = bounded(4);
        let (preview_tx, preview_rx) = bounded(4);
        let (tap_tx, tap_rx) = bounded(4);
        let mut fanout = Fanout::new("cam", &every_frame(), writer_tx, Some(preview_tx), Some(tap_tx));

        assert!(fanout.dispatch(pair(7), 0));

        assert!(matches!(writer_rx.try_recv(), Ok(Handoff::Frame(p)) if p.device_timestamp_usec == 7));
        assert!(matches!(preview_rx.try_recv(), Ok(Handoff::Frame(f)) if f.dim() == (2, 3)));
        assert!(matches!(tap_rx.try_recv(), Ok(Handoff::Frame(t)) if t.camera == "cam"));
        assert_eq!((fanout.preview_enqueued, fanout.tap_enqueued), (1, 1));
    }

    #[test]
    fn closed_writer_queue_hides_the_frame_from_everyone() {
        let (writer_tx, writer_rx) = bounded(4);
        drop(writer_rx);
        let (preview_tx, preview_rx) = bounded(4);
        let (tap_tx, tap_rx) = bounded(4);
        let mut fanout = Fanout::new("cam", &every_frame(), writer_tx, Some(preview_tx), Some(tap_tx));

        assert!(!fanout.dispatch(pair(0), 0));

        assert!(preview_rx.try_recv().is_err());
        assert!(tap_rx.try_recv().is_err());
        assert_eq!((fanout.preview_enqueued, fanout.tap_enqueued), (0, 0));
    }

    #[test]
    fn full_preview_queue_skips_without_blocking() {
        let (writer_tx, _writer_rx) = bounded(8);
        let (preview_tx, _preview_rx) = bounded(1);
        let mut fanout = Fanout::new("cam", &every_frame(), writer_tx, Some(preview_tx), None);

        for i in 0..3 {
            assert!(fanout.dispatch(pair(i), i));
        }
        assert_eq!((fanout.preview_enqueued, fanout.preview_skipped), (1, 2));
    }

    #[test]
    fn end_of_stream_reaches_every_queue_once() {
        let (writer_tx, writer_rx) = bounded(1);
        let (preview_tx, preview_rx) = bounded(1);
        let (tap_tx, tap_rx) = bounded(1);
        let mut fanout = Fanout::new("cam", &every_frame(), writer_tx, Some(preview_tx), Some(tap_tx));

        fanout.end_of_stream();

        assert!(matches!(writer_rx.try_recv(), Ok(Handoff::EndOfStream)));
        assert!(matches!(preview_rx.try_recv(), Ok(Handoff::EndOfStream)));
        assert!(matches!(tap_rx.try_recv(), Ok(Handoff::EndOfStream)));
        // Senders were released; the preview and tap queues are now closed
        assert!(preview_rx.recv().is_err());
        assert!(tap_rx.recv().is_err());
    }

    #[test]
    fn wrapped_errors_print_each_cause_once() {
        let encoder = EncoderError::FrameShape {
            path: "depth.avi".into(),
            expected: crate::devices::Resolution::new(4, 4),
            actual: (2, 2),
        };
        let err = anyhow::Error::new(CaptureError::from(WriterError::from(encoder)))
            .context("Primary camera recording failed");

        let text = format!("{:#}", err);
        assert_eq!(text.matches("does not match").count(), 1, "{}", text);
        assert!(text.starts_with("Primary camera recording failed: "));
    }
}
