//! Encoder pipeline: one external lossless encoder process per video stream
//!
//! Raw frames are written to the encoder's standard input. The pipe provides
//! the backpressure: when the encoder falls behind, `append` blocks the
//! calling thread (the frame writer worker, never the capture loop).
//!
//! ## Lifecycle
//! - `open` spawns the process with stdin piped
//! - `append` validates the frame shape and writes exactly one frame
//! - `finalize` closes stdin and waits for the process to exit
//!
//! The encoder is never killed. Dropping an un-finalized pipeline closes
//! stdin and waits, so the output container is always flushed.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use ndarray::Array2;

use super::{EncoderSettings, PixelFormat};
use crate::devices::Resolution;

/// Error type for encoder operations
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("Failed to launch encoder '{program}' for {path}")]
    Spawn {
        program: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder for {path} exited with {status}")]
    Exit { path: PathBuf, status: ExitStatus },

    #[error("Frame shape {actual:?} does not match declared {expected} for {path}")]
    FrameShape {
        path: PathBuf,
        expected: Resolution,
        actual: (usize, usize),
    },

    #[error("IO error on encoder for {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, EncoderError>;

/// Statistics from one encoder run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    /// Raw bytes written to the encoder input
    pub bytes_written: u64,
    /// Size of the output file after the encoder exited
    pub output_bytes: u64,
    pub encoding_duration: Duration,
}

/// A running encoder process fed through its standard input
pub struct EncoderPipeline {
    path: PathBuf,
    pixel_format: PixelFormat,
    frame_size: Resolution,
    child: Child,
    stdin: Option<ChildStdin>,
    /// Reused serialization buffer, one frame long
    buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_written: u64,
    started: Instant,
}

impl EncoderPipeline {
    /// Spawn an encoder writing `output_path`
    pub fn open(
        output_path: impl Into<PathBuf>,
        pixel_format: PixelFormat,
        frame_size: Resolution,
        settings: &EncoderSettings,
    ) -> Result<Self> {
        let path = output_path.into();
        let args = settings.arguments(&path, pixel_format, frame_size);

        let mut child = Command::new(&settings.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: settings.program.to_string_lossy().to_string(),
                path: path.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        log::info!(
            "[Encoder] Started {} ({} {}, {})",
            path.display(),
            settings.codec.display_name(),
            frame_size,
            pixel_format.name()
        );

        Ok(Self {
            path,
            pixel_format,
            frame_size,
            child,
            stdin,
            buffer: Vec::with_capacity(pixel_format.frame_bytes(frame_size)),
            frames_encoded: 0,
            bytes_written: 0,
            started: Instant::now(),
        })
    }

    /// Write one frame. Blocks while the encoder's input pipe is full.
    ///
    /// The frame must match the declared frame size exactly; a mismatched
    /// frame is rejected before any byte reaches the encoder.
    pub fn append(&mut self, frame: &Array2<u16>) -> Result<()> {
        if frame.dim() != self.frame_size.shape() {
            return Err(EncoderError::FrameShape {
                path: self.path.clone(),
                expected: self.frame_size,
                actual: frame.dim(),
            });
        }

        self.buffer.clear();
        match self.pixel_format {
            PixelFormat::Gray16le => {
                // Iteration is in logical row-major order regardless of memory layout
                for sample in frame.iter() {
                    self.buffer.extend_from_slice(&sample.to_le_bytes());
                }
            }
        }

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(EncoderError::Io {
                path: self.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "encoder input closed"),
            });
        };

        if let Err(source) = stdin.write_all(&self.buffer) {
            if source.kind() == std::io::ErrorKind::BrokenPipe {
                // The encoder went away; report how it exited
                self.stdin = None;
                let status = self.child.wait().map_err(|source| EncoderError::Io {
                    path: self.path.clone(),
                    source,
                })?;
                return Err(EncoderError::Exit {
                    path: self.path.clone(),
                    status,
                });
            }
            return Err(EncoderError::Io {
                path: self.path.clone(),
                source,
            });
        }

        self.frames_encoded += 1;
        self.bytes_written += self.buffer.len() as u64;

        if self.frames_encoded % 300 == 0 {
            log::debug!("[Encoder] {}: {} frames", self.path.display(), self.frames_encoded);
        }
        Ok(())
    }

    /// Close the input stream and wait for the encoder to exit
    pub fn finalize(mut self) -> Result<EncoderStats> {
        let status = self.close_and_wait()?;
        if !status.success() {
            return Err(EncoderError::Exit {
                path: self.path.clone(),
                status,
            });
        }

        let output_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        let stats = EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_written: self.bytes_written,
            output_bytes,
            encoding_duration: self.started.elapsed(),
        };

        log::info!(
            "[Encoder] Finished {}: {} frames, {} bytes",
            self.path.display(),
            stats.frames_encoded,
            stats.output_bytes
        );
        Ok(stats)
    }

    fn close_and_wait(&mut self) -> Result<ExitStatus> {
        // Dropping stdin sends EOF
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.flush() {
                log::warn!("[Encoder] Flush failed for {}: {}", self.path.display(), e);
            }
        }
        self.child.wait().map_err(|source| EncoderError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for EncoderPipeline {
    fn drop(&mut self) {
        // `finalize` already reaped the process; `try_wait` is a no-op then
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        if let Err(e) = self.close_and_wait() {
            log::warn!("[Encoder] Cleanup failed: {}", e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Copies stdin to the output file, so frame counts can be read back
    /// from the file size
    fn cat_settings() -> EncoderSettings {
        EncoderSettings {
            program: PathBuf::from("sh"),
            custom_args: Some(vec!["-c".into(), "cat > \"$0\"".into(), "{output}".into()]),
            ..Default::default()
        }
    }

    #[test]
    fn frames_reach_the_output_in_little_endian() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.avi");
        let size = Resolution::new(3, 2);

        let mut pipeline = EncoderPipeline::open(&path, PixelFormat::Gray16le, size, &cat_settings()).unwrap();
        let frame = Array2::from_shape_vec((2, 3), vec![1u16, 2, 3, 4, 5, 0x0102]).unwrap();
        pipeline.append(&frame).unwrap();
        pipeline.append(&frame).unwrap();
        let stats = pipeline.finalize().unwrap();

        assert_eq!(stats.frames_encoded, 2);
        assert_eq!(stats.bytes_written, 24);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..4], &[1, 0, 2, 0]);
        assert_eq!(&bytes[10..12], &[0x02, 0x01]);
    }

    #[test]
    fn transposed_views_are_written_in_logical_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ir.avi");

        let mut pipeline =
            EncoderPipeline::open(&path, PixelFormat::Gray16le, Resolution::new(2, 2), &cat_settings()).unwrap();
        let frame = Array2::from_shape_vec((2, 2), vec![1u16, 2, 3, 4]).unwrap();
        pipeline.append(&frame.t().to_owned()).unwrap();
        pipeline.finalize().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 0, 3, 0, 2, 0, 4, 0]);
    }

    #[test]
    fn mismatched_frames_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.avi");

        let mut pipeline =
            EncoderPipeline::open(&path, PixelFormat::Gray16le, Resolution::new(4, 4), &cat_settings()).unwrap();
        let err = pipeline.append(&Array2::zeros((4, 3))).unwrap_err();
        assert!(matches!(err, EncoderError::FrameShape { actual: (4, 3), .. }));
        assert_eq!(pipeline.finalize().unwrap().frames_encoded, 0);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EncoderSettings {
            program: PathBuf::from("/nonexistent/encoder"),
            ..Default::default()
        };
        let result = EncoderPipeline::open(
            dir.path().join("ir.avi"),
            PixelFormat::Gray16le,
            Resolution::new(2, 2),
            &settings,
        );
        let Err(err) = result else {
            panic!("expected a spawn error");
        };
        assert!(matches!(err, EncoderError::Spawn { .. }));

        // The OS error is the source, not part of the message
        let source = std::error::Error::source(&err).unwrap().to_string();
        assert!(!err.to_string().contains(&source));
    }

    #[test]
    fn non_zero_exit_is_reported_on_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EncoderSettings {
            program: PathBuf::from("sh"),
            custom_args: Some(vec!["-c".into(), "cat > /dev/null; exit 3".into()]),
            ..Default::default()
        };
        let mut pipeline = EncoderPipeline::open(
            dir.path().join("ir.avi"),
            PixelFormat::Gray16le,
            Resolution::new(2, 2),
            &settings,
        )
        .unwrap();
        pipeline.append(&Array2::zeros((2, 2))).unwrap();
        assert!(matches!(pipeline.finalize(), Err(EncoderError::Exit { .. })));
    }
}
