// Recording commands: wire configuration, session storage, cameras and the
// capture loop(s) together for one recording session

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Local;
use crossbeam_channel::Receiver;

use crate::config::RecorderConfig;
use crate::devices::{CameraProvider, FrameSource, SimulatedRig, SyncRole};
use crate::recording::{
    stdin_abort_signal, CaptureLoop, CaptureReport, CaptureSettings, PngSnapshotSink, PreviewSink, WriterConfig,
};
use crate::session::{self, Session, SessionInfo, SessionMetadata, SECONDARY_DIR};

/// A recording as requested on the command line
#[derive(Debug, Clone, Default)]
pub struct RecordRequest {
    /// Existing directory the session directory is created in
    pub base_dir: PathBuf,
    pub subject_name: Option<String>,
    pub session_name: Option<String>,
    /// Overrides `recording_minutes` from the config
    pub recording_minutes: Option<f64>,
    /// Show the live preview (also enabled by `preview.enabled`)
    pub preview: bool,
    /// Print elapsed time (also enabled by `display_time`)
    pub display_time: bool,
}

/// Everything a finished recording produced
#[derive(Debug)]
pub struct RecordingOutcome {
    pub session: Session,
    pub primary: CaptureReport,
    pub secondary: Option<CaptureReport>,
}

/// Where preview frames go, and what closes the preview
pub struct PreviewTarget {
    pub sink: Box<dyn PreviewSink>,
    pub abort: Receiver<()>,
}

/// Cameras to record from. Simulated cameras are the only built-in backend
/// and must be asked for explicitly.
pub fn camera_provider(config: &RecorderConfig) -> anyhow::Result<SimulatedRig> {
    if !config.simulation.enabled {
        bail!(
            "No camera backend is built in; pass --simulate (or set simulation.enabled) \
             to record from simulated cameras"
        );
    }
    log::warn!("Recording from SIMULATED cameras; videos will contain synthetic frames");
    Ok(SimulatedRig::new(config.simulation.clone()))
}

/// Record one session with the default preview: `preview.png` in the base
/// directory (or `preview.output_dir`), closed by `q` on stdin. The session
/// directory only ever holds the recording itself.
pub fn record<P: CameraProvider>(
    provider: &P,
    config: &RecorderConfig,
    request: RecordRequest,
) -> anyhow::Result<RecordingOutcome> {
    let preview_dir = config
        .preview
        .output_dir
        .clone()
        .unwrap_or_else(|| request.base_dir.clone());
    record_with_preview(provider, config, request, move |_session_dir| {
        let sink = PngSnapshotSink::new(&preview_dir);
        println!("Preview: {} (type q + Enter to close)", sink.path().display());
        PreviewTarget {
            sink: Box::new(sink),
            abort: stdin_abort_signal(),
        }
    })
}

/// Record one session. `make_preview` is called with the session directory
/// when the preview is enabled.
pub fn record_with_preview<P, F>(
    provider: &P,
    config: &RecorderConfig,
    request: RecordRequest,
    make_preview: F,
) -> anyhow::Result<RecordingOutcome>
where
    P: CameraProvider,
    F: FnOnce(&std::path::Path) -> PreviewTarget,
{
    let minutes = request.recording_minutes.unwrap_or(config.recording_minutes);
    let duration = match Duration::try_from_secs_f64(minutes * 60.0) {
        Ok(duration) => duration,
        Err(e) => bail!("Invalid recording length of {} minutes: {}", minutes, e),
    };

    session::check_free_space(&request.base_dir, config.min_free_disk_gb);

    let info = SessionInfo {
        subject_name: request.subject_name.clone(),
        session_name: request.session_name.clone(),
        target_duration_secs: duration.as_secs_f64(),
        device_id: config.device.device_id,
    };
    let session = session::create_session(&request.base_dir, info, Local::now())
        .context("Failed to create session directory")?;

    // Written before the camera is opened; an unavailable camera leaves it behind
    SessionMetadata::new(request.subject_name, request.session_name, session.created_at)
        .with_resolution(config.device.resolution)
        .write(&session.dir)
        .context("Failed to write session metadata")?;

    let mut primary_config = config.device.clone();
    let secondary_config = config.secondary.clone().map(|mut secondary| {
        primary_config.sync_role = SyncRole::Primary;
        secondary.sync_role = SyncRole::Secondary;
        secondary
    });

    let primary_camera = provider
        .open(&primary_config)
        .with_context(|| format!("Failed to open camera {}", primary_config.device_id))?;

    let secondary_camera = match &secondary_config {
        Some(secondary) => Some(
            provider
                .open(secondary)
                .with_context(|| format!("Failed to open secondary camera {}", secondary.device_id))?,
        ),
        None => None,
    };

    let display_time = request.display_time || config.display_time;
    let settings = CaptureSettings {
        display_time,
        ..CaptureSettings::new(duration).with_preview_config(&config.preview)
    };

    // The secondary starts first and is not waited on before the primary starts
    let secondary_handle = match secondary_camera {
        Some(camera) => {
            let dir = session.dir.join(SECONDARY_DIR);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let capture = build_loop(camera, dir, config, CaptureSettings {
                display_time: false,
                ..settings.clone()
            });
            let handle = std::thread::Builder::new()
                .name("depth-acquire-secondary".into())
                .spawn(move || capture.run())
                .context("Failed to spawn secondary capture thread")?;
            Some(handle)
        }
        None => None,
    };

    let mut primary = build_loop(primary_camera, session.dir.clone(), config, settings);
    if request.preview || config.preview.enabled {
        let target = make_preview(&session.dir);
        primary = primary.with_preview(target.sink, target.abort);
    }

    log::info!(
        "Recording {} for {:.1} minutes into {}",
        session.id,
        minutes,
        session.dir.display()
    );
    let primary_result = primary.run();

    let secondary_result = match secondary_handle {
        Some(handle) => Some(
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("Secondary capture thread panicked"))?,
        ),
        None => None,
    };

    let primary = primary_result.context("Primary camera recording failed")?;
    let secondary = secondary_result
        .transpose()
        .context("Secondary camera recording failed")?;

    log::info!("Session {} complete", session.id);
    Ok(RecordingOutcome {
        session,
        primary,
        secondary,
    })
}

fn build_loop<S: FrameSource>(
    camera: S,
    dir: PathBuf,
    config: &RecorderConfig,
    settings: CaptureSettings,
) -> CaptureLoop<S> {
    let writer = WriterConfig::new(&dir, config.encoder.clone()).with_frame_size(camera.resolution());
    CaptureLoop::new(camera, dir, settings, writer).with_queues(config.queues.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::SimulationProfile;

    fn no_preview(_: &std::path::Path) -> PreviewTarget {
        panic!("preview was not requested");
    }

    #[test]
    fn simulated_cameras_must_be_asked_for() {
        let mut config = RecorderConfig::default();
        let err = camera_provider(&config).unwrap_err();
        assert!(err.to_string().contains("--simulate"));

        config.simulation.enabled = true;
        assert!(camera_provider(&config).is_ok());
    }

    #[test]
    fn unrepresentable_length_is_rejected_before_anything_is_created() {
        let base = tempfile::tempdir().unwrap();
        let config = RecorderConfig {
            simulation: SimulationProfile {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let rig = SimulatedRig::new(config.simulation.clone());

        for minutes in [f64::MAX, f64::INFINITY, f64::NAN, -1.0] {
            let request = RecordRequest {
                base_dir: base.path().to_path_buf(),
                recording_minutes: Some(minutes),
                ..Default::default()
            };
            let err = record_with_preview(&rig, &config, request, no_preview).unwrap_err();
            assert!(err.to_string().contains("Invalid recording length"), "{}", err);
        }
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }
}
