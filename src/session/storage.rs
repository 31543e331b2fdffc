// Session folder management: directory creation, timestamp files and disk preflight

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use super::{Result, SessionError, DEVICE_TIMESTAMPS_FILE, HOST_TIMESTAMPS_FILE};

/// A recording session: one directory holding every artifact
#[derive(Debug, Clone)]
pub struct Session {
    /// Directory name, `session_<YYYYMMDDHHMMSS>`
    pub id: String,
    pub dir: PathBuf,
    pub created_at: DateTime<Local>,
    pub subject_name: Option<String>,
    pub session_name: Option<String>,
    pub target_duration_secs: f64,
    pub device_id: u32,
}

/// Attributes of a session about to be created
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub subject_name: Option<String>,
    pub session_name: Option<String>,
    pub target_duration_secs: f64,
    pub device_id: u32,
}

/// Directory name for a session started at `at`
pub fn session_dir_name(at: DateTime<Local>) -> String {
    format!("session_{}", at.format("%Y%m%d%H%M%S"))
}

/// Create the session directory under `base_dir`, which must exist.
/// An existing directory of the same name is reused.
pub fn create_session(base_dir: &Path, info: SessionInfo, at: DateTime<Local>) -> Result<Session> {
    if !base_dir.is_dir() {
        return Err(SessionError::BaseDirMissing(base_dir.to_path_buf()));
    }

    let id = session_dir_name(at);
    let dir = base_dir.join(&id);
    std::fs::create_dir_all(&dir)?;
    log::info!("Session directory {}", dir.display());

    Ok(Session {
        id,
        dir,
        created_at: at,
        subject_name: info.subject_name,
        session_name: info.session_name,
        target_duration_secs: info.target_duration_secs,
        device_id: info.device_id,
    })
}

/// Per-frame (host, device) timestamps, in capture order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimestampSeries {
    host: Vec<f64>,
    device: Vec<u64>,
}

impl TimestampSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, host_timestamp: f64, device_timestamp_usec: u64) {
        self.host.push(host_timestamp);
        self.device.push(device_timestamp_usec);
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn host(&self) -> &[f64] {
        &self.host
    }

    pub fn device(&self) -> &[u64] {
        &self.device
    }

    /// Frames per second over the host clock: `count / (last - first)`.
    /// `None` with fewer than two frames.
    pub fn frame_rate(&self) -> Option<f64> {
        let (first, last) = (self.host.first()?, self.host.last()?);
        let span = last - first;
        (self.host.len() > 1 && span > 0.0).then(|| self.host.len() as f64 / span)
    }

    /// Write `depth_ts.txt` and `device_ts.txt`, one value per line
    pub fn write(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(HOST_TIMESTAMPS_FILE), format_column(self.host.iter().copied()))?;
        std::fs::write(
            dir.join(DEVICE_TIMESTAMPS_FILE),
            format_column(self.device.iter().map(|&usec| usec as f64)),
        )?;
        log::debug!("Wrote {} timestamps to {}", self.len(), dir.display());
        Ok(())
    }

    /// Read back a series written by [`TimestampSeries::write`]
    pub fn read(dir: &Path) -> Result<Self> {
        let host = parse_column(&std::fs::read_to_string(dir.join(HOST_TIMESTAMPS_FILE))?)?;
        let device = parse_column(&std::fs::read_to_string(dir.join(DEVICE_TIMESTAMPS_FILE))?)?;
        Ok(Self {
            host,
            device: device.into_iter().map(|usec| usec as u64).collect(),
        })
    }
}

fn format_column(values: impl Iterator<Item = f64>) -> String {
    let mut out = String::new();
    for value in values {
        let _ = writeln!(out, "{value:.6}");
    }
    out
}

fn parse_column(contents: &str) -> Result<Vec<f64>> {
    contents
        .split_whitespace()
        .map(|token| {
            token.parse::<f64>().map_err(|e| {
                SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad timestamp '{token}': {e}"),
                ))
            })
        })
        .collect()
}

/// Free bytes on the disk holding `path`, if it can be determined
pub fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Warn when the disk holding `path` has less than `min_free_gb` free.
/// Returns the free space found.
pub fn check_free_space(path: &Path, min_free_gb: f64) -> Option<u64> {
    let available = available_space(path);
    match available {
        Some(bytes) => {
            let free_gb = bytes as f64 / 1_073_741_824.0;
            if free_gb < min_free_gb {
                log::warn!(
                    "Only {:.1} GB free on the disk holding {} (minimum {:.1} GB)",
                    free_gb,
                    path.display(),
                    min_free_gb
                );
            } else {
                log::debug!("{:.1} GB free on the disk holding {}", free_gb, path.display());
            }
        }
        None => log::debug!("Could not determine free space for {}", path.display()),
    }
    available
}
