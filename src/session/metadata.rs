// Session metadata structures

use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::{Result, METADATA_FILE};
use crate::devices::Resolution;

/// Format of `StartTime`: local time, second precision
pub const START_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Contents of `metadata.json`. Fixed shape; written once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionMetadata {
    pub subject_name: Option<String>,

    pub session_name: Option<String>,

    pub nidaq_channels: u32,

    pub nidaq_sampling_rate: f64,

    /// `[width, height]`
    pub depth_resolution: [u32; 2],

    pub is_little_endian: bool,

    pub depth_data_type: String,

    /// `[width, height]` of the infrared stream
    pub color_resolution: [u32; 2],

    pub color_data_type: String,

    pub start_time: String,
}

impl SessionMetadata {
    pub fn new(subject_name: Option<String>, session_name: Option<String>, start: DateTime<Local>) -> Self {
        Self {
            subject_name,
            session_name,
            nidaq_channels: 0,
            nidaq_sampling_rate: 0.0,
            depth_resolution: Resolution::NFOV_UNBINNED.to_array(),
            is_little_endian: true,
            depth_data_type: "UInt16[]".to_string(),
            color_resolution: Resolution::NFOV_UNBINNED.to_array(),
            color_data_type: "UInt16[]".to_string(),
            start_time: start.format(START_TIME_FORMAT).to_string(),
        }
    }

    /// Record the frame size the camera was opened with
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.depth_resolution = resolution.to_array();
        self.color_resolution = resolution.to_array();
        self
    }

    /// Write `metadata.json` into the session directory
    pub fn write(&self, session_dir: &Path) -> Result<()> {
        let path = session_dir.join(METADATA_FILE);
        let file = std::fs::File::create(&path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        log::debug!("Wrote {}", path.display());
        Ok(())
    }

    pub fn read(session_dir: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(session_dir.join(METADATA_FILE))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn serializes_with_fixed_keys_and_defaults() {
        let meta = SessionMetadata::new(Some("mouse1".into()), None, start());
        let value = serde_json::to_value(&meta).unwrap();

        assert_eq!(value["SubjectName"], "mouse1");
        assert!(value["SessionName"].is_null());
        assert_eq!(value["NidaqChannels"], 0);
        assert_eq!(value["NidaqSamplingRate"], 0.0);
        assert_eq!(value["DepthResolution"], serde_json::json!([640, 576]));
        assert_eq!(value["IsLittleEndian"], true);
        assert_eq!(value["DepthDataType"], "UInt16[]");
        assert_eq!(value["ColorResolution"], serde_json::json!([640, 576]));
        assert_eq!(value["ColorDataType"], "UInt16[]");
        assert_eq!(value["StartTime"], "2024-03-09T14:05:07");
        assert_eq!(value.as_object().unwrap().len(), 10);
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let meta = SessionMetadata::new(None, Some("baseline".into()), start())
            .with_resolution(Resolution::new(320, 288));
        meta.write(dir.path()).unwrap();

        let read = SessionMetadata::read(dir.path()).unwrap();
        assert_eq!(read, meta);
        assert_eq!(read.depth_resolution, [320, 288]);
    }
}
