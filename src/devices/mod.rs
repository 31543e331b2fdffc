// Camera abstraction: frame pairs, capture results and the frame source trait

pub mod simulated;

pub use simulated::{SimulatedCamera, SimulatedRig, SimulationProfile};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Error type for camera operations
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The id does not match a connected device, or the device rejected
    /// its initialization parameters.
    #[error("Device {device_id} unavailable: {reason}")]
    DeviceUnavailable { device_id: u32, reason: String },

    /// Transient I/O-class failure while streaming. Ends the recording early.
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Unrecoverable device failure while streaming.
    #[error("Device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, SourceError>;

/// Frame size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Depth NFOV unbinned mode
    pub const NFOV_UNBINNED: Resolution = Resolution::new(640, 576);

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Matrix shape as (rows, columns)
    pub const fn shape(&self) -> (usize, usize) {
        (self.height as usize, self.width as usize)
    }

    /// `WxH`, the form encoders expect
    pub fn size_arg(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    pub fn to_array(&self) -> [u32; 2] {
        [self.width, self.height]
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::NFOV_UNBINNED
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Role of a camera in a wired synchronization chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRole {
    /// Free-running, no sync cable
    #[default]
    Standalone,
    /// Drives the sync signal
    Primary,
    /// Follows the primary, offset by `secondary_delay_usec`
    Secondary,
}

/// Per-device open parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Index of the device among connected devices
    #[serde(default)]
    pub device_id: u32,

    /// Depth/IR resolution
    #[serde(default)]
    pub resolution: Resolution,

    #[serde(default)]
    pub sync_role: SyncRole,

    /// Delay of a secondary camera's exposure off the primary, in microseconds
    #[serde(default = "default_secondary_delay_usec")]
    pub secondary_delay_usec: u32,

    /// Nominal frame rate
    #[serde(default = "default_fps")]
    pub fps: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            resolution: Resolution::default(),
            sync_role: SyncRole::default(),
            secondary_delay_usec: default_secondary_delay_usec(),
            fps: default_fps(),
        }
    }
}

fn default_secondary_delay_usec() -> u32 {
    640
}

fn default_fps() -> u32 {
    30
}

/// One depth frame and one infrared frame captured at the same device instant.
///
/// Matrices are (rows, columns) = (height, width).
#[derive(Debug, Clone)]
pub struct FramePair {
    pub depth: Array2<u16>,
    pub infrared: Array2<u16>,
    /// Device clock, microseconds, monotonic per device
    pub device_timestamp_usec: u64,
    /// Host wall clock in seconds since the Unix epoch, taken right after the
    /// device returned the data
    pub host_timestamp: f64,
}

impl FramePair {
    pub fn resolution(&self) -> Resolution {
        let (rows, cols) = self.depth.dim();
        Resolution::new(cols as u32, rows as u32)
    }
}

/// Result of one `next_frame` cycle
#[derive(Debug)]
pub enum Capture {
    Frame(FramePair),
    /// The device reported no complete depth frame for this cycle
    Dropped,
}

/// A depth camera producing paired depth and infrared frames.
///
/// Backends are opened by their own constructors, which fail with
/// [`SourceError::DeviceUnavailable`].
pub trait FrameSource: Send {
    /// Human-readable name used in logs and tap messages
    fn name(&self) -> &str;

    /// Resolution frames will be delivered at
    fn resolution(&self) -> Resolution;

    /// Begin streaming
    fn start(&mut self) -> Result<()>;

    /// Block until the next capture cycle completes.
    ///
    /// Takes the host timestamp immediately after the device returns data.
    fn next_frame(&mut self) -> Result<Capture>;

    /// Stop streaming and release the device. Safe to call when streaming
    /// never started, and more than once.
    fn stop(&mut self);
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn resolution(&self) -> Resolution {
        (**self).resolution()
    }

    fn start(&mut self) -> Result<()> {
        (**self).start()
    }

    fn next_frame(&mut self) -> Result<Capture> {
        (**self).next_frame()
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

/// Opens cameras by device configuration
pub trait CameraProvider {
    type Camera: FrameSource + 'static;

    fn open(&self, config: &DeviceConfig) -> Result<Self::Camera>;
}

impl CameraProvider for SimulatedRig {
    type Camera = SimulatedCamera;

    fn open(&self, config: &DeviceConfig) -> Result<SimulatedCamera> {
        SimulatedRig::open(self, config)
    }
}

/// Wall clock as fractional seconds since the Unix epoch
pub fn host_timestamp_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
