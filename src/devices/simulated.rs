// Synthetic depth camera
//
// Produces deterministic depth/IR frames at a nominal frame rate, with
// scripted drops and failures. Used for dry runs of the whole pipeline
// and by the test suite; real SDK bindings implement `FrameSource` the same way.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::Array2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{
    host_timestamp_now, Capture, DeviceConfig, FramePair, FrameSource, Resolution, Result,
    SourceError, SyncRole,
};

/// Behaviour of the simulated devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationProfile {
    /// Record from simulated cameras (`--simulate`)
    #[serde(default)]
    pub enabled: bool,

    /// Number of connected devices; ids `0..devices` can be opened
    #[serde(default = "default_devices")]
    pub devices: u32,

    /// Deliver frames in real time at the device frame rate. When false,
    /// frames are produced as fast as they are requested.
    #[serde(default = "default_true")]
    pub paced: bool,

    /// Capture cycles (0-based) that report a dropped frame
    #[serde(default)]
    pub drop_cycles: Vec<u64>,

    /// Raise `StreamInterrupted` once this many cycles have run
    #[serde(default)]
    pub interrupt_after: Option<u64>,

    /// Raise an unrecoverable device error on this cycle
    #[serde(default)]
    pub fail_at: Option<u64>,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            enabled: false,
            devices: default_devices(),
            paced: true,
            drop_cycles: Vec::new(),
            interrupt_after: None,
            fail_at: None,
        }
    }
}

fn default_devices() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// A set of simulated devices. Each id can be held by one camera at a time.
#[derive(Debug, Clone)]
pub struct SimulatedRig {
    profile: SimulationProfile,
    claimed: Arc<Mutex<HashSet<u32>>>,
}

impl SimulatedRig {
    pub fn new(profile: SimulationProfile) -> Self {
        Self {
            profile,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Open a device with the given parameters
    pub fn open(&self, config: &DeviceConfig) -> Result<SimulatedCamera> {
        self.open_with(config, self.profile.clone())
    }

    /// Open a device with a profile that overrides the rig's scripted behaviour
    pub fn open_with(&self, config: &DeviceConfig, profile: SimulationProfile) -> Result<SimulatedCamera> {
        let unavailable = |reason: String| SourceError::DeviceUnavailable {
            device_id: config.device_id,
            reason,
        };

        if config.device_id >= self.profile.devices {
            return Err(unavailable(format!(
                "{} device(s) connected",
                self.profile.devices
            )));
        }
        if config.resolution.pixel_count() == 0 {
            return Err(unavailable(format!("invalid resolution {}", config.resolution)));
        }
        if config.fps == 0 {
            return Err(unavailable("frame rate must be positive".into()));
        }
        if !self.claimed.lock().insert(config.device_id) {
            return Err(unavailable("already open".into()));
        }

        log::info!(
            "Opened simulated device {} ({}, {} fps, {:?})",
            config.device_id,
            config.resolution,
            config.fps,
            config.sync_role
        );

        Ok(SimulatedCamera {
            name: format!("sim{}", config.device_id),
            device_id: config.device_id,
            resolution: config.resolution,
            period: Duration::from_secs_f64(1.0 / config.fps as f64),
            offset_usec: match config.sync_role {
                SyncRole::Secondary => u64::from(config.secondary_delay_usec),
                _ => 0,
            },
            drop_cycles: profile.drop_cycles.iter().copied().collect(),
            profile,
            started: None,
            cycle: 0,
            claimed: Arc::clone(&self.claimed),
        })
    }
}

impl Default for SimulatedRig {
    fn default() -> Self {
        Self::new(SimulationProfile::default())
    }
}

/// A simulated depth camera
pub struct SimulatedCamera {
    name: String,
    device_id: u32,
    resolution: Resolution,
    period: Duration,
    offset_usec: u64,
    profile: SimulationProfile,
    drop_cycles: HashSet<u64>,
    started: Option<Instant>,
    cycle: u64,
    claimed: Arc<Mutex<HashSet<u32>>>,
}

impl SimulatedCamera {
    fn device_timestamp_usec(&self, cycle: u64) -> u64 {
        self.offset_usec + cycle * self.period.as_micros() as u64
    }

    fn wait_for_cycle(&self, started: Instant, cycle: u64) {
        if !self.profile.paced {
            return;
        }
        let due = started
            + self.period * u32::try_from(cycle).unwrap_or(u32::MAX)
            + Duration::from_micros(self.offset_usec);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }

    fn render(&self, cycle: u64) -> (Array2<u16>, Array2<u16>) {
        let shift = (cycle % 4000) as usize;
        let depth = Array2::from_shape_fn(self.resolution.shape(), |(r, c)| {
            (500 + (r + c + shift) % 4000) as u16
        });
        let infrared = Array2::from_shape_fn(self.resolution.shape(), |(r, c)| {
            (160 + (c * 8 + r + shift) % 5340) as u16
        });
        (depth, infrared)
    }
}

impl FrameSource for SimulatedCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn start(&mut self) -> Result<()> {
        if self.started.is_none() {
            self.started = Some(Instant::now());
            log::debug!("Simulated device {} streaming", self.device_id);
        }
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Capture> {
        let started = self
            .started
            .ok_or_else(|| SourceError::Device("stream not started".into()))?;

        let cycle = self.cycle;
        if self.profile.interrupt_after.is_some_and(|limit| cycle >= limit) {
            return Err(SourceError::StreamInterrupted(format!(
                "device {} stopped delivering after {} cycles",
                self.device_id, cycle
            )));
        }
        if self.profile.fail_at == Some(cycle) {
            return Err(SourceError::Device(format!(
                "device {} failed on cycle {}",
                self.device_id, cycle
            )));
        }

        self.wait_for_cycle(started, cycle);
        self.cycle += 1;

        if self.drop_cycles.contains(&cycle) {
            return Ok(Capture::Dropped);
        }

        let (depth, infrared) = self.render(cycle);
        Ok(Capture::Frame(FramePair {
            depth,
            infrared,
            device_timestamp_usec: self.device_timestamp_usec(cycle),
            host_timestamp: host_timestamp_now(),
        }))
    }

    fn stop(&mut self) {
        if self.started.take().is_some() {
            log::debug!("Simulated device {} stopped", self.device_id);
        }
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.stop();
        self.claimed.lock().remove(&self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_running() -> SimulationProfile {
        SimulationProfile {
            paced: false,
            ..Default::default()
        }
    }

    fn small() -> DeviceConfig {
        DeviceConfig {
            resolution: Resolution::new(8, 6),
            ..Default::default()
        }
    }

    #[test]
    fn unknown_device_is_unavailable() {
        let rig = SimulatedRig::new(free_running());
        let config = DeviceConfig {
            device_id: 3,
            ..small()
        };
        assert!(matches!(
            rig.open(&config),
            Err(SourceError::DeviceUnavailable { device_id: 3, .. })
        ));
    }

    #[test]
    fn device_can_only_be_opened_once() {
        let rig = SimulatedRig::new(free_running());
        let first = rig.open(&small()).unwrap();
        assert!(rig.open(&small()).is_err());
        drop(first);
        assert!(rig.open(&small()).is_ok());
    }

    #[test]
    fn stop_before_start_is_harmless() {
        let rig = SimulatedRig::new(free_running());
        let mut camera = rig.open(&small()).unwrap();
        camera.stop();
        camera.stop();
    }

    #[test]
    fn frames_have_configured_shape() {
        let rig = SimulatedRig::new(free_running());
        let mut camera = rig.open(&small()).unwrap();
        camera.start().unwrap();
        match camera.next_frame().unwrap() {
            Capture::Frame(pair) => {
                assert_eq!(pair.depth.dim(), (6, 8));
                assert_eq!(pair.infrared.dim(), (6, 8));
                assert_eq!(pair.resolution(), Resolution::new(8, 6));
            }
            Capture::Dropped => panic!("unexpected drop"),
        }
    }

    #[test]
    fn device_clock_advances_across_drops() {
        let rig = SimulatedRig::new(SimulationProfile {
            drop_cycles: vec![1, 2],
            ..free_running()
        });
        let mut camera = rig.open(&small()).unwrap();
        camera.start().unwrap();

        let mut stamps = Vec::new();
        let mut drops = 0;
        for _ in 0..5 {
            match camera.next_frame().unwrap() {
                Capture::Frame(pair) => stamps.push(pair.device_timestamp_usec),
                Capture::Dropped => drops += 1,
            }
        }
        assert_eq!(drops, 2);
        assert_eq!(stamps, vec![0, 3 * 33_333, 4 * 33_333]);
    }

    #[test]
    fn interrupt_after_limit() {
        let rig = SimulatedRig::new(SimulationProfile {
            interrupt_after: Some(2),
            ..free_running()
        });
        let mut camera = rig.open(&small()).unwrap();
        camera.start().unwrap();
        assert!(camera.next_frame().is_ok());
        assert!(camera.next_frame().is_ok());
        assert!(matches!(
            camera.next_frame(),
            Err(SourceError::StreamInterrupted(_))
        ));
    }
}
