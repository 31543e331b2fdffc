// Command line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::commands::RecordRequest;
use crate::config::RecorderConfig;
use crate::devices::DeviceConfig;

#[derive(Debug, Parser)]
#[command(name = "depth-acquire", version, about = "Record depth and infrared video from depth cameras")]
pub struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Record one session
    Record(RecordArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Also write it to the config file (`--config` or the default location)
    #[arg(long)]
    pub save: bool,
}

#[derive(Debug, Clone, Args)]
pub struct RecordArgs {
    /// Existing directory to create the session directory in
    pub base_dir: PathBuf,

    #[arg(long)]
    pub subject_name: Option<String>,

    #[arg(long)]
    pub session_name: Option<String>,

    /// Recording length in minutes [default: 30]
    #[arg(short = 't', long, value_name = "MINUTES")]
    pub recording_length: Option<f64>,

    /// Show a live infrared preview
    #[arg(long)]
    pub preview: bool,

    /// Print elapsed time while recording
    #[arg(long)]
    pub display_time: bool,

    /// Primary camera
    #[arg(long)]
    pub device_id: Option<u32>,

    /// Record a second, synchronized camera
    #[arg(long)]
    pub secondary_device_id: Option<u32>,

    /// Record from simulated cameras producing synthetic frames
    #[arg(long)]
    pub simulate: bool,
}

impl RecordArgs {
    /// Apply device selections to the loaded config
    pub fn apply_overrides(&self, config: &mut RecorderConfig) {
        if self.simulate {
            config.simulation.enabled = true;
        }
        if let Some(id) = self.device_id {
            config.device.device_id = id;
        }
        if let Some(id) = self.secondary_device_id {
            let (resolution, fps) = (config.device.resolution, config.device.fps);
            let secondary = config.secondary.get_or_insert_with(|| DeviceConfig {
                resolution,
                fps,
                ..Default::default()
            });
            secondary.device_id = id;
        }
    }

    pub fn into_request(self) -> RecordRequest {
        RecordRequest {
            base_dir: self.base_dir,
            subject_name: self.subject_name,
            session_name: self.session_name,
            recording_minutes: self.recording_length,
            preview: self.preview,
            display_time: self.display_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_arguments() {
        let cli = Cli::try_parse_from([
            "depth-acquire",
            "record",
            "/data",
            "--subject-name",
            "m7",
            "-t",
            "0.5",
            "--preview",
            "--secondary-device-id",
            "1",
        ])
        .unwrap();

        let Command::Record(args) = cli.command else {
            panic!("expected record");
        };
        let mut config = RecorderConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.secondary.as_ref().map(|s| s.device_id), Some(1));
        assert_eq!(config.device.device_id, 0);
        assert!(!config.simulation.enabled);

        let request = args.into_request();
        assert_eq!(request.base_dir, PathBuf::from("/data"));
        assert_eq!(request.subject_name.as_deref(), Some("m7"));
        assert_eq!(request.recording_minutes, Some(0.5));
        assert!(request.preview);
        assert!(!request.display_time);
    }

    #[test]
    fn base_dir_is_required() {
        assert!(Cli::try_parse_from(["depth-acquire", "record"]).is_err());
    }

    #[test]
    fn simulate_enables_the_simulated_backend() {
        let cli = Cli::try_parse_from(["depth-acquire", "record", "/data", "--simulate"]).unwrap();
        let Command::Record(args) = cli.command else {
            panic!("expected record");
        };
        let mut config = RecorderConfig::default();
        args.apply_overrides(&mut config);
        assert!(config.simulation.enabled);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["depth-acquire", "config", "--verbose", "--save"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Config(ConfigArgs { save: true })));
    }
}
