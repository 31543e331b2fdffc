// depth-acquire - depth camera acquisition
// Main library entry point

pub mod cli;
pub mod commands;
pub mod config;
pub mod devices;
pub mod encoding;
pub mod recording;
pub mod session;

use clap::Parser;

use cli::{Cli, Command};
use config::RecorderConfig;

/// Parse the command line and run the requested command
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::load_or_default(),
    };

    match cli.command {
        Command::Config(args) => {
            print!("{}", config.to_toml()?);
            if args.save {
                let path = cli.config.clone().unwrap_or_else(crate::config::get_config_path);
                config.save(&path)?;
                println!("# Saved to {}", path.display());
            }
        }
        Command::Record(args) => {
            args.apply_overrides(&mut config);
            let rig = commands::camera_provider(&config)?;
            let outcome = commands::record(&rig, &config, args.into_request())?;

            println!("Session saved to {}", outcome.session.dir.display());
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}
