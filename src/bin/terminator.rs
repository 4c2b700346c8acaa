//! portmux terminator
//!
//! Accepts the tunnel connection from an originator and opens a connection
//! to the target service for every stream the originator forwards.

use anyhow::{bail, Context, Result};
use clap::Parser;
use portmux::config::{generate_example_config, Config, LoggingConfig, Mode, TunnelConfig};
use portmux::Controller;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use std::path::Path;
use tracing::info;

/// portmux terminator - connect tunnelled streams to a target service
#[derive(Parser, Debug)]
#[command(name = "portmux-terminator")]
#[command(about = "Terminate a multiplexed tunnel and connect streams to a target")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "terminator.toml")]
    config: String,

    /// Address to accept the tunnel on (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Service to forward streams to (overrides config)
    #[arg(short, long)]
    target: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = generate_example_config(Mode::Terminator);
        print!("{}", toml::to_string_pretty(&example)?);
        return Ok(());
    }

    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        let listen = args
            .listen
            .clone()
            .context("No configuration file; --listen is required")?;
        let target = args
            .target
            .clone()
            .context("No configuration file; --target is required")?;
        Config {
            tunnel: TunnelConfig::new(Mode::Terminator, listen, target),
            logging: LoggingConfig::default(),
        }
    };
    if let Some(listen) = args.listen {
        config.tunnel.listen = listen;
    }
    if let Some(target) = args.target {
        config.tunnel.target = target;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if config.tunnel.mode != Mode::Terminator {
        bail!("Configuration is for the {} side", config.tunnel.mode);
    }

    portmux::init_logging(&config.logging);
    info!("portmux terminator v{}", portmux::VERSION);
    info!("Forwarding streams to {}", config.tunnel.target);

    // Blocks until the originator connects; signals keep their default
    // behaviour until then.
    let mut controller =
        Controller::terminator(&config.tunnel).context("Failed to start terminator")?;

    let shutdown = controller.shutdown_handle();
    for signal in [SIGINT, SIGTERM, SIGQUIT] {
        signal_hook::flag::register(signal, shutdown.flag())
            .context("Failed to register signal handler")?;
    }

    controller.run().context("Tunnel session failed")?;
    info!("Terminator stopped");
    Ok(())
}
