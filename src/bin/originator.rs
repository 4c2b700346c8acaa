//! portmux originator
//!
//! Accepts application clients on a local port and forwards every client
//! through one tunnel connection to the terminator.

use anyhow::{bail, Context, Result};
use clap::Parser;
use portmux::config::{generate_example_config, Config, LoggingConfig, Mode, TunnelConfig};
use portmux::Controller;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use std::path::Path;
use tracing::info;

/// portmux originator - forward local clients through the tunnel
#[derive(Parser, Debug)]
#[command(name = "portmux-originator")]
#[command(about = "Forward local TCP clients through a multiplexed tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "originator.toml")]
    config: String,

    /// Address to accept application clients on (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Terminator tunnel address (overrides config)
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
        let example = generate_example_config(Mode::Originator);
        print!("{}", toml::to_string_pretty(&example)?);
        return Ok(());
    }

    // Load configuration, falling back to command line values
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
            tunnel: TunnelConfig::new(Mode::Originator, listen, target),
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
    if config.tunnel.mode != Mode::Originator {
        bail!("Configuration is for the {} side", config.tunnel.mode);
    }

    portmux::init_logging(&config.logging);
    info!("portmux originator v{}", portmux::VERSION);
    info!("Tunnel target: {}", config.tunnel.target);

    let mut controller =
        Controller::originator(&config.tunnel).context("Failed to start originator")?;

    let shutdown = controller.shutdown_handle();
    for signal in [SIGINT, SIGTERM, SIGQUIT] {
        signal_hook::flag::register(signal, shutdown.flag())
            .context("Failed to register signal handler")?;
    }

    controller.run().context("Tunnel session failed")?;
    info!("Originator stopped");
    Ok(())
}
