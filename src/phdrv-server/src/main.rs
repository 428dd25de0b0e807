// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod config;
mod run;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::time::sleep;
use tracing::{error, info, warn};

use phdrv_app::{init_logging, normalize_name, ConfigFile};
use phdrv_backend::{register_builtin_backends_on, LinkAccess, RegistrationContext};
use phdrv_core::{CallStatus, DynResult, Session};

use config::ServerConfig;
use run::{run_session, RunOptions};

const PKG_DESCRIPTION: &str = concat!(env!("CARGO_PKG_NAME"), " - handler/prober driver");

#[derive(Debug, Parser)]
#[command(
    author = env!("CARGO_PKG_AUTHORS"),
    version = env!("CARGO_PKG_VERSION"),
    about = PKG_DESCRIPTION,
)]
struct Cli {
    /// Path to configuration file
    #[arg(long = "config", short = 'C', value_name = "FILE")]
    config: Option<PathBuf>,
    /// Print example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Device family to drive (e.g. handler, prober)
    #[arg(short = 'd', long = "device")]
    device: Option<String>,
    /// How to reach the device
    #[arg(short = 'l', long = "link", value_enum)]
    link: Option<LinkType>,
    /// Device address:
    /// when link is serial: <path> <baud>;
    /// when link is TCP: <host>:<port>
    #[arg(value_name = "DEVICE_ADDR")]
    device_addr: Option<String>,
    /// Stop after this many unit sets
    #[arg(short = 'n', long = "cycles")]
    cycles: Option<u64>,
    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level")]
    log_level: Option<String>,
    /// Print the run summary as JSON
    #[arg(long = "json")]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LinkType {
    Serial,
    Tcp,
    Sim,
}

/// Parse a serial device address of the form "<path> <baud>".
fn parse_serial_addr(addr: &str) -> DynResult<(String, u32)> {
    let mut parts = addr.split_whitespace();
    let (Some(path), Some(baud_str), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err("Serial device address must be '<path> <baud>'".into());
    };
    let baud: u32 = baud_str
        .parse()
        .map_err(|e| format!("Invalid baud '{}': {}", baud_str, e))?;
    Ok((path.to_string(), baud))
}

/// Device family and link after merging config file and CLI arguments.
struct ResolvedConfig {
    device: String,
    access: LinkAccess,
}

fn resolve_config(
    cli: &Cli,
    cfg: &ServerConfig,
    registry: &RegistrationContext,
) -> DynResult<ResolvedConfig> {
    let device = match cli.device.as_deref().or(cfg.device.family.as_deref()) {
        Some(name) => normalize_name(name),
        None => {
            return Err(
                "Device family not specified. Use --device or set [device].family in config."
                    .into(),
            )
        }
    };
    if !registry.is_device_registered(&device) {
        return Err(format!(
            "Unknown device family: {} (available: {})",
            device,
            registry.registered_devices().join(", ")
        )
        .into());
    }

    let link_type = cli
        .link
        .map(|l| match l {
            LinkType::Serial => "serial",
            LinkType::Tcp => "tcp",
            LinkType::Sim => "sim",
        })
        .or(cfg.link.link_type.as_deref());

    let access = match link_type {
        Some("serial") | None => {
            let (path, baud) = if let Some(ref addr) = cli.device_addr {
                parse_serial_addr(addr)?
            } else if let (Some(port), Some(baud)) = (&cfg.link.port, cfg.link.baud) {
                (port.clone(), baud)
            } else {
                return Err("Serial link requires port and baud. Use '<path> <baud>' argument or set [link].port and .baud in config.".into());
            };
            LinkAccess::Serial { path, baud }
        }
        Some("tcp") => {
            let addr = if let Some(ref addr) = cli.device_addr {
                addr.clone()
            } else if let (Some(host), Some(port)) = (&cfg.link.host, cfg.link.tcp_port) {
                format!("{}:{}", host, port)
            } else {
                return Err("TCP link requires host:port. Use argument or set [link].host and .tcp_port in config.".into());
            };
            LinkAccess::Tcp { addr }
        }
        Some("sim") => LinkAccess::Sim {
            sites: cfg.session.sites.clone(),
            lot_size: cfg.link.lot_size,
            echo: cfg.session.binning.verify,
        },
        Some(other) => return Err(format!("Unknown link type: {}", other).into()),
    };

    Ok(ResolvedConfig { device, access })
}

/// Initialize the device, repeating the call while it asks to.
async fn initialize(session: &mut Session, cfg: &ServerConfig) -> DynResult<()> {
    for attempt in 1..=cfg.run.init_retries {
        match session.initialize().await? {
            CallStatus::Done => {
                info!("device initialized");
                return Ok(());
            }
            status => {
                warn!("initialize attempt {} returned {:?}", attempt, status);
                sleep(cfg.session.poll_interval()).await;
            }
        }
    }
    Err(format!(
        "device did not initialize after {} attempts",
        cfg.run.init_retries
    )
    .into())
}

#[tokio::main]
async fn main() -> DynResult<()> {
    let mut registry = RegistrationContext::new();
    register_builtin_backends_on(&mut registry);

    let cli = Cli::parse();

    if cli.print_config {
        println!("{}", ServerConfig::example_combined_toml());
        return Ok(());
    }

    let (cfg, config_path) = if let Some(ref path) = cli.config {
        let cfg = ServerConfig::load_from_file(path)?;
        (cfg, Some(path.clone()))
    } else {
        ServerConfig::load_from_default_paths()?
    };
    cfg.validate()
        .map_err(|e| format!("Invalid server configuration: {}", e))?;

    init_logging(
        cli.log_level
            .as_deref()
            .or(cfg.general.log_level.as_deref()),
    );

    if let Some(ref path) = config_path {
        info!("Loaded configuration from {}", path.display());
    }

    let resolved = resolve_config(&cli, &cfg, &registry)?;
    match &resolved.access {
        LinkAccess::Serial { path, baud } => info!(
            "Starting phdrv-server (device: {}, link: serial {} @ {} baud)",
            resolved.device, path, baud
        ),
        LinkAccess::Tcp { addr } => info!(
            "Starting phdrv-server (device: {}, link: tcp {})",
            resolved.device, addr
        ),
        LinkAccess::Sim { lot_size, .. } => info!(
            "Starting phdrv-server (device: {}, link: sim, {} units)",
            resolved.device, lot_size
        ),
    }

    let link = registry.build_link(resolved.access)?;
    let device = registry.build_device(&resolved.device)?;
    let mut session = Session::new(cfg.session.clone(), link, device)?;

    initialize(&mut session, &cfg).await?;
    if session.info().capabilities.identify {
        match session.identify().await {
            Ok(Some(id)) => info!("Device identifies as {}", id),
            Ok(None) => warn!("device did not answer the identification query"),
            Err(e) => warn!("identification failed: {}", e),
        }
    }

    let abort = Arc::new(AtomicBool::new(false));
    let abort_signal = Arc::clone(&abort);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, aborting at the next call");
            abort_signal.store(true, Ordering::Relaxed);
        }
    });

    let options = RunOptions {
        pass_bin: cfg.run.pass_bin.clone(),
        max_cycles: cli.cycles.or(cfg.run.max_cycles),
        retry_delay: cfg.session.poll_interval(),
    };
    let summary = match run_session(&mut session, &options, &abort).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("run failed: {}", e);
            return Err(e.into());
        }
    };

    info!(
        "{} cycles, {} units ({} waits, {} pauses)",
        summary.cycles, summary.units, summary.waits, summary.pauses
    );
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RegistrationContext {
        let mut registry = RegistrationContext::new();
        register_builtin_backends_on(&mut registry);
        registry
    }

    #[test]
    fn test_parse_serial_addr() {
        assert_eq!(
            parse_serial_addr("/dev/ttyUSB0 9600").unwrap(),
            ("/dev/ttyUSB0".to_string(), 9600)
        );
        assert!(parse_serial_addr("/dev/ttyUSB0").is_err());
        assert!(parse_serial_addr("/dev/ttyUSB0 fast").is_err());
        assert!(parse_serial_addr("/dev/ttyUSB0 9600 8N1").is_err());
    }

    #[test]
    fn test_resolve_cli_overrides_config() {
        let cli = Cli::parse_from(["phdrv-server", "-d", "Prober", "-l", "tcp", "10.1.1.1:5025"]);
        let mut cfg = ServerConfig::default();
        cfg.device.family = Some("handler".to_string());

        let resolved = resolve_config(&cli, &cfg, &registry()).unwrap();
        assert_eq!(resolved.device, "prober");
        assert_eq!(
            resolved.access,
            LinkAccess::Tcp {
                addr: "10.1.1.1:5025".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_sim_from_config() {
        let cli = Cli::parse_from(["phdrv-server"]);
        let mut cfg = ServerConfig::default();
        cfg.device.family = Some("handler".to_string());
        cfg.link.link_type = Some("sim".to_string());
        cfg.link.lot_size = 3;

        let resolved = resolve_config(&cli, &cfg, &registry()).unwrap();
        assert_eq!(
            resolved.access,
            LinkAccess::Sim {
                sites: vec!["0".to_string()],
                lot_size: 3,
                echo: false,
            }
        );
    }

    #[test]
    fn test_resolve_errors() {
        let cli = Cli::parse_from(["phdrv-server"]);
        let cfg = ServerConfig::default();
        assert!(resolve_config(&cli, &cfg, &registry()).is_err());

        let cli = Cli::parse_from(["phdrv-server", "-d", "sorter"]);
        let err = resolve_config(&cli, &cfg, &registry()).err().unwrap();
        assert!(err.to_string().contains("available: handler, prober"));

        let cli = Cli::parse_from(["phdrv-server", "-d", "handler"]);
        assert!(resolve_config(&cli, &cfg, &registry()).is_err());
    }
}
