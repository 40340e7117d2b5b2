//! # AQ Node Entry Point
//!
//! Wires the library together and hands control to the scheduler:
//!
//! - Loads `aq-config.toml` (or `--config PATH`), falling back to defaults
//! - Opens the sensor UARTs and the 1-Wire probe; any device that cannot be
//!   opened is replaced by its simulated counterpart
//! - Builds the link (sysfs WiFi probe + MQTT broker), the location store
//!   and the configuration portal
//! - Runs the cooperative loop forever
//!
//! ## Usage
//! ```text
//! aq-node [--config PATH] [--simulate] [--dry-run]
//! ```
//! - `--simulate`: use simulated sensors even if hardware is present
//! - `--dry-run`: log messages instead of connecting to WiFi/broker
//!
//! ## Environment Variables
//! - `RUST_LOG` (optional): full tracing filter, takes precedence
//! - `AQ_LOG_LEVEL` (optional): log verbosity (default: `info`)
//! - `FORCE_COLOR` (optional): `1|true|yes` / `0|false|no`, else TTY detection

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use is_terminal::IsTerminal;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

use aq_node_lib::aggregator::ReadingAggregator;
use aq_node_lib::clock::SystemClock;
use aq_node_lib::config::{Config, CONFIG_FILE};
use aq_node_lib::devices::{Mhz19, Sds011, W1Probe};
use aq_node_lib::link::{BrokerClient, LinkSession, WifiCredentials, WifiRadio};
use aq_node_lib::message::{Identity, MessageEncoder};
use aq_node_lib::mqtt::{LoggingBroker, MqttBroker};
use aq_node_lib::network::{StaticUplink, SysfsInterface};
use aq_node_lib::portal::HttpPortal;
use aq_node_lib::scheduler::Scheduler;
use aq_node_lib::sensors::{
    GasChannel, ParticulateChannel, PositionChannel, SensorChannel, TemperatureChannel,
};
use aq_node_lib::serial::open_uart;
use aq_node_lib::simulated::{SimulatedCo2, SimulatedDust, SimulatedGps, SimulatedProbe};
use aq_node_lib::store::{ConfigStore, FileStorage};

/// Both UART sensors talk at 9600 8N1.
const SENSOR_BAUD: u32 = 9600;

const USAGE: &str = "usage: aq-node [--config PATH] [--simulate] [--dry-run]";

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    simulate: bool,
    dry_run: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--simulate" => parsed.simulate = true,
            "--dry-run" => parsed.dry_run = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => bail!("unknown argument '{other}'\n{USAGE}"),
        }
    }
    Ok(parsed)
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins if set; otherwise `AQ_LOG_LEVEL` picks one level for
/// everything except the MQTT client internals, which stay at `warn`.
fn init_tracing() {
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AQ_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},rumqttc=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}

fn position_channel(config: &Config, simulate: bool) -> Box<dyn SensorChannel> {
    if !simulate {
        match open_uart(&config.sensors.gps_port, config.sensors.gps_baud) {
            Ok(port) => return Box::new(PositionChannel::new(port)),
            Err(e) => warn!(error = %e, "gps unavailable, using simulated receiver"),
        }
    }
    Box::new(PositionChannel::new(SimulatedGps::new(SystemClock::new())))
}

fn gas_channel(config: &Config, simulate: bool) -> Box<dyn SensorChannel> {
    if !simulate {
        match open_uart(&config.sensors.co2_port, SENSOR_BAUD) {
            Ok(port) => return Box::new(GasChannel::new(Mhz19::new(port))),
            Err(e) => warn!(error = %e, "co2 sensor unavailable, using simulated source"),
        }
    }
    Box::new(GasChannel::new(SimulatedCo2::default()))
}

fn particulate_channel(config: &Config, simulate: bool) -> Box<dyn SensorChannel> {
    if !simulate {
        match open_uart(&config.sensors.pm_port, SENSOR_BAUD) {
            Ok(port) => return Box::new(ParticulateChannel::new(Sds011::new(port))),
            Err(e) => warn!(error = %e, "dust sensor unavailable, using simulated source"),
        }
    }
    Box::new(ParticulateChannel::new(SimulatedDust::default()))
}

fn temperature_channel(config: &Config, simulate: bool) -> Box<dyn SensorChannel> {
    let dir = Path::new(&config.sensors.w1_device);
    if !simulate {
        if dir.is_dir() {
            return Box::new(TemperatureChannel::new(W1Probe::new(dir)));
        }
        warn!(path = %dir.display(), "1-wire probe not found, using simulated probe");
    }
    Box::new(TemperatureChannel::new(SimulatedProbe::default()))
}

fn build_link(config: &Config, dry_run: bool) -> LinkSession {
    let (radio, broker): (Box<dyn WifiRadio>, Box<dyn BrokerClient>) = if dry_run {
        info!("dry run: messages are logged, not sent");
        (Box::new(StaticUplink), Box::new(LoggingBroker::new()))
    } else {
        (
            Box::new(SysfsInterface::new(&config.wifi.interface)),
            Box::new(MqttBroker::new(config.broker.clone())),
        )
    };
    LinkSession::new(
        radio,
        broker,
        WifiCredentials {
            ssid: config.wifi.ssid.clone(),
            password: config.wifi.password.clone(),
        },
        &config.device.device_id,
    )
}

fn main() -> Result<()> {
    init_tracing();

    let args = parse_args(env::args().skip(1))?;
    let config = Config::load_from_path(args.config.as_deref().unwrap_or(Path::new(CONFIG_FILE)));
    config.validate().context("invalid configuration")?;
    config.log_summary();

    if args.simulate {
        info!("simulated sensors requested");
    }
    let aggregator = ReadingAggregator::new(
        position_channel(&config, args.simulate),
        gas_channel(&config, args.simulate),
        particulate_channel(&config, args.simulate),
        temperature_channel(&config, args.simulate),
    );

    let storage = FileStorage::open(&config.storage.path)
        .with_context(|| format!("opening storage image {}", config.storage.path))?;
    let store = ConfigStore::open(Box::new(storage)).context("reading location")?;

    let encoder = MessageEncoder::new(
        Identity {
            user_uuid: config.device.user_uuid.clone(),
            device_id: config.device.device_id.clone(),
        },
        config.utc_offset()?,
    );

    let link = build_link(&config, args.dry_run);
    let mut scheduler = Scheduler::new(SystemClock::new(), store, link, aggregator, encoder);

    if config.portal.enabled {
        match HttpPortal::bind(&config.portal.bind) {
            Ok(portal) => scheduler = scheduler.with_portal(Box::new(portal)),
            Err(e) => warn!(bind = %config.portal.bind, error = %e, "configuration portal disabled"),
        }
    }

    scheduler.run()
}
