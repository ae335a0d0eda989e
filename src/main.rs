//! # Sail Gateway Entry Point
//!
//! Wires the gateway to the host: configuration, console logging, the
//! serial input (UART or a capture replay), the kernel 1-Wire bus and the
//! calibration partition. Runs the cooperative loop on a single-threaded
//! tokio runtime until Ctrl-C.
//!
//! ```text
//! sail-gateway [--config <path>] [--stdout]
//! sail-gateway [--config <path>] --calibrate <leeway-k> <wind-offset-rad>
//! ```

use std::env;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

use sail_gateway_lib::config::{Config, CONFIG_FILE};
#[cfg(all(target_os = "linux", feature = "hardware"))]
use sail_gateway_lib::hal::UartSerialPort;
use sail_gateway_lib::hal::{Clock, MonotonicClock, ReplaySerialPort, SerialPort, StdFileSystem};
use sail_gateway_lib::onewire::SysfsOneWireBus;
use sail_gateway_lib::renderer::draw_ascii;
use sail_gateway_lib::serializer::drain_events_json;
use sail_gateway_lib::Gateway;

/// Loop period; the scheduler decides what actually runs on each tick.
const TICK: Duration = Duration::from_millis(10);

/// Status page and event drain period.
const REPORT_EVERY: Duration = Duration::from_secs(1);

struct Args {
    config: PathBuf,
    development_mode: bool,
    calibrate: Option<(f64, f64)>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: PathBuf::from(CONFIG_FILE),
        development_mode: false,
        calibrate: None,
    };
    let mut argv = env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--stdout" => args.development_mode = true,
            "--config" => {
                args.config = argv.next().context("--config needs a path")?.into();
            }
            "--calibrate" => {
                let k = argv.next().context("--calibrate needs a leeway factor")?;
                let offset = argv.next().context("--calibrate needs a wind angle offset")?;
                args.calibrate = Some((
                    k.parse().with_context(|| format!("invalid leeway factor {}", k))?,
                    offset
                        .parse()
                        .with_context(|| format!("invalid wind angle offset {}", offset))?,
                ));
            }
            other => bail!("unknown argument {}", other),
        }
    }
    Ok(args)
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Replay file if configured, else the UART when built with `hardware`.
fn open_serial(
    config: &Config,
    clock: Rc<dyn Clock>,
) -> anyhow::Result<Option<Box<dyn SerialPort>>> {
    if let Some(path) = &config.serial.replay_file {
        let port = ReplaySerialPort::from_file(path, clock)
            .with_context(|| format!("open replay file {}", path.display()))?;
        tracing::info!(path = %path.display(), "replaying NMEA 0183 capture");
        return Ok(Some(Box::new(port)));
    }

    #[cfg(all(target_os = "linux", feature = "hardware"))]
    let port: Option<Box<dyn SerialPort>> =
        Some(Box::new(UartSerialPort::new(&config.serial.device)));
    #[cfg(not(all(target_os = "linux", feature = "hardware")))]
    let port: Option<Box<dyn SerialPort>> = {
        tracing::warn!("no serial input: build with --features hardware or set serial.replay_file");
        None
    };
    Ok(port)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    // Config loading logs before the filter it configures exists
    let config = tracing::subscriber::with_default(tracing_subscriber::fmt().finish(), || {
        Config::load_from_path(&args.config)
    });
    init_logging(&config);

    let clock: Rc<dyn Clock> = Rc::new(MonotonicClock::new());
    let fs = StdFileSystem::new(&config.storage.data_dir);
    let bus = SysfsOneWireBus::new(SysfsOneWireBus::DEFAULT_ROOT);
    let mut gateway = Gateway::new(&config, clock.clone(), bus, fs);

    if let Some((leeway_k, wind_angle_offset)) = args.calibrate {
        gateway
            .save_calibration(leeway_k, wind_angle_offset)
            .context("save calibration")?;
        println!("calibration saved: K={} offset={} rad", leeway_k, wind_angle_offset);
        return Ok(());
    }

    match open_serial(&config, clock) {
        Ok(Some(port)) => {
            if let Err(error) = gateway.attach_serial(port, config.serial.baud) {
                tracing::error!(%error, "serial port unavailable, continuing without NMEA 0183");
            }
        }
        Ok(None) => {}
        Err(error) => tracing::error!(error = %format!("{:#}", error), "serial input disabled"),
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(gateway, args.development_mode));
    Ok(())
}

async fn run(mut gateway: Gateway<SysfsOneWireBus, StdFileSystem>, development_mode: bool) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report = tokio::time::interval(REPORT_EVERY);
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!("gateway running");
    loop {
        tokio::select! {
            _ = ticker.tick() => gateway.tick(),
            _ = report.tick() => {
                for line in drain_events_json(gateway.events_mut()) {
                    tracing::info!(target: "events", "{}", line);
                }
                if development_mode {
                    draw_ascii(&gateway.snapshot());
                }
            }
            result = &mut shutdown => {
                if let Err(error) = result {
                    tracing::error!(%error, "signal handler failed");
                }
                break;
            }
        }
    }

    let status = gateway.status();
    tracing::info!(
        loop_hz = status.loop_frequency,
        sentences = status.nmea0183.accepted,
        pgns = status.nmea2000.handled,
        onewire_reads = status.onewire.reads,
        warnings = status.warnings,
        errors = status.errors,
        "gateway stopped"
    );
}
