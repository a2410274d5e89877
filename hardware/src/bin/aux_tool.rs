//! Low-level CLI for talking to an AUX bus directly.
//!
//! Subcommands:
//! - `info`: Query mount model and controller firmware versions
//! - `position`: Read raw encoder counts
//! - `goto`: Send a raw GoTo to one axis and wait for completion
//! - `move`: Start a manual move at rate 0-9
//! - `stop`: Stop both axes
//! - `raw`: Send an arbitrary opcode and print the reply payload

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hardware::aux::{
    mc, open_link, pack_u24, AuxBus, BusConfig, Device, DEFAULT_BAUD, STEPS_PER_REV,
};
use tracing::info;

/// Default serial device
const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// Poll interval while waiting for a GoTo to finish
const SLEW_POLL: Duration = Duration::from_millis(250);

/// AUX bus diagnostic tool
#[derive(Parser, Debug)]
#[command(name = "aux_tool")]
#[command(about = "Send raw commands to a Celestron AUX mount")]
#[command(version)]
struct Args {
    /// Serial device path or host:port of a WiFi bridge
    #[arg(long, global = true, default_value = DEFAULT_PORT)]
    port: String,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = DEFAULT_BAUD)]
    baud: u32,

    /// Reply timeout in milliseconds
    #[arg(long, global = true, default_value = "1000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Axis {
    Azm,
    Alt,
}

impl Axis {
    fn device(self) -> Device {
        match self {
            Axis::Azm => Device::Azimuth,
            Axis::Alt => Device::Altitude,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Query mount model and firmware versions
    Info,

    /// Read both encoders
    Position,

    /// GoTo an encoder position on one axis
    Goto {
        #[arg(value_enum)]
        axis: Axis,

        /// Target in degrees (0-360)
        degrees: f64,

        /// Use the slow (precise) GoTo instead of the fast one
        #[arg(long)]
        slow: bool,

        /// Seconds to wait for completion
        #[arg(short, long, default_value = "120")]
        timeout: u64,
    },

    /// Start a manual move
    Move {
        #[arg(value_enum)]
        axis: Axis,

        /// Rate step 1-9, negative for reverse
        #[arg(allow_hyphen_values = true)]
        rate: i8,
    },

    /// Stop both axes
    Stop,

    /// Send an arbitrary command
    Raw {
        /// Destination device address (hex, e.g. 10)
        #[arg(value_parser = parse_hex_u8)]
        device: u8,

        /// Opcode (hex)
        #[arg(value_parser = parse_hex_u8)]
        opcode: u8,

        /// Payload bytes (hex)
        #[arg(value_parser = parse_hex_u8)]
        payload: Vec<u8>,
    },
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    u8::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn steps_to_degrees(steps: u32) -> f64 {
    steps as f64 / STEPS_PER_REV * 360.0
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let timeout = Duration::from_millis(args.timeout_ms);
    let link = open_link(&args.port, args.baud, timeout)
        .with_context(|| format!("Failed to open {}", args.port))?;
    let bus = AuxBus::new(
        link,
        BusConfig {
            reply_timeout: timeout,
            ..BusConfig::default()
        },
    );
    info!("Connected via {}", bus.describe());

    match args.command {
        Command::Info => {
            let model = bus.get_model().await?;
            println!("Model:    {}", model);
            for device in [Device::Azimuth, Device::Altitude] {
                let version = bus.get_version(device).await?;
                println!("{:<9} firmware {}", format!("{}:", device), version);
            }
        }
        Command::Position => {
            for device in [Device::Azimuth, Device::Altitude] {
                let steps = bus.get_position(device).await?;
                println!(
                    "{:<9} {:>8} steps  {:>10.4}°",
                    format!("{}:", device),
                    steps,
                    steps_to_degrees(steps)
                );
            }
        }
        Command::Goto {
            axis,
            degrees,
            slow,
            timeout,
        } => {
            if !(0.0..360.0).contains(&degrees) {
                bail!("Target must be within [0, 360) degrees");
            }
            let steps = (degrees / 360.0 * STEPS_PER_REV).round() as u32;
            let opcode = if slow { mc::GOTO_SLOW } else { mc::GOTO_FAST };
            bus.send_command(axis.device(), opcode, &pack_u24(steps))
                .await?;
            info!("Slewing {} to {} steps", axis.device(), steps);

            let deadline = Instant::now() + Duration::from_secs(timeout);
            while !bus.slew_done(axis.device()).await? {
                if Instant::now() > deadline {
                    bail!("Slew did not complete within {} s", timeout);
                }
                tokio::time::sleep(SLEW_POLL).await;
            }
            let reached = bus.get_position(axis.device()).await?;
            println!("Reached {} steps ({:.4}°)", reached, steps_to_degrees(reached));
        }
        Command::Move { axis, rate } => {
            let magnitude = rate.unsigned_abs();
            if magnitude > mc::MAX_MOVE_RATE {
                bail!("Rate must be within -9..=9");
            }
            let opcode = if rate >= 0 { mc::MOVE_POS } else { mc::MOVE_NEG };
            bus.send_command(axis.device(), opcode, &[magnitude]).await?;
        }
        Command::Stop => {
            for device in [Device::Azimuth, Device::Altitude] {
                bus.send_command(device, mc::MOVE_POS, &[0]).await?;
            }
            info!("Both axes stopped");
        }
        Command::Raw {
            device,
            opcode,
            payload,
        } => {
            let Some(device) = Device::from_id(device) else {
                bail!("Unknown device address {:#04x}", device);
            };
            let reply = bus.send_command(device, opcode, &payload).await?;
            let hex: Vec<String> = reply.iter().map(|b| format!("{b:02X}")).collect();
            println!("{}", hex.join(" "));
        }
    }

    let stats = bus.stats();
    info!(
        "{} requests, {} retries, {} timeouts",
        stats.requests, stats.retries, stats.timeouts
    );
    Ok(())
}
