//! Command-line front end for an AUX Alt-Az mount.
//!
//! Subcommands:
//! - `status`: Print mount identity, position and alignment
//! - `goto-radec`: GoTo an RA/Dec position (JNow)
//! - `goto-altaz`: GoTo an apparent Alt/Az position
//! - `track`: GoTo an RA/Dec position and track it until Ctrl-C
//! - `sync`: Add an alignment point at an RA/Dec position
//! - `park`: Slew to the encoder zero
//! - `abort`: Stop both axes
//! - `init-config`: Write a default configuration file

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ephemeris::{format_dms, format_hms, parse_sexagesimal, Equatorial, Horizontal};
use mount::{MountConfig, MountController, Target};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Default configuration location
const DEFAULT_CONFIG: &str = "mount.json";

#[derive(Parser, Debug)]
#[command(name = "mount_ctl")]
#[command(about = "Point and track with a Celestron AUX Alt-Az mount")]
#[command(version)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Serial device or host:port, overriding the configuration
    #[arg(long, global = true)]
    port: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print identity, position and alignment state
    Status,

    /// GoTo an RA/Dec position
    GotoRadec {
        /// Right ascension, hours ("5:35:17" or "5.588")
        ra: String,
        /// Declination, degrees ("-5:23:28" or "-5.39")
        #[arg(allow_hyphen_values = true)]
        dec: String,
    },

    /// GoTo an apparent Alt/Az position
    GotoAltaz {
        /// Azimuth in degrees, north through east
        az: f64,
        /// Altitude in degrees
        #[arg(allow_hyphen_values = true)]
        alt: f64,
    },

    /// GoTo an RA/Dec position and track it until interrupted
    Track {
        ra: String,
        #[arg(allow_hyphen_values = true)]
        dec: String,
    },

    /// Tell the mount it is centred on an RA/Dec position
    Sync {
        ra: String,
        #[arg(allow_hyphen_values = true)]
        dec: String,
    },

    /// Slew to the park position
    Park,

    /// Stop all motion
    Abort,

    /// Write the default configuration to --config
    InitConfig,
}

fn parse_radec(ra: &str, dec: &str) -> Result<Equatorial> {
    let ra_hours = parse_sexagesimal(ra).with_context(|| format!("Bad right ascension {ra:?}"))?;
    let dec_deg = parse_sexagesimal(dec).with_context(|| format!("Bad declination {dec:?}"))?;
    Ok(Equatorial::new(ra_hours, dec_deg))
}

fn load_config(args: &Args) -> Result<MountConfig> {
    let mut config = if args.config.exists() {
        MountConfig::load(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else {
        info!("{} not found, using defaults", args.config.display());
        MountConfig::default()
    };
    if let Some(port) = &args.port {
        config.connection.port = port.clone();
    }
    Ok(config)
}

async fn print_status(mount: &MountController) -> Result<()> {
    let identity = mount.identify().await?;
    println!("Model:      {}", identity.model_name);
    println!("Azimuth:    firmware {}", identity.azimuth_version);
    println!("Altitude:   firmware {}", identity.altitude_version);
    if let Some(hc) = identity.hand_controller_version {
        println!("Hand ctrl:  firmware {}", hc);
    }

    let position = mount.get_position().await?;
    println!(
        "Encoders:   {} / {}",
        position.steps.azm_steps, position.steps.alt_steps
    );
    println!(
        "Sky:        Az {:.4}°  Alt {:.4}°",
        position.sky.az_deg, position.sky.alt_deg
    );
    println!(
        "RA/Dec:     {}  {}",
        format_hms(position.equatorial.ra_hours),
        format_dms(position.equatorial.dec_deg)
    );

    let alignment = mount.alignment_status();
    println!(
        "Alignment:  {} points, {} ({:?}), RMS {:.1}\"",
        alignment.diagnostics.point_count,
        alignment.diagnostics.tier,
        alignment.diagnostics.status,
        alignment.diagnostics.rms_arcsec
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let config = load_config(&args)?;

    if let Command::InitConfig = args.command {
        config
            .save(&args.config)
            .with_context(|| format!("Failed to write {}", args.config.display()))?;
        println!("Wrote {}", args.config.display());
        return Ok(());
    }

    let port = config.connection.port.clone();
    let mount = MountController::connect(config)
        .with_context(|| format!("Failed to connect to {port}"))?;

    match args.command {
        Command::Status => print_status(&mount).await?,
        Command::GotoRadec { ra, dec } => {
            let eq = parse_radec(&ra, &dec)?;
            let settled = mount.goto(Target::Equatorial(eq)).await?;
            println!("Settled at {} / {}", settled.azm_steps, settled.alt_steps);
        }
        Command::GotoAltaz { az, alt } => {
            let settled = mount.goto(Target::Horizontal(Horizontal::new(az, alt))).await?;
            println!("Settled at {} / {}", settled.azm_steps, settled.alt_steps);
        }
        Command::Track { ra, dec } => {
            let eq = parse_radec(&ra, &dec)?;
            mount.set_target(Target::Equatorial(eq), true).await?;
            mount.wait_for_goto().await?;
            println!("Tracking, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            let state = mount.get_tracking_state();
            info!(
                "stopping after {} ticks, rates {:.2} / {:.2} steps/s",
                state.ticks, state.azm_rate, state.alt_rate
            );
            mount.stop_tracking().await?;
        }
        Command::Sync { ra, dec } => {
            let eq = parse_radec(&ra, &dec)?;
            let outcome = mount.sync_equatorial(&eq).await?;
            println!("Sync {:?}", outcome);
        }
        Command::Park => {
            mount.park().await?;
            println!("Parked");
        }
        Command::Abort => mount.abort().await?,
        Command::InitConfig => {}
    }
    Ok(())
}
