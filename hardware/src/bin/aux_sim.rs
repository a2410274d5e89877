//! Simulated AUX mount served over TCP, behaving like a WiFi bridge.
//!
//! Point `aux_tool --port 127.0.0.1:2000` or `mount_ctl` at it.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};
use clap::Parser;
use hardware::aux::sim::{SimAxis, SimGps};
use hardware::aux::{Frame, FrameDecoder, SimulatedMount, DEFAULT_TCP_PORT, STEPS_PER_REV};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Simulated AUX mount server
#[derive(Parser, Debug)]
#[command(name = "aux_sim")]
#[command(about = "Serve a simulated Celestron mount over TCP")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value_t = format!("127.0.0.1:{DEFAULT_TCP_PORT}"))]
    listen: String,

    /// Initial azimuth in degrees
    #[arg(long, default_value = "0")]
    azimuth: f64,

    /// Initial altitude in degrees
    #[arg(long, default_value = "0")]
    altitude: f64,

    /// Backlash dead zone per axis, in encoder steps
    #[arg(long, default_value = "0")]
    backlash: f64,

    /// Simulate a GPS receiver at this latitude
    #[arg(long, requires = "gps_lon", allow_hyphen_values = true)]
    gps_lat: Option<f64>,

    /// Simulated GPS longitude (east positive)
    #[arg(long, allow_hyphen_values = true)]
    gps_lon: Option<f64>,
}

struct SimState {
    mount: SimulatedMount,
    last_tick: Instant,
}

impl SimState {
    fn respond(&mut self, frame: &Frame) -> Option<Frame> {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;
        self.mount.advance(dt);
        self.mount.handle_frame(frame)
    }
}

fn degrees_to_steps(deg: f64) -> u32 {
    (deg.rem_euclid(360.0) / 360.0 * STEPS_PER_REV).round() as u32 % STEPS_PER_REV as u32
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<SimState>>) -> Result<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        decoder.push(&buf[..n]);
        while let Some(result) = decoder.next_frame() {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping bad frame: {}", e);
                    continue;
                }
            };
            debug!("rx {}", frame);
            let reply = state
                .lock()
                .map_err(|_| anyhow!("simulator state poisoned"))?
                .respond(&frame);
            if let Some(reply) = reply {
                debug!("tx {}", reply);
                stream.write_all(&reply.encode()).await?;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    // a long-running server has no reader for the command log
    let mut mount = SimulatedMount::new().with_log_capacity(0);
    mount.azimuth = SimAxis::new(degrees_to_steps(args.azimuth));
    mount.altitude = SimAxis::new(degrees_to_steps(args.altitude));
    mount.azimuth.set_backlash_steps(args.backlash);
    mount.altitude.set_backlash_steps(args.backlash);
    if let (Some(latitude_deg), Some(longitude_deg)) = (args.gps_lat, args.gps_lon) {
        mount = mount.with_gps(SimGps {
            latitude_deg,
            longitude_deg,
            linked: true,
        });
    }

    let state = Arc::new(Mutex::new(SimState {
        mount,
        last_tick: Instant::now(),
    }));

    let listener = TcpListener::bind(&args.listen).await?;
    info!("Simulated mount listening on {}", args.listen);

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!("Client connected: {}", peer);
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, state).await {
                warn!("Client {} error: {}", peer, e);
            }
            info!("Client disconnected: {}", peer);
        });
    }
}
