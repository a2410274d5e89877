//! Physical transports carrying AUX frames
//!
//! Two transports share the [`Link`] interface:
//!
//! - [`SerialLink`]: the hand-controller / PC port, a single-wire
//!   half-duplex bus on which every byte we send is echoed back.
//! - [`TcpLink`]: the WiFi bridge, a plain TCP stream (`host:port`) without
//!   echo.
//!
//! The frame format is identical on both. Links are blocking; the bus runs
//! them on tokio's blocking pool.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

/// Default serial baud rate of the AUX port.
pub const DEFAULT_BAUD: u32 = 19200;

/// Default TCP port of the WiFi bridge.
pub const DEFAULT_TCP_PORT: u16 = 2000;

/// A byte transport to the bus.
pub trait Link: Send {
    /// Write all bytes of one frame.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read whatever is available into `buf`, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when the timeout elapses with nothing received.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Discard any unread input.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Whether written bytes come back on the receive side.
    fn echoes(&self) -> bool;

    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Serial port transport.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    echo: bool,
}

impl SerialLink {
    /// Open `path` at `baud`, 8N1, no flow control.
    pub fn open(path: &str, baud: u32, echo: bool) -> io::Result<Self> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(io::Error::from)?;
        debug!("Opened serial port {} at {} baud", path, baud);
        Ok(Self {
            port,
            name: path.to_string(),
            echo,
        })
    }
}

impl Link for SerialLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port
            .set_timeout(timeout.max(Duration::from_millis(1)))
            .map_err(io::Error::from)?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn echoes(&self) -> bool {
        self.echo
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.name)
    }
}

/// TCP transport for network bridges.
pub struct TcpLink {
    stream: TcpStream,
    peer: String,
}

impl TcpLink {
    /// Connect to `addr`, bounded by `timeout` per resolved address.
    pub fn connect(addr: &str, timeout: Duration) -> io::Result<Self> {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("Connected to AUX bridge at {}", candidate);
                    return Ok(Self {
                        stream,
                        peer: addr.to_string(),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}"))
        }))
    }

    /// Wrap an already connected stream (used by the simulator server tests).
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?.to_string();
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer })
    }
}

impl Link for TcpLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "bridge closed the connection",
            )),
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 256];
        let result = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.stream.set_nonblocking(false)?;
        result
    }

    fn echoes(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.peer)
    }
}

/// Open a link from a connection string.
///
/// Anything containing a `:` that is not a Windows `COMn` name is treated as
/// `host:port`; everything else is a serial device path.
pub fn open_link(target: &str, baud: u32, timeout: Duration) -> io::Result<Box<dyn Link>> {
    if is_network_address(target) {
        Ok(Box::new(TcpLink::connect(target, timeout)?))
    } else {
        Ok(Box::new(SerialLink::open(target, baud, true)?))
    }
}

/// Whether `target` names a `host:port` endpoint rather than a serial device.
pub fn is_network_address(target: &str) -> bool {
    !target.starts_with('/')
        && !target.to_ascii_uppercase().starts_with("COM")
        && target.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok())
}
