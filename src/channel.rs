// Operator station transport
//
// Commands: the vehicle sends "commands" over TCP and reads back one JSON
// `OperatorInput` per line. Telemetry: one JSON `Telemetry` per UDP datagram,
// best effort.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::messages::{OperatorInput, Telemetry};

/// Request sent to the operator station each cycle
pub const COMMAND_REQUEST: &[u8] = b"commands\n";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Timed out waiting for commands")]
    Timeout,

    #[error("Malformed commands: {0}")]
    Malformed(String),

    #[error("Operator station closed the connection")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// A dead peer cannot come back on this connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::Closed)
    }
}

/// Where operator input comes from
pub trait CommandChannel {
    /// Ask for the latest operator input, waiting at most the channel's timeout.
    fn request(&mut self) -> Result<OperatorInput, ChannelError>;
}

/// Where telemetry goes
pub trait TelemetrySink {
    fn send(&mut self, telemetry: &Telemetry) -> io::Result<()>;
}

/// Request/reply command channel over TCP
///
/// The station answers every request in order, so a reply that misses its
/// deadline still arrives later. Those late replies are counted and dropped
/// so each request is matched with its own answer.
pub struct TcpCommandChannel {
    reader: BufReader<TcpStream>,
    line: String,
    timeout: Duration,
    /// Requests sent whose replies have not been read yet
    outstanding: usize,
}

impl TcpCommandChannel {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, ChannelError> {
        info!("Connecting to operator station at {}", addr);
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, timeout))
    }

    pub fn from_stream(stream: TcpStream, timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(stream),
            line: String::new(),
            timeout,
            outstanding: 0,
        }
    }

    /// Drop whole replies that are already queued. A partial line is kept
    /// for the next read.
    fn drain_late_replies(&mut self) -> Result<(), ChannelError> {
        self.reader.get_ref().set_nonblocking(true)?;
        let result = loop {
            match self.reader.read_line(&mut self.line) {
                Ok(0) => break Err(ChannelError::Closed),
                Ok(_) if self.line.ends_with('\n') => self.drop_line(),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(classify(e)),
            }
        };
        self.reader.get_ref().set_nonblocking(false)?;
        result
    }

    fn drop_line(&mut self) {
        debug!("Dropping late reply: {}", self.line.trim());
        self.line.clear();
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Read one complete reply before `deadline`.
    fn next_line(&mut self, deadline: Instant) -> Result<String, ChannelError> {
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(ChannelError::Timeout)?;
            self.reader.get_ref().set_read_timeout(Some(remaining))?;

            // On timeout the partial line stays in `self.line`
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return Err(ChannelError::Closed),
                Ok(_) if self.line.ends_with('\n') => {
                    self.outstanding = self.outstanding.saturating_sub(1);
                    return Ok(std::mem::take(&mut self.line));
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(classify(e)),
            }
        }
    }
}

impl CommandChannel for TcpCommandChannel {
    fn request(&mut self) -> Result<OperatorInput, ChannelError> {
        let deadline = Instant::now() + self.timeout;
        self.drain_late_replies()?;

        let stream = self.reader.get_mut();
        if let Err(e) = stream.write_all(COMMAND_REQUEST).and_then(|_| stream.flush()) {
            return Err(classify(e));
        }
        self.outstanding += 1;

        while self.outstanding > 1 {
            let late = self.next_line(deadline)?;
            debug!("Dropping late reply: {}", late.trim());
        }

        let line = self.next_line(deadline)?;
        let reply = line.trim();
        debug!("Received commands: {}", reply);
        serde_json::from_str(reply).map_err(|e| ChannelError::Malformed(e.to_string()))
    }
}

fn classify(e: io::Error) -> ChannelError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ChannelError::Timeout,
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => ChannelError::Closed,
        _ => ChannelError::Io(e),
    }
}

/// Best-effort telemetry over UDP
pub struct UdpTelemetry {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTelemetry {
    pub fn new(target: SocketAddr) -> io::Result<Self> {
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        info!("Sending telemetry to {}", target);
        Ok(Self { socket, target })
    }
}

impl TelemetrySink for UdpTelemetry {
    fn send(&mut self, telemetry: &Telemetry) -> io::Result<()> {
        let payload = serde_json::to_vec(telemetry)?;
        self.socket.send_to(&payload, self.target)?;
        Ok(())
    }
}
