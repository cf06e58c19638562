// Point-to-point serial links to the microcontrollers
//
// Reads never rely on the transport's own timeout: only bytes the port
// reports as available are read, and the caller's deadline is checked
// between short polling slices.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{POLL_SLICE, PORT_TIMEOUT};

/// Lines longer than this without a newline are treated as noise.
const MAX_LINE_BYTES: usize = 4096;

/// Byte stream with a non-blocking view of the receive queue
pub trait Port: Read + Write {
    /// Number of bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;

    fn port_name(&self) -> Option<String> {
        None
    }
}

impl Port for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        (**self)
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn port_name(&self) -> Option<String> {
        (**self).name()
    }
}

/// Open a serial device with the runtime's standard framing.
pub fn open_port(path: &str, baudrate: u32) -> serialport::Result<Box<dyn SerialPort>> {
    serialport::new(path, baudrate).timeout(PORT_TIMEOUT).open()
}

/// Fill `buf` completely or fail with `TimedOut` once `deadline` passes.
pub fn read_exact_by<P: Port + ?Sized>(
    port: &mut P,
    buf: &mut [u8],
    deadline: Instant,
) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let available = port.bytes_available()?;
        if available > 0 {
            let want = available.min(buf.len() - filled);
            match port.read(&mut buf[filled..filled + want]) {
                Ok(n) => filled += n,
                Err(e) if is_transient(&e) => {}
                Err(e) => return Err(e),
            }
            continue;
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("got {} of {} bytes", filled, buf.len()),
            ));
        }
        sleep(POLL_SLICE.min(deadline - now));
    }
    Ok(())
}

/// Discard whatever is waiting in the receive queue.
pub fn discard_input<P: Port + ?Sized>(port: &mut P) -> io::Result<usize> {
    let available = port.bytes_available()?;
    if available == 0 {
        return Ok(0);
    }
    let mut scratch = vec![0u8; available];
    match port.read(&mut scratch) {
        Ok(n) => Ok(n),
        Err(e) if is_transient(&e) => Ok(0),
        Err(e) => Err(e),
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// A line-oriented serial connection to one microcontroller
pub struct SerialLink<P: Port = Box<dyn SerialPort>> {
    label: String,
    port: P,
    buffer: Vec<u8>,
}

impl SerialLink {
    /// Open a serial device by path.
    pub fn open(path: &str, baudrate: u32) -> serialport::Result<Self> {
        let port = open_port(path, baudrate)?;
        debug!("Opened {} at {} baud", path, baudrate);
        Ok(Self::new(path, port))
    }
}

impl<P: Port> SerialLink<P> {
    pub fn new(label: impl Into<String>, port: P) -> Self {
        Self {
            label: label.into(),
            port,
            buffer: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Rename the link once its role is known, for log readability.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    /// Write bytes, logging and dropping them if the OS refuses.
    pub fn write(&mut self, bytes: &[u8]) {
        if let Err(e) = self.port.write_all(bytes).and_then(|_| self.port.flush()) {
            warn!("{}: write of {} byte(s) failed: {}", self.label, bytes.len(), e);
        }
    }

    /// Return the whitespace-separated fields of the newest complete record.
    ///
    /// If a newer line is still arriving, waits for it until `timeout` has
    /// elapsed, then falls back to the newest complete one. Returns an empty
    /// vector at once when nothing is queued.
    pub fn read_latest_fields(&mut self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            self.fill();

            let partial = self.buffer.last().is_some_and(|&b| b != b'\n');
            if !partial {
                return self
                    .take_newest_line()
                    .map(|line| split_fields(&line))
                    .unwrap_or_default();
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("{}: line still in flight at deadline", self.label);
                return self
                    .take_newest_line()
                    .map(|line| split_fields(&line))
                    .unwrap_or_default();
            }
            sleep(POLL_SLICE.min(deadline - now));
        }
    }

    /// Drop queued input, including any partial line.
    pub fn discard_input(&mut self) {
        self.buffer.clear();
        match discard_input(&mut self.port) {
            Ok(0) => {}
            Ok(n) => debug!("{}: discarded {} stale byte(s)", self.label, n),
            Err(e) => warn!("{}: cannot flush input: {}", self.label, e),
        }
    }

    /// Close the link, releasing the device.
    pub fn close(self) {
        info!("Closing link {}", self.label);
    }

    /// Read everything currently queued into the line buffer.
    fn fill(&mut self) {
        let available = match self.port.bytes_available() {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                warn!("{}: cannot query receive queue: {}", self.label, e);
                return;
            }
        };

        let mut chunk = vec![0u8; available];
        match self.port.read(&mut chunk) {
            Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
            Err(e) if is_transient(&e) => {}
            Err(e) => warn!("{}: read failed: {}", self.label, e),
        }

        if self.buffer.len() > MAX_LINE_BYTES && !self.buffer.contains(&b'\n') {
            warn!("{}: discarding {} bytes without newline", self.label, self.buffer.len());
            self.buffer.clear();
        }
    }

    /// Remove every complete line from the buffer, returning the newest non-empty one.
    fn take_newest_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().rposition(|&b| b == b'\n')?;
        let complete: Vec<u8> = self.buffer.drain(..=end).collect();
        complete
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .filter(|line| !line.is_empty())
            .last()
    }
}

fn split_fields(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}
