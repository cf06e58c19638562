// Microcontroller identification
//
// Each candidate device is opened, sent the reserved identify frame, and
// given a short window to answer with its role. The body controller is
// required; the arm controller is optional.

use serialport::SerialPort;
use std::fmt;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::codec::IDENTIFY_FRAME;
use crate::config::{LINK_READ_TIMEOUT, POLL_SLICE};
use crate::link::{self, Port, SerialLink};

/// Logical controller behind a serial device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Body,
    Arm,
}

impl Role {
    fn from_reply(token: &str) -> Option<Self> {
        match token {
            "body" => Some(Role::Body),
            "arm" => Some(Role::Arm),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Body => "body",
            Role::Arm => "arm",
        })
    }
}

/// What a device said when asked to identify itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Identified(Role),
    /// No reply within the window
    Unidentified,
    /// Replied with something other than a known role
    Unrecognized(String),
}

/// Progress of one device through the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Unopened,
    Opened,
    IdentityRequested,
    Identified(Role),
    Unresponsive,
    Unrecognized(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Body controller is not attached ({candidates} device(s) scanned)")]
    NoBody { candidates: usize },

    #[error("Multiple {role} controllers are attached (second on {path})")]
    DuplicateRole { role: Role, path: String },

    #[error("Controller on {path} sent a bad reply: {reply:?}")]
    UnknownRole { path: String, reply: String },
}

/// One candidate device being identified
pub struct Handshake<P: Port = Box<dyn SerialPort>> {
    path: String,
    state: HandshakeState,
    link: Option<SerialLink<P>>,
}

impl<P: Port> Handshake<P> {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            state: HandshakeState::Unopened,
            link: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Open the device with `open`.
    pub fn open<F>(&mut self, open: F) -> Result<(), serialport::Error>
    where
        F: FnOnce(&str) -> Result<P, serialport::Error>,
    {
        let port = open(&self.path)?;
        self.link = Some(SerialLink::new(self.path.clone(), port));
        self.state = HandshakeState::Opened;
        debug!("Opened candidate {}", self.path);
        Ok(())
    }

    /// Send the identify frame and wait up to `timeout` for the reply.
    pub fn identify(&mut self, timeout: Duration) -> Identity {
        let Some(link) = self.link.as_mut() else {
            return Identity::Unidentified;
        };
        link.discard_input();
        link.write(&[IDENTIFY_FRAME]);
        self.state = HandshakeState::IdentityRequested;

        let identity = await_reply(link, timeout);
        self.state = match &identity {
            Identity::Identified(role) => {
                link.set_label(format!("{} ({})", role, self.path));
                HandshakeState::Identified(*role)
            }
            Identity::Unidentified => HandshakeState::Unresponsive,
            Identity::Unrecognized(reply) => HandshakeState::Unrecognized(reply.clone()),
        };
        identity
    }

    /// Hand over the link once identified.
    pub fn into_link(self) -> Option<SerialLink<P>> {
        self.link
    }

    pub fn close(self) {
        if let Some(link) = self.link {
            link.close();
        }
    }
}

/// Wait for a role token. The body streams sensor records, so lines that
/// are not a role are skipped; only a non-role last line is unrecognized.
fn await_reply<P: Port>(link: &mut SerialLink<P>, timeout: Duration) -> Identity {
    let deadline = Instant::now() + timeout;
    let mut last_other: Option<String> = None;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return match last_other {
                Some(reply) => Identity::Unrecognized(reply),
                None => Identity::Unidentified,
            };
        }
        let fields = link.read_latest_fields(LINK_READ_TIMEOUT.min(deadline - now));
        if let Some(token) = fields.first() {
            if let Some(role) = Role::from_reply(token) {
                return Identity::Identified(role);
            }
            debug!("{}: skipping non-role line {:?}", link.label(), fields);
            last_other = Some(token.clone());
        }
        sleep(POLL_SLICE.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// The identified controllers
pub struct ControllerLinks<P: Port = Box<dyn SerialPort>> {
    pub body: SerialLink<P>,
    pub arm: Option<SerialLink<P>>,
}

impl<P: Port> ControllerLinks<P> {
    pub fn close(self) {
        self.body.close();
        if let Some(arm) = self.arm {
            arm.close();
        }
    }
}

/// Serial devices that look like USB CDC-ACM microcontrollers, sorted.
pub fn candidate_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => {
            let mut names: Vec<String> = ports
                .into_iter()
                .map(|p| p.port_name)
                .filter(|name| name.contains("ttyACM") || name.contains("usbmodem"))
                .collect();
            names.sort();
            names
        }
        Err(e) => {
            warn!("Cannot list serial ports: {}", e);
            Vec::new()
        }
    }
}

/// Identify the controllers among `paths`, opening them as serial devices.
pub fn connect_controllers(
    paths: &[String],
    baudrate: u32,
    timeout: Duration,
) -> Result<ControllerLinks, HandshakeError> {
    connect_with(paths, timeout, |path| link::open_port(path, baudrate))
}

/// Identify the controllers among `paths` using `open` to reach each one.
///
/// Every link opened so far is closed before a fatal error is returned.
pub fn connect_with<P, F>(
    paths: &[String],
    timeout: Duration,
    mut open: F,
) -> Result<ControllerLinks<P>, HandshakeError>
where
    P: Port,
    F: FnMut(&str) -> Result<P, serialport::Error>,
{
    info!("Identifying controllers on {:?}", paths);
    let mut body: Option<SerialLink<P>> = None;
    let mut arm: Option<SerialLink<P>> = None;

    let close_all = |body: Option<SerialLink<P>>, arm: Option<SerialLink<P>>| {
        for link in body.into_iter().chain(arm) {
            link.close();
        }
    };

    for path in paths {
        let mut handshake = Handshake::new(path.as_str());
        if let Err(e) = handshake.open(&mut open) {
            warn!("Cannot open {}: {}", path, e);
            continue;
        }

        match handshake.identify(timeout) {
            Identity::Identified(role) => {
                let slot = match role {
                    Role::Body => &mut body,
                    Role::Arm => &mut arm,
                };
                if slot.is_some() {
                    handshake.close();
                    close_all(body, arm);
                    return Err(HandshakeError::DuplicateRole {
                        role,
                        path: path.clone(),
                    });
                }
                info!("Found {} controller on {}", role, path);
                *slot = handshake.into_link();
            }
            Identity::Unidentified => {
                warn!("Device on {} is unidentified", path);
                handshake.close();
            }
            Identity::Unrecognized(reply) => {
                handshake.close();
                close_all(body, arm);
                return Err(HandshakeError::UnknownRole {
                    path: path.clone(),
                    reply,
                });
            }
        }
    }

    let Some(body) = body else {
        close_all(None, arm);
        return Err(HandshakeError::NoBody {
            candidates: paths.len(),
        });
    };
    if arm.is_none() {
        warn!("Arm controller is not attached; arm commands will be dropped");
    }
    Ok(ControllerLinks { body, arm })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockHandle, MockPort};
    use std::collections::HashMap;

    fn replying(reply: &'static [u8]) -> (MockPort, MockHandle) {
        MockPort::responding(move |bytes| {
            if bytes == [IDENTIFY_FRAME] {
                reply.to_vec()
            } else {
                Vec::new()
            }
        })
    }

    fn paths(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Opener backed by a table of ports; missing paths fail to open.
    fn opener(
        mut ports: HashMap<&'static str, MockPort>,
    ) -> impl FnMut(&str) -> Result<MockPort, serialport::Error> {
        move |path| {
            ports.remove(path).ok_or_else(|| {
                serialport::Error::new(serialport::ErrorKind::NoDevice, "no such device")
            })
        }
    }

    #[test]
    fn test_silent_device_is_unidentified_within_timeout() {
        let (port, handle) = MockPort::new();
        let mut handshake = Handshake::new("/dev/ttyACM0");
        handshake.open(|_| Ok(port)).unwrap();

        let start = Instant::now();
        assert_eq!(handshake.identify(Duration::from_millis(100)), Identity::Unidentified);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(400));
        assert_eq!(handshake.state(), &HandshakeState::Unresponsive);
        assert_eq!(handle.written(), vec![IDENTIFY_FRAME]);
    }

    #[test]
    fn test_identify_reads_role() {
        let (port, _handle) = replying(b"arm\n");
        let mut handshake = Handshake::new("/dev/ttyACM1");
        assert_eq!(handshake.state(), &HandshakeState::Unopened);
        handshake.open(|_| Ok(port)).unwrap();
        assert_eq!(handshake.state(), &HandshakeState::Opened);

        assert_eq!(
            handshake.identify(Duration::from_millis(200)),
            Identity::Identified(Role::Arm)
        );
        assert_eq!(handshake.state(), &HandshakeState::Identified(Role::Arm));
    }

    #[test]
    fn test_stale_input_is_discarded_before_asking() {
        let (port, handle) = replying(b"body\n");
        handle.push_incoming(b"arm\n");
        let mut handshake = Handshake::new("/dev/ttyACM0");
        handshake.open(|_| Ok(port)).unwrap();
        assert_eq!(
            handshake.identify(Duration::from_millis(200)),
            Identity::Identified(Role::Body)
        );
    }

    #[test]
    fn test_streaming_body_is_identified() {
        // The body prints pot records on every pass; the tail of one arrives
        // before the role reply
        let (port, handle) = replying(b"3C4D \n");
        handle.release_after_reads(6, b"body\n");
        let mut handshake = Handshake::new("/dev/ttyACM0");
        handshake.open(|_| Ok(port)).unwrap();

        assert_eq!(
            handshake.identify(Duration::from_millis(300)),
            Identity::Identified(Role::Body)
        );
    }

    #[test]
    fn test_role_after_records_is_identified() {
        let (port, _handle) = replying(b"0A3D 8000\n0A3E 8001\nbody\n");
        let mut handshake = Handshake::new("/dev/ttyACM0");
        handshake.open(|_| Ok(port)).unwrap();
        assert_eq!(
            handshake.identify(Duration::from_millis(200)),
            Identity::Identified(Role::Body)
        );
    }

    #[test]
    fn test_body_and_arm_found() {
        let (body, _) = replying(b"body\n");
        let (arm, _) = replying(b"arm\n");
        let ports = HashMap::from([("/dev/ttyACM0", arm), ("/dev/ttyACM1", body)]);

        let links = connect_with(
            &paths(&["/dev/ttyACM0", "/dev/ttyACM1"]),
            Duration::from_millis(200),
            opener(ports),
        )
        .unwrap();
        assert!(links.body.label().contains("/dev/ttyACM1"));
        assert!(links.arm.is_some());
    }

    #[test]
    fn test_missing_arm_is_not_fatal() {
        let (body, _) = replying(b"body\n");
        let (silent, _) = MockPort::new();
        let ports = HashMap::from([("/dev/ttyACM0", body), ("/dev/ttyACM1", silent)]);

        let links = connect_with(
            &paths(&["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyACM2"]),
            Duration::from_millis(50),
            opener(ports),
        )
        .unwrap();
        assert!(links.arm.is_none());
    }

    #[test]
    fn test_missing_body_is_fatal() {
        let (arm, _) = replying(b"arm\n");
        let ports = HashMap::from([("/dev/ttyACM0", arm)]);

        let result = connect_with(
            &paths(&["/dev/ttyACM0"]),
            Duration::from_millis(50),
            opener(ports),
        );
        assert!(matches!(result, Err(HandshakeError::NoBody { candidates: 1 })));
    }

    #[test]
    fn test_duplicate_role_is_fatal() {
        let (a, _) = replying(b"body\n");
        let (b, _) = replying(b"body\n");
        let ports = HashMap::from([("/dev/ttyACM0", a), ("/dev/ttyACM1", b)]);

        let result = connect_with(
            &paths(&["/dev/ttyACM0", "/dev/ttyACM1"]),
            Duration::from_millis(200),
            opener(ports),
        );
        assert!(matches!(
            result,
            Err(HandshakeError::DuplicateRole { role: Role::Body, .. })
        ));
    }

    #[test]
    fn test_unknown_role_is_fatal() {
        let (body, _) = replying(b"body\n");
        let (odd, _) = replying(b"toaster 3\n");
        let ports = HashMap::from([("/dev/ttyACM0", body), ("/dev/ttyACM1", odd)]);

        let result = connect_with(
            &paths(&["/dev/ttyACM0", "/dev/ttyACM1"]),
            Duration::from_millis(200),
            opener(ports),
        );
        match result {
            Err(HandshakeError::UnknownRole { path, reply }) => {
                assert_eq!(path, "/dev/ttyACM1");
                assert_eq!(reply, "toaster");
            }
            _ => panic!("expected an unknown role error"),
        }
    }
}
