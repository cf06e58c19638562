// Shared half-duplex servo bus and its live-id registry

use serialport::SerialPort;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::packet::{self, Instruction, StatusPacket, HEADER};
use super::register::Family;
use super::servo::Servo;
use super::{DynamixelError, Result, BROADCAST_ID, MAX_ID};
use crate::config::{SERVO_BAUDRATE, SERVO_TIMEOUT};
use crate::link::{self, Port};

/// Result of looking for a servo on the bus
pub enum Probe<P: Port = Box<dyn SerialPort>> {
    Found(Servo<P>),
    Absent { id: u8 },
    Failed(DynamixelError),
}

/// A servo bus: one port, one transaction at a time, unique ids.
///
/// Handles share the bus through `Rc`; every request/response pair holds
/// the port borrow for its whole duration.
pub struct ServoBus<P: Port = Box<dyn SerialPort>> {
    label: String,
    port: RefCell<P>,
    registry: RefCell<BTreeSet<u8>>,
    timeout: Duration,
}

impl ServoBus {
    /// Open a serial device as a servo bus
    pub fn open(path: &str) -> Result<Rc<Self>> {
        Self::open_with_baudrate(path, SERVO_BAUDRATE)
    }

    pub fn open_with_baudrate(path: &str, baudrate: u32) -> Result<Rc<Self>> {
        info!("Opening servo bus on {} at {} baud", path, baudrate);
        let port = link::open_port(path, baudrate)?;
        Ok(Self::new(path, port, SERVO_TIMEOUT))
    }
}

impl<P: Port> ServoBus<P> {
    /// Wrap a port. `timeout` bounds every response read.
    pub fn new(label: impl Into<String>, port: P, timeout: Duration) -> Rc<Self> {
        Rc::new(Self {
            label: label.into(),
            port: RefCell::new(port),
            registry: RefCell::new(BTreeSet::new()),
            timeout,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Ids of all open handles, ascending
    pub fn registered_ids(&self) -> Vec<u8> {
        self.registry.borrow().iter().copied().collect()
    }

    pub fn is_registered(&self, id: u8) -> bool {
        self.registry.borrow().contains(&id)
    }

    /// Reject ids that are illegal or already held by a handle.
    pub(crate) fn check_available(&self, id: u8) -> Result<()> {
        if id > MAX_ID {
            return Err(DynamixelError::IllegalId(id));
        }
        if self.is_registered(id) {
            return Err(DynamixelError::DuplicateId(id));
        }
        Ok(())
    }

    pub(crate) fn register(&self, id: u8) -> Result<()> {
        self.check_available(id)?;
        self.registry.borrow_mut().insert(id);
        Ok(())
    }

    pub(crate) fn release(&self, id: u8) {
        self.registry.borrow_mut().remove(&id);
    }

    pub(crate) fn rename(&self, old_id: u8, new_id: u8) {
        let mut registry = self.registry.borrow_mut();
        registry.remove(&old_id);
        registry.insert(new_id);
    }

    /// Send an instruction and wait for the status packet from the same id.
    pub fn transact(&self, id: u8, instruction: Instruction, params: &[u8]) -> Result<StatusPacket> {
        self.transact_from(id, id, instruction, params)
    }

    /// Send an instruction to `id` and expect the status from `reply_id`.
    ///
    /// Needed when the instruction itself changes the servo's id.
    pub fn transact_from(
        &self,
        id: u8,
        reply_id: u8,
        instruction: Instruction,
        params: &[u8],
    ) -> Result<StatusPacket> {
        let mut port = self
            .port
            .try_borrow_mut()
            .map_err(|_| DynamixelError::BusBusy(self.label.clone()))?;

        let packet = packet::build_packet(id, instruction, params);
        let stale = link::discard_input(&mut *port)?;
        if stale > 0 {
            debug!("{}: discarded {} stale byte(s)", self.label, stale);
        }
        port.write_all(&packet)?;
        port.flush()?;

        let deadline = Instant::now() + self.timeout;
        let timed_out = |e: io::Error| match e.kind() {
            io::ErrorKind::TimedOut => DynamixelError::Timeout { id: reply_id },
            _ => DynamixelError::Io(e),
        };

        let mut head = [0u8; 4];
        link::read_exact_by(&mut *port, &mut head[..2], deadline).map_err(timed_out)?;
        if head[..2] != HEADER {
            return Err(DynamixelError::BadHeader {
                header: [head[0], head[1]],
            });
        }
        link::read_exact_by(&mut *port, &mut head[2..], deadline).map_err(timed_out)?;

        let length = head[3] as usize;
        let mut response = Vec::with_capacity(4 + length);
        response.extend_from_slice(&head);
        response.resize(4 + length, 0);
        link::read_exact_by(&mut *port, &mut response[4..], deadline).map_err(timed_out)?;

        let status = StatusPacket::parse(&response)?;
        if status.id != reply_id {
            return Err(DynamixelError::IdMismatch {
                expected: reply_id,
                got: status.id,
            });
        }
        Ok(status)
    }

    /// Send an instruction that produces no status packet.
    pub fn send(&self, id: u8, instruction: Instruction, params: &[u8]) -> Result<()> {
        let mut port = self
            .port
            .try_borrow_mut()
            .map_err(|_| DynamixelError::BusBusy(self.label.clone()))?;
        let packet = packet::build_packet(id, instruction, params);
        port.write_all(&packet)?;
        port.flush()?;
        Ok(())
    }

    /// Write the same register on several servos in one broadcast packet.
    pub fn sync_write(&self, address: u8, width: u8, data: &[(u8, u16)]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        debug!("Sync write to {} servos at {:#04X}", data.len(), address);
        let params = packet::sync_write_params(address, width, data);
        self.send(BROADCAST_ID, Instruction::SyncWrite, &params)
    }

    /// Trigger instructions staged with reg-write on every servo.
    pub fn action(&self) -> Result<()> {
        self.send(BROADCAST_ID, Instruction::Action, &[])
    }

    /// Ping a servo to check if it's connected
    pub fn ping(&self, id: u8) -> Result<bool> {
        match self.transact(id, Instruction::Ping, &[]) {
            Ok(_) => Ok(true),
            Err(DynamixelError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Look for a servo of `family` at `id` and open a handle on success.
    pub fn probe(self: &Rc<Self>, id: u8, family: Family, name: &str) -> Probe<P> {
        match Servo::open(self, id, family, name) {
            Ok(servo) => Probe::Found(servo),
            Err(DynamixelError::Timeout { id }) => Probe::Absent { id },
            Err(e) => Probe::Failed(e),
        }
    }
}
