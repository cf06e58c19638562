// Test doubles: a scripted serial port and a simulated servo bus

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::rc::Rc;

use crate::link::Port;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

#[derive(Default)]
struct MockState {
    incoming: VecDeque<u8>,
    written: Vec<u8>,
    responder: Option<Responder>,
    failing_writes: usize,
    polls: usize,
    delayed: Option<(usize, Vec<u8>)>,
}

/// In-memory port; the paired `MockHandle` scripts and inspects it.
pub struct MockPort {
    state: Rc<RefCell<MockState>>,
}

#[derive(Clone)]
pub struct MockHandle {
    state: Rc<RefCell<MockState>>,
}

impl MockPort {
    pub fn new() -> (Self, MockHandle) {
        let state = Rc::new(RefCell::new(MockState::default()));
        (
            Self {
                state: state.clone(),
            },
            MockHandle { state },
        )
    }

    /// A port that answers every write with `responder(written_bytes)`.
    pub fn responding(responder: impl FnMut(&[u8]) -> Vec<u8> + 'static) -> (Self, MockHandle) {
        let (port, handle) = Self::new();
        handle.state.borrow_mut().responder = Some(Box::new(responder));
        (port, handle)
    }
}

impl MockHandle {
    pub fn push_incoming(&self, bytes: &[u8]) {
        self.state.borrow_mut().incoming.extend(bytes);
    }

    /// Make `bytes` readable once the port has been polled `polls` more times.
    pub fn release_after_reads(&self, polls: usize, bytes: &[u8]) {
        let mut state = self.state.borrow_mut();
        let due = state.polls + polls;
        state.delayed = Some((due, bytes.to_vec()));
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.state.borrow_mut().failing_writes = count;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    pub fn clear_written(&self) {
        self.state.borrow_mut().written.clear();
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        let n = buf.len().min(state.incoming.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.incoming.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(io::Error::new(io::ErrorKind::ResourceBusy, "device busy"));
        }
        state.written.extend_from_slice(buf);
        if let Some(mut responder) = state.responder.take() {
            let reply = responder(buf);
            state.incoming.extend(reply);
            state.responder = Some(responder);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.polls += 1;
        if let Some((due, _)) = &state.delayed {
            if state.polls >= *due {
                if let Some((_, bytes)) = state.delayed.take() {
                    state.incoming.extend(bytes);
                }
            }
        }
        Ok(state.incoming.len())
    }
}

/// Register memory of one simulated servo
#[derive(Clone)]
pub struct SimServo {
    pub memory: [u8; 80],
    /// Remaining reads of the `moving` register that report motion.
    pub moving_reads: u32,
    /// Write parameters held by reg-write until an action
    pub staged: Option<Vec<u8>>,
}

impl SimServo {
    pub fn new(id: u8, model: u16) -> Self {
        let mut memory = [0u8; 80];
        memory[0..2].copy_from_slice(&model.to_le_bytes());
        memory[3] = id;
        memory[4] = 1;
        memory[0x2A] = 120; // 12.0 V
        memory[0x2B] = 35;
        Self {
            memory,
            moving_reads: 0,
            staged: None,
        }
    }

    pub fn read_u16(&self, address: u8) -> u16 {
        let a = address as usize;
        u16::from_le_bytes([self.memory[a], self.memory[a + 1]])
    }

    pub fn set_u16(&mut self, address: u8, value: u16) {
        let a = address as usize;
        self.memory[a..a + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn apply_write(&mut self, params: &[u8]) {
        let address = params[0] as usize;
        self.memory[address..address + params.len() - 1].copy_from_slice(&params[1..]);
    }
}

/// Fault injection for the simulated bus
#[derive(Default, Clone, Copy)]
pub struct SimFaults {
    pub corrupt_checksum: bool,
    pub bad_header: bool,
    pub error_flags: u8,
}

#[derive(Default)]
pub struct SimBusState {
    pub servos: BTreeMap<u8, SimServo>,
    pub faults: SimFaults,
    pub transactions: usize,
}

/// Shared view of a simulated Protocol 1.0 servo bus
#[derive(Clone, Default)]
pub struct SimBus {
    pub state: Rc<RefCell<SimBusState>>,
}

impl SimBus {
    pub fn with_servos(servos: &[(u8, u16)]) -> Self {
        let bus = Self::default();
        for &(id, model) in servos {
            bus.state.borrow_mut().servos.insert(id, SimServo::new(id, model));
        }
        bus
    }

    /// A port wired to this bus.
    pub fn port(&self) -> MockPort {
        let sim = self.clone();
        let (port, _handle) = MockPort::responding(move |bytes| sim.respond(bytes));
        port
    }

    pub fn servo(&self, id: u8) -> Option<SimServo> {
        self.state.borrow().servos.get(&id).cloned()
    }

    pub fn with_servo<R>(&self, id: u8, f: impl FnOnce(&mut SimServo) -> R) -> Option<R> {
        self.state.borrow_mut().servos.get_mut(&id).map(f)
    }

    pub fn set_faults(&self, faults: SimFaults) {
        self.state.borrow_mut().faults = faults;
    }

    pub fn transactions(&self) -> usize {
        self.state.borrow().transactions
    }

    fn respond(&self, packet: &[u8]) -> Vec<u8> {
        if packet.len() < 6 || packet[0] != 0xFF || packet[1] != 0xFF {
            return Vec::new();
        }
        let id = packet[2];
        let length = packet[3] as usize;
        let instruction = packet[4];
        let params = &packet[5..5 + length - 2];

        let mut state = self.state.borrow_mut();
        state.transactions += 1;
        let faults = state.faults;

        // Broadcasts never get a status packet
        if id == 0xFE {
            match instruction {
                0x05 => {
                    for servo in state.servos.values_mut() {
                        if let Some(staged) = servo.staged.take() {
                            servo.apply_write(&staged);
                        }
                    }
                }
                0x83 => {
                    let (address, width) = (params[0], params[1] as usize);
                    for chunk in params[2..].chunks(1 + width) {
                        if let Some(servo) = state.servos.get_mut(&chunk[0]) {
                            let mut write = vec![address];
                            write.extend_from_slice(&chunk[1..]);
                            servo.apply_write(&write);
                        }
                    }
                }
                _ => {}
            }
            return Vec::new();
        }
        let Some(servo) = state.servos.get_mut(&id) else {
            return Vec::new();
        };

        let mut reply_id = id;
        let data: Vec<u8> = match instruction {
            0x01 => Vec::new(),
            0x02 => {
                let address = params[0] as usize;
                let count = params[1] as usize;
                if address == 0x2E {
                    let moving = servo.moving_reads > 0;
                    servo.moving_reads = servo.moving_reads.saturating_sub(1);
                    vec![moving as u8]
                } else {
                    servo.memory[address..address + count].to_vec()
                }
            }
            0x03 => {
                servo.apply_write(params);
                Vec::new()
            }
            0x04 => {
                servo.staged = Some(params.to_vec());
                Vec::new()
            }
            0x06 => {
                let model = servo.read_u16(0);
                *servo = SimServo::new(1, model);
                Vec::new()
            }
            _ => return Vec::new(),
        };

        let new_id = servo.memory[3];
        if new_id != id {
            if let Some(moved) = state.servos.remove(&id) {
                state.servos.insert(new_id, moved);
            }
            if instruction == 0x03 {
                reply_id = new_id;
            }
        }

        let mut reply = vec![0xFF, 0xFF, reply_id, (data.len() + 2) as u8, faults.error_flags];
        reply.extend_from_slice(&data);
        let sum: u32 = reply[2..].iter().map(|&b| b as u32).sum();
        let mut checksum = !(sum as u8);
        if faults.corrupt_checksum {
            checksum ^= 0x01;
        }
        reply.push(checksum);
        if faults.bad_header {
            reply[1] = 0x00;
        }
        reply
    }
}
