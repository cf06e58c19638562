// Instruction and status packets
//
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// Status format: [0xFF, 0xFF, ID, Length, Error, Params..., Checksum]
// Length counts everything after itself; the checksum covers ID through the
// last parameter.

use std::fmt;

use super::{DynamixelError, Result};

/// Packet header bytes
pub const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    RegWrite = 0x04,
    Action = 0x05,
    Reset = 0x06,
    SyncWrite = 0x83,
}

/// Ones' complement of the byte sum, truncated to 8 bits.
pub fn checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    !(sum as u8)
}

/// Build a packet with header and checksum
pub fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 2) as u8; // params + instruction + checksum
    let mut packet = Vec::with_capacity(6 + params.len());

    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push(length);
    packet.push(instruction as u8);
    packet.extend_from_slice(params);

    let checksum = checksum(&packet[2..]);
    packet.push(checksum);

    packet
}

/// Read request parameters: start address and byte count.
pub fn read_params(address: u8, width: u8) -> [u8; 2] {
    [address, width]
}

/// Write request parameters for a 1- or 2-byte register.
///
/// Negative values are sent as 16-bit two's complement.
pub fn write_params(address: u8, width: u8, value: i32) -> Vec<u8> {
    let raw = (if value < 0 { value + 0x1_0000 } else { value }) as u16;
    match width {
        1 => vec![address, raw as u8],
        _ => vec![address, (raw & 0xFF) as u8, (raw >> 8) as u8],
    }
}

/// Sync write parameters: [address, width, id1, data1..., id2, data2..., ...]
pub fn sync_write_params(address: u8, width: u8, data: &[(u8, u16)]) -> Vec<u8> {
    let mut params = Vec::with_capacity(2 + data.len() * (1 + width as usize));
    params.push(address);
    params.push(width);
    for &(id, value) in data {
        params.push(id);
        params.push((value & 0xFF) as u8);
        if width == 2 {
            params.push((value >> 8) as u8);
        }
    }
    params
}

/// Error conditions reported in the status packet's error byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoFault {
    InputVoltage = 1,
    AngleLimit = 2,
    Overheating = 4,
    Range = 8,
    Checksum = 16,
    Overload = 32,
    Instruction = 64,
}

const FAULTS: [ServoFault; 7] = [
    ServoFault::InputVoltage,
    ServoFault::AngleLimit,
    ServoFault::Overheating,
    ServoFault::Range,
    ServoFault::Checksum,
    ServoFault::Overload,
    ServoFault::Instruction,
];

/// Decoded error byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorFlags(u8);

impl ErrorFlags {
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 & 0x7F == 0
    }

    pub fn contains(self, fault: ServoFault) -> bool {
        self.0 & fault as u8 != 0
    }

    pub fn faults(self) -> impl Iterator<Item = ServoFault> {
        FAULTS.into_iter().filter(move |&f| self.contains(f))
    }
}

impl fmt::Display for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.faults().map(|fault| format!("{fault:?}")).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// A validated status packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    pub id: u8,
    pub errors: ErrorFlags,
    pub params: Vec<u8>,
}

impl StatusPacket {
    /// Parse a complete status packet, checking header and checksum.
    ///
    /// Error flags are decoded but not enforced; see `verify`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 || data[..2] != HEADER {
            let mut header = [0u8; 2];
            for (slot, &b) in header.iter_mut().zip(data) {
                *slot = b;
            }
            return Err(DynamixelError::BadHeader { header });
        }
        if data.len() < 6 {
            return Err(DynamixelError::BadLength(data.len()));
        }

        let length = data[3] as usize;
        if data.len() != length + 4 {
            return Err(DynamixelError::BadLength(data.len()));
        }

        let expected = checksum(&data[2..data.len() - 1]);
        let received = data[data.len() - 1];
        if expected != received {
            return Err(DynamixelError::ChecksumMismatch { expected, received });
        }

        Ok(Self {
            id: data[2],
            errors: ErrorFlags::from_bits(data[4]),
            params: data[5..data.len() - 1].to_vec(),
        })
    }

    /// Fail if the servo raised any error flag.
    pub fn verify(self) -> Result<Self> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(DynamixelError::Status {
                id: self.id,
                errors: self.errors,
            })
        }
    }

    /// The returned register value, little-endian for 2-byte reads.
    pub fn value(&self) -> Result<u16> {
        match self.params.as_slice() {
            [lo] => Ok(*lo as u16),
            [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi])),
            other => Err(DynamixelError::BadLength(other.len())),
        }
    }
}
