// Dynamixel Protocol 1.0 smart servos (AX-12, MX-28)
//
// Provides:
// - Packet building, checksum and status parsing
// - Per-family register tables with widths and legal ranges
// - A shared bus with a live-id registry
// - One handle per servo with unit-converting accessors

mod bus;
pub mod packet;
pub mod register;
mod servo;

pub use bus::{Probe, ServoBus};
pub use packet::{ErrorFlags, Instruction, ServoFault, StatusPacket};
pub use register::{Family, Register, RegisterSpec};
pub use servo::Servo;

/// Highest id a servo may be assigned (254 is broadcast)
pub const MAX_ID: u8 = 253;

/// Broadcast id, used by sync writes
pub const BROADCAST_ID: u8 = 0xFE;

/// Error types for Dynamixel communication
#[derive(Debug, thiserror::Error)]
pub enum DynamixelError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for response from servo {id}")]
    Timeout { id: u8 },

    #[error("Bad header in response: {header:02X?}")]
    BadHeader { header: [u8; 2] },

    #[error("Checksum {received:#04X} should be {expected:#04X}")]
    ChecksumMismatch { expected: u8, received: u8 },

    #[error("Response from servo {got}, expected {expected}")]
    IdMismatch { expected: u8, got: u8 },

    #[error("Bad number of values returned: {0}")]
    BadLength(usize),

    #[error("Servo {id} reported errors: {errors}")]
    Status { id: u8, errors: ErrorFlags },

    #[error("ID {0} is not legal")]
    IllegalId(u8),

    #[error("ID# {0} is already registered")]
    DuplicateId(u8),

    #[error("Servo {id} is not a {expected} (model number {found})")]
    WrongModel {
        id: u8,
        expected: Family,
        found: u16,
    },

    #[error("Illegal value {value} for {register:?} (legal {min}..={max})")]
    OutOfRange {
        register: Register,
        value: i32,
        min: i32,
        max: i32,
    },

    #[error("{register:?} is read-only")]
    ReadOnly { register: Register },

    #[error("{family} has no {register:?} register")]
    UnsupportedRegister { family: Family, register: Register },

    #[error("{family} does not support multiturn mode")]
    MultiturnUnsupported { family: Family },

    #[error("Resetting servo {0} would conflict with servo #1")]
    ResetConflict(u8),

    #[error("Bus {0} is already in a transaction")]
    BusBusy(String),
}

pub type Result<T> = std::result::Result<T, DynamixelError>;
