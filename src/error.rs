// Crate-level error for bringing the vehicle up and running it

use crate::channel::ChannelError;
use crate::dynamixel::DynamixelError;
use crate::handshake::HandshakeError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Controller handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Servo bus error: {0}")]
    Dynamixel(#[from] DynamixelError),

    #[error("Operator station: {0}")]
    Channel(#[from] ChannelError),

    #[error("Operator station turned off")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
