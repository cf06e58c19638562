// Yozakura field runtime: controller links, servo arm, control loop

pub mod arm;
pub mod channel;
pub mod codec;
pub mod config;
pub mod dynamixel;
pub mod error;
pub mod handshake;
pub mod link;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod sensors;
pub mod teleop;

#[cfg(test)]
pub(crate) mod testing;
