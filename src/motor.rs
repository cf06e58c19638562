// DC motors behind the body microcontroller
//
// Provides:
// - Per-motor speed scaling (dead-band compensation and speed cap)
// - The drivetrain owning every motor and the sink its frames go to
// - Flipper travel protection from potentiometer readings

use serialport::SerialPort;
use tracing::{debug, info, warn};

use crate::codec::{MotorFrame, MAX_SLOT};
use crate::config::{FLIPPER_HIGH, FLIPPER_LOW};
use crate::link::{Port, SerialLink};

/// Anything that can carry a motor frame to a motor driver
pub trait FrameSink {
    fn send_frame(&mut self, frame: u8);
}

impl<P: Port> FrameSink for SerialLink<P> {
    fn send_frame(&mut self, frame: u8) {
        self.write(&[frame]);
    }
}

impl FrameSink for Vec<u8> {
    fn send_frame(&mut self, frame: u8) {
        self.push(frame);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("`{field}` of {name} should be between 0 and 1, got {value}")]
    BadParameter {
        name: String,
        field: &'static str,
        value: f32,
    },

    #[error("Motor slot {0} does not exist")]
    BadSlot(u8),

    #[error("Motor slot {slot} is already used by {name}")]
    SlotTaken { slot: u8, name: String },
}

/// One motor channel on the body microcontroller
#[derive(Debug, Clone, PartialEq)]
pub struct Motor {
    name: String,
    slot: u8,
    start_input: f32,
    max_speed: f32,
}

impl Motor {
    /// `start_input` is the smallest output that moves the motor at all;
    /// `max_speed` caps the output. Both lie in [0, 1].
    pub fn new(
        name: impl Into<String>,
        slot: u8,
        start_input: f32,
        max_speed: f32,
    ) -> Result<Self, MotorError> {
        let name = name.into();
        if slot > MAX_SLOT {
            return Err(MotorError::BadSlot(slot));
        }
        for (field, value) in [("start_input", start_input), ("max_speed", max_speed)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MotorError::BadParameter { name, field, value });
            }
        }
        Ok(Self {
            name,
            slot,
            start_input,
            max_speed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Map a requested speed in [-1, 1] onto [start_input, 1] scaled by
    /// `max_speed`. Zero stays zero.
    pub fn scale_speed(&self, speed: f32) -> f32 {
        let speed = speed.clamp(-1.0, 1.0);
        let scaled = if speed > 0.0 {
            speed * (1.0 - self.start_input) + self.start_input
        } else if speed < 0.0 {
            speed * (1.0 - self.start_input) - self.start_input
        } else {
            0.0
        };
        scaled * self.max_speed
    }

    pub fn frame(&self, speed: f32) -> MotorFrame {
        MotorFrame::from_speed(self.slot, self.scale_speed(speed))
    }
}

/// The standard motor layout: wheels then flippers, slots 0 to 3.
pub fn default_motors() -> Vec<Motor> {
    [
        ("left_wheel", 0, 0.8),
        ("right_wheel", 1, 0.8),
        ("left_flipper", 2, 0.4),
        ("right_flipper", 3, 0.4),
    ]
    .into_iter()
    .filter_map(|(name, slot, max_speed)| Motor::new(name, slot, 0.0, max_speed).ok())
    .collect()
}

/// All motors driven through one frame sink.
///
/// Dropping the drivetrain stops every motor.
pub struct Drivetrain<S: FrameSink = SerialLink<Box<dyn SerialPort>>> {
    sink: S,
    motors: Vec<Motor>,
}

impl<S: FrameSink> Drivetrain<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            motors: Vec::new(),
        }
    }

    /// A drivetrain with the standard four motors
    pub fn with_default_motors(sink: S) -> Self {
        let mut drivetrain = Self::new(sink);
        drivetrain.motors = default_motors();
        drivetrain
    }

    pub fn add_motor(&mut self, motor: Motor) -> Result<(), MotorError> {
        if let Some(existing) = self.motors.iter().find(|m| m.slot == motor.slot) {
            return Err(MotorError::SlotTaken {
                slot: motor.slot,
                name: existing.name.clone(),
            });
        }
        debug!("Adding motor {} on slot {}", motor.name, motor.slot);
        self.motors.push(motor);
        Ok(())
    }

    pub fn motors(&self) -> &[Motor] {
        &self.motors
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Drive each motor at the matching speed, in registration order.
    ///
    /// Missing speeds count as zero.
    pub fn drive(&mut self, speeds: &[f32]) {
        for (i, motor) in self.motors.iter().enumerate() {
            let speed = speeds.get(i).copied().unwrap_or(0.0);
            let frame = motor.frame(speed);
            self.sink.send_frame(frame.to_byte());
        }
    }

    /// Send a zero command to every motor.
    pub fn stop_all(&mut self) {
        info!("Stopping all motors");
        for motor in &self.motors {
            self.sink.send_frame(MotorFrame::stop(motor.slot).to_byte());
        }
    }
}

impl<S: FrameSink> Drop for Drivetrain<S> {
    fn drop(&mut self) {
        if !self.motors.is_empty() {
            self.stop_all();
        }
    }
}

/// Which way a flipper's potentiometer reads relative to its command sign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClampPolarity {
    /// Positive commands raise the reading
    #[default]
    Direct,
    /// Positive commands lower the reading
    Inverted,
}

/// Fractions of potentiometer travel past which a flipper stops
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlipperLimits {
    pub low: f32,
    pub high: f32,
}

impl Default for FlipperLimits {
    fn default() -> Self {
        Self {
            low: FLIPPER_LOW,
            high: FLIPPER_HIGH,
        }
    }
}

/// Zero a flipper command that would drive further past a travel limit.
///
/// Without a position reading the command passes unchanged.
pub fn clamp_flipper(
    name: &str,
    position: Option<f32>,
    speed: f32,
    polarity: ClampPolarity,
    limits: FlipperLimits,
) -> f32 {
    let Some(position) = position else {
        return speed;
    };
    // Sign of a command that lowers the reading
    let lowering = match polarity {
        ClampPolarity::Direct => -1.0,
        ClampPolarity::Inverted => 1.0,
    };
    let toward_low = speed * lowering > 0.0;
    let toward_high = speed * lowering < 0.0;

    if (position <= limits.low && toward_low) || (position >= limits.high && toward_high) {
        warn!("{} is near its limit: {:5.3}", name, position);
        return 0.0;
    }
    speed
}
