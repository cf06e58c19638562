// Bit-packed command frames for the body and arm microcontrollers
//
// Motor frame: [slot:2][sign:1][magnitude:5]
// Arm frame:   [mode:2][yaw:2][pitch:2][extend:2]   (axis value 2 means -1)
//
// | field     | bits | shift | mask |
// |-----------|------|-------|------|
// | slot      | 7:6  | 6     | 0b11 |
// | sign      | 5    | 5     | 0b1  |
// | magnitude | 4:0  | 0     | 0x1F |
// | mode      | 7:6  | 6     | 0b11 |
// | yaw       | 5:4  | 4     | 0b11 |
// | pitch     | 3:2  | 2     | 0b11 |
// | extend    | 1:0  | 0     | 0b11 |

use serde::{Deserialize, Serialize};

pub const MAX_SLOT: u8 = 3;
pub const MAX_MAGNITUDE: u8 = 31;

const SLOT_SHIFT: u8 = 6;
const SIGN_SHIFT: u8 = 5;
const MAGNITUDE_MASK: u8 = 0x1F;

const MODE_SHIFT: u8 = 6;
const YAW_SHIFT: u8 = 4;
const PITCH_SHIFT: u8 = 2;
const AXIS_MASK: u8 = 0b11;

/// Reserved motor frame asking a microcontroller to name itself.
///
/// Slot 3 with a negative zero speed is never produced while driving.
pub const IDENTIFY_FRAME: u8 = 0b1110_0000;

/// Pack a motor frame. Panics on out-of-range fields.
pub fn pack_motor(slot: u8, negative: bool, magnitude: u8) -> u8 {
    assert!(slot <= MAX_SLOT, "motor slot {slot} out of range");
    assert!(magnitude <= MAX_MAGNITUDE, "motor magnitude {magnitude} out of range");
    (slot << SLOT_SHIFT) | ((negative as u8) << SIGN_SHIFT) | magnitude
}

/// Unpack a motor frame into (slot, negative, magnitude).
pub fn unpack_motor(byte: u8) -> (u8, bool, u8) {
    (
        byte >> SLOT_SHIFT,
        (byte >> SIGN_SHIFT) & 1 == 1,
        byte & MAGNITUDE_MASK,
    )
}

/// Pack an arm frame. Axis values are -1, 0 or 1. Panics on anything else.
pub fn pack_arm(mode: u8, yaw: i8, pitch: i8, extend: i8) -> u8 {
    assert!(mode <= 2, "arm mode {mode} out of range");
    (mode << MODE_SHIFT)
        | (encode_axis(yaw) << YAW_SHIFT)
        | (encode_axis(pitch) << PITCH_SHIFT)
        | encode_axis(extend)
}

/// Unpack an arm frame into (mode, yaw, pitch, extend).
///
/// Returns `None` for bytes no legal frame produces (mode 3, axis field 3).
pub fn unpack_arm(byte: u8) -> Option<(u8, i8, i8, i8)> {
    let mode = byte >> MODE_SHIFT;
    if mode > 2 {
        return None;
    }
    Some((
        mode,
        decode_axis((byte >> YAW_SHIFT) & AXIS_MASK)?,
        decode_axis((byte >> PITCH_SHIFT) & AXIS_MASK)?,
        decode_axis(byte & AXIS_MASK)?,
    ))
}

fn encode_axis(value: i8) -> u8 {
    match value {
        0 => 0,
        1 => 1,
        -1 => 2,
        _ => panic!("arm axis value {value} out of range"),
    }
}

fn decode_axis(field: u8) -> Option<i8> {
    match field {
        0 => Some(0),
        1 => Some(1),
        2 => Some(-1),
        _ => None,
    }
}

/// One motor command for the body microcontroller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorFrame {
    pub slot: u8,
    pub negative: bool,
    pub magnitude: u8,
}

impl MotorFrame {
    /// Quantize a speed in [-1, 1] onto the 5-bit magnitude.
    pub fn from_speed(slot: u8, speed: f32) -> Self {
        let clamped = speed.clamp(-1.0, 1.0);
        let magnitude = (clamped.abs() * MAX_MAGNITUDE as f32) as u8;
        // Negative zero on slot 3 would be the identify frame
        Self {
            slot,
            negative: clamped < 0.0 && magnitude > 0,
            magnitude,
        }
    }

    pub fn stop(slot: u8) -> Self {
        Self {
            slot,
            negative: false,
            magnitude: 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        pack_motor(self.slot, self.negative, self.magnitude)
    }

    pub fn from_byte(byte: u8) -> Self {
        let (slot, negative, magnitude) = unpack_motor(byte);
        Self {
            slot,
            negative,
            magnitude,
        }
    }

    /// True for the reserved identification request.
    pub fn is_identify_request(self) -> bool {
        self.slot == MAX_SLOT && self.negative && self.magnitude == 0
    }
}

/// Direction for one arm axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Retract,
    #[default]
    Hold,
    Advance,
}

impl Axis {
    pub fn as_i8(self) -> i8 {
        match self {
            Axis::Retract => -1,
            Axis::Hold => 0,
            Axis::Advance => 1,
        }
    }

    pub fn from_i8(value: i8) -> Self {
        match value.signum() {
            -1 => Axis::Retract,
            0 => Axis::Hold,
            _ => Axis::Advance,
        }
    }

    /// Map an analog or d-pad reading onto a direction.
    pub fn from_input(value: f32) -> Self {
        if value > 0.5 {
            Axis::Advance
        } else if value < -0.5 {
            Axis::Retract
        } else {
            Axis::Hold
        }
    }
}

/// Arm operating mode carried in the frame's top two bits
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmMode {
    #[default]
    Hold = 0,
    GoHome = 1,
    Reset = 2,
}

impl ArmMode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ArmMode::Hold),
            1 => Some(ArmMode::GoHome),
            2 => Some(ArmMode::Reset),
            _ => None,
        }
    }
}

/// One arm command for the arm microcontroller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArmFrame {
    pub mode: ArmMode,
    pub yaw: Axis,
    pub pitch: Axis,
    pub extend: Axis,
}

impl ArmFrame {
    pub fn to_byte(self) -> u8 {
        pack_arm(
            self.mode as u8,
            self.yaw.as_i8(),
            self.pitch.as_i8(),
            self.extend.as_i8(),
        )
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        let (mode, yaw, pitch, extend) = unpack_arm(byte)?;
        Some(Self {
            mode: ArmMode::from_u8(mode)?,
            yaw: Axis::from_i8(yaw),
            pitch: Axis::from_i8(pitch),
            extend: Axis::from_i8(extend),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reverse_half_speed_on_slot_one() {
        assert_eq!(pack_motor(1, true, 16), 0x70);
        assert_eq!(unpack_motor(0x70), (1, true, 16));
    }

    #[test]
    fn test_identify_frame() {
        assert_eq!(IDENTIFY_FRAME, pack_motor(3, true, 0));
        assert!(MotorFrame::from_byte(IDENTIFY_FRAME).is_identify_request());
        assert!(!MotorFrame::stop(3).is_identify_request());
    }

    #[test]
    fn test_speed_quantization() {
        assert_eq!(MotorFrame::from_speed(0, 1.0).magnitude, 31);
        assert_eq!(MotorFrame::from_speed(0, 2.0).magnitude, 31);
        let reverse = MotorFrame::from_speed(2, -0.5);
        assert!(reverse.negative);
        assert_eq!(reverse.magnitude, 15);
        assert_eq!(MotorFrame::from_speed(1, 0.0).to_byte(), 0x40);
    }

    #[test]
    fn test_tiny_reverse_speed_is_plain_stop() {
        let frame = MotorFrame::from_speed(3, -0.01);
        assert_eq!(frame, MotorFrame::stop(3));
        assert_ne!(frame.to_byte(), IDENTIFY_FRAME);
    }

    #[test]
    fn test_arm_axis_remap() {
        // mode=1, yaw=-1, pitch=+1, extend=0
        assert_eq!(pack_arm(1, -1, 1, 0), 0b01_10_01_00);
        assert_eq!(unpack_arm(0b01_10_01_00), Some((1, -1, 1, 0)));
    }

    #[test]
    fn test_arm_rejects_illegal_bytes() {
        assert_eq!(unpack_arm(0b11_00_00_00), None);
        assert_eq!(unpack_arm(0b00_11_00_00), None);
        assert_eq!(ArmFrame::from_byte(0xFF), None);
    }

    #[test]
    #[should_panic]
    fn test_slot_out_of_range_panics() {
        pack_motor(4, false, 0);
    }

    #[test]
    #[should_panic]
    fn test_magnitude_out_of_range_panics() {
        pack_motor(0, false, 32);
    }

    #[test]
    #[should_panic]
    fn test_axis_out_of_range_panics() {
        pack_arm(0, 2, 0, 0);
    }

    proptest! {
        #[test]
        fn driving_never_sends_identify_frame(speed in -2.0f32..2.0) {
            prop_assert_ne!(MotorFrame::from_speed(3, speed).to_byte(), IDENTIFY_FRAME);
        }

        #[test]
        fn motor_frame_round_trips(slot in 0u8..=3, negative: bool, magnitude in 0u8..=31) {
            let byte = pack_motor(slot, negative, magnitude);
            prop_assert_eq!(unpack_motor(byte), (slot, negative, magnitude));
        }

        #[test]
        fn arm_frame_round_trips(
            mode in 0u8..=2,
            yaw in -1i8..=1,
            pitch in -1i8..=1,
            extend in -1i8..=1,
        ) {
            let byte = pack_arm(mode, yaw, pitch, extend);
            prop_assert_eq!(unpack_arm(byte), Some((mode, yaw, pitch, extend)));
        }
    }
}
