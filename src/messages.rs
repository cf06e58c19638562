// Message types exchanged with the operator station

use serde::{Deserialize, Serialize};

/// Analog stick or d-pad position, each axis in [-1, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Stick {
    pub x: f32,
    pub y: f32,
}

/// Buttons the vehicle reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Buttons {
    pub l1: bool,
    pub l2: bool,
    pub r1: bool,
    pub r2: bool,
    pub l3: bool,
    pub r3: bool,
    pub circle: bool,
    pub start: bool,
    pub select: bool,
}

// Controller state from opstn -> vehicle, one per "commands" request
// Missing fields default to released/centred so older stations still parse
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorInput {
    pub left_stick: Stick,
    pub right_stick: Stick,
    pub dpad: Stick,
    pub buttons: Buttons,
}

/// Speeds for the four body motors, each in [-1, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotorCommands {
    pub left_wheel: f32,
    pub right_wheel: f32,
    pub left_flipper: f32,
    pub right_flipper: f32,
}

impl MotorCommands {
    /// Speeds in drivetrain slot order
    pub fn as_array(&self) -> [f32; 4] {
        [
            self.left_wheel,
            self.right_wheel,
            self.left_flipper,
            self.right_flipper,
        ]
    }
}

/// Command link status published with telemetry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    Connected,
    TimedOut,
}

/// Current and voltage from one power monitor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    /// Amperes
    pub current: f32,
    /// Volts
    pub voltage: f32,
}

/// Roll, pitch and yaw in radians
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// Number of values in one arm controller record
pub const ARM_RECORD_LEN: usize = 39;

/// Arm state: joint positions, servo electrical readings, thermal arrays, CO2
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArmTelemetry {
    /// Extend, pitch and yaw joint positions
    pub positions: [Option<f32>; 3],
    /// Extend servo voltage (V), pitch and yaw servo current (mA)
    pub servo_vii: [Option<f32>; 3],
    /// Left and right 4x4 thermal sensors, °C
    pub thermal: Option<[Vec<f32>; 2]>,
    /// CO2 concentration in ppm
    pub co2: Option<f32>,
}

impl ArmTelemetry {
    /// Parse the arm controller's whitespace-separated record.
    ///
    /// Returns `None` unless there are exactly 39 numbers. A value of -1
    /// marks a missing position or servo reading.
    pub fn from_fields(fields: &[String]) -> Option<Self> {
        if fields.len() != ARM_RECORD_LEN {
            return None;
        }
        let values: Vec<f32> = fields
            .iter()
            .map(|f| f.parse::<f32>())
            .collect::<Result<_, _>>()
            .ok()?;

        let present = |v: f32| if v == -1.0 { None } else { Some(v) };
        Some(Self {
            positions: [present(values[0]), present(values[1]), present(values[2])],
            servo_vii: [present(values[3]), present(values[4]), present(values[5])],
            thermal: Some([values[6..22].to_vec(), values[22..38].to_vec()]),
            co2: Some(values[38]),
        })
    }
}

// Telemetry from vehicle -> opstn, one datagram per cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub health: LinkHealth,
    /// Left and right flipper potentiometers, fraction of travel
    pub flipper_positions: [Option<f32>; 2],
    /// Left wheel, right wheel, left flipper, right flipper
    pub currents: Vec<Option<PowerReading>>,
    /// Front and rear
    pub imus: Vec<Option<Orientation>>,
    pub arm: ArmTelemetry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_input_defaults_missing_fields() {
        let input: OperatorInput =
            serde_json::from_str(r#"{"left_stick": {"x": 0.5, "y": -1.0}, "buttons": {"l3": true}}"#)
                .unwrap();
        assert_eq!(input.left_stick, Stick { x: 0.5, y: -1.0 });
        assert_eq!(input.dpad, Stick::default());
        assert!(input.buttons.l3);
        assert!(!input.buttons.start);
    }

    #[test]
    fn test_arm_record_parsing() {
        let mut fields: Vec<String> = vec!["-1".into(), "120.5".into(), "10".into()];
        fields.extend(["12.1", "-1", "300"].map(String::from));
        fields.extend((0..32).map(|i| format!("{}.5", 20 + i % 4)));
        fields.push("415".into());

        let arm = ArmTelemetry::from_fields(&fields).unwrap();
        assert_eq!(arm.positions, [None, Some(120.5), Some(10.0)]);
        assert_eq!(arm.servo_vii, [Some(12.1), None, Some(300.0)]);
        let thermal = arm.thermal.unwrap();
        assert_eq!(thermal[0].len(), 16);
        assert_eq!(thermal[1][0], 20.5);
        assert_eq!(arm.co2, Some(415.0));
    }

    #[test]
    fn test_arm_record_rejects_bad_input() {
        let short: Vec<String> = vec!["1".into(); 38];
        assert!(ArmTelemetry::from_fields(&short).is_none());

        let mut garbled: Vec<String> = vec!["1".into(); 39];
        garbled[7] = "x".into();
        assert!(ArmTelemetry::from_fields(&garbled).is_none());
    }

    #[test]
    fn test_health_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&LinkHealth::TimedOut).unwrap(),
            r#""timed_out""#
        );
    }
}
