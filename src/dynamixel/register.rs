// Control tables for the supported servo families
//
// Every register has an address, a width of 1 or 2 bytes, and the range a
// write may carry. Read-only registers reject writes.

use std::fmt;

/// Registers known to at least one family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    // EEPROM area
    ModelNumber,
    FirmwareVersion,
    Id,
    BaudRate,
    ReturnDelay,
    CwLimit,
    CcwLimit,
    MaxTemperature,
    MinVoltage,
    MaxVoltage,
    MaxTorque,
    StatusReturnLevel,
    AlarmLed,
    AlarmShutdown,
    // AX-12 only
    DownCalibration,
    UpCalibration,
    // MX-28 only
    MultiturnOffset,
    ResolutionDivider,

    // RAM area
    TorqueEnable,
    Led,
    // AX-12 only
    CwComplianceMargin,
    CcwComplianceMargin,
    CwComplianceSlope,
    CcwComplianceSlope,
    // MX-28 only
    PGain,
    IGain,
    DGain,
    GoalPosition,
    MovingSpeed,
    TorqueLimit,
    PresentPosition,
    PresentSpeed,
    PresentLoad,
    PresentVoltage,
    PresentTemperature,
    RegisteredInstruction,
    Moving,
    Lock,
    Punch,
    // MX-28 only
    PresentCurrent,
    GoalAcceleration,
}

/// Where a register lives and what it accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec {
    pub address: u8,
    pub width: u8,
    pub min: i32,
    pub max: i32,
    pub writable: bool,
}

const fn rw(address: u8, width: u8, min: i32, max: i32) -> RegisterSpec {
    RegisterSpec {
        address,
        width,
        min,
        max,
        writable: true,
    }
}

const fn ro(address: u8, width: u8) -> RegisterSpec {
    RegisterSpec {
        address,
        width,
        min: 0,
        max: 0,
        writable: false,
    }
}

impl RegisterSpec {
    pub fn accepts(&self, value: i32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Supported servo families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ax12,
    Mx28,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::Ax12 => "AX-12",
            Family::Mx28 => "MX-28",
        })
    }
}

impl Family {
    /// Value of the model number register
    pub fn model_number(self) -> u16 {
        match self {
            Family::Ax12 => 12,
            Family::Mx28 => 29,
        }
    }

    /// Full travel of one revolution's worth of ticks, in degrees
    pub fn max_turn_angle(self) -> f32 {
        match self {
            Family::Ax12 => 300.0,
            Family::Mx28 => 360.0,
        }
    }

    /// Largest raw position tick
    pub fn max_position(self) -> u16 {
        match self {
            Family::Ax12 => 1023,
            Family::Mx28 => 4095,
        }
    }

    pub fn supports_multiturn(self) -> bool {
        matches!(self, Family::Mx28)
    }

    /// Largest goal magnitude accepted while in multiturn mode
    pub fn multiturn_goal_limit(self) -> i32 {
        match self {
            Family::Ax12 => 0,
            Family::Mx28 => 28665,
        }
    }

    pub fn degrees_per_tick(self) -> f32 {
        self.max_turn_angle() / self.max_position() as f32
    }

    /// Look up a register in this family's control table.
    pub fn spec(self, register: Register) -> Option<RegisterSpec> {
        use Register::*;

        let max_pos = self.max_position() as i32;
        let common = match register {
            ModelNumber => Some(ro(0x00, 2)),
            FirmwareVersion => Some(ro(0x02, 1)),
            Id => Some(rw(0x03, 1, 0, 253)),
            BaudRate => Some(rw(0x04, 1, 0, 254)),
            ReturnDelay => Some(rw(0x05, 1, 0, 254)),
            CwLimit => Some(rw(0x06, 2, 0, max_pos)),
            CcwLimit => Some(rw(0x08, 2, 0, max_pos)),
            MaxTemperature => Some(rw(0x0B, 1, 0, 150)),
            MinVoltage => Some(rw(0x0C, 1, 0, 250)),
            MaxVoltage => Some(rw(0x0D, 1, 0, 250)),
            MaxTorque => Some(rw(0x0E, 2, 0, 1023)),
            StatusReturnLevel => Some(rw(0x10, 1, 0, 2)),
            AlarmLed => Some(rw(0x11, 1, 0, 127)),
            AlarmShutdown => Some(rw(0x12, 1, 0, 127)),
            TorqueEnable => Some(rw(0x18, 1, 0, 1)),
            Led => Some(rw(0x19, 1, 0, 1)),
            GoalPosition => Some(rw(0x1E, 2, 0, max_pos)),
            MovingSpeed => Some(rw(0x20, 2, 0, 1023)),
            TorqueLimit => Some(rw(0x22, 2, 0, 1023)),
            PresentPosition => Some(ro(0x24, 2)),
            PresentSpeed => Some(ro(0x26, 2)),
            PresentLoad => Some(ro(0x28, 2)),
            PresentVoltage => Some(ro(0x2A, 1)),
            PresentTemperature => Some(ro(0x2B, 1)),
            RegisteredInstruction => Some(rw(0x2C, 1, 0, 1)),
            Moving => Some(ro(0x2E, 1)),
            Lock => Some(rw(0x2F, 1, 0, 1)),
            Punch => Some(rw(0x30, 2, 0, 1023)),
            _ => None,
        };
        if common.is_some() {
            return match (self, register) {
                // Multiturn goals may run negative and past one revolution
                (Family::Mx28, GoalPosition) => Some(rw(0x1E, 2, -28665, 28665)),
                _ => common,
            };
        }

        match self {
            Family::Ax12 => match register {
                DownCalibration => Some(ro(0x14, 2)),
                UpCalibration => Some(ro(0x16, 2)),
                CwComplianceMargin => Some(rw(0x1A, 1, 0, 254)),
                CcwComplianceMargin => Some(rw(0x1B, 1, 0, 254)),
                CwComplianceSlope => Some(rw(0x1C, 1, 0, 254)),
                CcwComplianceSlope => Some(rw(0x1D, 1, 0, 254)),
                _ => None,
            },
            Family::Mx28 => match register {
                MultiturnOffset => Some(rw(0x14, 2, -24576, 24576)),
                ResolutionDivider => Some(rw(0x16, 1, 1, 4)),
                PGain => Some(rw(0x1A, 1, 0, 254)),
                IGain => Some(rw(0x1B, 1, 0, 254)),
                DGain => Some(rw(0x1C, 1, 0, 254)),
                PresentCurrent => Some(ro(0x38, 2)),
                GoalAcceleration => Some(rw(0x49, 1, 0, 254)),
                _ => None,
            },
        }
    }
}
