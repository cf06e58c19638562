// One handle per physical servo
//
// Nothing is cached: every getter and setter is a live bus transaction.

use serialport::SerialPort;
use std::fmt;
use std::rc::Rc;
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::bus::ServoBus;
use super::packet::{read_params, write_params, Instruction};
use super::register::{Family, Register, RegisterSpec};
use super::{DynamixelError, Result};
use crate::link::Port;

/// Factory-default id after a reset
const FACTORY_ID: u8 = 1;

/// Time the servo needs to come back after a reset
const RESET_SETTLE: Duration = Duration::from_millis(250);

/// Top speed at full moving-speed scale
const MAX_RPM: f32 = 114.0;

/// Direction bit of present speed and present load
const DIRECTION_BIT: u16 = 1 << 10;

pub struct Servo<P: Port = Box<dyn SerialPort>> {
    id: u8,
    family: Family,
    name: String,
    bus: Rc<ServoBus<P>>,
}

impl<P: Port> Servo<P> {
    /// Open a handle after confirming the servo's model number.
    ///
    /// The id is checked against the registry before any bus traffic, and
    /// only registered once the servo has answered, so a failed open leaves
    /// the registry as it was.
    pub fn open(bus: &Rc<ServoBus<P>>, id: u8, family: Family, name: &str) -> Result<Self> {
        bus.check_available(id)?;

        let spec = family
            .spec(Register::ModelNumber)
            .ok_or(DynamixelError::UnsupportedRegister {
                family,
                register: Register::ModelNumber,
            })?;
        let model = bus
            .transact(id, Instruction::Read, &read_params(spec.address, spec.width))?
            .verify()?
            .value()?;
        if model != family.model_number() {
            return Err(DynamixelError::WrongModel {
                id,
                expected: family,
                found: model,
            });
        }

        bus.register(id)?;
        info!("Opened {} {} with id {} on {}", family, name, id, bus.label());
        Ok(Self {
            id,
            family,
            name: name.to_string(),
            bus: Rc::clone(bus),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self, register: Register) -> Result<RegisterSpec> {
        self.family
            .spec(register)
            .ok_or(DynamixelError::UnsupportedRegister {
                family: self.family,
                register,
            })
    }

    /// Read a register's raw value.
    pub fn read(&self, register: Register) -> Result<u16> {
        let spec = self.spec(register)?;
        self.bus
            .transact(self.id, Instruction::Read, &read_params(spec.address, spec.width))?
            .verify()?
            .value()
    }

    /// Write a register after checking it is writable and `value` is legal.
    pub fn write(&self, register: Register, value: i32) -> Result<()> {
        let spec = self.checked(register, value)?;
        debug!("{}: {:?} <- {}", self.name, register, value);
        self.bus
            .transact(
                self.id,
                Instruction::Write,
                &write_params(spec.address, spec.width, value),
            )?
            .verify()?;
        Ok(())
    }

    /// Stage a register write that takes effect on the next bus `action`.
    pub fn stage(&self, register: Register, value: i32) -> Result<()> {
        let spec = self.checked(register, value)?;
        debug!("{}: {:?} <- {} (staged)", self.name, register, value);
        self.bus
            .transact(
                self.id,
                Instruction::RegWrite,
                &write_params(spec.address, spec.width, value),
            )?
            .verify()?;
        Ok(())
    }

    fn checked(&self, register: Register, value: i32) -> Result<RegisterSpec> {
        let spec = self.spec(register)?;
        if !spec.writable {
            return Err(DynamixelError::ReadOnly { register });
        }
        if !spec.accepts(value) {
            return Err(DynamixelError::OutOfRange {
                register,
                value,
                min: spec.min,
                max: spec.max,
            });
        }
        Ok(spec)
    }

    pub fn model_number(&self) -> Result<u16> {
        self.read(Register::ModelNumber)
    }

    pub fn firmware_version(&self) -> Result<u16> {
        self.read(Register::FirmwareVersion)
    }

    /// Change the servo's id: hardware first, then the registry.
    pub fn set_id(&mut self, new_id: u8) -> Result<()> {
        self.bus.check_available(new_id)?;
        let spec = self.checked(Register::Id, new_id as i32)?;
        self.bus
            .transact_from(
                self.id,
                new_id,
                Instruction::Write,
                &write_params(spec.address, spec.width, new_id as i32),
            )?
            .verify()?;
        self.bus.rename(self.id, new_id);
        info!("{}: id {} -> {}", self.name, self.id, new_id);
        self.id = new_id;
        Ok(())
    }

    /// Restore factory settings, then give the servo back its id.
    pub fn reset(&mut self) -> Result<()> {
        if self.id != FACTORY_ID && self.bus.is_registered(FACTORY_ID) {
            return Err(DynamixelError::ResetConflict(self.id));
        }
        warn!("{}: factory reset", self.name);
        self.bus.transact(self.id, Instruction::Reset, &[])?.verify()?;
        sleep(RESET_SETTLE);

        let current = self.id;
        if current == FACTORY_ID {
            return Ok(());
        }
        self.bus.rename(current, FACTORY_ID);
        self.id = FACTORY_ID;
        self.set_id(current)
    }

    /// Baud rate in bits per second
    pub fn baudrate(&self) -> Result<u32> {
        Ok(2_000_000 / (self.read(Register::BaudRate)? as u32 + 1))
    }

    pub fn set_baudrate(&self, baudrate: u32) -> Result<()> {
        let divisor = (2_000_000 / baudrate.max(1)) as i32 - 1;
        self.write(Register::BaudRate, divisor)
    }

    /// Status return delay in microseconds
    pub fn return_delay_us(&self) -> Result<u32> {
        Ok(2 * self.read(Register::ReturnDelay)? as u32)
    }

    pub fn set_return_delay_us(&self, micros: u32) -> Result<()> {
        self.write(Register::ReturnDelay, (micros / 2) as i32)
    }

    fn ticks_to_degrees(&self, ticks: i32) -> f32 {
        ticks as f32 * self.family.degrees_per_tick()
    }

    fn degrees_to_ticks(&self, degrees: f32) -> i32 {
        (degrees / self.family.degrees_per_tick()).round() as i32
    }

    pub fn cw_limit_raw(&self) -> Result<u16> {
        self.read(Register::CwLimit)
    }

    pub fn set_cw_limit_raw(&self, limit: u16) -> Result<()> {
        self.write(Register::CwLimit, limit as i32)
    }

    pub fn ccw_limit_raw(&self) -> Result<u16> {
        self.read(Register::CcwLimit)
    }

    pub fn set_ccw_limit_raw(&self, limit: u16) -> Result<()> {
        self.write(Register::CcwLimit, limit as i32)
    }

    pub fn cw_limit(&self) -> Result<f32> {
        Ok(self.ticks_to_degrees(self.cw_limit_raw()? as i32))
    }

    pub fn set_cw_limit(&self, degrees: f32) -> Result<()> {
        self.write(Register::CwLimit, self.degrees_to_ticks(degrees))
    }

    pub fn ccw_limit(&self) -> Result<f32> {
        Ok(self.ticks_to_degrees(self.ccw_limit_raw()? as i32))
    }

    pub fn set_ccw_limit(&self, degrees: f32) -> Result<()> {
        self.write(Register::CcwLimit, self.degrees_to_ticks(degrees))
    }

    /// Travel limits in degrees, clockwise first
    pub fn limits(&self) -> Result<(f32, f32)> {
        Ok((self.cw_limit()?, self.ccw_limit()?))
    }

    /// Set either or both travel limits in degrees.
    pub fn set_limits(&self, cw: Option<f32>, ccw: Option<f32>) -> Result<()> {
        if let Some(cw) = cw {
            self.set_cw_limit(cw)?;
        }
        if let Some(ccw) = ccw {
            self.set_ccw_limit(ccw)?;
        }
        Ok(())
    }

    /// Wheel mode: both limits zero.
    pub fn is_continuous_rotation(&self) -> Result<bool> {
        Ok(self.cw_limit_raw()? == 0 && self.ccw_limit_raw()? == 0)
    }

    pub fn engage_continuous_rotation(&self) -> Result<()> {
        self.set_cw_limit_raw(0)?;
        self.set_ccw_limit_raw(0)
    }

    /// Multiturn mode: both limits at the family's top tick.
    pub fn is_multiturn(&self) -> Result<bool> {
        if !self.family.supports_multiturn() {
            return Ok(false);
        }
        let max = self.family.max_position();
        Ok(self.cw_limit_raw()? == max && self.ccw_limit_raw()? == max)
    }

    pub fn engage_multiturn(&self) -> Result<()> {
        if !self.family.supports_multiturn() {
            return Err(DynamixelError::MultiturnUnsupported {
                family: self.family,
            });
        }
        let max = self.family.max_position();
        self.set_cw_limit_raw(max)?;
        self.set_ccw_limit_raw(max)
    }

    pub fn max_temperature(&self) -> Result<u16> {
        self.read(Register::MaxTemperature)
    }

    pub fn set_max_temperature(&self, celsius: u16) -> Result<()> {
        self.write(Register::MaxTemperature, celsius as i32)
    }

    /// Lowest operating voltage in volts
    pub fn min_voltage(&self) -> Result<f32> {
        Ok(self.read(Register::MinVoltage)? as f32 / 10.0)
    }

    pub fn set_min_voltage(&self, volts: f32) -> Result<()> {
        self.write(Register::MinVoltage, (volts * 10.0).round() as i32)
    }

    /// Highest operating voltage in volts
    pub fn max_voltage(&self) -> Result<f32> {
        Ok(self.read(Register::MaxVoltage)? as f32 / 10.0)
    }

    pub fn set_max_voltage(&self, volts: f32) -> Result<()> {
        self.write(Register::MaxVoltage, (volts * 10.0).round() as i32)
    }

    pub fn max_torque(&self) -> Result<u16> {
        self.read(Register::MaxTorque)
    }

    pub fn set_max_torque(&self, torque: u16) -> Result<()> {
        self.write(Register::MaxTorque, torque as i32)
    }

    pub fn status_return_level(&self) -> Result<u16> {
        self.read(Register::StatusReturnLevel)
    }

    pub fn set_status_return_level(&self, level: u16) -> Result<()> {
        self.write(Register::StatusReturnLevel, level as i32)
    }

    pub fn alarm_led(&self) -> Result<u16> {
        self.read(Register::AlarmLed)
    }

    pub fn set_alarm_led(&self, mask: u16) -> Result<()> {
        self.write(Register::AlarmLed, mask as i32)
    }

    pub fn alarm_shutdown(&self) -> Result<u16> {
        self.read(Register::AlarmShutdown)
    }

    pub fn set_alarm_shutdown(&self, mask: u16) -> Result<()> {
        self.write(Register::AlarmShutdown, mask as i32)
    }

    pub fn torque_enabled(&self) -> Result<bool> {
        Ok(self.read(Register::TorqueEnable)? != 0)
    }

    pub fn set_torque_enabled(&self, enabled: bool) -> Result<()> {
        self.write(Register::TorqueEnable, enabled as i32)
    }

    pub fn led(&self) -> Result<bool> {
        Ok(self.read(Register::Led)? != 0)
    }

    pub fn set_led(&self, on: bool) -> Result<()> {
        self.write(Register::Led, on as i32)
    }

    /// Positions past the multiturn maximum are negative turns.
    fn signed_position(&self, raw: u16) -> i32 {
        let raw = raw as i32;
        let limit = self.family.multiturn_goal_limit();
        if limit > 0 && raw > limit {
            raw - 0x1_0000
        } else {
            raw
        }
    }

    pub fn goal_raw(&self) -> Result<i32> {
        Ok(self.signed_position(self.read(Register::GoalPosition)?))
    }

    /// Set the goal in ticks. Outside multiturn mode the goal must lie
    /// within one turn.
    pub fn set_goal_raw(&self, goal: i32) -> Result<()> {
        let max = self.family.max_position() as i32;
        if !(0..=max).contains(&goal) && !self.is_multiturn()? {
            return Err(DynamixelError::OutOfRange {
                register: Register::GoalPosition,
                value: goal,
                min: 0,
                max,
            });
        }
        self.write(Register::GoalPosition, goal)
    }

    /// Goal position in degrees
    pub fn goal(&self) -> Result<f32> {
        Ok(self.ticks_to_degrees(self.goal_raw()?))
    }

    pub fn set_goal(&self, degrees: f32) -> Result<()> {
        self.set_goal_raw(self.degrees_to_ticks(degrees))
    }

    pub fn moving_speed(&self) -> Result<u16> {
        self.read(Register::MovingSpeed)
    }

    pub fn set_moving_speed(&self, speed: u16) -> Result<()> {
        self.write(Register::MovingSpeed, speed as i32)
    }

    pub fn moving_speed_rpm(&self) -> Result<f32> {
        Ok(self.moving_speed()? as f32 * MAX_RPM / 1023.0)
    }

    pub fn set_moving_speed_rpm(&self, rpm: f32) -> Result<()> {
        self.write(Register::MovingSpeed, (rpm * 1023.0 / MAX_RPM).round() as i32)
    }

    pub fn torque_limit(&self) -> Result<u16> {
        self.read(Register::TorqueLimit)
    }

    pub fn set_torque_limit(&self, limit: u16) -> Result<()> {
        self.write(Register::TorqueLimit, limit as i32)
    }

    pub fn position_raw(&self) -> Result<i32> {
        Ok(self.signed_position(self.read(Register::PresentPosition)?))
    }

    /// Present position in degrees
    pub fn position(&self) -> Result<f32> {
        Ok(self.ticks_to_degrees(self.position_raw()?))
    }

    /// Present speed in rpm, signed by direction.
    pub fn speed_rpm(&self) -> Result<f32> {
        let raw = self.read(Register::PresentSpeed)?;
        let magnitude = (raw & 0x3FF) as f32 * MAX_RPM / 1023.0;
        Ok(if raw & DIRECTION_BIT != 0 {
            magnitude
        } else {
            -magnitude
        })
    }

    /// Present load, signed by direction (0..=1023 in magnitude).
    pub fn load(&self) -> Result<i32> {
        let raw = self.read(Register::PresentLoad)?;
        let magnitude = (raw & 0x3FF) as i32;
        Ok(if raw & DIRECTION_BIT != 0 {
            magnitude
        } else {
            -magnitude
        })
    }

    /// Present supply voltage in volts
    pub fn voltage(&self) -> Result<f32> {
        Ok(self.read(Register::PresentVoltage)? as f32 / 10.0)
    }

    /// Present internal temperature in °C
    pub fn temperature(&self) -> Result<u16> {
        self.read(Register::PresentTemperature)
    }

    pub fn is_moving(&self) -> Result<bool> {
        Ok(self.read(Register::Moving)? != 0)
    }

    /// Block until the servo reports it has stopped. No timeout.
    pub fn wait_until_stopped(&self) -> Result<()> {
        while self.is_moving()? {}
        Ok(())
    }

    pub fn lock(&self) -> Result<bool> {
        Ok(self.read(Register::Lock)? != 0)
    }

    pub fn set_lock(&self, locked: bool) -> Result<()> {
        self.write(Register::Lock, locked as i32)
    }

    pub fn punch(&self) -> Result<u16> {
        self.read(Register::Punch)
    }

    pub fn set_punch(&self, punch: u16) -> Result<()> {
        self.write(Register::Punch, punch as i32)
    }

    // AX-12

    pub fn calibration(&self) -> Result<(u16, u16)> {
        Ok((
            self.read(Register::DownCalibration)?,
            self.read(Register::UpCalibration)?,
        ))
    }

    /// Compliance margins, clockwise first
    pub fn compliance_margins(&self) -> Result<(u16, u16)> {
        Ok((
            self.read(Register::CwComplianceMargin)?,
            self.read(Register::CcwComplianceMargin)?,
        ))
    }

    pub fn set_compliance_margins(&self, cw: Option<u8>, ccw: Option<u8>) -> Result<()> {
        if let Some(cw) = cw {
            self.write(Register::CwComplianceMargin, cw as i32)?;
        }
        if let Some(ccw) = ccw {
            self.write(Register::CcwComplianceMargin, ccw as i32)?;
        }
        Ok(())
    }

    /// Compliance slopes, clockwise first
    pub fn compliance_slopes(&self) -> Result<(u16, u16)> {
        Ok((
            self.read(Register::CwComplianceSlope)?,
            self.read(Register::CcwComplianceSlope)?,
        ))
    }

    pub fn set_compliance_slopes(&self, cw: Option<u8>, ccw: Option<u8>) -> Result<()> {
        if let Some(cw) = cw {
            self.write(Register::CwComplianceSlope, cw as i32)?;
        }
        if let Some(ccw) = ccw {
            self.write(Register::CcwComplianceSlope, ccw as i32)?;
        }
        Ok(())
    }

    // MX-28

    pub fn multiturn_offset(&self) -> Result<i16> {
        Ok(self.read(Register::MultiturnOffset)? as i16)
    }

    pub fn set_multiturn_offset(&self, offset: i16) -> Result<()> {
        self.write(Register::MultiturnOffset, offset as i32)
    }

    pub fn resolution_divider(&self) -> Result<u16> {
        self.read(Register::ResolutionDivider)
    }

    pub fn set_resolution_divider(&self, divider: u8) -> Result<()> {
        self.write(Register::ResolutionDivider, divider as i32)
    }

    /// Position loop gains (P, I, D)
    pub fn gains(&self) -> Result<(u16, u16, u16)> {
        Ok((
            self.read(Register::PGain)?,
            self.read(Register::IGain)?,
            self.read(Register::DGain)?,
        ))
    }

    pub fn set_gains(&self, p: u8, i: u8, d: u8) -> Result<()> {
        self.write(Register::PGain, p as i32)?;
        self.write(Register::IGain, i as i32)?;
        self.write(Register::DGain, d as i32)
    }

    /// Present current draw in mA
    pub fn current_ma(&self) -> Result<u32> {
        Ok(self.read(Register::PresentCurrent)? as u32 * 10)
    }

    pub fn goal_acceleration(&self) -> Result<u16> {
        self.read(Register::GoalAcceleration)
    }

    pub fn set_goal_acceleration(&self, acceleration: u8) -> Result<()> {
        self.write(Register::GoalAcceleration, acceleration as i32)
    }
}

impl<P: Port> Drop for Servo<P> {
    fn drop(&mut self) {
        debug!("Releasing servo {} ({})", self.id, self.name);
        self.bus.release(self.id);
    }
}

impl<P: Port> fmt::Debug for Servo<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Servo")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("name", &self.name)
            .finish()
    }
}

impl<P: Port> fmt::Display for Servo<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (id {})", self.family, self.name, self.id)
    }
}
