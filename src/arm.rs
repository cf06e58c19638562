// Servo arm: extend, pitch and yaw joints on one servo bus
//
// The arm advances one small step per control cycle so the loop never
// blocks on a servo. Homing moves the extend joint first and the other
// joints once it has stopped; a reset powers the servos down for a moment.

use serialport::SerialPort;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::codec::{ArmFrame, ArmMode, Axis};
use crate::config::{ARM_RESET_HOLD, ARM_STEP_DEG};
use crate::dynamixel::{Family, Probe, Result, Servo, ServoBus};
use crate::link::Port;
use crate::messages::ArmTelemetry;

/// Torque limit with the servos powered up
const FULL_TORQUE: u16 = 1023;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointRole {
    Extend,
    Pitch,
    Yaw,
}

/// How one joint is wired and driven
#[derive(Debug, Clone, PartialEq)]
pub struct JointConfig {
    pub role: JointRole,
    pub id: u8,
    pub family: Family,
    pub name: String,
    /// Home position in degrees
    pub home: f32,
    /// Travel limits in degrees, clockwise first; ignored in multiturn mode
    pub limits: (f32, f32),
    pub speed: u16,
    /// Degrees moved per cycle while an axis is held
    pub step: f32,
    pub multiturn: bool,
}

/// The arm as built: AX-12 extend, MX-28 pitch, multiturn MX-28 yaw.
pub fn default_joints() -> Vec<JointConfig> {
    vec![
        JointConfig {
            role: JointRole::Extend,
            id: 0,
            family: Family::Ax12,
            name: "extend".into(),
            home: 300.0,
            limits: (100.0, 300.0),
            speed: 100,
            step: ARM_STEP_DEG,
            multiturn: false,
        },
        JointConfig {
            role: JointRole::Pitch,
            id: 1,
            family: Family::Mx28,
            name: "pitch".into(),
            home: 334.0,
            limits: (172.0, 334.0),
            speed: 200,
            step: ARM_STEP_DEG,
            multiturn: false,
        },
        JointConfig {
            role: JointRole::Yaw,
            id: 2,
            family: Family::Mx28,
            name: "yaw".into(),
            home: 0.0,
            limits: (0.0, 360.0),
            speed: 200,
            step: ARM_STEP_DEG,
            multiturn: true,
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingStage {
    Extend,
    Joints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    /// Attached with the servos powered down
    Idle,
    Holding,
    Homing(HomingStage),
    Resetting { since: Instant },
    Shutdown,
}

struct Joint<P: Port> {
    servo: Servo<P>,
    config: JointConfig,
}

impl<P: Port> Joint<P> {
    fn axis(&self, frame: &ArmFrame) -> Axis {
        match self.config.role {
            JointRole::Extend => frame.extend,
            JointRole::Pitch => frame.pitch,
            JointRole::Yaw => frame.yaw,
        }
    }

    fn nudge(&self, axis: Axis) -> Result<()> {
        if axis == Axis::Hold {
            return Ok(());
        }
        let mut goal = self.servo.goal()? + axis.as_i8() as f32 * self.config.step;
        if !self.config.multiturn {
            let (low, high) = self.config.limits;
            goal = goal.clamp(low, high);
        }
        self.servo.set_goal(goal)
    }

    fn go_home(&self) -> Result<()> {
        debug!("{}: homing to {}", self.config.name, self.config.home);
        self.servo.set_goal(self.config.home)
    }
}

pub struct Arm<P: Port = Box<dyn SerialPort>> {
    joints: Vec<Joint<P>>,
    state: ArmState,
    reset_hold: Duration,
}

impl<P: Port> Arm<P> {
    /// Open and configure every joint found on `bus`.
    ///
    /// Joints that do not answer are skipped with a warning; any other
    /// failure aborts.
    pub fn attach(bus: &Rc<ServoBus<P>>, configs: Vec<JointConfig>) -> Result<Self> {
        let mut joints = Vec::with_capacity(configs.len());
        for config in configs {
            match bus.probe(config.id, config.family, &config.name) {
                Probe::Found(servo) => {
                    servo.set_torque_limit(0)?;
                    servo.set_moving_speed(config.speed)?;
                    if config.multiturn {
                        servo.engage_multiturn()?;
                    } else {
                        servo.set_limits(Some(config.limits.0), Some(config.limits.1))?;
                    }
                    info!("Arm joint {} ready", servo);
                    joints.push(Joint { servo, config });
                }
                Probe::Absent { id } => {
                    warn!("Arm joint {} (id {}) is not responding", config.name, id);
                }
                Probe::Failed(e) => return Err(e),
            }
        }
        Ok(Self {
            joints,
            state: ArmState::Idle,
            reset_hold: ARM_RESET_HOLD,
        })
    }

    pub fn with_reset_hold(mut self, hold: Duration) -> Self {
        self.reset_hold = hold;
        self
    }

    pub fn state(&self) -> ArmState {
        self.state
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    /// Advance the arm by one control cycle.
    pub fn step(&mut self, frame: &ArmFrame, now: Instant) -> Result<()> {
        match self.state {
            ArmState::Shutdown => return Ok(()),
            ArmState::Resetting { .. } => {}
            _ => match frame.mode {
                ArmMode::Reset => {
                    info!("Arm reset: powering down");
                    self.power_down()?;
                    self.state = ArmState::Resetting { since: now };
                    return Ok(());
                }
                ArmMode::GoHome if !matches!(self.state, ArmState::Homing(_)) => {
                    info!("Arm going home");
                    self.power_up()?;
                    self.start_homing()?;
                    return Ok(());
                }
                _ => {}
            },
        }

        match self.state {
            ArmState::Resetting { since } => {
                if now.saturating_duration_since(since) >= self.reset_hold {
                    info!("Arm reset: powering up");
                    self.power_up()?;
                    self.state = ArmState::Holding;
                }
            }
            ArmState::Homing(HomingStage::Extend) => {
                if !self.role_moving(Some(JointRole::Extend))? {
                    for joint in self.joints.iter().filter(|j| j.config.role != JointRole::Extend) {
                        joint.go_home()?;
                    }
                    self.state = ArmState::Homing(HomingStage::Joints);
                }
            }
            ArmState::Homing(HomingStage::Joints) => {
                if !self.role_moving(None)? {
                    info!("Arm is home");
                    self.state = ArmState::Holding;
                }
            }
            ArmState::Idle | ArmState::Holding => {
                for joint in &self.joints {
                    joint.nudge(joint.axis(frame))?;
                }
            }
            ArmState::Shutdown => {}
        }
        Ok(())
    }

    fn start_homing(&mut self) -> Result<()> {
        match self.joint(JointRole::Extend) {
            Some(extend) => {
                extend.go_home()?;
                self.state = ArmState::Homing(HomingStage::Extend);
            }
            None => {
                for joint in &self.joints {
                    joint.go_home()?;
                }
                self.state = ArmState::Homing(HomingStage::Joints);
            }
        }
        Ok(())
    }

    fn joint(&self, role: JointRole) -> Option<&Joint<P>> {
        self.joints.iter().find(|j| j.config.role == role)
    }

    /// Whether any joint (or the joint with `role`) is still moving
    fn role_moving(&self, role: Option<JointRole>) -> Result<bool> {
        for joint in &self.joints {
            if role.is_some_and(|r| r != joint.config.role) {
                continue;
            }
            if joint.servo.is_moving()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn is_moving(&self) -> Result<bool> {
        self.role_moving(None)
    }

    /// Freeze every joint where it stands.
    ///
    /// Tries every joint even if one fails, then reports the first error.
    pub fn halt(&mut self) -> Result<()> {
        let mut first_error = None;
        for joint in &self.joints {
            let held = joint
                .servo
                .position_raw()
                .and_then(|position| joint.servo.set_goal_raw(position));
            if let Err(e) = held {
                warn!("Cannot hold {}: {}", joint.config.name, e);
                first_error.get_or_insert(e);
            }
        }
        if matches!(self.state, ArmState::Homing(_)) {
            self.state = ArmState::Holding;
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Power the servos down for good.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == ArmState::Shutdown {
            return Ok(());
        }
        info!("Shutting down arm");
        let result = self.power_down();
        self.state = ArmState::Shutdown;
        result
    }

    fn power_up(&self) -> Result<()> {
        for joint in &self.joints {
            joint.servo.set_torque_limit(FULL_TORQUE)?;
        }
        Ok(())
    }

    fn power_down(&self) -> Result<()> {
        let mut first_error = None;
        for joint in &self.joints {
            if let Err(e) = joint.servo.set_torque_limit(0) {
                warn!("Cannot power down {}: {}", joint.config.name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Joint positions and servo readings; readings that fail are left empty.
    pub fn telemetry(&self) -> ArmTelemetry {
        let mut telemetry = ArmTelemetry::default();
        for (i, role) in [JointRole::Extend, JointRole::Pitch, JointRole::Yaw]
            .into_iter()
            .enumerate()
        {
            let Some(joint) = self.joint(role) else {
                continue;
            };
            telemetry.positions[i] = joint.servo.position().ok();
            telemetry.servo_vii[i] = match (role, joint.servo.family()) {
                (JointRole::Extend, _) | (_, Family::Ax12) => joint.servo.voltage().ok(),
                _ => joint.servo.current_ma().ok().map(|ma| ma as f32),
            };
        }
        telemetry
    }
}
