// Control loop with fail-safe
// Each cycle asks the operator station for input, drives the motors, steps the
// arm and sends telemetry back. If a request times out or comes back garbled,
// every actuator is zeroed once and the loop keeps asking until the station
// answers again.

use serialport::SerialPort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::arm::{self, Arm};
use crate::channel::{ChannelError, CommandChannel, TcpCommandChannel, TelemetrySink, UdpTelemetry};
use crate::codec::ArmFrame;
use crate::config::{clamp_handshake_timeout, LoopConfig, RuntimeConfig};
use crate::dynamixel::ServoBus;
use crate::error::{Result, RuntimeError};
use crate::handshake::{self, ControllerLinks};
use crate::link::{Port, SerialLink};
use crate::messages::{ArmTelemetry, LinkHealth, MotorCommands, Telemetry};
use crate::motor::{clamp_flipper, Drivetrain};
use crate::sensors::SensorSuite;
use crate::teleop::Teleop;

/// Flipper potentiometer full scale
const POT_FULL_SCALE: f32 = 0xFFFF as f32;

/// What the loop remembers between cycles
#[derive(Debug, Clone)]
pub struct ControlCycleState {
    pub last_exchange: Option<Instant>,
    pub health: LinkHealth,
    pub teleop: Teleop,
}

impl Default for ControlCycleState {
    fn default() -> Self {
        Self {
            last_exchange: None,
            // A first failed request still zeroes everything
            health: LinkHealth::Connected,
            teleop: Teleop::default(),
        }
    }
}

pub struct ControlLoop<P: Port = Box<dyn SerialPort>> {
    config: LoopConfig,
    state: ControlCycleState,
    drivetrain: Drivetrain<SerialLink<P>>,
    arm_link: Option<SerialLink<P>>,
    arm: Option<Arm<P>>,
    sensors: SensorSuite,
    channel: Box<dyn CommandChannel>,
    telemetry: Box<dyn TelemetrySink>,
}

impl<P: Port> ControlLoop<P> {
    pub fn new(
        config: LoopConfig,
        links: ControllerLinks<P>,
        channel: Box<dyn CommandChannel>,
        telemetry: Box<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            state: ControlCycleState::default(),
            drivetrain: Drivetrain::with_default_motors(links.body),
            arm_link: links.arm,
            arm: None,
            sensors: SensorSuite::new(),
            channel,
            telemetry,
        }
    }

    pub fn attach_arm(&mut self, arm: Arm<P>) {
        info!("Servo arm attached with {} joint(s)", arm.joint_count());
        self.arm = Some(arm);
    }

    pub fn sensors_mut(&mut self) -> &mut SensorSuite {
        &mut self.sensors
    }

    pub fn state(&self) -> &ControlCycleState {
        &self.state
    }

    /// Run one cycle. Only a closed operator connection is an error.
    pub fn step(&mut self, now: Instant) -> Result<()> {
        let input = match self.channel.request() {
            Ok(input) => input,
            Err(e) if e.is_fatal() => {
                error!("Operator station turned off");
                return Err(RuntimeError::ChannelClosed);
            }
            Err(e) => {
                self.enter_failsafe(&e);
                return Ok(());
            }
        };

        if self.state.health == LinkHealth::TimedOut {
            match self.state.last_exchange {
                Some(last) => info!(
                    "Connection to operator station returned after {}ms",
                    now.saturating_duration_since(last).as_millis()
                ),
                None => info!("Connection to operator station returned"),
            }
        }
        self.state.health = LinkHealth::Connected;
        self.state.last_exchange = Some(now);

        let (commands, arm_frame) = self.state.teleop.decode(&input, now);
        let flippers = self.flipper_positions();
        self.drive(commands, flippers);
        self.command_arm(&arm_frame, now);

        let telemetry = Telemetry {
            health: self.state.health,
            flipper_positions: flippers,
            currents: self.sensors.read_currents(),
            imus: self.sensors.read_imus(),
            arm: self.arm_telemetry(),
        };
        if let Err(e) = self.telemetry.send(&telemetry) {
            debug!("Telemetry not sent: {}", e);
        }
        Ok(())
    }

    fn enter_failsafe(&mut self, cause: &ChannelError) {
        if self.state.health == LinkHealth::TimedOut {
            return;
        }
        warn!("Lost connection to operator station: {}", cause);
        self.zero_all();
        self.state.health = LinkHealth::TimedOut;
    }

    /// Stop every motor and freeze the arm.
    fn zero_all(&mut self) {
        self.drivetrain.stop_all();
        if let Some(link) = self.arm_link.as_mut() {
            link.write(&[ArmFrame::default().to_byte()]);
        }
        if let Some(arm) = self.arm.as_mut() {
            if let Err(e) = arm.halt() {
                warn!("Arm did not halt cleanly: {}", e);
            }
        }
    }

    /// Flipper potentiometers from the body controller's latest record.
    fn flipper_positions(&mut self) -> [Option<f32>; 2] {
        let fields = self
            .drivetrain
            .sink_mut()
            .read_latest_fields(self.config.link_read_timeout);
        let parsed: Option<Vec<u16>> = fields
            .iter()
            .take(2)
            .map(|f| u16::from_str_radix(f, 16).ok())
            .collect();
        match parsed.as_deref() {
            Some([left, right]) => [
                Some(*left as f32 / POT_FULL_SCALE),
                Some(*right as f32 / POT_FULL_SCALE),
            ],
            _ => {
                if !fields.is_empty() {
                    debug!("Bad flipper data: {:?}", fields);
                }
                [None, None]
            }
        }
    }

    fn drive(&mut self, commands: MotorCommands, flippers: [Option<f32>; 2]) {
        let limits = self.config.flipper_limits;
        let commands = MotorCommands {
            left_flipper: clamp_flipper(
                "left flipper",
                flippers[0],
                commands.left_flipper,
                self.config.left_flipper,
                limits,
            ),
            right_flipper: clamp_flipper(
                "right flipper",
                flippers[1],
                commands.right_flipper,
                self.config.right_flipper,
                limits,
            ),
            ..commands
        };
        self.drivetrain.drive(&commands.as_array());
    }

    fn command_arm(&mut self, frame: &ArmFrame, now: Instant) {
        if let Some(link) = self.arm_link.as_mut() {
            link.write(&[frame.to_byte()]);
        }
        if let Some(arm) = self.arm.as_mut() {
            if let Err(e) = arm.step(frame, now) {
                warn!("Arm step failed: {}", e);
            }
        }
    }

    fn arm_telemetry(&mut self) -> ArmTelemetry {
        if let Some(link) = self.arm_link.as_mut() {
            let fields = link.read_latest_fields(self.config.link_read_timeout);
            return ArmTelemetry::from_fields(&fields).unwrap_or_default();
        }
        self.arm.as_ref().map(Arm::telemetry).unwrap_or_default()
    }

    /// Cycle at the configured period until `shutdown` is set or the
    /// operator station goes away. Everything is zeroed on the way out.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        info!(
            "Control loop started: {}ms period",
            self.config.period.as_millis()
        );
        let result = loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested");
                break Ok(());
            }
            let started = Instant::now();
            if let Err(e) = self.step(started) {
                break Err(e);
            }
            if let Some(rest) = self.config.period.checked_sub(started.elapsed()) {
                sleep(rest);
            }
        };
        self.shutdown();
        result
    }

    /// Zero every actuator and power the arm down.
    pub fn shutdown(&mut self) {
        info!("Shutting down actuators");
        self.zero_all();
        if let Some(arm) = self.arm.as_mut() {
            if let Err(e) = arm.shutdown() {
                warn!("Arm did not shut down cleanly: {}", e);
            }
        }
    }
}

/// Bring the vehicle up and run it until `shutdown` is set.
pub fn run(config: RuntimeConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let channel = TcpCommandChannel::connect(config.operator, config.command_timeout)?;
    let telemetry = UdpTelemetry::new(config.telemetry_addr())?;

    let candidates = if config.serial_candidates.is_empty() {
        handshake::candidate_ports()
    } else {
        config.serial_candidates.clone()
    };
    let links = handshake::connect_controllers(
        &candidates,
        config.mbed_baudrate,
        clamp_handshake_timeout(config.handshake_timeout),
    )?;

    let mut control = ControlLoop::new(
        config.loop_config.clone(),
        links,
        Box::new(channel),
        Box::new(telemetry),
    );

    if let Some(port) = &config.servo_port {
        let attached = ServoBus::open_with_baudrate(port, config.servo_baudrate)
            .and_then(|bus| Arm::attach(&bus, arm::default_joints()));
        match attached {
            Ok(arm) => control.attach_arm(arm),
            Err(e) => {
                error!("Cannot bring up the servo arm: {}", e);
                control.shutdown();
                return Err(e.into());
            }
        }
    }

    control.run(&shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{unpack_motor, ArmMode};
    use crate::messages::{Buttons, OperatorInput, Stick};
    use crate::testing::{MockHandle, MockPort, SimBus};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;
    use std::time::Duration;

    struct ScriptedChannel {
        replies: VecDeque<std::result::Result<OperatorInput, ChannelError>>,
    }

    impl CommandChannel for ScriptedChannel {
        fn request(&mut self) -> std::result::Result<OperatorInput, ChannelError> {
            self.replies.pop_front().unwrap_or(Err(ChannelError::Timeout))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Rc<RefCell<Vec<Telemetry>>>,
    }

    impl TelemetrySink for RecordingSink {
        fn send(&mut self, telemetry: &Telemetry) -> io::Result<()> {
            self.sent.borrow_mut().push(telemetry.clone());
            Ok(())
        }
    }

    const STOP_FRAMES: [u8; 4] = [0x00, 0x40, 0x80, 0xC0];

    struct Rig {
        control: ControlLoop<MockPort>,
        body: MockHandle,
        arm: Option<MockHandle>,
        sent: Rc<RefCell<Vec<Telemetry>>>,
    }

    fn rig(
        replies: Vec<std::result::Result<OperatorInput, ChannelError>>,
        with_arm_link: bool,
    ) -> Rig {
        let (body_port, body) = MockPort::new();
        let (arm_link, arm) = if with_arm_link {
            let (port, handle) = MockPort::new();
            (Some(SerialLink::new("arm", port)), Some(handle))
        } else {
            (None, None)
        };
        let links = ControllerLinks {
            body: SerialLink::new("body", body_port),
            arm: arm_link,
        };
        let sink = RecordingSink::default();
        let sent = sink.sent.clone();
        let control = ControlLoop::new(
            LoopConfig::default(),
            links,
            Box::new(ScriptedChannel {
                replies: replies.into(),
            }),
            Box::new(sink),
        );
        Rig {
            control,
            body,
            arm,
            sent,
        }
    }

    fn forward() -> OperatorInput {
        OperatorInput {
            left_stick: Stick { x: 0.0, y: -1.0 },
            right_stick: Stick { x: 0.0, y: -1.0 },
            ..Default::default()
        }
    }

    #[test]
    fn test_failsafe_zeroes_exactly_once() {
        let mut rig = rig(
            vec![
                Ok(forward()),
                Err(ChannelError::Timeout),
                Err(ChannelError::Timeout),
                Ok(forward()),
            ],
            false,
        );
        let now = Instant::now();

        rig.control.step(now).unwrap();
        let driven: Vec<_> = rig.body.written().iter().map(|&b| unpack_motor(b)).collect();
        assert_eq!(driven[0], (0, false, 24));
        assert_eq!(driven[1], (1, false, 24));
        rig.body.clear_written();

        rig.control.step(now).unwrap();
        assert_eq!(rig.body.written(), STOP_FRAMES);
        assert_eq!(rig.control.state().health, LinkHealth::TimedOut);
        rig.body.clear_written();

        rig.control.step(now).unwrap();
        assert!(rig.body.written().is_empty());

        let later = now + Duration::from_millis(60);
        rig.control.step(later).unwrap();
        assert_eq!(rig.control.state().health, LinkHealth::Connected);
        assert_eq!(rig.control.state().last_exchange, Some(later));
        assert_eq!(rig.body.written().len(), 4);
        assert_eq!(rig.sent.borrow().len(), 2);
    }

    #[test]
    fn test_first_failure_zeroes() {
        let mut rig = rig(vec![Err(ChannelError::Malformed("junk".into()))], false);
        rig.control.step(Instant::now()).unwrap();
        assert_eq!(rig.body.written(), STOP_FRAMES);
        assert!(rig.sent.borrow().is_empty());
    }

    #[test]
    fn test_closed_station_is_fatal() {
        let mut rig = rig(vec![Err(ChannelError::Closed)], false);
        assert!(matches!(
            rig.control.step(Instant::now()),
            Err(RuntimeError::ChannelClosed)
        ));
    }

    #[test]
    fn test_flipper_stops_at_low_limit() {
        let left_flipper_down = OperatorInput {
            buttons: Buttons {
                l2: true,
                r1: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut rig = rig(vec![Ok(left_flipper_down)], false);
        // 0x0A3D / 0xFFFF is 0.04
        rig.body.push_incoming(b"0A3D 8000\n");

        rig.control.step(Instant::now()).unwrap();
        let frames: Vec<_> = rig.body.written().iter().map(|&b| unpack_motor(b)).collect();
        assert_eq!(frames[2], (2, false, 0));
        assert_eq!(frames[3], (3, false, 12));

        let sent = rig.sent.borrow();
        let left = sent[0].flipper_positions[0].unwrap();
        assert!((left - 0.04).abs() < 1e-3);
    }

    #[test]
    fn test_bad_flipper_record_is_ignored() {
        let mut rig = rig(vec![Ok(OperatorInput::default())], false);
        rig.body.push_incoming(b"zz\n");
        rig.control.step(Instant::now()).unwrap();
        assert_eq!(rig.sent.borrow()[0].flipper_positions, [None, None]);
    }

    #[test]
    fn test_arm_link_gets_frames_and_reports() {
        let home = OperatorInput {
            buttons: Buttons {
                start: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut rig = rig(vec![Ok(home), Err(ChannelError::Timeout)], true);
        let arm = rig.arm.clone().unwrap();
        let mut record = vec!["1"; 39].join(" ");
        record.push('\n');
        arm.push_incoming(record.as_bytes());

        let now = Instant::now();
        rig.control.step(now).unwrap();
        let expected = ArmFrame {
            mode: ArmMode::GoHome,
            ..ArmFrame::default()
        };
        assert_eq!(arm.written(), vec![expected.to_byte()]);
        assert_eq!(rig.sent.borrow()[0].arm.co2, Some(1.0));

        // Fail-safe sends a neutral frame
        rig.control.step(now).unwrap();
        assert_eq!(arm.written(), vec![expected.to_byte(), 0x00]);
    }

    #[test]
    fn test_servo_arm_halts_on_failsafe() {
        let sim = SimBus::with_servos(&[(0, 12), (1, 29), (2, 29)]);
        let bus = ServoBus::new("arm", sim.port(), Duration::from_millis(20));
        let servo_arm = Arm::attach(&bus, arm::default_joints()).unwrap();

        let mut rig = rig(vec![Err(ChannelError::Timeout)], false);
        rig.control.attach_arm(servo_arm);
        sim.with_servo(0, |s| {
            s.set_u16(0x24, 512);
            s.set_u16(0x1E, 1023);
        });

        rig.control.step(Instant::now()).unwrap();
        assert_eq!(sim.servo(0).unwrap().read_u16(0x1E), 512);
    }

    #[test]
    fn test_run_stops_on_flag_and_zeroes() {
        let mut rig = rig(vec![Ok(forward())], false);
        let shutdown = AtomicBool::new(true);
        rig.control.run(&shutdown).unwrap();
        assert_eq!(rig.body.written(), STOP_FRAMES);
    }
}
