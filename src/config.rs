// Timing, serial settings, addresses and the assembled runtime configuration
use std::net::SocketAddr;
use std::time::Duration;

// Control loop frequency
pub const LOOP_HZ: u64 = 50;
pub const LOOP_PERIOD: Duration = Duration::from_millis(1000 / LOOP_HZ);

// Command request timeout; a miss enters fail-safe
pub const CMD_TIMEOUT: Duration = Duration::from_millis(500);

// Identification window per device, and the range it may be set to
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
pub const HANDSHAKE_TIMEOUT_MIN: Duration = Duration::from_millis(200);
pub const HANDSHAKE_TIMEOUT_MAX: Duration = Duration::from_secs(1);

// Upper bound on waiting for a line in flight from a microcontroller
pub const LINK_READ_TIMEOUT: Duration = Duration::from_millis(200);

// Serial port driver timeout, and the polling slice for deadline reads
pub const PORT_TIMEOUT: Duration = Duration::from_millis(10);
pub const POLL_SLICE: Duration = Duration::from_millis(2);

// Microcontroller firmware baud rate (8N1)
pub const MBED_BAUDRATE: u32 = 38_400;

// Servo bus
pub const SERVO_BAUDRATE: u32 = 1_000_000;
pub const SERVO_TIMEOUT: Duration = Duration::from_millis(100);

// Minimum time between two toggles of the same kind
pub const TOGGLE_DEBOUNCE: Duration = Duration::from_secs(1);

// Flipper potentiometer fractions past which a flipper stops
pub const FLIPPER_LOW: f32 = 0.05;
pub const FLIPPER_HIGH: f32 = 0.95;

// Operator station
pub const OPSTN_ADDR: &str = "192.168.54.200:9999";
pub const TELEMETRY_PORT: u16 = 9999;

// Arm power-down time during a reset
pub const ARM_RESET_HOLD: Duration = Duration::from_secs(1);

// Joint nudge per cycle while an arm axis is held
pub const ARM_STEP_DEG: f32 = 1.0;

/// Clamp a requested handshake window into the supported range.
pub fn clamp_handshake_timeout(timeout: Duration) -> Duration {
    timeout.clamp(HANDSHAKE_TIMEOUT_MIN, HANDSHAKE_TIMEOUT_MAX)
}

/// Settings for the control loop itself
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub period: Duration,
    pub flipper_limits: crate::motor::FlipperLimits,
    pub left_flipper: crate::motor::ClampPolarity,
    pub right_flipper: crate::motor::ClampPolarity,
    pub link_read_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            period: LOOP_PERIOD,
            flipper_limits: crate::motor::FlipperLimits::default(),
            left_flipper: crate::motor::ClampPolarity::Direct,
            right_flipper: crate::motor::ClampPolarity::Inverted,
            link_read_timeout: Duration::from_millis(5),
        }
    }
}

/// Everything needed to bring the vehicle up
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub operator: SocketAddr,
    pub telemetry_port: u16,
    pub command_timeout: Duration,
    /// Devices to identify; empty means scan for them.
    pub serial_candidates: Vec<String>,
    pub mbed_baudrate: u32,
    pub handshake_timeout: Duration,
    /// Servo bus for the arm, if one is wired to the vehicle computer.
    pub servo_port: Option<String>,
    pub servo_baudrate: u32,
    pub loop_config: LoopConfig,
}

impl RuntimeConfig {
    pub fn new(operator: SocketAddr) -> Self {
        Self {
            operator,
            telemetry_port: TELEMETRY_PORT,
            command_timeout: CMD_TIMEOUT,
            serial_candidates: Vec::new(),
            mbed_baudrate: MBED_BAUDRATE,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            servo_port: None,
            servo_baudrate: SERVO_BAUDRATE,
            loop_config: LoopConfig::default(),
        }
    }

    /// Where telemetry datagrams go: the operator's host on the telemetry port.
    pub fn telemetry_addr(&self) -> SocketAddr {
        SocketAddr::new(self.operator.ip(), self.telemetry_port)
    }
}
