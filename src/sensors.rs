// Sensor contracts consumed by the control loop
//
// Drivers live elsewhere; the loop only needs "read one measurement", and a
// sensor with nothing to report returns `None` instead of failing.

use tracing::debug;

use crate::messages::{Orientation, PowerReading};

/// A current/power monitor on one motor supply
pub trait CurrentSensor {
    fn name(&self) -> &str;
    fn read(&mut self) -> Option<PowerReading>;
}

/// An inertial sensor reporting absolute orientation
pub trait Imu {
    fn name(&self) -> &str;
    fn read(&mut self) -> Option<Orientation>;
}

/// The sensors attached to the vehicle, read once per cycle.
#[derive(Default)]
pub struct SensorSuite {
    currents: Vec<Box<dyn CurrentSensor>>,
    imus: Vec<Box<dyn Imu>>,
}

impl SensorSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_current_sensor(&mut self, sensor: Box<dyn CurrentSensor>) {
        debug!("Registering current sensor {}", sensor.name());
        self.currents.push(sensor);
    }

    pub fn add_imu(&mut self, imu: Box<dyn Imu>) {
        debug!("Registering IMU {}", imu.name());
        self.imus.push(imu);
    }

    /// One reading per current sensor, in registration order
    pub fn read_currents(&mut self) -> Vec<Option<PowerReading>> {
        self.currents.iter_mut().map(|s| s.read()).collect()
    }

    /// One reading per IMU, in registration order
    pub fn read_imus(&mut self) -> Vec<Option<Orientation>> {
        self.imus.iter_mut().map(|s| s.read()).collect()
    }
}
