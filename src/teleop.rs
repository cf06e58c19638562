// Operator input -> motor speeds and arm directive
//
// Wheels are driven either by the left stick alone (arcade) or by one stick
// per side (tank). Reverse mode drives the vehicle backwards as if it were
// going forwards: sides swap, signs flip, and so do the flipper buttons.

use std::time::{Duration, Instant};
use tracing::info;

use crate::codec::{ArmFrame, ArmMode, Axis};
use crate::config::TOGGLE_DEBOUNCE;
use crate::messages::{MotorCommands, OperatorInput, Stick};

/// Debounced operator modes
#[derive(Debug, Clone)]
pub struct Teleop {
    single_stick: bool,
    reverse: bool,
    stick_toggled_at: Option<Instant>,
    reverse_toggled_at: Option<Instant>,
    debounce: Duration,
}

impl Default for Teleop {
    fn default() -> Self {
        Self::new(TOGGLE_DEBOUNCE)
    }
}

impl Teleop {
    pub fn new(debounce: Duration) -> Self {
        Self {
            single_stick: false,
            reverse: false,
            stick_toggled_at: None,
            reverse_toggled_at: None,
            debounce,
        }
    }

    pub fn single_stick(&self) -> bool {
        self.single_stick
    }

    pub fn reverse(&self) -> bool {
        self.reverse
    }

    /// Apply mode toggles, then decode the input.
    pub fn decode(&mut self, input: &OperatorInput, now: Instant) -> (MotorCommands, ArmFrame) {
        if input.buttons.l3 && self.may_toggle(self.stick_toggled_at, now) {
            self.single_stick = !self.single_stick;
            self.stick_toggled_at = Some(now);
            if self.single_stick {
                info!("Control mode switched: left stick drives");
            } else {
                info!("Control mode switched: left and right sticks drive");
            }
        }
        if input.buttons.r3 && self.may_toggle(self.reverse_toggled_at, now) {
            self.reverse = !self.reverse;
            self.reverse_toggled_at = Some(now);
            info!(
                "Reverse mode {}",
                if self.reverse { "enabled" } else { "disabled" }
            );
        }

        (self.motor_commands(input), arm_frame(input))
    }

    fn may_toggle(&self, last: Option<Instant>, now: Instant) -> bool {
        last.is_none_or(|at| now.saturating_duration_since(at) >= self.debounce)
    }

    fn motor_commands(&self, input: &OperatorInput) -> MotorCommands {
        let (left_wheel, right_wheel) = if self.single_stick {
            arcade(input.left_stick, self.reverse)
        } else if self.reverse {
            (input.right_stick.y, input.left_stick.y)
        } else {
            (-input.left_stick.y, -input.right_stick.y)
        };

        let b = &input.buttons;
        let left_pair = flipper(b.l1, b.l2);
        let right_pair = flipper(b.r1, b.r2);
        let (left_flipper, right_flipper) = if self.reverse {
            (right_pair, left_pair)
        } else {
            (left_pair, right_pair)
        };

        MotorCommands {
            left_wheel,
            right_wheel,
            left_flipper,
            right_flipper,
        }
    }
}

/// Single-stick mixing. Stick y is negative when pushed forward.
fn arcade(stick: Stick, reverse: bool) -> (f32, f32) {
    let Stick { x, y } = stick;
    if y == 0.0 {
        // Rotate in place
        return if reverse { (-x, x) } else { (x, -x) };
    }
    let toward = (1.0 + x) / (1.0 + x.abs());
    let away = (1.0 - x) / (1.0 + x.abs());
    if reverse {
        (y * away, y * toward)
    } else {
        (-y * toward, -y * away)
    }
}

/// One button raises, the other lowers, both cancel.
fn flipper(up: bool, down: bool) -> f32 {
    match (up, down) {
        (true, false) => 1.0,
        (false, true) => -1.0,
        _ => 0.0,
    }
}

fn arm_frame(input: &OperatorInput) -> ArmFrame {
    let mode = if input.buttons.start {
        ArmMode::GoHome
    } else if input.buttons.select {
        ArmMode::Reset
    } else {
        ArmMode::Hold
    };

    let mut frame = ArmFrame {
        mode,
        ..ArmFrame::default()
    };
    if input.buttons.circle {
        frame.extend = Axis::from_input(input.dpad.y);
    } else {
        frame.pitch = Axis::from_input(input.dpad.y);
        frame.yaw = Axis::from_input(input.dpad.x);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Buttons;

    fn input(left: (f32, f32), right: (f32, f32)) -> OperatorInput {
        OperatorInput {
            left_stick: Stick { x: left.0, y: left.1 },
            right_stick: Stick { x: right.0, y: right.1 },
            ..Default::default()
        }
    }

    fn pressed(buttons: Buttons) -> OperatorInput {
        OperatorInput {
            buttons,
            ..Default::default()
        }
    }

    #[test]
    fn test_dual_stick_forward_and_reverse() {
        let mut teleop = Teleop::default();
        let now = Instant::now();
        let (cmd, _) = teleop.decode(&input((0.0, -1.0), (0.0, -0.5)), now);
        assert_eq!((cmd.left_wheel, cmd.right_wheel), (1.0, 0.5));

        teleop.reverse = true;
        let (cmd, _) = teleop.decode(&input((0.0, -1.0), (0.0, -0.5)), now);
        assert_eq!((cmd.left_wheel, cmd.right_wheel), (-0.5, -1.0));
    }

    #[test]
    fn test_single_stick_mixing() {
        let mut teleop = Teleop::default();
        teleop.single_stick = true;
        let now = Instant::now();

        // Straight ahead
        let (cmd, _) = teleop.decode(&input((0.0, -1.0), (0.0, 0.0)), now);
        assert_eq!((cmd.left_wheel, cmd.right_wheel), (1.0, 1.0));

        // Spin on the spot
        let (cmd, _) = teleop.decode(&input((0.5, 0.0), (0.0, 0.0)), now);
        assert_eq!((cmd.left_wheel, cmd.right_wheel), (0.5, -0.5));

        // Hard right while driving forward stops the right side
        let (cmd, _) = teleop.decode(&input((1.0, -1.0), (0.0, 0.0)), now);
        assert_eq!((cmd.left_wheel, cmd.right_wheel), (1.0, 0.0));
    }

    #[test]
    fn test_flipper_buttons_swap_in_reverse() {
        let mut teleop = Teleop::default();
        let now = Instant::now();
        let buttons = Buttons {
            l1: true,
            r2: true,
            ..Default::default()
        };
        let (cmd, _) = teleop.decode(&pressed(buttons), now);
        assert_eq!((cmd.left_flipper, cmd.right_flipper), (1.0, -1.0));

        teleop.reverse = true;
        let (cmd, _) = teleop.decode(&pressed(buttons), now);
        assert_eq!((cmd.left_flipper, cmd.right_flipper), (-1.0, 1.0));

        let both = Buttons {
            l1: true,
            l2: true,
            ..Default::default()
        };
        let (cmd, _) = teleop.decode(&pressed(both), now);
        assert_eq!(cmd.right_flipper, 0.0);
    }

    #[test]
    fn test_toggles_are_debounced() {
        let mut teleop = Teleop::default();
        let start = Instant::now();
        let l3 = pressed(Buttons {
            l3: true,
            ..Default::default()
        });

        teleop.decode(&l3, start);
        assert!(teleop.single_stick());
        // Held button within the window does nothing
        teleop.decode(&l3, start + Duration::from_millis(500));
        assert!(teleop.single_stick());
        teleop.decode(&l3, start + Duration::from_millis(1000));
        assert!(!teleop.single_stick());

        // Independent of the stick toggle
        let r3 = pressed(Buttons {
            r3: true,
            ..Default::default()
        });
        teleop.decode(&r3, start + Duration::from_millis(1100));
        assert!(teleop.reverse());
    }

    #[test]
    fn test_arm_directive() {
        let mut teleop = Teleop::default();
        let now = Instant::now();

        let mut aim = pressed(Buttons::default());
        aim.dpad = Stick { x: -1.0, y: 1.0 };
        let (_, frame) = teleop.decode(&aim, now);
        assert_eq!(frame.mode, ArmMode::Hold);
        assert_eq!((frame.yaw, frame.pitch, frame.extend), (Axis::Retract, Axis::Advance, Axis::Hold));

        aim.buttons.circle = true;
        let (_, frame) = teleop.decode(&aim, now);
        assert_eq!((frame.yaw, frame.pitch, frame.extend), (Axis::Hold, Axis::Hold, Axis::Advance));

        aim.buttons.start = true;
        aim.buttons.select = true;
        let (_, frame) = teleop.decode(&aim, now);
        assert_eq!(frame.mode, ArmMode::GoHome);
    }
}
