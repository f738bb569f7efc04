//! HID report parsing for the 3-axis hand controller.
//!
//! Report format (5 bytes):
//!   [0] = X deflection (i8, -127..127)
//!   [1] = Y deflection (i8)
//!   [2] = Z deflection (i8)
//!   [3] = Button (0 or 1)
//!   [4] = Speed knob (0..255)

use serde::Serialize;

use crate::axis::Axis;

/// Size of one input report.
pub const REPORT_SIZE: usize = 5;

/// Lower bound on the speed knob scale. The knob never fully silences movement.
pub const MIN_SPEED_FACTOR: f64 = 0.1;

/// One decoded sample from the hand controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RawFrame {
    pub x: i8,
    pub y: i8,
    pub z: i8,
    pub button: u8,
    pub speed_knob: u8,
}

impl RawFrame {
    /// All axes centered, button released, knob at zero.
    pub fn neutral() -> Self {
        Self::default()
    }

    /// Decode a raw report. Returns None if the report is too short.
    pub fn from_report(report: &[u8]) -> Option<Self> {
        if report.len() < REPORT_SIZE {
            return None;
        }
        Some(Self {
            x: report[0] as i8,
            y: report[1] as i8,
            z: report[2] as i8,
            button: report[3],
            speed_knob: report[4],
        })
    }

    pub fn raw(&self, axis: Axis) -> i8 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    /// Builder-style setter, mostly for synthesized frames.
    pub fn with_axis(mut self, axis: Axis, value: i8) -> Self {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
        self
    }

    pub fn button_pressed(&self) -> bool {
        self.button != 0
    }

    /// Movement scale from the speed knob, floored at [`MIN_SPEED_FACTOR`].
    pub fn speed_factor(&self) -> f64 {
        speed_factor(self.speed_knob)
    }
}

pub fn speed_factor(knob: u8) -> f64 {
    (knob as f64 / 255.0).max(MIN_SPEED_FACTOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signed_axes() {
        let frame = RawFrame::from_report(&[0x40, 0xC0, 0x81, 0x01, 0xFF]).unwrap();
        assert_eq!(frame.x, 64);
        assert_eq!(frame.y, -64);
        assert_eq!(frame.z, -127);
        assert!(frame.button_pressed());
        assert_eq!(frame.speed_knob, 255);
    }

    #[test]
    fn test_parse_short_report() {
        assert_eq!(RawFrame::from_report(&[0, 0, 0, 0]), None);
        assert_eq!(RawFrame::from_report(&[]), None);
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let frame = RawFrame::from_report(&[1, 2, 3, 0, 9, 0xAA, 0xBB]).unwrap();
        assert_eq!(frame.raw(Axis::X), 1);
        assert_eq!(frame.raw(Axis::Y), 2);
        assert_eq!(frame.raw(Axis::Z), 3);
        assert_eq!(frame.speed_knob, 9);
    }

    #[test]
    fn test_speed_factor_floor_and_full_scale() {
        assert_eq!(speed_factor(0), 0.1);
        assert_eq!(speed_factor(255), 1.0);
        // 20/255 is below the floor
        assert_eq!(speed_factor(20), 0.1);
        assert!((speed_factor(128) - 128.0 / 255.0).abs() < 1e-12);
    }

    #[test]
    fn test_with_axis() {
        let frame = RawFrame::neutral().with_axis(Axis::Z, -5);
        assert_eq!(frame.z, -5);
        assert_eq!(frame.x, 0);
    }
}
