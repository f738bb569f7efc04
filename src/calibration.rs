//! Per-axis calibration: raw i8 samples to normalized deflection in [-1, 1].
//!
//! Mapping, in order:
//!   1. Scale relative to `center`, separately on each side, clamp to [-1, 1].
//!   2. Magnitudes at or below `deadzone` become exactly 0.
//!   3. Shape the magnitude with the `resolution` power curve (1.0 = linear).
//!   4. Negate if `invert` is set.
//!
//! `damping` is carried in the profile but applied over time by the poller's
//! smoother, since it needs the previous output.

use serde::{Deserialize, Serialize};

use crate::axis::{Axis, AxisMap};
use crate::error::CalibrationError;

/// Smallest accepted `positive - negative` span for a captured profile.
pub const MIN_CAPTURE_SPAN: i16 = 20;

/// Full signed range of an uncalibrated axis.
const IDENTITY_EXTENT: i16 = 127;

/// Calibration profile for one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisCalibration {
    pub negative_extent: i16,
    pub center: i16,
    pub positive_extent: i16,
    /// Fraction of full deflection treated as no input, in [0, 1).
    pub deadzone: f64,
    /// Power-curve exponent applied after deadzone suppression, > 0.
    pub resolution: f64,
    /// Exponential smoothing factor in [0, 1). 0 disables smoothing.
    pub damping: f64,
    pub invert: bool,
}

impl Default for AxisCalibration {
    fn default() -> Self {
        Self::identity()
    }
}

impl AxisCalibration {
    /// Raw value scaled by the full signed range, no shaping.
    pub fn identity() -> Self {
        Self {
            negative_extent: -IDENTITY_EXTENT,
            center: 0,
            positive_extent: IDENTITY_EXTENT,
            deadzone: 0.0,
            resolution: 1.0,
            damping: 0.0,
            invert: false,
        }
    }

    /// Map a raw sample to a deflection in [-1, 1].
    pub fn apply(&self, raw: i8) -> f64 {
        let raw = raw as f64;
        let center = self.center as f64;

        let scaled = if raw >= center {
            (raw - center) / (self.positive_extent as f64 - center)
        } else {
            (raw - center) / (center - self.negative_extent as f64)
        };
        let scaled = scaled.clamp(-1.0, 1.0);

        if scaled.abs() <= self.deadzone {
            return 0.0;
        }

        let shaped = scaled.signum() * scaled.abs().powf(self.resolution);
        let out = if self.invert { -shaped } else { shaped };
        out.clamp(-1.0, 1.0)
    }

    fn validate(&self, axis: Axis) -> Result<(), CalibrationError> {
        if !(self.negative_extent < self.center && self.center < self.positive_extent) {
            return Err(CalibrationError::InvalidExtents {
                axis,
                negative: self.negative_extent,
                center: self.center,
                positive: self.positive_extent,
            });
        }
        check_range(axis, "deadzone", self.deadzone, |v| (0.0..1.0).contains(&v))?;
        check_range(axis, "resolution", self.resolution, |v| v > 0.0)?;
        check_range(axis, "damping", self.damping, |v| (0.0..1.0).contains(&v))?;
        Ok(())
    }
}

fn check_range(
    axis: Axis,
    name: &'static str,
    value: f64,
    ok: impl Fn(f64) -> bool,
) -> Result<(), CalibrationError> {
    if value.is_finite() && ok(value) {
        Ok(())
    } else {
        Err(CalibrationError::InvalidParameter { axis, name, value })
    }
}

/// Manual calibration request. Omitted shaping fields keep their current values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManualCalibration {
    pub negative: i16,
    pub center: i16,
    pub positive: i16,
    pub deadzone: Option<f64>,
    pub resolution: Option<f64>,
    pub damping: Option<f64>,
    pub invert: Option<bool>,
}

impl ManualCalibration {
    pub fn new(negative: i16, center: i16, positive: i16) -> Self {
        Self {
            negative,
            center,
            positive,
            deadzone: None,
            resolution: None,
            damping: None,
            invert: None,
        }
    }

    pub fn deadzone(mut self, deadzone: f64) -> Self {
        self.deadzone = Some(deadzone);
        self
    }

    pub fn resolution(mut self, resolution: f64) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn damping(mut self, damping: f64) -> Self {
        self.damping = Some(damping);
        self
    }

    pub fn invert(mut self, invert: bool) -> Self {
        self.invert = Some(invert);
        self
    }

    fn merge_into(&self, current: &AxisCalibration) -> AxisCalibration {
        AxisCalibration {
            negative_extent: self.negative,
            center: self.center,
            positive_extent: self.positive,
            deadzone: self.deadzone.unwrap_or(current.deadzone),
            resolution: self.resolution.unwrap_or(current.resolution),
            damping: self.damping.unwrap_or(current.damping),
            invert: self.invert.unwrap_or(current.invert),
        }
    }
}

/// Derive a profile from samples captured while the operator sweeps the axis.
///
/// Extents come from the sample min/max. The prior center is kept if it lies
/// strictly inside them, otherwise the first (resting) sample becomes the center.
pub fn derive_from_samples(
    axis: Axis,
    prior: &AxisCalibration,
    samples: &[i8],
    min_span: i16,
) -> Result<AxisCalibration, CalibrationError> {
    let first = *samples.first().ok_or(CalibrationError::NoSamples { axis })?;
    let negative = samples.iter().copied().min().unwrap_or(first) as i16;
    let positive = samples.iter().copied().max().unwrap_or(first) as i16;

    let span = positive - negative;
    if span < min_span {
        return Err(CalibrationError::DegenerateCapture {
            axis,
            span,
            min_span,
        });
    }

    let center = if negative < prior.center && prior.center < positive {
        prior.center
    } else {
        first as i16
    };

    let profile = AxisCalibration {
        negative_extent: negative,
        center,
        positive_extent: positive,
        ..*prior
    };
    profile.validate(axis)?;
    Ok(profile)
}

/// Calibration state of one axis, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AxisStatus {
    pub calibrated: bool,
    pub profile: AxisCalibration,
}

/// Read-only snapshot of all three axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationStatus {
    pub axes: AxisMap<AxisStatus>,
}

impl CalibrationStatus {
    pub fn is_calibrated(&self, axis: Axis) -> bool {
        self.axes[axis].calibrated
    }
}

/// Calibration profiles for X, Y and Z.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalibrationEngine {
    profiles: AxisMap<AxisCalibration>,
    calibrated: AxisMap<bool>,
}

impl CalibrationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, axis: Axis, raw: i8) -> f64 {
        self.profiles[axis].apply(raw)
    }

    pub fn profile(&self, axis: Axis) -> &AxisCalibration {
        &self.profiles[axis]
    }

    pub fn is_calibrated(&self, axis: Axis) -> bool {
        self.calibrated[axis]
    }

    /// Overwrite an axis profile after validating `negative < center < positive`.
    pub fn set_manual(
        &mut self,
        axis: Axis,
        manual: ManualCalibration,
    ) -> Result<(), CalibrationError> {
        let profile = manual.merge_into(&self.profiles[axis]);
        self.restore(axis, profile, true)
    }

    /// Derive and install a profile from captured samples.
    pub fn apply_capture(
        &mut self,
        axis: Axis,
        samples: &[i8],
    ) -> Result<AxisCalibration, CalibrationError> {
        let profile = derive_from_samples(axis, &self.profiles[axis], samples, MIN_CAPTURE_SPAN)?;
        self.profiles[axis] = profile;
        self.calibrated[axis] = true;
        Ok(profile)
    }

    /// Install a previously saved profile.
    pub fn restore(
        &mut self,
        axis: Axis,
        profile: AxisCalibration,
        calibrated: bool,
    ) -> Result<(), CalibrationError> {
        profile.validate(axis)?;
        self.profiles[axis] = profile;
        self.calibrated[axis] = calibrated;
        Ok(())
    }

    pub fn status(&self) -> CalibrationStatus {
        let axis_status = |axis: Axis| AxisStatus {
            calibrated: self.calibrated[axis],
            profile: self.profiles[axis],
        };
        CalibrationStatus {
            axes: AxisMap::new(axis_status(Axis::X), axis_status(Axis::Y), axis_status(Axis::Z)),
        }
    }
}
