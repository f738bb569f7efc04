//! Error taxonomy for device access, calibration and the controller API.
//!
//! Per-tick faults never leave the polling thread as errors; they surface
//! through the controller's `connected`/`running` flags and the log.

use thiserror::Error;

use crate::axis::Axis;

/// Construction and connect-time failures of a frame source.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The native HID access layer could not be loaded or failed its self-test.
    #[error("native HID access unavailable: {0}")]
    NativeModuleMissing(String),

    /// No device with the expected vendor/product id could be opened.
    #[error("device {vendor_id:04X}:{product_id:04X} not found: {reason}")]
    DeviceNotFound {
        vendor_id: u16,
        product_id: u16,
        reason: String,
    },

    /// A device was opened but reports a different identity.
    #[error("unexpected device identity {found_vendor:04X}:{found_product:04X}")]
    IdentityMismatch { found_vendor: u16, found_product: u16 },

    /// The source was disposed and can no longer be used.
    #[error("frame source has been disposed")]
    Disposed,
}

/// A genuine transport fault while reading a frame. Timeouts are not errors.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("HID transport error: {0}")]
    Transport(String),

    #[error("device is not connected")]
    NotConnected,
}

/// Rejected calibration captures or parameters.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("axis {axis}: extents must satisfy negative < center < positive (got {negative} / {center} / {positive})")]
    InvalidExtents {
        axis: Axis,
        negative: i16,
        center: i16,
        positive: i16,
    },

    #[error("axis {axis}: captured span {span} is below the minimum of {min_span}")]
    DegenerateCapture { axis: Axis, span: i16, min_span: i16 },

    #[error("axis {axis}: invalid {name} value {value}")]
    InvalidParameter {
        axis: Axis,
        name: &'static str,
        value: f64,
    },

    #[error("axis {axis}: no samples captured")]
    NoSamples { axis: Axis },

    #[error("calibration cannot run while polling is active")]
    PollingActive,

    #[error("device error during capture: {0}")]
    Device(String),
}

/// Errors surfaced by the caller-facing controller API.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The periodic tick mechanism itself failed. Fatal, no retry.
    #[error("scheduler fault: {0}")]
    SchedulerFault(String),

    #[error("controller has been disposed")]
    Disposed,

    #[error("invalid step factor {0} (must be finite and non-negative)")]
    InvalidStepFactor(f64),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}
