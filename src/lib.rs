//! Hand-controller driven stage control.
//!
//! A 3-axis joystick (Thorlabs MJC3 over HID, or a keyboard simulation) is
//! polled at a fixed rate; each frame is calibrated per axis and turned into
//! relative moves on a [`StageAdapter`].

pub mod axis;
pub mod calibration;
pub mod calibration_store;
pub mod controller;
pub mod device;
pub mod error;
pub mod factory;
pub mod frame;
pub mod poller;
pub mod stage;

pub use axis::{Axis, AxisMap};
pub use calibration::{AxisCalibration, CalibrationEngine, CalibrationStatus, ManualCalibration};
pub use controller::{ControllerState, JoystickController};
pub use device::{ControllerKind, DeviceIdentity, FrameSource, SimulatedKeypad};
pub use error::{CalibrationError, ControllerError, DeviceError, ReadError};
pub use factory::ControllerFactory;
pub use frame::RawFrame;
pub use poller::PollingConfig;
pub use stage::{DryRunStage, StageAdapter};
