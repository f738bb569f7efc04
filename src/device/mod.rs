//! Frame sources: the hardware HID reader and the keyboard simulation.
//!
//! Both implement the sealed [`FrameSource`] trait. The factory picks one
//! kind per controller and it never changes afterwards.

pub mod hid;
pub mod native;
pub mod simulated;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{DeviceError, ReadError};
use crate::frame::RawFrame;

pub use simulated::SimulatedKeypad;

/// The controller kinds, in fixed preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ControllerKind {
    /// MJC3 hand controller read through hidapi.
    Hid,
    /// Keyboard-driven simulation, always available.
    Simulation,
}

impl ControllerKind {
    pub const PREFERENCE: [ControllerKind; 2] = [ControllerKind::Hid, ControllerKind::Simulation];

    pub fn as_str(self) -> &'static str {
        match self {
            ControllerKind::Hid => "hid",
            ControllerKind::Simulation => "simulation",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ControllerKind::Hid => "Thorlabs MJC3 joystick via native HID access",
            ControllerKind::Simulation => "Keyboard simulation (no hardware)",
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControllerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hid" | "mjc3" | "hardware" => Ok(ControllerKind::Hid),
            "simulation" | "sim" | "keyboard" => Ok(ControllerKind::Simulation),
            other => Err(format!("unknown controller kind '{other}'")),
        }
    }
}

/// Identity reported by a connected source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

pub(crate) mod private {
    pub trait Sealed {}
}

/// A device that yields raw frames.
///
/// Sealed: the crate provides exactly the HID and simulation variants.
pub trait FrameSource: Send + private::Sealed {
    fn kind(&self) -> ControllerKind;

    /// Open the device. Idempotent; a connected source returns immediately.
    fn connect(&mut self) -> Result<DeviceIdentity, DeviceError>;

    fn is_connected(&self) -> bool;

    /// Read one frame, waiting at most `timeout`.
    ///
    /// `Ok(None)` on timeout. `Err` only on a transport fault.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame>, ReadError>;

    /// Release the underlying resource. Later calls are no-ops.
    fn dispose(&mut self);

    /// Keypad handle for the simulation variant.
    fn keypad(&self) -> Option<SimulatedKeypad> {
        None
    }
}
