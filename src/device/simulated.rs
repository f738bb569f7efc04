//! Keyboard-driven simulation source.
//!
//! Frames come from discrete increment/decrement presses sent through a
//! [`SimulatedKeypad`]. Each press yields one full-deflection frame on its
//! axis followed by a neutral release frame, and a read with no pending
//! press is neutral too. The neutral frames re-arm the poller's edge
//! detector, so repeated presses of one key each move the stage.

use std::str::FromStr;
use std::sync::mpsc;
use std::time::Duration;

use tracing::{debug, info};

use super::{private, ControllerKind, DeviceIdentity, FrameSource};
use crate::axis::Axis;
use crate::error::{DeviceError, ReadError};
use crate::frame::RawFrame;

/// Raw deflection produced by one key press.
pub const KEY_DEFLECTION: i8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Increment,
    Decrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPress {
    pub axis: Axis,
    pub direction: Direction,
}

impl KeyPress {
    fn frame(self) -> RawFrame {
        let value = match self.direction {
            Direction::Increment => KEY_DEFLECTION,
            Direction::Decrement => -KEY_DEFLECTION,
        };
        RawFrame {
            speed_knob: u8::MAX,
            ..RawFrame::neutral()
        }
        .with_axis(self.axis, value)
    }
}

/// Key bindings: a/d = X, s/w = Y, f/r (or -/+) = Z.
impl FromStr for KeyPress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (axis, direction) = match s.trim() {
            "d" => (Axis::X, Direction::Increment),
            "a" => (Axis::X, Direction::Decrement),
            "w" => (Axis::Y, Direction::Increment),
            "s" => (Axis::Y, Direction::Decrement),
            "r" | "+" => (Axis::Z, Direction::Increment),
            "f" | "-" => (Axis::Z, Direction::Decrement),
            other => return Err(format!("unbound key '{other}'")),
        };
        Ok(Self { axis, direction })
    }
}

/// Cloneable input handle for a [`SimulatedReader`].
#[derive(Debug, Clone)]
pub struct SimulatedKeypad {
    tx: mpsc::Sender<KeyPress>,
}

impl SimulatedKeypad {
    /// Queue a press. Returns false once the reader is gone.
    pub fn press(&self, key: KeyPress) -> bool {
        self.tx.send(key).is_ok()
    }

    pub fn increment(&self, axis: Axis) -> bool {
        self.press(KeyPress {
            axis,
            direction: Direction::Increment,
        })
    }

    pub fn decrement(&self, axis: Axis) -> bool {
        self.press(KeyPress {
            axis,
            direction: Direction::Decrement,
        })
    }
}

pub struct SimulatedReader {
    rx: mpsc::Receiver<KeyPress>,
    keypad: SimulatedKeypad,
    /// A press was just delivered; the next read releases the key.
    release_pending: bool,
    connected: bool,
    disposed: bool,
}

impl SimulatedReader {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            rx,
            keypad: SimulatedKeypad { tx },
            release_pending: false,
            connected: false,
            disposed: false,
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            product: Some("Keyboard simulation".to_string()),
            ..DeviceIdentity::default()
        }
    }
}

impl Default for SimulatedReader {
    fn default() -> Self {
        Self::new()
    }
}

impl private::Sealed for SimulatedReader {}

impl FrameSource for SimulatedReader {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Simulation
    }

    fn connect(&mut self) -> Result<DeviceIdentity, DeviceError> {
        if self.disposed {
            return Err(DeviceError::Disposed);
        }
        if !self.connected {
            info!("[SIM] Keyboard simulation ready (a/d = X, s/w = Y, f/r = Z)");
            self.connected = true;
        }
        Ok(Self::identity())
    }

    /// Always connected while not disposed.
    fn is_connected(&self) -> bool {
        !self.disposed
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame>, ReadError> {
        if self.disposed {
            return Err(ReadError::NotConnected);
        }
        if self.release_pending {
            self.release_pending = false;
            return Ok(Some(RawFrame::neutral()));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(key) => {
                debug!("[SIM] {:?} {}", key.direction, key.axis);
                self.release_pending = true;
                Ok(Some(key.frame()))
            }
            Err(_) => Ok(Some(RawFrame::neutral())),
        }
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.connected = false;
            debug!("[SIM] Simulation reader disposed");
        }
    }

    fn keypad(&self) -> Option<SimulatedKeypad> {
        Some(self.keypad.clone())
    }
}
