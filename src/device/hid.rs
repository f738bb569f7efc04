//! Hardware frame source backed by [`HidAccess`].

use std::time::Duration;

use tracing::{debug, info, warn};

use super::native::{HidAccess, NativeInfo};
use super::{private, ControllerKind, DeviceIdentity, FrameSource};
use crate::error::{DeviceError, ReadError};
use crate::frame::RawFrame;

pub struct HidReader {
    access: Option<HidAccess>,
    connected: bool,
}

impl HidReader {
    /// Load the native HID layer. Fails with `NativeModuleMissing` if it is
    /// unavailable or its self-test fails.
    pub fn new() -> Result<Self, DeviceError> {
        let access = HidAccess::load()?;
        debug!("[HID] Native HID access loaded");
        Ok(Self {
            access: Some(access),
            connected: false,
        })
    }

    /// Connection state and identity, without raising when the device is absent.
    pub fn info(&mut self) -> NativeInfo {
        match self.access.as_mut() {
            Some(access) => {
                let info = access.info();
                self.connected = info.connected;
                info
            }
            None => NativeInfo::default(),
        }
    }
}

impl private::Sealed for HidReader {}

impl FrameSource for HidReader {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Hid
    }

    fn connect(&mut self) -> Result<DeviceIdentity, DeviceError> {
        let access = self.access.as_mut().ok_or(DeviceError::Disposed)?;

        // A stale handle from a faulted session is dropped before reopening.
        if !self.connected && access.is_open() {
            access.close();
        }

        let result = access.open();
        self.connected = result.is_ok();
        result
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<RawFrame>, ReadError> {
        let access = self.access.as_mut().ok_or(ReadError::NotConnected)?;
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);

        match access.read(timeout_ms) {
            Ok(Some(report)) => Ok(RawFrame::from_report(&report)),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("[HID] Read error: {e}");
                self.connected = false;
                Err(e)
            }
        }
    }

    fn dispose(&mut self) {
        if let Some(mut access) = self.access.take() {
            access.close();
            info!("[HID] Native HID access released");
        }
        self.connected = false;
    }
}

impl Drop for HidReader {
    fn drop(&mut self) {
        self.dispose();
    }
}
