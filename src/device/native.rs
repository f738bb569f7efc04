//! Owned wrapper around the native HID access layer.
//!
//! Exposes four operations: `test`, `info`, `read`, `close`. The device
//! handle never leaves this type and is closed on drop.

use std::fmt;
use std::str::FromStr;

use hidapi::{HidApi, HidDevice};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::DeviceIdentity;
use crate::error::{DeviceError, ReadError};
use crate::frame::REPORT_SIZE;

/// Thorlabs vendor id.
pub const VENDOR_ID: u16 = 0x1313;
/// MJC3 product id.
pub const PRODUCT_ID: u16 = 0x9000;

/// Read timeout used by `read` when none is given.
pub const DEFAULT_READ_TIMEOUT_MS: u32 = 100;

/// The four native operations, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeCommand {
    Test,
    Info,
    Read { timeout_ms: u32 },
    Close,
}

impl FromStr for NativeCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "test" => Ok(NativeCommand::Test),
            "info" => Ok(NativeCommand::Info),
            "read" => Ok(NativeCommand::Read {
                timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            }),
            "close" => Ok(NativeCommand::Close),
            other => Err(format!(
                "unknown command '{other}'. Valid commands: 'read', 'info', 'test', 'close'"
            )),
        }
    }
}

/// Result of `info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NativeInfo {
    pub connected: bool,
    #[serde(flatten)]
    pub identity: Option<DeviceIdentity>,
}

/// Result of a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum NativeReply {
    Test { ok: bool },
    Info(NativeInfo),
    Read { report: Option<[u8; REPORT_SIZE]> },
    Close,
}

impl fmt::Display for NativeReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

/// Native HID context plus the (optional) open MJC3 handle.
pub struct HidAccess {
    api: HidApi,
    device: Option<HidDevice>,
}

impl HidAccess {
    /// Initialize the HID layer and run the self-test.
    pub fn load() -> Result<Self, DeviceError> {
        let api = HidApi::new().map_err(|e| DeviceError::NativeModuleMissing(e.to_string()))?;
        let mut access = Self { api, device: None };
        if !access.test() {
            return Err(DeviceError::NativeModuleMissing(
                "HID self-test failed".to_string(),
            ));
        }
        Ok(access)
    }

    /// Self-test: the HID layer can enumerate devices.
    pub fn test(&mut self) -> bool {
        match self.api.refresh_devices() {
            Ok(()) => true,
            Err(e) => {
                warn!("[HID] Self-test failed: {e}");
                false
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Open the MJC3 and verify its identity. Idempotent.
    pub fn open(&mut self) -> Result<DeviceIdentity, DeviceError> {
        if let Some(device) = &self.device {
            return Ok(read_identity(device));
        }

        info!("[HID] Opening HID device {:04X}:{:04X}...", VENDOR_ID, PRODUCT_ID);
        let device = self
            .api
            .open(VENDOR_ID, PRODUCT_ID)
            .map_err(|e| DeviceError::DeviceNotFound {
                vendor_id: VENDOR_ID,
                product_id: PRODUCT_ID,
                reason: e.to_string(),
            })?;

        let identity = read_identity(&device);
        if identity.vendor_id != VENDOR_ID || identity.product_id != PRODUCT_ID {
            return Err(DeviceError::IdentityMismatch {
                found_vendor: identity.vendor_id,
                found_product: identity.product_id,
            });
        }

        // Blocking mode; read_timeout bounds each read.
        if let Err(e) = device.set_blocking_mode(true) {
            debug!("[HID] Could not set blocking mode: {e}");
        }

        info!(
            "[HID] Connected: {} ({})",
            identity.product.as_deref().unwrap_or("MJC3"),
            identity.serial_number.as_deref().unwrap_or("no serial")
        );
        self.device = Some(device);
        Ok(identity)
    }

    /// Connection state and identity. Never fails; a missing device reports
    /// `connected: false`.
    pub fn info(&mut self) -> NativeInfo {
        match self.open() {
            Ok(identity) => NativeInfo {
                connected: true,
                identity: Some(identity),
            },
            Err(e) => {
                info!("[HID] Not connected: {e}");
                NativeInfo::default()
            }
        }
    }

    /// Read one raw report. `Ok(None)` on timeout or a short report.
    pub fn read(&mut self, timeout_ms: u32) -> Result<Option<[u8; REPORT_SIZE]>, ReadError> {
        let device = self.device.as_ref().ok_or(ReadError::NotConnected)?;

        let mut buf = [0u8; 64];
        let timeout = i32::try_from(timeout_ms).unwrap_or(i32::MAX);
        match device.read_timeout(&mut buf, timeout) {
            Ok(0) => Ok(None),
            Ok(n) if n < REPORT_SIZE => {
                warn!("[HID] Short read: {n} bytes");
                Ok(None)
            }
            Ok(_) => {
                let mut report = [0u8; REPORT_SIZE];
                report.copy_from_slice(&buf[..REPORT_SIZE]);
                Ok(Some(report))
            }
            Err(e) => Err(ReadError::Transport(e.to_string())),
        }
    }

    /// Close the device handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.device.take().is_some() {
            info!("[HID] Device closed");
        }
    }

    /// Run one named operation.
    pub fn dispatch(&mut self, command: NativeCommand) -> Result<NativeReply, ReadError> {
        Ok(match command {
            NativeCommand::Test => NativeReply::Test { ok: self.test() },
            NativeCommand::Info => NativeReply::Info(self.info()),
            NativeCommand::Read { timeout_ms } => {
                if !self.is_open() {
                    // Opening on demand, as `info` does.
                    self.open().map_err(|e| {
                        warn!("[HID] Read: {e}");
                        ReadError::Transport(e.to_string())
                    })?;
                }
                NativeReply::Read {
                    report: self.read(timeout_ms)?,
                }
            }
            NativeCommand::Close => {
                self.close();
                NativeReply::Close
            }
        })
    }
}

impl Drop for HidAccess {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_identity(device: &HidDevice) -> DeviceIdentity {
    let (vendor_id, product_id) = match device.get_device_info() {
        Ok(info) => (info.vendor_id(), info.product_id()),
        Err(e) => {
            debug!("[HID] Device info unavailable: {e}");
            (VENDOR_ID, PRODUCT_ID)
        }
    };
    DeviceIdentity {
        vendor_id,
        product_id,
        manufacturer: device.get_manufacturer_string().ok().flatten(),
        product: device.get_product_string().ok().flatten(),
        serial_number: device.get_serial_number_string().ok().flatten(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("test".parse::<NativeCommand>(), Ok(NativeCommand::Test));
        assert_eq!("info".parse::<NativeCommand>(), Ok(NativeCommand::Info));
        assert_eq!("close".parse::<NativeCommand>(), Ok(NativeCommand::Close));
        assert_eq!(
            "read".parse::<NativeCommand>(),
            Ok(NativeCommand::Read {
                timeout_ms: DEFAULT_READ_TIMEOUT_MS
            })
        );
    }

    #[test]
    fn test_unknown_command_lists_valid_ones() {
        let err = "open".parse::<NativeCommand>().unwrap_err();
        assert!(err.contains("'read', 'info', 'test', 'close'"), "{err}");
    }

    #[test]
    fn test_disconnected_info_serializes() {
        let reply = NativeReply::Info(NativeInfo::default());
        let json: serde_json::Value = serde_json::from_str(&reply.to_string()).unwrap();
        assert_eq!(json["command"], "info");
        assert_eq!(json["connected"], false);
    }

    #[test]
    fn test_read_without_device_reports_open_failure() {
        // Needs a working HID layer and no MJC3 attached.
        let Ok(mut access) = HidAccess::load() else {
            return;
        };
        if access.info().connected {
            return;
        }
        let err = access
            .dispatch(NativeCommand::Read { timeout_ms: 1 })
            .unwrap_err();
        assert!(matches!(err, ReadError::Transport(_)));
        assert!(err.to_string().contains("1313:9000"), "{err}");
    }

    #[test]
    fn test_read_reply_serializes_report() {
        let reply = NativeReply::Read {
            report: Some([1, 2, 3, 0, 255]),
        };
        let json: serde_json::Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["report"], serde_json::json!([1, 2, 3, 0, 255]));
    }
}
