//! Controller selection with graceful fallback to the simulation kind.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::controller::JoystickController;
use crate::device::hid::HidReader;
use crate::device::native::{HidAccess, PRODUCT_ID, VENDOR_ID};
use crate::device::simulated::SimulatedReader;
use crate::device::{ControllerKind, FrameSource};
use crate::error::{ControllerError, DeviceError};
use crate::poller::PollingConfig;
use crate::stage::StageAdapter;

type Probe = Box<dyn Fn() -> Result<(), DeviceError> + Send + Sync>;
type Builder = Box<dyn Fn() -> Result<Box<dyn FrameSource>, DeviceError> + Send + Sync>;

/// One row of the availability listing.
#[derive(Debug, Clone, Serialize)]
pub struct KindAvailability {
    pub kind: ControllerKind,
    pub description: &'static str,
    pub available: bool,
}

pub struct ControllerFactory {
    hardware_probe: Probe,
    hardware_builder: Builder,
    config: PollingConfig,
}

impl Default for ControllerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerFactory {
    /// Factory backed by the native HID layer.
    pub fn new() -> Self {
        Self {
            hardware_probe: Box::new(|| HidAccess::load().map(|_| ())),
            hardware_builder: Box::new(open_hardware),
            config: PollingConfig::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_hardware(probe: Probe, builder: Builder) -> Self {
        Self {
            hardware_probe: probe,
            hardware_builder: builder,
            config: PollingConfig::default(),
        }
    }

    pub fn with_polling(mut self, config: PollingConfig) -> Self {
        self.config = config;
        self
    }

    /// Whether `kind` can currently be instantiated. Simulation always can.
    pub fn is_available(&self, kind: ControllerKind) -> bool {
        match kind {
            ControllerKind::Hid => match (self.hardware_probe)() {
                Ok(()) => true,
                Err(e) => {
                    info!("[FACTORY] {kind} unavailable: {e}");
                    false
                }
            },
            ControllerKind::Simulation => true,
        }
    }

    /// Viable kinds in preference order. Never empty.
    pub fn available_kinds(&self) -> Vec<ControllerKind> {
        ControllerKind::PREFERENCE
            .into_iter()
            .filter(|kind| self.is_available(*kind))
            .collect()
    }

    /// Every known kind with its availability, logged as a table.
    pub fn list_available_kinds(&self) -> Vec<KindAvailability> {
        let rows: Vec<KindAvailability> = ControllerKind::PREFERENCE
            .into_iter()
            .map(|kind| KindAvailability {
                kind,
                description: kind.description(),
                available: self.is_available(kind),
            })
            .collect();
        for row in &rows {
            info!(
                "[FACTORY] {:<12} {:<10} {}",
                row.kind.as_str(),
                if row.available { "available" } else { "missing" },
                row.description
            );
        }
        rows
    }

    /// Instantiate, connect and dispose `kind`. True if all of that worked.
    pub fn test_controller(&self, kind: ControllerKind) -> bool {
        let mut source = match self.instantiate(kind) {
            Ok(source) => source,
            Err(e) => {
                warn!("[FACTORY] {kind} test failed: {e}");
                return false;
            }
        };
        let result = source.connect();
        source.dispose();
        match result {
            Ok(identity) => {
                info!(
                    "[FACTORY] {kind} test passed ({})",
                    identity.product.as_deref().unwrap_or("unnamed device")
                );
                true
            }
            Err(e) => {
                warn!("[FACTORY] {kind} test failed: {e}");
                false
            }
        }
    }

    /// Build a controller, preferring `preferred` if it is viable.
    ///
    /// If the selected hardware kind fails to instantiate, falls back to the
    /// simulation kind so the caller always gets a working controller.
    pub fn create_controller(
        &self,
        stage: Arc<dyn StageAdapter>,
        step_factor: f64,
        preferred: Option<ControllerKind>,
    ) -> Result<JoystickController, ControllerError> {
        let available = self.available_kinds();
        let first = available
            .first()
            .copied()
            .unwrap_or(ControllerKind::Simulation);

        let selected = match preferred {
            Some(kind) if available.contains(&kind) => kind,
            Some(kind) => {
                warn!("[FACTORY] Preferred kind {kind} not available; using {first}");
                first
            }
            None => first,
        };

        let source = match self.instantiate(selected) {
            Ok(source) => source,
            Err(e) if selected != ControllerKind::Simulation => {
                warn!("[FACTORY] {selected} failed to start ({e}); falling back to simulation");
                self.instantiate(ControllerKind::Simulation)?
            }
            Err(e) => return Err(e.into()),
        };

        let controller = JoystickController::new(source, stage, step_factor, self.config)?;
        info!(
            "[FACTORY] Using {} controller, step factor {step_factor} um",
            controller.kind()
        );
        Ok(controller)
    }

    fn instantiate(&self, kind: ControllerKind) -> Result<Box<dyn FrameSource>, DeviceError> {
        match kind {
            ControllerKind::Hid => (self.hardware_builder)(),
            ControllerKind::Simulation => Ok(Box::new(SimulatedReader::new())),
        }
    }
}

/// Load the HID layer and require an attached MJC3. Presence comes from
/// `info`, which reports a missing device as `connected: false`.
fn open_hardware() -> Result<Box<dyn FrameSource>, DeviceError> {
    let mut reader = HidReader::new()?;
    if !reader.info().connected {
        return Err(DeviceError::DeviceNotFound {
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
            reason: "native info reports not connected".to_string(),
        });
    }
    Ok(Box::new(reader))
}
