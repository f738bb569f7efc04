//! Caller-facing joystick controller.
//!
//! Owns one frame source and drives it from its own polling thread.
//! `stop()` keeps calibration and edge state; `dispose()` releases the
//! device for good.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::axis::{Axis, AxisMap};
use crate::calibration::{AxisCalibration, CalibrationEngine, CalibrationStatus, ManualCalibration};
use crate::device::{ControllerKind, DeviceIdentity, FrameSource, SimulatedKeypad};
use crate::error::{CalibrationError, ControllerError};
use crate::poller::{self, MotionSettings, Poller, PollingConfig, Shared, SharedSource};
use crate::stage::StageAdapter;

/// Read attempts allowed per requested sample during a capture.
const CAPTURE_ATTEMPTS_PER_SAMPLE: usize = 4;

/// Largest capture accepted; 200 s of sweeping at 50 Hz.
pub const MAX_CAPTURE_SAMPLES: usize = 10_000;

/// Diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerState {
    pub kind: ControllerKind,
    pub running: bool,
    pub connected: bool,
    pub step_factors: AxisMap<f64>,
    pub ticks: u64,
    pub moves_issued: u64,
    pub moves_failed: u64,
    pub read_faults: u64,
}

pub struct JoystickController {
    kind: ControllerKind,
    source: SharedSource,
    stage: Arc<dyn StageAdapter>,
    shared: Arc<Shared>,
    config: PollingConfig,
    worker: Option<JoinHandle<Poller>>,
    /// Present whenever the polling thread is not holding it.
    poller: Option<Poller>,
    keypad: Option<SimulatedKeypad>,
    disposed: bool,
}

impl JoystickController {
    pub fn new(
        source: Box<dyn FrameSource>,
        stage: Arc<dyn StageAdapter>,
        step_factor: f64,
        config: PollingConfig,
    ) -> Result<Self, ControllerError> {
        validate_step_factor(step_factor)?;
        let kind = source.kind();
        let keypad = source.keypad();
        let connected = source.is_connected();

        let shared = Arc::new(Shared::new(MotionSettings::new(step_factor)));
        shared.connected.store(connected, Ordering::SeqCst);

        Ok(Self {
            kind,
            source: Arc::new(Mutex::new(source)),
            stage,
            shared,
            config,
            worker: None,
            poller: Some(Poller::new(config)),
            keypad,
            disposed: false,
        })
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    /// Keypad handle when this is a simulation controller.
    pub fn keypad(&self) -> Option<SimulatedKeypad> {
        self.keypad.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Connect the source without starting the polling loop.
    pub fn connect(&mut self) -> Result<DeviceIdentity, ControllerError> {
        if self.disposed {
            return Err(ControllerError::Disposed);
        }
        let result = lock_source(&self.source).connect();
        self.shared.connected.store(result.is_ok(), Ordering::SeqCst);
        Ok(result?)
    }

    /// Connect (or reconnect) and start polling. A no-op while already running.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.disposed {
            return Err(ControllerError::Disposed);
        }
        if self.is_running() {
            return Ok(());
        }
        // A loop that stopped itself after a fault still has a handle to reap.
        self.reap_worker();

        let identity = self.connect()?;
        info!(
            "[JOY] Starting {} controller ({})",
            self.kind,
            identity.product.as_deref().unwrap_or("unknown device")
        );

        let poller = self.poller.take().unwrap_or_else(|| Poller::new(self.config));
        let shared = Arc::clone(&self.shared);
        let source = Arc::clone(&self.source);
        let stage = Arc::clone(&self.stage);

        shared.running.store(true, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(format!("joystick-{}", self.kind))
            .spawn(move || poller::run(poller, shared, source, stage));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("[JOY] Scheduler fault: could not spawn polling thread: {e}");
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.connected.store(false, Ordering::SeqCst);
                self.poller = Some(Poller::new(self.config));
                Err(ControllerError::SchedulerFault(e.to_string()))
            }
        }
    }

    /// Stop polling. Returns once the in-flight tick (if any) has finished.
    pub fn stop(&mut self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!("[JOY] Stopping {} controller", self.kind);
        }
        self.reap_worker();
    }

    fn reap_worker(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        match handle.join() {
            Ok(poller) => self.poller = Some(poller),
            Err(_) => {
                error!("[JOY] Scheduler fault: polling thread panicked");
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.connected.store(false, Ordering::SeqCst);
                self.poller = Some(Poller::new(self.config));
            }
        }
    }

    /// Set the step factor (um per full deflection) for one axis, or all of them.
    pub fn set_step_factor(&self, axis: Option<Axis>, value: f64) -> Result<(), ControllerError> {
        validate_step_factor(value)?;
        let mut settings = self.settings_mut()?;
        match axis {
            Some(axis) => settings.step_factors[axis] = value,
            None => settings.step_factors = AxisMap::splat(value),
        }
        info!(
            "[JOY] Step factor {} = {value} um",
            axis.map_or("all axes", Axis::as_str)
        );
        Ok(())
    }

    pub fn step_factors(&self) -> AxisMap<f64> {
        self.settings().step_factors
    }

    /// Capture `sample_count` readings while the operator sweeps `axis` through
    /// its full range, then install the derived profile.
    ///
    /// Rejected while polling is active: the capture needs the device to itself.
    pub fn calibrate_axis(
        &mut self,
        axis: Axis,
        sample_count: usize,
    ) -> Result<AxisCalibration, ControllerError> {
        if self.disposed {
            return Err(ControllerError::Disposed);
        }
        if self.is_running() {
            return Err(CalibrationError::PollingActive.into());
        }
        if sample_count == 0 {
            return Err(CalibrationError::NoSamples { axis }.into());
        }
        if sample_count > MAX_CAPTURE_SAMPLES {
            return Err(CalibrationError::InvalidParameter {
                axis,
                name: "sample count",
                value: sample_count as f64,
            }
            .into());
        }

        let samples = self.capture_samples(axis, sample_count)?;
        let profile = self.settings_mut()?.calibration.apply_capture(axis, &samples)?;
        info!(
            "[CAL] {axis} calibrated from {} samples: {} / {} / {}",
            samples.len(),
            profile.negative_extent,
            profile.center,
            profile.positive_extent
        );
        Ok(profile)
    }

    fn capture_samples(&mut self, axis: Axis, sample_count: usize) -> Result<Vec<i8>, ControllerError> {
        let mut source = lock_source(&self.source);
        if !source.is_connected() {
            source
                .connect()
                .map_err(|e| CalibrationError::Device(e.to_string()))?;
            self.shared.connected.store(true, Ordering::SeqCst);
        }

        info!("[CAL] Capturing {sample_count} samples on {axis}; sweep the axis through its full range");
        let started = Instant::now();
        let mut samples = Vec::with_capacity(sample_count);
        for _ in 0..sample_count.saturating_mul(CAPTURE_ATTEMPTS_PER_SAMPLE) {
            if samples.len() == sample_count {
                break;
            }
            match source.read_frame(self.config.interval) {
                Ok(Some(frame)) => samples.push(frame.raw(axis)),
                Ok(None) => {}
                Err(e) => {
                    self.shared.connected.store(false, Ordering::SeqCst);
                    return Err(CalibrationError::Device(e.to_string()).into());
                }
            }
        }

        if samples.len() < sample_count {
            warn!(
                "[CAL] Only {}/{sample_count} samples captured in {:?}",
                samples.len(),
                started.elapsed()
            );
        }
        Ok(samples)
    }

    pub fn set_manual_calibration(
        &self,
        axis: Axis,
        manual: ManualCalibration,
    ) -> Result<(), ControllerError> {
        self.settings_mut()?.calibration.set_manual(axis, manual)?;
        info!(
            "[CAL] {axis} set manually: {} / {} / {}",
            manual.negative, manual.center, manual.positive
        );
        Ok(())
    }

    /// Install a full set of profiles, e.g. loaded from disk.
    pub fn restore_calibration(&self, calibration: CalibrationEngine) -> Result<(), ControllerError> {
        self.settings_mut()?.calibration = calibration;
        Ok(())
    }

    pub fn calibration(&self) -> CalibrationEngine {
        self.settings().calibration
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.settings().calibration.status()
    }

    pub fn state(&self) -> ControllerState {
        let stats = &self.shared.stats;
        ControllerState {
            kind: self.kind,
            running: self.is_running(),
            connected: self.is_connected(),
            step_factors: self.step_factors(),
            ticks: stats.ticks.load(Ordering::Relaxed),
            moves_issued: stats.moves_issued.load(Ordering::Relaxed),
            moves_failed: stats.moves_failed.load(Ordering::Relaxed),
            read_faults: stats.read_faults.load(Ordering::Relaxed),
        }
    }

    /// Stop polling and release the device. The controller cannot be restarted.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.stop();
        lock_source(&self.source).dispose();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.disposed = true;
        info!("[JOY] {} controller disposed", self.kind);
    }

    fn settings(&self) -> MotionSettings {
        match self.shared.settings.read() {
            Ok(settings) => *settings,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn settings_mut(&self) -> Result<std::sync::RwLockWriteGuard<'_, MotionSettings>, ControllerError> {
        self.shared
            .settings
            .write()
            .map_err(|_| ControllerError::SchedulerFault("settings lock poisoned".to_string()))
    }
}

impl Drop for JoystickController {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn validate_step_factor(value: f64) -> Result<(), ControllerError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ControllerError::InvalidStepFactor(value))
    }
}

/// The source must stay reachable for release even if a tick panicked.
fn lock_source(source: &SharedSource) -> MutexGuard<'_, Box<dyn FrameSource>> {
    match source.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
