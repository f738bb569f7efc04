//! Fixed-rate polling: one frame per tick, calibrated into stage moves.
//!
//! Runs on a dedicated OS thread per controller because HID reads block
//! (with a timeout). Ticks of one controller never overlap: a tick that
//! overruns its slot makes the loop skip the missed slots.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::axis::{Axis, AxisMap};
use crate::calibration::CalibrationEngine;
use crate::device::FrameSource;
use crate::error::ReadError;
use crate::frame::RawFrame;
use crate::stage::StageAdapter;

/// Minimum calibrated deflection for an axis to count as active.
pub const MOTION_THRESHOLD: f64 = 0.01;

/// Minimum |delta| (um) worth sending to the stage.
pub const MIN_MOVE_UM: f64 = 0.01;

/// Tick timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub interval: Duration,
    /// Upper bound on the blocking read inside one tick.
    pub read_timeout: Duration,
}

impl Default for PollingConfig {
    /// 50 Hz.
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(20),
            read_timeout: Duration::from_millis(10),
        }
    }
}

impl PollingConfig {
    /// 20 Hz timing of the older polling path.
    pub fn legacy() -> Self {
        Self {
            interval: Duration::from_millis(50),
            read_timeout: Duration::from_millis(25),
        }
    }

    pub fn rate_hz(&self) -> f64 {
        1.0 / self.interval.as_secs_f64()
    }
}

/// Everything a tick reads but never writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSettings {
    pub calibration: CalibrationEngine,
    /// Microns per unit of full-scale deflection.
    pub step_factors: AxisMap<f64>,
}

impl MotionSettings {
    pub fn new(step_factor: f64) -> Self {
        Self {
            calibration: CalibrationEngine::new(),
            step_factors: AxisMap::splat(step_factor),
        }
    }
}

/// Moves issued or failed while processing one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveSummary {
    pub issued: u32,
    pub failed: u32,
}

/// Per-axis edge detection and smoothing state. Owned by one controller.
#[derive(Debug, Clone, Default)]
pub struct MotionEngine {
    /// Raw value of the last move per axis; `None` once back near center.
    last_raw: AxisMap<Option<i8>>,
    smoothed: AxisMap<f64>,
}

impl MotionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_raw(&self) -> AxisMap<Option<i8>> {
        self.last_raw
    }

    /// Turn one frame into at most one move per axis, in X, Y, Z order.
    pub fn process(
        &mut self,
        frame: &RawFrame,
        settings: &MotionSettings,
        stage: &dyn StageAdapter,
    ) -> MoveSummary {
        let speed_factor = frame.speed_factor();
        let mut summary = MoveSummary::default();

        for axis in Axis::ALL {
            let raw = frame.raw(axis);
            let profile = settings.calibration.profile(axis);
            let calibrated = self.smooth(axis, profile.apply(raw), profile.damping);

            if calibrated.abs() > MOTION_THRESHOLD && self.last_raw[axis] != Some(raw) {
                let delta = calibrated * settings.step_factors[axis] * speed_factor;
                if delta.abs() > MIN_MOVE_UM {
                    if stage.relative_move(axis, delta) {
                        summary.issued += 1;
                    } else {
                        warn!("[JOY] Stage move failed: {axis} {delta:+.3} um");
                        summary.failed += 1;
                    }
                }
                // After the move attempt, whether or not it succeeded.
                self.last_raw[axis] = Some(raw);
            } else if calibrated.abs() <= MOTION_THRESHOLD {
                // Re-arm once the control is back near center.
                self.last_raw[axis] = None;
            }
        }

        summary
    }

    /// Exponential smoothing; a zero target snaps straight to zero.
    fn smooth(&mut self, axis: Axis, target: f64, damping: f64) -> f64 {
        let value = if target == 0.0 || damping <= 0.0 {
            target
        } else {
            damping * self.smoothed[axis] + (1.0 - damping) * target
        };
        self.smoothed[axis] = value;
        value
    }
}

/// Result of one successful tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Read timed out; nothing to do.
    NoFrame,
    Processed(MoveSummary),
}

/// What the fault path decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    Reconnected,
    Stopped,
}

/// Tick logic for one controller.
#[derive(Debug, Clone)]
pub struct Poller {
    config: PollingConfig,
    motion: MotionEngine,
    /// One reconnect is allowed per run of consecutive read faults.
    reconnect_armed: bool,
}

impl Poller {
    pub fn new(config: PollingConfig) -> Self {
        Self {
            config,
            motion: MotionEngine::new(),
            reconnect_armed: true,
        }
    }

    /// Read one frame and dispatch its moves. `Err` only on a transport fault,
    /// in which case the stage is not touched.
    pub fn tick(
        &mut self,
        source: &mut dyn FrameSource,
        settings: &MotionSettings,
        stage: &dyn StageAdapter,
    ) -> Result<TickOutcome, ReadError> {
        let frame = source.read_frame(self.config.read_timeout)?;
        self.reconnect_armed = true;

        Ok(match frame {
            None => TickOutcome::NoFrame,
            Some(frame) => TickOutcome::Processed(self.motion.process(&frame, settings, stage)),
        })
    }

    /// Fault path: exactly one reconnect attempt, then give up.
    pub fn recover(&mut self, source: &mut dyn FrameSource, fault: &ReadError) -> FaultResolution {
        if !self.reconnect_armed {
            error!("[JOY] Read fault after reconnect: {fault}. Stopping.");
            return FaultResolution::Stopped;
        }
        self.reconnect_armed = false;

        warn!("[JOY] Read fault: {fault}. Attempting reconnect...");
        match source.connect() {
            Ok(_) => {
                info!("[JOY] Reconnected");
                FaultResolution::Reconnected
            }
            Err(e) => {
                error!("[JOY] Reconnect failed: {e}. Stopping.");
                FaultResolution::Stopped
            }
        }
    }
}

/// Counters exposed through the controller state snapshot.
#[derive(Debug, Default)]
pub(crate) struct PollStats {
    pub ticks: AtomicU64,
    pub moves_issued: AtomicU64,
    pub moves_failed: AtomicU64,
    pub read_faults: AtomicU64,
}

/// State shared between a controller and its polling thread.
pub(crate) struct Shared {
    pub running: AtomicBool,
    pub connected: AtomicBool,
    pub settings: RwLock<MotionSettings>,
    pub stats: PollStats,
}

impl Shared {
    pub fn new(settings: MotionSettings) -> Self {
        Self {
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            settings: RwLock::new(settings),
            stats: PollStats::default(),
        }
    }

    fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

pub(crate) type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// Polling thread body. Returns the poller so edge-detector state survives
/// a stop/start cycle.
pub(crate) fn run(
    mut poller: Poller,
    shared: Arc<Shared>,
    source: SharedSource,
    stage: Arc<dyn StageAdapter>,
) -> Poller {
    let interval = poller.config.interval;
    info!("[JOY] Polling started at {:.0} Hz", poller.config.rate_hz());

    let mut next_tick = Instant::now();
    while shared.running.load(Ordering::SeqCst) {
        let settings = match shared.settings.read() {
            Ok(settings) => *settings,
            Err(_) => {
                error!("[JOY] Scheduler fault: settings lock poisoned");
                shared.halt();
                break;
            }
        };

        let Ok(mut guard) = source.lock() else {
            error!("[JOY] Scheduler fault: device lock poisoned");
            shared.halt();
            break;
        };
        // stop() may have landed while waiting for the lock.
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        shared.stats.ticks.fetch_add(1, Ordering::Relaxed);
        match poller.tick(&mut **guard, &settings, stage.as_ref()) {
            Ok(TickOutcome::Processed(summary)) => {
                shared
                    .stats
                    .moves_issued
                    .fetch_add(summary.issued as u64, Ordering::Relaxed);
                shared
                    .stats
                    .moves_failed
                    .fetch_add(summary.failed as u64, Ordering::Relaxed);
            }
            Ok(TickOutcome::NoFrame) => {}
            Err(fault) => {
                shared.stats.read_faults.fetch_add(1, Ordering::Relaxed);
                match poller.recover(&mut **guard, &fault) {
                    FaultResolution::Reconnected => {
                        shared.connected.store(true, Ordering::SeqCst);
                    }
                    FaultResolution::Stopped => {
                        shared.halt();
                        break;
                    }
                }
            }
        }
        drop(guard);

        next_tick += interval;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else {
            let behind = now - next_tick;
            if behind >= interval {
                debug!("[JOY] Tick overran by {behind:?}; skipping missed ticks");
            }
            next_tick = now;
        }
    }

    info!("[JOY] Polling stopped");
    poller
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::device::{private, ControllerKind, DeviceIdentity, FrameSource};
    use crate::error::{DeviceError, ReadError};
    use crate::frame::RawFrame;

    /// Scripted read results for driving ticks in tests.
    pub enum Scripted {
        Frame(RawFrame),
        Timeout,
        Fault,
    }

    /// Frame source that replays a script; an exhausted script times out.
    pub struct ScriptedSource {
        pub script: VecDeque<Scripted>,
        pub connect_ok: bool,
        pub connects: Arc<AtomicU32>,
        pub disposals: Arc<AtomicU32>,
        connected: bool,
    }

    impl ScriptedSource {
        pub fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: script.into(),
                connect_ok: true,
                connects: Arc::new(AtomicU32::new(0)),
                disposals: Arc::new(AtomicU32::new(0)),
                connected: false,
            }
        }
    }

    impl private::Sealed for ScriptedSource {}

    impl FrameSource for ScriptedSource {
        fn kind(&self) -> ControllerKind {
            ControllerKind::Hid
        }

        fn connect(&mut self) -> Result<DeviceIdentity, DeviceError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected = self.connect_ok;
            if self.connect_ok {
                Ok(DeviceIdentity::default())
            } else {
                Err(DeviceError::DeviceNotFound {
                    vendor_id: 0,
                    product_id: 0,
                    reason: "scripted".into(),
                })
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn read_frame(&mut self, _timeout: Duration) -> Result<Option<RawFrame>, ReadError> {
            match self.script.pop_front() {
                Some(Scripted::Frame(frame)) => Ok(Some(frame)),
                Some(Scripted::Fault) => {
                    self.connected = false;
                    Err(ReadError::Transport("scripted fault".into()))
                }
                Some(Scripted::Timeout) | None => Ok(None),
            }
        }

        fn dispose(&mut self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
            self.connected = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::{Scripted, ScriptedSource};
    use super::*;
    use crate::calibration::ManualCalibration;
    use crate::stage::testing::RecordingStage;

    fn frame(x: i8, y: i8, z: i8, speed: u8) -> RawFrame {
        RawFrame {
            x,
            y,
            z,
            button: 0,
            speed_knob: speed,
        }
    }

    #[test]
    fn test_deflection_issues_move() {
        let stage = RecordingStage::default();
        let settings = MotionSettings::new(5.0);
        let mut motion = MotionEngine::new();

        let summary = motion.process(&frame(0, 0, 64, 255), &settings, &stage);
        assert_eq!(summary, MoveSummary { issued: 1, failed: 0 });

        let moves = stage.moves();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].0, Axis::Z);
        assert!((moves[0].1 - 2.52).abs() < 0.01, "delta {}", moves[0].1);
        assert_eq!(motion.last_raw().z, Some(64));
    }

    #[test]
    fn test_center_resets_edge_detector() {
        let stage = RecordingStage::default();
        let settings = MotionSettings::new(5.0);
        let mut motion = MotionEngine::new();

        motion.process(&frame(0, 0, 64, 255), &settings, &stage);
        let summary = motion.process(&frame(0, 0, 0, 0), &settings, &stage);
        assert_eq!(summary.issued, 0);
        assert_eq!(motion.last_raw().z, None);
        assert_eq!(stage.moves().len(), 1);
    }

    #[test]
    fn test_held_value_moves_once_until_rearmed() {
        let stage = RecordingStage::default();
        let settings = MotionSettings::new(5.0);
        let mut motion = MotionEngine::new();

        for _ in 0..3 {
            motion.process(&frame(0, 0, 64, 255), &settings, &stage);
        }
        assert_eq!(stage.moves().len(), 1);

        // Back to center, then out again: triggers again.
        motion.process(&frame(0, 0, 0, 255), &settings, &stage);
        motion.process(&frame(0, 0, 64, 255), &settings, &stage);
        assert_eq!(stage.moves().len(), 2);

        // A different raw value while deflected also triggers.
        motion.process(&frame(0, 0, 70, 255), &settings, &stage);
        assert_eq!(stage.moves().len(), 3);
    }

    #[test]
    fn test_deadzone_return_rearms() {
        let stage = RecordingStage::default();
        let mut settings = MotionSettings::new(5.0);
        settings
            .calibration
            .set_manual(Axis::X, ManualCalibration::new(-100, 0, 100).deadzone(0.1))
            .unwrap();
        let mut motion = MotionEngine::new();

        motion.process(&frame(50, 0, 0, 255), &settings, &stage);
        // Inside the deadzone but not at center
        motion.process(&frame(5, 0, 0, 255), &settings, &stage);
        assert_eq!(motion.last_raw().x, None);
        motion.process(&frame(50, 0, 0, 255), &settings, &stage);
        assert_eq!(stage.moves().len(), 2);
    }

    #[test]
    fn test_raw_zero_off_center_triggers() {
        let stage = RecordingStage::default();
        let mut settings = MotionSettings::new(50.0);
        settings
            .calibration
            .set_manual(Axis::Z, ManualCalibration::new(-100, 10, 110))
            .unwrap();
        let mut motion = MotionEngine::new();

        // Resting at center 10, then raw 0 is a real deflection.
        motion.process(&frame(0, 0, 10, 255), &settings, &stage);
        assert!(stage.moves().is_empty());
        motion.process(&frame(0, 0, 0, 255), &settings, &stage);

        let moves = stage.moves();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].0, Axis::Z);
        assert!(moves[0].1 < 0.0);
        assert_eq!(motion.last_raw().z, Some(0));
    }

    #[test]
    fn test_small_delta_not_sent() {
        let stage = RecordingStage::default();
        // Tiny step factor: |delta| stays under the minimum move.
        let settings = MotionSettings::new(0.01);
        let mut motion = MotionEngine::new();

        let summary = motion.process(&frame(127, 0, 0, 255), &settings, &stage);
        assert_eq!(summary.issued, 0);
        assert!(stage.moves().is_empty());
        // Still counts as the axis having fired.
        assert_eq!(motion.last_raw().x, Some(127));
    }

    #[test]
    fn test_below_motion_threshold_not_sent() {
        let stage = RecordingStage::default();
        let settings = MotionSettings::new(1000.0);
        let mut motion = MotionEngine::new();

        // 1/127 = 0.0079, under the motion threshold despite a huge step factor.
        motion.process(&frame(1, 0, 0, 255), &settings, &stage);
        assert!(stage.moves().is_empty());
        assert_eq!(motion.last_raw().x, None);
    }

    #[test]
    fn test_speed_knob_floor_scales_delta() {
        let stage = RecordingStage::default();
        let settings = MotionSettings::new(10.0);
        let mut motion = MotionEngine::new();

        motion.process(&frame(127, 0, 0, 0), &settings, &stage);
        let moves = stage.moves();
        assert!((moves[0].1 - 1.0).abs() < 1e-9, "delta {}", moves[0].1);
    }

    #[test]
    fn test_axes_in_fixed_order() {
        let stage = RecordingStage::default();
        let settings = MotionSettings::new(5.0);
        let mut motion = MotionEngine::new();

        motion.process(&frame(-64, 64, 127, 255), &settings, &stage);
        let axes: Vec<Axis> = stage.moves().iter().map(|(a, _)| *a).collect();
        assert_eq!(axes, vec![Axis::X, Axis::Y, Axis::Z]);
        assert!(stage.moves()[0].1 < 0.0);
    }

    #[test]
    fn test_failed_move_still_updates_edge_state() {
        let stage = RecordingStage::default();
        stage.set_failing(true);
        let settings = MotionSettings::new(5.0);
        let mut motion = MotionEngine::new();

        let summary = motion.process(&frame(0, 80, 0, 255), &settings, &stage);
        assert_eq!(summary, MoveSummary { issued: 0, failed: 1 });
        assert_eq!(motion.last_raw().y, Some(80));
    }

    #[test]
    fn test_per_axis_step_factors() {
        let stage = RecordingStage::default();
        let mut settings = MotionSettings::new(5.0);
        settings.step_factors[Axis::Z] = 1.0;
        let mut motion = MotionEngine::new();

        motion.process(&frame(127, 0, 127, 255), &settings, &stage);
        let moves = stage.moves();
        assert!((moves[0].1 - 5.0).abs() < 1e-9);
        assert!((moves[1].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_damping_smooths_first_step() {
        let stage = RecordingStage::default();
        let mut settings = MotionSettings::new(10.0);
        settings
            .calibration
            .set_manual(Axis::X, ManualCalibration::new(-127, 0, 127).damping(0.5))
            .unwrap();
        let mut motion = MotionEngine::new();

        motion.process(&frame(127, 0, 0, 255), &settings, &stage);
        assert!((stage.moves()[0].1 - 5.0).abs() < 1e-9);

        // Returning to center snaps the smoother back to zero.
        motion.process(&frame(0, 0, 0, 255), &settings, &stage);
        motion.process(&frame(127, 0, 0, 255), &settings, &stage);
        assert!((stage.moves()[1].1 - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_timeout_is_not_a_fault() {
        let stage = RecordingStage::default();
        let settings = MotionSettings::new(5.0);
        let mut source = ScriptedSource::new(vec![Scripted::Timeout]);
        let mut poller = Poller::new(PollingConfig::default());

        let outcome = poller.tick(&mut source, &settings, &stage).unwrap();
        assert_eq!(outcome, TickOutcome::NoFrame);
        assert!(stage.moves().is_empty());
    }

    #[test]
    fn test_fault_does_not_move_stage() {
        let stage = RecordingStage::default();
        let settings = MotionSettings::new(5.0);
        let mut source = ScriptedSource::new(vec![Scripted::Fault]);
        let mut poller = Poller::new(PollingConfig::default());

        assert!(poller.tick(&mut source, &settings, &stage).is_err());
        assert!(stage.moves().is_empty());
    }

    #[test]
    fn test_two_consecutive_faults_reconnect_once_then_stop() {
        let stage = RecordingStage::default();
        let settings = MotionSettings::new(5.0);
        let mut source = ScriptedSource::new(vec![Scripted::Fault, Scripted::Fault]);
        let connects = source.connects.clone();
        let mut poller = Poller::new(PollingConfig::default());

        let fault = poller.tick(&mut source, &settings, &stage).unwrap_err();
        assert_eq!(poller.recover(&mut source, &fault), FaultResolution::Reconnected);

        let fault = poller.tick(&mut source, &settings, &stage).unwrap_err();
        assert_eq!(poller.recover(&mut source, &fault), FaultResolution::Stopped);

        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_reconnect_stops() {
        let mut source = ScriptedSource::new(vec![]);
        source.connect_ok = false;
        let mut poller = Poller::new(PollingConfig::default());

        let fault = ReadError::Transport("gone".into());
        assert_eq!(poller.recover(&mut source, &fault), FaultResolution::Stopped);
    }

    #[test]
    fn test_successful_read_rearms_reconnect() {
        let stage = RecordingStage::default();
        let settings = MotionSettings::new(5.0);
        let mut source = ScriptedSource::new(vec![
            Scripted::Fault,
            Scripted::Frame(RawFrame::neutral()),
            Scripted::Fault,
        ]);
        let mut poller = Poller::new(PollingConfig::default());

        let fault = poller.tick(&mut source, &settings, &stage).unwrap_err();
        assert_eq!(poller.recover(&mut source, &fault), FaultResolution::Reconnected);
        poller.tick(&mut source, &settings, &stage).unwrap();
        let fault = poller.tick(&mut source, &settings, &stage).unwrap_err();
        assert_eq!(poller.recover(&mut source, &fault), FaultResolution::Reconnected);
    }

    #[test]
    fn test_polling_rates() {
        assert_eq!(PollingConfig::default().rate_hz().round(), 50.0);
        assert_eq!(PollingConfig::legacy().rate_hz().round(), 20.0);
    }
}
