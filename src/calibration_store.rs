//! Calibration profiles on disk (JSON).
//!
//! Format:
//!   { "version": 1, "axes": { "x": { "calibrated": bool, "profile": {...} }, "y": ..., "z": ... } }

use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::axis::{Axis, AxisMap};
use crate::calibration::{AxisCalibration, CalibrationEngine};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct StoredAxis {
    calibrated: bool,
    profile: AxisCalibration,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredProfiles {
    version: u32,
    axes: AxisMap<StoredAxis>,
}

pub fn save(path: &Path, calibration: &CalibrationEngine) -> anyhow::Result<()> {
    let stored_axis = |axis: Axis| StoredAxis {
        calibrated: calibration.is_calibrated(axis),
        profile: *calibration.profile(axis),
    };
    let stored = StoredProfiles {
        version: FORMAT_VERSION,
        axes: AxisMap::new(stored_axis(Axis::X), stored_axis(Axis::Y), stored_axis(Axis::Z)),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let data = serde_json::to_string_pretty(&stored)?;
    fs::write(path, data).with_context(|| format!("writing {}", path.display()))?;
    info!("[CAL] Saved calibration to {}", path.display());
    Ok(())
}

/// Load and validate profiles. Every axis must pass the manual-calibration rules.
pub fn load(path: &Path) -> anyhow::Result<CalibrationEngine> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let stored: StoredProfiles =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    if stored.version != FORMAT_VERSION {
        bail!(
            "unsupported calibration format version {} in {}",
            stored.version,
            path.display()
        );
    }

    let mut calibration = CalibrationEngine::new();
    for (axis, entry) in stored.axes.iter() {
        calibration.restore(axis, entry.profile, entry.calibrated)?;
    }
    info!("[CAL] Loaded calibration from {}", path.display());
    Ok(calibration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::ManualCalibration;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles").join("joystick.json");

        let mut calibration = CalibrationEngine::new();
        calibration
            .set_manual(
                Axis::Z,
                ManualCalibration::new(-100, 10, 110).deadzone(0.05).invert(true),
            )
            .unwrap();
        save(&path, &calibration).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, calibration);
        assert!(loaded.is_calibrated(Axis::Z));
        assert!(!loaded.is_calibrated(Axis::X));
    }

    #[test]
    fn test_load_rejects_invalid_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");

        let mut json = serde_json::to_value(StoredProfiles {
            version: FORMAT_VERSION,
            axes: AxisMap::splat(StoredAxis {
                calibrated: false,
                profile: AxisCalibration::identity(),
            }),
        })
        .unwrap();
        json["axes"]["y"]["profile"]["center"] = serde_json::json!(200);
        fs::write(&path, json.to_string()).unwrap();

        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("axis Y"), "{err}");
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.json");
        let json = serde_json::json!({ "version": 99, "axes": {} });
        fs::write(&path, json.to_string()).unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.json")).is_err());
    }
}
