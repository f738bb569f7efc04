//! Stage adapter contract and a dry-run implementation.

use std::sync::Mutex;

use tracing::info;

use crate::axis::{Axis, AxisMap};

/// Performs the physical relative move for one axis.
///
/// Implementations may block briefly; the poller calls them synchronously.
pub trait StageAdapter: Send + Sync {
    /// Move `axis` by `distance_um` microns. Returns false if the move failed.
    fn relative_move(&self, axis: Axis, distance_um: f64) -> bool;
}

/// Accumulates commanded positions instead of moving hardware.
#[derive(Debug, Default)]
pub struct DryRunStage {
    position: Mutex<AxisMap<f64>>,
}

impl DryRunStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> AxisMap<f64> {
        match self.position.lock() {
            Ok(position) => *position,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl StageAdapter for DryRunStage {
    fn relative_move(&self, axis: Axis, distance_um: f64) -> bool {
        let Ok(mut position) = self.position.lock() else {
            return false;
        };
        position[axis] += distance_um;
        info!(
            "[STAGE] {axis} {distance_um:+.2} um -> {:.2} um",
            position[axis]
        );
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_accumulates() {
        let stage = DryRunStage::new();
        assert!(stage.relative_move(Axis::Z, 2.5));
        assert!(stage.relative_move(Axis::Z, -1.0));
        assert!(stage.relative_move(Axis::X, 4.0));
        let pos = stage.position();
        assert!((pos.z - 1.5).abs() < 1e-12);
        assert!((pos.x - 4.0).abs() < 1e-12);
        assert_eq!(pos.y, 0.0);
    }
}
