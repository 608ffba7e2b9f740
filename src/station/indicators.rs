//! Status lamps and range-meter laser.
//!
//! | status            | relay 2 | relay 3 | relay 4 | laser |
//! |-------------------|---------|---------|---------|-------|
//! | ready             | off     | on      | on      | on    |
//! | pending / running | on      | off     | on      | off   |
//! | finished          | on      | off     | on      | on    |
//! | error             | on      | on      | off     | on    |

use tracing::debug;

use crate::devices::DeviceSet;
use crate::result::CalculationStatus;

/// Lamp pattern shown for a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampPattern {
    /// Station ready for the next object
    Ready,
    /// Measurement pending or running
    Measuring,
    /// Measurement finished
    Finished,
    /// Measurement failed
    Error,
}

impl LampPattern {
    /// Pattern for `status`.
    pub fn for_status(status: CalculationStatus) -> Self {
        match status {
            CalculationStatus::Undefined => LampPattern::Ready,
            CalculationStatus::Pending | CalculationStatus::InProgress => LampPattern::Measuring,
            CalculationStatus::Successful => LampPattern::Finished,
            _ => LampPattern::Error,
        }
    }

    /// `(relay, on)` states.
    pub fn relays(self) -> [(u32, bool); 3] {
        match self {
            LampPattern::Ready => [(2, false), (3, true), (4, true)],
            LampPattern::Measuring | LampPattern::Finished => [(2, true), (3, false), (4, true)],
            LampPattern::Error => [(2, true), (3, true), (4, false)],
        }
    }

    /// Whether the range-meter laser stays on.
    pub fn laser_on(self) -> bool {
        !matches!(self, LampPattern::Measuring)
    }
}

/// Show `status` on the I/O board lamps and the range-meter laser.
pub fn indicate_status(devices: &DeviceSet, status: CalculationStatus) {
    let pattern = LampPattern::for_status(status);
    debug!(?status, ?pattern, "Updating status indicators");

    if let Some(meter) = &devices.range_meter {
        meter.toggle_laser(pattern.laser_on());
    }
    if let Some(circuit) = &devices.io_circuit {
        for (relay, on) in pattern.relays() {
            circuit.toggle_relay(relay, on);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{FakeFrameProvider, FakeSceneConfig, IoCircuit};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingCircuit {
        relays: Mutex<Vec<(u32, bool)>>,
    }

    #[async_trait]
    impl IoCircuit for RecordingCircuit {
        fn toggle_relay(&self, relay: u32, on: bool) {
            self.relays.lock().push((relay, on));
        }

        async fn poll_line(&self, _line: usize) -> i32 {
            0
        }

        async fn shutdown(&self) {}
    }

    #[test]
    fn test_patterns() {
        assert_eq!(
            LampPattern::for_status(CalculationStatus::InProgress),
            LampPattern::Measuring
        );
        assert_eq!(
            LampPattern::for_status(CalculationStatus::TimedOut),
            LampPattern::Error
        );
        assert!(!LampPattern::Measuring.laser_on());
        assert!(LampPattern::Error.laser_on());
    }

    #[tokio::test]
    async fn test_indicate_status_switches_relays() {
        let circuit = Arc::new(RecordingCircuit::default());
        let provider = Arc::new(FakeFrameProvider::new(FakeSceneConfig::default()));
        let devices = DeviceSet::new(provider).with_io_circuit(circuit.clone());

        indicate_status(&devices, CalculationStatus::Undefined);
        indicate_status(&devices, CalculationStatus::WeightNotStable);
        assert_eq!(
            *circuit.relays.lock(),
            vec![(2, false), (3, true), (4, true), (2, true), (3, true), (4, false)]
        );
        devices.shutdown().await;
    }
}
