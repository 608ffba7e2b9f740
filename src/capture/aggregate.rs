//! Per-axis mode aggregation of capture samples.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::algorithm::ObjectVolume;

/// Smallest and largest value seen on one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSpread {
    /// Minimum
    pub min: i32,
    /// Maximum
    pub max: i32,
}

impl AxisSpread {
    fn of(values: &[i32]) -> Option<Self> {
        Some(Self {
            min: *values.iter().min()?,
            max: *values.iter().max()?,
        })
    }

    /// `max - min`.
    pub fn range(&self) -> i32 {
        self.max - self.min
    }
}

/// Aggregated dimensions plus the spread of the samples behind them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// Per-axis mode
    pub volume: ObjectVolume,
    /// Length spread
    pub length_spread: AxisSpread,
    /// Width spread
    pub width_spread: AxisSpread,
    /// Height spread
    pub height_spread: AxisSpread,
    /// Samples that produced a value
    pub valid_samples: usize,
}

/// Most frequent value; ties go to the value seen first.
pub fn mode(values: &[i32]) -> Option<i32> {
    let mut counts: Vec<(i32, usize)> = Vec::new();
    for &value in values {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }
    let mut best: Option<(i32, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, best_count)| count > best_count) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

fn joined(values: &[i32]) -> String {
    values
        .iter()
        .map(i32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Aggregate samples; `None` when no sample produced a value.
pub fn aggregate(samples: &[Option<ObjectVolume>]) -> Option<AggregatedResult> {
    let valid: Vec<ObjectVolume> = samples.iter().flatten().copied().collect();
    let lengths: Vec<i32> = valid.iter().map(|v| v.length_mm).collect();
    let widths: Vec<i32> = valid.iter().map(|v| v.width_mm).collect();
    let heights: Vec<i32> = valid.iter().map(|v| v.height_mm).collect();

    info!(
        "Measured values: {{{}}}; {{{}}}; {{{}}}",
        joined(&lengths),
        joined(&widths),
        joined(&heights)
    );

    Some(AggregatedResult {
        volume: ObjectVolume::new(mode(&lengths)?, mode(&widths)?, mode(&heights)?),
        length_spread: AxisSpread::of(&lengths)?,
        width_spread: AxisSpread::of(&widths)?,
        height_spread: AxisSpread::of(&heights)?,
        valid_samples: valid.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_mode_prefers_first_on_tie() {
        assert_eq!(mode(&[3, 1, 1, 3]), Some(3));
        assert_eq!(mode(&[5, 7, 7]), Some(7));
        assert_eq!(mode(&[]), None);
    }

    #[test]
    #[traced_test]
    fn test_aggregate_picks_per_axis_mode() {
        let samples = [
            Some(ObjectVolume::new(10, 20, 30)),
            Some(ObjectVolume::new(10, 20, 31)),
            Some(ObjectVolume::new(11, 20, 30)),
        ];
        let result = aggregate(&samples).unwrap();
        assert_eq!(result.volume, ObjectVolume::new(10, 20, 30));
        assert_eq!(result.length_spread, AxisSpread { min: 10, max: 11 });
        assert_eq!(result.height_spread.range(), 1);
        assert_eq!(result.valid_samples, 3);
        assert!(logs_contain("Measured values: {10,10,11}; {20,20,20}; {30,31,30}"));
    }

    #[test]
    fn test_aggregate_skips_failed_samples() {
        let samples = [None, Some(ObjectVolume::new(1, 2, 3)), None];
        let result = aggregate(&samples).unwrap();
        assert_eq!(result.volume, ObjectVolume::new(1, 2, 3));
        assert_eq!(result.valid_samples, 1);
        assert!(aggregate(&[None, None]).is_none());
    }
}
