//! CAS M-series ASCII protocol.
//!
//! Continuous frames, at least 12 bytes:
//!
//! ```text
//! bytes 0..3   header/status (ignored)
//! byte  3      'F' on overload
//! bytes 4..10  weight, ASCII decimal
//! bytes 10..12 unit: "kg", "lb", " g", "oz"
//! ```
//!
//! The scale has no usable stability flag, so the shared filter decides settling.

use tracing::{debug, error};

use super::{RawReading, ScaleDecoder, ScaleStatus};
use crate::devices::serial::SerialSettings;

const MIN_FRAME_LEN: usize = 4;
const FULL_FRAME_LEN: usize = 12;
const OVERLOAD_MARK: u8 = b'F';

/// CAS M decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct CasMDecoder;

/// Grams per unit for the unit token, 0 for unknown units.
fn unit_multiplier(unit: &str) -> f64 {
    match unit {
        "kg" => 1000.0,
        "lb" => 453.592_37,
        " g" => 1.0,
        "oz" => 28.3495,
        other => {
            error!(unit = other, "CAS M: unknown weight unit");
            0.0
        }
    }
}

impl ScaleDecoder for CasMDecoder {
    fn name(&self) -> &'static str {
        "casm"
    }

    fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(9600)
    }

    fn decode(&self, chunk: &[u8]) -> Option<RawReading> {
        if chunk.len() < MIN_FRAME_LEN {
            return None;
        }
        if chunk[3] == OVERLOAD_MARK {
            return Some(RawReading::new(ScaleStatus::Overload, f64::NAN));
        }
        if chunk.len() < FULL_FRAME_LEN {
            debug!(len = chunk.len(), "CAS M: frame too short");
            return None;
        }

        let weight_text = std::str::from_utf8(&chunk[4..10]).ok()?;
        let weight: f64 = match weight_text.trim().parse() {
            Ok(weight) => weight,
            Err(_) => {
                debug!(text = weight_text, "CAS M: unparseable weight");
                return None;
            }
        };
        let unit = std::str::from_utf8(&chunk[10..12]).ok()?;
        let grams = (weight * unit_multiplier(unit)).floor();

        Some(RawReading::new(ScaleStatus::Measured, grams))
    }
}
