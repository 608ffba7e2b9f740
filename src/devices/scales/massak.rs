//! Massa-K binary protocol.
//!
//! The scale answers a one-byte poll with 5-byte frames:
//!
//! ```text
//! [status] [multiplier code] [w0] [w1] [w2 | sign bit 7]
//! ```
//!
//! Status: 192 ready, 128 settled, 0 measuring. Weight is little-endian 23-bit magnitude
//! scaled by the multiplier code (0 → 0.001, 1 → 0.0001, 4 → 0.01, 5 → 0.1 kg per unit).

use std::time::Duration;
use tracing::{debug, error};

use super::{PollCommand, RawReading, ScaleDecoder, ScaleStatus};
use crate::devices::serial::{Parity, SerialSettings};

const FRAME_LEN: usize = 5;
const POLL_BYTE: u8 = 0x4A;
const RESET_BYTE: u8 = 0x0E;
const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Massa-K decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MassaKDecoder;

impl MassaKDecoder {
    fn status(byte: u8) -> ScaleStatus {
        match byte {
            192 => ScaleStatus::Ready,
            128 => ScaleStatus::Measured,
            0 => ScaleStatus::Measuring,
            _ => ScaleStatus::Invalid,
        }
    }

    fn multiplier(code: u8) -> f64 {
        match code {
            0 => 0.001,
            1 => 0.0001,
            4 => 0.01,
            5 => 0.1,
            other => {
                error!(code = other, "Massa-K: unknown weight multiplier code");
                0.0
            }
        }
    }

    fn weight_g(frame: &[u8]) -> f64 {
        let magnitude =
            frame[2] as u32 + frame[3] as u32 * 256 + (frame[4] & 0x7F) as u32 * 65_536;
        let sign = if frame[4] & 0x80 != 0 { -1.0 } else { 1.0 };
        (sign * magnitude as f64 * Self::multiplier(frame[1]) * 1000.0).floor()
    }
}

impl ScaleDecoder for MassaKDecoder {
    fn name(&self) -> &'static str {
        "massak"
    }

    fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(4800).parity(Parity::Even)
    }

    fn poll(&self) -> Option<PollCommand> {
        Some(PollCommand {
            bytes: vec![POLL_BYTE],
            interval: POLL_INTERVAL,
        })
    }

    fn reset_command(&self) -> Option<Vec<u8>> {
        Some(vec![RESET_BYTE])
    }

    fn decode(&self, chunk: &[u8]) -> Option<RawReading> {
        if chunk.len() < FRAME_LEN {
            debug!(len = chunk.len(), "Massa-K: frame too short");
            return None;
        }
        // Several frames may arrive in one chunk; the newest complete one wins
        let start = (chunk.len() / FRAME_LEN - 1) * FRAME_LEN;
        let frame = &chunk[start..start + FRAME_LEN];

        let status = Self::status(frame[0]);
        if status == ScaleStatus::Invalid {
            return Some(RawReading::new(status, 0.0));
        }
        Some(RawReading::new(status, Self::weight_g(frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_settled_grams() {
        // 1234 units * 0.001 kg = 1.234 kg
        let frame = [128, 0, 0xD2, 0x04, 0x00];
        let reading = MassaKDecoder.decode(&frame).unwrap();
        assert_eq!(reading.status, ScaleStatus::Measured);
        assert_eq!(reading.weight_g, 1234.0);
    }

    #[test]
    fn test_decode_multiplier_and_sign() {
        // 50 units * 0.01 kg, negative
        let frame = [0, 4, 50, 0, 0x80];
        let reading = MassaKDecoder.decode(&frame).unwrap();
        assert_eq!(reading.status, ScaleStatus::Measuring);
        assert_eq!(reading.weight_g, -500.0);
    }

    #[test]
    fn test_unknown_multiplier_reads_zero() {
        let frame = [128, 9, 10, 0, 0];
        assert_eq!(MassaKDecoder.decode(&frame).unwrap().weight_g, 0.0);
    }

    #[test]
    fn test_short_and_invalid_frames() {
        assert!(MassaKDecoder.decode(&[128, 0, 1]).is_none());
        let invalid = MassaKDecoder.decode(&[7, 0, 1, 0, 0]).unwrap();
        assert_eq!(invalid.status, ScaleStatus::Invalid);
    }

    #[test]
    fn test_batched_frames_use_latest() {
        let chunk = [192, 0, 1, 0, 0, 128, 5, 3, 0, 0];
        let reading = MassaKDecoder.decode(&chunk).unwrap();
        assert_eq!(reading.status, ScaleStatus::Measured);
        assert_eq!(reading.weight_g, 300.0);
    }

    #[test]
    fn test_settings_and_commands() {
        let settings = MassaKDecoder.serial_settings();
        assert_eq!(settings.baud_rate, 4800);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(MassaKDecoder.poll().unwrap().bytes, vec![0x4A]);
        assert_eq!(MassaKDecoder.reset_command(), Some(vec![0x0E]));
    }
}
