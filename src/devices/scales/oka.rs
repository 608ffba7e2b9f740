//! OKA polled protocol.
//!
//! A 32-byte request (last byte 3) is written once a second. The reply carries the weight
//! as a sequence of digit values, least significant first.

use std::time::Duration;

use super::{PollCommand, RawReading, ScaleDecoder, ScaleStatus};
use crate::devices::serial::{Parity, SerialSettings};

const POLL_FRAME_LEN: usize = 32;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// OKA decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct OkaDecoder;

impl OkaDecoder {
    /// Request frame written on every poll.
    pub fn poll_frame() -> Vec<u8> {
        let mut frame = vec![0u8; POLL_FRAME_LEN];
        frame[POLL_FRAME_LEN - 1] = 3;
        frame
    }
}

impl ScaleDecoder for OkaDecoder {
    fn name(&self) -> &'static str {
        "oka"
    }

    fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(4800).parity(Parity::Even).stop_bits(2)
    }

    fn poll(&self) -> Option<PollCommand> {
        Some(PollCommand {
            bytes: Self::poll_frame(),
            interval: POLL_INTERVAL,
        })
    }

    fn decode(&self, chunk: &[u8]) -> Option<RawReading> {
        if chunk.is_empty() {
            return None;
        }
        let digits: String = chunk.iter().rev().map(|b| b.to_string()).collect();
        let trimmed = digits.trim_start_matches('0');
        let weight = if trimmed.is_empty() {
            0.0
        } else {
            trimmed.parse::<f64>().ok()?
        };
        Some(RawReading::new(ScaleStatus::Measured, weight))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reversed_digits() {
        let reading = OkaDecoder.decode(&[5, 2, 1, 0, 0]).unwrap();
        assert_eq!(reading.weight_g, 125.0);
        assert_eq!(reading.status, ScaleStatus::Measured);
    }

    #[test]
    fn test_decode_all_zero() {
        assert_eq!(OkaDecoder.decode(&[0, 0, 0]).unwrap().weight_g, 0.0);
        assert!(OkaDecoder.decode(&[]).is_none());
    }

    #[test]
    fn test_poll_frame() {
        let frame = OkaDecoder::poll_frame();
        assert_eq!(frame.len(), 32);
        assert_eq!(frame[31], 3);
        assert_eq!(OkaDecoder.poll().unwrap().interval, Duration::from_secs(1));
        assert_eq!(OkaDecoder.serial_settings().stop_bits, 2);
    }
}
