//! CI-2001A comma-separated ASCII protocol.
//!
//! `ST,GS,  ,   1.234 kg\r\n` - token 0 is the state (`ST` stable, `US` unstable,
//! `OL` overload), token 3 carries `"<number> <unit>"`.

use tracing::{debug, error};

use super::{RawReading, ScaleDecoder, ScaleStatus};
use crate::devices::serial::SerialSettings;

const MIN_FRAME_LEN: usize = 20;
const MIN_TOKENS: usize = 4;

/// CI-2001A decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ci2001ADecoder;

fn status(token: &str) -> ScaleStatus {
    match token.trim() {
        "ST" => ScaleStatus::Measured,
        "US" => ScaleStatus::Measuring,
        "OL" => ScaleStatus::Overload,
        _ => ScaleStatus::Invalid,
    }
}

fn weight_g(token: &str) -> Option<f64> {
    let mut parts = token.split_whitespace();
    let value: f64 = parts.next()?.parse().ok()?;
    let multiplier = match parts.next()? {
        "kg" => 1000.0,
        "lb" => 453.592_37,
        other => {
            error!(unit = other, "CI-2001A: unknown weight unit");
            return Some(0.0);
        }
    };
    Some((value * multiplier).floor())
}

impl ScaleDecoder for Ci2001ADecoder {
    fn name(&self) -> &'static str {
        "ci2001a"
    }

    fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(9600).with_rts_cts()
    }

    fn decode(&self, chunk: &[u8]) -> Option<RawReading> {
        if chunk.len() < MIN_FRAME_LEN {
            return None;
        }
        let text = String::from_utf8_lossy(chunk);
        let tokens: Vec<&str> = text.split(',').collect();
        if tokens.len() < MIN_TOKENS {
            return None;
        }

        let status = status(tokens[0]);
        match status {
            ScaleStatus::Invalid => Some(RawReading::new(status, 0.0)),
            ScaleStatus::Overload => Some(RawReading::new(status, f64::NAN)),
            _ => match weight_g(tokens[3]) {
                Some(weight) => Some(RawReading::new(status, weight)),
                None => {
                    debug!(token = tokens[3].trim(), "CI-2001A: unparseable weight");
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_stable_kg() {
        let reading = Ci2001ADecoder.decode(b"ST,GS,  ,   1.234 kg\r\n").unwrap();
        assert_eq!(reading.status, ScaleStatus::Measured);
        assert_eq!(reading.weight_g, 1234.0);
    }

    #[test]
    fn test_decode_unstable_lb() {
        let reading = Ci2001ADecoder.decode(b"US,GS,  ,   1.000 lb\r\n").unwrap();
        assert_eq!(reading.status, ScaleStatus::Measuring);
        assert_eq!(reading.weight_g, 453.0);
    }

    #[test]
    fn test_overload_and_invalid() {
        let overload = Ci2001ADecoder.decode(b"OL,GS,  ,  ------ kg\r\n").unwrap();
        assert_eq!(overload.status, ScaleStatus::Overload);
        let invalid = Ci2001ADecoder.decode(b"XX,GS,  ,   1.000 kg\r\n").unwrap();
        assert_eq!(invalid.status, ScaleStatus::Invalid);
    }

    #[test]
    fn test_short_or_malformed_dropped() {
        assert!(Ci2001ADecoder.decode(b"ST,GS,1.0 kg").is_none());
        assert!(Ci2001ADecoder.decode(b"ST GS 1.000 kg padding\r\n").is_none());
        assert!(Ci2001ADecoder.decode(b"ST,GS,  ,   abc kg\r\n\r\n").is_none());
    }

    #[test]
    fn test_uses_hardware_handshake() {
        assert!(Ci2001ADecoder.serial_settings().rts_cts);
    }
}
