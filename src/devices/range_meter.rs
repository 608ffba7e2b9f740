//! Range meters: distance from the sensor head down to the parcel top.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::serial::{DynSerial, SerialLink, SerialSettings};

/// Reading returned when the meter could not measure.
pub const RANGE_READING_FAILED: i64 = -1;

const LASER_ON: u8 = b'1';
const LASER_OFF: u8 = b'0';
const READ_REQUEST: u8 = 0x02;
const READING_SETTLE: Duration = Duration::from_millis(100);

/// Raw distance reported by the simulated meter, in tenths of a millimetre.
const FAKE_RAW_DISTANCE: i64 = 12_500;
/// Mounting offset of the simulated meter.
const FAKE_DEFAULT_SUBTRACTION_MM: i64 = 140;

/// Distance sensor.
#[async_trait]
pub trait RangeMeter: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Switch the pointing laser.
    fn toggle_laser(&self, enable: bool);

    /// Extra millimetres taken off every reading.
    fn set_subtraction_mm(&self, value: i32);

    /// Distance in millimetres, or [`RANGE_READING_FAILED`].
    async fn get_reading(&self) -> i64;

    /// Close the device. Idempotent.
    async fn shutdown(&self);
}

/// Average of the CR LF separated integers in `text`, `None` if any line is not a number.
pub fn average_readings(text: &str) -> Option<i64> {
    let values: Vec<i64> = text
        .split("\r\n")
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<i64>() / values.len() as i64)
}

/// Serial range meter with a one-byte command set (115200 8N1).
pub struct CustomRangeMeter {
    port: String,
    link: SerialLink,
    received: Arc<Mutex<String>>,
    reading: tokio::sync::Mutex<()>,
    subtraction_mm: AtomicI32,
}

impl CustomRangeMeter {
    /// Line settings.
    pub fn serial_settings() -> SerialSettings {
        SerialSettings::new(115_200)
    }

    /// Start receiving from an open port.
    pub fn attach(port: DynSerial, port_name: impl Into<String>) -> Self {
        let port_name = port_name.into();
        let received = Arc::new(Mutex::new(String::new()));
        let link = {
            let received = received.clone();
            SerialLink::spawn(port, "custom", move |chunk| {
                received.lock().push_str(&String::from_utf8_lossy(chunk));
            })
        };
        info!(port = %port_name, "Custom range meter started");
        Self {
            port: port_name,
            link,
            received,
            reading: tokio::sync::Mutex::new(()),
            subtraction_mm: AtomicI32::new(0),
        }
    }
}

#[async_trait]
impl RangeMeter for CustomRangeMeter {
    fn name(&self) -> &str {
        "custom"
    }

    fn toggle_laser(&self, enable: bool) {
        let command = if enable { LASER_ON } else { LASER_OFF };
        self.link.send(vec![command]);
    }

    fn set_subtraction_mm(&self, value: i32) {
        self.subtraction_mm.store(value, Ordering::Relaxed);
    }

    async fn get_reading(&self) -> i64 {
        let _exclusive = self.reading.lock().await;
        self.received.lock().clear();
        self.link.send(vec![READ_REQUEST]);
        tokio::time::sleep(READING_SETTLE).await;

        let text = std::mem::take(&mut *self.received.lock());
        match average_readings(&text) {
            Some(distance) => distance - i64::from(self.subtraction_mm.load(Ordering::Relaxed)),
            None => {
                warn!(port = %self.port, answer = %text.trim(), "Custom range meter: failed to get reading");
                RANGE_READING_FAILED
            }
        }
    }

    async fn shutdown(&self) {
        self.link.shutdown().await;
    }
}

/// Simulated range meter returning a constant distance.
#[derive(Debug, Default)]
pub struct FakeRangeMeter {
    subtraction_mm: AtomicI32,
}

impl FakeRangeMeter {
    /// Create a simulated meter.
    pub fn new() -> Self {
        info!("Creating a fake range meter");
        Self::default()
    }
}

#[async_trait]
impl RangeMeter for FakeRangeMeter {
    fn name(&self) -> &str {
        "fake"
    }

    fn toggle_laser(&self, _enable: bool) {}

    fn set_subtraction_mm(&self, value: i32) {
        self.subtraction_mm.store(value, Ordering::Relaxed);
    }

    async fn get_reading(&self) -> i64 {
        let subtraction =
            FAKE_DEFAULT_SUBTRACTION_MM + i64::from(self.subtraction_mm.load(Ordering::Relaxed));
        FAKE_RAW_DISTANCE / 10 - subtraction
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_average_readings() {
        assert_eq!(average_readings("1000\r\n1010\r\n1020\r\n"), Some(1010));
        assert_eq!(average_readings(""), None);
        assert_eq!(average_readings("1000\r\nerr\r\n"), None);
    }

    #[tokio::test]
    async fn test_fake_meter_applies_offsets() {
        let meter = FakeRangeMeter::new();
        assert_eq!(meter.get_reading().await, 1110);
        meter.set_subtraction_mm(10);
        assert_eq!(meter.get_reading().await, 1100);
    }

    #[tokio::test]
    async fn test_custom_meter_requests_and_averages() {
        let (mut host, device) = tokio::io::duplex(64);
        let meter = CustomRangeMeter::attach(Box::new(device), "test");

        meter.toggle_laser(true);
        let mut laser = [0u8; 1];
        host.read_exact(&mut laser).await.unwrap();
        assert_eq!(laser[0], b'1');

        let responder = tokio::spawn(async move {
            let mut request = [0u8; 1];
            host.read_exact(&mut request).await.unwrap();
            assert_eq!(request[0], 0x02);
            host.write_all(b"800\r\n820\r\n").await.unwrap();
            host
        });

        assert_eq!(meter.get_reading().await, 810);
        let _host = responder.await.unwrap();
        meter.shutdown().await;
    }

    #[tokio::test]
    async fn test_custom_meter_without_answer_fails() {
        let (_host, device) = tokio::io::duplex(64);
        let meter = CustomRangeMeter::attach(Box::new(device), "test");
        assert_eq!(meter.get_reading().await, RANGE_READING_FAILED);
        meter.shutdown().await;
    }
}
