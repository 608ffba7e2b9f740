//! Scale protocol adapters.
//!
//! Every serial scale is a [`SerialScales`] wrapping a vendor [`ScaleDecoder`]. The decoder
//! only knows the byte layout; the shared [`ScaleProcessor`] applies the rules common to
//! all vendors:
//!
//! 1. decode status + weight (vendor table), drop what cannot be decoded
//! 2. overload is reported as-is with a NaN weight
//! 3. a weight below the configured minimum becomes `Ready` / 0
//! 4. the [`StabilizationFilter`] decides between `Measuring` and `Measured`
//!
//! Readings are published on a broadcast channel; the receive task never waits on
//! consumers.

mod casm;
mod ci2001a;
mod fake;
mod massak;
mod oka;

pub use casm::CasMDecoder;
pub use ci2001a::Ci2001ADecoder;
pub use fake::FakeScales;
pub use massak::MassaKDecoder;
pub use oka::OkaDecoder;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::serial::{DynSerial, SerialLink, SerialSettings};

/// Weight change (grams) that counts as a new value.
pub const DEFAULT_STABILIZATION_EPSILON_G: f64 = 2.0;

/// Time a weight must stay within epsilon before it is reported as `Measured`.
pub const DEFAULT_STABILIZATION_DWELL: Duration = Duration::from_millis(300);

const READING_CHANNEL_CAPACITY: usize = 32;

// =============================================================================
// Readings
// =============================================================================

/// Scale state reported with every reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScaleStatus {
    /// No reading yet
    NotSet,
    /// Platform empty or below the minimum weight
    Ready,
    /// Weight still changing
    Measuring,
    /// Weight settled
    Measured,
    /// Frame carried an unknown status
    Invalid,
    /// Load above the scale range
    Overload,
}

/// One normalized scale reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleReading {
    /// Scale state
    pub status: ScaleStatus,
    /// Weight in grams, NaN on overload
    pub weight_g: f64,
}

impl ScaleReading {
    /// Build a reading.
    pub const fn new(status: ScaleStatus, weight_g: f64) -> Self {
        Self { status, weight_g }
    }

    /// Initial state of every scale.
    pub const fn not_set() -> Self {
        Self::new(ScaleStatus::NotSet, 0.0)
    }

    /// Empty platform.
    pub const fn ready() -> Self {
        Self::new(ScaleStatus::Ready, 0.0)
    }

    /// Overload sentinel.
    pub const fn overload() -> Self {
        Self::new(ScaleStatus::Overload, f64::NAN)
    }

    /// True when the weight may be used for a measurement.
    pub fn is_settled(&self) -> bool {
        self.status == ScaleStatus::Measured
    }
}

impl Default for ScaleReading {
    fn default() -> Self {
        Self::not_set()
    }
}

/// Decoder output before the shared rules run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    /// Device status. `Measured` also stands for "device reports no stability flag".
    pub status: ScaleStatus,
    /// Weight in grams
    pub weight_g: f64,
}

impl RawReading {
    /// Build a raw reading.
    pub const fn new(status: ScaleStatus, weight_g: f64) -> Self {
        Self { status, weight_g }
    }
}

// =============================================================================
// Decoder strategy
// =============================================================================

/// Periodic request some scales need before they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollCommand {
    /// Bytes written on every tick
    pub bytes: Vec<u8>,
    /// Tick interval
    pub interval: Duration,
}

/// Vendor byte layout of a scale.
pub trait ScaleDecoder: Send + Sync + 'static {
    /// Registry name (`massak`, `casm`, ...)
    fn name(&self) -> &'static str;

    /// Line settings the scale expects.
    fn serial_settings(&self) -> SerialSettings;

    /// Request written periodically, if the scale does not stream by itself.
    fn poll(&self) -> Option<PollCommand> {
        None
    }

    /// Command that zeroes the scale, if supported.
    fn reset_command(&self) -> Option<Vec<u8>> {
        None
    }

    /// Decode one received chunk. `None` drops it.
    fn decode(&self, chunk: &[u8]) -> Option<RawReading>;
}

// =============================================================================
// Stabilization
// =============================================================================

/// Promotes a weight to `Measured` once it has stayed within epsilon for the dwell time.
#[derive(Debug, Clone)]
pub struct StabilizationFilter {
    epsilon_g: f64,
    dwell: Duration,
    last_weight_g: f64,
    last_status: ScaleStatus,
    changed_at: Option<Instant>,
}

impl StabilizationFilter {
    /// Filter with explicit parameters.
    pub fn new(epsilon_g: f64, dwell: Duration) -> Self {
        Self {
            epsilon_g,
            dwell,
            last_weight_g: -1.0,
            last_status: ScaleStatus::NotSet,
            changed_at: None,
        }
    }

    /// Feed a weight observed at `now` and get the resulting status.
    ///
    /// A jump larger than epsilon restarts the episode (`Measuring`). Within epsilon the
    /// previous status holds until the dwell time elapses, then `Measured` is reported
    /// and held for the rest of the episode.
    pub fn update(&mut self, weight_g: f64, now: Instant) -> ScaleStatus {
        let changed = weight_g.is_nan()
            || self.last_weight_g.is_nan()
            || (weight_g - self.last_weight_g).abs() > self.epsilon_g;
        if changed {
            self.last_weight_g = weight_g;
            self.changed_at = Some(now);
            self.last_status = ScaleStatus::Measuring;
            return self.last_status;
        }

        let since = *self.changed_at.get_or_insert(now);
        if now.duration_since(since) >= self.dwell {
            self.last_status = ScaleStatus::Measured;
        } else if self.last_status != ScaleStatus::Measured {
            self.last_status = ScaleStatus::Measuring;
        }
        self.last_status
    }

    /// Forget the current episode: weight 0, clock restarted.
    pub fn reset(&mut self, now: Instant) {
        self.last_weight_g = 0.0;
        self.last_status = ScaleStatus::Ready;
        self.changed_at = Some(now);
    }

    /// Last weight the filter saw.
    pub fn last_weight(&self) -> f64 {
        self.last_weight_g
    }
}

impl Default for StabilizationFilter {
    fn default() -> Self {
        Self::new(DEFAULT_STABILIZATION_EPSILON_G, DEFAULT_STABILIZATION_DWELL)
    }
}

// =============================================================================
// Shared processing
// =============================================================================

/// Decoder + minimum-weight rule + stabilization, independent of any port.
pub struct ScaleProcessor {
    decoder: Arc<dyn ScaleDecoder>,
    filter: StabilizationFilter,
    min_weight_g: f64,
    last: ScaleReading,
}

impl ScaleProcessor {
    /// Processor for one decoder.
    pub fn new(decoder: Arc<dyn ScaleDecoder>, min_weight_g: f64, filter: StabilizationFilter) -> Self {
        Self {
            decoder,
            filter,
            min_weight_g,
            last: ScaleReading::not_set(),
        }
    }

    /// Turn one chunk into zero or one reading.
    pub fn process(&mut self, chunk: &[u8], now: Instant) -> Option<ScaleReading> {
        let raw = self.decoder.decode(chunk)?;

        let reading = match raw.status {
            ScaleStatus::Invalid | ScaleStatus::NotSet => {
                debug!(scales = self.decoder.name(), "Dropping frame with invalid status");
                return None;
            }
            ScaleStatus::Overload => {
                self.filter.update(f64::NAN, now);
                ScaleReading::overload()
            }
            _ if raw.weight_g.is_nan() || raw.weight_g < self.min_weight_g => {
                self.filter.update(0.0, now);
                ScaleReading::ready()
            }
            device_status => {
                let filtered = self.filter.update(raw.weight_g, now);
                let status = match device_status {
                    ScaleStatus::Ready => ScaleStatus::Ready,
                    ScaleStatus::Measuring => ScaleStatus::Measuring,
                    _ => filtered,
                };
                ScaleReading::new(status, raw.weight_g)
            }
        };

        self.last = reading;
        Some(reading)
    }

    /// Zero the episode if the last weight reached the minimum.
    pub fn reset(&mut self, now: Instant) -> Option<ScaleReading> {
        if self.last.weight_g.is_nan() || self.last.weight_g < self.min_weight_g {
            return None;
        }
        self.filter.reset(now);
        self.last = ScaleReading::ready();
        Some(self.last)
    }

    /// Last produced reading.
    pub fn last(&self) -> ScaleReading {
        self.last
    }

    /// Decoder in use.
    pub fn decoder(&self) -> &Arc<dyn ScaleDecoder> {
        &self.decoder
    }
}

// =============================================================================
// Scales trait
// =============================================================================

/// A scale as seen by the rest of the station.
#[async_trait]
pub trait Scales: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Receive every reading from now on.
    fn subscribe(&self) -> broadcast::Receiver<ScaleReading>;

    /// Most recent reading.
    fn last_reading(&self) -> ScaleReading;

    /// Zero the scale.
    fn reset_weight(&self);

    /// Stop background tasks. Idempotent.
    async fn shutdown(&self);
}

/// Configuration shared by the serial scale factories.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialScalesConfig {
    /// Serial port path
    pub port: String,
    /// Weights below this many grams read as `Ready` / 0
    #[serde(default)]
    pub min_weight_g: f64,
    /// Stabilization epsilon in grams
    #[serde(default = "default_epsilon")]
    pub stabilization_epsilon_g: f64,
    /// Stabilization dwell in milliseconds
    #[serde(default = "default_dwell_ms")]
    pub stabilization_dwell_ms: u64,
}

fn default_epsilon() -> f64 {
    DEFAULT_STABILIZATION_EPSILON_G
}

fn default_dwell_ms() -> u64 {
    DEFAULT_STABILIZATION_DWELL.as_millis() as u64
}

impl SerialScalesConfig {
    /// Filter built from the configured parameters.
    pub fn filter(&self) -> StabilizationFilter {
        StabilizationFilter::new(
            self.stabilization_epsilon_g,
            Duration::from_millis(self.stabilization_dwell_ms),
        )
    }
}

/// Generic serial scale: link + decoder + shared processing.
pub struct SerialScales {
    name: &'static str,
    link: Arc<SerialLink>,
    processor: Arc<Mutex<ScaleProcessor>>,
    readings: broadcast::Sender<ScaleReading>,
    reset_command: Option<Vec<u8>>,
    cancel: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl SerialScales {
    /// Attach a decoder to an open port and start receiving (and polling, if needed).
    pub fn attach(
        port: DynSerial,
        decoder: Arc<dyn ScaleDecoder>,
        min_weight_g: f64,
        filter: StabilizationFilter,
    ) -> Self {
        let name = decoder.name();
        let reset_command = decoder.reset_command();
        let poll = decoder.poll();
        let processor = Arc::new(Mutex::new(ScaleProcessor::new(decoder, min_weight_g, filter)));
        let (readings, _) = broadcast::channel(READING_CHANNEL_CAPACITY);

        let link = {
            let processor = processor.clone();
            let readings = readings.clone();
            Arc::new(SerialLink::spawn(port, name, move |chunk| {
                let reading = processor.lock().process(chunk, Instant::now());
                if let Some(reading) = reading {
                    let _ = readings.send(reading);
                }
            }))
        };

        let cancel = CancellationToken::new();
        let poller = poll.map(|poll| {
            let cancel = cancel.clone();
            let link = link.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll.interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            link.send(poll.bytes.clone());
                        }
                    }
                }
            })
        });

        info!(scales = name, min_weight_g, "Scales attached");

        Self {
            name,
            link,
            processor,
            readings,
            reset_command,
            cancel,
            poller: Mutex::new(poller),
        }
    }
}

#[async_trait]
impl Scales for SerialScales {
    fn name(&self) -> &str {
        self.name
    }

    fn subscribe(&self) -> broadcast::Receiver<ScaleReading> {
        self.readings.subscribe()
    }

    fn last_reading(&self) -> ScaleReading {
        self.processor.lock().last()
    }

    fn reset_weight(&self) {
        if let Some(command) = &self.reset_command {
            self.link.send(command.clone());
        }
        let reset = self.processor.lock().reset(Instant::now());
        if let Some(reading) = reset {
            let _ = self.readings.send(reading);
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            let _ = poller.await;
        }
        self.link.shutdown().await;
        debug!(scales = self.name, "Scales stopped");
    }
}
