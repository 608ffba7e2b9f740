//! Normalized device events.
//!
//! [`DeviceEventGenerator`] subscribes to every scanner and the scale of a [`DeviceSet`]
//! and re-publishes their output as [`DeviceEvent`]s on one channel. With pallet
//! subtraction enabled the pallet weight is taken off every scale reading.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::scales::ScaleReading;
use super::set::DeviceSet;
use crate::config::AlgorithmConfig;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event produced by a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A scanner read a code
    Barcode(String),
    /// The scale reported a weight
    Weight(ScaleReading),
}

/// Pallet handling applied to scale readings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PalletSettings {
    /// Subtract the pallet weight
    pub enabled: bool,
    /// Pallet weight in grams
    pub weight_g: f64,
}

impl PalletSettings {
    /// Pallet settings from the algorithm section.
    pub fn from_config(config: &AlgorithmConfig) -> Self {
        Self {
            enabled: config.enable_pallet_subtraction,
            weight_g: config.pallet_weight_g,
        }
    }

    /// Apply to one reading.
    pub fn apply(&self, reading: ScaleReading) -> ScaleReading {
        if self.enabled {
            ScaleReading::new(reading.status, reading.weight_g - self.weight_g)
        } else {
            reading
        }
    }
}

/// Forwards scanner and scale output as [`DeviceEvent`]s.
pub struct DeviceEventGenerator {
    events: broadcast::Sender<DeviceEvent>,
    pallet: Arc<RwLock<PalletSettings>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceEventGenerator {
    /// Attach to the devices of `set`.
    pub fn new(set: &DeviceSet, pallet: PalletSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pallet = Arc::new(RwLock::new(pallet));
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        for scanner in &set.scanners {
            tasks.push(tokio::spawn(forward(
                scanner.subscribe(),
                events.clone(),
                cancel.clone(),
                DeviceEvent::Barcode,
            )));
        }

        if let Some(scales) = &set.scales {
            let pallet = pallet.clone();
            tasks.push(tokio::spawn(forward(
                scales.subscribe(),
                events.clone(),
                cancel.clone(),
                move |reading| DeviceEvent::Weight(pallet.read().apply(reading)),
            )));
        }

        debug!(sources = tasks.len(), "Device event generator attached");
        Self {
            events,
            pallet,
            cancel,
            tasks: Mutex::new(tasks),
        }
    }

    /// Receive device events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Pick up changed pallet settings.
    pub fn update_settings(&self, config: &AlgorithmConfig) {
        *self.pallet.write() = PalletSettings::from_config(config);
    }

    /// Current pallet settings.
    pub fn pallet_settings(&self) -> PalletSettings {
        *self.pallet.read()
    }

    /// Detach from every device. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for DeviceEventGenerator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward<T, F>(
    mut source: broadcast::Receiver<T>,
    events: broadcast::Sender<DeviceEvent>,
    cancel: CancellationToken,
    map: F,
) where
    T: Clone + Send + 'static,
    F: Fn(T) -> DeviceEvent + Send + 'static,
{
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = source.recv() => item,
        };
        match item {
            Ok(item) => {
                let _ = events.send(map(item));
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Device event source lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
