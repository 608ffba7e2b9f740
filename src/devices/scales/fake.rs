//! Simulated scales for bench setups without hardware.
//!
//! Alternates between an empty platform and a loaded one every ten seconds, publishing a
//! reading twice a second.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ScaleReading, ScaleStatus, Scales, READING_CHANNEL_CAPACITY};

const PUBLISH_INTERVAL: Duration = Duration::from_millis(500);
const PHASE_LENGTH: Duration = Duration::from_secs(10);
const MAX_WEIGHT_G: u32 = 15_000;

/// Random-weight scales.
pub struct FakeScales {
    last: Arc<Mutex<ScaleReading>>,
    readings: broadcast::Sender<ScaleReading>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FakeScales {
    /// Start publishing simulated readings.
    pub fn spawn() -> Self {
        let (readings, _) = broadcast::channel(READING_CHANNEL_CAPACITY);
        let last = Arc::new(Mutex::new(ScaleReading::not_set()));
        let cancel = CancellationToken::new();

        let task = {
            let readings = readings.clone();
            let last = last.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
                let mut phase_started = tokio::time::Instant::now();
                let mut loaded = false;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if phase_started.elapsed() >= PHASE_LENGTH {
                        loaded = !loaded;
                        phase_started = tokio::time::Instant::now();
                    }
                    let reading = if loaded {
                        let weight = rand::thread_rng().gen_range(0..=MAX_WEIGHT_G);
                        ScaleReading::new(ScaleStatus::Measured, weight as f64)
                    } else {
                        ScaleReading::ready()
                    };
                    *last.lock() = reading;
                    let _ = readings.send(reading);
                }
            })
        };

        Self {
            last,
            readings,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }
}

#[async_trait]
impl Scales for FakeScales {
    fn name(&self) -> &str {
        "fake"
    }

    fn subscribe(&self) -> broadcast::Receiver<ScaleReading> {
        self.readings.subscribe()
    }

    fn last_reading(&self) -> ScaleReading {
        *self.last.lock()
    }

    fn reset_weight(&self) {
        let reading = ScaleReading::ready();
        *self.last.lock() = reading;
        let _ = self.readings.send(reading);
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("Fake scales stopped");
    }
}

impl Drop for FakeScales {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_alternates_between_empty_and_loaded() {
        let scales = FakeScales::spawn();
        let mut rx = scales.subscribe();

        let first = rx.recv().await.unwrap();
        assert_eq!(first, ScaleReading::ready());

        let mut saw_loaded = false;
        for _ in 0..30 {
            let reading = rx.recv().await.unwrap();
            if reading.status == ScaleStatus::Measured {
                assert!(reading.weight_g <= MAX_WEIGHT_G as f64);
                saw_loaded = true;
                break;
            }
        }
        assert!(saw_loaded);

        scales.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_publishes_ready() {
        let scales = FakeScales::spawn();
        let mut rx = scales.subscribe();
        scales.reset_weight();
        assert_eq!(rx.recv().await.unwrap(), ScaleReading::ready());
        assert_eq!(scales.last_reading(), ScaleReading::ready());
        scales.shutdown().await;
    }
}
