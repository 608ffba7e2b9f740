//! Rate-gated frame relay between one producer and any number of consumers.
//!
//! # Architecture
//!
//! ```text
//!  camera callback                        polling task (one per stream)
//!  ───────────────                        ─────────────────────────────
//!  push_frame(T) ──► FixedCapacityQueue ──► dequeue ──┬──► unrestricted (every frame)
//!   (never blocks)      (cap 5, drops                 │
//!                        oldest on overflow)          └──► restricted (fps gated,
//!                                                            skipped while suspended)
//! ```
//!
//! Consumers subscribe through `tokio::sync::broadcast`; the receiver count is the
//! "is anyone listening" query. A slow consumer lags and skips frames, which is the
//! same latest-wins policy the queue applies.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::queue::{FixedCapacityQueue, FRAME_QUEUE_CAPACITY};

/// Sleep between checks while the stream is suspended.
pub const SUSPENDED_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sleep between checks while the queue is empty.
pub const EMPTY_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Subscriber channel depth.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 8;

/// Default FPS: gating disabled.
pub const UNLIMITED_FPS: f64 = -1.0;

/// Minimum spacing between restricted deliveries, `None` when `fps <= 0`.
pub fn delivery_interval(fps: f64) -> Option<Duration> {
    if fps > 0.0 && fps.is_finite() {
        Some(Duration::from_secs_f64(1.0 / fps))
    } else {
        None
    }
}

struct StreamShared<T> {
    name: String,
    queue: Mutex<FixedCapacityQueue<Arc<T>>>,
    restricted: broadcast::Sender<Arc<T>>,
    unrestricted: broadcast::Sender<Arc<T>>,
    fps_bits: AtomicU64,
    suspended: AtomicBool,
    dropped: AtomicU64,
}

impl<T> StreamShared<T> {
    fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Acquire))
    }
}

/// Generic rate-gated relay.
///
/// Must be created inside a Tokio runtime; the polling task starts immediately and runs
/// until [`shutdown`](Self::shutdown) or drop.
pub struct FrameStream<T> {
    shared: Arc<StreamShared<T>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> FrameStream<T> {
    /// Start a stream with unlimited FPS.
    pub fn spawn(name: impl Into<String>) -> Self {
        let (restricted, _) = broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let (unrestricted, _) = broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let shared = Arc::new(StreamShared {
            name: name.into(),
            queue: Mutex::new(FixedCapacityQueue::new(FRAME_QUEUE_CAPACITY)),
            restricted,
            unrestricted,
            fps_bits: AtomicU64::new(UNLIMITED_FPS.to_bits()),
            suspended: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_polling_loop(shared.clone(), cancel.clone()));

        Self {
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Hand a frame to the stream. Never blocks; evicts the oldest buffered frame when full.
    pub fn push_frame(&self, frame: T) {
        self.push_shared(Arc::new(frame));
    }

    /// Same as [`push_frame`](Self::push_frame) for an already shared frame.
    pub fn push_shared(&self, frame: Arc<T>) {
        let evicted = self.shared.queue.lock().enqueue(frame);
        if evicted > 0 {
            self.shared
                .dropped
                .fetch_add(evicted as u64, Ordering::Relaxed);
            trace!(stream = %self.shared.name, evicted, "Frame queue overflow");
        }
    }

    /// Subscribe as an FPS-gated consumer.
    pub fn subscribe_restricted(&self) -> broadcast::Receiver<Arc<T>> {
        self.shared.restricted.subscribe()
    }

    /// Subscribe as a consumer that receives every frame.
    pub fn subscribe_unrestricted(&self) -> broadcast::Receiver<Arc<T>> {
        self.shared.unrestricted.subscribe()
    }

    /// Live restricted receivers.
    pub fn restricted_subscriber_count(&self) -> usize {
        self.shared.restricted.receiver_count()
    }

    /// Live unrestricted receivers.
    pub fn unrestricted_subscriber_count(&self) -> usize {
        self.shared.unrestricted.receiver_count()
    }

    /// `f > 0` gates restricted delivery to one frame per `1000 / f` ms; `f <= 0` disables gating.
    pub fn set_fps(&self, fps: f64) {
        self.shared.fps_bits.store(fps.to_bits(), Ordering::Release);
        debug!(stream = %self.shared.name, fps, "Stream FPS updated");
    }

    /// Current FPS setting.
    pub fn fps(&self) -> f64 {
        self.shared.fps()
    }

    /// Pause delivery. Idempotent.
    pub fn suspend(&self) {
        if !self.shared.suspended.swap(true, Ordering::AcqRel) {
            debug!(stream = %self.shared.name, "Stream suspended");
        }
    }

    /// Resume delivery. Idempotent.
    pub fn resume(&self) {
        if self.shared.suspended.swap(false, Ordering::AcqRel) {
            debug!(stream = %self.shared.name, "Stream resumed");
        }
    }

    /// True while suspended.
    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    /// Stream name (`color`, `depth`).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Frames evicted by queue overflow so far.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Frames currently buffered.
    pub fn buffered_frames(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stop the polling task. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            debug!(stream = %self.shared.name, "Stream stopped");
        }
    }
}

impl<T> Drop for FrameStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_polling_loop<T: Send + Sync + 'static>(
    shared: Arc<StreamShared<T>>,
    cancel: CancellationToken,
) {
    let mut last_restricted: Option<Instant> = None;

    while !cancel.is_cancelled() {
        if shared.suspended.load(Ordering::Acquire) {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(SUSPENDED_POLL_INTERVAL) => {}
            }
            continue;
        }

        let next = shared.queue.lock().dequeue();
        let frame = match next {
            Some(frame) => frame,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(EMPTY_POLL_INTERVAL) => {}
                }
                continue;
            }
        };

        if shared.unrestricted.receiver_count() > 0 {
            let _ = shared.unrestricted.send(frame.clone());
        }

        if shared.restricted.receiver_count() > 0 && !shared.suspended.load(Ordering::Acquire) {
            let now = Instant::now();
            let due = match (last_restricted, delivery_interval(shared.fps())) {
                (Some(last), Some(interval)) => now.duration_since(last) >= interval,
                _ => true,
            };
            if due {
                let _ = shared.restricted.send(frame);
                last_restricted = Some(now);
            }
        }
    }
}
