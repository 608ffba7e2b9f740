//! Network cameras used for parcel photos.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::stream::ColorImage;

/// PTZ network camera.
#[async_trait]
pub trait IpCamera: Send + Sync {
    /// Open the control session. Returns `false` on failure.
    async fn connect(&self) -> bool;

    /// Move to a stored position. Returns `false` on failure.
    async fn go_to_preset(&self, preset: u32) -> bool;

    /// Take a still image.
    async fn snapshot(&self) -> Option<ColorImage>;

    /// Close the control session.
    async fn disconnect(&self) -> bool;

    /// True after a successful [`connect`](Self::connect).
    fn is_initialized(&self) -> bool;
}

/// Camera stand-in that remembers the requested preset.
#[derive(Debug, Default)]
pub struct FakeIpCamera {
    connected: AtomicBool,
    preset: Mutex<Option<u32>>,
}

impl FakeIpCamera {
    /// Create a disconnected camera.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last preset the camera moved to.
    pub fn active_preset(&self) -> Option<u32> {
        *self.preset.lock()
    }
}

#[async_trait]
impl IpCamera for FakeIpCamera {
    async fn connect(&self) -> bool {
        self.connected.store(true, Ordering::Release);
        info!("Fake IP camera connected");
        true
    }

    async fn go_to_preset(&self, preset: u32) -> bool {
        if !self.is_initialized() {
            return false;
        }
        *self.preset.lock() = Some(preset);
        true
    }

    async fn snapshot(&self) -> Option<ColorImage> {
        self.is_initialized()
            .then(|| ColorImage::filled(64, 48, [128, 128, 128]))
    }

    async fn disconnect(&self) -> bool {
        self.connected.store(false, Ordering::Release);
        true
    }

    fn is_initialized(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_preset_requires_connection() {
        let camera = FakeIpCamera::new();
        assert!(!camera.go_to_preset(2).await);
        assert!(camera.snapshot().await.is_none());

        assert!(camera.connect().await);
        assert!(camera.go_to_preset(2).await);
        assert_eq!(camera.active_preset(), Some(2));
        assert!(camera.snapshot().await.is_some());

        assert!(camera.disconnect().await);
        assert!(!camera.is_initialized());
    }
}
