//! Depth/color frame providers.
//!
//! A provider owns one [`FrameStream`] per frame type and pushes owned frames into them.
//! Vendor SDK callbacks must copy the native buffer (see [`ColorImage::from_raw`],
//! [`DepthMap::from_raw`]) before pushing; no SDK memory reaches the streams.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::stream::{ColorImage, DepthMap, FrameStream, COLOR_STREAM, DEPTH_STREAM};

/// Camera capability interface.
#[async_trait]
pub trait FrameProvider: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Begin producing frames. Idempotent.
    fn start(&self);

    /// Stop producing and close both streams. Idempotent.
    async fn shutdown(&self);

    /// Color frames.
    fn color_stream(&self) -> &FrameStream<ColorImage>;

    /// Depth frames.
    fn depth_stream(&self) -> &FrameStream<DepthMap>;

    /// Pause color delivery.
    fn suspend_color(&self) {
        self.color_stream().suspend();
    }

    /// Resume color delivery.
    fn resume_color(&self) {
        self.color_stream().resume();
    }

    /// Pause depth delivery.
    fn suspend_depth(&self) {
        self.depth_stream().suspend();
    }

    /// Resume depth delivery.
    fn resume_depth(&self) {
        self.depth_stream().resume();
    }

    /// Gate color delivery.
    fn set_color_fps(&self, fps: f64) {
        self.color_stream().set_fps(fps);
    }

    /// Gate depth delivery.
    fn set_depth_fps(&self, fps: f64) {
        self.depth_stream().set_fps(fps);
    }
}

/// Scene rendered by [`FakeFrameProvider`]: a flat floor with one box on it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FakeSceneConfig {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Floor distance from the camera
    pub floor_depth_mm: i16,
    /// Distance from the camera to the box top
    pub box_depth_mm: i16,
    /// Box footprint in pixels: left, top, width, height
    pub box_rect: [u32; 4],
    /// Time between produced frames
    pub frame_interval_ms: u64,
}

impl Default for FakeSceneConfig {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            floor_depth_mm: 1500,
            box_depth_mm: 1200,
            box_rect: [40, 30, 80, 60],
            frame_interval_ms: 33,
        }
    }
}

impl FakeSceneConfig {
    fn in_box(&self, x: u32, y: u32) -> bool {
        let [left, top, w, h] = self.box_rect;
        x >= left && x < left + w && y >= top && y < top + h
    }

    /// Render the depth map.
    pub fn depth_map(&self) -> DepthMap {
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                data.push(if self.in_box(x, y) {
                    self.box_depth_mm
                } else {
                    self.floor_depth_mm
                });
            }
        }
        DepthMap {
            width: self.width,
            height: self.height,
            data,
        }
    }

    /// Render the color image.
    pub fn color_image(&self) -> ColorImage {
        let mut image = ColorImage::filled(self.width, self.height, [90, 90, 90]);
        let stride = image.stride();
        for y in 0..self.height {
            for x in 0..self.width {
                if self.in_box(x, y) {
                    let offset = y as usize * stride + x as usize * 3;
                    image.data[offset..offset + 3].copy_from_slice(&[160, 120, 70]);
                }
            }
        }
        image
    }
}

/// Synthetic camera for bench setups and tests.
pub struct FakeFrameProvider {
    scene: FakeSceneConfig,
    color: Arc<FrameStream<ColorImage>>,
    depth: Arc<FrameStream<DepthMap>>,
    started: AtomicBool,
    cancel: CancellationToken,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl FakeFrameProvider {
    /// Create the provider; frames flow after [`FrameProvider::start`].
    pub fn new(scene: FakeSceneConfig) -> Self {
        Self {
            scene,
            color: Arc::new(FrameStream::spawn(COLOR_STREAM)),
            depth: Arc::new(FrameStream::spawn(DEPTH_STREAM)),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            producer: Mutex::new(None),
        }
    }

    /// Rendered scene.
    pub fn scene(&self) -> &FakeSceneConfig {
        &self.scene
    }
}

#[async_trait]
impl FrameProvider for FakeFrameProvider {
    fn name(&self) -> &str {
        "fake"
    }

    fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let color = self.color.clone();
        let depth = self.depth.clone();
        let cancel = self.cancel.clone();
        let color_frame = Arc::new(self.scene.color_image());
        let depth_frame = Arc::new(self.scene.depth_map());
        let interval = Duration::from_millis(self.scene.frame_interval_ms.max(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        color.push_shared(color_frame.clone());
                        depth.push_shared(depth_frame.clone());
                    }
                }
            }
        });
        *self.producer.lock() = Some(task);
        info!(
            width = self.scene.width,
            height = self.scene.height,
            "Fake frame provider started"
        );
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.producer.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.color.shutdown().await;
        self.depth.shutdown().await;
        debug!("Fake frame provider stopped");
    }

    fn color_stream(&self) -> &FrameStream<ColorImage> {
        &self.color
    }

    fn depth_stream(&self) -> &FrameStream<DepthMap> {
        &self.depth
    }
}

impl Drop for FakeFrameProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_rendering() {
        let scene = FakeSceneConfig::default();
        let depth = scene.depth_map();
        assert_eq!(depth.at(0, 0), Some(1500));
        assert_eq!(depth.at(40, 30), Some(1200));
        assert_eq!(depth.at(120, 30), Some(1500));

        let color = scene.color_image();
        let offset = 30 * color.stride() + 40 * 3;
        assert_eq!(&color.data[offset..offset + 3], &[160, 120, 70]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_streams_frames() {
        let provider = FakeFrameProvider::new(FakeSceneConfig::default());
        let mut depth = provider.depth_stream().subscribe_restricted();
        let mut color = provider.color_stream().subscribe_unrestricted();
        provider.start();
        provider.start();

        let frame = depth.recv().await.unwrap();
        assert_eq!(frame.width, 160);
        assert_eq!(color.recv().await.unwrap().height, 120);

        provider.suspend_depth();
        assert!(provider.depth_stream().is_suspended());
        provider.resume_depth();
        provider.set_color_fps(5.0);
        assert_eq!(provider.color_stream().fps(), 5.0);

        provider.shutdown().await;
        provider.shutdown().await;
    }
}
