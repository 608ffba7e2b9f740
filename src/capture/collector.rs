//! Frame collection for a capture.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::error::{AppResult, StationError};
use crate::stream::{ColorImage, DepthMap, FrameStream};

/// Default wait for the next frame pair.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(3);

/// Frames gathered for one capture, paired by index.
#[derive(Debug, Clone, Default)]
pub struct CollectedFrames {
    /// Color images
    pub images: Vec<Arc<ColorImage>>,
    /// Depth maps
    pub depth_maps: Vec<Arc<DepthMap>>,
}

/// Pulls frame pairs from the unrestricted side of a camera's streams.
pub struct FrameCollector;

impl FrameCollector {
    /// Collect `count` color/depth pairs. The timeout restarts after every pair.
    ///
    /// # Errors
    ///
    /// `StationError::Timeout` when a pair does not arrive in time, or when a stream closes.
    pub async fn collect(
        color: &FrameStream<ColorImage>,
        depth: &FrameStream<DepthMap>,
        count: usize,
        timeout: Duration,
    ) -> AppResult<CollectedFrames> {
        let mut color_rx = color.subscribe_unrestricted();
        let mut depth_rx = depth.subscribe_unrestricted();
        let mut frames = CollectedFrames::default();

        while frames.images.len() < count {
            let pair = tokio::time::timeout(timeout, async {
                let image = next_frame(&mut color_rx).await?;
                let depth_map = next_frame(&mut depth_rx).await?;
                Some((image, depth_map))
            })
            .await;

            match pair {
                Ok(Some((image, depth_map))) => {
                    frames.images.push(image);
                    frames.depth_maps.push(depth_map);
                }
                Ok(None) => {
                    return Err(StationError::Timeout("frame stream closed".to_string()));
                }
                Err(_) => {
                    warn!(
                        collected = frames.images.len(),
                        required = count,
                        "Timed out waiting for frames"
                    );
                    return Err(StationError::Timeout(format!(
                        "frame pair {} of {} did not arrive within {:?}",
                        frames.images.len() + 1,
                        count,
                        timeout
                    )));
                }
            }
        }
        debug!(pairs = count, "Frames collected");
        Ok(frames)
    }
}

async fn next_frame<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(frame) => return Some(frame),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Frame subscriber lagged"),
            Err(RecvError::Closed) => return None,
        }
    }
}
