//! Frame delivery: payload types, the bounded queue and the rate-gated stream.

pub mod frame;
pub mod frame_stream;
pub mod queue;

pub use frame::{ColorImage, DepthMap};
pub use frame_stream::{delivery_interval, FrameStream, UNLIMITED_FPS};
pub use queue::{FixedCapacityQueue, FRAME_QUEUE_CAPACITY};

/// Name of the color stream of a frame provider.
pub const COLOR_STREAM: &str = "color";

/// Name of the depth stream of a frame provider.
pub const DEPTH_STREAM: &str = "depth";
