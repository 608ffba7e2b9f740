//! # Volume Station
//!
//! Core library for the `volume-station` parcel dimensioning service. It streams frames from
//! a depth camera, talks to scales, barcode scanners, range meters and relay boards over
//! serial lines, measures object dimensions from repeated depth samples, and reports the
//! result to HTTP callers, WebSocket dashboards and result senders.
//!
//! ## Crate Structure
//!
//! - **`config`**: Station configuration loaded from TOML and environment variables with
//!   `figment`. See `config::StationConfig`.
//! - **`error`**: The `StationError` enum shared by every layer.
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`stream`**: Frame types, the fixed-capacity frame queue and the rate-gated
//!   `FrameStream` relay.
//! - **`devices`**: Device capability traits, serial protocol adapters, the name-based device
//!   registry, `DeviceSet` and `DeviceEventGenerator`.
//! - **`capture`**: The volume algorithm boundary, frame collection and the multi-sample
//!   capture session with mode aggregation.
//! - **`result`**: `CalculationStatus`, `CalculationResult` and its XML rendering.
//! - **`server`**: HTTP trigger endpoint and WebSocket dashboard.
//! - **`senders`**: Outbound result senders.
//! - **`station`**: The calculation coordinator and the running `Station`.

pub mod capture;
pub mod config;
pub mod devices;
pub mod error;
pub mod logging;
pub mod result;
pub mod senders;
pub mod server;
pub mod station;
pub mod stream;

pub use error::{AppResult, StationError};
