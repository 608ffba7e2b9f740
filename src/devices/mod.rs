//! Station peripherals.
//!
//! Each device family has a capability trait ([`Scales`], [`BarcodeScanner`],
//! [`IoCircuit`], [`RangeMeter`], [`FrameProvider`], [`IpCamera`]) with the vendor logic
//! behind it. Devices are created by name through the [`DeviceRegistry`] and bundled into
//! a [`DeviceSet`]; [`DeviceEventGenerator`] merges their output into one event channel.

pub mod camera;
pub mod events;
pub mod io_circuit;
pub mod ip_camera;
pub mod range_meter;
pub mod registry;
pub mod scales;
pub mod scanners;
pub mod serial;
pub mod set;

pub use camera::{FakeFrameProvider, FakeSceneConfig, FrameProvider};
pub use events::{DeviceEvent, DeviceEventGenerator, PalletSettings};
pub use io_circuit::{IoCircuit, KeUsb24R, LineRequestState, LINE_POLL_TIMED_OUT};
pub use ip_camera::{FakeIpCamera, IpCamera};
pub use range_meter::{CustomRangeMeter, FakeRangeMeter, RangeMeter, RANGE_READING_FAILED};
pub use registry::{Device, DeviceFactory, DeviceKind, DeviceRegistry};
pub use scales::{ScaleReading, ScaleStatus, Scales, SerialScales};
pub use scanners::{BarcodeScanner, KeyboardScanner, SerialBarcodeScanner};
pub use set::{DeviceSet, DeviceSetFactory};
