//! Device factory registry.
//!
//! Maps `(kind, name)` pairs from the configuration to constructors:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ DeviceRegistry                               │
//! │  (Scales, "massak")     → SerialScalesFactory │
//! │  (IoCircuit, "keusb24r") → KeUsb24RFactory    │
//! │  ...                                         │
//! └──────────────────────────────────────────────┘
//!                   │ create(kind, name, config)
//!                   ▼
//!        validate(&config) → build(config).await → Device
//! ```
//!
//! # Example: Registering a custom scale
//!
//! ```rust,ignore
//! let registry = DeviceRegistry::with_builtin();
//! registry.register_factory(SerialScalesFactory::new("acme", || Arc::new(AcmeDecoder)));
//! let device = registry.create(DeviceKind::Scales, "acme", config).await?;
//! ```

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

use super::camera::{FakeFrameProvider, FakeSceneConfig, FrameProvider};
use super::io_circuit::{IoCircuit, KeUsb24R};
use super::ip_camera::{FakeIpCamera, IpCamera};
use super::range_meter::{CustomRangeMeter, FakeRangeMeter, RangeMeter};
use super::scales::{
    CasMDecoder, Ci2001ADecoder, FakeScales, MassaKDecoder, OkaDecoder, ScaleDecoder, Scales,
    SerialScales, SerialScalesConfig,
};
use super::scanners::{BarcodeScanner, KeyboardScanner, SerialBarcodeScanner};
use super::serial::open_serial_async;
use crate::error::{AppResult, StationError};

/// Device category, the first half of a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Weighing scale
    Scales,
    /// Barcode scanner
    Scanner,
    /// Relay/line board
    IoCircuit,
    /// Distance sensor
    RangeMeter,
    /// Depth camera
    FrameProvider,
    /// Network photo camera
    IpCamera,
}

impl DeviceKind {
    /// Lower-case name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scales => "scales",
            Self::Scanner => "scanner",
            Self::IoCircuit => "io_circuit",
            Self::RangeMeter => "range_meter",
            Self::FrameProvider => "frame_provider",
            Self::IpCamera => "ip_camera",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A constructed device.
#[derive(Clone)]
pub enum Device {
    /// Scale
    Scales(Arc<dyn Scales>),
    /// Scanner
    Scanner(Arc<dyn BarcodeScanner>),
    /// I/O board
    IoCircuit(Arc<dyn IoCircuit>),
    /// Range meter
    RangeMeter(Arc<dyn RangeMeter>),
    /// Depth camera
    FrameProvider(Arc<dyn FrameProvider>),
    /// IP camera
    IpCamera(Arc<dyn IpCamera>),
}

impl Device {
    /// Category of this device.
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Scales(_) => DeviceKind::Scales,
            Self::Scanner(_) => DeviceKind::Scanner,
            Self::IoCircuit(_) => DeviceKind::IoCircuit,
            Self::RangeMeter(_) => DeviceKind::RangeMeter,
            Self::FrameProvider(_) => DeviceKind::FrameProvider,
            Self::IpCamera(_) => DeviceKind::IpCamera,
        }
    }

    /// The scale, if this is one.
    pub fn into_scales(self) -> Option<Arc<dyn Scales>> {
        match self {
            Self::Scales(scales) => Some(scales),
            _ => None,
        }
    }

    /// The scanner, if this is one.
    pub fn into_scanner(self) -> Option<Arc<dyn BarcodeScanner>> {
        match self {
            Self::Scanner(scanner) => Some(scanner),
            _ => None,
        }
    }

    /// The I/O board, if this is one.
    pub fn into_io_circuit(self) -> Option<Arc<dyn IoCircuit>> {
        match self {
            Self::IoCircuit(circuit) => Some(circuit),
            _ => None,
        }
    }

    /// The range meter, if this is one.
    pub fn into_range_meter(self) -> Option<Arc<dyn RangeMeter>> {
        match self {
            Self::RangeMeter(meter) => Some(meter),
            _ => None,
        }
    }

    /// The depth camera, if this is one.
    pub fn into_frame_provider(self) -> Option<Arc<dyn FrameProvider>> {
        match self {
            Self::FrameProvider(provider) => Some(provider),
            _ => None,
        }
    }

    /// The IP camera, if this is one.
    pub fn into_ip_camera(self) -> Option<Arc<dyn IpCamera>> {
        match self {
            Self::IpCamera(camera) => Some(camera),
            _ => None,
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Device").field(&self.kind()).finish()
    }
}

/// Constructor for one `(kind, name)` pair.
pub trait DeviceFactory: Send + Sync + 'static {
    /// Category produced by this factory.
    fn kind(&self) -> DeviceKind;

    /// Name used in the configuration, e.g. `"massak"`.
    fn name(&self) -> &'static str;

    /// Check the settings table without opening anything.
    fn validate(&self, config: &toml::Value) -> anyhow::Result<()>;

    /// Open the hardware and return the device.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, AppResult<Device>>;
}

#[derive(Debug, Clone, Deserialize)]
struct PortConfig {
    port: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RangeMeterConfig {
    #[serde(default)]
    subtraction_mm: i32,
}

fn parse<T: serde::de::DeserializeOwned>(config: toml::Value) -> anyhow::Result<T> {
    Ok(config.try_into()?)
}

fn build_error(name: &str, err: impl fmt::Display) -> StationError {
    StationError::device_init(name, err)
}

/// Serial scale with a vendor decoder.
pub struct SerialScalesFactory {
    name: &'static str,
    decoder: fn() -> Arc<dyn ScaleDecoder>,
}

impl SerialScalesFactory {
    /// Register `decoder` under `name`.
    pub fn new(name: &'static str, decoder: fn() -> Arc<dyn ScaleDecoder>) -> Self {
        Self { name, decoder }
    }
}

impl DeviceFactory for SerialScalesFactory {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Scales
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: SerialScalesConfig = parse(config.clone())?;
        if cfg.port.is_empty() {
            anyhow::bail!("missing 'port'");
        }
        if cfg.min_weight_g < 0.0 {
            anyhow::bail!("'min_weight_g' must not be negative");
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, AppResult<Device>> {
        let name = self.name;
        let decoder = (self.decoder)();
        Box::pin(async move {
            let cfg: SerialScalesConfig = parse(config).map_err(|e| build_error(name, e))?;
            let port = open_serial_async(&cfg.port, &decoder.serial_settings(), name).await?;
            let scales = SerialScales::attach(port, decoder, cfg.min_weight_g, cfg.filter());
            Ok(Device::Scales(Arc::new(scales)))
        })
    }
}

struct FakeScalesFactory;

impl DeviceFactory for FakeScalesFactory {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Scales
    }

    fn name(&self) -> &'static str {
        "fakescales"
    }

    fn validate(&self, _config: &toml::Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn build(&self, _config: toml::Value) -> BoxFuture<'static, AppResult<Device>> {
        Box::pin(async move { Ok(Device::Scales(Arc::new(FakeScales::spawn()))) })
    }
}

struct SerialScannerFactory;

impl DeviceFactory for SerialScannerFactory {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Scanner
    }

    fn name(&self) -> &'static str {
        "generic"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let _: PortConfig = parse(config.clone())?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, AppResult<Device>> {
        Box::pin(async move {
            let cfg: PortConfig = parse(config).map_err(|e| build_error("generic", e))?;
            let port =
                open_serial_async(&cfg.port, &SerialBarcodeScanner::serial_settings(), "generic")
                    .await?;
            let scanner = SerialBarcodeScanner::attach(port, &cfg.port);
            Ok(Device::Scanner(Arc::new(scanner)))
        })
    }
}

struct KeyboardScannerFactory;

impl DeviceFactory for KeyboardScannerFactory {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Scanner
    }

    fn name(&self) -> &'static str {
        "keyboard"
    }

    fn validate(&self, _config: &toml::Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn build(&self, _config: toml::Value) -> BoxFuture<'static, AppResult<Device>> {
        Box::pin(async move { Ok(Device::Scanner(Arc::new(KeyboardScanner::stdin()))) })
    }
}

struct KeUsb24RFactory;

impl DeviceFactory for KeUsb24RFactory {
    fn kind(&self) -> DeviceKind {
        DeviceKind::IoCircuit
    }

    fn name(&self) -> &'static str {
        "keusb24r"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let _: PortConfig = parse(config.clone())?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, AppResult<Device>> {
        Box::pin(async move {
            let cfg: PortConfig = parse(config).map_err(|e| build_error("keusb24r", e))?;
            let port = open_serial_async(&cfg.port, &KeUsb24R::serial_settings(), "keusb24r").await?;
            Ok(Device::IoCircuit(Arc::new(KeUsb24R::attach(port, cfg.port))))
        })
    }
}

struct CustomRangeMeterFactory;

impl DeviceFactory for CustomRangeMeterFactory {
    fn kind(&self) -> DeviceKind {
        DeviceKind::RangeMeter
    }

    fn name(&self) -> &'static str {
        "custom"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let _: PortConfig = parse(config.clone())?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, AppResult<Device>> {
        Box::pin(async move {
            let cfg: PortConfig = parse(config.clone()).map_err(|e| build_error("custom", e))?;
            let extra: RangeMeterConfig = parse(config).unwrap_or_default();
            let port =
                open_serial_async(&cfg.port, &CustomRangeMeter::serial_settings(), "custom").await?;
            let meter = CustomRangeMeter::attach(port, cfg.port);
            meter.set_subtraction_mm(extra.subtraction_mm);
            Ok(Device::RangeMeter(Arc::new(meter)))
        })
    }
}

struct FakeRangeMeterFactory;

impl DeviceFactory for FakeRangeMeterFactory {
    fn kind(&self) -> DeviceKind {
        DeviceKind::RangeMeter
    }

    fn name(&self) -> &'static str {
        "fake"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let _: RangeMeterConfig = parse(config.clone())?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, AppResult<Device>> {
        Box::pin(async move {
            let cfg: RangeMeterConfig = parse(config).map_err(|e| build_error("fake", e))?;
            let meter = FakeRangeMeter::new();
            meter.set_subtraction_mm(cfg.subtraction_mm);
            Ok(Device::RangeMeter(Arc::new(meter)))
        })
    }
}

struct FakeFrameProviderFactory;

impl DeviceFactory for FakeFrameProviderFactory {
    fn kind(&self) -> DeviceKind {
        DeviceKind::FrameProvider
    }

    fn name(&self) -> &'static str {
        "fake"
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let scene: FakeSceneConfig = parse(config.clone())?;
        if scene.width == 0 || scene.height == 0 {
            anyhow::bail!("scene resolution must be non-zero");
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, AppResult<Device>> {
        Box::pin(async move {
            let scene: FakeSceneConfig = parse(config).map_err(|e| build_error("fake", e))?;
            Ok(Device::FrameProvider(Arc::new(FakeFrameProvider::new(scene))))
        })
    }
}

struct FakeIpCameraFactory;

impl DeviceFactory for FakeIpCameraFactory {
    fn kind(&self) -> DeviceKind {
        DeviceKind::IpCamera
    }

    fn name(&self) -> &'static str {
        "fake"
    }

    fn validate(&self, _config: &toml::Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn build(&self, _config: toml::Value) -> BoxFuture<'static, AppResult<Device>> {
        Box::pin(async move { Ok(Device::IpCamera(Arc::new(FakeIpCamera::new()))) })
    }
}

/// Registry of device factories keyed by kind and name.
#[derive(Default)]
pub struct DeviceRegistry {
    factories: DashMap<(DeviceKind, &'static str), Arc<dyn DeviceFactory>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every bundled driver.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register_factory(FakeScalesFactory);
        registry.register_factory(SerialScalesFactory::new("massak", || Arc::new(MassaKDecoder)));
        registry.register_factory(SerialScalesFactory::new("casm", || Arc::new(CasMDecoder)));
        registry.register_factory(SerialScalesFactory::new("ci2001a", || Arc::new(Ci2001ADecoder)));
        registry.register_factory(SerialScalesFactory::new("oka", || Arc::new(OkaDecoder)));
        registry.register_factory(SerialScannerFactory);
        registry.register_factory(KeyboardScannerFactory);
        registry.register_factory(KeUsb24RFactory);
        registry.register_factory(CustomRangeMeterFactory);
        registry.register_factory(FakeRangeMeterFactory);
        registry.register_factory(FakeFrameProviderFactory);
        registry.register_factory(FakeIpCameraFactory);
        registry
    }

    /// Add or replace a factory.
    pub fn register_factory<F: DeviceFactory>(&self, factory: F) {
        self.factories
            .insert((factory.kind(), factory.name()), Arc::new(factory));
    }

    /// True if a factory exists for the pair.
    pub fn contains(&self, kind: DeviceKind, name: &str) -> bool {
        self.factory(kind, name).is_some()
    }

    /// Registered names for one kind, sorted.
    pub fn names(&self, kind: DeviceKind) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .factories
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| entry.key().1)
            .collect();
        names.sort_unstable();
        names
    }

    fn factory(&self, kind: DeviceKind, name: &str) -> Option<Arc<dyn DeviceFactory>> {
        self.factories
            .iter()
            .find(|entry| entry.key().0 == kind && entry.key().1 == name)
            .map(|entry| entry.value().clone())
    }

    /// Validate `config` and build the device registered as `(kind, name)`.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` for an unknown pair, `DeviceInit` when validation fails, or the
    /// factory's own error when the hardware cannot be opened.
    pub async fn create(&self, kind: DeviceKind, name: &str, config: toml::Value) -> AppResult<Device> {
        let factory = self
            .factory(kind, name)
            .ok_or_else(|| StationError::DeviceNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })?;
        factory
            .validate(&config)
            .map_err(|e| StationError::device_init(format!("{kind} {name}"), e))?;
        tracing::info!(kind = %kind, name, "Creating device");
        factory.build(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(entries: &[(&str, toml::Value)]) -> toml::Value {
        let mut table = toml::Table::new();
        for (key, value) in entries {
            table.insert((*key).to_string(), value.clone());
        }
        toml::Value::Table(table)
    }

    #[test]
    fn test_builtin_names() {
        let registry = DeviceRegistry::with_builtin();
        assert_eq!(
            registry.names(DeviceKind::Scales),
            vec!["casm", "ci2001a", "fakescales", "massak", "oka"]
        );
        assert_eq!(registry.names(DeviceKind::Scanner), vec!["generic", "keyboard"]);
        assert_eq!(registry.names(DeviceKind::IoCircuit), vec!["keusb24r"]);
        assert_eq!(registry.names(DeviceKind::RangeMeter), vec!["custom", "fake"]);
        assert!(registry.contains(DeviceKind::FrameProvider, "fake"));
        assert!(registry.contains(DeviceKind::IpCamera, "fake"));
        assert!(!registry.contains(DeviceKind::IpCamera, "proline"));
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let registry = DeviceRegistry::with_builtin();
        let err = registry
            .create(DeviceKind::Scales, "acme", table(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StationError::DeviceNotFound { .. }));
        assert_eq!(err.to_string(), "Device not found: scales \"acme\"");
    }

    #[tokio::test]
    async fn test_validation_failure_is_device_init() {
        let registry = DeviceRegistry::with_builtin();
        let err = registry
            .create(DeviceKind::Scales, "massak", table(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StationError::DeviceInit { .. }));
    }

    #[tokio::test]
    async fn test_missing_port_fails_to_open() {
        let registry = DeviceRegistry::with_builtin();
        let config = table(&[("port", toml::Value::String("/dev/does-not-exist-42".into()))]);
        let err = registry
            .create(DeviceKind::IoCircuit, "keusb24r", config)
            .await
            .unwrap_err();
        assert!(matches!(err, StationError::Serial { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_create_fake_devices() {
        let registry = DeviceRegistry::with_builtin();
        let meter = registry
            .create(
                DeviceKind::RangeMeter,
                "fake",
                table(&[("subtraction_mm", toml::Value::Integer(10))]),
            )
            .await
            .unwrap();
        match meter {
            Device::RangeMeter(meter) => assert_eq!(meter.get_reading().await, 1100),
            other => panic!("unexpected device {other:?}"),
        }

        let camera = registry
            .create(DeviceKind::FrameProvider, "fake", table(&[]))
            .await
            .unwrap();
        assert_eq!(camera.kind(), DeviceKind::FrameProvider);
        if let Device::FrameProvider(provider) = camera {
            provider.shutdown().await;
        }
    }
}
