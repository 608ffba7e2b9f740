//! The bundle of devices one station runs with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::camera::FrameProvider;
use super::io_circuit::IoCircuit;
use super::ip_camera::IpCamera;
use super::range_meter::RangeMeter;
use super::registry::{Device, DeviceKind, DeviceRegistry};
use super::scales::Scales;
use super::scanners::BarcodeScanner;
use crate::config::{DeviceEntry, DevicesConfig};
use crate::error::{AppResult, StationError};

/// Name of the scanner that needs no port.
pub const KEYBOARD_SCANNER: &str = "keyboard";

/// Devices attached to the station. Only the frame provider is mandatory.
pub struct DeviceSet {
    /// Depth camera
    pub frame_provider: Arc<dyn FrameProvider>,
    /// Scale
    pub scales: Option<Arc<dyn Scales>>,
    /// Barcode scanners
    pub scanners: Vec<Arc<dyn BarcodeScanner>>,
    /// Relay/line board
    pub io_circuit: Option<Arc<dyn IoCircuit>>,
    /// Range meter
    pub range_meter: Option<Arc<dyn RangeMeter>>,
    /// Photo camera
    pub ip_camera: Option<Arc<dyn IpCamera>>,
    closed: AtomicBool,
}

impl DeviceSet {
    /// Set with only a frame provider.
    pub fn new(frame_provider: Arc<dyn FrameProvider>) -> Self {
        Self {
            frame_provider,
            scales: None,
            scanners: Vec::new(),
            io_circuit: None,
            range_meter: None,
            ip_camera: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Add a scale.
    pub fn with_scales(mut self, scales: Arc<dyn Scales>) -> Self {
        self.scales = Some(scales);
        self
    }

    /// Add a scanner.
    pub fn with_scanner(mut self, scanner: Arc<dyn BarcodeScanner>) -> Self {
        self.scanners.push(scanner);
        self
    }

    /// Add an I/O board.
    pub fn with_io_circuit(mut self, circuit: Arc<dyn IoCircuit>) -> Self {
        self.io_circuit = Some(circuit);
        self
    }

    /// Add a range meter.
    pub fn with_range_meter(mut self, meter: Arc<dyn RangeMeter>) -> Self {
        self.range_meter = Some(meter);
        self
    }

    /// Add an IP camera.
    pub fn with_ip_camera(mut self, camera: Arc<dyn IpCamera>) -> Self {
        self.ip_camera = Some(camera);
        self
    }

    /// Pause or resume every scanner.
    pub fn toggle_scanners(&self, pause: bool) {
        for scanner in &self.scanners {
            scanner.toggle_pause(pause);
        }
    }

    /// True once [`shutdown`](Self::shutdown) ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every device. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for scanner in &self.scanners {
            scanner.shutdown().await;
        }
        if let Some(scales) = &self.scales {
            scales.shutdown().await;
        }
        if let Some(circuit) = &self.io_circuit {
            circuit.shutdown().await;
        }
        if let Some(meter) = &self.range_meter {
            meter.shutdown().await;
        }
        if let Some(camera) = &self.ip_camera {
            let _ = camera.disconnect().await;
        }
        self.frame_provider.shutdown().await;
        info!("Device set closed");
    }
}

fn wrong_kind(entry: &DeviceEntry, kind: DeviceKind) -> StationError {
    StationError::device_init(
        format!("{kind} {}", entry.name),
        "factory produced a different device kind",
    )
}

/// Builds a [`DeviceSet`] from the `[devices]` section.
pub struct DeviceSetFactory;

impl DeviceSetFactory {
    /// Open every configured device.
    ///
    /// Optional devices are skipped when their entry is incomplete. Any device that fails
    /// to open aborts the whole set; devices opened so far are closed again.
    pub async fn create(config: &DevicesConfig, registry: &DeviceRegistry) -> AppResult<DeviceSet> {
        info!(name = %config.camera.name, "Creating frame provider");
        let provider = registry
            .create(
                DeviceKind::FrameProvider,
                &config.camera.name,
                config.camera.factory_config(),
            )
            .await?
            .into_frame_provider()
            .ok_or_else(|| wrong_kind(&config.camera, DeviceKind::FrameProvider))?;
        provider.set_color_fps(config.camera_fps);
        provider.set_depth_fps(config.camera_fps);
        provider.start();

        let mut set = DeviceSet::new(provider);
        match Self::populate(&mut set, config, registry).await {
            Ok(()) => Ok(set),
            Err(e) => {
                warn!(error = %e, "Device set creation failed, closing opened devices");
                set.shutdown().await;
                Err(e)
            }
        }
    }

    async fn populate(
        set: &mut DeviceSet,
        config: &DevicesConfig,
        registry: &DeviceRegistry,
    ) -> AppResult<()> {
        for entry in &config.scanners {
            if entry.port.is_empty() && entry.name != KEYBOARD_SCANNER {
                warn!(name = %entry.name, "Scanner without port skipped");
                continue;
            }
            info!(name = %entry.name, port = %entry.port, "Creating scanner");
            let scanner = registry
                .create(DeviceKind::Scanner, &entry.name, entry.factory_config())
                .await?
                .into_scanner()
                .ok_or_else(|| wrong_kind(entry, DeviceKind::Scanner))?;
            set.scanners.push(scanner);
        }

        if let Some(entry) = config.scales.as_ref().filter(|e| e.has_name_and_port()) {
            info!(name = %entry.name, port = %entry.port, "Creating scales");
            let scales = registry
                .create(DeviceKind::Scales, &entry.name, entry.factory_config())
                .await?
                .into_scales()
                .ok_or_else(|| wrong_kind(entry, DeviceKind::Scales))?;
            set.scales = Some(scales);
        }

        if let Some(entry) = config.io_circuit.as_ref().filter(|e| e.has_name_and_port()) {
            info!(name = %entry.name, port = %entry.port, "Creating IO circuit");
            let circuit = registry
                .create(DeviceKind::IoCircuit, &entry.name, entry.factory_config())
                .await?
                .into_io_circuit()
                .ok_or_else(|| wrong_kind(entry, DeviceKind::IoCircuit))?;
            set.io_circuit = Some(circuit);
        }

        if let Some(entry) = config.range_meter.as_ref().filter(|e| !e.name.is_empty()) {
            info!(name = %entry.name, "Creating range meter");
            let meter = registry
                .create(DeviceKind::RangeMeter, &entry.name, entry.factory_config())
                .await?
                .into_range_meter()
                .ok_or_else(|| wrong_kind(entry, DeviceKind::RangeMeter))?;
            set.range_meter = Some(meter);
        }

        if let Some(entry) = config.ip_camera.as_ref().filter(|e| !e.name.is_empty()) {
            info!(name = %entry.name, "Creating IP camera");
            let camera = registry
                .create(DeviceKind::IpCamera, &entry.name, entry.factory_config())
                .await?
                .into_ip_camera()
                .ok_or_else(|| wrong_kind(entry, DeviceKind::IpCamera))?;
            set.ip_camera = Some(camera.clone());
            if !camera.connect().await {
                return Err(StationError::device_init(
                    format!("ip_camera {}", entry.name),
                    "failed to connect",
                ));
            }
            if !camera.go_to_preset(config.ip_camera_preset).await {
                return Err(StationError::device_init(
                    format!("ip_camera {}", entry.name),
                    format!("failed to go to preset {}", config.ip_camera_preset),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_config() -> DevicesConfig {
        DevicesConfig {
            scales: Some(DeviceEntry::new("fakescales", "sim")),
            range_meter: Some(DeviceEntry::new("fake", "")),
            ip_camera: Some(DeviceEntry::new("fake", "")),
            scanners: vec![DeviceEntry::new("generic", "")],
            io_circuit: Some(DeviceEntry::new("keusb24r", "")),
            ip_camera_preset: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_applies_skip_rules() {
        let registry = DeviceRegistry::with_builtin();
        let set = DeviceSetFactory::create(&fake_config(), &registry).await.unwrap();

        assert!(set.scales.is_some());
        assert!(set.range_meter.is_some());
        assert!(set.ip_camera.as_ref().unwrap().is_initialized());
        assert!(set.scanners.is_empty());
        assert!(set.io_circuit.is_none());
        assert_eq!(set.frame_provider.depth_stream().fps(), 5.0);
        assert_eq!(set.frame_provider.color_stream().fps(), 5.0);

        set.shutdown().await;
        assert!(set.is_closed());
        set.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_camera_is_fatal() {
        let registry = DeviceRegistry::with_builtin();
        let config = DevicesConfig {
            camera: DeviceEntry::new("kinect", ""),
            ..Default::default()
        };
        let err = DeviceSetFactory::create(&config, &registry).await.err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_failing_device_aborts_creation() {
        let registry = DeviceRegistry::with_builtin();
        let config = DevicesConfig {
            scales: Some(DeviceEntry::new("massak", "/dev/does-not-exist-42")),
            ..Default::default()
        };
        let err = DeviceSetFactory::create(&config, &registry).await.err().unwrap();
        assert!(matches!(err, StationError::Serial { .. }));
    }
}
