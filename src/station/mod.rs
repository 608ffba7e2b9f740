//! Measurement coordination.
//!
//! [`CalculationCoordinator`] owns the station's measurement lifecycle: it tracks the latest
//! barcode and scale reading, accepts triggers from HTTP callers and dashboard clients,
//! runs one capture at a time, and distributes the result to the dashboard, the senders
//! and the caller.

pub mod indicators;
pub mod service;

pub use indicators::{indicate_status, LampPattern};
pub use service::Station;

use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::{
    distance_hint, AlgorithmSelectionStatus, CaptureSettings, FrameCollector, ObjectVolume,
    VolumeAlgorithm, VolumeCaptureSession,
};
use crate::config::AlgorithmConfig;
use crate::devices::{DeviceEvent, DeviceEventGenerator, DeviceSet, ScaleReading, ScaleStatus};
use crate::error::StationError;
use crate::result::{CalculationResult, CalculationStatus};
use crate::senders::SenderSet;
use crate::server::{
    CalculationRequest, ClientBroadcastSession, DashboardEvent, RequestData, RequestSession,
    SessionEvent, REQUEST_TIMED_OUT,
};
use crate::stream::ColorImage;

/// Everything a finished measurement produced.
#[derive(Debug, Clone)]
pub struct CalculationReport {
    /// Result record
    pub result: CalculationResult,
    /// Object photo, when frames were captured
    pub photo: Option<Arc<ColorImage>>,
    /// Algorithm chosen for the measurement
    pub algorithm: Option<AlgorithmSelectionStatus>,
    /// The range meter hint took part in the measurement
    pub range_meter_used: bool,
}

impl CalculationReport {
    fn status_only(result: CalculationResult) -> Self {
        Self {
            result,
            photo: None,
            algorithm: None,
            range_meter_used: false,
        }
    }
}

/// Scale dimensions down to a single unit and take off the pallet height.
///
/// The unit count entered for a pallet counts units on two layers, so the footprint is
/// divided by half of it (at least 1).
pub fn correct_for_pallet(
    volume: ObjectVolume,
    unit_count: u32,
    config: &AlgorithmConfig,
) -> ObjectVolume {
    if !config.enable_pallet_subtraction {
        return volume;
    }
    let units = i32::try_from((unit_count / 2).max(1)).unwrap_or(i32::MAX);
    ObjectVolume::new(
        volume.length_mm / units,
        volume.width_mm / units,
        volume.height_mm - config.pallet_height_mm,
    )
}

#[derive(Debug, Default)]
struct StationInputs {
    barcode: String,
    reading: ScaleReading,
    request: RequestData,
}

#[derive(Debug)]
struct ActiveCapture {
    cancel: CancellationToken,
    reason: CalculationStatus,
}

struct CaptureRun {
    status: CalculationStatus,
    volume: Option<ObjectVolume>,
    photo: Option<Arc<ColorImage>>,
    algorithm: Option<AlgorithmSelectionStatus>,
    range_meter_used: bool,
}

impl CaptureRun {
    fn failed(status: CalculationStatus) -> Self {
        Self {
            status,
            volume: None,
            photo: None,
            algorithm: None,
            range_meter_used: false,
        }
    }
}

/// Runs measurements one at a time.
pub struct CalculationCoordinator {
    devices: Arc<DeviceSet>,
    algorithm: Arc<dyn VolumeAlgorithm>,
    config: RwLock<AlgorithmConfig>,
    senders: SenderSet,
    dashboard: ClientBroadcastSession,
    running: AtomicBool,
    aborting: AtomicBool,
    idle: Notify,
    waiting_for_reset: AtomicBool,
    inputs: Mutex<StationInputs>,
    active: Mutex<Option<ActiveCapture>>,
}

impl CalculationCoordinator {
    /// Coordinator over `devices`, measuring with `algorithm`.
    pub fn new(
        devices: Arc<DeviceSet>,
        algorithm: Arc<dyn VolumeAlgorithm>,
        config: AlgorithmConfig,
        senders: SenderSet,
        dashboard: ClientBroadcastSession,
    ) -> Self {
        Self {
            devices,
            algorithm,
            config: RwLock::new(config),
            senders,
            dashboard,
            running: AtomicBool::new(false),
            aborting: AtomicBool::new(false),
            idle: Notify::new(),
            waiting_for_reset: AtomicBool::new(false),
            inputs: Mutex::new(StationInputs::default()),
            active: Mutex::new(None),
        }
    }

    /// True while a measurement runs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Barcode that the next measurement will use.
    pub fn current_barcode(&self) -> String {
        self.inputs.lock().barcode.clone()
    }

    /// Latest scale reading.
    pub fn current_reading(&self) -> ScaleReading {
        self.inputs.lock().reading
    }

    /// Dashboard this coordinator publishes to.
    pub fn dashboard(&self) -> &ClientBroadcastSession {
        &self.dashboard
    }

    /// Replace the algorithm settings. Refused while a measurement runs.
    pub fn update_settings(&self, config: AlgorithmConfig) -> bool {
        if self.is_running() {
            error!("Tried to assign settings while a calculation was running");
            return false;
        }
        *self.config.write() = config;
        true
    }

    /// Track scanner and scale output. Ignored while a measurement runs.
    pub fn handle_device_event(&self, event: DeviceEvent) {
        if self.is_running() {
            debug!(?event, "Device event ignored during calculation");
            return;
        }

        match event {
            DeviceEvent::Barcode(code) => {
                info!(barcode = %code, "Barcode received");
                self.inputs.lock().barcode = code;
            }
            DeviceEvent::Weight(reading) => {
                self.inputs.lock().reading = reading;
                if reading.status == ScaleStatus::Ready
                    && self.waiting_for_reset.swap(false, Ordering::AcqRel)
                {
                    self.publish_status(CalculationStatus::Undefined);
                }
            }
        }
    }

    /// Operator data from a dashboard client.
    pub fn update_request_data(&self, data: RequestData) {
        if self.is_running() {
            return;
        }
        let mut inputs = self.inputs.lock();
        if !data.barcode.is_empty() {
            inputs.barcode = data.barcode.clone();
        }
        inputs.request = data;
    }

    /// Abort the running measurement with `AbortedByUser`.
    pub fn abort(&self) -> bool {
        self.abort_with(CalculationStatus::AbortedByUser)
    }

    /// Abort the running measurement with `status`. False when nothing runs.
    pub fn abort_with(&self, status: CalculationStatus) -> bool {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(capture) => {
                warn!(?status, "Aborting calculation");
                capture.reason = status;
                self.aborting.store(true, Ordering::Release);
                capture.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Run one measurement.
    ///
    /// `request` carries operator data from the dashboard; HTTP triggers pass `None` and
    /// use the scanned barcode.
    pub async fn start(&self, request: Option<RequestData>) -> CalculationReport {
        self.start_with_deadline(request, None).await
    }

    /// Run one measurement that ends with `TimedOut` when `deadline` is cancelled.
    ///
    /// A trigger arriving while the previous measurement is being aborted waits for it to
    /// wind down instead of failing.
    pub async fn start_with_deadline(
        &self,
        request: Option<RequestData>,
        deadline: Option<CancellationToken>,
    ) -> CalculationReport {
        if !self.acquire().await {
            info!("Tried to start a calculation while another one was running");
            return CalculationReport::status_only(CalculationResult::failed(
                CalculationStatus::FailedToStart,
                String::new(),
            ));
        }

        let started_at = Local::now();
        let config = self.config.read().clone();
        let (barcode, reading, request) = {
            let mut inputs = self.inputs.lock();
            if let Some(data) = request {
                inputs.request = data;
            }
            let barcode = if inputs.request.barcode.is_empty() {
                inputs.barcode.clone()
            } else {
                inputs.request.barcode.clone()
            };
            (barcode, inputs.reading, inputs.request.clone())
        };

        if let Some(status) = check_preconditions(&config, &barcode, reading) {
            self.publish_status(status);
            self.release();
            let mut result = CalculationResult::failed(status, barcode);
            result.timestamp = started_at;
            return CalculationReport::status_only(result);
        }

        self.publish_status(CalculationStatus::InProgress);
        self.devices.toggle_scanners(true);
        info!(
            dm1 = config.dm1_enabled,
            dm2 = config.dm2_enabled,
            rgb = config.rgb_enabled,
            %barcode,
            "Starting a volume calculation"
        );

        let cancel = deadline
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        *self.active.lock() = Some(ActiveCapture {
            cancel: cancel.clone(),
            reason: CalculationStatus::AbortedByUser,
        });

        let run = tokio::select! {
            _ = cancel.cancelled() => {
                self.aborting.store(true, Ordering::Release);
                let reason = if deadline.as_ref().is_some_and(CancellationToken::is_cancelled) {
                    warn!("Calculation deadline expired, aborting");
                    CalculationStatus::TimedOut
                } else {
                    self.active
                        .lock()
                        .as_ref()
                        .map_or(CalculationStatus::AbortedByUser, |capture| capture.reason)
                };
                CaptureRun::failed(reason)
            }
            run = self.capture(&config, &barcode, started_at) => run,
        };
        *self.active.lock() = None;
        self.devices.toggle_scanners(false);

        self.finish(run, barcode, reading, request, started_at, &config)
    }

    fn finish(
        &self,
        run: CaptureRun,
        barcode: String,
        reading: ScaleReading,
        request: RequestData,
        started_at: DateTime<Local>,
        config: &AlgorithmConfig,
    ) -> CalculationReport {
        let volume = run
            .volume
            .map(|volume| correct_for_pallet(volume, request.unit_count, config))
            .unwrap_or_else(|| ObjectVolume::new(0, 0, 0));

        let result = CalculationResult {
            barcode,
            weight_g: reading.weight_g,
            length_mm: volume.length_mm,
            width_mm: volume.width_mm,
            height_mm: volume.height_mm,
            unit_count: request.unit_count,
            comment: request.comment,
            status: run.status,
            timestamp: started_at,
        };
        info!(
            barcode = %result.barcode,
            status = ?result.status,
            length = result.length_mm,
            width = result.width_mm,
            height = result.height_mm,
            weight_g = result.weight_g,
            "Calculation finished"
        );

        self.dashboard.update_result(&result);
        self.publish_status(result.status);

        let senders = self.senders.clone();
        let outgoing = result.clone();
        tokio::spawn(async move {
            senders.send_all(&outgoing).await;
        });

        {
            let mut inputs = self.inputs.lock();
            inputs.barcode.clear();
            inputs.request.barcode.clear();
        }
        self.waiting_for_reset.store(true, Ordering::Release);
        self.release();

        CalculationReport {
            result,
            photo: run.photo,
            algorithm: run.algorithm,
            range_meter_used: run.range_meter_used,
        }
    }

    /// Take the running flag, waiting out a measurement that is already being aborted.
    async fn acquire(&self) -> bool {
        loop {
            let idle = self.idle.notified();
            if self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            if !self.abort_pending() {
                return false;
            }
            debug!("Waiting for the aborted calculation to finish");
            idle.await;
        }
    }

    fn abort_pending(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
            || self
                .active
                .lock()
                .as_ref()
                .is_some_and(|capture| capture.cancel.is_cancelled())
    }

    fn release(&self) {
        self.aborting.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.idle.notify_waiters();
    }

    async fn capture(
        &self,
        config: &AlgorithmConfig,
        barcode: &str,
        started_at: DateTime<Local>,
    ) -> CaptureRun {
        let provider = &self.devices.frame_provider;
        let frames = match FrameCollector::collect(
            provider.color_stream(),
            provider.depth_stream(),
            config.required_sample_count,
            Duration::from_millis(config.frame_timeout_ms),
        )
        .await
        {
            Ok(frames) => frames,
            Err(StationError::Timeout(reason)) => {
                error!(%reason, "Frame collection timed out");
                return CaptureRun::failed(CalculationStatus::TimedOut);
            }
            Err(e) => {
                error!(error = %e, "Failed to collect frames");
                return CaptureRun::failed(CalculationStatus::FailedToStart);
            }
        };

        let reading = match &self.devices.range_meter {
            Some(meter) => Some(meter.get_reading().await),
            None => None,
        };
        let hint = distance_hint(
            reading,
            config.range_meter_correction_mm,
            config.floor_depth_mm,
        );

        let debug_name = format!("{}_{}", barcode, started_at.format("%Y%m%d%H%M%S"));
        let settings = CaptureSettings::from_config(config, debug_name);
        let session = VolumeCaptureSession::new(Arc::clone(&self.algorithm));
        let outcome = tokio::task::spawn_blocking(move || {
            session.calculate(&frames.images, &frames.depth_maps, &settings, hint)
        })
        .await;

        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(error = %e, "Volume calculation rejected its input");
                return CaptureRun::failed(CalculationStatus::CalculationError);
            }
            Err(e) => {
                error!(error = %e, "Volume calculation task failed");
                return CaptureRun::failed(CalculationStatus::CalculationError);
            }
        };

        let status = if outcome.algorithm == AlgorithmSelectionStatus::NoObjectFound {
            CalculationStatus::ObjectNotFound
        } else {
            outcome.status
        };
        let photo = self.object_photo(outcome.object_photo).await;

        CaptureRun {
            status,
            volume: outcome.volume.map(|aggregated| aggregated.volume),
            photo: Some(photo),
            algorithm: Some(outcome.algorithm),
            range_meter_used: outcome.range_meter_used,
        }
    }

    async fn object_photo(&self, frame: Arc<ColorImage>) -> Arc<ColorImage> {
        if let Some(camera) = self.devices.ip_camera.as_ref().filter(|c| c.is_initialized()) {
            match camera.snapshot().await {
                Some(snapshot) => return Arc::new(snapshot),
                None => warn!("IP camera snapshot failed, using the depth camera image"),
            }
        }
        frame
    }

    fn publish_status(&self, status: CalculationStatus) {
        self.dashboard.update_status(status);
        indicate_status(&self.devices, status);
    }

    /// Serve triggers until `cancel` fires or an input channel closes.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<CalculationRequest>,
        session: &RequestSession,
        events: &DeviceEventGenerator,
        cancel: CancellationToken,
    ) {
        let mut session_events = session.subscribe();
        let mut dashboard_events = self.dashboard.subscribe();
        let mut device_events = events.subscribe();
        self.publish_status(CalculationStatus::Undefined);
        info!("Calculation coordinator running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    let coordinator = Arc::clone(&self);
                    tokio::spawn(async move {
                        let deadline = request.abort_token();
                        let report = coordinator.start_with_deadline(None, Some(deadline)).await;
                        answer(request, &report);
                    });
                }
                event = device_events.recv() => match event {
                    Ok(event) => self.handle_device_event(event),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Device events lagged"),
                    Err(RecvError::Closed) => break,
                },
                event = dashboard_events.recv() => match event {
                    Ok(DashboardEvent::StartRequested(data)) => {
                        let coordinator = Arc::clone(&self);
                        tokio::spawn(async move {
                            coordinator.start(Some(data)).await;
                        });
                    }
                    Ok(DashboardEvent::RequestDataChanged(data)) => self.update_request_data(data),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dashboard events lagged"),
                    Err(RecvError::Closed) => break,
                },
                event = session_events.recv() => match event {
                    Ok(SessionEvent::TimedOut) => {
                        warn!("HTTP caller stopped waiting for the calculation");
                    }
                    Ok(SessionEvent::StartRequested { send_photo }) => {
                        debug!(send_photo, "HTTP calculation requested");
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Session events lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.abort_with(CalculationStatus::AbortedByUser);
        info!("Calculation coordinator stopped");
    }
}

/// Write the report back to the HTTP caller: the result document on success, a reset
/// message naming the failure otherwise.
fn answer(request: CalculationRequest, report: &CalculationReport) {
    match report.result.status {
        CalculationStatus::Successful => {
            request.respond(&report.result, report.photo.as_deref());
        }
        CalculationStatus::TimedOut => request.reset(REQUEST_TIMED_OUT),
        status => request.reset(status.describe()),
    }
}

fn check_preconditions(
    config: &AlgorithmConfig,
    barcode: &str,
    reading: ScaleReading,
) -> Option<CalculationStatus> {
    if config.require_barcode && barcode.is_empty() {
        info!("Barcode was required, but not entered");
        return Some(CalculationStatus::BarcodeNotEntered);
    }
    if config.require_stable_weight && !reading.is_settled() {
        info!(status = ?reading.status, "Weight was not stabilized");
        return Some(CalculationStatus::WeightNotStable);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pallet_config() -> AlgorithmConfig {
        AlgorithmConfig {
            enable_pallet_subtraction: true,
            pallet_height_mm: 150,
            ..AlgorithmConfig::default()
        }
    }

    #[test]
    fn test_pallet_correction() {
        let volume = ObjectVolume::new(1200, 800, 1150);
        assert_eq!(
            correct_for_pallet(volume, 4, &pallet_config()),
            ObjectVolume::new(600, 400, 1000)
        );
        assert_eq!(
            correct_for_pallet(volume, 0, &pallet_config()),
            ObjectVolume::new(1200, 800, 1000)
        );
        assert_eq!(
            correct_for_pallet(volume, 4, &AlgorithmConfig::default()),
            volume
        );
    }

    #[test]
    fn test_preconditions() {
        let config = AlgorithmConfig {
            require_barcode: true,
            require_stable_weight: true,
            ..AlgorithmConfig::default()
        };
        let settled = ScaleReading::new(ScaleStatus::Measured, 1000.0);
        assert_eq!(
            check_preconditions(&config, "", settled),
            Some(CalculationStatus::BarcodeNotEntered)
        );
        assert_eq!(
            check_preconditions(&config, "A1", ScaleReading::ready()),
            Some(CalculationStatus::WeightNotStable)
        );
        assert_eq!(check_preconditions(&config, "A1", settled), None);

        let relaxed = AlgorithmConfig {
            require_barcode: false,
            require_stable_weight: false,
            ..AlgorithmConfig::default()
        };
        assert_eq!(check_preconditions(&relaxed, "", ScaleReading::not_set()), None);
    }
}
