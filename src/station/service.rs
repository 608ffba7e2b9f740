//! Wiring of devices, coordinator and listeners into one running station.

use axum::Router;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::CalculationCoordinator;
use crate::capture::BoundingBoxAlgorithm;
use crate::config::StationConfig;
use crate::devices::{DeviceEventGenerator, DeviceRegistry, DeviceSet, DeviceSetFactory, PalletSettings};
use crate::error::AppResult;
use crate::senders::SenderSet;
use crate::server::{self, ClientBroadcastSession, RequestSession};

/// A station in service.
pub struct Station {
    devices: Arc<DeviceSet>,
    events: Arc<DeviceEventGenerator>,
    coordinator: Arc<CalculationCoordinator>,
    session: RequestSession,
    dashboard: ClientBroadcastSession,
    cancel: CancellationToken,
    coordinator_task: JoinHandle<()>,
}

impl Station {
    /// Open every configured device and start the coordinator.
    ///
    /// # Errors
    ///
    /// Fails when a configured device cannot be opened.
    pub async fn start(config: &StationConfig, registry: &DeviceRegistry) -> AppResult<Self> {
        let devices = Arc::new(DeviceSetFactory::create(&config.devices, registry).await?);
        let events = Arc::new(DeviceEventGenerator::new(
            &devices,
            PalletSettings::from_config(&config.algorithm),
        ));

        let senders = SenderSet::from_config(&config.senders);
        senders.connect_all().await;

        let dashboard = ClientBroadcastSession::new();
        let (session, requests) = RequestSession::new(&config.http);
        let coordinator = Arc::new(CalculationCoordinator::new(
            Arc::clone(&devices),
            Arc::new(BoundingBoxAlgorithm::from_config(&config.algorithm)),
            config.algorithm.clone(),
            senders,
            dashboard.clone(),
        ));

        let cancel = CancellationToken::new();
        let coordinator_task = {
            let coordinator = Arc::clone(&coordinator);
            let session = session.clone();
            let events = Arc::clone(&events);
            let cancel = cancel.clone();
            tokio::spawn(async move { coordinator.run(requests, &session, &events, cancel).await })
        };

        info!(
            scanners = devices.scanners.len(),
            scales = devices.scales.is_some(),
            io_circuit = devices.io_circuit.is_some(),
            range_meter = devices.range_meter.is_some(),
            "Station started"
        );

        Ok(Self {
            devices,
            events,
            coordinator,
            session,
            dashboard,
            cancel,
            coordinator_task,
        })
    }

    /// HTTP and WebSocket routes.
    pub fn router(&self) -> Router {
        server::router(&self.session, &self.dashboard)
    }

    /// The measurement coordinator.
    pub fn coordinator(&self) -> &Arc<CalculationCoordinator> {
        &self.coordinator
    }

    /// The HTTP trigger session.
    pub fn session(&self) -> &RequestSession {
        &self.session
    }

    /// Opened devices.
    pub fn devices(&self) -> &Arc<DeviceSet> {
        &self.devices
    }

    /// Token that stops the station.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve HTTP and WebSocket clients on `address` until the station is stopped.
    pub async fn serve(&self, address: &str) -> AppResult<()> {
        server::serve(address, self.router(), self.cancel.clone()).await
    }

    /// Stop the coordinator and close every device.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.coordinator_task.await;
        self.events.shutdown().await;
        self.devices.shutdown().await;
        info!("Station stopped");
    }
}
