//! WebSocket dashboard.
//!
//! Server → client: `{"command":"status","status":{barcode,rank,comment,weight,length,width,height,status}}`
//! Client → server: `{"command":"start"}` or `{"command":"status","status":{barcode,rank,comment}}`

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::result::{CalculationResult, CalculationStatus};

const OUTGOING_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Operator-entered data for the next measurement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestData {
    /// Object barcode
    pub barcode: String,
    /// Units on the pallet ("rank" on the wire)
    pub unit_count: u32,
    /// Free-form comment
    pub comment: String,
}

/// Events raised by dashboard clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DashboardEvent {
    /// A client pressed start.
    StartRequested(RequestData),
    /// A client edited barcode, rank or comment.
    RequestDataChanged(RequestData),
}

/// Snapshot broadcast to every client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardStatus {
    /// Last measured barcode
    pub barcode: String,
    /// Unit count of the pending request
    pub rank: u32,
    /// Comment of the pending request
    pub comment: String,
    /// Last weight in kilograms
    pub weight: f64,
    /// Last length in millimetres
    pub length: i32,
    /// Last width in millimetres
    pub width: i32,
    /// Last height in millimetres
    pub height: i32,
    /// 0 ready, 1 running, 2 error
    pub status: u8,
}

#[derive(Debug, Serialize)]
struct StatusMessage<'a> {
    command: &'static str,
    status: &'a DashboardStatus,
}

/// Message sent by a dashboard client.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    command: Option<String>,
    status: Option<RequestDataMessage>,
}

/// Wire form of [`RequestData`]. Browsers send `rank` and the text fields as numbers
/// or strings; anything unreadable falls back to the empty value.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RequestDataMessage {
    #[serde(deserialize_with = "lenient_text")]
    barcode: String,
    #[serde(deserialize_with = "lenient_rank")]
    rank: u32,
    #[serde(deserialize_with = "lenient_text")]
    comment: String,
}

impl From<RequestDataMessage> for RequestData {
    fn from(message: RequestDataMessage) -> Self {
        Self {
            barcode: message.barcode,
            unit_count: message.rank,
            comment: message.comment,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenientValue {
    Unsigned(u64),
    Number(serde_json::Number),
    Text(String),
    Other(IgnoredAny),
}

fn lenient_rank<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    Ok(match LenientValue::deserialize(deserializer)? {
        LenientValue::Unsigned(n) => u32::try_from(n).unwrap_or(0),
        LenientValue::Text(s) => s.trim().parse().unwrap_or(0),
        LenientValue::Number(_) | LenientValue::Other(_) => 0,
    })
}

fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match LenientValue::deserialize(deserializer)? {
        LenientValue::Unsigned(n) => n.to_string(),
        LenientValue::Number(n) => n.to_string(),
        LenientValue::Text(s) => s,
        LenientValue::Other(_) => String::new(),
    })
}

#[derive(Debug, Clone)]
struct Outgoing {
    exclude: Option<Uuid>,
    text: String,
}

#[derive(Debug, Default)]
struct DashboardState {
    status_code: u8,
    request: RequestData,
    result: Option<CalculationResult>,
}

impl DashboardState {
    fn snapshot(&self) -> DashboardStatus {
        let mut status = DashboardStatus {
            rank: self.request.unit_count,
            comment: self.request.comment.clone(),
            status: self.status_code,
            ..Default::default()
        };
        if let Some(result) = &self.result {
            status.barcode = result.barcode.clone();
            status.weight = result.weight_kg();
            status.length = result.length_mm;
            status.width = result.width_mm;
            status.height = result.height_mm;
        }
        status
    }
}

/// Status fan-out for every connected dashboard.
#[derive(Debug, Clone)]
pub struct ClientBroadcastSession {
    state: Arc<Mutex<DashboardState>>,
    outgoing: broadcast::Sender<Outgoing>,
    events: broadcast::Sender<DashboardEvent>,
    clients: Arc<AtomicUsize>,
}

impl Default for ClientBroadcastSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBroadcastSession {
    /// Session with no clients and an idle status.
    pub fn new() -> Self {
        let (outgoing, _) = broadcast::channel(OUTGOING_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(DashboardState::default())),
            outgoing,
            events,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Route for `/ws`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(handle_upgrade))
            .with_state(self.clone())
    }

    /// Client-raised events.
    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    /// Connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }

    /// Current status snapshot.
    pub fn snapshot(&self) -> DashboardStatus {
        self.state.lock().snapshot()
    }

    /// Operator data entered for the next measurement.
    pub fn request_data(&self) -> RequestData {
        self.state.lock().request.clone()
    }

    /// Publish a new calculation status.
    pub fn update_status(&self, status: CalculationStatus) {
        self.state.lock().status_code = status.dashboard_code();
        self.broadcast(None);
    }

    /// Publish operator data.
    pub fn update_request_data(&self, data: RequestData) {
        self.state.lock().request = data;
        self.broadcast(None);
    }

    /// Publish a finished measurement.
    pub fn update_result(&self, result: &CalculationResult) {
        self.state.lock().result = Some(result.clone());
        self.broadcast(None);
    }

    fn status_text(&self) -> Option<String> {
        let snapshot = self.snapshot();
        match serde_json::to_string(&StatusMessage {
            command: "status",
            status: &snapshot,
        }) {
            Ok(text) => Some(text),
            Err(e) => {
                error!("Failed to serialize status message: {}", e);
                None
            }
        }
    }

    fn broadcast(&self, exclude: Option<Uuid>) {
        if self.outgoing.receiver_count() == 0 {
            return;
        }
        if let Some(text) = self.status_text() {
            let _ = self.outgoing.send(Outgoing { exclude, text });
        }
    }

    fn handle_client_message(&self, client: Uuid, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(%client, "Failed to parse dashboard message: {}", e);
                return;
            }
        };

        match message.command.as_deref() {
            Some("status") => {
                let Some(data) = message.status.map(RequestData::from) else {
                    warn!(%client, "Status command without a status object");
                    return;
                };
                info!(
                    %client,
                    barcode = %data.barcode,
                    rank = data.unit_count,
                    comment = %data.comment,
                    "Status command received"
                );
                self.state.lock().request = data.clone();
                let _ = self.events.send(DashboardEvent::RequestDataChanged(data));
            }
            Some("start") => {
                info!(%client, "Start command received");
                let data = self.request_data();
                let _ = self.events.send(DashboardEvent::StartRequested(data));
            }
            other => {
                info!(%client, command = ?other, "Unknown command received");
            }
        }

        self.broadcast(Some(client));
    }

    async fn run_client(self, socket: WebSocket) {
        let client = Uuid::new_v4();
        let mut outgoing = self.outgoing.subscribe();
        let count = self.clients.fetch_add(1, Ordering::AcqRel) + 1;
        info!(%client, client_count = count, "Web client connected");

        let (mut sender, mut receiver) = socket.split();

        if let Some(text) = self.status_text() {
            if let Err(e) = sender.send(Message::Text(text.into())).await {
                error!(%client, "Failed to send initial status: {}", e);
            }
        }

        loop {
            tokio::select! {
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_client_message(client, text.as_str()),
                        Some(Ok(Message::Ping(data))) => {
                            if sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(%client, "WebSocket error: {}", e);
                            break;
                        }
                    }
                }
                message = outgoing.recv() => {
                    match message {
                        Ok(message) if message.exclude == Some(client) => {}
                        Ok(message) => {
                            if let Err(e) = sender.send(Message::Text(message.text.into())).await {
                                warn!(%client, "Failed to broadcast status message: {}", e);
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%client, skipped, "Dashboard client lagging");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        let count = self.clients.fetch_sub(1, Ordering::AcqRel) - 1;
        info!(%client, client_count = count, "Web client disconnected");
    }
}

async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(session): State<ClientBroadcastSession>,
) -> Response {
    ws.on_upgrade(move |socket| session.run_client(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn parse_request_data(value: Value) -> RequestData {
        serde_json::from_value::<RequestDataMessage>(value)
            .unwrap()
            .into()
    }

    #[test]
    fn test_parse_request_data() {
        let data = parse_request_data(json!({"barcode": "ABC", "rank": "3", "comment": "top"}));
        assert_eq!(
            data,
            RequestData {
                barcode: "ABC".into(),
                unit_count: 3,
                comment: "top".into()
            }
        );

        let data = parse_request_data(json!({"barcode": 42, "rank": 7}));
        assert_eq!(data.barcode, "42");
        assert_eq!(data.unit_count, 7);
        assert_eq!(data.comment, "");

        assert_eq!(parse_request_data(json!({"rank": "many"})).unit_count, 0);
        assert_eq!(parse_request_data(json!({"rank": -3})).unit_count, 0);
        assert_eq!(parse_request_data(json!({"rank": 2.5})).unit_count, 0);

        let data = parse_request_data(json!({"barcode": null, "comment": ["x"], "extra": true}));
        assert_eq!(data, RequestData::default());
    }

    #[test]
    fn test_snapshot_reflects_updates() {
        let session = ClientBroadcastSession::new();
        session.update_status(CalculationStatus::InProgress);
        assert_eq!(session.snapshot().status, 1);

        let mut result = CalculationResult::failed(CalculationStatus::Successful, "XYZ");
        result.weight_g = 2500.0;
        result.length_mm = 100;
        session.update_result(&result);
        session.update_status(CalculationStatus::Successful);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.barcode, "XYZ");
        assert_eq!(snapshot.weight, 2.5);
        assert_eq!(snapshot.length, 100);
        assert_eq!(snapshot.status, 0);

        session.update_status(CalculationStatus::WeightNotStable);
        assert_eq!(session.snapshot().status, 2);
    }

    #[tokio::test]
    async fn test_client_messages_raise_events_and_exclude_sender() {
        let session = ClientBroadcastSession::new();
        let mut events = session.subscribe();
        let mut outgoing = session.outgoing.subscribe();
        let sender = Uuid::new_v4();

        session.handle_client_message(
            sender,
            r#"{"command":"status","status":{"barcode":"B1","rank":"2","comment":"c"}}"#,
        );
        assert_eq!(
            events.recv().await.unwrap(),
            DashboardEvent::RequestDataChanged(RequestData {
                barcode: "B1".into(),
                unit_count: 2,
                comment: "c".into()
            })
        );
        let broadcast = outgoing.recv().await.unwrap();
        assert_eq!(broadcast.exclude, Some(sender));
        let parsed: Value = serde_json::from_str(&broadcast.text).unwrap();
        assert_eq!(parsed["command"], "status");
        assert_eq!(parsed["status"]["rank"], 2);
        assert_eq!(parsed["status"]["comment"], "c");

        session.handle_client_message(sender, r#"{"command":"start"}"#);
        match events.recv().await.unwrap() {
            DashboardEvent::StartRequested(data) => assert_eq!(data.barcode, "B1"),
            other => panic!("unexpected event {other:?}"),
        }

        session.handle_client_message(sender, "not json");
        assert!(events.try_recv().is_err());
    }
}
