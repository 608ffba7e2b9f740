//! HTTP trigger endpoint.
//!
//! ```text
//! Idle ──calculate──→ Pending (timer armed) ─┬─ response written ──→ Idle
//!                                            └─ timer expired ─────→ Idle (TimedOut event)
//! ```
//!
//! The in-flight gate is a single `AtomicBool`. A second `calculate` while Pending is
//! answered with [`ALREADY_IN_PROGRESS`] and never reaches the coordinator. On expiry the
//! request's abort token is cancelled before the gate opens again.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::HttpConfig;
use crate::result::CalculationResult;
use crate::stream::ColorImage;

/// Default time a caller waits for a calculation.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Answer to a `calculate` arriving while another one is pending.
pub const ALREADY_IN_PROGRESS: &str = "Calculation is already in progress";

/// Answer when the coordinator dropped a request without responding.
pub const REQUEST_TIMED_OUT: &str = "Request timed out";

const REQUEST_QUEUE_DEPTH: usize = 4;
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Session lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A caller asked for a calculation.
    StartRequested {
        /// `calculate_ph` was used
        send_photo: bool,
    },
    /// The pending request was not answered in time.
    TimedOut,
}

/// Body written back to the HTTP caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpReply {
    /// Result document
    Xml(String),
    /// Plain text reset message
    Reset(String),
}

impl IntoResponse for HttpReply {
    fn into_response(self) -> Response {
        match self {
            HttpReply::Xml(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
                body,
            )
                .into_response(),
            HttpReply::Reset(text) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                text,
            )
                .into_response(),
        }
    }
}

/// An accepted trigger, handed to the coordinator.
#[derive(Debug)]
pub struct CalculationRequest {
    send_photo: bool,
    ticket: u64,
    abort: CancellationToken,
    responder: oneshot::Sender<HttpReply>,
    session: Arc<SessionInner>,
}

impl CalculationRequest {
    /// Whether the caller asked for the object photo.
    pub fn send_photo(&self) -> bool {
        self.send_photo
    }

    /// Cancelled when the request times out, before the gate accepts the next trigger.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Write the result document. Still delivered after a timeout.
    pub fn respond(self, result: &CalculationResult, photo: Option<&ColorImage>) {
        let photo = photo.filter(|_| self.send_photo);
        match result.to_xml_with_photo(photo) {
            Ok(xml) => {
                info!(barcode = %result.barcode, status = ?result.status, "Generating HTTP response");
                self.finish(HttpReply::Xml(xml));
            }
            Err(e) => {
                error!(error = %e, "Failed to render the result document");
                self.finish(HttpReply::Reset(result.status.describe().to_string()));
            }
        }
    }

    /// Write a plain-text reset message.
    pub fn reset(self, text: impl Into<String>) {
        let text = text.into();
        info!(message = %text, "Sending an HTTP reset message");
        self.finish(HttpReply::Reset(text));
    }

    fn finish(self, reply: HttpReply) {
        if !self.session.complete(self.ticket) {
            error!(ticket = self.ticket, "Response arrived after timeout");
        }
        if self.responder.send(reply).is_err() {
            warn!(ticket = self.ticket, "HTTP caller disconnected before the response");
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    ticket: u64,
    timer: CancellationToken,
    abort: CancellationToken,
}

#[derive(Debug)]
struct SessionInner {
    in_flight: AtomicBool,
    pending: Mutex<Option<PendingRequest>>,
    next_ticket: AtomicU64,
    timeout: Duration,
    credentials: Option<(String, String)>,
    requests: mpsc::Sender<CalculationRequest>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionInner {
    /// Clear the gate if `ticket` is still the pending request. False when it already expired.
    fn complete(&self, ticket: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.as_ref() {
            Some(current) if current.ticket == ticket => {
                current.timer.cancel();
                *pending = None;
                self.in_flight.store(false, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    fn expire(&self, ticket: u64) {
        let mut pending = self.pending.lock();
        let Some(current) = pending.take_if(|current| current.ticket == ticket) else {
            return;
        };
        current.abort.cancel();
        self.in_flight.store(false, Ordering::Release);
        drop(pending);

        error!(
            ticket,
            timeout_ms = self.timeout.as_millis() as u64,
            "HTTP request handling timed out, aborting request"
        );
        let _ = self.events.send(SessionEvent::TimedOut);
    }
}

/// HTTP trigger session with single-flight gating.
#[derive(Debug, Clone)]
pub struct RequestSession {
    inner: Arc<SessionInner>,
}

impl RequestSession {
    /// Session configured from the `[http]` section. The receiver yields accepted triggers.
    pub fn new(config: &HttpConfig) -> (Self, mpsc::Receiver<CalculationRequest>) {
        let credentials = match (&config.login, &config.password) {
            (Some(login), password) if !login.is_empty() => {
                Some((login.clone(), password.clone().unwrap_or_default()))
            }
            _ => None,
        };
        Self::with_timeout(Duration::from_millis(config.request_timeout_ms), credentials)
    }

    /// Session with an explicit timeout and optional Basic credentials.
    pub fn with_timeout(
        timeout: Duration,
        credentials: Option<(String, String)>,
    ) -> (Self, mpsc::Receiver<CalculationRequest>) {
        let (requests, receiver) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = SessionInner {
            in_flight: AtomicBool::new(false),
            pending: Mutex::new(None),
            next_ticket: AtomicU64::new(1),
            timeout,
            credentials,
            requests,
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Session lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// True while a calculation request is pending.
    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Routes for `/{command}`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/{command}", any(handle_command))
            .with_state(self.clone())
    }

    fn check_credentials(&self, headers: &HeaderMap) -> bool {
        let Some((login, password)) = &self.inner.credentials else {
            return true;
        };

        let Some(encoded) = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Basic"))
        else {
            return false;
        };

        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            error!("HTTP Basic authentication failed, malformed header");
            return false;
        };
        // ISO-8859-1 maps every byte to the code point of the same value
        let decoded: String = decoded.iter().map(|&b| char::from(b)).collect();
        let Some((given_login, given_password)) = decoded.split_once(':') else {
            return false;
        };

        if given_login != login {
            error!("HTTP Basic authentication failed, the login was incorrect");
            return false;
        }
        if given_password != password {
            error!("HTTP Basic authentication failed, the password was incorrect");
            return false;
        }
        true
    }

    async fn start_calculation(&self, send_photo: bool) -> HttpReply {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Calculation request rejected, another one is in progress");
            return HttpReply::Reset(ALREADY_IN_PROGRESS.to_string());
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let timer = CancellationToken::new();
        let abort = CancellationToken::new();
        *self.inner.pending.lock() = Some(PendingRequest {
            ticket,
            timer: timer.clone(),
            abort: abort.clone(),
        });

        let (responder, reply) = oneshot::channel();
        let request = CalculationRequest {
            send_photo,
            ticket,
            abort,
            responder,
            session: Arc::clone(&self.inner),
        };
        if self.inner.requests.send(request).await.is_err() {
            error!("No calculation consumer attached, dropping request");
            self.inner.complete(ticket);
            return HttpReply::Reset(REQUEST_TIMED_OUT.to_string());
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(inner.timeout) => inner.expire(ticket),
            }
        });
        let _ = self.inner.events.send(SessionEvent::StartRequested { send_photo });

        match reply.await {
            Ok(reply) => reply,
            Err(_) => {
                self.inner.complete(ticket);
                HttpReply::Reset(REQUEST_TIMED_OUT.to_string())
            }
        }
    }
}

async fn handle_command(
    State(session): State<RequestSession>,
    Path(command): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !session.check_credentials(&headers) {
        error!(%command, "Credentials were incorrect, will not process the request");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"volume-station\"")],
        )
            .into_response();
    }

    info!(%command, "Received an HTTP command");
    match command.as_str() {
        "ping" => "pong".into_response(),
        "calculate" => session.start_calculation(false).await.into_response(),
        "calculate_ph" => session.start_calculation(true).await.into_response(),
        _ => {
            info!(%command, "Received an unknown command");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
