//! I/O circuit boards: relay outputs and polled input lines.
//!
//! The KE-USB24R speaks a line protocol over one half-duplex serial channel:
//!
//! ```text
//! host → board   $KE,REL,<n>,<0|1>\r\n     switch relay n
//!                $KE,RID,<n>\r\n           read line n
//!                $KE,AFR,0\r\n             stop unsolicited analog reports
//! board → host   #RID,<n>,<value>\r\n      line n reads value
//! ```
//!
//! Answers are matched to requests by the line number they carry, not by arrival order,
//! because the board interleaves its own reports with polled answers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::serial::{DynSerial, Parity, SerialLink, SerialSettings};

/// Returned by [`IoCircuit::poll_line`] when the board never answered.
pub const LINE_POLL_TIMED_OUT: i32 = i32::MIN;

/// Number of addressable lines on the board.
pub const LINE_COUNT: usize = 32;

const HEADER: &[u8] = b"$KE";
const FOOTER: &[u8] = b"\r\n";
const POLL_RESEND_INTERVAL: Duration = Duration::from_millis(10);
const POLL_DEADLINE: Duration = Duration::from_secs(3);
const MAX_PENDING_LINE_BYTES: usize = 1024;

/// Relay/line board.
#[async_trait]
pub trait IoCircuit: Send + Sync {
    /// Switch a relay. Fire-and-forget.
    fn toggle_relay(&self, relay: u32, on: bool);

    /// Read an input line, or [`LINE_POLL_TIMED_OUT`] when no answer arrives in time.
    async fn poll_line(&self, line: usize) -> i32;

    /// Close the port. Idempotent.
    async fn shutdown(&self);
}

/// Request state of one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineRequestState {
    /// Nothing outstanding
    #[default]
    None,
    /// Poll written, waiting for the board
    UpdateRequested,
    /// Answer stored, waiting for the poller to pick it up
    UpdateReceived,
}

#[derive(Debug, Clone, Copy)]
struct LineSlot {
    state: LineRequestState,
    value: i32,
}

impl Default for LineSlot {
    fn default() -> Self {
        Self {
            state: LineRequestState::None,
            value: -1,
        }
    }
}

/// Per-line request table shared between pollers and the receive task.
#[derive(Debug, Default)]
pub struct LineTable {
    slots: Mutex<[LineSlot; LINE_COUNT]>,
}

impl LineTable {
    /// Mark a line as polled. Returns false for a line the board does not have.
    pub fn request(&self, line: usize) -> bool {
        match self.slots.lock().get_mut(line) {
            Some(slot) => {
                slot.state = LineRequestState::UpdateRequested;
                true
            }
            None => false,
        }
    }

    /// Store an answer if the line is waiting for one. Returns whether it was accepted.
    pub fn deliver(&self, line: usize, value: i32) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(line) {
            Some(slot) if slot.state == LineRequestState::UpdateRequested => {
                slot.value = value;
                slot.state = LineRequestState::UpdateReceived;
                true
            }
            _ => false,
        }
    }

    /// Take a received value, returning the line to `None`.
    pub fn take(&self, line: usize) -> Option<i32> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(line)?;
        if slot.state == LineRequestState::UpdateReceived {
            slot.state = LineRequestState::None;
            Some(slot.value)
        } else {
            None
        }
    }

    /// Abandon an outstanding request.
    pub fn cancel(&self, line: usize) {
        if let Some(slot) = self.slots.lock().get_mut(line) {
            slot.state = LineRequestState::None;
        }
    }

    /// Current state of a line; `None` for lines the board does not have.
    pub fn state(&self, line: usize) -> LineRequestState {
        self.slots
            .lock()
            .get(line)
            .map_or(LineRequestState::None, |slot| slot.state)
    }
}

/// Splits the byte stream into `#RID` answers, buffering partial lines across chunks.
#[derive(Debug, Default)]
struct ResponseParser {
    pending: String,
}

impl ResponseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<(usize, i32)> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut answers = Vec::new();
        while let Some(end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=end).collect();
            if let Some(answer) = parse_answer(line.trim()) {
                answers.push(answer);
            }
        }
        if self.pending.len() > MAX_PENDING_LINE_BYTES {
            warn!(bytes = self.pending.len(), "KE-USB24R: discarding unterminated input");
            self.pending.clear();
        }
        answers
    }
}

fn parse_answer(message: &str) -> Option<(usize, i32)> {
    let mut tokens = message.split(',');
    if tokens.next()? != "#RID" {
        return None;
    }
    let line = tokens.next()?.trim().parse().ok()?;
    let value = tokens.next()?.trim().parse().ok()?;
    Some((line, value))
}

fn frame(command: &str) -> Vec<u8> {
    [HEADER, command.as_bytes(), FOOTER].concat()
}

/// KE-USB24R board.
pub struct KeUsb24R {
    port: String,
    link: SerialLink,
    lines: Arc<LineTable>,
    pollers: Vec<tokio::sync::Mutex<()>>,
}

impl KeUsb24R {
    /// Line settings: 4800 baud, 8E1.
    pub fn serial_settings() -> SerialSettings {
        SerialSettings::new(4800).parity(Parity::Even)
    }

    /// Start the receive loop and silence analog reports.
    pub fn attach(port: DynSerial, port_name: impl Into<String>) -> Self {
        let port_name = port_name.into();
        let lines = Arc::new(LineTable::default());

        let link = {
            let lines = lines.clone();
            let mut parser = ResponseParser::default();
            SerialLink::spawn(port, "keusb24r", move |chunk| {
                for (line, value) in parser.feed(chunk) {
                    if lines.deliver(line, value) {
                        debug!(line, value, "KE-USB24R: line answered");
                    }
                }
            })
        };
        link.send(frame(",AFR,0"));
        info!(port = %port_name, "KE-USB24R board started");

        Self {
            port: port_name,
            link,
            lines,
            pollers: (0..LINE_COUNT).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    /// Shared request table.
    pub fn lines(&self) -> &LineTable {
        &self.lines
    }
}

#[async_trait]
impl IoCircuit for KeUsb24R {
    fn toggle_relay(&self, relay: u32, on: bool) {
        let state = u8::from(on);
        self.link.send(frame(&format!(",REL,{relay},{state}")));
    }

    async fn poll_line(&self, line: usize) -> i32 {
        let Some(poller) = self.pollers.get(line) else {
            warn!(line, "KE-USB24R: no such line");
            return LINE_POLL_TIMED_OUT;
        };
        let _outstanding = poller.lock().await;

        let started = Instant::now();
        let command = frame(&format!(",RID,{line}"));
        self.lines.request(line);

        while started.elapsed() < POLL_DEADLINE {
            if let Some(value) = self.lines.take(line) {
                return value;
            }
            self.link.send(command.clone());
            tokio::time::sleep(POLL_RESEND_INTERVAL).await;
        }

        self.lines.cancel(line);
        warn!(port = %self.port, line, "KE-USB24R: line poll timed out");
        LINE_POLL_TIMED_OUT
    }

    async fn shutdown(&self) {
        self.link.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn board() -> (KeUsb24R, DuplexStream) {
        let (host, device) = tokio::io::duplex(4096);
        (KeUsb24R::attach(Box::new(device), "test"), host)
    }

    #[test]
    fn test_parser_buffers_partial_lines() {
        let mut parser = ResponseParser::default();
        assert!(parser.feed(b"#RID,5,").is_empty());
        assert_eq!(parser.feed(b"1\r\n#RID,6,0\r\n#AD"), vec![(5, 1), (6, 0)]);
        assert!(parser.feed(b"C,1,300\r\n").is_empty());
        assert!(parser.feed(b"#RID,x,1\r\n").is_empty());
    }

    #[test]
    fn test_line_table_correlation() {
        let table = LineTable::default();
        assert!(!table.deliver(2, 1));
        table.request(2);
        assert!(!table.deliver(3, 1));
        assert!(table.deliver(2, 7));
        assert_eq!(table.state(2), LineRequestState::UpdateReceived);
        assert_eq!(table.take(2), Some(7));
        assert_eq!(table.state(2), LineRequestState::None);
        assert!(!table.deliver(40, 1));
    }

    #[test]
    fn test_line_table_ignores_lines_past_the_board() {
        let table = LineTable::default();
        assert!(!table.request(LINE_COUNT));
        assert_eq!(table.take(LINE_COUNT), None);
        table.cancel(usize::MAX);
        assert_eq!(table.state(LINE_COUNT + 5), LineRequestState::None);
        assert!(table.request(LINE_COUNT - 1));
        assert_eq!(table.state(LINE_COUNT - 1), LineRequestState::UpdateRequested);
    }

    #[tokio::test]
    async fn test_open_silences_analog_reports_and_toggles_relay() {
        let (board, mut host) = board();
        board.toggle_relay(4, true);

        let expected = b"$KE,AFR,0\r\n$KE,REL,4,1\r\n";
        let mut received = vec![0u8; expected.len()];
        host.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, expected);
        board.shutdown().await;
    }

    #[tokio::test]
    async fn test_poll_line_returns_matching_answer() {
        let (board, mut host) = board();
        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let mut seen = String::new();
            while !seen.contains("$KE,RID,3") {
                let n = host.read(&mut buf).await.unwrap();
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            host.write_all(b"#RID,9,1\r\n#RID,3,1\r\n").await.unwrap();
            host
        });

        assert_eq!(board.poll_line(3).await, 1);
        assert_eq!(board.lines().state(3), LineRequestState::None);
        assert_eq!(board.lines().state(9), LineRequestState::None);
        let _host = responder.await.unwrap();
        board.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_line_times_out_after_deadline() {
        let (board, _host) = board();
        let started = Instant::now();
        assert_eq!(board.poll_line(0).await, LINE_POLL_TIMED_OUT);
        let elapsed = started.elapsed();
        assert!(elapsed >= POLL_DEADLINE);
        assert!(elapsed < POLL_DEADLINE + Duration::from_millis(100));
        assert_eq!(board.lines().state(0), LineRequestState::None);
        board.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_line_is_rejected() {
        let (board, _host) = board();
        assert_eq!(board.poll_line(LINE_COUNT).await, LINE_POLL_TIMED_OUT);
        board.shutdown().await;
    }
}
