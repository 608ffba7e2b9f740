//! Barcode scanners.
//!
//! A scanner publishes every scanned code on a broadcast channel. Scanners can be paused
//! while a measurement is running so a stray scan does not replace the active barcode.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::serial::{DynSerial, SerialLink, SerialSettings};

const CODE_CHANNEL_CAPACITY: usize = 16;

/// Barcode source.
#[async_trait]
pub trait BarcodeScanner: Send + Sync {
    /// Registry name of the scanner.
    fn name(&self) -> &str;

    /// Receive scanned codes.
    fn subscribe(&self) -> broadcast::Receiver<String>;

    /// Stop or restart publishing codes.
    fn toggle_pause(&self, pause: bool);

    /// Release the input. Idempotent.
    async fn shutdown(&self);
}

/// Remove line breaks, spaces and tabs from a raw scan.
pub fn clean_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '\r' | '\n' | ' ' | '\t'))
        .collect()
}

#[derive(Clone)]
struct CodePublisher {
    codes: broadcast::Sender<String>,
    paused: Arc<AtomicBool>,
}

impl CodePublisher {
    fn new() -> Self {
        let (codes, _) = broadcast::channel(CODE_CHANNEL_CAPACITY);
        Self {
            codes,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    fn publish(&self, raw: &str) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let code = clean_code(raw);
        if code.is_empty() {
            return;
        }
        debug!(code = %code, "Barcode scanned");
        let _ = self.codes.send(code);
    }
}

/// Scanner attached to a serial port (9600 8N1), one code per chunk.
pub struct SerialBarcodeScanner {
    link: SerialLink,
    publisher: CodePublisher,
}

impl SerialBarcodeScanner {
    /// Line settings for generic serial scanners.
    pub fn serial_settings() -> SerialSettings {
        SerialSettings::new(9600)
    }

    /// Start reading codes from an open port.
    pub fn attach(port: DynSerial, port_name: &str) -> Self {
        let publisher = CodePublisher::new();
        let link = {
            let publisher = publisher.clone();
            SerialLink::spawn(port, "generic", move |chunk| {
                publisher.publish(&String::from_utf8_lossy(chunk));
            })
        };
        info!(port = port_name, "Generic serial scanner started");
        Self { link, publisher }
    }
}

#[async_trait]
impl BarcodeScanner for SerialBarcodeScanner {
    fn name(&self) -> &str {
        "generic"
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.publisher.codes.subscribe()
    }

    fn toggle_pause(&self, pause: bool) {
        self.publisher.paused.store(pause, Ordering::Release);
    }

    async fn shutdown(&self) {
        self.link.shutdown().await;
    }
}

/// Keyboard-wedge scanner: one code per input line.
pub struct KeyboardScanner {
    publisher: CodePublisher,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KeyboardScanner {
    /// Read codes from standard input.
    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }

    /// Read codes from any line-oriented input.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let publisher = CodePublisher::new();
        let cancel = CancellationToken::new();
        let task = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut lines = reader.lines();
                loop {
                    let line = tokio::select! {
                        _ = cancel.cancelled() => break,
                        line = lines.next_line() => line,
                    };
                    match line {
                        Ok(Some(line)) => publisher.publish(&line),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Keyboard scanner input failed");
                            break;
                        }
                    }
                }
            })
        };
        info!("Keyboard scanner started");
        Self {
            publisher,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }
}

#[async_trait]
impl BarcodeScanner for KeyboardScanner {
    fn name(&self) -> &str {
        "keyboard"
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.publisher.codes.subscribe()
    }

    fn toggle_pause(&self, pause: bool) {
        self.publisher.paused.store(pause, Ordering::Release);
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for KeyboardScanner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_clean_code() {
        assert_eq!(clean_code(" 4601 234\t567\r\n"), "4601234567");
        assert_eq!(clean_code("\r\n"), "");
    }

    #[tokio::test]
    async fn test_serial_scanner_publishes_clean_codes() {
        let (mut host, device) = tokio::io::duplex(64);
        let scanner = SerialBarcodeScanner::attach(Box::new(device), "test");
        let mut codes = scanner.subscribe();

        host.write_all(b"\r\n").await.unwrap();
        tokio::task::yield_now().await;
        host.write_all(b"ABC 123\r\n").await.unwrap();
        assert_eq!(codes.recv().await.unwrap(), "ABC123");

        scanner.shutdown().await;
        scanner.shutdown().await;
    }

    #[tokio::test]
    async fn test_paused_scanner_drops_codes() {
        let (mut host, device) = tokio::io::duplex(64);
        let scanner = SerialBarcodeScanner::attach(Box::new(device), "test");
        let mut codes = scanner.subscribe();

        scanner.toggle_pause(true);
        host.write_all(b"IGNORED").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        scanner.toggle_pause(false);
        host.write_all(b"KEPT").await.unwrap();
        assert_eq!(codes.recv().await.unwrap(), "KEPT");

        scanner.shutdown().await;
    }

    #[tokio::test]
    async fn test_keyboard_scanner_reads_lines() {
        let input: &[u8] = b"0001\n\n  0002 \n";
        let scanner = KeyboardScanner::from_reader(BufReader::new(input));
        let mut codes = scanner.subscribe();
        assert_eq!(codes.recv().await.unwrap(), "0001");
        assert_eq!(codes.recv().await.unwrap(), "0002");
        scanner.shutdown().await;
    }
}
