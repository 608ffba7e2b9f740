//! Serial port plumbing shared by every serial device.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining AsyncRead + AsyncWrite for serial ports
//! - [`DynSerial`]: type-erased boxed serial port
//! - [`SerialSettings`]: line settings (baud, framing, handshake)
//! - [`SerialLink`]: receive loop + ordered fire-and-forget writer around one port
//!
//! Writes go through a bounded queue. When a stalled port lets it fill up, new writes are
//! dropped and logged instead of growing memory.
//!
//! The receive loop plays the role of the driver's receive callback: every chunk read
//! from the port is passed to the device's handler on the link's own task, so protocol
//! adapters never block each other.
//!
//! # Example
//!
//! ```rust,ignore
//! use volume_station::devices::serial::{open_serial_async, SerialLink, SerialSettings};
//!
//! let port = open_serial_async("/dev/ttyUSB0", &SerialSettings::new(9600), "scanner").await?;
//! let link = SerialLink::spawn(port, "scanner", |chunk| println!("{chunk:?}"));
//! link.send(b"\x02".to_vec());
//! ```

use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{AppResult, StationError};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Implemented by `tokio_serial::SerialStream` for hardware and by
/// `tokio::io::DuplexStream` in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Size of one read from the port.
const READ_CHUNK_SIZE: usize = 256;

/// Writes queued ahead of a slow port before new ones are dropped.
pub const WRITE_QUEUE_CAPACITY: usize = 64;

/// Back-off after a read error before reading again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(50);

// =============================================================================
// Settings
// =============================================================================

/// Parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Line settings for a serial device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (7 or 8)
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// RTS/CTS hardware handshake
    pub rts_cts: bool,
}

impl SerialSettings {
    /// 8N1 at the given baud rate.
    pub const fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            rts_cts: false,
        }
    }

    /// Override parity.
    pub const fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Override stop bits.
    pub const fn stop_bits(mut self, stop_bits: u8) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Enable the RTS/CTS handshake.
    pub const fn with_rts_cts(mut self) -> Self {
        self.rts_cts = true;
        self
    }
}

// =============================================================================
// Opening
// =============================================================================

/// Open a serial port asynchronously using `spawn_blocking`.
///
/// # Errors
///
/// `StationError::Serial` when the port cannot be opened or configured.
pub async fn open_serial_async(
    port_path: &str,
    settings: &SerialSettings,
    device_name: &str,
) -> AppResult<DynSerial> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let settings = *settings;

    debug!(
        device = device_name,
        port = port_path,
        baud = settings.baud_rate,
        "Opening serial port"
    );

    let opened = spawn_blocking(move || -> Result<tokio_serial::SerialStream, tokio_serial::Error> {
        let data_bits = match settings.data_bits {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = match settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let flow_control = if settings.rts_cts {
            tokio_serial::FlowControl::Hardware
        } else {
            tokio_serial::FlowControl::None
        };

        tokio_serial::new(&port_path_owned, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .open_native_async()
    })
    .await
    .map_err(|e| StationError::Serial {
        port: port_path.to_string(),
        message: format!("spawn_blocking for serial port opening failed: {}", e),
    })?;

    let port = opened.map_err(|e| StationError::Serial {
        port: port_path.to_string(),
        message: format!("Failed to open {} serial port: {}", device_name, e),
    })?;
    Ok(Box::new(port))
}

// =============================================================================
// SerialLink
// =============================================================================

/// Receive loop plus ordered writer around one port.
pub struct SerialLink {
    name: String,
    writes: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SerialLink {
    /// Start the read and write tasks. `on_bytes` runs on the read task for every chunk.
    pub fn spawn<F>(port: DynSerial, name: impl Into<String>, on_bytes: F) -> Self
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let name = name.into();
        let (reader, writer) = tokio::io::split(port);
        let (writes, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        let read_task = tokio::spawn(read_loop(reader, name.clone(), cancel.clone(), on_bytes));
        let write_task = tokio::spawn(write_loop(writer, name.clone(), cancel.clone(), write_rx));

        Self {
            name,
            writes,
            cancel,
            tasks: Mutex::new(vec![read_task, write_task]),
        }
    }

    /// Queue bytes for writing without blocking. Returns false when the write was dropped
    /// because the queue is full or the link is closed.
    pub fn send(&self, bytes: Vec<u8>) -> bool {
        match self.writes.try_send(bytes) {
            Ok(()) => true,
            Err(TrySendError::Full(bytes)) => {
                warn!(device = %self.name, bytes = bytes.len(), "Write queue full, dropping write");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(device = %self.name, "Write dropped, link is closed");
                false
            }
        }
    }

    /// Device name used in log fields.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once [`shutdown`](Self::shutdown) has run.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop both tasks. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop<R, F>(mut reader: R, name: String, cancel: CancellationToken, mut on_bytes: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!(device = %name, "Serial port closed");
                break;
            }
            Ok(n) => {
                trace!(device = %name, bytes = n, "Serial chunk received");
                on_bytes(&buf[..n]);
            }
            Err(e) => {
                warn!(device = %name, error = %e, "Serial read failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    name: String,
    cancel: CancellationToken,
    mut writes: mpsc::Receiver<Vec<u8>>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            bytes = writes.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(device = %name, error = %e, "Serial write failed");
        }
    }
}
