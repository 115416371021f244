//! Transport shim between device drivers and serial ports.
//!
//! Drivers never touch bytes directly. They talk to a [`SerialEndpoint`], which wraps an
//! `Arc<dyn Transport>` and serialises every send/receive pair so that replies stay in FIFO
//! order with their requests even when several devices share one controller.
//!
//! # Types
//!
//! - [`SerialPortIO`]: async byte stream that can also apply line settings
//! - [`Transport`]: terminator-aware send/receive/purge plus port parameters
//! - [`SerialTransport`]: `Transport` over any `SerialPortIO` (tokio-serial, duplex streams)
//! - [`SerialEndpoint`]: cloneable, named handle with an exclusive exchange lock
//!
//! # Utilities
//!
//! - [`open_serial_async`]: Open a serial port with spawn_blocking
//! - [`drain_serial_buffer`]: Drain stale data from a serial port
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_core::transport::{open_serial_async, SerialEndpoint, SerialTransport};
//!
//! let port = open_serial_async("/dev/ttyUSB0", 9600, "ASI MS-2000").await?;
//! let endpoint = SerialEndpoint::new(Arc::new(SerialTransport::new("/dev/ttyUSB0", port, 9600)));
//!
//! let reply = endpoint.query("/", "\r", "\r\n").await?;
//! ```

use crate::error::{DaqError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, MutexGuard};

// =============================================================================
// Port Parameters
// =============================================================================

/// One line setting of a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortParameter {
    /// Baud rate in bits per second
    BaudRate(u32),
    /// Hardware handshaking on/off
    Handshaking(bool),
    /// Number of stop bits (1 or 2)
    StopBits(u8),
    /// How long `receive` waits for a complete reply
    AnswerTimeout(Duration),
    /// Pause inserted between transmitted characters
    DelayBetweenChars(Duration),
}

/// Snapshot of all line settings of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub handshaking: bool,
    pub stop_bits: u8,
    pub answer_timeout: Duration,
    pub delay_between_chars: Duration,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            handshaking: false,
            stop_bits: 1,
            answer_timeout: Duration::from_millis(2000),
            delay_between_chars: Duration::ZERO,
        }
    }
}

impl PortSettings {
    /// Apply one parameter to the snapshot.
    pub fn apply(&mut self, parameter: PortParameter) {
        match parameter {
            PortParameter::BaudRate(baud) => self.baud_rate = baud,
            PortParameter::Handshaking(on) => self.handshaking = on,
            PortParameter::StopBits(bits) => self.stop_bits = bits,
            PortParameter::AnswerTimeout(timeout) => self.answer_timeout = timeout,
            PortParameter::DelayBetweenChars(delay) => self.delay_between_chars = delay,
        }
    }
}

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Async serial byte stream.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can serve as a port.
/// Streams that model real hardware override [`SerialPortIO::apply_setting`] to push
/// baud rate, stop bits and flow control to the device; in-memory streams ignore them.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {
    /// Push a line setting down to the hardware.
    fn apply_setting(&mut self, _parameter: PortParameter) -> std::io::Result<()> {
        Ok(())
    }
}

impl SerialPortIO for tokio::io::DuplexStream {}

impl<T: SerialPortIO + ?Sized> SerialPortIO for Box<T> {
    fn apply_setting(&mut self, parameter: PortParameter) -> std::io::Result<()> {
        (**self).apply_setting(parameter)
    }
}

#[cfg(feature = "serial")]
impl SerialPortIO for tokio_serial::SerialStream {
    fn apply_setting(&mut self, parameter: PortParameter) -> std::io::Result<()> {
        use tokio_serial::SerialPort;

        match parameter {
            PortParameter::BaudRate(baud) => self.set_baud_rate(baud)?,
            PortParameter::Handshaking(on) => self.set_flow_control(if on {
                tokio_serial::FlowControl::Hardware
            } else {
                tokio_serial::FlowControl::None
            })?,
            PortParameter::StopBits(bits) => self.set_stop_bits(if bits >= 2 {
                tokio_serial::StopBits::Two
            } else {
                tokio_serial::StopBits::One
            })?,
            // Handled in software by SerialTransport
            PortParameter::AnswerTimeout(_) | PortParameter::DelayBetweenChars(_) => {}
        }
        Ok(())
    }
}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Transport Trait
// =============================================================================

/// Narrow, terminator-aware view of a serial port.
///
/// `receive` returns the reply with the terminator removed. A timeout, a closed
/// stream or an I/O error is reported as [`DaqError::CommunicationFailure`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Port name as configured (e.g. "/dev/ttyUSB0", "COM3")
    fn name(&self) -> &str;

    /// Write `text` followed by `terminator`.
    async fn send(&self, text: &str, terminator: &str) -> Result<()>;

    /// Read until `terminator` is seen or the answer timeout elapses.
    async fn receive(&self, terminator: &str) -> Result<String>;

    /// Discard any unread input.
    async fn purge(&self) -> Result<()>;

    /// Change one line setting.
    async fn set_parameter(&self, parameter: PortParameter) -> Result<()>;

    /// Current line settings.
    fn settings(&self) -> PortSettings;
}

// =============================================================================
// SerialTransport
// =============================================================================

/// [`Transport`] over any [`SerialPortIO`] stream.
pub struct SerialTransport<S: SerialPortIO> {
    name: String,
    port: Mutex<BufReader<S>>,
    settings: parking_lot::Mutex<PortSettings>,
}

impl<S: SerialPortIO> SerialTransport<S> {
    /// Wrap an already opened stream running at `baud_rate`.
    pub fn new(name: impl Into<String>, port: S, baud_rate: u32) -> Self {
        Self {
            name: name.into(),
            port: Mutex::new(BufReader::new(port)),
            settings: parking_lot::Mutex::new(PortSettings {
                baud_rate,
                ..PortSettings::default()
            }),
        }
    }

    fn failure(&self, message: impl Into<String>) -> DaqError {
        DaqError::communication(self.name.clone(), message)
    }
}

#[async_trait]
impl<S: SerialPortIO + 'static> Transport for SerialTransport<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, text: &str, terminator: &str) -> Result<()> {
        let delay = self.settings.lock().delay_between_chars;
        let mut guard = self.port.lock().await;
        let writer = guard.get_mut();
        let bytes = format!("{text}{terminator}").into_bytes();

        if delay.is_zero() {
            writer
                .write_all(&bytes)
                .await
                .map_err(|e| self.failure(format!("write failed: {e}")))?;
        } else {
            for byte in bytes {
                writer
                    .write_all(&[byte])
                    .await
                    .map_err(|e| self.failure(format!("write failed: {e}")))?;
                tokio::time::sleep(delay).await;
            }
        }
        writer
            .flush()
            .await
            .map_err(|e| self.failure(format!("flush failed: {e}")))
    }

    async fn receive(&self, terminator: &str) -> Result<String> {
        let timeout = self.settings.lock().answer_timeout;
        let term = terminator.as_bytes();
        let Some(&last) = term.last() else {
            return Err(DaqError::InvalidParameter("empty reply terminator".into()));
        };

        let mut guard = self.port.lock().await;
        let mut buf = Vec::new();
        let read = async {
            loop {
                let n = guard.read_until(last, &mut buf).await?;
                if n == 0 {
                    return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
                }
                if buf.ends_with(term) {
                    return Ok::<(), std::io::Error>(());
                }
            }
        };

        match tokio::time::timeout(timeout, read).await {
            Ok(Ok(())) => {
                buf.truncate(buf.len() - term.len());
                Ok(String::from_utf8_lossy(&buf).into_owned())
            }
            Ok(Err(e)) => Err(self.failure(format!("read failed: {e}"))),
            Err(_) => Err(self.failure(format!(
                "no complete reply within {} ms ({} bytes received)",
                timeout.as_millis(),
                buf.len()
            ))),
        }
    }

    async fn purge(&self) -> Result<()> {
        let mut guard = self.port.lock().await;
        let buffered = guard.buffer().len();
        guard.consume(buffered);
        let discarded = drain_serial_buffer(guard.get_mut(), 10).await;
        if buffered + discarded > 0 {
            tracing::debug!(port = %self.name, bytes = buffered + discarded, "Discarded stale bytes");
        }
        Ok(())
    }

    async fn set_parameter(&self, parameter: PortParameter) -> Result<()> {
        {
            let mut guard = self.port.lock().await;
            guard
                .get_mut()
                .apply_setting(parameter)
                .map_err(|e| self.failure(format!("cannot apply {parameter:?}: {e}")))?;
        }
        self.settings.lock().apply(parameter);
        Ok(())
    }

    fn settings(&self) -> PortSettings {
        *self.settings.lock()
    }
}

// =============================================================================
// SerialEndpoint
// =============================================================================

/// Named, cloneable handle on a transport shared by every device on one port.
///
/// All traffic goes through a [`Session`], which holds the endpoint's exchange lock
/// for its lifetime. One-shot helpers such as [`SerialEndpoint::query`] open a
/// session internally.
#[derive(Clone)]
pub struct SerialEndpoint {
    transport: Arc<dyn Transport>,
    exchange: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SerialEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialEndpoint")
            .field("name", &self.transport.name())
            .finish()
    }
}

impl SerialEndpoint {
    /// Create an endpoint over `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            exchange: Arc::new(Mutex::new(())),
        }
    }

    /// Port name.
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Acquire exclusive use of the port.
    pub async fn session(&self) -> Session<'_> {
        Session {
            transport: self.transport.as_ref(),
            _guard: self.exchange.lock().await,
        }
    }

    /// Send `command` and read one reply.
    pub async fn query(&self, command: &str, send_term: &str, recv_term: &str) -> Result<String> {
        self.session().await.query(command, send_term, recv_term).await
    }

    /// Send `command` without waiting for a reply.
    pub async fn send(&self, command: &str, send_term: &str) -> Result<()> {
        self.session().await.send(command, send_term).await
    }

    /// Discard unread input.
    pub async fn purge(&self) -> Result<()> {
        self.session().await.purge().await
    }

    /// Change one line setting.
    pub async fn set_parameter(&self, parameter: PortParameter) -> Result<()> {
        let _guard = self.exchange.lock().await;
        self.transport.set_parameter(parameter).await
    }

    /// Current line settings.
    pub fn settings(&self) -> PortSettings {
        self.transport.settings()
    }
}

/// Exclusive use of an endpoint. Dropping the session releases the port.
pub struct Session<'a> {
    transport: &'a dyn Transport,
    _guard: MutexGuard<'a, ()>,
}

impl Session<'_> {
    /// Write one command.
    pub async fn send(&self, command: &str, send_term: &str) -> Result<()> {
        tracing::debug!(port = %self.transport.name(), command, "tx");
        self.transport.send(command, send_term).await
    }

    /// Read one reply.
    pub async fn receive(&self, recv_term: &str) -> Result<String> {
        let reply = self.transport.receive(recv_term).await;
        match &reply {
            Ok(text) => tracing::debug!(port = %self.transport.name(), reply = %text, "rx"),
            Err(e) => tracing::debug!(port = %self.transport.name(), error = %e, "rx failed"),
        }
        reply
    }

    /// Send `command` and read one reply.
    pub async fn query(&self, command: &str, send_term: &str, recv_term: &str) -> Result<String> {
        self.send(command, send_term).await?;
        self.receive(recv_term).await
    }

    /// Discard unread input.
    pub async fn purge(&self) -> Result<()> {
        self.transport.purge().await
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Read and discard whatever the port delivers within `timeout_ms`.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn duplex_transport() -> (tokio::io::DuplexStream, SerialTransport<tokio::io::DuplexStream>) {
        let (host, device) = tokio::io::duplex(256);
        (host, SerialTransport::new("duplex", device, 9600))
    }

    #[tokio::test]
    async fn send_appends_terminator() {
        let (mut host, transport) = duplex_transport();
        transport.send("W X Y", "\r").await.unwrap();

        let mut buf = [0u8; 16];
        let n = host.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"W X Y\r");
    }

    #[tokio::test]
    async fn receive_strips_multi_byte_terminator() {
        let (mut host, transport) = duplex_transport();
        host.write_all(b":A 12 34\r\n\x03").await.unwrap();

        let reply = transport.receive("\r\n\x03").await.unwrap();
        assert_eq!(reply, ":A 12 34");
    }

    #[tokio::test]
    async fn receive_keeps_lone_last_byte_inside_reply() {
        let (mut host, transport) = duplex_transport();
        host.write_all(b"a\nb\r\n").await.unwrap();

        assert_eq!(transport.receive("\r\n").await.unwrap(), "a\nb");
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out_as_communication_failure() {
        let (_host, transport) = duplex_transport();
        transport
            .set_parameter(PortParameter::AnswerTimeout(Duration::from_millis(500)))
            .await
            .unwrap();

        let err = transport.receive("\r\n").await.unwrap_err();
        assert!(err.is_link_failure());
    }

    #[tokio::test]
    async fn purge_discards_stale_input() {
        let (mut host, transport) = duplex_transport();
        host.write_all(b"stale\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        transport.purge().await.unwrap();
        host.write_all(b":A\r\n").await.unwrap();
        assert_eq!(transport.receive("\r\n").await.unwrap(), ":A");
    }

    #[tokio::test]
    async fn parameters_are_reflected_in_settings() {
        let (_host, transport) = duplex_transport();
        transport
            .set_parameter(PortParameter::BaudRate(115_200))
            .await
            .unwrap();
        transport
            .set_parameter(PortParameter::StopBits(2))
            .await
            .unwrap();

        let settings = transport.settings();
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.stop_bits, 2);
    }

    #[tokio::test]
    async fn endpoint_clones_share_the_port() {
        let (mut host, transport) = duplex_transport();
        let endpoint = SerialEndpoint::new(Arc::new(transport));
        let clone = endpoint.clone();

        host.write_all(b":A\r\n").await.unwrap();
        let reply = clone.query("/", "\r", "\r\n").await.unwrap();
        assert_eq!(reply, ":A");
        assert_eq!(endpoint.name(), "duplex");

        let mut buf = [0u8; 8];
        let n = host.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"/\r");
    }

    #[tokio::test]
    async fn test_drain_serial_buffer() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_serial_buffer(&mut device, 50).await;
        assert_eq!(discarded, 16);
    }
}
