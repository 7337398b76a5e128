//! Line-oriented SCPI transport over blocking byte streams.
//!
//! Instrument I/O (TCP sockets, serial ports, VISA sessions) is synchronous, so every
//! exchange runs on Tokio's blocking pool with the stream held behind an
//! `Arc<Mutex<_>>`. Commands are terminated with `\n`; responses are read up to the
//! next `\n`. Binary curve data uses IEEE 488.2 definite-length blocks, which are read
//! by header so payload bytes that happen to equal `\n` are never mistaken for a
//! terminator.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::waveform::{RawCapture, BLOCK_MARKER};

/// Text command channel to one instrument.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Send a command that produces no response.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a query and return the trimmed response line.
    async fn query(&mut self, query: &str) -> Result<String>;

    /// Read one definite-length block following a previously written query.
    /// A header announcing more than `max_payload` bytes fails before any
    /// payload is read.
    async fn read_block(&mut self, max_payload: usize) -> Result<RawCapture>;
}

#[async_trait]
impl<T> ScpiTransport for Box<T>
where
    T: ScpiTransport + ?Sized,
{
    async fn write(&mut self, command: &str) -> Result<()> {
        (**self).write(command).await
    }

    async fn query(&mut self, query: &str) -> Result<String> {
        (**self).query(query).await
    }

    async fn read_block(&mut self, max_payload: usize) -> Result<RawCapture> {
        (**self).read_block(max_payload).await
    }
}

/// Where an instrument is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// Raw socket, e.g. a scope's socket server or a Prologix GPIB-ETHERNET.
    Tcp { address: String },
    /// Serial port, e.g. a Prologix GPIB-USB.
    Serial { port: String, baud_rate: u32 },
    /// VISA resource string.
    Visa { resource: String },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { address } => write!(f, "tcp://{address}"),
            Endpoint::Serial { port, baud_rate } => write!(f, "{port}@{baud_rate}"),
            Endpoint::Visa { resource } => f.write_str(resource),
        }
    }
}

/// Open a transport to `endpoint`.
pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Box<dyn ScpiTransport>> {
    match endpoint {
        Endpoint::Tcp { address } => Ok(Box::new(open_tcp(address, timeout)?)),
        Endpoint::Serial { port, baud_rate } => open_serial(port, *baud_rate, timeout),
        Endpoint::Visa { resource } => open_visa(resource, timeout),
    }
}

fn open_tcp(address: &str, timeout: Duration) -> Result<StreamTransport<TcpStream>> {
    let addr = address
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve '{address}'"))?
        .next()
        .ok_or_else(|| anyhow!("No address found for '{address}'"))?;
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .with_context(|| format!("Failed to connect to {address}"))?;
    stream
        .set_read_timeout(Some(READ_POLL))
        .context("Failed to set socket read timeout")?;
    stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
    debug!(address, "socket connected");
    Ok(StreamTransport::new(address, stream, timeout))
}

#[cfg(feature = "instrument_serial")]
fn open_serial(port: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn ScpiTransport>> {
    let stream = serialport::new(port, baud_rate)
        .timeout(READ_POLL)
        .open()
        .with_context(|| format!("Failed to open serial port '{port}' at {baud_rate} baud"))?;
    debug!(port, baud_rate, "serial port opened");
    Ok(Box::new(StreamTransport::new(port, stream, timeout)))
}

#[cfg(not(feature = "instrument_serial"))]
fn open_serial(port: &str, _baud_rate: u32, _timeout: Duration) -> Result<Box<dyn ScpiTransport>> {
    bail!("Cannot open '{port}': serial support not enabled. Rebuild with --features instrument_serial")
}

#[cfg(feature = "instrument_visa")]
mod visa_session {
    use std::ffi::CString;
    use std::io::{Read, Write};

    use anyhow::{Context, Result};
    use visa_rs::prelude::*;

    /// A VISA session together with the resource manager that owns it.
    pub struct VisaSession {
        instrument: visa_rs::Instrument,
        _rm: DefaultRM,
    }

    impl VisaSession {
        pub fn open(resource: &str) -> Result<Self> {
            let rm = DefaultRM::new().context("Failed to open VISA resource manager")?;
            let c_string = CString::new(resource).context("Failed to create CString")?;
            let visa_string = visa_rs::VisaString::from(c_string);
            let instrument = rm
                .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .with_context(|| format!("Failed to open VISA resource '{resource}'"))?;
            Ok(Self {
                instrument,
                _rm: rm,
            })
        }
    }

    impl Read for VisaSession {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.instrument.read(buf)
        }
    }

    impl Write for VisaSession {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.instrument.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.instrument.flush()
        }
    }
}

#[cfg(feature = "instrument_visa")]
fn open_visa(resource: &str, timeout: Duration) -> Result<Box<dyn ScpiTransport>> {
    let session = visa_session::VisaSession::open(resource)?;
    debug!(resource, "VISA session opened");
    Ok(Box::new(StreamTransport::new(resource, session, timeout)))
}

#[cfg(not(feature = "instrument_visa"))]
fn open_visa(resource: &str, _timeout: Duration) -> Result<Box<dyn ScpiTransport>> {
    bail!("Cannot open '{resource}': VISA support not enabled. Rebuild with --features instrument_visa")
}

/// Per-read poll interval of the underlying stream; the overall deadline is the
/// transport timeout.
const READ_POLL: Duration = Duration::from_millis(100);

/// [`ScpiTransport`] over any blocking `Read + Write` stream.
pub struct StreamTransport<S> {
    name: String,
    stream: Arc<Mutex<S>>,
    timeout: Duration,
}

impl<S> StreamTransport<S>
where
    S: Read + Write + Send + 'static,
{
    pub fn new(name: &str, stream: S, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            stream: Arc::new(Mutex::new(stream)),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` against the stream on the blocking pool.
    async fn with_stream<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S, Instant) -> Result<T> + Send + 'static,
    {
        let stream = Arc::clone(&self.stream);
        let deadline = Instant::now() + self.timeout;
        tokio::task::spawn_blocking(move || {
            let mut guard = stream.blocking_lock();
            op(&mut *guard, deadline)
        })
        .await
        .with_context(|| format!("I/O task for {} panicked", self.name))?
    }
}

fn send_line<S: Write>(stream: &mut S, command: &str) -> Result<()> {
    stream
        .write_all(command.as_bytes())
        .and_then(|()| stream.write_all(b"\n"))
        .and_then(|()| stream.flush())
        .with_context(|| format!("Failed to send '{command}'"))
}

/// Fill `buf` completely, tolerating read timeouts until `deadline`.
fn read_exact_until<S: Read>(stream: &mut S, buf: &mut [u8], deadline: Instant) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        if Instant::now() > deadline {
            bail!("Read timed out with {filled} of {} bytes received", buf.len());
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => bail!("Connection closed by instrument"),
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(anyhow!(e).context("Read failed")),
        }
    }
    Ok(())
}

/// Read up to and excluding the next `\n`.
fn read_line<S: Read>(stream: &mut S, deadline: Instant) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        read_exact_until(stream, &mut byte, deadline)?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

/// Read a definite-length block, header included. Leading whitespace left over
/// from a previous response is skipped.
fn read_definite_block<S: Read>(
    stream: &mut S,
    deadline: Instant,
    max_payload: usize,
) -> Result<RawCapture> {
    let mut byte = [0u8; 1];
    loop {
        read_exact_until(stream, &mut byte, deadline)?;
        if !byte[0].is_ascii_whitespace() {
            break;
        }
    }
    if byte[0] != BLOCK_MARKER {
        bail!(
            "Expected block marker '#', found {:?}",
            char::from(byte[0])
        );
    }

    let mut digit = [0u8; 1];
    read_exact_until(stream, &mut digit, deadline)?;
    let digits = match digit[0] {
        b'1'..=b'9' => usize::from(digit[0] - b'0'),
        other => bail!("Invalid block length digit {:?}", char::from(other)),
    };

    let mut count = vec![0u8; digits];
    read_exact_until(stream, &mut count, deadline)?;
    let nbytes: usize = std::str::from_utf8(&count)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("Invalid block byte count {:?}", String::from_utf8_lossy(&count)))?;
    if nbytes > max_payload {
        bail!("Block header announces {nbytes} bytes, limit is {max_payload}");
    }

    let mut block = Vec::with_capacity(2 + digits + nbytes);
    block.push(BLOCK_MARKER);
    block.push(digit[0]);
    block.extend_from_slice(&count);
    let start = block.len();
    block.resize(start + nbytes, 0);
    read_exact_until(stream, &mut block[start..], deadline)?;
    Ok(RawCapture::new(block))
}

#[async_trait]
impl<S> ScpiTransport for StreamTransport<S>
where
    S: Read + Write + Send + 'static,
{
    async fn write(&mut self, command: &str) -> Result<()> {
        let command = command.to_string();
        debug!(target: "scpi", instrument = %self.name, command = %command, "write");
        self.with_stream(move |s, _| send_line(s, &command)).await
    }

    async fn query(&mut self, query: &str) -> Result<String> {
        let query = query.to_string();
        let response = self
            .with_stream(move |s, deadline| {
                send_line(s, &query)?;
                // A block transfer leaves its terminator behind.
                loop {
                    let line = read_line(s, deadline)
                        .with_context(|| format!("No response to '{query}'"))?;
                    if !line.is_empty() {
                        return Ok(line);
                    }
                }
            })
            .await?;
        debug!(target: "scpi", instrument = %self.name, response = %response, "query");
        Ok(response)
    }

    async fn read_block(&mut self, max_payload: usize) -> Result<RawCapture> {
        let block = self
            .with_stream(move |s, deadline| read_definite_block(s, deadline, max_payload))
            .await?;
        debug!(target: "scpi", instrument = %self.name, bytes = block.len(), "block");
        Ok(block)
    }
}

/// Parse a numeric query response such as `2.0E-3` or `:WFMPRE:YMULT 2.0E-3`.
pub fn parse_number(response: &str) -> Result<f64> {
    let value = response
        .split_whitespace()
        .last()
        .ok_or_else(|| anyhow!("Empty numeric response"))?;
    value
        .parse()
        .with_context(|| format!("Invalid numeric response '{response}'"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::waveform::encode_block;
    use std::io::Cursor;

    /// In-memory stream: reads from a scripted input, records what is written.
    pub(crate) struct LoopbackStream {
        input: Cursor<Vec<u8>>,
        written: Arc<std::sync::Mutex<Vec<u8>>>,
    }

    impl LoopbackStream {
        pub(crate) fn new(input: &[u8]) -> (Self, Arc<std::sync::Mutex<Vec<u8>>>) {
            let written = Arc::new(std::sync::Mutex::new(Vec::new()));
            (
                Self {
                    input: Cursor::new(input.to_vec()),
                    written: Arc::clone(&written),
                },
                written,
            )
        }
    }

    impl Read for LoopbackStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for LoopbackStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn transport(input: &[u8]) -> (StreamTransport<LoopbackStream>, Arc<std::sync::Mutex<Vec<u8>>>) {
        let (stream, written) = LoopbackStream::new(input);
        (
            StreamTransport::new("loopback", stream, Duration::from_secs(1)),
            written,
        )
    }

    #[tokio::test]
    async fn test_write_appends_terminator() {
        let (mut t, written) = transport(b"");
        t.write("DATA:WIDTH 2").await.unwrap();
        assert_eq!(&*written.lock().unwrap(), b"DATA:WIDTH 2\n");
    }

    #[tokio::test]
    async fn test_query_reads_one_line() {
        let (mut t, _) = transport(b"1.5E-3\n2\n");
        assert_eq!(t.query("WFMPRE:YMULT?").await.unwrap(), "1.5E-3");
        assert_eq!(t.query("WFMPRE:YOFF?").await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_block_then_query_skips_terminator() {
        let block = encode_block(&[10, 0x0a0a, -1]);
        let mut input = block.as_bytes().to_vec();
        input.extend_from_slice(b"1\n");
        let (mut t, _) = transport(&input);

        t.write("CURVE?").await.unwrap();
        let raw = t.read_block(64).await.unwrap();
        assert_eq!(raw.as_bytes(), &block.as_bytes()[..block.len() - 1]);
        assert_eq!(t.query("*OPC?").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_block_without_marker_fails() {
        let (mut t, _) = transport(b"ERR\n");
        assert!(t.read_block(64).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_block_header_fails_early() {
        let (mut t, _) = transport(b"#9999999999");
        let err = t.read_block(10_002).await.unwrap_err();
        assert!(err.to_string().contains("999999999 bytes"));

        let block = encode_block(&[1, 2, 3]);
        let (mut t, _) = transport(block.as_bytes());
        assert!(t.read_block(4).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_stream_fails_query() {
        let (mut t, _) = transport(b"");
        let err = t.query("*IDN?").await.unwrap_err();
        assert!(format!("{err:#}").contains("*IDN?"));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("2.0E-3").unwrap(), 2.0e-3);
        assert_eq!(parse_number(":WFMPRE:YOFF 5.0").unwrap(), 5.0);
        assert!(parse_number("").is_err());
        assert!(parse_number("abc").is_err());
    }

    #[test]
    fn test_endpoint_from_toml() {
        let e: Endpoint = toml::from_str("kind = \"serial\"\nport = \"/dev/ttyUSB0\"\nbaud_rate = 9600").unwrap();
        assert_eq!(
            e,
            Endpoint::Serial {
                port: "/dev/ttyUSB0".into(),
                baud_rate: 9600
            }
        );
        assert_eq!(e.to_string(), "/dev/ttyUSB0@9600");
    }
}
