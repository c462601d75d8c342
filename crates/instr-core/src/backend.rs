//! Message-based backend: framed command/response exchanges over an async
//! transport.
//!
//! A [`Backend`] owns the transport behind a single `tokio::sync::Mutex`;
//! that mutex is the device lock. It is held for exactly the span of one
//! exchange (write the request, read the expected response lines) because
//! the physical links are half-duplex with no correlation ids — two
//! interleaved exchanges corrupt both. Pure computation (encoding,
//! validation, caching) happens outside the lock.
//!
//! Channels and subsystems share their root's `Arc<Backend>`, so one lock
//! serializes the whole device tree. For deliberately longer critical
//! sections (an action doing several exchanges back to back, or the
//! wait/poll pattern) take a [`Session`] and keep it across the calls.
//!
//! Transports are anything `AsyncRead + AsyncWrite`: a serial port (feature
//! `serial`), a TCP socket, or an in-memory duplex stream in tests.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{InstrError, Result};

/// Sleep between polls while a wait/poll operation rides out read timeouts.
const POLL_BACKOFF: Duration = Duration::from_millis(100);

/// Anything usable as an instrument transport.
pub trait TransportIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportIO for T {}

/// Type-erased boxed transport.
pub type DynTransport = Box<dyn TransportIO>;

/// Line framing and timing for one instrument link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Terminator appended to every outgoing command.
    #[serde(default = "default_termination")]
    pub write_termination: String,
    /// Terminator ending every incoming response line.
    #[serde(default = "default_termination")]
    pub read_termination: String,
    /// Read deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Delay after sending each command (some instruments need settling).
    #[serde(default)]
    pub command_delay_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            write_termination: default_termination(),
            read_termination: default_termination(),
            timeout_ms: default_timeout_ms(),
            command_delay_ms: 0,
        }
    }
}

fn default_termination() -> String {
    "\n".to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

impl ProtocolConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Both terminators set at once, the common case.
    pub fn with_termination(mut self, termination: &str) -> Self {
        self.write_termination = termination.to_string();
        self.read_termination = termination.to_string();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Transport addressing, deserializable from driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ConnectionSpec {
    /// Serial port (requires the `serial` feature).
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// TCP/IP socket instrument.
    Tcp { host: String, port: u16 },
}

fn default_baud_rate() -> u32 {
    9600
}

/// The serialized command/response gateway to one instrument.
pub struct Backend {
    io: Mutex<BufReader<DynTransport>>,
    config: ProtocolConfig,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Wrap an already-open transport.
    pub fn new(io: DynTransport, config: ProtocolConfig) -> Self {
        Self {
            io: Mutex::new(BufReader::new(io)),
            config,
        }
    }

    /// Open the transport described by `spec`.
    pub async fn open(spec: &ConnectionSpec, config: ProtocolConfig) -> Result<Self> {
        match spec {
            ConnectionSpec::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| {
                        InstrError::Communication(format!(
                            "cannot connect to {}:{}: {}",
                            host, port, e
                        ))
                    })?;
                Ok(Self::new(Box::new(stream), config))
            }
            #[cfg(feature = "serial")]
            ConnectionSpec::Serial { port, baud_rate } => {
                use tokio_serial::SerialPortBuilderExt;
                let stream = tokio_serial::new(port, *baud_rate)
                    .open_native_async()
                    .map_err(|e| {
                        InstrError::Communication(format!(
                            "cannot open serial port {}: {}",
                            port, e
                        ))
                    })?;
                Ok(Self::new(Box::new(stream), config))
            }
            #[cfg(not(feature = "serial"))]
            ConnectionSpec::Serial { .. } => Err(InstrError::config(
                "serial support not enabled; rebuild with --features serial",
            )),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Acquire the device lock for a multi-exchange critical section.
    pub async fn session(&self) -> Session<'_> {
        Session {
            guard: self.io.lock().await,
            config: &self.config,
        }
    }

    /// Send one command, expect no response.
    pub async fn write(&self, command: &str) -> Result<()> {
        self.session().await.write(command).await
    }

    /// Read one response line.
    pub async fn read(&self) -> Result<String> {
        self.session().await.read().await
    }

    /// One write+read exchange under the lock.
    pub async fn query(&self, command: &str) -> Result<String> {
        self.session().await.query(command).await
    }

    /// One exchange whose response is multiple lines ended by a sentinel
    /// token. Returns the sentinel seen and the body lines joined by `\n`.
    pub async fn query_until(&self, command: &str, terminators: &[&str]) -> Result<(String, String)> {
        self.session().await.query_until(command, terminators).await
    }

    /// Wait/poll: send `command`, then keep reading until `is_terminal`
    /// accepts a line or `timeout` elapses. See [`Session::wait_until`].
    pub async fn wait_for(
        &self,
        command: &str,
        timeout: Duration,
        is_terminal: impl Fn(&str) -> bool + Send,
    ) -> Result<bool> {
        let mut session = self.session().await;
        session.write(command).await?;
        session.wait_until(timeout, is_terminal).await
    }
}

/// Exclusive access to the transport for one or more exchanges.
///
/// Dropping the session releases the device lock on every exit path.
pub struct Session<'a> {
    guard: MutexGuard<'a, BufReader<DynTransport>>,
    config: &'a ProtocolConfig,
}

impl Session<'_> {
    /// Write one terminated command.
    pub async fn write(&mut self, command: &str) -> Result<()> {
        tracing::debug!(command, "sending");
        let mut bytes = Vec::with_capacity(command.len() + 2);
        bytes.extend_from_slice(command.as_bytes());
        bytes.extend_from_slice(self.config.write_termination.as_bytes());
        let io = self.guard.get_mut();
        io.write_all(&bytes).await?;
        io.flush().await?;
        if self.config.command_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.command_delay_ms)).await;
        }
        Ok(())
    }

    /// Read one response line within the configured deadline.
    pub async fn read(&mut self) -> Result<String> {
        self.read_within(self.config.timeout()).await
    }

    async fn read_within(&mut self, limit: Duration) -> Result<String> {
        let delimiter = self
            .config
            .read_termination
            .as_bytes()
            .last()
            .copied()
            .unwrap_or(b'\n');
        let mut buf = Vec::new();
        let n = tokio::time::timeout(limit, self.guard.read_until(delimiter, &mut buf))
            .await
            .map_err(|_| InstrError::Timeout {
                after_ms: limit.as_millis() as u64,
            })??;
        if n == 0 {
            return Err(InstrError::Communication(
                "unexpected EOF from transport".to_string(),
            ));
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        tracing::debug!(response = %line, "received");
        Ok(line)
    }

    /// One write+read exchange.
    pub async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        self.read().await
    }

    /// Write, then read lines until one equals a sentinel token.
    pub async fn query_until(
        &mut self,
        command: &str,
        terminators: &[&str],
    ) -> Result<(String, String)> {
        self.write(command).await?;
        let mut body: Vec<String> = Vec::new();
        loop {
            let line = self.read().await?;
            if terminators.contains(&line.as_str()) {
                return Ok((line, body.join("\n")));
            }
            body.push(line);
        }
    }

    /// Poll for completion of an asynchronous device operation.
    ///
    /// Read timeouts are treated as "still in progress" and retried with a
    /// short backoff while the cumulative elapsed time stays under
    /// `timeout`; any other error propagates immediately. Deadline expiry
    /// returns `Ok(false)` so the caller can go on to poll status itself.
    pub async fn wait_until(
        &mut self,
        timeout: Duration,
        is_terminal: impl Fn(&str) -> bool,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match self.read_within(remaining.min(self.config.timeout())).await {
                Ok(line) if is_terminal(&line) => return Ok(true),
                Ok(_) => {}
                Err(err) if err.is_timeout() => {
                    if tokio::time::Instant::now() + POLL_BACKOFF >= deadline {
                        return Ok(false);
                    }
                    tokio::time::sleep(POLL_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    fn backend_with(config: ProtocolConfig) -> (Backend, tokio::io::DuplexStream) {
        let (host, device) = tokio::io::duplex(256);
        (Backend::new(Box::new(device), config), host)
    }

    #[tokio::test]
    async fn write_appends_termination() {
        let config = ProtocolConfig::default().with_termination("\r\n");
        let (backend, host) = backend_with(config);
        backend.write("setm 1 stp").await.unwrap();

        let mut lines = tokio::io::BufReader::new(host);
        let mut line = String::new();
        lines.read_line(&mut line).await.unwrap();
        assert_eq!(line, "setm 1 stp\r\n");
    }

    #[tokio::test]
    async fn query_round_trip() {
        let (backend, host) = backend_with(ProtocolConfig::default());
        let sim = tokio::spawn(async move {
            let mut io = tokio::io::BufReader::new(host);
            let mut line = String::new();
            io.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim_end(), "getm 1");
            io.get_mut().write_all(b"stp\n").await.unwrap();
        });
        assert_eq!(backend.query("getm 1").await.unwrap(), "stp");
        sim.await.unwrap();
    }

    #[tokio::test]
    async fn read_deadline_maps_to_timeout() {
        let config = ProtocolConfig::default().with_timeout_ms(20);
        let (backend, _host) = backend_with(config);
        let err = backend.read().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn eof_is_a_communication_error() {
        let (backend, host) = backend_with(ProtocolConfig::default());
        drop(host);
        let err = backend.read().await.unwrap_err();
        assert!(matches!(err, InstrError::Communication(_)));
    }

    #[tokio::test]
    async fn sentinel_terminated_response() {
        let (backend, host) = backend_with(ProtocolConfig::default());
        let sim = tokio::spawn(async move {
            let mut io = tokio::io::BufReader::new(host);
            let mut line = String::new();
            io.read_line(&mut line).await.unwrap();
            io.get_mut().write_all(b"ANM150 sn 1234\nOK\n").await.unwrap();
        });
        let (terminator, body) = backend
            .query_until("getser 1", &["OK", "ERROR"])
            .await
            .unwrap();
        assert_eq!(terminator, "OK");
        assert_eq!(body, "ANM150 sn 1234");
        sim.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_sees_late_terminal_line() {
        let config = ProtocolConfig::default().with_timeout_ms(50);
        let (backend, host) = backend_with(config);
        let sim = tokio::spawn(async move {
            let mut io = tokio::io::BufReader::new(host);
            let mut line = String::new();
            io.read_line(&mut line).await.unwrap();
            // Respond well after the per-read deadline to force retries.
            tokio::time::sleep(Duration::from_millis(250)).await;
            io.get_mut().write_all(b"OK\n").await.unwrap();
        });
        let done = backend
            .wait_for("capw 1", Duration::from_secs(2), |line| line == "OK")
            .await
            .unwrap();
        assert!(done);
        sim.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_returns_false_on_deadline() {
        let config = ProtocolConfig::default().with_timeout_ms(30);
        let (backend, _host) = backend_with(config);
        let done = backend
            .wait_for("capw 1", Duration::from_millis(200), |line| line == "OK")
            .await
            .unwrap();
        assert!(!done);
    }

    #[tokio::test]
    async fn exchanges_serialize_across_tasks() {
        let (backend, host) = backend_with(ProtocolConfig::default());
        let backend = std::sync::Arc::new(backend);
        let sim = tokio::spawn(async move {
            let mut io = tokio::io::BufReader::new(host);
            for _ in 0..16 {
                let mut line = String::new();
                io.read_line(&mut line).await.unwrap();
                let reply = format!("echo {}\n", line.trim_end());
                io.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });

        let mut tasks = Vec::new();
        for i in 0..16 {
            let backend = backend.clone();
            tasks.push(tokio::spawn(async move {
                let cmd = format!("cmd {}", i);
                let reply = backend.query(&cmd).await.unwrap();
                assert_eq!(reply, format!("echo {}", cmd));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        sim.await.unwrap();
    }

    #[test]
    fn connection_spec_deserializes_from_yaml() {
        let spec: ConnectionSpec =
            serde_yaml::from_str("transport: tcp\nhost: 192.168.1.2\nport: 7230\n").unwrap();
        assert_eq!(
            spec,
            ConnectionSpec::Tcp {
                host: "192.168.1.2".to_string(),
                port: 7230
            }
        );

        let spec: ConnectionSpec =
            serde_yaml::from_str("transport: serial\nport: /dev/ttyUSB0\n").unwrap();
        assert_eq!(
            spec,
            ConnectionSpec::Serial {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600
            }
        );
    }
}
