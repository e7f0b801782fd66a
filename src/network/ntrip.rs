//! NTRIP correction-service client
//!
//! Session lifecycle: `Disconnected -> Connecting -> Authenticating ->
//! Streaming -> Disconnected`, repeated with exponential backoff until the
//! stop flag is raised. Correction bytes are handed to a [`CorrectionSink`]
//! exactly as received (after transfer decoding); the client never
//! interprets them.

use crate::core::PositionFix;
use crate::network::backoff::{sleep_interruptible, Backoff, BackoffPolicy};
use crate::processing::sentence::{encode_gga, encode_sentence, split_sentence};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Socket read timeout while streaming; bounds stop-flag latency
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Largest accepted response header block
const MAX_HEADER_LEN: usize = 8 * 1024;

const READ_CHUNK: usize = 4096;

const USER_AGENT: &str = concat!("NTRIP rtk-positioning/", env!("CARGO_PKG_VERSION"));

/// Correction-service errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NtripError {
    #[error("invalid correction configuration: {parameter} = {value}")]
    Configuration { parameter: String, value: String },
    #[error("cannot resolve caster address {address}: {details}")]
    Resolve { address: String, details: String },
    #[error("connection to {address} failed: {details}")]
    Connect { address: String, details: String },
    #[error("I/O error during {operation}: {details}")]
    Io { operation: String, details: String },
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("mountpoint '{mountpoint}' not found, caster returned its source table")]
    SourceTable { mountpoint: String },
    #[error("caster rejected the request: {status}")]
    Rejected { status: String },
    #[error("malformed caster response: {details}")]
    MalformedResponse { details: String },
    #[error("invalid chunked transfer encoding: {details}")]
    Chunked { details: String },
    #[error("caster closed the connection")]
    ConnectionClosed,
}

impl NtripError {
    pub(crate) fn configuration(parameter: &str, value: impl fmt::Display) -> Self {
        NtripError::Configuration {
            parameter: parameter.to_string(),
            value: value.to_string(),
        }
    }

    fn io(operation: &str, error: &std::io::Error) -> Self {
        NtripError::Io {
            operation: operation.to_string(),
            details: error.to_string(),
        }
    }

    fn malformed(details: impl Into<String>) -> Self {
        NtripError::MalformedResponse {
            details: details.into(),
        }
    }

    /// Whether retrying with the same configuration can succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, NtripError::Configuration { .. })
    }
}

/// NTRIP protocol revision used for the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NtripVersion {
    /// NTRIP 1.0: HTTP/1.0-style request, `ICY 200 OK` response
    #[default]
    V1,
    /// NTRIP 2.0: HTTP/1.1 with `Ntrip-Version` header, optional chunked body
    V2,
}

/// Correction-service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub version: NtripVersion,
    pub connect_timeout_ms: u64,
    /// Stream considered lost after this long without data
    pub read_timeout_ms: u64,
    /// Seconds between GGA uploads while streaming; 0 disables upload
    pub gga_interval_secs: u64,
    /// Sentence uploaded while no valid fix is available
    pub fallback_gga: Option<String>,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 2101,
            mountpoint: String::new(),
            username: None,
            password: None,
            version: NtripVersion::V1,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            gga_interval_secs: 10,
            fallback_gga: None,
        }
    }
}

impl CorrectionConfig {
    pub fn new(host: impl Into<String>, port: u16, mountpoint: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            mountpoint: mountpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn validate(&self) -> Result<(), NtripError> {
        if self.host.trim().is_empty() {
            return Err(NtripError::configuration("host", &self.host));
        }
        if self.port == 0 {
            return Err(NtripError::configuration("port", self.port));
        }
        let mountpoint = self.mountpoint.trim_start_matches('/');
        if mountpoint.is_empty() || mountpoint.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
            return Err(NtripError::configuration("mountpoint", &self.mountpoint));
        }
        if self.connect_timeout_ms == 0 {
            return Err(NtripError::configuration("connect_timeout_ms", self.connect_timeout_ms));
        }
        if self.read_timeout_ms < POLL_INTERVAL.as_millis() as u64 {
            return Err(NtripError::configuration("read_timeout_ms", self.read_timeout_ms));
        }
        if self.password.is_some() && self.username.as_deref().map_or(true, str::is_empty) {
            return Err(NtripError::configuration("username", "<missing>"));
        }
        if let Some(gga) = &self.fallback_gga {
            let line = gga.trim();
            let payload = line.strip_prefix('$').unwrap_or(line);
            let printable = payload.bytes().all(|b| b.is_ascii_graphic() || b == b' ');
            let checksum_ok = !payload.contains('*') || split_sentence(payload.as_bytes()).is_ok();
            if payload.is_empty() || payload.contains('$') || !printable || !checksum_ok {
                return Err(NtripError::configuration("fallback_gga", gga));
            }
        }
        Ok(())
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn mountpoint(&self) -> &str {
        self.mountpoint.trim_start_matches('/')
    }
}

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ClientState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Streaming,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Authenticating => "authenticating",
            ClientState::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Receiver of client events and correction bytes
pub trait CorrectionSink {
    fn state_changed(&mut self, state: ClientState);

    /// Correction bytes in arrival order
    fn corrections(&mut self, bytes: &[u8]);

    /// Latest position to report to the caster, if any
    fn upload_position(&mut self) -> Option<PositionFix>;

    fn connection_failed(&mut self, error: &NtripError);

    fn retry_scheduled(&mut self, attempt: u32, delay: Duration);
}

const BASE64_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Standard padded base64
pub fn base64_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
    for chunk in input.chunks(3) {
        let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let triple = ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32;
        for i in 0..4 {
            if i <= chunk.len() {
                out.push(BASE64_ALPHABET[((triple >> (18 - 6 * i)) & 0x3F) as usize] as char);
            } else {
                out.push('=');
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminating zero-size chunk and trailer seen
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Decode the next slice of the body, returning the payload bytes it carried
    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<u8>, NtripError> {
        let mut out = Vec::with_capacity(input.len());
        let mut i = 0;
        while i < input.len() {
            match self.state {
                ChunkState::Size => {
                    let b = input[i];
                    i += 1;
                    if b == b'\n' {
                        let size = self.parse_size()?;
                        self.line.clear();
                        self.state = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data(size)
                        };
                    } else {
                        self.line.push(b);
                        if self.line.len() > 64 {
                            return Err(NtripError::Chunked {
                                details: "chunk size line too long".to_string(),
                            });
                        }
                    }
                }
                ChunkState::Data(remaining) => {
                    let take = remaining.min(input.len() - i);
                    out.extend_from_slice(&input[i..i + take]);
                    i += take;
                    self.state = if take == remaining {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining - take)
                    };
                }
                ChunkState::DataEnd => {
                    let b = input[i];
                    i += 1;
                    match b {
                        b'\r' => {}
                        b'\n' => self.state = ChunkState::Size,
                        other => {
                            return Err(NtripError::Chunked {
                                details: format!("expected CRLF after chunk, found 0x{:02X}", other),
                            })
                        }
                    }
                }
                ChunkState::Trailer => {
                    let b = input[i];
                    i += 1;
                    if b == b'\n' {
                        let blank = self.line.iter().all(|&c| c == b'\r');
                        self.line.clear();
                        if blank {
                            self.state = ChunkState::Done;
                        }
                    } else {
                        self.line.push(b);
                    }
                }
                ChunkState::Done => break,
            }
        }
        Ok(out)
    }

    fn parse_size(&self) -> Result<usize, NtripError> {
        let text = String::from_utf8_lossy(&self.line);
        let digits = text.trim_end_matches('\r').split(';').next().unwrap_or("").trim();
        usize::from_str_radix(digits, 16).map_err(|_| NtripError::Chunked {
            details: format!("invalid chunk size '{}'", digits),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    Icy,
    Http,
}

#[derive(Debug)]
struct ResponseHead {
    kind: ResponseKind,
    status: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn classify_status(line: &str, mountpoint: &str) -> Result<ResponseKind, NtripError> {
    if line.starts_with("ICY 200") {
        return Ok(ResponseKind::Icy);
    }
    if line.starts_with("SOURCETABLE 200") {
        return Err(NtripError::SourceTable {
            mountpoint: mountpoint.to_string(),
        });
    }
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(proto), Some("200")) if proto.starts_with("HTTP/1.") => Ok(ResponseKind::Http),
        (Some(proto), Some(_)) if proto.starts_with("HTTP/") || proto == "ICY" => Err(NtripError::Rejected {
            status: line.to_string(),
        }),
        _ => Err(NtripError::malformed(format!("unrecognised status line '{}'", line))),
    }
}

fn parse_headers(block: &[u8]) -> Result<Vec<(String, String)>, NtripError> {
    let text = std::str::from_utf8(block).map_err(|_| NtripError::malformed("header block is not UTF-8"))?;
    text.split("\r\n")
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| NtripError::malformed(format!("header line without ':' '{}'", line)))
        })
        .collect()
}

/// Try to parse a complete response head from the bytes received so far.
///
/// `eof_or_idle` signals that no more header bytes are coming; an ICY status
/// line alone is then accepted as a headerless NTRIP 1 response.
fn parse_response(buf: &[u8], mountpoint: &str, eof_or_idle: bool) -> Result<Option<ResponseHead>, NtripError> {
    let line_end = match find(buf, b"\r\n") {
        Some(pos) => pos,
        None if buf.len() > MAX_HEADER_LEN || eof_or_idle => {
            return Err(NtripError::malformed("missing status line"));
        }
        None => return Ok(None),
    };
    let status = String::from_utf8_lossy(&buf[..line_end]).trim().to_string();
    let kind = classify_status(&status, mountpoint)?;
    let rest = &buf[line_end + 2..];

    if let Some(body) = rest.strip_prefix(b"\r\n") {
        return Ok(Some(ResponseHead {
            kind,
            status,
            headers: Vec::new(),
            body: body.to_vec(),
        }));
    }
    if let Some(end) = find(rest, b"\r\n\r\n") {
        return Ok(Some(ResponseHead {
            kind,
            status,
            headers: parse_headers(&rest[..end])?,
            body: rest[end + 4..].to_vec(),
        }));
    }

    let binary = rest
        .iter()
        .any(|&b| !(b.is_ascii_graphic() || b == b' ' || b == b'\t' || b == b'\r' || b == b'\n'));
    if kind == ResponseKind::Icy && (binary || eof_or_idle) {
        return Ok(Some(ResponseHead {
            kind,
            status,
            headers: Vec::new(),
            body: rest.to_vec(),
        }));
    }
    if buf.len() > MAX_HEADER_LEN || eof_or_idle {
        return Err(NtripError::malformed("incomplete header block"));
    }
    Ok(None)
}

/// An established correction stream
pub struct NtripSession {
    stream: TcpStream,
    pending: Vec<u8>,
    chunked: Option<ChunkedDecoder>,
    /// Terminating chunk seen; the next read reports the close
    finished: bool,
    last_data: Instant,
    stall_timeout: Duration,
}

impl NtripSession {
    /// Read the next correction bytes; an empty vector means nothing arrived
    /// within the poll interval.
    pub fn read_corrections(&mut self) -> Result<Vec<u8>, NtripError> {
        if self.finished {
            return Err(NtripError::ConnectionClosed);
        }
        let raw = if !self.pending.is_empty() {
            std::mem::take(&mut self.pending)
        } else {
            let mut buf = [0u8; READ_CHUNK];
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(NtripError::ConnectionClosed),
                Ok(n) => buf[..n].to_vec(),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                    if self.last_data.elapsed() >= self.stall_timeout {
                        return Err(NtripError::Timeout {
                            operation: "correction stream".to_string(),
                            timeout_ms: self.stall_timeout.as_millis() as u64,
                        });
                    }
                    return Ok(Vec::new());
                }
                Err(e) => return Err(NtripError::io("read", &e)),
            }
        };
        self.last_data = Instant::now();

        match &mut self.chunked {
            Some(decoder) => {
                let data = decoder.decode(&raw)?;
                if decoder.is_done() {
                    self.finished = true;
                    if data.is_empty() {
                        return Err(NtripError::ConnectionClosed);
                    }
                }
                Ok(data)
            }
            None => Ok(raw),
        }
    }

    /// Upload one NMEA sentence to the caster
    pub fn send_sentence(&mut self, sentence: &str) -> Result<(), NtripError> {
        let mut line = sentence.trim_end().to_string();
        line.push_str("\r\n");
        self.stream
            .write_all(line.as_bytes())
            .map_err(|e| NtripError::io("GGA upload", &e))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

/// NTRIP client with reconnect policy
#[derive(Debug, Clone)]
pub struct NtripClient {
    config: CorrectionConfig,
    backoff: BackoffPolicy,
}

impl NtripClient {
    pub fn new(config: CorrectionConfig, backoff: BackoffPolicy) -> Result<Self, NtripError> {
        config.validate()?;
        backoff.validate()?;
        Ok(Self { config, backoff })
    }

    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    /// The request header block sent after connecting
    pub fn build_request(&self) -> String {
        let mut request = String::new();
        match self.config.version {
            NtripVersion::V1 => {
                request.push_str(&format!("GET /{} HTTP/1.0\r\n", self.config.mountpoint()));
                request.push_str(&format!("User-Agent: {}\r\n", USER_AGENT));
            }
            NtripVersion::V2 => {
                request.push_str(&format!("GET /{} HTTP/1.1\r\n", self.config.mountpoint()));
                request.push_str(&format!("Host: {}\r\n", self.config.address()));
                request.push_str("Ntrip-Version: Ntrip/2.0\r\n");
                request.push_str(&format!("User-Agent: {}\r\n", USER_AGENT));
            }
        }
        if let Some(username) = self.config.username.as_deref().filter(|u| !u.is_empty()) {
            let password = self.config.password.as_deref().unwrap_or("");
            let token = base64_encode(format!("{}:{}", username, password).as_bytes());
            request.push_str(&format!("Authorization: Basic {}\r\n", token));
        }
        request.push_str("Accept: */*\r\n");
        request.push_str("Connection: close\r\n");
        request.push_str("\r\n");
        request
    }

    fn open_stream(&self) -> Result<TcpStream, NtripError> {
        let address = self.config.address();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let candidates: Vec<SocketAddr> = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| NtripError::Resolve {
                address: address.clone(),
                details: e.to_string(),
            })?
            .collect();

        let mut last_error = String::from("no addresses resolved");
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(POLL_INTERVAL))
                        .and_then(|_| stream.set_write_timeout(Some(timeout)))
                        .and_then(|_| stream.set_nodelay(true))
                        .map_err(|e| NtripError::io("socket setup", &e))?;
                    return Ok(stream);
                }
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(NtripError::Connect {
            address,
            details: last_error,
        })
    }

    /// Read the status line and header block.
    ///
    /// The sink enters `Authenticating` as soon as a complete status line is in.
    fn read_response(&self, stream: &mut TcpStream, sink: &mut dyn CorrectionSink) -> Result<ResponseHead, NtripError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.connect_timeout_ms);
        let mountpoint = self.config.mountpoint();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let mut status_seen = false;

        loop {
            if !status_seen && find(&buf, b"\r\n").is_some() {
                status_seen = true;
                sink.state_changed(ClientState::Authenticating);
            }
            if let Some(head) = parse_response(&buf, mountpoint, false)? {
                return Ok(head);
            }
            match stream.read(&mut chunk) {
                Ok(0) => {
                    if buf.is_empty() {
                        return Err(NtripError::ConnectionClosed);
                    }
                    return parse_response(&buf, mountpoint, true)?
                        .ok_or_else(|| NtripError::malformed("connection closed inside header"));
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                    // A bare ICY status line followed by silence is a headerless response
                    if find(&buf, b"\r\n").is_some() && buf.starts_with(b"ICY 200") {
                        if let Some(head) = parse_response(&buf, mountpoint, true)? {
                            return Ok(head);
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(NtripError::Timeout {
                            operation: "caster response".to_string(),
                            timeout_ms: self.config.connect_timeout_ms,
                        });
                    }
                }
                Err(e) => return Err(NtripError::io("read response", &e)),
            }
        }
    }

    /// Connect, authenticate and return a streaming session
    pub fn connect(&self, sink: &mut dyn CorrectionSink) -> Result<NtripSession, NtripError> {
        sink.state_changed(ClientState::Connecting);
        let mut stream = self.open_stream()?;

        stream
            .write_all(self.build_request().as_bytes())
            .map_err(|e| NtripError::io("send request", &e))?;
        let head = self.read_response(&mut stream, sink)?;

        tracing::info!(
            caster = %self.config.address(),
            mountpoint = %self.config.mountpoint(),
            status = %head.status,
            chunked = head.is_chunked(),
            "Correction stream established"
        );

        let chunked = (head.kind == ResponseKind::Http && head.is_chunked()).then(ChunkedDecoder::new);
        Ok(NtripSession {
            stream,
            pending: head.body,
            chunked,
            finished: false,
            last_data: Instant::now(),
            stall_timeout: Duration::from_millis(self.config.read_timeout_ms),
        })
    }

    fn gga_for_upload(&self, sink: &mut dyn CorrectionSink) -> Option<String> {
        match sink.upload_position().filter(PositionFix::is_valid) {
            Some(fix) => Some(encode_gga(&fix)),
            None => self.config.fallback_gga.as_deref().map(|gga| {
                let payload = gga.trim();
                let payload = payload.strip_prefix('$').unwrap_or(payload);
                if payload.contains('*') {
                    format!("${}\r\n", payload)
                } else {
                    encode_sentence(payload)
                }
            }),
        }
    }

    fn stream(&self, session: &mut NtripSession, sink: &mut dyn CorrectionSink, stop: &AtomicBool) -> Result<(), NtripError> {
        let gga_interval = Duration::from_secs(self.config.gga_interval_secs);
        let mut last_upload: Option<Instant> = None;

        while !stop.load(Ordering::Relaxed) {
            if !gga_interval.is_zero() && last_upload.map_or(true, |t| t.elapsed() >= gga_interval) {
                if let Some(gga) = self.gga_for_upload(sink) {
                    session.send_sentence(&gga)?;
                    tracing::debug!(sentence = gga.trim_end(), "Uploaded position to caster");
                }
                last_upload = Some(Instant::now());
            }

            let data = session.read_corrections()?;
            if !data.is_empty() {
                sink.corrections(&data);
            }
        }
        Ok(())
    }

    /// Run sessions until `stop` is raised, reconnecting with backoff.
    ///
    /// Returns early only for errors that retrying cannot fix.
    pub fn run(&self, sink: &mut dyn CorrectionSink, stop: &AtomicBool) -> Result<(), NtripError> {
        let mut backoff = Backoff::new(self.backoff.clone());

        while !stop.load(Ordering::Relaxed) {
            let outcome = match self.connect(sink) {
                Ok(mut session) => {
                    sink.state_changed(ClientState::Streaming);
                    backoff.reset();
                    self.stream(&mut session, sink, stop)
                }
                Err(e) => Err(e),
            };
            sink.state_changed(ClientState::Disconnected);

            match outcome {
                Ok(()) => break,
                Err(e) if !e.is_recoverable() => {
                    tracing::error!(error = %e, "Correction client stopped");
                    sink.connection_failed(&e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, caster = %self.config.address(), "Correction stream lost");
                    sink.connection_failed(&e);
                }
            }

            let delay = backoff.next_delay();
            sink.retry_scheduled(backoff.attempts(), delay);
            tracing::info!(attempt = backoff.attempts(), delay_ms = delay.as_millis() as u64, "Reconnecting to caster");
            if !sleep_interruptible(delay, stop) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FixQuality;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Default)]
    struct RecordingSink {
        states: Vec<ClientState>,
        data: Vec<u8>,
        errors: Vec<NtripError>,
        retries: Vec<(u32, Duration)>,
        position: Option<PositionFix>,
    }

    impl CorrectionSink for RecordingSink {
        fn state_changed(&mut self, state: ClientState) {
            self.states.push(state);
        }
        fn corrections(&mut self, bytes: &[u8]) {
            self.data.extend_from_slice(bytes);
        }
        fn upload_position(&mut self) -> Option<PositionFix> {
            self.position
        }
        fn connection_failed(&mut self, error: &NtripError) {
            self.errors.push(error.clone());
        }
        fn retry_scheduled(&mut self, attempt: u32, delay: Duration) {
            self.retries.push((attempt, delay));
        }
    }

    /// Single-connection caster: reads the request, replies, then runs `after`
    fn caster<F>(response: &'static [u8], after: F) -> (u16, thread::JoinHandle<String>)
    where
        F: FnOnce(&mut TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 512];
            while find(&request, b"\r\n\r\n").is_none() {
                let n = socket.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).unwrap();
            after(&mut socket);
            String::from_utf8_lossy(&request).into_owned()
        });
        (port, handle)
    }

    fn client(port: u16, version: NtripVersion) -> NtripClient {
        let mut config = CorrectionConfig::new("127.0.0.1", port, "RTCM3");
        config.version = version;
        config.connect_timeout_ms = 2_000;
        config.gga_interval_secs = 0;
        NtripClient::new(config, BackoffPolicy::default()).unwrap()
    }

    #[test]
    fn test_base64_encoding() {
        assert_eq!(base64_encode(b""), "");
        assert_eq!(base64_encode(b"f"), "Zg==");
        assert_eq!(base64_encode(b"fo"), "Zm8=");
        assert_eq!(base64_encode(b"foo"), "Zm9v");
        assert_eq!(base64_encode(b"user:pass"), "dXNlcjpwYXNz");
    }

    #[test]
    fn test_request_headers_per_version() {
        let mut config = CorrectionConfig::new("caster.example.com", 2101, "/MOUNT1").with_credentials("user", "pass");
        config.version = NtripVersion::V1;
        let v1 = NtripClient::new(config.clone(), BackoffPolicy::default()).unwrap().build_request();
        assert!(v1.starts_with("GET /MOUNT1 HTTP/1.0\r\n"));
        assert!(v1.contains("Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(!v1.contains("Ntrip-Version"));
        assert!(v1.ends_with("\r\n\r\n"));

        config.version = NtripVersion::V2;
        config.username = None;
        config.password = None;
        let v2 = NtripClient::new(config, BackoffPolicy::default()).unwrap().build_request();
        assert!(v2.starts_with("GET /MOUNT1 HTTP/1.1\r\n"));
        assert!(v2.contains("Host: caster.example.com:2101\r\n"));
        assert!(v2.contains("Ntrip-Version: Ntrip/2.0\r\n"));
        assert!(!v2.contains("Authorization"));
    }

    #[test]
    fn test_config_validation() {
        assert!(CorrectionConfig::new("", 2101, "M").validate().is_err());
        assert!(CorrectionConfig::new("host", 0, "M").validate().is_err());
        assert!(CorrectionConfig::new("host", 2101, "").validate().is_err());
        assert!(CorrectionConfig::new("host", 2101, "A B").validate().is_err());
        let mut config = CorrectionConfig::new("host", 2101, "M");
        config.password = Some("secret".to_string());
        assert!(config.validate().is_err());
        assert!(!NtripError::configuration("port", 0).is_recoverable());
        assert!(NtripError::ConnectionClosed.is_recoverable());
    }

    #[test]
    fn test_status_line_classification() {
        assert_eq!(classify_status("ICY 200 OK", "M").unwrap(), ResponseKind::Icy);
        assert_eq!(classify_status("HTTP/1.1 200 OK", "M").unwrap(), ResponseKind::Http);
        assert_eq!(classify_status("HTTP/1.0 200 OK", "M").unwrap(), ResponseKind::Http);
        assert!(matches!(
            classify_status("SOURCETABLE 200 OK", "M"),
            Err(NtripError::SourceTable { .. })
        ));
        assert!(matches!(
            classify_status("HTTP/1.1 401 Unauthorized", "M"),
            Err(NtripError::Rejected { .. })
        ));
        assert!(matches!(classify_status("garbage", "M"), Err(NtripError::MalformedResponse { .. })));
    }

    #[test]
    fn test_response_parsing_variants() {
        let with_headers = parse_response(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nABC", "M", false)
            .unwrap()
            .unwrap();
        assert!(with_headers.is_chunked());
        assert_eq!(with_headers.body, b"ABC");

        let icy_binary = parse_response(b"ICY 200 OK\r\n\xD3\x00\x00", "M", false).unwrap().unwrap();
        assert!(icy_binary.headers.is_empty());
        assert_eq!(icy_binary.body, vec![0xD3, 0x00, 0x00]);

        assert!(parse_response(b"HTTP/1.1 200 OK\r\nServer: x", "M", false).unwrap().is_none());
        assert!(parse_response(b"HTTP/1.1 200 OK\r\nServer: x", "M", true).is_err());
        assert!(parse_response(b"HTTP/1.1 200 OK\r\nbroken header\r\n\r\n", "M", false).is_err());
    }

    #[test]
    fn test_chunked_decoding_across_splits() {
        let body = b"5\r\nhello\r\n7;ext=1\r\n, world\r\n0\r\n\r\n";
        for split in 1..body.len() {
            let mut decoder = ChunkedDecoder::new();
            let mut out = decoder.decode(&body[..split]).unwrap();
            out.extend(decoder.decode(&body[split..]).unwrap());
            assert_eq!(out, b"hello, world");
            assert!(decoder.is_done());
        }
        assert!(ChunkedDecoder::new().decode(b"zz\r\n").is_err());
        assert!(ChunkedDecoder::new().decode(b"2\r\nabX").is_err());
    }

    #[test]
    fn test_icy_stream_relays_bytes_and_sends_credentials() {
        let frame: &'static [u8] = b"ICY 200 OK\r\n\r\n\xD3\x00\x00\x47\xEA\x4B";
        let (port, caster) = caster(frame, |_| thread::sleep(Duration::from_millis(100)));
        let mut config = CorrectionConfig::new("127.0.0.1", port, "RTCM3").with_credentials("user", "pass");
        config.gga_interval_secs = 0;
        let client = NtripClient::new(config, BackoffPolicy::default()).unwrap();

        let mut sink = RecordingSink::default();
        let mut session = client.connect(&mut sink).unwrap();
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.len() < 6 && Instant::now() < deadline {
            received.extend(session.read_corrections().unwrap());
        }

        assert_eq!(received, vec![0xD3, 0x00, 0x00, 0x47, 0xEA, 0x4B]);
        assert_eq!(sink.states, vec![ClientState::Connecting, ClientState::Authenticating]);
        let request = caster.join().unwrap();
        assert!(request.contains("Authorization: Basic dXNlcjpwYXNz"));
    }

    #[test]
    fn test_chunked_v2_stream_dechunked() {
        let response: &'static [u8] =
            b"HTTP/1.1 200 OK\r\nNtrip-Version: Ntrip/2.0\r\nTransfer-Encoding: chunked\r\n\r\n3\r\n\xD3\x00\x00\r\n3\r\n\x47\xEA\x4B\r\n";
        let (port, caster) = caster(response, |_| thread::sleep(Duration::from_millis(100)));
        let client = client(port, NtripVersion::V2);

        let mut sink = RecordingSink::default();
        let mut session = client.connect(&mut sink).unwrap();
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.len() < 6 && Instant::now() < deadline {
            received.extend(session.read_corrections().unwrap());
        }
        assert_eq!(received, vec![0xD3, 0x00, 0x00, 0x47, 0xEA, 0x4B]);
        assert!(caster.join().unwrap().contains("Ntrip-Version: Ntrip/2.0"));
    }

    #[test]
    fn test_sourcetable_rejected() {
        let (port, caster) = caster(b"SOURCETABLE 200 OK\r\nContent-Type: text/plain\r\n\r\nSTR;...\r\nENDSOURCETABLE\r\n", |_| {});
        let mut sink = RecordingSink::default();
        let result = client(port, NtripVersion::V1).connect(&mut sink);
        assert!(matches!(result, Err(NtripError::SourceTable { .. })));
        assert_eq!(sink.states, vec![ClientState::Connecting, ClientState::Authenticating]);
        caster.join().unwrap();
    }

    #[test]
    fn test_close_before_status_line_never_authenticates() {
        let (port, caster) = caster(b"", |_| {});
        let mut sink = RecordingSink::default();
        let result = client(port, NtripVersion::V1).connect(&mut sink);
        assert!(matches!(result, Err(NtripError::ConnectionClosed)));
        assert_eq!(sink.states, vec![ClientState::Connecting]);
        caster.join().unwrap();
    }

    #[test]
    fn test_final_chunk_data_delivered_before_close() {
        let response: &'static [u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\n\xD3\x00\x00\r\n3\r\n\x47\xEA\x4B\r\n0\r\n\r\n";
        let (port, caster) = caster(response, |_| thread::sleep(Duration::from_millis(100)));
        let client = client(port, NtripVersion::V2);

        let mut sink = RecordingSink::default();
        let mut session = client.connect(&mut sink).unwrap();
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        let closed = loop {
            match session.read_corrections() {
                Ok(data) => received.extend(data),
                Err(e) => break e,
            }
            assert!(Instant::now() < deadline, "stream never reported its end");
        };
        assert_eq!(closed, NtripError::ConnectionClosed);
        assert_eq!(received, vec![0xD3, 0x00, 0x00, 0x47, 0xEA, 0x4B]);
        assert!(matches!(session.read_corrections(), Err(NtripError::ConnectionClosed)));
        caster.join().unwrap();
    }

    #[test]
    fn test_gga_uploaded_while_streaming() {
        let uploaded = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&uploaded);
        let (port, caster) = caster(b"ICY 200 OK\r\n\r\n", move |socket| {
            let mut buf = [0u8; 256];
            if let Ok(n) = socket.read(&mut buf) {
                captured.lock().unwrap().extend_from_slice(&buf[..n]);
            }
        });

        let mut config = CorrectionConfig::new("127.0.0.1", port, "RTCM3");
        config.gga_interval_secs = 5;
        let client = NtripClient::new(config, BackoffPolicy::default()).unwrap();
        let mut sink = RecordingSink {
            position: Some(PositionFix {
                latitude: 48.1173,
                longitude: 11.5167,
                fix_quality: FixQuality::Standard,
                satellites_used: 8,
                ..PositionFix::invalid()
            }),
            ..RecordingSink::default()
        };

        let stop = AtomicBool::new(false);
        let mut session = client.connect(&mut sink).unwrap();
        let result = client.stream(&mut session, &mut sink, &stop);
        assert!(result.is_err());
        caster.join().unwrap();

        let text = String::from_utf8(uploaded.lock().unwrap().clone()).unwrap();
        assert!(text.starts_with("$GPGGA,"));
        assert!(text.contains(",4807.0380000,N,01131.0020000,E,1,08,"));
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn test_fallback_gga_when_no_valid_fix() {
        let mut config = CorrectionConfig::new("127.0.0.1", 2101, "RTCM3");
        config.fallback_gga = Some("GPGGA,000000,4807.038,N,01131.000,E,1,08,1.0,0.0,M,0.0,M,,".to_string());
        let client = NtripClient::new(config, BackoffPolicy::default()).unwrap();
        let mut sink = RecordingSink::default();

        let gga = client.gga_for_upload(&mut sink).unwrap();
        assert!(gga.starts_with("$GPGGA,000000,"));
        assert!(gga.ends_with("\r\n"));
        assert_eq!(gga.as_bytes()[gga.len() - 5], b'*');
        assert!(split_sentence(gga.trim_end().as_bytes()).is_ok());
    }

    #[test]
    fn test_fallback_gga_forms() {
        let payload = "GPGGA,000000,4807.038,N,01131.000,E,1,08,1.0,0.0,M,0.0,M,,";
        let complete = encode_sentence(payload);
        let mut config = CorrectionConfig::new("127.0.0.1", 2101, "RTCM3");

        for accepted in [payload.to_string(), format!("${}", payload), complete.clone()] {
            config.fallback_gga = Some(accepted.clone());
            assert!(config.validate().is_ok(), "rejected fallback {:?}", accepted);
            let client = NtripClient::new(config.clone(), BackoffPolicy::default()).unwrap();
            assert_eq!(client.gga_for_upload(&mut RecordingSink::default()).unwrap(), complete);
        }

        let wrong_checksum = format!("${}*00", payload);
        for rejected in ["", "  ", "$", "GPGGA,1\r\n$GPGGA,2", wrong_checksum.as_str()] {
            config.fallback_gga = Some(rejected.to_string());
            assert!(config.validate().is_err(), "accepted fallback {:?}", rejected);
        }
    }

    #[test]
    fn test_immediate_close_retries_once_after_initial_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        listener.set_nonblocking(true).unwrap();
        let server_stop = Arc::new(AtomicBool::new(false));
        let server_flag = Arc::clone(&server_stop);
        let server = thread::spawn(move || {
            while !server_flag.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut socket, _)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        socket.set_nonblocking(false).unwrap();
                        socket.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
                        let mut buf = [0u8; 512];
                        let _ = socket.read(&mut buf);
                        let _ = socket.write_all(b"ICY 200 OK\r\n\r\n");
                    }
                    Err(_) => thread::sleep(Duration::from_millis(5)),
                }
            }
        });

        let mut config = CorrectionConfig::new("127.0.0.1", port, "RTCM3");
        config.gga_interval_secs = 0;
        let policy = BackoffPolicy {
            initial_ms: 400,
            max_ms: 10_000,
            multiplier: 2.0,
        };
        let client = NtripClient::new(config, policy).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let run_stop = Arc::clone(&stop);
        let runner = thread::spawn(move || {
            let mut sink = RecordingSink::default();
            let result = client.run(&mut sink, &run_stop);
            (result, sink)
        });

        thread::sleep(Duration::from_millis(600));
        stop.store(true, Ordering::Relaxed);
        let (result, sink) = runner.join().unwrap();
        server_stop.store(true, Ordering::Relaxed);
        server.join().unwrap();

        assert!(result.is_ok());
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(sink.retries[0], (1, Duration::from_millis(400)));
        assert!(sink.states.contains(&ClientState::Streaming));
        assert_eq!(sink.states.last(), Some(&ClientState::Disconnected));
        assert!(!sink.errors.is_empty());
    }
}
