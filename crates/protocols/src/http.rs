//! HTTP replay over a raw socket with keep-alive.
//!
//! Captured requests are complete HTTP/1.x request bytes, so they go onto
//! the wire verbatim; a high-level client cannot re-issue them without
//! rewriting headers. Responses are parsed just enough to tally the status,
//! drain the body, and decide whether the connection survives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use apiary_engine::adapter::{AdapterFactory, ProtocolAdapter};
use apiary_engine::telemetry::Telemetry;

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub host: String,
    pub port: u16,
    /// Timeout for connect and for each request/response exchange.
    pub timeout: Duration,
    /// Replay speed. Below 0.8 keep-alive is pointless: the server gets
    /// bored between requests and drops the connection anyway.
    pub speedup: f64,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 80,
            timeout: Duration::from_secs(10),
            speedup: 1.0,
        }
    }
}

pub struct HttpFactory {
    options: Arc<HttpOptions>,
}

impl HttpFactory {
    pub fn new(options: HttpOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }
}

impl AdapterFactory for HttpFactory {
    fn name(&self) -> &'static str {
        "http"
    }

    fn build(&self, telemetry: Telemetry) -> Box<dyn ProtocolAdapter> {
        Box::new(HttpAdapter {
            options: self.options.clone(),
            telemetry,
            stream: None,
        })
    }
}

struct HttpAdapter {
    options: Arc<HttpOptions>,
    telemetry: Telemetry,
    stream: Option<BufReader<TcpStream>>,
}

impl HttpAdapter {
    async fn connect(&mut self) {
        let addr = (self.options.host.as_str(), self.options.port);
        match tokio::time::timeout(self.options.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => self.stream = Some(BufReader::new(stream)),
            Ok(Err(err)) => {
                self.telemetry.error(format!("error while connecting: {err}"));
                self.stream = None;
            }
            Err(_) => {
                self.telemetry.error("timed out while connecting");
                self.stream = None;
            }
        }
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }
}

#[async_trait]
impl ProtocolAdapter for HttpAdapter {
    async fn start_job(&mut self, _job_id: &str) {
        self.connect().await;
    }

    async fn send_request(&mut self, request: &[u8]) -> bool {
        // Sanity check: a request advertising more body than it carries
        // would just stall the server into a 504. Report and move on.
        if let Some((_, body)) = split_head(request) {
            if let Some(declared) = declared_content_length(request) {
                if body.len() < declared {
                    self.telemetry.error("request body of incorrect size");
                    return true;
                }
            }
        }

        if self.stream.is_none() {
            self.connect().await;
        }
        let Some(stream) = self.stream.as_mut() else {
            // Errors never fail the session for HTTP; later requests retry
            // the connection.
            return true;
        };

        let outcome = tokio::time::timeout(self.options.timeout, exchange(stream, request)).await;
        match outcome {
            Ok(Ok(response)) => {
                self.telemetry.tally(response.status.to_string());
                if response.close || self.options.speedup < 0.8 {
                    self.disconnect();
                }
            }
            Ok(Err(err)) => {
                self.telemetry
                    .error(format!("error while sending request and reading response: {err}"));
                self.disconnect();
            }
            Err(_) => {
                self.telemetry
                    .error("timed out while sending request and reading response");
                self.disconnect();
            }
        }
        true
    }

    async fn finish_job(&mut self, _job_id: &str) {
        self.disconnect();
    }
}

struct ResponseSummary {
    status: u16,
    close: bool,
}

async fn exchange(
    stream: &mut BufReader<TcpStream>,
    request: &[u8],
) -> std::io::Result<ResponseSummary> {
    stream.get_mut().write_all(request).await?;
    read_response(stream).await
}

async fn read_response(stream: &mut BufReader<TcpStream>) -> std::io::Result<ResponseSummary> {
    use std::io::{Error, ErrorKind};

    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Err(Error::new(
            ErrorKind::UnexpectedEof,
            "connection closed before the status line",
        ));
    }
    let status_line = line.trim_end().to_string();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or("").to_string();
    let status: u16 = parts
        .next()
        .and_then(|word| word.parse().ok())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("bad status line: {status_line:?}"),
            )
        })?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    let mut connection: Option<String> = None;
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed inside the response headers",
            ));
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.parse().ok(),
                "transfer-encoding" => {
                    chunked = value.to_ascii_lowercase().contains("chunked");
                }
                "connection" => connection = Some(value.to_ascii_lowercase()),
                _ => {}
            }
        }
    }

    let bodyless = status < 200 || status == 204 || status == 304;
    if bodyless {
        // Nothing to drain.
    } else if chunked {
        drain_chunked_body(stream).await?;
    } else if let Some(length) = content_length {
        discard_exact(stream, length).await?;
    } else {
        // No framing: the body runs until the server closes the connection.
        let mut buf = [0u8; 8192];
        while stream.read(&mut buf).await? > 0 {}
    }

    let close = match connection.as_deref() {
        Some(value) if value.contains("close") => true,
        Some(value) if value.contains("keep-alive") => false,
        _ => version == "HTTP/1.0" || (!bodyless && !chunked && content_length.is_none()),
    };
    Ok(ResponseSummary { status, close })
}

async fn discard_exact(
    stream: &mut BufReader<TcpStream>,
    mut remaining: usize,
) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let n = stream.read(&mut buf[..remaining.min(8192)]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside the response body",
            ));
        }
        remaining -= n;
    }
    Ok(())
}

async fn drain_chunked_body(stream: &mut BufReader<TcpStream>) -> std::io::Result<()> {
    use std::io::{Error, ErrorKind};

    let mut line = String::new();
    loop {
        line.clear();
        if stream.read_line(&mut line).await? == 0 {
            return Err(Error::new(ErrorKind::UnexpectedEof, "truncated chunk size"));
        }
        let size_word = line.trim_end().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_word, 16)
            .map_err(|_| Error::new(ErrorKind::InvalidData, format!("bad chunk size: {size_word:?}")))?;
        if size == 0 {
            // Trailers, up to the final blank line.
            loop {
                line.clear();
                if stream.read_line(&mut line).await? == 0 {
                    return Err(Error::new(ErrorKind::UnexpectedEof, "truncated trailers"));
                }
                if line.trim_end().is_empty() {
                    return Ok(());
                }
            }
        }
        discard_exact(stream, size).await?;
        line.clear();
        stream.read_line(&mut line).await?;
    }
}

fn split_head(request: &[u8]) -> Option<(&[u8], &[u8])> {
    let at = request.windows(4).position(|window| window == b"\r\n\r\n")?;
    Some((&request[..at], &request[at + 4..]))
}

fn declared_content_length(request: &[u8]) -> Option<usize> {
    let (head, _) = split_head(request)?;
    let head = std::str::from_utf8(head).ok()?;
    for line in head.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}
