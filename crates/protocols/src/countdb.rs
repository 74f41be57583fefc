//! The CountDB line protocol: `json <body>\0` out, one bounded read back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use apiary_engine::adapter::{AdapterFactory, ProtocolAdapter};
use apiary_engine::telemetry::Telemetry;

#[derive(Debug, Clone)]
pub struct CountDbOptions {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    /// Maximum number of response bytes to wait for per request.
    pub recv_size: usize,
}

impl Default for CountDbOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3939,
            timeout: Duration::from_secs(10),
            recv_size: 1024,
        }
    }
}

pub struct CountDbFactory {
    options: Arc<CountDbOptions>,
}

impl CountDbFactory {
    pub fn new(options: CountDbOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }
}

impl AdapterFactory for CountDbFactory {
    fn name(&self) -> &'static str {
        "countdb"
    }

    fn build(&self, telemetry: Telemetry) -> Box<dyn ProtocolAdapter> {
        Box::new(CountDbAdapter {
            options: self.options.clone(),
            telemetry,
            stream: None,
        })
    }
}

struct CountDbAdapter {
    options: Arc<CountDbOptions>,
    telemetry: Telemetry,
    stream: Option<TcpStream>,
}

#[async_trait]
impl ProtocolAdapter for CountDbAdapter {
    async fn start_job(&mut self, _job_id: &str) {
        let addr = (self.options.host.as_str(), self.options.port);
        match tokio::time::timeout(self.options.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => self.stream = Some(stream),
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

    async fn send_request(&mut self, request: &[u8]) -> bool {
        let recv_size = self.options.recv_size;
        let timeout = self.options.timeout;
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };

        let mut payload = Vec::with_capacity(request.len() + 6);
        payload.extend_from_slice(b"json ");
        payload.extend_from_slice(request);
        payload.push(0);

        let exchange = async {
            stream.write_all(&payload).await?;
            let mut buf = vec![0u8; recv_size];
            stream.read(&mut buf).await
        };
        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                self.telemetry
                    .error(format!("error while sending request and reading response: {err}"));
                false
            }
            Err(_) => {
                self.telemetry
                    .error("timed out while sending request and reading response");
                false
            }
        }
    }

    async fn finish_job(&mut self, _job_id: &str) {
        self.stream = None;
    }
}
