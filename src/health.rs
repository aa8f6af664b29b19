//! Health probing — gates forwarding until a started service is reachable
//!
//! A single probe is one attempt with no retries; the caller loops until
//! the service's start timeout elapses. TCP attempts are paced by their own
//! connect timeout, HTTP and command attempts add a small delay.

use crate::command::{CommandExecutor, ExecOptions};
use crate::error::{GatewayError, GatewayErrorCode};
use crate::service::{HealthCheck, Service};
use http::Uri;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Connect timeout for a single TCP probe; also paces the probe loop
const TCP_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Delay between HTTP and command probe attempts
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Probes service readiness
pub struct HealthProber {
    executor: CommandExecutor,
    http: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl HealthProber {
    pub fn new(tls: rustls::ClientConfig) -> Self {
        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(true);
        http_connector.enforce_http(false);

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let http = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(2)
            .build(connector);

        Self {
            executor: CommandExecutor::new(),
            http,
        }
    }

    /// Poll the configured check until it succeeds or `deadline` passes
    pub async fn wait_healthy(
        &self,
        service: &Service,
        deadline: Instant,
    ) -> Result<(), GatewayError> {
        loop {
            let attempt_started = Instant::now();
            if self.probe(service).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::new(
                    GatewayErrorCode::HealthTimeout,
                    format!("startup timeout for service '{}'", service.name),
                ));
            }
            match service.health {
                // a refused loopback connect returns instantly; keep the
                // attempt cadence at the connect-timeout interval
                HealthCheck::Tcp => {
                    if let Some(remaining) = TCP_PROBE_TIMEOUT.checked_sub(attempt_started.elapsed())
                    {
                        tokio::time::sleep(remaining).await;
                    }
                }
                _ => tokio::time::sleep(PROBE_RETRY_DELAY).await,
            }
        }
    }

    /// Run a single probe attempt
    pub async fn probe(&self, service: &Service) -> bool {
        match &service.health {
            HealthCheck::Tcp => self.probe_tcp(service).await,
            HealthCheck::Http {
                url,
                expected_status,
                timeout,
            } => {
                let target = url.as_ref().unwrap_or(&service.upstream);
                self.probe_http(target, *expected_status, *timeout).await
            }
            HealthCheck::Command { command, timeout } => {
                self.probe_command(service, command, *timeout).await
            }
            HealthCheck::None => true,
        }
    }

    async fn probe_tcp(&self, service: &Service) -> bool {
        let Some(host) = service.upstream.host() else {
            return false;
        };
        let port = upstream_port(&service.upstream);
        let addr = format!("{}:{}", host, port);

        match tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => {
                debug!(service = %service.name, %addr, "tcp probe succeeded");
                true
            }
            Ok(Err(e)) => {
                debug!(service = %service.name, %addr, error = %e, "tcp probe failed");
                false
            }
            Err(_) => {
                debug!(service = %service.name, %addr, "tcp probe timed out");
                false
            }
        }
    }

    async fn probe_http(&self, url: &Uri, expected_status: u16, timeout: Duration) -> bool {
        let request = match Request::builder()
            .method("GET")
            .uri(url.clone())
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(timeout, self.http.request(request)).await {
            Ok(Ok(response)) => response.status().as_u16() == expected_status,
            Ok(Err(e)) => {
                debug!(%url, error = %e, "http probe failed");
                false
            }
            Err(_) => {
                debug!(%url, "http probe timed out");
                false
            }
        }
    }

    async fn probe_command(&self, service: &Service, command: &str, timeout: Duration) -> bool {
        let opts = match &service.commands {
            Some(commands) => ExecOptions {
                cwd: commands.cwd.clone(),
                env: commands.env.clone(),
                timeout: Some(timeout),
            },
            None => ExecOptions {
                timeout: Some(timeout),
                ..Default::default()
            },
        };
        self.executor.check(command, &opts).await
    }
}

/// Port of an upstream URL, defaulting by scheme
fn upstream_port(uri: &Uri) -> u16 {
    uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    })
}
