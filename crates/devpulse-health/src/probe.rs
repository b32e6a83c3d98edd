//! Low-level probes: HTTP GET over a shared pooled client, TCP connect,
//! and host command execution.

use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Limited};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::CertificateDer;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CheckError;
use crate::types::HealthStatus;

const USER_AGENT: &str = concat!("devpulse-health/", env!("CARGO_PKG_VERSION"));

/// Run `fut` under a deadline, abandoning it if the context is cancelled.
pub(crate) async fn bounded<T, F>(cancel: &CancellationToken, timeout: Duration, fut: F) -> Result<T, CheckError>
where
    F: Future<Output = Result<T, CheckError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CheckError::Cancelled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(CheckError::Timeout(timeout)),
        },
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Bytes,
    pub elapsed: Duration,
}

impl HttpResponse {
    /// The body as a JSON object, if it is one.
    pub fn json_object(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        match serde_json::from_slice(&self.body).ok()? {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

/// HTTP(S) client shared by every check.
///
/// Plain and TLS connections share one pool per host; response bodies
/// are read up to a fixed limit. Server certificates are verified
/// against the webpki roots plus any extra roots the caller trusts
/// (a local development CA, for instance).
#[derive(Clone)]
pub struct HttpProber {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    max_body_bytes: usize,
}

impl HttpProber {
    pub fn new(
        connect_timeout: Duration,
        max_body_bytes: usize,
        extra_roots: &[CertificateDer<'static>],
    ) -> Result<Self, CheckError> {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);
        connector.enforce_http(false);

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config(extra_roots)?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build(connector);

        Ok(Self {
            client,
            max_body_bytes,
        })
    }

    /// GET `url`, failing on transport errors, timeout, or cancellation.
    /// Any HTTP status is a successful exchange.
    pub async fn get(
        &self,
        cancel: &CancellationToken,
        url: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, CheckError> {
        let uri: http::Uri = url
            .parse()
            .map_err(|e: http::uri::InvalidUri| CheckError::Http(format!("invalid url {url}: {e}")))?;

        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(uri)
            .header(http::header::USER_AGENT, USER_AGENT)
            .body(Empty::<Bytes>::new())
            .map_err(|e| CheckError::Http(e.to_string()))?;

        let start = Instant::now();
        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| CheckError::Http(e.to_string()))?;
            let status_code = response.status().as_u16();
            let body = Limited::new(response.into_body(), self.max_body_bytes)
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_else(|e| {
                    debug!(%url, error = %e, "health response body unreadable");
                    Bytes::new()
                });
            Ok(HttpResponse {
                status_code,
                body,
                elapsed: start.elapsed(),
            })
        };

        bounded(cancel, timeout, exchange).await
    }
}

fn tls_config(extra_roots: &[CertificateDer<'static>]) -> Result<rustls::ClientConfig, CheckError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let (_, ignored) = roots.add_parsable_certificates(extra_roots.iter().cloned());
    if ignored > 0 {
        debug!(ignored, "skipped unparsable root certificates");
    }

    let config = rustls::ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
        .with_safe_default_protocol_versions()
        .map_err(|e| CheckError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Map an HTTP status code to a health status.
pub fn status_from_code(code: u16) -> HealthStatus {
    match code {
        200..=399 => HealthStatus::Healthy,
        500.. => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

/// Health named by a `status` field in a JSON body; callers apply it to 2xx responses only.
pub fn status_from_body(body: &serde_json::Map<String, serde_json::Value>) -> Option<HealthStatus> {
    let status = body.get("status")?.as_str()?;
    match status.to_ascii_lowercase().as_str() {
        "healthy" | "ok" | "up" => Some(HealthStatus::Healthy),
        "degraded" | "warning" => Some(HealthStatus::Degraded),
        "unhealthy" | "down" | "error" => Some(HealthStatus::Unhealthy),
        _ => None,
    }
}

/// Whether something accepts TCP connections on localhost:`port`.
pub async fn tcp_probe(cancel: &CancellationToken, port: u16, timeout: Duration) -> Result<bool, CheckError> {
    let connect = async {
        TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| CheckError::Http(e.to_string()))
    };
    match bounded(cancel, timeout, connect).await {
        Ok(_stream) => Ok(true),
        Err(CheckError::Cancelled) => Err(CheckError::Cancelled),
        Err(e) => {
            debug!(port, error = %e, "tcp probe failed");
            Ok(false)
        }
    }
}

/// Exit code and combined output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

/// Run a command to completion. The child is killed if the returned
/// future is dropped.
pub(crate) async fn run_command(program: &str, args: &[String]) -> Result<ExecOutput, CheckError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CheckError::Exec(format!("{program}: {e}")))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(ExecOutput {
        // Killed by a signal.
        exit_code: output.status.code().unwrap_or(-1),
        output: text,
    })
}

/// Program and arguments that run `command` through the platform shell.
pub(crate) fn shell_invocation(command: &str) -> (&'static str, Vec<String>) {
    if cfg!(windows) {
        ("cmd", vec!["/C".to_string(), command.to_string()])
    } else {
        ("sh", vec!["-c".to_string(), command.to_string()])
    }
}
