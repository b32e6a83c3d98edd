//! HTTP-facing checker behaviour against real local servers.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use devpulse_core::{HealthTest, HealthcheckSpec};
use devpulse_health::*;

async fn serve(router: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

fn checker() -> HealthChecker {
    HealthChecker::new(CheckerConfig {
        rate_limit: 0,
        ..CheckerConfig::default()
    })
    .unwrap()
}

fn service(port: u16) -> ServiceDescriptor {
    let mut svc = ServiceDescriptor::new("api");
    svc.port = Some(port);
    svc
}

#[derive(Clone, Default)]
struct Hits {
    healthz: Arc<AtomicUsize>,
    other: Arc<AtomicUsize>,
}

impl Hits {
    fn total(&self) -> usize {
        self.healthz.load(Ordering::SeqCst) + self.other.load(Ordering::SeqCst)
    }
}

fn healthz_only(hits: Hits) -> Router {
    let on_healthz = hits.healthz.clone();
    let on_other = hits.other.clone();
    Router::new()
        .route(
            "/healthz",
            get(move || {
                on_healthz.fetch_add(1, Ordering::SeqCst);
                async { Json(json!({"status": "healthy", "version": "1.4.0"})) }
            }),
        )
        .fallback(move || {
            on_other.fetch_add(1, Ordering::SeqCst);
            async { StatusCode::NOT_FOUND }
        })
}

#[tokio::test]
async fn discovers_healthz() {
    let hits = Hits::default();
    let port = serve(healthz_only(hits.clone())).await;
    let checker = checker();

    let result = checker.check_service(&CancellationToken::new(), &service(port)).await;
    assert_eq!(result.status, HealthStatus::Healthy);
    assert_eq!(result.check_type, CheckKind::Http);
    assert_eq!(result.status_code, Some(200));
    assert_eq!(result.port, Some(port));
    assert!(result.endpoint.as_deref().unwrap().ends_with("/healthz"));
    let details = result.details.unwrap();
    assert_eq!(details.extra["version"], "1.4.0");

    // /health was tried and skipped as missing.
    assert_eq!(hits.other.load(Ordering::SeqCst), 1);
    assert_eq!(
        checker.endpoint_cache().get(port),
        Some(CachedEndpoint::Path("/healthz".into()))
    );
}

#[tokio::test]
async fn cached_endpoint_costs_one_request() {
    let hits = Hits::default();
    let port = serve(healthz_only(hits.clone())).await;
    let checker = checker();
    let cancel = CancellationToken::new();

    checker.check_service(&cancel, &service(port)).await;
    for _ in 0..3 {
        let before = hits.total();
        let healthz_before = hits.healthz.load(Ordering::SeqCst);
        let result = checker.check_service(&cancel, &service(port)).await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(hits.total() - before, 1);
        assert_eq!(hits.healthz.load(Ordering::SeqCst) - healthz_before, 1);
    }
}

#[tokio::test]
async fn breaker_opens_after_repeated_failures() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/health",
        get(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { StatusCode::SERVICE_UNAVAILABLE }
        }),
    );
    let port = serve(router).await;
    let checker = checker();
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        let result = checker.check_service(&cancel, &service(port)).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.status_code, Some(503));
    }
    assert_eq!(checker.breaker("api").unwrap().state(), BreakerState::Open);

    let before = hits.load(Ordering::SeqCst);
    for _ in 0..3 {
        let result = checker.check_service(&cancel, &service(port)).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.error.as_deref(), Some("circuit breaker open"));
    }
    assert_eq!(hits.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn disabled_breaker_always_checks() {
    let router = Router::new().route("/health", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    let port = serve(router).await;
    let checker = HealthChecker::new(CheckerConfig {
        rate_limit: 0,
        circuit_breaker: None,
        ..CheckerConfig::default()
    })
    .unwrap();

    for _ in 0..8 {
        let result = checker.check_service(&CancellationToken::new(), &service(port)).await;
        assert_eq!(result.status_code, Some(500));
    }
    assert!(checker.breaker("api").is_none());
}

#[tokio::test]
async fn body_status_overrides_code() {
    let router = Router::new().route(
        "/health",
        get(|| async { Json(json!({"status": "warning", "checks": {"db": "slow"}})) }),
    );
    let port = serve(router).await;

    let result = checker().check_service(&CancellationToken::new(), &service(port)).await;
    assert_eq!(result.status, HealthStatus::Degraded);
    assert_eq!(result.status_code, Some(200));
}

#[tokio::test]
async fn custom_url_and_path() {
    let router = Router::new()
        .route("/live", get(|| async { "ok" }))
        .route("/status", get(|| async { Json(json!({"status": "up"})) }));
    let port = serve(router).await;
    let checker = checker();

    let mut svc = ServiceDescriptor::new("web");
    let mut hc = HealthcheckSpec::disabled();
    hc.kind = None;
    hc.test = Some(HealthTest::Url(format!("http://127.0.0.1:{port}/live")));
    svc.healthcheck = Some(hc);
    let result = checker.check_service(&CancellationToken::new(), &svc).await;
    assert_eq!(result.status, HealthStatus::Healthy);
    assert_eq!(result.check_type, CheckKind::Http);
    assert_eq!(result.port, Some(port));

    let mut svc = service(port);
    svc.name = "status".into();
    let mut hc = HealthcheckSpec::disabled();
    hc.kind = None;
    hc.test = None;
    hc.path = Some("/status".into());
    svc.healthcheck = Some(hc);
    let result = checker.check_service(&CancellationToken::new(), &svc).await;
    assert_eq!(result.status, HealthStatus::Healthy);
    assert!(result.endpoint.unwrap().ends_with("/status"));
}

#[tokio::test]
async fn tcp_only_service() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        // Accept and hang up without speaking HTTP.
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    let checker = checker();
    let cancel = CancellationToken::new();

    let result = checker.check_service(&cancel, &service(port)).await;
    assert_eq!(result.status, HealthStatus::Healthy);
    assert_eq!(result.check_type, CheckKind::Tcp);
    assert_eq!(checker.endpoint_cache().get(port), Some(CachedEndpoint::NoEndpoint));

    let result = checker.check_service(&cancel, &service(port)).await;
    assert_eq!(result.check_type, CheckKind::Tcp);
}

#[tokio::test]
async fn unreachable_url_within_grace_is_starting() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut svc = ServiceDescriptor::new("web");
    svc.started_at = Some(std::time::SystemTime::now());
    let mut hc = HealthcheckSpec::disabled();
    hc.kind = None;
    hc.test = Some(HealthTest::Url(format!("http://127.0.0.1:{port}/health")));
    svc.healthcheck = Some(hc);

    let result = checker().check_service(&CancellationToken::new(), &svc).await;
    assert_eq!(result.status, HealthStatus::Starting);
    assert!(result.error.unwrap().starts_with("connection failed"));
}

/// One-shot TLS server on a self-signed cert; answers every request
/// with a JSON 200.
fn serve_tls() -> (u16, rustls::pki_types::CertificateDer<'static>) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert_params =
        rcgen::CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    let cert = cert_params.self_signed(&key_pair).unwrap();
    let cert_der = cert.der().clone();
    let server_key = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
    let server_config = Arc::new(
        rustls::ServerConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], server_key)
            .unwrap(),
    );

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for tcp_stream in listener.incoming() {
            let Ok(tcp_stream) = tcp_stream else { break };
            let tls_conn = rustls::ServerConnection::new(server_config.clone()).unwrap();
            let mut tls_stream = rustls::StreamOwned::new(tls_conn, tcp_stream);
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match tls_stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            let body = r#"{"status":"ok"}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = tls_stream.write_all(response.as_bytes());
            tls_stream.conn.send_close_notify();
            let _ = tls_stream.flush();
        }
    });
    (port, cert_der)
}

#[tokio::test]
async fn https_url_against_trusted_root() {
    let (port, cert) = serve_tls();
    let checker = HealthChecker::new(CheckerConfig {
        rate_limit: 0,
        extra_root_certs: vec![cert],
        ..CheckerConfig::default()
    })
    .unwrap();

    let mut svc = ServiceDescriptor::new("secure");
    let mut hc = HealthcheckSpec::disabled();
    hc.kind = None;
    hc.test = Some(HealthTest::Url(format!("https://127.0.0.1:{port}/health")));
    svc.healthcheck = Some(hc);

    let result = checker.check_service(&CancellationToken::new(), &svc).await;
    assert_eq!(result.status, HealthStatus::Healthy, "{:?}", result.error);
    assert_eq!(result.check_type, CheckKind::Http);
    assert_eq!(result.status_code, Some(200));
    assert_eq!(result.port, Some(port));
}

#[tokio::test]
async fn https_url_with_untrusted_cert_fails() {
    let (port, _) = serve_tls();

    let mut svc = ServiceDescriptor::new("secure");
    let mut hc = HealthcheckSpec::disabled();
    hc.kind = None;
    hc.test = Some(HealthTest::Url(format!("https://127.0.0.1:{port}/health")));
    svc.healthcheck = Some(hc);

    let result = checker().check_service(&CancellationToken::new(), &svc).await;
    assert_eq!(result.status, HealthStatus::Unhealthy);
    assert_ne!(result.status_code, Some(200));
}

#[tokio::test]
async fn error_code_ignores_body_status() {
    let router = Router::new().route(
        "/health",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "ok"}))) }),
    );
    let port = serve(router).await;

    let result = checker().check_service(&CancellationToken::new(), &service(port)).await;
    assert_eq!(result.status, HealthStatus::Unhealthy);
    assert_eq!(result.status_code, Some(503));
}
