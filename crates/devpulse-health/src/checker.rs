//! Per-service cascading health check.
//!
//! Order of evaluation, stopping at the first confident answer:
//!
//! 1. registry says `stopped` → `unknown`, nothing probed
//! 2. rate limiter token
//! 3. circuit breaker admission
//! 4. process-type services → process state machine
//! 5. custom health check (URL, command, shell, disabled)
//! 6. HTTP endpoint discovery on the port
//! 7. TCP connect
//! 8. PID liveness
//! 9. `unknown`: no health check method available

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::CertificateDer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use devpulse_core::{HealthTest, HealthcheckSpec};
use devpulse_state::RunStatus;

use crate::breaker::{BreakerSettings, CircuitBreaker};
use crate::collaborators::{ContainerRuntime, DockerCli, ProcessInspector, SystemProcesses};
use crate::endpoint_cache::{CachedEndpoint, EndpointCache};
use crate::error::CheckError;
use crate::keyed::KeyedMap;
use crate::limiter::ServiceRateLimiter;
use crate::logs::{LogBook, LogSource};
use crate::probe::{self, ExecOutput, HttpProber, HttpResponse};
use crate::process::ProcessCheck;
use crate::types::{CheckDetails, CheckKind, CheckResult, HealthStatus, ServiceDescriptor};

/// Paths tried during discovery after the configured default.
pub const COMMON_HEALTH_PATHS: [&str; 5] = ["/health", "/healthz", "/ready", "/alive", "/ping"];

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// First path tried during discovery.
    pub default_endpoint: String,
    /// Per-request HTTP timeout, and the default for custom checks.
    pub timeout: Duration,
    pub tcp_timeout: Duration,
    pub max_body_bytes: usize,
    pub startup_grace_period: Duration,
    /// `None` disables circuit breaking.
    pub circuit_breaker: Option<BreakerSettings>,
    /// Checks per second per service; zero disables rate limiting.
    pub rate_limit: u32,
    /// Containers are named `<prefix><service>`.
    pub container_prefix: String,
    /// Trusted for HTTPS checks in addition to the webpki roots.
    pub extra_root_certs: Vec<CertificateDer<'static>>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            default_endpoint: "/health".to_string(),
            timeout: Duration::from_secs(5),
            tcp_timeout: Duration::from_secs(2),
            max_body_bytes: 1024 * 1024,
            startup_grace_period: Duration::from_secs(30),
            circuit_breaker: Some(BreakerSettings::default()),
            rate_limit: 10,
            container_prefix: "devpulse-".to_string(),
            extra_root_certs: Vec::new(),
        }
    }
}

/// Result of one probe tier, before it is shaped into a `CheckResult`.
#[derive(Debug)]
struct ProbeOutcome {
    kind: CheckKind,
    endpoint: String,
    response_time: Duration,
    status_code: Option<u16>,
    status: HealthStatus,
    details: Option<CheckDetails>,
    error: Option<String>,
}

impl ProbeOutcome {
    fn from_http(url: String, response: &HttpResponse) -> Self {
        let mut status = probe::status_from_code(response.status_code);
        let success = (200..300).contains(&response.status_code);
        let details = response.json_object().map(|body| {
            // A body can only refine a 2xx; error codes stand.
            if let Some(overridden) = probe::status_from_body(&body).filter(|_| success) {
                status = overridden;
            }
            CheckDetails {
                extra: body,
                ..CheckDetails::default()
            }
        });
        Self {
            kind: CheckKind::Http,
            endpoint: url,
            response_time: response.elapsed,
            status_code: Some(response.status_code),
            status,
            details,
            error: None,
        }
    }

    fn failed(kind: CheckKind, endpoint: String, response_time: Duration, error: String) -> Self {
        Self {
            kind,
            endpoint,
            response_time,
            status_code: None,
            status: HealthStatus::Unhealthy,
            details: None,
            error: Some(error),
        }
    }
}

/// Runs health checks. One instance per monitored project; protection
/// state (breakers, limiters, endpoint cache) lives as long as it does.
pub struct HealthChecker {
    config: CheckerConfig,
    http: HttpProber,
    breakers: KeyedMap<String, CircuitBreaker>,
    limiters: KeyedMap<String, ServiceRateLimiter>,
    endpoints: EndpointCache,
    processes: Arc<dyn ProcessInspector>,
    logs: Arc<dyn LogSource>,
    containers: Arc<dyn ContainerRuntime>,
}

impl HealthChecker {
    pub fn new(config: CheckerConfig) -> Result<Self, CheckError> {
        let http = HttpProber::new(config.tcp_timeout, config.max_body_bytes, &config.extra_root_certs)?;
        Ok(Self {
            config,
            http,
            breakers: KeyedMap::new(),
            limiters: KeyedMap::new(),
            endpoints: EndpointCache::new(),
            processes: Arc::new(SystemProcesses),
            logs: Arc::new(LogBook::default()),
            containers: Arc::new(DockerCli::default()),
        })
    }

    pub fn with_log_source(mut self, logs: Arc<dyn LogSource>) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_process_inspector(mut self, processes: Arc<dyn ProcessInspector>) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_container_runtime(mut self, containers: Arc<dyn ContainerRuntime>) -> Self {
        self.containers = containers;
        self
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    pub fn endpoint_cache(&self) -> &EndpointCache {
        &self.endpoints
    }

    /// The breaker for a service, if circuit breaking is enabled.
    pub fn breaker(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        let settings = self.config.circuit_breaker.as_ref()?;
        Some(
            self.breakers
                .get_or_insert_with(service, || CircuitBreaker::new(service, settings.clone())),
        )
    }

    fn limiter(&self, service: &str) -> Option<Arc<ServiceRateLimiter>> {
        if self.config.rate_limit == 0 {
            return None;
        }
        if let Some(existing) = self.limiters.get(service) {
            return Some(existing);
        }
        let limiter = ServiceRateLimiter::new(self.config.rate_limit)?;
        Some(self.limiters.get_or_insert_with(service, || limiter))
    }

    /// Check one service. Never fails: every failure mode is encoded in
    /// the returned result.
    pub async fn check_service(&self, cancel: &CancellationToken, svc: &ServiceDescriptor) -> CheckResult {
        let started = Instant::now();
        debug!(service = %svc.name, port = ?svc.port, pid = ?svc.pid, "starting health check");

        if svc.registry_status == Some(RunStatus::Stopped) {
            let mut result = CheckResult::new(&svc.name, HealthStatus::Unknown, CheckKind::Process)
                .with_error("service stopped");
            self.stamp(&mut result, svc, started);
            return result;
        }

        if let Some(limiter) = self.limiter(&svc.name) {
            if let Err(e) = limiter.acquire(cancel).await {
                warn!(service = %svc.name, error = %e, "rate limit exceeded");
                let mut result = CheckResult::new(&svc.name, HealthStatus::Unhealthy, CheckKind::Process)
                    .with_error("rate limit exceeded");
                self.stamp(&mut result, svc, started);
                return result;
            }
        }

        let outcome = match self.breaker(&svc.name) {
            Some(breaker) => match breaker.admit() {
                Ok(ticket) => {
                    let outcome = self.perform_check(cancel, svc).await;
                    match &outcome {
                        Ok(result) => breaker.record(ticket, !result.status.is_breaker_failure()),
                        Err(CheckError::Cancelled) => breaker.abandon(ticket),
                        Err(_) => breaker.record(ticket, false),
                    }
                    outcome
                }
                Err(rejection) => {
                    warn!(service = %svc.name, reason = %rejection, "skipping check");
                    let mut result = CheckResult::new(&svc.name, HealthStatus::Unhealthy, CheckKind::Process)
                        .with_error(rejection.to_string());
                    self.stamp(&mut result, svc, started);
                    return result;
                }
            },
            None => self.perform_check(cancel, svc).await,
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => error_result(svc, &e),
        };
        self.stamp(&mut result, svc, started);
        debug!(
            service = %svc.name,
            status = %result.status,
            check_type = %result.check_type,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "health check completed"
        );
        result
    }

    fn stamp(&self, result: &mut CheckResult, svc: &ServiceDescriptor, started: Instant) {
        if result.response_time.is_zero() {
            result.response_time = started.elapsed();
        }
        result.service_type = svc.service_type;
        result.service_mode = svc.mode;
    }

    /// Grace window for a service: its own `start_period` when set.
    pub fn grace_period(&self, svc: &ServiceDescriptor) -> Duration {
        svc.healthcheck
            .as_ref()
            .and_then(|hc| hc.start_period)
            .filter(|d| !d.is_zero())
            .unwrap_or(self.config.startup_grace_period)
    }

    fn in_grace(&self, svc: &ServiceDescriptor) -> bool {
        svc.since_start().is_some_and(|elapsed| elapsed < self.grace_period(svc))
    }

    async fn perform_check(&self, cancel: &CancellationToken, svc: &ServiceDescriptor) -> Result<CheckResult, CheckError> {
        let in_grace = self.in_grace(svc);

        if svc.is_process_type() {
            return Ok(ProcessCheck {
                svc,
                in_grace,
                processes: self.processes.as_ref(),
                logs: self.logs.as_ref(),
            }
            .run());
        }

        let mut result = CheckResult::new(&svc.name, HealthStatus::Unknown, CheckKind::Process);
        result.uptime = svc.uptime();

        if let Some(hc) = &svc.healthcheck {
            if let Some(outcome) = self.custom_check(cancel, svc, hc).await? {
                apply_outcome(&mut result, outcome, in_grace);
                if result.port.is_none() {
                    result.port = svc.port;
                }
                return Ok(result);
            }
        }

        if let Some(port) = svc.port {
            let preferred = svc.healthcheck.as_ref().and_then(|hc| hc.path.as_deref());
            if let Some(outcome) = self.discover_http(cancel, port, preferred).await? {
                apply_outcome(&mut result, outcome, in_grace);
                result.port = Some(port);
                return Ok(result);
            }

            result.check_type = CheckKind::Tcp;
            result.port = Some(port);
            result.endpoint = Some(format!("localhost:{port}"));
            if probe::tcp_probe(cancel, port, self.config.tcp_timeout).await? {
                result.status = HealthStatus::Healthy;
            } else {
                // A service that comes up later may grow an HTTP surface.
                self.endpoints.invalidate(port);
                result.status = grace_or(in_grace, HealthStatus::Unhealthy);
                result.error = Some(format!("port {port} not listening"));
            }
            return Ok(result);
        }

        if let Some(pid) = svc.pid {
            result.pid = Some(pid);
            if self.processes.is_running(pid) {
                result.status = HealthStatus::Healthy;
            } else {
                result.status = grace_or(in_grace, HealthStatus::Unhealthy);
                result.error = Some(format!("process {pid} not running"));
            }
            return Ok(result);
        }

        result.status = grace_or(in_grace, HealthStatus::Unknown);
        result.error = Some("no health check method available".to_string());
        Ok(result)
    }

    async fn custom_check(
        &self,
        cancel: &CancellationToken,
        svc: &ServiceDescriptor,
        hc: &HealthcheckSpec,
    ) -> Result<Option<ProbeOutcome>, CheckError> {
        let Some(test) = &hc.test else {
            return Ok(None);
        };
        let timeout = hc.timeout.filter(|t| !t.is_zero()).unwrap_or(self.config.timeout);

        let outcome = match test {
            HealthTest::Disabled => ProbeOutcome {
                kind: CheckKind::Process,
                endpoint: "none".to_string(),
                response_time: Duration::ZERO,
                status_code: None,
                status: HealthStatus::Healthy,
                details: None,
                error: None,
            },
            HealthTest::Url(url) => {
                let start = Instant::now();
                match self.http.get(cancel, url, timeout).await {
                    Ok(response) => ProbeOutcome::from_http(url.clone(), &response),
                    Err(CheckError::Cancelled) => return Err(CheckError::Cancelled),
                    Err(e) => ProbeOutcome::failed(
                        CheckKind::Http,
                        url.clone(),
                        start.elapsed(),
                        format!("connection failed: {e}"),
                    ),
                }
            }
            HealthTest::Command(args) => {
                let Some((program, rest)) = args.split_first() else {
                    return Ok(None);
                };
                let endpoint = args.join(" ");
                if svc.is_container() {
                    let container = self.container_name(svc);
                    let exec = self.containers.exec(&container, args);
                    self.exec_outcome(cancel, endpoint, timeout, true, exec).await?
                } else {
                    let exec = probe::run_command(program, rest);
                    self.exec_outcome(cancel, endpoint, timeout, false, exec).await?
                }
            }
            HealthTest::Shell(command) => {
                if svc.is_container() {
                    let container = self.container_name(svc);
                    let exec = self.containers.exec_shell(&container, command);
                    self.exec_outcome(cancel, command.clone(), timeout, true, exec).await?
                } else {
                    let (program, args) = probe::shell_invocation(command);
                    let exec = probe::run_command(program, &args);
                    self.exec_outcome(cancel, command.clone(), timeout, false, exec).await?
                }
            }
        };
        Ok(Some(outcome))
    }

    fn container_name(&self, svc: &ServiceDescriptor) -> String {
        format!("{}{}", self.config.container_prefix, svc.name)
    }

    async fn exec_outcome<F>(
        &self,
        cancel: &CancellationToken,
        endpoint: String,
        timeout: Duration,
        in_container: bool,
        exec: F,
    ) -> Result<ProbeOutcome, CheckError>
    where
        F: std::future::Future<Output = Result<ExecOutput, CheckError>>,
    {
        let start = Instant::now();
        let outcome = match probe::bounded(cancel, timeout, exec).await {
            Ok(out) if out.exit_code == 0 => ProbeOutcome {
                kind: CheckKind::Process,
                endpoint,
                response_time: start.elapsed(),
                status_code: None,
                status: HealthStatus::Healthy,
                details: None,
                error: None,
            },
            Ok(out) => ProbeOutcome::failed(
                CheckKind::Process,
                endpoint,
                start.elapsed(),
                format!("command exited with code {}: {}", out.exit_code, out.output.trim()),
            ),
            Err(CheckError::Cancelled) => return Err(CheckError::Cancelled),
            Err(e) if in_container => {
                ProbeOutcome::failed(CheckKind::Process, endpoint, start.elapsed(), format!("docker exec failed: {e}"))
            }
            Err(e) => ProbeOutcome::failed(CheckKind::Process, endpoint, start.elapsed(), e.to_string()),
        };
        Ok(outcome)
    }

    /// Probe the cached path for `port`, or discover one.
    ///
    /// `Ok(None)` means the port has no HTTP health surface.
    async fn discover_http(
        &self,
        cancel: &CancellationToken,
        port: u16,
        preferred: Option<&str>,
    ) -> Result<Option<ProbeOutcome>, CheckError> {
        match self.endpoints.get(port) {
            Some(CachedEndpoint::NoEndpoint) => {
                debug!(port, "skipping http check, no endpoint found previously");
                return Ok(None);
            }
            Some(CachedEndpoint::Path(path)) => {
                if let Some(outcome) = self.probe_path(cancel, port, &path).await? {
                    if outcome.status == HealthStatus::Healthy {
                        return Ok(Some(outcome));
                    }
                }
                debug!(port, path = %path, "cached health endpoint failed, rediscovering");
                self.endpoints.invalidate(port);
            }
            None => {}
        }

        for path in self.candidate_paths(preferred) {
            if cancel.is_cancelled() {
                return Err(CheckError::Cancelled);
            }
            if let Some(outcome) = self.probe_path(cancel, port, &path).await? {
                self.endpoints.remember(port, &path);
                return Ok(Some(outcome));
            }
        }

        self.endpoints.mark_none(port);
        Ok(None)
    }

    fn candidate_paths(&self, preferred: Option<&str>) -> Vec<String> {
        let mut paths: Vec<String> = Vec::with_capacity(COMMON_HEALTH_PATHS.len() + 2);
        let first = preferred.into_iter().chain([self.config.default_endpoint.as_str()]);
        for path in first.chain(COMMON_HEALTH_PATHS) {
            let path = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            };
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    /// One GET against `localhost:port/path`. `Ok(None)` when the path
    /// does not exist (404/400) or nothing answered.
    async fn probe_path(&self, cancel: &CancellationToken, port: u16, path: &str) -> Result<Option<ProbeOutcome>, CheckError> {
        let url = format!("http://localhost:{port}{path}");
        match self.http.get(cancel, &url, self.config.timeout).await {
            Ok(response) if matches!(response.status_code, 400 | 404) => Ok(None),
            Ok(response) => Ok(Some(ProbeOutcome::from_http(url, &response))),
            Err(CheckError::Cancelled) => Err(CheckError::Cancelled),
            Err(e) => {
                debug!(%url, error = %e, "health probe failed");
                Ok(None)
            }
        }
    }
}

fn grace_or(in_grace: bool, status: HealthStatus) -> HealthStatus {
    if in_grace { HealthStatus::Starting } else { status }
}

fn apply_outcome(result: &mut CheckResult, outcome: ProbeOutcome, in_grace: bool) {
    result.check_type = outcome.kind;
    result.endpoint = Some(outcome.endpoint);
    result.response_time = outcome.response_time;
    result.status_code = outcome.status_code;
    result.details = outcome.details;
    result.error = outcome.error;
    result.status = if outcome.status == HealthStatus::Healthy {
        HealthStatus::Healthy
    } else {
        grace_or(in_grace, outcome.status)
    };
    if result.check_type == CheckKind::Http {
        result.port = result
            .endpoint
            .as_deref()
            .and_then(|e| e.parse::<http::Uri>().ok())
            .and_then(|uri| uri.port_u16());
    }
}

/// Result for a check that was aborted.
pub(crate) fn error_result(svc: &ServiceDescriptor, error: &CheckError) -> CheckResult {
    let mut result = CheckResult::new(&svc.name, HealthStatus::Unknown, CheckKind::Process).with_error(error.to_string());
    result.port = svc.port;
    result.pid = svc.pid;
    result.uptime = svc.uptime();
    result
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use devpulse_core::{RunMode, ServiceType};

    use super::*;

    fn checker() -> HealthChecker {
        HealthChecker::new(CheckerConfig {
            rate_limit: 0,
            ..CheckerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn candidate_paths_put_preferred_first_without_duplicates() {
        let c = checker();
        assert_eq!(
            c.candidate_paths(Some("status")),
            ["/status", "/health", "/healthz", "/ready", "/alive", "/ping"]
        );
        assert_eq!(
            c.candidate_paths(Some("/healthz")),
            ["/healthz", "/health", "/ready", "/alive", "/ping"]
        );
    }

    #[test]
    fn start_period_overrides_grace() {
        let c = checker();
        let mut svc = ServiceDescriptor::new("api");
        assert_eq!(c.grace_period(&svc), Duration::from_secs(30));

        let mut hc = HealthcheckSpec::disabled();
        hc.start_period = Some(Duration::from_secs(5));
        svc.healthcheck = Some(hc);
        assert_eq!(c.grace_period(&svc), Duration::from_secs(5));

        svc.started_at = Some(SystemTime::now() - Duration::from_secs(10));
        assert!(!c.in_grace(&svc));
    }

    #[tokio::test]
    async fn stopped_service_is_unknown() {
        let c = checker();
        let mut svc = ServiceDescriptor::new("api");
        svc.port = Some(1);
        svc.registry_status = Some(RunStatus::Stopped);

        let result = c.check_service(&CancellationToken::new(), &svc).await;
        assert_eq!(result.status, HealthStatus::Unknown);
        assert!(c.endpoint_cache().get(1).is_none());
        assert!(c.breakers.is_empty());
    }

    #[tokio::test]
    async fn disabled_check_is_healthy() {
        let c = checker();
        let mut svc = ServiceDescriptor::new("db");
        svc.port = Some(1);
        svc.healthcheck = Some(HealthcheckSpec::disabled());

        let result = c.check_service(&CancellationToken::new(), &svc).await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.endpoint.as_deref(), Some("none"));
    }

    #[tokio::test]
    async fn no_method_available() {
        let c = checker();
        let mut svc = ServiceDescriptor::new("ghost");
        svc.service_type = Some(ServiceType::Http);
        let result = c.check_service(&CancellationToken::new(), &svc).await;
        assert_eq!(result.status, HealthStatus::Unknown);
        assert_eq!(result.error.as_deref(), Some("no health check method available"));
    }

    #[tokio::test]
    async fn no_method_within_grace_is_starting() {
        let c = checker();
        let mut svc = ServiceDescriptor::new("ghost");
        svc.service_type = Some(ServiceType::Http);
        svc.started_at = Some(SystemTime::now());
        let result = c.check_service(&CancellationToken::new(), &svc).await;
        assert_eq!(result.status, HealthStatus::Starting);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_command_check() {
        let c = checker();
        let mut svc = ServiceDescriptor::new("worker");
        svc.mode = Some(RunMode::Service);
        let mut hc = HealthcheckSpec::disabled();
        hc.kind = None;
        hc.test = Some(HealthTest::Shell("exit 0".into()));
        svc.healthcheck = Some(hc.clone());

        let result = c.check_service(&CancellationToken::new(), &svc).await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.endpoint.as_deref(), Some("exit 0"));

        hc.test = Some(HealthTest::Shell("echo nope; exit 4".into()));
        svc.healthcheck = Some(hc);
        let result = c.check_service(&CancellationToken::new(), &svc).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.error.as_deref(), Some("command exited with code 4: nope"));
    }

    #[tokio::test]
    async fn closed_port_falls_back_to_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let c = checker();
        let mut svc = ServiceDescriptor::new("api");
        svc.port = Some(port);
        let result = c.check_service(&CancellationToken::new(), &svc).await;
        assert_eq!(result.check_type, CheckKind::Tcp);
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.error, Some(format!("port {port} not listening")));
        // Sentinel cleared so a late HTTP server is rediscovered.
        assert!(c.endpoint_cache().get(port).is_none());
    }

    #[tokio::test]
    async fn cancelled_check_is_unknown() {
        let c = checker();
        let mut svc = ServiceDescriptor::new("api");
        svc.port = Some(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = c.check_service(&cancel, &svc).await;
        assert_eq!(result.status, HealthStatus::Unknown);
        assert_eq!(result.error.as_deref(), Some("context cancelled"));
    }

    #[tokio::test]
    async fn cancelled_limiter_wait_is_rate_limited() {
        let c = HealthChecker::new(CheckerConfig {
            rate_limit: 5,
            ..CheckerConfig::default()
        })
        .unwrap();
        let mut svc = ServiceDescriptor::new("api");
        svc.port = Some(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = c.check_service(&cancel, &svc).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.error.as_deref(), Some("rate limit exceeded"));
        // Rejected before the breaker is consulted.
        assert!(c.breaker("api").is_none());
    }
}
