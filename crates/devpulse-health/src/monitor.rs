//! Health monitor: runs check cycles across every service of a project.
//!
//! Merges the registry with the manifest into per-service descriptors,
//! fans checks out behind a semaphore, aggregates the report, caches it,
//! and reconciles results back into the registry.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use moka::future::Cache;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use devpulse_core::{Manifest, MANIFEST_FILE};
use devpulse_state::ServiceEntry;

use crate::checker::{error_result, CheckerConfig, HealthChecker};
use crate::collaborators::ServiceRegistry;
use crate::error::CheckError;
use crate::reconcile;
use crate::types::{CheckResult, HealthReport, ServiceDescriptor};

const CACHE_KEY: &str = "health_report";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub project_dir: PathBuf,
    pub manifest_file: String,
    /// Upper bound on checks in flight at once.
    pub max_concurrent_checks: usize,
    /// Zero disables report caching.
    pub cache_ttl: Duration,
    pub checker: CheckerConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            manifest_file: MANIFEST_FILE.to_string(),
            max_concurrent_checks: 10,
            cache_ttl: Duration::ZERO,
            checker: CheckerConfig::default(),
        }
    }
}

pub struct HealthMonitor {
    config: MonitorConfig,
    registry: Arc<dyn ServiceRegistry>,
    checker: Arc<HealthChecker>,
    cache: Option<Cache<String, Arc<HealthReport>>>,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig, registry: Arc<dyn ServiceRegistry>) -> Result<Self, CheckError> {
        let checker = HealthChecker::new(config.checker.clone())?;
        Ok(Self::with_checker(config, registry, checker))
    }

    /// Use a pre-built checker (custom log source, process inspector, ...).
    pub fn with_checker(config: MonitorConfig, registry: Arc<dyn ServiceRegistry>, checker: HealthChecker) -> Self {
        let cache = (!config.cache_ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(64)
                .time_to_live(config.cache_ttl)
                .build()
        });
        Self {
            config,
            registry,
            checker: Arc::new(checker),
            cache,
        }
    }

    pub fn checker(&self) -> &HealthChecker {
        &self.checker
    }

    /// Run one check cycle over the services named in `filter` (all
    /// services when empty).
    pub async fn check(&self, cancel: &CancellationToken, filter: &[String]) -> HealthReport {
        let key = cache_key(filter);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&key).await {
                debug!(%key, "returning cached health report");
                return hit.as_ref().clone();
            }
        }

        let manifest = self.load_manifest();
        let entries = self.registry.list_all().unwrap_or_else(|e| {
            warn!(error = %e, "could not read registry");
            Vec::new()
        });
        let services = filter_services(build_service_list(manifest.as_ref(), entries), filter);
        info!(total_services = services.len(), "starting health checks");

        let results = self.run_checks(cancel, services).await;
        let report = HealthReport::new(self.project_name(manifest.as_ref()), results);
        info!(
            healthy = report.summary.healthy,
            degraded = report.summary.degraded,
            unhealthy = report.summary.unhealthy,
            unknown = report.summary.unknown,
            overall = %report.summary.overall,
            "health checks completed"
        );

        if let Some(cache) = &self.cache {
            cache.insert(key, Arc::new(report.clone())).await;
        }
        reconcile::reconcile(self.registry.as_ref(), &report.services);
        report
    }

    /// Check on a fixed interval until `shutdown` changes or the
    /// receiving side of `reports` goes away. An in-flight cycle is
    /// cancelled on shutdown.
    pub async fn run(
        &self,
        interval: Duration,
        filter: Vec<String>,
        mut shutdown: watch::Receiver<bool>,
        reports: mpsc::Sender<HealthReport>,
    ) {
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");
        loop {
            let cancel = CancellationToken::new();
            tokio::select! {
                report = self.check(&cancel, &filter) => {
                    if reports.send(report).await.is_err() {
                        debug!("report receiver dropped");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    cancel.cancel();
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("health monitor stopped");
    }

    fn load_manifest(&self) -> Option<Manifest> {
        let path = self.config.project_dir.join(&self.config.manifest_file);
        if !path.exists() {
            debug!(path = %path.display(), "no manifest, using registry only");
            return None;
        }
        match Manifest::from_file(&path) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not load manifest");
                None
            }
        }
    }

    fn project_name(&self, manifest: Option<&Manifest>) -> String {
        manifest
            .and_then(|m| m.name.clone())
            .unwrap_or_else(|| self.config.project_dir.display().to_string())
    }

    async fn run_checks(&self, cancel: &CancellationToken, services: Vec<ServiceDescriptor>) -> Vec<CheckResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_checks.max(1)));
        let (tx, mut rx) = mpsc::channel(services.len().max(1));
        let mut slots: Vec<Option<CheckResult>> = vec![None; services.len()];
        let mut handles = Vec::with_capacity(services.len());

        for (index, svc) in services.iter().enumerate() {
            if cancel.is_cancelled() {
                slots[index] = Some(error_result(svc, &CheckError::Cancelled));
                continue;
            }
            let checker = self.checker.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            let svc = svc.clone();
            let handle = tokio::spawn(async move {
                let result = check_with_permit(&checker, &semaphore, &cancel, &svc).await;
                // Receiver lives until every sender is gone.
                let _ = tx.send((index, result)).await;
            });
            handles.push((index, handle));
        }
        drop(tx);

        while let Some((index, result)) = rx.recv().await {
            slots[index] = Some(result);
        }

        for (index, handle) in handles {
            if let Err(e) = handle.await {
                error!(service = %services[index].name, error = %e, "health check task failed");
                let reason = if e.is_panic() { "health check panicked" } else { "health check aborted" };
                slots[index] = Some(error_result(&services[index], &CheckError::Internal(reason.to_string())));
            }
        }

        slots
            .into_iter()
            .zip(&services)
            .map(|(slot, svc)| {
                slot.unwrap_or_else(|| error_result(svc, &CheckError::Internal("no result produced".to_string())))
            })
            .collect()
    }
}

async fn check_with_permit(
    checker: &HealthChecker,
    semaphore: &Semaphore,
    cancel: &CancellationToken,
    svc: &ServiceDescriptor,
) -> CheckResult {
    if cancel.is_cancelled() {
        return error_result(svc, &CheckError::Cancelled);
    }
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return error_result(svc, &CheckError::Cancelled),
        permit = semaphore.acquire() => permit,
    };
    let Ok(_permit) = permit else {
        return error_result(svc, &CheckError::Internal("check pool closed".to_string()));
    };
    if cancel.is_cancelled() {
        return error_result(svc, &CheckError::Cancelled);
    }
    checker.check_service(cancel, svc).await
}

/// `health_report` for no filter, else the sorted, escaped names joined
/// by `::`.
pub fn cache_key(filter: &[String]) -> String {
    if filter.is_empty() {
        return CACHE_KEY.to_string();
    }
    let mut names: Vec<String> = filter
        .iter()
        .map(|name| name.replace('\\', "\\\\").replace(':', "\\:"))
        .collect();
    names.sort();
    names.dedup();
    format!("{CACHE_KEY}::{}", names.join("::"))
}

/// Keep only the named services. An empty filter keeps everything.
pub fn filter_services(services: Vec<ServiceDescriptor>, filter: &[String]) -> Vec<ServiceDescriptor> {
    if filter.is_empty() {
        return services;
    }
    services
        .into_iter()
        .filter(|svc| filter.iter().any(|name| name == &svc.name))
        .collect()
}

/// Merge registry entries with manifest definitions, ordered by name.
///
/// Runtime fields come from the registry; the manifest supplies the
/// health check and fills in type, mode, and port when the registry has
/// not captured them.
pub fn build_service_list(manifest: Option<&Manifest>, entries: Vec<ServiceEntry>) -> Vec<ServiceDescriptor> {
    let mut services: BTreeMap<String, ServiceDescriptor> = entries
        .into_iter()
        .map(|entry| (entry.name.clone(), descriptor_from_entry(entry)))
        .collect();

    if let Some(manifest) = manifest {
        for (name, config) in &manifest.services {
            let svc = services
                .entry(name.clone())
                .or_insert_with(|| ServiceDescriptor::new(name.clone()));
            svc.healthcheck = config.healthcheck_spec(name);
            if svc.service_type.is_none() {
                svc.service_type = config.service_type;
                if config.is_container() {
                    svc.service_type = Some(devpulse_core::ServiceType::Container);
                }
            }
            svc.mode = svc.mode.or(config.mode);
            svc.port = svc.port.or(config.port);
        }
    }

    services.into_values().collect()
}

fn descriptor_from_entry(entry: ServiceEntry) -> ServiceDescriptor {
    ServiceDescriptor {
        port: entry.port,
        pid: entry.pid.filter(|pid| *pid > 0),
        started_at: entry.started_at_ms.map(from_millis),
        ended_at: entry.ended_at_ms.map(from_millis),
        service_type: entry.service_type,
        mode: entry.mode,
        registry_status: Some(entry.status),
        exit_code: entry.exit_code,
        healthcheck: None,
        name: entry.name,
    }
}

fn from_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}
