//! devpulse.yaml manifest parser.
//!
//! Only the parts the health engine consumes are modelled. The
//! `healthcheck` block follows Docker Compose conventions and is decoded
//! leniently: a block that does not parse is logged and treated as
//! absent rather than failing the whole manifest.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::duration::parse_duration;
use crate::types::{RunMode, ServiceType};

/// Default manifest file name inside a project directory.
pub const MANIFEST_FILE: &str = "devpulse.yaml";

const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default, rename = "type")]
    pub service_type: Option<ServiceType>,
    #[serde(default)]
    pub mode: Option<RunMode>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub image: Option<String>,
    /// Kept raw so that a malformed block degrades to "no custom check".
    #[serde(default)]
    pub healthcheck: Option<serde_yaml::Value>,
}

/// The `test` field, decided once at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthTest {
    /// Direct HTTP GET against a full URL.
    Url(String),
    /// `["CMD", prog, args...]`, executed without a shell.
    Command(Vec<String>),
    /// `["CMD-SHELL", cmd]` or a plain command string.
    Shell(String),
    /// `["NONE"]`, `type: none`, `disable: true`, or `healthcheck: false`.
    Disabled,
}

/// The `type` field of a health check block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthcheckKind {
    Http,
    Tcp,
    Process,
    Output,
    None,
}

/// Parsed, strongly typed health check configuration for one service.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthcheckSpec {
    pub test: Option<HealthTest>,
    pub kind: Option<HealthcheckKind>,
    /// HTTP path to probe first (type http).
    pub path: Option<String>,
    /// Output pattern to wait for (type output).
    pub pattern: Option<String>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: u32,
    pub start_period: Option<Duration>,
    pub start_interval: Option<Duration>,
}

/// Raw wire shape of a health check block.
#[derive(Debug, Deserialize)]
struct RawHealthcheck {
    #[serde(default)]
    test: Option<RawTest>,
    #[serde(default, rename = "type")]
    kind: Option<HealthcheckKind>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    retries: Option<u32>,
    #[serde(default)]
    start_period: Option<String>,
    #[serde(default)]
    start_interval: Option<String>,
    #[serde(default)]
    disable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTest {
    Line(String),
    Args(Vec<String>),
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Parsed health check for a service, if it has a usable one.
    pub fn healthcheck_for(&self, service: &str) -> Option<HealthcheckSpec> {
        self.services.get(service)?.healthcheck_spec(service)
    }
}

impl ServiceConfig {
    /// True when the service runs from a container image.
    pub fn is_container(&self) -> bool {
        self.service_type == Some(ServiceType::Container)
            || self.image.as_deref().is_some_and(|i| !i.is_empty())
    }

    /// Decode the health check block. Malformed blocks yield `None`.
    pub fn healthcheck_spec(&self, service: &str) -> Option<HealthcheckSpec> {
        let value = self.healthcheck.as_ref()?;
        match value {
            serde_yaml::Value::Null => None,
            serde_yaml::Value::Bool(false) => Some(HealthcheckSpec::disabled()),
            serde_yaml::Value::Bool(true) => None,
            other => match serde_yaml::from_value::<RawHealthcheck>(other.clone()) {
                Ok(raw) => Some(HealthcheckSpec::from_raw(raw, service)),
                Err(e) => {
                    warn!(%service, error = %e, "ignoring malformed healthcheck block");
                    None
                }
            },
        }
    }
}

impl HealthcheckSpec {
    pub fn disabled() -> Self {
        Self {
            test: Some(HealthTest::Disabled),
            kind: Some(HealthcheckKind::None),
            path: None,
            pattern: None,
            interval: None,
            timeout: None,
            retries: DEFAULT_RETRIES,
            start_period: None,
            start_interval: None,
        }
    }

    fn from_raw(raw: RawHealthcheck, service: &str) -> Self {
        let mut test = raw.test.and_then(HealthTest::from_raw);
        if raw.disable || raw.kind == Some(HealthcheckKind::None) {
            test = Some(HealthTest::Disabled);
        }

        Self {
            test,
            kind: raw.kind,
            path: raw.path.filter(|p| !p.is_empty()),
            pattern: raw.pattern.filter(|p| !p.is_empty()),
            interval: lenient_duration(raw.interval, "interval", service),
            timeout: lenient_duration(raw.timeout, "timeout", service),
            retries: raw.retries.filter(|r| *r > 0).unwrap_or(DEFAULT_RETRIES),
            start_period: lenient_duration(raw.start_period, "start_period", service),
            start_interval: lenient_duration(raw.start_interval, "start_interval", service),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.test, Some(HealthTest::Disabled))
    }

    /// Output-pattern check configured with a non-empty pattern.
    pub fn output_pattern(&self) -> Option<&str> {
        match self.kind {
            Some(HealthcheckKind::Output) => self.pattern.as_deref(),
            _ => None,
        }
    }
}

impl HealthTest {
    fn from_raw(raw: RawTest) -> Option<Self> {
        match raw {
            RawTest::Line(line) => Self::from_line(line),
            RawTest::Args(args) => Self::from_args(args),
        }
    }

    fn from_line(line: String) -> Option<Self> {
        let line = line.trim().to_string();
        if line.is_empty() {
            None
        } else if is_url(&line) {
            Some(HealthTest::Url(line))
        } else if line == "NONE" {
            Some(HealthTest::Disabled)
        } else {
            Some(HealthTest::Shell(line))
        }
    }

    fn from_args(mut args: Vec<String>) -> Option<Self> {
        if args.is_empty() {
            return None;
        }
        match args[0].as_str() {
            "NONE" => Some(HealthTest::Disabled),
            "CMD" if args.len() > 1 => Some(HealthTest::Command(args.split_off(1))),
            "CMD-SHELL" if args.len() > 1 => Some(HealthTest::Shell(args.split_off(1).join(" "))),
            "CMD" | "CMD-SHELL" => None,
            _ => Self::from_line(args.swap_remove(0)),
        }
    }
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn lenient_duration(value: Option<String>, field: &str, service: &str) -> Option<Duration> {
    let value = value?;
    match parse_duration(&value) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(%service, %field, error = %e, "ignoring invalid healthcheck duration");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: shop
services:
  api:
    type: http
    port: 8080
    healthcheck:
      test: "http://localhost:8080/healthz"
      timeout: 3s
      start_period: 20s
  worker:
    type: process
    mode: watch
    healthcheck:
      type: output
      pattern: "Compiled successfully"
  db:
    image: postgres:16
    port: 5432
    healthcheck:
      test: ["CMD-SHELL", "pg_isready -U postgres"]
      interval: 10s
      retries: 5
  migrate:
    type: process
    mode: task
    healthcheck: false
  broken:
    port: 9000
    healthcheck:
      test: { nested: true }
"#;

    fn manifest() -> Manifest {
        Manifest::from_yaml_str(MANIFEST).unwrap()
    }

    #[test]
    fn parses_services_and_modes() {
        let m = manifest();
        assert_eq!(m.name.as_deref(), Some("shop"));
        assert_eq!(m.services.len(), 5);
        assert_eq!(m.services["worker"].mode, Some(RunMode::Watch));
        assert_eq!(m.services["api"].port, Some(8080));
        assert!(m.services["db"].is_container());
        assert!(!m.services["api"].is_container());
    }

    #[test]
    fn url_test_string() {
        let hc = manifest().healthcheck_for("api").unwrap();
        assert_eq!(
            hc.test,
            Some(HealthTest::Url("http://localhost:8080/healthz".into()))
        );
        assert_eq!(hc.timeout, Some(Duration::from_secs(3)));
        assert_eq!(hc.start_period, Some(Duration::from_secs(20)));
        assert_eq!(hc.retries, 3);
    }

    #[test]
    fn cmd_shell_array() {
        let hc = manifest().healthcheck_for("db").unwrap();
        assert_eq!(
            hc.test,
            Some(HealthTest::Shell("pg_isready -U postgres".into()))
        );
        assert_eq!(hc.interval, Some(Duration::from_secs(10)));
        assert_eq!(hc.retries, 5);
    }

    #[test]
    fn output_pattern() {
        let hc = manifest().healthcheck_for("worker").unwrap();
        assert_eq!(hc.output_pattern(), Some("Compiled successfully"));
        assert_eq!(hc.test, None);
    }

    #[test]
    fn healthcheck_false_disables() {
        let hc = manifest().healthcheck_for("migrate").unwrap();
        assert!(hc.is_disabled());
    }

    #[test]
    fn malformed_block_is_no_check() {
        assert_eq!(manifest().healthcheck_for("broken"), None);
    }

    #[test]
    fn missing_service_is_no_check() {
        assert_eq!(manifest().healthcheck_for("nope"), None);
    }

    #[test]
    fn cmd_array_and_none() {
        let args = vec!["CMD".to_string(), "curl".into(), "-f".into()];
        assert_eq!(
            HealthTest::from_args(args),
            Some(HealthTest::Command(vec!["curl".into(), "-f".into()]))
        );
        assert_eq!(
            HealthTest::from_args(vec!["NONE".into()]),
            Some(HealthTest::Disabled)
        );
        assert_eq!(HealthTest::from_args(vec!["CMD".into()]), None);
        assert_eq!(
            HealthTest::from_line("./check.sh".into()),
            Some(HealthTest::Shell("./check.sh".into()))
        );
    }

    #[test]
    fn type_none_overrides_test() {
        let yaml = r#"
services:
  web:
    healthcheck:
      type: none
      test: "http://localhost/health"
"#;
        let m = Manifest::from_yaml_str(yaml).unwrap();
        assert!(m.healthcheck_for("web").unwrap().is_disabled());
    }

    #[test]
    fn invalid_duration_is_dropped_not_fatal() {
        let yaml = r#"
services:
  web:
    healthcheck:
      test: "http://localhost/health"
      interval: whenever
"#;
        let hc = Manifest::from_yaml_str(yaml)
            .unwrap()
            .healthcheck_for("web")
            .unwrap();
        assert_eq!(hc.interval, None);
        assert!(hc.test.is_some());
    }

    #[test]
    fn from_file_reads_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        std::fs::write(&path, MANIFEST).unwrap();
        let m = Manifest::from_file(&path).unwrap();
        assert!(m.services.contains_key("api"));

        let missing = Manifest::from_file(&dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
