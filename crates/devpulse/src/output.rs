//! Report rendering for stdout.

use std::fmt::Write as _;

use clap::ValueEnum;
use devpulse_health::{CheckResult, HealthReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn render(report: &HealthReport, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Text => Ok(render_text(report)),
    }
}

fn render_text(report: &HealthReport) -> String {
    let mut out = String::new();
    let summary = &report.summary;
    let _ = writeln!(
        out,
        "{} ({}): {} healthy, {} degraded, {} unhealthy, {} unknown",
        report.project,
        summary.overall,
        summary.healthy,
        summary.degraded,
        summary.unhealthy,
        summary.unknown,
    );
    if report.services.is_empty() {
        out.push_str("  no services\n");
    }
    for result in &report.services {
        out.push_str(&row(result));
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn row(result: &CheckResult) -> String {
    let mut line = format!(
        "  {:<20} {:<10} {:<8} {:>6}ms",
        result.service_name,
        result.status,
        result.check_type,
        result.response_time.as_millis(),
    );
    if let Some(endpoint) = &result.endpoint {
        let _ = write!(line, "  {endpoint}");
    }
    if let Some(error) = &result.error {
        let _ = write!(line, "  ({error})");
    }
    line
}

#[cfg(test)]
mod tests {
    use devpulse_health::{CheckKind, HealthStatus};

    use super::*;

    #[test]
    fn text_lists_every_service() {
        let api = CheckResult::new("api", HealthStatus::Healthy, CheckKind::Http);
        let worker =
            CheckResult::new("worker", HealthStatus::Unhealthy, CheckKind::Process).with_error("process 42 not running");
        let report = HealthReport::new("shop", vec![api, worker]);

        let text = render(&report, OutputFormat::Text).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("shop (unhealthy): 1 healthy"));
        assert!(lines[1].contains("api"));
        assert!(lines[2].ends_with("(process 42 not running)"));
    }

    #[test]
    fn json_is_the_report() {
        let report = HealthReport::new("shop", Vec::new());
        let json: serde_json::Value = serde_json::from_str(&render(&report, OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["project"], "shop");
        assert_eq!(json["summary"]["total"], 0);
    }
}
