// Report Rendering
// Renders a job set summary as terminal text, JUnit XML or TAP

use crate::summary::{format_duration, Summary};

use std::fmt;

/// Placeholder in report file name templates
pub const STATUS_PLACEHOLDER: &str = "%{status}";

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Human-readable terminal output
    Terminal,
    /// JUnit XML format (for CI systems)
    JUnit,
    /// TAP (Test Anything Protocol) format
    Tap,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Terminal => write!(f, "terminal"),
            ReportFormat::JUnit => write!(f, "junit"),
            ReportFormat::Tap => write!(f, "tap"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "terminal" | "text" | "console" => Ok(ReportFormat::Terminal),
            "junit" | "junit-xml" | "xml" => Ok(ReportFormat::JUnit),
            "tap" => Ok(ReportFormat::Tap),
            _ => Err(format!(
                "Unknown report format '{}'. Valid formats: terminal, junit, tap",
                s
            )),
        }
    }
}

/// Render `summary` in the given format
pub fn render(summary: &Summary, format: ReportFormat) -> String {
    match format {
        ReportFormat::Terminal => to_terminal(summary),
        ReportFormat::JUnit => to_junit_xml(summary),
        ReportFormat::Tap => to_tap(summary),
    }
}

/// Substitute `%{status}` with `PASS` or `FAIL`
pub fn report_filename(template: &str, passed: bool) -> String {
    template.replace(STATUS_PLACEHOLDER, if passed { "PASS" } else { "FAIL" })
}

fn suite_name(summary: &Summary) -> String {
    let repo = &summary.repository;
    match (repo.url.is_empty(), repo.commit.is_empty()) {
        (false, false) => format!("{} ({})", repo.url, repo.commit),
        (false, true) => repo.url.clone(),
        _ => summary
            .job_set
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| summary.job_set.display().to_string()),
    }
}

fn total_secs(summary: &Summary) -> f64 {
    summary
        .duration()
        .and_then(|d| d.to_std().ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn job_secs(duration: chrono::Duration) -> f64 {
    duration.to_std().map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

fn failure_message(job: &crate::summary::JobSummary) -> String {
    match (&job.failure, job.exit_status) {
        (Some(failure), _) => failure.clone(),
        (None, Some(code)) => format!("exited with status {}", code),
        (None, None) => "failed".to_string(),
    }
}

/// Generate JUnit XML output, one test case per job
pub fn to_junit_xml(summary: &Summary) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let total = summary.jobs.len();
    let failed = summary.failed_count();
    let secs = total_secs(summary);

    xml.push_str(&format!(
        "<testsuites tests=\"{}\" failures=\"{}\" errors=\"0\" time=\"{:.3}\">\n",
        total, failed, secs
    ));
    xml.push_str(&format!(
        "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"0\" time=\"{:.3}\">\n",
        xml_escape(&suite_name(summary)),
        total,
        failed,
        secs
    ));

    for job in &summary.jobs {
        xml.push_str(&format!(
            "    <testcase name=\"#{} {}\" time=\"{:.3}\"",
            job.ordinal,
            xml_escape(&job.environment),
            job_secs(job.duration)
        ));

        if job.passed() {
            xml.push_str(" />\n");
        } else {
            xml.push_str(">\n");
            xml.push_str(&format!(
                "      <failure message=\"{}\">log: {}</failure>\n",
                xml_escape(&failure_message(job)),
                xml_escape(&job.log_path.display().to_string())
            ));
            xml.push_str("    </testcase>\n");
        }
    }

    xml.push_str("  </testsuite>\n");
    xml.push_str("</testsuites>\n");
    xml
}

/// Generate TAP version 13 output
pub fn to_tap(summary: &Summary) -> String {
    let mut tap = String::new();
    tap.push_str("TAP version 13\n");
    tap.push_str(&format!("1..{}\n", summary.jobs.len()));

    for job in &summary.jobs {
        if job.passed() {
            tap.push_str(&format!("ok {} - {}\n", job.ordinal, job.environment));
        } else {
            tap.push_str(&format!("not ok {} - {}\n", job.ordinal, job.environment));
            tap.push_str("  ---\n");
            tap.push_str(&format!(
                "  duration_ms: {}\n",
                job.duration.num_milliseconds().max(0)
            ));
            tap.push_str(&format!("  message: \"{}\"\n", failure_message(job)));
            tap.push_str(&format!("  log: \"{}\"\n", job.log_path.display()));
            tap.push_str("  ...\n");
        }
    }

    tap.push_str(&format!(
        "# tests {}\n# pass {}\n# fail {}\n# duration {:.3}s\n",
        summary.jobs.len(),
        summary.passed_count(),
        summary.failed_count(),
        total_secs(summary)
    ));
    tap
}

/// Generate human-readable terminal output
pub fn to_terminal(summary: &Summary) -> String {
    let mut out = String::new();
    let repo = &summary.repository;

    out.push_str(&format!("\nJob set: {}\n", summary.job_set.display()));
    if !repo.url.is_empty() {
        out.push_str(&format!("Repository: {}\n", repo.url));
    }
    if !repo.commit.is_empty() {
        out.push_str(&format!("Commit: {} {}\n", repo.commit, repo.subject));
        out.push_str(&format!("Author: {} <{}>\n", repo.author, repo.author_email));
    }
    out.push_str(&"=".repeat(60));
    out.push('\n');

    for job in &summary.jobs {
        let (symbol, status) = if job.passed() {
            ("+", "PASS")
        } else {
            ("x", "FAIL")
        };
        out.push_str(&format!(
            "  [{}] {} #{} ({}) {}\n",
            symbol,
            status,
            job.ordinal,
            format_duration(job.duration),
            job.environment,
        ));
        if !job.passed() {
            out.push_str(&format!("       {}\n", failure_message(job)));
            out.push_str(&format!("       log: {}\n", job.log_path.display()));
        }
    }

    out.push_str(&"-".repeat(60));
    out.push('\n');

    let duration = summary
        .duration()
        .map(format_duration)
        .unwrap_or_else(|| "0 sec".to_string());
    let status_line = if summary.passed {
        format!("  {}: all {} jobs passed in {}", summary.status_label(), summary.jobs.len(), duration)
    } else {
        format!(
            "  {}: {} of {} jobs failed in {}",
            summary.status_label(),
            summary.failed_count(),
            summary.jobs.len(),
            duration
        )
    };
    out.push_str(&status_line);
    out.push_str("\n\n");
    out
}

/// Escape special XML characters
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
