//! Console output for the bootstrap CLI.

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::diagnostics::{DiagnosticFinding, DiagnosticSummary, FindingStatus};
use crate::health::{HealthState, HealthStatus};
use crate::state::{BootstrapStep, StepStatus};

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a progress step with step number.
pub fn print_progress_step(current: usize, total: usize, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a check result.
pub fn print_check_result(name: &str, passed: bool, message: Option<&str>) {
    let status = if passed { "✓".green() } else { "✗".red() };

    let text = if let Some(msg) = message {
        format!("{name} - {msg}")
    } else {
        name.to_string()
    };

    println!("  {status} {text}");
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Spinner for a long wait; call `finish_and_clear` when done.
#[must_use]
pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("  {spinner:.cyan} {msg} {elapsed:.dim}") {
        bar.set_style(style);
    }
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Print one line per step with its status and duration.
pub fn print_step_summary(steps: &[BootstrapStep]) {
    for step in steps {
        let marker = match step.status {
            StepStatus::Completed if step.skipped => "↷".bright_black(),
            StepStatus::Completed => "✓".green(),
            StepStatus::Failed => "✗".red(),
            StepStatus::Running => "▶".cyan(),
            StepStatus::Pending => "·".bright_black(),
        };
        let duration = step
            .duration()
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_default();
        let note = if step.skipped {
            " (already done)".bright_black().to_string()
        } else {
            String::new()
        };
        println!("  {marker} {:<24} {:>8}{note}", step.name, duration.bright_black());
        if let Some(error) = &step.error {
            println!("      {}", error.red());
        }
    }
}

/// Print diagnostic findings grouped by status, then the totals.
pub fn print_findings(findings: &[DiagnosticFinding]) {
    for finding in findings {
        let marker = match finding.status {
            FindingStatus::Healthy => "✓".green(),
            FindingStatus::Warning => "⚠".yellow(),
            FindingStatus::Error => "✗".red(),
        };
        println!("  {marker} {:<36} {}", finding.component, finding.message);
    }

    let summary = DiagnosticSummary::from_findings(findings);
    println!();
    println!(
        "  {} healthy, {} warnings, {} errors",
        summary.healthy.to_string().green(),
        summary.warnings.to_string().yellow(),
        summary.errors.to_string().red()
    );
}

/// Print a health report.
pub fn print_health(status: &HealthStatus) {
    for (component, state) in status.components() {
        let detail = status.details().get(component).map(String::as_str);
        print_check_result(component, *state == HealthState::Healthy, detail);
    }
    println!();
    let overall = format!("{} is {}", status.cluster(), status.overall());
    match status.overall() {
        HealthState::Healthy => print_success(&overall),
        HealthState::Warning | HealthState::Unknown => print_warning(&overall),
        HealthState::Unhealthy => print_error(&overall),
    }
}
