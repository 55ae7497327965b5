//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; the binary decides where it goes.

use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ValidationResult};
use crate::planner::{ChangeAction, Plan, ResourceStatus, RunReport, RunStatus};
use crate::reconciler::{DriftReport, DriftStatus, ExportReport};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Resource row for run reports.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Record row for state display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when emitting JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &Plan) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. Infrastructure matches the declaration.\n",
                "✓".green()
            );
        }

        let hasher = ConfigHasher::new();
        let mut output = String::new();
        let _ = writeln!(output, "\nPlan {}\n", hasher.short_hash(&plan.fingerprint).dimmed());

        for change in plan.actionable() {
            let _ = writeln!(
                output,
                "  {} {} {}",
                Self::colored_symbol(&change.action),
                change.name.bold(),
                format!("({})", change.resource_type).dimmed()
            );
            if let ChangeAction::Update(diff) = &change.action {
                for field in &diff.changes {
                    let _ = writeln!(output, "      {field}");
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged.\n",
            plan.create_count().to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.delete_count().to_string().red(),
            plan.unchanged_count()
        );

        output
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &RunReport) -> String {
        let mut output = String::new();

        let headline = match report.status {
            RunStatus::Success => format!("{} Run succeeded", "✓".green()),
            RunStatus::PartialFailure => format!("{} Run partially failed", "✗".red()),
            RunStatus::Aborted => format!("{} Run aborted", "⚠".yellow()),
        };
        let _ = writeln!(output, "\n{headline}\n");

        let rows: Vec<ResourceRow> = report
            .resources
            .iter()
            .filter(|r| r.status != ResourceStatus::NoOp)
            .map(|r| ResourceRow {
                name: r.name.clone(),
                resource_type: r.resource_type.clone(),
                status: Self::colored_status(r.status),
                id: r.provider_id.as_deref().map_or_else(String::new, |id| truncate(id, 24)),
                detail: r.error.as_deref().map_or_else(String::new, |e| truncate(e, 60)),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = writeln!(
            output,
            "\n{} created, {} updated, {} deleted, {} unchanged, {} failed, {} skipped",
            report.count(ResourceStatus::Created),
            report.count(ResourceStatus::Updated),
            report.count(ResourceStatus::Deleted),
            report.count(ResourceStatus::NoOp),
            report.count(ResourceStatus::Failed),
            report.count(ResourceStatus::Skipped)
        );

        if !report.exports.is_empty() || !report.unresolved_exports.is_empty() {
            output.push_str(&Self::format_exports_text(&report.exports, &report.unresolved_exports));
        }

        output
    }

    /// Formats exports read from state.
    #[must_use]
    pub fn format_exports(&self, exports: &ExportReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(exports),
            OutputFormat::Text => Self::format_exports_text(&exports.exports, &exports.unresolved),
        }
    }

    fn format_exports_text(exports: &BTreeMap<String, serde_json::Value>, unresolved: &[String]) -> String {
        let mut output = String::from("\nOutputs:\n");

        if exports.is_empty() && unresolved.is_empty() {
            output.push_str("   (none)\n");
        }
        for (name, value) in exports {
            let shown = value.as_str().map_or_else(|| value.to_string(), ToString::to_string);
            let _ = writeln!(output, "   {} = {shown}", name.bold());
        }
        for name in unresolved {
            let _ = writeln!(output, "   {} = {}", name.bold(), "(unavailable)".dimmed());
        }

        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected; state is converged.\n", "✓".green());
                }

                let mut output = String::new();
                let drifted: Vec<_> = report
                    .resources
                    .iter()
                    .filter(|r| r.status != DriftStatus::InSync)
                    .collect();

                if !drifted.is_empty() {
                    let _ = write!(output, "{} Drift detected:\n\n", "⚠".yellow());
                    for entry in &drifted {
                        let _ = writeln!(output, "   - {}: {}", entry.name, entry.status);
                    }
                    let _ = writeln!(
                        output,
                        "\n{}/{} recorded resources have drifted.",
                        drifted.len(),
                        report.resources.len()
                    );
                }

                if !report.pending_changes.is_empty() {
                    let _ = write!(output, "\n{} Stack file changes not yet applied:\n\n", "⚠".yellow());
                    for name in &report.pending_changes {
                        let _ = writeln!(output, "   - {name}");
                    }
                }

                output
            }
        }
    }

    /// Formats recorded state.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&StateJson {
                state: &state.redacted(),
                lock,
            }),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated.format("%Y-%m-%d %H:%M:%S"));
                let _ = writeln!(output, "   Resources: {}", state.records.len());
                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "   Locked by: {} ({}s left)",
                        lock.holder,
                        lock.remaining_secs()
                    );
                }

                if !state.records.is_empty() {
                    let rows: Vec<RecordRow> = state
                        .records
                        .values()
                        .map(|r| RecordRow {
                            name: r.name.clone(),
                            resource_type: r.resource_type.clone(),
                            id: truncate(&r.provider_id, 24),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if state.has_pending() {
                    let _ = write!(output, "\n{} Unfinished operations:\n", "⚠".yellow());
                    for op in &state.pending {
                        let _ = writeln!(
                            output,
                            "   - {} {} (started {})",
                            op.action,
                            op.resource,
                            op.started_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                    output.push_str("   Verify them, then run `cirrus state clear-pending`.\n");
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let mark = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {mark} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = String::new();

                if result.is_valid() {
                    let _ = writeln!(output, "{} Stack file is valid.", "✓".green());
                } else {
                    let _ = writeln!(output, "{} {} error(s):", "✗".red(), result.error_count());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                if show_warnings && result.warning_count() > 0 {
                    let _ = writeln!(output, "\n{} {} warning(s):", "⚠".yellow(), result.warning_count());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output
            }
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn message(&self, status: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => {
                let mark = match status {
                    "success" => "✓".green(),
                    "error" => "✗".red(),
                    _ => "⚠".yellow(),
                };
                format!("{mark} {message}")
            }
        }
    }

    fn colored_symbol(action: &ChangeAction) -> String {
        match action {
            ChangeAction::Create => "+".green().to_string(),
            ChangeAction::Update(_) => "~".yellow().to_string(),
            ChangeAction::Delete => "-".red().to_string(),
            ChangeAction::NoOp => " ".to_string(),
        }
    }

    fn colored_status(status: ResourceStatus) -> String {
        let text = status.to_string();
        match status {
            ResourceStatus::Created => text.green().to_string(),
            ResourceStatus::Updated => text.yellow().to_string(),
            ResourceStatus::Deleted => text.red().to_string(),
            ResourceStatus::Failed => text.red().bold().to_string(),
            ResourceStatus::Skipped | ResourceStatus::NoOp => text.dimmed().to_string(),
        }
    }
}

#[derive(Serialize)]
struct StateJson<'a> {
    state: &'a StateSnapshot,
    lock: Option<&'a LockInfo>,
}

fn to_json(value: &impl Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// Truncates to `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
