//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationReport;
use crate::planner::{OperationKind, Plan};
use crate::reconciler::{ApplyReport, DriftReport};
use crate::state::{ApplyStatus, LockInfo, ResourceState, StateStore};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanOperationRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Graph row for table display.
#[derive(Tabled)]
struct GraphRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Waits for")]
    waits_for: String,
}

/// Resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Status")]
    status: String,
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

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!("{} No changes required - state is converged.\n", "✓".green());
        }

        let mut output = String::from("\nExecution Plan\n\n");

        let rows: Vec<PlanOperationRow> = plan
            .changes()
            .enumerate()
            .map(|(i, op)| PlanOperationRow {
                index: i + 1,
                action: Self::format_kind(op.kind),
                resource: format!("{} ({})", op.resource, op.resource_type),
                reason: Self::truncate(&op.reason, 50),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for op in plan.changes().filter(|op| !op.delta.is_empty()) {
                let _ = write!(output, "\n{} {}:\n", Self::format_kind(op.kind), op.resource);
                for line in op.delta.to_string().lines() {
                    let _ = writeln!(output, "    {line}");
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            plan.count(OperationKind::Create).to_string().green(),
            plan.count(OperationKind::Update).to_string().yellow(),
            plan.count(OperationKind::Replace).to_string().yellow(),
            plan.count(OperationKind::Destroy).to_string().red()
        );

        output
    }

    /// Formats the execution order of a plan with each operation's
    /// dependencies.
    #[must_use]
    pub fn format_graph(&self, plan: &Plan) -> String {
        if self.format == OutputFormat::Json {
            let nodes: Vec<GraphNodeJson> = plan
                .operations()
                .iter()
                .map(|op| GraphNodeJson {
                    resource: op.resource.clone(),
                    kind: op.kind,
                    waits_for: Self::dependency_names(plan, &op.depends_on),
                })
                .collect();
            return to_json(&nodes);
        }

        if plan.operations().is_empty() {
            return String::from("No resources tracked.\n");
        }

        let rows: Vec<GraphRow> = plan
            .operations()
            .iter()
            .enumerate()
            .map(|(i, op)| GraphRow {
                index: i + 1,
                resource: op.resource.clone(),
                action: Self::format_kind(op.kind),
                waits_for: Self::dependency_names(plan, &op.depends_on).join(", "),
            })
            .collect();
        format!("{}\n", Table::new(rows))
    }

    fn dependency_names(plan: &Plan, depends_on: &[usize]) -> Vec<String> {
        depends_on
            .iter()
            .filter_map(|index| plan.get(*index))
            .map(|op| op.resource.clone())
            .collect()
    }

    /// Formats a validation report.
    #[must_use]
    pub fn format_validation(
        &self,
        report: &ValidationReport,
        resources: usize,
        show_warnings: bool,
    ) -> String {
        let warnings: &[String] = if show_warnings { &report.warnings } else { &[] };

        if self.format == OutputFormat::Json {
            let errors: Vec<String> = report.errors.iter().map(ToString::to_string).collect();
            return to_json(&serde_json::json!({
                "valid": report.is_valid(),
                "resources": resources,
                "errors": errors,
                "warnings": warnings,
            }));
        }

        let mut output = String::new();
        if report.is_valid() {
            let _ = writeln!(
                output,
                "{} Configuration is valid ({resources} resources).",
                "✓".green()
            );
        } else {
            let _ = writeln!(
                output,
                "{} Configuration has {} errors:",
                "✗".red(),
                report.errors.len()
            );
            for error in &report.errors {
                let _ = writeln!(output, "   - {error}");
            }
        }

        if !warnings.is_empty() {
            let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
            for warning in warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }
        output
    }

    /// Formats the resources tracked in state.
    #[must_use]
    pub fn format_state(&self, store: &StateStore, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&store.document()),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState ({} backend, serial {})\n\n",
                    store.backend_type(),
                    store.serial()
                );
                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "   {} Locked by {} for {} (id {}, expires in {}s)\n",
                        "⚠".yellow(),
                        lock.holder,
                        lock.purpose,
                        lock.lock_id,
                        lock.remaining_secs()
                    );
                }

                if store.is_empty() {
                    output.push_str("   No resources tracked.\n");
                    return output;
                }

                let rows: Vec<ResourceRow> = store
                    .resources()
                    .map(|state| ResourceRow {
                        name: state.name.clone(),
                        resource_type: state.resource_type.clone(),
                        status: Self::format_status(state.status),
                        id: state
                            .identifier
                            .as_deref()
                            .map_or_else(|| String::from("-"), |id| Self::truncate(id, 40)),
                        updated: state.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let history = store.history();
                if !history.is_empty() {
                    let _ = writeln!(output, "\n   Recent runs ({}):", history.len());
                    for entry in history.iter().rev().take(5) {
                        let status = if entry.success() { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} applied, {} failed{}",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.applied.len(),
                            entry.failed.len(),
                            if entry.cancelled { ", cancelled" } else { "" }
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the persisted state of one resource.
    #[must_use]
    pub fn format_resource(&self, state: &ResourceState) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(output, "\n{} ({})\n\n", state.name.bold(), state.resource_type);
                let _ = writeln!(output, "   Status: {}", Self::format_status(state.status));
                let _ = writeln!(
                    output,
                    "   ID: {}",
                    state.identifier.as_deref().unwrap_or("-")
                );
                if !state.depends_on.is_empty() {
                    let deps: Vec<&str> = state.depends_on.iter().map(String::as_str).collect();
                    let _ = writeln!(output, "   Depends on: {}", deps.join(", "));
                }
                if let Some(pending) = &state.pending {
                    let _ = writeln!(
                        output,
                        "   {} Unconfirmed {} started {} (token {})",
                        "⚠".yellow(),
                        pending.kind,
                        pending.started_at.format("%Y-%m-%d %H:%M:%S"),
                        pending.token.as_str()
                    );
                }
                let _ = writeln!(output, "   Updated: {}", state.updated_at);

                match &state.prior {
                    Some(prior) => {
                        output.push_str("\n   Attributes:\n");
                        for (name, value) in prior {
                            let _ = writeln!(output, "     {name} = {value}");
                        }
                    }
                    None => output.push_str("\n   Never applied.\n"),
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!("{} No drift detected - state is converged.\n", "✓".green())
                } else {
                    format!("{} {report}", "⚠".yellow())
                }
            }
        }
    }

    /// Formats an apply report.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let status = if report.is_complete() {
                    format!("{} Apply complete", "✓".green())
                } else if report.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply incomplete", "✗".red())
                };
                format!("{status}: {}\n\n{report}", report.summary())
            }
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn message(&self, level: MessageLevel, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "status": level.as_str(),
                "message": message,
            })),
            OutputFormat::Text => {
                let marker = match level {
                    MessageLevel::Success => "✓".green(),
                    MessageLevel::Warning => "⚠".yellow(),
                    MessageLevel::Error => "✗".red(),
                };
                format!("{marker} {message}")
            }
        }
    }

    fn format_kind(kind: OperationKind) -> String {
        match kind {
            OperationKind::Create => "+create".green().to_string(),
            OperationKind::Update => "~update".yellow().to_string(),
            OperationKind::Replace => "-/+replace".yellow().to_string(),
            OperationKind::Destroy => "-destroy".red().to_string(),
            OperationKind::NoOp => "noop".dimmed().to_string(),
        }
    }

    fn format_status(status: ApplyStatus) -> String {
        match status {
            ApplyStatus::Applied => status.to_string().green().to_string(),
            ApplyStatus::InProgress => status.to_string().yellow().to_string(),
            ApplyStatus::Failed => status.to_string().red().to_string(),
            ApplyStatus::Pending => status.to_string().dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

/// Severity of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    /// The command succeeded.
    Success,
    /// Something needs attention.
    Warning,
    /// The command failed.
    Error,
}

impl MessageLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(serde::Serialize)]
struct GraphNodeJson {
    resource: String,
    kind: OperationKind,
    waits_for: Vec<String>,
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::reconciler::{FailedOperation, ResourceDrift};

    fn text() -> OutputFormatter {
        colored::control::set_override(false);
        OutputFormatter::new(OutputFormat::Text)
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a-long-identifier", 10), "a-long-...");
    }

    #[test]
    fn test_empty_plan() {
        let plan = Plan::new(Vec::new()).unwrap();
        assert!(text().format_plan(&plan, true).contains("No changes required"));

        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan, false);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["operations"], serde_json::json!([]));
    }

    #[test]
    fn test_validation_output() {
        let report = ValidationReport {
            errors: vec![ConfigError::DuplicateName {
                name: String::from("vm1"),
            }],
            warnings: vec![String::from("careful")],
        };
        let output = text().format_validation(&report, 2, false);
        assert!(output.contains("1 errors"));
        assert!(output.contains("Duplicate resource name: vm1"));
        assert!(!output.contains("careful"));
        assert!(text().format_validation(&report, 2, true).contains("careful"));
    }

    #[test]
    fn test_state_output() {
        let mut store = StateStore::in_memory();
        store.set_desired("vm1", "virtual_machine", crate::value::Block::new()).unwrap();
        let output = text().format_state(&store, None);
        assert!(output.contains("memory backend"));
        assert!(output.contains("vm1"));

        let state = store.get("vm1").unwrap();
        assert!(text().format_resource(state).contains("Never applied"));
    }

    #[test]
    fn test_reports() {
        let drift = DriftReport {
            resources: vec![ResourceDrift {
                resource: String::from("vm1"),
                drifted: vec![String::from("vm_size")],
                vanished: false,
            }],
            errors: Vec::new(),
        };
        assert!(text().format_drift(&drift).contains("vm_size"));
        assert!(text().format_drift(&DriftReport::default()).contains("No drift"));

        let apply = ApplyReport {
            failed: vec![FailedOperation {
                resource: String::from("vm1"),
                kind: OperationKind::Create,
                error: String::from("quota exceeded"),
            }],
            ..ApplyReport::default()
        };
        let output = text().format_apply(&apply);
        assert!(output.contains("Apply incomplete"));
        assert!(output.contains("quota exceeded"));
    }

    #[test]
    fn test_json_message() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let json = formatter.message(MessageLevel::Warning, "state is locked");
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["status"], "warning");
    }
}
