//! Output formatting for CLI commands.
//!
//! Every `format_*` method returns either a human-readable rendering or
//! pretty JSON, depending on `--output`. Rendered output goes to stdout;
//! status messages and logs go to stderr.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write as _;
use std::io::Write as _;
use tabled::{Table, Tabled};

use crate::config::{StackConfig, ValidationResult};
use crate::engine::{ApplyOutcome, ApplyStatus, DriftReport, PlanOutcome};
use crate::graph::ResourceGraph;
use crate::planner::{ActionType, DiffType, OutcomeStatus, Plan, PlannedAction};
use crate::state::{AppliedState, Lifecycle, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Time")]
    time: String,
}

/// Applied resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true in JSON mode.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn json<T: Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|e| {
            serde_json::json!({ "status": "error", "message": e.to_string() }).to_string()
        })
    }

    /// Formats a plan and its diff.
    #[must_use]
    pub fn format_plan(&self, outcome: &PlanOutcome, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(outcome),
            OutputFormat::Text => {
                let mut output = Self::format_plan_text(&outcome.plan);
                if detailed && !outcome.plan.is_empty() {
                    output.push_str("\nChanges:\n");
                    for diff in outcome.diff.actionable_diffs() {
                        let _ = writeln!(
                            output,
                            "  {} {} ({})",
                            Self::format_diff_type(diff.diff_type),
                            diff.name,
                            diff.resource_type
                        );
                        for detail in &diff.details {
                            let marker = if detail.forces_replacement {
                                " # forces replacement".red().to_string()
                            } else {
                                String::new()
                            };
                            let _ = writeln!(
                                output,
                                "      {}: {} -> {}{marker}",
                                detail.field,
                                Self::format_value(detail.old_value.as_ref()),
                                Self::format_value(detail.new_value.as_ref()),
                            );
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Applied state matches the stack.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan\n");
        let _ = write!(output, "   Config hash: {}\n\n", Self::short(&plan.config_hash));

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action(a),
                resource: a.resource_name.clone(),
                resource_type: a.resource_type.clone(),
                after: a
                    .dependencies
                    .iter()
                    .map(|d| (d + 1).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.create_count().saturating_sub(plan.replace_count()).to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.replace_count().to_string().magenta(),
            plan.delete_count().saturating_sub(plan.replace_count()).to_string().red()
        );
        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_apply(&self, outcome: &ApplyOutcome) -> String {
        match self.format {
            OutputFormat::Json => Self::json(outcome),
            OutputFormat::Text => {
                let Some(report) = &outcome.report else {
                    return match outcome.status {
                        ApplyStatus::Declined => String::from("Cancelled. Nothing was changed.\n"),
                        _ => Self::format_plan_text(&outcome.plan),
                    };
                };

                let mut output = String::new();
                let rows: Vec<OutcomeRow> = report
                    .outcomes
                    .iter()
                    .map(|o| OutcomeRow {
                        action: o.action_type.to_string(),
                        resource: o.resource_name.clone(),
                        result: Self::format_outcome(&o.status),
                        attempts: o.attempts,
                        time: format!("{}ms", o.duration_ms),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let headline = if report.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else {
                    format!("{} Apply incomplete", "✗".red())
                };
                let _ = writeln!(
                    output,
                    "\n{headline}: {} applied, {} failed, {} skipped in {}ms",
                    report.applied_count(),
                    report.failed_count(),
                    report.skipped_count(),
                    report.duration_ms
                );

                let failed = report.failed_resources();
                if !failed.is_empty() {
                    let _ = writeln!(
                        output,
                        "{} Failed: {}. Fix the cause and run apply again.",
                        "⚠".yellow(),
                        failed.join(", ")
                    );
                }
                let replaced: Vec<&str> = report
                    .lifecycles
                    .iter()
                    .filter(|(_, l)| **l == Lifecycle::Replaced)
                    .map(|(n, _)| n.as_str())
                    .collect();
                if !replaced.is_empty() {
                    let _ = writeln!(output, "   Replaced: {}", replaced.join(", "));
                }
                if !report.state.deposed.is_empty() {
                    let _ = writeln!(
                        output,
                        "{} {} old instance(s) kept for cleanup on the next apply",
                        "⚠".yellow(),
                        report.state.deposed.len()
                    );
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let mut output = if report.is_converged() {
                    format!(
                        "{} No drift across {} applied resources.\n",
                        "✓".green(),
                        report.checked
                    )
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for entry in &report.drifted {
                        let _ = writeln!(
                            output,
                            "   - {} ({}, {}): {}",
                            entry.name, entry.resource_type, entry.provider_id, entry.kind
                        );
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} resources have drifted.\n",
                        report.drifted.len(),
                        report.checked
                    );
                    output
                };
                if !report.unapplied.is_empty() {
                    let _ = writeln!(output, "   Not yet applied: {}", report.unapplied.join(", "));
                }
                output
            }
        }
    }

    /// Formats the applied state.
    #[must_use]
    pub fn format_state(&self, state: &AppliedState) -> String {
        match self.format {
            OutputFormat::Json => Self::json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.stack, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                if let Some(hash) = &state.config_hash {
                    let _ = writeln!(output, "   Config hash: {}", Self::short(hash));
                }
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);

                if !state.resources.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            name: r.name.clone(),
                            resource_type: r.resource_type.clone(),
                            id: Self::truncate(&r.provider_id, 24),
                            dependencies: r.dependencies.join(", "),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                for deposed in &state.deposed {
                    let _ = writeln!(
                        output,
                        "   {} deposed {} ({}) since {}",
                        "⚠".yellow(),
                        deposed.name,
                        deposed.provider_id,
                        deposed.deposed_at.format("%Y-%m-%d %H:%M")
                    );
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} applied, {} failed, {} skipped)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.applied,
                            entry.failed,
                            entry.skipped
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats the resource graph in topological order.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        #[derive(Serialize)]
        struct Node<'a> {
            level: usize,
            name: &'a str,
            resource_type: &'a str,
            depends_on: Vec<&'a str>,
        }

        let nodes: Vec<Node<'_>> = graph
            .levels()
            .into_iter()
            .enumerate()
            .flat_map(|(level, names)| names.into_iter().map(move |name| (level, name)))
            .filter_map(|(level, name)| {
                graph.get(name).map(|r| Node {
                    level,
                    name,
                    resource_type: &r.resource_type,
                    depends_on: graph.dependencies_of(name),
                })
            })
            .collect();

        match self.format {
            OutputFormat::Json => Self::json(&nodes),
            OutputFormat::Text => {
                let mut output = String::new();
                for node in &nodes {
                    let _ = write!(
                        output,
                        "{}{} {}",
                        "  ".repeat(node.level),
                        node.name.bold(),
                        format!("({})", node.resource_type).as_str().dimmed()
                    );
                    if !node.depends_on.is_empty() {
                        let _ = write!(output, " <- {}", node.depends_on.join(", "));
                    }
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Formats a validation result with a stack summary.
    #[must_use]
    pub fn format_validation(
        &self,
        result: &ValidationResult,
        config: &StackConfig,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result
                    .errors
                    .iter()
                    .map(|e| serde_json::json!({ "field": e.field, "message": e.message }))
                    .collect::<Vec<_>>(),
                "warnings": result.warnings,
                "stack": config.stack.name,
                "environment": config.stack.environment,
                "resources": config.resources.len(),
            })),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Stack is valid\n", "✓".green())
                } else {
                    let mut output =
                        format!("{} {} error(s):\n", "✗".red(), result.error_count());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
                    output
                };
                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                let _ = writeln!(output, "\nStack: {}/{}", config.stack.name, config.stack.environment);
                let _ = writeln!(output, "  Resources: {}", config.resources.len());
                let _ = writeln!(output, "  Type overrides: {}", config.types.len());
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => Self::json(lock),
            OutputFormat::Text => format!("{lock}\n"),
        }
    }

    /// Formats an action type with color.
    fn format_action(action: &PlannedAction) -> String {
        let label = match (action.action_type, action.replacement.is_some()) {
            (ActionType::Create, false) => "+create".green(),
            (ActionType::Create, true) => "+create (replace)".magenta(),
            (ActionType::Update, _) => "~update".yellow(),
            (ActionType::Delete, false) => "-delete".red(),
            (ActionType::Delete, true) => "-delete (replace)".magenta(),
        };
        if action.deposed {
            format!("{label} deposed")
        } else {
            label.to_string()
        }
    }

    fn format_diff_type(diff_type: DiffType) -> String {
        match diff_type {
            DiffType::Create => "+".green().to_string(),
            DiffType::Update => "~".yellow().to_string(),
            DiffType::Replace => "-/+".magenta().to_string(),
            DiffType::Delete => "-".red().to_string(),
            DiffType::NoChange => " ".to_string(),
        }
    }

    fn format_outcome(status: &OutcomeStatus) -> String {
        match status {
            OutcomeStatus::Applied => "applied".green().to_string(),
            OutcomeStatus::Failed(reason) => {
                format!("{} {}", "failed:".red(), Self::truncate(reason, 60))
            }
            OutcomeStatus::Skipped(reason) => {
                format!("{} {}", "skipped:".dimmed(), Self::truncate(reason, 60))
            }
        }
    }

    fn format_value(value: Option<&serde_json::Value>) -> String {
        value.map_or_else(|| String::from("(none)"), |v| Self::truncate(&v.to_string(), 40))
    }

    fn short(hash: &str) -> &str {
        hash.get(..8).unwrap_or(hash)
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Writes rendered output to stdout.
    pub fn emit(&self, rendered: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(rendered.as_bytes());
        if !rendered.ends_with('\n') {
            let _ = stdout.write_all(b"\n");
        }
    }

    /// Prints a success message.
    pub fn success(&self, message: &str) {
        self.message("success", &format!("{} {message}", "✓".green()), message);
    }

    /// Prints an error message.
    pub fn error(&self, message: &str) {
        self.message("error", &format!("{} {message}", "✗".red()), message);
    }

    /// Prints a warning message.
    pub fn warning(&self, message: &str) {
        self.message("warning", &format!("{} {message}", "⚠".yellow()), message);
    }

    fn message(&self, status: &str, text: &str, message: &str) {
        match self.format {
            OutputFormat::Json => {
                self.emit(&Self::json(&serde_json::json!({ "status": status, "message": message })));
            }
            OutputFormat::Text => {
                let _ = writeln!(std::io::stderr(), "{text}");
            }
        }
    }
}
