//! Output formatting for CLI commands.
//!
//! Text output uses colored tables; JSON output is meant for scripting.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, DeclarationConfig, ValidationResult};
use crate::graph::ValidatedGraph;
use crate::planner::{ActionType, ApplyReport, Plan, PlanStep, ReplacePhase};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Outputs")]
    outputs: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Hash")]
    hash: String,
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
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson::from(plan)),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!("{} No changes. Recorded state matches the declarations.\n", "✓".green());
        }

        let mut output = String::new();
        let _ = write!(
            output,
            "\nPlan\n   Declaration hash: {}\n   State hash: {}\n\n",
            ConfigHasher::new().short_hash(&plan.declaration_hash),
            ConfigHasher::new().short_hash(&plan.state_hash)
        );

        let rows: Vec<PlanStepRow> = plan
            .steps
            .iter()
            .map(|step| PlanStepRow {
                index: step.index,
                action: Self::format_action(step),
                resource: step.resource.to_string(),
                after: step
                    .dependencies
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                reason: Self::truncate(&step.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for step in plan.steps.iter().filter(|s| !s.changes.is_empty()) {
                let _ = writeln!(output, "   {}", step.description());
                for change in &step.changes {
                    let _ = writeln!(output, "      {change}");
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.delete.to_string().red()
        );
        output
    }

    /// Formats the outcome of an apply or destroy run.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let status = if report.cancelled {
                    format!("{} Run cancelled", "⚠".yellow())
                } else if report.success() {
                    format!("{} Run complete", "✓".green())
                } else {
                    format!("{} Run finished with failures", "✗".red())
                };

                let mut output = format!("{status}\n   {report}\n");

                if !report.failed.is_empty() {
                    let _ = write!(output, "\n{}:\n", "Failed".red());
                    for failed in &report.failed {
                        let _ = writeln!(
                            output,
                            "   - {} {} after {} attempt(s): {}",
                            failed.action, failed.resource, failed.attempts, failed.error
                        );
                    }
                }
                if !report.skipped.is_empty() {
                    let _ = write!(output, "\n{}:\n", "Skipped".yellow());
                    for skipped in &report.skipped {
                        let _ = writeln!(
                            output,
                            "   - {} {}: {}",
                            skipped.action, skipped.resource, skipped.reason
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats recorded state.
    #[must_use]
    pub fn format_state(&self, snapshot: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        let mut records: Vec<_> = snapshot.values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        match self.format {
            OutputFormat::Json => to_json(&StateJson { lock, records }),
            OutputFormat::Text => {
                let mut output = String::new();
                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "{} Locked by {} ({}s remaining, id {})\n",
                        "⚠".yellow(),
                        lock.holder,
                        lock.remaining_secs(),
                        lock.lock_id
                    );
                }
                if records.is_empty() {
                    output.push_str("No resources recorded.\n");
                    return output;
                }

                let rows: Vec<RecordRow> = records
                    .iter()
                    .map(|record| RecordRow {
                        resource: if record.deposed.is_some() {
                            format!("{} {}", record.id, "(deposed pending)".yellow())
                        } else {
                            record.id.to_string()
                        },
                        outputs: Self::truncate(
                            &record.outputs.keys().cloned().collect::<Vec<_>>().join(","),
                            30,
                        ),
                        dependencies: record
                            .dependencies
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(","),
                        hash: ConfigHasher::new().short_hash(&record.declaration_hash),
                        updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                let _ = write!(output, "\n\n{} resource(s) recorded.\n", records.len());
                output
            }
        }
    }

    /// Formats the declared graph in topological order.
    #[must_use]
    pub fn format_graph(&self, graph: &ValidatedGraph) -> String {
        let nodes: Vec<GraphNodeJson> = graph
            .topological_order()
            .iter()
            .map(|&node| GraphNodeJson {
                resource: graph.graph().resource(node).id.to_string(),
                depends_on: graph
                    .graph()
                    .dependency_ids(node)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            })
            .collect();

        match self.format {
            OutputFormat::Json => to_json(&nodes),
            OutputFormat::Text => {
                let mut output = String::new();
                for node in &nodes {
                    if node.depends_on.is_empty() {
                        let _ = writeln!(output, "{}", node.resource.bold());
                    } else {
                        let _ = writeln!(
                            output,
                            "{} <- {}",
                            node.resource.bold(),
                            node.depends_on.join(", ")
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats a validation result with a summary of the declarations.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &DeclarationConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ValidationJson {
                valid: result.is_valid(),
                errors: result
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect(),
                warnings: &result.warnings,
                resources: config.resource_count(),
            }),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Declarations are valid", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Declarations are invalid:", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                let _ = write!(
                    output,
                    "\n   Project: {}\n   Environment: {}\n   Resources: {}\n",
                    config.project.name,
                    config.project.environment,
                    config.resource_count()
                );
                output
            }
        }
    }

    /// Formats an action with color.
    fn format_action(step: &PlanStep) -> String {
        let label = match step.action {
            ActionType::Create => "+create".green(),
            ActionType::Update => "~update".yellow(),
            ActionType::Replace(ReplacePhase::Create) => "+/-create".magenta(),
            ActionType::Replace(ReplacePhase::Destroy) => "-/+destroy".magenta(),
            ActionType::Delete => "-delete".red(),
        };
        if step.deposed {
            format!("{label} (deposed)")
        } else {
            label.to_string()
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

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct PlanJson<'a> {
    declaration_hash: &'a str,
    state_hash: &'a str,
    summary: crate::planner::PlanSummary,
    steps: Vec<StepJson<'a>>,
}

#[derive(Serialize)]
struct StepJson<'a> {
    index: usize,
    action: ActionType,
    resource: String,
    deposed: bool,
    reason: &'a str,
    changes: Vec<String>,
    after: &'a [usize],
}

impl<'a> From<&'a Plan> for PlanJson<'a> {
    fn from(plan: &'a Plan) -> Self {
        Self {
            declaration_hash: &plan.declaration_hash,
            state_hash: &plan.state_hash,
            summary: plan.summary(),
            steps: plan
                .steps
                .iter()
                .map(|step| StepJson {
                    index: step.index,
                    action: step.action,
                    resource: step.resource.to_string(),
                    deposed: step.deposed,
                    reason: &step.reason,
                    changes: step.changes.iter().map(ToString::to_string).collect(),
                    after: &step.dependencies,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct StateJson<'a> {
    lock: Option<&'a LockInfo>,
    records: Vec<&'a crate::state::StateRecord>,
}

#[derive(Serialize)]
struct GraphNodeJson {
    resource: String,
    depends_on: Vec<String>,
}

#[derive(Serialize)]
struct ValidationJson<'a> {
    valid: bool,
    errors: Vec<String>,
    warnings: &'a [String],
    resources: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::{CycleChecker, GraphBuilder, Resource, ResourceId};

    fn graph() -> ValidatedGraph {
        let graph = GraphBuilder::new()
            .resource(Resource::new(ResourceId::new("network", "main")))
            .resource(
                Resource::new(ResourceId::new("subnet", "a")).with_reference(
                    "network_id",
                    ResourceId::new("network", "main"),
                    "id",
                ),
            )
            .build()
            .unwrap();
        CycleChecker::new().check(graph).unwrap()
    }

    #[test]
    fn test_graph_json_lists_dependencies() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&formatter.format_graph(&graph())).unwrap();

        assert_eq!(value[0]["resource"], "network.main");
        assert_eq!(value[1]["depends_on"][0], "network.main");
    }

    #[test]
    fn test_empty_plan_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let plan = Plan {
            created_at: chrono::Utc::now(),
            declaration_hash: String::from("abc"),
            state_hash: String::from("def"),
            steps: Vec::new(),
        };
        assert!(formatter.format_plan(&plan, false).contains("No changes"));
    }

    #[test]
    fn test_validation_json() {
        let config = ConfigParser::new()
            .parse_yaml("project:\n  name: platform\n", None)
            .unwrap();
        let result = crate::config::ConfigValidator::new().collect(&config);
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let value: serde_json::Value =
            serde_json::from_str(&formatter.format_validation(&config, &result, true)).unwrap();

        assert_eq!(value["valid"], true);
        assert_eq!(value["resources"], 0);
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghijkl", 8), "abcde...");
    }
}
