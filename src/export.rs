//! CSV, Markdown and JSON renderings of a task list

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::models::{Priority, Task, TaskStatus};
use crate::query::parse_date;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Csv,
    Markdown,
    Json,
}

impl Format {
    pub fn parse(s: &str) -> Option<Format> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Some(Format::Csv),
            "markdown" | "md" => Some(Format::Markdown),
            "json" => Some(Format::Json),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Markdown => "md",
            Format::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Format::Csv => "text/csv; charset=utf-8",
            Format::Markdown => "text/markdown; charset=utf-8",
            Format::Json => "application/json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateStyle {
    Iso,
    #[default]
    Short,
    Long,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub include_headers: bool,
    pub include_description: bool,
    pub include_tags: bool,
    /// Points column and field
    pub include_metadata: bool,
    pub date_style: DateStyle,
    pub separator: char,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_headers: true,
            include_description: true,
            include_tags: true,
            include_metadata: true,
            date_style: DateStyle::default(),
            separator: ',',
        }
    }
}

pub fn render(tasks: &[Task], format: Format, opts: &ExportOptions, now: DateTime<Utc>) -> String {
    match format {
        Format::Csv => to_csv(tasks, opts),
        Format::Markdown => to_markdown(tasks, opts, now),
        Format::Json => to_json(tasks, opts, now),
    }
}

/// One row per task. An empty list renders as an empty string.
pub fn to_csv(tasks: &[Task], opts: &ExportOptions) -> String {
    if tasks.is_empty() {
        return String::new();
    }
    let sep = opts.separator.to_string();
    let columns = columns(opts);

    let mut lines = Vec::with_capacity(tasks.len() + 1);
    if opts.include_headers {
        let headers: Vec<&str> = columns.iter().map(|c| c.header).collect();
        lines.push(headers.join(&sep));
    }
    for task in tasks {
        let row: Vec<String> = columns
            .iter()
            .map(|c| escape_csv((c.value)(task, opts), opts.separator))
            .collect();
        lines.push(row.join(&sep));
    }
    lines.join("\n")
}

struct Column {
    header: &'static str,
    value: fn(&Task, &ExportOptions) -> String,
}

fn columns(opts: &ExportOptions) -> Vec<Column> {
    let mut columns = vec![
        Column {
            header: "ID",
            value: |t, _| t.id.clone(),
        },
        Column {
            header: "Title",
            value: |t, _| t.title.clone(),
        },
    ];
    if opts.include_description {
        columns.push(Column {
            header: "Description",
            value: |t, _| t.description.clone().unwrap_or_default(),
        });
    }
    if opts.include_tags {
        columns.push(Column {
            header: "Tags",
            value: |t, _| t.tags.join("; "),
        });
    }
    columns.extend([
        Column {
            header: "Status",
            value: |t, _| t.status.label().to_string(),
        },
        Column {
            header: "Priority",
            value: |t, _| t.priority.label().to_string(),
        },
        Column {
            header: "Assignee",
            value: |t, _| t.assignee.clone().unwrap_or_default(),
        },
        Column {
            header: "Due Date",
            value: |t, o| format_date(t.due_date.as_deref(), o.date_style),
        },
        Column {
            header: "Created At",
            value: |t, o| format_date(Some(&t.created_at), o.date_style),
        },
        Column {
            header: "Updated At",
            value: |t, o| format_date(Some(&t.updated_at), o.date_style),
        },
    ]);
    if opts.include_metadata {
        columns.push(Column {
            header: "Points",
            value: |t, _| t.points.map(|p| p.to_string()).unwrap_or_else(|| "0".into()),
        });
    }
    columns
}

/// RFC 4180 quoting: fields containing the separator, a quote or a line break are quoted
pub fn escape_csv(value: String, separator: char) -> String {
    if value.contains(separator) || value.contains('"') || value.contains('\n') || value.contains('\r')
    {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value
    }
}

pub fn to_markdown(tasks: &[Task], opts: &ExportOptions, now: DateTime<Utc>) -> String {
    if tasks.is_empty() {
        return "# No Tasks Found\n\nNo tasks available for export.".to_string();
    }

    let mut md = String::from("# Task Export\n\n");
    let _ = writeln!(md, "**Total Tasks:** {}", tasks.len());
    let _ = writeln!(md, "**Export Date:** {}\n", now.format("%Y-%m-%d %H:%M UTC"));

    md.push_str("### Summary\n\n");
    let by_status: Vec<(&str, usize)> = TaskStatus::all()
        .iter()
        .map(|&s| (s.label(), tasks.iter().filter(|t| t.status == s).count()))
        .collect();
    summary_table(&mut md, "Status", &by_status, tasks.len());

    let by_priority: Vec<(&str, usize)> = Priority::all()
        .iter()
        .map(|&p| (p.label(), tasks.iter().filter(|t| t.priority == p).count()))
        .collect();
    summary_table(&mut md, "Priority", &by_priority, tasks.len());

    let mut assignees: BTreeMap<&str, usize> = BTreeMap::new();
    for task in tasks {
        let name = task.assignee.as_deref().filter(|a| !a.is_empty()).unwrap_or("Unassigned");
        *assignees.entry(name).or_default() += 1;
    }
    let by_assignee: Vec<(&str, usize)> = assignees.into_iter().collect();
    summary_table(&mut md, "Assignee", &by_assignee, tasks.len());

    md.push_str("\n## Task Details\n\n");
    for (index, task) in tasks.iter().enumerate() {
        task_markdown(&mut md, task, opts, index + 1);
        md.push('\n');
    }
    md
}

fn summary_table(md: &mut String, label: &str, counts: &[(&str, usize)], total: usize) {
    let _ = writeln!(md, "#### {label} Distribution");
    let _ = writeln!(md, "| {label} | Count | Percentage |");
    let _ = writeln!(md, "|{}|-------|------------|", "-".repeat(label.len() + 2));
    for (name, count) in counts.iter().filter(|(_, count)| *count > 0) {
        let percentage = *count as f64 / total as f64 * 100.0;
        let _ = writeln!(md, "| {name} | {count} | {percentage:.1}% |");
    }
    md.push('\n');
}

fn task_markdown(md: &mut String, task: &Task, opts: &ExportOptions, index: usize) {
    let _ = writeln!(md, "### {index}. {}\n", task.title);
    let _ = writeln!(md, "**Status:** {}  ", task.status.label());
    let _ = writeln!(md, "**Priority:** {}  ", task.priority.label());
    let _ = writeln!(
        md,
        "**Assignee:** {}  ",
        task.assignee.as_deref().unwrap_or("Unassigned")
    );
    let _ = writeln!(
        md,
        "**Due Date:** {}  ",
        format_date(task.due_date.as_deref(), opts.date_style)
    );
    if opts.include_description
        && let Some(description) = task.description.as_deref().filter(|d| !d.is_empty())
    {
        let _ = writeln!(md, "**Description:** {description}  ");
    }
    if opts.include_tags && !task.tags.is_empty() {
        let tags: Vec<String> = task.tags.iter().map(|t| format!("`{t}`")).collect();
        let _ = writeln!(md, "**Tags:** {}  ", tags.join(", "));
    }
    let _ = writeln!(
        md,
        "**Created:** {}  ",
        format_date(Some(&task.created_at), opts.date_style)
    );
    let _ = writeln!(
        md,
        "**Updated:** {}  ",
        format_date(Some(&task.updated_at), opts.date_style)
    );
    if opts.include_metadata
        && let Some(points) = task.points
    {
        let _ = writeln!(md, "**Points:** {points}  ");
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportMetadata {
    export_date: String,
    total_tasks: usize,
    format: &'static str,
    version: &'static str,
}

/// Task with only the fields the export options allow
#[derive(Serialize)]
struct ExportedTask<'a> {
    id: &'a str,
    title: &'a str,
    status: TaskStatus,
    priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    assignee: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<&'a str>,
    created_at: &'a str,
    updated_at: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    points: Option<f64>,
}

impl<'a> ExportedTask<'a> {
    fn new(task: &'a Task, opts: &ExportOptions) -> Self {
        Self {
            id: &task.id,
            title: &task.title,
            status: task.status,
            priority: task.priority,
            assignee: task.assignee.as_deref(),
            due_date: task.due_date.as_deref(),
            created_at: &task.created_at,
            updated_at: &task.updated_at,
            description: task.description.as_deref().filter(|_| opts.include_description),
            tags: opts.include_tags.then_some(task.tags.as_slice()),
            points: task.points.filter(|_| opts.include_metadata),
        }
    }
}

#[derive(Serialize)]
struct ExportDocument<'a> {
    metadata: ExportMetadata,
    tasks: Vec<ExportedTask<'a>>,
}

pub fn to_json(tasks: &[Task], opts: &ExportOptions, now: DateTime<Utc>) -> String {
    let document = ExportDocument {
        metadata: ExportMetadata {
            export_date: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            total_tasks: tasks.len(),
            format: "json",
            version: "1.0",
        },
        tasks: tasks.iter().map(|t| ExportedTask::new(t, opts)).collect(),
    };
    serde_json::to_string_pretty(&document).unwrap_or_else(|_| "{}".to_string())
}

/// `<prefix>_<YYYY-MM-DD>_<HH-MM-SS>.<ext>`
pub fn filename(prefix: &str, format: Format, now: DateTime<Utc>) -> String {
    format!(
        "{prefix}_{}.{}",
        now.format("%Y-%m-%d_%H-%M-%S"),
        format.extension()
    )
}

fn format_date(raw: Option<&str>, style: DateStyle) -> String {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return "N/A".to_string();
    };

    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        let at = at.with_timezone(&Utc);
        return match style {
            DateStyle::Iso => at.to_rfc3339_opts(SecondsFormat::Millis, true),
            DateStyle::Short => at.format("%b %-d, %Y").to_string(),
            DateStyle::Long => at.format("%B %-d, %Y, %I:%M %p").to_string(),
        };
    }

    match parse_date(raw) {
        Some(date) => match style {
            DateStyle::Iso => date.format("%Y-%m-%d").to_string(),
            DateStyle::Short => date.format("%b %-d, %Y").to_string(),
            DateStyle::Long => date.format("%B %-d, %Y").to_string(),
        },
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample_task;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-15T09:30:05Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn tasks() -> Vec<Task> {
        let mut first = sample_task("1", "Write, then \"ship\"");
        first.description = Some("line one\nline two".into());
        first.tags = vec!["ui".into(), "api".into()];
        first.due_date = Some("2025-07-01".into());
        first.points = Some(3.0);
        first.assignee = Some("u1".into());

        let mut second = sample_task("2", "Plain task");
        second.status = TaskStatus::Finished;
        second.priority = Priority::High;
        vec![first, second]
    }

    #[test]
    fn test_csv_headers_and_escaping() {
        let csv = to_csv(&tasks(), &ExportOptions::default());
        let mut lines = csv.lines();

        assert_eq!(
            lines.next().unwrap(),
            "ID,Title,Description,Tags,Status,Priority,Assignee,Due Date,Created At,Updated At,Points"
        );
        assert!(csv.contains("\"Write, then \"\"ship\"\"\""));
        assert!(csv.contains("\"line one\nline two\""));
        assert!(csv.contains("ui; api"));
        assert!(csv.contains("Jul 1, 2025"));
        assert!(csv.ends_with("2,Plain task,,,Finished,High,,N/A,\"Jan 1, 2025\",\"Jan 1, 2025\",0"));
    }

    #[test]
    fn test_csv_optional_columns_and_separator() {
        let opts = ExportOptions {
            include_headers: true,
            include_description: false,
            include_tags: false,
            include_metadata: false,
            date_style: DateStyle::Iso,
            separator: ';',
        };
        let csv = to_csv(&tasks(), &opts);
        assert_eq!(
            csv.lines().next().unwrap(),
            "ID;Title;Status;Priority;Assignee;Due Date;Created At;Updated At"
        );
        assert!(csv.contains("2;Plain task;Finished;High;;N/A;2025-01-01T00:00:00.000Z"));
        assert_eq!(to_csv(&[], &opts), "");
    }

    #[test]
    fn test_markdown_summary_and_details() {
        let md = to_markdown(&tasks(), &ExportOptions::default(), now());

        assert!(md.starts_with("# Task Export\n\n**Total Tasks:** 2\n"));
        assert!(md.contains("| To Do | 1 | 50.0% |"));
        assert!(md.contains("| Finished | 1 | 50.0% |"));
        assert!(md.contains("| Unassigned | 1 | 50.0% |"));
        assert!(md.contains("### 1. Write, then \"ship\""));
        assert!(md.contains("**Tags:** `ui`, `api`"));
        assert!(md.contains("**Points:** 3"));
        assert!(!md.contains("| In Progress |"));
    }

    #[test]
    fn test_markdown_empty() {
        let md = to_markdown(&[], &ExportOptions::default(), now());
        assert!(md.starts_with("# No Tasks Found"));
    }

    #[test]
    fn test_json_metadata_and_field_selection() {
        let opts = ExportOptions {
            include_description: false,
            ..ExportOptions::default()
        };
        let json: serde_json::Value = serde_json::from_str(&to_json(&tasks(), &opts, now())).unwrap();

        assert_eq!(json["metadata"]["totalTasks"], 2);
        assert_eq!(json["metadata"]["exportDate"], "2025-06-15T09:30:05.000Z");
        assert_eq!(json["tasks"][0]["tags"][1], "api");
        assert!(json["tasks"][0].get("description").is_none());
        assert_eq!(json["tasks"][1]["status"], "finished");
    }

    #[test]
    fn test_filename() {
        assert_eq!(
            filename("tasks", Format::Csv, now()),
            "tasks_2025-06-15_09-30-05.csv"
        );
        assert_eq!(Format::parse("MD"), Some(Format::Markdown));
        assert_eq!(Format::parse("xml"), None);
    }
}
