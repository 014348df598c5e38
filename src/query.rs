//! Task query engine: filter, sort and paginate the board's task collection
//!
//! Everything here is pure. The input collection is never mutated and the
//! current time is passed in, so the same inputs always give the same page.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::models::{Priority, Task, TaskStatus};

/// Column filters shown above the task table.
///
/// Every key is optional; an empty value means "no constraint". Unknown keys
/// are rejected when a filter is decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskFilter {
    /// Substring of title, description or any tag
    pub search: Option<String>,
    /// Substring of the title
    pub title: Option<String>,
    /// Substring of the description
    pub description: Option<String>,
    /// Task status must be one of these
    pub status: Vec<TaskStatus>,
    /// Task priority must be one of these
    pub priority: Vec<Priority>,
    /// Task assignee must be one of these user ids
    pub assignee: Vec<String>,
    /// At least one task tag must be one of these
    pub tags: Vec<String>,
    /// Substring of the raw due date string
    pub due_date: Option<String>,
    /// Substring of the raw `updated_at` string
    pub updated_at: Option<String>,
}

/// Inclusive due date window; a missing bound is unbounded on that side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DateRange {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdvancedFilters {
    pub due_date_range: Option<DateRange>,
    pub only_overdue: bool,
}

impl TaskFilter {
    pub fn is_empty(&self) -> bool {
        *self == TaskFilter::default()
    }
}

impl AdvancedFilters {
    pub fn is_empty(&self) -> bool {
        *self == AdvancedFilters::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Id,
    Title,
    Description,
    Status,
    Priority,
    Assignee,
    Tags,
    DueDate,
    Points,
    CreatedAt,
    #[default]
    UpdatedAt,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Id => "id",
            SortField::Title => "title",
            SortField::Description => "description",
            SortField::Status => "status",
            SortField::Priority => "priority",
            SortField::Assignee => "assignee",
            SortField::Tags => "tags",
            SortField::DueDate => "due_date",
            SortField::Points => "points",
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
        }
    }

    pub fn parse(s: &str) -> Option<SortField> {
        const ALL: [SortField; 11] = [
            SortField::Id,
            SortField::Title,
            SortField::Description,
            SortField::Status,
            SortField::Priority,
            SortField::Assignee,
            SortField::Tags,
            SortField::DueDate,
            SortField::Points,
            SortField::CreatedAt,
            SortField::UpdatedAt,
        ];
        ALL.into_iter().find(|field| field.as_str() == s.trim())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }

    pub fn toggled(&self) -> SortDirection {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }

    pub fn parse(s: &str) -> Option<SortDirection> {
        match s.trim().to_lowercase().as_str() {
            "asc" => Some(SortDirection::Asc),
            "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortSpec {
    pub by: SortField,
    pub dir: SortDirection,
}

impl SortSpec {
    pub fn new(by: SortField, dir: SortDirection) -> Self {
        Self { by, dir }
    }

    /// Header-click behaviour: same field flips direction, new field starts ascending
    pub fn toggle(self, field: SortField) -> SortSpec {
        if self.by == field {
            SortSpec::new(field, self.dir.toggled())
        } else {
            SortSpec::new(field, SortDirection::Asc)
        }
    }
}

/// Everything needed to compute one displayed page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQuery {
    pub filter: TaskFilter,
    pub advanced: AdvancedFilters,
    pub sort: SortSpec,
    /// 1-based
    pub page: usize,
    pub page_size: usize,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            filter: TaskFilter::default(),
            advanced: AdvancedFilters::default(),
            sort: SortSpec::default(),
            page: 1,
            page_size: 20,
        }
    }
}

/// One page of results plus the pre-slice count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPage {
    pub items: Vec<Task>,
    pub total_items: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

/// Run the full filter -> sort -> paginate pipeline
pub fn run(tasks: &[Task], query: &TaskQuery, now: DateTime<Utc>) -> TaskPage {
    let mut matching: Vec<&Task> = tasks
        .iter()
        .filter(|task| matches(task, &query.filter, &query.advanced, now))
        .collect();
    sort_refs(&mut matching, query.sort);

    let page = query.page.max(1);
    let page_size = query.page_size.max(1);
    let total_items = matching.len();
    let items = paginate(&matching, page, page_size)
        .iter()
        .map(|task| (*task).clone())
        .collect();

    TaskPage {
        items,
        total_items,
        page,
        page_size,
        total_pages: total_pages(total_items, page_size),
    }
}

/// Page count for a filtered total, never less than one
pub fn total_pages(total_items: usize, page_size: usize) -> usize {
    total_items.div_ceil(page_size.max(1)).max(1)
}

/// Slice a sequence; pages past the end are empty
pub fn paginate<T>(items: &[T], page: usize, page_size: usize) -> &[T] {
    let start = page.saturating_sub(1).saturating_mul(page_size);
    if start >= items.len() {
        return &[];
    }
    let end = start.saturating_add(page_size).min(items.len());
    &items[start..end]
}

/// Whether a task passes every non-empty basic and advanced filter
pub fn matches(
    task: &Task,
    filter: &TaskFilter,
    advanced: &AdvancedFilters,
    now: DateTime<Utc>,
) -> bool {
    if let Some(term) = non_empty(&filter.search) {
        let in_title = contains_ci(&task.title, &term);
        let in_description = task
            .description
            .as_deref()
            .is_some_and(|d| contains_ci(d, &term));
        let in_tags = task.tags.iter().any(|tag| contains_ci(tag, &term));
        if !(in_title || in_description || in_tags) {
            return false;
        }
    }

    if let Some(term) = non_empty(&filter.title)
        && !contains_ci(&task.title, &term)
    {
        return false;
    }

    if let Some(term) = non_empty(&filter.description)
        && !task
            .description
            .as_deref()
            .is_some_and(|d| contains_ci(d, &term))
    {
        return false;
    }

    if !filter.status.is_empty() && !filter.status.contains(&task.status) {
        return false;
    }

    if !filter.priority.is_empty() && !filter.priority.contains(&task.priority) {
        return false;
    }

    if !filter.assignee.is_empty() {
        let assigned = task
            .assignee
            .as_ref()
            .is_some_and(|a| filter.assignee.contains(a));
        if !assigned {
            return false;
        }
    }

    if !filter.tags.is_empty() {
        let tagged = task.tags.iter().any(|tag| {
            filter
                .tags
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(tag))
        });
        if !tagged {
            return false;
        }
    }

    if let Some(term) = non_empty(&filter.due_date)
        && !task
            .due_date
            .as_deref()
            .is_some_and(|d| contains_ci(d, &term))
    {
        return false;
    }

    if let Some(term) = non_empty(&filter.updated_at)
        && !contains_ci(&task.updated_at, &term)
    {
        return false;
    }

    if let Some(range) = &advanced.due_date_range
        && !in_date_range(task, range)
    {
        return false;
    }

    if advanced.only_overdue && !is_overdue(task, now) {
        return false;
    }

    true
}

/// A task is overdue when its due instant is strictly before `now` and it is
/// not finished. Date-only values count from midnight UTC. Missing or
/// unparsable due dates are never overdue.
pub fn is_overdue(task: &Task, now: DateTime<Utc>) -> bool {
    if task.status == TaskStatus::Finished {
        return false;
    }
    task.due_date
        .as_deref()
        .and_then(parse_due)
        .is_some_and(|due| due < now)
}

/// Whole days from today until the due date (negative when past)
pub fn days_until_due(task: &Task, now: DateTime<Utc>) -> Option<i64> {
    let due = task.due_date.as_deref().and_then(parse_date)?;
    Some((due - now.date_naive()).num_days())
}

fn in_date_range(task: &Task, range: &DateRange) -> bool {
    let Some(due) = task.due_date.as_deref().and_then(parse_date) else {
        return false;
    };
    let after_from = bound(&range.from).is_none_or(|from| due >= from);
    let before_to = bound(&range.to).is_none_or(|to| due <= to);
    after_from && before_to
}

fn bound(value: &Option<String>) -> Option<NaiveDate> {
    let raw = non_empty(value)?;
    let parsed = parse_date(&raw);
    if parsed.is_none() {
        tracing::debug!(bound = %raw, "Ignoring unparsable date range bound");
    }
    parsed
}

/// Parse a due date as a calendar date. Accepts `YYYY-MM-DD`, RFC 3339 and
/// naive `YYYY-MM-DDTHH:MM:SS` forms.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    parse_due(raw).map(|due| due.date_naive())
}

/// Parse a due date as an instant. Date-only and naive values are read as UTC.
pub fn parse_due(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_time(NaiveTime::MIN).and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map(|dt| dt.and_utc())
        .ok()
}

/// Stable sort of owned tasks
pub fn sort_tasks(tasks: &mut [Task], sort: SortSpec) {
    tasks.sort_by(|a, b| compare(a, b, sort));
}

fn sort_refs(tasks: &mut [&Task], sort: SortSpec) {
    tasks.sort_by(|a, b| compare(a, b, sort));
}

/// Primary-key comparison only; `sort_by` is stable so ties keep input order
fn compare(a: &Task, b: &Task, sort: SortSpec) -> Ordering {
    let ordering = sort_key(a, sort.by).cmp_key(&sort_key(b, sort.by));
    match sort.dir {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

enum SortKey {
    Text(String),
    Number(Option<f64>),
}

impl SortKey {
    fn cmp_key(&self, other: &SortKey) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => match (a, b) {
                (Some(a), Some(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

fn sort_key(task: &Task, field: SortField) -> SortKey {
    let text = |value: Option<&str>| SortKey::Text(value.unwrap_or_default().to_string());
    match field {
        SortField::Id => text(Some(&task.id)),
        SortField::Title => text(Some(&task.title)),
        SortField::Description => text(task.description.as_deref()),
        SortField::Status => text(Some(task.status.as_str())),
        SortField::Priority => text(Some(task.priority.as_str())),
        SortField::Assignee => text(task.assignee.as_deref()),
        SortField::Tags => SortKey::Text(task.tags.join(",")),
        SortField::DueDate => text(task.due_date.as_deref()),
        SortField::Points => SortKey::Number(task.points),
        SortField::CreatedAt => text(Some(&task.created_at)),
        SortField::UpdatedAt => text(Some(&task.updated_at)),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_lowercase)
}

/// `needle` must already be lower-cased
fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

// ----------------------------------------------------------------------------
// Aggregates
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: TaskStatus,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorityCount {
    pub priority: Priority,
    pub count: usize,
}

/// Summary numbers over a task collection
#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub by_status: Vec<StatusCount>,
    pub by_priority: Vec<PriorityCount>,
    pub overdue: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub completion_rate: f64,
    pub overdue_rate: f64,
}

pub fn stats(tasks: &[Task], now: DateTime<Utc>) -> TaskStats {
    let total = tasks.len();
    let count_status = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
    let overdue = tasks.iter().filter(|t| is_overdue(t, now)).count();
    let completed = count_status(TaskStatus::Finished);
    let rate = |n: usize| {
        if total == 0 {
            0.0
        } else {
            n as f64 / total as f64 * 100.0
        }
    };

    TaskStats {
        total,
        by_status: TaskStatus::all()
            .iter()
            .map(|&status| StatusCount {
                status,
                count: count_status(status),
            })
            .collect(),
        by_priority: Priority::all()
            .iter()
            .map(|&priority| PriorityCount {
                priority,
                count: tasks.iter().filter(|t| t.priority == priority).count(),
            })
            .collect(),
        overdue,
        completed,
        in_progress: count_status(TaskStatus::InProgress),
        completion_rate: rate(completed),
        overdue_rate: rate(overdue),
    }
}

/// Tasks grouped by assignee id, unassigned tasks under `"unassigned"`
pub fn group_by_assignee(tasks: &[Task]) -> BTreeMap<String, Vec<&Task>> {
    let mut groups: BTreeMap<String, Vec<&Task>> = BTreeMap::new();
    for task in tasks {
        let key = task
            .assignee
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "unassigned".to_string());
        groups.entry(key).or_default().push(task);
    }
    groups
}

/// Work-in-progress ceiling for a board column, if it has one
pub fn wip_limit(status: TaskStatus) -> Option<usize> {
    match status {
        TaskStatus::InProgress => Some(5),
        TaskStatus::CodeReview => Some(3),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnStats {
    pub status: TaskStatus,
    pub label: &'static str,
    pub total: usize,
    pub overdue: usize,
    pub wip_limit: Option<usize>,
    pub over_limit: bool,
}

/// Per-column counts for the kanban view
pub fn column_stats(tasks: &[Task], now: DateTime<Utc>) -> Vec<ColumnStats> {
    TaskStatus::all()
        .iter()
        .map(|&status| {
            let column: Vec<&Task> = tasks.iter().filter(|t| t.status == status).collect();
            let limit = wip_limit(status);
            ColumnStats {
                status,
                label: status.label(),
                total: column.len(),
                overdue: column.iter().filter(|t| is_overdue(t, now)).count(),
                wip_limit: limit,
                over_limit: limit.is_some_and(|l| column.len() > l),
            }
        })
        .collect()
}
