//! Board data models
//!
//! Uses String for IDs and timestamps so stored records written by older
//! sessions keep loading even when a value is malformed.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

pub const TITLE_MIN: usize = 3;
pub const TITLE_MAX: usize = 120;
pub const TAG_MIN: usize = 2;
pub const TAG_MAX: usize = 20;
/// Separates tags and assignees in view URLs, so neither may contain it
pub const LIST_SEPARATOR: char = ',';

/// Board column a task sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    CodeReview,
    TestReady,
    Finished,
}

impl TaskStatus {
    pub fn all() -> &'static [TaskStatus] {
        &[
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::CodeReview,
            TaskStatus::TestReady,
            TaskStatus::Finished,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::CodeReview => "code_review",
            TaskStatus::TestReady => "test_ready",
            TaskStatus::Finished => "finished",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "To Do",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::CodeReview => "Code Review",
            TaskStatus::TestReady => "Test Ready",
            TaskStatus::Finished => "Finished",
        }
    }

    /// Statuses reachable through a quick-status change
    pub fn transitions(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Todo => &[TaskStatus::InProgress],
            TaskStatus::InProgress => &[TaskStatus::CodeReview, TaskStatus::Todo],
            TaskStatus::CodeReview => &[TaskStatus::TestReady, TaskStatus::InProgress],
            TaskStatus::TestReady => &[TaskStatus::Finished, TaskStatus::CodeReview],
            TaskStatus::Finished => &[TaskStatus::TestReady],
        }
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        self.transitions().contains(&to)
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        TaskStatus::all()
            .iter()
            .copied()
            .find(|status| status.as_str() == s.trim().to_lowercase())
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level for tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn all() -> &'static [Priority] {
        &[
            Priority::Low,
            Priority::Medium,
            Priority::High,
            Priority::Urgent,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Medium => "Medium",
            Priority::High => "High",
            Priority::Urgent => "Urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Priority> {
        Priority::all()
            .iter()
            .copied()
            .find(|p| p.as_str() == s.trim().to_lowercase())
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task on the board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<f64>,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Task {
    /// Refresh `updated_at`; every mutating path goes through here
    pub fn touch(&mut self) {
        self.updated_at = now_rfc3339();
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();
        validate_title(&self.title, &mut errors);
        validate_tags(&self.tags, &mut errors);
        if let Some(assignee) = &self.assignee
            && assignee.contains(LIST_SEPARATOR)
        {
            errors.push(ValidationError::AssigneeSeparator(assignee.clone()));
        }
        if let Some(due) = &self.due_date
            && crate::query::parse_due(due).is_none()
        {
            errors.push(ValidationError::InvalidDueDate(due.clone()));
        }
        if let Some(points) = self.points
            && points < 0.0
        {
            errors.push(ValidationError::NegativePoints);
        }
        ValidationErrors::check(errors)
    }
}

/// Fields accepted when creating a task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub points: Option<f64>,
}

impl NewTask {
    pub fn into_task(self) -> Task {
        let now = now_rfc3339();
        Task {
            id: generate_task_id(),
            title: self.title.trim().to_string(),
            description: self.description.filter(|d| !d.trim().is_empty()),
            status: self.status.unwrap_or_default(),
            priority: self.priority.unwrap_or_default(),
            assignee: self.assignee.filter(|a| !a.is_empty()),
            tags: self.tags,
            due_date: self.due_date.filter(|d| !d.is_empty()),
            points: self.points,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Partial update for a task. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default, with = "double_option")]
    pub assignee: Option<Option<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default, with = "double_option")]
    pub due_date: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub points: Option<Option<f64>>,
}

impl TaskPatch {
    pub fn apply(self, task: &mut Task) {
        if let Some(title) = self.title {
            task.title = title.trim().to_string();
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(assignee) = self.assignee {
            task.assignee = assignee;
        }
        if let Some(tags) = self.tags {
            task.tags = tags;
        }
        if let Some(due_date) = self.due_date {
            task.due_date = due_date;
        }
        if let Some(points) = self.points {
            task.points = points;
        }
    }
}

/// Distinguishes a missing field from an explicit `null`
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &Option<Option<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<T>>, D::Error> {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Field-level validation failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("task title is required")]
    TitleMissing,
    #[error("task title must be at least 3 characters long")]
    TitleTooShort,
    #[error("task title must be at most 120 characters long")]
    TitleTooLong,
    #[error("task points cannot be negative")]
    NegativePoints,
    #[error("tags must be unique (duplicate \"{0}\")")]
    DuplicateTag(String),
    #[error("tag \"{0}\" must be between 2 and 20 characters")]
    TagLength(String),
    #[error("tag \"{0}\" cannot contain a comma")]
    TagSeparator(String),
    #[error("assignee \"{0}\" cannot contain a comma")]
    AssigneeSeparator(String),
    #[error("due date \"{0}\" is not an ISO date")]
    InvalidDueDate(String),
}

impl ValidationError {
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::TitleMissing
            | ValidationError::TitleTooShort
            | ValidationError::TitleTooLong => "title",
            ValidationError::NegativePoints => "points",
            ValidationError::DuplicateTag(_)
            | ValidationError::TagLength(_)
            | ValidationError::TagSeparator(_) => "tags",
            ValidationError::AssigneeSeparator(_) => "assignee",
            ValidationError::InvalidDueDate(_) => "due_date",
        }
    }
}

/// All validation failures for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        f.write_str(&messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    fn check(errors: Vec<ValidationError>) -> Result<(), ValidationErrors> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }
}

fn validate_title(title: &str, errors: &mut Vec<ValidationError>) {
    let len = title.trim().chars().count();
    if len == 0 {
        errors.push(ValidationError::TitleMissing);
    } else if len < TITLE_MIN {
        errors.push(ValidationError::TitleTooShort);
    } else if len > TITLE_MAX {
        errors.push(ValidationError::TitleTooLong);
    }
}

fn validate_tags(tags: &[String], errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for tag in tags {
        if !seen.insert(tag.as_str()) {
            errors.push(ValidationError::DuplicateTag(tag.clone()));
        }
        let len = tag.chars().count();
        if !(TAG_MIN..=TAG_MAX).contains(&len) {
            errors.push(ValidationError::TagLength(tag.clone()));
        }
        if tag.contains(LIST_SEPARATOR) {
            errors.push(ValidationError::TagSeparator(tag.clone()));
        }
    }
}

/// Team member a task can be assigned to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_user_status")]
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

fn default_role() -> String {
    "developer".to_string()
}

fn default_user_status() -> String {
    "active".to_string()
}

impl User {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if !full.is_empty() {
            full.to_string()
        } else if !self.username.is_empty() {
            self.username.clone()
        } else {
            "Unknown User".to_string()
        }
    }

    pub fn initials(&self) -> String {
        let initials: String = self
            .first_name
            .chars()
            .take(1)
            .chain(self.last_name.chars().take(1))
            .collect::<String>()
            .to_uppercase();
        if initials.is_empty() {
            "?".to_string()
        } else {
            initials
        }
    }
}

/// Users written the first time the user list is read
pub fn seed_users() -> Vec<User> {
    use rand::Rng;

    const NAMES: [(&str, &str, &str); 5] = [
        ("Ali", "Karimov", "karimov"),
        ("Laylo", "Ismoilova", "ismoilova"),
        ("Jasur", "Beknazarov", "beknazarov"),
        ("Nigora", "Sattorova", "sattorova"),
        ("Timur", "Akbarov", "akbarov"),
    ];
    const STYLES: [&str; 5] = ["adventurer", "identicon", "thumbs", "fun-emoji", "bottts"];

    let mut rng = rand::rng();
    let now = now_rfc3339();
    NAMES
        .iter()
        .enumerate()
        .map(|(i, (first, last, username))| {
            let style = STYLES[rng.random_range(0..STYLES.len())];
            let seed = format!("{}-{}", username, rng.random_range(0..100_000));
            User {
                id: (i + 1).to_string(),
                first_name: first.to_string(),
                last_name: last.to_string(),
                username: username.to_string(),
                email: format!("{}@example.com", username),
                avatar_url: Some(format!(
                    "https://api.dicebear.com/7.x/{}/svg?seed={}",
                    style, seed
                )),
                role: default_role(),
                status: default_user_status(),
                created_at: now.clone(),
                updated_at: now.clone(),
            }
        })
        .collect()
}

/// Timestamp-based task id with a random base36 suffix
pub fn generate_task_id() -> String {
    use rand::Rng;

    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();

    format!("{}{}", Utc::now().timestamp_millis(), suffix)
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
pub(crate) fn sample_task(id: &str, title: &str) -> Task {
    Task {
        id: id.to_string(),
        title: title.to_string(),
        description: None,
        status: TaskStatus::Todo,
        priority: Priority::Medium,
        assignee: None,
        tags: Vec::new(),
        due_date: None,
        points: None,
        created_at: "2025-01-01T00:00:00.000Z".to_string(),
        updated_at: "2025-01-01T00:00:00.000Z".to_string(),
    }
}
