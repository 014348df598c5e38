//! Table view state carried in URL query parameters
//!
//! `?page=2&size=20&sort=title,asc&status=todo,in_progress&tags=ui`
//!
//! Lists are comma separated. Keys not listed here are ignored so the view
//! can share a query string with other state.

use serde::Serialize;
use thiserror::Error;
use url::form_urlencoded;

use crate::models::{LIST_SEPARATOR, Priority, TaskStatus};
use crate::query::{
    AdvancedFilters, DateRange, SortDirection, SortField, SortSpec, TaskFilter, TaskQuery,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewParamsError {
    #[error("invalid value for '{key}': {value}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("page size must be at least 1")]
    ZeroPageSize,

    #[error("unknown sort field: {0}")]
    SortField(String),

    #[error("unknown sort direction: {0}")]
    SortDirection(String),

    #[error("unknown status: {0}")]
    Status(String),

    #[error("unknown priority: {0}")]
    Priority(String),
}

/// Parsed view state. `page_size` is `None` when the URL leaves it to settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViewParams {
    pub filter: TaskFilter,
    pub advanced: AdvancedFilters,
    pub sort: SortSpec,
    pub page: usize,
    pub page_size: Option<usize>,
}

impl ViewParams {
    pub fn parse(query: &str) -> Result<ViewParams, ViewParamsError> {
        let mut view = ViewParams {
            page: 1,
            ..ViewParams::default()
        };
        let mut range = DateRange::default();

        for (key, value) in form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "page" => view.page = parse_number("page", value)?.max(1),
                "size" => {
                    let size = parse_number("size", value)?;
                    if size == 0 {
                        return Err(ViewParamsError::ZeroPageSize);
                    }
                    view.page_size = Some(size);
                }
                "sort" => view.sort = parse_sort(value)?,
                "search" => view.filter.search = Some(value.to_string()),
                "title" => view.filter.title = Some(value.to_string()),
                "description" => view.filter.description = Some(value.to_string()),
                "status" => {
                    view.filter.status = split(value)
                        .map(|s| TaskStatus::parse(s).ok_or_else(|| ViewParamsError::Status(s.into())))
                        .collect::<Result<_, _>>()?;
                }
                "priority" => {
                    view.filter.priority = split(value)
                        .map(|p| Priority::parse(p).ok_or_else(|| ViewParamsError::Priority(p.into())))
                        .collect::<Result<_, _>>()?;
                }
                "assignee" => view.filter.assignee = split(value).map(String::from).collect(),
                "tags" => view.filter.tags = split(value).map(String::from).collect(),
                "due_date" => view.filter.due_date = Some(value.to_string()),
                "updated_at" => view.filter.updated_at = Some(value.to_string()),
                "due_from" => range.from = Some(value.to_string()),
                "due_to" => range.to = Some(value.to_string()),
                "overdue" => view.advanced.only_overdue = matches!(value, "true" | "1"),
                _ => {}
            }
        }

        if range != DateRange::default() {
            view.advanced.due_date_range = Some(range);
        }
        Ok(view)
    }

    /// Query string that reproduces this view. Empty filters are omitted.
    pub fn to_query_string(&self) -> String {
        let mut out = form_urlencoded::Serializer::new(String::new());
        out.append_pair("page", &self.page.max(1).to_string());
        if let Some(size) = self.page_size {
            out.append_pair("size", &size.to_string());
        }
        out.append_pair(
            "sort",
            &format!("{},{}", self.sort.by.as_str(), self.sort.dir.as_str()),
        );

        let filter = &self.filter;
        let text = [
            ("search", &filter.search),
            ("title", &filter.title),
            ("description", &filter.description),
            ("due_date", &filter.due_date),
            ("updated_at", &filter.updated_at),
        ];
        for (key, value) in text {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                out.append_pair(key, value);
            }
        }

        let lists = [
            ("status", join(filter.status.iter().map(|s| s.as_str()))),
            ("priority", join(filter.priority.iter().map(|p| p.as_str()))),
            ("assignee", join(filter.assignee.iter().map(String::as_str))),
            ("tags", join(filter.tags.iter().map(String::as_str))),
        ];
        for (key, value) in lists {
            if !value.is_empty() {
                out.append_pair(key, &value);
            }
        }

        if let Some(range) = &self.advanced.due_date_range {
            if let Some(from) = &range.from {
                out.append_pair("due_from", from);
            }
            if let Some(to) = &range.to {
                out.append_pair("due_to", to);
            }
        }
        if self.advanced.only_overdue {
            out.append_pair("overdue", "true");
        }

        out.finish()
    }

    /// Resolve into an engine query, using `default_page_size` when the URL has none
    pub fn to_query(&self, default_page_size: usize) -> TaskQuery {
        TaskQuery {
            filter: self.filter.clone(),
            advanced: self.advanced.clone(),
            sort: self.sort,
            page: self.page.max(1),
            page_size: self.page_size.unwrap_or(default_page_size),
        }
    }
}

fn parse_number(key: &'static str, value: &str) -> Result<usize, ViewParamsError> {
    value
        .parse()
        .map_err(|_| ViewParamsError::InvalidNumber {
            key,
            value: value.to_string(),
        })
}

fn parse_sort(value: &str) -> Result<SortSpec, ViewParamsError> {
    let (field, dir) = value.split_once(',').unwrap_or((value, "asc"));
    let by = SortField::parse(field).ok_or_else(|| ViewParamsError::SortField(field.into()))?;
    let dir = SortDirection::parse(dir).ok_or_else(|| ViewParamsError::SortDirection(dir.into()))?;
    Ok(SortSpec::new(by, dir))
}

fn split(value: &str) -> impl Iterator<Item = &str> {
    value.split(LIST_SEPARATOR).map(str::trim).filter(|s| !s.is_empty())
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let separator = LIST_SEPARATOR.to_string();
    items.collect::<Vec<_>>().join(separator.as_str())
}
