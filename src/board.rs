//! The task board: one explicit context object owning every piece of state
//!
//! Mutations happen in memory first and are persisted through the auto-save
//! debouncer, so a burst of edits costs one storage write. Persistence
//! failures never fail an operation; they are kept as the board's last
//! storage warning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::debounce::Debouncer;
use crate::migration;
use crate::models::{NewTask, Priority, Task, TaskPatch, TaskStatus, User, ValidationErrors, seed_users};
use crate::presence::Presence;
use crate::query::{self, ColumnStats, TaskPage, TaskStats};
use crate::recycle_bin::RecycleBin;
use crate::settings::{AppSettings, LastUsedFilters, SettingsStore};
use crate::storage::{
    SETTINGS_KEY, Storage, StorageChange, StorageError, StorageInfo, StorageWarning, TASKS_KEY,
    USERS_KEY, WarningSlot,
};
use crate::view_params::ViewParams;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("invalid task: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("cannot move a task from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type BoardResult<T> = std::result::Result<T, BoardError>;

/// Fields a bulk update may change
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkPatch {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

pub struct Board {
    store: Arc<Storage>,
    tasks: RwLock<Vec<Task>>,
    settings: Arc<SettingsStore>,
    bin: RecycleBin,
    presence: Presence,
    autosave: Debouncer<Vec<Task>>,
    filter_memory: Debouncer<LastUsedFilters>,
    warnings: WarningSlot,
    config: Config,
}

impl Board {
    /// Migrate storage, load everything and announce this session.
    /// Must be called inside a tokio runtime.
    pub fn open(store: Arc<Storage>, config: &Config) -> Arc<Board> {
        let warnings = WarningSlot::default();

        let max_backups = store
            .get_json::<AppSettings>(SETTINGS_KEY)
            .ok()
            .flatten()
            .map(|s| s.data_management.max_backups)
            .unwrap_or_else(|| AppSettings::default().data_management.max_backups);
        match migration::run(&store, max_backups) {
            Ok(report) if !report.success() => {
                tracing::warn!(errors = ?report.errors, version = %report.version, "Storage migration incomplete");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Storage migration skipped"),
        }

        let tasks = match store.get_json::<Vec<Task>>(TASKS_KEY) {
            Ok(tasks) => tasks.unwrap_or_default(),
            Err(e) => {
                warnings.record(&e);
                Vec::new()
            }
        };

        let settings = Arc::new(SettingsStore::load(Arc::clone(&store), warnings.clone()));
        let bin = RecycleBin::load(
            Arc::clone(&store),
            config.timing.undo_window(),
            settings.get().performance.max_recycle_items,
            warnings.clone(),
        );

        let autosave = {
            let store = Arc::clone(&store);
            let warnings = warnings.clone();
            Debouncer::new(config.timing.autosave_debounce(), move |tasks: &Vec<Task>| {
                match store.set_json(TASKS_KEY, tasks) {
                    Ok(()) => tracing::debug!(tasks = tasks.len(), "Auto-saved tasks"),
                    Err(e) => warnings.record(&e),
                }
            })
        };

        let filter_memory = {
            let settings = Arc::clone(&settings);
            Debouncer::new(config.timing.filter_debounce(), move |filters: &LastUsedFilters| {
                settings.update_last_used_filters(filters.clone());
            })
        };

        let presence = Presence::new(
            Arc::clone(&store),
            format!("taskboard {}", env!("CARGO_PKG_VERSION")),
            config.timing.presence_ttl(),
        );
        if let Err(e) = presence.heartbeat() {
            warnings.record(&e);
        }

        tracing::info!(
            session = %presence.session_id(),
            tasks = tasks.len(),
            pending_deletions = bin.len(),
            "Board opened"
        );

        Arc::new(Board {
            store,
            tasks: RwLock::new(tasks),
            settings,
            bin,
            presence,
            autosave,
            filter_memory,
            warnings,
            config: config.clone(),
        })
    }

    pub fn session_id(&self) -> &str {
        self.presence.session_id()
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn recycle_bin(&self) -> &RecycleBin {
        &self.bin
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn storage(&self) -> &Storage {
        &self.store
    }

    pub fn storage_info(&self) -> BoardResult<StorageInfo> {
        Ok(self.store.info()?)
    }

    /// Most recent persistence failure, if any
    pub fn last_warning(&self) -> Option<StorageWarning> {
        self.warnings.peek()
    }

    pub fn take_warning(&self) -> Option<StorageWarning> {
        self.warnings.take()
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn tasks(&self) -> Vec<Task> {
        self.read().clone()
    }

    pub fn get(&self, id: &str) -> BoardResult<Task> {
        self.read()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| BoardError::NotFound(id.to_string()))
    }

    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<Task> {
        self.read()
            .iter()
            .filter(|t| query::is_overdue(t, now))
            .cloned()
            .collect()
    }

    /// Run a table view. Without an explicit size the settings page size applies.
    pub fn query(&self, view: &ViewParams, now: DateTime<Utc>) -> TaskPage {
        let query = view.to_query(self.settings.page_size());
        query::run(&self.read(), &query, now)
    }

    pub fn stats(&self, now: DateTime<Utc>) -> TaskStats {
        query::stats(&self.read(), now)
    }

    pub fn column_stats(&self, now: DateTime<Utc>) -> Vec<ColumnStats> {
        query::column_stats(&self.read(), now)
    }

    /// Stored users, seeding the default set the first time
    pub fn users(&self) -> BoardResult<Vec<User>> {
        match self.store.get_json::<Vec<User>>(USERS_KEY) {
            Ok(Some(users)) if !users.is_empty() => return Ok(users),
            Ok(_) => {}
            Err(e) => self.warnings.record(&e),
        }

        let users = seed_users();
        self.store.set_json(USERS_KEY, &users)?;
        tracing::info!(users = users.len(), "Seeded default users");
        Ok(users)
    }

    // ------------------------------------------------------------------------
    // Single-task writes
    // ------------------------------------------------------------------------

    /// Validate, stamp and put a new task at the front of the board
    pub fn create(&self, new: NewTask) -> BoardResult<Task> {
        let task = new.into_task();
        task.validate()?;

        self.mutate(|tasks| {
            tasks.insert(0, task.clone());
            Ok(())
        })?;
        tracing::info!(task_id = %task.id, "Task created");
        Ok(task)
    }

    /// Apply an edit. A failing validation leaves the stored task untouched.
    pub fn update(&self, id: &str, patch: TaskPatch) -> BoardResult<Task> {
        self.mutate(|tasks| {
            let slot = find_mut(tasks, id)?;
            let mut edited = slot.clone();
            patch.apply(&mut edited);
            edited.validate()?;
            edited.touch();
            *slot = edited.clone();
            Ok(edited)
        })
    }

    /// Drag-and-drop: any column is allowed
    pub fn move_to(&self, id: &str, status: TaskStatus) -> BoardResult<Task> {
        self.set_status(id, status, false)
    }

    /// Quick status change: only the neighbouring workflow steps are allowed
    pub fn transition(&self, id: &str, status: TaskStatus) -> BoardResult<Task> {
        self.set_status(id, status, true)
    }

    fn set_status(&self, id: &str, status: TaskStatus, strict: bool) -> BoardResult<Task> {
        let task = self.mutate(|tasks| {
            let task = find_mut(tasks, id)?;
            if task.status == status {
                return Ok(task.clone());
            }
            if strict && !task.status.can_transition_to(status) {
                return Err(BoardError::InvalidTransition {
                    from: task.status,
                    to: status,
                });
            }
            task.status = status;
            task.touch();
            Ok(task.clone())
        })?;
        tracing::debug!(task_id = %id, status = %status, "Task status changed");
        Ok(task)
    }

    /// Remove immediately, with no undo
    pub fn delete(&self, id: &str) -> BoardResult<Task> {
        let task = self.mutate(|tasks| take(tasks, id))?;
        tracing::info!(task_id = %id, "Task deleted permanently");
        Ok(task)
    }

    /// Remove and hold a copy in the recycle bin for the undo window
    pub fn delete_with_undo(&self, id: &str) -> BoardResult<Task> {
        let task = self.mutate(|tasks| take(tasks, id))?;
        self.bin.delete(task.clone());
        tracing::info!(task_id = %id, "Task deleted; undo available");
        Ok(task)
    }

    /// Put a pending deletion back at the front of the board
    pub fn restore(&self, id: &str) -> BoardResult<Task> {
        let task = self
            .bin
            .restore(id)
            .ok_or_else(|| BoardError::NotFound(id.to_string()))?;

        self.mutate(|tasks| {
            tasks.retain(|t| t.id != task.id);
            tasks.insert(0, task.clone());
            Ok(())
        })?;
        tracing::info!(task_id = %id, "Task restored");
        Ok(task)
    }

    // ------------------------------------------------------------------------
    // Bulk writes
    // ------------------------------------------------------------------------

    /// Update every listed task; unknown ids are skipped
    pub fn bulk_update(&self, ids: &[String], patch: &BulkPatch) -> BoardResult<Vec<Task>> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let updated = self.mutate(|tasks| {
            let mut updated = Vec::new();
            for task in tasks.iter_mut().filter(|t| wanted.contains(t.id.as_str())) {
                if let Some(status) = patch.status {
                    task.status = status;
                }
                if let Some(priority) = patch.priority {
                    task.priority = priority;
                }
                task.touch();
                updated.push(task.clone());
            }
            Ok(updated)
        })?;
        tracing::info!(requested = ids.len(), updated = updated.len(), "Bulk update");
        Ok(updated)
    }

    /// Delete every listed task through the recycle bin; each gets its own undo timer
    pub fn bulk_delete(&self, ids: &[String]) -> BoardResult<Vec<Task>> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let removed = self.mutate(|tasks| {
            let (removed, kept): (Vec<Task>, Vec<Task>) = std::mem::take(tasks)
                .into_iter()
                .partition(|t| wanted.contains(t.id.as_str()));
            *tasks = kept;
            Ok(removed)
        })?;
        self.bin.delete_many(removed.clone());
        tracing::info!(requested = ids.len(), deleted = removed.len(), "Bulk delete");
        Ok(removed)
    }

    pub fn clear_all(&self) -> BoardResult<usize> {
        let cleared = self.mutate(|tasks| {
            let cleared = tasks.len();
            tasks.clear();
            Ok(cleared)
        })?;
        tracing::info!(tasks = cleared, "All tasks cleared");
        Ok(cleared)
    }

    // ------------------------------------------------------------------------
    // Persistence and sessions
    // ------------------------------------------------------------------------

    /// Replace the in-memory tasks with what storage holds. Any save still
    /// waiting in the auto-save queue is dropped so it cannot overwrite the
    /// reloaded list.
    pub fn reload_from_storage(&self) -> BoardResult<usize> {
        let mut tasks = self.write();
        *tasks = self
            .store
            .get_json::<Vec<Task>>(TASKS_KEY)?
            .unwrap_or_default();
        self.autosave.forget();
        tracing::debug!(tasks = tasks.len(), "Reloaded tasks from storage");
        Ok(tasks.len())
    }

    /// Debounced write of the filters into settings
    pub fn remember_filters(&self, filters: LastUsedFilters) {
        self.filter_memory.push(filters);
    }

    /// Heartbeat, write our pending saves, then pick up task writes made by
    /// other sessions. Last writer wins.
    pub async fn sync_sessions(&self) -> BoardResult<Vec<StorageChange>> {
        if let Err(e) = self.presence.heartbeat() {
            self.warnings.record(&e);
        }
        self.autosave.flush().await;

        let changes = self.presence.external_changes()?;
        if changes.iter().any(|c| c.key == TASKS_KEY) {
            tracing::info!(changes = changes.len(), "Tasks changed in another session");
            match self.reload_from_storage() {
                Ok(_) => {}
                Err(BoardError::Storage(e)) => self.warnings.record(&e),
                Err(e) => return Err(e),
            }
        }
        Ok(changes)
    }

    /// Periodic presence heartbeat and cross-session reload
    pub fn spawn_session_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let board = Arc::clone(self);
        let period = self.config.timing.presence_heartbeat();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = board.sync_sessions().await {
                    tracing::warn!(error = %e, "Session sync failed");
                }
            }
        })
    }

    /// Write pending saves now
    pub async fn flush(&self) {
        self.autosave.flush().await;
        self.filter_memory.flush().await;
    }

    /// Flush pending saves, stop undo timers and leave presence
    pub async fn shutdown(&self) {
        self.autosave.shutdown().await;
        self.filter_memory.shutdown().await;
        self.bin.suspend();
        if let Err(e) = self.presence.leave() {
            tracing::warn!(error = %e, "Failed to remove presence entry");
        }
        tracing::info!(session = %self.session_id(), "Board closed");
    }

    /// Run `f` under the write lock and queue the result for auto-save.
    /// Pushing before the guard drops keeps saves in mutation order.
    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Task>) -> BoardResult<R>) -> BoardResult<R> {
        let mut tasks = self.write();
        let result = f(&mut tasks)?;
        self.autosave.push(tasks.clone());
        Ok(result)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Task>> {
        self.tasks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Task>> {
        self.tasks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn find_mut<'a>(tasks: &'a mut [Task], id: &str) -> BoardResult<&'a mut Task> {
    tasks
        .iter_mut()
        .find(|t| t.id == id)
        .ok_or_else(|| BoardError::NotFound(id.to_string()))
}

fn take(tasks: &mut Vec<Task>, id: &str) -> BoardResult<Task> {
    let pos = tasks
        .iter()
        .position(|t| t.id == id)
        .ok_or_else(|| BoardError::NotFound(id.to_string()))?;
    Ok(tasks.remove(pos))
}
