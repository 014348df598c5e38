//! Storage schema versions, upgrades and backups

use chrono::Utc;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::models::Task;
use crate::storage::{
    BACKUP_PREFIX, RECYCLE_BIN_KEY, SETTINGS_KEY, Storage, StorageError, TASKS_KEY, USERS_KEY,
    VERSION_KEY,
};

pub const CURRENT_VERSION: &str = "v1.2";

/// Keys captured by a backup
const BACKED_UP_KEYS: [&str; 3] = [TASKS_KEY, SETTINGS_KEY, RECYCLE_BIN_KEY];

const LEGACY_KEYS: [(&str, &str); 2] = [
    ("taskboard/v1/tasks", TASKS_KEY),
    ("taskboard/v1/users", USERS_KEY),
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no backup stored under {0}")]
    UnknownBackup(String),
}

pub struct Migration {
    pub version: &'static str,
    pub description: &'static str,
    apply: fn(&Storage) -> Result<usize, MigrationError>,
}

/// Known upgrades, oldest first
pub fn migrations() -> &'static [Migration] {
    const MIGRATIONS: &[Migration] = &[
        Migration {
            version: "v1.1",
            description: "Move slash-namespaced keys to the colon namespace",
            apply: move_legacy_keys,
        },
        Migration {
            version: "v1.2",
            description: "Normalize stored tasks",
            apply: normalize_tasks,
        },
    ];
    MIGRATIONS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from: String,
    pub version: String,
    pub applied: Vec<String>,
    pub backup: Option<String>,
    pub errors: Vec<String>,
}

impl MigrationReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Stored schema version; a store that never recorded one is `v0`
pub fn stored_version(store: &Storage) -> Result<String, MigrationError> {
    Ok(store
        .get_json::<String>(VERSION_KEY)?
        .unwrap_or_else(|| "v0".to_string()))
}

/// Apply every migration newer than the stored version, in order.
///
/// A backup is taken first when there is anything to back up. The first
/// failing step stops the run; the version key then names the last step that
/// succeeded.
pub fn run(store: &Storage, max_backups: usize) -> Result<MigrationReport, MigrationError> {
    let from = stored_version(store)?;
    let mut report = MigrationReport {
        from: from.clone(),
        version: from.clone(),
        applied: Vec::new(),
        backup: None,
        errors: Vec::new(),
    };

    let pending: Vec<&Migration> = migrations()
        .iter()
        .filter(|m| compare_versions(m.version, &from) == Ordering::Greater)
        .collect();
    if pending.is_empty() {
        return Ok(report);
    }

    report.backup = create_backup(store)?;
    prune_backups(store, max_backups)?;

    tracing::info!(from = %from, target = CURRENT_VERSION, steps = pending.len(), "Migrating storage");
    for migration in pending {
        match (migration.apply)(store) {
            Ok(changed) => {
                tracing::info!(version = migration.version, changed, "{}", migration.description);
                report.applied.push(migration.version.to_string());
                report.version = migration.version.to_string();
            }
            Err(e) => {
                tracing::error!(version = migration.version, error = %e, "Migration failed");
                report
                    .errors
                    .push(format!("migration to {} failed: {e}", migration.version));
                break;
            }
        }
    }

    if report.version != from {
        store.set_json(VERSION_KEY, &report.version)?;
    }
    Ok(report)
}

/// Numeric, dot-separated comparison; `v1.10` is newer than `v1.9`
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parts(a), parts(b));
    for i in 0..a.len().max(b.len()) {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn move_legacy_keys(store: &Storage) -> Result<usize, MigrationError> {
    let mut moved = 0;
    for (legacy, current) in LEGACY_KEYS {
        let Some(raw) = store.get_raw(legacy)? else {
            continue;
        };
        if store.get_raw(current)?.is_none() {
            store.set_raw(current, &raw)?;
            moved += 1;
        }
        store.remove(legacy)?;
    }
    Ok(moved)
}

fn normalize_tasks(store: &Storage) -> Result<usize, MigrationError> {
    let Some(mut tasks) = store.get_json::<Vec<Task>>(TASKS_KEY)? else {
        return Ok(0);
    };

    let mut changed = 0;
    for task in &mut tasks {
        if normalize_task(task) {
            changed += 1;
        }
    }
    if changed > 0 {
        store.set_json(TASKS_KEY, &tasks)?;
    }
    Ok(changed)
}

fn normalize_task(task: &mut Task) -> bool {
    let mut changed = false;

    let mut seen = HashSet::new();
    let before = task.tags.len();
    task.tags.retain(|tag| seen.insert(tag.clone()));
    changed |= task.tags.len() != before;

    if let Some(points) = task.points
        && points < 0.0
    {
        task.points = Some(0.0);
        changed = true;
    }

    if task.updated_at.is_empty() {
        task.updated_at = task.created_at.clone();
        changed = true;
    }

    changed
}

/// Snapshot tasks, settings and recycle bin as stored, unreadable values included.
/// `None` when there was nothing to save.
pub fn create_backup(store: &Storage) -> Result<Option<String>, MigrationError> {
    let mut captured = BTreeMap::new();
    for key in BACKED_UP_KEYS {
        if let Some(raw) = store.get_raw(key)? {
            captured.insert(key.to_string(), raw);
        }
    }
    if captured.is_empty() {
        return Ok(None);
    }

    let mut millis = Utc::now().timestamp_millis();
    let mut key = format!("{BACKUP_PREFIX}{millis}");
    while store.get_raw(&key)?.is_some() {
        millis += 1;
        key = format!("{BACKUP_PREFIX}{millis}");
    }

    store.set_json(&key, &captured)?;
    tracing::info!(key = %key, keys = captured.len(), "Backup created");
    Ok(Some(key))
}

/// Backup keys, newest first
pub fn list_backups(store: &Storage) -> Result<Vec<String>, MigrationError> {
    let mut keys = store.keys_with_prefix(BACKUP_PREFIX)?;
    keys.sort_by_key(|key| std::cmp::Reverse(backup_millis(key)));
    Ok(keys)
}

/// Keep only the newest `max_backups`; returns how many were removed
pub fn prune_backups(store: &Storage, max_backups: usize) -> Result<usize, MigrationError> {
    let mut removed = 0;
    for key in list_backups(store)?.into_iter().skip(max_backups) {
        if store.remove(&key)? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Write every key captured in a backup back to storage
pub fn restore_backup(store: &Storage, key: &str) -> Result<Vec<String>, MigrationError> {
    let captured: BTreeMap<String, String> = store
        .get_json(key)?
        .ok_or_else(|| MigrationError::UnknownBackup(key.to_string()))?;

    let mut restored = Vec::with_capacity(captured.len());
    for (captured_key, raw) in captured {
        store.set_raw(&captured_key, &raw)?;
        restored.push(captured_key);
    }
    tracing::info!(backup = %key, keys = restored.len(), "Backup restored");
    Ok(restored)
}

fn backup_millis(key: &str) -> i64 {
    key.strip_prefix(BACKUP_PREFIX)
        .and_then(|millis| millis.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample_task;
    use crate::storage::DEFAULT_QUOTA_BYTES;

    fn store() -> Storage {
        Storage::open_in_memory(DEFAULT_QUOTA_BYTES, "test").unwrap()
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("v1.2", "v1.1"), Ordering::Greater);
        assert_eq!(compare_versions("v1.1", "v1.1"), Ordering::Equal);
        assert_eq!(compare_versions("v1", "v1.0"), Ordering::Equal);
        assert_eq!(compare_versions("v1.10", "v1.9"), Ordering::Greater);
        assert_eq!(compare_versions("v0", "v1.1"), Ordering::Less);
    }

    #[test]
    fn test_fresh_store_migrates_without_backup() {
        let store = store();
        let report = run(&store, 10).unwrap();

        assert!(report.success());
        assert_eq!(report.from, "v0");
        assert_eq!(report.version, CURRENT_VERSION);
        assert_eq!(report.applied, vec!["v1.1", "v1.2"]);
        assert_eq!(report.backup, None);
        assert_eq!(stored_version(&store).unwrap(), CURRENT_VERSION);

        let again = run(&store, 10).unwrap();
        assert!(again.applied.is_empty());
    }

    #[test]
    fn test_legacy_keys_are_moved() {
        let store = store();
        store.set_raw("taskboard/v1/tasks", r#"[{"id":"1","title":"Legacy","created_at":"2025-01-01T00:00:00Z"}]"#).unwrap();
        store.set_raw("taskboard/v1/users", "[]").unwrap();
        store.set_raw(USERS_KEY, r#"[{"kept":true}]"#).unwrap();

        run(&store, 10).unwrap();

        let tasks: Vec<Task> = store.get_json(TASKS_KEY).unwrap().unwrap();
        assert_eq!(tasks[0].title, "Legacy");
        assert_eq!(tasks[0].updated_at, "2025-01-01T00:00:00Z");
        assert_eq!(store.get_raw(USERS_KEY).unwrap().unwrap(), r#"[{"kept":true}]"#);
        assert!(store.get_raw("taskboard/v1/tasks").unwrap().is_none());
        assert!(store.get_raw("taskboard/v1/users").unwrap().is_none());
    }

    #[test]
    fn test_tasks_are_normalized() {
        let store = store();
        let mut task = sample_task("1", "Normalize me");
        task.tags = vec!["ui".into(), "ui".into(), "api".into()];
        task.points = Some(-3.0);
        store.set_json(TASKS_KEY, &vec![task]).unwrap();
        store.set_json(VERSION_KEY, "v1.1").unwrap();

        let report = run(&store, 10).unwrap();
        assert_eq!(report.applied, vec!["v1.2"]);
        assert!(report.backup.is_some());

        let tasks: Vec<Task> = store.get_json(TASKS_KEY).unwrap().unwrap();
        assert_eq!(tasks[0].tags, vec!["ui", "api"]);
        assert_eq!(tasks[0].points, Some(0.0));
    }

    #[test]
    fn test_failure_stops_at_last_good_version() {
        let store = store();
        store.set_raw(TASKS_KEY, "{broken").unwrap();

        let report = run(&store, 10).unwrap();
        assert!(!report.success());
        assert!(report.backup.is_some());
        assert_eq!(report.applied, vec!["v1.1"]);
        assert_eq!(stored_version(&store).unwrap(), "v1.1");
    }

    #[test]
    fn test_backup_restore_and_prune() {
        let store = store();
        store
            .set_json(TASKS_KEY, &vec![sample_task("1", "Before")])
            .unwrap();
        let first = create_backup(&store).unwrap().unwrap();

        store.set_json(TASKS_KEY, &Vec::<Task>::new()).unwrap();
        let second = create_backup(&store).unwrap().unwrap();
        assert_ne!(first, second);
        assert_eq!(list_backups(&store).unwrap(), vec![second.clone(), first.clone()]);

        let restored = restore_backup(&store, &first).unwrap();
        assert_eq!(restored, vec![TASKS_KEY.to_string()]);
        let tasks: Vec<Task> = store.get_json(TASKS_KEY).unwrap().unwrap();
        assert_eq!(tasks[0].title, "Before");

        assert_eq!(prune_backups(&store, 1).unwrap(), 1);
        assert_eq!(list_backups(&store).unwrap(), vec![second]);

        assert!(matches!(
            restore_backup(&store, &first),
            Err(MigrationError::UnknownBackup(_))
        ));
    }
}
