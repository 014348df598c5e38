//! Advisory multi-session presence
//!
//! Each open board writes a heartbeat under `taskboard:v1:presence:<session>`.
//! Nothing here locks anything: sessions only learn about each other, and the
//! last writer of a key wins.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::models::now_rfc3339;
use crate::storage::{PRESENCE_PREFIX, Storage, StorageChange, StorageResult};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Fresh session identifier
pub fn new_session_id() -> String {
    format!("session_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub session_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub label: String,
}

impl PresenceRecord {
    fn seen_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

pub struct Presence {
    store: Arc<Storage>,
    label: String,
    ttl: ChronoDuration,
    seen_revision: Mutex<i64>,
}

impl Presence {
    /// The session id is the storage writer id, so change tracking and
    /// presence agree on who "we" are.
    pub fn new(store: Arc<Storage>, label: impl Into<String>, ttl: Duration) -> Self {
        let seen_revision = store.revision().unwrap_or(0);
        Self {
            store,
            label: label.into(),
            ttl: ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::minutes(5)),
            seen_revision: Mutex::new(seen_revision),
        }
    }

    pub fn session_id(&self) -> &str {
        self.store.writer()
    }

    fn key(&self) -> String {
        format!("{PRESENCE_PREFIX}{}", self.session_id())
    }

    /// Announce this session and drop entries that went quiet
    pub fn heartbeat(&self) -> StorageResult<()> {
        let record = PresenceRecord {
            session_id: self.session_id().to_string(),
            timestamp: now_rfc3339(),
            label: self.label.clone(),
        };
        self.store.set_json(&self.key(), &record)?;
        self.prune_at(Utc::now())?;
        Ok(())
    }

    /// Sessions seen within the TTL, newest first
    pub fn active_sessions(&self) -> StorageResult<Vec<PresenceRecord>> {
        self.active_sessions_at(Utc::now())
    }

    pub fn active_sessions_at(&self, now: DateTime<Utc>) -> StorageResult<Vec<PresenceRecord>> {
        let cutoff = now - self.ttl;
        let mut active: Vec<(DateTime<Utc>, PresenceRecord)> = self
            .records()?
            .into_iter()
            .filter_map(|(_, record)| record.seen_at().map(|at| (at, record)))
            .filter(|(at, _)| *at > cutoff)
            .collect();
        active.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(active.into_iter().map(|(_, record)| record).collect())
    }

    /// Remove presence entries older than the TTL; returns how many went
    pub fn prune_at(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let cutoff = now - self.ttl;
        let mut removed = 0;
        for (key, record) in self.records()? {
            let stale = record.seen_at().is_none_or(|at| at < cutoff);
            if stale && self.store.remove(&key)? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "Pruned stale presence entries");
        }
        Ok(removed)
    }

    pub fn is_only_active(&self) -> StorageResult<bool> {
        Ok(self
            .active_sessions()?
            .iter()
            .all(|record| record.session_id == self.session_id()))
    }

    /// Drop this session's presence entry
    pub fn leave(&self) -> StorageResult<()> {
        self.store.remove(&self.key())?;
        Ok(())
    }

    /// Keys other sessions wrote since the previous call, heartbeats excluded
    pub fn external_changes(&self) -> StorageResult<Vec<StorageChange>> {
        let latest = self.store.revision()?;
        self.changes_up_to(latest)
    }

    /// Changes in `(seen, latest]`. Writes that land after `latest` was read
    /// stay above the mark and are reported by the next call.
    fn changes_up_to(&self, latest: i64) -> StorageResult<Vec<StorageChange>> {
        let mut seen = self
            .seen_revision
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let changes = self.store.changes_since(*seen, self.session_id())?;
        *seen = latest.max(*seen);

        Ok(changes
            .into_iter()
            .filter(|change| change.revision <= latest)
            .filter(|change| !change.key.starts_with(PRESENCE_PREFIX))
            .collect())
    }

    fn records(&self) -> StorageResult<Vec<(String, PresenceRecord)>> {
        let mut records = Vec::new();
        for key in self.store.keys_with_prefix(PRESENCE_PREFIX)? {
            match self.store.get_json::<PresenceRecord>(&key) {
                Ok(Some(record)) => records.push((key, record)),
                Ok(None) => {}
                Err(e) => tracing::debug!(key = %key, error = %e, "Skipping unreadable presence entry"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DEFAULT_QUOTA_BYTES, TASKS_KEY};
    use std::path::PathBuf;

    struct TempDb(PathBuf);

    impl TempDb {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!("taskboard-presence-{}.sqlite", uuid::Uuid::new_v4())))
        }

        fn open(&self, session: &str) -> Arc<Storage> {
            Arc::new(Storage::open(&self.0, DEFAULT_QUOTA_BYTES, session).unwrap())
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_session_ids_are_prefixed_and_unique() {
        let a = new_session_id();
        assert!(a.starts_with("session_"));
        assert_ne!(a, new_session_id());
    }

    #[test]
    fn test_two_sessions_see_each_other() {
        let db = TempDb::new();
        let first = Presence::new(db.open("session_a"), "first", DEFAULT_TTL);
        let second = Presence::new(db.open("session_b"), "second", DEFAULT_TTL);

        first.heartbeat().unwrap();
        assert!(first.is_only_active().unwrap());

        second.heartbeat().unwrap();
        let active = first.active_sessions().unwrap();
        assert_eq!(active.len(), 2);
        assert!(!first.is_only_active().unwrap());

        second.leave().unwrap();
        assert!(first.is_only_active().unwrap());
    }

    #[test]
    fn test_stale_sessions_are_pruned() {
        let store = Arc::new(Storage::open_in_memory(DEFAULT_QUOTA_BYTES, "session_me").unwrap());
        let presence = Presence::new(Arc::clone(&store), "me", DEFAULT_TTL);

        let stale = PresenceRecord {
            session_id: "session_gone".into(),
            timestamp: "2020-01-01T00:00:00.000Z".into(),
            label: String::new(),
        };
        store
            .set_json(&format!("{PRESENCE_PREFIX}session_gone"), &stale)
            .unwrap();

        presence.heartbeat().unwrap();
        let active = presence.active_sessions().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "session_me");
        assert_eq!(store.keys_with_prefix(PRESENCE_PREFIX).unwrap().len(), 1);
    }

    #[test]
    fn test_active_sessions_newest_first() {
        let store = Arc::new(Storage::open_in_memory(DEFAULT_QUOTA_BYTES, "session_me").unwrap());
        let presence = Presence::new(Arc::clone(&store), "me", DEFAULT_TTL);
        for (id, ts) in [
            ("session_old", "2025-03-01T10:00:00.000Z"),
            ("session_new", "2025-03-01T10:03:00.000Z"),
        ] {
            let record = PresenceRecord {
                session_id: id.into(),
                timestamp: ts.into(),
                label: String::new(),
            };
            store.set_json(&format!("{PRESENCE_PREFIX}{id}"), &record).unwrap();
        }

        let now = DateTime::parse_from_rfc3339("2025-03-01T10:04:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let ids: Vec<String> = presence
            .active_sessions_at(now)
            .unwrap()
            .into_iter()
            .map(|r| r.session_id)
            .collect();
        assert_eq!(ids, vec!["session_new", "session_old"]);
    }

    #[test]
    fn test_external_changes_skip_own_writes_and_heartbeats() {
        let db = TempDb::new();
        let mine = db.open("session_a");
        let theirs = db.open("session_b");
        let presence = Presence::new(Arc::clone(&mine), "a", DEFAULT_TTL);

        mine.set_raw(TASKS_KEY, "[]").unwrap();
        Presence::new(Arc::clone(&theirs), "b", DEFAULT_TTL)
            .heartbeat()
            .unwrap();
        assert!(presence.external_changes().unwrap().is_empty());

        theirs.set_raw(TASKS_KEY, "[]").unwrap();
        let changes = presence.external_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, TASKS_KEY);
        assert_eq!(changes[0].writer, "session_b");

        assert!(presence.external_changes().unwrap().is_empty());
    }

    #[test]
    fn test_write_after_revision_read_is_reported_next_time() {
        let db = TempDb::new();
        let mine = db.open("session_a");
        let theirs = db.open("session_b");
        let presence = Presence::new(Arc::clone(&mine), "a", DEFAULT_TTL);

        let latest = mine.revision().unwrap();
        theirs.set_raw(TASKS_KEY, "[]").unwrap();
        assert!(presence.changes_up_to(latest).unwrap().is_empty());

        let changes = presence.external_changes().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, TASKS_KEY);
        assert!(presence.external_changes().unwrap().is_empty());
    }
}
