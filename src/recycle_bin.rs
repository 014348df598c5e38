//! Recycle bin: soft delete with a timed undo window
//!
//! A deleted task is held here as a full copy for a fixed window. During the
//! window it can be handed back to the caller; when the window closes its
//! timer purges it. The bin never touches the active task collection.
//!
//! Per item the lifecycle is `Pending -> Restored` or `Pending -> Expired`.
//! Whichever of restore and expiry happens first wins; the other is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::models::{Task, now_rfc3339};
use crate::storage::{RECYCLE_BIN_KEY, Storage, WarningSlot};

pub const DEFAULT_UNDO_WINDOW: Duration = Duration::from_millis(5000);
pub const DEFAULT_CAPACITY: usize = 100;

/// What the UI needs to render an undo affordance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingDeletion {
    pub task_id: String,
    pub title: String,
    pub deleted_at: String,
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecycleBinStats {
    pub total_items: usize,
    pub undo_available: usize,
    pub oldest_item: Option<String>,
    pub newest_item: Option<String>,
}

/// Stored form of a pending item
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredItem {
    task: Task,
    deleted_at: String,
}

struct Entry {
    task: Task,
    deleted_at: String,
    deadline: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    /// Oldest deletion first
    entries: Vec<Entry>,
    next_generation: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    window: Duration,
    capacity: usize,
    store: Option<Arc<Storage>>,
    warnings: WarningSlot,
    updates: watch::Sender<Vec<PendingDeletion>>,
}

/// Cheap to clone; clones share the same bin
#[derive(Clone)]
pub struct RecycleBin {
    shared: Arc<Shared>,
}

impl RecycleBin {
    /// In-memory bin. Must be used inside a tokio runtime.
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self::build(window, capacity, None, WarningSlot::default())
    }

    /// Bin mirrored to storage. Items still inside their window are rescheduled
    /// with whatever time they have left; items past it are dropped.
    pub fn load(
        store: Arc<Storage>,
        window: Duration,
        capacity: usize,
        warnings: WarningSlot,
    ) -> Self {
        let stored: Vec<StoredItem> = match store.get_json(RECYCLE_BIN_KEY) {
            Ok(items) => items.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable recycle bin record");
                Vec::new()
            }
        };

        let bin = Self::build(window, capacity, Some(store), warnings);
        let now = Utc::now();
        let mut restored = 0;
        {
            let mut inner = bin.shared.lock();
            for item in stored {
                let elapsed = DateTime::parse_from_rfc3339(&item.deleted_at)
                    .ok()
                    .and_then(|at| (now - at.with_timezone(&Utc)).to_std().ok())
                    .unwrap_or(Duration::ZERO);
                let Some(remaining) = window.checked_sub(elapsed).filter(|r| !r.is_zero()) else {
                    continue;
                };
                bin.insert(&mut inner, item.task, item.deleted_at, remaining);
                restored += 1;
            }
            bin.publish(&inner);
        }
        if restored > 0 {
            tracing::info!(items = restored, "Resumed pending deletions");
        }
        bin
    }

    fn build(
        window: Duration,
        capacity: usize,
        store: Option<Arc<Storage>>,
        warnings: WarningSlot,
    ) -> Self {
        let (updates, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                window,
                capacity: capacity.max(1),
                store,
                warnings,
                updates,
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.shared.window
    }

    /// Take a copy of `task` and start its undo window
    pub fn delete(&self, task: Task) {
        {
            let mut inner = self.shared.lock();
            let task_id = task.id.clone();

            // Re-deleting an id replaces the older entry and its timer
            if let Some(pos) = inner.entries.iter().position(|e| e.task.id == task_id) {
                inner.entries.remove(pos).timer.abort();
            }

            self.insert(&mut inner, task, now_rfc3339(), self.shared.window);

            while inner.entries.len() > self.shared.capacity {
                let evicted = inner.entries.remove(0);
                evicted.timer.abort();
                tracing::info!(task_id = %evicted.task.id, "Recycle bin full; oldest item purged early");
            }

            tracing::debug!(task_id = %task_id, window_ms = self.shared.window.as_millis() as u64, "Task moved to recycle bin");
            self.publish(&inner);
        }
    }

    /// Apply delete semantics to each task; every task gets its own timer
    pub fn delete_many(&self, tasks: Vec<Task>) {
        for task in tasks {
            self.delete(task);
        }
    }

    /// Hand back a pending task. `None` if it expired or was never deleted.
    pub fn restore(&self, task_id: &str) -> Option<Task> {
        let task = {
            let mut inner = self.shared.lock();
            let pos = inner.entries.iter().position(|e| e.task.id == task_id)?;
            let entry = inner.entries.remove(pos);
            entry.timer.abort();
            self.publish(&inner);
            entry.task
        };
        tracing::debug!(task_id = %task_id, "Task restored from recycle bin");
        Some(task)
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        self.shared
            .lock()
            .entries
            .iter()
            .any(|e| e.task.id == task_id)
    }

    /// Time left in the undo window; zero when the id is not pending
    pub fn remaining(&self, task_id: &str) -> Duration {
        let now = Instant::now();
        self.shared
            .lock()
            .entries
            .iter()
            .find(|e| e.task.id == task_id)
            .map(|e| e.deadline.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Pending deletions, most recent first
    pub fn pending(&self) -> Vec<PendingDeletion> {
        Self::snapshot(&self.shared.lock())
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything now, cancelling all timers
    pub fn clear_all(&self) {
        let mut inner = self.shared.lock();
        for entry in inner.entries.drain(..) {
            entry.timer.abort();
        }
        self.publish(&inner);
    }

    pub fn stats(&self) -> RecycleBinStats {
        let inner = self.shared.lock();
        RecycleBinStats {
            total_items: inner.entries.len(),
            undo_available: inner.entries.len(),
            oldest_item: inner.entries.iter().map(|e| e.deleted_at.clone()).min(),
            newest_item: inner.entries.iter().map(|e| e.deleted_at.clone()).max(),
        }
    }

    /// Watch the pending list; a new value is published on every change
    pub fn subscribe(&self) -> watch::Receiver<Vec<PendingDeletion>> {
        self.shared.updates.subscribe()
    }

    /// Stop all timers but keep the stored record, so a later `load` resumes them
    pub fn suspend(&self) {
        let inner = self.shared.lock();
        for entry in &inner.entries {
            entry.timer.abort();
        }
    }

    fn insert(&self, inner: &mut Inner, task: Task, deleted_at: String, after: Duration) {
        let generation = inner.next_generation;
        inner.next_generation += 1;

        let deadline = Instant::now() + after;
        let shared = Arc::clone(&self.shared);
        let task_id = task.id.clone();
        let timer = tokio::spawn(async move {
            sleep_until(deadline).await;
            RecycleBin { shared }.expire(&task_id, generation);
        });

        inner.entries.push(Entry {
            task,
            deleted_at,
            deadline,
            generation,
            timer,
        });
    }

    fn expire(&self, task_id: &str, generation: u64) {
        {
            let mut inner = self.shared.lock();
            let Some(pos) = inner
                .entries
                .iter()
                .position(|e| e.task.id == task_id && e.generation == generation)
            else {
                return;
            };
            inner.entries.remove(pos);
            self.publish(&inner);
        }
        tracing::debug!(task_id = %task_id, "Undo window closed; task purged");
    }

    fn snapshot(inner: &Inner) -> Vec<PendingDeletion> {
        let now = Instant::now();
        inner
            .entries
            .iter()
            .rev()
            .map(|e| PendingDeletion {
                task_id: e.task.id.clone(),
                title: e.task.title.clone(),
                deleted_at: e.deleted_at.clone(),
                remaining_ms: e.deadline.saturating_duration_since(now).as_millis() as u64,
            })
            .collect()
    }

    /// Publish the pending list and mirror it to storage. Called with the
    /// lock held so publications land in the order the changes were made.
    fn publish(&self, inner: &Inner) {
        let stored: Vec<StoredItem> = inner
            .entries
            .iter()
            .map(|e| StoredItem {
                task: e.task.clone(),
                deleted_at: e.deleted_at.clone(),
            })
            .collect();

        self.shared.updates.send_replace(Self::snapshot(inner));

        if let Some(store) = &self.shared.store
            && let Err(e) = store.set_json(RECYCLE_BIN_KEY, &stored)
        {
            self.shared.warnings.record(&e);
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample_task;
    use crate::storage::DEFAULT_QUOTA_BYTES;

    fn bin() -> RecycleBin {
        RecycleBin::new(DEFAULT_UNDO_WINDOW, DEFAULT_CAPACITY)
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_within_window_returns_identical_task() {
        let bin = bin();
        let mut task = sample_task("42", "Refactor parser");
        task.tags = vec!["core".into()];
        let before = task.clone();

        bin.delete(task);
        assert!(bin.is_pending("42"));
        assert_eq!(bin.pending().len(), 1);

        wait(4000).await;
        let restored = bin.restore("42").unwrap();
        assert_eq!(restored, before);
        assert!(bin.pending().is_empty());

        // Second restore is a quiet not-found
        assert!(bin.restore("42").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_item_cannot_be_restored() {
        let bin = bin();
        bin.delete(sample_task("42", "Refactor parser"));

        wait(5001).await;
        assert!(!bin.is_pending("42"));
        assert!(bin.restore("42").is_none());
        assert!(bin.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_deleted_together_are_independent() {
        let bin = bin();
        bin.delete_many(vec![sample_task("a", "First"), sample_task("b", "Second")]);

        assert!(bin.restore("a").is_some());
        assert!(bin.is_pending("b"));

        wait(5001).await;
        assert!(!bin.is_pending("b"));
        assert!(bin.restore("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_time_is_clamped() {
        let bin = bin();
        bin.delete(sample_task("1", "Timer"));

        wait(2000).await;
        assert_eq!(bin.remaining("1"), Duration::from_millis(3000));
        assert_eq!(bin.remaining("unknown"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_is_most_recent_first() {
        let bin = bin();
        bin.delete(sample_task("1", "Older"));
        wait(10).await;
        bin.delete(sample_task("2", "Newer"));

        let ids: Vec<String> = bin.pending().into_iter().map(|p| p.task_id).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_expire_redeleted_item() {
        let bin = bin();
        bin.delete(sample_task("1", "Again"));
        wait(4000).await;
        let task = bin.restore("1").unwrap();
        bin.delete(task);

        wait(1500).await;
        assert!(bin.is_pending("1"));
        wait(4000).await;
        assert!(!bin.is_pending("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_purges_oldest() {
        let bin = RecycleBin::new(DEFAULT_UNDO_WINDOW, 2);
        bin.delete(sample_task("1", "One"));
        bin.delete(sample_task("2", "Two"));
        bin.delete(sample_task("3", "Three"));

        assert!(!bin.is_pending("1"));
        assert_eq!(bin.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_and_stats() {
        let bin = bin();
        bin.delete(sample_task("1", "One"));
        bin.delete(sample_task("2", "Two"));

        let stats = bin.stats();
        assert_eq!(stats.total_items, 2);
        assert!(stats.oldest_item <= stats.newest_item);

        bin.clear_all();
        assert!(bin.is_empty());
        assert_eq!(bin.stats().oldest_item, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_changes() {
        let bin = bin();
        let mut rx = bin.subscribe();

        bin.delete(sample_task("1", "Watched"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);

        wait(5001).await;
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_items_survive_reload() {
        let store = Arc::new(Storage::open_in_memory(DEFAULT_QUOTA_BYTES, "s").unwrap());
        let warnings = WarningSlot::default();

        let first = RecycleBin::load(
            Arc::clone(&store),
            DEFAULT_UNDO_WINDOW,
            DEFAULT_CAPACITY,
            warnings.clone(),
        );
        first.delete(sample_task("7", "Persisted"));
        first.suspend();

        let second = RecycleBin::load(store, DEFAULT_UNDO_WINDOW, DEFAULT_CAPACITY, warnings);
        assert!(second.is_pending("7"));

        wait(5001).await;
        assert!(!second.is_pending("7"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_changes_keep_stored_record_current() {
        let store = Arc::new(Storage::open_in_memory(DEFAULT_QUOTA_BYTES, "s").unwrap());
        let bin = RecycleBin::load(
            Arc::clone(&store),
            DEFAULT_UNDO_WINDOW,
            DEFAULT_CAPACITY,
            WarningSlot::default(),
        );

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let bin = bin.clone();
                tokio::task::spawn_blocking(move || {
                    for i in 0..20 {
                        let id = format!("{worker}-{i}");
                        bin.delete(sample_task(&id, "Concurrent"));
                        if i % 2 == 0 {
                            bin.restore(&id);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.unwrap();
        }

        let stored: Vec<StoredItem> = store.get_json(RECYCLE_BIN_KEY).unwrap().unwrap();
        let mut stored_ids: Vec<String> = stored.into_iter().map(|item| item.task.id).collect();
        let mut pending_ids: Vec<String> =
            bin.pending().into_iter().map(|p| p.task_id).collect();
        stored_ids.sort();
        pending_ids.sort();
        assert_eq!(pending_ids.len(), 80);
        assert_eq!(stored_ids, pending_ids);

        assert_eq!(bin.subscribe().borrow().len(), 80);
        bin.clear_all();
    }
}
