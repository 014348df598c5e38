//! User preferences persisted next to the task data

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::query::{AdvancedFilters, SortSpec, TaskFilter};
use crate::recycle_bin::DEFAULT_CAPACITY;
use crate::storage::{SETTINGS_KEY, Storage, WarningSlot};

pub const PAGE_SIZES: [usize; 3] = [10, 20, 50];
pub const MIN_AUTO_SAVE_DELAY_MS: u64 = 50;
pub const MAX_RECYCLE_ITEMS: usize = 1000;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("page size must be one of 10, 20 or 50, got {0}")]
    PageSize(usize),

    #[error("auto-save delay must be at least 50 ms, got {0}")]
    AutoSaveDelay(u64),

    #[error("recycle bin can hold at most 1000 items, got {0}")]
    RecycleCapacity(usize),

    #[error("settings are not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Uz,
    En,
    Ru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultView {
    #[default]
    Board,
    Table,
    Calendar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFrequency {
    Daily,
    #[default]
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
    Markdown,
}

/// Filters restored when the board is reopened
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LastUsedFilters {
    pub filter: TaskFilter,
    pub advanced: AdvancedFilters,
}

impl LastUsedFilters {
    pub fn is_empty(&self) -> bool {
        self.filter.is_empty() && self.advanced.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationSettings {
    pub enabled: bool,
    pub sound: bool,
    pub desktop: bool,
    pub email: bool,
    /// Hours before the due date
    pub task_due_reminder: u32,
    pub daily_digest: bool,
    pub weekly_report: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sound: true,
            desktop: false,
            email: false,
            task_due_reminder: 24,
            daily_digest: false,
            weekly_report: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PerformanceSettings {
    pub auto_save_delay: u64,
    pub max_recycle_items: usize,
    pub cache_expiry_hours: u32,
    pub batch_operations: bool,
    pub lazy_loading: bool,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            auto_save_delay: 100,
            max_recycle_items: DEFAULT_CAPACITY,
            cache_expiry_hours: 24,
            batch_operations: true,
            lazy_loading: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataManagementSettings {
    pub auto_backup: bool,
    pub backup_frequency: BackupFrequency,
    pub max_backups: usize,
    pub export_format: ExportFormat,
    pub import_validation: bool,
}

impl Default for DataManagementSettings {
    fn default() -> Self {
        Self {
            auto_backup: true,
            backup_frequency: BackupFrequency::default(),
            max_backups: 10,
            export_format: ExportFormat::default(),
            import_validation: true,
        }
    }
}

/// Board preferences. Missing fields in stored JSON fall back to defaults,
/// nested groups included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub page_size: usize,
    pub sort: SortSpec,
    pub last_used_filters: LastUsedFilters,
    pub theme: Theme,
    pub language: Language,
    pub compact_mode: bool,
    pub show_completed_tasks: bool,
    pub show_overdue_tasks: bool,
    pub default_view: DefaultView,
    pub notifications: NotificationSettings,
    pub performance: PerformanceSettings,
    pub data_management: DataManagementSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            page_size: 20,
            sort: SortSpec::default(),
            last_used_filters: LastUsedFilters::default(),
            theme: Theme::default(),
            language: Language::default(),
            compact_mode: false,
            show_completed_tasks: true,
            show_overdue_tasks: true,
            default_view: DefaultView::default(),
            notifications: NotificationSettings::default(),
            performance: PerformanceSettings::default(),
            data_management: DataManagementSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !PAGE_SIZES.contains(&self.page_size) {
            return Err(SettingsError::PageSize(self.page_size));
        }
        if self.performance.auto_save_delay < MIN_AUTO_SAVE_DELAY_MS {
            return Err(SettingsError::AutoSaveDelay(self.performance.auto_save_delay));
        }
        if self.performance.max_recycle_items > MAX_RECYCLE_ITEMS {
            return Err(SettingsError::RecycleCapacity(
                self.performance.max_recycle_items,
            ));
        }
        Ok(())
    }
}

/// Loaded-once settings with write-through persistence.
///
/// Write failures are not fatal: the in-memory value is kept and the failure
/// lands in the shared warning slot.
pub struct SettingsStore {
    store: Arc<Storage>,
    current: RwLock<AppSettings>,
    warnings: WarningSlot,
}

impl SettingsStore {
    pub fn load(store: Arc<Storage>, warnings: WarningSlot) -> Self {
        let current = match store.get_json::<AppSettings>(SETTINGS_KEY) {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                let defaults = AppSettings::default();
                if let Err(e) = store.set_json(SETTINGS_KEY, &defaults) {
                    warnings.record(&e);
                }
                defaults
            }
            Err(e) => {
                tracing::warn!(error = %e, "Falling back to default settings");
                AppSettings::default()
            }
        };

        Self {
            store,
            current: RwLock::new(current),
            warnings,
        }
    }

    pub fn get(&self) -> AppSettings {
        self.read().clone()
    }

    pub fn page_size(&self) -> usize {
        self.read().page_size
    }

    pub fn sort(&self) -> SortSpec {
        self.read().sort
    }

    pub fn last_used_filters(&self) -> LastUsedFilters {
        self.read().last_used_filters.clone()
    }

    /// Mutate and persist; returns the new value. The write lock is held
    /// through the save so stored settings follow update order.
    pub fn update(&self, f: impl FnOnce(&mut AppSettings)) -> AppSettings {
        let mut current = self.write();
        f(&mut current);
        self.persist(&current);
        current.clone()
    }

    /// Swap in a complete settings value after validating it
    pub fn replace(&self, settings: AppSettings) -> Result<AppSettings, SettingsError> {
        settings.validate()?;
        Ok(self.update(|current| *current = settings))
    }

    pub fn update_page_size(&self, page_size: usize) -> Result<AppSettings, SettingsError> {
        if !PAGE_SIZES.contains(&page_size) {
            return Err(SettingsError::PageSize(page_size));
        }
        Ok(self.update(|s| s.page_size = page_size))
    }

    pub fn update_sort(&self, sort: SortSpec) -> AppSettings {
        self.update(|s| s.sort = sort)
    }

    pub fn update_theme(&self, theme: Theme) -> AppSettings {
        self.update(|s| s.theme = theme)
    }

    pub fn update_language(&self, language: Language) -> AppSettings {
        self.update(|s| s.language = language)
    }

    pub fn update_last_used_filters(&self, filters: LastUsedFilters) -> AppSettings {
        self.update(|s| s.last_used_filters = filters)
    }

    pub fn clear_last_used_filters(&self) -> AppSettings {
        self.update_last_used_filters(LastUsedFilters::default())
    }

    pub fn export_json(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string_pretty(&*self.read())?)
    }

    /// Validate then apply. `false` leaves the current settings untouched.
    pub fn import_json(&self, json: &str) -> bool {
        let imported = match serde_json::from_str::<AppSettings>(json) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected settings import");
                return false;
            }
        };
        match self.replace(imported) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected settings import");
                false
            }
        }
    }

    pub fn reset_to_defaults(&self) -> AppSettings {
        self.update(|s| *s = AppSettings::default())
    }

    fn persist(&self, settings: &AppSettings) {
        if let Err(e) = self.store.set_json(SETTINGS_KEY, settings) {
            self.warnings.record(&e);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AppSettings> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AppSettings> {
        self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
