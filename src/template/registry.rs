//! Process-wide owner of the live form template.
//!
//! Reads hand out deep copies, so extraction never races calibration.
//! Mutation goes through a `CalibrationSession`, which holds the writer
//! mutex for its whole lifetime: at most one mutate-and-persist sequence
//! is in flight, and concurrent calibrations queue behind it.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::store::TemplateStore;
use super::types::{bump_patch_version, FormTemplate, PageSide, Region};
use super::TemplateError;
use crate::pipeline_config::PersistenceConfig;

/// A staged region replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionUpdate {
    pub page: PageSide,
    pub field: String,
    pub region: Region,
}

#[derive(Debug, Default)]
struct WriterState {
    /// Calibrations applied since the last successful write.
    unsaved: u32,
}

pub struct TemplateRegistry {
    live: RwLock<FormTemplate>,
    writer: Mutex<WriterState>,
    store: TemplateStore,
    policy: PersistenceConfig,
}

impl TemplateRegistry {
    /// Load the template from its canonical file.
    ///
    /// Malformed regions are logged, not rejected: the affected fields
    /// report "no region configured" at extraction time.
    pub fn load(path: &Path, policy: PersistenceConfig) -> Result<Self, TemplateError> {
        let store = TemplateStore::new(path, policy.backup_retention);
        let template = store.load()?;
        for (page, field) in template.invalid_regions() {
            tracing::warn!(
                template = %template.template_id,
                page = %page,
                field = %field,
                "Template field has an invalid region"
            );
        }
        tracing::info!(
            template = %template.template_id,
            version = %template.version,
            calibrations = template.calibration_count,
            "Template loaded"
        );
        Ok(Self::with_store(template, store, policy))
    }

    /// Wrap an in-memory template that persists to `path`.
    pub fn from_template(
        template: FormTemplate,
        path: &Path,
        policy: PersistenceConfig,
    ) -> Self {
        let store = TemplateStore::new(path, policy.backup_retention);
        Self::with_store(template, store, policy)
    }

    fn with_store(template: FormTemplate, store: TemplateStore, policy: PersistenceConfig) -> Self {
        Self {
            live: RwLock::new(template),
            writer: Mutex::new(WriterState::default()),
            store,
            policy,
        }
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    pub fn template_id(&self) -> Result<String, TemplateError> {
        Ok(self.read()?.template_id.clone())
    }

    /// Isolated deep copy of the current template.
    pub fn snapshot(&self) -> Result<FormTemplate, TemplateError> {
        Ok(self.read()?.clone())
    }

    /// Acquire the single-writer session. Blocks while another session is open.
    pub fn begin_calibration(&self) -> Result<CalibrationSession<'_>, TemplateError> {
        let writer = self.writer.lock().map_err(|_| TemplateError::LockPoisoned)?;
        Ok(CalibrationSession {
            registry: self,
            writer,
        })
    }

    /// One-shot region update under its own session.
    pub fn update_field_region(
        &self,
        page: PageSide,
        field: &str,
        region: Region,
    ) -> Result<Option<Region>, TemplateError> {
        self.begin_calibration()?.update_field_region(page, field, region)
    }

    /// One-shot persist under its own session.
    pub fn persist(&self, force: bool) -> Result<bool, TemplateError> {
        self.begin_calibration()?.persist(force)
    }

    pub fn unsaved_calibrations(&self) -> Result<u32, TemplateError> {
        Ok(self
            .writer
            .lock()
            .map_err(|_| TemplateError::LockPoisoned)?
            .unsaved)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, FormTemplate>, TemplateError> {
        self.live.read().map_err(|_| TemplateError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, FormTemplate>, TemplateError> {
        self.live.write().map_err(|_| TemplateError::LockPoisoned)
    }
}

/// Exclusive mutation handle over the live template.
pub struct CalibrationSession<'a> {
    registry: &'a TemplateRegistry,
    writer: MutexGuard<'a, WriterState>,
}

impl CalibrationSession<'_> {
    /// Direct access to the live template. Keep the guard short-lived:
    /// snapshots block while it is held.
    pub fn live_mut(&mut self) -> Result<RwLockWriteGuard<'_, FormTemplate>, TemplateError> {
        self.registry.write()
    }

    /// Replace a field's region and count the calibration.
    /// Returns the previous region.
    pub fn update_field_region(
        &mut self,
        page: PageSide,
        field: &str,
        region: Region,
    ) -> Result<Option<Region>, TemplateError> {
        if !region.is_valid() {
            return Err(TemplateError::InvalidRegion {
                field: field.to_string(),
                reason: format!("{region:?} is outside the unit square"),
            });
        }
        let mut live = self.registry.write()?;
        let definition = live
            .field_mut(page, field)
            .ok_or_else(|| TemplateError::UnknownField {
                page,
                field: field.to_string(),
            })?;
        let previous = definition.region.replace(region);
        live.calibration_count += 1;
        drop(live);

        self.writer.unsaved += 1;
        tracing::debug!(page = %page, field, "Field region updated");
        Ok(previous)
    }

    /// Apply staged updates; failures are logged and skipped.
    /// Returns how many were applied.
    pub fn apply_updates(&mut self, updates: &[RegionUpdate]) -> usize {
        let mut applied = 0;
        for update in updates {
            match self.update_field_region(update.page, &update.field, update.region) {
                Ok(_) => applied += 1,
                Err(e) => tracing::warn!(
                    page = %update.page,
                    field = %update.field,
                    error = %e,
                    "Skipping calibration update"
                ),
            }
        }
        applied
    }

    pub fn unsaved(&self) -> u32 {
        self.writer.unsaved
    }

    /// Write the template if forced or the auto-save threshold is reached.
    ///
    /// The version bump and timestamp reach the live template only after
    /// the write succeeded. Returns whether a write occurred.
    pub fn persist(&mut self, force: bool) -> Result<bool, TemplateError> {
        let threshold = self.registry.policy.auto_save_threshold;
        if !force && self.writer.unsaved < threshold {
            tracing::debug!(
                unsaved = self.writer.unsaved,
                threshold,
                "Template save deferred"
            );
            return Ok(false);
        }

        let mut next = self.registry.snapshot()?;
        next.version = bump_patch_version(&next.version);
        next.last_calibrated = Some(Utc::now());

        self.registry.store.write(&next)?;

        let mut live = self.registry.write()?;
        live.version = next.version.clone();
        live.last_calibrated = next.last_calibrated;
        drop(live);

        tracing::info!(
            template = %next.template_id,
            version = %next.version,
            calibrations = self.writer.unsaved,
            "Template calibration saved"
        );
        self.writer.unsaved = 0;
        Ok(true)
    }
}
