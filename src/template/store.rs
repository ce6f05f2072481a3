//! Durable template storage.
//!
//! The canonical file is never written in place: the new document goes to a
//! temp file in the same directory and is renamed over the canonical path,
//! so readers see either the old or the new template, never a partial one.
//! The previous canonical file is copied into `backups/` first.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::types::FormTemplate;
use super::TemplateError;

const BACKUP_DIR: &str = "backups";

/// File-backed template location plus its backup policy.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    path: PathBuf,
    backup_dir: PathBuf,
    retention: usize,
}

impl TemplateStore {
    pub fn new(path: impl Into<PathBuf>, retention: usize) -> Self {
        let path = path.into();
        let backup_dir = path
            .parent()
            .map(|p| p.join(BACKUP_DIR))
            .unwrap_or_else(|| PathBuf::from(BACKUP_DIR));
        Self {
            path,
            backup_dir,
            retention,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn load(&self) -> Result<FormTemplate, TemplateError> {
        if !self.path.exists() {
            return Err(TemplateError::NotFound(self.path.clone()));
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Back up the current canonical file, then atomically replace it.
    ///
    /// Returns the backup path when a previous file existed.
    pub fn write(&self, template: &FormTemplate) -> Result<Option<PathBuf>, TemplateError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let backup = self.backup_existing(&template.template_id)?;

        let json = serde_json::to_vec_pretty(template)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| TemplateError::Io(e.error))?;

        let pruned = self.prune_backups(&template.template_id)?;
        tracing::info!(
            template = %template.template_id,
            version = %template.version,
            path = %self.path.display(),
            pruned,
            "Template written"
        );
        Ok(backup)
    }

    /// Backups for a template, oldest first.
    pub fn list_backups(&self, template_id: &str) -> Result<Vec<PathBuf>, TemplateError> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{template_id}-");
        let mut backups: Vec<PathBuf> = fs::read_dir(&self.backup_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
            })
            .collect();
        // Timestamp in the name sorts chronologically.
        backups.sort();
        Ok(backups)
    }

    fn backup_existing(&self, template_id: &str) -> Result<Option<PathBuf>, TemplateError> {
        if !self.path.exists() {
            return Ok(None);
        }
        fs::create_dir_all(&self.backup_dir)?;

        let previous_version = fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<FormTemplate>(&raw).ok())
            .map(|t| t.version)
            .unwrap_or_else(|| "unknown".to_string());
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");

        let mut target = self
            .backup_dir
            .join(format!("{template_id}-{stamp}-v{previous_version}.json"));
        let mut suffix = 1;
        while target.exists() {
            target = self
                .backup_dir
                .join(format!("{template_id}-{stamp}-{suffix}-v{previous_version}.json"));
            suffix += 1;
        }

        fs::copy(&self.path, &target)?;
        Ok(Some(target))
    }

    fn prune_backups(&self, template_id: &str) -> Result<usize, TemplateError> {
        let backups = self.list_backups(template_id)?;
        if backups.len() <= self.retention {
            return Ok(0);
        }
        let excess = backups.len() - self.retention;
        for old in &backups[..excess] {
            if let Err(e) = fs::remove_file(old) {
                tracing::warn!(path = %old.display(), error = %e, "Failed to prune template backup");
            }
        }
        Ok(excess)
    }
}
