use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Formscan";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable overriding the data directory (useful for tests and CI).
pub const DATA_DIR_ENV: &str = "FORMSCAN_DATA_DIR";

/// Get the application data directory.
/// `~/Formscan/` unless `FORMSCAN_DATA_DIR` is set. Falls back to the
/// current directory when no home directory can be determined.
pub fn app_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Directory holding canonical form templates (`<template_id>.json`).
pub fn templates_dir() -> PathBuf {
    app_data_dir().join("templates")
}

/// Canonical path of a template by identifier.
pub fn template_path(template_id: &str) -> PathBuf {
    templates_dir().join(format!("{template_id}.json"))
}

/// Optional extraction config file (`~/Formscan/extraction.json`).
pub fn extraction_config_path() -> PathBuf {
    app_data_dir().join("extraction.json")
}

/// Default `tracing` filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "formscan=debug,formscan_lib=debug"
    } else {
        "formscan=info,formscan_lib=info"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_dir_under_app_data() {
        let templates = templates_dir();
        let app = app_data_dir();
        assert!(templates.starts_with(app));
        assert!(templates.ends_with("templates"));
    }

    #[test]
    fn template_path_uses_identifier() {
        let path = template_path("cif-2024");
        assert!(path.ends_with("templates/cif-2024.json"));
    }

    #[test]
    fn app_name_is_formscan() {
        assert_eq!(APP_NAME, "Formscan");
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }

    #[test]
    fn log_filter_targets_crate() {
        assert!(default_log_filter().contains("formscan_lib="));
    }
}
