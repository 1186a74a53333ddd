//! Runtime settings, loaded from `TABLOAD_`-prefixed environment variables.

use serde::Deserialize;

use crate::error::LoadError;

/// Storage platform hint for `https://` locations.
///
/// Cloud blob endpoints are plain HTTPS URLs, so the scheme alone cannot
/// identify the vendor; this setting picks the builder for those URIs.
/// Non-HTTPS schemes (`s3://`, `gs://`, `azure://`) route themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Default,
    Aws,
    Gcp,
    Azure,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Warehouse connection URL; the dialect is inferred from its scheme.
    pub database_url: String,
    /// Source location: local directory or object-store URI.
    pub directory_path: String,
    pub archive_path: String,
    pub duplicate_files_path: String,

    /// Read/write batch boundary, fixed per run.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub file_helper_platform: Platform,
    /// Path to the declarative source catalog.
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,

    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_user: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub from_email: Option<String>,
    /// Cc'd on every failure email when set.
    #[serde(default)]
    pub data_team_email: Option<String>,
    /// Destination for the end-of-run summary notification.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_batch_size() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_catalog_path() -> String {
    "sources.yaml".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

impl Settings {
    /// Load settings from the environment (`TABLOAD_` prefix).
    pub fn load() -> Result<Self, LoadError> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix("TABLOAD").try_parsing(true))
            .build()
            .map_err(|e| LoadError::Config(e.to_string()))?;
        cfg.try_deserialize()
            .map_err(|e| LoadError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_settings() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "database_url": "sqlite://warehouse.db",
            "directory_path": "/data/incoming",
            "archive_path": "/data/archive",
            "duplicate_files_path": "/data/duplicates",
        }))
        .unwrap();
        assert_eq!(settings.batch_size, 10_000);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.smtp_port, 587);
        assert_eq!(settings.file_helper_platform, Platform::Default);
        assert!(settings.webhook_url.is_none());
    }

    #[test]
    fn platform_parses_lowercase() {
        let p: Platform = serde_json::from_value(serde_json::json!("azure")).unwrap();
        assert_eq!(p, Platform::Azure);
    }
}
