use crate::backup::BackupConfig;
use crate::entry::ValidationOptions;
use crate::error::{IoContext, IoError};
use crate::layout::LayoutConfig;
use crate::validator::ValidatorConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "beanfile.json";

/// Everything the engines need, passed explicitly into each call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub version: String,
    pub layout: LayoutConfig,
    pub backup: BackupConfig,
    pub validator: ValidatorConfig,
    pub tolerance: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: crate::version::APP_VERSION.to_string(),
            layout: LayoutConfig::default(),
            backup: BackupConfig::default(),
            validator: ValidatorConfig::default(),
            tolerance: ValidationOptions::default().tolerance,
        }
    }
}

impl EngineConfig {
    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            tolerance: self.tolerance,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("{}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Read `beanfile.json` from `dir`. A missing file yields the defaults. A
/// relative layout folder is taken relative to `dir`.
pub fn load(dir: &Path) -> Result<EngineConfig, ConfigError> {
    let path = config_path(dir);
    let mut config: EngineConfig = match crate::journal::read_optional(&path)? {
        Some(text) => serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.clone(),
            source,
        })?,
        None => {
            log::debug!("{} not found, using defaults", path.display());
            EngineConfig::default()
        }
    };
    if config.layout.folder.is_relative() {
        config.layout.folder = dir.join(&config.layout.folder);
    }
    Ok(config)
}

/// Write `config` as `beanfile.json` in `dir`, stamped with this version.
pub fn save(dir: &Path, config: &EngineConfig) -> Result<(), ConfigError> {
    let path = config_path(dir);
    let config = EngineConfig {
        version: crate::version::APP_VERSION.to_string(),
        ..config.clone()
    };
    let mut json = serde_json::to_string_pretty(&config).map_err(|source| ConfigError::Json {
        path: path.clone(),
        source,
    })?;
    json.push('\n');
    fs::create_dir_all(dir).at(dir)?;
    crate::journal::atomic_write(&path, json.as_bytes())?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::layout::LayoutMode;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "beanfile-config-{prefix}-{}-{now}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = temp_dir("missing");
        let config = load(&dir).unwrap();
        assert_eq!(config.backup.max_backup_files, 10);
        assert!(!config.backup.strict);
        assert_eq!(config.validator.program, "bean-check");
        assert_eq!(config.validator.timeout_secs, 30);
        assert_eq!(config.tolerance, Decimal::new(5, 3));
        assert_eq!(config.layout.folder, dir.join("."));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = temp_dir("partial");
        fs::write(
            config_path(&dir),
            r#"{"layout": {"mode": "single", "extension": "bean"}, "backup": {"max_backup_files": 2}, "tolerance": "0.01"}"#,
        )
        .unwrap();
        let config = load(&dir).unwrap();
        assert_eq!(config.layout.mode, LayoutMode::Single);
        assert_eq!(config.layout.extension, "bean");
        assert_eq!(config.layout.root_stem, "ledger");
        assert_eq!(config.backup.max_backup_files, 2);
        assert!(config.backup.enabled);
        assert_eq!(config.tolerance, Decimal::new(1, 2));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_then_load() {
        let dir = temp_dir("save");
        let mut config = EngineConfig::default();
        config.validator.args = vec!["--strict".to_string()];
        save(&dir, &config).unwrap();
        let text = fs::read_to_string(config_path(&dir)).unwrap();
        assert!(text.ends_with("}\n"));
        let loaded = load(&dir).unwrap();
        assert_eq!(loaded.validator.args, config.validator.args);
        assert_eq!(loaded.version, crate::version::APP_VERSION);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = temp_dir("bad");
        fs::write(config_path(&dir), "{ not json").unwrap();
        let err = load(&dir).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE));
        let _ = fs::remove_dir_all(&dir);
    }
}
