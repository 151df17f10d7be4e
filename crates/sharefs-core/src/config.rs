// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Module and export configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::fault::FaultPolicy;
use crate::logging::LoggingConfig;

pub const DEFAULT_IO_LIMIT: u64 = 20 * 1024 * 1024;
pub const MAX_USER_ID_LEN: usize = 64;
pub const MAX_SECRET_LEN: usize = 88;

/// Settings shared by every export of the module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Applied to the mode of every create.
    pub umask: u32,
    pub max_file_size: u64,
    /// Largest single engine read issued by read2.
    pub max_read: u64,
    /// Largest single engine write issued by write2.
    pub max_write: u64,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            umask: 0,
            max_file_size: DEFAULT_IO_LIMIT,
            max_read: DEFAULT_IO_LIMIT,
            max_write: DEFAULT_IO_LIMIT,
        }
    }
}

impl ModuleConfig {
    pub fn validate(&self) -> FsResult<()> {
        if self.umask & !0o7777 != 0 {
            return Err(FsError::Config(format!("umask {:o} has non-permission bits", self.umask)));
        }
        if self.max_read == 0 || self.max_write == 0 {
            return Err(FsError::Config("max_read and max_write must be non-zero".into()));
        }
        Ok(())
    }
}

/// One export's settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    pub name: String,
    #[serde(default = "default_export_path")]
    pub path: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Only honoured by engines that support fault injection.
    #[serde(default)]
    pub fault_policy: Option<FaultPolicy>,
}

fn default_export_path() -> String {
    "/".to_string()
}

impl ExportConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: default_export_path(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> FsResult<()> {
        if self.name.is_empty() {
            return Err(FsError::Config("export name must not be empty".into()));
        }
        if !self.path.starts_with('/') {
            return Err(FsError::Config(format!("export path {:?} is not absolute", self.path)));
        }
        if self.user_id.as_ref().is_some_and(|id| id.len() > MAX_USER_ID_LEN) {
            return Err(FsError::Config(format!(
                "user_id longer than {MAX_USER_ID_LEN} bytes"
            )));
        }
        if self.secret_access_key.as_ref().is_some_and(|key| key.len() > MAX_SECRET_LEN) {
            return Err(FsError::Config(format!(
                "secret_access_key longer than {MAX_SECRET_LEN} bytes"
            )));
        }
        Ok(())
    }
}

/// Top-level configuration document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SharefsConfig {
    #[serde(default)]
    pub module: ModuleConfig,
    #[serde(default, rename = "export")]
    pub exports: Vec<ExportConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SharefsConfig {
    pub fn from_toml_str(text: &str) -> FsResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| FsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> FsResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| FsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as TOML.
    pub fn load(path: &Path) -> FsResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FsError::Config(format!("{}: {}", path.display(), e)))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    pub fn validate(&self) -> FsResult<()> {
        self.module.validate()?;
        self.logging.level()?;
        for export in &self.exports {
            export.validate()?;
        }
        Ok(())
    }

    pub fn export(&self, name: &str) -> Option<&ExportConfig> {
        self.exports.iter().find(|export| export.name == name)
    }
}
