//! Device record - persistent JSON storage for credentials and binding

use crate::binding::ChatBinding;
use crate::config::{Config, CONFIG_VERSION};
use crate::config_session::Credentials;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::warn;

/// Everything the device remembers across restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub config_version: u32,
    pub configured: bool,
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub binding: ChatBinding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paired_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            config_version: CONFIG_VERSION,
            configured: false,
            credentials: Some(credentials),
            binding: ChatBinding::default(),
            paired_at: None,
            updated_at: Utc::now(),
        }
    }

    /// A completed pairing that can be resumed
    pub fn has_valid_binding(&self) -> bool {
        self.config_version == CONFIG_VERSION
            && self.configured
            && self.credentials.is_some()
            && self.binding.personal_chat_id().is_some()
    }
}

/// File-backed store for the [`DeviceRecord`]
pub struct DeviceStore {
    record_path: PathBuf,
}

impl DeviceStore {
    pub fn new(config: &Config) -> Self {
        Self {
            record_path: config.record_file.clone(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.record_path
    }

    /// Load the record; other versions count as absent
    pub fn load(&self) -> Result<Option<DeviceRecord>> {
        if !self.record_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.record_path)?;
        let record: DeviceRecord = serde_json::from_str(&content)?;

        if record.config_version != CONFIG_VERSION {
            warn!(
                found = record.config_version,
                expected = CONFIG_VERSION,
                "Ignoring device record from another version"
            );
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Save the record to disk atomically
    pub fn save(&self, record: &DeviceRecord) -> Result<()> {
        let parent = self
            .record_path
            .parent()
            .ok_or_else(|| Error::Store(format!("no parent for {}", self.record_path.display())))?;
        fs::create_dir_all(parent)?;

        // Write to temp file in same directory (for atomic rename)
        let mut temp = NamedTempFile::new_in(parent)?;

        let mut stamped = record.clone();
        stamped.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(&stamped)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;

        temp.persist(&self.record_path)
            .map_err(|e| Error::Io(e.error))?;

        Ok(())
    }

    /// Remove the record; Ok(false) if there was none
    pub fn clear(&self) -> Result<bool> {
        if !self.record_path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.record_path)?;
        Ok(true)
    }
}
