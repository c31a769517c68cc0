//! Configuration, paths and protocol constants

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command prefix the owner sends back with the claim token
pub const CLAIM_COMMAND_PREFIX: &str = "/start ";

/// Bare start command (as typed in a group, optionally addressed to the bot)
pub const BARE_START_COMMAND: &str = "/start";

/// Sigil every normalized owner identity begins with
pub const IDENTITY_SIGIL: char = '@';

/// Version tag written into the persisted record
pub const CONFIG_VERSION: u32 = 2;

/// What to do at startup when a completed binding is already persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePolicy {
    /// Go straight to the operational phase
    Operational,
    /// Re-enter the personal claim with a fresh token
    Reclaim,
}

impl std::str::FromStr for ResumePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "operational" => Ok(ResumePolicy::Operational),
            "reclaim" => Ok(ResumePolicy::Reclaim),
            other => Err(Error::Config(format!("unknown resume policy: {}", other))),
        }
    }
}

/// All configurable paths and constants
#[derive(Debug, Clone)]
pub struct Config {
    pub state_dir: PathBuf,
    pub record_file: PathBuf,
    pub inbox_db: PathBuf,
    pub hardware_id: String,
    pub bot_token: Option<String>,
    pub api_base: String,
    pub wifi_join: PathBuf,
    pub wifi_check: PathBuf,
    pub resume_policy: ResumePolicy,
    pub tick_interval_ms: u64,
    pub personal_claim_timeout_secs: u64,
    pub personal_claim_max_attempts: u32,
    pub group_discovery_timeout_secs: u64,
    pub group_discovery_max_attempts: u32,
    pub poll_batch_limit: usize,
    pub token_resend_interval_secs: u64,
    pub verify_timeout_secs: u64,
    pub network_check_interval_secs: u64,
    pub restart_delay_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("claimlink");

        Self {
            record_file: state_dir.join("device.json"),
            inbox_db: state_dir.join("inbox.db"),
            state_dir,
            hardware_id: read_hardware_id(Path::new("/etc/machine-id")),
            bot_token: None,
            api_base: "https://api.telegram.org".to_string(),
            wifi_join: PathBuf::from("/usr/local/bin/wifi-join"),
            wifi_check: PathBuf::from("/usr/local/bin/wifi-check"),
            resume_policy: ResumePolicy::Operational,
            tick_interval_ms: 1000,
            personal_claim_timeout_secs: 300,
            personal_claim_max_attempts: 300,
            group_discovery_timeout_secs: 120,
            group_discovery_max_attempts: 120,
            poll_batch_limit: 10,
            token_resend_interval_secs: 5,
            verify_timeout_secs: 20,
            network_check_interval_secs: 30,
            restart_delay_secs: 5,
            http_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Default config overlaid with `CLAIMLINK_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("CLAIMLINK_STATE_DIR") {
            config = config.with_state_dir(Path::new(&dir));
        }
        if let Ok(token) = std::env::var("CLAIMLINK_BOT_TOKEN") {
            if !token.trim().is_empty() {
                config.bot_token = Some(token.trim().to_string());
            }
        }
        if let Ok(base) = std::env::var("CLAIMLINK_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(id) = std::env::var("CLAIMLINK_HARDWARE_ID") {
            config.hardware_id = id;
        }
        if let Ok(path) = std::env::var("CLAIMLINK_WIFI_JOIN") {
            config.wifi_join = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("CLAIMLINK_WIFI_CHECK") {
            config.wifi_check = PathBuf::from(path);
        }
        if let Ok(policy) = std::env::var("CLAIMLINK_RESUME") {
            config.resume_policy = policy.parse()?;
        }

        Ok(config)
    }

    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &Path) -> Self {
        Self {
            hardware_id: "a1b2c3d4e5f6".to_string(),
            wifi_join: temp_dir.join("wifi-join"),
            wifi_check: temp_dir.join("wifi-check"),
            tick_interval_ms: 10,
            personal_claim_timeout_secs: 5,
            personal_claim_max_attempts: 50,
            group_discovery_timeout_secs: 3,
            group_discovery_max_attempts: 30,
            token_resend_interval_secs: 1,
            verify_timeout_secs: 2,
            network_check_interval_secs: 1,
            restart_delay_secs: 0,
            ..Self::default()
        }
        .with_state_dir(temp_dir)
    }

    /// Relocate every state path under `dir`
    pub fn with_state_dir(mut self, dir: &Path) -> Self {
        self.state_dir = dir.to_path_buf();
        self.record_file = dir.join("device.json");
        self.inbox_db = dir.join("inbox.db");
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn personal_claim_timeout(&self) -> Duration {
        Duration::from_secs(self.personal_claim_timeout_secs)
    }

    pub fn group_discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.group_discovery_timeout_secs)
    }

    pub fn token_resend_interval(&self) -> Duration {
        Duration::from_secs(self.token_resend_interval_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn network_check_interval(&self) -> Duration {
        Duration::from_secs(self.network_check_interval_secs)
    }
}

/// Read a stable hardware identifier, falling back to zeros
pub fn read_hardware_id(path: &Path) -> String {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "000000000000".to_string())
}
