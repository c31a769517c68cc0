//! Network association collaborators
//!
//! The radio itself is out of scope. The device talks to it through two
//! small traits, backed on Linux by helper commands. Calls are async so the
//! control loop can run them as [`crate::task::BackgroundTask`]s and drop
//! them at a deadline.

use crate::config::Config;
use crate::config_session::Credentials;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Tests whether credentials actually join the network
pub trait CredentialVerifier: Send + Sync + 'static {
    fn verify(&self, credentials: &Credentials) -> impl Future<Output = bool> + Send;
}

/// Operational reachability checks and recovery
pub trait NetworkMonitor: Send + Sync + 'static {
    fn is_connected(&self) -> impl Future<Output = bool> + Send;

    fn reconnect(&self, credentials: &Credentials) -> impl Future<Output = bool> + Send;
}

/// Runs `wifi-join <ssid>` / `wifi-check` helper programs.
///
/// Helpers are killed if the call is dropped before they exit.
#[derive(Debug, Clone)]
pub struct CommandNetwork {
    join: PathBuf,
    check: PathBuf,
}

impl CommandNetwork {
    pub fn new(config: &Config) -> Self {
        Self {
            join: config.wifi_join.clone(),
            check: config.wifi_check.clone(),
        }
    }

    async fn join(&self, credentials: &Credentials) -> bool {
        // Password goes through the environment, not argv
        let result = Command::new(&self.join)
            .arg(&credentials.ssid)
            .env("WIFI_PASSWORD", &credentials.password)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    ssid = %credentials.ssid,
                    "Join failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                warn!("Failed to run {}: {}", self.join.display(), e);
                false
            }
        }
    }
}

impl CredentialVerifier for CommandNetwork {
    async fn verify(&self, credentials: &Credentials) -> bool {
        self.join(credentials).await
    }
}

impl NetworkMonitor for CommandNetwork {
    async fn is_connected(&self) -> bool {
        let status = Command::new(&self.check)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        debug!(?status, "Network check");
        matches!(status, Ok(s) if s.success())
    }

    async fn reconnect(&self, credentials: &Credentials) -> bool {
        self.join(credentials).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BackgroundTask, TaskPoll};
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn credentials() -> Credentials {
        Credentials {
            ssid: "home".to_string(),
            password: "secret1".to_string(),
            owner_identity: "@alice".to_string(),
        }
    }

    #[tokio::test]
    async fn test_join_passes_ssid_and_password() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::for_test(temp_dir.path());
        config.wifi_join = script(
            &temp_dir,
            "wifi-join",
            r#"[ "$1" = "home" ] && [ "$WIFI_PASSWORD" = "secret1" ]"#,
        );
        let network = CommandNetwork::new(&config);
        assert!(network.verify(&credentials()).await);

        let mut wrong = credentials();
        wrong.password = "nope".to_string();
        assert!(!network.verify(&wrong).await);
    }

    #[tokio::test]
    async fn test_missing_helper_fails_closed() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::for_test(temp_dir.path());
        let network = CommandNetwork::new(&config);
        assert!(!network.verify(&credentials()).await);
        assert!(!network.is_connected().await);
    }

    #[tokio::test]
    async fn test_check_exit_status() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::for_test(temp_dir.path());
        config.wifi_check = script(&temp_dir, "wifi-check", "exit 0");
        assert!(CommandNetwork::new(&config).is_connected().await);

        config.wifi_check = script(&temp_dir, "wifi-check-down", "exit 1");
        assert!(!CommandNetwork::new(&config).is_connected().await);
    }

    #[tokio::test]
    async fn test_timed_out_join_kills_helper() {
        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("joined");
        let mut config = Config::for_test(temp_dir.path());
        config.wifi_join = script(
            &temp_dir,
            "wifi-join-slow",
            &format!("sleep 1\ntouch '{}'", marker.display()),
        );
        let network = CommandNetwork::new(&config);

        let start = Instant::now();
        let mut task = BackgroundTask::spawn(
            "verify_credentials",
            start,
            Duration::from_millis(100),
            async move { network.verify(&credentials()).await },
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(task.poll(Instant::now()).await, TaskPoll::TimedOut);

        // A helper left running would create the marker after its sleep
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
