//! Configuration session - the short-range link side of pairing
//!
//! The link transport hands raw writes to [`ConfigLink::write`], which only
//! queues them. Parsing, validation and credential verification happen on
//! the control loop via [`ConfigSession::tick`].
//!
//! Status is published twice: a watch holding the current value and a
//! broadcast feed carrying every transition in order, so a reader that polls
//! slowly still sees `wifi_tested_ok` before `device_id_generated`.

use crate::error::ConfigError;
use crate::network::CredentialVerifier;
use crate::owner::parse_identity;
use crate::task::{BackgroundTask, TaskPoll};
use crate::token::{ClaimToken, TokenGenerator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// Network credentials plus the owner's normalized chat handle
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
    pub owner_identity: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("owner_identity", &self.owner_identity)
            .finish()
    }
}

/// Wire form of a configuration write
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    owner_identity: String,
}

/// Parse and validate a configuration payload
pub fn parse_payload(raw: &[u8]) -> Result<Credentials, ConfigError> {
    let payload: RawPayload = serde_json::from_slice(raw)
        .map_err(|e| ConfigError::InvalidPayload(format!("malformed JSON: {}", e)))?;

    for (field, value) in [
        ("ssid", &payload.ssid),
        ("password", &payload.password),
        ("ownerIdentity", &payload.owner_identity),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidPayload(format!("{} is empty", field)));
        }
    }

    let owner_identity = parse_identity(&payload.owner_identity)
        .ok_or_else(|| ConfigError::InvalidOwnerIdentity(payload.owner_identity.clone()))?;

    Ok(Credentials {
        ssid: payload.ssid,
        password: payload.password,
        owner_identity,
    })
}

/// Status published on the link's read/notify channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    ReadyForConfig,
    ProcessingConfig,
    WifiTestedOk,
    DeviceIdGenerated,
    ConfigurationComplete,
    ClaimTimeout,
    Rejected(ConfigError),
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::ReadyForConfig => "ready_for_config",
            LinkStatus::ProcessingConfig => "processing_config",
            LinkStatus::WifiTestedOk => "wifi_tested_ok",
            LinkStatus::DeviceIdGenerated => "device_id_generated",
            LinkStatus::ConfigurationComplete => "configuration_complete",
            LinkStatus::ClaimTimeout => "error_claim_timeout",
            LinkStatus::Rejected(err) => err.status_code(),
        }
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status transitions buffered per subscriber before older ones are dropped
const STATUS_EVENT_CAPACITY: usize = 64;

/// Peer-facing handle: write channel plus the status and token notify channels
#[derive(Clone)]
pub struct ConfigLink {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    status: watch::Receiver<LinkStatus>,
    status_events: broadcast::Sender<LinkStatus>,
    token: watch::Receiver<Option<String>>,
}

impl ConfigLink {
    /// Queue a write; never blocks. False once the session is gone.
    pub fn write(&self, payload: &[u8]) -> bool {
        self.inbound.send(payload.to_vec()).is_ok()
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    /// Every status change from now on, in order
    pub fn status_events(&self) -> broadcast::Receiver<LinkStatus> {
        self.status_events.subscribe()
    }

    pub fn token_receiver(&self) -> watch::Receiver<Option<String>> {
        self.token.clone()
    }
}

/// What a configuration tick produced
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigOutcome {
    TokenIssued {
        token: ClaimToken,
        credentials: Credentials,
    },
    Rejected(ConfigError),
}

struct PendingVerification {
    credentials: Credentials,
    task: BackgroundTask<bool>,
}

/// Device side of the configuration link
pub struct ConfigSession<V: CredentialVerifier> {
    verifier: Arc<V>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    status: watch::Sender<LinkStatus>,
    status_events: broadcast::Sender<LinkStatus>,
    token: watch::Sender<Option<String>>,
    tokens: TokenGenerator,
    pending: Option<PendingVerification>,
    verify_timeout: Duration,
    resend_interval: Duration,
    last_publish: Option<Instant>,
}

impl<V: CredentialVerifier> ConfigSession<V> {
    pub fn new(
        verifier: Arc<V>,
        tokens: TokenGenerator,
        verify_timeout: Duration,
        resend_interval: Duration,
    ) -> (Self, ConfigLink) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus::ReadyForConfig);
        let (events_tx, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
        let (token_tx, token_rx) = watch::channel(None);

        let session = Self {
            verifier,
            inbound: inbound_rx,
            status: status_tx,
            status_events: events_tx.clone(),
            token: token_tx,
            tokens,
            pending: None,
            verify_timeout,
            resend_interval,
            last_publish: None,
        };
        let link = ConfigLink {
            inbound: inbound_tx,
            status: status_rx,
            status_events: events_tx,
            token: token_rx,
        };
        (session, link)
    }

    /// Next queued write, if any
    pub fn take_payload(&mut self) -> Option<Vec<u8>> {
        self.inbound.try_recv().ok()
    }

    pub fn set_status(&self, status: LinkStatus) {
        debug!(status = %status, "Link status");
        // No subscribers is fine; the watch still holds the value
        let _ = self.status_events.send(status.clone());
        self.status.send_replace(status);
    }

    /// Parse a write, reporting a rejection on the link.
    ///
    /// Touches nothing else, so a bad write leaves any attempt in progress alone.
    pub fn validate(&self, raw: &[u8]) -> Result<Credentials, ConfigError> {
        parse_payload(raw).map_err(|err| {
            warn!(error = %err, "Configuration payload rejected");
            self.set_status(LinkStatus::Rejected(err.clone()));
            err
        })
    }

    /// Validate a write and start verifying it
    pub fn submit(&mut self, now: Instant, raw: &[u8]) -> Result<(), ConfigError> {
        let credentials = self.validate(raw)?;
        self.begin_verification(now, credentials);
        Ok(())
    }

    /// Start verifying already validated credentials.
    ///
    /// A newer payload replaces one still being verified.
    pub fn begin_verification(&mut self, now: Instant, credentials: Credentials) {
        if let Some(previous) = self.pending.take() {
            info!(ssid = %previous.credentials.ssid, "Superseding pending verification");
            previous.task.cancel();
        }

        info!(
            ssid = %credentials.ssid,
            owner = %credentials.owner_identity,
            "Configuration payload accepted, verifying credentials"
        );
        self.set_status(LinkStatus::ProcessingConfig);

        let verifier = Arc::clone(&self.verifier);
        let job_credentials = credentials.clone();
        let task = BackgroundTask::spawn(
            "verify_credentials",
            now,
            self.verify_timeout,
            async move { verifier.verify(&job_credentials).await },
        );
        self.pending = Some(PendingVerification { credentials, task });
    }

    /// Check the verification in flight
    pub async fn poll_verification(&mut self, now: Instant) -> Option<ConfigOutcome> {
        let pending = self.pending.as_mut()?;
        let result = pending.task.poll(now).await;

        let err = match result {
            TaskPoll::Pending => return None,
            TaskPoll::Ready(true) => {
                let credentials = self.pending.take()?.credentials;
                info!(ssid = %credentials.ssid, "Credentials verified");
                self.set_status(LinkStatus::WifiTestedOk);
                let token = self.issue_token(now);
                return Some(ConfigOutcome::TokenIssued { token, credentials });
            }
            TaskPoll::Ready(false) => ConfigError::CredentialVerificationFailed,
            TaskPoll::Failed(reason) => {
                warn!(reason = %reason, "Verification task failed");
                ConfigError::CredentialVerificationFailed
            }
            TaskPoll::TimedOut => ConfigError::VerificationTimedOut,
        };

        // Payload is discarded; the link stays open for another try
        self.pending = None;
        warn!(error = %err, "Credential verification failed");
        self.set_status(LinkStatus::Rejected(err.clone()));
        Some(ConfigOutcome::Rejected(err))
    }

    /// One unit of configuration work: at most one queued write, then a
    /// verification check.
    pub async fn tick(&mut self, now: Instant) -> Option<ConfigOutcome> {
        if let Some(raw) = self.take_payload() {
            if let Err(err) = self.submit(now, &raw) {
                return Some(ConfigOutcome::Rejected(err));
            }
        }
        self.poll_verification(now).await
    }

    /// Mint and publish a fresh token
    pub fn issue_token(&mut self, now: Instant) -> ClaimToken {
        let token = self.tokens.issue(now);
        debug!(token = %token, "Claim token issued");
        self.token.send_replace(Some(token.to_string()));
        self.last_publish = Some(now);
        self.set_status(LinkStatus::DeviceIdGenerated);
        token
    }

    /// Re-send the current token when the resend timer has elapsed
    pub fn republish_token(&mut self, now: Instant) {
        let current = self.token.borrow().clone();
        if current.is_none() {
            return;
        }
        let due = self
            .last_publish
            .map_or(true, |last| now.saturating_duration_since(last) >= self.resend_interval);
        if due {
            self.token.send_replace(current);
            self.last_publish = Some(now);
        }
    }

    pub fn retract_token(&mut self) {
        self.token.send_replace(None);
        self.last_publish = None;
    }

    /// Drop everything tied to the current attempt
    pub fn reset(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.cancel();
        }
        self.retract_token();
        self.set_status(LinkStatus::ReadyForConfig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeVerifier {
        accept: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeVerifier {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept: AtomicBool::new(accept),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl CredentialVerifier for FakeVerifier {
        async fn verify(&self, _credentials: &Credentials) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.accept.load(Ordering::SeqCst)
        }
    }

    fn session(verifier: Arc<FakeVerifier>) -> (ConfigSession<FakeVerifier>, ConfigLink) {
        let tokens = TokenGenerator::new("a1b2c3d4e5f6", Instant::now());
        ConfigSession::new(verifier, tokens, Duration::from_secs(2), Duration::from_secs(1))
    }

    async fn tick_until_outcome(
        session: &mut ConfigSession<FakeVerifier>,
    ) -> Option<ConfigOutcome> {
        for _ in 0..200 {
            if let Some(outcome) = session.tick(Instant::now()).await {
                return Some(outcome);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    const VALID: &[u8] = br#"{"ssid":"home","password":"secret1","ownerIdentity":"alice"}"#;

    #[test]
    fn test_parse_payload_normalizes_owner() {
        let credentials = parse_payload(VALID).unwrap();
        assert_eq!(credentials.ssid, "home");
        assert_eq!(credentials.owner_identity, "@alice");
    }

    #[test]
    fn test_parse_payload_empty_field() {
        let err = parse_payload(br#"{"ssid":"","password":"x","ownerIdentity":"alice"}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPayload(ref m) if m.contains("ssid")));
    }

    #[test]
    fn test_parse_payload_missing_field() {
        let err = parse_payload(br#"{"ssid":"home","password":"x"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPayload(ref m) if m.contains("ownerIdentity")));
    }

    #[test]
    fn test_parse_payload_malformed() {
        let err = parse_payload(b"ssid=home").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPayload(_)));
    }

    #[test]
    fn test_parse_payload_bad_owner() {
        let err =
            parse_payload(br#"{"ssid":"home","password":"x","ownerIdentity":"al ice"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOwnerIdentity(_)));

        let long = format!(
            r#"{{"ssid":"home","password":"x","ownerIdentity":"{}"}}"#,
            "a".repeat(33)
        );
        assert!(matches!(
            parse_payload(long.as_bytes()),
            Err(ConfigError::InvalidOwnerIdentity(_))
        ));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = parse_payload(VALID).unwrap();
        let debug = format!("{:?}", credentials);
        assert!(!debug.contains("secret1"));
        assert!(debug.contains("home"));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(LinkStatus::ReadyForConfig.to_string(), "ready_for_config");
        assert_eq!(LinkStatus::DeviceIdGenerated.to_string(), "device_id_generated");
        assert_eq!(
            LinkStatus::Rejected(ConfigError::VerificationTimedOut).to_string(),
            "error_wifi_timeout"
        );
    }

    #[tokio::test]
    async fn test_valid_payload_issues_token() {
        let verifier = FakeVerifier::new(true);
        let (mut session, link) = session(verifier.clone());
        assert_eq!(link.status(), LinkStatus::ReadyForConfig);

        assert!(link.write(VALID));
        let outcome = tick_until_outcome(&mut session).await.unwrap();
        match outcome {
            ConfigOutcome::TokenIssued { token, credentials } => {
                assert_eq!(credentials.owner_identity, "@alice");
                assert_eq!(link.token(), Some(token.to_string()));
            }
            other => panic!("expected token, got {:?}", other),
        }
        assert_eq!(link.status(), LinkStatus::DeviceIdGenerated);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_payload_reported_without_verification() {
        let verifier = FakeVerifier::new(true);
        let (mut session, link) = session(verifier.clone());

        link.write(b"{not json");
        let outcome = session.tick(Instant::now()).await;
        assert!(matches!(
            outcome,
            Some(ConfigOutcome::Rejected(ConfigError::InvalidPayload(_)))
        ));
        assert_eq!(link.status().as_str(), "error_invalid_payload");
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.poll_verification(Instant::now()).await, None);
    }

    #[tokio::test]
    async fn test_status_events_keep_every_transition() {
        let verifier = FakeVerifier::new(true);
        let (mut session, link) = session(verifier);
        let mut events = link.status_events();
        let mut seen = vec![link.status().to_string()];

        link.write(VALID);
        assert!(matches!(
            tick_until_outcome(&mut session).await,
            Some(ConfigOutcome::TokenIssued { .. })
        ));
        // The watch only holds the last value
        assert_eq!(link.status(), LinkStatus::DeviceIdGenerated);

        while let Ok(status) = events.try_recv() {
            seen.push(status.to_string());
        }
        assert_eq!(
            seen,
            vec![
                "ready_for_config",
                "processing_config",
                "wifi_tested_ok",
                "device_id_generated"
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_write_keeps_pending_verification() {
        let verifier = FakeVerifier::new(true);
        let (mut session, link) = session(verifier.clone());

        let now = Instant::now();
        session.submit(now, VALID).unwrap();
        assert!(session.validate(b"{not json").is_err());
        assert_eq!(link.status().as_str(), "error_invalid_payload");

        let outcome = tick_until_outcome(&mut session).await;
        assert!(matches!(outcome, Some(ConfigOutcome::TokenIssued { .. })));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_verification_allows_retry() {
        let verifier = FakeVerifier::new(false);
        let (mut session, link) = session(verifier.clone());

        link.write(VALID);
        let outcome = tick_until_outcome(&mut session).await;
        assert_eq!(
            outcome,
            Some(ConfigOutcome::Rejected(ConfigError::CredentialVerificationFailed))
        );
        assert_eq!(link.status().as_str(), "error_wifi_failed");
        assert!(link.token().is_none());

        // Same link, new attempt
        verifier.accept.store(true, Ordering::SeqCst);
        link.write(VALID);
        let outcome = tick_until_outcome(&mut session).await;
        assert!(matches!(outcome, Some(ConfigOutcome::TokenIssued { .. })));
    }

    #[tokio::test]
    async fn test_tokens_unique_across_attempts() {
        let verifier = FakeVerifier::new(true);
        let (mut session, link) = session(verifier);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..5 {
            link.write(VALID);
            match tick_until_outcome(&mut session).await {
                Some(ConfigOutcome::TokenIssued { token, .. }) => assert!(seen.insert(token)),
                other => panic!("expected token, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_republish_respects_interval() {
        let verifier = FakeVerifier::new(true);
        let (mut session, link) = session(verifier);
        let mut receiver = link.token_receiver();
        let start = Instant::now();

        session.issue_token(start);
        receiver.borrow_and_update();

        session.republish_token(start + Duration::from_millis(500));
        assert!(!receiver.has_changed().unwrap());

        session.republish_token(start + Duration::from_secs(1));
        assert!(receiver.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_reset_retracts_token() {
        let verifier = FakeVerifier::new(true);
        let (mut session, link) = session(verifier);
        session.issue_token(Instant::now());
        assert!(link.token().is_some());

        session.reset();
        assert!(link.token().is_none());
        assert_eq!(link.status(), LinkStatus::ReadyForConfig);
    }
}
