//! Pairing state machine
//!
//! Drives a device from first configuration to steady operation:
//!
//! ```text
//! CONFIGURING -> PERSONAL_CLAIM -> GROUP_DISCOVERY -> OPERATIONAL
//!                      |
//!                      v
//!                   FAILED
//! ```
//!
//! The machine owns the session, the binding and the poller. Each call to
//! [`PairingStateMachine::tick`] does at most one unit of work for the
//! current phase and never blocks; credential checks and network supervision
//! run as background tasks and are polled.

use crate::binding::ChatBinding;
use crate::classifier::{ClaimEvent, ClaimPhase, ClassifyContext};
use crate::config::{Config, ResumePolicy, CONFIG_VERSION};
use crate::config_session::{ConfigLink, ConfigOutcome, ConfigSession, Credentials, LinkStatus};
use crate::error::ConfigError;
use crate::network::{CredentialVerifier, NetworkMonitor};
use crate::poller::ClaimPoller;
use crate::store::{DeviceRecord, DeviceStore};
use crate::task::{BackgroundTask, TaskPoll};
use crate::token::{ClaimToken, TokenGenerator};
use crate::transport::{ChatId, ClaimTransport, MessageCursor};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configuring,
    PersonalClaim,
    GroupDiscovery,
    Operational,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Configuring => "CONFIGURING",
            Phase::PersonalClaim => "PERSONAL_CLAIM",
            Phase::GroupDiscovery => "GROUP_DISCOVERY",
            Phase::Operational => "OPERATIONAL",
            Phase::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one live pairing attempt
#[derive(Debug, Clone)]
pub struct PairingSession {
    id: u64,
    phase: Phase,
    phase_started: Instant,
    deadline: Option<Instant>,
    attempts: u32,
    max_attempts: Option<u32>,
    active_token: Option<ClaimToken>,
    owner_identity: Option<String>,
    claim_active: bool,
}

impl PairingSession {
    fn new(id: u64, now: Instant) -> Self {
        Self {
            id,
            phase: Phase::Configuring,
            phase_started: now,
            deadline: None,
            attempts: 0,
            max_attempts: None,
            active_token: None,
            owner_identity: None,
            claim_active: false,
        }
    }

    /// Switch phase; `budget` bounds claim phases by time and attempts
    fn enter(&mut self, phase: Phase, now: Instant, budget: Option<(Duration, u32)>) {
        debug!(session = self.id, from = %self.phase, to = %phase, "Phase transition");
        self.phase = phase;
        self.phase_started = now;
        self.deadline = budget.map(|(timeout, _)| now + timeout);
        self.max_attempts = budget.map(|(_, max)| max);
        self.attempts = 0;
        self.claim_active = matches!(phase, Phase::PersonalClaim | Phase::GroupDiscovery);
    }

    /// Deadline passed or attempt budget spent
    pub fn expired(&self, now: Instant) -> bool {
        let late = self.deadline.is_some_and(|deadline| now >= deadline);
        let spent = self.max_attempts.is_some_and(|max| self.attempts >= max);
        late || spent
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn active_token(&self) -> Option<&ClaimToken> {
        self.active_token.as_ref()
    }

    pub fn owner_identity(&self) -> Option<&str> {
        self.owner_identity.as_deref()
    }

    pub fn claim_active(&self) -> bool {
        self.claim_active
    }
}

/// Outcome of one supervision pass in OPERATIONAL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetworkHealth {
    Connected,
    Recovered,
    Lost,
}

pub struct PairingStateMachine<T, V, N>
where
    T: ClaimTransport,
    V: CredentialVerifier,
    N: NetworkMonitor,
{
    transport: T,
    config: ConfigSession<V>,
    poller: ClaimPoller,
    store: DeviceStore,
    monitor: Arc<N>,
    session: PairingSession,
    binding: ChatBinding,
    credentials: Option<Credentials>,
    paired_at: Option<DateTime<Utc>>,
    device_tag: String,
    next_session_id: u64,
    network_task: Option<BackgroundTask<NetworkHealth>>,
    last_network_check: Option<Instant>,
    personal_budget: (Duration, u32),
    group_budget: (Duration, u32),
    network_check_interval: Duration,
    network_check_timeout: Duration,
}

impl<T, V, N> PairingStateMachine<T, V, N>
where
    T: ClaimTransport,
    V: CredentialVerifier,
    N: NetworkMonitor,
{
    /// Build the machine and run INIT against the persisted record
    pub fn new(
        cfg: &Config,
        transport: T,
        verifier: Arc<V>,
        monitor: Arc<N>,
        now: Instant,
    ) -> (Self, ConfigLink) {
        let tokens = TokenGenerator::anchored(&cfg.hardware_id, now);
        let device_tag = tokens.tag().to_string();
        let (config, link) = ConfigSession::new(
            verifier,
            tokens,
            cfg.verify_timeout(),
            cfg.token_resend_interval(),
        );

        let mut machine = Self {
            transport,
            config,
            poller: ClaimPoller::new(cfg.poll_batch_limit),
            store: DeviceStore::new(cfg),
            monitor,
            session: PairingSession::new(1, now),
            binding: ChatBinding::default(),
            credentials: None,
            paired_at: None,
            device_tag,
            next_session_id: 2,
            network_task: None,
            last_network_check: None,
            personal_budget: (cfg.personal_claim_timeout(), cfg.personal_claim_max_attempts),
            group_budget: (cfg.group_discovery_timeout(), cfg.group_discovery_max_attempts),
            network_check_interval: cfg.network_check_interval(),
            network_check_timeout: cfg.verify_timeout(),
        };
        machine.init(cfg.resume_policy, now);
        (machine, link)
    }

    fn init(&mut self, policy: ResumePolicy, now: Instant) {
        let record = match self.store.load() {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %self.store.path().display(), "Unreadable device record, starting fresh: {}", e);
                None
            }
        };

        let Some(record) = record.filter(DeviceRecord::has_valid_binding) else {
            info!(device = %self.device_tag, "No prior pairing, waiting for configuration");
            return;
        };
        let Some(credentials) = record.credentials else {
            return;
        };

        match policy {
            ResumePolicy::Operational => {
                info!(
                    device = %self.device_tag,
                    personal_chat = ?record.binding.personal_chat_id(),
                    group_chat = ?record.binding.group_chat_id(),
                    "Resuming prior pairing"
                );
                self.binding = record.binding;
                self.paired_at = record.paired_at;
                self.session.owner_identity = Some(credentials.owner_identity.clone());
                self.credentials = Some(credentials);
                self.config.set_status(LinkStatus::ConfigurationComplete);
                self.session.enter(Phase::Operational, now, None);
            }
            ResumePolicy::Reclaim => {
                info!(
                    device = %self.device_tag,
                    owner = %credentials.owner_identity,
                    "Prior pairing found, re-claiming with a fresh token"
                );
                let token = self.config.issue_token(now);
                self.enter_personal_claim(now, token, credentials);
            }
        }
    }

    /// One control-loop iteration
    pub async fn tick(&mut self, now: Instant) -> Phase {
        match self.session.phase {
            Phase::Configuring => self.tick_configuring(now).await,
            Phase::PersonalClaim => self.tick_personal_claim(now).await,
            Phase::GroupDiscovery => self.tick_group_discovery(now).await,
            Phase::Operational => self.tick_operational(now).await,
            Phase::Failed => self.tick_failed(now),
        }
        self.session.phase
    }

    /// Discard the current attempt and wait for configuration again
    pub fn restart(&mut self, now: Instant) {
        info!(session = self.session.id, phase = %self.session.phase, "Restarting pairing");
        self.start_new_session(now);
    }

    pub fn phase(&self) -> Phase {
        self.session.phase
    }

    pub fn session(&self) -> &PairingSession {
        &self.session
    }

    pub fn binding(&self) -> &ChatBinding {
        &self.binding
    }

    pub fn cursor(&self) -> MessageCursor {
        self.poller.cursor()
    }

    pub fn transport_failures(&self) -> u32 {
        self.poller.transport_failures()
    }

    pub fn device_tag(&self) -> &str {
        &self.device_tag
    }

    async fn tick_configuring(&mut self, now: Instant) {
        match self.config.tick(now).await {
            Some(ConfigOutcome::TokenIssued { token, credentials }) => {
                self.credentials = Some(credentials.clone());
                self.persist();
                self.enter_personal_claim(now, token, credentials);
            }
            Some(ConfigOutcome::Rejected(err)) => {
                debug!(session = self.session.id, error = %err, "Still configuring");
            }
            None => {}
        }
    }

    fn enter_personal_claim(&mut self, now: Instant, token: ClaimToken, credentials: Credentials) {
        info!(
            session = self.session.id,
            owner = %credentials.owner_identity,
            "Waiting for personal claim"
        );
        self.session.owner_identity = Some(credentials.owner_identity.clone());
        self.session.active_token = Some(token);
        self.credentials = Some(credentials);
        self.session
            .enter(Phase::PersonalClaim, now, Some(self.personal_budget));
    }

    async fn tick_personal_claim(&mut self, now: Instant) {
        if self.restart_on_new_payload(now) {
            return;
        }

        if self.session.expired(now) {
            warn!(
                session = self.session.id,
                attempts = self.session.attempts,
                elapsed = ?now.saturating_duration_since(self.session.phase_started),
                "Personal claim timed out"
            );
            self.session.active_token = None;
            self.config.retract_token();
            self.config.set_status(LinkStatus::ClaimTimeout);
            self.session.enter(Phase::Failed, now, None);
            return;
        }

        let (Some(token), Some(owner)) = (
            self.session.active_token.clone(),
            self.session.owner_identity.clone(),
        ) else {
            error!(session = self.session.id, "Personal claim without token or owner");
            self.session.enter(Phase::Failed, now, None);
            return;
        };

        self.session.attempts += 1;
        self.config.republish_token(now);

        let ctx = ClassifyContext {
            phase: ClaimPhase::Personal,
            token: Some(&token),
            owner: &owner,
            personal_chat: None,
        };
        if let Some(ClaimEvent::PersonalClaim { chat_id, sender }) =
            self.poller.poll(&mut self.transport, &ctx).await
        {
            self.complete_personal_claim(now, chat_id, &sender).await;
        }
    }

    async fn complete_personal_claim(&mut self, now: Instant, chat_id: ChatId, sender: &str) {
        if !self.binding.bind_personal(chat_id) {
            warn!(chat_id = %chat_id, "Personal chat already bound, ignoring claim");
            return;
        }

        // Consumed; never matches again in this session
        self.session.active_token = None;
        self.config.retract_token();
        self.paired_at = Some(Utc::now());

        info!(
            session = self.session.id,
            chat_id = %chat_id,
            sender = %sender,
            "Personal chat claimed"
        );

        let notice = format!(
            "Device {} is paired with you. Add it to a group to share its messages there.",
            self.device_tag
        );
        self.notify(chat_id, &notice).await;

        self.persist();
        self.config.set_status(LinkStatus::ConfigurationComplete);
        self.session
            .enter(Phase::GroupDiscovery, now, Some(self.group_budget));
    }

    async fn tick_group_discovery(&mut self, now: Instant) {
        if self.restart_on_new_payload(now) {
            return;
        }

        if self.session.expired(now) {
            info!(
                session = self.session.id,
                attempts = self.session.attempts,
                elapsed = ?now.saturating_duration_since(self.session.phase_started),
                "No group found, operating with personal chat only"
            );
            self.enter_operational(now);
            return;
        }

        let Some(owner) = self.session.owner_identity.clone() else {
            self.enter_operational(now);
            return;
        };

        self.session.attempts += 1;

        let ctx = ClassifyContext {
            phase: ClaimPhase::Group,
            token: None,
            owner: &owner,
            personal_chat: self.binding.personal_chat_id(),
        };
        if let Some(ClaimEvent::GroupEvidence { chat_id, title }) =
            self.poller.poll(&mut self.transport, &ctx).await
        {
            self.complete_group_discovery(now, chat_id, title).await;
        }
    }

    async fn complete_group_discovery(&mut self, now: Instant, chat_id: ChatId, title: Option<String>) {
        if !self.binding.bind_group(chat_id) {
            warn!(chat_id = %chat_id, "Group binding refused");
            return;
        }

        let name = title.unwrap_or_else(|| chat_id.to_string());
        info!(session = self.session.id, chat_id = %chat_id, group = %name, "Group chat bound");

        let notice = format!("Device {} now also reports to {}.", self.device_tag, name);
        for chat in self.binding.chats() {
            self.notify(chat, &notice).await;
        }

        self.persist();
        self.enter_operational(now);
    }

    fn enter_operational(&mut self, now: Instant) {
        info!(
            session = self.session.id,
            personal_chat = ?self.binding.personal_chat_id(),
            group_chat = ?self.binding.group_chat_id(),
            "Operational"
        );
        self.last_network_check = Some(now);
        self.session.enter(Phase::Operational, now, None);
    }

    async fn tick_operational(&mut self, now: Instant) {
        while self.config.take_payload().is_some() {
            warn!("Configuration write while paired, rejecting");
            self.config
                .set_status(LinkStatus::Rejected(ConfigError::AlreadyPaired));
        }

        if let Some(task) = self.network_task.as_mut() {
            let health = match task.poll(now).await {
                TaskPoll::Pending => return,
                TaskPoll::Ready(health) => health,
                TaskPoll::Failed(reason) => {
                    warn!(reason = %reason, "Network check failed to run");
                    NetworkHealth::Lost
                }
                TaskPoll::TimedOut => NetworkHealth::Lost,
            };
            self.network_task = None;
            match health {
                NetworkHealth::Connected => debug!("Network reachable"),
                NetworkHealth::Recovered => info!("Network connection restored"),
                NetworkHealth::Lost => warn!("Network unreachable, will retry"),
            }
            return;
        }

        let due = self
            .last_network_check
            .map_or(true, |last| now.saturating_duration_since(last) >= self.network_check_interval);
        if !due {
            return;
        }
        let Some(credentials) = self.credentials.clone() else {
            return;
        };

        self.last_network_check = Some(now);
        let monitor = Arc::clone(&self.monitor);
        self.network_task = Some(BackgroundTask::spawn(
            "network_check",
            now,
            self.network_check_timeout,
            async move {
                if monitor.is_connected().await {
                    NetworkHealth::Connected
                } else if monitor.reconnect(&credentials).await {
                    NetworkHealth::Recovered
                } else {
                    NetworkHealth::Lost
                }
            },
        ));
    }

    fn tick_failed(&mut self, now: Instant) {
        self.restart_on_new_payload(now);
    }

    /// A valid configuration write during a claim restarts from scratch.
    ///
    /// An invalid one is reported on the link and the current attempt goes on.
    fn restart_on_new_payload(&mut self, now: Instant) -> bool {
        let Some(raw) = self.config.take_payload() else {
            return false;
        };
        let credentials = match self.config.validate(&raw) {
            Ok(credentials) => credentials,
            Err(err) => {
                info!(
                    session = self.session.id,
                    phase = %self.session.phase,
                    error = %err,
                    "Ignoring invalid configuration, keeping current attempt"
                );
                return false;
            }
        };
        info!(
            session = self.session.id,
            phase = %self.session.phase,
            "New configuration received, discarding current attempt"
        );
        self.start_new_session(now);
        self.config.begin_verification(now, credentials);
        true
    }

    fn start_new_session(&mut self, now: Instant) {
        if let Some(task) = self.network_task.take() {
            task.cancel();
        }
        self.poller.reset();
        self.config.reset();
        self.binding = ChatBinding::default();
        self.credentials = None;
        self.paired_at = None;
        self.last_network_check = None;
        self.session = PairingSession::new(self.next_session_id, now);
        self.next_session_id += 1;
    }

    async fn notify(&mut self, chat_id: ChatId, text: &str) {
        if let Err(e) = self.transport.send(chat_id, text).await {
            warn!(chat_id = %chat_id, "Failed to send confirmation: {}", e);
        }
    }

    fn persist(&self) {
        let record = DeviceRecord {
            config_version: CONFIG_VERSION,
            configured: self.binding.personal_chat_id().is_some(),
            credentials: self.credentials.clone(),
            binding: self.binding.clone(),
            paired_at: self.paired_at,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.save(&record) {
            error!(path = %self.store.path().display(), "Failed to save device record: {}", e);
        }
    }
}
