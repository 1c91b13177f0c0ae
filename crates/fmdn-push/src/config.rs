//! # Push Configuration
//!
//! Configuration management for the push transport.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FMDN_FCM_API_KEY=AIza...                                           │
//! │     FMDN_DEBOUNCE_MS=250                                               │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fmdn/push.toml (Linux)                                   │
//! │     ~/Library/Application Support/dev.fmdn.fmdn/push.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     mtalk.google.com:5228, 10s/20s heartbeats, 250ms debounce          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # push.toml
//! [mcs]
//! server_heartbeat_secs = 10
//! client_heartbeat_secs = 20
//! selective_ack = true
//!
//! [fcm]
//! project_id = "my-project"
//! app_id = "1:123:android:abc"
//! api_key = "AIza..."
//! sender_id = "123"
//!
//! [router]
//! debounce_ms = 250
//! broadcast_fallback = true
//!
//! [[tenants]]
//! id = "alice@example.com"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use fmdn_core::wire::{MCS_HOST, MCS_PORT};
use fmdn_core::TenantId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{PushError, PushResult};

/// Legacy default VAPID key. Registration payloads must omit it; it also
/// serves as the legacy GCM `sender` value.
pub const DEFAULT_VAPID_KEY: &str =
    "BDOU99-h67HcA6JeFXHbSNMu7e2yNNu3RzoMj8TM4W88jITfq7ZmPvIM1Iv-4_l2LxQcYwhqby2xGpWwzjfAnG4";

// =============================================================================
// MCS Settings
// =============================================================================

/// Settings of one MCS connection.
///
/// ## Idle Timeout
/// ```text
/// idle_timeout_secs set    → used as is
/// idle_timeout_secs unset  → max(client heartbeat, server heartbeat) + 5s
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McsSettings {
    /// MCS host.
    #[serde(default = "default_mcs_host")]
    pub host: String,

    /// MCS port.
    #[serde(default = "default_mcs_port")]
    pub port: u16,

    /// Interval the server is asked to ping at (seconds). None disables it.
    #[serde(default = "default_server_heartbeat")]
    pub server_heartbeat_secs: Option<u64>,

    /// Interval of client-initiated pings (seconds). None disables them.
    #[serde(default = "default_client_heartbeat")]
    pub client_heartbeat_secs: Option<u64>,

    /// Explicit idle timeout (seconds).
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    /// Acknowledge each data message individually.
    #[serde(default = "default_true")]
    pub selective_ack: bool,

    /// Connect attempts per connection before reporting failure. Every
    /// failed attempt is a `Connection` error, so a nonzero
    /// `sequential_error_threshold` caps this count.
    #[serde(default = "default_connect_retry_count")]
    pub connect_retry_count: u32,

    /// TCP connect + TLS handshake timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// First connect backoff (milliseconds).
    #[serde(default = "default_connect_initial_backoff")]
    pub connect_initial_backoff_ms: u64,

    /// Connect backoff cap (seconds).
    #[serde(default = "default_connect_max_backoff")]
    pub connect_max_backoff_secs: u64,

    /// Consecutive failures of one category that end the connection.
    /// Set to 0 to disable.
    #[serde(default = "default_sequential_error_threshold")]
    pub sequential_error_threshold: u32,

    /// Time allowed between sending the login and receiving its response.
    #[serde(default = "default_login_timeout")]
    pub login_timeout_secs: u64,

    /// Time allowed for a graceful TLS shutdown (milliseconds).
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
}

fn default_mcs_host() -> String {
    MCS_HOST.to_string()
}

fn default_mcs_port() -> u16 {
    MCS_PORT
}

fn default_server_heartbeat() -> Option<u64> {
    Some(10)
}

fn default_client_heartbeat() -> Option<u64> {
    Some(20)
}

fn default_true() -> bool {
    true
}

fn default_connect_retry_count() -> u32 {
    3
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_connect_initial_backoff() -> u64 {
    500
}

fn default_connect_max_backoff() -> u64 {
    60
}

fn default_sequential_error_threshold() -> u32 {
    3
}

fn default_login_timeout() -> u64 {
    10
}

fn default_close_timeout() -> u64 {
    2000
}

impl Default for McsSettings {
    fn default() -> Self {
        McsSettings {
            host: default_mcs_host(),
            port: default_mcs_port(),
            server_heartbeat_secs: default_server_heartbeat(),
            client_heartbeat_secs: default_client_heartbeat(),
            idle_timeout_secs: None,
            selective_ack: true,
            connect_retry_count: default_connect_retry_count(),
            connect_timeout_secs: default_connect_timeout(),
            connect_initial_backoff_ms: default_connect_initial_backoff(),
            connect_max_backoff_secs: default_connect_max_backoff(),
            sequential_error_threshold: default_sequential_error_threshold(),
            login_timeout_secs: default_login_timeout(),
            close_timeout_ms: default_close_timeout(),
        }
    }
}

impl McsSettings {
    /// Effective idle timeout of the receive loop.
    pub fn idle_timeout(&self) -> Duration {
        if let Some(secs) = self.idle_timeout_secs {
            return Duration::from_secs(secs);
        }
        let longest = self
            .client_heartbeat_secs
            .unwrap_or(0)
            .max(self.server_heartbeat_secs.unwrap_or(0));
        Duration::from_secs(longest + 5)
    }

    pub fn server_heartbeat(&self) -> Option<Duration> {
        self.server_heartbeat_secs.map(Duration::from_secs)
    }

    pub fn client_heartbeat(&self) -> Option<Duration> {
        self.client_heartbeat_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Dial attempts one connection actually makes.
    pub fn connect_attempts(&self) -> u32 {
        let attempts = self.connect_retry_count.max(1);
        match self.sequential_error_threshold {
            0 => attempts,
            threshold => attempts.min(threshold),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

// =============================================================================
// Registration Settings
// =============================================================================

/// Endpoints and attempt budgets of the registration flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationSettings {
    /// GCM check-in endpoint.
    #[serde(default = "default_checkin_url")]
    pub checkin_url: String,

    /// Primary GCM register endpoint.
    #[serde(default = "default_gcm_register_url")]
    pub gcm_register_url: String,

    /// Alternate GCM register endpoint, used after an HTML/404 reply.
    #[serde(default = "default_gcm_register_alt_url")]
    pub gcm_register_alt_url: String,

    /// Firebase installations API base (ends with `/`).
    #[serde(default = "default_fcm_install_url")]
    pub fcm_install_url: String,

    /// FCM registrations API base (ends with `/`).
    #[serde(default = "default_fcm_register_url")]
    pub fcm_register_url: String,

    /// Web push endpoint prefix; the GCM token is appended.
    #[serde(default = "default_fcm_endpoint")]
    pub fcm_endpoint: String,

    /// Check-in attempts.
    #[serde(default = "default_checkin_attempts")]
    pub checkin_attempts: u32,

    /// GCM register attempts.
    #[serde(default = "default_gcm_register_attempts")]
    pub gcm_register_attempts: u32,

    /// Attempts for each FCM call.
    #[serde(default = "default_fcm_attempts")]
    pub fcm_attempts: u32,

    /// First backoff between attempts (milliseconds).
    #[serde(default = "default_registration_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff cap between attempts (seconds).
    #[serde(default = "default_registration_max_backoff")]
    pub max_backoff_secs: u64,

    /// Per-request HTTP timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_checkin_url() -> String {
    "https://android.clients.google.com/checkin".to_string()
}

fn default_gcm_register_url() -> String {
    "https://android.clients.google.com/c2dm/register3".to_string()
}

fn default_gcm_register_alt_url() -> String {
    "https://android.googleapis.com/c2dm/register3".to_string()
}

fn default_fcm_install_url() -> String {
    "https://firebaseinstallations.googleapis.com/v1/".to_string()
}

fn default_fcm_register_url() -> String {
    "https://fcmregistrations.googleapis.com/v1/".to_string()
}

fn default_fcm_endpoint() -> String {
    "https://fcm.googleapis.com/fcm/send/".to_string()
}

fn default_checkin_attempts() -> u32 {
    8
}

fn default_gcm_register_attempts() -> u32 {
    5
}

fn default_fcm_attempts() -> u32 {
    3
}

fn default_registration_initial_backoff() -> u64 {
    1000
}

fn default_registration_max_backoff() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        RegistrationSettings {
            checkin_url: default_checkin_url(),
            gcm_register_url: default_gcm_register_url(),
            gcm_register_alt_url: default_gcm_register_alt_url(),
            fcm_install_url: default_fcm_install_url(),
            fcm_register_url: default_fcm_register_url(),
            fcm_endpoint: default_fcm_endpoint(),
            checkin_attempts: default_checkin_attempts(),
            gcm_register_attempts: default_gcm_register_attempts(),
            fcm_attempts: default_fcm_attempts(),
            initial_backoff_ms: default_registration_initial_backoff(),
            max_backoff_secs: default_registration_max_backoff(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl RegistrationSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Points every endpoint at one base URL. Used by tests against a
    /// local mock server.
    pub fn with_base_url(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        RegistrationSettings {
            checkin_url: format!("{}/checkin", base),
            gcm_register_url: format!("{}/c2dm/register3", base),
            gcm_register_alt_url: format!("{}/alt/c2dm/register3", base),
            fcm_install_url: format!("{}/installations/v1/", base),
            fcm_register_url: format!("{}/registrations/v1/", base),
            ..Default::default()
        }
    }
}

// =============================================================================
// FCM Project Settings
// =============================================================================

/// The Firebase project the web push subscription is registered under.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FcmSettings {
    /// Firebase project id.
    #[serde(default)]
    pub project_id: String,

    /// Firebase application id.
    #[serde(default)]
    pub app_id: String,

    /// Firebase API key.
    #[serde(default)]
    pub api_key: String,

    /// Numeric GCM sender id.
    #[serde(default)]
    pub sender_id: String,

    /// Sender value used on the second GCM register attempt.
    #[serde(default = "default_legacy_sender")]
    pub legacy_sender: String,

    /// VAPID key of the subscription. None means the legacy default.
    #[serde(default)]
    pub vapid_key: Option<String>,
}

fn default_legacy_sender() -> String {
    DEFAULT_VAPID_KEY.to_string()
}

impl FcmSettings {
    /// VAPID key to put in the registration payload, if any.
    ///
    /// The legacy default must never be sent.
    pub fn effective_vapid_key(&self) -> Option<&str> {
        self.vapid_key
            .as_deref()
            .filter(|key| !key.is_empty() && *key != DEFAULT_VAPID_KEY)
    }

    /// Returns true if every field the registration flow needs is set.
    pub fn is_complete(&self) -> bool {
        !self.project_id.is_empty()
            && !self.app_id.is_empty()
            && !self.api_key.is_empty()
            && !self.sender_id.is_empty()
    }
}

// =============================================================================
// Supervisor Settings
// =============================================================================

/// Restart pacing of tenant supervisors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_supervisor_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff_secs: u64,

    /// How often a running connection's state is checked (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Bound on waiting for a supervisor to stop before aborting it.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_supervisor_initial_backoff() -> u64 {
    1000
}

fn default_supervisor_max_backoff() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_stop_timeout() -> u64 {
    5
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            initial_backoff_ms: default_supervisor_initial_backoff(),
            max_backoff_secs: default_supervisor_max_backoff(),
            poll_interval_ms: default_poll_interval(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl SupervisorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

// =============================================================================
// Router Settings
// =============================================================================

/// Routing and debounce behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Debounce window per (tenant, device) key (milliseconds).
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Deliver unresolvable pushes to every consumer that tracks the device.
    /// When false such pushes are dropped.
    #[serde(default = "default_true")]
    pub broadcast_fallback: bool,

    /// Capacity of the connection → router channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_debounce() -> u64 {
    250
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for RouterSettings {
    fn default() -> Self {
        RouterSettings {
            debounce_ms: default_debounce(),
            broadcast_fallback: true,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl RouterSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Where credentials and routing tokens are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite database path. Defaults to the platform data dir.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StorageSettings {
    /// Configured path, or `<data dir>/fmdn.db`.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.database_path.clone().or_else(|| {
            directories::ProjectDirs::from("dev", "fmdn", "fmdn")
                .map(|dirs| dirs.data_dir().join("fmdn.db"))
        })
    }
}

// =============================================================================
// Tenants
// =============================================================================

/// A tenant the listener starts a receiver for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantEntry {
    /// Tenant (account) id.
    pub id: String,

    /// Credentials blob to import on start, if any.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
}

impl TenantEntry {
    pub fn tenant_id(&self) -> TenantId {
        TenantId::new(self.id.clone())
    }
}

// =============================================================================
// Main Push Configuration
// =============================================================================

/// Complete push configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub mcs: McsSettings,

    #[serde(default)]
    pub registration: RegistrationSettings,

    #[serde(default)]
    pub fcm: FcmSettings,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub router: RouterSettings,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub tenants: Vec<TenantEntry>,
}

impl PushConfig {
    /// Creates a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (push.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> PushResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading push config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| PushError::ConfigLoadFailed(e.to_string()))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load push config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> PushResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| PushError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PushError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| PushError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Push config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> PushResult<()> {
        if self.mcs.host.is_empty() {
            return Err(PushError::InvalidConfig("mcs.host must not be empty".into()));
        }
        if self.mcs.connect_retry_count == 0 {
            return Err(PushError::InvalidConfig(
                "mcs.connect_retry_count must be greater than 0".into(),
            ));
        }
        if self.mcs.client_heartbeat_secs == Some(0) || self.mcs.server_heartbeat_secs == Some(0) {
            return Err(PushError::InvalidConfig(
                "heartbeat intervals must be greater than 0 (omit to disable)".into(),
            ));
        }

        let registration = &self.registration;
        for url in [
            &registration.checkin_url,
            &registration.gcm_register_url,
            &registration.gcm_register_alt_url,
            &registration.fcm_install_url,
            &registration.fcm_register_url,
            &registration.fcm_endpoint,
        ] {
            let parsed = Url::parse(url)?;
            if parsed.scheme() != "https" && parsed.scheme() != "http" {
                return Err(PushError::InvalidUrl(format!(
                    "Registration URL must be http(s), got: {}",
                    url
                )));
            }
        }
        if registration.checkin_attempts == 0
            || registration.gcm_register_attempts == 0
            || registration.fcm_attempts == 0
        {
            return Err(PushError::InvalidConfig(
                "registration attempt budgets must be greater than 0".into(),
            ));
        }

        if self.supervisor.poll_interval_ms == 0 {
            return Err(PushError::InvalidConfig(
                "supervisor.poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.router.channel_capacity == 0 {
            return Err(PushError::InvalidConfig(
                "router.channel_capacity must be greater than 0".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.is_empty() {
                return Err(PushError::InvalidConfig("tenant id must not be empty".into()));
            }
            if !seen.insert(tenant.id.as_str()) {
                return Err(PushError::InvalidConfig(format!("duplicate tenant: {}", tenant.id)));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("FMDN_MCS_HOST") {
            debug!(host = %host, "Overriding MCS host from environment");
            self.mcs.host = host;
        }

        if let Ok(port) = std::env::var("FMDN_MCS_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                self.mcs.port = p;
            }
        }

        if let Ok(ack) = std::env::var("FMDN_SELECTIVE_ACK") {
            match ack.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.mcs.selective_ack = true,
                "0" | "false" | "no" => self.mcs.selective_ack = false,
                _ => warn!(value = %ack, "Unknown FMDN_SELECTIVE_ACK value"),
            }
        }

        if let Ok(project) = std::env::var("FMDN_FCM_PROJECT_ID") {
            self.fcm.project_id = project;
        }

        if let Ok(app_id) = std::env::var("FMDN_FCM_APP_ID") {
            self.fcm.app_id = app_id;
        }

        if let Ok(api_key) = std::env::var("FMDN_FCM_API_KEY") {
            debug!("Overriding FCM API key from environment");
            self.fcm.api_key = api_key;
        }

        if let Ok(sender) = std::env::var("FMDN_FCM_SENDER_ID") {
            self.fcm.sender_id = sender;
        }

        if let Ok(debounce) = std::env::var("FMDN_DEBOUNCE_MS") {
            if let Ok(ms) = debounce.parse::<u64>() {
                debug!(debounce_ms = ms, "Overriding debounce window from environment");
                self.router.debounce_ms = ms;
            }
        }

        if let Ok(path) = std::env::var("FMDN_STORAGE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "fmdn", "fmdn")
            .map(|dirs| dirs.config_dir().join("push.toml"))
    }

    /// Ids of the configured tenants.
    pub fn tenant_ids(&self) -> Vec<TenantId> {
        self.tenants.iter().map(TenantEntry::tenant_id).collect()
    }
}
