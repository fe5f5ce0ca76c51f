// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Configuration schema definitions.
//!
//! # Schema Structure
//!
//! ```text
//! UaflowConfig
//! ├── client: ClientSection
//! ├── connections: Vec<ConnectionEntry>
//! │   └── subscription: SubscriptionSection
//! └── logging: LoggingConfig
//! ```
//!
//! Durations are written in humantime form (`"10s"`, `"500ms"`).

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uaflow_client::config::{
    DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PENDING_REQUESTS, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SESSION_TIMEOUT, DEFAULT_TEARDOWN_TIMEOUT,
};
use uaflow_client::{
    ClientConfig, ConnectionConfig, FilePkiProvider, LogFormat, SecurityMode, SecurityPolicy,
    SubscriptionParams, UserIdentity,
};

use crate::error::{ConfigError, ConfigResult};

// =============================================================================
// Constants
// =============================================================================

/// Upper bound accepted for `client.max_connections`.
pub const MAX_CONNECTION_SLOTS: usize = 10_000;

// =============================================================================
// Top-Level Configuration
// =============================================================================

/// The root of a configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UaflowConfig {
    /// Runtime-wide settings.
    #[serde(default)]
    pub client: ClientSection,

    /// Connection configurations, registered in file order.
    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl UaflowConfig {
    /// Validates the entire configuration.
    ///
    /// Checks unique non-empty connection ids, slot capacity, and every
    /// entry against the client layer's own rules.
    pub fn validate(&self) -> ConfigResult<()> {
        self.client.validate()?;

        if self.connections.len() > self.client.max_connections {
            return Err(ConfigError::validation(
                "connections",
                format!(
                    "{} connections exceed client.max_connections {}",
                    self.connections.len(),
                    self.client.max_connections
                ),
            ));
        }

        let mut ids = HashSet::new();
        for (index, entry) in self.connections.iter().enumerate() {
            if entry.id.trim().is_empty() {
                return Err(ConfigError::missing_field(format!("connections[{}].id", index)));
            }
            if !ids.insert(entry.id.as_str()) {
                return Err(ConfigError::duplicate_connection_id(&entry.id));
            }
            entry.validate()?;
        }

        Ok(())
    }

    /// Returns a connection entry by id.
    pub fn connection(&self, id: &str) -> Option<&ConnectionEntry> {
        self.connections.iter().find(|c| c.id == id)
    }

    /// Runtime settings for [`ClientRuntime::builder`](uaflow_client::ClientRuntime::builder).
    pub fn client_config(&self) -> ClientConfig {
        self.client.to_client_config()
    }

    /// Converts every entry, in file order.
    pub fn connection_configs(&self) -> ConfigResult<Vec<ConnectionConfig>> {
        self.connections
            .iter()
            .map(|entry| {
                let config = entry.to_connection_config();
                config
                    .validate()
                    .map_err(|e| ConfigError::invalid_connection(&entry.id, e))?;
                Ok(config)
            })
            .collect()
    }

    /// PKI provider rooted at `client.pki_dir` when one is set.
    pub fn pki_provider(&self) -> FilePkiProvider {
        match &self.client.pki_dir {
            Some(dir) => FilePkiProvider::with_base_dir(dir),
            None => FilePkiProvider::new(),
        }
    }
}

// =============================================================================
// Client Section
// =============================================================================

/// Runtime-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    /// Client application URI.
    #[serde(default = "default_application_uri")]
    pub application_uri: String,

    /// Client application name.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Directory that relative certificate paths are resolved against at
    /// load time by the PKI provider.
    #[serde(default)]
    pub pki_dir: Option<PathBuf>,

    /// Connection slot capacity.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// In-flight application requests allowed per connection.
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: usize,

    /// Bound on reverse endpoint teardown.
    #[serde(default = "default_teardown_timeout", with = "humantime_serde")]
    pub teardown_timeout: Duration,
}

impl ClientSection {
    /// Validates the client section.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_connections == 0 || self.max_connections > MAX_CONNECTION_SLOTS {
            return Err(ConfigError::out_of_range(
                "client.max_connections",
                self.max_connections,
                1,
                MAX_CONNECTION_SLOTS,
            ));
        }
        if self.max_pending_requests == 0 {
            return Err(ConfigError::validation(
                "client.max_pending_requests",
                "must be greater than zero",
            ));
        }
        if self.application_uri.is_empty() {
            return Err(ConfigError::missing_field("client.application_uri"));
        }
        Ok(())
    }

    /// Converts to the runtime's [`ClientConfig`].
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            application_uri: self.application_uri.clone(),
            application_name: self.application_name.clone(),
            max_connections: self.max_connections,
            max_pending_requests: self.max_pending_requests,
            teardown_timeout: self.teardown_timeout,
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            application_uri: default_application_uri(),
            application_name: default_application_name(),
            pki_dir: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

// =============================================================================
// Connection Entry
// =============================================================================

/// One connection in the file.
///
/// ```yaml
/// connections:
///   - id: line-1
///     endpoint_url: opc.tcp://plc-1:4840
///     security_mode: sign_and_encrypt
///     security_policy: basic256_sha256
///     client_certificate: pki/own/cert.der
///     client_private_key: pki/own/key.pem
///     server_certificate: pki/trusted/plc-1.der
///     user_identity:
///       type: user_name
///       username: operator
///     request_timeout: 5s
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionEntry {
    /// Unique id; becomes the connection's user-defined id.
    pub id: String,

    /// Server endpoint URL.
    pub endpoint_url: String,

    /// Message security mode.
    #[serde(default)]
    pub security_mode: SecurityMode,

    /// Security policy.
    #[serde(default)]
    pub security_policy: SecurityPolicy,

    /// Client certificate path.
    #[serde(default)]
    pub client_certificate: Option<PathBuf>,

    /// Client private key path.
    #[serde(default)]
    pub client_private_key: Option<PathBuf>,

    /// Pinned server certificate path.
    #[serde(default)]
    pub server_certificate: Option<PathBuf>,

    /// User identity. Passwords are never read from the file.
    #[serde(default)]
    pub user_identity: UserIdentity,

    /// Reverse connection listening URL.
    #[serde(default)]
    pub reverse_url: Option<String>,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Requested session timeout.
    #[serde(default = "default_session_timeout", with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Subscription defaults.
    #[serde(default)]
    pub subscription: SubscriptionSection,
}

impl ConnectionEntry {
    /// Validates the entry.
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.endpoint_url.starts_with("opc.tcp://") {
            return Err(ConfigError::validation(
                format!("connections.{}.endpoint_url", self.id),
                "endpoint_url must start with 'opc.tcp://'",
            ));
        }
        if self.client_certificate.is_some() && self.client_private_key.is_none() {
            return Err(ConfigError::missing_field(format!(
                "connections.{}.client_private_key",
                self.id
            )));
        }
        self.to_connection_config()
            .validate()
            .map_err(|e| ConfigError::invalid_connection(&self.id, e))
    }

    /// Converts to a [`ConnectionConfig`] without validating it.
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            endpoint_url: self.endpoint_url.clone(),
            security_mode: self.security_mode,
            security_policy: self.security_policy,
            client_certificate_path: self.client_certificate.clone(),
            client_private_key_path: self.client_private_key.clone(),
            server_certificate_path: self.server_certificate.clone(),
            user_identity: self.user_identity.clone(),
            reverse_url: self.reverse_url.clone(),
            user_defined_id: Some(self.id.clone()),
            request_timeout: self.request_timeout,
            session_timeout: self.session_timeout,
            subscription: self.subscription.to_params(),
        }
    }
}

// =============================================================================
// Subscription Section
// =============================================================================

/// Subscription defaults of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SubscriptionSection {
    /// Requested publishing interval.
    #[serde(with = "humantime_serde")]
    pub publishing_interval: Duration,
    /// Requested lifetime count.
    pub lifetime_count: u32,
    /// Requested keep-alive count.
    pub max_keep_alive_count: u32,
    /// Max notifications per publish response.
    pub max_notifications_per_publish: u32,
    /// Relative priority.
    pub priority: u8,
    /// Outstanding publish requests.
    pub publish_tokens: u32,
}

impl SubscriptionSection {
    /// Converts to [`SubscriptionParams`].
    pub fn to_params(&self) -> SubscriptionParams {
        SubscriptionParams {
            publishing_interval: self.publishing_interval,
            lifetime_count: self.lifetime_count,
            max_keep_alive_count: self.max_keep_alive_count,
            max_notifications_per_publish: self.max_notifications_per_publish,
            priority: self.priority,
            publish_tokens: self.publish_tokens,
        }
    }
}

impl Default for SubscriptionSection {
    fn default() -> Self {
        let params = SubscriptionParams::default();
        Self {
            publishing_interval: params.publishing_interval,
            lifetime_count: params.lifetime_count,
            max_keep_alive_count: params.max_keep_alive_count,
            max_notifications_per_publish: params.max_notifications_per_publish,
            priority: params.priority,
            publish_tokens: params.publish_tokens,
        }
    }
}

// =============================================================================
// Logging Configuration
// =============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default)]
    pub level: LogLevel,

    /// Log format.
    #[serde(default)]
    pub format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warn level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    /// Parses a level name. Accepts `warning` for `warn`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns the filter directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Defaults
// =============================================================================

fn default_application_uri() -> String {
    ClientConfig::default().application_uri
}

fn default_application_name() -> String {
    ClientConfig::default().application_name
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_max_pending_requests() -> usize {
    DEFAULT_MAX_PENDING_REQUESTS
}

fn default_teardown_timeout() -> Duration {
    DEFAULT_TEARDOWN_TIMEOUT
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_session_timeout() -> Duration {
    DEFAULT_SESSION_TIMEOUT
}
