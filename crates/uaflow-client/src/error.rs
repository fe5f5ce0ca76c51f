// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client error types with API status mapping and diagnostics.
//!
//! Every failure that crosses the public API is a [`ClientError`]. Each error
//! maps onto exactly one [`Status`], the coarse status set applications
//! branch on:
//!
//! ```text
//! ClientError                         Status
//! ├── Connection    handle / lifecycle   InvalidState, Closed, OutOfMemory, Nok
//! ├── Request       service calls        InvalidParameters, InvalidState, Nok
//! ├── Subscription  subscription mgmt    InvalidParameters, InvalidState, Nok
//! ├── Configuration config / PKI         InvalidParameters
//! └── Timeout       bounded waits        Timeout
//! ```
//!
//! # Examples
//!
//! ```
//! use uaflow_client::error::{ClientError, ConnectionError, Status};
//!
//! let error = ClientError::from(ConnectionError::AlreadyConnected {
//!     endpoint: "opc.tcp://localhost:4841".into(),
//! });
//!
//! assert_eq!(error.status(), Status::InvalidState);
//! assert!(!error.is_retryable());
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::types::StatusCode;

// =============================================================================
// Status
// =============================================================================

/// Coarse status returned at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Operation succeeded.
    #[default]
    Ok,
    /// Caller misuse detected before any protocol interaction.
    InvalidParameters,
    /// Operation conflicts with the current state (stale handle, already connected, ...).
    InvalidState,
    /// A bounded resource is exhausted; nothing was sent.
    OutOfMemory,
    /// A bounded wait expired.
    Timeout,
    /// The connection was closed or could not be established.
    Closed,
    /// Generic protocol or transport failure.
    Nok,
}

impl Status {
    /// Returns `true` for [`Status::Ok`].
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Returns the canonical upper-case name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidParameters => "INVALID_PARAMETERS",
            Self::InvalidState => "INVALID_STATE",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::Timeout => "TIMEOUT",
            Self::Closed => "CLOSED",
            Self::Nok => "NOK",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T> From<&ClientResult<T>> for Status {
    fn from(result: &ClientResult<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

// =============================================================================
// ClientError - Main Error Type
// =============================================================================

/// The main error type of the client layer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection handle and lifecycle errors.
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// Service request errors.
    #[error("{0}")]
    Request(#[from] RequestError),

    /// Subscription and monitored item errors.
    #[error("{0}")]
    Subscription(#[from] SubscriptionError),

    /// Configuration and PKI errors.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// Bounded wait expiry.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),
}

impl ClientError {
    // =========================================================================
    // Convenience Factory Methods
    // =========================================================================

    /// Creates a stale handle error.
    pub fn invalid_handle(handle: impl fmt::Display) -> Self {
        Self::Connection(ConnectionError::InvalidHandle {
            handle: handle.to_string(),
        })
    }

    /// Creates a "runtime not initialized or already cleared" error.
    pub fn not_initialized() -> Self {
        Self::Connection(ConnectionError::NotInitialized)
    }

    /// Creates a closed connection error.
    pub fn closed(endpoint: impl Into<String>, status: StatusCode) -> Self {
        Self::Connection(ConnectionError::Closed {
            endpoint: endpoint.into(),
            status,
        })
    }

    /// Creates an invalid request error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::Request(RequestError::InvalidRequest {
            reason: reason.into(),
        })
    }

    /// Creates a send failure error.
    pub fn send_failed(service: impl Into<String>, status: StatusCode) -> Self {
        Self::Request(RequestError::SendFailed {
            service: service.into(),
            status,
        })
    }

    // =========================================================================
    // Error Properties
    // =========================================================================

    /// Returns the API status for this error.
    pub fn status(&self) -> Status {
        match self {
            Self::Connection(e) => e.status(),
            Self::Request(e) => e.status(),
            Self::Subscription(e) => e.status(),
            Self::Configuration(_) => Status::InvalidParameters,
            Self::Timeout(_) => Status::Timeout,
        }
    }

    /// Returns the protocol status code carried by this error, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Connection(ConnectionError::Closed { status, .. })
            | Self::Connection(ConnectionError::EngineRejected { status, .. })
            | Self::Request(RequestError::SendFailed { status, .. })
            | Self::Request(RequestError::ServiceFault { status, .. })
            | Self::Subscription(SubscriptionError::OperationFailed { status, .. }) => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Returns `true` if the operation may succeed when attempted again.
    ///
    /// Nothing is retried automatically; this only informs the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retryable(),
            Self::Request(e) => e.is_retryable(),
            Self::Subscription(_) | Self::Configuration(_) => false,
            Self::Timeout(_) => true,
        }
    }

    /// Returns the severity level of this error.
    pub fn severity(&self) -> ErrorSeverity {
        match self.status() {
            Status::Ok => ErrorSeverity::Info,
            Status::InvalidParameters | Status::InvalidState => ErrorSeverity::Warning,
            Status::Timeout | Status::Closed | Status::Nok => ErrorSeverity::Error,
            Status::OutOfMemory => ErrorSeverity::Critical,
        }
    }

    /// Returns the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Request(_) => "request",
            Self::Subscription(_) => "subscription",
            Self::Configuration(_) => "configuration",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Returns a unique error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection(e) => e.error_code(),
            Self::Request(e) => e.error_code(),
            Self::Subscription(e) => e.error_code(),
            Self::Configuration(e) => e.error_code(),
            Self::Timeout(e) => e.error_code(),
        }
    }

    /// Returns recovery hints for this error.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::Connection(e) => e.recovery_hints(),
            Self::Request(e) => e.recovery_hints(),
            Self::Subscription(e) => e.recovery_hints(),
            Self::Configuration(_) => vec![
                "Check endpoint URL, security mode and policy",
                "Verify certificate and key paths",
            ],
            Self::Timeout(_) => vec![
                "The connection was put in error state; disconnect before retrying",
                "Consider increasing the request timeout",
            ],
        }
    }

    /// Returns the tracing level for this error.
    pub fn tracing_level(&self) -> Level {
        self.severity().to_tracing_level()
    }

    /// Logs this error with appropriate level and context.
    pub fn log(&self, context: &str) {
        let code = self.error_code();
        let status = self.status();

        match self.tracing_level() {
            Level::ERROR => tracing::error!(
                error_code = %code,
                status = %status,
                category = self.category(),
                context = context,
                "{self}"
            ),
            Level::WARN => tracing::warn!(
                error_code = %code,
                status = %status,
                category = self.category(),
                context = context,
                "{self}"
            ),
            _ => tracing::debug!(
                error_code = %code,
                status = %status,
                category = self.category(),
                context = context,
                "{self}"
            ),
        }
    }
}

// =============================================================================
// ConnectionError
// =============================================================================

/// Connection handle and lifecycle errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The runtime was never initialized or has been cleared.
    #[error("Client runtime is not initialized")]
    NotInitialized,

    /// The handle no longer matches the registry slot.
    #[error("Connection handle {handle} is stale or unknown")]
    InvalidHandle {
        /// Display form of the handle.
        handle: String,
    },

    /// No configuration is registered under this id.
    #[error("Unknown connection configuration: {config}")]
    UnknownConfig {
        /// Display form of the config id.
        config: String,
    },

    /// A connection already exists for this configuration.
    #[error("Connection to {endpoint} already exists")]
    AlreadyConnected {
        /// Endpoint URL.
        endpoint: String,
    },

    /// A synchronous connect or disconnect is already running.
    #[error("Connect or disconnect already in progress for {endpoint}")]
    SyncInProgress {
        /// Endpoint URL.
        endpoint: String,
    },

    /// The operation requires an activated session.
    #[error("Connection to {endpoint} is not activated (state: {state})")]
    NotActivated {
        /// Endpoint URL.
        endpoint: String,
        /// Current state name.
        state: String,
    },

    /// The connection could not be established or was closed.
    #[error("Connection to {endpoint} closed: {status}")]
    Closed {
        /// Endpoint URL.
        endpoint: String,
        /// Engine status code.
        status: StatusCode,
    },

    /// All connection slots are in use.
    #[error("Too many connection configurations (max: {max})")]
    TooManyConnections {
        /// Slot capacity.
        max: usize,
    },

    /// The protocol engine refused an operation.
    #[error("Protocol engine rejected {operation}: {status}")]
    EngineRejected {
        /// Operation name.
        operation: &'static str,
        /// Engine status code.
        status: StatusCode,
    },
}

impl ConnectionError {
    /// Returns the API status.
    pub fn status(&self) -> Status {
        match self {
            Self::NotInitialized
            | Self::InvalidHandle { .. }
            | Self::AlreadyConnected { .. }
            | Self::SyncInProgress { .. }
            | Self::NotActivated { .. } => Status::InvalidState,
            Self::UnknownConfig { .. } => Status::InvalidParameters,
            Self::Closed { .. } => Status::Closed,
            Self::TooManyConnections { .. } => Status::OutOfMemory,
            Self::EngineRejected { .. } => Status::Nok,
        }
    }

    /// Returns `true` if a new attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Closed { .. } | Self::SyncInProgress { .. } | Self::EngineRejected { .. }
        )
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        let code = match self {
            Self::NotInitialized => 1,
            Self::InvalidHandle { .. } => 2,
            Self::UnknownConfig { .. } => 3,
            Self::AlreadyConnected { .. } => 4,
            Self::SyncInProgress { .. } => 5,
            Self::NotActivated { .. } => 6,
            Self::Closed { .. } => 7,
            Self::TooManyConnections { .. } => 8,
            Self::EngineRejected { .. } => 9,
        };
        ErrorCode::new(1, code)
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::NotInitialized => vec!["Create a new ClientRuntime"],
            Self::InvalidHandle { .. } => {
                vec!["The connection was disconnected; connect again for a fresh handle"]
            }
            Self::UnknownConfig { .. } => vec!["Register the configuration before connecting"],
            Self::AlreadyConnected { .. } => vec!["Disconnect before connecting again"],
            Self::SyncInProgress { .. } => vec!["Wait for the pending connect or disconnect"],
            Self::NotActivated { .. } => vec!["Wait for the session to be activated"],
            Self::Closed { .. } => vec![
                "Check that the server is reachable",
                "Verify the server certificate and security settings",
            ],
            Self::TooManyConnections { .. } => {
                vec!["Increase max_connections or remove unused configurations"]
            }
            Self::EngineRejected { .. } => vec!["Inspect the engine status code"],
        }
    }
}

// =============================================================================
// RequestError
// =============================================================================

/// Service request errors.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request is malformed for this call path.
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// Reason for rejection.
        reason: String,
    },

    /// The engine failed to send the request or reported a send failure.
    #[error("{service} request failed: {status}")]
    SendFailed {
        /// Service name.
        service: String,
        /// Engine status code.
        status: StatusCode,
    },

    /// The request context was dropped without completion.
    #[error("{service} request was abandoned before completion")]
    Abandoned {
        /// Service name.
        service: String,
    },

    /// The server answered with a fault or a bad service result.
    #[error("{service} service fault: {status}")]
    ServiceFault {
        /// Service name.
        service: String,
        /// Service result.
        status: StatusCode,
    },

    /// Too many requests are in flight on the connection.
    #[error("Too many pending requests (limit: {limit})")]
    TooManyPending {
        /// Per-connection limit.
        limit: usize,
    },

    /// The response does not belong to the request's service.
    #[error("Expected {expected} response, got {actual}")]
    UnexpectedResponse {
        /// Expected service.
        expected: String,
        /// Received service.
        actual: String,
    },

    /// Asynchronous call without a registered response callback.
    #[error("No asynchronous response callback registered")]
    AsyncCallbackMissing,

    /// The asynchronous response callback is already registered.
    #[error("Asynchronous response callback already registered")]
    AsyncCallbackAlreadySet,
}

impl RequestError {
    /// Returns the API status.
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidRequest { .. } => Status::InvalidParameters,
            Self::AsyncCallbackMissing | Self::AsyncCallbackAlreadySet => Status::InvalidState,
            Self::TooManyPending { .. } => Status::OutOfMemory,
            Self::SendFailed { .. }
            | Self::Abandoned { .. }
            | Self::ServiceFault { .. }
            | Self::UnexpectedResponse { .. } => Status::Nok,
        }
    }

    /// Returns `true` if a new attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SendFailed { .. } | Self::Abandoned { .. } | Self::TooManyPending { .. }
        )
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        let code = match self {
            Self::InvalidRequest { .. } => 1,
            Self::SendFailed { .. } => 2,
            Self::Abandoned { .. } => 3,
            Self::ServiceFault { .. } => 4,
            Self::AsyncCallbackMissing => 5,
            Self::AsyncCallbackAlreadySet => 6,
            Self::TooManyPending { .. } => 7,
            Self::UnexpectedResponse { .. } => 8,
        };
        ErrorCode::new(2, code)
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::InvalidRequest { .. } => vec!["Check the request parameters"],
            Self::SendFailed { .. } | Self::Abandoned { .. } => {
                vec!["Check the connection state", "Retry the request"]
            }
            Self::ServiceFault { .. } | Self::UnexpectedResponse { .. } => {
                vec!["Inspect the service result code"]
            }
            Self::TooManyPending { .. } => vec!["Wait for outstanding requests to complete"],
            Self::AsyncCallbackMissing => vec!["Call set_service_async_response first"],
            Self::AsyncCallbackAlreadySet => vec!["The callback can only be set once"],
        }
    }
}

// =============================================================================
// SubscriptionError
// =============================================================================

/// Subscription and monitored item errors.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// A subscription already exists (or is being created) on the connection.
    #[error("Connection already has a subscription")]
    AlreadyExists,

    /// The connection has no subscription.
    #[error("Connection has no subscription")]
    NoSubscription,

    /// The request targets a subscription other than the managed one.
    #[error("Subscription id {actual} does not match current subscription {expected}")]
    IdMismatch {
        /// Current managed id.
        expected: u32,
        /// Id carried by the caller.
        actual: u32,
    },

    /// The service is not accepted on this call path.
    #[error("{service} is not allowed here")]
    NotAllowed {
        /// Service name.
        service: String,
    },

    /// Monitored item count and user context count differ.
    #[error("Expected {items} monitored item contexts, got {contexts}")]
    ContextCountMismatch {
        /// Number of items.
        items: usize,
        /// Number of contexts.
        contexts: usize,
    },

    /// A publish token count of zero was requested.
    #[error("Publish token count must be greater than zero")]
    InvalidTokenCount,

    /// The engine or server reported a failure.
    #[error("{operation} failed: {status}")]
    OperationFailed {
        /// Operation name.
        operation: &'static str,
        /// Status code.
        status: StatusCode,
    },
}

impl SubscriptionError {
    /// Returns the API status.
    pub fn status(&self) -> Status {
        match self {
            Self::AlreadyExists | Self::NoSubscription => Status::InvalidState,
            Self::IdMismatch { .. }
            | Self::NotAllowed { .. }
            | Self::ContextCountMismatch { .. }
            | Self::InvalidTokenCount => Status::InvalidParameters,
            Self::OperationFailed { .. } => Status::Nok,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        let code = match self {
            Self::AlreadyExists => 1,
            Self::NoSubscription => 2,
            Self::IdMismatch { .. } => 3,
            Self::NotAllowed { .. } => 4,
            Self::ContextCountMismatch { .. } => 5,
            Self::InvalidTokenCount => 6,
            Self::OperationFailed { .. } => 7,
        };
        ErrorCode::new(3, code)
    }

    /// Returns recovery hints.
    pub fn recovery_hints(&self) -> Vec<&'static str> {
        match self {
            Self::AlreadyExists => vec!["Delete the existing subscription first"],
            Self::NoSubscription => vec!["Create a subscription first"],
            Self::IdMismatch { .. } => {
                vec!["The subscription handle is stale; use the current subscription"]
            }
            Self::NotAllowed { .. } => {
                vec!["Use the dedicated subscription operations for this service"]
            }
            Self::ContextCountMismatch { .. } => vec!["Provide one context per monitored item"],
            Self::InvalidTokenCount => vec!["Use at least one publish token"],
            Self::OperationFailed { .. } => vec!["Inspect the status code"],
        }
    }
}

// =============================================================================
// ConfigurationError
// =============================================================================

/// Configuration and PKI errors.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Invalid endpoint URL.
    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidEndpoint {
        /// The URL.
        url: String,
        /// Reason.
        reason: String,
    },

    /// Node id string could not be parsed.
    #[error("Invalid node id '{node_id}': {reason}")]
    InvalidNodeId {
        /// The input.
        node_id: String,
        /// Reason.
        reason: String,
    },

    /// Security mode and policy combination is invalid.
    #[error("Invalid security configuration: {message}")]
    InvalidSecurity {
        /// Message.
        message: String,
    },

    /// Required field missing.
    #[error("Missing required field: {field}")]
    MissingField {
        /// Field name.
        field: String,
    },

    /// Invalid duration value.
    #[error("Invalid {field}: {duration:?} ({reason})")]
    InvalidDuration {
        /// Field name.
        field: &'static str,
        /// The value.
        duration: Duration,
        /// Reason.
        reason: String,
    },

    /// A value is out of its allowed range.
    #[error("Invalid {field}: {reason}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// Reason.
        reason: String,
    },

    /// Certificate or key could not be loaded.
    #[error("Failed to load '{path}': {message}")]
    Pki {
        /// File path.
        path: String,
        /// Message.
        message: String,
    },

    /// The credential provider returned nothing.
    #[error("No credential available for {what}")]
    MissingCredential {
        /// What was requested.
        what: String,
    },
}

impl ConfigurationError {
    /// Creates an invalid endpoint error.
    pub fn invalid_endpoint(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid node id error.
    pub fn invalid_node_id(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidNodeId {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid security error.
    pub fn invalid_security(message: impl Into<String>) -> Self {
        Self::InvalidSecurity {
            message: message.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates a PKI load error.
    pub fn pki(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pki {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        let code = match self {
            Self::InvalidEndpoint { .. } => 1,
            Self::InvalidNodeId { .. } => 2,
            Self::InvalidSecurity { .. } => 3,
            Self::MissingField { .. } => 4,
            Self::InvalidDuration { .. } => 5,
            Self::InvalidValue { .. } => 6,
            Self::Pki { .. } => 7,
            Self::MissingCredential { .. } => 8,
        };
        ErrorCode::new(4, code)
    }
}

// =============================================================================
// TimeoutError
// =============================================================================

/// A bounded wait expired.
#[derive(Debug, Error)]
#[error("{operation} timed out after {duration:?}")]
pub struct TimeoutError {
    /// Operation name.
    pub operation: &'static str,
    /// Budget that elapsed.
    pub duration: Duration,
}

impl TimeoutError {
    /// Creates a timeout error.
    pub fn new(operation: &'static str, duration: Duration) -> Self {
        Self {
            operation,
            duration,
        }
    }

    /// Returns the error code.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::new(5, 1)
    }
}

// =============================================================================
// ErrorSeverity
// =============================================================================

/// Error severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Informational.
    Info,
    /// Caller-side problem.
    Warning,
    /// Operation failed.
    Error,
    /// Resource exhaustion.
    Critical,
}

impl ErrorSeverity {
    /// Converts to tracing level.
    pub fn to_tracing_level(self) -> Level {
        match self {
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// ErrorCode
// =============================================================================

/// Structured error code, formatted as `UF-XXYY`.
///
/// Categories: 1 connection, 2 request, 3 subscription, 4 configuration,
/// 5 timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category.
    pub category: u8,
    /// Specific error within category.
    pub code: u8,
}

impl ErrorCode {
    /// Creates a new error code.
    pub const fn new(category: u8, code: u8) -> Self {
        Self { category, code }
    }

    /// Returns the full error code as a u16.
    pub fn as_u16(&self) -> u16 {
        ((self.category as u16) << 8) | (self.code as u16)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UF-{:02X}{:02X}", self.category, self.code)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A Result type with ClientError.
pub type ClientResult<T> = Result<T, ClientError>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ClientError::invalid_handle("#0.1").status(),
            Status::InvalidState
        );
        assert_eq!(
            ClientError::closed("opc.tcp://x:4841", StatusCode::BAD_CERTIFICATE_INVALID).status(),
            Status::Closed
        );
        assert_eq!(
            ClientError::invalid_request("bad").status(),
            Status::InvalidParameters
        );
        assert_eq!(
            ClientError::from(TimeoutError::new("create subscription", Duration::from_secs(1)))
                .status(),
            Status::Timeout
        );
        assert_eq!(
            ClientError::from(ConnectionError::TooManyConnections { max: 4 }).status(),
            Status::OutOfMemory
        );
        assert_eq!(
            ClientError::from(SubscriptionError::IdMismatch {
                expected: 1,
                actual: 2
            })
            .status(),
            Status::InvalidParameters
        );
        assert_eq!(
            ClientError::from(SubscriptionError::AlreadyExists).status(),
            Status::InvalidState
        );
    }

    #[test]
    fn test_status_code_extraction() {
        let error = ClientError::send_failed("Read", StatusCode::BAD_TIMEOUT);
        assert_eq!(error.status_code(), Some(StatusCode::BAD_TIMEOUT));
        assert_eq!(error.status(), Status::Nok);
        assert!(error.is_retryable());

        assert_eq!(ClientError::not_initialized().status_code(), None);
    }

    #[test]
    fn test_status_from_result() {
        let ok: ClientResult<()> = Ok(());
        assert_eq!(Status::from(&ok), Status::Ok);

        let err: ClientResult<()> = Err(ClientError::invalid_request("x"));
        assert_eq!(Status::from(&err), Status::InvalidParameters);
    }

    #[test]
    fn test_error_code_display() {
        let code = ErrorCode::new(3, 7);
        assert_eq!(code.to_string(), "UF-0307");
        assert_eq!(code.as_u16(), 0x0307);
    }

    #[test]
    fn test_severity() {
        assert_eq!(
            ClientError::invalid_request("x").severity(),
            ErrorSeverity::Warning
        );
        assert_eq!(
            ClientError::from(ConnectionError::TooManyConnections { max: 1 }).severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(ErrorSeverity::Critical.to_tracing_level(), Level::ERROR);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::InvalidParameters.to_string(), "INVALID_PARAMETERS");
        assert_eq!(Status::Closed.to_string(), "CLOSED");
        assert!(Status::Ok.is_ok());
    }
}
