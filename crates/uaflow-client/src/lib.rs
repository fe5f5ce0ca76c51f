// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA client orchestration layer.
//!
//! This crate sits between an application and an OPC UA protocol engine. The
//! engine owns sockets, encoding and security; this crate owns everything the
//! application sees:
//!
//! - Connection configurations and their finalization (certificates, credentials)
//! - Per-connection state machines driven by engine events
//! - Request contexts for synchronous, asynchronous and internal requests
//! - A managed subscription per connection with publish token accounting
//! - Discovery-only connections and shared reverse endpoints
//! - Typed service helpers (`read`, `write`, `browse`, `get_endpoints`)
//!
//! # Error Handling
//!
//! Every error maps to one API [`Status`]:
//!
//! ```text
//! ClientError
//! ├── Connection    - Handles, lifecycle, session activation
//! ├── Request       - Send failures, service faults, callbacks
//! ├── Subscription  - Managed subscription misuse and failures
//! ├── Configuration - Invalid settings, PKI and credentials
//! └── Timeout       - Bounded waits that expired
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use uaflow_client::{ClientRuntime, ConnectionConfig, NodeId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = ClientRuntime::new(Arc::new(MyEngine::default()));
//!     let config = runtime.add_connection_config(
//!         ConnectionConfig::builder()
//!             .endpoint("opc.tcp://localhost:4840")
//!             .build()?,
//!     )?;
//!
//!     let connection = runtime.connect(config).await?;
//!     let values = runtime.read(connection, &[NodeId::numeric(1, 1012)]).await?;
//!     println!("Value: {}", values[0].value);
//!
//!     runtime.disconnect(connection).await?;
//!     runtime.clear().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Core Modules
// =============================================================================

pub mod config;
pub mod error;
pub mod message;
pub mod types;

// =============================================================================
// Runtime Modules
// =============================================================================

pub mod client;
pub mod engine;
pub mod helpers;
pub mod logging;

// Re-export commonly used types
pub use error::{
    ClientError, ClientResult, ConfigurationError, ConnectionError, ErrorCode, ErrorSeverity,
    RequestError, Status, SubscriptionError, TimeoutError,
};

pub use types::{
    AttributeId, DataValue, NodeId, NodeIdentifier, SecurityMode, SecurityPolicy, StatusCode,
    UserIdentity, Variant,
};

pub use config::{
    ClientConfig, ConnectionConfig, ConnectionConfigBuilder, CredentialProvider,
    FilePkiProvider, FinalizedConnection, NoCredentials, PkiProvider, StaticCredentials,
    SubscriptionParams,
};

pub use message::{Request, Response, ServiceKind};

// Re-export runtime types
pub use client::{
    ClientRuntime, ClientRuntimeBuilder, ConfigId, ConnectionEvent, ConnectionEventCallback,
    ConnectionHandle, ConnectionInfo, ConnectionState, ConnectionStats, DataChange,
    NotificationCallback, RevisedParameters, ServiceOutcome, ServiceResponseCallback,
    Subscription, SubscriptionNotification, UserContext,
};

// Re-export engine boundary types
pub use engine::{
    ChannelConfigId, EngineContext, EngineEvent, EventSink, ProtocolEngine, ReverseEndpointId,
    SessionId,
};

pub use logging::{init_logging, try_init_logging, LogFormat};
