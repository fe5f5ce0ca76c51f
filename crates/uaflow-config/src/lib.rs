// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # uaflow-config
//!
//! File-based configuration for the uaflow client runtime.
//!
//! ## Features
//!
//! - **Multi-Format Support**: YAML, TOML, and JSON configuration files
//! - **Environment Placeholders**: `${VAR}` and `${VAR:default}` in any value
//! - **Environment Overrides**: `UAFLOW_*` variables override selected settings
//! - **Path Resolution**: certificate paths relative to the file or `pki_dir`
//! - **Validation**: the same rules the runtime applies, reported per entry
//!
//! ## Quick Start
//!
//! ```no_run
//! use uaflow_config::loader::load_config;
//!
//! let config = load_config("uaflow.yaml").unwrap();
//! for connection in config.connection_configs().unwrap() {
//!     println!("{}", connection.endpoint_url);
//! }
//! ```
//!
//! ## Configuration Schema
//!
//! ```yaml
//! client:
//!   application_uri: urn:example:client
//!   pki_dir: pki
//!   max_connections: 16
//! connections:
//!   - id: line-1
//!     endpoint_url: "opc.tcp://${PLC_HOST:localhost}:4840"
//!     request_timeout: 5s
//! logging:
//!   level: info
//!   format: json
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod error;
pub mod loader;
pub mod schema;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_config, load_config_str, ConfigFormat, ConfigLoader, ConfigLoaderBuilder};
pub use schema::{
    ClientSection, ConnectionEntry, LogLevel, LoggingConfig, SubscriptionSection, UaflowConfig,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

// =============================================================================
// Runtime Wiring
// =============================================================================

/// Registers every connection of `config` with `runtime`, in file order.
///
/// Returns the assigned ids paired with the entry ids.
pub fn register_connections(
    runtime: &uaflow_client::ClientRuntime,
    config: &UaflowConfig,
) -> uaflow_client::ClientResult<Vec<(String, uaflow_client::ConfigId)>> {
    let mut ids = Vec::with_capacity(config.connections.len());
    for (entry, connection) in config.connections.iter().zip(config.connection_configs()?) {
        ids.push((entry.id.clone(), runtime.add_connection_config(connection)?));
    }
    tracing::debug!(count = ids.len(), "Connections registered");
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name() {
        assert_eq!(NAME, "uaflow-config");
        assert!(!VERSION.is_empty());
    }
}
