// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Builders
//!
//! Builder patterns for constructing complex test objects with sensible defaults.
//!
//! ## Design Principles
//!
//! - Sensible defaults for common test scenarios
//! - Chainable methods for fluent API
//! - The built runtime and its engine are returned together

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use uaflow_client::{
    ClientConfig, ClientRuntime, CredentialProvider, FilePkiProvider, StaticCredentials,
};

use super::mocks::{SimServerConfig, SimulatedEngine};

// =============================================================================
// Simulated Server Builder
// =============================================================================

/// Builder for [`SimServerConfig`].
#[derive(Debug, Clone, Default)]
pub struct SimServerBuilder {
    config: SimServerConfig,
}

impl SimServerBuilder {
    /// Starts from the default server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum publishing interval.
    pub fn min_publishing_interval(mut self, interval: Duration) -> Self {
        self.config.min_publishing_interval = interval;
        self
    }

    /// Replaces the server certificate.
    pub fn certificate(mut self, der: impl Into<Vec<u8>>) -> Self {
        self.config.certificate_der = der.into();
        self
    }

    /// Adds an accepted user.
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.users.insert(username.into(), password.into());
        self
    }

    /// Removes every accepted user.
    pub fn no_users(mut self) -> Self {
        self.config.users = HashMap::new();
        self
    }

    /// Sets the application URI reported by discovery.
    pub fn application_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.application_uri = uri.into();
        self
    }

    /// Builds the settings.
    pub fn build(self) -> SimServerConfig {
        self.config
    }

    /// Builds an engine serving these settings. Requires a Tokio runtime.
    pub fn engine(self) -> Arc<SimulatedEngine> {
        Arc::new(SimulatedEngine::with_server(self.config))
    }
}

// =============================================================================
// Runtime Builder
// =============================================================================

/// Builds a [`ClientRuntime`] over a [`SimulatedEngine`].
pub struct TestRuntimeBuilder {
    server: SimServerConfig,
    config: ClientConfig,
    credentials: StaticCredentials,
    pki_dir: Option<PathBuf>,
}

impl Default for TestRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRuntimeBuilder {
    /// Defaults: default server, operator credentials, short teardown.
    pub fn new() -> Self {
        Self {
            server: SimServerConfig::default(),
            config: ClientConfig {
                application_uri: "urn:uaflow:tests".to_string(),
                teardown_timeout: Duration::from_secs(1),
                ..Default::default()
            },
            credentials: StaticCredentials::new().with_user("operator", "secret"),
            pki_dir: None,
        }
    }

    /// Uses a custom simulated server.
    pub fn server(mut self, server: SimServerConfig) -> Self {
        self.server = server;
        self
    }

    /// Sets the connection slot capacity.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Sets the per-connection in-flight request bound.
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.config.max_pending_requests = max;
        self
    }

    /// Sets the reverse endpoint teardown bound.
    pub fn teardown_timeout(mut self, timeout: Duration) -> Self {
        self.config.teardown_timeout = timeout;
        self
    }

    /// Adds a user password.
    pub fn user(mut self, username: &str, password: &str) -> Self {
        self.credentials = self.credentials.with_user(username, password);
        self
    }

    /// Adds a private key password.
    pub fn key_password(mut self, path: impl Into<PathBuf>, password: &str) -> Self {
        self.credentials = self.credentials.with_key_password(path, password);
        self
    }

    /// Resolves relative certificate paths against `dir`.
    pub fn pki_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pki_dir = Some(dir.into());
        self
    }

    /// Builds the engine and the runtime. Requires a Tokio runtime.
    pub fn build(self) -> (ClientRuntime, Arc<SimulatedEngine>) {
        let engine = Arc::new(SimulatedEngine::with_server(self.server));
        let pki = match self.pki_dir {
            Some(dir) => FilePkiProvider::with_base_dir(dir),
            None => FilePkiProvider::new(),
        };
        let credentials: Arc<dyn CredentialProvider> = Arc::new(self.credentials);
        let runtime = ClientRuntime::builder(engine.clone())
            .config(self.config)
            .pki(Arc::new(pki))
            .credentials(credentials)
            .build();
        (runtime, engine)
    }
}
