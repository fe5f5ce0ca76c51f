// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Harness
//!
//! High-level test harness for running integration tests with proper setup and teardown.
//!
//! ## Design Principles
//!
//! - Automatic resource management
//! - Consistent test environment setup
//! - Every test gets its own runtime and simulated server

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use uaflow_client::{ClientResult, ClientRuntime, ConfigId, ConnectionConfig, ConnectionHandle};

use super::builders::TestRuntimeBuilder;
use super::fixtures::{PkiFiles, PkiFixtures};
use super::mocks::{SimServerConfig, SimulatedEngine};

// =============================================================================
// Test Harness
// =============================================================================

/// Configuration for the test harness.
#[derive(Debug, Clone)]
pub struct TestHarnessConfig {
    /// Name of the test (used for logging and temp directories).
    pub test_name: String,

    /// Timeout for the entire test.
    pub timeout: Duration,

    /// Simulated server settings.
    pub server: SimServerConfig,

    /// Whether to write certificate and key files.
    pub with_pki: bool,

    /// Whether to enable tracing for the test.
    pub enable_tracing: bool,
}

impl Default for TestHarnessConfig {
    fn default() -> Self {
        Self {
            test_name: "unknown_test".to_string(),
            timeout: Duration::from_secs(30),
            server: SimServerConfig::default(),
            with_pki: false,
            enable_tracing: false,
        }
    }
}

impl TestHarnessConfig {
    /// Create a new config with a test name.
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            ..Default::default()
        }
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use custom simulated server settings.
    pub fn server(mut self, server: SimServerConfig) -> Self {
        self.server = server;
        self
    }

    /// Write certificate and key files into the temp directory.
    pub fn with_pki(mut self) -> Self {
        self.with_pki = true;
        self
    }

    /// Enable tracing.
    pub fn with_tracing(mut self) -> Self {
        self.enable_tracing = true;
        self
    }
}

/// Resources provided by the test harness.
pub struct TestResources {
    /// Configuration used to create this harness.
    pub config: TestHarnessConfig,

    /// Runtime under test.
    pub runtime: ClientRuntime,

    /// Engine behind the runtime.
    pub engine: Arc<SimulatedEngine>,

    /// Key material, when requested.
    pub pki: Option<PkiFiles>,

    /// Temporary directory.
    temp_dir: TempDir,
}

impl TestResources {
    /// Get the temp directory path.
    pub fn temp_path(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    /// Create a file path in the temp directory.
    pub fn temp_file(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Key material; panics if the harness was built without it.
    pub fn pki(&self) -> &PkiFiles {
        match &self.pki {
            Some(pki) => pki,
            None => panic!("Harness was created without PKI files"),
        }
    }

    /// Registers `config` and connects.
    pub async fn connect(&self, config: ConnectionConfig) -> ClientResult<(ConfigId, ConnectionHandle)> {
        let id = self.runtime.add_connection_config(config)?;
        let handle = self.runtime.connect(id).await?;
        Ok((id, handle))
    }
}

/// The main test harness.
pub struct TestHarness {
    config: TestHarnessConfig,
}

impl TestHarness {
    /// Create a new test harness with a config.
    pub fn new(config: TestHarnessConfig) -> Self {
        Self { config }
    }

    /// Create a new test harness with a test name.
    pub fn with_name(test_name: impl Into<String>) -> Self {
        Self::new(TestHarnessConfig::new(test_name))
    }

    /// Set up the test environment. Must be called inside a Tokio runtime.
    pub fn setup(self) -> TestResources {
        if self.config.enable_tracing {
            let _ = tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,uaflow=debug")),
                )
                .try_init();
        }

        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("uaflow_test_{}_", self.config.test_name))
            .tempdir()
            .expect("Failed to create temp directory");

        let pki = self.config.with_pki.then(|| {
            PkiFixtures::write(&temp_dir.path().join("pki")).expect("Failed to write PKI files")
        });

        let (runtime, engine) = TestRuntimeBuilder::new()
            .server(self.config.server.clone())
            .build();

        TestResources {
            config: self.config,
            runtime,
            engine,
            pki,
            temp_dir,
        }
    }

    /// Run a test with automatic setup and teardown.
    ///
    /// The runtime is cleared after the test body returns.
    pub async fn run<F, Fut>(self, test_fn: F)
    where
        F: FnOnce(TestResources) -> Fut,
        Fut: Future<Output = ()>,
    {
        let timeout = self.config.timeout;
        let resources = self.setup();
        let runtime = resources.runtime.clone();

        if tokio::time::timeout(timeout, test_fn(resources)).await.is_err() {
            panic!("Test timed out after {:?}", timeout);
        }

        if let Err(err) = runtime.clear().await {
            panic!("Runtime teardown failed: {}", err);
        }
    }
}
