// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # uaflow Integration Tests
//!
//! Integration tests for the uaflow client runtime, with the utilities
//! they share. The centerpiece is [`SimulatedEngine`](common::SimulatedEngine),
//! a protocol engine backed by an in-memory server, so the whole runtime
//! can be exercised without sockets.
//!
//! ## Module Structure
//!
//! - [`common`]: Shared test utilities, fixtures, and helpers
//!   - `fixtures`: Configurations, service payloads and key material
//!   - `builders`: Builders for runtimes and simulated servers
//!   - `assertions`: Custom assertion helpers
//!   - `mocks`: The simulated protocol engine
//!   - `harness`: Test harness for integration tests
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test -p uaflow-tests
//!
//! # Run specific test suite
//! cargo test -p uaflow-tests --test integration_connection
//! cargo test -p uaflow-tests --test integration_services
//! cargo test -p uaflow-tests --test integration_subscription
//! cargo test -p uaflow-tests --test integration_discovery
//! cargo test -p uaflow-tests --test integration_config
//! ```
//!
//! ## Test Categories
//!
//! ### Connection Tests (`integration_connection.rs`)
//! - Connect and disconnect, stale handles
//! - Activation failures, certificate pinning, user credentials
//! - Reactivation and server-side session loss
//! - Concurrent connections and teardown
//!
//! ### Service Tests (`integration_services.rs`)
//! - Synchronous and asynchronous generic requests
//! - Read, Write and Browse helpers
//! - Send failures and request bounds
//!
//! ### Subscription Tests (`integration_subscription.rs`)
//! - Creation and revised parameters
//! - Monitored items and data change delivery
//! - Publish token accounting and acknowledgements
//!
//! ### Discovery Tests (`integration_discovery.rs`)
//! - Discovery-only connections and their promotion
//! - GetEndpoints and FindServers
//!
//! ### Config Tests (`integration_config.rs`)
//! - Loading files and registering their connections
//! - Relative certificate paths
//!
//! ## Writing New Tests
//!
//! ```rust,ignore
//! use uaflow_tests::prelude::*;
//!
//! #[tokio::test]
//! async fn test_with_harness() {
//!     TestHarness::with_name("my_test")
//!         .run(|res| async move {
//!             let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.unwrap();
//!             let values = res.runtime.read(handle, &[SimNodes::temperature()]).await.unwrap();
//!             values[0].assert_good();
//!         })
//!         .await;
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod common;

/// Re-export commonly used items for convenience.
pub mod prelude {
    pub use crate::common::assertions::*;
    pub use crate::common::builders::*;
    pub use crate::common::fixtures::*;
    pub use crate::common::harness::*;
    pub use crate::common::mocks::*;
}
