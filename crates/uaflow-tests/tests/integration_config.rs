// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Configuration Integration Tests
//!
//! Integration tests wiring configuration files into a runtime:
//!
//! - Loading files and registering their connections
//! - Relative certificate paths and the PKI directory
//! - Error mapping at the runtime boundary

use std::sync::Arc;
use std::time::Duration;

use uaflow_client::{
    ClientError, ClientRuntime, LogFormat, SecurityMode, SecurityPolicy, StaticCredentials,
    Status, UserIdentity,
};
use uaflow_config::{
    load_config_str, register_connections, ConfigError, ConfigFormat, ConfigLoader, LogLevel,
    UaflowConfig,
};
use uaflow_tests::prelude::*;

fn runtime_for(config: &UaflowConfig) -> (ClientRuntime, Arc<SimulatedEngine>) {
    let engine = Arc::new(SimulatedEngine::new());
    let runtime = ClientRuntime::builder(engine.clone())
        .config(config.client_config())
        .pki(Arc::new(config.pki_provider()))
        .credentials(Arc::new(StaticCredentials::new().with_user("operator", "secret")))
        .build();
    (runtime, engine)
}

#[tokio::test]
async fn test_file_connections_register_and_connect() {
    let config = load_config_str(&ConfigFileFixtures::yaml(), ConfigFormat::Yaml).unwrap();
    assert_eq!(config.logging.level, LogLevel::Debug);
    assert_eq!(config.logging.format, LogFormat::Text);

    let (runtime, engine) = runtime_for(&config);
    assert_eq!(runtime.config().max_connections, 8);
    assert_eq!(runtime.config().application_uri, "urn:uaflow:tests");

    let ids = register_connections(&runtime, &config).assert_ok();
    let names: Vec<&str> = ids.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["line-1", "line-2"]);
    assert_eq!(runtime.config_count(), 2);
    assert_eq!(runtime.config_by_user_id("line-2"), Some(ids[1].1));

    let line_2 = runtime.connection_config(ids[1].1).assert_ok();
    assert_eq!(line_2.endpoint_url, EndpointFixtures::secondary());
    assert_eq!(
        line_2.user_identity,
        UserIdentity::UserName {
            username: "operator".to_string()
        }
    );

    let first = runtime.connect(ids[0].1).await.assert_ok();
    let second = runtime.connect(ids[1].1).await.assert_ok();
    assert_ne!(first, second);
    assert_eq!(engine.session_count(), 2);

    let subscription = runtime
        .create_subscription(second, line_2.subscription, |_| {}, 0)
        .await
        .assert_ok();
    let revised = subscription.revised_parameters().assert_ok();
    assert_eq!(revised.publishing_interval, Duration::from_millis(100));
    assert_eq!(revised.max_keep_alive_count, 10);

    runtime.clear().await.assert_ok();
    assert_eq!(engine.session_count(), 0);
}

#[tokio::test]
async fn test_secured_file_resolves_pki_paths() {
    let dir = tempfile::tempdir().unwrap();
    let pki = PkiFixtures::write(&dir.path().join("pki")).unwrap();
    let path = dir.path().join("uaflow.yaml");
    std::fs::write(&path, ConfigFileFixtures::secured_yaml("pki")).unwrap();

    let config = ConfigLoader::new().load(&path).unwrap();
    let entry = config.connection("secure").unwrap();
    assert_eq!(entry.security_mode, SecurityMode::SignAndEncrypt);
    assert_eq!(entry.security_policy, SecurityPolicy::Basic256Sha256);
    assert_eq!(entry.client_certificate.as_deref(), Some(pki.client_certificate.as_path()));
    assert_eq!(entry.server_certificate.as_deref(), Some(pki.server_certificate.as_path()));

    let (runtime, engine) = runtime_for(&config);
    let ids = register_connections(&runtime, &config).assert_ok();
    let handle = runtime.connect(ids[0].1).await.assert_ok();
    runtime.connection_state(handle).assert_ok().assert_activated();
    assert_eq!(engine.activations(), 1);

    runtime.clear().await.assert_ok();
}

#[tokio::test]
async fn test_file_capacity_exceeds_runtime() {
    let config = load_config_str(&ConfigFileFixtures::yaml(), ConfigFormat::Yaml).unwrap();
    let (runtime, _engine) = TestRuntimeBuilder::new().max_connections(1).build();

    register_connections(&runtime, &config).assert_status(Status::OutOfMemory);
    assert_eq!(runtime.config_count(), 1);
    runtime.clear().await.assert_ok();
}

#[test]
fn test_invalid_file_maps_to_invalid_parameters() {
    let yaml = r#"
connections:
  - id: line-1
    endpoint_url: "opc.tcp://localhost:4840"
  - id: line-1
    endpoint_url: "opc.tcp://localhost:4841"
"#;
    let err = load_config_str(yaml, ConfigFormat::Yaml).unwrap_err();
    assert!(matches!(err, ConfigError::DuplicateConnectionId { .. }));

    let client: ClientError = err.into();
    assert_eq!(client.status(), Status::InvalidParameters);
}

#[test]
fn test_incoherent_security_maps_through() {
    let yaml = r#"
connections:
  - id: plc
    endpoint_url: "opc.tcp://localhost:4840"
    security_mode: sign
    security_policy: none
"#;
    let err = load_config_str(yaml, ConfigFormat::Yaml).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidConnection { .. }));

    let client: ClientError = err.into();
    assert_eq!(client.status(), Status::InvalidParameters);
    assert_eq!(client.category(), "configuration");
}
