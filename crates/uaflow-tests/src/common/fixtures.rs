// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Test Fixtures
//!
//! Pre-built test data for consistent and reproducible testing.
//!
//! ## Design Principles
//!
//! - Fixtures are immutable and thread-safe
//! - Each fixture represents a realistic scenario
//! - Key material is written to a caller-owned directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use uaflow_client::message::{MonitoredItemCreateRequest, ReadValueId, WriteValue};
use uaflow_client::{
    AttributeId, ConnectionConfig, DataValue, NodeId, SecurityMode, SecurityPolicy,
    SubscriptionParams, Variant,
};

use super::mocks::{SimNodes, SimServerConfig};

// =============================================================================
// Endpoint Fixtures
// =============================================================================

/// Endpoint URLs used across tests.
pub struct EndpointFixtures;

impl EndpointFixtures {
    /// The simulated server's endpoint.
    pub fn server() -> &'static str {
        "opc.tcp://localhost:4840"
    }

    /// A second server endpoint.
    pub fn secondary() -> &'static str {
        "opc.tcp://localhost:4841/line2"
    }

    /// A reverse connection listening URL.
    pub fn reverse() -> &'static str {
        "opc.tcp://0.0.0.0:4843"
    }

    /// `count` distinct endpoints.
    pub fn batch(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| format!("opc.tcp://plc-{:03}.local:4840", i))
            .collect()
    }
}

// =============================================================================
// Connection Fixtures
// =============================================================================

/// Ready-made connection configurations.
pub struct ConnectionFixtures;

impl ConnectionFixtures {
    /// Anonymous, unsecured connection with short timeouts.
    pub fn anonymous() -> ConnectionConfig {
        ConnectionConfig {
            request_timeout: Duration::from_secs(2),
            session_timeout: Duration::from_secs(5),
            ..ConnectionConfig::new(EndpointFixtures::server())
        }
    }

    /// Anonymous connection to another endpoint.
    pub fn anonymous_to(endpoint: impl Into<String>) -> ConnectionConfig {
        ConnectionConfig {
            endpoint_url: endpoint.into(),
            ..Self::anonymous()
        }
    }

    /// User name connection for the simulated `operator` account.
    pub fn operator() -> ConnectionConfig {
        let mut config = Self::anonymous();
        config.user_identity = uaflow_client::UserIdentity::UserName {
            username: "operator".to_string(),
        };
        config
    }

    /// Signed and encrypted connection using the files in `pki`.
    pub fn secured(pki: &PkiFiles) -> ConnectionConfig {
        ConnectionConfig {
            security_mode: SecurityMode::SignAndEncrypt,
            security_policy: SecurityPolicy::Basic256Sha256,
            client_certificate_path: Some(pki.client_certificate.clone()),
            client_private_key_path: Some(pki.client_key.clone()),
            server_certificate_path: Some(pki.server_certificate.clone()),
            ..Self::anonymous()
        }
    }

    /// Like [`secured`](Self::secured) but pinning the wrong server
    /// certificate.
    pub fn secured_wrong_pin(pki: &PkiFiles) -> ConnectionConfig {
        ConnectionConfig {
            server_certificate_path: Some(pki.foreign_certificate.clone()),
            ..Self::secured(pki)
        }
    }

    /// Anonymous connection that waits for the server to connect back.
    pub fn reverse() -> ConnectionConfig {
        ConnectionConfig {
            reverse_url: Some(EndpointFixtures::reverse().to_string()),
            ..Self::anonymous()
        }
    }
}

// =============================================================================
// Subscription Fixtures
// =============================================================================

/// Subscription parameters.
pub struct SubscriptionFixtures;

impl SubscriptionFixtures {
    /// Fast publishing for tests.
    pub fn fast() -> SubscriptionParams {
        SubscriptionParams {
            publishing_interval: Duration::from_millis(100),
            lifetime_count: 30,
            max_keep_alive_count: 10,
            publish_tokens: 2,
            ..Default::default()
        }
    }

    /// Requests an interval below the simulated server minimum.
    pub fn too_fast() -> SubscriptionParams {
        SubscriptionParams {
            publishing_interval: Duration::from_millis(10),
            ..Self::fast()
        }
    }

    /// Monitored item requests for the writable nodes.
    pub fn writable_items() -> Vec<MonitoredItemCreateRequest> {
        vec![
            MonitoredItemCreateRequest::value(SimNodes::setpoint()),
            MonitoredItemCreateRequest::value(SimNodes::running()),
        ]
    }
}

// =============================================================================
// Service Fixtures
// =============================================================================

/// Service payloads.
pub struct ServiceFixtures;

impl ServiceFixtures {
    /// Nodes with known values in the simulated address space.
    pub fn known_nodes() -> Vec<NodeId> {
        vec![
            SimNodes::temperature(),
            SimNodes::device_name(),
            SimNodes::setpoint(),
        ]
    }

    /// Read targets on the Value attribute.
    pub fn read_targets(nodes: &[NodeId]) -> Vec<ReadValueId> {
        nodes.iter().cloned().map(ReadValueId::value).collect()
    }

    /// A Value write.
    pub fn write_value(node: NodeId, value: Variant) -> WriteValue {
        WriteValue {
            node_id: node,
            attribute_id: AttributeId::Value,
            value: DataValue::new(value),
        }
    }
}

// =============================================================================
// PKI Fixtures
// =============================================================================

/// Paths of key material written by [`PkiFixtures::write`].
#[derive(Debug, Clone)]
pub struct PkiFiles {
    /// Directory holding every file.
    pub dir: PathBuf,
    /// Client application certificate (PEM).
    pub client_certificate: PathBuf,
    /// Client application key (PEM).
    pub client_key: PathBuf,
    /// Client key, password protected (PEM).
    pub encrypted_key: PathBuf,
    /// Certificate the simulated server presents (DER).
    pub server_certificate: PathBuf,
    /// A certificate the simulated server does not present (PEM).
    pub foreign_certificate: PathBuf,
}

/// Writes certificate and key files.
pub struct PkiFixtures;

impl PkiFixtures {
    /// Password of [`PkiFiles::encrypted_key`].
    pub const KEY_PASSWORD: &'static str = "key-secret";

    /// Writes all files into `dir`.
    pub fn write(dir: &Path) -> std::io::Result<PkiFiles> {
        std::fs::create_dir_all(dir)?;
        let server = SimServerConfig::default().certificate_der;

        let files = PkiFiles {
            dir: dir.to_path_buf(),
            client_certificate: dir.join("client_cert.pem"),
            client_key: dir.join("client_key.pem"),
            encrypted_key: dir.join("client_key_enc.pem"),
            server_certificate: dir.join("server_cert.der"),
            foreign_certificate: dir.join("foreign_cert.pem"),
        };
        std::fs::write(&files.client_certificate, pem("CERTIFICATE", b"uaflow-test-client"))?;
        std::fs::write(&files.client_key, pem("PRIVATE KEY", b"uaflow-test-key"))?;
        std::fs::write(
            &files.encrypted_key,
            pem("ENCRYPTED PRIVATE KEY", b"uaflow-test-encrypted-key"),
        )?;
        std::fs::write(&files.server_certificate, server)?;
        std::fs::write(&files.foreign_certificate, pem("CERTIFICATE", b"some-other-server"))?;
        Ok(files)
    }
}

/// Encodes `der` as a PEM block.
pub fn pem(label: &str, der: &[u8]) -> String {
    let body = BASE64.encode(der);
    let mut out = format!("-----BEGIN {}-----\n", label);
    for chunk in body.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {}-----\n", label));
    out
}

// =============================================================================
// Configuration File Fixtures
// =============================================================================

/// Configuration file contents.
pub struct ConfigFileFixtures;

impl ConfigFileFixtures {
    /// Two connections: one anonymous, one operator with a fast subscription.
    pub fn yaml() -> String {
        format!(
            r#"
client:
  application_uri: urn:uaflow:tests
  application_name: uaflow tests
  max_connections: 8
connections:
  - id: line-1
    endpoint_url: "{server}"
    request_timeout: 2s
    session_timeout: 5s
  - id: line-2
    endpoint_url: "{secondary}"
    user_identity:
      type: user_name
      username: operator
    request_timeout: 2s
    subscription:
      publishing_interval: 100ms
      lifetime_count: 30
      max_keep_alive_count: 10
logging:
  level: debug
  format: text
"#,
            server = EndpointFixtures::server(),
            secondary = EndpointFixtures::secondary(),
        )
    }

    /// A secured connection whose certificate paths are relative to `pki_dir`.
    pub fn secured_yaml(pki_dir: &str) -> String {
        format!(
            r#"
client:
  pki_dir: {pki_dir}
connections:
  - id: secure
    endpoint_url: "{server}"
    security_mode: sign_and_encrypt
    security_policy: basic256_sha256
    client_certificate: client_cert.pem
    client_private_key: client_key.pem
    server_certificate: server_cert.der
    request_timeout: 2s
"#,
            pki_dir = pki_dir,
            server = EndpointFixtures::server(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pem_wraps_lines() {
        let text = pem("CERTIFICATE", &[0u8; 100]);
        assert!(text.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(text.lines().all(|line| line.len() <= 64 || line.starts_with("-----")));
    }

    #[test]
    fn test_pki_files_written() {
        let dir = tempfile::tempdir().unwrap();
        let files = PkiFixtures::write(dir.path()).unwrap();
        assert!(files.client_certificate.exists());
        assert_eq!(
            std::fs::read(&files.server_certificate).unwrap(),
            SimServerConfig::default().certificate_der
        );
    }

    #[test]
    fn test_fixture_configs_validate() {
        ConnectionFixtures::anonymous().validate().unwrap();
        ConnectionFixtures::operator().validate().unwrap();
        SubscriptionFixtures::fast().validate().unwrap();
    }
}
