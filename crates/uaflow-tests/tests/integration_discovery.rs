// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Discovery Integration Tests
//!
//! Integration tests for session-less discovery requests including:
//!
//! - GetEndpoints and FindServers
//! - Discovery-only connections and their promotion by `connect`
//! - Asynchronous discovery requests

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use uaflow_client::message::{FindServersRequest, GetEndpointsRequest, ReadRequest};
use uaflow_client::{
    ConnectionState, Request, Response, SecurityMode, SecurityPolicy, ServiceKind, Status,
};
use uaflow_tests::prelude::*;

const WAIT: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(10);

fn find_servers(server_uris: Vec<String>) -> Request {
    Request::FindServers(FindServersRequest {
        endpoint_url: EndpointFixtures::server().to_string(),
        server_uris,
    })
}

#[tokio::test]
async fn test_get_endpoints_without_session() {
    TestHarness::with_name("get_endpoints")
        .run(|res| async move {
            let config = res
                .runtime
                .add_connection_config(ConnectionFixtures::anonymous())
                .assert_ok();

            let endpoints = res.runtime.get_endpoints(config).await.assert_ok();
            assert_eq!(endpoints.len(), 2);
            assert!(endpoints
                .iter()
                .all(|e| e.endpoint_url == EndpointFixtures::server()));
            assert!(endpoints.iter().any(|e| e.security_mode == SecurityMode::None));
            let secured = endpoints
                .iter()
                .find(|e| e.security_mode == SecurityMode::SignAndEncrypt)
                .expect("secured endpoint");
            assert_eq!(
                secured.security_policy_uri,
                SecurityPolicy::Basic256Sha256.uri()
            );
            assert_eq!(
                secured.server_certificate.as_deref(),
                Some(res.engine.server_certificate().der.as_slice())
            );

            // A discovery-only connection carries the request; no session.
            assert_eq!(res.runtime.connection_count(), 1);
            let handle = res.runtime.connections()[0];
            let info = res.runtime.connection_info(handle).assert_ok();
            assert!(info.discovery_only);
            assert_eq!(info.session, None);
            assert_eq!(res.engine.session_count(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_discovery_connection_is_reused() {
    TestHarness::with_name("discovery_reuse")
        .run(|res| async move {
            let config = res
                .runtime
                .add_connection_config(ConnectionFixtures::anonymous())
                .assert_ok();

            res.runtime.get_endpoints(config).await.assert_ok();
            res.runtime.get_endpoints(config).await.assert_ok();

            assert_eq!(res.runtime.connection_count(), 1);
            assert_eq!(res.engine.channel_count(), 1);
            assert_eq!(res.engine.received_count(ServiceKind::GetEndpoints), 2);
        })
        .await;
}

#[tokio::test]
async fn test_connect_promotes_discovery_connection() {
    TestHarness::with_name("discovery_promote")
        .run(|res| async move {
            let config = res
                .runtime
                .add_connection_config(ConnectionFixtures::anonymous())
                .assert_ok();
            res.runtime.get_endpoints(config).await.assert_ok();
            let discovery = res.runtime.connections()[0];

            let handle = res.runtime.connect(config).await.assert_ok();
            assert_eq!(handle, discovery);
            assert_eq!(res.runtime.connection_count(), 1);

            let info = res.runtime.connection_info(handle).assert_ok();
            assert!(!info.discovery_only);
            info.state.assert_activated();

            // The promoted connection still serves discovery requests.
            res.runtime.get_endpoints(config).await.assert_ok();
            res.runtime
                .read(handle, &[SimNodes::temperature()])
                .await
                .assert_ok();

            res.runtime
                .connect(config)
                .await
                .assert_status(Status::InvalidState);
        })
        .await;
}

#[tokio::test]
async fn test_discovery_connection_rejects_session_services() {
    TestHarness::with_name("discovery_session_services")
        .run(|res| async move {
            let config = res
                .runtime
                .add_connection_config(ConnectionFixtures::anonymous())
                .assert_ok();
            res.runtime.get_endpoints(config).await.assert_ok();
            let handle = res.runtime.connections()[0];

            res.runtime
                .service_sync(handle, Request::Read(ReadRequest::default()))
                .await
                .assert_status(Status::InvalidState);

            res.runtime.disconnect(handle).await.assert_ok();
            assert_eq!(res.runtime.connection_count(), 0);
            res.runtime
                .connection_state(handle)
                .assert_status(Status::InvalidState);
        })
        .await;
}

#[tokio::test]
async fn test_find_servers_filters_by_uri() {
    TestHarness::with_name("find_servers")
        .run(|res| async move {
            let config = res
                .runtime
                .add_connection_config(ConnectionFixtures::anonymous())
                .assert_ok();
            let application_uri = res.config.server.application_uri.clone();

            let response = res
                .runtime
                .discovery_service_sync(config, find_servers(vec![application_uri.clone()]))
                .await
                .assert_ok();
            let Response::FindServers(found) = response else {
                panic!("Expected FindServers response");
            };
            assert_eq!(found.servers.len(), 1);
            assert_eq!(found.servers[0].application_uri, application_uri);
            assert_eq!(
                found.servers[0].discovery_urls,
                vec![EndpointFixtures::server().to_string()]
            );

            let response = res
                .runtime
                .discovery_service_sync(config, find_servers(vec!["urn:elsewhere".to_string()]))
                .await
                .assert_ok();
            let Response::FindServers(found) = response else {
                panic!("Expected FindServers response");
            };
            assert!(found.servers.is_empty());
        })
        .await;
}

#[tokio::test]
async fn test_discovery_rejects_session_request() {
    TestHarness::with_name("discovery_invalid")
        .run(|res| async move {
            let config = res
                .runtime
                .add_connection_config(ConnectionFixtures::anonymous())
                .assert_ok();

            res.runtime
                .discovery_service_sync(config, Request::Read(ReadRequest::default()))
                .await
                .assert_status(Status::InvalidParameters);
            assert_eq!(res.runtime.connection_count(), 0);
        })
        .await;
}

#[tokio::test]
async fn test_discovery_async() {
    TestHarness::with_name("discovery_async")
        .run(|res| async move {
            let outcomes = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&outcomes);
            res.runtime
                .set_service_async_response(move |_, service, outcome, context| {
                    sink.lock().push((service, outcome.is_ok(), context));
                })
                .assert_ok();
            let config = res
                .runtime
                .add_connection_config(ConnectionFixtures::anonymous())
                .assert_ok();

            res.runtime
                .discovery_service_async(
                    config,
                    Request::GetEndpoints(GetEndpointsRequest {
                        endpoint_url: EndpointFixtures::server().to_string(),
                    }),
                    314,
                )
                .await
                .assert_ok();

            wait_for_or_panic(WAIT, POLL, "discovery outcome", || !outcomes.lock().is_empty()).await;
            assert_eq!(outcomes.lock()[0], (ServiceKind::GetEndpoints, true, 314));
        })
        .await;
}

#[tokio::test]
async fn test_discovery_async_requires_callback() {
    TestHarness::with_name("discovery_async_no_callback")
        .run(|res| async move {
            let config = res
                .runtime
                .add_connection_config(ConnectionFixtures::anonymous())
                .assert_ok();

            res.runtime
                .discovery_service_async(config, find_servers(Vec::new()), 1)
                .await
                .assert_status(Status::InvalidState);
        })
        .await;
}

#[tokio::test]
async fn test_discovery_after_disconnect() {
    TestHarness::with_name("discovery_after_disconnect")
        .run(|res| async move {
            let config = res
                .runtime
                .add_connection_config(ConnectionFixtures::anonymous())
                .assert_ok();
            let handle = res.runtime.connect(config).await.assert_ok();
            res.runtime.disconnect(handle).await.assert_ok();

            // Disconnecting does not unregister the configuration.
            res.runtime.get_endpoints(config).await.assert_ok();
            assert_eq!(
                res.runtime.connection_state(res.runtime.connections()[0]).assert_ok(),
                ConnectionState::Idle
            );
        })
        .await;
}
