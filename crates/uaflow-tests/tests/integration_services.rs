// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Service Integration Tests
//!
//! Integration tests for service requests on activated sessions including:
//!
//! - Generic synchronous and asynchronous requests
//! - Read, Write and Browse helpers
//! - Send failures and the in-flight request bound
//!
//! ## Test Categories
//!
//! - `test_service_*`: Generic request paths
//! - `test_read_*`, `test_write_*`, `test_browse_*`: Typed helpers

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use uaflow_client::message::{ReadRequest, RepublishRequest, WriteRequest};
use uaflow_client::{
    ConnectionHandle, DataValue, NodeId, Request, Response, ServiceKind, ServiceOutcome, Status,
    StatusCode, UserContext, Variant,
};
use uaflow_tests::prelude::*;

const WAIT: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(10);

type Outcomes = Arc<Mutex<Vec<(ServiceKind, ServiceOutcome, UserContext)>>>;

fn record_async(runtime: &uaflow_client::ClientRuntime) -> Outcomes {
    let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    runtime
        .set_service_async_response(
            move |_: ConnectionHandle, service: ServiceKind, outcome: ServiceOutcome, context: UserContext| {
                sink.lock().push((service, outcome, context));
            },
        )
        .assert_ok();
    outcomes
}

fn read_request(nodes: &[NodeId]) -> Request {
    Request::Read(ReadRequest {
        nodes_to_read: ServiceFixtures::read_targets(nodes),
        ..Default::default()
    })
}

// =============================================================================
// Generic requests
// =============================================================================

#[tokio::test]
async fn test_service_sync_read() {
    TestHarness::with_name("service_sync")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            let response = res
                .runtime
                .service_sync(handle, read_request(&[SimNodes::temperature()]))
                .await
                .assert_ok();
            let Response::Read(read) = response else {
                panic!("Expected Read response, got {:?}", response.kind());
            };
            assert!(read.service_result.is_good());
            read.results[0].assert_approx(21.5, 1e-9);

            let stats = res.runtime.stats(handle).assert_ok();
            assert_eq!(stats.requests_sent(), 1);
            assert_eq!(stats.responses_received(), 1);
            assert_eq!(res.runtime.connection_info(handle).assert_ok().pending_requests, 0);
        })
        .await;
}

#[tokio::test]
async fn test_service_fault_is_returned_as_response() {
    TestHarness::with_name("service_fault")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            let response = res
                .runtime
                .service_sync(
                    handle,
                    Request::Republish(RepublishRequest {
                        subscription_id: 1,
                        retransmit_sequence_number: 1,
                    }),
                )
                .await
                .assert_ok();
            assert_eq!(response, Response::ServiceFault(StatusCode::BAD_SERVICE_UNSUPPORTED));
            assert!(response.is_fault());
        })
        .await;
}

#[tokio::test]
async fn test_service_send_failure() {
    TestHarness::with_name("send_failure")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();
            res.engine.fail_requests(StatusCode::BAD_TIMEOUT);

            res.runtime
                .service_sync(handle, read_request(&[SimNodes::temperature()]))
                .await
                .assert_status_code(Status::Nok, StatusCode::BAD_TIMEOUT);
            assert_eq!(res.runtime.connection_info(handle).assert_ok().pending_requests, 0);

            // The connection itself stays usable.
            res.runtime.connection_state(handle).assert_ok().assert_activated();
        })
        .await;
}

#[tokio::test]
async fn test_service_rejects_stale_handle() {
    TestHarness::with_name("stale_handle")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();
            res.runtime.disconnect(handle).await.assert_ok();

            res.runtime
                .service_sync(handle, read_request(&[SimNodes::temperature()]))
                .await
                .assert_status(Status::InvalidState);
            assert_eq!(res.engine.received_count(ServiceKind::Read), 0);
        })
        .await;
}

#[tokio::test]
async fn test_service_async_delivers_outcome() {
    TestHarness::with_name("service_async")
        .run(|res| async move {
            let outcomes = record_async(&res.runtime);
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            res.runtime
                .service_async(handle, read_request(&[SimNodes::setpoint()]), 41)
                .assert_ok();
            res.runtime
                .service_async(handle, read_request(&[SimNodes::device_name()]), 42)
                .assert_ok();

            wait_for_or_panic(WAIT, POLL, "two async outcomes", || outcomes.lock().len() == 2).await;

            let outcomes = outcomes.lock();
            let contexts: Vec<UserContext> = outcomes.iter().map(|(_, _, c)| *c).collect();
            assert_eq!(contexts, vec![41, 42]);
            for (service, outcome, _) in outcomes.iter() {
                assert_eq!(*service, ServiceKind::Read);
                assert!(matches!(outcome, Ok(Response::Read(_))));
            }
        })
        .await;
}

#[tokio::test]
async fn test_service_async_failure_reaches_callback() {
    TestHarness::with_name("service_async_failure")
        .run(|res| async move {
            let outcomes = record_async(&res.runtime);
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();
            res.engine.fail_requests(StatusCode::BAD_SECURE_CHANNEL_CLOSED);

            res.runtime
                .service_async(handle, read_request(&[SimNodes::setpoint()]), 7)
                .assert_ok();
            wait_for_or_panic(WAIT, POLL, "async failure", || !outcomes.lock().is_empty()).await;

            let (service, outcome, context) = outcomes.lock()[0].clone();
            assert_eq!(service, ServiceKind::Read);
            assert_eq!(outcome, Err(StatusCode::BAD_SECURE_CHANNEL_CLOSED));
            assert_eq!(context, 7);
        })
        .await;
}

#[tokio::test]
async fn test_service_async_callback_rules() {
    TestHarness::with_name("async_callback_rules")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            // No callback registered yet.
            res.runtime
                .service_async(handle, read_request(&[SimNodes::setpoint()]), 1)
                .assert_status(Status::InvalidState);

            record_async(&res.runtime);
            res.runtime
                .set_service_async_response(|_, _, _, _| {})
                .assert_status(Status::InvalidState);
        })
        .await;
}

#[tokio::test]
async fn test_service_pending_request_bound() {
    let (runtime, engine) = TestRuntimeBuilder::new().max_pending_requests(4).build();
    let outcomes = record_async(&runtime);
    let config = runtime
        .add_connection_config(ConnectionFixtures::anonymous())
        .assert_ok();
    let handle = runtime.connect(config).await.assert_ok();

    engine.stall();
    for context in 0..4 {
        runtime
            .service_async(handle, read_request(&[SimNodes::temperature()]), context)
            .assert_ok();
    }
    runtime
        .service_async(handle, read_request(&[SimNodes::temperature()]), 99)
        .assert_status(Status::OutOfMemory);
    assert_eq!(runtime.connection_info(handle).assert_ok().pending_requests, 4);

    engine.resume();
    wait_for_or_panic(WAIT, POLL, "held requests answered", || outcomes.lock().len() == 4).await;
    wait_for_or_panic(WAIT, POLL, "pending count drained", || {
        runtime
            .connection_info(handle)
            .map(|info| info.pending_requests == 0)
            .unwrap_or(false)
    })
    .await;

    runtime
        .service_async(handle, read_request(&[SimNodes::temperature()]), 5)
        .assert_ok();
    runtime.clear().await.assert_ok();
}

// =============================================================================
// Read
// =============================================================================

#[tokio::test]
async fn test_read_known_nodes() {
    TestHarness::with_name("read_known")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            let values = res
                .runtime
                .read(handle, &ServiceFixtures::known_nodes())
                .await
                .assert_ok();
            assert_eq!(values.len(), 3);
            values[0].assert_approx(21.5, 1e-9);
            values[1].assert_value(&Variant::String("press-01".to_string()));
            values[2].assert_value(&Variant::Int32(0));
            assert!(values.iter().all(|v| v.server_timestamp.is_some()));
        })
        .await;
}

#[tokio::test]
async fn test_read_unknown_node_is_per_value_status() {
    TestHarness::with_name("read_unknown")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            let values = res
                .runtime
                .read(handle, &[NodeId::numeric(7, 9999), SimNodes::temperature()])
                .await
                .assert_ok();
            values[0].assert_bad(StatusCode::BAD_NODE_ID_UNKNOWN);
            values[1].assert_good();
        })
        .await;
}

#[tokio::test]
async fn test_read_follows_device_updates() {
    TestHarness::with_name("read_updates")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            res.engine.set_value(&SimNodes::temperature(), Variant::Double(80.25));
            let values = res
                .runtime
                .read(handle, &[SimNodes::temperature()])
                .await
                .assert_ok();
            values[0].assert_approx(80.25, 1e-9);
            assert!(values[0].source_timestamp.is_some());
        })
        .await;
}

// =============================================================================
// Write
// =============================================================================

#[tokio::test]
async fn test_write_then_read_back() {
    TestHarness::with_name("write_read_back")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            let results = res
                .runtime
                .write(
                    handle,
                    vec![
                        (SimNodes::setpoint(), DataValue::new(Variant::Int32(1500))),
                        (SimNodes::running(), DataValue::new(Variant::Boolean(true))),
                    ],
                )
                .await
                .assert_ok();
            assert_eq!(results, vec![StatusCode::GOOD, StatusCode::GOOD]);

            let values = res
                .runtime
                .read(handle, &[SimNodes::setpoint(), SimNodes::running()])
                .await
                .assert_ok();
            values[0].assert_value(&Variant::Int32(1500));
            values[1].assert_value(&Variant::Boolean(true));
            assert_eq!(
                res.engine.value(&SimNodes::setpoint()).map(|v| v.value),
                Some(Variant::Int32(1500))
            );
        })
        .await;
}

#[tokio::test]
async fn test_write_per_node_failures() {
    TestHarness::with_name("write_failures")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            let results = res
                .runtime
                .write(
                    handle,
                    vec![
                        (SimNodes::temperature(), DataValue::new(Variant::Double(0.0))),
                        (NodeId::string(3, "Missing"), DataValue::new(Variant::Int32(1))),
                    ],
                )
                .await
                .assert_ok();
            assert_eq!(
                results,
                vec![StatusCode::BAD_NOT_WRITABLE, StatusCode::BAD_NODE_ID_UNKNOWN]
            );
        })
        .await;
}

#[tokio::test]
async fn test_write_generic_request() {
    TestHarness::with_name("write_generic")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            let response = res
                .runtime
                .service_sync(
                    handle,
                    Request::Write(WriteRequest {
                        nodes_to_write: vec![ServiceFixtures::write_value(
                            SimNodes::setpoint(),
                            Variant::Int32(-3),
                        )],
                    }),
                )
                .await
                .assert_ok();
            assert_eq!(response.kind(), ServiceKind::Write);
            assert!(!response.is_fault());
        })
        .await;
}

// =============================================================================
// Browse
// =============================================================================

#[tokio::test]
async fn test_browse_objects_folder() {
    TestHarness::with_name("browse")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            let references = res
                .runtime
                .browse(handle, SimNodes::objects_folder())
                .await
                .assert_ok();
            let names: Vec<&str> = references.iter().map(|r| r.browse_name.as_str()).collect();
            assert_eq!(names[0], "Server");
            assert!(names.contains(&"Temperature"));
            assert!(names.contains(&"Setpoint"));
            assert!(references.iter().all(|r| r.is_forward));
        })
        .await;
}

#[tokio::test]
async fn test_browse_unknown_node_is_fault() {
    TestHarness::with_name("browse_unknown")
        .run(|res| async move {
            let (_, handle) = res.connect(ConnectionFixtures::anonymous()).await.assert_ok();

            res.runtime
                .browse(handle, NodeId::numeric(9, 1))
                .await
                .assert_status_code(Status::Nok, StatusCode::BAD_NODE_ID_UNKNOWN);

            let leaf = res
                .runtime
                .browse(handle, SimNodes::temperature())
                .await
                .assert_ok();
            assert!(leaf.is_empty());
        })
        .await;
}
