// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Routes engine events to connections and request contexts.
//!
//! Routing happens under the registry lock. Application callbacks collected
//! along the way run after the lock is released, in event order.

use super::registry::{ConnectionEntry, Registry};
use super::request::{Deferred, RequestContext, ServiceOutcome};
use super::state_machine::ConnectionNotice;
use super::{ConnectionHandle, Shared};
use crate::engine::{ContextScope, EngineContext, EngineEvent, ProtocolEngine};

/// Entry point for [`EventSink::deliver`](crate::engine::EventSink::deliver).
pub(crate) fn on_engine_event(shared: &Shared, event: EngineEvent) {
    tracing::trace!(event = event.name(), "Engine event");
    let mut deferred: Vec<Deferred> = Vec::new();
    let mut reverse_closed = false;
    {
        let mut registry = shared.registry.lock();
        let engine = shared.engine.as_ref();

        match event {
            EngineEvent::SessionResponse { context, response }
            | EngineEvent::DiscoveryResponse { context, response } => {
                complete(&mut registry, engine, context, Ok(response), &mut deferred);
            }
            EngineEvent::SendRequestFailed { context, status } => {
                tracing::debug!(connection = %context.connection, service = %context.service, %status, "Request failed");
                complete(&mut registry, engine, context, Err(status), &mut deferred);
            }
            EngineEvent::ChannelOpened { connection } => {
                if let Ok(entry) = registry.connection_mut(connection) {
                    entry.machine.on_channel_opened();
                }
            }
            EngineEvent::SessionCreated { connection } => {
                if let Ok(entry) = registry.connection_mut(connection) {
                    entry.machine.on_session_created();
                }
            }
            EngineEvent::SessionActivated {
                connection,
                session,
            } => {
                lifecycle(&mut registry, connection, &mut deferred, |machine| {
                    machine.on_activated(engine, session)
                });
            }
            EngineEvent::SessionActivationFailure { connection, status } => {
                lifecycle(&mut registry, connection, &mut deferred, |machine| {
                    machine.on_activation_failure(status)
                });
            }
            EngineEvent::SessionReactivating { connection } => {
                lifecycle(&mut registry, connection, &mut deferred, |machine| {
                    machine.on_reactivating()
                });
            }
            EngineEvent::SessionClosed { connection, status } => {
                lifecycle(&mut registry, connection, &mut deferred, |machine| {
                    machine.on_closed(status)
                });
            }
            EngineEvent::ReverseEndpointClosed { endpoint } => {
                if registry.on_reverse_endpoint_closed(endpoint) {
                    tracing::info!(%endpoint, "Reverse endpoint closed");
                }
                reverse_closed = true;
            }
        }
    }

    if reverse_closed {
        shared.reverse_closed.notify_waiters();
    }
    for callback in deferred {
        callback();
    }
}

/// Consumes a request context with its outcome.
fn complete(
    registry: &mut Registry,
    engine: &dyn ProtocolEngine,
    context: EngineContext,
    outcome: ServiceOutcome,
    deferred: &mut Vec<Deferred>,
) {
    let EngineContext {
        connection,
        service,
        scope,
    } = context;
    if let ContextScope::Publish = scope {
        let Ok(entry) = registry.connection_mut(connection) else {
            return;
        };
        let notice = match outcome {
            Ok(response) => {
                let (notification, notice) = entry.machine.on_publish_response(engine, response);
                deferred.extend(notification);
                notice
            }
            Err(status) => entry.machine.on_publish_failed(engine, status),
        };
        if let Some(notice) = notice {
            notify(entry, connection, notice, deferred);
        }
        return;
    }

    let machine = registry.connection_mut(connection).ok().map(|entry| &mut entry.machine);
    match scope {
        ContextScope::Publish => {}
        ContextScope::Application(RequestContext::NoSync { operation }) => match machine {
            Some(machine) => machine.complete_operation(engine, operation, outcome),
            None => tracing::debug!(%connection, %service, "Internal response for removed connection"),
        },
        ContextScope::Application(request) => {
            if let Some(machine) = machine {
                machine.on_request_done(outcome.is_ok());
            }
            deferred.extend(request.complete(connection, service, outcome));
        }
        ContextScope::Discovery(request) => {
            if let Some(machine) = machine {
                machine.on_discovery_done(outcome.is_ok());
            }
            deferred.extend(request.complete(connection, service, outcome));
        }
    }
}

/// Applies a lifecycle event and queues the connection callback if the
/// machine yields a notice.
fn lifecycle<F>(
    registry: &mut Registry,
    connection: ConnectionHandle,
    deferred: &mut Vec<Deferred>,
    apply: F,
) where
    F: FnOnce(&mut super::state_machine::StateMachine) -> Option<ConnectionNotice>,
{
    let Ok(entry) = registry.connection_mut(connection) else {
        tracing::debug!(%connection, "Lifecycle event for unknown connection");
        return;
    };
    if let Some(notice) = apply(&mut entry.machine) {
        notify(entry, connection, notice, deferred);
    }
}

/// Queues the connection callback for a notice.
fn notify(
    entry: &ConnectionEntry,
    connection: ConnectionHandle,
    notice: ConnectionNotice,
    deferred: &mut Vec<Deferred>,
) {
    tracing::debug!(%connection, event = %notice.event, status = %notice.status, "Connection event");
    if let Some(callback) = entry.event_callback.clone() {
        deferred.push(Box::new(move || callback(connection, notice.event, notice.status)));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::client::testing::RecordingEngine;
    use crate::client::{ClientRuntime, ConnectionEvent, ConnectionState};
    use crate::config::{ConnectionConfig, SubscriptionParams};
    use crate::engine::{EngineContext, EngineEvent, SessionId};
    use crate::message::{
        CreateSubscriptionResponse, PublishResponse, ReadResponse, Response, ServiceKind,
    };
    use crate::types::StatusCode;

    async fn connected() -> (ClientRuntime, Arc<RecordingEngine>, crate::client::ConnectionHandle) {
        let engine = Arc::new(RecordingEngine::default());
        let runtime = ClientRuntime::new(engine.clone());
        let id = runtime
            .add_connection_config(ConnectionConfig::new("opc.tcp://localhost:4841"))
            .unwrap();

        let sink = engine.sink().unwrap();
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.connect(id).await }
        });
        while engine.activations().is_empty() {
            tokio::task::yield_now().await;
        }
        let handle = engine.activations()[0];
        sink.deliver(EngineEvent::SessionActivated {
            connection: handle,
            session: SessionId(1),
        });
        assert_eq!(task.await.unwrap().unwrap(), handle);
        (runtime, engine, handle)
    }

    #[tokio::test]
    async fn test_sync_response_routed_to_waiter() {
        let (runtime, engine, handle) = connected().await;
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move {
                runtime
                    .service_sync(handle, crate::message::Request::Read(Default::default()))
                    .await
            }
        });
        let (request, context) = loop {
            if let Some(sent) = engine.take_sent().pop() {
                break sent;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(request.kind(), crate::message::ServiceKind::Read);
        engine.sink().unwrap().deliver(EngineEvent::SessionResponse {
            context,
            response: Response::Read(ReadResponse::default()),
        });
        let response = task.await.unwrap().unwrap();
        assert_eq!(response.kind(), crate::message::ServiceKind::Read);
        assert_eq!(runtime.stats(handle).unwrap().responses_received(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_close_reports_disconnected() {
        let engine = Arc::new(RecordingEngine::default());
        let runtime = ClientRuntime::new(engine.clone());
        let id = runtime
            .add_connection_config(ConnectionConfig::new("opc.tcp://localhost:4841"))
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();

        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move {
                runtime
                    .connect_with_callback(id, move |_, event, status| {
                        sink_events.lock().push((event, status));
                    })
                    .await
            }
        });
        while engine.activations().is_empty() {
            tokio::task::yield_now().await;
        }
        let handle = engine.activations()[0];
        let sink = engine.sink().unwrap();
        sink.deliver(EngineEvent::SessionActivated {
            connection: handle,
            session: SessionId(4),
        });
        task.await.unwrap().unwrap();
        assert!(events.lock().is_empty());

        sink.deliver(EngineEvent::SessionReactivating { connection: handle });
        sink.deliver(EngineEvent::SessionClosed {
            connection: handle,
            status: StatusCode::BAD_SECURE_CHANNEL_CLOSED,
        });
        assert_eq!(
            *events.lock(),
            vec![
                (ConnectionEvent::Disconnected, StatusCode::BAD_WOULD_BLOCK),
                (ConnectionEvent::Disconnected, StatusCode::BAD_SECURE_CHANNEL_CLOSED),
            ]
        );
        assert_eq!(runtime.connection_state(handle).unwrap(), ConnectionState::Error);
    }

    async fn subscribed(
        runtime: &ClientRuntime,
        engine: &RecordingEngine,
        handle: crate::client::ConnectionHandle,
    ) -> Vec<EngineContext> {
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move {
                runtime
                    .create_subscription(handle, SubscriptionParams::default(), |_| {}, 0)
                    .await
            }
        });
        let context = loop {
            if let Some((_, context)) = engine.take_sent().pop() {
                break context;
            }
            tokio::task::yield_now().await;
        };
        engine.sink().unwrap().deliver(EngineEvent::SessionResponse {
            context,
            response: Response::CreateSubscription(CreateSubscriptionResponse {
                service_result: StatusCode::GOOD,
                subscription_id: 21,
                revised_publishing_interval: Duration::from_millis(500),
                revised_lifetime_count: 10,
                revised_max_keep_alive_count: 3,
            }),
        });
        task.await.unwrap().unwrap();
        engine.take_sent().into_iter().map(|(_, context)| context).collect()
    }

    #[tokio::test]
    async fn test_failed_publish_is_rearmed() {
        let (runtime, engine, handle) = connected().await;
        let mut tokens = subscribed(&runtime, &engine, handle).await;
        assert_eq!(tokens.len(), 3);

        let sink = engine.sink().unwrap();
        sink.deliver(EngineEvent::SendRequestFailed {
            context: tokens.remove(0),
            status: StatusCode::BAD_TIMEOUT,
        });

        let sent = engine.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.kind(), ServiceKind::Publish);
        assert_eq!(runtime.stats(handle).unwrap().publish_requests(), 4);
        assert_eq!(runtime.connection_state(handle).unwrap(), ConnectionState::Activated);
    }

    #[tokio::test]
    async fn test_publish_without_server_subscription_reports_error() {
        let (runtime, engine, handle) = connected().await;
        let mut tokens = subscribed(&runtime, &engine, handle).await;

        engine.sink().unwrap().deliver(EngineEvent::SessionResponse {
            context: tokens.remove(0),
            response: Response::Publish(PublishResponse {
                service_result: StatusCode::BAD_NO_SUBSCRIPTION,
                subscription_id: 0,
                more_notifications: false,
                notification_message: Default::default(),
            }),
        });

        assert!(engine.take_sent().is_empty());
        let info = runtime.connection_info(handle).unwrap();
        assert_eq!(info.state, ConnectionState::Error);
        assert_eq!(info.last_status, StatusCode::BAD_NO_SUBSCRIPTION);
        assert_eq!(info.subscription_id, None);
    }

    #[tokio::test]
    async fn test_events_for_stale_handle_are_ignored() {
        let (runtime, engine, handle) = connected().await;
        let stale = crate::client::ConnectionHandle::new(handle.config().index(), handle.generation() + 1);
        engine.sink().unwrap().deliver(EngineEvent::SessionClosed {
            connection: stale,
            status: StatusCode::BAD,
        });
        assert_eq!(runtime.connection_state(handle).unwrap(), ConnectionState::Activated);
    }
}
