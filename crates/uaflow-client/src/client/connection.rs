// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Connection lifecycle and generic service calls.

use std::sync::Arc;

use super::request::{wait_finished, RequestContext, UserContext};
use super::state_machine::{ConnectionState, StateMachine};
use super::{ClientRuntime, ConfigId, ConnectionEvent, ConnectionEventCallback, ConnectionHandle};
use crate::config::FinalizedConnection;
use crate::error::{ClientError, ClientResult, ConnectionError};
use crate::message::{Request, Response};
use crate::types::StatusCode;

impl ClientRuntime {
    // =========================================================================
    // Connect / disconnect
    // =========================================================================

    /// Connects using a registered configuration and waits until the session
    /// is activated.
    ///
    /// Fails with `INVALID_STATE` if the configuration already has a live
    /// connection, and with `CLOSED` if activation fails. A discovery-only
    /// connection for the same configuration is promoted.
    ///
    /// The wait is bounded by `request_timeout + session_timeout`. When it
    /// expires first the connection is released and the call fails with
    /// `CLOSED` / `BadTimeout`; see [`ProtocolEngine::activate_session`]
    /// for the engine's side of that contract.
    ///
    /// [`ProtocolEngine::activate_session`]: crate::engine::ProtocolEngine::activate_session
    pub async fn connect(&self, config: ConfigId) -> ClientResult<ConnectionHandle> {
        self.connect_inner(config, None).await
    }

    /// Like [`connect`](Self::connect), and registers a callback for later
    /// unsolicited connection events.
    pub async fn connect_with_callback<F>(
        &self,
        config: ConfigId,
        callback: F,
    ) -> ClientResult<ConnectionHandle>
    where
        F: Fn(ConnectionHandle, ConnectionEvent, StatusCode) + Send + Sync + 'static,
    {
        self.connect_inner(config, Some(Arc::new(callback))).await
    }

    async fn connect_inner(
        &self,
        config: ConfigId,
        callback: Option<ConnectionEventCallback>,
    ) -> ClientResult<ConnectionHandle> {
        {
            let registry = self.shared.registry.lock();
            registry.ensure_running()?;
            registry.config(config)?;
            if let Some(handle) = registry.connection_of(config) {
                let machine = &registry.connection(handle)?.machine;
                if !machine.is_discovery_only() {
                    return Err(already_connected(machine));
                }
            }
        }

        let finalized = self.finalize_config(config).await?;
        let engine = self.shared.engine.as_ref();

        let (handle, waiter, timeout) = {
            let mut registry = self.shared.registry.lock();
            registry.ensure_running()?;

            let handle = match registry.connection_of(config) {
                Some(handle) => {
                    if !registry.connection(handle)?.machine.is_discovery_only() {
                        return Err(already_connected(&registry.connection(handle)?.machine));
                    }
                    let reverse = match &finalized.reverse_url {
                        Some(url) => Some(registry.ensure_reverse_endpoint(url, engine)?),
                        None => None,
                    };
                    let entry = registry.connection_mut(handle)?;
                    entry.machine.promote(reverse);
                    entry.event_callback = callback;
                    tracing::debug!(%handle, "Promoting discovery connection");
                    handle
                }
                None => {
                    let channel = registry.ensure_channel(config, &finalized, engine)?;
                    let reverse = match &finalized.reverse_url {
                        Some(url) => Some(registry.ensure_reverse_endpoint(url, engine)?),
                        None => None,
                    };
                    let handle = registry.next_handle(config)?;
                    let machine = StateMachine::new(
                        handle,
                        Arc::clone(&finalized),
                        channel,
                        reverse,
                        self.shared.config.max_pending_requests,
                    );
                    registry.insert_connection(config, machine, callback)?
                }
            };

            let machine = &mut registry.connection_mut(handle)?.machine;
            let timeout = machine.request_timeout() + finalized.session_timeout;
            match machine.start_session(engine) {
                Ok(waiter) => (handle, waiter, timeout),
                Err(err) => {
                    registry.remove_connection(handle);
                    return Err(err);
                }
            }
        };

        tracing::info!(%handle, endpoint = %finalized.endpoint_url, "Connecting");
        let outcome = waiter.wait_timeout(timeout).await;

        let mut registry = self.shared.registry.lock();
        let (state, status) = match registry.connection(handle) {
            Ok(entry) => (entry.machine.state(), entry.machine.last_status()),
            Err(_) => {
                return Err(ClientError::closed(
                    finalized.endpoint_url.clone(),
                    StatusCode::BAD_CONNECTION_CLOSED,
                ))
            }
        };

        match outcome {
            Ok(ConnectionState::Activated) => {
                tracing::info!(%handle, endpoint = %finalized.endpoint_url, "Connected");
                Ok(handle)
            }
            other => {
                if other.is_err() && state.is_connecting() {
                    tracing::warn!(
                        %handle,
                        %state,
                        ?timeout,
                        "Engine did not report the activation in time; a late session will not be closed"
                    );
                }
                let status = match other {
                    Err(_) if status.is_good() => StatusCode::BAD_TIMEOUT,
                    _ => status,
                };
                if let Ok(entry) = registry.connection_mut(handle) {
                    if state.has_session() || state.is_connecting() {
                        entry.machine.set_error(engine, status);
                    }
                }
                registry.remove_connection(handle);
                let err = ClientError::closed(finalized.endpoint_url.clone(), status);
                err.log("connect");
                Err(err)
            }
        }
    }

    /// Closes the session and releases the connection. The handle is stale
    /// afterwards.
    ///
    /// If the engine refuses to close the session the call fails with `NOK`
    /// and the connection is kept, so the caller can try again.
    pub async fn disconnect(&self, handle: ConnectionHandle) -> ClientResult<()> {
        self.shared.registry.lock().ensure_running()?;
        self.disconnect_inner(handle).await
    }

    pub(crate) async fn disconnect_inner(&self, handle: ConnectionHandle) -> ClientResult<()> {
        let engine = self.shared.engine.as_ref();
        let pending = {
            let mut registry = self.shared.registry.lock();
            let machine = &mut registry.connection_mut(handle)?.machine;
            if machine.sync_in_progress() {
                return Err(ConnectionError::SyncInProgress {
                    endpoint: machine.endpoint().to_string(),
                }
                .into());
            }
            if machine.state().has_session() {
                // A refused close leaves the connection in place for a retry.
                match machine.stop_session(engine) {
                    Ok(waiter) => Some((waiter, machine.request_timeout())),
                    Err(err) => {
                        err.log("disconnect");
                        return Err(err);
                    }
                }
            } else {
                None
            }
        };

        if let Some((waiter, timeout)) = pending {
            match waiter.wait_timeout(timeout).await {
                Ok(state) => tracing::debug!(%handle, %state, "Session close finished"),
                Err(reason) => tracing::warn!(%handle, ?reason, "Session close not confirmed"),
            }
        }

        let removed = self.shared.registry.lock().remove_connection(handle);
        match removed {
            Some(entry) => {
                tracing::info!(%handle, endpoint = %entry.machine.endpoint(), "Disconnected");
                Ok(())
            }
            None => Err(ClientError::invalid_handle(handle)),
        }
    }

    /// Drops a connection without waiting for the engine.
    pub(crate) fn force_remove(&self, handle: ConnectionHandle) {
        let engine = self.shared.engine.as_ref();
        let mut registry = self.shared.registry.lock();
        if let Ok(entry) = registry.connection_mut(handle) {
            entry.machine.set_error(engine, StatusCode::BAD_CONNECTION_CLOSED);
        }
        registry.remove_connection(handle);
    }

    /// Puts a connection in error after a bounded wait expired.
    pub(crate) fn fail_connection(&self, handle: ConnectionHandle, status: StatusCode) {
        let engine = self.shared.engine.as_ref();
        let mut registry = self.shared.registry.lock();
        if let Ok(entry) = registry.connection_mut(handle) {
            entry.machine.set_error(engine, status);
        }
    }

    /// Returns the finalized configuration, finalizing it on first use.
    async fn finalize_config(&self, config: ConfigId) -> ClientResult<Arc<FinalizedConnection>> {
        let (source, existing) = {
            let registry = self.shared.registry.lock();
            registry.ensure_running()?;
            (registry.config(config)?, registry.finalized(config)?)
        };
        if let Some(finalized) = existing {
            return Ok(finalized);
        }

        let finalized = source
            .finalize(self.shared.pki.as_ref(), self.shared.credentials.as_ref())
            .await?;
        tracing::debug!(%config, endpoint = %finalized.endpoint_url, "Configuration finalized");

        self.shared
            .registry
            .lock()
            .store_finalized(config, Arc::new(finalized))
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Sends a request on an activated session and waits for the response.
    ///
    /// Once the connection manages a subscription, subscription-scoped
    /// requests are rejected here; use [`Subscription`](super::Subscription).
    pub async fn service_sync(&self, handle: ConnectionHandle, request: Request) -> ClientResult<Response> {
        let service = request.kind();
        let (context, waiter) = RequestContext::sync();
        self.send_generic(handle, request, context)?;
        wait_finished(waiter, service).await
    }

    /// Sends a request; the outcome goes to the callback registered with
    /// [`set_service_async_response`](Self::set_service_async_response).
    pub fn service_async(
        &self,
        handle: ConnectionHandle,
        request: Request,
        user_context: UserContext,
    ) -> ClientResult<()> {
        let callback = self.shared.registry.lock().async_response()?;
        self.send_generic(
            handle,
            request,
            RequestContext::asynchronous(callback, user_context),
        )
    }

    fn send_generic(
        &self,
        handle: ConnectionHandle,
        request: Request,
        context: RequestContext,
    ) -> ClientResult<()> {
        let mut registry = self.shared.registry.lock();
        registry.ensure_running()?;
        let machine = &mut registry.connection_mut(handle)?.machine;
        machine.check_generic_request(&request)?;
        machine.send_request(self.shared.engine.as_ref(), request, context)
    }

    /// Sends a session-less discovery request and waits for the response.
    ///
    /// Uses the configuration's connection if one exists, otherwise creates
    /// a discovery-only connection.
    pub async fn discovery_service_sync(&self, config: ConfigId, request: Request) -> ClientResult<Response> {
        let service = request.kind();
        let (context, waiter) = RequestContext::sync();
        self.send_discovery(config, request, context).await?;
        wait_finished(waiter, service).await
    }

    /// Sends a discovery request; the outcome goes to the async response
    /// callback.
    pub async fn discovery_service_async(
        &self,
        config: ConfigId,
        request: Request,
        user_context: UserContext,
    ) -> ClientResult<()> {
        let callback = self.shared.registry.lock().async_response()?;
        self.send_discovery(
            config,
            request,
            RequestContext::asynchronous(callback, user_context),
        )
        .await
    }

    async fn send_discovery(
        &self,
        config: ConfigId,
        request: Request,
        context: RequestContext,
    ) -> ClientResult<()> {
        if !request.kind().is_discovery() {
            return Err(ClientError::invalid_request(format!(
                "{} is not a discovery service",
                request.kind()
            )));
        }
        let finalized = self.finalize_config(config).await?;
        let engine = self.shared.engine.as_ref();

        let mut registry = self.shared.registry.lock();
        registry.ensure_running()?;
        let handle = match registry.connection_of(config) {
            Some(handle) => handle,
            None => {
                let channel = registry.ensure_channel(config, &finalized, engine)?;
                let handle = registry.next_handle(config)?;
                let machine = StateMachine::discovery(
                    handle,
                    finalized,
                    channel,
                    self.shared.config.max_pending_requests,
                );
                tracing::debug!(%handle, "Discovery connection created");
                registry.insert_connection(config, machine, None)?
            }
        };
        registry
            .connection_mut(handle)?
            .machine
            .send_discovery(engine, request, context)
    }
}

fn already_connected(machine: &StateMachine) -> ClientError {
    ConnectionError::AlreadyConnected {
        endpoint: machine.endpoint().to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::client::testing::RecordingEngine;
    use crate::client::{ClientRuntime, ConnectionState};
    use crate::config::ConnectionConfig;
    use crate::engine::{EngineEvent, SessionId};
    use crate::error::Status;
    use crate::message::{GetEndpointsRequest, ReadRequest, Request, ServiceKind};
    use crate::types::StatusCode;

    fn setup() -> (ClientRuntime, Arc<RecordingEngine>, crate::client::ConfigId) {
        let engine = Arc::new(RecordingEngine::default());
        let runtime = ClientRuntime::new(engine.clone());
        let config = ConnectionConfig::builder()
            .endpoint("opc.tcp://localhost:4841")
            .request_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let id = runtime.add_connection_config(config).unwrap();
        (runtime, engine, id)
    }

    async fn wait_for_activation(engine: &RecordingEngine, count: usize) -> crate::client::ConnectionHandle {
        loop {
            let activations = engine.activations();
            if activations.len() >= count {
                return activations[count - 1];
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_activation_failure_returns_closed_and_frees_slot() {
        let (runtime, engine, id) = setup();
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.connect(id).await }
        });
        let handle = wait_for_activation(&engine, 1).await;
        engine.sink().unwrap().deliver(EngineEvent::SessionActivationFailure {
            connection: handle,
            status: StatusCode::BAD_CERTIFICATE_INVALID,
        });

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.status(), Status::Closed);
        assert_eq!(err.status_code(), Some(StatusCode::BAD_CERTIFICATE_INVALID));
        assert_eq!(runtime.connection_count(), 0);
        assert!(runtime.connection_state(handle).is_err());
    }

    #[tokio::test]
    async fn test_connect_times_out_without_engine_report() {
        let engine = Arc::new(RecordingEngine::default());
        let runtime = ClientRuntime::new(engine.clone());
        let config = ConnectionConfig::builder()
            .endpoint("opc.tcp://localhost:4841")
            .request_timeout(Duration::from_millis(20))
            .session_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let id = runtime.add_connection_config(config).unwrap();

        let err = runtime.connect(id).await.unwrap_err();
        assert_eq!(err.status(), Status::Closed);
        assert_eq!(err.status_code(), Some(StatusCode::BAD_TIMEOUT));
        assert_eq!(runtime.connection_count(), 0);

        // A late activation for the released handle is dropped.
        let handle = engine.activations()[0];
        engine.sink().unwrap().deliver(EngineEvent::SessionActivated {
            connection: handle,
            session: SessionId(8),
        });
        assert_eq!(runtime.connection_count(), 0);
        assert!(runtime.connection_state(handle).is_err());
    }

    #[tokio::test]
    async fn test_second_connect_is_invalid_state() {
        let (runtime, engine, id) = setup();
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.connect(id).await }
        });
        let handle = wait_for_activation(&engine, 1).await;

        let err = runtime.connect(id).await.unwrap_err();
        assert_eq!(err.status(), Status::InvalidState);

        engine.sink().unwrap().deliver(EngineEvent::SessionActivated {
            connection: handle,
            session: SessionId(1),
        });
        assert_eq!(task.await.unwrap().unwrap(), handle);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_close() {
        let (runtime, engine, id) = setup();
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.connect(id).await }
        });
        let handle = wait_for_activation(&engine, 1).await;
        let sink = engine.sink().unwrap();
        sink.deliver(EngineEvent::SessionActivated {
            connection: handle,
            session: SessionId(2),
        });
        task.await.unwrap().unwrap();

        let disconnect = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.disconnect(handle).await }
        });
        while engine.closed_sessions().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime.connection_state(handle).unwrap(), ConnectionState::Closing);
        let err = runtime.disconnect(handle).await.unwrap_err();
        assert_eq!(err.status(), Status::InvalidState);

        sink.deliver(EngineEvent::SessionClosed {
            connection: handle,
            status: StatusCode::GOOD,
        });
        disconnect.await.unwrap().unwrap();

        let err = runtime.disconnect(handle).await.unwrap_err();
        assert_eq!(err.status(), Status::InvalidState);
    }

    #[tokio::test]
    async fn test_disconnect_reports_refused_close() {
        let (runtime, engine, id) = setup();
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.connect(id).await }
        });
        let handle = wait_for_activation(&engine, 1).await;
        let sink = engine.sink().unwrap();
        sink.deliver(EngineEvent::SessionActivated {
            connection: handle,
            session: SessionId(3),
        });
        task.await.unwrap().unwrap();

        engine.fail_close(Some(StatusCode::BAD_SECURE_CHANNEL_CLOSED));
        let err = runtime.disconnect(handle).await.unwrap_err();
        assert_eq!(err.status(), Status::Nok);
        assert_eq!(err.status_code(), Some(StatusCode::BAD_SECURE_CHANNEL_CLOSED));
        assert_eq!(runtime.connection_count(), 1);
        assert_eq!(runtime.connection_state(handle).unwrap(), ConnectionState::Activated);
        assert!(engine.closed_sessions().is_empty());

        engine.fail_close(None);
        let disconnect = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.disconnect(handle).await }
        });
        while engine.closed_sessions().is_empty() {
            tokio::task::yield_now().await;
        }
        sink.deliver(EngineEvent::SessionClosed {
            connection: handle,
            status: StatusCode::GOOD,
        });
        disconnect.await.unwrap().unwrap();
        assert_eq!(engine.closed_sessions(), vec![SessionId(3)]);
        assert_eq!(runtime.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_releases_connection_with_refused_close() {
        let (runtime, engine, id) = setup();
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.connect(id).await }
        });
        let handle = wait_for_activation(&engine, 1).await;
        engine.sink().unwrap().deliver(EngineEvent::SessionActivated {
            connection: handle,
            session: SessionId(5),
        });
        task.await.unwrap().unwrap();

        engine.fail_close(Some(StatusCode::BAD_INTERNAL_ERROR));
        runtime.clear().await.unwrap();
        assert_eq!(runtime.connection_count(), 0);
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn test_service_requires_activated_session() {
        let (runtime, engine, id) = setup();
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.connect(id).await }
        });
        let handle = wait_for_activation(&engine, 1).await;
        let err = runtime
            .service_sync(handle, Request::Read(ReadRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidState);
        task.abort();
    }

    #[tokio::test]
    async fn test_service_async_requires_callback() {
        let (runtime, engine, id) = setup();
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.connect(id).await }
        });
        let handle = wait_for_activation(&engine, 1).await;
        engine.sink().unwrap().deliver(EngineEvent::SessionActivated {
            connection: handle,
            session: SessionId(1),
        });
        task.await.unwrap().unwrap();

        let err = runtime
            .service_async(handle, Request::Read(ReadRequest::default()), 1)
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidState);
    }

    #[tokio::test]
    async fn test_discovery_creates_discovery_connection() {
        let (runtime, engine, id) = setup();
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move {
                runtime
                    .discovery_service_sync(
                        id,
                        Request::GetEndpoints(GetEndpointsRequest {
                            endpoint_url: "opc.tcp://localhost:4841".into(),
                        }),
                    )
                    .await
            }
        });
        let (request, context) = loop {
            if let Some(sent) = engine.take_sent().pop() {
                break sent;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(request.kind(), ServiceKind::GetEndpoints);
        assert!(context.is_discovery());
        engine.sink().unwrap().deliver(EngineEvent::DiscoveryResponse {
            context,
            response: crate::message::Response::GetEndpoints(Default::default()),
        });
        task.await.unwrap().unwrap();

        let handle = runtime.connections()[0];
        let info = runtime.connection_info(handle).unwrap();
        assert!(info.discovery_only);
        assert_eq!(info.state, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_discovery_rejects_session_services() {
        let (runtime, _, id) = setup();
        let err = runtime
            .discovery_service_sync(id, Request::Read(ReadRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameters);
    }
}
