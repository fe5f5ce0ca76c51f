// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client runtime.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ClientRuntime                         │
//! │  connect / disconnect / service_* / create_subscription      │
//! │                            │                                 │
//! │                 Mutex<Registry> (global lock)                │
//! │   ┌─────────────┬──────────┴───────┬──────────────────┐      │
//! │   │ ConfigSlot  │ ConfigSlot       │ reverse endpoints│      │
//! │   │ StateMachine│ StateMachine     │                  │      │
//! │   └─────────────┴──────────────────┴──────────────────┘      │
//! │                            ▲                                 │
//! │                dispatch::on_engine_event                     │
//! └────────────────────────────┼─────────────────────────────────┘
//!                              │ EventSink::deliver
//!                       ProtocolEngine thread
//! ```
//!
//! Callers await a [`completion`] waiter without holding the lock; the
//! dispatcher settles it from the engine's thread.

mod completion;
mod connection;
pub(crate) mod dispatch;
mod registry;
mod request;
mod state_machine;
mod subscription;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub use registry::{ConfigId, ConnectionHandle};
pub(crate) use request::RequestContext;
pub use request::{ServiceOutcome, ServiceResponseCallback, UserContext};
pub use state_machine::{ConnectionEvent, ConnectionInfo, ConnectionState, ConnectionStats};
pub use subscription::{
    DataChange, NotificationCallback, RevisedParameters, Subscription, SubscriptionNotification,
};

use crate::config::{
    ClientConfig, ConnectionConfig, CredentialProvider, FilePkiProvider, NoCredentials, PkiProvider,
};
use crate::engine::{EventSink, ProtocolEngine};
use crate::error::{ClientError, ClientResult};
use crate::message::ServiceKind;
use crate::types::StatusCode;
use registry::{Registry, RuntimeState};

/// Receives unsolicited connection events. Runs outside the registry lock.
pub type ConnectionEventCallback =
    Arc<dyn Fn(ConnectionHandle, ConnectionEvent, StatusCode) + Send + Sync>;

// =============================================================================
// Shared state
// =============================================================================

/// State shared between the runtime handles and the engine's event sink.
pub(crate) struct Shared {
    pub(crate) engine: Arc<dyn ProtocolEngine>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) reverse_closed: Notify,
    pub(crate) config: ClientConfig,
    pub(crate) pki: Arc<dyn PkiProvider>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
}

// =============================================================================
// ClientRuntime
// =============================================================================

/// Entry point of the client: owns all connections over one engine.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct ClientRuntime {
    pub(crate) shared: Arc<Shared>,
}

impl ClientRuntime {
    /// Creates a runtime with default settings, file-based PKI and no
    /// credential source.
    pub fn new(engine: Arc<dyn ProtocolEngine>) -> Self {
        Self::builder(engine).build()
    }

    /// Starts building a runtime.
    pub fn builder(engine: Arc<dyn ProtocolEngine>) -> ClientRuntimeBuilder {
        ClientRuntimeBuilder {
            engine,
            config: ClientConfig::default(),
            pki: None,
            credentials: None,
        }
    }

    /// Runtime-wide settings.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Returns `true` until [`clear`](Self::clear) starts.
    pub fn is_running(&self) -> bool {
        self.shared.registry.lock().state() == RuntimeState::Running
    }

    /// Registers a connection configuration.
    ///
    /// The configuration is validated now and finalized on first use.
    pub fn add_connection_config(&self, config: ConnectionConfig) -> ClientResult<ConfigId> {
        config.validate()?;
        let mut registry = self.shared.registry.lock();
        registry.ensure_running()?;
        let endpoint = config.endpoint_url.clone();
        let id = registry.add_config(config)?;
        tracing::debug!(config = %id, %endpoint, "Connection configuration added");
        Ok(id)
    }

    /// Returns a registered configuration.
    pub fn connection_config(&self, id: ConfigId) -> ClientResult<ConnectionConfig> {
        let registry = self.shared.registry.lock();
        registry.config(id).map(|config| (*config).clone())
    }

    /// Finds a configuration by its user-defined id.
    pub fn config_by_user_id(&self, user_id: &str) -> Option<ConfigId> {
        self.shared.registry.lock().find_by_user_id(user_id)
    }

    /// Number of registered configurations.
    pub fn config_count(&self) -> usize {
        self.shared.registry.lock().config_count()
    }

    /// Registers the callback receiving all asynchronous service responses.
    /// Can be set once.
    pub fn set_service_async_response<F>(&self, callback: F) -> ClientResult<()>
    where
        F: Fn(ConnectionHandle, ServiceKind, ServiceOutcome, UserContext) + Send + Sync + 'static,
    {
        let mut registry = self.shared.registry.lock();
        registry.ensure_running()?;
        registry.set_async_response(Arc::new(callback))
    }

    /// Current state of a connection.
    pub fn connection_state(&self, handle: ConnectionHandle) -> ClientResult<ConnectionState> {
        let registry = self.shared.registry.lock();
        registry.connection(handle).map(|entry| entry.machine.state())
    }

    /// Snapshot of a connection.
    pub fn connection_info(&self, handle: ConnectionHandle) -> ClientResult<ConnectionInfo> {
        let registry = self.shared.registry.lock();
        registry.connection(handle).map(|entry| entry.machine.info())
    }

    /// Counters of a connection.
    pub fn stats(&self, handle: ConnectionHandle) -> ClientResult<Arc<ConnectionStats>> {
        let registry = self.shared.registry.lock();
        registry.connection(handle).map(|entry| entry.machine.stats())
    }

    /// Live connections, discovery-only ones included.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.shared.registry.lock().connection_handles()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.lock().connection_count()
    }

    /// Disconnects everything, closes reverse endpoints and stops accepting
    /// operations.
    ///
    /// Waiting for reverse endpoints is bounded by
    /// [`ClientConfig::teardown_timeout`]. Calling `clear` again is a no-op.
    pub async fn clear(&self) -> ClientResult<()> {
        {
            let mut registry = self.shared.registry.lock();
            match registry.state() {
                RuntimeState::Running => registry.set_state(RuntimeState::Clearing),
                RuntimeState::Clearing => return Err(ClientError::not_initialized()),
                RuntimeState::Cleared => return Ok(()),
            }
        }
        tracing::info!("Clearing client runtime");

        let handles = self.connections();
        for handle in handles {
            if let Err(err) = self.disconnect_inner(handle).await {
                err.log("clear");
                self.force_remove(handle);
            }
        }

        self.close_reverse_endpoints().await;

        let mut registry = self.shared.registry.lock();
        self.shared.engine.clear_channels();
        registry.clear_channels();
        registry.set_state(RuntimeState::Cleared);
        tracing::info!("Client runtime cleared");
        Ok(())
    }

    async fn close_reverse_endpoints(&self) {
        let closing = {
            let mut registry = self.shared.registry.lock();
            let ids = registry.begin_close_reverse_endpoints();
            for id in &ids {
                self.shared.engine.close_reverse_endpoint(*id);
            }
            ids
        };
        if closing.is_empty() {
            return;
        }

        let all_closed = async {
            loop {
                let notified = self.shared.reverse_closed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let remaining = self.shared.registry.lock().reverse_endpoint_count();
                if remaining == 0 {
                    break;
                }
                notified.await;
            }
        };

        let timeout = self.shared.config.teardown_timeout;
        if tokio::time::timeout(timeout, all_closed).await.is_err() {
            tracing::warn!(?timeout, count = closing.len(), "Reverse endpoints did not close in time");
            self.shared.registry.lock().drop_reverse_endpoints();
        }
    }
}

impl fmt::Debug for ClientRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRuntime")
            .field("registry", &*self.shared.registry.lock())
            .finish()
    }
}

// =============================================================================
// ClientRuntimeBuilder
// =============================================================================

/// Builder for [`ClientRuntime`].
pub struct ClientRuntimeBuilder {
    engine: Arc<dyn ProtocolEngine>,
    config: ClientConfig,
    pki: Option<Arc<dyn PkiProvider>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl ClientRuntimeBuilder {
    /// Sets runtime-wide settings.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the certificate and key loader.
    pub fn pki(mut self, pki: Arc<dyn PkiProvider>) -> Self {
        self.pki = Some(pki);
        self
    }

    /// Sets the password source.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Creates the runtime and attaches it to the engine.
    pub fn build(self) -> ClientRuntime {
        let shared = Arc::new(Shared {
            engine: self.engine,
            registry: Mutex::new(Registry::new(self.config.max_connections)),
            reverse_closed: Notify::new(),
            pki: self
                .pki
                .unwrap_or_else(|| Arc::new(FilePkiProvider::new())),
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(NoCredentials)),
            config: self.config,
        });
        shared.engine.attach(EventSink::new(Arc::downgrade(&shared)));
        tracing::debug!(
            max_connections = shared.config.max_connections,
            application_uri = %shared.config.application_uri,
            "Client runtime created"
        );
        ClientRuntime { shared }
    }
}

impl fmt::Debug for ClientRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRuntimeBuilder")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingEngine;
    use super::*;
    use crate::error::Status;

    fn runtime(max_connections: usize) -> (ClientRuntime, Arc<RecordingEngine>) {
        let engine = Arc::new(RecordingEngine::default());
        let runtime = ClientRuntime::builder(engine.clone())
            .config(ClientConfig {
                max_connections,
                ..Default::default()
            })
            .build();
        (runtime, engine)
    }

    #[test]
    fn test_runtime_attaches_sink() {
        let (runtime, engine) = runtime(4);
        let sink = engine.sink().unwrap();
        assert!(sink.is_connected());
        drop(runtime);
        assert!(!sink.is_connected());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (runtime, _) = runtime(4);
        let err = runtime
            .add_connection_config(ConnectionConfig::new("http://localhost"))
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameters);
        assert_eq!(runtime.config_count(), 0);
    }

    #[test]
    fn test_config_capacity_is_out_of_memory() {
        let (runtime, _) = runtime(1);
        runtime
            .add_connection_config(ConnectionConfig::new("opc.tcp://a:4840"))
            .unwrap();
        let err = runtime
            .add_connection_config(ConnectionConfig::new("opc.tcp://b:4840"))
            .unwrap_err();
        assert_eq!(err.status(), Status::OutOfMemory);
    }

    #[test]
    fn test_async_response_callback_set_once() {
        let (runtime, _) = runtime(1);
        runtime.set_service_async_response(|_, _, _, _| {}).unwrap();
        let err = runtime.set_service_async_response(|_, _, _, _| {}).unwrap_err();
        assert_eq!(err.status(), Status::InvalidState);
    }

    #[tokio::test]
    async fn test_clear_inhibits_operations() {
        let (runtime, _) = runtime(4);
        runtime.clear().await.unwrap();
        assert!(!runtime.is_running());
        let err = runtime
            .add_connection_config(ConnectionConfig::new("opc.tcp://a:4840"))
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidState);
        runtime.clear().await.unwrap();
    }
}
