// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Boundary between the client runtime and the protocol engine.
//!
//! The engine owns secure channels, sessions and the wire. The runtime owns
//! connection bookkeeping. They meet here:
//!
//! ```text
//!  ClientRuntime ──── ProtocolEngine::{activate_session, send_*} ───▶ engine
//!       ▲                                                               │
//!       └──────────────── EventSink::deliver(EngineEvent) ◀─────────────┘
//! ```
//!
//! Every request carries an [`EngineContext`]. The engine hands the context
//! back, by value, in exactly one event: a response or a send failure. The
//! runtime consumes it there. The engine never calls back into the sink from
//! inside a `ProtocolEngine` method; events are delivered from the engine's
//! own thread.

use std::fmt;
use std::sync::Weak;

use serde::{Deserialize, Serialize};

use crate::client::{dispatch, ConnectionHandle, RequestContext, Shared};
use crate::config::{FinalizedConnection, ResolvedIdentity};
use crate::message::{Request, Response, ServiceKind};
use crate::types::StatusCode;

// =============================================================================
// Identifiers
// =============================================================================

macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

engine_id!(
    /// Engine-side id of a registered channel configuration.
    ChannelConfigId,
    "channel-"
);

engine_id!(
    /// Engine-side id of a reverse connection listener.
    ReverseEndpointId,
    "reverse-"
);

engine_id!(
    /// Engine-side id of an activated session.
    SessionId,
    "session-"
);

// =============================================================================
// EngineContext
// =============================================================================

/// Opaque per-request context, handed to the engine and returned with the
/// matching event.
///
/// Move-only. The runtime consumes it when the event arrives; dropping it
/// instead abandons the request and wakes any synchronous waiter.
pub struct EngineContext {
    pub(crate) connection: ConnectionHandle,
    pub(crate) service: ServiceKind,
    pub(crate) scope: ContextScope,
}

/// Who is waiting on a request.
pub(crate) enum ContextScope {
    /// Session request issued by the application or a subscription operation.
    Application(RequestContext),
    /// Session-less discovery request.
    Discovery(RequestContext),
    /// Publish token owned by the subscription manager.
    Publish,
}

impl EngineContext {
    pub(crate) fn application(
        connection: ConnectionHandle,
        service: ServiceKind,
        context: RequestContext,
    ) -> Self {
        Self {
            connection,
            service,
            scope: ContextScope::Application(context),
        }
    }

    pub(crate) fn discovery(
        connection: ConnectionHandle,
        service: ServiceKind,
        context: RequestContext,
    ) -> Self {
        Self {
            connection,
            service,
            scope: ContextScope::Discovery(context),
        }
    }

    pub(crate) fn publish(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            service: ServiceKind::Publish,
            scope: ContextScope::Publish,
        }
    }

    /// Connection the request was issued on.
    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    /// Service of the request.
    pub fn service(&self) -> ServiceKind {
        self.service
    }

    /// Returns `true` for session-less discovery requests.
    pub fn is_discovery(&self) -> bool {
        matches!(self.scope, ContextScope::Discovery(_))
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match &self.scope {
            ContextScope::Application(ctx) => ctx.kind_name(),
            ContextScope::Discovery(_) => "discovery",
            ContextScope::Publish => "publish",
        };
        f.debug_struct("EngineContext")
            .field("connection", &self.connection)
            .field("service", &self.service)
            .field("scope", &scope)
            .finish()
    }
}

// =============================================================================
// EngineEvent
// =============================================================================

/// Events raised by the engine.
#[derive(Debug)]
pub enum EngineEvent {
    /// Response to a session request.
    SessionResponse {
        /// Context passed with the request.
        context: EngineContext,
        /// The response.
        response: Response,
    },

    /// Response to a discovery request.
    DiscoveryResponse {
        /// Context passed with the request.
        context: EngineContext,
        /// The response.
        response: Response,
    },

    /// A request could not be delivered or timed out.
    SendRequestFailed {
        /// Context passed with the request.
        context: EngineContext,
        /// Failure status.
        status: StatusCode,
    },

    /// The secure channel of a connection is open.
    ChannelOpened {
        /// Connection.
        connection: ConnectionHandle,
    },

    /// The session was created and is being activated.
    SessionCreated {
        /// Connection.
        connection: ConnectionHandle,
    },

    /// The session is activated.
    SessionActivated {
        /// Connection.
        connection: ConnectionHandle,
        /// Engine session id.
        session: SessionId,
    },

    /// Channel, session creation or activation failed.
    SessionActivationFailure {
        /// Connection.
        connection: ConnectionHandle,
        /// Failure status.
        status: StatusCode,
    },

    /// The channel was lost and the engine is reactivating the session.
    SessionReactivating {
        /// Connection.
        connection: ConnectionHandle,
    },

    /// The session is closed.
    SessionClosed {
        /// Connection.
        connection: ConnectionHandle,
        /// Close status.
        status: StatusCode,
    },

    /// A reverse endpoint listener is closed.
    ReverseEndpointClosed {
        /// Endpoint.
        endpoint: ReverseEndpointId,
    },
}

impl EngineEvent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionResponse { .. } => "session_response",
            Self::DiscoveryResponse { .. } => "discovery_response",
            Self::SendRequestFailed { .. } => "send_request_failed",
            Self::ChannelOpened { .. } => "channel_opened",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionActivated { .. } => "session_activated",
            Self::SessionActivationFailure { .. } => "session_activation_failure",
            Self::SessionReactivating { .. } => "session_reactivating",
            Self::SessionClosed { .. } => "session_closed",
            Self::ReverseEndpointClosed { .. } => "reverse_endpoint_closed",
        }
    }
}

// =============================================================================
// EventSink
// =============================================================================

/// Where the engine delivers events.
///
/// Holds a weak reference to the runtime; events arriving after the runtime
/// is dropped are discarded, which abandons any contexts they carry.
#[derive(Clone)]
pub struct EventSink {
    runtime: Weak<Shared>,
}

impl EventSink {
    pub(crate) fn new(runtime: Weak<Shared>) -> Self {
        Self { runtime }
    }

    /// Routes one event. Must not be called from inside a [`ProtocolEngine`]
    /// method.
    pub fn deliver(&self, event: EngineEvent) {
        match self.runtime.upgrade() {
            Some(shared) => dispatch::on_engine_event(&shared, event),
            None => tracing::debug!(event = event.name(), "Runtime dropped, discarding event"),
        }
    }

    /// Returns `true` while the runtime is alive.
    pub fn is_connected(&self) -> bool {
        self.runtime.strong_count() > 0
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("connected", &self.is_connected())
            .finish()
    }
}

// =============================================================================
// ProtocolEngine
// =============================================================================

/// The services stack driving channels and sessions.
///
/// Methods are called with the runtime's registry lock held and must not
/// block on network I/O or deliver events synchronously. A returned error
/// means the call had no effect: for sends, the context is dropped.
pub trait ProtocolEngine: Send + Sync {
    /// Registers the sink events are delivered to. Called once, when the
    /// runtime is created.
    fn attach(&self, sink: EventSink);

    /// Registers a channel configuration.
    fn add_channel_config(&self, config: &FinalizedConnection) -> Result<ChannelConfigId, StatusCode>;

    /// Starts listening for reverse connections on `url`.
    fn add_reverse_endpoint(&self, url: &str) -> Result<ReverseEndpointId, StatusCode>;

    /// Stops a reverse listener. Completion is signalled by
    /// [`EngineEvent::ReverseEndpointClosed`].
    fn close_reverse_endpoint(&self, endpoint: ReverseEndpointId);

    /// Opens the channel and creates and activates a session. Progress is
    /// reported through lifecycle events tagged with `connection`.
    ///
    /// The outcome must be reported within the connection's
    /// `request_timeout + session_timeout`. Past that the runtime releases
    /// `connection` without calling [`close_session`](Self::close_session),
    /// and events for it are ignored: a session activated afterwards is the
    /// engine's to close.
    fn activate_session(
        &self,
        channel: ChannelConfigId,
        reverse: Option<ReverseEndpointId>,
        connection: ConnectionHandle,
        identity: &ResolvedIdentity,
    ) -> Result<(), StatusCode>;

    /// Closes a session. Completion is signalled by
    /// [`EngineEvent::SessionClosed`].
    fn close_session(&self, session: SessionId) -> Result<(), StatusCode>;

    /// Sends a request on an activated session.
    fn send_session_request(
        &self,
        session: SessionId,
        request: Request,
        context: EngineContext,
    ) -> Result<(), StatusCode>;

    /// Sends a discovery request on a session-less channel.
    fn send_discovery_request(
        &self,
        channel: ChannelConfigId,
        request: Request,
        context: EngineContext,
    ) -> Result<(), StatusCode>;

    /// Forgets all channel configurations.
    fn clear_channels(&self);
}
