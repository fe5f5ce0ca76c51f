// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Per-connection state machine.
//!
//! ```text
//!   Idle ─start─▶ ChannelOpening ─▶ SessionCreating ─▶ SessionActivating ─▶ Activated
//!                      │                  │                    │              │   ▲
//!                      └──────── failure ─┴────────────────────┘              │   │
//!                                    ▼                            channel lost│   │reactivated
//!                                  Error ◀──────── closed (unsolicited) ──────┤   │
//!                                                                             ▼   │
//!   Closed ◀── closed ── Closing ◀─────────────── stop ─────────────── Reactivating
//! ```
//!
//! The machine is only touched with the registry lock held. It never calls
//! application code; callbacks it produces are returned as [`Deferred`] work.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::completion::{completion, Completion, Waiter};
use super::request::{Deferred, RequestContext, ServiceOutcome, UserContext};
use super::subscription::{ManagedSubscription, NotificationCallback, RevisedParameters};
use super::ConnectionHandle;
use crate::config::{FinalizedConnection, SubscriptionParams};
use crate::engine::{ChannelConfigId, EngineContext, ProtocolEngine, ReverseEndpointId, SessionId};
use crate::error::{ClientResult, ConnectionError, RequestError, SubscriptionError};
use crate::message::{
    CreateMonitoredItemsRequest, CreateSubscriptionRequest, DeleteMonitoredItemsRequest,
    DeleteSubscriptionsRequest, MonitoredItemCreateRequest, MonitoredItemCreateResult,
    PublishRequest, Request, Response, ServiceKind, TimestampsToReturn,
};
use crate::types::StatusCode;

// =============================================================================
// ConnectionState
// =============================================================================

/// State of one secure connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registered, no session requested.
    #[default]
    Idle,

    /// Secure channel is being opened.
    ChannelOpening,

    /// Session is being created.
    SessionCreating,

    /// Session is being activated.
    SessionActivating,

    /// Session is activated and ready for requests.
    Activated,

    /// Channel was lost; the engine is reactivating the session.
    Reactivating,

    /// Session close was requested.
    Closing,

    /// Session closed on request.
    Closed,

    /// Activation failed or the session was lost.
    Error,
}

impl ConnectionState {
    /// Returns `true` if service requests are accepted.
    #[inline]
    pub fn is_activated(&self) -> bool {
        matches!(self, Self::Activated)
    }

    /// Returns `true` if a session exists, even while reactivating.
    #[inline]
    pub fn has_session(&self) -> bool {
        matches!(self, Self::Activated | Self::Reactivating)
    }

    /// Returns `true` while a session is being established.
    #[inline]
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            Self::ChannelOpening | Self::SessionCreating | Self::SessionActivating
        )
    }

    /// Returns `true` once the connection cannot make progress.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::ChannelOpening => write!(f, "ChannelOpening"),
            Self::SessionCreating => write!(f, "SessionCreating"),
            Self::SessionActivating => write!(f, "SessionActivating"),
            Self::Activated => write!(f, "Activated"),
            Self::Reactivating => write!(f, "Reactivating"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

// =============================================================================
// ConnectionEvent
// =============================================================================

/// Unsolicited connection events reported to the connection callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// The session is (re)activated.
    Connected,
    /// The session was lost or is reactivating.
    Disconnected,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// A connection event to report once the registry lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConnectionNotice {
    pub(crate) event: ConnectionEvent,
    pub(crate) status: StatusCode,
}

// =============================================================================
// ConnectionStats
// =============================================================================

/// Per-connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    requests_failed: AtomicU64,
    activations: AtomicU64,
    reactivations: AtomicU64,
    publish_requests: AtomicU64,
    notifications: AtomicU64,
}

impl ConnectionStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_activation(&self) {
        self.activations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reactivation(&self) {
        self.reactivations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_publish(&self) {
        self.publish_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notifications(&self, count: usize) {
        self.notifications.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Application requests handed to the engine.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Responses received for application requests.
    pub fn responses_received(&self) -> u64 {
        self.responses_received.load(Ordering::Relaxed)
    }

    /// Requests that failed to send or were reported failed by the engine.
    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    /// Session activations, including reactivations.
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// Session reactivations after channel loss.
    pub fn reactivations(&self) -> u64 {
        self.reactivations.load(Ordering::Relaxed)
    }

    /// Publish requests sent.
    pub fn publish_requests(&self) -> u64 {
        self.publish_requests.load(Ordering::Relaxed)
    }

    /// Data change notifications delivered.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

// =============================================================================
// ConnectionInfo
// =============================================================================

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Connection handle.
    pub handle: ConnectionHandle,
    /// Endpoint URL.
    pub endpoint_url: String,
    /// Current state.
    pub state: ConnectionState,
    /// Engine session, when one exists.
    pub session: Option<SessionId>,
    /// Status of the last lifecycle transition.
    pub last_status: StatusCode,
    /// Managed subscription id, once created.
    pub subscription_id: Option<u32>,
    /// Application requests awaiting a response.
    pub pending_requests: usize,
    /// Only used for discovery requests.
    pub discovery_only: bool,
}

// =============================================================================
// Pending operations
// =============================================================================

pub(crate) type OperationResult<T> = Result<T, StatusCode>;

/// A runtime-internal request awaiting its response.
pub(crate) enum PendingOperation {
    CreateSubscription(Completion<OperationResult<u32>>),
    CreateMonitoredItems {
        client_handles: Vec<u32>,
        contexts: Vec<UserContext>,
        done: Completion<OperationResult<Vec<MonitoredItemCreateResult>>>,
    },
    DeleteMonitoredItems {
        item_ids: Vec<u32>,
        done: Completion<OperationResult<Vec<StatusCode>>>,
    },
    DeleteSubscription(Completion<OperationResult<()>>),
}

/// Maps an outcome to the service result of a good response of the expected
/// kind, or to the failing status.
fn service_status(outcome: &ServiceOutcome) -> StatusCode {
    match outcome {
        Ok(response) if response.is_fault() => {
            let status = response.service_result();
            if status.is_good() {
                StatusCode::BAD
            } else {
                status
            }
        }
        Ok(response) => response.service_result(),
        Err(status) => *status,
    }
}

// =============================================================================
// StateMachine
// =============================================================================

/// Lifecycle, requests and subscription bookkeeping of one connection.
pub(crate) struct StateMachine {
    handle: ConnectionHandle,
    config: Arc<FinalizedConnection>,
    channel: ChannelConfigId,
    reverse: Option<ReverseEndpointId>,
    state: ConnectionState,
    session: Option<SessionId>,
    last_status: StatusCode,
    discovery_only: bool,
    lifecycle: Option<Completion<ConnectionState>>,
    pending_requests: usize,
    max_pending: usize,
    operations: HashMap<u64, PendingOperation>,
    next_operation: u64,
    subscription: Option<ManagedSubscription>,
    stats: Arc<ConnectionStats>,
}

impl StateMachine {
    pub(crate) fn new(
        handle: ConnectionHandle,
        config: Arc<FinalizedConnection>,
        channel: ChannelConfigId,
        reverse: Option<ReverseEndpointId>,
        max_pending: usize,
    ) -> Self {
        Self {
            handle,
            config,
            channel,
            reverse,
            state: ConnectionState::Idle,
            session: None,
            last_status: StatusCode::GOOD,
            discovery_only: false,
            lifecycle: None,
            pending_requests: 0,
            max_pending,
            operations: HashMap::new(),
            next_operation: 1,
            subscription: None,
            stats: Arc::new(ConnectionStats::new()),
        }
    }

    /// Creates a machine used only for session-less discovery requests.
    pub(crate) fn discovery(
        handle: ConnectionHandle,
        config: Arc<FinalizedConnection>,
        channel: ChannelConfigId,
        max_pending: usize,
    ) -> Self {
        let mut machine = Self::new(handle, config, channel, None, max_pending);
        machine.discovery_only = true;
        machine
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub(crate) fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.config.endpoint_url
    }

    pub(crate) fn last_status(&self) -> StatusCode {
        self.last_status
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    pub(crate) fn is_discovery_only(&self) -> bool {
        self.discovery_only
    }

    pub(crate) fn sync_in_progress(&self) -> bool {
        self.lifecycle.is_some()
    }

    pub(crate) fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    pub(crate) fn subscription_id(&self) -> Option<u32> {
        self.subscription
            .as_ref()
            .filter(|sub| sub.is_created())
            .map(ManagedSubscription::id)
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            handle: self.handle,
            endpoint_url: self.config.endpoint_url.clone(),
            state: self.state,
            session: self.session,
            last_status: self.last_status,
            subscription_id: self.subscription_id(),
            pending_requests: self.pending_requests,
            discovery_only: self.discovery_only,
        }
    }

    /// Turns a discovery-only machine into a regular one.
    pub(crate) fn promote(&mut self, reverse: Option<ReverseEndpointId>) {
        self.discovery_only = false;
        self.reverse = reverse;
    }

    // =========================================================================
    // Lifecycle commands
    // =========================================================================

    /// Requests session activation. Valid only from `Idle`.
    pub(crate) fn start_session(
        &mut self,
        engine: &dyn ProtocolEngine,
    ) -> ClientResult<Waiter<ConnectionState>> {
        if self.lifecycle.is_some() {
            return Err(ConnectionError::SyncInProgress {
                endpoint: self.endpoint().to_string(),
            }
            .into());
        }
        if self.state != ConnectionState::Idle {
            return Err(ConnectionError::AlreadyConnected {
                endpoint: self.endpoint().to_string(),
            }
            .into());
        }

        if let Err(status) =
            engine.activate_session(self.channel, self.reverse, self.handle, &self.config.identity)
        {
            self.state = ConnectionState::Error;
            self.last_status = status;
            return Err(ConnectionError::EngineRejected {
                operation: "session activation",
                status,
            }
            .into());
        }

        self.state = ConnectionState::ChannelOpening;
        let (done, waiter) = completion();
        self.lifecycle = Some(done);
        tracing::debug!(connection = %self.handle, endpoint = %self.endpoint(), "Session activation requested");
        Ok(waiter)
    }

    /// Requests session close. Valid while a session exists.
    pub(crate) fn stop_session(
        &mut self,
        engine: &dyn ProtocolEngine,
    ) -> ClientResult<Waiter<ConnectionState>> {
        if self.lifecycle.is_some() {
            return Err(ConnectionError::SyncInProgress {
                endpoint: self.endpoint().to_string(),
            }
            .into());
        }
        let session = match (self.state.has_session(), self.session) {
            (true, Some(session)) => session,
            _ => return Err(self.not_activated()),
        };

        engine
            .close_session(session)
            .map_err(|status| ConnectionError::EngineRejected {
                operation: "session close",
                status,
            })?;

        self.state = ConnectionState::Closing;
        let (done, waiter) = completion();
        self.lifecycle = Some(done);
        tracing::debug!(connection = %self.handle, %session, "Session close requested");
        Ok(waiter)
    }

    /// Forces the machine into `Error`, closing the session best-effort.
    pub(crate) fn set_error(&mut self, engine: &dyn ProtocolEngine, status: StatusCode) {
        tracing::warn!(connection = %self.handle, state = %self.state, %status, "Connection set to error");
        if let Some(session) = self.session.take() {
            if let Err(close_status) = engine.close_session(session) {
                tracing::debug!(%session, status = %close_status, "Session close after error rejected");
            }
        }
        self.state = ConnectionState::Error;
        self.last_status = status;
        self.abort_internal();
    }

    // =========================================================================
    // Lifecycle events
    // =========================================================================

    pub(crate) fn on_channel_opened(&mut self) {
        if self.state == ConnectionState::ChannelOpening {
            self.state = ConnectionState::SessionCreating;
        }
    }

    pub(crate) fn on_session_created(&mut self) {
        if matches!(
            self.state,
            ConnectionState::ChannelOpening | ConnectionState::SessionCreating
        ) {
            self.state = ConnectionState::SessionActivating;
        }
    }

    pub(crate) fn on_activated(
        &mut self,
        engine: &dyn ProtocolEngine,
        session: SessionId,
    ) -> Option<ConnectionNotice> {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Error
        ) {
            tracing::warn!(connection = %self.handle, state = %self.state, "Unexpected session activation");
            return None;
        }

        let reactivated = self.state == ConnectionState::Reactivating;
        self.state = ConnectionState::Activated;
        self.session = Some(session);
        self.last_status = StatusCode::GOOD;
        self.stats.record_activation();

        if reactivated {
            self.stats.record_reactivation();
            tracing::info!(connection = %self.handle, %session, "Session reactivated");
            self.arm_publish_tokens(engine);
        } else {
            tracing::info!(connection = %self.handle, %session, endpoint = %self.endpoint(), "Session activated");
        }

        self.signal(ConnectionEvent::Connected, StatusCode::GOOD)
    }

    pub(crate) fn on_activation_failure(&mut self, status: StatusCode) -> Option<ConnectionNotice> {
        if self.state.is_terminal() {
            return None;
        }
        tracing::warn!(connection = %self.handle, state = %self.state, %status, "Session activation failed");
        self.state = ConnectionState::Error;
        self.last_status = status;
        self.session = None;
        self.abort_internal();
        self.signal(ConnectionEvent::Disconnected, status)
    }

    pub(crate) fn on_reactivating(&mut self) -> Option<ConnectionNotice> {
        if self.state != ConnectionState::Activated {
            return None;
        }
        tracing::warn!(connection = %self.handle, "Channel lost, reactivating session");
        self.state = ConnectionState::Reactivating;
        if self.lifecycle.is_some() {
            return None;
        }
        Some(ConnectionNotice {
            event: ConnectionEvent::Disconnected,
            status: StatusCode::BAD_WOULD_BLOCK,
        })
    }

    pub(crate) fn on_closed(&mut self, status: StatusCode) -> Option<ConnectionNotice> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = if self.state == ConnectionState::Closing {
            tracing::info!(connection = %self.handle, "Session closed");
            ConnectionState::Closed
        } else {
            tracing::warn!(connection = %self.handle, state = %self.state, %status, "Session closed unexpectedly");
            ConnectionState::Error
        };
        self.last_status = status;
        self.session = None;
        self.abort_internal();
        self.signal(ConnectionEvent::Disconnected, status)
    }

    /// Settles a lifecycle waiter if one exists, otherwise yields the event
    /// for the connection callback.
    fn signal(&mut self, event: ConnectionEvent, status: StatusCode) -> Option<ConnectionNotice> {
        match self.lifecycle.take() {
            Some(done) => {
                done.settle(self.state);
                None
            }
            None => Some(ConnectionNotice { event, status }),
        }
    }

    /// Fails internal operations and drops the subscription.
    fn abort_internal(&mut self) {
        if !self.operations.is_empty() {
            tracing::debug!(connection = %self.handle, count = self.operations.len(), "Abandoning internal operations");
        }
        self.operations.clear();
        self.subscription = None;
    }

    fn not_activated(&self) -> crate::error::ClientError {
        ConnectionError::NotActivated {
            endpoint: self.endpoint().to_string(),
            state: self.state.to_string(),
        }
        .into()
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Rejects subscription-scoped requests on the generic path once a
    /// subscription is managed.
    pub(crate) fn check_generic_request(&self, request: &Request) -> ClientResult<()> {
        let Some(subscription) = &self.subscription else {
            return Ok(());
        };
        let Some(targets) = request.targeted_subscriptions() else {
            if request.kind() == ServiceKind::Publish {
                return Err(SubscriptionError::NotAllowed {
                    service: ServiceKind::Publish.name().to_string(),
                }
                .into());
            }
            return Ok(());
        };
        if let Some(&other) = targets.iter().find(|&&id| id != subscription.id()) {
            return Err(SubscriptionError::IdMismatch {
                expected: subscription.id(),
                actual: other,
            }
            .into());
        }
        Err(SubscriptionError::NotAllowed {
            service: request.kind().name().to_string(),
        }
        .into())
    }

    /// Sends an application or internal request on the session.
    pub(crate) fn send_request(
        &mut self,
        engine: &dyn ProtocolEngine,
        request: Request,
        context: RequestContext,
    ) -> ClientResult<()> {
        let session = match (self.state, self.session) {
            (ConnectionState::Activated, Some(session)) => session,
            _ => return Err(self.not_activated()),
        };
        if self.pending_requests >= self.max_pending {
            return Err(RequestError::TooManyPending {
                limit: self.max_pending,
            }
            .into());
        }

        let service = request.kind();
        let context = EngineContext::application(self.handle, service, context);
        if let Err(status) = engine.send_session_request(session, request, context) {
            self.stats.record_failure();
            return Err(RequestError::SendFailed {
                service: service.name().to_string(),
                status,
            }
            .into());
        }

        self.pending_requests += 1;
        self.stats.record_request();
        Ok(())
    }

    /// Sends a discovery request on the channel, without a session.
    pub(crate) fn send_discovery(
        &mut self,
        engine: &dyn ProtocolEngine,
        request: Request,
        context: RequestContext,
    ) -> ClientResult<()> {
        let service = request.kind();
        let context = EngineContext::discovery(self.handle, service, context);
        if let Err(status) = engine.send_discovery_request(self.channel, request, context) {
            self.stats.record_failure();
            return Err(RequestError::SendFailed {
                service: service.name().to_string(),
                status,
            }
            .into());
        }
        self.stats.record_request();
        Ok(())
    }

    /// Accounts for a completed application request.
    pub(crate) fn on_request_done(&mut self, succeeded: bool) {
        self.pending_requests = self.pending_requests.saturating_sub(1);
        if succeeded {
            self.stats.record_response();
        } else {
            self.stats.record_failure();
        }
    }

    /// Accounts for a completed discovery request.
    pub(crate) fn on_discovery_done(&self, succeeded: bool) {
        if succeeded {
            self.stats.record_response();
        } else {
            self.stats.record_failure();
        }
    }

    fn send_operation(
        &mut self,
        engine: &dyn ProtocolEngine,
        request: Request,
        operation: PendingOperation,
    ) -> ClientResult<()> {
        let id = self.next_operation;
        self.next_operation = self.next_operation.wrapping_add(1).max(1);
        self.send_request(engine, request, RequestContext::no_sync(id))?;
        self.operations.insert(id, operation);
        Ok(())
    }

    /// Matches the outcome of an internal request to its pending operation.
    pub(crate) fn complete_operation(
        &mut self,
        engine: &dyn ProtocolEngine,
        operation: u64,
        outcome: ServiceOutcome,
    ) {
        self.on_request_done(outcome.is_ok());
        let Some(pending) = self.operations.remove(&operation) else {
            tracing::debug!(connection = %self.handle, operation, "No pending operation for response");
            return;
        };
        let status = service_status(&outcome);

        match pending {
            PendingOperation::CreateSubscription(done) => {
                let result = match outcome {
                    Ok(Response::CreateSubscription(response)) if status.is_good() => {
                        let revised = RevisedParameters {
                            publishing_interval: response.revised_publishing_interval,
                            lifetime_count: response.revised_lifetime_count,
                            max_keep_alive_count: response.revised_max_keep_alive_count,
                        };
                        match self.subscription.as_mut() {
                            Some(subscription) => {
                                subscription.on_created(response.subscription_id, revised);
                                Ok(response.subscription_id)
                            }
                            None => Err(StatusCode::BAD_INVALID_STATE),
                        }
                    }
                    Ok(_) if status.is_good() => Err(StatusCode::BAD_UNEXPECTED_ERROR),
                    _ => Err(status),
                };
                match &result {
                    Ok(id) => {
                        tracing::info!(connection = %self.handle, subscription_id = id, "Subscription created");
                        self.arm_publish_tokens(engine);
                    }
                    Err(status) => {
                        tracing::warn!(connection = %self.handle, %status, "Subscription creation failed");
                        self.subscription = None;
                    }
                }
                done.settle(result);
            }

            PendingOperation::CreateMonitoredItems {
                client_handles,
                contexts,
                done,
            } => {
                let result = match outcome {
                    Ok(Response::CreateMonitoredItems(response)) if status.is_good() => {
                        if let Some(subscription) = self.subscription.as_mut() {
                            for ((result, handle), context) in
                                response.results.iter().zip(&client_handles).zip(&contexts)
                            {
                                if result.status.is_good() {
                                    subscription.add_item(*handle, result.monitored_item_id, *context);
                                }
                            }
                        }
                        Ok(response.results)
                    }
                    Ok(_) if status.is_good() => Err(StatusCode::BAD_UNEXPECTED_ERROR),
                    _ => Err(status),
                };
                done.settle(result);
            }

            PendingOperation::DeleteMonitoredItems { item_ids, done } => {
                let result = match outcome {
                    Ok(Response::DeleteMonitoredItems(response)) if status.is_good() => {
                        if let Some(subscription) = self.subscription.as_mut() {
                            for (id, item_status) in item_ids.iter().zip(&response.results) {
                                if item_status.is_good()
                                    || *item_status == StatusCode::BAD_MONITORED_ITEM_ID_INVALID
                                {
                                    subscription.remove_item(*id);
                                }
                            }
                        }
                        Ok(response.results)
                    }
                    Ok(_) if status.is_good() => Err(StatusCode::BAD_UNEXPECTED_ERROR),
                    _ => Err(status),
                };
                done.settle(result);
            }

            PendingOperation::DeleteSubscription(done) => {
                let result = match outcome {
                    Ok(Response::DeleteSubscriptions(response)) => {
                        self.subscription = None;
                        match response.results.first() {
                            Some(item) if item.is_bad() => Err(*item),
                            _ if status.is_bad() => Err(status),
                            _ => Ok(()),
                        }
                    }
                    Ok(_) if status.is_good() => Err(StatusCode::BAD_UNEXPECTED_ERROR),
                    _ => Err(status),
                };
                if result.is_ok() {
                    tracing::info!(connection = %self.handle, "Subscription deleted");
                }
                done.settle(result);
            }
        }
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    fn managed(&mut self, subscription_id: u32) -> ClientResult<&mut ManagedSubscription> {
        match self.subscription.as_mut() {
            Some(subscription) if subscription.is_created() && subscription.id() == subscription_id => {
                Ok(subscription)
            }
            other => Err(SubscriptionError::IdMismatch {
                expected: other.map(|s| s.id()).unwrap_or(0),
                actual: subscription_id,
            }
            .into()),
        }
    }

    /// Checks that `subscription_id` is the managed subscription.
    pub(crate) fn ensure_subscription(&mut self, subscription_id: u32) -> ClientResult<()> {
        self.managed(subscription_id).map(|_| ())
    }

    pub(crate) fn create_subscription(
        &mut self,
        engine: &dyn ProtocolEngine,
        params: SubscriptionParams,
        callback: NotificationCallback,
        user_param: UserContext,
    ) -> ClientResult<Waiter<OperationResult<u32>>> {
        if self.subscription.is_some() {
            return Err(SubscriptionError::AlreadyExists.into());
        }
        if !self.state.is_activated() {
            return Err(self.not_activated());
        }
        params.validate()?;

        let request = Request::CreateSubscription(CreateSubscriptionRequest {
            requested_publishing_interval: params.publishing_interval,
            requested_lifetime_count: params.lifetime_count,
            requested_max_keep_alive_count: params.max_keep_alive_count,
            max_notifications_per_publish: params.max_notifications_per_publish,
            publishing_enabled: true,
            priority: params.priority,
        });
        let (done, waiter) = completion();
        self.send_operation(engine, request, PendingOperation::CreateSubscription(done))?;
        self.subscription = Some(ManagedSubscription::new(
            self.handle,
            params,
            callback,
            user_param,
        ));
        Ok(waiter)
    }

    pub(crate) fn revised_parameters(&mut self, subscription_id: u32) -> ClientResult<RevisedParameters> {
        self.managed(subscription_id)?
            .revised()
            .ok_or_else(|| SubscriptionError::NoSubscription.into())
    }

    pub(crate) fn set_publish_tokens(
        &mut self,
        engine: &dyn ProtocolEngine,
        subscription_id: u32,
        tokens: u32,
    ) -> ClientResult<()> {
        if tokens == 0 {
            return Err(SubscriptionError::InvalidTokenCount.into());
        }
        self.managed(subscription_id)?.set_target_tokens(tokens);
        self.arm_publish_tokens(engine);
        Ok(())
    }

    pub(crate) fn create_monitored_items(
        &mut self,
        engine: &dyn ProtocolEngine,
        subscription_id: u32,
        mut items: Vec<MonitoredItemCreateRequest>,
        contexts: Vec<UserContext>,
    ) -> ClientResult<Waiter<OperationResult<Vec<MonitoredItemCreateResult>>>> {
        let subscription = self.managed(subscription_id)?;
        let client_handles: Vec<u32> = items
            .iter_mut()
            .map(|item| {
                let handle = subscription.next_client_handle();
                item.client_handle = handle;
                handle
            })
            .collect();

        let request = Request::CreateMonitoredItems(CreateMonitoredItemsRequest {
            subscription_id,
            timestamps_to_return: TimestampsToReturn::Both,
            items_to_create: items,
        });
        let (done, waiter) = completion();
        self.send_operation(
            engine,
            request,
            PendingOperation::CreateMonitoredItems {
                client_handles,
                contexts,
                done,
            },
        )?;
        Ok(waiter)
    }

    pub(crate) fn delete_monitored_items(
        &mut self,
        engine: &dyn ProtocolEngine,
        subscription_id: u32,
        item_ids: Vec<u32>,
    ) -> ClientResult<Waiter<OperationResult<Vec<StatusCode>>>> {
        self.managed(subscription_id)?;
        let request = Request::DeleteMonitoredItems(DeleteMonitoredItemsRequest {
            subscription_id,
            monitored_item_ids: item_ids.clone(),
        });
        let (done, waiter) = completion();
        self.send_operation(
            engine,
            request,
            PendingOperation::DeleteMonitoredItems { item_ids, done },
        )?;
        Ok(waiter)
    }

    pub(crate) fn delete_subscription(
        &mut self,
        engine: &dyn ProtocolEngine,
        subscription_id: u32,
    ) -> ClientResult<Waiter<OperationResult<()>>> {
        self.managed(subscription_id)?;
        let request = Request::DeleteSubscriptions(DeleteSubscriptionsRequest {
            subscription_ids: vec![subscription_id],
        });
        let (done, waiter) = completion();
        self.send_operation(engine, request, PendingOperation::DeleteSubscription(done))?;
        Ok(waiter)
    }

    /// Keeps the subscription's publish tokens outstanding.
    pub(crate) fn arm_publish_tokens(&mut self, engine: &dyn ProtocolEngine) {
        let session = match (self.state, self.session) {
            (ConnectionState::Activated, Some(session)) => session,
            _ => return,
        };
        let Some(subscription) = self.subscription.as_mut().filter(|s| s.is_created()) else {
            return;
        };

        while subscription.needs_token() {
            let acknowledgements = subscription.take_acknowledgements();
            let request = Request::Publish(PublishRequest {
                acknowledgements: acknowledgements.clone(),
            });
            match engine.send_session_request(session, request, EngineContext::publish(self.handle)) {
                Ok(()) => {
                    subscription.token_sent();
                    self.stats.record_publish();
                }
                Err(status) => {
                    tracing::warn!(connection = %self.handle, %status, "Publish request rejected");
                    subscription.restore_acknowledgements(acknowledgements);
                    break;
                }
            }
        }
    }

    /// Handles the response to a publish token. Returns the notification
    /// callback to run, if the message carried data changes, and a
    /// connection event if publishing had to stop.
    pub(crate) fn on_publish_response(
        &mut self,
        engine: &dyn ProtocolEngine,
        response: Response,
    ) -> (Option<Deferred>, Option<ConnectionNotice>) {
        let Some(subscription) = self.subscription.as_mut() else {
            return (None, None);
        };
        subscription.token_returned();

        let status = match response {
            Response::Publish(publish) if publish.service_result.is_good() => {
                subscription.publish_succeeded();
                let count = publish.notification_message.data_changes.len();
                let deferred = subscription.on_publish(publish);
                if deferred.is_some() {
                    self.stats.record_notifications(count);
                }
                self.arm_publish_tokens(engine);
                return (deferred, None);
            }
            Response::Publish(publish) => {
                let status = publish.service_result;
                tracing::warn!(connection = %self.handle, %status, "Publish returned bad status");
                if status == StatusCode::BAD_TOO_MANY_PUBLISH_REQUESTS {
                    subscription.lower_target_tokens();
                }
                status
            }
            other => {
                tracing::warn!(connection = %self.handle, service = %other.kind(), "Unexpected response to publish");
                StatusCode::BAD_UNEXPECTED_ERROR
            }
        };

        (None, self.on_publish_error(engine, status))
    }

    /// Handles a publish token the engine failed to deliver.
    pub(crate) fn on_publish_failed(
        &mut self,
        engine: &dyn ProtocolEngine,
        status: StatusCode,
    ) -> Option<ConnectionNotice> {
        let subscription = self.subscription.as_mut()?;
        subscription.token_returned();
        tracing::debug!(connection = %self.handle, %status, "Publish token failed");
        self.on_publish_error(engine, status)
    }

    /// Re-arms after a failed publish token. Puts the connection in `Error`
    /// when the session or subscription is gone on the server, or after
    /// too many failures in a row.
    fn on_publish_error(
        &mut self,
        engine: &dyn ProtocolEngine,
        status: StatusCode,
    ) -> Option<ConnectionNotice> {
        if self.state != ConnectionState::Activated {
            return None;
        }
        let subscription = self.subscription.as_mut()?;
        let exhausted = subscription.publish_failed();

        if exhausted || ends_publishing(status) {
            tracing::error!(connection = %self.handle, %status, exhausted, "Publishing stopped");
            self.set_error(engine, status);
            return self.signal(ConnectionEvent::Disconnected, status);
        }
        self.arm_publish_tokens(engine);
        None
    }
}

/// Publish results after which the subscription cannot be served anymore.
fn ends_publishing(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_SESSION_ID_INVALID
            | StatusCode::BAD_SESSION_CLOSED
            | StatusCode::BAD_NO_SUBSCRIPTION
            | StatusCode::BAD_SUBSCRIPTION_ID_INVALID
    )
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("handle", &self.handle)
            .field("endpoint", &self.config.endpoint_url)
            .field("state", &self.state)
            .field("session", &self.session)
            .field("pending_requests", &self.pending_requests)
            .field("operations", &self.operations.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
