// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subscription manager.
//!
//! Each connection manages at most one subscription. Once the server accepts
//! it, the connection keeps `publish_tokens` Publish requests outstanding;
//! every Publish response acknowledges its sequence number on the next
//! request and hands data changes to the subscription callback, after the
//! registry lock is released.
//!
//! # Example
//!
//! ```rust,ignore
//! let subscription = runtime
//!     .create_subscription(handle, SubscriptionParams::default(), |n| {
//!         for change in &n.data_changes {
//!             println!("{} = {}", change.item_context, change.value.value);
//!         }
//!     }, 0)
//!     .await?;
//! subscription
//!     .create_monitored_items(vec![MonitoredItemCreateRequest::value(node)], vec![1])
//!     .await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::completion::{WaitError, Waiter};
use super::request::{wait_finished, Deferred, RequestContext, UserContext};
use super::state_machine::OperationResult;
use super::{ClientRuntime, ConnectionHandle};
use crate::config::SubscriptionParams;
use crate::error::{ClientError, ClientResult, RequestError, SubscriptionError, TimeoutError};
use crate::message::{
    MonitoredItemCreateRequest, MonitoredItemCreateResult, PublishResponse, Request, Response,
    StampError, SubscriptionAcknowledgement,
};
use crate::types::{DataValue, StatusCode};

// =============================================================================
// Public types
// =============================================================================

/// Parameters as revised by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisedParameters {
    /// Revised publishing interval.
    pub publishing_interval: Duration,
    /// Revised lifetime count.
    pub lifetime_count: u32,
    /// Revised keep-alive count.
    pub max_keep_alive_count: u32,
}

/// One data change, tagged with the context given when the item was created.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    /// Context of the monitored item.
    pub item_context: UserContext,
    /// Client handle of the monitored item.
    pub client_handle: u32,
    /// New value.
    pub value: DataValue,
}

/// Data changes from one notification message.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionNotification {
    /// Connection the subscription belongs to.
    pub connection: ConnectionHandle,
    /// Server-assigned subscription id.
    pub subscription_id: u32,
    /// Value given to `create_subscription`.
    pub user_param: UserContext,
    /// Notification message sequence number.
    pub sequence_number: u32,
    /// Changes, in server order.
    pub data_changes: Vec<DataChange>,
}

/// Receives subscription notifications. Runs outside the registry lock.
pub type NotificationCallback = Arc<dyn Fn(SubscriptionNotification) + Send + Sync>;

// =============================================================================
// ManagedSubscription
// =============================================================================

/// Publish tokens failing in a row before publishing is given up.
pub(crate) const MAX_PUBLISH_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy)]
struct MonitoredItemEntry {
    monitored_item_id: u32,
    context: UserContext,
}

/// Connection-side bookkeeping for the managed subscription.
pub(crate) struct ManagedSubscription {
    connection: ConnectionHandle,
    id: u32,
    params: SubscriptionParams,
    revised: Option<RevisedParameters>,
    callback: NotificationCallback,
    user_param: UserContext,
    target_tokens: u32,
    outstanding_tokens: u32,
    failed_publishes: u32,
    acknowledgements: Vec<SubscriptionAcknowledgement>,
    items: HashMap<u32, MonitoredItemEntry>,
    next_client_handle: u32,
}

impl ManagedSubscription {
    pub(crate) fn new(
        connection: ConnectionHandle,
        params: SubscriptionParams,
        callback: NotificationCallback,
        user_param: UserContext,
    ) -> Self {
        Self {
            connection,
            id: 0,
            params,
            revised: None,
            callback,
            user_param,
            target_tokens: params.publish_tokens,
            outstanding_tokens: 0,
            failed_publishes: 0,
            acknowledgements: Vec::new(),
            items: HashMap::new(),
            next_client_handle: 1,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn is_created(&self) -> bool {
        self.id != 0
    }

    pub(crate) fn revised(&self) -> Option<RevisedParameters> {
        self.revised
    }

    pub(crate) fn on_created(&mut self, id: u32, revised: RevisedParameters) {
        if revised.publishing_interval != self.params.publishing_interval {
            tracing::debug!(
                subscription_id = id,
                requested = ?self.params.publishing_interval,
                revised = ?revised.publishing_interval,
                "Publishing interval revised"
            );
        }
        self.id = id;
        self.revised = Some(revised);
    }

    pub(crate) fn next_client_handle(&mut self) -> u32 {
        let handle = self.next_client_handle;
        self.next_client_handle = self.next_client_handle.wrapping_add(1).max(1);
        handle
    }

    pub(crate) fn add_item(&mut self, client_handle: u32, monitored_item_id: u32, context: UserContext) {
        self.items.insert(
            client_handle,
            MonitoredItemEntry {
                monitored_item_id,
                context,
            },
        );
    }

    pub(crate) fn remove_item(&mut self, monitored_item_id: u32) {
        self.items
            .retain(|_, entry| entry.monitored_item_id != monitored_item_id);
    }

    pub(crate) fn set_target_tokens(&mut self, tokens: u32) {
        self.target_tokens = tokens;
    }

    pub(crate) fn lower_target_tokens(&mut self) {
        self.target_tokens = self.target_tokens.saturating_sub(1).max(1);
    }

    pub(crate) fn needs_token(&self) -> bool {
        self.outstanding_tokens < self.target_tokens
    }

    pub(crate) fn token_sent(&mut self) {
        self.outstanding_tokens += 1;
    }

    pub(crate) fn token_returned(&mut self) {
        self.outstanding_tokens = self.outstanding_tokens.saturating_sub(1);
    }

    /// Counts a failed publish token. Returns `true` once
    /// [`MAX_PUBLISH_FAILURES`] tokens failed in a row.
    pub(crate) fn publish_failed(&mut self) -> bool {
        self.failed_publishes += 1;
        self.failed_publishes >= MAX_PUBLISH_FAILURES
    }

    pub(crate) fn publish_succeeded(&mut self) {
        self.failed_publishes = 0;
    }

    pub(crate) fn take_acknowledgements(&mut self) -> Vec<SubscriptionAcknowledgement> {
        std::mem::take(&mut self.acknowledgements)
    }

    pub(crate) fn restore_acknowledgements(&mut self, mut acknowledgements: Vec<SubscriptionAcknowledgement>) {
        acknowledgements.append(&mut self.acknowledgements);
        self.acknowledgements = acknowledgements;
    }

    /// Queues the acknowledgement and builds the notification callback.
    pub(crate) fn on_publish(&mut self, publish: PublishResponse) -> Option<Deferred> {
        if publish.subscription_id != self.id {
            tracing::debug!(
                expected = self.id,
                actual = publish.subscription_id,
                "Publish response for unknown subscription"
            );
            return None;
        }

        let message = publish.notification_message;
        if message.sequence_number != 0 {
            self.acknowledgements.push(SubscriptionAcknowledgement {
                subscription_id: self.id,
                sequence_number: message.sequence_number,
            });
        }

        let data_changes: Vec<DataChange> = message
            .data_changes
            .into_iter()
            .filter_map(|change| match self.items.get(&change.client_handle) {
                Some(entry) => Some(DataChange {
                    item_context: entry.context,
                    client_handle: change.client_handle,
                    value: change.value,
                }),
                None => {
                    tracing::trace!(client_handle = change.client_handle, "Change for unknown item");
                    None
                }
            })
            .collect();
        if data_changes.is_empty() {
            return None;
        }

        let notification = SubscriptionNotification {
            connection: self.connection,
            subscription_id: self.id,
            user_param: self.user_param,
            sequence_number: message.sequence_number,
            data_changes,
        };
        let callback = Arc::clone(&self.callback);
        Some(Box::new(move || callback(notification)))
    }
}

impl fmt::Debug for ManagedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSubscription")
            .field("id", &self.id)
            .field("items", &self.items.len())
            .field("target_tokens", &self.target_tokens)
            .field("outstanding_tokens", &self.outstanding_tokens)
            .finish()
    }
}

// =============================================================================
// Subscription handle
// =============================================================================

/// Application handle to a connection's subscription.
///
/// The handle goes stale when the subscription is deleted or the connection
/// closes; operations then fail with `INVALID_PARAMETERS`.
#[derive(Clone)]
pub struct Subscription {
    runtime: ClientRuntime,
    connection: ConnectionHandle,
    id: u32,
    user_param: UserContext,
}

fn operation_error(operation: &'static str, status: StatusCode) -> ClientError {
    SubscriptionError::OperationFailed { operation, status }.into()
}

impl Subscription {
    /// Server-assigned subscription id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Connection the subscription belongs to.
    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    /// Value given to `create_subscription`.
    pub fn user_param(&self) -> UserContext {
        self.user_param
    }

    /// Sets how many Publish requests are kept outstanding.
    pub fn set_available_tokens(&self, tokens: u32) -> ClientResult<()> {
        if tokens == 0 {
            return Err(SubscriptionError::InvalidTokenCount.into());
        }
        let shared = &self.runtime.shared;
        let mut registry = shared.registry.lock();
        let entry = registry.connection_mut(self.connection)?;
        entry
            .machine
            .set_publish_tokens(shared.engine.as_ref(), self.id, tokens)
    }

    /// Parameters as revised by the server.
    pub fn revised_parameters(&self) -> ClientResult<RevisedParameters> {
        let mut registry = self.runtime.shared.registry.lock();
        registry
            .connection_mut(self.connection)?
            .machine
            .revised_parameters(self.id)
    }

    /// Creates monitored items. `contexts[i]` is reported with changes of
    /// `items[i]`.
    ///
    /// Client handles are assigned by the runtime. Per-item statuses are
    /// returned; an item whose status is bad produces no notifications.
    pub async fn create_monitored_items(
        &self,
        items: Vec<MonitoredItemCreateRequest>,
        contexts: Vec<UserContext>,
    ) -> ClientResult<Vec<MonitoredItemCreateResult>> {
        if items.is_empty() || items.len() != contexts.len() {
            return Err(SubscriptionError::ContextCountMismatch {
                items: items.len(),
                contexts: contexts.len(),
            }
            .into());
        }
        let count = items.len();
        let (waiter, timeout) = {
            let shared = &self.runtime.shared;
            let mut registry = shared.registry.lock();
            registry.ensure_running()?;
            let machine = &mut registry.connection_mut(self.connection)?.machine;
            let waiter =
                machine.create_monitored_items(shared.engine.as_ref(), self.id, items, contexts)?;
            (waiter, machine.request_timeout())
        };

        let results = self
            .wait_operation(waiter, timeout, "create monitored items")
            .await?;
        tracing::debug!(
            connection = %self.connection,
            subscription_id = self.id,
            requested = count,
            created = results.iter().filter(|r| r.status.is_good()).count(),
            "Monitored items created"
        );
        Ok(results)
    }

    /// Deletes monitored items by server-assigned id.
    pub async fn delete_monitored_items(&self, item_ids: Vec<u32>) -> ClientResult<Vec<StatusCode>> {
        if item_ids.is_empty() {
            return Err(ClientError::invalid_request("no monitored items to delete"));
        }
        let (waiter, timeout) = {
            let shared = &self.runtime.shared;
            let mut registry = shared.registry.lock();
            registry.ensure_running()?;
            let machine = &mut registry.connection_mut(self.connection)?.machine;
            let waiter = machine.delete_monitored_items(shared.engine.as_ref(), self.id, item_ids)?;
            (waiter, machine.request_timeout())
        };
        self.wait_operation(waiter, timeout, "delete monitored items")
            .await
    }

    /// Deletes the subscription.
    pub async fn delete(self) -> ClientResult<()> {
        let (waiter, timeout) = {
            let shared = &self.runtime.shared;
            let mut registry = shared.registry.lock();
            registry.ensure_running()?;
            let machine = &mut registry.connection_mut(self.connection)?.machine;
            let waiter = machine.delete_subscription(shared.engine.as_ref(), self.id)?;
            (waiter, machine.request_timeout())
        };
        self.wait_operation(waiter, timeout, "delete subscription")
            .await
    }

    /// Sends a subscription-scoped request and waits for the response.
    ///
    /// Accepted services: ModifySubscription, SetPublishingMode,
    /// ModifyMonitoredItems, SetMonitoringMode and SetTriggering. The
    /// subscription id is filled in when left at 0.
    pub async fn service_sync(&self, request: Request) -> ClientResult<Response> {
        let service = request.kind();
        let (context, waiter) = RequestContext::sync();
        self.send_scoped(request, context)?;
        wait_finished(waiter, service).await
    }

    /// Sends a subscription-scoped request; the response goes to the
    /// runtime's async response callback with `user_context`.
    pub fn service_async(&self, request: Request, user_context: UserContext) -> ClientResult<()> {
        let callback = self.runtime.shared.registry.lock().async_response()?;
        self.send_scoped(request, RequestContext::asynchronous(callback, user_context))
    }

    fn send_scoped(&self, mut request: Request, context: RequestContext) -> ClientResult<()> {
        let shared = &self.runtime.shared;
        let mut registry = shared.registry.lock();
        registry.ensure_running()?;
        let machine = &mut registry.connection_mut(self.connection)?.machine;
        machine.ensure_subscription(self.id)?;

        request
            .stamp_subscription(self.id)
            .map_err(|err| -> ClientError {
                match err {
                    StampError::NotAllowed(service) => SubscriptionError::NotAllowed {
                        service: service.name().to_string(),
                    }
                    .into(),
                    StampError::TooManyIds => RequestError::InvalidRequest {
                        reason: "SetPublishingMode accepts a single subscription id".into(),
                    }
                    .into(),
                    StampError::Mismatch { supplied } => SubscriptionError::IdMismatch {
                        expected: self.id,
                        actual: supplied,
                    }
                    .into(),
                }
            })?;

        machine.send_request(shared.engine.as_ref(), request, context)
    }

    async fn wait_operation<T>(
        &self,
        waiter: Waiter<OperationResult<T>>,
        timeout: Duration,
        operation: &'static str,
    ) -> ClientResult<T> {
        match waiter.wait_timeout(timeout).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(status)) => Err(operation_error(operation, status)),
            Err(WaitError::Abandoned) => Err(operation_error(operation, StatusCode::BAD_CONNECTION_CLOSED)),
            Err(WaitError::Elapsed) => {
                self.runtime.fail_connection(self.connection, StatusCode::BAD_TIMEOUT);
                Err(TimeoutError::new(operation, timeout).into())
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("connection", &self.connection)
            .field("id", &self.id)
            .field("user_param", &self.user_param)
            .finish()
    }
}

// =============================================================================
// ClientRuntime::create_subscription
// =============================================================================

impl ClientRuntime {
    /// Creates the connection's subscription and waits for the server.
    ///
    /// A connection manages at most one subscription. Waiting is bounded by
    /// the connection's request timeout; on timeout the connection is put in
    /// error.
    pub async fn create_subscription<F>(
        &self,
        connection: ConnectionHandle,
        params: SubscriptionParams,
        callback: F,
        user_param: UserContext,
    ) -> ClientResult<Subscription>
    where
        F: Fn(SubscriptionNotification) + Send + Sync + 'static,
    {
        let (waiter, timeout) = {
            let shared = &self.shared;
            let mut registry = shared.registry.lock();
            registry.ensure_running()?;
            let machine = &mut registry.connection_mut(connection)?.machine;
            let waiter = machine.create_subscription(
                shared.engine.as_ref(),
                params,
                Arc::new(callback),
                user_param,
            )?;
            (waiter, machine.request_timeout())
        };

        match waiter.wait_timeout(timeout).await {
            Ok(Ok(id)) => Ok(Subscription {
                runtime: self.clone(),
                connection,
                id,
                user_param,
            }),
            Ok(Err(status)) => Err(operation_error("create subscription", status)),
            Err(WaitError::Abandoned) => Err(operation_error(
                "create subscription",
                StatusCode::BAD_CONNECTION_CLOSED,
            )),
            Err(WaitError::Elapsed) => {
                self.fail_connection(connection, StatusCode::BAD_TIMEOUT);
                Err(TimeoutError::new("create subscription", timeout).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MonitoredItemNotification, NotificationMessage};
    use crate::types::Variant;

    fn managed() -> ManagedSubscription {
        let mut sub = ManagedSubscription::new(
            ConnectionHandle::new(2, 0),
            SubscriptionParams::default(),
            Arc::new(|_: SubscriptionNotification| {}),
            11,
        );
        sub.on_created(
            5,
            RevisedParameters {
                publishing_interval: Duration::from_millis(1000),
                lifetime_count: 30,
                max_keep_alive_count: 10,
            },
        );
        sub
    }

    fn publish(sequence_number: u32, handles: &[u32]) -> PublishResponse {
        PublishResponse {
            service_result: StatusCode::GOOD,
            subscription_id: 5,
            more_notifications: false,
            notification_message: NotificationMessage {
                sequence_number,
                data_changes: handles
                    .iter()
                    .map(|&client_handle| MonitoredItemNotification {
                        client_handle,
                        value: DataValue::new(Variant::Int64(client_handle as i64)),
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn test_token_accounting() {
        let mut sub = managed();
        assert!(sub.needs_token());
        for _ in 0..3 {
            sub.token_sent();
        }
        assert!(!sub.needs_token());
        sub.token_returned();
        assert!(sub.needs_token());

        sub.lower_target_tokens();
        sub.lower_target_tokens();
        sub.lower_target_tokens();
        assert_eq!(sub.target_tokens, 1);
    }

    #[test]
    fn test_keep_alive_is_not_acknowledged() {
        let mut sub = managed();
        assert!(sub.on_publish(publish(0, &[])).is_none());
        assert!(sub.take_acknowledgements().is_empty());
    }

    #[test]
    fn test_publish_queues_acknowledgement() {
        let mut sub = managed();
        sub.add_item(1, 100, 7);
        assert!(sub.on_publish(publish(3, &[1])).is_some());
        assert!(sub.on_publish(publish(4, &[9])).is_none());

        let acks = sub.take_acknowledgements();
        assert_eq!(
            acks.iter().map(|a| a.sequence_number).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(acks.iter().all(|a| a.subscription_id == 5));
    }

    #[test]
    fn test_restore_keeps_order() {
        let mut sub = managed();
        sub.on_publish(publish(1, &[]));
        let first = sub.take_acknowledgements();
        sub.on_publish(publish(2, &[]));
        sub.restore_acknowledgements(first);
        let acks: Vec<u32> = sub
            .take_acknowledgements()
            .iter()
            .map(|a| a.sequence_number)
            .collect();
        assert_eq!(acks, vec![1, 2]);
    }

    #[test]
    fn test_removed_item_stops_reporting() {
        let mut sub = managed();
        sub.add_item(1, 100, 7);
        sub.add_item(2, 101, 8);
        sub.remove_item(100);
        assert!(sub.on_publish(publish(6, &[1])).is_none());
        assert!(sub.on_publish(publish(7, &[2])).is_some());
    }

    #[test]
    fn test_notification_carries_item_contexts() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut sub = ManagedSubscription::new(
            ConnectionHandle::new(0, 0),
            SubscriptionParams::default(),
            Arc::new(move |n: SubscriptionNotification| {
                sink.lock().extend(n.data_changes.into_iter().map(|c| c.item_context));
            }),
            0,
        );
        sub.on_created(
            9,
            RevisedParameters {
                publishing_interval: Duration::from_millis(500),
                lifetime_count: 10,
                max_keep_alive_count: 3,
            },
        );
        sub.add_item(1, 10, 1000);
        sub.add_item(2, 11, 2000);

        let mut response = publish(1, &[2, 1]);
        response.subscription_id = 9;
        sub.on_publish(response).expect("changes present")();
        assert_eq!(*seen.lock(), vec![2000, 1000]);
    }
}
