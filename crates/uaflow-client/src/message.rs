// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Typed service requests and responses.
//!
//! The engine encodes and decodes these; the orchestration layer inspects a
//! few of them:
//!
//! - subscription-scoped requests are checked against and stamped with the
//!   connection's managed subscription id;
//! - subscription and monitored item responses feed the state machine's
//!   bookkeeping;
//! - publish responses carry the notification stream.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{AttributeId, DataValue, NodeId, SecurityMode, StatusCode};

// =============================================================================
// ServiceKind
// =============================================================================

/// Identifies a service for logging, filtering and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Read.
    Read,
    /// Write.
    Write,
    /// Browse.
    Browse,
    /// CreateSubscription.
    CreateSubscription,
    /// ModifySubscription.
    ModifySubscription,
    /// SetPublishingMode.
    SetPublishingMode,
    /// TransferSubscriptions.
    TransferSubscriptions,
    /// DeleteSubscriptions.
    DeleteSubscriptions,
    /// CreateMonitoredItems.
    CreateMonitoredItems,
    /// ModifyMonitoredItems.
    ModifyMonitoredItems,
    /// SetMonitoringMode.
    SetMonitoringMode,
    /// SetTriggering.
    SetTriggering,
    /// DeleteMonitoredItems.
    DeleteMonitoredItems,
    /// Publish.
    Publish,
    /// Republish.
    Republish,
    /// GetEndpoints (discovery).
    GetEndpoints,
    /// FindServers (discovery).
    FindServers,
    /// ServiceFault (response only).
    ServiceFault,
}

impl ServiceKind {
    /// Returns the service name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Browse => "Browse",
            Self::CreateSubscription => "CreateSubscription",
            Self::ModifySubscription => "ModifySubscription",
            Self::SetPublishingMode => "SetPublishingMode",
            Self::TransferSubscriptions => "TransferSubscriptions",
            Self::DeleteSubscriptions => "DeleteSubscriptions",
            Self::CreateMonitoredItems => "CreateMonitoredItems",
            Self::ModifyMonitoredItems => "ModifyMonitoredItems",
            Self::SetMonitoringMode => "SetMonitoringMode",
            Self::SetTriggering => "SetTriggering",
            Self::DeleteMonitoredItems => "DeleteMonitoredItems",
            Self::Publish => "Publish",
            Self::Republish => "Republish",
            Self::GetEndpoints => "GetEndpoints",
            Self::FindServers => "FindServers",
            Self::ServiceFault => "ServiceFault",
        }
    }

    /// Returns `true` for services that run without a session.
    #[inline]
    pub const fn is_discovery(&self) -> bool {
        matches!(self, Self::GetEndpoints | Self::FindServers)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Request payloads
// =============================================================================

/// One node/attribute to read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadValueId {
    /// Target node.
    pub node_id: NodeId,
    /// Attribute to read.
    pub attribute_id: AttributeId,
}

impl ReadValueId {
    /// Reads the Value attribute of `node_id`.
    pub fn value(node_id: NodeId) -> Self {
        Self {
            node_id,
            attribute_id: AttributeId::Value,
        }
    }
}

/// Read service request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReadRequest {
    /// Maximum cached value age.
    pub max_age: Duration,
    /// Nodes to read.
    pub nodes_to_read: Vec<ReadValueId>,
}

/// One node/attribute to write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteValue {
    /// Target node.
    pub node_id: NodeId,
    /// Attribute to write.
    pub attribute_id: AttributeId,
    /// Value to write.
    pub value: DataValue,
}

/// Write service request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WriteRequest {
    /// Values to write.
    pub nodes_to_write: Vec<WriteValue>,
}

/// Browse direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrowseDirection {
    /// Forward references.
    #[default]
    Forward,
    /// Inverse references.
    Inverse,
    /// Both directions.
    Both,
}

/// One node to browse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowseDescription {
    /// Starting node.
    pub node_id: NodeId,
    /// Reference direction.
    pub direction: BrowseDirection,
    /// Reference type filter (null = all).
    pub reference_type_id: NodeId,
    /// Include subtypes of the reference type.
    pub include_subtypes: bool,
}

/// Browse service request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BrowseRequest {
    /// Max references per node (0 = server default).
    pub max_references_per_node: u32,
    /// Nodes to browse.
    pub nodes_to_browse: Vec<BrowseDescription>,
}

/// CreateSubscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSubscriptionRequest {
    /// Requested publishing interval.
    pub requested_publishing_interval: Duration,
    /// Requested lifetime count.
    pub requested_lifetime_count: u32,
    /// Requested keep-alive count.
    pub requested_max_keep_alive_count: u32,
    /// Max notifications per publish (0 = unlimited).
    pub max_notifications_per_publish: u32,
    /// Enable publishing on creation.
    pub publishing_enabled: bool,
    /// Relative priority.
    pub priority: u8,
}

/// ModifySubscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifySubscriptionRequest {
    /// Target subscription.
    pub subscription_id: u32,
    /// Requested publishing interval.
    pub requested_publishing_interval: Duration,
    /// Requested lifetime count.
    pub requested_lifetime_count: u32,
    /// Requested keep-alive count.
    pub requested_max_keep_alive_count: u32,
    /// Max notifications per publish.
    pub max_notifications_per_publish: u32,
    /// Relative priority.
    pub priority: u8,
}

/// SetPublishingMode request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPublishingModeRequest {
    /// Enable or disable publishing.
    pub publishing_enabled: bool,
    /// Target subscriptions.
    pub subscription_ids: Vec<u32>,
}

/// TransferSubscriptions request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSubscriptionsRequest {
    /// Subscriptions to transfer.
    pub subscription_ids: Vec<u32>,
    /// Send initial values after transfer.
    pub send_initial_values: bool,
}

/// DeleteSubscriptions request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSubscriptionsRequest {
    /// Subscriptions to delete.
    pub subscription_ids: Vec<u32>,
}

/// Monitoring mode of a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringMode {
    /// Not sampled.
    Disabled,
    /// Sampled, not reported.
    Sampling,
    /// Sampled and reported.
    #[default]
    Reporting,
}

/// Which timestamps the server returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampsToReturn {
    /// Source timestamp.
    Source,
    /// Server timestamp.
    Server,
    /// Both.
    #[default]
    Both,
    /// Neither.
    Neither,
}

/// One monitored item to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemCreateRequest {
    /// Node/attribute to monitor.
    pub item_to_monitor: ReadValueId,
    /// Monitoring mode.
    pub monitoring_mode: MonitoringMode,
    /// Client handle reported with notifications.
    pub client_handle: u32,
    /// Sampling interval (negative = publishing interval, carried as None).
    pub sampling_interval: Option<Duration>,
    /// Server-side queue size.
    pub queue_size: u32,
    /// Discard oldest on overflow.
    pub discard_oldest: bool,
}

impl MonitoredItemCreateRequest {
    /// Reporting item on the Value attribute with default sampling.
    pub fn value(node_id: NodeId) -> Self {
        Self {
            item_to_monitor: ReadValueId::value(node_id),
            monitoring_mode: MonitoringMode::Reporting,
            client_handle: 0,
            sampling_interval: None,
            queue_size: 1,
            discard_oldest: true,
        }
    }
}

/// CreateMonitoredItems request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateMonitoredItemsRequest {
    /// Target subscription.
    pub subscription_id: u32,
    /// Timestamps to return.
    pub timestamps_to_return: TimestampsToReturn,
    /// Items to create.
    pub items_to_create: Vec<MonitoredItemCreateRequest>,
}

/// One monitored item modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredItemModifyRequest {
    /// Server-assigned item id.
    pub monitored_item_id: u32,
    /// New sampling interval.
    pub sampling_interval: Option<Duration>,
    /// New queue size.
    pub queue_size: u32,
}

/// ModifyMonitoredItems request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyMonitoredItemsRequest {
    /// Target subscription.
    pub subscription_id: u32,
    /// Timestamps to return.
    pub timestamps_to_return: TimestampsToReturn,
    /// Items to modify.
    pub items_to_modify: Vec<MonitoredItemModifyRequest>,
}

/// SetMonitoringMode request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMonitoringModeRequest {
    /// Target subscription.
    pub subscription_id: u32,
    /// New mode.
    pub monitoring_mode: MonitoringMode,
    /// Items to change.
    pub monitored_item_ids: Vec<u32>,
}

/// SetTriggering request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetTriggeringRequest {
    /// Target subscription.
    pub subscription_id: u32,
    /// Triggering item.
    pub triggering_item_id: u32,
    /// Links to add.
    pub links_to_add: Vec<u32>,
    /// Links to remove.
    pub links_to_remove: Vec<u32>,
}

/// DeleteMonitoredItems request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMonitoredItemsRequest {
    /// Target subscription.
    pub subscription_id: u32,
    /// Items to delete.
    pub monitored_item_ids: Vec<u32>,
}

/// Acknowledgement of a received notification message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionAcknowledgement {
    /// Subscription id.
    pub subscription_id: u32,
    /// Acknowledged sequence number.
    pub sequence_number: u32,
}

/// Publish request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PublishRequest {
    /// Acknowledgements for previously received messages.
    pub acknowledgements: Vec<SubscriptionAcknowledgement>,
}

/// Republish request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepublishRequest {
    /// Subscription id.
    pub subscription_id: u32,
    /// Sequence number to retransmit.
    pub retransmit_sequence_number: u32,
}

/// GetEndpoints request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetEndpointsRequest {
    /// Endpoint URL used to reach the server.
    pub endpoint_url: String,
}

/// FindServers request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindServersRequest {
    /// Endpoint URL used to reach the server.
    pub endpoint_url: String,
    /// Optional server URI filter.
    pub server_uris: Vec<String>,
}

// =============================================================================
// Request
// =============================================================================

/// A service request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", content = "body", rename_all = "snake_case")]
pub enum Request {
    /// Read.
    Read(ReadRequest),
    /// Write.
    Write(WriteRequest),
    /// Browse.
    Browse(BrowseRequest),
    /// CreateSubscription.
    CreateSubscription(CreateSubscriptionRequest),
    /// ModifySubscription.
    ModifySubscription(ModifySubscriptionRequest),
    /// SetPublishingMode.
    SetPublishingMode(SetPublishingModeRequest),
    /// TransferSubscriptions.
    TransferSubscriptions(TransferSubscriptionsRequest),
    /// DeleteSubscriptions.
    DeleteSubscriptions(DeleteSubscriptionsRequest),
    /// CreateMonitoredItems.
    CreateMonitoredItems(CreateMonitoredItemsRequest),
    /// ModifyMonitoredItems.
    ModifyMonitoredItems(ModifyMonitoredItemsRequest),
    /// SetMonitoringMode.
    SetMonitoringMode(SetMonitoringModeRequest),
    /// SetTriggering.
    SetTriggering(SetTriggeringRequest),
    /// DeleteMonitoredItems.
    DeleteMonitoredItems(DeleteMonitoredItemsRequest),
    /// Publish.
    Publish(PublishRequest),
    /// Republish.
    Republish(RepublishRequest),
    /// GetEndpoints.
    GetEndpoints(GetEndpointsRequest),
    /// FindServers.
    FindServers(FindServersRequest),
}

impl Request {
    /// Returns the service kind.
    pub const fn kind(&self) -> ServiceKind {
        match self {
            Self::Read(_) => ServiceKind::Read,
            Self::Write(_) => ServiceKind::Write,
            Self::Browse(_) => ServiceKind::Browse,
            Self::CreateSubscription(_) => ServiceKind::CreateSubscription,
            Self::ModifySubscription(_) => ServiceKind::ModifySubscription,
            Self::SetPublishingMode(_) => ServiceKind::SetPublishingMode,
            Self::TransferSubscriptions(_) => ServiceKind::TransferSubscriptions,
            Self::DeleteSubscriptions(_) => ServiceKind::DeleteSubscriptions,
            Self::CreateMonitoredItems(_) => ServiceKind::CreateMonitoredItems,
            Self::ModifyMonitoredItems(_) => ServiceKind::ModifyMonitoredItems,
            Self::SetMonitoringMode(_) => ServiceKind::SetMonitoringMode,
            Self::SetTriggering(_) => ServiceKind::SetTriggering,
            Self::DeleteMonitoredItems(_) => ServiceKind::DeleteMonitoredItems,
            Self::Publish(_) => ServiceKind::Publish,
            Self::Republish(_) => ServiceKind::Republish,
            Self::GetEndpoints(_) => ServiceKind::GetEndpoints,
            Self::FindServers(_) => ServiceKind::FindServers,
        }
    }

    /// Subscription ids this request operates on, or `None` if it is not
    /// subscription-scoped.
    pub fn targeted_subscriptions(&self) -> Option<Vec<u32>> {
        match self {
            Self::ModifySubscription(r) => Some(vec![r.subscription_id]),
            Self::SetPublishingMode(r) => Some(r.subscription_ids.clone()),
            Self::TransferSubscriptions(r) => Some(r.subscription_ids.clone()),
            Self::DeleteSubscriptions(r) => Some(r.subscription_ids.clone()),
            Self::CreateMonitoredItems(r) => Some(vec![r.subscription_id]),
            Self::ModifyMonitoredItems(r) => Some(vec![r.subscription_id]),
            Self::SetMonitoringMode(r) => Some(vec![r.subscription_id]),
            Self::SetTriggering(r) => Some(vec![r.subscription_id]),
            Self::DeleteMonitoredItems(r) => Some(vec![r.subscription_id]),
            Self::Republish(r) => Some(vec![r.subscription_id]),
            _ => None,
        }
    }

    /// Stamps `subscription_id` into a request accepted on the
    /// subscription-scoped path.
    ///
    /// A caller-supplied id of 0 means "the current subscription". Any other
    /// id must equal `subscription_id`.
    pub fn stamp_subscription(&mut self, subscription_id: u32) -> Result<(), StampError> {
        fn stamp(slot: &mut u32, id: u32) -> Result<(), StampError> {
            if *slot != 0 && *slot != id {
                return Err(StampError::Mismatch { supplied: *slot });
            }
            *slot = id;
            Ok(())
        }

        match self {
            Self::ModifySubscription(r) => stamp(&mut r.subscription_id, subscription_id),
            Self::SetPublishingMode(r) => match r.subscription_ids.as_mut_slice() {
                [] => {
                    r.subscription_ids.push(subscription_id);
                    Ok(())
                }
                [only] => stamp(only, subscription_id),
                _ => Err(StampError::TooManyIds),
            },
            Self::ModifyMonitoredItems(r) => stamp(&mut r.subscription_id, subscription_id),
            Self::SetMonitoringMode(r) => stamp(&mut r.subscription_id, subscription_id),
            Self::SetTriggering(r) => stamp(&mut r.subscription_id, subscription_id),
            other => Err(StampError::NotAllowed(other.kind())),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Request", self.kind())
    }
}

/// Why a request could not be stamped with the managed subscription id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampError {
    /// The service is not accepted on the subscription path.
    NotAllowed(ServiceKind),
    /// SetPublishingMode with more than one id.
    TooManyIds,
    /// The caller supplied a different subscription id.
    Mismatch {
        /// The id the caller supplied.
        supplied: u32,
    },
}

// =============================================================================
// Response payloads
// =============================================================================

/// Read response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReadResponse {
    /// Service result.
    pub service_result: StatusCode,
    /// One value per node read.
    pub results: Vec<DataValue>,
}

/// Write response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WriteResponse {
    /// Service result.
    pub service_result: StatusCode,
    /// One status per node written.
    pub results: Vec<StatusCode>,
}

/// One reference returned by browse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDescription {
    /// Reference type.
    pub reference_type_id: NodeId,
    /// Forward reference flag.
    pub is_forward: bool,
    /// Target node.
    pub node_id: NodeId,
    /// Target browse name.
    pub browse_name: String,
    /// Target display name.
    pub display_name: String,
}

/// Browse result for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BrowseResult {
    /// Status for this node.
    pub status: StatusCode,
    /// Continuation point, if truncated.
    pub continuation_point: Option<Vec<u8>>,
    /// References found.
    pub references: Vec<ReferenceDescription>,
}

/// Browse response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BrowseResponse {
    /// Service result.
    pub service_result: StatusCode,
    /// One result per node browsed.
    pub results: Vec<BrowseResult>,
}

/// CreateSubscription response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSubscriptionResponse {
    /// Service result.
    pub service_result: StatusCode,
    /// Server-assigned id.
    pub subscription_id: u32,
    /// Revised publishing interval.
    pub revised_publishing_interval: Duration,
    /// Revised lifetime count.
    pub revised_lifetime_count: u32,
    /// Revised keep-alive count.
    pub revised_max_keep_alive_count: u32,
}

/// Response carrying one status per operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusListResponse {
    /// Service result.
    pub service_result: StatusCode,
    /// One status per operation.
    pub results: Vec<StatusCode>,
}

/// ModifySubscription response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifySubscriptionResponse {
    /// Service result.
    pub service_result: StatusCode,
    /// Revised publishing interval.
    pub revised_publishing_interval: Duration,
    /// Revised lifetime count.
    pub revised_lifetime_count: u32,
    /// Revised keep-alive count.
    pub revised_max_keep_alive_count: u32,
}

/// Result of one monitored item creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredItemCreateResult {
    /// Status of this item.
    pub status: StatusCode,
    /// Server-assigned id.
    pub monitored_item_id: u32,
    /// Revised sampling interval.
    pub revised_sampling_interval: Duration,
    /// Revised queue size.
    pub revised_queue_size: u32,
}

/// CreateMonitoredItems response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CreateMonitoredItemsResponse {
    /// Service result.
    pub service_result: StatusCode,
    /// One result per item.
    pub results: Vec<MonitoredItemCreateResult>,
}

/// A data change for one monitored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemNotification {
    /// The item's client handle.
    pub client_handle: u32,
    /// New value.
    pub value: DataValue,
}

/// Notification message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NotificationMessage {
    /// Sequence number (0 for keep-alives).
    pub sequence_number: u32,
    /// Data changes.
    pub data_changes: Vec<MonitoredItemNotification>,
}

/// Publish response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Service result.
    pub service_result: StatusCode,
    /// Subscription the message belongs to.
    pub subscription_id: u32,
    /// More notifications are queued server-side.
    pub more_notifications: bool,
    /// The message.
    pub notification_message: NotificationMessage,
}

/// Endpoint description returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescription {
    /// Endpoint URL.
    pub endpoint_url: String,
    /// Security mode.
    pub security_mode: SecurityMode,
    /// Security policy URI.
    pub security_policy_uri: String,
    /// Server certificate (DER).
    pub server_certificate: Option<Vec<u8>>,
    /// Server application URI.
    pub server_uri: String,
}

/// GetEndpoints response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetEndpointsResponse {
    /// Service result.
    pub service_result: StatusCode,
    /// Endpoints offered.
    pub endpoints: Vec<EndpointDescription>,
}

/// Application description returned by FindServers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDescription {
    /// Application URI.
    pub application_uri: String,
    /// Application name.
    pub application_name: String,
    /// Discovery URLs.
    pub discovery_urls: Vec<String>,
}

/// FindServers response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FindServersResponse {
    /// Service result.
    pub service_result: StatusCode,
    /// Servers found.
    pub servers: Vec<ApplicationDescription>,
}

// =============================================================================
// Response
// =============================================================================

/// A service response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", content = "body", rename_all = "snake_case")]
pub enum Response {
    /// Read.
    Read(ReadResponse),
    /// Write.
    Write(WriteResponse),
    /// Browse.
    Browse(BrowseResponse),
    /// CreateSubscription.
    CreateSubscription(CreateSubscriptionResponse),
    /// ModifySubscription.
    ModifySubscription(ModifySubscriptionResponse),
    /// SetPublishingMode.
    SetPublishingMode(StatusListResponse),
    /// TransferSubscriptions.
    TransferSubscriptions(StatusListResponse),
    /// DeleteSubscriptions.
    DeleteSubscriptions(StatusListResponse),
    /// CreateMonitoredItems.
    CreateMonitoredItems(CreateMonitoredItemsResponse),
    /// ModifyMonitoredItems.
    ModifyMonitoredItems(StatusListResponse),
    /// SetMonitoringMode.
    SetMonitoringMode(StatusListResponse),
    /// SetTriggering.
    SetTriggering(StatusListResponse),
    /// DeleteMonitoredItems.
    DeleteMonitoredItems(StatusListResponse),
    /// Publish.
    Publish(PublishResponse),
    /// Republish.
    Republish(NotificationMessage),
    /// GetEndpoints.
    GetEndpoints(GetEndpointsResponse),
    /// FindServers.
    FindServers(FindServersResponse),
    /// The server rejected the request as a whole.
    ServiceFault(StatusCode),
}

impl Response {
    /// Returns the service kind.
    pub const fn kind(&self) -> ServiceKind {
        match self {
            Self::Read(_) => ServiceKind::Read,
            Self::Write(_) => ServiceKind::Write,
            Self::Browse(_) => ServiceKind::Browse,
            Self::CreateSubscription(_) => ServiceKind::CreateSubscription,
            Self::ModifySubscription(_) => ServiceKind::ModifySubscription,
            Self::SetPublishingMode(_) => ServiceKind::SetPublishingMode,
            Self::TransferSubscriptions(_) => ServiceKind::TransferSubscriptions,
            Self::DeleteSubscriptions(_) => ServiceKind::DeleteSubscriptions,
            Self::CreateMonitoredItems(_) => ServiceKind::CreateMonitoredItems,
            Self::ModifyMonitoredItems(_) => ServiceKind::ModifyMonitoredItems,
            Self::SetMonitoringMode(_) => ServiceKind::SetMonitoringMode,
            Self::SetTriggering(_) => ServiceKind::SetTriggering,
            Self::DeleteMonitoredItems(_) => ServiceKind::DeleteMonitoredItems,
            Self::Publish(_) => ServiceKind::Publish,
            Self::Republish(_) => ServiceKind::Republish,
            Self::GetEndpoints(_) => ServiceKind::GetEndpoints,
            Self::FindServers(_) => ServiceKind::FindServers,
            Self::ServiceFault(_) => ServiceKind::ServiceFault,
        }
    }

    /// Returns the overall service result.
    pub fn service_result(&self) -> StatusCode {
        match self {
            Self::Read(r) => r.service_result,
            Self::Write(r) => r.service_result,
            Self::Browse(r) => r.service_result,
            Self::CreateSubscription(r) => r.service_result,
            Self::ModifySubscription(r) => r.service_result,
            Self::SetPublishingMode(r)
            | Self::TransferSubscriptions(r)
            | Self::DeleteSubscriptions(r)
            | Self::ModifyMonitoredItems(r)
            | Self::SetMonitoringMode(r)
            | Self::SetTriggering(r)
            | Self::DeleteMonitoredItems(r) => r.service_result,
            Self::CreateMonitoredItems(r) => r.service_result,
            Self::Publish(r) => r.service_result,
            Self::Republish(_) => StatusCode::GOOD,
            Self::GetEndpoints(r) => r.service_result,
            Self::FindServers(r) => r.service_result,
            Self::ServiceFault(status) => *status,
        }
    }

    /// Returns `true` if this is a fault or carries a bad service result.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::ServiceFault(_)) || self.service_result().is_bad()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn modify(id: u32) -> Request {
        Request::ModifySubscription(ModifySubscriptionRequest {
            subscription_id: id,
            requested_publishing_interval: Duration::from_millis(250),
            requested_lifetime_count: 10,
            requested_max_keep_alive_count: 3,
            max_notifications_per_publish: 0,
            priority: 0,
        })
    }

    #[test]
    fn test_targeted_subscriptions() {
        assert_eq!(modify(7).targeted_subscriptions(), Some(vec![7]));
        assert_eq!(
            Request::Read(ReadRequest::default()).targeted_subscriptions(),
            None
        );
        let delete = Request::DeleteSubscriptions(DeleteSubscriptionsRequest {
            subscription_ids: vec![1, 2],
        });
        assert_eq!(delete.targeted_subscriptions(), Some(vec![1, 2]));
    }

    #[test]
    fn test_stamp_fills_zero_id() {
        let mut request = modify(0);
        request.stamp_subscription(42).unwrap();
        assert_eq!(request.targeted_subscriptions(), Some(vec![42]));
    }

    #[test]
    fn test_stamp_rejects_mismatch() {
        let mut request = modify(5);
        assert_eq!(
            request.stamp_subscription(42),
            Err(StampError::Mismatch { supplied: 5 })
        );
    }

    #[test]
    fn test_stamp_publishing_mode() {
        let mut empty = Request::SetPublishingMode(SetPublishingModeRequest {
            publishing_enabled: false,
            subscription_ids: vec![],
        });
        empty.stamp_subscription(9).unwrap();
        assert_eq!(empty.targeted_subscriptions(), Some(vec![9]));

        let mut two = Request::SetPublishingMode(SetPublishingModeRequest {
            publishing_enabled: false,
            subscription_ids: vec![9, 10],
        });
        assert_eq!(two.stamp_subscription(9), Err(StampError::TooManyIds));
    }

    #[test]
    fn test_stamp_rejects_unscoped_services() {
        let mut delete = Request::DeleteMonitoredItems(DeleteMonitoredItemsRequest {
            subscription_id: 0,
            monitored_item_ids: vec![1],
        });
        assert_eq!(
            delete.stamp_subscription(1),
            Err(StampError::NotAllowed(ServiceKind::DeleteMonitoredItems))
        );

        let mut read = Request::Read(ReadRequest::default());
        assert!(read.stamp_subscription(1).is_err());
    }

    #[test]
    fn test_response_fault() {
        assert!(Response::ServiceFault(StatusCode::BAD_TIMEOUT).is_fault());
        assert!(!Response::Read(ReadResponse::default()).is_fault());
        assert_eq!(
            Response::Write(WriteResponse::default()).kind(),
            ServiceKind::Write
        );
    }

    #[test]
    fn test_request_serializes_tagged() {
        let json = serde_json::to_value(Request::Read(ReadRequest::default())).unwrap();
        assert_eq!(json["service"], "read");
        assert!(json["body"]["nodes_to_read"].as_array().unwrap().is_empty());

        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), ServiceKind::Read);
    }
}
