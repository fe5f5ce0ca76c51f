// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Simulated Engine
//!
//! A [`ProtocolEngine`] backed by an in-memory OPC UA server model.
//!
//! ## Design Principles
//!
//! - Engine methods only validate and enqueue; a background task processes
//!   commands and delivers events, never from inside an engine call
//! - A small address space serves Read, Write and Browse
//! - Subscriptions queue data changes and answer parked Publish requests
//! - Fault injection for activation, channel loss and stalled requests

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use uaflow_client::config::{Certificate, FinalizedConnection, ResolvedIdentity};
use uaflow_client::message::{
    ApplicationDescription, BrowseDirection, BrowseResponse, BrowseResult,
    CreateMonitoredItemsResponse, CreateSubscriptionResponse, EndpointDescription,
    FindServersResponse, GetEndpointsResponse, ModifySubscriptionResponse,
    MonitoredItemCreateResult, MonitoredItemNotification, NotificationMessage, PublishResponse,
    ReadResponse, ReferenceDescription, StatusListResponse, SubscriptionAcknowledgement,
    WriteResponse,
};
use uaflow_client::{
    AttributeId, ChannelConfigId, ConnectionHandle, DataValue, EngineContext, EngineEvent,
    EventSink, NodeId, ProtocolEngine, Request, Response, ReverseEndpointId, ServiceKind,
    SessionId, StatusCode, Variant,
};

// =============================================================================
// Well-known nodes
// =============================================================================

/// Nodes served by the simulated address space.
pub struct SimNodes;

impl SimNodes {
    /// Objects folder, the browse root.
    pub fn objects_folder() -> NodeId {
        NodeId::numeric(0, 85)
    }

    /// Server object.
    pub fn server() -> NodeId {
        NodeId::numeric(0, 2253)
    }

    /// Read-only temperature value (Double).
    pub fn temperature() -> NodeId {
        NodeId::numeric(1, 1001)
    }

    /// Read-only device name (String).
    pub fn device_name() -> NodeId {
        NodeId::string(1, "Device.Name")
    }

    /// Writable setpoint (Int32).
    pub fn setpoint() -> NodeId {
        NodeId::numeric(1, 1012)
    }

    /// Writable running flag (Boolean).
    pub fn running() -> NodeId {
        NodeId::string(1, "Line.Running")
    }
}

// =============================================================================
// Server model
// =============================================================================

/// Static settings of the simulated server.
#[derive(Debug, Clone)]
pub struct SimServerConfig {
    /// Application URI reported by discovery.
    pub application_uri: String,
    /// Application name reported by discovery.
    pub application_name: String,
    /// Server certificate DER.
    pub certificate_der: Vec<u8>,
    /// Publishing intervals below this are revised up.
    pub min_publishing_interval: Duration,
    /// Accepted user names and passwords.
    pub users: HashMap<String, String>,
}

impl Default for SimServerConfig {
    fn default() -> Self {
        Self {
            application_uri: "urn:uaflow:simulated-server".to_string(),
            application_name: "Simulated Server".to_string(),
            certificate_der: b"simulated-server-certificate".to_vec(),
            min_publishing_interval: Duration::from_millis(100),
            users: HashMap::from([("operator".to_string(), "secret".to_string())]),
        }
    }
}

#[derive(Debug, Clone)]
struct SimNode {
    browse_name: String,
    value: DataValue,
    writable: bool,
}

#[derive(Debug)]
struct SimSession {
    connection: ConnectionHandle,
    channel: ChannelConfigId,
    online: bool,
}

#[derive(Debug, Clone)]
struct SimItem {
    id: u32,
    node: NodeId,
    client_handle: u32,
}

#[derive(Debug)]
struct SimSubscription {
    session: SessionId,
    items: Vec<SimItem>,
    pending: Vec<MonitoredItemNotification>,
    next_sequence: u32,
}

enum Command {
    Activate {
        channel: ChannelConfigId,
        connection: ConnectionHandle,
        identity: ResolvedIdentity,
    },
    CloseSession {
        session: SessionId,
    },
    Session {
        session: SessionId,
        request: Request,
        context: EngineContext,
    },
    Discovery {
        channel: ChannelConfigId,
        request: Request,
        context: EngineContext,
    },
    CloseReverse {
        endpoint: ReverseEndpointId,
    },
    Interrupt {
        connection: ConnectionHandle,
    },
    Restore {
        connection: ConnectionHandle,
    },
    Kill {
        connection: ConnectionHandle,
        status: StatusCode,
    },
    Resume,
    Flush,
}

struct ServerState {
    config: SimServerConfig,
    certificate: Certificate,
    sink: Option<EventSink>,
    next_id: u32,
    channels: HashMap<ChannelConfigId, FinalizedConnection>,
    reverse_endpoints: HashMap<ReverseEndpointId, String>,
    sessions: HashMap<SessionId, SimSession>,
    nodes: HashMap<NodeId, SimNode>,
    subscriptions: HashMap<u32, SimSubscription>,
    parked_publishes: VecDeque<(SessionId, EngineContext)>,
    acknowledgements: Vec<SubscriptionAcknowledgement>,
    activation_failure: Option<StatusCode>,
    send_failure: Option<StatusCode>,
    stalled: bool,
    held: Vec<Command>,
    received: Vec<ServiceKind>,
    activations: u32,
    closed_sessions: u32,
}

impl ServerState {
    fn new(config: SimServerConfig) -> Self {
        let certificate = Certificate::from_der(config.certificate_der.clone());
        let mut state = Self {
            config,
            certificate,
            sink: None,
            next_id: 0,
            channels: HashMap::new(),
            reverse_endpoints: HashMap::new(),
            sessions: HashMap::new(),
            nodes: HashMap::new(),
            subscriptions: HashMap::new(),
            parked_publishes: VecDeque::new(),
            acknowledgements: Vec::new(),
            activation_failure: None,
            send_failure: None,
            stalled: false,
            held: Vec::new(),
            received: Vec::new(),
            activations: 0,
            closed_sessions: 0,
        };
        state.add_node(SimNodes::temperature(), "Temperature", Variant::Double(21.5), false);
        state.add_node(
            SimNodes::device_name(),
            "DeviceName",
            Variant::String("press-01".to_string()),
            false,
        );
        state.add_node(SimNodes::setpoint(), "Setpoint", Variant::Int32(0), true);
        state.add_node(SimNodes::running(), "Running", Variant::Boolean(false), true);
        state
    }

    fn add_node(&mut self, node: NodeId, browse_name: &str, value: Variant, writable: bool) {
        self.nodes.insert(
            node,
            SimNode {
                browse_name: browse_name.to_string(),
                value: DataValue::new(value),
                writable,
            },
        );
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn session_of(&self, connection: ConnectionHandle) -> Option<SessionId> {
        self.sessions
            .iter()
            .find(|(_, session)| session.connection == connection)
            .map(|(id, _)| *id)
    }

    // =========================================================================
    // Command processing
    // =========================================================================

    fn handle(&mut self, command: Command) -> Vec<EngineEvent> {
        if self.stalled && matches!(command, Command::Session { .. } | Command::Discovery { .. }) {
            let parks_publish = matches!(&command, Command::Session { request: Request::Publish(_), .. });
            if !parks_publish {
                self.held.push(command);
                return Vec::new();
            }
        }

        let mut events = match command {
            Command::Activate {
                channel,
                connection,
                identity,
            } => self.activate(channel, connection, &identity),
            Command::CloseSession { session } => self.close_session(session, StatusCode::GOOD),
            Command::Session {
                session,
                request,
                context,
            } => self.session_request(session, request, context),
            Command::Discovery {
                channel,
                request,
                context,
            } => self.discovery_request(channel, request, context),
            Command::CloseReverse { endpoint } => {
                self.reverse_endpoints.remove(&endpoint);
                vec![EngineEvent::ReverseEndpointClosed { endpoint }]
            }
            Command::Interrupt { connection } => self.interrupt(connection),
            Command::Restore { connection } => self.restore(connection),
            Command::Kill { connection, status } => match self.session_of(connection) {
                Some(session) => self.close_session(session, status),
                None => Vec::new(),
            },
            Command::Resume => {
                self.stalled = false;
                let held = std::mem::take(&mut self.held);
                held.into_iter().flat_map(|command| self.handle(command)).collect()
            }
            Command::Flush => Vec::new(),
        };
        events.extend(self.answer_publishes());
        events
    }

    fn activate(
        &mut self,
        channel: ChannelConfigId,
        connection: ConnectionHandle,
        identity: &ResolvedIdentity,
    ) -> Vec<EngineEvent> {
        let Some(config) = self.channels.get(&channel) else {
            return vec![EngineEvent::SessionActivationFailure {
                connection,
                status: StatusCode::BAD_SERVER_NOT_CONNECTED,
            }];
        };

        if let Some(pinned) = &config.server_certificate {
            if pinned.thumbprint != self.certificate.thumbprint {
                tracing::debug!(%connection, "Pinned server certificate does not match");
                return vec![EngineEvent::SessionActivationFailure {
                    connection,
                    status: StatusCode::BAD_CERTIFICATE_INVALID,
                }];
            }
        }

        let mut events = vec![
            EngineEvent::ChannelOpened { connection },
            EngineEvent::SessionCreated { connection },
        ];

        if let Some(status) = self.activation_failure {
            events.push(EngineEvent::SessionActivationFailure { connection, status });
            return events;
        }

        if let ResolvedIdentity::UserName { username, password } = identity {
            let accepted = self
                .config
                .users
                .get(username)
                .is_some_and(|expected| expected == password.expose());
            if !accepted {
                events.push(EngineEvent::SessionActivationFailure {
                    connection,
                    status: StatusCode::BAD_USER_ACCESS_DENIED,
                });
                return events;
            }
        }

        let session = SessionId(self.next_id());
        self.sessions.insert(
            session,
            SimSession {
                connection,
                channel,
                online: true,
            },
        );
        self.activations += 1;
        events.push(EngineEvent::SessionActivated {
            connection,
            session,
        });
        events
    }

    fn close_session(&mut self, session: SessionId, status: StatusCode) -> Vec<EngineEvent> {
        let Some(closed) = self.sessions.remove(&session) else {
            return Vec::new();
        };
        self.closed_sessions += 1;
        self.subscriptions.retain(|_, sub| sub.session != session);

        // The close is reported before the requests it cut off.
        let mut events = vec![EngineEvent::SessionClosed {
            connection: closed.connection,
            status,
        }];
        let parked = std::mem::take(&mut self.parked_publishes);
        for (owner, context) in parked {
            if owner == session {
                events.push(EngineEvent::SendRequestFailed {
                    context,
                    status: StatusCode::BAD_SESSION_CLOSED,
                });
            } else {
                self.parked_publishes.push_back((owner, context));
            }
        }
        events
    }

    fn interrupt(&mut self, connection: ConnectionHandle) -> Vec<EngineEvent> {
        let Some(session) = self.session_of(connection) else {
            return Vec::new();
        };
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.online = false;
        }
        vec![EngineEvent::SessionReactivating { connection }]
    }

    fn restore(&mut self, connection: ConnectionHandle) -> Vec<EngineEvent> {
        let Some(session) = self.session_of(connection) else {
            return Vec::new();
        };
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.online = true;
        }
        vec![EngineEvent::SessionActivated {
            connection,
            session,
        }]
    }

    fn session_request(
        &mut self,
        session: SessionId,
        request: Request,
        context: EngineContext,
    ) -> Vec<EngineEvent> {
        self.received.push(request.kind());

        let channel = match self.sessions.get(&session) {
            Some(entry) if entry.online => entry.channel,
            Some(_) => {
                return vec![EngineEvent::SendRequestFailed {
                    context,
                    status: StatusCode::BAD_SECURE_CHANNEL_CLOSED,
                }]
            }
            None => {
                return vec![EngineEvent::SendRequestFailed {
                    context,
                    status: StatusCode::BAD_SESSION_ID_INVALID,
                }]
            }
        };

        if let Some(status) = self.send_failure {
            return vec![EngineEvent::SendRequestFailed { context, status }];
        }

        let response = match request {
            Request::Publish(publish) => {
                self.acknowledgements.extend(publish.acknowledgements);
                self.parked_publishes.push_back((session, context));
                return Vec::new();
            }
            Request::Read(read) => Response::Read(ReadResponse {
                service_result: StatusCode::GOOD,
                results: read
                    .nodes_to_read
                    .iter()
                    .map(|item| self.read_value(&item.node_id, item.attribute_id))
                    .collect(),
            }),
            Request::Write(write) => Response::Write(WriteResponse {
                service_result: StatusCode::GOOD,
                results: write
                    .nodes_to_write
                    .into_iter()
                    .map(|item| self.write_value(item.node_id, item.attribute_id, item.value))
                    .collect(),
            }),
            Request::Browse(browse) => Response::Browse(BrowseResponse {
                service_result: StatusCode::GOOD,
                results: browse
                    .nodes_to_browse
                    .iter()
                    .map(|description| self.browse(&description.node_id, description.direction))
                    .collect(),
            }),
            Request::CreateSubscription(create) => {
                let subscription_id = self.next_id();
                self.subscriptions.insert(
                    subscription_id,
                    SimSubscription {
                        session,
                        items: Vec::new(),
                        pending: Vec::new(),
                        next_sequence: 1,
                    },
                );
                Response::CreateSubscription(CreateSubscriptionResponse {
                    service_result: StatusCode::GOOD,
                    subscription_id,
                    revised_publishing_interval: self
                        .revise_interval(create.requested_publishing_interval),
                    revised_lifetime_count: create.requested_lifetime_count,
                    revised_max_keep_alive_count: create.requested_max_keep_alive_count,
                })
            }
            Request::ModifySubscription(modify) => {
                let service_result = self.subscription_status(modify.subscription_id);
                Response::ModifySubscription(ModifySubscriptionResponse {
                    service_result,
                    revised_publishing_interval: self
                        .revise_interval(modify.requested_publishing_interval),
                    revised_lifetime_count: modify.requested_lifetime_count,
                    revised_max_keep_alive_count: modify.requested_max_keep_alive_count,
                })
            }
            Request::SetPublishingMode(mode) => {
                Response::SetPublishingMode(self.per_subscription(&mode.subscription_ids))
            }
            Request::TransferSubscriptions(transfer) => {
                Response::TransferSubscriptions(self.per_subscription(&transfer.subscription_ids))
            }
            Request::DeleteSubscriptions(delete) => {
                let response = self.per_subscription(&delete.subscription_ids);
                for id in &delete.subscription_ids {
                    self.subscriptions.remove(id);
                }
                Response::DeleteSubscriptions(response)
            }
            Request::CreateMonitoredItems(create) => {
                if !self.subscriptions.contains_key(&create.subscription_id) {
                    return vec![EngineEvent::SessionResponse {
                        context,
                        response: Response::CreateMonitoredItems(CreateMonitoredItemsResponse {
                            service_result: StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
                            results: Vec::new(),
                        }),
                    }];
                }
                let interval = self.config.min_publishing_interval;
                let mut results = Vec::with_capacity(create.items_to_create.len());
                for item in create.items_to_create {
                    let node = item.item_to_monitor.node_id;
                    let Some(value) = self.nodes.get(&node).map(|n| n.value.clone()) else {
                        results.push(MonitoredItemCreateResult {
                            status: StatusCode::BAD_NODE_ID_UNKNOWN,
                            monitored_item_id: 0,
                            revised_sampling_interval: Duration::ZERO,
                            revised_queue_size: 0,
                        });
                        continue;
                    };
                    let id = self.next_id();
                    if let Some(sub) = self.subscriptions.get_mut(&create.subscription_id) {
                        sub.items.push(SimItem {
                            id,
                            node,
                            client_handle: item.client_handle,
                        });
                        sub.pending.push(MonitoredItemNotification {
                            client_handle: item.client_handle,
                            value,
                        });
                    }
                    results.push(MonitoredItemCreateResult {
                        status: StatusCode::GOOD,
                        monitored_item_id: id,
                        revised_sampling_interval: item.sampling_interval.unwrap_or(interval),
                        revised_queue_size: item.queue_size.max(1),
                    });
                }
                Response::CreateMonitoredItems(CreateMonitoredItemsResponse {
                    service_result: StatusCode::GOOD,
                    results,
                })
            }
            Request::ModifyMonitoredItems(modify) => {
                let ids: Vec<u32> = modify.items_to_modify.iter().map(|i| i.monitored_item_id).collect();
                Response::ModifyMonitoredItems(self.per_item(modify.subscription_id, &ids, false))
            }
            Request::SetMonitoringMode(mode) => Response::SetMonitoringMode(self.per_item(
                mode.subscription_id,
                &mode.monitored_item_ids,
                false,
            )),
            Request::SetTriggering(triggering) => Response::SetTriggering(self.per_item(
                triggering.subscription_id,
                &triggering.links_to_add,
                false,
            )),
            Request::DeleteMonitoredItems(delete) => Response::DeleteMonitoredItems(self.per_item(
                delete.subscription_id,
                &delete.monitored_item_ids,
                true,
            )),
            Request::Republish(_) => Response::ServiceFault(StatusCode::BAD_SERVICE_UNSUPPORTED),
            discovery @ (Request::GetEndpoints(_) | Request::FindServers(_)) => {
                self.discovery_response(channel, discovery)
            }
        };

        vec![EngineEvent::SessionResponse { context, response }]
    }

    fn discovery_request(
        &mut self,
        channel: ChannelConfigId,
        request: Request,
        context: EngineContext,
    ) -> Vec<EngineEvent> {
        self.received.push(request.kind());
        if let Some(status) = self.send_failure {
            return vec![EngineEvent::SendRequestFailed { context, status }];
        }
        let response = self.discovery_response(channel, request);
        vec![EngineEvent::DiscoveryResponse { context, response }]
    }

    fn discovery_response(&self, channel: ChannelConfigId, request: Request) -> Response {
        let endpoint_url = self
            .channels
            .get(&channel)
            .map(|config| config.endpoint_url.clone())
            .unwrap_or_default();
        match request {
            Request::GetEndpoints(_) => Response::GetEndpoints(GetEndpointsResponse {
                service_result: StatusCode::GOOD,
                endpoints: [
                    (uaflow_client::SecurityMode::None, uaflow_client::SecurityPolicy::None),
                    (
                        uaflow_client::SecurityMode::SignAndEncrypt,
                        uaflow_client::SecurityPolicy::Basic256Sha256,
                    ),
                ]
                .into_iter()
                .map(|(security_mode, policy)| EndpointDescription {
                    endpoint_url: endpoint_url.clone(),
                    security_mode,
                    security_policy_uri: policy.uri().to_string(),
                    server_certificate: Some(self.certificate.der.clone()),
                    server_uri: self.config.application_uri.clone(),
                })
                .collect(),
            }),
            Request::FindServers(find) => {
                let matches = find.server_uris.is_empty()
                    || find.server_uris.contains(&self.config.application_uri);
                Response::FindServers(FindServersResponse {
                    service_result: StatusCode::GOOD,
                    servers: matches
                        .then(|| ApplicationDescription {
                            application_uri: self.config.application_uri.clone(),
                            application_name: self.config.application_name.clone(),
                            discovery_urls: vec![endpoint_url],
                        })
                        .into_iter()
                        .collect(),
                })
            }
            _ => Response::ServiceFault(StatusCode::BAD_SERVICE_UNSUPPORTED),
        }
    }

    // =========================================================================
    // Address space
    // =========================================================================

    fn read_value(&self, node: &NodeId, attribute: AttributeId) -> DataValue {
        let Some(entry) = self.nodes.get(node) else {
            return DataValue::bad(StatusCode::BAD_NODE_ID_UNKNOWN);
        };
        let mut value = match attribute {
            AttributeId::Value => entry.value.clone(),
            AttributeId::BrowseName | AttributeId::DisplayName => {
                DataValue::new(Variant::String(entry.browse_name.clone()))
            }
            AttributeId::NodeId => DataValue::new(Variant::NodeId(node.clone())),
            _ => return DataValue::bad(StatusCode::BAD_ATTRIBUTE_ID_INVALID),
        };
        value.server_timestamp = Some(Utc::now());
        value
    }

    fn write_value(&mut self, node: NodeId, attribute: AttributeId, value: DataValue) -> StatusCode {
        if attribute != AttributeId::Value {
            return StatusCode::BAD_ATTRIBUTE_ID_INVALID;
        }
        let Some(entry) = self.nodes.get_mut(&node) else {
            return StatusCode::BAD_NODE_ID_UNKNOWN;
        };
        if !entry.writable {
            return StatusCode::BAD_NOT_WRITABLE;
        }
        entry.value = value;
        let stored = entry.value.clone();
        self.notify(&node, stored);
        StatusCode::GOOD
    }

    fn notify(&mut self, node: &NodeId, value: DataValue) {
        for sub in self.subscriptions.values_mut() {
            let handles: Vec<u32> = sub
                .items
                .iter()
                .filter(|item| &item.node == node)
                .map(|item| item.client_handle)
                .collect();
            for client_handle in handles {
                sub.pending.push(MonitoredItemNotification {
                    client_handle,
                    value: value.clone(),
                });
            }
        }
    }

    fn browse(&self, node: &NodeId, direction: BrowseDirection) -> BrowseResult {
        if *node != SimNodes::objects_folder() {
            let status = if self.nodes.contains_key(node) || *node == SimNodes::server() {
                StatusCode::GOOD
            } else {
                StatusCode::BAD_NODE_ID_UNKNOWN
            };
            return BrowseResult {
                status,
                continuation_point: None,
                references: Vec::new(),
            };
        }
        if direction == BrowseDirection::Inverse {
            return BrowseResult {
                status: StatusCode::GOOD,
                continuation_point: None,
                references: Vec::new(),
            };
        }

        let organizes = NodeId::numeric(0, 35);
        let mut references = vec![ReferenceDescription {
            reference_type_id: organizes.clone(),
            is_forward: true,
            node_id: SimNodes::server(),
            browse_name: "Server".to_string(),
            display_name: "Server".to_string(),
        }];
        let mut children: Vec<(&NodeId, &SimNode)> = self.nodes.iter().collect();
        children.sort_by(|a, b| a.1.browse_name.cmp(&b.1.browse_name));
        references.extend(children.into_iter().map(|(id, node)| ReferenceDescription {
            reference_type_id: organizes.clone(),
            is_forward: true,
            node_id: id.clone(),
            browse_name: node.browse_name.clone(),
            display_name: node.browse_name.clone(),
        }));
        BrowseResult {
            status: StatusCode::GOOD,
            continuation_point: None,
            references,
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    fn revise_interval(&self, requested: Duration) -> Duration {
        requested.max(self.config.min_publishing_interval)
    }

    fn subscription_status(&self, id: u32) -> StatusCode {
        if self.subscriptions.contains_key(&id) {
            StatusCode::GOOD
        } else {
            StatusCode::BAD_SUBSCRIPTION_ID_INVALID
        }
    }

    fn per_subscription(&self, ids: &[u32]) -> StatusListResponse {
        StatusListResponse {
            service_result: StatusCode::GOOD,
            results: ids.iter().map(|id| self.subscription_status(*id)).collect(),
        }
    }

    fn per_item(&mut self, subscription_id: u32, ids: &[u32], remove: bool) -> StatusListResponse {
        let Some(sub) = self.subscriptions.get_mut(&subscription_id) else {
            return StatusListResponse {
                service_result: StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
                results: Vec::new(),
            };
        };
        let results = ids
            .iter()
            .map(|id| match sub.items.iter().position(|item| item.id == *id) {
                Some(index) => {
                    if remove {
                        sub.items.remove(index);
                    }
                    StatusCode::GOOD
                }
                None => StatusCode::BAD_MONITORED_ITEM_ID_INVALID,
            })
            .collect();
        StatusListResponse {
            service_result: StatusCode::GOOD,
            results,
        }
    }

    /// Answers parked Publish requests for subscriptions with queued changes,
    /// and rejects those whose session has no subscription left.
    fn answer_publishes(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let mut still_parked = VecDeque::new();

        while let Some((session, context)) = self.parked_publishes.pop_front() {
            let online = self.sessions.get(&session).is_some_and(|s| s.online);
            let owned: Vec<u32> = self
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.session == session)
                .map(|(id, _)| *id)
                .collect();

            if owned.is_empty() {
                events.push(EngineEvent::SessionResponse {
                    context,
                    response: Response::Publish(PublishResponse {
                        service_result: StatusCode::BAD_NO_SUBSCRIPTION,
                        subscription_id: 0,
                        more_notifications: false,
                        notification_message: NotificationMessage::default(),
                    }),
                });
                continue;
            }

            let ready = owned.into_iter().find(|id| {
                self.subscriptions
                    .get(id)
                    .is_some_and(|sub| !sub.pending.is_empty())
            });
            match (online, ready.and_then(|id| self.subscriptions.get_mut(&id).map(|s| (id, s)))) {
                (true, Some((subscription_id, sub))) => {
                    let sequence_number = sub.next_sequence;
                    sub.next_sequence += 1;
                    let data_changes = std::mem::take(&mut sub.pending);
                    events.push(EngineEvent::SessionResponse {
                        context,
                        response: Response::Publish(PublishResponse {
                            service_result: StatusCode::GOOD,
                            subscription_id,
                            more_notifications: false,
                            notification_message: NotificationMessage {
                                sequence_number,
                                data_changes,
                            },
                        }),
                    });
                }
                _ => still_parked.push_back((session, context)),
            }
        }

        self.parked_publishes = still_parked;
        events
    }
}

// =============================================================================
// SimulatedEngine
// =============================================================================

/// Engine double that simulates a server.
///
/// Must be created inside a Tokio runtime; events are delivered from a
/// spawned task.
pub struct SimulatedEngine {
    state: Arc<Mutex<ServerState>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SimulatedEngine {
    /// Creates an engine serving the default simulated server.
    pub fn new() -> Self {
        Self::with_server(SimServerConfig::default())
    }

    /// Creates an engine serving the given server settings.
    pub fn with_server(config: SimServerConfig) -> Self {
        let state = Arc::new(Mutex::new(ServerState::new(config)));
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run(Arc::clone(&state), receiver));
        Self { state, commands }
    }

    fn enqueue(&self, command: Command) -> Result<(), StatusCode> {
        self.commands
            .send(command)
            .map_err(|_| StatusCode::BAD_SERVER_NOT_CONNECTED)
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Fails every later session activation with `status`.
    pub fn fail_activation(&self, status: StatusCode) {
        self.state.lock().activation_failure = Some(status);
    }

    /// Fails every later request with `status`.
    pub fn fail_requests(&self, status: StatusCode) {
        self.state.lock().send_failure = Some(status);
    }

    /// Holds service requests (except Publish) until [`resume`](Self::resume).
    pub fn stall(&self) {
        self.state.lock().stalled = true;
    }

    /// Processes held requests and stops holding new ones.
    pub fn resume(&self) {
        let _ = self.enqueue(Command::Resume);
    }

    /// Simulates a lost channel; the session starts reactivating.
    pub fn interrupt(&self, connection: ConnectionHandle) {
        let _ = self.enqueue(Command::Interrupt { connection });
    }

    /// Ends a simulated channel loss; the session is reactivated.
    pub fn restore(&self, connection: ConnectionHandle) {
        let _ = self.enqueue(Command::Restore { connection });
    }

    /// Closes the connection's session from the server side.
    pub fn kill_session(&self, connection: ConnectionHandle, status: StatusCode) {
        let _ = self.enqueue(Command::Kill { connection, status });
    }

    /// Changes a node value as if the device updated it, notifying monitors.
    pub fn set_value(&self, node: &NodeId, value: Variant) {
        {
            let mut state = self.state.lock();
            let stored = DataValue::new(value).with_source_timestamp(Utc::now());
            if let Some(entry) = state.nodes.get_mut(node) {
                entry.value = stored.clone();
            }
            state.notify(node, stored);
        }
        let _ = self.enqueue(Command::Flush);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Current value of a node.
    pub fn value(&self, node: &NodeId) -> Option<DataValue> {
        self.state.lock().nodes.get(node).map(|n| n.value.clone())
    }

    /// Certificate the simulated server presents.
    pub fn server_certificate(&self) -> Certificate {
        self.state.lock().certificate.clone()
    }

    /// Services received on sessions and discovery channels, in order.
    pub fn received(&self) -> Vec<ServiceKind> {
        self.state.lock().received.clone()
    }

    /// Number of received requests of one service.
    pub fn received_count(&self, kind: ServiceKind) -> usize {
        self.received().iter().filter(|k| **k == kind).count()
    }

    /// Acknowledgements carried by Publish requests so far.
    pub fn acknowledgements(&self) -> Vec<SubscriptionAcknowledgement> {
        self.state.lock().acknowledgements.clone()
    }

    /// Publish requests currently held by the server.
    pub fn parked_publishes(&self) -> usize {
        self.state.lock().parked_publishes.len()
    }

    /// Successful session activations, not counting reactivations.
    pub fn activations(&self) -> u32 {
        self.state.lock().activations
    }

    /// Sessions closed so far.
    pub fn closed_sessions(&self) -> u32 {
        self.state.lock().closed_sessions
    }

    /// Live sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Registered channel configurations.
    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Open reverse listeners, by URL.
    pub fn reverse_endpoints(&self) -> Vec<String> {
        self.state.lock().reverse_endpoints.values().cloned().collect()
    }

    /// Subscriptions alive on the server.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Monitored items alive on the server.
    pub fn monitored_item_count(&self) -> usize {
        self.state
            .lock()
            .subscriptions
            .values()
            .map(|sub| sub.items.len())
            .sum()
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimulatedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimulatedEngine")
            .field("channels", &state.channels.len())
            .field("sessions", &state.sessions.len())
            .field("subscriptions", &state.subscriptions.len())
            .finish()
    }
}

/// Processes commands and delivers the resulting events outside the state
/// lock.
async fn run(state: Arc<Mutex<ServerState>>, mut receiver: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = receiver.recv().await {
        let (sink, events) = {
            let mut state = state.lock();
            let events = state.handle(command);
            (state.sink.clone(), events)
        };
        let Some(sink) = sink else {
            continue;
        };
        for event in events {
            tracing::trace!(event = event.name(), "Simulated engine event");
            sink.deliver(event);
        }
    }
}

impl ProtocolEngine for SimulatedEngine {
    fn attach(&self, sink: EventSink) {
        self.state.lock().sink = Some(sink);
    }

    fn add_channel_config(&self, config: &FinalizedConnection) -> Result<ChannelConfigId, StatusCode> {
        let mut state = self.state.lock();
        let id = ChannelConfigId(state.next_id());
        state.channels.insert(id, config.clone());
        Ok(id)
    }

    fn add_reverse_endpoint(&self, url: &str) -> Result<ReverseEndpointId, StatusCode> {
        if !url.starts_with("opc.tcp://") {
            return Err(StatusCode::BAD_UNEXPECTED_ERROR);
        }
        let mut state = self.state.lock();
        let id = ReverseEndpointId(state.next_id());
        state.reverse_endpoints.insert(id, url.to_string());
        Ok(id)
    }

    fn close_reverse_endpoint(&self, endpoint: ReverseEndpointId) {
        let _ = self.enqueue(Command::CloseReverse { endpoint });
    }

    fn activate_session(
        &self,
        channel: ChannelConfigId,
        _reverse: Option<ReverseEndpointId>,
        connection: ConnectionHandle,
        identity: &ResolvedIdentity,
    ) -> Result<(), StatusCode> {
        if !self.state.lock().channels.contains_key(&channel) {
            return Err(StatusCode::BAD_INVALID_STATE);
        }
        self.enqueue(Command::Activate {
            channel,
            connection,
            identity: identity.clone(),
        })
    }

    fn close_session(&self, session: SessionId) -> Result<(), StatusCode> {
        self.enqueue(Command::CloseSession { session })
    }

    fn send_session_request(
        &self,
        session: SessionId,
        request: Request,
        context: EngineContext,
    ) -> Result<(), StatusCode> {
        if !self.state.lock().sessions.contains_key(&session) {
            return Err(StatusCode::BAD_SESSION_ID_INVALID);
        }
        self.enqueue(Command::Session {
            session,
            request,
            context,
        })
    }

    fn send_discovery_request(
        &self,
        channel: ChannelConfigId,
        request: Request,
        context: EngineContext,
    ) -> Result<(), StatusCode> {
        if !self.state.lock().channels.contains_key(&channel) {
            return Err(StatusCode::BAD_INVALID_STATE);
        }
        self.enqueue(Command::Discovery {
            channel,
            request,
            context,
        })
    }

    fn clear_channels(&self) {
        self.state.lock().channels.clear();
    }
}
