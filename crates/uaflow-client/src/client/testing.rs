// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! In-crate engine double for unit tests. Records calls, never raises events.

use std::time::Duration;

use parking_lot::Mutex;

use super::request::RequestContext;
use crate::config::{FinalizedConnection, ResolvedIdentity};
use crate::engine::{
    ChannelConfigId, ContextScope, EngineContext, EventSink, ProtocolEngine, ReverseEndpointId,
    SessionId,
};
use crate::message::{Request, ServiceKind, SubscriptionAcknowledgement};
use crate::types::{SecurityMode, SecurityPolicy, StatusCode};

use super::ConnectionHandle;

pub(crate) fn finalized() -> FinalizedConnection {
    FinalizedConnection {
        endpoint_url: "opc.tcp://localhost:4841".into(),
        security_mode: SecurityMode::None,
        security_policy: SecurityPolicy::None,
        client_certificate: None,
        client_private_key: None,
        server_certificate: None,
        identity: ResolvedIdentity::Anonymous,
        reverse_url: None,
        request_timeout: Duration::from_secs(1),
        session_timeout: Duration::from_secs(60),
    }
}

#[derive(Default)]
struct Recorded {
    next_id: u32,
    activation_failure: Option<StatusCode>,
    send_failure: Option<StatusCode>,
    close_failure: Option<StatusCode>,
    sent: Vec<(Request, EngineContext)>,
    activations: Vec<ConnectionHandle>,
    closed_sessions: Vec<SessionId>,
    channels: u32,
    sink: Option<EventSink>,
}

#[derive(Default)]
pub(crate) struct RecordingEngine {
    inner: Mutex<Recorded>,
}

impl RecordingEngine {
    pub(crate) fn fail_activation(&self, status: StatusCode) {
        self.inner.lock().activation_failure = Some(status);
    }

    pub(crate) fn fail_sends(&self, status: StatusCode) {
        self.inner.lock().send_failure = Some(status);
    }

    pub(crate) fn fail_close(&self, status: Option<StatusCode>) {
        self.inner.lock().close_failure = status;
    }

    pub(crate) fn closed_sessions(&self) -> Vec<SessionId> {
        self.inner.lock().closed_sessions.clone()
    }

    pub(crate) fn activations(&self) -> Vec<ConnectionHandle> {
        self.inner.lock().activations.clone()
    }

    pub(crate) fn sent(&self) -> Vec<ServiceKind> {
        self.inner.lock().sent.iter().map(|(r, _)| r.kind()).collect()
    }

    pub(crate) fn channel_count(&self) -> u32 {
        self.inner.lock().channels
    }

    pub(crate) fn publish_count(&self) -> usize {
        self.sent()
            .iter()
            .filter(|kind| **kind == ServiceKind::Publish)
            .count()
    }

    /// Operation id of the most recent internal request.
    pub(crate) fn last_operation(&self) -> Option<u64> {
        self.inner
            .lock()
            .sent
            .iter()
            .rev()
            .find_map(|(_, ctx)| match &ctx.scope {
                ContextScope::Application(RequestContext::NoSync { operation }) => Some(*operation),
                _ => None,
            })
    }

    pub(crate) fn last_publish_acks(&self) -> Vec<SubscriptionAcknowledgement> {
        self.inner
            .lock()
            .sent
            .iter()
            .rev()
            .find_map(|(request, _)| match request {
                Request::Publish(publish) => Some(publish.acknowledgements.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Removes and returns recorded requests with their contexts.
    pub(crate) fn take_sent(&self) -> Vec<(Request, EngineContext)> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    pub(crate) fn sink(&self) -> Option<EventSink> {
        self.inner.lock().sink.clone()
    }

    fn next_id(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        inner.next_id
    }
}

impl ProtocolEngine for RecordingEngine {
    fn attach(&self, sink: EventSink) {
        self.inner.lock().sink = Some(sink);
    }

    fn add_channel_config(&self, _config: &FinalizedConnection) -> Result<ChannelConfigId, StatusCode> {
        self.inner.lock().channels += 1;
        Ok(ChannelConfigId(self.next_id()))
    }

    fn add_reverse_endpoint(&self, _url: &str) -> Result<ReverseEndpointId, StatusCode> {
        Ok(ReverseEndpointId(self.next_id()))
    }

    fn close_reverse_endpoint(&self, _endpoint: ReverseEndpointId) {}

    fn activate_session(
        &self,
        _channel: ChannelConfigId,
        _reverse: Option<ReverseEndpointId>,
        connection: ConnectionHandle,
        _identity: &ResolvedIdentity,
    ) -> Result<(), StatusCode> {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.activation_failure {
            return Err(status);
        }
        inner.activations.push(connection);
        Ok(())
    }

    fn close_session(&self, session: SessionId) -> Result<(), StatusCode> {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.close_failure {
            return Err(status);
        }
        inner.closed_sessions.push(session);
        Ok(())
    }

    fn send_session_request(
        &self,
        _session: SessionId,
        request: Request,
        context: EngineContext,
    ) -> Result<(), StatusCode> {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.send_failure {
            return Err(status);
        }
        inner.sent.push((request, context));
        Ok(())
    }

    fn send_discovery_request(
        &self,
        _channel: ChannelConfigId,
        request: Request,
        context: EngineContext,
    ) -> Result<(), StatusCode> {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.send_failure {
            return Err(status);
        }
        inner.sent.push((request, context));
        Ok(())
    }

    fn clear_channels(&self) {
        self.inner.lock().channels = 0;
    }
}
