// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Typed service helpers.
//!
//! Thin wrappers over [`ClientRuntime::service_sync`] and
//! [`ClientRuntime::discovery_service_sync`] that build the request, check
//! the service result and unwrap the matching response variant.

use crate::client::{ClientRuntime, ConfigId, ConnectionHandle};
use crate::error::{ClientError, ClientResult, RequestError};
use crate::message::{
    BrowseDescription, BrowseDirection, BrowseRequest, EndpointDescription, GetEndpointsRequest,
    ReadRequest, ReadValueId, ReferenceDescription, Request, Response, ServiceKind, WriteRequest,
    WriteValue,
};
use crate::types::{AttributeId, DataValue, NodeId, StatusCode};

impl ClientRuntime {
    /// Reads the Value attribute of each node.
    ///
    /// Results come back in request order. Per-node failures are reported in
    /// each [`DataValue::status`]; only a bad service result is an error.
    pub async fn read(&self, handle: ConnectionHandle, nodes: &[NodeId]) -> ClientResult<Vec<DataValue>> {
        let request = ReadRequest {
            nodes_to_read: nodes.iter().cloned().map(ReadValueId::value).collect(),
            ..Default::default()
        };
        match self.service_sync(handle, Request::Read(request)).await? {
            Response::Read(response) => {
                check_service_result(ServiceKind::Read, response.service_result)?;
                Ok(response.results)
            }
            other => Err(unexpected(ServiceKind::Read, &other)),
        }
    }

    /// Writes the Value attribute of each node. Returns one status per write.
    pub async fn write(
        &self,
        handle: ConnectionHandle,
        values: Vec<(NodeId, DataValue)>,
    ) -> ClientResult<Vec<StatusCode>> {
        let request = WriteRequest {
            nodes_to_write: values
                .into_iter()
                .map(|(node_id, value)| WriteValue {
                    node_id,
                    attribute_id: AttributeId::Value,
                    value,
                })
                .collect(),
        };
        match self.service_sync(handle, Request::Write(request)).await? {
            Response::Write(response) => {
                check_service_result(ServiceKind::Write, response.service_result)?;
                Ok(response.results)
            }
            other => Err(unexpected(ServiceKind::Write, &other)),
        }
    }

    /// Browses forward references of `node`.
    pub async fn browse(
        &self,
        handle: ConnectionHandle,
        node: NodeId,
    ) -> ClientResult<Vec<ReferenceDescription>> {
        let request = BrowseRequest {
            max_references_per_node: 0,
            nodes_to_browse: vec![BrowseDescription {
                node_id: node,
                direction: BrowseDirection::Forward,
                reference_type_id: NodeId::null(),
                include_subtypes: true,
            }],
        };
        match self.service_sync(handle, Request::Browse(request)).await? {
            Response::Browse(response) => {
                check_service_result(ServiceKind::Browse, response.service_result)?;
                let Some(result) = response.results.into_iter().next() else {
                    return Ok(Vec::new());
                };
                check_service_result(ServiceKind::Browse, result.status)?;
                Ok(result.references)
            }
            other => Err(unexpected(ServiceKind::Browse, &other)),
        }
    }

    /// Lists the endpoints offered by the configuration's server.
    ///
    /// Runs without a session; see
    /// [`discovery_service_sync`](Self::discovery_service_sync).
    pub async fn get_endpoints(&self, config: ConfigId) -> ClientResult<Vec<EndpointDescription>> {
        let endpoint_url = self.connection_config(config)?.endpoint_url;
        let request = GetEndpointsRequest { endpoint_url };
        match self
            .discovery_service_sync(config, Request::GetEndpoints(request))
            .await?
        {
            Response::GetEndpoints(response) => {
                check_service_result(ServiceKind::GetEndpoints, response.service_result)?;
                Ok(response.endpoints)
            }
            other => Err(unexpected(ServiceKind::GetEndpoints, &other)),
        }
    }
}

fn check_service_result(service: ServiceKind, status: StatusCode) -> ClientResult<()> {
    if status.is_bad() {
        tracing::debug!(%service, %status, "Service fault");
        return Err(RequestError::ServiceFault {
            service: service.name().to_string(),
            status,
        }
        .into());
    }
    Ok(())
}

fn unexpected(expected: ServiceKind, actual: &Response) -> ClientError {
    RequestError::UnexpectedResponse {
        expected: expected.name().to_string(),
        actual: actual.kind().name().to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::testing::RecordingEngine;
    use crate::config::ConnectionConfig;
    use crate::engine::{EngineEvent, SessionId};
    use crate::error::Status;
    use crate::message::{BrowseResponse, BrowseResult, GetEndpointsResponse, ReadResponse, WriteResponse};
    use crate::types::{SecurityMode, Variant};

    async fn connected() -> (ClientRuntime, Arc<RecordingEngine>, ConnectionHandle, ConfigId) {
        let engine = Arc::new(RecordingEngine::default());
        let runtime = ClientRuntime::new(engine.clone());
        let id = runtime
            .add_connection_config(ConnectionConfig::new("opc.tcp://localhost:4841"))
            .unwrap();
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.connect(id).await }
        });
        while engine.activations().is_empty() {
            tokio::task::yield_now().await;
        }
        let handle = engine.activations()[0];
        engine.sink().unwrap().deliver(EngineEvent::SessionActivated {
            connection: handle,
            session: SessionId(1),
        });
        task.await.unwrap().unwrap();
        (runtime, engine, handle, id)
    }

    /// Answers the next recorded request with `respond(request)`.
    async fn answer<F>(engine: &RecordingEngine, respond: F)
    where
        F: FnOnce(&Request) -> Response,
    {
        let (request, context) = loop {
            if let Some(sent) = engine.take_sent().pop() {
                break sent;
            }
            tokio::task::yield_now().await;
        };
        let response = respond(&request);
        engine.sink().unwrap().deliver(EngineEvent::SessionResponse { context, response });
    }

    #[tokio::test]
    async fn test_read_returns_values_in_order() {
        let (runtime, engine, handle, _) = connected().await;
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move {
                runtime
                    .read(handle, &[NodeId::numeric(1, 1012), NodeId::numeric(1, 1013)])
                    .await
            }
        });
        answer(&engine, |request| {
            let Request::Read(read) = request else {
                panic!("expected read, got {request}");
            };
            assert_eq!(read.nodes_to_read.len(), 2);
            Response::Read(ReadResponse {
                service_result: StatusCode::GOOD,
                results: vec![
                    DataValue::new(Variant::Int32(7)),
                    DataValue::bad(StatusCode::BAD_NODE_ID_UNKNOWN),
                ],
            })
        })
        .await;

        let values = task.await.unwrap().unwrap();
        assert_eq!(values[0].value, Variant::Int32(7));
        assert_eq!(values[1].status, StatusCode::BAD_NODE_ID_UNKNOWN);
    }

    #[tokio::test]
    async fn test_bad_service_result_is_fault() {
        let (runtime, engine, handle, _) = connected().await;
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move {
                runtime
                    .write(handle, vec![(NodeId::numeric(1, 1012), DataValue::new(Variant::Int32(1)))])
                    .await
            }
        });
        answer(&engine, |_| {
            Response::Write(WriteResponse {
                service_result: StatusCode::BAD_USER_ACCESS_DENIED,
                results: Vec::new(),
            })
        })
        .await;

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.status(), Status::Nok);
        assert_eq!(err.status_code(), Some(StatusCode::BAD_USER_ACCESS_DENIED));
    }

    #[tokio::test]
    async fn test_mismatched_response_is_rejected() {
        let (runtime, engine, handle, _) = connected().await;
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.browse(handle, NodeId::numeric(0, 85)).await }
        });
        answer(&engine, |_| Response::Read(ReadResponse::default())).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Request(RequestError::UnexpectedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_browse_unwraps_first_result() {
        let (runtime, engine, handle, _) = connected().await;
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.browse(handle, NodeId::numeric(0, 85)).await }
        });
        answer(&engine, |_| {
            Response::Browse(BrowseResponse {
                service_result: StatusCode::GOOD,
                results: vec![BrowseResult {
                    status: StatusCode::GOOD,
                    continuation_point: None,
                    references: vec![ReferenceDescription {
                        reference_type_id: NodeId::numeric(0, 35),
                        is_forward: true,
                        node_id: NodeId::numeric(1, 1012),
                        browse_name: "Counter".into(),
                        display_name: "Counter".into(),
                    }],
                }],
            })
        })
        .await;

        let references = task.await.unwrap().unwrap();
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].browse_name, "Counter");
    }

    #[tokio::test]
    async fn test_get_endpoints_uses_config_url() {
        let (runtime, engine, _, id) = connected().await;
        let task = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.get_endpoints(id).await }
        });
        answer(&engine, |request| {
            let Request::GetEndpoints(get) = request else {
                panic!("expected get endpoints, got {request}");
            };
            Response::GetEndpoints(GetEndpointsResponse {
                service_result: StatusCode::GOOD,
                endpoints: vec![EndpointDescription {
                    endpoint_url: get.endpoint_url.clone(),
                    security_mode: SecurityMode::None,
                    security_policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#None".into(),
                    server_certificate: None,
                    server_uri: "urn:test".into(),
                }],
            })
        })
        .await;

        let endpoints = task.await.unwrap().unwrap();
        assert_eq!(endpoints[0].endpoint_url, "opc.tcp://localhost:4841");
    }
}
