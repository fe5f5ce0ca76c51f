// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Request contexts: how a caller waits for one service response.
//!
//! ```text
//!   Sync    ── caller awaits a Waiter; dispatcher settles the Completion
//!   Async   ── dispatcher invokes the registered response callback
//!   NoSync  ── runtime-internal; the state machine consumes the response
//! ```

use std::sync::Arc;

use super::completion::{completion, Completion, WaitError, Waiter};
use super::ConnectionHandle;
use crate::error::{ClientResult, RequestError};
use crate::message::{Response, ServiceKind};
use crate::types::StatusCode;

/// Opaque value the application attaches to an asynchronous request or a
/// monitored item, returned unchanged with its result.
pub type UserContext = u64;

/// Outcome of one service request: the response, or the engine failure
/// status.
pub type ServiceOutcome = Result<Response, StatusCode>;

/// Application callback for asynchronous service responses.
pub type ServiceResponseCallback =
    Arc<dyn Fn(ConnectionHandle, ServiceKind, ServiceOutcome, UserContext) + Send + Sync>;

/// Work deferred until the registry lock is released.
pub(crate) type Deferred = Box<dyn FnOnce() + Send>;

/// Completion mode of one in-flight request.
pub(crate) enum RequestContext {
    /// A caller is awaiting the outcome.
    Sync(Completion<ServiceOutcome>),
    /// The outcome goes to the application's response callback.
    Async {
        callback: ServiceResponseCallback,
        user_context: UserContext,
    },
    /// The state machine matches the response against a pending operation.
    NoSync { operation: u64 },
}

impl RequestContext {
    /// Creates a synchronous context and the waiter for it.
    pub(crate) fn sync() -> (Self, Waiter<ServiceOutcome>) {
        let (done, waiter) = completion();
        (Self::Sync(done), waiter)
    }

    pub(crate) fn asynchronous(callback: ServiceResponseCallback, user_context: UserContext) -> Self {
        Self::Async {
            callback,
            user_context,
        }
    }

    pub(crate) fn no_sync(operation: u64) -> Self {
        Self::NoSync { operation }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Async { .. } => "async",
            Self::NoSync { .. } => "no_sync",
        }
    }

    /// Delivers the outcome and consumes the context.
    ///
    /// Sync waiters are woken at once. Async callbacks are returned for the
    /// caller to run after unlocking. NoSync contexts must be routed to the
    /// state machine before reaching here; they are dropped.
    pub(crate) fn complete(
        self,
        connection: ConnectionHandle,
        service: ServiceKind,
        outcome: ServiceOutcome,
    ) -> Option<Deferred> {
        match self {
            Self::Sync(done) => {
                if !done.settle(outcome) {
                    tracing::debug!(%connection, %service, "Sync caller gone before completion");
                }
                None
            }
            Self::Async {
                callback,
                user_context,
            } => Some(Box::new(move || {
                callback(connection, service, outcome, user_context)
            })),
            Self::NoSync { operation } => {
                tracing::trace!(%connection, %service, operation, "Dropping internal context");
                None
            }
        }
    }
}

/// Awaits a synchronous context and maps the outcome.
///
/// A response is returned even when it is a fault; callers decide how to
/// treat the service result.
pub(crate) async fn wait_finished(
    waiter: Waiter<ServiceOutcome>,
    service: ServiceKind,
) -> ClientResult<Response> {
    match waiter.wait().await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(status)) => Err(RequestError::SendFailed {
            service: service.name().to_string(),
            status,
        }
        .into()),
        Err(WaitError::Abandoned) | Err(WaitError::Elapsed) => Err(RequestError::Abandoned {
            service: service.name().to_string(),
        }
        .into()),
    }
}
