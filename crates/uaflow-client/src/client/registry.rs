// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Connection registry.
//!
//! Configuration slots are indexed by [`ConfigId`]. A slot holds at most one
//! live connection; the connection's [`ConnectionHandle`] is the slot index
//! plus the slot's generation, which is bumped whenever the connection is
//! removed. Handles from a previous generation are rejected.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::request::ServiceResponseCallback;
use super::state_machine::StateMachine;
use super::ConnectionEventCallback;
use crate::config::{ConnectionConfig, FinalizedConnection};
use crate::engine::{ChannelConfigId, ProtocolEngine, ReverseEndpointId};
use crate::error::{ClientError, ClientResult, ConnectionError, RequestError};

// =============================================================================
// Handles
// =============================================================================

/// Identifies a registered connection configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigId(pub(crate) u32);

impl ConfigId {
    /// Slot index.
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config-{}", self.0)
    }
}

/// Generation-checked handle to a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Configuration slot of this connection.
    pub fn config(&self) -> ConfigId {
        ConfigId(self.index)
    }

    /// Slot generation the handle was issued for.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}.{}", self.index, self.generation)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Lifecycle of the runtime as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RuntimeState {
    Running,
    Clearing,
    Cleared,
}

pub(crate) struct ConnectionEntry {
    pub(crate) machine: StateMachine,
    pub(crate) event_callback: Option<ConnectionEventCallback>,
}

struct ConfigSlot {
    config: Arc<ConnectionConfig>,
    finalized: Option<Arc<FinalizedConnection>>,
    channel: Option<ChannelConfigId>,
    generation: u32,
    connection: Option<ConnectionEntry>,
}

struct ReverseEndpointEntry {
    url: String,
    id: ReverseEndpointId,
    closing: bool,
}

/// All runtime bookkeeping guarded by the global lock.
pub(crate) struct Registry {
    state: RuntimeState,
    slots: Vec<ConfigSlot>,
    reverse_endpoints: Vec<ReverseEndpointEntry>,
    async_response: Option<ServiceResponseCallback>,
    max_connections: usize,
}

impl Registry {
    pub(crate) fn new(max_connections: usize) -> Self {
        Self {
            state: RuntimeState::Running,
            slots: Vec::new(),
            reverse_endpoints: Vec::new(),
            async_response: None,
            max_connections,
        }
    }

    // =========================================================================
    // Runtime state
    // =========================================================================

    pub(crate) fn state(&self) -> RuntimeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: RuntimeState) {
        self.state = state;
    }

    /// Fails unless the runtime accepts new operations.
    pub(crate) fn ensure_running(&self) -> ClientResult<()> {
        match self.state {
            RuntimeState::Running => Ok(()),
            _ => Err(ClientError::not_initialized()),
        }
    }

    pub(crate) fn set_async_response(&mut self, callback: ServiceResponseCallback) -> ClientResult<()> {
        if self.async_response.is_some() {
            return Err(RequestError::AsyncCallbackAlreadySet.into());
        }
        self.async_response = Some(callback);
        Ok(())
    }

    pub(crate) fn async_response(&self) -> ClientResult<ServiceResponseCallback> {
        self.async_response
            .clone()
            .ok_or_else(|| RequestError::AsyncCallbackMissing.into())
    }

    // =========================================================================
    // Configurations
    // =========================================================================

    pub(crate) fn add_config(&mut self, config: ConnectionConfig) -> ClientResult<ConfigId> {
        if self.slots.len() >= self.max_connections {
            return Err(ConnectionError::TooManyConnections {
                max: self.max_connections,
            }
            .into());
        }
        let id = ConfigId(self.slots.len() as u32);
        self.slots.push(ConfigSlot {
            config: Arc::new(config),
            finalized: None,
            channel: None,
            generation: 0,
            connection: None,
        });
        Ok(id)
    }

    fn slot(&self, id: ConfigId) -> ClientResult<&ConfigSlot> {
        self.slots.get(id.0 as usize).ok_or_else(|| {
            ConnectionError::UnknownConfig {
                config: id.to_string(),
            }
            .into()
        })
    }

    fn slot_mut(&mut self, id: ConfigId) -> ClientResult<&mut ConfigSlot> {
        self.slots.get_mut(id.0 as usize).ok_or_else(|| {
            ConnectionError::UnknownConfig {
                config: id.to_string(),
            }
            .into()
        })
    }

    pub(crate) fn config(&self, id: ConfigId) -> ClientResult<Arc<ConnectionConfig>> {
        self.slot(id).map(|slot| Arc::clone(&slot.config))
    }

    pub(crate) fn finalized(&self, id: ConfigId) -> ClientResult<Option<Arc<FinalizedConnection>>> {
        self.slot(id).map(|slot| slot.finalized.clone())
    }

    /// Stores the finalized configuration unless one already exists, and
    /// returns the one in effect.
    pub(crate) fn store_finalized(
        &mut self,
        id: ConfigId,
        finalized: Arc<FinalizedConnection>,
    ) -> ClientResult<Arc<FinalizedConnection>> {
        let slot = self.slot_mut(id)?;
        Ok(Arc::clone(slot.finalized.get_or_insert(finalized)))
    }

    pub(crate) fn find_by_user_id(&self, user_id: &str) -> Option<ConfigId> {
        self.slots
            .iter()
            .position(|slot| slot.config.user_defined_id.as_deref() == Some(user_id))
            .map(|index| ConfigId(index as u32))
    }

    pub(crate) fn config_count(&self) -> usize {
        self.slots.len()
    }

    /// Registers the slot's channel configuration with the engine once.
    pub(crate) fn ensure_channel(
        &mut self,
        id: ConfigId,
        finalized: &FinalizedConnection,
        engine: &dyn ProtocolEngine,
    ) -> ClientResult<ChannelConfigId> {
        let slot = self.slot_mut(id)?;
        if let Some(channel) = slot.channel {
            return Ok(channel);
        }
        let channel = engine
            .add_channel_config(finalized)
            .map_err(|status| ConnectionError::EngineRejected {
                operation: "channel configuration",
                status,
            })?;
        tracing::debug!(config = %id, %channel, endpoint = %finalized.endpoint_url, "Channel configuration registered");
        slot.channel = Some(channel);
        Ok(channel)
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Handle of the slot's live connection, if any.
    pub(crate) fn connection_of(&self, id: ConfigId) -> Option<ConnectionHandle> {
        let slot = self.slots.get(id.0 as usize)?;
        slot.connection
            .as_ref()
            .map(|_| ConnectionHandle::new(id.0, slot.generation))
    }

    /// Handle the next connection in this slot will receive.
    pub(crate) fn next_handle(&self, id: ConfigId) -> ClientResult<ConnectionHandle> {
        let slot = self.slot(id)?;
        Ok(ConnectionHandle::new(id.0, slot.generation))
    }

    pub(crate) fn insert_connection(
        &mut self,
        id: ConfigId,
        machine: StateMachine,
        event_callback: Option<ConnectionEventCallback>,
    ) -> ClientResult<ConnectionHandle> {
        let slot = self.slot_mut(id)?;
        let handle = ConnectionHandle::new(id.0, slot.generation);
        debug_assert_eq!(machine.handle(), handle);
        if slot.connection.is_some() {
            return Err(ConnectionError::AlreadyConnected {
                endpoint: slot.config.endpoint_url.clone(),
            }
            .into());
        }
        slot.connection = Some(ConnectionEntry {
            machine,
            event_callback,
        });
        Ok(handle)
    }

    pub(crate) fn connection(&self, handle: ConnectionHandle) -> ClientResult<&ConnectionEntry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.connection.as_ref())
            .ok_or_else(|| ClientError::invalid_handle(handle))
    }

    pub(crate) fn connection_mut(&mut self, handle: ConnectionHandle) -> ClientResult<&mut ConnectionEntry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.connection.as_mut())
            .ok_or_else(|| ClientError::invalid_handle(handle))
    }

    /// Removes a connection and invalidates its handle.
    pub(crate) fn remove_connection(&mut self, handle: ConnectionHandle) -> Option<ConnectionEntry> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let entry = slot.connection.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(entry)
    }

    pub(crate) fn connection_handles(&self) -> Vec<ConnectionHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.connection.is_some())
            .map(|(index, slot)| ConnectionHandle::new(index as u32, slot.generation))
            .collect()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.connection.is_some()).count()
    }

    /// Forgets all channel registrations after the engine dropped them.
    pub(crate) fn clear_channels(&mut self) {
        for slot in &mut self.slots {
            slot.channel = None;
        }
    }

    // =========================================================================
    // Reverse endpoints
    // =========================================================================

    /// Returns the listener for `url`, creating it on first use.
    pub(crate) fn ensure_reverse_endpoint(
        &mut self,
        url: &str,
        engine: &dyn ProtocolEngine,
    ) -> ClientResult<ReverseEndpointId> {
        if let Some(entry) = self
            .reverse_endpoints
            .iter()
            .find(|entry| entry.url == url && !entry.closing)
        {
            return Ok(entry.id);
        }
        let id = engine
            .add_reverse_endpoint(url)
            .map_err(|status| ConnectionError::EngineRejected {
                operation: "reverse endpoint",
                status,
            })?;
        tracing::info!(%url, endpoint = %id, "Reverse endpoint listening");
        self.reverse_endpoints.push(ReverseEndpointEntry {
            url: url.to_string(),
            id,
            closing: false,
        });
        Ok(id)
    }

    /// Marks every open listener as closing and returns their ids.
    pub(crate) fn begin_close_reverse_endpoints(&mut self) -> Vec<ReverseEndpointId> {
        self.reverse_endpoints
            .iter_mut()
            .filter(|entry| !entry.closing)
            .map(|entry| {
                entry.closing = true;
                entry.id
            })
            .collect()
    }

    pub(crate) fn on_reverse_endpoint_closed(&mut self, id: ReverseEndpointId) -> bool {
        let before = self.reverse_endpoints.len();
        self.reverse_endpoints.retain(|entry| entry.id != id);
        before != self.reverse_endpoints.len()
    }

    pub(crate) fn reverse_endpoint_count(&self) -> usize {
        self.reverse_endpoints.len()
    }

    pub(crate) fn drop_reverse_endpoints(&mut self) {
        self.reverse_endpoints.clear();
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("state", &self.state)
            .field("configs", &self.slots.len())
            .field("connections", &self.connection_count())
            .field("reverse_endpoints", &self.reverse_endpoints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::RecordingEngine;
    use crate::error::Status;

    fn config(id: &str) -> ConnectionConfig {
        let mut config = ConnectionConfig::new("opc.tcp://localhost:4841");
        config.user_defined_id = Some(id.to_string());
        config
    }

    fn machine(handle: ConnectionHandle) -> StateMachine {
        StateMachine::new(
            handle,
            Arc::new(crate::client::testing::finalized()),
            ChannelConfigId(1),
            None,
            16,
        )
    }

    #[test]
    fn test_config_capacity() {
        let mut registry = Registry::new(2);
        registry.add_config(config("a")).unwrap();
        registry.add_config(config("b")).unwrap();
        let err = registry.add_config(config("c")).unwrap_err();
        assert_eq!(err.status(), Status::OutOfMemory);
    }

    #[test]
    fn test_find_by_user_id() {
        let mut registry = Registry::new(8);
        registry.add_config(config("plc-1")).unwrap();
        let id = registry.add_config(config("plc-2")).unwrap();
        assert_eq!(registry.find_by_user_id("plc-2"), Some(id));
        assert_eq!(registry.find_by_user_id("missing"), None);
    }

    #[test]
    fn test_unknown_config_is_invalid_parameters() {
        let registry = Registry::new(8);
        let err = registry.config(ConfigId(3)).unwrap_err();
        assert_eq!(err.status(), Status::InvalidParameters);
    }

    #[test]
    fn test_removed_handle_goes_stale() {
        let mut registry = Registry::new(8);
        let id = registry.add_config(config("a")).unwrap();
        let first = registry.next_handle(id).unwrap();
        registry.insert_connection(id, machine(first), None).unwrap();
        assert!(registry.connection(first).is_ok());

        assert!(registry.remove_connection(first).is_some());
        assert!(registry.remove_connection(first).is_none());
        let err = registry.connection(first).err().unwrap();
        assert_eq!(err.status(), Status::InvalidState);

        let second = registry.next_handle(id).unwrap();
        assert_ne!(first, second);
        registry.insert_connection(id, machine(second), None).unwrap();
        assert!(registry.connection(first).is_err());
        assert!(registry.connection(second).is_ok());
    }

    #[test]
    fn test_async_response_set_once() {
        let mut registry = Registry::new(1);
        assert_eq!(registry.async_response().err().unwrap().status(), Status::InvalidState);
        registry.set_async_response(Arc::new(|_, _, _, _| {})).unwrap();
        let err = registry.set_async_response(Arc::new(|_, _, _, _| {})).unwrap_err();
        assert_eq!(err.status(), Status::InvalidState);
    }

    #[test]
    fn test_reverse_endpoints_shared_per_url() {
        let engine = RecordingEngine::default();
        let mut registry = Registry::new(4);
        let a = registry.ensure_reverse_endpoint("opc.tcp://0.0.0.0:4844", &engine).unwrap();
        let b = registry.ensure_reverse_endpoint("opc.tcp://0.0.0.0:4844", &engine).unwrap();
        let c = registry.ensure_reverse_endpoint("opc.tcp://0.0.0.0:4845", &engine).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let closing = registry.begin_close_reverse_endpoints();
        assert_eq!(closing.len(), 2);
        assert!(registry.on_reverse_endpoint_closed(a));
        assert_eq!(registry.reverse_endpoint_count(), 1);
    }

    #[test]
    fn test_channel_registered_once() {
        let engine = RecordingEngine::default();
        let mut registry = Registry::new(4);
        let id = registry.add_config(config("a")).unwrap();
        let finalized = crate::client::testing::finalized();
        let first = registry.ensure_channel(id, &finalized, &engine).unwrap();
        let second = registry.ensure_channel(id, &finalized, &engine).unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.channel_count(), 1);
    }
}
