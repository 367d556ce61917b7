//! Connection pool for protocols that carry one request per connection.

use std::collections::{HashMap, VecDeque};

use entity_bus_core::{
    ConnectionId, ConnectionPtr, EchoData, ProtocolPtr,
    properties::DEFAULT_MAX_REQUEST_CONNECTIONS,
};

/// Outcome of asking the pool for a connection.
pub(crate) enum Allocation {
    /// An idle pooled connection.
    Reuse(ConnectionId, ProtocolPtr),
    /// No idle connection, but the pool may grow.
    Create,
    /// Every connection is busy. The request has to wait.
    Exhausted,
}

enum SlotState {
    Idle,
    InFlight(EchoData),
    /// The connection died with a request outstanding.
    Dead(EchoData),
}

struct Slot {
    protocol: ProtocolPtr,
    connection: ConnectionPtr,
    state: SlotState,
}

/// Pooled connections with at most one outstanding request each.
///
/// Idle connections are reused before the pool grows, and the pool never
/// exceeds `max` connections. A connection returns to the idle list only
/// when the reply for its request arrives on that same connection.
pub(crate) struct RequestPool {
    max: usize,
    slots: HashMap<ConnectionId, Slot>,
    idle: VecDeque<ConnectionId>,
}

impl Default for RequestPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUEST_CONNECTIONS)
    }
}

pub(crate) fn same_connection(a: &ConnectionPtr, b: &ConnectionPtr) -> bool {
    std::ptr::addr_eq(std::sync::Arc::as_ptr(a), std::sync::Arc::as_ptr(b))
}

impl RequestPool {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            slots: HashMap::new(),
            idle: VecDeque::new(),
        }
    }

    pub fn set_max(&mut self, max: usize) {
        self.max = max.max(1);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| !matches!(slot.state, SlotState::Idle))
            .count()
    }

    pub fn allocate(&mut self) -> Allocation {
        while let Some(id) = self.idle.pop_front() {
            if let Some(slot) = self.slots.get(&id) {
                if matches!(slot.state, SlotState::Idle) {
                    return Allocation::Reuse(id, slot.protocol.clone());
                }
            }
        }
        if self.slots.len() < self.max {
            Allocation::Create
        } else {
            Allocation::Exhausted
        }
    }

    /// Mark a connection returned by [`Self::allocate`] as carrying a request.
    pub fn occupy(&mut self, id: ConnectionId, echo: EchoData) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = SlotState::InFlight(echo);
        }
    }

    /// Add a freshly created connection, carrying a request if `echo` is set.
    pub fn insert(&mut self, protocol: ProtocolPtr, connection: ConnectionPtr, echo: Option<EchoData>) {
        let id = connection.connection_id();
        let state = match echo {
            Some(echo) => SlotState::InFlight(echo),
            None => {
                self.idle.push_back(id);
                SlotState::Idle
            }
        };
        self.slots.insert(
            id,
            Slot {
                protocol,
                connection,
                state,
            },
        );
    }

    /// Release the connection a reply arrived on.
    ///
    /// Returns the request's echo data, or `None` when the connection is
    /// unknown, idle, dead or no longer the one that carried the request.
    pub fn release(&mut self, connection_id: ConnectionId) -> Option<EchoData> {
        let slot = self.slots.get_mut(&connection_id)?;
        let current = slot.protocol.connection()?;
        if !same_connection(&current, &slot.connection)
            || current.connection_id() != connection_id
            || !matches!(slot.state, SlotState::InFlight(_))
        {
            return None;
        }
        let SlotState::InFlight(echo) = std::mem::replace(&mut slot.state, SlotState::Idle) else {
            return None;
        };
        self.idle.push_back(connection_id);
        Some(echo)
    }

    /// The connection died. An in-flight slot stays allocated, an idle one leaves the pool.
    pub fn mark_dead(&mut self, connection_id: ConnectionId) -> bool {
        let Some(slot) = self.slots.get_mut(&connection_id) else {
            return false;
        };
        match std::mem::replace(&mut slot.state, SlotState::Idle) {
            SlotState::InFlight(echo) | SlotState::Dead(echo) => {
                slot.state = SlotState::Dead(echo);
                true
            }
            SlotState::Idle => {
                self.slots.remove(&connection_id);
                self.idle.retain(|id| *id != connection_id);
                false
            }
        }
    }

    /// Drop a connection. Returns its protocol and the echo of a lost request.
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<(ProtocolPtr, Option<EchoData>)> {
        self.idle.retain(|id| *id != connection_id);
        let slot = self.slots.remove(&connection_id)?;
        let lost = match slot.state {
            SlotState::Idle => None,
            SlotState::InFlight(echo) | SlotState::Dead(echo) => Some(echo),
        };
        Some((slot.protocol, lost))
    }

    pub fn protocols(&self) -> Vec<ProtocolPtr> {
        self.slots.values().map(|slot| slot.protocol.clone()).collect()
    }

    /// Empty the pool, returning the echo of every outstanding request.
    pub fn clear(&mut self) -> Vec<EchoData> {
        self.idle.clear();
        self.slots
            .drain()
            .filter_map(|(_, slot)| match slot.state {
                SlotState::Idle => None,
                SlotState::InFlight(echo) | SlotState::Dead(echo) => Some(echo),
            })
            .collect()
    }
}
