//! In-process virtual synchrony hub.
//!
//! The `LoopbackNetwork` connects any number of endpoints living in the
//! same process. Every send and every membership change is applied under a
//! single lock, which gives the two guarantees the group core relies on:
//!
//! - all members of a component see the same messages in the same order
//! - view changes are delivered at the same point of that order
//!
//! Channels can be split into components with [`LoopbackNetwork::partition`]
//! and merged again with [`LoopbackNetwork::heal`]; messages never cross a
//! component boundary.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::types::MemberId;

use super::{Delivery, Transport, TransportError, TransportFactory, TransportView};

/// Default maximum message size accepted by loopback endpoints.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

// ============================================================================
// Hub
// ============================================================================

#[derive(Debug)]
struct Slot {
    member: Option<MemberId>,
    channel: Option<String>,
    tx: Sender<Delivery>,
}

#[derive(Debug, Default)]
struct Channel {
    /// Members in join order.
    members: Vec<MemberId>,
    /// Explicit components while partitioned.
    components: Option<Vec<Vec<MemberId>>>,
}

impl Channel {
    fn components(&self) -> Vec<Vec<MemberId>> {
        match &self.components {
            Some(components) => components.clone(),
            None if self.members.is_empty() => Vec::new(),
            None => vec![self.members.clone()],
        }
    }

    fn component_of(&self, member: &MemberId) -> Vec<MemberId> {
        self.components()
            .into_iter()
            .find(|c| c.contains(member))
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Hub {
    next_endpoint: u64,
    next_member: u64,
    next_view: u64,
    slots: HashMap<u64, Slot>,
    channels: HashMap<String, Channel>,
    messages_delivered: u64,
}

impl Hub {
    fn deliver(&mut self, to: &[MemberId], delivery: &Delivery) {
        for slot in self.slots.values() {
            if slot.member.as_ref().is_some_and(|m| to.contains(m)) {
                // A dropped receiver only means the endpoint is gone.
                let _ = slot.tx.send(delivery.clone());
            }
        }
    }

    fn install_view(&mut self, component: &[MemberId]) {
        if component.is_empty() {
            return;
        }
        self.next_view += 1;
        let view = TransportView {
            view_id: self.next_view,
            members: component.to_vec(),
        };
        tracing::debug!(view = view.view_id, members = component.len(), "loopback view");
        self.deliver(component, &Delivery::View(view));
    }

    fn install_all_views(&mut self, channel: &str) {
        let components = self
            .channels
            .get(channel)
            .map(Channel::components)
            .unwrap_or_default();
        for component in components {
            self.install_view(&component);
        }
    }
}

// ============================================================================
// Network
// ============================================================================

/// An in-process group transport.
///
/// Cloning yields another handle to the same network.
#[derive(Debug, Clone)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
    max_message_size: usize,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Creates an empty network with a custom message size limit.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            max_message_size,
        }
    }

    /// Creates a new, unconnected endpoint.
    pub fn endpoint(&self) -> LoopbackEndpoint {
        let (tx, rx) = mpsc::channel();
        let mut hub = self.hub.lock().expect("lock poisoned");
        let id = hub.next_endpoint;
        hub.next_endpoint += 1;
        hub.slots.insert(
            id,
            Slot {
                member: None,
                channel: None,
                tx,
            },
        );
        LoopbackEndpoint {
            network: self.clone(),
            id,
            rx: Mutex::new(rx),
        }
    }

    /// Returns the members of a channel in join order.
    pub fn members(&self, channel: &str) -> Vec<MemberId> {
        let hub = self.hub.lock().expect("lock poisoned");
        hub.channels
            .get(channel)
            .map(|c| c.members.clone())
            .unwrap_or_default()
    }

    /// Returns the number of messages delivered so far (counting each
    /// recipient).
    pub fn messages_delivered(&self) -> u64 {
        self.hub.lock().expect("lock poisoned").messages_delivered
    }

    /// Splits a channel into components.
    ///
    /// Members not named in any group end up alone in their own component.
    /// Every component receives a new view.
    pub fn partition(&self, channel: &str, groups: &[Vec<MemberId>]) {
        let mut hub = self.hub.lock().expect("lock poisoned");
        let Some(ch) = hub.channels.get_mut(channel) else {
            return;
        };

        let mut components: Vec<Vec<MemberId>> = groups
            .iter()
            .map(|g| {
                ch.members
                    .iter()
                    .filter(|m| g.contains(m))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|c| !c.is_empty())
            .collect();
        for member in &ch.members {
            if !components.iter().any(|c| c.contains(member)) {
                components.push(vec![member.clone()]);
            }
        }

        tracing::info!(channel, components = components.len(), "loopback partition");
        ch.components = Some(components);
        hub.install_all_views(channel);
    }

    /// Merges all components of a channel back into one.
    pub fn heal(&self, channel: &str) {
        let mut hub = self.hub.lock().expect("lock poisoned");
        let Some(ch) = hub.channels.get_mut(channel) else {
            return;
        };
        if ch.components.take().is_none() {
            return;
        }
        tracing::info!(channel, "loopback partition healed");
        hub.install_all_views(channel);
    }

    fn connect(&self, endpoint: u64, channel: &str) -> Result<MemberId, TransportError> {
        let mut hub = self.hub.lock().expect("lock poisoned");

        let slot = hub.slots.get(&endpoint).ok_or(TransportError::Disconnected)?;
        if let Some(current) = &slot.channel {
            return Err(TransportError::AlreadyConnected(current.clone()));
        }

        hub.next_member += 1;
        let member = MemberId::new(format!("lo-{:04}", hub.next_member))
            .map_err(|e| TransportError::Backend(e.to_string()))?;

        if let Some(slot) = hub.slots.get_mut(&endpoint) {
            slot.member = Some(member.clone());
            slot.channel = Some(channel.to_string());
        }

        let ch = hub.channels.entry(channel.to_string()).or_default();
        ch.members.push(member.clone());
        let component = match &mut ch.components {
            // Newcomers to a partitioned channel start out alone.
            Some(components) => {
                components.push(vec![member.clone()]);
                vec![member.clone()]
            }
            None => ch.members.clone(),
        };

        tracing::debug!(channel, member = %member, "loopback connect");
        hub.install_view(&component);
        Ok(member)
    }

    fn send(&self, endpoint: u64, payload: Vec<u8>) -> Result<(), TransportError> {
        if payload.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }

        let mut hub = self.hub.lock().expect("lock poisoned");
        let slot = hub.slots.get(&endpoint).ok_or(TransportError::Disconnected)?;
        let (Some(member), Some(channel)) = (slot.member.clone(), slot.channel.clone()) else {
            return Err(TransportError::NotConnected);
        };

        let component = hub
            .channels
            .get(&channel)
            .map(|c| c.component_of(&member))
            .unwrap_or_default();

        hub.messages_delivered += component.len() as u64;
        hub.deliver(
            &component,
            &Delivery::Message {
                from: member,
                payload,
            },
        );
        Ok(())
    }

    fn disconnect(&self, endpoint: u64) {
        let mut hub = self.hub.lock().expect("lock poisoned");
        let Some(slot) = hub.slots.remove(&endpoint) else {
            return;
        };
        let _ = slot.tx.send(Delivery::Closed);

        let (Some(member), Some(channel)) = (slot.member, slot.channel) else {
            return;
        };

        let mut remaining = Vec::new();
        if let Some(ch) = hub.channels.get_mut(&channel) {
            remaining = ch.component_of(&member);
            remaining.retain(|m| m != &member);
            ch.members.retain(|m| m != &member);
            if let Some(components) = &mut ch.components {
                for c in components.iter_mut() {
                    c.retain(|m| m != &member);
                }
                components.retain(|c| !c.is_empty());
            }
            if ch.members.is_empty() {
                hub.channels.remove(&channel);
            }
        }

        tracing::debug!(channel = %channel, member = %member, "loopback disconnect");
        hub.install_view(&remaining);
    }
}

impl TransportFactory for LoopbackNetwork {
    fn create(&self, _address: &str) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(self.endpoint()))
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// One member's handle on a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackEndpoint {
    network: LoopbackNetwork,
    id: u64,
    rx: Mutex<Receiver<Delivery>>,
}

impl Transport for LoopbackEndpoint {
    fn connect(&self, channel: &str) -> Result<MemberId, TransportError> {
        self.network.connect(self.id, channel)
    }

    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.network.send(self.id, payload)
    }

    fn recv(&self) -> Result<Delivery, TransportError> {
        let rx = self.rx.lock().expect("lock poisoned");
        match rx.recv() {
            Ok(delivery) => Ok(delivery),
            // Every sender is gone: the slot was removed on disconnect.
            Err(_) => Ok(Delivery::Closed),
        }
    }

    fn disconnect(&self) {
        self.network.disconnect(self.id);
    }

    fn max_message_size(&self) -> usize {
        self.network.max_message_size
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.network.disconnect(self.id);
    }
}
