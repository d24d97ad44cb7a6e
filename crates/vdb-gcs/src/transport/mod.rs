//! Transport abstraction for group communication.
//!
//! This module defines the [`Transport`] trait the group core is built on.
//! A transport provides what the library itself does not: reliable,
//! totally ordered delivery of opaque messages to every member of a
//! channel, interleaved with membership (view) changes in one agreed order.
//!
//! - [`LoopbackNetwork`]: in-process hub, one endpoint per connection
//! - [`TransportRegistry`]: maps locator schemes (`dummy://`, ...) to
//!   [`TransportFactory`] implementations
//!
//! # Design
//!
//! The trait is pull-based: the connection's delivery thread blocks in
//! [`Transport::recv`] and is the only consumer of a transport's stream.
//! Sending never blocks on delivery.

mod loopback;
mod registry;

use std::fmt::Debug;
use std::sync::Arc;

use crate::types::MemberId;

pub use loopback::{LoopbackEndpoint, LoopbackNetwork};
pub use registry::{DummyFactory, TransportRegistry, parse_locator};

// ============================================================================
// Deliveries
// ============================================================================

/// Membership of a channel as agreed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportView {
    /// Identifier of the view, unique per transport instance.
    pub view_id: u64,

    /// Members in the transport's agreed order.
    pub members: Vec<MemberId>,
}

/// One item of a transport's delivery stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A message broadcast by a member (possibly this one).
    Message { from: MemberId, payload: Vec<u8> },

    /// A membership change.
    View(TransportView),

    /// The endpoint was disconnected; no further deliveries follow.
    Closed,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors reported by transport backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Endpoint is not connected to a channel.
    #[error("not connected")]
    NotConnected,

    /// Endpoint is already connected.
    #[error("already connected to channel {0:?}")]
    AlreadyConnected(String),

    /// Message exceeds the transport's size limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The endpoint or its backend went away.
    #[error("transport disconnected")]
    Disconnected,

    /// Backend-specific failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl TransportError {
    /// Returns true if the endpoint cannot be used anymore.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Disconnected | TransportError::Backend(_))
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// One member's endpoint of a group transport.
///
/// # FCIS Pattern
///
/// The transport is part of the imperative shell. The pure group state
/// consumes [`Delivery`] items and produces messages; the connection moves
/// bytes between the two.
pub trait Transport: Debug + Send + Sync {
    /// Joins `channel` and returns this member's transport-assigned id.
    ///
    /// The first delivery after a successful connect is a view containing
    /// this member.
    fn connect(&self, channel: &str) -> Result<MemberId, TransportError>;

    /// Broadcasts a message to every member of the channel, including this
    /// one, in the channel's total order.
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Blocks until the next delivery.
    ///
    /// Returns [`Delivery::Closed`] once the endpoint has been
    /// disconnected.
    fn recv(&self) -> Result<Delivery, TransportError>;

    /// Leaves the channel. Wakes a blocked [`recv`](Transport::recv).
    ///
    /// Calling this more than once is harmless.
    fn disconnect(&self);

    /// Returns the largest message [`send`](Transport::send) accepts.
    fn max_message_size(&self) -> usize;
}

/// Creates transport endpoints for one locator scheme.
pub trait TransportFactory: Debug + Send + Sync {
    /// Creates an endpoint for the locator's address part.
    fn create(&self, address: &str) -> Result<Arc<dyn Transport>, TransportError>;
}
