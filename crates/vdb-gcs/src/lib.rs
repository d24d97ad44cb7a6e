//! # vdb-gcs: Group communication for replicated state machines
//!
//! This crate lets a set of processes form a named group and exchange
//! *actions* (opaque byte payloads) that every member of the group sees in
//! the same total order. It builds on a transport that provides ordered,
//! virtually synchronous delivery and adds what a replicated database
//! needs on top:
//!
//! - **Global sequence numbers**: every totally ordered action delivered in
//!   a primary configuration carries the same global seqno at every member
//! - **Primary component**: after a partition only the side holding a
//!   majority of the last primary configuration keeps ordering
//! - **State transfer coordination**: joiners are paired with donors
//!   through the total order, and ordered actions are held back until the
//!   joiner's snapshot is in place
//! - **Flow control**: members with long receive queues ask the group to
//!   pause
//!
//! ## Architecture
//!
//! ```text
//!  Application threads
//!       │ send / replicate / receive / request_state_transfer / join
//!       ▼
//! ┌──────────────────────┐
//! │  Connection          │  Lifecycle, receive queue, blocked callers
//! └──────────┬───────────┘
//!            │ fragments           ▲ actions, completions
//!            ▼                     │
//! ┌──────────────────────┐   ┌─────┴─────────────────┐
//! │  Transport           │──▶│  GroupState (pure)    │
//! │  (loopback, dummy)   │   │  views ─ quorum       │
//! └──────────────────────┘   │  sequencer ─ flow     │
//!                            │  state transfer       │
//!                            └───────────────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`connection`]: the application-facing handle and delivery thread
//! - [`group`]: the deterministic group state machine
//! - [`quorum`]: primary component computation after a view change
//! - [`state_transfer`]: donor selection and joiner bookkeeping
//! - [`transport`]: the transport trait, registry and loopback backend
//!
//! ## Example
//!
//! ```ignore
//! use vdb_gcs::{ActionType, Connection};
//!
//! let conn = Connection::create("dummy://")?;
//! conn.open("cluster")?;
//!
//! let conf = conn.receive()?.configuration().expect("first action is CONF");
//! assert!(conf.is_primary());
//!
//! let replicated = conn.replicate(b"insert", ActionType::Tordered)?;
//! println!("ordered as {}", replicated.global_seqno);
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow;
pub mod fragment;
pub mod group;
pub mod logging;
pub mod message;
pub mod quorum;
pub mod sequencer;
pub mod state_transfer;
pub mod transport;
pub mod types;
pub mod view;

#[cfg(test)]
mod tests;

pub use codec::{CodecError, HEADER_SIZE};
pub use config::{
    DEFAULT_FC_LOWER_LIMIT, DEFAULT_FC_UPPER_LIMIT, DEFAULT_PKT_SIZE,
    DEFAULT_RECV_QUEUE_HARD_LIMIT, GcsConfig, LogCallback, LogConfig, LogSink,
};
pub use connection::{ConnState, Connection, Replicated, SharedState, WaitStatus};
pub use error::{GcsError, GcsResult};
pub use group::{Delivered, GroupOutput, GroupState};
pub use message::{FlowReport, JoinMessage, MessagePayload, StateMessage, StateRequest};
pub use quorum::{MemberDecision, QuorumDecision, quorum_size};
pub use state_transfer::{DonorCandidate, DonorGrant, DonorSelector, FirstSynced, JoinerPhase};
pub use transport::{
    Delivery, DummyFactory, LoopbackEndpoint, LoopbackNetwork, Transport, TransportError,
    TransportFactory, TransportRegistry, TransportView,
};
pub use types::{
    Action, ActionType, ConfId, GROUP_UUID_LENGTH, GroupUuid, MEMBER_NAME_MAX, MemberId,
    MemberStatus, Seqno,
};
pub use view::Configuration;
