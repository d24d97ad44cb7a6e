//! Messages exchanged between group members.
//!
//! Every transport message carries exactly one [`MessagePayload`], framed by
//! [`crate::codec`]. Application actions travel as [`Fragment`]s; everything
//! else is a service message generated by the library.
//!
//! # Message Flow
//!
//! ```text
//! Ordering:         member ── Action(Fragment) ──▶ all (incl. self)
//! State exchange:   member ── State ────────────▶ all, once per view
//! State transfer:   joiner/donor ── Join ───────▶ all
//!                   joined ── Sync ─────────────▶ all
//! Flow control:     member ── Flow ─────────────▶ all
//! Commit cut:       member ── LastApplied ──────▶ all
//! ```

use serde::{Deserialize, Serialize};

use crate::fragment::Fragment;
use crate::types::{ConfId, GroupUuid, MemberId, MemberStatus, Seqno};

/// The payload of one transport message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    /// One fragment of an application or library action.
    Action(Fragment),

    /// Member state published at the start of every view.
    State(StateMessage),

    /// Result of a state transfer, sent by the joiner or its donor.
    Join(JoinMessage),

    /// Sender has caught up with the group.
    Sync,

    /// Sender's receive queue report.
    Flow(FlowReport),

    /// Highest seqno the sender's application has applied.
    LastApplied(Seqno),
}

impl MessagePayload {
    /// Returns the message type name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            MessagePayload::Action(_) => "Action",
            MessagePayload::State(_) => "State",
            MessagePayload::Join(_) => "Join",
            MessagePayload::Sync => "Sync",
            MessagePayload::Flow(_) => "Flow",
            MessagePayload::LastApplied(_) => "LastApplied",
        }
    }
}

// ============================================================================
// State Exchange
// ============================================================================

/// A member's view of its own history, broadcast on every view change.
///
/// Once a member holds one of these from every member of the transport
/// view, it can compute the quorum decision without further communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMessage {
    /// Transport view this message belongs to.
    pub view_id: u64,

    /// History this member belongs to (nil if none).
    pub group_uuid: GroupUuid,

    /// Last global seqno this member has ordered or been told about.
    pub act_seqno: Seqno,

    /// Id of the last primary configuration this member was part of.
    pub prim_conf_id: ConfId,

    /// Members of that last primary configuration.
    pub prim_members: Vec<MemberId>,

    /// Member status at the time of the view change.
    pub status: MemberStatus,

    /// Node name from the configuration, if any.
    pub name: Option<String>,

    /// History uuid this member would use to bootstrap a new group.
    pub proposed_uuid: GroupUuid,
}

// ============================================================================
// State Transfer
// ============================================================================

/// JOIN: outcome of a state transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMessage {
    /// Snapshot seqno (`>= 0`), or a negative error code.
    pub status: i64,
}

/// Body of a `StateReq` action, carried inside fragments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequest {
    /// Preferred donor, matched against node names and member ids.
    pub donor_hint: Option<String>,

    /// Opaque application request, surfaced to the donor.
    pub request: Vec<u8>,
}

impl StateRequest {
    /// Encodes the request as an action payload.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decodes a request from an action payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

// ============================================================================
// Flow Control
// ============================================================================

/// FLOW: receive queue report of one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowReport {
    /// Sender's receive queue length.
    pub queue_len: u64,

    /// Whether the sender asks the group to pause.
    pub stopped: bool,
}
