//! Core types for the group communication service.
//!
//! This module defines the fundamental types used throughout the GCS:
//! - [`Seqno`] - Local and global action sequence numbers
//! - [`ConfId`] - Configuration identifier (`-1` for non-primary views)
//! - [`GroupUuid`] - Identifier of one group history
//! - [`MemberId`] - Transport-assigned identity of a group member
//! - [`ActionType`] / [`Action`] - Units of replicated work
//! - [`MemberStatus`] - Synchronization status of a member

use std::fmt::{Debug, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GcsError;
use crate::view::Configuration;

// ============================================================================
// Sequence Number - Copy (8-byte value)
// ============================================================================

/// Sequence number of an action.
///
/// The same type is used for local (per-node delivery order) and global
/// (group-wide total order) sequence numbers.
///
/// # Invariants
///
/// - `ILL` and `NIL` are never assigned to a real action
/// - Local seqnos handed to the application start at `FIRST` and have no gaps
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Seqno(i64);

impl Seqno {
    /// Illegal sequence number. Action not serialized.
    pub const ILL: Seqno = Seqno(-1);

    /// Empty state. No actions applied.
    pub const NIL: Seqno = Seqno(0);

    /// First sequence number assigned to an action.
    pub const FIRST: Seqno = Seqno(1);

    /// Creates a new sequence number.
    pub fn new(seqno: i64) -> Self {
        Self(seqno)
    }

    /// Returns the sequence number as an `i64`.
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns the next sequence number.
    pub fn next(&self) -> Self {
        Seqno(self.0.saturating_add(1))
    }

    /// Returns true for the empty-state sentinel.
    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if this seqno can identify a real action.
    pub fn is_assigned(&self) -> bool {
        self.0 >= Self::FIRST.0
    }

    /// Encodes the seqno as an 8-byte little-endian action payload.
    pub(crate) fn to_payload(self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_le_bytes())
    }

    /// Decodes a seqno from an 8-byte little-endian action payload.
    pub(crate) fn from_payload(payload: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = payload.try_into().ok()?;
        Some(Seqno(i64::from_le_bytes(bytes)))
    }
}

impl Display for Seqno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<i64> for Seqno {
    fn from(seqno: i64) -> Self {
        Self(seqno)
    }
}

impl From<Seqno> for i64 {
    fn from(seqno: Seqno) -> Self {
        seqno.0
    }
}

// ============================================================================
// Configuration Identifier - Copy (8-byte value)
// ============================================================================

/// Identifier of a configuration (view) of the group.
///
/// Primary configurations are numbered from zero and increase by one with
/// every primary view of a history. Non-primary configurations always carry
/// [`ConfId::NON_PRIMARY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfId(i64);

impl ConfId {
    /// Configuration id of every non-primary view.
    pub const NON_PRIMARY: ConfId = ConfId(-1);

    /// Id of the first primary view of a new history.
    pub const FIRST_PRIMARY: ConfId = ConfId(0);

    /// Creates a new configuration id.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the configuration id as an `i64`.
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns true if this id denotes a primary configuration.
    pub fn is_primary(&self) -> bool {
        self.0 >= 0
    }

    /// Returns the id of the primary view following this one.
    pub fn next(&self) -> Self {
        ConfId(self.0.max(-1).saturating_add(1))
    }
}

impl Default for ConfId {
    fn default() -> Self {
        Self::NON_PRIMARY
    }
}

impl Display for ConfId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_primary() {
            write!(f, "conf{}", self.0)
        } else {
            write!(f, "non-primary")
        }
    }
}

// ============================================================================
// Group UUID - Copy (16 bytes)
// ============================================================================

/// Length of a group history UUID in bytes.
pub const GROUP_UUID_LENGTH: usize = 16;

/// Identifier of one group history.
///
/// Stable for the lifetime of a history; a new one is generated only when a
/// brand-new history is bootstrapped.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupUuid(Uuid);

impl GroupUuid {
    /// The nil UUID: no history known.
    pub const NIL: GroupUuid = GroupUuid(Uuid::nil());

    /// Creates a UUID from raw bytes.
    pub const fn from_bytes(bytes: [u8; GROUP_UUID_LENGTH]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the UUID as a byte array.
    pub fn as_bytes(&self) -> &[u8; GROUP_UUID_LENGTH] {
        self.0.as_bytes()
    }

    /// Returns true for the nil UUID.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Generates a new random (version 4) UUID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupUuid {
    fn default() -> Self {
        Self::NIL
    }
}

impl Display for GroupUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0.hyphenated(), f)
    }
}

impl Debug for GroupUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupUuid({self})")
    }
}

// ============================================================================
// Member Identifier - Clone (short string)
// ============================================================================

/// Maximum member identifier length, including the terminating null of the
/// C representation.
pub const MEMBER_NAME_MAX: usize = 40;

/// Identity of a group member as assigned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Creates a member id.
    ///
    /// Fails if the id is empty, longer than `MEMBER_NAME_MAX - 1` bytes or
    /// contains a null byte.
    pub fn new(id: impl Into<String>) -> Result<Self, GcsError> {
        let id = id.into();
        if id.is_empty() || id.len() >= MEMBER_NAME_MAX || id.contains('\0') {
            return Err(GcsError::InvalidMemberId(id));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Action Type - Copy (small enum)
// ============================================================================

/// Type of an action.
///
/// Applications may originate `Tordered` and `CommitCut` actions, and
/// `StateReq` through [`request_state_transfer`]. Everything else is
/// synthesized by the library.
///
/// [`request_state_transfer`]: crate::Connection::request_state_transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    /// State change; assigned a global seqno when ordered in a primary view.
    Tordered,
    /// Group-wide commit cut.
    CommitCut,
    /// Request for state transfer.
    StateReq,
    /// New configuration.
    Conf,
    /// State transfer status.
    Join,
    /// Synchronized with the group.
    Sync,
    /// Flow control.
    Flow,
    /// Service action, sent by the library.
    Service,
    /// Error while receiving the action.
    Error,
    /// Undefined or unknown action type.
    Unknown,
}

impl ActionType {
    /// Returns true if the application may send actions of this type
    /// through `send`/`replicate`.
    pub fn is_sendable(&self) -> bool {
        matches!(self, ActionType::Tordered | ActionType::CommitCut)
    }
}

impl Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionType::Tordered => "tordered",
            ActionType::CommitCut => "commit-cut",
            ActionType::StateReq => "state-req",
            ActionType::Conf => "conf",
            ActionType::Join => "join",
            ActionType::Sync => "sync",
            ActionType::Flow => "flow",
            ActionType::Service => "service",
            ActionType::Error => "error",
            ActionType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Action - Clone (owns payload bytes)
// ============================================================================

/// An action delivered to the application.
///
/// # Invariants
///
/// - `local_seqno` is assigned exactly once, in delivery order, from `FIRST`
/// - `global_seqno` is `Some` only for `Tordered` actions ordered while the
///   view was primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Action type.
    pub act_type: ActionType,

    /// Action payload. Ownership passes to the caller on receive.
    pub payload: Bytes,

    /// Group-wide total order position.
    pub global_seqno: Option<Seqno>,

    /// Per-node gap-free delivery position.
    pub local_seqno: Seqno,
}

impl Action {
    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Returns true if this action was globally committed by a primary view.
    pub fn is_committed(&self) -> bool {
        self.act_type == ActionType::Tordered && self.global_seqno.is_some()
    }

    /// Decodes the configuration carried by a `Conf` action.
    pub fn configuration(&self) -> Option<Configuration> {
        if self.act_type != ActionType::Conf {
            return None;
        }
        Configuration::decode(&self.payload).ok()
    }

    /// Returns the status carried by a `Join` action.
    pub fn join_status(&self) -> Option<i64> {
        if self.act_type != ActionType::Join {
            return None;
        }
        Seqno::from_payload(&self.payload).map(|s| s.as_i64())
    }

    /// Returns the seqno carried by a library-generated `CommitCut` action.
    pub fn commit_cut(&self) -> Option<Seqno> {
        if self.act_type != ActionType::CommitCut {
            return None;
        }
        Seqno::from_payload(&self.payload)
    }
}

// ============================================================================
// Member Status - Copy (small enum)
// ============================================================================

/// Synchronization status of a member of a primary view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MemberStatus {
    /// Needs (or is receiving) a state transfer.
    #[default]
    Joiner,
    /// Serving a state transfer to a joiner.
    Donor,
    /// State transfer finished; catching up with the group.
    Joined,
    /// Fully synchronized with the group.
    Synced,
}

impl MemberStatus {
    /// Returns true if the member may serve as a state transfer donor.
    pub fn can_donate(&self) -> bool {
        matches!(self, MemberStatus::Synced)
    }

    /// Returns true if the member counts towards flow control.
    pub fn counts_for_flow_control(&self) -> bool {
        matches!(self, MemberStatus::Synced)
    }
}

impl Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Joiner => write!(f, "joiner"),
            MemberStatus::Donor => write!(f, "donor"),
            MemberStatus::Joined => write!(f, "joined"),
            MemberStatus::Synced => write!(f, "synced"),
        }
    }
}
