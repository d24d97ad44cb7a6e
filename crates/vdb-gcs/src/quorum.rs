//! Primary component (quorum) computation.
//!
//! Given the state messages of every member of a transport view, decides
//! whether the view is primary, which history it continues, the agreed
//! base seqno, and which members need a state transfer.
//!
//! The function is pure and deterministic: every member runs it over the
//! same ordered input and reaches the same decision.
//!
//! # Rule
//!
//! A history (group uuid) has quorum in a view if a strict majority of the
//! members of its last primary configuration is present. Among histories
//! with quorum, the one with the most surviving members wins, then the
//! highest last primary conf id, then the highest seqno, then the earliest
//! member in view order.
//!
//! If no member has ever been part of a primary configuration the view
//! bootstraps a new history under the first member's proposed uuid. Its
//! base seqno is the highest hinted seqno, and members whose hint matches
//! that position keep their state. A bootstrapped history never reuses the
//! hinted uuid, so seqnos it assigns never collide with the hinted
//! history's on a later merge.

use std::collections::BTreeMap;

use crate::message::StateMessage;
use crate::types::{ConfId, GroupUuid, MemberId, MemberStatus, Seqno};

/// Calculates the quorum size for a configuration of `members` members.
///
/// # Panics
///
/// Panics in debug builds if `members` is 0.
pub fn quorum_size(members: usize) -> usize {
    debug_assert!(members > 0, "configuration size must be positive");
    (members / 2) + 1
}

/// Outcome for one member of the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDecision {
    /// Member id.
    pub id: MemberId,

    /// Node name the member published.
    pub name: Option<String>,

    /// Status in the new configuration.
    pub status: MemberStatus,

    /// Whether the member must receive a state transfer.
    pub st_required: bool,
}

/// Result of a quorum computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumDecision {
    /// Conf id of the new configuration, `NON_PRIMARY` if no quorum.
    pub conf_id: ConfId,

    /// History continued by the primary configuration.
    pub group_uuid: GroupUuid,

    /// Base seqno of the primary configuration.
    pub seqno: Seqno,

    /// Per-member outcome, in view order.
    pub members: Vec<MemberDecision>,
}

impl QuorumDecision {
    /// Returns true if the view is primary.
    pub fn is_primary(&self) -> bool {
        self.conf_id.is_primary()
    }

    /// Returns the decision for a member.
    pub fn member(&self, id: &MemberId) -> Option<&MemberDecision> {
        self.members.iter().find(|m| &m.id == id)
    }
}

/// Summary of one history among the view's members.
#[derive(Debug)]
struct History<'a> {
    uuid: GroupUuid,
    latest: &'a StateMessage,
    present: usize,
    first_index: usize,
}

impl History<'_> {
    fn has_quorum(&self) -> bool {
        let total = self.latest.prim_members.len();
        total > 0 && self.present >= quorum_size(total)
    }
}

/// Computes the quorum decision for a view.
///
/// `states` holds every member of the view with its state message, in view
/// order. An empty input yields a non-primary decision with no members.
pub fn compute(states: &[(MemberId, StateMessage)]) -> QuorumDecision {
    let ids: Vec<&MemberId> = states.iter().map(|(id, _)| id).collect();

    // Group primary histories by uuid, keeping the most advanced state.
    let mut histories: BTreeMap<GroupUuid, History<'_>> = BTreeMap::new();
    for (index, (_, state)) in states.iter().enumerate() {
        if !state.prim_conf_id.is_primary() || state.group_uuid.is_nil() {
            continue;
        }
        histories
            .entry(state.group_uuid)
            .and_modify(|h| {
                let newer = (state.prim_conf_id, state.act_seqno)
                    > (h.latest.prim_conf_id, h.latest.act_seqno);
                if newer {
                    h.latest = state;
                }
            })
            .or_insert(History {
                uuid: state.group_uuid,
                latest: state,
                present: 0,
                first_index: index,
            });
    }
    for history in histories.values_mut() {
        history.present = history
            .latest
            .prim_members
            .iter()
            .filter(|m| ids.contains(m))
            .count();
    }

    if !histories.is_empty() {
        let winner = histories
            .values()
            .filter(|h| h.has_quorum())
            .max_by(|a, b| {
                (a.present, a.latest.prim_conf_id, a.latest.act_seqno)
                    .cmp(&(b.present, b.latest.prim_conf_id, b.latest.act_seqno))
                    .then(b.first_index.cmp(&a.first_index))
            });

        return match winner {
            Some(h) => primary(
                states,
                h.uuid,
                (h.uuid, h.latest.act_seqno),
                h.latest.prim_conf_id.next(),
            ),
            None => non_primary(states),
        };
    }

    bootstrap(states)
}

/// Bootstraps a history in a view where nobody was ever primary.
fn bootstrap(states: &[(MemberId, StateMessage)]) -> QuorumDecision {
    let Some((_, first)) = states.first() else {
        return non_primary(states);
    };

    let hinted = states
        .iter()
        .map(|(_, s)| s)
        .filter(|s| !s.group_uuid.is_nil())
        .fold(None::<&StateMessage>, |best, s| match best {
            Some(b) if b.act_seqno >= s.act_seqno => Some(b),
            _ => Some(s),
        });

    let base = match hinted {
        Some(s) => (s.group_uuid, s.act_seqno),
        None => (first.proposed_uuid, Seqno::NIL),
    };
    primary(states, first.proposed_uuid, base, ConfId::FIRST_PRIMARY)
}

/// Builds a primary decision for history `group_uuid`.
///
/// `base` is the `(uuid, seqno)` position a member must already hold to
/// skip state transfer. Members with nothing applied (`NIL`) match any base
/// at `NIL`.
fn primary(
    states: &[(MemberId, StateMessage)],
    group_uuid: GroupUuid,
    base: (GroupUuid, Seqno),
    conf_id: ConfId,
) -> QuorumDecision {
    let (base_uuid, seqno) = base;
    let members = states
        .iter()
        .map(|(id, state)| {
            let same_history = state.group_uuid == group_uuid;
            let unfinished = same_history
                && state.prim_conf_id.is_primary()
                && state.status == MemberStatus::Joiner;
            let st_required = state.act_seqno != seqno
                || (state.group_uuid != base_uuid && !state.act_seqno.is_nil())
                || unfinished;

            let status = if st_required {
                MemberStatus::Joiner
            } else if same_history && state.prim_conf_id.is_primary() {
                state.status
            } else {
                MemberStatus::Synced
            };

            MemberDecision {
                id: id.clone(),
                name: state.name.clone(),
                status,
                st_required,
            }
        })
        .collect();

    QuorumDecision {
        conf_id,
        group_uuid,
        seqno,
        members,
    }
}

fn non_primary(states: &[(MemberId, StateMessage)]) -> QuorumDecision {
    let members = states
        .iter()
        .map(|(id, state)| MemberDecision {
            id: id.clone(),
            name: state.name.clone(),
            status: state.status,
            st_required: false,
        })
        .collect();

    QuorumDecision {
        conf_id: ConfId::NON_PRIMARY,
        group_uuid: GroupUuid::NIL,
        seqno: Seqno::ILL,
        members,
    }
}
