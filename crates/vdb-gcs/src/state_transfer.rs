//! State transfer coordination.
//!
//! A member that needs the group's state (a *joiner*) asks for it through
//! the ordered stream. Every member selects the same *donor* for the
//! request, so the group agrees on who serves whom without a round of
//! voting. The snapshot itself travels outside the library; the library
//! only tracks the transfer's progress and keeps the joiner's stream
//! consistent with the snapshot.
//!
//! # Protocol Flow
//!
//! ```text
//! Joiner ──STATE_REQ (ordered)──► All: select donor, record transfer
//!   │                                   │
//!   │ holds TORDERED actions            ▼
//!   │                          Donor app receives STATE_REQ,
//!   │                          ships the snapshot out of band
//!   ▼
//! Joiner/Donor ──JOIN(status)──► All: joiner JOINED, backlog released
//!   │
//!   ▼
//! Joined member ──SYNC──► All: member SYNCED
//! ```
//!
//! # Joiner phases
//!
//! `Idle → Requested → DonorSelected → Transferring → Joined`, or
//! `Failed` when no donor exists, the donor departs or a JOIN reports an
//! error.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::GcsError;
use crate::quorum::QuorumDecision;
use crate::types::{MemberId, MemberStatus, Seqno};

// ============================================================================
// Donor selection
// ============================================================================

/// A member that could serve a state transfer.
#[derive(Debug, Clone, Copy)]
pub struct DonorCandidate<'a> {
    /// Member id.
    pub id: &'a MemberId,

    /// Node name the member published, if any.
    pub name: Option<&'a str>,

    /// Current status.
    pub status: MemberStatus,
}

impl DonorCandidate<'_> {
    /// Returns true if the candidate answers to `hint` by name or id.
    pub fn matches(&self, hint: &str) -> bool {
        self.name == Some(hint) || self.id.as_str() == hint
    }
}

/// Chooses the donor for a state transfer request.
///
/// Implementations must be deterministic: every member calls `select` with
/// identical arguments and must get the identical answer.
pub trait DonorSelector: Debug + Send + Sync {
    /// Returns the index (into `candidates`, which is in view order) of the
    /// donor for `joiner`, or `None` if nobody can serve.
    fn select(
        &self,
        joiner: &MemberId,
        hint: Option<&str>,
        candidates: &[DonorCandidate<'_>],
    ) -> Option<usize>;
}

/// Picks the hinted donor if it is synced, otherwise the first synced
/// member in view order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstSynced;

impl DonorSelector for FirstSynced {
    fn select(
        &self,
        joiner: &MemberId,
        hint: Option<&str>,
        candidates: &[DonorCandidate<'_>],
    ) -> Option<usize> {
        let eligible = |c: &DonorCandidate<'_>| c.id != joiner && c.status.can_donate();

        if let Some(hint) = hint {
            if let Some(index) = candidates
                .iter()
                .position(|c| eligible(c) && c.matches(hint))
            {
                return Some(index);
            }
        }
        candidates.iter().position(eligible)
    }
}

// ============================================================================
// Joiner phase
// ============================================================================

/// An ordered action held back while this member receives a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldAction {
    /// Action payload.
    pub payload: Bytes,

    /// Global seqno assigned on ordering.
    pub global_seqno: Seqno,

    /// Tag of a local `replicate` call waiting for this action.
    pub tag: Option<u64>,
}

/// This member's progress as a state transfer joiner.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JoinerPhase {
    /// No transfer in progress.
    #[default]
    Idle,
    /// Request sent, not yet ordered. Tracked by the connection, since only
    /// ordered messages reach the group state.
    Requested,
    /// Donor selected; nothing held yet.
    DonorSelected { donor: MemberId, request_seqno: Seqno },
    /// Receiving the snapshot; ordered actions are being held.
    Transferring {
        donor: MemberId,
        request_seqno: Seqno,
        held: VecDeque<HeldAction>,
    },
    /// Snapshot installed; waiting for SYNC.
    Joined,
    /// Last request failed; a new one is needed.
    Failed,
}

impl JoinerPhase {
    /// Returns the phase name for logging and queries.
    pub fn name(&self) -> &'static str {
        match self {
            JoinerPhase::Idle => "idle",
            JoinerPhase::Requested => "requested",
            JoinerPhase::DonorSelected { .. } => "donor-selected",
            JoinerPhase::Transferring { .. } => "transferring",
            JoinerPhase::Joined => "joined",
            JoinerPhase::Failed => "failed",
        }
    }

    /// Returns true while ordered actions are held back.
    pub fn is_holding(&self) -> bool {
        matches!(
            self,
            JoinerPhase::DonorSelected { .. } | JoinerPhase::Transferring { .. }
        )
    }

    /// Returns true if a new request may be issued.
    pub fn can_request(&self) -> bool {
        matches!(
            self,
            JoinerPhase::Idle | JoinerPhase::Failed | JoinerPhase::Joined
        )
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// A transfer in progress, as recorded by every member.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Transfer {
    donor: MemberId,
    request_seqno: Seqno,
}

/// Result of a granted state transfer request, returned to the joiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DonorGrant {
    /// Index of the donor in the current configuration.
    pub donor_index: usize,

    /// Local seqno consumed by the request.
    pub local_seqno: Seqno,
}

/// Donor chosen for an ordered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Donor id.
    pub donor: MemberId,

    /// Donor's index in the current view.
    pub donor_index: usize,
}

/// Local consequences of an ordered JOIN.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct JoinEffect {
    /// Surface the JOIN action to this member's application.
    pub surface: bool,

    /// This member just became `Joined` and must broadcast SYNC.
    pub send_sync: bool,

    /// Held actions to surface after the JOIN, in order.
    pub released: Vec<HeldAction>,

    /// Held actions that are not surfaced: covered by the snapshot, or
    /// discarded with a failed transfer.
    pub dropped: Vec<HeldAction>,
}

/// Tracks member statuses and state transfers for one group member.
#[derive(Debug)]
pub struct StateTransfer {
    me: MemberId,
    selector: Arc<dyn DonorSelector>,
    phase: JoinerPhase,
    statuses: BTreeMap<MemberId, MemberStatus>,
    transfers: BTreeMap<MemberId, Transfer>,
}

impl StateTransfer {
    /// Creates a coordinator with the default donor selector.
    pub fn new(me: MemberId) -> Self {
        Self::with_selector(me, Arc::new(FirstSynced))
    }

    /// Creates a coordinator with a custom donor selector.
    pub fn with_selector(me: MemberId, selector: Arc<dyn DonorSelector>) -> Self {
        Self {
            me,
            selector,
            phase: JoinerPhase::Idle,
            statuses: BTreeMap::new(),
            transfers: BTreeMap::new(),
        }
    }

    /// Returns this member's joiner phase.
    pub fn phase(&self) -> &JoinerPhase {
        &self.phase
    }

    /// Returns a member's status, `Joiner` if unknown.
    pub fn status(&self, member: &MemberId) -> MemberStatus {
        self.statuses.get(member).copied().unwrap_or_default()
    }

    /// Returns this member's status.
    pub fn my_status(&self) -> MemberStatus {
        self.status(&self.me)
    }

    /// Installs the statuses of a new configuration.
    ///
    /// Transfers whose joiner or donor left, and every transfer when the
    /// configuration is non-primary, are abandoned. Returns held actions
    /// this member had to drop.
    pub fn install(&mut self, decision: &QuorumDecision) -> Vec<HeldAction> {
        let present = |m: &MemberId| decision.members.iter().any(|d| &d.id == m);

        if decision.is_primary() {
            self.statuses = decision
                .members
                .iter()
                .map(|d| (d.id.clone(), d.status))
                .collect();
            let mut abandoned = Vec::new();
            self.transfers.retain(|joiner, t| {
                let keep = present(joiner) && present(&t.donor);
                if !keep {
                    tracing::info!(
                        joiner = %joiner,
                        donor = %t.donor,
                        "state transfer abandoned by membership change"
                    );
                    abandoned.push(t.donor.clone());
                }
                keep
            });
            for donor in abandoned {
                self.release_donor(&donor);
            }
        } else {
            self.transfers.clear();
        }

        // A joiner's own transfer survives only if it is still recorded.
        let mut dropped = Vec::new();
        if self.phase.is_holding() && !self.transfers.contains_key(&self.me) {
            dropped = self.fail_own();
        }

        match (self.my_status(), &self.phase) {
            (MemberStatus::Joiner, JoinerPhase::Joined) => self.phase = JoinerPhase::Idle,
            (MemberStatus::Synced, JoinerPhase::Failed) => self.phase = JoinerPhase::Idle,
            _ => {}
        }
        dropped
    }

    /// Handles an ordered state transfer request from `joiner`.
    ///
    /// `members` lists the view in order with published node names.
    pub fn on_request(
        &mut self,
        joiner: &MemberId,
        donor_hint: Option<&str>,
        members: &[(MemberId, Option<String>)],
        primary: bool,
        last_global: Seqno,
    ) -> Result<Assignment, GcsError> {
        let result = self.assign(joiner, donor_hint, members, primary, last_global);

        if joiner == &self.me {
            self.phase = match &result {
                Ok(a) => JoinerPhase::DonorSelected {
                    donor: a.donor.clone(),
                    request_seqno: last_global,
                },
                Err(GcsError::StateTransferInProgress) => self.phase.clone(),
                Err(_) => JoinerPhase::Failed,
            };
        }
        result
    }

    fn assign(
        &mut self,
        joiner: &MemberId,
        donor_hint: Option<&str>,
        members: &[(MemberId, Option<String>)],
        primary: bool,
        last_global: Seqno,
    ) -> Result<Assignment, GcsError> {
        if !primary {
            return Err(GcsError::NoDonor);
        }
        if self.transfers.contains_key(joiner) {
            return Err(GcsError::StateTransferInProgress);
        }

        let candidates: Vec<DonorCandidate<'_>> = members
            .iter()
            .map(|(id, name)| DonorCandidate {
                id,
                name: name.as_deref(),
                status: self.status(id),
            })
            .collect();

        let selected = self
            .selector
            .select(joiner, donor_hint, &candidates)
            .and_then(|index| candidates.get(index).map(|c| (index, c.id.clone())));
        let Some((donor_index, donor)) = selected else {
            tracing::info!(joiner = %joiner, "no donor available for state transfer");
            return Err(GcsError::NoDonor);
        };

        tracing::info!(
            joiner = %joiner,
            donor = %donor,
            request_seqno = %last_global,
            "state transfer donor selected"
        );

        self.statuses.insert(joiner.clone(), MemberStatus::Joiner);
        self.statuses.insert(donor.clone(), MemberStatus::Donor);
        self.transfers.insert(
            joiner.clone(),
            Transfer {
                donor: donor.clone(),
                request_seqno: last_global,
            },
        );

        Ok(Assignment { donor, donor_index })
    }

    /// Holds an ordered action if this member is receiving a snapshot.
    ///
    /// Returns the action back if it should be surfaced now.
    pub fn hold(&mut self, action: HeldAction) -> Option<HeldAction> {
        match std::mem::take(&mut self.phase) {
            JoinerPhase::DonorSelected {
                donor,
                request_seqno,
            } => {
                let mut held = VecDeque::new();
                held.push_back(action);
                self.phase = JoinerPhase::Transferring {
                    donor,
                    request_seqno,
                    held,
                };
                None
            }
            JoinerPhase::Transferring {
                donor,
                request_seqno,
                mut held,
            } => {
                held.push_back(action);
                self.phase = JoinerPhase::Transferring {
                    donor,
                    request_seqno,
                    held,
                };
                None
            }
            other => {
                self.phase = other;
                Some(action)
            }
        }
    }

    /// Handles an ordered JOIN from `from`.
    pub fn on_join(&mut self, from: &MemberId, status: i64) -> JoinEffect {
        let mut effect = JoinEffect::default();

        match self.status(from) {
            MemberStatus::Joiner => {
                let Some(transfer) = self.transfers.get(from).cloned() else {
                    tracing::warn!(member = %from, status, "JOIN without state transfer ignored");
                    return effect;
                };
                effect.surface = from == &self.me;
                self.finish_transfer(from, &transfer, status, &mut effect);
            }
            MemberStatus::Donor => {
                effect.surface = from == &self.me;
                self.statuses.insert(from.clone(), MemberStatus::Joined);
                effect.send_sync = from == &self.me;
                tracing::info!(member = %from, status, "donor finished state transfer");

                let served = self
                    .transfers
                    .iter()
                    .find(|(_, t)| &t.donor == from)
                    .map(|(j, t)| (j.clone(), t.clone()));
                if let Some((joiner, transfer)) = served {
                    if joiner == self.me {
                        effect.surface = true;
                    }
                    self.finish_transfer(&joiner, &transfer, status, &mut effect);
                }
            }
            other => {
                tracing::warn!(member = %from, status = %other, "unexpected JOIN ignored");
            }
        }
        effect
    }

    fn finish_transfer(
        &mut self,
        joiner: &MemberId,
        transfer: &Transfer,
        status: i64,
        effect: &mut JoinEffect,
    ) {
        self.transfers.remove(joiner);

        let snapshot = match status {
            0 => Some(transfer.request_seqno),
            s if s >= transfer.request_seqno.as_i64() => Some(Seqno::new(s)),
            _ => None,
        };

        let Some(snapshot) = snapshot else {
            tracing::warn!(
                joiner = %joiner,
                donor = %transfer.donor,
                status,
                request_seqno = %transfer.request_seqno,
                "state transfer failed"
            );
            self.release_donor(&transfer.donor);
            if joiner == &self.me {
                effect.dropped.extend(self.fail_own());
            }
            return;
        };

        tracing::info!(
            joiner = %joiner,
            donor = %transfer.donor,
            snapshot = %snapshot,
            "state transfer complete"
        );
        self.statuses.insert(joiner.clone(), MemberStatus::Joined);

        if joiner == &self.me {
            effect.send_sync = true;
            if let JoinerPhase::Transferring { held, .. } =
                std::mem::replace(&mut self.phase, JoinerPhase::Joined)
            {
                for action in held {
                    if action.global_seqno > snapshot {
                        effect.released.push(action);
                    } else {
                        effect.dropped.push(action);
                    }
                }
            }
        }
    }

    /// Returns a donor whose transfer ended without its JOIN to `Synced`,
    /// unless it still serves another joiner.
    fn release_donor(&mut self, donor: &MemberId) {
        let serving = self.transfers.values().any(|t| &t.donor == donor);
        if serving || self.status(donor) != MemberStatus::Donor {
            return;
        }
        self.statuses.insert(donor.clone(), MemberStatus::Synced);
        tracing::info!(donor = %donor, "donor released by failed state transfer");
    }

    fn fail_own(&mut self) -> Vec<HeldAction> {
        match std::mem::replace(&mut self.phase, JoinerPhase::Failed) {
            JoinerPhase::Transferring { held, .. } => held.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Handles an ordered SYNC from `from`.
    ///
    /// Returns true if the SYNC concerns this member.
    pub fn on_sync(&mut self, from: &MemberId) -> bool {
        if self.status(from) != MemberStatus::Joined {
            tracing::debug!(member = %from, "SYNC from member that is not joined ignored");
            return false;
        }
        self.statuses.insert(from.clone(), MemberStatus::Synced);
        tracing::info!(member = %from, "member synced");

        if from == &self.me {
            self.phase = JoinerPhase::Idle;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::MemberDecision;
    use crate::types::{ConfId, GroupUuid};

    fn id(name: &str) -> MemberId {
        MemberId::new(name).expect("valid member id")
    }

    fn decision(members: &[(&str, MemberStatus)]) -> QuorumDecision {
        QuorumDecision {
            conf_id: ConfId::new(1),
            group_uuid: GroupUuid::from_bytes([1; 16]),
            seqno: Seqno::new(10),
            members: members
                .iter()
                .map(|(n, s)| MemberDecision {
                    id: id(n),
                    name: None,
                    status: *s,
                    st_required: *s == MemberStatus::Joiner,
                })
                .collect(),
        }
    }

    fn view(names: &[&str]) -> Vec<(MemberId, Option<String>)> {
        names.iter().map(|n| (id(n), None)).collect()
    }

    fn held(global: i64) -> HeldAction {
        HeldAction {
            payload: Bytes::from(global.to_le_bytes().to_vec()),
            global_seqno: Seqno::new(global),
            tag: None,
        }
    }

    #[test]
    fn first_synced_prefers_hint() {
        let (a, b, c) = (id("a"), id("b"), id("c"));
        let candidates = [
            DonorCandidate {
                id: &a,
                name: Some("alpha"),
                status: MemberStatus::Synced,
            },
            DonorCandidate {
                id: &b,
                name: Some("beta"),
                status: MemberStatus::Synced,
            },
            DonorCandidate {
                id: &c,
                name: None,
                status: MemberStatus::Joiner,
            },
        ];
        let s = FirstSynced;
        assert_eq!(s.select(&c, None, &candidates), Some(0));
        assert_eq!(s.select(&c, Some("beta"), &candidates), Some(1));
        assert_eq!(s.select(&c, Some("b"), &candidates), Some(1));
        assert_eq!(s.select(&c, Some("nobody"), &candidates), Some(0));
        assert_eq!(s.select(&a, Some("alpha"), &candidates), Some(1));
    }

    #[test]
    fn no_donor_when_nobody_synced() {
        let mut st = StateTransfer::new(id("b"));
        st.install(&decision(&[
            ("a", MemberStatus::Joined),
            ("b", MemberStatus::Joiner),
        ]));
        let err = st
            .on_request(&id("b"), None, &view(&["a", "b"]), true, Seqno::new(10))
            .expect_err("no synced donor");
        assert_eq!(err, GcsError::NoDonor);
        assert_eq!(st.phase(), &JoinerPhase::Failed);
    }

    #[test]
    fn non_primary_request_has_no_donor() {
        let mut st = StateTransfer::new(id("b"));
        let err = st
            .on_request(&id("b"), None, &view(&["a", "b"]), false, Seqno::NIL)
            .expect_err("non-primary");
        assert!(err.is_retryable());
    }

    #[test]
    fn joiner_holds_and_releases_after_snapshot() {
        let mut st = StateTransfer::new(id("d"));
        st.install(&decision(&[
            ("a", MemberStatus::Synced),
            ("d", MemberStatus::Joiner),
        ]));
        assert!(st.phase().can_request());

        let assignment = st
            .on_request(&id("d"), None, &view(&["a", "d"]), true, Seqno::new(10))
            .expect("donor");
        assert_eq!(assignment.donor, id("a"));
        assert_eq!(assignment.donor_index, 0);
        assert_eq!(st.status(&id("a")), MemberStatus::Donor);
        assert!(st.phase().is_holding());

        for g in 11..=13 {
            assert!(st.hold(held(g)).is_none());
        }
        assert_eq!(st.phase().name(), "transferring");

        // Snapshot covers up to 11.
        let effect = st.on_join(&id("d"), 11);
        assert!(effect.surface);
        assert!(effect.send_sync);
        let released: Vec<i64> = effect
            .released
            .iter()
            .map(|a| a.global_seqno.as_i64())
            .collect();
        assert_eq!(released, vec![12, 13]);
        assert_eq!(effect.dropped.len(), 1);
        assert_eq!(st.my_status(), MemberStatus::Joined);
        assert_eq!(st.phase(), &JoinerPhase::Joined);

        assert!(st.on_sync(&id("d")));
        assert_eq!(st.my_status(), MemberStatus::Synced);
        assert_eq!(st.phase(), &JoinerPhase::Idle);
        assert!(st.hold(held(14)).is_some());
    }

    #[test]
    fn join_zero_uses_request_seqno() {
        let mut st = StateTransfer::new(id("d"));
        st.install(&decision(&[
            ("a", MemberStatus::Synced),
            ("d", MemberStatus::Joiner),
        ]));
        st.on_request(&id("d"), None, &view(&["a", "d"]), true, Seqno::new(10))
            .expect("donor");
        st.hold(held(11));
        let effect = st.on_join(&id("d"), 0);
        assert_eq!(effect.released.len(), 1);
        assert_eq!(effect.released[0].global_seqno, Seqno::new(11));
    }

    #[test]
    fn negative_join_fails_and_drops_backlog() {
        let mut st = StateTransfer::new(id("d"));
        st.install(&decision(&[
            ("a", MemberStatus::Synced),
            ("d", MemberStatus::Joiner),
        ]));
        st.on_request(&id("d"), None, &view(&["a", "d"]), true, Seqno::new(10))
            .expect("donor");
        st.hold(held(11));
        st.hold(held(12));

        let effect = st.on_join(&id("d"), -5);
        assert!(effect.surface);
        assert!(!effect.send_sync);
        assert!(effect.released.is_empty());
        assert_eq!(effect.dropped.len(), 2);
        assert_eq!(st.phase(), &JoinerPhase::Failed);
        assert_eq!(st.my_status(), MemberStatus::Joiner);
        assert_eq!(st.status(&id("a")), MemberStatus::Synced);

        // The same donor can serve the retry.
        let again = st
            .on_request(&id("d"), None, &view(&["a", "d"]), true, Seqno::new(12))
            .expect("second request");
        assert_eq!(again.donor, id("a"));
    }

    #[test]
    fn joiner_departure_releases_donor() {
        let mut st = StateTransfer::new(id("a"));
        st.install(&decision(&[
            ("a", MemberStatus::Synced),
            ("b", MemberStatus::Synced),
            ("d", MemberStatus::Joiner),
        ]));
        st.on_request(&id("d"), None, &view(&["a", "b", "d"]), true, Seqno::new(10))
            .expect("donor");
        assert_eq!(st.my_status(), MemberStatus::Donor);

        // The donor reports itself as Donor in the next exchange.
        st.install(&decision(&[
            ("a", MemberStatus::Donor),
            ("b", MemberStatus::Synced),
        ]));
        assert_eq!(st.my_status(), MemberStatus::Synced);
        assert_eq!(st.status(&id("b")), MemberStatus::Synced);
    }

    #[derive(Debug)]
    struct PastTheEnd;

    impl DonorSelector for PastTheEnd {
        fn select(
            &self,
            _joiner: &MemberId,
            _hint: Option<&str>,
            candidates: &[DonorCandidate<'_>],
        ) -> Option<usize> {
            Some(candidates.len())
        }
    }

    #[test]
    fn out_of_range_selection_has_no_donor() {
        let mut st = StateTransfer::with_selector(id("d"), Arc::new(PastTheEnd));
        st.install(&decision(&[
            ("a", MemberStatus::Synced),
            ("d", MemberStatus::Joiner),
        ]));
        let err = st
            .on_request(&id("d"), None, &view(&["a", "d"]), true, Seqno::new(10))
            .expect_err("index outside the view");
        assert_eq!(err, GcsError::NoDonor);
        assert_eq!(st.phase(), &JoinerPhase::Failed);
        assert_eq!(st.status(&id("a")), MemberStatus::Synced);
    }

    #[test]
    fn stale_snapshot_fails_transfer() {
        let mut st = StateTransfer::new(id("d"));
        st.install(&decision(&[
            ("a", MemberStatus::Synced),
            ("d", MemberStatus::Joiner),
        ]));
        st.on_request(&id("d"), None, &view(&["a", "d"]), true, Seqno::new(10))
            .expect("donor");
        let effect = st.on_join(&id("d"), 4);
        assert!(!effect.send_sync);
        assert_eq!(st.phase(), &JoinerPhase::Failed);
    }

    #[test]
    fn donor_join_completes_transfer_for_joiner() {
        let mut st = StateTransfer::new(id("d"));
        st.install(&decision(&[
            ("a", MemberStatus::Synced),
            ("d", MemberStatus::Joiner),
        ]));
        st.on_request(&id("d"), None, &view(&["a", "d"]), true, Seqno::new(10))
            .expect("donor");
        st.hold(held(11));

        let effect = st.on_join(&id("a"), 10);
        assert!(effect.surface, "joiner is concerned by its donor's JOIN");
        assert!(effect.send_sync);
        assert_eq!(effect.released.len(), 1);
        assert_eq!(st.status(&id("a")), MemberStatus::Joined);
        assert_eq!(st.my_status(), MemberStatus::Joined);
    }

    #[test]
    fn second_request_while_in_progress() {
        let mut st = StateTransfer::new(id("a"));
        st.install(&decision(&[
            ("a", MemberStatus::Synced),
            ("b", MemberStatus::Synced),
            ("d", MemberStatus::Joiner),
        ]));
        let v = view(&["a", "b", "d"]);
        st.on_request(&id("d"), None, &v, true, Seqno::new(10))
            .expect("donor");
        assert_eq!(
            st.on_request(&id("d"), None, &v, true, Seqno::new(10)),
            Err(GcsError::StateTransferInProgress)
        );
        assert_eq!(st.my_status(), MemberStatus::Donor);
        assert_eq!(st.phase(), &JoinerPhase::Idle, "donor's own phase is unaffected");
    }

    #[test]
    fn donor_departure_fails_transfer() {
        let mut st = StateTransfer::new(id("d"));
        st.install(&decision(&[
            ("a", MemberStatus::Synced),
            ("b", MemberStatus::Synced),
            ("d", MemberStatus::Joiner),
        ]));
        st.on_request(&id("d"), None, &view(&["a", "b", "d"]), true, Seqno::new(10))
            .expect("donor");
        st.hold(held(11));

        let dropped = st.install(&decision(&[
            ("b", MemberStatus::Synced),
            ("d", MemberStatus::Joiner),
        ]));
        assert_eq!(dropped.len(), 1);
        assert_eq!(st.phase(), &JoinerPhase::Failed);

        let again = st
            .on_request(&id("d"), None, &view(&["b", "d"]), true, Seqno::new(11))
            .expect("new donor");
        assert_eq!(again.donor, id("b"));
    }

    #[test]
    fn sync_requires_joined() {
        let mut st = StateTransfer::new(id("a"));
        st.install(&decision(&[("a", MemberStatus::Synced)]));
        assert!(!st.on_sync(&id("a")));
        assert_eq!(st.my_status(), MemberStatus::Synced);
    }
}
