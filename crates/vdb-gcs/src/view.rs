//! Group configuration and the state exchange.
//!
//! Every transport view change starts a state exchange: each member
//! broadcasts a [`StateMessage`] and, once one has arrived from every member
//! of the view, runs the quorum computation. Because every member sees the
//! same messages in the same order, every member installs the same
//! configuration.
//!
//! ```text
//! transport view ──▶ begin() ──▶ broadcast own State
//!                                     │
//!        State from each member ──▶ on_state() ... ──▶ QuorumDecision
//!                                                           │
//!                                         configuration() ◀─┘
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::StateMessage;
use crate::quorum::{self, QuorumDecision};
use crate::transport::TransportView;
use crate::types::{ConfId, GroupUuid, MemberId, Seqno};

// ============================================================================
// Configuration
// ============================================================================

/// A group configuration as delivered to the application in `Conf` actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Last global seqno of the history at the start of this configuration.
    pub seqno: Seqno,

    /// Configuration id, `NON_PRIMARY` iff the configuration is non-primary.
    pub conf_id: ConfId,

    /// History this configuration belongs to.
    pub group_uuid: GroupUuid,

    /// Whether this member must receive a state transfer.
    pub st_required: bool,

    /// Members in view order.
    pub members: Vec<MemberId>,

    /// Index of this member in `members`.
    pub my_index: usize,
}

impl Configuration {
    /// Returns true if this configuration is primary.
    pub fn is_primary(&self) -> bool {
        self.conf_id.is_primary()
    }

    /// Returns the number of members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Returns this member's id.
    pub fn me(&self) -> Option<&MemberId> {
        self.members.get(self.my_index)
    }

    /// Encodes the configuration as a `Conf` action payload.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decodes a configuration from a `Conf` action payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

// ============================================================================
// State Exchange
// ============================================================================

#[derive(Debug)]
struct Exchange {
    view: TransportView,
    states: HashMap<MemberId, StateMessage>,
}

/// Runs the state exchange for each transport view.
#[derive(Debug, Default)]
pub struct ViewManager {
    exchange: Option<Exchange>,
}

impl ViewManager {
    /// Creates a view manager with no view installed.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn in_exchange(&self) -> bool {
        self.exchange.is_some()
    }

    /// Starts the exchange for a new transport view.
    ///
    /// Any unfinished exchange of an earlier view is abandoned.
    pub fn begin(&mut self, view: TransportView) {
        if let Some(old) = self.exchange.take() {
            tracing::debug!(
                old_view = old.view.view_id,
                new_view = view.view_id,
                collected = old.states.len(),
                "abandoning unfinished state exchange"
            );
        }
        self.exchange = Some(Exchange {
            view,
            states: HashMap::new(),
        });
    }

    /// Records a member's state message.
    ///
    /// Returns the quorum decision once every member of the view has been
    /// heard from. States of other views or from non-members are ignored.
    pub fn on_state(&mut self, from: &MemberId, state: StateMessage) -> Option<QuorumDecision> {
        let exchange = self.exchange.as_mut()?;

        if state.view_id != exchange.view.view_id {
            tracing::trace!(
                member = %from,
                view = state.view_id,
                current = exchange.view.view_id,
                "ignoring state message of another view"
            );
            return None;
        }
        if !exchange.view.members.contains(from) {
            tracing::warn!(member = %from, "state message from non-member");
            return None;
        }

        exchange.states.insert(from.clone(), state);
        if exchange.states.len() < exchange.view.members.len() {
            return None;
        }

        let exchange = self.exchange.take()?;
        let mut states = exchange.states;
        let ordered: Vec<(MemberId, StateMessage)> = exchange
            .view
            .members
            .iter()
            .filter_map(|m| states.remove(m).map(|s| (m.clone(), s)))
            .collect();

        Some(quorum::compute(&ordered))
    }

    /// Builds this member's configuration from a quorum decision.
    ///
    /// Non-primary configurations report the member's own history position.
    /// Returns `None` if `me` is not part of the decision.
    pub fn configuration(
        decision: &QuorumDecision,
        me: &MemberId,
        own_uuid: GroupUuid,
        own_seqno: Seqno,
    ) -> Option<Configuration> {
        let my_index = decision.members.iter().position(|m| &m.id == me)?;
        let members = decision.members.iter().map(|m| m.id.clone()).collect();

        let (seqno, group_uuid, st_required) = if decision.is_primary() {
            (
                decision.seqno,
                decision.group_uuid,
                decision.members[my_index].st_required,
            )
        } else {
            (own_seqno, own_uuid, false)
        };

        Some(Configuration {
            seqno,
            conf_id: decision.conf_id,
            group_uuid,
            st_required,
            members,
            my_index,
        })
    }
}
