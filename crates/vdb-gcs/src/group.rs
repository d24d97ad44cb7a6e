//! Pure group state machine.
//!
//! [`GroupState`] is the functional core of a connection. It consumes the
//! transport's delivery stream (views and decoded messages) and produces:
//!
//! - actions to hand to the application, with local and global seqnos
//! - completions for local callers waiting on their own actions
//! - service messages to broadcast
//!
//! It performs no I/O and reads no clocks, so a group of `GroupState`s fed
//! the same stream always reaches the same decisions.
//!
//! ```text
//!  Delivery::View ──▶ on_view() ──▶ State broadcast
//!                                        │
//!  Delivery::Message ─▶ on_message() ─┬─ State ──▶ quorum ──▶ CONF
//!                                     ├─ Action ─▶ reassemble ─▶ sequence ─▶ surface / hold
//!                                     ├─ Join / Sync ──▶ state transfer
//!                                     ├─ Flow ──▶ flow monitor
//!                                     └─ LastApplied ──▶ commit cut
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::CodecError;
use crate::error::GcsError;
use crate::flow::FlowMonitor;
use crate::fragment::{Reassembled, Reassembler};
use crate::message::{MessagePayload, StateMessage, StateRequest};
use crate::quorum::QuorumDecision;
use crate::sequencer::Sequencer;
use crate::state_transfer::{DonorGrant, DonorSelector, HeldAction, JoinerPhase, StateTransfer};
use crate::transport::TransportView;
use crate::types::{Action, ActionType, ConfId, GroupUuid, MemberId, MemberStatus, Seqno};
use crate::view::{Configuration, ViewManager};

// ============================================================================
// Output
// ============================================================================

/// Something the group produced for the local application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    /// An action to surface. `tag` is set for actions this member sent.
    Action { action: Action, tag: Option<u64> },

    /// Outcome of this member's state transfer request.
    StateRequest {
        tag: u64,
        outcome: Result<DonorGrant, GcsError>,
    },

    /// One of this member's actions was ordered but is covered by a state
    /// snapshot instead of being surfaced.
    Absorbed { tag: u64, global_seqno: Seqno },
}

/// Output of one step of the group state machine.
#[derive(Debug, Default)]
pub struct GroupOutput {
    /// Items for the local application, in order.
    pub delivered: Vec<Delivered>,

    /// Service messages to broadcast.
    pub broadcasts: Vec<MessagePayload>,

    /// Configuration installed during this step, if any.
    pub configuration: Option<Configuration>,
}

impl GroupOutput {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if nothing was produced.
    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty() && self.broadcasts.is_empty() && self.configuration.is_none()
    }
}

// ============================================================================
// Group State
// ============================================================================

/// Deterministic state of one member of the group.
#[derive(Debug)]
pub struct GroupState {
    me: MemberId,
    node_name: Option<String>,

    sequencer: Sequencer,
    reassembler: Reassembler,
    views: ViewManager,
    flow: FlowMonitor,
    transfer: StateTransfer,

    /// History position, published in state messages.
    group_uuid: GroupUuid,
    prim_conf_id: ConfId,
    prim_members: Vec<MemberId>,
    proposed_uuid: GroupUuid,

    /// Current members in view order, with published node names.
    members: Vec<(MemberId, Option<String>)>,
    configuration: Option<Configuration>,
    primary: bool,

    last_applied: HashMap<MemberId, Seqno>,
    commit_cut: Seqno,
}

impl GroupState {
    /// Creates the state of a member that resumes history `group_uuid` at
    /// `seqno`. Both are hints for the first state exchange.
    pub fn new(
        me: MemberId,
        node_name: Option<String>,
        group_uuid: GroupUuid,
        seqno: Seqno,
        selector: Arc<dyn DonorSelector>,
    ) -> Self {
        Self {
            transfer: StateTransfer::with_selector(me.clone(), selector),
            me,
            node_name,
            sequencer: Sequencer::resume(seqno),
            reassembler: Reassembler::new(),
            views: ViewManager::new(),
            flow: FlowMonitor::new(),
            group_uuid,
            prim_conf_id: ConfId::NON_PRIMARY,
            prim_members: Vec::new(),
            proposed_uuid: GroupUuid::generate(),
            members: Vec::new(),
            configuration: None,
            primary: false,
            last_applied: HashMap::new(),
            commit_cut: Seqno::NIL,
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Returns this member's id.
    pub fn me(&self) -> &MemberId {
        &self.me
    }

    /// Returns the current configuration, if one was installed.
    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    /// Returns true if global seqnos are currently being assigned.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Returns this member's status.
    pub fn my_status(&self) -> MemberStatus {
        self.transfer.my_status()
    }

    /// Returns this member's state transfer phase.
    pub fn phase(&self) -> &JoinerPhase {
        self.transfer.phase()
    }

    /// Returns true if flow control asks senders to pause.
    pub fn should_wait(&self) -> bool {
        self.flow.should_wait()
    }

    /// Returns the last global seqno ordered.
    pub fn last_global(&self) -> Seqno {
        self.sequencer.last_global()
    }

    /// Returns the last local seqno handed out.
    pub fn last_local(&self) -> Seqno {
        self.sequencer.last_local()
    }

    /// Returns the current group-wide commit cut.
    pub fn commit_cut(&self) -> Seqno {
        self.commit_cut
    }

    /// Returns the history this member belongs to.
    pub fn group_uuid(&self) -> GroupUuid {
        self.group_uuid
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    /// Handles a transport view change by starting a state exchange.
    pub fn on_view(&mut self, view: TransportView) -> GroupOutput {
        if !view.members.contains(&self.me) {
            tracing::warn!(
                member = %self.me,
                view = view.view_id,
                "transport view without this member ignored"
            );
            return GroupOutput::empty();
        }

        self.reassembler.retain_members(&view.members);
        self.flow.retain_members(&view.members);
        self.last_applied.retain(|m, _| view.members.contains(m));

        tracing::info!(
            member = %self.me,
            view = view.view_id,
            members = view.members.len(),
            partial_actions = self.reassembler.pending(),
            "transport view change, starting state exchange"
        );

        // Until the exchange completes, nothing is primary.
        self.primary = false;
        self.sequencer.set_non_primary();

        let state = StateMessage {
            view_id: view.view_id,
            group_uuid: self.group_uuid,
            act_seqno: self.sequencer.last_global(),
            prim_conf_id: self.prim_conf_id,
            prim_members: self.prim_members.clone(),
            status: self.transfer.my_status(),
            name: self.node_name.clone(),
            proposed_uuid: self.proposed_uuid,
        };
        self.views.begin(view);

        GroupOutput {
            broadcasts: vec![MessagePayload::State(state)],
            ..GroupOutput::default()
        }
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    /// Handles one message delivered by the transport.
    pub fn on_message(&mut self, from: &MemberId, payload: MessagePayload) -> GroupOutput {
        tracing::trace!(member = %self.me, from = %from, kind = payload.name(), "deliver");

        let mut output = GroupOutput::empty();
        match payload {
            MessagePayload::Action(fragment) => {
                if let Some(action) = self.reassembler.push(from, fragment) {
                    self.on_action(from, action, &mut output);
                }
            }
            MessagePayload::State(state) => {
                if let Some(decision) = self.views.on_state(from, state) {
                    self.install(decision, &mut output);
                }
            }
            MessagePayload::Join(join) => self.on_join(from, join.status, &mut output),
            MessagePayload::Sync => {
                if self.transfer.on_sync(from) {
                    self.surface(ActionType::Sync, Bytes::new(), None, None, &mut output);
                }
                self.refresh_flow();
            }
            MessagePayload::Flow(report) => self.flow.on_report(from, report),
            MessagePayload::LastApplied(seqno) => self.on_last_applied(from, seqno, &mut output),
        }
        output
    }

    fn on_action(&mut self, from: &MemberId, action: Reassembled, output: &mut GroupOutput) {
        let own_tag = (from == &self.me).then_some(action.tag);

        match action.act_type {
            ActionType::Tordered => {
                let global = self.sequencer.assign_global(ActionType::Tordered);
                if let Some(global_seqno) = global {
                    let held = HeldAction {
                        payload: action.data,
                        global_seqno,
                        tag: own_tag,
                    };
                    if let Some(held) = self.transfer.hold(held) {
                        self.surface(
                            ActionType::Tordered,
                            held.payload,
                            Some(held.global_seqno),
                            held.tag,
                            output,
                        );
                    }
                } else {
                    self.surface(ActionType::Tordered, action.data, None, own_tag, output);
                }
            }
            ActionType::CommitCut => {
                self.surface(ActionType::CommitCut, action.data, None, own_tag, output);
            }
            ActionType::StateReq => self.on_state_request(from, action, output),
            other => {
                tracing::warn!(
                    from = %from,
                    act_type = %other,
                    "dropping action of a type members may not send"
                );
            }
        }
    }

    fn on_state_request(&mut self, from: &MemberId, action: Reassembled, output: &mut GroupOutput) {
        let own = from == &self.me;

        let request = match StateRequest::decode(&action.data) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "malformed state request");
                if own {
                    output.delivered.push(Delivered::StateRequest {
                        tag: action.tag,
                        outcome: Err(GcsError::Codec(CodecError::Deserialize(e.to_string()))),
                    });
                }
                return;
            }
        };

        let outcome = self.transfer.on_request(
            from,
            request.donor_hint.as_deref(),
            &self.members,
            self.primary,
            self.sequencer.last_global(),
        );
        self.refresh_flow();

        if let Ok(assignment) = &outcome {
            if assignment.donor == self.me {
                self.surface(
                    ActionType::StateReq,
                    Bytes::from(request.request),
                    None,
                    None,
                    output,
                );
            }
        }

        if own {
            let outcome = outcome.map(|assignment| DonorGrant {
                donor_index: assignment.donor_index,
                local_seqno: self.sequencer.next_local(),
            });
            output.delivered.push(Delivered::StateRequest {
                tag: action.tag,
                outcome,
            });
        }
    }

    fn on_join(&mut self, from: &MemberId, status: i64, output: &mut GroupOutput) {
        let effect = self.transfer.on_join(from, status);
        self.refresh_flow();

        if effect.surface {
            self.surface(
                ActionType::Join,
                Seqno::new(status).to_payload(),
                None,
                None,
                output,
            );
        }
        for held in effect.released {
            self.surface(
                ActionType::Tordered,
                held.payload,
                Some(held.global_seqno),
                held.tag,
                output,
            );
        }
        absorb(effect.dropped, output);

        if effect.send_sync {
            output.broadcasts.push(MessagePayload::Sync);
        }
    }

    fn on_last_applied(&mut self, from: &MemberId, seqno: Seqno, output: &mut GroupOutput) {
        let entry = self.last_applied.entry(from.clone()).or_insert(Seqno::NIL);
        if seqno > *entry {
            *entry = seqno;
        }
        if !self.primary || self.members.is_empty() {
            return;
        }

        let cut = self
            .members
            .iter()
            .map(|(m, _)| self.last_applied.get(m).copied().unwrap_or(Seqno::NIL))
            .min()
            .unwrap_or(Seqno::NIL);

        if cut > self.commit_cut {
            tracing::debug!(member = %self.me, cut = %cut, "commit cut advanced");
            self.commit_cut = cut;
            self.surface(ActionType::CommitCut, cut.to_payload(), None, None, output);
        }
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    fn install(&mut self, decision: QuorumDecision, output: &mut GroupOutput) {
        let Some(conf) = ViewManager::configuration(
            &decision,
            &self.me,
            self.group_uuid,
            self.sequencer.last_global(),
        ) else {
            tracing::warn!(member = %self.me, "quorum decision without this member");
            return;
        };

        if decision.is_primary() {
            if self.group_uuid != decision.group_uuid {
                self.commit_cut = Seqno::NIL;
                self.last_applied.clear();
            }
            self.sequencer.set_primary(decision.seqno);
            self.group_uuid = decision.group_uuid;
            self.prim_conf_id = decision.conf_id;
            self.prim_members = conf.members.clone();
            self.primary = true;
        } else {
            self.sequencer.set_non_primary();
            self.primary = false;
        }

        self.members = decision
            .members
            .iter()
            .map(|m| (m.id.clone(), m.name.clone()))
            .collect();

        let dropped = self.transfer.install(&decision);
        absorb(dropped, output);
        self.refresh_flow();

        tracing::info!(
            member = %self.me,
            conf = %conf.conf_id,
            seqno = %conf.seqno,
            group = %conf.group_uuid,
            members = conf.members.len(),
            st_required = conf.st_required,
            "new configuration"
        );

        match conf.encode() {
            Ok(payload) => {
                self.surface(ActionType::Conf, Bytes::from(payload), None, None, output);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode configuration");
            }
        }

        self.configuration = Some(conf.clone());
        output.configuration = Some(conf);
    }

    fn refresh_flow(&mut self) {
        for (member, _) in &self.members {
            let counted = self.transfer.status(member).counts_for_flow_control();
            self.flow.set_counted(member, counted);
        }
    }

    /// Assigns the next local seqno and queues the action for the
    /// application.
    fn surface(
        &mut self,
        act_type: ActionType,
        payload: Bytes,
        global_seqno: Option<Seqno>,
        tag: Option<u64>,
        output: &mut GroupOutput,
    ) {
        let action = Action {
            act_type,
            payload,
            global_seqno,
            local_seqno: self.sequencer.next_local(),
        };
        output.delivered.push(Delivered::Action { action, tag });
    }
}

fn absorb(dropped: Vec<HeldAction>, output: &mut GroupOutput) {
    for held in dropped {
        if let Some(tag) = held.tag {
            output.delivered.push(Delivered::Absorbed {
                tag,
                global_seqno: held.global_seqno,
            });
        }
    }
}
