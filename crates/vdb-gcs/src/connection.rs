//! Connection handle and delivery thread.
//!
//! A [`Connection`] is the application's view of one group membership. It
//! owns a transport endpoint and a dedicated delivery thread that drives
//! the pure [`GroupState`] with the transport's stream.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Connection (handle)                        │
//! │  send / replicate / request_state_transfer ──▶ fragments ──┐     │
//! │  receive ◀── receive queue (Condvar) ◀──────────┐          │     │
//! │  replicate waits ◀── per-call rendezvous ◀──────┤          │     │
//! ├─────────────────────────────────────────────────┼──────────┼─────┤
//! │                   Delivery thread               │          ▼     │
//! │  1. Block in Transport::recv                    │     Transport  │
//! │  2. Decode frame, drive GroupState ─────────────┘          │     │
//! │  3. Broadcast service messages ────────────────────────────┘     │
//! │  4. Publish SharedState for queries                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Threading Model
//!
//! The delivery thread is the only mutator of the group state. Application
//! threads may call any method concurrently; a send lock keeps the
//! fragments of one action contiguous per sender.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::config::{GcsConfig, validate_pkt_size};
use crate::error::{GcsError, GcsResult};
use crate::flow::FlowReporter;
use crate::fragment;
use crate::group::{Delivered, GroupOutput, GroupState};
use crate::message::{FlowReport, JoinMessage, MessagePayload, StateRequest};
use crate::state_transfer::{DonorGrant, DonorSelector, FirstSynced, JoinerPhase};
use crate::transport::{Delivery, Transport, TransportError, TransportFactory, TransportRegistry};
use crate::types::{Action, ActionType, GroupUuid, MemberId, MemberStatus, Seqno};
use crate::view::Configuration;

// ============================================================================
// Public Types
// ============================================================================

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Not connected; `init` and `open` are allowed.
    Closed,
    /// `open` in progress.
    Opening,
    /// Connected. `primary` tells whether the current view is primary.
    Open { primary: bool },
    /// `close` in progress.
    Closing,
    /// Destroyed; every call fails.
    Destroyed,
}

impl ConnState {
    /// Returns true if the connection is open.
    pub fn is_open(&self) -> bool {
        matches!(self, ConnState::Open { .. })
    }
}

impl Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Closed => write!(f, "closed"),
            ConnState::Opening => write!(f, "opening"),
            ConnState::Open { primary: true } => write!(f, "open (primary)"),
            ConnState::Open { primary: false } => write!(f, "open (non-primary)"),
            ConnState::Closing => write!(f, "closing"),
            ConnState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Result of a successful `replicate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replicated {
    /// Global seqno; `ILL` for action types that are not globally ordered.
    pub global_seqno: Seqno,

    /// Local seqno; `ILL` if the action was absorbed by a state snapshot.
    pub local_seqno: Seqno,
}

/// Flow-control advice returned by `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Sending may proceed.
    Proceed,
    /// Some member is overloaded; senders should pause.
    WaitRecommended,
}

/// Connection state shared between the delivery thread and callers.
#[derive(Debug, Clone)]
pub struct SharedState {
    /// Lifecycle state.
    pub state: ConnState,
    /// Transport-assigned id while open.
    pub member: Option<MemberId>,
    /// Last installed configuration.
    pub configuration: Option<Configuration>,
    /// This member's status.
    pub member_status: MemberStatus,
    /// State transfer phase name.
    pub phase: &'static str,
    /// True while a state transfer is holding ordered actions.
    pub transferring: bool,
    /// Flow-control advice.
    pub should_wait: bool,
    /// Last global seqno ordered.
    pub last_global: Seqno,
    /// Last local seqno handed out.
    pub last_local: Seqno,
    /// Group-wide commit cut.
    pub commit_cut: Seqno,
    /// Fatal error that stopped the delivery thread.
    pub fatal: Option<GcsError>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            state: ConnState::Closed,
            member: None,
            configuration: None,
            member_status: MemberStatus::Joiner,
            phase: JoinerPhase::Idle.name(),
            transferring: false,
            should_wait: false,
            last_global: Seqno::NIL,
            last_local: Seqno::NIL,
            commit_cut: Seqno::NIL,
            fatal: None,
        }
    }
}

// ============================================================================
// Internals
// ============================================================================

/// A caller blocked on the ordering of its own message.
#[derive(Debug)]
enum Waiter {
    Replicate(SyncSender<GcsResult<Replicated>>),
    StateRequest(SyncSender<GcsResult<DonorGrant>>),
}

impl Waiter {
    fn fail(self, error: GcsError) {
        // A caller that already gave up is not an error.
        match self {
            Waiter::Replicate(tx) => {
                let _ = tx.send(Err(error));
            }
            Waiter::StateRequest(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

#[derive(Debug)]
struct RecvQueue {
    actions: VecDeque<Action>,
    reporter: FlowReporter,
    hard_limit: usize,
    closed: bool,
    fatal: Option<GcsError>,
}

impl RecvQueue {
    fn new(config: &GcsConfig) -> Self {
        Self {
            actions: VecDeque::new(),
            reporter: FlowReporter::new(config.fc_lower_limit, config.fc_upper_limit),
            hard_limit: config.recv_queue_hard_limit,
            closed: true,
            fatal: None,
        }
    }
}

/// State reachable from both the handle and the delivery thread.
#[derive(Debug)]
struct Core {
    queue: Mutex<RecvQueue>,
    queue_cv: Condvar,
    shared: RwLock<SharedState>,
    waiters: Mutex<HashMap<u64, Waiter>>,
    /// Set by `request_state_transfer` until the request is ordered.
    requested: Mutex<u32>,
}

impl Core {
    fn fail_waiters(&self, error: &GcsError) {
        let waiters: Vec<Waiter> = match self.waiters.lock() {
            Ok(mut waiters) => waiters.drain().map(|(_, w)| w).collect(),
            Err(_) => return,
        };
        for waiter in waiters {
            waiter.fail(error.clone());
        }
    }

    fn take_waiter(&self, tag: u64) -> Option<Waiter> {
        self.waiters.lock().expect("lock poisoned").remove(&tag)
    }

    fn set_state(&self, state: ConnState) {
        if let Ok(mut shared) = self.shared.write() {
            shared.state = state;
        }
    }

    fn state(&self) -> ConnState {
        self.shared
            .read()
            .map(|s| s.state)
            .unwrap_or(ConnState::Closed)
    }
}

#[derive(Debug)]
struct Lifecycle {
    hint_uuid: GroupUuid,
    hint_seqno: Seqno,
    delivery: Option<JoinHandle<()>>,
}

struct Inner {
    factory: Arc<dyn TransportFactory>,
    address: String,
    config: RwLock<GcsConfig>,
    pkt_size: AtomicUsize,
    selector: RwLock<Arc<dyn DonorSelector>>,
    lifecycle: Mutex<Lifecycle>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    core: Arc<Core>,
    next_tag: AtomicU64,
    send_lock: Mutex<()>,
}

impl Inner {
    fn transport(&self) -> GcsResult<Arc<dyn Transport>> {
        self.transport
            .read()
            .expect("lock poisoned")
            .clone()
            .ok_or(GcsError::Shutdown)
    }

    fn broadcast(&self, payload: &MessagePayload) -> GcsResult<()> {
        let frame = codec::encode(payload)?;
        self.transport()?.send(frame)?;
        Ok(())
    }

    /// Disconnects and joins the delivery thread. Returns false if the
    /// connection was not running.
    fn stop(&self, lifecycle: &mut Lifecycle) -> bool {
        let transport = self.transport.write().expect("lock poisoned").take();
        let Some(transport) = transport else {
            return false;
        };
        transport.disconnect();

        if let Some(handle) = lifecycle.delivery.take() {
            if handle.join().is_err() {
                error!("delivery thread panicked");
            }
        }

        self.core.fail_waiters(&GcsError::Shutdown);
        {
            let mut queue = self.core.queue.lock().expect("lock poisoned");
            queue.closed = true;
            queue.actions.clear();
        }
        self.core.queue_cv.notify_all();
        *self.core.requested.lock().expect("lock poisoned") = 0;
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut lifecycle) = self.lifecycle.lock() {
            if self.stop(&mut lifecycle) {
                debug!("connection dropped while open, closed");
            }
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Handle on one group connection. Clones share the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.inner.address)
            .field("state", &self.status())
            .finish()
    }
}

impl Connection {
    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Creates a connection for a `scheme://address` locator with the
    /// built-in backends and default configuration.
    pub fn create(locator: &str) -> GcsResult<Self> {
        Self::create_with(locator, GcsConfig::default(), &TransportRegistry::default())
    }

    /// Creates a connection with an explicit configuration and registry.
    pub fn create_with(
        locator: &str,
        config: GcsConfig,
        registry: &TransportRegistry,
    ) -> GcsResult<Self> {
        config.validate()?;
        let (factory, address) = registry.resolve(locator)?;

        debug!(locator, "connection created");

        let core = Core {
            queue: Mutex::new(RecvQueue::new(&config)),
            queue_cv: Condvar::new(),
            shared: RwLock::new(SharedState::default()),
            waiters: Mutex::new(HashMap::new()),
            requested: Mutex::new(0),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                factory,
                address,
                pkt_size: AtomicUsize::new(config.pkt_size),
                config: RwLock::new(config),
                selector: RwLock::new(Arc::new(FirstSynced)),
                lifecycle: Mutex::new(Lifecycle {
                    hint_uuid: GroupUuid::NIL,
                    hint_seqno: Seqno::NIL,
                    delivery: None,
                }),
                transport: RwLock::new(None),
                core: Arc::new(core),
                next_tag: AtomicU64::new(1),
                send_lock: Mutex::new(()),
            }),
        })
    }

    /// Sets the history position this node resumes from.
    ///
    /// Only a hint for the state exchange; allowed only while closed.
    pub fn init(&self, seqno: Seqno, group_uuid: GroupUuid) -> GcsResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().expect("lock poisoned");
        match self.inner.core.state() {
            ConnState::Closed => {
                lifecycle.hint_seqno = seqno;
                lifecycle.hint_uuid = group_uuid;
                debug!(seqno = %seqno, group = %group_uuid, "history position hint set");
                Ok(())
            }
            ConnState::Destroyed => Err(GcsError::Destroyed),
            other => Err(GcsError::invalid_state("init", other)),
        }
    }

    /// Replaces the donor selection policy. Allowed only while closed.
    pub fn set_donor_selector(&self, selector: Arc<dyn DonorSelector>) -> GcsResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().expect("lock poisoned");
        match self.inner.core.state() {
            ConnState::Closed => {
                *self.inner.selector.write().expect("lock poisoned") = selector;
                Ok(())
            }
            ConnState::Destroyed => Err(GcsError::Destroyed),
            other => Err(GcsError::invalid_state("set donor selector", other)),
        }
    }

    /// Joins `channel` and starts the delivery thread.
    ///
    /// The first action received afterwards is the `Conf` of the first
    /// view.
    pub fn open(&self, channel: &str) -> GcsResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().expect("lock poisoned");
        match self.inner.core.state() {
            ConnState::Closed => {}
            ConnState::Destroyed => return Err(GcsError::Destroyed),
            ConnState::Open { .. } | ConnState::Opening => return Err(GcsError::AlreadyOpen),
            ConnState::Closing => return Err(GcsError::Busy),
        }
        self.inner.core.set_state(ConnState::Opening);

        match self.start(&mut lifecycle, channel) {
            Ok(member) => {
                info!(channel, member = %member, "connection open");
                Ok(())
            }
            Err(e) => {
                warn!(channel, error = %e, "open failed");
                let transport = self.inner.transport.write().expect("lock poisoned").take();
                if let Some(transport) = transport {
                    transport.disconnect();
                }
                self.inner.core.set_state(ConnState::Closed);
                Err(e)
            }
        }
    }

    fn start(&self, lifecycle: &mut Lifecycle, channel: &str) -> GcsResult<MemberId> {
        let config = self.inner.config.read().expect("lock poisoned").clone();

        let transport = self.inner.factory.create(&self.inner.address)?;
        *self.inner.transport.write().expect("lock poisoned") = Some(Arc::clone(&transport));

        let pkt_size = config.pkt_size.min(transport.max_message_size());
        validate_pkt_size(pkt_size)?;
        self.inner.pkt_size.store(pkt_size, Ordering::Release);

        let member = transport.connect(channel)?;

        *self.inner.core.queue.lock().expect("lock poisoned") = RecvQueue {
            closed: false,
            ..RecvQueue::new(&config)
        };
        self.inner.core.fail_waiters(&GcsError::Shutdown);
        *self.inner.core.shared.write().expect("lock poisoned") = SharedState {
            state: ConnState::Open { primary: false },
            member: Some(member.clone()),
            ..SharedState::default()
        };

        let group = GroupState::new(
            member.clone(),
            config.node_name.clone(),
            lifecycle.hint_uuid,
            lifecycle.hint_seqno,
            Arc::clone(&self.inner.selector.read().expect("lock poisoned")),
        );
        let delivery = DeliveryLoop {
            core: Arc::clone(&self.inner.core),
            transport,
            group,
        };

        let handle = thread::Builder::new()
            .name(format!("gcs-delivery-{member}"))
            .spawn(move || delivery.run())
            .map_err(|e| {
                TransportError::Backend(format!("failed to spawn delivery thread: {e}"))
            })?;
        lifecycle.delivery = Some(handle);

        Ok(member)
    }

    /// Leaves the group and stops the delivery thread.
    ///
    /// Threads blocked in `receive`, `replicate` or
    /// `request_state_transfer` wake up with [`GcsError::Shutdown`].
    pub fn close(&self) -> GcsResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().expect("lock poisoned");
        match self.inner.core.state() {
            ConnState::Open { .. } => {}
            ConnState::Destroyed => return Err(GcsError::Destroyed),
            other => return Err(GcsError::invalid_state("close", other)),
        }
        self.inner.core.set_state(ConnState::Closing);

        self.inner.stop(&mut lifecycle);

        self.inner.core.set_state(ConnState::Closed);
        info!(address = %self.inner.address, "connection closed");
        Ok(())
    }

    /// Releases the connection. Allowed only while closed; every later
    /// call fails with [`GcsError::Destroyed`].
    pub fn destroy(&self) -> GcsResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().expect("lock poisoned");
        match self.inner.core.state() {
            ConnState::Closed => {
                self.inner.core.set_state(ConnState::Destroyed);
                debug!(address = %self.inner.address, "connection destroyed");
                Ok(())
            }
            ConnState::Destroyed => Err(GcsError::Destroyed),
            other => Err(GcsError::invalid_state("destroy", other)),
        }
    }

    // ------------------------------------------------------------------------
    // Data plane
    // ------------------------------------------------------------------------

    /// Sends an action to the group without waiting for it to be ordered.
    ///
    /// Returns the number of payload bytes sent. The action comes back
    /// through `receive` like any other.
    pub fn send(&self, payload: &[u8], act_type: ActionType) -> GcsResult<usize> {
        self.check_sendable(act_type)?;
        let tag = self.next_tag();
        self.send_action(tag, act_type, payload)?;
        Ok(payload.len())
    }

    /// Sends an action and waits until it is ordered.
    ///
    /// The action is returned here instead of through `receive`. A
    /// `Tordered` action ordered in a non-primary configuration fails with
    /// [`GcsError::NotCommitted`], carrying the local seqno it consumed.
    pub fn replicate(&self, payload: &[u8], act_type: ActionType) -> GcsResult<Replicated> {
        self.check_sendable(act_type)?;
        let tag = self.next_tag();

        let (tx, rx) = mpsc::sync_channel(1);
        self.register(tag, Waiter::Replicate(tx));
        if let Err(e) = self.send_action(tag, act_type, payload) {
            self.inner.core.take_waiter(tag);
            return Err(e);
        }

        trace!(tag, "waiting for replication");
        rx.recv().map_err(|_| GcsError::Shutdown)?
    }

    /// Blocks until the next action is available.
    pub fn receive(&self) -> GcsResult<Action> {
        match self.inner.core.state() {
            ConnState::Destroyed => return Err(GcsError::Destroyed),
            ConnState::Closed => {
                return Err(GcsError::invalid_state("receive", ConnState::Closed));
            }
            _ => {}
        }

        let (action, report) = {
            let mut queue = self.inner.core.queue.lock().expect("lock poisoned");
            loop {
                if let Some(fatal) = &queue.fatal {
                    return Err(fatal.clone());
                }
                if queue.closed {
                    return Err(GcsError::Shutdown);
                }
                if let Some(action) = queue.actions.pop_front() {
                    let len = queue.actions.len();
                    break (action, queue.reporter.update(len));
                }
                queue = self
                    .inner
                    .core
                    .queue_cv
                    .wait(queue)
                    .expect("lock poisoned");
            }
        };

        if let Some(report) = report {
            self.report_flow(report);
        }
        Ok(action)
    }

    // ------------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------------

    /// Returns flow-control advice. Never blocks.
    pub fn wait(&self) -> GcsResult<WaitStatus> {
        let shared = self.open_state("wait")?;
        Ok(if shared.should_wait {
            WaitStatus::WaitRecommended
        } else {
            WaitStatus::Proceed
        })
    }

    /// Requests a state transfer from any eligible donor.
    pub fn request_state_transfer(&self, request: &[u8]) -> GcsResult<DonorGrant> {
        self.request_state_transfer_from(request, None)
    }

    /// Requests a state transfer, preferring the donor named `donor`
    /// (matched against node names and member ids).
    ///
    /// Fails with [`GcsError::NoDonor`] if nobody can serve right now.
    pub fn request_state_transfer_from(
        &self,
        request: &[u8],
        donor: Option<&str>,
    ) -> GcsResult<DonorGrant> {
        let shared = self.open_state("request state transfer")?;
        if shared.transferring {
            return Err(GcsError::StateTransferInProgress);
        }

        let body = StateRequest {
            donor_hint: donor.map(str::to_string),
            request: request.to_vec(),
        }
        .encode()
        .map_err(|e| codec::CodecError::Serialize(e.to_string()))?;

        let tag = self.next_tag();
        let (tx, rx) = mpsc::sync_channel(1);
        self.register(tag, Waiter::StateRequest(tx));
        *self.inner.core.requested.lock().expect("lock poisoned") += 1;

        let result = match self.send_action(tag, ActionType::StateReq, &body) {
            Ok(()) => rx.recv().map_err(|_| GcsError::Shutdown).and_then(|r| r),
            Err(e) => {
                self.inner.core.take_waiter(tag);
                Err(e)
            }
        };

        {
            let mut requested = self.inner.core.requested.lock().expect("lock poisoned");
            *requested = requested.saturating_sub(1);
        }

        match &result {
            Ok(grant) => info!(
                donor_index = grant.donor_index,
                local_seqno = %grant.local_seqno,
                "state transfer granted"
            ),
            Err(e) => debug!(error = %e, "state transfer request failed"),
        }
        result
    }

    /// Reports the outcome of a state transfer this member took part in.
    ///
    /// `status >= 0` is the snapshot seqno (0: as of the request); a
    /// negative status reports failure.
    pub fn join(&self, status: i64) -> GcsResult<()> {
        let shared = self.open_state("join")?;
        if matches!(
            shared.member_status,
            MemberStatus::Joined | MemberStatus::Synced
        ) {
            return Err(GcsError::invalid_state("join", shared.member_status));
        }
        debug!(status, "sending JOIN");
        self.inner
            .broadcast(&MessagePayload::Join(JoinMessage { status }))
    }

    /// Reports the highest seqno the application has applied.
    ///
    /// The group surfaces a `CommitCut` action whenever the minimum over
    /// all members advances.
    pub fn set_last_applied(&self, seqno: Seqno) -> GcsResult<()> {
        self.open_state("set last applied")?;
        self.inner.broadcast(&MessagePayload::LastApplied(seqno))
    }

    /// Returns the last global seqno ordered at this member.
    pub fn caused(&self) -> GcsResult<Seqno> {
        Ok(self.open_state("caused")?.last_global)
    }

    /// Changes the fragmentation threshold. Returns the effective size,
    /// which is capped by the transport's limit while open.
    pub fn set_pkt_size(&self, pkt_size: usize) -> GcsResult<usize> {
        validate_pkt_size(pkt_size)?;
        if self.inner.core.state() == ConnState::Destroyed {
            return Err(GcsError::Destroyed);
        }

        let effective = match self.inner.transport() {
            Ok(transport) => pkt_size.min(transport.max_message_size()),
            Err(_) => pkt_size,
        };
        validate_pkt_size(effective)?;

        self.inner.config.write().expect("lock poisoned").pkt_size = pkt_size;
        self.inner.pkt_size.store(effective, Ordering::Release);
        debug!(requested = pkt_size, effective, "packet size changed");
        Ok(effective)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Returns a snapshot of the shared connection state.
    pub fn status(&self) -> SharedState {
        let mut shared = self
            .inner
            .core
            .shared
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        let requested = self.inner.core.requested.lock().map(|r| *r).unwrap_or(0);
        if requested > 0 && !shared.transferring {
            shared.phase = JoinerPhase::Requested.name();
        }
        shared
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ConnState {
        self.inner.core.state()
    }

    /// Returns the last installed configuration.
    pub fn configuration(&self) -> Option<Configuration> {
        self.status().configuration
    }

    /// Returns this member's status in the group.
    pub fn member_status(&self) -> MemberStatus {
        self.status().member_status
    }

    /// Returns the transport-assigned member id while open.
    pub fn member_id(&self) -> Option<MemberId> {
        self.status().member
    }

    /// Returns the effective packet size.
    pub fn pkt_size(&self) -> usize {
        self.inner.pkt_size.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn next_tag(&self) -> u64 {
        self.inner.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, tag: u64, waiter: Waiter) {
        self.inner
            .core
            .waiters
            .lock()
            .expect("lock poisoned")
            .insert(tag, waiter);
    }

    /// Returns the shared state if the connection is usable for `operation`.
    fn open_state(&self, operation: &'static str) -> GcsResult<SharedState> {
        let shared = self.status();
        match shared.state {
            ConnState::Open { .. } => {}
            ConnState::Destroyed => return Err(GcsError::Destroyed),
            ConnState::Closing => return Err(GcsError::Shutdown),
            other => return Err(GcsError::invalid_state(operation, other)),
        }
        if let Some(fatal) = &shared.fatal {
            return Err(fatal.clone());
        }
        Ok(shared)
    }

    fn check_sendable(&self, act_type: ActionType) -> GcsResult<()> {
        if !act_type.is_sendable() {
            return Err(GcsError::InvalidActionType(act_type));
        }
        let shared = self.open_state("send")?;
        if act_type == ActionType::Tordered && shared.transferring {
            return Err(GcsError::StateTransferInProgress);
        }
        Ok(())
    }

    fn send_action(&self, tag: u64, act_type: ActionType, payload: &[u8]) -> GcsResult<()> {
        let transport = self.inner.transport()?;
        let pkt_size = self.pkt_size();
        let fragments = fragment::split(tag, act_type, payload, pkt_size);
        let count = fragments.len();

        let _guard = self.inner.send_lock.lock().expect("lock poisoned");
        for f in fragments {
            let frame = codec::encode(&MessagePayload::Action(f))?;
            transport.send(frame)?;
        }
        trace!(tag, act_type = %act_type, bytes = payload.len(), fragments = count, "action sent");
        Ok(())
    }

    fn report_flow(&self, report: FlowReport) {
        if let Err(e) = self.inner.broadcast(&MessagePayload::Flow(report)) {
            warn!(error = %e, "failed to send flow-control report");
        }
    }
}

// ============================================================================
// Delivery Loop
// ============================================================================

/// Drives the group state from the transport stream. Runs on its own
/// thread until the transport reports closure or a fatal error.
struct DeliveryLoop {
    core: Arc<Core>,
    transport: Arc<dyn Transport>,
    group: GroupState,
}

impl DeliveryLoop {
    fn run(mut self) {
        info!(member = %self.group.me(), "delivery loop starting");

        loop {
            let result = match self.transport.recv() {
                Ok(Delivery::Closed) => break,
                Ok(Delivery::View(view)) => {
                    let output = self.group.on_view(view);
                    self.handle_output(output)
                }
                Ok(Delivery::Message { from, payload }) => match codec::decode(&payload) {
                    Ok(message) => {
                        let output = self.group.on_message(&from, message);
                        self.handle_output(output)
                    }
                    Err(e) => {
                        warn!(from = %from, error = %e, "dropping corrupt message");
                        Ok(())
                    }
                },
                Err(e) if e.is_fatal() => Err(GcsError::Transport(e)),
                Err(e) => {
                    warn!(error = %e, "transport receive error");
                    Ok(())
                }
            };

            if let Err(e) = result {
                self.fail(e);
                break;
            }
        }

        info!(member = %self.group.me(), "delivery loop stopped");
    }

    fn handle_output(&mut self, output: GroupOutput) -> GcsResult<()> {
        let installed = output.configuration.is_some();

        // Callers woken below must observe the state after this step.
        self.publish(output.configuration);

        for delivered in output.delivered {
            self.route(delivered)?;
        }
        for message in &output.broadcasts {
            self.send(message)?;
        }

        // New members must learn about a pause that is already in effect.
        if installed {
            let resend = {
                let queue = self.core.queue.lock().expect("lock poisoned");
                queue.reporter.is_stopped().then(|| FlowReport {
                    queue_len: queue.actions.len() as u64,
                    stopped: true,
                })
            };
            if let Some(report) = resend {
                self.send(&MessagePayload::Flow(report))?;
            }
        }
        Ok(())
    }

    fn route(&mut self, delivered: Delivered) -> GcsResult<()> {
        match delivered {
            Delivered::Action {
                action,
                tag: Some(tag),
            } => match self.core.take_waiter(tag) {
                Some(Waiter::Replicate(tx)) => {
                    let result = match (action.act_type, action.global_seqno) {
                        (ActionType::Tordered, None) => Err(GcsError::NotCommitted {
                            local_seqno: action.local_seqno,
                        }),
                        (_, global) => Ok(Replicated {
                            global_seqno: global.unwrap_or(Seqno::ILL),
                            local_seqno: action.local_seqno,
                        }),
                    };
                    let _ = tx.send(result);
                    Ok(())
                }
                Some(other) => {
                    warn!(tag, "action completed a waiter of another kind");
                    other.fail(GcsError::Shutdown);
                    self.enqueue(action)
                }
                None => self.enqueue(action),
            },
            Delivered::Action { action, tag: None } => self.enqueue(action),
            Delivered::StateRequest { tag, outcome } => {
                match self.core.take_waiter(tag) {
                    Some(Waiter::StateRequest(tx)) => {
                        let _ = tx.send(outcome);
                    }
                    Some(other) => other.fail(GcsError::Shutdown),
                    None => debug!(tag, "state transfer outcome without waiter"),
                }
                Ok(())
            }
            Delivered::Absorbed { tag, global_seqno } => {
                if let Some(Waiter::Replicate(tx)) = self.core.take_waiter(tag) {
                    let _ = tx.send(Ok(Replicated {
                        global_seqno,
                        local_seqno: Seqno::ILL,
                    }));
                }
                Ok(())
            }
        }
    }

    fn enqueue(&mut self, action: Action) -> GcsResult<()> {
        let report = {
            let mut queue = self.core.queue.lock().expect("lock poisoned");
            if queue.closed {
                return Ok(());
            }
            queue.actions.push_back(action);
            let len = queue.actions.len();
            if len > queue.hard_limit {
                return Err(GcsError::QueueOverflow {
                    len,
                    limit: queue.hard_limit,
                });
            }
            queue.reporter.update(len)
        };
        self.core.queue_cv.notify_one();

        if let Some(report) = report {
            self.send(&MessagePayload::Flow(report))?;
        }
        Ok(())
    }

    fn send(&self, message: &MessagePayload) -> GcsResult<()> {
        let frame = codec::encode(message)?;
        match self.transport.send(frame) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!(kind = message.name(), error = %e, "failed to broadcast service message");
                Ok(())
            }
        }
    }

    fn publish(&self, configuration: Option<Configuration>) {
        let Ok(mut shared) = self.core.shared.write() else {
            return;
        };
        if let ConnState::Open { .. } = shared.state {
            shared.state = ConnState::Open {
                primary: self.group.is_primary(),
            };
        }
        if let Some(configuration) = configuration {
            shared.configuration = Some(configuration);
        }
        shared.member_status = self.group.my_status();
        shared.phase = self.group.phase().name();
        shared.transferring = self.group.phase().is_holding();
        shared.should_wait = self.group.should_wait();
        shared.last_global = self.group.last_global();
        shared.last_local = self.group.last_local();
        shared.commit_cut = self.group.commit_cut();
    }

    fn fail(&self, error: GcsError) {
        error!(member = %self.group.me(), error = %error, "delivery loop failed");

        if let Ok(mut shared) = self.core.shared.write() {
            shared.fatal = Some(error.clone());
        }
        if let Ok(mut queue) = self.core.queue.lock() {
            queue.fatal = Some(error.clone());
        }
        self.core.queue_cv.notify_all();
        self.core.fail_waiters(&error);
        self.transport.disconnect();
    }
}

impl Drop for DeliveryLoop {
    fn drop(&mut self) {
        // Blocked callers must not outlive a panicked delivery thread.
        if thread::panicking() {
            self.fail(GcsError::DeliveryAborted);
        }
    }
}
