//! Integration tests for vdb-gcs.
//!
//! These tests run several connections over one in-process loopback network
//! and exercise ordering, membership, state transfer and flow control end
//! to end, with real delivery threads.

use std::thread;
use std::time::{Duration, Instant};

use crate::{
    Action, ActionType, ConfId, Configuration, ConnState, Connection, GcsConfig, GcsError,
    GroupUuid, LoopbackNetwork, MemberStatus, Seqno, TransportRegistry, WaitStatus,
};

// ============================================================================
// Helper Functions
// ============================================================================

const CHANNEL: &str = "cluster";

fn member(network: &LoopbackNetwork, name: &str) -> Connection {
    let mut registry = TransportRegistry::empty();
    registry.register("loopback", std::sync::Arc::new(network.clone()));
    let config = GcsConfig::testing().with_node_name(format!("node-{name}"));
    Connection::create_with("loopback://", config, &registry).expect("create connection")
}

/// Opens one connection per name, in order.
fn open_group(network: &LoopbackNetwork, names: &[&str]) -> Vec<Connection> {
    names
        .iter()
        .map(|name| {
            let conn = member(network, name);
            conn.open(CHANNEL).expect("open");
            conn
        })
        .collect()
}

/// Receives until a configuration matching `predicate` shows up, skipping
/// everything else.
fn wait_for(conn: &Connection, predicate: impl Fn(&Configuration) -> bool) -> Configuration {
    loop {
        let action = conn.receive().expect("receive");
        if let Some(conf) = action.configuration() {
            if predicate(&conf) {
                return conf;
            }
        }
    }
}

fn wait_for_members(conn: &Connection, members: usize) -> Configuration {
    wait_for(conn, |c| c.member_count() == members)
}

/// Receives until an action of `act_type` arrives and returns it.
fn receive_type(conn: &Connection, act_type: ActionType) -> Action {
    loop {
        let action = conn.receive().expect("receive");
        if action.act_type == act_type {
            return action;
        }
    }
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ============================================================================
// Ordering Tests
// ============================================================================

#[test]
fn members_agree_on_total_order() {
    const ACTIONS: usize = 20;

    let network = LoopbackNetwork::new();
    let group = open_group(&network, &["a", "b", "c"]);

    let confs: Vec<Configuration> = group.iter().map(|m| wait_for_members(m, 3)).collect();
    for (i, conf) in confs.iter().enumerate() {
        assert!(conf.is_primary());
        assert!(!conf.st_required);
        assert_eq!(conf.my_index, i);
        assert_eq!(conf.conf_id, confs[0].conf_id);
        assert_eq!(conf.group_uuid, confs[0].group_uuid);
        assert_eq!(conf.members, confs[0].members);
    }

    let senders: Vec<_> = group
        .iter()
        .enumerate()
        .map(|(i, conn)| {
            let conn = conn.clone();
            thread::spawn(move || {
                for n in 0..ACTIONS {
                    conn.send(format!("{i}-{n}").as_bytes(), ActionType::Tordered)
                        .expect("send");
                }
                if i == 1 {
                    // Larger than a packet: travels as many fragments.
                    conn.send(&[0xAB; 5000], ActionType::Tordered).expect("send");
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().expect("sender thread");
    }

    let total = 3 * ACTIONS + 1;
    let streams: Vec<Vec<Action>> = group
        .iter()
        .map(|conn| {
            (0..total)
                .map(|_| receive_type(conn, ActionType::Tordered))
                .collect()
        })
        .collect();

    for stream in &streams {
        let globals: Vec<i64> = stream
            .iter()
            .map(|a| a.global_seqno.expect("ordered in primary").as_i64())
            .collect();
        assert_eq!(globals, (1..=total as i64).collect::<Vec<_>>());

        let payloads: Vec<&[u8]> = stream.iter().map(|a| &a.payload[..]).collect();
        let reference: Vec<&[u8]> = streams[0].iter().map(|a| &a.payload[..]).collect();
        assert_eq!(payloads, reference);

        assert!(stream.iter().any(|a| a.size() == 5000));
        assert!(stream.windows(2).all(|w| w[0].local_seqno < w[1].local_seqno));
    }

    // Per-sender FIFO.
    for i in 0..3 {
        let prefix = format!("{i}-");
        let mine: Vec<String> = streams[0]
            .iter()
            .filter_map(|a| std::str::from_utf8(&a.payload).ok())
            .filter(|p| p.starts_with(&prefix))
            .map(str::to_string)
            .collect();
        let expected: Vec<String> = (0..ACTIONS).map(|n| format!("{i}-{n}")).collect();
        assert_eq!(mine, expected);
    }

    for conn in &group {
        assert_eq!(conn.caused().expect("caused"), Seqno::new(total as i64));
        conn.close().expect("close");
    }
}

#[test]
fn local_seqnos_are_gap_free_from_one() {
    const ACTIONS: usize = 10;

    let network = LoopbackNetwork::new();
    let group = open_group(&network, &["a", "b"]);
    let mut seen: Vec<Vec<Action>> = group.iter().map(|_| Vec::new()).collect();
    for (conn, seen) in group.iter().zip(seen.iter_mut()) {
        loop {
            let action = conn.receive().expect("receive");
            let joined = action
                .configuration()
                .is_some_and(|c| c.member_count() == 2);
            seen.push(action);
            if joined {
                break;
            }
        }
    }

    for n in 0..ACTIONS {
        group[n % 2]
            .send(&[n as u8], ActionType::Tordered)
            .expect("send");
    }
    group[1]
        .send(&[0x5A; 3000], ActionType::Tordered)
        .expect("send");

    for (conn, seen) in group.iter().zip(seen.iter_mut()) {
        while seen
            .iter()
            .filter(|a| a.act_type == ActionType::Tordered)
            .count()
            < ACTIONS + 1
        {
            seen.push(conn.receive().expect("receive"));
        }
        let locals: Vec<i64> = seen.iter().map(|a| a.local_seqno.as_i64()).collect();
        assert_eq!(locals, (1..=seen.len() as i64).collect::<Vec<_>>());
    }
}

#[test]
fn replicate_returns_own_seqnos() {
    let network = LoopbackNetwork::new();
    let group = open_group(&network, &["a", "b"]);
    for conn in &group {
        wait_for_members(conn, 2);
    }

    let first = group[0]
        .replicate(b"one", ActionType::Tordered)
        .expect("replicate");
    let second = group[1]
        .replicate(b"two", ActionType::Tordered)
        .expect("replicate");
    assert_eq!(first.global_seqno, Seqno::new(1));
    assert_eq!(second.global_seqno, Seqno::new(2));

    // The other member sees each as an ordinary action.
    let seen = receive_type(&group[1], ActionType::Tordered);
    assert_eq!(&seen.payload[..], b"one");
    assert_eq!(seen.global_seqno, Some(Seqno::new(1)));

    let cut = group[0]
        .replicate(b"cut", ActionType::CommitCut)
        .expect("replicate commit cut");
    assert_eq!(cut.global_seqno, Seqno::ILL);
    assert!(cut.local_seqno.is_assigned());
}

#[test]
fn member_leaving_keeps_majority_primary() {
    let network = LoopbackNetwork::new();
    let group = open_group(&network, &["a", "b", "c"]);
    for conn in &group {
        wait_for_members(conn, 3);
    }

    group[2].close().expect("close");
    for conn in &group[..2] {
        let conf = wait_for_members(conn, 2);
        assert!(conf.is_primary());
        assert!(!conf.st_required);
    }
    assert_eq!(network.members(CHANNEL).len(), 2);
}

// ============================================================================
// State Transfer Tests
// ============================================================================

#[test]
fn joiner_receives_state_and_held_actions() {
    let network = LoopbackNetwork::new();
    let group = open_group(&network, &["a", "b"]);
    let (a, b) = (&group[0], &group[1]);
    wait_for_members(a, 2);
    wait_for_members(b, 2);

    for n in 1..=3 {
        let r = a
            .replicate(format!("history-{n}").as_bytes(), ActionType::Tordered)
            .expect("replicate");
        assert_eq!(r.global_seqno, Seqno::new(n));
    }

    let d = member(&network, "d");
    d.open(CHANNEL).expect("open joiner");
    let conf = wait_for_members(&d, 3);
    assert!(conf.is_primary());
    assert!(conf.st_required);
    assert_eq!(conf.seqno, Seqno::new(3));
    assert_eq!(d.member_status(), MemberStatus::Joiner);
    wait_for_members(a, 3);
    wait_for_members(b, 3);

    // Hinted donor wins over the first eligible member.
    let grant = d
        .request_state_transfer_from(b"snapshot please", Some("node-b"))
        .expect("grant");
    assert_eq!(grant.donor_index, 1);
    assert_eq!(grant.local_seqno, Seqno::new(2));

    let request = receive_type(b, ActionType::StateReq);
    assert_eq!(&request.payload[..], b"snapshot please");
    assert_eq!(b.member_status(), MemberStatus::Donor);

    assert!(d.status().transferring);
    assert_eq!(
        d.send(b"early", ActionType::Tordered),
        Err(GcsError::StateTransferInProgress)
    );
    assert_eq!(
        d.request_state_transfer(b"again"),
        Err(GcsError::StateTransferInProgress)
    );

    let during = a
        .replicate(b"during", ActionType::Tordered)
        .expect("replicate during transfer");
    assert_eq!(during.global_seqno, Seqno::new(4));

    // Snapshot as of the request: everything after it is released.
    d.join(0).expect("join");
    let join = d.receive().expect("receive JOIN");
    assert_eq!(join.act_type, ActionType::Join);
    assert_eq!(join.join_status(), Some(0));
    assert_eq!(join.local_seqno, Seqno::new(3));

    let released = d.receive().expect("receive released action");
    assert_eq!(released.act_type, ActionType::Tordered);
    assert_eq!(&released.payload[..], b"during");
    assert_eq!(released.global_seqno, Some(Seqno::new(4)));
    assert_eq!(released.local_seqno, Seqno::new(4));

    let sync = d.receive().expect("receive SYNC");
    assert_eq!(sync.act_type, ActionType::Sync);
    assert_eq!(sync.local_seqno, Seqno::new(5));
    assert_eq!(d.member_status(), MemberStatus::Synced);
    assert_eq!(d.status().phase, "idle");

    b.join(3).expect("donor join");
    assert!(eventually(|| b.member_status() == MemberStatus::Synced));

    let after = d
        .replicate(b"after", ActionType::Tordered)
        .expect("joiner can send again");
    assert_eq!(after.global_seqno, Seqno::new(5));
}

#[test]
fn state_request_without_donor() {
    let conn = Connection::create("dummy://").expect("create");
    conn.init(Seqno::new(10), GroupUuid::generate())
        .expect("init");
    conn.open(CHANNEL).expect("open");
    let conf = wait_for(&conn, Configuration::is_primary);
    assert_eq!(conf.seqno, Seqno::new(10));

    let err = conn
        .request_state_transfer(b"anyone?")
        .expect_err("alone in the group");
    assert_eq!(err, GcsError::NoDonor);
    assert!(err.is_retryable());
    conn.close().expect("close");
}

// ============================================================================
// Partition Tests
// ============================================================================

#[test]
fn minority_partition_is_non_primary_until_heal() {
    let network = LoopbackNetwork::new();
    let group = open_group(&network, &["a", "b", "c"]);
    let before: Vec<Configuration> = group.iter().map(|m| wait_for_members(m, 3)).collect();
    let ids: Vec<_> = group
        .iter()
        .map(|m| m.member_id().expect("member id"))
        .collect();

    network.partition(CHANNEL, &[vec![ids[0].clone(), ids[1].clone()]]);

    let majority: Vec<Configuration> = group[..2]
        .iter()
        .map(|m| wait_for_members(m, 2))
        .collect();
    for conf in &majority {
        assert!(conf.is_primary());
        assert_eq!(conf.conf_id, before[0].conf_id.next());
        assert_eq!(conf.group_uuid, before[0].group_uuid);
    }

    let c = &group[2];
    let minority = wait_for_members(c, 1);
    assert!(!minority.is_primary());
    assert_eq!(minority.conf_id, ConfId::NON_PRIMARY);
    assert_eq!(c.state(), ConnState::Open { primary: false });

    let err = c
        .replicate(b"lonely", ActionType::Tordered)
        .expect_err("not committed in minority");
    assert_eq!(
        err,
        GcsError::NotCommitted {
            local_seqno: Seqno::new(3)
        }
    );

    let r = group[0]
        .replicate(b"majority", ActionType::Tordered)
        .expect("replicate in majority");
    assert_eq!(r.global_seqno, Seqno::new(1));

    network.heal(CHANNEL);

    let healed = wait_for_members(c, 3);
    assert!(healed.is_primary());
    assert!(healed.st_required);
    assert_eq!(healed.seqno, Seqno::new(1));
    assert_eq!(healed.conf_id, majority[0].conf_id.next());
    assert_eq!(c.member_status(), MemberStatus::Joiner);
    for conn in &group[..2] {
        let conf = wait_for_members(conn, 3);
        assert!(!conf.st_required);
    }

    let grant = c.request_state_transfer(b"catch up").expect("grant");
    assert_eq!(grant.donor_index, 0);
    c.join(0).expect("join");
    receive_type(c, ActionType::Sync);
    assert_eq!(c.member_status(), MemberStatus::Synced);
    assert_eq!(c.caused().expect("caused"), Seqno::new(1));
}

#[test]
fn lone_restarted_member_rejoins_through_state_transfer() {
    let network = LoopbackNetwork::new();
    let group = open_group(&network, &["a", "b", "c"]);
    let history = wait_for_members(&group[0], 3).group_uuid;
    for conn in &group[1..] {
        wait_for_members(conn, 3);
    }
    let r = group[0]
        .replicate(b"shared", ActionType::Tordered)
        .expect("replicate");
    assert_eq!(r.global_seqno, Seqno::new(1));

    group[2].close().expect("close");
    for conn in &group[..2] {
        assert!(wait_for_members(conn, 2).is_primary());
    }
    let ids: Vec<_> = group[..2]
        .iter()
        .map(|m| m.member_id().expect("member id"))
        .collect();
    network.partition(CHANNEL, &[ids]);

    // Restarted alone with the position it saved before leaving.
    let restarted = member(&network, "c2");
    restarted.init(Seqno::new(1), history).expect("init");
    restarted.open(CHANNEL).expect("open");
    let alone = wait_for(&restarted, Configuration::is_primary);
    assert_eq!(alone.member_count(), 1);
    assert_eq!(alone.seqno, Seqno::new(1));
    assert_ne!(alone.group_uuid, history);

    let lone = restarted
        .replicate(b"lone", ActionType::Tordered)
        .expect("replicate alone");
    let majority = group[0]
        .replicate(b"majority", ActionType::Tordered)
        .expect("replicate in majority");
    assert_eq!(lone.global_seqno, Seqno::new(2));
    assert_eq!(majority.global_seqno, Seqno::new(2));

    network.heal(CHANNEL);

    let healed = wait_for_members(&restarted, 3);
    assert!(healed.is_primary());
    assert!(healed.st_required);
    assert_eq!(healed.group_uuid, history);
    assert_eq!(healed.seqno, Seqno::new(2));
    assert_eq!(restarted.member_status(), MemberStatus::Joiner);
    for conn in &group[..2] {
        let conf = wait_for_members(conn, 3);
        assert!(!conf.st_required);
        assert_eq!(conf.group_uuid, history);
    }
}

#[test]
fn even_split_has_no_primary() {
    let network = LoopbackNetwork::new();
    let group = open_group(&network, &["a", "b"]);
    let before: Vec<Configuration> = group.iter().map(|m| wait_for_members(m, 2)).collect();
    let a = group[0].member_id().expect("member id");

    network.partition(CHANNEL, &[vec![a]]);
    for conn in &group {
        let conf = wait_for_members(conn, 1);
        assert!(!conf.is_primary());
        assert_eq!(conn.state(), ConnState::Open { primary: false });
    }

    network.heal(CHANNEL);
    for conn in &group {
        let conf = wait_for_members(conn, 2);
        assert!(conf.is_primary());
        assert!(!conf.st_required);
        assert_eq!(conf.conf_id, before[0].conf_id.next());
    }
}

// ============================================================================
// Flow Control and Commit Cut Tests
// ============================================================================

#[test]
fn slow_receiver_asks_group_to_wait() {
    let network = LoopbackNetwork::new();
    let group = open_group(&network, &["a", "b"]);
    let (a, b) = (&group[0], &group[1]);
    wait_for_members(a, 2);
    wait_for_members(b, 2);
    assert_eq!(a.wait(), Ok(WaitStatus::Proceed));

    // b stops receiving; its queue passes the upper limit.
    for n in 0..6 {
        a.replicate(&[n], ActionType::Tordered).expect("replicate");
    }
    assert!(eventually(
        || a.wait() == Ok(WaitStatus::WaitRecommended)
    ));

    for _ in 0..6 {
        receive_type(b, ActionType::Tordered);
    }
    assert!(eventually(|| a.wait() == Ok(WaitStatus::Proceed)));
}

#[test]
fn commit_cut_follows_slowest_member() {
    let network = LoopbackNetwork::new();
    let group = open_group(&network, &["a", "b"]);
    for conn in &group {
        wait_for_members(conn, 2);
    }

    group[0].set_last_applied(Seqno::new(5)).expect("last applied");
    group[1].set_last_applied(Seqno::new(3)).expect("last applied");

    for conn in &group {
        let cut = receive_type(conn, ActionType::CommitCut);
        assert_eq!(cut.commit_cut(), Some(Seqno::new(3)));
        assert_eq!(conn.status().commit_cut, Seqno::new(3));
    }
}
