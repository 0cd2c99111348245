//! End-to-end scenarios over two channels wired back to back through the
//! in-memory storage service, with a manual clock driving timeouts.

use bpcore::channel::{Agent, Channel, ChannelConfig, WrapResponse};
use bpcore::storage::{MemoryStorageService, Timeout};
use bpcore::time::ManualClock;
use bpcore::{BpError, Eid, StatusFlags};
use std::sync::Arc;

struct Node {
    channel: Arc<Channel>,
    _agent: Agent,
}

fn node(clock: &ManualClock, cfg: ChannelConfig) -> Node {
    let agent = Agent::with_clock(4, Arc::new(clock.clone()));
    let handle = agent.open(&MemoryStorageService::default(), cfg).unwrap();
    let channel = agent.channel(handle).unwrap();
    Node {
        channel,
        _agent: agent,
    }
}

fn sender_config() -> ChannelConfig {
    let mut cfg = ChannelConfig::new(Eid::new(1, 10), Eid::new(1, 10));
    cfg.timeout_secs = 2;
    cfg
}

fn receiver_config() -> ChannelConfig {
    // same endpoint as the sender's destination; not an originator
    let mut cfg = ChannelConfig::new(Eid::new(1, 10), Eid::new(1, 10));
    cfg.originate = false;
    cfg
}

async fn load_one(channel: &Channel) -> Vec<u8> {
    let mut flags = StatusFlags::default();
    channel
        .load(Timeout::Poll, &mut flags)
        .await
        .unwrap()
        .expect("a bundle should be ready")
        .to_vec()
}

#[tokio::test]
async fn origination_and_delivery() {
    let clock = ManualClock::at_secs(1000);
    let a = node(&clock, sender_config());
    let z = node(&clock, receiver_config());
    let mut flags = StatusFlags::default();

    a.channel
        .store(b"hello", Timeout::Poll, &mut flags)
        .await
        .unwrap();
    let wire = load_one(&a.channel).await;

    z.channel
        .process(&wire, Timeout::Poll, &mut flags)
        .await
        .unwrap();

    let mut accept_flags = StatusFlags::default();
    let payload = z
        .channel
        .accept(Timeout::Poll, &mut accept_flags)
        .await
        .unwrap()
        .expect("payload should be delivered");
    assert_eq!(&payload.data[..], b"hello");
    assert!(payload.request_custody);
    assert!(accept_flags.contains(StatusFlags::ACTIVITY));

    assert_eq!(z.channel.latch_stats().delivered, 1);
    assert_eq!(a.channel.latch_stats().generated, 1);
}

#[tokio::test]
async fn custody_acknowledgment_round_trip() {
    let clock = ManualClock::at_secs(1000);
    let a = node(&clock, sender_config());
    let z = node(&clock, receiver_config());
    let mut flags = StatusFlags::default();

    for _ in 0..4 {
        a.channel
            .store(b"data", Timeout::Poll, &mut flags)
            .await
            .unwrap();
        let wire = load_one(&a.channel).await;
        z.channel
            .process(&wire, Timeout::Poll, &mut flags)
            .await
            .unwrap();
    }
    assert_eq!(a.channel.latch_stats().active, 4);

    // the receiver's next load flushes the aggregate signal (rate 5s)
    clock.advance_secs(6);
    let mut load_flags = StatusFlags::default();
    let signal = z
        .channel
        .load(Timeout::Poll, &mut load_flags)
        .await
        .unwrap()
        .expect("custody signal should be pending");
    assert!(load_flags.contains(StatusFlags::ROUTE_NEEDED));

    a.channel
        .process(&signal, Timeout::Poll, &mut flags)
        .await
        .unwrap();

    let stats = a.channel.latch_stats();
    assert_eq!(stats.acknowledged, 4);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
async fn retransmit_on_timeout_with_cid_reuse() {
    let clock = ManualClock::at_secs(1000);
    let mut cfg = sender_config();
    cfg.cid_reuse = true;
    let a = node(&clock, cfg);
    let mut flags = StatusFlags::default();

    a.channel
        .store(b"data", Timeout::Poll, &mut flags)
        .await
        .unwrap();
    let first = load_one(&a.channel).await;

    clock.advance_secs(3);
    let second = load_one(&a.channel).await;
    assert_eq!(first, second);
    assert_eq!(a.channel.latch_stats().retransmitted, 1);
}

#[tokio::test]
async fn retransmit_on_timeout_without_cid_reuse() {
    let clock = ManualClock::at_secs(1000);
    let a = node(&clock, sender_config());
    let mut flags = StatusFlags::default();

    a.channel
        .store(b"data", Timeout::Poll, &mut flags)
        .await
        .unwrap();
    let first = load_one(&a.channel).await;

    clock.advance_secs(3);
    let second = load_one(&a.channel).await;
    // same bundle, fresh custody id
    assert_ne!(first, second);
    assert_eq!(bpcore::channel::route_info(&second).unwrap(), Eid::new(1, 10));
    assert_eq!(a.channel.latch_stats().retransmitted, 1);
    assert_eq!(a.channel.latch_stats().active, 1);
}

#[tokio::test]
async fn wrap_drop_relinquishes_the_oldest() {
    let clock = ManualClock::at_secs(1000);
    let mut cfg = sender_config();
    cfg.active_table_size = 4;
    cfg.wrap_response = WrapResponse::Drop;
    cfg.timeout_secs = 100; // nothing times out during the test
    let a = node(&clock, cfg);
    let mut flags = StatusFlags::default();

    for _ in 0..5 {
        a.channel
            .store(b"data", Timeout::Poll, &mut flags)
            .await
            .unwrap();
    }
    for _ in 0..4 {
        load_one(&a.channel).await;
    }

    let mut wrap_flags = StatusFlags::default();
    let fifth = a
        .channel
        .load(Timeout::Poll, &mut wrap_flags)
        .await
        .unwrap()
        .expect("fifth bundle should go out after the drop");
    assert!(wrap_flags.contains(StatusFlags::ACTIVE_TABLE_WRAP));
    assert!(!fifth.is_empty());

    let stats = a.channel.latch_stats();
    assert_eq!(stats.lost, 1);
    assert_eq!(stats.transmitted, 5);
    assert_eq!(stats.active, 4);
}

#[tokio::test]
async fn wrap_block_reports_overflow() {
    let clock = ManualClock::at_secs(1000);
    let mut cfg = sender_config();
    cfg.active_table_size = 2;
    cfg.wrap_response = WrapResponse::Block;
    cfg.timeout_secs = 100;
    cfg.wrap_timeout = std::time::Duration::from_millis(10);
    let a = node(&clock, cfg);
    let mut flags = StatusFlags::default();

    for _ in 0..3 {
        a.channel
            .store(b"data", Timeout::Poll, &mut flags)
            .await
            .unwrap();
    }
    load_one(&a.channel).await;
    load_one(&a.channel).await;

    let mut wrap_flags = StatusFlags::default();
    let result = a.channel.load(Timeout::Poll, &mut wrap_flags).await;
    assert_eq!(result, Err(BpError::Overflow));
    assert!(wrap_flags.contains(StatusFlags::ACTIVE_TABLE_WRAP));
}

#[tokio::test]
async fn forwarder_accepts_custody() {
    let clock = ManualClock::at_secs(1000);

    // A (node 1) originates toward node 3; B (node 2) relays
    let mut a_cfg = ChannelConfig::new(Eid::new(1, 10), Eid::new(3, 10));
    a_cfg.timeout_secs = 2;
    let a = node(&clock, a_cfg);

    let mut b_cfg = ChannelConfig::new(Eid::new(2, 10), Eid::new(3, 10));
    b_cfg.originate = false;
    let b = node(&clock, b_cfg);

    let mut flags = StatusFlags::default();
    a.channel
        .store(b"relay me", Timeout::Poll, &mut flags)
        .await
        .unwrap();
    let wire = load_one(&a.channel).await;

    b.channel
        .process(&wire, Timeout::Poll, &mut flags)
        .await
        .unwrap();

    // custody signals take priority: B's first load acknowledges toward A
    let mut load_flags = StatusFlags::default();
    let signal = b
        .channel
        .load(Timeout::Poll, &mut load_flags)
        .await
        .unwrap()
        .expect("custody signal should be pending");
    assert!(load_flags.contains(StatusFlags::ROUTE_NEEDED));
    assert_eq!(
        bpcore::channel::route_info(&signal).unwrap(),
        Eid::new(1, 10)
    );

    // then the bundle itself, re-emitted with B as custodian and report-to
    let forwarded = load_one(&b.channel).await;
    let dest = bpcore::channel::route_info(&forwarded).unwrap();
    assert_eq!(dest, Eid::new(3, 10));

    let mut parse_flags = StatusFlags::default();
    let (pri, pri_len) =
        bpcore::codec::v6::PrimaryBlock::read(&forwarded, &mut parse_flags).unwrap();
    assert_eq!(pri.custodian(), Eid::new(2, 10));
    assert_eq!(
        Eid::new(pri.rptnode.value as u32, pri.rptserv.value as u32),
        Eid::new(2, 10)
    );
    let (cteb, _) =
        bpcore::codec::v6::CustodyBlock::read(&forwarded[pri_len..], &mut parse_flags).unwrap();
    assert_eq!(cteb.custodian, Eid::new(2, 10));

    a.channel
        .process(&signal, Timeout::Poll, &mut flags)
        .await
        .unwrap();
    assert_eq!(a.channel.latch_stats().acknowledged, 1);
}

#[tokio::test]
async fn expired_bundle_dropped_on_process() {
    let clock = ManualClock::at_secs(100);
    let mut cfg = sender_config();
    cfg.lifetime_secs = 10;
    let a = node(&clock, cfg);
    let z = node(&clock, receiver_config());
    let mut flags = StatusFlags::default();

    a.channel
        .store(b"short lived", Timeout::Poll, &mut flags)
        .await
        .unwrap();
    let wire = load_one(&a.channel).await;

    clock.set_secs(111);
    let result = z.channel.process(&wire, Timeout::Poll, &mut flags).await;
    assert_eq!(result, Err(BpError::Expired));

    let stats = z.channel.latch_stats();
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.payloads, 0);
    assert!(z
        .channel
        .accept(Timeout::Poll, &mut flags)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn duplicate_delivery_flags_duplicates() {
    let clock = ManualClock::at_secs(1000);
    let a = node(&clock, sender_config());
    let z = node(&clock, receiver_config());
    let mut flags = StatusFlags::default();

    a.channel
        .store(b"once", Timeout::Poll, &mut flags)
        .await
        .unwrap();
    let wire = load_one(&a.channel).await;

    z.channel
        .process(&wire, Timeout::Poll, &mut flags)
        .await
        .unwrap();
    assert!(!flags.contains(StatusFlags::DUPLICATES));

    let mut dup_flags = StatusFlags::default();
    z.channel
        .process(&wire, Timeout::Poll, &mut dup_flags)
        .await
        .unwrap();
    assert!(dup_flags.contains(StatusFlags::DUPLICATES));

    // the payload was delivered exactly once
    assert_eq!(z.channel.latch_stats().payloads, 1);
    let first = z.channel.accept(Timeout::Poll, &mut flags).await.unwrap();
    assert!(first.is_some());
    let second = z.channel.accept(Timeout::Poll, &mut flags).await.unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn wrong_channel_is_rejected() {
    let clock = ManualClock::at_secs(1000);
    let a = node(&clock, sender_config());

    // same node, different service
    let mut other_cfg = ChannelConfig::new(Eid::new(1, 99), Eid::new(1, 99));
    other_cfg.originate = false;
    let other = node(&clock, other_cfg);

    let mut flags = StatusFlags::default();
    a.channel
        .store(b"misrouted", Timeout::Poll, &mut flags)
        .await
        .unwrap();
    let wire = load_one(&a.channel).await;

    let result = other.channel.process(&wire, Timeout::Poll, &mut flags).await;
    assert_eq!(
        result,
        Err(BpError::WrongChannel {
            dest: 10,
            local: 99
        })
    );
}

#[tokio::test]
async fn fragmented_origination_carries_offsets() {
    let clock = ManualClock::at_secs(1000);
    let mut cfg = sender_config();
    cfg.allow_fragment = true;
    cfg.max_bundle_length = 4;
    let a = node(&clock, cfg);
    let mut flags = StatusFlags::default();

    a.channel
        .store(b"0123456789", Timeout::Poll, &mut flags)
        .await
        .unwrap();

    let mut seen = Vec::new();
    let mut parse_flags = StatusFlags::default();
    for _ in 0..3 {
        let wire = load_one(&a.channel).await;
        let (pri, _) = bpcore::codec::v6::PrimaryBlock::read(&wire, &mut parse_flags).unwrap();
        assert!(pri.is_frag);
        assert_eq!(pri.paylen.value, 10);
        seen.push(pri.fragoffset.value);
    }
    assert_eq!(seen, vec![0, 4, 8]);
}
