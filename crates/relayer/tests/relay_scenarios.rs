//! End-to-end scenarios for the polling engine, driven against a pair of
//! in-memory mock chains.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use conduit_relayer::chain::mock::{MockChain, MockMsg};
use conduit_relayer::chain::Chain;
use conduit_relayer::config::{ChannelFilter, ProcessorType};
use conduit_relayer::link::{Link, LinkParameters};
use conduit_relayer::supervisor::start_relayer;
use conduit_relayer::util::cancel::cancel_pair;

use conduit_relayer_types::channel::{
    ChannelEnd, Counterparty, IdentifiedChannelEnd, Ordering, State,
};
use conduit_relayer_types::events::Packet;
use conduit_relayer_types::identifier::{ChannelId, ClientId, ConnectionId, PortId};
use conduit_relayer_types::Height;

fn client(counter: u64) -> ClientId {
    ClientId::new("07-tendermint", counter).unwrap()
}

fn mock_pair() -> (MockChain, MockChain, Chain, Chain) {
    let a = MockChain::new("ibc-0", 20);
    let b = MockChain::new("ibc-1", 30);

    let chain_a = Chain::new(client(0), ConnectionId::new(0), Arc::new(a.clone()));
    let chain_b = Chain::new(client(1), ConnectionId::new(1), Arc::new(b.clone()));

    (a, b, chain_a, chain_b)
}

fn channel_end(
    state: State,
    ordering: Ordering,
    counterparty_channel: &ChannelId,
) -> ChannelEnd {
    ChannelEnd::new(
        state,
        ordering,
        Counterparty::new(PortId::transfer(), Some(counterparty_channel.clone())),
        vec![ConnectionId::new(0)],
        "ics20-1".to_string(),
    )
}

/// Install the two ends of one channel on the two mock chains.
fn add_channel_pair(
    a: &MockChain,
    b: &MockChain,
    a_channel: u64,
    b_channel: u64,
    ordering: Ordering,
    state: State,
) -> IdentifiedChannelEnd {
    let a_id = ChannelId::new(a_channel);
    let b_id = ChannelId::new(b_channel);

    let a_end = IdentifiedChannelEnd::new(
        PortId::transfer(),
        a_id.clone(),
        channel_end(state, ordering, &b_id),
    );
    let b_end = IdentifiedChannelEnd::new(
        PortId::transfer(),
        b_id,
        channel_end(state, ordering, &a_id),
    );

    a.add_channel(a_end.clone());
    b.add_channel(b_end);
    a_end
}

fn packet(a_channel: u64, b_channel: u64, seq: u64) -> Packet {
    Packet {
        sequence: seq.into(),
        source_port: PortId::transfer(),
        source_channel: ChannelId::new(a_channel),
        destination_port: PortId::transfer(),
        destination_channel: ChannelId::new(b_channel),
    }
}

fn h(height: u64) -> Height {
    Height::new(height).unwrap()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

fn recv_msgs_for_sequence(chain: &MockChain, seq: u64) -> usize {
    chain
        .submitted_txs()
        .iter()
        .flat_map(|tx| tx.msgs.iter())
        .filter(|msg| {
            matches!(msg, MockMsg::RecvPacket { packet, .. } if packet.sequence.value() == seq)
        })
        .count()
}

#[test]
fn drain_single_unordered_channel() {
    let (a, b, chain_a, chain_b) = mock_pair();
    let channel = add_channel_pair(&a, &b, 0, 7, Ordering::Unordered, State::Open);

    for seq in 1..=3 {
        a.commit_packet(packet(0, 7, seq));
    }

    let (_handle, cancel) = cancel_pair();
    let link = Link::new(chain_a, chain_b, &channel, LinkParameters::default()).unwrap();

    let set = link.unrelayed_packets(&cancel, h(19), h(29)).unwrap();
    assert_eq!(
        set.src.iter().map(|s| s.value()).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(set.dst.is_empty());

    link.relay_packets(&cancel, h(20), h(30), &set).unwrap();

    // one transaction: the client update plus the three receive messages
    let txs = b.submitted_txs();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].msgs.len(), 4);
    assert!(matches!(
        &txs[0].msgs[0],
        MockMsg::UpdateClient { target_height, .. } if target_height.value() == 20
    ));

    assert_eq!(
        b.received_sequences(&PortId::transfer(), &ChannelId::new(7)),
        vec![1, 2, 3]
    );

    let drained = link.unrelayed_packets(&cancel, h(19), h(29)).unwrap();
    assert!(drained.is_empty());
}

#[test]
fn acknowledgements_flow_back_and_clear_commitments() {
    let (a, b, chain_a, chain_b) = mock_pair();
    let channel = add_channel_pair(&a, &b, 0, 7, Ordering::Unordered, State::Open);

    for seq in 1..=2 {
        a.commit_packet(packet(0, 7, seq));
    }

    let (_handle, cancel) = cancel_pair();
    let link = Link::new(chain_a, chain_b, &channel, LinkParameters::default()).unwrap();

    let set = link.unrelayed_packets(&cancel, h(19), h(29)).unwrap();
    link.relay_packets(&cancel, h(20), h(30), &set).unwrap();

    let acks = link
        .a_to_b
        .unrelayed_ack_sequences(&cancel, h(19), h(29), &[])
        .unwrap();
    assert_eq!(acks.iter().map(|s| s.value()).collect::<Vec<_>>(), vec![1, 2]);

    link.a_to_b.relay_ack_messages(&cancel, h(30), &acks).unwrap();

    assert!(a
        .commitment_sequences(&PortId::transfer(), &ChannelId::new(0))
        .is_empty());

    // with the commitments gone the ack queue is empty as well
    let drained = link
        .a_to_b
        .unrelayed_ack_sequences(&cancel, h(19), h(29), &[])
        .unwrap();
    assert!(drained.is_empty());
}

#[test]
fn ordered_channel_does_not_skip_a_gap() {
    let (a, b, chain_a, chain_b) = mock_pair();
    let channel = add_channel_pair(&a, &b, 0, 7, Ordering::Ordered, State::Open);

    for seq in [1, 2, 4] {
        a.commit_packet(packet(0, 7, seq));
    }
    b.receive_packet_directly(packet(0, 7, 1));
    b.receive_packet_directly(packet(0, 7, 2));

    let (_handle, cancel) = cancel_pair();
    let link = Link::new(chain_a, chain_b, &channel, LinkParameters::default()).unwrap();

    // sequence 3 was never committed; 4 must not be relayed ahead of it
    let set = link.unrelayed_packets(&cancel, h(19), h(29)).unwrap();
    assert!(set.src.is_empty());

    link.relay_packets(&cancel, h(20), h(30), &set).unwrap();
    assert!(b.submitted_txs().is_empty());
}

#[test]
fn no_open_channels_is_terminal() {
    let (_a, _b, chain_a, chain_b) = mock_pair();

    let (_handle, cancel) = cancel_pair();
    let errors = start_relayer(
        cancel,
        chain_a,
        chain_b,
        ChannelFilter::default(),
        LinkParameters::default(),
        ProcessorType::Legacy,
        0,
    );

    let err = errors
        .recv_timeout(Duration::from_secs(5))
        .expect("terminal error expected");
    assert!(err.to_string().contains("no open channels"));
}

#[test]
fn allow_filter_and_channel_state_select_workers() {
    let (a, b, chain_a, chain_b) = mock_pair();

    add_channel_pair(&a, &b, 0, 100, Ordering::Unordered, State::Open);
    add_channel_pair(&a, &b, 1, 101, Ordering::Unordered, State::Open);
    add_channel_pair(&a, &b, 3, 103, Ordering::Unordered, State::Closed);
    add_channel_pair(&a, &b, 5, 105, Ordering::Unordered, State::Open);

    a.commit_packet(packet(0, 100, 1));
    a.commit_packet(packet(1, 101, 1));
    a.commit_packet(packet(5, 105, 1));

    let filter = ChannelFilter::allow(vec![ChannelId::new(0), ChannelId::new(3)]);

    let (handle, cancel) = cancel_pair();
    let errors = start_relayer(
        cancel,
        chain_a,
        chain_b,
        filter,
        LinkParameters::default(),
        ProcessorType::Legacy,
        0,
    );

    // only channel-0 gets a worker: channel-3 is excluded by state, the
    // others by the allow rule
    assert!(wait_until(Duration::from_secs(5), || {
        b.received_sequences(&PortId::transfer(), &ChannelId::new(100)) == vec![1]
    }));

    thread::sleep(Duration::from_millis(200));
    assert!(b
        .received_sequences(&PortId::transfer(), &ChannelId::new(101))
        .is_empty());
    assert!(b
        .received_sequences(&PortId::transfer(), &ChannelId::new(105))
        .is_empty());

    handle.cancel();
    let err = errors
        .recv_timeout(Duration::from_secs(5))
        .expect("cancellation is reported");
    assert!(err.is_cancelled());
}

#[test]
fn closed_channel_is_retired_after_worker_exit() {
    let (a, b, chain_a, chain_b) = mock_pair();
    add_channel_pair(&a, &b, 0, 7, Ordering::Unordered, State::Open);

    let (_handle, cancel) = cancel_pair();
    let errors = start_relayer(
        cancel,
        chain_a,
        chain_b,
        ChannelFilter::default(),
        LinkParameters::default(),
        ProcessorType::Legacy,
        0,
    );

    // let the worker settle into its cycle, then close the channel and
    // knock the worker over; the supervisor re-query must retire the
    // channel rather than respawn
    thread::sleep(Duration::from_millis(200));
    a.set_channel_state(&PortId::transfer(), &ChannelId::new(0), State::Closed);
    a.fail_next_height_query("connection reset by peer");

    let err = errors
        .recv_timeout(Duration::from_secs(5))
        .expect("terminal error expected");
    assert!(err.to_string().contains("no open channels"));
}

#[test]
fn cancellation_during_submission_reports_promptly() {
    let (a, b, chain_a, chain_b) = mock_pair();
    add_channel_pair(&a, &b, 0, 7, Ordering::Unordered, State::Open);

    a.commit_packet(packet(0, 7, 1));
    b.set_submit_delay(Duration::from_millis(400));

    let (handle, cancel) = cancel_pair();
    let errors = start_relayer(
        cancel,
        chain_a,
        chain_b,
        ChannelFilter::default(),
        LinkParameters::default(),
        ProcessorType::Legacy,
        0,
    );

    // cancel while the submission is stalled inside the provider
    thread::sleep(Duration::from_millis(100));
    handle.cancel();

    let err = errors
        .recv_timeout(Duration::from_secs(2))
        .expect("cancellation is reported");
    assert!(err.is_cancelled());

    // the stalled submission was aborted, not applied
    assert!(b.submitted_txs().is_empty());
    assert!(b
        .received_sequences(&PortId::transfer(), &ChannelId::new(7))
        .is_empty());
}

#[test]
fn cancellation_before_startup_has_zero_side_effects() {
    let (a, b, chain_a, chain_b) = mock_pair();
    add_channel_pair(&a, &b, 0, 7, Ordering::Unordered, State::Open);
    a.commit_packet(packet(0, 7, 1));

    let (handle, cancel) = cancel_pair();
    handle.cancel();

    let errors = start_relayer(
        cancel,
        chain_a.clone(),
        chain_b,
        ChannelFilter::default(),
        LinkParameters::default(),
        ProcessorType::Legacy,
        0,
    );

    let err = errors
        .recv_timeout(Duration::from_secs(2))
        .expect("cancellation is reported");
    assert!(err.is_cancelled());

    assert!(a.submitted_txs().is_empty());
    assert!(b.submitted_txs().is_empty());
    assert_eq!(recv_msgs_for_sequence(&b, 1), 0);
}

#[test]
fn ack_pass_survives_submission_errors() {
    let (a, b, chain_a, chain_b) = mock_pair();
    let channel = add_channel_pair(&a, &b, 0, 7, Ordering::Unordered, State::Open);

    a.commit_packet(packet(0, 7, 1));

    let (_handle, cancel) = cancel_pair();
    let link = Link::new(chain_a, chain_b, &channel, LinkParameters::default()).unwrap();

    let set = link.unrelayed_packets(&cancel, h(19), h(29)).unwrap();
    link.relay_packets(&cancel, h(20), h(30), &set).unwrap();

    // an application-level rejection on the ack leg: the commitment stays
    // put and the next scan finds the ack again
    a.fail_next_submit("out of gas in ante handler");

    let acks = link
        .a_to_b
        .unrelayed_ack_sequences(&cancel, h(19), h(29), &[])
        .unwrap();
    assert_eq!(acks.len(), 1);
    assert!(link
        .a_to_b
        .relay_ack_messages(&cancel, h(30), &acks)
        .is_err());

    let rescan = link
        .a_to_b
        .unrelayed_ack_sequences(&cancel, h(19), h(29), &[])
        .unwrap();
    assert_eq!(rescan, acks);
}

#[test]
fn indexing_disabled_error_is_recognized() {
    let (a, b, chain_a, chain_b) = mock_pair();
    let channel = add_channel_pair(&a, &b, 0, 7, Ordering::Unordered, State::Open);

    a.commit_packet(packet(0, 7, 1));
    b.fail_next_submit("Internal error: transaction indexing is disabled");

    let (_handle, cancel) = cancel_pair();
    let link = Link::new(chain_a, chain_b, &channel, LinkParameters::default()).unwrap();

    let set = link.unrelayed_packets(&cancel, h(19), h(29)).unwrap();
    let err = link.relay_packets(&cancel, h(20), h(30), &set).unwrap_err();
    assert!(err.is_tx_indexing_disabled());
}
