//! End-to-end scenarios for the event-driven engine.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use conduit_relayer::chain::mock::{MockChain, MockMsg};
use conduit_relayer::chain::Chain;
use conduit_relayer::config::{ChannelFilter, ProcessorType};
use conduit_relayer::link::LinkParameters;
use conduit_relayer::supervisor::start_relayer;
use conduit_relayer::util::cancel::cancel_pair;

use conduit_relayer_types::channel::{
    ChannelEnd, Counterparty, IdentifiedChannelEnd, Ordering, State,
};
use conduit_relayer_types::events::Packet;
use conduit_relayer_types::identifier::{ChannelId, ClientId, ConnectionId, PortId};

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

fn add_channel_pair(a: &MockChain, b: &MockChain, a_channel: u64, b_channel: u64) {
    let a_id = ChannelId::new(a_channel);
    let b_id = ChannelId::new(b_channel);

    let end = |counterparty: &ChannelId| {
        ChannelEnd::new(
            State::Open,
            Ordering::Unordered,
            Counterparty::new(PortId::transfer(), Some(counterparty.clone())),
            vec![ConnectionId::new(0)],
            "ics20-1".to_string(),
        )
    };

    a.add_channel(IdentifiedChannelEnd::new(
        PortId::transfer(),
        a_id.clone(),
        end(&b_id),
    ));
    b.add_channel(IdentifiedChannelEnd::new(PortId::transfer(), b_id, end(&a_id)));
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
fn event_mode_drains_and_deduplicates() {
    let (a, b, chain_a, chain_b) = mock_pair();
    add_channel_pair(&a, &b, 0, 7);

    let (handle, cancel) = cancel_pair();
    let errors = start_relayer(
        cancel,
        chain_a,
        chain_b,
        ChannelFilter::default(),
        LinkParameters::default(),
        ProcessorType::Events,
        0,
    );

    // give both chain processors a moment to subscribe
    thread::sleep(Duration::from_millis(200));

    a.commit_packet(packet(0, 7, 1));
    a.commit_packet(packet(0, 7, 2));
    a.advance_block();
    b.advance_block();

    assert!(wait_until(Duration::from_secs(5), || {
        b.received_sequences(&PortId::transfer(), &ChannelId::new(7)) == vec![1, 2]
    }));

    // more source snapshots without any receive evidence from the
    // destination: the in-flight tokens must hold resubmission back
    a.advance_block();
    a.advance_block();
    thread::sleep(Duration::from_millis(300));

    assert_eq!(recv_msgs_for_sequence(&b, 1), 1);
    assert_eq!(recv_msgs_for_sequence(&b, 2), 1);

    // publish the destination's acknowledgements; they flow back and
    // clear the source commitments
    b.advance_block();

    assert!(wait_until(Duration::from_secs(5), || {
        a.commitment_sequences(&PortId::transfer(), &ChannelId::new(0))
            .is_empty()
    }));

    handle.cancel();
    assert!(errors.recv_timeout(Duration::from_secs(5)).is_ok());
}

#[test]
fn event_mode_honors_allow_filter() {
    let (a, b, chain_a, chain_b) = mock_pair();
    add_channel_pair(&a, &b, 0, 100);
    add_channel_pair(&a, &b, 1, 101);

    let filter = ChannelFilter::allow(vec![ChannelId::new(0)]);

    let (handle, cancel) = cancel_pair();
    let errors = start_relayer(
        cancel,
        chain_a,
        chain_b,
        filter,
        LinkParameters::default(),
        ProcessorType::Events,
        0,
    );

    thread::sleep(Duration::from_millis(200));

    a.commit_packet(packet(0, 100, 1));
    a.commit_packet(packet(1, 101, 1));
    a.advance_block();
    b.advance_block();

    assert!(wait_until(Duration::from_secs(5), || {
        b.received_sequences(&PortId::transfer(), &ChannelId::new(100)) == vec![1]
    }));

    thread::sleep(Duration::from_millis(300));
    assert!(b
        .received_sequences(&PortId::transfer(), &ChannelId::new(101))
        .is_empty());

    handle.cancel();
    assert!(errors.recv_timeout(Duration::from_secs(5)).is_ok());
}

#[test]
fn event_mode_skips_closed_channels() {
    let (a, b, chain_a, chain_b) = mock_pair();
    add_channel_pair(&a, &b, 0, 7);

    let (handle, cancel) = cancel_pair();
    let errors = start_relayer(
        cancel,
        chain_a,
        chain_b,
        ChannelFilter::default(),
        LinkParameters::default(),
        ProcessorType::Events,
        0,
    );

    thread::sleep(Duration::from_millis(200));

    // the close is observed before the commit is acted upon
    a.set_channel_state(&PortId::transfer(), &ChannelId::new(0), State::Closed);
    a.commit_packet(packet(0, 7, 1));
    a.advance_block();
    b.advance_block();

    thread::sleep(Duration::from_millis(500));
    assert!(b
        .received_sequences(&PortId::transfer(), &ChannelId::new(7))
        .is_empty());

    handle.cancel();
    assert!(errors.recv_timeout(Duration::from_secs(5)).is_ok());
}
