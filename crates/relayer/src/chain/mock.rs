//! An in-memory chain for tests.
//!
//! `MockChain` keeps channel ends, packet commitments, receives and
//! acknowledgements in a mutex-guarded state table and implements the
//! full [`ChainHandle`] capability surface against it. Submitted
//! messages are applied to the state the way a real chain would apply
//! them, so a pair of mocks can drive the relay engines end to end
//! without any networking.
//!
//! Messages are encoded as JSON payloads of [`MockMsg`] behind the usual
//! protobuf type urls; the relay core treats them as opaque either way.

use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{unbounded, Sender};
use serde_derive::{Deserialize, Serialize};

use conduit_relayer_types::channel::{ChannelEnd, IdentifiedChannelEnd, State};
use conduit_relayer_types::events::{ChannelAttributes, IbcEvent, NewBlock, Packet};
use conduit_relayer_types::identifier::{ChainId, ChannelId, ClientId, ConnectionId, PortId};
use conduit_relayer_types::message::{RelayMessage, TxResponse};
use conduit_relayer_types::{Height, Sequence};

use crate::chain::handle::{ChainHandle, Subscription};
use crate::chain::settlement::SettlementProvider;
use crate::error::Error;
use crate::event::{EventBatch, IbcEventWithHeight};
use crate::util::cancel::CancelToken;

pub const UPDATE_CLIENT_TYPE_URL: &str = "/ibc.core.client.v1.MsgUpdateClient";
pub const RECV_PACKET_TYPE_URL: &str = "/ibc.core.channel.v1.MsgRecvPacket";
pub const ACKNOWLEDGEMENT_TYPE_URL: &str = "/ibc.core.channel.v1.MsgAcknowledgement";

/// The decoded form of every message a mock chain can build and apply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MockMsg {
    UpdateClient {
        client_id: ClientId,
        target_height: Height,
    },
    RecvPacket {
        packet: Packet,
        proof_height: Height,
    },
    Acknowledgement {
        packet: Packet,
        proof_height: Height,
    },
}

/// One transaction accepted by a mock chain, decoded for assertions.
#[derive(Clone, Debug)]
pub struct SubmittedTx {
    pub msgs: Vec<MockMsg>,
    pub memo: String,
}

#[derive(Default)]
struct MockState {
    latest_height: u64,
    channels: Vec<IdentifiedChannelEnd>,
    commitments: BTreeMap<(PortId, ChannelId), BTreeSet<Sequence>>,
    received: BTreeMap<(PortId, ChannelId), BTreeSet<Sequence>>,
    acks: BTreeMap<(PortId, ChannelId), BTreeSet<Sequence>>,
    next_sequence_recv: BTreeMap<(PortId, ChannelId), u64>,
    client_height: u64,
    submitted: Vec<SubmittedTx>,
    pending_events: Vec<IbcEvent>,
    history: Vec<Arc<EventBatch>>,
    subscribers: Vec<Sender<Arc<EventBatch>>>,
    submit_failure: Option<String>,
    submit_delay: Option<Duration>,
    height_query_failure: Option<String>,
    finalized_height: Option<u64>,
}

/// A chain whose entire consensus is a mutex.
#[derive(Clone)]
pub struct MockChain {
    chain_id: ChainId,
    state: Arc<Mutex<MockState>>,
}

impl MockChain {
    pub fn new(chain_id: &str, initial_height: u64) -> Self {
        assert!(initial_height > 0, "mock chains start above height zero");

        let state = MockState {
            latest_height: initial_height,
            ..MockState::default()
        };

        Self {
            chain_id: ChainId::new(chain_id),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("poisoned mock chain state")
    }

    // --- test drivers -----------------------------------------------------

    /// Install a channel end. Lifecycle events are emitted through
    /// [`set_channel_state`](Self::set_channel_state).
    pub fn add_channel(&self, channel: IdentifiedChannelEnd) {
        self.lock().channels.push(channel);
    }

    /// Flip the state of a known channel and queue the matching lifecycle
    /// event for the next block.
    pub fn set_channel_state(&self, port_id: &PortId, channel_id: &ChannelId, state: State) {
        let mut guard = self.lock();

        let Some(channel) = guard
            .channels
            .iter_mut()
            .find(|c| c.port_id == *port_id && c.channel_id == *channel_id)
        else {
            panic!("unknown channel {port_id}/{channel_id} on {}", self.chain_id);
        };

        channel.channel_end.state = state;

        let attrs = ChannelAttributes {
            port_id: channel.port_id.clone(),
            channel_id: channel.channel_id.clone(),
            counterparty_port_id: channel.channel_end.remote.port_id.clone(),
            counterparty_channel_id: channel.channel_end.remote.channel_id.clone(),
            ordering: channel.channel_end.ordering,
        };

        let event = match state {
            State::Init => IbcEvent::OpenInitChannel(attrs),
            State::TryOpen => IbcEvent::OpenTryChannel(attrs),
            State::Open => IbcEvent::OpenConfirmChannel(attrs),
            State::Closed => IbcEvent::CloseConfirmChannel(attrs),
            State::Uninitialized => return,
        };

        guard.pending_events.push(event);
    }

    /// Commit an outgoing packet, as an application module would.
    pub fn commit_packet(&self, packet: Packet) {
        let mut guard = self.lock();
        guard
            .commitments
            .entry((packet.source_port.clone(), packet.source_channel.clone()))
            .or_default()
            .insert(packet.sequence);
        guard.pending_events.push(IbcEvent::SendPacket(packet));
    }

    /// Mark a packet received out of band, bypassing message submission.
    pub fn receive_packet_directly(&self, packet: Packet) {
        let mut guard = self.lock();
        apply_recv(&mut guard, &packet);
    }

    /// Commit a block: bump the height and deliver the queued events to
    /// every subscriber.
    pub fn advance_block(&self) -> Height {
        let mut guard = self.lock();
        guard.latest_height += 1;
        let height = Height::new(guard.latest_height).expect("height is positive");

        let mut events = vec![IbcEventWithHeight::new(
            IbcEvent::NewBlock(NewBlock::new(height)),
            height,
        )];
        for event in guard.pending_events.drain(..) {
            events.push(IbcEventWithHeight::new(event, height));
        }

        let batch = Arc::new(EventBatch {
            chain_id: self.chain_id.clone(),
            height,
            events,
        });

        guard.history.push(batch.clone());
        guard
            .subscribers
            .retain(|subscriber| subscriber.send(batch.clone()).is_ok());

        height
    }

    /// Fail the next submission with the given log line.
    pub fn fail_next_submit(&self, log: impl Into<String>) {
        self.lock().submit_failure = Some(log.into());
    }

    /// Stall every submission for `delay`, still honoring cancellation.
    pub fn set_submit_delay(&self, delay: Duration) {
        self.lock().submit_delay = Some(delay);
    }

    /// Fail the next latest-height query with a transport error.
    pub fn fail_next_height_query(&self, reason: impl Into<String>) {
        self.lock().height_query_failure = Some(reason.into());
    }

    pub fn set_finalized_height(&self, height: u64) {
        self.lock().finalized_height = Some(height);
    }

    // --- test assertions --------------------------------------------------

    pub fn latest_height(&self) -> u64 {
        self.lock().latest_height
    }

    pub fn submitted_txs(&self) -> Vec<SubmittedTx> {
        self.lock().submitted.clone()
    }

    pub fn received_sequences(&self, port_id: &PortId, channel_id: &ChannelId) -> Vec<u64> {
        self.lock()
            .received
            .get(&(port_id.clone(), channel_id.clone()))
            .map(|set| set.iter().map(|seq| seq.value()).collect())
            .unwrap_or_default()
    }

    pub fn commitment_sequences(&self, port_id: &PortId, channel_id: &ChannelId) -> Vec<u64> {
        self.lock()
            .commitments
            .get(&(port_id.clone(), channel_id.clone()))
            .map(|set| set.iter().map(|seq| seq.value()).collect())
            .unwrap_or_default()
    }

    pub fn written_ack_sequences(&self, port_id: &PortId, channel_id: &ChannelId) -> Vec<u64> {
        self.lock()
            .acks
            .get(&(port_id.clone(), channel_id.clone()))
            .map(|set| set.iter().map(|seq| seq.value()).collect())
            .unwrap_or_default()
    }

    // --- submission -------------------------------------------------------

    fn apply_msg(&self, guard: &mut MockState, msg: &MockMsg) {
        match msg {
            MockMsg::UpdateClient { target_height, .. } => {
                if target_height.value() > guard.client_height {
                    guard.client_height = target_height.value();
                }
            }
            MockMsg::RecvPacket { packet, .. } => {
                apply_recv(guard, packet);
            }
            MockMsg::Acknowledgement { packet, .. } => {
                // The acknowledgement proof clears the commitment here on
                // the packet's origin.
                let key = (packet.source_port.clone(), packet.source_channel.clone());
                if let Some(commitments) = guard.commitments.get_mut(&key) {
                    commitments.remove(&packet.sequence);
                }
                guard
                    .pending_events
                    .push(IbcEvent::AcknowledgePacket(packet.clone()));
            }
        }
    }
}

fn apply_recv(guard: &mut MockState, packet: &Packet) {
    let key = (
        packet.destination_port.clone(),
        packet.destination_channel.clone(),
    );

    guard.received.entry(key.clone()).or_default().insert(packet.sequence);
    guard.acks.entry(key.clone()).or_default().insert(packet.sequence);

    let next = guard.next_sequence_recv.entry(key).or_insert(1);
    if packet.sequence.value() == *next {
        *next += 1;
    }

    guard
        .pending_events
        .push(IbcEvent::ReceivePacket(packet.clone()));
    guard
        .pending_events
        .push(IbcEvent::WriteAcknowledgement(packet.clone()));
}

fn decode(msg: &RelayMessage) -> Result<MockMsg, Error> {
    serde_json::from_slice(&msg.value)
        .map_err(|e| Error::protocol(format!("malformed mock message {}: {e}", msg.type_url)))
}

fn encode(type_url: &str, msg: &MockMsg) -> RelayMessage {
    let value = serde_json::to_vec(msg).expect("mock messages serialize");
    RelayMessage::new(type_url, value)
}

fn check_cancelled(cancel: &CancelToken) -> Result<(), Error> {
    if cancel.is_cancelled() {
        return Err(Error::cancelled());
    }
    Ok(())
}

impl ChainHandle for MockChain {
    fn id(&self) -> ChainId {
        self.chain_id.clone()
    }

    fn name(&self) -> String {
        self.chain_id.to_string()
    }

    fn query_latest_height(&self, cancel: &CancelToken) -> Result<Height, Error> {
        check_cancelled(cancel)?;
        let mut guard = self.lock();
        if let Some(reason) = guard.height_query_failure.take() {
            return Err(Error::transport(reason));
        }
        Height::new(guard.latest_height).map_err(|e| Error::protocol(format!("mock chain height: {e}")))
    }

    fn query_connection_channels(
        &self,
        cancel: &CancelToken,
        _height: Height,
        _connection_id: &ConnectionId,
    ) -> Result<Vec<IdentifiedChannelEnd>, Error> {
        check_cancelled(cancel)?;
        Ok(self.lock().channels.clone())
    }

    fn query_channel(
        &self,
        cancel: &CancelToken,
        _height: Option<Height>,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> Result<ChannelEnd, Error> {
        check_cancelled(cancel)?;
        self.lock()
            .channels
            .iter()
            .find(|c| c.port_id == *port_id && c.channel_id == *channel_id)
            .map(|c| c.channel_end.clone())
            .ok_or_else(|| {
                Error::channel_not_found(self.chain_id.clone(), channel_id.clone(), port_id.clone())
            })
    }

    fn query_packet_commitments(
        &self,
        cancel: &CancelToken,
        _height: Height,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> Result<Vec<Sequence>, Error> {
        check_cancelled(cancel)?;
        Ok(self
            .lock()
            .commitments
            .get(&(port_id.clone(), channel_id.clone()))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn query_packet_acknowledgements(
        &self,
        cancel: &CancelToken,
        _height: Height,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> Result<Vec<Sequence>, Error> {
        check_cancelled(cancel)?;
        Ok(self
            .lock()
            .acks
            .get(&(port_id.clone(), channel_id.clone()))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    fn query_unreceived_packets(
        &self,
        cancel: &CancelToken,
        _height: Height,
        port_id: &PortId,
        channel_id: &ChannelId,
        sequences: &[Sequence],
    ) -> Result<Vec<Sequence>, Error> {
        check_cancelled(cancel)?;
        let guard = self.lock();
        let received = guard.received.get(&(port_id.clone(), channel_id.clone()));
        Ok(sequences
            .iter()
            .filter(|seq| received.map_or(true, |set| !set.contains(*seq)))
            .copied()
            .collect())
    }

    fn query_unreceived_acknowledgements(
        &self,
        cancel: &CancelToken,
        _height: Height,
        port_id: &PortId,
        channel_id: &ChannelId,
        sequences: &[Sequence],
    ) -> Result<Vec<Sequence>, Error> {
        check_cancelled(cancel)?;
        let guard = self.lock();
        let commitments = guard.commitments.get(&(port_id.clone(), channel_id.clone()));
        Ok(sequences
            .iter()
            .filter(|seq| commitments.map_or(false, |set| set.contains(*seq)))
            .copied()
            .collect())
    }

    fn query_next_sequence_receive(
        &self,
        cancel: &CancelToken,
        _height: Height,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> Result<Sequence, Error> {
        check_cancelled(cancel)?;
        Ok(Sequence::from(
            self.lock()
                .next_sequence_recv
                .get(&(port_id.clone(), channel_id.clone()))
                .copied()
                .unwrap_or(1),
        ))
    }

    fn build_update_client(
        &self,
        cancel: &CancelToken,
        client_id: &ClientId,
        target_height: Height,
    ) -> Result<RelayMessage, Error> {
        check_cancelled(cancel)?;
        Ok(encode(
            UPDATE_CLIENT_TYPE_URL,
            &MockMsg::UpdateClient {
                client_id: client_id.clone(),
                target_height,
            },
        ))
    }

    fn build_recv_packet(
        &self,
        cancel: &CancelToken,
        packet: &Packet,
        proof_height: Height,
    ) -> Result<RelayMessage, Error> {
        check_cancelled(cancel)?;
        Ok(encode(
            RECV_PACKET_TYPE_URL,
            &MockMsg::RecvPacket {
                packet: packet.clone(),
                proof_height,
            },
        ))
    }

    fn build_acknowledgement(
        &self,
        cancel: &CancelToken,
        packet: &Packet,
        proof_height: Height,
    ) -> Result<RelayMessage, Error> {
        check_cancelled(cancel)?;
        Ok(encode(
            ACKNOWLEDGEMENT_TYPE_URL,
            &MockMsg::Acknowledgement {
                packet: packet.clone(),
                proof_height,
            },
        ))
    }

    fn send_messages(
        &self,
        cancel: &CancelToken,
        msgs: Vec<RelayMessage>,
        memo: &str,
    ) -> Result<TxResponse, Error> {
        let delay = self.lock().submit_delay;
        if let Some(delay) = delay {
            if cancel.sleep(delay) {
                return Err(Error::cancelled());
            }
        }
        check_cancelled(cancel)?;

        let mut guard = self.lock();

        if let Some(log) = guard.submit_failure.take() {
            return Err(Error::submit(log));
        }

        let decoded = msgs.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        for msg in &decoded {
            self.apply_msg(&mut guard, msg);
        }

        let hash = format!("{}-{}", self.chain_id, guard.submitted.len());
        guard.submitted.push(SubmittedTx {
            msgs: decoded,
            memo: memo.to_string(),
        });

        Ok(TxResponse {
            code: 0,
            log: String::new(),
            hash,
        })
    }

    fn subscribe(
        &self,
        cancel: &CancelToken,
        from_height: Height,
    ) -> Result<Subscription, Error> {
        check_cancelled(cancel)?;

        let mut guard = self.lock();
        let (tx, rx) = unbounded();

        // Replay history so late subscribers still observe earlier blocks.
        for batch in &guard.history {
            if batch.height >= from_height {
                let _ = tx.send(batch.clone());
            }
        }

        guard.subscribers.push(tx);
        Ok(rx)
    }
}

impl SettlementProvider for MockChain {
    fn query_latest_finalized_height(
        &self,
        cancel: &CancelToken,
        _rollapp_id: &str,
    ) -> Result<Option<Height>, Error> {
        check_cancelled(cancel)?;
        let guard = self.lock();
        match guard.finalized_height {
            Some(height) => Height::new(height)
                .map(Some)
                .map_err(|e| Error::protocol(format!("mock finalized height: {e}"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use conduit_relayer_types::channel::{Counterparty, Ordering};
    use crate::util::cancel::cancel_pair;

    fn packet(seq: u64) -> Packet {
        Packet {
            sequence: seq.into(),
            source_port: PortId::transfer(),
            source_channel: ChannelId::new(0),
            destination_port: PortId::transfer(),
            destination_channel: ChannelId::new(7),
        }
    }

    fn channel(id: u64, counterparty: u64, state: State) -> IdentifiedChannelEnd {
        IdentifiedChannelEnd::new(
            PortId::transfer(),
            ChannelId::new(id),
            ChannelEnd::new(
                state,
                Ordering::Unordered,
                Counterparty::new(PortId::transfer(), Some(ChannelId::new(counterparty))),
                vec![ConnectionId::new(0)],
                "ics20-1".to_string(),
            ),
        )
    }

    #[test]
    fn recv_marks_received_and_writes_ack() {
        let chain = MockChain::new("ibc-1", 10);
        let (_handle, cancel) = cancel_pair();

        let msg = chain
            .build_recv_packet(&cancel, &packet(1), Height::new(9).unwrap())
            .unwrap();
        chain.send_messages(&cancel, vec![msg], "").unwrap();

        assert_eq!(
            chain.received_sequences(&PortId::transfer(), &ChannelId::new(7)),
            vec![1]
        );
        assert_eq!(
            chain.written_ack_sequences(&PortId::transfer(), &ChannelId::new(7)),
            vec![1]
        );
    }

    #[test]
    fn ack_clears_commitment_on_origin() {
        let chain = MockChain::new("ibc-0", 10);
        let (_handle, cancel) = cancel_pair();

        chain.commit_packet(packet(3));
        assert_eq!(
            chain.commitment_sequences(&PortId::transfer(), &ChannelId::new(0)),
            vec![3]
        );

        let msg = chain
            .build_acknowledgement(&cancel, &packet(3), Height::new(9).unwrap())
            .unwrap();
        chain.send_messages(&cancel, vec![msg], "").unwrap();

        assert!(chain
            .commitment_sequences(&PortId::transfer(), &ChannelId::new(0))
            .is_empty());
    }

    #[test]
    fn cancelled_submission_has_no_effect() {
        let chain = MockChain::new("ibc-1", 10);
        let (handle, cancel) = cancel_pair();

        let msg = chain
            .build_recv_packet(&cancel, &packet(1), Height::new(9).unwrap())
            .unwrap();

        handle.cancel();
        let err = chain.send_messages(&cancel, vec![msg], "").unwrap_err();
        assert!(err.is_cancelled());
        assert!(chain.submitted_txs().is_empty());
        assert!(chain
            .received_sequences(&PortId::transfer(), &ChannelId::new(7))
            .is_empty());
    }

    #[test]
    fn subscription_replays_history() {
        let chain = MockChain::new("ibc-0", 5);
        let (_handle, cancel) = cancel_pair();

        chain.commit_packet(packet(1));
        let first = chain.advance_block();
        chain.advance_block();

        let subscription = chain.subscribe(&cancel, first).unwrap();
        let batch = subscription.try_recv().unwrap();
        assert_eq!(batch.height, first);
        assert_eq!(batch.events.len(), 2);

        let channel_query = chain.query_channel(
            &cancel,
            None,
            &PortId::transfer(),
            &ChannelId::new(0),
        );
        assert!(channel_query.is_err());

        chain.add_channel(channel(0, 7, State::Open));
        assert!(chain
            .query_channel(&cancel, None, &PortId::transfer(), &ChannelId::new(0))
            .is_ok());
    }
}
