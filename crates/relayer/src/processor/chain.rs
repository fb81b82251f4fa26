//! Per-endpoint state for the event-driven engine.
//!
//! A chain processor tails the block event stream of one chain, folds the
//! events into its caches and publishes an immutable, height-versioned
//! snapshot to every subscribed path processor after each block.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crossbeam_channel::{select, Sender};
use tracing::{debug, error_span, info, warn};

use conduit_relayer_types::channel::{Ordering, State};
use conduit_relayer_types::events::{ChannelAttributes, IbcEvent, Packet};
use conduit_relayer_types::identifier::ChainId;
use conduit_relayer_types::{Height, Sequence};

use crate::chain::handle::Subscription;
use crate::chain::Chain;
use crate::event::EventBatch;
use crate::processor::error::Error;
use crate::processor::ChannelKey;
use crate::util::cancel::CancelToken;
use crate::util::retry::{retry_with_index, RetryResult};
use crate::worker::retry_strategy;

/// An immutable view of one chain's relay-relevant state at a height.
///
/// Path processors receive these in non-decreasing height order and never
/// mutate them; a snapshot shared between processors is the same `Arc`.
#[derive(Clone, Debug, Default)]
pub struct ChainSnapshot {
    pub chain_id: ChainId,
    pub height: Option<Height>,

    /// Latest observed state per channel.
    pub channels: BTreeMap<ChannelKey, State>,

    /// Delivery discipline per channel, learned from lifecycle events.
    pub orderings: BTreeMap<ChannelKey, Ordering>,

    /// Packets committed on this chain for which no acknowledgement has
    /// come back yet, keyed by the sending side of the channel.
    pub pending_packets: BTreeMap<ChannelKey, BTreeMap<Sequence, Packet>>,

    /// Packets this chain has received, keyed by the receiving side.
    pub received: BTreeMap<ChannelKey, BTreeSet<Sequence>>,

    /// Acknowledgements written by this chain, keyed by the receiving
    /// side.
    pub written_acks: BTreeMap<ChannelKey, BTreeMap<Sequence, Packet>>,

    /// The newest consensus height of the counterparty client hosted on
    /// this chain.
    pub client_consensus_height: Option<Height>,
}

/// Follows one chain and keeps [`ChainSnapshot`]s flowing to the path
/// processors paired with it.
pub struct ChainProcessor {
    chain: Chain,
    subscribers: Vec<Sender<Arc<ChainSnapshot>>>,
    state: ChainSnapshot,
}

impl ChainProcessor {
    pub fn new(chain: Chain) -> Self {
        let state = ChainSnapshot {
            chain_id: chain.id(),
            ..ChainSnapshot::default()
        };

        Self {
            chain,
            subscribers: Vec::new(),
            state,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain.id()
    }

    pub(crate) fn add_subscriber(&mut self, tx: Sender<Arc<ChainSnapshot>>) {
        self.subscribers.push(tx);
    }

    /// Tail the chain until cancellation. Terminal only when the block
    /// subscription cannot be re-established under the retry policy.
    pub(crate) fn run(
        mut self,
        cancel: CancelToken,
        initial_block_history: u64,
    ) -> Result<(), Error> {
        let span = error_span!("processor.chain", chain = %self.chain.id());
        let _entered = span.enter();

        let latest = self.query_latest_height_with_retry(&cancel)?;
        let from = latest.sub_or_first(initial_block_history);

        info!(
            latest = %latest,
            from = %from,
            "starting block stream"
        );

        let mut subscription = self.subscribe_with_retry(&cancel, from)?;

        loop {
            let next = select! {
                recv(subscription) -> batch => batch,
                recv(cancel.receiver()) -> _ => {
                    debug!("shutting down, releasing block subscription");
                    return Ok(());
                }
            };

            match next {
                Ok(batch) => {
                    self.process_batch(&batch);
                    self.publish();
                }
                Err(_) => {
                    // The provider ended the stream; resume where the
                    // caches left off.
                    warn!("block subscription dropped, re-subscribing");
                    let resume = self.state.height.map(Height::increment).unwrap_or(from);
                    subscription = self.subscribe_with_retry(&cancel, resume)?;
                }
            }
        }
    }

    fn query_latest_height_with_retry(&self, cancel: &CancelToken) -> Result<Height, Error> {
        retry_with_index(retry_strategy::worker_default_strategy(), |attempt| {
            if cancel.is_cancelled() {
                return RetryResult::Err(crate::error::Error::cancelled());
            }

            match self.chain.handle().query_latest_height(cancel) {
                Ok(height) => RetryResult::Ok(height),
                Err(e) if e.is_transient() => {
                    info!(attempt, "failed to query latest height: {}", e);
                    RetryResult::Retry(e)
                }
                Err(e) => RetryResult::Err(e),
            }
        })
        .map_err(|e| Error::chain(e.error))
    }

    fn subscribe_with_retry(
        &self,
        cancel: &CancelToken,
        from: Height,
    ) -> Result<Subscription, Error> {
        let result = retry_with_index(retry_strategy::worker_default_strategy(), |attempt| {
            if cancel.is_cancelled() {
                return RetryResult::Err(crate::error::Error::cancelled());
            }

            match self.chain.handle().subscribe(cancel, from) {
                Ok(subscription) => RetryResult::Ok(subscription),
                Err(e) if e.is_transient() => {
                    info!(attempt, "failed to subscribe to blocks: {}", e);
                    RetryResult::Retry(e)
                }
                Err(e) => RetryResult::Err(e),
            }
        });

        result.map_err(|e| {
            if e.error.is_cancelled() {
                Error::chain(e.error)
            } else {
                Error::subscription_closed(self.chain.id())
            }
        })
    }

    fn process_batch(&mut self, batch: &EventBatch) {
        if Some(batch.height) > self.state.height {
            self.state.height = Some(batch.height);
        }

        for event in &batch.events {
            self.process_event(&event.event);
        }
    }

    fn process_event(&mut self, event: &IbcEvent) {
        match event {
            IbcEvent::NewBlock(block) => {
                if Some(block.height) > self.state.height {
                    self.state.height = Some(block.height);
                }
            }

            IbcEvent::OpenInitChannel(attrs) => {
                self.set_channel_state(attrs, State::Init);
            }
            IbcEvent::OpenTryChannel(attrs) => {
                self.set_channel_state(attrs, State::TryOpen);
            }
            IbcEvent::OpenAckChannel(attrs) | IbcEvent::OpenConfirmChannel(attrs) => {
                self.set_channel_state(attrs, State::Open);
            }
            IbcEvent::CloseInitChannel(attrs) | IbcEvent::CloseConfirmChannel(attrs) => {
                self.set_channel_state(attrs, State::Closed);
            }

            IbcEvent::SendPacket(packet) => {
                let key = ChannelKey::from_packet_source(packet);
                self.state
                    .pending_packets
                    .entry(key)
                    .or_default()
                    .insert(packet.sequence, packet.clone());
            }

            IbcEvent::ReceivePacket(packet) => {
                let key = ChannelKey::from_packet_destination(packet);
                self.state
                    .received
                    .entry(key)
                    .or_default()
                    .insert(packet.sequence);
            }

            IbcEvent::WriteAcknowledgement(packet) => {
                let key = ChannelKey::from_packet_destination(packet);
                self.state
                    .received
                    .entry(key.clone())
                    .or_default()
                    .insert(packet.sequence);
                self.state
                    .written_acks
                    .entry(key)
                    .or_default()
                    .insert(packet.sequence, packet.clone());
            }

            IbcEvent::AcknowledgePacket(packet) => {
                // The acknowledgement made it back here; the packet is no
                // longer pending on this side.
                let key = ChannelKey::from_packet_source(packet);
                if let Some(pending) = self.state.pending_packets.get_mut(&key) {
                    pending.remove(&packet.sequence);
                }
            }

            IbcEvent::UpdateClient(update) => {
                if Some(update.consensus_height) > self.state.client_consensus_height {
                    self.state.client_consensus_height = Some(update.consensus_height);
                }
            }
        }
    }

    fn set_channel_state(&mut self, attrs: &ChannelAttributes, state: State) {
        let key = ChannelKey::from_attributes(attrs);
        debug!(
            channel = %key.channel_id,
            port = %key.port_id,
            state = %state,
            "channel state change"
        );
        self.state.orderings.insert(key.clone(), attrs.ordering);
        self.state.channels.insert(key, state);
    }

    fn publish(&self) {
        let snapshot = Arc::new(self.state.clone());
        for subscriber in &self.subscribers {
            // A dropped subscriber just stops receiving snapshots.
            let _ = subscriber.send(snapshot.clone());
        }
    }
}
