use std::sync::Arc;

use crossbeam_channel::Receiver;

use conduit_relayer_types::channel::{ChannelEnd, IdentifiedChannelEnd};
use conduit_relayer_types::events::Packet;
use conduit_relayer_types::identifier::{ChainId, ChannelId, ClientId, ConnectionId, PortId};
use conduit_relayer_types::message::{RelayMessage, TxResponse};
use conduit_relayer_types::{Height, Sequence};

use crate::error::Error;
use crate::event::EventBatch;
use crate::util::cancel::CancelToken;

/// A stream of per-block event batches, delivered in non-decreasing height
/// order. Dropped by the subscriber to unsubscribe.
pub type Subscription = Receiver<Arc<EventBatch>>;

/**
   The capability interface the relay core consumes.

   Everything that requires chain-specific knowledge lives behind this
   trait: RPC queries, light-client header retrieval, proof construction,
   transaction signing and broadcast. New chain families plug in by
   implementing it; the core never branches on a concrete provider type.

   Message construction is a capability of the side that owns the state
   being proven: the packet's origin builds `build_recv_packet`, the
   chain where the acknowledgement was written builds
   `build_acknowledgement`, and a chain builds `build_update_client`
   messages that advance a counterparty-hosted client of itself. The
   results are opaque to the core.

   Every operation takes the root [`CancelToken`]; implementations abort
   in-flight work at their next yield point once it is cancelled and
   return [`Error::cancelled`].
*/
pub trait ChainHandle: Send + Sync {
    fn id(&self) -> ChainId;

    fn name(&self) -> String;

    fn query_latest_height(&self, cancel: &CancelToken) -> Result<Height, Error>;

    /// All channels multiplexed over the given connection, at `height`.
    fn query_connection_channels(
        &self,
        cancel: &CancelToken,
        height: Height,
        connection_id: &ConnectionId,
    ) -> Result<Vec<IdentifiedChannelEnd>, Error>;

    /// The channel end under `port_id`/`channel_id`. A `None` height means
    /// the latest committed state.
    fn query_channel(
        &self,
        cancel: &CancelToken,
        height: Option<Height>,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> Result<ChannelEnd, Error>;

    /// Sequences of packets committed on this chain (as source) and not
    /// yet cleared by an acknowledgement.
    fn query_packet_commitments(
        &self,
        cancel: &CancelToken,
        height: Height,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> Result<Vec<Sequence>, Error>;

    /// Sequences for which this chain (as destination) has written an
    /// acknowledgement.
    fn query_packet_acknowledgements(
        &self,
        cancel: &CancelToken,
        height: Height,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> Result<Vec<Sequence>, Error>;

    /// Of the given commitment sequences, those this chain (as
    /// destination) has not yet received.
    fn query_unreceived_packets(
        &self,
        cancel: &CancelToken,
        height: Height,
        port_id: &PortId,
        channel_id: &ChannelId,
        sequences: &[Sequence],
    ) -> Result<Vec<Sequence>, Error>;

    /// Of the given acknowledgement sequences, those this chain (as
    /// source) has not yet processed, i.e. whose commitment still exists.
    fn query_unreceived_acknowledgements(
        &self,
        cancel: &CancelToken,
        height: Height,
        port_id: &PortId,
        channel_id: &ChannelId,
        sequences: &[Sequence],
    ) -> Result<Vec<Sequence>, Error>;

    /// The next sequence this chain (as destination) expects to receive on
    /// an ordered channel.
    fn query_next_sequence_receive(
        &self,
        cancel: &CancelToken,
        height: Height,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> Result<Sequence, Error>;

    /// Build a message that advances the client `client_id` hosted on the
    /// counterparty, tracking this chain, to at least `target_height`.
    fn build_update_client(
        &self,
        cancel: &CancelToken,
        client_id: &ClientId,
        target_height: Height,
    ) -> Result<RelayMessage, Error>;

    /// Build the receive message for a packet committed on this chain,
    /// proven at `proof_height`, for submission on the destination.
    fn build_recv_packet(
        &self,
        cancel: &CancelToken,
        packet: &Packet,
        proof_height: Height,
    ) -> Result<RelayMessage, Error>;

    /// Build the acknowledgement message for an ack written on this chain,
    /// proven at `proof_height`, for submission on the packet's origin.
    fn build_acknowledgement(
        &self,
        cancel: &CancelToken,
        packet: &Packet,
        proof_height: Height,
    ) -> Result<RelayMessage, Error>;

    /// Sign and broadcast one transaction carrying `msgs`, in order.
    fn send_messages(
        &self,
        cancel: &CancelToken,
        msgs: Vec<RelayMessage>,
        memo: &str,
    ) -> Result<TxResponse, Error>;

    /// Subscribe to per-block event batches starting at `from_height`.
    fn subscribe(
        &self,
        cancel: &CancelToken,
        from_height: Height,
    ) -> Result<Subscription, Error>;
}
