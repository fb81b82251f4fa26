//! Packet and acknowledgement relay operations over one channel.
//!
//! A [`Link`] owns the two directed [`RelayPath`]s of a channel. Each path
//! computes the sequences that still need relaying, assembles the
//! corresponding messages behind a client update, packs them into
//! transactions under the configured size and count limits, and submits
//! them to the receiving chain.

use std::thread;

use itertools::Itertools;
use tracing::{debug, info};

use conduit_relayer_types::channel::{IdentifiedChannelEnd, Ordering};
use conduit_relayer_types::events::Packet;
use conduit_relayer_types::identifier::{ChannelId, PortId};
use conduit_relayer_types::message::RelayMessage;
use conduit_relayer_types::{Height, Sequence};

use crate::chain::Chain;
use crate::config::types::{Memo, TxMsgLimit, TxSizeLimit};
use crate::error::Error;
use crate::util::cancel::CancelToken;

pub mod error;

pub use error::LinkError;

/// Acknowledgement scans query the counterparty in chunks of this many
/// sequences, so one congested channel cannot produce unbounded queries.
pub const ACK_CHUNK_SIZE: usize = 1000;

/// Sequences within this distance of the newest already-relayed ack are
/// re-checked against the chain instead of being skipped from the cache,
/// so an ack whose submission did not land is picked up again.
pub const ACK_GAP_FOR_FULL_SCAN: u64 = 20;

/// The unrelayed packet sequences of a channel, one list per direction.
///
/// `src` holds sequences committed on the source but not received on the
/// destination; `dst` the reverse. Both empty means the channel is fully
/// drained at the queried heights.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceSet {
    pub src: Vec<Sequence>,
    pub dst: Vec<Sequence>,
}

impl SequenceSet {
    pub fn is_empty(&self) -> bool {
        self.src.is_empty() && self.dst.is_empty()
    }
}

/// The transaction limits and memo shared by both directions of a link.
#[derive(Clone, Debug, Default)]
pub struct LinkParameters {
    pub max_tx_size: TxSizeLimit,
    pub max_msgs_per_tx: TxMsgLimit,
    pub memo: Memo,
}

/// Both directed relay paths of one channel.
pub struct Link {
    pub a_to_b: RelayPath,
    pub b_to_a: RelayPath,
}

impl Link {
    /// Build a link from the channel end observed on `src`. Fails if the
    /// handshake has not completed far enough for the counterparty channel
    /// id to be known.
    pub fn new(
        src: Chain,
        dst: Chain,
        channel: &IdentifiedChannelEnd,
        params: LinkParameters,
    ) -> Result<Self, LinkError> {
        let counterparty = channel.channel_end.counterparty();
        let dst_channel_id = counterparty
            .channel_id()
            .map_err(|_| LinkError::counterparty_channel_not_found(channel.channel_id.clone()))?
            .clone();
        let dst_port_id = counterparty.port_id.clone();
        let ordering = channel.channel_end.ordering;

        let a_to_b = RelayPath {
            src: src.clone(),
            dst: dst.clone(),
            src_port_id: channel.port_id.clone(),
            src_channel_id: channel.channel_id.clone(),
            dst_port_id: dst_port_id.clone(),
            dst_channel_id: dst_channel_id.clone(),
            ordering,
            params: params.clone(),
        };

        let b_to_a = RelayPath {
            src: dst,
            dst: src,
            src_port_id: dst_port_id,
            src_channel_id: dst_channel_id,
            dst_port_id: channel.port_id.clone(),
            dst_channel_id: channel.channel_id.clone(),
            ordering,
            params,
        };

        Ok(Self { a_to_b, b_to_a })
    }

    /// Compute the unrelayed packet sequences in both directions.
    ///
    /// The heights passed in must already be proof-adjusted: proofs for
    /// state at height `h` are committed in block `h + 1`, so callers
    /// query at `latest - 1`.
    pub fn unrelayed_packets(
        &self,
        cancel: &CancelToken,
        src_height: Height,
        dst_height: Height,
    ) -> Result<SequenceSet, LinkError> {
        let src = self
            .a_to_b
            .unrelayed_packet_sequences(cancel, src_height, dst_height)?;
        let dst = self
            .b_to_a
            .unrelayed_packet_sequences(cancel, dst_height, src_height)?;
        Ok(SequenceSet { src, dst })
    }

    /// Relay the packets of `set`, both directions concurrently. Each
    /// direction submits its transactions sequentially.
    pub fn relay_packets(
        &self,
        cancel: &CancelToken,
        src_height: Height,
        dst_height: Height,
        set: &SequenceSet,
    ) -> Result<(), LinkError> {
        let (res_ab, res_ba) = thread::scope(|s| {
            let ab = s.spawn(|| self.a_to_b.relay_packet_messages(cancel, src_height, &set.src));
            let ba = s.spawn(|| self.b_to_a.relay_packet_messages(cancel, dst_height, &set.dst));
            (join_relay_thread(ab), join_relay_thread(ba))
        });

        // Surface a cancellation from either direction first, so the
        // caller does not mistake shutdown for an application failure.
        match (res_ab, res_ba) {
            (Err(e), _) | (_, Err(e)) if e.is_cancelled() => Err(e),
            (Err(e), _) | (_, Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}

fn join_relay_thread(
    handle: thread::ScopedJoinHandle<'_, Result<(), LinkError>>,
) -> Result<(), LinkError> {
    handle
        .join()
        .unwrap_or_else(|_| Err(LinkError::relayer(Error::protocol("relay thread panicked".into()))))
}

/// One direction of a channel: packets committed on `src` flow to `dst`,
/// and the acknowledgements written on `dst` flow back to `src`.
pub struct RelayPath {
    src: Chain,
    dst: Chain,
    src_port_id: PortId,
    src_channel_id: ChannelId,
    dst_port_id: PortId,
    dst_channel_id: ChannelId,
    ordering: Ordering,
    params: LinkParameters,
}

impl RelayPath {
    pub fn src_chain(&self) -> &Chain {
        &self.src
    }

    pub fn dst_chain(&self) -> &Chain {
        &self.dst
    }

    pub fn src_port_id(&self) -> &PortId {
        &self.src_port_id
    }

    pub fn src_channel_id(&self) -> &ChannelId {
        &self.src_channel_id
    }

    pub fn dst_port_id(&self) -> &PortId {
        &self.dst_port_id
    }

    pub fn dst_channel_id(&self) -> &ChannelId {
        &self.dst_channel_id
    }

    pub fn ordering(&self) -> Ordering {
        self.ordering
    }

    fn packet(&self, sequence: Sequence) -> Packet {
        Packet {
            sequence,
            source_port: self.src_port_id.clone(),
            source_channel: self.src_channel_id.clone(),
            destination_port: self.dst_port_id.clone(),
            destination_channel: self.dst_channel_id.clone(),
        }
    }

    /// Sequences committed on `src` at `src_height` that `dst` has not
    /// received at `dst_height`, narrowed to what the channel ordering
    /// permits relaying.
    pub fn unrelayed_packet_sequences(
        &self,
        cancel: &CancelToken,
        src_height: Height,
        dst_height: Height,
    ) -> Result<Vec<Sequence>, LinkError> {
        let commitments = self
            .src
            .handle()
            .query_packet_commitments(cancel, src_height, &self.src_port_id, &self.src_channel_id)
            .map_err(LinkError::relayer)?;

        if commitments.is_empty() {
            return Ok(vec![]);
        }

        let mut unreceived = self
            .dst
            .handle()
            .query_unreceived_packets(
                cancel,
                dst_height,
                &self.dst_port_id,
                &self.dst_channel_id,
                &commitments,
            )
            .map_err(LinkError::relayer)?;

        unreceived.sort_unstable();

        match self.ordering {
            Ordering::Unordered => Ok(unreceived),
            Ordering::Ordered => {
                // Only the contiguous run starting at the counterparty's
                // next expected sequence can be delivered.
                let next = self
                    .dst
                    .handle()
                    .query_next_sequence_receive(
                        cancel,
                        dst_height,
                        &self.dst_port_id,
                        &self.dst_channel_id,
                    )
                    .map_err(LinkError::relayer)?;

                let mut expected = next;
                let run = unreceived
                    .into_iter()
                    .take_while(|seq| {
                        let matches = *seq == expected;
                        expected = expected.increment();
                        matches
                    })
                    .collect();
                Ok(run)
            }
        }
    }

    /// Sequences whose acknowledgements were written on `dst` at
    /// `dst_height` and not yet processed by `src` at `src_height`.
    ///
    /// `relayed` is the monotone cache of acks this caller already
    /// submitted; cached sequences older than [`ACK_GAP_FOR_FULL_SCAN`]
    /// blocks of the cache tip are skipped without re-querying.
    pub fn unrelayed_ack_sequences(
        &self,
        cancel: &CancelToken,
        src_height: Height,
        dst_height: Height,
        relayed: &[Sequence],
    ) -> Result<Vec<Sequence>, LinkError> {
        let acks = self
            .dst
            .handle()
            .query_packet_acknowledgements(
                cancel,
                dst_height,
                &self.dst_port_id,
                &self.dst_channel_id,
            )
            .map_err(LinkError::relayer)?;

        if acks.is_empty() {
            return Ok(vec![]);
        }

        let candidates = prune_relayed(acks, relayed);

        let mut unreceived = Vec::new();
        for chunk in candidates.chunks(ACK_CHUNK_SIZE) {
            let confirmed = self
                .src
                .handle()
                .query_unreceived_acknowledgements(
                    cancel,
                    src_height,
                    &self.src_port_id,
                    &self.src_channel_id,
                    chunk,
                )
                .map_err(LinkError::relayer)?;

            // A provider answering with sequences outside the queried set
            // has inconsistent state; relaying on it would be garbage.
            assert!(
                confirmed.iter().all(|seq| chunk.contains(seq)),
                "unreceived acknowledgements {:?} are not a subset of the queried chunk on chain {}",
                confirmed,
                self.src.id(),
            );

            unreceived.extend(confirmed);
        }

        unreceived.sort_unstable();

        match self.ordering {
            Ordering::Unordered => Ok(unreceived),
            Ordering::Ordered => {
                let run = contiguous_prefix(&unreceived);
                Ok(run)
            }
        }
    }

    /// Submit receive messages for `sequences` to `dst`, behind a client
    /// update targeting `src_height`.
    pub fn relay_packet_messages(
        &self,
        cancel: &CancelToken,
        src_height: Height,
        sequences: &[Sequence],
    ) -> Result<(), LinkError> {
        if sequences.is_empty() {
            return Ok(());
        }

        let update = self
            .src
            .handle()
            .build_update_client(cancel, self.dst.client_id(), src_height)
            .map_err(LinkError::relayer)?;

        let mut msgs = Vec::with_capacity(sequences.len());
        for seq in sequences {
            let msg = self
                .src
                .handle()
                .build_recv_packet(cancel, &self.packet(*seq), src_height)
                .map_err(LinkError::relayer)?;
            msgs.push((*seq, msg));
        }

        self.submit_batched(cancel, &self.dst, update, msgs)
    }

    /// Submit acknowledgement messages for `sequences` to `src`, behind a
    /// client update targeting `dst_height` (the acks are proven on
    /// `dst`).
    pub fn relay_ack_messages(
        &self,
        cancel: &CancelToken,
        dst_height: Height,
        sequences: &[Sequence],
    ) -> Result<(), LinkError> {
        if sequences.is_empty() {
            return Ok(());
        }

        let update = self
            .dst
            .handle()
            .build_update_client(cancel, self.src.client_id(), dst_height)
            .map_err(LinkError::relayer)?;

        let mut msgs = Vec::with_capacity(sequences.len());
        for seq in sequences {
            let msg = self
                .dst
                .handle()
                .build_acknowledgement(cancel, &self.packet(*seq), dst_height)
                .map_err(LinkError::relayer)?;
            msgs.push((*seq, msg));
        }

        self.submit_batched(cancel, &self.src, update, msgs)
    }

    fn submit_batched(
        &self,
        cancel: &CancelToken,
        receiver: &Chain,
        update: RelayMessage,
        msgs: Vec<(Sequence, RelayMessage)>,
    ) -> Result<(), LinkError> {
        let txs = batch_messages(
            update,
            msgs,
            self.params.max_msgs_per_tx,
            self.params.max_tx_size,
        )?;

        debug!(
            chain_id = %receiver.id(),
            tx_count = txs.len(),
            "submitting batched transactions"
        );

        for tx in txs {
            if cancel.is_cancelled() {
                return Err(LinkError::relayer(Error::cancelled()));
            }

            let response = receiver
                .handle()
                .send_messages(cancel, tx, self.params.memo.as_str())
                .map_err(LinkError::relayer)?;

            if !response.is_ok() {
                return Err(LinkError::submit_failed(
                    receiver.id(),
                    response.code,
                    response.log,
                ));
            }

            info!(
                chain_id = %receiver.id(),
                tx_hash = %response.hash,
                "transaction submitted"
            );
        }

        Ok(())
    }
}

/// Drop candidates that the cache says were already submitted, except
/// within [`ACK_GAP_FOR_FULL_SCAN`] of the cache tip, where the chain is
/// asked again in case an earlier submission never landed.
fn prune_relayed(mut candidates: Vec<Sequence>, relayed: &[Sequence]) -> Vec<Sequence> {
    candidates.sort_unstable();

    let Some(tip) = relayed.last().copied() else {
        return candidates;
    };

    candidates.retain(|seq| !relayed.contains(seq) || tip.gap(*seq) < ACK_GAP_FOR_FULL_SCAN);
    candidates
}

/// The longest run `s, s+1, s+2, ...` starting at the first element.
fn contiguous_prefix(sequences: &[Sequence]) -> Vec<Sequence> {
    let Some(first) = sequences.first().copied() else {
        return vec![];
    };

    let mut expected = first;
    sequences
        .iter()
        .copied()
        .take_while(|seq| {
            let matches = *seq == expected;
            expected = expected.increment();
            matches
        })
        .collect()
}

/// Pack `msgs` into transactions of at most `max_msgs_per_tx` payload
/// messages and `max_tx_size` bytes each, every transaction prefixed with
/// a copy of the client update.
pub(crate) fn batch_messages(
    update: RelayMessage,
    msgs: Vec<(Sequence, RelayMessage)>,
    max_msgs_per_tx: TxMsgLimit,
    max_tx_size: TxSizeLimit,
) -> Result<Vec<Vec<RelayMessage>>, LinkError> {
    let max_size = max_tx_size.value();
    let max_msgs = max_msgs_per_tx.value();
    let update_size = update.encoded_len();

    if update_size > max_size {
        return Err(LinkError::update_client_too_large(update_size, max_size));
    }

    let mut txs = Vec::new();
    let mut current: Vec<RelayMessage> = vec![update.clone()];
    let mut current_size = update_size;

    for (sequence, msg) in msgs {
        let msg_size = msg.encoded_len();
        if update_size + msg_size > max_size {
            return Err(LinkError::message_too_large(sequence, msg_size, max_size));
        }

        let payload_count = current.len() - 1;
        if payload_count == max_msgs || current_size + msg_size > max_size {
            txs.push(std::mem::replace(&mut current, vec![update.clone()]));
            current_size = update_size;
        }

        current.push(msg);
        current_size += msg_size;
    }

    if current.len() > 1 {
        txs.push(current);
    }

    Ok(txs)
}

/// Render a sequence list for log fields.
pub fn display_sequences(sequences: &[Sequence]) -> String {
    sequences.iter().map(|s| s.to_string()).join(", ")
}
