//! Per-path reconciliation for the event-driven engine.
//!
//! A path processor consumes the snapshot streams of its two chain
//! processors. Whenever either side publishes a new snapshot it diffs the
//! packet commitments of one side against the receive evidence of the
//! other, assembles the missing receive and acknowledgement messages
//! behind a client update, and submits them through the receiving chain's
//! handle. In-flight tokens keep a resubmission from racing its own
//! acknowledgement window.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::{select, Receiver};
use tracing::{debug, error_span, info, warn};

use conduit_relayer_types::channel::Ordering;
use conduit_relayer_types::events::Packet;
use conduit_relayer_types::identifier::ChainId;
use conduit_relayer_types::message::RelayMessage;
use conduit_relayer_types::{Height, Sequence};

use crate::chain::Chain;
use crate::link::{batch_messages, LinkParameters};
use crate::processor::chain::ChainSnapshot;
use crate::processor::error::Error;
use crate::processor::{ChannelKey, PathEnd};
use crate::util::cancel::CancelToken;

/// How many source-side blocks a submission is considered in flight. Until
/// the window elapses (or the acknowledgement shows up) the same message
/// is not submitted again.
pub const IN_FLIGHT_WINDOW: u64 = 10;

/// Which chain a submission lands on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Direction {
    /// Messages proven on A, submitted to B.
    AToB,
    /// Messages proven on B, submitted to A.
    BToA,
}

#[derive(Clone, Debug)]
struct InFlight {
    submitted_at: Height,
    tx_hash: String,
}

/// Reconciles one relay path from the snapshots of its two ends.
pub struct PathProcessor {
    chain_a: Chain,
    chain_b: Chain,
    path_end_a: PathEnd,
    path_end_b: PathEnd,
    params: LinkParameters,
    source_a: Option<Receiver<Arc<ChainSnapshot>>>,
    source_b: Option<Receiver<Arc<ChainSnapshot>>>,
    snapshot_a: Option<Arc<ChainSnapshot>>,
    snapshot_b: Option<Arc<ChainSnapshot>>,
    in_flight: BTreeMap<(ChannelKey, Sequence, Direction), InFlight>,
}

impl PathProcessor {
    pub fn new(
        chain_a: Chain,
        chain_b: Chain,
        path_end_a: PathEnd,
        path_end_b: PathEnd,
        params: LinkParameters,
    ) -> Self {
        Self {
            chain_a,
            chain_b,
            path_end_a,
            path_end_b,
            params,
            source_a: None,
            source_b: None,
            snapshot_a: None,
            snapshot_b: None,
            in_flight: BTreeMap::new(),
        }
    }

    pub fn uses_chain(&self, chain_id: &ChainId) -> bool {
        self.path_end_a.chain_id == *chain_id || self.path_end_b.chain_id == *chain_id
    }

    pub(crate) fn set_snapshot_source(
        &mut self,
        chain_id: &ChainId,
        source: Receiver<Arc<ChainSnapshot>>,
    ) -> Result<(), Error> {
        if self.path_end_a.chain_id == *chain_id {
            self.source_a = Some(source);
            Ok(())
        } else if self.path_end_b.chain_id == *chain_id {
            self.source_b = Some(source);
            Ok(())
        } else {
            Err(Error::not_wired(chain_id.clone()))
        }
    }

    /// Consume snapshots until cancellation or until both chain
    /// processors have gone away.
    pub(crate) fn run(mut self, cancel: CancelToken) -> Result<(), Error> {
        let span = error_span!(
            "processor.path",
            chain_a = %self.path_end_a.chain_id,
            chain_b = %self.path_end_b.chain_id,
        );
        let _entered = span.enter();

        let source_a = self
            .source_a
            .take()
            .ok_or_else(|| Error::not_wired(self.path_end_a.chain_id.clone()))?;
        let source_b = self
            .source_b
            .take()
            .ok_or_else(|| Error::not_wired(self.path_end_b.chain_id.clone()))?;

        loop {
            select! {
                recv(source_a) -> snapshot => match snapshot {
                    Ok(snapshot) => {
                        self.snapshot_a = Some(snapshot);
                        self.reconcile(&cancel);
                    }
                    Err(_) => {
                        debug!("snapshot stream of {} ended", self.path_end_a.chain_id);
                        return Ok(());
                    }
                },
                recv(source_b) -> snapshot => match snapshot {
                    Ok(snapshot) => {
                        self.snapshot_b = Some(snapshot);
                        self.reconcile(&cancel);
                    }
                    Err(_) => {
                        debug!("snapshot stream of {} ended", self.path_end_b.chain_id);
                        return Ok(());
                    }
                },
                recv(cancel.receiver()) -> _ => return Ok(()),
            }
        }
    }

    fn reconcile(&mut self, cancel: &CancelToken) {
        let (Some(snap_a), Some(snap_b)) = (self.snapshot_a.clone(), self.snapshot_b.clone())
        else {
            return;
        };

        self.expire_tokens(&snap_a, &snap_b);

        self.relay_pending_packets(cancel, Direction::AToB, &snap_a, &snap_b);
        self.relay_pending_packets(cancel, Direction::BToA, &snap_b, &snap_a);

        // Acknowledgements travel against the packet direction.
        self.relay_written_acks(cancel, Direction::BToA, &snap_b, &snap_a);
        self.relay_written_acks(cancel, Direction::AToB, &snap_a, &snap_b);
    }

    /// Drop in-flight tokens whose window has elapsed without the
    /// acknowledgement showing up, so the message becomes eligible again.
    fn expire_tokens(&mut self, snap_a: &ChainSnapshot, snap_b: &ChainSnapshot) {
        self.in_flight.retain(|(_, sequence, direction), token| {
            let proof_side_height = match direction {
                Direction::AToB => snap_a.height,
                Direction::BToA => snap_b.height,
            };

            let live = match proof_side_height {
                Some(height) => height.value() < token.submitted_at.value() + IN_FLIGHT_WINDOW,
                None => true,
            };

            if !live {
                debug!(
                    sequence = %sequence,
                    tx_hash = %token.tx_hash,
                    "in-flight window elapsed without acknowledgement, releasing token"
                );
            }

            live
        });
    }

    /// Relay the packets pending on `src_snap` toward the chain
    /// `direction` points at.
    fn relay_pending_packets(
        &mut self,
        cancel: &CancelToken,
        direction: Direction,
        src_snap: &ChainSnapshot,
        dst_snap: &ChainSnapshot,
    ) {
        let (src_chain, dst_chain, src_end) = match direction {
            Direction::AToB => (&self.chain_a, &self.chain_b, &self.path_end_a),
            Direction::BToA => (&self.chain_b, &self.chain_a, &self.path_end_b),
        };
        let (src_chain, dst_chain) = (src_chain.clone(), dst_chain.clone());

        let Some(proof_height) = src_snap.height else {
            return;
        };

        let mut submissions: Vec<(ChannelKey, Vec<(Sequence, Packet)>)> = Vec::new();

        for (key, pending) in &src_snap.pending_packets {
            if pending.is_empty() || !src_end.allows_channel(key) {
                continue;
            }

            if matches!(src_snap.channels.get(key), Some(state) if !state.is_open()) {
                continue;
            }

            let counterpart = key.counterparty();
            let received = dst_snap.received.get(&counterpart);

            let mut candidates: Vec<(Sequence, Packet)> = pending
                .iter()
                .filter(|(seq, _)| received.map_or(true, |done| !done.contains(*seq)))
                .filter(|(seq, _)| {
                    !self
                        .in_flight
                        .contains_key(&(key.clone(), **seq, direction))
                })
                .map(|(seq, packet)| (*seq, packet.clone()))
                .collect();

            if candidates.is_empty() {
                continue;
            }

            if src_snap.orderings.get(key).copied().unwrap_or_default() == Ordering::Ordered {
                candidates = contiguous_packet_prefix(candidates);
            }

            submissions.push((key.clone(), candidates));
        }

        for (key, candidates) in submissions {
            let build = |(seq, packet): &(Sequence, Packet)| {
                src_chain
                    .handle()
                    .build_recv_packet(cancel, packet, proof_height)
                    .map(|msg| (*seq, msg))
            };

            self.submit(
                cancel,
                direction,
                &key,
                &src_chain,
                &dst_chain,
                proof_height,
                &candidates,
                build,
            );
        }
    }

    /// Relay the acknowledgements written on `ack_snap` back to the
    /// packets' origin, the chain `direction` points at.
    fn relay_written_acks(
        &mut self,
        cancel: &CancelToken,
        direction: Direction,
        ack_snap: &ChainSnapshot,
        origin_snap: &ChainSnapshot,
    ) {
        let (ack_chain, origin_chain, ack_end) = match direction {
            Direction::BToA => (&self.chain_b, &self.chain_a, &self.path_end_b),
            Direction::AToB => (&self.chain_a, &self.chain_b, &self.path_end_a),
        };
        let (ack_chain, origin_chain) = (ack_chain.clone(), origin_chain.clone());

        let Some(proof_height) = ack_snap.height else {
            return;
        };

        let mut submissions: Vec<(ChannelKey, Vec<(Sequence, Packet)>)> = Vec::new();

        for (key, acks) in &ack_snap.written_acks {
            if acks.is_empty() || !ack_end.allows_channel(key) {
                continue;
            }

            let origin_key = key.counterparty();
            let Some(origin_pending) = origin_snap.pending_packets.get(&origin_key) else {
                continue;
            };

            let mut candidates: Vec<(Sequence, Packet)> = acks
                .iter()
                .filter(|(seq, _)| origin_pending.contains_key(*seq))
                .filter(|(seq, _)| {
                    !self
                        .in_flight
                        .contains_key(&(key.clone(), **seq, direction))
                })
                .map(|(seq, packet)| (*seq, packet.clone()))
                .collect();

            if candidates.is_empty() {
                continue;
            }

            if ack_snap.orderings.get(key).copied().unwrap_or_default() == Ordering::Ordered {
                candidates = contiguous_packet_prefix(candidates);
            }

            submissions.push((key.clone(), candidates));
        }

        for (key, candidates) in submissions {
            let build = |(seq, packet): &(Sequence, Packet)| {
                ack_chain
                    .handle()
                    .build_acknowledgement(cancel, packet, proof_height)
                    .map(|msg| (*seq, msg))
            };

            self.submit(
                cancel,
                direction,
                &key,
                &ack_chain,
                &origin_chain,
                proof_height,
                &candidates,
                build,
            );
        }
    }

    /// Build, batch and submit the messages for one channel, recording
    /// in-flight tokens on success. Application failures are logged and
    /// retried on a later snapshot.
    fn submit(
        &mut self,
        cancel: &CancelToken,
        direction: Direction,
        key: &ChannelKey,
        proving_chain: &Chain,
        receiving_chain: &Chain,
        proof_height: Height,
        candidates: &[(Sequence, Packet)],
        build: impl Fn(&(Sequence, Packet)) -> Result<(Sequence, RelayMessage), crate::error::Error>,
    ) {
        if cancel.is_cancelled() {
            return;
        }

        let update = match proving_chain.handle().build_update_client(
            cancel,
            receiving_chain.client_id(),
            proof_height,
        ) {
            Ok(update) => update,
            Err(e) => {
                warn!("failed to build client update: {}", e);
                return;
            }
        };

        let mut msgs = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match build(candidate) {
                Ok(msg) => msgs.push(msg),
                Err(e) => {
                    warn!(sequence = %candidate.0, "failed to build message: {}", e);
                    return;
                }
            }
        }

        let txs = match batch_messages(
            update,
            msgs,
            self.params.max_msgs_per_tx,
            self.params.max_tx_size,
        ) {
            Ok(txs) => txs,
            Err(e) => {
                warn!("cannot batch messages: {}", e);
                return;
            }
        };

        let mut last_hash = String::new();
        for tx in txs {
            if cancel.is_cancelled() {
                return;
            }

            match receiving_chain
                .handle()
                .send_messages(cancel, tx, self.params.memo.as_str())
            {
                Ok(response) if response.is_ok() => {
                    info!(
                        chain_id = %receiving_chain.id(),
                        tx_hash = %response.hash,
                        "transaction submitted"
                    );
                    last_hash = response.hash;
                }
                Ok(response) => {
                    warn!(
                        chain_id = %receiving_chain.id(),
                        code = response.code,
                        "transaction rejected: {}", response.log
                    );
                    return;
                }
                Err(e) => {
                    warn!(chain_id = %receiving_chain.id(), "submission failed: {}", e);
                    return;
                }
            }
        }

        for (seq, _) in candidates {
            self.in_flight.insert(
                (key.clone(), *seq, direction),
                InFlight {
                    submitted_at: proof_height,
                    tx_hash: last_hash.clone(),
                },
            );
        }
    }
}

/// The longest run of consecutive sequences from the first candidate.
fn contiguous_packet_prefix(candidates: Vec<(Sequence, Packet)>) -> Vec<(Sequence, Packet)> {
    let Some(first) = candidates.first().map(|(seq, _)| *seq) else {
        return candidates;
    };

    let mut expected = first;
    candidates
        .into_iter()
        .take_while(|(seq, _)| {
            let matches = *seq == expected;
            expected = expected.increment();
            matches
        })
        .collect()
}
