//! The per-channel reconciliation worker of the polling engine.
//!
//! One worker drives one channel: a packet pass over both directions,
//! then an acknowledgement pass with the two directions running
//! concurrently, then a one second pause. The worker owns two relayed-ack
//! caches (one per direction) that only ever grow, so acknowledgements it
//! already submitted are not rebuilt on every cycle.
//!
//! Exits, panics included, are reported to the supervisor through the
//! completion queue; application-level relay failures are logged and the
//! loop continues.

use core::time::Duration;
use std::thread;

use crossbeam_channel::Sender;
use tracing::{debug, error_span, info, warn};

use conduit_relayer_types::identifier::ChannelId;
use conduit_relayer_types::{Height, Sequence};

use crate::chain::query_latest_heights;
use crate::link::{display_sequences, Link, RelayPath};
use crate::util::cancel::CancelToken;

pub mod retry_strategy;

/// The pause between two reconciliation cycles of a worker.
pub const RELAY_INTERVAL: Duration = Duration::from_secs(1);

/// Sends the worker's channel id on the completion queue when dropped, so
/// the supervisor learns about the exit whether the worker returned or
/// panicked.
struct CompletionGuard {
    channel_id: ChannelId,
    completion_tx: Sender<ChannelId>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let _ = self.completion_tx.try_send(self.channel_id.clone());
    }
}

/// Spawn the reconciliation loop for one channel. The returned handle is
/// joined by the supervisor when it drains on shutdown.
pub fn spawn_channel_worker(
    cancel: CancelToken,
    link: Link,
    completion_tx: Sender<ChannelId>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let _guard = CompletionGuard {
            channel_id: link.a_to_b.src_channel_id().clone(),
            completion_tx,
        };

        run(&cancel, &link);
    })
}

fn run(cancel: &CancelToken, link: &Link) {
    let path = &link.a_to_b;
    let span = error_span!(
        "worker.channel",
        src_chain = %path.src_chain().id(),
        src_channel = %path.src_channel_id(),
        dst_chain = %path.dst_chain().id(),
    );
    let _entered = span.enter();

    let mut relayed_acks_to_src: Vec<Sequence> = Vec::new();
    let mut relayed_acks_to_dst: Vec<Sequence> = Vec::new();

    info!(
        src_chain_id = %path.src_chain().id(),
        src_channel_id = %path.src_channel_id(),
        src_port_id = %path.src_port_id(),
        dst_chain_id = %path.dst_chain().id(),
        dst_channel_id = %path.dst_channel_id(),
        dst_port_id = %path.dst_port_id(),
        "restart relaying"
    );

    loop {
        if !relay_unrelayed_packets(cancel, link) {
            return;
        }

        if !relay_unrelayed_acks(
            cancel,
            link,
            &mut relayed_acks_to_src,
            &mut relayed_acks_to_dst,
        ) {
            return;
        }

        if cancel.sleep(RELAY_INTERVAL) {
            return;
        }
    }
}

/// One packet pass over both directions. Returns `true` when the worker
/// should keep cycling; `false` exits the worker and lets the supervisor
/// re-check the channel.
fn relay_unrelayed_packets(cancel: &CancelToken, link: &Link) -> bool {
    let path = &link.a_to_b;

    let (src_height, dst_height) =
        match query_latest_heights(cancel, path.src_chain(), path.dst_chain()) {
            Ok(heights) => heights,
            Err(e) => {
                warn!("failed to query latest heights: {}", e);
                return false;
            }
        };

    let (src_query, dst_query) = match proof_heights(src_height, dst_height) {
        Some(heights) => heights,
        None => {
            warn!("a chain reports no committed blocks yet, skipping cycle");
            return false;
        }
    };

    let set = match link.unrelayed_packets(cancel, src_query, dst_query) {
        Ok(set) => set,
        Err(e) => {
            warn!("failed to compute unrelayed packets: {}", e);
            return false;
        }
    };

    if set.is_empty() {
        debug!(
            src_chain_id = %path.src_chain().id(),
            src_channel_id = %path.src_channel_id(),
            dst_chain_id = %path.dst_chain().id(),
            dst_channel_id = %path.dst_channel_id(),
            "no packets in queue"
        );
        return true;
    }

    if !set.src.is_empty() {
        info!(
            src_chain_id = %path.src_chain().id(),
            src_channel_id = %path.src_channel_id(),
            seqs = %display_sequences(&set.src),
            "unrelayed source packets"
        );
    }

    if !set.dst.is_empty() {
        info!(
            dst_chain_id = %path.dst_chain().id(),
            dst_channel_id = %path.dst_channel_id(),
            seqs = %display_sequences(&set.dst),
            "unrelayed destination packets"
        );
    }

    if let Err(e) = link.relay_packets(cancel, src_height, dst_height, &set) {
        if e.is_cancelled() {
            warn!("shutdown while waiting for packet relay to complete");
            return false;
        }

        if e.is_tx_indexing_disabled() {
            warn!("remote server needs to enable transaction indexing: {}", e);
            return false;
        }

        // Not a shutdown, an application-level error; keep going.
        warn!("relay packets error: {}", e);
        return true;
    }

    true
}

/// One acknowledgement pass, both directions concurrently. Each direction
/// gets exclusive use of its own relayed-ack cache for the duration of the
/// pass.
fn relay_unrelayed_acks(
    cancel: &CancelToken,
    link: &Link,
    relayed_to_src: &mut Vec<Sequence>,
    relayed_to_dst: &mut Vec<Sequence>,
) -> bool {
    let path = &link.a_to_b;

    let (src_height, dst_height) =
        match query_latest_heights(cancel, path.src_chain(), path.dst_chain()) {
            Ok(heights) => heights,
            Err(e) => {
                warn!("failed to query latest heights: {}", e);
                return false;
            }
        };

    let (ok_to_src, ok_to_dst) = thread::scope(|s| {
        let to_src = s.spawn(|| {
            relay_acks_direction(cancel, &link.a_to_b, src_height, dst_height, relayed_to_src)
        });
        let to_dst = s.spawn(|| {
            relay_acks_direction(cancel, &link.b_to_a, dst_height, src_height, relayed_to_dst)
        });
        (
            to_src.join().unwrap_or(false),
            to_dst.join().unwrap_or(false),
        )
    });

    ok_to_src && ok_to_dst
}

/// Scan and relay the acknowledgements of one direction. `src_height` and
/// `dst_height` are relative to `path`: acks are written on the path's
/// destination and relayed back to its source.
fn relay_acks_direction(
    cancel: &CancelToken,
    path: &RelayPath,
    src_height: Height,
    dst_height: Height,
    relayed: &mut Vec<Sequence>,
) -> bool {
    let Some((src_query, dst_query)) = proof_heights(src_height, dst_height) else {
        warn!("a chain reports no committed blocks yet, skipping ack pass");
        return false;
    };

    let sequences = match path.unrelayed_ack_sequences(cancel, src_query, dst_query, relayed) {
        Ok(sequences) => sequences,
        Err(e) => {
            warn!(
                src_chain_id = %path.src_chain().id(),
                src_channel_id = %path.src_channel_id(),
                dst_chain_id = %path.dst_chain().id(),
                dst_channel_id = %path.dst_channel_id(),
                "acknowledgement scan failed: {}", e
            );
            return false;
        }
    };

    if sequences.is_empty() {
        debug!(
            src_chain_id = %path.src_chain().id(),
            src_channel_id = %path.src_channel_id(),
            src_port_id = %path.src_port_id(),
            dst_chain_id = %path.dst_chain().id(),
            dst_channel_id = %path.dst_channel_id(),
            dst_port_id = %path.dst_port_id(),
            "no acknowledgements in queue"
        );
        return true;
    }

    if let Err(e) = path.relay_ack_messages(cancel, dst_height, &sequences) {
        if e.is_cancelled() {
            warn!(
                src_chain_id = %path.src_chain().id(),
                src_channel_id = %path.src_channel_id(),
                dst_chain_id = %path.dst_chain().id(),
                dst_channel_id = %path.dst_channel_id(),
                "shutdown while waiting for acknowledgement relay to complete"
            );
            return false;
        }

        // Best-effort: the next cycle rescans, with the cache untouched so
        // nothing is skipped.
        warn!(
            src_chain_id = %path.src_chain().id(),
            src_channel_id = %path.src_channel_id(),
            dst_chain_id = %path.dst_chain().id(),
            dst_channel_id = %path.dst_channel_id(),
            "relay acknowledgements error: {}", e
        );
        return true;
    }

    record_relayed(relayed, sequences);
    true
}

/// Extend the monotone relayed-ack cache; sequences are never removed.
fn record_relayed(relayed: &mut Vec<Sequence>, sequences: Vec<Sequence>) {
    for seq in sequences {
        if !relayed.contains(&seq) {
            relayed.push(seq);
        }
    }
    relayed.sort_unstable();
}

/// Proofs for the state at height `h` are only committed in block `h + 1`,
/// so reconciliation queries run one block behind the latest heights.
fn proof_heights(src_height: Height, dst_height: Height) -> Option<(Height, Height)> {
    match (src_height.decrement(), dst_height.decrement()) {
        (Ok(src), Ok(dst)) => Some((src, dst)),
        _ => None,
    }
}
