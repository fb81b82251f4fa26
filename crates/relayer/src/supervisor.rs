//! The supervisor entry point and the per-channel polling engine.
//!
//! [`start_relayer`] selects the engine, runs it on a background thread
//! and hands back a single-element failure channel: it stays silent while
//! the relayer runs, delivers one terminal error on failure, and closes
//! without a message on clean termination.
//!
//! The polling engine discovers the channels of the connection once,
//! spawns one [`worker`](crate::worker) per OPEN channel, and supervises
//! the workers: whenever one exits, the channel state is re-queried and
//! the channel either gets a fresh worker or is retired.

use std::collections::BTreeMap;
use std::thread;

use crossbeam_channel::{bounded, select, Receiver};
use tracing::{error_span, info, warn};

use conduit_relayer_types::identifier::ChannelId;

use crate::chain::Chain;
use crate::config::{ChannelFilter, ProcessorType};
use crate::link::{Link, LinkParameters};
use crate::processor::chain::ChainProcessor;
use crate::processor::path::PathProcessor;
use crate::processor::{ChannelKey, EventProcessor, PathEnd};
use crate::supervisor::scan::ActiveChannel;
use crate::util::cancel::CancelToken;
use crate::util::retry::{retry_with_index, RetryResult};
use crate::worker::{retry_strategy, spawn_channel_worker};

pub mod error;
pub mod scan;

pub use error::Error;

/// Start the relayer over one path and return its failure channel.
///
/// The channel delivers at most one error: the first terminal condition
/// of the selected engine, cancellation included. It closes without a
/// message if the engine terminates cleanly.
pub fn start_relayer(
    cancel: CancelToken,
    src: Chain,
    dst: Chain,
    filter: ChannelFilter,
    params: LinkParameters,
    processor: ProcessorType,
    initial_block_history: u64,
) -> Receiver<Error> {
    let (error_tx, error_rx) = bounded(1);

    thread::spawn(move || {
        let result = match processor {
            ProcessorType::Events => {
                run_event_processor(cancel, src, dst, filter, params, initial_block_history)
            }
            ProcessorType::Legacy => relayer_main_loop(cancel, src, dst, filter, params),
        };

        if let Err(e) = result {
            let _ = error_tx.send(e);
        }
    });

    error_rx
}

/// Run the event-driven engine: one chain processor per endpoint feeding
/// one path processor per relay path.
fn run_event_processor(
    cancel: CancelToken,
    src: Chain,
    dst: Chain,
    filter: ChannelFilter,
    params: LinkParameters,
    initial_block_history: u64,
) -> Result<(), Error> {
    // The same filter list seen from both ends: on the source the rule
    // names the channel id, on the destination its counterparty id.
    let mut rules_src = Vec::new();
    let mut rules_dst = Vec::new();
    for channel_id in &filter.channel_list {
        rules_src.push(ChannelKey {
            channel_id: channel_id.clone(),
            ..ChannelKey::default()
        });
        rules_dst.push(ChannelKey {
            counterparty_channel_id: channel_id.clone(),
            ..ChannelKey::default()
        });
    }

    let path_end_src = PathEnd::new(src.id(), src.client_id().clone(), filter.rule, rules_src);
    let path_end_dst = PathEnd::new(dst.id(), dst.client_id().clone(), filter.rule, rules_dst);

    let event_processor = EventProcessor::builder()
        .with_chain_processors(vec![
            ChainProcessor::new(src.clone()),
            ChainProcessor::new(dst.clone()),
        ])
        .with_path_processors(vec![PathProcessor::new(
            src,
            dst,
            path_end_src,
            path_end_dst,
            params,
        )])
        .with_initial_block_history(initial_block_history)
        .build();

    event_processor.run(cancel).map_err(Error::processor)
}

/// The main loop of the polling engine.
fn relayer_main_loop(
    cancel: CancelToken,
    src: Chain,
    dst: Chain,
    filter: ChannelFilter,
    params: LinkParameters,
) -> Result<(), Error> {
    let span = error_span!("supervisor", src_chain = %src.id(), dst_chain = %dst.id());
    let _entered = span.enter();

    let channels = scan::channels_on_connection(&cancel, &src).map_err(|e| {
        if e.is_cancelled() {
            Error::cancelled()
        } else {
            Error::channel_scan(src.id(), src.connection_id().clone(), e)
        }
    })?;

    // Apply the filter rule, then narrow to the channels in OPEN state.
    let channels = filter.apply(channels);
    let mut open_channels = scan::filter_open_channels(channels);

    // Sized to the initial channel count so worker completion sends never
    // block; channels are not added mid-run.
    let (completion_tx, completion_rx) = bounded(open_channels.len().max(1));
    let mut worker_handles = Vec::new();

    loop {
        if open_channels.is_empty() {
            // A wait-for-channels idle state would go here, once channels
            // can appear mid-run.
            return Err(Error::no_open_channels());
        }

        spawn_idle_workers(
            &cancel,
            &src,
            &dst,
            &params,
            &mut open_channels,
            &completion_tx,
            &mut worker_handles,
        );

        // Block until a worker exits, or shut down on cancellation while
        // waiting.
        let exited: ChannelId = select! {
            recv(completion_rx) -> msg => match msg {
                Ok(channel_id) => channel_id,
                Err(_) => return Err(Error::completion_queue_closed()),
            },
            recv(cancel.receiver()) -> _ => {
                for handle in worker_handles.drain(..) {
                    let _ = handle.join();
                }
                return Err(Error::cancelled());
            }
        };

        let Some(entry) = open_channels.get_mut(&exited) else {
            continue;
        };
        entry.active = false;
        let port_id = entry.channel.port_id.clone();

        // A worker exit usually means the channel changed underneath it;
        // re-query the state before considering a respawn.
        let requery = retry_with_index(retry_strategy::worker_default_strategy(), |attempt| {
            if cancel.is_cancelled() {
                return RetryResult::Err(crate::error::Error::cancelled());
            }

            match src.handle().query_channel(&cancel, None, &port_id, &exited) {
                Ok(channel_end) => RetryResult::Ok(channel_end),
                Err(e) if e.is_transient() => {
                    info!(
                        src_channel_id = %exited,
                        attempt,
                        "failed to query channel for updated state: {}", e
                    );
                    RetryResult::Retry(e)
                }
                Err(e) => RetryResult::Err(e),
            }
        });

        let channel_end = match requery {
            Ok(channel_end) => channel_end,
            Err(e) if e.error.is_cancelled() => return Err(Error::cancelled()),
            Err(e) => return Err(Error::channel_requery(exited, e.error)),
        };

        if !channel_end.is_open() {
            open_channels.remove(&exited);
            info!(
                chain_id = %src.id(),
                channel_id = %exited,
                channel_state = %channel_end.state,
                "channel is no longer in open state"
            );
        }
    }
}

/// Spawn a worker for every channel that has none. Channels whose link
/// cannot be built (the handshake never completed) are retired instead.
fn spawn_idle_workers(
    cancel: &CancelToken,
    src: &Chain,
    dst: &Chain,
    params: &LinkParameters,
    open_channels: &mut BTreeMap<ChannelId, ActiveChannel>,
    completion_tx: &crossbeam_channel::Sender<ChannelId>,
    worker_handles: &mut Vec<thread::JoinHandle<()>>,
) {
    let idle: Vec<ChannelId> = open_channels
        .iter()
        .filter(|(_, entry)| !entry.active)
        .map(|(id, _)| id.clone())
        .collect();

    for channel_id in idle {
        let Some(entry) = open_channels.get_mut(&channel_id) else {
            continue;
        };

        match Link::new(src.clone(), dst.clone(), &entry.channel, params.clone()) {
            Ok(link) => {
                entry.active = true;
                worker_handles.push(spawn_channel_worker(
                    cancel.clone(),
                    link,
                    completion_tx.clone(),
                ));
            }
            Err(e) => {
                warn!(
                    channel_id = %channel_id,
                    "cannot relay on channel, retiring it: {}", e
                );
                open_channels.remove(&channel_id);
            }
        }
    }
}
