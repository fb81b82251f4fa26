//! The event-driven relay engine.
//!
//! One [`ChainProcessor`](chain::ChainProcessor) per endpoint tails block
//! events and maintains per-chain caches; one
//! [`PathProcessor`](path::PathProcessor) per relay path reconciles the
//! snapshots of its two ends and submits whatever is missing. The
//! [`EventProcessor`] wires them together and runs them to completion.

use std::thread;

use crossbeam_channel::{select, unbounded};
use serde_derive::{Deserialize, Serialize};

use conduit_relayer_types::events::{ChannelAttributes, Packet};
use conduit_relayer_types::identifier::{ChannelId, PortId};

use crate::processor::chain::ChainProcessor;
use crate::processor::path::PathProcessor;
use crate::util::cancel::{cancel_pair, CancelToken};

pub mod chain;
pub mod error;
pub mod path;

mod path_end;

pub use error::Error;
pub use path_end::PathEnd;

/// Uniquely identifies one channel as seen from one side. The primary key
/// of every processor cache.
///
/// An empty component in a filter rule acts as a wildcard.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub channel_id: ChannelId,
    pub port_id: PortId,
    pub counterparty_channel_id: ChannelId,
    pub counterparty_port_id: PortId,
}

impl ChannelKey {
    /// The key of the sending side of a packet.
    pub fn from_packet_source(packet: &Packet) -> Self {
        Self {
            channel_id: packet.source_channel.clone(),
            port_id: packet.source_port.clone(),
            counterparty_channel_id: packet.destination_channel.clone(),
            counterparty_port_id: packet.destination_port.clone(),
        }
    }

    /// The key of the receiving side of a packet.
    pub fn from_packet_destination(packet: &Packet) -> Self {
        Self::from_packet_source(packet).counterparty()
    }

    pub fn from_attributes(attrs: &ChannelAttributes) -> Self {
        Self {
            channel_id: attrs.channel_id.clone(),
            port_id: attrs.port_id.clone(),
            counterparty_channel_id: attrs.counterparty_channel_id.clone().unwrap_or_default(),
            counterparty_port_id: attrs.counterparty_port_id.clone(),
        }
    }

    /// The same channel, seen from the other side.
    pub fn counterparty(&self) -> Self {
        Self {
            channel_id: self.counterparty_channel_id.clone(),
            port_id: self.counterparty_port_id.clone(),
            counterparty_channel_id: self.channel_id.clone(),
            counterparty_port_id: self.port_id.clone(),
        }
    }
}

/// Assembles chain and path processors into one runnable unit.
#[derive(Default)]
pub struct EventProcessorBuilder {
    chain_processors: Vec<ChainProcessor>,
    path_processors: Vec<PathProcessor>,
    initial_block_history: u64,
}

impl EventProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain_processors(mut self, processors: Vec<ChainProcessor>) -> Self {
        self.chain_processors.extend(processors);
        self
    }

    pub fn with_path_processors(mut self, processors: Vec<PathProcessor>) -> Self {
        self.path_processors.extend(processors);
        self
    }

    /// How many blocks behind the latest height each chain processor
    /// starts streaming from.
    pub fn with_initial_block_history(mut self, initial_block_history: u64) -> Self {
        self.initial_block_history = initial_block_history;
        self
    }

    pub fn build(self) -> EventProcessor {
        EventProcessor {
            chain_processors: self.chain_processors,
            path_processors: self.path_processors,
            initial_block_history: self.initial_block_history,
        }
    }
}

/// The top of the event-driven engine.
pub struct EventProcessor {
    chain_processors: Vec<ChainProcessor>,
    path_processors: Vec<PathProcessor>,
    initial_block_history: u64,
}

impl EventProcessor {
    pub fn builder() -> EventProcessorBuilder {
        EventProcessorBuilder::new()
    }

    /// Run every processor to completion.
    ///
    /// Returns the first terminal error among the children. On root
    /// cancellation, all children are stopped and awaited before the
    /// cancellation is reported.
    pub fn run(mut self, cancel: CancelToken) -> Result<(), Error> {
        // Every path processor gets a snapshot stream from each of its two
        // chains.
        for path_processor in &mut self.path_processors {
            for chain_processor in &mut self.chain_processors {
                let chain_id = chain_processor.chain_id();
                if path_processor.uses_chain(&chain_id) {
                    let (tx, rx) = unbounded();
                    chain_processor.add_subscriber(tx);
                    path_processor.set_snapshot_source(&chain_id, rx)?;
                }
            }
        }

        // Children run under their own cancellation pair; the root token
        // is only watched here, so a root cancel stops the children and
        // still drains them before returning.
        let (child_cancel, child_token) = cancel_pair();
        let mut child_cancel = Some(child_cancel);

        let (result_tx, result_rx) = unbounded();
        let total = self.chain_processors.len() + self.path_processors.len();
        let mut handles = Vec::with_capacity(total);

        let initial_block_history = self.initial_block_history;
        for chain_processor in self.chain_processors {
            let token = child_token.clone();
            let tx = result_tx.clone();
            handles.push(thread::spawn(move || {
                let _ = tx.send(chain_processor.run(token, initial_block_history));
            }));
        }

        for path_processor in self.path_processors {
            let token = child_token.clone();
            let tx = result_tx.clone();
            handles.push(thread::spawn(move || {
                let _ = tx.send(path_processor.run(token));
            }));
        }
        drop(result_tx);

        let mut first_error: Option<Error> = None;
        let mut finished = 0;

        while finished < total {
            select! {
                recv(result_rx) -> msg => match msg {
                    Ok(result) => {
                        finished += 1;
                        if let Err(e) = result {
                            if first_error.is_none() {
                                first_error = Some(e);
                                // One terminal child stops the whole engine.
                                if let Some(handle) = child_cancel.take() {
                                    handle.cancel();
                                }
                            }
                        }
                    }
                    Err(_) => break,
                },
                recv(cancel.receiver()) -> _ => {
                    if let Some(handle) = child_cancel.take() {
                        handle.cancel();
                    }

                    while let Ok(result) = result_rx.recv() {
                        if let Err(e) = result {
                            first_error.get_or_insert(e);
                        }
                    }

                    for handle in handles {
                        let _ = handle.join();
                    }

                    return Err(first_error.unwrap_or_else(Error::cancelled));
                }
            }
        }

        for handle in handles {
            let _ = handle.join();
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
