#![forbid(unsafe_code)]
#![allow(clippy::too_many_arguments)]

//! The Conduit relay control core.
//!
//! Given two chains joined by an IBC connection, the core keeps every open
//! channel drained: packets committed on one side are delivered to the
//! other, and acknowledgements written by the receiver are relayed back.
//!
//! Two interchangeable engines implement that contract:
//!
//! - the per-channel polling engine ([`supervisor`] + [`worker`]), which
//!   discovers channels once at startup and runs one reconciliation loop
//!   per open channel;
//! - the event-driven engine ([`processor`]), which tails block events on
//!   both chains and reconciles from cached state, trading the polling
//!   latency for event-stream bookkeeping.
//!
//! Chain access goes through the [`chain::handle::ChainHandle`] capability
//! trait; everything cryptographic (signing, proofs, light clients) lives
//! behind it.

pub mod chain;
pub mod config;
pub mod error;
pub mod event;
pub mod link;
pub mod processor;
pub mod supervisor;
pub mod util;
pub mod worker;
