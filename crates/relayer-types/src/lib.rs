#![forbid(unsafe_code)]
#![allow(clippy::large_enum_variant)]

//! Domain types shared by the Conduit relay core.
//!
//! This crate is purely declarative: identifiers, heights, sequences,
//! channel ends and events. It performs no I/O and holds no locks, so it
//! can be depended on from every layer of the relayer without dragging in
//! the runtime machinery.

pub mod channel;
pub mod events;
pub mod identifier;
pub mod message;

mod height;
mod sequence;

pub use height::{Height, HeightError};
pub use sequence::Sequence;
