use core::fmt::{Display, Error as FmtError, Formatter};

use serde_derive::{Deserialize, Serialize};

/// The sequence number of a packet within a channel, monotonically
/// increasing per direction starting from 1.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    pub fn value(self) -> u64 {
        self.0
    }

    pub fn increment(self) -> Self {
        Self(self.0 + 1)
    }

    /// The absolute distance between two sequences.
    pub fn gap(self, other: Sequence) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl From<u64> for Sequence {
    fn from(seq: u64) -> Self {
        Self(seq)
    }
}

impl From<Sequence> for u64 {
    fn from(seq: Sequence) -> Self {
        seq.0
    }
}

impl Display for Sequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.0)
    }
}
