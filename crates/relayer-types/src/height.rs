use core::fmt::{Display, Error as FmtError, Formatter};
use core::str::FromStr;

use flex_error::define_error;
use serde_derive::{Deserialize, Serialize};

define_error! {
    #[derive(Debug, Clone)]
    HeightError {
        ZeroHeight
            |_| { "height cannot be zero" },

        Underflow
            { height: u64, sub: u64 }
            |e| { format!("height {} cannot be decremented by {}", e.height, e.sub) },

        InvalidHeight
            { raw: String }
            |e| { format!("cannot parse height from `{}`", e.raw) },
    }
}

/// A block height. Heights are 1-based: height 0 denotes the absence of a
/// committed block and is not constructible.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Height(u64);

impl Height {
    pub fn new(height: u64) -> Result<Self, HeightError> {
        if height == 0 {
            return Err(HeightError::zero_height());
        }
        Ok(Self(height))
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn increment(self) -> Self {
        Self(self.0 + 1)
    }

    /// Proofs produced at height `h` are committed in block `h + 1`, so
    /// reconciliation queries run against the decremented latest height.
    pub fn decrement(self) -> Result<Self, HeightError> {
        self.sub(1)
    }

    pub fn sub(self, delta: u64) -> Result<Self, HeightError> {
        let height = self
            .0
            .checked_sub(delta)
            .ok_or_else(|| HeightError::underflow(self.0, delta))?;
        Self::new(height)
    }

    /// Subtract `delta`, flooring at the first block.
    pub fn sub_or_first(self, delta: u64) -> Self {
        Self(self.0.saturating_sub(delta).max(1))
    }
}

impl Display for Height {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Height {
    type Err = HeightError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .parse::<u64>()
            .map_err(|_| HeightError::invalid_height(s.to_string()))?;
        Self::new(raw)
    }
}
