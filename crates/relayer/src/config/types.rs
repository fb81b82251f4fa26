//! Transaction assembly limits and the operator memo.
//!
//! The limits reject their degenerate zero values at construction: a
//! transaction that may carry no message, or no bytes, can never relay
//! anything, so a configuration saying either is refused up front rather
//! than producing an engine that spins without submitting. Whether a
//! configured size limit is actually large enough for a client update is
//! only known at batching time and is checked there.

use core::fmt::{Display, Error as FmtError, Formatter};

use flex_error::define_error;
use serde_derive::{Deserialize, Serialize};

define_error! {
    #[derive(Debug, Clone)]
    Error {
        ZeroMsgsPerTx
            |_| { "a transaction must be allowed to carry at least one message" },

        ZeroTxSize
            |_| { "a transaction size limit of zero cannot fit any message" },
    }
}

/// How many payload messages one transaction may carry. The client update
/// prepended to every transaction is not counted against this limit, so a
/// limit of one yields one transaction per relayed message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct TxMsgLimit(usize);

impl TxMsgLimit {
    pub fn new(limit: usize) -> Result<Self, Error> {
        if limit == 0 {
            return Err(Error::zero_msgs_per_tx());
        }
        Ok(Self(limit))
    }

    pub fn value(self) -> usize {
        self.0
    }
}

impl Default for TxMsgLimit {
    fn default() -> Self {
        Self(16)
    }
}

impl TryFrom<usize> for TxMsgLimit {
    type Error = Error;

    fn try_from(limit: usize) -> Result<Self, Error> {
        Self::new(limit)
    }
}

impl From<TxMsgLimit> for usize {
    fn from(limit: TxMsgLimit) -> Self {
        limit.0
    }
}

impl Display for TxMsgLimit {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.0)
    }
}

/// The encoded size ceiling of one transaction, in bytes, client update
/// included. Defaults to 2 MiB, comfortably under the block size of the
/// consensus engines the relayer talks to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct TxSizeLimit(usize);

impl TxSizeLimit {
    pub fn new(limit: usize) -> Result<Self, Error> {
        if limit == 0 {
            return Err(Error::zero_tx_size());
        }
        Ok(Self(limit))
    }

    pub fn value(self) -> usize {
        self.0
    }
}

impl Default for TxSizeLimit {
    fn default() -> Self {
        Self(2 * 1024 * 1024)
    }
}

impl TryFrom<usize> for TxSizeLimit {
    type Error = Error;

    fn try_from(limit: usize) -> Result<Self, Error> {
        Self::new(limit)
    }
}

impl From<TxSizeLimit> for usize {
    fn from(limit: TxSizeLimit) -> Self {
        limit.0
    }
}

impl Display for TxSizeLimit {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{} bytes", self.0)
    }
}

/// The free-form note stamped on every submitted transaction, typically
/// identifying the relayer operator in block explorers. May be empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Memo(String);

impl Memo {
    pub fn new(memo: impl Into<String>) -> Self {
        Self(memo.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Memo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limits_are_rejected() {
        assert!(TxMsgLimit::new(0).is_err());
        assert!(TxSizeLimit::new(0).is_err());
        assert_eq!(TxMsgLimit::new(1).unwrap().value(), 1);
        assert_eq!(TxSizeLimit::new(1).unwrap().value(), 1);
    }

    #[test]
    fn defaults_are_usable() {
        assert!(TxMsgLimit::default().value() >= 1);
        assert!(TxSizeLimit::default().value() >= 1);
        assert_eq!(Memo::default().as_str(), "");
    }

    #[test]
    fn limits_deserialize_through_validation() {
        assert!(serde_json::from_str::<TxMsgLimit>("0").is_err());
        let limit: TxMsgLimit = serde_json::from_str("5").unwrap();
        assert_eq!(limit.value(), 5);
    }
}
