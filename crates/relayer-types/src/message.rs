use core::fmt::{Display, Error as FmtError, Formatter};

use serde_derive::{Deserialize, Serialize};

/// An opaque, encoded chain message.
///
/// The relay core never inspects the payload; providers build these and
/// later decode them when assembling a transaction for broadcast. The
/// shape mirrors a protobuf `Any`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub type_url: String,
    pub value: Vec<u8>,
}

impl RelayMessage {
    pub fn new(type_url: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }

    /// The encoded size used when packing messages into transactions.
    pub fn encoded_len(&self) -> usize {
        self.type_url.len() + self.value.len()
    }
}

impl Display for RelayMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{} ({} bytes)", self.type_url, self.value.len())
    }
}

/// The outcome of a transaction broadcast, as reported by the provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    pub code: u32,
    pub log: String,
    pub hash: String,
}

impl TxResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl Display for TxResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "tx {} code {}", self.hash, self.code)
    }
}
