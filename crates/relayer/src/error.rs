//! Errors surfaced by chain handles, with the transient/terminal
//! classification used by the shared retry policy.

use flex_error::define_error;

use conduit_relayer_types::identifier::{ChainId, ChannelId, PortId};

/// Substring emitted by nodes that have transaction indexing turned off.
/// Recognized so the operator gets a pointed log line instead of a generic
/// submission failure.
const TX_INDEXING_DISABLED: &str = "transaction indexing is disabled";

define_error! {
    #[derive(Debug, Clone)]
    Error {
        Transport
            { reason: String }
            |e| { format!("transport error: {}", e.reason) },

        Timeout
            { reason: String }
            |e| { format!("request timed out: {}", e.reason) },

        NodeBehind
            { chain_id: ChainId, requested: u64, latest: u64 }
            |e| {
                format!("chain {} has not caught up: requested height {}, latest {}",
                    e.chain_id, e.requested, e.latest)
            },

        Cancelled
            |_| { "operation cancelled" },

        Submit
            { log: String }
            |e| { format!("transaction submission failed: {}", e.log) },

        Protocol
            { reason: String }
            |e| { format!("protocol violation reported by provider: {}", e.reason) },

        ChannelNotFound
            { chain_id: ChainId, channel_id: ChannelId, port_id: PortId }
            |e| {
                format!("channel {}/{} not found on chain {}",
                    e.port_id, e.channel_id, e.chain_id)
            },

        ChannelSend
            |_| { "internal message-passing failure: could not send message" },

        Subscription
            { reason: String }
            |e| { format!("block subscription failed: {}", e.reason) },
    }
}

impl ErrorDetail {
    /// Whether the shared retry policy may retry this error. Only network
    /// trouble, timeouts and node height lag qualify; everything else
    /// propagates immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorDetail::Transport(_) | ErrorDetail::Timeout(_) | ErrorDetail::NodeBehind(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ErrorDetail::Cancelled(_))
    }

    /// Whether a submission failure is the node telling us its transaction
    /// index is off, which no amount of retrying will fix on our side.
    pub fn is_tx_indexing_disabled(&self) -> bool {
        match self {
            ErrorDetail::Submit(e) => e.log.contains(TX_INDEXING_DISABLED),
            _ => false,
        }
    }
}

impl Error {
    pub fn is_transient(&self) -> bool {
        self.detail().is_transient()
    }

    pub fn is_cancelled(&self) -> bool {
        self.detail().is_cancelled()
    }

    pub fn is_tx_indexing_disabled(&self) -> bool {
        self.detail().is_tx_indexing_disabled()
    }
}
