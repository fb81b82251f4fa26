use flex_error::define_error;

use conduit_relayer_types::identifier::{ChainId, ChannelId};
use conduit_relayer_types::Sequence;

use crate::error::Error;

define_error! {
    #[derive(Debug, Clone)]
    LinkError {
        Relayer
            [ Error ]
            |_| { "relayer error" },

        CounterpartyChannelNotFound
            { channel_id: ChannelId }
            |e| {
                format!("counterparty channel id not found for channel {}, the handshake has not completed",
                    e.channel_id)
            },

        UpdateClientTooLarge
            { size: usize, max_tx_size: usize }
            |e| {
                format!("configured `max_tx_size` {} cannot fit a single client update of {} bytes",
                    e.max_tx_size, e.size)
            },

        MessageTooLarge
            { sequence: Sequence, size: usize, max_tx_size: usize }
            |e| {
                format!("message for sequence {} is {} bytes and cannot fit in a transaction of at most {} bytes",
                    e.sequence, e.size, e.max_tx_size)
            },

        SubmitFailed
            { chain_id: ChainId, code: u32, log: String }
            |e| {
                format!("transaction rejected by chain {} with code {}: {}",
                    e.chain_id, e.code, e.log)
            },
    }
}

impl LinkError {
    pub fn is_cancelled(&self) -> bool {
        match self.detail() {
            LinkErrorDetail::Relayer(e) => e.source.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_tx_indexing_disabled(&self) -> bool {
        match self.detail() {
            LinkErrorDetail::Relayer(e) => e.source.is_tx_indexing_disabled(),
            _ => false,
        }
    }

    /// Configuration errors cannot be retried and should stop the worker.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self.detail(),
            LinkErrorDetail::UpdateClientTooLarge(_) | LinkErrorDetail::MessageTooLarge(_)
        )
    }
}
