use flex_error::define_error;

use conduit_relayer_types::identifier::{ChainId, ChannelId, ConnectionId};

use crate::error::Error as RelayerError;
use crate::processor::error::Error as ProcessorError;

define_error! {
    #[derive(Debug, Clone)]
    Error {
        NoOpenChannels
            |_| { "there are no open channels to relay on" },

        ChannelScan
            { chain_id: ChainId, connection_id: ConnectionId }
            [ RelayerError ]
            |e| {
                format!("error querying all channels on chain {} connection {}",
                    e.chain_id, e.connection_id)
            },

        ChannelRequery
            { channel_id: ChannelId }
            [ RelayerError ]
            |e| { format!("failed to query channel {} for updated state", e.channel_id) },

        Processor
            [ ProcessorError ]
            |_| { "event processor failed" },

        CompletionQueueClosed
            |_| { "the worker completion queue closed unexpectedly" },

        Cancelled
            |_| { "relayer cancelled" },
    }
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.detail(), ErrorDetail::Cancelled(_))
    }
}
