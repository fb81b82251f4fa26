use flex_error::define_error;

use conduit_relayer_types::identifier::ChainId;

use crate::error::Error as RelayerError;

define_error! {
    #[derive(Debug, Clone)]
    Error {
        Chain
            [ RelayerError ]
            |_| { "chain error" },

        SubscriptionClosed
            { chain_id: ChainId }
            |e| { format!("block subscription for chain {} closed and could not be re-established", e.chain_id) },

        NotWired
            { chain_id: ChainId }
            |e| { format!("path processor has no snapshot source for chain {}", e.chain_id) },

        Cancelled
            |_| { "event processor cancelled" },
    }
}
