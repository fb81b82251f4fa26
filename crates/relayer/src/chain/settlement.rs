//! Settlement-layer queries for rollup-backed chains.
//!
//! Some destination chains settle on a hub that finalizes their blocks
//! after the fact; relaying against such a chain may need to know the
//! newest finalized height of a given rollup. This is a thin query
//! wrapper: construction is an explicit factory and each consumer holds
//! its own handle, so there is no process-wide state to initialize or
//! to initialize twice.

use std::sync::Arc;

use conduit_relayer_types::Height;

use crate::chain::handle::ChainHandle;
use crate::error::Error;
use crate::util::cancel::CancelToken;

/// A chain handle that can additionally report settlement finality for
/// rollups settling on it.
pub trait SettlementProvider: ChainHandle {
    /// The newest finalized height of `rollapp_id`, or `None` when the
    /// rollup has no finalized state yet.
    fn query_latest_finalized_height(
        &self,
        cancel: &CancelToken,
        rollapp_id: &str,
    ) -> Result<Option<Height>, Error>;
}

/// A handle to the settlement view of one chain.
#[derive(Clone)]
pub struct SettlementChain {
    provider: Arc<dyn SettlementProvider>,
}

impl SettlementChain {
    pub fn new(provider: Arc<dyn SettlementProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn SettlementProvider> {
        &self.provider
    }

    pub fn latest_finalized_height(
        &self,
        cancel: &CancelToken,
        rollapp_id: &str,
    ) -> Result<Option<Height>, Error> {
        self.provider.query_latest_finalized_height(cancel, rollapp_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::chain::mock::MockChain;
    use crate::util::cancel::cancel_pair;

    #[test]
    fn reports_finality_when_known() {
        let chain = MockChain::new("hub-1", 50);
        let settlement = SettlementChain::new(Arc::new(chain.clone()));
        let (_handle, cancel) = cancel_pair();

        assert_eq!(
            settlement.latest_finalized_height(&cancel, "roll-1").unwrap(),
            None
        );

        chain.set_finalized_height(42);
        assert_eq!(
            settlement
                .latest_finalized_height(&cancel, "roll-1")
                .unwrap()
                .map(Height::value),
            Some(42)
        );
    }

    #[test]
    fn independent_handles_coexist() {
        let chain = MockChain::new("hub-1", 50);
        let first = SettlementChain::new(Arc::new(chain.clone()));
        let second = SettlementChain::new(Arc::new(chain));
        let (_handle, cancel) = cancel_pair();

        assert!(first.latest_finalized_height(&cancel, "roll-1").is_ok());
        assert!(second.latest_finalized_height(&cancel, "roll-2").is_ok());
    }
}
