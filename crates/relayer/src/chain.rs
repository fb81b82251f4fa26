use std::sync::Arc;

use conduit_relayer_types::identifier::{ChainId, ClientId, ConnectionId};
use conduit_relayer_types::Height;

use crate::chain::handle::ChainHandle;
use crate::error::Error;
use crate::util::cancel::CancelToken;

pub mod handle;
pub mod mock;
pub mod settlement;

/// One endpoint of a relay path: the connection this side relays over, the
/// client it maintains of the counterparty, and the handle used to reach
/// the chain. Immutable after construction.
#[derive(Clone)]
pub struct Chain {
    client_id: ClientId,
    connection_id: ConnectionId,
    handle: Arc<dyn ChainHandle>,
}

impl Chain {
    pub fn new(
        client_id: ClientId,
        connection_id: ConnectionId,
        handle: Arc<dyn ChainHandle>,
    ) -> Self {
        Self {
            client_id,
            connection_id,
            handle,
        }
    }

    pub fn id(&self) -> ChainId {
        self.handle.id()
    }

    pub fn name(&self) -> String {
        self.handle.name()
    }

    /// The identifier of the client this side uses to track the
    /// counterparty chain.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn handle(&self) -> &Arc<dyn ChainHandle> {
        &self.handle
    }
}

impl core::fmt::Debug for Chain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Chain")
            .field("chain_id", &self.id())
            .field("client_id", &self.client_id)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// Query the latest heights on both chains of a path.
pub fn query_latest_heights(
    cancel: &CancelToken,
    src: &Chain,
    dst: &Chain,
) -> Result<(Height, Height), Error> {
    let src_height = src.handle().query_latest_height(cancel)?;
    let dst_height = dst.handle().query_latest_height(cancel)?;
    Ok((src_height, dst_height))
}
