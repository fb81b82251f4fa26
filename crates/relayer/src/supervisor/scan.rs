//! One-shot channel discovery: everything the supervisor knows about the
//! channels of a connection it learns here, at startup.

use std::collections::BTreeMap;

use tracing::info;

use conduit_relayer_types::channel::IdentifiedChannelEnd;
use conduit_relayer_types::identifier::ChannelId;

use crate::chain::Chain;
use crate::error::Error;
use crate::util::cancel::CancelToken;
use crate::util::retry::{retry_with_index, RetryResult};
use crate::worker::retry_strategy;

/// A discovered channel, together with whether a worker is currently
/// relaying on it. The supervisor owns these exclusively; a channel with
/// `active` set has exactly one live worker.
#[derive(Clone, Debug)]
pub struct ActiveChannel {
    pub channel: IdentifiedChannelEnd,
    pub active: bool,
}

/// Query all channels on the connection of `src`, retrying transient
/// failures under the shared policy.
pub fn channels_on_connection(
    cancel: &CancelToken,
    src: &Chain,
) -> Result<Vec<IdentifiedChannelEnd>, Error> {
    let height = retry_with_index(retry_strategy::worker_default_strategy(), |attempt| {
        if cancel.is_cancelled() {
            return RetryResult::Err(Error::cancelled());
        }

        match src.handle().query_latest_height(cancel) {
            Ok(height) => RetryResult::Ok(height),
            Err(e) if e.is_transient() => {
                info!(
                    chain_id = %src.id(),
                    attempt,
                    "failed to query latest height: {}", e
                );
                RetryResult::Retry(e)
            }
            Err(e) => RetryResult::Err(e),
        }
    })
    .map_err(|e| e.error)?;

    let result = retry_with_index(retry_strategy::worker_default_strategy(), |attempt| {
        if cancel.is_cancelled() {
            return RetryResult::Err(Error::cancelled());
        }

        match src
            .handle()
            .query_connection_channels(cancel, height, src.connection_id())
        {
            Ok(channels) => RetryResult::Ok(channels),
            Err(e) if e.is_transient() => {
                info!(
                    conn_id = %src.connection_id(),
                    attempt,
                    "failed to query connection channels: {}", e
                );
                RetryResult::Retry(e)
            }
            Err(e) => RetryResult::Err(e),
        }
    });

    result.map_err(|e| e.error)
}

/// Narrow the discovered channels to those in the OPEN state and index
/// them for the supervisor, with no worker attached yet.
pub fn filter_open_channels(
    channels: Vec<IdentifiedChannelEnd>,
) -> BTreeMap<ChannelId, ActiveChannel> {
    channels
        .into_iter()
        .filter(|channel| channel.channel_end.is_open())
        .map(|channel| {
            (
                channel.channel_id.clone(),
                ActiveChannel {
                    channel,
                    active: false,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use conduit_relayer_types::channel::{ChannelEnd, State};
    use conduit_relayer_types::identifier::PortId;

    fn channel(id: u64, state: State) -> IdentifiedChannelEnd {
        IdentifiedChannelEnd::new(
            PortId::transfer(),
            ChannelId::new(id),
            ChannelEnd {
                state,
                ..ChannelEnd::default()
            },
        )
    }

    #[test]
    fn only_open_channels_survive() {
        let open = filter_open_channels(vec![
            channel(0, State::Open),
            channel(1, State::Init),
            channel(2, State::Closed),
            channel(3, State::Open),
        ]);

        assert_eq!(open.len(), 2);
        assert!(open.contains_key(&ChannelId::new(0)));
        assert!(open.contains_key(&ChannelId::new(3)));
        assert!(open.values().all(|entry| !entry.active));
    }
}
