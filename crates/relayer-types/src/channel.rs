use core::fmt::{Display, Error as FmtError, Formatter};
use core::str::FromStr;

use flex_error::define_error;
use serde_derive::{Deserialize, Serialize};

use crate::identifier::{ChannelId, ConnectionId, PortId};

define_error! {
    #[derive(Debug, Clone)]
    ChannelError {
        UnknownState
            { state: String }
            |e| { format!("unknown channel state: `{}`", e.state) },

        UnknownOrdering
            { ordering: String }
            |e| { format!("unknown channel ordering: `{}`", e.ordering) },

        MissingCounterpartyChannelId
            |_| { "the channel counterparty has no channel id" },
    }
}

/// The lifecycle state of a channel end.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum State {
    #[default]
    Uninitialized,
    Init,
    TryOpen,
    Open,
    Closed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Uninitialized => "UNINITIALIZED",
            State::Init => "INIT",
            State::TryOpen => "TRYOPEN",
            State::Open => "OPEN",
            State::Closed => "CLOSED",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, State::Open)
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for State {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNINITIALIZED" => Ok(State::Uninitialized),
            "INIT" => Ok(State::Init),
            "TRYOPEN" => Ok(State::TryOpen),
            "OPEN" => Ok(State::Open),
            "CLOSED" => Ok(State::Closed),
            _ => Err(ChannelError::unknown_state(s.to_string())),
        }
    }
}

/// The delivery discipline of a channel.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Ordering {
    #[default]
    Unordered,
    Ordered,
}

impl Ordering {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ordering::Unordered => "UNORDERED",
            Ordering::Ordered => "ORDERED",
        }
    }
}

impl Display for Ordering {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Ordering {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNORDERED" => Ok(Ordering::Unordered),
            "ORDERED" => Ok(Ordering::Ordered),
            _ => Err(ChannelError::unknown_ordering(s.to_string())),
        }
    }
}

/// The counterparty channel end, as recorded on this side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    pub port_id: PortId,
    pub channel_id: Option<ChannelId>,
}

impl Counterparty {
    pub fn new(port_id: PortId, channel_id: Option<ChannelId>) -> Self {
        Self {
            port_id,
            channel_id,
        }
    }

    pub fn channel_id(&self) -> Result<&ChannelId, ChannelError> {
        self.channel_id
            .as_ref()
            .ok_or_else(ChannelError::missing_counterparty_channel_id)
    }
}

/// One end of a channel, as returned by a channel query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEnd {
    pub state: State,
    pub ordering: Ordering,
    pub remote: Counterparty,
    pub connection_hops: Vec<ConnectionId>,
    pub version: String,
}

impl ChannelEnd {
    pub fn new(
        state: State,
        ordering: Ordering,
        remote: Counterparty,
        connection_hops: Vec<ConnectionId>,
        version: String,
    ) -> Self {
        Self {
            state,
            ordering,
            remote,
            connection_hops,
            version,
        }
    }

    pub fn state_matches(&self, other: &State) -> bool {
        self.state == *other
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub fn counterparty(&self) -> &Counterparty {
        &self.remote
    }
}

/// A channel end together with the port and channel id it lives under.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifiedChannelEnd {
    pub port_id: PortId,
    pub channel_id: ChannelId,
    pub channel_end: ChannelEnd,
}

impl IdentifiedChannelEnd {
    pub fn new(port_id: PortId, channel_id: ChannelId, channel_end: ChannelEnd) -> Self {
        Self {
            port_id,
            channel_id,
            channel_end,
        }
    }
}

impl Display for IdentifiedChannelEnd {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "{}/{} [{}]",
            self.port_id, self.channel_id, self.channel_end.state
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for state in [State::Init, State::TryOpen, State::Open, State::Closed] {
            assert_eq!(state.as_str().parse::<State>().unwrap(), state);
        }
        assert!("FLUSHING".parse::<State>().is_err());
    }

    #[test]
    fn only_open_is_open() {
        assert!(State::Open.is_open());
        assert!(!State::TryOpen.is_open());
        assert!(!State::Closed.is_open());
    }
}
