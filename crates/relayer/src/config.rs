//! Relay configuration: the channel filter policy and the engine
//! selection, plus the bounded numeric types in [`types`].

use core::fmt::{Display, Error as FmtError, Formatter};
use core::str::FromStr;

use flex_error::define_error;
use serde_derive::{Deserialize, Serialize};

use conduit_relayer_types::channel::IdentifiedChannelEnd;
use conduit_relayer_types::identifier::ChannelId;

pub mod types;

define_error! {
    #[derive(Debug, Clone)]
    ConfigError {
        UnknownProcessor
            { given: String }
            |e| {
                format!("unknown processor type `{}`, supports one of: [{}, {}]",
                    e.given, ProcessorType::Events, ProcessorType::Legacy)
            },
    }
}

/// Which relay engine drives the path.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorType {
    /// The event-driven chain/path processor pipeline.
    #[default]
    Events,
    /// One polling worker per channel, discovered once at startup.
    Legacy,
}

impl Display for ProcessorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            ProcessorType::Events => write!(f, "events"),
            ProcessorType::Legacy => write!(f, "legacy"),
        }
    }
}

impl FromStr for ProcessorType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "events" => Ok(ProcessorType::Events),
            "legacy" => Ok(ProcessorType::Legacy),
            other => Err(ConfigError::unknown_processor(other.to_string())),
        }
    }
}

/// The channel filter policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterRule {
    /// Relay only on the channels in the list.
    Allow,
    /// Relay on every channel except those in the list.
    Deny,
    /// Relay on every channel; the list is ignored.
    #[default]
    None,
}

/// Decides which of the channels discovered on a connection are relayed
/// on. Filtering is on the channel identifier of the source side.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub rule: FilterRule,
    #[serde(default)]
    pub channel_list: Vec<ChannelId>,
}

impl ChannelFilter {
    pub fn allow(channel_list: Vec<ChannelId>) -> Self {
        Self {
            rule: FilterRule::Allow,
            channel_list,
        }
    }

    pub fn deny(channel_list: Vec<ChannelId>) -> Self {
        Self {
            rule: FilterRule::Deny,
            channel_list,
        }
    }

    pub fn in_channel_list(&self, channel_id: &ChannelId) -> bool {
        self.channel_list.contains(channel_id)
    }

    pub fn is_allowed(&self, channel_id: &ChannelId) -> bool {
        match self.rule {
            FilterRule::Allow => self.in_channel_list(channel_id),
            FilterRule::Deny => !self.in_channel_list(channel_id),
            FilterRule::None => true,
        }
    }

    /// Narrow `channels` to those the policy allows, preserving order.
    pub fn apply(&self, channels: Vec<IdentifiedChannelEnd>) -> Vec<IdentifiedChannelEnd> {
        channels
            .into_iter()
            .filter(|c| self.is_allowed(&c.channel_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use conduit_relayer_types::channel::ChannelEnd;
    use conduit_relayer_types::identifier::PortId;

    fn channels(ids: &[u64]) -> Vec<IdentifiedChannelEnd> {
        ids.iter()
            .map(|id| {
                IdentifiedChannelEnd::new(
                    PortId::transfer(),
                    ChannelId::new(*id),
                    ChannelEnd::default(),
                )
            })
            .collect()
    }

    fn ids(channels: &[IdentifiedChannelEnd]) -> Vec<&str> {
        channels.iter().map(|c| c.channel_id.as_str()).collect()
    }

    #[test]
    fn allow_keeps_only_listed() {
        let filter = ChannelFilter::allow(vec![ChannelId::new(0), ChannelId::new(3)]);
        let out = filter.apply(channels(&[0, 1, 3, 5]));
        assert_eq!(ids(&out), vec!["channel-0", "channel-3"]);
    }

    #[test]
    fn deny_drops_listed() {
        let filter = ChannelFilter::deny(vec![ChannelId::new(1)]);
        let out = filter.apply(channels(&[0, 1, 2]));
        assert_eq!(ids(&out), vec!["channel-0", "channel-2"]);
    }

    #[test]
    fn no_rule_keeps_all() {
        let filter = ChannelFilter::default();
        let out = filter.apply(channels(&[0, 1, 2]));
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn empty_list_boundaries() {
        let all = channels(&[0, 1, 2]);

        let allow = ChannelFilter::allow(vec![]);
        assert!(allow.apply(all.clone()).is_empty());

        let deny = ChannelFilter::deny(vec![]);
        assert_eq!(deny.apply(all.clone()).len(), 3);
    }

    #[test]
    fn filter_is_idempotent() {
        let filter = ChannelFilter::allow(vec![ChannelId::new(0), ChannelId::new(5)]);
        let once = filter.apply(channels(&[0, 1, 3, 5]));
        let twice = filter.apply(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn processor_type_parsing() {
        assert_eq!("events".parse::<ProcessorType>().unwrap(), ProcessorType::Events);
        assert_eq!("legacy".parse::<ProcessorType>().unwrap(), ProcessorType::Legacy);
        assert!("realtime".parse::<ProcessorType>().is_err());
    }
}
