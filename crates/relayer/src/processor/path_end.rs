use conduit_relayer_types::identifier::{ChainId, ClientId};

use crate::config::FilterRule;
use crate::processor::ChannelKey;

/// One side of a relay path in the event-driven engine: which chain it
/// is, the client it maintains of the counterparty, and the channel
/// filter applied to traffic observed on this side.
#[derive(Clone, Debug)]
pub struct PathEnd {
    pub chain_id: ChainId,
    pub client_id: ClientId,
    rule: FilterRule,
    channel_rules: Vec<ChannelKey>,
}

impl PathEnd {
    pub fn new(
        chain_id: ChainId,
        client_id: ClientId,
        rule: FilterRule,
        channel_rules: Vec<ChannelKey>,
    ) -> Self {
        Self {
            chain_id,
            client_id,
            rule,
            channel_rules,
        }
    }

    /// Whether traffic on the channel identified by `key` should be
    /// relayed according to this end's filter.
    pub fn allows_channel(&self, key: &ChannelKey) -> bool {
        match self.rule {
            FilterRule::Allow => self.matches_rule_list(key),
            FilterRule::Deny => !self.matches_rule_list(key),
            FilterRule::None => true,
        }
    }

    fn matches_rule_list(&self, key: &ChannelKey) -> bool {
        self.channel_rules.iter().any(|rule| rule_matches(rule, key))
    }
}

/// Component-wise match where an empty component of `rule` matches
/// anything.
fn rule_matches(rule: &ChannelKey, key: &ChannelKey) -> bool {
    component_matches(rule.channel_id.as_str(), key.channel_id.as_str())
        && component_matches(rule.port_id.as_str(), key.port_id.as_str())
        && component_matches(
            rule.counterparty_channel_id.as_str(),
            key.counterparty_channel_id.as_str(),
        )
        && component_matches(
            rule.counterparty_port_id.as_str(),
            key.counterparty_port_id.as_str(),
        )
}

fn component_matches(rule: &str, key: &str) -> bool {
    rule.is_empty() || rule == key
}

#[cfg(test)]
mod tests {
    use super::*;

    use conduit_relayer_types::identifier::{ChannelId, PortId};

    fn key(channel: u64, counterparty: u64) -> ChannelKey {
        ChannelKey {
            channel_id: ChannelId::new(channel),
            port_id: PortId::transfer(),
            counterparty_channel_id: ChannelId::new(counterparty),
            counterparty_port_id: PortId::transfer(),
        }
    }

    fn end(rule: FilterRule, rules: Vec<ChannelKey>) -> PathEnd {
        PathEnd::new(
            ChainId::new("ibc-0"),
            ClientId::new("07-tendermint", 0).unwrap(),
            rule,
            rules,
        )
    }

    #[test]
    fn allow_list_matches_on_channel_id() {
        let rule = ChannelKey {
            channel_id: ChannelId::new(0),
            ..ChannelKey::default()
        };
        let end = end(FilterRule::Allow, vec![rule]);

        assert!(end.allows_channel(&key(0, 7)));
        assert!(!end.allows_channel(&key(1, 7)));
    }

    #[test]
    fn deny_list_excludes_matches() {
        let rule = ChannelKey {
            counterparty_channel_id: ChannelId::new(7),
            ..ChannelKey::default()
        };
        let end = end(FilterRule::Deny, vec![rule]);

        assert!(!end.allows_channel(&key(0, 7)));
        assert!(end.allows_channel(&key(0, 8)));
    }

    #[test]
    fn no_rule_allows_everything() {
        let end = end(FilterRule::None, vec![]);
        assert!(end.allows_channel(&key(3, 4)));
    }
}
