use core::fmt::{Display, Error as FmtError, Formatter};
use core::str::FromStr;

use flex_error::define_error;
use serde_derive::{Deserialize, Serialize};

define_error! {
    #[derive(Debug, Clone)]
    ValidationError {
        Empty
            |_| { "identifier cannot be empty" },

        ContainsSeparator
            { id: String }
            |e| { format!("identifier `{}` cannot contain path separator '/'", e.id) },

        InvalidCharacter
            { id: String }
            |e| { format!("identifier `{}` must only contain alphanumeric characters or `.`, `_`, `+`, `-`, `#`, `[`, `]`, `<`, `>`", e.id) },

        InvalidLength
            { id: String, length: usize, min: usize, max: usize }
            |e| { format!("identifier `{}` has invalid length {}, must be between {} and {} characters", e.id, e.length, e.min, e.max) },
    }
}

/// Checks an identifier against the character set and length bounds that
/// on-chain identifier validation enforces.
fn validate_identifier(id: &str, min: usize, max: usize) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::empty());
    }

    if id.contains('/') {
        return Err(ValidationError::contains_separator(id.to_string()));
    }

    if id.len() < min || id.len() > max {
        return Err(ValidationError::invalid_length(
            id.to_string(),
            id.len(),
            min,
            max,
        ));
    }

    let valid = id.chars().all(|c| {
        c.is_alphanumeric() || matches!(c, '.' | '_' | '+' | '-' | '#' | '[' | ']' | '<' | '>')
    });

    if !valid {
        return Err(ValidationError::invalid_character(id.to_string()));
    }

    Ok(())
}

macro_rules! identifier {
    ($name:ident, $min:expr, $max:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Get this identifier as a borrowed `&str`.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                validate_identifier(s, $min, $max)?;
                Ok(Self(s.to_string()))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

identifier!(
    ClientId,
    9,
    64,
    "Identifier of an on-chain light client, e.g. `07-tendermint-0`."
);
identifier!(
    ConnectionId,
    10,
    64,
    "Identifier of a connection end, e.g. `connection-0`."
);
identifier!(
    ChannelId,
    8,
    64,
    "Identifier of a channel end, e.g. `channel-0`."
);
identifier!(
    PortId,
    2,
    128,
    "Identifier of a port bound by an application module, e.g. `transfer`."
);

impl ClientId {
    /// Builds a client identifier from a client type prefix and a counter,
    /// in the `{prefix}-{counter}` format used on-chain.
    pub fn new(prefix: &str, counter: u64) -> Result<Self, ValidationError> {
        format!("{prefix}-{counter}").parse()
    }
}

impl ConnectionId {
    pub fn new(counter: u64) -> Self {
        Self(format!("connection-{counter}"))
    }
}

impl ChannelId {
    pub fn new(counter: u64) -> Self {
        Self(format!("channel-{counter}"))
    }
}

impl PortId {
    pub fn transfer() -> Self {
        Self("transfer".to_string())
    }
}

/// Identifies a chain by its chain id string, e.g. `ibc-0` or `osmosis-1`.
///
/// When the identifier follows the `{name}-{revision}` convention, the
/// revision number is extracted so that revision-aware heights can be
/// compared across upgrades.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId {
    id: String,
}

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Extract the revision number from a `{name}-{revision}` identifier,
    /// or 0 if the identifier does not follow that convention.
    pub fn revision(&self) -> u64 {
        match self.id.rsplit_once('-') {
            Some((name, rev)) if !name.is_empty() && !rev.starts_with('0') => {
                rev.parse().unwrap_or(0)
            }
            _ => 0,
        }
    }
}

impl FromStr for ChainId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::empty());
        }
        Ok(Self { id: s.to_string() })
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.id)
    }
}

impl Default for ChainId {
    fn default() -> Self {
        Self::new("defaultChainId")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_identifiers() {
        assert!("channel-0".parse::<ChannelId>().is_ok());
        assert!("transfer".parse::<PortId>().is_ok());
        assert!("connection-17".parse::<ConnectionId>().is_ok());
        assert!("07-tendermint-3".parse::<ClientId>().is_ok());
    }

    #[test]
    fn reject_invalid_identifiers() {
        assert!("".parse::<ChannelId>().is_err());
        assert!("chan/0".parse::<ChannelId>().is_err());
        assert!("chan nel0".parse::<ChannelId>().is_err());
        assert!("short".parse::<ChannelId>().is_err());
    }

    #[test]
    fn channel_id_counter_format() {
        assert_eq!(ChannelId::new(7).as_str(), "channel-7");
    }

    #[test]
    fn chain_id_revision() {
        assert_eq!(ChainId::new("ibc-1").revision(), 1);
        assert_eq!(ChainId::new("ibc").revision(), 0);
        assert_eq!(ChainId::new("ibc-01").revision(), 0);
    }
}
