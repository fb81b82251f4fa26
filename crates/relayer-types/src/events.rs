use core::fmt::{Display, Error as FmtError, Formatter};

use serde_derive::{Deserialize, Serialize};

use crate::channel::Ordering;
use crate::identifier::{ChannelId, ClientId, PortId};
use crate::{Height, Sequence};

/// The identifying fields of a packet, as carried by packet events.
///
/// The payload bytes and timeout parameters are owned by the providers;
/// the relay core only routes on the identifiers and the sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Packet {
    pub sequence: Sequence,
    pub source_port: PortId,
    pub source_channel: ChannelId,
    pub destination_port: PortId,
    pub destination_channel: ChannelId,
}

impl Display for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(
            f,
            "{}/{} -> {}/{} seq {}",
            self.source_port,
            self.source_channel,
            self.destination_port,
            self.destination_channel,
            self.sequence
        )
    }
}

/// Attributes shared by the channel lifecycle events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAttributes {
    pub port_id: PortId,
    pub channel_id: ChannelId,
    pub counterparty_port_id: PortId,
    pub counterparty_channel_id: Option<ChannelId>,
    pub ordering: Ordering,
}

/// A new block was committed on the chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlock {
    pub height: Height,
}

impl NewBlock {
    pub fn new(height: Height) -> Self {
        Self { height }
    }
}

/// A client was updated with a new consensus state of its counterparty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateClient {
    pub client_id: ClientId,
    pub consensus_height: Height,
}

/// The block events the relay core reacts to.
///
/// Providers translate their native event encodings into this enum; events
/// the core has no use for are dropped at the provider boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IbcEvent {
    NewBlock(NewBlock),

    OpenInitChannel(ChannelAttributes),
    OpenTryChannel(ChannelAttributes),
    OpenAckChannel(ChannelAttributes),
    OpenConfirmChannel(ChannelAttributes),
    CloseInitChannel(ChannelAttributes),
    CloseConfirmChannel(ChannelAttributes),

    SendPacket(Packet),
    ReceivePacket(Packet),
    WriteAcknowledgement(Packet),
    AcknowledgePacket(Packet),

    UpdateClient(UpdateClient),
}

impl IbcEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            IbcEvent::NewBlock(_) => "new_block",
            IbcEvent::OpenInitChannel(_) => "channel_open_init",
            IbcEvent::OpenTryChannel(_) => "channel_open_try",
            IbcEvent::OpenAckChannel(_) => "channel_open_ack",
            IbcEvent::OpenConfirmChannel(_) => "channel_open_confirm",
            IbcEvent::CloseInitChannel(_) => "channel_close_init",
            IbcEvent::CloseConfirmChannel(_) => "channel_close_confirm",
            IbcEvent::SendPacket(_) => "send_packet",
            IbcEvent::ReceivePacket(_) => "recv_packet",
            IbcEvent::WriteAcknowledgement(_) => "write_acknowledgement",
            IbcEvent::AcknowledgePacket(_) => "acknowledge_packet",
            IbcEvent::UpdateClient(_) => "update_client",
        }
    }

    /// The channel attributes for channel lifecycle events.
    pub fn channel_attributes(&self) -> Option<&ChannelAttributes> {
        match self {
            IbcEvent::OpenInitChannel(attrs)
            | IbcEvent::OpenTryChannel(attrs)
            | IbcEvent::OpenAckChannel(attrs)
            | IbcEvent::OpenConfirmChannel(attrs)
            | IbcEvent::CloseInitChannel(attrs)
            | IbcEvent::CloseConfirmChannel(attrs) => Some(attrs),
            _ => None,
        }
    }

    /// The packet for packet flow events.
    pub fn packet(&self) -> Option<&Packet> {
        match self {
            IbcEvent::SendPacket(p)
            | IbcEvent::ReceivePacket(p)
            | IbcEvent::WriteAcknowledgement(p)
            | IbcEvent::AcknowledgePacket(p) => Some(p),
            _ => None,
        }
    }
}

impl Display for IbcEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            IbcEvent::NewBlock(b) => write!(f, "new_block h:{}", b.height),
            IbcEvent::UpdateClient(u) => {
                write!(f, "update_client {} -> {}", u.client_id, u.consensus_height)
            }
            event => match event.packet() {
                Some(packet) => write!(f, "{} {}", event.event_type(), packet),
                None => write!(f, "{}", event.event_type()),
            },
        }
    }
}
