//! The serverbound play packets the chat pipeline forwards or synthesizes.
//!
//! Fields are owned (unlike the borrowing decode-side representations a full
//! connection codec would use) because these packets cross task boundaries
//! between the queue and the backend link.

use std::io::Write;

use crate::last_seen::LastSeenMessages;
use crate::{Decode, Encode, Packet, PacketName, VarInt};

/// Serverbound play packet ids, tracking 1.20.1. Per-version id dispatch is
/// the connection's concern; the pipeline only names the ids it writes.
pub mod id {
    pub const MESSAGE_ACKNOWLEDGMENT_C2S: i32 = 0x03;
    pub const COMMAND_EXECUTION_C2S: i32 = 0x04;
    pub const CHAT_MESSAGE_C2S: i32 = 0x05;
}

macro_rules! impl_packet {
    ($packet:ident, $id:expr) => {
        impl PacketName for $packet {
            fn packet_name(&self) -> &'static str {
                stringify!($packet)
            }
        }

        impl Packet for $packet {
            fn packet_id(&self) -> i32 {
                $id
            }

            fn encode_body(&self, w: &mut dyn Write) -> anyhow::Result<()> {
                self.encode(w)
            }
        }
    };
}

/// A chat message sent by the client, forwarded to its backend server.
#[derive(Clone, Debug)]
pub struct ChatMessageC2s {
    pub message: String,
    pub timestamp: u64,
    pub salt: u64,
    pub signature: Option<Box<[u8; 256]>>,
    /// The client's acknowledgement state: a bitset over the last
    /// [`WINDOW_SIZE`](crate::WINDOW_SIZE) received messages plus the message
    /// count offset.
    pub last_seen: LastSeenMessages,
}

impl_packet!(ChatMessageC2s, id::CHAT_MESSAGE_C2S);

impl Encode for ChatMessageC2s {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.message.encode(&mut w)?;
        self.timestamp.encode(&mut w)?;
        self.salt.encode(&mut w)?;
        self.signature.encode(&mut w)?;
        self.last_seen.encode(w)
    }
}

impl Decode<'_> for ChatMessageC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            message: String::decode(r)?,
            timestamp: u64::decode(r)?,
            salt: u64::decode(r)?,
            signature: Option::decode(r)?,
            last_seen: LastSeenMessages::decode(r)?,
        })
    }
}

/// A command executed by the client, forwarded to its backend server.
#[derive(Clone, Debug)]
pub struct CommandExecutionC2s {
    pub command: String,
    pub timestamp: u64,
    pub salt: u64,
    pub argument_signatures: Vec<CommandArgumentSignature>,
    pub last_seen: LastSeenMessages,
}

impl_packet!(CommandExecutionC2s, id::COMMAND_EXECUTION_C2S);

impl Encode for CommandExecutionC2s {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.command.encode(&mut w)?;
        self.timestamp.encode(&mut w)?;
        self.salt.encode(&mut w)?;
        self.argument_signatures.encode(&mut w)?;
        self.last_seen.encode(w)
    }
}

impl Decode<'_> for CommandExecutionC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            command: String::decode(r)?,
            timestamp: u64::decode(r)?,
            salt: u64::decode(r)?,
            argument_signatures: Vec::decode(r)?,
            last_seen: LastSeenMessages::decode(r)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct CommandArgumentSignature {
    pub argument_name: String,
    pub signature: Box<[u8; 256]>,
}

impl Encode for CommandArgumentSignature {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.argument_name.encode(&mut w)?;
        self.signature.encode(w)
    }
}

impl Decode<'_> for CommandArgumentSignature {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            argument_name: String::decode(r)?,
            signature: Box::decode(r)?,
        })
    }
}

/// Acknowledges `message_count` received player messages without a signed
/// packet to carry them. Synthesized by the proxy once enough
/// acknowledgements have been withheld.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MessageAcknowledgmentC2s {
    pub message_count: VarInt,
}

impl_packet!(MessageAcknowledgmentC2s, id::MESSAGE_ACKNOWLEDGMENT_C2S);

impl Encode for MessageAcknowledgmentC2s {
    fn encode(&self, w: impl Write) -> anyhow::Result<()> {
        self.message_count.encode(w)
    }
}

impl Decode<'_> for MessageAcknowledgmentC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            message_count: VarInt::decode(r)?,
        })
    }
}
