//! Wire-level types for the subset of the Minecraft play protocol that the
//! proxy's chat pipeline reads and writes.
//!
//! Everything else about the connection (compression, encryption, version
//! dispatch, the full packet registry) belongs to the connection codec and is
//! not represented here.

use std::fmt;
use std::io::Write;

pub mod bit_set;
pub mod frame;
mod impls;
pub mod last_seen;
pub mod packets;
pub mod var_int;

pub use bit_set::FixedBitSet;
pub use last_seen::{AckBitSet, LastSeenMessages, WINDOW_SIZE};
pub use var_int::VarInt;

/// The maximum number of bytes in a single Minecraft packet.
pub const MAX_PACKET_SIZE: i32 = 2097152;

/// The `Encode` trait allows objects to be written to the Minecraft protocol.
/// It is the inverse of [`Decode`].
///
/// Components of a type are encoded in the order they appear in the type
/// definition.
pub trait Encode {
    /// Writes this object to the provided writer.
    ///
    /// If this type also implements [`Decode`] then successful calls to this
    /// function returning `Ok(())` must always successfully [`decode`] using
    /// the data that was written to the writer. The exact number of bytes
    /// that were originally written must be consumed during the decoding.
    ///
    /// [`decode`]: Decode::decode
    fn encode(&self, w: impl Write) -> anyhow::Result<()>;

    /// Like [`Encode::encode`], except that a whole slice of values is
    /// encoded with no leading length prefix.
    ///
    /// Must be semantically equivalent to encoding every element of the
    /// slice in sequence (the default), but `u8`-like types override it with
    /// a single [`write_all`].
    ///
    /// [`write_all`]: Write::write_all
    fn encode_slice(slice: &[Self], mut w: impl Write) -> anyhow::Result<()>
    where
        Self: Sized,
    {
        for value in slice {
            value.encode(&mut w)?;
        }

        Ok(())
    }

    /// Set when [`Encode::encode_slice`] has an overriding implementation
    /// worth dispatching to.
    const HAS_ENCODE_SLICE: bool = false;
}

/// The `Decode` trait allows objects to be read from the Minecraft protocol.
/// It is the inverse of [`Encode`].
///
/// `Decode` is parameterized by a lifetime so decoded values may borrow from
/// the byte slice they were read from.
pub trait Decode<'a>: Sized {
    /// Reads this object from the provided byte slice.
    ///
    /// Implementations of `Decode` are expected to shrink the slice from the
    /// front as bytes are read.
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self>;
}

/// Provides the name of a packet for diagnostics.
pub trait PacketName {
    /// The name of this packet.
    fn packet_name(&self) -> &'static str;
}

/// A complete packet: a `VarInt` packet ID followed by the packet body.
///
/// Object safe, so heterogeneous packets can flow through a single ordered
/// write path as `&dyn Packet` / `Box<dyn Packet>`.
pub trait Packet: PacketName + fmt::Debug + Send + Sync {
    /// Wire ID of this packet within its protocol state.
    fn packet_id(&self) -> i32;

    /// Writes the packet body, excluding the leading packet ID.
    fn encode_body(&self, w: &mut dyn Write) -> anyhow::Result<()>;
}
