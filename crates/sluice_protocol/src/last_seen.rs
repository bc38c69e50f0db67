use std::io::Write;

use anyhow::ensure;

use crate::bit_set::FixedBitSet;
use crate::var_int::VarInt;
use crate::{Decode, Encode};

/// Width of the signed last-seen bitmap: the number of recently-seen signed
/// messages a Secure Chat client acknowledges in each signed packet.
pub const WINDOW_SIZE: usize = 20;

/// The acknowledgement bitmap carried in the tail of signed chat and command
/// packets.
pub type AckBitSet = FixedBitSet<WINDOW_SIZE, 3>;

/// The last-seen-messages snapshot carried inside signed chat and command
/// packets: a bitmap of recently-seen signed message indices plus an offset
/// that shifts future bits.
///
/// Values are immutable; [`LastSeenMessages::shifted_by`] returns a copy.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LastSeenMessages {
    offset: i32,
    acknowledged: AckBitSet,
}

impl LastSeenMessages {
    /// `offset` must be non-negative; decoding enforces this for values read
    /// off the wire.
    pub fn new(offset: i32, acknowledged: AckBitSet) -> Self {
        debug_assert!(offset >= 0, "negative last-seen offset {offset}");
        Self {
            offset,
            acknowledged,
        }
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn acknowledged(&self) -> AckBitSet {
        self.acknowledged
    }

    /// Returns a copy with the offset increased by `delta`, or `None` when
    /// the result would leave the VarInt domain. Callers clamp and treat the
    /// overflow as a client contract violation.
    pub fn shifted_by(&self, delta: i32) -> Option<Self> {
        let offset = self.offset.checked_add(delta)?;
        Some(Self {
            offset,
            acknowledged: self.acknowledged,
        })
    }
}

impl Encode for LastSeenMessages {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        VarInt(self.offset).encode(&mut w)?;
        self.acknowledged.encode(w)
    }
}

impl Decode<'_> for LastSeenMessages {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let offset = VarInt::decode(r)?.0;
        ensure!(offset >= 0, "negative last-seen offset ({offset})");

        Ok(Self {
            offset,
            acknowledged: AckBitSet::decode(r)?,
        })
    }
}
