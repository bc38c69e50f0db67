//! Length-prefixed packet framing.
//!
//! This is the uncompressed, unencrypted layout only; compression and
//! encryption live in the connection codec, past the point where the chat
//! pipeline hands frames off.

use anyhow::{bail, ensure};
use bytes::{BufMut, BytesMut};

use crate::var_int::{VarInt, VarIntDecodeError};
use crate::{Decode, Encode, Packet, MAX_PACKET_SIZE};

/// Appends `pkt` to `buf` as a complete frame: VarInt length, VarInt packet
/// ID, then the body.
pub fn encode_packet(buf: &mut BytesMut, pkt: &dyn Packet) -> anyhow::Result<()> {
    let start_len = buf.len();

    {
        let mut w = (&mut *buf).writer();
        VarInt(pkt.packet_id()).encode(&mut w)?;
        pkt.encode_body(&mut w)?;
    }

    let data_len = buf.len() - start_len;

    ensure!(
        data_len <= MAX_PACKET_SIZE as usize,
        "packet {} exceeds maximum length ({data_len} bytes)",
        pkt.packet_name()
    );

    // Make room at the front for the length prefix, then shift the frame
    // data over it.
    let prefix_len = VarInt(data_len as i32).written_size();

    buf.put_bytes(0, prefix_len);
    buf.copy_within(start_len..start_len + data_len, start_len + prefix_len);

    let front = &mut buf[start_len..];
    VarInt(data_len as i32).encode(front)?;

    Ok(())
}

/// Splits one complete frame off the front of `r`, returning its packet ID
/// and body. Returns `None` when `r` does not hold a complete frame yet.
pub fn split_frame<'a>(r: &mut &'a [u8]) -> anyhow::Result<Option<(i32, &'a [u8])>> {
    let mut peek = *r;

    let frame_len = match VarInt::decode_partial(&mut peek) {
        Ok(len) => len,
        Err(VarIntDecodeError::Incomplete) => return Ok(None),
        Err(VarIntDecodeError::TooLarge) => bail!("malformed frame length VarInt"),
    };

    ensure!(
        (0..=MAX_PACKET_SIZE).contains(&frame_len),
        "frame length of {frame_len} is out of bounds"
    );

    if peek.len() < frame_len as usize {
        return Ok(None);
    }

    let (mut frame, remaining) = peek.split_at(frame_len as usize);
    *r = remaining;

    let id = VarInt::decode(&mut frame)?.0;
    Ok(Some((id, frame)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::last_seen::{AckBitSet, LastSeenMessages};
    use crate::packets::{id, MessageAcknowledgmentC2s};
    use crate::Decode;

    #[test]
    fn frame_round_trip() {
        let pkt = MessageAcknowledgmentC2s {
            message_count: VarInt(300),
        };

        let mut buf = BytesMut::new();
        encode_packet(&mut buf, &pkt).unwrap();

        // Length prefix covers the ID byte plus the two-byte VarInt body.
        assert_eq!(buf[0], 3);

        let mut r = &buf[..];
        let (packet_id, mut body) = split_frame(&mut r).unwrap().unwrap();

        assert!(r.is_empty());
        assert_eq!(packet_id, id::MESSAGE_ACKNOWLEDGMENT_C2S);
        assert_eq!(
            MessageAcknowledgmentC2s::decode(&mut body).unwrap(),
            MessageAcknowledgmentC2s {
                message_count: VarInt(300)
            }
        );
    }

    #[test]
    fn split_incomplete_frame() {
        let pkt = crate::packets::ChatMessageC2s {
            message: "hi".into(),
            timestamp: 0,
            salt: 0,
            signature: None,
            last_seen: LastSeenMessages::new(0, AckBitSet::default()),
        };

        let mut buf = BytesMut::new();
        encode_packet(&mut buf, &pkt).unwrap();

        let mut r = &buf[..buf.len() - 1];
        assert!(split_frame(&mut r).unwrap().is_none());

        let mut r = &buf[..];
        assert!(split_frame(&mut r).unwrap().is_some());
    }

    #[test]
    fn consecutive_frames() {
        let mut buf = BytesMut::new();
        for count in [1, 2] {
            let pkt = MessageAcknowledgmentC2s {
                message_count: VarInt(count),
            };
            encode_packet(&mut buf, &pkt).unwrap();
        }

        let mut r = &buf[..];
        let mut counts = vec![];
        while let Some((_, mut body)) = split_frame(&mut r).unwrap() {
            counts.push(MessageAcknowledgmentC2s::decode(&mut body).unwrap().message_count.0);
        }

        assert_eq!(counts, [1, 2]);
    }
}
