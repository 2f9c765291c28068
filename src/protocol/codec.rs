//! QRT packet codec (encode/decode)
//!
//! Wire layout:
//!
//! ```text
//! [MAGIC (4)] [FORM (1)] [LONG TYPE (1, long only)] [PACKET NUMBER (8)]
//! [FRAME COUNT (2)] [FRAMES (variable)] [CHECKSUM (8)]
//! ```
//!
//! Stream frames are length-prefixed with a u32; ACK frames carry the
//! largest acknowledged number, the ACK delay in microseconds, and the
//! full gap/start/end range sequence. All integers are little-endian and
//! packet numbers are fixed-width 64-bit.

use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_64;

use super::{
    AckFrame, AckRange, CHECKSUM_SIZE, Error, Frame, Header, LongPacketType, MAGIC_NUMBER,
    MIN_PACKET_SIZE, Packet, Result, StreamFrame,
};

/// Maximum stream-frame payload the u32 length prefix can describe.
const MAX_STREAM_DATA: usize = u32::MAX as usize;

/// Encode a packet to bytes, appending the xxh3-64 checksum trailer.
///
/// # Errors
///
/// Returns an error if the packet carries no frames, a stream frame
/// exceeds the u32 length prefix, or the frame count exceeds u16.
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    if packet.frames().is_empty() {
        return Err(Error::EmptyPacket);
    }
    let frame_count = u16::try_from(packet.frames().len()).map_err(|_| Error::PayloadTooLarge {
        size: packet.frames().len(),
        max: usize::from(u16::MAX),
    })?;

    let mut bytes = Vec::with_capacity(encoded_len_upper_bound(packet));
    bytes.extend_from_slice(&MAGIC_NUMBER.to_le_bytes());
    match packet.header() {
        Header::Long {
            kind,
            packet_number,
        } => {
            bytes.push(Header::FORM_LONG);
            bytes.push(*kind as u8);
            bytes.extend_from_slice(&packet_number.to_le_bytes());
        }
        Header::Short { packet_number } => {
            bytes.push(Header::FORM_SHORT);
            bytes.extend_from_slice(&packet_number.to_le_bytes());
        }
    }
    bytes.extend_from_slice(&frame_count.to_le_bytes());

    for frame in packet.frames() {
        match frame {
            Frame::Stream(stream) => encode_stream(stream, &mut bytes)?,
            Frame::Ack(ack) => encode_ack(ack, &mut bytes),
        }
    }

    let checksum = xxh3_64(&bytes);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    Ok(bytes)
}

/// Decode a packet from bytes.
///
/// # Errors
///
/// Returns an error if the buffer is truncated, the magic number or
/// checksum do not match, or any header/frame tag is unknown.
pub fn decode(bytes: Bytes) -> Result<Packet> {
    if bytes.len() < MIN_PACKET_SIZE {
        return Err(Error::BufferTooSmall {
            needed: MIN_PACKET_SIZE,
            got: bytes.len(),
        });
    }

    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != MAGIC_NUMBER {
        return Err(Error::InvalidMagic { found: magic });
    }

    let checksum_offset = bytes.len() - CHECKSUM_SIZE;
    let stored_checksum = u64::from_le_bytes(bytes[checksum_offset..].try_into().unwrap());
    let calculated_checksum = xxh3_64(&bytes[..checksum_offset]);
    if stored_checksum != calculated_checksum {
        return Err(Error::ChecksumMismatch {
            expected: calculated_checksum,
            found: stored_checksum,
        });
    }

    let mut cursor = Cursor::new(&bytes, 4, checksum_offset);
    let header = match cursor.read_u8()? {
        Header::FORM_LONG => {
            let kind = LongPacketType::from_byte(cursor.read_u8()?)?;
            Header::Long {
                kind,
                packet_number: cursor.read_u64()?,
            }
        }
        Header::FORM_SHORT => Header::Short {
            packet_number: cursor.read_u64()?,
        },
        form => return Err(Error::UnknownHeaderForm { form }),
    };

    let frame_count = cursor.read_u16()? as usize;
    if frame_count == 0 {
        return Err(Error::EmptyPacket);
    }
    let mut frames = Vec::with_capacity(frame_count.min(64));
    for _ in 0..frame_count {
        frames.push(decode_frame(&mut cursor)?);
    }

    Ok(Packet::new(header, frames))
}

fn encode_stream(stream: &StreamFrame, out: &mut Vec<u8>) -> Result<()> {
    if stream.len() > MAX_STREAM_DATA {
        return Err(Error::PayloadTooLarge {
            size: stream.len(),
            max: MAX_STREAM_DATA,
        });
    }
    out.push(Frame::TYPE_STREAM);
    out.extend_from_slice(&(stream.len() as u32).to_le_bytes());
    out.extend_from_slice(stream.data());
    Ok(())
}

fn encode_ack(ack: &AckFrame, out: &mut Vec<u8>) {
    out.push(Frame::TYPE_ACK);
    out.extend_from_slice(&ack.largest().to_le_bytes());
    out.extend_from_slice(&ack.ack_delay_micros().to_le_bytes());
    let range_count = u16::try_from(ack.ranges().len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&range_count.to_le_bytes());
    for range in ack.ranges().iter().take(usize::from(range_count)) {
        out.extend_from_slice(&range.gap().to_le_bytes());
        out.extend_from_slice(&range.start().to_le_bytes());
        out.extend_from_slice(&range.end().to_le_bytes());
    }
}

fn decode_frame(cursor: &mut Cursor<'_>) -> Result<Frame> {
    match cursor.read_u8()? {
        Frame::TYPE_STREAM => {
            let len = cursor.read_u32()? as usize;
            let data = cursor.read_bytes(len)?;
            Ok(Frame::Stream(StreamFrame::new(data)))
        }
        Frame::TYPE_ACK => {
            let largest = cursor.read_u64()?;
            let ack_delay_micros = cursor.read_u64()?;
            let range_count = cursor.read_u16()? as usize;
            let mut ranges = Vec::with_capacity(range_count.min(64));
            for _ in 0..range_count {
                let gap = cursor.read_u64()?;
                let start = cursor.read_u64()?;
                let end = cursor.read_u64()?;
                ranges.push(AckRange::new(gap, start, end)?);
            }
            Ok(Frame::Ack(AckFrame::new(largest, ack_delay_micros, ranges)?))
        }
        frame_type => Err(Error::UnknownFrameType { frame_type }),
    }
}

fn encoded_len_upper_bound(packet: &Packet) -> usize {
    let frames: usize = packet
        .frames()
        .iter()
        .map(|frame| match frame {
            Frame::Stream(stream) => 1 + 4 + stream.len(),
            Frame::Ack(ack) => 1 + 8 + 8 + 2 + 24 * ack.ranges().len(),
        })
        .sum();
    4 + 2 + 8 + 2 + frames + CHECKSUM_SIZE
}

/// Bounds-checked reader over the decoded region of a packet.
struct Cursor<'a> {
    bytes: &'a Bytes,
    offset: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a Bytes, offset: usize, end: usize) -> Self {
        Self { bytes, offset, end }
    }

    fn ensure(&self, len: usize) -> Result<()> {
        if self.offset + len > self.end {
            return Err(Error::BufferTooSmall {
                needed: self.offset + len,
                got: self.end,
            });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let value = self.bytes[self.offset];
        self.offset += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        let value = u16::from_le_bytes(self.bytes[self.offset..self.offset + 2].try_into().unwrap());
        self.offset += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        let value = u32::from_le_bytes(self.bytes[self.offset..self.offset + 4].try_into().unwrap());
        self.offset += 4;
        Ok(value)
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        let value = u64::from_le_bytes(self.bytes[self.offset..self.offset + 8].try_into().unwrap());
        self.offset += 8;
        Ok(value)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        let slice = self.bytes.slice(self.offset..self.offset + len);
        self.offset += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ack() -> AckFrame {
        let ranges = vec![
            AckRange::new(0, 0, 3).unwrap(),
            AckRange::new(1, 5, 9).unwrap(),
        ];
        AckFrame::new(9, 250, ranges).unwrap()
    }

    #[test]
    fn roundtrip_short_data_packet() {
        let packet = Packet::new(
            Header::Short { packet_number: 17 },
            vec![
                Frame::Stream(StreamFrame::new(&b"hello qrt"[..])),
                Frame::Ack(sample_ack()),
            ],
        );
        let encoded = encode(&packet).unwrap();
        let decoded = decode(Bytes::from(encoded)).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn roundtrip_long_handshake_packet() {
        let packet = Packet::new(
            Header::Long {
                kind: LongPacketType::Handshake,
                packet_number: 2,
            },
            vec![Frame::Stream(StreamFrame::new(&b"Finished"[..]))],
        );
        let encoded = encode(&packet).unwrap();
        let decoded = decode(Bytes::from(encoded)).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.header().long_type(), Some(LongPacketType::Handshake));
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let packet = Packet::new(
            Header::Short { packet_number: 1 },
            vec![Frame::Stream(StreamFrame::new(&b"x"[..]))],
        );
        let mut encoded = encode(&packet).unwrap();
        encoded[0..4].copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        assert!(matches!(
            decode(Bytes::from(encoded)),
            Err(Error::InvalidMagic { .. })
        ));
    }

    #[test]
    fn decode_rejects_corrupted_payload() {
        let packet = Packet::new(
            Header::Short { packet_number: 1 },
            vec![Frame::Stream(StreamFrame::new(&b"payload"[..]))],
        );
        let mut encoded = encode(&packet).unwrap();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xFF;
        assert!(matches!(
            decode(Bytes::from(encoded)),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        assert!(matches!(
            decode(Bytes::from(vec![0u8; 4])),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_frame_type() {
        let packet = Packet::new(
            Header::Short { packet_number: 1 },
            vec![Frame::Stream(StreamFrame::new(&b"x"[..]))],
        );
        let mut encoded = encode(&packet).unwrap();
        // Frame tag sits right after the short prelude; fix up the checksum.
        encoded[super::super::SHORT_PRELUDE_SIZE] = 0x7F;
        let body_len = encoded.len() - CHECKSUM_SIZE;
        let checksum = xxh3_64(&encoded[..body_len]);
        encoded[body_len..].copy_from_slice(&checksum.to_le_bytes());
        assert!(matches!(
            decode(Bytes::from(encoded)),
            Err(Error::UnknownFrameType { frame_type: 0x7F })
        ));
    }

    #[test]
    fn encode_rejects_empty_packet() {
        let packet = Packet::new(Header::Short { packet_number: 0 }, Vec::new());
        assert!(matches!(encode(&packet), Err(Error::EmptyPacket)));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn header_strategy() -> impl Strategy<Value = Header> {
            prop_oneof![
                any::<u64>().prop_map(|packet_number| Header::Short { packet_number }),
                (0u8..3, any::<u64>()).prop_map(|(kind, packet_number)| Header::Long {
                    kind: match kind {
                        0 => LongPacketType::Initial,
                        1 => LongPacketType::Handshake,
                        _ => LongPacketType::Close,
                    },
                    packet_number,
                }),
            ]
        }

        fn ack_frame_strategy() -> impl Strategy<Value = AckFrame> {
            (
                prop::collection::vec((0u64..64, 1u64..32), 1..8),
                any::<u32>(),
            )
                .prop_map(|(spans, delay)| {
                    let mut ranges = Vec::with_capacity(spans.len());
                    let mut next_start = 0u64;
                    for (idx, (gap, len)) in spans.into_iter().enumerate() {
                        let gap = if idx == 0 { 0 } else { gap.max(1) };
                        let start = next_start + gap;
                        let end = start + len - 1;
                        ranges.push(AckRange::new(gap, start, end).unwrap());
                        next_start = end + 1;
                    }
                    let largest = ranges.last().unwrap().end();
                    AckFrame::new(largest, u64::from(delay), ranges).unwrap()
                })
        }

        fn frame_strategy() -> impl Strategy<Value = Frame> {
            prop_oneof![
                prop::collection::vec(any::<u8>(), 0..2048)
                    .prop_map(|data| Frame::Stream(StreamFrame::new(data))),
                ack_frame_strategy().prop_map(Frame::Ack),
            ]
        }

        proptest! {
            /// Serialize/deserialize is identity on packet content.
            #[test]
            fn prop_roundtrip_is_identity(
                header in header_strategy(),
                frames in prop::collection::vec(frame_strategy(), 1..5),
            ) {
                let packet = Packet::new(header, frames);
                let encoded = encode(&packet).unwrap();
                let decoded = decode(Bytes::from(encoded)).unwrap();
                prop_assert_eq!(decoded, packet);
            }

            /// Corrupting any pre-checksum byte is detected.
            #[test]
            fn prop_corruption_detected(
                frames in prop::collection::vec(frame_strategy(), 1..4),
                offset_ratio in 0.0f64..1.0,
                corrupt_value in 1u8..=255,
            ) {
                let packet = Packet::new(Header::Short { packet_number: 42 }, frames);
                let mut encoded = encode(&packet).unwrap();
                let body_len = encoded.len() - CHECKSUM_SIZE;
                let offset = ((body_len as f64) * offset_ratio) as usize;
                let offset = offset.min(body_len - 1);
                encoded[offset] ^= corrupt_value;
                prop_assert!(decode(Bytes::from(encoded)).is_err());
            }
        }
    }
}
