//! Frames carried over the physical channels.
//!
//! Layout: `magic(2) | kind(1) | seq(2) | len(4) | hcheck(2) | payload | crc32(4)`.
//! `hcheck` is the low half of a CRC over `kind`, `seq` and `len`, so a
//! damaged length is caught before the decoder waits on it. The trailing CRC
//! covers everything from `kind` through the payload. The decoder
//! resynchronizes on the magic after corruption instead of failing the
//! stream, counting what it had to discard.
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const FRAME_MAGIC: [u8; 2] = [0xB5, 0x1C];
pub const FRAME_HEADER_LEN: usize = 2 + 1 + 2 + 4 + 2;
pub const FRAME_TRAILER_LEN: usize = 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Data = 1,
    Sync = 2,
    Auth = 3,
    Control = 4,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Data),
            2 => Some(FrameKind::Sync),
            3 => Some(FrameKind::Auth),
            4 => Some(FrameKind::Control),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: FrameKind,
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn new(kind: FrameKind, seq: u16, payload: Vec<u8>) -> Self {
        Self { kind, seq, payload }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len() + FRAME_TRAILER_LEN
    }
}

/// Streaming encoder/decoder for [`RawFrame`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
    corrupt: u64,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            corrupt: 0,
        }
    }

    /// Returns and resets the count of discarded corrupt frame starts.
    pub fn take_corrupt(&mut self) -> u64 {
        std::mem::take(&mut self.corrupt)
    }

    /// One-shot encode into a fresh buffer.
    pub fn encode_to_vec(&mut self, frame: RawFrame) -> io::Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        self.encode(frame, &mut buf)?;
        Ok(buf.to_vec())
    }

    fn skip_to_next_magic(&mut self, src: &mut BytesMut) {
        let next = src[1..]
            .windows(2)
            .position(|w| w == FRAME_MAGIC)
            .map(|pos| pos + 1)
            .unwrap_or_else(|| {
                // keep a trailing first magic byte, it may start the next frame
                if src.last() == Some(&FRAME_MAGIC[0]) {
                    src.len() - 1
                } else {
                    src.len()
                }
            });
        src.advance(next.max(1));
    }
}

fn header_check(kind: u8, seq: u16, len: u32) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(&seq.to_be_bytes());
    hasher.update(&len.to_be_bytes());
    (hasher.finalize() & 0xffff) as u16
}

fn checksum(kind: u8, seq: u16, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(&seq.to_be_bytes());
    hasher.update(&(payload.len() as u32).to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}

impl Encoder<RawFrame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > self.max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame payload {} exceeds {}", frame.payload.len(), self.max_payload),
            ));
        }
        dst.reserve(frame.encoded_len());
        dst.put_slice(&FRAME_MAGIC);
        dst.put_u8(frame.kind as u8);
        dst.put_u16(frame.seq);
        let len = frame.payload.len() as u32;
        dst.put_u32(len);
        dst.put_u16(header_check(frame.kind as u8, frame.seq, len));
        dst.put_slice(&frame.payload);
        dst.put_u32(checksum(frame.kind as u8, frame.seq, &frame.payload));
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < FRAME_MAGIC.len() {
                return Ok(None);
            }
            if src[..2] != FRAME_MAGIC {
                self.skip_to_next_magic(src);
                continue;
            }
            if src.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let kind_byte = src[2];
            let seq = u16::from_be_bytes([src[3], src[4]]);
            let wire_len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]);
            let hcheck = u16::from_be_bytes([src[9], src[10]]);
            if header_check(kind_byte, seq, wire_len) != hcheck {
                self.corrupt += 1;
                self.skip_to_next_magic(src);
                continue;
            }
            let Some(kind) = FrameKind::from_u8(kind_byte) else {
                self.corrupt += 1;
                self.skip_to_next_magic(src);
                continue;
            };
            let len = wire_len as usize;
            if len > self.max_payload {
                self.corrupt += 1;
                self.skip_to_next_magic(src);
                continue;
            }
            let total = FRAME_HEADER_LEN + len + FRAME_TRAILER_LEN;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            let payload = &src[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
            let crc_at = FRAME_HEADER_LEN + len;
            let expected = u32::from_be_bytes([
                src[crc_at],
                src[crc_at + 1],
                src[crc_at + 2],
                src[crc_at + 3],
            ]);
            if checksum(kind_byte, seq, payload) != expected {
                self.corrupt += 1;
                self.skip_to_next_magic(src);
                continue;
            }
            let payload = payload.to_vec();
            src.advance(total);
            return Ok(Some(RawFrame { kind, seq, payload }));
        }
    }
}
