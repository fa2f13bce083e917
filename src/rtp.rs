// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles RTP data as described in
//! [RFC 3550 section 5.1](https://datatracker.ietf.org/doc/html/rfc3550#section-5.1).

use std::convert::TryFrom;
use std::ops::Range;

use bytes::{Buf, Bytes};

/// The minimum length of an RTP header (no CSRCs or extensions).
const MIN_HEADER_LEN: u16 = 12;

/// RTCP packet types which share the second byte with RTP's marker+payload type.
const RTCP_SENDER_REPORT: u8 = 200;
const RTCP_RECEIVER_REPORT: u8 = 201;

/// Returns true if an interleaved record is an RTCP sender or receiver report.
///
/// Servers occasionally send RTCP on the RTP channel, so the channel number
/// alone isn't enough.
pub(crate) fn is_rtcp(data: &[u8]) -> bool {
    matches!(
        data.get(1),
        Some(&RTCP_SENDER_REPORT) | Some(&RTCP_RECEIVER_REPORT)
    )
}

/// Raw packet without state-specific interpretation or metadata.
///
/// Validation happens once at construction; afterward the accessors can index
/// the header fields without further checks.
pub(crate) struct RawPacket(
    /// Full packet data, including headers.
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                           timestamp                           |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |           synchronization source (SSRC) identifier            |
    /// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
    /// |            contributing source (CSRC) identifiers             |
    /// |                             ....                              |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |  defined by profile           |  extension length in words    |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    pub Bytes,
);

impl RawPacket {
    /// Validates an RTP packet, returning a wrapper and the payload range
    /// (CSRCs, header extension, and padding excluded).
    pub fn new(data: Bytes) -> Result<(Self, Range<u16>), RawPacketError> {
        // Interleaved records are bounded by their u16 length field.
        let len = match u16::try_from(data.len()) {
            Ok(l) => l,
            Err(_) => {
                return Err(RawPacketError {
                    reason: "too long",
                    data,
                })
            }
        };
        if len < MIN_HEADER_LEN {
            return Err(RawPacketError {
                reason: "too short",
                data,
            });
        }
        if (data[0] & 0b1100_0000) != 2 << 6 {
            return Err(RawPacketError {
                reason: "must be version 2",
                data,
            });
        }
        let has_padding = (data[0] & 0b0010_0000) != 0;
        let has_extension = (data[0] & 0b0001_0000) != 0;
        let csrc_count = data[0] & 0b0000_1111;
        let csrc_end = MIN_HEADER_LEN + (4 * u16::from(csrc_count));
        let payload_start = if has_extension {
            if len < csrc_end + 4 {
                return Err(RawPacketError {
                    reason: "extension is after end of packet",
                    data,
                });
            }
            let ext = usize::from(csrc_end);
            let extension_words = u16::from_be_bytes([data[ext + 2], data[ext + 3]]);
            match extension_words
                .checked_mul(4)
                .and_then(|l| l.checked_add(csrc_end + 4))
            {
                Some(s) => s,
                None => {
                    return Err(RawPacketError {
                        reason: "extension extends beyond maximum packet size",
                        data,
                    })
                }
            }
        } else {
            csrc_end
        };
        if len < payload_start {
            return Err(RawPacketError {
                reason: "payload start is after end of packet",
                data,
            });
        }
        let payload_end = if has_padding {
            if len == payload_start {
                return Err(RawPacketError {
                    reason: "missing padding",
                    data,
                });
            }
            let padding_len = u16::from(data[data.len() - 1]);
            if padding_len == 0 {
                return Err(RawPacketError {
                    reason: "invalid padding length 0",
                    data,
                });
            }
            match len.checked_sub(padding_len) {
                Some(e) if e >= payload_start => e,
                _ => {
                    return Err(RawPacketError {
                        reason: "padding larger than payload",
                        data,
                    })
                }
            }
        } else {
            len
        };
        Ok((Self(data), payload_start..payload_end))
    }

    #[inline]
    pub fn mark(&self) -> bool {
        (self.0[1] & 0b1000_0000) != 0
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.0[1] & 0b0111_1111
    }

    #[inline]
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]])
    }
}

#[derive(Debug)]
#[doc(hidden)]
pub struct RawPacketError {
    pub reason: &'static str,
    pub data: Bytes,
}

pub(crate) struct RawPacketBuilder {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
}

impl RawPacketBuilder {
    pub(crate) fn build<P: IntoIterator<Item = u8>>(
        self,
        payload: P,
    ) -> Result<(RawPacket, Range<u16>), &'static str> {
        if self.payload_type >= 0x80 {
            return Err("payload type too large");
        }
        let data: Bytes = [
            2 << 6, // version=2, no padding, no extensions, no CSRCs.
            if self.mark { 0b1000_0000 } else { 0 } | self.payload_type,
        ]
        .into_iter()
        .chain(self.sequence_number.to_be_bytes())
        .chain(self.timestamp.to_be_bytes())
        .chain(self.ssrc.to_be_bytes())
        .chain(payload)
        .collect();
        let len = u16::try_from(data.len()).map_err(|_| "payload too long")?;
        Ok((RawPacket(data), MIN_HEADER_LEN..len))
    }
}

/// A received, validated RTP packet, tagged with the track it belongs to.
pub struct ReceivedPacket {
    pub(crate) track: usize,
    pub(crate) raw: RawPacket,
    pub(crate) payload_range: Range<u16>,

    /// Number of packets missing immediately before this one, per sequence numbers.
    pub(crate) loss: u16,
}

impl std::fmt::Debug for ReceivedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedPacket")
            .field("track", &self.track)
            .field("timestamp", &self.raw.timestamp())
            .field("ssrc", &self.raw.ssrc())
            .field("sequence_number", &self.raw.sequence_number())
            .field("mark", &self.raw.mark())
            .field("payload", &crate::hex::LimitedHex::head(self.payload()))
            .finish()
    }
}

impl ReceivedPacket {
    #[inline]
    pub fn timestamp(&self) -> u32 {
        self.raw.timestamp()
    }

    #[inline]
    pub fn mark(&self) -> bool {
        self.raw.mark()
    }

    #[inline]
    pub fn track(&self) -> usize {
        self.track
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.raw.ssrc()
    }

    #[inline]
    pub fn sequence_number(&self) -> u16 {
        self.raw.sequence_number()
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.raw.payload_type()
    }

    /// Returns only the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.raw.0[usize::from(self.payload_range.start)..usize::from(self.payload_range.end)]
    }

    #[inline]
    pub fn loss(&self) -> u16 {
        self.loss
    }

    /// Consumes the packet and returns the payload without copying.
    #[inline]
    pub fn into_payload_bytes(self) -> Bytes {
        let mut data = self.raw.0;
        data.truncate(usize::from(self.payload_range.end));
        data.advance(usize::from(self.payload_range.start));
        data
    }
}

/// Testing API; exposed for benchmarks.
#[doc(hidden)]
pub struct ReceivedPacketBuilder {
    pub track: usize,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mark: bool,
    pub loss: u16,
}

impl ReceivedPacketBuilder {
    pub fn build<P: IntoIterator<Item = u8>>(
        self,
        payload: P,
    ) -> Result<ReceivedPacket, &'static str> {
        let (raw, payload_range) = RawPacketBuilder {
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
            payload_type: self.payload_type,
            ssrc: self.ssrc,
            mark: self.mark,
        }
        .build(payload)?;
        Ok(ReceivedPacket {
            track: self.track,
            raw,
            payload_range,
            loss: self.loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_header() {
        let data = Bytes::from_static(b"\x80\x60\x12\x34\x00\x00\x00\x10\xde\xad\xbe\xefpayload");
        let (pkt, range) = RawPacket::new(data).unwrap();
        assert_eq!(pkt.sequence_number(), 0x1234);
        assert_eq!(pkt.timestamp(), 16);
        assert_eq!(pkt.payload_type(), 96);
        assert!(!pkt.mark());
        assert_eq!(&pkt.0[usize::from(range.start)..usize::from(range.end)], b"payload");
    }

    #[test]
    fn csrc_extension_and_padding() {
        // One CSRC, a one-word extension, and two bytes of padding.
        let data = Bytes::from_static(
            b"\xb1\xe0\x00\x01\x00\x00\x00\x00\x00\x00\x00\x01\
              \xaa\xaa\xaa\xaa\
              \xbe\xde\x00\x01\x11\x22\x33\x44\
              nal\x00\x02",
        );
        let (pkt, range) = RawPacket::new(data).unwrap();
        assert!(pkt.mark());
        assert_eq!(&pkt.0[usize::from(range.start)..usize::from(range.end)], b"nal");
    }

    #[test]
    fn extension_past_end() {
        let data = Bytes::from_static(b"\x90\x60\x00\x01\x00\x00\x00\x00\x00\x00\x00\x01\xbe\xde\x00\x04\x00");
        let e = RawPacket::new(data).err().unwrap();
        assert_eq!(e.reason, "payload start is after end of packet");
    }

    #[test]
    fn bad_padding() {
        let data = Bytes::from_static(b"\xa0\x60\x00\x01\x00\x00\x00\x00\x00\x00\x00\x01\x01\x09");
        let e = RawPacket::new(data).err().unwrap();
        assert_eq!(e.reason, "padding larger than payload");
    }

    #[test]
    fn rtcp_detection() {
        assert!(is_rtcp(b"\x80\xc8\x00\x06"));
        assert!(is_rtcp(b"\x81\xc9\x00\x07"));
        assert!(!is_rtcp(b"\x80\x60\x00\x01"));
        assert!(!is_rtcp(b"\x80"));
    }
}
