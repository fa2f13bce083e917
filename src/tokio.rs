// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! tokio-based interleaved RTSP connection.
//!
//! One byte stream carries both RTSP control text and RTP/RTCP records
//! framed as `$ <channel> <u16 length> <payload>`. The read and write halves
//! are split so the read loop can own the former while the keep-alive and
//! teardown paths share the latter.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use rtsp_types::{Data, Message};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use url::Host;

use crate::{Error, ErrorInt, RtspMessageContext};

use super::{ConnectionContext, ReceivedMessage};

/// Marker byte of an interleaved binary record.
const INTERLEAVED_MARKER: u8 = b'$';

/// First byte of `RTSP/1.0 ...` and therefore of every control response.
const RESPONSE_MARKER: u8 = b'R';

/// Valid payload lengths of an interleaved record. Anything shorter can't
/// hold an RTP header.
const MIN_RECORD_LEN: usize = 12;
const MAX_RECORD_LEN: usize = 65535;

/// Upper bound on a buffered textual block (headers plus body). Real
/// DESCRIBE responses are a few KiB.
const MAX_CONTROL_BLOCK_LEN: usize = 64 * 1024;

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Dials `host:port` over TCP.
pub(crate) async fn dial(host: Host<&str>, port: u16) -> Result<TcpStream, std::io::Error> {
    let stream = match host {
        Host::Domain(h) => TcpStream::connect((h, port)).await,
        Host::Ipv4(h) => TcpStream::connect((h, port)).await,
        Host::Ipv6(h) => TcpStream::connect((h, port)).await,
    }?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Splits `stream` into framed halves sharing `ctx`.
pub(crate) fn split<S>(stream: S, ctx: ConnectionContext) -> (ConnectionReader, ConnectionWriter)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (r, w) = tokio::io::split(stream);
    let r: BoxedRead = Box::new(r);
    let w: BoxedWrite = Box::new(w);
    (
        ConnectionReader(FramedRead::new(r, Codec { ctx, read_pos: 0 })),
        ConnectionWriter(FramedWrite::new(w, Codec { ctx, read_pos: 0 })),
    )
}

/// The receiving half: yields framed units in stream order.
pub(crate) struct ConnectionReader(FramedRead<BoxedRead, Codec>);

impl ConnectionReader {
    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.0.decoder().ctx
    }

    pub(crate) fn eof_ctx(&self) -> RtspMessageContext {
        RtspMessageContext::at(self.0.decoder().read_pos + self.0.read_buffer().remaining() as u64)
    }

    /// Returns the next unit, or `None` on clean EOF between units.
    pub(crate) async fn next(&mut self) -> Option<Result<ReceivedMessage, Error>> {
        let r = self.0.next().await?;
        Some(r.map_err(|e| {
            wrap!(match e {
                CodecError::IoError(source) => ErrorInt::RtspReadError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: self.eof_ctx(),
                    source,
                },
                CodecError::ParseError { description, pos } => ErrorInt::RtspFramingError {
                    conn_ctx: *self.ctx(),
                    msg_ctx: RtspMessageContext::at(pos),
                    description,
                },
            })
        }))
    }
}

/// The sending half. Only requests are ever written.
pub(crate) struct ConnectionWriter(FramedWrite<BoxedWrite, Codec>);

impl ConnectionWriter {
    pub(crate) fn ctx(&self) -> &ConnectionContext {
        &self.0.encoder().ctx
    }

    fn wrap_write_err(&self, e: CodecError) -> Error {
        match e {
            CodecError::IoError(source) => wrap!(ErrorInt::WriteError {
                conn_ctx: *self.ctx(),
                source,
            }),
            CodecError::ParseError { description, .. } => {
                wrap!(ErrorInt::Internal(description.into()))
            }
        }
    }

    /// Serializes and flushes one message.
    pub(crate) async fn send(&mut self, msg: Message<Bytes>) -> Result<(), Error> {
        match self.0.send(msg).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.wrap_write_err(e)),
        }
    }

    /// Flushes and shuts down the write direction, signalling EOF to the peer.
    pub(crate) async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        self.0.get_mut().shutdown().await
    }
}

/// Encodes requests and decodes interleaved records and control blocks.
struct Codec {
    ctx: ConnectionContext,

    /// Number of bytes read and processed (drained from the input buffer).
    read_pos: u64,
}

/// An intermediate error type that exists because the framed types expect
/// the codec's error type to implement `From<std::io::Error>`, and [`Error`]
/// takes additional context.
#[derive(Debug)]
enum CodecError {
    IoError(std::io::Error),
    ParseError { description: String, pos: u64 },
}

impl std::convert::From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::IoError(e)
    }
}

impl Codec {
    fn desync(&self, src: &[u8], what: &str) -> CodecError {
        CodecError::ParseError {
            description: format!(
                "{what}; buffered:\n{:#?}",
                crate::hex::LimitedHex::new(src, 128),
            ),
            pos: self.read_pos,
        }
    }

    fn parse_data(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let channel_id = src[1];
        let payload_len = usize::from(u16::from_be_bytes([src[2], src[3]]));
        if !(MIN_RECORD_LEN..=MAX_RECORD_LEN).contains(&payload_len) {
            return Err(self.desync(
                src,
                &format!("interleaved record on channel {channel_id} has invalid length {payload_len}"),
            ));
        }
        let len = 4 + payload_len;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let mut msg = src.split_to(len);
        msg.advance(4);
        Ok(Some((
            len,
            Message::Data(Data::new(channel_id, msg.freeze())),
        )))
    }

    fn parse_control(&self, src: &mut BytesMut) -> Result<Option<(usize, Message<Bytes>)>, CodecError> {
        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => {
                return Err(self.desync(src, "Invalid RTSP control block"));
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => {
                if src.len() > MAX_CONTROL_BLOCK_LEN {
                    return Err(self.desync(src, "RTSP control block exceeds size limit"));
                }
                return Ok(None);
            }
        };

        // The parsed message borrows `src`, which must then be split. Detach
        // the body first, then re-attach it as a `Bytes` slice of the split
        // buffer to avoid a copy.
        let msg = match msg {
            Message::Request(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                Message::Request(msg.replace_body(take_body(src, len, body_range)))
            }
            Message::Response(msg) => {
                let body_range = crate::as_range(src, msg.body());
                let msg = msg.replace_body(rtsp_types::Empty);
                Message::Response(msg.replace_body(take_body(src, len, body_range)))
            }
            Message::Data(_) => return Err(self.desync(src, "interleaved data in control block")),
        };
        Ok(Some((len, msg)))
    }
}

/// Advances `src` past a `len`-byte message, returning its body.
fn take_body(src: &mut BytesMut, len: usize, body_range: Option<std::ops::Range<usize>>) -> Bytes {
    match body_range {
        Some(r) => {
            let mut raw_msg = src.split_to(len);
            raw_msg.advance(r.start);
            raw_msg.truncate(r.len());
            raw_msg.freeze()
        }
        None => {
            src.advance(len);
            Bytes::new()
        }
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let first = src.first().copied();
        let parsed = match first {
            None => return Ok(None),
            Some(INTERLEAVED_MARKER) => self.parse_data(src)?,
            Some(RESPONSE_MARKER) => self.parse_control(src)?,
            Some(b) => {
                return Err(self.desync(src, &format!("unexpected leading byte 0x{b:02x}")));
            }
        };
        let Some((len, msg)) = parsed else {
            return Ok(None);
        };
        let msg = ReceivedMessage {
            msg,
            ctx: RtspMessageContext::at(self.read_pos),
        };
        self.read_pos += len as u64;
        Ok(Some(msg))
    }
}

impl tokio_util::codec::Encoder<rtsp_types::Message<Bytes>> for Codec {
    type Error = CodecError;

    fn encode(
        &mut self,
        item: rtsp_types::Message<Bytes>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        item.write(&mut dst.writer()).map_err(|e| CodecError::ParseError {
            description: format!("unable to serialize message: {e:?}"),
            pos: self.read_pos,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::codec::Decoder;

    use super::*;

    fn codec() -> Codec {
        Codec {
            ctx: ConnectionContext::dummy(),
            read_pos: 0,
        }
    }

    fn record(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![b'$', channel];
        v.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn interleaved_record() {
        let mut codec = codec();
        let payload = [0x80u8; 16];
        let mut buf = BytesMut::from(&record(2, &payload)[..]);
        buf.extend_from_slice(b"RTSP");
        let m = codec.decode(&mut buf).unwrap().unwrap();
        match m.msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 2);
                assert_eq!(&d.into_body()[..], &payload[..]);
            }
            o => panic!("unexpected {o:?}"),
        }
        assert_eq!(&buf[..], b"RTSP");
        assert_eq!(codec.read_pos, 20);
    }

    /// One interleaved RTP record carrying a single 200-byte ADTS-framed AAC
    /// frame becomes one 193-byte access unit.
    #[test]
    fn interleaved_aac_record() {
        use std::sync::Arc;
        use std::time::Duration;

        use crate::codec::{DefaultParameterSetDecoder, Depacketizer, MediaKind, OpusFraming};
        use crate::rtp::{RawPacket, RawPacketBuilder, ReceivedPacketBuilder};

        // AU-headers-length of 16 bits, then one AU header with size 200.
        let mut aac = vec![0x00, 0x10, 0x06, 0x40];
        aac.extend_from_slice(b"\xff\xf1\x50\x80\x19\x1f\xfc");
        aac.extend((0..193u8).map(|i| i.wrapping_mul(7)));
        let (pkt, _) = RawPacketBuilder {
            sequence_number: 0x1234,
            timestamp: 48_000,
            payload_type: 97,
            ssrc: 0xdcc4_a0d8,
            mark: true,
        }
        .build(aac.iter().copied())
        .unwrap();

        let mut codec = codec();
        let mut buf = BytesMut::from(&record(0, &pkt.0)[..]);
        let body = match codec.decode(&mut buf).unwrap().unwrap().msg {
            Message::Data(d) => {
                assert_eq!(d.channel_id(), 0);
                d.into_body()
            }
            o => panic!("unexpected {o:?}"),
        };
        assert!(buf.is_empty());
        assert_eq!(body.len(), 12 + 4 + 200);

        let (raw, range) = RawPacket::new(body).unwrap();
        let pkt = ReceivedPacketBuilder {
            track: 0,
            sequence_number: raw.sequence_number(),
            timestamp: raw.timestamp(),
            payload_type: raw.payload_type(),
            ssrc: raw.ssrc(),
            mark: raw.mark(),
            loss: 0,
        }
        .build(raw.0[usize::from(range.start)..usize::from(range.end)].iter().copied())
        .unwrap();
        let mut d = Depacketizer::new(
            0,
            MediaKind::Aac,
            48_000,
            None,
            Arc::new(DefaultParameterSetDecoder),
            OpusFraming::default(),
        )
        .unwrap();
        d.push(pkt).unwrap();
        let au = d.pull().unwrap();
        assert!(d.pull().is_none());
        assert_eq!(au.data.len(), 193);
        assert_eq!(&au.data[..], &aac[4 + 7..]);
        assert_eq!(au.duration, Duration::from_nanos(21_333_333));
    }

    #[test]
    fn partial_record_waits() {
        let mut codec = codec();
        let full = record(0, &[0u8; 20]);
        let mut buf = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[3..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[10..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn undersized_record_is_desync() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&record(0, &[0u8; 11])[..]);
        match codec.decode(&mut buf) {
            Err(CodecError::ParseError { description, .. }) => {
                assert!(description.contains("invalid length 11"), "{description}")
            }
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn unexpected_leading_byte_is_desync() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"\r\n$\x00\x00\x10"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::ParseError { .. })
        ));
    }

    #[test]
    fn response_with_body() {
        let mut codec = codec();
        let mut buf = BytesMut::from(
            &b"RTSP/1.0 200 OK\r\n\
               CSeq: 2\r\n\
               Content-Length: 4\r\n\
               \r\n\
               v=0\n$\x00"[..],
        );
        let m = codec.decode(&mut buf).unwrap().unwrap();
        match m.msg {
            Message::Response(r) => assert_eq!(&r.body()[..], b"v=0\n"),
            o => panic!("unexpected {o:?}"),
        }
        assert_eq!(&buf[..], b"$\x00");
    }

    #[test]
    fn incomplete_response_waits() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"RTSP/1.0 200 OK\r\nCSeq: 2\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\r\n");
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn encode_request() {
        let mut codec = codec();
        let req = rtsp_types::Request::builder(rtsp_types::Method::Options, rtsp_types::Version::V1_0)
            .request_uri(url::Url::parse("rtsp://example.com/stream").unwrap())
            .header(rtsp_types::headers::CSEQ, "1")
            .build(Bytes::new());
        let mut dst = BytesMut::new();
        tokio_util::codec::Encoder::encode(&mut codec, Message::Request(req), &mut dst).unwrap();
        let s = std::str::from_utf8(&dst).unwrap();
        assert!(s.starts_with("OPTIONS rtsp://example.com/stream RTSP/1.0\r\n"), "{s}");
        assert!(s.contains("CSeq: 1\r\n"), "{s}");
    }
}
