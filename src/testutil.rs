// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use bytes::Bytes;

use crate::rtp::{ReceivedPacket, ReceivedPacketBuilder};

/// Sends `log` output to the test harness; set `RUST_LOG` to see it.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn response(raw: &'static [u8]) -> rtsp_types::Response<Bytes> {
    let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
    assert_eq!(len, raw.len());
    match msg {
        rtsp_types::Message::Response(r) => r.map_body(|b| Bytes::from_static(b)),
        _ => panic!("unexpected message type"),
    }
}

/// Builds an RTP packet for `track` carrying `payload`.
pub(crate) fn packet(track: usize, sequence_number: u16, timestamp: u32, payload: &[u8]) -> ReceivedPacket {
    ReceivedPacketBuilder {
        track,
        sequence_number,
        timestamp,
        payload_type: 96,
        ssrc: 0x4cac_c3d1,
        mark: true,
        loss: 0,
    }
    .build(payload.iter().copied())
    .unwrap()
}
