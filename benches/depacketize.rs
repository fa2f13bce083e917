// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use rtsp_ingest::codec::{DefaultParameterSetDecoder, Depacketizer, MediaKind, OpusFraming};
use rtsp_ingest::rtp::ReceivedPacketBuilder;

const SPS: &[u8] = b"\x67\x4d\x40\x1e\x9a\x64\x05\x01\xef\xf3\x50\x10\x10\x14\x00\x00\x0f\xa0\x00\x01\x38\x80\x10";
const PPS: &[u8] = b"\x68\xee\x3c\x80";
const FRAMES: u32 = 30;
const FRAME_LEN: usize = 20_000;
const MTU_PAYLOAD: usize = 1_400;

/// Returns RTP payloads for one second of 30 fps video: in-band parameter
/// sets, then each frame split into FU-A fragments. The last payload of each
/// frame is flagged as such.
fn payloads() -> Vec<(u32, bool, Vec<u8>)> {
    let mut out = vec![(0, false, SPS.to_vec()), (0, false, PPS.to_vec())];
    for f in 0..FRAMES {
        let timestamp = f * 3_000;
        let nal_header = if f == 0 { 0x65 } else { 0x41 };
        let body: Vec<u8> = (0..FRAME_LEN).map(|i| (i % 251) as u8 + 1).collect();
        let chunks: Vec<&[u8]> = body.chunks(MTU_PAYLOAD).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let start = i == 0;
            let end = i == chunks.len() - 1;
            let fu_header = (u8::from(start) << 7) | (u8::from(end) << 6) | (nal_header & 0x1f);
            let mut p = vec![(nal_header & 0xe0) | 28, fu_header];
            p.extend_from_slice(chunk);
            out.push((timestamp, end, p));
        }
    }
    out
}

fn h264_fu_a(payloads: &[(u32, bool, Vec<u8>)]) {
    let mut d = Depacketizer::new(
        0,
        MediaKind::H264,
        90_000,
        None,
        Arc::new(DefaultParameterSetDecoder),
        OpusFraming::default(),
    )
    .unwrap();
    let mut units = 0;
    for (seq, (timestamp, mark, payload)) in payloads.iter().enumerate() {
        let pkt = ReceivedPacketBuilder {
            track: 0,
            sequence_number: seq as u16,
            timestamp: *timestamp,
            payload_type: 96,
            ssrc: 0x4cac_c3d1,
            mark: *mark,
            loss: 0,
        }
        .build(payload.iter().copied())
        .unwrap();
        d.push(pkt).unwrap();
        while d.pull().is_some() {
            units += 1;
        }
    }
    assert!(units >= FRAMES - 1);
}

fn criterion_benchmark(c: &mut Criterion) {
    let payloads = payloads();
    let bytes: usize = payloads.iter().map(|(_, _, p)| p.len()).sum();
    let mut g = c.benchmark_group("depacketize");
    g.throughput(criterion::Throughput::Bytes(bytes as u64))
        .bench_function("h264_fu_a", |b| b.iter(|| h264_fu_a(&payloads)));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
