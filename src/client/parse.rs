// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing of RTSP response headers and SDP session descriptions.

use std::num::NonZeroU16;

use base64::Engine as _;
use bytes::Bytes;
use log::{debug, warn};
use pretty_hex::PrettyHex;
use sdp_types::Media;
use url::Url;

use crate::codec::simple_audio::DEFAULT_CLOCK_RATE;
use crate::codec::MediaKind;

/// One `m=` section of a session description, reduced to what a track needs.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackDescription {
    /// SDP media type, such as `video` or `audio`.
    pub media: String,

    /// The depacketizer to use, or `None` if the encoding isn't supported.
    pub kind: Option<MediaKind>,

    /// Lowercased encoding name from `a=rtpmap` or the static payload type.
    pub encoding_name: String,
    pub clock_rate: u32,
    pub channels: Option<NonZeroU16>,

    /// The `a=control` value joined to the base URL, if present.
    pub control: Option<Url>,

    /// Out-of-band parameter sets from `a=fmtp`, in VPS, SPS, PPS order.
    pub parameter_sets: Vec<Bytes>,

    /// AAC `AudioSpecificConfig` from `a=fmtp`'s `config=`.
    pub audio_config: Option<Bytes>,

    /// Frames per second from `a=framerate`.
    pub framerate: Option<f32>,
}

/// Turns a `DESCRIBE` response body into track descriptions.
pub trait SdpParser: Send + Sync {
    /// `base_url` is the `Content-Base` of the response, or the request URL
    /// when absent; relative controls are joined to it.
    fn parse(&self, base_url: &Url, sdp: &[u8]) -> Result<Vec<TrackDescription>, String>;
}

/// [`SdpParser`] built on the `sdp-types` crate.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultSdpParser;

impl SdpParser for DefaultSdpParser {
    fn parse(&self, base_url: &Url, sdp: &[u8]) -> Result<Vec<TrackDescription>, String> {
        let session = sdp_types::Session::parse(sdp)
            .map_err(|e| format!("Unable to parse SDP: {}\n\n{:#?}", e, sdp.hex_dump()))?;
        let mut tracks = Vec::with_capacity(session.medias.len());
        for (i, m) in session.medias.iter().enumerate() {
            match parse_media(base_url, m) {
                Ok(t) => tracks.push(t),
                Err(e) => warn!("Skipping SDP media {i} ({}): {e}", m.media),
            }
        }
        Ok(tracks)
    }
}

/// A static payload type in the [RTP parameters
/// registry](https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml#rtp-parameters-1),
/// limited to the encodings this crate depacketizes.
#[derive(Debug)]
struct StaticPayloadType {
    encoding: &'static str,
    clock_rate: u32,
    channels: Option<NonZeroU16>,
}

fn static_payload_type(pt: u8) -> Option<StaticPayloadType> {
    let (encoding, clock_rate, channels) = match pt {
        0 => ("pcmu", 8_000, 1),
        8 => ("pcma", 8_000, 1),
        10 => ("l16", 44_100, 2),
        11 => ("l16", 44_100, 1),
        _ => return None,
    };
    Some(StaticPayloadType {
        encoding,
        clock_rate,
        channels: NonZeroU16::new(channels),
    })
}

/// Joins a control URL to a base URL in a non-RFC-compliant but common way:
/// append with a `/` separator rather than resolving as a relative reference.
/// `*` means the base itself.
pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    if let Ok(absolute_url) = Url::parse(control) {
        return Ok(absolute_url);
    }
    let sep = if base_url.as_str().ends_with('/') || control.starts_with('/') {
        ""
    } else {
        "/"
    };
    Url::parse(&format!("{}{}{}", base_url.as_str(), sep, control))
        .map_err(|e| format!("unable to join base url {base_url} with control url {control:?}: {e}"))
}

/// Returns the `CSeq` from an RTSP response as a `u32`, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| u32::from_str_radix(cseq.as_str().trim(), 10).ok())
}

/// Returns the session id from a `Session` header, dropping parameters such
/// as `;timeout=60`.
pub(crate) fn get_session_id(response: &rtsp_types::Response<Bytes>) -> Option<&str> {
    let v = response.header(&rtsp_types::headers::SESSION)?.as_str();
    let id = v.split_once(';').map_or(v, |(id, _)| id).trim();
    (!id.is_empty()).then_some(id)
}

/// Returns the parsed `Content-Base` header, if any.
pub(crate) fn get_content_base(response: &rtsp_types::Response<Bytes>) -> Result<Option<Url>, String> {
    response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .map(|v| Url::parse(v.as_str().trim()).map_err(|e| format!("bad Content-Base {v:?}: {e}")))
        .transpose()
}

/// Returns the RTP channel of a `SETUP` response's `interleaved=n-m`
/// transport parameter, or `None` if the server didn't say.
pub(crate) fn get_interleaved_channel(
    response: &rtsp_types::Response<Bytes>,
) -> Result<Option<u8>, String> {
    let Some(transport) = response.header(&rtsp_types::headers::TRANSPORT) else {
        return Ok(None);
    };
    for part in transport.as_str().split(';') {
        let Some(interleaved) = part.trim().strip_prefix("interleaved=") else {
            continue;
        };
        let (n, m) = match interleaved.split_once('-') {
            Some((n, m)) => (n, Some(m)),
            None => (interleaved, None),
        };
        let n = u8::from_str_radix(n, 10).map_err(|_| format!("bad channel number {n:?}"))?;
        if let Some(m) = m {
            let m = u8::from_str_radix(m, 10)
                .map_err(|_| format!("bad second channel number {m:?}"))?;
            if n.checked_add(1) != Some(m) {
                return Err(format!("Expected adjacent channels; got {n}-{m}"));
            }
        }
        if n & 1 != 0 {
            return Err(format!("Expected even RTP channel; got {n}"));
        }
        return Ok(Some(n));
    }
    Ok(None)
}

/// Logs a `PLAY` response's `RTP-Info` header
/// ([RFC 2326 section 12.33](https://tools.ietf.org/html/rfc2326#section-12.33)).
///
/// The values aren't used: timelines start from the first packet of each track.
pub(crate) fn log_rtp_info(response: &rtsp_types::Response<Bytes>) {
    let Some(rtp_info) = response.header(&rtsp_types::headers::RTP_INFO) else {
        return;
    };
    for s in rtp_info.as_str().split(',') {
        let mut url = None;
        let mut seq = None;
        let mut rtptime = None;
        for part in s.trim().split(';') {
            match part.split_once('=') {
                Some(("url", v)) => url = Some(v),
                Some(("seq", v)) => seq = u16::from_str_radix(v, 10).ok(),
                Some(("rtptime", v)) => rtptime = u32::from_str_radix(v, 10).ok(),
                _ => {}
            }
        }
        debug!(
            "RTP-Info: url={} seq={:?} rtptime={:?}",
            url.unwrap_or("?"),
            seq,
            rtptime
        );
    }
}

/// Splits an attribute value of the form `<payload type> <rest>`, returning
/// `rest` if the payload type matches.
fn for_payload_type<'a>(value: Option<&'a str>, pt: &str, what: &str) -> Result<Option<&'a str>, String> {
    let v = value.ok_or_else(|| format!("{what} attribute with no value"))?;
    let (attr_pt, rest) = v
        .split_once(' ')
        .ok_or_else(|| format!("invalid {what} attribute {v:?}"))?;
    Ok((attr_pt == pt).then_some(rest.trim()))
}

/// Parses a media description into a [`TrackDescription`].
fn parse_media(base_url: &Url, media_description: &Media) -> Result<TrackDescription, String> {
    let media = media_description.media.clone();

    // RFC 8866 section 5.14: with an RTP proto, fmt holds payload type numbers.
    // Variants such as "TCP/RTP/AVP" exist, so look for an "RTP" component.
    if !media_description.proto.starts_with("RTP/") && !media_description.proto.contains("/RTP/") {
        return Err(format!("Expected RTP-based proto; got {:?}", media_description.proto));
    }

    // The first listed format is the default; use it.
    let rtp_payload_type_str = media_description
        .fmt
        .split_ascii_whitespace()
        .next()
        .ok_or_else(|| "missing RTP payload type".to_owned())?;
    let rtp_payload_type = u8::from_str_radix(rtp_payload_type_str, 10)
        .map_err(|_| format!("invalid RTP payload type {rtp_payload_type_str:?}"))?;
    if (rtp_payload_type & 0x80) != 0 {
        return Err(format!("invalid RTP payload type {rtp_payload_type}"));
    }

    let mut rtpmap = None;
    let mut fmtp = None;
    let mut control = None;
    let mut framerate = None;
    for a in &media_description.attributes {
        match a.attribute.as_str() {
            "rtpmap" => {
                if let Some(v) = for_payload_type(a.value.as_deref(), rtp_payload_type_str, "rtpmap")? {
                    rtpmap = Some(v);
                }
            }
            "fmtp" => {
                if let Some(v) = for_payload_type(a.value.as_deref(), rtp_payload_type_str, "fmtp")? {
                    fmtp = Some(v);
                }
            }
            "control" => {
                control = a
                    .value
                    .as_deref()
                    .map(|c| join_control(base_url, c.trim()))
                    .transpose()?;
            }
            "framerate" => {
                framerate = a.value.as_deref().and_then(|v| match v.trim().parse::<f32>() {
                    Ok(f) if f.is_finite() && f > 0. => Some(f),
                    _ => {
                        debug!("ignoring bad framerate {v:?}");
                        None
                    }
                });
            }
            _ => {}
        }
    }

    // rtpmap-value = payload-type SP encoding-name "/" clock-rate [ "/" encoding-params ]
    let (encoding_name, clock_rate, channels) = match rtpmap {
        Some(rtpmap) => {
            let (e, clock_rate_str, channels_str) = match rtpmap.split_once('/') {
                None => (rtpmap, None, None),
                Some((e, rest)) => match rest.split_once('/') {
                    None => (e, Some(rest), None),
                    Some((c, ch)) => (e, Some(c), Some(ch)),
                },
            };
            let clock_rate = match clock_rate_str {
                Some(c) => u32::from_str_radix(c, 10)
                    .map_err(|_| format!("bad clock rate in rtpmap {rtpmap:?}"))?,
                None if media == "audio" => {
                    debug!("rtpmap {rtpmap:?} has no clock rate; assuming {DEFAULT_CLOCK_RATE}");
                    DEFAULT_CLOCK_RATE
                }
                None => return Err(format!("invalid rtpmap attribute {rtpmap:?}")),
            };
            let channels = channels_str
                .map(|c| {
                    u16::from_str_radix(c, 10)
                        .ok()
                        .and_then(NonZeroU16::new)
                        .ok_or_else(|| format!("Invalid channels specification {c:?}"))
                })
                .transpose()?;
            (e.to_ascii_lowercase(), clock_rate, channels)
        }
        None => {
            let t = static_payload_type(rtp_payload_type).ok_or_else(|| {
                format!(
                    "Expected rtpmap parameter or supported static payload type (got {rtp_payload_type})"
                )
            })?;
            if media != "audio" {
                return Err(format!(
                    "SDP media type {media} must match RTP payload type {t:?}"
                ));
            }
            (t.encoding.to_owned(), t.clock_rate, t.channels)
        }
    };

    let mut kind = MediaKind::from_encoding_name(&media, &encoding_name);
    let mut parameter_sets = Vec::new();
    let mut audio_config = None;
    if let Some(fmtp) = fmtp {
        match kind {
            Some(MediaKind::H264) => {
                if let Some(v) = fmtp_param(fmtp, "sprop-parameter-sets") {
                    parameter_sets.extend(decode_sprop(v));
                }
            }
            Some(MediaKind::H265) => {
                for key in ["sprop-vps", "sprop-sps", "sprop-pps"] {
                    if let Some(v) = fmtp_param(fmtp, key) {
                        parameter_sets.extend(decode_sprop(v));
                    }
                }
            }
            Some(MediaKind::Aac) => match parse_aac_fmtp(fmtp) {
                Ok(config) => audio_config = Some(config),
                Err(e) => {
                    warn!("Unsupported AAC fmtp {fmtp:?}: {e}");
                    kind = None;
                }
            },
            _ => {}
        }
    } else if kind == Some(MediaKind::Aac) {
        warn!("AAC track without fmtp; unable to depacketize");
        kind = None;
    }

    Ok(TrackDescription {
        media,
        kind,
        encoding_name,
        clock_rate,
        channels,
        control,
        parameter_sets,
        audio_config,
        framerate,
    })
}

/// Returns the value of `key` within a `;`-separated fmtp parameter list.
fn fmtp_param<'a>(fmtp: &'a str, key: &str) -> Option<&'a str> {
    fmtp.split(';').find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        k.trim().eq_ignore_ascii_case(key).then_some(v.trim())
    })
}

/// Decodes a comma-separated list of base64 NAL units, skipping bad entries.
fn decode_sprop(v: &str) -> Vec<Bytes> {
    v.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| match base64::engine::general_purpose::STANDARD.decode(s) {
            Ok(nal) if !nal.is_empty() => Some(Bytes::from(nal)),
            Ok(_) => None,
            Err(e) => {
                warn!("bad base64 parameter set {s:?}: {e}");
                None
            }
        })
        .collect()
}

/// Validates an [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640)
/// fmtp for the AAC-hbr layout and returns the `config` bytes.
fn parse_aac_fmtp(fmtp: &str) -> Result<Bytes, String> {
    if let Some(mode) = fmtp_param(fmtp, "mode") {
        if !mode.eq_ignore_ascii_case("AAC-hbr") {
            return Err(format!("mode {mode:?} isn't AAC-hbr"));
        }
    }
    for (key, expected) in [("sizelength", "13"), ("indexlength", "3"), ("indexdeltalength", "3")] {
        if let Some(v) = fmtp_param(fmtp, key) {
            if v != expected {
                return Err(format!("{key}={v}; expected {expected}"));
            }
        }
    }
    let config = fmtp_param(fmtp, "config").ok_or_else(|| "missing config".to_owned())?;
    let config = hex::decode(config).map_err(|e| format!("bad config {config:?}: {e}"))?;
    Ok(Bytes::from(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::response;

    const DAHUA_SDP: &[u8] = b"v=0\r\n\
        o=- 2252310609 2252310609 IN IP4 0.0.0.0\r\n\
        s=Media Server\r\n\
        c=IN IP4 0.0.0.0\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        a=range:npt=now-\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=control:trackID=0\r\n\
        a=framerate:30.000000\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1;profile-level-id=64001E;sprop-parameter-sets=Z2QAHqwsaoLA9puCgIKgAAADACAAAAMD0IAA,aO4xshsA\r\n\
        a=recvonly\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=control:trackID=1\r\n\
        a=rtpmap:97 MPEG4-GENERIC/48000\r\n\
        a=fmtp:97 streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1188\r\n\
        a=recvonly\r\n\
        m=application 0 RTP/AVP 107\r\n\
        a=control:trackID=4\r\n\
        a=rtpmap:107 vnd.onvif.metadata/90000\r\n\
        a=recvonly\r\n";

    #[test]
    fn dahua_h264_aac_onvif() {
        let base = Url::parse("rtsp://192.168.5.111:554/cam/realmonitor?channel=1&subtype=1/").unwrap();
        let tracks = DefaultSdpParser.parse(&base, DAHUA_SDP).unwrap();
        assert_eq!(tracks.len(), 3);

        assert_eq!(tracks[0].media, "video");
        assert_eq!(tracks[0].kind, Some(MediaKind::H264));
        assert_eq!(tracks[0].encoding_name, "h264");
        assert_eq!(tracks[0].clock_rate, 90_000);
        assert_eq!(tracks[0].framerate, Some(30.0));
        assert_eq!(
            tracks[0].control.as_ref().unwrap().as_str(),
            "rtsp://192.168.5.111:554/cam/realmonitor?channel=1&subtype=1/trackID=0"
        );
        assert_eq!(tracks[0].parameter_sets.len(), 2);
        assert_eq!(tracks[0].parameter_sets[0][0] & 0x1f, 7);
        assert_eq!(&tracks[0].parameter_sets[1][..], b"\x68\xee\x31\xb2\x1b\x00");

        assert_eq!(tracks[1].kind, Some(MediaKind::Aac));
        assert_eq!(tracks[1].clock_rate, 48_000);
        assert_eq!(tracks[1].audio_config.as_deref(), Some(&b"\x11\x88"[..]));

        assert_eq!(tracks[2].media, "application");
        assert_eq!(tracks[2].kind, None);
        assert_eq!(tracks[2].encoding_name, "vnd.onvif.metadata");
    }

    #[test]
    fn h265_sprops() {
        let sdp = b"v=0\r\n\
            o=- 0 0 IN IP4 0.0.0.0\r\n\
            s=-\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 98\r\n\
            a=rtpmap:98 H265/90000\r\n\
            a=fmtp:98 profile-id=1;sprop-sps=QgEBAWAAAAMAkAAAAwAAAwA/oAUCAXFlLkkyS7I=;sprop-pps=RAHA8vAzJA==;sprop-vps=QAEMAf//AWAAAAMAkAAAAwAAAwA/LAwAAgAAAwAoAAIAAgACgA==\r\n\
            a=control:track1\r\n";
        let base = Url::parse("rtsp://cam/live").unwrap();
        let tracks = DefaultSdpParser.parse(&base, sdp).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind, Some(MediaKind::H265));
        assert_eq!(tracks[0].control.as_ref().unwrap().as_str(), "rtsp://cam/live/track1");

        // Always VPS, SPS, PPS regardless of attribute order.
        let types: Vec<u8> = tracks[0]
            .parameter_sets
            .iter()
            .map(|nal| (nal[0] >> 1) & 0x3f)
            .collect();
        assert_eq!(types, [32, 33, 34]);
    }

    #[test]
    fn static_payload_types() {
        let sdp = b"v=0\r\n\
            o=- 0 0 IN IP4 0.0.0.0\r\n\
            s=-\r\n\
            t=0 0\r\n\
            m=audio 0 RTP/AVP 8\r\n\
            a=control:rtsp://cam/audio\r\n\
            m=audio 0 RTP/AVP 11\r\n\
            m=audio 0 RTP/AVP 3\r\n";
        let base = Url::parse("rtsp://cam/").unwrap();
        let tracks = DefaultSdpParser.parse(&base, sdp).unwrap();

        // GSM (payload type 3) has no depacketizer and is skipped.
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].kind, Some(MediaKind::PcmALaw));
        assert_eq!(tracks[0].clock_rate, 8_000);
        assert_eq!(tracks[0].control.as_ref().unwrap().as_str(), "rtsp://cam/audio");
        assert_eq!(tracks[1].kind, Some(MediaKind::Pcm));
        assert_eq!(tracks[1].clock_rate, 44_100);
        assert_eq!(tracks[1].channels, NonZeroU16::new(1));
        assert_eq!(tracks[1].control, None);
    }

    #[test]
    fn rtpmap_without_clock_rate() {
        let sdp = b"v=0\r\n\
            o=- 0 0 IN IP4 0.0.0.0\r\n\
            s=-\r\n\
            t=0 0\r\n\
            m=audio 0 RTP/AVP 97\r\n\
            a=rtpmap:97 PCMA\r\n\
            m=video 0 RTP/AVP 96\r\n\
            a=rtpmap:96 H264\r\n";
        let base = Url::parse("rtsp://cam/").unwrap();
        let tracks = DefaultSdpParser.parse(&base, sdp).unwrap();

        // Video has no sensible default, so that section is dropped.
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind, Some(MediaKind::PcmALaw));
        assert_eq!(tracks[0].encoding_name, "pcma");
        assert_eq!(tracks[0].clock_rate, 8_000);
        assert_eq!(tracks[0].channels, None);

        use crate::codec::ParameterSetDecoder as _;
        let sets = crate::codec::ParameterSets {
            clock_rate: tracks[0].clock_rate,
            ..crate::codec::ParameterSets::default()
        };
        match crate::codec::DefaultParameterSetDecoder.decode(MediaKind::PcmALaw, &sets) {
            Ok(crate::codec::CodecDescriptor::Audio(a)) => assert_eq!(a.sample_rate, 8_000),
            o => panic!("unexpected {o:?}"),
        }
    }

    #[test]
    fn unsupported_aac_layout() {
        let sdp = b"v=0\r\n\
            o=- 0 0 IN IP4 0.0.0.0\r\n\
            s=-\r\n\
            t=0 0\r\n\
            m=audio 0 RTP/AVP 97\r\n\
            a=rtpmap:97 mpeg4-generic/16000/1\r\n\
            a=fmtp:97 mode=AAC-lbr;sizelength=6;indexlength=2;config=1408\r\n";
        let base = Url::parse("rtsp://cam/").unwrap();
        let tracks = DefaultSdpParser.parse(&base, sdp).unwrap();
        assert_eq!(tracks[0].kind, None);
        assert_eq!(tracks[0].audio_config, None);
    }

    #[test]
    fn join() {
        let base = Url::parse("rtsp://cam/stream").unwrap();
        assert_eq!(join_control(&base, "*").unwrap(), base);
        assert_eq!(join_control(&base, "trackID=1").unwrap().as_str(), "rtsp://cam/stream/trackID=1");
        let slash = Url::parse("rtsp://cam/stream/").unwrap();
        assert_eq!(join_control(&slash, "trackID=1").unwrap().as_str(), "rtsp://cam/stream/trackID=1");
        assert_eq!(
            join_control(&base, "rtsp://other/track").unwrap().as_str(),
            "rtsp://other/track"
        );
    }

    #[test]
    fn setup_headers() {
        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 3\r\n\
              Session: 634214675641;timeout=60\r\n\
              Transport: RTP/AVP/TCP;unicast;interleaved=2-3;ssrc=30A98EE7\r\n\
              \r\n",
        );
        assert_eq!(get_cseq(&r), Some(3));
        assert_eq!(get_session_id(&r), Some("634214675641"));
        assert_eq!(get_interleaved_channel(&r), Ok(Some(2)));
        assert_eq!(get_content_base(&r), Ok(None));

        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 4\r\n\
              Session: F8F8E425\r\n\
              Transport: RTP/AVP/TCP;unicast\r\n\
              \r\n",
        );
        assert_eq!(get_session_id(&r), Some("F8F8E425"));
        assert_eq!(get_interleaved_channel(&r), Ok(None));

        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 5\r\n\
              Transport: RTP/AVP/TCP;unicast;interleaved=2-5\r\n\
              \r\n",
        );
        assert_eq!(get_session_id(&r), None);
        get_interleaved_channel(&r).unwrap_err();
    }

    #[test]
    fn describe_headers() {
        let r = response(
            b"RTSP/1.0 200 OK\r\n\
              CSeq: 2\r\n\
              Content-Base: rtsp://192.168.5.106:554/Streaming/Channels/101/\r\n\
              RTP-Info: url=trackID=1;seq=24104;rtptime=1270711678\r\n\
              \r\n",
        );
        assert_eq!(
            get_content_base(&r).unwrap().unwrap().as_str(),
            "rtsp://192.168.5.106:554/Streaming/Channels/101/"
        );
        log_rtp_info(&r);
    }
}
