// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP client: negotiates TCP-interleaved RTP and runs the session.
//!
//! [`Session::connect`] performs `OPTIONS`, `DESCRIBE`, one `SETUP` per
//! usable track, and `PLAY`, then hands the connection to two tasks: a read
//! loop which owns all per-track codec state, and a keep-alive which only
//! writes. Output arrives through bounded queues; see [`Output`].

use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rtsp_types::{headers, Message, Method, Request, Response, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec::{
    AccessUnit, CodecDescriptor, DefaultParameterSetDecoder, Depacketizer, Descriptors,
    MediaKind, OpusFraming, ParameterSetDecoder, ParameterSets,
};
use crate::tokio::{ConnectionReader, ConnectionWriter};
use crate::{ConnectionContext, Error, ErrorInt, RtspMessageContext};

use self::auth::Auth;
use self::channel_mapping::{ChannelMappings, ChannelType};
use self::rtp::SequenceChecker;
use self::sink::{Halt, Sink};

mod auth;
mod channel_mapping;
mod parse;
mod rtp;
mod sink;
mod teardown;
pub(crate) mod timeline;

pub use self::parse::{DefaultSdpParser, SdpParser, TrackDescription};
pub use self::sink::{Output, RawRecord, Signal};

/// Port used when the URL doesn't name one.
const DEFAULT_PORT: u16 = 554;

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Options which must be known at connect time.
///
/// Built by chaining setters onto [`SessionOptions::default`].
#[derive(Clone)]
pub struct SessionOptions {
    creds: Option<Credentials>,
    user_agent: String,
    dial_timeout: Duration,
    read_write_timeout: Duration,
    keepalive_interval: Duration,
    teardown_timeout: Duration,
    frame_queue_capacity: usize,
    signal_queue_capacity: usize,
    raw_record_queue_capacity: Option<usize>,
    disable_audio: bool,
    opus_framing: OpusFraming,
    sdp_parser: Arc<dyn SdpParser>,
    parameter_set_decoder: Arc<dyn ParameterSetDecoder>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            creds: None,
            user_agent: concat!("rtsp-ingest/", env!("CARGO_PKG_VERSION")).to_owned(),
            dial_timeout: Duration::from_secs(5),
            read_write_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(25),
            teardown_timeout: Duration::from_secs(1),
            frame_queue_capacity: 2000,
            signal_queue_capacity: 100,
            raw_record_queue_capacity: None,
            disable_audio: false,
            opus_framing: OpusFraming::default(),
            sdp_parser: Arc::new(DefaultSdpParser),
            parameter_set_decoder: Arc::new(DefaultParameterSetDecoder),
        }
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("creds", &self.creds)
            .field("user_agent", &self.user_agent)
            .field("dial_timeout", &self.dial_timeout)
            .field("read_write_timeout", &self.read_write_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("teardown_timeout", &self.teardown_timeout)
            .field("frame_queue_capacity", &self.frame_queue_capacity)
            .field("signal_queue_capacity", &self.signal_queue_capacity)
            .field("raw_record_queue_capacity", &self.raw_record_queue_capacity)
            .field("disable_audio", &self.disable_audio)
            .field("opus_framing", &self.opus_framing)
            .finish_non_exhaustive()
    }
}

impl SessionOptions {
    /// Uses the given credentials when/if the server requests digest or basic authentication.
    ///
    /// These take precedence over any embedded in the URL.
    pub fn creds(mut self, creds: Option<Credentials>) -> Self {
        self.creds = creds;
        self
    }

    /// Sends the given user agent string with each request.
    pub fn user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Bounds the TCP connect in [`Session::connect`].
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Bounds every read and write. While playing, a stream silent for this
    /// long is considered dead.
    pub fn read_write_timeout(mut self, timeout: Duration) -> Self {
        self.read_write_timeout = timeout;
        self
    }

    /// Sets the period of keep-alive `OPTIONS` requests.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Bounds the best-effort `TEARDOWN` on close.
    pub fn teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Sets the access unit queue bound. Overflow stops the session.
    pub fn frame_queue_capacity(mut self, capacity: usize) -> Self {
        self.frame_queue_capacity = capacity;
        self
    }

    /// Sets the signal queue bound. Overflow stops the session.
    pub fn signal_queue_capacity(mut self, capacity: usize) -> Self {
        self.signal_queue_capacity = capacity;
        self
    }

    /// Enables [`Output::next_raw_record`] with the given queue bound, for
    /// relaying the stream unmodified. Overflow stops the session. Disabled
    /// by default.
    pub fn raw_record_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.raw_record_queue_capacity = capacity;
        self
    }

    /// Skips audio tracks at `SETUP`.
    pub fn disable_audio(mut self, disable_audio: bool) -> Self {
        self.disable_audio = disable_audio;
        self
    }

    pub fn opus_framing(mut self, opus_framing: OpusFraming) -> Self {
        self.opus_framing = opus_framing;
        self
    }

    pub fn sdp_parser(mut self, sdp_parser: Arc<dyn SdpParser>) -> Self {
        self.sdp_parser = sdp_parser;
        self
    }

    pub fn parameter_set_decoder(mut self, decoder: Arc<dyn ParameterSetDecoder>) -> Self {
        self.parameter_set_decoder = decoder;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        let problem = if self.frame_queue_capacity == 0 {
            "frame_queue_capacity must be non-zero"
        } else if self.signal_queue_capacity == 0 {
            "signal_queue_capacity must be non-zero"
        } else if self.raw_record_queue_capacity == Some(0) {
            "raw_record_queue_capacity must be non-zero"
        } else if self.keepalive_interval.is_zero() {
            "keepalive_interval must be non-zero"
        } else if self.read_write_timeout.is_zero() {
            "read_write_timeout must be non-zero"
        } else {
            return Ok(());
        };
        bail!(ErrorInt::InvalidArgument(problem.to_owned()))
    }
}

/// A track chosen at `SETUP`.
#[derive(Clone, Debug)]
pub struct Track {
    index: usize,
    kind: MediaKind,
    encoding_name: String,
    clock_rate: u32,
    channels: Option<NonZeroU16>,
    control: Url,
    channel: u8,
    framerate: Option<f32>,
}

impl Track {
    /// Index into [`Session::tracks`], [`Session::descriptors`], and
    /// [`AccessUnit::track`].
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Lowercased encoding name from the SDP, such as `h264` or `pcma`.
    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn channels(&self) -> Option<NonZeroU16> {
        self.channels
    }

    /// The URL this track was `SETUP` with.
    pub fn control(&self) -> &Url {
        &self.control
    }

    /// The interleaved channel carrying RTP; RTCP uses the next one.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn framerate(&self) -> Option<f32> {
        self.framerate
    }
}

/// The write half plus everything needed to build requests on it.
///
/// Shared by the handshake, keep-alive, and teardown behind one lock so
/// `CSeq` values are allocated and written in order. The read loop never
/// takes the lock; it forwards responses through `responses`, which are
/// observed before the next request is built.
struct Requester {
    writer: ConnectionWriter,
    responses: mpsc::UnboundedReceiver<Response<Bytes>>,

    /// Request URL for `PLAY`, keep-alives, and `TEARDOWN`. Starts as the
    /// session URL; replaced by any `Content-Base`.
    control: Url,
    session_id: Option<String>,

    /// The next `CSeq` header value to use when sending an RTSP request.
    next_cseq: u32,
    creds: Option<Credentials>,
    auth: Auth,
    user_agent: String,
    rw_timeout: Duration,
}

impl Requester {
    fn conn_ctx(&self) -> ConnectionContext {
        *self.writer.ctx()
    }

    /// Fills out `req` with `CSeq`, `User-Agent`, `Session`, and
    /// `Authorization` headers, returning the `CSeq`.
    fn prepare(&mut self, req: &mut Request<Bytes>) -> Result<u32, Error> {
        self.observe_forwarded();
        let cseq = self.next_cseq;
        self.next_cseq += 1;
        if let Some(creds) = &self.creds {
            let uri = req.request_uri().map_or("*", Url::as_str);
            let authorization = self
                .auth
                .authorization(creds, req.method(), uri)
                .map_err(|e| wrap!(ErrorInt::Internal(e.into())))?;
            if let Some(a) = authorization {
                req.insert_header(headers::AUTHORIZATION, a);
            }
        }
        req.insert_header(headers::CSEQ, cseq.to_string());
        req.insert_header(headers::USER_AGENT, self.user_agent.clone());
        if let Some(id) = &self.session_id {
            req.insert_header(headers::SESSION, id.clone());
        }
        Ok(cseq)
    }

    /// Writes a request without waiting for its response.
    async fn send(&mut self, mut req: Request<Bytes>) -> Result<u32, Error> {
        let cseq = self.prepare(&mut req)?;
        trace!("sending {:?} CSeq={cseq}", req.method());
        match tokio::time::timeout(self.rw_timeout, self.writer.send(Message::Request(req))).await {
            Ok(r) => r?,
            Err(_) => bail!(ErrorInt::Timeout(format!(
                "[{}] writing request CSeq={cseq} took longer than {:?}",
                self.conn_ctx(),
                self.rw_timeout
            ))),
        }
        Ok(cseq)
    }

    /// Observes responses the read loop has forwarded since the last call.
    fn observe_forwarded(&mut self) {
        while let Ok(resp) = self.responses.try_recv() {
            self.observe(&resp);
        }
    }

    /// Adopts the response's `Session` and `Content-Base`, if any.
    fn observe(&mut self, resp: &Response<Bytes>) {
        if let Some(id) = parse::get_session_id(resp) {
            if self.session_id.as_deref() != Some(id) {
                debug!("session id {:?} -> {id:?}", self.session_id);
                self.session_id = Some(id.to_owned());
            }
        }
        match parse::get_content_base(resp) {
            Ok(Some(base)) if base != self.control => {
                debug!("control URL {} -> {base}", self.control);
                self.control = base;
            }
            Ok(_) => {}
            Err(e) => warn!("[{}] ignoring {e}", self.conn_ctx()),
        }
    }
}

/// Connection state before `PLAY` completes, when requests and responses
/// strictly alternate.
struct Handshake {
    reader: ConnectionReader,
    requester: Requester,
}

impl Handshake {
    /// Sends a request and returns its successful response, answering one
    /// authentication challenge along the way.
    async fn request(
        &mut self,
        req: Request<Bytes>,
    ) -> Result<(RtspMessageContext, Response<Bytes>), Error> {
        let method = req.method().clone();
        let mut retried = false;
        loop {
            let cseq = self.requester.send(req.clone()).await?;
            let (msg_ctx, resp) = self.read_response(&method, cseq).await?;
            self.requester.observe(&resp);
            let conn_ctx = self.requester.conn_ctx();
            if resp.status() == StatusCode::Unauthorized {
                let fail = |description: String| {
                    wrap!(ErrorInt::AuthenticationError {
                        conn_ctx,
                        msg_ctx,
                        method: method.clone(),
                        cseq,
                        description,
                    })
                };
                if retried {
                    return Err(fail("credentials were rejected".to_owned()));
                }
                if self.requester.creds.is_none() {
                    return Err(fail("authentication required; no credentials supplied".to_owned()));
                }
                let Some(challenge) = resp.header(&headers::WWW_AUTHENTICATE) else {
                    return Err(fail("Unauthorized without WWW-Authenticate header".to_owned()));
                };
                self.requester.auth = Auth::from_challenge(challenge.as_str()).map_err(fail)?;
                retried = true;
                debug!("[{conn_ctx}, {msg_ctx}] retrying {method:?} with authentication");
                continue;
            }
            if !resp.status().is_success() {
                bail!(ErrorInt::RtspResponseError {
                    conn_ctx,
                    msg_ctx,
                    method,
                    cseq,
                    status: resp.status(),
                    description: String::from_utf8_lossy(&resp.body()[..resp.body().len().min(256)])
                        .into_owned(),
                });
            }
            return Ok((msg_ctx, resp));
        }
    }

    async fn read_response(
        &mut self,
        method: &Method,
        cseq: u32,
    ) -> Result<(RtspMessageContext, Response<Bytes>), Error> {
        loop {
            let msg = match tokio::time::timeout(self.requester.rw_timeout, self.reader.next()).await {
                Err(_) => bail!(ErrorInt::Timeout(format!(
                    "[{}] no response to {} CSeq={cseq} within {:?}",
                    self.reader.ctx(),
                    Into::<&str>::into(method),
                    self.requester.rw_timeout
                ))),
                Ok(None) => bail!(ErrorInt::RtspReadError {
                    conn_ctx: *self.reader.ctx(),
                    msg_ctx: self.reader.eof_ctx(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("EOF while awaiting response to CSeq={cseq}"),
                    ),
                }),
                Ok(Some(r)) => r?,
            };
            let resp = match msg.msg {
                Message::Response(r) => r,
                Message::Data(d) => {
                    let channel = d.channel_id();
                    debug!(
                        "[{}, {}] ignoring {}-byte record on channel {channel} before PLAY response",
                        self.reader.ctx(),
                        msg.ctx,
                        d.into_body().len()
                    );
                    continue;
                }
                Message::Request(r) => {
                    debug!("[{}, {}] ignoring {:?} request from server", self.reader.ctx(), msg.ctx, r.method());
                    continue;
                }
            };
            match parse::get_cseq(&resp) {
                Some(c) if c == cseq => return Ok((msg.ctx, resp)),
                Some(c) if c < cseq => {
                    debug!("[{}, {}] ignoring stale response CSeq={c}", self.reader.ctx(), msg.ctx);
                }
                other => bail!(ErrorInt::RtspFramingError {
                    conn_ctx: *self.reader.ctx(),
                    msg_ctx: msg.ctx,
                    description: format!("expected response to CSeq={cseq}; got CSeq={other:?}"),
                }),
            }
        }
    }
}

/// Per-track state owned by the read loop.
struct TrackState {
    sequence: SequenceChecker,
    depacketizer: Depacketizer,

    /// True once the depacketizer's origin has been set from the first packet.
    anchored: bool,
}

/// Owns the read half while playing: routes interleaved records to their
/// track's depacketizer and emits the results.
struct ReadLoop {
    reader: ConnectionReader,
    channels: ChannelMappings,
    tracks: Vec<TrackState>,
    sink: Sink,
    responses: mpsc::UnboundedSender<Response<Bytes>>,
    rw_timeout: Duration,

    /// When the `PLAY` response arrived; presentation times count from here.
    started: Instant,
}

impl ReadLoop {
    async fn run(mut self, cancel: CancellationToken, mut keepalive_failed: oneshot::Receiver<Error>) {
        let result = self.read_all(&cancel, &mut keepalive_failed).await;
        cancel.cancel();
        match result {
            Ok(()) => {
                debug!("[{}] read loop cancelled", self.reader.ctx());
                self.sink.stop(None);
            }
            Err(Halt::Closed) => {
                debug!("[{}] output dropped; stopping read loop", self.reader.ctx());
                self.sink.stop(None);
            }
            Err(Halt::Fatal(e)) => {
                warn!("stream stopped: {e}");
                self.sink.stop(Some(e));
            }
        }
    }

    async fn read_all(
        &mut self,
        cancel: &CancellationToken,
        keepalive_failed: &mut oneshot::Receiver<Error>,
    ) -> Result<(), Halt> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                r = &mut *keepalive_failed => return match r {
                    Ok(e) => Err(Halt::Fatal(e)),

                    // The keep-alive only exits silently on cancellation.
                    Err(_) => Ok(()),
                },
                r = tokio::time::timeout(self.rw_timeout, self.reader.next()) => r,
            };
            let msg = match next {
                Err(_) => {
                    return Err(Halt::Fatal(wrap!(ErrorInt::Timeout(format!(
                        "[{}] no data for {:?}",
                        self.reader.ctx(),
                        self.rw_timeout
                    )))))
                }
                Ok(None) => {
                    return Err(Halt::Fatal(wrap!(ErrorInt::RtspReadError {
                        conn_ctx: *self.reader.ctx(),
                        msg_ctx: self.reader.eof_ctx(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "EOF while playing",
                        ),
                    })))
                }
                Ok(Some(Err(e))) => return Err(Halt::Fatal(e)),
                Ok(Some(Ok(m))) => m,
            };
            match msg.msg {
                Message::Data(d) => self.handle_data(msg.ctx, d)?,
                Message::Response(r) => self.handle_response(msg.ctx, r),
                Message::Request(r) => {
                    debug!("[{}, {}] ignoring {:?} request from server", self.reader.ctx(), msg.ctx, r.method())
                }
            }
        }
    }

    fn handle_data(
        &mut self,
        msg_ctx: RtspMessageContext,
        data: rtsp_types::Data<Bytes>,
    ) -> Result<(), Halt> {
        let channel = data.channel_id();
        let body = data.into_body();
        self.sink.raw_record(channel, &body)?;
        let Some(m) = self.channels.lookup(channel) else {
            debug!(
                "[{}, {msg_ctx}] ignoring {}-byte record on unassigned channel {channel}",
                self.reader.ctx(),
                body.len()
            );
            return Ok(());
        };
        if m.channel_type == ChannelType::Rtcp || crate::rtp::is_rtcp(&body) {
            trace!("track {}: discarding {}-byte RTCP record", m.track, body.len());
            return Ok(());
        }
        let state = &mut self.tracks[m.track];
        let Some(pkt) = state.sequence.process(m.track, body) else {
            return Ok(());
        };
        if !state.anchored {
            let origin = msg_ctx.received().saturating_duration_since(self.started);
            debug!("track {}: first packet {origin:?} after PLAY", m.track);
            state.depacketizer.set_origin(origin);
            state.anchored = true;
        }
        if let Err(e) = state.depacketizer.push(pkt) {
            warn!("[{}, {msg_ctx}] track {}: {e}", self.reader.ctx(), m.track);
        }
        if let Some(d) = state.depacketizer.take_changed() {
            debug!("track {}: codec parameters changed: {d:?}", m.track);
            self.sink.codec_changed(m.track, d)?;
        }
        while let Some(au) = state.depacketizer.pull() {
            trace!(
                "track {}: {}-byte access unit pts={:?} key={}",
                au.track,
                au.data.len(),
                au.pts,
                au.is_key_frame
            );
            self.sink.frame(au)?;
        }
        Ok(())
    }

    fn handle_response(&mut self, msg_ctx: RtspMessageContext, resp: Response<Bytes>) {
        let cseq = parse::get_cseq(&resp);
        if resp.status().is_success() {
            debug!("[{}, {msg_ctx}] discarding response CSeq={cseq:?}", self.reader.ctx());
        } else {
            warn!(
                "[{}, {msg_ctx}] response CSeq={cseq:?} has status {}",
                self.reader.ctx(),
                resp.status()
            );
        }
        if self.responses.send(resp).is_err() {
            debug!("[{}, {msg_ctx}] requester gone; dropping response", self.reader.ctx());
        }
    }
}

/// Sends `OPTIONS` every `period` until cancelled. A write failure is
/// reported through `failed`, which ends the read loop.
async fn keepalive(
    requester: Arc<Mutex<Requester>>,
    cancel: CancellationToken,
    period: Duration,
    failed: oneshot::Sender<Error>,
) {
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = timer.tick() => {}
        }
        let mut r = requester.lock().await;
        r.observe_forwarded();
        let req = Request::builder(Method::Options, Version::V1_0)
            .request_uri(r.control.clone())
            .header(headers::REQUIRE, "implicit-play")
            .build(Bytes::new());
        match r.send(req).await {
            Ok(cseq) => trace!("sent keep-alive CSeq={cseq}"),
            Err(e) => {
                let _ = failed.send(e);
                return;
            }
        }
    }
}

/// Everything needed to stop a playing session.
struct Shutdown {
    cancel: CancellationToken,
    read_loop: JoinHandle<()>,
    keepalive: JoinHandle<()>,
    requester: Arc<Mutex<Requester>>,
    teardown_timeout: Duration,
}

impl Shutdown {
    async fn run(self) {
        self.cancel.cancel();
        if let Err(e) = self.read_loop.await {
            warn!("read loop failed: {e}");
        }
        if let Err(e) = self.keepalive.await {
            warn!("keep-alive failed: {e}");
        }
        teardown::teardown(&self.requester, self.teardown_timeout).await;
    }
}

/// A playing RTSP session.
///
/// Dropping it without [`Session::close`] performs the same shutdown on a
/// spawned task.
pub struct Session {
    tracks: Vec<Track>,
    sdp: Bytes,
    descriptors: watch::Receiver<Descriptors>,
    output: Option<Output>,
    shutdown: Option<Shutdown>,
}

/// Moves credentials embedded in `url` into `options` and strips them from
/// the URL, so they're never sent in a request line.
fn take_url_credentials(mut url: Url, options: &mut SessionOptions) -> Result<Url, Error> {
    if url.username().is_empty() && url.password().is_none() {
        return Ok(url);
    }
    if options.creds.is_none() {
        options.creds = Some(Credentials {
            username: url.username().to_owned(),
            password: url.password().unwrap_or("").to_owned(),
        });
    } else {
        debug!("ignoring URL credentials in favor of SessionOptions::creds");
    }
    if url.set_username("").is_err() || url.set_password(None).is_err() {
        bail!(ErrorInt::InvalidArgument(
            "unable to strip credentials from URL".to_owned()
        ));
    }
    Ok(url)
}

impl Session {
    /// Dials `url` over TCP and starts playing.
    ///
    /// `rtsps` URLs are rejected; establish TLS yourself and use
    /// [`Session::connect_with_stream`].
    pub async fn connect(url: Url, mut options: SessionOptions) -> Result<Self, Error> {
        let url = take_url_credentials(url, &mut options)?;
        match url.scheme() {
            "rtsp" => {}
            "rtsps" => bail!(ErrorInt::InvalidArgument(
                "rtsps requires a caller-supplied TLS stream; use Session::connect_with_stream"
                    .to_owned()
            )),
            s => bail!(ErrorInt::InvalidArgument(format!("unsupported URL scheme {s:?}"))),
        }
        options.validate()?;
        let host = url
            .host()
            .ok_or_else(|| wrap!(ErrorInt::InvalidArgument(format!("must specify host in rtsp url {url}"))))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let stream = match tokio::time::timeout(options.dial_timeout, crate::tokio::dial(host.clone(), port)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => bail!(ErrorInt::ConnectError(e)),
            Err(_) => bail!(ErrorInt::Timeout(format!(
                "connecting to {host}:{port} took longer than {:?}",
                options.dial_timeout
            ))),
        };
        let conn_ctx = ConnectionContext::tcp(&stream).map_err(|e| wrap!(ErrorInt::ConnectError(e)))?;
        Self::start(stream, conn_ctx, url, options).await
    }

    /// Starts playing over an already-established byte stream, such as a
    /// TLS session.
    pub async fn connect_with_stream<S>(
        stream: S,
        url: Url,
        mut options: SessionOptions,
    ) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let url = take_url_credentials(url, &mut options)?;
        if !matches!(url.scheme(), "rtsp" | "rtsps") {
            bail!(ErrorInt::InvalidArgument(format!(
                "unsupported URL scheme {:?}",
                url.scheme()
            )));
        }
        options.validate()?;
        Self::start(stream, ConnectionContext::unaddressed(), url, options).await
    }

    async fn start<S>(
        stream: S,
        conn_ctx: ConnectionContext,
        url: Url,
        options: SessionOptions,
    ) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = crate::tokio::split(stream, conn_ctx);
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let mut h = Handshake {
            reader,
            requester: Requester {
                writer,
                responses: responses_rx,
                control: url.clone(),
                session_id: None,
                next_cseq: 1,
                creds: options.creds.clone(),
                auth: Auth::default(),
                user_agent: options.user_agent.clone(),
                rw_timeout: options.read_write_timeout,
            },
        };

        h.request(
            Request::builder(Method::Options, Version::V1_0)
                .request_uri(url.clone())
                .build(Bytes::new()),
        )
        .await?;

        let (describe_ctx, describe) = h
            .request(
                Request::builder(Method::Describe, Version::V1_0)
                    .header(headers::ACCEPT, "application/sdp")
                    .request_uri(url.clone())
                    .build(Bytes::new()),
            )
            .await?;
        let base_url = h.requester.control.clone();
        let descriptions = options
            .sdp_parser
            .parse(&base_url, describe.body())
            .map_err(|description| {
                wrap!(ErrorInt::RtspResponseError {
                    conn_ctx,
                    msg_ctx: describe_ctx,
                    method: Method::Describe,
                    cseq: parse::get_cseq(&describe).unwrap_or(0),
                    status: describe.status(),
                    description,
                })
            })?;

        // Pick tracks and build their depacketizers before any SETUP, so a
        // track which can't be handled is never set up.
        let decoder = &options.parameter_set_decoder;
        let mut chosen = Vec::new();
        let mut skipped = Vec::new();
        for d in descriptions {
            let Some(kind) = d.kind else {
                debug!("skipping unsupported {} track {:?}", d.media, d.encoding_name);
                skipped.push(format!("{}/{}", d.media, d.encoding_name));
                continue;
            };
            if options.disable_audio && !kind.is_video() {
                debug!("skipping {kind} track; audio disabled");
                skipped.push(format!("{}/{} (audio disabled)", d.media, d.encoding_name));
                continue;
            }
            let index = chosen.len();
            let mut depacketizer = match Depacketizer::new(
                index,
                kind,
                d.clock_rate,
                d.channels,
                decoder.clone(),
                options.opus_framing,
            ) {
                Ok(dp) => dp,
                Err(e) => {
                    warn!("[{conn_ctx}] skipping {kind} track: {e}");
                    skipped.push(format!("{}/{} ({e})", d.media, d.encoding_name));
                    continue;
                }
            };
            let descriptor = if kind.is_video() {
                depacketizer.seed_parameter_sets(&d.parameter_sets);
                depacketizer.descriptor().cloned()
            } else {
                let sets = ParameterSets {
                    audio_config: d.audio_config.as_deref(),
                    clock_rate: d.clock_rate,
                    channels: d.channels,
                    ..ParameterSets::default()
                };
                match decoder.decode(kind, &sets) {
                    Ok(descriptor) => Some(descriptor),
                    Err(e) => {
                        warn!("[{conn_ctx}] track {index}: unable to describe {kind}: {e}");
                        None
                    }
                }
            };
            chosen.push((d, kind, depacketizer, descriptor));
        }
        if chosen.is_empty() {
            bail!(ErrorInt::NoUsableTracks {
                conn_ctx,
                description: if skipped.is_empty() {
                    "no media sections".to_owned()
                } else {
                    skipped.join(", ")
                },
            });
        }

        let mut channels = ChannelMappings::default();
        let mut tracks = Vec::with_capacity(chosen.len());
        let mut states = Vec::with_capacity(chosen.len());
        let mut descriptors: Vec<Option<CodecDescriptor>> = Vec::with_capacity(chosen.len());
        for (index, (d, kind, depacketizer, descriptor)) in chosen.into_iter().enumerate() {
            let control = d.control.clone().unwrap_or_else(|| h.requester.control.clone());
            let proposed = channels.next_unassigned().ok_or_else(|| {
                wrap!(ErrorInt::InvalidArgument(
                    "too many tracks for interleaved channels".to_owned()
                ))
            })?;
            let (setup_ctx, setup) = h
                .request(
                    Request::builder(Method::Setup, Version::V1_0)
                        .request_uri(control.clone())
                        .header(
                            headers::TRANSPORT,
                            format!("RTP/AVP/TCP;unicast;interleaved={}-{}", proposed, proposed + 1),
                        )
                        .build(Bytes::new()),
                )
                .await?;
            let response_error = |description: String| {
                wrap!(ErrorInt::RtspResponseError {
                    conn_ctx,
                    msg_ctx: setup_ctx,
                    method: Method::Setup,
                    cseq: parse::get_cseq(&setup).unwrap_or(0),
                    status: setup.status(),
                    description,
                })
            };
            let channel = match parse::get_interleaved_channel(&setup).map_err(&response_error)? {
                Some(c) => c,
                None => {
                    debug!("[{conn_ctx}, {setup_ctx}] SETUP response has no interleaved=; assuming {proposed}");
                    proposed
                }
            };
            channels.assign(channel, index).map_err(&response_error)?;
            debug!("track {index}: {kind} at {control} on interleaved={}-{}", channel, channel + 1);
            tracks.push(Track {
                index,
                kind,
                encoding_name: d.encoding_name,
                clock_rate: d.clock_rate,
                channels: d.channels,
                control,
                channel,
                framerate: d.framerate,
            });
            states.push(TrackState {
                sequence: SequenceChecker::default(),
                depacketizer,
                anchored: false,
            });
            descriptors.push(descriptor);
        }
        if h.requester.session_id.is_none() {
            warn!("[{conn_ctx}] SETUP responses carried no Session header");
        }

        let play_url = h.requester.control.clone();
        let (play_ctx, play) = h
            .request(
                Request::builder(Method::Play, Version::V1_0)
                    .request_uri(play_url)
                    .header(headers::RANGE, "npt=0.000-")
                    .build(Bytes::new()),
            )
            .await?;
        parse::log_rtp_info(&play);

        let Handshake { reader, requester } = h;
        let (sink, output) = sink::channel(
            conn_ctx,
            options.frame_queue_capacity,
            options.signal_queue_capacity,
            options.raw_record_queue_capacity,
            descriptors.into(),
        );
        let descriptors = output.watch_descriptors();
        let requester = Arc::new(Mutex::new(requester));
        let cancel = CancellationToken::new();
        let (keepalive_tx, keepalive_rx) = oneshot::channel();
        let keepalive = tokio::spawn(keepalive(
            requester.clone(),
            cancel.clone(),
            options.keepalive_interval,
            keepalive_tx,
        ));
        let read_loop = tokio::spawn(
            ReadLoop {
                reader,
                channels,
                tracks: states,
                sink,
                responses: responses_tx,
                rw_timeout: options.read_write_timeout,
                started: play_ctx.received(),
            }
            .run(cancel.clone(), keepalive_rx),
        );
        info!("[{conn_ctx}] playing {} track(s) from {url}", tracks.len());
        Ok(Session {
            tracks,
            sdp: describe.body().clone(),
            descriptors,
            output: Some(output),
            shutdown: Some(Shutdown {
                cancel,
                read_loop,
                keepalive,
                requester,
                teardown_timeout: options.teardown_timeout,
            }),
        })
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// The raw `DESCRIBE` response body, for relaying or for parsing fields
    /// this crate ignores.
    pub fn sdp(&self) -> &Bytes {
        &self.sdp
    }

    /// Returns the current codec descriptors, indexed by track.
    pub fn descriptors(&self) -> Descriptors {
        self.descriptors.borrow().clone()
    }

    /// Returns the next access unit, or `None` once the stream has stopped
    /// and the queue is drained, or after [`Session::output`].
    pub async fn next_access_unit(&mut self) -> Option<AccessUnit> {
        match &mut self.output {
            Some(o) => o.next_access_unit().await,
            None => None,
        }
    }

    /// Returns the next signal; see [`Session::next_access_unit`].
    pub async fn next_signal(&mut self) -> Option<Signal> {
        match &mut self.output {
            Some(o) => o.next_signal().await,
            None => None,
        }
    }

    /// Takes the receiving half, so it can be consumed on another task.
    /// Returns `None` if already taken.
    pub fn output(&mut self) -> Option<Output> {
        self.output.take()
    }

    /// Stops both tasks, then sends a best-effort `TEARDOWN`.
    pub async fn close(mut self) {
        if let Some(s) = self.shutdown.take() {
            s.run().await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(s) = self.shutdown.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(s.run());
            }
            Err(_) => {
                debug!("Session dropped outside a runtime; skipping TEARDOWN");
                s.cancel.cancel();
            }
        }
    }
}
