// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded queues between the read loop and the consumer.

use bytes::Bytes;
use log::debug;
use tokio::sync::{mpsc, watch};

use crate::codec::{AccessUnit, CodecDescriptor, Descriptors};
use crate::{ConnectionContext, Error, ErrorInt};

/// An out-of-band event on a session's signal queue.
#[derive(Clone, Debug)]
pub enum Signal {
    /// A track's codec parameters changed. Carries the full replacement list,
    /// indexed by track.
    CodecChanged(Descriptors),

    /// The read loop exited. This is the last signal of a session. `error`
    /// is `None` if the session was closed on request or the consumer went
    /// away.
    StreamStopped { error: Option<Error> },
}

/// An interleaved record exactly as received, including RTCP and records on
/// channels no track was set up on.
#[derive(Clone, Debug)]
pub struct RawRecord {
    pub channel: u8,
    pub payload: Bytes,
}

/// Why the read loop must stop after a failed enqueue.
#[derive(Debug)]
pub(super) enum Halt {
    /// The receiving half was dropped.
    Closed,

    /// A queue was full, or the sink was misused.
    Fatal(Error),
}

/// The receiving half of a session's output.
#[derive(Debug)]
pub struct Output {
    frames: mpsc::Receiver<AccessUnit>,
    signals: mpsc::Receiver<Signal>,
    raw: Option<mpsc::Receiver<RawRecord>>,
    descriptors: watch::Receiver<Descriptors>,
}

impl Output {
    /// Returns the next access unit, or `None` once the stream has stopped
    /// and the queue is drained.
    pub async fn next_access_unit(&mut self) -> Option<AccessUnit> {
        self.frames.recv().await
    }

    /// Returns the next signal, or `None` after [`Signal::StreamStopped`].
    pub async fn next_signal(&mut self) -> Option<Signal> {
        self.signals.recv().await
    }

    /// Returns the next raw record, or `None` once the stream has stopped and
    /// the queue is drained. Always `None` unless enabled through
    /// [`super::SessionOptions::raw_record_queue_capacity`].
    pub async fn next_raw_record(&mut self) -> Option<RawRecord> {
        match &mut self.raw {
            Some(raw) => raw.recv().await,
            None => None,
        }
    }

    /// Returns the latest descriptor list.
    pub fn descriptors(&self) -> Descriptors {
        self.descriptors.borrow().clone()
    }

    /// Returns a receiver that observes every descriptor list update.
    pub fn watch_descriptors(&self) -> watch::Receiver<Descriptors> {
        self.descriptors.clone()
    }
}

/// The sending half, owned by the read loop.
pub(super) struct Sink {
    conn_ctx: ConnectionContext,
    frames: mpsc::Sender<AccessUnit>,
    frame_capacity: usize,
    signals: mpsc::Sender<Signal>,
    signal_capacity: usize,
    raw: Option<mpsc::Sender<RawRecord>>,
    raw_capacity: usize,
    descriptors: watch::Sender<Descriptors>,
    stopped: bool,
}

/// Creates a connected sink and output.
///
/// The signal channel holds one slot beyond `signal_capacity` so that
/// `StreamStopped` always fits, even when `CodecChanged` signals filled it.
pub(super) fn channel(
    conn_ctx: ConnectionContext,
    frame_capacity: usize,
    signal_capacity: usize,
    raw_capacity: Option<usize>,
    initial: Descriptors,
) -> (Sink, Output) {
    let (frames_tx, frames_rx) = mpsc::channel(frame_capacity);
    let (signals_tx, signals_rx) = mpsc::channel(signal_capacity + 1);
    let (raw_tx, raw_rx) = raw_capacity.map(mpsc::channel).unzip();
    let (descriptors_tx, descriptors_rx) = watch::channel(initial);
    (
        Sink {
            conn_ctx,
            frames: frames_tx,
            frame_capacity,
            signals: signals_tx,
            signal_capacity,
            raw: raw_tx,
            raw_capacity: raw_capacity.unwrap_or(0),
            descriptors: descriptors_tx,
            stopped: false,
        },
        Output {
            frames: frames_rx,
            signals: signals_rx,
            raw: raw_rx,
            descriptors: descriptors_rx,
        },
    )
}

impl Sink {
    fn queue_full(&self, queue: &'static str, capacity: usize) -> Halt {
        Halt::Fatal(wrap!(ErrorInt::QueueFull {
            conn_ctx: self.conn_ctx,
            queue,
            capacity,
        }))
    }

    /// Enqueues an access unit without waiting.
    pub(super) fn frame(&mut self, au: AccessUnit) -> Result<(), Halt> {
        match self.frames.try_send(au) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(self.queue_full("access unit", self.frame_capacity))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Halt::Closed),
        }
    }

    /// Enqueues a copy of a received record without waiting, if raw output
    /// is enabled.
    pub(super) fn raw_record(&mut self, channel: u8, payload: &Bytes) -> Result<(), Halt> {
        let Some(raw) = &self.raw else {
            return Ok(());
        };
        let record = RawRecord {
            channel,
            payload: payload.clone(),
        };
        match raw.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(self.queue_full("raw record", self.raw_capacity))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Halt::Closed),
        }
    }

    /// Replaces `track`'s descriptor, publishes the new list, and enqueues
    /// [`Signal::CodecChanged`].
    pub(super) fn codec_changed(
        &mut self,
        track: usize,
        descriptor: CodecDescriptor,
    ) -> Result<(), Halt> {
        let mut list: Vec<Option<CodecDescriptor>> = self.descriptors.borrow().to_vec();
        let Some(slot) = list.get_mut(track) else {
            return Err(Halt::Fatal(wrap!(ErrorInt::Internal(
                format!("descriptor for unknown track {track}").into()
            ))));
        };
        *slot = Some(descriptor);
        let list: Descriptors = list.into();
        self.descriptors.send_replace(list.clone());

        // Keep the reserved slot for StreamStopped.
        if self.signals.capacity() <= 1 {
            if self.signals.is_closed() {
                return Err(Halt::Closed);
            }
            return Err(self.queue_full("signal", self.signal_capacity));
        }
        match self.signals.try_send(Signal::CodecChanged(list)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(self.queue_full("signal", self.signal_capacity))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Halt::Closed),
        }
    }

    /// Enqueues [`Signal::StreamStopped`] once; later calls do nothing.
    pub(super) fn stop(&mut self, error: Option<Error>) {
        if std::mem::replace(&mut self.stopped, true) {
            return;
        }
        if let Err(e) = self.signals.try_send(Signal::StreamStopped { error }) {
            debug!("unable to deliver StreamStopped: {e}");
        }
    }
}
