// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use bytes::Bytes;
use log::debug;
use rtsp_types::{Method, Request, Version};
use tokio::sync::Mutex;

use super::Requester;

/// Sends `TEARDOWN` and closes the write half, giving up after `timeout`.
///
/// Best-effort: the response isn't awaited, since the read half may already
/// be gone, and failures are only logged. The server discards the session
/// on connection close regardless.
pub(super) async fn teardown(requester: &Mutex<Requester>, timeout: Duration) {
    let attempt = async {
        let mut r = requester.lock().await;
        r.observe_forwarded();
        match r.session_id.clone() {
            None => debug!("no session id; skipping TEARDOWN"),
            Some(session_id) => {
                let req = Request::builder(Method::Teardown, Version::V1_0)
                    .request_uri(r.control.clone())
                    .build(Bytes::new());
                match r.send(req).await {
                    Ok(cseq) => debug!("TEARDOWN {session_id} sent with CSeq={cseq}"),
                    Err(e) => debug!("TEARDOWN {session_id} failed: {e}"),
                }
            }
        }
        if let Err(e) = r.writer.shutdown().await {
            debug!("shutdown after TEARDOWN failed: {e}");
        }
    };
    if tokio::time::timeout(timeout, attempt).await.is_err() {
        debug!("TEARDOWN abandoned after {timeout:?}");
    }
}
