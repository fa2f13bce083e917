// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP-style authentication as used by RTSP
//! ([RFC 2617](https://datatracker.ietf.org/doc/html/rfc2617)).

use std::borrow::Cow;

use base64::Engine as _;

use super::Credentials;

/// The scheme chosen from the server's first challenge.
#[derive(Debug, Default)]
pub(super) enum Auth {
    #[default]
    None,
    Basic,

    /// Holds the parsed challenge; responding advances its nonce count.
    Digest(digest_auth::WwwAuthenticateHeader),
}

impl Auth {
    /// Chooses a scheme from a `WWW-Authenticate` value, preferring Digest
    /// when a server offers both.
    pub(super) fn from_challenge(www_authenticate: &str) -> Result<Self, String> {
        if let Some(i) = www_authenticate.find("Digest") {
            let header = digest_auth::WwwAuthenticateHeader::parse(&www_authenticate[i..])
                .map_err(|e| format!("bad Digest challenge {www_authenticate:?}: {e}"))?;
            return Ok(Auth::Digest(header));
        }
        if www_authenticate.contains("Basic") {
            return Ok(Auth::Basic);
        }
        Err(format!("unsupported authentication scheme {www_authenticate:?}"))
    }

    /// Returns the `Authorization` value for a request, or `None` if no
    /// scheme has been chosen yet.
    pub(super) fn authorization(
        &mut self,
        creds: &Credentials,
        method: &rtsp_types::Method,
        uri: &str,
    ) -> Result<Option<String>, String> {
        match self {
            Auth::None => Ok(None),
            Auth::Basic => {
                let raw = format!("{}:{}", creds.username, creds.password);
                Ok(Some(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(raw)
                )))
            }
            Auth::Digest(challenge) => {
                let method: &str = method.into();
                let ctx = digest_auth::AuthContext::new_with_method(
                    &creds.username,
                    &creds.password,
                    uri,
                    Option::<&'static [u8]>::None,
                    digest_auth::HttpMethod(Cow::Borrowed(method)),
                );
                let authorization = challenge
                    .respond(&ctx)
                    .map_err(|e| format!("unable to answer Digest challenge: {e}"))?;
                Ok(Some(authorization.to_string()))
            }
        }
    }
}
