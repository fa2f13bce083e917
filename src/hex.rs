// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for error messages and logs.
//!
//! A desynchronized stream can leave megabytes in the read buffer; dumping
//! all of it into an error string helps nobody.

use pretty_hex::PrettyHex;

/// Default number of bytes shown by [`LimitedHex::head`].
const DEFAULT_MAX_BYTES: usize = 64;

pub struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }

    /// Shows just the first few bytes, enough to recognize a protocol.
    pub fn head(inner: &'a [u8]) -> Self {
        Self::new(inner, DEFAULT_MAX_BYTES)
    }
}

impl std::fmt::Debug for LimitedHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = self.inner.len().min(self.max_bytes);
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        write!(
            f,
            "{:#?}",
            self.inner[..shown].hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        let omitted = self.inner.len() - shown;
        if omitted > 0 {
            write!(f, "\n...{0} (0x{0:x}) bytes not shown...", omitted)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LimitedHex;

    #[test]
    fn truncates() {
        let buf = [0xabu8; 100];
        let s = format!("{:?}", LimitedHex::new(&buf, 16));
        assert!(s.starts_with("Length: 100 (0x64) bytes"), "{s}");
        assert!(s.ends_with("...84 (0x54) bytes not shown..."), "{s}");
    }

    #[test]
    fn short_input_is_complete() {
        let s = format!("{:?}", LimitedHex::head(b"RTSP"));
        assert!(!s.contains("not shown"), "{s}");
    }
}
