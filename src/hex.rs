// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `Debug` rendering of payload excerpts for logs and error messages.

use pretty_hex::PrettyHex;

/// Hex dump of at most `max_bytes` of a buffer, noting how much was cut.
pub struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
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
        if shown < self.inner.len() {
            let omitted = self.inner.len() - shown;
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
        let data = [0u8; 20];
        let s = format!("{:?}", LimitedHex::new(&data, 4));
        assert!(s.starts_with("Length: 20 (0x14) bytes"), "{}", s);
        assert!(s.ends_with("...16 (0x10) bytes not shown..."), "{}", s);

        let s = format!("{:?}", LimitedHex::new(&data[..2], 4));
        assert!(!s.contains("not shown"), "{}", s);
    }
}
