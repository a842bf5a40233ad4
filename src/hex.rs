// Copyright (C) 2022 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for error messages and `Debug` output, so a hostile
//! packet can't produce an unbounded log line.

use pretty_hex::PrettyHex;

pub struct LimitedHex<'a> {
    inner: &'a [u8],
    max_bytes: usize,
}

impl<'a> LimitedHex<'a> {
    pub fn new(inner: &'a [u8], max_bytes: usize) -> Self {
        Self { inner, max_bytes }
    }
}

impl std::fmt::Debug for LimitedHex<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.inner.len())?;
        let print = &self.inner[..self.inner.len().min(self.max_bytes)];
        writeln!(
            f,
            "{:#?}",
            print.hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if let Some(omitted) = self.inner.len().checked_sub(self.max_bytes) {
            if omitted > 0 {
                write!(f, "\n...{0} (0x{0:x}) bytes not shown...", omitted)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omission_marker_only_when_truncated() {
        let dump = format!("{:?}", LimitedHex::new(&[0u8; 8], 16));
        assert!(!dump.contains("not shown"));
        let dump = format!("{:?}", LimitedHex::new(&[0u8; 32], 16));
        assert!(dump.contains("...16 (0x10) bytes not shown..."));
    }
}
