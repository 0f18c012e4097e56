// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Lexicographically-ordered version strings.
//!
//! A [`LexiVersion`] encodes a `u64` log sequence number as a string whose
//! bytewise order matches the numeric order of the underlying LSN: one
//! base-36 digit encoding `len - 1`, followed by the base-36 digits of the
//! value. Because a larger value cannot have fewer digits, the length prefix
//! makes the plain string comparison total and monotonic.

use std::fmt;

use serde::{Deserialize, Serialize};

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A watermark: the lexicographically-ordered version of a committed upstream
/// transaction, and the version stamped into every row that transaction
/// wrote.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LexiVersion(String);

impl LexiVersion {
    /// The smallest possible version, ordered before every LSN-derived one.
    pub fn min() -> LexiVersion {
        LexiVersion::from_lsn(0)
    }

    /// Encodes an upstream LSN.
    pub fn from_lsn(lsn: u64) -> LexiVersion {
        let mut digits = Vec::with_capacity(14);
        let mut rest = lsn;
        loop {
            digits.push(DIGITS[(rest % 36) as usize]);
            rest /= 36;
            if rest == 0 {
                break;
            }
        }
        let mut out = String::with_capacity(digits.len() + 1);
        out.push(DIGITS[digits.len() - 1] as char);
        for d in digits.iter().rev() {
            out.push(*d as char);
        }
        LexiVersion(out)
    }

    /// Parses an encoded version, validating its shape.
    pub fn parse(s: &str) -> Result<LexiVersion, InvalidLexiVersion> {
        let v = LexiVersion(s.to_owned());
        v.to_lsn()?;
        Ok(v)
    }

    /// Decodes the underlying LSN.
    pub fn to_lsn(&self) -> Result<u64, InvalidLexiVersion> {
        let bytes = self.0.as_bytes();
        let (len_digit, rest) = match bytes.split_first() {
            Some(split) => split,
            None => return Err(InvalidLexiVersion(self.0.clone())),
        };
        let expected_len = base36_digit(*len_digit).ok_or_else(|| self.invalid())? as usize + 1;
        if rest.len() != expected_len {
            return Err(self.invalid());
        }
        let mut value: u64 = 0;
        for b in rest {
            let d = base36_digit(*b).ok_or_else(|| self.invalid())?;
            value = value
                .checked_mul(36)
                .and_then(|v| v.checked_add(u64::from(d)))
                .ok_or_else(|| self.invalid())?;
        }
        Ok(value)
    }

    /// The encoded form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn invalid(&self) -> InvalidLexiVersion {
        InvalidLexiVersion(self.0.clone())
    }
}

fn base36_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'z' => Some(b - b'a' + 10),
        _ => None,
    }
}

impl fmt::Display for LexiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A string that is not a valid [`LexiVersion`] encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version string: {0:?}")]
pub struct InvalidLexiVersion(pub String);

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn known_encodings() {
        assert_eq!(LexiVersion::from_lsn(0).as_str(), "00");
        assert_eq!(LexiVersion::from_lsn(10).as_str(), "0a");
        assert_eq!(LexiVersion::from_lsn(35).as_str(), "0z");
        assert_eq!(LexiVersion::from_lsn(36).as_str(), "110");
        assert_eq!(LexiVersion::from_lsn(u64::MAX).as_str(), "c3w5e11264sgsf");
    }

    #[test]
    fn parse_rejects_garbage() {
        for s in ["", "1", "0", "z0", "1-0", "00x", "110 "] {
            assert!(LexiVersion::parse(s).is_err(), "{s:?} should not parse");
        }
    }

    proptest! {
        #[test]
        fn round_trips(lsn: u64) {
            let v = LexiVersion::from_lsn(lsn);
            prop_assert_eq!(v.to_lsn().unwrap(), lsn);
            prop_assert_eq!(LexiVersion::parse(v.as_str()).unwrap(), v);
        }

        #[test]
        fn order_is_monotonic(a: u64, b: u64) {
            let (va, vb) = (LexiVersion::from_lsn(a), LexiVersion::from_lsn(b));
            prop_assert_eq!(a.cmp(&b), va.as_str().cmp(vb.as_str()));
            prop_assert_eq!(a.cmp(&b), va.cmp(&vb));
        }
    }
}
