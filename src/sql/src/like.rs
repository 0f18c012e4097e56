// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! SQL `LIKE` pattern compilation.
//!
//! `%` matches any run of characters, `_` matches exactly one character, and
//! `\` escapes the next character. A pattern ending in a bare `\` has no
//! meaning and is rejected at compile time.

use serde::{Deserialize, Serialize};

/// A compiled `LIKE` pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LikePattern {
    tokens: Vec<Token>,
    case_insensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Token {
    Literal(String),
    AnyChar,
    AnyRun,
}

/// A malformed `LIKE` pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LikeError {
    /// The pattern ends in a bare escape character.
    #[error("LIKE pattern ends with an unfinished escape")]
    TrailingEscape,
}

impl LikePattern {
    /// Compiles a pattern. `case_insensitive` selects `ILIKE` semantics.
    pub fn compile(pattern: &str, case_insensitive: bool) -> Result<LikePattern, LikeError> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => literal.push(escaped),
                    None => return Err(LikeError::TrailingEscape),
                },
                '%' => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    // Consecutive runs collapse to one.
                    if tokens.last() != Some(&Token::AnyRun) {
                        tokens.push(Token::AnyRun);
                    }
                }
                '_' => {
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(Token::AnyChar);
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }
        if case_insensitive {
            for token in &mut tokens {
                if let Token::Literal(lit) = token {
                    *lit = lit.to_lowercase();
                }
            }
        }
        Ok(LikePattern {
            tokens,
            case_insensitive,
        })
    }

    /// Tests a string against the pattern.
    pub fn matches(&self, s: &str) -> bool {
        let lowered;
        let subject = if self.case_insensitive {
            lowered = s.to_lowercase();
            &lowered
        } else {
            s
        };
        let chars: Vec<char> = subject.chars().collect();
        self.matches_at(0, &chars)
    }

    fn matches_at(&self, token: usize, s: &[char]) -> bool {
        match self.tokens.get(token) {
            None => s.is_empty(),
            Some(Token::Literal(lit)) => {
                let lit_chars: Vec<char> = lit.chars().collect();
                if s.len() < lit_chars.len() || s[..lit_chars.len()] != lit_chars[..] {
                    return false;
                }
                self.matches_at(token + 1, &s[lit_chars.len()..])
            }
            Some(Token::AnyChar) => !s.is_empty() && self.matches_at(token + 1, &s[1..]),
            Some(Token::AnyRun) => {
                (0..=s.len()).any(|skip| self.matches_at(token + 1, &s[skip..]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn like(pattern: &str, s: &str) -> bool {
        LikePattern::compile(pattern, false).unwrap().matches(s)
    }

    #[test]
    fn literal_patterns_are_exact() {
        assert!(like("abc", "abc"));
        assert!(!like("abc", "abcd"));
        assert!(!like("abc", "ab"));
        assert!(like("", ""));
        assert!(!like("", "x"));
    }

    #[test]
    fn percent_matches_any_run() {
        assert!(like("a%", "a"));
        assert!(like("a%", "abcdef"));
        assert!(like("%c", "abc"));
        assert!(like("a%c", "ac"));
        assert!(like("a%c", "abbbc"));
        assert!(!like("a%c", "abd"));
        assert!(like("%", ""));
        assert!(like("%%", "anything"));
    }

    #[test]
    fn underscore_matches_one_char() {
        assert!(like("a_c", "abc"));
        assert!(!like("a_c", "ac"));
        assert!(!like("a_c", "abbc"));
        assert!(like("___", "abc"));
    }

    #[test]
    fn escapes_make_metacharacters_literal() {
        assert!(like(r"100\%", "100%"));
        assert!(!like(r"100\%", "1000"));
        assert!(like(r"a\_b", "a_b"));
        assert!(!like(r"a\_b", "axb"));
        assert!(like(r"c:\\temp", r"c:\temp"));
    }

    #[test]
    fn trailing_escape_is_an_error() {
        assert_eq!(
            LikePattern::compile(r"abc\", false),
            Err(LikeError::TrailingEscape)
        );
    }

    #[test]
    fn ilike_ignores_case() {
        let p = LikePattern::compile("He%O", true).unwrap();
        assert!(p.matches("hello"));
        assert!(p.matches("HELLO"));
        let p = LikePattern::compile("He%O", false).unwrap();
        assert!(!p.matches("hello"));
    }

    // A reference implementation over raw characters, for the round-trip
    // property.
    fn reference_like(pattern: &[char], s: &[char]) -> bool {
        match pattern.split_first() {
            None => s.is_empty(),
            Some(('%', rest)) => (0..=s.len()).any(|k| reference_like(rest, &s[k..])),
            Some(('_', rest)) => !s.is_empty() && reference_like(rest, &s[1..]),
            Some(('\\', rest)) => match rest.split_first() {
                Some((lit, rest)) => {
                    s.first() == Some(lit) && reference_like(rest, &s[1..])
                }
                None => false,
            },
            Some((lit, rest)) => s.first() == Some(lit) && reference_like(rest, &s[1..]),
        }
    }

    proptest! {
        #[test]
        fn agrees_with_reference(
            pattern in "[ab%_\\\\]{0,8}",
            subject in "[ab_%]{0,8}",
        ) {
            let pattern_chars: Vec<char> = pattern.chars().collect();
            let subject_chars: Vec<char> = subject.chars().collect();
            match LikePattern::compile(&pattern, false) {
                Ok(compiled) => prop_assert_eq!(
                    compiled.matches(&subject),
                    reference_like(&pattern_chars, &subject_chars)
                ),
                Err(LikeError::TrailingEscape) => {
                    // Only reachable with an odd run of trailing backslashes.
                    prop_assert!(pattern.ends_with('\\'));
                }
            }
        }
    }
}
