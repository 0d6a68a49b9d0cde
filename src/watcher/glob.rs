//! Topic globs for message filtering.
//!
//! Globs follow shell `fnmatch` rules over the whole topic string:
//! - `*` matches any run of characters, including `.`
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]`, `[!x]` match one character from (or not from) a set
//!
//! ```
//! use broker_handle::TopicGlob;
//!
//! let glob = TopicGlob::new("foo.*").unwrap();
//! assert!(glob.matches("foo.bar"));
//! assert!(glob.matches("foo.bar.baz"));
//! assert!(!glob.matches("baz"));
//! ```

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyOne,
    AnyRun,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

/// A compiled topic glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicGlob {
    tokens: Vec<Token>,
    original: String,
}

impl TopicGlob {
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let original = pattern.into();
        let tokens = Self::parse(&original)?;
        Ok(Self { tokens, original })
    }

    /// Glob matching every topic.
    pub fn any() -> Self {
        Self {
            tokens: vec![Token::AnyRun],
            original: "*".to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn matches(&self, topic: &str) -> bool {
        let chars: Vec<char> = topic.chars().collect();
        self.matches_from(0, &chars, 0)
    }

    fn parse(pattern: &str) -> Result<Vec<Token>> {
        let invalid = |reason: &str| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut tokens = Vec::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            let token = match c {
                '*' => {
                    // Consecutive stars are equivalent to one.
                    if tokens.last() == Some(&Token::AnyRun) {
                        continue;
                    }
                    Token::AnyRun
                }
                '?' => Token::AnyOne,
                '\\' => Token::Literal(chars.next().ok_or_else(|| invalid("trailing backslash"))?),
                '[' => {
                    let negated = matches!(chars.peek(), Some('!') | Some('^'));
                    if negated {
                        chars.next();
                    }

                    let mut ranges = Vec::new();
                    let mut first = true;
                    loop {
                        let c = chars.next().ok_or_else(|| invalid("unterminated character class"))?;
                        if c == ']' && !first {
                            break;
                        }
                        first = false;

                        if chars.peek() == Some(&'-') {
                            chars.next();
                            match chars.next() {
                                Some(']') => {
                                    ranges.push((c, c));
                                    ranges.push(('-', '-'));
                                    break;
                                }
                                Some(end) if end >= c => ranges.push((c, end)),
                                Some(_) => return Err(invalid("reversed character range")),
                                None => return Err(invalid("unterminated character class")),
                            }
                        } else {
                            ranges.push((c, c));
                        }
                    }

                    Token::Class { negated, ranges }
                }
                c => Token::Literal(c),
            };
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn matches_from(&self, token_idx: usize, topic: &[char], topic_idx: usize) -> bool {
        let Some(token) = self.tokens.get(token_idx) else {
            return topic_idx == topic.len();
        };

        match token {
            Token::AnyRun => (topic_idx..=topic.len())
                .any(|start| self.matches_from(token_idx + 1, topic, start)),
            _ => {
                let Some(&c) = topic.get(topic_idx) else {
                    return false;
                };
                let accepted = match token {
                    Token::Literal(expected) => c == *expected,
                    Token::AnyOne => true,
                    Token::Class { negated, ranges } => {
                        ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi) != *negated
                    }
                    Token::AnyRun => unreachable!(),
                };
                accepted && self.matches_from(token_idx + 1, topic, topic_idx + 1)
            }
        }
    }
}

impl std::fmt::Display for TopicGlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.original)
    }
}
