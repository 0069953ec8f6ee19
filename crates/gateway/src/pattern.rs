//! Resource ID pattern matching with wildcard support.
//!
//! Patterns are dot-separated resource IDs whose tokens may include:
//! - `*` matches exactly one non-empty token
//! - `>` matches one or more trailing tokens (only at the end)
//!
//! Literal tokens match byte-for-byte.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Wild,
    Tail,
}

/// A parsed resource ID pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    tokens: Vec<Token>,
    valid: bool,
}

impl Pattern {
    /// Parse a pattern string. Parsing never fails; invalid patterns
    /// report `is_valid() == false` and match nothing.
    pub fn parse(s: &str) -> Self {
        let mut tokens = Vec::new();
        let mut valid = !s.is_empty();

        let parts: Vec<&str> = s.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            match *part {
                "" => {
                    valid = false;
                    break;
                }
                "*" => tokens.push(Token::Wild),
                ">" => {
                    if i != parts.len() - 1 {
                        valid = false;
                        break;
                    }
                    tokens.push(Token::Tail);
                }
                literal => tokens.push(Token::Literal(literal.to_string())),
            }
        }

        Self {
            raw: s.to_string(),
            tokens,
            valid,
        }
    }

    /// Whether the pattern parsed cleanly.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Test a resource ID against the pattern. Invalid patterns match
    /// nothing.
    pub fn matches(&self, rid: &str) -> bool {
        if !self.valid {
            return false;
        }

        let parts: Vec<&str> = rid.split('.').collect();
        let mut pi = 0;
        let mut si = 0;

        while pi < self.tokens.len() && si < parts.len() {
            match &self.tokens[pi] {
                Token::Tail => {
                    // One or more remaining non-empty tokens.
                    return parts[si..].iter().all(|p| !p.is_empty());
                }
                Token::Wild => {
                    if parts[si].is_empty() {
                        return false;
                    }
                    pi += 1;
                    si += 1;
                }
                Token::Literal(lit) => {
                    if lit != parts[si] {
                        return false;
                    }
                    pi += 1;
                    si += 1;
                }
            }
        }

        pi == self.tokens.len() && si == parts.len()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validate a concrete resource ID (optionally carrying a `?query`
/// part). The name part must have at least one token, every token
/// non-empty, and no wildcard characters.
pub fn is_valid_rid(rid: &str) -> bool {
    let name = rid.split('?').next().unwrap_or("");
    if name.is_empty() {
        return false;
    }
    name.split('.')
        .all(|t| !t.is_empty() && !t.contains('*') && !t.contains('>'))
}

/// The name part of a resource ID, with any `?query` stripped.
pub fn rid_name(rid: &str) -> &str {
    match rid.find('?') {
        Some(i) => &rid[..i],
        None => rid,
    }
}

/// The query part of a resource ID, or the empty string.
pub fn rid_query(rid: &str) -> &str {
    match rid.find('?') {
        Some(i) => &rid[i + 1..],
        None => "",
    }
}
