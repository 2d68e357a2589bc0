//! A small parser for the metric selector queries accepted in
//! `MetricSource.metricsql`.
//!
//! The accepted grammar is an optional metric name followed by an optional
//! brace block of label filters. Filters in a block are comma-separated and
//! `or` splits them into alternative groups:
//!
//! ```text
//! up
//! {job="gateway"}
//! http_requests_total{job="gateway", code!="200"}
//! {job="gateway" or job="router"}
//! ```

use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryExpr {
    pub name: Option<String>,
    /// Alternative filter groups. A series matches the query when it
    /// matches every filter of at least one group.
    pub groups: Vec<Vec<LabelFilter>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelFilter {
    pub label: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Re,
    Nre,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("query is empty")]
    Empty,

    #[error("expected {expected} at offset {at}")]
    Expected { expected: &'static str, at: usize },

    #[error("unterminated quoted string starting at offset {at}")]
    UnterminatedString { at: usize },

    #[error("unsupported escape sequence at offset {at}")]
    InvalidEscape { at: usize },

    #[error("unexpected trailing input at offset {at}")]
    TrailingInput { at: usize },
}

impl QueryExpr {
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        Parser {
            input,
            pos: 0,
        }
        .parse_query()
    }

    /// All label filters across all groups.
    pub fn filters(&self) -> impl Iterator<Item = &LabelFilter> {
        self.groups.iter().flatten()
    }

    /// Restricts the query to series carrying `label == value`.
    ///
    /// The filter is appended to every alternative group so that no branch
    /// of the query can escape the restriction. A query with no filters at
    /// all gains a single group holding just the restriction.
    pub fn scope_to(&mut self, label: &str, value: &str) {
        let filter = LabelFilter {
            label: label.to_string(),
            op: FilterOp::Eq,
            value: value.to_string(),
        };
        if self.groups.is_empty() {
            self.groups.push(vec![filter]);
            return;
        }
        for group in &mut self.groups {
            group.push(filter.clone());
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Re => "=~",
            Self::Nre => "!~",
        })
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}\"", self.label, self.op)?;
        for c in self.value.chars() {
            match c {
                '\\' => f.write_str("\\\\")?,
                '"' => f.write_str("\\\"")?,
                c => fmt::Write::write_char(f, c)?,
            }
        }
        f.write_str("\"")
    }
}

impl fmt::Display for QueryExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            f.write_str(name)?;
        }
        if self.groups.is_empty() {
            if self.name.is_none() {
                f.write_str("{}")?;
            }
            return Ok(());
        }
        f.write_str("{")?;
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                f.write_str(" or ")?;
            }
            for (j, filter) in group.iter().enumerate() {
                if j > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{filter}")?;
            }
        }
        f.write_str("}")
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn parse_query(mut self) -> Result<QueryExpr, ParseError> {
        self.skip_ws();
        let name = self.eat_ident();
        self.skip_ws();

        let mut groups = Vec::new();
        if self.eat_char('{') {
            groups = self.parse_groups()?;
            if !self.eat_char('}') {
                return Err(ParseError::Expected {
                    expected: "'}'",
                    at: self.pos,
                });
            }
        } else if name.is_none() {
            return Err(ParseError::Empty);
        }

        self.skip_ws();
        if self.pos < self.input.len() {
            return Err(ParseError::TrailingInput { at: self.pos });
        }
        Ok(QueryExpr { name, groups })
    }

    fn parse_groups(&mut self) -> Result<Vec<Vec<LabelFilter>>, ParseError> {
        let mut groups = Vec::new();
        let mut group = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                break;
            }
            group.push(self.parse_filter()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                // `or` separates groups only at a word boundary; a label
                // like `orb` is a missing comma, not a separator.
                Some('o') if self.at_or_keyword() => {
                    self.pos += 2;
                    groups.push(std::mem::take(&mut group));
                    self.skip_ws();
                    if matches!(self.peek(), None | Some('}')) {
                        return Err(ParseError::Expected {
                            expected: "a label name",
                            at: self.pos,
                        });
                    }
                }
                _ => break,
            }
        }
        if !group.is_empty() {
            groups.push(group);
        }
        Ok(groups)
    }

    fn parse_filter(&mut self) -> Result<LabelFilter, ParseError> {
        let label = self.eat_ident().ok_or(ParseError::Expected {
            expected: "a label name",
            at: self.pos,
        })?;
        self.skip_ws();
        let op = if self.eat_str("=~") {
            FilterOp::Re
        } else if self.eat_str("!~") {
            FilterOp::Nre
        } else if self.eat_str("!=") {
            FilterOp::Ne
        } else if self.eat_str("=") {
            FilterOp::Eq
        } else {
            return Err(ParseError::Expected {
                expected: "one of '=', '!=', '=~', '!~'",
                at: self.pos,
            });
        };
        self.skip_ws();
        let value = self.parse_string()?;
        Ok(LabelFilter { label, op, value })
    }

    fn parse_string(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        if !self.eat_char('"') {
            return Err(ParseError::Expected {
                expected: "a quoted string",
                at: self.pos,
            });
        }
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(ParseError::UnterminatedString { at: start }),
                Some('"') => return Ok(value),
                Some('\\') => match self.bump() {
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    _ => return Err(ParseError::InvalidEscape { at: self.pos }),
                },
                Some(c) => value.push(c),
            }
        }
    }

    fn eat_ident(&mut self) -> Option<String> {
        let rest = self.rest();
        let mut chars = rest.char_indices();
        match chars.next() {
            Some((_, c)) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
            _ => return None,
        }
        let end = chars
            .find(|&(_, c)| !is_ident_char(c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let ident = rest[..end].to_string();
        self.pos += end;
        Some(ident)
    }

    fn at_or_keyword(&self) -> bool {
        let rest = self.rest();
        rest.starts_with("or") && !rest[2..].starts_with(is_ident_char)
    }

    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat_char(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '.'
}
