// src/graph/trigger.rs

//! Trigger expressions: the left-hand side of a graph arrow.
//!
//! ```text
//! expr    := and ( '|' and )*
//! and     := primary ( '&' primary )*
//! primary := '(' expr ')' | atom
//! atom    := NAME [ '[' offset ']' ] [ ':' qualifier ] [ '?' ]
//! offset  := interval | '^' | '^' interval
//! ```

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::cycling::Interval;
use crate::errors::{CycloramaError, Result};
use crate::types::CyclingMode;

/// Cycle offset attached to a trigger atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomOffset {
    /// Same cycle point as the downstream task.
    None,
    /// `name[-P1]`: relative to the downstream task's point.
    Relative(Interval),
    /// `name[^]` / `name[^+PT6H]`: relative to the initial cycle point.
    Initial(Option<Interval>),
}

/// A single `name[offset]:qualifier?` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerAtom {
    pub name: String,
    pub offset: AtomOffset,
    /// Raw qualifier text without the colon (`succeed`, `fail`,
    /// `succeed-all`, a custom output, ...). `None` means the default.
    pub qualifier: Option<String>,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerExpr {
    Atom(TriggerAtom),
    And(Vec<TriggerExpr>),
    Or(Vec<TriggerExpr>),
}

impl TriggerExpr {
    pub fn atoms(&self) -> Vec<&TriggerAtom> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a TriggerAtom>) {
        match self {
            TriggerExpr::Atom(a) => out.push(a),
            TriggerExpr::And(items) | TriggerExpr::Or(items) => {
                for e in items {
                    e.collect_atoms(out);
                }
            }
        }
    }
}

impl fmt::Display for TriggerAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        match &self.offset {
            AtomOffset::None => {}
            AtomOffset::Relative(iv) => write!(f, "[{iv}]")?,
            AtomOffset::Initial(None) => write!(f, "[^]")?,
            AtomOffset::Initial(Some(iv)) if iv.is_negative() => write!(f, "[^{iv}]")?,
            AtomOffset::Initial(Some(iv)) => write!(f, "[^+{iv}]")?,
        }
        if let Some(q) = &self.qualifier {
            write!(f, ":{q}")?;
        }
        if self.optional {
            write!(f, "?")?;
        }
        Ok(())
    }
}

impl fmt::Display for TriggerExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, items: &[TriggerExpr], op: &str| -> fmt::Result {
            write!(f, "(")?;
            for (i, e) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {op} ")?;
                }
                write!(f, "{e}")?;
            }
            write!(f, ")")
        };
        match self {
            TriggerExpr::Atom(a) => write!(f, "{a}"),
            TriggerExpr::And(items) => join(f, items, "&"),
            TriggerExpr::Or(items) => join(f, items, "|"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Atom(String),
    And,
    Or,
    Open,
    Close,
}

fn tokenize(s: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;
    let flush = |current: &mut String, tokens: &mut Vec<Token>| {
        if !current.is_empty() {
            tokens.push(Token::Atom(std::mem::take(current)));
        }
    };
    for c in s.chars() {
        if in_brackets {
            current.push(c);
            if c == ']' {
                in_brackets = false;
            }
            continue;
        }
        match c {
            '[' => {
                in_brackets = true;
                current.push(c);
            }
            '&' | '|' | '(' | ')' => {
                flush(&mut current, &mut tokens);
                tokens.push(match c {
                    '&' => Token::And,
                    '|' => Token::Or,
                    '(' => Token::Open,
                    _ => Token::Close,
                });
            }
            c if c.is_whitespace() => flush(&mut current, &mut tokens),
            c => current.push(c),
        }
    }
    flush(&mut current, &mut tokens);
    tokens
}

fn atom_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9_][A-Za-z0-9_+%@\-]*)(?:\[([^\]]*)\])?(?::([A-Za-z0-9_\-]+))?(\?)?$")
            .expect("static regex")
    })
}

/// Parse `name[offset]:qualifier?`.
pub fn parse_atom(text: &str, mode: CyclingMode) -> Result<TriggerAtom> {
    let invalid = |why: &str| CycloramaError::InvalidTrigger(format!("{text}: {why}"));
    let caps = atom_re()
        .captures(text.trim())
        .ok_or_else(|| invalid("malformed task reference"))?;
    let name = caps[1].to_string();
    let offset = match caps.get(2).map(|m| m.as_str().trim()) {
        None | Some("") => AtomOffset::None,
        Some(raw) => parse_offset(raw, mode).map_err(|_| invalid("bad cycle offset"))?,
    };
    Ok(TriggerAtom {
        name,
        offset,
        qualifier: caps.get(3).map(|m| m.as_str().to_string()),
        optional: caps.get(4).is_some(),
    })
}

fn parse_offset(raw: &str, mode: CyclingMode) -> Result<AtomOffset> {
    if let Some(rest) = raw.strip_prefix('^') {
        if rest.is_empty() {
            return Ok(AtomOffset::Initial(None));
        }
        return Ok(AtomOffset::Initial(Some(Interval::parse(rest, mode)?)));
    }
    let iv = Interval::parse(raw, mode)?;
    if iv.is_zero() {
        Ok(AtomOffset::None)
    } else {
        Ok(AtomOffset::Relative(iv))
    }
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    mode: CyclingMode,
    source: &'a str,
}

impl ExprParser<'_> {
    fn err(&self, why: &str) -> CycloramaError {
        CycloramaError::InvalidTrigger(format!("{}: {why}", self.source))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<TriggerExpr> {
        let mut items = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 { items.remove(0) } else { TriggerExpr::Or(items) })
    }

    fn parse_and(&mut self) -> Result<TriggerExpr> {
        let mut items = vec![self.parse_primary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            items.push(self.parse_primary()?);
        }
        Ok(if items.len() == 1 { items.remove(0) } else { TriggerExpr::And(items) })
    }

    fn parse_primary(&mut self) -> Result<TriggerExpr> {
        match self.tokens.get(self.pos) {
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(self.err("unbalanced parentheses"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Atom(text)) => {
                self.pos += 1;
                Ok(TriggerExpr::Atom(parse_atom(text, self.mode)?))
            }
            Some(_) => Err(self.err("expected a task name")),
            None => Err(self.err("unexpected end of expression")),
        }
    }
}

/// Parse a full left-hand-side expression.
pub fn parse_expr(text: &str, mode: CyclingMode) -> Result<TriggerExpr> {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Err(CycloramaError::InvalidTrigger(format!("{text}: empty expression")));
    }
    let mut parser = ExprParser {
        tokens: &tokens,
        pos: 0,
        mode,
        source: text,
    };
    let expr = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(parser.err("unexpected trailing tokens"));
    }
    Ok(expr)
}

/// One right-hand-side entry: `name` or `!name` (suicide).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub suicide: bool,
}

/// Parse the right-hand side: `&`-separated names, each optionally prefixed
/// with `!`. Qualifiers are stripped (a chain's middle segment reads
/// `b:fail?` as target `b`); cycle offsets are rejected.
pub fn parse_targets(text: &str, mode: CyclingMode) -> Result<Vec<Target>> {
    let mut targets = Vec::new();
    for part in text.split('&') {
        let part = part.trim().trim_start_matches('(').trim_end_matches(')').trim();
        if part.is_empty() || part.contains('|') {
            return Err(CycloramaError::InvalidTrigger(format!(
                "{text}: right-hand side must be '&'-separated task names"
            )));
        }
        let (suicide, body) = match part.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, part),
        };
        let atom = parse_atom(body, mode)?;
        if atom.offset != AtomOffset::None {
            return Err(CycloramaError::InvalidTrigger(format!(
                "{part}: cycle offsets are not allowed on the right-hand side"
            )));
        }
        targets.push(Target {
            name: atom.name,
            suicide,
        });
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_atoms() {
        let a = parse_atom("foo[-P1]:fail?", CyclingMode::Integer).unwrap();
        assert_eq!(a.name, "foo");
        assert_eq!(a.offset, AtomOffset::Relative(Interval::Integer(-1)));
        assert_eq!(a.qualifier.as_deref(), Some("fail"));
        assert!(a.optional);

        let b = parse_atom("bar[^]", CyclingMode::Integer).unwrap();
        assert_eq!(b.offset, AtomOffset::Initial(None));

        let c = parse_atom("FAM:succeed-all", CyclingMode::Gregorian).unwrap();
        assert_eq!(c.qualifier.as_deref(), Some("succeed-all"));
    }

    #[test]
    fn precedence_and_parentheses() {
        let e = parse_expr("a & b | c", CyclingMode::Integer).unwrap();
        assert!(matches!(e, TriggerExpr::Or(ref items) if items.len() == 2));
        let e = parse_expr("a & (b | c)", CyclingMode::Integer).unwrap();
        assert!(matches!(e, TriggerExpr::And(ref items) if items.len() == 2));
        assert_eq!(e.atoms().len(), 3);
        assert!(parse_expr("a & (b | c", CyclingMode::Integer).is_err());
        assert!(parse_expr("a &", CyclingMode::Integer).is_err());
    }

    #[test]
    fn offsets_with_spaces_inside_brackets() {
        let e = parse_expr("a[ -P1 ] & b", CyclingMode::Integer).unwrap();
        let atoms = e.atoms();
        assert_eq!(atoms[0].offset, AtomOffset::Relative(Interval::Integer(-1)));
    }

    #[test]
    fn targets() {
        let t = parse_targets("b & !c", CyclingMode::Integer).unwrap();
        assert_eq!(t.len(), 2);
        assert!(!t[0].suicide);
        assert!(t[1].suicide);
        assert!(parse_targets("b | c", CyclingMode::Integer).is_err());
        assert!(parse_targets("b[+P1]", CyclingMode::Integer).is_err());
    }
}
