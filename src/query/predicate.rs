//! Operator grammar for metadata and dimension query values.
//!
//! Metadata values:
//! - `value` exact match, `!value` exact mismatch
//! - `~pat` wildcard match where `*` matches any run of characters, `!~pat` its negation
//!
//! Dimension values:
//! - `x` equality, `<x`, `<=x`, `>x`, `>=x` comparisons
//! - `lo..hi` strictly between, both bounds excluded

use sqlx::{Postgres, QueryBuilder};

use crate::naming::quote_ident;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum TextPredicate {
    Eq(String),
    Ne(String),
    Like(String),
    NotLike(String),
}

impl TextPredicate {
    pub fn parse(raw: &str) -> Result<Self> {
        let predicate = if let Some(pattern) = raw.strip_prefix("!~") {
            TextPredicate::NotLike(pattern.to_string())
        } else if let Some(value) = raw.strip_prefix('!') {
            TextPredicate::Ne(value.to_string())
        } else if let Some(pattern) = raw.strip_prefix('~') {
            TextPredicate::Like(pattern.to_string())
        } else {
            TextPredicate::Eq(raw.to_string())
        };
        let operand = match &predicate {
            TextPredicate::Eq(v)
            | TextPredicate::Ne(v)
            | TextPredicate::Like(v)
            | TextPredicate::NotLike(v) => v,
        };
        if operand.is_empty() {
            return Err(Error::InvalidQuery(format!(
                "metadata query `{raw}` has an empty operand"
            )));
        }
        Ok(predicate)
    }

    pub(crate) fn push_sql(&self, builder: &mut QueryBuilder<'static, Postgres>, column: &str) {
        let column = quote_ident(column);
        match self {
            TextPredicate::Eq(value) => {
                builder.push(format!("{column} = "));
                builder.push_bind(value.clone());
            }
            TextPredicate::Ne(value) => {
                builder.push(format!("{column} <> "));
                builder.push_bind(value.clone());
            }
            TextPredicate::Like(pattern) => {
                builder.push(format!("{column} like "));
                builder.push_bind(like_pattern(pattern));
                builder.push(" escape '\\'");
            }
            TextPredicate::NotLike(pattern) => {
                builder.push(format!("{column} not like "));
                builder.push_bind(like_pattern(pattern));
                builder.push(" escape '\\'");
            }
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            TextPredicate::Eq(expected) => value == expected,
            TextPredicate::Ne(expected) => value != expected,
            TextPredicate::Like(pattern) => wildcard_match(pattern, value),
            TextPredicate::NotLike(pattern) => !wildcard_match(pattern, value),
        }
    }
}

/// Translate a `*` wildcard pattern into a LIKE pattern. Literal `%`, `_` and
/// `\` are escaped. LIKE matches the whole value, so a pattern that does not
/// start (end) with `*` is anchored at the start (end).
pub fn like_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    for ch in pattern.chars() {
        match ch {
            '*' => out.push('%'),
            '%' | '_' | '\\' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// In-process equivalent of [`like_pattern`] matching.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }
    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !value.starts_with(first) {
        return false;
    }
    let mut rest = &value[first.len()..];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[derive(Clone, Debug, PartialEq)]
pub enum NumberPredicate {
    Eq(f64),
    Lt(f64),
    Le(f64),
    Gt(f64),
    Ge(f64),
    Between(f64, f64),
}

fn parse_number(raw: &str, whole: &str) -> Result<f64> {
    let value: f64 = raw.trim().parse().map_err(|_| {
        Error::InvalidQuery(format!("dimension query `{whole}` is not a number"))
    })?;
    if !value.is_finite() {
        return Err(Error::InvalidQuery(format!(
            "dimension query `{whole}` is not finite"
        )));
    }
    Ok(value)
}

impl NumberPredicate {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if let Some(v) = trimmed.strip_prefix("<=") {
            return Ok(NumberPredicate::Le(parse_number(v, raw)?));
        }
        if let Some(v) = trimmed.strip_prefix(">=") {
            return Ok(NumberPredicate::Ge(parse_number(v, raw)?));
        }
        if let Some(v) = trimmed.strip_prefix('<') {
            return Ok(NumberPredicate::Lt(parse_number(v, raw)?));
        }
        if let Some(v) = trimmed.strip_prefix('>') {
            return Ok(NumberPredicate::Gt(parse_number(v, raw)?));
        }
        if let Some((lo, hi)) = trimmed.split_once("..") {
            let lo = parse_number(lo, raw)?;
            let hi = parse_number(hi, raw)?;
            if lo > hi {
                return Err(Error::InvalidQuery(format!(
                    "dimension range `{raw}` has min greater than max"
                )));
            }
            return Ok(NumberPredicate::Between(lo, hi));
        }
        Ok(NumberPredicate::Eq(parse_number(trimmed, raw)?))
    }

    pub(crate) fn push_sql(&self, builder: &mut QueryBuilder<'static, Postgres>, column: &str) {
        let column = quote_ident(column);
        let (op, value) = match self {
            NumberPredicate::Between(lo, hi) => {
                builder.push(format!("({column} > "));
                builder.push_bind(*lo);
                builder.push(format!(" and {column} < "));
                builder.push_bind(*hi);
                builder.push(")");
                return;
            }
            NumberPredicate::Eq(v) => ("=", *v),
            NumberPredicate::Lt(v) => ("<", *v),
            NumberPredicate::Le(v) => ("<=", *v),
            NumberPredicate::Gt(v) => (">", *v),
            NumberPredicate::Ge(v) => (">=", *v),
        };
        builder.push(format!("{column} {op} "));
        builder.push_bind(value);
    }

    pub fn matches(&self, value: f64) -> bool {
        match *self {
            NumberPredicate::Eq(v) => value == v,
            NumberPredicate::Lt(v) => value < v,
            NumberPredicate::Le(v) => value <= v,
            NumberPredicate::Gt(v) => value > v,
            NumberPredicate::Ge(v) => value >= v,
            NumberPredicate::Between(lo, hi) => value > lo && value < hi,
        }
    }
}
