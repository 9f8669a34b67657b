//! Label selectors, as accepted by [`ListParams::labels`](crate::ListParams::labels)
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    iter::FromIterator,
    str::FromStr,
};
use thiserror::Error;

// local type aliases
type Map = BTreeMap<String, String>;
type Expressions = Vec<Expression>;

/// A selector expression with existing operations
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expression {
    /// The label is present and its value is one of the set
    In(String, BTreeSet<String>),
    /// The label is absent or its value is not in the set
    NotIn(String, BTreeSet<String>),
    /// The label is present with exactly this value
    Equal(String, String),
    /// The label is absent or has another value
    NotEqual(String, String),
    /// The label is present
    Exists(String),
    /// The label is absent
    DoesNotExist(String),
}

/// Perform selection on a list of expressions
///
/// All expressions must match; an empty selector selects everything.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector(Expressions);

/// A label selector string could not be parsed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid label selector {selector:?}: {reason}")]
pub struct ParseSelectorError {
    selector: String,
    reason: &'static str,
}

impl Selector {
    /// Create a selector from a map of key=value label matches
    fn from_map(map: Map) -> Self {
        Self(map.into_iter().map(|(k, v)| Expression::Equal(k, v)).collect())
    }

    /// Convert a selector to a string for the API
    #[must_use]
    pub fn to_selector_string(&self) -> String {
        self.to_string()
    }

    /// Indicates whether this label selector matches everything
    #[must_use]
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every expression matches the given labels
    #[must_use]
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, expr) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{expr}")?;
        }
        Ok(())
    }
}

impl FromStr for Selector {
    type Err = ParseSelectorError;

    /// Parses the string form used by `labelSelector` query parameters,
    /// e.g. `app=web,tier!=cache,env in (prod,staging),!legacy`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ParseSelectorError {
            selector: s.to_string(),
            reason,
        };

        let mut exprs = Vec::new();
        let mut depth = 0usize;
        let mut start = 0;
        for (i, c) in s.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => depth = depth.checked_sub(1).ok_or_else(|| invalid("unbalanced parenthesis"))?,
                ',' if depth == 0 => {
                    exprs.push(s[start..i].parse::<Expression>().map_err(invalid)?);
                    start = i + 1;
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(invalid("unbalanced parenthesis"));
        }
        let last = &s[start..];
        if !(last.trim().is_empty() && exprs.is_empty()) {
            exprs.push(last.parse::<Expression>().map_err(invalid)?);
        }
        Ok(Self(exprs))
    }
}

// === Expression ===

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::In(key, values) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            Expression::NotIn(key, values) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::NotEqual(key, value) => labels.get(key) != Some(value),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Expression::In(key, values) => write!(f, "{key} in ({})", join(values)),
            Expression::NotIn(key, values) => write!(f, "{key} notin ({})", join(values)),
            Expression::Equal(key, value) => write!(f, "{key}={value}"),
            Expression::NotEqual(key, value) => write!(f, "{key}!={value}"),
            Expression::Exists(key) => write!(f, "{key}"),
            Expression::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

impl FromStr for Expression {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let key = |k: &str| {
            let k = k.trim();
            if k.is_empty() {
                Err("empty label key")
            } else {
                Ok(k.to_string())
            }
        };
        let set = |rest: &str| -> Result<BTreeSet<String>, &'static str> {
            let inner = rest
                .trim()
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or("expected a parenthesized value set")?;
            Ok(inner
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
                .collect())
        };

        if let Some((k, v)) = s.split_once("!=") {
            return Ok(Expression::NotEqual(key(k)?, v.trim().to_string()));
        }
        if let Some((k, v)) = s.split_once("==").or_else(|| s.split_once('=')) {
            return Ok(Expression::Equal(key(k)?, v.trim().to_string()));
        }
        if let Some((k, rest)) = s.split_once(" notin ") {
            return Ok(Expression::NotIn(key(k)?, set(rest)?));
        }
        if let Some((k, rest)) = s.split_once(" in ") {
            return Ok(Expression::In(key(k)?, set(rest)?));
        }
        if let Some(k) = s.strip_prefix('!') {
            return Ok(Expression::DoesNotExist(key(k)?));
        }
        if s.contains(|c: char| c.is_whitespace() || c == '(' || c == ')') {
            return Err("unrecognized expression");
        }
        Ok(Expression::Exists(key(s)?))
    }
}

// convenience conversions for Selector

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Expression> for Selector {
    fn from(value: Expression) -> Self {
        Self(vec![value])
    }
}
