//! Label selector expressions.
//!
//! Policies select clusters with the Kubernetes label selector string syntax:
//! comma separated requirements of the form `key=value`, `key==value`,
//! `key!=value`, `key in (a,b)`, `key notin (a,b)`, `key` and `!key`.
//! Evaluation is a pure function of the labels and the parsed expression.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("empty requirement at position {0}")]
    EmptyRequirement(usize),

    #[error("invalid label key '{0}'")]
    InvalidKey(String),

    #[error("invalid label value '{0}'")]
    InvalidValue(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("set requirement '{0}' needs a parenthesized value list")]
    MalformedSet(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            // A missing label satisfies inequality, same as kubectl
            Self::NotEquals(key, value) => labels.get(key) != Some(value),
            Self::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Self::NotIn(key, values) => labels.get(key).map_or(true, |v| !values.contains(v)),
            Self::Exists(key) => labels.contains_key(key),
            Self::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

/// Parsed cluster selector.
///
/// An empty selector selects nothing: a policy without a selector must never
/// sweep the whole fleet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Parse a selector expression
    ///
    /// # Errors
    /// Returns `SelectorError` describing the first malformed requirement.
    pub fn parse(expression: &str) -> Result<Self, SelectorError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Ok(Self::default());
        }

        let requirements = split_requirements(expression)
            .into_iter()
            .enumerate()
            .map(|(position, raw)| parse_requirement(position, raw.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { requirements })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Whether every requirement holds for `labels`
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.requirements.is_empty() && self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Self::Equals(k, v) => write!(f, "{k}={v}"),
            Self::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Self::In(k, values) => write!(f, "{k} in ({})", join(values)),
            Self::NotIn(k, values) => write!(f, "{k} notin ({})", join(values)),
            Self::Exists(k) => write!(f, "{k}"),
            Self::DoesNotExist(k) => write!(f, "!{k}"),
        }
    }
}

/// Split on commas that are not inside a value list
fn split_requirements(expression: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in expression.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&expression[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&expression[start..]);
    parts
}

fn parse_requirement(position: usize, raw: &str) -> Result<Requirement, SelectorError> {
    if raw.is_empty() {
        return Err(SelectorError::EmptyRequirement(position));
    }

    if let Some(open) = raw.find('(') {
        return parse_set_requirement(raw, open);
    }

    if let Some(key) = raw.strip_prefix('!') {
        if !key.contains('=') {
            return Ok(Requirement::DoesNotExist(validate_key(key.trim())?));
        }
    }

    if let Some((key, value)) = raw.split_once("!=") {
        return Ok(Requirement::NotEquals(
            validate_key(key.trim())?,
            validate_value(value.trim())?,
        ));
    }

    if let Some((key, value)) = raw.split_once("==").or_else(|| raw.split_once('=')) {
        return Ok(Requirement::Equals(
            validate_key(key.trim())?,
            validate_value(value.trim())?,
        ));
    }

    Ok(Requirement::Exists(validate_key(raw)?))
}

fn parse_set_requirement(raw: &str, open: usize) -> Result<Requirement, SelectorError> {
    let head: Vec<&str> = raw[..open].split_whitespace().collect();
    let [key, operator] = head.as_slice() else {
        return Err(SelectorError::MalformedSet(raw.to_string()));
    };

    let body = raw[open + 1..]
        .trim_end()
        .strip_suffix(')')
        .ok_or_else(|| SelectorError::MalformedSet(raw.to_string()))?;

    let values = body
        .split(',')
        .map(|v| validate_value(v.trim()))
        .collect::<Result<BTreeSet<_>, _>>()?;
    if values.iter().all(String::is_empty) {
        return Err(SelectorError::MalformedSet(raw.to_string()));
    }

    let key = validate_key(key)?;
    match *operator {
        "in" => Ok(Requirement::In(key, values)),
        "notin" => Ok(Requirement::NotIn(key, values)),
        other => Err(SelectorError::UnknownOperator(other.to_string())),
    }
}

fn validate_key(key: &str) -> Result<String, SelectorError> {
    let valid = !key.is_empty()
        && key.len() <= 317
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(key.to_string())
    } else {
        Err(SelectorError::InvalidKey(key.to_string()))
    }
}

fn validate_value(value: &str) -> Result<String, SelectorError> {
    let valid = value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(value.to_string())
    } else {
        Err(SelectorError::InvalidValue(value.to_string()))
    }
}
