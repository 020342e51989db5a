use std::collections::BTreeMap;

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorOp {
    Equals(String),
    NotEquals(String),
    In(Vec<String>),
    NotIn(Vec<String>),
    Exists,
    DoesNotExist,
}

/// A node label requirement, e.g. `region=eu-west`, `tier in (a,b)`, `gpu`, `!spot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    pub key: String,
    pub op: SelectorOp,
}

impl LabelSelector {
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        let invalid = || FleetError::InvalidSelectionPolicy(format!("unparseable selector {raw:?}"));

        if let Some(key) = s.strip_prefix('!') {
            return Ok(Self {
                key: valid_key(key.trim()).ok_or_else(invalid)?,
                op: SelectorOp::DoesNotExist,
            });
        }
        if let Some((key, value)) = s.split_once("!=") {
            return Ok(Self {
                key: valid_key(key.trim()).ok_or_else(invalid)?,
                op: SelectorOp::NotEquals(value.trim().to_string()),
            });
        }
        if let Some((key, value)) = s.split_once("==").or_else(|| s.split_once('=')) {
            return Ok(Self {
                key: valid_key(key.trim()).ok_or_else(invalid)?,
                op: SelectorOp::Equals(value.trim().to_string()),
            });
        }
        if let Some((key, values)) = s.split_once(" notin ") {
            return Ok(Self {
                key: valid_key(key.trim()).ok_or_else(invalid)?,
                op: SelectorOp::NotIn(parse_set(values).ok_or_else(invalid)?),
            });
        }
        if let Some((key, values)) = s.split_once(" in ") {
            return Ok(Self {
                key: valid_key(key.trim()).ok_or_else(invalid)?,
                op: SelectorOp::In(parse_set(values).ok_or_else(invalid)?),
            });
        }
        Ok(Self {
            key: valid_key(s).ok_or_else(invalid)?,
            op: SelectorOp::Exists,
        })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match &self.op {
            SelectorOp::Equals(expected) => value == Some(expected),
            SelectorOp::NotEquals(expected) => value != Some(expected),
            SelectorOp::In(set) => value.is_some_and(|v| set.contains(v)),
            SelectorOp::NotIn(set) => value.map_or(true, |v| !set.contains(v)),
            SelectorOp::Exists => value.is_some(),
            SelectorOp::DoesNotExist => value.is_none(),
        }
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.op {
            SelectorOp::Equals(v) => write!(f, "{}={}", self.key, v),
            SelectorOp::NotEquals(v) => write!(f, "{}!={}", self.key, v),
            SelectorOp::In(vs) => write!(f, "{} in ({})", self.key, vs.join(",")),
            SelectorOp::NotIn(vs) => write!(f, "{} notin ({})", self.key, vs.join(",")),
            SelectorOp::Exists => write!(f, "{}", self.key),
            SelectorOp::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

fn valid_key(key: &str) -> Option<String> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    ok.then(|| key.to_string())
}

fn parse_set(raw: &str) -> Option<Vec<String>> {
    let inner = raw.trim().strip_prefix('(')?.strip_suffix(')')?;
    let values: Vec<String> = inner
        .split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    (!values.is_empty()).then_some(values)
}
