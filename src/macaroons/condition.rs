//! First-party caveat conditions of the form `key op value`.

use super::error::BakeryError;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

fn condition_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([a-zA-Z0-9_]*)\s([=><!]{1,2})\s(.*)$").expect("condition pattern is valid")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
}

impl Operator {
    const ALL: [Operator; 6] = [
        Operator::Eq,
        Operator::Neq,
        Operator::Lt,
        Operator::Leq,
        Operator::Gt,
        Operator::Geq,
    ];

    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Lt => "<",
            Operator::Leq => "<=",
            Operator::Gt => ">",
            Operator::Geq => ">=",
        }
    }
}

impl FromStr for Operator {
    type Err = BakeryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .into_iter()
            .find(|op| op.symbol().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                BakeryError::InvalidCondition(format!("Cannot determine operator from: {}", s))
            })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A single restriction carried by a caveat, e.g. `organization_id = 1234`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacaroonCondition {
    key: String,
    op: Operator,
    value: String,
}

impl MacaroonCondition {
    pub fn new(key: impl Into<String>, op: Operator, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op,
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for MacaroonCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.key, self.op, self.value)
    }
}

/// Parses `key op value`. Any single whitespace character separates the parts, and
/// `Display` writes a plain space, so `"a\t=\tb"` prints back as `"a = b"`.
impl FromStr for MacaroonCondition {
    type Err = BakeryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = condition_pattern()
            .captures(s)
            .ok_or_else(|| BakeryError::InvalidCondition(s.to_string()))?;

        let op = captures[2].parse::<Operator>()?;
        Ok(MacaroonCondition::new(&captures[1], op, &captures[3]))
    }
}
