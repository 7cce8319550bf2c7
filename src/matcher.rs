//! # Request Matcher
//!
//! The shared `if` condition sub-language every handler block understands:
//!
//! ```text
//! if <A> <op> <B>      # placeholders allowed in A and B
//! if_op and|or         # combination for the whole block, default and
//! ```
//!
//! Conditions are parsed once (including regex compilation for `match`) and
//! are immutable afterwards. Evaluation is lazy: `and` stops at the first
//! false condition, `or` at the first true one.

use crate::error::ServeError;
use crate::request::Request;
use regex::Regex;

/// A comparison operator, `not_`-negatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfOp {
    Is,
    Has,
    StartsWith,
    EndsWith,
    Match,
}

/// One parsed `if` condition.
#[derive(Debug, Clone)]
pub struct IfCond {
    a: String,
    op: IfOp,
    b: String,
    negated: bool,
    pattern: Option<Regex>,
}

impl IfCond {
    /// Parses a condition; `match` patterns are compiled here, once.
    pub fn parse(a: &str, op: &str, b: &str) -> Result<Self, ServeError> {
        let (negated, base) = match op.strip_prefix("not_") {
            Some(rest) => (true, rest),
            None => (false, op),
        };
        let op = match base {
            "is" => IfOp::Is,
            "not" => {
                // `not` is shorthand for a negated `is`.
                return Ok(Self {
                    a: a.to_string(),
                    op: IfOp::Is,
                    b: b.to_string(),
                    negated: !negated,
                    pattern: None,
                });
            }
            "has" => IfOp::Has,
            "starts_with" => IfOp::StartsWith,
            "ends_with" => IfOp::EndsWith,
            "match" => IfOp::Match,
            other => {
                return Err(ServeError::MatcherInvalid(format!(
                    "unknown operator '{}'",
                    other
                )))
            }
        };
        let pattern = match op {
            IfOp::Match => Some(Regex::new(b)?),
            _ => None,
        };
        Ok(Self {
            a: a.to_string(),
            op,
            b: b.to_string(),
            negated,
            pattern,
        })
    }

    /// Evaluates the condition against a request. Placeholders in both
    /// sides go through the replacer, except the pattern side of `match`,
    /// which was compiled at parse time.
    pub fn holds(&self, req: &Request) -> bool {
        let a = req.ctx.replacer.replace(&self.a, req, None);
        let result = match self.op {
            IfOp::Match => self
                .pattern
                .as_ref()
                .map(|re| re.is_match(&a))
                .unwrap_or(false),
            _ => {
                let b = req.ctx.replacer.replace(&self.b, req, None);
                match self.op {
                    IfOp::Is => a == b,
                    IfOp::Has => a.contains(&b),
                    IfOp::StartsWith => a.starts_with(&b),
                    IfOp::EndsWith => a.ends_with(&b),
                    IfOp::Match => unreachable!(),
                }
            }
        };
        result != self.negated
    }
}

/// How a block's conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfCombine {
    #[default]
    And,
    Or,
}

impl std::str::FromStr for IfCombine {
    type Err = ServeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "and" => Ok(IfCombine::And),
            "or" => Ok(IfCombine::Or),
            other => Err(ServeError::MatcherInvalid(format!(
                "if_op must be 'and' or 'or', got '{}'",
                other
            ))),
        }
    }
}

/// An ordered set of conditions with its combinator. Immutable after parse.
#[derive(Debug, Clone, Default)]
pub struct RequestMatcher {
    conditions: Vec<IfCond>,
    combine: IfCombine,
}

impl RequestMatcher {
    /// Parses `(a, op, b)` triples plus an optional `if_op` line.
    pub fn parse(
        conditions: &[(String, String, String)],
        if_op: Option<&str>,
    ) -> Result<Self, ServeError> {
        let combine = match if_op {
            Some(s) => s.parse()?,
            None => IfCombine::And,
        };
        let conditions = conditions
            .iter()
            .map(|(a, op, b)| IfCond::parse(a, op, b))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            conditions,
            combine,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// True when the request satisfies the block's conditions. An empty
    /// set is true under `and` and false under `or`.
    pub fn matches(&self, req: &Request) -> bool {
        match self.combine {
            IfCombine::And => self.conditions.iter().all(|c| c.holds(req)),
            IfCombine::Or => self.conditions.iter().any(|c| c.holds(req)),
        }
    }
}
