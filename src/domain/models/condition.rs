//! Dependency condition grammar.
//!
//! Conditions gate dependency edges and are parsed once at graph build.
//! The grammar is fixed: `success | failure | always | exit_code <op> N`.

use serde::{Deserialize, Serialize};

use super::job::JobResult;

/// Comparison operator for `exit_code` conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn apply(self, lhs: i32, rhs: i32) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
        }
    }

    fn parse(token: &str) -> Option<Self> {
        match token {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }
}

/// A parsed dependency condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    /// Satisfied when the source succeeded.
    Success,
    /// Satisfied when the source failed.
    Failure,
    /// Satisfied regardless of outcome.
    Always,
    /// Satisfied when the source exit code compares as specified.
    ExitCode { op: CompareOp, value: i32 },
}

impl Default for DependencyCondition {
    fn default() -> Self {
        Self::Success
    }
}

impl DependencyCondition {
    /// Parse a condition expression. Unknown vocabulary is rejected.
    pub fn parse(input: &str) -> Result<Self, ConditionParseError> {
        let trimmed = input.trim();
        match trimmed {
            "success" => return Ok(Self::Success),
            "failure" => return Ok(Self::Failure),
            "always" => return Ok(Self::Always),
            _ => {}
        }

        let mut tokens = trimmed.split_whitespace();
        let (head, op, value) = (tokens.next(), tokens.next(), tokens.next());
        if tokens.next().is_some() {
            return Err(ConditionParseError::TrailingInput(trimmed.to_string()));
        }
        match (head, op, value) {
            (Some("exit_code"), Some(op), Some(value)) => {
                let op = CompareOp::parse(op)
                    .ok_or_else(|| ConditionParseError::UnknownOperator(op.to_string()))?;
                let value = value
                    .parse::<i32>()
                    .map_err(|_| ConditionParseError::InvalidValue(value.to_string()))?;
                Ok(Self::ExitCode { op, value })
            }
            _ => Err(ConditionParseError::UnknownExpression(trimmed.to_string())),
        }
    }

    /// Evaluate against a finished source's result.
    pub fn evaluate(&self, result: &JobResult) -> bool {
        match self {
            Self::Success => result.success,
            Self::Failure => !result.success,
            Self::Always => true,
            Self::ExitCode { op, value } => op.apply(result.exit_code, *value),
        }
    }
}

/// Errors from [`DependencyCondition::parse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionParseError {
    #[error("unknown condition expression: {0}")]
    UnknownExpression(String),
    #[error("unknown comparison operator: {0}")]
    UnknownOperator(String),
    #[error("invalid exit code value: {0}")]
    InvalidValue(String),
    #[error("unexpected trailing input: {0}")]
    TrailingInput(String),
}
