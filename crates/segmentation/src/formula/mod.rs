//! Formula language: `CAT`, `IF`, `MATH` and `DATE` over profile attributes
//! and other computed fields.

pub mod ast;
pub mod eval;
pub mod graph;
pub mod lexer;
pub mod parser;

use audience_core::AudienceError;
use thiserror::Error;

pub use ast::{BinaryOp, Expr, Function};
pub use eval::{evaluate, FormulaValue, Scope};
pub use graph::{CycleError, DependencyGraph};
pub use parser::parse;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message} (at position {position})")]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

impl From<ParseError> for AudienceError {
    fn from(err: ParseError) -> Self {
        AudienceError::Parse {
            position: err.position,
            message: err.message,
        }
    }
}

impl From<CycleError> for AudienceError {
    fn from(err: CycleError) -> Self {
        AudienceError::Validation(err.to_string())
    }
}
