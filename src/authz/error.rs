//! Authorization errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("Policy evaluation error: {0}")]
    PolicyEvaluation(String),

    #[error("Invalid policy expression: {0}")]
    InvalidExpression(String),
}
