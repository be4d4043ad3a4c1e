//! Typed engine errors.
//!
//! Contract violations are bugs in an adapter or in the stored data and are
//! never retried. I/O failures travel as `anyhow::Error` and may wrap one of
//! these; callers use `downcast_ref::<EngineError>()` to tell them apart.
use crate::model::{Action, Operand};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{operand} {action}: built {operations} operations for {entities} entities")]
    OperationCountMismatch {
        operand: Operand,
        action: Action,
        operations: usize,
        entities: usize,
    },
    #[error("{operand} {action}: chunk is empty after filtering ({requested} ids requested)")]
    EmptyChunk {
        operand: Operand,
        action: Action,
        requested: usize,
    },
    #[error("{operand} {entity_id}: missing required field `{field}`")]
    MissingField {
        operand: Operand,
        entity_id: i64,
        field: &'static str,
    },
    #[error("{operand} {entity_id}: content does not match the operand")]
    ContentMismatch { operand: Operand, entity_id: i64 },
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("unknown operand: {0}")]
    UnknownOperand(String),
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("unknown job status: {0}")]
    UnknownStatus(String),
    #[error("malformed result payload: {0}")]
    MalformedResult(String),
}

impl EngineError {
    /// Whether this error signals a defect rather than bad input from the platform.
    pub fn is_contract_violation(&self) -> bool {
        !matches!(self, EngineError::MalformedResult(_))
    }
}
