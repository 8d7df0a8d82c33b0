use crate::domain::models::SlotKey;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot {0} is already blocked")]
    Conflict(SlotKey),
    #[error("blocked slot not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
