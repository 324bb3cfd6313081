//! Validation errors shared by every configurable component.

use thiserror::Error;

/// Validation failures captured with contextual metadata.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field}: {message}")]
    InvalidField { field: String, message: String },
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            ValidationError::InvalidField { field, .. } => field,
        }
    }
}

pub(crate) fn require_positive(field: &str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ValidationError::invalid(
            field,
            format!("must be a finite value greater than zero (got {value})"),
        ));
    }
    Ok(())
}

pub(crate) fn require_finite(field: &str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::invalid(
            field,
            format!("must be finite (got {value})"),
        ));
    }
    Ok(())
}
