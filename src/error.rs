//! Error taxonomy for schema and record operations.
//!
//! Every failure the record service or the schema store can report maps to
//! one `ApiError` variant, and each variant carries the HTTP-like status the
//! hosted backend would answer with.

use thiserror::Error;

/// Result type for schema and record operations
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// A single rejected field in a payload or collection definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub code: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// All field errors collected while validating one payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<FieldError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: FieldError) {
        self.0.push(error);
    }

    pub fn add(&mut self, field: &str, code: &'static str, message: impl Into<String>) {
        self.0.push(FieldError::new(field, code, message));
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a given field has at least one error
    pub fn has(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }

    /// Turn the collected errors into a result
    pub fn into_result(self) -> ApiResult<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(self))
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Errors reported by the schema store and the record service
#[derive(Debug, Error)]
pub enum ApiError {
    /// Payload or collection definition failed validation
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    /// The access rule denies the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown collection or record, or a record hidden by its rule
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request is well-formed but cannot be applied
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A rule or filter string failed to parse
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    /// Uniqueness or ordering conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unexpected failure inside the service
    #[error("Internal error: {0}")]
    Internal(String),

    /// Storage I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ApiError {
    /// HTTP status the hosted backend would answer with
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) | ApiError::InvalidExpression(_) => {
                400
            }
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::Internal(_) | ApiError::Io(_) | ApiError::Serialization(_) => 500,
        }
    }

    /// Short machine-readable code, used in the audit log
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_failed",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::InvalidExpression(_) => "invalid_expression",
            ApiError::Conflict(_) => "conflict",
            ApiError::Internal(_) => "internal_error",
            ApiError::Io(_) => "io_error",
            ApiError::Serialization(_) => "serialization_error",
        }
    }

    pub fn validation(field: &str, code: &'static str, message: impl Into<String>) -> Self {
        ApiError::Validation(ValidationErrors(vec![FieldError::new(field, code, message)]))
    }

    /// Field errors if this is a validation failure
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ApiError::Validation(errors) => &errors.0,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::Forbidden("x".into()).status(), 403);
        assert_eq!(ApiError::NotFound("x".into()).status(), 404);
        assert_eq!(ApiError::validation("file", "too_large", "too big").status(), 400);
        assert_eq!(ApiError::Internal("hash".into()).status(), 500);
        assert_eq!(ApiError::Conflict("dup".into()).status(), 409);
    }

    #[test]
    fn test_validation_display() {
        let mut errors = ValidationErrors::new();
        errors.add("category", "invalid_value", "Unknown option 'Jazz'");
        errors.add("file", "too_large", "File exceeds 5242880 bytes");
        assert!(errors.has("file"));
        assert!(!errors.has("description"));

        let err = errors.into_result().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("[category]: Unknown option 'Jazz'"));
        assert!(text.contains("[file]: File exceeds 5242880 bytes"));
        assert_eq!(err.field_errors().len(), 2);
    }

    #[test]
    fn test_empty_errors_are_ok() {
        assert!(ValidationErrors::new().into_result().is_ok());
    }
}
