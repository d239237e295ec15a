//! Error types for the lowering and intrinsic synthesis core

use thiserror::Error;

/// Result type for lowering and synthesis operations
pub type LowerResult<T> = Result<T, LowerError>;

/// Lowering and synthesis errors
#[derive(Debug, Error)]
pub enum LowerError {
    /// A compute pattern outside the supported set, or an input without storage
    #[error("Unsupported pattern: {message}")]
    UnsupportedPattern { message: String },

    /// A schedule precondition failed; callers may retry with another schedule
    #[error("Schedule constraint violated by {object}: {message}")]
    ScheduleConstraint { object: String, message: String },

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Duplicate registration of function `{name}`")]
    DuplicateRegistration { name: String },

    #[error("Unknown function: {name}")]
    UnknownFunction { name: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid IR: {message}")]
    InvalidIr { message: String },

    #[error("Lexer error at position {position}: {message}")]
    LexerError { position: usize, message: String },

    #[error("Parse error: {message}")]
    ParseError { message: String },
}

impl LowerError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        LowerError::UnsupportedPattern { message: msg.into() }
    }

    pub fn schedule(object: impl Into<String>, msg: impl Into<String>) -> Self {
        LowerError::ScheduleConstraint {
            object: object.into(),
            message: msg.into(),
        }
    }

    pub fn invalid_param(msg: impl Into<String>) -> Self {
        LowerError::InvalidParameter { message: msg.into() }
    }

    pub fn duplicate(name: impl Into<String>) -> Self {
        LowerError::DuplicateRegistration { name: name.into() }
    }

    pub fn unknown_function(name: impl Into<String>) -> Self {
        LowerError::UnknownFunction { name: name.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        LowerError::ConfigError { message: msg.into() }
    }

    pub fn invalid_ir(msg: impl Into<String>) -> Self {
        LowerError::InvalidIr { message: msg.into() }
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        LowerError::ParseError { message: msg.into() }
    }

    /// Whether a caller can recover by choosing a different schedule
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LowerError::ScheduleConstraint { .. })
    }
}
