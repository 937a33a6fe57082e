//! Error types for the ditty engine.
//!
//! Every fallible operation in the core returns [`Result`]. The variants follow
//! the engine's failure taxonomy:
//!
//! - `Compile` - the score failed during the dry run; nothing was started
//! - `Runtime` - user code failed inside a generator task
//! - `Config` - a call was rejected synchronously (bad connection, bad settings)
//! - `Audio` / `Channel` - host or task plumbing failures

use thiserror::Error;

/// Errors produced by the ditty engine.
#[derive(Error, Debug)]
pub enum DittyError {
    /// The score failed to parse or evaluate during compilation.
    #[error("compile error{}: {message}", position_suffix(.line, .column))]
    Compile {
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    /// User code failed while a generator was running.
    #[error("{origin}{}: {message}", position_suffix(.line, .column))]
    Runtime {
        origin: String,
        message: String,
        line: Option<u32>,
        column: Option<u32>,
    },

    /// A configuration or connection request was rejected.
    #[error("{0}")]
    Config(String),

    /// A node named in the topology does not exist in the score.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// The audio host failed.
    #[error("audio error: {0}")]
    Audio(String),

    /// A task channel was closed unexpectedly.
    #[error("channel closed: {0}")]
    Channel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Result type for ditty operations.
pub type Result<T> = std::result::Result<T, DittyError>;

fn position_suffix(line: &Option<u32>, column: &Option<u32>) -> String {
    match (*line, *column) {
        (Some(line), Some(column)) => format!(" (line {}, column {})", line, column),
        (Some(line), None) => format!(" (line {})", line),
        _ => String::new(),
    }
}

fn split_position(pos: rhai::Position) -> (Option<u32>, Option<u32>) {
    if pos.is_none() {
        (None, None)
    } else {
        (
            pos.line().map(|l| l as u32),
            pos.position().map(|c| c as u32),
        )
    }
}

impl DittyError {
    /// Create a compile error from a Rhai parse error.
    pub fn from_rhai_parse(err: rhai::ParseError) -> Self {
        let (line, column) = split_position(err.position());
        DittyError::Compile {
            message: err.0.to_string(),
            line,
            column,
        }
    }

    /// Create a compile error from a Rhai evaluation error raised during the dry run.
    pub fn from_rhai_compile(err: Box<rhai::EvalAltResult>) -> Self {
        let (line, column) = split_position(err.position());
        DittyError::Compile {
            message: err.to_string(),
            line,
            column,
        }
    }

    /// Create a runtime error from a Rhai evaluation error.
    pub fn from_rhai_runtime(origin: &str, err: Box<rhai::EvalAltResult>) -> Self {
        let (line, column) = split_position(err.position());
        DittyError::Runtime {
            origin: origin.to_string(),
            message: err.to_string(),
            line,
            column,
        }
    }

    /// Create a runtime error without a source position.
    pub fn runtime(origin: impl Into<String>, message: impl Into<String>) -> Self {
        DittyError::Runtime {
            origin: origin.into(),
            message: message.into(),
            line: None,
            column: None,
        }
    }

    /// Line and column of the offending source, if known.
    pub fn position(&self) -> (Option<u32>, Option<u32>) {
        match self {
            DittyError::Compile { line, column, .. } | DittyError::Runtime { line, column, .. } => {
                (*line, *column)
            }
            _ => (None, None),
        }
    }

    /// Convert into a Rhai error so it can surface at the script call site.
    pub fn into_rhai(self) -> Box<rhai::EvalAltResult> {
        self.to_string().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display() {
        let err = DittyError::Compile {
            message: "unexpected token".to_string(),
            line: Some(3),
            column: Some(7),
        };
        assert_eq!(err.to_string(), "compile error (line 3, column 7): unexpected token");
        assert_eq!(err.position(), (Some(3), Some(7)));
    }

    #[test]
    fn test_runtime_error_without_position() {
        let err = DittyError::runtime("bass", "boom");
        assert_eq!(err.to_string(), "bass: boom");
        assert_eq!(err.position(), (None, None));
    }

    #[test]
    fn test_parse_error_conversion() {
        let engine = rhai::Engine::new();
        let err = engine.compile("let x = ;").unwrap_err();
        let converted = DittyError::from_rhai_parse(err);
        assert!(matches!(converted, DittyError::Compile { line: Some(1), .. }));
    }
}
