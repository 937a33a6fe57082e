//! Validation of ditty scores.
//!
//! Runs the dry run without any audio host and additionally fills the first
//! cycle of every loop, so errors in loop bodies and loops without duration
//! show up before playback starts.

use crate::api::CompiledScore;
use crate::config::EngineConfig;
use crate::context::ContextHandle;
use crate::error::DittyError;
use crate::scheduler::NO_DURATION_WARNING;
use crate::topology::{NodeKind, ScoreStructure};

/// Result of score validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Parse errors and errors raised while evaluating the score.
    pub compile_errors: Vec<ValidationError>,
    /// Errors raised by loop bodies during their first cycle.
    pub runtime_errors: Vec<ValidationError>,
    /// Problems with how loops and filters are connected.
    pub topology_errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
    /// Structure of the score, if it evaluated.
    pub structure: Option<ScoreStructure>,
}

impl ValidationResult {
    /// Check if the validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        self.compile_errors.is_empty() && self.runtime_errors.is_empty() && self.topology_errors.is_empty()
    }

    /// Get all errors combined.
    pub fn all_errors(&self) -> Vec<&ValidationError> {
        self.compile_errors
            .iter()
            .chain(self.runtime_errors.iter())
            .chain(self.topology_errors.iter())
            .collect()
    }
}

/// An error found during validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub message: String,
    /// Loop or filter the error belongs to.
    pub node: Option<String>,
    /// Line number (1-based).
    pub line: Option<u32>,
    /// Column number (1-based).
    pub column: Option<u32>,
}

impl ValidationError {
    fn from_error(err: &DittyError, node: Option<&str>) -> Self {
        let (line, column) = err.position();
        let message = match err {
            DittyError::Compile { message, .. } | DittyError::Runtime { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            message,
            node: node.map(str::to_string),
            line,
            column,
        }
    }
}

/// Validate a score without starting any task.
///
/// This function:
/// 1. Evaluates the score in an isolated engine
/// 2. Checks the topology for missing shared filters and cycles
/// 3. Builds every loop and fills its first cycle
pub fn validate_score(content: &str, config: &EngineConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    let ctx = match ContextHandle::new(config.bpm, config.sample_rate) {
        Ok(ctx) => ctx,
        Err(e) => {
            result.compile_errors.push(ValidationError::from_error(&e, None));
            return result;
        }
    };

    let compiled = match CompiledScore::evaluate(content, &ctx) {
        Ok(compiled) => compiled,
        Err(e) => {
            result.compile_errors.push(ValidationError::from_error(&e, None));
            return result;
        }
    };

    let structure = compiled.structure();
    if let Err(e) = structure.validate() {
        result.topology_errors.push(ValidationError::from_error(&e, None));
    }

    for entry in &structure.loops {
        let start = ctx.tick();
        let outcome = compiled.build_loop(&entry.name).and_then(|mut live| {
            live.fill()?;
            Ok(live.end_tick() <= start)
        });
        match outcome {
            Ok(true) => result.warnings.push(format!("{} {}", entry.name, NO_DURATION_WARNING)),
            Ok(false) => {}
            Err(e) => result
                .runtime_errors
                .push(ValidationError::from_error(&e, Some(&entry.name))),
        }
        ctx.set_tick(start);
    }

    for entry in structure.tasks() {
        if entry.kind == NodeKind::SharedFilter {
            if let Err(e) = compiled.build_shared_filter(&entry.name) {
                result
                    .runtime_errors
                    .push(ValidationError::from_error(&e, Some(&entry.name)));
            }
        }
    }

    // drain what the dry fills produced so nothing leaks into later use of ctx
    let _ = ctx.take_debug();
    let _ = ctx.take_notes();

    result.structure = Some(structure);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(code: &str) -> ValidationResult {
        validate_score(code, &EngineConfig::default())
    }

    #[test]
    fn test_validate_empty_score() {
        let result = validate("");
        assert!(result.is_ok());
        let structure = result.structure.unwrap();
        assert_eq!(structure.loops.len(), 1);
    }

    #[test]
    fn test_validate_syntax_error() {
        let result = validate("let x = ;");
        assert!(!result.is_ok());
        assert_eq!(result.compile_errors.len(), 1);
        assert_eq!(result.compile_errors[0].line, Some(1));
        assert!(result.structure.is_none());
    }

    #[test]
    fn test_validate_undefined_variable() {
        let result = validate("print(undefined_var);");
        assert!(!result.is_ok());
        assert!(!result.compile_errors.is_empty());
    }

    #[test]
    fn test_validate_loop_body_error() {
        let result = validate(r#"live_loop(|c, o| { no_such_fn(); }, #{ name: "lead" });"#);
        assert!(!result.is_ok());
        assert_eq!(result.runtime_errors.len(), 1);
        assert_eq!(result.runtime_errors[0].node.as_deref(), Some("lead"));
    }

    #[test]
    fn test_validate_zero_duration_warning() {
        let result = validate(r#"live_loop(|c, o| { sine.play(c4); }, #{ name: "lead" });"#);
        assert!(result.is_ok());
        assert_eq!(result.warnings, vec![format!("lead {}", NO_DURATION_WARNING)]);
    }

    #[test]
    fn test_validate_demos() {
        let demos = [
            ("basics", include_str!("../../../../demos/basics.ditty")),
            ("layers", include_str!("../../../../demos/layers.ditty")),
            ("inputs", include_str!("../../../../demos/inputs.ditty")),
        ];
        for (name, code) in demos {
            let result = validate(code);
            assert!(result.is_ok(), "{}: {:?}", name, result.all_errors());
            assert!(result.warnings.is_empty(), "{}: {:?}", name, result.warnings);
        }
    }

    #[test]
    fn test_validate_synced_loop_has_no_warning() {
        let result = validate(r#"live_loop(|c, o| { sine.play(c4); }, #{ "sync": 4 });"#);
        assert!(result.is_ok());
        assert!(result.warnings.is_empty());
    }
}
