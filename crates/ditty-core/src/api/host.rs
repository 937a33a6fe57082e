//! Bridge between script callbacks and the engine.
//!
//! Synth, filter and loop bodies are script function pointers. They are
//! called long after the score finished evaluating, from whichever thread
//! owns the compiled score, so each adapter keeps a [`HostCell`] through
//! which it reaches the engine and AST again.

use std::sync::{Arc, OnceLock, Weak};

use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, FuncArgs, Map, Scope, AST};

use crate::error::{DittyError, Result};
use crate::filter::FilterProcess;
use crate::music::note_constants;
use crate::options::{OptionFn, OptionSet, OptionValue, Options};
use crate::scheduler::LoopBody;
use crate::synth::{Frame, VoiceInput, Waveform};

pub type RhaiResult<T> = std::result::Result<T, Box<EvalAltResult>>;

struct ScriptHost {
    engine: Weak<Engine>,
    ast: Arc<AST>,
    scope: Scope<'static>,
}

/// Late-bound handle to the engine and AST that own the script callbacks.
#[derive(Clone, Default)]
pub struct HostCell {
    host: Arc<OnceLock<ScriptHost>>,
}

impl HostCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the compiled score and the scope it starts from. Only the first
    /// binding counts.
    pub fn bind(&self, engine: &Arc<Engine>, ast: Arc<AST>, scope: &Scope<'static>) {
        let _ = self.host.set(ScriptHost {
            engine: Arc::downgrade(engine),
            ast,
            scope: scope.clone(),
        });
    }

    /// Call a script function. Failures become runtime errors of `origin`.
    pub fn call(&self, origin: &str, f: &FnPtr, args: impl FuncArgs) -> Result<Dynamic> {
        let host = self
            .host
            .get()
            .ok_or_else(|| DittyError::runtime(origin, "score is not compiled yet"))?;
        let engine = host
            .engine
            .upgrade()
            .ok_or_else(|| DittyError::runtime(origin, "score engine was dropped"))?;
        f.call::<Dynamic>(&engine, &host.ast, args)
            .map_err(|e| DittyError::from_rhai_runtime(origin, e))
    }

    /// Re-run the whole score in a fresh copy of its starting scope.
    pub fn rerun(&self, origin: &str) -> Result<()> {
        let host = self
            .host
            .get()
            .ok_or_else(|| DittyError::runtime(origin, "score is not compiled yet"))?;
        let engine = host
            .engine
            .upgrade()
            .ok_or_else(|| DittyError::runtime(origin, "score engine was dropped"))?;
        engine
            .run_ast_with_scope(&mut host.scope.clone(), &host.ast)
            .map_err(|e| DittyError::from_rhai_runtime(origin, e))
    }
}

/// Scope every score starts with: note-name constants such as `c4` or `fs3`.
pub fn note_scope() -> Scope<'static> {
    let mut scope = Scope::new();
    for (name, midi) in note_constants() {
        scope.push_constant(name, midi as f64);
    }
    scope
}

// === Value conversion ===

pub fn number(value: &Dynamic) -> Option<f64> {
    value
        .as_float()
        .ok()
        .or_else(|| value.as_int().ok().map(|v| v as f64))
        .or_else(|| value.as_bool().ok().map(|v| if v { 1.0 } else { 0.0 }))
}

/// Numeric argument, accepting ints and floats.
pub fn require_number(what: &str, value: &Dynamic) -> RhaiResult<f64> {
    number(value).ok_or_else(|| format!("{} must be a number, got {}", what, value.type_name()).into())
}

pub fn numbers(what: &str, values: &Array) -> RhaiResult<Vec<f64>> {
    values.iter().map(|v| require_number(what, v)).collect()
}

pub fn to_array(values: &[f64]) -> Array {
    values.iter().map(|&v| Dynamic::from_float(v)).collect()
}

/// Convert a script value into an option value. Function pointers become
/// live options evaluated on every read.
pub fn option_value(host: &HostCell, key: &str, value: Dynamic) -> RhaiResult<OptionValue> {
    if let Some(v) = number(&value) {
        return Ok(OptionValue::Number(v));
    }
    if value.is_string() {
        return Ok(OptionValue::Text(value.into_string()?));
    }
    if value.is_array() {
        let values = value.into_array()?;
        return Ok(OptionValue::List(numbers(key, &values)?));
    }
    if let Some(f) = value.clone().try_cast::<FnPtr>() {
        let host = host.clone();
        let origin = key.to_string();
        let eval: OptionFn = Arc::new(move |tick: f64, options: &Options| -> Result<f64> {
            let result = host.call(&origin, &f, (tick, options.clone()))?;
            number(&result).ok_or_else(|| {
                DittyError::runtime(origin.clone(), format!("option function returned {}", result.type_name()))
            })
        });
        return Ok(OptionValue::Function(eval));
    }
    Err(format!("option '{}' can't hold a {}", key, value.type_name()).into())
}

pub fn option_set(host: &HostCell, map: Map) -> RhaiResult<OptionSet> {
    let mut set = OptionSet::new();
    for (key, value) in map {
        let value = option_value(host, key.as_str(), value)?;
        set.set(key.as_str(), value);
    }
    Ok(set)
}

/// Read an option for a script. Function-valued options are evaluated.
pub fn read_option(options: &Options, key: &str) -> RhaiResult<Dynamic> {
    Ok(match options.get(key) {
        None => Dynamic::UNIT,
        Some(OptionValue::Number(v)) => Dynamic::from_float(v),
        Some(OptionValue::Text(s)) => Dynamic::from(s),
        Some(OptionValue::List(values)) => Dynamic::from_array(to_array(&values)),
        Some(OptionValue::Function(_)) => match options.number(key).map_err(|e| e.into_rhai())? {
            Some(v) => Dynamic::from_float(v),
            None => Dynamic::UNIT,
        },
    })
}

fn frame_from(origin: &str, value: &Dynamic) -> Result<Frame> {
    if let Some(v) = number(value) {
        return Ok([v, v]);
    }
    if let Some(pair) = value.read_lock::<Array>() {
        if let [l, r, ..] = pair.as_slice() {
            if let (Some(l), Some(r)) = (number(l), number(r)) {
                return Ok([l, r]);
            }
        }
    }
    Err(DittyError::runtime(
        origin,
        format!("expected a number or [left, right], got {}", value.type_name()),
    ))
}

/// Resolve a factory result into the function it returned.
pub fn returned_fn(origin: &str, value: Dynamic) -> Result<FnPtr> {
    let type_name = value.type_name();
    value
        .try_cast::<FnPtr>()
        .ok_or_else(|| DittyError::runtime(origin, format!("factory must return a function, got {}", type_name)))
}

// === Callback adapters ===

/// First argument handed to a synth function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveArg {
    /// Oscillator phase in cycles.
    Phase,
    /// The voice's note.
    Note,
}

pub struct ScriptWaveform {
    pub host: HostCell,
    pub origin: String,
    pub f: FnPtr,
    pub arg: WaveArg,
}

impl Waveform for ScriptWaveform {
    fn process(&mut self, input: &VoiceInput, options: &Options) -> Result<Frame> {
        let first = match self.arg {
            WaveArg::Phase => input.phase,
            WaveArg::Note => input.note,
        };
        let value = self
            .host
            .call(&self.origin, &self.f, (first, input.envelope, input.tick, options.clone()))?;
        frame_from(&self.origin, &value)
    }
}

pub struct ScriptFilter {
    pub host: HostCell,
    pub origin: String,
    pub f: FnPtr,
}

impl FilterProcess for ScriptFilter {
    fn process(&mut self, frame: Frame, options: &Options) -> Result<Frame> {
        let input: Array = vec![Dynamic::from_float(frame[0]), Dynamic::from_float(frame[1])];
        let value = self.host.call(&self.origin, &self.f, (input, options.clone()))?;
        frame_from(&self.origin, &value)
    }
}

pub struct ScriptLoopBody {
    pub host: HostCell,
    pub origin: String,
    pub f: FnPtr,
}

impl LoopBody for ScriptLoopBody {
    fn run(&mut self, cycle: u64, options: &Options) -> Result<()> {
        self.host
            .call(&self.origin, &self.f, (cycle as i64, options.clone()))
            .map(|_| ())
    }
}
