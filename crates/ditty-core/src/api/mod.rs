//! Ditty API for Rhai scripting.
//!
//! Every evaluation context gets its own engine: one for the dry run and one
//! per generator task. Registered functions close over a [`ScriptApi`], so
//! nothing is shared between contexts.
//!
//! # Usage
//!
//! 1. Create the task's [`ContextHandle`]
//! 2. Evaluate the score with [`CompiledScore::evaluate`]
//! 3. Read its structure, or build the loop or shared filter the task renders

pub mod global;
pub mod helpers;
pub mod host;
pub mod loops;
pub mod options;
pub mod synthdef;

use std::sync::Arc;

use rhai::{Engine, Scope};

use crate::config::EngineConfig;
use crate::context::ContextHandle;
use crate::error::{DittyError, Result};
use crate::filter::FilterNode;
use crate::operator::Operator;
use crate::options::{OptionSet, Options};
use crate::scheduler::{LiveLoop, LoopBody};
use crate::score::{LoopBodyFactory, ScoreDefinition};
use crate::topology::ScoreStructure;

pub use host::HostCell;
pub use loops::{FilterDefHandle, FilterHandle, LoopHandle};
pub use synthdef::SynthHandle;

/// Sync value of the loop wrapped around scores that declare none.
pub const IMPLICIT_LOOP_SYNC: f64 = 1e10;

/// State captured by every registered function of one engine.
#[derive(Clone)]
pub struct ScriptApi {
    pub score: ScoreDefinition,
    pub host: HostCell,
}

impl ScriptApi {
    pub fn new(ctx: &ContextHandle) -> Self {
        Self {
            score: ScoreDefinition::new(ctx),
            host: HostCell::new(),
        }
    }

    /// Scope a score starts from: note names and the built-in synths.
    pub fn scope(&self) -> Scope<'static> {
        let mut scope = host::note_scope();
        if let Some(sine) = self.score.synth("sine") {
            scope.push_constant("sine", SynthHandle(sine));
        }
        scope
    }
}

/// Register all ditty API functions with a Rhai engine.
///
/// This registers:
/// - Transport, input and debug functions
/// - Live option objects and envelope state
/// - Synth definitions and `play`
/// - Loops, filters and connections
/// - Music helpers
pub fn register_api(engine: &mut Engine, api: &ScriptApi) {
    global::register(engine, api);
    options::register(engine, api);
    synthdef::register(engine, api);
    loops::register(engine, api);
    helpers::register(engine);
}

/// Create a Rhai engine with all ditty API registered.
pub fn create_engine(api: &ScriptApi) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(4096, 4096);
    engine.set_max_call_levels(4096);

    engine.on_print(|text| {
        log::info!("[score] {}", text);
    });

    engine.on_debug(|text, source, pos| {
        let loc = match (source, pos) {
            (Some(src), pos) if !pos.is_none() => format!(" ({}:{})", src, pos),
            (Some(src), _) => format!(" ({})", src),
            (None, pos) if !pos.is_none() => format!(" ({})", pos),
            _ => String::new(),
        };
        log::debug!("[score]{} {}", loc, text);
    });

    register_api(&mut engine, api);

    engine
}

/// A score evaluated in its own engine.
pub struct CompiledScore {
    engine: Arc<Engine>,
    api: ScriptApi,
}

impl CompiledScore {
    /// Parse and run `code` against `ctx`.
    ///
    /// Operators recorded by top-level code are not scheduled: option writes
    /// apply immediately and notes are dropped, since only loops play notes.
    /// A score that declares no loop gets an implicit `loop_0` re-running
    /// the whole script.
    pub fn evaluate(code: &str, ctx: &ContextHandle) -> Result<Self> {
        let api = ScriptApi::new(ctx);
        let engine = Arc::new(create_engine(&api));
        let ast = Arc::new(engine.compile(code).map_err(DittyError::from_rhai_parse)?);
        let scope = api.scope();
        api.host.bind(&engine, ast.clone(), &scope);

        let previous = ctx.begin_recording();
        let result = engine.run_ast_with_scope(&mut scope.clone(), &ast);
        let recorded = ctx.end_recording(previous);
        result.map_err(DittyError::from_rhai_compile)?;

        let mut dropped = 0;
        for operator in recorded {
            match operator {
                Operator::ParamChange { target, key, value, .. } => target.set_now(&key, value),
                Operator::NoteOn { .. } => dropped += 1,
            }
        }

        let compiled = Self { engine, api };
        if !compiled.api.score.has_loops() {
            compiled.add_implicit_loop();
        } else if dropped > 0 {
            log::warn!("[score] {} note(s) played outside a loop were dropped", dropped);
            ctx.debug(|d| d.warn("score", "notes only play inside a loop"));
        }
        Ok(compiled)
    }

    fn add_implicit_loop(&self) {
        let host = self.api.host.clone();
        let factory: LoopBodyFactory = Arc::new(move |_options: &Options| -> Result<Box<dyn LoopBody>> {
            let host = host.clone();
            Ok(Box::new(move |_cycle: u64, _options: &Options| host.rerun("loop_0")))
        });
        let options = OptionSet::new()
            .with("name", "loop_0")
            .with("sync", IMPLICIT_LOOP_SYNC);
        self.api.score.add_loop(factory, options);
        log::debug!("[score] no loops declared, playing the score as loop_0");
    }

    pub fn score(&self) -> &ScoreDefinition {
        &self.api.score
    }

    pub fn context(&self) -> &ContextHandle {
        self.api.score.context()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn structure(&self) -> ScoreStructure {
        self.api.score.structure()
    }

    pub fn build_loop(&self, name: &str) -> Result<LiveLoop> {
        self.api.score.build_loop(name)
    }

    pub fn build_shared_filter(&self, name: &str) -> Result<FilterNode> {
        self.api.score.build_shared_filter(name)
    }
}

/// Dry-run a score and return its validated structure.
pub fn analyze(code: &str, config: &EngineConfig) -> Result<ScoreStructure> {
    let ctx = ContextHandle::new(config.bpm, config.sample_rate)?;
    let compiled = CompiledScore::evaluate(code, &ctx)?;
    let structure = compiled.structure();
    structure.validate()?;
    Ok(structure)
}
