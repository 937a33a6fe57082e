//! Loop and filter API for Rhai scripts.
//!
//! ```rhai
//! let echo = filter_def(|input, opts| [input[0] * opts.gain, input[1] * opts.gain], #{ gain: 0.8 });
//! let verb = echo.create_shared(#{ name: "verb" });
//!
//! live_loop(|cycle, opts| {
//!     sine.play(ring([c4, e4, g4], cycle), #{ duration: 0.5 });
//!     sleep(1);
//! }, #{ name: "lead", "sync": 4 }).connect(verb);
//! ```
//!
//! `sync` is a reserved word in Rhai, so the key is written quoted in map
//! literals and read back as `opts["sync"]`.

use std::sync::Arc;

use rhai::{Engine, FnPtr, Map};

use super::host::{option_set, returned_fn, HostCell, RhaiResult, ScriptFilter, ScriptLoopBody};
use super::ScriptApi;
use crate::error::Result;
use crate::filter::{FilterDef, FilterFactory, FilterProcess};
use crate::options::Options;
use crate::scheduler::LoopBody;
use crate::score::LoopBodyFactory;
use crate::topology::RunAs;

/// A declared loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopHandle {
    pub name: String,
}

/// A filter definition, not yet placed in the score.
#[derive(Debug, Clone)]
pub struct FilterDefHandle(pub Arc<FilterDef>);

/// A filter instance placed in the score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterHandle {
    pub name: String,
}

/// Register loop and filter functions with the Rhai engine.
pub fn register(engine: &mut Engine, api: &ScriptApi) {
    engine.register_type_with_name::<LoopHandle>("Loop");
    engine.register_type_with_name::<FilterDefHandle>("FilterDef");
    engine.register_type_with_name::<FilterHandle>("Filter");

    // Loops
    let a = api.clone();
    engine.register_fn("live_loop", move |f: FnPtr| add_loop(&a, f, Map::new(), false));
    let a = api.clone();
    engine.register_fn("live_loop", move |f: FnPtr, opts: Map| add_loop(&a, f, opts, false));
    let a = api.clone();
    engine.register_fn("live_loop_class", move |f: FnPtr| add_loop(&a, f, Map::new(), true));
    let a = api.clone();
    engine.register_fn("live_loop_class", move |f: FnPtr, opts: Map| add_loop(&a, f, opts, true));

    engine.register_get("name", |l: &mut LoopHandle| l.name.clone());
    let score = api.score.clone();
    engine.register_get("options", move |l: &mut LoopHandle| -> RhaiResult<Options> {
        score
            .loop_options(&l.name)
            .ok_or_else(|| format!("unknown loop '{}'", l.name).into())
    });
    let score = api.score.clone();
    engine.register_fn("connect", move |l: &mut LoopHandle, to: FilterHandle| -> RhaiResult<LoopHandle> {
        score.connect(&l.name, &to.name).map_err(|e| e.into_rhai())?;
        Ok(l.clone())
    });

    // Filter definitions
    let a = api.clone();
    engine.register_fn("filter_def", move |f: FnPtr| define_filter(&a, f, Map::new(), false));
    let a = api.clone();
    engine.register_fn("filter_def", move |f: FnPtr, defaults: Map| define_filter(&a, f, defaults, false));
    let a = api.clone();
    engine.register_fn("filter_class", move |f: FnPtr| define_filter(&a, f, Map::new(), true));
    let a = api.clone();
    engine.register_fn("filter_class", move |f: FnPtr, defaults: Map| define_filter(&a, f, defaults, true));

    engine.register_get("name", |d: &mut FilterDefHandle| d.0.name().to_string());
    let a = api.clone();
    engine.register_fn("create", move |d: &mut FilterDefHandle| create(&a, d, Map::new(), RunAs::Inline));
    let a = api.clone();
    engine.register_fn("create", move |d: &mut FilterDefHandle, opts: Map| create(&a, d, opts, RunAs::Inline));
    let a = api.clone();
    engine.register_fn("create_shared", move |d: &mut FilterDefHandle| create(&a, d, Map::new(), RunAs::Task));
    let a = api.clone();
    engine.register_fn("create_shared", move |d: &mut FilterDefHandle, opts: Map| {
        create(&a, d, opts, RunAs::Task)
    });

    // Filter instances
    engine.register_get("name", |f: &mut FilterHandle| f.name.clone());
    let score = api.score.clone();
    engine.register_get("options", move |f: &mut FilterHandle| -> RhaiResult<Options> {
        score
            .filter_options(&f.name)
            .ok_or_else(|| format!("unknown filter '{}'", f.name).into())
    });
    let score = api.score.clone();
    engine.register_fn("connect", move |f: &mut FilterHandle, to: FilterHandle| -> RhaiResult<FilterHandle> {
        score.connect(&f.name, &to.name).map_err(|e| e.into_rhai())?;
        Ok(f.clone())
    });
}

/// Declare a loop. A class is a factory called with the loop's options
/// that returns the `fn(cycle, options)` body.
fn add_loop(api: &ScriptApi, f: FnPtr, opts: Map, class: bool) -> RhaiResult<LoopHandle> {
    let options = option_set(&api.host, opts)?;
    let host = api.host.clone();
    let factory: LoopBodyFactory = Arc::new(move |options: &Options| -> Result<Box<dyn LoopBody>> {
        let origin = options.text("name").unwrap_or_default();
        let f = if class {
            let produced = host.call(&origin, &f, (options.clone(),))?;
            returned_fn(&origin, produced)?
        } else {
            f.clone()
        };
        Ok(Box::new(ScriptLoopBody {
            host: host.clone(),
            origin,
            f,
        }))
    });
    let name = api.score.add_loop(factory, options);
    Ok(LoopHandle { name })
}

fn define_filter(api: &ScriptApi, f: FnPtr, defaults: Map, class: bool) -> RhaiResult<FilterDefHandle> {
    let defaults = option_set(&api.host, defaults)?;
    let name = match defaults.text("name") {
        Some(name) => name.to_string(),
        None => api.score.next_filter_name(),
    };
    let factory = filter_factory(&api.host, f, class);
    let def = api.score.define_filter(FilterDef::new(&name, factory, defaults));
    Ok(FilterDefHandle(def))
}

fn filter_factory(host: &HostCell, f: FnPtr, class: bool) -> FilterFactory {
    let host = host.clone();
    Arc::new(move |options: &Options| -> Result<Box<dyn FilterProcess>> {
        let origin = options.text("name").unwrap_or_default();
        let f = if class {
            let produced = host.call(&origin, &f, (options.clone(),))?;
            returned_fn(&origin, produced)?
        } else {
            f.clone()
        };
        Ok(Box::new(ScriptFilter {
            host: host.clone(),
            origin,
            f,
        }))
    })
}

fn create(api: &ScriptApi, def: &FilterDefHandle, opts: Map, run_as: RunAs) -> RhaiResult<FilterHandle> {
    let options = option_set(&api.host, opts)?;
    let name = api.score.create_filter(&def.0, options, run_as);
    Ok(FilterHandle { name })
}

#[cfg(test)]
mod tests {
    use crate::api::CompiledScore;
    use crate::context::ContextHandle;

    #[test]
    fn test_quoted_sync_fills_to_next_multiple() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let compiled = CompiledScore::evaluate(
            r#"live_loop(|c, o| { sine.play(c4); sleep(1); }, #{ name: "lead", "sync": 4 });"#,
            &ctx,
        )
        .unwrap();
        let options = compiled.score().loop_options("lead").unwrap();
        assert_eq!(options.number("sync").unwrap(), Some(4.0));

        ctx.set_tick(5.0);
        let mut live = compiled.build_loop("lead").unwrap();
        live.fill().unwrap();
        assert_eq!(live.lap(), 1.0);
        assert_eq!(live.end_tick(), 8.0);
    }

    #[test]
    fn test_sync_reads_back_by_index() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let compiled = CompiledScore::evaluate(
            r#"live_loop(|c, o| { if o["sync"] != 2 { throw "sync"; } sleep(1); }, #{ name: "lead", "sync": 2 });"#,
            &ctx,
        )
        .unwrap();
        let mut live = compiled.build_loop("lead").unwrap();
        live.fill().unwrap();
        assert_eq!(live.end_tick(), 2.0);
    }
}
