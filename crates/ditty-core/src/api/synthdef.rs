//! Synth API for Rhai scripts.
//!
//! ```rhai
//! let tri = synth_def(|phase, env, tick, opts| (1.0 - 4.0 * abs(phase % 1.0 - 0.5)) * env.value, #{ attack: 0.01 });
//! tri.play(c4, #{ amp: 0.5 });
//! ```

use std::sync::Arc;

use rhai::{Dynamic, Engine, FnPtr, ImmutableString, Map};

use super::host::{option_set, require_number, returned_fn, HostCell, RhaiResult, ScriptWaveform, WaveArg};
use super::ScriptApi;
use crate::music::parse_note_name;
use crate::options::{OptionSet, Options};
use crate::synth::{SynthDef, Waveform, WaveformFactory};

/// A synth definition as seen by scripts.
#[derive(Debug, Clone)]
pub struct SynthHandle(pub Arc<SynthDef>);

/// Register synth functions with the Rhai engine.
pub fn register(engine: &mut Engine, api: &ScriptApi) {
    engine.register_type_with_name::<SynthHandle>("SynthDef");
    engine.register_get("name", |s: &mut SynthHandle| s.0.name().to_string());

    let a = api.clone();
    engine.register_fn("synth_def", move |f: FnPtr| define(&a, f, Map::new(), false));
    let a = api.clone();
    engine.register_fn("synth_def", move |f: FnPtr, defaults: Map| define(&a, f, defaults, false));
    let a = api.clone();
    engine.register_fn("synth_class", move |f: FnPtr| define(&a, f, Map::new(), true));
    let a = api.clone();
    engine.register_fn("synth_class", move |f: FnPtr, defaults: Map| define(&a, f, defaults, true));

    let score = api.score.clone();
    engine.register_fn("synth", move |name: ImmutableString| -> RhaiResult<SynthHandle> {
        score
            .synth(&name)
            .map(SynthHandle)
            .ok_or_else(|| format!("unknown synth '{}'", name).into())
    });

    let a = api.clone();
    engine.register_fn("play", move |s: &mut SynthHandle, note: Dynamic| {
        play(&a, s, note, 0.0, Map::new())
    });
    let a = api.clone();
    engine.register_fn("play", move |s: &mut SynthHandle, note: Dynamic, opts: Map| {
        play(&a, s, note, 0.0, opts)
    });
    let a = api.clone();
    engine.register_fn(
        "play_timed",
        move |s: &mut SynthHandle, note: Dynamic, offset: Dynamic| -> RhaiResult<Options> {
            play(&a, s, note, require_number("offset", &offset)?, Map::new())
        },
    );
    let a = api.clone();
    engine.register_fn(
        "play_timed",
        move |s: &mut SynthHandle, note: Dynamic, offset: Dynamic, opts: Map| -> RhaiResult<Options> {
            play(&a, s, note, require_number("offset", &offset)?, opts)
        },
    );
}

/// Register a script synth. A class is a factory called once per voice
/// that returns the voice's `fn(note, env, tick, options)`.
fn define(api: &ScriptApi, f: FnPtr, defaults: Map, class: bool) -> RhaiResult<SynthHandle> {
    let defaults = option_set(&api.host, defaults)?;
    let name = match defaults.text("name") {
        Some(name) => name.to_string(),
        None => api.score.next_synth_name(),
    };
    let factory = waveform_factory(&api.host, &name, f, class);
    let def = api.score.define_synth(SynthDef::new(&name, factory, defaults));
    Ok(SynthHandle(def))
}

fn waveform_factory(host: &HostCell, name: &str, f: FnPtr, class: bool) -> WaveformFactory {
    let host = host.clone();
    let origin = name.to_string();
    Arc::new(move |options: &Options| -> crate::error::Result<Box<dyn Waveform>> {
        if class {
            let produced = host.call(&origin, &f, (options.clone(),))?;
            Ok(Box::new(ScriptWaveform {
                host: host.clone(),
                origin: origin.clone(),
                f: returned_fn(&origin, produced)?,
                arg: WaveArg::Note,
            }))
        } else {
            Ok(Box::new(ScriptWaveform {
                host: host.clone(),
                origin: origin.clone(),
                f: f.clone(),
                arg: WaveArg::Phase,
            }))
        }
    })
}

/// A note may be a MIDI number or a note name.
fn note_number(note: &Dynamic) -> RhaiResult<f64> {
    if note.is_string() {
        let name = note.to_string();
        return parse_note_name(&name)
            .map(|n| n as f64)
            .ok_or_else(|| format!("unknown note name '{}'", name).into());
    }
    require_number("note", note)
}

fn play(api: &ScriptApi, synth: &SynthHandle, note: Dynamic, offset: f64, opts: Map) -> RhaiResult<Options> {
    let note = note_number(&note)?;
    let options: OptionSet = option_set(&api.host, opts)?;
    synth
        .0
        .play_timed(api.score.context(), note, offset, options)
        .map_err(|e| e.into_rhai())
}
