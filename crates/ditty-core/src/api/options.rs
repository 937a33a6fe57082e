//! Live option objects and envelope state as script types.
//!
//! `opts.cutoff` and `opts["cutoff"]` both go through the string indexer.
//! Writes made while a loop is filling are recorded and replayed at their
//! tick; other writes apply immediately.

use rhai::{Dynamic, Engine, ImmutableString};

use super::host::{option_value, read_option, to_array, RhaiResult};
use super::ScriptApi;
use crate::envelope::EnvelopeView;
use crate::options::Options;

pub fn register(engine: &mut Engine, api: &ScriptApi) {
    engine.register_type_with_name::<Options>("Options");
    engine.register_indexer_get(|options: &mut Options, key: ImmutableString| -> RhaiResult<Dynamic> {
        read_option(options, &key)
    });

    let host = api.host.clone();
    engine.register_indexer_set(
        move |options: &mut Options, key: ImmutableString, value: Dynamic| -> RhaiResult<()> {
            let value = option_value(&host, &key, value)?;
            options.set(&key, value);
            Ok(())
        },
    );

    engine.register_fn("contains", |options: &mut Options, key: ImmutableString| {
        options.contains(&key)
    });
    engine.register_fn("keys", |options: &mut Options| -> rhai::Array {
        options.keys().into_iter().map(Dynamic::from).collect()
    });
    // ticks since the object was created
    engine.register_fn("elapsed", |options: &mut Options| options.tick());
    engine.register_fn("to_string", |options: &mut Options| format!("{:?}", options));
    engine.register_fn("to_debug", |options: &mut Options| format!("{:?}", options));

    engine.register_type_with_name::<EnvelopeView>("Envelope");
    engine.register_get("value", |env: &mut EnvelopeView| env.value);
    engine.register_get("progress", |env: &mut EnvelopeView| env.progress);
    engine.register_get("duration", |env: &mut EnvelopeView| env.duration);
    engine.register_get("active", |env: &mut EnvelopeView| env.active);
    engine.register_fn("to_string", |env: &mut EnvelopeView| {
        format!("Envelope(value: {:.3}, progress: {:.3})", env.value, env.progress)
    });

    // lists read back as plain arrays
    engine.register_fn("list", |options: &mut Options, key: ImmutableString| -> RhaiResult<rhai::Array> {
        let values = options.list(&key).map_err(|e| e.into_rhai())?;
        Ok(values.map(|v| to_array(&v)).unwrap_or_default())
    });
}
