//! Global API functions.
//!
//! Transport queries, tempo changes, external inputs and the debug channel.

use rhai::{Dynamic, Engine, ImmutableString};

use super::host::{require_number, RhaiResult};
use super::ScriptApi;

/// Register global functions with the Rhai engine.
pub fn register(engine: &mut Engine, api: &ScriptApi) {
    let ctx = api.score.context().clone();

    // Tempo
    let c = ctx.clone();
    engine.register_fn("set_bpm", move |bpm: Dynamic| -> RhaiResult<()> {
        let bpm = require_number("bpm", &bpm)?;
        c.set_bpm(bpm).map_err(|e| e.into_rhai())
    });
    let c = ctx.clone();
    engine.register_fn("bpm", move || c.bpm());

    // Transport
    let c = ctx.clone();
    engine.register_fn("tick", move || c.tick());
    let c = ctx.clone();
    engine.register_fn("time", move || c.time());
    let c = ctx.clone();
    engine.register_fn("sample_rate", move || c.sample_rate() as i64);
    // typed, so they shadow the core package's thread-blocking sleep(FLOAT) and sleep(INT)
    let c = ctx.clone();
    engine.register_fn("sleep", move |ticks: f64| c.sleep(ticks));
    let c = ctx.clone();
    engine.register_fn("sleep", move |ticks: i64| c.sleep(ticks as f64));
    let c = ctx.clone();
    engine.register_fn("ticks_to_seconds", move |ticks: Dynamic| -> RhaiResult<f64> {
        Ok(c.ticks_to_seconds(require_number("ticks", &ticks)?))
    });
    let c = ctx.clone();
    engine.register_fn("seconds_to_ticks", move |seconds: Dynamic| -> RhaiResult<f64> {
        Ok(c.seconds_to_ticks(require_number("seconds", &seconds)?))
    });

    // Inputs pushed with SetParams
    let c = ctx.clone();
    engine.register_fn("input", move |key: ImmutableString| c.input(&key).unwrap_or(0.0));
    let c = ctx.clone();
    engine.register_fn("input", move |key: ImmutableString, default: Dynamic| -> RhaiResult<f64> {
        match c.input(&key) {
            Some(value) => Ok(value),
            None => require_number("default", &default),
        }
    });

    // Debug channel
    let c = ctx.clone();
    engine.register_fn("debug_log", move |label: ImmutableString, message: Dynamic| {
        c.debug(|d| d.log(&label, &message.to_string()));
    });
    let c = ctx.clone();
    engine.register_fn("debug_warn", move |label: ImmutableString, message: Dynamic| {
        c.debug(|d| d.warn(&label, &message.to_string()));
    });
    let c = ctx.clone();
    engine.register_fn("debug_error", move |label: ImmutableString, message: Dynamic| {
        c.debug(|d| d.error(&label, &message.to_string()));
    });
    let c = ctx.clone();
    engine.register_fn("probe", move |label: ImmutableString, value: Dynamic| -> RhaiResult<()> {
        c.probe(&label, require_number("probe", &value)?, 1.0, -1.0);
        Ok(())
    });
    engine.register_fn(
        "probe",
        move |label: ImmutableString, value: Dynamic, amp: Dynamic, duration: Dynamic| -> RhaiResult<()> {
            ctx.probe(
                &label,
                require_number("probe", &value)?,
                require_number("amp", &amp)?,
                require_number("duration", &duration)?,
            );
            Ok(())
        },
    );
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use crate::api::CompiledScore;
    use crate::context::ContextHandle;

    fn ctx() -> ContextHandle {
        ContextHandle::new(120.0, 44100).unwrap()
    }

    #[test]
    fn test_sleep_advances_ticks() {
        let ctx = ctx();
        let started = Instant::now();
        CompiledScore::evaluate("sleep(2); sleep(0.5);", &ctx).unwrap();
        assert_eq!(ctx.tick(), 2.5);
        // moves the transport, not the thread
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_sets_loop_lap() {
        let ctx = ctx();
        let compiled = CompiledScore::evaluate(
            r#"live_loop(|c, o| { sine.play(c4); sleep(0.5); }, #{ name: "lead" });"#,
            &ctx,
        )
        .unwrap();
        let mut live = compiled.build_loop("lead").unwrap();
        let started = Instant::now();
        live.fill().unwrap();
        assert_eq!(live.lap(), 0.5);
        assert_eq!(live.end_tick(), 0.5);
        assert_eq!(ctx.tick(), 0.0);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_tempo_and_transport_queries() {
        let ctx = ctx();
        CompiledScore::evaluate("set_bpm(60); sleep(1); if bpm() != 60.0 || tick() != 1.0 { throw \"transport\"; }", &ctx)
            .unwrap();
        assert_eq!(ctx.bpm(), 60.0);
        assert_eq!(ctx.tick(), 1.0);
    }
}
