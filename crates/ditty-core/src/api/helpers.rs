//! Helper functions for Rhai scripts.
//!
//! Pitch conversion, scales and chords, and a few sequence utilities. The
//! sequence helpers are free functions, so `choose(notes)` and
//! `notes.choose()` both work.

use rhai::{Array, Dynamic, Engine, ImmutableString};

use super::host::{require_number, to_array, RhaiResult};
use crate::music;

/// Register helper functions with the Rhai engine.
pub fn register(engine: &mut Engine) {
    // Pitch
    engine.register_fn("midi_to_hz", |m: Dynamic| -> RhaiResult<f64> {
        Ok(music::midi_to_hz(require_number("midi", &m)?))
    });
    engine.register_fn("hz_to_midi", |hz: Dynamic| -> RhaiResult<f64> {
        Ok(music::hz_to_midi(require_number("hz", &hz)?))
    });
    engine.register_fn("note", note);

    // Scales and chords
    engine.register_fn("scale", |base: Dynamic, name: ImmutableString| scale(base, name, 1));
    engine.register_fn("scale", |base: Dynamic, name: ImmutableString, octaves: i64| {
        scale(base, name, octaves)
    });
    engine.register_fn("chord", chord);

    // Math
    engine.register_fn("clamp", |v: Dynamic, min: Dynamic, max: Dynamic| -> RhaiResult<f64> {
        Ok(music::clamp(
            require_number("value", &v)?,
            require_number("min", &min)?,
            require_number("max", &max)?,
        ))
    });
    engine.register_fn("clamp01", |v: Dynamic| -> RhaiResult<f64> {
        Ok(music::clamp01(require_number("value", &v)?))
    });
    engine.register_fn("lerp", |a: Dynamic, b: Dynamic, t: Dynamic| -> RhaiResult<f64> {
        Ok(music::lerp(
            require_number("a", &a)?,
            require_number("b", &b)?,
            require_number("t", &t)?,
        ))
    });
    engine.register_fn("random", || rand::random::<f64>());

    // Sequences
    engine.register_fn("choose", choose);
    engine.register_fn("ring", ring);
    engine.register_fn("mirror", |items: Array| music::mirror(&items));
}

/// Parse a note name to a MIDI note number.
///
/// # Example
/// ```rhai
/// let midi = note("c#4");  // Returns 61
/// ```
pub fn note(name: ImmutableString) -> RhaiResult<f64> {
    music::parse_note_name(&name)
        .map(|n| n as f64)
        .ok_or_else(|| format!("unknown note name '{}'", name).into())
}

/// Notes of a named scale starting at `base`.
pub fn scale(base: Dynamic, name: ImmutableString, octaves: i64) -> RhaiResult<Array> {
    let base = require_number("base", &base)?;
    let steps = music::scale_intervals(&name).ok_or_else(|| format!("unknown scale '{}'", name))?;
    Ok(to_array(&music::scale(base, steps, octaves.max(0) as usize)))
}

/// Notes of a named chord built on `base`.
pub fn chord(base: Dynamic, name: ImmutableString) -> RhaiResult<Array> {
    let base = require_number("base", &base)?;
    let intervals = music::chord_intervals(&name).ok_or_else(|| format!("unknown chord '{}'", name))?;
    Ok(to_array(&music::chord(base, intervals)))
}

/// Random element, or unit for an empty array.
pub fn choose(items: Array) -> Dynamic {
    music::choose(&items, &mut rand::rng()).cloned().unwrap_or(Dynamic::UNIT)
}

/// Element at `index`, wrapping around in both directions.
pub fn ring(items: Array, index: i64) -> Dynamic {
    music::ring(&items, index).cloned().unwrap_or(Dynamic::UNIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note() {
        assert_eq!(note("a4".into()).unwrap(), 69.0);
        assert!(note("h4".into()).is_err());
    }

    #[test]
    fn test_scale_and_chord() {
        let notes = scale(Dynamic::from_int(60), "major".into(), 1).unwrap();
        assert_eq!(notes.len(), 8);
        assert_eq!(notes[7].as_float().unwrap(), 72.0);
        let triad = chord(Dynamic::from_float(60.0), "major".into()).unwrap();
        let triad: Vec<f64> = triad.iter().map(|d| d.as_float().unwrap()).collect();
        assert_eq!(triad, vec![60.0, 64.0, 67.0]);
        assert!(chord(Dynamic::from_int(60), "nope".into()).is_err());
    }

    #[test]
    fn test_ring_wraps() {
        let items: Array = vec![Dynamic::from_int(1), Dynamic::from_int(2), Dynamic::from_int(3)];
        assert_eq!(ring(items.clone(), 4).as_int().unwrap(), 2);
        assert_eq!(ring(items, -1).as_int().unwrap(), 3);
        assert!(ring(Array::new(), 0).is_unit());
    }
}
