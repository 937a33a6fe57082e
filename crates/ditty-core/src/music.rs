//! Pitch, scale and sequence helpers used by scores.
//!
//! - MIDI / frequency conversion (`a4 = 69 = 440 Hz`)
//! - Note-name parsing (`"c4"`, `"C#4"`, `"eb3"`, `"fs2"`)
//! - Scale and chord tables
//! - `choose` / `ring` / `mirror` over slices

use rand::Rng;

/// Convert a MIDI note number to a frequency in Hz.
pub fn midi_to_hz(midi: f64) -> f64 {
    2f64.powf(midi / 12.0 - 5.75) * 440.0
}

/// Convert a frequency in Hz to a (fractional) MIDI note number.
pub fn hz_to_midi(hz: f64) -> f64 {
    12.0 * (hz / 440.0).log2() + 69.0
}

pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

pub fn clamp01(value: f64) -> f64 {
    clamp(value, 0.0, 1.0)
}

pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + t * (b - a)
}

/// Parse a note name to a MIDI note number (C4 = 60).
///
/// Accepts `#`/`s` for sharps and `b`/`f` for flats after the letter.
/// A missing octave means octave 4.
pub fn parse_note_name(name: &str) -> Option<i32> {
    let name = name.trim();
    let mut chars = name.chars().peekable();

    let base = match chars.next()?.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };

    let mut accidental = 0;
    while let Some(&c) = chars.peek() {
        match c {
            '#' | '♯' | 's' | 'S' => accidental += 1,
            'b' | 'B' | 'f' | 'F' | '♭' => accidental -= 1,
            _ => break,
        }
        chars.next();
    }

    let octave_str: String = chars.collect();
    let octave: i32 = if octave_str.is_empty() {
        4
    } else {
        octave_str.parse().ok()?
    };

    let midi = (octave + 1) * 12 + base + accidental;
    if (0..=132).contains(&midi) {
        Some(midi)
    } else {
        None
    }
}

/// Every note name constant exposed to scores (`c0`..`b9`, with `s`/`b` variants).
pub fn note_constants() -> Vec<(String, i32)> {
    const LETTERS: [(&str, i32); 7] = [
        ("c", 0),
        ("d", 2),
        ("e", 4),
        ("f", 5),
        ("g", 7),
        ("a", 9),
        ("b", 11),
    ];
    let mut notes = Vec::new();
    for octave in 0..=9 {
        for (letter, offset) in LETTERS {
            let midi = (octave + 1) * 12 + offset;
            notes.push((format!("{}{}", letter, octave), midi));
            notes.push((format!("{}s{}", letter, octave), midi + 1));
            notes.push((format!("{}b{}", letter, octave), midi - 1));
        }
    }
    notes
}

/// Interval steps of a named scale.
pub fn scale_intervals(name: &str) -> Option<&'static [i32]> {
    let steps: &'static [i32] = match name {
        "diatonic" | "ionian" | "major" => &[2, 2, 1, 2, 2, 2, 1],
        "dorian" => &[2, 1, 2, 2, 2, 1, 2],
        "phrygian" => &[1, 2, 2, 2, 1, 2, 2],
        "lydian" => &[2, 2, 2, 1, 2, 2, 1],
        "mixolydian" => &[2, 2, 1, 2, 2, 1, 2],
        "aeolian" | "minor" => &[2, 1, 2, 2, 1, 2, 2],
        "locrian" => &[1, 2, 2, 1, 2, 2, 2],
        "hex_major6" => &[2, 2, 1, 2, 2, 3],
        "hex_dorian" => &[2, 1, 2, 2, 3, 2],
        "hex_phrygian" => &[1, 2, 2, 3, 2, 2],
        "hex_major7" => &[2, 2, 3, 2, 2, 1],
        "hex_sus" => &[2, 3, 2, 2, 1, 2],
        "hex_aeolian" => &[3, 2, 2, 1, 2, 2],
        "minor_pentatonic" | "yu" => &[3, 2, 2, 3, 2],
        "major_pentatonic" | "gong" => &[2, 2, 3, 2, 3],
        "egyptian" | "shang" => &[2, 3, 2, 3, 2],
        "jiao" => &[3, 2, 3, 2, 2],
        "zhi" | "ritusen" => &[2, 3, 2, 2, 3],
        "whole_tone" | "whole" | "messiaen1" => &[2, 2, 2, 2, 2, 2],
        "chromatic" => &[1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
        "harmonic_minor" => &[2, 1, 2, 2, 1, 3, 1],
        "melodic_minor_asc" | "melodic_minor" => &[2, 1, 2, 2, 2, 2, 1],
        "hungarian_minor" => &[2, 1, 3, 1, 1, 3, 1],
        "octatonic" | "diminished2" => &[2, 1, 2, 1, 2, 1, 2, 1],
        "messiaen2" | "diminished" => &[1, 2, 1, 2, 1, 2, 1, 2],
        "messiaen3" => &[2, 1, 1, 2, 1, 1, 2, 1, 1],
        "messiaen4" => &[1, 1, 3, 1, 1, 1, 3, 1],
        "messiaen5" => &[1, 4, 1, 1, 4, 1],
        "messiaen6" => &[2, 2, 1, 1, 2, 2, 1, 1],
        "messiaen7" => &[1, 1, 1, 2, 1, 1, 1, 1, 2, 1],
        "super_locrian" => &[1, 2, 1, 2, 2, 2, 2],
        "hirajoshi" => &[2, 1, 4, 1, 4],
        "kumoi" => &[2, 1, 4, 2, 3],
        "neapolitan_major" => &[1, 2, 2, 2, 2, 2, 1],
        "bartok" | "hindu" | "melodic_major" => &[2, 2, 1, 2, 1, 2, 2],
        "bhairav" => &[1, 3, 1, 2, 1, 3, 1],
        "locrian_major" => &[2, 2, 1, 1, 2, 2, 2],
        "ahirbhairav" => &[1, 3, 1, 2, 2, 1, 2],
        "enigmatic" => &[1, 3, 2, 2, 2, 1, 1],
        "neapolitan_minor" => &[1, 2, 2, 2, 1, 3, 1],
        "pelog" => &[1, 2, 4, 1, 4],
        "augmented2" => &[1, 3, 1, 3, 1, 3],
        "scriabin" => &[1, 3, 3, 2, 3],
        "harmonic_major" => &[2, 2, 1, 2, 1, 3, 1],
        "melodic_minor_desc" => &[2, 1, 2, 2, 1, 2, 2],
        "romanian_minor" => &[2, 1, 3, 1, 2, 1, 2],
        "iwato" => &[1, 4, 1, 4, 2],
        "marva" => &[1, 3, 2, 1, 2, 2, 1],
        "indian" => &[4, 1, 2, 3, 2],
        "spanish" => &[1, 3, 1, 2, 1, 2, 2],
        "prometheus" => &[2, 2, 2, 5, 1],
        "todi" => &[1, 2, 3, 1, 1, 3, 1],
        "leading_whole" => &[2, 2, 2, 2, 2, 1, 1],
        "augmented" => &[3, 1, 3, 1, 3, 1],
        "purvi" => &[1, 3, 2, 1, 1, 3, 1],
        "chinese" => &[4, 2, 1, 4, 1],
        "lydian_minor" => &[2, 2, 2, 1, 1, 2, 2],
        "blues_major" => &[2, 1, 1, 3, 2, 3],
        "blues_minor" => &[3, 2, 1, 1, 3, 2],
        _ => return None,
    };
    Some(steps)
}

/// Semitone offsets of a named chord.
pub fn chord_intervals(name: &str) -> Option<&'static [i32]> {
    const MAJOR: &[i32] = &[0, 4, 7];
    const MINOR: &[i32] = &[0, 3, 7];
    const MAJOR7: &[i32] = &[0, 4, 7, 11];
    const DOM7: &[i32] = &[0, 4, 7, 10];
    const MINOR7: &[i32] = &[0, 3, 7, 10];
    const AUG: &[i32] = &[0, 4, 8];
    const DIM: &[i32] = &[0, 3, 6];
    const DIM7: &[i32] = &[0, 3, 6, 9];
    const HALFDIM: &[i32] = &[0, 3, 6, 10];

    let notes: &'static [i32] = match name {
        "1" => &[0],
        "5" => &[0, 7],
        "+5" => AUG,
        "m+5" => &[0, 3, 8],
        "sus2" => &[0, 2, 7],
        "sus4" => &[0, 5, 7],
        "6" => &[0, 4, 7, 9],
        "m6" => &[0, 3, 7, 9],
        "7sus2" => &[0, 2, 7, 10],
        "7sus4" => &[0, 5, 7, 10],
        "7-5" => &[0, 4, 6, 10],
        "7+5" => &[0, 4, 8, 10],
        "m7+5" => &[0, 3, 8, 10],
        "9" => &[0, 4, 7, 10, 14],
        "m9" | "m7+9" => &[0, 3, 7, 10, 14],
        "maj9" => &[0, 4, 7, 11, 14],
        "9sus4" => &[0, 5, 7, 10, 14],
        "6*9" => &[0, 4, 7, 9, 14],
        "m6*9" => &[0, 3, 7, 9, 14],
        "7-9" => &[0, 4, 7, 10, 13],
        "m7-9" => &[0, 3, 7, 10, 13],
        "7-10" => &[0, 4, 7, 10, 15],
        "7-11" => &[0, 4, 7, 10, 16],
        "7-13" => &[0, 4, 7, 10, 20],
        "9+5" => &[0, 10, 13],
        "m9+5" => &[0, 10, 14],
        "7+5-9" => &[0, 4, 8, 10, 13],
        "m7+5-9" => &[0, 3, 8, 10, 13],
        "11" => &[0, 4, 7, 10, 14, 17],
        "m11" => &[0, 3, 7, 10, 14, 17],
        "maj11" => &[0, 4, 7, 11, 14, 17],
        "11+" => &[0, 4, 7, 10, 14, 18],
        "m11+" => &[0, 3, 7, 10, 14, 18],
        "13" => &[0, 4, 7, 10, 14, 17, 21],
        "m13" => &[0, 3, 7, 10, 14, 17, 21],
        "add2" => &[0, 2, 4, 7],
        "add4" => &[0, 4, 5, 7],
        "add9" => &[0, 4, 7, 14],
        "add11" => &[0, 4, 7, 17],
        "add13" => &[0, 4, 7, 21],
        "madd2" => &[0, 2, 3, 7],
        "madd4" => &[0, 3, 5, 7],
        "madd9" => &[0, 3, 7, 14],
        "madd11" => &[0, 3, 7, 17],
        "madd13" => &[0, 3, 7, 21],
        "major" | "maj" | "M" => MAJOR,
        "minor" | "min" | "m" => MINOR,
        "major7" | "M7" => MAJOR7,
        "dom7" | "7" => DOM7,
        "minor7" | "m7" => MINOR7,
        "augmented" | "a" => AUG,
        "diminished" | "dim" | "i" => DIM,
        "diminished7" | "dim7" | "i7" => DIM7,
        "halfdiminished" | "halfdim" | "m7b5" | "m7-5" => HALFDIM,
        _ => return None,
    };
    Some(notes)
}

/// Notes of a chord built on `base`.
pub fn chord(base: f64, intervals: &[i32]) -> Vec<f64> {
    intervals.iter().map(|&n| base + n as f64).collect()
}

/// Notes of a scale starting at `base`, walking the steps `octaves` times.
pub fn scale(base: f64, steps: &[i32], octaves: usize) -> Vec<f64> {
    let mut notes = Vec::with_capacity(1 + steps.len() * octaves);
    notes.push(base);
    let mut current = base;
    for _ in 0..octaves {
        for &step in steps {
            current += step as f64;
            notes.push(current);
        }
    }
    notes
}

/// Pick a random element.
pub fn choose<'a, T, R: Rng + ?Sized>(items: &'a [T], rng: &mut R) -> Option<&'a T> {
    if items.is_empty() {
        None
    } else {
        items.get(rng.random_range(0..items.len()))
    }
}

/// Index into a sequence with wrap-around. Negative indices wrap from the end.
pub fn ring<T>(items: &[T], index: i64) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    let len = items.len() as i64;
    items.get(index.rem_euclid(len) as usize)
}

/// The sequence followed by its reverse.
pub fn mirror<T: Clone>(items: &[T]) -> Vec<T> {
    items.iter().chain(items.iter().rev()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midi_hz_conversion() {
        assert!((midi_to_hz(69.0) - 440.0).abs() < 1e-9);
        assert!((midi_to_hz(57.0) - 220.0).abs() < 1e-9);
        assert!((hz_to_midi(440.0) - 69.0).abs() < 1e-9);
        assert!((hz_to_midi(midi_to_hz(61.5)) - 61.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_note_name() {
        assert_eq!(parse_note_name("C4"), Some(60));
        assert_eq!(parse_note_name("c4"), Some(60));
        assert_eq!(parse_note_name("A4"), Some(69));
        assert_eq!(parse_note_name("C#4"), Some(61));
        assert_eq!(parse_note_name("cs4"), Some(61));
        assert_eq!(parse_note_name("Db4"), Some(61));
        assert_eq!(parse_note_name("eb3"), Some(51));
        assert_eq!(parse_note_name("c0"), Some(12));
        assert_eq!(parse_note_name("C"), Some(60));
        assert_eq!(parse_note_name("X4"), None);
        assert_eq!(parse_note_name("c4x"), None);
    }

    #[test]
    fn test_note_constants() {
        let notes = note_constants();
        let lookup = |name: &str| notes.iter().find(|(n, _)| n == name).map(|(_, m)| *m);
        assert_eq!(lookup("c4"), Some(60));
        assert_eq!(lookup("a4"), Some(69));
        assert_eq!(lookup("fs3"), Some(54));
        assert_eq!(lookup("bb2"), Some(46));
    }

    #[test]
    fn test_scale_and_chord() {
        let major = scale(60.0, scale_intervals("major").unwrap(), 1);
        assert_eq!(major, vec![60.0, 62.0, 64.0, 65.0, 67.0, 69.0, 71.0, 72.0]);
        let two_octaves = scale(48.0, scale_intervals("minor_pentatonic").unwrap(), 2);
        assert_eq!(two_octaves.len(), 11);
        assert_eq!(*two_octaves.last().unwrap(), 72.0);

        assert_eq!(chord(60.0, chord_intervals("m7").unwrap()), vec![60.0, 63.0, 67.0, 70.0]);
        assert!(scale_intervals("nope").is_none());
        assert!(chord_intervals("nope").is_none());
    }

    #[test]
    fn test_sequence_helpers() {
        let items = [1, 2, 3];
        assert_eq!(ring(&items, 4), Some(&2));
        assert_eq!(ring(&items, -1), Some(&3));
        assert_eq!(mirror(&items), vec![1, 2, 3, 3, 2, 1]);

        let mut rng = rand::rng();
        for _ in 0..20 {
            assert!(items.contains(choose(&items, &mut rng).unwrap()));
        }
        let empty: [i32; 0] = [];
        assert!(choose(&empty, &mut rng).is_none());
        assert!(ring(&empty, 1).is_none());
    }

    #[test]
    fn test_clamp_and_lerp() {
        assert_eq!(clamp(5.0, 0.0, 1.0), 1.0);
        assert_eq!(clamp01(-0.5), 0.0);
        assert_eq!(lerp(10.0, 20.0, 0.25), 12.5);
    }
}
