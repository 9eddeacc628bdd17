//! JSON payload broadcast by TESS-W units.
//!
//! ```text
//! {"udp": 5432, "rev": 1, "name": "stars1", "freq": 4606.0, "mag": 12.9, "tamb": 29.87, "tsky": 24.81, "ZP": 20.5}
//! ```
//!
//! Only `freq` is required. Firmware revisions disagree on key names, so `seq`/`udp`,
//! `tbox`/`tamb` and `zp`/`ZP` are accepted interchangeably. Unknown keys are ignored.

use super::Fields;
use serde_json::{Map, Value};

const SEQ_KEYS: [&str; 2] = ["udp", "seq"];
const TBOX_KEYS: [&str; 2] = ["tamb", "tbox"];
const TSKY_KEYS: [&str; 1] = ["tsky"];
const ZP_KEYS: [&str; 2] = ["ZP", "zp"];

// First key present wins; a value of the wrong type reads as absent.
fn first<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| map.get(*key))
}

fn number(map: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    first(map, keys).and_then(Value::as_f64)
}

fn sequence(map: &Map<String, Value>) -> Option<u64> {
    let value = first(map, &SEQ_KEYS)?;
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64)
    })
}

/// Decodes one JSON frame. Anything but an object with a numeric `freq` is rejected.
pub(crate) fn parse(frame: &[u8]) -> Option<Fields> {
    let value: Value = serde_json::from_slice(frame.trim_ascii()).ok()?;
    let map = value.as_object()?;
    Some(Fields {
        freq: map.get("freq")?.as_f64()?,
        tbox: number(map, &TBOX_KEYS),
        tsky: number(map, &TSKY_KEYS),
        zp: number(map, &ZP_KEYS),
        seq: sequence(map),
    })
}
