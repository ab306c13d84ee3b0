//! Progress checkpoints emitted by guest-side payloads.
//!
//! A payload reports progress by printing lines of the form
//! `CHECKPOINT('<NAME>', '<params>')`. The engine scrapes those markers out
//! of the captured output (or a live stdout stream) and hands them to the
//! caller in arrival order.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};

lazy_static! {
    static ref CHECKPOINT: Regex =
        Regex::new(r"CHECKPOINT\(\s*'([^']*)'\s*,\s*'([^']*)'\s*\)").expect("checkpoint regex");
}

#[derive(Clone, Debug, PartialEq, Serialize)]
/// One scraped progress marker.
pub struct CheckpointRecord {
    /// Checkpoint name, e.g. `INIT` or `STEP`.
    pub name: String,

    /// Parsed parameters. JSON when the payload printed JSON, otherwise
    /// whitespace-separated `key=value` pairs with numerics coerced.
    pub params: Map<String, Value>,

    /// The full line the marker was found on.
    pub raw_line: String,
}

fn coerce(value: &str) -> Value {
    if let Ok(n) = value.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = value.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        other => Value::String(other.to_string()),
    }
}

/// Parse a checkpoint parameter string: JSON when syntactically valid, else
/// whitespace-separated `key=value` pairs.
pub fn parse_params(text: &str) -> Map<String, Value> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return map;
    }

    let mut map = Map::new();
    for pair in text.split_whitespace() {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                map.insert(key.to_string(), coerce(value));
            }
            _ => {}
        }
    }
    map
}

/// Scan a single output line for a checkpoint marker.
pub fn scan_line(line: &str) -> Option<CheckpointRecord> {
    let captures = CHECKPOINT.captures(line)?;
    Some(CheckpointRecord {
        name: captures[1].to_string(),
        params: parse_params(&captures[2]),
        raw_line: line.to_string(),
    })
}

/// Scan combined output for checkpoint markers, in source order.
pub fn scan(output: &str) -> Vec<CheckpointRecord> {
    output.lines().filter_map(scan_line).collect()
}

/// Bracket a payload with INIT/COMPLETE markers when the caller asked for
/// progress reporting; otherwise return it unchanged.
pub fn wrap_with_checkpoints(script: &str, enabled: bool) -> String {
    if !enabled {
        return script.to_string();
    }
    format!(
        "SAY \"CHECKPOINT('INIT', 'progress=0')\"\n{}\nSAY \"CHECKPOINT('COMPLETE', 'progress=100')\"\n",
        script
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scan_in_source_order() {
        let output = "starting\nCHECKPOINT('STEP', 'pct=50')\nnoise\nCHECKPOINT('STEP', 'pct=100')\n";
        let records = scan(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "STEP");
        assert_eq!(records[0].params["pct"], json!(50));
        assert_eq!(records[1].params["pct"], json!(100));
    }

    #[test]
    fn json_params() {
        let record = scan_line(r#"CHECKPOINT('INIT', '{"progress": 0, "stage": "boot"}')"#).unwrap();
        assert_eq!(record.params["progress"], json!(0));
        assert_eq!(record.params["stage"], json!("boot"));
    }

    #[test]
    fn key_value_params_coerced() {
        let record = scan_line("CHECKPOINT('STEP', 'pct=12.5 label=copy done=false')").unwrap();
        assert_eq!(record.params["pct"], json!(12.5));
        assert_eq!(record.params["label"], json!("copy"));
        assert_eq!(record.params["done"], json!(false));
    }

    #[test]
    fn malformed_json_falls_back_to_pairs() {
        let record = scan_line("CHECKPOINT('STEP', '{pct=50')").unwrap();
        assert_eq!(record.params["{pct"], json!(50));
    }

    #[test]
    fn non_checkpoint_lines_ignored() {
        assert!(scan_line("plain output").is_none());
        assert!(scan("a\nb\nc").is_empty());
    }

    #[test]
    fn wrapping() {
        let wrapped = wrap_with_checkpoints("SAY 'work'", true);
        assert!(wrapped.starts_with("SAY \"CHECKPOINT('INIT'"));
        assert!(wrapped.contains("SAY 'work'"));
        assert!(wrapped.trim_end().ends_with("CHECKPOINT('COMPLETE', 'progress=100')\""));

        assert_eq!(wrap_with_checkpoints("SAY 'work'", false), "SAY 'work'");
    }

    #[test]
    fn raw_line_preserved() {
        let line = "prefix CHECKPOINT('X', 'a=1') suffix";
        assert_eq!(scan_line(line).unwrap().raw_line, line);
    }
}
