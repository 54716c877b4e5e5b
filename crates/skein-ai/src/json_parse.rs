// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tolerant parsing of partially-streamed JSON.
//!
//! Tool-call arguments arrive fragment-by-fragment; UIs want to preview the
//! object before the stream finishes.  [`parse_streaming_json`] returns the
//! best-effort object recoverable from the prefix seen so far, and never
//! fails: unrecoverable input yields an empty object.

use serde_json::{Map, Value};

/// Parse a possibly-incomplete JSON object.
///
/// Strategy: strict parse first; otherwise balance any unclosed strings,
/// arrays and objects (respecting backslash escapes) and parse again.
/// Anything else returns `{}`.  Valid complete objects parse exactly as
/// `serde_json` would parse them.
pub fn parse_streaming_json(partial: &str) -> Map<String, Value> {
    if partial.trim().is_empty() {
        return Map::new();
    }

    if let Ok(Value::Object(map)) = serde_json::from_str(partial) {
        return map;
    }

    // Track nesting depth and string state over the prefix.
    let mut brackets = 0i32;
    let mut braces = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in partial.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' => escape_next = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '[' => brackets += 1,
            ']' => brackets -= 1,
            '{' => braces += 1,
            '}' => braces -= 1,
            _ => {}
        }
    }

    let mut repaired = partial.to_string();
    if in_string {
        repaired.push('"');
    }
    for _ in 0..brackets.max(0) {
        repaired.push(']');
    }
    for _ in 0..braces.max(0) {
        repaired.push('}');
    }

    match serde_json::from_str(&repaired) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
