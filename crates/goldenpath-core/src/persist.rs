use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::state::Snapshot;

/// Expected JSON shape of a schema-checked field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    List,
    Map,
}

/// Field name → expected shape, validated on load. Fields not listed here are
/// taken as-is (serde defaults cover anything missing).
const STATE_SCHEMA: &[(&str, Shape)] = &[
    ("runs_summary", Shape::List),
    ("merge_statuses", Shape::List),
    ("build_statuses", Shape::List),
    ("gitops_statuses", Shape::List),
    ("deploy_apps", Shape::List),
    ("jenkins_jobs", Shape::List),
    ("logs", Shape::List),
    ("proposed_actions", Shape::List),
    ("_selected_services", Shape::List),
    ("_actually_merged", Shape::List),
    ("active_run", Shape::Map),
    ("health_map", Shape::Map),
    ("expected_tags", Shape::Map),
    ("_shas", Shape::Map),
    ("_current_steps", Shape::Map),
];

/// Atomically persist the live snapshot to disk.
///
/// Serializes, round-trip parses the payload (if it does not parse back, the
/// file is not written), writes to a sibling temp file and renames into place.
pub fn save_live_state(path: &Path, snap: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create state dir {}", parent.display()))?;
    }
    let payload = serde_json::to_string(snap).context("serialize live state")?;
    serde_json::from_str::<Value>(&payload).context("round-trip validate live state")?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &payload).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Load the persisted snapshot, validating field shapes against the schema.
///
/// A field with the wrong type is first run through textual recovery (values
/// written by an earlier mis-serializing release contain wrapper-type names
/// and non-JSON tokens); unrecoverable fields reset to the shape's empty
/// value. If anything required recovery the file is re-saved under clean
/// encoding. Returns `None` (clean start) when the file is missing or does
/// not parse at all — a partially parsed snapshot is never applied.
pub fn load_live_state(path: &Path) -> Option<Snapshot> {
    if !path.exists() {
        return None;
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(r) => r,
        Err(e) => {
            warn!("read {}: {e}", path.display());
            return None;
        }
    };
    let mut data: Value = match serde_json::from_str(&raw) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => {
            warn!("{} is not a JSON object", path.display());
            return None;
        }
        Err(e) => {
            warn!("parse {}: {e}", path.display());
            return None;
        }
    };

    let mut needs_rewrite = false;
    for (field, shape) in STATE_SCHEMA {
        let Some(val) = data.get(*field) else {
            continue;
        };
        let ok = match shape {
            Shape::List => val.is_array(),
            // active_run may legitimately be null (no run selected)
            Shape::Map => val.is_object() || (*field == "active_run" && val.is_null()),
        };
        if ok {
            continue;
        }
        needs_rewrite = true;
        let recovered = val
            .as_str()
            .and_then(|s| recover_corrupted_str(s, *shape));
        match recovered {
            Some(v) => {
                warn!("Recovered corrupted field '{field}' from string");
                data[*field] = v;
            }
            None => {
                warn!("Could not recover field '{field}', reset to empty");
                data[*field] = match shape {
                    Shape::List => Value::Array(Vec::new()),
                    Shape::Map => Value::Object(serde_json::Map::new()),
                };
            }
        }
    }

    let snap: Snapshot = match serde_json::from_value(data) {
        Ok(s) => s,
        Err(e) => {
            warn!("apply {}: {e}", path.display());
            return None;
        }
    };

    if needs_rewrite {
        info!("Re-writing {} to fix corrupted fields", path.display());
        if let Err(e) = save_live_state(path, &snap) {
            warn!("re-save after recovery failed: {e}");
        }
    }

    Some(snap)
}

/// Wrapper-type names seen in mis-serialized state files.
const WRAPPER_NAMES: &[&str] = &["ImmutableMutableProxy", "MutableProxy"];

/// Attempt to recover a string-serialized container field.
///
/// Handles values that are textual reprs of wrapped containers: wrapper-type
/// calls are stripped (keeping their inner value), single quotes become
/// double quotes, and `True`/`False`/`None` become JSON tokens. Returns the
/// parsed value only when it matches the expected shape.
fn recover_corrupted_str(val: &str, shape: Shape) -> Option<Value> {
    if val.trim().is_empty() {
        return None;
    }
    let stripped = strip_wrappers(val);
    let normalized = normalize_tokens(&stripped);
    let parsed: Value = serde_json::from_str(&normalized).ok()?;
    let ok = match shape {
        Shape::List => parsed.is_array(),
        Shape::Map => parsed.is_object(),
    };
    ok.then_some(parsed)
}

/// Remove `Wrapper(...)` calls, keeping the wrapped value. Tracks paren depth
/// so the matching close paren of each wrapper is dropped too.
fn strip_wrappers(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    // true = this open paren belongs to a stripped wrapper call
    let mut paren_stack: Vec<bool> = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    'outer: while i < bytes.len() {
        for name in WRAPPER_NAMES {
            let end = i + name.len();
            if input[i..].starts_with(name) && bytes.get(end) == Some(&b'(') {
                paren_stack.push(true);
                i = end + 1;
                continue 'outer;
            }
        }
        match bytes[i] {
            b'(' => {
                paren_stack.push(false);
                out.push('(');
            }
            b')' => {
                if paren_stack.pop() != Some(true) {
                    out.push(')');
                }
            }
            _ => {
                // copy the full UTF-8 char, not just one byte
                let ch_len = utf8_len(bytes[i]);
                out.push_str(&input[i..i + ch_len]);
                i += ch_len;
                continue;
            }
        }
        i += 1;
    }
    out
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}

/// Convert python-repr tokens to JSON: quotes, booleans, null.
fn normalize_tokens(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while !rest.is_empty() {
        if rest.starts_with("True") {
            out.push_str("true");
            rest = &rest[4..];
        } else if rest.starts_with("False") {
            out.push_str("false");
            rest = &rest[5..];
        } else if rest.starts_with("None") {
            out.push_str("null");
            rest = &rest[4..];
        } else {
            let mut chars = rest.chars();
            let c = match chars.next() {
                Some(c) => c,
                None => break,
            };
            out.push(if c == '\'' { '"' } else { c });
            rest = chars.as_str();
        }
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────────────────
