//! Canonical encoding of checkpoint content.
//!
//! The same logical `(payload, events)` pair always encodes to the same
//! bytes: object keys are sorted recursively, arrays keep their order, and
//! the output is compact JSON behind a fixed version tag.

use serde::Serialize;
use serde_json::Value;

use crate::domain::Event;
use crate::error::{CheckpointError, Result};

/// Leading tag; bumping it invalidates every stored digest
pub const ENCODING_TAG: &[u8] = b"runvault.checkpoint.v1\n";

/// Encode a checkpoint's payload and event history
pub fn encode(payload: &Value, events: &[Event]) -> Result<Vec<u8>> {
    let events = to_value(events)?;

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(ENCODING_TAG);
    out.extend_from_slice(b"{\"events\":");
    write_value(&mut out, &events)?;
    out.extend_from_slice(b",\"payload\":");
    write_value(&mut out, payload)?;
    out.push(b'}');
    Ok(out)
}

/// Encode any serializable value canonically (no tag)
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = to_value(value)?;
    let mut out = Vec::new();
    write_value(&mut out, &value)?;
    Ok(out)
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| CheckpointError::Encoding(e.to_string()))
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_str(out, s)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_str(out, key)?;
                out.push(b':');
                write_value(out, &map[key])?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let quoted = serde_json::to_string(s).map_err(|e| CheckpointError::Encoding(e.to_string()))?;
    out.extend_from_slice(quoted.as_bytes());
    Ok(())
}
