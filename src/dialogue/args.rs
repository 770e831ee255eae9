//! Compatibility shim for malformed tool-call arguments.
//!
//! Some model responses stream two or more JSON objects back to back as the
//! argument text of a single tool call (`{"slots":[..]}{"doctor":".."}`).
//! Those are merged into one object: keys are unioned left to right, and a
//! key whose old and new values are both arrays gets the arrays concatenated.
//! Well-formed input takes the first branch and never reaches the merge.

use serde_json::{Map, Value};

/// Parse the raw argument text of one tool call into an argument object.
pub fn parse_tool_arguments(raw: &str) -> anyhow::Result<Map<String, Value>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => return Ok(map),
        Ok(other) => anyhow::bail!("tool arguments are not an object: {other}"),
        Err(_) => {}
    }

    let mut merged = Map::new();
    let mut count = 0usize;
    for value in serde_json::Deserializer::from_str(raw).into_iter::<Value>() {
        let value = value.map_err(|e| anyhow::anyhow!("Unable to parse tool arguments: {e}"))?;
        let Value::Object(object) = value else {
            anyhow::bail!("tool arguments contain a non-object value: {value}");
        };
        merge_into(&mut merged, object);
        count += 1;
    }

    tracing::warn!(objects = count, "Merged concatenated tool argument objects");
    Ok(merged)
}

fn merge_into(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(Value::Array(existing)), Value::Array(more)) => existing.extend(more),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}
