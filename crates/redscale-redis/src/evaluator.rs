//! Metric evaluation — runs the configured Lua script against Redis
//! and interprets the reply as a single integer.

use redis::aio::MultiplexedConnection;

use crate::error::{StoreError, StoreResult};

/// Deserialize an optionally-empty YAML sequence of strings.
///
/// Key and argument lists arrive as serialized text in the target's
/// metadata; an empty string means an empty list.
pub fn decode_string_list(field: &'static str, raw: &str) -> StoreResult<Vec<String>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    serde_yaml::from_str(raw).map_err(|e| StoreError::MalformedList(field, e.to_string()))
}

/// Execute a Lua script with the given keys and arguments.
///
/// Any failure — script error, connection failure, non-integer reply —
/// surfaces unmodified. No retry, no partial result.
pub async fn run_script(
    conn: &mut MultiplexedConnection,
    script: &str,
    keys: &[String],
    args: &[String],
) -> StoreResult<i64> {
    let script = redis::Script::new(script);
    let mut invocation = script.prepare_invoke();

    for key in keys {
        invocation.key(key.as_str());
    }
    for arg in args {
        invocation.arg(arg.as_str());
    }

    let value = invocation.invoke_async(conn).await?;
    Ok(value)
}
