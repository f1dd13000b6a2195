//! JSON rendering of job results.

use probejob_core::{JobError, JobResponse, OutputValue};
use serde_json::{json, Value};
use std::time::Duration;

pub fn response(response: &JobResponse) -> Value {
    json!({
        "operation": response.operation,
        "values": response.values.iter().map(value).collect::<Vec<_>>(),
        "reset": response.reset,
        "lowlevel_error": response.lowlevel_error,
        "rtt_not_started": response.rtt_not_started,
        "elapsed_ms": millis(response.elapsed),
    })
}

/// Byte data is printed as hex, words as zero-padded hex.
pub fn value(value: &OutputValue) -> Value {
    match value {
        OutputValue::Bytes(bytes) => json!({ "type": "Bytes", "value": hex::encode(bytes) }),
        OutputValue::Word(word) => json!({ "type": "Word", "value": format!("{word:#010x}") }),
        other => serde_json::to_value(other).unwrap_or(Value::Null),
    }
}

pub fn error(err: &JobError) -> Value {
    json!({
        "error": err.to_string(),
        "result": err.result(),
        "errno": err.errno(),
        "lowlevel_error": err.lowlevel(),
        "retryable": err.is_retryable(),
        "hint": err.hint(),
    })
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
