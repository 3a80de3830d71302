use serde_json::Value;

use crate::error::PhxError;
use crate::message::{ChannelMessage, Frame};

/// Encode a Frame to V2 JSON array format: [join_ref, ref, topic, event, payload]
pub fn encode(frame: &Frame) -> Result<String, PhxError> {
    let array: Vec<Value> = vec![
        optional_string(&frame.join_ref),
        optional_string(&frame.ref_),
        Value::String(frame.topic.clone()),
        Value::String(frame.event.clone()),
        frame.payload.clone(),
    ];

    serde_json::to_string(&array).map_err(PhxError::Serialization)
}

/// Decode a frame from JSON (supports both V1 map and V2 array formats)
pub fn decode(data: &str) -> Result<Frame, PhxError> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| PhxError::MalformedEnvelope(format!("invalid JSON: {e}")))?;

    match value {
        Value::Array(arr) => decode_array_format(arr),
        Value::Object(_) => decode_map_format(value),
        _ => Err(PhxError::MalformedEnvelope(
            "Expected array or object".to_string(),
        )),
    }
}

/// Decode and classify in one step
pub fn decode_message(data: &str) -> Result<ChannelMessage, PhxError> {
    decode(data).map(ChannelMessage::from)
}

fn optional_string(value: &Option<String>) -> Value {
    value
        .as_ref()
        .map(|s| Value::String(s.clone()))
        .unwrap_or(Value::Null)
}

fn ref_field(value: Option<&Value>, name: &str) -> Result<Option<String>, PhxError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(PhxError::MalformedEnvelope(format!("Invalid {name} type"))),
    }
}

fn string_field(value: Option<&Value>, name: &str) -> Result<String, PhxError> {
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(PhxError::MalformedEnvelope(format!("Invalid {name} type"))),
        None => Err(PhxError::MalformedEnvelope(format!("Missing {name}"))),
    }
}

/// Decode V2 array format: [join_ref, ref, topic, event, payload]
fn decode_array_format(mut arr: Vec<Value>) -> Result<Frame, PhxError> {
    if arr.len() != 5 {
        return Err(PhxError::MalformedEnvelope(format!(
            "Expected 5 elements, got {}",
            arr.len()
        )));
    }

    let join_ref = ref_field(arr.first(), "join_ref")?;
    let ref_ = ref_field(arr.get(1), "ref")?;
    let topic = string_field(arr.get(2), "topic")?;
    let event = string_field(arr.get(3), "event")?;
    let payload = arr.pop().unwrap_or(Value::Null);

    Ok(Frame {
        join_ref,
        ref_,
        topic,
        event,
        payload,
    })
}

/// Decode V1 map format: {join_ref, ref, topic, event, payload}
fn decode_map_format(value: Value) -> Result<Frame, PhxError> {
    let Value::Object(mut obj) = value else {
        return Err(PhxError::MalformedEnvelope("Expected object".to_string()));
    };

    let join_ref = ref_field(obj.get("join_ref"), "join_ref")?;
    let ref_ = ref_field(obj.get("ref"), "ref")?;
    let topic = string_field(obj.get("topic"), "topic")?;
    let event = string_field(obj.get("event"), "event")?;
    let payload = obj.remove("payload").unwrap_or(Value::Null);

    Ok(Frame {
        join_ref,
        ref_,
        topic,
        event,
        payload,
    })
}
