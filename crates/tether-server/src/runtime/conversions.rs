//! Conversions between Rust values and Boa's `JsValue`.
//!
//! # Type Mapping
//!
//! | Rust                   | JavaScript   |
//! |------------------------|--------------|
//! | `ScriptValue::Nil`     | null         |
//! | `ScriptValue::Bool`    | Boolean      |
//! | `ScriptValue::Int`     | Number       |
//! | `ScriptValue::Number`  | Number       |
//! | `ScriptValue::Str`     | String       |
//! | `ScriptValue::Bytes`   | Uint8Array   |
//!
//! JSON values (listen options, metrics snapshots) map onto plain objects and
//! arrays. Symbol keys are skipped. A `BigInt` becomes a JSON integer when it
//! fits in 64 bits and a decimal string otherwise.

use boa_engine::{
    js_string,
    object::{
        builtins::{JsArray, JsUint8Array},
        JsObject,
    },
    property::PropertyKey,
    value::JsValue,
    Context, JsError, JsNativeError, JsResult,
};
use bytes::Bytes;
use serde_json::Value as JsonValue;
use tether_common::{Result, TetherError};

use crate::engine::ScriptValue;

pub(crate) fn script_error(err: JsError) -> TetherError {
    TetherError::Script(err.to_string())
}

pub(crate) fn native_error(err: TetherError) -> JsError {
    JsNativeError::typ().with_message(err.to_string()).into()
}

/// Converts a callback argument into a `JsValue`.
pub fn script_value_to_js(value: &ScriptValue, ctx: &mut Context) -> Result<JsValue> {
    match value {
        ScriptValue::Nil => Ok(JsValue::null()),
        ScriptValue::Bool(b) => Ok(JsValue::new(*b)),
        ScriptValue::Int(i) => Ok(JsValue::new(*i)),
        ScriptValue::Number(n) => Ok(JsValue::new(*n)),
        ScriptValue::Str(s) => Ok(JsValue::new(js_string!(s.as_str()))),
        ScriptValue::Bytes(bytes) => {
            let array = JsUint8Array::from_iter(bytes.iter().copied(), ctx).map_err(script_error)?;
            Ok(array.into())
        }
    }
}

/// Reads an outbound payload from a script value.
///
/// Strings are sent as their UTF-8 bytes. Arrays and typed arrays are read
/// element by element, each element truncated to a byte. `null` and
/// `undefined` send nothing.
pub fn js_to_bytes(value: &JsValue, ctx: &mut Context) -> JsResult<Bytes> {
    if value.is_undefined() || value.is_null() {
        return Ok(Bytes::new());
    }

    if let Some(big) = value.as_bigint() {
        let digits = big.to_string_radix(10);
        if let Ok(n) = digits.parse::<i64>() {
            return Ok(JsonValue::Number(n.into()));
        }
        if let Ok(n) = digits.parse::<u64>() {
            return Ok(JsonValue::Number(n.into()));
        }
        return Ok(JsonValue::String(digits));
    }

    if value.is_string() {
        let text = value.to_string(ctx)?.to_std_string_escaped();
        return Ok(Bytes::from(text.into_bytes()));
    }

    let Some(obj) = value.as_object().map(|o| o.clone()) else {
        return Err(JsNativeError::typ()
            .with_message("payload must be a string, an array of bytes or a Uint8Array")
            .into());
    };

    let length = obj.get(js_string!("length"), ctx)?.to_length(ctx)?;
    let length = u32::try_from(length)
        .map_err(|_| JsNativeError::range().with_message("payload too large"))?;

    let mut buf = Vec::with_capacity(length as usize);
    for i in 0..length {
        buf.push(obj.get(i, ctx)?.to_uint8(ctx)?);
    }
    Ok(Bytes::from(buf))
}

/// Convert serde_json::Value to Boa JsValue.
///
/// # Errors
///
/// Returns `TetherError::Script` if object or array construction fails.
pub fn json_to_js_value(json: JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(b)),
        JsonValue::Number(n) => n
            .as_i64()
            .map(JsValue::new)
            .or_else(|| n.as_f64().map(JsValue::new))
            .ok_or_else(|| TetherError::Script("Number out of range".into())),
        JsonValue::String(s) => Ok(JsValue::new(js_string!(s.as_str()))),
        JsonValue::Array(arr) => {
            let js_array = JsArray::new(ctx);
            for (i, v) in arr.into_iter().enumerate() {
                let js_value = json_to_js_value(v, ctx)?;
                js_array.push(js_value, ctx).map_err(|e| {
                    TetherError::Script(format!("Failed to push array element {}: {}", i, e))
                })?;
            }
            Ok(js_array.into())
        }
        JsonValue::Object(obj) => {
            let js_obj = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in obj {
                let js_value = json_to_js_value(value, ctx)?;
                js_obj
                    .create_data_property_or_throw(js_string!(key.as_str()), js_value, ctx)
                    .map_err(|e| {
                        TetherError::Script(format!("Failed to set property '{}': {}", key, e))
                    })?;
            }
            Ok(js_obj.into())
        }
    }
}

/// Convert Boa JsValue to serde_json::Value.
///
/// - `undefined` and `null` → JSON `null`
/// - `Array` → JSON `array` (recursively converts elements)
/// - `Object` → JSON `object` (skips symbol keys)
/// - Functions and symbols → JSON `null`
pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> Result<JsonValue> {
    if value.is_undefined() || value.is_null() || value.is_symbol() {
        return Ok(JsonValue::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }

    if let Some(i) = value.as_i32() {
        return Ok(JsonValue::Number(i.into()));
    }

    if let Some(n) = value.as_number() {
        return serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .ok_or_else(|| TetherError::Script(format!("{} is not a JSON number", n)));
    }

    if value.is_string() {
        let text = value.to_string(ctx).map_err(script_error)?;
        return Ok(JsonValue::String(text.to_std_string_escaped()));
    }

    let Some(obj) = value.as_object().map(|o| o.clone()) else {
        return Ok(JsonValue::Null);
    };

    if obj.is_callable() {
        return Ok(JsonValue::Null);
    }

    if obj.is_array() {
        let array = JsArray::from_object(obj.clone()).map_err(script_error)?;
        let length = array.length(ctx).map_err(script_error)?;
        let length = u32::try_from(length)
            .map_err(|_| TetherError::Script("Array length overflow".into()))?;

        let mut result = Vec::with_capacity(length as usize);
        for i in 0..length {
            let elem = array.get(i, ctx).map_err(script_error)?;
            result.push(js_value_to_json(&elem, ctx)?);
        }
        return Ok(JsonValue::Array(result));
    }

    let keys = obj.own_property_keys(ctx).map_err(script_error)?;
    let mut result = serde_json::Map::new();

    for key in keys {
        let key_str = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };

        let prop_value = obj.get(key.clone(), ctx).map_err(script_error)?;
        result.insert(key_str, js_value_to_json(&prop_value, ctx)?);
    }

    Ok(JsonValue::Object(result))
}
