//! The seam between the server and a script engine.
//!
//! The coordinator, dispatcher and looper only need to invoke callbacks by
//! handle and reach the session table. The Boa host in [`crate::runtime`] is
//! the production implementation; tests substitute a recording engine.

use bytes::Bytes;
use tether_common::Result;

use crate::registry::{Handle, SessionTable};

/// A value passed from the server into a script callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Bool(bool),
    Int(i64),
    Number(f64),
    Str(String),
    Bytes(Bytes),
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Bool(value)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        ScriptValue::Int(value)
    }
}

impl From<u32> for ScriptValue {
    fn from(value: u32) -> Self {
        ScriptValue::Int(i64::from(value))
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::Str(value.to_string())
    }
}

impl From<Bytes> for ScriptValue {
    fn from(value: Bytes) -> Self {
        ScriptValue::Bytes(value)
    }
}

impl From<Option<Bytes>> for ScriptValue {
    fn from(value: Option<Bytes>) -> Self {
        value.map_or(ScriptValue::Nil, ScriptValue::Bytes)
    }
}

/// Script state owned by the execution coordinator.
///
/// All methods run on the coordinator thread.
pub trait ScriptEngine {
    /// Calls the function registered under `callback`.
    ///
    /// # Errors
    ///
    /// - `TetherError::HandleNotFound` if the callback was released
    /// - `TetherError::Script` if the function threw
    fn invoke(&mut self, callback: Handle, args: &[ScriptValue]) -> Result<()>;

    /// Calls a global function by name.
    ///
    /// Returns `Ok(false)` when no such function is defined.
    fn invoke_global(&mut self, name: &str, args: &[ScriptValue]) -> Result<bool>;

    /// Drops the engine's reference to a callback. Unknown handles are ignored.
    fn release_callback(&mut self, callback: Handle);

    fn sessions(&self) -> &SessionTable;
}
