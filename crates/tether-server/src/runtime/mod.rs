//! Boa JavaScript host.

mod bindings;
mod conversions;
mod host;


pub use conversions::{js_to_bytes, js_value_to_json, json_to_js_value, script_value_to_js};
pub use host::ScriptHost;
