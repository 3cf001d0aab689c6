//! Native functions exposed to scripts.
//!
//! # JavaScript API
//!
//! - `net.listen(addr, onEvent, options?)` - Start a listener, returns its id
//! - `net.send(handle, data)` - Queue data, returns 0, -1 (closed) or -2 (overflow)
//! - `net.close(handle)` - Close a session
//! - `net.setHead(handle, bool)` - Toggle length-prefixed framing
//! - `net.setTimeout(handle, seconds)` - Per-read/per-write deadline, 0 disables
//! - `net.shutdown(listenerId)` - Stop a listener and close its sessions
//! - `net.localAddr(listenerId)` - Bound address as "ip:port", or null
//! - `net.stats()` - Server counters
//! - `looper.start(ms, fn)` / `looper.stop(id)` - Periodic callbacks
//! - `looper.after(seconds, fn)` - One-shot callback
//! - `looper.timeCountNs()` - Time spent in periodic callbacks
//! - `time.now()` / `time.sinceStart()` - Nanosecond clocks
//!
//! The three nanosecond readings are returned as `BigInt`. Unix time in
//! nanoseconds is past 2^53, where a `Number` would round.
//!
//! `onEvent` is called as `onEvent(kind, sessionId, sessionHandle, payload)`
//! with `kind` one of `net.CONNECTED`, `net.DATA` or `net.CLOSED`.
//!
//! Every native captures the host state through an `Rc`. Natives run on the
//! coordinator thread, and no `RefCell` borrow is held while calling back
//! into JavaScript.

use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use boa_engine::{
    js_string,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
    property::Attribute,
    value::JsValue,
    Context, JsBigInt, JsError, JsNativeError, JsResult,
};
use boa_gc::{Finalize, Trace};
use tether_common::{seconds_to_duration, ListenOptions, ListenerConfig, Result, TetherError};

use crate::dispatcher::{EventDispatcher, EventKind};
use crate::listener::Listener;
use crate::registry::Handle;
use crate::runtime::conversions::{
    js_to_bytes, js_value_to_json, json_to_js_value, native_error, script_error,
};
use crate::runtime::host::HostState;
use crate::session::{send_status, SendError, Session};

#[derive(Trace, Finalize)]
struct Captures {
    #[unsafe_ignore_trace]
    state: Rc<HostState>,
}

type NativeFn = fn(&JsValue, &[JsValue], &Captures, &mut Context) -> JsResult<JsValue>;

/// Install the `net`, `looper` and `time` globals into the context.
///
/// # Errors
///
/// Returns `TetherError::Script` if an object or global cannot be created.
pub(crate) fn install(ctx: &mut Context, state: &Rc<HostState>) -> Result<()> {
    let net = JsObject::with_object_proto(ctx.intrinsics());
    add_function(ctx, &net, state, "listen", 3, net_listen)?;
    add_function(ctx, &net, state, "send", 2, net_send)?;
    add_function(ctx, &net, state, "close", 1, net_close)?;
    add_function(ctx, &net, state, "setHead", 2, net_set_head)?;
    add_function(ctx, &net, state, "setTimeout", 2, net_set_timeout)?;
    add_function(ctx, &net, state, "shutdown", 1, net_shutdown)?;
    add_function(ctx, &net, state, "localAddr", 1, net_local_addr)?;
    add_function(ctx, &net, state, "stats", 0, net_stats)?;
    for (name, kind) in [
        ("CONNECTED", EventKind::Connected),
        ("DATA", EventKind::Data),
        ("CLOSED", EventKind::Closed),
    ] {
        net.set(js_string!(name), JsValue::new(kind.code()), false, ctx)
            .map_err(script_error)?;
    }
    register_global(ctx, "net", net)?;

    let looper = JsObject::with_object_proto(ctx.intrinsics());
    add_function(ctx, &looper, state, "start", 2, looper_start)?;
    add_function(ctx, &looper, state, "stop", 1, looper_stop)?;
    add_function(ctx, &looper, state, "after", 2, looper_after)?;
    add_function(ctx, &looper, state, "timeCountNs", 0, looper_time_count)?;
    register_global(ctx, "looper", looper)?;

    let time = JsObject::with_object_proto(ctx.intrinsics());
    add_function(ctx, &time, state, "now", 0, time_now)?;
    add_function(ctx, &time, state, "sinceStart", 0, time_since_start)?;
    register_global(ctx, "time", time)?;

    Ok(())
}

fn add_function(
    ctx: &mut Context,
    target: &JsObject,
    state: &Rc<HostState>,
    name: &str,
    length: usize,
    native: NativeFn,
) -> Result<()> {
    let captures = Captures {
        state: Rc::clone(state),
    };
    let function = FunctionObjectBuilder::new(
        ctx.realm(),
        NativeFunction::from_copy_closure_with_captures(native, captures),
    )
    .name(js_string!(name))
    .length(length)
    .build();

    target
        .set(js_string!(name), function, false, ctx)
        .map_err(script_error)?;
    Ok(())
}

fn register_global(ctx: &mut Context, name: &str, object: JsObject) -> Result<()> {
    ctx.register_global_property(js_string!(name), object, Attribute::all())
        .map_err(|e| TetherError::Script(format!("Failed to register '{}': {}", name, e)))
}

// ============================================================================
// Argument helpers
// ============================================================================

fn arg(args: &[JsValue], index: usize) -> JsValue {
    args.get(index).cloned().unwrap_or_default()
}

fn type_error(message: impl Into<String>) -> JsError {
    JsNativeError::typ().with_message(message.into()).into()
}

fn arg_function(args: &[JsValue], index: usize, what: &str) -> JsResult<JsObject> {
    args.get(index)
        .and_then(|v| v.as_object().map(|o| o.clone()))
        .filter(|o| o.is_callable())
        .ok_or_else(|| type_error(format!("{}: argument {} must be a function", what, index + 1)))
}

fn arg_duration(args: &[JsValue], index: usize, scale: f64, ctx: &mut Context) -> JsResult<Duration> {
    let value = arg(args, index).to_number(ctx)?;
    seconds_to_duration(value * scale).map_err(native_error)
}

/// Resolves the session behind a script-supplied handle.
///
/// Zero, garbage and released handles all resolve to `None`.
fn arg_session(args: &[JsValue], index: usize, state: &HostState, ctx: &mut Context) -> JsResult<Option<Arc<Session>>> {
    let raw = arg(args, index).to_u32(ctx)?;
    Ok(Handle::from_raw(raw).and_then(|handle| state.sessions.resolve(handle).ok()))
}

// ============================================================================
// net
// ============================================================================

fn net_listen(_this: &JsValue, args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let state = &captures.state;

    let addr = arg(args, 0).to_string(ctx)?.to_std_string_escaped();
    let callback = arg_function(args, 1, "net.listen")?;
    let options = match args.get(2) {
        Some(value) => js_value_to_json(value, ctx).map_err(native_error)?,
        None => serde_json::Value::Null,
    };
    let config = ListenOptions::from_json(options)
        .and_then(|options| options.apply(ListenerConfig::default()))
        .map_err(native_error)?;

    let std_listener = std::net::TcpListener::bind(&addr)
        .map_err(|e| JsNativeError::error().with_message(format!("Failed to bind to {}: {}", addr, e)))?;

    let callback = state.callbacks.borrow_mut().register(callback);
    let server = &state.server;
    let dispatcher = Arc::new(EventDispatcher::new(server.coordinator().clone(), callback));

    let listener = {
        let _runtime = server.runtime().enter();
        Listener::from_std(std_listener, config, dispatcher, Arc::clone(server.metrics()))
            .map_err(native_error)?
    };

    let id = state.next_listener_id();
    state.listeners.borrow_mut().insert(id, listener);
    Ok(JsValue::new(id))
}

fn net_send(_this: &JsValue, args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let payload = js_to_bytes(&arg(args, 1), ctx)?;
    let status = match arg_session(args, 0, &captures.state, ctx)? {
        Some(session) => send_status(session.send(payload)),
        None => SendError::Closed.status(),
    };
    Ok(JsValue::new(status))
}

fn net_close(_this: &JsValue, args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let closed = arg_session(args, 0, &captures.state, ctx)?
        .map(|session| session.close())
        .unwrap_or(false);
    Ok(JsValue::new(closed))
}

fn net_set_head(_this: &JsValue, args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let Some(session) = arg_session(args, 0, &captures.state, ctx)? else {
        return Ok(JsValue::new(false));
    };
    session.set_framing(arg(args, 1).to_boolean());
    Ok(JsValue::new(true))
}

fn net_set_timeout(_this: &JsValue, args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let Some(session) = arg_session(args, 0, &captures.state, ctx)? else {
        return Ok(JsValue::new(false));
    };
    session.set_timeout(arg_duration(args, 1, 1.0, ctx)?);
    Ok(JsValue::new(true))
}

fn net_shutdown(_this: &JsValue, args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let id = arg(args, 0).to_u32(ctx)?;
    let listener = captures.state.listeners.borrow_mut().remove(&id);
    let Some(listener) = listener else {
        return Ok(JsValue::new(false));
    };
    listener.shutdown();
    Ok(JsValue::new(true))
}

fn net_local_addr(_this: &JsValue, args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let id = arg(args, 0).to_u32(ctx)?;
    let addr = captures
        .state
        .listeners
        .borrow()
        .get(&id)
        .map(|listener| listener.local_addr().to_string());
    Ok(addr.map_or_else(JsValue::null, |addr| JsValue::new(js_string!(addr.as_str()))))
}

fn net_stats(_this: &JsValue, _args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let snapshot = captures.state.server.metrics().snapshot();
    let json = serde_json::to_value(snapshot)
        .map_err(|e| native_error(TetherError::JsonSerialization(e)))?;
    json_to_js_value(json, ctx).map_err(native_error)
}

// ============================================================================
// looper
// ============================================================================

fn looper_start(_this: &JsValue, args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let state = &captures.state;
    let period = arg_duration(args, 0, 0.001, ctx)?;
    let callback = arg_function(args, 1, "looper.start")?;

    let callback = state.callbacks.borrow_mut().register(callback);
    let ticker = match state.server.looper().start_ticker(period, callback) {
        Ok(ticker) => ticker,
        Err(e) => {
            let _ = state.callbacks.borrow_mut().release(callback);
            return Err(native_error(e));
        }
    };

    let id = state.next_ticker_id();
    state.tickers.borrow_mut().insert(id, ticker);
    Ok(JsValue::new(id))
}

fn looper_stop(_this: &JsValue, args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let id = arg(args, 0).to_u32(ctx)?;
    let ticker = captures.state.tickers.borrow_mut().remove(&id);
    let Some(ticker) = ticker else {
        return Ok(JsValue::new(false));
    };
    ticker.stop();
    Ok(JsValue::new(true))
}

fn looper_after(_this: &JsValue, args: &[JsValue], captures: &Captures, ctx: &mut Context) -> JsResult<JsValue> {
    let state = &captures.state;
    let delay = arg_duration(args, 0, 1.0, ctx)?;
    let callback = arg_function(args, 1, "looper.after")?;

    let callback = state.callbacks.borrow_mut().register(callback);
    state.server.looper().after(delay, callback);
    Ok(JsValue::undefined())
}

fn looper_time_count(_this: &JsValue, _args: &[JsValue], captures: &Captures, _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsBigInt::from(captures.state.server.loop_counter().nanos()).into())
}

// ============================================================================
// time
// ============================================================================

fn time_now(_this: &JsValue, _args: &[JsValue], _captures: &Captures, _ctx: &mut Context) -> JsResult<JsValue> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(JsBigInt::from(nanos).into())
}

fn time_since_start(_this: &JsValue, _args: &[JsValue], captures: &Captures, _ctx: &mut Context) -> JsResult<JsValue> {
    Ok(JsBigInt::from(captures.state.started.elapsed().as_nanos()).into())
}
