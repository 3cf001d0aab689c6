use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use boa_engine::{js_string, object::JsObject, value::JsValue, Context, Source};
use serde_json::Value as JsonValue;
use tether_common::{Result, TetherError};

use crate::context::ServerContext;
use crate::engine::{ScriptEngine, ScriptValue};
use crate::listener::Listener;
use crate::looper::Ticker;
use crate::registry::{Handle, HandleRegistry, SessionTable};
use crate::runtime::bindings;
use crate::runtime::conversions::{js_value_to_json, script_error, script_value_to_js};

/// Host-side state shared by every native binding.
///
/// Lives on the coordinator thread only.
pub(crate) struct HostState {
    pub(crate) server: ServerContext<ScriptHost>,
    pub(crate) callbacks: RefCell<HandleRegistry<JsObject>>,
    pub(crate) sessions: SessionTable,
    pub(crate) listeners: RefCell<HashMap<u32, Listener>>,
    pub(crate) tickers: RefCell<HashMap<u32, Ticker>>,
    pub(crate) next_listener: Cell<u32>,
    pub(crate) next_ticker: Cell<u32>,
    pub(crate) started: Instant,
}

impl HostState {
    pub(crate) fn next_listener_id(&self) -> u32 {
        let id = self.next_listener.get().wrapping_add(1).max(1);
        self.next_listener.set(id);
        id
    }

    pub(crate) fn next_ticker_id(&self) -> u32 {
        let id = self.next_ticker.get().wrapping_add(1).max(1);
        self.next_ticker.set(id);
        id
    }

    fn shutdown(&self) {
        for (_, listener) in self.listeners.borrow_mut().drain() {
            listener.shutdown();
        }
        for (_, ticker) in self.tickers.borrow_mut().drain() {
            ticker.stop();
        }
        self.callbacks.borrow_mut().drain();
    }
}

/// Boa JavaScript context with the `net`, `looper` and `time` globals.
///
/// Built on the coordinator thread by the coordinator's factory and never
/// leaves it.
///
/// # Example
///
/// ```ignore
/// let coordinator = Coordinator::spawn(CoordinatorConfig::new(), move |handle| {
///     ScriptHost::load(ServerContext::new(handle.clone(), runtime), "server.js")
/// })?;
/// ```
pub struct ScriptHost {
    ctx: Context,
    state: Rc<HostState>,
}

impl ScriptHost {
    /// Creates a host with bindings installed and no script loaded.
    pub fn new(server: ServerContext<ScriptHost>) -> Result<Self> {
        let state = Rc::new(HostState {
            server,
            callbacks: RefCell::new(HandleRegistry::new()),
            sessions: SessionTable::new(),
            listeners: RefCell::new(HashMap::new()),
            tickers: RefCell::new(HashMap::new()),
            next_listener: Cell::new(0),
            next_ticker: Cell::new(0),
            started: Instant::now(),
        });

        let mut ctx = Context::default();
        bindings::install(&mut ctx, &state)?;

        Ok(Self { ctx, state })
    }

    /// Creates a host and evaluates `source` in it.
    pub fn from_source(server: ServerContext<ScriptHost>, source: &str) -> Result<Self> {
        let mut host = Self::new(server)?;
        host.eval(source)?;
        Ok(host)
    }

    /// Creates a host and evaluates the script at `path`.
    pub fn load(server: ServerContext<ScriptHost>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            TetherError::InvalidConfig(format!("Failed to load script {}: {}", path.display(), e))
        })?;

        tracing::info!("Loading script {}", path.display());
        Self::from_source(server, &source)
    }

    /// Evaluates `source` and returns its completion value as JSON.
    pub fn eval(&mut self, source: &str) -> Result<JsonValue> {
        let result = self
            .ctx
            .eval(Source::from_bytes(source))
            .map_err(|e| TetherError::Script(format!("Script evaluation error: {}", e)));
        let _ = self.ctx.run_jobs();

        js_value_to_json(&result?, &mut self.ctx)
    }

    pub fn server(&self) -> &ServerContext<ScriptHost> {
        &self.state.server
    }

    /// Number of callbacks currently retained by the host.
    pub fn callback_count(&self) -> usize {
        self.state.callbacks.borrow().len()
    }

    pub fn listener_count(&self) -> usize {
        self.state.listeners.borrow().len()
    }

    fn call(&mut self, func: &JsObject, args: &[ScriptValue]) -> Result<()> {
        let js_args = args
            .iter()
            .map(|arg| script_value_to_js(arg, &mut self.ctx))
            .collect::<Result<Vec<_>>>()?;

        let result = func.call(&JsValue::undefined(), &js_args, &mut self.ctx);
        let _ = self.ctx.run_jobs();

        result.map(|_| ()).map_err(script_error)
    }
}

impl ScriptEngine for ScriptHost {
    fn invoke(&mut self, callback: Handle, args: &[ScriptValue]) -> Result<()> {
        let func = self.state.callbacks.borrow().resolve(callback)?.clone();
        self.call(&func, args)
    }

    fn invoke_global(&mut self, name: &str, args: &[ScriptValue]) -> Result<bool> {
        let global = self.ctx.global_object();
        let value = global
            .get(js_string!(name), &mut self.ctx)
            .map_err(script_error)?;

        let Some(func) = value.as_object().map(|o| o.clone()).filter(|o| o.is_callable()) else {
            return Ok(false);
        };

        self.call(&func, args)?;
        Ok(true)
    }

    fn release_callback(&mut self, callback: Handle) {
        if let Err(e) = self.state.callbacks.borrow_mut().release(callback) {
            tracing::debug!("Releasing callback: {}", e);
        }
    }

    fn sessions(&self) -> &SessionTable {
        &self.state.sessions
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        self.state.shutdown();
    }
}
