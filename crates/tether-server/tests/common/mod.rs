#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tether_common::{ListenerConfig, Result, TetherError};
use tether_server::{
    send_status, Coordinator, CoordinatorConfig, CoordinatorHandle, EventDispatcher, FaultPolicy,
    Handle, HandleRegistry, Listener, ScriptEngine, ScriptValue, SessionTable,
};

/// A callback invocation as the engine saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub callback: Handle,
    pub kind: i64,
    pub session_id: i64,
    pub session_handle: i64,
    pub payload: Option<Bytes>,
}

/// What the engine does when it sees a `Data` event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OnData {
    Record,
    Echo,
    /// Send the payload this many times from one callback.
    Burst(usize),
    CloseTwice,
}

#[derive(Default)]
pub struct Recorder {
    pub calls: Mutex<Vec<Call>>,
    pub globals: Mutex<Vec<(String, Vec<ScriptValue>)>>,
    pub released: Mutex<Vec<Handle>>,
    pub send_statuses: Mutex<Vec<i32>>,
    pub close_results: Mutex<Vec<bool>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, session_id: i64) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.session_id == session_id)
            .collect()
    }

    pub fn kinds_for(&self, session_id: i64) -> Vec<i64> {
        self.calls_for(session_id).iter().map(|c| c.kind).collect()
    }

    pub fn count_kind(&self, kind: i64) -> usize {
        self.calls().iter().filter(|c| c.kind == kind).count()
    }
}

/// Script engine stand-in that records every invocation.
pub struct MockEngine {
    recorder: Arc<Recorder>,
    callbacks: HandleRegistry<()>,
    sessions: SessionTable,
    on_data: OnData,
    fail_connected: bool,
    hook_defined: bool,
}

impl MockEngine {
    pub fn register_callback(&mut self) -> Handle {
        self.callbacks.register(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }
}

impl ScriptEngine for MockEngine {
    fn invoke(&mut self, callback: Handle, args: &[ScriptValue]) -> Result<()> {
        self.callbacks.resolve(callback)?;

        let int = |i: usize| match args.get(i) {
            Some(ScriptValue::Int(v)) => *v,
            _ => 0,
        };
        let call = Call {
            callback,
            kind: int(0),
            session_id: int(1),
            session_handle: int(2),
            payload: match args.get(3) {
                Some(ScriptValue::Bytes(b)) => Some(b.clone()),
                _ => None,
            },
        };
        self.recorder.calls.lock().unwrap().push(call.clone());

        if call.kind == 1 && self.fail_connected {
            return Err(TetherError::Script("Error: connect handler failed".into()));
        }

        if call.kind == 2 {
            let handle = Handle::from_raw(call.session_handle as u32)
                .ok_or(TetherError::HandleNotFound(0))?;
            let session = self.sessions.resolve(handle)?;
            let payload = call.payload.clone().unwrap_or_default();

            match self.on_data {
                OnData::Record => {}
                OnData::Echo => {
                    let status = send_status(session.send(payload));
                    self.recorder.send_statuses.lock().unwrap().push(status);
                }
                OnData::Burst(n) => {
                    for _ in 0..n {
                        let status = send_status(session.send(payload.clone()));
                        self.recorder.send_statuses.lock().unwrap().push(status);
                    }
                }
                OnData::CloseTwice => {
                    let mut results = self.recorder.close_results.lock().unwrap();
                    results.push(session.close());
                    results.push(session.close());
                }
            }
        }

        Ok(())
    }

    fn invoke_global(&mut self, name: &str, args: &[ScriptValue]) -> Result<bool> {
        if !self.hook_defined {
            return Ok(false);
        }
        self.recorder
            .globals
            .lock()
            .unwrap()
            .push((name.to_string(), args.to_vec()));
        Ok(true)
    }

    fn release_callback(&mut self, callback: Handle) {
        if self.callbacks.release(callback).is_ok() {
            self.recorder.released.lock().unwrap().push(callback);
        }
    }

    fn sessions(&self) -> &SessionTable {
        &self.sessions
    }
}

pub struct MockOptions {
    pub on_data: OnData,
    pub fail_connected: bool,
    pub hook_defined: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            on_data: OnData::Record,
            fail_connected: false,
            hook_defined: true,
        }
    }
}

pub fn spawn_mock(options: MockOptions) -> (Coordinator<MockEngine>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let engine_recorder = Arc::clone(&recorder);

    let config = CoordinatorConfig::new().with_fault_policy(FaultPolicy::Halt);
    let coordinator = Coordinator::spawn(config, move |_| {
        Ok(MockEngine {
            recorder: engine_recorder,
            callbacks: HandleRegistry::new(),
            sessions: SessionTable::new(),
            on_data: options.on_data,
            fail_connected: options.fail_connected,
            hook_defined: options.hook_defined,
        })
    })
    .unwrap();

    (coordinator, recorder)
}

/// Registers a callback on the engine and starts a listener dispatching to it.
pub async fn listen(
    handle: &CoordinatorHandle<MockEngine>,
    config: ListenerConfig,
) -> (Listener, Handle) {
    let callback = handle
        .call_async(|engine| engine.register_callback())
        .await
        .unwrap();
    let dispatcher = Arc::new(EventDispatcher::new(handle.clone(), callback));
    let metrics = Arc::clone(handle.metrics());

    let listener = Listener::bind("127.0.0.1:0", config, dispatcher, metrics)
        .await
        .unwrap();
    (listener, callback)
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = (payload.len() as u32).to_be_bytes().to_vec();
    buf.extend_from_slice(payload);
    buf
}
