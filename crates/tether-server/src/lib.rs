//! Tether server core.
//!
//! A single-threaded script engine embedded in a multi-connection TCP server.
//! Every interaction with the engine is funnelled through the execution
//! [`Coordinator`], so callbacks never run concurrently no matter how many
//! sessions, listeners and timers are active.
//!
//! # Modules
//!
//! - [`coordinator`] - Dedicated engine thread and its FIFO task queue
//! - [`registry`] - Integer handles for values scripts refer to
//! - [`session`] - Per-connection read/write loops, backpressure and close
//! - [`dispatcher`] - Session events to script callbacks
//! - [`listener`] - TCP accept loops
//! - [`looper`] - Periodic and one-shot script timers
//! - [`shutdown`] - Signal-driven drain
//! - [`runtime`] - The Boa host and its native bindings

pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod listener;
pub mod looper;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod shutdown;

pub use context::ServerContext;
pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorStats, FaultPolicy, Task,
};
pub use dispatcher::{EventDispatcher, EventKind};
pub use engine::{ScriptEngine, ScriptValue};
pub use listener::Listener;
pub use looper::{LoopCounter, Looper, Ticker};
pub use registry::{Handle, HandleRegistry, SessionTable};
pub use runtime::ScriptHost;
pub use session::{send_status, CloseReason, EventSink, SendError, Session, SessionState};
pub use shutdown::{ShutdownCoordinator, QUIT_HOOK};
