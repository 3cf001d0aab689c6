pub mod config;
pub mod error;

pub use config::{seconds_to_duration, ConnectPolicy, ListenOptions, ListenerConfig};
pub use error::{Result, TetherError};
