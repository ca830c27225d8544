//! Task tracking and backend call bridging for the launcher client.
//!
//! [`bridge::CallBridge`] adapts the host's method surface into callback and
//! future based calls. [`tracker::TaskTracker`] allocates task ids for
//! long-running backend operations and folds the progress and log events the
//! backend sends back into per-task state.

pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod signal;
pub mod tracker;

pub use bridge::{
    select_transport, AsyncFinished, CallBridge, LoopbackTransport, MethodTable,
    NativeBridgeTransport, NativeHost, Transport,
};
pub use config::{BridgeMode, ClientConfig};
pub use error::{BridgeError, ConfigError, DecodeError};
pub use event::{
    decode_event, encode_event, EventPayload, LogEntry, LogLevel, ProgressUpdate, TaskEvent,
    TaskId,
};
pub use signal::{connect_once, Connection, Signal, SlotId};
pub use tracker::{Listener, MessageChannel, Task, TaskOutcome, TaskPhase, TaskTracker};
