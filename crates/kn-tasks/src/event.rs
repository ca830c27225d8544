//! Decoding of backend event envelopes into tracker events.

use std::fmt;

use kn_proto::client::{
    client_sent_event::Payload, log_message::LogLevel as WireLevel, ClientSentEvent, LogMessage,
    ProgressMessage, TaskResult,
};
use prost::Message;
use serde::Serialize;

use crate::error::DecodeError;

/// Identifier handed out by the tracker and echoed back by the backend as `ref`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Unknown,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl From<WireLevel> for LogLevel {
    fn from(level: WireLevel) -> Self {
        match level {
            WireLevel::Unknown => LogLevel::Unknown,
            WireLevel::Debug => LogLevel::Debug,
            WireLevel::Info => LogLevel::Info,
            WireLevel::Warning => LogLevel::Warning,
            WireLevel::Error => LogLevel::Error,
            WireLevel::Fatal => LogLevel::Fatal,
        }
    }
}

impl From<LogLevel> for WireLevel {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Unknown => WireLevel::Unknown,
            LogLevel::Debug => WireLevel::Debug,
            LogLevel::Info => WireLevel::Info,
            LogLevel::Warning => WireLevel::Warning,
            LogLevel::Error => WireLevel::Error,
            LogLevel::Fatal => WireLevel::Fatal,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub sender: String,
    pub message: String,
    /// Backend clock, unix millis.
    pub time_unix_millis: Option<i64>,
}

impl LogEntry {
    pub fn new(level: LogLevel, sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            sender: sender.into(),
            message: message.into(),
            time_unix_millis: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub progress: f32,
    pub description: String,
    pub error: bool,
    pub indeterminate: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventPayload {
    Message(LogEntry),
    Progress(ProgressUpdate),
    /// Final verdict; failed results usually carry the backend's error text.
    Result {
        success: bool,
        error: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskEvent {
    #[serde(rename = "ref")]
    pub task_ref: TaskId,
    pub payload: EventPayload,
}

impl TaskEvent {
    pub fn message(task_ref: TaskId, entry: LogEntry) -> Self {
        Self {
            task_ref,
            payload: EventPayload::Message(entry),
        }
    }

    pub fn progress(task_ref: TaskId, update: ProgressUpdate) -> Self {
        Self {
            task_ref,
            payload: EventPayload::Progress(update),
        }
    }
}

pub fn decode_event(bytes: &[u8]) -> Result<TaskEvent, DecodeError> {
    let raw = ClientSentEvent::decode(bytes)?;
    TaskEvent::try_from(raw)
}

pub fn encode_event(event: &TaskEvent) -> Vec<u8> {
    ClientSentEvent::from(event.clone()).encode_to_vec()
}

impl TryFrom<ClientSentEvent> for TaskEvent {
    type Error = DecodeError;

    fn try_from(raw: ClientSentEvent) -> Result<Self, Self::Error> {
        let task_ref = TaskId(raw.r#ref);
        let payload = match raw.payload.ok_or(DecodeError::MissingPayload(raw.r#ref))? {
            Payload::Message(msg) => EventPayload::Message(LogEntry {
                // Unknown enum values from a newer backend degrade to Unknown.
                level: WireLevel::try_from(msg.level)
                    .map(LogLevel::from)
                    .unwrap_or(LogLevel::Unknown),
                sender: msg.sender,
                message: msg.message,
                time_unix_millis: msg.time.and_then(timestamp_millis),
            }),
            Payload::Progress(p) => EventPayload::Progress(ProgressUpdate {
                progress: p.progress,
                description: p.description,
                error: p.error,
                indeterminate: p.indeterminate,
            }),
            Payload::Result(result) => EventPayload::Result {
                success: result.success,
                error: Some(result.error).filter(|e| !e.is_empty()),
            },
        };
        Ok(Self { task_ref, payload })
    }
}

/// Timestamps too far out to fit in i64 millis are dropped rather than wrapped.
fn timestamp_millis(ts: prost_types::Timestamp) -> Option<i64> {
    ts.seconds
        .checked_mul(1000)?
        .checked_add(i64::from(ts.nanos) / 1_000_000)
}

impl From<TaskEvent> for ClientSentEvent {
    fn from(event: TaskEvent) -> Self {
        let payload = match event.payload {
            EventPayload::Message(entry) => Payload::Message(LogMessage {
                level: WireLevel::from(entry.level) as i32,
                message: entry.message,
                sender: entry.sender,
                time: entry.time_unix_millis.map(|ms| prost_types::Timestamp {
                    seconds: ms.div_euclid(1000),
                    nanos: (ms.rem_euclid(1000) * 1_000_000) as i32,
                }),
            }),
            EventPayload::Progress(update) => Payload::Progress(ProgressMessage {
                progress: update.progress,
                description: update.description,
                error: update.error,
                indeterminate: update.indeterminate,
            }),
            EventPayload::Result { success, error } => Payload::Result(TaskResult {
                success,
                error: error.unwrap_or_default(),
            }),
        };
        ClientSentEvent {
            r#ref: event.task_ref.0,
            payload: Some(payload),
        }
    }
}
