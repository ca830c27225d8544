//! Wire messages the backend pushes to the client over the raw message
//! channel.
//!
//! These mirror `client.proto` on the backend side field for field. They are
//! declared with the prost derives directly so the crate builds without a
//! protoc step; keep the tags in sync when the backend schema changes.

pub mod client {
    /// One log line emitted by the backend for a running task.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct LogMessage {
        #[prost(enumeration = "log_message::LogLevel", tag = "1")]
        pub level: i32,
        #[prost(string, tag = "2")]
        pub message: String,
        #[prost(string, tag = "3")]
        pub sender: String,
        #[prost(message, optional, tag = "4")]
        pub time: Option<::prost_types::Timestamp>,
    }

    pub mod log_message {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
        #[repr(i32)]
        pub enum LogLevel {
            Unknown = 0,
            Debug = 1,
            Info = 2,
            Warning = 3,
            Error = 4,
            Fatal = 5,
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ProgressMessage {
        #[prost(float, tag = "1")]
        pub progress: f32,
        #[prost(string, tag = "2")]
        pub description: String,
        #[prost(bool, tag = "3")]
        pub error: bool,
        #[prost(bool, tag = "4")]
        pub indeterminate: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TaskResult {
        #[prost(bool, tag = "1")]
        pub success: bool,
        /// Empty on success.
        #[prost(string, tag = "2")]
        pub error: String,
    }

    /// Envelope correlating a payload with the task that requested it.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ClientSentEvent {
        #[prost(uint32, tag = "1")]
        pub r#ref: u32,
        #[prost(oneof = "client_sent_event::Payload", tags = "2, 3, 4")]
        pub payload: Option<client_sent_event::Payload>,
    }

    pub mod client_sent_event {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Payload {
            #[prost(message, tag = "2")]
            Message(super::LogMessage),
            #[prost(message, tag = "3")]
            Progress(super::ProgressMessage),
            #[prost(message, tag = "4")]
            Result(super::TaskResult),
        }
    }
}
