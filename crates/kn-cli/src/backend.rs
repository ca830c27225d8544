//! In-process stand-in for the launcher backend.
//!
//! Serves `speedTest` and `scanArchives` through the loopback transport and
//! reports back the way the real backend does: progress and log events tagged
//! with the caller's task ref on the raw message channel, then the final result
//! on the async-finished signal.

use std::time::Duration;

use kn_tasks::{
    encode_event, AsyncFinished, BridgeError, EventPayload, LogEntry, LogLevel, MessageChannel,
    MethodTable, ProgressUpdate, Signal, TaskEvent, TaskId,
};
use serde_json::{json, Value};
use tracing::info;

const STEP_DELAY: Duration = Duration::from_millis(150);

#[derive(Clone)]
pub(crate) struct Backend {
    messages: MessageChannel,
    finished: Signal<AsyncFinished>,
}

impl Backend {
    pub(crate) fn new(messages: MessageChannel, finished: Signal<AsyncFinished>) -> Self {
        Self { messages, finished }
    }

    pub(crate) fn methods(&self) -> MethodTable {
        let mut methods = MethodTable::new();

        let backend = self.clone();
        methods.register("speedTest", move |args| {
            let (task, params, callback) = split_args("speedTest", &args)?;
            let mirrors = arg_u32(params, 0).unwrap_or(5).max(1);
            let fail_at = arg_u32(params, 1);
            let backend = backend.clone();
            tokio::spawn(async move {
                backend.speed_test(task, mirrors, fail_at, callback).await;
            });
            Ok(Value::Null)
        });

        let backend = self.clone();
        methods.register("scanArchives", move |args| {
            let (task, params, callback) = split_args("scanArchives", &args)?;
            let files = arg_u32(params, 0).unwrap_or(8);
            let backend = backend.clone();
            tokio::spawn(async move {
                backend.scan_archives(task, files, callback).await;
            });
            Ok(Value::Null)
        });

        methods
    }

    fn publish(&self, event: TaskEvent) {
        self.messages.emit(&encode_event(&event));
    }

    fn progress(&self, task: TaskId, progress: f32, description: &str, error: bool) {
        self.publish(TaskEvent::progress(
            task,
            ProgressUpdate {
                progress,
                description: description.to_string(),
                error,
                indeterminate: false,
            },
        ));
    }

    fn log(&self, task: TaskId, level: LogLevel, sender: &str, message: String) {
        let mut entry = LogEntry::new(level, sender, message);
        entry.time_unix_millis = Some(kn_util::now_millis());
        self.publish(TaskEvent::message(task, entry));
    }

    fn outcome(&self, task: TaskId, error: Option<String>) {
        self.publish(TaskEvent {
            task_ref: task,
            payload: EventPayload::Result {
                success: error.is_none(),
                error,
            },
        });
    }

    fn finish(&self, callback: u64, result: Value) {
        self.finished.emit(&AsyncFinished {
            id: callback,
            data: result.to_string(),
        });
    }

    async fn speed_test(&self, task: TaskId, mirrors: u32, fail_at: Option<u32>, callback: u64) {
        info!("speed test for task {task}: {mirrors} mirrors");
        self.publish(TaskEvent::progress(
            task,
            ProgressUpdate {
                progress: 0.0,
                description: "Contacting mirrors".into(),
                error: false,
                indeterminate: true,
            },
        ));
        self.log(task, LogLevel::Info, "speedtest", "Starting test".into());

        let mut results = Vec::new();
        for step in 1..=mirrors {
            tokio::time::sleep(STEP_DELAY).await;

            if fail_at == Some(step) {
                self.log(
                    task,
                    LogLevel::Error,
                    "speedtest",
                    format!("mirror {step}: connection timed out"),
                );
                self.progress(task, step as f32 / mirrors as f32, "Mirror timed out", true);
                self.outcome(task, Some(format!("mirror {step} timed out")));
                self.finish(callback, json!({ "ok": false, "failed_mirror": step }));
                return;
            }

            let speed = 900 + 137 * step;
            results.push(json!({ "mirror": step, "kib_per_sec": speed }));
            self.log(
                task,
                LogLevel::Info,
                "speedtest",
                format!("mirror {step}: {speed} KiB/s"),
            );
            let description = format!("Testing mirror {step} of {mirrors}");
            self.progress(task, step as f32 / mirrors as f32, &description, false);
        }

        self.progress(task, 1.0, "Done", false);
        self.outcome(task, None);
        self.finish(callback, json!({ "ok": true, "mirrors": results }));
    }

    async fn scan_archives(&self, task: TaskId, files: u32, callback: u64) {
        self.log(
            task,
            LogLevel::Info,
            "mods",
            format!("Found {files} mod.json files. Importing..."),
        );
        for done in 1..=files {
            tokio::time::sleep(STEP_DELAY / 2).await;
            let description = format!("Importing {done}/{files}");
            self.progress(task, done as f32 / files.max(1) as f32, &description, false);
        }
        self.log(task, LogLevel::Info, "mods", "Done".into());
        self.progress(task, 1.0, "Done", false);
        self.outcome(task, None);
        self.finish(callback, json!({ "imported": files }));
    }
}

fn arg_u32(args: &[Value], index: usize) -> Option<u32> {
    args.get(index)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

/// Methods take the task ref first and the bridge appends the callback id
/// last; whatever sits between is the method's own parameters.
fn split_args<'a>(
    method: &str,
    args: &'a [Value],
) -> Result<(TaskId, &'a [Value], u64), BridgeError> {
    let (last, rest) = args
        .split_last()
        .ok_or_else(|| BridgeError::failed(method, "missing callback id"))?;
    let callback = last
        .as_u64()
        .ok_or_else(|| BridgeError::failed(method, "missing callback id"))?;
    let (first, params) = rest
        .split_first()
        .ok_or_else(|| BridgeError::failed(method, "first argument must be a task ref"))?;
    let task = first
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .filter(|r| *r > 0)
        .ok_or_else(|| BridgeError::failed(method, "first argument must be a task ref"))?;
    Ok((TaskId(task), params, callback))
}
