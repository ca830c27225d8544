//! Client-side record of backend tasks.
//!
//! The tracker hands out task ids, folds `ClientSentEvent`s from the raw
//! message channel into per-task state and keeps the newest-first list the
//! progress dialog renders. Tasks stay until explicitly removed so finished
//! and failed tasks remain visible until the user dismisses them.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::{
    config::ClientConfig,
    event::{decode_event, EventPayload, LogEntry, TaskEvent, TaskId},
    signal::{Connection, Signal},
};

const INITIAL_STATUS: &str = "Initialising";

/// Raw backend messages as delivered by the host.
pub type MessageChannel = Signal<[u8]>;

/// Deregisters the listener when dropped or when `unsubscribe` is called.
pub type Listener = Connection<[u8]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Created,
    Running,
    Completed,
    Failed,
}

/// Explicit verdict the backend sent for a task.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub progress: f32,
    pub status: String,
    pub error: bool,
    pub indeterminate: bool,
    pub started_unix_millis: i64,
    pub log_messages: Vec<LogEntry>,
    /// Set when the backend sends an explicit result.
    pub outcome: Option<TaskOutcome>,
    pub last_event_unix_millis: Option<i64>,
}

impl Task {
    fn new(id: TaskId, label: String) -> Self {
        Self {
            id,
            label,
            progress: 0.0,
            status: INITIAL_STATUS.to_string(),
            error: false,
            indeterminate: true,
            started_unix_millis: kn_util::now_millis(),
            log_messages: Vec::new(),
            outcome: None,
            last_event_unix_millis: None,
        }
    }

    /// Counts toward [`TaskTracker::active`].
    pub fn is_active(&self) -> bool {
        self.progress < 1.0 && !self.error
    }

    pub fn phase(&self) -> TaskPhase {
        if self.error {
            TaskPhase::Failed
        } else if self.progress >= 1.0 {
            TaskPhase::Completed
        } else if self.last_event_unix_millis.is_some() {
            TaskPhase::Running
        } else {
            TaskPhase::Created
        }
    }

    fn apply(&mut self, payload: EventPayload, log_limit: Option<usize>) {
        match payload {
            EventPayload::Progress(update) => {
                self.progress = clamp_progress(update.progress);
                self.status = update.description;
                self.error = update.error;
                self.indeterminate = update.indeterminate;
            }
            EventPayload::Message(entry) => {
                self.log_messages.push(entry);
                if let Some(limit) = log_limit {
                    let excess = self.log_messages.len().saturating_sub(limit);
                    if excess > 0 {
                        self.log_messages.drain(..excess);
                    }
                }
            }
            EventPayload::Result { success, error } => {
                self.outcome = Some(TaskOutcome { success, error });
            }
        }
        self.last_event_unix_millis = Some(kn_util::now_millis());
    }
}

fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

struct TrackerState {
    next_id: u32,
    /// Newest first.
    order: VecDeque<TaskId>,
    tasks: HashMap<TaskId, Task>,
    log_limit: Option<usize>,
}

struct Shared {
    state: Mutex<TrackerState>,
    revision: watch::Sender<u64>,
}

/// Cheap to clone; clones share the same task set.
#[derive(Clone)]
pub struct TaskTracker {
    shared: Arc<Shared>,
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new(&ClientConfig::default())
    }
}

impl TaskTracker {
    pub fn new(config: &ClientConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TrackerState {
                    next_id: 1,
                    order: VecDeque::new(),
                    tasks: HashMap::new(),
                    log_limit: config.log_limit(),
                }),
                revision,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.shared.revision.send_modify(|rev| *rev += 1);
    }

    /// Receives the revision number after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn start_task(&self, label: impl Into<String>) -> TaskId {
        let label = label.into();
        let id = {
            let mut state = self.state();
            let id = TaskId(state.next_id);
            state.next_id += 1;
            state.tasks.insert(id, Task::new(id, label.clone()));
            state.order.push_front(id);
            id
        };
        debug!("task {id} started: {label}");
        self.touch();
        id
    }

    /// Folds `event` into its task. Events for unknown ids (never issued or
    /// already removed) are logged and dropped; returns whether it applied.
    pub fn update_task(&self, event: TaskEvent) -> bool {
        let applied = {
            let mut state = self.state();
            let limit = state.log_limit;
            match state.tasks.get_mut(&event.task_ref) {
                Some(task) => {
                    task.apply(event.payload, limit);
                    true
                }
                None => false,
            }
        };
        if applied {
            self.touch();
        } else {
            error!("Got update for missing task {}", event.task_ref);
        }
        applied
    }

    pub fn remove_task(&self, id: TaskId) -> bool {
        let removed = {
            let mut state = self.state();
            match state.order.iter().position(|task_id| *task_id == id) {
                Some(pos) => {
                    state.order.remove(pos);
                    state.tasks.remove(&id);
                    true
                }
                None => false,
            }
        };
        if removed {
            debug!("task {id} removed");
            self.touch();
        } else {
            error!("Tried to remove missing task {id}");
        }
        removed
    }

    /// Number of tasks still in flight, recomputed on every call.
    pub fn active(&self) -> usize {
        self.state()
            .tasks
            .values()
            .filter(|task| task.is_active())
            .count()
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.state().tasks.get(&id).cloned()
    }

    /// Snapshot in display order, newest first.
    pub fn tasks(&self) -> Vec<Task> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes one raw payload and applies it. Decode failures are logged.
    pub fn handle_message(&self, bytes: &[u8]) {
        match decode_event(bytes) {
            Ok(event) => {
                self.update_task(event);
            }
            Err(err) => error!("Dropping backend event: {err}"),
        }
    }

    /// Registers a listener on `channel`. Each call gets an independent
    /// registration; note that two live listeners on the same tracker apply
    /// every event twice.
    pub fn listen(&self, channel: &MessageChannel) -> Listener {
        let tracker = self.clone();
        channel.connect_scoped(move |bytes: &[u8]| tracker.handle_message(bytes))
    }
}
