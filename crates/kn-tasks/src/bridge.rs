//! Call bridge between presentation code and the backend's method surface.
//!
//! Two transports implement the same contract: [`NativeBridgeTransport`]
//! forwards to a host object that answers asynchronously, and
//! [`LoopbackTransport`] runs locally registered handlers inline. The choice is
//! made once per session by [`select_transport`].
//!
//! Long-running methods use [`CallBridge::call_async`]: the bridge appends a
//! callback id to the arguments and the answer arrives later through the
//! host's async-finished signal, which [`CallBridge::attach`] wires up.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::{
    config::BridgeMode,
    error::BridgeError,
    signal::{Connection, Signal},
};

pub type Args = Vec<Value>;
pub type Reply = Box<dyn FnOnce(Value) + Send>;
pub type Handler = Arc<dyn Fn(Args) -> Result<Value, BridgeError> + Send + Sync>;

/// Completion notice for an async call: `(callback id, JSON-encoded result)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsyncFinished {
    pub id: u64,
    pub data: String,
}

/// The host-provided object. Dispatch mechanics live on the host side.
pub trait NativeHost: Send + Sync {
    /// Invokes `method`; the host calls `reply` exactly once when it has an answer.
    fn invoke(&self, method: &str, args: Args, reply: Reply) -> Result<(), BridgeError>;
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn call(&self, method: &str, args: Args, reply: Reply) -> Result<(), BridgeError>;
}

pub struct NativeBridgeTransport {
    host: Arc<dyn NativeHost>,
}

impl NativeBridgeTransport {
    pub fn new(host: Arc<dyn NativeHost>) -> Self {
        Self { host }
    }
}

impl Transport for NativeBridgeTransport {
    fn name(&self) -> &'static str {
        "native"
    }

    fn call(&self, method: &str, args: Args, reply: Reply) -> Result<(), BridgeError> {
        self.host.invoke(method, args, reply)
    }
}

/// Name-to-handler table for methods served in-process.
#[derive(Clone, Default)]
pub struct MethodTable {
    handlers: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(Args) -> Result<Value, BridgeError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }
}

pub struct LoopbackTransport {
    methods: MethodTable,
}

impl LoopbackTransport {
    pub fn new(methods: MethodTable) -> Self {
        Self { methods }
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    /// Runs the handler inline and answers immediately. A handler error is
    /// returned to the caller and `reply` is never invoked.
    fn call(&self, method: &str, args: Args, reply: Reply) -> Result<(), BridgeError> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| BridgeError::UnknownMethod(method.to_string()))?;
        let value = handler(args)?;
        reply(value);
        Ok(())
    }
}

pub fn select_transport(
    mode: BridgeMode,
    host: Option<Arc<dyn NativeHost>>,
    methods: MethodTable,
) -> Result<Arc<dyn Transport>, BridgeError> {
    let transport: Arc<dyn Transport> = match (mode, host) {
        (BridgeMode::Native, None) => return Err(BridgeError::HostUnavailable),
        (BridgeMode::Native | BridgeMode::Auto, Some(host)) => {
            Arc::new(NativeBridgeTransport::new(host))
        }
        (BridgeMode::Loopback, _) | (BridgeMode::Auto, None) => {
            Arc::new(LoopbackTransport::new(methods))
        }
    };
    debug!("call bridge using {} transport", transport.name());
    Ok(transport)
}

pub struct CallBridge {
    transport: Arc<dyn Transport>,
    next_callback: AtomicU64,
    pending: Mutex<HashMap<u64, Reply>>,
}

impl CallBridge {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            next_callback: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Reply>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn call<F>(&self, method: &str, args: Args, reply: F) -> Result<(), BridgeError>
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.transport.call(method, args, Box::new(reply))
    }

    /// Issues `method` with a fresh callback id appended to `args` and parks
    /// `reply` until [`CallBridge::async_cb_finished`] sees that id.
    ///
    /// Ids come from a counter owned by this bridge and are never reused, even
    /// when the dispatch itself fails.
    pub fn call_async<F>(&self, method: &str, mut args: Args, reply: F) -> Result<u64, BridgeError>
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let id = self.next_callback.fetch_add(1, Ordering::Relaxed);
        self.pending().insert(id, Box::new(reply));
        args.push(Value::from(id));

        // The immediate reply of an async method carries nothing useful.
        if let Err(err) = self.transport.call(method, args, Box::new(|_| {})) {
            self.pending().remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Delivers the result for callback `id`. Unknown or already answered ids
    /// are ignored so duplicate and late deliveries are harmless.
    pub fn async_cb_finished(&self, id: u64, data: &str) -> bool {
        let Some(reply) = self.pending().remove(&id) else {
            debug!("ignoring async result for unknown callback {id}");
            return false;
        };
        match serde_json::from_str::<Value>(data) {
            Ok(value) => {
                reply(value);
                true
            }
            Err(err) => {
                error!("async result for callback {id} is not valid JSON: {err}");
                false
            }
        }
    }

    /// Connects the dispatcher to the host's async-finished signal.
    pub fn attach(self: &Arc<Self>, finished: &Signal<AsyncFinished>) -> Connection<AsyncFinished> {
        let bridge = Arc::downgrade(self);
        finished.connect_scoped(move |done: &AsyncFinished| {
            if let Some(bridge) = bridge.upgrade() {
                bridge.async_cb_finished(done.id, &done.data);
            }
        })
    }

    pub fn pending_calls(&self) -> usize {
        self.pending().len()
    }

    /// Future form of [`CallBridge::call`]. The reply path has no error
    /// channel; the only failures are a synchronous dispatch error or the
    /// transport dropping the reply unanswered.
    pub async fn call_promise(&self, method: &str, args: Args) -> Result<Value, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.call(method, args, move |value| {
            let _ = tx.send(value);
        })?;
        rx.await.map_err(|_| BridgeError::ReplyDropped {
            method: method.to_string(),
        })
    }

    /// Future form of [`CallBridge::call_async`], same failure rules.
    pub async fn call_async_promise(&self, method: &str, args: Args) -> Result<Value, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.call_async(method, args, move |value| {
            let _ = tx.send(value);
        })?;
        rx.await.map_err(|_| BridgeError::ReplyDropped {
            method: method.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loopback(methods: MethodTable) -> CallBridge {
        CallBridge::new(Arc::new(LoopbackTransport::new(methods)))
    }

    /// Host that remembers replies so tests decide when (and whether) to answer.
    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<(String, Args)>>,
        replies: Mutex<Vec<Reply>>,
    }

    impl NativeHost for RecordingHost {
        fn invoke(&self, method: &str, args: Args, reply: Reply) -> Result<(), BridgeError> {
            self.calls.lock().unwrap().push((method.to_string(), args));
            self.replies.lock().unwrap().push(reply);
            Ok(())
        }
    }

    #[test]
    fn loopback_call_replies_inline() {
        let mut methods = MethodTable::new();
        methods.register("getVersion", |_| Ok(json!("0.14.2")));
        let bridge = loopback(methods);

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        bridge
            .call("getVersion", vec![], move |v| *sink.lock().unwrap() = Some(v))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(json!("0.14.2")));
    }

    #[test]
    fn loopback_handler_error_reaches_caller_not_callback() {
        let mut methods = MethodTable::new();
        methods.register("install", |_| Err(BridgeError::failed("install", "disk full")));
        let bridge = loopback(methods);

        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);
        let err = bridge
            .call("install", vec![json!("mvps")], move |_| *flag.lock().unwrap() = true)
            .unwrap_err();
        assert!(matches!(err, BridgeError::MethodFailed { .. }));
        assert!(!*called.lock().unwrap());
    }

    #[test]
    fn unknown_loopback_method_is_an_error() {
        let bridge = loopback(MethodTable::new());
        let err = bridge.call("nope", vec![], |_| {}).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownMethod(name) if name == "nope"));
    }

    #[test]
    fn native_call_waits_for_host_reply() {
        let host = Arc::new(RecordingHost::default());
        let bridge = CallBridge::new(Arc::new(NativeBridgeTransport::new(host.clone())));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bridge
            .call("isFsoInstalled", vec![], move |v| sink.lock().unwrap().push(v))
            .unwrap();
        assert!(seen.lock().unwrap().is_empty());

        let reply = host.replies.lock().unwrap().pop().unwrap();
        reply(json!(true));
        assert_eq!(*seen.lock().unwrap(), vec![json!(true)]);
    }

    #[test]
    fn async_ids_increase_while_calls_are_outstanding() {
        let host = Arc::new(RecordingHost::default());
        let bridge = CallBridge::new(Arc::new(NativeBridgeTransport::new(host.clone())));

        let first = bridge.call_async("fetchModlist", vec![], |_| {}).unwrap();
        let second = bridge.call_async("fetchModlist", vec![], |_| {}).unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(bridge.pending_calls(), 2);

        let calls = host.calls.lock().unwrap();
        assert_eq!(calls[0].1.last(), Some(&json!(first)));
        assert_eq!(calls[1].1.last(), Some(&json!(second)));
    }

    #[test]
    fn async_result_is_delivered_once_and_stale_ids_are_ignored() {
        let host = Arc::new(RecordingHost::default());
        let bridge = CallBridge::new(Arc::new(NativeBridgeTransport::new(host)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = bridge
            .call_async("getUpdates", vec![json!("FS2")], move |v| sink.lock().unwrap().push(v))
            .unwrap();

        assert!(bridge.async_cb_finished(id, r#"{"updates": 2}"#));
        assert!(!bridge.async_cb_finished(id, r#"{"updates": 3}"#));
        assert!(!bridge.async_cb_finished(id + 100, "null"));

        assert_eq!(*seen.lock().unwrap(), vec![json!({"updates": 2})]);
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[test]
    fn failed_async_dispatch_consumes_the_id() {
        let bridge = loopback(MethodTable::new());
        assert!(bridge.call_async("missing", vec![], |_| {}).is_err());
        assert_eq!(bridge.pending_calls(), 0);

        let mut methods = MethodTable::new();
        methods.register("noop", |_| Ok(Value::Null));
        let bridge = CallBridge {
            transport: Arc::new(LoopbackTransport::new(methods)),
            ..bridge
        };
        assert_eq!(bridge.call_async("noop", vec![], |_| {}).unwrap(), 1);
    }

    #[test]
    fn attached_signal_dispatches_results() {
        let host = Arc::new(RecordingHost::default());
        let bridge = Arc::new(CallBridge::new(Arc::new(NativeBridgeTransport::new(host))));
        let finished: Signal<AsyncFinished> = Signal::new();
        let connection = bridge.attach(&finished);

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let id = bridge
            .call_async("query", vec![], move |v| *sink.lock().unwrap() = Some(v))
            .unwrap();
        finished.emit(&AsyncFinished {
            id,
            data: "[1, 2]".into(),
        });
        assert_eq!(*seen.lock().unwrap(), Some(json!([1, 2])));

        drop(connection);
        assert_eq!(finished.slot_count(), 0);
    }

    #[test]
    fn invalid_json_result_drops_the_callback() {
        let host = Arc::new(RecordingHost::default());
        let bridge = CallBridge::new(Arc::new(NativeBridgeTransport::new(host)));
        let id = bridge.call_async("query", vec![], |_| panic!("must not run")).unwrap();
        assert!(!bridge.async_cb_finished(id, "{not json"));
        assert_eq!(bridge.pending_calls(), 0);
    }

    #[tokio::test]
    async fn call_promise_resolves_with_reply() {
        let mut methods = MethodTable::new();
        methods.register("vercmp", |args| {
            let a = args.first().and_then(Value::as_str).unwrap_or_default();
            let b = args.get(1).and_then(Value::as_str).unwrap_or_default();
            Ok(json!(a.cmp(b) as i8))
        });
        let bridge = loopback(methods);
        let value = bridge
            .call_promise("vercmp", vec![json!("1.0"), json!("1.1")])
            .await
            .unwrap();
        assert_eq!(value, json!(-1));
    }

    #[tokio::test]
    async fn call_async_promise_resolves_from_signal() {
        let finished: Signal<AsyncFinished> = Signal::new();
        let mut methods = MethodTable::new();
        let emitter = finished.clone();
        methods.register("scan", move |args| {
            let id = args.last().and_then(Value::as_u64).unwrap_or_default();
            let emitter = emitter.clone();
            tokio::spawn(async move {
                emitter.emit(&AsyncFinished {
                    id,
                    data: r#"{"found": 4}"#.into(),
                });
            });
            Ok(Value::Null)
        });
        let bridge = Arc::new(loopback(methods));
        let _connection = bridge.attach(&finished);

        let value = bridge.call_async_promise("scan", vec![json!(1)]).await.unwrap();
        assert_eq!(value, json!({"found": 4}));
    }

    #[tokio::test]
    async fn dropped_native_reply_surfaces_as_error() {
        let host = Arc::new(RecordingHost::default());
        let bridge = CallBridge::new(Arc::new(NativeBridgeTransport::new(host.clone())));
        let fut = bridge.call_promise("runMod", vec![]);
        tokio::pin!(fut);
        tokio::select! {
            _ = &mut fut => panic!("resolved before host answered"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
        }
        host.replies.lock().unwrap().clear();
        let err = fut.await.unwrap_err();
        assert!(matches!(err, BridgeError::ReplyDropped { .. }));
    }

    #[test]
    fn transport_selection() {
        let host: Arc<dyn NativeHost> = Arc::new(RecordingHost::default());
        let pick = |mode, host: Option<Arc<dyn NativeHost>>| {
            select_transport(mode, host, MethodTable::new()).map(|t| t.name())
        };
        assert_eq!(pick(BridgeMode::Auto, Some(host.clone())).unwrap(), "native");
        assert_eq!(pick(BridgeMode::Auto, None).unwrap(), "loopback");
        assert_eq!(pick(BridgeMode::Loopback, Some(host)).unwrap(), "loopback");
        assert!(matches!(
            pick(BridgeMode::Native, None),
            Err(BridgeError::HostUnavailable)
        ));
    }
}
