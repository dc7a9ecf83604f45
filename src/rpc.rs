use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::transport::{Connector, Duplex, Frame};

const LT: &str = "elc::rpc"; // log target name

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

pub type NotifyFn = Box<dyn Fn(Value) + Send>;

/// (method, serialized first param): the tuple a notification is routed by.
/// Subscriptions without identifying params (headers) register under an empty
/// param key and receive everything sent for their method.
type SubKey = (String, String);

enum Outgoing {
    Frame(String),
    Shutdown,
}

enum Sink {
    /// A caller blocked on `request`.
    Caller(mpsc::Sender<Result<Value>>),
    /// The initial response of a subscription request, forwarded to its callback.
    Subscription(SubKey),
}

struct Subscription {
    params: Vec<Value>,
    callback: NotifyFn,
}

enum Exit {
    /// `close` was called or every sender went away.
    Shutdown,
    /// The transport dropped underneath us.
    Dropped(String),
    /// The peer violated JSON-RPC framing; fatal for the channel.
    Poisoned(String),
}

struct Shared {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Sink>>,
    subscriptions: Mutex<HashMap<SubKey, Subscription>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

/// A duplex JSON-RPC 2.0 multiplexer over a single message stream. Outbound
/// requests carry increasing numeric ids and are correlated with responses by
/// id; unsolicited notifications dispatch by method and first param to the
/// registered subscription callback.
pub struct RpcChannel {
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<Outgoing>,
    socket_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RpcChannel {
    /// Open the channel over whatever duplex the connector yields. With
    /// `reconnect` enabled a dropped transport is re-dialed with capped
    /// exponential backoff and all registered subscriptions are re-established;
    /// pending requests never survive the drop.
    pub fn connect(connector: Connector, reconnect: bool) -> Result<Self> {
        let duplex = connector()?;
        let (outgoing_tx, outgoing_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let socket_thread = spawn_thread("elc-socket", move || {
            run_socket(duplex, thread_shared, outgoing_rx, connector, reconnect)
        });

        Ok(RpcChannel {
            shared,
            outgoing: outgoing_tx,
            socket_thread: Mutex::new(Some(socket_thread)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Send a request and block until its response arrives.
    pub fn request(&self, method: &str, params: &[Value]) -> Result<Value> {
        let (id, rx) = self.send_request(method, params)?;
        match rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&id);
                Err(Error::ConnectionLost("channel closed".into()))
            }
        }
    }

    /// Like `request`, but give up after `timeout`. A late response for the
    /// abandoned id is dropped by the dispatcher.
    pub fn request_timeout(&self, method: &str, params: &[Value], timeout: Duration) -> Result<Value> {
        let (id, rx) = self.send_request(method, params)?;
        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.shared.pending.lock().unwrap().remove(&id);
                Err(Error::RpcTimeout(method.into()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.shared.pending.lock().unwrap().remove(&id);
                Err(Error::ConnectionLost("channel closed".into()))
            }
        }
    }

    /// Register `callback` under `(method, params)` and send the subscription
    /// request. Both the initial response and every later notification with a
    /// matching method and first param are forwarded to the callback.
    pub fn subscribe(&self, method: &str, params: Vec<Value>, callback: NotifyFn) -> Result<()> {
        let key = (method.to_string(), param_key(params.first()));
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .insert(key.clone(), Subscription { params: params.clone(), callback });
        self.send_with_sink(method, &params, Sink::Subscription(key))?;
        Ok(())
    }

    /// Drop the local callback. Server-side unsubscription is best-effort:
    /// the unsubscribe RPC is fired and its outcome ignored.
    pub fn unsubscribe(&self, method: &str, params: &[Value]) -> Result<()> {
        let key = (method.to_string(), param_key(params.first()));
        self.shared.subscriptions.lock().unwrap().remove(&key);
        if let Some(base) = method.strip_suffix(".subscribe") {
            let (_id, _rx) = self.send_request(&format!("{}.unsubscribe", base), params)?;
        }
        Ok(())
    }

    /// Tear down the transport. Pending requests fail with `ConnectionLost`;
    /// repeated calls are no-ops.
    pub fn close(&self, reason: &str) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: LT, "closing channel: {}", reason);
        let _ = self.outgoing.send(Outgoing::Shutdown);
        if let Some(handle) = self.socket_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let reason = reason.to_string();
        fail_pending(&self.shared, || Error::ConnectionLost(reason.clone()));
    }

    fn send_request(&self, method: &str, params: &[Value]) -> Result<(u64, mpsc::Receiver<Result<Value>>)> {
        let (tx, rx) = mpsc::channel();
        let id = self.send_with_sink(method, params, Sink::Caller(tx))?;
        Ok((id, rx))
    }

    fn send_with_sink(&self, method: &str, params: &[Value], sink: Sink) -> Result<u64> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLost("channel closed".into()));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.pending.lock().unwrap().insert(id, sink);

        trace!(target: LT, "rpc #{} -> {} {}", id, method, json!(params));
        let frame = request_frame(id, method, params);
        if self.outgoing.send(Outgoing::Frame(frame)).is_err() {
            self.shared.pending.lock().unwrap().remove(&id);
            return Err(Error::ConnectionLost("channel closed".into()));
        }
        Ok(id)
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.close("channel dropped");
    }
}

fn request_frame(id: u64, method: &str, params: &[Value]) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string()
}

fn param_key(param: Option<&Value>) -> String {
    match param {
        None | Some(Value::Null) => String::new(),
        Some(value) => value.to_string(),
    }
}

fn run_socket(
    mut duplex: Box<dyn Duplex>,
    shared: Arc<Shared>,
    outgoing_rx: mpsc::Receiver<Outgoing>,
    connector: Connector,
    reconnect: bool,
) {
    loop {
        shared.connected.store(true, Ordering::SeqCst);
        let exit = serve(duplex.as_mut(), &shared, &outgoing_rx);
        shared.connected.store(false, Ordering::SeqCst);
        duplex.shutdown();

        match exit {
            Exit::Shutdown => {
                fail_pending(&shared, || Error::ConnectionLost("channel closed".into()));
                break;
            }
            Exit::Poisoned(reason) => {
                warn!(target: LT, "peer poisoned the channel: {}", reason);
                fail_pending(&shared, || Error::Protocol(reason.clone()));
                break;
            }
            Exit::Dropped(reason) => {
                info!(target: LT, "connection dropped: {}", reason);
                fail_pending(&shared, || Error::ConnectionLost(reason.clone()));
                if !reconnect || shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                duplex = match redial(&shared, &outgoing_rx, &connector) {
                    Some(duplex) => duplex,
                    None => break,
                };
            }
        }
    }
}

/// One connection's worth of traffic: flush queued outbound frames, then poll
/// for an inbound one, until something gives.
fn serve(duplex: &mut dyn Duplex, shared: &Shared, outgoing_rx: &mpsc::Receiver<Outgoing>) -> Exit {
    loop {
        loop {
            match outgoing_rx.try_recv() {
                Ok(Outgoing::Frame(frame)) => {
                    if let Err(e) = duplex.send(&frame) {
                        return Exit::Dropped(e.to_string());
                    }
                }
                Ok(Outgoing::Shutdown) | Err(TryRecvError::Disconnected) => return Exit::Shutdown,
                Err(TryRecvError::Empty) => break,
            }
        }

        match duplex.poll() {
            Ok(Frame::Message(frame)) => {
                if let Err(e) = handle_frame(shared, &frame) {
                    return Exit::Poisoned(e.to_string());
                }
            }
            Ok(Frame::Idle) => (),
            Ok(Frame::Closed) => return Exit::Dropped("connection closed by peer".into()),
            Err(e) => return Exit::Dropped(e.to_string()),
        }
    }
}

/// Dial the connector with capped exponential backoff until it succeeds, the
/// channel is closed, or a shutdown arrives. Frames enqueued while offline
/// have their pending requests failed immediately.
fn redial(
    shared: &Arc<Shared>,
    outgoing_rx: &mpsc::Receiver<Outgoing>,
    connector: &Connector,
) -> Option<Box<dyn Duplex>> {
    let mut delay = RECONNECT_BASE_DELAY;
    loop {
        match outgoing_rx.recv_timeout(delay) {
            Ok(Outgoing::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => return None,
            Ok(Outgoing::Frame(frame)) => {
                fail_offline_frame(shared, &frame);
                continue;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => (),
        }
        if shared.closed.load(Ordering::SeqCst) {
            return None;
        }
        match connector() {
            Ok(mut duplex) => {
                info!(target: LT, "reconnected");
                if let Err(e) = resubscribe(duplex.as_mut(), shared) {
                    warn!(target: LT, "resubscription failed: {}", e);
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                    continue;
                }
                return Some(duplex);
            }
            Err(e) => {
                debug!(target: LT, "reconnect failed: {}, retrying in {:?}", e, delay);
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }
    }
}

/// Re-issue every registered subscription on a fresh connection, routing the
/// initial responses back to the original callbacks.
fn resubscribe(duplex: &mut dyn Duplex, shared: &Arc<Shared>) -> Result<()> {
    let subscriptions = shared.subscriptions.lock().unwrap();
    for (key, subscription) in subscriptions.iter() {
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        shared
            .pending
            .lock()
            .unwrap()
            .insert(id, Sink::Subscription(key.clone()));
        duplex.send(&request_frame(id, &key.0, &subscription.params))?;
    }
    Ok(())
}

fn fail_offline_frame(shared: &Shared, frame: &str) {
    let id = serde_json::from_str::<Value>(frame)
        .ok()
        .and_then(|msg| msg["id"].as_u64());
    if let Some(id) = id {
        if let Some(Sink::Caller(tx)) = shared.pending.lock().unwrap().remove(&id) {
            let _ = tx.send(Err(Error::ConnectionLost("not connected".into())));
        }
    }
}

fn fail_pending(shared: &Shared, make_error: impl Fn() -> Error) {
    for (_, sink) in shared.pending.lock().unwrap().drain() {
        if let Sink::Caller(tx) = sink {
            let _ = tx.send(Err(make_error()));
        }
    }
}

/// Decode one inbound frame and route it. An `Err` here means the peer broke
/// JSON-RPC framing and poisons the whole channel.
fn handle_frame(shared: &Shared, frame: &str) -> Result<()> {
    let msg: Value = serde_json::from_str(frame)
        .map_err(|e| Error::Protocol(format!("invalid JSON frame: {}", e)))?;
    let obj = msg
        .as_object()
        .ok_or_else(|| Error::Protocol(format!("unexpected frame: {}", frame)))?;

    if let Some(id) = obj.get("id").filter(|id| !id.is_null()) {
        let id = id
            .as_u64()
            .ok_or_else(|| Error::Protocol(format!("non-numeric response id: {}", id)))?;
        let outcome = match obj.get("error").filter(|e| !e.is_null()) {
            Some(error) => Err(rpc_error(error)),
            None => Ok(obj.get("result").cloned().unwrap_or(Value::Null)),
        };
        trace!(target: LT, "rpc #{} <- {:?}", id, outcome);

        match shared.pending.lock().unwrap().remove(&id) {
            Some(Sink::Caller(tx)) => {
                let _ = tx.send(outcome);
            }
            Some(Sink::Subscription(key)) => match outcome {
                Ok(value) => notify(shared, &key, value),
                Err(e) => warn!(target: LT, "subscription {} failed: {}", key.0, e),
            },
            // a legal straggler: its request timed out and was abandoned
            None => debug!(target: LT, "response for unknown request id {}", id),
        }
    } else if let Some(method) = obj.get("method").and_then(|m| m.as_str()) {
        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        trace!(target: LT, "notification {} {}", method, params);
        let key = (method.to_string(), param_key(params.get(0)));
        if shared.subscriptions.lock().unwrap().contains_key(&key) {
            notify(shared, &key, params);
        } else {
            notify(shared, &(method.to_string(), String::new()), params);
        }
    } else {
        return Err(Error::Protocol(format!("frame has neither id nor method: {}", frame)));
    }
    Ok(())
}

fn notify(shared: &Shared, key: &SubKey, value: Value) {
    let subscriptions = shared.subscriptions.lock().unwrap();
    match subscriptions.get(key) {
        Some(subscription) => (subscription.callback)(value),
        None => debug!(target: LT, "unhandled notification for {}", key.0),
    }
}

fn rpc_error(error: &Value) -> Error {
    Error::Rpc {
        code: error["code"].as_i64().unwrap_or(-1),
        message: error["message"]
            .as_str()
            .or_else(|| error.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    }
}

pub(crate) fn spawn_thread<F, T>(name: &str, f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(f)
        .unwrap()
}
