//! Blocking request/response bridge for page scripts.
//!
//! A page thread calls [`SyncBridge::call_synchronously`], which posts a
//! [`BridgeRequest`] to the coordinator task started with [`serve_bridge`]
//! and waits, bounded by the configured timeout, for the matching response.

use std::{
    cell::Cell,
    collections::HashMap,
    sync::{
        mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::MethodError;
use crate::event::Event;
use crate::fault;
use crate::machine::Provisioner;

thread_local! {
    static ON_COORDINATOR: Cell<bool> = const { Cell::new(false) };
}

#[derive(Clone, Debug)]
pub struct BridgeRequest {
    pub method: String,
    /// JSON text; anything that does not parse is passed on as a plain string.
    pub args: Option<String>,
    pub correlation_id: Uuid,
}

pub fn success_envelope(result: Value) -> String {
    json!({ "success": true, "result": result }).to_string()
}

pub fn failure_envelope(code: &str, error: &str) -> String {
    json!({ "success": false, "code": code, "error": error }).to_string()
}

pub fn timeout_envelope() -> String {
    failure_envelope("TIMEOUT", "Timeout")
}

fn method_envelope(result: Result<Value, MethodError>) -> String {
    match result {
        Ok(value) => success_envelope(value),
        Err(err) => failure_envelope(err.code(), &err.to_string()),
    }
}

#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<Uuid, SyncSender<String>>>,
}

impl PendingTable {
    fn insert(&self, id: Uuid, tx: SyncSender<String>) {
        self.lock().insert(id, tx);
    }

    fn remove(&self, id: &Uuid) -> Option<SyncSender<String>> {
        self.lock().remove(id)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, SyncSender<String>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Completes pending calls by correlation id. Each id resolves at most once.
#[derive(Clone)]
pub struct BridgeResponder {
    pending: Arc<PendingTable>,
}

impl BridgeResponder {
    /// Returns false when the caller already timed out or the id is unknown.
    pub fn resolve(&self, correlation_id: Uuid, payload: String) -> bool {
        let Some(tx) = self.pending.remove(&correlation_id) else {
            warn!("dropping late bridge response {correlation_id}");
            return false;
        };
        match tx.try_send(payload) {
            Ok(()) => true,
            Err(_) => {
                debug!("bridge caller for {correlation_id} is gone");
                false
            }
        }
    }
}

/// Coordinator side of the bridge: the request queue plus the responder.
pub struct BridgeInbox {
    pub requests: mpsc::UnboundedReceiver<BridgeRequest>,
    pub responder: BridgeResponder,
}

pub struct SyncBridge {
    outbox: mpsc::UnboundedSender<BridgeRequest>,
    pending: Arc<PendingTable>,
    bus: Arc<EventBus>,
    timeout: Duration,
}

impl SyncBridge {
    pub fn new(bus: Arc<EventBus>, timeout: Duration) -> (Self, BridgeInbox) {
        let (outbox, requests) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingTable::default());
        let bridge = Self {
            outbox,
            pending: Arc::clone(&pending),
            bus,
            timeout,
        };
        let inbox = BridgeInbox {
            requests,
            responder: BridgeResponder { pending },
        };
        (bridge, inbox)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Calls outstanding right now.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn call_synchronously(&self, method: &str, args: Option<&str>) -> String {
        self.call_with_timeout(method, args, self.timeout)
    }

    /// Blocks the calling thread until the coordinator answers or `timeout`
    /// elapses. Always returns an envelope.
    pub fn call_with_timeout(
        &self,
        method: &str,
        args: Option<&str>,
        timeout: Duration,
    ) -> String {
        if ON_COORDINATOR.with(Cell::get) {
            warn!("refusing re-entrant bridge call to {method}");
            self.bus
                .publish(Event::debug("bridge_reentrant_call").with("method", method));
            return failure_envelope("REENTRANT", "bridge called from its own coordinator");
        }

        let correlation_id = Uuid::new_v4();
        let (tx, rx) = sync_channel(1);
        self.pending.insert(correlation_id, tx);
        self.bus.publish(
            Event::debug("bridge_call")
                .with("method", method)
                .with("correlationId", correlation_id.to_string()),
        );

        let request = BridgeRequest {
            method: method.to_string(),
            args: args.map(str::to_string),
            correlation_id,
        };
        if self.outbox.send(request).is_err() {
            self.pending.remove(&correlation_id);
            return failure_envelope("BRIDGE_CLOSED", "bridge coordinator is not running");
        }

        match rx.recv_timeout(timeout) {
            Ok(payload) => payload,
            Err(RecvTimeoutError::Timeout) => {
                self.settle_timeout(correlation_id, &rx, method, timeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                failure_envelope("BRIDGE_CLOSED", "bridge coordinator stopped")
            }
        }
    }

    /// A responder that claimed the entry before us has already sent its
    /// payload, so that answer wins over the timeout.
    fn settle_timeout(
        &self,
        correlation_id: Uuid,
        rx: &Receiver<String>,
        method: &str,
        timeout: Duration,
    ) -> String {
        if self.pending.remove(&correlation_id).is_none() {
            if let Ok(payload) = rx.try_recv() {
                debug!("bridge call {method} answered at the deadline");
                return payload;
            }
        }
        warn!("bridge call {method} timed out after {timeout:?}");
        self.bus.publish(
            Event::debug("bridge_timeout")
                .with("method", method)
                .with("correlationId", correlation_id.to_string())
                .with("timeoutMs", timeout.as_millis() as u64),
        );
        timeout_envelope()
    }
}

struct CoordinatorScope;

impl CoordinatorScope {
    fn enter() -> Self {
        ON_COORDINATOR.with(|flag| flag.set(true));
        CoordinatorScope
    }
}

impl Drop for CoordinatorScope {
    fn drop(&mut self) {
        ON_COORDINATOR.with(|flag| flag.set(false));
    }
}

/// Runs one request against the provisioner and renders the envelope.
pub fn dispatch_request(provisioner: &Provisioner, request: &BridgeRequest) -> String {
    let _scope = CoordinatorScope::enter();
    let args = match request.args.as_deref() {
        None => Value::Null,
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    };
    match fault::contain(|| provisioner.handle_method_call(&request.method, &args)) {
        Ok(result) => method_envelope(result),
        Err(fault) => failure_envelope("EXCEPTION", &fault.message),
    }
}

/// Coordinator loop. Ends when every [`SyncBridge`] is dropped.
pub async fn serve_bridge(mut inbox: BridgeInbox, provisioner: Arc<Provisioner>) {
    while let Some(request) = inbox.requests.recv().await {
        debug!("bridge dispatch {} ({})", request.method, request.correlation_id);
        let payload = dispatch_request(&provisioner, &request);
        inbox.responder.resolve(request.correlation_id, payload);
    }
    debug!("bridge coordinator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EsimConfig;
    use crate::platform::SimulatedPlatform;
    use crate::store::ActivationCodeStore;
    use std::time::Instant;

    fn provisioner(bus: &Arc<EventBus>) -> Arc<Provisioner> {
        Arc::new(Provisioner::new(
            Arc::new(SimulatedPlatform::android(34)),
            Arc::clone(bus),
            Arc::new(ActivationCodeStore::default()),
            EsimConfig::default(),
        ))
    }

    fn parse(envelope: &str) -> Value {
        serde_json::from_str(envelope).unwrap()
    }

    async fn call(
        bridge: &Arc<SyncBridge>,
        method: &'static str,
        args: Option<&'static str>,
    ) -> Value {
        let bridge = Arc::clone(bridge);
        let envelope = tokio::task::spawn_blocking(move || bridge.call_synchronously(method, args))
            .await
            .unwrap();
        parse(&envelope)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn calls_resolve_through_the_coordinator() {
        let bus = EventBus::new();
        let (bridge, inbox) = SyncBridge::new(bus.clone(), Duration::from_secs(5));
        let bridge = Arc::new(bridge);
        let provisioner = provisioner(&bus);
        tokio::spawn(serve_bridge(inbox, provisioner.clone()));

        assert_eq!(
            call(&bridge, "isSupportESim", None).await,
            json!({ "success": true, "result": true })
        );
        assert_eq!(
            call(&bridge, "installEsimProfile", Some(r#""LPA:1$smdp.example$X""#)).await,
            json!({ "success": true, "result": true })
        );
        assert_eq!(provisioner.store().get().unwrap().as_str(), "LPA:1$smdp.example$X");
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn method_errors_become_failure_envelopes() {
        let bus = EventBus::new();
        let (bridge, inbox) = SyncBridge::new(bus.clone(), Duration::from_secs(5));
        let bridge = Arc::new(bridge);
        tokio::spawn(serve_bridge(inbox, provisioner(&bus)));

        assert_eq!(
            call(&bridge, "installEsimProfile", Some("   ")).await,
            json!({ "success": false, "code": "EMPTY_CODE", "error": "Activation code is empty" })
        );
        let unknown = call(&bridge, "reboot", None).await;
        assert_eq!(unknown["success"], json!(false));
        assert_eq!(unknown["code"], json!("NOT_IMPLEMENTED"));
    }

    #[test]
    fn unanswered_call_times_out_at_the_bound() {
        let (bridge, mut inbox) = SyncBridge::new(EventBus::new(), Duration::from_millis(80));

        let started = Instant::now();
        let envelope = bridge.call_synchronously("isSupportESim", None);

        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(parse(&envelope), parse(&timeout_envelope()));
        assert_eq!(bridge.pending(), 0);

        let request = inbox.requests.try_recv().unwrap();
        assert!(!inbox
            .responder
            .resolve(request.correlation_id, success_envelope(json!(true))));
    }

    #[test]
    fn response_claimed_at_the_deadline_is_not_lost() {
        let (bridge, inbox) = SyncBridge::new(EventBus::new(), Duration::from_millis(10));
        let id = Uuid::new_v4();
        let (tx, rx) = sync_channel(1);
        bridge.pending.insert(id, tx);

        assert!(inbox.responder.resolve(id, success_envelope(json!(true))));
        let envelope = bridge.settle_timeout(id, &rx, "isSupportESim", bridge.timeout());

        assert_eq!(parse(&envelope), json!({ "success": true, "result": true }));
        assert_eq!(bridge.pending(), 0);
    }

    #[test]
    fn unclaimed_entry_settles_as_timeout() {
        let (bridge, _inbox) = SyncBridge::new(EventBus::new(), Duration::from_millis(10));
        let id = Uuid::new_v4();
        let (tx, rx) = sync_channel(1);
        bridge.pending.insert(id, tx);

        let envelope = bridge.settle_timeout(id, &rx, "isSupportESim", bridge.timeout());

        assert_eq!(parse(&envelope), parse(&timeout_envelope()));
        assert_eq!(bridge.pending(), 0);
    }

    #[test]
    fn closed_coordinator_fails_fast() {
        let (bridge, inbox) = SyncBridge::new(EventBus::new(), Duration::from_secs(30));
        drop(inbox);

        let started = Instant::now();
        let envelope = parse(&bridge.call_synchronously("isSupportESim", None));

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(envelope["code"], json!("BRIDGE_CLOSED"));
        assert_eq!(bridge.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reentrant_calls_are_refused() {
        let bus = EventBus::new();
        let (bridge, inbox) = SyncBridge::new(bus.clone(), Duration::from_secs(5));
        let bridge = Arc::new(bridge);
        tokio::spawn(serve_bridge(inbox, provisioner(&bus)));

        let nested = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&nested);
        let inner = Arc::clone(&bridge);
        let _sub = bus.subscribe(move |event| {
            if event.stage_name() == Some("isSupportESim_called") {
                *sink.lock().unwrap() = Some(inner.call_synchronously("instructions", None));
            }
        });

        let outer = call(&bridge, "isSupportESim", None).await;

        assert_eq!(outer["success"], json!(true));
        let nested = nested.lock().unwrap().clone().unwrap();
        assert_eq!(parse(&nested)["code"], json!("REENTRANT"));
    }

    #[test]
    fn raw_args_fall_back_to_plain_strings() {
        let bus = EventBus::new();
        let provisioner = provisioner(&bus);
        let request = BridgeRequest {
            method: "installEsimProfile".into(),
            args: Some("LPA:1$raw.example$CODE".into()),
            correlation_id: Uuid::new_v4(),
        };

        assert_eq!(
            parse(&dispatch_request(&provisioner, &request)),
            json!({ "success": true, "result": true })
        );
        assert_eq!(
            provisioner.store().get().unwrap().as_str(),
            "LPA:1$raw.example$CODE"
        );
    }
}
