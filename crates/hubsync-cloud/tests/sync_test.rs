//! Event synchronizer tests.
//!
//! Drives the synchronizer over scripted stream connections and an in-memory
//! snapshot source: login and subscribe order, debounced full-sync refetch,
//! replay of deltas received during a fetch, sequence gaps and reconnects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;

use hubsync_cloud::{
    BackoffPolicy, Envelope, EventSynchronizer, Frame, SnapshotSource, StreamAuthenticator,
    StreamConnection, StreamConnector, SyncConfig, SyncHandle,
};
use hubsync_core::{Diagnostics, Error, Result};
use hubsync_devices::{
    DeviceEvent, DeviceEventBus, DeviceModelBuilder, DeviceStore, MappingRegistry, RawSnapshot,
    ResyncReason,
};

type Sent = Arc<Mutex<Vec<String>>>;

struct ScriptedConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    sent: Sent,
}

#[async_trait]
impl StreamConnection for ScriptedConnection {
    async fn send(&mut self, text: String) -> Result<()> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.inbound.recv().await.map(|text| Ok(Frame::Text(text)))
    }

    async fn close(&mut self) {}
}

/// Hands out prepared connections in order, then refuses.
#[derive(Default)]
struct ScriptedConnector {
    connections: Mutex<VecDeque<ScriptedConnection>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    /// Queue a connection; the returned sender feeds its inbound frames.
    fn prepare(&self, sent: &Sent) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().push_back(ScriptedConnection {
            inbound: rx,
            sent: Arc::clone(sent),
        });
        tx
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn StreamConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.connections.lock().pop_front() {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(Error::transport("connection refused")),
        }
    }
}

struct MemorySource {
    snapshot: Mutex<RawSnapshot>,
    fetches: AtomicUsize,
    latency: Duration,
}

impl MemorySource {
    fn new(snapshot: RawSnapshot, latency: Duration) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            fetches: AtomicUsize::new(0),
            latency,
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for MemorySource {
    async fn fetch_snapshot(&self) -> Result<RawSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        sleep(self.latency).await;
        Ok(self.snapshot.lock().clone())
    }
}

struct TokenAuth;

impl StreamAuthenticator for TokenAuth {
    fn login_frame(&self) -> Result<Envelope> {
        Ok(Envelope::new("auth", json!({ "token": "test" })))
    }
}

fn snapshot(l1_type: i64, l1_val: i64) -> RawSnapshot {
    serde_json::from_value(json!({
        "hubs": [{ "agt": "A1", "name": "Home" }],
        "devices": [{ "agt": "A1", "me": "d1", "devtype": "SL_SW_IF3", "name": "Hall",
                      "data": { "L1": { "type": l1_type, "val": l1_val } } }]
    }))
    .unwrap()
}

fn frame(seq: Option<u64>, category: &str, body: Value) -> String {
    let mut value = json!({ "category": category, "body": body });
    if let Some(seq) = seq {
        value["seq"] = json!(seq);
    }
    value.to_string()
}

fn auth_ok() -> String {
    frame(None, "auth.ok", Value::Null)
}

fn io_frame(seq: Option<u64>, device: &str, raw_type: i64, val: i64) -> String {
    frame(
        seq,
        "io",
        json!({ "agt": "A1", "me": device, "idx": "L1", "type": raw_type, "val": val }),
    )
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        url: "wss://stream.test/wsapp/".into(),
        resync_debounce: Duration::from_secs(2),
        ping_interval: Duration::from_secs(30),
        auth_timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
        },
        fetch_retry: Duration::from_secs(1),
    }
}

struct Harness {
    connector: Arc<ScriptedConnector>,
    source: Arc<MemorySource>,
    store: Arc<DeviceStore>,
    events: DeviceEventBus,
    diagnostics: Arc<Diagnostics>,
    sent: Sent,
}

impl Harness {
    fn new(latency: Duration) -> Self {
        Self {
            connector: Arc::new(ScriptedConnector::default()),
            source: Arc::new(MemorySource::new(snapshot(128, 0), latency)),
            store: Arc::new(DeviceStore::new(DeviceModelBuilder::with_registry(
                MappingRegistry::builtin(),
            ))),
            events: DeviceEventBus::new(),
            diagnostics: Diagnostics::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn spawn(&self) -> SyncHandle {
        EventSynchronizer::new(
            sync_config(),
            Arc::clone(&self.connector) as Arc<dyn StreamConnector>,
            Arc::new(TokenAuth),
            Arc::clone(&self.source) as Arc<dyn SnapshotSource>,
            Arc::clone(&self.store),
        )
        .events(self.events.clone())
        .diagnostics(Arc::clone(&self.diagnostics))
        .spawn()
    }

    fn l1_on(&self) -> bool {
        self.store.io("A1", "d1", "L1").unwrap().is_on()
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_logs_in_subscribes_and_resyncs() {
    let h = Harness::new(Duration::ZERO);
    let mut rx = h.events.subscribe();
    let tx = h.connector.prepare(&h.sent);
    tx.send(auth_ok()).unwrap();

    let handle = h.spawn();
    sleep(Duration::from_millis(100)).await;

    assert!(handle.is_connected());
    assert_eq!(h.source.fetches(), 1);
    assert_eq!(h.store.device_count(), 1);
    assert_eq!(h.diagnostics.snapshot().hubs_total, 1);

    let sent = h.sent.lock().clone();
    assert!(sent[0].contains("\"auth\""));
    assert!(sent[1].contains("\"subscribe\""));

    let events: Vec<DeviceEvent> = rx.drain().into_iter().map(|(e, _)| e).collect();
    assert_eq!(events[0], DeviceEvent::ConnectionChanged { connected: true });
    assert!(events.contains(&DeviceEvent::Resynced {
        reason: ResyncReason::Connected,
        hubs: 1,
        devices: 1
    }));

    handle.shutdown().await.unwrap();
    let events: Vec<DeviceEvent> = rx.drain().into_iter().map(|(e, _)| e).collect();
    assert!(events.contains(&DeviceEvent::ConnectionChanged { connected: false }));
}

#[tokio::test(start_paused = true)]
async fn test_full_sync_burst_refetches_once_and_drops_stale_deltas() {
    let h = Harness::new(Duration::ZERO);
    let tx = h.connector.prepare(&h.sent);
    tx.send(auth_ok()).unwrap();
    let _handle = h.spawn();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.source.fetches(), 1);
    assert!(!h.l1_on());

    // Server state moved on; a delta older than the refetch arrives in the burst.
    *h.source.snapshot.lock() = snapshot(129, 1);
    tx.send(frame(Some(1), "fullsync", Value::Null)).unwrap();
    tx.send(io_frame(Some(2), "d1", 128, 0)).unwrap();
    tx.send(frame(Some(3), "fullsync", Value::Null)).unwrap();
    tx.send(frame(Some(4), "fullsync", Value::Null)).unwrap();

    sleep(Duration::from_millis(500)).await;
    assert_eq!(h.source.fetches(), 1);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.source.fetches(), 2);
    assert!(h.l1_on());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.source.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_delta_during_fetch_is_replayed_after_snapshot() {
    let h = Harness::new(Duration::from_secs(1));
    let mut rx = h.events.subscribe();
    let tx = h.connector.prepare(&h.sent);
    tx.send(auth_ok()).unwrap();
    let _handle = h.spawn();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.source.fetches(), 1);
    tx.send(io_frame(Some(1), "d1", 129, 1)).unwrap();

    sleep(Duration::from_secs(2)).await;
    assert!(h.l1_on());

    let events: Vec<DeviceEvent> = rx.drain().into_iter().map(|(e, _)| e).collect();
    let resynced = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::Resynced { .. }))
        .unwrap();
    let changed = events
        .iter()
        .position(|e| matches!(e, DeviceEvent::IoChanged { optimistic: false, .. }))
        .unwrap();
    assert!(resynced < changed);
}

#[tokio::test(start_paused = true)]
async fn test_sequence_gap_schedules_resync() {
    let h = Harness::new(Duration::ZERO);
    let tx = h.connector.prepare(&h.sent);
    tx.send(auth_ok()).unwrap();
    let _handle = h.spawn();
    sleep(Duration::from_millis(100)).await;

    tx.send(io_frame(Some(1), "d1", 129, 1)).unwrap();
    tx.send(io_frame(Some(2), "d1", 128, 0)).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.source.fetches(), 1);

    tx.send(io_frame(Some(5), "d1", 129, 1)).unwrap();
    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.source.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_device_schedules_resync() {
    let h = Harness::new(Duration::ZERO);
    let tx = h.connector.prepare(&h.sent);
    tx.send(auth_ok()).unwrap();
    let _handle = h.spawn();
    sleep(Duration::from_millis(100)).await;

    tx.send(io_frame(None, "zz", 129, 1)).unwrap();
    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.source.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_audit_event_is_published_with_own_schema() {
    let h = Harness::new(Duration::ZERO);
    let mut rx = h.events.subscribe_filtered(|e| matches!(e, DeviceEvent::Audit(_)));
    let tx = h.connector.prepare(&h.sent);
    tx.send(auth_ok()).unwrap();
    let _handle = h.spawn();
    sleep(Duration::from_millis(100)).await;

    tx.send(frame(
        Some(1),
        "audit",
        json!({ "agt": "A1", "cat": "security", "cls": "intrusion", "level": 3, "obj": "door", "zone": "hall" }),
    ))
    .unwrap();
    sleep(Duration::from_millis(100)).await;

    let (event, _) = rx.try_recv().unwrap();
    match event {
        DeviceEvent::Audit(record) => {
            assert_eq!(record.zone, "hall");
            assert_eq!(record.class, "intrusion");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resets_and_resyncs() {
    let h = Harness::new(Duration::ZERO);
    let mut rx = h.events.subscribe_filtered(|e| matches!(e, DeviceEvent::ConnectionChanged { .. }));
    let first = h.connector.prepare(&h.sent);
    let second = h.connector.prepare(&h.sent);
    first.send(auth_ok()).unwrap();
    second.send(auth_ok()).unwrap();

    let handle = h.spawn();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.source.fetches(), 1);

    drop(first);
    sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_connected());

    sleep(Duration::from_secs(2)).await;
    assert!(handle.is_connected());
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.source.fetches(), 2);

    let states: Vec<bool> = std::iter::from_fn(|| rx.try_recv())
        .filter_map(|(e, _)| match e {
            DeviceEvent::ConnectionChanged { connected } => Some(connected),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![true, false, true]);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_when_connections_drop_before_snapshot() {
    // Snapshots take longer than each connection survives.
    let h = Harness::new(Duration::from_secs(30));
    for _ in 0..4 {
        // Login succeeds, then the peer closes.
        h.connector.prepare(&h.sent).send(auth_ok()).unwrap();
    }

    let handle = h.spawn();
    let connects = || h.connector.connects.load(Ordering::SeqCst);

    // Delays of 1s, 2s, 4s: connects at 0s, 1s, 3s, 7s.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(connects(), 1);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(connects(), 2);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(connects(), 3);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(connects(), 3);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(connects(), 4);
    assert_eq!(h.store.device_count(), 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_refused_login_is_retried() {
    let h = Harness::new(Duration::ZERO);
    let refused = h.connector.prepare(&h.sent);
    let accepted = h.connector.prepare(&h.sent);
    refused
        .send(frame(None, "auth.fail", json!({ "code": 10004, "message": "bad sign" })))
        .unwrap();
    accepted.send(auth_ok()).unwrap();

    let handle = h.spawn();
    sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_connected());
    assert_eq!(h.source.fetches(), 0);

    sleep(Duration::from_secs(2)).await;
    assert!(handle.is_connected());
    assert_eq!(h.source.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_resync_request() {
    let h = Harness::new(Duration::ZERO);
    let tx = h.connector.prepare(&h.sent);
    tx.send(auth_ok()).unwrap();
    let handle = h.spawn();
    sleep(Duration::from_millis(100)).await;

    assert!(handle.request_resync());
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.source.fetches(), 2);
}
