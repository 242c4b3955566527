//! Event synchronizer.
//!
//! Owns the account's push-stream connection. On every connection it logs
//! in, subscribes at once, resets the cursor and schedules an immediate full
//! resync. Stream events are applied to the [`DeviceStore`] and republished
//! as [`DeviceEvent`]s. Lost connections are reopened with capped,
//! jittered exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use hubsync_core::config::AccountConfig;
use hubsync_core::{BridgeConfig, Diagnostics, Error, Result};
use hubsync_devices::{DeviceEvent, DeviceEventBus, DeviceStore, RawSnapshot, ResyncReason};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::connector::{Frame, StreamConnection, StreamConnector};
use crate::envelope::{categories, ping_frame, subscribe_frame, Envelope, StreamEvent};
use crate::reconcile::Reconciler;
use crate::signing::RequestSigner;

/// Source of full snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<RawSnapshot>;
}

/// Builds the login frame for a new connection.
pub trait StreamAuthenticator: Send + Sync {
    fn login_frame(&self) -> Result<Envelope>;
}

/// Login signed with the account's request signer.
pub struct SignedStreamAuth {
    account: AccountConfig,
    signer: RequestSigner,
}

impl SignedStreamAuth {
    pub const METHOD: &'static str = "WebSocketAuth";

    pub fn new(account: AccountConfig, signer: RequestSigner) -> Self {
        Self { account, signer }
    }
}

impl StreamAuthenticator for SignedStreamAuth {
    fn login_frame(&self) -> Result<Envelope> {
        let stamp = self.signer.stamp(Self::METHOD, &json!({}))?;
        Ok(Envelope::new(
            categories::AUTH,
            json!({
                "userid": self.account.user_id,
                "appkey": self.account.app_key,
                "time": stamp.time,
                "sign": stamp.sign,
            }),
        ))
    }
}

/// Synchronizer settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub url: String,
    pub resync_debounce: Duration,
    pub ping_interval: Duration,
    pub auth_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Wait before a failed snapshot fetch is retried.
    pub fetch_retry: Duration,
}

impl SyncConfig {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            url: config.stream_url(),
            resync_debounce: Duration::from_millis(config.stream.resync_debounce_ms),
            ping_interval: Duration::from_secs(config.stream.ping_interval_secs.max(1)),
            auth_timeout: Duration::from_secs(config.stream.auth_timeout_secs),
            backoff: BackoffPolicy::from(&config.stream),
            fetch_retry: Duration::from_millis(config.stream.backoff_initial_ms),
        }
    }
}

/// Builder-style constructor for [`EventSynchronizer`].
pub struct EventSynchronizer {
    config: SyncConfig,
    connector: Arc<dyn StreamConnector>,
    auth: Arc<dyn StreamAuthenticator>,
    source: Arc<dyn SnapshotSource>,
    store: Arc<DeviceStore>,
    events: DeviceEventBus,
    diagnostics: Arc<Diagnostics>,
}

impl EventSynchronizer {
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn StreamConnector>,
        auth: Arc<dyn StreamAuthenticator>,
        source: Arc<dyn SnapshotSource>,
        store: Arc<DeviceStore>,
    ) -> Self {
        Self {
            config,
            connector,
            auth,
            source,
            store,
            events: DeviceEventBus::with_name("devices"),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn events(mut self, events: DeviceEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn event_bus(&self) -> &DeviceEventBus {
        &self.events
    }

    /// Start the connection loop on the current runtime.
    pub fn spawn(self) -> SyncHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);

        let runner = Runner {
            reconciler: Reconciler::new(self.config.resync_debounce),
            config: self.config,
            connector: self.connector,
            auth: self.auth,
            source: self.source,
            store: self.store,
            events: self.events,
            diagnostics: self.diagnostics,
            connected: connected_tx,
            fetch: None,
        };
        let task = tokio::spawn(runner.run(shutdown_rx, resync_rx));

        SyncHandle {
            shutdown: shutdown_tx,
            resync: resync_tx,
            connected: connected_rx,
            task,
        }
    }
}

/// Control handle for a running synchronizer. Dropping it stops the loop.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    resync: mpsc::UnboundedSender<()>,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Schedule a full resync now.
    pub fn request_resync(&self) -> bool {
        self.resync.send(()).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch the connection state.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.send_replace(true);
        self.task.await.map_err(Error::from)
    }
}

enum Exit {
    Shutdown,
    Lost(String),
}

enum Step {
    Frame(Option<Result<Frame>>),
    ResyncDue,
    Fetched(std::result::Result<Result<RawSnapshot>, JoinError>),
    Ping,
    Shutdown,
    ResyncRequested,
}

struct Runner {
    config: SyncConfig,
    connector: Arc<dyn StreamConnector>,
    auth: Arc<dyn StreamAuthenticator>,
    source: Arc<dyn SnapshotSource>,
    store: Arc<DeviceStore>,
    events: DeviceEventBus,
    diagnostics: Arc<Diagnostics>,
    reconciler: Reconciler,
    connected: watch::Sender<bool>,
    fetch: Option<JoinHandle<Result<RawSnapshot>>>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_fetch(
    fetch: &mut Option<JoinHandle<Result<RawSnapshot>>>,
) -> std::result::Result<Result<RawSnapshot>, JoinError> {
    match fetch {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Read frames until the server accepts or refuses the login.
async fn wait_for_auth(conn: &mut dyn StreamConnection) -> Result<()> {
    loop {
        let text = match conn.recv().await {
            None => return Err(Error::transport("closed during authentication")),
            Some(Err(e)) => return Err(e),
            Some(Ok(Frame::Heartbeat)) => continue,
            Some(Ok(Frame::Text(text))) => text,
        };
        match Envelope::parse(&text).and_then(Envelope::decode) {
            Ok(StreamEvent::AuthOk) => return Ok(()),
            Ok(StreamEvent::AuthFailed { code, message }) => {
                return Err(Error::auth(format!("login refused ({}): {}", code, message)))
            }
            Ok(other) => debug!(category = "sync", ?other, "Frame before login ignored"),
            Err(e) => debug!(category = "sync", error = %e, "Unreadable frame before login"),
        }
    }
}

impl Runner {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>, mut resync_rx: mpsc::UnboundedReceiver<()>) {
        info!(category = "sync", url = %self.config.url, "Synchronizer started");
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            if *shutdown.borrow() {
                break;
            }
            let connector = Arc::clone(&self.connector);
            let connected = tokio::select! {
                result = connector.connect(&self.config.url) => result,
                _ = shutdown.changed() => break,
            };
            let exit = match connected {
                Ok(conn) => {
                    self.run_connection(conn, &mut backoff, &mut shutdown, &mut resync_rx)
                        .await
                }
                Err(e) => Exit::Lost(e.to_string()),
            };
            self.on_disconnected();

            match exit {
                Exit::Shutdown => break,
                Exit::Lost(reason) => {
                    let delay = backoff.next_delay();
                    warn!(
                        category = "sync",
                        reason = %reason,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Stream connection lost, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        self.on_disconnected();
        info!(category = "sync", "Synchronizer stopped");
    }

    async fn run_connection(
        &mut self,
        mut conn: Box<dyn StreamConnection>,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
        resync_rx: &mut mpsc::UnboundedReceiver<()>,
    ) -> Exit {
        if let Err(e) = self.login(conn.as_mut()).await {
            conn.close().await;
            if matches!(e, Error::Auth(_)) {
                error!(category = "sync", error = %e, "Stream login refused");
            }
            return Exit::Lost(e.to_string());
        }
        let subscribe = match subscribe_frame().to_text() {
            Ok(text) => text,
            Err(e) => return Exit::Lost(e.to_string()),
        };
        if let Err(e) = conn.send(subscribe).await {
            return Exit::Lost(e.to_string());
        }

        self.reconciler.on_connected(Instant::now());
        self.connected.send_replace(true);
        self.publish(DeviceEvent::ConnectionChanged { connected: true });
        info!(
            category = "sync",
            connections = self.reconciler.cursor().connections(),
            "Stream authenticated and subscribed"
        );

        let ping_interval = self.config.ping_interval;
        let mut last_inbound = Instant::now();
        let mut next_ping = last_inbound + ping_interval;

        loop {
            let deadline = self.reconciler.next_deadline();
            let step = tokio::select! {
                frame = conn.recv() => Step::Frame(frame),
                _ = sleep_until_opt(deadline) => Step::ResyncDue,
                result = join_fetch(&mut self.fetch) => Step::Fetched(result),
                _ = tokio::time::sleep_until(next_ping) => Step::Ping,
                _ = shutdown.changed() => Step::Shutdown,
                Some(()) = resync_rx.recv() => Step::ResyncRequested,
            };

            match step {
                Step::Frame(None) => return Exit::Lost("closed by peer".to_string()),
                Step::Frame(Some(Err(e))) => return Exit::Lost(e.to_string()),
                Step::Frame(Some(Ok(Frame::Heartbeat))) => last_inbound = Instant::now(),
                Step::Frame(Some(Ok(Frame::Text(text)))) => {
                    last_inbound = Instant::now();
                    if let Some(exit) = self.handle_text(&text) {
                        conn.close().await;
                        return exit;
                    }
                }
                Step::ResyncDue => {
                    if let Some(reason) = self.reconciler.poll_due(Instant::now()) {
                        self.start_fetch(reason);
                    }
                }
                Step::Fetched(result) => {
                    self.fetch = None;
                    // Only a connection that delivered a snapshot counts as healthy.
                    if self.finish_fetch(result) && backoff.attempt() > 0 {
                        debug!(category = "sync", "Connection healthy, backoff reset");
                        backoff.reset();
                    }
                }
                Step::Ping => {
                    let now = Instant::now();
                    if now.duration_since(last_inbound) >= ping_interval * 3 {
                        conn.close().await;
                        return Exit::Lost("no inbound frame for three ping intervals".to_string());
                    }
                    let ping = match ping_frame().to_text() {
                        Ok(text) => text,
                        Err(e) => return Exit::Lost(e.to_string()),
                    };
                    if let Err(e) = conn.send(ping).await {
                        return Exit::Lost(e.to_string());
                    }
                    next_ping = now + ping_interval;
                }
                Step::Shutdown => {
                    conn.close().await;
                    return Exit::Shutdown;
                }
                Step::ResyncRequested => {
                    info!(category = "sync", "Resync requested");
                    self.reconciler.request(ResyncReason::Requested, Instant::now());
                }
            }
        }
    }

    async fn login(&self, conn: &mut dyn StreamConnection) -> Result<()> {
        let frame = self.auth.login_frame()?.to_text()?;
        conn.send(frame).await?;
        tokio::time::timeout(self.config.auth_timeout, wait_for_auth(conn))
            .await
            .map_err(|_| Error::timeout("stream login"))?
    }

    /// Handle one text frame. Returns an exit when the connection must end.
    fn handle_text(&mut self, text: &str) -> Option<Exit> {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(category = "sync", error = %e, "Unparseable stream frame");
                return None;
            }
        };

        if let Some(seq) = envelope.seq {
            let check = self.reconciler.observe_seq(seq);
            if check.is_discontinuity() {
                warn!(category = "sync", ?check, "Stream sequence discontinuity");
                self.reconciler.request(ResyncReason::SequenceGap, Instant::now());
            }
        }

        let frame_category = envelope.category.clone();
        let event = match envelope.decode() {
            Ok(event) => event,
            Err(e) => {
                warn!(category = "sync", frame = %frame_category, error = %e, "Dropping malformed frame");
                return None;
            }
        };

        match event {
            StreamEvent::FullSync => {
                info!(category = "sync", "Full sync signalled");
                self.reconciler.request(ResyncReason::FullSync, Instant::now());
            }
            StreamEvent::AuthFailed { code, message } => {
                return Some(Exit::Lost(format!("session revoked ({}): {}", code, message)));
            }
            StreamEvent::AuthOk | StreamEvent::Subscribed | StreamEvent::Pong => {}
            StreamEvent::Unknown { category } => {
                debug!(category = "sync", frame = %category, "Ignoring unknown frame");
            }
            other => {
                if let Some(event) = self.reconciler.admit(other) {
                    self.apply(event);
                }
            }
        }
        None
    }

    fn start_fetch(&mut self, reason: ResyncReason) {
        info!(category = "sync", ?reason, "Fetching full snapshot");
        let source = Arc::clone(&self.source);
        let diagnostics = Arc::clone(&self.diagnostics);
        self.fetch = Some(tokio::spawn(async move {
            let _op = diagnostics.begin_operation();
            source.fetch_snapshot().await
        }));
    }

    /// Apply a finished fetch. Returns whether a snapshot was applied.
    fn finish_fetch(&mut self, result: std::result::Result<Result<RawSnapshot>, JoinError>) -> bool {
        let reason = self.reconciler.in_flight().unwrap_or(ResyncReason::Requested);
        let snapshot = match result.map_err(Error::from).and_then(|r| r) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(category = "sync", ?reason, error = %e, "Snapshot fetch failed");
                let replay = self
                    .reconciler
                    .fetch_failed(Instant::now(), self.config.fetch_retry);
                for event in replay {
                    self.apply(event);
                }
                return false;
            }
        };

        let (hubs, devices) = self.store.replace_all(&snapshot);
        let replay = self.reconciler.fetch_succeeded();
        self.refresh_hub_counts();
        info!(
            category = "sync",
            ?reason,
            hubs,
            devices,
            replayed = replay.len(),
            discarded = self.reconciler.discarded(),
            "Snapshot applied"
        );
        self.publish(DeviceEvent::Resynced {
            reason,
            hubs,
            devices,
        });
        for event in replay {
            self.apply(event);
        }
        true
    }

    /// Apply one admitted event to the store and publish the change.
    fn apply(&mut self, event: StreamEvent) {
        let store = Arc::clone(&self.store);
        let unknown = match event {
            StreamEvent::Io(delta) => match store.apply_delta(&delta) {
                Some(outcome) => {
                    self.publish(DeviceEvent::IoChanged {
                        hub_id: delta.hub_id,
                        device_id: delta.device_id,
                        io: outcome.io,
                        role: outcome.role_changed,
                        optimistic: false,
                    });
                    false
                }
                None => true,
            },
            StreamEvent::DeviceOnline {
                hub_id,
                device_id,
                online,
            } => {
                if store.device(&hub_id, &device_id).is_none() {
                    true
                } else {
                    if store.set_device_online(&hub_id, &device_id, online) {
                        self.publish(DeviceEvent::DeviceOnline {
                            hub_id,
                            device_id,
                            online,
                        });
                    }
                    false
                }
            }
            StreamEvent::DeviceAdded(raw) => match store.upsert_device(&raw) {
                Some(device) => {
                    self.publish(DeviceEvent::DeviceAdded {
                        hub_id: device.hub_id.clone(),
                        device_id: device.id.clone(),
                        device_type: device.device_type.clone(),
                    });
                    false
                }
                None => true,
            },
            StreamEvent::DeviceRemoved { hub_id, device_id } => {
                if store.remove_device(&hub_id, &device_id).is_some() {
                    self.publish(DeviceEvent::DeviceRemoved { hub_id, device_id });
                }
                false
            }
            StreamEvent::HubAdded(raw) => {
                store.upsert_hub(&raw);
                self.refresh_hub_counts();
                self.publish(DeviceEvent::HubAdded { hub_id: raw.agt });
                false
            }
            StreamEvent::HubRemoved { hub_id } => {
                if let Some(snapshot) = store.remove_hub(&hub_id) {
                    self.refresh_hub_counts();
                    self.publish(DeviceEvent::HubRemoved {
                        hub_id,
                        devices_removed: snapshot.devices.len(),
                    });
                }
                false
            }
            StreamEvent::HubOnline { hub_id, online } => {
                if store.hub(&hub_id).is_none() {
                    true
                } else {
                    if store.set_hub_online(&hub_id, online) {
                        self.refresh_hub_counts();
                        self.publish(DeviceEvent::HubOnline { hub_id, online });
                    }
                    false
                }
            }
            StreamEvent::HubRebooted { hub_id } => {
                self.publish(DeviceEvent::HubRebooted { hub_id });
                false
            }
            StreamEvent::NameChanged {
                hub_id,
                device_id,
                name,
            } => {
                if store.device(&hub_id, &device_id).is_none() {
                    true
                } else {
                    if store.rename_device(&hub_id, &device_id, &name) {
                        self.publish(DeviceEvent::NameChanged {
                            hub_id,
                            device_id,
                            name,
                        });
                    }
                    false
                }
            }
            StreamEvent::IoNameChanged {
                hub_id,
                device_id,
                io_key,
                name,
            } => {
                if store.device(&hub_id, &device_id).is_none() {
                    true
                } else {
                    if store.rename_io(&hub_id, &device_id, &io_key, &name) {
                        self.publish(DeviceEvent::IoNameChanged {
                            hub_id,
                            device_id,
                            io_key,
                            name,
                        });
                    }
                    false
                }
            }
            StreamEvent::Scene {
                hub_id,
                scene_id,
                name,
                active,
            } => {
                self.publish(DeviceEvent::SceneChanged {
                    hub_id,
                    scene_id,
                    name,
                    active,
                });
                false
            }
            StreamEvent::Audit(record) => {
                self.publish(DeviceEvent::Audit(record));
                false
            }
            StreamEvent::FullSync
            | StreamEvent::AuthOk
            | StreamEvent::AuthFailed { .. }
            | StreamEvent::Subscribed
            | StreamEvent::Pong
            | StreamEvent::Unknown { .. } => false,
        };

        if unknown {
            debug!(category = "sync", "Event for unknown device, scheduling resync");
            self.reconciler
                .request(ResyncReason::UnknownDevice, Instant::now());
        }
    }

    fn refresh_hub_counts(&self) {
        let (total, online) = self.store.hub_counts();
        self.diagnostics.set_hub_counts(total, online);
    }

    fn publish(&self, event: DeviceEvent) {
        self.events.publish_with_source(event, "sync");
    }

    fn on_disconnected(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            fetch.abort();
        }
        self.reconciler.reset();
        if self.connected.send_replace(false) {
            self.publish(DeviceEvent::ConnectionChanged { connected: false });
        }
    }
}
