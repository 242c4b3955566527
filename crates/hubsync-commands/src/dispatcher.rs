//! Hub-scoped command dispatcher.
//!
//! Each hub gets its own worker task fed by an unbounded queue, so batches
//! for one hub never overlap on its radio channel while hubs proceed
//! independently. A global semaphore bounds concurrent wire calls across
//! all hubs; when it is saturated work waits instead of failing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};

use hubsync_core::config::DispatchConfig;
use hubsync_core::{Diagnostics, EventMetadata};
use hubsync_devices::{DeviceEvent, DeviceEventBus, DeviceStore};

use crate::batch::{BatchOutcome, CommandBatch};
use crate::command::{Command, CommandRecord, CommandState, RetryPolicy, SpeedTier};
use crate::error::{DispatchError, WireError};
use crate::probe::StoreProbe;
use crate::writer::{EffectProbe, HubWriter};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Global bound on concurrent wire calls
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    /// Queued commands above which callers are warned
    pub queue_warn_threshold: usize,
    pub default_tier: SpeedTier,
    pub optimistic_updates: bool,
    /// Wait before the fast tier probes acknowledged writes
    pub probe_settle: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            retry: RetryPolicy::default(),
            queue_warn_threshold: 200,
            default_tier: SpeedTier::Normal,
            optimistic_updates: true,
            probe_settle: Duration::from_millis(300),
        }
    }
}

impl DispatcherConfig {
    pub fn from_config(dispatch: &DispatchConfig, max_in_flight: usize) -> Result<Self, DispatchError> {
        Ok(Self {
            max_in_flight,
            retry: RetryPolicy::from(dispatch),
            queue_warn_threshold: dispatch.queue_warn_threshold,
            default_tier: dispatch.default_tier.parse()?,
            optimistic_updates: dispatch.optimistic_updates,
            probe_settle: Duration::from_millis(dispatch.probe_settle_ms),
        })
    }
}

struct Job {
    batch: CommandBatch,
    cancelled: Arc<AtomicBool>,
    done: oneshot::Sender<BatchOutcome>,
}

/// Handle to one enqueued batch.
pub struct SubmissionHandle {
    batch_id: String,
    hub_id: String,
    len: usize,
    backpressure: bool,
    cancelled: Arc<AtomicBool>,
    rx: oneshot::Receiver<BatchOutcome>,
}

impl SubmissionHandle {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the queue was over the warning threshold when this batch was
    /// accepted.
    pub fn backpressure(&self) -> bool {
        self.backpressure
    }

    /// Cancel every command of the batch that has not reached the wire yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Wait until every command is terminal.
    pub async fn wait(self) -> Result<BatchOutcome, DispatchError> {
        self.rx.await.map_err(|_| DispatchError::Closed)
    }
}

struct Inner {
    writer: Arc<dyn HubWriter>,
    config: DispatcherConfig,
    admission: Semaphore,
    queues: DashMap<String, mpsc::UnboundedSender<Job>>,
    diagnostics: Arc<Diagnostics>,
    probe: Option<Arc<dyn EffectProbe>>,
    store: Option<Arc<DeviceStore>>,
    events: Option<DeviceEventBus>,
    closed: AtomicBool,
}

/// Builder for [`CommandDispatcher`].
pub struct DispatcherBuilder {
    writer: Arc<dyn HubWriter>,
    config: DispatcherConfig,
    diagnostics: Option<Arc<Diagnostics>>,
    probe: Option<Arc<dyn EffectProbe>>,
    store: Option<Arc<DeviceStore>>,
    events: Option<DeviceEventBus>,
}

impl DispatcherBuilder {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Device store used for optimistic updates, error attribution and, unless
    /// another probe is set, the fast tier's effect probe.
    pub fn store(mut self, store: Arc<DeviceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn EffectProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn events(mut self, events: DeviceEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> CommandDispatcher {
        let probe = self.probe.or_else(|| {
            self.store
                .as_ref()
                .map(|s| Arc::new(StoreProbe::new(Arc::clone(s))) as Arc<dyn EffectProbe>)
        });
        CommandDispatcher {
            inner: Arc::new(Inner {
                writer: self.writer,
                admission: Semaphore::new(self.config.max_in_flight.max(1)),
                config: self.config,
                queues: DashMap::new(),
                diagnostics: self.diagnostics.unwrap_or_default(),
                probe,
                store: self.store,
                events: self.events,
                closed: AtomicBool::new(false),
            }),
        }
    }
}

/// Accepts write intents and drives them to a terminal state.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<Inner>,
}

impl CommandDispatcher {
    pub fn builder(writer: Arc<dyn HubWriter>) -> DispatcherBuilder {
        DispatcherBuilder {
            writer,
            config: DispatcherConfig::default(),
            diagnostics: None,
            probe: None,
            store: None,
            events: None,
        }
    }

    pub fn new(writer: Arc<dyn HubWriter>, config: DispatcherConfig) -> Self {
        Self::builder(writer).config(config).build()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.inner.diagnostics
    }

    /// Queue a batch for one hub.
    pub fn enqueue(
        &self,
        hub_id: &str,
        commands: Vec<Command>,
        tier: SpeedTier,
    ) -> Result<SubmissionHandle, DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        let batch = CommandBatch::new(hub_id, commands, tier)?;
        let len = batch.len();
        let cancelled = Arc::new(AtomicBool::new(false));
        let (done, rx) = oneshot::channel();
        let batch_id = batch.id.clone();

        let depth = self.inner.diagnostics.queue_added(len);
        let backpressure = depth >= self.inner.config.queue_warn_threshold;
        if backpressure && self.inner.diagnostics.set_backpressure(true) {
            warn!(
                category = "dispatch",
                queue_depth = depth,
                threshold = self.inner.config.queue_warn_threshold,
                "Command queue over threshold"
            );
        }

        let job = Job {
            batch,
            cancelled: Arc::clone(&cancelled),
            done,
        };
        if let Err(mpsc::error::SendError(job)) = self.queue_for(hub_id).send(job) {
            // Worker gone; drop the stale queue and retry once with a fresh one.
            self.inner.queues.remove(hub_id);
            if self.queue_for(hub_id).send(job).is_err() {
                self.inner.diagnostics.queue_removed(len);
                return Err(DispatchError::Closed);
            }
        }

        debug!(category = "dispatch", hub_id, batch_id = %batch_id, commands = len, tier = %tier, "Batch queued");
        Ok(SubmissionHandle {
            batch_id,
            hub_id: hub_id.to_string(),
            len,
            backpressure,
            cancelled,
            rx,
        })
    }

    /// Split commands by hub, keeping submission order within each hub, and
    /// queue one batch per hub.
    pub fn submit(
        &self,
        commands: Vec<Command>,
        tier: SpeedTier,
    ) -> Result<Vec<SubmissionHandle>, DispatchError> {
        if commands.is_empty() {
            return Err(DispatchError::EmptyBatch);
        }
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Command>> = HashMap::new();
        for command in commands {
            if !groups.contains_key(&command.hub_id) {
                order.push(command.hub_id.clone());
            }
            groups.entry(command.hub_id.clone()).or_default().push(command);
        }
        order
            .into_iter()
            .map(|hub| {
                let cmds = groups.remove(&hub).unwrap_or_default();
                self.enqueue(&hub, cmds, tier)
            })
            .collect()
    }

    /// Queue and wait.
    pub async fn dispatch(
        &self,
        hub_id: &str,
        commands: Vec<Command>,
        tier: SpeedTier,
    ) -> Result<BatchOutcome, DispatchError> {
        self.enqueue(hub_id, commands, tier)?.wait().await
    }

    /// Stop accepting work. Later submissions fail with
    /// [`DispatchError::Closed`]; workers finish what they already hold.
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!(category = "dispatch", "Dispatcher shut down");
        }
        self.inner.queues.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn queue_for(&self, hub_id: &str) -> mpsc::UnboundedSender<Job> {
        self.inner
            .queues
            .entry(hub_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(hub_worker(Arc::downgrade(&self.inner), hub_id.to_string(), rx));
                tx
            })
            .clone()
    }
}

async fn hub_worker(inner: Weak<Inner>, hub_id: String, mut rx: mpsc::UnboundedReceiver<Job>) {
    debug!(category = "dispatch", hub_id = %hub_id, "Hub worker started");
    while let Some(job) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.run_job(job).await;
    }
    debug!(category = "dispatch", hub_id = %hub_id, "Hub worker stopped");
}

impl Inner {
    async fn run_job(&self, job: Job) {
        let Job {
            mut batch,
            cancelled,
            done,
        } = job;
        let len = batch.len();

        match batch.tier {
            SpeedTier::Normal => self.run_normal(&mut batch.records, &cancelled).await,
            SpeedTier::Fast => self.run_fast(&batch.hub_id, &mut batch.records, &cancelled).await,
            SpeedTier::Extreme => {
                self.run_extreme(&batch.hub_id, &mut batch.records, &cancelled)
                    .await
            }
        }

        for record in batch.records.iter().filter(|r| r.state == CommandState::Abandoned) {
            self.record_failure(record);
        }

        let depth = self.diagnostics.queue_removed(len);
        if depth < self.config.queue_warn_threshold && self.diagnostics.set_backpressure(false) {
            info!(category = "dispatch", queue_depth = depth, "Command queue back under threshold");
        }

        let outcome = batch.into_outcome();
        info!(
            category = "dispatch",
            hub_id = %outcome.hub_id,
            tier = %outcome.tier,
            acknowledged = outcome.acknowledged().len(),
            failed = outcome.failed().len(),
            cancelled = outcome.cancelled().len(),
            submitted = outcome.submitted().len(),
            "Batch finished"
        );
        // The caller may have dropped the handle.
        let _ = done.send(outcome);
    }

    /// Strictly sequential; each command acknowledged or abandoned before the
    /// next leaves.
    async fn run_normal(&self, records: &mut [CommandRecord], cancelled: &AtomicBool) {
        for record in records.iter_mut() {
            if cancelled.load(Ordering::SeqCst) {
                record.cancel();
                continue;
            }
            self.send_until_terminal(record, 1, cancelled).await;
            if record.state == CommandState::Acknowledged {
                self.apply_optimistic(&record.command);
            }
        }
    }

    /// Pass one: the whole batch in one unacknowledged call. Pass two:
    /// sequential acknowledged resends of whatever failed or did not take
    /// effect.
    async fn run_fast(&self, hub_id: &str, records: &mut [CommandRecord], cancelled: &AtomicBool) {
        if cancelled.load(Ordering::SeqCst) {
            records.iter_mut().for_each(CommandRecord::cancel);
            return;
        }

        let results = self.send_batch(hub_id, records, SpeedTier::Fast).await;
        for (record, result) in records.iter_mut().zip(results) {
            match result {
                Ok(()) => record.acknowledge(),
                Err(e) => {
                    let retry = e.is_transient() && self.config.retry.allows(record.attempts);
                    debug!(category = "dispatch", command_id = %record.command.id, error = %e, retry, "Fast pass one miss");
                    record.fail(&e);
                    if retry {
                        record.retry();
                    } else {
                        record.abandon();
                    }
                }
            }
        }

        if let Some(probe) = &self.probe {
            if records.iter().any(|r| r.state == CommandState::Acknowledged) {
                tokio::time::sleep(self.config.probe_settle).await;
                for record in records.iter_mut() {
                    if record.state == CommandState::Acknowledged
                        && probe.has_taken_effect(&record.command) == Some(false)
                        && self.config.retry.allows(record.attempts)
                    {
                        debug!(category = "dispatch", command_id = %record.command.id, "Acknowledged write not visible, resending");
                        record.requeue();
                    }
                }
            }
        }

        for record in records.iter_mut() {
            if record.state == CommandState::Retrying {
                let delay = self.config.retry.delay_for_attempt(record.attempts);
                tokio::time::sleep(delay).await;
                self.send_until_terminal(record, 2, cancelled).await;
            }
        }

        for record in records.iter().filter(|r| r.state == CommandState::Acknowledged) {
            self.apply_optimistic(&record.command);
        }
    }

    /// One unacknowledged batch call, never resent. Only non-transient item
    /// errors are reported; everything else counts as submitted.
    async fn run_extreme(&self, hub_id: &str, records: &mut [CommandRecord], cancelled: &AtomicBool) {
        if cancelled.load(Ordering::SeqCst) {
            records.iter_mut().for_each(CommandRecord::cancel);
            return;
        }

        let results = self.send_batch(hub_id, records, SpeedTier::Extreme).await;
        for (record, result) in records.iter_mut().zip(results) {
            match result {
                Err(e) if !e.is_transient() => {
                    record.fail(&e);
                    record.abandon();
                }
                _ => record.submit(),
            }
        }
    }

    /// Acknowledged single writes with retries on transient errors.
    /// Send with retries. A cancel seen between attempts abandons the
    /// command with its last failure.
    async fn send_until_terminal(&self, record: &mut CommandRecord, pass: u8, cancelled: &AtomicBool) {
        loop {
            record.start_attempt(pass);
            match self.send_one(&record.command).await {
                Ok(()) => {
                    record.acknowledge();
                    return;
                }
                Err(e) => {
                    let retry = e.is_transient() && self.config.retry.allows(record.attempts);
                    warn!(
                        category = "dispatch",
                        command_id = %record.command.id,
                        hub_id = %record.command.hub_id,
                        device_id = %record.command.device_id,
                        io = %record.command.io_key,
                        attempt = record.attempts,
                        error = %e,
                        retry,
                        "Write failed"
                    );
                    record.fail(&e);
                    if !retry {
                        record.abandon();
                        return;
                    }
                    record.retry();
                    tokio::time::sleep(self.config.retry.delay_for_attempt(record.attempts)).await;
                    if cancelled.load(Ordering::SeqCst) {
                        debug!(category = "dispatch", command_id = %record.command.id, "Cancelled during retry");
                        record.abandon();
                        return;
                    }
                }
            }
        }
    }

    async fn send_one(&self, command: &Command) -> Result<(), WireError> {
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| WireError::Transport("admission closed".to_string()))?;
        let _op = self.diagnostics.begin_operation();
        self.writer.write(command).await
    }

    async fn send_batch(
        &self,
        hub_id: &str,
        records: &mut [CommandRecord],
        tier: SpeedTier,
    ) -> Vec<Result<(), WireError>> {
        let commands: Vec<Command> = records.iter().map(|r| r.command.clone()).collect();
        records.iter_mut().for_each(|r| r.start_attempt(1));

        let mut results = match self.admission.acquire().await {
            Ok(_permit) => {
                let _op = self.diagnostics.begin_operation();
                self.writer.write_batch(hub_id, &commands, tier).await
            }
            Err(_) => Vec::new(),
        };
        if results.len() != commands.len() {
            warn!(
                category = "dispatch",
                hub_id,
                expected = commands.len(),
                got = results.len(),
                "Batch response size mismatch"
            );
            results.resize_with(commands.len(), || {
                Err(WireError::Transport("no result for command".to_string()))
            });
        }
        results
    }

    fn apply_optimistic(&self, command: &Command) {
        if !self.config.optimistic_updates {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let Some(outcome) = store.apply_delta(&command.to_delta()) else {
            return;
        };
        if let Some(events) = &self.events {
            events.publish_with_metadata(
                DeviceEvent::IoChanged {
                    hub_id: command.hub_id.clone(),
                    device_id: command.device_id.clone(),
                    io: outcome.io,
                    role: outcome.role_changed,
                    optimistic: true,
                },
                EventMetadata::new("dispatcher").with_correlation_id(command.id.clone()),
            );
        }
    }

    fn record_failure(&self, record: &CommandRecord) {
        let command = &record.command;
        let device_type = self
            .store
            .as_ref()
            .and_then(|s| s.device(&command.hub_id, &command.device_id))
            .map(|d| d.device_type.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let code = record.failure.as_ref().and_then(|f| f.code);
        self.diagnostics
            .record_device_error(&device_type, &command.hub_id, &command.device_id, code);
    }
}
