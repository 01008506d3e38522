//! The stream reactor
//!
//! A single task owns every open engine stream. Streams are multiplexed
//! through a `StreamMap` keyed by a tag naming the subscription they belong
//! to, so a ready read is dispatched without searching. Discovery runs on a
//! fixed cadence next to the reads, and new connections are opened in the
//! background by a one-worker [`ConnectPool`].
//!
//! Bytes flow read -> chunk decoder -> (log demuxer) -> normalizer -> sink,
//! in arrival order per stream.

mod stream;


pub use stream::{ReadOutcome, ReadStream, DEFAULT_READ_SIZE};

use crate::codec::{ChunkDecoder, Demuxed};
use crate::connect::{ConnectPoll, ConnectPool, PendingConnect, DEFAULT_CONNECT_TIMEOUT};
use crate::engine::{logs_path, stats_path, Engine, StreamHandle, EVENTS_PATH};
use crate::health::{components, HealthRegistry};
use crate::marker::ResumeMarker;
use crate::models::{ContainerInfo, NormalizedRecord};
use crate::normalize::Normalizer;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::registry::{
    reconcile, ContainerKey, ContainerRegistry, SubscriptionKey, SubscriptionKind,
};
use crate::sink::Sink;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn};

/// Which feed a registered stream belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamTag {
    /// The daemon-wide event feed
    Events,
    Subscription(SubscriptionKey),
}

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// How often the container set is reconciled
    pub discovery_interval: Duration,
    /// Subtracted from the wall clock when persisting the resume marker
    pub resume_margin: Duration,
    /// Upper bound on a single read
    pub read_size: usize,
    /// Bound on opening one stream, after which the subscription closes
    pub connect_timeout: Duration,
    /// Period of the throughput log line
    pub throughput_window: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(1),
            resume_margin: Duration::from_secs(10),
            read_size: DEFAULT_READ_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            throughput_window: Duration::from_secs(10),
        }
    }
}

enum EventFeed {
    Idle,
    Connecting(PendingConnect),
    Active(ChunkDecoder),
}

pub struct Reactor {
    config: ReactorConfig,
    pool: ConnectPool,
    registry: ContainerRegistry,
    streams: StreamMap<StreamTag, ReadStream>,
    events: EventFeed,
    normalizer: Normalizer,
    sink: Box<dyn Sink>,
    marker: ResumeMarker,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    ready: bool,
    engine_degraded: bool,
    sink_degraded: bool,
    window_records: u64,
    window_start: Instant,
}

impl Reactor {
    pub fn new(
        engine: Arc<dyn Engine>,
        sink: Box<dyn Sink>,
        marker: ResumeMarker,
        config: ReactorConfig,
    ) -> Self {
        Self {
            pool: ConnectPool::new(Arc::clone(&engine), config.connect_timeout),
            config,
            registry: ContainerRegistry::new(engine),
            streams: StreamMap::new(),
            events: EventFeed::Idle,
            normalizer: Normalizer::default(),
            sink,
            marker,
            health: HealthRegistry::new(),
            metrics: AgentMetrics::new(),
            logger: StructuredLogger::new(""),
            ready: false,
            engine_degraded: false,
            sink_degraded: false,
            window_records: 0,
            window_start: Instant::now(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    pub fn marker(&self) -> &ResumeMarker {
        &self.marker
    }

    /// Streams currently registered for reading, the event feed included
    pub fn registered_streams(&self) -> usize {
        self.streams.len()
    }

    /// Run until `shutdown` fires, then close every stream.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.health.set_healthy(components::REACTOR).await;
        self.logger
            .log_startup(env!("CARGO_PKG_VERSION"), self.marker.value());

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => self.tick().await,
                Some((tag, outcome)) = self.streams.next(), if !self.streams.is_empty() => {
                    self.dispatch(tag, outcome).await;
                }
            }
            self.poll_connects().await;
            self.log_throughput();
        }

        self.close_all();
        self.logger.log_shutdown("shutdown requested");
    }

    /// One discovery pass: reconcile containers, keep the event feed open
    /// and advance the resume marker.
    pub async fn tick(&mut self) {
        if matches!(self.events, EventFeed::Idle) {
            self.events = EventFeed::Connecting(self.pool.submit(EVENTS_PATH.to_string()));
        }

        match self.registry.discover().await {
            Ok(discovered) => {
                let current: BTreeSet<ContainerKey> = discovered.keys().cloned().collect();
                let changes = reconcile(&self.registry.tracked_keys(), &current);
                for key in &changes.removed {
                    self.remove_container(key);
                }
                for key in changes.added {
                    if let Some(info) = discovered.get(&key) {
                        self.add_container(key, Arc::clone(info));
                    }
                }
                self.metrics
                    .set_containers_tracked(self.registry.tracked_count());

                if self.engine_degraded {
                    self.engine_degraded = false;
                    self.health.set_healthy(components::ENGINE).await;
                }
                if !self.ready {
                    self.ready = true;
                    self.health.set_ready(true).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Container discovery failed");
                self.engine_degraded = true;
                self.health
                    .set_degraded(components::ENGINE, e.to_string())
                    .await;
            }
        }

        let since = chrono::Utc::now().timestamp() - self.config.resume_margin.as_secs() as i64;
        if let Err(e) = self.marker.store(since).await {
            warn!(error = %e, "Failed to persist resume marker");
        }
    }

    /// Wait up to `wait` for one stream to become readable and handle it.
    /// Returns false if nothing was ready.
    pub async fn dispatch_next(&mut self, wait: Duration) -> bool {
        if self.streams.is_empty() {
            tokio::time::sleep(wait).await;
            return false;
        }
        match tokio::time::timeout(wait, self.streams.next()).await {
            Ok(Some((tag, outcome))) => {
                self.dispatch(tag, outcome).await;
                true
            }
            _ => false,
        }
    }

    /// Collect finished connects without waiting on unfinished ones.
    pub async fn poll_connects(&mut self) {
        self.poll_event_connect().await;

        for key in self.registry.connecting() {
            let Some(sub) = self.registry.subscription_mut(&key) else {
                continue;
            };
            match sub.poll_connect() {
                ConnectPoll::Pending => {}
                ConnectPoll::Ready(Ok(handle)) => self.activate(&key, handle).await,
                ConnectPoll::Ready(Err(e)) if e.is_not_found() => {
                    debug!(subscription = %key, "Container exited before its stream opened");
                    self.close_subscription(&key);
                }
                ConnectPoll::Ready(Err(e)) => {
                    warn!(subscription = %key, error = %e, "Failed to open stream");
                    self.close_subscription(&key);
                }
                ConnectPoll::Lost => {
                    warn!(subscription = %key, "Connect worker vanished");
                    self.close_subscription(&key);
                }
            }
        }
    }

    fn add_container(&mut self, key: ContainerKey, info: Arc<ContainerInfo>) {
        self.logger
            .log_container_added(&key.to_string(), info.display_name());
        self.registry.track(key.clone(), info);

        for kind in SubscriptionKind::ALL {
            let path = match kind {
                SubscriptionKind::Logs => logs_path(&key.id, self.marker.since()),
                SubscriptionKind::Stats => stats_path(&key.id),
            };
            let sub_key = SubscriptionKey::new(key.clone(), kind);
            if let Some(sub) = self.registry.subscription_mut(&sub_key) {
                sub.start_connect(self.pool.submit(path));
            }
        }
    }

    fn remove_container(&mut self, key: &ContainerKey) {
        for sub_key in self.registry.subscription_keys(key) {
            self.close_subscription(&sub_key);
        }
        self.registry.untrack(key);
        self.logger.log_container_removed(&key.to_string());
    }

    async fn activate(&mut self, key: &SubscriptionKey, handle: StreamHandle) {
        if !handle.chunked {
            warn!(subscription = %key, "Engine stream is not chunked");
            self.close_subscription(key);
            return;
        }
        let Some(sub) = self.registry.subscription_mut(key) else {
            return;
        };

        let frames = sub.activate(&handle.initial);
        self.streams.insert(
            StreamTag::Subscription(key.clone()),
            ReadStream::new(handle.reader, self.config.read_size),
        );
        self.metrics.inc_subscriptions_opened();
        self.logger
            .log_subscription_opened(&key.container.to_string(), key.kind.as_str());

        self.handle_frames(key, frames).await;
    }

    /// Unregister the stream, cancel a pending connect and drop the buffer.
    fn close_subscription(&mut self, key: &SubscriptionKey) {
        let Some(sub) = self.registry.subscription_mut(key) else {
            return;
        };
        let was_active = sub.is_active();
        if !sub.begin_close() {
            return;
        }
        self.streams.remove(&StreamTag::Subscription(key.clone()));
        let remaining = sub.finish_close();

        self.metrics.inc_subscriptions_closed(was_active);
        self.logger.log_subscription_closed(
            &key.container.to_string(),
            key.kind.as_str(),
            &remaining,
        );
    }

    async fn dispatch(&mut self, tag: StreamTag, outcome: ReadOutcome) {
        match tag {
            StreamTag::Events => self.on_events(outcome).await,
            StreamTag::Subscription(key) => self.on_subscription(&key, outcome).await,
        }
    }

    async fn on_subscription(&mut self, key: &SubscriptionKey, outcome: ReadOutcome) {
        let active = self
            .registry
            .subscription(key)
            .map(|sub| sub.is_active())
            .unwrap_or(false);
        if !active {
            debug!(subscription = %key, "Ignoring readiness of a closed subscription");
            return;
        }

        match outcome {
            ReadOutcome::Data(bytes) => {
                let frames = match self.registry.subscription_mut(key) {
                    Some(sub) => sub.feed(&bytes),
                    None => return,
                };
                self.handle_frames(key, frames).await;
            }
            ReadOutcome::Eof => {
                debug!(subscription = %key, "Engine closed the stream");
                self.close_subscription(key);
            }
            ReadOutcome::Failed(e) => {
                warn!(subscription = %key, error = %e, "Read failed");
                self.close_subscription(key);
            }
        }
    }

    async fn handle_frames(&mut self, key: &SubscriptionKey, frames: Vec<Vec<u8>>) {
        let records = self.normalize_frames(key, frames);
        self.emit(records).await;

        let finished = self
            .registry
            .subscription(key)
            .map(|sub| sub.is_finished())
            .unwrap_or(false);
        if finished {
            debug!(subscription = %key, "Engine ended the stream");
            self.close_subscription(key);
        }
    }

    fn normalize_frames(
        &mut self,
        key: &SubscriptionKey,
        frames: Vec<Vec<u8>>,
    ) -> Vec<NormalizedRecord> {
        let Some(sub) = self.registry.subscription_mut(key) else {
            return Vec::new();
        };
        let container = key.container.to_string();
        let mut records = Vec::new();

        for frame in frames {
            let result = match key.kind {
                SubscriptionKind::Logs => match sub.demux(&frame) {
                    Ok(Demuxed::Selector(_)) => continue,
                    Ok(Demuxed::Line(line)) => self.normalizer.log(&line, sub.info()),
                    Err(e) => {
                        self.metrics.inc_malformed_frames();
                        self.logger.log_dropped_frame(
                            &container,
                            key.kind.as_str(),
                            &e.to_string(),
                            &frame,
                        );
                        continue;
                    }
                },
                SubscriptionKind::Stats => self.normalizer.stats(&frame, sub.info()),
            };
            match result {
                Ok(mut batch) => records.append(&mut batch),
                Err(e) => {
                    self.metrics.inc_normalize_failures();
                    self.logger.log_dropped_frame(
                        &container,
                        key.kind.as_str(),
                        &e.to_string(),
                        &frame,
                    );
                }
            }
        }
        records
    }

    async fn poll_event_connect(&mut self) {
        let EventFeed::Connecting(pending) = &mut self.events else {
            return;
        };
        match pending.poll_ready() {
            ConnectPoll::Pending => {}
            ConnectPoll::Ready(Ok(handle)) if handle.chunked => {
                let mut decoder = ChunkDecoder::new();
                let frames = decoder.feed(&handle.initial);
                self.events = EventFeed::Active(decoder);
                self.streams.insert(
                    StreamTag::Events,
                    ReadStream::new(handle.reader, self.config.read_size),
                );
                info!("Following engine events");
                self.handle_event_frames(frames).await;
            }
            ConnectPoll::Ready(Ok(_)) => {
                warn!("Engine event stream is not chunked");
                self.events = EventFeed::Idle;
            }
            ConnectPoll::Ready(Err(e)) => {
                warn!(error = %e, "Failed to open the engine event feed");
                self.events = EventFeed::Idle;
            }
            ConnectPoll::Lost => {
                self.events = EventFeed::Idle;
            }
        }
    }

    async fn on_events(&mut self, outcome: ReadOutcome) {
        let EventFeed::Active(decoder) = &mut self.events else {
            debug!("Ignoring readiness of a closed event feed");
            return;
        };
        match outcome {
            ReadOutcome::Data(bytes) => {
                let frames = decoder.feed(&bytes);
                self.handle_event_frames(frames).await;
            }
            ReadOutcome::Eof => {
                info!("Engine event feed ended, reopening on the next tick");
                self.close_events();
            }
            ReadOutcome::Failed(e) => {
                warn!(error = %e, "Engine event feed failed, reopening on the next tick");
                self.close_events();
            }
        }
    }

    async fn handle_event_frames(&mut self, frames: Vec<Vec<u8>>) {
        let mut records = Vec::new();
        for frame in frames {
            match self.normalizer.event(&frame) {
                Ok(mut batch) => records.append(&mut batch),
                Err(e) => {
                    self.metrics.inc_normalize_failures();
                    self.logger
                        .log_dropped_frame("-", "events", &e.to_string(), &frame);
                }
            }
        }
        self.emit(records).await;

        if matches!(&self.events, EventFeed::Active(decoder) if decoder.is_finished()) {
            info!("Engine event feed ended, reopening on the next tick");
            self.close_events();
        }
    }

    fn close_events(&mut self) {
        self.streams.remove(&StreamTag::Events);
        if let EventFeed::Connecting(pending) = std::mem::replace(&mut self.events, EventFeed::Idle)
        {
            pending.cancel();
        }
    }

    /// Hand one batch to the sink. Failures are logged and the batch dropped.
    async fn emit(&mut self, records: Vec<NormalizedRecord>) {
        if records.is_empty() {
            return;
        }
        match self.sink.emit(&records).await {
            Ok(()) => {
                self.metrics.add_records_emitted(records.len());
                self.window_records += records.len() as u64;
                if self.sink_degraded {
                    self.sink_degraded = false;
                    self.health.set_healthy(components::SINK).await;
                }
            }
            Err(e) => {
                self.metrics.inc_sink_failures();
                warn!(
                    sink = self.sink.name(),
                    records = records.len(),
                    error = %e,
                    "Sink failed, dropping batch"
                );
                if !self.sink_degraded {
                    self.sink_degraded = true;
                    self.health
                        .set_degraded(components::SINK, e.to_string())
                        .await;
                }
            }
        }
    }

    fn log_throughput(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed < self.config.throughput_window {
            return;
        }
        self.logger
            .log_throughput(self.window_records, elapsed.as_secs());
        self.window_records = 0;
        self.window_start = Instant::now();
    }

    fn close_all(&mut self) {
        for key in self.registry.all_subscription_keys() {
            self.close_subscription(&key);
        }
        self.close_events();
    }
}
