//! Container discovery and subscription lifecycle
//!
//! The registry owns every tracked container together with its logs and
//! stats subscriptions. It is driven from the reactor's discovery tick;
//! readiness on a stream never tells us that a container appeared.

use crate::codec::{ChunkDecoder, Demuxed, FrameError, LogDemuxer};
use crate::connect::{ConnectPoll, PendingConnect};
use crate::engine::{Engine, EngineError};
use crate::models::ContainerInfo;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Length of the container id shown in logs
pub const SHORT_ID_LEN: usize = 12;

/// Container identity. Ids can be reused, so the creation time is part of it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerKey {
    pub id: String,
    pub created: i64,
}

impl ContainerKey {
    pub fn new(id: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            created,
        }
    }

    pub fn short_id(&self) -> &str {
        self.id.get(..SHORT_ID_LEN).unwrap_or(&self.id)
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_id())
    }
}

/// Outcome of comparing two snapshots of the container set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: Vec<ContainerKey>,
    pub removed: Vec<ContainerKey>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// `added = discovered - tracked`, `removed = tracked - discovered`
pub fn reconcile(
    tracked: &BTreeSet<ContainerKey>,
    discovered: &BTreeSet<ContainerKey>,
) -> Reconciliation {
    Reconciliation {
        added: discovered.difference(tracked).cloned().collect(),
        removed: tracked.difference(discovered).cloned().collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubscriptionKind {
    Logs,
    Stats,
}

impl SubscriptionKind {
    pub const ALL: [SubscriptionKind; 2] = [SubscriptionKind::Logs, SubscriptionKind::Stats];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::Logs => "logs",
            SubscriptionKind::Stats => "stats",
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionKey {
    pub container: ContainerKey,
    pub kind: SubscriptionKind,
}

impl SubscriptionKey {
    pub fn new(container: ContainerKey, kind: SubscriptionKind) -> Self {
        Self { container, kind }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    /// Stream registered with the reactor
    Active,
    Closing,
    Closed,
}

/// One live feed (logs or stats) of one container
#[derive(Debug)]
pub struct Subscription {
    key: SubscriptionKey,
    info: Arc<ContainerInfo>,
    state: SubscriptionState,
    pending: Option<PendingConnect>,
    decoder: ChunkDecoder,
    demuxer: LogDemuxer,
}

impl Subscription {
    pub fn new(key: SubscriptionKey, info: Arc<ContainerInfo>) -> Self {
        Self {
            key,
            info,
            state: SubscriptionState::Idle,
            pending: None,
            decoder: ChunkDecoder::new(),
            demuxer: LogDemuxer::new(),
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn info(&self) -> &ContainerInfo {
        &self.info
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Active
    }

    /// Idle -> Connecting
    pub fn start_connect(&mut self, pending: PendingConnect) {
        debug_assert_eq!(self.state, SubscriptionState::Idle);
        self.pending = Some(pending);
        self.state = SubscriptionState::Connecting;
    }

    /// Check the pending connect without waiting. A finished connect is
    /// taken out of the subscription.
    pub fn poll_connect(&mut self) -> ConnectPoll {
        let Some(pending) = self.pending.as_mut() else {
            return ConnectPoll::Lost;
        };
        let poll = pending.poll_ready();
        if !matches!(poll, ConnectPoll::Pending) {
            self.pending = None;
        }
        poll
    }

    /// Connecting -> Active, seeding the read buffer with body bytes that
    /// arrived with the response head. Returns the frames they complete.
    pub fn activate(&mut self, initial: &[u8]) -> Vec<Vec<u8>> {
        self.state = SubscriptionState::Active;
        self.decoder.feed(initial)
    }

    /// Append freshly read bytes and return every frame they complete
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.decoder.feed(bytes)
    }

    pub fn demux(&mut self, frame: &[u8]) -> Result<Demuxed, FrameError> {
        self.demuxer.demux(frame)
    }

    /// The engine sent the terminating chunk
    pub fn is_finished(&self) -> bool {
        self.decoder.is_finished()
    }

    /// Enter `Closing` and cancel any pending connect. Returns false when the
    /// subscription was already closing or closed.
    pub fn begin_close(&mut self) -> bool {
        if matches!(
            self.state,
            SubscriptionState::Closing | SubscriptionState::Closed
        ) {
            return false;
        }
        self.state = SubscriptionState::Closing;
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
        true
    }

    /// Enter `Closed` once the stream is gone. Returns the bytes that never
    /// formed a complete frame.
    pub fn finish_close(&mut self) -> Vec<u8> {
        self.state = SubscriptionState::Closed;
        std::mem::take(&mut self.decoder).pending().to_vec()
    }
}

/// Tracks running containers and their subscriptions
pub struct ContainerRegistry {
    engine: Arc<dyn Engine>,
    tracked: BTreeMap<ContainerKey, Arc<ContainerInfo>>,
    /// Containers with a terminal attached; never subscribed
    excluded: BTreeSet<ContainerKey>,
    subscriptions: BTreeMap<SubscriptionKey, Subscription>,
}

impl ContainerRegistry {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            tracked: BTreeMap::new(),
            excluded: BTreeSet::new(),
            subscriptions: BTreeMap::new(),
        }
    }

    /// List running containers, inspecting the ones we have not seen yet.
    /// Containers with a tty are left out and remembered as excluded.
    pub async fn discover(&mut self) -> Result<BTreeMap<ContainerKey, Arc<ContainerInfo>>, EngineError> {
        let listing = self.engine.list_containers().await?;
        let mut discovered = BTreeMap::new();
        let mut seen = BTreeSet::new();

        for summary in listing {
            let key = ContainerKey::new(summary.id, summary.created);
            seen.insert(key.clone());

            if self.excluded.contains(&key) {
                continue;
            }
            if let Some(info) = self.tracked.get(&key) {
                discovered.insert(key, Arc::clone(info));
                continue;
            }

            match self.engine.inspect(&key.id).await {
                Ok(info) if info.tty => {
                    info!(
                        container = %key,
                        name = %info.display_name(),
                        "Container has a terminal attached, not following it"
                    );
                    self.excluded.insert(key);
                }
                Ok(info) => {
                    discovered.insert(key, Arc::new(info));
                }
                Err(e) if e.is_not_found() => {
                    debug!(container = %key, "Container exited before inspection");
                }
                Err(e) => {
                    warn!(container = %key, error = %e, "Failed to inspect container");
                }
            }
        }

        self.excluded.retain(|key| seen.contains(key));
        Ok(discovered)
    }

    pub fn tracked_keys(&self) -> BTreeSet<ContainerKey> {
        self.tracked.keys().cloned().collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_excluded(&self, key: &ContainerKey) -> bool {
        self.excluded.contains(key)
    }

    /// Start tracking a container with idle logs and stats subscriptions
    pub fn track(&mut self, key: ContainerKey, info: Arc<ContainerInfo>) {
        for kind in SubscriptionKind::ALL {
            let sub_key = SubscriptionKey::new(key.clone(), kind);
            self.subscriptions
                .entry(sub_key.clone())
                .or_insert_with(|| Subscription::new(sub_key, Arc::clone(&info)));
        }
        self.tracked.insert(key, info);
    }

    /// Forget a container and its subscriptions, which must be closed first
    pub fn untrack(&mut self, key: &ContainerKey) -> Option<Arc<ContainerInfo>> {
        for kind in SubscriptionKind::ALL {
            let sub_key = SubscriptionKey::new(key.clone(), kind);
            if let Some(sub) = self.subscriptions.remove(&sub_key) {
                debug_assert_eq!(sub.state(), SubscriptionState::Closed);
            }
        }
        self.tracked.remove(key)
    }

    pub fn subscription(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        self.subscriptions.get(key)
    }

    pub fn subscription_mut(&mut self, key: &SubscriptionKey) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(key)
    }

    /// Subscriptions of a container, in kind order
    pub fn subscription_keys(&self, container: &ContainerKey) -> Vec<SubscriptionKey> {
        SubscriptionKind::ALL
            .into_iter()
            .map(|kind| SubscriptionKey::new(container.clone(), kind))
            .filter(|key| self.subscriptions.contains_key(key))
            .collect()
    }

    /// Subscriptions waiting for their connect to finish
    pub fn connecting(&self) -> Vec<SubscriptionKey> {
        self.subscriptions
            .values()
            .filter(|sub| sub.state() == SubscriptionState::Connecting)
            .map(|sub| sub.key().clone())
            .collect()
    }

    pub fn all_subscription_keys(&self) -> Vec<SubscriptionKey> {
        self.subscriptions.keys().cloned().collect()
    }
}
