//! An in-process broker with the routing and settlement semantics the
//! pipeline relies on.
//!
//! Supports direct and fanout exchanges, the default exchange, alternate
//! exchanges for unroutable messages, dead-lettering on reject without
//! requeue, prefetch-bounded dispatch, publisher confirms and redelivery of
//! unacknowledged messages when a channel goes away. Opened on a directory it
//! keeps durable topology and persistent messages in a `MessageStore`, and
//! confirms a persistent publish only after it has been flushed.

mod channel;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

pub use channel::MemoryChannel;
use channel::ChannelCore;

use crate::broker::channel::{BrokerChannel, BrokerError, Connector};
use crate::broker::envelope::Envelope;
use crate::broker::topology::{BindingSpec, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::persistence::{MessageStore, StoreError, StoredEnvelope};

pub const FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
pub const FIRST_DEATH_REASON: &str = "x-first-death-reason";
pub const FIRST_DEATH_EXCHANGE: &str = "x-first-death-exchange";

const MAX_ALTERNATE_HOPS: usize = 8;

/// How the broker answers publisher confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    Ack,
    Nack,
    /// Never answer; the confirm future stays pending.
    Withhold,
}

/// Declared topology at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub exchanges: BTreeMap<String, ExchangeSpec>,
    pub queues: BTreeMap<String, QueueSpec>,
    pub bindings: BTreeSet<BindingSpec>,
}

#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<BrokerState>,
    store: Mutex<Option<MessageStore>>,
    reachable: AtomicBool,
    confirm_mode: Mutex<ConfirmMode>,
    channels: Mutex<Vec<Weak<ChannelCore>>>,
    connection_attempts: AtomicUsize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
    next_message_id: u64,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredEnvelope>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

impl MemoryBroker {
    /// A broker that keeps everything in memory.
    pub fn new() -> Self {
        Self::with_state(BrokerState::default(), None)
    }

    /// A broker backed by the store under `path`, restoring whatever durable
    /// topology and persistent messages it holds.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let store = MessageStore::open(path).map_err(persistence_error)?;
        let state = restore(&store).map_err(persistence_error)?;
        Ok(Self::with_state(state, Some(store)))
    }

    fn with_state(state: BrokerState, store: Option<MessageStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                store: Mutex::new(store),
                reachable: AtomicBool::new(true),
                confirm_mode: Mutex::new(ConfirmMode::Ack),
                channels: Mutex::new(Vec::new()),
                connection_attempts: AtomicUsize::new(0),
            }),
        }
    }

    pub fn channel(&self) -> Result<Arc<MemoryChannel>, BrokerError> {
        self.shared.connection_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("connection refused".to_string()));
        }
        let core = ChannelCore::new();
        let mut channels = lock(&self.shared.channels);
        channels.retain(|weak| weak.upgrade().is_some_and(|open| !open.is_closed()));
        channels.push(Arc::downgrade(&core));
        drop(channels);
        Ok(Arc::new(MemoryChannel::new(self.shared.clone(), core)))
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        *lock(&self.shared.confirm_mode) = mode;
    }

    /// Number of times a channel was requested, successful or not.
    pub fn connection_attempts(&self) -> usize {
        self.shared.connection_attempts.load(Ordering::SeqCst)
    }

    /// Sever every open channel, as a network failure would. Unacknowledged
    /// deliveries go back to their queues flagged as redelivered.
    pub fn drop_connections(&self) {
        let cores: Vec<Arc<ChannelCore>> = lock(&self.shared.channels)
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();
        for core in cores {
            self.shared.close_channel(&core);
        }
    }

    /// Stop the broker: sever channels, refuse new ones and release the store
    /// so the same directory can be opened again.
    pub fn shutdown(&self) {
        self.set_reachable(false);
        self.drop_connections();
        if let Some(store) = lock(&self.shared.store).take() {
            let _ = store.flush();
        }
    }

    pub fn unbind(&self, binding: &BindingSpec) {
        lock(&self.shared.state).bindings.retain(|b| b != binding);
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let state = lock(&self.shared.state);
        TopologySnapshot {
            exchanges: state
                .exchanges
                .iter()
                .map(|(name, spec)| (name.clone(), spec.clone()))
                .collect(),
            queues: state
                .queues
                .iter()
                .map(|(name, queue)| (name.clone(), queue.spec.clone()))
                .collect(),
            bindings: state.bindings.iter().cloned().collect(),
        }
    }

    /// Ready (not yet delivered) messages in `queue`, or `None` if it does not exist.
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        lock(&self.shared.state).queues.get(queue).map(|q| q.ready.len())
    }

    pub fn peek(&self, queue: &str) -> Vec<Envelope> {
        lock(&self.shared.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    /// Channels the broker still tracks for `drop_connections`.
    pub fn tracked_channels(&self) -> usize {
        lock(&self.shared.channels).len()
    }

    /// Deliveries handed out and not yet settled, across all open channels.
    pub fn unacked(&self) -> usize {
        lock(&self.shared.channels)
            .iter()
            .filter_map(Weak::upgrade)
            .map(|core| core.unacked_len())
            .sum()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("bindings", &state.bindings.len())
            .field("reachable", &self.shared.reachable.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel: Arc<dyn BrokerChannel> = self.channel()?;
        Ok(channel)
    }
}

impl Shared {
    fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if let Some(existing) = state.exchanges.get(&spec.name) {
            return ensure_equivalent("exchange", &spec.name, existing == spec);
        }
        if spec.durable {
            self.persist(|store| store.save_exchange(spec))?;
        }
        state.exchanges.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if let Some(existing) = state.queues.get(&spec.name) {
            return ensure_equivalent("queue", &spec.name, existing.spec == *spec);
        }
        if spec.durable {
            self.persist(|store| store.save_queue(spec))?;
        }
        state
            .queues
            .insert(spec.name.clone(), QueueState::new(spec.clone()));
        Ok(())
    }

    fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        let exchange_durable = state
            .exchanges
            .get(&binding.exchange)
            .map(|e| e.durable)
            .ok_or_else(|| BrokerError::not_found("exchange", &binding.exchange))?;
        let queue_durable = state
            .queues
            .get(&binding.queue)
            .map(|q| q.spec.durable)
            .ok_or_else(|| BrokerError::not_found("queue", &binding.queue))?;
        if state.bindings.contains(binding) {
            return Ok(());
        }
        if exchange_durable && queue_durable {
            self.persist(|store| store.save_binding(binding))?;
        }
        state.bindings.push(binding.clone());
        Ok(())
    }

    /// Route and enqueue a published message. Returns whether anything was
    /// written to the store.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<bool, BrokerError> {
        let mut state = lock(&self.state);
        let targets = state.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }
        let mut persisted = false;
        for queue in targets {
            persisted |= self.enqueue(&mut state, &queue, exchange, routing_key, envelope.clone())?;
        }
        Ok(persisted)
    }

    fn enqueue(
        &self,
        state: &mut BrokerState,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<bool, BrokerError> {
        state.next_message_id += 1;
        let message = StoredEnvelope {
            id: state.next_message_id,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
            envelope,
        };
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::not_found("queue", queue))?;

        let persisted = self.persist_if_durable(&target.spec, &message)?;
        target.ready.push_back(message);
        target.notify.notify_waiters();
        Ok(persisted)
    }

    /// Put settled-with-requeue deliveries back at the head of their queues.
    /// `messages` must be in delivery order.
    fn requeue(&self, messages: Vec<(String, StoredEnvelope)>) {
        let mut state = lock(&self.state);
        self.requeue_locked(&mut state, messages);
    }

    fn requeue_locked(&self, state: &mut BrokerState, messages: Vec<(String, StoredEnvelope)>) {
        for (queue, mut message) in messages.into_iter().rev() {
            message.redelivered = true;
            if let Some(target) = state.queues.get_mut(&queue) {
                if let Err(e) = self.persist_if_durable(&target.spec, &message) {
                    debug!(queue = %queue, error = %e, "failed to persist redelivery flag");
                }
                target.ready.push_front(message);
                target.notify.notify_waiters();
            }
        }
    }

    fn forget(&self, queue: &str, message: &StoredEnvelope) -> Result<(), BrokerError> {
        if message.envelope.is_persistent() {
            self.persist(|store| store.remove_message(queue, message.id))?;
        }
        Ok(())
    }

    /// Move a rejected delivery to its queue's dead-letter exchange, or drop
    /// it when none is configured. The original is forgotten only once the
    /// dead-lettered copy is enqueued and flushed.
    fn dead_letter(&self, queue: &str, message: &StoredEnvelope) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        let Some(dlx) = state
            .queues
            .get(queue)
            .and_then(|q| q.spec.dead_letter_exchange())
            .map(str::to_string)
        else {
            drop(state);
            debug!(queue, "rejected message has no dead-letter exchange, dropped");
            return self.forget(queue, message);
        };

        let envelope = message
            .envelope
            .clone()
            .with_header(FIRST_DEATH_QUEUE, queue)
            .with_header(FIRST_DEATH_REASON, "rejected")
            .with_header(FIRST_DEATH_EXCHANGE, message.exchange.as_str());
        let targets = state.route(&dlx, &message.routing_key)?;
        let mut persisted = false;
        for target in targets {
            persisted |=
                self.enqueue(&mut state, &target, &dlx, &message.routing_key, envelope.clone())?;
        }
        drop(state);

        if persisted {
            self.flush()?;
        }
        self.forget(queue, message)
    }

    fn close_channel(&self, core: &ChannelCore) {
        if !core.mark_closed() {
            return;
        }
        // Dispatchers check the closed flag under the state lock, so nothing
        // can be handed out on this channel once the drain below starts.
        let mut state = lock(&self.state);
        let unacked = core.drain_unacked();
        self.requeue_locked(&mut state, unacked);
    }

    fn confirm_mode(&self) -> ConfirmMode {
        *lock(&self.confirm_mode)
    }

    fn flush(&self) -> Result<(), BrokerError> {
        self.persist(|store| store.flush())
    }

    fn persist_if_durable(
        &self,
        spec: &QueueSpec,
        message: &StoredEnvelope,
    ) -> Result<bool, BrokerError> {
        if !(spec.durable && message.envelope.is_persistent()) {
            return Ok(false);
        }
        let stored = lock(&self.store).is_some();
        self.persist(|store| store.put_message(&spec.name, message))?;
        Ok(stored)
    }

    fn persist(
        &self,
        write: impl FnOnce(&MessageStore) -> Result<(), StoreError>,
    ) -> Result<(), BrokerError> {
        match lock(&self.store).as_ref() {
            Some(store) => write(store).map_err(persistence_error),
            None => Ok(()),
        }
    }
}

impl BrokerState {
    /// Queues a message published to `exchange` with `routing_key` lands in,
    /// following alternate exchanges when nothing matches.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let mut current = exchange;
        for _ in 0..MAX_ALTERNATE_HOPS {
            let spec = self
                .exchanges
                .get(current)
                .ok_or_else(|| BrokerError::not_found("exchange", current))?;

            let mut matched: Vec<String> = self
                .bindings
                .iter()
                .filter(|b| b.exchange == current)
                .filter(|b| spec.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect();
            if !matched.is_empty() {
                matched.sort();
                matched.dedup();
                return Ok(matched);
            }

            match spec.alternate_exchange() {
                Some(alternate) if self.exchanges.contains_key(alternate) => current = alternate,
                _ => return Ok(Vec::new()),
            }
        }
        Ok(Vec::new())
    }
}

fn restore(store: &MessageStore) -> Result<BrokerState, StoreError> {
    let mut state = BrokerState::default();
    for spec in store.exchanges()? {
        state.exchanges.insert(spec.name.clone(), spec);
    }
    for spec in store.queues()? {
        let mut queue = QueueState::new(spec.clone());
        for message in store.messages(&spec.name)? {
            state.next_message_id = state.next_message_id.max(message.id);
            queue.ready.push_back(message);
        }
        state.queues.insert(spec.name.clone(), queue);
    }
    state.bindings = store.bindings()?;
    Ok(state)
}

fn ensure_equivalent(kind: &str, name: &str, equivalent: bool) -> Result<(), BrokerError> {
    if equivalent {
        Ok(())
    } else {
        Err(BrokerError::PreconditionFailed(format!(
            "inequivalent arguments for {kind} '{name}'"
        )))
    }
}

fn persistence_error(error: StoreError) -> BrokerError {
    BrokerError::Persistence(error.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests;
