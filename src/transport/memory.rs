//! # In-process broker.
//!
//! [`MemoryBroker`] implements the [`Connection`] contract entirely in memory:
//! exchanges (direct/fanout/topic), queues, bindings, per-subscription prefetch,
//! acknowledgement and requeue. It is the reference transport for tests and demos.
//!
//! ## Architecture
//! ```text
//! MemoryPublisher ──► route(exchange, key) ──► Queue[pending] ──notify──► pump task
//!                                                   ▲                       │ (prefetch permit)
//!                                                   │ requeue on nack/drop  ▼
//!                                              MemoryAcker ◄── Message ── mpsc ──► MessageStream
//! ```
//!
//! ## Rules
//! - The default exchange `""` routes to the queue named by the routing key.
//! - Unroutable messages are dropped (counted by [`MemoryBroker::unroutable`]).
//! - `nack` and dropping an unsettled message both requeue it at the front,
//!   flagged as redelivered.
//! - Prefetch `n > 0` bounds unsettled deliveries per subscription to `n`.
//! - After [`Connection::close`], every pump stops and its stream closes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::transport::{
    Acknowledge, Connection, ExchangeKind, Message, MessageStream, OutgoingMessage, Publisher,
    Subscriber, SubscriberRef, TopologyStrategy, TransportConfig, topic,
};

/// Stream buffer used when prefetch is unbounded.
const UNBOUNDED_BUFFER: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters of a single queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages routed into the queue by publishers.
    pub enqueued: u64,
    /// Deliveries handed to subscribers (redeliveries included).
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    /// Deliveries flagged as redelivered.
    pub redelivered: u64,
    /// Messages waiting in the queue.
    pub depth: usize,
}

#[derive(Clone, Debug)]
struct Envelope {
    id: String,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Envelope>,
    stats: QueueStats,
}

struct Queue {
    durable: bool,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn push(&self, env: Envelope) {
        {
            let mut st = lock(&self.state);
            st.stats.enqueued += 1;
            st.pending.push_back(env);
        }
        self.notify.notify_one();
    }

    fn requeue(&self, mut env: Envelope) {
        env.redelivered = true;
        lock(&self.state).pending.push_front(env);
        self.notify.notify_one();
    }

    /// Waits for the next pending envelope. Cancel-safe.
    async fn next(&self) -> Envelope {
        loop {
            if let Some(env) = self.pop() {
                return env;
            }
            self.notify.notified().await;
        }
    }

    fn pop(&self) -> Option<Envelope> {
        let mut st = lock(&self.state);
        let env = st.pending.pop_front()?;
        st.stats.delivered += 1;
        if env.redelivered {
            st.stats.redelivered += 1;
        }
        Some(env)
    }

    fn stats(&self) -> QueueStats {
        let st = lock(&self.state);
        QueueStats {
            depth: st.pending.len(),
            ..st.stats
        }
    }
}

struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    /// `(binding key, queue name)`
    bindings: Vec<(String, String)>,
}

impl Exchange {
    fn routes<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.bindings
            .iter()
            .filter(move |(pattern, _)| match self.kind {
                ExchangeKind::Direct => pattern == key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic::matches(pattern, key),
            })
            .map(|(_, queue)| queue.as_str())
    }
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<Queue>>,
}

impl Topology {
    fn declare_exchange(
        &mut self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        match self.exchanges.get(name) {
            Some(ex) if ex.kind != kind || ex.durable != durable => {
                Err(TransportError::invalid(format!(
                    "exchange {name:?} redeclared with different arguments"
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(&mut self, name: &str, durable: bool) -> Result<Arc<Queue>, TransportError> {
        match self.queues.get(name) {
            Some(q) if q.durable != durable => Err(TransportError::invalid(format!(
                "queue {name:?} redeclared with different arguments"
            ))),
            Some(q) => Ok(Arc::clone(q)),
            None => {
                let q = Arc::new(Queue::new(durable));
                self.queues.insert(name.to_string(), Arc::clone(&q));
                Ok(q)
            }
        }
    }

    fn bind(&mut self, exchange: &str, queue: &str, key: &str) -> Result<(), TransportError> {
        let ex = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| not_found("exchange", exchange))?;
        if !ex.bindings.iter().any(|(k, q)| k == key && q == queue) {
            ex.bindings.push((key.to_string(), queue.to_string()));
        }
        Ok(())
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>, TransportError> {
        self.queues
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("queue", name))
    }
}

fn not_found(entity: &'static str, name: &str) -> TransportError {
    TransportError::NotFound {
        entity,
        name: name.to_string(),
    }
}

struct Inner {
    topology: Mutex<Topology>,
    closed: CancellationToken,
    confirm_failure: Mutex<Option<String>>,
    open_publishers: AtomicUsize,
    unroutable: AtomicU64,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Declares (or checks) the topology of a subscription and returns its queue.
    fn prepare_subscription(&self, cfg: &TransportConfig) -> Result<Arc<Queue>, TransportError> {
        let mut topo = lock(&self.topology);
        let queue_name = cfg.queue_name();
        let exchange = cfg.exchange.as_ref().filter(|e| !e.name.is_empty());

        match cfg.topology() {
            TopologyStrategy::Declare => {
                let durable = cfg.queue.as_ref().is_some_and(|q| q.durable);
                let queue = topo.declare_queue(queue_name, durable)?;
                if let Some(ex) = exchange {
                    topo.declare_exchange(&ex.name, ex.kind, ex.durable)?;
                    topo.bind(&ex.name, queue_name, cfg.routing_key())?;
                }
                Ok(queue)
            }
            TopologyStrategy::Existing => {
                if let Some(ex) = exchange
                    && !topo.exchanges.contains_key(&ex.name)
                {
                    return Err(not_found("exchange", &ex.name));
                }
                topo.queue(queue_name)
            }
        }
    }

    fn route(&self, cfg: &TransportConfig, msg: OutgoingMessage) -> Result<(), TransportError> {
        let mut topo = lock(&self.topology);
        let key = cfg.routing_key();

        let targets: Vec<Arc<Queue>> = match cfg.exchange.as_ref().filter(|e| !e.name.is_empty()) {
            None => topo.queues.get(key).cloned().into_iter().collect(),
            Some(ex) => {
                match cfg.topology() {
                    TopologyStrategy::Declare => {
                        topo.declare_exchange(&ex.name, ex.kind, ex.durable)?
                    }
                    TopologyStrategy::Existing if !topo.exchanges.contains_key(&ex.name) => {
                        return Err(not_found("exchange", &ex.name));
                    }
                    TopologyStrategy::Existing => {}
                }
                let mut names: Vec<&str> = topo
                    .exchanges
                    .get(&ex.name)
                    .map(|e| e.routes(key).collect())
                    .unwrap_or_default();
                names.sort_unstable();
                names.dedup();
                names
                    .into_iter()
                    .filter_map(|n| topo.queues.get(n).cloned())
                    .collect()
            }
        };

        if targets.is_empty() {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        for q in targets {
            q.push(Envelope {
                id: msg.id.clone(),
                payload: msg.payload.clone(),
                redelivered: false,
            });
        }
        Ok(())
    }
}

/// In-process broker implementing [`Connection`].
///
/// Cheap to clone; clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates an empty, open broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                topology: Mutex::new(Topology::default()),
                closed: CancellationToken::new(),
                confirm_failure: Mutex::new(None),
                open_publishers: AtomicUsize::new(0),
                unroutable: AtomicU64::new(0),
            }),
        }
    }

    /// Declares an exchange ahead of use.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        lock(&self.inner.topology).declare_exchange(name, kind, durable)
    }

    /// Declares a queue ahead of use.
    pub fn declare_queue(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        lock(&self.inner.topology)
            .declare_queue(name, durable)
            .map(|_| ())
    }

    /// Binds `queue` to `exchange` with `key`.
    pub fn bind(&self, exchange: &str, queue: &str, key: &str) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        lock(&self.inner.topology).bind(exchange, queue, key)
    }

    /// Returns the counters of `queue`, if it exists.
    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        lock(&self.inner.topology).queues.get(queue).map(|q| q.stats())
    }

    /// Makes every confirmed publish fail with `reason` (`None` restores normal behavior).
    pub fn fail_confirms(&self, reason: Option<&str>) {
        *lock(&self.inner.confirm_failure) = reason.map(str::to_string);
    }

    /// Number of publishers created and not yet closed.
    pub fn open_publishers(&self) -> usize {
        self.inner.open_publishers.load(Ordering::Acquire)
    }

    /// Number of published messages that matched no queue.
    pub fn unroutable(&self) -> u64 {
        self.inner.unroutable.load(Ordering::Relaxed)
    }

    /// Returns true once the broker was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for MemoryBroker {
    fn new_subscriber(&self, cfg: &TransportConfig) -> Result<SubscriberRef, TransportError> {
        self.inner.ensure_open()?;
        cfg.validate_binding()?;
        Ok(Arc::new(MemorySubscriber {
            inner: Arc::clone(&self.inner),
            cfg: cfg.clone(),
        }))
    }

    fn new_publisher(&self, cfg: &TransportConfig) -> Result<Box<dyn Publisher>, TransportError> {
        self.inner.ensure_open()?;
        cfg.validate_publish()?;
        self.inner.open_publishers.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemoryPublisher {
            inner: Arc::clone(&self.inner),
            cfg: cfg.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        self.inner.closed.cancel();
        Ok(())
    }
}

/// Subscription over one memory queue.
struct MemorySubscriber {
    inner: Arc<Inner>,
    cfg: TransportConfig,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&self, token: CancellationToken) -> Result<MessageStream, TransportError> {
        self.inner.ensure_open()?;
        let queue = self.inner.prepare_subscription(&self.cfg)?;

        let prefetch = self.cfg.prefetch.unwrap_or(0) as usize;
        let (semaphore, buffer) = match prefetch {
            0 => (None, UNBOUNDED_BUFFER),
            n => (Some(Arc::new(Semaphore::new(n))), n),
        };
        let (tx, rx) = mpsc::channel(buffer);
        let closed = self.inner.closed.clone();

        tokio::spawn(pump(queue, tx, semaphore, token, closed));
        Ok(rx)
    }
}

/// Moves envelopes from `queue` into the subscription stream.
async fn pump(
    queue: Arc<Queue>,
    tx: mpsc::Sender<Message>,
    semaphore: Option<Arc<Semaphore>>,
    token: CancellationToken,
    closed: CancellationToken,
) {
    loop {
        let permit = match &semaphore {
            Some(sem) => tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = closed.cancelled() => break,
                p = Arc::clone(sem).acquire_owned() => match p {
                    Ok(p) => Some(p),
                    Err(_closed) => break,
                },
            },
            None => None,
        };

        let env = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = closed.cancelled() => break,
            env = queue.next() => env,
        };

        let msg = Message::new(
            env.id.clone(),
            env.payload.clone(),
            MemoryAcker {
                queue: Arc::clone(&queue),
                envelope: Mutex::new(Some(env.clone())),
                permit: Mutex::new(permit),
            },
        )
        .with_redelivered(env.redelivered);

        // A message dropped here (cancelled or receiver gone) is requeued by its acker.
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = closed.cancelled() => break,
            sent = tx.send(msg) => if sent.is_err() { break },
        }
    }
}

/// Settles one delivery of a memory queue.
struct MemoryAcker {
    queue: Arc<Queue>,
    envelope: Mutex<Option<Envelope>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryAcker {
    fn settle(&self) -> Option<Envelope> {
        let env = lock(&self.envelope).take();
        lock(&self.permit).take();
        env
    }
}

impl Acknowledge for MemoryAcker {
    fn ack(&self) {
        if self.settle().is_some() {
            lock(&self.queue.state).stats.acked += 1;
        }
    }

    fn nack(&self) {
        if let Some(env) = self.settle() {
            lock(&self.queue.state).stats.nacked += 1;
            self.queue.requeue(env);
        }
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(env) = self.settle() {
            self.queue.requeue(env);
        }
    }
}

/// Publisher bound to a memory broker.
struct MemoryPublisher {
    inner: Arc<Inner>,
    cfg: TransportConfig,
    closed: AtomicBool,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, msg: OutgoingMessage) -> Result<(), TransportError> {
        self.inner.ensure_open()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.cfg.confirm == Some(true)
            && let Some(reason) = lock(&self.inner.confirm_failure).clone()
        {
            return Err(TransportError::Rejected { reason });
        }
        self.inner.route(&self.cfg, msg)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Closed);
        }
        self.inner.open_publishers.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}
