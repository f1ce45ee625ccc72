//! Message broker client — exchanges, queues, publish, consume with ack.
//!
//! Two exchanges exist by contract: `tasks` (routing key = target agent id)
//! and `events` (routing key = event type), each with a dead-letter twin.
//! `publish` returns only after the broker accepted the message or a
//! transport error survived the retry budget. A consumer's callback return
//! acknowledges each delivery: the first nack redelivers once, the second
//! routes the message to the dead-letter exchange.
//!
//! The in-process [`MemoryBroker`] is the reference transport and the test
//! substrate; the [`Broker`] trait carries the full wire contract so a
//! remote transport can be slotted in behind `RABBITMQ_URL` without
//! touching callers.

use crate::error::BrokerError;
use crate::message::Message;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Unicast exchange: routing key = target agent id.
pub const TASKS_EXCHANGE: &str = "tasks";
/// Fanout exchange: routing key = event type.
pub const EVENTS_EXCHANGE: &str = "events";
/// Suffix of each exchange's dead-letter twin.
pub const DLQ_SUFFIX: &str = ".dlq";

/// Exchange routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes on exact routing-key match.
    Topic,
}

/// Acknowledgement decision returned by a consumer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Message handled; remove it.
    Ack,
    /// Message not handled; redeliver once, then dead-letter.
    Nack,
}

/// Consumer callback. Runs once per delivery; its return is the ack.
pub type ConsumerCallback = Arc<dyn Fn(Message) -> BoxFuture<'static, Ack> + Send + Sync>;

/// Capped exponential backoff for publish retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub attempts: usize,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16) as u32;
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// A policy with no sleeping, for tests.
    pub fn immediate(attempts: usize) -> Self {
        Self {
            base: Duration::ZERO,
            cap: Duration::ZERO,
            attempts,
        }
    }
}

/// Cancels one consume loop. The queue becomes consumable again after the
/// loop observes the cancellation.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    queue: String,
    token: CancellationToken,
}

impl ConsumerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// Broker client contract.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Synchronous from the caller's view: returns after the broker accepts
    /// the message or a transport error survives the retry budget.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError>;

    /// Start delivering `queue` to `callback`, at most `prefetch` in flight.
    async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
        callback: ConsumerCallback,
    ) -> Result<ConsumerHandle, BrokerError>;

    /// Undelivered depth of a queue.
    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError>;
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct DeliveryFrame {
    message: Message,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct QueueState {
    tx: mpsc::UnboundedSender<DeliveryFrame>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryFrame>>>,
    depth: AtomicUsize,
}

impl QueueState {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            depth: AtomicUsize::new(0),
        }
    }

    fn enqueue(&self, frame: DeliveryFrame) -> Result<(), BrokerError> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(frame).map_err(|_| BrokerError::Transport {
            message: "queue receiver dropped".into(),
        })
    }
}

struct ExchangeState {
    #[allow(dead_code)]
    kind: ExchangeKind,
    /// (queue, routing_key) bindings.
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, Arc<QueueState>>,
}

struct BrokerInner {
    connected: AtomicBool,
    topology: Mutex<Topology>,
    backoff: BackoffPolicy,
}

impl BrokerInner {
    /// Route a frame: enqueue on every bound queue with a matching key.
    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        redelivered: bool,
    ) -> Result<usize, BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        let topology = lock(&self.topology);
        let ex = topology
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange {
                name: exchange.to_string(),
            })?;

        let mut delivered = 0;
        for (queue, binding_key) in &ex.bindings {
            if binding_key != routing_key {
                continue;
            }
            if let Some(state) = topology.queues.get(queue) {
                state.enqueue(DeliveryFrame {
                    message: message.clone(),
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered,
                })?;
                delivered += 1;
            }
        }
        if delivered == 0 {
            trace!(exchange, routing_key, "no bound queue, message dropped");
        }
        Ok(delivered)
    }

    /// Route a rejected frame to the origin exchange's dead-letter twin.
    fn dead_letter(&self, frame: DeliveryFrame) {
        let dlq_exchange = format!("{}{}", frame.exchange, DLQ_SUFFIX);
        match self.route(&dlq_exchange, &frame.routing_key, &frame.message, true) {
            Ok(_) => warn!(
                message_id = %frame.message.message_id,
                exchange = %dlq_exchange,
                "message dead-lettered"
            ),
            Err(e) => warn!(
                message_id = %frame.message.message_id,
                error = %e,
                "dead-letter routing failed, message dropped"
            ),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process topic broker backed by per-queue channels.
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_backoff(BackoffPolicy::default())
    }

    pub fn with_backoff(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                connected: AtomicBool::new(false),
                topology: Mutex::new(Topology::default()),
                backoff,
            }),
        }
    }

    /// Declare the standard topology: both exchanges and their dead-letter
    /// twins.
    pub async fn declare_standard_topology(&self) -> Result<(), BrokerError> {
        for exchange in [
            TASKS_EXCHANGE.to_string(),
            EVENTS_EXCHANGE.to_string(),
            format!("{TASKS_EXCHANGE}{DLQ_SUFFIX}"),
            format!("{EVENTS_EXCHANGE}{DLQ_SUFFIX}"),
        ] {
            self.declare_exchange(&exchange, ExchangeKind::Topic).await?;
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.inner.connected.store(true, Ordering::SeqCst);
        debug!("broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        debug!("broker disconnected");
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let mut topology = lock(&self.inner.topology);
        topology
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new()));
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut topology = lock(&self.inner.topology);
        topology
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut topology = lock(&self.inner.topology);
        if !topology.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue {
                name: queue.to_string(),
            });
        }
        let ex = topology
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange {
                name: exchange.to_string(),
            })?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError> {
        let policy = self.inner.backoff;
        let mut last_error = BrokerError::NotConnected;
        for attempt in 0..policy.attempts {
            match self.inner.route(exchange, routing_key, message, false) {
                Ok(_) => return Ok(()),
                // Topology errors are configuration, not transport: no retry.
                Err(e @ BrokerError::UnknownExchange { .. }) => return Err(e),
                Err(e) => {
                    last_error = e;
                    if attempt + 1 < policy.attempts {
                        tokio::time::sleep(policy.delay(attempt)).await;
                    }
                }
            }
        }
        Err(BrokerError::PublishFailed {
            exchange: exchange.to_string(),
            attempts: policy.attempts,
            message: last_error.to_string(),
        })
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: usize,
        callback: ConsumerCallback,
    ) -> Result<ConsumerHandle, BrokerError> {
        let state = {
            let topology = lock(&self.inner.topology);
            topology
                .queues
                .get(queue)
                .cloned()
                .ok_or_else(|| BrokerError::UnknownQueue {
                    name: queue.to_string(),
                })?
        };
        let mut rx = lock(&state.rx)
            .take()
            .ok_or_else(|| BrokerError::ConsumerExists {
                name: queue.to_string(),
            })?;

        let token = CancellationToken::new();
        let handle = ConsumerHandle {
            queue: queue.to_string(),
            token: token.clone(),
        };

        let inner = self.inner.clone();
        let permits = Arc::new(Semaphore::new(prefetch.max(1)));
        let queue_name = queue.to_string();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                state.depth.fetch_sub(1, Ordering::SeqCst);

                // Prefetch bound: stop pulling while the pool is saturated,
                // so sustained load accumulates in the broker.
                let permit = tokio::select! {
                    _ = token.cancelled() => {
                        // Stopping: hand the in-flight frame back.
                        let _ = state.enqueue(frame);
                        break;
                    }
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let callback = callback.clone();
                let inner = inner.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    let redelivered = frame.redelivered;
                    let ack = callback(frame.message.clone()).await;
                    match ack {
                        Ack::Ack => {}
                        Ack::Nack if !redelivered => {
                            debug!(message_id = %frame.message.message_id, "nack, redelivering once");
                            let _ = state.enqueue(DeliveryFrame {
                                redelivered: true,
                                ..frame
                            });
                        }
                        Ack::Nack => inner.dead_letter(frame),
                    }
                    drop(permit);
                });
            }
            // Return the receiver so the queue can be consumed again.
            *lock(&state.rx) = Some(rx);
            debug!(queue = %queue_name, "consumer stopped");
        });

        Ok(handle)
    }

    async fn queue_depth(&self, queue: &str) -> Result<usize, BrokerError> {
        let topology = lock(&self.inner.topology);
        topology
            .queues
            .get(queue)
            .map(|q| q.depth.load(Ordering::SeqCst))
            .ok_or_else(|| BrokerError::UnknownQueue {
                name: queue.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc as tokio_mpsc;

    async fn standard_broker() -> MemoryBroker {
        let broker = MemoryBroker::with_backoff(BackoffPolicy::immediate(5));
        broker.connect().await.unwrap();
        broker.declare_standard_topology().await.unwrap();
        broker
    }

    fn collector() -> (ConsumerCallback, tokio_mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let callback: ConsumerCallback = Arc::new(move |msg: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
                Ack::Ack
            }
            .boxed()
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn test_publish_routes_on_exact_key() {
        let broker = standard_broker().await;
        broker.declare_queue("agent_a").await.unwrap();
        broker
            .bind_queue("agent_a", TASKS_EXCHANGE, "agent_a")
            .await
            .unwrap();

        let (callback, mut rx) = collector();
        broker.consume("agent_a", 4, callback).await.unwrap();

        let msg = Message::task("api", "agent_a", "ping", json!({}));
        broker.publish(TASKS_EXCHANGE, "agent_a", &msg).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.message_id, msg.message_id);

        // A different routing key does not reach the queue.
        let other = Message::task("api", "agent_b", "ping", json!({}));
        broker.publish(TASKS_EXCHANGE, "agent_b", &other).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_event_fanout_to_multiple_queues() {
        let broker = standard_broker().await;
        for queue in ["q1", "q2"] {
            broker.declare_queue(queue).await.unwrap();
            broker
                .bind_queue(queue, EVENTS_EXCHANGE, "content.published")
                .await
                .unwrap();
        }
        let (cb1, mut rx1) = collector();
        let (cb2, mut rx2) = collector();
        broker.consume("q1", 4, cb1).await.unwrap();
        broker.consume("q2", 4, cb2).await.unwrap();

        let event = Message::event("content_ad", "content.published", json!({"id": "c1"}));
        broker
            .publish(EVENTS_EXCHANGE, "content.published", &event)
            .await
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap().message_id, event.message_id);
        assert_eq!(rx2.recv().await.unwrap().message_id, event.message_id);
    }

    #[tokio::test]
    async fn test_publish_unknown_exchange_fails_fast() {
        let broker = standard_broker().await;
        let msg = Message::event("x", "e", json!({}));
        let result = broker.publish("nonexistent", "e", &msg).await;
        assert!(matches!(result, Err(BrokerError::UnknownExchange { .. })));
    }

    #[tokio::test]
    async fn test_publish_disconnected_exhausts_retries() {
        let broker = MemoryBroker::with_backoff(BackoffPolicy::immediate(3));
        broker.declare_standard_topology().await.unwrap();
        let msg = Message::event("x", "e", json!({}));
        let result = broker.publish(EVENTS_EXCHANGE, "e", &msg).await;
        assert!(matches!(
            result,
            Err(BrokerError::PublishFailed { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_nack_redelivers_once_then_dead_letters() {
        let broker = standard_broker().await;
        broker.declare_queue("agent_a").await.unwrap();
        broker
            .bind_queue("agent_a", TASKS_EXCHANGE, "agent_a")
            .await
            .unwrap();
        // Catch-all DLQ queue bound on the same routing key.
        broker.declare_queue("dlq").await.unwrap();
        broker
            .bind_queue("dlq", &format!("{TASKS_EXCHANGE}{DLQ_SUFFIX}"), "agent_a")
            .await
            .unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_cb = attempts.clone();
        let callback: ConsumerCallback = Arc::new(move |_msg: Message| {
            let attempts = attempts_in_cb.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ack::Nack
            }
            .boxed()
        });
        broker.consume("agent_a", 4, callback).await.unwrap();

        let (dlq_cb, mut dlq_rx) = collector();
        broker.consume("dlq", 4, dlq_cb).await.unwrap();

        let msg = Message::task("api", "agent_a", "boom", json!({}));
        broker.publish(TASKS_EXCHANGE, "agent_a", &msg).await.unwrap();

        let dead = tokio::time::timeout(Duration::from_secs(1), dlq_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dead.message_id, msg.message_id);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_consumer_rejected_until_cancel() {
        let broker = standard_broker().await;
        broker.declare_queue("q").await.unwrap();
        let (cb, _rx) = collector();
        let handle = broker.consume("q", 1, cb.clone()).await.unwrap();
        assert!(matches!(
            broker.consume("q", 1, cb.clone()).await,
            Err(BrokerError::ConsumerExists { .. })
        ));

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(broker.consume("q", 1, cb).await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_depth_tracks_undelivered() {
        let broker = standard_broker().await;
        broker.declare_queue("q").await.unwrap();
        broker.bind_queue("q", EVENTS_EXCHANGE, "e").await.unwrap();

        for _ in 0..3 {
            let msg = Message::event("x", "e", json!({}));
            broker.publish(EVENTS_EXCHANGE, "e", &msg).await.unwrap();
        }
        assert_eq!(broker.queue_depth("q").await.unwrap(), 3);

        let (cb, mut rx) = collector();
        broker.consume("q", 4, cb).await.unwrap();
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.queue_depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_inflight_callbacks() {
        let broker = standard_broker().await;
        broker.declare_queue("q").await.unwrap();
        broker.bind_queue("q", EVENTS_EXCHANGE, "e").await.unwrap();

        let inflight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (inflight_cb, max_cb) = (inflight.clone(), max_seen.clone());
        let callback: ConsumerCallback = Arc::new(move |_msg: Message| {
            let inflight = inflight_cb.clone();
            let max_seen = max_cb.clone();
            async move {
                let now = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                inflight.fetch_sub(1, Ordering::SeqCst);
                Ack::Ack
            }
            .boxed()
        });
        broker.consume("q", 2, callback).await.unwrap();

        for _ in 0..8 {
            let msg = Message::event("x", "e", json!({}));
            broker.publish(EVENTS_EXCHANGE, "e", &msg).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        assert_eq!(inflight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backoff_policy_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
    }
}
