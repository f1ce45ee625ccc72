//! Base agent runtime — lifecycle, dispatch, correlation, send primitives.
//!
//! Each concrete agent owns a [`BaseAgent`] (composition, not inheritance):
//! a handler registry keyed by task/event type, a consume loop bound to the
//! agent's queue, per-handler circuit breakers, response correlation with
//! per-message wait channels, and periodic timers started by `start()` and
//! cancelled by `stop()`.

use crate::broker::{
    Ack, Broker, ConsumerCallback, ConsumerHandle, DLQ_SUFFIX, EVENTS_EXCHANGE, ExchangeKind,
    TASKS_EXCHANGE,
};
use crate::error::{AgentError, TaskError};
use crate::message::{Envelope, Message, ResponseStatus};
use crate::runtime::circuit::{CircuitBreaker, CircuitBreakerConfig};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Runtime knobs for one agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Stable agent id; also the agent's queue name and routing key.
    pub agent_id: String,
    pub name: String,
    /// Bound on concurrent handler invocations (and broker prefetch).
    pub handler_pool_size: usize,
    /// Default wait for `send_task` responses.
    pub response_timeout: Duration,
    /// How long `stop()` waits for in-flight handlers before cancelling.
    pub drain_grace: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            handler_pool_size: 32,
            response_timeout: Duration::from_secs(30),
            drain_grace: Duration::from_secs(10),
            breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.handler_pool_size = size;
        self
    }
}

/// Everything a task handler sees for one invocation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub task_type: String,
    pub sender_agent_id: String,
    pub payload: Value,
    pub trace_context: HashMap<String, String>,
    /// Fires when the agent is stopping; in-flight I/O should abort.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Fetch a required string field from the payload.
    pub fn require_str(&self, field: &str) -> Result<&str, TaskError> {
        self.payload
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| TaskError::validation(format!("missing required field '{field}'")))
    }

    /// Fetch an optional string field from the payload.
    pub fn optional_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }
}

/// Everything an event handler sees for one delivery.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub event_id: Uuid,
    pub event_type: String,
    pub sender_agent_id: String,
    pub payload: Value,
    pub trace_context: HashMap<String, String>,
}

/// A task handler's result: a JSON result or a classified failure.
pub type TaskOutcome = Result<Value, TaskError>;

type TaskHandlerFn = Arc<dyn Fn(TaskContext) -> BoxFuture<'static, TaskOutcome> + Send + Sync>;
type EventHandlerFn = Arc<dyn Fn(EventContext) -> BoxFuture<'static, ()> + Send + Sync>;
type TimerFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct TimerSpec {
    name: String,
    interval: Duration,
    tick: TimerFn,
}

struct Lifecycle {
    cancel: CancellationToken,
    consumer: ConsumerHandle,
    tracker: TaskTracker,
}

struct AgentInner {
    config: AgentConfig,
    broker: Arc<dyn Broker>,
    task_handlers: RwLock<HashMap<String, TaskHandlerFn>>,
    event_handlers: RwLock<HashMap<String, Vec<EventHandlerFn>>>,
    timers: Mutex<Vec<TimerSpec>>,
    waiters: Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    running: AtomicBool,
    stopping: AtomicBool,
    inflight: AtomicUsize,
    lifecycle: Mutex<Option<Lifecycle>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Agent lifecycle surface the supervisor drives.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    fn agent_id(&self) -> &str;
    fn name(&self) -> &str;
    async fn start(&self) -> Result<(), AgentError>;
    async fn stop(&self) -> Result<(), AgentError>;
    fn is_running(&self) -> bool;
}

/// The runtime substrate each concrete agent is built on.
#[derive(Clone)]
pub struct BaseAgent {
    inner: Arc<AgentInner>,
}

impl BaseAgent {
    pub fn new(config: AgentConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                config,
                broker,
                task_handlers: RwLock::new(HashMap::new()),
                event_handlers: RwLock::new(HashMap::new()),
                timers: Mutex::new(Vec::new()),
                waiters: Mutex::new(HashMap::new()),
                breakers: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                inflight: AtomicUsize::new(0),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Register a task handler. Registration happens before `start`.
    pub fn register_task_handler<F, Fut>(&self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let handler: TaskHandlerFn = Arc::new(move |ctx| handler(ctx).boxed());
        self.inner
            .task_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_type.into(), handler);
    }

    /// Register an event handler. Multiple handlers per type run
    /// best-effort in registration order.
    pub fn register_event_handler<F, Fut>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandlerFn = Arc::new(move |ctx| handler(ctx).boxed());
        self.inner
            .event_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_type.into())
            .or_default()
            .push(handler);
    }

    /// Register a periodic background task, started by `start` and
    /// cancelled by `stop`.
    pub fn register_timer<F, Fut>(&self, name: impl Into<String>, interval: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tick: TimerFn = Arc::new(move || tick().boxed());
        lock(&self.inner.timers).push(TimerSpec {
            name: name.into(),
            interval,
            tick,
        });
    }

    pub fn registered_task_types(&self) -> Vec<String> {
        self.inner
            .task_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn registered_event_types(&self) -> Vec<String> {
        self.inner
            .event_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Send a task to `target`. With `wait`, blocks until the correlated
    /// response arrives or the timeout elapses; expiry yields a timeout
    /// error, never a retry.
    pub async fn send_task(
        &self,
        target: &str,
        task_type: &str,
        payload: Value,
        wait: Option<Duration>,
    ) -> Result<Option<Value>, AgentError> {
        if !self.is_running() {
            return Err(AgentError::NotRunning {
                agent_id: self.inner.config.agent_id.clone(),
            });
        }
        let message = Message::task(&self.inner.config.agent_id, target, task_type, payload)
            .with_trace(current_trace_context());

        let Some(wait) = wait else {
            self.inner
                .broker
                .publish(TASKS_EXCHANGE, target, &message)
                .await?;
            return Ok(None);
        };

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.waiters).insert(message.message_id, tx);

        if let Err(e) = self
            .inner
            .broker
            .publish(TASKS_EXCHANGE, target, &message)
            .await
        {
            lock(&self.inner.waiters).remove(&message.message_id);
            return Err(e.into());
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(response)) => match response.envelope {
                Envelope::Response {
                    status: ResponseStatus::Success,
                    result,
                    ..
                } => Ok(Some(result.unwrap_or(Value::Null))),
                Envelope::Response { error, .. } => Err(AgentError::Task(
                    error.unwrap_or_else(|| TaskError::internal("response carried no error")),
                )),
                _ => Err(AgentError::Task(TaskError::internal(
                    "correlated message was not a response",
                ))),
            },
            Ok(Err(_)) => Err(AgentError::Task(TaskError::internal(
                "response channel closed",
            ))),
            Err(_) => {
                lock(&self.inner.waiters).remove(&message.message_id);
                Err(AgentError::ResponseTimeout {
                    task_type: task_type.to_string(),
                    timeout_secs: wait.as_secs(),
                })
            }
        }
    }

    /// Send a task and wait the configured default response timeout.
    pub async fn call(
        &self,
        target: &str,
        task_type: &str,
        payload: Value,
    ) -> Result<Value, AgentError> {
        let timeout = self.inner.config.response_timeout;
        Ok(self
            .send_task(target, task_type, payload, Some(timeout))
            .await?
            .unwrap_or(Value::Null))
    }

    /// Publish an event to the fanout exchange. Never blocks for consumers.
    pub async fn broadcast_event(
        &self,
        event_type: &str,
        payload: Value,
    ) -> Result<(), AgentError> {
        if !self.is_running() {
            return Err(AgentError::NotRunning {
                agent_id: self.inner.config.agent_id.clone(),
            });
        }
        let message = Message::event(&self.inner.config.agent_id, event_type, payload)
            .with_trace(current_trace_context());
        self.inner
            .broker
            .publish(EVENTS_EXCHANGE, event_type, &message)
            .await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), AgentError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::AlreadyRunning {
                agent_id: self.inner.config.agent_id.clone(),
            });
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), AgentError> {
        let agent_id = self.inner.config.agent_id.clone();

        self.inner.broker.connect().await?;
        for exchange in [
            TASKS_EXCHANGE.to_string(),
            EVENTS_EXCHANGE.to_string(),
            format!("{TASKS_EXCHANGE}{DLQ_SUFFIX}"),
            format!("{EVENTS_EXCHANGE}{DLQ_SUFFIX}"),
        ] {
            self.inner
                .broker
                .declare_exchange(&exchange, ExchangeKind::Topic)
                .await?;
        }
        self.inner.broker.declare_queue(&agent_id).await?;
        self.inner
            .broker
            .bind_queue(&agent_id, TASKS_EXCHANGE, &agent_id)
            .await?;
        for event_type in self.registered_event_types() {
            self.inner
                .broker
                .bind_queue(&agent_id, EVENTS_EXCHANGE, &event_type)
                .await?;
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let dispatch_inner = self.inner.clone();
        let dispatch_cancel = cancel.clone();
        let callback: ConsumerCallback = Arc::new(move |message: Message| {
            let inner = dispatch_inner.clone();
            let cancel = dispatch_cancel.clone();
            async move { dispatch(inner, cancel, message).await }.boxed()
        });
        let consumer = self
            .inner
            .broker
            .consume(&agent_id, self.inner.config.handler_pool_size, callback)
            .await?;

        for spec in lock(&self.inner.timers).iter() {
            let tick = spec.tick.clone();
            let interval = spec.interval;
            let name = spec.name.clone();
            let timer_cancel = cancel.clone();
            let timer_agent = agent_id.clone();
            tracker.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The immediate first tick would race agent start-up.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = timer_cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            debug!(agent = %timer_agent, timer = %name, "timer tick");
                            tick().await;
                        }
                    }
                }
            });
        }

        *lock(&self.inner.lifecycle) = Some(Lifecycle {
            cancel,
            consumer,
            tracker,
        });
        info!(agent = %agent_id, name = %self.inner.config.name, "agent started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), AgentError> {
        let Some(lifecycle) = lock(&self.inner.lifecycle).take() else {
            return Ok(());
        };
        let agent_id = self.inner.config.agent_id.clone();
        self.inner.stopping.store(true, Ordering::SeqCst);

        // Stop intake, then signal timers and handler cancellation tokens.
        lifecycle.consumer.cancel();
        lifecycle.cancel.cancel();

        // Drain in-flight handlers up to the grace period.
        let deadline = tokio::time::Instant::now() + self.inner.config.drain_grace;
        while self.inner.inflight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let abandoned = self.inner.inflight.load(Ordering::SeqCst);
        if abandoned > 0 {
            warn!(agent = %agent_id, abandoned, "drain grace elapsed with handlers in flight");
        }

        lifecycle.tracker.close();
        let _ = tokio::time::timeout(Duration::from_secs(1), lifecycle.tracker.wait()).await;

        self.inner.running.store(false, Ordering::SeqCst);
        lock(&self.inner.waiters).clear();
        info!(agent = %agent_id, "agent stopped");
        Ok(())
    }

    /// Readiness, derived from the consume-loop lifecycle.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.inner.stopping.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Agent for BaseAgent {
    fn agent_id(&self) -> &str {
        &self.inner.config.agent_id
    }

    fn name(&self) -> &str {
        &self.inner.config.name
    }

    async fn start(&self) -> Result<(), AgentError> {
        BaseAgent::start(self).await
    }

    async fn stop(&self) -> Result<(), AgentError> {
        BaseAgent::stop(self).await
    }

    fn is_running(&self) -> bool {
        BaseAgent::is_running(self)
    }
}

/// Extract the ambient trace context for outbound injection.
fn current_trace_context() -> HashMap<String, String> {
    let mut carrier = HashMap::new();
    if let Some(id) = tracing::Span::current().id() {
        carrier.insert("span_id".to_string(), id.into_u64().to_string());
    }
    carrier
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch(inner: Arc<AgentInner>, cancel: CancellationToken, message: Message) -> Ack {
    // Stopping: let another replica pick the message up.
    if inner.stopping.load(Ordering::SeqCst) {
        return Ack::Nack;
    }
    let span = info_span!(
        "dispatch",
        agent = %inner.config.agent_id,
        message_id = %message.message_id,
        envelope = match &message.envelope {
            Envelope::Task { .. } => "task",
            Envelope::Event { .. } => "event",
            Envelope::Response { .. } => "response",
        },
    );

    async {
        match &message.envelope {
            Envelope::Response { response_to, .. } => {
                deliver_response(&inner, *response_to, message.clone());
                Ack::Ack
            }
            Envelope::Event {
                event_id,
                event_type,
            } => {
                let handlers = inner
                    .event_handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(event_type)
                    .cloned()
                    .unwrap_or_default();
                let ctx = EventContext {
                    event_id: *event_id,
                    event_type: event_type.clone(),
                    sender_agent_id: message.sender_agent_id.clone(),
                    payload: message.payload.clone(),
                    trace_context: message.trace_context.clone(),
                };
                // Events are best-effort and never produce a response; a
                // failing handler is not a poison pill.
                for handler in handlers {
                    let result = AssertUnwindSafe(handler(ctx.clone())).catch_unwind().await;
                    if result.is_err() {
                        warn!(event_type = %ctx.event_type, "event handler panicked");
                    }
                }
                Ack::Ack
            }
            Envelope::Task {
                task_id,
                task_type,
                ..
            } => {
                inner.inflight.fetch_add(1, Ordering::SeqCst);
                let ack =
                    handle_task(&inner, &cancel, &message, *task_id, task_type.clone()).await;
                inner.inflight.fetch_sub(1, Ordering::SeqCst);
                ack
            }
        }
    }
    .instrument(span)
    .await
}

fn deliver_response(inner: &AgentInner, response_to: Uuid, message: Message) {
    // At most one waiting caller per message id.
    let waiter = lock(&inner.waiters).remove(&response_to);
    match waiter {
        Some(tx) => {
            let _ = tx.send(message);
        }
        None => debug!(%response_to, "response arrived with no waiter (caller timed out)"),
    }
}

async fn handle_task(
    inner: &Arc<AgentInner>,
    cancel: &CancellationToken,
    message: &Message,
    task_id: Uuid,
    task_type: String,
) -> Ack {
    let handler = inner
        .task_handlers
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&task_type)
        .cloned();

    let Some(handler) = handler else {
        respond(inner, message, Err(TaskError::unhandled(&task_type))).await;
        return Ack::Ack;
    };

    // Fail fast while this handler's circuit is open.
    let permitted = lock(&inner.breakers)
        .entry(task_type.clone())
        .or_insert_with(|| CircuitBreaker::new(inner.config.breaker))
        .is_call_permitted();
    if !permitted {
        respond(inner, message, Err(TaskError::unavailable(&task_type))).await;
        return Ack::Ack;
    }

    let ctx = TaskContext {
        message_id: message.message_id,
        task_id,
        task_type: task_type.clone(),
        sender_agent_id: message.sender_agent_id.clone(),
        payload: message.payload.clone(),
        trace_context: message.trace_context.clone(),
        cancel: cancel.child_token(),
    };

    let span = info_span!("handler", task_type = %task_type);
    let outcome = match AssertUnwindSafe(handler(ctx)).catch_unwind().instrument(span).await {
        Ok(outcome) => outcome,
        Err(_) => Err(TaskError::internal(format!(
            "handler '{task_type}' panicked"
        ))),
    };

    {
        let mut breakers = lock(&inner.breakers);
        let breaker = breakers
            .entry(task_type.clone())
            .or_insert_with(|| CircuitBreaker::new(inner.config.breaker));
        match &outcome {
            Ok(_) => breaker.record_success(),
            Err(e) if e.kind.feeds_breaker() => breaker.record_failure(),
            Err(_) => {}
        }
    }

    if let Err(e) = &outcome {
        debug!(task_type = %task_type, kind = %e.kind, detail = %e.detail, "task failed");
    }
    respond(inner, message, outcome).await;
    Ack::Ack
}

async fn respond(inner: &AgentInner, request: &Message, outcome: TaskOutcome) {
    let response = Message::response(request, outcome);
    let routing_key = request.sender_agent_id.clone();
    if let Err(e) = inner
        .broker
        .publish(TASKS_EXCHANGE, &routing_key, &response)
        .await
    {
        warn!(
            message_id = %request.message_id,
            error = %e,
            "failed to publish response"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BackoffPolicy, MemoryBroker};
    use serde_json::json;

    async fn agent_pair() -> (BaseAgent, BaseAgent, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::with_backoff(BackoffPolicy::immediate(3)));
        let server = BaseAgent::new(
            AgentConfig::new("server", "Server Agent"),
            broker.clone() as Arc<dyn Broker>,
        );
        let client = BaseAgent::new(
            AgentConfig::new("client", "Client Agent"),
            broker.clone() as Arc<dyn Broker>,
        );
        (server, client, broker)
    }

    #[tokio::test]
    async fn test_task_dispatch_and_response() {
        let (server, client, _) = agent_pair().await;
        server.register_task_handler("echo", |ctx: TaskContext| async move {
            Ok(json!({"echo": ctx.payload}))
        });
        server.start().await.unwrap();
        client.start().await.unwrap();

        let result = client
            .send_task(
                "server",
                "echo",
                json!({"hello": "world"}),
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result["echo"]["hello"], "world");

        server.stop().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unhandled_task_type_responds_not_found() {
        let (server, client, _) = agent_pair().await;
        server.start().await.unwrap();
        client.start().await.unwrap();

        let result = client
            .send_task("server", "nope", json!({}), Some(Duration::from_secs(2)))
            .await;
        match result {
            Err(AgentError::Task(e)) => {
                assert_eq!(e.kind, crate::error::ErrorKind::NotFound);
                assert!(e.detail.contains("nope"));
            }
            other => panic!("expected unhandled error, got {other:?}"),
        }

        server.stop().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_surfaces_to_caller() {
        let (server, client, _) = agent_pair().await;
        server.register_task_handler("fail", |_ctx: TaskContext| async move {
            Err(TaskError::conflict("content is not approved"))
        });
        server.start().await.unwrap();
        client.start().await.unwrap();

        let result = client
            .send_task("server", "fail", json!({}), Some(Duration::from_secs(2)))
            .await;
        match result {
            Err(AgentError::Task(e)) => assert_eq!(e.kind, crate::error::ErrorKind::Conflict),
            other => panic!("expected conflict, got {other:?}"),
        }

        server.stop().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_circuit_breaker_fails_fast_after_threshold() {
        let (_, client, broker) = agent_pair().await;
        let invocations = Arc::new(AtomicUsize::new(0));
        let config = AgentConfig::new("server", "Server").with_breaker(CircuitBreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            open_for: Duration::from_secs(30),
        });
        let server = BaseAgent::new(config, broker as Arc<dyn Broker>);
        let counter = invocations.clone();
        server.register_task_handler("flaky", move |_ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::internal("boom"))
            }
        });
        server.start().await.unwrap();
        client.start().await.unwrap();

        // First three carry the underlying error.
        for _ in 0..3 {
            let err = client
                .send_task("server", "flaky", json!({}), Some(Duration::from_secs(2)))
                .await
                .unwrap_err();
            match err {
                AgentError::Task(e) => assert!(e.detail.contains("boom")),
                other => panic!("unexpected {other:?}"),
            }
        }
        // Fourth and fifth fail fast without invoking the handler.
        for _ in 0..2 {
            let err = client
                .send_task("server", "flaky", json!({}), Some(Duration::from_secs(2)))
                .await
                .unwrap_err();
            match err {
                AgentError::Task(e) => assert!(e.detail.contains("circuit open")),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 3);

        server.stop().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_response_timeout_is_an_error_not_a_retry() {
        let (server, client, _) = agent_pair().await;
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        server.register_task_handler("slow", move |_ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(json!({}))
            }
        });
        server.start().await.unwrap();
        client.start().await.unwrap();

        let result = client
            .send_task("server", "slow", json!({}), Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(AgentError::ResponseTimeout { .. })));

        // The late response must not trigger a second invocation.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        server.stop().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_broadcast_reaches_subscriber_without_response() {
        let (server, client, _) = agent_pair().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        server.register_event_handler("content.published", move |ctx: EventContext| {
            let counter = counter.clone();
            async move {
                assert_eq!(ctx.payload["id"], "c1");
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.start().await.unwrap();
        client.start().await.unwrap();

        client
            .broadcast_event("content.published", json!({"id": "c1"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        server.stop().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_fire_and_forget_returns_none() {
        let (server, client, _) = agent_pair().await;
        server.register_task_handler("log", |_ctx: TaskContext| async move { Ok(json!({})) });
        server.start().await.unwrap();
        client.start().await.unwrap();

        let result = client
            .send_task("server", "log", json!({}), None)
            .await
            .unwrap();
        assert!(result.is_none());

        server.stop().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stopped_agent_emits_nothing() {
        let (server, client, _) = agent_pair().await;
        server.start().await.unwrap();
        client.start().await.unwrap();
        client.stop().await.unwrap();

        assert!(!client.is_running());
        assert!(matches!(
            client.send_task("server", "x", json!({}), None).await,
            Err(AgentError::NotRunning { .. })
        ));
        assert!(matches!(
            client.broadcast_event("e", json!({})).await,
            Err(AgentError::NotRunning { .. })
        ));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_fires_until_stop() {
        let broker = Arc::new(MemoryBroker::with_backoff(BackoffPolicy::immediate(3)));
        let agent = BaseAgent::new(
            AgentConfig::new("timed", "Timed"),
            broker as Arc<dyn Broker>,
        );
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        agent.register_timer("tick", Duration::from_millis(20), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        agent.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        agent.stop().await.unwrap();

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least two ticks, saw {seen}");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen, "timer kept firing after stop");
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error() {
        let (server, client, _) = agent_pair().await;
        server.register_task_handler("explode", |_ctx: TaskContext| async move {
            panic!("kaboom");
            #[allow(unreachable_code)]
            Ok(json!({}))
        });
        server.start().await.unwrap();
        client.start().await.unwrap();

        let result = client
            .send_task("server", "explode", json!({}), Some(Duration::from_secs(2)))
            .await;
        match result {
            Err(AgentError::Task(e)) => {
                assert_eq!(e.kind, crate::error::ErrorKind::Internal);
                assert!(e.detail.contains("panicked"));
            }
            other => panic!("expected internal error, got {other:?}"),
        }

        server.stop().await.unwrap();
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_task_context_field_helpers() {
        let ctx = TaskContext {
            message_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            task_type: "t".into(),
            sender_agent_id: "s".into(),
            payload: json!({"brand_id": "b-1"}),
            trace_context: HashMap::new(),
            cancel: CancellationToken::new(),
        };
        assert_eq!(ctx.require_str("brand_id").unwrap(), "b-1");
        assert!(ctx.require_str("missing").is_err());
        assert_eq!(ctx.optional_str("brand_id"), Some("b-1"));
        assert_eq!(ctx.optional_str("missing"), None);
    }
}
