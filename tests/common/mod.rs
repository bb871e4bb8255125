//! In-memory fakes of the service boundaries

#![allow(dead_code)]

use async_trait::async_trait;
use chat_sync_consumer::core::error::DispatchError;
use chat_sync_consumer::core::traits::DeliveryHandler;
use chat_sync_consumer::infrastructure::broker::{BrokerError, Delivery};
use chat_sync_consumer::infrastructure::cache::CacheError;
use chat_sync_consumer::infrastructure::entities::{Chat, Customer, Message, Webhook};
use chat_sync_consumer::infrastructure::http::{OutboundError, OutboundRequest, WebhookEvent};
use chat_sync_consumer::infrastructure::repositories::RepositoryError;
use chat_sync_consumer::infrastructure::settings::QueueRole;
use chat_sync_consumer::infrastructure::traits::{
    Acknowledger, Broker, ChatCache, ChatRepository, OutboundHttp, Subscription,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn cache_down() -> CacheError {
    CacheError::Unavailable(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

#[derive(Default)]
struct CacheState {
    lists: HashMap<String, Vec<String>>,
    sets: HashMap<String, BTreeSet<String>>,
}

/// Chat cache with the semantics of the Redis-backed one.
#[derive(Clone, Default)]
pub struct MemoryCache {
    state: Arc<Mutex<CacheState>>,
    down: Arc<AtomicBool>,
}

impl MemoryCache {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.lists.get(key).cloned().unwrap_or_default()
    }

    pub fn members(&self, key: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn seed_list(&self, key: &str, values: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.lists.insert(
            key.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.lists.is_empty() && state.sets.is_empty()
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.down.load(Ordering::SeqCst) {
            Err(cache_down())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatCache for MemoryCache {
    async fn ping(&self) -> Result<(), CacheError> {
        self.check()
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        Ok(self.state.lock().unwrap().lists.contains_key(key))
    }

    async fn head(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state.lists.get(key).and_then(|list| list.first().cloned()))
    }

    async fn replace_head(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        match state.lists.get_mut(key).and_then(|list| list.first_mut()) {
            Some(head) => {
                *head = value.to_string();
                Ok(())
            }
            None => Err(CacheError::Command {
                command: "LSET",
                key: key.to_string(),
                source: redis::RedisError::from((redis::ErrorKind::ResponseError, "no such key")),
            }),
        }
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, CacheError> {
        self.check()?;
        Ok(self.list(key))
    }

    async fn create_indexed(
        &self,
        key: &str,
        value: &str,
        index: &str,
        member: &str,
    ) -> Result<bool, CacheError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let created = !state.lists.contains_key(key);
        if created {
            state.lists.insert(key.to_string(), vec![value.to_string()]);
        }
        state
            .sets
            .entry(index.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(created)
    }
}

/// Relational store recording every write.
#[derive(Clone, Default)]
pub struct RecordingRepository {
    pub chats: Arc<Mutex<Vec<Chat>>>,
    pub messages: Arc<Mutex<Vec<Message>>>,
    pub customers: Arc<Mutex<Vec<Customer>>>,
    pub webhooks: Arc<Mutex<Vec<Webhook>>>,
    down: Arc<AtomicBool>,
}

impl RecordingRepository {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn add_webhook(&self, webhook: Webhook) {
        self.webhooks.lock().unwrap().push(webhook);
    }

    pub fn writes(&self) -> usize {
        self.chats.lock().unwrap().len()
            + self.messages.lock().unwrap().len()
            + self.customers.lock().unwrap().len()
    }

    fn check(&self) -> Result<(), RepositoryError> {
        if self.down.load(Ordering::SeqCst) {
            Err(RepositoryError::Unavailable(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatRepository for RecordingRepository {
    async fn ping(&self) -> Result<(), RepositoryError> {
        self.check()
    }

    async fn upsert_chat(&self, chat: &Chat) -> Result<(), RepositoryError> {
        self.check()?;
        self.chats.lock().unwrap().push(chat.clone());
        Ok(())
    }

    async fn upsert_message(&self, message: &Message) -> Result<(), RepositoryError> {
        self.check()?;
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn upsert_customer(&self, customer: &Customer) -> Result<(), RepositoryError> {
        self.check()?;
        self.customers.lock().unwrap().push(customer.clone());
        Ok(())
    }

    async fn list_webhooks(&self) -> Result<Vec<Webhook>, RepositoryError> {
        self.check()?;
        Ok(self.webhooks.lock().unwrap().clone())
    }
}

/// Outbound HTTP recording every call instead of sending it.
#[derive(Clone, Default)]
pub struct RecordingOutbound {
    pub requests: Arc<Mutex<Vec<OutboundRequest>>>,
    pub webhooks: Arc<Mutex<Vec<(String, WebhookEvent)>>>,
}

#[async_trait]
impl OutboundHttp for RecordingOutbound {
    async fn send_request(&self, request: &OutboundRequest) -> Result<(), OutboundError> {
        if request.url.is_empty() {
            return Err(OutboundError::MissingUrl);
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn post_webhook(&self, url: &str, event: &WebhookEvent) -> Result<(), OutboundError> {
        self.webhooks
            .lock()
            .unwrap()
            .push((url.to_string(), event.clone()));
        Ok(())
    }
}

pub fn webhook(id: i32, conn: Option<&str>, is_global: bool, receive_message: bool) -> Webhook {
    Webhook {
        id,
        name: format!("hook-{id}"),
        url: format!("http://hooks.local/{id}"),
        is_global,
        conn: conn.map(str::to_string),
        send_message: false,
        receive_message,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack,
}

/// Settlements of every delivery, keyed by body, in settlement order.
pub type SettlementLog = Arc<Mutex<Vec<(String, Settlement)>>>;

struct FakeAcker {
    body: String,
    log: SettlementLog,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.log
            .lock()
            .unwrap()
            .push((self.body.clone(), Settlement::Ack));
        Ok(())
    }

    async fn nack(&self) -> Result<(), BrokerError> {
        self.log
            .lock()
            .unwrap()
            .push((self.body.clone(), Settlement::Nack));
        Ok(())
    }
}

/// Body a subscription panics on instead of returning it.
const PANICKING_DELIVERY: &str = "panic-in-stream";

/// Sender side of a subscription, tagged with the subscription it belongs to.
type Feed = (usize, mpsc::UnboundedSender<Result<Delivery, BrokerError>>);

/// Broker whose subscriptions are fed by the test.
#[derive(Clone, Default)]
pub struct FakeBroker {
    feeds: Arc<Mutex<HashMap<String, Feed>>>,
    pub settlements: SettlementLog,
    pub subscribes: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    failing_subscribes: Arc<AtomicUsize>,
}

impl FakeBroker {
    /// Makes the next `count` subscribe calls fail.
    pub fn fail_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    pub fn subscribed(&self, queue: &str) -> bool {
        self.feeds.lock().unwrap().contains_key(queue)
    }

    pub fn deliver(&self, queue: &str, body: &str) {
        let delivery = Delivery::new(
            body.as_bytes().to_vec(),
            Box::new(FakeAcker {
                body: body.to_string(),
                log: self.settlements.clone(),
            }),
        );
        let feeds = self.feeds.lock().unwrap();
        let (_, feed) = feeds.get(queue).expect("queue is not subscribed");
        feed.send(Ok(delivery)).expect("subscription is gone");
    }

    /// Ends the delivery stream of the current subscription to `queue`.
    pub fn end_stream(&self, queue: &str) {
        self.feeds.lock().unwrap().remove(queue);
    }

    /// Makes the current subscription to `queue` panic while pulling its next delivery.
    pub fn panic_stream(&self, queue: &str) {
        self.deliver(queue, PANICKING_DELIVERY);
    }

    pub fn fail_stream(&self, queue: &str) {
        let feeds = self.feeds.lock().unwrap();
        if let Some((_, feed)) = feeds.get(queue) {
            let _ = feed.send(Err(BrokerError::Closed(queue.to_string())));
        }
    }

    pub fn settlement_of(&self, body: &str) -> Option<Settlement> {
        self.settlements
            .lock()
            .unwrap()
            .iter()
            .find(|(settled, _)| settled == body)
            .map(|(_, settlement)| *settlement)
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let failing = self.failing_subscribes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_subscribes.store(failing - 1, Ordering::SeqCst);
            return Err(BrokerError::Closed(queue.to_string()));
        }

        let (feed, deliveries) = mpsc::unbounded_channel();
        let generation = self.subscribes.fetch_add(1, Ordering::SeqCst);
        self.feeds
            .lock()
            .unwrap()
            .insert(queue.to_string(), (generation, feed));
        Ok(Box::new(FakeSubscription {
            queue: queue.to_string(),
            generation,
            deliveries,
            feeds: self.feeds.clone(),
            closes: self.closes.clone(),
        }))
    }
}

struct FakeSubscription {
    queue: String,
    generation: usize,
    deliveries: mpsc::UnboundedReceiver<Result<Delivery, BrokerError>>,
    feeds: Arc<Mutex<HashMap<String, Feed>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscription for FakeSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let next = self.deliveries.recv().await;
        if let Some(Ok(delivery)) = &next {
            if delivery.body == PANICKING_DELIVERY.as_bytes() {
                panic!("subscription to {} exploded", self.queue);
            }
        }
        next
    }

    async fn close(self: Box<Self>) {
        let mut feeds = self.feeds.lock().unwrap();
        if feeds
            .get(&self.queue)
            .is_some_and(|(generation, _)| *generation == self.generation)
        {
            feeds.remove(&self.queue);
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Delivery handler driven by the body text: `ok`, `fail`, `panic`, or `slow:<millis>`.
#[derive(Clone, Default)]
pub struct ScriptedHandler {
    pub handled: Arc<Mutex<Vec<(String, QueueRole, String)>>>,
    pub in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
    pub started: Arc<AtomicUsize>,
    not_ready: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    /// Makes the next `count` readiness checks fail.
    pub fn fail_ready(&self, count: usize) {
        self.not_ready.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeliveryHandler for ScriptedHandler {
    async fn handle(&self, queue: &str, role: QueueRole, body: &[u8]) -> Result<(), DispatchError> {
        let body = String::from_utf8_lossy(body).to_string();
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(millis) = body.strip_prefix("slow:") {
            let millis = millis.parse().unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.handled
            .lock()
            .unwrap()
            .push((queue.to_string(), role, body.clone()));

        match body.as_str() {
            "fail" => Err(DispatchError::UnrecognizedOperation),
            "panic" => panic!("handler exploded"),
            _ => Ok(()),
        }
    }

    async fn ready(&self) -> Result<(), DispatchError> {
        let failing = self.not_ready.load(Ordering::SeqCst);
        if failing > 0 {
            self.not_ready.store(failing - 1, Ordering::SeqCst);
            return Err(DispatchError::CacheUnavailable(cache_down()));
        }
        Ok(())
    }
}
